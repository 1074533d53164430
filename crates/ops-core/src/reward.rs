use chrono::{DateTime, Utc};
use contracts::{FlagValue, LedgerEntry, LifecycleEvent, Operation, OperationEventType};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::ledger::LedgerError;
use crate::state::PlayerProgressState;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RewardError {
    #[error("operation `{0}` is not active")]
    NotActive(String),
    #[error("credit transaction rejected: {0}")]
    Ledger(#[from] LedgerError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RewardReceipt {
    pub operation_id: String,
    pub flags_written: Vec<String>,
    pub credits_transaction: Option<LedgerEntry>,
    pub completion_flag_set: bool,
    pub already_completed: bool,
}

impl RewardReceipt {
    fn already_completed(operation_id: &str) -> Self {
        Self {
            operation_id: operation_id.to_string(),
            flags_written: Vec::new(),
            credits_transaction: None,
            completion_flag_set: false,
            already_completed: true,
        }
    }

    pub fn credits_granted(&self) -> i64 {
        self.credits_transaction
            .as_ref()
            .map_or(0, |entry| entry.amount)
    }
}

/// Applies an Operation's rewards exactly once.
///
/// The ledger check is the only fallible step and runs before any write, so
/// a rejection leaves flags, credits, and the active set untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct RewardApplier;

impl RewardApplier {
    pub fn apply(
        &self,
        state: &mut PlayerProgressState,
        operation: &Operation,
        at: DateTime<Utc>,
    ) -> Result<RewardReceipt, RewardError> {
        if state.is_completed(&operation.id) {
            return Ok(RewardReceipt::already_completed(&operation.id));
        }
        if !state.is_active(&operation.id) {
            return Err(RewardError::NotActive(operation.id.clone()));
        }

        let credits = operation.rewards.credits;
        if credits != 0 {
            if let Err(err) = state.ledger().check(credits) {
                self.reject(state, operation, &err, at);
                return Err(err.into());
            }
        }

        let credits_transaction = if credits != 0 {
            let reason = format!("reward:{}", operation.id);
            Some(state.ledger_mut().post(credits, &reason, at)?)
        } else {
            None
        };

        let mut flags_written = Vec::with_capacity(operation.rewards.flags.len() + 1);
        for (key, value) in &operation.rewards.flags {
            state.flags_mut().set(key, value.clone());
            flags_written.push(key.clone());
        }
        let completion_flag = &operation.rewards.completion_flag;
        state.flags_mut().set(completion_flag, FlagValue::Bool(true));
        flags_written.push(completion_flag.clone());

        state.mark_completed(&operation.id);
        state.record_lifecycle(&operation.id, LifecycleEvent::Completed, at);
        state.push_event(
            OperationEventType::OperationCompleted,
            Some(&operation.id),
            None,
            Some(json!({
                "credits": credits,
                "flags_written": flags_written,
            })),
            at,
        );
        info!(
            player_id = %state.player_id(),
            operation_id = %operation.id,
            credits,
            balance = state.credits(),
            "operation completed"
        );

        Ok(RewardReceipt {
            operation_id: operation.id.clone(),
            flags_written,
            credits_transaction,
            completion_flag_set: true,
            already_completed: false,
        })
    }

    fn reject(
        &self,
        state: &mut PlayerProgressState,
        operation: &Operation,
        err: &LedgerError,
        at: DateTime<Utc>,
    ) {
        warn!(
            player_id = %state.player_id(),
            operation_id = %operation.id,
            error = %err,
            "reward rejected"
        );
        if state.note_reward_rejected(&operation.id) {
            state.record_lifecycle(&operation.id, LifecycleEvent::Failed, at);
        }
        state.push_event(
            OperationEventType::RewardRejected,
            Some(&operation.id),
            None,
            Some(json!({ "reason": err.to_string() })),
            at,
        );
    }
}
