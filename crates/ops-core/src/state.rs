use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use contracts::{LifecycleEvent, OperationEvent, OperationEventType, SCHEMA_VERSION_V1};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::flags::FlagStore;
use crate::ledger::CreditsLedger;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveOperation {
    pub current_step_index: usize,
    pub activated_at: DateTime<Utc>,
    pub activation_seq: u64,
    /// Set when a non-auto-advancing step matched and awaits confirmation.
    #[serde(default)]
    pub step_satisfied: bool,
    /// Set once a payout for this activation has been refused.
    #[serde(default)]
    pub reward_rejected: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSession {
    pub opened: bool,
    pub connected_host_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub sequence: u64,
    pub operation_id: String,
    pub event: LifecycleEvent,
    pub at: DateTime<Utc>,
}

/// Everything the engine knows about one player's progression.
///
/// Only the trigger evaluator adds active operations and only the reward
/// applier moves them to completed; both go through the crate-private
/// mutators below.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerProgressState {
    player_id: String,
    flags: FlagStore,
    ledger: CreditsLedger,
    completed_operation_ids: BTreeSet<String>,
    active_operations: BTreeMap<String, ActiveOperation>,
    #[serde(default)]
    session: TerminalSession,
    /// Per host, deleted path to the last activation sequence seen when it
    /// was deleted. Overlays activated later are layered above the deletion.
    #[serde(default)]
    deleted_paths: BTreeMap<String, BTreeMap<String, u64>>,
    #[serde(default)]
    journal: Vec<JournalRecord>,
    #[serde(default)]
    next_activation_seq: u64,
    #[serde(default)]
    next_event_seq: u64,
    #[serde(skip)]
    outbox: Vec<OperationEvent>,
}

impl PlayerProgressState {
    pub fn new(player_id: impl Into<String>, ledger: CreditsLedger) -> Self {
        Self {
            player_id: player_id.into(),
            flags: FlagStore::new(),
            ledger,
            completed_operation_ids: BTreeSet::new(),
            active_operations: BTreeMap::new(),
            session: TerminalSession::default(),
            deleted_paths: BTreeMap::new(),
            journal: Vec::new(),
            next_activation_seq: 0,
            next_event_seq: 0,
            outbox: Vec::new(),
        }
    }

    pub fn player_id(&self) -> &str {
        &self.player_id
    }

    pub fn flags(&self) -> &FlagStore {
        &self.flags
    }

    pub fn ledger(&self) -> &CreditsLedger {
        &self.ledger
    }

    pub fn credits(&self) -> i64 {
        self.ledger.balance()
    }

    pub fn completed_operation_ids(&self) -> &BTreeSet<String> {
        &self.completed_operation_ids
    }

    pub fn is_completed(&self, operation_id: &str) -> bool {
        self.completed_operation_ids.contains(operation_id)
    }

    pub fn is_active(&self, operation_id: &str) -> bool {
        self.active_operations.contains_key(operation_id)
    }

    pub fn active_operation(&self, operation_id: &str) -> Option<&ActiveOperation> {
        self.active_operations.get(operation_id)
    }

    /// Active operations ordered by activation, oldest first.
    pub fn active_in_activation_order(&self) -> Vec<(&String, &ActiveOperation)> {
        let mut active = self.active_operations.iter().collect::<Vec<_>>();
        active.sort_by_key(|(_, entry)| entry.activation_seq);
        active
    }

    pub fn session(&self) -> &TerminalSession {
        &self.session
    }

    pub fn deleted_paths(&self, host_id: &str) -> Option<&BTreeMap<String, u64>> {
        self.deleted_paths.get(host_id)
    }

    pub fn journal(&self) -> &[JournalRecord] {
        &self.journal
    }

    /// No operation may be active and completed at once.
    pub fn is_consistent(&self) -> bool {
        self.active_operations
            .keys()
            .all(|id| !self.completed_operation_ids.contains(id))
            && self.ledger.balance() >= 0
    }

    /// Hands pending audit events to the caller.
    pub fn drain_events(&mut self) -> Vec<OperationEvent> {
        std::mem::take(&mut self.outbox)
    }

    /// Applies the configured retention to a record loaded from storage.
    pub fn set_ledger_retention(&mut self, retention: usize) {
        self.ledger.set_retention(retention);
    }

    pub(crate) fn flags_mut(&mut self) -> &mut FlagStore {
        &mut self.flags
    }

    pub(crate) fn ledger_mut(&mut self) -> &mut CreditsLedger {
        &mut self.ledger
    }

    pub(crate) fn activate(&mut self, operation_id: &str, at: DateTime<Utc>) -> bool {
        if self.is_active(operation_id) || self.is_completed(operation_id) {
            return false;
        }
        self.next_activation_seq += 1;
        self.active_operations.insert(
            operation_id.to_string(),
            ActiveOperation {
                current_step_index: 0,
                activated_at: at,
                activation_seq: self.next_activation_seq,
                step_satisfied: false,
                reward_rejected: false,
            },
        );
        self.record_lifecycle(operation_id, LifecycleEvent::Activated, at);
        true
    }

    pub(crate) fn active_operation_mut(&mut self, operation_id: &str) -> Option<&mut ActiveOperation> {
        self.active_operations.get_mut(operation_id)
    }

    pub(crate) fn mark_completed(&mut self, operation_id: &str) {
        self.active_operations.remove(operation_id);
        self.completed_operation_ids.insert(operation_id.to_string());
    }

    pub(crate) fn session_mut(&mut self) -> &mut TerminalSession {
        &mut self.session
    }

    pub(crate) fn record_deletion(&mut self, host_id: &str, path: String) {
        let mark = self.next_activation_seq;
        self.deleted_paths
            .entry(host_id.to_string())
            .or_default()
            .insert(path, mark);
    }

    /// Flags a refused payout on the active operation. Returns true only for
    /// the first refusal of this activation.
    pub(crate) fn note_reward_rejected(&mut self, operation_id: &str) -> bool {
        match self.active_operations.get_mut(operation_id) {
            Some(active) if !active.reward_rejected => {
                active.reward_rejected = true;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn record_lifecycle(
        &mut self,
        operation_id: &str,
        event: LifecycleEvent,
        at: DateTime<Utc>,
    ) {
        let sequence = self.journal.len() as u64 + 1;
        self.journal.push(JournalRecord {
            sequence,
            operation_id: operation_id.to_string(),
            event,
            at,
        });
    }

    pub(crate) fn push_event(
        &mut self,
        event_type: OperationEventType,
        operation_id: Option<&str>,
        step_id: Option<&str>,
        details: Option<Value>,
        at: DateTime<Utc>,
    ) {
        self.next_event_seq += 1;
        self.outbox.push(OperationEvent {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            player_id: self.player_id.clone(),
            sequence: self.next_event_seq,
            created_at: at,
            event_type,
            operation_id: operation_id.map(str::to_string),
            step_id: step_id.map(str::to_string),
            details,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().expect("valid timestamp")
    }

    #[test]
    fn activation_is_refused_once_completed() {
        let mut state = PlayerProgressState::new("p1", CreditsLedger::new(10));
        assert!(state.activate("SR-201", at()));
        assert!(!state.activate("SR-201", at()));
        state.mark_completed("SR-201");
        assert!(!state.activate("SR-201", at()));
        assert!(state.is_consistent());
        assert_eq!(state.journal().len(), 1);
    }

    #[test]
    fn activation_order_follows_sequence() {
        let mut state = PlayerProgressState::new("p1", CreditsLedger::new(10));
        state.activate("zeta", at());
        state.activate("alpha", at());
        let order = state
            .active_in_activation_order()
            .into_iter()
            .map(|(id, _)| id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(order, vec!["zeta", "alpha"]);
    }

    #[test]
    fn outbox_is_not_persisted() {
        let mut state = PlayerProgressState::new("p1", CreditsLedger::new(10));
        state.push_event(OperationEventType::SessionOpened, None, None, None, at());
        let encoded = serde_json::to_string(&state).expect("serialize");
        let mut decoded: PlayerProgressState = serde_json::from_str(&encoded).expect("deserialize");
        assert!(decoded.drain_events().is_empty());
        assert_eq!(state.drain_events().len(), 1);
    }

    #[test]
    fn deletions_remember_the_activation_they_followed() {
        let mut state = PlayerProgressState::new("p1", CreditsLedger::new(10));
        state.activate("first", at());
        state.record_deletion("relay", "/etc/motd".to_string());
        state.activate("second", at());
        state.record_deletion("relay", "/tmp/x".to_string());

        let deleted = state.deleted_paths("relay").expect("tombstones");
        assert_eq!(deleted.get("/etc/motd"), Some(&1));
        assert_eq!(deleted.get("/tmp/x"), Some(&2));
    }

    #[test]
    fn reward_refusal_is_noted_once_per_activation() {
        let mut state = PlayerProgressState::new("p1", CreditsLedger::new(10));
        state.activate("SR-201", at());
        assert!(state.note_reward_rejected("SR-201"));
        assert!(!state.note_reward_rejected("SR-201"));
        assert!(!state.note_reward_rejected("ghost"));
    }

    #[test]
    fn loaded_ledger_takes_the_configured_retention() {
        let mut state = PlayerProgressState::new("p1", CreditsLedger::new(10));
        for _ in 0..5 {
            state.ledger_mut().post(10, "tick", at()).expect("credit");
        }
        let encoded = serde_json::to_string(&state).expect("serialize");
        let mut loaded: PlayerProgressState = serde_json::from_str(&encoded).expect("deserialize");
        assert_eq!(loaded.ledger().retained_len(), 5);

        loaded.set_ledger_retention(2);
        assert_eq!(loaded.ledger().retained_len(), 2);
        assert_eq!(loaded.credits(), 50);
    }
}
