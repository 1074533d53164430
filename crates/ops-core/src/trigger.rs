use chrono::{DateTime, Utc};
use contracts::{EngineConfig, Operation, OperationEventType, OperationTrigger};
use serde_json::json;
use tracing::info;

use crate::registry::OperationRegistry;
use crate::state::PlayerProgressState;

/// Decides which dormant Operations become Active for a player.
///
/// Evaluation reads the current state and writes only the activation itself;
/// rewards are never applied from here.
#[derive(Debug, Clone, Copy)]
pub struct TriggerEvaluator<'a> {
    registry: &'a OperationRegistry,
    config: &'a EngineConfig,
}

impl<'a> TriggerEvaluator<'a> {
    pub fn new(registry: &'a OperationRegistry, config: &'a EngineConfig) -> Self {
        Self { registry, config }
    }

    /// Activates every eligible Operation in registry declared order and
    /// returns their ids.
    pub fn evaluate(&self, state: &mut PlayerProgressState, at: DateTime<Utc>) -> Vec<String> {
        let eligible = self
            .registry
            .iter()
            .filter(|operation| self.is_eligible(state, operation))
            .map(|operation| operation.id.clone())
            .collect::<Vec<_>>();

        let mut activated = Vec::with_capacity(eligible.len());
        for operation_id in eligible {
            if !state.activate(&operation_id, at) {
                continue;
            }
            let trigger = self
                .registry
                .get(&operation_id)
                .map(|operation| operation.trigger.as_str());
            state.push_event(
                OperationEventType::OperationActivated,
                Some(&operation_id),
                None,
                Some(json!({ "trigger": trigger })),
                at,
            );
            info!(
                player_id = %state.player_id(),
                operation_id = %operation_id,
                "operation activated"
            );
            activated.push(operation_id);
        }
        activated
    }

    pub fn is_eligible(&self, state: &PlayerProgressState, operation: &Operation) -> bool {
        if !operation.is_published()
            || state.is_completed(&operation.id)
            || state.is_active(&operation.id)
            || state.flags().is_set(&operation.rewards.completion_flag)
        {
            return false;
        }
        self.requirements_met(state, operation) && self.trigger_satisfied(state, operation)
    }

    fn requirements_met(&self, state: &PlayerProgressState, operation: &Operation) -> bool {
        let requirements = &operation.requirements;
        requirements
            .flags
            .iter()
            .all(|(key, value)| state.flags().matches(key, Some(value)))
            && requirements
                .operations
                .iter()
                .all(|id| state.is_completed(id))
    }

    fn trigger_satisfied(&self, state: &PlayerProgressState, operation: &Operation) -> bool {
        match &operation.trigger {
            OperationTrigger::OnFirstSessionOpen => {
                state.flags().is_set(&self.config.session_flag_key)
            }
            OperationTrigger::OnOperationsCompleted { operation_ids } => {
                !operation_ids.is_empty() && operation_ids.iter().all(|id| state.is_completed(id))
            }
            OperationTrigger::OnFlagSet {
                flag_key,
                flag_value,
            } => state.flags().matches(flag_key, flag_value.as_ref()),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::TimeZone;
    use contracts::{FlagValue, OperationStatus, Requirements, Rewards};

    use super::*;
    use crate::ledger::CreditsLedger;

    fn at() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).single().expect("valid timestamp")
    }

    fn operation(id: &str, trigger: OperationTrigger) -> Operation {
        Operation {
            id: id.to_string(),
            version: 1,
            title: id.to_string(),
            status: OperationStatus::Published,
            trigger,
            requirements: Requirements::default(),
            steps: Vec::new(),
            rewards: Rewards {
                credits: 0,
                flags: BTreeMap::new(),
                completion_flag: format!("{id}_done"),
            },
            default_host_id: None,
            filesystem_overlays: BTreeMap::new(),
            narrative: Default::default(),
        }
    }

    fn registry(operations: Vec<Operation>) -> OperationRegistry {
        let mut registry = OperationRegistry::new();
        registry.publish(operations).expect("valid registry");
        registry
    }

    fn player() -> PlayerProgressState {
        PlayerProgressState::new("p1", CreditsLedger::new(10))
    }

    #[test]
    fn session_trigger_waits_for_session_flag() {
        let config = EngineConfig::default();
        let registry = registry(vec![operation("SR-201", OperationTrigger::OnFirstSessionOpen)]);
        let evaluator = TriggerEvaluator::new(&registry, &config);
        let mut state = player();

        assert!(evaluator.evaluate(&mut state, at()).is_empty());
        state.flags_mut().set(&config.session_flag_key, FlagValue::Bool(true));
        assert_eq!(evaluator.evaluate(&mut state, at()), vec!["SR-201".to_string()]);
        assert!(evaluator.evaluate(&mut state, at()).is_empty());
        assert_eq!(state.active_operation("SR-201").map(|a| a.current_step_index), Some(0));
    }

    #[test]
    fn drafts_never_activate() {
        let config = EngineConfig::default();
        let mut draft = operation("draft", OperationTrigger::OnFirstSessionOpen);
        draft.status = OperationStatus::Draft;
        let registry = registry(vec![draft]);
        let mut state = player();
        state.flags_mut().set(&config.session_flag_key, FlagValue::Bool(true));
        assert!(TriggerEvaluator::new(&registry, &config)
            .evaluate(&mut state, at())
            .is_empty());
    }

    #[test]
    fn completion_flag_blocks_activation() {
        let config = EngineConfig::default();
        let registry = registry(vec![operation(
            "side",
            OperationTrigger::OnFlagSet {
                flag_key: "door".to_string(),
                flag_value: Some(FlagValue::from("open")),
            },
        )]);
        let evaluator = TriggerEvaluator::new(&registry, &config);
        let mut state = player();

        state.flags_mut().set("door", FlagValue::from("closed"));
        assert!(evaluator.evaluate(&mut state, at()).is_empty());

        state.flags_mut().set("door", FlagValue::from("open"));
        state.flags_mut().set("side_done", FlagValue::Bool(true));
        assert!(evaluator.evaluate(&mut state, at()).is_empty());
    }

    #[test]
    fn same_pass_activations_follow_declared_order() {
        let config = EngineConfig::default();
        let mut gated = operation("zeta", OperationTrigger::OnFirstSessionOpen);
        gated.requirements.flags.insert("tier".to_string(), FlagValue::from("2"));
        let registry = registry(vec![
            gated,
            operation("alpha", OperationTrigger::OnFirstSessionOpen),
        ]);
        let evaluator = TriggerEvaluator::new(&registry, &config);
        let mut state = player();
        state.flags_mut().set(&config.session_flag_key, FlagValue::Bool(true));
        assert_eq!(evaluator.evaluate(&mut state, at()), vec!["alpha".to_string()]);

        state.flags_mut().set("tier", FlagValue::from("2"));
        assert_eq!(evaluator.evaluate(&mut state, at()), vec!["zeta".to_string()]);
        let events = state.drain_events();
        assert_eq!(events.len(), 2);
        assert!(events
            .iter()
            .all(|event| event.event_type == OperationEventType::OperationActivated));
    }
}
