//! Step matching and pointer advancement.
//!
//! The engine first applies an action's session effects (connecting,
//! deleting) and records what actually happened as an [`ObservedAction`].
//! Steps are matched against that observation, so facts such as "the file
//! existed before the delete" are fixed before any step looks at them.

use chrono::{DateTime, Utc};
use contracts::{
    EngineConfig, Operation, OperationEventType, OperationStep, StepDisposition, StepKind,
    StepOutcome,
};
use serde_json::json;
use tracing::debug;

use crate::filesystem::{normalize_path, HostCatalog};
use crate::registry::OperationRegistry;
use crate::state::PlayerProgressState;

/// What a player action did, after session effects were applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObservedAction {
    Scanned { ip: String },
    Connected { ip: String, host_id: String },
    /// `path` is normalized and was present in the composed view just before
    /// the deletion.
    Deleted { host_id: String, path: String },
    Disconnected { host_id: String },
    Acknowledged { token: String },
}

/// Where an advanced step left its Operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    Next(usize),
    Final,
}

/// Steps matched by one action, plus the Operations whose final step was
/// among them and now need their rewards applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepPass {
    pub outcomes: Vec<StepOutcome>,
    pub finished: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy)]
pub struct StepValidator<'a> {
    registry: &'a OperationRegistry,
    catalog: &'a HostCatalog,
    config: &'a EngineConfig,
}

impl<'a> StepValidator<'a> {
    pub fn new(
        registry: &'a OperationRegistry,
        catalog: &'a HostCatalog,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            registry,
            catalog,
            config,
        }
    }

    pub fn matches(&self, operation: &Operation, step: &OperationStep, observed: &ObservedAction) -> bool {
        let host = operation.resolve_host(step);
        match (&step.kind, observed) {
            (StepKind::ScanHost { target_ip }, ObservedAction::Scanned { ip })
            | (StepKind::ConnectHost { target_ip }, ObservedAction::Connected { ip, .. }) => {
                ip.trim() == target_ip.trim() && self.host_has_ip(host, target_ip)
            }
            (StepKind::DeleteFile { file_path }, ObservedAction::Deleted { host_id, path }) => {
                host == Some(host_id.as_str())
                    && normalize_path(file_path).as_deref() == Some(path.as_str())
            }
            (StepKind::DisconnectHost, ObservedAction::Disconnected { host_id }) => {
                host.map_or(true, |expected| expected == host_id)
            }
            (StepKind::AcknowledgeCommand { token: expected }, ObservedAction::Acknowledged { token }) => {
                match expected {
                    Some(expected) => expected.trim().eq_ignore_ascii_case(token.trim()),
                    None => self.config.is_ack_token(token),
                }
            }
            _ => false,
        }
    }

    /// A host the catalog knows must carry the step's IP; unknown hosts are
    /// matched on the IP alone.
    fn host_has_ip(&self, host: Option<&str>, target_ip: &str) -> bool {
        match host.and_then(|host_id| self.catalog.host(host_id)) {
            Some(record) => record.ip.trim() == target_ip.trim(),
            None => true,
        }
    }

    /// Checks `observed` against the current step of every Active Operation,
    /// oldest activation first.
    pub fn validate(
        &self,
        state: &mut PlayerProgressState,
        observed: &ObservedAction,
        at: DateTime<Utc>,
    ) -> StepPass {
        let candidates = state
            .active_in_activation_order()
            .into_iter()
            .filter(|(_, active)| !active.step_satisfied)
            .map(|(id, active)| (id.clone(), active.current_step_index))
            .collect::<Vec<_>>();

        let mut pass = StepPass::default();
        for (operation_id, step_index) in candidates {
            let Some(operation) = self.registry.get(&operation_id) else {
                continue;
            };
            let Some(step) = operation.step(step_index) else {
                continue;
            };
            if !self.matches(operation, step, observed) {
                continue;
            }

            debug!(
                player_id = %state.player_id(),
                operation_id = %operation_id,
                step_id = %step.id,
                "step satisfied"
            );
            state.push_event(
                OperationEventType::StepSatisfied,
                Some(&operation_id),
                Some(&step.id),
                None,
                at,
            );

            if !step.auto_advance {
                if let Some(active) = state.active_operation_mut(&operation_id) {
                    active.step_satisfied = true;
                }
                pass.outcomes.push(StepOutcome {
                    operation_id,
                    step_id: step.id.clone(),
                    disposition: StepDisposition::AwaitingConfirmation,
                });
                continue;
            }

            match advance(state, operation, at) {
                Some(Advance::Next(next_step_index)) => pass.outcomes.push(StepOutcome {
                    operation_id,
                    step_id: step.id.clone(),
                    disposition: StepDisposition::Advanced { next_step_index },
                }),
                Some(Advance::Final) => pass.finished.push((operation_id, step.id.clone())),
                None => {}
            }
        }
        pass
    }
}

/// Moves an Active Operation past its current step. The final step is left
/// in place; the caller hands the Operation to the reward applier, and a
/// rejected reward can be retried by matching the step again.
pub fn advance(
    state: &mut PlayerProgressState,
    operation: &Operation,
    at: DateTime<Utc>,
) -> Option<Advance> {
    let active = state.active_operation_mut(&operation.id)?;
    let next = active.current_step_index + 1;
    if next >= operation.steps.len() {
        return Some(Advance::Final);
    }
    let from = active.current_step_index;
    active.current_step_index = next;
    active.step_satisfied = false;

    let step_id = operation.step(from).map(|step| step.id.as_str());
    state.push_event(
        OperationEventType::StepAdvanced,
        Some(&operation.id),
        step_id,
        Some(json!({ "next_step_index": next })),
        at,
    );
    Some(Advance::Next(next))
}
