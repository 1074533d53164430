//! The per-player pipeline: session effects, step validation, rewards, and
//! the bounded trigger cascade that follows every state change.
//!
//! The engine is synchronous and does no I/O. Callers serialize access to a
//! player's state and persist it afterwards.

use std::collections::{BTreeSet, VecDeque};

use chrono::{DateTime, Utc};
use contracts::{
    ActionRejection, ActiveOperationView, DefinitionIssue, EngineConfig, FilesystemNode,
    FlagValue, HostRecord, InboxMessage, LifecycleEvent, NodeKind, Operation,
    OperationEventType, PlayerAction, ProgressView, PublishReport, RejectionCode,
    StepDisposition, StepKind, StepOutcome, ValidationResult,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::filesystem::{normalize_path, CatalogError, ComposedView, HostCatalog};
use crate::ledger::CreditsLedger;
use crate::narrative;
use crate::registry::{OperationRegistry, RegistryError};
use crate::reward::{RewardApplier, RewardError};
use crate::state::PlayerProgressState;
use crate::step::{advance, Advance, ObservedAction, StepValidator};
use crate::trigger::TriggerEvaluator;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EngineError {
    #[error("unknown operation `{0}`")]
    UnknownOperation(String),
    #[error("operation `{0}` is not active")]
    NotActive(String),
    #[error("step `{step_id}` of operation `{operation_id}` has not been satisfied")]
    StepNotSatisfied {
        operation_id: String,
        step_id: String,
    },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Catalog(#[from] CatalogError),
    #[error(transparent)]
    Reward(#[from] RewardError),
}

/// Activations and completions produced by one cascade.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeReport {
    pub activated: Vec<String>,
    pub completed: Vec<String>,
    pub depth_exceeded: bool,
}

#[derive(Debug)]
pub struct OperationEngine {
    config: EngineConfig,
    registry: OperationRegistry,
    catalog: HostCatalog,
    clock: Box<dyn Clock>,
}

impl OperationEngine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_clock(config, SystemClock)
    }

    pub fn with_clock(config: EngineConfig, clock: impl Clock + 'static) -> Self {
        Self {
            config,
            registry: OperationRegistry::new(),
            catalog: HostCatalog::new(),
            clock: Box::new(clock),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &HostCatalog {
        &self.catalog
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Publishes definitions and reports hosts the catalog does not know.
    pub fn publish(&mut self, operations: Vec<Operation>) -> Result<PublishReport, RegistryError> {
        let mut report = self.registry.publish(operations)?;
        for operation_id in &report.published {
            let Some(operation) = self.registry.get(operation_id) else {
                continue;
            };
            let hosts = operation
                .default_host_id
                .iter()
                .chain(operation.steps.iter().filter_map(|step| step.target_host_id.as_ref()))
                .chain(operation.filesystem_overlays.keys())
                .collect::<BTreeSet<_>>();
            for host_id in hosts {
                if !self.catalog.contains(host_id) {
                    report.warnings.push(DefinitionIssue::new(
                        operation_id,
                        format!("host `{host_id}` is not in the host catalog"),
                    ));
                }
            }
        }
        Ok(report)
    }

    pub fn register_hosts(&mut self, hosts: Vec<HostRecord>) -> Result<usize, CatalogError> {
        let count = hosts.len();
        for host in hosts {
            self.catalog.register(host)?;
        }
        info!(registered = count, total = self.catalog.len(), "hosts registered");
        Ok(count)
    }

    pub fn new_player(&self, player_id: &str) -> PlayerProgressState {
        let mut ledger = CreditsLedger::new(self.config.ledger_retention);
        if self.config.starting_credits > 0 {
            if let Err(err) = ledger.post(self.config.starting_credits, "opening_balance", self.now()) {
                warn!(player_id, error = %err, "opening balance not posted");
            }
        }
        PlayerProgressState::new(player_id, ledger)
    }

    /// Marks the terminal session open. The session flag is only ever set
    /// once, so `OnFirstSessionOpen` triggers fire on the first call alone.
    pub fn open_session(&self, state: &mut PlayerProgressState) -> CascadeReport {
        let at = self.now();
        if !state.session().opened {
            state.session_mut().opened = true;
            state.push_event(OperationEventType::SessionOpened, None, None, None, at);
        }
        state
            .flags_mut()
            .set_once(&self.config.session_flag_key, FlagValue::Bool(true));
        self.run_cascade(state, at)
    }

    /// Writes a flag from outside the pipeline and re-evaluates triggers.
    pub fn set_flag(
        &self,
        state: &mut PlayerProgressState,
        key: &str,
        value: FlagValue,
    ) -> CascadeReport {
        let at = self.now();
        if !state.flags_mut().set(key, value) {
            return CascadeReport::default();
        }
        self.run_cascade(state, at)
    }

    pub fn evaluate_triggers(&self, state: &mut PlayerProgressState) -> CascadeReport {
        let at = self.now();
        self.run_cascade(state, at)
    }

    pub fn submit_action(
        &self,
        state: &mut PlayerProgressState,
        action: &PlayerAction,
    ) -> ValidationResult {
        let at = self.now();
        let observed = match self.observe(state, action, at) {
            Ok(observed) => observed,
            Err(rejection) => {
                debug!(
                    player_id = %state.player_id(),
                    action = %action,
                    message = %rejection.message,
                    "action rejected"
                );
                state.push_event(
                    OperationEventType::ActionRejected,
                    None,
                    None,
                    Some(json!({ "action": action.to_string(), "code": rejection.code })),
                    at,
                );
                return ValidationResult::rejected(rejection);
            }
        };

        let validator = StepValidator::new(&self.registry, &self.catalog, &self.config);
        let pass = validator.validate(state, &observed, at);

        let mut result = ValidationResult {
            outcomes: pass.outcomes,
            ..ValidationResult::default()
        };
        for (operation_id, step_id) in pass.finished {
            self.finish(state, &operation_id, step_id, at, &mut result);
        }
        self.cascade_into(state, at, &mut result);
        summarize(&mut result);
        result
    }

    /// Advances a step that matched but does not auto-advance.
    pub fn confirm_step(
        &self,
        state: &mut PlayerProgressState,
        operation_id: &str,
    ) -> Result<ValidationResult, EngineError> {
        let at = self.now();
        let operation = self
            .registry
            .get(operation_id)
            .ok_or_else(|| EngineError::UnknownOperation(operation_id.to_string()))?;
        let active = state
            .active_operation(operation_id)
            .ok_or_else(|| EngineError::NotActive(operation_id.to_string()))?;
        let step_id = operation
            .step(active.current_step_index)
            .map(|step| step.id.clone())
            .unwrap_or_default();
        if !active.step_satisfied {
            return Err(EngineError::StepNotSatisfied {
                operation_id: operation_id.to_string(),
                step_id,
            });
        }

        let mut result = ValidationResult::default();
        match advance(state, operation, at) {
            Some(Advance::Next(next_step_index)) => result.outcomes.push(StepOutcome {
                operation_id: operation_id.to_string(),
                step_id,
                disposition: StepDisposition::Advanced { next_step_index },
            }),
            Some(Advance::Final) => self.finish(state, operation_id, step_id, at, &mut result),
            None => return Err(EngineError::NotActive(operation_id.to_string())),
        }
        self.cascade_into(state, at, &mut result);
        summarize(&mut result);
        Ok(result)
    }

    /// Applies rewards for an Active Operation directly.
    pub fn apply_rewards(
        &self,
        state: &mut PlayerProgressState,
        operation_id: &str,
    ) -> Result<CascadeReport, EngineError> {
        let at = self.now();
        let operation = self
            .registry
            .get(operation_id)
            .ok_or_else(|| EngineError::UnknownOperation(operation_id.to_string()))?;
        let receipt = RewardApplier.apply(state, operation, at)?;
        if receipt.already_completed {
            return Ok(CascadeReport::default());
        }
        let mut report = self.run_cascade(state, at);
        report.completed.insert(0, operation_id.to_string());
        Ok(report)
    }

    pub fn composed_view(&self, state: &PlayerProgressState, host_id: &str) -> ComposedView {
        let overlays = state
            .active_in_activation_order()
            .into_iter()
            .filter_map(|(operation_id, active)| {
                let delta = self
                    .registry
                    .get(operation_id)?
                    .filesystem_overlays
                    .get(host_id)?;
                Some((active.activation_seq, delta))
            });
        ComposedView::compose(
            self.catalog.host(host_id),
            overlays,
            state.deleted_paths(host_id),
        )
    }

    /// Recomputed on every call from the current active set.
    pub fn resolve_filesystem(
        &self,
        state: &PlayerProgressState,
        host_id: &str,
        path: &str,
    ) -> Option<FilesystemNode> {
        self.composed_view(state, host_id).resolve(path)
    }

    pub fn list_directory(
        &self,
        state: &PlayerProgressState,
        host_id: &str,
        path: &str,
    ) -> Option<Vec<String>> {
        self.resolve_filesystem(state, host_id, path)
            .and_then(|node| node.children)
    }

    pub fn active_operations(&self, state: &PlayerProgressState) -> Vec<ActiveOperationView> {
        state
            .active_in_activation_order()
            .into_iter()
            .filter_map(|(operation_id, active)| {
                let operation = self.registry.get(operation_id)?;
                Some(ActiveOperationView {
                    operation_id: operation_id.clone(),
                    title: operation.title.clone(),
                    current_step_index: active.current_step_index,
                    total_steps: operation.steps.len(),
                    current_step: operation.step(active.current_step_index).cloned(),
                    step_satisfied: active.step_satisfied,
                    activated_at: active.activated_at,
                    briefing: narrative::describe(operation, LifecycleEvent::Activated),
                })
            })
            .collect()
    }

    /// One message per lifecycle journal record, oldest first.
    pub fn inbox(&self, state: &PlayerProgressState) -> Vec<InboxMessage> {
        state
            .journal()
            .iter()
            .filter_map(|record| {
                let operation = self.registry.get(&record.operation_id)?;
                Some(InboxMessage {
                    message_id: format!("{}-{}", state.player_id(), record.sequence),
                    operation_id: record.operation_id.clone(),
                    event: record.event,
                    delivered_at: record.at,
                    content: narrative::describe(operation, record.event),
                })
            })
            .collect()
    }

    pub fn progress(&self, state: &PlayerProgressState) -> ProgressView {
        ProgressView {
            player_id: state.player_id().to_string(),
            flags: state.flags().as_map().clone(),
            credits: state.credits(),
            completed_operation_ids: state.completed_operation_ids().clone(),
        }
    }

    /// Applies the session side effects of `action` and records what
    /// happened for step matching.
    fn observe(
        &self,
        state: &mut PlayerProgressState,
        action: &PlayerAction,
        at: DateTime<Utc>,
    ) -> Result<ObservedAction, ActionRejection> {
        match action {
            PlayerAction::Scan { target_ip } => Ok(ObservedAction::Scanned {
                ip: target_ip.trim().to_string(),
            }),
            PlayerAction::Connect { target_ip } => {
                let ip = target_ip.trim();
                let host = self.catalog.host_by_ip(ip).ok_or_else(|| {
                    ActionRejection::new(RejectionCode::UnknownHost, format!("no route to host {ip}"))
                })?;
                let host_id = host.host_id.clone();
                state.session_mut().connected_host_id = Some(host_id.clone());
                state.push_event(
                    OperationEventType::HostConnected,
                    None,
                    None,
                    Some(json!({ "host_id": host_id, "ip": ip })),
                    at,
                );
                Ok(ObservedAction::Connected {
                    ip: ip.to_string(),
                    host_id,
                })
            }
            PlayerAction::Delete { path } => {
                let host_id = state.session().connected_host_id.clone().ok_or_else(|| {
                    ActionRejection::new(RejectionCode::NotConnected, "not connected to a host")
                })?;
                let raw = path.trim();
                let absolute = if raw.starts_with('/') {
                    raw.to_string()
                } else {
                    format!("/{raw}")
                };
                let missing = || {
                    ActionRejection::new(
                        RejectionCode::NoSuchFile,
                        format!("{raw}: no such file or directory"),
                    )
                };
                let normalized = normalize_path(&absolute)
                    .filter(|normalized| normalized != "/")
                    .ok_or_else(missing)?;
                let node = self
                    .composed_view(state, &host_id)
                    .resolve(&normalized)
                    .ok_or_else(missing)?;
                if node.kind == NodeKind::Dir {
                    return Err(ActionRejection::new(
                        RejectionCode::IsADirectory,
                        format!("{raw}: is a directory"),
                    ));
                }
                state.record_deletion(&host_id, normalized.clone());
                state.push_event(
                    OperationEventType::FileDeleted,
                    None,
                    None,
                    Some(json!({ "host_id": host_id, "path": normalized })),
                    at,
                );
                Ok(ObservedAction::Deleted {
                    host_id,
                    path: normalized,
                })
            }
            PlayerAction::Disconnect => {
                let host_id = state.session_mut().connected_host_id.take().ok_or_else(|| {
                    ActionRejection::new(RejectionCode::NotConnected, "not connected to a host")
                })?;
                state.push_event(
                    OperationEventType::HostDisconnected,
                    None,
                    None,
                    Some(json!({ "host_id": host_id })),
                    at,
                );
                Ok(ObservedAction::Disconnected { host_id })
            }
            PlayerAction::Acknowledge { token } => {
                let token = token.trim();
                if !self.is_known_token(state, token) {
                    return Err(ActionRejection::new(
                        RejectionCode::UnknownToken,
                        format!("unknown command `{token}`"),
                    ));
                }
                Ok(ObservedAction::Acknowledged {
                    token: token.to_string(),
                })
            }
        }
    }

    /// Configured tokens plus any explicit token a current step expects.
    fn is_known_token(&self, state: &PlayerProgressState, token: &str) -> bool {
        if self.config.is_ack_token(token) {
            return true;
        }
        state
            .active_in_activation_order()
            .into_iter()
            .filter_map(|(operation_id, active)| {
                self.registry
                    .get(operation_id)?
                    .step(active.current_step_index)
            })
            .any(|step| match &step.kind {
                StepKind::AcknowledgeCommand {
                    token: Some(expected),
                } => expected.trim().eq_ignore_ascii_case(token),
                _ => false,
            })
    }

    fn finish(
        &self,
        state: &mut PlayerProgressState,
        operation_id: &str,
        step_id: String,
        at: DateTime<Utc>,
        result: &mut ValidationResult,
    ) {
        let Some(operation) = self.registry.get(operation_id) else {
            return;
        };
        let disposition = match RewardApplier.apply(state, operation, at) {
            Ok(receipt) => {
                if !receipt.already_completed {
                    result.completed.push(operation_id.to_string());
                }
                StepDisposition::Completed {
                    credits_granted: receipt.credits_granted(),
                }
            }
            Err(err) => StepDisposition::RewardRejected {
                reason: err.to_string(),
            },
        };
        result.outcomes.push(StepOutcome {
            operation_id: operation_id.to_string(),
            step_id,
            disposition,
        });
    }

    fn cascade_into(
        &self,
        state: &mut PlayerProgressState,
        at: DateTime<Utc>,
        result: &mut ValidationResult,
    ) {
        let cascade = self.run_cascade(state, at);
        result.activated.extend(cascade.activated);
        result.completed.extend(cascade.completed);
    }

    /// Drains trigger evaluation until nothing new activates. Operations
    /// without steps complete on activation, which can unlock further
    /// Operations; each such round is one level of depth.
    fn run_cascade(&self, state: &mut PlayerProgressState, at: DateTime<Utc>) -> CascadeReport {
        let evaluator = TriggerEvaluator::new(&self.registry, &self.config);
        let mut report = CascadeReport::default();

        // Stepless operations whose payout was refused earlier retry once the
        // ledger can cover them.
        let mut pending = state
            .active_in_activation_order()
            .into_iter()
            .filter_map(|(operation_id, _)| self.registry.get(operation_id))
            .filter(|operation| operation.steps.is_empty())
            .filter(|operation| {
                operation.rewards.credits == 0
                    || state.ledger().check(operation.rewards.credits).is_ok()
            })
            .map(|operation| operation.id.clone())
            .collect::<VecDeque<_>>();

        let mut depth: u16 = 0;
        loop {
            let activated = evaluator.evaluate(state, at);
            pending.extend(
                activated
                    .iter()
                    .filter(|id| {
                        self.registry
                            .get(id)
                            .is_some_and(|operation| operation.steps.is_empty())
                    })
                    .cloned(),
            );
            report.activated.extend(activated);

            let mut completed_any = false;
            while let Some(operation_id) = pending.pop_front() {
                let Some(operation) = self.registry.get(&operation_id) else {
                    continue;
                };
                if let Ok(receipt) = RewardApplier.apply(state, operation, at) {
                    if !receipt.already_completed {
                        report.completed.push(operation_id);
                        completed_any = true;
                    }
                }
            }
            if !completed_any {
                break;
            }

            depth += 1;
            if depth >= self.config.max_cascade_depth {
                let more_pending = self
                    .registry
                    .iter()
                    .any(|operation| evaluator.is_eligible(state, operation));
                if !more_pending {
                    break;
                }
                report.depth_exceeded = true;
                warn!(
                    player_id = %state.player_id(),
                    depth,
                    "trigger cascade stopped at depth bound"
                );
                state.push_event(
                    OperationEventType::CascadeDepthExceeded,
                    None,
                    None,
                    Some(json!({ "depth": depth })),
                    at,
                );
                break;
            }
        }
        report
    }
}

fn summarize(result: &mut ValidationResult) {
    result.step_advanced = result.outcomes.iter().any(|outcome| {
        matches!(
            outcome.disposition,
            StepDisposition::Advanced { .. } | StepDisposition::Completed { .. }
        )
    });
    result.operation_completed = !result.completed.is_empty();
}
