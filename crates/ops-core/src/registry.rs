//! Published Operation definitions, in declared order.
//!
//! Every definition problem is caught here so the runtime pipeline can trust
//! the registry: wrong step params, unreachable dependency loops, and
//! out-of-order version bumps never reach a player.

use std::collections::{BTreeMap, BTreeSet};

use contracts::{
    DefinitionIssue, FlagValue, Operation, OperationTrigger, PublishReport, StepKind,
};
use tracing::{info, warn};

use crate::filesystem::normalize_path;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("{} invalid definition(s): {}", .0.len(), join_issues(.0))]
    Invalid(Vec<DefinitionIssue>),
}

impl RegistryError {
    pub fn issues(&self) -> &[DefinitionIssue] {
        match self {
            Self::Invalid(issues) => issues,
        }
    }
}

fn join_issues(issues: &[DefinitionIssue]) -> String {
    issues
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    operations: Vec<Operation>,
    index: BTreeMap<String, usize>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, operation_id: &str) -> Option<&Operation> {
        self.index
            .get(operation_id)
            .and_then(|position| self.operations.get(*position))
    }

    pub fn contains(&self, operation_id: &str) -> bool {
        self.index.contains_key(operation_id)
    }

    /// Operations in declared order.
    pub fn iter(&self) -> impl Iterator<Item = &Operation> {
        self.operations.iter()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Validates `incoming` against the current registry and commits all of
    /// it or none of it. A replaced definition keeps its declared position.
    pub fn publish(&mut self, incoming: Vec<Operation>) -> Result<PublishReport, RegistryError> {
        let mut errors = Vec::new();
        let mut candidate = self.operations.clone();
        let mut candidate_index = self.index.clone();
        let mut published = Vec::new();
        let mut seen_in_batch = BTreeSet::new();

        for operation in incoming {
            if !seen_in_batch.insert(operation.id.clone()) {
                errors.push(DefinitionIssue::new(
                    &operation.id,
                    "operation id appears more than once in the batch",
                ));
                continue;
            }
            errors.extend(check_definition(&operation));

            match candidate_index.get(&operation.id).copied() {
                Some(position) => {
                    let existing = &candidate[position];
                    if *existing == operation {
                        continue;
                    }
                    if operation.version <= existing.version {
                        errors.push(DefinitionIssue::new(
                            &operation.id,
                            format!(
                                "version {} does not supersede published version {}",
                                operation.version, existing.version
                            ),
                        ));
                        continue;
                    }
                    published.push(operation.id.clone());
                    candidate[position] = operation;
                }
                None => {
                    published.push(operation.id.clone());
                    candidate_index.insert(operation.id.clone(), candidate.len());
                    candidate.push(operation);
                }
            }
        }

        errors.extend(find_cycles(&candidate, &candidate_index));
        if !errors.is_empty() {
            warn!(errors = errors.len(), "operation publish rejected");
            return Err(RegistryError::Invalid(errors));
        }

        let warnings = collect_warnings(&candidate, &candidate_index);
        for warning in &warnings {
            warn!(operation_id = %warning.operation_id, message = %warning.message, "operation definition warning");
        }

        self.operations = candidate;
        self.index = candidate_index;
        info!(
            published = published.len(),
            total = self.operations.len(),
            "operations published"
        );
        Ok(PublishReport {
            published,
            warnings,
        })
    }
}

fn check_definition(operation: &Operation) -> Vec<DefinitionIssue> {
    let id = operation.id.as_str();
    let mut issues = Vec::new();
    let mut issue = |message: String| issues.push(DefinitionIssue::new(id, message));

    if id.trim().is_empty() {
        issue("operation id is empty".to_string());
    }
    if operation.rewards.completion_flag.trim().is_empty() {
        issue("completion_flag is empty".to_string());
    }
    if operation.rewards.flags.keys().any(|key| key.trim().is_empty()) {
        issue("reward flag key is empty".to_string());
    }
    if operation.requirements.flags.keys().any(|key| key.trim().is_empty()) {
        issue("required flag key is empty".to_string());
    }

    match &operation.trigger {
        OperationTrigger::OnFirstSessionOpen => {}
        OperationTrigger::OnOperationsCompleted { operation_ids } => {
            if operation_ids.is_empty() {
                issue("on_operations_completed trigger lists no operations".to_string());
            }
        }
        OperationTrigger::OnFlagSet { flag_key, .. } => {
            if flag_key.trim().is_empty() {
                issue("on_flag_set trigger has an empty flag_key".to_string());
            }
        }
    }

    let mut step_ids = BTreeSet::new();
    for step in &operation.steps {
        if step.id.trim().is_empty() {
            issue("step id is empty".to_string());
        } else if !step_ids.insert(step.id.as_str()) {
            issue(format!("duplicate step id `{}`", step.id));
        }

        match &step.kind {
            StepKind::ScanHost { target_ip } | StepKind::ConnectHost { target_ip } => {
                if target_ip.trim().is_empty() {
                    issue(format!("step `{}` has a blank target_ip", step.id));
                }
            }
            StepKind::DeleteFile { file_path } => {
                match normalize_path(file_path) {
                    Some(path) if path != "/" => {}
                    _ => issue(format!(
                        "step `{}` file_path `{file_path}` is not an absolute file path",
                        step.id
                    )),
                }
                if operation.resolve_host(step).is_none() {
                    issue(format!(
                        "step `{}` deletes a file but resolves no host",
                        step.id
                    ));
                }
            }
            StepKind::DisconnectHost => {}
            StepKind::AcknowledgeCommand { token } => {
                if let Some(token) = token {
                    if token.trim().is_empty() || token.trim().contains(char::is_whitespace) {
                        issue(format!(
                            "step `{}` ack token `{token}` is not a single word",
                            step.id
                        ));
                    }
                }
            }
        }
    }

    for (host_id, delta) in &operation.filesystem_overlays {
        let paths = delta.nodes.keys().chain(delta.removed.iter());
        for path in paths {
            if normalize_path(path).is_none() {
                issue(format!(
                    "overlay for host `{host_id}` has a relative path `{path}`"
                ));
            }
        }
    }

    issues
}

type FlagWriters<'a> = BTreeMap<&'a str, Vec<(&'a str, &'a FlagValue)>>;

static COMPLETION_VALUE: FlagValue = FlagValue::Bool(true);

/// Operations `operation` waits on before it can activate. A flag write only
/// counts when it comes from another Operation and the written value can
/// satisfy the read; an Operation never reactivates after writing its own.
fn dependencies<'a>(operation: &'a Operation, flag_writers: &FlagWriters<'a>) -> BTreeSet<&'a str> {
    let mut waits_on: BTreeSet<&str> = operation
        .requirements
        .operations
        .iter()
        .map(String::as_str)
        .collect();
    let mut reads: Vec<(&str, Option<&FlagValue>)> = operation
        .requirements
        .flags
        .iter()
        .map(|(key, value)| (key.as_str(), Some(value)))
        .collect();

    match &operation.trigger {
        OperationTrigger::OnFirstSessionOpen => {}
        OperationTrigger::OnOperationsCompleted { operation_ids } => {
            waits_on.extend(operation_ids.iter().map(String::as_str));
        }
        OperationTrigger::OnFlagSet {
            flag_key,
            flag_value,
        } => reads.push((flag_key.as_str(), flag_value.as_ref())),
    }

    for (flag, expected) in reads {
        let Some(writers) = flag_writers.get(flag) else {
            continue;
        };
        waits_on.extend(
            writers
                .iter()
                .filter(|(writer, _)| *writer != operation.id)
                .filter(|(_, written)| expected.map_or(true, |expected| *written == expected))
                .map(|(writer, _)| *writer),
        );
    }
    waits_on
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Unvisited,
    InProgress,
    Done,
}

fn find_cycles(
    operations: &[Operation],
    index: &BTreeMap<String, usize>,
) -> Vec<DefinitionIssue> {
    let mut flag_writers: FlagWriters<'_> = BTreeMap::new();
    for operation in operations {
        let written = operation
            .rewards
            .flags
            .iter()
            .map(|(key, value)| (key.as_str(), value))
            .chain(std::iter::once((
                operation.rewards.completion_flag.as_str(),
                &COMPLETION_VALUE,
            )));
        for (flag, value) in written {
            flag_writers
                .entry(flag)
                .or_default()
                .push((operation.id.as_str(), value));
        }
    }

    let edges: Vec<Vec<usize>> = operations
        .iter()
        .map(|operation| {
            dependencies(operation, &flag_writers)
                .into_iter()
                .filter_map(|id| index.get(id).copied())
                .collect()
        })
        .collect();

    let mut marks = vec![Mark::Unvisited; operations.len()];
    let mut issues = Vec::new();
    for start in 0..operations.len() {
        if marks[start] != Mark::Unvisited {
            continue;
        }
        // Iterative DFS; the stack holds (node, next edge to follow).
        let mut stack = vec![(start, 0_usize)];
        marks[start] = Mark::InProgress;
        while let Some((node, edge)) = stack.last().copied() {
            let Some(&next) = edges[node].get(edge) else {
                marks[node] = Mark::Done;
                stack.pop();
                continue;
            };
            if let Some(top) = stack.last_mut() {
                top.1 += 1;
            }
            match marks[next] {
                Mark::Unvisited => {
                    marks[next] = Mark::InProgress;
                    stack.push((next, 0));
                }
                Mark::InProgress => {
                    let from = stack
                        .iter()
                        .position(|(member, _)| *member == next)
                        .unwrap_or(0);
                    let path = stack[from..]
                        .iter()
                        .map(|(member, _)| operations[*member].id.as_str())
                        .chain(std::iter::once(operations[next].id.as_str()))
                        .collect::<Vec<_>>()
                        .join(" -> ");
                    issues.push(DefinitionIssue::new(
                        &operations[next].id,
                        format!("activation dependency cycle: {path}"),
                    ));
                }
                Mark::Done => {}
            }
        }
    }
    issues
}

fn collect_warnings(
    operations: &[Operation],
    index: &BTreeMap<String, usize>,
) -> Vec<DefinitionIssue> {
    let mut warnings = Vec::new();

    let mut completion_owner: BTreeMap<&str, &str> = BTreeMap::new();
    for operation in operations {
        let flag = operation.rewards.completion_flag.as_str();
        match completion_owner.get(flag) {
            Some(owner) => warnings.push(DefinitionIssue::new(
                &operation.id,
                format!("completion flag `{flag}` is also used by `{owner}`"),
            )),
            None => {
                completion_owner.insert(flag, operation.id.as_str());
            }
        }
    }

    for operation in operations {
        let mut referenced: Vec<&String> = operation.requirements.operations.iter().collect();
        if let OperationTrigger::OnOperationsCompleted { operation_ids } = &operation.trigger {
            referenced.extend(operation_ids.iter());
        }
        for missing in referenced.into_iter().filter(|id| !index.contains_key(id.as_str())) {
            warnings.push(DefinitionIssue::new(
                &operation.id,
                format!("references unknown operation `{missing}`"),
            ));
        }
    }

    warnings
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::{OperationStatus, OperationStep, Rewards};

    fn operation(id: &str, trigger: OperationTrigger) -> Operation {
        Operation {
            id: id.to_string(),
            version: 1,
            title: id.to_string(),
            status: OperationStatus::Published,
            trigger,
            requirements: Default::default(),
            steps: vec![OperationStep::new(
                "scan",
                StepKind::ScanHost {
                    target_ip: "10.0.0.5".to_string(),
                },
            )],
            rewards: Rewards {
                credits: 10,
                flags: BTreeMap::new(),
                completion_flag: format!("{id}_done"),
            },
            default_host_id: None,
            filesystem_overlays: BTreeMap::new(),
            narrative: Default::default(),
        }
    }

    fn after(ids: &[&str]) -> OperationTrigger {
        OperationTrigger::OnOperationsCompleted {
            operation_ids: ids.iter().map(|id| id.to_string()).collect(),
        }
    }

    #[test]
    fn publish_keeps_declared_order() {
        let mut registry = OperationRegistry::new();
        registry
            .publish(vec![
                operation("b", OperationTrigger::OnFirstSessionOpen),
                operation("a", after(&["b"])),
            ])
            .expect("valid batch");
        let ids = registry.iter().map(|op| op.id.as_str()).collect::<Vec<_>>();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn rejects_cycle_through_completion_triggers() {
        let mut registry = OperationRegistry::new();
        let err = registry
            .publish(vec![operation("a", after(&["b"])), operation("b", after(&["a"]))])
            .expect_err("cycle");
        assert!(err
            .issues()
            .iter()
            .any(|issue| issue.message.contains("cycle")));
        assert!(registry.is_empty());
    }

    #[test]
    fn rejects_cycle_through_reward_flags() {
        let mut first = operation(
            "a",
            OperationTrigger::OnFlagSet {
                flag_key: "b_done".to_string(),
                flag_value: None,
            },
        );
        first.rewards.flags.insert("unlock_b".into(), true.into());
        let second = operation(
            "b",
            OperationTrigger::OnFlagSet {
                flag_key: "unlock_b".to_string(),
                flag_value: None,
            },
        );
        let mut registry = OperationRegistry::new();
        assert!(registry.publish(vec![first, second]).is_err());
    }

    fn on_stage(id: &str, reads: &str, writes: &str) -> Operation {
        let mut op = operation(
            id,
            OperationTrigger::OnFlagSet {
                flag_key: "stage".to_string(),
                flag_value: Some(reads.into()),
            },
        );
        op.rewards.flags.insert("stage".into(), writes.into());
        op
    }

    #[test]
    fn stage_counter_chain_is_not_a_cycle() {
        let mut registry = OperationRegistry::new();
        let report = registry
            .publish(vec![on_stage("a", "1", "2"), on_stage("b", "2", "3")])
            .expect("value-distinct stages publish");
        assert_eq!(report.published, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn stage_values_that_loop_back_are_a_cycle() {
        let mut registry = OperationRegistry::new();
        let err = registry
            .publish(vec![on_stage("a", "1", "2"), on_stage("b", "2", "1")])
            .expect_err("stages loop");
        assert!(err
            .issues()
            .iter()
            .all(|issue| !issue.message.contains("a -> a")));
        assert!(err
            .issues()
            .iter()
            .any(|issue| issue.message.contains("cycle")));
    }

    #[test]
    fn rejects_bad_step_params_and_lists_every_issue() {
        let mut bad = operation("bad", OperationTrigger::OnFirstSessionOpen);
        bad.rewards.completion_flag = " ".to_string();
        bad.steps = vec![
            OperationStep::new(
                "s1",
                StepKind::ScanHost {
                    target_ip: "".to_string(),
                },
            ),
            OperationStep::new(
                "s1",
                StepKind::DeleteFile {
                    file_path: "var/log".to_string(),
                },
            ),
            OperationStep::new(
                "s3",
                StepKind::AcknowledgeCommand {
                    token: Some("two words".to_string()),
                },
            ),
        ];
        let mut registry = OperationRegistry::new();
        let err = registry.publish(vec![bad]).expect_err("invalid");
        // empty completion flag, blank ip, duplicate id, relative path, no host, token
        assert_eq!(err.issues().len(), 6);
    }

    #[test]
    fn republish_requires_higher_version() {
        let mut registry = OperationRegistry::new();
        let original = operation("a", OperationTrigger::OnFirstSessionOpen);
        registry.publish(vec![original.clone()]).expect("first");

        let report = registry.publish(vec![original.clone()]).expect("identical is a no-op");
        assert!(report.published.is_empty());

        let mut edited = original.clone();
        edited.title = "renamed".to_string();
        assert!(registry.publish(vec![edited.clone()]).is_err());

        edited.version = 2;
        let report = registry.publish(vec![edited]).expect("newer version");
        assert_eq!(report.published, vec!["a".to_string()]);
        assert_eq!(registry.get("a").map(|op| op.title.as_str()), Some("renamed"));
    }

    #[test]
    fn duplicate_completion_flags_and_unknown_refs_warn() {
        let mut second = operation("b", after(&["ghost"]));
        second.rewards.completion_flag = "a_done".to_string();
        let mut registry = OperationRegistry::new();
        let report = registry
            .publish(vec![operation("a", OperationTrigger::OnFirstSessionOpen), second])
            .expect("warnings only");
        assert_eq!(report.warnings.len(), 2);
        assert_eq!(registry.len(), 2);
    }
}
