//! Operation definition contracts as published by the authoring tool.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

/// Flag payload. Flags are either plain markers or carry a string value.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(untagged)]
pub enum FlagValue {
    Bool(bool),
    Text(String),
}

impl Default for FlagValue {
    fn default() -> Self {
        Self::Bool(true)
    }
}

impl From<bool> for FlagValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FlagValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(value) => write!(f, "{value}"),
            Self::Text(value) => f.write_str(value),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    #[default]
    Draft,
    Published,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationTrigger {
    OnFirstSessionOpen,
    OnOperationsCompleted {
        operation_ids: Vec<String>,
    },
    OnFlagSet {
        flag_key: String,
        #[serde(default)]
        flag_value: Option<FlagValue>,
    },
}

impl OperationTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnFirstSessionOpen => "on_first_session_open",
            Self::OnOperationsCompleted { .. } => "on_operations_completed",
            Self::OnFlagSet { .. } => "on_flag_set",
        }
    }
}

/// Step kinds carry their params inline so a definition cannot name a kind
/// without the fields that kind requires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    ScanHost {
        target_ip: String,
    },
    ConnectHost {
        target_ip: String,
    },
    DeleteFile {
        file_path: String,
    },
    DisconnectHost,
    AcknowledgeCommand {
        #[serde(default)]
        token: Option<String>,
    },
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScanHost { .. } => "scan_host",
            Self::ConnectHost { .. } => "connect_host",
            Self::DeleteFile { .. } => "delete_file",
            Self::DisconnectHost => "disconnect_host",
            Self::AcknowledgeCommand { .. } => "acknowledge_command",
        }
    }
}

fn default_auto_advance() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct OperationStep {
    pub id: String,
    pub kind: StepKind,
    #[serde(default)]
    pub target_host_id: Option<String>,
    #[serde(default = "default_auto_advance")]
    pub auto_advance: bool,
}

impl OperationStep {
    pub fn new(id: impl Into<String>, kind: StepKind) -> Self {
        Self {
            id: id.into(),
            kind,
            target_host_id: None,
            auto_advance: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Requirements {
    #[serde(default)]
    pub flags: BTreeMap<String, FlagValue>,
    #[serde(default)]
    pub operations: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct Rewards {
    #[serde(default)]
    pub credits: i64,
    #[serde(default)]
    pub flags: BTreeMap<String, FlagValue>,
    pub completion_flag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessageTemplate {
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct NarrativeBindings {
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub activation: Option<MessageTemplate>,
    #[serde(default)]
    pub completion: Option<MessageTemplate>,
    #[serde(default)]
    pub failure: Option<MessageTemplate>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Dir,
    File,
}

/// A node as authored in a host's base filesystem or in an overlay delta.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NodeSpec {
    pub kind: NodeKind,
    #[serde(default)]
    pub content: Option<String>,
}

impl NodeSpec {
    pub fn dir() -> Self {
        Self {
            kind: NodeKind::Dir,
            content: None,
        }
    }

    pub fn file(content: impl Into<String>) -> Self {
        Self {
            kind: NodeKind::File,
            content: Some(content.into()),
        }
    }
}

/// Resolved node returned to callers. `children` is only set for directories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilesystemNode {
    pub kind: NodeKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub children: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

/// Per-host delta an Operation layers over the base filesystem while active.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct FilesystemDelta {
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeSpec>,
    #[serde(default)]
    pub removed: BTreeSet<String>,
}

fn default_version() -> u32 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Operation {
    pub id: String,
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub status: OperationStatus,
    pub trigger: OperationTrigger,
    #[serde(default)]
    pub requirements: Requirements,
    #[serde(default)]
    pub steps: Vec<OperationStep>,
    pub rewards: Rewards,
    #[serde(default)]
    pub default_host_id: Option<String>,
    #[serde(default)]
    pub filesystem_overlays: BTreeMap<String, FilesystemDelta>,
    #[serde(default)]
    pub narrative: NarrativeBindings,
}

impl Operation {
    pub fn is_published(&self) -> bool {
        self.status == OperationStatus::Published
    }

    /// Host a step addresses: its own target, else the operation default.
    pub fn resolve_host<'a>(&'a self, step: &'a OperationStep) -> Option<&'a str> {
        step.target_host_id
            .as_deref()
            .or(self.default_host_id.as_deref())
    }

    pub fn step(&self, index: usize) -> Option<&OperationStep> {
        self.steps.get(index)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HostRecord {
    pub host_id: String,
    pub ip: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub filesystem: BTreeMap<String, NodeSpec>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn step_defaults_auto_advance_to_true() {
        let step: OperationStep = serde_json::from_value(json!({
            "id": "scan",
            "kind": { "type": "scan_host", "target_ip": "10.0.0.5" }
        }))
        .expect("step parses");
        assert!(step.auto_advance);
        assert_eq!(step.target_host_id, None);
    }

    #[test]
    fn step_kind_missing_param_fails_to_parse() {
        let parsed = serde_json::from_value::<StepKind>(json!({ "type": "delete_file" }));
        assert!(parsed.is_err());
    }

    #[test]
    fn flag_value_accepts_bool_and_text() {
        let flags: BTreeMap<String, FlagValue> =
            serde_json::from_value(json!({ "a": true, "b": "north" })).expect("flags parse");
        assert_eq!(flags["a"], FlagValue::Bool(true));
        assert_eq!(flags["b"], FlagValue::from("north"));
    }

    #[test]
    fn resolve_host_falls_back_to_default() {
        let operation: Operation = serde_json::from_value(json!({
            "id": "SR-201",
            "status": "published",
            "trigger": { "type": "on_first_session_open" },
            "default_host_id": "relay",
            "steps": [
                { "id": "s1", "kind": { "type": "disconnect_host" } },
                { "id": "s2", "kind": { "type": "disconnect_host" }, "target_host_id": "vault" }
            ],
            "rewards": { "completion_flag": "quest_SR201_completed" }
        }))
        .expect("operation parses");
        assert_eq!(operation.version, 1);
        assert_eq!(operation.resolve_host(&operation.steps[0]), Some("relay"));
        assert_eq!(operation.resolve_host(&operation.steps[1]), Some("vault"));
    }
}
