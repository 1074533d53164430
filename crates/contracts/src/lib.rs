//! v1 cross-boundary contracts for the operation engine, API, persistence, and CLI.

pub mod operation;
pub mod views;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use operation::{
    FilesystemDelta, FilesystemNode, FlagValue, HostRecord, MessageTemplate, NarrativeBindings,
    NodeKind, NodeSpec, Operation, OperationStatus, OperationStep, OperationTrigger, Requirements,
    Rewards, StepKind,
};
pub use views::{ActiveOperationView, InboxMessage, RenderedMessage};

pub const SCHEMA_VERSION_V1: &str = "1.0";
pub const DEFAULT_SESSION_FLAG: &str = "session_opened";
pub const DEFAULT_LEDGER_RETENTION: usize = 500;
pub const DEFAULT_MAX_CASCADE_DEPTH: u16 = 64;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EngineConfig {
    pub schema_version: String,
    pub session_flag_key: String,
    pub ack_tokens: Vec<String>,
    pub ledger_retention: usize,
    pub max_cascade_depth: u16,
    pub starting_credits: i64,
}

impl EngineConfig {
    pub fn is_ack_token(&self, token: &str) -> bool {
        let token = token.trim();
        self.ack_tokens
            .iter()
            .any(|known| known.eq_ignore_ascii_case(token))
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            session_flag_key: DEFAULT_SESSION_FLAG.to_string(),
            ack_tokens: vec!["ACK".to_string(), "DONE".to_string()],
            ledger_retention: DEFAULT_LEDGER_RETENTION,
            max_cascade_depth: DEFAULT_MAX_CASCADE_DEPTH,
            starting_credits: 0,
        }
    }
}

/// Terminal actions from the fixed command vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlayerAction {
    Scan { target_ip: String },
    Connect { target_ip: String },
    Delete { path: String },
    Disconnect,
    Acknowledge { token: String },
}

impl fmt::Display for PlayerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scan { target_ip } => write!(f, "scan {target_ip}"),
            Self::Connect { target_ip } => write!(f, "connect {target_ip}"),
            Self::Delete { path } => write!(f, "rm {path}"),
            Self::Disconnect => f.write_str("disconnect"),
            Self::Acknowledge { token } => f.write_str(token),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ActionParseError {
    #[error("empty command")]
    Empty,
    #[error("`{verb}` requires {argument}")]
    MissingArgument {
        verb: String,
        argument: &'static str,
    },
    #[error("unknown command `{0}`")]
    UnknownCommand(String),
}

impl FromStr for PlayerAction {
    type Err = ActionParseError;

    /// Resolves a single terminal line. A lone word that is not a verb is
    /// treated as an acknowledgement token; the engine decides whether it
    /// is a configured one.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut parts = raw.split_whitespace();
        let Some(verb) = parts.next() else {
            return Err(ActionParseError::Empty);
        };
        let argument = parts.next();
        let lowered = verb.to_ascii_lowercase();
        let require = |argument: Option<&str>, name: &'static str| {
            argument
                .map(str::to_string)
                .ok_or_else(|| ActionParseError::MissingArgument {
                    verb: lowered.clone(),
                    argument: name,
                })
        };

        match lowered.as_str() {
            "scan" | "nmap" => Ok(Self::Scan {
                target_ip: require(argument, "a target ip")?,
            }),
            "connect" | "ssh" => Ok(Self::Connect {
                target_ip: require(argument, "a target ip")?,
            }),
            "rm" | "del" | "delete" => Ok(Self::Delete {
                path: require(argument, "a file path")?,
            }),
            "disconnect" | "exit" | "logout" => Ok(Self::Disconnect),
            "ack" | "acknowledge" => Ok(Self::Acknowledge {
                token: argument.unwrap_or(verb).to_string(),
            }),
            _ if argument.is_none() => Ok(Self::Acknowledge {
                token: verb.to_string(),
            }),
            _ => Err(ActionParseError::UnknownCommand(verb.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: u64,
    pub amount: i64,
    pub reason: String,
    pub balance_after: i64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleEvent {
    Activated,
    Completed,
    Failed,
}

impl LifecycleEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Activated => "activated",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OperationEventType {
    SessionOpened,
    OperationActivated,
    StepSatisfied,
    StepAdvanced,
    OperationCompleted,
    RewardRejected,
    ActionRejected,
    HostConnected,
    HostDisconnected,
    FileDeleted,
    CascadeDepthExceeded,
}

/// Audit record of one engine decision for one player.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OperationEvent {
    pub schema_version: String,
    pub player_id: String,
    pub sequence: u64,
    pub created_at: DateTime<Utc>,
    pub event_type: OperationEventType,
    pub operation_id: Option<String>,
    pub step_id: Option<String>,
    pub details: Option<Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RejectionCode {
    NotConnected,
    NoSuchFile,
    IsADirectory,
    UnknownHost,
    UnknownToken,
}

/// User-facing rejection of a malformed or impossible action.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActionRejection {
    pub code: RejectionCode,
    pub message: String,
}

impl ActionRejection {
    pub fn new(code: RejectionCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepDisposition {
    Advanced { next_step_index: usize },
    AwaitingConfirmation,
    Completed { credits_granted: i64 },
    RewardRejected { reason: String },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StepOutcome {
    pub operation_id: String,
    pub step_id: String,
    pub disposition: StepDisposition,
}

/// Result of one submitted action. An action matching nothing is a normal
/// negative result: no outcomes and no error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ValidationResult {
    pub step_advanced: bool,
    pub operation_completed: bool,
    pub outcomes: Vec<StepOutcome>,
    pub activated: Vec<String>,
    pub completed: Vec<String>,
    pub error: Option<ActionRejection>,
}

impl ValidationResult {
    pub fn rejected(rejection: ActionRejection) -> Self {
        Self {
            error: Some(rejection),
            ..Self::default()
        }
    }

    pub fn had_effect(&self) -> bool {
        !self.outcomes.is_empty()
    }
}

/// A definition problem found at publish time, fatal or advisory.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DefinitionIssue {
    pub operation_id: String,
    pub message: String,
}

impl DefinitionIssue {
    pub fn new(operation_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for DefinitionIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.operation_id, self.message)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct PublishReport {
    pub published: Vec<String>,
    pub warnings: Vec<DefinitionIssue>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProgressView {
    pub player_id: String,
    pub flags: BTreeMap<String, FlagValue>,
    pub credits: i64,
    pub completed_operation_ids: BTreeSet<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    OperationNotFound,
    HostNotFound,
    InvalidAction,
    InvalidDefinition,
    InvalidQuery,
    StepNotSatisfied,
    InternalError,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiError {
    pub schema_version: String,
    pub error_code: ErrorCode,
    pub message: String,
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(error_code: ErrorCode, message: impl Into<String>, details: Option<String>) -> Self {
        Self {
            schema_version: SCHEMA_VERSION_V1.to_string(),
            error_code,
            message: message.into(),
            details,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fixed_vocabulary() {
        assert_eq!(
            "scan 10.0.0.5".parse::<PlayerAction>(),
            Ok(PlayerAction::Scan {
                target_ip: "10.0.0.5".to_string()
            })
        );
        assert_eq!(
            "SSH 10.0.0.7".parse::<PlayerAction>(),
            Ok(PlayerAction::Connect {
                target_ip: "10.0.0.7".to_string()
            })
        );
        assert_eq!(
            "rm /var/log/auth.log".parse::<PlayerAction>(),
            Ok(PlayerAction::Delete {
                path: "/var/log/auth.log".to_string()
            })
        );
        assert_eq!("exit".parse::<PlayerAction>(), Ok(PlayerAction::Disconnect));
        assert_eq!(
            "DONE".parse::<PlayerAction>(),
            Ok(PlayerAction::Acknowledge {
                token: "DONE".to_string()
            })
        );
        assert_eq!(
            "ack".parse::<PlayerAction>(),
            Ok(PlayerAction::Acknowledge {
                token: "ack".to_string()
            })
        );
    }

    #[test]
    fn rejects_malformed_lines() {
        assert_eq!("   ".parse::<PlayerAction>(), Err(ActionParseError::Empty));
        assert!(matches!(
            "scan".parse::<PlayerAction>(),
            Err(ActionParseError::MissingArgument { .. })
        ));
        assert_eq!(
            "format c:".parse::<PlayerAction>(),
            Err(ActionParseError::UnknownCommand("format".to_string()))
        );
    }

    #[test]
    fn config_fills_missing_fields_with_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"starting_credits": 50}"#).expect("partial config");
        assert_eq!(config.starting_credits, 50);
        assert_eq!(config.session_flag_key, DEFAULT_SESSION_FLAG);
        assert!(config.is_ack_token("ack"));
        assert!(!config.is_ack_token("nope"));
    }

    #[test]
    fn action_wire_format_is_tagged() {
        let value = serde_json::to_value(PlayerAction::Delete {
            path: "/tmp/x".to_string(),
        })
        .expect("serialize");
        assert_eq!(value["type"], "delete");
        assert_eq!(value["path"], "/tmp/x");
    }

    #[test]
    fn inbox_message_flattens_rendered_content() {
        use chrono::TimeZone;

        let message = InboxMessage {
            message_id: "p1-1".to_string(),
            operation_id: "SR-201".to_string(),
            event: LifecycleEvent::Activated,
            delivered_at: Utc
                .timestamp_opt(1_700_000_000, 0)
                .single()
                .expect("valid timestamp"),
            content: RenderedMessage {
                sender: "Vex".to_string(),
                subject: "Signal Relay".to_string(),
                body: "Scan the relay.".to_string(),
            },
        };
        let value = serde_json::to_value(&message).expect("serialize");
        assert_eq!(value["sender"], "Vex");
        assert_eq!(value["event"], "activated");
        assert!(value.get("content").is_none());
    }
}
