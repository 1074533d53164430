//! Read-model contracts returned by the external interface.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{LifecycleEvent, OperationStep};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RenderedMessage {
    pub sender: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InboxMessage {
    pub message_id: String,
    pub operation_id: String,
    pub event: LifecycleEvent,
    pub delivered_at: DateTime<Utc>,
    #[serde(flatten)]
    pub content: RenderedMessage,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ActiveOperationView {
    pub operation_id: String,
    pub title: String,
    pub current_step_index: usize,
    pub total_steps: usize,
    pub current_step: Option<OperationStep>,
    pub step_satisfied: bool,
    pub activated_at: DateTime<Utc>,
    pub briefing: RenderedMessage,
}
