//! Shared deterministic types for the loop core.
//!
//! These types define the persisted contracts between components (task store
//! snapshot, message log lines, cycle records). Serialized names are stable;
//! renaming a variant is a format change.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type TaskId = String;
pub type MessageId = String;

/// Where a task came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    User,
    Plan,
    Curiosity,
    Recovery,
}

impl Origin {
    pub const ALL: [Origin; 4] = [Origin::User, Origin::Plan, Origin::Curiosity, Origin::Recovery];

    pub fn as_str(self) -> &'static str {
        match self {
            Origin::User => "user",
            Origin::Plan => "plan",
            Origin::Curiosity => "curiosity",
            Origin::Recovery => "recovery",
        }
    }

    /// Prefix for generated task ids.
    pub fn id_prefix(self) -> &'static str {
        match self {
            Origin::User => "USR",
            Origin::Plan => "PLN",
            Origin::Curiosity => "CUR",
            Origin::Recovery => "REC",
        }
    }

    /// Selection precedence: lower is picked first (user > recovery > plan > curiosity).
    pub fn precedence(self) -> u8 {
        match self {
            Origin::User => 0,
            Origin::Recovery => 1,
            Origin::Plan => 2,
            Origin::Curiosity => 3,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Active,
    Blocked,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Active,
        TaskStatus::Blocked,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Active => "active",
            TaskStatus::Blocked => "blocked",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    /// Completed and failed accept no further transitions.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }

    /// Lower rank is selected first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Medium => 1,
            Priority::Low => 2,
        }
    }

    pub fn parse(raw: &str) -> Option<Priority> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "high" => Some(Priority::High),
            "medium" => Some(Priority::Medium),
            "low" => Some(Priority::Low),
            _ => None,
        }
    }
}

/// Coarse classification of an action result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    Success,
    Error,
    /// The action is waiting on someone else (a question to the user).
    Pending,
}

impl OutcomeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeKind::Success => "success",
            OutcomeKind::Error => "error",
            OutcomeKind::Pending => "pending",
        }
    }
}

/// One executed action in a task's progress trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceEntry {
    /// Loop cycle the action ran in.
    pub cycle: u64,
    pub action_fingerprint: String,
    pub outcome_kind: OutcomeKind,
    /// Normalized error text, present only for `error` outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_signature: Option<String>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub origin: Origin,
    pub status: TaskStatus,
    pub priority: Priority,
    #[serde(default)]
    pub parent_task_id: Option<TaskId>,
    /// Required (non-empty) for curiosity tasks.
    #[serde(default)]
    pub justification: Option<String>,
    pub title: String,
    #[serde(default)]
    pub context: String,
    #[serde(default)]
    pub success_criteria: Vec<String>,
    /// Reason attached to the latest status change, if any.
    #[serde(default)]
    pub status_reason: Option<String>,
    /// Creation sequence; breaks ties between equal `created_at` values.
    pub seq: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub progress_trace: Vec<TraceEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Question,
    Answer,
    Clarification,
    Instruction,
    StatusUpdate,
    CompletionSummary,
}

impl MessageType {
    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Question => "question",
            MessageType::Answer => "answer",
            MessageType::Clarification => "clarification",
            MessageType::Instruction => "instruction",
            MessageType::StatusUpdate => "status_update",
            MessageType::CompletionSummary => "completion_summary",
        }
    }

    /// Types the user channel may send.
    pub fn is_inbound_kind(self) -> bool {
        matches!(
            self,
            MessageType::Answer | MessageType::Clarification | MessageType::Instruction
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Sender {
    Agent,
    User,
}

/// Persisted message. Immutable once appended to the message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub direction: Direction,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub task_ref: Option<TaskId>,
    pub body: String,
    pub timestamp: DateTime<Utc>,
    pub sender: Sender,
}

/// Exactly one of these is performed per cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Action {
    /// Run an operation through the action executor.
    ToolCall {
        tool: String,
        #[serde(default)]
        args: serde_json::Value,
    },
    AskUser { question: String },
    /// Internal reasoning step; no external effect.
    Reason { note: String },
    /// Declare the current task complete.
    Complete {
        summary: String,
        #[serde(default)]
        approach: String,
        #[serde(default)]
        artifacts: Vec<String>,
        #[serde(default)]
        follow_ups: Vec<String>,
    },
    /// Declare the current task blocked on something outside the agent.
    Block { reason: String },
}

impl Action {
    pub fn label(&self) -> &'static str {
        match self {
            Action::ToolCall { .. } => "tool_call",
            Action::AskUser { .. } => "ask_user",
            Action::Reason { .. } => "reason",
            Action::Complete { .. } => "complete",
            Action::Block { .. } => "block",
        }
    }
}

/// Result of performing an action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub outcome_kind: OutcomeKind,
    pub detail: String,
}

impl Observation {
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            outcome_kind: OutcomeKind::Success,
            detail: detail.into(),
        }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            outcome_kind: OutcomeKind::Error,
            detail: detail.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_serializes_with_kind_tag() {
        let action = Action::ToolCall {
            tool: "shell".to_string(),
            args: serde_json::json!({"command": "ls"}),
        };
        let value = serde_json::to_value(&action).expect("serialize");
        assert_eq!(
            value,
            serde_json::json!({"kind": "tool_call", "tool": "shell", "args": {"command": "ls"}})
        );
    }

    #[test]
    fn message_uses_type_field_on_the_wire() {
        let raw = r#"{"id":"msg-000001","direction":"outbound","type":"question","task_ref":"USR-0001","body":"Which branch?","timestamp":"2026-01-02T03:04:05Z","sender":"agent"}"#;
        let message: Message = serde_json::from_str(raw).expect("parse");
        assert_eq!(message.kind, MessageType::Question);
        assert_eq!(message.task_ref.as_deref(), Some("USR-0001"));
    }

    #[test]
    fn origin_precedence_orders_user_first_and_curiosity_last() {
        let mut origins = Origin::ALL.to_vec();
        origins.sort_by_key(|origin| origin.precedence());
        assert_eq!(
            origins,
            vec![Origin::User, Origin::Recovery, Origin::Plan, Origin::Curiosity]
        );
    }

    #[test]
    fn priority_parse_is_case_insensitive() {
        assert_eq!(Priority::parse(" HIGH "), Some(Priority::High));
        assert_eq!(Priority::parse("urgent"), None);
    }
}
