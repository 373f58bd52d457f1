//! Contract errors raised by the core components.
//!
//! These are programming-contract or boundary violations. The loop controller
//! aborts the current cycle on any of them (nothing from the cycle is
//! persisted) and records the error in the event log. Non-fatal loop signals
//! such as stagnation or a failure ceiling are plain values, see
//! [`crate::controller::Signal`].

use thiserror::Error;

use crate::core::types::{TaskId, TaskStatus};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoopError {
    /// A phase change outside the state machine, or a second mutating action
    /// within one cycle.
    #[error("phase violation: {0}")]
    PhaseViolation(String),

    #[error("invalid transition for task '{task_id}': {from} -> {to}")]
    InvalidTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// Activating a task while another one is still active.
    #[error("cannot activate '{requested}': task '{active}' is already active")]
    ActiveTaskConflict { requested: TaskId, active: TaskId },

    #[error("curiosity tasks require a non-empty justification")]
    JustificationRequired,

    #[error("malformed question: {0}")]
    MalformedQuestion(String),

    #[error("inbound message rejected: sender is not the authenticated user channel")]
    SpoofRejected,

    #[error("invalid message: {0}")]
    MessageValidation(String),

    /// Fatal for the run: the controller must terminate with `budget_exhausted`.
    #[error("budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("unknown task '{0}'")]
    UnknownTask(TaskId),

    #[error("duplicate task id '{0}'")]
    DuplicateTask(TaskId),

    /// An explicit id that is blank once trimmed.
    #[error("invalid task id '{0}'")]
    InvalidTaskId(String),
}

impl LoopError {
    /// Stable snake_case label used in the event log.
    pub fn kind(&self) -> &'static str {
        match self {
            LoopError::PhaseViolation(_) => "phase_violation",
            LoopError::InvalidTransition { .. } => "invalid_transition",
            LoopError::ActiveTaskConflict { .. } => "active_task_conflict",
            LoopError::JustificationRequired => "justification_required",
            LoopError::MalformedQuestion(_) => "malformed_question",
            LoopError::SpoofRejected => "spoof_rejected",
            LoopError::MessageValidation(_) => "message_validation",
            LoopError::BudgetExhausted(_) => "budget_exhausted",
            LoopError::UnknownTask(_) => "unknown_task",
            LoopError::DuplicateTask(_) => "duplicate_task",
            LoopError::InvalidTaskId(_) => "invalid_task_id",
        }
    }
}
