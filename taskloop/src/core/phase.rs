//! Loop phase machine and the persisted agent state.
//!
//! ```text
//! initialise -> plan -> act -> observe -> reflect -> [expand] -> decide
//! decide -> plan | waiting_user | terminated
//! waiting_user -> reflect (inbound message) | plan (forced resume)
//! ```
//!
//! `plan -> decide` covers cycles that select nothing or cannot plan; the
//! shortcuts to `terminated` cover a spent budget detected before acting.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::LoopError;
use crate::core::types::{Action, Message, MessageId, TaskId};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Initialise,
    Plan,
    Act,
    Observe,
    Reflect,
    Expand,
    Decide,
    WaitingUser,
    Terminated,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Initialise => "initialise",
            Phase::Plan => "plan",
            Phase::Act => "act",
            Phase::Observe => "observe",
            Phase::Reflect => "reflect",
            Phase::Expand => "expand",
            Phase::Decide => "decide",
            Phase::WaitingUser => "waiting_user",
            Phase::Terminated => "terminated",
        }
    }

    pub fn can_transition_to(self, to: Phase) -> bool {
        matches!(
            (self, to),
            (Phase::Initialise, Phase::Plan | Phase::Terminated)
                | (Phase::Plan, Phase::Act | Phase::Decide | Phase::Terminated)
                | (Phase::Act, Phase::Observe)
                | (Phase::Observe, Phase::Reflect | Phase::Decide)
                | (Phase::Reflect, Phase::Expand | Phase::Decide)
                | (Phase::Expand, Phase::Decide)
                | (
                    Phase::Decide,
                    Phase::Plan | Phase::WaitingUser | Phase::Terminated
                )
                | (
                    Phase::WaitingUser,
                    Phase::Reflect | Phase::Plan | Phase::Terminated
                )
                | (Phase::Terminated, Phase::Initialise)
        )
    }

    /// Phases a cycle may start from. Anything else on load means the
    /// process died mid-cycle.
    pub fn is_resting(self) -> bool {
        matches!(
            self,
            Phase::Initialise | Phase::Plan | Phase::WaitingUser | Phase::Terminated
        )
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    GoalSatisfied,
    BudgetExhausted,
    NoRunnableTasks,
    /// The escalation policy gave up on an unanswered question.
    Escalated,
}

impl TerminationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            TerminationReason::GoalSatisfied => "goal_satisfied",
            TerminationReason::BudgetExhausted => "budget_exhausted",
            TerminationReason::NoRunnableTasks => "no_runnable_tasks",
            TerminationReason::Escalated => "escalated",
        }
    }

    /// New intake reopens the run unless the budget is spent.
    pub fn reopens_on_intake(self) -> bool {
        !matches!(self, TerminationReason::BudgetExhausted)
    }
}

/// Persisted as `state/agent_state.json` after every phase transition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentState {
    pub phase: Phase,
    /// Set only while `phase == waiting_user`.
    pub pending_question_ref: Option<MessageId>,
    pub termination_reason: Option<TerminationReason>,
    pub termination_detail: Option<String>,
    /// Number of the latest cycle that started.
    pub cycle: u64,
    pub current_task: Option<TaskId>,
    /// Inbound messages received while running, for the next reflection.
    pub inbound_queue: Vec<Message>,
    /// Inbound message that ended a wait, consumed by the resume cycle.
    pub resume_input: Option<Message>,
    /// Next action proposed by the latest reflection, keyed to a task.
    pub planned_action: Option<PlannedAction>,
    pub waiting_since: Option<DateTime<Utc>>,
    /// Start time of the latest cycle, checkpointed with its phases.
    pub cycle_started_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedAction {
    pub task_id: TaskId,
    pub action: Action,
}

impl AgentState {
    pub fn is_waiting(&self) -> bool {
        self.phase == Phase::WaitingUser
    }

    pub fn is_terminated(&self) -> bool {
        self.phase == Phase::Terminated
    }

    /// Move to `to`, enforcing the transition table.
    pub fn advance(&mut self, to: Phase) -> Result<Phase, LoopError> {
        let from = self.phase;
        if !from.can_transition_to(to) {
            return Err(LoopError::PhaseViolation(format!(
                "illegal phase transition {from} -> {to}"
            )));
        }
        self.phase = to;
        if to != Phase::WaitingUser {
            self.pending_question_ref = None;
            self.waiting_since = None;
        }
        if to != Phase::Terminated {
            self.termination_reason = None;
            self.termination_detail = None;
        }
        Ok(from)
    }

    /// True when the persisted phase marks a cycle that never finished.
    pub fn is_interrupted(&self) -> bool {
        !self.phase.is_resting() && !(self.phase == Phase::Reflect && self.resume_input.is_some())
    }

    /// Put an interrupted cycle back on a resting phase without replaying it.
    ///
    /// `asked` is a question the interrupted cycle already delivered; the
    /// loop then waits on it instead of planning again. The input that cycle
    /// consumed is dropped with it. Returns the phase the crash left behind.
    pub fn recover_interrupted(&mut self, asked: Option<&Message>) -> Phase {
        let stale = self.phase;
        match asked {
            Some(question) => {
                self.phase = Phase::WaitingUser;
                self.pending_question_ref = Some(question.id.clone());
                self.waiting_since = Some(question.timestamp);
                self.resume_input = None;
                self.inbound_queue.clear();
            }
            None => {
                self.phase = if self.resume_input.is_some() {
                    Phase::Reflect
                } else {
                    Phase::Plan
                };
                self.pending_question_ref = None;
                self.waiting_since = None;
            }
        }
        stale
    }

    /// Structural checks used when loading persisted state.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.is_waiting() && self.pending_question_ref.is_none() {
            errors.push("waiting_user without pending_question_ref".to_string());
        }
        if !self.is_waiting() && self.pending_question_ref.is_some() {
            errors.push(format!(
                "pending_question_ref set while phase is {}",
                self.phase
            ));
        }
        if self.is_terminated() && self.termination_reason.is_none() {
            errors.push("terminated without termination_reason".to_string());
        }
        errors
    }
}

/// Enforces one mutating action per cycle.
#[derive(Debug, Default)]
pub struct ActionGuard {
    performed: Option<&'static str>,
}

impl ActionGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn claim(&mut self, label: &'static str) -> Result<(), LoopError> {
        if let Some(first) = self.performed {
            return Err(LoopError::PhaseViolation(format!(
                "second action '{label}' in one cycle (already performed '{first}')"
            )));
        }
        self.performed = Some(label);
        Ok(())
    }

    pub fn performed(&self) -> Option<&'static str> {
        self.performed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_cycle_path_is_legal() {
        let mut state = AgentState::default();
        for to in [
            Phase::Plan,
            Phase::Act,
            Phase::Observe,
            Phase::Reflect,
            Phase::Expand,
            Phase::Decide,
            Phase::Plan,
        ] {
            state.advance(to).expect("legal transition");
        }
    }

    #[test]
    fn skipping_observe_is_a_phase_violation() {
        let mut state = AgentState {
            phase: Phase::Act,
            ..AgentState::default()
        };
        let err = state.advance(Phase::Reflect).unwrap_err();
        assert!(matches!(err, LoopError::PhaseViolation(_)));
        assert_eq!(state.phase, Phase::Act);
    }

    #[test]
    fn waiting_user_cannot_enter_act_directly() {
        assert!(!Phase::WaitingUser.can_transition_to(Phase::Act));
        assert!(Phase::WaitingUser.can_transition_to(Phase::Reflect));
    }

    #[test]
    fn leaving_waiting_clears_pending_question() {
        let mut state = AgentState {
            phase: Phase::WaitingUser,
            pending_question_ref: Some("msg-000001".to_string()),
            ..AgentState::default()
        };
        assert!(state.validate().is_empty());
        state.advance(Phase::Reflect).expect("resume");
        assert!(state.pending_question_ref.is_none());
        assert!(state.validate().is_empty());
    }

    #[test]
    fn crash_mid_cycle_recovers_to_plan() {
        let mut state = AgentState {
            phase: Phase::Observe,
            cycle: 4,
            ..AgentState::default()
        };
        assert!(state.is_interrupted());
        assert_eq!(state.recover_interrupted(None), Phase::Observe);
        assert_eq!(state.phase, Phase::Plan);
        assert!(!state.is_interrupted());

        let resuming = AgentState {
            phase: Phase::Reflect,
            resume_input: Some(Message {
                id: "msg-000002".to_string(),
                direction: crate::core::types::Direction::Inbound,
                kind: crate::core::types::MessageType::Answer,
                task_ref: Some("T1".to_string()),
                body: "main".to_string(),
                timestamp: chrono::Utc::now(),
                sender: crate::core::types::Sender::User,
            }),
            ..AgentState::default()
        };
        assert!(!resuming.is_interrupted());
    }

    #[test]
    fn crash_after_asking_recovers_to_waiting() {
        let asked = Message {
            id: "msg-000003".to_string(),
            direction: crate::core::types::Direction::Outbound,
            kind: crate::core::types::MessageType::Question,
            task_ref: Some("T1".to_string()),
            body: "Which region?".to_string(),
            timestamp: chrono::Utc::now(),
            sender: crate::core::types::Sender::Agent,
        };
        let mut state = AgentState {
            phase: Phase::Decide,
            cycle: 7,
            ..AgentState::default()
        };
        assert_eq!(state.recover_interrupted(Some(&asked)), Phase::Decide);
        assert!(state.is_waiting());
        assert_eq!(state.pending_question_ref.as_deref(), Some("msg-000003"));
        assert_eq!(state.waiting_since, Some(asked.timestamp));
        assert!(!state.is_interrupted());
        assert!(state.validate().is_empty());
    }

    #[test]
    fn second_action_in_a_cycle_is_rejected() {
        let mut guard = ActionGuard::new();
        guard.claim("tool_call").expect("first");
        let err = guard.claim("ask_user").unwrap_err();
        assert!(err.to_string().contains("second action 'ask_user'"));
        assert_eq!(guard.performed(), Some("tool_call"));
    }

    #[test]
    fn phase_serializes_snake_case() {
        let json = serde_json::to_string(&Phase::WaitingUser).expect("serialize");
        assert_eq!(json, "\"waiting_user\"");
    }
}
