//! Escalation hook for questions that stay unanswered.
//!
//! The core never times out a question on its own. The controller asks the
//! configured policy what to do whenever a cycle is requested while waiting.

use chrono::{DateTime, Duration, Utc};

use crate::core::types::Message;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Escalation {
    /// Keep waiting.
    Wait,
    /// Send a new question and wait on it instead.
    ReAsk { body: String },
    /// Give up on the run.
    Terminate { detail: String },
}

pub trait EscalationPolicy {
    fn on_silence(
        &self,
        question: &Message,
        waiting_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Escalation;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NeverEscalate;

impl EscalationPolicy for NeverEscalate {
    fn on_silence(&self, _: &Message, _: DateTime<Utc>, _: DateTime<Utc>) -> Escalation {
        Escalation::Wait
    }
}

/// Re-asks once `after` has elapsed since the pending question was sent.
#[derive(Debug, Clone, Copy)]
pub struct ReAskAfter {
    after: Duration,
}

impl ReAskAfter {
    pub fn new(after: Duration) -> Self {
        Self { after }
    }
}

impl EscalationPolicy for ReAskAfter {
    fn on_silence(
        &self,
        question: &Message,
        waiting_since: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Escalation {
        if now - waiting_since < self.after {
            return Escalation::Wait;
        }
        let task = question.task_ref.as_deref().unwrap_or("the current task");
        Escalation::ReAsk {
            body: format!(
                "Reminder, still waiting on {task} since {}: {}",
                waiting_since.format("%Y-%m-%d %H:%M UTC"),
                question.body
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Direction, MessageType, Sender};
    use chrono::TimeZone;

    fn question() -> Message {
        Message {
            id: "msg-000001".to_string(),
            direction: Direction::Outbound,
            kind: MessageType::Question,
            task_ref: Some("T1".to_string()),
            body: "Which branch should I target?".to_string(),
            timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            sender: Sender::Agent,
        }
    }

    #[test]
    fn never_escalate_always_waits() {
        let since = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        let later = since + Duration::days(30);
        assert_eq!(NeverEscalate.on_silence(&question(), since, later), Escalation::Wait);
    }

    #[test]
    fn reask_after_waits_then_reasks_with_original_question() {
        let policy = ReAskAfter::new(Duration::hours(24));
        let since = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(
            policy.on_silence(&question(), since, since + Duration::hours(23)),
            Escalation::Wait
        );
        match policy.on_silence(&question(), since, since + Duration::hours(24)) {
            Escalation::ReAsk { body } => {
                assert!(body.contains("T1"));
                assert!(body.contains("Which branch should I target?"));
            }
            other => panic!("expected re-ask, got {other:?}"),
        }
    }
}
