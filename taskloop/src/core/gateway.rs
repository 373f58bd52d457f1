//! Messaging gateway: outbound messages and the waiting/resume protocol.
//!
//! The gateway owns the rule that the loop only waits on a well-formed
//! question, and that only authenticated user input ends a wait. It never
//! touches the task store; inbound directives are handed to the controller.

use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::error::LoopError;
use crate::core::message_store::MessageStore;
use crate::core::phase::{AgentState, Phase};
use crate::core::task_store::TaskStore;
use crate::core::types::{Direction, Message, MessageType, Sender, TaskId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayState {
    Running,
    WaitingUser,
}

impl GatewayState {
    pub fn of(state: &AgentState) -> Self {
        if state.is_waiting() {
            GatewayState::WaitingUser
        } else {
            GatewayState::Running
        }
    }
}

/// Unvalidated inbound message as received from a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawInbound {
    pub kind: MessageType,
    pub task_ref: Option<TaskId>,
    pub body: String,
    pub sender: Sender,
    /// Channel credential, checked by [`SharedToken`].
    pub token: Option<String>,
}

impl RawInbound {
    pub fn from_user(kind: MessageType, task_ref: Option<&str>, body: impl Into<String>) -> Self {
        Self {
            kind,
            task_ref: task_ref.map(str::to_string),
            body: body.into(),
            sender: Sender::User,
            token: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Decides whether an inbound message comes from the legitimate user channel.
pub trait Authenticator {
    fn authenticate(&self, raw: &RawInbound) -> bool;
}

/// Trusts every message that claims `sender = user` (single local operator).
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalChannel;

impl Authenticator for LocalChannel {
    fn authenticate(&self, raw: &RawInbound) -> bool {
        raw.sender == Sender::User
    }
}

/// Requires the configured token on every inbound message.
#[derive(Debug, Clone)]
pub struct SharedToken {
    token: String,
}

impl SharedToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl Authenticator for SharedToken {
    fn authenticate(&self, raw: &RawInbound) -> bool {
        raw.sender == Sender::User && raw.token.as_deref() == Some(self.token.as_str())
    }
}

/// Control verbs carried by `instruction` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Fail the referenced task and its live descendants.
    Cancel,
    /// Leave `waiting_user` without an answer.
    Resume,
}

pub fn parse_directive(message: &Message) -> Option<Directive> {
    static DIRECTIVE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"^\s*/(cancel|resume)\b").unwrap());
    if message.kind != MessageType::Instruction {
        return None;
    }
    let caps = DIRECTIVE_RE.captures(&message.body)?;
    match &caps[1] {
        "cancel" => Some(Directive::Cancel),
        _ => Some(Directive::Resume),
    }
}

/// Result of a successful [`MessagingGateway::receive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message: Message,
    /// True when the message ended a wait.
    pub resumed: bool,
}

pub struct MessagingGateway {
    auth: Box<dyn Authenticator>,
}

impl MessagingGateway {
    pub fn new(auth: Box<dyn Authenticator>) -> Self {
        Self { auth }
    }

    pub fn local() -> Self {
        Self::new(Box::new(LocalChannel))
    }

    /// Build and append an outbound agent message.
    pub fn send(
        &self,
        messages: &mut MessageStore,
        kind: MessageType,
        task_ref: Option<&str>,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<Message, LoopError> {
        let body = body.trim();
        let task_ref = task_ref.map(str::trim).filter(|id| !id.is_empty());
        if kind == MessageType::Question {
            if body.is_empty() {
                return Err(LoopError::MalformedQuestion("body is empty".to_string()));
            }
            if task_ref.is_none() {
                return Err(LoopError::MalformedQuestion(
                    "question does not reference a task".to_string(),
                ));
            }
        }
        if kind.is_inbound_kind() {
            return Err(LoopError::MessageValidation(format!(
                "agent cannot send '{kind}' messages"
            )));
        }
        if body.is_empty() {
            return Err(LoopError::MessageValidation(format!("{kind} body is empty")));
        }
        let message = Message {
            id: messages.next_id(),
            direction: Direction::Outbound,
            kind,
            task_ref: task_ref.map(str::to_string),
            body: body.to_string(),
            timestamp: now,
            sender: Sender::Agent,
        };
        Ok(messages.append(message).clone())
    }

    /// Enter `waiting_user` on an already sent question.
    ///
    /// The state is left untouched when the question is malformed.
    pub fn await_answer(
        &self,
        state: &mut AgentState,
        question: &Message,
        now: DateTime<Utc>,
    ) -> Result<(), LoopError> {
        check_question(question)?;
        state.advance(Phase::WaitingUser)?;
        state.pending_question_ref = Some(question.id.clone());
        state.waiting_since = Some(now);
        Ok(())
    }

    /// Send a follow-up question for the pending one and wait on it instead.
    pub fn reask(
        &self,
        messages: &mut MessageStore,
        state: &mut AgentState,
        body: &str,
        now: DateTime<Utc>,
    ) -> Result<Message, LoopError> {
        if !state.is_waiting() {
            return Err(LoopError::PhaseViolation(format!(
                "re-ask outside waiting_user (phase {})",
                state.phase
            )));
        }
        let task_ref = state
            .pending_question_ref
            .as_deref()
            .and_then(|id| messages.get(id))
            .and_then(|question| question.task_ref.clone());
        let question = self.send(messages, MessageType::Question, task_ref.as_deref(), body, now)?;
        state.pending_question_ref = Some(question.id.clone());
        state.waiting_since = Some(now);
        Ok(question)
    }

    /// Validate, authenticate and append an inbound message.
    ///
    /// While waiting, the message ends the wait: the state moves to `reflect`
    /// with the message as resume input. While running, it is queued for the
    /// next reflection. Rejected input leaves every store untouched.
    pub fn receive(
        &self,
        raw: RawInbound,
        tasks: &TaskStore,
        messages: &mut MessageStore,
        state: &mut AgentState,
        now: DateTime<Utc>,
    ) -> Result<Delivery, LoopError> {
        if !self.auth.authenticate(&raw) {
            return Err(LoopError::SpoofRejected);
        }
        if !raw.kind.is_inbound_kind() {
            return Err(LoopError::MessageValidation(format!(
                "user cannot send '{}' messages",
                raw.kind
            )));
        }
        let body = raw.body.trim();
        if body.is_empty() {
            return Err(LoopError::MessageValidation("body is empty".to_string()));
        }
        let task_ref = raw.task_ref.map(|id| id.trim().to_string()).filter(|id| !id.is_empty());
        if let Some(id) = &task_ref {
            if !tasks.contains(id) {
                return Err(LoopError::MessageValidation(format!(
                    "task_ref '{id}' does not exist"
                )));
            }
        }

        let message = Message {
            id: messages.next_id(),
            direction: Direction::Inbound,
            kind: raw.kind,
            task_ref,
            body: body.to_string(),
            timestamp: now,
            sender: Sender::User,
        };

        let resumed = state.is_waiting();
        match (resumed, parse_directive(&message)) {
            // `/resume` skips the reflection on the answer and plans again.
            (true, Some(Directive::Resume)) => {
                state.advance(Phase::Plan)?;
                state.inbound_queue.push(message.clone());
            }
            (true, _) => {
                state.advance(Phase::Reflect)?;
                state.resume_input = Some(message.clone());
            }
            (false, _) => state.inbound_queue.push(message.clone()),
        }
        messages.append(message.clone());
        Ok(Delivery { message, resumed })
    }
}

fn check_question(question: &Message) -> Result<(), LoopError> {
    if question.kind != MessageType::Question || question.direction != Direction::Outbound {
        return Err(LoopError::MalformedQuestion(format!(
            "message {} is not an outbound question",
            question.id
        )));
    }
    if question.body.trim().is_empty() {
        return Err(LoopError::MalformedQuestion("body is empty".to_string()));
    }
    if question.task_ref.as_deref().is_none_or(|id| id.trim().is_empty()) {
        return Err(LoopError::MalformedQuestion(
            "question does not reference a task".to_string(),
        ));
    }
    Ok(())
}
