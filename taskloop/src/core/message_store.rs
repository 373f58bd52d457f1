//! Append-only message record.
//!
//! There is no update or delete operation. The durable form is `messages.jsonl`
//! (see `io::message_log`), one line per message, never rewritten.

use crate::core::types::{Direction, Message, MessageId, MessageType};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageStore {
    messages: Vec<Message>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted messages, in log order.
    pub fn from_messages(messages: Vec<Message>) -> Self {
        Self { messages }
    }

    pub fn append(&mut self, message: Message) -> &Message {
        self.messages.push(message);
        &self.messages[self.messages.len() - 1]
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    pub fn all(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Messages whose `task_ref` is `task_id`, in log order.
    pub fn for_task<'a>(&'a self, task_id: &'a str) -> impl Iterator<Item = &'a Message> + 'a {
        self.messages
            .iter()
            .filter(move |message| message.task_ref.as_deref() == Some(task_id))
    }

    /// Deterministic id for the next appended message.
    pub fn next_id(&self) -> MessageId {
        format!("msg-{:06}", self.messages.len() + 1)
    }

    /// Latest outbound question, if no inbound message has arrived after it.
    pub fn unanswered_question(&self) -> Option<&Message> {
        for message in self.messages.iter().rev() {
            match message.direction {
                Direction::Inbound => return None,
                Direction::Outbound if message.kind == MessageType::Question => {
                    return Some(message);
                }
                Direction::Outbound => {}
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::Sender;
    use chrono::{TimeZone, Utc};

    fn message(id: &str, direction: Direction, kind: MessageType, task: Option<&str>) -> Message {
        Message {
            id: id.to_string(),
            direction,
            kind,
            task_ref: task.map(str::to_string),
            body: format!("body of {id}"),
            timestamp: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            sender: match direction {
                Direction::Outbound => Sender::Agent,
                Direction::Inbound => Sender::User,
            },
        }
    }

    #[test]
    fn appended_messages_are_never_altered() {
        let mut store = MessageStore::new();
        let first = message("msg-000001", Direction::Outbound, MessageType::Question, Some("T1"));
        store.append(first.clone());
        store.append(message("msg-000002", Direction::Inbound, MessageType::Answer, Some("T1")));
        assert_eq!(store.get("msg-000001"), Some(&first));
        assert_eq!(store.all()[0], first);
        assert_eq!(store.next_id(), "msg-000003");
    }

    #[test]
    fn for_task_filters_by_reference() {
        let mut store = MessageStore::new();
        store.append(message("msg-000001", Direction::Outbound, MessageType::StatusUpdate, Some("T1")));
        store.append(message("msg-000002", Direction::Outbound, MessageType::StatusUpdate, Some("T2")));
        store.append(message("msg-000003", Direction::Outbound, MessageType::StatusUpdate, None));
        let ids: Vec<&str> = store.for_task("T1").map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["msg-000001"]);
    }

    #[test]
    fn unanswered_question_clears_after_inbound() {
        let mut store = MessageStore::new();
        assert!(store.unanswered_question().is_none());
        store.append(message("msg-000001", Direction::Outbound, MessageType::Question, Some("T1")));
        store.append(message("msg-000002", Direction::Outbound, MessageType::StatusUpdate, Some("T1")));
        assert_eq!(store.unanswered_question().map(|m| m.id.as_str()), Some("msg-000001"));
        store.append(message("msg-000003", Direction::Inbound, MessageType::Answer, Some("T1")));
        assert!(store.unanswered_question().is_none());
    }
}
