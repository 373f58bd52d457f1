//! Append-only JSONL form of the message store (`messages.jsonl`).

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::debug;

use crate::core::message_store::MessageStore;
use crate::core::types::Message;

/// Load every persisted message. A missing file is an empty store.
pub fn load_messages(path: &Path) -> Result<MessageStore> {
    if !path.exists() {
        return Ok(MessageStore::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read messages {}", path.display()))?;
    let mut messages = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let message: Message = serde_json::from_str(line)
            .with_context(|| format!("parse {} line {}", path.display(), idx + 1))?;
        messages.push(message);
    }
    debug!(path = %path.display(), count = messages.len(), "messages loaded");
    Ok(MessageStore::from_messages(messages))
}

/// Append messages to the log. Existing lines are never rewritten.
pub fn append_messages(path: &Path, messages: &[Message]) -> Result<()> {
    if messages.is_empty() {
        return Ok(());
    }
    let mut buf = String::new();
    for message in messages {
        buf.push_str(&serde_json::to_string(message).context("serialize message")?);
        buf.push('\n');
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(buf.as_bytes())
        .with_context(|| format!("append {}", path.display()))?;
    file.sync_data()
        .with_context(|| format!("sync {}", path.display()))?;
    debug!(path = %path.display(), appended = messages.len(), "messages appended");
    Ok(())
}
