//! Product logs: `events.jsonl` and per-cycle records under `cycles/`.
//!
//! Always written, independent of `RUST_LOG`.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::phase::Phase;
use crate::core::types::{Action, MessageId, Observation, TaskId};
use crate::io::reasoner::ReasoningOutput;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PhaseTransition,
    TaskTransition,
    TaskCreated,
    ProposalDenied,
    MessageSent,
    MessageReceived,
    InboundRejected,
    ContractViolation,
    ReflectionRetry,
    InterruptedCycle,
    BudgetReset,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopEvent {
    pub seq: u64,
    pub cycle: u64,
    pub kind: EventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<TaskId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl LoopEvent {
    pub fn phase(cycle: u64, from: Phase, to: Phase, at: DateTime<Utc>) -> Self {
        Self {
            seq: 0,
            cycle,
            kind: EventKind::PhaseTransition,
            from: Some(from.as_str().to_string()),
            to: Some(to.as_str().to_string()),
            task_id: None,
            detail: None,
            at,
        }
    }

    pub fn new(cycle: u64, kind: EventKind, at: DateTime<Utc>) -> Self {
        Self {
            seq: 0,
            cycle,
            kind,
            from: None,
            to: None,
            task_id: None,
            detail: None,
            at,
        }
    }

    pub fn task(mut self, task_id: impl Into<TaskId>) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn states(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.from = Some(from.into());
        self.to = Some(to.into());
        self
    }
}

/// Summary of one completed cycle (`cycles/<cycle>.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub task_id: Option<TaskId>,
    pub action: Option<Action>,
    pub fingerprint: Option<String>,
    pub observation: Option<Observation>,
    pub reflection: Option<ReasoningOutput>,
    /// Phase the cycle ended in.
    pub decision: Phase,
    pub signals: Vec<String>,
    pub created_tasks: Vec<TaskId>,
    pub messages: Vec<MessageId>,
}

/// Number of events already logged; the next event gets this value plus one.
pub fn count_events(path: &Path) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read events {}", path.display()))?;
    Ok(contents.lines().filter(|line| !line.trim().is_empty()).count() as u64)
}

pub fn load_events(path: &Path) -> Result<Vec<LoopEvent>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read events {}", path.display()))?;
    contents
        .lines()
        .filter(|line| !line.trim().is_empty())
        .enumerate()
        .map(|(idx, line)| {
            serde_json::from_str(line)
                .with_context(|| format!("parse {} line {}", path.display(), idx + 1))
        })
        .collect()
}

/// Append events, numbering them after the `already_logged` existing lines.
pub fn append_events(path: &Path, already_logged: u64, events: &[LoopEvent]) -> Result<u64> {
    if events.is_empty() {
        return Ok(already_logged);
    }
    let mut seq = already_logged;
    let mut buf = String::new();
    for event in events {
        seq += 1;
        let numbered = LoopEvent {
            seq,
            ..event.clone()
        };
        buf.push_str(&serde_json::to_string(&numbered).context("serialize event")?);
        buf.push('\n');
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(buf.as_bytes())
        .with_context(|| format!("append {}", path.display()))?;
    Ok(seq)
}

pub fn write_cycle(path: &Path, record: &CycleRecord) -> Result<()> {
    super::store::write_json(path, record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    /// Verifies sequence numbers continue across separate appends.
    #[test]
    fn event_sequence_continues_across_appends() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("events.jsonl");

        let seq = append_events(&path, 0, &[LoopEvent::phase(1, Phase::Initialise, Phase::Plan, at())])
            .expect("append");
        assert_eq!(seq, 1);
        let logged = count_events(&path).expect("count");
        let seq = append_events(
            &path,
            logged,
            &[
                LoopEvent::phase(1, Phase::Plan, Phase::Act, at()),
                LoopEvent::new(1, EventKind::TaskTransition, at())
                    .task("USR-0001")
                    .states("pending", "active"),
            ],
        )
        .expect("append");
        assert_eq!(seq, 3);

        let events = load_events(&path).expect("load");
        let seqs: Vec<u64> = events.iter().map(|event| event.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(events[1].to.as_deref(), Some("act"));
        assert_eq!(events[2].task_id.as_deref(), Some("USR-0001"));
    }

    #[test]
    fn phase_event_omits_empty_fields_on_the_wire() {
        let json = serde_json::to_string(&LoopEvent::phase(2, Phase::Decide, Phase::WaitingUser, at()))
            .expect("serialize");
        assert!(json.contains("\"kind\":\"phase_transition\""));
        assert!(json.contains("\"to\":\"waiting_user\""));
        assert!(!json.contains("task_id"));
    }
}
