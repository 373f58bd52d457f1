//! Durable state snapshots under `.taskloop/state/`.
//!
//! Every snapshot is rewritten atomically (temp file + rename), so a crash
//! leaves either the previous or the new version on disk, never a torn file.

use std::ffi::OsString;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::governor::Budget;
use crate::core::phase::AgentState;
use crate::core::task_store::TaskStore;

pub fn load_tasks(path: &Path) -> Result<TaskStore> {
    let tasks: TaskStore = load_json(path, "tasks")?;
    let errors = tasks.validate();
    if !errors.is_empty() {
        return Err(anyhow!(
            "task store invariants failed in {}: {}",
            path.display(),
            errors.join("; ")
        ));
    }
    debug!(path = %path.display(), tasks = tasks.tasks().len(), "task store loaded");
    Ok(tasks)
}

pub fn write_tasks(path: &Path, tasks: &TaskStore) -> Result<()> {
    write_json(path, tasks)
}

pub fn load_agent_state(path: &Path) -> Result<AgentState> {
    let state: AgentState = load_json(path, "agent state")?;
    let errors = state.validate();
    if !errors.is_empty() {
        return Err(anyhow!(
            "agent state invalid in {}: {}",
            path.display(),
            errors.join("; ")
        ));
    }
    debug!(phase = %state.phase, cycle = state.cycle, "agent state loaded");
    Ok(state)
}

pub fn write_agent_state(path: &Path, state: &AgentState) -> Result<()> {
    debug!(phase = %state.phase, cycle = state.cycle, "writing agent state");
    write_json(path, state)
}

pub fn load_budget(path: &Path) -> Result<Budget> {
    load_json(path, "budget")
}

pub fn write_budget(path: &Path, budget: &Budget) -> Result<()> {
    write_json(path, budget)
}

fn load_json<T: DeserializeOwned>(path: &Path, label: &str) -> Result<T> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {label} {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {label} {}", path.display()))
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .map(OsString::from)
        .with_context(|| format!("path missing file name {}", path.display()))?;
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::phase::{Phase, TerminationReason};
    use crate::core::task_store::NewTask;
    use crate::core::types::{Origin, Priority};
    use chrono::{TimeZone, Utc};

    /// Verifies a populated task store survives write and reload.
    #[test]
    fn task_store_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state/tasks.json");
        let mut tasks = TaskStore::new();
        tasks
            .create(
                NewTask::new(Origin::Curiosity, Priority::Low, "look around").justification("why not"),
                Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            )
            .expect("create");

        write_tasks(&path, &tasks).expect("write");
        assert_eq!(load_tasks(&path).expect("load"), tasks);
        assert!(!temp.path().join("state/tasks.json.tmp").exists());
    }

    /// Verifies invalid persisted state is refused rather than loaded.
    #[test]
    fn waiting_state_without_question_is_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agent_state.json");
        let state = AgentState {
            phase: Phase::WaitingUser,
            ..AgentState::default()
        };
        write_agent_state(&path, &state).expect("write");
        let err = load_agent_state(&path).unwrap_err();
        assert!(err.to_string().contains("pending_question_ref"));
    }

    #[test]
    fn agent_state_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("agent_state.json");
        let state = AgentState {
            phase: Phase::Terminated,
            termination_reason: Some(TerminationReason::BudgetExhausted),
            termination_detail: Some("10 of 10 iterations used".to_string()),
            cycle: 10,
            ..AgentState::default()
        };
        write_agent_state(&path, &state).expect("write");
        assert_eq!(load_agent_state(&path).expect("load"), state);
    }
}
