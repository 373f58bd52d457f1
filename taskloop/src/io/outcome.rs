//! Task outcome records written on terminalization and on blocking.

use std::fs;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::init::HomePaths;
use crate::core::types::{Origin, Task, TaskId};

const OUTCOME_TEMPLATE: &str = include_str!("prompts/outcome.md");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Complete,
    Blocked,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            OutcomeStatus::Complete => "complete",
            OutcomeStatus::Blocked => "blocked",
            OutcomeStatus::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: TaskId,
    pub title: String,
    pub origin: Origin,
    pub status: OutcomeStatus,
    pub summary: String,
    #[serde(default)]
    pub approach: String,
    #[serde(default)]
    pub artifacts: Vec<String>,
    #[serde(default)]
    pub follow_ups: Vec<String>,
    pub cycle: u64,
    pub at: DateTime<Utc>,
}

impl TaskOutcome {
    pub fn for_task(task: &Task, status: OutcomeStatus, summary: impl Into<String>) -> Self {
        Self {
            task_id: task.id.clone(),
            title: task.title.clone(),
            origin: task.origin,
            status,
            summary: summary.into(),
            approach: String::new(),
            artifacts: Vec::new(),
            follow_ups: Vec::new(),
            cycle: 0,
            at: task.updated_at,
        }
    }

    /// One-line text for the outbound `completion_summary`/`status_update` message.
    pub fn message_body(&self) -> String {
        format!(
            "Task {} ({}) is {}: {}",
            self.task_id,
            self.title,
            self.status.as_str(),
            self.summary
        )
    }
}

pub fn render_outcome(outcome: &TaskOutcome) -> Result<String> {
    let mut env = Environment::new();
    env.add_template("outcome", OUTCOME_TEMPLATE)
        .context("load outcome template")?;
    let template = env.get_template("outcome")?;
    let rendered = template
        .render(context! {
            outcome => context! {
                task_id => &outcome.task_id,
                title => &outcome.title,
                origin => outcome.origin.as_str(),
                status => outcome.status.as_str(),
                summary => outcome.summary.trim(),
                approach => (!outcome.approach.trim().is_empty()).then(|| outcome.approach.trim()),
                artifacts => &outcome.artifacts,
                follow_ups => &outcome.follow_ups,
                cycle => outcome.cycle,
                at => outcome.at.to_rfc3339(),
            },
        })
        .context("render outcome report")?;
    Ok(rendered)
}

/// Write `outcomes/<task_id>.json` and the rendered `outcomes/<task_id>.md`.
pub fn write_outcome(paths: &HomePaths, outcome: &TaskOutcome) -> Result<()> {
    fs::create_dir_all(&paths.outcomes_dir)
        .with_context(|| format!("create directory {}", paths.outcomes_dir.display()))?;
    super::store::write_json(&paths.outcome_json_path(&outcome.task_id), outcome)?;
    let report = render_outcome(outcome)?;
    let md_path = paths.outcome_md_path(&outcome.task_id);
    fs::write(&md_path, report).with_context(|| format!("write {}", md_path.display()))?;
    debug!(task_id = %outcome.task_id, status = outcome.status.as_str(), "outcome written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn outcome() -> TaskOutcome {
        TaskOutcome {
            task_id: "USR-0001".to_string(),
            title: "Fix the flaky login test".to_string(),
            origin: Origin::User,
            status: OutcomeStatus::Complete,
            summary: "Login test is stable.".to_string(),
            approach: "Replaced the sleep with an explicit wait.".to_string(),
            artifacts: vec!["tests/login.rs".to_string()],
            follow_ups: Vec::new(),
            cycle: 4,
            at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn report_lists_sections_that_have_content() {
        let report = render_outcome(&outcome()).expect("render");
        assert!(report.starts_with("# USR-0001: Fix the flaky login test"));
        assert!(report.contains("status: **complete**"));
        assert!(report.contains("## Approach"));
        assert!(report.contains("- tests/login.rs"));
        assert!(!report.contains("## Follow-ups"));
    }

    /// Verifies both the JSON record and the markdown report land in outcomes/.
    #[test]
    fn write_outcome_creates_json_and_markdown() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = HomePaths::under(temp.path());
        write_outcome(&paths, &outcome()).expect("write");

        let json = fs::read_to_string(paths.outcome_json_path("USR-0001")).expect("json");
        let parsed: TaskOutcome = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, outcome());
        assert!(paths.outcome_md_path("USR-0001").is_file());
    }
}
