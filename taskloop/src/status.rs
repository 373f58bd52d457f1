//! Status query: a read-only view of the loop for dashboards and the CLI.
//!
//! Reading never takes part in a cycle, so it is safe while another process
//! drives the loop.

use std::collections::BTreeMap;
use std::fmt;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::governor::{BudgetRemaining, CuriosityGovernor};
use crate::core::message_store::MessageStore;
use crate::core::phase::{AgentState, Phase, TerminationReason};
use crate::core::task_store::TaskStore;
use crate::core::types::{MessageId, TaskId, TaskStatus};
use crate::io::config::load_config;
use crate::io::init::HomePaths;
use crate::io::message_log::load_messages;
use crate::io::store::{load_agent_state, load_budget, load_tasks};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub current_phase: Phase,
    pub cycle: u64,
    /// Tasks still in play (pending, active or blocked).
    pub active_task_count: usize,
    pub current_task: Option<TaskId>,
    pub budget_remaining: BudgetRemaining,
    pub pending_question: Option<PendingQuestion>,
    pub termination: Option<Termination>,
    pub tasks_by_status: BTreeMap<&'static str, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingQuestion {
    pub id: MessageId,
    pub task_ref: Option<TaskId>,
    pub body: String,
    pub waiting_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Termination {
    pub reason: TerminationReason,
    pub detail: Option<String>,
}

pub fn status_report(
    tasks: &TaskStore,
    governor: &CuriosityGovernor,
    state: &AgentState,
    messages: &MessageStore,
) -> StatusReport {
    let pending_question = state
        .pending_question_ref
        .as_deref()
        .and_then(|id| messages.get(id))
        .map(|question| PendingQuestion {
            id: question.id.clone(),
            task_ref: question.task_ref.clone(),
            body: question.body.clone(),
            waiting_since: state.waiting_since,
        });
    let termination = state.termination_reason.map(|reason| Termination {
        reason,
        detail: state.termination_detail.clone(),
    });
    let tasks_by_status = TaskStatus::ALL
        .into_iter()
        .map(|status| (status.as_str(), tasks.count_status(status)))
        .collect();
    StatusReport {
        current_phase: state.phase,
        cycle: state.cycle,
        active_task_count: tasks.active_count(),
        current_task: state.current_task.clone(),
        budget_remaining: governor.remaining(),
        pending_question,
        termination,
        tasks_by_status,
    }
}

/// Build a status report straight from the files of an agent home.
pub fn load_status(paths: &HomePaths) -> Result<StatusReport> {
    let config = load_config(&paths.config_path)?;
    let tasks = load_tasks(&paths.tasks_path)?;
    let state = load_agent_state(&paths.agent_state_path)?;
    let mut governor = CuriosityGovernor::from_budget(load_budget(&paths.budget_path)?);
    governor.set_limits(config.budget);
    let messages = load_messages(&paths.messages_path)?;
    Ok(status_report(&tasks, &governor, &state, &messages))
}

impl fmt::Display for StatusReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "phase: {} (cycle {})", self.current_phase, self.cycle)?;
        if let Some(termination) = &self.termination {
            write!(f, "terminated: {}", termination.reason.as_str())?;
            if let Some(detail) = &termination.detail {
                write!(f, " ({detail})")?;
            }
            writeln!(f)?;
        }
        if let Some(task) = &self.current_task {
            writeln!(f, "current task: {task}")?;
        }
        let counts: Vec<String> = self
            .tasks_by_status
            .iter()
            .filter(|(_, count)| **count > 0)
            .map(|(status, count)| format!("{status}={count}"))
            .collect();
        writeln!(
            f,
            "tasks: {} in play [{}]",
            self.active_task_count,
            counts.join(", ")
        )?;
        let budget = &self.budget_remaining;
        writeln!(
            f,
            "budget remaining: iterations={} tasks_created={} active_tasks={} consecutive_failures={} no_progress_cycles={}",
            budget.iterations,
            budget.tasks_created,
            budget.active_tasks,
            budget.consecutive_failures,
            budget.no_progress_cycles
        )?;
        if let Some(question) = &self.pending_question {
            writeln!(
                f,
                "waiting on {} ({}): {}",
                question.id,
                question.task_ref.as_deref().unwrap_or("-"),
                question.body
            )?;
        }
        Ok(())
    }
}
