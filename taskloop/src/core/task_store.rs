//! Task store: creation, lifecycle transitions, and deterministic selection.
//!
//! Tasks are never deleted; they only move forward through the lifecycle
//! table below until they reach a terminal state.
//!
//! ```text
//! pending -> active
//! active  -> completed | failed | blocked
//! blocked -> active | pending
//! ```
//!
//! User cancellation is the single exception and goes through [`TaskStore::cancel`].

use std::cmp::Ordering;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::LoopError;
use crate::core::types::{Origin, Priority, Task, TaskId, TaskStatus, TraceEntry};

/// Reason recorded on tasks failed through a user cancellation.
pub const USER_CANCELLED: &str = "user-cancelled";

/// Parameters for [`TaskStore::create`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewTask {
    pub origin: Origin,
    pub priority: Priority,
    pub title: String,
    pub justification: Option<String>,
    pub parent: Option<TaskId>,
    /// Explicit id (external intake). Generated from the origin prefix when absent.
    pub id: Option<TaskId>,
    pub context: String,
    pub success_criteria: Vec<String>,
}

impl NewTask {
    pub fn new(origin: Origin, priority: Priority, title: impl Into<String>) -> Self {
        Self {
            origin,
            priority,
            title: title.into(),
            justification: None,
            parent: None,
            id: None,
            context: String::new(),
            success_criteria: Vec::new(),
        }
    }

    pub fn justification(mut self, justification: impl Into<String>) -> Self {
        self.justification = Some(justification.into());
        self
    }

    pub fn parent(mut self, parent: impl Into<TaskId>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn id(mut self, id: impl Into<TaskId>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    pub fn success_criteria(mut self, criteria: Vec<String>) -> Self {
        self.success_criteria = criteria;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStore {
    next_seq: u64,
    tasks: Vec<Task>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn create(&mut self, new: NewTask, now: DateTime<Utc>) -> Result<&Task, LoopError> {
        let justification = new
            .justification
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());
        if new.origin == Origin::Curiosity && justification.is_none() {
            return Err(LoopError::JustificationRequired);
        }
        if let Some(parent) = &new.parent {
            if !self.contains(parent) {
                return Err(LoopError::UnknownTask(parent.clone()));
            }
        }

        // The sequence only advances once the task is certain to be stored.
        let seq = self.next_seq + 1;
        let id = match new.id {
            Some(id) => {
                let id = id.trim().to_string();
                if id.is_empty() {
                    return Err(LoopError::InvalidTaskId(id));
                }
                if self.contains(&id) {
                    return Err(LoopError::DuplicateTask(id));
                }
                id
            }
            None => self.generate_id(new.origin, seq),
        };
        self.next_seq = seq;

        self.tasks.push(Task {
            id,
            origin: new.origin,
            status: TaskStatus::Pending,
            priority: new.priority,
            parent_task_id: new.parent,
            justification,
            title: new.title,
            context: new.context,
            success_criteria: new.success_criteria,
            status_reason: None,
            seq,
            created_at: now,
            updated_at: now,
            progress_trace: Vec::new(),
        });
        Ok(&self.tasks[self.tasks.len() - 1])
    }

    fn generate_id(&self, origin: Origin, seq: u64) -> TaskId {
        let mut n = seq;
        loop {
            let candidate = format!("{}-{:04}", origin.id_prefix(), n);
            if !self.contains(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    pub fn transition(
        &mut self,
        id: &str,
        to: TaskStatus,
        now: DateTime<Utc>,
    ) -> Result<(), LoopError> {
        self.transition_with_reason(id, to, None, now)
    }

    pub fn transition_with_reason(
        &mut self,
        id: &str,
        to: TaskStatus,
        reason: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), LoopError> {
        let from = self
            .get(id)
            .map(|task| task.status)
            .ok_or_else(|| LoopError::UnknownTask(id.to_string()))?;
        if !is_allowed(from, to) {
            return Err(LoopError::InvalidTransition {
                task_id: id.to_string(),
                from,
                to,
            });
        }
        if to == TaskStatus::Active {
            if let Some(active) = self.active_task() {
                return Err(LoopError::ActiveTaskConflict {
                    requested: id.to_string(),
                    active: active.id.clone(),
                });
            }
        }
        let task = self.get_mut(id)?;
        task.status = to;
        task.status_reason = reason.map(str::to_string);
        task.updated_at = now;
        Ok(())
    }

    /// Fail `id` and every live descendant with reason [`USER_CANCELLED`].
    ///
    /// Returns the ids that were failed, root first.
    pub fn cancel(&mut self, id: &str, now: DateTime<Utc>) -> Result<Vec<TaskId>, LoopError> {
        let root = self
            .get(id)
            .ok_or_else(|| LoopError::UnknownTask(id.to_string()))?;
        if root.status.is_terminal() {
            return Err(LoopError::InvalidTransition {
                task_id: id.to_string(),
                from: root.status,
                to: TaskStatus::Failed,
            });
        }

        let mut lineage = vec![id.to_string()];
        let mut cursor = 0;
        while cursor < lineage.len() {
            let parent = lineage[cursor].clone();
            for child in self.children(&parent) {
                if !child.status.is_terminal() {
                    lineage.push(child.id.clone());
                }
            }
            cursor += 1;
        }

        for task_id in &lineage {
            let task = self.get_mut(task_id)?;
            task.status = TaskStatus::Failed;
            task.status_reason = Some(USER_CANCELLED.to_string());
            task.updated_at = now;
        }
        Ok(lineage)
    }

    /// Next pending task by priority, then origin precedence, then creation order.
    pub fn select_next(&self) -> Option<&Task> {
        self.tasks
            .iter()
            .filter(|task| task.status == TaskStatus::Pending)
            .min_by(|a, b| selection_order(a, b))
    }

    pub fn active_task(&self) -> Option<&Task> {
        self.tasks
            .iter()
            .find(|task| task.status == TaskStatus::Active)
    }

    /// Tasks still in play (pending, active or blocked).
    ///
    /// At most one task is ever `active`, so the workload bound applies to
    /// every non-terminal task rather than to that single slot.
    pub fn active_count(&self) -> usize {
        self.tasks
            .iter()
            .filter(|task| !task.status.is_terminal())
            .count()
    }

    pub fn count_status(&self, status: TaskStatus) -> usize {
        self.tasks
            .iter()
            .filter(|task| task.status == status)
            .count()
    }

    pub fn by_origin(&self, origin: Origin) -> usize {
        self.tasks
            .iter()
            .filter(|task| task.origin == origin)
            .count()
    }

    pub fn children<'a>(&'a self, parent: &'a str) -> impl Iterator<Item = &'a Task> + 'a {
        self.tasks
            .iter()
            .filter(move |task| task.parent_task_id.as_deref() == Some(parent))
    }

    /// Append an entry to a task's progress trace.
    pub fn record_trace(&mut self, id: &str, entry: TraceEntry) -> Result<(), LoopError> {
        let task = self.get_mut(id)?;
        task.updated_at = entry.timestamp;
        task.progress_trace.push(entry);
        Ok(())
    }

    /// Ancestors of `id` followed by `id` itself, root first.
    pub fn lineage(&self, id: &str) -> Vec<&Task> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut cursor = self.get(id);
        while let Some(task) = cursor {
            if !seen.insert(task.id.as_str()) {
                break;
            }
            chain.push(task);
            cursor = task
                .parent_task_id
                .as_deref()
                .and_then(|parent| self.get(parent));
        }
        chain.reverse();
        chain
    }

    /// Curiosity-origin tasks in the lineage of `id`, itself included.
    pub fn curiosity_depth(&self, id: &str) -> u32 {
        let depth = self
            .lineage(id)
            .into_iter()
            .filter(|task| task.origin == Origin::Curiosity)
            .count();
        u32::try_from(depth).unwrap_or(u32::MAX)
    }

    /// First task whose title shares more than 70% of the words of `title`.
    pub fn find_similar(&self, title: &str) -> Option<&Task> {
        let wanted = title_words(title);
        if wanted.is_empty() {
            return None;
        }
        self.tasks.iter().find(|task| {
            let overlap = title_words(&task.title).intersection(&wanted).count();
            overlap * 10 > wanted.len() * 7
        })
    }

    /// Progress trace across the lineage of `id`, in cycle order.
    pub fn lineage_trace(&self, id: &str) -> Vec<TraceEntry> {
        let mut entries: Vec<TraceEntry> = self
            .lineage(id)
            .into_iter()
            .flat_map(|task| task.progress_trace.iter().cloned())
            .collect();
        entries.sort_by_key(|entry| entry.cycle);
        entries
    }

    /// Check invariants that serde cannot express. Returns stable messages.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let mut seen = HashSet::new();
        for task in &self.tasks {
            if !seen.insert(task.id.as_str()) {
                errors.push(format!("duplicate task id '{}'", task.id));
            }
            if task.origin == Origin::Curiosity
                && task
                    .justification
                    .as_deref()
                    .is_none_or(|text| text.trim().is_empty())
            {
                errors.push(format!("curiosity task '{}' has no justification", task.id));
            }
            if let Some(parent) = &task.parent_task_id {
                if !self.contains(parent) {
                    errors.push(format!("task '{}' references unknown parent '{}'", task.id, parent));
                }
            }
            if task.seq > self.next_seq {
                errors.push(format!("task '{}' seq {} exceeds store seq {}", task.id, task.seq, self.next_seq));
            }
        }
        let active = self.count_status(TaskStatus::Active);
        if active > 1 {
            errors.push(format!("{active} tasks are active (at most one allowed)"));
        }
        errors
    }

    fn get_mut(&mut self, id: &str) -> Result<&mut Task, LoopError> {
        self.tasks
            .iter_mut()
            .find(|task| task.id == id)
            .ok_or_else(|| LoopError::UnknownTask(id.to_string()))
    }
}

fn title_words(title: &str) -> HashSet<String> {
    title.split_whitespace().map(str::to_lowercase).collect()
}

fn is_allowed(from: TaskStatus, to: TaskStatus) -> bool {
    matches!(
        (from, to),
        (TaskStatus::Pending, TaskStatus::Active)
            | (TaskStatus::Active, TaskStatus::Completed)
            | (TaskStatus::Active, TaskStatus::Failed)
            | (TaskStatus::Active, TaskStatus::Blocked)
            | (TaskStatus::Blocked, TaskStatus::Active)
            | (TaskStatus::Blocked, TaskStatus::Pending)
    )
}

fn selection_order(a: &Task, b: &Task) -> Ordering {
    a.priority
        .rank()
        .cmp(&b.priority.rank())
        .then_with(|| a.origin.precedence().cmp(&b.origin.precedence()))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| a.seq.cmp(&b.seq))
}
