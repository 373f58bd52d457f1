//! Curiosity governor: hard budgets on iterations, task creation and workload.
//!
//! Limits are enforced, never advisory. Exhausting the iteration budget is
//! fatal for the run; every other limit turns into a denial or a signal the
//! loop controller must handle. Curiosity proposals additionally pass the
//! [`CuriosityPolicy`] screen: value threshold, allowed categories, and how
//! deep a chain of curiosity tasks may grow.

use serde::{Deserialize, Serialize};

use crate::core::error::LoopError;
use crate::core::types::Origin;

/// Budget configuration (`[budget]` in `config.toml`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetLimits {
    pub max_iterations: u32,
    pub max_tasks_created: u32,
    pub max_active_tasks: u32,
    pub max_consecutive_failures: u32,
    /// Also the window size of the progress monitor.
    pub max_no_progress_cycles: u32,
}

impl Default for BudgetLimits {
    fn default() -> Self {
        Self {
            max_iterations: 50,
            max_tasks_created: 10,
            max_active_tasks: 10,
            max_consecutive_failures: 3,
            max_no_progress_cycles: 3,
        }
    }
}

impl BudgetLimits {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        for (name, value) in [
            ("max_iterations", self.max_iterations),
            ("max_tasks_created", self.max_tasks_created),
            ("max_active_tasks", self.max_active_tasks),
            ("max_consecutive_failures", self.max_consecutive_failures),
            ("max_no_progress_cycles", self.max_no_progress_cycles),
        ] {
            if value == 0 {
                errors.push(format!("budget.{name} must be > 0"));
            }
        }
        errors
    }
}

/// Curiosity screening (`[curiosity]` in `config.toml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CuriosityPolicy {
    pub enabled: bool,
    /// Curiosity tasks allowed in the lineage above a new curiosity task.
    pub max_depth: u32,
    /// Minimum `estimated_value` (0.0 to 1.0) a proposal must carry.
    pub min_value: f64,
    /// Curiosity tasks admitted per cycle, best value first.
    pub max_proposals_per_cycle: u32,
    pub categories: Vec<String>,
}

impl Default for CuriosityPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: 2,
            min_value: 0.6,
            max_proposals_per_cycle: 2,
            categories: ["verification", "documentation", "robustness", "exploration"]
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }
}

impl CuriosityPolicy {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if !(0.0..=1.0).contains(&self.min_value) {
            errors.push(format!(
                "curiosity.min_value must be within 0.0..=1.0 (got {})",
                self.min_value
            ));
        }
        if self.max_depth == 0 {
            errors.push("curiosity.max_depth must be > 0 (set enabled = false instead)".to_string());
        }
        if self.max_proposals_per_cycle == 0 {
            errors.push("curiosity.max_proposals_per_cycle must be > 0".to_string());
        }
        if self.categories.iter().all(|category| category.trim().is_empty()) {
            errors.push("curiosity.categories must name at least one category".to_string());
        }
        errors
    }

    /// Value and category screen. A proposal missing either is denied.
    pub fn screen(&self, estimated_value: Option<f64>, category: Option<&str>) -> Option<DenyReason> {
        if !self.enabled {
            return Some(DenyReason::Disabled);
        }
        if estimated_value.is_none_or(|value| value.is_nan() || value < self.min_value) {
            return Some(DenyReason::LowValue);
        }
        let category = category.map(str::trim).unwrap_or_default();
        let allowed = self
            .categories
            .iter()
            .any(|known| known.trim().eq_ignore_ascii_case(category));
        if category.is_empty() || !allowed {
            return Some(DenyReason::Category);
        }
        None
    }
}

/// Limits plus live counters. Persisted as `state/budget.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Budget {
    pub limits: BudgetLimits,
    pub iterations_used: u32,
    pub tasks_created: u32,
    /// Live task count observed at the latest admission or sync.
    pub active_count: u32,
    pub consecutive_failures: u32,
    pub no_progress_streak: u32,
}

/// `max - used` for each limit, saturating at zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetRemaining {
    pub iterations: u32,
    pub tasks_created: u32,
    pub active_tasks: u32,
    pub consecutive_failures: u32,
    pub no_progress_cycles: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionContext {
    pub active_count: usize,
    pub waiting_user: bool,
    /// Curiosity tasks in the lineage of the proposing task, itself included.
    pub curiosity_depth: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    WaitingUser,
    TaskLimit,
    ActiveLimit,
    MissingJustification,
    Disabled,
    DepthLimit,
    LowValue,
    Category,
    CycleLimit,
    Duplicate,
}

impl DenyReason {
    pub fn as_str(self) -> &'static str {
        match self {
            DenyReason::WaitingUser => "waiting_user",
            DenyReason::TaskLimit => "task_limit",
            DenyReason::ActiveLimit => "active_limit",
            DenyReason::MissingJustification => "missing_justification",
            DenyReason::Disabled => "disabled",
            DenyReason::DepthLimit => "depth_limit",
            DenyReason::LowValue => "low_value",
            DenyReason::Category => "category",
            DenyReason::CycleLimit => "cycle_limit",
            DenyReason::Duplicate => "duplicate",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allow,
    Deny(DenyReason),
}

impl Admission {
    pub fn is_allowed(self) -> bool {
        matches!(self, Admission::Allow)
    }
}

/// Raised once consecutive failures reach the configured ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureCeiling {
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CuriosityGovernor {
    budget: Budget,
    policy: CuriosityPolicy,
}

impl CuriosityGovernor {
    pub fn new(limits: BudgetLimits) -> Self {
        Self::from_budget(Budget {
            limits,
            ..Budget::default()
        })
    }

    pub fn from_budget(budget: Budget) -> Self {
        Self {
            budget,
            policy: CuriosityPolicy::default(),
        }
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    pub fn policy(&self) -> &CuriosityPolicy {
        &self.policy
    }

    pub fn set_policy(&mut self, policy: CuriosityPolicy) {
        self.policy = policy;
    }

    /// Replace the limits, keeping live counters (config changes between runs).
    pub fn set_limits(&mut self, limits: BudgetLimits) {
        self.budget.limits = limits;
    }

    pub fn is_exhausted(&self) -> bool {
        self.budget.iterations_used >= self.budget.limits.max_iterations
    }

    fn ensure_not_exhausted(&self) -> Result<(), LoopError> {
        if self.is_exhausted() {
            return Err(LoopError::BudgetExhausted(format!(
                "{} of {} iterations used",
                self.budget.iterations_used, self.budget.limits.max_iterations
            )));
        }
        Ok(())
    }

    pub fn sync_active_count(&mut self, active_count: usize) {
        self.budget.active_count = saturate(active_count);
    }

    /// Gate for curiosity-origin proposals. Counts the task on allow.
    pub fn admit_curiosity_task(
        &mut self,
        justification: &str,
        ctx: AdmissionContext,
    ) -> Result<Admission, LoopError> {
        if ctx.waiting_user {
            return Ok(Admission::Deny(DenyReason::WaitingUser));
        }
        self.ensure_not_exhausted()?;
        self.sync_active_count(ctx.active_count);
        if !self.policy.enabled {
            return Ok(Admission::Deny(DenyReason::Disabled));
        }
        if ctx.curiosity_depth >= self.policy.max_depth {
            return Ok(Admission::Deny(DenyReason::DepthLimit));
        }
        if justification.trim().is_empty() {
            return Ok(Admission::Deny(DenyReason::MissingJustification));
        }
        self.admit_counted()
    }

    /// Gate for plan- and recovery-origin tasks the loop creates itself.
    pub fn admit_derived_task(
        &mut self,
        origin: Origin,
        ctx: AdmissionContext,
    ) -> Result<Admission, LoopError> {
        match origin {
            Origin::Plan | Origin::Recovery => {}
            Origin::User | Origin::Curiosity => {
                return Err(LoopError::PhaseViolation(format!(
                    "{origin} tasks are not admitted as derived tasks"
                )));
            }
        }
        if ctx.waiting_user {
            return Ok(Admission::Deny(DenyReason::WaitingUser));
        }
        self.ensure_not_exhausted()?;
        self.sync_active_count(ctx.active_count);
        self.admit_counted()
    }

    fn admit_counted(&mut self) -> Result<Admission, LoopError> {
        let limits = self.budget.limits;
        if self.budget.tasks_created >= limits.max_tasks_created {
            return Ok(Admission::Deny(DenyReason::TaskLimit));
        }
        if self.budget.active_count >= limits.max_active_tasks {
            return Ok(Admission::Deny(DenyReason::ActiveLimit));
        }
        self.budget.tasks_created += 1;
        self.budget.active_count += 1;
        Ok(Admission::Allow)
    }

    /// Count one loop cycle. Fails once the iteration budget is spent.
    pub fn record_iteration(&mut self) -> Result<(), LoopError> {
        self.ensure_not_exhausted()?;
        self.budget.iterations_used += 1;
        Ok(())
    }

    pub fn record_failure(&mut self) -> Option<FailureCeiling> {
        self.budget.consecutive_failures += 1;
        (self.budget.consecutive_failures >= self.budget.limits.max_consecutive_failures).then_some(
            FailureCeiling {
                consecutive_failures: self.budget.consecutive_failures,
            },
        )
    }

    pub fn record_success(&mut self) {
        self.budget.consecutive_failures = 0;
    }

    /// Acknowledge a handled failure ceiling.
    pub fn clear_failures(&mut self) {
        self.budget.consecutive_failures = 0;
    }

    /// Track reflection's progress verdict. Returns true when the streak
    /// reaches `max_no_progress_cycles`.
    pub fn record_progress(&mut self, made_progress: bool) -> bool {
        if made_progress {
            self.budget.no_progress_streak = 0;
            return false;
        }
        self.budget.no_progress_streak += 1;
        self.budget.no_progress_streak >= self.budget.limits.max_no_progress_cycles
    }

    pub fn clear_no_progress(&mut self) {
        self.budget.no_progress_streak = 0;
    }

    pub fn remaining(&self) -> BudgetRemaining {
        let b = &self.budget;
        BudgetRemaining {
            iterations: b.limits.max_iterations.saturating_sub(b.iterations_used),
            tasks_created: b.limits.max_tasks_created.saturating_sub(b.tasks_created),
            active_tasks: b.limits.max_active_tasks.saturating_sub(b.active_count),
            consecutive_failures: b
                .limits
                .max_consecutive_failures
                .saturating_sub(b.consecutive_failures),
            no_progress_cycles: b
                .limits
                .max_no_progress_cycles
                .saturating_sub(b.no_progress_streak),
        }
    }

    /// Maintenance boundary: zero every counter except the live task count.
    pub fn reset(&mut self) {
        self.budget = Budget {
            limits: self.budget.limits,
            active_count: self.budget.active_count,
            ..Budget::default()
        };
    }
}

fn saturate(value: usize) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
