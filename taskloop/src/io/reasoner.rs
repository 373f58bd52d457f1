//! Reasoning collaborator: maps loop context to the next action and proposals.
//!
//! The [`Reasoner`] trait decouples the controller from the engine. The
//! production [`CommandReasoner`] pipes a rendered prompt into an external
//! command and reads one JSON object back; tests use scripted reasoners.

use std::process::Command;

use anyhow::{Context, Result, anyhow};
use jsonschema::Validator;
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::governor::BudgetRemaining;
use crate::core::types::{Action, Message, Observation, Origin, Priority, Task, TraceEntry};
use crate::io::config::ReasoningConfig;
use crate::io::process::run_command_with_timeout;

const REASONING_TEMPLATE: &str = include_str!("prompts/reasoning.md");
const OUTPUT_SCHEMA: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/schemas/reasoning_output.schema.json"
));

/// Everything the engine sees for one reflection.
#[derive(Debug, Clone, Copy)]
pub struct ReasoningContext<'a> {
    pub cycle: u64,
    pub task: &'a Task,
    /// Tail of the lineage trace, oldest first.
    pub trace: &'a [TraceEntry],
    pub action: Option<&'a Action>,
    pub observation: Option<&'a Observation>,
    /// Authoritative user input since the last reflection.
    pub inbound: &'a [Message],
    /// Loop signals the engine should react to (stagnation, failures).
    pub signals: &'a [String],
    pub budget: BudgetRemaining,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskProposal {
    pub origin: Origin,
    pub title: String,
    #[serde(default)]
    pub justification: Option<String>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub context: String,
    /// Engine's estimate of the curiosity payoff, 0.0 to 1.0.
    #[serde(default)]
    pub estimated_value: Option<f64>,
    /// Curiosity category, checked against `[curiosity].categories`.
    #[serde(default)]
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReasoningOutput {
    #[serde(default)]
    pub plan_update: Option<String>,
    /// Next action for the current task, if the engine has one.
    #[serde(default)]
    pub action: Option<Action>,
    #[serde(default)]
    pub new_task_proposals: Vec<TaskProposal>,
    #[serde(default = "default_progress")]
    pub progress_made: bool,
}

fn default_progress() -> bool {
    true
}

impl Default for ReasoningOutput {
    fn default() -> Self {
        Self {
            plan_update: None,
            action: None,
            new_task_proposals: Vec::new(),
            progress_made: true,
        }
    }
}

pub trait Reasoner {
    /// An error here is a reflection failure; the controller retries it.
    fn reflect(&self, ctx: &ReasoningContext<'_>) -> Result<ReasoningOutput>;
}

/// Reasoner backed by an external command.
pub struct CommandReasoner {
    config: ReasoningConfig,
    env: Environment<'static>,
    validator: Validator,
}

impl CommandReasoner {
    pub fn new(config: ReasoningConfig) -> Result<Self> {
        let mut env = Environment::new();
        env.add_template("reasoning", REASONING_TEMPLATE)
            .context("load reasoning template")?;
        let schema: Value =
            serde_json::from_str(OUTPUT_SCHEMA).context("parse reasoning output schema")?;
        let validator = jsonschema::validator_for(&schema)
            .map_err(|err| anyhow!("invalid reasoning output schema: {err}"))?;
        Ok(Self {
            config,
            env,
            validator,
        })
    }

    pub fn render_prompt(&self, ctx: &ReasoningContext<'_>) -> Result<String> {
        let template = self.env.get_template("reasoning")?;
        let action = ctx
            .action
            .map(serde_json::to_string_pretty)
            .transpose()
            .context("serialize action")?;
        let rendered = template.render(context! {
            task => ctx.task,
            trace => ctx.trace,
            action => action,
            observation => ctx.observation,
            inbound => ctx.inbound,
            signals => ctx.signals,
            budget => ctx.budget,
        })?;
        Ok(rendered)
    }

    fn parse_output(&self, stdout: &str) -> Result<ReasoningOutput> {
        let value = extract_json(stdout)?;
        let errors: Vec<String> = self
            .validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !errors.is_empty() {
            return Err(anyhow!(
                "reasoning output failed schema validation: {}",
                errors.join("; ")
            ));
        }
        serde_json::from_value(value).context("deserialize reasoning output")
    }
}

impl Reasoner for CommandReasoner {
    #[instrument(skip_all, fields(cycle = ctx.cycle, task_id = %ctx.task.id))]
    fn reflect(&self, ctx: &ReasoningContext<'_>) -> Result<ReasoningOutput> {
        let prompt = self.render_prompt(ctx)?;
        let (program, args) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("reasoning.command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        info!(program = %program, prompt_bytes = prompt.len(), "invoking reasoning engine");

        let output = run_command_with_timeout(
            cmd,
            Some(prompt.as_bytes()),
            self.config.timeout(),
            self.config.output_limit_bytes,
        )
        .context("run reasoning engine")?;
        if !output.succeeded() {
            warn!(exit_code = ?output.status.code(), timed_out = output.timed_out, "reasoning engine failed");
            return Err(anyhow!(
                "reasoning engine failed: {}",
                output.describe(self.config.timeout())
            ));
        }
        let parsed = self.parse_output(&output.stdout_text())?;
        debug!(
            action = parsed.action.as_ref().map(Action::label),
            proposals = parsed.new_task_proposals.len(),
            progress_made = parsed.progress_made,
            "reasoning output parsed"
        );
        Ok(parsed)
    }
}

/// The whole stdout as JSON, or else its last line that parses as an object.
fn extract_json(stdout: &str) -> Result<Value> {
    let trimmed = stdout.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }
    trimmed
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<Value>(line).ok())
        .ok_or_else(|| anyhow!("reasoning engine printed no JSON object"))
}
