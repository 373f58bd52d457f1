//! Action executor collaborator: runs `tool_call` actions.
//!
//! The controller performs the other action kinds itself. Executors only see
//! tool calls and report a plain observation; a failed tool is an `error`
//! observation, not an `Err`.

use std::process::Command;

use anyhow::{Result, anyhow};
use serde_json::Value;
use tracing::{info, instrument, warn};

use crate::core::types::Observation;
use crate::io::config::ExecutorConfig;
use crate::io::process::run_command_with_timeout;

pub trait ActionExecutor {
    /// `Err` means the executor itself broke (spawn failure, bad request),
    /// and is recorded as an error observation by the controller.
    fn execute(&self, tool: &str, args: &Value) -> Result<Observation>;
}

/// Runs the `shell` tool: `args.command` through the configured shell.
pub struct ShellActionExecutor {
    config: ExecutorConfig,
}

impl ShellActionExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self { config }
    }
}

impl ActionExecutor for ShellActionExecutor {
    #[instrument(skip_all, fields(tool = tool))]
    fn execute(&self, tool: &str, args: &Value) -> Result<Observation> {
        if tool != "shell" {
            return Ok(Observation::error(format!("unknown tool '{tool}'")));
        }
        let Some(command) = args.get("command").and_then(Value::as_str) else {
            return Ok(Observation::error("shell tool requires a string 'command' argument"));
        };
        let (program, prefix) = self
            .config
            .shell
            .split_first()
            .ok_or_else(|| anyhow!("executor.shell is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(prefix).arg(command);
        if let Some(cwd) = args.get("cwd").and_then(Value::as_str) {
            cmd.current_dir(cwd);
        }
        info!(command = %command, "running shell action");

        let output = run_command_with_timeout(
            cmd,
            None,
            self.config.timeout(),
            self.config.output_limit_bytes,
        )?;
        let detail = output.describe(self.config.timeout());
        if output.succeeded() {
            Ok(Observation::success(detail))
        } else {
            warn!(exit_code = ?output.status.code(), timed_out = output.timed_out, "shell action failed");
            Ok(Observation::error(detail))
        }
    }
}
