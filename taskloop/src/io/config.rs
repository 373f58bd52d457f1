//! Loop configuration stored under `.taskloop/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::governor::{BudgetLimits, CuriosityPolicy};

/// Loop configuration (TOML).
///
/// Meant to be edited by humans. Missing fields take the defaults below.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LoopConfig {
    pub budget: BudgetLimits,
    pub curiosity: CuriosityPolicy,
    pub reasoning: ReasoningConfig,
    pub executor: ExecutorConfig,
    pub policy: PolicyConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReasoningConfig {
    /// Command for the external reasoning engine; the prompt goes to stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Attempts per reflection before the loop asks the user instead.
    pub max_attempts: u32,
    /// First retry delay; doubles on every further attempt.
    pub backoff_ms: u64,
    pub output_limit_bytes: usize,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            command: vec!["taskloop-reasoner".to_string()],
            timeout_secs: 600,
            max_attempts: 3,
            backoff_ms: 500,
            output_limit_bytes: 200_000,
        }
    }
}

impl ReasoningConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Delay before retry number `attempt` (1-based count of failures so far).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.backoff_ms.saturating_mul(factor))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Shell prefix for `shell` tool calls, e.g. `["sh", "-c"]`.
    pub shell: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            shell: vec!["sh".to_string(), "-c".to_string()],
            timeout_secs: 300,
            output_limit_bytes: 100_000,
        }
    }
}

impl ExecutorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnStuck {
    /// Block the task and spawn a recovery task.
    #[default]
    Recovery,
    /// Block the task and ask the user.
    AskUser,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyConfig {
    pub on_stuck: OnStuck,
    /// Re-ask an unanswered question after this many seconds. 0 disables.
    pub reask_after_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AuthConfig {
    /// Shared secret required on inbound messages. Empty trusts the local channel.
    pub user_token: String,
}

impl LoopConfig {
    pub fn validate(&self) -> Result<()> {
        let mut errors = self.budget.validate();
        errors.extend(self.curiosity.validate());
        if self.reasoning.command.is_empty() || self.reasoning.command[0].trim().is_empty() {
            errors.push("reasoning.command must be a non-empty array".to_string());
        }
        if self.reasoning.timeout_secs == 0 {
            errors.push("reasoning.timeout_secs must be > 0".to_string());
        }
        if self.reasoning.max_attempts == 0 {
            errors.push("reasoning.max_attempts must be > 0".to_string());
        }
        if self.reasoning.output_limit_bytes == 0 {
            errors.push("reasoning.output_limit_bytes must be > 0".to_string());
        }
        if self.executor.shell.is_empty() || self.executor.shell[0].trim().is_empty() {
            errors.push("executor.shell must be a non-empty array".to_string());
        }
        if self.executor.timeout_secs == 0 {
            errors.push("executor.timeout_secs must be > 0".to_string());
        }
        if self.executor.output_limit_bytes == 0 {
            errors.push("executor.output_limit_bytes must be > 0".to_string());
        }
        if errors.is_empty() {
            return Ok(());
        }
        Err(anyhow!("invalid config: {}", errors.join("; ")))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `LoopConfig::default()`.
pub fn load_config(path: &Path) -> Result<LoopConfig> {
    if !path.exists() {
        let cfg = LoopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: LoopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &LoopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::store::write_atomic(path, &buf)
}
