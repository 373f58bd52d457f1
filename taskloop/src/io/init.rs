//! Agent home layout (`.taskloop/`) and `init` scaffolding.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use tracing::info;

use super::config::{LoopConfig, write_config};
use super::store::{write_agent_state, write_budget, write_tasks};
use crate::core::governor::Budget;
use crate::core::phase::AgentState;
use crate::core::task_store::TaskStore;

/// Directory name created under the project root.
pub const HOME_DIR: &str = ".taskloop";

/// All canonical paths within an agent home.
#[derive(Debug, Clone)]
pub struct HomePaths {
    pub home: PathBuf,
    pub state_dir: PathBuf,
    pub cycles_dir: PathBuf,
    pub outcomes_dir: PathBuf,
    pub config_path: PathBuf,
    pub tasks_path: PathBuf,
    pub agent_state_path: PathBuf,
    pub budget_path: PathBuf,
    pub messages_path: PathBuf,
    pub events_path: PathBuf,
    /// Held by every operation that writes loop state.
    pub lock_path: PathBuf,
    pub gitignore_path: PathBuf,
}

impl HomePaths {
    /// Paths for an explicit home directory.
    pub fn new(home: impl Into<PathBuf>) -> Self {
        let home = home.into();
        let state_dir = home.join("state");
        Self {
            state_dir: state_dir.clone(),
            cycles_dir: home.join("cycles"),
            outcomes_dir: home.join("outcomes"),
            config_path: home.join("config.toml"),
            tasks_path: state_dir.join("tasks.json"),
            agent_state_path: state_dir.join("agent_state.json"),
            budget_path: state_dir.join("budget.json"),
            messages_path: home.join("messages.jsonl"),
            events_path: home.join("events.jsonl"),
            lock_path: home.join("loop.lock"),
            gitignore_path: home.join(".gitignore"),
            home,
        }
    }

    /// Paths for `<root>/.taskloop`.
    pub fn under(root: &Path) -> Self {
        Self::new(root.join(HOME_DIR))
    }

    pub fn cycle_path(&self, cycle: u64) -> PathBuf {
        self.cycles_dir.join(format!("{cycle:06}.json"))
    }

    pub fn outcome_json_path(&self, task_id: &str) -> PathBuf {
        self.outcomes_dir.join(format!("{task_id}.json"))
    }

    pub fn outcome_md_path(&self, task_id: &str) -> PathBuf {
        self.outcomes_dir.join(format!("{task_id}.md"))
    }

    pub fn is_initialized(&self) -> bool {
        self.agent_state_path.is_file()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct InitOptions {
    /// Reset state files even when the home already exists.
    pub force: bool,
}

/// Create the agent home with default config and empty state.
///
/// Refuses an existing home unless `options.force` is set. The message log is
/// append-only and survives a forced init.
pub fn init_home(paths: &HomePaths, options: InitOptions) -> Result<()> {
    if paths.home.exists() && !paths.home.is_dir() {
        return Err(anyhow!(
            "init: {} exists but is not a directory",
            paths.home.display()
        ));
    }
    if paths.is_initialized() && !options.force {
        return Err(anyhow!(
            "init: {} already exists (use --force to reset state)",
            paths.home.display()
        ));
    }

    for dir in [
        &paths.home,
        &paths.state_dir,
        &paths.cycles_dir,
        &paths.outcomes_dir,
    ] {
        fs::create_dir_all(dir).with_context(|| format!("create directory {}", dir.display()))?;
    }

    let config = LoopConfig::default();
    if options.force || !paths.config_path.exists() {
        write_config(&paths.config_path, &config)?;
    }
    write_tasks(&paths.tasks_path, &TaskStore::new())?;
    write_agent_state(&paths.agent_state_path, &AgentState::default())?;
    write_budget(
        &paths.budget_path,
        &Budget {
            limits: config.budget,
            ..Budget::default()
        },
    )?;
    if !paths.messages_path.exists() {
        fs::write(&paths.messages_path, "")
            .with_context(|| format!("create {}", paths.messages_path.display()))?;
    }
    fs::write(&paths.gitignore_path, HOME_GITIGNORE)
        .with_context(|| format!("write {}", paths.gitignore_path.display()))?;

    info!(home = %paths.home.display(), force = options.force, "initialized agent home");
    Ok(())
}

const HOME_GITIGNORE: &str = "cycles/\nevents.jsonl\nloop.lock\n";
