//! Test-only helpers: scripted collaborators and a temporary agent home.

use std::cell::RefCell;
use std::collections::VecDeque;

use anyhow::{Result, anyhow};
use serde_json::Value;
use tempfile::TempDir;

use crate::controller::Controller;
use crate::core::message_store::MessageStore;
use crate::core::phase::AgentState;
use crate::core::task_store::TaskStore;
use crate::core::types::{Action, Observation, Origin, Priority};
use crate::io::action_executor::ActionExecutor;
use crate::io::config::{LoopConfig, write_config};
use crate::io::event_log::{LoopEvent, load_events};
use crate::io::inbox::TaskIntake;
use crate::io::init::{HomePaths, InitOptions, init_home};
use crate::io::message_log::load_messages;
use crate::io::reasoner::{Reasoner, ReasoningContext, ReasoningOutput};
use crate::io::store::{load_agent_state, load_tasks, write_agent_state};

/// What the scripted reasoner was shown on one call.
#[derive(Debug, Clone, PartialEq)]
pub struct ReasoningCall {
    pub cycle: u64,
    pub task_id: String,
    pub action: Option<Action>,
    pub observation: Option<Observation>,
    pub inbound: Vec<String>,
    pub signals: Vec<String>,
}

/// Reasoner that replays a queue of outputs (or failures) in order.
#[derive(Debug, Default)]
pub struct ScriptedReasoner {
    script: RefCell<VecDeque<Result<ReasoningOutput, String>>>,
    calls: RefCell<Vec<ReasoningCall>>,
}

impl ScriptedReasoner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then_output(self, output: ReasoningOutput) -> Self {
        self.script.borrow_mut().push_back(Ok(output));
        self
    }

    /// Output with only `action` set.
    pub fn then_action(self, action: Action) -> Self {
        self.then_output(ReasoningOutput {
            action: Some(action),
            ..ReasoningOutput::default()
        })
    }

    pub fn then_error(self, error: &str) -> Self {
        self.script.borrow_mut().push_back(Err(error.to_string()));
        self
    }

    pub fn calls(&self) -> Vec<ReasoningCall> {
        self.calls.borrow().clone()
    }

    pub fn assert_drained(&self) {
        let left = self.script.borrow().len();
        assert_eq!(left, 0, "scripted reasoner has {left} unused outputs");
    }
}

impl Reasoner for ScriptedReasoner {
    fn reflect(&self, ctx: &ReasoningContext<'_>) -> Result<ReasoningOutput> {
        self.calls.borrow_mut().push(ReasoningCall {
            cycle: ctx.cycle,
            task_id: ctx.task.id.clone(),
            action: ctx.action.cloned(),
            observation: ctx.observation.cloned(),
            inbound: ctx.inbound.iter().map(|message| message.body.clone()).collect(),
            signals: ctx.signals.to_vec(),
        });
        match self.script.borrow_mut().pop_front() {
            Some(Ok(output)) => Ok(output),
            Some(Err(error)) => Err(anyhow!(error)),
            None => Err(anyhow!("scripted reasoner has no more outputs")),
        }
    }
}

/// Executor that replays a queue of observations and records each tool call.
#[derive(Debug, Default)]
pub struct ScriptedExecutor {
    script: RefCell<VecDeque<Observation>>,
    calls: RefCell<Vec<(String, Value)>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn then(self, observation: Observation) -> Self {
        self.script.borrow_mut().push_back(observation);
        self
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.borrow().clone()
    }

    pub fn assert_drained(&self) {
        let left = self.script.borrow().len();
        assert_eq!(left, 0, "scripted executor has {left} unused observations");
    }
}

impl ActionExecutor for ScriptedExecutor {
    fn execute(&self, tool: &str, args: &Value) -> Result<Observation> {
        self.calls.borrow_mut().push((tool.to_string(), args.clone()));
        self.script
            .borrow_mut()
            .pop_front()
            .ok_or_else(|| anyhow!("scripted executor has no more observations"))
    }
}

/// Initialized agent home in a temp directory.
pub struct TestHome {
    _temp: TempDir,
    paths: HomePaths,
    config: LoopConfig,
}

impl TestHome {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    /// Home whose config is the default with a near-zero retry backoff,
    /// adjusted by `edit`.
    pub fn with_config(edit: impl FnOnce(&mut LoopConfig)) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = HomePaths::under(temp.path());
        init_home(&paths, InitOptions::default()).expect("init home");
        let mut config = LoopConfig::default();
        config.reasoning.backoff_ms = 1;
        edit(&mut config);
        write_config(&paths.config_path, &config).expect("write config");
        Self {
            _temp: temp,
            paths,
            config,
        }
    }

    pub fn paths(&self) -> &HomePaths {
        &self.paths
    }

    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    pub fn controller<R: Reasoner, E: ActionExecutor>(
        &self,
        reasoner: R,
        executor: E,
    ) -> Controller<R, E> {
        Controller::open(self.paths.clone(), self.config.clone(), reasoner, executor)
            .expect("open controller")
    }

    pub fn reload_state(&self) -> AgentState {
        load_agent_state(&self.paths.agent_state_path).expect("load agent state")
    }

    pub fn write_state(&self, state: &AgentState) {
        write_agent_state(&self.paths.agent_state_path, state).expect("write agent state");
    }

    pub fn reload_tasks(&self) -> TaskStore {
        load_tasks(&self.paths.tasks_path).expect("load tasks")
    }

    pub fn reload_messages(&self) -> MessageStore {
        load_messages(&self.paths.messages_path).expect("load messages")
    }

    pub fn events(&self) -> Vec<LoopEvent> {
        load_events(&self.paths.events_path).expect("load events")
    }
}

impl Default for TestHome {
    fn default() -> Self {
        Self::new()
    }
}

/// Minimal user intake record.
pub fn user_task(id: &str, priority: Priority) -> TaskIntake {
    TaskIntake {
        task_id: id.to_string(),
        priority,
        origin: Origin::User,
        parent_task: None,
        context: String::new(),
        title: format!("{id} title"),
        body: format!("{id} description"),
        success_criteria: vec![format!("{id} is done")],
    }
}
