//! Loop controller: the single writer that drives one cycle at a time.
//!
//! A cycle works on a clone of the committed state. Only when the cycle
//! reaches a resting phase is the clone written to disk and adopted; a
//! contract error discards it, so nothing from an aborted cycle persists.
//! The phase itself is checkpointed on every transition so a crash mid-cycle
//! is detected on the next start.

use std::thread;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, TimeDelta, Utc};
use tracing::{debug, error, info, instrument, warn};

use crate::core::error::LoopError;
use crate::core::escalation::{Escalation, EscalationPolicy, NeverEscalate, ReAskAfter};
use crate::core::gateway::{
    Delivery, Directive, MessagingGateway, RawInbound, SharedToken, parse_directive,
};
use crate::core::governor::{
    Admission, AdmissionContext, Budget, BudgetRemaining, CuriosityGovernor, DenyReason,
    FailureCeiling,
};
use crate::core::message_store::MessageStore;
use crate::core::phase::{ActionGuard, AgentState, Phase, PlannedAction, TerminationReason};
use crate::core::progress::{ProgressMonitor, StuckDetected, action_fingerprint, error_signature};
use crate::core::task_store::{NewTask, TaskStore, USER_CANCELLED};
use crate::core::types::{
    Action, Direction, Message, MessageId, MessageType, Observation, Origin, OutcomeKind,
    Priority, TaskId, TaskStatus, TraceEntry,
};
use crate::io::action_executor::ActionExecutor;
use crate::io::config::{LoopConfig, OnStuck};
use crate::io::event_log::{
    CycleRecord, EventKind, LoopEvent, append_events, count_events, write_cycle,
};
use crate::io::inbox::TaskIntake;
use crate::io::init::HomePaths;
use crate::io::lock::HomeLock;
use crate::io::message_log::{append_messages, load_messages};
use crate::io::outcome::{OutcomeStatus, TaskOutcome, write_outcome};
use crate::io::reasoner::{Reasoner, ReasoningContext, ReasoningOutput, TaskProposal};
use crate::io::store::{
    load_agent_state, load_budget, load_tasks, write_agent_state, write_budget, write_tasks,
};
use crate::status::{StatusReport, status_report};

/// Trace entries shown to the reasoning engine.
const TRACE_TAIL: usize = 10;

/// Non-fatal conditions raised during a cycle. Each one is handled by the
/// decide phase; none of them is ever dropped silently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    ActionFailure { detail: String },
    ReflectionFailure { attempts: u32, error: String },
    Stuck(StuckDetected),
    FailureCeiling(FailureCeiling),
    BudgetExhausted { detail: String },
}

impl Signal {
    pub fn describe(&self) -> String {
        match self {
            Signal::ActionFailure { detail } => {
                let first = detail.lines().next().unwrap_or_default();
                format!("action_failure: {first}")
            }
            Signal::ReflectionFailure { attempts, error } => {
                format!("reflection_failure after {attempts} attempts: {error}")
            }
            Signal::Stuck(stuck) => format!("stuck ({}): {}", stuck.kind.as_str(), stuck.detail),
            Signal::FailureCeiling(ceiling) => format!(
                "failure_ceiling: {} consecutive failures",
                ceiling.consecutive_failures
            ),
            Signal::BudgetExhausted { detail } => format!("budget_exhausted: {detail}"),
        }
    }
}

/// What a call to [`Controller::step`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle: u64,
    /// False for no-op calls (terminated, or still waiting on the user).
    pub executed: bool,
    /// Phase the loop rests in after the call.
    pub phase: Phase,
    pub task_id: Option<TaskId>,
    pub action: Option<Action>,
    pub observation: Option<Observation>,
    pub signals: Vec<Signal>,
    pub created_tasks: Vec<TaskId>,
    pub sent_messages: Vec<MessageId>,
    pub termination: Option<TerminationReason>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntakeReport {
    pub created: Vec<TaskId>,
    /// Ids already known, or blocks that cannot come from the inbox.
    pub skipped: Vec<TaskId>,
}

#[derive(Debug, Clone)]
struct Snapshot {
    tasks: TaskStore,
    messages: MessageStore,
    state: AgentState,
    governor: CuriosityGovernor,
}

/// Working copy plus everything the cycle produced so far.
struct CycleState {
    snap: Snapshot,
    now: DateTime<Utc>,
    executed: bool,
    guard: ActionGuard,
    events: Vec<LoopEvent>,
    outcomes: Vec<TaskOutcome>,
    task_id: Option<TaskId>,
    action: Option<Action>,
    fingerprint: Option<String>,
    observation: Option<Observation>,
    reflection: Option<ReasoningOutput>,
    asked: Option<Message>,
    exhausted: Option<String>,
    signals: Vec<Signal>,
    created: Vec<TaskId>,
    sent: Vec<MessageId>,
}

impl CycleState {
    fn begin(committed: &Snapshot, now: DateTime<Utc>) -> Self {
        Self {
            snap: committed.clone(),
            now,
            executed: false,
            guard: ActionGuard::new(),
            events: Vec::new(),
            outcomes: Vec::new(),
            task_id: None,
            action: None,
            fingerprint: None,
            observation: None,
            reflection: None,
            asked: None,
            exhausted: None,
            signals: Vec::new(),
            created: Vec::new(),
            sent: Vec::new(),
        }
    }

    fn cycle(&self) -> u64 {
        self.snap.state.cycle
    }

    fn event(&self, kind: EventKind) -> LoopEvent {
        LoopEvent::new(self.cycle(), kind, self.now)
    }

    fn report(&self) -> CycleReport {
        CycleReport {
            cycle: self.cycle(),
            executed: self.executed,
            phase: self.snap.state.phase,
            task_id: self.task_id.clone(),
            action: self.action.clone(),
            observation: self.observation.clone(),
            signals: self.signals.clone(),
            created_tasks: self.created.clone(),
            sent_messages: self.sent.clone(),
            termination: self.snap.state.termination_reason,
        }
    }

    fn stuck(&self) -> Option<&StuckDetected> {
        self.signals.iter().find_map(|signal| match signal {
            Signal::Stuck(stuck) => Some(stuck),
            _ => None,
        })
    }

    fn failure_ceiling(&self) -> Option<FailureCeiling> {
        self.signals.iter().find_map(|signal| match signal {
            Signal::FailureCeiling(ceiling) => Some(*ceiling),
            _ => None,
        })
    }

    fn reflection_failure(&self) -> Option<(u32, String)> {
        self.signals.iter().find_map(|signal| match signal {
            Signal::ReflectionFailure { attempts, error } => Some((*attempts, error.clone())),
            _ => None,
        })
    }
}

pub struct Controller<R, E> {
    paths: HomePaths,
    config: LoopConfig,
    reasoner: R,
    executor: E,
    gateway: MessagingGateway,
    escalation: Box<dyn EscalationPolicy>,
    committed: Snapshot,
    persisted_messages: usize,
    events_logged: u64,
}

impl<R: Reasoner, E: ActionExecutor> Controller<R, E> {
    /// Load the persisted state of an initialized home.
    pub fn open(paths: HomePaths, config: LoopConfig, reasoner: R, executor: E) -> Result<Self> {
        if !paths.is_initialized() {
            return Err(anyhow!(
                "{} is not initialized (run `taskloop init`)",
                paths.home.display()
            ));
        }
        config.validate()?;
        let (committed, events_logged) = {
            let _lock = HomeLock::acquire(&paths.lock_path)?;
            load_snapshot(&paths, &config)?
        };

        let gateway = if config.auth.user_token.is_empty() {
            MessagingGateway::local()
        } else {
            MessagingGateway::new(Box::new(SharedToken::new(config.auth.user_token.clone())))
        };
        let escalation: Box<dyn EscalationPolicy> = match config.policy.reask_after_secs {
            0 => Box::new(NeverEscalate),
            secs => Box::new(ReAskAfter::new(
                i64::try_from(secs)
                    .ok()
                    .and_then(TimeDelta::try_seconds)
                    .unwrap_or(TimeDelta::MAX),
            )),
        };

        debug!(
            home = %paths.home.display(),
            phase = %committed.state.phase,
            tasks = committed.tasks.tasks().len(),
            messages = committed.messages.len(),
            "controller opened"
        );
        Ok(Self {
            persisted_messages: committed.messages.len(),
            committed,
            paths,
            config,
            reasoner,
            executor,
            gateway,
            escalation,
            events_logged,
        })
    }

    /// Replace the escalation hook chosen from `[policy]`.
    pub fn with_escalation(mut self, policy: Box<dyn EscalationPolicy>) -> Self {
        self.escalation = policy;
        self
    }

    pub fn paths(&self) -> &HomePaths {
        &self.paths
    }

    /// Take the home lock and reload what other processes committed since
    /// the last operation. The returned guard must outlive the commit.
    fn lock_and_refresh(&mut self) -> Result<HomeLock> {
        let lock = HomeLock::acquire(&self.paths.lock_path)?;
        let (committed, events_logged) = load_snapshot(&self.paths, &self.config)?;
        self.persisted_messages = committed.messages.len();
        self.committed = committed;
        self.events_logged = events_logged;
        Ok(lock)
    }

    pub fn reasoner(&self) -> &R {
        &self.reasoner
    }

    pub fn executor(&self) -> &E {
        &self.executor
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.committed.tasks
    }

    pub fn messages(&self) -> &MessageStore {
        &self.committed.messages
    }

    pub fn state(&self) -> &AgentState {
        &self.committed.state
    }

    pub fn budget(&self) -> &Budget {
        self.committed.governor.budget()
    }

    pub fn budget_remaining(&self) -> BudgetRemaining {
        self.committed.governor.remaining()
    }

    pub fn status(&self) -> StatusReport {
        status_report(
            &self.committed.tasks,
            &self.committed.governor,
            &self.committed.state,
            &self.committed.messages,
        )
    }

    pub fn step(&mut self) -> Result<CycleReport> {
        self.step_at(Utc::now())
    }

    /// Run one cycle as of `now`.
    #[instrument(skip_all, fields(phase = %self.committed.state.phase, cycle = self.committed.state.cycle))]
    pub fn step_at(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        let _lock = self.lock_and_refresh()?;
        let mut work = CycleState::begin(&self.committed, now);
        let result = match work.snap.state.phase {
            Phase::Terminated => {
                debug!("run is terminated, nothing to do");
                return Ok(work.report());
            }
            Phase::WaitingUser => self.check_silence(&mut work),
            _ => self.run_cycle(&mut work),
        };
        match result {
            Ok(()) => self.commit(work),
            Err(err) => Err(self.abort(work, err)),
        }
    }

    /// Validate, authenticate and record an inbound user message.
    pub fn deliver(&mut self, raw: RawInbound, now: DateTime<Utc>) -> Result<Delivery> {
        let _lock = self.lock_and_refresh()?;
        let mut work = CycleState::begin(&self.committed, now);
        let from = work.snap.state.phase;
        let received = self.gateway.receive(
            raw,
            &work.snap.tasks,
            &mut work.snap.messages,
            &mut work.snap.state,
            now,
        );
        let delivery = match received {
            Ok(delivery) => delivery,
            Err(err) => {
                warn!(kind = err.kind(), error = %err, "inbound message rejected");
                let event = work.event(EventKind::InboundRejected).detail(err.to_string());
                self.events_logged =
                    append_events(&self.paths.events_path, self.events_logged, &[event])?;
                return Err(err.into());
            }
        };

        let mut event = work
            .event(EventKind::MessageReceived)
            .detail(format!("{} {}", delivery.message.id, delivery.message.kind));
        if let Some(task_id) = &delivery.message.task_ref {
            event = event.task(task_id.clone());
        }
        work.events.push(event);
        if delivery.resumed {
            info!(message_id = %delivery.message.id, "user input received, leaving waiting_user");
            work.events.push(LoopEvent::phase(
                work.cycle(),
                from,
                work.snap.state.phase,
                now,
            ));
        }
        self.commit(work)?;
        Ok(delivery)
    }

    /// Create user tasks from inbox records. Known ids are skipped.
    ///
    /// New work reopens a run that ended for lack of tasks.
    pub fn intake(&mut self, intakes: &[TaskIntake], now: DateTime<Utc>) -> Result<IntakeReport> {
        let _lock = self.lock_and_refresh()?;
        let mut work = CycleState::begin(&self.committed, now);
        let mut report = IntakeReport::default();
        for intake in intakes {
            if work.snap.tasks.contains(&intake.task_id) {
                debug!(task_id = %intake.task_id, "task already known, skipping");
                report.skipped.push(intake.task_id.clone());
                continue;
            }
            if intake.origin != Origin::User {
                warn!(task_id = %intake.task_id, origin = %intake.origin, "inbox only accepts user tasks");
                report.skipped.push(intake.task_id.clone());
                continue;
            }
            let context = [intake.context.trim(), intake.body.trim()]
                .into_iter()
                .filter(|part| !part.is_empty())
                .collect::<Vec<_>>()
                .join("\n\n");
            let mut new = NewTask::new(Origin::User, intake.priority, intake.title.clone())
                .id(intake.task_id.clone())
                .context(context)
                .success_criteria(intake.success_criteria.clone());
            if let Some(parent) = &intake.parent_task {
                new = new.parent(parent.clone());
            }
            work.snap
                .tasks
                .create(new, now)
                .with_context(|| format!("intake task '{}'", intake.task_id))?;
            work.events.push(
                work.event(EventKind::TaskCreated)
                    .task(intake.task_id.clone())
                    .detail("origin user (intake)"),
            );
            report.created.push(intake.task_id.clone());
        }

        let reopen = work
            .snap
            .state
            .termination_reason
            .is_some_and(TerminationReason::reopens_on_intake);
        if !report.created.is_empty() && work.snap.state.is_terminated() && reopen {
            info!("new tasks arrived, reopening the run");
            self.enter(&mut work, Phase::Initialise)?;
        }
        info!(created = report.created.len(), skipped = report.skipped.len(), "intake finished");
        self.commit(work)?;
        Ok(report)
    }

    /// Maintenance boundary: zero the budget counters and reopen a terminated run.
    pub fn reset_budget(&mut self, now: DateTime<Utc>) -> Result<()> {
        let _lock = self.lock_and_refresh()?;
        let mut work = CycleState::begin(&self.committed, now);
        work.snap.governor.reset();
        work.events
            .push(work.event(EventKind::BudgetReset).detail("budget counters reset"));
        if work.snap.state.is_terminated() {
            self.enter(&mut work, Phase::Initialise)?;
        }
        info!("budget reset");
        self.commit(work)?;
        Ok(())
    }

    fn run_cycle(&self, work: &mut CycleState) -> Result<()> {
        work.executed = true;
        if work.snap.state.is_interrupted() {
            let asked = orphaned_question(&work.snap.messages, &work.snap.state).cloned();
            let stale = work.snap.state.recover_interrupted(asked.as_ref());
            warn!(
                cycle = work.cycle(),
                %stale,
                asked = ?asked.as_ref().map(|question| &question.id),
                "previous cycle was interrupted"
            );
            let detail = match &asked {
                Some(question) => format!(
                    "process stopped during {stale} after sending {}; waiting for the answer",
                    question.id
                ),
                None => format!(
                    "process stopped during {stale}; resuming at {} without replaying the action",
                    work.snap.state.phase
                ),
            };
            work.events.push(work.event(EventKind::InterruptedCycle).detail(detail));
            if asked.is_some() {
                work.executed = false;
                return Ok(());
            }
        }
        work.snap.state.cycle += 1;
        work.snap.state.cycle_started_at = Some(work.now);
        if work.snap.state.phase == Phase::Initialise {
            self.enter(work, Phase::Plan)?;
        }

        match work.snap.governor.record_iteration() {
            Ok(()) => {}
            Err(LoopError::BudgetExhausted(detail)) => {
                work.signals.push(Signal::BudgetExhausted {
                    detail: detail.clone(),
                });
                return self.terminate(work, TerminationReason::BudgetExhausted, &detail);
            }
            Err(other) => return Err(other.into()),
        }

        if work.snap.state.phase == Phase::Reflect {
            return self.resume_cycle(work);
        }
        self.plan_cycle(work)
    }

    /// Cycle that consumes the user input which ended a wait. No action runs.
    fn resume_cycle(&self, work: &mut CycleState) -> Result<()> {
        let input = work
            .snap
            .state
            .resume_input
            .take()
            .ok_or_else(|| LoopError::PhaseViolation("reflect without resume input".to_string()))?;
        let mut inbound = vec![input.clone()];
        inbound.append(&mut work.snap.state.inbound_queue);
        self.apply_inbound(work, &inbound)?;

        let task_id = input
            .task_ref
            .clone()
            .or_else(|| work.snap.state.current_task.clone())
            .or_else(|| last_question_task(&work.snap.messages))
            .filter(|id| {
                work.snap
                    .tasks
                    .get(id)
                    .is_some_and(|task| !task.status.is_terminal())
            });

        if let Some(task_id) = &task_id {
            work.task_id = Some(task_id.clone());
            if let Some(output) = self.reflect(work, task_id, None, None, &inbound, &[])? {
                work.snap.state.planned_action = output.action.clone().map(|action| {
                    PlannedAction {
                        task_id: task_id.clone(),
                        action,
                    }
                });
                let proposals = output.new_task_proposals.clone();
                work.reflection = Some(output);
                if !proposals.is_empty() {
                    self.enter(work, Phase::Expand)?;
                    self.expand(work, task_id, proposals)?;
                }
            }
        }
        self.enter(work, Phase::Decide)?;
        self.decide(work, task_id.as_deref())
    }

    fn plan_cycle(&self, work: &mut CycleState) -> Result<()> {
        let inbound = std::mem::take(&mut work.snap.state.inbound_queue);
        self.apply_inbound(work, &inbound)?;

        let Some(task_id) = self.pick_task(work)? else {
            let (reason, detail) = idle_verdict(&work.snap.tasks);
            return self.terminate(work, reason, &detail);
        };
        work.task_id = Some(task_id.clone());
        work.snap.state.current_task = Some(task_id.clone());

        // New user input outranks an action planned before it arrived.
        let mut proposals = Vec::new();
        let planned = work
            .snap
            .state
            .planned_action
            .take()
            .filter(|planned| planned.task_id == task_id && inbound.is_empty());
        let action = match planned {
            Some(planned) => planned.action,
            None => match self.reflect(work, &task_id, None, None, &inbound, &[])? {
                Some(output) => {
                    proposals.extend(output.new_task_proposals.iter().cloned());
                    let note = output
                        .plan_update
                        .clone()
                        .unwrap_or_else(|| "no action proposed".to_string());
                    output.action.unwrap_or(Action::Reason { note })
                }
                None => {
                    let (attempts, error) = work.reflection_failure().unwrap_or_default();
                    Action::AskUser {
                        question: format!(
                            "The reasoning engine failed {attempts} times while planning task {task_id}: {error}. How should I proceed?"
                        ),
                    }
                }
            },
        };

        self.enter(work, Phase::Act)?;
        work.guard.claim(action.label())?;
        let observation = self.perform(work, &task_id, &action)?;

        self.enter(work, Phase::Observe)?;
        self.observe(work, &task_id, &action, &observation)?;

        let still_active = work
            .snap
            .tasks
            .get(&task_id)
            .is_some_and(|task| task.status == TaskStatus::Active);
        if still_active && work.asked.is_none() {
            self.enter(work, Phase::Reflect)?;
            self.reflect_on_action(work, &task_id, &action, &observation, &mut proposals)?;
        } else if !proposals.is_empty() {
            self.enter(work, Phase::Reflect)?;
        }
        if !proposals.is_empty() {
            self.enter(work, Phase::Expand)?;
            self.expand(work, &task_id, proposals)?;
        }

        self.enter(work, Phase::Decide)?;
        self.decide(work, Some(&task_id))
    }

    fn reflect_on_action(
        &self,
        work: &mut CycleState,
        task_id: &str,
        action: &Action,
        observation: &Observation,
        proposals: &mut Vec<TaskProposal>,
    ) -> Result<()> {
        let window = self.config.budget.max_no_progress_cycles;
        let mut stuck = ProgressMonitor::new(window).check(&work.snap.tasks.lineage_trace(task_id));
        let mut notes: Vec<String> = work.signals.iter().map(Signal::describe).collect();
        if let Some(stuck) = &stuck {
            notes.push(Signal::Stuck(stuck.clone()).describe());
        }

        if let Some(output) =
            self.reflect(work, task_id, Some(action), Some(observation), &[], &notes)?
        {
            let streak_hit = work.snap.governor.record_progress(output.progress_made);
            if streak_hit && stuck.is_none() {
                stuck = Some(StuckDetected::no_progress(
                    work.snap.governor.budget().no_progress_streak,
                ));
            }
            work.snap.state.planned_action = output.action.clone().map(|action| PlannedAction {
                task_id: task_id.to_string(),
                action,
            });
            proposals.extend(output.new_task_proposals.iter().cloned());
            work.reflection = Some(output);
        }
        if let Some(stuck) = stuck {
            warn!(task_id, kind = stuck.kind.as_str(), detail = %stuck.detail, "stuck detected");
            work.signals.push(Signal::Stuck(stuck));
        }
        Ok(())
    }

    fn decide(&self, work: &mut CycleState, task_id: Option<&str>) -> Result<()> {
        if let Some(detail) = work.exhausted.take() {
            work.signals.push(Signal::BudgetExhausted {
                detail: detail.clone(),
            });
            return self.terminate(work, TerminationReason::BudgetExhausted, &detail);
        }
        if let Some(question) = work.asked.take() {
            return self.wait_on(work, &question);
        }

        let question = match (task_id, work.stuck().cloned(), work.failure_ceiling()) {
            (Some(task_id), Some(stuck), _) => self.handle_stuck(work, task_id, &stuck)?,
            (Some(task_id), None, Some(ceiling)) => {
                Some(self.handle_failure_ceiling(work, task_id, ceiling)?)
            }
            (Some(task_id), None, None) => match work.reflection_failure() {
                Some((attempts, error)) => Some(self.ask(
                    work,
                    task_id,
                    &format!(
                        "The reasoning engine failed {attempts} times while working on task {task_id}: {error}. How should I proceed?"
                    ),
                )?),
                None => None,
            },
            (None, _, _) => None,
        };
        if work.snap.state.is_terminated() {
            return Ok(());
        }
        match question {
            Some(question) => self.wait_on(work, &question),
            None => self.enter(work, Phase::Plan),
        }
    }

    /// Block a stagnating task and either spawn a recovery task or ask the user.
    fn handle_stuck(
        &self,
        work: &mut CycleState,
        task_id: &str,
        stuck: &StuckDetected,
    ) -> Result<Option<Message>> {
        let title = self.block_task(work, task_id, &stuck.detail)?;
        work.snap.governor.clear_no_progress();
        work.snap.governor.clear_failures();

        let question = format!(
            "Task {task_id} ({title}) is stuck: {}. It stays blocked until you answer. How should I proceed?",
            stuck.detail
        );
        if self.config.policy.on_stuck == OnStuck::AskUser {
            return Ok(Some(self.ask(work, task_id, &question)?));
        }

        let ctx = AdmissionContext {
            active_count: work.snap.tasks.active_count(),
            waiting_user: work.snap.state.is_waiting(),
            curiosity_depth: work.snap.tasks.curiosity_depth(task_id),
        };
        match work.snap.governor.admit_derived_task(Origin::Recovery, ctx) {
            Ok(Admission::Allow) => {
                let recovery = work
                    .snap
                    .tasks
                    .create(
                        NewTask::new(
                            Origin::Recovery,
                            Priority::High,
                            format!("Recover {task_id}: {}", stuck.kind.as_str()),
                        )
                        .parent(task_id)
                        .context(format!(
                            "Task {task_id} ({title}) stopped making progress: {}. Find a different approach; {task_id} is retried when this task completes.",
                            stuck.detail
                        )),
                        work.now,
                    )?
                    .id
                    .clone();
                info!(task_id, recovery = %recovery, "recovery task created");
                work.events.push(
                    work.event(EventKind::TaskCreated)
                        .task(recovery.clone())
                        .detail(format!("origin recovery for {task_id}")),
                );
                work.created.push(recovery);
                Ok(None)
            }
            Ok(Admission::Deny(reason)) => {
                info!(task_id, reason = reason.as_str(), "recovery task denied, asking the user");
                work.events.push(
                    work.event(EventKind::ProposalDenied)
                        .task(task_id)
                        .detail(format!("recovery: {}", reason.as_str())),
                );
                Ok(Some(self.ask(work, task_id, &question)?))
            }
            Err(LoopError::BudgetExhausted(detail)) => {
                work.signals.push(Signal::BudgetExhausted {
                    detail: detail.clone(),
                });
                self.terminate(work, TerminationReason::BudgetExhausted, &detail)?;
                Ok(None)
            }
            Err(other) => Err(other.into()),
        }
    }

    fn handle_failure_ceiling(
        &self,
        work: &mut CycleState,
        task_id: &str,
        ceiling: FailureCeiling,
    ) -> Result<Message> {
        let last_error = work
            .observation
            .as_ref()
            .map(|observation| error_signature(&observation.detail))
            .unwrap_or_default();
        let reason = format!(
            "{} consecutive failures, last: {last_error}",
            ceiling.consecutive_failures
        );
        let title = self.block_task(work, task_id, &reason)?;
        work.snap.governor.clear_failures();
        self.ask(
            work,
            task_id,
            &format!(
                "Task {task_id} ({title}) failed {} times in a row (last error: {last_error}). It stays blocked until you answer. How should I proceed?",
                ceiling.consecutive_failures
            ),
        )
    }

    /// Move the active task to blocked and report it. Returns the task title.
    fn block_task(&self, work: &mut CycleState, task_id: &str, reason: &str) -> Result<String> {
        self.move_task(work, task_id, TaskStatus::Blocked, Some(reason))?;
        work.snap.state.current_task = None;
        work.snap.state.planned_action = None;
        let task = work
            .snap
            .tasks
            .get(task_id)
            .ok_or_else(|| LoopError::UnknownTask(task_id.to_string()))?;
        let title = task.title.clone();
        let outcome = TaskOutcome::for_task(task, OutcomeStatus::Blocked, reason);
        self.report_outcome(work, outcome)?;
        Ok(title)
    }

    fn ask(&self, work: &mut CycleState, task_id: &str, question: &str) -> Result<Message> {
        let message = self.gateway.send(
            &mut work.snap.messages,
            MessageType::Question,
            Some(task_id),
            question,
            work.now,
        )?;
        work.sent.push(message.id.clone());
        work.events.push(
            work.event(EventKind::MessageSent)
                .task(task_id)
                .detail(format!("{} question", message.id)),
        );
        Ok(message)
    }

    fn wait_on(&self, work: &mut CycleState, question: &Message) -> Result<()> {
        let from = work.snap.state.phase;
        self.gateway.await_answer(&mut work.snap.state, question, work.now)?;
        info!(question = %question.id, task_ref = ?question.task_ref, "waiting for the user");
        work.events.push(
            LoopEvent::phase(work.cycle(), from, Phase::WaitingUser, work.now)
                .detail(format!("pending question {}", question.id)),
        );
        Ok(())
    }

    /// Escalation hook consulted while the loop waits on the user.
    fn check_silence(&self, work: &mut CycleState) -> Result<()> {
        let question = work
            .snap
            .state
            .pending_question_ref
            .as_deref()
            .and_then(|id| work.snap.messages.get(id))
            .cloned()
            .ok_or_else(|| anyhow!("waiting_user without a stored pending question"))?;
        let since = work.snap.state.waiting_since.unwrap_or(question.timestamp);
        match self.escalation.on_silence(&question, since, work.now) {
            Escalation::Wait => {
                debug!(question = %question.id, "still waiting for the user");
                Ok(())
            }
            Escalation::ReAsk { body } => {
                let follow_up =
                    self.gateway
                        .reask(&mut work.snap.messages, &mut work.snap.state, &body, work.now)?;
                info!(question = %follow_up.id, "re-asked unanswered question");
                let mut event = work
                    .event(EventKind::MessageSent)
                    .detail(format!("{} re-ask of {}", follow_up.id, question.id));
                if let Some(task_id) = &follow_up.task_ref {
                    event = event.task(task_id.clone());
                }
                work.events.push(event);
                work.sent.push(follow_up.id);
                Ok(())
            }
            Escalation::Terminate { detail } => {
                self.terminate(work, TerminationReason::Escalated, &detail)
            }
        }
    }

    fn pick_task(&self, work: &mut CycleState) -> Result<Option<TaskId>> {
        if let Some(active) = work.snap.tasks.active_task() {
            return Ok(Some(active.id.clone()));
        }
        let Some(next) = work.snap.tasks.select_next().map(|task| task.id.clone()) else {
            return Ok(None);
        };
        self.move_task(work, &next, TaskStatus::Active, None)?;
        Ok(Some(next))
    }

    /// Perform exactly one action for the active task.
    fn perform(&self, work: &mut CycleState, task_id: &str, action: &Action) -> Result<Observation> {
        info!(task_id, action = action.label(), "performing action");
        let observation = match action {
            Action::ToolCall { tool, args } => match self.executor.execute(tool, args) {
                Ok(observation) => observation,
                Err(err) => {
                    warn!(tool = %tool, error = %format!("{err:#}"), "action executor failed");
                    Observation::error(format!("executor failed: {err:#}"))
                }
            },
            Action::AskUser { question } => {
                let message = self.ask(work, task_id, question)?;
                let detail = format!("asked {}", message.id);
                work.asked = Some(message);
                Observation {
                    outcome_kind: OutcomeKind::Pending,
                    detail,
                }
            }
            Action::Reason { note } => Observation::success(note.clone()),
            Action::Complete {
                summary,
                approach,
                artifacts,
                follow_ups,
            } => {
                self.move_task(work, task_id, TaskStatus::Completed, None)?;
                let task = work
                    .snap
                    .tasks
                    .get(task_id)
                    .ok_or_else(|| LoopError::UnknownTask(task_id.to_string()))?;
                let parent = task.parent_task_id.clone().filter(|_| task.origin == Origin::Recovery);
                let mut outcome = TaskOutcome::for_task(task, OutcomeStatus::Complete, summary.clone());
                outcome.approach = approach.clone();
                outcome.artifacts = artifacts.clone();
                outcome.follow_ups = follow_ups.clone();
                self.report_outcome(work, outcome)?;
                work.snap.state.current_task = None;
                work.snap.state.planned_action = None;
                if let Some(parent) = parent {
                    self.unblock(work, &parent, "recovery task completed")?;
                }
                Observation::success(format!("completed: {summary}"))
            }
            Action::Block { reason } => {
                self.block_task(work, task_id, reason)?;
                Observation::success(format!("blocked: {reason}"))
            }
        };
        Ok(observation)
    }

    fn observe(
        &self,
        work: &mut CycleState,
        task_id: &str,
        action: &Action,
        observation: &Observation,
    ) -> Result<()> {
        let fingerprint = action_fingerprint(action);
        let signature = (observation.outcome_kind == OutcomeKind::Error)
            .then(|| error_signature(&observation.detail));
        work.snap.tasks.record_trace(
            task_id,
            TraceEntry {
                cycle: work.cycle(),
                action_fingerprint: fingerprint.clone(),
                outcome_kind: observation.outcome_kind,
                error_signature: signature,
                timestamp: work.now,
            },
        )?;
        match observation.outcome_kind {
            OutcomeKind::Error => {
                warn!(task_id, fingerprint = %fingerprint, "action failed");
                work.signals.push(Signal::ActionFailure {
                    detail: observation.detail.clone(),
                });
                if let Some(ceiling) = work.snap.governor.record_failure() {
                    warn!(task_id, failures = ceiling.consecutive_failures, "failure ceiling reached");
                    work.signals.push(Signal::FailureCeiling(ceiling));
                }
            }
            OutcomeKind::Success => work.snap.governor.record_success(),
            OutcomeKind::Pending => {}
        }
        work.action = Some(action.clone());
        work.fingerprint = Some(fingerprint);
        work.observation = Some(observation.clone());
        Ok(())
    }

    /// Call the reasoning engine with retries. `None` means every attempt
    /// failed; a `ReflectionFailure` signal is recorded for the decide phase.
    fn reflect(
        &self,
        work: &mut CycleState,
        task_id: &str,
        action: Option<&Action>,
        observation: Option<&Observation>,
        inbound: &[Message],
        signals: &[String],
    ) -> Result<Option<ReasoningOutput>> {
        let task = work
            .snap
            .tasks
            .get(task_id)
            .cloned()
            .ok_or_else(|| LoopError::UnknownTask(task_id.to_string()))?;
        let trace = work.snap.tasks.lineage_trace(task_id);
        let tail = &trace[trace.len().saturating_sub(TRACE_TAIL)..];
        let ctx = ReasoningContext {
            cycle: work.cycle(),
            task: &task,
            trace: tail,
            action,
            observation,
            inbound,
            signals,
            budget: work.snap.governor.remaining(),
        };

        let attempts = self.config.reasoning.max_attempts;
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.reasoner.reflect(&ctx) {
                Ok(output) => return Ok(Some(output)),
                Err(err) => {
                    last_error = format!("{err:#}");
                    warn!(task_id, attempt, error = %last_error, "reflection failed");
                    work.events.push(
                        work.event(EventKind::ReflectionRetry)
                            .task(task_id)
                            .detail(format!("attempt {attempt}/{attempts}: {last_error}")),
                    );
                    if attempt < attempts {
                        thread::sleep(self.config.reasoning.backoff(attempt));
                    }
                }
            }
        }
        work.signals.push(Signal::ReflectionFailure {
            attempts,
            error: last_error,
        });
        Ok(None)
    }

    /// Admit and create proposed tasks. Denials are logged, never fatal.
    ///
    /// Plan proposals go first. Curiosity proposals are screened, then
    /// admitted best value first up to the per-cycle cap.
    fn expand(&self, work: &mut CycleState, parent: &str, proposals: Vec<TaskProposal>) -> Result<()> {
        let (mut curious, planned): (Vec<_>, Vec<_>) = proposals
            .into_iter()
            .partition(|proposal| proposal.origin == Origin::Curiosity);
        curious.sort_by(|a, b| {
            let value = |proposal: &TaskProposal| proposal.estimated_value.unwrap_or(f64::MIN);
            value(b).total_cmp(&value(a))
        });

        let cap = work.snap.governor.policy().max_proposals_per_cycle;
        let mut curious_admitted = 0u32;
        for proposal in planned.into_iter().chain(curious) {
            let ctx = AdmissionContext {
                active_count: work.snap.tasks.active_count(),
                waiting_user: work.snap.state.is_waiting(),
                curiosity_depth: work.snap.tasks.curiosity_depth(parent),
            };
            let justification = proposal.justification.clone().unwrap_or_default();
            let admission = match proposal.origin {
                Origin::Curiosity => {
                    let screened = work
                        .snap
                        .governor
                        .policy()
                        .screen(proposal.estimated_value, proposal.category.as_deref())
                        .or_else(|| (curious_admitted >= cap).then_some(DenyReason::CycleLimit))
                        .or_else(|| {
                            work.snap
                                .tasks
                                .find_similar(&proposal.title)
                                .map(|_| DenyReason::Duplicate)
                        });
                    match screened {
                        Some(reason) => Ok(Admission::Deny(reason)),
                        None => work.snap.governor.admit_curiosity_task(&justification, ctx),
                    }
                }
                Origin::Plan => work.snap.governor.admit_derived_task(Origin::Plan, ctx),
                Origin::User | Origin::Recovery => {
                    work.events.push(
                        work.event(EventKind::ProposalDenied)
                            .task(parent)
                            .detail(format!("{} tasks cannot be proposed: {}", proposal.origin, proposal.title)),
                    );
                    continue;
                }
            };
            match admission {
                Ok(Admission::Allow) => {
                    let mut new = NewTask::new(proposal.origin, proposal.priority, proposal.title.clone())
                        .parent(parent)
                        .context(proposal.context.clone());
                    if !justification.trim().is_empty() {
                        new = new.justification(justification);
                    }
                    let id = work.snap.tasks.create(new, work.now)?.id.clone();
                    if proposal.origin == Origin::Curiosity {
                        curious_admitted += 1;
                    }
                    info!(task_id = %id, origin = %proposal.origin, "task admitted");
                    work.events.push(
                        work.event(EventKind::TaskCreated)
                            .task(id.clone())
                            .detail(format!("origin {} from {parent}", proposal.origin)),
                    );
                    work.created.push(id);
                }
                Ok(Admission::Deny(reason)) => {
                    info!(origin = %proposal.origin, reason = reason.as_str(), title = %proposal.title, "proposal denied");
                    work.events.push(
                        work.event(EventKind::ProposalDenied)
                            .task(parent)
                            .detail(format!("{} ({}): {}", reason.as_str(), proposal.origin, proposal.title)),
                    );
                }
                Err(LoopError::BudgetExhausted(detail)) => {
                    work.exhausted = Some(detail);
                    break;
                }
                Err(other) => return Err(other.into()),
            }
        }
        Ok(())
    }

    /// Handle directives and answers before the loop plans again.
    fn apply_inbound(&self, work: &mut CycleState, inbound: &[Message]) -> Result<()> {
        for message in inbound {
            match (parse_directive(message), message.task_ref.as_deref()) {
                (Some(Directive::Cancel), Some(task_id)) => self.cancel(work, task_id, message)?,
                (Some(Directive::Cancel), None) => {
                    warn!(message_id = %message.id, "cancel instruction without a task reference");
                    work.events.push(
                        work.event(EventKind::InboundRejected)
                            .detail(format!("{}: /cancel needs a task reference", message.id)),
                    );
                }
                (Some(Directive::Resume), Some(task_id)) => {
                    self.unblock(work, task_id, &format!("resumed in {}", message.id))?;
                }
                (Some(Directive::Resume), None) => {
                    debug!(message_id = %message.id, "resume directive");
                }
                (None, Some(task_id)) if message.kind == MessageType::Answer => {
                    let blocked = work
                        .snap
                        .tasks
                        .get(task_id)
                        .is_some_and(|task| task.status == TaskStatus::Blocked);
                    if blocked {
                        self.unblock(work, task_id, &format!("answered in {}", message.id))?;
                    }
                }
                (None, _) => {}
            }
        }
        Ok(())
    }

    fn cancel(&self, work: &mut CycleState, task_id: &str, message: &Message) -> Result<()> {
        let closed = work
            .snap
            .tasks
            .get(task_id)
            .is_none_or(|task| task.status.is_terminal());
        if closed {
            warn!(task_id, "cancel for a task that is already closed");
            work.events.push(
                work.event(EventKind::InboundRejected)
                    .task(task_id)
                    .detail(format!("{}: task is already closed", message.id)),
            );
            return Ok(());
        }
        let before: Vec<(TaskId, TaskStatus)> = work
            .snap
            .tasks
            .tasks()
            .iter()
            .map(|task| (task.id.clone(), task.status))
            .collect();
        let cancelled = work.snap.tasks.cancel(task_id, work.now)?;
        for id in &cancelled {
            let from = before
                .iter()
                .find(|(known, _)| known == id)
                .map_or(TaskStatus::Pending, |(_, status)| *status);
            info!(task_id = %id, "task cancelled by the user");
            work.events.push(
                work.event(EventKind::TaskTransition)
                    .task(id.clone())
                    .states(from.as_str(), TaskStatus::Failed.as_str())
                    .detail(USER_CANCELLED),
            );
            if work.snap.state.current_task.as_deref() == Some(id.as_str()) {
                work.snap.state.current_task = None;
            }
            if work
                .snap
                .state
                .planned_action
                .as_ref()
                .is_some_and(|planned| &planned.task_id == id)
            {
                work.snap.state.planned_action = None;
            }
            let task = work
                .snap
                .tasks
                .get(id)
                .ok_or_else(|| LoopError::UnknownTask(id.clone()))?;
            let outcome = TaskOutcome::for_task(
                task,
                OutcomeStatus::Failed,
                format!("cancelled by the user ({})", message.id),
            );
            self.report_outcome(work, outcome)?;
        }
        Ok(())
    }

    fn unblock(&self, work: &mut CycleState, task_id: &str, reason: &str) -> Result<()> {
        let blocked = work
            .snap
            .tasks
            .get(task_id)
            .is_some_and(|task| task.status == TaskStatus::Blocked);
        if blocked {
            self.move_task(work, task_id, TaskStatus::Pending, Some(reason))?;
        }
        Ok(())
    }

    fn move_task(
        &self,
        work: &mut CycleState,
        task_id: &str,
        to: TaskStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let from = work
            .snap
            .tasks
            .get(task_id)
            .map(|task| task.status)
            .ok_or_else(|| LoopError::UnknownTask(task_id.to_string()))?;
        work.snap
            .tasks
            .transition_with_reason(task_id, to, reason, work.now)?;
        info!(task_id, %from, %to, reason = ?reason, "task transition");
        let mut event = work
            .event(EventKind::TaskTransition)
            .task(task_id)
            .states(from.as_str(), to.as_str());
        if let Some(reason) = reason {
            event = event.detail(reason);
        }
        work.events.push(event);
        Ok(())
    }

    fn report_outcome(&self, work: &mut CycleState, mut outcome: TaskOutcome) -> Result<()> {
        outcome.cycle = work.cycle();
        outcome.at = work.now;
        let kind = match outcome.status {
            OutcomeStatus::Complete => MessageType::CompletionSummary,
            OutcomeStatus::Blocked | OutcomeStatus::Failed => MessageType::StatusUpdate,
        };
        let message = self.gateway.send(
            &mut work.snap.messages,
            kind,
            Some(&outcome.task_id),
            &outcome.message_body(),
            work.now,
        )?;
        work.sent.push(message.id);
        work.outcomes.push(outcome);
        Ok(())
    }

    fn terminate(&self, work: &mut CycleState, reason: TerminationReason, detail: &str) -> Result<()> {
        if !matches!(
            work.snap.state.phase,
            Phase::Decide | Phase::Initialise | Phase::WaitingUser
        ) {
            self.enter(work, Phase::Decide)?;
        }
        let from = work.snap.state.advance(Phase::Terminated)?;
        work.snap.state.termination_reason = Some(reason);
        work.snap.state.termination_detail = Some(detail.to_string());
        work.snap.state.planned_action = None;
        info!(reason = reason.as_str(), detail, "run terminated");
        work.events.push(
            LoopEvent::phase(work.cycle(), from, Phase::Terminated, work.now)
                .detail(format!("{}: {detail}", reason.as_str())),
        );
        Ok(())
    }

    /// Advance the phase, log it, and checkpoint the phase on disk.
    fn enter(&self, work: &mut CycleState, to: Phase) -> Result<()> {
        let from = work.snap.state.advance(to)?;
        debug!(cycle = work.cycle(), %from, %to, "phase transition");
        let mut event = LoopEvent::phase(work.cycle(), from, to, work.now);
        if let Some(task_id) = &work.snap.state.current_task {
            event = event.task(task_id.clone());
        }
        work.events.push(event);

        // Queues keep their committed content so a crash cannot lose input.
        let mut marker = work.snap.state.clone();
        marker.inbound_queue = self.committed.state.inbound_queue.clone();
        marker.resume_input = self.committed.state.resume_input.clone();
        write_agent_state(&self.paths.agent_state_path, &marker)
    }

    fn commit(&mut self, mut work: CycleState) -> Result<CycleReport> {
        let active = work.snap.tasks.active_count();
        work.snap.governor.sync_active_count(active);

        write_tasks(&self.paths.tasks_path, &work.snap.tasks)?;
        write_budget(&self.paths.budget_path, work.snap.governor.budget())?;
        append_messages(
            &self.paths.messages_path,
            &work.snap.messages.all()[self.persisted_messages..],
        )?;
        for outcome in &work.outcomes {
            write_outcome(&self.paths, outcome)?;
        }
        if work.executed {
            let record = CycleRecord {
                cycle: work.cycle(),
                started_at: work.now,
                ended_at: Utc::now().max(work.now),
                task_id: work.task_id.clone(),
                action: work.action.clone(),
                fingerprint: work.fingerprint.clone(),
                observation: work.observation.clone(),
                reflection: work.reflection.clone(),
                decision: work.snap.state.phase,
                signals: work.signals.iter().map(Signal::describe).collect(),
                created_tasks: work.created.clone(),
                messages: work.sent.clone(),
            };
            write_cycle(&self.paths.cycle_path(work.cycle()), &record)?;
        }
        write_agent_state(&self.paths.agent_state_path, &work.snap.state)?;
        self.events_logged = append_events(&self.paths.events_path, self.events_logged, &work.events)?;

        let report = work.report();
        self.persisted_messages = work.snap.messages.len();
        self.committed = work.snap;
        debug!(cycle = report.cycle, phase = %report.phase, "cycle committed");
        Ok(report)
    }

    /// Drop the working copy, restore the checkpoint and log the failure.
    fn abort(&mut self, work: CycleState, err: anyhow::Error) -> anyhow::Error {
        let phase = work.snap.state.phase;
        let cycle = work.cycle();
        let kind = err
            .downcast_ref::<LoopError>()
            .map_or("io_error", LoopError::kind);
        error!(
            cycle,
            %phase,
            task_id = ?work.task_id,
            kind,
            error = %format!("{err:#}"),
            "cycle aborted"
        );

        let mut events = work.events;
        let mut violation = LoopEvent::new(cycle, EventKind::ContractViolation, work.now)
            .detail(format!("{kind} in phase {phase}: {err:#}"));
        if let Some(task_id) = work.task_id {
            violation = violation.task(task_id);
        }
        events.push(violation);

        if let Err(restore) = write_agent_state(&self.paths.agent_state_path, &self.committed.state) {
            error!(error = %format!("{restore:#}"), "failed to restore agent state checkpoint");
        }
        match append_events(&self.paths.events_path, self.events_logged, &events) {
            Ok(seq) => self.events_logged = seq,
            Err(log_err) => error!(error = %format!("{log_err:#}"), "failed to log aborted cycle"),
        }
        err.context(format!("cycle {cycle} aborted in phase {phase}"))
    }
}

/// Read the committed state of a home. Callers hold the home lock.
fn load_snapshot(paths: &HomePaths, config: &LoopConfig) -> Result<(Snapshot, u64)> {
    let tasks = load_tasks(&paths.tasks_path)?;
    let state = load_agent_state(&paths.agent_state_path)?;
    let mut governor = CuriosityGovernor::from_budget(load_budget(&paths.budget_path)?);
    governor.set_limits(config.budget);
    governor.set_policy(config.curiosity.clone());
    let messages = load_messages(&paths.messages_path)?;
    let events_logged = count_events(&paths.events_path)?;
    Ok((
        Snapshot {
            tasks,
            messages,
            state,
            governor,
        },
        events_logged,
    ))
}

/// Termination verdict when nothing is runnable.
fn idle_verdict(tasks: &TaskStore) -> (TerminationReason, String) {
    let all = tasks.tasks();
    if !all.is_empty() && all.iter().all(|task| task.status.is_terminal()) {
        let completed = tasks.count_status(TaskStatus::Completed);
        let failed = tasks.count_status(TaskStatus::Failed);
        return (
            TerminationReason::GoalSatisfied,
            format!("all {} tasks closed ({completed} completed, {failed} failed)", all.len()),
        );
    }
    let blocked = tasks.count_status(TaskStatus::Blocked);
    if blocked > 0 {
        return (
            TerminationReason::NoRunnableTasks,
            format!("{blocked} tasks blocked and nothing pending"),
        );
    }
    (TerminationReason::NoRunnableTasks, "no tasks to work on".to_string())
}

/// Question sent by the interrupted cycle that its state never recorded.
fn orphaned_question<'a>(messages: &'a MessageStore, state: &AgentState) -> Option<&'a Message> {
    let started = state.cycle_started_at?;
    messages
        .unanswered_question()
        .filter(|question| question.timestamp >= started)
}

fn last_question_task(messages: &MessageStore) -> Option<TaskId> {
    messages
        .all()
        .iter()
        .rev()
        .find(|message| {
            message.direction == Direction::Outbound && message.kind == MessageType::Question
        })
        .and_then(|message| message.task_ref.clone())
}
