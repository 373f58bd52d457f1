//! End-to-end loop scenarios against a temp agent home.
//!
//! Each test drives the controller with scripted reasoning and executor
//! queues and checks the persisted stores afterwards.

use std::fs;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::json;

use taskloop::controller::{Controller, Signal};
use taskloop::core::error::LoopError;
use taskloop::core::gateway::RawInbound;
use taskloop::core::phase::{Phase, TerminationReason};
use taskloop::core::progress::{StuckDetected, StuckKind};
use taskloop::core::types::{
    Action, Direction, MessageType, Observation, Origin, Priority, TaskStatus,
};
use taskloop::io::config::OnStuck;
use taskloop::io::event_log::EventKind;
use taskloop::io::inbox::parse_inbox;
use taskloop::io::reasoner::{ReasoningOutput, TaskProposal};
use taskloop::looping::{LoopStop, run_loop};
use taskloop::test_support::{ScriptedExecutor, ScriptedReasoner, TestHome, user_task};

fn at(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 6, 1, 10, minute, 0).unwrap()
}

fn shell(command: &str) -> Action {
    Action::ToolCall {
        tool: "shell".to_string(),
        args: json!({ "command": command }),
    }
}

fn complete(summary: &str) -> Action {
    Action::Complete {
        summary: summary.to_string(),
        approach: "scripted".to_string(),
        artifacts: vec!["report.txt".to_string()],
        follow_ups: Vec::new(),
    }
}

fn reason(note: &str) -> Action {
    Action::Reason {
        note: note.to_string(),
    }
}

fn proposal(origin: Origin, title: &str, justification: Option<&str>) -> TaskProposal {
    TaskProposal {
        origin,
        title: title.to_string(),
        justification: justification.map(str::to_string),
        priority: Priority::Low,
        context: String::new(),
        estimated_value: Some(0.8),
        category: Some("exploration".to_string()),
    }
}

fn curious(title: &str, estimated_value: f64, category: &str) -> TaskProposal {
    TaskProposal {
        estimated_value: Some(estimated_value),
        category: Some(category.to_string()),
        ..proposal(Origin::Curiosity, title, Some("the last run hinted at it"))
    }
}

fn denials(home: &TestHome) -> Vec<String> {
    home.events()
        .into_iter()
        .filter(|event| event.kind == EventKind::ProposalDenied)
        .filter_map(|event| event.detail)
        .collect()
}

fn assert_single_active(controller: &Controller<ScriptedReasoner, ScriptedExecutor>) {
    let active = controller
        .tasks()
        .tasks()
        .iter()
        .filter(|task| task.status == TaskStatus::Active)
        .count();
    assert!(active <= 1, "{active} tasks active at once");
}

const INBOX: &str = "\
# Inbox

---
task_id: T1
priority: high
context: |
  The release branch is cut from main.
---
# Ship the release notes

Collect merged changes and publish the notes.

## Success criteria
- notes are published
";

/// Verifies one high-priority user task runs to completion within the budget.
#[test]
fn scenario_a_single_task_completes_within_budget() {
    let home = TestHome::with_config(|cfg| cfg.budget.max_iterations = 10);
    let reasoner = ScriptedReasoner::new()
        .then_action(shell("git log --oneline main"))
        .then_action(complete("notes published"));
    let executor = ScriptedExecutor::new().then(Observation::success("exit code 0\n12 commits"));
    let mut controller = home.controller(reasoner, executor);

    let intakes = parse_inbox(INBOX).expect("parse inbox");
    let report = controller.intake(&intakes, at(0)).expect("intake");
    assert_eq!(report.created, vec!["T1".to_string()]);

    let outcome = run_loop(&mut controller, None, |_| {}).expect("loop");
    assert!(outcome.cycles_executed <= 10);
    assert!(matches!(
        outcome.stop,
        LoopStop::Terminated {
            reason: TerminationReason::GoalSatisfied,
            ..
        }
    ));

    let tasks = home.reload_tasks();
    let task = tasks.get("T1").expect("T1");
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.title, "Ship the release notes");
    assert_eq!(task.progress_trace.len(), 2);

    let summary = home
        .reload_messages()
        .all()
        .iter()
        .find(|message| message.kind == MessageType::CompletionSummary)
        .cloned()
        .expect("completion summary");
    assert_eq!(summary.task_ref.as_deref(), Some("T1"));
    let report_md = fs::read_to_string(home.paths().outcome_md_path("T1")).expect("outcome md");
    assert!(report_md.contains("notes published"));

    controller.reasoner().assert_drained();
    controller.executor().assert_drained();
}

/// Verifies the third identical failure is reported as stuck and a recovery task appears.
#[test]
fn scenario_b_repeated_failure_spawns_recovery_task() {
    let home = TestHome::with_config(|cfg| {
        cfg.budget.max_no_progress_cycles = 3;
        cfg.budget.max_consecutive_failures = 5;
    });
    let reasoner = ScriptedReasoner::new()
        .then_action(shell("npm test"))
        .then_action(shell("npm test"))
        .then_action(shell("npm test"))
        .then_output(ReasoningOutput::default());
    let failure = "npm ERR! Test failed. See /home/dev/app/npm-debug.log line 12";
    let executor = ScriptedExecutor::new()
        .then(Observation::error(failure))
        .then(Observation::error(failure))
        .then(Observation::error(failure));
    let mut controller = home.controller(reasoner, executor);
    controller
        .intake(&[user_task("T1", Priority::High)], at(0))
        .expect("intake");

    for _ in 0..2 {
        let report = controller.step_at(at(1)).expect("step");
        assert!(!report.signals.iter().any(|signal| matches!(signal, Signal::Stuck(_))));
        assert_single_active(&controller);
    }
    let third = controller.step_at(at(2)).expect("third repeat");
    assert!(third.signals.iter().any(|signal| matches!(
        signal,
        Signal::Stuck(StuckDetected {
            kind: StuckKind::RepeatedAction,
            window: 3,
            ..
        })
    )));

    assert_eq!(third.created_tasks.len(), 1);
    let recovery = controller
        .tasks()
        .get(&third.created_tasks[0])
        .expect("recovery task");
    assert_eq!(recovery.origin, Origin::Recovery);
    assert_eq!(recovery.priority, Priority::High);
    assert_eq!(recovery.parent_task_id.as_deref(), Some("T1"));
    assert_eq!(controller.tasks().get("T1").expect("T1").status, TaskStatus::Blocked);
    assert_eq!(third.phase, Phase::Plan);
    controller.reasoner().assert_drained();
}

/// Verifies the ask-user stuck policy suspends on a question instead.
#[test]
fn scenario_b_stuck_can_ask_the_user_instead() {
    let home = TestHome::with_config(|cfg| {
        cfg.budget.max_consecutive_failures = 5;
        cfg.policy.on_stuck = OnStuck::AskUser;
    });
    let reasoner = ScriptedReasoner::new()
        .then_action(shell("make"))
        .then_action(shell("make"))
        .then_action(shell("make"))
        .then_output(ReasoningOutput::default());
    let executor = ScriptedExecutor::new()
        .then(Observation::error("make: *** [all] Error 2"))
        .then(Observation::error("make: *** [all] Error 2"))
        .then(Observation::error("make: *** [all] Error 2"));
    let mut controller = home.controller(reasoner, executor);
    controller
        .intake(&[user_task("T1", Priority::High)], at(0))
        .expect("intake");

    controller.step_at(at(1)).expect("cycle 1");
    controller.step_at(at(2)).expect("cycle 2");
    let report = controller.step_at(at(3)).expect("cycle 3");
    assert_eq!(report.phase, Phase::WaitingUser);
    assert!(report.created_tasks.is_empty());
    let pending = controller
        .state()
        .pending_question_ref
        .clone()
        .expect("pending question");
    let question = controller.messages().get(&pending).expect("question");
    assert_eq!(question.task_ref.as_deref(), Some("T1"));
    assert!(question.body.contains("stuck"));
}

/// Verifies a question suspends the loop and an answer brings it back to plan
/// within one cycle without executing anything.
#[test]
fn scenario_c_answer_resumes_within_one_cycle() {
    let home = TestHome::new();
    let reasoner = ScriptedReasoner::new()
        .then_action(Action::AskUser {
            question: "Which database should the migration target?".to_string(),
        })
        .then_action(shell("migrate --db postgres"))
        .then_action(complete("migrated"));
    let executor = ScriptedExecutor::new().then(Observation::success("exit code 0"));
    let mut controller = home.controller(reasoner, executor);
    controller
        .intake(&[user_task("T1", Priority::High)], at(0))
        .expect("intake");

    let asked = controller.step_at(at(1)).expect("ask");
    assert_eq!(asked.phase, Phase::WaitingUser);
    let question_id = controller
        .state()
        .pending_question_ref
        .clone()
        .expect("pending question");
    let question = controller.messages().get(&question_id).expect("question");
    assert_eq!(question.kind, MessageType::Question);
    assert_eq!(question.task_ref.as_deref(), Some("T1"));

    let delivery = controller
        .deliver(
            RawInbound::from_user(MessageType::Answer, Some("T1"), "postgres"),
            at(5),
        )
        .expect("deliver answer");
    assert!(delivery.resumed);
    assert_eq!(controller.state().phase, Phase::Reflect);

    let resumed = controller.step_at(at(6)).expect("resume");
    assert_eq!(resumed.phase, Phase::Plan);
    assert_eq!(resumed.action, None);
    assert!(controller.executor().calls().is_empty());
    let calls = controller.reasoner().calls();
    assert_eq!(calls.last().expect("resume call").inbound, vec!["postgres".to_string()]);

    let acted = controller.step_at(at(7)).expect("act");
    assert_eq!(acted.action, Some(shell("migrate --db postgres")));
    assert_eq!(controller.executor().calls().len(), 1);
}

/// Verifies a curiosity proposal at the active-task ceiling is denied and not counted.
#[test]
fn scenario_d_curiosity_denied_at_active_limit() {
    let home = TestHome::with_config(|cfg| cfg.budget.max_active_tasks = 2);
    let reasoner = ScriptedReasoner::new()
        .then_output(ReasoningOutput {
            action: Some(reason("map the modules")),
            new_task_proposals: vec![proposal(
                Origin::Curiosity,
                "Benchmark the parser",
                Some("parsing dominated the last profile"),
            )],
            ..ReasoningOutput::default()
        })
        .then_output(ReasoningOutput::default());
    let mut controller = home.controller(reasoner, ScriptedExecutor::new());
    controller
        .intake(
            &[user_task("T1", Priority::High), user_task("T2", Priority::Low)],
            at(0),
        )
        .expect("intake");

    let report = controller.step_at(at(1)).expect("cycle");
    assert!(report.created_tasks.is_empty());
    assert_eq!(controller.tasks().tasks().len(), 2);
    assert_eq!(controller.budget().tasks_created, 0);
    assert!(home.events().iter().any(|event| {
        event.kind == EventKind::ProposalDenied
            && event.detail.as_deref().is_some_and(|detail| detail.contains("active_limit"))
    }));
}

/// Verifies curiosity proposals without a justification never become tasks.
#[test]
fn curiosity_without_justification_is_denied() {
    let home = TestHome::new();
    let reasoner = ScriptedReasoner::new()
        .then_output(ReasoningOutput {
            action: Some(reason("look around")),
            new_task_proposals: vec![
                proposal(Origin::Curiosity, "Explore the cache", None),
                proposal(Origin::Curiosity, "Explore the logs", Some("errors spike hourly")),
            ],
            ..ReasoningOutput::default()
        })
        .then_output(ReasoningOutput::default());
    let mut controller = home.controller(reasoner, ScriptedExecutor::new());
    controller
        .intake(&[user_task("T1", Priority::High)], at(0))
        .expect("intake");

    let report = controller.step_at(at(1)).expect("cycle");
    assert_eq!(report.created_tasks.len(), 1);
    let created = controller.tasks().get(&report.created_tasks[0]).expect("created");
    assert_eq!(created.origin, Origin::Curiosity);
    assert_eq!(created.justification.as_deref(), Some("errors spike hourly"));
    assert_eq!(created.parent_task_id.as_deref(), Some("T1"));
    assert!(home.events().iter().any(|event| {
        event.kind == EventKind::ProposalDenied
            && event
                .detail
                .as_deref()
                .is_some_and(|detail| detail.contains("missing_justification"))
    }));
}

/// Verifies curiosity proposals are screened by value and category, then
/// admitted best value first up to the per-cycle cap.
#[test]
fn curiosity_proposals_are_screened_ranked_and_capped() {
    let home = TestHome::new();
    let reasoner = ScriptedReasoner::new()
        .then_output(ReasoningOutput {
            action: Some(reason("survey the service")),
            new_task_proposals: vec![
                curious("Measure cold start latency", 0.7, "exploration"),
                curious("Verify the backup restore path", 0.9, "verification"),
                curious("Rename every module", 0.95, "refactoring"),
                curious("Document the config flags", 0.8, "documentation"),
                curious("Count the log lines", 0.3, "exploration"),
            ],
            ..ReasoningOutput::default()
        })
        .then_output(ReasoningOutput::default());
    let mut controller = home.controller(reasoner, ScriptedExecutor::new());
    controller
        .intake(&[user_task("T1", Priority::High)], at(0))
        .expect("intake");

    let report = controller.step_at(at(1)).expect("cycle");
    let titles: Vec<&str> = report
        .created_tasks
        .iter()
        .map(|id| controller.tasks().get(id).expect("created").title.as_str())
        .collect();
    assert_eq!(
        titles,
        vec!["Verify the backup restore path", "Document the config flags"]
    );
    assert_eq!(controller.budget().tasks_created, 2);

    let denied = denials(&home);
    assert!(denied.contains(&"category (curiosity): Rename every module".to_string()));
    assert!(denied.contains(&"cycle_limit (curiosity): Measure cold start latency".to_string()));
    assert!(denied.contains(&"low_value (curiosity): Count the log lines".to_string()));
}

/// Verifies a curiosity proposal that restates an existing task is dropped.
#[test]
fn duplicate_curiosity_proposal_is_denied() {
    let home = TestHome::new();
    let reasoner = ScriptedReasoner::new()
        .then_output(ReasoningOutput {
            action: Some(reason("survey the service")),
            new_task_proposals: vec![
                curious("Verify the backup restore path", 0.9, "verification"),
                curious("verify the backup restore path again", 0.8, "verification"),
            ],
            ..ReasoningOutput::default()
        })
        .then_output(ReasoningOutput::default());
    let mut controller = home.controller(reasoner, ScriptedExecutor::new());
    controller
        .intake(&[user_task("T1", Priority::High)], at(0))
        .expect("intake");

    let report = controller.step_at(at(1)).expect("cycle");
    assert_eq!(report.created_tasks.len(), 1);
    assert!(denials(&home)
        .contains(&"duplicate (curiosity): verify the backup restore path again".to_string()));
}

/// Verifies curiosity tasks cannot spawn curiosity beyond the configured depth.
#[test]
fn curiosity_chain_stops_at_max_depth() {
    let home = TestHome::with_config(|cfg| cfg.curiosity.max_depth = 1);
    let reasoner = ScriptedReasoner::new()
        .then_output(ReasoningOutput {
            action: Some(complete("release cut")),
            new_task_proposals: vec![curious("Verify the release checksums", 0.9, "verification")],
            ..ReasoningOutput::default()
        })
        .then_output(ReasoningOutput {
            action: Some(reason("list the artifacts")),
            new_task_proposals: vec![curious("Explore mirror replication lag", 0.9, "exploration")],
            ..ReasoningOutput::default()
        })
        .then_output(ReasoningOutput::default());
    let mut controller = home.controller(reasoner, ScriptedExecutor::new());
    controller
        .intake(&[user_task("T1", Priority::High)], at(0))
        .expect("intake");

    let first = controller.step_at(at(1)).expect("cycle 1");
    let spawned = first.created_tasks.first().cloned().expect("curiosity task");
    assert_eq!(controller.tasks().get(&spawned).expect("spawned").origin, Origin::Curiosity);

    let second = controller.step_at(at(2)).expect("cycle 2");
    assert_eq!(second.task_id.as_deref(), Some(spawned.as_str()));
    assert!(second.created_tasks.is_empty());
    assert!(denials(&home)
        .contains(&"depth_limit (curiosity): Explore mirror replication lag".to_string()));
    controller.reasoner().assert_drained();
}

/// Verifies `tasks_created` stops at its ceiling.
#[test]
fn tasks_created_never_exceeds_limit() {
    let home = TestHome::with_config(|cfg| cfg.budget.max_tasks_created = 1);
    let reasoner = ScriptedReasoner::new()
        .then_output(ReasoningOutput {
            action: Some(reason("split the work")),
            new_task_proposals: vec![
                proposal(Origin::Plan, "Write the parser", None),
                proposal(Origin::Plan, "Write the printer", None),
            ],
            ..ReasoningOutput::default()
        })
        .then_output(ReasoningOutput::default());
    let mut controller = home.controller(reasoner, ScriptedExecutor::new());
    controller
        .intake(&[user_task("T1", Priority::High)], at(0))
        .expect("intake");

    let report = controller.step_at(at(1)).expect("cycle");
    assert_eq!(report.created_tasks.len(), 1);
    assert_eq!(controller.budget().tasks_created, 1);
    assert!(home.events().iter().any(|event| {
        event.kind == EventKind::ProposalDenied
            && event.detail.as_deref().is_some_and(|detail| detail.contains("task_limit"))
    }));
}

/// Verifies the cycle after the last budgeted iteration terminates the run.
#[test]
fn iteration_budget_terminates_the_run() {
    let home = TestHome::with_config(|cfg| cfg.budget.max_iterations = 3);
    let reasoner = ScriptedReasoner::new()
        .then_action(reason("step 1"))
        .then_action(reason("step 2"))
        .then_action(reason("step 3"))
        .then_action(reason("step 4"));
    let mut controller = home.controller(reasoner, ScriptedExecutor::new());
    controller
        .intake(&[user_task("T1", Priority::High)], at(0))
        .expect("intake");

    for minute in 1..=3 {
        let report = controller.step_at(at(minute)).expect("budgeted cycle");
        assert_eq!(report.phase, Phase::Plan);
    }
    let last = controller.step_at(at(4)).expect("over budget");
    assert_eq!(last.phase, Phase::Terminated);
    assert_eq!(last.termination, Some(TerminationReason::BudgetExhausted));
    assert!(last
        .signals
        .iter()
        .any(|signal| matches!(signal, Signal::BudgetExhausted { .. })));
    assert_eq!(controller.budget().iterations_used, 3);
    assert_eq!(
        home.reload_state().termination_detail.as_deref(),
        Some("3 of 3 iterations used")
    );
}

/// Verifies nothing moves while the loop waits, and waiting survives a restart.
#[test]
fn waiting_user_freezes_tasks_across_restart() {
    let home = TestHome::with_config(|cfg| cfg.auth.user_token = "s3cret".to_string());
    let reasoner = ScriptedReasoner::new().then_action(Action::AskUser {
        question: "May I delete the stale branches?".to_string(),
    });
    let mut controller = home.controller(reasoner, ScriptedExecutor::new());
    controller
        .intake(
            &[user_task("T1", Priority::High), user_task("T2", Priority::Medium)],
            at(0),
        )
        .expect("intake");
    controller.step_at(at(1)).expect("ask");
    let tasks_before = controller.tasks().clone();
    let budget_before = controller.budget().clone();
    drop(controller);

    let mut controller = home.controller(ScriptedReasoner::new(), ScriptedExecutor::new());
    assert!(controller.state().is_waiting());
    for minute in 2..5 {
        let report = controller.step_at(at(minute)).expect("idle step");
        assert!(!report.executed);
    }

    let err = controller
        .deliver(
            RawInbound::from_user(MessageType::Answer, Some("T1"), "yes").with_token("guess"),
            at(6),
        )
        .unwrap_err();
    assert!(matches!(err.downcast_ref::<LoopError>(), Some(LoopError::SpoofRejected)));

    assert!(controller.state().is_waiting());
    assert_eq!(controller.tasks(), &tasks_before);
    assert_eq!(controller.budget(), &budget_before);
    assert!(controller.reasoner().calls().is_empty());
    assert!(home.events().iter().any(|event| event.kind == EventKind::InboundRejected));
}

/// Verifies persisted messages are only ever appended to.
#[test]
fn message_log_is_append_only() {
    let home = TestHome::new();
    let reasoner = ScriptedReasoner::new()
        .then_action(Action::AskUser {
            question: "Which region?".to_string(),
        })
        .then_action(complete("deployed to eu-west"));
    let mut controller = home.controller(reasoner, ScriptedExecutor::new());
    controller
        .intake(&[user_task("T1", Priority::High)], at(0))
        .expect("intake");

    controller.step_at(at(1)).expect("ask");
    let first = fs::read_to_string(&home.paths().messages_path).expect("read log");
    controller
        .deliver(
            RawInbound::from_user(MessageType::Answer, Some("T1"), "eu-west"),
            at(2),
        )
        .expect("answer");
    controller.step_at(at(3)).expect("resume");
    controller.step_at(at(4)).expect("complete");
    let second = fs::read_to_string(&home.paths().messages_path).expect("read log");

    assert!(second.starts_with(&first));
    let messages = home.reload_messages();
    let directions: Vec<Direction> = messages.all().iter().map(|message| message.direction).collect();
    assert_eq!(
        directions,
        vec![Direction::Outbound, Direction::Inbound, Direction::Outbound]
    );
}

/// Verifies closed tasks stay closed even when the user cancels them later.
#[test]
fn terminal_tasks_ignore_later_cancel() {
    let home = TestHome::new();
    let reasoner = ScriptedReasoner::new()
        .then_action(complete("T1 done"))
        .then_action(reason("start T2"))
        .then_output(ReasoningOutput::default());
    let mut controller = home.controller(reasoner, ScriptedExecutor::new());
    controller
        .intake(
            &[user_task("T1", Priority::High), user_task("T2", Priority::Low)],
            at(0),
        )
        .expect("intake");

    controller.step_at(at(1)).expect("complete T1");
    controller
        .deliver(
            RawInbound::from_user(MessageType::Instruction, Some("T1"), "/cancel"),
            at(2),
        )
        .expect("queue cancel");
    let report = controller.step_at(at(3)).expect("work on T2");
    assert_eq!(report.task_id.as_deref(), Some("T2"));
    assert_eq!(controller.tasks().get("T1").expect("T1").status, TaskStatus::Completed);
    assert!(home.events().iter().any(|event| {
        event.kind == EventKind::InboundRejected && event.task_id.as_deref() == Some("T1")
    }));
}
