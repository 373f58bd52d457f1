//! Autonomous task loop CLI.
//!
//! State lives in an agent home (`.taskloop/` by default): task and loop
//! state, the append-only message log, and the event and cycle logs. Every
//! command loads the home, does one thing, and exits with a stable code.

use std::path::PathBuf;

use anyhow::Result;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};

use taskloop::controller::{Controller, CycleReport};
use taskloop::core::gateway::RawInbound;
use taskloop::core::phase::{AgentState, Phase};
use taskloop::core::types::MessageType;
use taskloop::exit_codes;
use taskloop::io::action_executor::ShellActionExecutor;
use taskloop::io::config::load_config;
use taskloop::io::inbox::read_inbox;
use taskloop::io::init::{HOME_DIR, HomePaths, InitOptions, init_home};
use taskloop::io::reasoner::CommandReasoner;
use taskloop::logging;
use taskloop::looping::{LoopStop, run_loop};
use taskloop::status::load_status;

#[derive(Parser)]
#[command(
    name = "taskloop",
    version,
    about = "Autonomous task loop with a curiosity governor"
)]
struct Cli {
    /// Agent home directory.
    #[arg(long, global = true, default_value = HOME_DIR)]
    home: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the agent home with default config and empty state.
    Init {
        /// Reset state files of an existing home (the message log is kept).
        #[arg(short, long)]
        force: bool,
    },
    /// Add user tasks from a markdown inbox file. Known ids are skipped.
    Intake { file: PathBuf },
    /// Run a single cycle.
    Step,
    /// Run cycles until the run terminates or waits on the user.
    Run {
        #[arg(long)]
        max_cycles: Option<u32>,
    },
    /// Send a message to the agent as the user.
    Reply {
        #[arg(long = "type", value_enum)]
        kind: ReplyKind,
        /// Task the message refers to.
        #[arg(long)]
        task: Option<String>,
        /// Shared token, when `[auth] user_token` is configured.
        #[arg(long)]
        token: Option<String>,
        body: String,
    },
    /// Print phase, budget and any pending question.
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Reset budget counters and reopen a terminated run.
    Reset,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReplyKind {
    Answer,
    Clarification,
    Instruction,
}

impl From<ReplyKind> for MessageType {
    fn from(kind: ReplyKind) -> Self {
        match kind {
            ReplyKind::Answer => MessageType::Answer,
            ReplyKind::Clarification => MessageType::Clarification,
            ReplyKind::Instruction => MessageType::Instruction,
        }
    }
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    let paths = HomePaths::new(&cli.home);
    match cli.command {
        Command::Init { force } => {
            init_home(&paths, InitOptions { force })?;
            println!("initialized {}", paths.home.display());
            Ok(exit_codes::OK)
        }
        Command::Intake { file } => cmd_intake(&paths, file),
        Command::Step => {
            let mut controller = open(&paths)?;
            let report = controller.step()?;
            print_cycle(&report);
            Ok(phase_code(controller.state()))
        }
        Command::Run { max_cycles } => cmd_run(&paths, max_cycles),
        Command::Reply {
            kind,
            task,
            token,
            body,
        } => {
            let mut controller = open(&paths)?;
            let mut raw = RawInbound::from_user(kind.into(), task.as_deref(), body);
            if let Some(token) = token {
                raw = raw.with_token(token);
            }
            let delivery = controller.deliver(raw, Utc::now())?;
            if delivery.resumed {
                println!("{} delivered, loop resumes", delivery.message.id);
            } else {
                println!("{} queued for the next reflection", delivery.message.id);
            }
            Ok(phase_code(controller.state()))
        }
        Command::Status { json } => {
            let status = load_status(&paths)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print!("{status}");
            }
            let code = match status.current_phase {
                Phase::Terminated => exit_codes::TERMINATED,
                Phase::WaitingUser => exit_codes::WAITING,
                _ => exit_codes::OK,
            };
            Ok(code)
        }
        Command::Reset => {
            let mut controller = open(&paths)?;
            controller.reset_budget(Utc::now())?;
            println!("budget reset; phase is {}", controller.state().phase);
            Ok(exit_codes::OK)
        }
    }
}

fn open(paths: &HomePaths) -> Result<Controller<CommandReasoner, ShellActionExecutor>> {
    let config = load_config(&paths.config_path)?;
    let reasoner = CommandReasoner::new(config.reasoning.clone())?;
    let executor = ShellActionExecutor::new(config.executor.clone());
    Controller::open(paths.clone(), config, reasoner, executor)
}

fn cmd_intake(paths: &HomePaths, file: PathBuf) -> Result<i32> {
    let intakes = read_inbox(&file)?;
    let mut controller = open(paths)?;
    let report = controller.intake(&intakes, Utc::now())?;
    for id in &report.created {
        println!("created {id}");
    }
    for id in &report.skipped {
        println!("skipped {id}");
    }
    Ok(phase_code(controller.state()))
}

fn cmd_run(paths: &HomePaths, max_cycles: Option<u32>) -> Result<i32> {
    let mut controller = open(paths)?;
    let outcome = run_loop(&mut controller, max_cycles, print_cycle)?;
    match &outcome.stop {
        LoopStop::Terminated { reason, detail } => println!(
            "terminated after {} cycles: {} {}",
            outcome.cycles_executed,
            reason.as_str(),
            detail.as_deref().unwrap_or_default()
        ),
        LoopStop::WaitingUser { question } => println!(
            "waiting on {question} after {} cycles (answer with `taskloop reply`)",
            outcome.cycles_executed
        ),
        LoopStop::CycleLimit { max_cycles } => {
            println!("stopped at the limit of {max_cycles} cycles");
        }
    }
    Ok(phase_code(controller.state()))
}

fn print_cycle(report: &CycleReport) {
    if !report.executed {
        println!("no cycle run (phase {})", report.phase);
        return;
    }
    let task = report.task_id.as_deref().unwrap_or("-");
    let action = report.action.as_ref().map_or("-", |action| action.label());
    println!(
        "cycle {}: task {task} action {action} -> {}",
        report.cycle, report.phase
    );
    for signal in &report.signals {
        println!("  signal {}", signal.describe());
    }
    for id in &report.created_tasks {
        println!("  created {id}");
    }
}

fn phase_code(state: &AgentState) -> i32 {
    match state.phase {
        Phase::Terminated => exit_codes::TERMINATED,
        Phase::WaitingUser => exit_codes::WAITING,
        _ => exit_codes::OK,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_init_force() {
        let cli = Cli::parse_from(["taskloop", "init", "--force"]);
        assert!(matches!(cli.command, Command::Init { force: true }));
        assert_eq!(cli.home, PathBuf::from(HOME_DIR));
    }

    #[test]
    fn parse_reply_with_task_and_token() {
        let cli = Cli::parse_from([
            "taskloop",
            "--home",
            "/tmp/agent",
            "reply",
            "--type",
            "answer",
            "--task",
            "T1",
            "--token",
            "s3cret",
            "use the staging database",
        ]);
        assert_eq!(cli.home, PathBuf::from("/tmp/agent"));
        match cli.command {
            Command::Reply {
                kind,
                task,
                token,
                body,
            } => {
                assert_eq!(MessageType::from(kind), MessageType::Answer);
                assert_eq!(task.as_deref(), Some("T1"));
                assert_eq!(token.as_deref(), Some("s3cret"));
                assert_eq!(body, "use the staging database");
            }
            _ => panic!("expected reply"),
        }
    }

    #[test]
    fn parse_run_max_cycles() {
        let cli = Cli::parse_from(["taskloop", "run", "--max-cycles", "5"]);
        assert!(matches!(cli.command, Command::Run { max_cycles: Some(5) }));
    }
}
