//! Multi-cycle driver for `taskloop run`.

use anyhow::Result;
use tracing::info;

use crate::controller::{Controller, CycleReport};
use crate::core::phase::{Phase, TerminationReason};
use crate::io::action_executor::ActionExecutor;
use crate::io::reasoner::Reasoner;

/// Reason why `run_loop` stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopStop {
    Terminated {
        reason: TerminationReason,
        detail: Option<String>,
    },
    /// A question is outstanding; the loop resumes once the user replies.
    WaitingUser { question: String },
    /// `max_cycles` cycles ran without reaching a resting stop.
    CycleLimit { max_cycles: u32 },
}

/// Summary of a loop invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub started_at_cycle: u64,
    pub cycles_executed: u32,
    pub stop: LoopStop,
}

/// Step the controller until the run terminates, waits on the user, or
/// `max_cycles` cycles have run (`None` = no cap besides the budget).
///
/// Contract errors stop the loop immediately.
pub fn run_loop<R: Reasoner, E: ActionExecutor, F: FnMut(&CycleReport)>(
    controller: &mut Controller<R, E>,
    max_cycles: Option<u32>,
    mut on_cycle: F,
) -> Result<LoopOutcome> {
    let started_at_cycle = controller.state().cycle;
    let mut cycles_executed = 0u32;
    let mut steps = 0u32;
    loop {
        if let Some(stop) = resting_stop(controller, steps) {
            info!(cycles_executed, ?stop, "loop stopped");
            return Ok(LoopOutcome {
                started_at_cycle,
                cycles_executed,
                stop,
            });
        }
        if let Some(max_cycles) = max_cycles
            && cycles_executed >= max_cycles
        {
            return Ok(LoopOutcome {
                started_at_cycle,
                cycles_executed,
                stop: LoopStop::CycleLimit { max_cycles },
            });
        }

        let report = controller.step()?;
        steps += 1;
        if report.executed {
            cycles_executed += 1;
        }
        on_cycle(&report);
    }
}

/// A waiting controller is stepped once so the escalation hook can act.
fn resting_stop<R: Reasoner, E: ActionExecutor>(
    controller: &Controller<R, E>,
    steps: u32,
) -> Option<LoopStop> {
    let state = controller.state();
    match state.phase {
        Phase::Terminated => Some(LoopStop::Terminated {
            reason: state
                .termination_reason
                .unwrap_or(TerminationReason::NoRunnableTasks),
            detail: state.termination_detail.clone(),
        }),
        Phase::WaitingUser if steps > 0 => Some(LoopStop::WaitingUser {
            question: state.pending_question_ref.clone().unwrap_or_default(),
        }),
        _ => None,
    }
}
