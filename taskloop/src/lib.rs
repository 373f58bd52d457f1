//! Autonomous task loop with a curiosity governor.
//!
//! An agent works through a queue of tasks one cycle at a time
//! (plan, act, observe, reflect, expand, decide), may spawn its own follow-up
//! tasks under a bounded budget, detects when it stops making progress, and
//! suspends on questions to the user until an answer arrives. The
//! architecture enforces a strict separation:
//!
//! - **[`core`]**: Pure, deterministic logic (task store, message store,
//!   governor, progress monitor, gateway, phase machine). No I/O, no clocks.
//! - **[`io`]**: Side-effecting operations (state files, logs, config,
//!   inbox, child processes). Isolated to enable scripted fakes in tests.
//!
//! The [`controller`] is the only writer of loop state; [`looping`] and
//! [`status`] sit on top of it for the CLI.

pub mod controller;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod looping;
pub mod status;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
