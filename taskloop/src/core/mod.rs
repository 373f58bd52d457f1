//! Deterministic, pure logic for the loop.
//!
//! Core modules are free of I/O side effects and never read the clock:
//! callers pass `now`. Everything here is testable in isolation.

pub mod error;
pub mod escalation;
pub mod gateway;
pub mod governor;
pub mod message_store;
pub mod phase;
pub mod progress;
pub mod task_store;
pub mod types;
