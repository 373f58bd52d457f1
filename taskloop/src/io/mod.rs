//! I/O for the loop: persistence, logs, configuration and external collaborators.

pub mod action_executor;
pub mod config;
pub mod event_log;
pub mod inbox;
pub mod init;
pub mod lock;
pub mod message_log;
pub mod outcome;
pub mod process;
pub mod reasoner;
pub mod store;
