#![forbid(unsafe_code)]

//! Supervisor for long-lived, headless agent CLI processes.
//!
//! One child process per agent is spawned without a terminal and driven
//! over stdin/stdout, one line-oriented command at a time. Sessions restart
//! themselves when their child dies, and a background supervisor audits,
//! reaps and samples the fleet.

pub mod completion;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod pipe;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
