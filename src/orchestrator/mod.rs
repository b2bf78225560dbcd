//! Session orchestration modules.
//!
//! Covers the per-agent session state machine, the registry that owns
//! sessions, pid bookkeeping, and the fleet-wide supervisor loop that
//! audits, reaps and samples processes.

pub mod pid_tracker;
pub mod process_table;
pub mod registry;
pub mod session;
pub mod supervisor;
