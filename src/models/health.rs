//! Fleet health snapshots produced by the supervisor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `os_state` recorded for a tracked pid that vanished before sampling.
pub const STATE_TERMINATED: &str = "terminated";

/// Resource sample of one tracked process.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct ProcessHealth {
    /// Owning agent.
    pub agent_id: String,
    /// OS pid.
    pub pid: u32,
    /// CPU usage since the previous refresh, in percent of one core.
    pub cpu_percent: f32,
    /// Resident set size.
    pub resident_memory_bytes: u64,
    /// OS scheduler state, or [`STATE_TERMINATED`].
    pub os_state: String,
}

impl ProcessHealth {
    /// Record for a pid that disappeared underneath the sampler.
    #[must_use]
    pub fn terminated(agent_id: String, pid: u32) -> Self {
        Self {
            agent_id,
            pid,
            cpu_percent: 0.0,
            resident_memory_bytes: 0,
            os_state: STATE_TERMINATED.to_owned(),
        }
    }
}

/// Read-only record of the fleet at one tick.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct HealthSnapshot {
    /// When the snapshot was taken.
    pub taken_at: DateTime<Utc>,
    /// Sessions in the `Active` state.
    pub active_sessions: usize,
    /// One entry per tracked pid.
    pub processes: Vec<ProcessHealth>,
}
