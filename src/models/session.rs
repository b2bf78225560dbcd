//! Session state machine and status records.

use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a supervised session.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Constructed, never started.
    #[default]
    Uninitialized,
    /// Spawn in progress.
    Starting,
    /// Child running with open pipes.
    Active,
    /// Child gone, closed or detached.
    Terminated,
    /// The last start attempt failed.
    Error,
}

impl SessionState {
    /// Determine whether a lifecycle transition is permitted.
    ///
    /// Any state may move to `Terminated`; `close` must always succeed.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (
                Self::Uninitialized | Self::Terminated | Self::Error,
                Self::Starting
            ) | (Self::Starting, Self::Active | Self::Error)
                | (Self::Active, Self::Active)
                | (_, Self::Terminated)
        )
    }

    /// Whether a command can be written without a restart.
    #[must_use]
    pub fn is_active(self) -> bool {
        self == Self::Active
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Terminated => "terminated",
            Self::Error => "error",
        };
        f.write_str(text)
    }
}

/// Point-in-time view of one session, safe to hand to callers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionStatus {
    /// Logical owner of the session.
    pub agent_id: String,
    /// `true` when `state` is `Active`.
    pub active: bool,
    /// Current lifecycle state.
    pub state: SessionState,
    /// Identifier of the current (or last) child instance.
    pub session_id: Option<String>,
    /// Directory the child runs in.
    pub working_directory: PathBuf,
    /// OS pid of the running child.
    pub pid: Option<u32>,
    /// Completion time of the last successful command.
    pub last_activity: Option<DateTime<Utc>>,
    /// Number of starts after the first one.
    pub restarts: u32,
}
