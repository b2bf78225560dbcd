//! Result of a single command round-trip.

use serde::{Deserialize, Serialize};

/// Outcome of `Session::execute`.
///
/// Timeouts and mid-command exits are reported here rather than as errors
/// so callers can tell a slow tool from a broken one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct CommandResult {
    /// The completion heuristic matched before the deadline.
    pub success: bool,
    /// Stdout lines read for this call, newline-joined.
    pub stdout: String,
    /// Stderr lines drained after stdout completed, newline-joined.
    pub stderr: String,
    /// The command as written to the child.
    pub command: String,
    /// Failure description when `success` is false.
    pub error: Option<String>,
    /// The per-call deadline elapsed.
    pub timed_out: bool,
    /// Session instance that served the command.
    pub session_id: String,
    /// Wall-clock time spent, stderr grace window included.
    pub duration_ms: u64,
}

impl CommandResult {
    /// Build a successful result.
    #[must_use]
    pub fn completed(
        command: &str,
        session_id: &str,
        stdout: &[String],
        stderr: &[String],
        duration_ms: u64,
    ) -> Self {
        Self {
            success: true,
            stdout: stdout.join("\n"),
            stderr: stderr.join("\n"),
            command: command.to_owned(),
            error: None,
            timed_out: false,
            session_id: session_id.to_owned(),
            duration_ms,
        }
    }

    /// Build a result for a command whose deadline elapsed.
    #[must_use]
    pub fn timed_out(
        command: &str,
        session_id: &str,
        stdout: &[String],
        stderr: &[String],
        duration_ms: u64,
    ) -> Self {
        Self {
            success: false,
            stdout: stdout.join("\n"),
            stderr: stderr.join("\n"),
            command: command.to_owned(),
            error: Some("timed out".to_owned()),
            timed_out: true,
            session_id: session_id.to_owned(),
            duration_ms,
        }
    }

    /// Build a result for a command whose child exited mid-response.
    #[must_use]
    pub fn exited(
        command: &str,
        session_id: &str,
        stdout: &[String],
        stderr: &[String],
        duration_ms: u64,
    ) -> Self {
        Self {
            success: false,
            stdout: stdout.join("\n"),
            stderr: stderr.join("\n"),
            command: command.to_owned(),
            error: Some("session process exited".to_owned()),
            timed_out: false,
            session_id: session_id.to_owned(),
            duration_ms,
        }
    }

    /// Build a result for a command cut short by a session close.
    #[must_use]
    pub fn interrupted(
        command: &str,
        session_id: &str,
        stdout: &[String],
        stderr: &[String],
        duration_ms: u64,
    ) -> Self {
        Self {
            success: false,
            stdout: stdout.join("\n"),
            stderr: stderr.join("\n"),
            command: command.to_owned(),
            error: Some("interrupted by session close".to_owned()),
            timed_out: false,
            session_id: session_id.to_owned(),
            duration_ms,
        }
    }
}
