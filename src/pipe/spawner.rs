//! Headless process spawner.
//!
//! Launches the external tool for a session with:
//! - no controlling terminal: on unix the child leads a new process group,
//!   so terminal hang-up and job-control signals aimed at the supervisor's
//!   group never reach it; on Windows it is created without a console.
//! - `env_clear()` plus an allowlist, so only configured variables reach
//!   the child. `TERM` is pinned to `dumb` and colour output is disabled.
//! - `kill_on_drop(false)`: children only die through an explicit close,
//!   which is what lets persist mode detach them.

use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::info;

use crate::config::SpawnConfig;
use crate::{AppError, Result};

/// Variables forced on every child to keep it non-interactive.
pub const HEADLESS_ENV: &[(&str, &str)] = &[("TERM", "dumb"), ("NO_COLOR", "1")];

/// Environment variable carrying the owning agent identifier.
pub const AGENT_ID_ENV: &str = "WARDEN_AGENT_ID";

/// Environment variable carrying the session instance identifier.
pub const SESSION_ID_ENV: &str = "WARDEN_SESSION_ID";

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

/// A freshly spawned child with its three pipes detached from the handle.
#[derive(Debug)]
pub struct SpawnedProcess {
    /// Child handle used for exit polling and kill.
    pub child: Child,
    /// OS pid, captured before the child can be reaped.
    pub pid: u32,
    /// Child's stdin.
    pub stdin: ChildStdin,
    /// Child's stdout.
    pub stdout: ChildStdout,
    /// Child's stderr.
    pub stderr: ChildStderr,
}

/// Build the full argument vector: configured args, then headless flags.
#[must_use]
pub fn command_line(spawn: &SpawnConfig) -> Vec<String> {
    spawn
        .args
        .iter()
        .chain(spawn.headless_flags.iter())
        .cloned()
        .collect()
}

/// Spawn the external tool for `agent_id` inside `working_directory`.
///
/// The working directory is created first when missing.
///
/// # Errors
///
/// - `AppError::SpawnFailed("cannot create working directory …")`
/// - `AppError::SpawnFailed("failed to spawn …")`: binary missing,
///   permission denied, or any other OS spawn failure.
/// - `AppError::SpawnFailed("failed to capture …")`: a pipe was not set up.
pub async fn spawn_headless(
    spawn: &SpawnConfig,
    agent_id: &str,
    session_id: &str,
    working_directory: &Path,
) -> Result<SpawnedProcess> {
    tokio::fs::create_dir_all(working_directory)
        .await
        .map_err(|err| {
            AppError::SpawnFailed(format!(
                "cannot create working directory {}: {err}",
                working_directory.display()
            ))
        })?;

    let mut cmd = Command::new(&spawn.executable);
    cmd.args(command_line(spawn));

    cmd.env_clear();
    for key in &spawn.inherit_env {
        if let Ok(val) = std::env::var(key) {
            cmd.env(key, val);
        }
    }
    cmd.envs(&spawn.env);
    for &(key, val) in HEADLESS_ENV {
        cmd.env(key, val);
    }
    cmd.env(AGENT_ID_ENV, agent_id);
    cmd.env(SESSION_ID_ENV, session_id);

    cmd.current_dir(working_directory)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(false);

    #[cfg(unix)]
    cmd.process_group(0);

    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    let mut child = cmd.spawn().map_err(|err| {
        AppError::SpawnFailed(format!("failed to spawn {}: {err}", spawn.executable))
    })?;

    let pid = child
        .id()
        .ok_or_else(|| AppError::SpawnFailed("child exited before its pid was read".into()))?;
    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::SpawnFailed("failed to capture child stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::SpawnFailed("failed to capture child stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AppError::SpawnFailed("failed to capture child stderr".into()))?;

    info!(
        agent_id,
        session_id,
        pid,
        executable = %spawn.executable,
        cwd = %working_directory.display(),
        "headless process spawned"
    );

    Ok(SpawnedProcess {
        child,
        pid,
        stdin,
        stdout,
        stderr,
    })
}
