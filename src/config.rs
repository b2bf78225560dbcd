//! Global configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::pipe::codec;
use crate::{AppError, Result};

/// Longest accepted `session.command_timeout_seconds` (one week).
pub const MAX_COMMAND_TIMEOUT_SECONDS: u64 = 7 * 24 * 60 * 60;

/// Longest accepted `session.stderr_grace_millis`.
pub const MAX_STDERR_GRACE_MILLIS: u64 = 60_000;

/// How the external tool is launched for every session.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SpawnConfig {
    /// Executable path or name resolved through `PATH`.
    pub executable: String,
    /// Arguments passed before the headless flags.
    #[serde(default)]
    pub args: Vec<String>,
    /// Flags forcing non-interactive, quiet operation.
    ///
    /// Always appended to the command line, and audited for by the
    /// supervisor on any process sharing the executable's name.
    #[serde(default)]
    pub headless_flags: Vec<String>,
    /// Extra environment variables injected into every child.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Variables inherited from the supervisor's own environment.
    #[serde(default = "default_inherit_env")]
    pub inherit_env: Vec<String>,
}

fn default_inherit_env() -> Vec<String> {
    [
        "PATH",
        "HOME",
        "USER",
        "LANG",
        "TMPDIR",
        // Windows-specific variables.
        "USERPROFILE",
        "SystemRoot",
        "TEMP",
        "TMP",
        "USERNAME",
        "APPDATA",
        "LOCALAPPDATA",
        "COMSPEC",
    ]
    .iter()
    .map(|&key| key.to_owned())
    .collect()
}

/// What happens to stdout lines still unread when a command times out.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StaleOutputPolicy {
    /// Leave them in the pipe; the next command reads them as its own output.
    #[default]
    Carry,
    /// Drop whatever is already readable before writing the next command.
    Discard,
}

/// Per-session command behaviour.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SessionConfig {
    /// Default per-command timeout.
    #[serde(default = "default_command_timeout_seconds")]
    pub command_timeout_seconds: u64,
    /// Window for draining trailing stderr after stdout completes.
    #[serde(default = "default_stderr_grace_millis")]
    pub stderr_grace_millis: u64,
    /// Detach instead of terminating children on close.
    #[serde(default)]
    pub persist: bool,
    /// Line written to the child to ask it to exit.
    #[serde(default = "default_exit_instruction")]
    pub exit_instruction: String,
    /// A response is complete when its last non-empty line ends with one of these.
    #[serde(default = "default_completion_suffixes")]
    pub completion_suffixes: Vec<String>,
    /// A response is complete when a line contains one of these.
    #[serde(default = "default_completion_tokens")]
    pub completion_tokens: Vec<String>,
    /// Optional regex matched against each non-empty line.
    #[serde(default)]
    pub completion_pattern: Option<String>,
    /// Handling of output left over from a timed-out command.
    #[serde(default)]
    pub stale_output: StaleOutputPolicy,
    /// Longest accepted stdout/stderr line; longer lines are skipped.
    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

fn default_command_timeout_seconds() -> u64 {
    600
}

fn default_stderr_grace_millis() -> u64 {
    1000
}

fn default_exit_instruction() -> String {
    "exit".into()
}

fn default_completion_suffixes() -> Vec<String> {
    vec!["```".into()]
}

fn default_completion_tokens() -> Vec<String> {
    vec!["[DONE]".into()]
}

fn default_max_line_bytes() -> usize {
    codec::MAX_LINE_BYTES
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            command_timeout_seconds: default_command_timeout_seconds(),
            stderr_grace_millis: default_stderr_grace_millis(),
            persist: false,
            exit_instruction: default_exit_instruction(),
            completion_suffixes: default_completion_suffixes(),
            completion_tokens: default_completion_tokens(),
            completion_pattern: None,
            stale_output: StaleOutputPolicy::default(),
            max_line_bytes: default_max_line_bytes(),
        }
    }
}

/// Deadlines for each step of the close escalation ladder.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct ShutdownConfig {
    /// Wait for a natural exit after the exit instruction and stdin EOF.
    #[serde(default = "default_graceful_seconds")]
    pub graceful_seconds: u64,
    /// Wait after the terminate signal.
    #[serde(default = "default_terminate_seconds")]
    pub terminate_seconds: u64,
    /// Wait after the force kill.
    #[serde(default = "default_kill_seconds")]
    pub kill_seconds: u64,
}

fn default_graceful_seconds() -> u64 {
    10
}

fn default_terminate_seconds() -> u64 {
    5
}

fn default_kill_seconds() -> u64 {
    5
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            graceful_seconds: default_graceful_seconds(),
            terminate_seconds: default_terminate_seconds(),
            kill_seconds: default_kill_seconds(),
        }
    }
}

impl ShutdownConfig {
    /// Graceful step deadline.
    #[must_use]
    pub fn graceful(&self) -> Duration {
        Duration::from_secs(self.graceful_seconds)
    }

    /// Terminate-signal step deadline.
    #[must_use]
    pub fn terminate(&self) -> Duration {
        Duration::from_secs(self.terminate_seconds)
    }

    /// Force-kill step deadline.
    #[must_use]
    pub fn kill(&self) -> Duration {
        Duration::from_secs(self.kill_seconds)
    }
}

/// Monitoring loop settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct SupervisorConfig {
    /// Seconds between ticks.
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    /// OS process name audited for; defaults to the executable's file name.
    #[serde(default)]
    pub process_name: Option<String>,
    /// Whether untracked non-headless processes are killed.
    #[serde(default = "default_true")]
    pub audit_enabled: bool,
}

fn default_interval_seconds() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            process_name: None,
            audit_enabled: true,
        }
    }
}

fn default_max_concurrent_sessions() -> u32 {
    8
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// Parent directory of the per-agent working directories.
    pub workspace_root: PathBuf,
    /// Maximum number of sessions held by the registry.
    #[serde(default = "default_max_concurrent_sessions")]
    pub max_concurrent_sessions: u32,
    /// Spawn specification for the external tool.
    pub spawn: SpawnConfig,
    /// Command execution settings.
    #[serde(default)]
    pub session: SessionConfig,
    /// Close escalation deadlines.
    #[serde(default)]
    pub shutdown: ShutdownConfig,
    /// Monitoring loop settings.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Default timeout applied when `execute` is called without one.
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.session.command_timeout_seconds)
    }

    /// Interval between supervisor ticks.
    #[must_use]
    pub fn supervisor_interval(&self) -> Duration {
        Duration::from_secs(self.supervisor.interval_seconds)
    }

    /// Name under which managed processes appear in the OS process table.
    #[must_use]
    pub fn process_name(&self) -> String {
        self.supervisor.process_name.clone().unwrap_or_else(|| {
            Path::new(&self.spawn.executable)
                .file_name()
                .map_or_else(
                    || self.spawn.executable.clone(),
                    |name| name.to_string_lossy().into_owned(),
                )
        })
    }

    /// Working directory assigned to `agent_id` under the workspace root.
    ///
    /// Characters outside `[A-Za-z0-9_-]` are replaced so an identifier can
    /// never escape the root.
    #[must_use]
    pub fn agent_workspace(&self, agent_id: &str) -> PathBuf {
        agent_workspace(&self.workspace_root, agent_id)
    }

    fn validate(&self) -> Result<()> {
        if self.spawn.executable.trim().is_empty() {
            return Err(AppError::Config("spawn.executable must not be empty".into()));
        }

        if self.workspace_root.as_os_str().is_empty() {
            return Err(AppError::Config("workspace_root must not be empty".into()));
        }

        if self.max_concurrent_sessions == 0 {
            return Err(AppError::Config(
                "max_concurrent_sessions must be greater than zero".into(),
            ));
        }

        if self.session.command_timeout_seconds == 0 {
            return Err(AppError::Config(
                "session.command_timeout_seconds must be greater than zero".into(),
            ));
        }

        if self.session.command_timeout_seconds > MAX_COMMAND_TIMEOUT_SECONDS {
            return Err(AppError::Config(format!(
                "session.command_timeout_seconds must not exceed {MAX_COMMAND_TIMEOUT_SECONDS}"
            )));
        }

        if self.session.stderr_grace_millis > MAX_STDERR_GRACE_MILLIS {
            return Err(AppError::Config(format!(
                "session.stderr_grace_millis must not exceed {MAX_STDERR_GRACE_MILLIS}"
            )));
        }

        if self.supervisor.interval_seconds == 0 {
            return Err(AppError::Config(
                "supervisor.interval_seconds must be greater than zero".into(),
            ));
        }

        if self.session.max_line_bytes == 0 {
            return Err(AppError::Config(
                "session.max_line_bytes must be greater than zero".into(),
            ));
        }

        if let Some(ref pattern) = self.session.completion_pattern {
            regex::Regex::new(pattern).map_err(|err| {
                AppError::Config(format!("session.completion_pattern invalid: {err}"))
            })?;
        }

        Ok(())
    }
}

/// Map an agent identifier to its working directory below `root`.
#[must_use]
pub fn agent_workspace(root: &Path, agent_id: &str) -> PathBuf {
    let sanitized: String = agent_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let name = if sanitized.is_empty() {
        "_".to_owned()
    } else {
        sanitized
    };
    root.join(name)
}
