//! Per-agent session: one headless child process driven over stdio.
//!
//! A [`Session`] binds an agent identifier to at most one live child. The
//! child handle and its pipes sit behind an async mutex that doubles as the
//! execution lock, so commands for one agent run strictly one at a time in
//! lock-acquisition order. A separate short-lived lock guards the
//! observable view (state, pid, session id) so status reads never wait on a
//! running command.
//!
//! # Self-healing
//!
//! `execute` on a session that is not `Active`, or whose child is found
//! dead, performs exactly one transparent restart. A write that hits a
//! closed pipe marks the session `Terminated`, restarts once and retries the
//! command once. A second failure surfaces as
//! [`AppError::SessionUnavailable`].
//!
//! # Closing
//!
//! `close(false)` escalates: exit instruction + stdin EOF, terminate signal,
//! force kill, each with its own deadline. `close(true)` detaches the child
//! without signalling it.
//!
//! `close` first fires the session's interrupt token. A command in flight
//! stops reading and returns an interrupted result, and commands already
//! queued behind it fail with [`AppError::SessionUnavailable`], so close
//! never waits on a command deadline.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Child;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::completion::{CompletionHeuristic, MarkerHeuristic};
use crate::config::{GlobalConfig, ShutdownConfig, SpawnConfig, StaleOutputPolicy};
use crate::models::command::CommandResult;
use crate::models::session::{SessionState, SessionStatus};
use crate::orchestrator::pid_tracker::PidTracker;
use crate::pipe::channel::{self, PipeChannel, ReadOutcome};
use crate::pipe::{signal, spawner};
use crate::{AppError, Result};

/// Restarts a single `execute` call may perform.
const MAX_RESTARTS_PER_CALL: u32 = 1;

/// Everything a session needs to spawn and drive its child.
#[derive(Clone)]
pub struct SessionSettings {
    /// Spawn specification shared by every session.
    pub spawn: Arc<SpawnConfig>,
    /// Timeout used when `execute` is called without one.
    pub command_timeout: Duration,
    /// Window for draining stderr after stdout completes.
    pub stderr_grace: Duration,
    /// Skip pid registration so shutdown can never kill the child.
    pub persist: bool,
    /// Line asking the child to exit during a graceful close.
    pub exit_instruction: String,
    /// Handling of output left over from timed-out commands.
    pub stale_output: StaleOutputPolicy,
    /// Longest accepted output line.
    pub max_line_bytes: usize,
    /// Close escalation deadlines.
    pub shutdown: ShutdownConfig,
    /// Decides when a response is complete.
    pub heuristic: Arc<dyn CompletionHeuristic>,
}

impl SessionSettings {
    /// Derive session settings from the global configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the completion pattern is invalid.
    pub fn from_config(config: &GlobalConfig) -> Result<Self> {
        let heuristic = MarkerHeuristic::from_config(&config.session)?;
        Ok(Self {
            spawn: Arc::new(config.spawn.clone()),
            command_timeout: config.command_timeout(),
            stderr_grace: Duration::from_millis(config.session.stderr_grace_millis),
            persist: config.session.persist,
            exit_instruction: config.session.exit_instruction.clone(),
            stale_output: config.session.stale_output,
            max_line_bytes: config.session.max_line_bytes,
            shutdown: config.shutdown.clone(),
            heuristic: Arc::new(heuristic),
        })
    }

    /// Replace the completion heuristic.
    #[must_use]
    pub fn with_heuristic(mut self, heuristic: Arc<dyn CompletionHeuristic>) -> Self {
        self.heuristic = heuristic;
        self
    }
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("spawn", &self.spawn)
            .field("command_timeout", &self.command_timeout)
            .field("stderr_grace", &self.stderr_grace)
            .field("persist", &self.persist)
            .field("exit_instruction", &self.exit_instruction)
            .field("stale_output", &self.stale_output)
            .field("max_line_bytes", &self.max_line_bytes)
            .field("shutdown", &self.shutdown)
            .finish_non_exhaustive()
    }
}

/// Which step of `close` ended the child.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CloseOutcome {
    /// There was no child to close.
    NotRunning,
    /// Persist mode: the child was left running, unsignalled.
    Detached,
    /// The child exited after the exit instruction and stdin EOF.
    Graceful,
    /// The child exited after the terminate signal.
    Terminated,
    /// The child exited after the force kill.
    Killed,
    /// The child outlived every step; it may still be running.
    EscalationExhausted,
}

#[derive(Debug)]
struct LiveProcess {
    child: Child,
    pid: u32,
    channel: PipeChannel,
    registered: bool,
}

#[derive(Debug, Default)]
struct SessionView {
    state: SessionState,
    session_id: Option<String>,
    pid: Option<u32>,
    last_activity: Option<DateTime<Utc>>,
    starts: u32,
}

enum Completion {
    Matched,
    TimedOut,
    Exited,
    Interrupted,
}

/// Live binding between one agent identity and one child process.
pub struct Session {
    agent_id: String,
    working_directory: PathBuf,
    settings: SessionSettings,
    tracker: PidTracker,
    process: Mutex<Option<LiveProcess>>,
    view: StdMutex<SessionView>,
    interrupt: StdMutex<CancellationToken>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("agent_id", &self.agent_id)
            .field("working_directory", &self.working_directory)
            .field("state", &self.state())
            .field("pid", &self.pid())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Construct an `Uninitialized` session; nothing is spawned yet.
    #[must_use]
    pub fn new(
        agent_id: impl Into<String>,
        working_directory: impl Into<PathBuf>,
        settings: SessionSettings,
        tracker: PidTracker,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            working_directory: working_directory.into(),
            settings,
            tracker,
            process: Mutex::new(None),
            view: StdMutex::new(SessionView::default()),
            interrupt: StdMutex::new(CancellationToken::new()),
        }
    }

    /// Logical owner of this session.
    #[must_use]
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Directory the child runs in.
    #[must_use]
    pub fn working_directory(&self) -> &Path {
        &self.working_directory
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.view().state
    }

    /// Identifier of the current (or last) child instance.
    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.view().session_id.clone()
    }

    /// Pid of the running child.
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.view().pid
    }

    /// Point-in-time status record.
    #[must_use]
    pub fn status(&self) -> SessionStatus {
        let view = self.view();
        SessionStatus {
            agent_id: self.agent_id.clone(),
            active: view.state.is_active(),
            state: view.state,
            session_id: view.session_id.clone(),
            working_directory: self.working_directory.clone(),
            pid: view.pid,
            last_activity: view.last_activity,
            restarts: view.starts.saturating_sub(1),
        }
    }

    /// Spawn the child if it is not already running.
    ///
    /// Returns the session id of the running instance.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SpawnFailed` if the child cannot be launched; the
    /// session is left in the `Error` state.
    pub async fn start(&self) -> Result<String> {
        let span = info_span!("start", agent_id = %self.agent_id);
        async {
            let mut process = self.process.lock().await;
            self.start_locked(&mut process).await
        }
        .instrument(span)
        .await
    }

    /// Write `command` to the child and collect its response.
    ///
    /// `timeout` defaults to the configured command timeout. A timeout is
    /// not an error: the result carries `timed_out = true` and the child
    /// keeps running for the next call.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionUnavailable` if the child is gone and the
    /// single restart this call may perform fails, if the pipe closes
    /// again after that restart, or if a close is pending.
    pub async fn execute(&self, command: &str, timeout: Option<Duration>) -> Result<CommandResult> {
        let timeout = timeout.unwrap_or(self.settings.command_timeout);
        let span = info_span!("execute", agent_id = %self.agent_id);
        async {
            let mut process = self.process.lock().await;
            let interrupt = self.interrupt_token();
            if interrupt.is_cancelled() {
                return Err(AppError::SessionUnavailable(format!(
                    "agent {} is closing",
                    self.agent_id
                )));
            }
            let mut restarts_left = MAX_RESTARTS_PER_CALL;

            loop {
                if !self.is_live(&mut process) {
                    self.mark_terminated(&mut process, "process not running");
                    if restarts_left == 0 {
                        return Err(AppError::SessionUnavailable(format!(
                            "agent {} is not running after restart",
                            self.agent_id
                        )));
                    }
                    restarts_left -= 1;
                    self.start_locked(&mut process).await.map_err(|err| {
                        AppError::SessionUnavailable(format!("restart failed: {err}"))
                    })?;
                }

                match self
                    .run_command(&mut process, command, timeout, &interrupt)
                    .await
                {
                    Err(AppError::ChannelClosed(reason)) => {
                        warn!(agent_id = %self.agent_id, reason = %reason, "pipe closed while sending command");
                        self.mark_terminated(&mut process, &reason);
                    }
                    other => return other,
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Close the session.
    ///
    /// With `persist`, the child is detached without any signal and keeps
    /// running. Otherwise the escalation ladder runs until the child exits.
    /// Either way the session ends `Terminated` and its pid is unregistered.
    /// A command in flight is interrupted rather than waited for.
    pub async fn close(&self, persist: bool) -> CloseOutcome {
        let span = info_span!("close", agent_id = %self.agent_id, persist);
        async {
            self.interrupt_token().cancel();
            let mut process = self.process.lock().await;

            let outcome = match process.take() {
                None => CloseOutcome::NotRunning,
                Some(mut live) => {
                    if live.registered {
                        self.tracker.unregister(live.pid);
                    }
                    if persist {
                        detach(live, &self.agent_id);
                        CloseOutcome::Detached
                    } else {
                        self.shut_down(&mut live).await
                    }
                }
            };

            self.set_terminated();
            *self.interrupt.lock().unwrap_or_else(PoisonError::into_inner) =
                CancellationToken::new();
            info!(agent_id = %self.agent_id, ?outcome, "session closed");
            outcome
        }
        .instrument(span)
        .await
    }

    /// Unregister the child if it has exited, without waiting for the
    /// execution lock.
    ///
    /// Returns the reaped pid. A session with a command in flight is skipped;
    /// the next `execute` will notice a dead child on its own.
    #[must_use]
    pub fn reap_if_exited(&self) -> Option<u32> {
        let Ok(mut process) = self.process.try_lock() else {
            debug!(agent_id = %self.agent_id, "command in flight, skipping reap");
            return None;
        };

        let live = process.as_mut()?;
        match live.child.try_wait() {
            Ok(Some(status)) => {
                let pid = live.pid;
                info!(agent_id = %self.agent_id, pid, %status, "reaped exited session process");
                self.mark_terminated(&mut process, "reaped by supervisor");
                Some(pid)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(agent_id = %self.agent_id, %err, "failed to poll session process");
                None
            }
        }
    }

    async fn start_locked(&self, process: &mut Option<LiveProcess>) -> Result<String> {
        if self.is_live(process) {
            if let Some(session_id) = self.session_id() {
                return Ok(session_id);
            }
        }
        self.mark_terminated(process, "replaced by new start");

        self.transition(SessionState::Starting);
        let session_id = Uuid::new_v4().to_string();

        let spawned = match spawner::spawn_headless(
            &self.settings.spawn,
            &self.agent_id,
            &session_id,
            &self.working_directory,
        )
        .await
        {
            Ok(spawned) => spawned,
            Err(err) => {
                error!(agent_id = %self.agent_id, %err, "session start failed");
                self.transition(SessionState::Error);
                return Err(err);
            }
        };

        let pid = spawned.pid;
        let registered = !self.settings.persist;
        if registered {
            self.tracker.register(pid, &self.agent_id);
        }

        *process = Some(LiveProcess {
            child: spawned.child,
            pid,
            channel: PipeChannel::new(
                spawned.stdin,
                spawned.stdout,
                spawned.stderr,
                self.settings.max_line_bytes,
            ),
            registered,
        });

        {
            let mut view = self.view();
            view.session_id = Some(session_id.clone());
            view.pid = Some(pid);
            view.starts += 1;
        }
        self.transition(SessionState::Active);

        info!(agent_id = %self.agent_id, session_id = %session_id, pid, registered, "session active");
        Ok(session_id)
    }

    async fn run_command(
        &self,
        process: &mut Option<LiveProcess>,
        command: &str,
        timeout: Duration,
        interrupt: &CancellationToken,
    ) -> Result<CommandResult> {
        let Some(live) = process.as_mut() else {
            return Err(AppError::ChannelClosed("no running process".into()));
        };
        let session_id = self.session_id().unwrap_or_default();

        if self.settings.stale_output == StaleOutputPolicy::Discard {
            let dropped = live.channel.discard_pending().await;
            if dropped > 0 {
                debug!(agent_id = %self.agent_id, dropped, "dropped stale output before command");
            }
        }

        let started = Instant::now();
        live.channel
            .write_line(command)
            .await
            .map_err(|err| match err {
                AppError::ChannelClosed(_) => err,
                other => AppError::ChannelClosed(other.to_string()),
            })?;

        let deadline = channel::deadline_after(started, timeout);
        let mut stdout = Vec::new();
        let completion = loop {
            let outcome = tokio::select! {
                outcome = live.channel.read_line(deadline) => outcome,
                () = interrupt.cancelled() => break Completion::Interrupted,
            };
            match outcome {
                ReadOutcome::Line(line) => {
                    let done = !line.trim().is_empty() && self.settings.heuristic.is_complete(&line);
                    stdout.push(line);
                    if done {
                        break Completion::Matched;
                    }
                }
                ReadOutcome::TimedOut => break Completion::TimedOut,
                ReadOutcome::Closed => break Completion::Exited,
            }
        };

        let stderr = if matches!(completion, Completion::Interrupted) {
            Vec::new()
        } else {
            live.channel.drain_stderr(self.settings.stderr_grace).await
        };
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match completion {
            Completion::Matched => {
                self.view().last_activity = Some(Utc::now());
                info!(
                    agent_id = %self.agent_id,
                    session_id = %session_id,
                    duration_ms,
                    lines = stdout.len(),
                    "command completed"
                );
                Ok(CommandResult::completed(
                    command,
                    &session_id,
                    &stdout,
                    &stderr,
                    duration_ms,
                ))
            }
            Completion::TimedOut => {
                warn!(
                    agent_id = %self.agent_id,
                    session_id = %session_id,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "command timed out, session kept alive"
                );
                Ok(CommandResult::timed_out(
                    command,
                    &session_id,
                    &stdout,
                    &stderr,
                    duration_ms,
                ))
            }
            Completion::Interrupted => {
                warn!(agent_id = %self.agent_id, session_id = %session_id, "command interrupted by close");
                Ok(CommandResult::interrupted(
                    command,
                    &session_id,
                    &stdout,
                    &stderr,
                    duration_ms,
                ))
            }
            Completion::Exited => {
                warn!(agent_id = %self.agent_id, session_id = %session_id, "session process exited mid-command");
                let result =
                    CommandResult::exited(command, &session_id, &stdout, &stderr, duration_ms);
                self.mark_terminated(process, "stdout closed during command");
                Ok(result)
            }
        }
    }

    async fn shut_down(&self, live: &mut LiveProcess) -> CloseOutcome {
        let shutdown = &self.settings.shutdown;
        let pid = live.pid;

        if let Err(err) = live.channel.write_line(&self.settings.exit_instruction).await {
            debug!(agent_id = %self.agent_id, %err, "exit instruction not delivered");
        }
        live.channel.close_stdin().await;
        if wait_for_exit(live, shutdown.graceful()).await {
            return CloseOutcome::Graceful;
        }

        warn!(agent_id = %self.agent_id, pid, "no exit within graceful window, sending terminate");
        if let Err(err) = signal::terminate_group(pid) {
            warn!(agent_id = %self.agent_id, pid, %err, "terminate signal failed");
        }
        if wait_for_exit(live, shutdown.terminate()).await {
            return CloseOutcome::Terminated;
        }

        warn!(agent_id = %self.agent_id, pid, "no exit after terminate, forcing kill");
        if let Err(err) = signal::kill_group(pid) {
            debug!(agent_id = %self.agent_id, pid, %err, "group kill failed");
        }
        if let Err(err) = live.child.start_kill() {
            warn!(agent_id = %self.agent_id, pid, %err, "force kill failed");
        }
        if wait_for_exit(live, shutdown.kill()).await {
            return CloseOutcome::Killed;
        }

        error!(
            agent_id = %self.agent_id,
            pid,
            "shutdown escalation exhausted, process may still be running"
        );
        CloseOutcome::EscalationExhausted
    }

    fn is_live(&self, process: &mut Option<LiveProcess>) -> bool {
        if !self.state().is_active() {
            return false;
        }
        let Some(live) = process.as_mut() else {
            return false;
        };
        if live.channel.is_closed() {
            debug!(agent_id = %self.agent_id, pid = live.pid, "pipe already closed");
            return false;
        }
        match live.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                info!(agent_id = %self.agent_id, pid = live.pid, %status, "session process has exited");
                false
            }
            Err(err) => {
                warn!(agent_id = %self.agent_id, pid = live.pid, %err, "failed to poll session process");
                false
            }
        }
    }

    /// Drop the process handle and move to `Terminated`. Idempotent.
    fn mark_terminated(&self, process: &mut Option<LiveProcess>, reason: &str) {
        let had_process = match process.take() {
            Some(mut live) => {
                if live.registered {
                    self.tracker.unregister(live.pid);
                }
                if matches!(live.child.try_wait(), Ok(None)) {
                    // Pipe is unusable but the child lives on; do not orphan it.
                    if let Err(err) = signal::kill_group(live.pid) {
                        debug!(agent_id = %self.agent_id, pid = live.pid, %err, "group kill failed");
                    }
                    if let Err(err) = live.child.start_kill() {
                        warn!(agent_id = %self.agent_id, pid = live.pid, %err, "failed to kill stale process");
                    }
                }
                true
            }
            None => false,
        };

        let mut view = self.view();
        if had_process || matches!(view.state, SessionState::Active | SessionState::Starting) {
            view.state = SessionState::Terminated;
            view.pid = None;
            info!(agent_id = %self.agent_id, reason, "session terminated");
        }
    }

    fn set_terminated(&self) {
        let mut view = self.view();
        view.state = SessionState::Terminated;
        view.pid = None;
    }

    fn transition(&self, next: SessionState) {
        let mut view = self.view();
        if !view.state.can_transition_to(next) {
            warn!(
                agent_id = %self.agent_id,
                from = %view.state,
                to = %next,
                "unexpected session state transition"
            );
        }
        view.state = next;
    }

    fn interrupt_token(&self) -> CancellationToken {
        self.interrupt
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn view(&self) -> MutexGuard<'_, SessionView> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Wait up to `limit` for the child to exit, draining its output meanwhile
/// so a chatty child cannot block on a full pipe.
async fn wait_for_exit(live: &mut LiveProcess, limit: Duration) -> bool {
    let LiveProcess { child, channel, .. } = live;
    let waited = tokio::time::timeout(limit, async {
        tokio::select! {
            status = child.wait() => status,
            () = channel.drain_until_closed() => child.wait().await,
        }
    })
    .await;

    match waited {
        Ok(Ok(status)) => {
            debug!(%status, "child exited");
            true
        }
        Ok(Err(err)) => {
            warn!(%err, "wait on child failed, assuming it is gone");
            true
        }
        Err(_elapsed) => false,
    }
}

/// Hand the child to a background task that keeps its pipes open and
/// drained until it exits on its own.
fn detach(live: LiveProcess, agent_id: &str) {
    let agent_id = agent_id.to_owned();
    let LiveProcess {
        mut child,
        pid,
        mut channel,
        ..
    } = live;

    info!(agent_id = %agent_id, pid, "detaching session process");
    tokio::spawn(async move {
        tokio::select! {
            status = child.wait() => {
                debug!(agent_id = %agent_id, pid, ?status, "detached process exited");
            }
            () = channel.drain_until_closed() => {
                let status = child.wait().await;
                debug!(agent_id = %agent_id, pid, ?status, "detached process exited");
            }
        }
    });
}
