//! Keyed collection of sessions, one per agent.
//!
//! The registry is the surface the rest of an application talks to. It is
//! constructed explicitly and shared by `Arc`; there is no process-wide
//! instance.
//!
//! Locking is two-level: a short `std::sync::Mutex` guards the map and is
//! never held across an `.await`, and an async creation lock serialises
//! get-or-create so two callers for the same new agent cannot both spawn.
//! Command execution is serialised per session, not here.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::Mutex;
use tracing::{info, info_span, Instrument};

use crate::config::{self, GlobalConfig};
use crate::models::command::CommandResult;
use crate::models::session::{SessionState, SessionStatus};
use crate::orchestrator::pid_tracker::PidTracker;
use crate::orchestrator::session::{CloseOutcome, Session, SessionSettings};
use crate::{AppError, Result};

/// Map from agent id to its session.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: StdMutex<HashMap<String, Arc<Session>>>,
    create_lock: Mutex<()>,
    tracker: PidTracker,
    settings: SessionSettings,
    workspace_root: PathBuf,
    max_sessions: usize,
}

impl SessionRegistry {
    /// Build a registry from the global configuration.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if session settings cannot be derived.
    pub fn from_config(config: &GlobalConfig) -> Result<Self> {
        let settings = SessionSettings::from_config(config)?;
        Ok(Self::new(
            settings,
            config.workspace_root.clone(),
            usize::try_from(config.max_concurrent_sessions).unwrap_or(usize::MAX),
        ))
    }

    /// Build a registry from explicit parts.
    #[must_use]
    pub fn new(settings: SessionSettings, workspace_root: PathBuf, max_sessions: usize) -> Self {
        Self {
            sessions: StdMutex::new(HashMap::new()),
            create_lock: Mutex::new(()),
            tracker: PidTracker::new(),
            settings,
            workspace_root,
            max_sessions,
        }
    }

    /// Pid bookkeeping shared with the supervisor.
    #[must_use]
    pub fn tracker(&self) -> &PidTracker {
        &self.tracker
    }

    /// Settings every new session is created with.
    #[must_use]
    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    /// Return the session for `agent_id`, creating and starting it if absent.
    ///
    /// An existing session is returned as-is even if its child has died; it
    /// heals itself on the next `execute`. `working_directory` defaults to a
    /// directory named after the agent below the workspace root.
    ///
    /// # Errors
    ///
    /// - `AppError::LimitReached` if a new session would exceed the cap.
    /// - `AppError::SpawnFailed` if the new session fails to start; nothing
    ///   is cached for the agent in that case.
    pub async fn get_or_create(
        &self,
        agent_id: &str,
        working_directory: Option<PathBuf>,
    ) -> Result<Arc<Session>> {
        if let Some(existing) = self.get(agent_id) {
            return Ok(existing);
        }

        let span = info_span!("get_or_create", agent_id);
        async {
            let _creating = self.create_lock.lock().await;

            if let Some(existing) = self.get(agent_id) {
                return Ok(existing);
            }

            let count = self.len();
            if count >= self.max_sessions {
                return Err(AppError::LimitReached(format!(
                    "concurrent session limit reached ({count}/{})",
                    self.max_sessions
                )));
            }

            let working_directory = working_directory
                .unwrap_or_else(|| config::agent_workspace(&self.workspace_root, agent_id));
            let session = Arc::new(Session::new(
                agent_id,
                working_directory,
                self.settings.clone(),
                self.tracker.clone(),
            ));
            session.start().await?;

            self.map().insert(agent_id.to_owned(), Arc::clone(&session));
            info!(agent_id, "session registered");
            Ok(session)
        }
        .instrument(span)
        .await
    }

    /// Execute `command` on the agent's session, creating it on first use.
    ///
    /// # Errors
    ///
    /// Propagates errors from [`get_or_create`](Self::get_or_create) and
    /// [`Session::execute`].
    pub async fn execute(
        &self,
        agent_id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<CommandResult> {
        let session = self.get_or_create(agent_id, None).await?;
        session.execute(command, timeout).await
    }

    /// Session registered for `agent_id`.
    #[must_use]
    pub fn get(&self, agent_id: &str) -> Option<Arc<Session>> {
        self.map().get(agent_id).cloned()
    }

    /// Close the agent's session and forget it.
    ///
    /// Returns `None` when no session was registered.
    pub async fn remove(&self, agent_id: &str) -> Option<CloseOutcome> {
        let session = self.map().remove(agent_id)?;
        let outcome = session.close(false).await;
        info!(agent_id, ?outcome, "session removed");
        Some(outcome)
    }

    /// Close every session and empty the registry.
    ///
    /// Sessions are closed concurrently; results are sorted by agent id.
    pub async fn remove_all(&self, persist: bool) -> Vec<(String, CloseOutcome)> {
        let drained: Vec<Arc<Session>> = self.map().drain().map(|(_, session)| session).collect();
        let closes = drained.iter().map(|session| async move {
            let outcome = session.close(persist).await;
            (session.agent_id().to_owned(), outcome)
        });

        let mut outcomes = join_all(closes).await;
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        info!(count = outcomes.len(), persist, "all sessions closed");
        outcomes
    }

    /// Every registered session.
    #[must_use]
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.map().values().cloned().collect()
    }

    /// Status of the agent's session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` if no session is registered.
    pub fn status(&self, agent_id: &str) -> Result<SessionStatus> {
        self.get(agent_id)
            .map(|session| session.status())
            .ok_or_else(|| AppError::NotFound(format!("no session for agent {agent_id}")))
    }

    /// Status of every session, sorted by agent id.
    #[must_use]
    pub fn status_all(&self) -> Vec<SessionStatus> {
        let mut statuses: Vec<SessionStatus> =
            self.sessions().iter().map(|session| session.status()).collect();
        statuses.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        statuses
    }

    /// Number of sessions in the `Active` state.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.sessions()
            .iter()
            .filter(|session| session.state() == SessionState::Active)
            .count()
    }

    /// Number of registered sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map().len()
    }

    /// Whether no session is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map().is_empty()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
