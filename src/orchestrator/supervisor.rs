//! Fleet supervisor: headless audit, reaping and health sampling.
//!
//! Each tick runs three steps in order:
//!
//! 1. **Audit**: processes named like the managed executable whose pid is
//!    not tracked, and whose command line lacks the headless flags, are
//!    killed. Failures are logged and swallowed.
//! 2. **Reap**: sessions whose child has exited are marked `Terminated`
//!    and their pids unregistered.
//! 3. **Sample**: every still-tracked pid is sampled; pids that vanished
//!    are recorded with state `terminated`.
//!
//! The background loop started by [`ProcessSupervisor::spawn`] runs a tick,
//! then waits for the interval or cancellation, whichever comes first. A
//! tick in progress always runs to completion.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use crate::config::GlobalConfig;
use crate::models::health::{HealthSnapshot, ProcessHealth};
use crate::orchestrator::process_table::{self, ProcessTable, SysinfoTable};
use crate::orchestrator::registry::SessionRegistry;
use crate::orchestrator::session::CloseOutcome;

/// Result of trying to kill a foreign process.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "result", content = "reason")]
pub enum KillOutcome {
    /// The kill signal was delivered.
    Killed,
    /// The kill failed; the process was left alone.
    Failed(String),
}

/// One foreign process handled by the audit.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct AuditAction {
    /// Foreign pid.
    pub pid: u32,
    /// Command line that failed the headless check.
    pub args: Vec<String>,
    /// What happened to it.
    pub outcome: KillOutcome,
}

/// Everything one tick did.
#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    /// Foreign processes the audit acted on.
    pub audit: Vec<AuditAction>,
    /// Pids of session children found dead and unregistered.
    pub reaped: Vec<u32>,
    /// Health of the tracked fleet after reaping.
    pub snapshot: HealthSnapshot,
}

/// Background monitor for every session process.
pub struct ProcessSupervisor {
    registry: Arc<SessionRegistry>,
    table: Arc<StdMutex<Box<dyn ProcessTable>>>,
    process_name: String,
    headless_flags: Vec<String>,
    interval: Duration,
    audit_enabled: bool,
    shutting_down: AtomicBool,
    latest: StdMutex<Option<HealthSnapshot>>,
}

impl std::fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("process_name", &self.process_name)
            .field("headless_flags", &self.headless_flags)
            .field("interval", &self.interval)
            .field("audit_enabled", &self.audit_enabled)
            .field("shutting_down", &self.is_shutting_down())
            .finish_non_exhaustive()
    }
}

impl ProcessSupervisor {
    /// Supervisor over the live OS process table.
    #[must_use]
    pub fn from_config(registry: Arc<SessionRegistry>, config: &GlobalConfig) -> Self {
        Self::new(registry, Box::new(SysinfoTable::new()), config)
    }

    /// Supervisor over an arbitrary process table.
    #[must_use]
    pub fn new(
        registry: Arc<SessionRegistry>,
        table: Box<dyn ProcessTable>,
        config: &GlobalConfig,
    ) -> Self {
        Self {
            registry,
            table: Arc::new(StdMutex::new(table)),
            process_name: config.process_name(),
            headless_flags: config.spawn.headless_flags.clone(),
            interval: config.supervisor_interval(),
            audit_enabled: config.supervisor.audit_enabled,
            shutting_down: AtomicBool::new(false),
            latest: StdMutex::new(None),
        }
    }

    /// Registry this supervisor watches.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Whether [`shutdown_all`](Self::shutdown_all) has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Snapshot produced by the most recent tick.
    #[must_use]
    pub fn latest_snapshot(&self) -> Option<HealthSnapshot> {
        self.latest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one audit, reap and sample pass.
    ///
    /// The process table refresh runs on the blocking pool.
    pub async fn tick(&self) -> TickReport {
        let span = info_span!("supervisor_tick", process_name = %self.process_name);
        async {
            let refreshing = Arc::clone(&self.table);
            if let Err(err) = tokio::task::spawn_blocking(move || {
                refreshing
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .refresh();
            })
            .await
            {
                warn!(%err, "process table refresh failed");
            }

            let (audit, reaped, snapshot) = {
                let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
                let audit = if self.audit_enabled && !self.is_shutting_down() {
                    self.audit(&mut **table)
                } else {
                    Vec::new()
                };
                let reaped = self.reap();
                let snapshot = self.sample(&**table);
                (audit, reaped, snapshot)
            };

            info!(
                foreign_killed = audit
                    .iter()
                    .filter(|action| action.outcome == KillOutcome::Killed)
                    .count(),
                reaped = reaped.len(),
                active_sessions = snapshot.active_sessions,
                tracked = snapshot.processes.len(),
                "supervisor tick complete"
            );

            *self.latest.lock().unwrap_or_else(PoisonError::into_inner) = Some(snapshot.clone());

            TickReport {
                audit,
                reaped,
                snapshot,
            }
        }
        .instrument(span)
        .await
    }

    /// Start the monitoring loop on the runtime.
    ///
    /// The first tick runs immediately. The loop exits promptly once
    /// `cancel` fires, after any tick in progress completes.
    #[must_use]
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(interval_secs = self.interval.as_secs(), "process supervisor started");
            loop {
                self.tick().await;

                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("process supervisor shutting down");
                        break;
                    }
                    () = tokio::time::sleep(self.interval) => {}
                }
            }
        })
    }

    /// Stop auditing and close every session.
    ///
    /// With `persist`, children are detached instead of being killed.
    pub async fn shutdown_all(&self, persist: bool) -> Vec<(String, CloseOutcome)> {
        self.shutting_down.store(true, Ordering::SeqCst);
        info!(persist, sessions = self.registry.len(), "shutting down all sessions");
        self.registry.remove_all(persist).await
    }

    fn audit(&self, table: &mut dyn ProcessTable) -> Vec<AuditAction> {
        let own_pid = std::process::id();
        let tracker = self.registry.tracker();

        let suspects: Vec<_> = table
            .find_by_name(&self.process_name)
            .into_iter()
            .filter(|entry| entry.pid != own_pid && !tracker.contains(entry.pid))
            .filter(|entry| !process_table::has_headless_flags(&entry.args, &self.headless_flags))
            .collect();

        suspects
            .into_iter()
            .map(|entry| {
                let outcome = match table.terminate(entry.pid) {
                    Ok(()) => {
                        info!(pid = entry.pid, name = %entry.name, "killed non-headless foreign process");
                        KillOutcome::Killed
                    }
                    Err(err) => {
                        warn!(pid = entry.pid, %err, "failed to kill foreign process");
                        KillOutcome::Failed(err.to_string())
                    }
                };
                AuditAction {
                    pid: entry.pid,
                    args: entry.args,
                    outcome,
                }
            })
            .collect()
    }

    fn reap(&self) -> Vec<u32> {
        self.registry
            .sessions()
            .iter()
            .filter_map(|session| session.reap_if_exited())
            .collect()
    }

    fn sample(&self, table: &dyn ProcessTable) -> HealthSnapshot {
        let processes = self
            .registry
            .tracker()
            .snapshot()
            .into_iter()
            .map(|(pid, agent_id)| match table.sample(pid) {
                Some(sample) => ProcessHealth {
                    agent_id,
                    pid,
                    cpu_percent: sample.cpu_percent,
                    resident_memory_bytes: sample.resident_memory_bytes,
                    os_state: sample.os_state,
                },
                None => {
                    debug!(pid, agent_id = %agent_id, "tracked process vanished before sampling");
                    ProcessHealth::terminated(agent_id, pid)
                }
            })
            .collect();

        HealthSnapshot {
            taken_at: Utc::now(),
            active_sessions: self.registry.active_count(),
            processes,
        }
    }
}
