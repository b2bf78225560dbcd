//! Supervisor audit, reaping, sampling and loop cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use agent_warden::config::GlobalConfig;
use agent_warden::models::health::STATE_TERMINATED;
use agent_warden::models::session::SessionState;
use agent_warden::orchestrator::process_table::{ProcessEntry, ProcessSample, ProcessTable};
use agent_warden::orchestrator::session::CloseOutcome;
use agent_warden::orchestrator::supervisor::{KillOutcome, ProcessSupervisor};
use agent_warden::{AppError, Result};

use super::test_helpers::{
    echo_registry, kill_pid, registry_for, settle, test_config, ECHO_SCRIPT,
};

const FOREIGN_BARE: u32 = 900_001;
const FOREIGN_HEADLESS: u32 = 900_002;
const UNKILLABLE: u32 = 900_003;

/// In-memory process table recording every kill.
#[derive(Clone, Default)]
struct FakeTable {
    entries: Arc<Mutex<Vec<ProcessEntry>>>,
    samples: Arc<Mutex<HashMap<u32, ProcessSample>>>,
    killed: Arc<Mutex<Vec<u32>>>,
    refreshes: Arc<Mutex<u32>>,
}

impl FakeTable {
    fn add(&self, pid: u32, args: &[&str]) {
        self.entries.lock().unwrap().push(ProcessEntry {
            pid,
            name: "agent-cli".into(),
            args: args.iter().map(|&arg| arg.to_owned()).collect(),
        });
    }

    fn killed(&self) -> Vec<u32> {
        self.killed.lock().unwrap().clone()
    }
}

impl ProcessTable for FakeTable {
    fn refresh(&mut self) {
        *self.refreshes.lock().unwrap() += 1;
    }

    fn find_by_name(&self, name: &str) -> Vec<ProcessEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.name == name)
            .cloned()
            .collect()
    }

    fn sample(&self, pid: u32) -> Option<ProcessSample> {
        self.samples.lock().unwrap().get(&pid).cloned()
    }

    fn terminate(&mut self, pid: u32) -> Result<()> {
        if pid == UNKILLABLE {
            return Err(AppError::Io("operation not permitted".into()));
        }
        self.killed.lock().unwrap().push(pid);
        self.entries.lock().unwrap().retain(|entry| entry.pid != pid);
        Ok(())
    }
}

fn audit_config(root: &std::path::Path) -> GlobalConfig {
    let mut config = test_config(root, ECHO_SCRIPT);
    config.spawn.headless_flags = vec!["--print".into()];
    config.supervisor.process_name = Some("agent-cli".into());
    config
}

#[tokio::test]
async fn audit_kills_only_foreign_processes_without_headless_flags() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = audit_config(temp.path());
    let table = FakeTable::default();
    table.add(FOREIGN_BARE, &["agent-cli", "--interactive"]);
    table.add(FOREIGN_HEADLESS, &["agent-cli", "--print"]);
    let supervisor =
        ProcessSupervisor::new(registry_for(&config), Box::new(table.clone()), &config);

    let report = supervisor.tick().await;

    assert_eq!(table.killed(), vec![FOREIGN_BARE]);
    assert_eq!(report.audit.len(), 1);
    assert_eq!(report.audit[0].pid, FOREIGN_BARE);
    assert_eq!(report.audit[0].outcome, KillOutcome::Killed);
    assert_eq!(*table.refreshes.lock().unwrap(), 1);
}

#[tokio::test]
async fn tracked_pids_are_never_audited() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = audit_config(temp.path());
    let registry = registry_for(&config);
    let table = FakeTable::default();
    table.add(FOREIGN_BARE, &["agent-cli"]);
    registry.tracker().register(FOREIGN_BARE, "ours");
    let supervisor = ProcessSupervisor::new(registry, Box::new(table.clone()), &config);

    let report = supervisor.tick().await;

    assert!(report.audit.is_empty());
    assert!(table.killed().is_empty());
}

#[tokio::test]
async fn kill_failures_are_swallowed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = audit_config(temp.path());
    let table = FakeTable::default();
    table.add(UNKILLABLE, &["agent-cli"]);
    table.add(FOREIGN_BARE, &["agent-cli"]);
    let supervisor =
        ProcessSupervisor::new(registry_for(&config), Box::new(table.clone()), &config);

    let report = supervisor.tick().await;

    assert_eq!(report.audit.len(), 2);
    assert!(matches!(
        report.audit.iter().find(|a| a.pid == UNKILLABLE).map(|a| &a.outcome),
        Some(KillOutcome::Failed(_))
    ));
    assert_eq!(table.killed(), vec![FOREIGN_BARE]);
}

#[tokio::test]
async fn audit_can_be_disabled() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = audit_config(temp.path());
    config.supervisor.audit_enabled = false;
    let table = FakeTable::default();
    table.add(FOREIGN_BARE, &["agent-cli"]);
    let supervisor =
        ProcessSupervisor::new(registry_for(&config), Box::new(table.clone()), &config);

    let report = supervisor.tick().await;

    assert!(report.audit.is_empty());
    assert!(table.killed().is_empty());
}

#[tokio::test]
async fn shutdown_suppresses_audit() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = audit_config(temp.path());
    let table = FakeTable::default();
    table.add(FOREIGN_BARE, &["agent-cli"]);
    let supervisor =
        ProcessSupervisor::new(registry_for(&config), Box::new(table.clone()), &config);

    supervisor.shutdown_all(false).await;
    assert!(supervisor.is_shutting_down());

    let report = supervisor.tick().await;
    assert!(report.audit.is_empty());
    assert!(table.killed().is_empty());
}

#[tokio::test]
async fn vanished_tracked_pid_is_recorded_terminated() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = audit_config(temp.path());
    let registry = registry_for(&config);
    registry.tracker().register(FOREIGN_HEADLESS, "ghost");
    let supervisor = ProcessSupervisor::new(registry, Box::new(FakeTable::default()), &config);

    let report = supervisor.tick().await;

    assert_eq!(report.snapshot.processes.len(), 1);
    let ghost = &report.snapshot.processes[0];
    assert_eq!(ghost.agent_id, "ghost");
    assert_eq!(ghost.os_state, STATE_TERMINATED);
    assert_eq!(supervisor.latest_snapshot(), Some(report.snapshot));
}

#[tokio::test]
async fn live_sessions_are_sampled() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = audit_config(temp.path());
    let registry = registry_for(&config);
    let session = registry.get_or_create("alpha", None).await.expect("start");
    let pid = session.pid().expect("pid");

    let table = FakeTable::default();
    table.samples.lock().unwrap().insert(
        pid,
        ProcessSample {
            cpu_percent: 12.5,
            resident_memory_bytes: 4096,
            os_state: "sleep".into(),
        },
    );
    let supervisor = ProcessSupervisor::new(Arc::clone(&registry), Box::new(table), &config);

    let report = supervisor.tick().await;

    assert!(report.reaped.is_empty());
    assert_eq!(report.snapshot.active_sessions, 1);
    assert_eq!(report.snapshot.processes.len(), 1);
    let health = &report.snapshot.processes[0];
    assert_eq!(health.agent_id, "alpha");
    assert_eq!(health.pid, pid);
    assert!((health.cpu_percent - 12.5).abs() < f32::EPSILON);
    assert_eq!(health.resident_memory_bytes, 4096);
    assert_eq!(health.os_state, "sleep");

    registry.remove_all(false).await;
}

#[tokio::test]
async fn dead_children_are_reaped() {
    let temp = tempfile::tempdir().expect("tempdir");
    let registry = echo_registry(temp.path());
    let config = audit_config(temp.path());
    let session = registry.get_or_create("alpha", None).await.expect("start");
    let pid = session.pid().expect("pid");
    let supervisor =
        ProcessSupervisor::new(Arc::clone(&registry), Box::new(FakeTable::default()), &config);

    kill_pid(pid);
    settle().await;

    let report = supervisor.tick().await;

    assert_eq!(report.reaped, vec![pid]);
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(registry.tracker().is_empty());
    assert!(report.snapshot.processes.is_empty());

    // A second tick finds nothing left to reap.
    assert!(supervisor.tick().await.reaped.is_empty());

    let result = session.execute("ping", None).await.expect("self-heals");
    assert!(result.success);

    registry.remove_all(false).await;
}

#[tokio::test]
async fn loop_ticks_immediately_and_stops_on_cancel() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = audit_config(temp.path());
    let supervisor = Arc::new(ProcessSupervisor::new(
        registry_for(&config),
        Box::new(FakeTable::default()),
        &config,
    ));

    let cancel = CancellationToken::new();
    let handle = Arc::clone(&supervisor).spawn(cancel.clone());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(supervisor.latest_snapshot().is_some());

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("loop exits promptly")
        .expect("task completes");
}

#[tokio::test]
async fn shutdown_all_closes_sessions() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = audit_config(temp.path());
    let registry = registry_for(&config);
    registry.get_or_create("alpha", None).await.expect("start");
    let supervisor =
        ProcessSupervisor::new(Arc::clone(&registry), Box::new(FakeTable::default()), &config);

    let outcomes = supervisor.shutdown_all(false).await;

    assert_eq!(outcomes, vec![("alpha".to_owned(), CloseOutcome::Graceful)]);
    assert!(registry.is_empty());
}

/// Table whose refresh blocks the calling thread.
struct SlowRefreshTable {
    inner: FakeTable,
    delay: Duration,
}

impl ProcessTable for SlowRefreshTable {
    fn refresh(&mut self) {
        std::thread::sleep(self.delay);
        self.inner.refresh();
    }

    fn find_by_name(&self, name: &str) -> Vec<ProcessEntry> {
        self.inner.find_by_name(name)
    }

    fn sample(&self, pid: u32) -> Option<ProcessSample> {
        self.inner.sample(pid)
    }

    fn terminate(&mut self, pid: u32) -> Result<()> {
        self.inner.terminate(pid)
    }
}

#[tokio::test]
async fn blocking_refresh_leaves_runtime_responsive() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = audit_config(temp.path());
    let inner = FakeTable::default();
    let table = SlowRefreshTable {
        inner: inner.clone(),
        delay: Duration::from_millis(500),
    };
    let supervisor = ProcessSupervisor::new(registry_for(&config), Box::new(table), &config);

    let started = std::time::Instant::now();
    let (report, timer_fired_at) = tokio::join!(supervisor.tick(), async {
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::time::Instant::now()
    });

    assert!(
        timer_fired_at.duration_since(started) < Duration::from_millis(400),
        "other tasks must run while the table refreshes"
    );
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert_eq!(*inner.refreshes.lock().unwrap(), 1);
    assert!(report.audit.is_empty());
}
