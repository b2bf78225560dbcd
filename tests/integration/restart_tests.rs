//! Self-healing restart when the child dies or stops reading.

use std::time::Duration;

use agent_warden::models::session::SessionState;
use agent_warden::AppError;

use super::test_helpers::{
    echo_registry, kill_pid, registry_for, settle, test_config, ECHO_SCRIPT,
};

/// Child that closes its stdin but keeps running, every time it starts.
const CLOSES_STDIN_SCRIPT: &str = "exec 0<&-; sleep 30";

/// A command larger than a pipe buffer, so the write only finishes once the
/// child reads it and fails once the child closes its end.
fn large_command() -> String {
    "x".repeat(256 * 1024)
}

#[tokio::test]
async fn killed_child_is_restarted_on_next_execute() {
    let temp = tempfile::tempdir().expect("tempdir");
    let registry = echo_registry(temp.path());
    let session = registry.get_or_create("alpha", None).await.expect("start");

    let old_pid = session.pid().expect("pid");
    let old_session_id = session.session_id().expect("session id");

    kill_pid(old_pid);
    settle().await;

    let result = session.execute("ping", None).await.expect("self-heals");

    assert!(result.success);
    assert_eq!(result.stdout, "ok ping [DONE]");
    assert_ne!(result.session_id, old_session_id);

    let new_pid = session.pid().expect("new pid");
    assert_ne!(new_pid, old_pid);
    assert!(!registry.tracker().contains(old_pid));
    assert!(registry.tracker().contains(new_pid));
    assert_eq!(session.status().restarts, 1);

    registry.remove_all(false).await;
}

#[tokio::test]
async fn exit_during_command_is_reported_not_retried() {
    let temp = tempfile::tempdir().expect("tempdir");
    let registry = echo_registry(temp.path());
    let session = registry.get_or_create("alpha", None).await.expect("start");
    let first_session_id = session.session_id().expect("session id");

    let result = session.execute("die", None).await.expect("result, not error");

    assert!(!result.success);
    assert!(!result.timed_out);
    assert_eq!(result.error.as_deref(), Some("session process exited"));
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(registry.tracker().is_empty());

    let next = session.execute("ping", None).await.expect("self-heals");
    assert!(next.success);
    assert_ne!(next.session_id, first_session_id);

    registry.remove_all(false).await;
}

#[tokio::test]
async fn failed_restart_surfaces_session_unavailable() {
    let temp = tempfile::tempdir().expect("tempdir");
    let registry = echo_registry(temp.path());
    let session = registry.get_or_create("alpha", None).await.expect("start");

    kill_pid(session.pid().expect("pid"));
    settle().await;

    // A regular file where the working directory was makes the respawn fail.
    let workdir = session.working_directory().to_path_buf();
    std::fs::remove_dir_all(&workdir).expect("remove workdir");
    std::fs::write(&workdir, b"not a directory").expect("block workdir");

    let err = session
        .execute("ping", None)
        .await
        .expect_err("restart must fail");
    assert!(matches!(err, AppError::SessionUnavailable(_)), "{err}");
    assert_eq!(session.state(), SessionState::Error);

    std::fs::remove_file(&workdir).expect("unblock workdir");
    let result = session.execute("ping", None).await.expect("recovers");
    assert!(result.success);

    registry.remove_all(false).await;
}

#[tokio::test]
async fn closed_stdin_restarts_and_retries_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script =
        format!("if [ ! -f marker ]; then touch marker; {CLOSES_STDIN_SCRIPT}; fi\n{ECHO_SCRIPT}");
    let registry = registry_for(&test_config(temp.path(), &script));
    let session = registry.get_or_create("alpha", None).await.expect("start");

    let old_pid = session.pid().expect("pid");
    let old_session_id = session.session_id().expect("session id");

    let command = large_command();
    let result = session
        .execute(&command, Some(Duration::from_secs(30)))
        .await
        .expect("retried on a fresh child");

    assert!(result.success);
    assert_eq!(result.stdout, format!("ok {command} [DONE]"));
    assert_ne!(result.session_id, old_session_id);
    assert_eq!(session.status().restarts, 1);
    assert_eq!(session.state(), SessionState::Active);

    let new_pid = session.pid().expect("new pid");
    assert_ne!(new_pid, old_pid);
    assert!(!registry.tracker().contains(old_pid));
    assert!(registry.tracker().contains(new_pid));

    registry.remove_all(false).await;
}

#[tokio::test]
async fn closed_stdin_after_restart_is_session_unavailable() {
    let temp = tempfile::tempdir().expect("tempdir");
    let registry = registry_for(&test_config(temp.path(), CLOSES_STDIN_SCRIPT));
    let session = registry.get_or_create("alpha", None).await.expect("start");

    let err = session
        .execute(&large_command(), Some(Duration::from_secs(30)))
        .await
        .expect_err("second broken pipe gives up");

    assert!(matches!(err, AppError::SessionUnavailable(_)), "{err}");
    assert_eq!(session.status().restarts, 1);
    assert_eq!(session.state(), SessionState::Terminated);
    assert!(registry.tracker().is_empty());

    registry.remove_all(false).await;
}
