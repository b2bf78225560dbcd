//! Command timeouts and stale output handling.

use std::time::Duration;

use agent_warden::config::StaleOutputPolicy;
use agent_warden::models::session::SessionState;

use super::test_helpers::{echo_registry, registry_for, test_config, ECHO_SCRIPT};

#[tokio::test]
async fn timeout_keeps_session_alive() {
    let temp = tempfile::tempdir().expect("tempdir");
    let registry = echo_registry(temp.path());
    let session = registry.get_or_create("alpha", None).await.expect("start");
    let pid = session.pid();
    let session_id = session.session_id();

    let result = session
        .execute("stall", Some(Duration::from_millis(300)))
        .await
        .expect("timeout is not an error");

    assert!(result.timed_out);
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("timed out"));
    assert_eq!(session.state(), SessionState::Active);
    assert_eq!(session.pid(), pid);

    let next = session.execute("ping", None).await.expect("execute");
    assert!(next.success);
    assert_eq!(Some(next.session_id), session_id);
    assert_eq!(next.stdout, "ok ping [DONE]");

    registry.remove_all(false).await;
}

#[tokio::test]
async fn carry_policy_hands_late_output_to_next_command() {
    let temp = tempfile::tempdir().expect("tempdir");
    let registry = echo_registry(temp.path());
    let session = registry.get_or_create("alpha", None).await.expect("start");

    let slow = session
        .execute("slow", Some(Duration::from_millis(200)))
        .await
        .expect("execute");
    assert!(slow.timed_out);

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let next = session.execute("ping", None).await.expect("execute");
    assert!(next.success);
    assert_eq!(next.stdout, "late [DONE]");

    registry.remove_all(false).await;
}

#[tokio::test]
async fn discard_policy_drops_late_output() {
    let temp = tempfile::tempdir().expect("tempdir");
    let mut config = test_config(temp.path(), ECHO_SCRIPT);
    config.session.stale_output = StaleOutputPolicy::Discard;
    let registry = registry_for(&config);
    let session = registry.get_or_create("alpha", None).await.expect("start");

    let slow = session
        .execute("slow", Some(Duration::from_millis(200)))
        .await
        .expect("execute");
    assert!(slow.timed_out);

    tokio::time::sleep(Duration::from_millis(1200)).await;

    let next = session.execute("ping", None).await.expect("execute");
    assert!(next.success);
    assert_eq!(next.stdout, "ok ping [DONE]");

    registry.remove_all(false).await;
}

#[tokio::test]
async fn unbounded_timeout_completes_normally() {
    let temp = tempfile::tempdir().expect("tempdir");
    let registry = echo_registry(temp.path());
    let session = registry.get_or_create("alpha", None).await.expect("start");

    let result = session
        .execute("ping", Some(Duration::MAX))
        .await
        .expect("execute");
    assert!(result.success);
    assert_eq!(result.stdout, "ok ping [DONE]");

    let result = session
        .execute("again", Some(Duration::from_secs(u64::MAX)))
        .await
        .expect("execute");
    assert!(result.success);
    assert_eq!(result.stdout, "ok again [DONE]");

    registry.remove_all(false).await;
}
