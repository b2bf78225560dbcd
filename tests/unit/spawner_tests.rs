//! Headless spawn command line and environment.

use std::collections::HashMap;

use agent_warden::config::SpawnConfig;
use agent_warden::pipe::spawner::{command_line, spawn_headless, AGENT_ID_ENV, SESSION_ID_ENV};
use agent_warden::AppError;

fn spawn_config(executable: &str, args: &[&str], flags: &[&str]) -> SpawnConfig {
    SpawnConfig {
        executable: executable.into(),
        args: args.iter().map(|&a| a.to_owned()).collect(),
        headless_flags: flags.iter().map(|&a| a.to_owned()).collect(),
        env: HashMap::new(),
        inherit_env: vec!["PATH".into()],
    }
}

#[test]
fn headless_flags_follow_configured_args() {
    let config = spawn_config("agent-cli", &["--model", "fast"], &["--print", "--quiet"]);
    assert_eq!(
        command_line(&config),
        vec!["--model", "fast", "--print", "--quiet"]
    );
}

#[tokio::test]
async fn missing_executable_is_spawn_failed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = spawn_config("/nonexistent/agent-cli-binary", &[], &[]);

    let err = spawn_headless(&config, "agent", "sid", temp.path())
        .await
        .expect_err("spawn must fail");
    assert!(matches!(err, AppError::SpawnFailed(_)));
}

#[cfg(unix)]
#[tokio::test]
async fn child_sees_only_allowlisted_environment() {
    use tokio::io::AsyncReadExt;

    std::env::set_var("WARDEN_TEST_SECRET", "leak");
    let temp = tempfile::tempdir().expect("tempdir");
    let workdir = temp.path().join("nested").join("agent");
    let mut config = spawn_config(
        "sh",
        &["-c", "env; pwd"],
        &[],
    );
    config.env.insert("EXTRA_SETTING".into(), "on".into());

    let mut spawned = spawn_headless(&config, "agent-9", "session-9", &workdir)
        .await
        .expect("spawn");
    drop(spawned.stdin);

    let mut output = String::new();
    spawned
        .stdout
        .read_to_string(&mut output)
        .await
        .expect("read stdout");
    spawned.child.wait().await.expect("wait");

    assert!(workdir.is_dir(), "working directory is created");
    assert!(output.contains("TERM=dumb"));
    assert!(output.contains("NO_COLOR=1"));
    assert!(output.contains("EXTRA_SETTING=on"));
    assert!(output.contains(&format!("{AGENT_ID_ENV}=agent-9")));
    assert!(output.contains(&format!("{SESSION_ID_ENV}=session-9")));
    assert!(!output.contains("WARDEN_TEST_SECRET"));
    assert!(output.contains("nested/agent"));
}
