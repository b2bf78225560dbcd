//! Display format and conversions of `AppError`.

use agent_warden::AppError;

#[test]
fn display_prefixes_each_category() {
    let cases = [
        (AppError::Config("bad".into()), "config: bad"),
        (AppError::Io("bad".into()), "io: bad"),
        (AppError::SpawnFailed("bad".into()), "spawn failed: bad"),
        (AppError::ChannelClosed("bad".into()), "channel closed: bad"),
        (
            AppError::SessionUnavailable("bad".into()),
            "session unavailable: bad",
        ),
        (AppError::NotFound("bad".into()), "not found: bad"),
        (AppError::LimitReached("bad".into()), "limit reached: bad"),
    ];

    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn error_message_no_trailing_period() {
    let err = AppError::SpawnFailed("failed to spawn agent-cli: not found".into());
    let s = err.to_string();
    assert!(
        !s.ends_with('.'),
        "error message must not end with a period: {s}"
    );
}

#[test]
fn io_error_converts_to_io_variant() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let err: AppError = io.into();
    assert!(matches!(err, AppError::Io(ref msg) if msg.contains("denied")));
}

#[test]
fn toml_error_converts_to_config_variant() {
    let parse = toml::from_str::<toml::Value>("key = ").expect_err("invalid toml");
    let err: AppError = parse.into();
    assert!(err.to_string().starts_with("config: invalid config:"));
}

#[test]
fn implements_std_error_trait() {
    fn assert_error<E: std::error::Error + Send + Sync + 'static>(_: &E) {}

    let err = AppError::ChannelClosed("stdin already closed".into());
    assert_error(&err);
    assert!(!format!("{err:?}").is_empty());
}
