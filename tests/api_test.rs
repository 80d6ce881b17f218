use rssh::*;

#[test]
fn test_session_options_from_json() {
    let options = SessionOptions::from_json(
        r#"{"host":"build.internal","user":"ci","port":2222,"strictHostKeyCheck":true}"#,
    )
    .unwrap();
    let session = Session::with_options(options);

    assert_eq!(session.state(), SessionState::Unconnected);
    let info = session.info();
    assert_eq!(info.host.as_deref(), Some("build.internal"));
    assert_eq!(info.port, 2222);
    assert_eq!(info.server_banner, None);
}

#[test]
fn test_invalid_protocol_component_is_invalid_argument() {
    let session = Session::new();
    let err = session
        .set_option(SessionOption::Protocol(vec![2, 3]))
        .unwrap_err();
    assert_eq!(err.kind, SshErrorKind::InvalidArgument);
}

#[test]
fn test_log_verbosity_names() {
    assert_eq!("debug".parse::<LogVerbosity>().unwrap(), LogVerbosity::Debug);
    assert_eq!(
        "chatty".parse::<LogVerbosity>().unwrap_err().kind,
        SshErrorKind::InvalidArgument
    );
}

#[tokio::test]
async fn test_channel_open_before_connect_is_usage_error() {
    let session = Session::new();
    let channel = Channel::new(&session);

    let err = channel.open_session().await.unwrap_err();
    assert_eq!(err.kind, SshErrorKind::Usage);
    assert!(err.message.contains("isn't connected"));
    assert!(!channel.is_open());
}

#[tokio::test]
async fn test_scp_context_before_connect() {
    let session = Session::new();
    let ctx = ScpContext::new(&session, ScpMode::Write, "/tmp").unwrap();
    assert_eq!(ctx.init().await.unwrap_err().kind, SshErrorKind::Usage);
    assert!(ScpContext::with_mode_name(&session, "rw", "/tmp").is_err());
}

#[tokio::test]
async fn test_disconnect_releases_dependents() {
    let session = Session::new();
    let channel = Channel::new(&session);
    let ctx = ScpContext::new(&session, ScpMode::Read, "/var/tmp").unwrap();

    session.disconnect().await.unwrap();
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(channel.is_closed());
    assert_eq!(ctx.pull_request().await.unwrap_err().kind, SshErrorKind::Usage);
    assert_eq!(session.connect().await.unwrap_err().kind, SshErrorKind::Usage);
}

#[test]
fn test_init_logging_is_idempotent() {
    init_logging("rssh=debug");
    init_logging("rssh=trace");
}
