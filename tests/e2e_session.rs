//! End-to-end tests against a live OpenSSH server.
//!
//! Run with `cargo test --features docker-e2e` after starting a server, e.g.
//! the `linuxserver/openssh-server` image with password auth enabled, and
//! exporting `RSSH_E2E_HOST`, `RSSH_E2E_PORT`, `RSSH_E2E_USER`,
//! `RSSH_E2E_PASSWORD`.
#![cfg(feature = "docker-e2e")]

use rssh::*;
use std::time::Duration;
use tempfile::TempDir;

fn env(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

async fn authenticated_session(known_hosts: &TempDir) -> Session {
    let session = Session::new();
    session
        .set_option(SessionOption::Host(env("RSSH_E2E_HOST", "127.0.0.1")))
        .unwrap();
    session
        .set_option(SessionOption::Port(
            env("RSSH_E2E_PORT", "2222").parse().unwrap(),
        ))
        .unwrap();
    session
        .set_option(SessionOption::User(env("RSSH_E2E_USER", "rssh")))
        .unwrap();
    session
        .set_option(SessionOption::KnownHosts(
            known_hosts.path().join("known_hosts").display().to_string(),
        ))
        .unwrap();
    session.set_option(SessionOption::Timeout(10)).unwrap();

    session.connect().await.unwrap();
    let result = session
        .userauth_password(&env("RSSH_E2E_PASSWORD", "rssh"))
        .await
        .unwrap();
    assert_eq!(result, AuthResult::Success);
    assert_eq!(session.state(), SessionState::Authenticated);
    session
}

async fn run(session: &Session, command: &str) -> (Vec<u8>, Option<i32>) {
    let channel = Channel::new(session);
    channel
        .open_session_scoped(|ch| async move {
            ch.request_exec(command).await?;
            let mut out = Vec::new();
            loop {
                let chunk = ch.read(4096, StreamKind::Stdout, None).await?;
                if chunk.is_empty() {
                    break;
                }
                out.extend(chunk);
            }
            let status = ch.get_exit_status().await?;
            Ok((out, status))
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn e2e_known_hosts_round_trip() {
    let dir = TempDir::new().unwrap();
    let session = authenticated_session(&dir).await;

    assert_eq!(session.server_known().await.unwrap(), KnownHostStatus::FileNotFound);
    session.write_knownhost().await.unwrap();
    assert_eq!(session.server_known().await.unwrap(), KnownHostStatus::KnownOk);

    let key = session.get_publickey().unwrap();
    assert!(key.is_public());
    assert!(key.sha256_fingerprint().starts_with("SHA256:"));
    assert_eq!(session.info().host_key_fingerprint, Some(key.sha256_fingerprint()));
}

#[tokio::test]
async fn e2e_exec_reports_output_and_exit_status() {
    let dir = TempDir::new().unwrap();
    let session = authenticated_session(&dir).await;

    let (out, status) = run(&session, "printf 'a\\0b'; exit 3").await;
    assert_eq!(out, b"a\0b".to_vec());
    assert_eq!(status, Some(3));
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn e2e_stdout_reaches_eof_with_stderr_unread() {
    let dir = TempDir::new().unwrap();
    let session = authenticated_session(&dir).await;

    let (out, status) = run(&session, "printf out; printf err >&2; exit 0").await;
    assert_eq!(out, b"out".to_vec());
    assert_eq!(status, Some(0));

    let channel = Channel::new(&session);
    channel.open_session().await.unwrap();
    channel.request_exec("printf out; printf err >&2").await.unwrap();
    let mut out = Vec::new();
    loop {
        match channel.read_nonblocking(64, StreamKind::Stdout).unwrap() {
            None => break,
            Some(chunk) if chunk.is_empty() => {
                channel
                    .poll(StreamKind::Stdout, Some(Duration::from_secs(5)))
                    .await
                    .unwrap();
            }
            Some(chunk) => out.extend(chunk),
        }
    }
    assert_eq!(out, b"out".to_vec());
    assert_eq!(
        channel.read(64, StreamKind::Stderr, None).await.unwrap(),
        b"err".to_vec()
    );
    channel.close().await.unwrap();
    session.disconnect().await.unwrap();
}

#[tokio::test]
async fn e2e_exit_status_is_stable() {
    let dir = TempDir::new().unwrap();
    let session = authenticated_session(&dir).await;
    let channel = Channel::new(&session);
    channel.open_session().await.unwrap();
    channel.request_exec("exit 7").await.unwrap();

    assert_eq!(channel.get_exit_status().await.unwrap(), Some(7));
    assert_eq!(channel.get_exit_status().await.unwrap(), Some(7));
    channel.close().await.unwrap();
}

#[tokio::test]
async fn e2e_poll_times_out_without_data() {
    let dir = TempDir::new().unwrap();
    let session = authenticated_session(&dir).await;
    let channel = Channel::new(&session);
    channel.open_session().await.unwrap();
    channel.request_exec("sleep 5").await.unwrap();

    let polled = channel
        .poll(StreamKind::Stdout, Some(Duration::from_millis(200)))
        .await
        .unwrap();
    assert_eq!(polled, PollResult::TimedOut);
    assert_eq!(
        channel.read_nonblocking(16, StreamKind::Stdout).unwrap(),
        Some(Vec::new())
    );
    channel.close().await.unwrap();
}

#[tokio::test]
async fn e2e_interrupt_cancels_wait() {
    let dir = TempDir::new().unwrap();
    let session = authenticated_session(&dir).await;
    let channel = Channel::new(&session);
    channel.open_session().await.unwrap();
    channel.request_exec("sleep 30").await.unwrap();

    let (res, _) = tokio::join!(channel.get_exit_status(), async {
        tokio::time::sleep(Duration::from_millis(300)).await;
        session.interrupt();
    });
    assert_eq!(res.unwrap_err().kind, SshErrorKind::Cancelled);
}

#[tokio::test]
async fn e2e_scp_push_then_pull() {
    let dir = TempDir::new().unwrap();
    let session = authenticated_session(&dir).await;
    let (out, _) = run(&session, "mktemp -d").await;
    let remote_dir = String::from_utf8(out).unwrap().trim().to_string();
    let payload: Vec<u8> = (0..=255u8).cycle().take(70_000).collect();

    let push = ScpContext::new(&session, ScpMode::Write, remote_dir.clone()).unwrap();
    push.init_scoped(|ctx| {
        let payload = payload.clone();
        async move {
            ctx.push_file("blob.bin", payload.len() as u64, 0o640).await?;
            for chunk in payload.chunks(16_384) {
                ctx.write(chunk).await?;
            }
            Ok(())
        }
    })
    .await
    .unwrap();

    let pull = ScpContext::new(&session, ScpMode::Read, format!("{}/blob.bin", remote_dir)).unwrap();
    let received = pull
        .init_scoped(|ctx| async move {
            assert_eq!(ctx.pull_request().await?, ScpRequest::NewFile);
            assert_eq!(ctx.request_filename().as_deref(), Some("blob.bin"));
            assert_eq!(ctx.request_permissions(), 0o640);
            let size = ctx.request_size();
            ctx.accept_request().await?;
            let mut data = Vec::new();
            while (data.len() as u64) < size {
                data.extend(ctx.read(8192).await?);
            }
            assert_eq!(ctx.pull_request().await?, ScpRequest::Eof);
            Ok(data)
        })
        .await
        .unwrap();
    assert_eq!(received, payload);

    let warn = ScpContext::new(&session, ScpMode::Read, format!("{}/missing", remote_dir)).unwrap();
    warn.init_scoped(|ctx| async move {
        assert_eq!(ctx.pull_request().await?, ScpRequest::Warning);
        assert!(ctx.request_warning().is_some());
        Ok(())
    })
    .await
    .unwrap();

    run(&session, &format!("rm -rf '{}'", remote_dir)).await;
}
