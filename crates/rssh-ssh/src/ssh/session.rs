// ── Session: one transport connection, its options and its dependents ─────────
//
// A `Session` owns the transport. Channels and SCP contexts hold a
// `SessionHandle` (a weak reference) and register themselves as dependents so
// that teardown can release them in order: SCP contexts, then channels, then
// the transport itself.

use crate::ssh::config::{ConfigError, SshConfig};
use crate::ssh::connect::{self, ProxyProcess, RawSocketHandle};
use crate::ssh::key::Key;
use crate::ssh::known_hosts;
use crate::ssh::link::{Link, Readiness};
use crate::ssh::options::{SessionOption, SessionOptions};
use crate::ssh::paths;
use crate::ssh::status::{is_again, is_auth_denial, transport_error};
use crate::ssh::types::{AuthMethod, AuthMethods, AuthResult, KnownHostStatus, SessionInfo, SessionState};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rssh_core::{LogVerbosity, SshError, SshErrorKind, SshResult};
use ssh2::DisconnectCode;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Timeout for the blocking calls made while tearing a session down.
const TEARDOWN_TIMEOUT_MS: u32 = 2_000;

/// Teardown position of a dependent; lower ranks are released first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DependentRank {
    Scp = 0,
    Channel = 1,
}

/// Something that holds transport resources borrowed from a session.
pub trait SessionDependent: Send + Sync {
    fn rank(&self) -> DependentRank;

    /// Drop every transport resource. Called once, under the transport lock,
    /// before the transport is disconnected.
    fn detach(&self);
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Live {
    ssh: ssh2::Session,
    readiness: Arc<Readiness>,
    io_lock: Arc<Mutex<()>>,
    raw_socket: RawSocketHandle,
    banner: Option<String>,
    connected_at: DateTime<Utc>,
    _proxy: Option<ProxyProcess>,
}

struct Core {
    options: SessionOptions,
    state: SessionState,
    live: Option<Live>,
    auth_methods: Option<AuthMethods>,
    cancel: CancellationToken,
}

pub(crate) struct SessionInner {
    id: Arc<str>,
    core: Mutex<Core>,
    dependents: Mutex<Vec<Weak<dyn SessionDependent>>>,
}

impl SessionInner {
    fn link(&self) -> SshResult<Link> {
        let core = lock(&self.core);
        match (&core.live, core.state.is_connected()) {
            (Some(live), true) => Ok(Link::new(
                live.ssh.clone(),
                self.id.clone(),
                core.options.log_verbosity,
                core.cancel.clone(),
                live.readiness.clone(),
                live.io_lock.clone(),
            )),
            _ => Err(SshError::usage("session isn't connected")),
        }
    }

    /// Release dependents in rank order, then the transport. Idempotent.
    fn teardown(&self, reason: &str) {
        if let Some(pending) = self.begin_teardown() {
            pending.finish(reason);
        }
    }

    /// Mark the session disconnected and collect what is left to release.
    /// Without a transport the dependents are detached right here.
    fn begin_teardown(&self) -> Option<Teardown> {
        let (live, cancel) = {
            let mut core = lock(&self.core);
            if core.state == SessionState::Disconnected {
                return None;
            }
            core.state = SessionState::Disconnected;
            core.auth_methods = None;
            (core.live.take(), core.cancel.clone())
        };
        cancel.cancel();

        let mut dependents: Vec<Arc<dyn SessionDependent>> = lock(&self.dependents)
            .drain(..)
            .filter_map(|w| w.upgrade())
            .collect();
        dependents.sort_by_key(|d| d.rank());

        let Some(live) = live else {
            dependents.iter().for_each(|d| d.detach());
            return None;
        };
        Some(Teardown {
            id: self.id.clone(),
            live,
            dependents,
        })
    }
}

/// The blocking half of a teardown: detach dependents and say goodbye to
/// the server under the transport lock.
struct Teardown {
    id: Arc<str>,
    live: Live,
    dependents: Vec<Arc<dyn SessionDependent>>,
}

impl Teardown {
    fn finish(self, reason: &str) {
        let live = self.live;
        {
            let _io = lock(&live.io_lock);
            live.ssh.set_blocking(true);
            live.ssh.set_timeout(TEARDOWN_TIMEOUT_MS);
            for dependent in &self.dependents {
                dependent.detach();
            }
            if let Err(e) = live
                .ssh
                .disconnect(Some(DisconnectCode::ByApplication), reason, None)
            {
                debug!("[{}] disconnect message not sent: {}", self.id, e.message());
            }
        }
        info!("[{}] session closed ({})", self.id, reason);
    }
}

/// Non-owning reference to a session, held by channels and SCP contexts.
#[derive(Clone)]
pub struct SessionHandle {
    inner: Weak<SessionInner>,
}

impl SessionHandle {
    fn upgrade(&self) -> SshResult<Arc<SessionInner>> {
        self.inner
            .upgrade()
            .ok_or_else(|| SshError::usage("session has been disposed"))
    }

    /// True while the session exists and has not been disconnected.
    pub fn is_alive(&self) -> bool {
        self.inner
            .upgrade()
            .map_or(false, |s| lock(&s.core).state != SessionState::Disconnected)
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.upgrade().map(|s| s.id.to_string())
    }

    /// Enrol `dependent` for ordered release at teardown.
    pub fn register(&self, dependent: Weak<dyn SessionDependent>) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut deps = lock(&inner.dependents);
        deps.retain(|d| d.strong_count() > 0);
        deps.push(dependent);
    }

    pub(crate) fn link(&self) -> SshResult<Link> {
        self.upgrade()?.link()
    }
}

/// An SSH client session.
///
/// Options are set while unconnected; `connect` performs the handshake,
/// after which the server can be verified and the user authenticated.
/// Dropping the session tears down its channels and SCP contexts first.
/// From async code prefer `disconnect().await`, which waits for the
/// transport to be released.
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Self {
        Self::with_options(SessionOptions::default())
    }

    pub fn with_options(options: SessionOptions) -> Self {
        let id: Arc<str> = Arc::from(Uuid::new_v4().to_string());
        debug!("[{}] session created", id);
        Self {
            inner: Arc::new(SessionInner {
                id,
                core: Mutex::new(Core {
                    options,
                    state: SessionState::Unconnected,
                    live: None,
                    auth_methods: None,
                    cancel: CancellationToken::new(),
                }),
                dependents: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            inner: Arc::downgrade(&self.inner),
        }
    }

    pub fn state(&self) -> SessionState {
        lock(&self.inner.core).state
    }

    pub fn options(&self) -> SessionOptions {
        lock(&self.inner.core).options.clone()
    }

    // ── Options ──────────────────────────────────────────────────────────────

    pub fn set_option(&self, option: SessionOption) -> SshResult<()> {
        let mut core = lock(&self.inner.core);
        if option.affects_negotiation() && core.state != SessionState::Unconnected {
            return Err(SshError::protocol_option(format!(
                "option '{}' cannot change after connect",
                option.name()
            )));
        }
        let level = match &option {
            SessionOption::LogVerbosity(level) => Some(*level),
            _ => None,
        };
        core.options.apply(option)?;
        if let (Some(level), Some(live)) = (level, &core.live) {
            live.ssh.trace(connect::trace_flags(level));
        }
        Ok(())
    }

    pub fn set_log_verbosity(&self, level: LogVerbosity) -> SshResult<()> {
        self.set_option(SessionOption::LogVerbosity(level))
    }

    pub fn add_identity(&self, path_format: &str) -> SshResult<()> {
        self.set_option(SessionOption::AddIdentity(path_format.to_string()))
    }

    /// Load an OpenSSH client config (default `~/.ssh/config`) for the
    /// configured host. Returns `false` instead of failing.
    pub fn parse_config(&self, path: Option<&Path>) -> bool {
        let mut core = lock(&self.inner.core);
        if core.state != SessionState::Unconnected {
            warn!("[{}] parse_config after connect ignored", self.inner.id);
            return false;
        }
        let Some(host) = core.options.host.clone() else {
            debug!("[{}] parse_config needs a host", self.inner.id);
            return false;
        };
        let path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(paths::default_config_path);

        match SshConfig::load(&path) {
            Ok(config) => {
                config.settings_for(&host).apply_to(&mut core.options);
                debug!("[{}] applied {} for {}", self.inner.id, path.display(), host);
                true
            }
            Err(ConfigError::Io { source, .. })
                if source.kind() == std::io::ErrorKind::NotFound =>
            {
                debug!("[{}] no config at {}", self.inner.id, path.display());
                false
            }
            Err(e) => {
                warn!("[{}] config not applied: {}", self.inner.id, e);
                false
            }
        }
    }

    // ── Connection ───────────────────────────────────────────────────────────

    /// Open the TCP (or ProxyCommand) connection and run the handshake.
    pub async fn connect(&self) -> SshResult<()> {
        let (options, cancel) = {
            let core = lock(&self.inner.core);
            match core.state {
                SessionState::Unconnected => {}
                SessionState::Disconnected => {
                    return Err(SshError::usage("session has been disconnected"))
                }
                _ => return Err(SshError::usage("session is already connected")),
            }
            (core.options.clone(), core.cancel.clone())
        };
        let id = self.inner.id.clone();

        let task = tokio::task::spawn_blocking(move || connect::establish(&options, &id));
        let transport = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SshError::cancelled("connect interrupted")),
            joined = task => joined.map_err(|e| SshError::io(format!("connect task failed: {}", e)))??,
        };

        let mut core = lock(&self.inner.core);
        if core.state != SessionState::Unconnected {
            return Err(SshError::usage("session changed state during connect"));
        }
        core.live = Some(Live {
            ssh: transport.ssh,
            readiness: transport.readiness,
            io_lock: Arc::new(Mutex::new(())),
            raw_socket: transport.raw_socket,
            banner: transport.banner,
            connected_at: Utc::now(),
            _proxy: transport.proxy,
        });
        core.state = SessionState::Connected;
        Ok(())
    }

    /// Tear down dependents and the transport. Later calls fail with `Usage`.
    pub async fn disconnect(&self) -> SshResult<()> {
        let inner = self.inner.clone();
        tokio::task::spawn_blocking(move || inner.teardown("disconnect requested"))
            .await
            .map_err(|e| SshError::io(format!("disconnect task failed: {}", e)))
    }

    /// Abort waits currently outstanding on this session and its channels.
    pub fn interrupt(&self) {
        let mut core = lock(&self.inner.core);
        if core.state == SessionState::Disconnected {
            return;
        }
        core.cancel.cancel();
        core.cancel = CancellationToken::new();
        debug!("[{}] interrupted", self.inner.id);
    }

    pub fn raw_socket(&self) -> Option<RawSocketHandle> {
        lock(&self.inner.core).live.as_ref().map(|l| l.raw_socket)
    }

    pub fn info(&self) -> SessionInfo {
        let mut info = {
            let core = lock(&self.inner.core);
            SessionInfo {
                id: self.inner.id.to_string(),
                host: core.options.host.clone(),
                port: core.options.port_or_default(),
                user: core.options.user.clone(),
                state: core.state,
                connected_at: core.live.as_ref().map(|l| l.connected_at),
                server_banner: core.live.as_ref().and_then(|l| l.banner.clone()),
                host_key_fingerprint: None,
            }
        };
        if let Ok(link) = self.inner.link() {
            info.host_key_fingerprint = link
                .with_transport(|ssh| Ok(ssh.host_key().map(|(blob, kind)| Key::from_host_key(blob, kind))))
                .ok()
                .flatten()
                .map(|key| key.sha256_fingerprint());
        }
        info
    }

    // ── Host verification ────────────────────────────────────────────────────

    /// Compare the server's host key with the known-hosts store.
    ///
    /// With `StrictHostKeyCheck` set to false, an unknown host's key is
    /// written to the store and the host reported as `KnownOk`.
    pub async fn server_known(&self) -> SshResult<KnownHostStatus> {
        let link = self.inner.link()?;
        let options = self.options();
        let path = options.known_hosts_path()?;
        let host = options
            .host
            .clone()
            .ok_or_else(|| SshError::connection("session has no host"))?;
        let port = options.port_or_default();
        let strict = options.strict_host_key_check;
        let status = link
            .run_blocking("server_known", move |ssh| {
                let status = known_hosts::check(ssh, &path, &host, port)?;
                match ssh.host_key() {
                    Some((blob, kind)) => {
                        let key = Key::from_host_key(blob, kind);
                        known_hosts::accept_new_host(status, strict, &path, &host, port, &key)
                    }
                    None => Ok(status),
                }
            })
            .await?;
        debug!("[{}] known hosts: {:?}", self.inner.id, status);
        Ok(status)
    }

    pub fn get_publickey(&self) -> SshResult<Key> {
        let link = self.inner.link()?;
        link.with_transport(|ssh| {
            ssh.host_key()
                .map(|(blob, kind)| Key::from_host_key(blob, kind))
                .ok_or_else(|| SshError::connection("server host key unavailable"))
        })
    }

    /// Append the server's host key to the known-hosts store.
    pub async fn write_knownhost(&self) -> SshResult<()> {
        let key = self.get_publickey()?;
        let options = self.options();
        let path = options.known_hosts_path()?;
        let host = options
            .host
            .clone()
            .ok_or_else(|| SshError::connection("session has no host"))?;
        let port = options.port_or_default();
        tokio::task::spawn_blocking(move || known_hosts::append_entry(&path, &host, port, &key))
            .await
            .map_err(|e| SshError::io(format!("known hosts task failed: {}", e)))?
    }

    // ── Authentication ───────────────────────────────────────────────────────

    fn begin_auth(&self) -> SshResult<(Link, String, Option<AuthMethods>)> {
        let link = self.inner.link()?;
        let mut core = lock(&self.inner.core);
        if core.state == SessionState::Connected {
            core.state = SessionState::Authenticating;
        }
        Ok((link, core.options.user_or_default(), core.auth_methods))
    }

    fn finish_auth(&self, outcome: AuthOutcome) -> AuthResult {
        let mut core = lock(&self.inner.core);
        if let Some(methods) = outcome.methods {
            core.auth_methods = Some(methods);
        }
        if outcome.result == AuthResult::Success && core.state.is_connected() {
            core.state = SessionState::Authenticated;
        }
        outcome.result
    }

    /// Try the "none" method. Also caches the server's method list.
    pub async fn userauth_none(&self) -> SshResult<AuthResult> {
        let (link, user, _) = self.begin_auth()?;
        let outcome = link
            .run_blocking("userauth_none", move |ssh| match ssh.auth_methods(&user) {
                Ok(list) => Ok(AuthOutcome {
                    result: if ssh.authenticated() {
                        AuthResult::Success
                    } else {
                        AuthResult::Denied
                    },
                    methods: Some(AuthMethods::from_wire_list(list)),
                }),
                Err(_) if ssh.authenticated() => Ok(AuthOutcome::new(AuthResult::Success)),
                Err(e) if is_again(&e) => Ok(AuthOutcome::new(AuthResult::Again)),
                Err(e) => Err(transport_error(SshErrorKind::Auth, "none authentication failed", &e)),
            })
            .await?;
        Ok(self.finish_auth(outcome))
    }

    /// Methods the server will accept, decoded from its advertised list.
    pub async fn userauth_list(&self) -> SshResult<Vec<AuthMethod>> {
        if let Some(methods) = lock(&self.inner.core).auth_methods {
            return Ok(methods.to_vec());
        }
        let link = self.inner.link()?;
        let user = lock(&self.inner.core).options.user_or_default();
        let methods = link
            .run_blocking("userauth_list", move |ssh| {
                if ssh.authenticated() {
                    return Ok(AuthMethods::default());
                }
                ssh.auth_methods(&user)
                    .map(AuthMethods::from_wire_list)
                    .map_err(|e| transport_error(SshErrorKind::Auth, "cannot list auth methods", &e))
            })
            .await?;
        if !methods.is_empty() {
            lock(&self.inner.core).auth_methods = Some(methods);
        }
        Ok(methods.to_vec())
    }

    pub async fn userauth_password(&self, password: &str) -> SshResult<AuthResult> {
        let (link, user, before) = self.begin_auth()?;
        let password = password.to_string();
        let outcome = link
            .run_blocking("userauth_password", move |ssh| {
                match ssh.userauth_password(&user, &password) {
                    Ok(()) if ssh.authenticated() => Ok(AuthOutcome::new(AuthResult::Success)),
                    Ok(()) => Ok(refused(ssh, &user, before)),
                    Err(e) if is_again(&e) => Ok(AuthOutcome::new(AuthResult::Again)),
                    Err(e) if is_auth_denial(&e) => Ok(refused(ssh, &user, before)),
                    Err(e) => Err(transport_error(SshErrorKind::Auth, "password authentication failed", &e)),
                }
            })
            .await?;
        Ok(self.finish_auth(outcome))
    }

    /// Authenticate with the identities held by a running ssh-agent.
    pub async fn userauth_agent(&self) -> SshResult<AuthResult> {
        let (link, user, before) = self.begin_auth()?;
        let outcome = link
            .run_blocking("userauth_agent", move |ssh| Ok(try_agent(ssh, &user, before)))
            .await?;
        Ok(self.finish_auth(outcome))
    }

    /// Try the agent, then every configured identity file that exists.
    ///
    /// Running out of keys is reported as `Denied`, not as an error.
    pub async fn userauth_publickey_auto(&self) -> SshResult<AuthResult> {
        let (link, user, before) = self.begin_auth()?;
        let options = self.options();
        let ctx = options.expand_context();
        let mut identities = Vec::new();
        for format in options.identity_formats() {
            match paths::expand_path(&format, &ctx) {
                Ok(path) => identities.push(path),
                Err(e) => warn!("[{}] skipping identity '{}': {}", self.inner.id, format, e),
            }
        }
        let session_id = self.inner.id.clone();

        let outcome = link
            .run_blocking("userauth_publickey_auto", move |ssh| {
                if std::env::var_os("SSH_AUTH_SOCK").is_some() {
                    let agent = try_agent(ssh, &user, before);
                    if agent.result == AuthResult::Success {
                        return Ok(agent);
                    }
                }
                for private in identities.iter().filter(|p| p.is_file()) {
                    let public = private.with_extension(match private.extension() {
                        Some(ext) => format!("{}.pub", ext.to_string_lossy()),
                        None => "pub".to_string(),
                    });
                    let public = public.is_file().then_some(public);
                    debug!("[{}] trying identity {}", session_id, private.display());
                    match ssh.userauth_pubkey_file(&user, public.as_deref(), private, None) {
                        Ok(()) if ssh.authenticated() => {
                            return Ok(AuthOutcome::new(AuthResult::Success))
                        }
                        Ok(()) => {}
                        Err(e) if is_again(&e) => return Ok(AuthOutcome::new(AuthResult::Again)),
                        Err(e) if is_auth_denial(&e) => {
                            debug!("[{}] {} refused: {}", session_id, private.display(), e.message())
                        }
                        Err(e) => {
                            return Err(transport_error(
                                SshErrorKind::Auth,
                                "public key authentication failed",
                                &e,
                            ))
                        }
                    }
                }
                Ok(refused(ssh, &user, before))
            })
            .await?;
        Ok(self.finish_auth(outcome))
    }
}

impl Drop for Session {
    /// The blocking disconnect moves to tokio's blocking pool when dropped
    /// inside a runtime; `disconnect().await` is the way to wait for it.
    fn drop(&mut self) {
        let Some(pending) = self.inner.begin_teardown() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || pending.finish("session dropped"));
            }
            Err(_) => pending.finish("session dropped"),
        }
    }
}

struct AuthOutcome {
    result: AuthResult,
    methods: Option<AuthMethods>,
}

impl AuthOutcome {
    fn new(result: AuthResult) -> Self {
        Self {
            result,
            methods: None,
        }
    }
}

fn try_agent(ssh: &ssh2::Session, user: &str, before: Option<AuthMethods>) -> AuthOutcome {
    match ssh.userauth_agent(user) {
        Ok(()) if ssh.authenticated() => AuthOutcome::new(AuthResult::Success),
        Err(e) if is_again(&e) => AuthOutcome::new(AuthResult::Again),
        Err(e) => {
            debug!("agent authentication refused: {}", e.message());
            refused(ssh, user, before)
        }
        Ok(()) => refused(ssh, user, before),
    }
}

/// Classify a refused attempt. The transport does not surface the
/// partial-success flag, so a changed continuation list counts as partial.
fn refused(ssh: &ssh2::Session, user: &str, before: Option<AuthMethods>) -> AuthOutcome {
    match ssh.auth_methods(user) {
        Ok(list) => {
            let now = AuthMethods::from_wire_list(list);
            let result = match before {
                Some(prev) if prev != now && !now.is_empty() => AuthResult::Partial,
                _ => AuthResult::Denied,
            };
            AuthOutcome {
                result,
                methods: Some(now),
            }
        }
        Err(_) => AuthOutcome::new(AuthResult::Denied),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::options::Compression;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn new_session_is_unconnected() {
        let session = Session::new();
        assert_eq!(session.state(), SessionState::Unconnected);
        assert!(session.raw_socket().is_none());
        assert!(session.handle().is_alive());
        assert_eq!(session.info().port, 22);
    }

    #[test]
    fn invalid_protocol_leaves_options_untouched() {
        let session = Session::new();
        let err = session
            .set_option(SessionOption::Protocol(vec![2, 7]))
            .unwrap_err();
        assert_eq!(err.kind, SshErrorKind::InvalidArgument);
        assert!(session.options().ssh2);
    }

    #[test]
    fn options_round_trip_through_session() {
        let session = Session::new();
        session.set_option(SessionOption::Host("example.org".into())).unwrap();
        session.set_option(SessionOption::Port(2222)).unwrap();
        session
            .set_option(SessionOption::Compression(Compression::Enabled(false)))
            .unwrap();
        session.add_identity("%d/deploy_key").unwrap();
        session.set_log_verbosity(LogVerbosity::Debug).unwrap();

        let opts = session.options();
        assert_eq!(opts.host.as_deref(), Some("example.org"));
        assert_eq!(opts.port, Some(2222));
        assert_eq!(opts.identities, vec!["%d/deploy_key".to_string()]);
        assert_eq!(opts.log_verbosity, LogVerbosity::Debug);
    }

    #[tokio::test]
    async fn operations_before_connect_are_usage_errors() {
        let session = Session::new();
        assert_eq!(session.server_known().await.unwrap_err().kind, SshErrorKind::Usage);
        assert_eq!(session.userauth_none().await.unwrap_err().kind, SshErrorKind::Usage);
        assert_eq!(session.userauth_list().await.unwrap_err().kind, SshErrorKind::Usage);
        assert_eq!(
            session.userauth_publickey_auto().await.unwrap_err().kind,
            SshErrorKind::Usage
        );
        assert_eq!(session.get_publickey().unwrap_err().kind, SshErrorKind::Usage);
        assert_eq!(session.write_knownhost().await.unwrap_err().kind, SshErrorKind::Usage);
    }

    #[tokio::test]
    async fn connect_without_host_is_connection_error() {
        let session = Session::new();
        let err = session.connect().await.unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Connection);
        assert_eq!(session.state(), SessionState::Unconnected);
    }

    #[tokio::test]
    async fn disconnect_is_terminal() {
        let session = Session::new();
        session.disconnect().await.unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(!session.handle().is_alive());
        assert_eq!(session.connect().await.unwrap_err().kind, SshErrorKind::Usage);
        // second disconnect is a no-op
        session.disconnect().await.unwrap();
    }

    #[test]
    fn parse_config_without_host_is_false() {
        let session = Session::new();
        assert!(!session.parse_config(None));
    }

    #[test]
    fn parse_config_missing_file_is_false() {
        let dir = TempDir::new().unwrap();
        let session = Session::new();
        session.set_option(SessionOption::Host("alias".into())).unwrap();
        assert!(!session.parse_config(Some(&dir.path().join("nope"))));
    }

    #[test]
    fn parse_config_fills_unset_options() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config");
        std::fs::write(
            &path,
            "Host alias\n  Hostname real.example.net\n  Port 2200\n  User ops\n\nHost *\n  User fallback\n",
        )
        .unwrap();

        let session = Session::new();
        session.set_option(SessionOption::Host("alias".into())).unwrap();
        session.set_option(SessionOption::User("me".into())).unwrap();
        assert!(session.parse_config(Some(&path)));

        let opts = session.options();
        assert_eq!(opts.host.as_deref(), Some("real.example.net"));
        assert_eq!(opts.port, Some(2200));
        assert_eq!(opts.user.as_deref(), Some("me"));
    }

    struct Recorder {
        rank: DependentRank,
        order: Arc<Mutex<Vec<DependentRank>>>,
        calls: AtomicUsize,
    }

    impl SessionDependent for Recorder {
        fn rank(&self) -> DependentRank {
            self.rank
        }
        fn detach(&self) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.order.lock().unwrap().push(self.rank);
        }
    }

    #[test]
    fn dependents_detach_in_rank_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let channel = Arc::new(Recorder {
            rank: DependentRank::Channel,
            order: order.clone(),
            calls: AtomicUsize::new(0),
        });
        let scp = Arc::new(Recorder {
            rank: DependentRank::Scp,
            order: order.clone(),
            calls: AtomicUsize::new(0),
        });

        let session = Session::new();
        let handle = session.handle();
        let weak_channel: Weak<dyn SessionDependent> = Arc::downgrade(&channel) as Weak<dyn SessionDependent>;
        let weak_scp: Weak<dyn SessionDependent> = Arc::downgrade(&scp) as Weak<dyn SessionDependent>;
        handle.register(weak_channel);
        handle.register(weak_scp);
        drop(session);

        assert_eq!(*order.lock().unwrap(), vec![DependentRank::Scp, DependentRank::Channel]);
        assert_eq!(channel.calls.load(Ordering::SeqCst), 1);
        assert_eq!(scp.calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle.link().err().map(|e| e.kind), Some(SshErrorKind::Usage));
    }

    #[tokio::test]
    async fn drop_inside_runtime_releases_dependents_before_returning() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let channel = Arc::new(Recorder {
            rank: DependentRank::Channel,
            order: order.clone(),
            calls: AtomicUsize::new(0),
        });
        let session = Session::new();
        let handle = session.handle();
        handle.register(Arc::downgrade(&channel) as Weak<dyn SessionDependent>);

        drop(session);

        assert_eq!(channel.calls.load(Ordering::SeqCst), 1);
        assert!(!handle.is_alive());
        assert_eq!(
            handle.link().err().map(|e| e.message),
            Some("session has been disposed".to_string())
        );
    }

    #[test]
    fn interrupt_is_harmless_when_idle() {
        let session = Session::new();
        session.interrupt();
        session.set_option(SessionOption::User("after".into())).unwrap();
        assert_eq!(session.options().user.as_deref(), Some("after"));
    }
}
