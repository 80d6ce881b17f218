// ── SCP context ───────────────────────────────────────────────────────────────

use crate::scp::protocol::ScpProtocol;
use crate::scp::types::{remote_command, PendingRequest, ScpMode, ScpRequest, ScpTimes};
use log::{debug, info, warn};
use rssh_core::scope::with_release;
use rssh_core::{SshError, SshResult};
use rssh_ssh::ssh::{Channel, DependentRank, Session, SessionDependent, SessionHandle};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use uuid::Uuid;

struct ScpShared {
    id: String,
    mode: ScpMode,
    path: String,
    session: SessionHandle,
    channel: Channel,
    recursive: AtomicBool,
    detached: AtomicBool,
    protocol: tokio::sync::Mutex<ScpProtocol<Channel>>,
    /// Copy of the pending request so the accessors never wait on I/O.
    pending: Mutex<PendingRequest>,
}

impl ScpShared {
    fn pending(&self) -> std::sync::MutexGuard<'_, PendingRequest> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_attached(&self) -> SshResult<()> {
        if self.detached.load(Ordering::SeqCst) {
            return Err(SshError::usage("session has been disposed"));
        }
        Ok(())
    }
}

impl SessionDependent for ScpShared {
    fn rank(&self) -> DependentRank {
        DependentRank::Scp
    }

    fn detach(&self) {
        if !self.detached.swap(true, Ordering::SeqCst) {
            debug!("scp {} detached by session teardown", self.id);
        }
    }
}

impl Drop for ScpShared {
    fn drop(&mut self) {
        let protocol = self.protocol.get_mut();
        if protocol.is_started() && !protocol.is_closed() {
            warn!("scp {} dropped without close; releasing its channel", self.id);
        }
    }
}

/// One SCP transfer (push or pull) on its own session channel.
///
/// Cloning yields another handle to the same transfer.
#[derive(Clone)]
pub struct ScpContext {
    shared: Arc<ScpShared>,
}

impl ScpContext {
    /// Bind a transfer to `session`. No I/O until `init`.
    pub fn new(session: &Session, mode: ScpMode, path: impl Into<String>) -> SshResult<Self> {
        Self::with_handle(session.handle(), mode, path)
    }

    /// Like `new`, with the mode given by name (`read` / `write`).
    pub fn with_mode_name(session: &Session, mode: &str, path: impl Into<String>) -> SshResult<Self> {
        Self::new(session, mode.parse()?, path)
    }

    pub fn with_handle(session: SessionHandle, mode: ScpMode, path: impl Into<String>) -> SshResult<Self> {
        let path = path.into();
        if path.is_empty() {
            return Err(SshError::invalid_argument("SCP path must not be empty"));
        }
        let channel = Channel::with_handle(session.clone());
        let shared = Arc::new(ScpShared {
            id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            mode,
            path,
            session: session.clone(),
            protocol: tokio::sync::Mutex::new(ScpProtocol::new(channel.clone(), mode, false)),
            channel,
            recursive: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            pending: Mutex::new(PendingRequest::default()),
        });
        let weak: Weak<dyn SessionDependent> = Arc::downgrade(&shared) as Weak<dyn SessionDependent>;
        session.register(weak);
        Ok(Self { shared })
    }

    /// Transfer directories too (`scp -r`). Takes effect at `init`.
    pub fn with_recursive(self, recursive: bool) -> Self {
        self.shared.recursive.store(recursive, Ordering::SeqCst);
        self
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn mode(&self) -> ScpMode {
        self.shared.mode
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn is_recursive(&self) -> bool {
        self.shared.recursive.load(Ordering::SeqCst)
    }

    pub fn session(&self) -> &SessionHandle {
        &self.shared.session
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Open the channel, start the remote `scp` and complete the opening exchange.
    pub async fn init(&self) -> SshResult<()> {
        self.shared.ensure_attached()?;
        let mut protocol = self.shared.protocol.lock().await;
        if protocol.is_started() {
            return Err(SshError::usage("SCP context is already initialized"));
        }
        protocol.set_recursive(self.is_recursive())?;

        self.shared.channel.open_session().await?;
        let command = remote_command(self.shared.mode, self.is_recursive(), &self.shared.path);
        let started = async {
            self.shared.channel.request_exec(&command).await?;
            protocol.start().await
        }
        .await;

        if let Err(e) = started {
            if let Err(close_err) = self.shared.channel.close().await {
                debug!("scp {}: close after failed init: {}", self.shared.id, close_err);
            }
            return Err(e);
        }
        info!(
            "scp {} started ({} {})",
            self.shared.id, self.shared.mode, self.shared.path
        );
        Ok(())
    }

    /// `init`, run `action`, then `close` exactly once.
    pub async fn init_scoped<T, F, Fut>(&self, action: F) -> SshResult<T>
    where
        F: FnOnce(ScpContext) -> Fut,
        Fut: Future<Output = SshResult<T>>,
    {
        self.init().await?;
        with_release(action(self.clone()), self.close()).await
    }

    /// Finish the transfer and close the channel. Closing twice is a no-op.
    pub async fn close(&self) -> SshResult<()> {
        let mut protocol = self.shared.protocol.lock().await;
        if protocol.is_closed() {
            return Ok(());
        }
        if self.shared.detached.load(Ordering::SeqCst) {
            protocol.abandon();
            return Ok(());
        }
        let result = protocol.finish().await;
        debug!("scp {} closed", self.shared.id);
        result
    }

    // ── Write mode ───────────────────────────────────────────────────────────

    /// Announce the next file: `size` bytes with permission bits `mode`.
    pub async fn push_file(&self, filename: &str, size: u64, mode: u32) -> SshResult<()> {
        self.shared.ensure_attached()?;
        self.shared.protocol.lock().await.push_file(filename, size, mode).await
    }

    /// Send file bytes; returns how many were accepted.
    pub async fn write(&self, data: &[u8]) -> SshResult<usize> {
        self.shared.ensure_attached()?;
        self.shared.protocol.lock().await.write(data).await
    }

    pub async fn push_directory(&self, name: &str, mode: u32) -> SshResult<()> {
        self.shared.ensure_attached()?;
        self.shared.protocol.lock().await.push_directory(name, mode).await
    }

    pub async fn leave_directory(&self) -> SshResult<()> {
        self.shared.ensure_attached()?;
        self.shared.protocol.lock().await.leave_directory().await
    }

    // ── Read mode ────────────────────────────────────────────────────────────

    pub async fn pull_request(&self) -> SshResult<ScpRequest> {
        self.shared.ensure_attached()?;
        let mut protocol = self.shared.protocol.lock().await;
        let request = protocol.pull_request().await?;
        *self.shared.pending() = protocol.pending().clone();
        Ok(request)
    }

    pub async fn accept_request(&self) -> SshResult<()> {
        self.shared.ensure_attached()?;
        self.shared.protocol.lock().await.accept_request().await
    }

    pub async fn deny_request(&self, reason: &str) -> SshResult<()> {
        self.shared.ensure_attached()?;
        self.shared.protocol.lock().await.deny_request(reason).await
    }

    /// Up to `size` bytes of the accepted file.
    pub async fn read(&self, size: usize) -> SshResult<Vec<u8>> {
        self.shared.ensure_attached()?;
        self.shared.protocol.lock().await.read(size).await
    }

    pub fn request_size(&self) -> u64 {
        self.shared.pending().size
    }

    pub fn request_filename(&self) -> Option<String> {
        self.shared.pending().filename.clone()
    }

    pub fn request_permissions(&self) -> u32 {
        self.shared.pending().permissions
    }

    pub fn request_warning(&self) -> Option<String> {
        self.shared.pending().warning.clone()
    }

    pub fn request_times(&self) -> Option<ScpTimes> {
        self.shared.pending().times
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rssh_core::SshErrorKind;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn rejects_unknown_mode_names() {
        let session = Session::new();
        let err = ScpContext::with_mode_name(&session, "append", "/tmp").err().unwrap();
        assert_eq!(err.kind, SshErrorKind::InvalidArgument);
        let ctx = ScpContext::with_mode_name(&session, "read", "/tmp").unwrap();
        assert_eq!(ctx.mode(), ScpMode::Read);
    }

    #[test]
    fn rejects_empty_path() {
        let session = Session::new();
        let err = ScpContext::new(&session, ScpMode::Write, "").err().unwrap();
        assert_eq!(err.kind, SshErrorKind::InvalidArgument);
    }

    #[test]
    fn accessors_are_empty_before_any_request() {
        let session = Session::new();
        let ctx = ScpContext::new(&session, ScpMode::Read, "/var/log").unwrap();
        assert_eq!(ctx.request_size(), 0);
        assert_eq!(ctx.request_filename(), None);
        assert_eq!(ctx.request_permissions(), 0);
        assert_eq!(ctx.request_warning(), None);
        assert_eq!(ctx.request_times(), None);
    }

    #[test]
    fn recursive_flag_is_recorded() {
        let session = Session::new();
        let ctx = ScpContext::new(&session, ScpMode::Write, "/srv").unwrap().with_recursive(true);
        assert!(ctx.is_recursive());
        assert_eq!(ctx.path(), "/srv");
    }

    #[test]
    fn close_before_init_is_a_no_op() {
        let session = Session::new();
        let ctx = ScpContext::new(&session, ScpMode::Write, "/tmp").unwrap();
        tokio_test::block_on(async {
            ctx.close().await.unwrap();
            ctx.close().await.unwrap();
        });
        assert_eq!(
            tokio_test::block_on(ctx.push_file("a", 1, 0o644)).unwrap_err().kind,
            SshErrorKind::Usage
        );
    }

    #[tokio::test]
    async fn init_before_connect_is_usage_error() {
        let session = Session::new();
        let ctx = ScpContext::new(&session, ScpMode::Write, "/tmp").unwrap();
        let err = ctx.init().await.unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Usage);
        // nothing was started, so close has nothing to do
        ctx.close().await.unwrap();
        ctx.close().await.unwrap();
    }

    #[tokio::test]
    async fn init_scoped_skips_action_when_init_fails() {
        let session = Session::new();
        let ctx = ScpContext::new(&session, ScpMode::Read, "/tmp").unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let err = ctx
            .init_scoped(|_| async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Usage);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn operations_before_init_are_usage_errors() {
        let session = Session::new();
        let push = ScpContext::new(&session, ScpMode::Write, "/tmp").unwrap();
        assert_eq!(push.push_file("a", 1, 0o644).await.unwrap_err().kind, SshErrorKind::Usage);
        assert_eq!(push.write(b"x").await.unwrap_err().kind, SshErrorKind::Usage);
        assert_eq!(push.pull_request().await.unwrap_err().kind, SshErrorKind::Usage);

        let pull = ScpContext::new(&session, ScpMode::Read, "/tmp").unwrap();
        assert_eq!(pull.pull_request().await.unwrap_err().kind, SshErrorKind::Usage);
        assert_eq!(pull.accept_request().await.unwrap_err().kind, SshErrorKind::Usage);
        assert_eq!(pull.push_file("a", 1, 0o644).await.unwrap_err().kind, SshErrorKind::Usage);
    }

    #[tokio::test]
    async fn session_teardown_detaches_context() {
        let session = Session::new();
        let ctx = ScpContext::new(&session, ScpMode::Write, "/tmp").unwrap();
        session.disconnect().await.unwrap();

        let err = ctx.push_file("a", 1, 0o644).await.unwrap_err();
        assert_eq!(err.kind, SshErrorKind::Usage);
        assert!(err.message.contains("disposed"));
        assert_eq!(ctx.init().await.unwrap_err().kind, SshErrorKind::Usage);
        ctx.close().await.unwrap();
    }

    #[tokio::test]
    async fn context_outliving_session_reports_usage() {
        let session = Session::new();
        let ctx = ScpContext::new(&session, ScpMode::Read, "/tmp").unwrap();
        drop(session);
        assert!(!ctx.session().is_alive());
        assert_eq!(ctx.pull_request().await.unwrap_err().kind, SshErrorKind::Usage);
    }
}
