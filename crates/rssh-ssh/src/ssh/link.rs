// ── Transport link: blocking dispatch and retry-on-again loops ───────────────
//
// Every transport call goes through a `Link`:
//   • `run_blocking` moves a blocking call onto tokio's blocking pool
//   • `drive` runs a non-blocking step, waiting for socket readiness
//     between attempts until it completes, times out or is interrupted
// Both hold the transport lock for the duration of a transport call, so the
// session's blocking flag is never flipped underneath another call.

use crate::ssh::status::transport_error;
use log::trace;
use rssh_core::{LogVerbosity, SshError, SshErrorKind, SshResult};
use ssh2::BlockDirections;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[cfg(unix)]
use std::os::fd::OwnedFd;
#[cfg(unix)]
use tokio::io::unix::AsyncFd;
#[cfg(unix)]
use tokio::io::Interest;

/// Re-check interval when the transport cannot say which direction it waits on.
const UNKNOWN_DIRECTION_RECHECK: Duration = Duration::from_millis(250);

/// Outcome of one non-blocking attempt.
#[derive(Debug)]
pub(crate) enum Step<T> {
    Done(T),
    Again,
}

/// Socket readiness source shared by every wait on one session.
pub(crate) struct Readiness {
    #[cfg(unix)]
    fd: OwnedFd,
    #[cfg(unix)]
    registered: tokio::sync::OnceCell<AsyncFd<OwnedFd>>,
}

impl Readiness {
    #[cfg(unix)]
    pub(crate) fn new(fd: OwnedFd) -> Self {
        Self {
            fd,
            registered: tokio::sync::OnceCell::new(),
        }
    }

    #[cfg(not(unix))]
    pub(crate) fn new() -> Self {
        Self {}
    }

    #[cfg(unix)]
    async fn async_fd(&self) -> SshResult<&AsyncFd<OwnedFd>> {
        self.registered
            .get_or_try_init(|| async {
                let fd = self.fd.try_clone()?;
                let afd = AsyncFd::with_interest(fd, Interest::READABLE | Interest::WRITABLE)?;
                Ok::<_, SshError>(afd)
            })
            .await
    }

    #[cfg(unix)]
    async fn wait_for(&self, dirs: BlockDirections) -> SshResult<()> {
        let afd = self.async_fd().await?;
        match dirs {
            BlockDirections::Outbound => afd.writable().await?.clear_ready(),
            BlockDirections::Both => {
                tokio::select! {
                    r = afd.readable() => r?.clear_ready(),
                    w = afd.writable() => w?.clear_ready(),
                }
            }
            BlockDirections::Inbound => afd.readable().await?.clear_ready(),
            BlockDirections::None => {
                tokio::select! {
                    r = afd.readable() => r?.clear_ready(),
                    _ = tokio::time::sleep(UNKNOWN_DIRECTION_RECHECK) => {}
                }
            }
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn wait_for(&self, _dirs: BlockDirections) -> SshResult<()> {
        tokio::time::sleep(Duration::from_millis(10)).await;
        Ok(())
    }
}

/// Clonable handle to a connected transport.
#[derive(Clone)]
pub(crate) struct Link {
    pub ssh: ssh2::Session,
    pub session_id: Arc<str>,
    pub verbosity: LogVerbosity,
    pub cancel: CancellationToken,
    readiness: Arc<Readiness>,
    io_lock: Arc<Mutex<()>>,
}

/// Switches the transport to non-blocking mode until dropped.
struct NonBlocking<'a>(&'a ssh2::Session);

impl<'a> NonBlocking<'a> {
    fn enter(ssh: &'a ssh2::Session) -> Self {
        ssh.set_blocking(false);
        NonBlocking(ssh)
    }
}

impl Drop for NonBlocking<'_> {
    fn drop(&mut self) {
        self.0.set_blocking(true);
    }
}

fn lock_io(lock: &Mutex<()>) -> SshResult<MutexGuard<'_, ()>> {
    lock.lock()
        .map_err(|_| SshError::io("transport lock poisoned by a panicked call"))
}

impl Link {
    pub(crate) fn new(
        ssh: ssh2::Session,
        session_id: Arc<str>,
        verbosity: LogVerbosity,
        cancel: CancellationToken,
        readiness: Arc<Readiness>,
        io_lock: Arc<Mutex<()>>,
    ) -> Self {
        Self {
            ssh,
            session_id,
            verbosity,
            cancel,
            readiness,
            io_lock,
        }
    }

    /// Run a blocking transport call off the async worker threads.
    pub(crate) async fn run_blocking<T, F>(&self, what: &'static str, f: F) -> SshResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ssh2::Session) -> SshResult<T> + Send + 'static,
    {
        let ssh = self.ssh.clone();
        let io_lock = self.io_lock.clone();
        if self.verbosity.allows(log::Level::Trace) {
            trace!("[{}] {} (blocking)", self.session_id, what);
        }
        tokio::task::spawn_blocking(move || {
            let _io = lock_io(&io_lock)?;
            ssh.set_blocking(true);
            f(&ssh)
        })
        .await
        .map_err(|e| SshError::io(format!("{} task failed: {}", what, e)))?
    }

    /// Run one short transport call on the current thread under the transport lock.
    pub(crate) fn with_transport<T>(&self, f: impl FnOnce(&ssh2::Session) -> SshResult<T>) -> SshResult<T> {
        let _io = lock_io(&self.io_lock)?;
        f(&self.ssh)
    }

    /// One non-blocking attempt, no waiting.
    pub(crate) fn attempt<T>(&self, step: impl FnOnce(&ssh2::Session) -> SshResult<T>) -> SshResult<T> {
        let _io = lock_io(&self.io_lock)?;
        let _mode = NonBlocking::enter(&self.ssh);
        step(&self.ssh)
    }

    /// Retry `step` in non-blocking mode until it completes.
    ///
    /// Between attempts this checks for interruption and waits for the
    /// socket to become ready. Returns `Ok(None)` when `deadline` passes.
    pub(crate) async fn drive<T, F>(
        &self,
        what: &'static str,
        deadline: Option<Instant>,
        mut step: F,
    ) -> SshResult<Option<T>>
    where
        F: FnMut(&ssh2::Session) -> SshResult<Step<T>>,
    {
        let mut attempts: u64 = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(SshError::cancelled(format!("{} interrupted", what)));
            }

            let (outcome, dirs) = {
                let _io = lock_io(&self.io_lock)?;
                let _mode = NonBlocking::enter(&self.ssh);
                let outcome = step(&self.ssh)?;
                (outcome, self.ssh.block_directions())
            };
            attempts += 1;

            if let Step::Done(value) = outcome {
                if attempts > 1 && self.verbosity.allows(log::Level::Trace) {
                    trace!("[{}] {} completed after {} attempts", self.session_id, what, attempts);
                }
                return Ok(Some(value));
            }

            if deadline.map_or(false, |d| Instant::now() >= d) {
                return Ok(None);
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(SshError::cancelled(format!("{} interrupted", what)));
                }
                _ = sleep_until_deadline(deadline) => return Ok(None),
                ready = self.readiness.wait_for(dirs) => ready?,
            }
        }
    }

    /// `drive` for a single libssh2 call that may report "again".
    pub(crate) async fn retry<T, F>(&self, what: &'static str, kind: SshErrorKind, mut op: F) -> SshResult<T>
    where
        F: FnMut(&ssh2::Session) -> Result<T, ssh2::Error>,
    {
        let result = self
            .drive(what, None, |ssh| match op(ssh) {
                Ok(value) => Ok(Step::Done(value)),
                Err(e) if crate::ssh::status::is_again(&e) => Ok(Step::Again),
                Err(e) => Err(transport_error(kind, what, &e)),
            })
            .await?;
        result.ok_or_else(|| SshError::new(kind, format!("{} timed out", what)))
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending::<()>().await,
    }
}
