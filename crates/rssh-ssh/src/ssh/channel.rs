// ── Channel: one multiplexed stream over a session ────────────────────────────
//
// The raw transport channel lives behind a mutex together with per-stream
// buffers. Lock order: transport lock first, channel state second.

use crate::ssh::link::{Link, Step};
use crate::ssh::session::{DependentRank, Session, SessionDependent, SessionHandle};
use crate::ssh::status::{io_is_again, is_again, stream_error, transport_error};
use crate::ssh::types::{PollResult, StreamKind, FORWARD_SOURCE_HOST, FORWARD_SOURCE_PORT};
use log::debug;
use rssh_core::scope::with_release;
use rssh_core::{SshError, SshErrorKind, SshResult};
use std::future::Future;
use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

/// Read size used when draining streams into the pending buffers.
const DRAIN_CHUNK: usize = 16 * 1024;

const PTY_TERM: &str = "xterm";
const PTY_SIZE: (u32, u32, u32, u32) = (80, 24, 0, 0);

/// Transport side of a channel as seen by the read paths.
trait RawStream {
    /// Non-blocking read from one stream. `Ok(0)` means the remote sent EOF
    /// and nothing is left queued for that stream.
    fn read_stream(&mut self, stream: StreamKind, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Channel-level EOF with no data queued on either stream.
    fn remote_eof(&self) -> bool;
}

impl RawStream for ssh2::Channel {
    fn read_stream(&mut self, stream: StreamKind, buf: &mut [u8]) -> std::io::Result<usize> {
        self.stream(stream.stream_id()).read(buf)
    }

    fn remote_eof(&self) -> bool {
        self.eof()
    }
}

struct ChannelState<R = ssh2::Channel> {
    raw: Option<R>,
    pending: [Vec<u8>; 2],
    stream_eof: [bool; 2],
    closed: bool,
    remote_closed: bool,
    remote_eof: bool,
    finished: bool,
    exit_status: Option<i32>,
    exit_signal: Option<String>,
    forward: Option<(String, u16)>,
}

impl<R> Default for ChannelState<R> {
    fn default() -> Self {
        Self {
            raw: None,
            pending: [Vec::new(), Vec::new()],
            stream_eof: [false; 2],
            closed: false,
            remote_closed: false,
            remote_eof: false,
            finished: false,
            exit_status: None,
            exit_signal: None,
            forward: None,
        }
    }
}

impl<R: RawStream> ChannelState<R> {
    fn raw_mut(&mut self) -> SshResult<&mut R> {
        if self.closed {
            return Err(SshError::usage("channel is closed"));
        }
        self.raw
            .as_mut()
            .ok_or_else(|| SshError::usage("channel isn't open"))
    }

    fn take_pending(&mut self, stream: StreamKind, count: usize) -> Vec<u8> {
        let buf = &mut self.pending[stream.index()];
        let n = count.min(buf.len());
        buf.drain(..n).collect()
    }

    fn remote_eof(&self) -> bool {
        self.remote_eof || self.raw.as_ref().map_or(false, |r| r.remote_eof())
    }

    /// No more bytes will ever arrive on `stream` from the transport.
    fn stream_at_eof(&self, stream: StreamKind) -> bool {
        self.stream_eof[stream.index()] || self.remote_eof()
    }

    /// Both streams have ended and every buffered byte has been handed out.
    fn drained(&self) -> bool {
        (self.remote_eof() || self.stream_eof.iter().all(|e| *e))
            && self.pending.iter().all(Vec::is_empty)
    }

    /// Pull whatever the transport has buffered for `stream` into `pending`.
    /// Returns false once the stream would block or has ended.
    fn fill(&mut self, stream: StreamKind) -> SshResult<bool> {
        let idx = stream.index();
        if self.stream_eof[idx] {
            return Ok(false);
        }
        let raw = self.raw_mut()?;
        let mut chunk = vec![0u8; DRAIN_CHUNK];
        match raw.read_stream(stream, &mut chunk) {
            Ok(0) => {
                self.stream_eof[idx] = true;
                Ok(false)
            }
            Ok(n) => {
                self.pending[idx].extend_from_slice(&chunk[..n]);
                Ok(true)
            }
            Err(e) if io_is_again(&e) => Ok(false),
            Err(e) => Err(stream_error(SshErrorKind::Channel, "channel read failed", &e)),
        }
    }

    /// Non-blocking read of up to `count` bytes. An empty `Done` means EOF.
    fn read_step(&mut self, stream: StreamKind, count: usize) -> SshResult<Step<Vec<u8>>> {
        let idx = stream.index();
        if !self.pending[idx].is_empty() {
            return Ok(Step::Done(self.take_pending(stream, count)));
        }
        if self.stream_eof[idx] {
            self.raw_mut()?;
            return Ok(Step::Done(Vec::new()));
        }
        let raw = self.raw_mut()?;
        let mut buf = vec![0u8; count];
        match raw.read_stream(stream, &mut buf) {
            Ok(0) => {
                self.stream_eof[idx] = true;
                Ok(Step::Done(Vec::new()))
            }
            Ok(n) => {
                buf.truncate(n);
                Ok(Step::Done(buf))
            }
            Err(e) if io_is_again(&e) => Ok(Step::Again),
            Err(e) => Err(stream_error(SshErrorKind::Channel, "channel read failed", &e)),
        }
    }

    /// `None` at end of stream, `Some(vec![])` when nothing is available yet.
    fn nonblocking_step(&mut self, stream: StreamKind, count: usize) -> SshResult<Option<Vec<u8>>> {
        if count == 0 {
            self.raw_mut()?;
            let ended = self.pending[stream.index()].is_empty() && self.stream_at_eof(stream);
            return Ok(if ended { None } else { Some(Vec::new()) });
        }
        match self.read_step(stream, count)? {
            Step::Done(data) if data.is_empty() => Ok(None),
            Step::Done(data) => Ok(Some(data)),
            Step::Again => Ok(Some(Vec::new())),
        }
    }

    fn poll_step(&mut self, stream: StreamKind) -> SshResult<Step<PollResult>> {
        while self.fill(stream)? {}
        let available = self.pending[stream.index()].len();
        if available > 0 {
            Ok(Step::Done(PollResult::Ready(available)))
        } else if self.stream_at_eof(stream) {
            Ok(Step::Done(PollResult::Eof))
        } else {
            Ok(Step::Again)
        }
    }
}

impl ChannelState {
    fn exit_step(&mut self) -> SshResult<Step<Option<i32>>> {
        // keep the remote's window open while waiting for it to finish
        while self.fill(StreamKind::Stdout)? {}
        while self.fill(StreamKind::Stderr)? {}

        let raw = self.raw_mut()?;
        if !raw.eof() {
            return Ok(Step::Again);
        }
        match raw.wait_close() {
            Ok(()) => {}
            Err(e) if is_again(&e) => return Ok(Step::Again),
            Err(e) => return Err(transport_error(SshErrorKind::Channel, "waiting for channel close", &e)),
        }
        let code = raw
            .exit_status()
            .map_err(|e| transport_error(SshErrorKind::Channel, "cannot read exit status", &e))?;
        let signal = raw.exit_signal().ok().and_then(|s| s.exit_signal);

        self.remote_eof = true;
        self.remote_closed = true;
        self.finished = true;
        self.exit_status = if signal.is_some() { None } else { Some(code) };
        self.exit_signal = signal;
        Ok(Step::Done(self.exit_status))
    }
}

fn lock_state<R>(state: &Mutex<ChannelState<R>>) -> MutexGuard<'_, ChannelState<R>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn read_from<R: RawStream>(
    link: &Link,
    state: &Mutex<ChannelState<R>>,
    count: usize,
    stream: StreamKind,
    timeout: Option<Duration>,
) -> SshResult<Vec<u8>> {
    {
        let mut guard = lock_state(state);
        guard.raw_mut()?;
        if count == 0 {
            return Ok(Vec::new());
        }
        if !guard.pending[stream.index()].is_empty() {
            return Ok(guard.take_pending(stream, count));
        }
    }
    let deadline = timeout.map(|t| Instant::now() + t);
    let data = link
        .drive("channel read", deadline, |_| lock_state(state).read_step(stream, count))
        .await?;
    Ok(data.unwrap_or_default())
}

async fn poll_on<R: RawStream>(
    link: &Link,
    state: &Mutex<ChannelState<R>>,
    stream: StreamKind,
    timeout: Option<Duration>,
) -> SshResult<PollResult> {
    {
        let mut guard = lock_state(state);
        guard.raw_mut()?;
        let available = guard.pending[stream.index()].len();
        if available > 0 {
            return Ok(PollResult::Ready(available));
        }
    }
    let deadline = timeout.map(|t| Instant::now() + t);
    let result = link
        .drive("channel poll", deadline, |_| lock_state(state).poll_step(stream))
        .await?;
    Ok(result.unwrap_or(PollResult::TimedOut))
}

struct ChannelShared {
    id: String,
    session: SessionHandle,
    state: Mutex<ChannelState>,
}

impl ChannelShared {
    fn state(&self) -> MutexGuard<'_, ChannelState> {
        lock_state(&self.state)
    }
}

impl SessionDependent for ChannelShared {
    fn rank(&self) -> DependentRank {
        DependentRank::Channel
    }

    fn detach(&self) {
        let mut state = self.state();
        if let Some(raw) = state.raw.take() {
            debug!("channel {} released by session teardown", self.id);
            drop(raw);
        }
        state.closed = true;
    }
}

impl Drop for ChannelShared {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        let Some(raw) = state.raw.take() else {
            return;
        };
        // free under the transport lock so no non-blocking call is in flight
        match self.session.link() {
            Ok(link) => {
                let _ = link.with_transport(move |_| {
                    drop(raw);
                    Ok(())
                });
            }
            Err(_) => drop(raw),
        }
    }
}

/// A logical channel on a session.
///
/// Cloning yields another handle to the same channel.
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    /// Bind a new, unopened channel to `session`. No I/O.
    pub fn new(session: &Session) -> Self {
        Self::with_handle(session.handle())
    }

    pub fn with_handle(session: SessionHandle) -> Self {
        let shared = Arc::new(ChannelShared {
            id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            session: session.clone(),
            state: Mutex::new(ChannelState::default()),
        });
        let weak: Weak<dyn SessionDependent> = Arc::downgrade(&shared) as Weak<dyn SessionDependent>;
        session.register(weak);
        Self { shared }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    pub fn session(&self) -> &SessionHandle {
        &self.shared.session
    }

    fn ensure_unopened(&self) -> SshResult<()> {
        let state = self.shared.state();
        if state.raw.is_some() && !state.closed {
            return Err(SshError::usage("channel is already open"));
        }
        Ok(())
    }

    fn install(&self, raw: ssh2::Channel, forward: Option<(String, u16)>) {
        let mut state = self.shared.state();
        *state = ChannelState {
            raw: Some(raw),
            forward,
            ..ChannelState::default()
        };
    }

    // ── Opening ──────────────────────────────────────────────────────────────

    /// Open a session-type channel, retrying while the transport would block.
    pub async fn open_session(&self) -> SshResult<()> {
        let link = self.shared.session.link()?;
        self.ensure_unopened()?;
        let raw = link
            .retry("open session channel", SshErrorKind::Channel, |ssh| ssh.channel_session())
            .await?;
        self.install(raw, None);
        debug!("[{}] channel {} opened", link.session_id, self.shared.id);
        Ok(())
    }

    /// Open a direct-tcpip channel to `host:port`.
    pub async fn open_forward(&self, host: &str, port: u16) -> SshResult<()> {
        let link = self.shared.session.link()?;
        self.ensure_unopened()?;
        let raw = link
            .retry("open forward channel", SshErrorKind::Channel, |ssh| {
                ssh.channel_direct_tcpip(host, port, Some((FORWARD_SOURCE_HOST, FORWARD_SOURCE_PORT)))
            })
            .await?;
        self.install(raw, Some((host.to_string(), port)));
        debug!(
            "[{}] channel {} forwarding to {}:{}",
            link.session_id, self.shared.id, host, port
        );
        Ok(())
    }

    /// `open_session`, run `action`, then `close` exactly once.
    pub async fn open_session_scoped<T, F, Fut>(&self, action: F) -> SshResult<T>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = SshResult<T>>,
    {
        self.open_session().await?;
        with_release(action(self.clone()), self.close()).await
    }

    /// `open_forward`, run `action`, then `close` exactly once.
    pub async fn open_forward_scoped<T, F, Fut>(&self, host: &str, port: u16, action: F) -> SshResult<T>
    where
        F: FnOnce(Channel) -> Fut,
        Fut: Future<Output = SshResult<T>>,
    {
        self.open_forward(host, port).await?;
        with_release(action(self.clone()), self.close()).await
    }

    /// Close the channel. Closing twice is a no-op.
    pub async fn close(&self) -> SshResult<()> {
        {
            let state = self.shared.state();
            if state.closed || state.raw.is_none() {
                return Ok(());
            }
        }
        let link = self.shared.session.link()?;
        let shared = self.shared.clone();
        link.run_blocking("close channel", move |_| {
            let mut guard = shared.state();
            let state = &mut *guard;
            if state.closed {
                return Ok(());
            }
            let Some(raw) = state.raw.as_mut() else {
                return Ok(());
            };
            raw.close()
                .map_err(|e| transport_error(SshErrorKind::Channel, "channel close failed", &e))?;
            let eof = raw.eof();
            if eof {
                if let Err(e) = raw.wait_close() {
                    debug!("channel {} wait_close: {}", shared.id, e.message());
                }
                if !state.finished {
                    let signal = raw.exit_signal().ok().and_then(|s| s.exit_signal);
                    if signal.is_none() {
                        state.exit_status = raw.exit_status().ok();
                    }
                    state.exit_signal = signal;
                    state.finished = true;
                }
            }
            state.remote_eof |= eof;
            state.closed = true;
            state.raw = None;
            Ok(())
        })
        .await
    }

    // ── Requests ─────────────────────────────────────────────────────────────

    async fn blocking_request<T, F>(&self, what: &'static str, f: F) -> SshResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut ssh2::Channel) -> SshResult<T> + Send + 'static,
    {
        let link = self.shared.session.link()?;
        self.shared.state().raw_mut()?;
        let shared = self.shared.clone();
        link.run_blocking(what, move |_| {
            let mut state = shared.state();
            let raw = state.raw_mut()?;
            f(raw)
        })
        .await
    }

    pub async fn request_exec(&self, command: &str) -> SshResult<()> {
        let command = command.to_string();
        self.blocking_request("exec request", move |raw| {
            raw.exec(&command)
                .map_err(|e| transport_error(SshErrorKind::Channel, "exec request failed", &e))
        })
        .await
    }

    /// Request a pseudo-terminal (`xterm`, 80x24).
    pub async fn request_pty(&self) -> SshResult<()> {
        self.blocking_request("pty request", |raw| {
            raw.request_pty(PTY_TERM, None, Some(PTY_SIZE))
                .map_err(|e| transport_error(SshErrorKind::Channel, "pty request failed", &e))
        })
        .await
    }

    // ── Writing ──────────────────────────────────────────────────────────────

    /// Write `data`, returning how many bytes were accepted.
    pub async fn write(&self, data: &[u8]) -> SshResult<usize> {
        let data = data.to_vec();
        self.blocking_request("channel write", move |raw| {
            raw.write(&data)
                .map_err(|e| stream_error(SshErrorKind::Channel, "channel write failed", &e))
        })
        .await
    }

    /// Write every byte of `data`, looping over short writes.
    pub async fn write_all(&self, data: &[u8]) -> SshResult<()> {
        let mut offset = 0;
        while offset < data.len() {
            let n = self.write(&data[offset..]).await?;
            if n == 0 {
                return Err(SshError::channel("channel accepted no data"));
            }
            offset += n;
        }
        Ok(())
    }

    pub async fn send_eof(&self) -> SshResult<()> {
        self.blocking_request("send eof", |raw| {
            raw.send_eof()
                .map_err(|e| transport_error(SshErrorKind::Channel, "send eof failed", &e))
        })
        .await
    }

    // ── Reading ──────────────────────────────────────────────────────────────

    /// Read up to `count` bytes from `stream`, waiting at most `timeout`
    /// (`None` waits forever). Returns no bytes on timeout or at EOF.
    pub async fn read(&self, count: usize, stream: StreamKind, timeout: Option<Duration>) -> SshResult<Vec<u8>> {
        let link = self.shared.session.link()?;
        read_from(&link, &self.shared.state, count, stream, timeout).await
    }

    /// One read attempt that never waits. `None` means end of stream;
    /// `Some` with no bytes means nothing is available yet.
    pub fn read_nonblocking(&self, count: usize, stream: StreamKind) -> SshResult<Option<Vec<u8>>> {
        let link = self.shared.session.link()?;
        link.attempt(|_| self.shared.state().nonblocking_step(stream, count))
    }

    /// Wait up to `timeout` for data on `stream`.
    pub async fn poll(&self, stream: StreamKind, timeout: Option<Duration>) -> SshResult<PollResult> {
        let link = self.shared.session.link()?;
        poll_on(&link, &self.shared.state, stream, timeout).await
    }

    // ── Exit status ──────────────────────────────────────────────────────────

    /// Wait for the remote command to finish and return its exit code.
    ///
    /// `None` when the channel was closed before a status arrived or the
    /// command was killed by a signal (see `exit_signal`).
    pub async fn get_exit_status(&self) -> SshResult<Option<i32>> {
        {
            let state = self.shared.state();
            if state.finished || state.closed {
                return Ok(state.exit_status);
            }
            if state.raw.is_none() {
                return Err(SshError::usage("channel isn't open"));
            }
        }
        let link = self.shared.session.link()?;
        let shared = self.shared.clone();
        let status = link
            .drive("exit status", None, |_| shared.state().exit_step())
            .await?;
        Ok(status.flatten())
    }

    pub fn exit_signal(&self) -> Option<String> {
        self.shared.state().exit_signal.clone()
    }

    // ── State ────────────────────────────────────────────────────────────────

    /// Remote sent EOF and every buffered byte has been read.
    pub fn eof(&self) -> bool {
        self.shared.state().drained()
    }

    pub fn is_open(&self) -> bool {
        let state = self.shared.state();
        state.raw.is_some() && !state.closed && !state.remote_closed
    }

    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }

    /// `host:port` this channel forwards to, for direct-tcpip channels.
    pub fn forward_target(&self) -> Option<(String, u16)> {
        self.shared.state().forward.clone()
    }
}
