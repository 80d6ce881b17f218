// ── SCP wire protocol ─────────────────────────────────────────────────────────
//
// Write mode (we are the source, remote runs `scp -t`):
//   remote \0 → C<mode> <size> <name>\n → \0 → <size bytes> \0 → \0
// Read mode (we are the sink, remote runs `scp -f`):
//   \0 → C / D / E / T line → our \0 (accept) or \2<reason>\n (deny) → ...

use crate::scp::stream::ScpStream;
use crate::scp::types::{
    validate_name, PendingRequest, ScpMode, ScpRequest, ScpTimes, MAX_LINE_LENGTH, MODE_MASK,
    SCP_ERROR, SCP_OK, SCP_WARNING,
};
use log::{debug, warn};
use rssh_core::{SshError, SshResult};

/// Read size used while scanning for protocol lines.
const LINE_CHUNK: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Ready,
    /// Write mode, inside a file announced by `push_file`.
    Sending { remaining: u64 },
    /// Read mode, `pull_request` returned a file or directory.
    Requested(ScpRequest),
    /// Read mode, inside an accepted file.
    Receiving { remaining: u64 },
    /// Read mode, the remote has no more entries.
    Finished,
    Closed,
}

/// SCP state machine over an arbitrary byte stream.
pub struct ScpProtocol<S: ScpStream> {
    stream: S,
    mode: ScpMode,
    recursive: bool,
    phase: Phase,
    /// Bytes read from the stream but not consumed yet.
    inbox: Vec<u8>,
    remote_eof: bool,
    depth: usize,
    pending: PendingRequest,
    times: Option<ScpTimes>,
}

impl<S: ScpStream> ScpProtocol<S> {
    pub fn new(stream: S, mode: ScpMode, recursive: bool) -> Self {
        Self {
            stream,
            mode,
            recursive,
            phase: Phase::Created,
            inbox: Vec::new(),
            remote_eof: false,
            depth: 0,
            pending: PendingRequest::default(),
            times: None,
        }
    }

    pub fn mode(&self) -> ScpMode {
        self.mode
    }

    pub fn pending(&self) -> &PendingRequest {
        &self.pending
    }

    pub fn is_closed(&self) -> bool {
        self.phase == Phase::Closed
    }

    pub fn is_started(&self) -> bool {
        self.phase != Phase::Created
    }

    pub fn set_recursive(&mut self, recursive: bool) -> SshResult<()> {
        if self.phase != Phase::Created {
            return Err(SshError::usage("recursive mode must be chosen before init"));
        }
        self.recursive = recursive;
        Ok(())
    }

    /// Mark closed without touching the stream; its transport is already gone.
    pub fn abandon(&mut self) {
        self.phase = Phase::Closed;
        self.inbox.clear();
    }

    fn require_mode(&self, mode: ScpMode, op: &str) -> SshResult<()> {
        if self.mode != mode {
            return Err(SshError::usage(format!(
                "{} is only valid in {} mode",
                op, mode
            )));
        }
        Ok(())
    }

    fn wrong_phase(&self, op: &str) -> SshError {
        let why = match self.phase {
            Phase::Created => "the context is not initialized",
            Phase::Closed => "the context is closed",
            Phase::Sending { .. } => "file data is still expected",
            Phase::Receiving { .. } => "file data is still unread",
            Phase::Requested(_) => "the pending request must be accepted or denied",
            Phase::Finished => "the transfer has ended",
            Phase::Ready => "no request is pending",
        };
        SshError::usage(format!("{}: {}", op, why))
    }

    // ── Low-level I/O ────────────────────────────────────────────────────────

    async fn fill(&mut self, max: usize) -> SshResult<bool> {
        if self.remote_eof {
            return Ok(false);
        }
        match self.stream.read_chunk(max).await? {
            Some(data) => {
                self.inbox.extend_from_slice(&data);
                Ok(true)
            }
            None => {
                self.remote_eof = true;
                Ok(false)
            }
        }
    }

    async fn read_byte(&mut self) -> SshResult<Option<u8>> {
        if self.inbox.is_empty() && !self.fill(1).await? {
            return Ok(None);
        }
        Ok(Some(self.inbox.remove(0)))
    }

    /// Next `\n`-terminated line without the terminator. `None` at a clean EOF.
    async fn read_line(&mut self) -> SshResult<Option<Vec<u8>>> {
        loop {
            if let Some(pos) = self.inbox.iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> = self.inbox.drain(..=pos).collect();
                line.pop();
                return Ok(Some(line));
            }
            if self.inbox.len() > MAX_LINE_LENGTH {
                return Err(SshError::scp(format!(
                    "protocol line longer than {} bytes",
                    MAX_LINE_LENGTH
                )));
            }
            if !self.fill(LINE_CHUNK).await? {
                if self.inbox.is_empty() {
                    return Ok(None);
                }
                return Err(SshError::scp("connection closed inside a protocol line"));
            }
        }
    }

    /// Read a status byte from the remote; 1 / 2 become errors carrying its message.
    async fn read_response(&mut self) -> SshResult<()> {
        match self.read_byte().await? {
            Some(SCP_OK) => Ok(()),
            Some(code @ (SCP_WARNING | SCP_ERROR)) => {
                let message = self.read_line().await?.unwrap_or_default();
                let message = String::from_utf8_lossy(&message).trim().to_string();
                Err(SshError::scp(format!("remote scp: {}", message)).with_code(code as i32))
            }
            Some(other) => Err(SshError::scp(format!(
                "unexpected response byte 0x{:02x}",
                other
            ))),
            None => Err(SshError::scp("connection closed while waiting for a response")),
        }
    }

    async fn send_ok(&mut self) -> SshResult<()> {
        self.stream.write_all(&[SCP_OK]).await
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Complete the opening exchange once the remote `scp` is running.
    pub async fn start(&mut self) -> SshResult<()> {
        if self.phase != Phase::Created {
            return Err(SshError::usage("SCP context is already initialized"));
        }
        match self.mode {
            ScpMode::Write => self.read_response().await?,
            ScpMode::Read => self.send_ok().await?,
        }
        self.phase = Phase::Ready;
        Ok(())
    }

    /// Send EOF, drain what the remote still sends and close the stream.
    pub async fn finish(&mut self) -> SshResult<()> {
        if self.phase == Phase::Closed {
            return Ok(());
        }
        let was_started = self.phase != Phase::Created;
        if let Phase::Sending { remaining } = self.phase {
            warn!("closing SCP push with {} bytes unsent", remaining);
        }
        self.phase = Phase::Closed;

        let mut first_err = None;
        if was_started {
            if let Err(e) = self.stream.send_eof().await {
                first_err = Some(e);
            }
            while first_err.is_none() && !self.remote_eof {
                self.inbox.clear();
                if let Err(e) = self.fill(LINE_CHUNK).await {
                    first_err = Some(e);
                }
            }
        }
        let closed = self.stream.close().await;
        match first_err {
            Some(e) => Err(e),
            None => closed,
        }
    }

    // ── Write mode ───────────────────────────────────────────────────────────

    /// Announce a file of exactly `size` bytes.
    pub async fn push_file(&mut self, name: &str, size: u64, mode: u32) -> SshResult<()> {
        self.require_mode(ScpMode::Write, "push_file")?;
        if self.phase != Phase::Ready {
            return Err(self.wrong_phase("push_file"));
        }
        validate_name(name)?;
        let header = format!("C{:04o} {} {}\n", mode & MODE_MASK, size, name);
        self.stream.write_all(header.as_bytes()).await?;
        self.read_response().await?;
        debug!("scp push {} ({} bytes, {:04o})", name, size, mode & MODE_MASK);

        if size == 0 {
            self.end_file().await
        } else {
            self.phase = Phase::Sending { remaining: size };
            Ok(())
        }
    }

    async fn end_file(&mut self) -> SshResult<()> {
        self.send_ok().await?;
        self.phase = Phase::Ready;
        self.read_response().await
    }

    /// Send file bytes; anything beyond the announced size is not sent.
    pub async fn write(&mut self, data: &[u8]) -> SshResult<usize> {
        self.require_mode(ScpMode::Write, "write")?;
        let Phase::Sending { remaining } = self.phase else {
            return Err(self.wrong_phase("write"));
        };
        let n = data.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        self.stream.write_all(&data[..n]).await?;
        let remaining = remaining - n as u64;
        if remaining == 0 {
            self.end_file().await?;
        } else {
            self.phase = Phase::Sending { remaining };
        }
        Ok(n)
    }

    /// Open a directory on the remote; needs recursive mode.
    pub async fn push_directory(&mut self, name: &str, mode: u32) -> SshResult<()> {
        self.require_mode(ScpMode::Write, "push_directory")?;
        if !self.recursive {
            return Err(SshError::usage("push_directory needs recursive mode"));
        }
        if self.phase != Phase::Ready {
            return Err(self.wrong_phase("push_directory"));
        }
        validate_name(name)?;
        let header = format!("D{:04o} 0 {}\n", mode & MODE_MASK, name);
        self.stream.write_all(header.as_bytes()).await?;
        self.read_response().await?;
        self.depth += 1;
        Ok(())
    }

    /// Close the directory opened by the last `push_directory`.
    pub async fn leave_directory(&mut self) -> SshResult<()> {
        self.require_mode(ScpMode::Write, "leave_directory")?;
        if self.phase != Phase::Ready {
            return Err(self.wrong_phase("leave_directory"));
        }
        if self.depth == 0 {
            return Err(SshError::usage("leave_directory without an open directory"));
        }
        self.stream.write_all(b"E\n").await?;
        self.read_response().await?;
        self.depth -= 1;
        Ok(())
    }

    // ── Read mode ────────────────────────────────────────────────────────────

    /// Advance to the next entry announced by the remote.
    pub async fn pull_request(&mut self) -> SshResult<ScpRequest> {
        self.require_mode(ScpMode::Read, "pull_request")?;
        match self.phase {
            Phase::Ready => {}
            Phase::Finished => return Ok(ScpRequest::Eof),
            _ => return Err(self.wrong_phase("pull_request")),
        }
        self.pending = PendingRequest::default();

        loop {
            let Some(line) = self.read_line().await? else {
                self.phase = Phase::Finished;
                return Ok(ScpRequest::Eof);
            };
            let Some((&lead, rest)) = line.split_first() else {
                return Err(SshError::scp("empty protocol line"));
            };
            let rest = String::from_utf8_lossy(rest).into_owned();

            match lead {
                b'C' | b'D' => {
                    let kind = if lead == b'C' {
                        ScpRequest::NewFile
                    } else {
                        ScpRequest::NewDirectory
                    };
                    let (permissions, size, name) = parse_entry(&rest)?;
                    validate_name(&name)?;
                    self.pending = PendingRequest {
                        size,
                        filename: Some(name),
                        permissions,
                        warning: None,
                        times: self.times.take(),
                    };
                    self.phase = Phase::Requested(kind);
                    return Ok(kind);
                }
                b'E' => {
                    self.send_ok().await?;
                    self.depth = self.depth.saturating_sub(1);
                    return Ok(ScpRequest::EndDirectory);
                }
                b'T' => {
                    self.times = Some(parse_times(&rest)?);
                    self.send_ok().await?;
                }
                SCP_WARNING | SCP_ERROR => {
                    self.pending.warning = Some(rest.trim().to_string());
                    return Ok(ScpRequest::Warning);
                }
                other => {
                    return Err(SshError::scp(format!(
                        "unknown protocol message 0x{:02x}",
                        other
                    )))
                }
            }
        }
    }

    /// Accept the pending file or directory.
    pub async fn accept_request(&mut self) -> SshResult<()> {
        self.require_mode(ScpMode::Read, "accept_request")?;
        let Phase::Requested(kind) = self.phase else {
            return Err(self.wrong_phase("accept_request"));
        };
        self.send_ok().await?;
        match kind {
            ScpRequest::NewFile if self.pending.size == 0 => self.finish_receive().await?,
            ScpRequest::NewFile => {
                self.phase = Phase::Receiving {
                    remaining: self.pending.size,
                }
            }
            _ => {
                self.depth += 1;
                self.phase = Phase::Ready;
            }
        }
        Ok(())
    }

    /// Refuse the pending request with `reason`.
    pub async fn deny_request(&mut self, reason: &str) -> SshResult<()> {
        self.require_mode(ScpMode::Read, "deny_request")?;
        if !matches!(self.phase, Phase::Requested(_)) {
            return Err(self.wrong_phase("deny_request"));
        }
        let reason = reason.replace('\n', " ");
        let mut msg = Vec::with_capacity(reason.len() + 2);
        msg.push(SCP_ERROR);
        msg.extend_from_slice(reason.as_bytes());
        msg.push(b'\n');
        self.stream.write_all(&msg).await?;
        self.phase = Phase::Ready;
        Ok(())
    }

    /// Read up to `size` bytes of the accepted file.
    pub async fn read(&mut self, size: usize) -> SshResult<Vec<u8>> {
        self.require_mode(ScpMode::Read, "read")?;
        let Phase::Receiving { remaining } = self.phase else {
            return Err(self.wrong_phase("read"));
        };
        let want = size.min(usize::try_from(remaining).unwrap_or(usize::MAX));
        if want == 0 {
            return Ok(Vec::new());
        }
        if self.inbox.is_empty() && !self.fill(want).await? {
            return Err(SshError::scp(format!(
                "connection closed with {} bytes of file data outstanding",
                remaining
            )));
        }
        let n = want.min(self.inbox.len());
        let data: Vec<u8> = self.inbox.drain(..n).collect();

        let remaining = remaining - n as u64;
        if remaining == 0 {
            self.finish_receive().await?;
        } else {
            self.phase = Phase::Receiving { remaining };
        }
        Ok(data)
    }

    /// After the last data byte the sender reports its status; acknowledge it.
    async fn finish_receive(&mut self) -> SshResult<()> {
        self.phase = Phase::Ready;
        self.read_response().await?;
        self.send_ok().await
    }
}

/// Parse `<mode> <size> <name>` from a C or D line.
fn parse_entry(rest: &str) -> SshResult<(u32, u64, String)> {
    let mut parts = rest.splitn(3, ' ');
    let (Some(mode), Some(size), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(SshError::scp(format!("malformed entry header {:?}", rest)));
    };
    let mode = u32::from_str_radix(mode, 8)
        .map_err(|_| SshError::scp(format!("invalid mode {:?}", mode)))?;
    let size = size
        .parse::<u64>()
        .map_err(|_| SshError::scp(format!("invalid size {:?}", size)))?;
    Ok((mode & MODE_MASK, size, name.to_string()))
}

/// Parse `<mtime> 0 <atime> 0` from a T line.
fn parse_times(rest: &str) -> SshResult<ScpTimes> {
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let parse = |s: &str| {
        s.parse::<u64>()
            .map_err(|_| SshError::scp(format!("malformed time header {:?}", rest)))
    };
    match fields.as_slice() {
        [mtime, _, atime, _] => Ok(ScpTimes {
            mtime: parse(mtime)?,
            atime: parse(atime)?,
        }),
        _ => Err(SshError::scp(format!("malformed time header {:?}", rest))),
    }
}
