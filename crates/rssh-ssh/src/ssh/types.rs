// ── Types ─────────────────────────────────────────────────────────────────────

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// libssh2 status for "operation would block".
pub const TRANSPORT_EAGAIN: i32 = -37;

/// libssh2 status for an algorithm name the transport doesn't implement.
pub const TRANSPORT_METHOD_NOT_SUPPORTED: i32 = -33;

/// Stream id of extended data carrying stderr.
pub(crate) const EXTENDED_DATA_STDERR: i32 = 1;

/// Standard SSH port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Source endpoint announced when opening a direct-tcpip channel.
pub const FORWARD_SOURCE_HOST: &str = "127.0.0.1";
pub const FORWARD_SOURCE_PORT: u16 = 22;

/// Convert a millisecond timeout where a negative value means "wait forever".
pub fn timeout_from_millis(ms: i64) -> Option<Duration> {
    if ms < 0 {
        None
    } else {
        Some(Duration::from_millis(ms as u64))
    }
}

// ── Session state ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    Unconnected,
    Connected,
    Authenticating,
    Authenticated,
    /// Terminal: torn down by `disconnect` or drop.
    Disconnected,
}

impl SessionState {
    /// True once the handshake has completed and the session is still alive.
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::Authenticating | SessionState::Authenticated
        )
    }
}

/// Match state of the server's host key against the known-hosts store.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum KnownHostStatus {
    KnownOk,
    KnownChanged,
    FoundOther,
    NotKnown,
    FileNotFound,
}

/// Outcome of an authentication attempt. Denial is an ordinary result.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AuthResult {
    Denied,
    Partial,
    Success,
    Again,
}

// ── Authentication methods ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    None,
    Password,
    Publickey,
    Hostbased,
    Interactive,
    GssapiMic,
}

impl AuthMethod {
    const ALL: [AuthMethod; 6] = [
        AuthMethod::None,
        AuthMethod::Password,
        AuthMethod::Publickey,
        AuthMethod::Hostbased,
        AuthMethod::Interactive,
        AuthMethod::GssapiMic,
    ];

    pub fn bit(&self) -> u32 {
        match self {
            AuthMethod::None => 0x01,
            AuthMethod::Password => 0x02,
            AuthMethod::Publickey => 0x04,
            AuthMethod::Hostbased => 0x08,
            AuthMethod::Interactive => 0x10,
            AuthMethod::GssapiMic => 0x20,
        }
    }

    /// Wire name as sent in SSH_MSG_USERAUTH_FAILURE.
    pub fn wire_name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password => "password",
            AuthMethod::Publickey => "publickey",
            AuthMethod::Hostbased => "hostbased",
            AuthMethod::Interactive => "keyboard-interactive",
            AuthMethod::GssapiMic => "gssapi-with-mic",
        }
    }

    fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.wire_name() == name)
    }
}

/// Bitmask of advertised authentication methods.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AuthMethods(pub u32);

impl AuthMethods {
    /// Parse the comma-separated list a server returns; unknown names are skipped.
    pub fn from_wire_list(list: &str) -> Self {
        let bits = list
            .split(',')
            .filter_map(|name| AuthMethod::from_wire(name.trim()))
            .fold(0, |acc, m| acc | m.bit());
        AuthMethods(bits)
    }

    pub fn contains(&self, method: AuthMethod) -> bool {
        self.0 & method.bit() != 0
    }

    pub fn insert(&mut self, method: AuthMethod) {
        self.0 |= method.bit();
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// Decode into the method enumeration, in bit order.
    pub fn to_vec(&self) -> Vec<AuthMethod> {
        AuthMethod::ALL
            .into_iter()
            .filter(|m| self.contains(*m))
            .collect()
    }
}

// ── Channel ──────────────────────────────────────────────────────────────────

/// Which data stream of a channel to read.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum StreamKind {
    #[default]
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn from_stderr(stderr: bool) -> Self {
        if stderr {
            StreamKind::Stderr
        } else {
            StreamKind::Stdout
        }
    }

    pub(crate) fn stream_id(&self) -> i32 {
        match self {
            StreamKind::Stdout => 0,
            StreamKind::Stderr => EXTENDED_DATA_STDERR,
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            StreamKind::Stdout => 0,
            StreamKind::Stderr => 1,
        }
    }
}

/// Result of `Channel::poll`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PollResult {
    /// Bytes buffered and readable without waiting (at least one).
    Ready(usize),
    /// The timeout elapsed with nothing to read.
    TimedOut,
    /// The remote signalled end of stream and nothing is buffered.
    Eof,
}

// ── Session info ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    pub host: Option<String>,
    pub port: u16,
    pub user: Option<String>,
    pub state: SessionState,
    pub connected_at: Option<DateTime<Utc>>,
    pub server_banner: Option<String>,
    pub host_key_fingerprint: Option<String>,
}
