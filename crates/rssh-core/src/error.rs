//! Error type shared by every rssh crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised SSH error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SshError {
    pub kind: SshErrorKind,
    pub message: String,
    /// Numeric status reported by the transport, if any.
    pub code: Option<i32>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SshErrorKind {
    /// Caller broke a precondition (e.g. opening a channel before connect).
    Usage,
    /// Malformed input value or out-of-range enumeration.
    InvalidArgument,
    /// The transport rejected a session option.
    ProtocolOption,
    /// TCP / handshake / known-hosts failure.
    Connection,
    /// Authentication transport failure (not a plain denial).
    Auth,
    /// Channel open / request / read / write failure.
    Channel,
    /// SCP protocol failure or remote SCP error message.
    Scp,
    /// Local I/O error.
    Io,
    /// A wait was aborted through the session interrupt.
    Cancelled,
}

pub type SshResult<T> = Result<T, SshError>;

// ── Construction helpers ─────────────────────────────────────────────

impl SshError {
    pub fn new(kind: SshErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn usage(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::Usage, msg)
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::InvalidArgument, msg)
    }

    pub fn protocol_option(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::ProtocolOption, msg)
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::Connection, msg)
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::Auth, msg)
    }

    pub fn channel(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::Channel, msg)
    }

    pub fn scp(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::Scp, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::Io, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(SshErrorKind::Cancelled, msg)
    }

    pub fn is_kind(&self, kind: SshErrorKind) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for SshError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "[SSH {:?} {}] {}", self.kind, code, self.message)
        } else {
            write!(f, "[SSH {:?}] {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for SshError {}

impl From<std::io::Error> for SshError {
    fn from(e: std::io::Error) -> Self {
        let err = Self::io(e.to_string());
        match e.raw_os_error() {
            Some(code) => err.with_code(code),
            None => err,
        }
    }
}

impl From<SshError> for String {
    fn from(e: SshError) -> String {
        e.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_code_when_present() {
        let err = SshError::channel("open failed").with_code(-21);
        assert_eq!(err.to_string(), "[SSH Channel -21] open failed");
    }

    #[test]
    fn display_without_code() {
        let err = SshError::usage("session isn't connected");
        assert_eq!(err.to_string(), "[SSH Usage] session isn't connected");
    }

    #[test]
    fn io_error_converts_to_io_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: SshError = io.into();
        assert!(err.is_kind(SshErrorKind::Io));
        assert!(err.message.contains("missing"));
    }

    #[test]
    fn serializes_kind_and_code() {
        let err = SshError::scp("remote said no").with_code(1);
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "Scp");
        assert_eq!(json["code"], 1);
        let back: SshError = serde_json::from_value(json).unwrap();
        assert_eq!(back.kind, SshErrorKind::Scp);
    }
}
