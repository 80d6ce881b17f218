// ── Transport status classification ───────────────────────────────────────────

use crate::ssh::types::TRANSPORT_EAGAIN;
use rssh_core::{SshError, SshErrorKind};
use ssh2::ErrorCode;

/// Numeric code of a libssh2 error.
pub(crate) fn code_of(e: &ssh2::Error) -> i32 {
    match e.code() {
        ErrorCode::Session(code) => code,
        ErrorCode::SFTP(code) => code,
    }
}

/// True for the transient "would block" status.
pub(crate) fn is_again(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::Session(TRANSPORT_EAGAIN))
}

pub(crate) fn io_is_again(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::WouldBlock
}

/// Wrap a transport error, keeping its code and message.
pub(crate) fn transport_error(kind: SshErrorKind, context: &str, e: &ssh2::Error) -> SshError {
    SshError::new(kind, format!("{}: {}", context, e.message())).with_code(code_of(e))
}

/// Wrap an I/O error raised by a channel stream.
pub(crate) fn stream_error(kind: SshErrorKind, context: &str, e: &std::io::Error) -> SshError {
    let err = SshError::new(kind, format!("{}: {}", context, e));
    match e.raw_os_error() {
        Some(code) => err.with_code(code),
        None => err,
    }
}

// libssh2 codes for an attempt the server (or agent) turned down.
const DENIAL_CODES: [i32; 7] = [
    -15, // password expired
    -16, // key file unreadable
    -17, // method none
    -18, // authentication failed
    -19, // public key unverified
    -42, // agent protocol
    -48, // key file auth failed
];

/// True when an auth call failed because the credentials were refused,
/// as opposed to a broken transport.
pub(crate) fn is_auth_denial(e: &ssh2::Error) -> bool {
    DENIAL_CODES.contains(&code_of(e))
}
