//! # rssh
//!
//! Async SSH client core built on libssh2:
//!   • `Session` connects, verifies the host key and authenticates
//!   • `Channel` multiplexes exec / pty / direct-tcpip streams over a session
//!   • `ScpContext` pushes or pulls files over a dedicated channel
//!
//! Every call that may block on the network is dispatched off the async
//! runtime and can be aborted with `Session::interrupt`.

pub use rssh_core;
pub use rssh_scp;
pub use rssh_ssh;

pub use rssh_core::logging::init_logging;
pub use rssh_core::scope::with_release;
pub use rssh_core::{LogVerbosity, SshError, SshErrorKind, SshResult};
pub use rssh_scp::scp::{ScpContext, ScpMode, ScpRequest, ScpTimes};
pub use rssh_ssh::ssh::{
    AuthMethod, AuthResult, Channel, Compression, Key, KeyType, KnownHostStatus, PollResult,
    Session, SessionInfo, SessionOption, SessionOptions, SessionState, StreamKind,
};
