//! # rssh – Core
//!
//! Shared building blocks for the session, channel and SCP crates:
//!   • `SshError` / `SshResult`, carrying the transport's numeric code
//!   • `LogVerbosity` and the process-wide logging bootstrap
//!   • Scoped acquisition helper that always runs the release step once

pub mod error;
pub mod logging;
pub mod scope;

pub use error::{SshError, SshErrorKind, SshResult};
pub use logging::LogVerbosity;
