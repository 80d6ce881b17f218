//! # rssh – SSH
//!
//! Client-side SSH engine built on libssh2:
//!   • `Session` – options, connect / handshake, known hosts, authentication
//!   • `Channel` – session, exec, PTY and direct-tcpip channels with
//!     timeout-aware reads, polling and exit status
//!   • OpenSSH `ssh_config` loading and identity path expansion
//!   • Host `Key` fingerprints

pub mod ssh;
