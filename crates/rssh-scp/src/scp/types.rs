// ── Types ─────────────────────────────────────────────────────────────────────

use rssh_core::{SshError, SshResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// SCP status byte: success.
pub const SCP_OK: u8 = 0;
/// SCP status byte: warning, followed by a message line.
pub const SCP_WARNING: u8 = 1;
/// SCP status byte: error, followed by a message line.
pub const SCP_ERROR: u8 = 2;

/// Longest protocol line accepted from the remote.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Permission bits carried in C / D messages.
pub const MODE_MASK: u32 = 0o7777;

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScpMode {
    /// Pull from the remote (`scp -f`).
    Read,
    /// Push to the remote (`scp -t`).
    Write,
}

impl ScpMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScpMode::Read => "read",
            ScpMode::Write => "write",
        }
    }

    /// Flag handed to the remote `scp`.
    pub fn remote_flag(&self) -> &'static str {
        match self {
            ScpMode::Read => "-f",
            ScpMode::Write => "-t",
        }
    }
}

impl fmt::Display for ScpMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ScpMode {
    type Err = SshError;

    fn from_str(s: &str) -> SshResult<Self> {
        match s {
            "read" => Ok(ScpMode::Read),
            "write" => Ok(ScpMode::Write),
            other => Err(SshError::invalid_argument(format!(
                "invalid SCP mode '{}' (expected read or write)",
                other
            ))),
        }
    }
}

/// What `pull_request` found next.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ScpRequest {
    NewFile,
    NewDirectory,
    EndDirectory,
    Warning,
    Eof,
}

/// Modification / access times announced by a `T` message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ScpTimes {
    pub mtime: u64,
    pub atime: u64,
}

/// Metadata of the request returned by the last `pull_request`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingRequest {
    pub size: u64,
    pub filename: Option<String>,
    pub permissions: u32,
    pub warning: Option<String>,
    pub times: Option<ScpTimes>,
}

/// Reject names that would escape the target directory or break the line format.
pub fn validate_name(name: &str) -> SshResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\n') {
        return Err(SshError::scp(format!("unsafe file name {:?}", name)));
    }
    Ok(())
}

/// Quote `arg` for the remote shell.
pub fn shell_quote(arg: &str) -> String {
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Remote command line for a transfer.
pub fn remote_command(mode: ScpMode, recursive: bool, path: &str) -> String {
    let mut cmd = format!("scp {}", mode.remote_flag());
    if recursive {
        cmd.push_str(" -r");
    }
    cmd.push(' ');
    cmd.push_str(&shell_quote(path));
    cmd
}
