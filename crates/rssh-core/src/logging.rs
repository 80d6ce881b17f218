//! Log verbosity levels and the process-wide logging bootstrap.

use crate::error::{SshError, SshResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Per-session diagnostic verbosity.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogVerbosity {
    #[default]
    None,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogVerbosity {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogVerbosity::None => "none",
            LogVerbosity::Warn => "warn",
            LogVerbosity::Info => "info",
            LogVerbosity::Debug => "debug",
            LogVerbosity::Trace => "trace",
        }
    }

    pub fn level_filter(&self) -> log::LevelFilter {
        match self {
            LogVerbosity::None => log::LevelFilter::Off,
            LogVerbosity::Warn => log::LevelFilter::Warn,
            LogVerbosity::Info => log::LevelFilter::Info,
            LogVerbosity::Debug => log::LevelFilter::Debug,
            LogVerbosity::Trace => log::LevelFilter::Trace,
        }
    }

    /// Whether a record at `level` should be emitted for this verbosity.
    pub fn allows(&self, level: log::Level) -> bool {
        level <= self.level_filter()
    }

    /// Map an OpenSSH `LogLevel` keyword onto the closest verbosity.
    pub fn from_openssh(level: &str) -> Option<Self> {
        match level.to_ascii_uppercase().as_str() {
            "QUIET" => Some(LogVerbosity::None),
            "FATAL" | "ERROR" => Some(LogVerbosity::Warn),
            "INFO" | "VERBOSE" => Some(LogVerbosity::Info),
            "DEBUG" | "DEBUG1" => Some(LogVerbosity::Debug),
            "DEBUG2" | "DEBUG3" => Some(LogVerbosity::Trace),
            _ => None,
        }
    }
}

impl FromStr for LogVerbosity {
    type Err = SshError;

    fn from_str(s: &str) -> SshResult<Self> {
        match s {
            "none" => Ok(LogVerbosity::None),
            "warn" => Ok(LogVerbosity::Warn),
            "info" => Ok(LogVerbosity::Info),
            "debug" => Ok(LogVerbosity::Debug),
            "trace" => Ok(LogVerbosity::Trace),
            other => Err(SshError::invalid_argument(format!(
                "invalid log verbosity '{}' (expected none, warn, info, debug or trace)",
                other
            ))),
        }
    }
}

impl fmt::Display for LogVerbosity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Install a fmt subscriber filtered by `RUST_LOG`, falling back to `default_filter`.
///
/// `log` records from the rssh crates are bridged into the subscriber.
/// Calling this more than once is a no-op.
pub fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let installed = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!("logging initialised");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SshErrorKind;

    #[test]
    fn parses_every_known_level() {
        for (name, level) in [
            ("none", LogVerbosity::None),
            ("warn", LogVerbosity::Warn),
            ("info", LogVerbosity::Info),
            ("debug", LogVerbosity::Debug),
            ("trace", LogVerbosity::Trace),
        ] {
            assert_eq!(name.parse::<LogVerbosity>().unwrap(), level);
            assert_eq!(level.as_str(), name);
        }
    }

    #[test]
    fn unknown_level_is_invalid_argument() {
        let err = "loud".parse::<LogVerbosity>().unwrap_err();
        assert_eq!(err.kind, SshErrorKind::InvalidArgument);
    }

    #[test]
    fn none_suppresses_everything() {
        assert!(!LogVerbosity::None.allows(log::Level::Error));
        assert!(LogVerbosity::Debug.allows(log::Level::Debug));
        assert!(!LogVerbosity::Debug.allows(log::Level::Trace));
    }

    #[test]
    fn openssh_levels_map() {
        assert_eq!(LogVerbosity::from_openssh("quiet"), Some(LogVerbosity::None));
        assert_eq!(LogVerbosity::from_openssh("DEBUG3"), Some(LogVerbosity::Trace));
        assert_eq!(LogVerbosity::from_openssh("chatty"), None);
    }

    #[test]
    fn init_logging_twice_is_harmless() {
        init_logging("warn");
        init_logging("debug");
    }
}
