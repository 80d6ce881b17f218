// ── Session options ───────────────────────────────────────────────────────────

use crate::ssh::paths::{self, ExpandContext};
use crate::ssh::status::transport_error;
use crate::ssh::types::{DEFAULT_SSH_PORT, TRANSPORT_METHOD_NOT_SUPPORTED};
use rssh_core::{LogVerbosity, SshError, SshErrorKind, SshResult};
use serde::{Deserialize, Serialize};
use ssh2::MethodType;
use std::path::PathBuf;
use std::time::Duration;

/// Identity files tried when none were added explicitly.
pub const DEFAULT_IDENTITIES: [&str; 4] = [
    "%d/id_ed25519",
    "%d/id_ecdsa",
    "%d/id_rsa",
    "%d/id_dsa",
];

const COMPRESSION_ALGORITHMS: [&str; 3] = ["none", "zlib", "zlib@openssh.com"];

fn default_true() -> bool {
    true
}

/// Compression setting: a plain on/off switch or an explicit algorithm list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Compression {
    Enabled(bool),
    Algorithm(String),
}

impl Compression {
    /// The string form handed to the transport ("yes" / "no" / algorithm list).
    pub fn as_option_value(&self) -> String {
        match self {
            Compression::Enabled(true) => "yes".to_string(),
            Compression::Enabled(false) => "no".to_string(),
            Compression::Algorithm(name) => name.clone(),
        }
    }
}

/// One settable session option.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOption {
    Host(String),
    User(String),
    Port(u16),
    BindAddress(String),
    KnownHosts(String),
    /// Connect timeout, whole seconds.
    Timeout(i64),
    /// Connect timeout, additional microseconds.
    TimeoutUsec(i64),
    /// Allowed protocol versions; each element must be 1 or 2.
    Protocol(Vec<i64>),
    KeyExchange(Vec<String>),
    HostKeys(Vec<String>),
    Compression(Compression),
    CompressionLevel(i32),
    StrictHostKeyCheck(bool),
    ProxyCommand(String),
    GssapiClientIdentity(String),
    GssapiServerIdentity(String),
    GssapiDelegateCredentials(bool),
    LogVerbosity(LogVerbosity),
    AddIdentity(String),
}

impl SessionOption {
    pub fn name(&self) -> &'static str {
        match self {
            SessionOption::Host(_) => "host",
            SessionOption::User(_) => "user",
            SessionOption::Port(_) => "port",
            SessionOption::BindAddress(_) => "bindaddr",
            SessionOption::KnownHosts(_) => "knownhosts",
            SessionOption::Timeout(_) => "timeout",
            SessionOption::TimeoutUsec(_) => "timeout_usec",
            SessionOption::Protocol(_) => "protocol",
            SessionOption::KeyExchange(_) => "key_exchange",
            SessionOption::HostKeys(_) => "hostkeys",
            SessionOption::Compression(_) => "compression",
            SessionOption::CompressionLevel(_) => "compression_level",
            SessionOption::StrictHostKeyCheck(_) => "stricthostkeycheck",
            SessionOption::ProxyCommand(_) => "proxycommand",
            SessionOption::GssapiClientIdentity(_) => "gssapi_client_identity",
            SessionOption::GssapiServerIdentity(_) => "gssapi_server_identity",
            SessionOption::GssapiDelegateCredentials(_) => "gssapi_delegate_credentials",
            SessionOption::LogVerbosity(_) => "log_verbosity",
            SessionOption::AddIdentity(_) => "add_identity",
        }
    }

    /// Options consumed by connect / key exchange; frozen after the handshake.
    pub fn affects_negotiation(&self) -> bool {
        matches!(
            self,
            SessionOption::Host(_)
                | SessionOption::Port(_)
                | SessionOption::BindAddress(_)
                | SessionOption::Timeout(_)
                | SessionOption::TimeoutUsec(_)
                | SessionOption::Protocol(_)
                | SessionOption::KeyExchange(_)
                | SessionOption::HostKeys(_)
                | SessionOption::Compression(_)
                | SessionOption::CompressionLevel(_)
                | SessionOption::ProxyCommand(_)
        )
    }
}

/// Every option a session recognises, as plain data.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SessionOptions {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub bind_address: Option<String>,
    #[serde(default)]
    pub known_hosts: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<i64>,
    #[serde(default)]
    pub timeout_usec: Option<i64>,
    #[serde(default)]
    pub ssh1: bool,
    #[serde(default = "default_true")]
    pub ssh2: bool,
    #[serde(default)]
    pub key_exchange: Option<String>,
    #[serde(default)]
    pub host_keys: Option<String>,
    #[serde(default)]
    pub compression: Option<Compression>,
    #[serde(default)]
    pub compression_level: Option<i32>,
    #[serde(default)]
    pub strict_host_key_check: Option<bool>,
    #[serde(default)]
    pub proxy_command: Option<String>,
    #[serde(default)]
    pub gssapi_client_identity: Option<String>,
    #[serde(default)]
    pub gssapi_server_identity: Option<String>,
    #[serde(default)]
    pub gssapi_delegate_credentials: Option<bool>,
    #[serde(default)]
    pub log_verbosity: LogVerbosity,
    #[serde(default)]
    pub identities: Vec<String>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            host: None,
            user: None,
            port: None,
            bind_address: None,
            known_hosts: None,
            timeout_secs: None,
            timeout_usec: None,
            ssh1: false,
            ssh2: true,
            key_exchange: None,
            host_keys: None,
            compression: None,
            compression_level: None,
            strict_host_key_check: None,
            proxy_command: None,
            gssapi_client_identity: None,
            gssapi_server_identity: None,
            gssapi_delegate_credentials: None,
            log_verbosity: LogVerbosity::None,
            identities: Vec::new(),
        }
    }
}

impl SessionOptions {
    pub fn from_json(json: &str) -> SshResult<Self> {
        let options: SessionOptions = serde_json::from_str(json)
            .map_err(|e| SshError::invalid_argument(format!("invalid session options: {}", e)))?;
        options.validate()?;
        Ok(options)
    }

    /// Validate and store one option.
    pub fn apply(&mut self, option: SessionOption) -> SshResult<()> {
        match option {
            SessionOption::Host(host) => {
                if host.trim().is_empty() {
                    return Err(SshError::protocol_option("host must not be empty"));
                }
                // "user@host" sets both, like ssh(1)
                match host.rsplit_once('@') {
                    Some((user, h)) if !user.is_empty() && !h.is_empty() => {
                        self.user = Some(user.to_string());
                        self.host = Some(h.to_string());
                    }
                    _ => self.host = Some(host),
                }
            }
            SessionOption::User(user) => self.user = Some(user),
            SessionOption::Port(port) => {
                if port == 0 {
                    return Err(SshError::protocol_option("port must be between 1 and 65535"));
                }
                self.port = Some(port);
            }
            SessionOption::BindAddress(addr) => self.bind_address = Some(addr),
            SessionOption::KnownHosts(path) => self.known_hosts = Some(path),
            SessionOption::Timeout(secs) => {
                if secs < 0 {
                    return Err(SshError::protocol_option("timeout must not be negative"));
                }
                self.timeout_secs = Some(secs);
            }
            SessionOption::TimeoutUsec(usec) => {
                if usec < 0 {
                    return Err(SshError::protocol_option("timeout_usec must not be negative"));
                }
                self.timeout_usec = Some(usec);
            }
            SessionOption::Protocol(versions) => {
                let (mut ssh1, mut ssh2) = (false, false);
                for version in versions {
                    match version {
                        1 => ssh1 = true,
                        2 => ssh2 = true,
                        other => {
                            return Err(SshError::invalid_argument(format!(
                                "protocol should be 1 or 2, got {}",
                                other
                            )))
                        }
                    }
                }
                self.ssh1 = ssh1;
                self.ssh2 = ssh2;
            }
            SessionOption::KeyExchange(methods) => {
                let list = methods.join(",");
                validate_methods(MethodType::Kex, &list)?;
                self.key_exchange = Some(list);
            }
            SessionOption::HostKeys(methods) => {
                let list = methods.join(",");
                validate_methods(MethodType::HostKey, &list)?;
                self.host_keys = Some(list);
            }
            SessionOption::Compression(compression) => {
                validate_compression(&compression)?;
                self.compression = Some(compression);
            }
            SessionOption::CompressionLevel(level) => {
                if !(1..=9).contains(&level) {
                    return Err(SshError::protocol_option(format!(
                        "compression level must be between 1 and 9, got {}",
                        level
                    )));
                }
                self.compression_level = Some(level);
            }
            SessionOption::StrictHostKeyCheck(on) => self.strict_host_key_check = Some(on),
            SessionOption::ProxyCommand(cmd) => {
                // "none" disables a proxy inherited from config, as in ssh_config(5)
                self.proxy_command = if cmd.eq_ignore_ascii_case("none") {
                    None
                } else {
                    Some(cmd)
                };
            }
            SessionOption::GssapiClientIdentity(id) => self.gssapi_client_identity = Some(id),
            SessionOption::GssapiServerIdentity(id) => self.gssapi_server_identity = Some(id),
            SessionOption::GssapiDelegateCredentials(on) => {
                self.gssapi_delegate_credentials = Some(on)
            }
            SessionOption::LogVerbosity(level) => self.log_verbosity = level,
            SessionOption::AddIdentity(path) => self.identities.push(path),
        }
        Ok(())
    }

    /// Re-check values that may have arrived through deserialisation.
    pub fn validate(&self) -> SshResult<()> {
        if self.port == Some(0) {
            return Err(SshError::protocol_option("port must be between 1 and 65535"));
        }
        if self.timeout_secs.map_or(false, |t| t < 0) || self.timeout_usec.map_or(false, |t| t < 0)
        {
            return Err(SshError::protocol_option("timeout must not be negative"));
        }
        if let Some(level) = self.compression_level {
            if !(1..=9).contains(&level) {
                return Err(SshError::protocol_option("compression level must be between 1 and 9"));
            }
        }
        if let Some(compression) = &self.compression {
            validate_compression(compression)?;
        }
        if let Some(list) = &self.key_exchange {
            validate_methods(MethodType::Kex, list)?;
        }
        if let Some(list) = &self.host_keys {
            validate_methods(MethodType::HostKey, list)?;
        }
        Ok(())
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_SSH_PORT)
    }

    /// Remote user, falling back to the local login name.
    pub fn user_or_default(&self) -> String {
        self.user.clone().unwrap_or_else(paths::local_user)
    }

    /// Combined connect timeout, if any part was set.
    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_secs.is_none() && self.timeout_usec.is_none() {
            return None;
        }
        let secs = self.timeout_secs.unwrap_or(0).max(0) as u64;
        let usec = self.timeout_usec.unwrap_or(0).max(0) as u64;
        Some(Duration::from_secs(secs) + Duration::from_micros(usec))
    }

    pub fn known_hosts_path(&self) -> SshResult<PathBuf> {
        match &self.known_hosts {
            Some(format) => paths::expand_path(format, &self.expand_context()),
            None => Ok(paths::default_known_hosts_path()),
        }
    }

    /// Identity path formats in the order they should be tried.
    pub fn identity_formats(&self) -> Vec<String> {
        if self.identities.is_empty() {
            DEFAULT_IDENTITIES.iter().map(|s| s.to_string()).collect()
        } else {
            self.identities.clone()
        }
    }

    /// Whether compression should be negotiated at all.
    pub fn compression_enabled(&self) -> bool {
        match &self.compression {
            None | Some(Compression::Enabled(false)) => false,
            Some(Compression::Enabled(true)) => true,
            Some(Compression::Algorithm(name)) => match name.as_str() {
                "yes" => true,
                "no" | "none" => false,
                _ => true,
            },
        }
    }

    /// Explicit compression method list for the transport, if one was named.
    pub fn compression_methods(&self) -> Option<&str> {
        match &self.compression {
            Some(Compression::Algorithm(name)) if name != "yes" && name != "no" => Some(name),
            _ => None,
        }
    }

    pub fn expand_context(&self) -> ExpandContext {
        ExpandContext {
            host: self.host.clone(),
            port: Some(self.port_or_default()),
            remote_user: self.user.clone(),
        }
    }
}

fn validate_compression(compression: &Compression) -> SshResult<()> {
    let Compression::Algorithm(value) = compression else {
        return Ok(());
    };
    if value == "yes" || value == "no" {
        return Ok(());
    }
    let valid = !value.is_empty()
        && value
            .split(',')
            .all(|name| COMPRESSION_ALGORITHMS.contains(&name.trim()));
    if valid {
        Ok(())
    } else {
        Err(SshError::protocol_option(format!(
            "unsupported compression '{}' (expected yes, no, none, zlib or zlib@openssh.com)",
            value
        )))
    }
}

/// Check an algorithm preference list against the transport's method table.
///
/// Every name must be one the transport implements; `method_pref` alone
/// silently drops unknown key exchange names. Uses a throwaway transport
/// session, so no network I/O happens.
pub(crate) fn validate_methods(method: MethodType, list: &str) -> SshResult<()> {
    if list.trim().is_empty() {
        return Err(SshError::protocol_option("algorithm list must not be empty"));
    }
    let scratch = ssh2::Session::new()
        .map_err(|e| transport_error(SshErrorKind::ProtocolOption, "cannot create transport", &e))?;
    let supported = scratch
        .supported_algs(method)
        .map_err(|e| transport_error(SshErrorKind::ProtocolOption, "cannot list algorithms", &e))?;
    if let Some(unknown) = list
        .split(',')
        .map(str::trim)
        .find(|name| !supported.iter().any(|alg| alg == name))
    {
        return Err(SshError::protocol_option(format!("unsupported algorithm '{}'", unknown))
            .with_code(TRANSPORT_METHOD_NOT_SUPPORTED));
    }
    scratch
        .method_pref(method, list)
        .map_err(|e| transport_error(SshErrorKind::ProtocolOption, "unsupported algorithms", &e))
}
