// ── Path helpers: ~/.ssh lookup and %-escape expansion ───────────────────────

use rssh_core::{SshError, SshResult};
use std::path::{Path, PathBuf};

/// Values substituted into identity / proxy-command format strings.
#[derive(Debug, Clone, Default)]
pub struct ExpandContext {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub remote_user: Option<String>,
}

pub fn home_dir() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
}

pub fn ssh_dir() -> PathBuf {
    home_dir().join(".ssh")
}

pub fn default_known_hosts_path() -> PathBuf {
    ssh_dir().join("known_hosts")
}

pub fn default_config_path() -> PathBuf {
    ssh_dir().join("config")
}

/// Login name of the local user.
pub fn local_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .or_else(|_| std::env::var("LOGNAME"))
        .unwrap_or_else(|_| "root".to_string())
}

pub fn local_hostname() -> String {
    if let Ok(name) = std::fs::read_to_string("/etc/hostname") {
        let name = name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
    }
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Replace a leading `~` with the home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        home_dir()
    } else if let Some(rest) = path.strip_prefix("~/") {
        home_dir().join(rest)
    } else {
        PathBuf::from(path)
    }
}

/// Expand `%d %u %l %h %r %p %%` and a leading `~`.
pub fn expand_format(format: &str, ctx: &ExpandContext) -> SshResult<String> {
    let mut out = String::with_capacity(format.len() + 16);
    let mut chars = format.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('d') => out.push_str(&ssh_dir().to_string_lossy()),
            Some('u') => out.push_str(&local_user()),
            Some('l') => out.push_str(&local_hostname()),
            Some('h') => out.push_str(ctx.host.as_deref().ok_or_else(|| {
                SshError::invalid_argument(format!("'{}' needs a host for %h", format))
            })?),
            Some('r') => {
                let user = ctx.remote_user.clone().unwrap_or_else(local_user);
                out.push_str(&user)
            }
            Some('p') => out.push_str(&ctx.port.unwrap_or(22).to_string()),
            Some(other) => {
                return Err(SshError::invalid_argument(format!(
                    "invalid escape sequence '%{}' in '{}'",
                    other, format
                )))
            }
            None => {
                return Err(SshError::invalid_argument(format!(
                    "dangling '%' at end of '{}'",
                    format
                )))
            }
        }
    }

    Ok(expand_tilde(&out).to_string_lossy().into_owned())
}

pub fn expand_path(format: &str, ctx: &ExpandContext) -> SshResult<PathBuf> {
    expand_format(format, ctx).map(PathBuf::from)
}

/// Resolve a path relative to `~/.ssh` unless it is absolute or `~`-prefixed.
pub fn resolve_in_ssh_dir(path: &str) -> PathBuf {
    let expanded = expand_tilde(path);
    if expanded.is_absolute() {
        expanded
    } else {
        ssh_dir().join(Path::new(path))
    }
}
