//! OpenSSH client configuration (`~/.ssh/config`) loader.
//!
//! Supports `Host` blocks with `*` / `?` wildcards and `!` negation,
//! `Match all`, `Include` (globbed, relative to `~/.ssh`), `Key value` and
//! `Key=value` syntax and double-quoted arguments. The first value obtained
//! for a keyword wins; `IdentityFile` accumulates.

use crate::ssh::options::{Compression, SessionOption, SessionOptions};
use crate::ssh::paths;
use log::{debug, warn};
use rssh_core::LogVerbosity;
use std::path::{Path, PathBuf};

const MAX_INCLUDE_DEPTH: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}:{line}: {message}")]
    Parse {
        path: PathBuf,
        line: usize,
        message: String,
    },
    #[error("Include nested deeper than {0} levels")]
    IncludeDepth(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Criteria {
    Always,
    Hosts(Vec<String>),
    Never,
}

impl Criteria {
    fn matches(&self, host: &str) -> bool {
        match self {
            Criteria::Always => true,
            Criteria::Never => false,
            Criteria::Hosts(patterns) => host_matches(patterns, host),
        }
    }
}

#[derive(Debug, Clone)]
struct Directive {
    keyword: String,
    args: Vec<String>,
    /// Unsplit argument text, needed for ProxyCommand.
    raw: String,
    line: usize,
    origin: PathBuf,
}

#[derive(Debug, Clone)]
struct Block {
    criteria: Criteria,
    directives: Vec<Directive>,
}

/// A parsed configuration file (with its includes inlined).
#[derive(Debug, Clone, Default)]
pub struct SshConfig {
    blocks: Vec<Block>,
}

/// Values resolved for one host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HostSettings {
    pub hostname: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub bind_address: Option<String>,
    pub known_hosts: Option<String>,
    pub connect_timeout: Option<i64>,
    pub protocol: Option<Vec<i64>>,
    pub key_exchange: Option<Vec<String>>,
    pub host_keys: Option<Vec<String>>,
    pub compression: Option<bool>,
    pub strict_host_key_check: Option<bool>,
    pub proxy_command: Option<String>,
    pub gssapi_server_identity: Option<String>,
    pub gssapi_client_identity: Option<String>,
    pub gssapi_delegate_credentials: Option<bool>,
    pub identity_files: Vec<String>,
    pub log_level: Option<LogVerbosity>,
}

impl SshConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = SshConfig::default();
        config.read_file(path, Criteria::Always, 0)?;
        Ok(config)
    }

    pub fn parse_str(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        let mut config = SshConfig::default();
        config.parse_into(content, origin, Criteria::Always, 0)?;
        Ok(config)
    }

    fn read_file(&mut self, path: &Path, outer: Criteria, depth: usize) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        self.parse_into(&content, path, outer, depth)
    }

    fn parse_into(
        &mut self,
        content: &str,
        origin: &Path,
        outer: Criteria,
        depth: usize,
    ) -> Result<(), ConfigError> {
        if depth > MAX_INCLUDE_DEPTH {
            return Err(ConfigError::IncludeDepth(MAX_INCLUDE_DEPTH));
        }

        let parse_err = |line: usize, message: String| ConfigError::Parse {
            path: origin.to_path_buf(),
            line,
            message,
        };

        let mut current = Block {
            criteria: outer.clone(),
            directives: Vec::new(),
        };

        for (idx, raw_line) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (keyword, rest) = split_keyword(line);
            let keyword = keyword.to_ascii_lowercase();
            let args = tokenize(rest).map_err(|m| parse_err(line_no, m))?;

            match keyword.as_str() {
                "host" => {
                    if args.is_empty() {
                        return Err(parse_err(line_no, "Host needs at least one pattern".into()));
                    }
                    self.push_block(current);
                    current = Block {
                        criteria: nest(&outer, Criteria::Hosts(args)),
                        directives: Vec::new(),
                    };
                }
                "match" => {
                    let criteria = if args.len() == 1 && args[0].eq_ignore_ascii_case("all") {
                        Criteria::Always
                    } else {
                        debug!(
                            "{}:{}: unsupported Match criteria '{}', block skipped",
                            origin.display(),
                            line_no,
                            rest
                        );
                        Criteria::Never
                    };
                    self.push_block(current);
                    current = Block {
                        criteria: nest(&outer, criteria),
                        directives: Vec::new(),
                    };
                }
                "include" => {
                    if args.is_empty() {
                        return Err(parse_err(line_no, "Include needs a path".into()));
                    }
                    // keep ordering: everything before the Include comes first
                    let criteria = current.criteria.clone();
                    self.push_block(Block {
                        criteria: criteria.clone(),
                        directives: std::mem::take(&mut current.directives),
                    });
                    for pattern in &args {
                        self.include(pattern, criteria.clone(), depth)?;
                    }
                }
                _ => {
                    if args.is_empty() {
                        return Err(parse_err(line_no, format!("{} needs a value", keyword)));
                    }
                    current.directives.push(Directive {
                        keyword,
                        args,
                        raw: rest.trim().to_string(),
                        line: line_no,
                        origin: origin.to_path_buf(),
                    });
                }
            }
        }

        self.push_block(current);
        Ok(())
    }

    fn push_block(&mut self, block: Block) {
        if !block.directives.is_empty() {
            self.blocks.push(block);
        }
    }

    fn include(&mut self, pattern: &str, criteria: Criteria, depth: usize) -> Result<(), ConfigError> {
        let resolved = paths::resolve_in_ssh_dir(pattern);
        let resolved = resolved.to_string_lossy();
        let entries = match glob::glob(&resolved) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("ignoring Include '{}': {}", pattern, e);
                return Ok(());
            }
        };
        let mut files: Vec<PathBuf> = entries.filter_map(Result::ok).collect();
        files.sort();
        for file in files {
            if file.is_file() {
                self.read_file(&file, criteria.clone(), depth + 1)?;
            }
        }
        Ok(())
    }

    /// Resolve the settings that apply to `host`.
    pub fn settings_for(&self, host: &str) -> HostSettings {
        let mut settings = HostSettings::default();
        for block in self.blocks.iter().filter(|b| b.criteria.matches(host)) {
            for directive in &block.directives {
                settings.absorb(directive, host);
            }
        }
        settings
    }
}

/// A block nested under an `Include` only applies where the outer one does.
fn nest(outer: &Criteria, inner: Criteria) -> Criteria {
    match (outer, inner) {
        (Criteria::Always, inner) => inner,
        (Criteria::Never, _) | (_, Criteria::Never) => Criteria::Never,
        (outer, Criteria::Always) => outer.clone(),
        // Host inside an included file under a Host block: the inner one wins,
        // matching what ssh(1) does for Include inside Host.
        (_, inner) => inner,
    }
}

fn split_keyword(line: &str) -> (&str, &str) {
    let end = line
        .find(|c: char| c.is_whitespace() || c == '=')
        .unwrap_or(line.len());
    let (keyword, rest) = line.split_at(end);
    let rest = rest.trim_start();
    let rest = rest.strip_prefix('=').unwrap_or(rest);
    (keyword, rest.trim_start())
}

fn tokenize(input: &str) -> Result<Vec<String>, String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in input.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if in_quotes {
        return Err("unterminated quote".to_string());
    }
    if has_token {
        args.push(current);
    }
    Ok(args)
}

fn host_matches(patterns: &[String], host: &str) -> bool {
    let opts = glob::MatchOptions {
        case_sensitive: false,
        require_literal_separator: false,
        require_literal_leading_dot: false,
    };
    let mut matched = false;
    for pattern in patterns {
        let (negated, pattern) = match pattern.strip_prefix('!') {
            Some(p) => (true, p),
            None => (false, pattern.as_str()),
        };
        // only * and ? are wildcards in ssh_config
        let escaped = pattern.replace('[', "[[]").replace(']', "[]]");
        let hit = glob::Pattern::new(&escaped)
            .map(|p| p.matches_with(host, opts))
            .unwrap_or(false);
        if hit && negated {
            return false;
        }
        matched |= hit;
    }
    matched
}

fn parse_yes_no(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "ask" => Some(true),
        "no" | "false" | "off" | "accept-new" => Some(false),
        _ => None,
    }
}

/// Algorithm lists may carry a `+`, `-` or `^` modifier we cannot honour.
fn algorithm_list(value: &str) -> Vec<String> {
    value
        .trim_start_matches(['+', '-', '^'])
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

impl HostSettings {
    fn absorb(&mut self, d: &Directive, host: &str) {
        let first = d.args[0].as_str();
        let invalid = |what: &str| {
            warn!(
                "{}:{}: invalid {} '{}', ignored",
                d.origin.display(),
                d.line,
                what,
                d.raw
            )
        };

        match d.keyword.as_str() {
            "hostname" => {
                if self.hostname.is_none() {
                    self.hostname = Some(first.replace("%h", host));
                }
            }
            "user" => set_once(&mut self.user, first.to_string()),
            "port" => match first.parse::<u16>() {
                Ok(port) if port > 0 => set_once(&mut self.port, port),
                _ => invalid("port"),
            },
            "bindaddress" => set_once(&mut self.bind_address, first.to_string()),
            "userknownhostsfile" => set_once(&mut self.known_hosts, first.to_string()),
            "connecttimeout" => match first.parse::<i64>() {
                Ok(secs) if secs >= 0 => set_once(&mut self.connect_timeout, secs),
                _ => invalid("timeout"),
            },
            "protocol" => {
                let versions: Result<Vec<i64>, _> =
                    first.split(',').map(|v| v.trim().parse::<i64>()).collect();
                match versions {
                    Ok(v) => set_once(&mut self.protocol, v),
                    Err(_) => invalid("protocol"),
                }
            }
            "kexalgorithms" => set_once(&mut self.key_exchange, algorithm_list(first)),
            "hostkeyalgorithms" => set_once(&mut self.host_keys, algorithm_list(first)),
            "compression" => match parse_yes_no(first) {
                Some(on) => set_once(&mut self.compression, on),
                None => invalid("compression"),
            },
            "stricthostkeychecking" => match parse_yes_no(first) {
                Some(on) => set_once(&mut self.strict_host_key_check, on),
                None => invalid("StrictHostKeyChecking"),
            },
            "proxycommand" => set_once(&mut self.proxy_command, d.raw.clone()),
            "gssapiserveridentity" => set_once(&mut self.gssapi_server_identity, first.to_string()),
            "gssapiclientidentity" => set_once(&mut self.gssapi_client_identity, first.to_string()),
            "gssapidelegatecredentials" => match parse_yes_no(first) {
                Some(on) => set_once(&mut self.gssapi_delegate_credentials, on),
                None => invalid("GSSAPIDelegateCredentials"),
            },
            "identityfile" => {
                if !self.identity_files.iter().any(|f| f == first) {
                    self.identity_files.push(first.to_string());
                }
            }
            "loglevel" => match LogVerbosity::from_openssh(first) {
                Some(level) => set_once(&mut self.log_level, level),
                None => invalid("LogLevel"),
            },
            other => debug!("{}:{}: ignoring '{}'", d.origin.display(), d.line, other),
        }
    }

    /// Fill every option the caller has not set explicitly.
    ///
    /// `Hostname` always replaces the host, since the configured name is an alias.
    pub fn apply_to(&self, options: &mut SessionOptions) {
        if let Some(hostname) = &self.hostname {
            options.host = Some(hostname.clone());
        }
        fill(&mut options.user, &self.user);
        fill(&mut options.port, &self.port);
        fill(&mut options.bind_address, &self.bind_address);
        fill(&mut options.known_hosts, &self.known_hosts);
        fill(&mut options.timeout_secs, &self.connect_timeout);
        fill(&mut options.strict_host_key_check, &self.strict_host_key_check);
        fill(&mut options.gssapi_server_identity, &self.gssapi_server_identity);
        fill(&mut options.gssapi_client_identity, &self.gssapi_client_identity);
        fill(
            &mut options.gssapi_delegate_credentials,
            &self.gssapi_delegate_credentials,
        );
        if options.proxy_command.is_none() {
            if let Some(cmd) = &self.proxy_command {
                if !cmd.eq_ignore_ascii_case("none") {
                    options.proxy_command = Some(cmd.clone());
                }
            }
        }
        if options.compression.is_none() {
            options.compression = self.compression.map(Compression::Enabled);
        }
        if options.ssh2 && !options.ssh1 {
            if let Some(versions) = &self.protocol {
                apply_or_warn(options, SessionOption::Protocol(versions.clone()));
            }
        }
        if options.key_exchange.is_none() {
            if let Some(list) = &self.key_exchange {
                apply_or_warn(options, SessionOption::KeyExchange(list.clone()));
            }
        }
        if options.host_keys.is_none() {
            if let Some(list) = &self.host_keys {
                apply_or_warn(options, SessionOption::HostKeys(list.clone()));
            }
        }
        if options.log_verbosity == LogVerbosity::None {
            if let Some(level) = self.log_level {
                options.log_verbosity = level;
            }
        }
        for identity in &self.identity_files {
            if !options.identities.contains(identity) {
                options.identities.push(identity.clone());
            }
        }
    }
}

fn set_once<T>(slot: &mut Option<T>, value: T) {
    if slot.is_none() {
        *slot = Some(value);
    }
}

fn fill<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
    if slot.is_none() {
        slot.clone_from(value);
    }
}

fn apply_or_warn(options: &mut SessionOptions, option: SessionOption) {
    let name = option.name();
    if let Err(e) = options.apply(option) {
        warn!("config value for {} rejected: {}", name, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn parse(content: &str) -> SshConfig {
        SshConfig::parse_str(content, Path::new("test_config")).unwrap()
    }

    #[test]
    fn first_value_wins_across_blocks() {
        let cfg = parse(
            "Host build*\n  User deploy\n  Port 2222\n\nHost *\n  User nobody\n  Port 22\n  Compression yes\n",
        );
        let s = cfg.settings_for("build01");
        assert_eq!(s.user.as_deref(), Some("deploy"));
        assert_eq!(s.port, Some(2222));
        assert_eq!(s.compression, Some(true));

        let other = cfg.settings_for("web01");
        assert_eq!(other.user.as_deref(), Some("nobody"));
        assert_eq!(other.port, Some(22));
    }

    #[test]
    fn negated_pattern_excludes_host() {
        let cfg = parse("Host *.internal !bastion.internal\n  ProxyCommand ssh -W %h:%p bastion\n");
        assert!(cfg.settings_for("db.internal").proxy_command.is_some());
        assert!(cfg.settings_for("bastion.internal").proxy_command.is_none());
    }

    #[test]
    fn equals_syntax_and_quotes() {
        let cfg = parse("Host=alias\n  HostName=\"real.example.com\"\n  IdentityFile \"~/keys/my key\"\n");
        let s = cfg.settings_for("alias");
        assert_eq!(s.hostname.as_deref(), Some("real.example.com"));
        assert_eq!(s.identity_files, vec!["~/keys/my key".to_string()]);
    }

    #[test]
    fn identity_files_accumulate() {
        let cfg = parse("Host *\n IdentityFile %d/id_a\n IdentityFile %d/id_b\nHost x\n IdentityFile %d/id_a\n");
        assert_eq!(cfg.settings_for("x").identity_files, vec!["%d/id_a", "%d/id_b"]);
    }

    #[test]
    fn hostname_expands_alias() {
        let cfg = parse("Host web\n  HostName %h.example.com\n");
        assert_eq!(cfg.settings_for("web").hostname.as_deref(), Some("web.example.com"));
    }

    #[test]
    fn match_all_applies_other_match_skipped() {
        let cfg = parse("Match exec \"true\"\n  User skipped\nMatch all\n  User everyone\n");
        assert_eq!(cfg.settings_for("anything").user.as_deref(), Some("everyone"));
    }

    #[test]
    fn unterminated_quote_is_parse_error() {
        let err = SshConfig::parse_str("Host \"broken\n", Path::new("cfg")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { line: 1, .. }));
    }

    #[test]
    fn bad_port_is_ignored() {
        let cfg = parse("Host *\n  Port seventy\n");
        assert_eq!(cfg.settings_for("a").port, None);
    }

    #[test]
    fn include_reads_globbed_files() {
        let dir = TempDir::new().unwrap();
        let sub = dir.path().join("conf.d");
        fs::create_dir(&sub).unwrap();
        fs::write(sub.join("10-work"), "Host work\n  User worker\n").unwrap();
        fs::write(sub.join("20-home"), "Host home\n  User homer\n").unwrap();
        let main = dir.path().join("config");
        fs::write(
            &main,
            format!("Include {}/*\nHost *\n  User fallback\n", sub.display()),
        )
        .unwrap();

        let cfg = SshConfig::load(&main).unwrap();
        assert_eq!(cfg.settings_for("work").user.as_deref(), Some("worker"));
        assert_eq!(cfg.settings_for("home").user.as_deref(), Some("homer"));
        assert_eq!(cfg.settings_for("else").user.as_deref(), Some("fallback"));
    }

    #[test]
    fn self_include_hits_depth_limit() {
        let dir = TempDir::new().unwrap();
        let main = dir.path().join("config");
        fs::write(&main, format!("Include {}\nUser x\n", main.display())).unwrap();
        assert!(matches!(
            SshConfig::load(&main),
            Err(ConfigError::IncludeDepth(_))
        ));
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            SshConfig::load(&dir.path().join("nope")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn apply_fills_only_unset_options() {
        let cfg = parse(
            "Host build\n  HostName build.example.com\n  User deploy\n  Port 2222\n  ConnectTimeout 7\n  IdentityFile %d/build_key\n  LogLevel DEBUG\n",
        );
        let mut opts = SessionOptions::default();
        opts.apply(SessionOption::Host("build".into())).unwrap();
        opts.apply(SessionOption::Port(2200)).unwrap();
        opts.apply(SessionOption::AddIdentity("%d/id_ed25519".into()))
            .unwrap();

        cfg.settings_for("build").apply_to(&mut opts);

        assert_eq!(opts.host.as_deref(), Some("build.example.com"));
        assert_eq!(opts.user.as_deref(), Some("deploy"));
        assert_eq!(opts.port, Some(2200));
        assert_eq!(opts.timeout_secs, Some(7));
        assert_eq!(opts.identities, vec!["%d/id_ed25519", "%d/build_key"]);
        assert_eq!(opts.log_verbosity, LogVerbosity::Debug);
    }

    #[test]
    fn rejected_kex_from_config_is_skipped() {
        let cfg = parse("Host *\n  KexAlgorithms +not-a-real-kex\n");
        let mut opts = SessionOptions::default();
        opts.host = Some("h".into());
        cfg.settings_for("h").apply_to(&mut opts);
        assert_eq!(opts.key_exchange, None);
    }
}
