// ── Known hosts: lookup and persistence of server host keys ──────────────────

use crate::ssh::key::Key;
use crate::ssh::status::transport_error;
use crate::ssh::types::{KnownHostStatus, DEFAULT_SSH_PORT};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use log::debug;
use rssh_core::{SshError, SshErrorKind, SshResult};
use sha1::Sha1;
use ssh2::{CheckResult, KnownHostFileKind};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

/// Host column for a known_hosts entry: bare host on port 22, `[host]:port` otherwise.
pub fn host_entry_name(host: &str, port: u16) -> String {
    if port == DEFAULT_SSH_PORT {
        host.to_string()
    } else {
        format!("[{}]:{}", host, port)
    }
}

/// Compare the connected server's key with the store at `path`.
pub(crate) fn check(
    ssh: &ssh2::Session,
    path: &Path,
    host: &str,
    port: u16,
) -> SshResult<KnownHostStatus> {
    if !path.exists() {
        return Ok(KnownHostStatus::FileNotFound);
    }
    let (blob, _) = ssh
        .host_key()
        .ok_or_else(|| SshError::connection("server did not present a host key"))?;

    let mut store = ssh
        .known_hosts()
        .map_err(|e| transport_error(SshErrorKind::Connection, "cannot init known hosts", &e))?;
    store
        .read_file(path, KnownHostFileKind::OpenSSH)
        .map_err(|e| {
            transport_error(
                SshErrorKind::Connection,
                &format!("cannot read {}", path.display()),
                &e,
            )
        })?;

    match store.check_port(host, port, blob) {
        CheckResult::Match => Ok(KnownHostStatus::KnownOk),
        // the transport compares against entries of any key type
        CheckResult::Mismatch => {
            let content = fs::read_to_string(path)?;
            let offered = Key::from_public_blob(blob);
            Ok(classify_mismatch(&content, host, port, offered.algorithm()))
        }
        CheckResult::NotFound => {
            let content = fs::read_to_string(path)?;
            if has_entry_for(&content, host, port) {
                Ok(KnownHostStatus::FoundOther)
            } else {
                Ok(KnownHostStatus::NotKnown)
            }
        }
        CheckResult::Failure => Err(SshError::connection(format!(
            "known hosts lookup failed for {}",
            host_entry_name(host, port)
        ))),
    }
}

/// True if any plain or hashed entry in `content` names this host.
pub fn has_entry_for(content: &str, host: &str, port: u16) -> bool {
    !entry_algorithms(content, host, port).is_empty()
}

/// Key algorithms of every plain or hashed entry in `content` naming this host.
pub fn entry_algorithms<'a>(content: &'a str, host: &str, port: u16) -> Vec<&'a str> {
    let name = host_entry_name(host, port);
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && !line.starts_with('@'))
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some((fields.next()?, fields.next()?))
        })
        .filter(|(hosts, _)| {
            if let Some(hashed) = hosts.strip_prefix("|1|") {
                hashed_matches(hashed, &name)
            } else {
                hosts.split(',').any(|h| h.eq_ignore_ascii_case(&name))
            }
        })
        .map(|(_, algorithm)| algorithm)
        .collect()
}

/// The store holds a key for this host that isn't the offered one.
///
/// `KnownChanged` when a stored key has the offered key's algorithm,
/// `FoundOther` when only keys of other types are on record.
pub fn classify_mismatch(
    content: &str,
    host: &str,
    port: u16,
    offered_algorithm: Option<&str>,
) -> KnownHostStatus {
    let Some(offered) = offered_algorithm else {
        return KnownHostStatus::KnownChanged;
    };
    if entry_algorithms(content, host, port).contains(&offered) {
        KnownHostStatus::KnownChanged
    } else {
        KnownHostStatus::FoundOther
    }
}

/// Record the key of a host the store has never seen when strict checking
/// is explicitly off. Any other status is returned unchanged.
pub fn accept_new_host(
    status: KnownHostStatus,
    strict: Option<bool>,
    path: &Path,
    host: &str,
    port: u16,
    key: &Key,
) -> SshResult<KnownHostStatus> {
    let unknown = matches!(status, KnownHostStatus::NotKnown | KnownHostStatus::FileNotFound);
    if !unknown || strict != Some(false) {
        return Ok(status);
    }
    append_entry(path, host, port, key)?;
    debug!(
        "strict host key checking is off, trusting {} on first use",
        host_entry_name(host, port)
    );
    Ok(KnownHostStatus::KnownOk)
}

fn hashed_matches(field: &str, name: &str) -> bool {
    let Some((salt, hash)) = field.split_once('|') else {
        return false;
    };
    let (Ok(salt), Ok(hash)) = (STANDARD.decode(salt), STANDARD.decode(hash)) else {
        return false;
    };
    let Ok(mut mac) = Hmac::<Sha1>::new_from_slice(&salt) else {
        return false;
    };
    mac.update(name.as_bytes());
    mac.verify_slice(&hash).is_ok()
}

/// One known_hosts line (with trailing newline) for `key`.
pub fn format_entry(host: &str, port: u16, key: &Key) -> SshResult<String> {
    let algorithm = key
        .algorithm()
        .ok_or_else(|| SshError::connection("host key has an unknown format"))?;
    Ok(format!(
        "{} {} {}\n",
        host_entry_name(host, port),
        algorithm,
        key.to_base64()
    ))
}

/// Append `key` to the store, creating the file and its directory if needed.
pub fn append_entry(path: &Path, host: &str, port: u16, key: &Key) -> SshResult<()> {
    let line = format_entry(host, port, key)?;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(parent, fs::Permissions::from_mode(0o700))?;
            }
        }
    }

    // keep the file newline-terminated before appending
    let needs_newline = match fs::read(path) {
        Ok(existing) => !existing.is_empty() && !existing.ends_with(b"\n"),
        Err(_) => false,
    };

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    if needs_newline {
        file.write_all(b"\n")?;
    }
    file.write_all(line.as_bytes())?;
    debug!("added {} to {}", host_entry_name(host, port), path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ed25519_key() -> Key {
        let mut blob = 11u32.to_be_bytes().to_vec();
        blob.extend_from_slice(b"ssh-ed25519");
        blob.extend_from_slice(&32u32.to_be_bytes());
        blob.extend_from_slice(&[9u8; 32]);
        Key::from_public_blob(&blob)
    }

    #[test]
    fn entry_name_brackets_non_default_port() {
        assert_eq!(host_entry_name("example.com", 22), "example.com");
        assert_eq!(host_entry_name("example.com", 2222), "[example.com]:2222");
    }

    #[test]
    fn finds_plain_entries() {
        let content = "# comment\nfoo,bar ssh-rsa AAAA\n[baz]:2222 ssh-ed25519 AAAA\n";
        assert!(has_entry_for(content, "bar", 22));
        assert!(has_entry_for(content, "baz", 2222));
        assert!(!has_entry_for(content, "baz", 22));
        assert!(!has_entry_for(content, "qux", 22));
    }

    #[test]
    fn finds_hashed_entries() {
        let salt = b"0123456789abcdefghij";
        let mut mac = Hmac::<Sha1>::new_from_slice(salt).unwrap();
        mac.update(b"hashed.example.com");
        let hash = mac.finalize().into_bytes();
        let content = format!(
            "|1|{}|{} ssh-ed25519 AAAA\n",
            STANDARD.encode(salt),
            STANDARD.encode(hash)
        );
        assert!(has_entry_for(&content, "hashed.example.com", 22));
        assert!(!has_entry_for(&content, "other.example.com", 22));
    }

    fn rsa_line(host: &str) -> String {
        format!("{} ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQ\n", host)
    }

    #[test]
    fn entry_algorithms_lists_key_types_for_host() {
        let content = format!(
            "{}[example.com]:2222 ssh-ed25519 AAAA\nother ecdsa-sha2-nistp256 AAAA\nexample.com ssh-ed25519 AAAA\n",
            rsa_line("example.com")
        );
        assert_eq!(
            entry_algorithms(&content, "example.com", 22),
            vec!["ssh-rsa", "ssh-ed25519"]
        );
        assert_eq!(entry_algorithms(&content, "example.com", 2222), vec!["ssh-ed25519"]);
        assert!(entry_algorithms("example.com\n", "example.com", 22).is_empty());
    }

    #[test]
    fn mismatch_with_only_other_key_types_is_found_other() {
        let content = rsa_line("example.com");
        assert_eq!(
            classify_mismatch(&content, "example.com", 22, Some("ssh-ed25519")),
            KnownHostStatus::FoundOther
        );
    }

    #[test]
    fn mismatch_with_same_key_type_is_known_changed() {
        let content = format!("{}example.com ssh-ed25519 AAAA\n", rsa_line("example.com"));
        assert_eq!(
            classify_mismatch(&content, "example.com", 22, Some("ssh-ed25519")),
            KnownHostStatus::KnownChanged
        );
        assert_eq!(
            classify_mismatch(&content, "example.com", 22, None),
            KnownHostStatus::KnownChanged
        );
    }

    #[test]
    fn lenient_checking_records_unknown_host() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("known_hosts");
        let key = ed25519_key();

        let status =
            accept_new_host(KnownHostStatus::FileNotFound, Some(false), &path, "example.com", 22, &key)
                .unwrap();
        assert_eq!(status, KnownHostStatus::KnownOk);
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(entry_algorithms(&content, "example.com", 22), vec!["ssh-ed25519"]);

        let status =
            accept_new_host(KnownHostStatus::NotKnown, Some(false), &path, "other.com", 2222, &key)
                .unwrap();
        assert_eq!(status, KnownHostStatus::KnownOk);
        assert!(has_entry_for(&fs::read_to_string(&path).unwrap(), "other.com", 2222));
    }

    #[test]
    fn strict_or_unset_checking_leaves_store_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("known_hosts");
        let key = ed25519_key();

        for strict in [None, Some(true)] {
            let status =
                accept_new_host(KnownHostStatus::NotKnown, strict, &path, "example.com", 22, &key)
                    .unwrap();
            assert_eq!(status, KnownHostStatus::NotKnown);
        }
        assert!(!path.exists());

        for status in [KnownHostStatus::KnownChanged, KnownHostStatus::FoundOther] {
            let kept = accept_new_host(status, Some(false), &path, "example.com", 22, &key).unwrap();
            assert_eq!(kept, status);
        }
        assert!(!path.exists());
    }

    #[test]
    fn revoked_marker_lines_are_skipped() {
        assert!(!has_entry_for("@revoked host ssh-rsa AAAA\n", "host", 22));
    }

    #[test]
    fn formats_openssh_line() {
        let key = ed25519_key();
        let line = format_entry("example.com", 2222, &key).unwrap();
        assert!(line.starts_with("[example.com]:2222 ssh-ed25519 AAAAC3NzaC1lZDI1NTE5"));
        assert!(line.ends_with('\n'));
    }

    #[test]
    fn append_creates_directory_and_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/.ssh/known_hosts");
        append_entry(&path, "example.com", 22, &ed25519_key()).unwrap();
        append_entry(&path, "other.com", 22, &ed25519_key()).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(has_entry_for(&content, "example.com", 22));
        assert!(has_entry_for(&content, "other.com", 22));
    }

    #[test]
    fn append_terminates_previous_line() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("known_hosts");
        fs::write(&path, "old ssh-rsa AAAA").unwrap();
        append_entry(&path, "new", 22, &ed25519_key()).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.starts_with("old ssh-rsa AAAA\nnew ssh-ed25519 "));
    }
}
