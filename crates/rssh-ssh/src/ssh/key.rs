//! Public key wrapper with OpenSSH-style fingerprints.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use ssh2::HostKeyType;

/// Key algorithm family. Discriminants are stable numeric codes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum KeyType {
    Unknown = 0,
    Dss = 1,
    Rsa = 2,
    Rsa1 = 3,
    Ecdsa = 4,
    Ed25519 = 5,
}

impl KeyType {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    /// Short type name, `None` for unknown keys.
    pub fn type_str(&self) -> Option<&'static str> {
        match self {
            KeyType::Unknown => None,
            KeyType::Dss => Some("ssh-dss"),
            KeyType::Rsa => Some("ssh-rsa"),
            KeyType::Rsa1 => Some("ssh-rsa1"),
            KeyType::Ecdsa => Some("ssh-ecdsa"),
            KeyType::Ed25519 => Some("ssh-ed25519"),
        }
    }

    /// Classify from the algorithm name embedded in a key blob.
    pub fn from_algorithm(name: &str) -> Self {
        match name {
            "ssh-rsa" => KeyType::Rsa,
            "ssh-dss" => KeyType::Dss,
            "ssh-ed25519" => KeyType::Ed25519,
            n if n.starts_with("ecdsa-sha2-") => KeyType::Ecdsa,
            _ => KeyType::Unknown,
        }
    }
}

impl From<HostKeyType> for KeyType {
    fn from(kind: HostKeyType) -> Self {
        match kind {
            HostKeyType::Rsa => KeyType::Rsa,
            HostKeyType::Dss => KeyType::Dss,
            HostKeyType::Ecdsa256 | HostKeyType::Ecdsa384 | HostKeyType::Ecdsa521 => {
                KeyType::Ecdsa
            }
            HostKeyType::Ed25519 => KeyType::Ed25519,
            _ => KeyType::Unknown,
        }
    }
}

/// An SSH key in wire (blob) form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Key {
    kind: KeyType,
    blob: Vec<u8>,
    public: bool,
    private: bool,
}

impl Key {
    /// Wrap a public key blob as received from a server.
    pub fn from_public_blob(blob: &[u8]) -> Self {
        let kind = read_algorithm(blob)
            .map(KeyType::from_algorithm)
            .unwrap_or(KeyType::Unknown);
        Self {
            kind,
            blob: blob.to_vec(),
            public: true,
            private: false,
        }
    }

    pub(crate) fn from_host_key(blob: &[u8], kind: HostKeyType) -> Self {
        let mut key = Self::from_public_blob(blob);
        if key.kind == KeyType::Unknown {
            key.kind = KeyType::from(kind);
        }
        key
    }

    pub fn key_type(&self) -> KeyType {
        self.kind
    }

    pub fn type_str(&self) -> Option<&'static str> {
        self.kind.type_str()
    }

    /// Algorithm name carried in the blob, e.g. `ecdsa-sha2-nistp256`.
    pub fn algorithm(&self) -> Option<&str> {
        read_algorithm(&self.blob)
    }

    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    pub fn is_public(&self) -> bool {
        self.public
    }

    pub fn is_private(&self) -> bool {
        self.private
    }

    /// SHA-1 of the key blob, raw bytes.
    pub fn sha1(&self) -> [u8; 20] {
        Sha1::digest(&self.blob).into()
    }

    /// SHA-1 as colon-separated lowercase hex (`ab:cd:...`).
    pub fn sha1_hex(&self) -> String {
        let hex = hex::encode(self.sha1());
        hex.as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).into_owned())
            .collect::<Vec<_>>()
            .join(":")
    }

    /// `SHA256:<base64>` as printed by ssh-keygen -l.
    pub fn sha256_fingerprint(&self) -> String {
        let digest = Sha256::digest(&self.blob);
        format!("SHA256:{}", STANDARD_NO_PAD.encode(digest))
    }

    /// Base64 of the blob, the middle column of a known_hosts line.
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.blob)
    }
}

/// Read the length-prefixed algorithm name at the start of a key blob.
fn read_algorithm(blob: &[u8]) -> Option<&str> {
    let len_bytes: [u8; 4] = blob.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let name = blob.get(4..4 + len)?;
    std::str::from_utf8(name).ok()
}
