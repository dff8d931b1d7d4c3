use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::errors::{Error, Result};

// https://github.com/opencontainers/image-spec/blob/main/descriptor.md#digests
//
// Only sha256 is registered here; anything else is rejected at the parsing
// boundary so the rest of the crate can assume a single algorithm.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct OciDigest {
    encoded: String,
}

impl TryFrom<&str> for OciDigest {
    type Error = Error;

    fn try_from(s: &str) -> Result<Self> {
        let i = match s.find(':') {
            Some(i) => i,
            None => return Err(Error::InvalidDigest(s.to_string())),
        };
        let algo: &str = match s.get(..i) {
            Some(a) => a,
            None => return Err(Error::InvalidDigest(s.to_string())),
        };
        let encoded: &str = match s.get(i + 1..) {
            Some(e) if !e.is_empty() => e,
            _ => return Err(Error::InvalidDigest(s.to_string())),
        };
        if algo != "sha256" {
            return Err(Error::InvalidDigest(s.to_string()));
        }
        if encoded.len() != 64 || !encoded.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(Error::InvalidDigest(s.to_string()));
        }

        Ok(Self {
            encoded: encoded.to_ascii_lowercase(),
        })
    }
}

impl std::fmt::Display for OciDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", self.encoded)
    }
}

impl From<&OciDigest> for String {
    fn from(d: &OciDigest) -> String {
        format!("{d}")
    }
}

impl From<OciDigest> for String {
    fn from(d: OciDigest) -> String {
        String::from(&d)
    }
}

impl OciDigest {
    /// Digest of a byte slice already held in memory.
    pub fn from_content(bs: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bs);
        Self {
            encoded: format!("{:x}", hasher.finalize()),
        }
    }

    pub fn digester() -> Digester {
        Digester::default()
    }
}

/// Incremental SHA-256 over streamed bytes, tracking how many bytes have
/// been seen so callers can report sizes without a second pass.
#[derive(Default)]
pub struct Digester {
    hasher: Sha256,
    bytes: u64,
}

impl Digester {
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.bytes += data.len() as u64;
    }

    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn finalize(self) -> OciDigest {
        OciDigest {
            encoded: format!("{:x}", self.hasher.finalize()),
        }
    }
}

static DIGEST_FIELD_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""digest"\s*:\s*"([^"]+)""#).unwrap());

/// Scan an opaque manifest document for `"digest": "..."` fields.
///
/// Manifests are deliberately not parsed as JSON here; the field scan is
/// tolerant of schema variation across manifest versions. Only
/// `sha256:`-prefixed values are kept. Duplicates are dropped, first
/// occurrence wins.
pub fn referenced_digests(bytes: &[u8]) -> Vec<String> {
    let text = String::from_utf8_lossy(bytes);
    let mut seen = std::collections::HashSet::new();
    let mut digests = Vec::new();
    for caps in DIGEST_FIELD_RE.captures_iter(&text) {
        let value = &caps[1];
        if value.starts_with("sha256:") && seen.insert(value.to_string()) {
            digests.push(value.to_string());
        }
    }
    digests
}
