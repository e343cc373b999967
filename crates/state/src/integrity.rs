//! Integrity tokens: `<algo>-<hex>` strings over content bytes.
//!
//! `sha256-…` is the universal form. `sha1-…` is accepted for
//! compatibility with the upstream package registry, which still
//! publishes sha1 shasums.

use sha1::Sha1;
use sha2::{Digest, Sha256};

use caprun_domain::error::{Error, ErrorKind, Result};

/// Parsed integrity token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityToken {
    pub algo: IntegrityAlgo,
    /// Lowercase hex digest.
    pub digest: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityAlgo {
    Sha256,
    Sha1,
}

impl IntegrityToken {
    /// Parse `sha256-<hex>` or `sha1-<hex>`.
    pub fn parse(raw: &str) -> Result<Self> {
        let (algo, digest) = raw.split_once('-').ok_or_else(|| invalid(raw))?;
        let algo = match algo {
            "sha256" => IntegrityAlgo::Sha256,
            "sha1" => IntegrityAlgo::Sha1,
            _ => return Err(invalid(raw)),
        };
        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(invalid(raw));
        }
        Ok(Self {
            algo,
            digest: digest.to_lowercase(),
        })
    }

    /// Whether `data` hashes to this token's digest.
    pub fn matches(&self, data: &[u8]) -> bool {
        let computed = match self.algo {
            IntegrityAlgo::Sha256 => hex::encode(Sha256::digest(data)),
            IntegrityAlgo::Sha1 => hex::encode(Sha1::digest(data)),
        };
        computed == self.digest
    }
}

impl std::fmt::Display for IntegrityToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let algo = match self.algo {
            IntegrityAlgo::Sha256 => "sha256",
            IntegrityAlgo::Sha1 => "sha1",
        };
        write!(f, "{algo}-{}", self.digest)
    }
}

fn invalid(raw: &str) -> Error {
    Error::new(
        ErrorKind::DependencyIntegrityFailed,
        format!("malformed integrity token: {raw:?}"),
    )
    .with("integrity", raw)
}

/// Compute the canonical `sha256-<hex>` token over content bytes.
pub fn sha256_token(data: &[u8]) -> String {
    format!("sha256-{}", hex::encode(Sha256::digest(data)))
}

/// Short display prefix of a token, for approval prompts and logs.
/// Keeps the algo tag and the first 8 digest characters.
pub fn short_hash(token: &str) -> String {
    match token.split_once('-') {
        Some((algo, digest)) => {
            let prefix: String = digest.chars().take(8).collect();
            format!("{algo}-{prefix}")
        }
        None => token.chars().take(8).collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_sha256() {
        let token = IntegrityToken::parse("sha256-ABC123").unwrap();
        assert_eq!(token.algo, IntegrityAlgo::Sha256);
        assert_eq!(token.digest, "abc123");
    }

    #[test]
    fn parse_sha1_legacy() {
        let token = IntegrityToken::parse("sha1-deadbeef").unwrap();
        assert_eq!(token.algo, IntegrityAlgo::Sha1);
    }

    #[test]
    fn rejects_unknown_algo_and_garbage() {
        for raw in ["md5-abc", "sha256-", "sha256-zzzz", "nodash", ""] {
            let err = IntegrityToken::parse(raw).unwrap_err();
            assert_eq!(err.kind, ErrorKind::DependencyIntegrityFailed, "raw {raw:?}");
        }
    }

    #[test]
    fn sha256_round_trip() {
        let token_str = sha256_token(b"hello world");
        let token = IntegrityToken::parse(&token_str).unwrap();
        assert!(token.matches(b"hello world"));
        assert!(!token.matches(b"hello worlds"));
    }

    #[test]
    fn sha1_matches_known_digest() {
        // sha1("abc") = a9993e364706816aba3e25717850c26c9cd0d89d
        let token = IntegrityToken::parse("sha1-a9993e364706816aba3e25717850c26c9cd0d89d").unwrap();
        assert!(token.matches(b"abc"));
        assert!(!token.matches(b"abcd"));
    }

    #[test]
    fn short_hash_keeps_algo_tag() {
        assert_eq!(short_hash("sha256-0123456789abcdef"), "sha256-01234567");
        assert_eq!(short_hash("sha256-oldHash"), "sha256-oldHash");
    }
}
