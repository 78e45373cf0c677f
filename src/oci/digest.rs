//! Content digests and incremental verification

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha512};
use std::fmt;
use std::str::FromStr;

/// Hash algorithm of a content digest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Algorithm {
    Sha256,
    Sha512,
}

impl Algorithm {
    /// Name as it appears in a digest string
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Sha256 => "sha256",
            Algorithm::Sha512 => "sha512",
        }
    }

    /// Length of the hex-encoded hash
    fn hex_len(&self) -> usize {
        match self {
            Algorithm::Sha256 => 64,
            Algorithm::Sha512 => 128,
        }
    }
}

/// An immutable, algorithm-tagged content digest (e.g. `sha256:<64 hex>`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest {
    algorithm: Algorithm,
    encoded: String,
}

impl Digest {
    /// Compute the sha256 digest of `data`
    pub fn sha256_of(data: &[u8]) -> Self {
        Self {
            algorithm: Algorithm::Sha256,
            encoded: hex::encode(Sha256::digest(data)),
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Hex-encoded hash without the algorithm prefix
    pub fn encoded(&self) -> &str {
        &self.encoded
    }

    /// Start an incremental verification against this digest
    pub fn verifier(&self) -> DigestVerifier {
        let hasher = match self.algorithm {
            Algorithm::Sha256 => Hasher::Sha256(Sha256::new()),
            Algorithm::Sha512 => Hasher::Sha512(Sha512::new()),
        };
        DigestVerifier {
            expected: self.clone(),
            hasher,
            bytes: 0,
        }
    }

    /// Verify that `data` hashes to this digest
    pub fn verify(&self, data: &[u8]) -> Result<()> {
        let mut verifier = self.verifier();
        verifier.update(data);
        verifier.finish()
    }
}

impl FromStr for Digest {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (algorithm, encoded) = s
            .split_once(':')
            .ok_or_else(|| Error::InvalidDigest(s.to_owned()))?;

        let algorithm = match algorithm {
            "sha256" => Algorithm::Sha256,
            "sha512" => Algorithm::Sha512,
            _ => return Err(Error::InvalidDigest(format!("unsupported algorithm in {s}"))),
        };

        if encoded.len() != algorithm.hex_len()
            || !encoded
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(Error::InvalidDigest(s.to_owned()));
        }

        Ok(Self {
            algorithm,
            encoded: encoded.to_owned(),
        })
    }
}

impl TryFrom<String> for Digest {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.to_string()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.encoded)
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

/// Incremental hasher that checks streamed bytes against an expected digest
pub struct DigestVerifier {
    expected: Digest,
    hasher: Hasher,
    bytes: u64,
}

impl DigestVerifier {
    pub fn update(&mut self, data: &[u8]) {
        self.bytes += data.len() as u64;
        match &mut self.hasher {
            Hasher::Sha256(h) => h.update(data),
            Hasher::Sha512(h) => h.update(data),
        }
    }

    /// Number of bytes hashed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Finish hashing and compare with the expected digest
    pub fn finish(self) -> Result<()> {
        let encoded = match self.hasher {
            Hasher::Sha256(h) => hex::encode(h.finalize()),
            Hasher::Sha512(h) => hex::encode(h.finalize()),
        };

        if encoded == self.expected.encoded {
            Ok(())
        } else {
            Err(Error::DigestMismatch {
                expected: self.expected.to_string(),
                actual: format!("{}:{}", self.expected.algorithm.as_str(), encoded),
            })
        }
    }
}
