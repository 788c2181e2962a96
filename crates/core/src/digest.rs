//! Content digests in `<algorithm>:<hex>` form.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;

/// Hash algorithm of a content digest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Sha256,
    Sha384,
    Sha512,
}

impl Algorithm {
    /// Canonical algorithm name as used in digest strings.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha256 => "sha256",
            Self::Sha384 => "sha384",
            Self::Sha512 => "sha512",
        }
    }

    /// Length of the hex-encoded hash for this algorithm.
    pub fn hex_len(self) -> usize {
        match self {
            Self::Sha256 => 64,
            Self::Sha384 => 96,
            Self::Sha512 => 128,
        }
    }

    fn parse(name: &str) -> crate::Result<Self> {
        match name {
            "sha256" => Ok(Self::Sha256),
            "sha384" => Ok(Self::Sha384),
            "sha512" => Ok(Self::Sha512),
            other => Err(crate::Error::InvalidDigest(format!(
                "unsupported algorithm: {other}"
            ))),
        }
    }
}

/// A validated content digest such as `sha256:9f86d0...`.
///
/// Digests are the identity of every blob in the cache: the same content
/// always produces the same digest and therefore the same object key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Digest(String);

impl Digest {
    /// Parse and validate a digest string.
    pub fn parse(s: &str) -> crate::Result<Self> {
        let (algorithm, encoded) = s
            .split_once(':')
            .ok_or_else(|| crate::Error::InvalidDigest(format!("missing algorithm: {s}")))?;
        let algorithm = Algorithm::parse(algorithm)?;
        if encoded.len() != algorithm.hex_len() {
            return Err(crate::Error::InvalidDigest(format!(
                "expected {} hex chars for {}, got {}",
                algorithm.hex_len(),
                algorithm.as_str(),
                encoded.len()
            )));
        }
        if !encoded
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        {
            return Err(crate::Error::InvalidDigest(format!(
                "digest must be lowercase hex: {s}"
            )));
        }
        Ok(Self(s.to_string()))
    }

    /// Compute the SHA-256 digest of data.
    pub fn sha256(data: &[u8]) -> Self {
        Self(format!("sha256:{}", to_hex(&Sha256::digest(data))))
    }

    /// Compute a digest of data with the given algorithm.
    pub fn compute(algorithm: Algorithm, data: &[u8]) -> Self {
        let encoded = match algorithm {
            Algorithm::Sha256 => to_hex(&Sha256::digest(data)),
            Algorithm::Sha384 => to_hex(&Sha384::digest(data)),
            Algorithm::Sha512 => to_hex(&Sha512::digest(data)),
        };
        Self(format!("{}:{}", algorithm.as_str(), encoded))
    }

    /// The digest algorithm.
    pub fn algorithm(&self) -> Algorithm {
        // Validated on construction.
        match self.0.split_once(':').map(|(a, _)| a) {
            Some("sha384") => Algorithm::Sha384,
            Some("sha512") => Algorithm::Sha512,
            _ => Algorithm::Sha256,
        }
    }

    /// The hex-encoded hash without the algorithm prefix.
    pub fn encoded(&self) -> &str {
        self.0.split_once(':').map(|(_, e)| e).unwrap_or_default()
    }

    /// The full `<algorithm>:<hex>` string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

impl FromStr for Digest {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Digest {
    type Error = crate::Error;

    fn try_from(value: String) -> crate::Result<Self> {
        Self::parse(&value)
    }
}

impl From<Digest> for String {
    fn from(digest: Digest) -> Self {
        digest.0
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let encoded = self.encoded();
        write!(
            f,
            "Digest({}:{})",
            self.algorithm().as_str(),
            &encoded[..encoded.len().min(16)]
        )
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
