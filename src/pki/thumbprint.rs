use ring::digest;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::{PkiError, Result};

/// Digest used to fingerprint an encoded certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThumbprintAlgorithm {
    /// 20-byte digest shown by most hosting platforms and proxies
    Sha1,
    #[default]
    Sha256,
}

impl ThumbprintAlgorithm {
    fn digest_algorithm(self) -> &'static digest::Algorithm {
        match self {
            Self::Sha1 => &digest::SHA1_FOR_LEGACY_USE_ONLY,
            Self::Sha256 => &digest::SHA256,
        }
    }

    /// Digest length in bytes
    pub fn output_len(self) -> usize {
        self.digest_algorithm().output_len()
    }
}

impl fmt::Display for ThumbprintAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha1 => f.write_str("sha1"),
            Self::Sha256 => f.write_str("sha256"),
        }
    }
}

/// Fixed-length digest over a DER certificate, used as its identity
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Thumbprint {
    algorithm: ThumbprintAlgorithm,
    bytes: Vec<u8>,
}

impl Thumbprint {
    /// Digest the encoded certificate bytes
    pub fn compute(algorithm: ThumbprintAlgorithm, certificate_der: &[u8]) -> Self {
        let digest = digest::digest(algorithm.digest_algorithm(), certificate_der);
        Self {
            algorithm,
            bytes: digest.as_ref().to_vec(),
        }
    }

    /// Parse a hex thumbprint. Case is ignored, as are `:` and whitespace separators.
    pub fn parse(algorithm: ThumbprintAlgorithm, text: &str) -> Result<Self> {
        let compact: String = text
            .chars()
            .filter(|c| *c != ':' && !c.is_whitespace())
            .collect();

        let bytes = hex::decode(&compact)
            .map_err(|e| PkiError::InvalidThumbprint(format!("{:?}: {}", text, e)))?;

        if bytes.len() != algorithm.output_len() {
            return Err(PkiError::InvalidThumbprint(format!(
                "expected {} bytes for {}, got {}",
                algorithm.output_len(),
                algorithm,
                bytes.len()
            )));
        }

        Ok(Self { algorithm, bytes })
    }

    pub fn algorithm(&self) -> ThumbprintAlgorithm {
        self.algorithm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl fmt::Display for Thumbprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode_upper(&self.bytes))
    }
}
