//! Digest algorithms and precomputed digests.
//!
//! Signers never hash document data themselves. The PDF-writing layer hashes
//! the byte ranges it wants covered and hands the result over as a
//! [`PrehashedDigest`], whose length is checked against its algorithm.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Digest algorithm used for signing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DigestAlgorithm {
    /// SHA-1 (deprecated, but still common in legacy PDFs)
    #[serde(rename = "SHA-1")]
    Sha1,
    /// SHA-256 (recommended)
    #[default]
    #[serde(rename = "SHA-256")]
    Sha256,
    /// SHA-384
    #[serde(rename = "SHA-384")]
    Sha384,
    /// SHA-512
    #[serde(rename = "SHA-512")]
    Sha512,
}

impl DigestAlgorithm {
    /// Get the DER content bytes of this algorithm's OID.
    pub fn oid(&self) -> &'static [u8] {
        match self {
            DigestAlgorithm::Sha1 => &[0x2B, 0x0E, 0x03, 0x02, 0x1A], // 1.3.14.3.2.26
            DigestAlgorithm::Sha256 => &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x01], // 2.16.840.1.101.3.4.2.1
            DigestAlgorithm::Sha384 => &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x02], // 2.16.840.1.101.3.4.2.2
            DigestAlgorithm::Sha512 => &[0x60, 0x86, 0x48, 0x01, 0x65, 0x03, 0x04, 0x02, 0x03], // 2.16.840.1.101.3.4.2.3
        }
    }

    /// Dotted-decimal form of the OID.
    pub fn oid_string(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "1.3.14.3.2.26",
            DigestAlgorithm::Sha256 => "2.16.840.1.101.3.4.2.1",
            DigestAlgorithm::Sha384 => "2.16.840.1.101.3.4.2.2",
            DigestAlgorithm::Sha512 => "2.16.840.1.101.3.4.2.3",
        }
    }

    /// Look up an algorithm by dotted-decimal OID.
    pub fn from_oid(oid: &str) -> Option<Self> {
        [
            DigestAlgorithm::Sha1,
            DigestAlgorithm::Sha256,
            DigestAlgorithm::Sha384,
            DigestAlgorithm::Sha512,
        ]
        .into_iter()
        .find(|alg| alg.oid_string() == oid)
    }

    /// Get the name of this algorithm.
    pub fn name(&self) -> &'static str {
        match self {
            DigestAlgorithm::Sha1 => "SHA-1",
            DigestAlgorithm::Sha256 => "SHA-256",
            DigestAlgorithm::Sha384 => "SHA-384",
            DigestAlgorithm::Sha512 => "SHA-512",
        }
    }

    /// Digest length in bytes.
    pub fn output_len(&self) -> usize {
        match self {
            DigestAlgorithm::Sha1 => 20,
            DigestAlgorithm::Sha256 => 32,
            DigestAlgorithm::Sha384 => 48,
            DigestAlgorithm::Sha512 => 64,
        }
    }

    /// Hash `data` with this algorithm.
    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        use sha2::Digest;
        match self {
            DigestAlgorithm::Sha1 => sha1::Sha1::digest(data).to_vec(),
            DigestAlgorithm::Sha256 => sha2::Sha256::digest(data).to_vec(),
            DigestAlgorithm::Sha384 => sha2::Sha384::digest(data).to_vec(),
            DigestAlgorithm::Sha512 => sha2::Sha512::digest(data).to_vec(),
        }
    }

    /// Encode the PKCS#1 `DigestInfo` wrapping `digest`.
    ///
    /// Raw RSA mechanisms (`CKM_RSA_PKCS`) sign this structure verbatim.
    pub fn digest_info(&self, digest: &[u8]) -> Vec<u8> {
        let mut out = super::software::pkcs1v15_scheme(*self).prefix.into_vec();
        out.extend_from_slice(digest);
        out
    }
}

/// A digest computed by the caller, tagged with its algorithm.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrehashedDigest {
    algorithm: DigestAlgorithm,
    bytes: Vec<u8>,
}

impl PrehashedDigest {
    /// Wrap digest bytes, checking their length against `algorithm`.
    pub fn new(algorithm: DigestAlgorithm, bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.len() != algorithm.output_len() {
            return Err(Error::InvalidDigest {
                algorithm: algorithm.name(),
                expected: algorithm.output_len(),
                actual: bytes.len(),
            });
        }
        Ok(Self { algorithm, bytes })
    }

    /// Infer the algorithm from the digest length (20/32/48/64 bytes).
    pub fn infer(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        let algorithm = match bytes.len() {
            20 => DigestAlgorithm::Sha1,
            32 => DigestAlgorithm::Sha256,
            48 => DigestAlgorithm::Sha384,
            64 => DigestAlgorithm::Sha512,
            n => {
                return Err(Error::InvalidDigest {
                    algorithm: "unknown",
                    expected: 32,
                    actual: n,
                })
            },
        };
        Ok(Self { algorithm, bytes })
    }

    /// Hash `data` and wrap the result.
    pub fn compute(algorithm: DigestAlgorithm, data: &[u8]) -> Self {
        Self {
            algorithm,
            bytes: algorithm.digest(data),
        }
    }

    /// Algorithm that produced the digest.
    pub fn algorithm(&self) -> DigestAlgorithm {
        self.algorithm
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// PKCS#1 `DigestInfo` encoding of this digest.
    pub fn digest_info(&self) -> Vec<u8> {
        self.algorithm.digest_info(&self.bytes)
    }
}
