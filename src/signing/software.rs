//! In-process signer for keys decrypted from a PKCS#12 container.

use super::digest::{DigestAlgorithm, PrehashedDigest};
use super::Signer;
use crate::certificate::Certificate;
use crate::error::{Error, Result};
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use signature::hazmat::PrehashSigner;

/// Private key material held in memory.
///
/// All three key types wipe themselves on drop.
pub enum SoftwareKey {
    /// RSA private key
    Rsa(RsaPrivateKey),
    /// ECDSA P-256 key
    P256(p256::ecdsa::SigningKey),
    /// ECDSA P-384 key
    P384(p384::ecdsa::SigningKey),
}

impl SoftwareKey {
    /// Load a DER-encoded private key (PKCS#8, or PKCS#1 for RSA).
    pub fn from_der(der: &[u8]) -> Result<Self> {
        use pkcs1::DecodeRsaPrivateKey;
        use pkcs8::DecodePrivateKey;

        if let Ok(key) = RsaPrivateKey::from_pkcs8_der(der) {
            return Ok(SoftwareKey::Rsa(key));
        }
        if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_der(der) {
            return Ok(SoftwareKey::P256(key));
        }
        if let Ok(key) = p384::ecdsa::SigningKey::from_pkcs8_der(der) {
            return Ok(SoftwareKey::P384(key));
        }
        if let Ok(key) = RsaPrivateKey::from_pkcs1_der(der) {
            return Ok(SoftwareKey::Rsa(key));
        }
        Err(Error::UnsupportedAlgorithm(
            "private key is not RSA, ECDSA P-256 or ECDSA P-384".to_string(),
        ))
    }

    /// Short algorithm label for log lines.
    pub fn algorithm_name(&self) -> &'static str {
        match self {
            SoftwareKey::Rsa(_) => "RSA",
            SoftwareKey::P256(_) => "ECDSA P-256",
            SoftwareKey::P384(_) => "ECDSA P-384",
        }
    }

    /// Sign a precomputed digest.
    ///
    /// RSA produces PKCS#1 v1.5 over the DigestInfo; ECDSA returns a DER
    /// `Ecdsa-Sig-Value`.
    pub fn sign_prehashed(&self, digest: &PrehashedDigest) -> Result<Vec<u8>> {
        match self {
            SoftwareKey::Rsa(key) => key
                .sign(pkcs1v15_scheme(digest.algorithm()), digest.as_bytes())
                .map_err(|e| Error::SigningFailed(e.to_string())),
            SoftwareKey::P256(key) => {
                let sig: p256::ecdsa::Signature = key
                    .sign_prehash(digest.as_bytes())
                    .map_err(|e| Error::SigningFailed(e.to_string()))?;
                Ok(sig.to_der().as_bytes().to_vec())
            },
            SoftwareKey::P384(key) => {
                let sig: p384::ecdsa::Signature = key
                    .sign_prehash(digest.as_bytes())
                    .map_err(|e| Error::SigningFailed(e.to_string()))?;
                Ok(sig.to_der().as_bytes().to_vec())
            },
        }
    }
}

impl std::fmt::Debug for SoftwareKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SoftwareKey({}, [REDACTED])", self.algorithm_name())
    }
}

/// PKCS#1 v1.5 signature scheme with the DigestInfo prefix for `algorithm`.
pub(crate) fn pkcs1v15_scheme(algorithm: DigestAlgorithm) -> Pkcs1v15Sign {
    match algorithm {
        DigestAlgorithm::Sha1 => Pkcs1v15Sign::new::<sha1::Sha1>(),
        DigestAlgorithm::Sha256 => Pkcs1v15Sign::new::<sha2::Sha256>(),
        DigestAlgorithm::Sha384 => Pkcs1v15Sign::new::<sha2::Sha384>(),
        DigestAlgorithm::Sha512 => Pkcs1v15Sign::new::<sha2::Sha512>(),
    }
}

/// Signer over a key held in process memory.
///
/// Closing drops the key, which zeroizes it.
#[derive(Debug)]
pub struct SoftwareSigner {
    certificate: Certificate,
    key: Option<SoftwareKey>,
}

impl SoftwareSigner {
    /// Bind `key` to `certificate`.
    pub fn new(certificate: Certificate, key: SoftwareKey) -> Self {
        Self {
            certificate,
            key: Some(key),
        }
    }
}

impl Signer for SoftwareSigner {
    fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    fn sign(&mut self, digest: &PrehashedDigest) -> Result<Vec<u8>> {
        let key = self.key.as_ref().ok_or(Error::SignerClosed)?;
        key.sign_prehashed(digest)
    }

    fn close(&mut self) {
        if self.key.take().is_some() {
            log::debug!("Released software key for {}", self.certificate.name());
        }
    }

    fn is_closed(&self) -> bool {
        self.key.is_none()
    }
}

impl Drop for SoftwareSigner {
    fn drop(&mut self) {
        self.close();
    }
}
