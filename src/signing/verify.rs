//! Public-key verification of prehashed signatures.

use super::digest::PrehashedDigest;
use super::software::pkcs1v15_scheme;
use crate::certificate::parse_der;
use crate::error::{Error, Result};
use rsa::RsaPublicKey;
use signature::hazmat::PrehashVerifier;
use spki::DecodePublicKey;

/// Check `signature` over `digest` against the public key of a DER certificate.
///
/// Returns `Ok(false)` when the signature does not match and an error only when
/// the certificate or its key type cannot be handled.
pub fn verify_prehashed(
    certificate_der: &[u8],
    digest: &PrehashedDigest,
    signature: &[u8],
) -> Result<bool> {
    let cert = parse_der(certificate_der)?;
    verify_with_public_key(cert.tbs_certificate.public_key().raw, digest, signature)
}

/// Same as [`verify_prehashed`] but starting from a DER `SubjectPublicKeyInfo`.
pub fn verify_with_public_key(
    spki_der: &[u8],
    digest: &PrehashedDigest,
    signature: &[u8],
) -> Result<bool> {
    if let Ok(key) = RsaPublicKey::from_public_key_der(spki_der) {
        return Ok(key
            .verify(pkcs1v15_scheme(digest.algorithm()), digest.as_bytes(), signature)
            .is_ok());
    }

    if let Ok(key) = p256::ecdsa::VerifyingKey::from_public_key_der(spki_der) {
        let Ok(sig) = p256::ecdsa::Signature::from_der(signature) else {
            return Ok(false);
        };
        return Ok(key.verify_prehash(digest.as_bytes(), &sig).is_ok());
    }

    if let Ok(key) = p384::ecdsa::VerifyingKey::from_public_key_der(spki_der) {
        let Ok(sig) = p384::ecdsa::Signature::from_der(signature) else {
            return Ok(false);
        };
        return Ok(key.verify_prehash(digest.as_bytes(), &sig).is_ok());
    }

    Err(Error::UnsupportedAlgorithm(
        "public key is not RSA, ECDSA P-256 or ECDSA P-384".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signing::DigestAlgorithm;

    #[test]
    fn test_unsupported_public_key() {
        let digest = PrehashedDigest::compute(DigestAlgorithm::Sha256, b"x");
        let err = verify_with_public_key(&[0x30, 0x00], &digest, &[0u8; 64]).unwrap_err();
        assert!(matches!(err, Error::UnsupportedAlgorithm(_)));
    }

    #[test]
    fn test_malformed_ecdsa_signature_is_invalid() {
        let key = p256::ecdsa::SigningKey::random(&mut rand::rngs::OsRng);
        let spki = spki::EncodePublicKey::to_public_key_der(key.verifying_key()).unwrap();
        let digest = PrehashedDigest::compute(DigestAlgorithm::Sha256, b"x");
        assert!(!verify_with_public_key(spki.as_bytes(), &digest, &[1, 2, 3]).unwrap());
    }

    #[test]
    fn test_verify_prehashed_rejects_bad_certificate() {
        let digest = PrehashedDigest::compute(DigestAlgorithm::Sha256, b"x");
        assert!(matches!(
            verify_prehashed(b"not a certificate", &digest, &[]),
            Err(Error::ParseError(_))
        ));
    }
}
