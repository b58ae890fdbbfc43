//! Signature verification.
//!
//! Verification never touches the network. Trust comes from the roots added
//! to the verifier; revocation comes from an optional [`RevocationChecker`].

use super::types::{SignatureContainer, SignatureInfo};
use crate::certificate::{parse_der, UNKNOWN_NAME};
use crate::error::{Error, Result};
use crate::signing::{verify_prehashed, verify_with_public_key, DigestAlgorithm, PrehashedDigest};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use x509_parser::certificate::X509Certificate;

/// Longest issuer chain followed before giving up.
const MAX_CHAIN_DEPTH: usize = 10;

const MSG_SIGNATURE_VALID: &str = "Signature is cryptographically valid";
const MSG_SIGNATURE_INVALID: &str = "Signature validation failed";
const MSG_CERT_TRUSTED: &str = "Certificate is valid and trusted";
const MSG_CERT_UNTRUSTED: &str = "Certificate chain validation issue (not in trust store)";
const MSG_CERT_REVOKED: &str = "Certificate has been revoked";
const MSG_CERT_EXPIRED: &str = "Certificate has expired";
const MSG_CERT_NOT_YET_VALID: &str = "Certificate is not yet valid";

/// Answer of a revocation lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationStatus {
    /// Certificate is known not to be revoked
    Good,
    /// Certificate has been revoked
    Revoked,
    /// No revocation information available
    Unknown,
}

/// Revocation source supplied by the caller (cached CRLs, OCSP responses).
pub trait RevocationChecker: Send + Sync {
    /// Look up the status of `certificate_der`, issued by `issuer_der` when the
    /// issuer is known.
    fn check(&self, certificate_der: &[u8], issuer_der: Option<&[u8]>) -> RevocationStatus;
}

/// Verifier for embedded signatures.
#[derive(Clone, Default)]
pub struct SignatureVerifier {
    /// Trusted root certificates (DER-encoded)
    trusted_roots: Vec<Vec<u8>>,
    revocation: Option<Arc<dyn RevocationChecker>>,
    verification_time: Option<DateTime<Utc>>,
}

impl SignatureVerifier {
    /// Create a verifier that trusts nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a trusted root certificate.
    pub fn add_trusted_root(&mut self, cert_der: Vec<u8>) {
        self.trusted_roots.push(cert_der);
    }

    /// Add multiple trusted root certificates.
    pub fn add_trusted_roots(&mut self, certs: Vec<Vec<u8>>) {
        self.trusted_roots.extend(certs);
    }

    /// Consult `checker` for the signer certificate.
    pub fn with_revocation_checker(mut self, checker: Arc<dyn RevocationChecker>) -> Self {
        self.revocation = Some(checker);
        self
    }

    /// Check certificate validity at `at` when the signature carries no
    /// signing time.
    pub fn with_verification_time(mut self, at: DateTime<Utc>) -> Self {
        self.verification_time = Some(at);
        self
    }

    /// Number of trusted roots.
    pub fn trusted_root_count(&self) -> usize {
        self.trusted_roots.len()
    }

    /// Verify one signature.
    pub fn verify(&self, container: &SignatureContainer) -> SignatureInfo {
        let signing_time = container.signing_time();
        let mut info = SignatureInfo {
            signer_name: UNKNOWN_NAME.to_string(),
            signer_dn: String::new(),
            signing_time,
            hash_algorithm: container.digest_algorithm,
            sub_filter: container.sub_filter,
            is_valid: false,
            certificate_valid: false,
            validation_message: MSG_SIGNATURE_INVALID.to_string(),
            certificate_message: String::new(),
            reason: container.reason.clone(),
            location: container.location.clone(),
            contact_info: container.contact_info.clone(),
        };

        let signer = match parse_der(&container.signer_certificate) {
            Ok(cert) => cert,
            Err(e) => {
                log::warn!("Cannot parse signer certificate: {}", e);
                info.certificate_message = e.to_string();
                return info;
            },
        };
        if let Some(cn) = signer.subject().iter_common_name().next().and_then(|cn| cn.as_str().ok()) {
            info.signer_name = cn.to_string();
        }
        info.signer_dn = signer.subject().to_string();

        match self.check_signature(container) {
            Ok(true) => {
                info.is_valid = true;
                info.validation_message = MSG_SIGNATURE_VALID.to_string();
            },
            Ok(false) => {},
            Err(e) => info.validation_message = format!("{}: {}", MSG_SIGNATURE_INVALID, e),
        }

        let at = signing_time
            .or(self.verification_time)
            .unwrap_or_else(Utc::now);
        let (valid, message) = self.check_certificate(&signer, container, at);
        info.certificate_valid = valid;
        info.certificate_message = message.to_string();

        log::debug!(
            "Verified signature of '{}': valid={}, certificate_valid={}",
            info.signer_name,
            info.is_valid,
            info.certificate_valid
        );
        info
    }

    fn check_signature(&self, container: &SignatureContainer) -> Result<bool> {
        let algorithm = container.digest_algorithm;
        // What the signer hashed: the document itself, or the digest it embedded.
        let content_digest = match &container.encapsulated_digest {
            Some(embedded) => {
                if *embedded != container.document_digest {
                    log::debug!("Embedded document digest does not match the document");
                    return Ok(false);
                }
                algorithm.digest(embedded)
            },
            None => container.document_digest.clone(),
        };

        let digest = match &container.signed_attributes {
            Some(attrs) => {
                let Some(message_digest) = &attrs.message_digest else {
                    return Err(Error::InvalidContainer("signed attributes lack a message digest".to_string()));
                };
                if *message_digest != content_digest {
                    log::debug!("Message digest does not match the signed content");
                    return Ok(false);
                }
                PrehashedDigest::compute(algorithm, &attrs.der)
            },
            None => PrehashedDigest::new(algorithm, content_digest)?,
        };
        verify_prehashed(&container.signer_certificate, &digest, &container.signature)
    }

    fn check_certificate(
        &self,
        signer: &X509Certificate<'_>,
        container: &SignatureContainer,
        at: DateTime<Utc>,
    ) -> (bool, &'static str) {
        let timestamp = at.timestamp();
        let validity = signer.validity();
        if timestamp > validity.not_after.timestamp() {
            return (false, MSG_CERT_EXPIRED);
        }
        if timestamp < validity.not_before.timestamp() {
            return (false, MSG_CERT_NOT_YET_VALID);
        }

        let issuer = match self.chain_to_root(&container.signer_certificate, &container.chain) {
            Some(issuer) => issuer,
            None => return (false, MSG_CERT_UNTRUSTED),
        };

        if let Some(checker) = &self.revocation {
            let status = checker.check(&container.signer_certificate, issuer.as_deref());
            if status == RevocationStatus::Revoked {
                return (false, MSG_CERT_REVOKED);
            }
        }
        (true, MSG_CERT_TRUSTED)
    }

    /// Walk issuer links from `leaf` to a trusted root.
    ///
    /// On success returns the DER of the leaf's direct issuer, or `None` inside
    /// the `Some` when the leaf itself is a trusted root.
    fn chain_to_root(&self, leaf: &[u8], intermediates: &[Vec<u8>]) -> Option<Option<Vec<u8>>> {
        let mut current = leaf.to_vec();
        let mut direct_issuer: Option<Vec<u8>> = None;

        for depth in 0..MAX_CHAIN_DEPTH {
            if self.trusted_roots.iter().any(|root| *root == current) {
                return Some(direct_issuer);
            }
            let cert = parse_der(&current).ok()?;

            if let Some(root) = self.trusted_roots.iter().find(|r| issued_by(&cert, r)) {
                return Some(direct_issuer.or_else(|| Some(root.clone())));
            }

            let next = intermediates
                .iter()
                .find(|candidate| **candidate != current && issued_by(&cert, candidate))?;
            log::debug!("Chain link {} verified", depth + 1);
            if direct_issuer.is_none() {
                direct_issuer = Some(next.clone());
            }
            current = next.clone();
        }
        log::warn!("Certificate chain longer than {} links", MAX_CHAIN_DEPTH);
        None
    }
}

/// Whether `issuer_der` names the issuer of `cert` and its key verifies the
/// certificate signature.
fn issued_by(cert: &X509Certificate<'_>, issuer_der: &[u8]) -> bool {
    let Ok(issuer) = parse_der(issuer_der) else {
        return false;
    };
    if cert.issuer().as_raw() != issuer.subject().as_raw() {
        return false;
    }

    let oid = cert.signature_algorithm.algorithm.to_id_string();
    let Some(algorithm) = signature_digest(&oid) else {
        log::debug!("Unsupported certificate signature algorithm {}", oid);
        return false;
    };
    let digest = PrehashedDigest::compute(algorithm, cert.tbs_certificate.as_ref());
    verify_with_public_key(
        issuer.public_key().raw,
        &digest,
        cert.signature_value.data.as_ref(),
    )
    .unwrap_or(false)
}

/// Digest of an X.509 signature algorithm OID.
fn signature_digest(oid: &str) -> Option<DigestAlgorithm> {
    match oid {
        "1.2.840.113549.1.1.5" | "1.2.840.10045.4.1" => Some(DigestAlgorithm::Sha1),
        "1.2.840.113549.1.1.11" | "1.2.840.10045.4.3.2" => Some(DigestAlgorithm::Sha256),
        "1.2.840.113549.1.1.12" | "1.2.840.10045.4.3.3" => Some(DigestAlgorithm::Sha384),
        "1.2.840.113549.1.1.13" | "1.2.840.10045.4.3.4" => Some(DigestAlgorithm::Sha512),
        _ => None,
    }
}
