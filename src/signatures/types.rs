//! Signature container and verification result types.

use crate::signing::DigestAlgorithm;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Signature sub-filter type (signature format).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SignatureSubFilter {
    /// adbe.pkcs7.detached - PKCS#7 detached signature
    #[default]
    #[serde(rename = "adbe.pkcs7.detached")]
    Pkcs7Detached,
    /// adbe.pkcs7.sha1 - PKCS#7 with SHA-1 digest
    #[serde(rename = "adbe.pkcs7.sha1")]
    Pkcs7Sha1,
    /// ETSI.CAdES.detached - PAdES CAdES signature
    #[serde(rename = "ETSI.CAdES.detached")]
    CadesDetached,
    /// ETSI.RFC3161 - Timestamp token
    #[serde(rename = "ETSI.RFC3161")]
    Rfc3161,
}

impl SignatureSubFilter {
    /// Get the PDF name for this sub-filter.
    pub fn as_pdf_name(&self) -> &'static str {
        match self {
            SignatureSubFilter::Pkcs7Detached => "adbe.pkcs7.detached",
            SignatureSubFilter::Pkcs7Sha1 => "adbe.pkcs7.sha1",
            SignatureSubFilter::CadesDetached => "ETSI.CAdES.detached",
            SignatureSubFilter::Rfc3161 => "ETSI.RFC3161",
        }
    }

    /// Parse a PDF name into a sub-filter type.
    pub fn from_pdf_name(name: &str) -> Option<Self> {
        match name {
            "adbe.pkcs7.detached" => Some(SignatureSubFilter::Pkcs7Detached),
            "adbe.pkcs7.sha1" => Some(SignatureSubFilter::Pkcs7Sha1),
            "ETSI.CAdES.detached" => Some(SignatureSubFilter::CadesDetached),
            "ETSI.RFC3161" => Some(SignatureSubFilter::Rfc3161),
            _ => None,
        }
    }
}

impl std::fmt::Display for SignatureSubFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_pdf_name())
    }
}

/// Authenticated attributes of a CMS signer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedAttributes {
    /// DER of the attribute set, encoded with the SET tag as it is hashed
    pub der: Vec<u8>,
    /// Value of the message-digest attribute
    pub message_digest: Option<Vec<u8>>,
    /// Value of the signing-time attribute
    pub signing_time: Option<DateTime<Utc>>,
}

/// Everything needed to verify one embedded signature.
///
/// The document digest is computed by the caller over the signed byte ranges
/// with the container's digest algorithm, or with SHA-1 for `adbe.pkcs7.sha1`.
#[derive(Debug, Clone)]
pub struct SignatureContainer {
    /// Signature format
    pub sub_filter: SignatureSubFilter,
    /// Digest algorithm of the signer
    pub digest_algorithm: DigestAlgorithm,
    /// Digest of the signed document bytes
    pub document_digest: Vec<u8>,
    /// Raw signature value
    pub signature: Vec<u8>,
    /// DER of the signer certificate
    pub signer_certificate: Vec<u8>,
    /// DER of the other certificates shipped with the signature
    pub chain: Vec<Vec<u8>>,
    /// Signed attributes, when the signature covers them
    pub signed_attributes: Option<SignedAttributes>,
    /// Document digest embedded as signed content (`adbe.pkcs7.sha1`)
    pub encapsulated_digest: Option<Vec<u8>>,
    /// Signing time claimed by the signature dictionary (`/M`)
    pub claimed_signing_time: Option<DateTime<Utc>>,
    /// Reason for signing
    pub reason: Option<String>,
    /// Signing location
    pub location: Option<String>,
    /// Contact information
    pub contact_info: Option<String>,
}

impl SignatureContainer {
    /// Create a container without signed attributes or chain.
    pub fn new(
        sub_filter: SignatureSubFilter,
        digest_algorithm: DigestAlgorithm,
        document_digest: Vec<u8>,
        signature: Vec<u8>,
        signer_certificate: Vec<u8>,
    ) -> Self {
        Self {
            sub_filter,
            digest_algorithm,
            document_digest,
            signature,
            signer_certificate,
            chain: Vec::new(),
            signed_attributes: None,
            encapsulated_digest: None,
            claimed_signing_time: None,
            reason: None,
            location: None,
            contact_info: None,
        }
    }

    /// Attach intermediate certificates.
    pub fn with_chain(mut self, chain: Vec<Vec<u8>>) -> Self {
        self.chain = chain;
        self
    }

    /// Attach signed attributes.
    pub fn with_signed_attributes(mut self, attributes: SignedAttributes) -> Self {
        self.signed_attributes = Some(attributes);
        self
    }

    /// Attach the document digest carried inside the signed content.
    pub fn with_encapsulated_digest(mut self, digest: Vec<u8>) -> Self {
        self.encapsulated_digest = Some(digest);
        self
    }

    /// Set the `/M` signing time.
    pub fn with_signing_time(mut self, time: DateTime<Utc>) -> Self {
        self.claimed_signing_time = Some(time);
        self
    }

    /// Set the reason for signing.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Set the signing location.
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Set the contact information.
    pub fn with_contact_info(mut self, contact: impl Into<String>) -> Self {
        self.contact_info = Some(contact.into());
        self
    }

    /// Signing time from the signed attributes, else the `/M` entry.
    pub fn signing_time(&self) -> Option<DateTime<Utc>> {
        self.signed_attributes
            .as_ref()
            .and_then(|a| a.signing_time)
            .or(self.claimed_signing_time)
    }
}

/// Result of verifying one signature.
///
/// Cryptographic validity and certificate validity are always reported
/// separately.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureInfo {
    /// Common name of the signer certificate
    pub signer_name: String,
    /// Subject DN of the signer certificate
    pub signer_dn: String,
    /// Signing time
    pub signing_time: Option<DateTime<Utc>>,
    /// Digest algorithm of the signature
    pub hash_algorithm: DigestAlgorithm,
    /// Signature format
    pub sub_filter: SignatureSubFilter,
    /// Signature matches the document digest and the signer key
    pub is_valid: bool,
    /// Signer certificate is in its validity window, chains to a trusted
    /// root and is not revoked
    pub certificate_valid: bool,
    /// Outcome of the cryptographic check
    pub validation_message: String,
    /// Outcome of the certificate check
    pub certificate_message: String,
    /// Reason for signing
    pub reason: Option<String>,
    /// Signing location
    pub location: Option<String>,
    /// Contact information
    pub contact_info: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_sub_filter_names() {
        assert_eq!(SignatureSubFilter::Pkcs7Detached.as_pdf_name(), "adbe.pkcs7.detached");
        assert_eq!(
            SignatureSubFilter::from_pdf_name("ETSI.CAdES.detached"),
            Some(SignatureSubFilter::CadesDetached)
        );
        assert_eq!(SignatureSubFilter::from_pdf_name("adbe.x509.rsa_sha1"), None);
        assert_eq!(SignatureSubFilter::Rfc3161.to_string(), "ETSI.RFC3161");
    }

    #[test]
    fn test_sub_filter_serializes_as_pdf_name() {
        let json = serde_json::to_string(&SignatureSubFilter::Pkcs7Sha1).unwrap();
        assert_eq!(json, "\"adbe.pkcs7.sha1\"");
    }

    #[test]
    fn test_signing_time_prefers_signed_attributes() {
        let claimed = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let attested = Utc.with_ymd_and_hms(2024, 1, 1, 11, 59, 0).unwrap();
        let container = SignatureContainer::new(
            SignatureSubFilter::Pkcs7Detached,
            DigestAlgorithm::Sha256,
            vec![0; 32],
            vec![],
            vec![],
        )
        .with_signing_time(claimed);
        assert_eq!(container.signing_time(), Some(claimed));

        let container = container.with_signed_attributes(SignedAttributes {
            der: vec![0x31, 0x00],
            message_digest: None,
            signing_time: Some(attested),
        });
        assert_eq!(container.signing_time(), Some(attested));
    }

    #[test]
    fn test_signature_info_json_keys() {
        let info = SignatureInfo {
            signer_name: "Alice".to_string(),
            signer_dn: "CN=Alice".to_string(),
            signing_time: None,
            hash_algorithm: DigestAlgorithm::Sha256,
            sub_filter: SignatureSubFilter::CadesDetached,
            is_valid: true,
            certificate_valid: false,
            validation_message: "ok".to_string(),
            certificate_message: "untrusted".to_string(),
            reason: Some("Approval".to_string()),
            location: None,
            contact_info: None,
        };
        let value = serde_json::to_value(&info).unwrap();
        assert_eq!(value["signerName"], "Alice");
        assert_eq!(value["certificateValid"], false);
        assert_eq!(value["subFilter"], "ETSI.CAdES.detached");
        assert_eq!(value["hashAlgorithm"], "SHA-256");
    }
}
