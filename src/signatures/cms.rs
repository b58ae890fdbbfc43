//! CMS SignedData parsing.
//!
//! Extracts what [`SignatureVerifier`](super::SignatureVerifier) needs from the
//! DER blob stored in a signature's `/Contents`.

use super::types::{SignatureContainer, SignatureSubFilter, SignedAttributes};
use crate::error::{Error, Result};
use crate::signing::DigestAlgorithm;
use chrono::{DateTime, Utc};
use cms::cert::CertificateChoices;
use cms::content_info::ContentInfo;
use cms::signed_data::{SignedData, SignerIdentifier, SignerInfo};
use der::asn1::{GeneralizedTime, OctetString, UtcTime};
use der::{Any, Decode, Encode, Header, Reader, SliceReader, Tag, Tagged};

const OID_SIGNED_DATA: &str = "1.2.840.113549.1.7.2";
const OID_MESSAGE_DIGEST: &str = "1.2.840.113549.1.9.4";
const OID_SIGNING_TIME: &str = "1.2.840.113549.1.9.5";

fn invalid(what: impl std::fmt::Display) -> Error {
    Error::InvalidContainer(what.to_string())
}

impl SignatureContainer {
    /// Parse a CMS `ContentInfo` wrapping `SignedData`.
    ///
    /// PDF `/Contents` values are zero padded; trailing zeros after the DER
    /// structure are ignored. `document_digest` is the digest of the signed
    /// byte ranges, computed with the signer's digest algorithm.
    ///
    /// For `adbe.pkcs7.sha1`, `document_digest` is the SHA-1 digest of the
    /// byte ranges. It must equal the encapsulated content, and the signature
    /// covers that content.
    pub fn from_cms_der(
        der: &[u8],
        sub_filter: SignatureSubFilter,
        document_digest: &[u8],
    ) -> Result<Self> {
        let content_info = ContentInfo::from_der(trim_padding(der)?).map_err(invalid)?;
        if content_info.content_type.to_string() != OID_SIGNED_DATA {
            return Err(invalid(format!(
                "content type {} is not SignedData",
                content_info.content_type
            )));
        }
        let signed_data =
            SignedData::from_der(&content_info.content.to_der().map_err(invalid)?).map_err(invalid)?;

        let signer_info = signed_data
            .signer_infos
            .0
            .iter()
            .next()
            .ok_or_else(|| invalid("no signer info"))?;

        let digest_oid = signer_info.digest_alg.oid.to_string();
        let digest_algorithm = DigestAlgorithm::from_oid(&digest_oid)
            .ok_or_else(|| Error::UnsupportedAlgorithm(format!("digest algorithm {}", digest_oid)))?;

        let certificates = certificate_ders(&signed_data)?;
        let signer_index = find_signer_certificate(&signed_data, signer_info)?
            .ok_or_else(|| invalid("signer certificate not included"))?;
        let signer_certificate = certificates[signer_index].clone();
        let chain: Vec<Vec<u8>> = certificates
            .into_iter()
            .enumerate()
            .filter(|(i, _)| *i != signer_index)
            .map(|(_, der)| der)
            .collect();

        let mut container = SignatureContainer::new(
            sub_filter,
            digest_algorithm,
            document_digest.to_vec(),
            signer_info.signature.as_bytes().to_vec(),
            signer_certificate,
        )
        .with_chain(chain);

        if sub_filter == SignatureSubFilter::Pkcs7Sha1 {
            let content = signed_data
                .encap_content_info
                .econtent
                .as_ref()
                .ok_or_else(|| invalid("adbe.pkcs7.sha1 signature without signed content"))?;
            let embedded = OctetString::from_der(&content.to_der().map_err(invalid)?).map_err(invalid)?;
            container = container.with_encapsulated_digest(embedded.as_bytes().to_vec());
        }

        if let Some(attrs) = &signer_info.signed_attrs {
            let mut signed = SignedAttributes {
                der: attrs.to_der().map_err(invalid)?,
                message_digest: None,
                signing_time: None,
            };
            for attr in attrs.iter() {
                let Some(value) = attr.values.iter().next() else {
                    continue;
                };
                match attr.oid.to_string().as_str() {
                    OID_MESSAGE_DIGEST => {
                        let octets = OctetString::from_der(&value.to_der().map_err(invalid)?).map_err(invalid)?;
                        signed.message_digest = Some(octets.as_bytes().to_vec());
                    },
                    OID_SIGNING_TIME => signed.signing_time = decode_time(value),
                    _ => {},
                }
            }
            container = container.with_signed_attributes(signed);
        }

        log::debug!(
            "Parsed {} container: {}, {} chain certificates",
            sub_filter,
            digest_algorithm.name(),
            container.chain.len()
        );
        Ok(container)
    }
}

/// Cut the DER structure out of a zero-padded buffer.
fn trim_padding(der: &[u8]) -> Result<&[u8]> {
    let mut reader = SliceReader::new(der).map_err(invalid)?;
    let header = Header::decode(&mut reader).map_err(invalid)?;
    let total = (reader.position() + header.length).map_err(invalid)?;
    let total: usize = total.try_into().map_err(invalid)?;
    if total > der.len() {
        return Err(invalid("truncated CMS structure"));
    }
    Ok(&der[..total])
}

fn certificate_ders(signed_data: &SignedData) -> Result<Vec<Vec<u8>>> {
    let mut out = Vec::new();
    if let Some(set) = &signed_data.certificates {
        for choice in set.0.iter() {
            if let CertificateChoices::Certificate(cert) = choice {
                out.push(cert.to_der().map_err(invalid)?);
            }
        }
    }
    Ok(out)
}

/// Index of the signer certificate among the plain certificates.
fn find_signer_certificate(signed_data: &SignedData, signer_info: &SignerInfo) -> Result<Option<usize>> {
    let Some(set) = &signed_data.certificates else {
        return Ok(None);
    };
    let certs: Vec<_> = set
        .0
        .iter()
        .filter_map(|choice| match choice {
            CertificateChoices::Certificate(cert) => Some(cert),
            _ => None,
        })
        .collect();

    match &signer_info.sid {
        SignerIdentifier::IssuerAndSerialNumber(id) => Ok(certs.iter().position(|cert| {
            cert.tbs_certificate.issuer == id.issuer
                && cert.tbs_certificate.serial_number == id.serial_number
        })),
        SignerIdentifier::SubjectKeyIdentifier(_) => {
            log::debug!("Signer identified by key identifier, using the first certificate");
            Ok(if certs.is_empty() { None } else { Some(0) })
        },
    }
}

fn decode_time(value: &Any) -> Option<DateTime<Utc>> {
    let der = value.to_der().ok()?;
    let since_epoch = match value.tag() {
        Tag::UtcTime => UtcTime::from_der(&der).ok()?.to_unix_duration(),
        Tag::GeneralizedTime => GeneralizedTime::from_der(&der).ok()?.to_unix_duration(),
        _ => return None,
    };
    DateTime::from_timestamp(since_epoch.as_secs() as i64, 0)
}
