//! X.509 decoding into the certificate model.

use super::model::{AuthContract, Certificate, Fingerprint, KeyAlgorithm, KeyUsage, Locator};
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use x509_parser::prelude::*;
use x509_parser::public_key::PublicKey;

/// Fallback display name when neither CN nor locator label is available.
pub const UNKNOWN_NAME: &str = "Unknown Certificate";

impl Certificate {
    /// Decode a DER certificate found by a backend.
    ///
    /// `can_sign` is left `false`; backends that know a private key is present
    /// set it with [`Certificate::with_can_sign`].
    pub fn from_der(der: &[u8], locator: Locator, auth: AuthContract) -> Result<Self> {
        let cert = parse_der(der)?;
        let tbs = &cert.tbs_certificate;

        let common_name = tbs
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_string)
            .filter(|cn| !cn.is_empty());
        let name = match common_name {
            Some(cn) => cn,
            None => {
                let label = locator.label();
                if label.is_empty() {
                    UNKNOWN_NAME.to_string()
                } else {
                    label
                }
            },
        };

        let validity = tbs.validity();
        let not_before = to_utc(validity.not_before)?;
        let not_after = to_utc(validity.not_after)?;

        Ok(Certificate::new(name, Fingerprint::of_der(der), locator)
            .with_issuer(tbs.issuer().to_string())
            .with_subject(tbs.subject().to_string())
            .with_serial_number(serial_hex(tbs.raw_serial()))
            .with_validity(not_before, not_after)
            .with_key_usage(key_usage(tbs))
            .with_key_algorithm(key_algorithm(tbs.public_key()))
            .with_ca(tbs.is_ca())
            .with_auth(auth)
            .with_der(der.to_vec()))
    }
}

/// Parse DER certificate bytes.
pub(crate) fn parse_der(der: &[u8]) -> Result<X509Certificate<'_>> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|e| Error::ParseError(e.to_string()))?;
    Ok(cert)
}

/// Accept a certificate file in either DER or PEM form and return DER bytes.
pub fn certificate_bytes_to_der(data: &[u8]) -> Result<Vec<u8>> {
    if let Ok((_, pem)) = x509_parser::pem::parse_x509_pem(data) {
        if pem.label == "CERTIFICATE" {
            return Ok(pem.contents);
        }
        return Err(Error::ParseError(format!("unexpected PEM block '{}'", pem.label)));
    }
    parse_der(data)?;
    Ok(data.to_vec())
}

fn to_utc(time: ASN1Time) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp(time.timestamp(), 0)
        .ok_or_else(|| Error::ParseError(format!("validity time out of range: {}", time)))
}

fn serial_hex(raw: &[u8]) -> String {
    let start = raw.iter().position(|b| *b != 0).unwrap_or(raw.len());
    let hex = to_hex(&raw[start..], true);
    if hex.is_empty() {
        "0".to_string()
    } else {
        hex
    }
}

fn key_usage(tbs: &TbsCertificate<'_>) -> Vec<KeyUsage> {
    let ext = match tbs.key_usage() {
        Ok(Some(ext)) => ext.value,
        Ok(None) => return Vec::new(),
        Err(e) => {
            log::warn!("Ignoring malformed key usage extension: {}", e);
            return Vec::new();
        },
    };

    let flags = [
        ext.digital_signature(),
        ext.non_repudiation(),
        ext.key_encipherment(),
        ext.data_encipherment(),
        ext.key_agreement(),
        ext.key_cert_sign(),
        ext.crl_sign(),
        ext.encipher_only(),
        ext.decipher_only(),
    ];
    KeyUsage::ALL
        .iter()
        .zip(flags)
        .filter(|(_, set)| *set)
        .map(|(usage, _)| *usage)
        .collect()
}

const OID_CURVE_P256: &str = "1.2.840.10045.3.1.7";
const OID_CURVE_P384: &str = "1.3.132.0.34";

fn key_algorithm(spki: &SubjectPublicKeyInfo<'_>) -> KeyAlgorithm {
    match spki.parsed() {
        Ok(PublicKey::RSA(rsa)) => KeyAlgorithm::Rsa {
            bits: rsa.key_size(),
        },
        Ok(PublicKey::EC(_)) => ec_algorithm(named_curve(spki).as_deref()),
        _ => KeyAlgorithm::Unknown,
    }
}

/// Named-curve OID from the EC algorithm parameters.
fn named_curve(spki: &SubjectPublicKeyInfo<'_>) -> Option<String> {
    let params = spki.algorithm.parameters.as_ref()?;
    x509_parser::der_parser::oid::Oid::try_from(params)
        .ok()
        .map(|oid| oid.to_id_string())
}

fn ec_algorithm(curve: Option<&str>) -> KeyAlgorithm {
    match curve {
        Some(OID_CURVE_P256) => KeyAlgorithm::EcdsaP256,
        Some(OID_CURVE_P384) => KeyAlgorithm::EcdsaP384,
        Some(other) => {
            log::debug!("Unsupported EC curve {}", other);
            KeyAlgorithm::Unknown
        },
        None => KeyAlgorithm::Unknown,
    }
}

/// Convert bytes to a hex string.
pub(crate) fn to_hex(bytes: &[u8], upper: bool) -> String {
    let chars: &[u8] = if upper {
        b"0123456789ABCDEF"
    } else {
        b"0123456789abcdef"
    };
    let mut hex = String::with_capacity(bytes.len() * 2);
    for &byte in bytes {
        hex.push(chars[(byte >> 4) as usize] as char);
        hex.push(chars[(byte & 0x0F) as usize] as char);
    }
    hex
}
