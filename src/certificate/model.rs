//! Backend-agnostic certificate model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Backend a certificate was discovered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CertificateSource {
    /// PKCS#12 container on disk
    File,
    /// PKCS#11 hardware token
    Token,
    /// NSS certificate store
    Store,
}

impl CertificateSource {
    /// All sources, most preferred first.
    pub const ALL: [CertificateSource; 3] = [
        CertificateSource::Store,
        CertificateSource::Token,
        CertificateSource::File,
    ];

    /// Rank used when the same certificate is reachable through several
    /// backends. Lower wins.
    pub fn preference(&self) -> u8 {
        match self {
            CertificateSource::Store => 0,
            CertificateSource::Token => 1,
            CertificateSource::File => 2,
        }
    }

    /// Get the name of this source.
    pub fn name(&self) -> &'static str {
        match self {
            CertificateSource::File => "File",
            CertificateSource::Token => "Token",
            CertificateSource::Store => "Store",
        }
    }

    /// Parse a source name, accepting the backend technology names as aliases.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "file" | "pkcs12" | "pkcs#12" => Some(CertificateSource::File),
            "token" | "pkcs11" | "pkcs#11" => Some(CertificateSource::Token),
            "store" | "nss" | "nss database" => Some(CertificateSource::Store),
            _ => None,
        }
    }
}

impl fmt::Display for CertificateSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// X.509 key usage flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyUsage {
    /// digitalSignature
    #[serde(rename = "Digital Signature")]
    DigitalSignature,
    /// nonRepudiation / contentCommitment
    #[serde(rename = "Non Repudiation")]
    NonRepudiation,
    /// keyEncipherment
    #[serde(rename = "Key Encipherment")]
    KeyEncipherment,
    /// dataEncipherment
    #[serde(rename = "Data Encipherment")]
    DataEncipherment,
    /// keyAgreement
    #[serde(rename = "Key Agreement")]
    KeyAgreement,
    /// keyCertSign
    #[serde(rename = "Certificate Sign")]
    CertificateSign,
    /// cRLSign
    #[serde(rename = "CRL Sign")]
    CrlSign,
    /// encipherOnly
    #[serde(rename = "Encipher Only")]
    EncipherOnly,
    /// decipherOnly
    #[serde(rename = "Decipher Only")]
    DecipherOnly,
}

impl KeyUsage {
    /// Every key usage, in extension bit order.
    pub const ALL: [KeyUsage; 9] = [
        KeyUsage::DigitalSignature,
        KeyUsage::NonRepudiation,
        KeyUsage::KeyEncipherment,
        KeyUsage::DataEncipherment,
        KeyUsage::KeyAgreement,
        KeyUsage::CertificateSign,
        KeyUsage::CrlSign,
        KeyUsage::EncipherOnly,
        KeyUsage::DecipherOnly,
    ];

    /// Display name, as matched by [`Certificate::has_key_usage`].
    pub fn name(&self) -> &'static str {
        match self {
            KeyUsage::DigitalSignature => "Digital Signature",
            KeyUsage::NonRepudiation => "Non Repudiation",
            KeyUsage::KeyEncipherment => "Key Encipherment",
            KeyUsage::DataEncipherment => "Data Encipherment",
            KeyUsage::KeyAgreement => "Key Agreement",
            KeyUsage::CertificateSign => "Certificate Sign",
            KeyUsage::CrlSign => "CRL Sign",
            KeyUsage::EncipherOnly => "Encipher Only",
            KeyUsage::DecipherOnly => "Decipher Only",
        }
    }
}

/// Public key algorithm of a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KeyAlgorithm {
    /// RSA with the given modulus size in bits
    Rsa {
        /// Modulus size in bits
        bits: usize,
    },
    /// ECDSA over NIST P-256
    EcdsaP256,
    /// ECDSA over NIST P-384
    EcdsaP384,
    /// Anything else (Ed25519, other curves, DSA)
    Unknown,
}

/// Where a certificate lives inside its backend.
///
/// Exactly one locator exists per certificate and its variant decides the
/// certificate's [`CertificateSource`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Locator {
    /// PKCS#12 container path
    File {
        /// Path to the `.p12`/`.pfx` file
        path: PathBuf,
    },
    /// PKCS#11 object on a token
    Token {
        /// PKCS#11 module that exposes the token
        module: PathBuf,
        /// `pkcs11:token=...;object=...` URI
        uri: String,
    },
    /// Nickname inside the NSS store
    Store {
        /// NSS nickname
        nickname: String,
    },
}

impl Locator {
    /// Backend this locator belongs to.
    pub fn source(&self) -> CertificateSource {
        match self {
            Locator::File { .. } => CertificateSource::File,
            Locator::Token { .. } => CertificateSource::Token,
            Locator::Store { .. } => CertificateSource::Store,
        }
    }

    /// Short human label: file name, token object label, or nickname.
    pub fn label(&self) -> String {
        match self {
            Locator::File { path } => path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            Locator::Token { uri, .. } => crate::backends::pkcs11::uri_component(uri, "object")
                .unwrap_or_default(),
            Locator::Store { nickname } => nickname.clone(),
        }
    }
}

/// Authentication contract of the owning backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthContract {
    /// A PIN must be supplied to sign
    pub requires_pin: bool,
    /// A PIN may be supplied but is not needed
    pub pin_optional: bool,
}

impl AuthContract {
    /// PIN mandatory.
    pub const REQUIRED: AuthContract = AuthContract {
        requires_pin: true,
        pin_optional: false,
    };

    /// PIN accepted but not needed.
    pub const OPTIONAL: AuthContract = AuthContract {
        requires_pin: false,
        pin_optional: true,
    };
}

/// Lowercase hex SHA-256 of a certificate's DER encoding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint of DER-encoded certificate bytes.
    pub fn of_der(der: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        Fingerprint(super::x509::to_hex(&Sha256::digest(der), false))
    }

    /// Normalize a user-supplied fingerprint (case, `:` separators, spaces).
    pub fn parse(text: &str) -> Self {
        Fingerprint(
            text.chars()
                .filter(|c| !c.is_whitespace() && *c != ':')
                .map(|c| c.to_ascii_lowercase())
                .collect(),
        )
    }

    /// Hex string form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Fingerprint {
    fn from(text: &str) -> Self {
        Fingerprint::parse(text)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A certificate usable (or displayable) for signing.
///
/// Built fresh by a backend on every enumeration and never mutated afterwards;
/// the `with_*` methods consume the value during construction.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    name: String,
    issuer: String,
    subject: String,
    serial_number: String,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    fingerprint: Fingerprint,
    key_usage: Vec<KeyUsage>,
    can_sign: bool,
    locator: Locator,
    requires_pin: bool,
    pin_optional: bool,
    key_algorithm: KeyAlgorithm,
    is_ca: bool,
    #[serde(skip)]
    der: Vec<u8>,
}

impl Certificate {
    /// Create a certificate with an unbounded validity window and no key usage.
    pub fn new(name: impl Into<String>, fingerprint: Fingerprint, locator: Locator) -> Self {
        Self {
            name: name.into(),
            issuer: String::new(),
            subject: String::new(),
            serial_number: String::new(),
            not_before: DateTime::<Utc>::MIN_UTC,
            not_after: DateTime::<Utc>::MAX_UTC,
            fingerprint,
            key_usage: Vec::new(),
            can_sign: false,
            locator,
            requires_pin: false,
            pin_optional: false,
            key_algorithm: KeyAlgorithm::Unknown,
            is_ca: false,
            der: Vec::new(),
        }
    }

    /// Set the issuer DN.
    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.issuer = issuer.into();
        self
    }

    /// Set the subject DN.
    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    /// Set the serial number (hex).
    pub fn with_serial_number(mut self, serial: impl Into<String>) -> Self {
        self.serial_number = serial.into();
        self
    }

    /// Set the validity window.
    pub fn with_validity(mut self, not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    /// Set the declared key usage.
    pub fn with_key_usage(mut self, usage: Vec<KeyUsage>) -> Self {
        self.key_usage = usage;
        self
    }

    /// Backend assertion that the certificate has a usable private key.
    pub fn with_can_sign(mut self, can_sign: bool) -> Self {
        self.can_sign = can_sign;
        self
    }

    /// Set the authentication contract.
    pub fn with_auth(mut self, auth: AuthContract) -> Self {
        self.requires_pin = auth.requires_pin;
        self.pin_optional = auth.pin_optional;
        self
    }

    /// Set the public key algorithm.
    pub fn with_key_algorithm(mut self, algorithm: KeyAlgorithm) -> Self {
        self.key_algorithm = algorithm;
        self
    }

    /// Mark as a CA certificate.
    pub fn with_ca(mut self, is_ca: bool) -> Self {
        self.is_ca = is_ca;
        self
    }

    /// Attach the DER encoding.
    pub fn with_der(mut self, der: Vec<u8>) -> Self {
        self.der = der;
        self
    }

    /// Display name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Issuer distinguished name.
    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Subject distinguished name.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Serial number as uppercase hex.
    pub fn serial_number(&self) -> &str {
        &self.serial_number
    }

    /// Start of the validity window.
    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    /// End of the validity window.
    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// Stable identity key.
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Declared key usage, in extension order.
    pub fn key_usage(&self) -> &[KeyUsage] {
        &self.key_usage
    }

    /// Explicit backend assertion of signing capability.
    pub fn can_sign(&self) -> bool {
        self.can_sign
    }

    /// Originating backend, derived from the locator.
    pub fn source(&self) -> CertificateSource {
        self.locator.source()
    }

    /// Backend-specific locator.
    pub fn locator(&self) -> &Locator {
        &self.locator
    }

    /// PKCS#12 path, for File certificates.
    pub fn file_path(&self) -> Option<&Path> {
        match &self.locator {
            Locator::File { path } => Some(path),
            _ => None,
        }
    }

    /// PKCS#11 URI, for Token certificates.
    pub fn token_uri(&self) -> Option<&str> {
        match &self.locator {
            Locator::Token { uri, .. } => Some(uri),
            _ => None,
        }
    }

    /// PKCS#11 module path, for Token certificates.
    pub fn token_module(&self) -> Option<&Path> {
        match &self.locator {
            Locator::Token { module, .. } => Some(module),
            _ => None,
        }
    }

    /// NSS nickname, for Store certificates.
    pub fn store_nickname(&self) -> Option<&str> {
        match &self.locator {
            Locator::Store { nickname } => Some(nickname),
            _ => None,
        }
    }

    /// Whether a PIN must be supplied to sign.
    pub fn requires_pin(&self) -> bool {
        self.requires_pin
    }

    /// Whether a PIN may be omitted.
    pub fn pin_optional(&self) -> bool {
        self.pin_optional
    }

    /// Public key algorithm.
    pub fn key_algorithm(&self) -> KeyAlgorithm {
        self.key_algorithm
    }

    /// Whether this is a CA certificate.
    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    /// DER encoding, empty when the backend did not provide one.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Case-insensitive exact match against the declared key usage names.
    pub fn has_key_usage(&self, usage: &str) -> bool {
        self.key_usage
            .iter()
            .any(|u| u.name().eq_ignore_ascii_case(usage))
    }

    /// Whether the certificate may be offered for signing.
    ///
    /// Tokens often cannot parse key usage reliably and assert capability
    /// through `can_sign` instead, which takes precedence.
    pub fn has_signing_capability(&self) -> bool {
        if self.can_sign {
            return true;
        }
        self.has_key_usage("Digital Signature") || self.has_key_usage("Non Repudiation")
    }

    /// Whether the certificate is inside its validity window right now.
    ///
    /// Recomputed on every call.
    pub fn is_valid(&self) -> bool {
        self.is_valid_at(Utc::now())
    }

    /// Whether `at` falls inside the validity window (inclusive).
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.not_before <= at && at <= self.not_after
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn file_cert(usage: Vec<KeyUsage>) -> Certificate {
        Certificate::new(
            "Alice",
            Fingerprint::parse("AB:CD"),
            Locator::File {
                path: PathBuf::from("/tmp/alice.p12"),
            },
        )
        .with_key_usage(usage)
    }

    #[test]
    fn test_source_preference_order() {
        assert!(CertificateSource::Store.preference() < CertificateSource::Token.preference());
        assert!(CertificateSource::Token.preference() < CertificateSource::File.preference());
        assert_eq!(CertificateSource::ALL[0], CertificateSource::Store);
    }

    #[test]
    fn test_source_from_name() {
        assert_eq!(CertificateSource::from_name("pkcs11"), Some(CertificateSource::Token));
        assert_eq!(CertificateSource::from_name("NSS"), Some(CertificateSource::Store));
        assert_eq!(CertificateSource::from_name(" File "), Some(CertificateSource::File));
        assert_eq!(CertificateSource::from_name("keychain"), None);
    }

    #[test]
    fn test_has_key_usage_case_insensitive() {
        let cert = file_cert(vec![KeyUsage::DigitalSignature]);
        assert!(cert.has_key_usage("digital signature"));
        assert!(cert.has_key_usage("DIGITAL SIGNATURE"));
        assert!(!cert.has_key_usage("Digital"));
        assert!(!cert.has_key_usage("Key Encipherment"));
    }

    #[test]
    fn test_signing_capability_from_key_usage() {
        assert!(file_cert(vec![KeyUsage::NonRepudiation]).has_signing_capability());
        assert!(!file_cert(vec![KeyUsage::KeyEncipherment]).has_signing_capability());
    }

    #[test]
    fn test_signing_capability_override() {
        let cert = file_cert(vec![]).with_can_sign(true);
        assert!(cert.has_signing_capability());
    }

    #[test]
    fn test_validity_window() {
        let cert = file_cert(vec![]).with_validity(
            Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap(),
        );
        assert!(cert.is_valid_at(Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()));
        assert!(!cert.is_valid_at(Utc.with_ymd_and_hms(2031, 1, 1, 0, 0, 0).unwrap()));
        assert!(!cert.is_valid_at(Utc.with_ymd_and_hms(2022, 12, 31, 23, 59, 59).unwrap()));
    }

    #[test]
    fn test_locator_accessors() {
        let cert = Certificate::new(
            "Token cert",
            Fingerprint::parse("01"),
            Locator::Token {
                module: PathBuf::from("/usr/lib/opensc-pkcs11.so"),
                uri: "pkcs11:token=Card;object=Signing%20Key".to_string(),
            },
        );
        assert_eq!(cert.source(), CertificateSource::Token);
        assert!(cert.file_path().is_none());
        assert!(cert.store_nickname().is_none());
        assert_eq!(cert.token_uri(), Some("pkcs11:token=Card;object=Signing%20Key"));
        assert_eq!(cert.locator().label(), "Signing Key");
    }

    #[test]
    fn test_fingerprint_normalization() {
        assert_eq!(Fingerprint::parse("AB:cd 01").as_str(), "abcd01");
        assert_eq!(Fingerprint::from("FF"), Fingerprint::parse("ff"));
    }

    #[test]
    fn test_fingerprint_of_der_is_sha256_hex() {
        let fp = Fingerprint::of_der(b"");
        assert_eq!(
            fp.as_str(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_serialize_omits_der() {
        let cert = file_cert(vec![KeyUsage::DigitalSignature]).with_der(vec![0x30, 0x00]);
        let json = serde_json::to_value(&cert).unwrap();
        assert!(json.get("der").is_none());
        assert_eq!(json["keyUsage"][0], "Digital Signature");
        assert_eq!(json["locator"]["kind"], "file");
    }
}
