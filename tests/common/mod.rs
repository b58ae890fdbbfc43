//! Shared fixtures: an in-memory PKCS#11 module, scripted adapters and
//! certificate minting.

#![allow(dead_code)]

use pdf_credentials::backends::pkcs11::{
    KeyHandle, KeyQuery, ModuleLoader, SignMechanism, SlotToken, TokenModule, TokenObject,
    TokenSession,
};
use pdf_credentials::backends::BackendAdapter;
use pdf_credentials::certificate::{AuthContract, Certificate, CertificateSource, Locator};
use pdf_credentials::error::{Error, Result};
use pdf_credentials::secret::SecretPin;
use pdf_credentials::signing::{DigestAlgorithm, PrehashedDigest, Signer, SoftwareKey};
use rcgen::{
    BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use signature::hazmat::PrehashSigner;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Certificates
// ---------------------------------------------------------------------------

/// A certificate and its PKCS#8 private key.
pub struct Minted {
    pub der: Vec<u8>,
    pub key_der: Vec<u8>,
    pub key_pair: KeyPair,
    pub params: CertificateParams,
}

/// Key type of a minted certificate.
#[derive(Debug, Clone, Copy)]
pub enum KeyType {
    P256,
    P384,
    Rsa2048,
}

pub struct MintOptions {
    pub common_name: String,
    pub key_type: KeyType,
    pub serial: Vec<u8>,
    pub not_before: (i32, u8, u8),
    pub not_after: (i32, u8, u8),
    pub key_usages: Vec<KeyUsagePurpose>,
    pub is_ca: bool,
}

impl MintOptions {
    pub fn new(common_name: &str) -> Self {
        Self {
            common_name: common_name.to_string(),
            key_type: KeyType::P256,
            serial: vec![0x01],
            not_before: (2023, 1, 1),
            not_after: (2030, 1, 1),
            key_usages: vec![KeyUsagePurpose::DigitalSignature],
            is_ca: false,
        }
    }

    pub fn key_type(mut self, key_type: KeyType) -> Self {
        self.key_type = key_type;
        self
    }

    pub fn serial(mut self, serial: &[u8]) -> Self {
        self.serial = serial.to_vec();
        self
    }

    pub fn validity(mut self, not_before: (i32, u8, u8), not_after: (i32, u8, u8)) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    pub fn ca(mut self) -> Self {
        self.is_ca = true;
        self.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        self
    }

    fn params(&self) -> CertificateParams {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params
            .distinguished_name
            .push(DnType::CommonName, self.common_name.clone());
        params
            .distinguished_name
            .push(DnType::OrganizationName, "Example Org");
        params.serial_number = Some(SerialNumber::from(self.serial.clone()));
        params.not_before =
            rcgen::date_time_ymd(self.not_before.0, self.not_before.1, self.not_before.2);
        params.not_after =
            rcgen::date_time_ymd(self.not_after.0, self.not_after.1, self.not_after.2);
        params.key_usages = self.key_usages.clone();
        if self.is_ca {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        }
        params
    }

    fn key_pair(&self) -> KeyPair {
        match self.key_type {
            KeyType::P256 => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256).unwrap(),
            KeyType::P384 => KeyPair::generate_for(&rcgen::PKCS_ECDSA_P384_SHA384).unwrap(),
            // rcgen cannot generate RSA keys; one generated key serves every test.
            KeyType::Rsa2048 => {
                static RSA_KEY: OnceLock<Vec<u8>> = OnceLock::new();
                let der = RSA_KEY.get_or_init(|| {
                    use pkcs8::EncodePrivateKey;
                    let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 2048).unwrap();
                    key.to_pkcs8_der().unwrap().as_bytes().to_vec()
                });
                KeyPair::try_from(der.as_slice()).unwrap()
            },
        }
    }

    /// Self-signed certificate.
    pub fn self_signed(self) -> Minted {
        let params = self.params();
        let key_pair = self.key_pair();
        let cert = params.clone().self_signed(&key_pair).unwrap();
        Minted {
            der: cert.der().to_vec(),
            key_der: key_pair.serialize_der(),
            key_pair,
            params,
        }
    }

    /// Certificate issued by `issuer`.
    pub fn signed_by(self, issuer: &Minted) -> Minted {
        let params = self.params();
        let key_pair = self.key_pair();
        let issuer_cert = issuer.params.clone().self_signed(&issuer.key_pair).unwrap();
        let cert = params
            .clone()
            .signed_by(&key_pair, &issuer_cert, &issuer.key_pair)
            .unwrap();
        Minted {
            der: cert.der().to_vec(),
            key_der: key_pair.serialize_der(),
            key_pair,
            params,
        }
    }
}

/// Self-signed P-256 signing certificate.
pub fn mint(common_name: &str) -> Minted {
    MintOptions::new(common_name).self_signed()
}

// ---------------------------------------------------------------------------
// In-memory PKCS#11 module
// ---------------------------------------------------------------------------

/// Private key held by the fake token.
#[derive(Clone)]
pub enum FakeKey {
    P256(p256::ecdsa::SigningKey),
    P384(p384::ecdsa::SigningKey),
    Rsa(rsa::RsaPrivateKey),
}

impl FakeKey {
    pub fn from_minted(minted: &Minted) -> Self {
        use pkcs8::DecodePrivateKey;
        if let Ok(key) = p256::ecdsa::SigningKey::from_pkcs8_der(&minted.key_der) {
            return FakeKey::P256(key);
        }
        if let Ok(key) = p384::ecdsa::SigningKey::from_pkcs8_der(&minted.key_der) {
            return FakeKey::P384(key);
        }
        FakeKey::Rsa(rsa::RsaPrivateKey::from_pkcs8_der(&minted.key_der).unwrap())
    }

    /// `CKM_ECDSA` returns raw `r || s`; `CKM_RSA_PKCS` pads the supplied
    /// DigestInfo without adding a prefix.
    fn sign(&self, mechanism: SignMechanism, data: &[u8]) -> Result<Vec<u8>> {
        let failed = |e: &dyn std::fmt::Display| Error::SigningFailed(e.to_string());
        match (self, mechanism) {
            (FakeKey::P256(key), SignMechanism::Ecdsa) => {
                let sig: p256::ecdsa::Signature = key.sign_prehash(data).map_err(|e| failed(&e))?;
                Ok(sig.to_bytes().to_vec())
            },
            (FakeKey::P384(key), SignMechanism::Ecdsa) => {
                let sig: p384::ecdsa::Signature = key.sign_prehash(data).map_err(|e| failed(&e))?;
                Ok(sig.to_bytes().to_vec())
            },
            (FakeKey::Rsa(key), SignMechanism::RsaPkcs) => key
                .sign(rsa::Pkcs1v15Sign::new_unprefixed(), data)
                .map_err(|e| failed(&e)),
            _ => Err(Error::SigningFailed("CKR_KEY_TYPE_INCONSISTENT".to_string())),
        }
    }
}

#[derive(Clone)]
pub struct FakeObject {
    pub der: Vec<u8>,
    pub label: String,
    pub id: Vec<u8>,
    pub key: Option<FakeKey>,
    /// Public key object under the same `CKA_ID`, visible without login
    pub public_key: bool,
}

impl FakeObject {
    /// Certificate with its private key under the same `CKA_ID`.
    pub fn with_key(minted: &Minted, label: &str, id: &[u8]) -> Self {
        Self {
            der: minted.der.clone(),
            label: label.to_string(),
            id: id.to_vec(),
            key: Some(FakeKey::from_minted(minted)),
            public_key: true,
        }
    }

    /// Drop the public key object, leaving only the private key.
    pub fn without_public_key(mut self) -> Self {
        self.public_key = false;
        self
    }

    /// Certificate without a private key.
    pub fn certificate_only(minted: &Minted, label: &str, id: &[u8]) -> Self {
        Self {
            der: minted.der.clone(),
            label: label.to_string(),
            id: id.to_vec(),
            key: None,
            public_key: false,
        }
    }
}

#[derive(Clone)]
pub struct FakeSlot {
    pub slot_id: u64,
    pub label: String,
    pub pin: String,
    pub login_required: bool,
    pub objects: Vec<FakeObject>,
}

impl FakeSlot {
    pub fn new(slot_id: u64, label: &str, pin: &str) -> Self {
        Self {
            slot_id,
            label: label.to_string(),
            pin: pin.to_string(),
            login_required: true,
            objects: Vec::new(),
        }
    }

    pub fn without_login(mut self) -> Self {
        self.login_required = false;
        self
    }

    pub fn with_object(mut self, object: FakeObject) -> Self {
        self.objects.push(object);
        self
    }
}

/// Session bookkeeping shared between a module and the test.
#[derive(Default)]
pub struct SessionStats {
    pub opened: AtomicUsize,
    pub closed: AtomicUsize,
    pub logins: AtomicUsize,
    pub failed_logins: AtomicUsize,
}

impl SessionStats {
    pub fn open_sessions(&self) -> usize {
        self.opened.load(Ordering::SeqCst) - self.closed.load(Ordering::SeqCst)
    }

    pub fn login_attempts(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }
}

pub struct FakeModule {
    path: PathBuf,
    slots: Vec<FakeSlot>,
    pub stats: Arc<SessionStats>,
}

impl FakeModule {
    pub fn new(path: impl Into<PathBuf>, slots: Vec<FakeSlot>) -> Self {
        Self {
            path: path.into(),
            slots,
            stats: Arc::new(SessionStats::default()),
        }
    }
}

impl TokenModule for FakeModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn slots(&self) -> Result<Vec<SlotToken>> {
        Ok(self
            .slots
            .iter()
            .map(|s| SlotToken {
                slot_id: s.slot_id,
                label: s.label.clone(),
                login_required: s.login_required,
            })
            .collect())
    }

    fn open_session(&self, slot_id: u64, _read_write: bool) -> Result<Box<dyn TokenSession>> {
        let slot = self
            .slots
            .iter()
            .find(|s| s.slot_id == slot_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("slot {}", slot_id)))?;
        self.stats.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            slot,
            logged_in: false,
            open: true,
            stats: self.stats.clone(),
        }))
    }
}

pub struct FakeSession {
    slot: FakeSlot,
    logged_in: bool,
    open: bool,
    stats: Arc<SessionStats>,
}

impl FakeSession {
    fn keys_visible(&self) -> bool {
        self.logged_in || !self.slot.login_required
    }
}

impl TokenSession for FakeSession {
    fn certificates(&self) -> Result<Vec<TokenObject>> {
        Ok(self
            .slot
            .objects
            .iter()
            .map(|o| TokenObject {
                der: o.der.clone(),
                label: o.label.clone(),
                id: o.id.clone(),
            })
            .collect())
    }

    fn find_private_keys(&mut self, query: KeyQuery<'_>) -> Result<Vec<KeyHandle>> {
        if !self.keys_visible() {
            return Ok(Vec::new());
        }
        Ok(self
            .slot
            .objects
            .iter()
            .enumerate()
            .filter(|(_, o)| o.key.is_some())
            .filter(|(_, o)| match query {
                KeyQuery::Id(id) => o.id == id,
                KeyQuery::Label(label) => o.label == label,
                KeyQuery::Any => true,
            })
            .map(|(i, _)| KeyHandle(i as u64))
            .collect())
    }

    fn private_key_ids(&self) -> Result<Vec<Vec<u8>>> {
        if !self.keys_visible() {
            return Ok(Vec::new());
        }
        Ok(self
            .slot
            .objects
            .iter()
            .filter(|o| o.key.is_some())
            .map(|o| o.id.clone())
            .collect())
    }

    fn public_key_ids(&self) -> Result<Vec<Vec<u8>>> {
        Ok(self
            .slot
            .objects
            .iter()
            .filter(|o| o.public_key)
            .map(|o| o.id.clone())
            .collect())
    }

    fn login(&mut self, pin: &SecretPin) -> Result<()> {
        self.stats.logins.fetch_add(1, Ordering::SeqCst);
        if pin.expose() == self.slot.pin.as_bytes() {
            self.logged_in = true;
            Ok(())
        } else {
            self.stats.failed_logins.fetch_add(1, Ordering::SeqCst);
            Err(Error::AuthenticationFailed)
        }
    }

    fn sign(&self, key: KeyHandle, mechanism: SignMechanism, data: &[u8]) -> Result<Vec<u8>> {
        if !self.open {
            return Err(Error::SignerClosed);
        }
        let object = self
            .slot
            .objects
            .get(key.0 as usize)
            .ok_or_else(|| Error::KeyNotFound(format!("handle {}", key.0)))?;
        let key = object
            .key
            .as_ref()
            .ok_or_else(|| Error::KeyNotFound(object.label.clone()))?;
        key.sign(mechanism, data)
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.logged_in = false;
            self.stats.closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for FakeSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Loader serving [`FakeModule`]s by path and counting loads.
#[derive(Default)]
pub struct FakeLoader {
    modules: HashMap<PathBuf, Arc<FakeModule>>,
    broken: Vec<PathBuf>,
    pub loads: AtomicUsize,
    /// Library parameters passed to NSS softoken loads
    pub nss_parameters: Mutex<Vec<String>>,
}

impl FakeLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_module(mut self, module: FakeModule) -> Self {
        self.modules.insert(module.path.clone(), Arc::new(module));
        self
    }

    /// A path that exists but fails to load.
    pub fn with_broken(mut self, path: impl Into<PathBuf>) -> Self {
        self.broken.push(path.into());
        self
    }

    pub fn module(&self, path: impl AsRef<Path>) -> Arc<FakeModule> {
        self.modules[path.as_ref()].clone()
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

impl ModuleLoader for FakeLoader {
    fn exists(&self, path: &Path) -> bool {
        self.modules.contains_key(path) || self.broken.iter().any(|p| p == path)
    }

    fn load(&self, path: &Path) -> Result<Arc<dyn TokenModule>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        match self.modules.get(path) {
            Some(module) => Ok(module.clone()),
            None => Err(Error::unavailable(
                CertificateSource::Token,
                format!("CKR_GENERAL_ERROR loading {}", path.display()),
            )),
        }
    }

    fn load_nss(&self, path: &Path, parameters: &str) -> Result<Arc<dyn TokenModule>> {
        self.nss_parameters.lock().unwrap().push(parameters.to_string());
        self.load(path)
    }
}

// ---------------------------------------------------------------------------
// Scripted adapters
// ---------------------------------------------------------------------------

/// Adapter that returns a fixed listing, optionally after a delay, or fails.
pub struct ScriptedAdapter {
    pub source: CertificateSource,
    pub certs: Vec<Certificate>,
    pub delay: Option<Duration>,
    pub failure: Option<String>,
    pub signer_requests: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    pub fn new(source: CertificateSource, certs: Vec<Certificate>) -> Self {
        Self {
            source,
            certs,
            delay: None,
            failure: None,
            signer_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn failing(source: CertificateSource, reason: &str) -> Self {
        let mut adapter = Self::new(source, Vec::new());
        adapter.failure = Some(reason.to_string());
        adapter
    }
}

impl BackendAdapter for ScriptedAdapter {
    fn source(&self) -> CertificateSource {
        self.source
    }

    fn name(&self) -> &str {
        match self.source {
            CertificateSource::File => "scripted files",
            CertificateSource::Token => "scripted tokens",
            CertificateSource::Store => "scripted store",
        }
    }

    fn list_certificates(&self) -> Result<Vec<Certificate>> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        match &self.failure {
            Some(reason) => Err(Error::unavailable(self.source, reason.clone())),
            None => Ok(self.certs.clone()),
        }
    }

    fn get_signer(&self, certificate: &Certificate, _pin: SecretPin) -> Result<Box<dyn Signer>> {
        self.signer_requests
            .lock()
            .unwrap()
            .push(certificate.name().to_string());
        Err(Error::KeyNotFound(certificate.name().to_string()))
    }
}

/// Parse `minted` into a certificate located in `source`.
pub fn certificate_in(minted: &Minted, source: CertificateSource, label: &str) -> Certificate {
    let locator = match source {
        CertificateSource::File => Locator::File {
            path: PathBuf::from(format!("/certs/{}.p12", label)),
        },
        CertificateSource::Token => Locator::Token {
            module: PathBuf::from("/usr/lib/fake-pkcs11.so"),
            uri: format!("pkcs11:token=Card;object={}", label),
        },
        CertificateSource::Store => Locator::Store {
            nickname: label.to_string(),
        },
    };
    Certificate::from_der(&minted.der, locator, AuthContract::REQUIRED)
        .unwrap()
        .with_can_sign(true)
}

// ---------------------------------------------------------------------------
// CMS SignedData
// ---------------------------------------------------------------------------

const OID_DATA: &str = "1.2.840.113549.1.7.1";
const OID_SIGNED_DATA: &str = "1.2.840.113549.1.7.2";
const OID_MESSAGE_DIGEST: &str = "1.2.840.113549.1.9.4";
const OID_SIGNING_TIME: &str = "1.2.840.113549.1.9.5";
const OID_ECDSA_WITH_SHA256: &str = "1.2.840.10045.4.3.2";

/// Builds the DER `ContentInfo` a PDF signature carries in `/Contents`.
pub struct CmsBuilder<'a> {
    signer: &'a Minted,
    certificates: Vec<&'a Minted>,
    algorithm: DigestAlgorithm,
    content: Option<Vec<u8>>,
    signed_attributes: bool,
    signing_time: Option<chrono::DateTime<chrono::Utc>>,
}

impl<'a> CmsBuilder<'a> {
    /// Detached SHA-256 signature shipping only the signer certificate.
    pub fn new(signer: &'a Minted) -> Self {
        Self {
            signer,
            certificates: vec![signer],
            algorithm: DigestAlgorithm::Sha256,
            content: None,
            signed_attributes: false,
            signing_time: None,
        }
    }

    /// Ship another certificate with the signature.
    pub fn with_certificate(mut self, cert: &'a Minted) -> Self {
        self.certificates.push(cert);
        self
    }

    /// Encapsulate `content` instead of signing detached.
    pub fn with_content(mut self, content: &[u8]) -> Self {
        self.content = Some(content.to_vec());
        self
    }

    /// Sign a message-digest attribute (and signing time) instead of the
    /// content digest itself.
    pub fn with_signed_attributes(mut self, signing_time: Option<chrono::DateTime<chrono::Utc>>) -> Self {
        self.signed_attributes = true;
        self.signing_time = signing_time;
        self
    }

    /// Sign and encode. `document_digest` is used when no content is
    /// encapsulated; otherwise the digest of the content is signed.
    pub fn build(&self, document_digest: &[u8]) -> Vec<u8> {
        use cms::cert::x509::attr::Attribute;
        use cms::cert::x509::Certificate as CmsCertificate;
        use cms::cert::{CertificateChoices, IssuerAndSerialNumber};
        use cms::content_info::{CmsVersion, ContentInfo};
        use cms::signed_data::{
            CertificateSet, EncapsulatedContentInfo, SignedData, SignerIdentifier, SignerInfo,
            SignerInfos,
        };
        use der::asn1::{OctetString, SetOfVec, UtcTime};
        use der::{Any, Decode, Encode};
        use spki::{AlgorithmIdentifierOwned, ObjectIdentifier};

        let oid = |s: &str| ObjectIdentifier::new_unwrap(s);
        let content_digest = match &self.content {
            Some(content) => self.algorithm.digest(content),
            None => document_digest.to_vec(),
        };

        let mut attributes = SetOfVec::new();
        let signed_digest = if self.signed_attributes {
            let mut digest_values = SetOfVec::new();
            digest_values
                .insert(Any::encode_from(&OctetString::new(content_digest.clone()).unwrap()).unwrap())
                .unwrap();
            attributes
                .insert(Attribute {
                    oid: oid(OID_MESSAGE_DIGEST),
                    values: digest_values,
                })
                .unwrap();
            if let Some(time) = self.signing_time {
                let since_epoch = Duration::from_secs(time.timestamp() as u64);
                let mut time_values = SetOfVec::new();
                time_values
                    .insert(Any::encode_from(&UtcTime::from_unix_duration(since_epoch).unwrap()).unwrap())
                    .unwrap();
                attributes
                    .insert(Attribute {
                        oid: oid(OID_SIGNING_TIME),
                        values: time_values,
                    })
                    .unwrap();
            }
            self.algorithm.digest(&attributes.to_der().unwrap())
        } else {
            content_digest
        };

        let signature = SoftwareKey::from_der(&self.signer.key_der)
            .unwrap()
            .sign_prehashed(&PrehashedDigest::new(self.algorithm, signed_digest).unwrap())
            .unwrap();

        let signer_cert = CmsCertificate::from_der(&self.signer.der).unwrap();
        let digest_alg = AlgorithmIdentifierOwned {
            oid: oid(self.algorithm.oid_string()),
            parameters: None,
        };
        let signer_info = SignerInfo {
            version: CmsVersion::V1,
            sid: SignerIdentifier::IssuerAndSerialNumber(IssuerAndSerialNumber {
                issuer: signer_cert.tbs_certificate.issuer.clone(),
                serial_number: signer_cert.tbs_certificate.serial_number.clone(),
            }),
            digest_alg: digest_alg.clone(),
            signed_attrs: if self.signed_attributes { Some(attributes) } else { None },
            signature_algorithm: AlgorithmIdentifierOwned {
                oid: oid(OID_ECDSA_WITH_SHA256),
                parameters: None,
            },
            signature: OctetString::new(signature).unwrap(),
            unsigned_attrs: None,
        };

        let mut certificates = SetOfVec::new();
        for minted in &self.certificates {
            let cert = CmsCertificate::from_der(&minted.der).unwrap();
            certificates.insert(CertificateChoices::Certificate(cert)).unwrap();
        }
        let mut digest_algorithms = SetOfVec::new();
        digest_algorithms.insert(digest_alg).unwrap();
        let mut signer_infos = SetOfVec::new();
        signer_infos.insert(signer_info).unwrap();

        let signed_data = SignedData {
            version: CmsVersion::V1,
            digest_algorithms,
            encap_content_info: EncapsulatedContentInfo {
                econtent_type: oid(OID_DATA),
                econtent: self
                    .content
                    .as_ref()
                    .map(|content| Any::encode_from(&OctetString::new(content.clone()).unwrap()).unwrap()),
            },
            certificates: Some(CertificateSet(certificates)),
            crls: None,
            signer_infos: SignerInfos(signer_infos),
        };

        ContentInfo {
            content_type: oid(OID_SIGNED_DATA),
            content: Any::encode_from(&signed_data).unwrap(),
        }
        .to_der()
        .unwrap()
    }
}
