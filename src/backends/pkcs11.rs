//! PKCS#11 session layer shared by the token and store backends.
//!
//! The adapters talk to tokens through three small traits ([`ModuleLoader`],
//! [`TokenModule`], [`TokenSession`]) so that they can be driven by an
//! in-memory module in tests. The native implementation is built on
//! `cryptoki`.
//!
//! A PKCS#11 library is initialized once per process, and finalizing it
//! invalidates every session opened through it. Native modules are therefore
//! loaded once per library path and shared through [`ModuleCache`].

use crate::certificate::{Certificate, CertificateSource, KeyAlgorithm};
use crate::error::{Error, Result};
use crate::secret::SecretPin;
use crate::signing::{PrehashedDigest, Signer};
use cryptoki::context::{CInitializeArgs, Pkcs11};
use cryptoki::error::{Error as CkError, Rv, RvError};
use cryptoki::mechanism::Mechanism;
use cryptoki::object::{Attribute, AttributeType, ObjectClass, ObjectHandle};
use cryptoki::session::{Session, UserType};
use cryptoki::slot::Slot;
use cryptoki::types::AuthPin;
use lazy_static::lazy_static;
use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

lazy_static! {
    /// Native modules loaded by this process.
    static ref GLOBAL_MODULES: ModuleCache = ModuleCache::new();
}

/// A slot that currently holds a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotToken {
    /// PKCS#11 slot identifier
    pub slot_id: u64,
    /// Token label, trimmed
    pub label: String,
    /// Whether the token requires `C_Login` before private objects are visible
    pub login_required: bool,
}

/// A certificate object read from a token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenObject {
    /// `CKA_VALUE`: DER certificate
    pub der: Vec<u8>,
    /// `CKA_LABEL`
    pub label: String,
    /// `CKA_ID`, shared with the matching private key
    pub id: Vec<u8>,
}

/// Session-local reference to a private key object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyHandle(pub u64);

/// Which private keys to search for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyQuery<'a> {
    /// Keys whose `CKA_ID` equals the value
    Id(&'a [u8]),
    /// Keys whose `CKA_LABEL` equals the value
    Label(&'a str),
    /// Every private key on the token
    Any,
}

/// Raw signing mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignMechanism {
    /// `CKM_RSA_PKCS`: the caller supplies an encoded DigestInfo
    RsaPkcs,
    /// `CKM_ECDSA`: the caller supplies the digest, the token returns `r || s`
    Ecdsa,
}

/// Loads PKCS#11 modules from shared-library paths.
pub trait ModuleLoader: Send + Sync {
    /// Whether a module is installed at `path`.
    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }

    /// Load and initialize the module at `path`.
    fn load(&self, path: &Path) -> Result<Arc<dyn TokenModule>>;

    /// Load the NSS softoken, handing `parameters` (`configdir=...`) to
    /// `C_Initialize`.
    fn load_nss(&self, path: &Path, parameters: &str) -> Result<Arc<dyn TokenModule>>;
}

/// Loaded modules keyed by canonical library path.
#[derive(Default)]
pub struct ModuleCache {
    modules: Mutex<HashMap<PathBuf, Arc<dyn TokenModule>>>,
}

impl ModuleCache {
    /// An empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// The cache behind [`CryptokiLoader`].
    pub fn global() -> &'static ModuleCache {
        &GLOBAL_MODULES
    }

    /// Return the module loaded from `path`, or load it with `load`.
    ///
    /// Symlinks and relative paths resolve to the same entry. A failed load is
    /// not cached.
    pub fn get_or_load<F>(&self, path: &Path, load: F) -> Result<Arc<dyn TokenModule>>
    where
        F: FnOnce(&Path) -> Result<Arc<dyn TokenModule>>,
    {
        let key = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        let mut modules = self
            .modules
            .lock()
            .map_err(|_| Error::unavailable(CertificateSource::Token, "module cache lock poisoned"))?;
        if let Some(module) = modules.get(&key) {
            return Ok(module.clone());
        }
        let module = load(path)?;
        modules.insert(key, module.clone());
        Ok(module)
    }

    /// Number of cached modules.
    pub fn len(&self) -> usize {
        self.modules.lock().map(|m| m.len()).unwrap_or(0)
    }

    /// Whether nothing has been loaded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A loaded, initialized PKCS#11 module.
pub trait TokenModule: Send + Sync {
    /// Library path the module was loaded from.
    fn path(&self) -> &Path;

    /// Slots that currently hold a token.
    fn slots(&self) -> Result<Vec<SlotToken>>;

    /// Open a session on `slot_id`.
    fn open_session(&self, slot_id: u64, read_write: bool) -> Result<Box<dyn TokenSession>>;
}

/// An open PKCS#11 session.
///
/// Dropping the session releases it; [`TokenSession::close`] does the same
/// eagerly and must be idempotent.
pub trait TokenSession: Send {
    /// All certificate objects visible in the session.
    fn certificates(&self) -> Result<Vec<TokenObject>>;

    /// Private keys matching `query`.
    fn find_private_keys(&mut self, query: KeyQuery<'_>) -> Result<Vec<KeyHandle>>;

    /// `CKA_ID` values of all visible private keys.
    fn private_key_ids(&self) -> Result<Vec<Vec<u8>>>;

    /// `CKA_ID` values of all public key objects. Readable without login.
    fn public_key_ids(&self) -> Result<Vec<Vec<u8>>>;

    /// `C_Login` as `CKU_USER`. "Already logged in" counts as success.
    fn login(&mut self, pin: &SecretPin) -> Result<()>;

    /// Sign `data` with a raw mechanism.
    fn sign(&self, key: KeyHandle, mechanism: SignMechanism, data: &[u8]) -> Result<Vec<u8>>;

    /// Log out and close the session.
    fn close(&mut self);
}

/// Build a `pkcs11:` URI naming a token object.
pub fn token_uri(token_label: &str, object_label: &str) -> String {
    format!(
        "pkcs11:token={};object={}",
        percent_encode(token_label),
        percent_encode(object_label)
    )
}

/// Read one path attribute (`token`, `object`, ...) from a `pkcs11:` URI.
pub fn uri_component(uri: &str, key: &str) -> Option<String> {
    let path = uri.strip_prefix("pkcs11:")?;
    let path = path.split('?').next().unwrap_or(path);
    path.split(';').find_map(|attr| {
        let (k, v) = attr.split_once('=')?;
        if k == key {
            Some(percent_decode(v))
        } else {
            None
        }
    })
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' | b'@' | b'&' => {
                out.push(byte as char)
            },
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 3 <= bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Find the private key belonging to a certificate object.
///
/// Lookup order: matching `CKA_ID`, then matching `CKA_LABEL`, then the only
/// private key on the token if there is exactly one.
pub fn locate_private_key(
    session: &mut dyn TokenSession,
    id: &[u8],
    label: &str,
) -> Result<Option<KeyHandle>> {
    if !id.is_empty() {
        if let Some(key) = session.find_private_keys(KeyQuery::Id(id))?.into_iter().next() {
            return Ok(Some(key));
        }
    }
    if !label.is_empty() {
        if let Some(key) = session
            .find_private_keys(KeyQuery::Label(label))?
            .into_iter()
            .next()
        {
            log::debug!("Private key for '{}' found by label", label);
            return Ok(Some(key));
        }
    }
    let all = session.find_private_keys(KeyQuery::Any)?;
    if all.len() == 1 {
        log::debug!("Using the only private key on the token for '{}'", label);
        return Ok(all.into_iter().next());
    }
    Ok(None)
}

/// Signer backed by an open PKCS#11 session.
///
/// Shared by the token and store backends. Keeps the module loaded for as
/// long as the session is open.
pub struct SessionSigner {
    certificate: Certificate,
    session: Option<Box<dyn TokenSession>>,
    key: KeyHandle,
    _module: Arc<dyn TokenModule>,
}

impl SessionSigner {
    /// Wrap an authenticated session and the key to sign with.
    pub fn new(
        certificate: Certificate,
        module: Arc<dyn TokenModule>,
        session: Box<dyn TokenSession>,
        key: KeyHandle,
    ) -> Self {
        Self {
            certificate,
            session: Some(session),
            key,
            _module: module,
        }
    }
}

impl Signer for SessionSigner {
    fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    fn sign(&mut self, digest: &PrehashedDigest) -> Result<Vec<u8>> {
        let session = self.session.as_ref().ok_or(Error::SignerClosed)?;
        match self.certificate.key_algorithm() {
            KeyAlgorithm::Rsa { .. } => {
                session.sign(self.key, SignMechanism::RsaPkcs, &digest.digest_info())
            },
            KeyAlgorithm::EcdsaP256 => {
                let raw = session.sign(self.key, SignMechanism::Ecdsa, digest.as_bytes())?;
                let sig = p256::ecdsa::Signature::from_slice(&raw)
                    .map_err(|e| Error::SigningFailed(format!("bad ECDSA output: {}", e)))?;
                Ok(sig.to_der().as_bytes().to_vec())
            },
            KeyAlgorithm::EcdsaP384 => {
                let raw = session.sign(self.key, SignMechanism::Ecdsa, digest.as_bytes())?;
                let sig = p384::ecdsa::Signature::from_slice(&raw)
                    .map_err(|e| Error::SigningFailed(format!("bad ECDSA output: {}", e)))?;
                Ok(sig.to_der().as_bytes().to_vec())
            },
            KeyAlgorithm::Unknown => Err(Error::UnsupportedAlgorithm(format!(
                "cannot sign with the key of '{}'",
                self.certificate.name()
            ))),
        }
    }

    fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.close();
            log::debug!("Closed PKCS#11 session for {}", self.certificate.name());
        }
    }

    fn is_closed(&self) -> bool {
        self.session.is_none()
    }
}

impl Drop for SessionSigner {
    fn drop(&mut self) {
        self.close();
    }
}

fn map_login_error(err: CkError) -> Error {
    match err {
        CkError::Pkcs11(
            RvError::PinIncorrect
            | RvError::PinInvalid
            | RvError::PinLenRange
            | RvError::PinExpired
            | RvError::PinLocked,
            ..
        ) => Error::AuthenticationFailed,
        other => backend_error("C_Login", other),
    }
}

/// Device, token and library failures. Only `C_Sign` reports `SigningFailed`.
fn backend_error(context: &str, err: CkError) -> Error {
    Error::unavailable(CertificateSource::Token, format!("{}: {}", context, err))
}

/// Loads modules with `cryptoki`, once per library for the whole process.
#[derive(Debug, Default, Clone, Copy)]
pub struct CryptokiLoader;

impl CryptokiLoader {
    fn open(path: &Path, nss_parameters: Option<&str>) -> Result<Arc<dyn TokenModule>> {
        let ctx = Pkcs11::new(path).map_err(|e| backend_error(&format!("cannot load {}", path.display()), e))?;
        match nss_parameters {
            Some(parameters) => initialize_nss(path, parameters)?,
            None => match ctx.initialize(CInitializeArgs::OsThreads) {
                Ok(()) | Err(CkError::AlreadyInitialized) => {},
                Err(CkError::Pkcs11(RvError::CryptokiAlreadyInitialized, ..)) => {},
                Err(e) => return Err(backend_error(&format!("cannot initialize {}", path.display()), e)),
            },
        }
        log::debug!("Loaded PKCS#11 module {}", path.display());
        Ok(Arc::new(CryptokiModule {
            path: path.to_path_buf(),
            ctx,
        }))
    }
}

impl ModuleLoader for CryptokiLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn TokenModule>> {
        ModuleCache::global().get_or_load(path, |path| Self::open(path, None))
    }

    fn load_nss(&self, path: &Path, parameters: &str) -> Result<Arc<dyn TokenModule>> {
        ModuleCache::global().get_or_load(path, |path| Self::open(path, Some(parameters)))
    }
}

/// `CK_C_INITIALIZE_ARGS` as NSS lays it out: the standard reserved pointer
/// carries the library parameters and a reserved pointer follows.
#[repr(C)]
struct NssInitializeArgs {
    create_mutex: cryptoki_sys::CK_CREATEMUTEX,
    destroy_mutex: cryptoki_sys::CK_DESTROYMUTEX,
    lock_mutex: cryptoki_sys::CK_LOCKMUTEX,
    unlock_mutex: cryptoki_sys::CK_UNLOCKMUTEX,
    flags: cryptoki_sys::CK_FLAGS,
    library_parameters: *mut c_void,
    reserved: *mut c_void,
}

/// `C_Initialize` with NSS library parameters.
///
/// `cryptoki` always passes null parameters, which leaves the softoken
/// without a database. The caller must already hold a `cryptoki` context for
/// `path` so that the library stays mapped after the temporary handle here is
/// dropped.
fn initialize_nss(path: &Path, parameters: &str) -> Result<()> {
    let parameters = CString::new(parameters)
        .map_err(|_| Error::InvalidConfig("NSS parameters contain a NUL byte".to_string()))?;
    let mut args = NssInitializeArgs {
        create_mutex: None,
        destroy_mutex: None,
        lock_mutex: None,
        unlock_mutex: None,
        flags: cryptoki_sys::CKF_OS_LOCKING_OK,
        library_parameters: parameters.as_ptr() as *mut c_void,
        reserved: std::ptr::null_mut(),
    };

    // SAFETY: `args` and `parameters` outlive the call, and the function
    // pointer comes from the library's own symbol table.
    let rv = unsafe {
        let library = cryptoki_sys::Pkcs11::new(path).map_err(|e| {
            Error::unavailable(
                CertificateSource::Store,
                format!("cannot load {}: {}", path.display(), e),
            )
        })?;
        library.C_Initialize(&mut args as *mut NssInitializeArgs as *mut c_void)
    };

    match Rv::from(rv) {
        Rv::Ok | Rv::Error(RvError::CryptokiAlreadyInitialized) => Ok(()),
        Rv::Error(e) => Err(Error::unavailable(
            CertificateSource::Store,
            format!("cannot initialize {}: {}", path.display(), e),
        )),
    }
}

/// Library parameters opening the NSS database in `db_dir`.
pub fn nss_parameters(db_dir: &Path) -> String {
    format!(
        "configdir='sql:{}' certPrefix='' keyPrefix='' secmod='secmod.db'",
        db_dir.display()
    )
}

/// A module loaded through `cryptoki`. Held by the module cache until exit.
pub struct CryptokiModule {
    path: PathBuf,
    ctx: Pkcs11,
}

impl CryptokiModule {
    fn slot(&self, slot_id: u64) -> Result<Slot> {
        self.ctx
            .get_slots_with_token()
            .map_err(|e| backend_error("C_GetSlotList", e))?
            .into_iter()
            .find(|s| s.id() == slot_id)
            .ok_or_else(|| Error::NotFound(format!("slot {} has no token", slot_id)))
    }
}

impl TokenModule for CryptokiModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn slots(&self) -> Result<Vec<SlotToken>> {
        let slots = self
            .ctx
            .get_slots_with_token()
            .map_err(|e| backend_error("C_GetSlotList", e))?;

        let mut out = Vec::with_capacity(slots.len());
        for slot in slots {
            match self.ctx.get_token_info(slot) {
                Ok(info) => out.push(SlotToken {
                    slot_id: slot.id(),
                    label: info.label().trim().to_string(),
                    login_required: info.login_required(),
                }),
                Err(e) => log::warn!("Skipping slot {}: {}", slot.id(), e),
            }
        }
        Ok(out)
    }

    fn open_session(&self, slot_id: u64, read_write: bool) -> Result<Box<dyn TokenSession>> {
        let slot = self.slot(slot_id)?;
        let session = if read_write {
            self.ctx.open_rw_session(slot)
        } else {
            self.ctx.open_ro_session(slot)
        }
        .map_err(|e| backend_error("C_OpenSession", e))?;

        Ok(Box::new(CryptokiSession {
            session: Some(session),
            keys: Vec::new(),
        }))
    }
}

/// A `cryptoki` session plus the key handles it has handed out.
pub struct CryptokiSession {
    session: Option<Session>,
    keys: Vec<ObjectHandle>,
}

impl CryptokiSession {
    fn session(&self) -> Result<&Session> {
        self.session.as_ref().ok_or(Error::SignerClosed)
    }

    fn read_label(attrs: &[Attribute]) -> String {
        attrs
            .iter()
            .find_map(|a| match a {
                Attribute::Label(l) => Some(String::from_utf8_lossy(l).trim().to_string()),
                _ => None,
            })
            .unwrap_or_default()
    }

    fn read_id(attrs: &[Attribute]) -> Vec<u8> {
        attrs
            .iter()
            .find_map(|a| match a {
                Attribute::Id(id) => Some(id.clone()),
                _ => None,
            })
            .unwrap_or_default()
    }

    fn key_ids(&self, class: ObjectClass) -> Result<Vec<Vec<u8>>> {
        let session = self.session()?;
        let handles = session
            .find_objects(&[Attribute::Class(class)])
            .map_err(|e| backend_error("C_FindObjects", e))?;

        let mut ids = Vec::with_capacity(handles.len());
        for handle in handles {
            match session.get_attributes(handle, &[AttributeType::Id]) {
                Ok(attrs) => ids.push(Self::read_id(&attrs)),
                Err(e) => log::debug!("Key object without readable CKA_ID: {}", e),
            }
        }
        Ok(ids)
    }

    fn key_template(query: KeyQuery<'_>) -> Vec<Attribute> {
        let mut template = vec![Attribute::Class(ObjectClass::PRIVATE_KEY)];
        match query {
            KeyQuery::Id(id) => template.push(Attribute::Id(id.to_vec())),
            KeyQuery::Label(label) => template.push(Attribute::Label(label.as_bytes().to_vec())),
            KeyQuery::Any => {},
        }
        template
    }
}

impl TokenSession for CryptokiSession {
    fn certificates(&self) -> Result<Vec<TokenObject>> {
        let session = self.session()?;
        let handles = session
            .find_objects(&[Attribute::Class(ObjectClass::CERTIFICATE)])
            .map_err(|e| backend_error("C_FindObjects", e))?;

        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            let attrs = match session.get_attributes(
                handle,
                &[AttributeType::Value, AttributeType::Label, AttributeType::Id],
            ) {
                Ok(attrs) => attrs,
                Err(e) => {
                    log::warn!("Skipping unreadable certificate object: {}", e);
                    continue;
                },
            };
            let der = attrs.iter().find_map(|a| match a {
                Attribute::Value(v) => Some(v.clone()),
                _ => None,
            });
            match der {
                Some(der) if !der.is_empty() => out.push(TokenObject {
                    der,
                    label: Self::read_label(&attrs),
                    id: Self::read_id(&attrs),
                }),
                _ => log::debug!("Certificate object without CKA_VALUE"),
            }
        }
        Ok(out)
    }

    fn find_private_keys(&mut self, query: KeyQuery<'_>) -> Result<Vec<KeyHandle>> {
        let found = self
            .session()?
            .find_objects(&Self::key_template(query))
            .map_err(|e| backend_error("C_FindObjects", e))?;

        // Object handles stay inside this session; callers get their index.
        let mut out = Vec::with_capacity(found.len());
        for handle in found {
            let idx = match self.keys.iter().position(|k| *k == handle) {
                Some(idx) => idx,
                None => {
                    self.keys.push(handle);
                    self.keys.len() - 1
                },
            };
            out.push(KeyHandle(idx as u64));
        }
        Ok(out)
    }

    fn private_key_ids(&self) -> Result<Vec<Vec<u8>>> {
        self.key_ids(ObjectClass::PRIVATE_KEY)
    }

    fn public_key_ids(&self) -> Result<Vec<Vec<u8>>> {
        self.key_ids(ObjectClass::PUBLIC_KEY)
    }

    fn login(&mut self, pin: &SecretPin) -> Result<()> {
        let session = self.session()?;
        let pin = AuthPin::new(pin.expose_str()?.to_string());
        match session.login(UserType::User, Some(&pin)) {
            Ok(()) | Err(CkError::Pkcs11(RvError::UserAlreadyLoggedIn, ..)) => Ok(()),
            Err(e) => Err(map_login_error(e)),
        }
    }

    fn sign(&self, key: KeyHandle, mechanism: SignMechanism, data: &[u8]) -> Result<Vec<u8>> {
        let session = self.session()?;
        let handle = self
            .keys
            .get(key.0 as usize)
            .copied()
            .ok_or_else(|| Error::KeyNotFound(format!("key handle {}", key.0)))?;
        let mechanism = match mechanism {
            SignMechanism::RsaPkcs => Mechanism::RsaPkcs,
            SignMechanism::Ecdsa => Mechanism::Ecdsa,
        };
        session
            .sign(&mechanism, handle, data)
            .map_err(|e| Error::SigningFailed(format!("C_Sign: {}", e)))
    }

    fn close(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.logout() {
                log::debug!("C_Logout: {}", e);
            }
        }
        self.keys.clear();
    }
}

impl Drop for CryptokiSession {
    fn drop(&mut self) {
        self.close();
    }
}
