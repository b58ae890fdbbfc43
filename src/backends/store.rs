//! NSS certificate store backend.
//!
//! The NSS database is reached through an NSS-capable PKCS#11 module
//! (p11-kit proxy or `libsoftokn3`). The softoken is initialized with the
//! database directory as its `configdir`. Unlike tokens, the store is opened
//! once per process and the handle is shared by every [`StoreAdapter`];
//! logins on it are serialized by the handle's authentication lock.
//!
//! Listing never logs in. A certificate is listed when a private key or a
//! public key object carries the same `CKA_ID`.

use super::pkcs11::{
    locate_private_key, nss_parameters, CryptokiLoader, ModuleLoader, SessionSigner, TokenModule,
    TokenSession,
};
use super::BackendAdapter;
use crate::certificate::{AuthContract, Certificate, CertificateSource, Fingerprint, Locator};
use crate::config::CredentialConfig;
use crate::error::{Error, Result};
use crate::secret::SecretPin;
use crate::signing::Signer;
use lazy_static::lazy_static;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

lazy_static! {
    /// Process-wide NSS store handle.
    static ref GLOBAL_STORE: Arc<StoreHandleCell> = Arc::new(StoreHandleCell::new());
}

fn store_error(err: Error) -> Error {
    err.for_backend(CertificateSource::Store)
}

/// Whether `path` is the NSS softoken, whose key slot is the database itself.
pub fn is_softoken(path: &Path) -> bool {
    path.file_name()
        .and_then(|name| name.to_str())
        .map_or(false, |name| name.starts_with("libsoftokn"))
}

/// An initialized NSS store.
pub struct StoreHandle {
    module: Arc<dyn TokenModule>,
    db_dir: PathBuf,
    internal: bool,
    auth: Mutex<()>,
}

impl StoreHandle {
    /// Module the store is reached through.
    pub fn module(&self) -> &Arc<dyn TokenModule> {
        &self.module
    }

    /// NSS database directory.
    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    /// Whether the store is the softoken's own database rather than tokens
    /// proxied by another module.
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// Log in on `session`, one login at a time across the process.
    pub fn authenticate(&self, session: &mut dyn TokenSession, pin: &SecretPin) -> Result<()> {
        let _guard = self
            .auth
            .lock()
            .map_err(|_| Error::unavailable(CertificateSource::Store, "authentication lock poisoned"))?;
        session.login(pin).map_err(store_error)
    }
}

/// Holder for the store handle. Successful initialization is cached; a failed
/// one is retried on the next call.
#[derive(Default)]
pub struct StoreHandleCell {
    handle: Mutex<Option<Arc<StoreHandle>>>,
}

impl StoreHandleCell {
    /// An empty cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide cell used by [`StoreAdapter::new`].
    pub fn global() -> Arc<StoreHandleCell> {
        GLOBAL_STORE.clone()
    }

    /// Whether a handle has been initialized.
    pub fn is_initialized(&self) -> bool {
        self.handle.lock().map(|h| h.is_some()).unwrap_or(false)
    }

    /// Return the cached handle or open one.
    ///
    /// `Ok(None)` means no store is present (no database directory or no
    /// module installed).
    fn get_or_init(
        &self,
        db_dir: &Path,
        modules: &[PathBuf],
        loader: &dyn ModuleLoader,
    ) -> Result<Option<Arc<StoreHandle>>> {
        let mut cached = self
            .handle
            .lock()
            .map_err(|_| Error::unavailable(CertificateSource::Store, "store handle lock poisoned"))?;

        if let Some(handle) = cached.as_ref() {
            if handle.db_dir != db_dir {
                log::debug!(
                    "Store already open at {}, ignoring {}",
                    handle.db_dir.display(),
                    db_dir.display()
                );
            }
            return Ok(Some(handle.clone()));
        }

        if !db_dir.is_dir() {
            log::debug!("NSS database {} does not exist", db_dir.display());
            return Ok(None);
        }

        let mut failures = Vec::new();
        for path in modules.iter().filter(|p| loader.exists(p)) {
            let internal = is_softoken(path);
            let loaded = if internal {
                loader.load_nss(path, &nss_parameters(db_dir))
            } else {
                loader.load(path)
            };
            match loaded {
                Ok(module) => {
                    log::info!(
                        "Opened NSS store {} through {}",
                        db_dir.display(),
                        path.display()
                    );
                    let handle = Arc::new(StoreHandle {
                        module,
                        db_dir: db_dir.to_path_buf(),
                        internal,
                        auth: Mutex::new(()),
                    });
                    *cached = Some(handle.clone());
                    return Ok(Some(handle));
                },
                Err(e) => {
                    log::warn!("Cannot open NSS module {}: {}", path.display(), e);
                    failures.push(format!("{}: {}", path.display(), e.detail()));
                },
            }
        }

        if failures.is_empty() {
            log::debug!("No NSS-capable PKCS#11 module installed");
            return Ok(None);
        }
        Err(Error::unavailable(CertificateSource::Store, failures.join("; ")))
    }
}

/// Backend for the NSS certificate store.
pub struct StoreAdapter {
    db_dir: Option<PathBuf>,
    modules: Vec<PathBuf>,
    loader: Arc<dyn ModuleLoader>,
    cell: Arc<StoreHandleCell>,
}

impl StoreAdapter {
    /// Use the process-wide store handle and the native loader.
    pub fn new(db_dir: Option<PathBuf>, modules: Vec<PathBuf>) -> Self {
        Self::with_loader(db_dir, modules, Arc::new(CryptokiLoader), StoreHandleCell::global())
    }

    /// Use a custom loader and handle cell.
    pub fn with_loader(
        db_dir: Option<PathBuf>,
        modules: Vec<PathBuf>,
        loader: Arc<dyn ModuleLoader>,
        cell: Arc<StoreHandleCell>,
    ) -> Self {
        Self {
            db_dir,
            modules,
            loader,
            cell,
        }
    }

    /// Use the configured database and modules, or the defaults.
    pub fn from_config(config: &CredentialConfig) -> Self {
        Self::new(config.effective_store_dir(), config.effective_store_modules())
    }

    fn handle(&self) -> Result<Option<Arc<StoreHandle>>> {
        match &self.db_dir {
            Some(dir) => self.cell.get_or_init(dir, &self.modules, self.loader.as_ref()),
            None => Ok(None),
        }
    }

    /// List certificates with a key from the public view of one slot.
    fn list_slot(session: &dyn TokenSession, out: &mut Vec<Certificate>) -> Result<()> {
        let mut key_ids = session.private_key_ids().unwrap_or_default();
        key_ids.extend(session.public_key_ids().unwrap_or_default());

        for object in session.certificates()? {
            if object.id.is_empty() || !key_ids.contains(&object.id) {
                log::debug!("Skipping '{}': no matching key", object.label);
                continue;
            }
            let locator = Locator::Store {
                nickname: object.label.clone(),
            };
            match Certificate::from_der(&object.der, locator, AuthContract::OPTIONAL) {
                Ok(cert) if cert.is_ca() => {
                    log::debug!("Skipping CA certificate '{}'", object.label)
                },
                Ok(cert) => {
                    let can_sign =
                        cert.has_key_usage("Digital Signature") || cert.has_key_usage("Non Repudiation");
                    out.push(cert.with_can_sign(can_sign));
                },
                Err(e) => log::warn!("Skipping store object '{}': {}", object.label, e),
            }
        }
        Ok(())
    }
}

impl BackendAdapter for StoreAdapter {
    fn source(&self) -> CertificateSource {
        CertificateSource::Store
    }

    fn name(&self) -> &str {
        "NSS store"
    }

    fn list_certificates(&self) -> Result<Vec<Certificate>> {
        let Some(handle) = self.handle()? else {
            return Ok(Vec::new());
        };
        let slots = handle.module().slots().map_err(store_error)?;

        let mut certs = Vec::new();
        for slot in slots {
            let mut session = match handle.module().open_session(slot.slot_id, false) {
                Ok(session) => session,
                Err(e) => {
                    log::warn!("Cannot open store slot '{}': {}", slot.label, e);
                    continue;
                },
            };
            let listed = Self::list_slot(session.as_ref(), &mut certs);
            session.close();
            if let Err(e) = listed {
                log::warn!("Cannot read store slot '{}': {}", slot.label, e);
            }
        }
        log::debug!("Found {} store certificates", certs.len());
        Ok(certs)
    }

    fn get_signer(&self, certificate: &Certificate, pin: SecretPin) -> Result<Box<dyn Signer>> {
        let nickname = certificate.store_nickname().ok_or_else(|| {
            Error::NotFound(format!("{} is not a store certificate", certificate.name()))
        })?;
        let handle = self
            .handle()?
            .ok_or_else(|| Error::unavailable(CertificateSource::Store, "NSS store not available"))?;
        let slots = handle.module().slots().map_err(store_error)?;

        for slot in slots {
            let mut session = match handle.module().open_session(slot.slot_id, true) {
                Ok(session) => session,
                Err(e) => {
                    log::warn!("Cannot open store slot '{}': {}", slot.label, e);
                    continue;
                },
            };

            let named: Vec<_> = session
                .certificates()
                .map_err(store_error)?
                .into_iter()
                .filter(|o| o.label == nickname)
                .collect();
            if named.is_empty() {
                session.close();
                continue;
            }
            let Some(object) = named
                .into_iter()
                .find(|o| Fingerprint::of_der(&o.der) == *certificate.fingerprint())
            else {
                session.close();
                return Err(Error::NotFound(format!(
                    "'{}' now names a different certificate",
                    nickname
                )));
            };

            // The empty password is only tried on the database's own key
            // slot, never on a proxied hardware token.
            let login = if !pin.is_empty() {
                handle.authenticate(session.as_mut(), &pin)
            } else if !slot.login_required {
                Ok(())
            } else if handle.is_internal() {
                handle.authenticate(session.as_mut(), &pin)
            } else {
                Err(Error::AuthenticationFailed)
            };
            if let Err(e) = login {
                session.close();
                return Err(e);
            }
            drop(pin);

            let key = match locate_private_key(session.as_mut(), &object.id, &object.label) {
                Ok(Some(key)) => key,
                Ok(None) => {
                    session.close();
                    return Err(Error::KeyNotFound(certificate.name().to_string()));
                },
                Err(e) => {
                    session.close();
                    return Err(store_error(e));
                },
            };

            log::info!("Opened store signer for '{}'", nickname);
            return Ok(Box::new(SessionSigner::new(
                certificate.clone(),
                handle.module().clone(),
                session,
                key,
            )));
        }

        Err(Error::NotFound(nickname.to_string()))
    }
}
