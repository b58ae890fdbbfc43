//! PKCS#11 hardware token backend.
//!
//! Every configured module that exists on disk is loaded on first use and
//! shared with later calls. Each slot holding a token contributes its
//! certificate objects, addressed by a `pkcs11:token=...;object=...` URI.

use super::pkcs11::{
    locate_private_key, token_uri, uri_component, CryptokiLoader, ModuleLoader, SessionSigner,
    TokenModule,
};
use super::BackendAdapter;
use crate::certificate::{AuthContract, Certificate, CertificateSource, Fingerprint, Locator};
use crate::config::CredentialConfig;
use crate::error::{Error, Result};
use crate::secret::SecretPin;
use crate::signing::Signer;
use std::path::PathBuf;
use std::sync::Arc;

/// Backend for PKCS#11 tokens.
pub struct TokenAdapter {
    modules: Vec<PathBuf>,
    loader: Arc<dyn ModuleLoader>,
}

impl TokenAdapter {
    /// Probe the given module paths with the native loader.
    pub fn new(modules: Vec<PathBuf>) -> Self {
        Self::with_loader(modules, Arc::new(CryptokiLoader))
    }

    /// Probe the given module paths with a custom loader.
    pub fn with_loader(modules: Vec<PathBuf>, loader: Arc<dyn ModuleLoader>) -> Self {
        Self { modules, loader }
    }

    /// Probe the configured modules, or the platform defaults.
    pub fn from_config(config: &CredentialConfig) -> Self {
        Self::new(config.effective_token_modules())
    }

    /// Module paths this adapter probes.
    pub fn modules(&self) -> &[PathBuf] {
        &self.modules
    }

    /// Load every module present on disk.
    ///
    /// Fails only when at least one module exists and none of them loads.
    fn load_modules(&self) -> Result<Vec<Arc<dyn TokenModule>>> {
        let mut loaded = Vec::new();
        let mut failures = Vec::new();

        for path in &self.modules {
            if !self.loader.exists(path) {
                log::debug!("PKCS#11 module {} not installed", path.display());
                continue;
            }
            match self.loader.load(path) {
                Ok(module) => loaded.push(module),
                Err(e) => {
                    log::warn!("Cannot load PKCS#11 module {}: {}", path.display(), e);
                    failures.push(format!("{}: {}", path.display(), e.detail()));
                },
            }
        }

        if loaded.is_empty() && !failures.is_empty() {
            return Err(Error::unavailable(CertificateSource::Token, failures.join("; ")));
        }
        Ok(loaded)
    }

    fn list_module(module: &dyn TokenModule, out: &mut Vec<Certificate>) {
        let slots = match module.slots() {
            Ok(slots) => slots,
            Err(e) => {
                log::warn!("Cannot list slots of {}: {}", module.path().display(), e);
                return;
            },
        };

        for slot in slots {
            let mut session = match module.open_session(slot.slot_id, false) {
                Ok(session) => session,
                Err(e) => {
                    log::warn!("Cannot open token '{}': {}", slot.label, e);
                    continue;
                },
            };

            match session.certificates() {
                Ok(objects) => {
                    for object in objects {
                        let locator = Locator::Token {
                            module: module.path().to_path_buf(),
                            uri: token_uri(&slot.label, &object.label),
                        };
                        match Certificate::from_der(&object.der, locator, AuthContract::REQUIRED) {
                            Ok(cert) if cert.is_ca() => {
                                log::debug!("Skipping CA certificate '{}' on token", cert.name())
                            },
                            Ok(cert) => out.push(cert.with_can_sign(true)),
                            Err(e) => {
                                log::warn!("Skipping object '{}' on '{}': {}", object.label, slot.label, e)
                            },
                        }
                    }
                },
                Err(e) => log::warn!("Cannot read certificates on '{}': {}", slot.label, e),
            }
            session.close();
        }
    }
}

impl BackendAdapter for TokenAdapter {
    fn source(&self) -> CertificateSource {
        CertificateSource::Token
    }

    fn name(&self) -> &str {
        "PKCS#11 tokens"
    }

    fn list_certificates(&self) -> Result<Vec<Certificate>> {
        let modules = self.load_modules()?;
        let mut certs = Vec::new();
        for module in &modules {
            Self::list_module(module.as_ref(), &mut certs);
        }
        log::debug!("Found {} token certificates", certs.len());
        Ok(certs)
    }

    fn get_signer(&self, certificate: &Certificate, pin: SecretPin) -> Result<Box<dyn Signer>> {
        let (module_path, uri) = match (certificate.token_module(), certificate.token_uri()) {
            (Some(module), Some(uri)) => (module, uri),
            _ => {
                return Err(Error::NotFound(format!(
                    "{} is not a token certificate",
                    certificate.name()
                )))
            },
        };

        if !self.loader.exists(module_path) {
            return Err(Error::unavailable(
                CertificateSource::Token,
                format!("{} is not installed", module_path.display()),
            ));
        }
        let module = self.loader.load(module_path)?;
        let slots = module.slots()?;

        let token_label = uri_component(uri, "token");
        let candidates: Vec<_> = match &token_label {
            Some(label) if slots.iter().any(|s| &s.label == label) => {
                slots.into_iter().filter(|s| &s.label == label).collect()
            },
            _ => slots,
        };

        for slot in candidates {
            let mut session = match module.open_session(slot.slot_id, true) {
                Ok(session) => session,
                Err(e) => {
                    log::warn!("Cannot open token '{}': {}", slot.label, e);
                    continue;
                },
            };

            let object = session
                .certificates()?
                .into_iter()
                .find(|o| Fingerprint::of_der(&o.der) == *certificate.fingerprint());
            let Some(object) = object else {
                session.close();
                continue;
            };

            if pin.is_empty() {
                if slot.login_required {
                    session.close();
                    return Err(Error::AuthenticationFailed);
                }
            } else if let Err(e) = session.login(&pin) {
                session.close();
                return Err(e);
            }
            drop(pin);

            let key = match locate_private_key(session.as_mut(), &object.id, &object.label)? {
                Some(key) => key,
                None => {
                    session.close();
                    return Err(Error::KeyNotFound(certificate.name().to_string()));
                },
            };

            log::info!("Opened token signer for {} on '{}'", certificate.name(), slot.label);
            return Ok(Box::new(SessionSigner::new(certificate.clone(), module, session, key)));
        }

        Err(Error::NotFound(uri.to_string()))
    }
}
