//! PKCS#12 file backend.
//!
//! Containers (`.p12`, `.pfx`) are discovered in a list of directories. A
//! container that opens with an empty password is listed from its own
//! contents and needs no PIN. A password-protected container is listed from a
//! sidecar certificate with the same stem (`.crt`, `.cer` or `.pem`) and
//! requires the password at signing time.

use super::BackendAdapter;
use crate::certificate::{
    certificate_bytes_to_der, AuthContract, Certificate, CertificateSource, Fingerprint, Locator,
};
use crate::config::{has_extension, CredentialConfig};
use crate::error::{Error, Result};
use crate::secret::SecretPin;
use crate::signing::{Signer, SoftwareKey, SoftwareSigner};
use p12_keystore::{KeyStore, KeyStoreEntry};
use std::fs;
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

/// Container file extensions.
pub const CONTAINER_EXTENSIONS: &[&str] = &["p12", "pfx"];

/// Sidecar certificate extensions, in lookup order.
pub const SIDECAR_EXTENSIONS: &[&str] = &["crt", "cer", "pem"];

/// One private key and its certificate chain, copied out of a container.
struct Identity {
    /// Leaf certificate, DER
    leaf: Vec<u8>,
    /// PKCS#8 private key, wiped on drop
    key: Zeroizing<Vec<u8>>,
}

/// Decrypt a container and collect its key entries.
///
/// A wrong password and a corrupt container are indistinguishable here, so
/// both surface as `AuthenticationFailed`.
fn open_container(data: &[u8], password: &str) -> Result<Vec<Identity>> {
    let keystore =
        KeyStore::from_pkcs12(data, password).map_err(|_| Error::AuthenticationFailed)?;

    let mut identities = Vec::new();
    for (alias, entry) in keystore.entries() {
        if let KeyStoreEntry::PrivateKeyChain(chain) = entry {
            // The entity certificate comes first in the chain.
            match chain.chain().first() {
                Some(leaf) => identities.push(Identity {
                    leaf: leaf.as_der().to_vec(),
                    key: Zeroizing::new(chain.key().to_vec()),
                }),
                None => log::debug!("Key entry '{}' has no certificate", alias),
            }
        }
    }
    Ok(identities)
}

/// Find a sidecar certificate next to `container`.
fn sidecar_certificate(container: &Path) -> Option<(PathBuf, Vec<u8>)> {
    SIDECAR_EXTENSIONS.iter().find_map(|ext| {
        let candidate = container.with_extension(ext);
        let data = fs::read(&candidate).ok()?;
        match certificate_bytes_to_der(&data) {
            Ok(der) => Some((candidate, der)),
            Err(e) => {
                log::warn!("Ignoring sidecar {}: {}", candidate.display(), e);
                None
            },
        }
    })
}

/// Backend for PKCS#12 containers on disk.
#[derive(Debug, Clone)]
pub struct FileAdapter {
    dirs: Vec<PathBuf>,
}

impl FileAdapter {
    /// Scan the given directories.
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// Scan the configured directories, or the defaults.
    pub fn from_config(config: &CredentialConfig) -> Self {
        Self::new(config.effective_certificate_dirs())
    }

    /// Directories this adapter scans.
    pub fn directories(&self) -> &[PathBuf] {
        &self.dirs
    }

    fn containers_in(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut paths: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| path.is_file() && has_extension(path, CONTAINER_EXTENSIONS))
            .collect();
        paths.sort();
        Ok(paths)
    }

    /// Build the listing entry for one container, if it yields one.
    fn describe(&self, path: &Path) -> Result<Option<Certificate>> {
        let data = fs::read(path)?;
        let locator = Locator::File {
            path: path.to_path_buf(),
        };

        if let Ok(identities) = open_container(&data, "") {
            let Some(identity) = identities.first() else {
                log::info!("Skipping {}: no private key in container", path.display());
                return Ok(None);
            };
            if identities.len() > 1 {
                log::debug!(
                    "{} holds {} keys, listing the first",
                    path.display(),
                    identities.len()
                );
            }
            let cert = Certificate::from_der(&identity.leaf, locator, AuthContract::OPTIONAL)?
                .with_can_sign(true);
            return Ok(Some(cert));
        }

        match sidecar_certificate(path) {
            Some((sidecar, der)) => {
                log::debug!("Using sidecar {} for {}", sidecar.display(), path.display());
                let cert = Certificate::from_der(&der, locator, AuthContract::REQUIRED)?
                    .with_can_sign(true);
                Ok(Some(cert))
            },
            None => {
                log::info!(
                    "Skipping {}: password protected and no sidecar certificate",
                    path.display()
                );
                Ok(None)
            },
        }
    }
}

impl BackendAdapter for FileAdapter {
    fn source(&self) -> CertificateSource {
        CertificateSource::File
    }

    fn name(&self) -> &str {
        "PKCS#12 files"
    }

    fn list_certificates(&self) -> Result<Vec<Certificate>> {
        let mut certs = Vec::new();
        let mut existing = 0usize;
        let mut failures = Vec::new();

        for dir in &self.dirs {
            if !dir.is_dir() {
                log::debug!("Certificate directory {} does not exist", dir.display());
                continue;
            }
            existing += 1;

            let containers = match Self::containers_in(dir) {
                Ok(paths) => paths,
                Err(e) => {
                    log::warn!("Cannot read {}: {}", dir.display(), e);
                    failures.push(format!("{}: {}", dir.display(), e));
                    continue;
                },
            };

            for path in containers {
                match self.describe(&path) {
                    Ok(Some(cert)) if cert.is_ca() => {
                        log::info!("Skipping CA certificate in {}", path.display());
                    },
                    Ok(Some(cert)) => {
                        log::debug!("Found {} in {}", cert.name(), path.display());
                        certs.push(cert);
                    },
                    Ok(None) => {},
                    Err(e) => log::warn!("Skipping {}: {}", path.display(), e),
                }
            }
        }

        if existing > 0 && failures.len() == existing {
            return Err(Error::unavailable(CertificateSource::File, failures.join("; ")));
        }
        Ok(certs)
    }

    fn get_signer(&self, certificate: &Certificate, pin: SecretPin) -> Result<Box<dyn Signer>> {
        let path = certificate
            .file_path()
            .ok_or_else(|| Error::NotFound(format!("{} is not a file certificate", certificate.name())))?;
        if !path.is_file() {
            return Err(Error::NotFound(path.display().to_string()));
        }

        let data = fs::read(path)
            .map_err(|e| Error::unavailable(CertificateSource::File, e.to_string()))?;
        let identities = match open_container(&data, pin.expose_str()?) {
            // A container without a password accepts any PIN the user typed.
            Err(Error::AuthenticationFailed) if !pin.is_empty() && certificate.pin_optional() => {
                log::debug!("Retrying {} with the empty password", path.display());
                open_container(&data, "")?
            },
            result => result?,
        };
        drop(pin);

        if identities.is_empty() {
            return Err(Error::KeyNotFound(certificate.name().to_string()));
        }
        let identity = identities
            .iter()
            .find(|id| Fingerprint::of_der(&id.leaf) == *certificate.fingerprint())
            .ok_or_else(|| {
                Error::NotFound(format!("{} no longer holds {}", path.display(), certificate.name()))
            })?;

        let key = SoftwareKey::from_der(&identity.key)?;
        log::info!("Opened {} key for {}", key.algorithm_name(), certificate.name());
        Ok(Box::new(SoftwareSigner::new(certificate.clone(), key)))
    }
}
