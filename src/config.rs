//! Configuration for credential discovery.
//!
//! The crate never reads configuration files itself. A configuration
//! collaborator deserializes [`CredentialConfig`] (for example with
//! [`CredentialConfig::from_json`]) or builds it with the `with_*` methods.
//! Empty lists and unset paths fall back to the platform defaults below.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default PKCS#11 modules probed for hardware tokens.
pub const DEFAULT_TOKEN_MODULES: &[&str] = &[
    "/usr/lib/libbit4xpki.so",
    "/usr/lib/libbit4ipki.so",
    "/usr/lib/x86_64-linux-gnu/opensc-pkcs11.so",
    "/usr/lib/opensc-pkcs11.so",
    "/usr/lib/pkcs11/opensc-pkcs11.so",
    "/usr/lib/x86_64-linux-gnu/pkcs11/p11-kit-client.so",
    "/usr/lib/pkcs11/p11-kit-client.so",
];

/// Default NSS-capable PKCS#11 modules, in probe order.
pub const DEFAULT_STORE_MODULES: &[&str] = &[
    "/usr/lib/x86_64-linux-gnu/p11-kit-proxy.so",
    "/usr/lib/x86_64-linux-gnu/nss/libsoftokn3.so",
    "/usr/lib/x86_64-linux-gnu/libsoftokn3.so",
    "/usr/lib64/libsoftokn3.so",
    "/usr/lib/libsoftokn3.so",
    "/usr/lib/firefox/libsoftokn3.so",
];

/// Default certificate directories, relative to the home directory.
pub const DEFAULT_CERTIFICATE_DIRS: &[&str] =
    &[".config/certificates", ".mozilla/certificates", "certificates"];

/// Default NSS database directory, relative to the home directory.
pub const DEFAULT_STORE_DIR: &str = ".pki/nssdb";

/// Enumeration roots and limits for the three backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CredentialConfig {
    /// Directories scanned for PKCS#12 containers
    pub certificate_dirs: Vec<PathBuf>,

    /// PKCS#11 modules probed for tokens
    pub token_modules: Vec<PathBuf>,

    /// NSS database directory
    pub store_dir: Option<PathBuf>,

    /// NSS-capable PKCS#11 modules
    pub store_modules: Vec<PathBuf>,

    /// Default deadline for a full enumeration, in milliseconds
    pub enumeration_timeout_ms: Option<u64>,
}

impl CredentialConfig {
    /// Create a configuration that uses every default.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse the collaborator-supplied JSON form.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    /// Add a certificate directory.
    pub fn with_certificate_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.certificate_dirs.push(dir.into());
        self
    }

    /// Add a token module.
    pub fn with_token_module(mut self, module: impl Into<PathBuf>) -> Self {
        self.token_modules.push(module.into());
        self
    }

    /// Set the NSS database directory.
    pub fn with_store_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.store_dir = Some(dir.into());
        self
    }

    /// Add an NSS-capable module.
    pub fn with_store_module(mut self, module: impl Into<PathBuf>) -> Self {
        self.store_modules.push(module.into());
        self
    }

    /// Set the default enumeration deadline.
    pub fn with_enumeration_timeout(mut self, timeout: Duration) -> Self {
        self.enumeration_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Certificate directories to scan, defaults applied.
    pub fn effective_certificate_dirs(&self) -> Vec<PathBuf> {
        if !self.certificate_dirs.is_empty() {
            return self.certificate_dirs.clone();
        }
        match home_dir() {
            Some(home) => DEFAULT_CERTIFICATE_DIRS.iter().map(|d| home.join(d)).collect(),
            None => Vec::new(),
        }
    }

    /// Token modules to probe, defaults applied.
    pub fn effective_token_modules(&self) -> Vec<PathBuf> {
        or_defaults(&self.token_modules, DEFAULT_TOKEN_MODULES)
    }

    /// NSS database directory, default applied.
    pub fn effective_store_dir(&self) -> Option<PathBuf> {
        self.store_dir
            .clone()
            .or_else(|| home_dir().map(|home| home.join(DEFAULT_STORE_DIR)))
    }

    /// NSS-capable modules to probe, defaults applied.
    pub fn effective_store_modules(&self) -> Vec<PathBuf> {
        or_defaults(&self.store_modules, DEFAULT_STORE_MODULES)
    }

    /// Enumeration deadline, if one is configured.
    pub fn enumeration_timeout(&self) -> Option<Duration> {
        self.enumeration_timeout_ms.map(Duration::from_millis)
    }
}

fn or_defaults(configured: &[PathBuf], defaults: &[&str]) -> Vec<PathBuf> {
    if configured.is_empty() {
        defaults.iter().map(PathBuf::from).collect()
    } else {
        configured.to_vec()
    }
}

fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .filter(|h| !h.is_empty())
        .map(PathBuf::from)
}

/// Whether `path` has one of `extensions` (case-insensitive, without dot).
pub(crate) fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| extensions.iter().any(|x| e.eq_ignore_ascii_case(x)))
        .unwrap_or(false)
}
