//! Credential backends.
//!
//! Each backend hides one storage technology behind [`BackendAdapter`]:
//!
//! - [`FileAdapter`]: PKCS#12 containers on disk
//! - [`TokenAdapter`]: PKCS#11 hardware tokens (smart cards, USB keys)
//! - [`StoreAdapter`]: the NSS certificate database
//!
//! Adapters open their storage only for the duration of a call. Absent
//! storage yields an empty list; storage that exists but cannot be opened
//! yields `BackendUnavailable`.

pub mod file;
pub mod pkcs11;
pub mod store;
pub mod token;

pub use file::FileAdapter;
pub use store::{StoreAdapter, StoreHandle, StoreHandleCell};
pub use token::TokenAdapter;

use crate::certificate::{Certificate, CertificateSource};
use crate::error::Result;
use crate::secret::SecretPin;
use crate::signing::Signer;

/// Uniform contract for enumerating certificates and producing signers.
pub trait BackendAdapter: Send + Sync {
    /// Backend tag of every certificate this adapter returns.
    fn source(&self) -> CertificateSource;

    /// Human-readable adapter name for logs and warnings.
    fn name(&self) -> &str;

    /// Enumerate signable certificates.
    fn list_certificates(&self) -> Result<Vec<Certificate>>;

    /// Authenticate and return a signer for `certificate`.
    ///
    /// The PIN is taken by value and wiped when this call returns.
    fn get_signer(&self, certificate: &Certificate, pin: SecretPin) -> Result<Box<dyn Signer>>;
}
