//! Backend-agnostic certificate model.
//!
//! Every backend produces [`Certificate`] values; callers never see a
//! PKCS#12 bag, a PKCS#11 object handle or an NSS nickname directly, only the
//! [`Locator`] that the owning backend uses to find the certificate again.
//!
//! ## Example
//!
//! ```ignore
//! use pdf_credentials::certificate::{AuthContract, Certificate, Locator};
//!
//! let cert = Certificate::from_der(&der, Locator::Store { nickname: "me".into() },
//!     AuthContract::OPTIONAL)?;
//! if cert.has_signing_capability() && cert.is_valid() {
//!     println!("{} ({})", cert.name(), cert.fingerprint());
//! }
//! ```

mod filter;
mod model;
mod x509;

pub use filter::CertificateFilter;
pub use model::{
    AuthContract, Certificate, CertificateSource, Fingerprint, KeyAlgorithm, KeyUsage, Locator,
};
pub use x509::{certificate_bytes_to_der, UNKNOWN_NAME};

pub(crate) use x509::parse_der;
