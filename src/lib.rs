// Allow some clippy lints that are too pedantic for this project
#![allow(clippy::type_complexity)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::should_implement_trait)]
// Allow unused for tests
#![cfg_attr(test, allow(dead_code))]

//! # PDF Credentials
//!
//! Certificate discovery and signing for PDF applications.
//!
//! ## Core Features
//!
//! ### Discovery
//! - **PKCS#12 files**: `.p12`/`.pfx` containers in configured directories
//! - **PKCS#11 tokens**: smart cards and USB keys through their vendor modules
//! - **NSS store**: the browser/system certificate database
//! - **Merged listing**: one ranked, deduplicated list with per-backend warnings
//!
//! ### Signing
//! - **Prehashed signing**: RSA PKCS#1 v1.5 and ECDSA P-256/P-384 over a
//!   caller-computed digest
//! - **Session-scoped signers**: backend sessions released on `close` or drop
//! - **PIN hygiene**: PINs held in a zeroizing buffer, never logged
//!
//! ### Verification
//! - **Signature metadata**: CMS parsing and a [`SignatureInfo`] that reports
//!   cryptographic and certificate validity separately
//!
//! ## Architecture
//! - **Pluggable backends**: every storage technology sits behind
//!   [`BackendAdapter`]
//! - **Live enumeration**: the registry caches nothing between calls
//! - **Bounded fan-out**: backends are enumerated on worker threads with an
//!   optional deadline
//!
//! ## Quick Start
//!
//! ```ignore
//! use pdf_credentials::{CertificateRegistry, CredentialConfig, ListOptions, SecretPin};
//! use pdf_credentials::signing::{DigestAlgorithm, PrehashedDigest};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = CertificateRegistry::from_config(&CredentialConfig::default());
//! let listing = registry.list_valid(&ListOptions::new());
//! let cert = &listing.certificates[0];
//!
//! let mut signer = registry.get_signer(cert.fingerprint(), SecretPin::from("1234"))?;
//! let digest = PrehashedDigest::compute(DigestAlgorithm::Sha256, b"signed byte ranges");
//! let signature = signer.sign(&digest)?;
//! signer.close();
//! # Ok(())
//! # }
//! ```
//!
//! ## License
//!
//! Licensed under either of:
//!
//! * Apache License, Version 2.0 ([LICENSE-APACHE](LICENSE-APACHE) or <http://www.apache.org/licenses/LICENSE-2.0>)
//! * MIT license ([LICENSE-MIT](LICENSE-MIT) or <http://opensource.org/licenses/MIT>)
//!
//! at your option.

#![warn(missing_docs)]

// Error handling
pub mod error;

// Certificate model
pub mod certificate;
pub mod secret;

// Signing
pub mod signing;

// Backends and discovery
pub mod backends;
pub mod config;
pub mod registry;

// Verification
pub mod signatures;

// Re-exports
pub use backends::BackendAdapter;
pub use certificate::{Certificate, CertificateFilter, CertificateSource, Fingerprint, Locator};
pub use config::CredentialConfig;
pub use error::{Error, Result};
pub use registry::{BackendWarning, CertificateListing, CertificateRegistry, ListOptions};
pub use secret::SecretPin;
pub use signatures::{SignatureContainer, SignatureInfo, SignatureVerifier};
pub use signing::{DigestAlgorithm, PrehashedDigest, Signer};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
