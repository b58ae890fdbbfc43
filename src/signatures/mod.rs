//! Signature metadata and verification.
//!
//! Turns an embedded signature into a [`SignatureInfo`] for display. The
//! caller extracts the `/Contents` blob and the signed byte ranges from the
//! PDF; this module parses the CMS structure, checks the signature against the
//! document digest and checks the signer certificate.
//!
//! ## Signature Types Supported
//!
//! - PKCS#7 detached signatures (adbe.pkcs7.detached)
//! - PKCS#7 SHA-1 signatures (adbe.pkcs7.sha1)
//! - PAdES signatures (ETSI.CAdES.detached)
//!
//! ## Example
//!
//! ```ignore
//! use pdf_credentials::signatures::{SignatureContainer, SignatureSubFilter, SignatureVerifier};
//! use pdf_credentials::signing::DigestAlgorithm;
//!
//! let digest = DigestAlgorithm::Sha256.digest(&signed_bytes);
//! let container =
//!     SignatureContainer::from_cms_der(&contents, SignatureSubFilter::Pkcs7Detached, &digest)?
//!         .with_reason(reason);
//!
//! let mut verifier = SignatureVerifier::new();
//! verifier.add_trusted_root(root_der);
//! let info = verifier.verify(&container);
//! println!("{}: {}", info.signer_name, info.validation_message);
//! ```
//!
//! ## PDF Specification Reference
//!
//! - ISO 32000-1:2008 Section 12.8 - Digital Signatures
//! - RFC 5652 - Cryptographic Message Syntax

mod cms;
mod types;
mod verifier;

pub use types::{SignatureContainer, SignatureInfo, SignatureSubFilter, SignedAttributes};
pub use verifier::{RevocationChecker, RevocationStatus, SignatureVerifier};
