//! Signature production over precomputed digests.
//!
//! A [`Signer`] is bound to exactly one private key and its certificate. It is
//! obtained from a backend adapter after authentication and stays usable for
//! repeated [`Signer::sign`] calls until it is closed or dropped.
//!
//! ## Digest handling
//!
//! Signers never see document bytes. Callers hash the signed byte ranges with
//! [`DigestAlgorithm::digest`] (or any other implementation) and pass a
//! [`PrehashedDigest`]. RSA keys produce PKCS#1 v1.5 signatures over the
//! DigestInfo of that digest; EC keys produce DER-encoded ECDSA signatures.
//!
//! ## Example
//!
//! ```ignore
//! use pdf_credentials::signing::{DigestAlgorithm, PrehashedDigest};
//!
//! let digest = PrehashedDigest::compute(DigestAlgorithm::Sha256, &signed_bytes);
//! let raw = signer.sign(&digest)?;
//! signer.close();
//! ```

mod digest;
mod software;
mod verify;

pub use digest::{DigestAlgorithm, PrehashedDigest};
pub use software::{SoftwareKey, SoftwareSigner};
pub use verify::{verify_prehashed, verify_with_public_key};

use crate::certificate::Certificate;
use crate::error::Result;

/// Session-scoped signing capability bound to one private key.
///
/// Implementations own their backend session exclusively and release it in
/// [`Signer::close`], which must be idempotent and is also run on drop.
pub trait Signer: Send {
    /// Certificate whose private key this signer uses.
    fn certificate(&self) -> &Certificate;

    /// Sign a precomputed digest and return the raw signature bytes.
    ///
    /// Fails with `SignerClosed` after [`Signer::close`] and with
    /// `SigningFailed` when the backend rejects the operation.
    fn sign(&mut self, digest: &PrehashedDigest) -> Result<Vec<u8>>;

    /// Release backend resources. Safe to call more than once.
    fn close(&mut self);

    /// Whether [`Signer::close`] has run.
    fn is_closed(&self) -> bool;
}
