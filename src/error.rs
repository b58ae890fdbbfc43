//! Error types for credential discovery and signing.
//!
//! This module defines all error types that can occur while enumerating
//! certificates, authenticating against a backend, or producing a signature.

use crate::certificate::CertificateSource;
use std::time::Duration;

/// Result type alias for credential operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error types that can occur during credential discovery and signing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Backend storage could not be opened at all
    #[error("{backend} backend unavailable: {reason}")]
    BackendUnavailable {
        /// Backend that failed
        backend: CertificateSource,
        /// Reason for the failure
        reason: String,
    },

    /// No certificate or identity matches the request
    #[error("Certificate not found: {0}")]
    NotFound(String),

    /// PIN rejected by the backend.
    ///
    /// The message intentionally carries no backend name or retry counter.
    #[error("Incorrect PIN or authentication error")]
    AuthenticationFailed,

    /// Certificate is present but its private key is not
    #[error("Private key not found for certificate {0}")]
    KeyNotFound(String),

    /// Native signing primitive failed
    #[error("Signing failed: {0}")]
    SigningFailed(String),

    /// Malformed certificate or container bytes
    #[error("Failed to parse certificate: {0}")]
    ParseError(String),

    /// Digest length does not match its algorithm
    #[error("Invalid digest: {algorithm} expects {expected} bytes, got {actual}")]
    InvalidDigest {
        /// Digest algorithm name
        algorithm: &'static str,
        /// Expected length in bytes
        expected: usize,
        /// Actual length in bytes
        actual: usize,
    },

    /// Key or signature algorithm the crate cannot drive
    #[error("Unsupported algorithm: {0}")]
    UnsupportedAlgorithm(String),

    /// Signer was used after `close()`
    #[error("Signer has been closed")]
    SignerClosed,

    /// Caller-supplied deadline expired
    #[error("Deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed signature container handed in for verification
    #[error("Invalid signature container: {0}")]
    InvalidContainer(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a `BackendUnavailable` error.
    pub fn unavailable(backend: CertificateSource, reason: impl Into<String>) -> Self {
        Error::BackendUnavailable {
            backend,
            reason: reason.into(),
        }
    }

    /// Attribute a `BackendUnavailable` error to `backend`.
    ///
    /// The PKCS#11 layer is shared by the token and store backends and tags
    /// its failures as token failures; other errors pass through.
    pub fn for_backend(self, backend: CertificateSource) -> Self {
        match self {
            Error::BackendUnavailable { reason, .. } => Error::BackendUnavailable { backend, reason },
            other => other,
        }
    }

    /// Message without the backend prefix, for aggregated warnings.
    pub fn detail(&self) -> String {
        match self {
            Error::BackendUnavailable { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }

    /// Whether the caller may re-prompt and try again with fresh input.
    ///
    /// Only a rejected PIN qualifies. Nothing in this crate retries on its own.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::AuthenticationFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_unavailable_error() {
        let err = Error::unavailable(CertificateSource::Token, "module failed to initialize");
        let msg = format!("{}", err);
        assert!(msg.contains("Token"));
        assert!(msg.contains("module failed to initialize"));
    }

    #[test]
    fn test_authentication_failed_is_generic() {
        let msg = Error::AuthenticationFailed.to_string();
        assert_eq!(msg, "Incorrect PIN or authentication error");
        assert!(!msg.contains("Token"));
        assert!(!msg.to_lowercase().contains("attempt"));
    }

    #[test]
    fn test_invalid_digest_error() {
        let err = Error::InvalidDigest {
            algorithm: "SHA-256",
            expected: 32,
            actual: 20,
        };
        let msg = format!("{}", err);
        assert!(msg.contains("SHA-256"));
        assert!(msg.contains("32"));
        assert!(msg.contains("20"));
    }

    #[test]
    fn test_only_authentication_is_recoverable() {
        assert!(Error::AuthenticationFailed.is_recoverable());
        assert!(!Error::KeyNotFound("abc".into()).is_recoverable());
        assert!(!Error::SigningFailed("device removed".into()).is_recoverable());
        assert!(!Error::unavailable(CertificateSource::File, "x").is_recoverable());
    }

    #[test]
    fn test_for_backend_retags_unavailable_only() {
        let err = Error::unavailable(CertificateSource::Token, "C_GetSlotList: CKR_DEVICE_ERROR")
            .for_backend(CertificateSource::Store);
        assert!(matches!(
            err,
            Error::BackendUnavailable {
                backend: CertificateSource::Store,
                ..
            }
        ));
        assert_eq!(err.detail(), "C_GetSlotList: CKR_DEVICE_ERROR");

        let err = Error::AuthenticationFailed.for_backend(CertificateSource::Store);
        assert!(matches!(err, Error::AuthenticationFailed));
        assert_eq!(err.detail(), "Incorrect PIN or authentication error");
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Error>();
    }
}
