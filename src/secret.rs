//! Zeroizing buffer for PINs and container passwords.
//!
//! A [`SecretPin`] owns its bytes, cannot be cloned, never prints its
//! contents, and overwrites its memory with zeros when dropped. Adapters take
//! the PIN by value so the buffer is wiped as soon as authentication is done.
//!
//! Copies made inside backend libraries (for example the string handed to a
//! PKCS#11 `C_Login`) are outside this type's reach.

use crate::error::{Error, Result};
use std::fmt;
use zeroize::Zeroize;

/// Owned PIN/password buffer, zeroed on drop.
pub struct SecretPin {
    bytes: Vec<u8>,
}

impl SecretPin {
    /// Take ownership of raw PIN bytes.
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    /// An empty PIN, meaning "no PIN supplied".
    pub fn empty() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Whether no PIN was supplied.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Borrow the PIN bytes for the duration of a backend call.
    pub fn expose(&self) -> &[u8] {
        &self.bytes
    }

    /// Borrow the PIN as UTF-8 for backends whose API takes text.
    pub fn expose_str(&self) -> Result<&str> {
        // The error must not echo the PIN bytes.
        std::str::from_utf8(&self.bytes).map_err(|_| Error::AuthenticationFailed)
    }
}

impl From<String> for SecretPin {
    /// Moves the string's heap buffer into the secret without copying it.
    fn from(pin: String) -> Self {
        Self::new(pin.into_bytes())
    }
}

impl From<&str> for SecretPin {
    fn from(pin: &str) -> Self {
        Self::new(pin.as_bytes().to_vec())
    }
}

impl Drop for SecretPin {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl fmt::Debug for SecretPin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            write!(f, "SecretPin(<empty>)")
        } else {
            write!(f, "SecretPin([REDACTED])")
        }
    }
}
