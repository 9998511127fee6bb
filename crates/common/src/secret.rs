//! Secret wrapper for credential material

use std::fmt;

use sha2::{Digest, Sha256};
use zeroize::Zeroize;

/// Sensitive value - redacted in Debug/Display/logs, zeroized on drop
pub struct Secret<T: Zeroize>(T);

impl<T: Zeroize> Secret<T> {
    pub fn new(value: T) -> Self {
        Self(value)
    }

    /// Expose the inner value (use sparingly)
    pub fn expose(&self) -> &T {
        &self.0
    }
}

impl<T: Zeroize + AsRef<[u8]>> Secret<T> {
    /// Short stable identifier for logs: first 8 hex chars of the SHA-256.
    ///
    /// Lets operators correlate a rotated secret across log lines without
    /// the value itself ever reaching the log pipeline.
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.0.as_ref());
        digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
    }

    /// Compare against a candidate value without exposing the secret.
    ///
    /// Every byte is visited whatever the first difference is, so timing
    /// reveals only the length.
    pub fn matches(&self, other: &[u8]) -> bool {
        let ours = self.0.as_ref();
        if ours.len() != other.len() {
            return false;
        }
        ours.iter().zip(other).fold(0u8, |diff, (a, b)| diff | (a ^ b)) == 0
    }
}

impl<T: Zeroize> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T: Zeroize> Drop for Secret<T> {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<T: Zeroize + Clone> Clone for Secret<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl From<String> for Secret<String> {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}
