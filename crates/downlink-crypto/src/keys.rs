//! Key material types and generators.
//!
//! All keys are 32 bytes. Generators draw from the operating system CSPRNG.
//! [`SymmetricKey`] zeroes its bytes on drop and redacts itself from
//! `Debug`; Ed25519 and X25519 key types come from their respective dalek
//! crates and carry their own hygiene.

use rand::{rngs::OsRng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of every key handled by this crate, in bytes.
pub const KEY_LEN: usize = 32;

/// A 32-byte shared symmetric key for the secret-box scheme.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SymmetricKey([u8; KEY_LEN]);

impl SymmetricKey {
    /// Generate a fresh random key from the OS CSPRNG.
    #[must_use]
    pub fn generate() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Wrap existing key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes. Handle with care; never log.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SymmetricKey(..)")
    }
}

/// Generate a fresh Ed25519 signing key from the OS CSPRNG.
#[must_use]
pub fn generate_signing_key() -> ed25519_dalek::SigningKey {
    ed25519_dalek::SigningKey::generate(&mut OsRng)
}
