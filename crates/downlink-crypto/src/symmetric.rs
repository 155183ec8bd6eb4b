//! Symmetric (pre-shared key) crypto box.

use chacha20poly1305::{KeyInit, XChaCha20Poly1305};
use ed25519_dalek::{SigningKey, VerifyingKey};

use crate::{
    error::CryptoError,
    keys::SymmetricKey,
    seal::{open_then_verify, sign_then_seal, SealedBox},
};

/// Sign-then-encrypt under a pre-shared 32-byte symmetric key.
///
/// Stateless apart from its keys: every [`CryptoBox::encrypt`] call draws a
/// fresh nonce, and repeated calls share nothing. Keys are immutable after
/// construction.
pub struct CryptoBox {
    key_id: String,
    signing_key: SigningKey,
    verify_key: VerifyingKey,
    cipher: XChaCha20Poly1305,
}

impl CryptoBox {
    /// Build a box that signs with `signing_key` and verifies received
    /// payloads against `verify_key` (the peer's, or our own for loopback).
    pub fn new(
        key_id: impl Into<String>,
        signing_key: SigningKey,
        verify_key: VerifyingKey,
        key: &SymmetricKey,
    ) -> Self {
        Self {
            key_id: key_id.into(),
            signing_key,
            verify_key,
            cipher: XChaCha20Poly1305::new(key.as_bytes().into()),
        }
    }

    /// Build a box that verifies its own signatures (single-party use and
    /// tests).
    pub fn sealing(key_id: impl Into<String>, signing_key: SigningKey, key: &SymmetricKey) -> Self {
        let verify_key = signing_key.verifying_key();
        Self::new(key_id, signing_key, verify_key, key)
    }

    /// Label of the key this box seals under.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Our verification key, for sharing with the receiving side.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Sign the plaintext, then seal `signature ∥ plaintext`.
    #[must_use]
    pub fn encrypt(&self, plaintext: &[u8]) -> SealedBox {
        sign_then_seal(&self.cipher, &self.signing_key, plaintext)
    }

    /// Open `nonce ∥ ciphertext` and verify the inner signature.
    ///
    /// # Errors
    ///
    /// - `CryptoError::DecryptionFailed` when the AEAD open fails
    /// - `CryptoError::AuthenticationFailed` when the signature does not
    ///   verify
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        open_then_verify(&self.cipher, &self.verify_key, sealed)
    }
}

impl std::fmt::Debug for CryptoBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CryptoBox").field("key_id", &self.key_id).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_signing_key;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = SymmetricKey::generate();
        let bx = CryptoBox::sealing("k1", generate_signing_key(), &key);

        let sealed = bx.encrypt(b"hello telemetry");
        assert_eq!(bx.decrypt(sealed.as_bytes()).unwrap(), b"hello telemetry");
    }

    #[test]
    fn two_parties_with_shared_key() {
        let key = SymmetricKey::generate();
        let robot_signing = generate_signing_key();
        let ground_signing = generate_signing_key();

        let robot = CryptoBox::new("link", robot_signing.clone(), ground_signing.verifying_key(), &key);
        let ground = CryptoBox::new("link", ground_signing, robot_signing.verifying_key(), &key);

        let sealed = robot.encrypt(b"pose update");
        assert_eq!(ground.decrypt(sealed.as_bytes()).unwrap(), b"pose update");
    }

    #[test]
    fn large_payload_roundtrip() {
        let key = SymmetricKey::generate();
        let bx = CryptoBox::sealing("k1", generate_signing_key(), &key);

        let plaintext = vec![0x42u8; 64 * 1024];
        let sealed = bx.encrypt(&plaintext);
        assert_eq!(bx.decrypt(sealed.as_bytes()).unwrap(), plaintext);
    }

    #[test]
    fn wrong_symmetric_key_is_rejected() {
        let signing = generate_signing_key();
        let a = CryptoBox::sealing("k1", signing.clone(), &SymmetricKey::generate());
        let b = CryptoBox::sealing("k1", signing, &SymmetricKey::generate());

        let sealed = a.encrypt(b"secret");
        assert_eq!(b.decrypt(sealed.as_bytes()).unwrap_err(), CryptoError::DecryptionFailed);
    }

    #[test]
    fn key_id_is_reported() {
        let bx = CryptoBox::sealing("mission-7", generate_signing_key(), &SymmetricKey::generate());
        assert_eq!(bx.key_id(), "mission-7");
    }

    #[test]
    fn debug_never_prints_key_material() {
        let key = SymmetricKey::from_bytes([0x5A; 32]);
        let bx = CryptoBox::sealing("k1", generate_signing_key(), &key);
        let rendered = format!("{bx:?}");
        assert!(!rendered.contains("5a"), "redacted: {rendered}");
        assert!(!rendered.contains("90"), "redacted: {rendered}");
    }
}
