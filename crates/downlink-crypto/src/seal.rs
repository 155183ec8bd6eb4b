//! The shared sign-then-encrypt construction.
//!
//! Both box variants funnel through [`sign_then_seal`] and
//! [`open_then_verify`]: Ed25519 over the plaintext, then
//! XChaCha20-Poly1305 over `signature ∥ plaintext` with a fresh random
//! 24-byte nonce prepended to the ciphertext on the wire.

use chacha20poly1305::{
    aead::{Aead, AeadCore, OsRng},
    XChaCha20Poly1305, XNonce,
};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};

use crate::error::CryptoError;

/// XChaCha20 nonce length in bytes.
pub const NONCE_LEN: usize = 24;

/// Ed25519 signature length in bytes.
pub const SIGNATURE_LEN: usize = 64;

/// Poly1305 tag length in bytes.
const TAG_LEN: usize = 16;

/// A sealed payload plus the sender-side metadata that describes it.
///
/// The wire representation is `nonce ∥ ciphertext`; the signature is
/// *inside* the ciphertext and is surfaced here only so the producer can
/// record it in envelope metadata.
#[derive(Clone)]
pub struct SealedBox {
    /// The nonce prepended on the wire.
    pub nonce: [u8; NONCE_LEN],
    /// The Ed25519 signature over the plaintext.
    pub signature: [u8; SIGNATURE_LEN],
    bytes: Vec<u8>,
}

impl SealedBox {
    /// The full wire bytes (`nonce ∥ ciphertext`).
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Consume into the wire bytes.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

impl std::fmt::Debug for SealedBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedBox").field("len", &self.bytes.len()).finish_non_exhaustive()
    }
}

/// Sign `plaintext` and seal `signature ∥ plaintext` under `cipher`.
pub(crate) fn sign_then_seal(
    cipher: &XChaCha20Poly1305,
    signing_key: &SigningKey,
    plaintext: &[u8],
) -> SealedBox {
    let signature = signing_key.sign(plaintext);

    let mut signed = Vec::with_capacity(SIGNATURE_LEN + plaintext.len());
    signed.extend_from_slice(&signature.to_bytes());
    signed.extend_from_slice(plaintext);

    let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);

    let Ok(ciphertext) = cipher.encrypt(&nonce, signed.as_slice()) else {
        unreachable!("XChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    let mut bytes = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    bytes.extend_from_slice(&nonce);
    bytes.extend_from_slice(&ciphertext);

    SealedBox { nonce: nonce.into(), signature: signature.to_bytes(), bytes }
}

/// Open `nonce ∥ ciphertext` under `cipher` and verify the inner signature.
///
/// The AEAD open always runs to completion before the signature check, and
/// the signature check always runs on a successful open; neither failure
/// path short-circuits on key-dependent data.
pub(crate) fn open_then_verify(
    cipher: &XChaCha20Poly1305,
    verify_key: &VerifyingKey,
    sealed: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < NONCE_LEN + TAG_LEN {
        return Err(CryptoError::DecryptionFailed);
    }

    let nonce = XNonce::from_slice(&sealed[..NONCE_LEN]);
    let signed = cipher
        .decrypt(nonce, &sealed[NONCE_LEN..])
        .map_err(|_| CryptoError::DecryptionFailed)?;

    if signed.len() < SIGNATURE_LEN {
        return Err(CryptoError::AuthenticationFailed);
    }

    let mut sig_bytes = [0u8; SIGNATURE_LEN];
    sig_bytes.copy_from_slice(&signed[..SIGNATURE_LEN]);
    let signature = Signature::from_bytes(&sig_bytes);
    let plaintext = &signed[SIGNATURE_LEN..];

    verify_key
        .verify(plaintext, &signature)
        .map_err(|_| CryptoError::AuthenticationFailed)?;

    Ok(plaintext.to_vec())
}
