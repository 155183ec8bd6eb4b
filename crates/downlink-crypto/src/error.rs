//! Error types for the crypto boxes.

use thiserror::Error;

/// Errors produced while sealing or opening payloads.
///
/// `AuthenticationFailed` and `DecryptionFailed` are deliberately
/// context-free: an attacker observing error behavior learns only that the
/// item was rejected, and both paths perform the same amount of work before
/// failing.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// Signature verification failed after a successful AEAD open.
    #[error("authentication failed")]
    AuthenticationFailed,

    /// AEAD open failed (wrong key, tampered ciphertext, or malformed
    /// input).
    #[error("decryption failed")]
    DecryptionFailed,

    /// Key material is missing or malformed (e.g. no peer key installed on
    /// an asymmetric box).
    #[error("bad key")]
    BadKey,
}
