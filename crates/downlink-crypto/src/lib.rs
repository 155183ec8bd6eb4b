//! Sign-then-encrypt crypto boxes for the downlink telemetry pipeline.
//!
//! Security model: the sender signs the plaintext with Ed25519, then seals
//! `signature ∥ plaintext` with XChaCha20-Poly1305 under a 32-byte key. The
//! receiver opens the AEAD and verifies the signature, so every delivered
//! payload is both confidential and attributable to the signing key.
//!
//! Two variants share the construction:
//!
//! - [`CryptoBox`]: a pre-shared symmetric key (secret-box scheme)
//! - [`PeerCryptoBox`]: X25519 static Diffie–Hellman with an installed peer
//!   public key, HKDF-derived AEAD key
//!
//! Keys are immutable after construction and never appear in `Debug` output
//! or logs.

#![forbid(unsafe_code)]

pub mod asymmetric;
pub mod error;
pub mod keys;
pub mod seal;
pub mod symmetric;

pub use asymmetric::PeerCryptoBox;
// The dalek key types are part of this crate's API surface.
pub use ed25519_dalek::{SigningKey, VerifyingKey};
pub use error::CryptoError;
pub use keys::{generate_signing_key, SymmetricKey, KEY_LEN};
pub use seal::{SealedBox, NONCE_LEN, SIGNATURE_LEN};
pub use symmetric::CryptoBox;
pub use x25519_dalek::PublicKey as AgreementPublicKey;
