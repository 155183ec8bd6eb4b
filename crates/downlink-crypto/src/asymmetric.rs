//! Asymmetric (X25519 key agreement) crypto box.
//!
//! Each party holds a static X25519 keypair and an Ed25519 signing key. The
//! AEAD key is derived from the X25519 shared secret with HKDF-SHA256, so
//! no symmetric key ever needs to be provisioned out of band; only public
//! keys are exchanged.

use chacha20poly1305::{KeyInit, XChaCha20Poly1305};
use ed25519_dalek::{SigningKey, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::{
    error::CryptoError,
    seal::{open_then_verify, sign_then_seal, SealedBox},
};

/// Domain separation for the HKDF derivation.
const HKDF_INFO: &[u8] = b"downlink peer box v1";

/// Sign-then-encrypt against a specific peer, keyed by X25519 agreement.
///
/// The box is inert until [`PeerCryptoBox::install_peer`] provides the
/// peer's public keys; sealing or opening before that fails with
/// [`CryptoError::BadKey`].
pub struct PeerCryptoBox {
    key_id: String,
    signing_key: SigningKey,
    secret: StaticSecret,
    public: PublicKey,
    peer: Option<Peer>,
}

struct Peer {
    verify_key: VerifyingKey,
    cipher: XChaCha20Poly1305,
}

impl PeerCryptoBox {
    /// Create a box with fresh X25519 key material.
    pub fn new(key_id: impl Into<String>, signing_key: SigningKey) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { key_id: key_id.into(), signing_key, secret, public, peer: None }
    }

    /// Label of the key agreement this box seals under.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Our X25519 public key, to hand to the peer.
    #[must_use]
    pub fn public_key(&self) -> PublicKey {
        self.public
    }

    /// Our Ed25519 verification key, to hand to the peer.
    #[must_use]
    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Install the peer's public keys and derive the session cipher.
    pub fn install_peer(&mut self, peer_public: PublicKey, peer_verify: VerifyingKey) {
        let shared = self.secret.diffie_hellman(&peer_public);

        let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
        let mut okm = [0u8; 32];
        let Ok(()) = hk.expand(HKDF_INFO, &mut okm) else {
            unreachable!("32 bytes is a valid HKDF-SHA256 output length");
        };

        self.peer = Some(Peer {
            verify_key: peer_verify,
            cipher: XChaCha20Poly1305::new((&okm).into()),
        });
    }

    /// Sign the plaintext, then seal it for the installed peer.
    ///
    /// # Errors
    ///
    /// `CryptoError::BadKey` when no peer key has been installed.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<SealedBox, CryptoError> {
        let peer = self.peer.as_ref().ok_or(CryptoError::BadKey)?;
        Ok(sign_then_seal(&peer.cipher, &self.signing_key, plaintext))
    }

    /// Open a payload sealed by the installed peer and verify its
    /// signature.
    ///
    /// # Errors
    ///
    /// - `CryptoError::BadKey` when no peer key has been installed
    /// - `CryptoError::DecryptionFailed` when the AEAD open fails
    /// - `CryptoError::AuthenticationFailed` when the signature does not
    ///   verify
    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let peer = self.peer.as_ref().ok_or(CryptoError::BadKey)?;
        open_then_verify(&peer.cipher, &peer.verify_key, sealed)
    }
}

impl std::fmt::Debug for PeerCryptoBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerCryptoBox")
            .field("key_id", &self.key_id)
            .field("peer_installed", &self.peer.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_signing_key;

    fn paired_boxes() -> (PeerCryptoBox, PeerCryptoBox) {
        let mut robot = PeerCryptoBox::new("link", generate_signing_key());
        let mut ground = PeerCryptoBox::new("link", generate_signing_key());

        let (rp, rv) = (robot.public_key(), robot.verifying_key());
        let (gp, gv) = (ground.public_key(), ground.verifying_key());
        robot.install_peer(gp, gv);
        ground.install_peer(rp, rv);

        (robot, ground)
    }

    #[test]
    fn agreement_roundtrip_both_directions() {
        let (robot, ground) = paired_boxes();

        let sealed = robot.encrypt(b"uplink telemetry").unwrap();
        assert_eq!(ground.decrypt(sealed.as_bytes()).unwrap(), b"uplink telemetry");

        let sealed = ground.encrypt(b"ground command").unwrap();
        assert_eq!(robot.decrypt(sealed.as_bytes()).unwrap(), b"ground command");
    }

    #[test]
    fn encrypt_without_peer_is_bad_key() {
        let bx = PeerCryptoBox::new("link", generate_signing_key());
        assert_eq!(bx.encrypt(b"x").unwrap_err(), CryptoError::BadKey);
        assert_eq!(bx.decrypt(b"irrelevant").unwrap_err(), CryptoError::BadKey);
    }

    #[test]
    fn third_party_cannot_open() {
        let (robot, _ground) = paired_boxes();
        let (_other_robot, other_ground) = paired_boxes();

        let sealed = robot.encrypt(b"secret").unwrap();
        assert_eq!(
            other_ground.decrypt(sealed.as_bytes()).unwrap_err(),
            CryptoError::DecryptionFailed
        );
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let (robot, ground) = paired_boxes();
        let mut sealed = robot.encrypt(b"secret").unwrap().into_bytes();
        let last = sealed.len() - 1;
        sealed[last] ^= 0xFF;
        assert_eq!(ground.decrypt(&sealed).unwrap_err(), CryptoError::DecryptionFailed);
    }
}
