//! Authenticated encryption using XChaCha20-Poly1305.
//!
//! The extended 24-byte nonce makes random nonces safe even though the
//! ratchet reuses a message key for cover traffic. No associated data is
//! bound; everything that needs authentication is inside the plaintext or
//! covered by the envelope signature.

use crate::error::{Error, Result};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    Key, XChaCha20Poly1305, XNonce,
};
use rand::RngCore;
use zeroize::Zeroizing;

/// Size of encryption key in bytes (256 bits).
pub const KEY_SIZE: usize = 32;

/// Size of the extended nonce in bytes (192 bits).
pub const NONCE_SIZE: usize = 24;

/// Size of the authentication tag in bytes (128 bits).
pub const TAG_SIZE: usize = 16;

/// A 24-byte nonce for the extended-nonce AEAD.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Nonce([u8; NONCE_SIZE]);

impl Nonce {
    /// Create a new random nonce.
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create from bytes.
    pub fn from_bytes(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; NONCE_SIZE] {
        &self.0
    }
}

impl From<[u8; NONCE_SIZE]> for Nonce {
    fn from(bytes: [u8; NONCE_SIZE]) -> Self {
        Self(bytes)
    }
}

/// Encrypt plaintext under a 32-byte key.
///
/// Returns ciphertext with the 16-byte tag appended.
pub fn encrypt(key: &[u8; KEY_SIZE], nonce: &Nonce, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(XNonce::from_slice(nonce.as_bytes()), plaintext)
        .map_err(|_| Error::Crypto("encryption failed".into()))
}

/// Decrypt ciphertext produced by [`encrypt`].
///
/// A tag mismatch is an authentication failure, not a primitive fault, so
/// it surfaces as [`Error::Auth`] and the session survives.
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    nonce: &Nonce,
    ciphertext: &[u8],
) -> Result<Zeroizing<Vec<u8>>> {
    let cipher = XChaCha20Poly1305::new(Key::from_slice(key));
    let plaintext = cipher
        .decrypt(XNonce::from_slice(nonce.as_bytes()), ciphertext)
        .map_err(|_| Error::Auth("decryption failed".into()))?;
    Ok(Zeroizing::new(plaintext))
}
