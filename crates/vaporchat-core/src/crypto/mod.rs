//! Cryptographic primitives for vaporchat.
//!
//! Everything here wraps a vetted implementation; nothing is hand-rolled:
//!
//! - **X25519**: Diffie-Hellman agreement (`x25519-dalek`)
//! - **Ed25519**: detached envelope signatures (`ed25519-dalek`)
//! - **XChaCha20-Poly1305**: message AEAD, 24-byte nonces (`chacha20poly1305`)
//! - **HKDF-SHA256**: all key derivation (`hkdf`)
//! - **HMAC-SHA256**: room-PSK peer verification (`hmac`)
//!
//! Callers treat every buffer as opaque; no endianness choices leak out of
//! this module. Key material lives in zero-on-drop containers.

mod aead;
mod keys;
mod ratchet;
mod replay;
mod room;

pub use aead::{decrypt, encrypt, Nonce, NONCE_SIZE, TAG_SIZE};
pub use keys::{
    session_keys, DhKeypair, DhPublicKey, LocalIdentity, PreKeyBundle, SessionKeys,
    SharedSecret, SigningKeypair, VerifyingKey, DH_KEY_SIZE, SIGNATURE_SIZE,
};
pub use ratchet::Ratchet;
pub use replay::ReplayWindow;
pub use room::{RoomId, RoomKeys, RoomPsk};

use crate::error::{Error, Result};
use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::Zeroizing;

/// Size of every chain, message, and session key in bytes.
pub const KEY_SIZE: usize = 32;

/// Derive a 32-byte subkey from a master key.
///
/// `ctx` is an 8-byte domain-separation constant and `subkey_id` selects the
/// subkey within that domain; both are folded into the HKDF info string.
pub fn kdf_derive(master: &[u8], subkey_id: u64, ctx: &[u8; 8]) -> Result<Zeroizing<[u8; KEY_SIZE]>> {
    let hkdf = Hkdf::<Sha256>::new(None, master);
    let mut info = [0u8; 16];
    info[..8].copy_from_slice(ctx);
    info[8..].copy_from_slice(&subkey_id.to_le_bytes());

    let mut output = Zeroizing::new([0u8; KEY_SIZE]);
    hkdf.expand(&info, output.as_mut())
        .map_err(|_| Error::Crypto("HKDF expansion failed".into()))?;
    Ok(output)
}

/// Generate cryptographically secure random bytes.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut bytes);
    bytes
}

/// Constant-time comparison of byte slices.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kdf_is_deterministic() {
        let master = [9u8; 32];
        let a = kdf_derive(&master, 1, b"vpr_test").expect("derive");
        let b = kdf_derive(&master, 1, b"vpr_test").expect("derive");
        assert_eq!(*a, *b);
    }

    #[test]
    fn test_kdf_separates_ids_and_contexts() {
        let master = [9u8; 32];
        let base = kdf_derive(&master, 1, b"vpr_test").expect("derive");
        let other_id = kdf_derive(&master, 2, b"vpr_test").expect("derive");
        let other_ctx = kdf_derive(&master, 1, b"vpr_oth_").expect("derive");
        assert_ne!(*base, *other_id);
        assert_ne!(*base, *other_ctx);
    }

    #[test]
    fn test_random_bytes() {
        let a: [u8; 32] = random_bytes();
        let b: [u8; 32] = random_bytes();
        assert_ne!(a, b);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"hello", b"hello"));
        assert!(!constant_time_eq(b"hello", b"world"));
        assert!(!constant_time_eq(b"hello", b"hi"));
    }
}
