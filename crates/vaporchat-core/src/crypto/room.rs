//! Room key material.
//!
//! A room identifier deterministically yields two 32-byte values: the swarm
//! join key announced to the discovery layer, and the room PSK used only for
//! the peer-verification HMAC. Both are derived once at initialize and stay
//! immutable for the life of the session.

use crate::error::{Error, Result};
use sha2::{Digest, Sha256};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::PreKeyBundle;

/// An ASCII room identifier.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct RoomId(String);

impl RoomId {
    /// Validate and wrap a room identifier.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() || !id.is_ascii() {
            return Err(Error::Usage("room id must be non-empty ASCII".into()));
        }
        Ok(Self(id))
    }

    /// The identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Room ids gate membership; never print them whole.
        let n = self.0.len().min(3);
        write!(f, "RoomId({}…)", &self.0[..n])
    }
}

/// The room pre-shared key. Zeroized on drop, HMAC use only.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct RoomPsk([u8; 32]);

impl RoomPsk {
    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for RoomPsk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RoomPsk([REDACTED])")
    }
}

/// Key material derived from a room identifier.
pub struct RoomKeys {
    /// 32-byte key announced to the discovery swarm.
    pub swarm_key: [u8; 32],
    /// 32-byte PSK for the peer-verification HMAC.
    pub psk: RoomPsk,
}

impl RoomKeys {
    /// Derive both keys from the room id and the two pre-key bundles.
    ///
    /// The swarm key depends on the room id alone so that all members find
    /// the same swarm; the PSK additionally binds both bundles so that a
    /// leaked swarm key is not enough to pass verification. The bundles are
    /// hashed in lexicographic order, so either endpoint derives the same
    /// PSK regardless of which bundle is its own.
    pub fn derive(room: &RoomId, local: &PreKeyBundle, peer: &PreKeyBundle) -> Self {
        let swarm_key: [u8; 32] = Sha256::digest(room.as_str().as_bytes()).into();

        let a = local.to_bytes();
        let b = peer.to_bytes();
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };

        let mut hasher = Sha256::new();
        hasher.update(room.as_str().as_bytes());
        hasher.update(lo);
        hasher.update(hi);
        let psk: [u8; 32] = hasher.finalize().into();

        Self {
            swarm_key,
            psk: RoomPsk(psk),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{DhKeypair, SigningKeypair};

    fn bundle() -> PreKeyBundle {
        PreKeyBundle {
            dh: DhKeypair::generate().public_key().clone(),
            sig: SigningKeypair::generate().verifying_key(),
        }
    }

    #[test]
    fn test_room_id_rejects_non_ascii() {
        assert!(RoomId::new("lobby-42").is_ok());
        assert!(RoomId::new("").is_err());
        assert!(RoomId::new("café").is_err());
    }

    #[test]
    fn test_mirrored_endpoints_agree() {
        let room = RoomId::new("lobby").expect("room id");
        let alice = bundle();
        let bob = bundle();

        let k1 = RoomKeys::derive(&room, &alice, &bob);
        let k2 = RoomKeys::derive(&room, &bob, &alice);

        assert_eq!(k1.swarm_key, k2.swarm_key);
        assert_eq!(k1.psk.as_bytes(), k2.psk.as_bytes());
    }

    #[test]
    fn test_psk_binds_bundles() {
        let room = RoomId::new("lobby").expect("room id");
        let alice = bundle();
        let k1 = RoomKeys::derive(&room, &alice, &bundle());
        let k2 = RoomKeys::derive(&room, &alice, &bundle());

        // Same swarm, different PSK.
        assert_eq!(k1.swarm_key, k2.swarm_key);
        assert_ne!(k1.psk.as_bytes(), k2.psk.as_bytes());
    }

    #[test]
    fn test_different_rooms_differ() {
        let a = bundle();
        let b = bundle();
        let k1 = RoomKeys::derive(&RoomId::new("a").expect("id"), &a, &b);
        let k2 = RoomKeys::derive(&RoomId::new("b").expect("id"), &a, &b);
        assert_ne!(k1.swarm_key, k2.swarm_key);
        assert_ne!(k1.psk.as_bytes(), k2.psk.as_bytes());
    }
}
