//! Key types for agreement and envelope authentication.
//!
//! Two keypairs per endpoint: an X25519 keypair for Diffie-Hellman
//! agreement and an Ed25519 keypair for detached envelope signatures.
//! Their public halves together form the pre-key bundle that peers exchange
//! out of band. All secret material is zeroized on drop.

use crate::error::{Error, Result};
use ed25519_dalek::{Signer, Verifier};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use super::{kdf_derive, KEY_SIZE};

/// Size of X25519 and Ed25519 public keys in bytes.
pub const DH_KEY_SIZE: usize = 32;

/// Size of a detached Ed25519 signature in bytes.
pub const SIGNATURE_SIZE: usize = 64;

/// Domain separation for the directional session subkeys.
const SESSION_CTX: &[u8; 8] = b"vpr_sess";

/// Domain separation for the root key.
const ROOT_CTX: &[u8; 8] = b"vpr_root";

/// An X25519 public key.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Zeroize)]
pub struct DhPublicKey(#[serde(with = "serde_key")] [u8; DH_KEY_SIZE]);

impl DhPublicKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; DH_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; DH_KEY_SIZE] {
        &self.0
    }

    pub(crate) fn to_dalek(&self) -> PublicKey {
        PublicKey::from(self.0)
    }
}

impl fmt::Debug for DhPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DhPublicKey({}...)", hex::encode(&self.0[..8]))
    }
}

impl From<PublicKey> for DhPublicKey {
    fn from(key: PublicKey) -> Self {
        Self(*key.as_bytes())
    }
}

/// A shared secret from X25519 agreement. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct SharedSecret([u8; DH_KEY_SIZE]);

impl SharedSecret {
    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; DH_KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSecret([REDACTED])")
    }
}

/// An X25519 keypair usable for repeated agreements.
///
/// Uses `StaticSecret` internally because the ratchet performs several DH
/// operations with the same keypair before rotating it out.
#[derive(Clone, ZeroizeOnDrop)]
pub struct DhKeypair {
    #[zeroize(skip)]
    secret: StaticSecret,
    public: DhPublicKey,
}

impl DhKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = DhPublicKey::from(PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Restore from secret key bytes.
    pub fn from_secret_bytes(bytes: [u8; DH_KEY_SIZE]) -> Self {
        let secret = StaticSecret::from(bytes);
        let public = DhPublicKey::from(PublicKey::from(&secret));
        Self { secret, public }
    }

    /// Export secret key bytes for storage. Encrypt before writing out.
    pub fn secret_bytes(&self) -> [u8; DH_KEY_SIZE] {
        self.secret.to_bytes()
    }

    /// Get the public key.
    pub fn public_key(&self) -> &DhPublicKey {
        &self.public
    }

    /// Perform Diffie-Hellman agreement.
    pub fn diffie_hellman(&self, their_public: &DhPublicKey) -> SharedSecret {
        let shared = self.secret.diffie_hellman(&their_public.to_dalek());
        SharedSecret(*shared.as_bytes())
    }
}

impl fmt::Debug for DhKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DhKeypair")
            .field("public", &self.public)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// An Ed25519 verifying key for detached envelope signatures.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyingKey(#[serde(with = "serde_key")] [u8; DH_KEY_SIZE]);

impl VerifyingKey {
    /// Create from raw bytes.
    pub fn from_bytes(bytes: [u8; DH_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; DH_KEY_SIZE] {
        &self.0
    }

    /// Verify a detached signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8; SIGNATURE_SIZE]) -> Result<()> {
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| Error::Auth("invalid verifying key".into()))?;
        let sig = ed25519_dalek::Signature::from_bytes(signature);
        key.verify(message, &sig)
            .map_err(|_| Error::Auth("signature verification failed".into()))
    }
}

impl fmt::Debug for VerifyingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VerifyingKey({}...)", hex::encode(&self.0[..8]))
    }
}

/// An Ed25519 signing keypair for one session's outbound envelopes.
#[derive(Clone)]
pub struct SigningKeypair {
    signing: ed25519_dalek::SigningKey,
}

impl SigningKeypair {
    /// Generate a new random keypair.
    pub fn generate() -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    /// Restore from secret key bytes.
    pub fn from_secret_bytes(bytes: [u8; DH_KEY_SIZE]) -> Self {
        Self {
            signing: ed25519_dalek::SigningKey::from_bytes(&bytes),
        }
    }

    /// Export secret key bytes for storage. Encrypt before writing out.
    pub fn secret_bytes(&self) -> [u8; DH_KEY_SIZE] {
        self.signing.to_bytes()
    }

    /// Get the verifying key.
    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey(self.signing.verifying_key().to_bytes())
    }

    /// Produce a detached signature over `message`.
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_SIZE] {
        self.signing.sign(message).to_bytes()
    }
}

impl fmt::Debug for SigningKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningKeypair")
            .field("public", &self.verifying_key())
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// The public half of an endpoint's identity, exchanged out of band.
///
/// Carries the X25519 agreement key and, next to it, the Ed25519 verifying
/// key used to check the detached signature on every envelope.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    /// X25519 public key for agreement.
    pub dh: DhPublicKey,
    /// Ed25519 verifying key for envelope signatures.
    pub sig: VerifyingKey,
}

impl PreKeyBundle {
    /// Serialize to the fixed 64-byte wire form.
    pub fn to_bytes(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        out[..32].copy_from_slice(self.dh.as_bytes());
        out[32..].copy_from_slice(self.sig.as_bytes());
        out
    }

    /// Parse from the fixed 64-byte wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 64 {
            return Err(Error::Codec("pre-key bundle must be 64 bytes".into()));
        }
        let mut dh = [0u8; 32];
        let mut sig = [0u8; 32];
        dh.copy_from_slice(&bytes[..32]);
        sig.copy_from_slice(&bytes[32..]);
        Ok(Self {
            dh: DhPublicKey::from_bytes(dh),
            sig: VerifyingKey::from_bytes(sig),
        })
    }
}

/// An endpoint's full key material: the DH keypair plus the session
/// signing keypair. Its public halves form the endpoint's [`PreKeyBundle`].
#[derive(Clone, Debug)]
pub struct LocalIdentity {
    /// X25519 keypair seeding every ratchet this endpoint starts.
    pub dh: DhKeypair,
    /// Ed25519 keypair signing every outbound envelope.
    pub signing: SigningKeypair,
}

impl LocalIdentity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        Self {
            dh: DhKeypair::generate(),
            signing: SigningKeypair::generate(),
        }
    }

    /// The bundle to hand to peers out of band.
    pub fn bundle(&self) -> PreKeyBundle {
        PreKeyBundle {
            dh: self.dh.public_key().clone(),
            sig: self.signing.verifying_key(),
        }
    }
}

/// Keys derived from one DH agreement: the shared root plus the two
/// directional subkeys.
pub struct SessionKeys {
    /// Root key, identical on both endpoints.
    pub root: Zeroizing<[u8; KEY_SIZE]>,
    /// Subkey for the local endpoint's receiving direction.
    pub rx: Zeroizing<[u8; KEY_SIZE]>,
    /// Subkey for the local endpoint's sending direction.
    pub tx: Zeroizing<[u8; KEY_SIZE]>,
}

/// Derive the session subkeys for an agreement between `local` and `remote`.
///
/// The derivation is symmetric over the unordered key pair, and the two
/// directional subkeys are assigned by the lexicographic order of the public
/// keys, so mirrored endpoints end up with complementary keys:
/// `a.rx == b.tx` and `a.tx == b.rx`, while `a.root == b.root`.
///
/// `prev_root` mixes an existing root key into the derivation; rotations
/// pass the outgoing root here so that compromise of a single agreement
/// does not reveal the whole chain history.
pub fn session_keys(
    local: &DhKeypair,
    remote: &DhPublicKey,
    prev_root: Option<&[u8; KEY_SIZE]>,
) -> Result<SessionKeys> {
    let shared = local.diffie_hellman(remote);

    let local_bytes = local.public_key().as_bytes();
    let remote_bytes = remote.as_bytes();
    let (lo, hi) = if local_bytes <= remote_bytes {
        (local_bytes, remote_bytes)
    } else {
        (remote_bytes, local_bytes)
    };

    let mut ikm = Zeroizing::new(Vec::with_capacity(KEY_SIZE * 4));
    if let Some(root) = prev_root {
        ikm.extend_from_slice(root);
    }
    ikm.extend_from_slice(shared.as_bytes());
    ikm.extend_from_slice(lo);
    ikm.extend_from_slice(hi);

    let root = kdf_derive(&ikm, 0, ROOT_CTX)?;
    let k1 = kdf_derive(&ikm, 1, SESSION_CTX)?;
    let k2 = kdf_derive(&ikm, 2, SESSION_CTX)?;

    // The lexicographically smaller key sends on k1; its peer receives there.
    let (tx, rx) = if local_bytes <= remote_bytes {
        (k1, k2)
    } else {
        (k2, k1)
    };

    Ok(SessionKeys { root, rx, tx })
}

/// Serde helper rendering 32-byte keys as base64 strings.
mod serde_key {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<[u8; 32], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let vec = STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        vec.try_into()
            .map_err(|_| serde::de::Error::custom("invalid key length"))
    }
}
