//! Ratcheted room encryption.
//!
//! Every message key is derived from a per-direction chain key and a
//! counter; a fresh DH keypair is mixed into the root key every
//! [`ROTATION_SEND_LIMIT`](crate::ROTATION_SEND_LIMIT) sends, or as soon as
//! the peer is observed using a new key. Compromising the current state
//! therefore exposes at most one chain segment of traffic.
//!
//! ## Chain layout
//!
//! One DH agreement yields a root key (identical on both endpoints) and two
//! directional subkeys; the sending chain grows out of the local `tx`
//! subkey and the receiving chain out of `rx`, so a mirrored peer holds the
//! complementary chains. Rotations fold the outgoing root into the next
//! agreement.
//!
//! ## Rotation on receive
//!
//! An envelope that carries an unknown sender DH key is decrypted under a
//! staged copy of the rotated state; the rotation is committed only after
//! the AEAD opens and the authenticated key inside the plaintext matches
//! the one on the envelope. A forged outer key can therefore never move the
//! session's state.

use super::{
    aead, constant_time_eq, kdf_derive,
    keys::{session_keys, DhKeypair, DhPublicKey, PreKeyBundle, SigningKeypair, VerifyingKey},
    random_bytes,
    replay::ReplayWindow,
    KEY_SIZE,
};
use crate::error::{Error, Result};
use crate::protocol::{ControlFrame, Envelope, MessageBody, PlainMessage};
use crate::ROTATION_SEND_LIMIT;
use zeroize::{Zeroize, Zeroizing};

/// Domain separation for chain keys.
const CHAIN_CTX: &[u8; 8] = b"vpr_chn_";

/// Domain separation for per-message keys.
const MSG_CTX: &[u8; 8] = b"vpr_msg_";

/// How far behind the current receive counter trial decryption reaches.
///
/// Bounds the work done for a signature-valid envelope that does not open
/// at the current counter, and matches the replay window: anything older is
/// rejected outright.
const TRIAL_WINDOW: u32 = 128;

type ChainKey = Zeroizing<[u8; KEY_SIZE]>;

/// Ratchet state for one conversation.
///
/// Owned by exactly one task; encrypt and decrypt are strictly serial,
/// which preserves the counter-to-key ordering the chains depend on.
pub struct Ratchet {
    dh_local: DhKeypair,
    dh_remote: DhPublicKey,
    signing: SigningKeypair,
    remote_verify: VerifyingKey,
    root: ChainKey,
    sending: ChainKey,
    receiving: ChainKey,
    send_count: u32,
    recv_count: u32,
    replay: ReplayWindow,
}

impl Ratchet {
    /// Initialize from the local identity and the peer's pre-key bundle.
    pub fn new(
        dh_local: DhKeypair,
        signing: SigningKeypair,
        remote: &PreKeyBundle,
    ) -> Result<Self> {
        let keys = session_keys(&dh_local, &remote.dh, None)?;
        let sending = kdf_derive(keys.tx.as_ref(), 1, CHAIN_CTX)?;
        let receiving = kdf_derive(keys.rx.as_ref(), 1, CHAIN_CTX)?;

        Ok(Self {
            dh_local,
            dh_remote: remote.dh.clone(),
            signing,
            remote_verify: remote.sig.clone(),
            root: keys.root,
            sending,
            receiving,
            send_count: 0,
            recv_count: 0,
            replay: ReplayWindow::new(),
        })
    }

    /// Messages sent on the current sending chain.
    pub fn send_count(&self) -> u32 {
        self.send_count
    }

    /// Messages received on the current receiving chain.
    pub fn recv_count(&self) -> u32 {
        self.recv_count
    }

    /// Our current DH public key, as carried on outbound envelopes.
    pub fn local_public(&self) -> &DhPublicKey {
        self.dh_local.public_key()
    }

    /// The peer's current DH public key.
    pub fn remote_public(&self) -> &DhPublicKey {
        &self.dh_remote
    }

    /// Mix a fresh DH keypair into the root and restart both chains.
    pub fn rotate(&mut self) -> Result<()> {
        let next = DhKeypair::generate();
        let keys = session_keys(&next, &self.dh_remote, Some(&*self.root))?;
        let sending = kdf_derive(keys.tx.as_ref(), 1, CHAIN_CTX)?;
        let receiving = kdf_derive(keys.rx.as_ref(), 1, CHAIN_CTX)?;

        // Assigning drops the outgoing chain keys, which zeroizes them.
        self.root = keys.root;
        self.sending = sending;
        self.receiving = receiving;
        self.dh_local = next;
        self.send_count = 0;
        self.recv_count = 0;
        self.replay.advance_epoch();
        Ok(())
    }

    /// Encrypt an application message, rotating first if the chain is due.
    pub fn encrypt(&mut self, body: MessageBody, timestamp: i64) -> Result<Envelope> {
        if self.send_count >= ROTATION_SEND_LIMIT {
            self.rotate()?;
        }
        self.seal(body, timestamp, true)
    }

    /// Encrypt a keep-alive without consuming a counter.
    ///
    /// Reuses the key slot of the next real message; the random nonce keeps
    /// the reuse safe, and the receiver leaves its counter untouched too.
    pub fn encrypt_keepalive(&mut self, timestamp: i64) -> Result<Envelope> {
        let body = MessageBody::Control(ControlFrame::Keepalive {
            timestamp,
            pad: random_bytes(),
        });
        self.seal(body, timestamp, false)
    }

    /// Encrypt a keep-alive acknowledgement without consuming a counter.
    pub fn encrypt_keepalive_ack(&mut self, timestamp: i64) -> Result<Envelope> {
        let body = MessageBody::Control(ControlFrame::KeepaliveAck { timestamp });
        self.seal(body, timestamp, false)
    }

    fn seal(&mut self, body: MessageBody, timestamp: i64, advance: bool) -> Result<Envelope> {
        let k_m = kdf_derive(self.sending.as_ref(), u64::from(self.send_count), MSG_CTX)?;

        let kind = body.wire_kind();
        let message = PlainMessage {
            content: body,
            timestamp,
            counter: self.send_count,
            dh_key: *self.dh_local.public_key().as_bytes(),
        };
        let plaintext = Zeroizing::new(serde_json::to_vec(&message)?);

        let nonce = aead::Nonce::random();
        let cipher = aead::encrypt(&k_m, &nonce, &plaintext)?;
        let sig = self.signing.sign(&cipher);

        if advance {
            self.send_count += 1;
        }

        Ok(Envelope {
            nonce: *nonce.as_bytes(),
            cipher,
            sig,
            dh: self.dh_local.public_key().clone(),
            kind,
        })
    }

    /// Authenticate and decrypt an inbound envelope.
    ///
    /// `Auth` and `Replay` failures leave the state untouched; the caller
    /// discards the message and keeps the session.
    pub fn decrypt(&mut self, envelope: &Envelope) -> Result<PlainMessage> {
        self.remote_verify.verify(&envelope.cipher, &envelope.sig)?;

        if constant_time_eq(envelope.dh.as_bytes(), self.dh_remote.as_bytes()) {
            let (message, used_id) =
                open_with_chain(&self.receiving, self.recv_count, envelope)?;
            self.replay
                .check_and_insert(message.counter, message.timestamp)?;
            if used_id == self.recv_count && !is_cover(&message.content) {
                self.recv_count += 1;
            }
            Ok(message)
        } else {
            // The peer rotated. Stage the new state, prove the envelope
            // opens under it, then commit.
            let keys = session_keys(&self.dh_local, &envelope.dh, Some(&*self.root))?;
            let receiving = kdf_derive(keys.rx.as_ref(), 1, CHAIN_CTX)?;
            let (message, used_id) = open_with_chain(&receiving, 0, envelope)?;
            if !constant_time_eq(&message.dh_key, envelope.dh.as_bytes()) {
                return Err(Error::Auth("ratchet key mismatch".into()));
            }

            let sending = kdf_derive(keys.tx.as_ref(), 1, CHAIN_CTX)?;
            self.root = keys.root;
            self.sending = sending;
            self.receiving = receiving;
            self.dh_remote = envelope.dh.clone();
            self.send_count = 0;
            self.recv_count = 0;
            self.replay.advance_epoch();

            self.replay
                .check_and_insert(message.counter, message.timestamp)?;
            if used_id == 0 && !is_cover(&message.content) {
                self.recv_count = 1;
            }
            Ok(message)
        }
    }

    /// Zero every key buffer in place.
    ///
    /// Called on teardown; the buffers also zeroize when dropped.
    pub fn wipe(&mut self) {
        self.root.zeroize();
        self.sending.zeroize();
        self.receiving.zeroize();
        self.send_count = 0;
        self.recv_count = 0;
        self.replay.clear();
    }

    #[cfg(test)]
    fn keys_zeroed(&self) -> bool {
        self.root.iter().all(|&b| b == 0)
            && self.sending.iter().all(|&b| b == 0)
            && self.receiving.iter().all(|&b| b == 0)
    }
}

impl std::fmt::Debug for Ratchet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ratchet")
            .field("local", self.dh_local.public_key())
            .field("remote", &self.dh_remote)
            .field("send_count", &self.send_count)
            .field("recv_count", &self.recv_count)
            .finish_non_exhaustive()
    }
}

/// Trial-decrypt under a receiving chain.
///
/// Tries the expected counter first, then walks back through the replay
/// window so a replayed envelope still opens and can be reported as a
/// replay rather than a forgery. Only reached for envelopes that already
/// carry a valid peer signature.
fn open_with_chain(
    chain: &ChainKey,
    expected: u32,
    envelope: &Envelope,
) -> Result<(PlainMessage, u32)> {
    let floor = expected.saturating_sub(TRIAL_WINDOW);
    let nonce = aead::Nonce::from_bytes(envelope.nonce);

    for id in (floor..=expected).rev() {
        let k_m = kdf_derive(chain.as_ref(), u64::from(id), MSG_CTX)?;
        let Ok(plaintext) = aead::decrypt(&k_m, &nonce, &envelope.cipher) else {
            continue;
        };
        let message: PlainMessage =
            serde_json::from_slice(&plaintext).map_err(|e| Error::Codec(e.to_string()))?;
        if message.counter != id {
            return Err(Error::Auth("counter mismatch".into()));
        }
        return Ok((message, id));
    }

    Err(Error::Auth("no message key opens envelope".into()))
}

fn is_cover(body: &MessageBody) -> bool {
    matches!(
        body,
        MessageBody::Control(ControlFrame::Keepalive { .. })
            | MessageBody::Control(ControlFrame::KeepaliveAck { .. })
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::jittered_now;

    fn mirrored_pair() -> (Ratchet, Ratchet) {
        let alice_dh = DhKeypair::generate();
        let alice_sig = SigningKeypair::generate();
        let bob_dh = DhKeypair::generate();
        let bob_sig = SigningKeypair::generate();

        let alice_bundle = PreKeyBundle {
            dh: alice_dh.public_key().clone(),
            sig: alice_sig.verifying_key(),
        };
        let bob_bundle = PreKeyBundle {
            dh: bob_dh.public_key().clone(),
            sig: bob_sig.verifying_key(),
        };

        let alice = Ratchet::new(alice_dh, alice_sig, &bob_bundle).expect("alice");
        let bob = Ratchet::new(bob_dh, bob_sig, &alice_bundle).expect("bob");
        (alice, bob)
    }

    fn text(s: &str) -> MessageBody {
        MessageBody::Text(s.to_string())
    }

    #[test]
    fn test_basic_exchange() {
        let (mut alice, mut bob) = mirrored_pair();

        let envelope = alice.encrypt(text("hello"), jittered_now()).expect("encrypt");
        let message = bob.decrypt(&envelope).expect("decrypt");
        assert_eq!(message.content, text("hello"));
        assert_eq!(bob.recv_count(), 1);

        let reply = bob.encrypt(text("hi back"), jittered_now()).expect("encrypt");
        let message = alice.decrypt(&reply).expect("decrypt");
        assert_eq!(message.content, text("hi back"));
    }

    #[test]
    fn test_counters_stay_in_lockstep() {
        let (mut alice, mut bob) = mirrored_pair();

        for i in 0..20 {
            assert_eq!(alice.send_count(), i);
            assert_eq!(bob.recv_count(), i);
            let envelope = alice
                .encrypt(text(&format!("msg {i}")), jittered_now())
                .expect("encrypt");
            bob.decrypt(&envelope).expect("decrypt");
        }
        assert_eq!(alice.send_count(), 20);
        assert_eq!(bob.recv_count(), 20);
    }

    #[test]
    fn test_replayed_envelope_is_detected() {
        let (mut alice, mut bob) = mirrored_pair();

        let envelope = alice.encrypt(text("m"), jittered_now()).expect("encrypt");
        bob.decrypt(&envelope).expect("first copy");

        let again = bob.decrypt(&envelope);
        assert!(matches!(again, Err(Error::Replay)));
        // Counter untouched; the session keeps working.
        assert_eq!(bob.recv_count(), 1);
        let next = alice.encrypt(text("n"), jittered_now()).expect("encrypt");
        bob.decrypt(&next).expect("decrypt");
    }

    #[test]
    fn test_cipher_bit_flip_fails_auth() {
        let (mut alice, mut bob) = mirrored_pair();

        let envelope = alice.encrypt(text("m"), jittered_now()).expect("encrypt");
        for bit in 0..8 {
            let mut tampered = envelope.clone();
            tampered.cipher[0] ^= 1 << bit;
            assert!(matches!(bob.decrypt(&tampered), Err(Error::Auth(_))));
        }
        // The untampered original still decrypts.
        bob.decrypt(&envelope).expect("decrypt");
    }

    #[test]
    fn test_sig_bit_flip_fails_auth() {
        let (mut alice, mut bob) = mirrored_pair();

        let envelope = alice.encrypt(text("m"), jittered_now()).expect("encrypt");
        let mut tampered = envelope.clone();
        tampered.sig[10] ^= 0x04;
        assert!(matches!(bob.decrypt(&tampered), Err(Error::Auth(_))));
    }

    #[test]
    fn test_foreign_signature_fails_auth() {
        let (mut alice, mut bob) = mirrored_pair();

        let mallory = SigningKeypair::generate();
        let mut envelope = alice.encrypt(text("m"), jittered_now()).expect("encrypt");
        envelope.sig = mallory.sign(&envelope.cipher);
        assert!(matches!(bob.decrypt(&envelope), Err(Error::Auth(_))));
        // Session unharmed.
        let good = alice.encrypt(text("n"), jittered_now()).expect("encrypt");
        bob.decrypt(&good).expect("decrypt");
    }

    #[test]
    fn test_rotation_after_send_limit() {
        let (mut alice, mut bob) = mirrored_pair();

        let mut last_dh = alice.local_public().clone();
        for i in 0..ROTATION_SEND_LIMIT {
            let envelope = alice
                .encrypt(text(&format!("msg {i}")), jittered_now())
                .expect("encrypt");
            assert_eq!(envelope.dh, last_dh);
            bob.decrypt(&envelope).expect("decrypt");
        }
        assert_eq!(bob.recv_count(), ROTATION_SEND_LIMIT);

        // Send 101 carries a fresh key and restarts both sides.
        let envelope = alice.encrypt(text("rotated"), jittered_now()).expect("encrypt");
        assert_ne!(envelope.dh, last_dh);
        last_dh = envelope.dh.clone();

        let message = bob.decrypt(&envelope).expect("decrypt");
        assert_eq!(message.content, text("rotated"));
        assert_eq!(bob.recv_count(), 1);
        assert_eq!(bob.remote_public(), &last_dh);

        // Conversation continues both ways on the new chains.
        let envelope = alice.encrypt(text("after"), jittered_now()).expect("encrypt");
        bob.decrypt(&envelope).expect("decrypt");
        let reply = bob.encrypt(text("reply"), jittered_now()).expect("encrypt");
        alice.decrypt(&reply).expect("decrypt");
    }

    #[test]
    fn test_explicit_rotation_resets_counters() {
        let (mut alice, mut bob) = mirrored_pair();

        for _ in 0..5 {
            let envelope = alice.encrypt(text("x"), jittered_now()).expect("encrypt");
            bob.decrypt(&envelope).expect("decrypt");
        }
        alice.rotate().expect("rotate");
        assert_eq!(alice.send_count(), 0);

        let envelope = alice.encrypt(text("fresh"), jittered_now()).expect("encrypt");
        let message = bob.decrypt(&envelope).expect("decrypt");
        assert_eq!(message.content, text("fresh"));
        assert_eq!(bob.recv_count(), 1);
    }

    #[test]
    fn test_forged_outer_key_does_not_move_state() {
        let (mut alice, mut bob) = mirrored_pair();

        let envelope = alice.encrypt(text("m"), jittered_now()).expect("encrypt");
        let remote_before = bob.remote_public().clone();

        let mut forged = envelope.clone();
        forged.dh = DhKeypair::generate().public_key().clone();
        // Signature still the peer's, but the staged chains cannot open it.
        assert!(matches!(bob.decrypt(&forged), Err(Error::Auth(_))));
        assert_eq!(bob.remote_public(), &remote_before);

        bob.decrypt(&envelope).expect("original still decrypts");
    }

    #[test]
    fn test_keepalive_does_not_advance_counters() {
        let (mut alice, mut bob) = mirrored_pair();

        let ka = alice.encrypt_keepalive(jittered_now()).expect("keepalive");
        assert_eq!(alice.send_count(), 0);
        let message = bob.decrypt(&ka).expect("decrypt");
        assert!(matches!(
            message.content,
            MessageBody::Control(ControlFrame::Keepalive { .. })
        ));
        assert_eq!(bob.recv_count(), 0);

        // A real message still flows at the shared counter.
        let envelope = alice.encrypt(text("real"), jittered_now()).expect("encrypt");
        let message = bob.decrypt(&envelope).expect("decrypt");
        assert_eq!(message.content, text("real"));
        assert_eq!(bob.recv_count(), 1);
    }

    #[test]
    fn test_keepalive_replay_detected() {
        let (mut alice, mut bob) = mirrored_pair();

        let ka = alice.encrypt_keepalive(jittered_now()).expect("keepalive");
        bob.decrypt(&ka).expect("first");
        assert!(matches!(bob.decrypt(&ka), Err(Error::Replay)));
    }

    #[test]
    fn test_wipe_zeroes_key_buffers() {
        let (mut alice, _bob) = mirrored_pair();
        alice.encrypt(text("m"), jittered_now()).expect("encrypt");
        assert!(!alice.keys_zeroed());

        alice.wipe();
        assert!(alice.keys_zeroed());
        assert_eq!(alice.send_count(), 0);
    }

    #[test]
    fn test_keepalives_survive_rotation() {
        let (mut alice, mut bob) = mirrored_pair();

        for _ in 0..ROTATION_SEND_LIMIT {
            let envelope = alice.encrypt(text("x"), jittered_now()).expect("encrypt");
            bob.decrypt(&envelope).expect("decrypt");
        }
        // Keep-alive sealed after the limit still rides the old chain; the
        // rotation only happens on the next real send.
        let ka = alice.encrypt_keepalive(jittered_now()).expect("keepalive");
        bob.decrypt(&ka).expect("decrypt keepalive");

        let envelope = alice.encrypt(text("rotated"), jittered_now()).expect("encrypt");
        bob.decrypt(&envelope).expect("decrypt");
        assert_eq!(bob.recv_count(), 1);
    }
}
