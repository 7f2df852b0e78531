//! Room-membership verification.
//!
//! Each freshly connected socket starts behind a gate: we send a 32-byte
//! challenge, the peer answers with HMAC-SHA256 over it keyed by the room
//! PSK, and only a correct answer opens the gate. The gate authenticates
//! membership before any ratchet traffic flows; it complements the
//! per-message AEAD rather than replacing it.

use crate::crypto::{random_bytes, RoomPsk};
use crate::error::{Error, Result};
use crate::protocol::{now_ms, ControlFrame};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tokio::time::Instant;

type HmacSha256 = Hmac<Sha256>;

/// Compute the response to a membership challenge.
pub fn challenge_response(psk: &RoomPsk, challenge: &[u8; 32]) -> Result<[u8; 32]> {
    let mut mac = HmacSha256::new_from_slice(psk.as_bytes())
        .map_err(|_| Error::Crypto("HMAC key rejected".into()))?;
    mac.update(challenge);
    Ok(mac.finalize().into_bytes().into())
}

/// Check a response against our challenge, in constant time.
pub fn verify_response(psk: &RoomPsk, challenge: &[u8; 32], response: &[u8; 32]) -> bool {
    let mut mac = match HmacSha256::new_from_slice(psk.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };
    mac.update(challenge);
    mac.verify_slice(response).is_ok()
}

/// Where a socket stands with the gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyState {
    /// Challenge sent, waiting for the response.
    Pending,
    /// Response matched; application traffic may flow.
    Verified,
    /// Response wrong or timed out; the socket must be dropped.
    Failed,
}

/// Verification state machine for one socket.
pub struct PeerVerifier {
    state: VerifyState,
    challenge: [u8; 32],
    deadline: Instant,
}

impl PeerVerifier {
    /// Arm the gate: generates the challenge and starts the timeout.
    pub fn new(timeout: std::time::Duration) -> Self {
        Self {
            state: VerifyState::Pending,
            challenge: random_bytes(),
            deadline: Instant::now() + timeout,
        }
    }

    /// The challenge frame to send as soon as the socket opens.
    pub fn initial_challenge(&self) -> ControlFrame {
        ControlFrame::VerificationChallenge {
            challenge: self.challenge,
        }
    }

    /// When the pending state expires.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Current state.
    pub fn state(&self) -> VerifyState {
        self.state
    }

    /// Whether traffic may flow.
    pub fn is_verified(&self) -> bool {
        self.state == VerifyState::Verified
    }

    /// Mark the gate failed because the deadline passed.
    pub fn expire(&mut self) -> Error {
        self.state = VerifyState::Failed;
        Error::Verify("verification timed out".into())
    }

    /// Feed one inbound control frame; returns the frames to send back.
    ///
    /// Anything that is not a verification frame is dropped while the gate
    /// is closed.
    pub fn handle(&mut self, psk: &RoomPsk, frame: &ControlFrame) -> Result<Vec<ControlFrame>> {
        match frame {
            ControlFrame::VerificationChallenge { challenge } => {
                Ok(vec![ControlFrame::VerificationResponse {
                    response: challenge_response(psk, challenge)?,
                }])
            }
            ControlFrame::VerificationResponse { response } => {
                if verify_response(psk, &self.challenge, response) {
                    self.state = VerifyState::Verified;
                    Ok(vec![ControlFrame::VerificationSuccess {
                        timestamp: now_ms(),
                    }])
                } else {
                    self.state = VerifyState::Failed;
                    Err(Error::Verify("challenge response mismatch".into()))
                }
            }
            // The peer telling us it opened its side of the gate.
            ControlFrame::VerificationSuccess { .. } => Ok(Vec::new()),
            // Not a verification frame; dropped while unverified.
            _ => Ok(Vec::new()),
        }
    }
}

impl std::fmt::Debug for PeerVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerVerifier")
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::{LocalIdentity, RoomId, RoomKeys};
    use std::time::Duration;

    fn psk() -> RoomPsk {
        let room = RoomId::new("gate-test").expect("room");
        let local = LocalIdentity::generate().bundle();
        let peer = LocalIdentity::generate().bundle();
        RoomKeys::derive(&room, &local, &peer).psk
    }

    fn psk_pair() -> (RoomPsk, RoomPsk) {
        let room = RoomId::new("gate-test").expect("room");
        let alice = LocalIdentity::generate().bundle();
        let bob = LocalIdentity::generate().bundle();
        (
            RoomKeys::derive(&room, &alice, &bob).psk,
            RoomKeys::derive(&room, &bob, &alice).psk,
        )
    }

    #[test]
    fn test_response_roundtrip() {
        let psk = psk();
        let challenge = [5u8; 32];
        let response = challenge_response(&psk, &challenge).expect("mac");
        assert!(verify_response(&psk, &challenge, &response));
        assert!(!verify_response(&psk, &[6u8; 32], &response));
    }

    #[test]
    fn test_mutual_verification() {
        let (psk_a, psk_b) = psk_pair();
        let mut alice = PeerVerifier::new(Duration::from_secs(10));
        let mut bob = PeerVerifier::new(Duration::from_secs(10));

        // Each side answers the other's challenge.
        let to_alice = bob
            .handle(&psk_b, &alice.initial_challenge())
            .expect("bob responds");
        let to_bob = alice
            .handle(&psk_a, &bob.initial_challenge())
            .expect("alice responds");

        // Each side checks the answer and opens the gate.
        let success_b = alice.handle(&psk_a, &to_alice[0]).expect("alice verifies");
        let success_a = bob.handle(&psk_b, &to_bob[0]).expect("bob verifies");

        assert!(alice.is_verified());
        assert!(bob.is_verified());
        assert!(matches!(
            success_b[0],
            ControlFrame::VerificationSuccess { .. }
        ));
        assert!(matches!(
            success_a[0],
            ControlFrame::VerificationSuccess { .. }
        ));
    }

    #[test]
    fn test_wrong_psk_fails() {
        // Two endpoints that disagree on the bundle set derive different PSKs.
        let psk_good = psk();
        let psk_bad = psk();

        let mut gate = PeerVerifier::new(Duration::from_secs(10));
        let challenge = gate.initial_challenge();
        let response = match gate.handle(&psk_bad, &challenge).expect("respond").remove(0) {
            frame @ ControlFrame::VerificationResponse { .. } => frame,
            other => panic!("unexpected: {:?}", other),
        };

        let result = gate.handle(&psk_good, &response);
        assert!(matches!(result, Err(Error::Verify(_))));
        assert_eq!(gate.state(), VerifyState::Failed);
    }

    #[test]
    fn test_non_verification_frames_dropped_while_pending() {
        let psk = psk();
        let mut gate = PeerVerifier::new(Duration::from_secs(10));
        let replies = gate
            .handle(
                &psk,
                &ControlFrame::Keepalive {
                    timestamp: 1,
                    pad: [0u8; 32],
                },
            )
            .expect("handled");
        assert!(replies.is_empty());
        assert_eq!(gate.state(), VerifyState::Pending);
    }

    #[test]
    fn test_expire_marks_failed() {
        let mut gate = PeerVerifier::new(Duration::from_millis(1));
        let err = gate.expire();
        assert_eq!(err.kind(), "verify");
        assert_eq!(gate.state(), VerifyState::Failed);
    }
}
