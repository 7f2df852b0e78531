//! Per-connection session state.
//!
//! One `PeerSession` exists per socket and is owned by exactly one task;
//! the ratchet inside is never shared. Created when the swarm hands over a
//! connection, destroyed on disconnect, verification timeout, or when the
//! peer burns through its authentication strikes.

use crate::config::ControllerConfig;
use crate::crypto::Ratchet;
use crate::error::Result;
use crate::protocol::FrameReader;
use crate::session::verifier::PeerVerifier;
use crate::swarm::PeerId;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Sliding-window counter for authentication failures.
///
/// A forged envelope now and then is dropped quietly, but a peer producing
/// them in bursts is cut off.
#[derive(Debug)]
pub struct AuthStrikes {
    window: Duration,
    max: u32,
    failures: VecDeque<Instant>,
}

impl AuthStrikes {
    /// Create a counter allowing `max` failures per `window`.
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            window,
            max,
            failures: VecDeque::new(),
        }
    }

    /// Record a failure; returns true when the peer should be dropped.
    pub fn record(&mut self) -> bool {
        let now = Instant::now();
        self.failures.push_back(now);
        while let Some(&front) = self.failures.front() {
            if now.duration_since(front) > self.window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.len() as u32 >= self.max
    }
}

/// State for one connected peer.
pub struct PeerSession {
    /// Swarm-assigned identifier.
    pub id: PeerId,
    /// Membership gate.
    pub verifier: PeerVerifier,
    /// This conversation's ratchet.
    pub ratchet: Ratchet,
    /// Inbound stream splitter.
    pub reader: FrameReader,
    /// Last time any frame arrived.
    pub last_seen: Instant,
    strikes: AuthStrikes,
}

impl PeerSession {
    /// Set up state for a fresh connection.
    pub fn new(id: PeerId, config: &ControllerConfig) -> Result<Self> {
        let ratchet = Ratchet::new(
            config.identity.dh.clone(),
            config.identity.signing.clone(),
            &config.peer_bundle,
        )?;
        Ok(Self {
            id,
            verifier: PeerVerifier::new(config.verify_timeout),
            ratchet,
            reader: FrameReader::new(),
            last_seen: Instant::now(),
            strikes: AuthStrikes::new(config.max_auth_strikes, config.auth_strike_window),
        })
    }

    /// Whether application traffic may flow.
    pub fn is_verified(&self) -> bool {
        self.verifier.is_verified()
    }

    /// Note inbound activity.
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Record an auth failure; returns true when the peer must be dropped.
    pub fn note_auth_failure(&mut self) -> bool {
        self.strikes.record()
    }

    /// Wipe key material on the way out.
    pub fn destroy(&mut self) {
        self.ratchet.wipe();
    }
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerSession")
            .field("id", &self.id)
            .field("verifier", &self.verifier)
            .finish_non_exhaustive()
    }
}
