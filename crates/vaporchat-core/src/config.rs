//! Session controller configuration.
//!
//! Defaults match the protocol constants; tests shorten the timers.

use crate::crypto::{LocalIdentity, PreKeyBundle, RoomId};
use crate::swarm::TransportMode;
use crate::{
    CONNECT_TIMEOUT_SECS, KEEPALIVE_INTERVAL_MS, RECONNECT_DELAY_SECS, VERIFY_TIMEOUT_SECS,
};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one [`SessionController`](crate::session::SessionController).
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    /// The room to join.
    pub room: RoomId,
    /// This endpoint's key material.
    pub identity: LocalIdentity,
    /// The peer bundle received out of band.
    pub peer_bundle: PreKeyBundle,
    /// Transport mode for the initial join.
    pub mode: TransportMode,
    /// Cover-traffic cadence per verified session.
    pub keepalive_interval: Duration,
    /// How long an unverified peer may linger.
    pub verify_timeout: Duration,
    /// How long to wait for a verified peer before flipping transport mode.
    pub connect_timeout: Duration,
    /// Delay before the single reconnect attempt after losing the last peer.
    pub reconnect_delay: Duration,
    /// Auth failures from one peer within [`Self::auth_strike_window`]
    /// before that peer is torn down.
    pub max_auth_strikes: u32,
    /// Window for counting auth failures.
    pub auth_strike_window: Duration,
    /// How long an upload round waits for chunk receipts before resending.
    pub transfer_ack_timeout: Duration,
    /// Where completed inbound transfers are written.
    pub download_dir: PathBuf,
}

impl ControllerConfig {
    /// Build a config with protocol-default timings.
    pub fn new(room: RoomId, identity: LocalIdentity, peer_bundle: PreKeyBundle) -> Self {
        Self {
            room,
            identity,
            peer_bundle,
            mode: TransportMode::Direct,
            keepalive_interval: Duration::from_millis(KEEPALIVE_INTERVAL_MS),
            verify_timeout: Duration::from_secs(VERIFY_TIMEOUT_SECS),
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            reconnect_delay: Duration::from_secs(RECONNECT_DELAY_SECS),
            max_auth_strikes: 5,
            auth_strike_window: Duration::from_secs(10),
            transfer_ack_timeout: Duration::from_secs(10),
            download_dir: std::env::temp_dir(),
        }
    }
}
