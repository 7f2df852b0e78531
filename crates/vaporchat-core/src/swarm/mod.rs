//! The discovery swarm as consumed by the session layer.
//!
//! Peer discovery itself lives outside this crate; the session controller
//! only needs to announce under the 32-byte swarm key, look up other
//! members, and receive the resulting byte streams. This module names that
//! contract and ships a direct-mode TCP implementation for hosts that
//! already know where to dial.

mod tcp;

pub use tcp::TcpSwarm;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

/// How the swarm reaches peers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportMode {
    /// Dial peers directly.
    Direct,
    /// Route through an overlay tunnel.
    Overlay,
}

impl TransportMode {
    /// The other mode; tried when a join never produces a verified peer.
    pub fn flipped(self) -> Self {
        match self {
            TransportMode::Direct => TransportMode::Overlay,
            TransportMode::Overlay => TransportMode::Direct,
        }
    }
}

/// The 32-byte content address a room announces and looks up under.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SwarmKey(pub [u8; 32]);

impl fmt::Debug for SwarmKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SwarmKey({}…)", hex::encode(&self.0[..4]))
    }
}

/// Opaque identifier for a discovered peer.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct PeerId(String);

impl PeerId {
    /// Wrap an identifier handed out by the swarm.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The identifier string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Marker trait for the duplex byte streams the swarm hands out.
pub trait SwarmStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> SwarmStream for T {}

/// One connection delivered by the swarm, inbound or dialed.
pub struct SwarmConn {
    /// Who the swarm says is on the other end. Unauthenticated; the
    /// verification gate decides whether traffic flows.
    pub peer: PeerId,
    /// The raw byte stream.
    pub stream: Box<dyn SwarmStream>,
}

impl fmt::Debug for SwarmConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwarmConn").field("peer", &self.peer).finish_non_exhaustive()
    }
}

/// The discovery layer contract.
///
/// `join` announces under the key and looks up existing members; every
/// connection that results, in either direction, arrives on the returned
/// channel. `leave` withdraws the announcement and stops producing
/// connections. Joining again after a leave is allowed.
#[async_trait]
pub trait Swarm: Send + Sync {
    /// Announce + look up under `key`; connections arrive on the channel.
    async fn join(&self, key: &SwarmKey, mode: TransportMode) -> Result<mpsc::Receiver<SwarmConn>>;

    /// Withdraw from the swarm and stop accepting.
    async fn leave(&self) -> Result<()>;
}
