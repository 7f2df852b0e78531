//! # vaporchat core library
//!
//! The secure-messaging core of a peer-to-peer ephemeral chat system.
//! Peers that discovered each other through a content-addressed swarm keyed
//! by a shared room identifier use this crate to run an authenticated,
//! forward-secret channel with traffic shaping.
//!
//! ## Security model
//!
//! - Per-message keys derived from ratcheting chain keys
//! - Periodic Diffie-Hellman rotation mixed into the root key
//! - Sender-authenticated envelopes (detached Ed25519 over the ciphertext)
//! - Room membership gated by a PSK challenge/response before any traffic
//! - Every datagram padded to a fixed bucket, constant-cadence cover traffic
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │               Host / UI                  │
//! ├──────────────────────────────────────────┤
//! │   session (controller, verifier, files)  │
//! ├──────────────────────────────────────────┤
//! │        protocol (envelope, framer)       │
//! ├──────────────────────────────────────────┤
//! │       crypto        │       swarm        │
//! └──────────────────────────────────────────┘
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms, clippy::all)]
#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod config;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod session;
pub mod swarm;

pub use error::{Error, Result};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Every frame on the wire is zero-padded to a multiple of this size.
pub const BUCKET_SIZE: usize = 256;

/// Maximum frame payload size. Sized so a full file chunk still fits after
/// base64 and envelope overhead.
pub const MAX_PAYLOAD_SIZE: usize = 2 * 1024 * 1024;

/// Outbound message timestamps are shifted by up to this many milliseconds
/// in either direction.
pub const TIMESTAMP_JITTER_MS: i64 = 250;

/// Cover-traffic keep-alive cadence per verified session, in milliseconds.
pub const KEEPALIVE_INTERVAL_MS: u64 = 2_000;

/// A peer that has not completed verification within this window is dropped.
pub const VERIFY_TIMEOUT_SECS: u64 = 10;

/// If no peer verifies within this window after joining, the transport mode
/// is flipped and the join retried.
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Delay before the single scheduled reconnect after the last peer is lost.
pub const RECONNECT_DELAY_SECS: u64 = 5;

/// A fresh DH keypair is mixed in after this many messages sent on a chain.
pub const ROTATION_SEND_LIMIT: u32 = 100;

/// File transfers are split into chunks of this size (1 MiB).
pub const CHUNK_SIZE: usize = 1024 * 1024;

/// Upper bound on chunks in flight per transfer.
pub const MAX_CONCURRENT_CHUNKS: usize = 3;
