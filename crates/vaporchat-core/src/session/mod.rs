//! Session layer: verification gate, per-peer sessions, the controller
//! that owns them, and file transfers.

mod controller;
mod peer;
mod transfer;
mod verifier;

pub use controller::{ChatEvent, ConnectionStatus, MessageId, SessionController};
pub use peer::PeerSession;
pub use transfer::{
    FileMetadata, FileTransferManager, TransferEvent, TransferId, TransferState,
    MAX_CHUNK_ATTEMPTS,
};
pub use verifier::{challenge_response, verify_response, PeerVerifier, VerifyState};
