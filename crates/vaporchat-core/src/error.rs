//! Error types for the vaporchat core.
//!
//! Error payloads never carry key material and stay intentionally vague
//! where a precise reason would act as an oracle for an attacker.

use thiserror::Error;

/// Core error type for vaporchat operations.
#[derive(Error, Debug)]
pub enum Error {
    /// A cryptographic primitive failed or produced invalid output.
    /// Fatal to the session: key derivation can no longer be trusted.
    #[error("cryptographic operation failed")]
    Crypto(String),

    /// Signature verification failed or an AEAD tag did not match.
    /// Non-fatal: the message is discarded, the session stays up.
    #[error("message authentication failed")]
    Auth(String),

    /// The message's (counter, timestamp) pair was already accepted once.
    #[error("replayed message")]
    Replay,

    /// Envelope, frame, or control message is malformed.
    #[error("malformed wire data")]
    Codec(String),

    /// Peer verification failed or timed out.
    #[error("peer verification failed")]
    Verify(String),

    /// Socket or swarm error.
    #[error("transport error")]
    Transport(String),

    /// API preconditions violated (e.g. send before initialize).
    #[error("invalid usage")]
    Usage(String),
}

/// Result type alias using vaporchat's Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Stable kind tag for logs and upward error reporting.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::Crypto(_) => "crypto",
            Error::Auth(_) => "auth",
            Error::Replay => "replay",
            Error::Codec(_) => "codec",
            Error::Verify(_) => "verify",
            Error::Transport(_) => "transport",
            Error::Usage(_) => "usage",
        }
    }

    /// Whether this error must tear down the whole session.
    ///
    /// Only primitive failures are fatal; per-message authentication and
    /// replay failures discard the message and keep the session alive.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Crypto(_))
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_stable() {
        assert_eq!(Error::Crypto("x".into()).kind(), "crypto");
        assert_eq!(Error::Auth("x".into()).kind(), "auth");
        assert_eq!(Error::Replay.kind(), "replay");
        assert_eq!(Error::Codec("x".into()).kind(), "codec");
        assert_eq!(Error::Verify("x".into()).kind(), "verify");
        assert_eq!(Error::Transport("x".into()).kind(), "transport");
        assert_eq!(Error::Usage("x".into()).kind(), "usage");
    }

    #[test]
    fn test_only_crypto_is_fatal() {
        assert!(Error::Crypto("kdf".into()).is_fatal());
        assert!(!Error::Auth("tag".into()).is_fatal());
        assert!(!Error::Replay.is_fatal());
        assert!(!Error::Verify("timeout".into()).is_fatal());
    }

    #[test]
    fn test_display_does_not_leak_detail() {
        let e = Error::Auth("ed25519 signature mismatch for counter 7".into());
        assert_eq!(e.to_string(), "message authentication failed");
    }
}
