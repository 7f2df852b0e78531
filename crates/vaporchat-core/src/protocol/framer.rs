//! Bucket-padded framing.
//!
//! Outbound payloads get a 4-byte big-endian length prefix and zero padding
//! up to the next 256-byte boundary, so every datagram on the wire is one of
//! a small set of sizes. Inbound, the declared length is authoritative:
//! padding is discarded by arithmetic, never by scanning for zero bytes,
//! which would be ambiguous when the payload itself ends in zeros.

use crate::error::{Error, Result};
use crate::{BUCKET_SIZE, MAX_PAYLOAD_SIZE, TIMESTAMP_JITTER_MS};
use rand::Rng;

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Total on-wire size for a payload of `len` bytes.
fn padded_len(len: usize) -> usize {
    (LENGTH_PREFIX_SIZE + len).div_ceil(BUCKET_SIZE) * BUCKET_SIZE
}

/// Frame a payload: length prefix plus zero padding to the bucket boundary.
pub fn encode(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::Codec("payload too large".into()));
    }

    let total = padded_len(payload.len());
    let mut frame = vec![0u8; total];
    frame[..LENGTH_PREFIX_SIZE].copy_from_slice(&(payload.len() as u32).to_be_bytes());
    frame[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + payload.len()].copy_from_slice(payload);
    Ok(frame)
}

/// Extract the payload from one complete frame.
pub fn decode(frame: &[u8]) -> Result<Vec<u8>> {
    if frame.len() < LENGTH_PREFIX_SIZE {
        return Err(Error::Codec("frame shorter than length prefix".into()));
    }

    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    prefix.copy_from_slice(&frame[..LENGTH_PREFIX_SIZE]);
    let len = u32::from_be_bytes(prefix) as usize;

    if len > MAX_PAYLOAD_SIZE {
        return Err(Error::Codec("declared length too large".into()));
    }
    if LENGTH_PREFIX_SIZE + len > frame.len() {
        return Err(Error::Codec("declared length exceeds frame".into()));
    }

    Ok(frame[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + len].to_vec())
}

/// Splits an inbound byte stream into datagram payloads.
///
/// Accumulates bytes and yields one payload per complete padded frame.
#[derive(Debug, Default)]
pub struct FrameReader {
    buffer: Vec<u8>,
}

impl FrameReader {
    /// Create an empty reader.
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(BUCKET_SIZE * 4),
        }
    }

    /// Add received bytes to the buffer.
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Try to extract the next complete payload.
    ///
    /// Returns `Ok(Some(payload))` when a full padded frame is buffered,
    /// `Ok(None)` when more bytes are needed. On a malformed prefix the
    /// buffer is cleared and the connection should be dropped.
    pub fn try_next(&mut self) -> Result<Option<Vec<u8>>> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buffer[..LENGTH_PREFIX_SIZE]);
        let len = u32::from_be_bytes(prefix) as usize;

        if len > MAX_PAYLOAD_SIZE {
            self.buffer.clear();
            return Err(Error::Codec("declared length too large".into()));
        }

        let total = padded_len(len);
        if self.buffer.len() < total {
            return Ok(None);
        }

        let payload = self.buffer[LENGTH_PREFIX_SIZE..LENGTH_PREFIX_SIZE + len].to_vec();
        self.buffer.drain(..total);
        Ok(Some(payload))
    }

    /// Bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

/// Current wall clock in milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Current wall clock with uniform timing jitter applied.
///
/// Shifts the reading by up to ±250 ms so observers cannot correlate
/// envelope timestamps with network timing exactly.
pub fn jittered_now() -> i64 {
    let jitter = rand::rngs::OsRng.gen_range(-TIMESTAMP_JITTER_MS..=TIMESTAMP_JITTER_MS);
    now_ms().saturating_add(jitter)
}
