//! Wire protocol: envelope codec and the padding framer.
//!
//! Two layers. The envelope codec maps between the JSON wire form and typed
//! values; it performs no crypto and owns no key material. The framer turns
//! payloads into fixed-bucket datagrams and splits inbound streams back into
//! payloads.

mod envelope;
mod framer;

pub use envelope::{
    parse_frame, ControlFrame, Envelope, FileAck, FileChunk, InboundFrame, MessageBody,
    PlainMessage, FILE_KIND,
};
pub use framer::{decode, encode, jittered_now, now_ms, FrameReader, LENGTH_PREFIX_SIZE};
