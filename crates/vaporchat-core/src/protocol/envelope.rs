//! Envelope and control-frame codec.
//!
//! Every datagram payload is JSON: either a sealed [`Envelope`] or, before
//! the peer is verified, a plaintext [`ControlFrame`]. Byte fields travel as
//! base64 strings. The codec validates shape only; signatures and AEAD tags
//! are checked by the ratchet.

use crate::crypto::DhPublicKey;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Envelope kind tag carried by file-transfer envelopes.
pub const FILE_KIND: &str = "file";

/// Wire form of an encrypted message.
///
/// The sender's current DH public key rides in the clear so the receiver
/// can stage a rotation before deriving the message key; the copy inside
/// the ciphertext is the authenticated one and must match after decryption.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Random 24-byte AEAD nonce.
    #[serde(with = "b64_array")]
    pub nonce: [u8; 24],
    /// Ciphertext with appended tag.
    #[serde(with = "b64_vec")]
    pub cipher: Vec<u8>,
    /// Detached Ed25519 signature over `cipher`.
    #[serde(with = "b64_array")]
    pub sig: [u8; 64],
    /// Sender's current DH public key.
    pub dh: DhPublicKey,
    /// Kind tag; `"file"` for transfer envelopes, absent for text.
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl Envelope {
    /// Serialize to the JSON wire form.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(Error::from)
    }

    /// Parse and validate the JSON wire form.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        envelope.validate()?;
        Ok(envelope)
    }

    fn validate(&self) -> Result<()> {
        if self.cipher.is_empty() {
            return Err(Error::Codec("empty ciphertext".into()));
        }
        Ok(())
    }
}

/// The decrypted interior of an envelope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PlainMessage {
    /// Message payload.
    pub content: MessageBody,
    /// Sender wall clock in milliseconds, already jittered.
    pub timestamp: i64,
    /// Position in the sender's current sending chain.
    pub counter: u32,
    /// Sender's DH public key, authenticated by the AEAD tag.
    #[serde(rename = "dhKey", with = "b64_array")]
    pub dh_key: [u8; 32],
}

/// Message payload variants.
///
/// Untagged on the wire: text is a bare JSON string, everything else is an
/// object whose shape picks the variant. Order matters for deserialization.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageBody {
    /// Encrypted control traffic (keep-alives and their acks).
    Control(ControlFrame),
    /// One chunk of a file transfer.
    FileChunk(FileChunk),
    /// Receipt for one chunk.
    FileAck(FileAck),
    /// A chat message.
    Text(String),
}

impl MessageBody {
    /// The envelope kind tag this body travels under.
    pub fn wire_kind(&self) -> Option<String> {
        match self {
            MessageBody::FileChunk(_) | MessageBody::FileAck(_) => Some(FILE_KIND.to_string()),
            _ => None,
        }
    }
}

/// One chunk of a file transfer, with enough metadata to start assembly
/// from any chunk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileChunk {
    /// Transfer identifier.
    #[serde(rename = "transferId", with = "b64_array")]
    pub transfer_id: [u8; 16],
    /// Original filename.
    pub filename: String,
    /// Whole-file size in bytes.
    #[serde(rename = "fileSize")]
    pub file_size: u64,
    /// SHA-256 of the whole file.
    #[serde(rename = "fileChecksum", with = "b64_array")]
    pub file_checksum: [u8; 32],
    /// Chunk index, 0-based.
    pub index: u32,
    /// Total number of chunks.
    pub total: u32,
    /// SHA-256 of this chunk.
    #[serde(with = "b64_array")]
    pub checksum: [u8; 32],
    /// Chunk bytes.
    #[serde(with = "b64_vec")]
    pub data: Vec<u8>,
}

/// Receipt acknowledging one chunk.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileAck {
    /// Transfer identifier.
    #[serde(rename = "transferId", with = "b64_array")]
    pub transfer_id: [u8; 16],
    /// Acknowledged chunk index.
    pub index: u32,
}

/// Control frames, exchanged in plaintext only before verification.
///
/// Keep-alives and their acks reuse the same shapes but travel encrypted
/// once the session is verified.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Membership challenge from the peer that opened the gate.
    VerificationChallenge {
        /// 32 random bytes to be keyed with the room PSK.
        #[serde(with = "b64_array")]
        challenge: [u8; 32],
    },
    /// HMAC of the challenge under the room PSK.
    VerificationResponse {
        /// HMAC-SHA256(PSK, challenge).
        #[serde(with = "b64_array")]
        response: [u8; 32],
    },
    /// The challenger accepted the response.
    VerificationSuccess {
        /// Sender wall clock in milliseconds.
        timestamp: i64,
    },
    /// Constant-cadence cover packet.
    Keepalive {
        /// Jittered sender wall clock in milliseconds.
        timestamp: i64,
        /// Random filler so the padded size matches real traffic.
        #[serde(with = "b64_array")]
        pad: [u8; 32],
    },
    /// Immediate response to a keep-alive.
    KeepaliveAck {
        /// Sender wall clock in milliseconds.
        timestamp: i64,
    },
}

/// A parsed inbound datagram payload.
#[derive(Clone, Debug, PartialEq)]
pub enum InboundFrame {
    /// A sealed envelope for the ratchet.
    Envelope(Envelope),
    /// A plaintext control frame.
    Control(ControlFrame),
}

/// Parse a datagram payload into its frame variant.
pub fn parse_frame(payload: &[u8]) -> Result<InboundFrame> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawFrame {
        Control(ControlFrame),
        Envelope(Envelope),
    }

    match serde_json::from_slice(payload)? {
        RawFrame::Control(frame) => Ok(InboundFrame::Control(frame)),
        RawFrame::Envelope(envelope) => {
            envelope.validate()?;
            Ok(InboundFrame::Envelope(envelope))
        }
    }
}

/// Serde helper rendering fixed-size byte arrays as base64 strings.
pub(crate) mod b64_array {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, const N: usize>(bytes: &[u8; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D, const N: usize>(deserializer: D) -> Result<[u8; N], D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let vec = STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)?;
        vec.try_into()
            .map_err(|_| serde::de::Error::custom("invalid byte array length"))
    }
}

/// Serde helper rendering variable-size byte buffers as base64 strings.
pub(crate) mod b64_vec {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_envelope() -> Envelope {
        Envelope {
            nonce: [1u8; 24],
            cipher: vec![2u8; 48],
            sig: [3u8; 64],
            dh: DhPublicKey::from_bytes([4u8; 32]),
            kind: None,
        }
    }

    #[test]
    fn test_envelope_roundtrip() {
        let envelope = sample_envelope();
        let bytes = envelope.to_bytes().expect("encode");
        let parsed = Envelope::from_bytes(&bytes).expect("decode");
        assert_eq!(envelope, parsed);
    }

    #[test]
    fn test_file_envelope_carries_type_tag() {
        let mut envelope = sample_envelope();
        envelope.kind = Some(FILE_KIND.to_string());
        let bytes = envelope.to_bytes().expect("encode");
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.contains("\"type\":\"file\""));
    }

    #[test]
    fn test_text_envelope_omits_type_tag() {
        let bytes = sample_envelope().to_bytes().expect("encode");
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(!text.contains("\"type\""));
    }

    #[test]
    fn test_empty_cipher_rejected() {
        let mut envelope = sample_envelope();
        envelope.cipher.clear();
        let bytes = serde_json::to_vec(&envelope).expect("encode");
        assert!(matches!(Envelope::from_bytes(&bytes), Err(Error::Codec(_))));
    }

    #[test]
    fn test_malformed_json_rejected() {
        assert!(matches!(
            Envelope::from_bytes(b"{\"nonce\": 12}"),
            Err(Error::Codec(_))
        ));
        assert!(matches!(parse_frame(b"not json"), Err(Error::Codec(_))));
    }

    #[test]
    fn test_parse_frame_dispatches_control() {
        let frame = ControlFrame::VerificationChallenge {
            challenge: [7u8; 32],
        };
        let bytes = serde_json::to_vec(&frame).expect("encode");
        match parse_frame(&bytes).expect("parse") {
            InboundFrame::Control(ControlFrame::VerificationChallenge { challenge }) => {
                assert_eq!(challenge, [7u8; 32]);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_parse_frame_dispatches_envelope() {
        let envelope = sample_envelope();
        let bytes = envelope.to_bytes().expect("encode");
        match parse_frame(&bytes).expect("parse") {
            InboundFrame::Envelope(parsed) => assert_eq!(parsed, envelope),
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_file_kind_still_parses_as_envelope() {
        // The "type":"file" tag must not collide with control-frame tags.
        let mut envelope = sample_envelope();
        envelope.kind = Some(FILE_KIND.to_string());
        let bytes = envelope.to_bytes().expect("encode");
        assert!(matches!(
            parse_frame(&bytes).expect("parse"),
            InboundFrame::Envelope(_)
        ));
    }

    #[test]
    fn test_message_body_untagged_shapes() {
        let text: MessageBody = serde_json::from_str("\"hi there\"").expect("text");
        assert_eq!(text, MessageBody::Text("hi there".into()));

        let ka = MessageBody::Control(ControlFrame::Keepalive {
            timestamp: 17,
            pad: [9u8; 32],
        });
        let bytes = serde_json::to_vec(&ka).expect("encode");
        assert_eq!(
            serde_json::from_slice::<MessageBody>(&bytes).expect("decode"),
            ka
        );

        let ack = MessageBody::FileAck(FileAck {
            transfer_id: [4u8; 16],
            index: 2,
        });
        let bytes = serde_json::to_vec(&ack).expect("encode");
        assert_eq!(
            serde_json::from_slice::<MessageBody>(&bytes).expect("decode"),
            ack
        );
    }

    #[test]
    fn test_file_chunk_roundtrip() {
        let chunk = MessageBody::FileChunk(FileChunk {
            transfer_id: [4u8; 16],
            filename: "cat.png".into(),
            file_size: 5,
            file_checksum: [5u8; 32],
            index: 0,
            total: 1,
            checksum: [6u8; 32],
            data: vec![1, 2, 3, 4, 5],
        });
        let bytes = serde_json::to_vec(&chunk).expect("encode");
        let parsed: MessageBody = serde_json::from_slice(&bytes).expect("decode");
        assert_eq!(parsed, chunk);
        assert_eq!(chunk.wire_kind().as_deref(), Some(FILE_KIND));
    }
}
