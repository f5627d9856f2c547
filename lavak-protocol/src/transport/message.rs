//! Transport wire format
//!
//! Every message on the TLS stream is one frame:
//!
//! ```text
//! [outer length: u32 BE][header length: u32 BE][JSON header][payload]
//! ```
//!
//! The outer length covers the header-length field, the header, and the
//! payload (`payload length = outer - 4 - header length`). Headers are
//! small JSON objects with a `type` discriminator; binary header fields
//! (`encryptedKey`, `iv`, `authTag`) are base64. Chunk ciphertext rides
//! in the opaque payload, never in the header.
//!
//! The reader buffers raw bytes and yields as many complete frames as
//! are available; incomplete tails stay buffered. Frames whose header is
//! not valid JSON are dropped silently and parsing continues.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::{ProtocolError, Result};

/// Hard ceiling on one frame; a chunk plus header fits with lots of room
const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Read size when refilling the frame buffer
const READ_BUF_LEN: usize = 16 * 1024;

/// One parsed frame header
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageHeader {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(flatten)]
    pub fields: Value,
}

impl MessageHeader {
    pub fn new(kind: impl Into<String>, fields: Value) -> Self {
        Self {
            kind: kind.into(),
            fields,
        }
    }

    pub fn hello(public_key: &str, transfer_id: &str) -> Self {
        Self::new(
            "hello",
            json!({ "publicKey": public_key, "transferId": transfer_id }),
        )
    }

    pub fn session(encrypted_key: &[u8], iv: &[u8]) -> Self {
        Self::new(
            "session",
            json!({
                "encryptedKey": BASE64.encode(encrypted_key),
                "iv": BASE64.encode(iv),
            }),
        )
    }

    pub fn meta(name: &str, size: u64, hash: &str, transfer_id: &str) -> Self {
        Self::new(
            "meta",
            json!({ "name": name, "size": size, "hash": hash, "transferId": transfer_id }),
        )
    }

    pub fn accepted(transfer_id: &str) -> Self {
        Self::new("accepted", json!({ "transferId": transfer_id }))
    }

    pub fn rejected(transfer_id: &str) -> Self {
        Self::new("rejected", json!({ "transferId": transfer_id }))
    }

    pub fn data(index: u32, auth_tag: &[u8], chunk_size: usize) -> Self {
        Self::new(
            "data",
            json!({
                "index": index,
                "authTag": BASE64.encode(auth_tag),
                "chunkSize": chunk_size,
            }),
        )
    }

    pub fn done() -> Self {
        Self::new("done", json!({}))
    }

    pub fn is_type(&self, kind: &str) -> bool {
        self.kind == kind
    }

    /// Typed header field access
    pub fn get_field<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.fields
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Base64-decoded header field access
    pub fn get_bytes_field(&self, key: &str) -> Option<Vec<u8>> {
        let encoded: String = self.get_field(key)?;
        BASE64.decode(encoded).ok()
    }

    /// Fetch a required field or fail with a protocol violation
    pub fn require_field<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.get_field(key).ok_or_else(|| {
            ProtocolError::ProtocolViolation(format!(
                "{} message missing field {}",
                self.kind, key
            ))
        })
    }

    /// Fetch a required base64 field or fail with a protocol violation
    pub fn require_bytes_field(&self, key: &str) -> Result<Vec<u8>> {
        self.get_bytes_field(key).ok_or_else(|| {
            ProtocolError::ProtocolViolation(format!(
                "{} message missing or malformed field {}",
                self.kind, key
            ))
        })
    }
}

/// One complete frame: parsed header plus opaque payload
#[derive(Debug)]
pub struct Frame {
    pub header: MessageHeader,
    pub payload: Vec<u8>,
}

/// Encode a header and payload into wire bytes
pub fn encode_frame(header: &MessageHeader, payload: &[u8]) -> Result<Vec<u8>> {
    let header_json = serde_json::to_vec(header)?;
    let outer = 4 + header_json.len() + payload.len();

    let mut bytes = Vec::with_capacity(4 + outer);
    bytes.extend_from_slice(&(outer as u32).to_be_bytes());
    bytes.extend_from_slice(&(header_json.len() as u32).to_be_bytes());
    bytes.extend_from_slice(&header_json);
    bytes.extend_from_slice(payload);
    Ok(bytes)
}

/// Incremental frame parser over a raw byte buffer
#[derive(Default)]
pub struct FrameReader {
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append freshly read bytes
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Parse the next complete frame, if one is buffered.
    ///
    /// Frames with an undecodable header are consumed and skipped.
    /// Length fields that cannot be trusted (oversized, or inconsistent
    /// with each other) desynchronize the stream and are an error.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            if self.buf.len() < 8 {
                return Ok(None);
            }

            let outer = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])
                as usize;
            let header_len =
                u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]]) as usize;

            if outer > MAX_FRAME_LEN {
                return Err(ProtocolError::ProtocolViolation(format!(
                    "frame length {} exceeds maximum {}",
                    outer, MAX_FRAME_LEN
                )));
            }
            if outer < 4 || header_len > outer - 4 {
                return Err(ProtocolError::ProtocolViolation(format!(
                    "inconsistent frame lengths: outer {}, header {}",
                    outer, header_len
                )));
            }

            let total = 4 + outer;
            if self.buf.len() < total {
                return Ok(None);
            }

            let header_bytes = &self.buf[8..8 + header_len];
            match serde_json::from_slice::<MessageHeader>(header_bytes) {
                Ok(header) => {
                    let payload = self.buf[8 + header_len..total].to_vec();
                    self.buf.drain(..total);
                    return Ok(Some(Frame { header, payload }));
                }
                Err(_) => {
                    // Malformed header: drop this frame, keep framing
                    debug!("Dropping frame with malformed header ({} bytes)", header_len);
                    self.buf.drain(..total);
                }
            }
        }
    }
}

/// Read from the stream until a complete frame is available.
///
/// Returns `Ok(None)` on clean end of stream.
pub async fn read_frame<S>(stream: &mut S, reader: &mut FrameReader) -> Result<Option<Frame>>
where
    S: AsyncRead + Unpin,
{
    loop {
        if let Some(frame) = reader.next_frame()? {
            return Ok(Some(frame));
        }

        let mut buf = [0u8; READ_BUF_LEN];
        let read = stream.read(&mut buf).await?;
        if read == 0 {
            return Ok(None);
        }
        reader.extend(&buf[..read]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let header = MessageHeader::data(7, &[0xAB; 16], 5);
        let bytes = encode_frame(&header, b"hello").unwrap();

        let mut reader = FrameReader::new();
        reader.extend(&bytes);

        let frame = reader.next_frame().unwrap().unwrap();
        assert!(frame.header.is_type("data"));
        assert_eq!(frame.header.get_field::<u32>("index"), Some(7));
        assert_eq!(frame.header.get_field::<usize>("chunkSize"), Some(5));
        assert_eq!(frame.header.get_bytes_field("authTag"), Some(vec![0xAB; 16]));
        assert_eq!(frame.payload, b"hello");

        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_frame_without_payload() {
        let bytes = encode_frame(&MessageHeader::done(), &[]).unwrap();

        let mut reader = FrameReader::new();
        reader.extend(&bytes);

        let frame = reader.next_frame().unwrap().unwrap();
        assert!(frame.header.is_type("done"));
        assert!(frame.payload.is_empty());
    }

    #[test]
    fn test_incomplete_tail_stays_buffered() {
        let bytes = encode_frame(&MessageHeader::accepted("t1"), &[]).unwrap();

        let mut reader = FrameReader::new();
        // Feed all but the last byte
        reader.extend(&bytes[..bytes.len() - 1]);
        assert!(reader.next_frame().unwrap().is_none());

        // Remaining byte completes the frame
        reader.extend(&bytes[bytes.len() - 1..]);
        let frame = reader.next_frame().unwrap().unwrap();
        assert!(frame.header.is_type("accepted"));
    }

    #[test]
    fn test_multiple_frames_in_one_read() {
        let first = encode_frame(&MessageHeader::accepted("t1"), &[]).unwrap();
        let second = encode_frame(&MessageHeader::done(), &[]).unwrap();

        let mut reader = FrameReader::new();
        let mut combined = first;
        combined.extend_from_slice(&second);
        reader.extend(&combined);

        assert!(reader.next_frame().unwrap().unwrap().header.is_type("accepted"));
        assert!(reader.next_frame().unwrap().unwrap().header.is_type("done"));
        assert!(reader.next_frame().unwrap().is_none());
    }

    #[test]
    fn test_byte_at_a_time_delivery() {
        let bytes = encode_frame(&MessageHeader::meta("a.txt", 42, "00", "t1"), b"x").unwrap();

        let mut reader = FrameReader::new();
        let mut parsed = None;
        for byte in &bytes {
            reader.extend(std::slice::from_ref(byte));
            if let Some(frame) = reader.next_frame().unwrap() {
                parsed = Some(frame);
            }
        }

        let frame = parsed.expect("frame should complete on last byte");
        assert!(frame.header.is_type("meta"));
        assert_eq!(frame.header.get_field::<u64>("size"), Some(42));
        assert_eq!(frame.payload, b"x");
    }

    #[test]
    fn test_malformed_header_skipped_silently() {
        // Hand-build a frame whose header is not JSON
        let garbage = b"not json at all";
        let outer = 4 + garbage.len();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(outer as u32).to_be_bytes());
        bytes.extend_from_slice(&(garbage.len() as u32).to_be_bytes());
        bytes.extend_from_slice(garbage);
        // Followed by a valid frame
        bytes.extend_from_slice(&encode_frame(&MessageHeader::done(), &[]).unwrap());

        let mut reader = FrameReader::new();
        reader.extend(&bytes);

        let frame = reader.next_frame().unwrap().unwrap();
        assert!(frame.header.is_type("done"));
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut reader = FrameReader::new();
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(100 * 1024 * 1024u32).to_be_bytes());
        bytes.extend_from_slice(&8u32.to_be_bytes());
        reader.extend(&bytes);

        assert!(matches!(
            reader.next_frame(),
            Err(ProtocolError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_inconsistent_lengths_rejected() {
        let mut reader = FrameReader::new();
        let mut bytes = Vec::new();
        // outer says 10, header claims 20
        bytes.extend_from_slice(&10u32.to_be_bytes());
        bytes.extend_from_slice(&20u32.to_be_bytes());
        bytes.extend_from_slice(&[0u8; 10]);
        reader.extend(&bytes);

        assert!(matches!(
            reader.next_frame(),
            Err(ProtocolError::ProtocolViolation(_))
        ));
    }

    #[test]
    fn test_session_header_base64_roundtrip() {
        let wrapped = vec![0x5A; 512];
        let iv = [0x11u8; 12];
        let header = MessageHeader::session(&wrapped, &iv);

        assert_eq!(header.get_bytes_field("encryptedKey"), Some(wrapped));
        assert_eq!(header.get_bytes_field("iv"), Some(iv.to_vec()));
    }

    #[test]
    fn test_require_field_errors_name_the_message() {
        let header = MessageHeader::done();
        let err = header.require_field::<String>("transferId").unwrap_err();
        assert!(err.to_string().contains("done"));
        assert!(err.to_string().contains("transferId"));
    }
}
