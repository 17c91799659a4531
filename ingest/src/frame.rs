//! Wire framing for the event stream.
//!
//! Every frame starts with a version byte (`'2'`) and a type byte:
//!
//! - `'W'` — window size: `u32` count of frames per ack window
//! - `'D'` — data event: `u32` sequence, `u32` pair count, then
//!   length-prefixed key/value pairs
//! - `'J'` — JSON event: `u32` sequence, `u32` payload length, payload
//! - `'C'` — compressed batch: `u32` payload length, zlib payload holding
//!   a run of uncompressed frames
//! - `'A'` — ack: `u32` highest consumed sequence (server to client)
//!
//! All integers are big-endian. Decoding enforces hard size caps so a
//! hostile peer cannot balloon memory, and an idle timeout on the first
//! byte of a frame is distinguished from truncation mid-frame.

use std::io::{self, Read};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use thiserror::Error;

pub const PROTOCOL_VERSION: u8 = b'2';

const TYPE_WINDOW: u8 = b'W';
const TYPE_DATA: u8 = b'D';
const TYPE_JSON: u8 = b'J';
const TYPE_COMPRESSED: u8 = b'C';
const TYPE_ACK: u8 = b'A';

/// Most key/value pairs a data frame may carry.
pub const MAX_FIELDS: u32 = 1024;
/// Longest single key or value, in bytes.
pub const MAX_STRING: u32 = 64 * 1024;
/// Largest JSON or compressed payload on the wire.
pub const MAX_PAYLOAD: u32 = 16 * 1024 * 1024;
/// Largest payload after decompression.
pub const MAX_INFLATED: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("idle timeout waiting for a frame")]
    IdleTimeout,
    #[error("stream truncated mid-frame")]
    Truncated,
    #[error("unsupported protocol version {0:#04x}")]
    BadVersion(u8),
    #[error("unknown frame type {0:#04x}")]
    BadType(u8),
    #[error("{what} of {size} exceeds limit {limit}")]
    Oversize {
        what: &'static str,
        size: u64,
        limit: u64,
    },
    #[error("compressed payload nested inside a compressed payload")]
    NestedCompression,
    #[error("field is not valid UTF-8")]
    BadUtf8,
    #[error("invalid JSON payload: {0}")]
    BadJson(#[from] serde_json::Error),
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    WindowSize(u32),
    Data {
        seq: u32,
        fields: Vec<(String, String)>,
    },
    Json {
        seq: u32,
        value: serde_json::Value,
    },
    /// Payload already inflated; decode the inner frames with
    /// [`decode_batch`].
    Compressed(Vec<u8>),
    Ack(u32),
}

/// Streaming frame decoder over any `Read`.
pub struct FrameReader<R: Read> {
    inner: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn get_ref(&self) -> &R {
        &self.inner
    }

    /// Read one frame. `Ok(None)` is a clean end of stream; a timeout
    /// before the first byte maps to [`FrameError::IdleTimeout`], while a
    /// timeout or EOF inside a frame is [`FrameError::Truncated`].
    pub fn read_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        let version = match self.read_first_byte()? {
            Some(b) => b,
            None => return Ok(None),
        };
        if version != PROTOCOL_VERSION {
            return Err(FrameError::BadVersion(version));
        }
        let mut ty = [0u8; 1];
        self.fill(&mut ty)?;
        self.read_body(ty[0], true)
            .map(Some)
    }

    fn read_first_byte(&mut self) -> Result<Option<u8>, FrameError> {
        let mut buf = [0u8; 1];
        loop {
            match self.inner.read(&mut buf) {
                Ok(0) => return Ok(None),
                Ok(_) => return Ok(Some(buf[0])),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err)
                    if err.kind() == io::ErrorKind::WouldBlock
                        || err.kind() == io::ErrorKind::TimedOut =>
                {
                    return Err(FrameError::IdleTimeout)
                }
                Err(err) => return Err(FrameError::Io(err)),
            }
        }
    }

    fn read_body(&mut self, ty: u8, allow_compressed: bool) -> Result<Frame, FrameError> {
        match ty {
            TYPE_WINDOW => Ok(Frame::WindowSize(self.read_u32()?)),
            TYPE_ACK => Ok(Frame::Ack(self.read_u32()?)),
            TYPE_DATA => {
                let seq = self.read_u32()?;
                let pair_count = self.read_u32()?;
                if pair_count > MAX_FIELDS {
                    return Err(FrameError::Oversize {
                        what: "field count",
                        size: pair_count as u64,
                        limit: MAX_FIELDS as u64,
                    });
                }
                let mut fields = Vec::with_capacity(pair_count as usize);
                for _ in 0..pair_count {
                    let key = self.read_string()?;
                    let value = self.read_string()?;
                    fields.push((key, value));
                }
                Ok(Frame::Data { seq, fields })
            }
            TYPE_JSON => {
                let seq = self.read_u32()?;
                let payload = self.read_payload("JSON payload")?;
                let value = serde_json::from_slice(&payload)?;
                Ok(Frame::Json { seq, value })
            }
            TYPE_COMPRESSED => {
                if !allow_compressed {
                    return Err(FrameError::NestedCompression);
                }
                let payload = self.read_payload("compressed payload")?;
                let mut inflated = Vec::new();
                let mut decoder = ZlibDecoder::new(&payload[..]).take(MAX_INFLATED as u64 + 1);
                decoder.read_to_end(&mut inflated).map_err(FrameError::Io)?;
                if inflated.len() > MAX_INFLATED {
                    return Err(FrameError::Oversize {
                        what: "inflated payload",
                        size: inflated.len() as u64,
                        limit: MAX_INFLATED as u64,
                    });
                }
                Ok(Frame::Compressed(inflated))
            }
            other => Err(FrameError::BadType(other)),
        }
    }

    fn read_u32(&mut self) -> Result<u32, FrameError> {
        let mut buf = [0u8; 4];
        self.fill(&mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_string(&mut self) -> Result<String, FrameError> {
        let len = self.read_u32()?;
        if len > MAX_STRING {
            return Err(FrameError::Oversize {
                what: "string length",
                size: len as u64,
                limit: MAX_STRING as u64,
            });
        }
        let mut buf = vec![0u8; len as usize];
        self.fill(&mut buf)?;
        String::from_utf8(buf).map_err(|_| FrameError::BadUtf8)
    }

    fn read_payload(&mut self, what: &'static str) -> Result<Vec<u8>, FrameError> {
        let len = self.read_u32()?;
        if len > MAX_PAYLOAD {
            return Err(FrameError::Oversize {
                what,
                size: len as u64,
                limit: MAX_PAYLOAD as u64,
            });
        }
        let mut buf = vec![0u8; len as usize];
        self.fill(&mut buf)?;
        Ok(buf)
    }

    /// `read_exact` with timeout and EOF mapped to [`FrameError::Truncated`].
    fn fill(&mut self, buf: &mut [u8]) -> Result<(), FrameError> {
        match self.inner.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(err)
                if matches!(
                    err.kind(),
                    io::ErrorKind::UnexpectedEof
                        | io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                ) =>
            {
                Err(FrameError::Truncated)
            }
            Err(err) => Err(FrameError::Io(err)),
        }
    }
}

/// Decode the run of frames inside an inflated compressed payload.
/// Nested compression is rejected.
pub fn decode_batch(payload: &[u8]) -> Result<Vec<Frame>, FrameError> {
    let mut frames = Vec::new();
    let mut cursor = FrameReader::new(payload);
    loop {
        let version = match cursor.read_first_byte()? {
            Some(b) => b,
            None => return Ok(frames),
        };
        if version != PROTOCOL_VERSION {
            return Err(FrameError::BadVersion(version));
        }
        let mut ty = [0u8; 1];
        cursor.fill(&mut ty)?;
        frames.push(cursor.read_body(ty[0], false)?);
    }
}

pub fn encode_ack(seq: u32) -> [u8; 6] {
    let mut out = [0u8; 6];
    out[0] = PROTOCOL_VERSION;
    out[1] = TYPE_ACK;
    out[2..6].copy_from_slice(&seq.to_be_bytes());
    out
}

pub fn encode_window_size(size: u32) -> Vec<u8> {
    let mut out = vec![PROTOCOL_VERSION, TYPE_WINDOW];
    out.extend_from_slice(&size.to_be_bytes());
    out
}

pub fn encode_data(seq: u32, fields: &[(&str, &str)]) -> Vec<u8> {
    let mut out = vec![PROTOCOL_VERSION, TYPE_DATA];
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&(fields.len() as u32).to_be_bytes());
    for (key, value) in fields {
        for part in [key, value] {
            out.extend_from_slice(&(part.len() as u32).to_be_bytes());
            out.extend_from_slice(part.as_bytes());
        }
    }
    out
}

pub fn encode_json(seq: u32, value: &serde_json::Value) -> Vec<u8> {
    let payload = serde_json::to_vec(value).expect("JSON value serialises");
    let mut out = vec![PROTOCOL_VERSION, TYPE_JSON];
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

/// Deflate a run of already-encoded frames into one compressed frame.
pub fn encode_compressed(frames: &[u8]) -> Vec<u8> {
    use std::io::Write;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(frames).expect("in-memory deflate");
    let payload = encoder.finish().expect("in-memory deflate");
    let mut out = vec![PROTOCOL_VERSION, TYPE_COMPRESSED];
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(&payload);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_all(bytes: &[u8]) -> Vec<Frame> {
        let mut reader = FrameReader::new(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = reader.read_frame().unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn data_frame_roundtrip() {
        let bytes = encode_data(7, &[("ip", "10.0.0.1"), ("uri", "/login")]);
        let frames = read_all(&bytes);
        assert_eq!(
            frames,
            vec![Frame::Data {
                seq: 7,
                fields: vec![
                    ("ip".to_string(), "10.0.0.1".to_string()),
                    ("uri".to_string(), "/login".to_string()),
                ],
            }]
        );
    }

    #[test]
    fn window_and_ack_roundtrip() {
        let mut bytes = encode_window_size(128);
        bytes.extend_from_slice(&encode_ack(42));
        let frames = read_all(&bytes);
        assert_eq!(frames, vec![Frame::WindowSize(128), Frame::Ack(42)]);
    }

    #[test]
    fn json_frame_roundtrip() {
        let value = serde_json::json!({"ip": "10.0.0.1", "uri": "/x", "n": 3});
        let bytes = encode_json(9, &value);
        let frames = read_all(&bytes);
        assert_eq!(frames, vec![Frame::Json { seq: 9, value }]);
    }

    #[test]
    fn compressed_batch_inflates_to_inner_frames() {
        let mut inner = encode_data(1, &[("ip", "10.0.0.1")]);
        inner.extend_from_slice(&encode_data(2, &[("ip", "10.0.0.2")]));
        let bytes = encode_compressed(&inner);

        let frames = read_all(&bytes);
        assert_eq!(frames.len(), 1);
        let Frame::Compressed(payload) = &frames[0] else {
            panic!("expected a compressed frame");
        };
        let inner_frames = decode_batch(payload).unwrap();
        assert_eq!(inner_frames.len(), 2);
        assert!(matches!(inner_frames[0], Frame::Data { seq: 1, .. }));
        assert!(matches!(inner_frames[1], Frame::Data { seq: 2, .. }));
    }

    #[test]
    fn nested_compression_is_rejected() {
        let inner = encode_compressed(&encode_data(1, &[("ip", "10.0.0.1")]));
        let bytes = encode_compressed(&inner);
        let frames = read_all(&bytes);
        let Frame::Compressed(payload) = &frames[0] else {
            panic!("expected a compressed frame");
        };
        assert!(matches!(
            decode_batch(payload),
            Err(FrameError::NestedCompression)
        ));
    }

    #[test]
    fn clean_eof_is_none() {
        let mut reader = FrameReader::new(&[][..]);
        assert!(reader.read_frame().unwrap().is_none());
    }

    #[test]
    fn bad_version_and_type_are_rejected() {
        let mut reader = FrameReader::new(&[b'9', b'D'][..]);
        assert!(matches!(
            reader.read_frame(),
            Err(FrameError::BadVersion(b'9'))
        ));
        let mut reader = FrameReader::new(&[b'2', b'X'][..]);
        assert!(matches!(reader.read_frame(), Err(FrameError::BadType(b'X'))));
    }

    #[test]
    fn truncated_frame_is_distinguished_from_eof() {
        let bytes = encode_data(7, &[("ip", "10.0.0.1")]);
        let mut reader = FrameReader::new(&bytes[..bytes.len() - 3]);
        assert!(matches!(reader.read_frame(), Err(FrameError::Truncated)));
    }

    #[test]
    fn oversized_field_count_is_rejected() {
        let mut bytes = vec![PROTOCOL_VERSION, b'D'];
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&(MAX_FIELDS + 1).to_be_bytes());
        let mut reader = FrameReader::new(&bytes[..]);
        assert!(matches!(
            reader.read_frame(),
            Err(FrameError::Oversize { .. })
        ));
    }

    #[test]
    fn oversized_string_is_rejected() {
        let mut bytes = vec![PROTOCOL_VERSION, b'D'];
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&(MAX_STRING + 1).to_be_bytes());
        let mut reader = FrameReader::new(&bytes[..]);
        assert!(matches!(
            reader.read_frame(),
            Err(FrameError::Oversize { .. })
        ));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let mut bytes = vec![PROTOCOL_VERSION, b'D'];
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&2u32.to_be_bytes());
        bytes.extend_from_slice(&[0xFF, 0xFE]);
        bytes.extend_from_slice(&0u32.to_be_bytes());
        let mut reader = FrameReader::new(&bytes[..]);
        assert!(matches!(reader.read_frame(), Err(FrameError::BadUtf8)));
    }

    #[test]
    fn bad_json_payload_is_rejected() {
        let mut bytes = vec![PROTOCOL_VERSION, b'J'];
        bytes.extend_from_slice(&1u32.to_be_bytes());
        bytes.extend_from_slice(&4u32.to_be_bytes());
        bytes.extend_from_slice(b"{{{{");
        let mut reader = FrameReader::new(&bytes[..]);
        assert!(matches!(reader.read_frame(), Err(FrameError::BadJson(_))));
    }
}
