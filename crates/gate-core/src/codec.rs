//! Length-prefixed binary framing with Snappy body compression.
//!
//! Wire format, big-endian throughout:
//!
//! ```text
//! [4-byte outer length = 29 + body_length]
//! [4-byte magic 0x12345678]
//! [4-byte message_type (i32)]
//! [8-byte sequence (i64)]
//! [8-byte timestamp_ms (i64)]
//! [1-byte flags, bit0 = compressed]
//! [4-byte body_length (i32)]
//! [body_length bytes of body]
//! ```
//!
//! The decoder is streaming: it accumulates bytes from arbitrary read
//! boundaries and yields every complete frame, keeping the partial tail.
//! Oversize and magic checks run as soon as the relevant bytes arrive, so
//! a hostile length prefix is rejected before its body is ever buffered.

use crate::error::{CodecError, CodecResult};
use crate::frame::Frame;

/// Protocol magic, first field of every envelope.
pub const MAGIC: u32 = 0x1234_5678;

/// Envelope header length in bytes (magic through body_length).
pub const HEADER_LEN: usize = 29;

/// Outer length prefix in bytes.
const PREFIX_LEN: usize = 4;

/// Flags bit 0: body is Snappy-compressed.
const FLAG_COMPRESSED: u8 = 0x01;

/// Default ceiling on a body, before and after decompression (10 MiB).
pub const DEFAULT_MAX_BODY: usize = 10 * 1024 * 1024;

/// Default body size above which the encoder compresses.
pub const DEFAULT_COMPRESS_THRESHOLD: usize = 1024;

/// Encodes frames into wire bytes, compressing large bodies.
#[derive(Debug, Clone)]
pub struct FrameEncoder {
    compress_threshold: usize,
    max_body: usize,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self {
            compress_threshold: DEFAULT_COMPRESS_THRESHOLD,
            max_body: DEFAULT_MAX_BODY,
        }
    }
}

impl FrameEncoder {
    pub fn new(compress_threshold: usize, max_body: usize) -> Self {
        Self {
            compress_threshold,
            max_body,
        }
    }

    /// Encode one frame, outer length prefix included.
    ///
    /// Bodies longer than the compression threshold are Snappy-compressed
    /// and the compressed flag is set; `body_length` on the wire is the
    /// stored (possibly compressed) length. The frame itself is not
    /// mutated.
    pub fn encode(&self, frame: &Frame) -> CodecResult<Vec<u8>> {
        if frame.body.len() > self.max_body {
            return Err(CodecError::Oversize(frame.body.len() as i64));
        }

        let mut flags = 0u8;
        let body: Vec<u8>;
        let stored: &[u8] = if frame.body.len() > self.compress_threshold {
            flags |= FLAG_COMPRESSED;
            // snap only fails on inputs beyond its u32 bound, which
            // max_body already excludes.
            body = snap::raw::Encoder::new()
                .compress_vec(&frame.body)
                .map_err(|_| CodecError::Oversize(frame.body.len() as i64))?;
            &body
        } else {
            &frame.body
        };

        let outer = (HEADER_LEN + stored.len()) as u32;
        let mut out = Vec::with_capacity(PREFIX_LEN + outer as usize);
        out.extend_from_slice(&outer.to_be_bytes());
        out.extend_from_slice(&MAGIC.to_be_bytes());
        out.extend_from_slice(&frame.message_type.to_be_bytes());
        out.extend_from_slice(&frame.sequence.to_be_bytes());
        out.extend_from_slice(&frame.timestamp_ms.to_be_bytes());
        out.push(flags);
        out.extend_from_slice(&(stored.len() as i32).to_be_bytes());
        out.extend_from_slice(stored);
        Ok(out)
    }
}

/// Streaming frame decoder: accumulates bytes and yields complete frames.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: Vec<u8>,
    max_body: usize,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_max_body(DEFAULT_MAX_BODY)
    }

    pub fn with_max_body(max_body: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_body,
        }
    }

    /// Feed bytes and return every frame completed by them, in order.
    ///
    /// Returns an error as soon as the stream is provably bad; the caller
    /// must close the connection and discard the decoder.
    pub fn feed(&mut self, data: &[u8]) -> CodecResult<Vec<Frame>> {
        self.buf.extend_from_slice(data);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < PREFIX_LEN {
                break;
            }
            let outer =
                u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if outer < HEADER_LEN {
                return Err(CodecError::Malformed(format!(
                    "length prefix {outer} below header size"
                )));
            }
            if outer > HEADER_LEN + self.max_body {
                return Err(CodecError::Oversize((outer - HEADER_LEN) as i64));
            }

            if self.buf.len() < PREFIX_LEN + HEADER_LEN {
                break;
            }
            let header = &self.buf[PREFIX_LEN..PREFIX_LEN + HEADER_LEN];
            let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
            if magic != MAGIC {
                return Err(CodecError::Malformed(format!("bad magic {magic:#010x}")));
            }
            let message_type = i32::from_be_bytes([header[4], header[5], header[6], header[7]]);
            let sequence = read_i64(&header[8..16]);
            let timestamp_ms = read_i64(&header[16..24]);
            let flags = header[24];
            let body_len = i32::from_be_bytes([header[25], header[26], header[27], header[28]]);
            if body_len < 0 || body_len as usize > self.max_body {
                return Err(CodecError::Oversize(body_len as i64));
            }
            if body_len as usize != outer - HEADER_LEN {
                return Err(CodecError::Malformed(format!(
                    "length prefix {} disagrees with body_length {}",
                    outer - HEADER_LEN,
                    body_len
                )));
            }

            if self.buf.len() < PREFIX_LEN + outer {
                break;
            }
            let raw = &self.buf[PREFIX_LEN + HEADER_LEN..PREFIX_LEN + outer];
            let body = if flags & FLAG_COMPRESSED != 0 {
                decompress_bounded(raw, self.max_body)?
            } else {
                raw.to_vec()
            };

            frames.push(Frame {
                message_type,
                sequence,
                timestamp_ms,
                body,
            });
            self.buf.drain(..PREFIX_LEN + outer);
        }

        Ok(frames)
    }

    /// Bytes buffered but not yet consumed by a complete frame.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Big-endian i64 from an 8-byte slice.
fn read_i64(b: &[u8]) -> i64 {
    i64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
}

/// Decompress `raw`, enforcing the size bound before allocating.
fn decompress_bounded(raw: &[u8], max_body: usize) -> CodecResult<Vec<u8>> {
    let expanded = snap::raw::decompress_len(raw)
        .map_err(|e| CodecError::Decompress(e.to_string()))?;
    if expanded > max_body {
        return Err(CodecError::Oversize(expanded as i64));
    }
    snap::raw::Decoder::new()
        .decompress_vec(raw)
        .map_err(|e| CodecError::Decompress(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::msg;

    fn frame(message_type: i32, seq: i64, body: Vec<u8>) -> Frame {
        Frame::new(message_type, seq, 1_700_000_000_000, body)
    }

    #[test]
    fn round_trip_small_body() {
        let f = frame(msg::LOGIN_REQUEST, 1, b"{\"user\":\"u1\"}".to_vec());
        let bytes = FrameEncoder::default().encode(&f).unwrap();
        let mut dec = FrameDecoder::new();
        let got = dec.feed(&bytes).unwrap();
        assert_eq!(got, vec![f]);
        assert_eq!(dec.pending(), 0);
    }

    #[test]
    fn round_trip_compressed_body() {
        // Repetitive body well past the threshold compresses smaller.
        let f = frame(msg::PLAYER_MOVE, 7, b"abcdefgh".repeat(1024).to_vec());
        let bytes = FrameEncoder::default().encode(&f).unwrap();
        assert!(bytes.len() < PREFIX_LEN + HEADER_LEN + f.body.len());
        assert_eq!(bytes[PREFIX_LEN + 24] & FLAG_COMPRESSED, FLAG_COMPRESSED);

        let got = FrameDecoder::new().feed(&bytes).unwrap();
        assert_eq!(got, vec![f]);
    }

    #[test]
    fn empty_body_round_trips() {
        let f = frame(msg::HEARTBEAT, 0, Vec::new());
        let bytes = FrameEncoder::default().encode(&f).unwrap();
        assert_eq!(bytes.len(), PREFIX_LEN + HEADER_LEN);
        let got = FrameDecoder::new().feed(&bytes).unwrap();
        assert_eq!(got, vec![f]);
    }

    #[test]
    fn streaming_split_at_every_boundary() {
        let frames: Vec<Frame> = vec![
            frame(msg::LOGIN_REQUEST, 1, b"one".to_vec()),
            frame(msg::PLAYER_MOVE, 2, b"x".repeat(2000).to_vec()),
            frame(msg::CHAT_WORLD, 3, Vec::new()),
        ];
        let enc = FrameEncoder::default();
        let mut wire = Vec::new();
        for f in &frames {
            wire.extend(enc.encode(f).unwrap());
        }

        // Feed one byte at a time; every frame must come out exactly once.
        let mut dec = FrameDecoder::new();
        let mut got = Vec::new();
        for b in &wire {
            got.extend(dec.feed(std::slice::from_ref(b)).unwrap());
        }
        assert_eq!(got, frames);
        assert_eq!(dec.pending(), 0);
    }

    #[test]
    fn two_frames_in_one_read() {
        let enc = FrameEncoder::default();
        let a = frame(msg::HEARTBEAT, 1, Vec::new());
        let b = frame(msg::PLAYER_INFO, 2, b"p".to_vec());
        let mut wire = enc.encode(&a).unwrap();
        wire.extend(enc.encode(&b).unwrap());

        let got = FrameDecoder::new().feed(&wire).unwrap();
        assert_eq!(got, vec![a, b]);
    }

    #[test]
    fn bad_magic_is_malformed() {
        let mut bytes = FrameEncoder::default()
            .encode(&frame(msg::HEARTBEAT, 1, Vec::new()))
            .unwrap();
        bytes[PREFIX_LEN] = 0xde; // corrupt first magic byte
        let err = FrameDecoder::new().feed(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn declared_oversize_rejected_before_body_arrives() {
        // Outer prefix claiming a 20 MiB body; no body bytes sent at all.
        let huge = (HEADER_LEN + 20 * 1024 * 1024) as u32;
        let err = FrameDecoder::new()
            .feed(&huge.to_be_bytes())
            .unwrap_err();
        assert!(matches!(err, CodecError::Oversize(n) if n == 20 * 1024 * 1024));
    }

    #[test]
    fn negative_body_length_is_oversize() {
        let mut bytes = FrameEncoder::default()
            .encode(&frame(msg::HEARTBEAT, 1, Vec::new()))
            .unwrap();
        // Overwrite body_length with -1 (prefix left consistent at 29).
        bytes[PREFIX_LEN + 25..PREFIX_LEN + 29].copy_from_slice(&(-1i32).to_be_bytes());
        let err = FrameDecoder::new().feed(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::Oversize(-1)));
    }

    #[test]
    fn prefix_header_disagreement_is_malformed() {
        let mut bytes = FrameEncoder::default()
            .encode(&frame(msg::HEARTBEAT, 1, b"abcd".to_vec()))
            .unwrap();
        bytes[PREFIX_LEN + 25..PREFIX_LEN + 29].copy_from_slice(&2i32.to_be_bytes());
        let err = FrameDecoder::new().feed(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn short_prefix_is_malformed() {
        let err = FrameDecoder::new()
            .feed(&(HEADER_LEN as u32 - 1).to_be_bytes())
            .unwrap_err();
        assert!(matches!(err, CodecError::Malformed(_)));
    }

    #[test]
    fn corrupt_compressed_body_fails_decompress() {
        // A stored body of 0xff bytes is an unterminated Snappy length
        // varint, rejected before any output is produced.
        let stored = vec![0xffu8; 8];
        let outer = (HEADER_LEN + stored.len()) as u32;
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&outer.to_be_bytes());
        bytes.extend_from_slice(&MAGIC.to_be_bytes());
        bytes.extend_from_slice(&msg::PLAYER_MOVE.to_be_bytes());
        bytes.extend_from_slice(&1i64.to_be_bytes());
        bytes.extend_from_slice(&0i64.to_be_bytes());
        bytes.push(FLAG_COMPRESSED);
        bytes.extend_from_slice(&(stored.len() as i32).to_be_bytes());
        bytes.extend_from_slice(&stored);

        let err = FrameDecoder::new().feed(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::Decompress(_)));
    }

    #[test]
    fn decompressed_size_bound_enforced() {
        // 16 KiB of zeros stores as well under 1 KiB of Snappy; a decoder
        // capped at 4 KiB must reject it from the Snappy length header
        // alone, before decompressing.
        let f = frame(msg::PLAYER_MOVE, 1, vec![0u8; 16 * 1024]);
        let bytes = FrameEncoder::default().encode(&f).unwrap();
        assert!(bytes.len() < PREFIX_LEN + HEADER_LEN + 1024);
        let err = FrameDecoder::with_max_body(4096).feed(&bytes).unwrap_err();
        assert!(matches!(err, CodecError::Oversize(n) if n == 16 * 1024));
    }

    #[test]
    fn encode_rejects_oversize_body() {
        let enc = FrameEncoder::new(1024, 2048);
        let f = frame(msg::PLAYER_MOVE, 1, vec![1u8; 4096]);
        assert!(matches!(
            enc.encode(&f),
            Err(CodecError::Oversize(4096))
        ));
    }
}
