// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Length-prefix framing codec for multipart messages over TCP.
//!
//! TCP is a stream protocol without message boundaries. This codec adds
//! length-prefix framing to delimit messages, and an inner part framing so a
//! message can carry more than one part (control messages are `[tag]` or
//! `[tag, json]`; published depth frames are a single opaque part):
//!
//! ```text
//! +----------------+--------------------------------------------+
//! | Length (4B BE) | Part ... Part                              |
//! +----------------+--------------------------------------------+
//!                    each part: | PartLen (4B BE) | PartBytes |
//! ```
//!
//! The outer length field covers everything after the 4-byte header. The
//! codec maintains partial read state to handle TCP's streaming nature.

use std::io::{self, Read};

use super::Message;

/// Frame header size (4 bytes for length).
pub const FRAME_HEADER_SIZE: usize = 4;

/// Size of the per-part length prefix.
pub const PART_HEADER_SIZE: usize = 4;

/// Default maximum message size (16 MB). A raw 1920x1080 depth raster is
/// ~4 MB, so even an uncompressible frame fits with headroom.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Internal state for incremental reading.
#[derive(Debug, Clone, Copy)]
enum ReadState {
    /// Reading the 4-byte length header
    ReadingLength { bytes_read: usize },

    /// Reading the message body
    ReadingBody {
        expected_len: usize,
        bytes_read: usize,
    },
}

impl Default for ReadState {
    fn default() -> Self {
        ReadState::ReadingLength { bytes_read: 0 }
    }
}

/// Length-prefix frame codec with multipart support.
///
/// One codec instance per connection; it owns the partial-read buffer.
#[derive(Debug)]
pub struct FrameCodec {
    /// Current read state
    state: ReadState,

    /// Buffer for accumulating bytes (header, then body)
    buffer: Vec<u8>,

    /// Maximum allowed message size (anti-OOM protection)
    max_size: usize,

    /// Statistics: messages decoded
    messages_decoded: u64,

    /// Statistics: bytes decoded
    bytes_decoded: u64,

    /// Statistics: messages too large (rejected)
    messages_rejected: u64,
}

impl FrameCodec {
    /// Create a new frame codec with the specified max message size.
    pub fn new(max_size: usize) -> Self {
        Self {
            state: ReadState::default(),
            buffer: vec![0u8; FRAME_HEADER_SIZE],
            max_size,
            messages_decoded: 0,
            bytes_decoded: 0,
            messages_rejected: 0,
        }
    }

    /// Create a codec with the default max size (16 MB).
    pub fn with_default_max() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Messages decoded so far.
    pub fn messages_decoded(&self) -> u64 {
        self.messages_decoded
    }

    /// Bytes decoded so far (headers included).
    pub fn bytes_decoded(&self) -> u64 {
        self.bytes_decoded
    }

    /// Oversized messages rejected so far.
    pub fn messages_rejected(&self) -> u64 {
        self.messages_rejected
    }

    /// Encode a multipart message into a single framed byte buffer.
    pub fn encode(parts: &[Vec<u8>]) -> Vec<u8> {
        let body_len: usize = parts.iter().map(|p| PART_HEADER_SIZE + p.len()).sum();
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + body_len);
        out.extend_from_slice(&(body_len as u32).to_be_bytes());
        for part in parts {
            out.extend_from_slice(&(part.len() as u32).to_be_bytes());
            out.extend_from_slice(part);
        }
        out
    }

    /// Read as many complete messages as the stream currently has.
    ///
    /// Returns the decoded messages plus a flag that is true when the peer
    /// closed the stream. `WouldBlock` ends the read without error;
    /// `Interrupted` is retried.
    pub fn read_from<R: Read>(&mut self, rd: &mut R) -> io::Result<(Vec<Message>, bool)> {
        let mut out = Vec::new();

        loop {
            match self.state {
                ReadState::ReadingLength { bytes_read } => {
                    match rd.read(&mut self.buffer[bytes_read..FRAME_HEADER_SIZE]) {
                        Ok(0) => return Ok((out, true)),
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < FRAME_HEADER_SIZE {
                                self.state = ReadState::ReadingLength { bytes_read: total };
                                continue;
                            }
                            let expected_len = u32::from_be_bytes([
                                self.buffer[0],
                                self.buffer[1],
                                self.buffer[2],
                                self.buffer[3],
                            ]) as usize;

                            if expected_len > self.max_size {
                                self.messages_rejected += 1;
                                return Err(io::Error::new(
                                    io::ErrorKind::InvalidData,
                                    format!(
                                        "message of {} bytes exceeds limit of {}",
                                        expected_len, self.max_size
                                    ),
                                ));
                            }

                            self.buffer.resize(expected_len, 0);
                            self.state = ReadState::ReadingBody {
                                expected_len,
                                bytes_read: 0,
                            };
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Ok((out, false))
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
                ReadState::ReadingBody {
                    expected_len,
                    bytes_read,
                } => {
                    if bytes_read == expected_len {
                        // Zero-length body or body complete without a final read
                        let message = split_parts(&self.buffer[..expected_len])?;
                        self.messages_decoded += 1;
                        self.bytes_decoded += (FRAME_HEADER_SIZE + expected_len) as u64;
                        out.push(message);
                        self.reset();
                        continue;
                    }

                    match rd.read(&mut self.buffer[bytes_read..expected_len]) {
                        Ok(0) => return Ok((out, true)),
                        Ok(n) => {
                            let total = bytes_read + n;
                            if total < expected_len {
                                self.state = ReadState::ReadingBody {
                                    expected_len,
                                    bytes_read: total,
                                };
                                continue;
                            }
                            let message = split_parts(&self.buffer[..expected_len])?;
                            self.messages_decoded += 1;
                            self.bytes_decoded += (FRAME_HEADER_SIZE + expected_len) as u64;
                            out.push(message);
                            self.reset();
                        }
                        Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                            return Ok((out, false))
                        }
                        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                        Err(e) => return Err(e),
                    }
                }
            }
        }
    }

    fn reset(&mut self) {
        self.state = ReadState::default();
        self.buffer.clear();
        self.buffer.resize(FRAME_HEADER_SIZE, 0);
    }
}

/// Split a message body into its parts, validating exact consumption.
fn split_parts(body: &[u8]) -> io::Result<Message> {
    let mut parts = Vec::new();
    let mut offset = 0usize;

    while offset < body.len() {
        if body.len() - offset < PART_HEADER_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "truncated part header",
            ));
        }
        let len = u32::from_be_bytes([
            body[offset],
            body[offset + 1],
            body[offset + 2],
            body[offset + 3],
        ]) as usize;
        offset += PART_HEADER_SIZE;

        if body.len() - offset < len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "part length overruns message body",
            ));
        }
        parts.push(body[offset..offset + len].to_vec());
        offset += len;
    }

    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    /// Reader that yields WouldBlock once its buffer drains.
    struct DribbleReader {
        data: Vec<u8>,
        pos: usize,
        chunk: usize,
    }

    impl Read for DribbleReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.pos >= self.data.len() {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "drained"));
            }
            let n = self.chunk.min(buf.len()).min(self.data.len() - self.pos);
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let parts = vec![vec![0x03], b"{\"version\":1}".to_vec()];
        let framed = FrameCodec::encode(&parts);

        let mut codec = FrameCodec::with_default_max();
        let (messages, closed) = codec.read_from(&mut Cursor::new(framed)).unwrap();
        // Cursor reports EOF (Ok(0)) after the frame, which surfaces as closed.
        assert!(closed);
        assert_eq!(messages, vec![parts]);
        assert_eq!(codec.messages_decoded(), 1);
    }

    #[test]
    fn test_single_part_message() {
        let parts = vec![b"compressed depth bytes".to_vec()];
        let framed = FrameCodec::encode(&parts);
        let mut codec = FrameCodec::with_default_max();
        let (messages, _) = codec.read_from(&mut Cursor::new(framed)).unwrap();
        assert_eq!(messages, vec![parts]);
    }

    #[test]
    fn test_incremental_byte_by_byte() {
        let parts = vec![vec![0x01], vec![]];
        let mut rd = DribbleReader {
            data: FrameCodec::encode(&parts),
            pos: 0,
            chunk: 1,
        };

        let mut codec = FrameCodec::with_default_max();
        let (messages, closed) = codec.read_from(&mut rd).unwrap();
        assert!(!closed);
        assert_eq!(messages, vec![parts]);
    }

    #[test]
    fn test_two_messages_in_one_read() {
        let a = vec![vec![0x01]];
        let b = vec![vec![0x02]];
        let mut data = FrameCodec::encode(&a);
        data.extend_from_slice(&FrameCodec::encode(&b));

        let mut rd = DribbleReader {
            data,
            pos: 0,
            chunk: 4096,
        };
        let mut codec = FrameCodec::with_default_max();
        let (messages, _) = codec.read_from(&mut rd).unwrap();
        assert_eq!(messages, vec![a, b]);
        assert_eq!(codec.messages_decoded(), 2);
    }

    #[test]
    fn test_oversized_message_rejected() {
        let framed = FrameCodec::encode(&[vec![0u8; 128]]);
        let mut codec = FrameCodec::new(64);
        let err = codec.read_from(&mut Cursor::new(framed)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(codec.messages_rejected(), 1);
    }

    #[test]
    fn test_part_overrun_rejected() {
        // Outer frame claims 6 bytes of body, inner part claims 100.
        let mut data = Vec::new();
        data.extend_from_slice(&6u32.to_be_bytes());
        data.extend_from_slice(&100u32.to_be_bytes());
        data.extend_from_slice(&[0xaa, 0xbb]);

        let mut codec = FrameCodec::with_default_max();
        let err = codec.read_from(&mut Cursor::new(data)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_empty_parts_preserved() {
        let parts = vec![vec![], vec![]];
        let framed = FrameCodec::encode(&parts);
        let mut codec = FrameCodec::with_default_max();
        let (messages, _) = codec.read_from(&mut Cursor::new(framed)).unwrap();
        assert_eq!(messages, vec![parts]);
    }
}
