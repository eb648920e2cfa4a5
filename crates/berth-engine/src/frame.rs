//! Framing of the attach output stream.
//!
//! When a container runs without a terminal, the engine multiplexes stdout
//! and stderr over one connection. Each frame starts with an 8-byte header:
//! one byte naming the stream, three padding bytes, then a big-endian `u32`
//! payload length. With a terminal the connection carries raw console bytes
//! and no framing at all.

use std::fmt;
use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::Decoder;

/// Size of a multiplexed frame header.
pub const HEADER_LEN: usize = 8;

/// Which stream a chunk of attach output belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdStream {
    /// Echoed input.
    Stdin,
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
    /// Raw terminal output, unframed.
    Console,
}

impl StdStream {
    /// Maps a frame header tag to its stream. Tag 3 carries engine errors and
    /// is handled by the decoder itself.
    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::Stdin),
            1 => Some(Self::Stdout),
            2 => Some(Self::Stderr),
            _ => None,
        }
    }

    /// Header tag of a framed stream. `Console` output is never framed.
    #[must_use]
    pub const fn tag(self) -> Option<u8> {
        match self {
            Self::Stdin => Some(0),
            Self::Stdout => Some(1),
            Self::Stderr => Some(2),
            Self::Console => None,
        }
    }
}

impl fmt::Display for StdStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stdin => write!(f, "stdin"),
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
            Self::Console => write!(f, "console"),
        }
    }
}

/// One chunk of attach output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFrame {
    /// Stream the chunk was written to.
    pub stream: StdStream,
    /// Payload bytes.
    pub data: Bytes,
}

impl LogFrame {
    /// Creates a frame.
    #[must_use]
    pub fn new(stream: StdStream, data: impl Into<Bytes>) -> Self {
        Self {
            stream,
            data: data.into(),
        }
    }

    /// Encodes this frame with a multiplexing header.
    ///
    /// Console frames have no header and are returned as-is.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let Some(tag) = self.stream.tag() else {
            return self.data.to_vec();
        };
        let len = u32::try_from(self.data.len()).unwrap_or(u32::MAX);
        let mut out = Vec::with_capacity(HEADER_LEN + self.data.len());
        out.extend_from_slice(&[tag, 0, 0, 0]);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}

/// Decoder for the multiplexed stdout/stderr stream.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameDecoder;

/// Header tag the engine uses to report its own errors in-band.
const SYSTEM_ERROR_TAG: u8 = 3;

impl Decoder for FrameDecoder {
    type Item = LogFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<LogFrame>> {
        if src.len() < HEADER_LEN {
            src.reserve(HEADER_LEN - src.len());
            return Ok(None);
        }

        let tag = src[0];
        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]);
        let len = usize::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "frame too large"))?;
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let data = src.split_to(len).freeze();

        if tag == SYSTEM_ERROR_TAG {
            return Err(io::Error::other(
                String::from_utf8_lossy(&data).into_owned(),
            ));
        }
        let stream = StdStream::from_tag(tag).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unrecognized stream tag {tag}"),
            )
        })?;
        Ok(Some(LogFrame { stream, data }))
    }
}

/// Decoder passing raw terminal bytes through as console frames.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConsoleDecoder;

impl Decoder for ConsoleDecoder {
    type Item = LogFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<LogFrame>> {
        if src.is_empty() {
            return Ok(None);
        }
        let data = src.split().freeze();
        Ok(Some(LogFrame::new(StdStream::Console, data)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> io::Result<Vec<LogFrame>> {
        let mut decoder = FrameDecoder;
        let mut buf = BytesMut::from(bytes);
        let mut frames = Vec::new();
        while let Some(frame) = decoder.decode(&mut buf)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    #[test]
    fn decodes_interleaved_frames() {
        let mut raw = LogFrame::new(StdStream::Stdout, "hi\n").encode();
        raw.extend(LogFrame::new(StdStream::Stderr, "oops").encode());

        let frames = decode_all(&raw).expect("decode");
        assert_eq!(
            frames,
            vec![
                LogFrame::new(StdStream::Stdout, "hi\n"),
                LogFrame::new(StdStream::Stderr, "oops"),
            ]
        );
    }

    #[test]
    fn waits_for_a_complete_frame() {
        let raw = LogFrame::new(StdStream::Stdout, "partial").encode();
        let mut decoder = FrameDecoder;

        let mut buf = BytesMut::from(&raw[..5]);
        assert!(decoder.decode(&mut buf).expect("decode").is_none());

        let mut buf = BytesMut::from(&raw[..raw.len() - 1]);
        assert!(decoder.decode(&mut buf).expect("decode").is_none());

        buf.extend_from_slice(&raw[raw.len() - 1..]);
        let frame = decoder.decode(&mut buf).expect("decode").expect("frame");
        assert_eq!(frame.data, Bytes::from_static(b"partial"));
        assert!(buf.is_empty());
    }

    #[test]
    fn system_error_frame_fails_the_stream() {
        let mut raw = vec![SYSTEM_ERROR_TAG, 0, 0, 0, 0, 0, 0, 4];
        raw.extend_from_slice(b"boom");

        let err = decode_all(&raw).expect_err("system error");
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn unknown_tag_is_invalid_data() {
        let raw = [9, 0, 0, 0, 0, 0, 0, 0];
        let err = decode_all(&raw).expect_err("bad tag");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn console_frames_encode_without_header() {
        let frame = LogFrame::new(StdStream::Console, "raw");
        assert_eq!(frame.encode(), b"raw");
    }
}
