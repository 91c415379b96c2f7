//! Peer wire framing (length + crc32c).
//!
//! Every envelope travels as `[len: u32 BE][crc32c: u32 BE][body]`. The
//! length covers the body only. Oversize and corrupt frames are rejected
//! before the envelope codec ever sees them.

use std::io::{Read, Write};

use crc32c::crc32c;
use thiserror::Error;

pub const FRAME_HEADER_LEN: usize = 8;

/// Upper bound on a single frame body. Discovery announcements stay tiny;
/// anything approaching this is hostile or corrupt.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame length invalid: {reason}")]
    LengthInvalid { reason: &'static str },
    #[error("frame too large: max {max} got {got}")]
    TooLarge { max: usize, got: usize },
    #[error("frame crc mismatch: expected {expected:#010x} got {got:#010x}")]
    CrcMismatch { expected: u32, got: u32 },
}

impl FrameError {
    /// Corrupt input (as opposed to a transport failure) counts against the
    /// sender's protocol-violation budget.
    pub fn is_violation(&self) -> bool {
        !matches!(self, FrameError::Io(_))
    }
}

pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, FrameError> {
    if body.is_empty() {
        return Err(FrameError::LengthInvalid {
            reason: "frame body cannot be empty",
        });
    }
    if body.len() > MAX_FRAME_BYTES {
        return Err(FrameError::TooLarge {
            max: MAX_FRAME_BYTES,
            got: body.len(),
        });
    }

    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&crc32c(body).to_be_bytes());
    buf.extend_from_slice(body);
    Ok(buf)
}

/// Blocking frame reader over a byte stream.
pub struct FrameReader<R> {
    reader: R,
}

impl<R: Read> FrameReader<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    /// Read the next frame body. `Ok(None)` signals a clean EOF on a frame
    /// boundary; EOF mid-frame is an error.
    pub fn read_next(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        match read_exact_or_eof(&mut self.reader, &mut header)? {
            ReadOutcome::Eof => return Ok(None),
            ReadOutcome::Filled => {}
        }

        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if length == 0 {
            return Err(FrameError::LengthInvalid {
                reason: "frame length cannot be zero",
            });
        }
        if length > MAX_FRAME_BYTES {
            return Err(FrameError::TooLarge {
                max: MAX_FRAME_BYTES,
                got: length,
            });
        }
        let expected = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);

        let mut body = vec![0u8; length];
        self.reader.read_exact(&mut body)?;

        let got = crc32c(&body);
        if got != expected {
            return Err(FrameError::CrcMismatch { expected, got });
        }

        Ok(Some(body))
    }
}

enum ReadOutcome {
    Filled,
    Eof,
}

fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<ReadOutcome, FrameError> {
    let mut filled = 0usize;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(ReadOutcome::Eof);
            }
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "frame truncated",
            )
            .into());
        }
        filled += n;
    }
    Ok(ReadOutcome::Filled)
}

pub struct FrameWriter<W> {
    writer: W,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write_frame(&mut self, body: &[u8]) -> Result<(), FrameError> {
        let frame = encode_frame(body)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_validates_crc() {
        let frame = encode_frame(b"hello").unwrap();
        let mut reader = FrameReader::new(Cursor::new(frame));
        assert_eq!(reader.read_next().unwrap().unwrap(), b"hello");
        assert!(reader.read_next().unwrap().is_none());
    }

    #[test]
    fn corrupt_body_is_rejected() {
        let mut frame = encode_frame(b"hello").unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        let mut reader = FrameReader::new(Cursor::new(frame));
        let err = reader.read_next().unwrap_err();
        assert!(matches!(err, FrameError::CrcMismatch { .. }));
        assert!(err.is_violation());
    }

    #[test]
    fn truncated_frame_is_an_io_error() {
        let frame = encode_frame(b"hello").unwrap();
        let mut reader = FrameReader::new(Cursor::new(&frame[..frame.len() - 2]));
        let err = reader.read_next().unwrap_err();
        assert!(matches!(err, FrameError::Io(_)));
        assert!(!err.is_violation());
    }

    #[test]
    fn zero_length_frame_is_a_violation() {
        let mut frame = encode_frame(b"x").unwrap();
        frame[0..4].copy_from_slice(&0u32.to_be_bytes());
        let mut reader = FrameReader::new(Cursor::new(frame));
        assert!(matches!(
            reader.read_next().unwrap_err(),
            FrameError::LengthInvalid { .. }
        ));
    }

    #[test]
    fn oversize_frame_is_rejected_without_allocation() {
        let mut header = Vec::new();
        header.extend_from_slice(&(u32::MAX).to_be_bytes());
        header.extend_from_slice(&0u32.to_be_bytes());
        let mut reader = FrameReader::new(Cursor::new(header));
        assert!(matches!(
            reader.read_next().unwrap_err(),
            FrameError::TooLarge { .. }
        ));
    }
}
