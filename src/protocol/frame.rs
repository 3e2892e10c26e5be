//! Stream framing for byte-oriented radio links (serial and TCP).
//!
//! The wire format is:
//! ```text
//! ┌──────────┬──────────┬──────────────┬─────────────────┐
//! │  0x94    │  0xc3    │  size (BE)   │    payload      │
//! │  1 byte  │  1 byte  │   2 bytes    │   size bytes    │
//! └──────────┴──────────┴──────────────┴─────────────────┘
//! ```
//!
//! Radios interleave plain-text debug output with frames on the same
//! stream, so the decoder skips anything that does not start with the
//! two marker bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::FrameError;

/// First frame marker byte.
pub const START1: u8 = 0x94;

/// Second frame marker byte.
pub const START2: u8 = 0xc3;

/// Maximum frame payload size accepted by the firmware.
pub const MAX_FRAME_SIZE: usize = 512;

/// Header size (two marker bytes + 2-byte length).
pub const HEADER_SIZE: usize = 4;

/// Encodes a payload into a framed message.
///
/// # Errors
///
/// Returns `FrameError::TooLarge` if the payload exceeds `MAX_FRAME_SIZE`.
pub fn encode(payload: &[u8]) -> Result<Bytes, FrameError> {
    let len = u16::try_from(payload.len())
        .ok()
        .filter(|&len| usize::from(len) <= MAX_FRAME_SIZE)
        .ok_or(FrameError::TooLarge {
            size: payload.len(),
            max: MAX_FRAME_SIZE,
        })?;

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u8(START1);
    buf.put_u8(START2);
    buf.put_u16(len);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Frame decoder that handles partial data and line noise.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
}

impl FrameDecoder {
    /// Creates a new frame decoder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::new(),
        }
    }

    /// Feeds data into the decoder.
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next complete frame.
    ///
    /// Returns `Ok(Some(payload))` if a complete frame was decoded,
    /// `Ok(None)` if more data is needed.
    ///
    /// # Errors
    ///
    /// Returns `FrameError::TooLarge` when a header announces more than
    /// `MAX_FRAME_SIZE` bytes. The bogus header is dropped so the next call
    /// resynchronises on the following marker.
    pub fn decode(&mut self) -> Result<Option<Bytes>, FrameError> {
        self.skip_noise();

        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let length = u16::from_be_bytes([self.buffer[2], self.buffer[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            self.buffer.advance(1);
            return Err(FrameError::TooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        let total_frame_size = HEADER_SIZE + length;
        if self.buffer.len() < total_frame_size {
            return Ok(None);
        }

        self.buffer.advance(HEADER_SIZE);
        let payload = self.buffer.split_to(length).freeze();

        Ok(Some(payload))
    }

    /// Drops bytes up to the next `START1 START2` pair.
    fn skip_noise(&mut self) {
        let mut skip = 0;
        while skip < self.buffer.len() {
            if self.buffer[skip] == START1 {
                match self.buffer.get(skip + 1) {
                    Some(&START2) | None => break,
                    Some(_) => {}
                }
            }
            skip += 1;
        }

        if skip > 0 {
            tracing::trace!("skipping {} bytes of line noise", skip);
            self.buffer.advance(skip);
        }
    }

    /// Returns the number of bytes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Clears the internal buffer.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_simple() {
        let frame = encode(b"hello").unwrap();

        assert_eq!(&frame[..2], &[START1, START2]);
        assert_eq!(frame[2], 0); // length high byte
        assert_eq!(frame[3], 5); // length low byte
        assert_eq!(&frame[4..], b"hello");
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let payload = vec![0u8; MAX_FRAME_SIZE + 1];
        assert!(matches!(
            encode(&payload),
            Err(FrameError::TooLarge { size: 513, max: MAX_FRAME_SIZE })
        ));
        assert!(encode(&vec![0u8; 70_000]).is_err());
        assert_eq!(encode(&payload[..MAX_FRAME_SIZE]).unwrap().len(), 516);
    }

    #[test]
    fn test_decode_partial_frame() {
        let mut decoder = FrameDecoder::new();

        decoder.feed(&[START1, START2, 0x00, 0x05, b'h', b'e']);
        assert_eq!(decoder.decode().unwrap(), None);

        decoder.feed(b"llo");
        let result = decoder.decode().unwrap();
        assert_eq!(result, Some(Bytes::from_static(b"hello")));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decode_skips_debug_output() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(b"INFO | ??:??:?? boot\r\n");
        decoder.feed(&encode(b"ok").unwrap());

        let result = decoder.decode().unwrap();
        assert_eq!(result, Some(Bytes::from_static(b"ok")));
    }

    #[test]
    fn test_decode_keeps_split_marker() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[b'x', START1]);
        assert_eq!(decoder.decode().unwrap(), None);
        assert_eq!(decoder.buffered(), 1);

        decoder.feed(&[START2, 0x00, 0x01, b'!']);
        assert_eq!(
            decoder.decode().unwrap(),
            Some(Bytes::from_static(b"!"))
        );
    }

    #[test]
    fn test_decode_oversized_resyncs() {
        let mut decoder = FrameDecoder::new();
        decoder.feed(&[START1, START2, 0xff, 0xff]);
        decoder.feed(&encode(b"next").unwrap());

        assert!(matches!(
            decoder.decode(),
            Err(FrameError::TooLarge { size: 0xffff, .. })
        ));
        assert_eq!(
            decoder.decode().unwrap(),
            Some(Bytes::from_static(b"next"))
        );
    }

    #[test]
    fn test_decode_multiple_frames() {
        let mut decoder = FrameDecoder::new();
        let mut stream = encode(b"hi").unwrap().to_vec();
        stream.extend_from_slice(&encode(b"bye").unwrap());
        decoder.feed(&stream);

        assert_eq!(decoder.decode().unwrap(), Some(Bytes::from_static(b"hi")));
        assert_eq!(decoder.decode().unwrap(), Some(Bytes::from_static(b"bye")));
        assert_eq!(decoder.decode().unwrap(), None);
    }
}
