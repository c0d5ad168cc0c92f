//! Newline-delimited frame codec.
//!
//! Each frame is the bytes of one JSON object terminated by `\n`. The codec
//! yields raw line bytes (without the terminator) so the authenticator can
//! verify the exact wire representation before any JSON decoding happens.
//!
//! The byte cap is enforced on the *buffer*, not the parsed frame: the
//! moment more than `max_frame_size` bytes accumulate without a newline the
//! decoder fails, so a peer cannot grow server memory by withholding the
//! terminator.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::error::ProtocolError;

/// Codec for newline-terminated frames with a byte cap.
#[derive(Debug, Clone)]
pub struct LineCodec {
    max_frame_size: usize,
}

impl LineCodec {
    /// Creates a codec enforcing the given frame size cap.
    #[must_use]
    pub const fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    /// Returns the configured cap.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Decoder for LineCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
        // Scan only up to the cap; a newline beyond it means the frame is
        // oversized regardless.
        let scan_end = src.len().min(self.max_frame_size.saturating_add(1));
        match src[..scan_end].iter().position(|&b| b == b'\n') {
            Some(idx) => {
                if idx > self.max_frame_size {
                    return Err(ProtocolError::FrameTooLarge {
                        size: idx,
                        max: self.max_frame_size,
                    });
                }
                let mut line = src.split_to(idx);
                src.advance(1);
                // Tolerate CRLF peers.
                if line.last() == Some(&b'\r') {
                    line.truncate(line.len() - 1);
                }
                Ok(Some(line.freeze()))
            },
            None => {
                if src.len() > self.max_frame_size {
                    return Err(ProtocolError::FrameTooLarge {
                        size: src.len(),
                        max: self.max_frame_size,
                    });
                }
                Ok(None)
            },
        }
    }
}

impl Encoder<Bytes> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.reserve(item.len() + 1);
        dst.extend_from_slice(&item);
        dst.put_u8(b'\n');
        Ok(())
    }
}

impl Encoder<Vec<u8>> for LineCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        self.encode(Bytes::from(item), dst)
    }
}
