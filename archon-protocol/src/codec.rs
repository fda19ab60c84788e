// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Stream framer for the mixed text and binary reply protocol.
//!
//! Framing is decided by peeking the first four bytes of a reply. If
//! the fourth byte is a newline the frame is a bare `<XX\n` or `?XX\n`
//! acknowledgement. If it is a colon, the frame is `<XX:` followed by
//! exactly 1024 bytes of payload and no terminator. Anything else is a
//! text frame that extends to the next newline.
//!
//! When the expected total size of a binary reply has been declared
//! through [`BinaryReplySize`], consecutive binary chunks are
//! accumulated and emitted as a single frame of the declared size. The
//! controller declares the size before sending the command that
//! triggers the transfer, so the slot is always armed by the time the
//! first chunk arrives. Building one logical frame instead of one per
//! chunk matters here because a full frame buffer is hundreds of
//! megabytes of 1024-byte chunks.

use std::sync::{Arc, Mutex, PoisonError};

use bytes::{Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::RAW_CHUNK_SIZE;

/// Single-slot pre-declaration of the total size of the next binary
/// reply, including the four-byte chunk headers.
///
/// The slot is shared between the controller, which sets it, and the
/// codec, which consumes it when the first binary chunk arrives. Only
/// one binary-returning command may be outstanding at a time.
#[derive(Debug, Clone, Default)]
pub struct BinaryReplySize(Arc<Mutex<Option<usize>>>);

impl BinaryReplySize {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares the size of the next binary reply.
    pub fn set(&self, size: usize) {
        *self.lock() = Some(size);
    }

    /// Clears a declaration that was never consumed.
    pub fn clear(&self) {
        *self.lock() = None;
    }

    fn take(&self) -> Option<usize> {
        self.lock().take()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<usize>> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Splits the reply stream into raw frames.
#[derive(Debug, Default)]
pub struct ArchonCodec {
    expected_binary: BinaryReplySize,
    accumulated: BytesMut,
    remaining: usize,
}

impl ArchonCodec {
    pub fn new(expected_binary: BinaryReplySize) -> Self {
        Self {
            expected_binary,
            accumulated: BytesMut::new(),
            remaining: 0,
        }
    }
}

impl Decoder for ArchonCodec {
    type Item = Bytes;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, Self::Error> {
        loop {
            if src.len() < 4 {
                return Ok(None);
            }

            match src[3] {
                b'\n' => return Ok(Some(src.split_to(4).freeze())),
                b':' => {
                    if src.len() < RAW_CHUNK_SIZE {
                        src.reserve(RAW_CHUNK_SIZE - src.len());
                        return Ok(None);
                    }
                    let chunk = src.split_to(RAW_CHUNK_SIZE);

                    if self.remaining == 0 {
                        match self.expected_binary.take() {
                            Some(total) => {
                                self.remaining = total;
                                self.accumulated.clear();
                                self.accumulated.reserve(total);
                            }
                            // No declared size, each chunk is a frame.
                            None => return Ok(Some(chunk.freeze())),
                        }
                    }

                    self.accumulated.extend_from_slice(&chunk);
                    self.remaining = self.remaining.saturating_sub(RAW_CHUNK_SIZE);
                    if self.remaining == 0 {
                        return Ok(Some(self.accumulated.split().freeze()));
                    }
                }
                _ => match src[4..].iter().position(|byte| *byte == b'\n') {
                    Some(position) => {
                        return Ok(Some(src.split_to(4 + position + 1).freeze()));
                    }
                    None => return Ok(None),
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BINARY_CHUNK_SIZE;
    use pretty_assertions::assert_eq;

    fn decode_all(codec: &mut ArchonCodec, src: &mut BytesMut) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Some(frame) = codec.decode(src).unwrap() {
            frames.push(frame);
        }
        frames
    }

    fn chunk(id: u8, fill: u8) -> Vec<u8> {
        let mut chunk = format!("<{id:02X}:").into_bytes();
        chunk.extend_from_slice(&vec![fill; BINARY_CHUNK_SIZE]);
        chunk
    }

    #[test]
    fn splits_text_frames() {
        let mut codec = ArchonCodec::default();
        let mut src = BytesMut::from(&b"<01PONG\n?02\n<03\n"[..]);
        let frames = decode_all(&mut codec, &mut src);
        assert_eq!(
            frames,
            vec![
                Bytes::from_static(b"<01PONG\n"),
                Bytes::from_static(b"?02\n"),
                Bytes::from_static(b"<03\n"),
            ]
        );
        assert!(src.is_empty());
    }

    #[test]
    fn waits_for_the_rest_of_a_text_frame() {
        let mut codec = ArchonCodec::default();
        let mut src = BytesMut::from(&b"<01PO"[..]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(b"NG\n");
        assert_eq!(
            codec.decode(&mut src).unwrap().unwrap(),
            Bytes::from_static(b"<01PONG\n")
        );
    }

    #[test]
    fn yields_undeclared_binary_chunks_one_by_one() {
        let mut codec = ArchonCodec::default();
        let mut src = BytesMut::new();
        src.extend_from_slice(&chunk(0x01, b'x'));
        src.extend_from_slice(&chunk(0x01, b'y'));
        let frames = decode_all(&mut codec, &mut src);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].len(), RAW_CHUNK_SIZE);
        assert_eq!(frames[1].len(), RAW_CHUNK_SIZE);
    }

    #[test]
    fn accumulates_declared_binary_reply() {
        let expected = BinaryReplySize::new();
        expected.set(3 * RAW_CHUNK_SIZE);
        let mut codec = ArchonCodec::new(expected.clone());

        let mut src = BytesMut::new();
        src.extend_from_slice(&chunk(0x01, b'a'));
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&chunk(0x01, b'b'));
        assert!(codec.decode(&mut src).unwrap().is_none());
        src.extend_from_slice(&chunk(0x01, b'c'));

        let frame = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.len(), 3 * RAW_CHUNK_SIZE);

        // The declaration is single-shot, the next chunk stands alone.
        src.extend_from_slice(&chunk(0x01, b'd'));
        let frame = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.len(), RAW_CHUNK_SIZE);
    }

    #[test]
    fn partial_binary_chunk_waits_for_more_data() {
        let mut codec = ArchonCodec::default();
        let mut src = BytesMut::from(&b"<01:abc"[..]);
        assert!(codec.decode(&mut src).unwrap().is_none());
        let mut rest = chunk(0x01, b'z');
        rest.drain(..7);
        src.extend_from_slice(&rest);
        let frame = codec.decode(&mut src).unwrap().unwrap();
        assert_eq!(frame.len(), RAW_CHUNK_SIZE);
    }

    #[test]
    fn text_frames_between_binary_transfers() {
        let expected = BinaryReplySize::new();
        expected.set(RAW_CHUNK_SIZE);
        let mut codec = ArchonCodec::new(expected);

        let mut src = BytesMut::new();
        src.extend_from_slice(b"<05OK\n");
        src.extend_from_slice(&chunk(0x01, b'a'));
        src.extend_from_slice(b"<06DONE\n");

        let frames = decode_all(&mut codec, &mut src);
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], Bytes::from_static(b"<05OK\n"));
        assert_eq!(frames[1].len(), RAW_CHUNK_SIZE);
        assert_eq!(frames[2], Bytes::from_static(b"<06DONE\n"));
    }
}
