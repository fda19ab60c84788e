// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Typed parsing of device replies.
//!
//! A text reply has the shape `<XXpayload\n` (or `?XX...` for an
//! error), where `XX` is the upper-case hexadecimal identifier of the
//! command being answered. A binary reply has the shape `<XX:` followed
//! by 1024 bytes of raw payload and no terminator. When several binary
//! chunks were accumulated by the framer into one logical frame, the
//! parser strips the repeated `<XX:` headers and concatenates the
//! payloads.

use bytes::{Bytes, BytesMut};

use crate::error::ProtocolError;
use crate::{BINARY_CHUNK_SIZE, RAW_CHUNK_SIZE};

/// Whether the device reported success (`<`) or an error (`?`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyType {
    Ok,
    Error,
}

/// The payload of a reply, which on the wire is either an ASCII line or
/// raw bytes depending on the frame shape.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyPayload {
    Text(String),
    Binary(Bytes),
}

/// One parsed reply belonging to a specific command.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchonReply {
    pub reply_type: ReplyType,
    pub command_id: u8,
    pub payload: ReplyPayload,
}

fn hex_digit(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Extracts the command identifier from the first bytes of a raw frame,
/// without parsing the payload. Returns `None` if the frame does not
/// start with `<` or `?` followed by two upper-case hex digits.
pub fn peek_command_id(raw: &[u8]) -> Option<u8> {
    if raw.len() < 3 || (raw[0] != b'<' && raw[0] != b'?') {
        return None;
    }
    Some((hex_digit(raw[1])? << 4) | hex_digit(raw[2])?)
}

fn lossy(raw: &[u8]) -> String {
    const PREVIEW: usize = 64;
    String::from_utf8_lossy(&raw[..raw.len().min(PREVIEW)]).into_owned()
}

impl ArchonReply {
    /// Parses a raw frame as produced by the framer.
    pub fn parse(raw: &[u8]) -> Result<Self, ProtocolError> {
        let command_id =
            peek_command_id(raw).ok_or_else(|| ProtocolError::UnparseableReply(lossy(raw)))?;
        let reply_type = if raw[0] == b'?' {
            ReplyType::Error
        } else {
            ReplyType::Ok
        };

        if raw.len() > 3 && raw[3] == b':' {
            let payload = strip_chunk_headers(raw, command_id)?;
            return Ok(Self {
                reply_type,
                command_id,
                payload: ReplyPayload::Binary(payload),
            });
        }

        let message = raw.get(3..).unwrap_or_default();
        let text = std::str::from_utf8(message)
            .map_err(|_| ProtocolError::UnparseableReply(lossy(raw)))?;
        Ok(Self {
            reply_type,
            command_id,
            payload: ReplyPayload::Text(text.trim().to_string()),
        })
    }

    pub fn is_binary(&self) -> bool {
        matches!(self.payload, ReplyPayload::Binary(_))
    }

    /// Returns the text payload, or an error if the reply is binary.
    pub fn as_text(&self) -> Result<&str, ProtocolError> {
        match &self.payload {
            ReplyPayload::Text(text) => Ok(text),
            ReplyPayload::Binary(_) => Err(ProtocolError::BinaryPayload),
        }
    }

    /// Returns the binary payload, or an error if the reply is text.
    pub fn as_binary(&self) -> Result<&Bytes, ProtocolError> {
        match &self.payload {
            ReplyPayload::Binary(bytes) => Ok(bytes),
            ReplyPayload::Text(_) => Err(ProtocolError::TextPayload),
        }
    }
}

/// Removes the `<XX:` header of every 1028-byte chunk in `raw` and
/// concatenates the 1024-byte payloads. Every chunk must carry the same
/// command identifier.
fn strip_chunk_headers(raw: &[u8], command_id: u8) -> Result<Bytes, ProtocolError> {
    if raw.len() % RAW_CHUNK_SIZE != 0 {
        return Err(ProtocolError::UnparseableReply(lossy(raw)));
    }
    let mut payload = BytesMut::with_capacity((raw.len() / RAW_CHUNK_SIZE) * BINARY_CHUNK_SIZE);
    for chunk in raw.chunks_exact(RAW_CHUNK_SIZE) {
        if chunk[3] != b':' || peek_command_id(chunk) != Some(command_id) {
            return Err(ProtocolError::UnparseableReply(lossy(chunk)));
        }
        payload.extend_from_slice(&chunk[4..]);
    }
    Ok(payload.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_text_reply() {
        let reply = ArchonReply::parse(b"<01PONG\n").unwrap();
        assert_eq!(reply.reply_type, ReplyType::Ok);
        assert_eq!(reply.command_id, 0x01);
        assert_eq!(reply.as_text().unwrap(), "PONG");
        assert!(reply.as_binary().is_err());
    }

    #[test]
    fn parses_error_reply_without_newline() {
        let reply = ArchonReply::parse(b"?A0").unwrap();
        assert_eq!(reply.reply_type, ReplyType::Error);
        assert_eq!(reply.command_id, 0xA0);
        assert_eq!(reply.as_text().unwrap(), "");
    }

    #[test]
    fn parses_binary_chunk() {
        let mut raw = b"<0F:".to_vec();
        raw.extend_from_slice(b"12345");
        raw.resize(RAW_CHUNK_SIZE, 0);
        let reply = ArchonReply::parse(&raw).unwrap();
        assert!(reply.is_binary());
        let payload = reply.as_binary().unwrap();
        assert_eq!(payload.len(), BINARY_CHUNK_SIZE);
        assert_eq!(&payload[..5], b"12345");
        assert!(reply.as_text().is_err());
    }

    #[test]
    fn concatenates_accumulated_chunks() {
        let mut raw = Vec::new();
        for fill in [b'a', b'b', b'c'] {
            raw.extend_from_slice(b"<10:");
            raw.extend_from_slice(&vec![fill; BINARY_CHUNK_SIZE]);
        }
        let reply = ArchonReply::parse(&raw).unwrap();
        let payload = reply.as_binary().unwrap();
        assert_eq!(payload.len(), 3 * BINARY_CHUNK_SIZE);
        assert_eq!(payload[0], b'a');
        assert_eq!(payload[BINARY_CHUNK_SIZE], b'b');
        assert_eq!(payload[2 * BINARY_CHUNK_SIZE], b'c');
    }

    #[test]
    fn rejects_mismatched_chunk_headers() {
        let mut raw = Vec::new();
        raw.extend_from_slice(b"<10:");
        raw.extend_from_slice(&[0u8; BINARY_CHUNK_SIZE]);
        raw.extend_from_slice(b"<11:");
        raw.extend_from_slice(&[0u8; BINARY_CHUNK_SIZE]);
        assert!(ArchonReply::parse(&raw).is_err());
    }

    #[test]
    fn rejects_garbage() {
        assert!(ArchonReply::parse(b"bad_reply").is_err());
        assert!(ArchonReply::parse(b"<zzPONG\n").is_err());
        assert!(ArchonReply::parse(b"").is_err());
    }

    #[test]
    fn peeks_command_ids() {
        assert_eq!(peek_command_id(b"<FFPONG\n"), Some(0xFF));
        assert_eq!(peek_command_id(b"?00"), Some(0x00));
        assert_eq!(peek_command_id(b">01PING"), None);
        assert_eq!(peek_command_id(b"<0"), None);
    }
}
