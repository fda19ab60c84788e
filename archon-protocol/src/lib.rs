// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire protocol engine for the STA Archon CCD controller.
//!
//! The Archon speaks a line-oriented protocol over TCP in which every
//! client frame carries a two-digit hexadecimal command identifier and
//! every device frame echoes the identifier of the command it answers.
//! Replies may arrive out of order with respect to the commands that
//! triggered them, and a reply may be either a short ASCII line or a
//! fixed-size binary chunk.
//!
//! This crate provides the pieces that deal with bytes and identifiers:
//! the stream framer ([`ArchonCodec`]), the reply parser
//! ([`ArchonReply`]), the in-flight command object ([`ArchonCommand`])
//! and the identifier pool ([`IdPool`]). Connection handling and the
//! high-level controller operations live in the `archon-controller`
//! crate.

pub mod codec;
pub mod command;
pub mod error;
pub mod pool;
pub mod reply;

pub use codec::{ArchonCodec, BinaryReplySize};
pub use command::{ArchonCommand, ArchonCommandStatus, CommandOptions};
pub use error::ProtocolError;
pub use pool::{IdPool, SharedIdPool};
pub use reply::{peek_command_id, ArchonReply, ReplyPayload, ReplyType};

/// Highest valid command identifier on the wire.
pub const MAX_COMMAND_ID: u8 = 0xFF;

/// Payload size in bytes of one binary reply chunk.
pub const BINARY_CHUNK_SIZE: usize = 1024;

/// Size in bytes of one binary chunk on the wire, including the
/// four-byte `<XX:` header that precedes the payload.
pub const RAW_CHUNK_SIZE: usize = BINARY_CHUNK_SIZE + 4;
