// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for the wire protocol layer.

/// Errors raised while parsing replies or managing identifiers.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The reply did not match either the text or the binary frame
    /// shape. The associated string is a lossy rendition of the frame.
    #[error("received unparseable reply: {0:?}")]
    UnparseableReply(String),
    /// A text accessor was invoked on a binary payload.
    #[error("the reply payload is binary and cannot be read as text")]
    BinaryPayload,
    /// A binary accessor was invoked on a text payload.
    #[error("the reply payload is text and cannot be read as binary")]
    TextPayload,
    /// `acquire` was called on an empty identifier pool.
    #[error("no command ids remaining in the pool")]
    PoolExhausted,
}
