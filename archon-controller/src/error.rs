// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Error types for controller sessions and procedures.

use archon_protocol::{ArchonCommandStatus, ProtocolError};

/// Errors raised by an [`crate::ArchonController`].
#[derive(Debug, thiserror::Error)]
pub enum ArchonError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The session has not been started or has been stopped.
    #[error("the controller is not connected")]
    NotConnected,
    /// A command completed with a non-success status. Procedures fail
    /// fast on the first command that reports this.
    #[error("command {command} finished with status {status:?}")]
    CommandFailed {
        command: String,
        status: ArchonCommandStatus,
    },
    /// The operation is not legal in the current lifecycle state. The
    /// status bitmask is left untouched.
    #[error("{0}")]
    InvalidState(String),
    /// A device report did not include an expected keyword.
    #[error("missing keyword {0:?} in device reply")]
    MissingKey(String),
    /// A device report could not be interpreted.
    #[error("invalid device reply: {0}")]
    InvalidReply(String),
    /// A configuration payload could not be parsed or serialized.
    #[error("invalid ACF payload: {0}")]
    Acf(String),
    /// The library configuration could not be loaded.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// A blocking procedure exceeded its deadline.
    #[error("timed out {0}")]
    Timeout(String),
}

impl ArchonError {
    /// Shorthand used by procedures when a command they issued did not
    /// succeed.
    pub(crate) fn command_failed(command: &archon_protocol::ArchonCommand) -> Self {
        ArchonError::CommandFailed {
            command: command.raw(),
            status: command.status(),
        }
    }
}
