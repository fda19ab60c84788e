// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TCP session ownership and reply dispatch.
//!
//! One receiver task drives the framer and routes every parsed frame
//! to the in-flight command carrying the same identifier. Writes are
//! serialized through a mutex so each frame reaches the wire intact,
//! while reads proceed concurrently on the receiver task. A reaper
//! task sweeps completed commands out of the table.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use archon_protocol::{peek_command_id, ArchonCodec, ArchonCommand, BinaryReplySize};
use futures::StreamExt;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::FramedRead;
use tracing::{debug, warn};

use crate::error::ArchonError;

const REAP_INTERVAL: Duration = Duration::from_millis(500);

/// The in-flight command table, keyed by command identifier.
#[derive(Debug, Default)]
pub(crate) struct CommandTable {
    running: Mutex<HashMap<u8, Arc<ArchonCommand>>>,
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<u8, Arc<ArchonCommand>>> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a command under its identifier. Fails while another
    /// command with the same identifier is in flight; a completed
    /// command that the reaper has not swept yet is replaced.
    pub fn register(&self, command: Arc<ArchonCommand>) -> Result<(), ArchonError> {
        let mut running = self.lock();
        let id = command.command_id();
        if let Some(existing) = running.get(&id) {
            if !existing.status().is_terminal() {
                return Err(ArchonError::InvalidState(format!(
                    "command id 0x{id:02X} is already in flight"
                )));
            }
        }
        running.insert(id, command);
        Ok(())
    }

    pub fn remove(&self, id: u8) -> Option<Arc<ArchonCommand>> {
        self.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Routes one raw frame to the command carrying its identifier.
    /// Frames with no parseable identifier or no matching command are
    /// dropped with a warning.
    pub fn dispatch(&self, frame: &[u8]) {
        let Some(command_id) = peek_command_id(frame) else {
            warn!(
                frame = %String::from_utf8_lossy(&frame[..frame.len().min(32)]),
                "received invalid reply"
            );
            return;
        };
        let command = self.lock().get(&command_id).cloned();
        match command {
            Some(command) => {
                command.process_reply(frame);
            }
            None => {
                warn!(command_id, "cannot find a running command for reply");
            }
        }
    }

    /// Drops completed commands from the table.
    pub fn reap(&self) {
        self.lock().retain(|_, command| !command.status().is_terminal());
    }

    /// Terminates every in-flight command as timed out and empties the
    /// table. Used when the transport goes away.
    pub fn cancel_all(&self) {
        let commands: Vec<_> = {
            let mut running = self.lock();
            running.drain().map(|(_, command)| command).collect()
        };
        for command in commands {
            command.cancel();
        }
    }
}

/// An open TCP session to the device.
#[derive(Debug)]
pub(crate) struct Connection {
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    receiver: JoinHandle<()>,
    reaper: JoinHandle<()>,
}

impl Connection {
    /// Connects and spawns the receiver and reaper tasks.
    pub async fn open(
        host: &str,
        port: u16,
        connect_timeout: Duration,
        table: Arc<CommandTable>,
        binary_reply_size: BinaryReplySize,
    ) -> Result<Self, ArchonError> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect((host, port)))
            .await
            .map_err(|_| ArchonError::Timeout(format!("connecting to {host}:{port}")))??;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let framed = FramedRead::new(read_half, ArchonCodec::new(binary_reply_size));

        let receiver = tokio::spawn(receiver_loop(framed, Arc::clone(&table)));
        let reaper = tokio::spawn(reaper_loop(table));

        Ok(Self {
            writer: tokio::sync::Mutex::new(write_half),
            receiver,
            reaper,
        })
    }

    /// Writes one command frame, appending the newline terminator.
    pub async fn write_frame(&self, raw: &str) -> Result<(), ArchonError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(raw.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        Ok(())
    }

    /// Cancels the receiver and reaper and closes the socket.
    pub async fn stop(self) {
        self.receiver.abort();
        self.reaper.abort();
        let mut writer = self.writer.into_inner();
        let _ = writer.shutdown().await;
    }
}

async fn receiver_loop(
    mut framed: FramedRead<OwnedReadHalf, ArchonCodec>,
    table: Arc<CommandTable>,
) {
    while let Some(result) = framed.next().await {
        match result {
            Ok(frame) => table.dispatch(&frame),
            Err(err) => {
                warn!(%err, "error reading from the controller");
                break;
            }
        }
    }
    debug!("connection closed, cancelling in-flight commands");
    table.cancel_all();
}

async fn reaper_loop(table: Arc<CommandTable>) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        interval.tick().await;
        table.reap();
    }
}
