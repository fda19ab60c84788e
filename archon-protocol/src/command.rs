// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-flight command tracking.
//!
//! An [`ArchonCommand`] represents one request sent to the controller
//! and collects the replies the device produces for it. The command is
//! shared between the connection receiver, which feeds raw frames into
//! [`ArchonCommand::process_reply`], and the caller, which awaits
//! [`ArchonCommand::wait`] or consumes the reply stream. Reaching a
//! terminal state wakes every waiter and returns the command identifier
//! to the pool exactly once.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::Stream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::pool::SharedIdPool;
use crate::reply::{ArchonReply, ReplyType};

/// Status of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchonCommandStatus {
    /// The command is in flight and may still receive replies.
    Running,
    /// The expected number of replies arrived, none of them an error.
    Done,
    /// The device answered with an error reply, or a reply could not be
    /// parsed or did not match the command identifier.
    Failed,
    /// No reply arrived within the per-command inactivity timeout, or
    /// the command was cancelled from the outside.
    TimedOut,
}

impl ArchonCommandStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, ArchonCommandStatus::Running)
    }
}

/// Optional knobs for sending a command.
#[derive(Debug, Clone)]
pub struct CommandOptions {
    /// Identifier to use instead of one acquired from the pool.
    pub command_id: Option<u8>,
    /// Number of replies after which the command is done. `None` keeps
    /// the command running until an error, a timeout or cancellation.
    pub expected_replies: Option<usize>,
    /// Inactivity timeout between replies. `None` disables it.
    pub timeout: Option<Duration>,
}

impl Default for CommandOptions {
    fn default() -> Self {
        Self {
            command_id: None,
            expected_replies: Some(1),
            timeout: None,
        }
    }
}

#[derive(Debug)]
struct CommandState {
    status: ArchonCommandStatus,
    replies: Vec<ArchonReply>,
}

/// One request-response unit exchanged with the controller.
#[derive(Debug)]
pub struct ArchonCommand {
    command_string: String,
    command_id: u8,
    expected_replies: Option<usize>,
    timeout: Option<Duration>,
    pool: Option<SharedIdPool>,
    state: Mutex<CommandState>,
    // Bumped on every accepted reply and on the terminal transition.
    events: watch::Sender<u64>,
}

impl ArchonCommand {
    /// Creates a command expecting a single reply and no timeout.
    /// Construction does not send any bytes.
    pub fn new(command_string: &str, command_id: u8) -> Self {
        Self::with_options(command_string, command_id, Some(1), None, None)
    }

    pub fn with_options(
        command_string: &str,
        command_id: u8,
        expected_replies: Option<usize>,
        timeout: Option<Duration>,
        pool: Option<SharedIdPool>,
    ) -> Self {
        let (events, _) = watch::channel(0);
        Self {
            command_string: command_string.to_uppercase(),
            command_id,
            expected_replies,
            timeout,
            pool,
            state: Mutex::new(CommandState {
                status: ArchonCommandStatus::Running,
                replies: Vec::new(),
            }),
            events,
        }
    }

    /// The command text as it goes on the wire, upper-cased.
    pub fn command_string(&self) -> &str {
        &self.command_string
    }

    pub fn command_id(&self) -> u8 {
        self.command_id
    }

    /// The exact on-wire frame, without the trailing newline.
    pub fn raw(&self) -> String {
        format!(">{:02X}{}", self.command_id, self.command_string)
    }

    pub fn status(&self) -> ArchonCommandStatus {
        self.lock_state().status
    }

    /// `true` once the command completed with [`ArchonCommandStatus::Done`].
    pub fn succeeded(&self) -> bool {
        self.status() == ArchonCommandStatus::Done
    }

    /// Snapshot of the replies received so far.
    pub fn replies(&self) -> Vec<ArchonReply> {
        self.lock_state().replies.clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, CommandState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Processes one raw frame addressed to this command.
    ///
    /// An unparseable frame or a frame carrying a different command
    /// identifier fails the command. An error reply is recorded and
    /// fails the command. Otherwise the reply is appended, the
    /// inactivity timer resets, and the command is done once the
    /// expected reply count is reached. Replies arriving after a
    /// terminal transition are dropped.
    pub fn process_reply(&self, raw: &[u8]) -> Option<ArchonReply> {
        let reply = match ArchonReply::parse(raw) {
            Ok(reply) => reply,
            Err(err) => {
                warn!(command = %self.raw(), %err, "failed to parse reply");
                self.mark_done(ArchonCommandStatus::Failed);
                return None;
            }
        };

        if reply.command_id != self.command_id {
            warn!(
                command = %self.raw(),
                reply_id = reply.command_id,
                "received reply that does not match the command id"
            );
            self.mark_done(ArchonCommandStatus::Failed);
            return None;
        }

        let (is_error, reached) = {
            let mut state = self.lock_state();
            if state.status.is_terminal() {
                return None;
            }
            state.replies.push(reply.clone());
            (
                reply.reply_type == ReplyType::Error,
                self.expected_replies
                    .is_some_and(|expected| state.replies.len() >= expected),
            )
        };

        // Wakes the reply stream and resets the inactivity watchdog.
        self.events.send_modify(|version| *version += 1);

        if is_error {
            self.mark_done(ArchonCommandStatus::Failed);
        } else if reached {
            self.mark_done(ArchonCommandStatus::Done);
        }

        Some(reply)
    }

    /// Awaits the terminal status of the command.
    pub async fn wait(&self) -> ArchonCommandStatus {
        let mut events = self.events.subscribe();
        loop {
            let status = self.status();
            if status.is_terminal() {
                return status;
            }
            if events.changed().await.is_err() {
                return self.status();
            }
        }
    }

    /// Yields every reply as it is produced. The stream ends once the
    /// command reaches a terminal state and all earlier replies have
    /// been observed.
    pub fn reply_stream(&self) -> impl Stream<Item = ArchonReply> + '_ {
        let events = self.events.subscribe();
        futures::stream::unfold((0usize, events), move |(next, mut events)| async move {
            loop {
                {
                    let state = self.lock_state();
                    if state.replies.len() > next {
                        let reply = state.replies[next].clone();
                        return Some((reply, (next + 1, events)));
                    }
                    if state.status.is_terminal() {
                        return None;
                    }
                }
                if events.changed().await.is_err() {
                    return None;
                }
            }
        })
    }

    /// Spawns the inactivity watchdog for this command. Returns `None`
    /// when the command has no timeout configured.
    pub fn spawn_timeout(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let timeout = self.timeout?;
        let command = Arc::clone(self);
        Some(tokio::spawn(async move {
            let mut events = command.events.subscribe();
            loop {
                match tokio::time::timeout(timeout, events.changed()).await {
                    // Reply activity resets the timer.
                    Ok(Ok(())) => {
                        if command.status().is_terminal() {
                            break;
                        }
                    }
                    Ok(Err(_)) => break,
                    Err(_) => {
                        command.mark_done(ArchonCommandStatus::TimedOut);
                        break;
                    }
                }
            }
        }))
    }

    /// Cancels the command. Equivalent to the inactivity timer firing.
    pub fn cancel(&self) {
        self.mark_done(ArchonCommandStatus::TimedOut);
    }

    fn mark_done(&self, status: ArchonCommandStatus) {
        {
            let mut state = self.lock_state();
            if state.status.is_terminal() {
                return;
            }
            state.status = status;
        }
        self.events.send_modify(|version| *version += 1);
        if let Some(pool) = &self.pool {
            pool.release(self.command_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;

    #[test]
    fn raw_frame_uppercases_the_command() {
        let command = ArchonCommand::new("ping", 0x0A);
        assert_eq!(command.raw(), ">0APING");
    }

    #[test]
    fn unparseable_reply_fails_the_command() {
        let command = ArchonCommand::new("ping", 1);
        assert!(command.process_reply(b"bad_reply").is_none());
        assert_eq!(command.status(), ArchonCommandStatus::Failed);
    }

    #[test]
    fn mismatched_id_fails_the_command() {
        let command = ArchonCommand::new("ping", 1);
        assert!(command.process_reply(b"<02PONG\n").is_none());
        assert_eq!(command.status(), ArchonCommandStatus::Failed);
        assert!(command.replies().is_empty());
    }

    #[test]
    fn error_reply_is_recorded_and_fails() {
        let command = ArchonCommand::new("ping", 1);
        command.process_reply(b"?01");
        assert_eq!(command.status(), ArchonCommandStatus::Failed);
        assert_eq!(command.replies().len(), 1);
        assert_eq!(command.replies()[0].reply_type, ReplyType::Error);
    }

    #[tokio::test]
    async fn completes_after_expected_replies() {
        let command = ArchonCommand::with_options("ping", 1, Some(2), None, None);
        assert_eq!(command.status(), ArchonCommandStatus::Running);
        command.process_reply(b"<01pong1");
        assert_eq!(command.status(), ArchonCommandStatus::Running);
        command.process_reply(b"<01pong2");
        assert_eq!(command.status(), ArchonCommandStatus::Done);
        assert_eq!(command.wait().await, ArchonCommandStatus::Done);
    }

    #[tokio::test(start_paused = true)]
    async fn times_out_without_replies() {
        let command = Arc::new(ArchonCommand::with_options(
            "ping",
            1,
            Some(2),
            Some(Duration::from_millis(10)),
            None,
        ));
        let watchdog = command.spawn_timeout().unwrap();
        assert_eq!(command.wait().await, ArchonCommandStatus::TimedOut);
        watchdog.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn replies_reset_the_timeout() {
        let command = Arc::new(ArchonCommand::with_options(
            "ping",
            1,
            Some(2),
            Some(Duration::from_millis(50)),
            None,
        ));
        command.spawn_timeout().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        command.process_reply(b"<01pong1");
        tokio::time::sleep(Duration::from_millis(30)).await;
        // 60ms of wall time but only 30ms since the last reply.
        assert_eq!(command.status(), ArchonCommandStatus::Running);
        command.process_reply(b"<01pong2");
        assert_eq!(command.wait().await, ArchonCommandStatus::Done);
    }

    #[tokio::test]
    async fn reply_stream_ends_on_terminal_state() {
        let command = Arc::new(ArchonCommand::with_options("ping", 1, None, None, None));
        let background = {
            let command = Arc::clone(&command);
            tokio::spawn(async move {
                command.process_reply(b"<01pong1");
                tokio::time::sleep(Duration::from_millis(5)).await;
                command.process_reply(b"<01pong2");
                tokio::time::sleep(Duration::from_millis(5)).await;
                command.cancel();
            })
        };

        let replies: Vec<_> = command.reply_stream().collect().await;
        background.await.unwrap();

        assert_eq!(replies.len(), 2);
        assert_eq!(replies[0].as_text().unwrap(), "pong1");
        assert_eq!(replies[1].as_text().unwrap(), "pong2");
        assert_eq!(command.status(), ArchonCommandStatus::TimedOut);
    }

    #[test]
    fn terminal_commands_drop_further_replies() {
        let command = ArchonCommand::new("ping", 1);
        command.process_reply(b"<01PONG\n");
        assert_eq!(command.status(), ArchonCommandStatus::Done);
        assert!(command.process_reply(b"<01LATE\n").is_none());
        assert_eq!(command.replies().len(), 1);
    }

    #[test]
    fn terminal_transition_releases_the_id_once() {
        let pool = SharedIdPool::new();
        let id = pool.acquire().unwrap();
        assert_eq!(pool.available(), 255);
        let command = ArchonCommand::with_options("ping", id, Some(1), None, Some(pool.clone()));
        command.process_reply(&format!("<{id:02X}PONG\n").into_bytes());
        assert_eq!(pool.available(), 256);
        command.cancel();
        assert_eq!(pool.available(), 256);
    }
}
