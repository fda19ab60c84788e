// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! A mock Archon that answers commands with canned replies.
//!
//! The reply table maps a command prefix to the replies it triggers.
//! Text replies may contain a `{cid}` placeholder that is substituted
//! with the identifier of the incoming command; binary replies get the
//! same substitution on raw bytes. Commands with no table entry are
//! acknowledged with a bare `<XX` line, except `STATUS` which reports
//! healthy power.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use archon_controller::{ArchonConfig, ArchonController};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub enum CannedReply {
    Text(String),
    Binary(Vec<u8>),
}

pub fn text(reply: &str) -> CannedReply {
    CannedReply::Text(reply.to_string())
}

/// A binary reply of `blocks` chunks, each carrying 1024 bytes of
/// `fill`.
pub fn binary_blocks(blocks: usize, fill: u8) -> CannedReply {
    let mut raw = Vec::with_capacity(blocks * (7 + 1024));
    for _ in 0..blocks {
        raw.extend_from_slice(b"<{cid}:");
        raw.extend_from_slice(&vec![fill; 1024]);
    }
    CannedReply::Binary(raw)
}

type ReplyTable = Vec<(String, Vec<CannedReply>)>;

pub struct MockArchon {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<String>>>,
    accept_task: JoinHandle<()>,
}

impl MockArchon {
    pub async fn start(table: Vec<(&str, Vec<CannedReply>)>) -> Self {
        let table: ReplyTable = table
            .into_iter()
            .map(|(command, replies)| (command.to_string(), replies))
            .collect();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let accept_task = {
            let received = Arc::clone(&received);
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    tokio::spawn(handle_client(
                        stream,
                        table.clone(),
                        Arc::clone(&received),
                    ));
                }
            })
        };

        Self {
            addr,
            received,
            accept_task,
        }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Every command text received so far, without the `>XX` prefix.
    pub fn received(&self) -> Vec<String> {
        self.received.lock().unwrap().clone()
    }

    pub fn received_contains(&self, command: &str) -> bool {
        self.received().iter().any(|entry| entry == command)
    }
}

impl Drop for MockArchon {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn handle_client(stream: TcpStream, table: ReplyTable, received: Arc<Mutex<Vec<String>>>) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let frame = String::from_utf8_lossy(&line);
        let frame = frame.trim();
        if !frame.starts_with('>') || frame.len() < 3 {
            continue;
        }
        let cid = &frame[1..3];
        let command = &frame[3..];
        received.lock().unwrap().push(command.to_string());

        let canned = table
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()));
        match canned {
            Some((_, replies)) => {
                for reply in replies {
                    send_reply(&mut write_half, reply, cid).await;
                }
            }
            None => {
                let default = if command.starts_with("STATUS") {
                    format!("<{cid}POWERGOOD=1 POWER=4\n")
                } else {
                    format!("<{cid}\n")
                };
                let _ = write_half.write_all(default.as_bytes()).await;
            }
        }
    }
}

async fn send_reply(write_half: &mut OwnedWriteHalf, reply: &CannedReply, cid: &str) {
    match reply {
        CannedReply::Text(template) => {
            let message = template.replace("{cid}", cid) + "\n";
            let _ = write_half.write_all(message.as_bytes()).await;
        }
        CannedReply::Binary(template) => {
            let message = replace_bytes(template, b"{cid}", cid.as_bytes());
            let _ = write_half.write_all(&message).await;
        }
    }
}

fn replace_bytes(haystack: &[u8], needle: &[u8], replacement: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(haystack.len());
    let mut position = 0;
    while position < haystack.len() {
        if haystack[position..].starts_with(needle) {
            out.extend_from_slice(replacement);
            position += needle.len();
        } else {
            out.push(haystack[position]);
            position += 1;
        }
    }
    out
}

/// Connects a controller to the mock and resets it so the session
/// starts from IDLE.
pub async fn connect(mock: &MockArchon) -> ArchonController {
    connect_with_config(mock, ArchonConfig::default()).await
}

pub async fn connect_with_config(mock: &MockArchon, config: ArchonConfig) -> ArchonController {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let controller =
        ArchonController::with_config("test_controller", &mock.host(), mock.port(), config);
    controller.start(false).await.unwrap();
    controller.reset().await.unwrap();
    controller
}
