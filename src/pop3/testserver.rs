//-
// Copyright (c) 2025, Briefbox developers
//
// This file is part of Briefbox.
//
// Briefbox is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Briefbox is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along
// with Briefbox. If not, see <http://www.gnu.org/licenses/>.

//! A loopback POP3 server for tests: just enough RFC 1939 to exercise the
//! client, the pool, and the fetch worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};

#[derive(Clone, Default)]
pub(crate) struct MockMailbox {
    pub messages: Vec<(String, String)>,
    /// Reply to PASS with this line instead of `+OK`.
    pub auth_reply: Option<String>,
    /// Never answer this command (simulates a hung server).
    pub stall_on: Option<String>,
}

impl MockMailbox {
    pub fn empty() -> Self {
        MockMailbox::default()
    }

    pub fn with_messages(messages: Vec<(&str, &str)>) -> Self {
        MockMailbox {
            messages: messages
                .into_iter()
                .map(|(uid, raw)| (uid.to_owned(), raw.to_owned()))
                .collect(),
            ..MockMailbox::default()
        }
    }

    pub fn reject_auth(mut self, line: &str) -> Self {
        self.auth_reply = Some(line.to_owned());
        self
    }

    pub fn stall_on(mut self, command: &str) -> Self {
        self.stall_on = Some(command.to_owned());
        self
    }
}

pub(crate) struct MockServer {
    port: u16,
    state: Arc<Mutex<MockMailbox>>,
    connections: Arc<AtomicUsize>,
}

impl MockServer {
    pub async fn spawn(mailbox: MockMailbox) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(mailbox));
        let connections = Arc::new(AtomicUsize::new(0));

        {
            let state = Arc::clone(&state);
            let connections = Arc::clone(&connections);
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        return;
                    };
                    connections.fetch_add(1, Ordering::SeqCst);
                    let state = Arc::clone(&state);
                    tokio::spawn(serve_connection(socket, state));
                }
            });
        }

        MockServer {
            port,
            state,
            connections,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Total connections ever accepted.
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub fn push_message(&self, uid: &str, raw: &str) {
        self.state
            .lock()
            .unwrap()
            .messages
            .push((uid.to_owned(), raw.to_owned()));
    }

    pub fn allow_auth(&self) {
        self.state.lock().unwrap().auth_reply = None;
    }
}

async fn serve_connection(socket: TcpStream, state: Arc<Mutex<MockMailbox>>) {
    let mut io = BufStream::new(socket);
    if send_line(&mut io, "+OK briefbox-mock ready").await.is_err() {
        return;
    }

    let mut line = String::new();
    loop {
        line.clear();
        match io.read_line(&mut line).await {
            Ok(0) | Err(_) => return,
            Ok(_) => (),
        }

        let trimmed = line.trim_end();
        let command = trimmed
            .split_ascii_whitespace()
            .next()
            .unwrap_or("")
            .to_ascii_uppercase();
        let snapshot = state.lock().unwrap().clone();

        if Some(&command) == snapshot.stall_on.as_ref() {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            return;
        }

        let result = match command.as_str() {
            "USER" => send_line(&mut io, "+OK send PASS").await,
            "PASS" => match snapshot.auth_reply {
                Some(ref reply) => send_line(&mut io, reply).await,
                None => send_line(&mut io, "+OK logged in").await,
            },
            "STAT" => {
                let total: usize =
                    snapshot.messages.iter().map(|(_, raw)| raw.len()).sum();
                send_line(
                    &mut io,
                    &format!("+OK {} {}", snapshot.messages.len(), total),
                )
                .await
            },
            "LIST" => {
                let lines = snapshot
                    .messages
                    .iter()
                    .enumerate()
                    .map(|(ix, (_, raw))| format!("{} {}", ix + 1, raw.len()))
                    .collect::<Vec<_>>();
                send_multiline(&mut io, "+OK listing", &lines).await
            },
            "UIDL" => {
                let lines = snapshot
                    .messages
                    .iter()
                    .enumerate()
                    .map(|(ix, (uid, _))| format!("{} {}", ix + 1, uid))
                    .collect::<Vec<_>>();
                send_multiline(&mut io, "+OK uid listing", &lines).await
            },
            "RETR" => {
                let num = trimmed
                    .split_ascii_whitespace()
                    .nth(1)
                    .and_then(|n| n.parse::<usize>().ok());
                match num
                    .and_then(|n| n.checked_sub(1))
                    .and_then(|ix| snapshot.messages.get(ix))
                {
                    Some((_, raw)) => send_body(&mut io, raw).await,
                    None => {
                        send_line(&mut io, "-ERR no such message").await
                    },
                }
            },
            "DELE" | "RSET" | "NOOP" => send_line(&mut io, "+OK").await,
            "QUIT" => {
                let _ = send_line(&mut io, "+OK bye").await;
                return;
            },
            _ => send_line(&mut io, "-ERR unknown command").await,
        };

        if result.is_err() {
            return;
        }
    }
}

async fn send_line(
    io: &mut BufStream<TcpStream>,
    line: &str,
) -> std::io::Result<()> {
    io.write_all(line.as_bytes()).await?;
    io.write_all(b"\r\n").await?;
    io.flush().await
}

async fn send_multiline(
    io: &mut BufStream<TcpStream>,
    status: &str,
    lines: &[String],
) -> std::io::Result<()> {
    io.write_all(status.as_bytes()).await?;
    io.write_all(b"\r\n").await?;
    for line in lines {
        io.write_all(line.as_bytes()).await?;
        io.write_all(b"\r\n").await?;
    }
    io.write_all(b".\r\n").await?;
    io.flush().await
}

/// Sends a raw message as a RETR body, applying dot-stuffing.
async fn send_body(
    io: &mut BufStream<TcpStream>,
    raw: &str,
) -> std::io::Result<()> {
    io.write_all(b"+OK message follows\r\n").await?;

    let mut stuffed = raw.replace("\r\n.", "\r\n..");
    if stuffed.starts_with('.') {
        stuffed.insert(0, '.');
    }
    io.write_all(stuffed.as_bytes()).await?;
    if !stuffed.ends_with("\r\n") {
        io.write_all(b"\r\n").await?;
    }
    io.write_all(b".\r\n").await?;
    io.flush().await
}
