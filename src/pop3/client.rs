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

//! Line-oriented RFC 1939 client.
//!
//! One connection is one state machine: DISCONNECTED → CONNECTED (greeting
//! seen) → TRANSACTION (USER/PASS accepted), with terminal transitions on
//! QUIT or any fatal error. The client never pipelines; each command is
//! written, then exactly one response (single- or multi-line) is awaited.
//! Multi-line bodies are terminated by `CRLF . CRLF` and dot-stuffed lines
//! are un-stuffed here, so callers see the raw message bytes.
//!
//! Every command is bounded by the command timeout; expiry poisons the
//! connection and surfaces a timeout error. Retrying is the pool's job, not
//! ours.

// The full RFC 1939 transaction command set is implemented; the fetch
// worker only needs a subset of it.
#![allow(dead_code)]

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite,
    AsyncWriteExt, BufStream, ReadBuf,
};
use tokio::net::TcpStream;

use crate::support::error::{Error, Pop3Error, Pop3ErrorKind};

/// Longest status/listing line we accept from a server.
const MAX_RESPONSE_LINE: usize = 4096;

/// One `UIDL` listing entry, in server order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UidlEntry {
    pub num: u32,
    pub uid: String,
}

/// One `LIST` listing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListEntry {
    pub num: u32,
    pub size: u64,
}

/// The `STAT` summary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatResponse {
    pub count: u32,
    pub size: u64,
}

/// Plain TCP or implicit TLS, behind one async stream type.
///
/// Mail providers routinely present self-signed certificates, so
/// certificate and host-name validation are disabled on the TLS path.
pub enum Pop3Stream {
    Plain(TcpStream),
    Tls(Box<tokio_native_tls::TlsStream<TcpStream>>),
}

impl AsyncRead for Pop3Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Pop3Stream::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Pop3Stream::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Pop3Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Pop3Stream::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Pop3Stream::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Pop3Stream::Plain(s) => Pin::new(s).poll_flush(cx),
            Pop3Stream::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Pop3Stream::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Pop3Stream::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Connected,
    Transaction,
    Dead,
}

pub struct Pop3Client {
    io: BufStream<Pop3Stream>,
    command_timeout: Duration,
    state: State,
}

impl Pop3Client {
    /// Opens a connection and consumes the greeting.
    ///
    /// Establishment (TCP connect plus TLS handshake plus greeting) is
    /// bounded by `connect_timeout` as a whole; afterwards each command is
    /// bounded by `command_timeout`.
    pub async fn connect(
        host: &str,
        port: u16,
        tls: bool,
        connect_timeout: Duration,
        command_timeout: Duration,
    ) -> Result<Self, Error> {
        let connect = async {
            let tcp = TcpStream::connect((host, port)).await.map_err(|e| {
                Pop3Error::new(
                    "CONNECT",
                    Pop3ErrorKind::Transport(e.to_string()),
                )
            })?;

            let stream = if tls {
                let connector = native_tls::TlsConnector::builder()
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true)
                    .build()?;
                let connector = tokio_native_tls::TlsConnector::from(connector);
                let tls_stream =
                    connector.connect(host, tcp).await.map_err(|e| {
                        Pop3Error::new(
                            "CONNECT",
                            Pop3ErrorKind::Transport(e.to_string()),
                        )
                    })?;
                Pop3Stream::Tls(Box::new(tls_stream))
            } else {
                Pop3Stream::Plain(tcp)
            };

            let mut client = Pop3Client {
                io: BufStream::new(stream),
                command_timeout,
                state: State::Connected,
            };

            let greeting = client.read_response_line("GREETING").await?;
            if !greeting.starts_with("+OK") {
                return Err(Error::Pop3(Pop3Error::new(
                    "GREETING",
                    Pop3ErrorKind::Protocol(greeting),
                )));
            }

            Ok(client)
        };

        match tokio::time::timeout(connect_timeout, connect).await {
            Ok(result) => result,
            Err(_elapsed) => Err(Error::Pop3(Pop3Error::new(
                "CONNECT",
                Pop3ErrorKind::Timeout,
            ))),
        }
    }

    /// `USER` then `PASS`. Any non-`+OK` is an authentication failure.
    pub async fn login(
        &mut self,
        username: &str,
        password: &str,
    ) -> Result<(), Error> {
        self.require_state(State::Connected, "USER")?;

        for (command, line) in [
            ("USER", format!("USER {}", username)),
            ("PASS", format!("PASS {}", password)),
        ] {
            match self.single_line(command, &line).await {
                Ok(_) => (),
                Err(Error::Pop3(Pop3Error {
                    command,
                    kind: Pop3ErrorKind::Protocol(status),
                })) => {
                    return Err(Error::Pop3(Pop3Error::new(
                        command,
                        Pop3ErrorKind::Authentication(status),
                    )));
                },
                Err(e) => return Err(e),
            }
        }

        self.state = State::Transaction;
        Ok(())
    }

    pub async fn stat(&mut self) -> Result<StatResponse, Error> {
        self.require_state(State::Transaction, "STAT")?;
        let status = self.single_line("STAT", "STAT").await?;

        let mut fields = status.split_ascii_whitespace();
        let (Some(count), Some(size)) = (
            fields.next().and_then(|f| f.parse().ok()),
            fields.next().and_then(|f| f.parse().ok()),
        ) else {
            return Err(self.poison(Pop3Error::new(
                "STAT",
                Pop3ErrorKind::Protocol(format!("unparseable reply: {status}")),
            )));
        };

        Ok(StatResponse { count, size })
    }

    pub async fn list(&mut self) -> Result<Vec<ListEntry>, Error> {
        self.require_state(State::Transaction, "LIST")?;
        let body = self.multi_line("LIST", "LIST").await?;
        parse_listing(&body, "LIST", |num, rest| {
            rest.parse().ok().map(|size| ListEntry { num, size })
        })
        .map_err(Error::Pop3)
    }

    /// `UIDL`: the UID is the entire remainder of the line after the first
    /// space, trusted as an opaque token.
    pub async fn uidl(&mut self) -> Result<Vec<UidlEntry>, Error> {
        self.require_state(State::Transaction, "UIDL")?;
        let body = self.multi_line("UIDL", "UIDL").await?;
        parse_listing(&body, "UIDL", |num, rest| {
            Some(UidlEntry {
                num,
                uid: rest.to_owned(),
            })
        })
        .map_err(Error::Pop3)
    }

    /// `RETR n`: the exact raw RFC 5322 message, headers and body.
    pub async fn retr(&mut self, num: u32) -> Result<Vec<u8>, Error> {
        self.require_state(State::Transaction, "RETR")?;
        self.multi_line("RETR", &format!("RETR {}", num)).await
    }

    pub async fn dele(&mut self, num: u32) -> Result<(), Error> {
        self.require_state(State::Transaction, "DELE")?;
        self.single_line("DELE", &format!("DELE {}", num)).await?;
        Ok(())
    }

    pub async fn rset(&mut self) -> Result<(), Error> {
        self.require_state(State::Transaction, "RSET")?;
        self.single_line("RSET", "RSET").await?;
        Ok(())
    }

    pub async fn noop(&mut self) -> Result<(), Error> {
        self.require_state(State::Transaction, "NOOP")?;
        self.single_line("NOOP", "NOOP").await?;
        Ok(())
    }

    /// `QUIT` and shut the stream down. The client is unusable afterwards.
    pub async fn quit(&mut self) -> Result<(), Error> {
        if State::Dead == self.state {
            return Ok(());
        }

        let result = self.single_line("QUIT", "QUIT").await;
        self.state = State::Dead;
        let _ = self.io.get_mut().shutdown().await;
        result.map(|_| ())
    }

    fn require_state(
        &self,
        expected: State,
        command: &'static str,
    ) -> Result<(), Error> {
        if expected == self.state {
            Ok(())
        } else {
            Err(Error::Pop3(Pop3Error::new(
                command,
                Pop3ErrorKind::Protocol(format!(
                    "command not valid in {:?} state",
                    self.state
                )),
            )))
        }
    }

    /// Runs a single-line command: one write, one status line back.
    /// Returns the text after `+OK`.
    async fn single_line(
        &mut self,
        command: &'static str,
        line: &str,
    ) -> Result<String, Error> {
        let deadline = self.command_timeout;
        let exchange = async {
            self.write_line(command, line).await?;
            self.read_response_line(command).await
        };

        let status = match tokio::time::timeout(deadline, exchange).await {
            Ok(Ok(status)) => status,
            // Transport failures leave the connection in an unknown state.
            Ok(Err(e)) => {
                self.state = State::Dead;
                return Err(e);
            },
            Err(_elapsed) => {
                return Err(
                    self.poison(Pop3Error::new(command, Pop3ErrorKind::Timeout))
                )
            },
        };

        match status.strip_prefix("+OK") {
            Some(rest) => Ok(rest.trim_start().to_owned()),
            // `-ERR` is recoverable; the session stays usable.
            None => Err(Error::Pop3(Pop3Error::new(
                command,
                Pop3ErrorKind::Protocol(status),
            ))),
        }
    }

    /// Runs a multi-line command: status line, then dot-terminated body
    /// with un-stuffing applied.
    async fn multi_line(
        &mut self,
        command: &'static str,
        line: &str,
    ) -> Result<Vec<u8>, Error> {
        let deadline = self.command_timeout;
        let exchange = async {
            self.write_line(command, line).await?;

            let status = self.read_response_line(command).await?;
            if !status.starts_with("+OK") {
                // `-ERR` before the body: recoverable, nothing to drain.
                return Ok(Err(status));
            }

            let mut body = Vec::new();
            read_body_unstuffed(&mut self.io, &mut body)
                .await
                .map_err(|e| {
                    Error::Pop3(Pop3Error::new(
                        command,
                        Pop3ErrorKind::Transport(e.to_string()),
                    ))
                })?;
            Ok(Ok(body))
        };

        match tokio::time::timeout(deadline, exchange).await {
            Ok(Ok(Ok(body))) => Ok(body),
            Ok(Ok(Err(status))) => Err(Error::Pop3(Pop3Error::new(
                command,
                Pop3ErrorKind::Protocol(status),
            ))),
            Ok(Err(e)) => {
                self.state = State::Dead;
                Err(e)
            },
            Err(_elapsed) => {
                Err(self.poison(Pop3Error::new(command, Pop3ErrorKind::Timeout)))
            },
        }
    }

    async fn write_line(
        &mut self,
        command: &'static str,
        line: &str,
    ) -> Result<(), Error> {
        let io_result = async {
            self.io.write_all(line.as_bytes()).await?;
            self.io.write_all(b"\r\n").await?;
            self.io.flush().await
        }
        .await;

        io_result.map_err(|e| {
            Error::Pop3(Pop3Error::new(
                command,
                Pop3ErrorKind::Transport(e.to_string()),
            ))
        })
    }

    async fn read_response_line(
        &mut self,
        command: &'static str,
    ) -> Result<String, Error> {
        let mut buffer = Vec::new();
        let nread = (&mut self.io)
            .take(MAX_RESPONSE_LINE as u64)
            .read_until(b'\n', &mut buffer)
            .await
            .map_err(|e| {
                Pop3Error::new(command, Pop3ErrorKind::Transport(e.to_string()))
            })?;

        if 0 == nread || !buffer.ends_with(b"\n") {
            return Err(Error::Pop3(Pop3Error::new(
                command,
                Pop3ErrorKind::Transport(
                    "connection closed before reply".to_owned(),
                ),
            )));
        }

        while buffer.ends_with(b"\n") || buffer.ends_with(b"\r") {
            buffer.pop();
        }

        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }

    fn poison(&mut self, e: Pop3Error) -> Error {
        self.state = State::Dead;
        Error::Pop3(e)
    }
}

/// Reads a dot-terminated multi-line body into `dst`, removing the
/// dot-stuffing.
///
/// A line of exactly `.` ends the body and is not part of it; a body line
/// beginning with `..` loses its first dot. CRLF handling is strict so
/// binary-ish payloads survive: a lone `\n` inside a line is content.
async fn read_body_unstuffed(
    src: &mut (impl AsyncBufRead + Unpin),
    dst: &mut Vec<u8>,
) -> std::io::Result<()> {
    let mut start_of_line = true;
    let mut has_trailing_cr = false;
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        src.read_until(b'\n', &mut buffer).await?;

        if buffer.is_empty() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "EOF inside multi-line response",
            ));
        }

        if b".\r\n" == &buffer[..] && start_of_line {
            break;
        }

        if b'.' == buffer[0] && start_of_line {
            dst.extend_from_slice(&buffer[1..]);
        } else {
            dst.extend_from_slice(&buffer);
        }

        start_of_line = buffer.ends_with(b"\r\n")
            || (b"\n" == &buffer[..] && has_trailing_cr);
        has_trailing_cr = buffer.ends_with(b"\r");
    }

    Ok(())
}

fn parse_listing<T>(
    body: &[u8],
    command: &'static str,
    mut parse: impl FnMut(u32, &str) -> Option<T>,
) -> Result<Vec<T>, Pop3Error> {
    let text = String::from_utf8_lossy(body);
    let mut entries = Vec::new();

    for line in text.lines().filter(|l| !l.is_empty()) {
        let (num, rest) = match line.split_once(' ') {
            Some((num, rest)) => (num, rest),
            None => (line, ""),
        };

        let entry = num
            .parse::<u32>()
            .ok()
            .and_then(|num| parse(num, rest))
            .ok_or_else(|| {
                Pop3Error::new(
                    command,
                    Pop3ErrorKind::Protocol(format!(
                        "unparseable listing line: {line}"
                    )),
                )
            })?;
        entries.push(entry);
    }

    Ok(entries)
}

#[cfg(test)]
mod test {
    use super::super::testserver::{MockMailbox, MockServer};
    use super::*;

    const CONNECT: Duration = Duration::from_secs(5);
    const COMMAND: Duration = Duration::from_secs(5);

    fn rt() -> tokio::runtime::Runtime {
        crate::init_test_log();
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap()
    }

    async fn connected_client(server: &MockServer) -> Pop3Client {
        let mut client = Pop3Client::connect(
            "127.0.0.1",
            server.port(),
            false,
            CONNECT,
            COMMAND,
        )
        .await
        .unwrap();
        client.login("alice", "hunter2").await.unwrap();
        client
    }

    #[test]
    fn login_stat_uidl_retr_quit() {
        rt().block_on(async {
            let server = MockServer::spawn(MockMailbox::with_messages(vec![
                ("u1", "Subject: one\r\n\r\nbody one\r\n"),
                ("u2", "Subject: two\r\n\r\nbody two\r\n"),
            ]))
            .await;

            let mut client = connected_client(&server).await;

            let stat = client.stat().await.unwrap();
            assert_eq!(2, stat.count);

            let uidl = client.uidl().await.unwrap();
            assert_eq!(
                vec![
                    UidlEntry { num: 1, uid: "u1".to_owned() },
                    UidlEntry { num: 2, uid: "u2".to_owned() },
                ],
                uidl
            );

            let list = client.list().await.unwrap();
            assert_eq!(2, list.len());
            assert_eq!(1, list[0].num);

            let raw = client.retr(2).await.unwrap();
            assert_eq!(b"Subject: two\r\n\r\nbody two\r\n".to_vec(), raw);

            client.noop().await.unwrap();
            client.rset().await.unwrap();
            client.quit().await.unwrap();
        });
    }

    #[test]
    fn bad_password_is_an_authentication_error() {
        rt().block_on(async {
            let server = MockServer::spawn(
                MockMailbox::empty().reject_auth("-ERR invalid password"),
            )
            .await;

            let mut client = Pop3Client::connect(
                "127.0.0.1",
                server.port(),
                false,
                CONNECT,
                COMMAND,
            )
            .await
            .unwrap();

            match client.login("alice", "wrong").await {
                Err(Error::Pop3(Pop3Error {
                    kind: Pop3ErrorKind::Authentication(status),
                    ..
                })) => assert!(status.contains("invalid password")),
                other => panic!("unexpected result: {:?}", other.err()),
            }
        });
    }

    #[test]
    fn dot_stuffed_body_is_unstuffed() {
        rt().block_on(async {
            let raw = "Subject: dots\r\n\r\n.leading dot\r\n..two dots\r\n";
            let server = MockServer::spawn(MockMailbox::with_messages(vec![(
                "u1", raw,
            )]))
            .await;

            let mut client = connected_client(&server).await;
            let body = client.retr(1).await.unwrap();
            assert_eq!(raw.as_bytes().to_vec(), body);
        });
    }

    #[test]
    fn err_reply_is_a_protocol_error() {
        rt().block_on(async {
            let server = MockServer::spawn(MockMailbox::empty()).await;
            let mut client = connected_client(&server).await;

            match client.retr(42).await {
                Err(Error::Pop3(Pop3Error {
                    command: "RETR",
                    kind: Pop3ErrorKind::Protocol(status),
                })) => assert!(status.starts_with("-ERR")),
                other => panic!("unexpected result: {:?}", other.err()),
            }
        });
    }

    #[test]
    fn commands_require_authentication() {
        rt().block_on(async {
            let server = MockServer::spawn(MockMailbox::empty()).await;
            let mut client = Pop3Client::connect(
                "127.0.0.1",
                server.port(),
                false,
                CONNECT,
                COMMAND,
            )
            .await
            .unwrap();

            assert_matches!(Err(Error::Pop3(..)), client.uidl().await);
        });
    }

    #[test]
    fn command_timeout_poisons_the_connection() {
        rt().block_on(async {
            let server =
                MockServer::spawn(MockMailbox::empty().stall_on("STAT")).await;
            let mut client = Pop3Client::connect(
                "127.0.0.1",
                server.port(),
                false,
                CONNECT,
                COMMAND,
            )
            .await
            .unwrap();
            client.login("alice", "hunter2").await.unwrap();
            client.command_timeout = Duration::from_millis(100);

            assert_matches!(
                Err(Error::Pop3(Pop3Error {
                    command: "STAT",
                    kind: Pop3ErrorKind::Timeout,
                })),
                client.stat().await
            );

            // Dead after the timeout; further commands fail locally.
            assert_matches!(Err(Error::Pop3(..)), client.noop().await);
        });
    }

    proptest::proptest! {
        #[test]
        fn unstuffing_round_trips(
            content in "[x.\r\n]{0,100}\r\n",
        ) {
            let mut stuffed = content.replace("\r\n.", "\r\n..");
            if stuffed.starts_with('.') {
                stuffed.insert(0, '.');
            }
            stuffed.push_str(".\r\n");

            let mut decoded = Vec::new();
            let mut reader = tokio::io::BufReader::new(stuffed.as_bytes());
            futures::executor::block_on(read_body_unstuffed(
                &mut reader,
                &mut decoded,
            ))
            .unwrap();
            proptest::prop_assert_eq!(content.as_bytes(), &decoded[..]);
        }
    }
}
