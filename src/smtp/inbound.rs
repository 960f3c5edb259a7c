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

//! The inbound SMTP receiver for locally-hosted domains.
//!
//! This is deliberately a minimal RFC 5321 server: it sits behind a trusted
//! network boundary (or a real MTA), refuses AUTH and STARTTLS, and accepts
//! MAIL FROM permissively. The gate is RCPT TO: the recipient's domain must
//! be an active local domain, and an active inbox must exist under that
//! address. Accepted messages go through the normal MIME normalization and
//! land in the same store the POP3 pipeline writes to, under a
//! `smtp-<uuid>` UID.
//!
//! Each connection is independent; deliveries are best-effort per
//! recipient and the transaction succeeds if at least one recipient took
//! the message.

use std::io;
use std::str;
use std::sync::Arc;
use std::time::Duration;

use chrono::prelude::*;
use log::{info, warn};
use tokio::io::{
    AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufStream,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;

use super::codes::*;
use super::syntax::*;
use crate::mime;
use crate::store::domain_cache::DomainCache;
use crate::store::maildb::MailDb;
use crate::store::types::Inbox;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::SmtpConfig;

const MAX_LINE: usize = 1024;
const MAX_RECIPIENTS: usize = 50;
/// A connection that says nothing for this long is dropped.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_SESSIONS: usize = 256;

static EXTENSIONS: &[&str] = &[
    "8BITMIME",
    "ENHANCEDSTATUSCODES",
    "PIPELINING",
    "SMTPUTF8",
    "HELP", // The final item must be unconditional
];

/// Accept loop. Runs until the listener is closed or the task is aborted.
pub async fn serve(
    listener: TcpListener,
    config: SmtpConfig,
    db: MailDb,
    domains: Arc<DomainCache>,
    max_attachment_bytes: usize,
) {
    let config = Arc::new(config);
    let sessions = Arc::new(Semaphore::new(MAX_SESSIONS));

    loop {
        let Ok(permit) = Arc::clone(&sessions).acquire_owned().await else {
            return;
        };

        match listener.accept().await {
            Ok((socket, peer)) => {
                let config = Arc::clone(&config);
                let db = db.clone();
                let domains = Arc::clone(&domains);
                tokio::spawn(async move {
                    let _permit = permit;
                    let log_prefix =
                        LogPrefix::new(format!("smtp:{}", peer));
                    info!("{} Connection established", log_prefix);

                    let mut server = Server::new(
                        socket,
                        config,
                        db,
                        domains,
                        log_prefix.clone(),
                        peer.ip().to_string(),
                        max_attachment_bytes,
                    );
                    match server.run().await {
                        Ok(()) => info!(
                            "{} Normal client disconnect",
                            log_prefix
                        ),
                        Err(e) => warn!(
                            "{} Abnormal client disconnect: {}",
                            log_prefix, e
                        ),
                    }
                });
            },
            Err(e) => {
                warn!("SMTP accept failed: {}", e);
            },
        }
    }
}

macro_rules! require {
    ($this:expr, $($fns:ident = $arg:expr),*) => {
        $(if let Some(r) = $this.$fns($arg).await { return r; })*
    };
}

struct Server {
    io: BufStream<TcpStream>,
    config: Arc<SmtpConfig>,
    db: MailDb,
    domains: Arc<DomainCache>,
    log_prefix: LogPrefix,

    host_name: String,
    peer_ip: String,
    max_attachment_bytes: usize,

    helo_host: Option<String>,
    return_path: Option<String>,
    recipients: Vec<RcptInbox>,
    quit: bool,
}

struct RcptInbox {
    email_lower: String,
    inbox: Inbox,
}

impl Server {
    fn new(
        socket: TcpStream,
        config: Arc<SmtpConfig>,
        db: MailDb,
        domains: Arc<DomainCache>,
        log_prefix: LogPrefix,
        peer_ip: String,
        max_attachment_bytes: usize,
    ) -> Self {
        let host_name = if config.host_name.is_empty() {
            "localhost".to_owned()
        } else {
            config.host_name.clone()
        };

        Server {
            io: BufStream::new(socket),
            config,
            db,
            domains,
            log_prefix,
            host_name,
            peer_ip,
            max_attachment_bytes,
            helo_host: None,
            return_path: None,
            recipients: Vec::new(),
            quit: false,
        }
    }

    async fn run(&mut self) -> Result<(), Error> {
        self.send_greeting().await?;

        let mut buffer = Vec::new();
        while !self.quit {
            self.run_command(&mut buffer).await?;
        }

        Ok(())
    }

    async fn run_command(&mut self, buffer: &mut Vec<u8>) -> Result<(), Error> {
        buffer.clear();

        let mut limited = (&mut self.io).take(MAX_LINE as u64);
        let read = limited.read_until(b'\n', buffer);
        match tokio::time::timeout(IDLE_TIMEOUT, read).await {
            Ok(result) => {
                result?;
            },
            Err(_elapsed) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "Connection idle timer expired",
                )))
            },
        }

        if buffer.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached at start of command",
            )));
        }

        if !buffer.ends_with(b"\n") {
            if buffer.len() >= MAX_LINE {
                self.reply(
                    pc::CommandSyntaxError,
                    Some((cc::PermFail, sc::OtherProtocolStatus)),
                    "Command line too long",
                )
                .await?;

                // Skip the rest of the line
                while !buffer.is_empty() && !buffer.ends_with(b"\n") {
                    buffer.clear();
                    (&mut self.io)
                        .take(MAX_LINE as u64)
                        .read_until(b'\n', buffer)
                        .await?;
                }

                return Ok(());
            } else {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "EOF reached within command",
                )));
            }
        }

        let line_ending_len = if buffer.ends_with(b"\r\n") { 2 } else { 1 };
        let command_line = &buffer[..buffer.len() - line_ending_len];
        let command_line = match str::from_utf8(command_line) {
            Ok(s) => s,
            Err(_) => {
                self.reply(
                    pc::CommandSyntaxError,
                    Some((cc::PermFail, sc::OtherProtocolStatus)),
                    "Malformed UTF-8",
                )
                .await?;
                return Ok(());
            },
        };

        let command = match command_line.parse::<Command>() {
            Ok(c) => c,
            Err(_) => {
                if looks_like_known_command(command_line) {
                    self.reply(
                        pc::ParameterSyntaxError,
                        Some((cc::PermFail, sc::InvalidCommandArguments)),
                        "Unknown command syntax",
                    )
                    .await?;
                } else {
                    self.reply(
                        pc::CommandSyntaxError,
                        Some((cc::PermFail, sc::InvalidCommand)),
                        "Unrecognised command",
                    )
                    .await?;
                }

                return Ok(());
            },
        };

        match command {
            Command::Helo(command, origin) => {
                self.cmd_helo(command, origin).await
            },
            Command::Auth => self.cmd_auth().await,
            Command::MailFrom(email, size) => {
                self.cmd_mail_from(email, size).await
            },
            Command::Recipient(email) => self.cmd_recipient(email).await,
            Command::Data => self.cmd_data().await,
            Command::Reset => self.cmd_reset().await,
            Command::Verify => self.cmd_verify().await,
            Command::Help => self.cmd_help().await,
            Command::Noop => self.cmd_noop().await,
            Command::Quit => self.cmd_quit().await,
            Command::StartTls => self.cmd_start_tls().await,
        }
    }

    async fn cmd_helo(
        &mut self,
        command: String,
        origin: String,
    ) -> Result<(), Error> {
        require!(self, need_helo = false);

        let extended = !"HELO".eq_ignore_ascii_case(&command);
        info!("{} SMTP {} from {}", self.log_prefix, command, origin);

        let greeting =
            format!("{} salutations, {}", self.host_name, origin);
        self.helo_host = Some(origin);

        if !extended {
            return self.reply(pc::Ok, None, &greeting).await;
        }

        // EHLO: greeting, SIZE, then the static extension list; only the
        // closing line ends the reply.
        self.reply_more(pc::Ok, None, &greeting).await?;
        self.reply_more(
            pc::Ok,
            None,
            &format!("SIZE {}", self.config.max_message_size),
        )
        .await?;
        for (ix, &ext) in EXTENSIONS.iter().enumerate() {
            if ix + 1 == EXTENSIONS.len() {
                self.reply(pc::Ok, None, ext).await?;
            } else {
                self.reply_more(pc::Ok, None, ext).await?;
            }
        }

        Ok(())
    }

    async fn cmd_auth(&mut self) -> Result<(), Error> {
        self.reply(
            pc::CommandNotImplemented,
            Some((cc::PermFail, sc::SecurityFeaturesNotSupported)),
            "AUTH is not available here",
        )
        .await
    }

    async fn cmd_start_tls(&mut self) -> Result<(), Error> {
        self.reply(
            pc::CommandNotImplemented,
            Some((cc::PermFail, sc::SecurityFeaturesNotSupported)),
            "STARTTLS is not available here",
        )
        .await
    }

    async fn cmd_mail_from(
        &mut self,
        return_path: String,
        approx_size: Option<u64>,
    ) -> Result<(), Error> {
        require!(self, need_helo = true, need_return_path = false);

        if approx_size.unwrap_or(0) > self.config.max_message_size {
            return self.reply(
                pc::ExceededStorageAllocation,
                Some((cc::PermFail, sc::MessageLengthExceedsLimit)),
                &format!(
                    "Maximum message size is {} bytes",
                    self.config.max_message_size
                ),
            )
            .await;
        }

        // MAIL FROM is accepted permissively; the gate is RCPT TO.
        self.return_path = Some(return_path);
        self.reply(pc::Ok, Some((cc::Success, sc::Undefined)), "OK")
            .await
    }

    async fn cmd_recipient(
        &mut self,
        forward_path: String,
    ) -> Result<(), Error> {
        require!(self, need_helo = true, need_return_path = true);

        if self.recipients.len() >= MAX_RECIPIENTS {
            return self.reply(
                pc::InsufficientStorage,
                Some((cc::PermFail, sc::TooManyRecipients)),
                "Too many recipients",
            )
            .await;
        }

        let Some((_, domain)) = forward_path.rsplit_once('@') else {
            return self.reply(
                pc::ActionNotTakenPermanent,
                Some((cc::PermFail, sc::BadDestinationMailboxAddressSyntax)),
                "no such user - specifying the domain is mandatory",
            )
            .await;
        };

        if !self.domains.contains(domain) {
            return self.reply(
                pc::UserNotLocal,
                Some((cc::PermFail, sc::DeliveryNotAuthorised)),
                "Relay access denied",
            )
            .await;
        }

        let inbox = match self.db.find_active_inbox_by_email(&forward_path) {
            Ok(Some(inbox)) => inbox,
            Ok(None) => {
                return self.reply(
                    pc::ActionNotTakenPermanent,
                    Some((cc::PermFail, sc::BadDestinationMailboxAddress)),
                    "Unknown recipient",
                )
                .await;
            },
            Err(e) => {
                warn!(
                    "{} RCPT lookup for {} failed: {}",
                    self.log_prefix, forward_path, e
                );
                return self.reply(
                    pc::ActionNotTakenTemporary,
                    Some((cc::TempFail, sc::OtherMailSystem)),
                    "Recipient lookup failed",
                )
                .await;
            },
        };

        let email_lower = forward_path.to_lowercase();
        if !self
            .recipients
            .iter()
            .any(|r| r.email_lower == email_lower)
        {
            self.log_prefix.set_inbox(inbox.email.clone());
            self.recipients.push(RcptInbox { email_lower, inbox });
        }

        self.reply(
            pc::Ok,
            Some((cc::Success, sc::DestinationAddressValid)),
            "OK",
        )
        .await
    }

    async fn cmd_data(&mut self) -> Result<(), Error> {
        require!(
            self,
            need_helo = true,
            need_return_path = true,
            need_recipients = true
        );

        self.reply(pc::StartMailInput, None, "Go ahead")
            .await?;

        let max = self.config.max_message_size;
        let mut data = Vec::new();
        let oversize = read_data_unstuffed(&mut self.io, &mut data, max)
            .await?;

        if oversize {
            self.reset();
            return self.reply(
                pc::ExceededStorageAllocation,
                Some((cc::PermFail, sc::MessageLengthExceedsLimit)),
                &format!("Maximum message size is {} bytes", max),
            )
            .await;
        }

        self.deliver(data).await
    }

    async fn deliver(&mut self, data: Vec<u8>) -> Result<(), Error> {
        let received_header = format!(
            "Received: from {} ({})\r\n\
             \tby {} ({} {}) via SMTP;\r\n\
             \t{}\r\n",
            self.helo_host.as_deref().unwrap_or("unknown"),
            self.peer_ip,
            self.host_name,
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            Utc::now().to_rfc2822(),
        );

        let mut full = Vec::with_capacity(received_header.len() + data.len());
        full.extend_from_slice(received_header.as_bytes());
        full.extend_from_slice(&data);

        let uid = format!("smtp-{}", uuid::Uuid::new_v4());
        let record =
            mime::normalize(&full, &uid, self.max_attachment_bytes);

        let mut delivered = 0usize;
        for recipient in &self.recipients {
            match self.db.insert_messages(
                recipient.inbox.id,
                std::slice::from_ref(&record),
            ) {
                Ok(_) => {
                    delivered += 1;
                    info!(
                        "{} Delivered {} bytes to {}",
                        self.log_prefix,
                        full.len(),
                        recipient.inbox.email
                    );
                },
                Err(e) => {
                    warn!(
                        "{} Delivery to {} failed: {}",
                        self.log_prefix, recipient.inbox.email, e
                    );
                },
            }
        }

        self.reset();

        if delivered > 0 {
            self.reply(pc::Ok, Some((cc::Success, sc::Undefined)), "OK")
                .await
        } else {
            self.reply(
                pc::ActionAborted,
                Some((cc::TempFail, sc::OtherMailSystem)),
                "Delivery failed for all recipients",
            )
            .await
        }
    }

    async fn cmd_reset(&mut self) -> Result<(), Error> {
        self.reset();
        self.reply(pc::Ok, Some((cc::Success, sc::Undefined)), "OK")
            .await
    }

    async fn cmd_verify(&mut self) -> Result<(), Error> {
        self.reply(
            pc::CannotVerify,
            Some((cc::Success, sc::OtherSecurity)),
            "VRFY not supported",
        )
        .await
    }

    async fn cmd_help(&mut self) -> Result<(), Error> {
        self.reply_more(
            pc::HelpMessage,
            Some((cc::Success, sc::Undefined)),
            "This is the Briefbox inbound SMTP receiver.",
        )
        .await?;
        self.reply(
            pc::HelpMessage,
            Some((cc::Success, sc::Undefined)),
            "End of HELP",
        )
        .await
    }

    async fn cmd_noop(&mut self) -> Result<(), Error> {
        self.reply(pc::Ok, Some((cc::Success, sc::Undefined)), "OK")
            .await
    }

    async fn cmd_quit(&mut self) -> Result<(), Error> {
        self.quit = true;
        let _ = self
            .reply(
                pc::ServiceClosing,
                Some((cc::Success, sc::Undefined)),
                "Bye",
            )
            .await;
        Ok(())
    }

    async fn need_helo(&mut self, present: bool) -> Option<Result<(), Error>> {
        self.check_need(
            self.helo_host.is_some(),
            present,
            "Already got HELO",
            "Still waiting for HELO",
        )
        .await
    }

    async fn need_return_path(
        &mut self,
        present: bool,
    ) -> Option<Result<(), Error>> {
        self.check_need(
            self.return_path.is_some(),
            present,
            "Already got MAIL FROM",
            "Still waiting for MAIL FROM",
        )
        .await
    }

    async fn need_recipients(
        &mut self,
        present: bool,
    ) -> Option<Result<(), Error>> {
        self.check_need(
            !self.recipients.is_empty(),
            present,
            "Already have recipients",
            "No valid recipients",
        )
        .await
    }

    async fn check_need(
        &mut self,
        current_status: bool,
        desired_status: bool,
        message_if_already_present: &str,
        message_if_missing: &str,
    ) -> Option<Result<(), Error>> {
        if current_status == desired_status {
            return None;
        }

        let message = if current_status {
            message_if_already_present
        } else {
            message_if_missing
        };
        Some(
            self.reply(
                pc::BadSequenceOfCommands,
                Some((cc::PermFail, sc::InvalidCommand)),
                message,
            )
            .await,
        )
    }

    fn reset(&mut self) {
        self.return_path = None;
        self.recipients.clear();
    }

    async fn send_greeting(&mut self) -> Result<(), Error> {
        self.reply(
            pc::ServiceReady,
            None,
            &format!(
                "{} {} {} ESMTP ready",
                self.host_name,
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            ),
        )
        .await
    }

    /// Writes a `<code>-` continuation line of a multi-line reply. The
    /// line sits in the output buffer until the closing line flushes the
    /// whole reply at once.
    async fn reply_more(
        &mut self,
        code: PrimaryCode,
        status: Option<(ClassCode, SubjectCode)>,
        text: &str,
    ) -> Result<(), Error> {
        self.write_reply_line(code, '-', status, text).await
    }

    /// Writes the only (or last) line of a reply and flushes it to the
    /// peer.
    async fn reply(
        &mut self,
        code: PrimaryCode,
        status: Option<(ClassCode, SubjectCode)>,
        text: &str,
    ) -> Result<(), Error> {
        self.write_reply_line(code, ' ', status, text).await?;
        self.io.flush().await?;
        Ok(())
    }

    async fn write_reply_line(
        &mut self,
        code: PrimaryCode,
        separator: char,
        status: Option<(ClassCode, SubjectCode)>,
        text: &str,
    ) -> Result<(), Error> {
        use std::fmt::Write as _;

        let mut line = String::with_capacity(text.len() + 16);
        let _ = write!(line, "{}{}", code as u16, separator);
        if let Some((class, subject)) = status {
            // Enhanced status per RFC 1893: class.subject.detail.
            let subject = subject as u8;
            let _ = write!(
                line,
                "{}.{}.{} ",
                class as u8,
                subject / 10,
                subject % 10
            );
        }
        let _ = write!(line, "{}\r\n", text);

        self.io.write_all(line.as_bytes()).await?;
        Ok(())
    }
}

/// Reads a DATA payload until the lone-dot terminator, un-stuffing as it
/// goes. Bytes beyond `max` are drained but not kept; returns whether the
/// payload was oversize.
async fn read_data_unstuffed(
    src: &mut (impl AsyncBufRead + Unpin),
    dst: &mut Vec<u8>,
    max: u64,
) -> io::Result<bool> {
    let mut start_of_line = true;
    let mut has_trailing_cr = false;
    let mut total: u64 = 0;
    let mut buffer = Vec::new();

    loop {
        buffer.clear();
        src.read_until(b'\n', &mut buffer).await?;

        if buffer.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF encountered in DATA payload",
            ));
        }

        if b".\r\n" == &buffer[..] && start_of_line {
            break;
        }

        let content: &[u8] = if b'.' == buffer[0] && start_of_line {
            &buffer[1..]
        } else {
            &buffer
        };

        total += content.len() as u64;
        if total <= max {
            dst.extend_from_slice(content);
        }

        start_of_line = buffer.ends_with(b"\r\n")
            || (b"\n" == &buffer[..] && has_trailing_cr);
        has_trailing_cr = buffer.ends_with(b"\r");
    }

    Ok(total > max)
}
