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

use std::fmt;
use std::io;

use thiserror::Error;

/// The way in which a POP3 operation failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pop3ErrorKind {
    /// The server answered `-ERR`. Recoverable at the session level.
    Protocol(String),
    /// The socket failed or closed before the expected reply arrived.
    Transport(String),
    /// The connect or command deadline expired; the socket was destroyed.
    Timeout,
    /// The target host is inside an active throttle window.
    Throttled,
    /// USER or PASS was rejected.
    Authentication(String),
}

/// A POP3 failure, tagged with the command that was in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pop3Error {
    pub command: &'static str,
    pub kind: Pop3ErrorKind,
}

impl Pop3Error {
    pub fn new(command: &'static str, kind: Pop3ErrorKind) -> Self {
        Pop3Error { command, kind }
    }

    /// Whether the remote end looks like it is rate-limiting us.
    ///
    /// Providers phrase this in several ways; the strings below are the
    /// signals seen in the wild.
    pub fn looks_like_throttle(&self) -> bool {
        let text = match self.kind {
            Pop3ErrorKind::Protocol(ref s)
            | Pop3ErrorKind::Authentication(ref s) => s,
            _ => return false,
        };
        let text = text.to_lowercase();
        ["too many connections", "login rate", "try again later"]
            .iter()
            .any(|signal| text.contains(signal))
    }
}

impl fmt::Display for Pop3Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            Pop3ErrorKind::Protocol(ref s) => {
                write!(f, "{}: server error: {}", self.command, s)
            },
            Pop3ErrorKind::Transport(ref s) => {
                write!(f, "{}: transport failure: {}", self.command, s)
            },
            Pop3ErrorKind::Timeout => write!(f, "{}: timed out", self.command),
            Pop3ErrorKind::Throttled => {
                write!(f, "{}: host is throttled", self.command)
            },
            Pop3ErrorKind::Authentication(ref s) => {
                write!(f, "{}: authentication rejected: {}", self.command, s)
            },
        }
    }
}

impl std::error::Error for Pop3Error {}

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Validation(String),
    #[error("{0}")]
    Authentication(&'static str),
    #[error("{0}")]
    Authorization(&'static str),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("{0}")]
    Conflict(String),
    #[error("Too many requests")]
    RateLimited,
    #[error(transparent)]
    Pop3(#[from] Pop3Error),
    #[error("{0}")]
    Encryption(&'static str),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    DbPool(#[from] r2d2::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Tls(#[from] native_tls::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// The `(status, code)` pair reported at the HTTP boundary.
    ///
    /// This is the only place errors are flattened into wire codes; nothing
    /// below the API layer consults it.
    pub fn api_code(&self) -> (u16, &'static str) {
        match *self {
            Error::Validation(..) => (400, "VALIDATION_ERROR"),
            Error::Authentication(..) => (401, "AUTHENTICATION_ERROR"),
            Error::Authorization(..) => (403, "AUTHORIZATION_ERROR"),
            Error::NotFound(..) => (404, "NOT_FOUND"),
            Error::Conflict(..) => (409, "CONFLICT"),
            Error::RateLimited => (429, "RATE_LIMIT_EXCEEDED"),
            Error::Pop3(..) => (502, "POP3_ERROR"),
            Error::Encryption(..) => (500, "ENCRYPTION_ERROR"),
            Error::Io(..)
            | Error::Sqlite(..)
            | Error::DbPool(..)
            | Error::Ssl(..)
            | Error::Tls(..)
            | Error::Json(..) => (500, "INTERNAL_ERROR"),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn throttle_signals_are_recognised() {
        let e = Pop3Error::new(
            "PASS",
            Pop3ErrorKind::Protocol(
                "-ERR Too Many Connections from your IP".to_owned(),
            ),
        );
        assert!(e.looks_like_throttle());

        let e = Pop3Error::new(
            "USER",
            Pop3ErrorKind::Protocol("-ERR mailbox locked".to_owned()),
        );
        assert!(!e.looks_like_throttle());

        let e = Pop3Error::new("RETR", Pop3ErrorKind::Timeout);
        assert!(!e.looks_like_throttle());
    }

    #[test]
    fn api_codes_match_contract() {
        assert_eq!(
            (400, "VALIDATION_ERROR"),
            Error::Validation("bad".to_owned()).api_code()
        );
        assert_eq!((429, "RATE_LIMIT_EXCEEDED"), Error::RateLimited.api_code());
        assert_eq!(
            (502, "POP3_ERROR"),
            Error::Pop3(Pop3Error::new("UIDL", Pop3ErrorKind::Timeout))
                .api_code()
        );
    }
}
