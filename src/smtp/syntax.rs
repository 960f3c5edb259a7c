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

use std::str::FromStr;

use lazy_static::lazy_static;
use regex::Regex;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// (HELO|EHLO) origin-host ignored...
    Helo(String, String),
    /// AUTH mechanism. Always refused, but parsed so the refusal is polite.
    Auth,
    /// MAIL FROM:<return-path> [SIZE=sz] [BODY=encoding]
    MailFrom(String, Option<u64>),
    /// RCPT TO:<ignored...:email>
    Recipient(String),
    /// DATA
    Data,
    /// RSET
    Reset,
    /// VRFY ignored...
    Verify,
    /// HELP ignored...
    Help,
    /// NOOP
    Noop,
    /// QUIT
    Quit,
    /// STARTTLS. Always refused.
    StartTls,
}

static SIMPLE_COMMANDS: &[(&str, Command, bool)] = &[
    ("DATA", Command::Data, false),
    ("RSET", Command::Reset, false),
    ("VRFY ", Command::Verify, true),
    ("HELP", Command::Help, true),
    ("NOOP", Command::Noop, false),
    ("QUIT", Command::Quit, false),
    ("STARTTLS", Command::StartTls, false),
];

lazy_static! {
    static ref RX_HELO: Regex =
        Regex::new("^(?i)(HELO|EHLO) ([^ ]*)").unwrap();
    static ref RX_MAIL: Regex =
        Regex::new("^(?i)MAIL FROM:<([^>]*)>(.*)$").unwrap();
    static ref RX_MAIL_SIZE_PARM: Regex =
        Regex::new("(?i)SIZE=([0-9]+)").unwrap();
    static ref RX_RCPT: Regex =
        Regex::new("^(?i)RCPT TO:<(?:@[^:]+:)?([^>]+)>(.*)$").unwrap();
    static ref RX_AUTH: Regex =
        Regex::new("^(?i)AUTH ([A-Z0-9-]+)(?: .*)?$").unwrap();
    static ref RX_KNOWN_COMMANDS: Regex = Regex::new(
        "^(?i)(DATA|RSET|VRFY|EXPN|HELP|NOOP|QUIT|\
         STARTTLS|MAIL|RCPT|HELO|EHLO|AUTH)( .*)?$"
    )
    .unwrap();
}

pub fn looks_like_known_command(s: &str) -> bool {
    RX_KNOWN_COMMANDS.is_match(s)
}

impl FromStr for Command {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        for &(prefix, ref cmd, allow_trailing_garbage) in SIMPLE_COMMANDS {
            if s.len() >= prefix.len()
                && (allow_trailing_garbage || s.len() == prefix.len())
                && s.get(0..prefix.len())
                    .is_some_and(|sp| prefix.eq_ignore_ascii_case(sp))
            {
                return Ok(cmd.clone());
            }
        }

        if let Some(cap) = RX_HELO.captures(s) {
            Ok(Command::Helo(
                cap.get(1).unwrap().as_str().to_owned(),
                cap.get(2).unwrap().as_str().to_owned(),
            ))
        } else if let Some(cap) = RX_MAIL.captures(s) {
            let size = RX_MAIL_SIZE_PARM
                .captures(cap.get(2).map(|c| c.as_str()).unwrap_or(""))
                .and_then(|c| c.get(1))
                .and_then(|c| c.as_str().parse::<u64>().ok());

            Ok(Command::MailFrom(
                cap.get(1).unwrap().as_str().to_owned(),
                size,
            ))
        } else if let Some(cap) = RX_RCPT.captures(s) {
            Ok(Command::Recipient(cap.get(1).unwrap().as_str().to_owned()))
        } else if RX_AUTH.is_match(s) {
            Ok(Command::Auth)
        } else {
            Err(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_the_command_set() {
        assert_eq!(
            Ok(Command::Helo("EHLO".to_owned(), "mx.example.com".to_owned())),
            "EHLO mx.example.com".parse()
        );
        assert_eq!(
            Ok(Command::MailFrom("bob@example.com".to_owned(), None)),
            "MAIL FROM:<bob@example.com>".parse()
        );
        assert_eq!(
            Ok(Command::MailFrom("bob@example.com".to_owned(), Some(1234))),
            "mail from:<bob@example.com> SIZE=1234 BODY=8BITMIME".parse()
        );
        assert_eq!(
            Ok(Command::Recipient("alice@temp.example".to_owned())),
            "RCPT TO:<alice@temp.example>".parse()
        );
        // Source-route prefixes are tolerated and discarded.
        assert_eq!(
            Ok(Command::Recipient("alice@temp.example".to_owned())),
            "RCPT TO:<@relay.example:alice@temp.example>".parse()
        );
        assert_eq!(Ok(Command::Data), "DATA".parse());
        assert_eq!(Ok(Command::Quit), "QUIT".parse());
        assert_eq!(Ok(Command::Auth), "AUTH PLAIN AGFsaWNl".parse());
        assert_eq!(Ok(Command::StartTls), "STARTTLS".parse());
        assert_eq!(Err(()), "MAKE COFFEE".parse::<Command>());
    }

    #[test]
    fn known_command_detection() {
        assert!(looks_like_known_command("MAIL FROM bob@example.com"));
        assert!(looks_like_known_command("rcpt to:"));
        assert!(!looks_like_known_command("GET / HTTP/1.1"));
    }
}
