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

//! Raw RFC 5322 bytes → the normalized record the store persists.
//!
//! Parsing never fails the record: unparseable input still yields a record
//! carrying the UID and size, with every text field defaulted to empty.
//! Only the allow-listed headers are exported; everything else in the
//! header block stays behind.

use std::collections::BTreeMap;

use log::warn;
use mail_parser::{Address, HeaderValue, MessageParser, MimeHeaders};

use crate::crypt::sha256_hex;
use crate::store::types::{Recipient, UnixTimestamp};

/// HTML bodies beyond this are dropped; the record still produces.
const MAX_HTML_BYTES: usize = 5 * 1024 * 1024;

/// Headers exported into the normalized record, and nothing else.
const HEADER_ALLOW_LIST: &[&str] = &[
    "message-id",
    "date",
    "from",
    "to",
    "cc",
    "bcc",
    "reply-to",
    "content-type",
    "x-mailer",
    "x-spam-status",
];

/// A normalized message, ready for transactional persistence.
#[derive(Clone, Debug)]
pub struct ParsedMessage {
    pub uid: String,
    pub message_id: Option<String>,
    pub sender: String,
    pub recipients: Vec<Recipient>,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    pub headers: BTreeMap<String, String>,
    /// Exact byte length of the raw input.
    pub size_bytes: i64,
    /// The provider-reported `Date:` header, when present and sane.
    pub received_at: Option<UnixTimestamp>,
    pub attachments: Vec<ParsedAttachment>,
}

#[derive(Clone, Debug)]
pub struct ParsedAttachment {
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub content_id: Option<String>,
    /// SHA-256 over exactly the stored bytes.
    pub checksum: String,
    pub content: Vec<u8>,
}

/// Normalizes one raw message.
///
/// `uid` is the provider-assigned identity; it travels through untouched.
/// Attachments above `max_attachment_bytes` are dropped here, with the
/// count logged, and the parent record still produces.
pub fn normalize(
    raw: &[u8],
    uid: &str,
    max_attachment_bytes: usize,
) -> ParsedMessage {
    let mut record = ParsedMessage {
        uid: uid.to_owned(),
        message_id: None,
        sender: String::new(),
        recipients: Vec::new(),
        subject: String::new(),
        body_text: String::new(),
        body_html: String::new(),
        headers: BTreeMap::new(),
        size_bytes: raw.len() as i64,
        received_at: None,
        attachments: Vec::new(),
    };

    let Some(message) = MessageParser::default().parse(raw) else {
        warn!("Message {} is unparseable; storing an empty record", uid);
        return record;
    };

    record.message_id = message.message_id().map(str::to_owned);
    record.sender = message
        .from()
        .and_then(first_address_string)
        .unwrap_or_default();
    record.recipients = message
        .to()
        .map(|to| {
            to.iter()
                .filter_map(|addr| {
                    addr.address().map(|address| Recipient {
                        address: address.to_string(),
                        name: addr.name().map(str::to_owned),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    record.subject = message.subject().unwrap_or("").to_owned();
    record.body_text = message
        .body_text(0)
        .map(|text| text.into_owned())
        .unwrap_or_default();

    let html = message.body_html(0).unwrap_or_default();
    if html.len() <= MAX_HTML_BYTES {
        record.body_html = html.into_owned();
    } else {
        warn!(
            "Message {} HTML body is {} bytes, over the {} limit; dropping",
            uid,
            html.len(),
            MAX_HTML_BYTES
        );
    }

    for header in message.headers() {
        let name = header.name().to_lowercase();
        if !HEADER_ALLOW_LIST.contains(&name.as_str()) {
            continue;
        }
        record
            .headers
            .entry(name)
            .or_insert_with(|| header_text(header.value()));
    }

    record.received_at = message
        .date()
        .and_then(|date| UnixTimestamp::from_millis(date.to_timestamp() * 1000));

    let mut dropped = 0usize;
    for part in message.attachments() {
        let content = part.contents();
        if content.len() > max_attachment_bytes {
            dropped += 1;
            continue;
        }

        record.attachments.push(ParsedAttachment {
            filename: part
                .attachment_name()
                .unwrap_or("unnamed")
                .to_owned(),
            content_type: part
                .content_type()
                .map(|ct| match ct.subtype() {
                    Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                    None => ct.ctype().to_string(),
                })
                .unwrap_or_else(|| "application/octet-stream".to_owned()),
            size_bytes: content.len() as i64,
            content_id: part.content_id().map(str::to_owned),
            checksum: sha256_hex(content),
            content: content.to_vec(),
        });
    }

    if dropped > 0 {
        warn!(
            "Message {}: dropped {} attachments over the {}-byte cap",
            uid, dropped, max_attachment_bytes
        );
    }

    record
}

fn first_address_string(address: &Address) -> Option<String> {
    let first = address.first()?;
    match (first.name(), first.address()) {
        (Some(name), Some(email)) => Some(format!("{} <{}>", name, email)),
        (None, Some(email)) => Some(email.to_string()),
        (Some(name), None) => Some(name.to_string()),
        (None, None) => None,
    }
}

fn header_text(value: &HeaderValue) -> String {
    match value {
        HeaderValue::Text(text) => text.to_string(),
        HeaderValue::TextList(list) => list.join(", "),
        HeaderValue::Address(address) => address
            .iter()
            .filter_map(|a| a.address().map(|s| s.to_string()))
            .collect::<Vec<_>>()
            .join(", "),
        HeaderValue::DateTime(date) => date.to_rfc3339(),
        HeaderValue::ContentType(ct) => match ct.subtype() {
            Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
            None => ct.ctype().to_string(),
        },
        _ => String::new(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    const CAP: usize = 1024;

    fn multipart_fixture(attachment_bytes: usize) -> String {
        let payload = base64::encode(vec![0x42u8; attachment_bytes]);
        format!(
            "Message-ID: <m1@example.com>\r\n\
             Date: Mon, 2 Jun 2025 10:00:00 +0000\r\n\
             From: Bob Example <bob@example.com>\r\n\
             To: Alice <alice@example.org>, carol@example.org\r\n\
             X-Mailer: testmailer 1.0\r\n\
             X-Irrelevant: should not survive\r\n\
             Subject: fixture\r\n\
             MIME-Version: 1.0\r\n\
             Content-Type: multipart/mixed; boundary=\"b\"\r\n\
             \r\n\
             --b\r\n\
             Content-Type: text/plain\r\n\
             \r\n\
             plain body\r\n\
             --b\r\n\
             Content-Type: text/html\r\n\
             \r\n\
             <p>html body</p>\r\n\
             --b\r\n\
             Content-Type: application/pdf\r\n\
             Content-Disposition: attachment; filename=\"doc.pdf\"\r\n\
             Content-Transfer-Encoding: base64\r\n\
             \r\n\
             {}\r\n\
             --b--\r\n",
            payload
        )
    }

    #[test]
    fn normalizes_the_usual_fields() {
        let raw = multipart_fixture(16);
        let record = normalize(raw.as_bytes(), "u1", CAP);

        assert_eq!("u1", record.uid);
        assert_eq!(raw.len() as i64, record.size_bytes);
        assert_eq!(Some("m1@example.com".to_owned()), record.message_id);
        assert_eq!("Bob Example <bob@example.com>", record.sender);
        assert_eq!(2, record.recipients.len());
        assert_eq!("alice@example.org", record.recipients[0].address);
        assert_eq!(Some("Alice".to_owned()), record.recipients[0].name);
        assert_eq!("carol@example.org", record.recipients[1].address);
        assert_eq!(None, record.recipients[1].name);
        assert_eq!("fixture", record.subject);
        assert!(record.body_text.contains("plain body"));
        assert!(record.body_html.contains("<p>html body</p>"));
        assert!(record.received_at.is_some());
    }

    #[test]
    fn header_allow_list_is_exact() {
        let record = normalize(multipart_fixture(16).as_bytes(), "u1", CAP);

        assert!(record.headers.contains_key("message-id"));
        assert!(record.headers.contains_key("from"));
        assert!(record.headers.contains_key("to"));
        assert!(record.headers.contains_key("date"));
        assert_eq!(
            Some(&"testmailer 1.0".to_owned()),
            record.headers.get("x-mailer")
        );
        assert!(!record.headers.contains_key("x-irrelevant"));
        assert!(!record.headers.contains_key("mime-version"));
        assert!(!record.headers.contains_key("subject"));
    }

    #[test]
    fn attachment_is_extracted_with_checksum() {
        let record = normalize(multipart_fixture(16).as_bytes(), "u1", CAP);

        assert_eq!(1, record.attachments.len());
        let attachment = &record.attachments[0];
        assert_eq!("doc.pdf", attachment.filename);
        assert_eq!("application/pdf", attachment.content_type);
        assert_eq!(16, attachment.size_bytes);
        assert_eq!(vec![0x42u8; 16], attachment.content);
        assert_eq!(
            sha256_hex(&attachment.content),
            attachment.checksum
        );
    }

    #[test]
    fn oversize_attachment_dropped_but_record_produces() {
        let record =
            normalize(multipart_fixture(CAP + 1).as_bytes(), "u1", CAP);

        assert!(record.attachments.is_empty());
        assert_eq!("fixture", record.subject);
        assert!(record.body_text.contains("plain body"));
    }

    #[test]
    fn defaults_for_sparse_messages() {
        let raw = b"\r\nno headers at all\r\n";
        let record = normalize(raw, "u2", CAP);

        assert_eq!("u2", record.uid);
        assert_eq!(raw.len() as i64, record.size_bytes);
        assert_eq!("", record.sender);
        assert_eq!("", record.subject);
        assert_eq!("", record.body_html);
        assert!(record.recipients.is_empty());
        assert_eq!(None, record.received_at);
    }

    #[test]
    fn oversized_html_is_dropped() {
        let big = "x".repeat(MAX_HTML_BYTES + 1);
        let raw = format!(
            "From: a@b.c\r\nContent-Type: text/html\r\n\r\n{}",
            big
        );
        let record = normalize(raw.as_bytes(), "u3", CAP);

        assert_eq!("", record.body_html);
        assert_eq!(raw.len() as i64, record.size_bytes);
    }
}
