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

//! Model types for the message store, plus their `rusqlite` bindings.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::prelude::*;
use rusqlite::types::{
    FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef,
};
use serde::{Deserialize, Serialize};

macro_rules! transparent_to_sql {
    ($t:ident) => {
        impl ToSql for $t {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                self.0.to_sql()
            }
        }
    };
}

macro_rules! transparent_from_sql {
    ($t:ident) => {
        impl FromSql for $t {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                FromSql::column_result(value).map(Self)
            }
        }
    };
}

macro_rules! id_newtype {
    ($t:ident) => {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash,
            Serialize, Deserialize,
        )]
        pub struct $t(pub i64);
        transparent_to_sql!($t);
        transparent_from_sql!($t);
    };
}

id_newtype!(InboxId);
id_newtype!(TokenId);
id_newtype!(MessageId);
id_newtype!(AttachmentId);
id_newtype!(DomainId);

/// A UTC instant stored as integer milliseconds.
///
/// Millisecond precision (rather than whole seconds) matters because
/// `fetched_at` is the pagination cursor and must be strictly monotonic
/// within an inbox.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnixTimestamp(pub DateTime<Utc>);

impl UnixTimestamp {
    pub fn now() -> Self {
        Self(Utc::now())
    }

    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    pub fn from_millis(millis: i64) -> Option<Self> {
        DateTime::<Utc>::from_timestamp_millis(millis).map(Self)
    }
}

impl ToSql for UnixTimestamp {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let ToSqlOutput::Owned(v) = self.as_millis().to_sql()? else {
            unreachable!()
        };
        Ok(ToSqlOutput::Owned(v))
    }
}

impl FromSql for UnixTimestamp {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let inner = i64::column_result(value)?;
        Self::from_millis(inner).ok_or(FromSqlError::OutOfRange(inner))
    }
}

macro_rules! text_enum {
    ($t:ident { $($variant:ident = $text:expr,)* }) => {
        #[derive(
            Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize,
        )]
        #[serde(rename_all = "lowercase")]
        pub enum $t {
            $($variant,)*
        }

        impl $t {
            pub fn as_str(self) -> &'static str {
                match self {
                    $($t::$variant => $text,)*
                }
            }
        }

        impl FromStr for $t {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, String> {
                match s {
                    $($text => Ok($t::$variant),)*
                    _ => Err(format!(
                        concat!("unknown ", stringify!($t), ": {}"), s,
                    )),
                }
            }
        }

        impl ToSql for $t {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::Borrowed(ValueRef::Text(
                    self.as_str().as_bytes(),
                )))
            }
        }

        impl FromSql for $t {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                let ValueRef::Text(text) = value else {
                    return Err(FromSqlError::InvalidType);
                };
                let Ok(text) = std::str::from_utf8(text) else {
                    return Err(FromSqlError::InvalidType);
                };
                text.parse().map_err(|_| FromSqlError::InvalidType)
            }
        }
    };
}

text_enum!(InboxType {
    External = "external",
    Generated = "generated",
});

text_enum!(InboxStatus {
    Active = "active",
    Suspended = "suspended",
    Deleted = "deleted",
});

text_enum!(TokenStatus {
    Active = "active",
    Revoked = "revoked",
    Expired = "expired",
});

/// The identity of a mailbox.
#[derive(Clone, Debug)]
pub struct Inbox {
    pub id: InboxId,
    pub email: String,
    pub inbox_type: InboxType,
    pub status: InboxStatus,
    pub pop3_host: Option<String>,
    pub pop3_port: Option<u16>,
    pub pop3_tls: bool,
    /// Sealed credential blobs. Empty once the inbox is deleted.
    pub username_enc: String,
    pub password_enc: String,
    pub last_seen_uid: Option<String>,
    pub domain_id: Option<DomainId>,
    pub created_by: String,
    pub ttl_secs: i64,
    pub created_at: UnixTimestamp,
    pub deleted_at: Option<UnixTimestamp>,
}

/// Everything needed to create an inbox row. Credentials arrive sealed.
#[derive(Clone, Debug)]
pub struct NewInbox {
    pub email: String,
    pub inbox_type: InboxType,
    pub pop3_host: Option<String>,
    pub pop3_port: Option<u16>,
    pub pop3_tls: bool,
    pub username_enc: String,
    pub password_enc: String,
    pub domain_id: Option<DomainId>,
    pub created_by: String,
    pub ttl_secs: i64,
}

/// A bearer capability row.
#[derive(Clone, Debug)]
pub struct Token {
    pub id: TokenId,
    pub inbox_id: InboxId,
    pub token_hash: String,
    pub status: TokenStatus,
    pub expires_at: UnixTimestamp,
    pub issued_to: String,
    pub created_at: UnixTimestamp,
    pub revoked_at: Option<UnixTimestamp>,
}

/// An administrator-managed issuing domain.
#[derive(Clone, Debug)]
pub struct Domain {
    pub id: DomainId,
    pub domain: String,
    pub pop3_host: Option<String>,
    pub pop3_port: Option<u16>,
    pub pop3_tls: bool,
    /// Local domains receive mail through the built-in SMTP receiver
    /// instead of a provider POP3 pull.
    pub is_local: bool,
    pub active: bool,
    pub created_at: UnixTimestamp,
}

#[derive(Clone, Debug)]
pub struct NewDomain {
    pub domain: String,
    pub pop3_host: Option<String>,
    pub pop3_port: Option<u16>,
    pub pop3_tls: bool,
    pub is_local: bool,
    pub active: bool,
}

/// One To-header mailbox, in header order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A stored message with its attachment metadata aggregated.
#[derive(Clone, Debug)]
pub struct StoredMessage {
    pub id: MessageId,
    pub inbox_id: InboxId,
    pub uid: String,
    pub message_id: Option<String>,
    pub sender: String,
    pub recipients: Vec<Recipient>,
    pub subject: String,
    pub body_text: String,
    pub body_html: String,
    pub headers: BTreeMap<String, String>,
    pub size_bytes: i64,
    pub received_at: Option<UnixTimestamp>,
    pub fetched_at: UnixTimestamp,
    pub attachments: Vec<AttachmentMeta>,
}

/// Attachment metadata as exposed in message listings.
#[derive(Clone, Debug)]
pub struct AttachmentMeta {
    pub id: AttachmentId,
    pub filename: String,
    pub content_type: String,
    pub size_bytes: i64,
    pub content_id: Option<String>,
    pub checksum: String,
}

/// An attachment with its payload, for binary download.
#[derive(Clone, Debug)]
pub struct AttachmentContent {
    pub meta: AttachmentMeta,
    pub content: Vec<u8>,
}

/// Counters for the admin stats endpoint.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct StoreStats {
    pub inboxes_active: i64,
    pub inboxes_deleted: i64,
    pub inboxes_external: i64,
    pub inboxes_generated: i64,
    pub messages: i64,
    pub attachments: i64,
    pub tokens_active: i64,
    pub tokens_revoked: i64,
    pub tokens_expired: i64,
    pub domains: i64,
    pub bulk_generations: i64,
}

pub fn from_row<T: FromRow>(row: &rusqlite::Row<'_>) -> rusqlite::Result<T> {
    T::from_row(row)
}

pub fn from_single<T: FromSql>(row: &rusqlite::Row<'_>) -> rusqlite::Result<T> {
    row.get(0)
}

pub trait FromRow: Sized {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self>;
}

macro_rules! from_row_tuple {
    ($($ix:tt: $t:ident),*) => {
        impl<$($t: FromSql,)*> FromRow
        for ($($t,)*) {
            fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
                Ok(($(row.get($ix)?,)*))
            }
        }
    }
}

from_row_tuple!(0: A);
from_row_tuple!(0: A, 1: B);
from_row_tuple!(0: A, 1: B, 2: C);
from_row_tuple!(0: A, 1: B, 2: C, 3: D);
from_row_tuple!(0: A, 1: B, 2: C, 3: D, 4: E);
from_row_tuple!(0: A, 1: B, 2: C, 3: D, 4: E, 5: F);

impl FromRow for Inbox {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Inbox {
            id: row.get("id")?,
            email: row.get("email")?,
            inbox_type: row.get("inbox_type")?,
            status: row.get("status")?,
            pop3_host: row.get("pop3_host")?,
            pop3_port: row.get("pop3_port")?,
            pop3_tls: row.get("pop3_tls")?,
            username_enc: row.get("username_enc")?,
            password_enc: row.get("password_enc")?,
            last_seen_uid: row.get("last_seen_uid")?,
            domain_id: row.get("domain_id")?,
            created_by: row.get("created_by")?,
            ttl_secs: row.get("ttl_secs")?,
            created_at: row.get("created_at")?,
            deleted_at: row.get("deleted_at")?,
        })
    }
}

impl FromRow for Token {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Token {
            id: row.get("id")?,
            inbox_id: row.get("inbox_id")?,
            token_hash: row.get("token_hash")?,
            status: row.get("status")?,
            expires_at: row.get("expires_at")?,
            issued_to: row.get("issued_to")?,
            created_at: row.get("created_at")?,
            revoked_at: row.get("revoked_at")?,
        })
    }
}

impl FromRow for Domain {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Domain {
            id: row.get("id")?,
            domain: row.get("domain")?,
            pop3_host: row.get("pop3_host")?,
            pop3_port: row.get("pop3_port")?,
            pop3_tls: row.get("pop3_tls")?,
            is_local: row.get("is_local")?,
            active: row.get("active")?,
            created_at: row.get("created_at")?,
        })
    }
}

impl FromRow for AttachmentMeta {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(AttachmentMeta {
            id: row.get("id")?,
            filename: row.get("filename")?,
            content_type: row.get("content_type")?,
            size_bytes: row.get("size_bytes")?,
            content_id: row.get("content_id")?,
            checksum: row.get("checksum")?,
        })
    }
}
