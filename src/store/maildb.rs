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

//! The `briefbox.sqlite` store: inboxes, tokens, messages, attachments,
//! domains, audit events.
//!
//! Every public operation is atomic. The concept of a database transaction
//! does not escape this module; callers see whole operations succeed or
//! fail. Connections come from a fixed-size pool and every borrow is scoped:
//! the guard releases the connection on all exit paths and complains to the
//! log when something sat on one for too long.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};
use std::path::Path;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::OptionalExtension as _;

use super::types::*;
use crate::mime::ParsedMessage;
use crate::support::error::Error;

/// How long a connection may be held before the watchdog complains.
const SLOW_HOLD: Duration = Duration::from_secs(5);

const POOL_SIZE: u32 = 8;

/// Schema batches, one per version, applied in order. Version N is the
/// batch at index N-1; `briefbox.sqlite` is the only database this crate
/// ever opens, so there is no per-database bookkeeping beyond this list.
static SCHEMA: &[&str] = &[include_str!("maildb.v1.sql")];

/// Handle to the message store. Clones share the same pool.
#[derive(Clone)]
pub struct MailDb {
    pool: r2d2::Pool<SqliteConnectionManager>,
}

/// Result of one transactional ingestion batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub inserted: usize,
    /// Rows that already existed under `(inbox, uid)` and were left alone.
    pub skipped: usize,
}

struct DbGuard {
    cxn: r2d2::PooledConnection<SqliteConnectionManager>,
    acquired: Instant,
}

impl Deref for DbGuard {
    type Target = rusqlite::Connection;

    fn deref(&self) -> &rusqlite::Connection {
        &self.cxn
    }
}

impl DerefMut for DbGuard {
    fn deref_mut(&mut self) -> &mut rusqlite::Connection {
        &mut self.cxn
    }
}

impl Drop for DbGuard {
    fn drop(&mut self) {
        let held = self.acquired.elapsed();
        if held > SLOW_HOLD {
            warn!(
                "DB connection held for {}ms; something is stuck or slow",
                held.as_millis()
            );
        }
    }
}

impl MailDb {
    pub fn new(path: &Path) -> Result<Self, Error> {
        let manager = SqliteConnectionManager::file(path).with_init(|cxn| {
            cxn.pragma_update(None, "foreign_keys", true)?;
            cxn.pragma_update(None, "journal_mode", "WAL")?;
            cxn.busy_timeout(Duration::from_secs(10))
        });
        let pool = r2d2::Pool::builder()
            .max_size(POOL_SIZE)
            .build(manager)?;

        {
            let mut cxn = pool.get()?;
            upgrade_schema(&mut cxn)?;
        }

        Ok(MailDb { pool })
    }

    fn db(&self) -> Result<DbGuard, Error> {
        Ok(DbGuard {
            cxn: self.pool.get()?,
            acquired: Instant::now(),
        })
    }

    /// Liveness probe for `/ready`.
    pub fn ping(&self) -> Result<(), Error> {
        self.db()?
            .query_row("SELECT 1", (), from_single::<i64>)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inboxes

    /// Inserts a new active inbox. Credentials must already be sealed.
    pub fn create_inbox(&self, new: &NewInbox) -> Result<Inbox, Error> {
        let mut cxn = self.db()?;
        let txn = cxn.transaction()?;

        txn.execute(
            "INSERT INTO `inboxes` (\
               `email`, `inbox_type`, `status`, `pop3_host`, `pop3_port`, \
               `pop3_tls`, `username_enc`, `password_enc`, `domain_id`, \
               `created_by`, `ttl_secs`, `created_at`\
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &new.email,
                new.inbox_type,
                InboxStatus::Active,
                &new.pop3_host,
                new.pop3_port,
                new.pop3_tls,
                &new.username_enc,
                &new.password_enc,
                new.domain_id,
                &new.created_by,
                new.ttl_secs,
                UnixTimestamp::now(),
            ),
        )?;

        let id = InboxId(txn.last_insert_rowid());
        let inbox = txn.query_row(
            "SELECT * FROM `inboxes` WHERE `id` = ?",
            (id,),
            Inbox::from_row,
        )?;
        txn.commit()?;

        Ok(inbox)
    }

    pub fn fetch_inbox(&self, id: InboxId) -> Result<Inbox, Error> {
        self.db()?
            .query_row(
                "SELECT * FROM `inboxes` WHERE `id` = ?",
                (id,),
                Inbox::from_row,
            )
            .optional()?
            .ok_or(Error::NotFound("no such inbox"))
    }

    /// Finds the active inbox whose address matches case-insensitively.
    ///
    /// Used by the SMTP receiver to resolve RCPT TO. At most one active
    /// inbox is expected per address; if several exist, the oldest wins.
    pub fn find_active_inbox_by_email(
        &self,
        email: &str,
    ) -> Result<Option<Inbox>, Error> {
        self.db()?
            .query_row(
                "SELECT * FROM `inboxes` \
                 WHERE lower(`email`) = lower(?) AND `status` = 'active' \
                 ORDER BY `id` LIMIT 1",
                (email,),
                Inbox::from_row,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Hard-deletes an inbox: attachments and messages go away, active
    /// tokens are revoked, and the credential blobs are overwritten with
    /// empty strings. All in one transaction.
    pub fn delete_inbox(&self, id: InboxId) -> Result<(), Error> {
        let mut cxn = self.db()?;
        let txn = cxn.transaction()?;

        if 0 == txn.query_row(
            "SELECT COUNT(*) FROM `inboxes` WHERE `id` = ?",
            (id,),
            from_single::<i64>,
        )? {
            return Err(Error::NotFound("no such inbox"));
        }

        // The schema also declares ON DELETE CASCADE, but the cascade is
        // done explicitly so the transaction does not depend on it.
        txn.execute(
            "DELETE FROM `attachments` WHERE `inbox_id` = ?",
            (id,),
        )?;
        txn.execute("DELETE FROM `messages` WHERE `inbox_id` = ?", (id,))?;
        txn.execute(
            "UPDATE `tokens` SET `status` = 'revoked', `revoked_at` = ? \
             WHERE `inbox_id` = ? AND `status` = 'active'",
            (UnixTimestamp::now(), id),
        )?;
        txn.execute(
            "UPDATE `inboxes` SET `status` = 'deleted', \
             `username_enc` = '', `password_enc` = '', `deleted_at` = ? \
             WHERE `id` = ?",
            (UnixTimestamp::now(), id),
        )?;

        txn.commit()?;
        Ok(())
    }

    /// Conditionally advances `last_seen_uid`.
    ///
    /// The update only applies while the cursor still holds the value the
    /// fetch job observed when it started, so two interleaved jobs for the
    /// same inbox cannot regress the cursor. Returns whether the update
    /// took effect.
    pub fn advance_last_seen_uid(
        &self,
        id: InboxId,
        observed: Option<&str>,
        new_uid: &str,
    ) -> Result<bool, Error> {
        let changed = self.db()?.execute(
            "UPDATE `inboxes` SET `last_seen_uid` = ?1 \
             WHERE `id` = ?2 AND `last_seen_uid` IS ?3",
            (new_uid, id, observed),
        )?;
        Ok(changed > 0)
    }

    // ------------------------------------------------------------------
    // Tokens

    pub fn create_token(
        &self,
        inbox_id: InboxId,
        token_hash: &str,
        expires_at: UnixTimestamp,
        issued_to: &str,
    ) -> Result<Token, Error> {
        let mut cxn = self.db()?;
        let txn = cxn.transaction()?;
        let token =
            insert_token(&txn, inbox_id, token_hash, expires_at, issued_to)?;
        txn.commit()?;
        Ok(token)
    }

    /// Revokes every active token of the inbox and issues one new token in
    /// the same transaction, so at most one token is ever active after a
    /// rotate.
    pub fn rotate_token(
        &self,
        inbox_id: InboxId,
        token_hash: &str,
        expires_at: UnixTimestamp,
        issued_to: &str,
    ) -> Result<Token, Error> {
        let mut cxn = self.db()?;
        let txn = cxn.transaction()?;
        txn.execute(
            "UPDATE `tokens` SET `status` = 'revoked', `revoked_at` = ? \
             WHERE `inbox_id` = ? AND `status` = 'active'",
            (UnixTimestamp::now(), inbox_id),
        )?;
        let token =
            insert_token(&txn, inbox_id, token_hash, expires_at, issued_to)?;
        txn.commit()?;
        Ok(token)
    }

    /// Looks a token up by its stored hash, joined with the owning inbox's
    /// status. This is the authoritative check for every authenticated
    /// request.
    pub fn lookup_token(
        &self,
        token_hash: &str,
    ) -> Result<Option<(Token, InboxStatus)>, Error> {
        self.db()?
            .query_row(
                "SELECT `t`.*, `i`.`status` AS `inbox_status` \
                 FROM `tokens` `t` \
                 JOIN `inboxes` `i` ON `i`.`id` = `t`.`inbox_id` \
                 WHERE `t`.`token_hash` = ?",
                (token_hash,),
                |row| {
                    Ok((Token::from_row(row)?, row.get("inbox_status")?))
                },
            )
            .optional()
            .map_err(Into::into)
    }

    /// Marks active-but-expired tokens `expired`. Run by the background
    /// sweep; the request path re-checks `expires_at` itself in case the
    /// sweep is lagging.
    pub fn sweep_expired_tokens(&self) -> Result<usize, Error> {
        let changed = self.db()?.execute(
            "UPDATE `tokens` SET `status` = 'expired' \
             WHERE `status` = 'active' AND `expires_at` < ?",
            (UnixTimestamp::now(),),
        )?;
        Ok(changed)
    }

    // ------------------------------------------------------------------
    // Messages

    /// Transactionally inserts a batch of parsed messages.
    ///
    /// `(inbox, uid)` is the idempotency key: conflicting rows are skipped
    /// silently and their attachments are not written. `fetched_at` is
    /// assigned strictly monotonically per inbox, which makes it usable as
    /// the pagination cursor.
    pub fn insert_messages(
        &self,
        inbox_id: InboxId,
        parsed: &[ParsedMessage],
    ) -> Result<IngestOutcome, Error> {
        let mut cxn = self.db()?;
        let txn = cxn.transaction()?;

        let high_water = txn
            .query_row(
                "SELECT MAX(`fetched_at`) FROM `messages` \
                 WHERE `inbox_id` = ?",
                (inbox_id,),
                from_single::<Option<i64>>,
            )?
            .unwrap_or(0);
        let mut next_fetched_at =
            UnixTimestamp::now().as_millis().max(high_water + 1);

        let mut outcome = IngestOutcome::default();
        for message in parsed {
            let changed = txn.execute(
                "INSERT INTO `messages` (\
                   `inbox_id`, `uid`, `message_id`, `sender`, `recipients`, \
                   `subject`, `body_text`, `body_html`, `headers`, \
                   `size_bytes`, `received_at`, `fetched_at`\
                 ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
                 ON CONFLICT (`inbox_id`, `uid`) DO NOTHING",
                (
                    inbox_id,
                    &message.uid,
                    &message.message_id,
                    &message.sender,
                    serde_json::to_string(&message.recipients)?,
                    &message.subject,
                    &message.body_text,
                    &message.body_html,
                    serde_json::to_string(&message.headers)?,
                    message.size_bytes,
                    message.received_at,
                    next_fetched_at,
                ),
            )?;

            if 0 == changed {
                outcome.skipped += 1;
                continue;
            }

            let message_row = MessageId(txn.last_insert_rowid());
            for attachment in &message.attachments {
                txn.execute(
                    "INSERT INTO `attachments` (\
                       `message_id`, `inbox_id`, `filename`, `content_type`, \
                       `size_bytes`, `content_id`, `checksum`, `content`\
                     ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                    (
                        message_row,
                        inbox_id,
                        &attachment.filename,
                        &attachment.content_type,
                        attachment.size_bytes,
                        &attachment.content_id,
                        &attachment.checksum,
                        &attachment.content,
                    ),
                )?;
            }

            outcome.inserted += 1;
            next_fetched_at += 1;
        }

        txn.commit()?;
        Ok(outcome)
    }

    /// Cursor-based incremental read.
    ///
    /// `since_uid` resolves to the `fetched_at` of the matching row;
    /// messages strictly after that instant come back in ascending
    /// `fetched_at` order. An unknown (or absent) cursor falls back to the
    /// first page.
    pub fn list_messages(
        &self,
        inbox_id: InboxId,
        since_uid: Option<&str>,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, Error> {
        let cxn = self.db()?;

        let cursor = match since_uid {
            Some(uid) => cxn
                .query_row(
                    "SELECT `fetched_at` FROM `messages` \
                     WHERE `inbox_id` = ? AND `uid` = ?",
                    (inbox_id, uid),
                    from_single::<i64>,
                )
                .optional()?,
            None => None,
        };

        let mut stmt = cxn.prepare(
            "SELECT * FROM `messages` \
             WHERE `inbox_id` = ?1 AND `fetched_at` > ?2 \
             ORDER BY `fetched_at` ASC LIMIT ?3",
        )?;
        let mut messages = stmt
            .query_map(
                (inbox_id, cursor.unwrap_or(i64::MIN), limit as i64),
                message_from_row,
            )?
            .collect::<Result<Vec<StoredMessage>, _>>()?;

        let mut attachment_stmt = cxn.prepare(
            "SELECT `id`, `filename`, `content_type`, `size_bytes`, \
                    `content_id`, `checksum` \
             FROM `attachments` WHERE `message_id` = ? ORDER BY `id`",
        )?;
        for message in &mut messages {
            message.attachments = attachment_stmt
                .query_map((message.id,), from_row::<AttachmentMeta>)?
                .collect::<Result<Vec<_>, _>>()?;
        }

        Ok(messages)
    }

    /// Retrieves one attachment payload, scoped to the inbox and the
    /// message UID from the request path.
    pub fn fetch_attachment(
        &self,
        inbox_id: InboxId,
        message_uid: &str,
        attachment_id: AttachmentId,
    ) -> Result<AttachmentContent, Error> {
        self.db()?
            .query_row(
                "SELECT `a`.`id`, `a`.`filename`, `a`.`content_type`, \
                        `a`.`size_bytes`, `a`.`content_id`, `a`.`checksum`, \
                        `a`.`content` \
                 FROM `attachments` `a` \
                 JOIN `messages` `m` ON `m`.`id` = `a`.`message_id` \
                 WHERE `a`.`id` = ? AND `a`.`inbox_id` = ? AND `m`.`uid` = ?",
                (attachment_id, inbox_id, message_uid),
                |row| {
                    Ok(AttachmentContent {
                        meta: AttachmentMeta::from_row(row)?,
                        content: row.get("content")?,
                    })
                },
            )
            .optional()?
            .ok_or(Error::NotFound("no such attachment"))
    }

    // ------------------------------------------------------------------
    // Domains

    pub fn create_domain(&self, new: &NewDomain) -> Result<Domain, Error> {
        let mut cxn = self.db()?;
        let txn = cxn.transaction()?;

        if 0 != txn.query_row(
            "SELECT COUNT(*) FROM `domains` WHERE `domain` = ?",
            (&new.domain,),
            from_single::<i64>,
        )? {
            return Err(Error::Conflict(format!(
                "domain {} already exists",
                new.domain
            )));
        }

        txn.execute(
            "INSERT INTO `domains` (\
               `domain`, `pop3_host`, `pop3_port`, `pop3_tls`, `is_local`, \
               `active`, `created_at`\
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
            (
                &new.domain,
                &new.pop3_host,
                new.pop3_port,
                new.pop3_tls,
                new.is_local,
                new.active,
                UnixTimestamp::now(),
            ),
        )?;

        let id = DomainId(txn.last_insert_rowid());
        let domain = txn.query_row(
            "SELECT * FROM `domains` WHERE `id` = ?",
            (id,),
            Domain::from_row,
        )?;
        txn.commit()?;
        Ok(domain)
    }

    pub fn fetch_domain(&self, id: DomainId) -> Result<Domain, Error> {
        self.db()?
            .query_row(
                "SELECT * FROM `domains` WHERE `id` = ?",
                (id,),
                Domain::from_row,
            )
            .optional()?
            .ok_or(Error::NotFound("no such domain"))
    }

    pub fn list_domains(&self) -> Result<Vec<Domain>, Error> {
        self.db()?
            .prepare("SELECT * FROM `domains` ORDER BY `id`")?
            .query_map((), Domain::from_row)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn update_domain(
        &self,
        id: DomainId,
        new: &NewDomain,
    ) -> Result<Domain, Error> {
        let mut cxn = self.db()?;
        let txn = cxn.transaction()?;

        if 0 != txn.query_row(
            "SELECT COUNT(*) FROM `domains` \
             WHERE `domain` = ? AND `id` != ?",
            (&new.domain, id),
            from_single::<i64>,
        )? {
            return Err(Error::Conflict(format!(
                "domain {} already exists",
                new.domain
            )));
        }

        let changed = txn.execute(
            "UPDATE `domains` SET `domain` = ?, `pop3_host` = ?, \
             `pop3_port` = ?, `pop3_tls` = ?, `is_local` = ?, `active` = ? \
             WHERE `id` = ?",
            (
                &new.domain,
                &new.pop3_host,
                new.pop3_port,
                new.pop3_tls,
                new.is_local,
                new.active,
                id,
            ),
        )?;
        if 0 == changed {
            return Err(Error::NotFound("no such domain"));
        }

        let domain = txn.query_row(
            "SELECT * FROM `domains` WHERE `id` = ?",
            (id,),
            Domain::from_row,
        )?;
        txn.commit()?;
        Ok(domain)
    }

    /// Deletes a domain, refusing while any active inbox still references
    /// it. Cascading through live inboxes is an administrative decision
    /// made elsewhere, not something this layer does implicitly.
    pub fn delete_domain(&self, id: DomainId) -> Result<(), Error> {
        let mut cxn = self.db()?;
        let txn = cxn.transaction()?;

        let active_inboxes = txn.query_row(
            "SELECT COUNT(*) FROM `inboxes` \
             WHERE `domain_id` = ? AND `status` = 'active'",
            (id,),
            from_single::<i64>,
        )?;
        if active_inboxes > 0 {
            return Err(Error::Conflict(format!(
                "{} active inboxes still reference this domain",
                active_inboxes
            )));
        }

        let changed =
            txn.execute("DELETE FROM `domains` WHERE `id` = ?", (id,))?;
        if 0 == changed {
            return Err(Error::NotFound("no such domain"));
        }

        txn.commit()?;
        Ok(())
    }

    pub fn active_domains(&self) -> Result<Vec<Domain>, Error> {
        self.db()?
            .prepare(
                "SELECT * FROM `domains` WHERE `active` ORDER BY `id`",
            )?
            .query_map((), Domain::from_row)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// The lower-cased names of active local domains, for the SMTP
    /// receiver's RCPT gate.
    pub fn active_local_domains(&self) -> Result<Vec<String>, Error> {
        self.db()?
            .prepare(
                "SELECT lower(`domain`) FROM `domains` \
                 WHERE `active` AND `is_local`",
            )?
            .query_map((), from_single::<String>)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    // ------------------------------------------------------------------
    // Audit and bookkeeping

    /// Appends an audit event. Never fails the caller: a broken audit
    /// trail is logged and swallowed so the originating request proceeds.
    pub fn audit(
        &self,
        event: &str,
        inbox_id: Option<InboxId>,
        actor: &str,
        metadata: serde_json::Value,
    ) {
        let result = self.db().and_then(|cxn| {
            cxn.execute(
                "INSERT INTO `audit_logs` (\
                   `event`, `inbox_id`, `actor`, `metadata`, `created_at`\
                 ) VALUES (?, ?, ?, ?, ?)",
                (
                    event,
                    inbox_id,
                    actor,
                    metadata.to_string(),
                    UnixTimestamp::now(),
                ),
            )
            .map_err(Into::into)
        });

        if let Err(e) = result {
            error!("Failed to write audit event {}: {}", event, e);
        }
    }

    pub fn record_bulk_generation(
        &self,
        requested: i64,
        created: i64,
        actor: &str,
    ) -> Result<(), Error> {
        self.db()?.execute(
            "INSERT INTO `bulk_generations` (\
               `requested`, `created`, `actor`, `created_at`\
             ) VALUES (?, ?, ?, ?)",
            (requested, created, actor, UnixTimestamp::now()),
        )?;
        Ok(())
    }

    /// `(email, sealed password)` of every active generated inbox, for the
    /// admin export.
    pub fn export_generated(&self) -> Result<Vec<(String, String)>, Error> {
        self.db()?
            .prepare(
                "SELECT `email`, `password_enc` FROM `inboxes` \
                 WHERE `inbox_type` = 'generated' AND `status` = 'active' \
                 ORDER BY `id`",
            )?
            .query_map((), from_row::<(String, String)>)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    pub fn stats(&self) -> Result<StoreStats, Error> {
        let cxn = self.db()?;
        let count = |sql: &str| -> Result<i64, Error> {
            cxn.query_row(sql, (), from_single::<i64>).map_err(Into::into)
        };

        Ok(StoreStats {
            inboxes_active: count(
                "SELECT COUNT(*) FROM `inboxes` WHERE `status` = 'active'",
            )?,
            inboxes_deleted: count(
                "SELECT COUNT(*) FROM `inboxes` WHERE `status` = 'deleted'",
            )?,
            inboxes_external: count(
                "SELECT COUNT(*) FROM `inboxes` \
                 WHERE `inbox_type` = 'external'",
            )?,
            inboxes_generated: count(
                "SELECT COUNT(*) FROM `inboxes` \
                 WHERE `inbox_type` = 'generated'",
            )?,
            messages: count("SELECT COUNT(*) FROM `messages`")?,
            attachments: count("SELECT COUNT(*) FROM `attachments`")?,
            tokens_active: count(
                "SELECT COUNT(*) FROM `tokens` WHERE `status` = 'active'",
            )?,
            tokens_revoked: count(
                "SELECT COUNT(*) FROM `tokens` WHERE `status` = 'revoked'",
            )?,
            tokens_expired: count(
                "SELECT COUNT(*) FROM `tokens` WHERE `status` = 'expired'",
            )?,
            domains: count("SELECT COUNT(*) FROM `domains`")?,
            bulk_generations: count(
                "SELECT COUNT(*) FROM `bulk_generations`",
            )?,
        })
    }
}

/// Brings `briefbox.sqlite` up to the latest schema version.
///
/// Progress is one `schema_version` row per applied batch; since versions
/// are contiguous, the row count tells us where to resume. Everything
/// (including the bookkeeping inserts) runs inside one exclusive
/// transaction, so a crashed upgrade leaves the previous version intact.
fn upgrade_schema(cxn: &mut rusqlite::Connection) -> Result<(), Error> {
    let txn = cxn
        .transaction_with_behavior(rusqlite::TransactionBehavior::Exclusive)?;
    txn.execute(
        "CREATE TABLE IF NOT EXISTS `schema_version` (\
         `version` INTEGER NOT NULL PRIMARY KEY, \
         `applied_at` INTEGER NOT NULL\
         ) STRICT",
        (),
    )?;

    let applied = txn.query_row(
        "SELECT COUNT(*) FROM `schema_version`",
        (),
        from_single::<usize>,
    )?;

    for (ix, batch) in SCHEMA.iter().enumerate().skip(applied) {
        let version = ix + 1;
        info!("Upgrading message store to schema v{}", version);
        txn.execute_batch(batch)?;
        txn.execute(
            "INSERT INTO `schema_version` (`version`, `applied_at`) \
             VALUES (?, ?)",
            (version, UnixTimestamp::now()),
        )?;
    }

    txn.commit()?;
    Ok(())
}

fn insert_token(
    txn: &rusqlite::Transaction<'_>,
    inbox_id: InboxId,
    token_hash: &str,
    expires_at: UnixTimestamp,
    issued_to: &str,
) -> Result<Token, Error> {
    txn.execute(
        "INSERT INTO `tokens` (\
           `inbox_id`, `token_hash`, `status`, `expires_at`, `issued_to`, \
           `created_at`\
         ) VALUES (?, ?, ?, ?, ?, ?)",
        (
            inbox_id,
            token_hash,
            TokenStatus::Active,
            expires_at,
            issued_to,
            UnixTimestamp::now(),
        ),
    )?;

    let id = TokenId(txn.last_insert_rowid());
    txn.query_row(
        "SELECT * FROM `tokens` WHERE `id` = ?",
        (id,),
        Token::from_row,
    )
    .map_err(Into::into)
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredMessage> {
    let recipients: String = row.get("recipients")?;
    let headers: String = row.get("headers")?;

    Ok(StoredMessage {
        id: row.get("id")?,
        inbox_id: row.get("inbox_id")?,
        uid: row.get("uid")?,
        message_id: row.get("message_id")?,
        sender: row.get("sender")?,
        recipients: serde_json::from_str(&recipients).unwrap_or_default(),
        subject: row.get("subject")?,
        body_text: row.get("body_text")?,
        body_html: row.get("body_html")?,
        headers: serde_json::from_str::<BTreeMap<String, String>>(&headers)
            .unwrap_or_default(),
        size_bytes: row.get("size_bytes")?,
        received_at: row.get("received_at")?,
        fetched_at: row.get("fetched_at")?,
        attachments: Vec::new(),
    })
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;
    use crate::mime::ParsedAttachment;

    fn test_db() -> (TempDir, MailDb) {
        let tmpdir = TempDir::new().unwrap();
        let db = MailDb::new(&tmpdir.path().join("briefbox.sqlite")).unwrap();
        (tmpdir, db)
    }

    fn test_inbox(db: &MailDb) -> Inbox {
        db.create_inbox(&NewInbox {
            email: "alice@example.org".to_owned(),
            inbox_type: InboxType::External,
            pop3_host: Some("pop.example.org".to_owned()),
            pop3_port: Some(995),
            pop3_tls: true,
            username_enc: "sealed-user".to_owned(),
            password_enc: "sealed-pass".to_owned(),
            domain_id: None,
            created_by: "198.51.100.7".to_owned(),
            ttl_secs: 600,
        })
        .unwrap()
    }

    fn test_message(uid: &str, attachments: usize) -> ParsedMessage {
        ParsedMessage {
            uid: uid.to_owned(),
            message_id: Some(format!("<{}@example.org>", uid)),
            sender: "bob@example.com".to_owned(),
            recipients: vec![Recipient {
                address: "alice@example.org".to_owned(),
                name: None,
            }],
            subject: format!("hello {}", uid),
            body_text: "hi".to_owned(),
            body_html: String::new(),
            headers: Default::default(),
            size_bytes: 120,
            received_at: None,
            attachments: (0..attachments)
                .map(|n| ParsedAttachment {
                    filename: format!("file{}.bin", n),
                    content_type: "application/octet-stream".to_owned(),
                    size_bytes: 3,
                    content_id: None,
                    checksum: "0".repeat(64),
                    content: vec![1, 2, 3],
                })
                .collect(),
        }
    }

    #[test]
    fn reopening_the_store_keeps_data_and_schema() {
        let tmpdir = TempDir::new().unwrap();
        let path = tmpdir.path().join("briefbox.sqlite");

        let db = MailDb::new(&path).unwrap();
        let inbox = test_inbox(&db);
        drop(db);

        // The second open finds the schema already applied and resumes
        // cleanly.
        let db = MailDb::new(&path).unwrap();
        assert_eq!(
            "alice@example.org",
            db.fetch_inbox(inbox.id).unwrap().email
        );
    }

    #[test]
    fn create_and_fetch_inbox() {
        let (_tmpdir, db) = test_db();
        let inbox = test_inbox(&db);

        let fetched = db.fetch_inbox(inbox.id).unwrap();
        assert_eq!("alice@example.org", fetched.email);
        assert_eq!(InboxStatus::Active, fetched.status);
        assert_eq!(None, fetched.last_seen_uid);

        assert_matches!(
            Err(Error::NotFound(..)),
            db.fetch_inbox(InboxId(9999))
        );
    }

    #[test]
    fn email_lookup_is_case_insensitive() {
        let (_tmpdir, db) = test_db();
        let inbox = test_inbox(&db);

        let found = db
            .find_active_inbox_by_email("ALICE@Example.ORG")
            .unwrap()
            .unwrap();
        assert_eq!(inbox.id, found.id);

        assert!(db
            .find_active_inbox_by_email("nobody@example.org")
            .unwrap()
            .is_none());
    }

    #[test]
    fn ingestion_is_idempotent() {
        let (_tmpdir, db) = test_db();
        let inbox = test_inbox(&db);

        let batch = vec![test_message("u1", 1), test_message("u2", 0)];
        let first = db.insert_messages(inbox.id, &batch).unwrap();
        assert_eq!(IngestOutcome { inserted: 2, skipped: 0 }, first);

        let second = db.insert_messages(inbox.id, &batch).unwrap();
        assert_eq!(IngestOutcome { inserted: 0, skipped: 2 }, second);

        let messages = db.list_messages(inbox.id, None, 100).unwrap();
        assert_eq!(2, messages.len());
        assert_eq!(1, messages[0].attachments.len());
        assert!(messages[1].attachments.is_empty());
    }

    #[test]
    fn fetched_at_is_strictly_monotonic() {
        let (_tmpdir, db) = test_db();
        let inbox = test_inbox(&db);

        db.insert_messages(
            inbox.id,
            &[test_message("a", 0), test_message("b", 0)],
        )
        .unwrap();
        db.insert_messages(inbox.id, &[test_message("c", 0)]).unwrap();

        let messages = db.list_messages(inbox.id, None, 100).unwrap();
        let stamps = messages
            .iter()
            .map(|m| m.fetched_at.as_millis())
            .collect::<Vec<_>>();
        assert!(
            stamps.windows(2).all(|w| w[0] < w[1]),
            "not monotonic: {:?}",
            stamps
        );
    }

    #[test]
    fn cursor_read_pages_forward() {
        let (_tmpdir, db) = test_db();
        let inbox = test_inbox(&db);

        db.insert_messages(
            inbox.id,
            &[
                test_message("u1", 0),
                test_message("u2", 0),
                test_message("u3", 0),
            ],
        )
        .unwrap();

        let after_u1 =
            db.list_messages(inbox.id, Some("u1"), 100).unwrap();
        assert_eq!(
            vec!["u2", "u3"],
            after_u1.iter().map(|m| m.uid.as_str()).collect::<Vec<_>>()
        );

        // Unknown cursor falls back to the first page.
        let unknown =
            db.list_messages(inbox.id, Some("never-seen"), 2).unwrap();
        assert_eq!(
            vec!["u1", "u2"],
            unknown.iter().map(|m| m.uid.as_str()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn conditional_cursor_advance() {
        let (_tmpdir, db) = test_db();
        let inbox = test_inbox(&db);

        assert!(db.advance_last_seen_uid(inbox.id, None, "u5").unwrap());
        assert_eq!(
            Some("u5".to_owned()),
            db.fetch_inbox(inbox.id).unwrap().last_seen_uid
        );

        // A job that observed the old cursor value loses quietly.
        assert!(!db.advance_last_seen_uid(inbox.id, None, "u3").unwrap());
        assert!(db
            .advance_last_seen_uid(inbox.id, Some("u5"), "u9")
            .unwrap());
        assert_eq!(
            Some("u9".to_owned()),
            db.fetch_inbox(inbox.id).unwrap().last_seen_uid
        );
    }

    #[test]
    fn token_lifecycle() {
        let (_tmpdir, db) = test_db();
        let inbox = test_inbox(&db);
        let expires = UnixTimestamp::from_millis(
            UnixTimestamp::now().as_millis() + 600_000,
        )
        .unwrap();

        let t1 = db
            .create_token(inbox.id, "hash-1", expires, "198.51.100.7")
            .unwrap();
        assert_eq!(TokenStatus::Active, t1.status);

        let (found, inbox_status) =
            db.lookup_token("hash-1").unwrap().unwrap();
        assert_eq!(t1.id, found.id);
        assert_eq!(InboxStatus::Active, inbox_status);
        assert!(db.lookup_token("hash-nope").unwrap().is_none());

        let t2 = db
            .rotate_token(inbox.id, "hash-2", expires, "198.51.100.7")
            .unwrap();
        let (old, _) = db.lookup_token("hash-1").unwrap().unwrap();
        assert_eq!(TokenStatus::Revoked, old.status);
        assert!(old.revoked_at.is_some());
        let (new, _) = db.lookup_token("hash-2").unwrap().unwrap();
        assert_eq!(TokenStatus::Active, new.status);
        assert_eq!(t2.id, new.id);
    }

    #[test]
    fn sweep_marks_only_expired_active_tokens() {
        let (_tmpdir, db) = test_db();
        let inbox = test_inbox(&db);
        let past = UnixTimestamp::from_millis(1_000).unwrap();
        let future = UnixTimestamp::from_millis(
            UnixTimestamp::now().as_millis() + 600_000,
        )
        .unwrap();

        db.create_token(inbox.id, "hash-old", past, "ip").unwrap();
        db.create_token(inbox.id, "hash-new", future, "ip").unwrap();

        assert_eq!(1, db.sweep_expired_tokens().unwrap());
        assert_eq!(0, db.sweep_expired_tokens().unwrap());

        let (old, _) = db.lookup_token("hash-old").unwrap().unwrap();
        assert_eq!(TokenStatus::Expired, old.status);
        let (new, _) = db.lookup_token("hash-new").unwrap().unwrap();
        assert_eq!(TokenStatus::Active, new.status);
    }

    #[test]
    fn delete_inbox_cascades() {
        let (_tmpdir, db) = test_db();
        let inbox = test_inbox(&db);
        let expires = UnixTimestamp::from_millis(
            UnixTimestamp::now().as_millis() + 600_000,
        )
        .unwrap();
        db.create_token(inbox.id, "hash-1", expires, "ip").unwrap();
        db.insert_messages(
            inbox.id,
            &[test_message("u1", 1), test_message("u2", 1)],
        )
        .unwrap();

        db.delete_inbox(inbox.id).unwrap();

        assert!(db.list_messages(inbox.id, None, 100).unwrap().is_empty());
        let gone = db.fetch_inbox(inbox.id).unwrap();
        assert_eq!(InboxStatus::Deleted, gone.status);
        assert_eq!("", gone.username_enc);
        assert_eq!("", gone.password_enc);
        assert!(gone.deleted_at.is_some());

        let (token, inbox_status) =
            db.lookup_token("hash-1").unwrap().unwrap();
        assert_eq!(TokenStatus::Revoked, token.status);
        assert_eq!(InboxStatus::Deleted, inbox_status);

        let stats = db.stats().unwrap();
        assert_eq!(0, stats.messages);
        assert_eq!(0, stats.attachments);
    }

    #[test]
    fn attachment_download_is_scoped() {
        let (_tmpdir, db) = test_db();
        let inbox = test_inbox(&db);
        db.insert_messages(inbox.id, &[test_message("u1", 1)]).unwrap();

        let listed = db.list_messages(inbox.id, None, 10).unwrap();
        let attachment_id = listed[0].attachments[0].id;

        let content =
            db.fetch_attachment(inbox.id, "u1", attachment_id).unwrap();
        assert_eq!(vec![1, 2, 3], content.content);
        assert_eq!("file0.bin", content.meta.filename);

        // Wrong message UID, wrong inbox: both invisible.
        assert_matches!(
            Err(Error::NotFound(..)),
            db.fetch_attachment(inbox.id, "u2", attachment_id)
        );
        assert_matches!(
            Err(Error::NotFound(..)),
            db.fetch_attachment(InboxId(999), "u1", attachment_id)
        );
    }

    #[test]
    fn domain_crud_and_delete_guard() {
        let (_tmpdir, db) = test_db();

        let domain = db
            .create_domain(&NewDomain {
                domain: "temp.example".to_owned(),
                pop3_host: None,
                pop3_port: None,
                pop3_tls: true,
                is_local: true,
                active: true,
            })
            .unwrap();

        assert_matches!(
            Err(Error::Conflict(..)),
            db.create_domain(&NewDomain {
                domain: "temp.example".to_owned(),
                pop3_host: None,
                pop3_port: None,
                pop3_tls: true,
                is_local: true,
                active: true,
            })
        );

        assert_eq!(
            vec!["temp.example".to_owned()],
            db.active_local_domains().unwrap()
        );

        db.create_inbox(&NewInbox {
            email: "gen1@temp.example".to_owned(),
            inbox_type: InboxType::Generated,
            pop3_host: None,
            pop3_port: None,
            pop3_tls: true,
            username_enc: "u".to_owned(),
            password_enc: "p".to_owned(),
            domain_id: Some(domain.id),
            created_by: "ip".to_owned(),
            ttl_secs: 600,
        })
        .unwrap();

        assert_matches!(
            Err(Error::Conflict(..)),
            db.delete_domain(domain.id)
        );

        let inbox =
            db.find_active_inbox_by_email("gen1@temp.example").unwrap();
        db.delete_inbox(inbox.unwrap().id).unwrap();
        db.delete_domain(domain.id).unwrap();
        assert!(db.list_domains().unwrap().is_empty());
    }

    #[test]
    fn audit_failures_do_not_propagate() {
        let (_tmpdir, db) = test_db();
        // Just exercises the swallow path indirectly: a valid write.
        db.audit(
            "inbox.create",
            None,
            "198.51.100.7",
            serde_json::json!({"mode": "generated"}),
        );
    }

    #[test]
    fn export_lists_only_active_generated() {
        let (_tmpdir, db) = test_db();
        let _external = test_inbox(&db);
        db.create_inbox(&NewInbox {
            email: "gen@temp.example".to_owned(),
            inbox_type: InboxType::Generated,
            pop3_host: None,
            pop3_port: None,
            pop3_tls: true,
            username_enc: "sealed-u".to_owned(),
            password_enc: "sealed-p".to_owned(),
            domain_id: None,
            created_by: "ip".to_owned(),
            ttl_secs: 600,
        })
        .unwrap();

        let exported = db.export_generated().unwrap();
        assert_eq!(
            vec![("gen@temp.example".to_owned(), "sealed-p".to_owned())],
            exported
        );
    }
}
