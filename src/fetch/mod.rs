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

//! The fetch worker: incremental UID-based retrieval into the store.
//!
//! Jobs flow through a bounded queue into a fixed worker pool whose
//! parallelism equals the POP3 connection cap. A job resolves the inbox's
//! sealed credentials, borrows a pooled session, diffs `UIDL` against the
//! cursor, retrieves the new messages, normalizes them, and persists the
//! batch transactionally with `(inbox, uid)` as the idempotency key.
//!
//! The cursor advance is conditional on the value observed at job start,
//! so two interleaved jobs for the same inbox cannot move `last_seen_uid`
//! backwards. Jobs for the same inbox are not coalesced here; callers that
//! need serialization do it themselves.

use std::sync::Arc;

use log::{info, warn};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::crypt::MasterKey;
use crate::mime;
use crate::pop3::client::{Pop3Client, UidlEntry};
use crate::pop3::pool::{Pop3Credentials, Pop3Pool};
use crate::store::maildb::MailDb;
use crate::store::types::{InboxId, InboxStatus};
use crate::support::error::{Error, Pop3ErrorKind};

/// Queue headroom beyond the worker count.
const QUEUE_DEPTH: usize = 64;

#[derive(Debug)]
pub struct FetchJob {
    pub inbox_id: InboxId,
    /// Fetch strictly after this UID. Falls back to the inbox's stored
    /// cursor when absent.
    pub since_uid: Option<String>,
    pub limit: Option<usize>,
    /// Late results must be ignorable: callers may drop the receiver.
    pub done: Option<oneshot::Sender<Result<FetchOutcome, Error>>>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Raw messages actually retrieved this run.
    pub fetched: usize,
    pub inserted: usize,
    pub skipped: usize,
    pub cursor_advanced: bool,
}

struct Shared {
    db: MailDb,
    pool: Arc<Pop3Pool>,
    master_key: MasterKey,
    max_fetch: usize,
    max_attachment_bytes: usize,
}

/// Handle for enqueueing fetch jobs. Clones share the same queue.
#[derive(Clone)]
pub struct FetchQueue {
    tx: mpsc::Sender<FetchJob>,
}

impl FetchQueue {
    /// Spawns the worker pool and returns the queue handle.
    pub fn spawn(
        db: MailDb,
        pool: Arc<Pop3Pool>,
        master_key: MasterKey,
        max_fetch: usize,
        max_attachment_bytes: usize,
    ) -> Self {
        let workers = pool.concurrency();
        let (tx, rx) = mpsc::channel(workers + QUEUE_DEPTH);
        let rx = Arc::new(Mutex::new(rx));
        let shared = Arc::new(Shared {
            db,
            pool,
            master_key,
            max_fetch,
            max_attachment_bytes,
        });

        for worker in 0..workers {
            let rx = Arc::clone(&rx);
            let shared = Arc::clone(&shared);
            tokio::spawn(worker_loop(worker, rx, shared));
        }

        FetchQueue { tx }
    }

    /// Enqueues a job without waiting for its result.
    pub async fn enqueue(&self, job: FetchJob) -> Result<(), Error> {
        self.tx.send(job).await.map_err(|_| {
            std::io::Error::new(
                std::io::ErrorKind::Other,
                "fetch queue is shut down",
            )
            .into()
        })
    }

    /// Enqueues a job and waits for it to finish.
    pub async fn fetch_now(
        &self,
        inbox_id: InboxId,
        since_uid: Option<String>,
        limit: Option<usize>,
    ) -> Result<FetchOutcome, Error> {
        let (done_tx, done_rx) = oneshot::channel();
        self.enqueue(FetchJob {
            inbox_id,
            since_uid,
            limit,
            done: Some(done_tx),
        })
        .await?;

        done_rx.await.map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "fetch worker dropped the job",
            ))
        })?
    }
}

async fn worker_loop(
    worker: usize,
    rx: Arc<Mutex<mpsc::Receiver<FetchJob>>>,
    shared: Arc<Shared>,
) {
    loop {
        let job = rx.lock().await.recv().await;
        let Some(mut job) = job else {
            return;
        };

        let done = job.done.take();
        let result = run_job(&shared, &job).await;
        match result {
            Ok(ref outcome) => info!(
                "fetch[{}] inbox {}: {} fetched, {} inserted, {} skipped",
                worker,
                job.inbox_id.0,
                outcome.fetched,
                outcome.inserted,
                outcome.skipped
            ),
            Err(ref e) => {
                warn!("fetch[{}] inbox {}: {}", worker, job.inbox_id.0, e)
            },
        }

        if let Some(done) = done {
            // The caller may have stopped listening; that is fine.
            let _ = done.send(result);
        }
    }
}

async fn run_job(
    shared: &Shared,
    job: &FetchJob,
) -> Result<FetchOutcome, Error> {
    let inbox = shared.db.fetch_inbox(job.inbox_id)?;
    if InboxStatus::Active != inbox.status {
        return Err(Error::Authorization("inbox is not active"));
    }

    // Locally-delivered inboxes have no provider to pull from; their mail
    // arrives through the SMTP receiver.
    let (host, port) = match (inbox.pop3_host.clone(), inbox.pop3_port) {
        (Some(host), Some(port)) => (host, port),
        _ => return Ok(FetchOutcome::default()),
    };

    let credentials = Pop3Credentials {
        host,
        port,
        tls: inbox.pop3_tls,
        username: decrypt_utf8(&shared.master_key, &inbox.username_enc)?,
        password: decrypt_utf8(&shared.master_key, &inbox.password_enc)?,
    };

    let observed_cursor = inbox.last_seen_uid.clone();
    let since_uid = job.since_uid.clone().or_else(|| observed_cursor.clone());
    let limit = job
        .limit
        .unwrap_or(shared.max_fetch)
        .min(shared.max_fetch);

    let raws = shared
        .pool
        .execute(&credentials, move |client: &mut Pop3Client| {
            let since_uid = since_uid.clone();
            Box::pin(async move {
                let uidl = client.uidl().await?;
                let candidates =
                    candidates_after(&uidl, since_uid.as_deref());
                let take = candidates.len().min(limit);

                let mut raws =
                    Vec::<(String, Vec<u8>)>::with_capacity(take);
                for entry in &candidates[..take] {
                    match client.retr(entry.num).await {
                        Ok(raw) => raws.push((entry.uid.clone(), raw)),
                        // An `-ERR` for one message skips that message; a
                        // dead connection aborts so the pool can retry
                        // with a fresh session.
                        Err(Error::Pop3(ref e))
                            if matches!(
                                e.kind,
                                Pop3ErrorKind::Protocol(..)
                            ) =>
                        {
                            warn!(
                                "skipping message {} ({})",
                                entry.uid, e
                            );
                        },
                        Err(e) => return Err(e),
                    }
                }

                Ok(raws)
            })
        })
        .await?;

    let mut outcome = FetchOutcome {
        fetched: raws.len(),
        ..FetchOutcome::default()
    };
    if raws.is_empty() {
        return Ok(outcome);
    }

    let parsed = raws
        .iter()
        .map(|(uid, raw)| {
            mime::normalize(raw, uid, shared.max_attachment_bytes)
        })
        .collect::<Vec<_>>();

    let ingest = shared.db.insert_messages(job.inbox_id, &parsed)?;
    outcome.inserted = ingest.inserted;
    outcome.skipped = ingest.skipped;

    // The provider's UIDL ordering is the authority for the new cursor.
    let last_uid = &raws[raws.len() - 1].0;
    outcome.cursor_advanced = shared.db.advance_last_seen_uid(
        job.inbox_id,
        observed_cursor.as_deref(),
        last_uid,
    )?;
    if !outcome.cursor_advanced {
        info!(
            "inbox {}: cursor moved concurrently; leaving it alone",
            job.inbox_id.0
        );
    }

    Ok(outcome)
}

fn decrypt_utf8(key: &MasterKey, blob: &str) -> Result<String, Error> {
    String::from_utf8(key.decrypt(blob)?)
        .map_err(|_| Error::Encryption("credential is not UTF-8"))
}

/// The suffix of `uidl` strictly after `since`, or the whole listing when
/// the cursor is absent or unknown (initial fetch, or the provider reset
/// its UIDs).
fn candidates_after<'a>(
    uidl: &'a [UidlEntry],
    since: Option<&str>,
) -> &'a [UidlEntry] {
    match since.and_then(|since| {
        uidl.iter().position(|entry| entry.uid == since)
    }) {
        Some(position) => &uidl[position + 1..],
        None => uidl,
    }
}
