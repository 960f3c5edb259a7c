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

//! The authenticated-request state machine, the admin-key check, and the
//! per-IP creation rate limiter.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::crypt;
use crate::store::maildb::MailDb;
use crate::store::types::{InboxId, InboxStatus, TokenStatus, UnixTimestamp};
use crate::support::error::Error;

/// Runs the bearer-token state machine for one request.
///
/// Order matters and each rejection is distinct: missing header, unknown
/// hash, non-active token, wire-expired token (in case the sweep lags),
/// inactive inbox, and finally the path-id check. On success the caller
/// gets the inbox the token is bound to.
pub fn authenticate(
    db: &MailDb,
    authorization: Option<&str>,
    path_inbox_id: InboxId,
) -> Result<InboxId, Error> {
    let raw = authorization
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .ok_or(Error::Authentication("missing bearer token"))?;

    let (token, inbox_status) = db
        .lookup_token(&crypt::hash_token(raw))?
        .ok_or(Error::Authentication("unknown token"))?;

    match token.status {
        TokenStatus::Active => (),
        TokenStatus::Revoked => {
            return Err(Error::Authentication("token revoked"))
        },
        TokenStatus::Expired => {
            return Err(Error::Authentication("token expired"))
        },
    }

    if token.expires_at < UnixTimestamp::now() {
        return Err(Error::Authentication("token expired"));
    }

    if InboxStatus::Active != inbox_status {
        return Err(Error::Authorization("inbox is not active"));
    }

    if token.inbox_id != path_inbox_id {
        return Err(Error::Authorization("token does not grant this inbox"));
    }

    Ok(token.inbox_id)
}

/// Validates `X-Admin-Key` against the configured shared secret in constant
/// time.
pub fn require_admin(
    configured: &str,
    presented: Option<&str>,
) -> Result<(), Error> {
    let presented =
        presented.ok_or(Error::Authentication("missing admin key"))?;
    if crypt::constant_time_eq(configured, presented) {
        Ok(())
    } else {
        Err(Error::Authentication("bad admin key"))
    }
}

/// Fixed-window per-IP counter for the unauthenticated creation endpoint.
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    hits: Mutex<HashMap<IpAddr, (Instant, u32)>>,
}

impl RateLimiter {
    pub fn new(limit: u32, window: Duration) -> Self {
        RateLimiter {
            limit,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, ip: IpAddr) -> Result<(), Error> {
        let now = Instant::now();
        let mut hits = self.hits.lock().unwrap();

        // Opportunistic cleanup keeps the map from growing with one entry
        // per address ever seen.
        if hits.len() > 1024 {
            let window = self.window;
            hits.retain(|_, (start, _)| now.duration_since(*start) < window);
        }

        let entry = hits.entry(ip).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 0);
        }

        if entry.1 >= self.limit {
            return Err(Error::RateLimited);
        }
        entry.1 += 1;
        Ok(())
    }
}
