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

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{info, warn};

use super::maildb::MailDb;
use crate::support::error::Error;

/// Refresh cadence for the local-domain set.
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(60);

/// In-memory set of active local domains, consulted on every RCPT TO.
///
/// The set is read-mostly: lookups take a cheap read lock on an `Arc` that
/// is swapped wholesale on refresh, so a slow refresh never blocks the SMTP
/// hot path on the database.
pub struct DomainCache {
    db: MailDb,
    domains: RwLock<Arc<HashSet<String>>>,
}

impl DomainCache {
    /// Builds the cache with an initial load from the store.
    pub fn new(db: MailDb) -> Result<Self, Error> {
        let initial = Self::load(&db)?;
        info!("Local-domain cache primed with {} domains", initial.len());
        Ok(DomainCache {
            db,
            domains: RwLock::new(Arc::new(initial)),
        })
    }

    /// Whether `domain` (any case) is an active local domain.
    pub fn contains(&self, domain: &str) -> bool {
        let current = Arc::clone(&self.domains.read().unwrap());
        current.contains(&domain.to_lowercase())
    }

    /// Re-reads the set from the store and swaps it in. Failures leave the
    /// previous set in place.
    pub fn refresh(&self) {
        match Self::load(&self.db) {
            Ok(fresh) => {
                *self.domains.write().unwrap() = Arc::new(fresh);
            },
            Err(e) => {
                warn!("Local-domain cache refresh failed: {}", e);
            },
        }
    }

    fn load(db: &MailDb) -> Result<HashSet<String>, Error> {
        Ok(db.active_local_domains()?.into_iter().collect())
    }
}

/// Periodically refreshes `cache` until the task is aborted.
pub async fn refresh_task(cache: Arc<DomainCache>) {
    let mut interval = tokio::time::interval(REFRESH_INTERVAL);
    interval.tick().await; // the constructor already primed the cache
    loop {
        interval.tick().await;
        cache.refresh();
    }
}

#[cfg(test)]
mod test {
    use tempfile::TempDir;

    use super::*;
    use crate::store::types::NewDomain;

    #[test]
    fn refresh_picks_up_new_domains() {
        let tmpdir = TempDir::new().unwrap();
        let db = MailDb::new(&tmpdir.path().join("briefbox.sqlite")).unwrap();
        let cache = DomainCache::new(db.clone()).unwrap();

        assert!(!cache.contains("temp.example"));

        db.create_domain(&NewDomain {
            domain: "Temp.Example".to_owned(),
            pop3_host: None,
            pop3_port: None,
            pop3_tls: true,
            is_local: true,
            active: true,
        })
        .unwrap();

        // Not visible until a refresh happens.
        assert!(!cache.contains("temp.example"));
        cache.refresh();
        assert!(cache.contains("temp.example"));
        assert!(cache.contains("TEMP.EXAMPLE"));

        // Non-local domains never enter the set.
        db.create_domain(&NewDomain {
            domain: "remote.example".to_owned(),
            pop3_host: Some("pop.remote.example".to_owned()),
            pop3_port: Some(995),
            pop3_tls: true,
            is_local: false,
            active: true,
        })
        .unwrap();
        cache.refresh();
        assert!(!cache.contains("remote.example"));
    }
}
