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

//! Daemon lifecycle: build the process-wide services once, in dependency
//! order, then tear them down in reverse on the shutdown signal.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use log::{error, info, warn};
use tokio::net::TcpListener;

use crate::api::routes::{self, ApiState};
use crate::crypt::MasterKey;
use crate::fetch::FetchQueue;
use crate::pop3::pool::Pop3Pool;
use crate::smtp;
use crate::store::domain_cache::{self, DomainCache};
use crate::store::maildb::MailDb;
use crate::support::system_config::SystemConfig;

macro_rules! fatal {
    ($($stuff:tt)*) => {{
        error!($($stuff)*);
        // EX_OSERR: the process cannot come up.
        std::process::exit(71)
    }}
}

#[tokio::main]
pub async fn serve(config: SystemConfig) {
    if let Err(e) = fs::create_dir_all(&config.general.data_dir) {
        fatal!(
            "Cannot create data dir '{}': {}",
            config.general.data_dir.display(),
            e
        );
    }

    // Storage first; everything hangs off it.
    let db = match MailDb::new(
        &config.general.data_dir.join("briefbox.sqlite"),
    ) {
        Ok(db) => db,
        Err(e) => fatal!("Cannot open database: {}", e),
    };

    let master_key = MasterKey::from_config(&config.security.master_key);

    let domains = match DomainCache::new(db.clone()) {
        Ok(cache) => Arc::new(cache),
        Err(e) => fatal!("Cannot prime the local-domain cache: {}", e),
    };
    let domain_refresher =
        tokio::spawn(domain_cache::refresh_task(Arc::clone(&domains)));

    let pool = Arc::new(Pop3Pool::new(config.pop3.clone()));
    let fetch_queue = FetchQueue::spawn(
        db.clone(),
        Arc::clone(&pool),
        master_key.clone(),
        config.pop3.max_fetch,
        config.limits.max_attachment_bytes,
    );

    let token_sweeper = tokio::spawn(token_sweep(
        db.clone(),
        Duration::from_secs(config.tokens.sweep_interval_secs),
    ));

    // The ingestion surfaces come up before the HTTP surface so a caller
    // that sees the API never races a half-started receiver.
    let smtp_server = if config.smtp.enabled {
        let listener = match TcpListener::bind(&config.smtp.listen).await {
            Ok(listener) => listener,
            Err(e) => {
                fatal!("Cannot bind SMTP on {}: {}", config.smtp.listen, e)
            },
        };
        info!("SMTP receiver listening on {}", config.smtp.listen);
        Some(tokio::spawn(smtp::inbound::serve(
            listener,
            config.smtp.clone(),
            db.clone(),
            Arc::clone(&domains),
            config.limits.max_attachment_bytes,
        )))
    } else {
        info!("SMTP receiver disabled by configuration");
        None
    };

    let api_listener = match TcpListener::bind(&config.api.listen).await {
        Ok(listener) => listener,
        Err(e) => fatal!("Cannot bind API on {}: {}", config.api.listen, e),
    };
    info!("HTTP API listening on {}", config.api.listen);

    let state = Arc::new(ApiState::new(
        config.general.environment,
        &config.api,
        config.tokens.clone(),
        config.security.admin_key.clone(),
        db.clone(),
        fetch_queue,
        master_key,
    ));
    let api_server = tokio::spawn(routes::serve(
        api_listener,
        config.api.max_body_bytes,
        state,
    ));

    // SIGINT for the terminal, SIGTERM for service managers; either one
    // starts the same teardown.
    let mut sigterm = match tokio::signal::unix::signal(
        tokio::signal::unix::SignalKind::terminate(),
    ) {
        Ok(sigterm) => sigterm,
        Err(e) => fatal!("Cannot install SIGTERM handler: {}", e),
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("SIGINT received, shutting down"),
            Err(e) => warn!("Cannot wait for shutdown signal: {}", e),
        },
        _ = sigterm.recv() => info!("SIGTERM received, shutting down"),
    }

    // Reverse order of initialisation: receivers stop taking work before
    // the services they feed go away. The DB pool drops last, with `db`.
    if let Some(smtp_server) = smtp_server {
        smtp_server.abort();
    }
    api_server.abort();
    token_sweeper.abort();
    domain_refresher.abort();

    info!("Briefbox stopped");
}

/// Marks active-but-expired tokens on a fixed cadence. Failures are logged,
/// never escalated; the request path enforces expiry on its own.
async fn token_sweep(db: MailDb, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        match db.sweep_expired_tokens() {
            Ok(0) => (),
            Ok(swept) => info!("Token sweep expired {} tokens", swept),
            Err(e) => warn!("Token sweep failed: {}", e),
        }
    }
}
