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

//! The POP3 connection pool: a concurrency cap with a strict FIFO wait
//! queue, a retry loop with exponential backoff, and a per-host throttle.
//!
//! `execute()` is the single entry point. Each attempt opens a fresh
//! connection; sockets are never reused across attempts. When a provider
//! signals rate-limiting, the host is throttled for a fixed window and
//! every `execute()` against it fast-fails without opening a socket or
//! consuming a queue slot.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use log::{info, warn};
use tokio::sync::Semaphore;

use super::client::Pop3Client;
use crate::support::error::{Error, Pop3Error, Pop3ErrorKind};
use crate::support::system_config::Pop3Config;

/// Connection coordinates plus decrypted credentials for one mailbox.
///
/// Lives only as long as the operation needs it; the sealed form stays in
/// the store.
#[derive(Clone)]
pub struct Pop3Credentials {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: String,
    pub password: String,
}

pub struct Pop3Pool {
    config: Pop3Config,
    /// Fair semaphore: over-cap callers park FIFO and wake oldest-first.
    slots: Semaphore,
    throttled_until: Mutex<HashMap<String, Instant>>,
}

impl Pop3Pool {
    pub fn new(config: Pop3Config) -> Self {
        let slots = Semaphore::new(config.max_connections);
        Pop3Pool {
            config,
            slots,
            throttled_until: Mutex::new(HashMap::new()),
        }
    }

    /// The fetch-worker parallelism is tied to the connection cap.
    pub fn concurrency(&self) -> usize {
        self.config.max_connections
    }

    /// Runs `op` against an authenticated session, retrying with
    /// exponential backoff on POP3-level failures.
    ///
    /// The slot is held for the whole attempt sequence. Errors that are not
    /// POP3 failures (e.g. the operation's own storage errors) abort
    /// immediately; they are not the provider's fault and retrying would
    /// just burn connections.
    pub async fn execute<T, F>(
        &self,
        credentials: &Pop3Credentials,
        mut op: F,
    ) -> Result<T, Error>
    where
        F: for<'a> FnMut(&'a mut Pop3Client) -> BoxFuture<'a, Result<T, Error>>,
    {
        self.check_throttle(&credentials.host)?;

        let _permit = self.slots.acquire().await.map_err(|_| {
            io::Error::new(io::ErrorKind::Other, "POP3 pool is shut down")
        })?;

        let mut last_error = None;
        for attempt in 1..=self.config.max_retries.max(1) {
            if attempt > 1 {
                let backoff = Duration::from_millis(
                    self.config.retry_base_ms << (attempt - 2),
                );
                tokio::time::sleep(backoff).await;
            }

            match self.attempt(credentials, &mut op).await {
                Ok(value) => return Ok(value),
                Err(Error::Pop3(e)) => {
                    warn!(
                        "POP3 {}:{} attempt {}/{} failed: {}",
                        credentials.host,
                        credentials.port,
                        attempt,
                        self.config.max_retries,
                        e
                    );

                    if e.looks_like_throttle() {
                        self.set_throttle(&credentials.host);
                        return Err(Error::Pop3(e));
                    }
                    last_error = Some(e);
                },
                Err(e) => return Err(e),
            }
        }

        Err(Error::Pop3(last_error.unwrap_or_else(|| {
            Pop3Error::new(
                "CONNECT",
                Pop3ErrorKind::Transport("no attempts made".to_owned()),
            )
        })))
    }

    async fn attempt<T, F>(
        &self,
        credentials: &Pop3Credentials,
        op: &mut F,
    ) -> Result<T, Error>
    where
        F: for<'a> FnMut(&'a mut Pop3Client) -> BoxFuture<'a, Result<T, Error>>,
    {
        let mut client = Pop3Client::connect(
            &credentials.host,
            credentials.port,
            credentials.tls,
            Duration::from_secs(self.config.connect_timeout_secs),
            Duration::from_secs(self.config.command_timeout_secs),
        )
        .await?;
        client
            .login(&credentials.username, &credentials.password)
            .await?;

        let result = op(&mut client).await;
        // Best effort; a failed QUIT just drops the socket, which is where
        // it was headed anyway.
        let _ = client.quit().await;
        result
    }

    fn check_throttle(&self, host: &str) -> Result<(), Error> {
        let mut throttled = self.throttled_until.lock().unwrap();
        match throttled.get(host) {
            Some(&until) if Instant::now() < until => {
                Err(Error::Pop3(Pop3Error::new(
                    "CONNECT",
                    Pop3ErrorKind::Throttled,
                )))
            },
            Some(_) => {
                throttled.remove(host);
                Ok(())
            },
            None => Ok(()),
        }
    }

    fn set_throttle(&self, host: &str) {
        let window = Duration::from_secs(self.config.throttle_window_secs);
        info!(
            "Throttling POP3 host {} for {}s",
            host, self.config.throttle_window_secs
        );
        self.throttled_until
            .lock()
            .unwrap()
            .insert(host.to_owned(), Instant::now() + window);
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::super::testserver::{MockMailbox, MockServer};
    use super::*;

    fn rt() -> tokio::runtime::Runtime {
        crate::init_test_log();
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn test_config(overrides: impl FnOnce(&mut Pop3Config)) -> Pop3Config {
        let mut config = Pop3Config {
            max_connections: 2,
            max_retries: 3,
            retry_base_ms: 10,
            throttle_window_secs: 1,
            connect_timeout_secs: 5,
            command_timeout_secs: 5,
            max_fetch: 50,
        };
        overrides(&mut config);
        config
    }

    fn credentials(server: &MockServer) -> Pop3Credentials {
        Pop3Credentials {
            host: "127.0.0.1".to_owned(),
            port: server.port(),
            tls: false,
            username: "alice".to_owned(),
            password: "hunter2".to_owned(),
        }
    }

    #[test]
    fn execute_runs_op_against_authenticated_session() {
        rt().block_on(async {
            let server = MockServer::spawn(MockMailbox::with_messages(vec![
                ("u1", "Subject: hi\r\n\r\nhello\r\n"),
            ]))
            .await;
            let pool = Pop3Pool::new(test_config(|_| ()));

            let uids = pool
                .execute(&credentials(&server), |client: &mut Pop3Client| {
                    Box::pin(async move {
                        Ok(client
                            .uidl()
                            .await?
                            .into_iter()
                            .map(|e| e.uid)
                            .collect::<Vec<_>>())
                    })
                })
                .await
                .unwrap();

            assert_eq!(vec!["u1".to_owned()], uids);
        });
    }

    #[test]
    fn retries_use_fresh_connections() {
        rt().block_on(async {
            let server = MockServer::spawn(
                MockMailbox::empty().reject_auth("-ERR mailbox busy"),
            )
            .await;
            let pool = Pop3Pool::new(test_config(|c| c.max_retries = 3));

            let result: Result<(), Error> = pool
                .execute(&credentials(&server), |_client: &mut Pop3Client| {
                    Box::pin(async move { Ok(()) })
                })
                .await;

            assert_matches!(Err(Error::Pop3(..)), result);
            // One fresh socket per attempt.
            assert_eq!(3, server.connection_count());
        });
    }

    #[test]
    fn throttle_fast_fails_without_a_socket() {
        rt().block_on(async {
            let server = MockServer::spawn(
                MockMailbox::empty()
                    .reject_auth("-ERR too many connections"),
            )
            .await;
            let pool = Pop3Pool::new(test_config(|c| {
                c.max_retries = 3;
                c.throttle_window_secs = 60;
            }));
            let creds = credentials(&server);

            let first: Result<(), Error> = pool
                .execute(&creds, |_: &mut Pop3Client| Box::pin(async move { Ok(()) }))
                .await;
            assert_matches!(Err(Error::Pop3(..)), first);
            // Throttle detection aborts the remaining retries.
            assert_eq!(1, server.connection_count());

            let second: Result<(), Error> = pool
                .execute(&creds, |_: &mut Pop3Client| Box::pin(async move { Ok(()) }))
                .await;
            assert_matches!(
                Err(Error::Pop3(Pop3Error {
                    kind: Pop3ErrorKind::Throttled,
                    ..
                })),
                second
            );
            // Fast-fail: no socket was opened.
            assert_eq!(1, server.connection_count());
        });
    }

    #[test]
    fn throttle_window_expires() {
        rt().block_on(async {
            let server = MockServer::spawn(
                MockMailbox::empty()
                    .reject_auth("-ERR login rate exceeded"),
            )
            .await;
            let pool = Pop3Pool::new(test_config(|c| {
                c.max_retries = 1;
                c.throttle_window_secs = 1;
            }));
            let creds = credentials(&server);

            let _: Result<(), Error> = pool
                .execute(&creds, |_: &mut Pop3Client| Box::pin(async move { Ok(()) }))
                .await;

            tokio::time::sleep(Duration::from_millis(1100)).await;
            server.allow_auth();

            pool.execute(&creds, |_: &mut Pop3Client| Box::pin(async move { Ok(()) }))
                .await
                .unwrap();
        });
    }

    #[test]
    fn over_cap_callers_wake_in_submission_order() {
        rt().block_on(async {
            let server = MockServer::spawn(MockMailbox::empty()).await;
            let pool =
                Arc::new(Pop3Pool::new(test_config(|c| {
                    c.max_connections = 1
                })));
            let order = Arc::new(Mutex::new(Vec::<usize>::new()));

            let mut tasks = Vec::new();
            for caller in 0..4usize {
                let pool = Arc::clone(&pool);
                let order = Arc::clone(&order);
                let creds = credentials(&server);
                tasks.push(tokio::spawn(async move {
                    pool.execute(&creds, |_client: &mut Pop3Client| {
                        let order = Arc::clone(&order);
                        Box::pin(async move {
                            order.lock().unwrap().push(caller);
                            tokio::time::sleep(Duration::from_millis(30))
                                .await;
                            Ok(())
                        })
                    })
                    .await
                    .unwrap();
                }));
                // Give each submission time to reach the semaphore queue so
                // "submission order" is well-defined.
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            for task in tasks {
                task.await.unwrap();
            }

            assert_eq!(vec![0, 1, 2, 3], *order.lock().unwrap());
        });
    }

    #[test]
    fn non_pop3_errors_abort_without_retry() {
        rt().block_on(async {
            let server = MockServer::spawn(MockMailbox::empty()).await;
            let pool = Pop3Pool::new(test_config(|c| c.max_retries = 3));

            let result: Result<(), Error> = pool
                .execute(&credentials(&server), |_client: &mut Pop3Client| {
                    Box::pin(async move {
                        Err(Error::NotFound("inbox went away"))
                    })
                })
                .await;

            assert_matches!(Err(Error::NotFound(..)), result);
            assert_eq!(1, server.connection_count());
        });
    }
}
