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

//! Route dispatch and handlers for the public and admin HTTP surface.
//!
//! Everything here returns `Result<Response, Error>`; the single
//! `error_response` choke point flattens errors into the documented
//! `{error: {code, message}}` bodies. Internal messages are masked in
//! production.

use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::warn;
use rand::distributions::Alphanumeric;
use rand::{rngs::OsRng, Rng};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use super::auth::{self, RateLimiter};
use super::httpd::{self, Request, Response};
use crate::crypt::{self, MasterKey};
use crate::fetch::FetchQueue;
use crate::store::maildb::MailDb;
use crate::store::types::*;
use crate::support::error::Error;
use crate::support::system_config::{
    ApiConfig, Environment, TokenConfig,
};

const DEFAULT_PAGE: usize = 50;
const MAX_PAGE: usize = 200;
const MAX_BULK_GENERATE: u32 = 100;

pub struct ApiState {
    pub environment: Environment,
    pub tokens: TokenConfig,
    pub admin_key: String,
    pub db: MailDb,
    pub fetch_queue: FetchQueue,
    pub master_key: MasterKey,
    rate_limiter: RateLimiter,
    round_robin: AtomicUsize,
}

impl ApiState {
    pub fn new(
        environment: Environment,
        api: &ApiConfig,
        tokens: TokenConfig,
        admin_key: String,
        db: MailDb,
        fetch_queue: FetchQueue,
        master_key: MasterKey,
    ) -> Self {
        ApiState {
            environment,
            tokens,
            admin_key,
            db,
            fetch_queue,
            master_key,
            rate_limiter: RateLimiter::new(
                api.create_rate_limit,
                Duration::from_secs(api.rate_window_secs),
            ),
            round_robin: AtomicUsize::new(0),
        }
    }

    pub async fn dispatch(&self, request: Request) -> Response {
        match self.route(&request).await {
            Ok(response) => response,
            Err(e) => self.error_response(e),
        }
    }

    async fn route(&self, request: &Request) -> Result<Response, Error> {
        let path = request.path.trim_matches('/').to_owned();
        let segments = path.split('/').collect::<Vec<_>>();

        match (request.method.as_str(), segments.as_slice()) {
            ("GET", ["health"]) => Ok(Response::json(
                200,
                &serde_json::json!({"status": "ok"}),
            )),
            ("GET", ["ready"]) => {
                self.db.ping()?;
                Ok(Response::json(
                    200,
                    &serde_json::json!({"status": "ready"}),
                ))
            },

            ("POST", ["v1", "inboxes"]) => self.create_inbox(request).await,
            ("GET", ["v1", "inboxes", id, "messages"]) => {
                self.list_messages(request, parse_id(id)?).await
            },
            (
                "GET",
                ["v1", "inboxes", id, "messages", uid, "attachments", att],
            ) => self.download_attachment(
                request,
                parse_id(id)?,
                uid,
                parse_id(att)?,
            ),
            ("POST", ["v1", "inboxes", id, "token:rotate"]) => {
                self.rotate_token(request, parse_id(id)?)
            },
            ("DELETE", ["v1", "inboxes", id]) => {
                self.delete_inbox(request, parse_id(id)?)
            },

            ("POST", ["v1", "admin", "domains"]) => {
                self.admin_create_domain(request)
            },
            ("GET", ["v1", "admin", "domains"]) => {
                self.admin_list_domains(request)
            },
            ("GET", ["v1", "admin", "domains", id]) => {
                self.admin_get_domain(request, parse_id(id)?)
            },
            ("PUT", ["v1", "admin", "domains", id]) => {
                self.admin_update_domain(request, parse_id(id)?)
            },
            ("DELETE", ["v1", "admin", "domains", id]) => {
                self.admin_delete_domain(request, parse_id(id)?)
            },
            ("POST", ["v1", "admin", "generate"]) => {
                self.admin_generate(request)
            },
            ("GET", ["v1", "admin", "export"]) => self.admin_export(request),
            ("GET", ["v1", "admin", "stats"]) => self.admin_stats(request),

            _ => Err(Error::NotFound("no such route")),
        }
    }

    fn error_response(&self, e: Error) -> Response {
        let (status, code) = e.api_code();
        let message = if 500 == status
            && Environment::Production == self.environment
        {
            "Internal server error".to_owned()
        } else {
            e.to_string()
        };

        Response::json(
            status,
            &serde_json::json!({
                "error": { "code": code, "message": message }
            }),
        )
    }

    // ------------------------------------------------------------------
    // Public surface

    async fn create_inbox(
        &self,
        request: &Request,
    ) -> Result<Response, Error> {
        self.rate_limiter.check(request.peer_ip)?;

        let body: CreateInboxRequest = json_body(request)?;
        let ttl_secs = self.clamp_ttl(body.ttl_secs)?;
        let actor = request.peer_ip.to_string();

        let (inbox, raw_token, expires_at) = match body.mode.as_str() {
            "external" => {
                self.create_external_inbox(&body, &actor, ttl_secs)?
            },
            "generated" => {
                let domains =
                    self.eligible_domains(body.domain.as_deref())?;
                self.create_generated_inbox(&domains, &actor, ttl_secs)?
            },
            other => {
                return Err(Error::Validation(format!(
                    "mode must be \"external\" or \"generated\", not {:?}",
                    other
                )))
            },
        };

        self.db.audit(
            "inbox.create",
            Some(inbox.id),
            &actor,
            serde_json::json!({ "mode": body.mode, "email": inbox.email }),
        );

        Ok(Response::json(
            201,
            &TokenGrant {
                inbox: InboxDto::from(&inbox),
                token: raw_token,
                expires_at: rfc3339(expires_at),
            },
        ))
    }

    fn create_external_inbox(
        &self,
        body: &CreateInboxRequest,
        actor: &str,
        ttl_secs: i64,
    ) -> Result<(Inbox, String, UnixTimestamp), Error> {
        let email = body
            .email
            .as_deref()
            .ok_or_else(|| {
                Error::Validation(
                    "external mode requires \"email\"".to_owned(),
                )
            })?
            .to_owned();
        validate_email(&email)?;

        let host = body
            .pop3_host
            .as_deref()
            .ok_or_else(|| {
                Error::Validation(
                    "external mode requires \"pop3_host\"".to_owned(),
                )
            })?
            .to_owned();
        if Environment::Production == self.environment
            && is_internal_host(&host)
        {
            return Err(Error::Validation(format!(
                "pop3_host {:?} points into private address space",
                host
            )));
        }

        let password = body.password.as_deref().ok_or_else(|| {
            Error::Validation("external mode requires \"password\"".to_owned())
        })?;
        let username = body.username.clone().unwrap_or_else(|| email.clone());

        let inbox = self.db.create_inbox(&NewInbox {
            email,
            inbox_type: InboxType::External,
            pop3_host: Some(host),
            pop3_port: Some(body.pop3_port.unwrap_or(995)),
            pop3_tls: body.pop3_tls.unwrap_or(true),
            username_enc: self.master_key.encrypt(username.as_bytes())?,
            password_enc: self.master_key.encrypt(password.as_bytes())?,
            domain_id: None,
            created_by: actor.to_owned(),
            ttl_secs,
        })?;

        let (raw_token, expires_at) = self.issue_token(&inbox, actor)?;
        Ok((inbox, raw_token, expires_at))
    }

    fn eligible_domains(
        &self,
        wanted: Option<&str>,
    ) -> Result<Vec<Domain>, Error> {
        let mut domains = self.db.active_domains()?;
        if let Some(wanted) = wanted {
            domains.retain(|d| d.domain.eq_ignore_ascii_case(wanted));
        }
        if domains.is_empty() {
            return Err(Error::Validation(
                "no active domain is available for generation".to_owned(),
            ));
        }
        Ok(domains)
    }

    /// Creates one generated inbox on the next domain in round-robin
    /// order, with a random address and a random mailbox password.
    fn create_generated_inbox(
        &self,
        domains: &[Domain],
        actor: &str,
        ttl_secs: i64,
    ) -> Result<(Inbox, String, UnixTimestamp), Error> {
        let slot = self.round_robin.fetch_add(1, Ordering::Relaxed);
        let domain = &domains[slot % domains.len()];

        let local = random_string(10).to_lowercase();
        let email = format!("{}@{}", local, domain.domain);
        let password = random_string(16);

        let inbox = self.db.create_inbox(&NewInbox {
            email,
            inbox_type: InboxType::Generated,
            // Provider-hosted domains carry their POP3 coordinates onto
            // the inbox so the fetch worker needs no join at run time;
            // local domains receive over SMTP and have none.
            pop3_host: domain.pop3_host.clone(),
            pop3_port: domain.pop3_port,
            pop3_tls: domain.pop3_tls,
            username_enc: self.master_key.encrypt(local.as_bytes())?,
            password_enc: self.master_key.encrypt(password.as_bytes())?,
            domain_id: Some(domain.id),
            created_by: actor.to_owned(),
            ttl_secs,
        })?;

        let (raw_token, expires_at) = self.issue_token(&inbox, actor)?;
        Ok((inbox, raw_token, expires_at))
    }

    async fn list_messages(
        &self,
        request: &Request,
        inbox_id: i64,
    ) -> Result<Response, Error> {
        let inbox_id = self.authenticate(request, inbox_id)?;

        let since_uid =
            request.query_param("since_uid").map(str::to_owned);
        let limit = match request.query_param("limit") {
            Some(raw) => raw
                .parse::<usize>()
                .ok()
                .filter(|&limit| limit > 0)
                .ok_or_else(|| {
                    Error::Validation(format!(
                        "limit must be a positive integer, not {:?}",
                        raw
                    ))
                })?
                .min(MAX_PAGE),
            None => DEFAULT_PAGE,
        };
        let fetch_new = !matches!(
            request.query_param("fetch_new"),
            Some("false") | Some("0")
        );

        if fetch_new {
            // An ingestion-side failure never fails the read; the caller
            // still gets whatever is cached.
            if let Err(e) = self
                .fetch_queue
                .fetch_now(
                    InboxId(inbox_id.0),
                    since_uid.clone(),
                    Some(limit),
                )
                .await
            {
                warn!(
                    "fetch for inbox {} failed; serving cached messages: {}",
                    inbox_id.0, e
                );
            }
        }

        let messages =
            self.db
                .list_messages(inbox_id, since_uid.as_deref(), limit)?;
        let messages =
            messages.iter().map(MessageDto::from).collect::<Vec<_>>();

        Ok(Response::json(
            200,
            &serde_json::json!({
                "count": messages.len(),
                "messages": messages,
            }),
        ))
    }

    fn download_attachment(
        &self,
        request: &Request,
        inbox_id: i64,
        message_uid: &str,
        attachment_id: i64,
    ) -> Result<Response, Error> {
        let inbox_id = self.authenticate(request, inbox_id)?;

        let attachment = self.db.fetch_attachment(
            inbox_id,
            message_uid,
            AttachmentId(attachment_id),
        )?;

        let filename: String = attachment
            .meta
            .filename
            .chars()
            .filter(|c| !c.is_control() && '"' != *c)
            .collect();

        Ok(Response::binary(
            attachment.meta.content_type.clone(),
            attachment.content,
            vec![
                (
                    "Content-Disposition".to_owned(),
                    format!("attachment; filename=\"{}\"", filename),
                ),
                (
                    "X-Checksum-SHA256".to_owned(),
                    attachment.meta.checksum.clone(),
                ),
            ],
        ))
    }

    fn rotate_token(
        &self,
        request: &Request,
        inbox_id: i64,
    ) -> Result<Response, Error> {
        let inbox_id = self.authenticate(request, inbox_id)?;
        let inbox = self.db.fetch_inbox(inbox_id)?;
        let actor = request.peer_ip.to_string();

        let raw = crypt::generate_token();
        let expires_at = self.expiry_after(inbox.ttl_secs)?;
        self.db.rotate_token(
            inbox.id,
            &crypt::hash_token(&raw),
            expires_at,
            &actor,
        )?;

        self.db.audit(
            "token.rotate",
            Some(inbox.id),
            &actor,
            serde_json::json!({}),
        );

        Ok(Response::json(
            200,
            &serde_json::json!({
                "token": raw,
                "expires_at": rfc3339(expires_at),
            }),
        ))
    }

    fn delete_inbox(
        &self,
        request: &Request,
        inbox_id: i64,
    ) -> Result<Response, Error> {
        let inbox_id = self.authenticate(request, inbox_id)?;
        self.db.delete_inbox(inbox_id)?;

        self.db.audit(
            "inbox.delete",
            Some(inbox_id),
            &request.peer_ip.to_string(),
            serde_json::json!({}),
        );

        Ok(Response::json(
            200,
            &serde_json::json!({"status": "deleted"}),
        ))
    }

    // ------------------------------------------------------------------
    // Admin surface

    fn admin_create_domain(
        &self,
        request: &Request,
    ) -> Result<Response, Error> {
        self.require_admin(request)?;
        let body: DomainRequest = json_body(request)?;
        let new = body.into_new_domain()?;

        let domain = self.db.create_domain(&new)?;
        self.db.audit(
            "domain.create",
            None,
            &request.peer_ip.to_string(),
            serde_json::json!({ "domain": domain.domain }),
        );

        Ok(Response::json(201, &DomainDto::from(&domain)))
    }

    fn admin_list_domains(
        &self,
        request: &Request,
    ) -> Result<Response, Error> {
        self.require_admin(request)?;
        let domains = self
            .db
            .list_domains()?
            .iter()
            .map(DomainDto::from)
            .collect::<Vec<_>>();
        Ok(Response::json(
            200,
            &serde_json::json!({"domains": domains}),
        ))
    }

    fn admin_get_domain(
        &self,
        request: &Request,
        id: i64,
    ) -> Result<Response, Error> {
        self.require_admin(request)?;
        let domain = self.db.fetch_domain(DomainId(id))?;
        Ok(Response::json(200, &DomainDto::from(&domain)))
    }

    fn admin_update_domain(
        &self,
        request: &Request,
        id: i64,
    ) -> Result<Response, Error> {
        self.require_admin(request)?;
        let body: DomainRequest = json_body(request)?;
        let new = body.into_new_domain()?;

        let domain = self.db.update_domain(DomainId(id), &new)?;
        self.db.audit(
            "domain.update",
            None,
            &request.peer_ip.to_string(),
            serde_json::json!({ "domain": domain.domain }),
        );
        Ok(Response::json(200, &DomainDto::from(&domain)))
    }

    fn admin_delete_domain(
        &self,
        request: &Request,
        id: i64,
    ) -> Result<Response, Error> {
        self.require_admin(request)?;
        self.db.delete_domain(DomainId(id))?;
        self.db.audit(
            "domain.delete",
            None,
            &request.peer_ip.to_string(),
            serde_json::json!({ "domain_id": id }),
        );
        Ok(Response::json(
            200,
            &serde_json::json!({"status": "deleted"}),
        ))
    }

    fn admin_generate(&self, request: &Request) -> Result<Response, Error> {
        self.require_admin(request)?;
        let body: GenerateRequest = json_body(request)?;

        if 0 == body.count || body.count > MAX_BULK_GENERATE {
            return Err(Error::Validation(format!(
                "count must be between 1 and {}",
                MAX_BULK_GENERATE
            )));
        }
        let ttl_secs = self.clamp_ttl(body.ttl_secs)?;
        let domains = self.eligible_domains(body.domain.as_deref())?;
        let actor = request.peer_ip.to_string();

        let mut created = Vec::new();
        for _ in 0..body.count {
            match self.create_generated_inbox(&domains, &actor, ttl_secs) {
                Ok((inbox, token, expires_at)) => {
                    created.push(serde_json::json!({
                        "id": inbox.id.0,
                        "email": inbox.email,
                        "token": token,
                        "expires_at": rfc3339(expires_at),
                    }))
                },
                Err(e) => {
                    warn!("bulk generation lost one inbox: {}", e);
                },
            }
        }

        self.db.record_bulk_generation(
            body.count as i64,
            created.len() as i64,
            &actor,
        )?;
        self.db.audit(
            "inbox.generate",
            None,
            &actor,
            serde_json::json!({
                "requested": body.count,
                "created": created.len(),
            }),
        );

        Ok(Response::json(
            201,
            &serde_json::json!({
                "requested": body.count,
                "created": created.len(),
                "inboxes": created,
            }),
        ))
    }

    /// Exports active generated inboxes as `email:password`.
    ///
    /// This is the one read that unseals mailbox passwords; it exists so
    /// administrators can hand generated credentials to provisioning
    /// tooling, and it is admin-keyed for that reason.
    fn admin_export(&self, request: &Request) -> Result<Response, Error> {
        self.require_admin(request)?;
        let format = request.query_param("format").unwrap_or("text");

        let mut rows = Vec::new();
        for (email, password_enc) in self.db.export_generated()? {
            match self.master_key.decrypt(&password_enc) {
                Ok(password) => rows.push((
                    email,
                    String::from_utf8_lossy(&password).into_owned(),
                )),
                Err(e) => {
                    warn!("export: cannot unseal password for {}: {}", email, e)
                },
            }
        }

        match format {
            "text" => Ok(Response::text(
                200,
                "text/plain; charset=utf-8",
                rows.iter()
                    .map(|(email, password)| {
                        format!("{}:{}\n", email, password)
                    })
                    .collect(),
            )),
            "csv" => {
                let mut csv = String::from("email,password\n");
                for (email, password) in &rows {
                    csv.push_str(&format!("{},{}\n", email, password));
                }
                Ok(Response::text(200, "text/csv; charset=utf-8", csv))
            },
            "json" => {
                let rows = rows
                    .iter()
                    .map(|(email, password)| {
                        serde_json::json!({
                            "email": email,
                            "password": password,
                        })
                    })
                    .collect::<Vec<_>>();
                Ok(Response::json(
                    200,
                    &serde_json::json!({"inboxes": rows}),
                ))
            },
            other => Err(Error::Validation(format!(
                "format must be text, json, or csv, not {:?}",
                other
            ))),
        }
    }

    fn admin_stats(&self, request: &Request) -> Result<Response, Error> {
        self.require_admin(request)?;
        Ok(Response::json(200, &self.db.stats()?))
    }

    // ------------------------------------------------------------------
    // Shared helpers

    fn authenticate(
        &self,
        request: &Request,
        path_inbox_id: i64,
    ) -> Result<InboxId, Error> {
        auth::authenticate(
            &self.db,
            request.header("authorization"),
            InboxId(path_inbox_id),
        )
    }

    fn require_admin(&self, request: &Request) -> Result<(), Error> {
        auth::require_admin(&self.admin_key, request.header("x-admin-key"))
    }

    fn issue_token(
        &self,
        inbox: &Inbox,
        issued_to: &str,
    ) -> Result<(String, UnixTimestamp), Error> {
        let raw = crypt::generate_token();
        let expires_at = self.expiry_after(inbox.ttl_secs)?;
        self.db.create_token(
            inbox.id,
            &crypt::hash_token(&raw),
            expires_at,
            issued_to,
        )?;
        Ok((raw, expires_at))
    }

    fn expiry_after(&self, ttl_secs: i64) -> Result<UnixTimestamp, Error> {
        UnixTimestamp::from_millis(
            UnixTimestamp::now().as_millis() + ttl_secs * 1000,
        )
        .ok_or_else(|| Error::Validation("ttl is out of range".to_owned()))
    }

    fn clamp_ttl(&self, requested: Option<u64>) -> Result<i64, Error> {
        let ttl = requested.unwrap_or(self.tokens.default_ttl_secs);
        if 0 == ttl {
            return Err(Error::Validation(
                "ttl_secs must be positive".to_owned(),
            ));
        }
        Ok(ttl.min(self.tokens.max_ttl_secs) as i64)
    }
}

/// Binds the listener and serves the API until the task is aborted.
pub async fn serve(
    listener: TcpListener,
    max_body: usize,
    state: Arc<ApiState>,
) {
    httpd::serve(listener, max_body, move |request| {
        let state = Arc::clone(&state);
        async move { state.dispatch(request).await }
    })
    .await
}

// ----------------------------------------------------------------------
// Wire DTOs

#[derive(Deserialize)]
struct CreateInboxRequest {
    mode: String,
    email: Option<String>,
    pop3_host: Option<String>,
    pop3_port: Option<u16>,
    pop3_tls: Option<bool>,
    username: Option<String>,
    password: Option<String>,
    domain: Option<String>,
    ttl_secs: Option<u64>,
}

#[derive(Deserialize)]
struct DomainRequest {
    domain: String,
    pop3_host: Option<String>,
    pop3_port: Option<u16>,
    pop3_tls: Option<bool>,
    is_local: Option<bool>,
    active: Option<bool>,
}

impl DomainRequest {
    fn into_new_domain(self) -> Result<NewDomain, Error> {
        let domain = self.domain.trim().to_lowercase();
        if domain.is_empty() || !domain.contains('.') {
            return Err(Error::Validation(format!(
                "{:?} is not a usable domain",
                domain
            )));
        }

        let is_local = self.is_local.unwrap_or(false);
        if !is_local && self.pop3_host.is_none() {
            return Err(Error::Validation(
                "non-local domains need pop3_host".to_owned(),
            ));
        }

        Ok(NewDomain {
            domain,
            pop3_host: self.pop3_host,
            pop3_port: self.pop3_port,
            pop3_tls: self.pop3_tls.unwrap_or(true),
            is_local,
            active: self.active.unwrap_or(true),
        })
    }
}

#[derive(Deserialize)]
struct GenerateRequest {
    count: u32,
    ttl_secs: Option<u64>,
    domain: Option<String>,
}

#[derive(Serialize)]
struct TokenGrant {
    inbox: InboxDto,
    token: String,
    expires_at: String,
}

#[derive(Serialize)]
struct InboxDto {
    id: i64,
    email: String,
    #[serde(rename = "type")]
    inbox_type: InboxType,
    status: InboxStatus,
    last_seen_uid: Option<String>,
    ttl_secs: i64,
    created_at: String,
}

impl From<&Inbox> for InboxDto {
    fn from(inbox: &Inbox) -> Self {
        InboxDto {
            id: inbox.id.0,
            email: inbox.email.clone(),
            inbox_type: inbox.inbox_type,
            status: inbox.status,
            last_seen_uid: inbox.last_seen_uid.clone(),
            ttl_secs: inbox.ttl_secs,
            created_at: rfc3339(inbox.created_at),
        }
    }
}

#[derive(Serialize)]
struct DomainDto {
    id: i64,
    domain: String,
    pop3_host: Option<String>,
    pop3_port: Option<u16>,
    pop3_tls: bool,
    is_local: bool,
    active: bool,
    created_at: String,
}

impl From<&Domain> for DomainDto {
    fn from(domain: &Domain) -> Self {
        DomainDto {
            id: domain.id.0,
            domain: domain.domain.clone(),
            pop3_host: domain.pop3_host.clone(),
            pop3_port: domain.pop3_port,
            pop3_tls: domain.pop3_tls,
            is_local: domain.is_local,
            active: domain.active,
            created_at: rfc3339(domain.created_at),
        }
    }
}

#[derive(Serialize)]
struct MessageDto {
    uid: String,
    message_id: Option<String>,
    sender: String,
    recipients: Vec<Recipient>,
    subject: String,
    body_text: String,
    body_html: String,
    headers: std::collections::BTreeMap<String, String>,
    size_bytes: i64,
    received_at: Option<String>,
    fetched_at: String,
    attachments: Vec<AttachmentDto>,
}

impl From<&StoredMessage> for MessageDto {
    fn from(message: &StoredMessage) -> Self {
        MessageDto {
            uid: message.uid.clone(),
            message_id: message.message_id.clone(),
            sender: message.sender.clone(),
            recipients: message.recipients.clone(),
            subject: message.subject.clone(),
            body_text: message.body_text.clone(),
            body_html: message.body_html.clone(),
            headers: message.headers.clone(),
            size_bytes: message.size_bytes,
            received_at: message.received_at.map(rfc3339),
            fetched_at: rfc3339(message.fetched_at),
            attachments: message
                .attachments
                .iter()
                .map(|a| AttachmentDto {
                    id: a.id.0,
                    filename: a.filename.clone(),
                    content_type: a.content_type.clone(),
                    size_bytes: a.size_bytes,
                    content_id: a.content_id.clone(),
                    checksum: a.checksum.clone(),
                })
                .collect(),
        }
    }
}

#[derive(Serialize)]
struct AttachmentDto {
    id: i64,
    filename: String,
    content_type: String,
    size_bytes: i64,
    content_id: Option<String>,
    checksum: String,
}

// ----------------------------------------------------------------------
// Small helpers

fn parse_id(segment: &str) -> Result<i64, Error> {
    segment.parse::<i64>().map_err(|_| {
        Error::Validation(format!("{:?} is not a numeric id", segment))
    })
}

fn json_body<T: serde::de::DeserializeOwned>(
    request: &Request,
) -> Result<T, Error> {
    serde_json::from_slice(&request.body)
        .map_err(|e| Error::Validation(format!("invalid JSON body: {}", e)))
}

fn validate_email(email: &str) -> Result<(), Error> {
    let valid = email.len() <= 320
        && email
            .split_once('@')
            .map(|(local, domain)| !local.is_empty() && domain.contains('.'))
            .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!(
            "{:?} is not an email address",
            email
        )))
    }
}

/// Whether a POP3 host clearly points inside our own network. Applied to
/// external inbox creation in production so the fetch worker cannot be
/// aimed at internal services.
fn is_internal_host(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return true;
    }

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_unspecified()
                || v4.is_broadcast()
        },
        Ok(IpAddr::V6(v6)) => {
            // fc00::/7 unique-local, fe80::/10 link-local.
            v6.is_loopback()
                || v6.is_unspecified()
                || (v6.segments()[0] & 0xfe00) == 0xfc00
                || (v6.segments()[0] & 0xffc0) == 0xfe80
        },
        Err(_) => false,
    }
}

fn random_string(length: usize) -> String {
    OsRng
        .sample_iter(&Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

fn rfc3339(ts: UnixTimestamp) -> String {
    ts.0.to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}
