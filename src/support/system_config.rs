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

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// The system-wide configuration for Briefbox.
///
/// This is stored in a TOML file (conventionally `briefbox.toml`) whose path
/// is given to the `serve` subcommand. The record is built once at startup
/// and handed to components as typed substructures; nothing reads it (or any
/// other process-wide state) after initialisation.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SystemConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    /// Secrets: the credential master key and the admin API key.
    pub security: SecurityConfig,

    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub smtp: SmtpConfig,

    #[serde(default)]
    pub pop3: Pop3Config,

    #[serde(default)]
    pub tokens: TokenConfig,

    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    Development,
    Production,
}

impl Default for Environment {
    fn default() -> Self {
        Environment::Development
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GeneralConfig {
    /// Directory holding the SQLite database.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// `production` enables the stricter behaviours: internal error
    /// messages are masked at the API boundary and external POP3 hosts may
    /// not point into private address space.
    #[serde(default)]
    pub environment: Environment,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        GeneralConfig {
            data_dir: default_data_dir(),
            environment: Environment::default(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./briefbox-data")
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SecurityConfig {
    /// The credential master key.
    ///
    /// A 64-character hex string is decoded to the 32-byte AES key directly;
    /// any other string is reduced to 32 bytes with SHA-256. Generate a
    /// proper key with `briefbox key`. Never logged.
    pub master_key: String,
    /// Shared secret expected in `X-Admin-Key` on the admin endpoints.
    pub admin_key: String,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ApiConfig {
    /// Address the HTTP API binds.
    #[serde(default = "default_api_listen")]
    pub listen: String,
    /// Maximum unauthenticated inbox creations per caller IP per window.
    #[serde(default = "default_create_rate_limit")]
    pub create_rate_limit: u32,
    /// The rate-limit window, in seconds.
    #[serde(default = "default_rate_window_secs")]
    pub rate_window_secs: u64,
    /// Largest request body the API will read.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig {
            listen: default_api_listen(),
            create_rate_limit: default_create_rate_limit(),
            rate_window_secs: default_rate_window_secs(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

fn default_api_listen() -> String {
    "127.0.0.1:8080".to_owned()
}

fn default_create_rate_limit() -> u32 {
    10
}

fn default_rate_window_secs() -> u64 {
    60
}

fn default_max_body_bytes() -> usize {
    64 * 1024
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SmtpConfig {
    /// Whether the inbound SMTP receiver runs at all.
    #[serde(default)]
    pub enabled: bool,
    /// Address the receiver binds. The conventional deployment puts a real
    /// MTA or a trusted network boundary in front, hence the high port.
    #[serde(default = "default_smtp_listen")]
    pub listen: String,
    /// Host name announced in the banner and `Received:` header. Falls back
    /// to `localhost` when empty.
    #[serde(default)]
    pub host_name: String,
    /// Hard cap on a single message, bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: u64,
}

impl Default for SmtpConfig {
    fn default() -> Self {
        SmtpConfig {
            enabled: false,
            listen: default_smtp_listen(),
            host_name: String::new(),
            max_message_size: default_max_message_size(),
        }
    }
}

fn default_smtp_listen() -> String {
    "0.0.0.0:2525".to_owned()
}

fn default_max_message_size() -> u64 {
    10 * 1024 * 1024
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Pop3Config {
    /// Cap on concurrently open provider connections; also the fetch-worker
    /// parallelism.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Attempts per `execute()` before giving up.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Base of the exponential backoff between attempts, milliseconds.
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    /// How long a throttled host is fast-failed, seconds.
    #[serde(default = "default_throttle_window_secs")]
    pub throttle_window_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
    /// Upper bound on messages retrieved by one fetch job.
    #[serde(default = "default_max_fetch")]
    pub max_fetch: usize,
}

impl Default for Pop3Config {
    fn default() -> Self {
        Pop3Config {
            max_connections: default_max_connections(),
            max_retries: default_max_retries(),
            retry_base_ms: default_retry_base_ms(),
            throttle_window_secs: default_throttle_window_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            command_timeout_secs: default_command_timeout_secs(),
            max_fetch: default_max_fetch(),
        }
    }
}

fn default_max_connections() -> usize {
    8
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_throttle_window_secs() -> u64 {
    30
}

fn default_connect_timeout_secs() -> u64 {
    15
}

fn default_command_timeout_secs() -> u64 {
    30
}

fn default_max_fetch() -> usize {
    50
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TokenConfig {
    /// Lifetime of a freshly issued token when the caller does not ask for
    /// one, seconds.
    #[serde(default = "default_token_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Longest lifetime a caller may request, seconds.
    #[serde(default = "default_token_max_ttl_secs")]
    pub max_ttl_secs: u64,
    /// Cadence of the background sweep that marks expired tokens.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for TokenConfig {
    fn default() -> Self {
        TokenConfig {
            default_ttl_secs: default_token_ttl_secs(),
            max_ttl_secs: default_token_max_ttl_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_token_ttl_secs() -> u64 {
    600
}

fn default_token_max_ttl_secs() -> u64 {
    7 * 24 * 3600
}

fn default_sweep_interval_secs() -> u64 {
    300
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LimitsConfig {
    /// Attachments larger than this are dropped at parse time.
    #[serde(default = "default_max_attachment_bytes")]
    pub max_attachment_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_attachment_bytes: default_max_attachment_bytes(),
        }
    }
}

fn default_max_attachment_bytes() -> usize {
    5 * 1024 * 1024
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config: SystemConfig = toml::from_str(
            r#"
            [security]
            master_key = "hunter2"
            admin_key = "letmein"
            "#,
        )
        .unwrap();

        assert_eq!(Environment::Development, config.general.environment);
        assert_eq!("127.0.0.1:8080", config.api.listen);
        assert_eq!(8, config.pop3.max_connections);
        assert_eq!(600, config.tokens.default_ttl_secs);
        assert!(!config.smtp.enabled);
    }

    #[test]
    fn production_environment_parses() {
        let config: SystemConfig = toml::from_str(
            r#"
            [general]
            environment = "production"
            [security]
            master_key = "k"
            admin_key = "a"
            "#,
        )
        .unwrap();
        assert_eq!(Environment::Production, config.general.environment);
    }
}
