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

use std::fs;
use std::path::PathBuf;

use structopt::StructOpt;

use crate::crypt::MasterKey;
use crate::store::maildb::MailDb;
use crate::store::types::NewDomain;
use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Run the gateway daemon: HTTP API, optional inbound SMTP receiver,
    /// and the background tasks.
    Serve(CommonOptions),
    /// Generate and print a fresh credential master key (64 hex chars).
    Key,
    /// Manage issuing domains directly, without the HTTP admin surface.
    Domain(DomainSubcommand),
}

#[derive(StructOpt, Default)]
pub(super) struct CommonOptions {
    /// Path to the briefbox.toml configuration file.
    #[structopt(
        long,
        short,
        parse(from_os_str),
        default_value = "briefbox.toml"
    )]
    config: PathBuf,
}

#[derive(StructOpt)]
enum DomainSubcommand {
    /// Register an issuing domain.
    Add(DomainAddOptions),
    /// List registered domains.
    List(CommonOptions),
}

#[derive(StructOpt)]
struct DomainAddOptions {
    #[structopt(flatten)]
    common: CommonOptions,

    /// The domain receives mail through the built-in SMTP receiver
    /// instead of a provider POP3 pull.
    #[structopt(long)]
    local: bool,

    /// Provider POP3 host; required unless --local.
    #[structopt(long)]
    pop3_host: Option<String>,

    /// Provider POP3 port.
    #[structopt(long, default_value = "995")]
    pop3_port: u16,

    /// Talk to the provider without implicit TLS.
    #[structopt(long)]
    plaintext: bool,

    /// The fully-qualified domain to register.
    domain: String,
}

pub fn main() {
    match Command::from_args() {
        Command::Serve(options) => {
            crate::init_simple_log();
            let config = load_config(&options);
            super::serve::serve(config);
        },

        Command::Key => {
            println!("{}", MasterKey::generate_hex());
        },

        Command::Domain(DomainSubcommand::Add(options)) => {
            if !options.local && options.pop3_host.is_none() {
                die("--pop3-host is required unless --local is given");
            }

            let config = load_config(&options.common);
            let db = open_db(&config);
            let domain = db
                .create_domain(&NewDomain {
                    domain: options.domain.trim().to_lowercase(),
                    pop3_host: options.pop3_host,
                    pop3_port: Some(options.pop3_port),
                    pop3_tls: !options.plaintext,
                    is_local: options.local,
                    active: true,
                })
                .unwrap_or_else(|e| die(&format!("cannot add domain: {}", e)));
            println!("added domain {} (id {})", domain.domain, domain.id.0);
        },

        Command::Domain(DomainSubcommand::List(options)) => {
            let config = load_config(&options);
            let db = open_db(&config);
            let domains = db
                .list_domains()
                .unwrap_or_else(|e| die(&format!("cannot list: {}", e)));
            for domain in domains {
                println!(
                    "{}\t{}\t{}\t{}",
                    domain.id.0,
                    domain.domain,
                    if domain.is_local {
                        "local".to_owned()
                    } else {
                        format!(
                            "pop3://{}:{}",
                            domain.pop3_host.as_deref().unwrap_or("?"),
                            domain.pop3_port.unwrap_or(0),
                        )
                    },
                    if domain.active { "active" } else { "inactive" },
                );
            }
        },
    }
}

fn load_config(options: &CommonOptions) -> SystemConfig {
    let raw = fs::read_to_string(&options.config).unwrap_or_else(|e| {
        die(&format!(
            "cannot read config '{}': {}",
            options.config.display(),
            e
        ))
    });
    toml::from_str(&raw).unwrap_or_else(|e| {
        die(&format!(
            "config '{}' is invalid: {}",
            options.config.display(),
            e
        ))
    })
}

fn open_db(config: &SystemConfig) -> MailDb {
    if let Err(e) = fs::create_dir_all(&config.general.data_dir) {
        die(&format!(
            "cannot create data dir '{}': {}",
            config.general.data_dir.display(),
            e
        ));
    }
    MailDb::new(&config.general.data_dir.join("briefbox.sqlite"))
        .unwrap_or_else(|e| die(&format!("cannot open database: {}", e)))
}

fn die(message: &str) -> ! {
    eprintln!("briefbox: {}", message);
    // EX_CONFIG; every fatal condition here is a setup problem.
    std::process::exit(78)
}
