//! Ricochet - Main entry point
//!
//! Out-of-band interaction capture server for DNS, HTTP and SMTP.

use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;
use tracing_subscriber::EnvFilter;

use ricochet_config::{
    AcmeSettings, CompanionConfig, CompanionMode, ConfigError, ListenerPorts, ServerConfig,
};
use ricochet_server::{wait_for_signal, App, TokenSource};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Ricochet - out-of-band interaction capture server
#[derive(Parser, Debug)]
#[command(name = "ricochet")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Domain the server is authoritative for
    #[arg(long, env = "RICOCHET_DOMAIN")]
    domain: String,

    /// Public IP address returned in DNS answers
    #[arg(long = "ip", env = "RICOCHET_IP")]
    public_ip: Option<IpAddr>,

    /// Address every listener binds to
    #[arg(long, env = "RICOCHET_LISTEN_IP", default_value = "0.0.0.0")]
    listen_ip: IpAddr,

    /// Hostmaster email (default admin@<domain>)
    #[arg(long, env = "RICOCHET_HOSTMASTER")]
    hostmaster: Option<String>,

    /// Days an idle correlation id is retained
    #[arg(long, env = "RICOCHET_EVICTION", default_value_t = 7)]
    eviction: u64,

    /// Ingest a responder companion log
    #[arg(long)]
    responder: bool,

    /// Ingest an SMB companion log
    #[arg(long)]
    smb: bool,

    /// Require a client token
    #[arg(long)]
    auth: bool,

    /// Client token (implies --auth)
    #[arg(long, env = "RICOCHET_TOKEN")]
    token: Option<String>,

    /// Enable client template upload (implies --auth)
    #[arg(long)]
    template: bool,

    /// Do not request certificates from the ACME authority
    #[arg(long)]
    skip_acme: bool,

    /// Access-Control-Allow-Origin value for API responses
    #[arg(
        long,
        env = "RICOCHET_ORIGIN_URL",
        default_value = "https://interact.example.org"
    )]
    origin_url: String,

    /// Record interactions with the bare domain (implies --auth)
    #[arg(long)]
    root_tld: bool,

    /// Debug logging
    #[arg(long)]
    debug: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[arg(long, env = "RICOCHET_DNS_PORT", default_value_t = 53)]
    dns_port: u16,

    #[arg(long, env = "RICOCHET_HTTP_PORT", default_value_t = 80)]
    http_port: u16,

    #[arg(long, env = "RICOCHET_HTTPS_PORT", default_value_t = 443)]
    https_port: u16,

    #[arg(long, env = "RICOCHET_SMTP_PORT", default_value_t = 25)]
    smtp_port: u16,

    #[arg(long, env = "RICOCHET_SMTPS_PORT", default_value_t = 465)]
    smtps_port: u16,

    /// ACME directory URL (default Let's Encrypt)
    #[arg(long, env = "RICOCHET_ACME_DIRECTORY")]
    acme_directory: Option<String>,

    /// Where ACME credentials and certificates are stored
    #[arg(long, env = "RICOCHET_ACME_STORAGE", default_value = "acme")]
    acme_storage: PathBuf,

    /// Use the Let's Encrypt staging directory
    #[arg(long)]
    acme_staging: bool,

    /// Renew when the certificate expires within this many days
    #[arg(long, default_value_t = 30)]
    renew_before_days: u32,

    /// Seconds to wait for the authority to validate a challenge
    #[arg(long, default_value_t = 120)]
    acme_validation_timeout: u64,

    /// Log file written by the SMB companion
    #[arg(long, env = "RICOCHET_SMB_LOG", default_value = "smb.log")]
    smb_log: PathBuf,

    /// Log file written by the responder companion
    #[arg(long, env = "RICOCHET_RESPONDER_LOG", default_value = "responder.log")]
    responder_log: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

impl Cli {
    fn into_config(self) -> Result<ServerConfig> {
        // responder and smb can't be active at the same time
        let companion = match (self.smb, self.responder) {
            (true, true) => return Err(ConfigError::ConflictingCompanions.into()),
            (true, false) => Some(CompanionConfig {
                mode: CompanionMode::Smb,
                log_path: self.smb_log,
            }),
            (false, true) => Some(CompanionConfig {
                mode: CompanionMode::Responder,
                log_path: self.responder_log,
            }),
            (false, false) => None,
        };

        let mut config = ServerConfig::for_domain(self.domain);
        config.public_ip = self.public_ip;
        config.listen_ip = self.listen_ip;
        config.hostmaster = self.hostmaster.unwrap_or_default();
        config.eviction_days = self.eviction;
        config.auth = self.auth;
        config.token = self.token;
        config.template = self.template;
        config.root_tld = self.root_tld;
        config.origin_url = self.origin_url;
        config.companion = companion;
        config.ports = ListenerPorts {
            dns: self.dns_port,
            http: self.http_port,
            https: self.https_port,
            smtp: self.smtp_port,
            smtps: self.smtps_port,
        };
        config.acme = AcmeSettings {
            enabled: !self.skip_acme,
            directory_url: self.acme_directory,
            staging: self.acme_staging,
            storage_path: self.acme_storage,
            renew_before_days: self.renew_before_days,
            validation_timeout_secs: self.acme_validation_timeout,
        };
        Ok(config)
    }
}

fn init_logging(debug: bool, format: LogFormat) {
    let level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug, cli.log_format);

    let config = cli.into_config()?;
    let app = App::builder(config)
        .build()
        .await
        .context("Failed to start ricochet")?;

    if let Some(token) = app.gate().token() {
        match app.gate().source() {
            Some(TokenSource::Generated) => {
                info!(token = %token.expose(), "Client authentication token generated");
            }
            _ => info!("Client authentication enabled with the supplied token"),
        }
    }

    let shutdown = app.shutdown();
    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.request_shutdown();
    });

    app.run().await;
    Ok(())
}
