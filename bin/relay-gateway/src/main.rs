use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use relay_core::{EncodingPolicy, ListenerTls, ProxyConfig, ServerCertPolicy};
use relay_proxy::shutdown::os_signal;
use relay_proxy::{
    CertificateResolver, DirectoryStore, LogEvent, Server, Shutdown, StoreScope, TransactionLogger,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const PROGRAM: &str = "relay-gateway";

/// Local HTTP endpoint that forwards every request to a target over mutual TLS
#[derive(Parser, Debug)]
#[command(name = PROGRAM, version, long_about = None)]
struct Cli {
    /// URL to listen on, e.g. http://localhost:8080/
    #[arg(env = "RELAY_LOCAL_URL")]
    local_url: String,

    /// Base URL of the target, e.g. https://api.example.com/
    #[arg(env = "RELAY_TARGET_URL")]
    target_url: String,

    /// Subject (or part of it) of the client certificate, e.g. CN=my-client
    #[arg(env = "RELAY_CERT_SUBJECT")]
    cert_subject: String,

    /// Forward request bodies in the charset the caller declared instead of UTF-8
    #[arg(long, env = "RELAY_PRESERVE_ENCODING")]
    preserve_encoding: bool,

    /// Write request and response bodies to the transaction log
    #[arg(
        long,
        env = "RELAY_LOG_BODY",
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value_t = true,
        default_missing_value = "true"
    )]
    log_body: bool,

    /// Validate the target's server certificate (default: accept any)
    #[arg(long, env = "RELAY_VERIFY_SERVER")]
    verify_server: bool,

    /// PEM bundle of trusted roots used with --verify-server instead of the system roots
    #[arg(long, env = "RELAY_CA_FILE", requires = "verify_server")]
    ca_file: Option<PathBuf>,

    /// Extra certificate store directory, searched before the default stores
    #[arg(long = "cert-store", env = "RELAY_CERT_STORES", value_delimiter = ',')]
    cert_stores: Vec<PathBuf>,

    /// Certificate for an https local URL
    #[arg(long, env = "RELAY_LISTEN_CERT", requires = "listen_key")]
    listen_cert: Option<PathBuf>,

    /// Private key for an https local URL
    #[arg(long, env = "RELAY_LISTEN_KEY", requires = "listen_cert")]
    listen_key: Option<PathBuf>,

    /// Upstream request timeout in seconds
    #[arg(long, env = "RELAY_TIMEOUT", default_value_t = 100)]
    timeout: u64,

    /// Transaction log file (default: ~/.local/share/relay-gateway/proxy.log)
    #[arg(long, env = "RELAY_LOG_FILE")]
    log_file: Option<PathBuf>,

    /// Console log level (trace, debug, info, warn, error)
    #[arg(long, env = "RELAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> Result<ProxyConfig> {
        let mut config = ProxyConfig::new(&self.local_url, &self.target_url, &self.cert_subject)?;

        config.encoding_policy = EncodingPolicy::from_flag(self.preserve_encoding);
        config.log_body = self.log_body;
        config.request_timeout = Duration::from_secs(self.timeout);
        config.cert_stores = self.cert_stores;
        if self.verify_server {
            config.server_cert_policy = ServerCertPolicy::Verify {
                ca_file: self.ca_file,
            };
        }
        if let (Some(cert_path), Some(key_path)) = (self.listen_cert, self.listen_key) {
            config.listener_tls = Some(ListenerTls {
                cert_path,
                key_path,
            });
        }
        config.log_path = match self.log_file {
            Some(path) => path,
            None => default_log_path(),
        };

        config.validate()?;
        Ok(config)
    }
}

fn default_log_path() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home)
            .join(".local/share")
            .join(PROGRAM)
            .join("proxy.log"),
        None => PathBuf::from("proxy.log"),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .with_context(|| format!("Invalid log level: {}", level))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;

    let config = cli.into_config()?;
    let logger = TransactionLogger::open(config.log_path.clone());

    let resolver = config
        .cert_stores
        .iter()
        .fold(CertificateResolver::new(), |resolver, dir| {
            resolver.add(DirectoryStore::new(StoreScope::User, dir))
        })
        .with_default_stores(PROGRAM);

    let shutdown = Shutdown::new();
    let server = match Server::start(&config, &resolver, logger.clone(), shutdown.clone()).await {
        Ok(server) => server,
        Err(e) => {
            logger.close().await;
            return Err(e.into());
        }
    };
    info!("Press Ctrl+C to stop");

    {
        let shutdown = shutdown.clone();
        let logger = logger.clone();
        tokio::spawn(async move {
            match os_signal().await {
                Ok(signal) => {
                    info!("Received {}", signal);
                    logger.record(LogEvent::Startup("[INFO] Shutdown signal received. Stopping..."));
                    shutdown.trigger();
                }
                Err(e) => error!("Failed to listen for shutdown signals: {}", e),
            }
        });
    }

    server.run().await?;
    logger.close().await;
    info!("Proxy stopped");
    Ok(())
}
