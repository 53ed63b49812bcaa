//! domaingate - Main entry point
//!
//! Multi-tenant TLS-terminating gateway

use anyhow::{Context, Result};
use clap::Parser;
use domaingate::{CertbotIssuer, Gateway, GatewayConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_DATAPATH: &str = "./gateway-data";

/// domaingate - A multi-tenant TLS-terminating gateway
#[derive(Parser, Debug)]
#[command(name = "domaingate")]
#[command(version = "1.0.0")]
#[command(about = "A multi-tenant TLS-terminating gateway")]
struct Args {
    /// Data directory; domains live in <datapath>/domains/<name>
    #[arg(long, env = "DATAPATH")]
    datapath: Option<PathBuf>,

    /// Create the data directory if it does not exist
    #[arg(long, env = "CREATE_DIR", default_value = "false")]
    create_dir: bool,

    /// HTTP port to listen on
    #[arg(long, env = "HTTP_PORT", default_value = "80")]
    http_port: u16,

    /// HTTPS port to listen on
    #[arg(long, env = "HTTPS_PORT", default_value = "443")]
    https_port: u16,

    /// Log level
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Start without root privileges
    #[arg(long, env = "SKIP_PRIVILEGE_CHECK", default_value = "false")]
    skip_privilege_check: bool,

    /// certbot executable
    #[arg(long, env = "CERTBOT", default_value = "certbot")]
    certbot: PathBuf,

    /// Where certbot stores issued certificates
    #[arg(long, env = "CERTBOT_LIVE_DIR", default_value = "/etc/letsencrypt/live")]
    certbot_live_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .init();

    // A panicking connection task must not take the gateway down
    std::panic::set_hook(Box::new(|panic| {
        error!("panic: {}", panic);
    }));

    info!("Starting domaingate v1.0.0");

    let root = match args.datapath {
        Some(path) => path,
        None => {
            warn!("DATAPATH not set, using {}", DEFAULT_DATAPATH);
            PathBuf::from(DEFAULT_DATAPATH)
        }
    };

    let config = GatewayConfig {
        root,
        create_dir: args.create_dir,
        tls_addr: SocketAddr::from(([0, 0, 0, 0], args.https_port)),
        plaintext_addr: SocketAddr::from(([0, 0, 0, 0], args.http_port)),
        require_privilege: !args.skip_privilege_check,
        ..GatewayConfig::default()
    };
    info!("Data directory: {}", config.root.display());
    info!("HTTPS port: {}", args.https_port);
    info!("HTTP port: {}", args.http_port);

    let issuer = Arc::new(CertbotIssuer::new(args.certbot, args.certbot_live_dir));
    let gateway = Gateway::start(config, issuer)
        .await
        .context("gateway failed to start")?;

    info!("domaingate started successfully");

    tokio::signal::ctrl_c()
        .await
        .context("could not listen for shutdown signal")?;

    info!("Shutting down");
    gateway.shutdown();

    Ok(())
}
