//! authtunnel CLI - tunnel TCP and UDP through an identity-aware proxy
//!
//! Connections are carried over HTTP/3, HTTP/2 or HTTP/1.1 CONNECT,
//! whichever the proxy supports, with a browser login when required.

use anyhow::{Context, Result};
use authtunnel_client::{Tunnel, TunnelConfig};
use authtunnel_transport::{LogEvents, TlsOptions};
use clap::{Args, Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// authtunnel - reach TCP and UDP services behind an identity-aware proxy
#[derive(Parser, Debug)]
#[command(name = "authtunnel")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(flatten)]
    options: CommonOptions,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct CommonOptions {
    /// Skip certificate verification (insecure, for development only)
    #[arg(long, global = true, env = "AUTHTUNNEL_INSECURE")]
    insecure: bool,

    /// PEM bundle of additional trusted CA certificates
    #[arg(long, global = true, env = "AUTHTUNNEL_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// PEM client certificate presented to the proxy
    #[arg(long, global = true, env = "AUTHTUNNEL_CLIENT_CERT", requires = "client_key")]
    client_cert: Option<PathBuf>,

    /// PEM private key of the client certificate
    #[arg(long, global = true, env = "AUTHTUNNEL_CLIENT_KEY", requires = "client_cert")]
    client_key: Option<PathBuf>,

    /// Service account token used instead of a browser login
    #[arg(long, global = true, env = "AUTHTUNNEL_SERVICE_ACCOUNT")]
    service_account: Option<String>,

    /// File containing the service account token
    #[arg(long, global = true, env = "AUTHTUNNEL_SERVICE_ACCOUNT_FILE")]
    service_account_file: Option<PathBuf>,

    /// Command used to open the login URL
    #[arg(long, global = true, env = "AUTHTUNNEL_BROWSER_CMD")]
    browser_cmd: Option<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Tunnel TCP connections to a destination
    #[command(long_about = r#"
Listen locally and tunnel every accepted TCP connection to the destination
through the proxy. With `--listen -` a single connection is made over
stdin/stdout, which suits ssh's ProxyCommand.

EXAMPLES:
  # Reach redis through the proxy at redis.example.com:443
  authtunnel tcp redis.example.com:6379 --listen 127.0.0.1:6379

  # Use an explicit proxy
  authtunnel tcp db.internal:5432 --proxy-url https://proxy.example.com

  # ssh ProxyCommand
  ssh -o ProxyCommand='authtunnel tcp %h:%p --listen -' host.example.com
    "#)]
    Tcp {
        /// Destination host:port
        destination: String,

        /// Local address to listen on, or `-` for stdin/stdout
        #[arg(long, env = "AUTHTUNNEL_LISTEN", default_value = "127.0.0.1:0")]
        listen: String,

        /// Proxy URL; defaults to https://<destination host>:443
        #[arg(long, env = "AUTHTUNNEL_PROXY_URL", default_value = "")]
        proxy_url: String,
    },

    /// Tunnel UDP packets to a destination
    Udp {
        /// Destination host:port
        destination: String,

        /// Local address to listen on
        #[arg(long, env = "AUTHTUNNEL_LISTEN", default_value = "127.0.0.1:0")]
        listen: String,

        /// Proxy URL; defaults to https://<destination host>:443
        #[arg(long, env = "AUTHTUNNEL_PROXY_URL", default_value = "")]
        proxy_url: String,
    },
}

/// Setup logging with the specified log level
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_writer(io::stderr),
        )
        .with(filter)
        .init();
}

fn build_config(options: &CommonOptions, destination: &str, proxy_url: &str) -> Result<TunnelConfig> {
    let mut config = TunnelConfig::from_urls(destination, proxy_url)
        .with_context(|| format!("invalid destination {} or proxy {}", destination, proxy_url))?;

    if let Some(tls) = config.tls.as_mut() {
        *tls = tls_options(options);
    } else if options.insecure || options.ca_cert.is_some() || options.client_cert.is_some() {
        warn!("TLS options ignored for a cleartext proxy");
    }

    config.service_account = options.service_account.clone();
    config.service_account_file = options.service_account_file.clone();
    config.browser_command = options.browser_cmd.clone();
    Ok(config)
}

fn tls_options(options: &CommonOptions) -> TlsOptions {
    let mut tls = TlsOptions::default();
    if options.insecure {
        warn!("⚠️  Certificate verification disabled (insecure mode)");
        tls = tls.with_insecure_skip_verify();
    }
    if let Some(ca) = &options.ca_cert {
        tls = tls.with_ca_cert(ca);
    }
    if let (Some(cert), Some(key)) = (&options.client_cert, &options.client_key) {
        tls = tls.with_client_cert(cert, key);
    }
    tls
}

async fn run_tcp(cancel: CancellationToken, tunnel: Tunnel, listen: &str) -> Result<()> {
    if listen == "-" {
        let events = LogEvents::new(tunnel.config().destination.clone());
        let mut stdio = tokio::io::join(tokio::io::stdin(), tokio::io::stdout());
        return tunnel
            .run(&cancel, &mut stdio, &events)
            .await
            .context("tunnel failed");
    }

    Arc::new(tunnel)
        .run_listener(&cancel, listen)
        .await
        .context("tcp listener failed")
}

async fn run_udp(cancel: CancellationToken, tunnel: Tunnel, listen: &str) -> Result<()> {
    match Arc::new(tunnel).run_udp_listener(&cancel, listen).await {
        Err(e) if e.is_cancelled() => Ok(()),
        result => result.context("udp listener failed"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    setup_logging(cli.verbose);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down...");
                cancel.cancel();
            }
        });
    }

    let result = match &cli.command {
        Commands::Tcp {
            destination,
            listen,
            proxy_url,
        } => {
            let config = build_config(&cli.options, destination, proxy_url)?;
            info!(
                destination = %config.destination,
                proxy = %config.proxy_host,
                tls = config.tls.is_some(),
                "starting tcp tunnel"
            );
            let tunnel = Tunnel::new(config).context("failed to create tunnel")?;
            run_tcp(cancel.clone(), tunnel, listen).await
        }
        Commands::Udp {
            destination,
            listen,
            proxy_url,
        } => {
            let config = build_config(&cli.options, destination, proxy_url)?;
            info!(
                destination = %config.destination,
                proxy = %config.proxy_host,
                tls = config.tls.is_some(),
                "starting udp tunnel"
            );
            let tunnel = Tunnel::new(config).context("failed to create tunnel")?;
            run_udp(cancel.clone(), tunnel, listen).await
        }
    };

    match result {
        Err(e) if cancel.is_cancelled() => {
            info!("stopped: {:#}", e);
            Ok(())
        }
        other => other,
    }
}
