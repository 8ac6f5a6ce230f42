use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use truenas_session::{config::Config, server};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/Default.toml")]
    config: String,

    /// TrueNAS host (overrides config)
    #[arg(long, env = "TRUENAS_HOST")]
    truenas_host: Option<String>,

    /// TrueNAS API key (overrides config)
    #[arg(long, env = "TRUENAS_API_KEY", hide_env_values = true)]
    truenas_api_key: Option<String>,

    /// Port to listen on for metrics
    #[arg(short, long, env = "MONITOR_PORT", default_value = "9100")]
    port: u16,

    /// Address to bind to
    #[arg(short, long, env = "MONITOR_ADDR", default_value = "0.0.0.0")]
    addr: String,

    /// Extra event topic to subscribe to (repeatable)
    #[arg(long = "topic")]
    topics: Vec<String>,

    /// Per-call timeout in seconds (overrides config)
    #[arg(long, env = "TRUENAS_REQUEST_TIMEOUT")]
    request_timeout: Option<u64>,

    /// Give up after this many consecutive failed reconnects instead of retrying forever
    #[arg(long, env = "TRUENAS_MAX_RETRIES")]
    max_retries: Option<u32>,

    /// Accept self-signed TLS certificates
    #[arg(long)]
    insecure: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "Starting TrueNAS session monitor v{}",
        env!("CARGO_PKG_VERSION")
    );

    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration
    let mut config = Config::load(&args.config)?;

    // Override with CLI arguments if provided
    if let Some(host) = args.truenas_host {
        config.truenas.host = host;
    }
    if let Some(api_key) = args.truenas_api_key {
        config.truenas.api_key = secrecy::SecretString::new(api_key.into());
    }
    if args.insecure {
        config.truenas.verify_ssl = false;
    }
    if let Some(secs) = args.request_timeout {
        config.session.request_timeout_secs = secs;
    }
    if args.max_retries.is_some() {
        config.session.max_retries = args.max_retries;
    }
    config.server.port = args.port;
    config.server.addr = args.addr;
    config.monitor.topics.extend(args.topics);

    // Overrides can invalidate what the file load already checked
    config
        .session
        .validate()
        .context("Invalid session settings on the command line")?;

    info!("Configuration loaded successfully");
    info!("TrueNAS endpoint: {}", config.truenas.websocket_url());
    if !config.truenas.verify_ssl {
        warn!("TLS certificate verification is disabled");
    }
    info!(
        "Subscribing to {} topic(s): {:?}",
        config.monitor.topics.len(),
        config.monitor.topics
    );
    info!(
        "Metrics endpoint: http://{}:{}/metrics",
        config.server.addr, config.server.port
    );

    // Run the session and the monitor until Ctrl-C
    if let Err(e) = server::start(config).await {
        error!("Monitor error: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
