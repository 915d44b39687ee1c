//! # Webhook Bridge Binary
//!
//! Entry point for the bridge server: parse arguments, initialise
//! tracing, load and validate configuration, then serve until a shutdown
//! signal arrives.
//!
//! ```bash
//! # Default configuration file (config.toml, optional)
//! webhook-bridge
//!
//! # Explicit configuration and overrides
//! webhook-bridge --config bridge.toml --port 9090 --log-level debug
//! ```

use clap::Parser;
use webhook_bridge::config::BridgeConfig;

/// Command line arguments for the webhook bridge server.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Override the configured server port.
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the configured server host.
    #[arg(long)]
    host: Option<String>,

    /// Override the configured log level filter.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = BridgeConfig::load(Some(&args.config))?;
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }
    config.validate()?;

    // Structured logging per configuration; JSON output for log shippers.
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.level));
    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    tracing::info!(version = webhook_bridge::VERSION, "starting webhook bridge");
    webhook_bridge::server::run(config).await
}
