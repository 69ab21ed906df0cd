//! # Airwave Server
//!
//! One shared radio timeline, broadcast to every connected listener.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! airwave
//!
//! # Run with custom config
//! airwave --config /path/to/airwave.toml
//!
//! # Run with environment variables
//! AIRWAVE_PORT=8080 AIRWAVE_LIBRARY=library.toml airwave
//! ```

mod config;
mod handlers;
mod library;
mod metrics;

use anyhow::{bail, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_LOG_FILTER: &str =
    "airwave=debug,airwave_core=debug,airwave_transport=debug,tower_http=debug";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let mut args = std::env::args().skip(1);
    let config = match (args.next().as_deref(), args.next()) {
        (Some("--config"), Some(path)) => config::Config::from_file(path)?,
        (None, _) => config::Config::load()?,
        _ => bail!("Usage: airwave [--config <path>]"),
    };

    tracing::info!("Starting Airwave server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
