//! # Curb Server
//!
//! Real-time trip dispatch server: riders request trips, drivers pick them
//! up, and every state change streams to the topics that care.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! curb
//!
//! # Run with environment variables
//! CURB_PORT=8080 CURB_HOST=0.0.0.0 curb
//! ```
//!
//! Configuration is read from `curb.toml` if present (see `config.rs` for
//! the search paths), including the provisioned user/token table.

mod config;
mod handlers;
mod http;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "curb=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Curb server on {}:{}", config.host, config.port);
    if config.users.is_empty() {
        tracing::warn!("No users provisioned; every connection will be unauthenticated");
    }

    // Initialize metrics
    metrics::init_metrics();

    // Start the server
    handlers::run_server(config).await?;

    Ok(())
}
