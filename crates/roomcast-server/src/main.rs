//! # roomcast
//!
//! Real-time room hub server.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings (roomcast.toml in the working directory if present)
//! roomcast
//!
//! # Override settings from the environment
//! PORT=8080 ROOMCAST_HOST=0.0.0.0 ROOMCAST__LIMITS__MAX_CONNECTIONS=5000 roomcast
//! ```

use anyhow::Result;
use roomcast_server::{config::Config, handlers, metrics};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=info,roomcast_core=info,roomcast_server=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;

    tracing::info!("Starting roomcast server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
