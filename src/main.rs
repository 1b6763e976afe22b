use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gatehouse::{Config, Engine};

#[derive(Parser, Debug)]
#[command(name = "gatehouse")]
#[command(about = "Dynamically-configured HTTP reverse-proxy gateway")]
struct Args {
    /// Check the environment configuration and exit.
    #[arg(long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gatehouse=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;

    if args.validate_config {
        info!("Configuration is valid");
        return Ok(());
    }

    info!(
        port = config.server.port,
        auth = config.auth.enabled,
        rate_limit = config.gateway.rate_limit_enabled,
        tracing = config.tracing.enabled,
        service = %config.tracing.service_name,
        "Starting gatehouse"
    );

    Engine::new(config).await?.run().await
}
