use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use universal_validator::app::App;
use universal_validator::config::load_config;
use universal_validator::shutdown::Shutdown;
use universal_validator::vote::LogVoteHandler;

#[derive(Debug, Parser)]
#[command(version, about)]
struct Args {
    /// Path to the TOML configuration file. Environment variables with
    /// the `UV` prefix overlay it.
    #[arg(short, long, env = "UV_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = load_config(args.config.as_deref())?;

    let shutdown = Shutdown::spawn(config.app.shutdown_timeout, config.app.shutdown_delay);

    let app = App::new(config, Arc::new(LogVoteHandler), shutdown.clone()).await?;
    app.start().await;
    info!("Validator running, waiting for shutdown signal");

    shutdown.await_shutdown_begin().await;

    // Give cancelled tasks a chance to reach an await point.
    tokio::time::sleep(shutdown.delay()).await;

    if tokio::time::timeout(shutdown.timeout(), app.shutdown())
        .await
        .is_err()
    {
        tracing::error!("Timed out waiting for tasks to stop");
    }

    info!("Validator stopped");
    Ok(())
}
