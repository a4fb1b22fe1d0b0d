//! promhook exporter
//!
//! Loads the configuration, builds the metrics registry and serves it from a
//! standalone exporter until interrupted.

use clap::Parser;
use promhook::cli::{Cli, Command, generate_config_template};
use promhook::{config::Config, exporter, handlers::AppState, telemetry};
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Some(Command::Config { output }) => {
            let template = generate_config_template();
            match output {
                Some(path) => {
                    std::fs::write(&path, template)?;
                    eprintln!("Configuration template written to {}", path);
                }
                None => print!("{}", template),
            }
            Ok(())
        }
        Some(Command::Serve) | None => serve(&cli.config).await,
    }
}

async fn serve(config_path: &str) -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_file(config_path)?;

    telemetry::init(&config.observability.log_level);

    tracing::info!(config = %config_path, "Starting promhook");

    let state = AppState::new(Arc::new(config))?;
    state.export_migrations();
    let flusher = state.start_shard_flusher();

    let running = match exporter::start(state.clone()).await? {
        Some(running) => {
            tracing::info!(
                "Metrics available at http://{}{}",
                running.addr(),
                state.config().export.path
            );
            Some(running)
        }
        None => {
            tracing::warn!("Standalone exporter not running, set export.port or export.port_range");
            None
        }
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    if let Some(running) = running {
        running.shutdown();
    }
    if let Some(flusher) = flusher {
        flusher.shutdown().await;
    }
    if let Some(shard) = state.shard() {
        shard.cleanup()?;
    }

    Ok(())
}
