use clap::Parser;
use skald_core::{AppConfig, SkaldError};
use skald_pipeline::Coordinator;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Edge client for the voice assistant: captures speech, streams it to the
/// server, and renders the replies.
#[derive(Parser)]
#[command(name = "skald", version)]
struct Cli {
    /// Path to the TOML config file (defaults to the user config dir)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

/// A stalled audio device exits with a distinct code so a supervisor can
/// tell "restart me" from configuration mistakes.
const EXIT_AUDIO_STALL: u8 = 2;

fn load_config(path: Option<PathBuf>) -> Result<AppConfig, SkaldError> {
    let path = match path {
        Some(path) => path,
        None => AppConfig::default_config_file()?,
    };

    if path.exists() {
        info!("Loading config from {}", path.display());
        AppConfig::load_from_file(&path)
    } else {
        info!("No config at {}, using defaults", path.display());
        Ok(AppConfig::default())
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(e) => {
                    error!("Failed to install SIGTERM handler: {}", e);
                    let _ = ctrl_c.await;
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config = match load_config(cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("Bad configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut coordinator = match Coordinator::new(config) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!("Startup failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = coordinator.run() => match result {
            Err(e) if e.is_fatal() => {
                error!("Fatal audio fault: {}", e);
                ExitCode::from(EXIT_AUDIO_STALL)
            }
            Err(e) => {
                error!("Unrecoverable error: {}", e);
                ExitCode::FAILURE
            }
            Ok(()) => ExitCode::SUCCESS,
        },
        _ = shutdown_signal() => {
            info!("Shutting down");
            ExitCode::SUCCESS
        }
    }
}
