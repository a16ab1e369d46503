//! # Whisper Service - Main Application Entry Point
//!
//! Command-line front end for the in-process transcription service.
//!
//! ## Commands:
//! - **transcribe**: transcribe one or more audio files, printing one JSON object per file
//! - **bench**: run a clip through the service repeatedly and print latency statistics
//!
//! ## Application Architecture:
//! - **config**: Handles application configuration (TOML files + environment variables)
//! - **engine**: Engine contract, lifecycle slot and the candle Whisper engine
//! - **device**: Compute device selection
//! - **transcription**: Input adaptation and the transcription service
//! - **bench**: Sequential / concurrent benchmark
//! - **error**: Service error types and their JSON rendering

mod bench;
mod config;
mod device;
mod engine;
mod error;
mod transcription;

#[cfg(test)]
mod testing;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::AppConfig;
use engine::whisper::WhisperLoader;
use engine::EngineSlot;
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transcription::{build_adapter, TranscriptionService};

#[derive(Debug, Parser)]
#[command(name = "whisper-service", version, about = "Local Whisper transcription service")]
struct Cli {
    /// Configuration file (defaults to an optional ./config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Transcribe audio files and print the results as JSON lines
    Transcribe {
        #[arg(required = true)]
        files: Vec<PathBuf>,
    },
    /// Benchmark the service with one audio clip
    Bench {
        file: PathBuf,

        /// Requests per pass
        #[arg(long, default_value_t = 10)]
        requests: usize,

        #[arg(long, value_enum, default_value = "both")]
        mode: bench::BenchMode,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file (if it exists)
    dotenv::dotenv().ok();
    init_tracing()?;

    let cli = Cli::parse();

    let config = AppConfig::load(cli.config.as_deref())?;
    config.validate()?;

    info!("Starting whisper-service v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "Configuration loaded: engine {}, {} input strategy",
        config.engine, config.adapter.strategy
    );

    let slot = Arc::new(EngineSlot::new(Arc::new(WhisperLoader)));
    let handle = slot.initialize(config.engine).await?;
    info!(
        "Engine {} ready (loaded in {:.2}s at {})",
        handle.engine().name(),
        handle.load_time().as_secs_f64(),
        handle.loaded_at().to_rfc3339()
    );

    let service = TranscriptionService::new(slot, build_adapter(&config.adapter));

    match cli.command {
        Command::Transcribe { files } => {
            for file in files {
                let audio = tokio::fs::read(&file)
                    .await
                    .with_context(|| format!("failed to read {}", file.display()))?;
                let line = match service.transcribe(audio).await {
                    Ok(result) => json!({ "file": file, "result": result }),
                    Err(e) if e.is_per_request() => {
                        let mut body = e.to_json();
                        body["file"] = json!(file);
                        body
                    }
                    Err(e) => return Err(e.into()),
                };
                println!("{}", serde_json::to_string(&line)?);
            }
        }
        Command::Bench {
            file,
            requests,
            mode,
        } => {
            let audio = tokio::fs::read(&file)
                .await
                .with_context(|| format!("failed to read {}", file.display()))?;
            let report = bench::run(&service, audio, requests, mode).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

/// Initialize the tracing (logging) system for the application.
///
/// ## Environment Variables:
/// - `RUST_LOG`: Controls what gets logged (e.g., "debug", "whisper_service=debug")
/// - If not set, defaults to "whisper_service=info"
///
/// Logs go to stderr so stdout stays machine-readable JSON.
fn init_tracing() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "whisper_service=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    Ok(())
}
