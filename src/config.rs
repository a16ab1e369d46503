//! # Configuration Management
//!
//! This module handles loading and managing application configuration from multiple sources:
//! - TOML configuration file (`config.toml`, or the path given with `--config`)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Environment variables (`APP__ENGINE__MODEL_SIZE`, `APP__ADAPTER__STRATEGY`, etc.)
//! 2. Configuration file
//! 3. Default values (defined in the Default impl)
//!
//! Nested keys are separated by a double underscore so that field names
//! containing a single underscore (`model_size`, `temp_dir`) stay intact.

use crate::engine::EngineConfig;
use crate::transcription::AdapterStrategy;
use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main application configuration that contains all settings.
///
/// ## Why separate config structs:
/// The engine settings are fixed once the model is loaded, while the adapter
/// settings only shape how each request's bytes reach the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub adapter: AdapterSettings,
}

/// How request bytes are handed to the engine.
///
/// ## Fields:
/// - `strategy`: `memory` (seekable in-memory stream) or `file` (temporary file)
/// - `temp_dir`: directory for temporary files; the system temp dir when unset
/// - `file_extension`: extension given to temporary files, without the dot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterSettings {
    pub strategy: AdapterStrategy,
    pub temp_dir: Option<PathBuf>,
    pub file_extension: String,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            strategy: AdapterStrategy::Memory,
            temp_dir: None,
            file_extension: "wav".to_string(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(), // tiny / cpu / int8
            adapter: AdapterSettings::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from multiple sources in priority order.
    ///
    /// ## Parameters:
    /// - **path**: explicit configuration file; when given it must exist.
    ///   Without it an optional `config.toml` in the working directory is used.
    ///
    /// ## Environment Variable Examples:
    /// - `APP__ENGINE__MODEL_SIZE=small`: Override the Whisper model size
    /// - `APP__ENGINE__DEVICE=accelerator`: Run on a GPU
    /// - `APP__ADAPTER__STRATEGY=file`: Hand the engine temporary files
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name("config").required(false),
        };

        let settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(file)
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Validate that the configuration values make sense.
    ///
    /// ## What this checks:
    /// - The temporary file extension is non-empty and is not a path
    /// - A configured temporary directory exists
    ///
    /// Engine combinations (e.g. float16 on cpu) are not checked here; the
    /// engine rejects them when it is initialized.
    pub fn validate(&self) -> Result<()> {
        let extension = &self.adapter.file_extension;
        if extension.is_empty() {
            return Err(anyhow!("Adapter file extension cannot be empty"));
        }
        if extension.contains(['/', '\\']) {
            return Err(anyhow!(
                "Adapter file extension must not contain a path separator: {}",
                extension
            ));
        }

        if let Some(dir) = &self.adapter.temp_dir {
            if !dir.is_dir() {
                return Err(anyhow!(
                    "Adapter temp directory does not exist: {}",
                    dir.display()
                ));
            }
        }

        Ok(())
    }
}
