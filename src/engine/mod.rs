//! # Inference Engine Contract
//!
//! Defines what the transcription service expects from a speech-to-text engine
//! and what it hands to one. The service never touches model internals; it only
//! sees the types in this module.
//!
//! ## Key Components:
//! - **EngineConfig**: model size, compute device and numeric precision, fixed at startup
//! - **InferenceEngine**: accepts a seekable stream or a file path and yields segments lazily
//! - **SegmentStream**: the lazy segment sequence plus the language side channel
//! - **EngineLoader**: the expensive construction step, kept separate so tests can fake it
//! - **EngineSlot / EngineHandle**: the once-constructed, shared engine instance (see `handle`)
//!
//! ## Whisper Model Sizes:
//! - **tiny**: ~39MB, fastest but least accurate
//! - **base**: ~74MB, good balance for development
//! - **small**: ~244MB, better accuracy
//! - **medium**: ~769MB, good technical vocabulary
//! - **large**: ~1550MB, best accuracy but slowest

pub mod audio;
pub mod handle;
pub mod mel;
pub mod whisper;

pub use handle::{EngineSlot, EngineState};

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::{Read, Seek};
use std::path::Path;
use std::sync::Arc;

/// Available Whisper model sizes with their characteristics.
///
/// ## Trade-offs:
/// - **Size vs Accuracy**: Larger models are more accurate but slower
/// - **Memory vs Speed**: More memory usage for better performance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSize {
    Tiny,
    Base,
    Small,
    Medium,
    Large,
}

impl ModelSize {
    /// Name used in asset file names and repository ids.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "tiny",
            ModelSize::Base => "base",
            ModelSize::Small => "small",
            ModelSize::Medium => "medium",
            ModelSize::Large => "large",
        }
    }

    /// Get the HuggingFace repository holding full-precision weights.
    pub fn repo_name(&self) -> &'static str {
        match self {
            ModelSize::Tiny => "openai/whisper-tiny",
            ModelSize::Base => "openai/whisper-base",
            ModelSize::Small => "openai/whisper-small",
            ModelSize::Medium => "openai/whisper-medium",
            ModelSize::Large => "openai/whisper-large-v2",
        }
    }

    /// Get the approximate model size in MB.
    pub fn size_mb(&self) -> u32 {
        match self {
            ModelSize::Tiny => 39,
            ModelSize::Base => 74,
            ModelSize::Small => 244,
            ModelSize::Medium => 769,
            ModelSize::Large => 1550,
        }
    }
}

impl std::str::FromStr for ModelSize {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "tiny" => Ok(ModelSize::Tiny),
            "base" => Ok(ModelSize::Base),
            "small" => Ok(ModelSize::Small),
            "medium" => Ok(ModelSize::Medium),
            "large" => Ok(ModelSize::Large),
            _ => Err(anyhow!("Unknown model size: {}", s)),
        }
    }
}

impl std::fmt::Display for ModelSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compute device the engine is placed on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    /// Any GPU the engine can reach (CUDA first, then Metal)
    Accelerator,
}

impl std::str::FromStr for DeviceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "cpu" => Ok(DeviceKind::Cpu),
            "accelerator" | "gpu" | "cuda" => Ok(DeviceKind::Accelerator),
            _ => Err(anyhow!("Unknown device: {}", s)),
        }
    }
}

impl std::fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceKind::Cpu => write!(f, "cpu"),
            DeviceKind::Accelerator => write!(f, "accelerator"),
        }
    }
}

/// Numeric format of the model weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputePrecision {
    Int8,
    Float16,
    Float32,
}

impl std::str::FromStr for ComputePrecision {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s.to_lowercase().as_str() {
            "int8" => Ok(ComputePrecision::Int8),
            "float16" | "f16" => Ok(ComputePrecision::Float16),
            "float32" | "f32" => Ok(ComputePrecision::Float32),
            _ => Err(anyhow!("Unknown compute precision: {}", s)),
        }
    }
}

impl std::fmt::Display for ComputePrecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputePrecision::Int8 => write!(f, "int8"),
            ComputePrecision::Float16 => write!(f, "float16"),
            ComputePrecision::Float32 => write!(f, "float32"),
        }
    }
}

/// Immutable engine parameters, chosen once at process start.
///
/// Whether a combination is actually loadable is decided by the engine;
/// an unsupported pairing surfaces as an initialization failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub model_size: ModelSize,
    pub device: DeviceKind,
    pub compute_precision: ComputePrecision,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_size: ModelSize::Tiny,
            device: DeviceKind::Cpu,
            compute_precision: ComputePrecision::Int8,
        }
    }
}

impl std::fmt::Display for EngineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.model_size, self.device, self.compute_precision)
    }
}

/// Failures raised by the engine collaborator itself.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("model assets unavailable: {0}")]
    ModelAssets(String),

    #[error("unsupported engine configuration: {0}")]
    UnsupportedConfiguration(String),

    #[error("could not decode audio: {0}")]
    Decode(String),

    #[error("could not resample audio: {0}")]
    Resample(String),

    #[error("inference failed: {0}")]
    Inference(String),

    #[error(transparent)]
    Candle(#[from] candle_core::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("engine panicked: {0}")]
    Panicked(String),

    #[error("another initialization is already in progress")]
    InitializationInProgress,
}

/// Anything the engine can read audio from and rewind.
pub trait ReadSeek: Read + Seek {}

impl<T: Read + Seek> ReadSeek for T {}

/// Input handed to the engine for one call.
pub enum AudioInput<'a> {
    /// Seekable in-memory stream over the request bytes
    Stream(&'a mut dyn ReadSeek),
    /// Path of a file holding the request bytes
    File(&'a Path),
}

impl AudioInput<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            AudioInput::Stream(_) => "stream",
            AudioInput::File(_) => "file",
        }
    }
}

/// One span of recognised speech as emitted by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSegment {
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds
    pub end: f64,
    pub text: String,
}

/// Detected language and its probability.
#[derive(Debug, Clone, PartialEq)]
pub struct LanguageInfo {
    pub language: String,
    pub probability: f32,
}

impl LanguageInfo {
    /// Reported when there was no audio to detect a language from.
    pub fn undetermined() -> Self {
        Self {
            language: "und".to_string(),
            probability: 0.0,
        }
    }
}

/// Lazily produced segments of one transcription.
///
/// The language side channel is only guaranteed to be final once the
/// iterator has been exhausted, so `finish` must be called after draining.
pub trait SegmentStream: Iterator<Item = Result<EngineSegment, EngineError>> {
    fn finish(self: Box<Self>) -> Result<LanguageInfo, EngineError>;
}

/// A loaded speech-to-text engine.
///
/// Implementations must tolerate concurrent `transcribe` calls from
/// several threads; any serialisation they need is their own business.
pub trait InferenceEngine: Send + Sync {
    /// Short identifier used in logs.
    fn name(&self) -> &str;

    fn transcribe<'a>(
        &'a self,
        input: AudioInput<'a>,
    ) -> Result<Box<dyn SegmentStream + 'a>, EngineError>;
}

/// Builds an engine from its configuration. Each call is a full model load.
#[async_trait]
pub trait EngineLoader: Send + Sync {
    async fn load(&self, config: &EngineConfig) -> Result<Arc<dyn InferenceEngine>, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_size_parsing() {
        assert_eq!("medium".parse::<ModelSize>().unwrap(), ModelSize::Medium);
        assert_eq!("LARGE".parse::<ModelSize>().unwrap(), ModelSize::Large);
        assert!("invalid".parse::<ModelSize>().is_err());
    }

    #[test]
    fn test_device_and_precision_parsing() {
        assert_eq!("cpu".parse::<DeviceKind>().unwrap(), DeviceKind::Cpu);
        assert_eq!("gpu".parse::<DeviceKind>().unwrap(), DeviceKind::Accelerator);
        assert_eq!("f16".parse::<ComputePrecision>().unwrap(), ComputePrecision::Float16);
        assert!("int4".parse::<ComputePrecision>().is_err());
    }

    #[test]
    fn test_engine_config_display() {
        let config = EngineConfig::default();
        assert_eq!(config.to_string(), "tiny/cpu/int8");
    }

    #[test]
    fn test_engine_config_deserializes_lowercase_names() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"model_size": "large", "device": "accelerator", "compute_precision": "float16"}"#,
        )
        .unwrap();
        assert_eq!(config.model_size, ModelSize::Large);
        assert_eq!(config.device, DeviceKind::Accelerator);
        assert_eq!(config.compute_precision, ComputePrecision::Float16);
    }
}
