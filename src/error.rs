//! # Error Handling
//!
//! The service reports exactly four kinds of failure. Each one keeps the
//! original cause reachable through `std::error::Error::source` instead of
//! repeating it in its own message; [`ServiceError::report`] renders the
//! whole chain on one line.
//!
//! ## Error Categories:
//! - **Initialization**: the engine could not be constructed (fatal until a new initialize succeeds)
//! - **NotInitialized**: a transcription arrived before any successful initialize
//! - **Adaptation**: the request bytes could not be turned into engine input (per request)
//! - **Inference**: the engine failed while transcribing (per request)
//!
//! ## JSON Error Format:
//! Boundaries that need a structured body can use [`ServiceError::to_json`]:
//! ```json
//! {
//!   "error": {
//!     "type": "inference_error",
//!     "message": "transcription failed: could not decode audio: no audio track found",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use crate::engine::{EngineConfig, EngineError};
use serde_json::json;
use std::error::Error;

/// Failures surfaced by the engine slot and the transcription service.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    /// The engine could not be constructed for the given configuration
    #[error("failed to initialize engine ({config})")]
    Initialization {
        config: EngineConfig,
        #[source]
        source: EngineError,
    },

    /// No engine has been successfully initialized yet
    #[error("transcription engine is not initialized")]
    NotInitialized,

    /// The request bytes could not be prepared for the engine
    #[error("failed to prepare audio input: {message}")]
    Adaptation {
        message: String,
        #[source]
        source: std::io::Error,
    },

    /// The engine failed while producing the transcript
    #[error("transcription failed")]
    Inference {
        #[source]
        source: EngineError,
    },
}

impl ServiceError {
    pub fn initialization(config: EngineConfig, source: EngineError) -> Self {
        ServiceError::Initialization { config, source }
    }

    pub fn adaptation(message: impl Into<String>, source: std::io::Error) -> Self {
        ServiceError::Adaptation {
            message: message.into(),
            source,
        }
    }

    pub fn inference(source: EngineError) -> Self {
        ServiceError::Inference { source }
    }

    /// Machine-readable error type.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::Initialization { .. } => "initialization_error",
            ServiceError::NotInitialized => "not_initialized",
            ServiceError::Adaptation { .. } => "adaptation_error",
            ServiceError::Inference { .. } => "inference_error",
        }
    }

    /// Whether the failure only affects the call that produced it.
    pub fn is_per_request(&self) -> bool {
        matches!(
            self,
            ServiceError::Adaptation { .. } | ServiceError::Inference { .. }
        )
    }

    /// This error followed by each of its causes, separated by `: `.
    pub fn report(&self) -> String {
        let mut report = self.to_string();
        let mut cause = self.source();
        while let Some(e) = cause {
            report.push_str(": ");
            report.push_str(&e.to_string());
            cause = e.source();
        }
        report
    }

    /// Render the error the way a transport boundary would report it.
    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "error": {
                "type": self.kind(),
                "message": self.report(),
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        })
    }
}

/// Shorthand for results carrying a [`ServiceError`].
pub type ServiceResult<T> = Result<T, ServiceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        let init = ServiceError::initialization(
            EngineConfig::default(),
            EngineError::ModelAssets("missing".to_string()),
        );
        assert_eq!(init.kind(), "initialization_error");
        assert!(!init.is_per_request());

        assert_eq!(ServiceError::NotInitialized.kind(), "not_initialized");
        assert!(!ServiceError::NotInitialized.is_per_request());

        let adapt = ServiceError::adaptation(
            "temp dir unavailable",
            std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        );
        assert_eq!(adapt.kind(), "adaptation_error");
        assert!(adapt.is_per_request());
    }

    #[test]
    fn test_inference_error_keeps_cause() {
        let err = ServiceError::inference(EngineError::Decode("no audio track found".to_string()));
        assert_eq!(err.to_string(), "transcription failed");

        let source = err.source().expect("cause should be retained");
        assert_eq!(source.to_string(), "could not decode audio: no audio track found");
    }

    #[test]
    fn test_report_names_each_cause_once() {
        let err = ServiceError::initialization(
            EngineConfig::default(),
            EngineError::ModelAssets("model.gguf missing".to_string()),
        );
        let report = err.report();

        assert_eq!(
            report,
            "failed to initialize engine (tiny/cpu/int8): model assets unavailable: model.gguf missing"
        );
        assert_eq!(report.matches("model.gguf missing").count(), 1);

        let chain = format!("{:#}", anyhow::Error::new(err));
        assert_eq!(chain.matches("model.gguf missing").count(), 1);
    }

    #[test]
    fn test_json_body() {
        let body = ServiceError::NotInitialized.to_json();
        assert_eq!(body["error"]["type"], "not_initialized");
        assert_eq!(body["error"]["message"], "transcription engine is not initialized");
        assert!(body["error"]["timestamp"].is_string());

        let body = ServiceError::inference(EngineError::Inference("segment 2 failed".to_string()))
            .to_json();
        assert_eq!(
            body["error"]["message"],
            "transcription failed: inference failed: segment 2 failed"
        );
    }
}
