//! # Transcription Service
//!
//! The request-facing entry point. One call takes the complete audio of one
//! request and returns a normalized transcript or a typed failure.
//!
//! ## Request Flow:
//! 1. Fetch the current engine handle (fail fast if there is none)
//! 2. Adapt the bytes with the configured [`InputAdapter`]
//! 3. On a blocking thread: run the engine, drain its segments, read the language
//! 4. Release the adapted input, then return the result
//!
//! Requests share nothing but the engine handle, so any number of them may
//! be in flight at once.

use crate::engine::{EngineError, EngineSegment, EngineSlot, InferenceEngine, LanguageInfo};
use crate::error::{ServiceError, ServiceResult};
use crate::transcription::adapter::{AdapterStrategy, InputAdapter, PreparedInput};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// One timed span of the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    /// Start time in seconds
    pub start: f64,
    /// End time in seconds
    pub end: f64,
    /// Text with surrounding whitespace removed
    pub text: String,
}

/// The normalized outcome of one transcription.
///
/// `text` is always the segment texts joined by single spaces, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptionResult {
    pub text: String,
    pub language: String,
    /// Probability of the detected language, within [0, 1]
    pub language_confidence: f32,
    pub segments: Vec<Segment>,
}

/// Transcribes request audio with the shared engine.
///
/// ## Thread Safety:
/// Cheap to clone; every clone refers to the same engine slot and adapter.
#[derive(Clone)]
pub struct TranscriptionService {
    engine: Arc<EngineSlot>,
    adapter: Arc<dyn InputAdapter>,
}

impl TranscriptionService {
    pub fn new(engine: Arc<EngineSlot>, adapter: Arc<dyn InputAdapter>) -> Self {
        Self { engine, adapter }
    }

    pub fn engine(&self) -> &Arc<EngineSlot> {
        &self.engine
    }

    pub fn strategy(&self) -> AdapterStrategy {
        self.adapter.strategy()
    }

    /// Transcribe one complete audio payload.
    ///
    /// ## Parameters:
    /// - **audio**: the whole request body; an empty payload is valid and yields an empty transcript
    ///
    /// ## Returns:
    /// - **Ok(TranscriptionResult)**: normalized transcript
    /// - **Err(NotInitialized)**: no engine has been loaded; nothing else was attempted
    /// - **Err(Adaptation)**: the bytes could not be prepared for the engine
    /// - **Err(Inference)**: the engine failed, including a failure part way through the segments
    pub async fn transcribe(&self, audio: Vec<u8>) -> ServiceResult<TranscriptionResult> {
        let handle = self.engine.current().ok_or(ServiceError::NotInitialized)?;
        let adapter = self.adapter.clone();
        let request_id = Uuid::new_v4();
        let bytes = audio.len();

        tracing::debug!(
            %request_id,
            bytes,
            strategy = %adapter.strategy(),
            "Starting transcription"
        );
        let start_time = Instant::now();

        let outcome = tokio::task::spawn_blocking(move || {
            let prepared = adapter.prepare(audio, request_id)?;
            run(handle.engine(), prepared)
        })
        .await
        .map_err(|e| {
            let reason = if e.is_panic() {
                "engine panicked during transcription"
            } else {
                "transcription task was cancelled"
            };
            ServiceError::inference(EngineError::Panicked(reason.to_string()))
        })
        .and_then(|result| result);

        let elapsed_ms = start_time.elapsed().as_millis() as u64;
        match &outcome {
            Ok(result) => tracing::info!(
                %request_id,
                bytes,
                segments = result.segments.len(),
                elapsed_ms,
                "Transcribed audio in {:.2}s",
                elapsed_ms as f64 / 1000.0
            ),
            Err(e) => tracing::warn!(
                %request_id,
                bytes,
                elapsed_ms,
                error_type = e.kind(),
                "Transcription failed: {}",
                e.report()
            ),
        }

        outcome
    }
}

/// Run the engine over prepared input and release the input before returning.
fn run(engine: &dyn InferenceEngine, mut prepared: PreparedInput) -> ServiceResult<TranscriptionResult> {
    let outcome = drain(engine, &mut prepared);
    drop(prepared);
    outcome
}

fn drain(engine: &dyn InferenceEngine, prepared: &mut PreparedInput) -> ServiceResult<TranscriptionResult> {
    let mut stream = engine
        .transcribe(prepared.as_input())
        .map_err(ServiceError::inference)?;

    // realize every segment before touching the language side channel
    let mut segments = Vec::new();
    for segment in stream.by_ref() {
        segments.push(segment.map_err(ServiceError::inference)?);
    }
    let language = stream.finish().map_err(ServiceError::inference)?;

    normalize(segments, language)
}

/// Build the public result from raw engine output.
pub fn normalize(segments: Vec<EngineSegment>, language: LanguageInfo) -> ServiceResult<TranscriptionResult> {
    let segments = segments
        .into_iter()
        .map(|segment| {
            if !segment.start.is_finite() || !segment.end.is_finite() {
                return Err(ServiceError::inference(EngineError::Inference(format!(
                    "segment has non-finite timing ({}..{})",
                    segment.start, segment.end
                ))));
            }
            Ok(Segment {
                start: segment.start,
                end: segment.end,
                text: segment.text.trim().to_string(),
            })
        })
        .collect::<ServiceResult<Vec<_>>>()?;

    let text = segments
        .iter()
        .map(|segment| segment.text.as_str())
        .collect::<Vec<_>>()
        .join(" ");

    let language_confidence = if language.probability.is_nan() {
        0.0
    } else {
        language.probability.clamp(0.0, 1.0)
    };

    Ok(TranscriptionResult {
        text,
        language: language.language,
        language_confidence,
        segments,
    })
}
