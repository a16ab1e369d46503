//! # Transcription Module
//!
//! The request path of the service: raw audio bytes in, normalized
//! transcript out.
//!
//! ## Key Components:
//! - **Input adaptation**: in-memory stream or temporary file, chosen per deployment
//! - **Transcription service**: runs the shared engine and normalizes its output

pub mod adapter; // How request bytes reach the engine
pub mod service; // Request entry point and result normalization

pub use adapter::{build_adapter, AdapterStrategy};
pub use service::TranscriptionService;
