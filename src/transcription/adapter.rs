//! # Input Adaptation
//!
//! Turns the raw bytes of one request into something the engine can read.
//! Two strategies exist and one is picked per deployment:
//!
//! - **memory**: the bytes are wrapped in a seekable in-memory cursor
//! - **file**: the bytes are written to a uniquely named temporary file whose
//!   path is passed to the engine
//!
//! A [`PreparedInput`] owns whatever it created. Dropping it releases the
//! buffer or deletes the temporary file, on success, on error and while
//! unwinding from a panic alike.

use crate::config::AdapterSettings;
use crate::engine::AudioInput;
use crate::error::{ServiceError, ServiceResult};
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempPath;
use uuid::Uuid;

/// Which adaptation strategy a deployment uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterStrategy {
    Memory,
    File,
}

impl std::fmt::Display for AdapterStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterStrategy::Memory => write!(f, "memory"),
            AdapterStrategy::File => write!(f, "file"),
        }
    }
}

/// Prepares request bytes for the engine.
pub trait InputAdapter: Send + Sync {
    fn strategy(&self) -> AdapterStrategy;

    /// Take ownership of `audio` and produce engine input for one request.
    fn prepare(&self, audio: Vec<u8>, request_id: Uuid) -> ServiceResult<PreparedInput>;
}

/// Request input ready to be handed to the engine.
#[derive(Debug)]
pub enum PreparedInput {
    Memory(Cursor<Vec<u8>>),
    File(TempAudioFile),
}

impl PreparedInput {
    /// Borrow the prepared input in the form the engine accepts.
    pub fn as_input(&mut self) -> AudioInput<'_> {
        match self {
            PreparedInput::Memory(cursor) => AudioInput::Stream(cursor),
            PreparedInput::File(file) => AudioInput::File(file.path()),
        }
    }
}

/// Temporary audio file deleted when dropped.
#[derive(Debug)]
pub struct TempAudioFile {
    path: Option<TempPath>,
}

impl TempAudioFile {
    pub fn path(&self) -> &Path {
        self.path.as_deref().unwrap_or_else(|| Path::new(""))
    }
}

impl Drop for TempAudioFile {
    fn drop(&mut self) {
        let Some(path) = self.path.take() else {
            return;
        };
        let shown = path.display().to_string();
        match path.close() {
            Ok(()) => tracing::debug!(path = %shown, "Removed temporary audio file"),
            Err(e) => tracing::warn!(path = %shown, "Failed to remove temporary audio file: {}", e),
        }
    }
}

/// Hands the engine a seekable cursor over the request bytes.
#[derive(Debug, Default, Clone, Copy)]
pub struct InMemoryAdapter;

impl InputAdapter for InMemoryAdapter {
    fn strategy(&self) -> AdapterStrategy {
        AdapterStrategy::Memory
    }

    fn prepare(&self, audio: Vec<u8>, _request_id: Uuid) -> ServiceResult<PreparedInput> {
        Ok(PreparedInput::Memory(Cursor::new(audio)))
    }
}

/// Writes the request bytes to a temporary file and hands the engine its path.
///
/// File names embed the request id (`transcribe-<id>-XXXXXX.<ext>`), so
/// concurrent requests never share a file.
#[derive(Debug, Clone)]
pub struct TempFileAdapter {
    dir: PathBuf,
    extension: String,
}

impl TempFileAdapter {
    pub fn new(dir: PathBuf, extension: impl Into<String>) -> Self {
        Self {
            dir,
            extension: extension.into(),
        }
    }
}

impl InputAdapter for TempFileAdapter {
    fn strategy(&self) -> AdapterStrategy {
        AdapterStrategy::File
    }

    fn prepare(&self, audio: Vec<u8>, request_id: Uuid) -> ServiceResult<PreparedInput> {
        let mut file = tempfile::Builder::new()
            .prefix(&format!("transcribe-{}-", request_id))
            .suffix(&format!(".{}", self.extension))
            .tempfile_in(&self.dir)
            .map_err(|e| {
                ServiceError::adaptation(
                    format!("could not create temporary file in {}", self.dir.display()),
                    e,
                )
            })?;

        // on failure `file` is dropped here, which removes it
        file.write_all(&audio)
            .and_then(|()| file.flush())
            .map_err(|e| {
                ServiceError::adaptation(
                    format!("could not write audio to {}", file.path().display()),
                    e,
                )
            })?;

        let path = file.into_temp_path();
        tracing::debug!(bytes = audio.len(), "Wrote request audio to {}", path.display());

        Ok(PreparedInput::File(TempAudioFile { path: Some(path) }))
    }
}

/// Build the adapter a deployment is configured for.
pub fn build_adapter(settings: &AdapterSettings) -> Arc<dyn InputAdapter> {
    match settings.strategy {
        AdapterStrategy::Memory => Arc::new(InMemoryAdapter),
        AdapterStrategy::File => {
            let dir = settings
                .temp_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir);
            Arc::new(TempFileAdapter::new(dir, settings.file_extension.clone()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries(dir: &Path) -> usize {
        std::fs::read_dir(dir).unwrap().count()
    }

    #[test]
    fn test_memory_adapter_wraps_bytes() {
        let mut prepared = InMemoryAdapter.prepare(b"abc".to_vec(), Uuid::new_v4()).unwrap();
        let AudioInput::Stream(reader) = prepared.as_input() else {
            panic!("expected a stream");
        };
        let mut out = Vec::new();
        reader.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"abc");
    }

    #[test]
    fn test_file_adapter_writes_and_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = TempFileAdapter::new(dir.path().to_path_buf(), "wav");
        let request_id = Uuid::new_v4();

        let mut prepared = adapter.prepare(b"payload".to_vec(), request_id).unwrap();
        let path = match prepared.as_input() {
            AudioInput::File(path) => path.to_path_buf(),
            AudioInput::Stream(_) => panic!("expected a file"),
        };

        assert!(path.starts_with(dir.path()));
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with(&format!("transcribe-{}-", request_id)));
        assert!(name.ends_with(".wav"));
        assert_eq!(std::fs::read(&path).unwrap(), b"payload");

        drop(prepared);
        assert!(!path.exists());
        assert_eq!(entries(dir.path()), 0);
    }

    #[test]
    fn test_dropping_an_already_removed_file_only_warns() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = TempFileAdapter::new(dir.path().to_path_buf(), "wav");

        let mut prepared = adapter.prepare(b"payload".to_vec(), Uuid::new_v4()).unwrap();
        let AudioInput::File(path) = prepared.as_input() else {
            panic!("expected a file");
        };
        std::fs::remove_file(path).unwrap();

        drop(prepared);
        assert_eq!(entries(dir.path()), 0);
    }

    #[test]
    fn test_file_adapter_fails_for_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = TempFileAdapter::new(dir.path().join("missing"), "wav");

        let err = adapter.prepare(b"payload".to_vec(), Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, ServiceError::Adaptation { .. }));
        assert!(err.is_per_request());
    }

    #[test]
    fn test_concurrent_requests_get_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let adapter = TempFileAdapter::new(dir.path().to_path_buf(), "wav");

        let mut first = adapter.prepare(b"one".to_vec(), Uuid::new_v4()).unwrap();
        let mut second = adapter.prepare(b"two".to_vec(), Uuid::new_v4()).unwrap();
        let path_of = |input: &mut PreparedInput| match input.as_input() {
            AudioInput::File(path) => path.to_path_buf(),
            AudioInput::Stream(_) => unreachable!(),
        };

        assert_ne!(path_of(&mut first), path_of(&mut second));
        assert_eq!(entries(dir.path()), 2);
    }

    #[test]
    fn test_build_adapter_follows_settings() {
        let mut settings = AdapterSettings::default();
        assert_eq!(build_adapter(&settings).strategy(), AdapterStrategy::Memory);

        settings.strategy = AdapterStrategy::File;
        assert_eq!(build_adapter(&settings).strategy(), AdapterStrategy::File);
    }
}
