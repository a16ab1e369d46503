//! Test doubles shared by the unit tests.
//!
//! The fake engine treats its input as UTF-8 text describing the transcript:
//! `"hello| world"` yields two one-second segments. A few markers script
//! failures:
//! - leading `FAIL`: `transcribe` itself returns an error
//! - a segment equal to `!boom`: that pull of the stream fails
//! - a segment equal to `!panic`: that pull of the stream panics

use crate::engine::{
    AudioInput, ComputePrecision, DeviceKind, EngineConfig, EngineError, EngineLoader,
    EngineSegment, InferenceEngine, LanguageInfo, SegmentStream,
};
use async_trait::async_trait;
use std::io::Cursor;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Encode 16-bit PCM samples as a WAV file.
pub fn wav_bytes(sample_rate: u32, channels: u16, samples: &[i16]) -> Vec<u8> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut out = Cursor::new(Vec::new());
    let mut writer = hound::WavWriter::new(&mut out, spec).expect("wav writer should be created");
    for sample in samples {
        writer.write_sample(*sample).expect("sample should be written");
    }
    writer.finalize().expect("wav should be finalized");
    out.into_inner()
}

/// `frames` silent MPEG-1 Layer III frames: 44.1kHz mono at 128kbps, with
/// zeroed side info and main data.
pub fn silent_mp3_bytes(frames: usize) -> Vec<u8> {
    const FRAME_LEN: usize = 417;
    let mut frame = vec![0u8; FRAME_LEN];
    frame[..4].copy_from_slice(&[0xFF, 0xFB, 0x90, 0xC4]);
    frame.repeat(frames)
}

/// Loader that builds [`FakeEngine`]s and counts how often it was asked to.
#[derive(Default)]
pub struct FakeLoader {
    delay: Option<Duration>,
    loads: AtomicUsize,
}

impl FakeLoader {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineLoader for FakeLoader {
    async fn load(&self, config: &EngineConfig) -> Result<Arc<dyn InferenceEngine>, EngineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if config.compute_precision == ComputePrecision::Float16 && config.device == DeviceKind::Cpu
        {
            return Err(EngineError::UnsupportedConfiguration(
                "float16 requires an accelerator".to_string(),
            ));
        }
        Ok(Arc::new(FakeEngine))
    }
}

/// Scripted engine, see the module docs for the input format.
#[derive(Default)]
pub struct FakeEngine;

impl InferenceEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    fn transcribe<'a>(
        &'a self,
        input: AudioInput<'a>,
    ) -> Result<Box<dyn SegmentStream + 'a>, EngineError> {
        let (bytes, path) = match input {
            AudioInput::Stream(reader) => {
                let mut bytes = Vec::new();
                reader.read_to_end(&mut bytes)?;
                (bytes, None)
            }
            AudioInput::File(path) => (std::fs::read(path)?, Some(path.to_path_buf())),
        };
        let payload =
            String::from_utf8(bytes).map_err(|e| EngineError::Decode(e.to_string()))?;

        if payload.starts_with("FAIL") {
            return Err(EngineError::Inference(format!("scripted failure: {}", payload)));
        }

        let texts: Vec<String> = if payload.is_empty() {
            Vec::new()
        } else {
            payload.split('|').map(str::to_string).collect()
        };
        let language = if texts.is_empty() {
            LanguageInfo::undetermined()
        } else {
            LanguageInfo {
                language: "en".to_string(),
                probability: 0.9,
            }
        };

        Ok(Box::new(FakeStream {
            texts: texts.into_iter().enumerate(),
            path,
            exhausted: false,
            language,
        }))
    }
}

struct FakeStream {
    texts: std::iter::Enumerate<std::vec::IntoIter<String>>,
    path: Option<PathBuf>,
    exhausted: bool,
    language: LanguageInfo,
}

impl Iterator for FakeStream {
    type Item = Result<EngineSegment, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(path) = &self.path {
            if !path.exists() {
                return Some(Err(EngineError::Inference(format!(
                    "input file {} disappeared mid-stream",
                    path.display()
                ))));
            }
        }

        let Some((i, text)) = self.texts.next() else {
            self.exhausted = true;
            return None;
        };
        match text.as_str() {
            "!boom" => Some(Err(EngineError::Inference(format!("segment {} failed", i)))),
            "!panic" => panic!("scripted panic in segment {}", i),
            _ => Some(Ok(EngineSegment {
                start: i as f64,
                end: (i + 1) as f64,
                text,
            })),
        }
    }
}

impl SegmentStream for FakeStream {
    fn finish(self: Box<Self>) -> Result<LanguageInfo, EngineError> {
        if !self.exhausted {
            return Err(EngineError::Inference(
                "language read before the stream was exhausted".to_string(),
            ));
        }
        Ok(self.language)
    }
}
