//! # Candle Whisper Engine
//!
//! The production [`InferenceEngine`]: Whisper running on candle, with weights
//! pulled from the HuggingFace hub.
//!
//! ## Model Loading Process:
//! 1. Resolve the compute device and reject unsupported precision pairings
//! 2. Download config, tokenizer and weights (cached locally by hf-hub)
//! 3. Build the model on a blocking thread (safetensors mmap or GGUF)
//! 4. Resolve the special tokens the decoder needs from the tokenizer
//!
//! ## Weights per Precision:
//! - **float32 / float16**: `openai/whisper-{size}` safetensors
//! - **int8**: `lmz/candle-whisper` q8_0 GGUF files
//!
//! ## Decoding:
//! The clip is split into 30 second windows which are decoded greedily, one
//! window per pull of the segment stream. The detected language is computed
//! from the first window before any segment is produced.

use crate::device::DeviceManager;
use crate::engine::mel;
use crate::engine::{
    audio, AudioInput, ComputePrecision, DeviceKind, EngineConfig, EngineError, EngineLoader,
    EngineSegment, InferenceEngine, LanguageInfo, SegmentStream,
};
use async_trait::async_trait;
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_transformers::models::whisper::{self as m, Config};
use hf_hub::api::tokio::{Api, ApiBuilder, ApiRepo};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokenizers::Tokenizer;

const QUANTIZED_REPO: &str = "lmz/candle-whisper";

/// Language codes in the order of Whisper's language tokens.
const LANGUAGES: &[&str] = &[
    "en", "zh", "de", "es", "ru", "ko", "fr", "ja", "pt", "tr", "pl", "ca", "nl", "ar", "sv",
    "it", "id", "hi", "fi", "vi", "he", "uk", "el", "ms", "cs", "ro", "da", "hu", "ta", "no",
    "th", "ur", "hr", "bg", "lt", "la", "mi", "ml", "cy", "sk", "te", "fa", "lv", "bn", "sr",
    "az", "sl", "kn", "et", "mk", "br", "eu", "is", "hy", "ne", "mn", "bs", "kk", "sq", "sw",
    "gl", "mr", "pa", "si", "km", "sn", "yo", "so", "af", "oc", "ka", "be", "tg", "sd", "gu",
    "am", "yi", "lo", "uz", "fo", "ht", "ps", "tk", "nn", "mt", "sa", "lb", "my", "bo", "tl",
    "mg", "as", "tt", "haw", "ln", "ha", "ba", "jw", "su",
];

/// Full-precision or quantized Whisper weights behind one interface.
enum Model {
    Normal(m::model::Whisper),
    Quantized(m::quantized_model::Whisper),
}

impl Model {
    fn config(&self) -> &Config {
        match self {
            Model::Normal(m) => &m.config,
            Model::Quantized(m) => &m.config,
        }
    }

    fn encoder_forward(&mut self, x: &Tensor, flush: bool) -> candle_core::Result<Tensor> {
        match self {
            Model::Normal(m) => m.encoder.forward(x, flush),
            Model::Quantized(m) => m.encoder.forward(x, flush),
        }
    }

    fn decoder_forward(
        &mut self,
        x: &Tensor,
        xa: &Tensor,
        flush: bool,
    ) -> candle_core::Result<Tensor> {
        match self {
            Model::Normal(m) => m.decoder.forward(x, xa, flush),
            Model::Quantized(m) => m.decoder.forward(x, xa, flush),
        }
    }

    fn decoder_final_linear(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Model::Normal(m) => m.decoder.final_linear(x),
            Model::Quantized(m) => m.decoder.final_linear(x),
        }
    }

    /// Logits for one decoder position, as plain `f32`s.
    fn logits_at(&self, ys: &Tensor, position: usize) -> candle_core::Result<Vec<f32>> {
        self.decoder_final_linear(&ys.i((..1, position..position + 1))?)?
            .i(0)?
            .i(0)?
            .to_dtype(DType::F32)?
            .to_vec1::<f32>()
    }
}

/// Special token ids resolved from the tokenizer once at load time.
struct SpecialTokens {
    sot: u32,
    transcribe: u32,
    no_timestamps: u32,
    eot: u32,
    no_speech: Option<u32>,
    /// `(code, token id)` for every language the vocabulary knows
    languages: Vec<(&'static str, u32)>,
}

impl SpecialTokens {
    fn resolve(tokenizer: &Tokenizer) -> Result<Self, EngineError> {
        let required = |token: &str| {
            tokenizer.token_to_id(token).ok_or_else(|| {
                EngineError::ModelAssets(format!("tokenizer has no {} token", token))
            })
        };

        let languages = LANGUAGES
            .iter()
            .filter_map(|code| {
                tokenizer
                    .token_to_id(&format!("<|{}|>", code))
                    .map(|id| (*code, id))
            })
            .collect();

        Ok(Self {
            sot: required(m::SOT_TOKEN)?,
            transcribe: required(m::TRANSCRIBE_TOKEN)?,
            no_timestamps: required(m::NO_TIMESTAMPS_TOKEN)?,
            eot: required(m::EOT_TOKEN)?,
            no_speech: m::NO_SPEECH_TOKENS
                .iter()
                .find_map(|token| tokenizer.token_to_id(token)),
            languages,
        })
    }
}

/// Loads [`WhisperEngine`]s from the HuggingFace hub.
#[derive(Debug, Default, Clone, Copy)]
pub struct WhisperLoader;

#[async_trait]
impl EngineLoader for WhisperLoader {
    async fn load(&self, config: &EngineConfig) -> Result<Arc<dyn InferenceEngine>, EngineError> {
        let engine = WhisperEngine::load(*config).await?;
        Ok(Arc::new(engine))
    }
}

struct ModelFiles {
    config: PathBuf,
    tokenizer: PathBuf,
    weights: PathBuf,
}

/// A loaded Whisper model.
///
/// ## Thread Safety:
/// The decoder keeps a cross-attention cache inside the model, so the model
/// sits behind a mutex and concurrent transcriptions take turns per clip.
pub struct WhisperEngine {
    name: String,
    model: Mutex<Model>,
    tokenizer: Tokenizer,
    tokens: SpecialTokens,
    device: Device,
    dtype: DType,
    mel_filters: Vec<f32>,
    suppress_mask: Vec<f32>,
}

impl WhisperEngine {
    /// Load the model described by `config`.
    ///
    /// ## Returns:
    /// - **Ok(WhisperEngine)**: Model loaded and ready
    /// - **Err(EngineError)**: Unsupported pairing, missing assets or bad weights
    pub async fn load(config: EngineConfig) -> Result<Self, EngineError> {
        if config.compute_precision == ComputePrecision::Float16
            && config.device == DeviceKind::Cpu
        {
            return Err(EngineError::UnsupportedConfiguration(
                "float16 weights require an accelerator device".to_string(),
            ));
        }

        let device = DeviceManager::resolve(config.device)?;
        tracing::info!(
            "Loading Whisper {} model (~{}MB) on {}",
            config.model_size,
            config.model_size.size_mb(),
            DeviceManager::describe(&device)
        );

        let start_time = Instant::now();
        let files = Self::fetch(&config).await?;
        tracing::debug!("Model files ready in {:.2}s", start_time.elapsed().as_secs_f64());

        let build_device = device.clone();
        tokio::task::spawn_blocking(move || Self::build(config, files, build_device))
            .await
            .map_err(|e| EngineError::Panicked(e.to_string()))?
    }

    async fn fetch(config: &EngineConfig) -> Result<ModelFiles, EngineError> {
        let api = hub_api()?;
        let size = config.model_size.as_str();

        let (repo_name, config_file, tokenizer_file, weights_file) = match config.compute_precision
        {
            ComputePrecision::Int8 => (
                QUANTIZED_REPO.to_string(),
                format!("config-{}.json", size),
                format!("tokenizer-{}.json", size),
                format!("model-{}-q80.gguf", size),
            ),
            ComputePrecision::Float16 | ComputePrecision::Float32 => (
                config.model_size.repo_name().to_string(),
                "config.json".to_string(),
                "tokenizer.json".to_string(),
                "model.safetensors".to_string(),
            ),
        };

        tracing::info!("Fetching model files from {}", repo_name);
        let repo = api.model(repo_name.clone());

        Ok(ModelFiles {
            config: fetch_file(&repo, &repo_name, &config_file).await?,
            tokenizer: fetch_file(&repo, &repo_name, &tokenizer_file).await?,
            weights: fetch_file(&repo, &repo_name, &weights_file).await?,
        })
    }

    fn build(config: EngineConfig, files: ModelFiles, device: Device) -> Result<Self, EngineError> {
        let model_config: Config = serde_json::from_reader(std::fs::File::open(&files.config)?)
            .map_err(|e| EngineError::ModelAssets(format!("invalid model config: {}", e)))?;
        let tokenizer = Tokenizer::from_file(&files.tokenizer)
            .map_err(|e| EngineError::ModelAssets(format!("failed to load tokenizer: {}", e)))?;
        let tokens = SpecialTokens::resolve(&tokenizer)?;

        let (model, dtype) = match config.compute_precision {
            ComputePrecision::Int8 => {
                let vb = candle_transformers::quantized_var_builder::VarBuilder::from_gguf(
                    &files.weights,
                    &device,
                )?;
                let model = m::quantized_model::Whisper::load(&vb, model_config.clone())?;
                (Model::Quantized(model), DType::F32)
            }
            ComputePrecision::Float16 | ComputePrecision::Float32 => {
                let dtype = if config.compute_precision == ComputePrecision::Float16 {
                    DType::F16
                } else {
                    DType::F32
                };
                // SAFETY: the weights file is owned by the hub cache and not
                // modified while mapped.
                let vb = unsafe {
                    candle_nn::VarBuilder::from_mmaped_safetensors(&[&files.weights], dtype, &device)?
                };
                let model = m::model::Whisper::load(&vb, model_config.clone())?;
                (Model::Normal(model), dtype)
            }
        };

        let mel_filters = mel::filter_bank(
            m::SAMPLE_RATE as u32,
            m::N_FFT,
            model_config.num_mel_bins,
        );
        let suppress_mask = suppress_mask(
            model_config.vocab_size,
            &model_config.suppress_tokens,
            tokens.no_timestamps,
        );

        tracing::debug!(
            languages = tokens.languages.len(),
            vocab_size = model_config.vocab_size,
            "Whisper model built"
        );

        Ok(Self {
            name: format!("candle-whisper-{}", config.model_size),
            model: Mutex::new(model),
            tokenizer,
            tokens,
            device,
            dtype,
            mel_filters,
            suppress_mask,
        })
    }

    /// Log-mel spectrogram of the whole clip, shaped `(1, n_mels, frames)`.
    fn spectrogram(&self, config: &Config, samples: &[f32]) -> Result<Tensor, EngineError> {
        let mel = m::audio::pcm_to_mel(config, samples, self.mel_filters.as_slice());
        let n_mels = config.num_mel_bins;
        let frames = mel.len() / n_mels;
        let mel = Tensor::from_vec(mel, (1, n_mels, frames), &self.device)?;
        Ok(mel.to_dtype(self.dtype)?)
    }

    /// Pick the most likely language from the first window.
    fn detect_language(
        &self,
        model: &mut Model,
        mel: &Tensor,
    ) -> Result<(LanguageInfo, Option<u32>), EngineError> {
        if self.tokens.languages.is_empty() {
            return Ok((
                LanguageInfo {
                    language: "en".to_string(),
                    probability: 1.0,
                },
                None,
            ));
        }

        let (_, _, frames) = mel.dims3()?;
        let window = mel.narrow(2, 0, frames.min(m::N_FRAMES))?;
        let features = model.encoder_forward(&window, true)?;
        let prompt = Tensor::new(&[[self.tokens.sot]], &self.device)?;
        let ys = model.decoder_forward(&prompt, &features, true)?;
        let logits = model.logits_at(&ys, 0)?;

        let candidates: Vec<f32> = self
            .tokens
            .languages
            .iter()
            .map(|(_, id)| logits.get(*id as usize).copied().unwrap_or(f32::NEG_INFINITY))
            .collect();
        let probs = softmax(&candidates);
        let best = argmax(&probs);
        let (code, token) = self.tokens.languages[best];

        tracing::debug!("Detected language {} (p={:.3})", code, probs[best]);
        Ok((
            LanguageInfo {
                language: code.to_string(),
                probability: probs[best],
            },
            Some(token),
        ))
    }
}

impl InferenceEngine for WhisperEngine {
    fn name(&self) -> &str {
        &self.name
    }

    fn transcribe<'a>(
        &'a self,
        input: AudioInput<'a>,
    ) -> Result<Box<dyn SegmentStream + 'a>, EngineError> {
        let kind = input.kind();
        let samples = audio::load_input(input)?;
        tracing::debug!(input = kind, samples = samples.len(), "Audio decoded");
        let mut model = self.model.lock().unwrap_or_else(PoisonError::into_inner);

        if samples.is_empty() {
            return Ok(Box::new(WhisperSegments::silent(self, model)));
        }

        let config = model.config().clone();
        let mel = self.spectrogram(&config, &samples)?;
        let (_, _, mel_frames) = mel.dims3()?;
        let content_frames = (samples.len() / m::HOP_LENGTH).clamp(1, mel_frames);
        let duration = samples.len() as f64 / m::SAMPLE_RATE as f64;

        let (language, language_token) = self.detect_language(&mut model, &mel)?;

        let mut prompt = vec![self.tokens.sot];
        prompt.extend(language_token);
        prompt.push(self.tokens.transcribe);
        prompt.push(self.tokens.no_timestamps);

        Ok(Box::new(WhisperSegments {
            engine: self,
            model,
            mel: Some(mel),
            prompt,
            content_frames,
            duration,
            seek: 0,
            exhausted: false,
            language,
        }))
    }
}

/// Lazy window-by-window decoder for one clip. Holds the model lock until dropped.
struct WhisperSegments<'a> {
    engine: &'a WhisperEngine,
    model: MutexGuard<'a, Model>,
    mel: Option<Tensor>,
    prompt: Vec<u32>,
    content_frames: usize,
    duration: f64,
    seek: usize,
    exhausted: bool,
    language: LanguageInfo,
}

impl<'a> WhisperSegments<'a> {
    fn silent(engine: &'a WhisperEngine, model: MutexGuard<'a, Model>) -> Self {
        Self {
            engine,
            model,
            mel: None,
            prompt: Vec::new(),
            content_frames: 0,
            duration: 0.0,
            seek: 0,
            exhausted: false,
            language: LanguageInfo::undetermined(),
        }
    }

    /// Decode the window starting at `seek`. `None` means the window held no speech.
    fn decode_window(
        &mut self,
        mel: &Tensor,
        seek: usize,
        size: usize,
    ) -> Result<Option<EngineSegment>, EngineError> {
        let engine = self.engine;
        let model = &mut *self.model;

        let start = window_seconds(seek);
        let end = (start + window_seconds(size)).min(self.duration);

        let window = mel.narrow(2, seek, size)?;
        let features = model.encoder_forward(&window, true)?;

        let max_positions = model.config().max_target_positions;
        let mut tokens = self.prompt.clone();
        let mut sum_logprob = 0.0f64;
        let mut generated = 0usize;
        let mut no_speech_prob = 0.0f64;

        for i in 0..max_positions / 2 {
            let input = Tensor::new(tokens.as_slice(), &engine.device)?.unsqueeze(0)?;
            let ys = model.decoder_forward(&input, &features, i == 0)?;

            if i == 0 {
                if let Some(id) = engine.tokens.no_speech {
                    let first = model.logits_at(&ys, 0)?;
                    no_speech_prob = softmax(&first).get(id as usize).copied().unwrap_or(0.0) as f64;
                }
            }

            let (_, seq_len, _) = ys.dims3()?;
            let mut logits = model.logits_at(&ys, seq_len - 1)?;
            for (logit, mask) in logits.iter_mut().zip(&engine.suppress_mask) {
                *logit += mask;
            }

            let next = argmax(&logits) as u32;
            if next == engine.tokens.eot || tokens.len() > max_positions {
                break;
            }
            sum_logprob += log_softmax_at(&logits, next as usize);
            generated += 1;
            tokens.push(next);
        }

        let avg_logprob = sum_logprob / generated.max(1) as f64;
        if no_speech_prob > m::NO_SPEECH_THRESHOLD && avg_logprob < m::LOGPROB_THRESHOLD {
            tracing::debug!(
                "Skipping window at {:.2}s (no_speech={:.2}, avg_logprob={:.2})",
                start,
                no_speech_prob,
                avg_logprob
            );
            return Ok(None);
        }

        let text = engine
            .tokenizer
            .decode(&tokens[self.prompt.len()..], true)
            .map_err(|e| EngineError::Inference(format!("failed to decode tokens: {}", e)))?;

        Ok(Some(EngineSegment { start, end, text }))
    }
}

impl Iterator for WhisperSegments<'_> {
    type Item = Result<EngineSegment, EngineError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.exhausted {
                return None;
            }
            let Some(mel) = self.mel.clone() else {
                self.exhausted = true;
                return None;
            };
            if self.seek >= self.content_frames {
                self.exhausted = true;
                return None;
            }

            let seek = self.seek;
            let size = (self.content_frames - seek).min(m::N_FRAMES);
            self.seek += size;

            match self.decode_window(&mel, seek, size) {
                Ok(Some(segment)) => return Some(Ok(segment)),
                Ok(None) => continue,
                Err(e) => {
                    self.exhausted = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

impl SegmentStream for WhisperSegments<'_> {
    fn finish(self: Box<Self>) -> Result<LanguageInfo, EngineError> {
        if !self.exhausted {
            return Err(EngineError::Inference(
                "language requested before all segments were consumed".to_string(),
            ));
        }
        Ok(self.language)
    }
}

fn hub_api() -> Result<Api, EngineError> {
    let mut builder = ApiBuilder::new().with_progress(false);

    if let Ok(token) = std::env::var("HF_TOKEN") {
        tracing::debug!("Using HF token (length: {})", token.len());
        builder = builder.with_token(Some(token));
    }

    if let Ok(cache_dir) = std::env::var("HF_HUB_CACHE") {
        builder = builder.with_cache_dir(cache_dir.into());
    } else if let Ok(hf_home) = std::env::var("HF_HOME") {
        builder = builder.with_cache_dir(PathBuf::from(hf_home).join("hub"));
    }

    builder
        .build()
        .map_err(|e| EngineError::ModelAssets(format!("failed to create HuggingFace client: {}", e)))
}

async fn fetch_file(repo: &ApiRepo, repo_name: &str, file: &str) -> Result<PathBuf, EngineError> {
    let path = repo.get(file).await.map_err(|e| {
        EngineError::ModelAssets(format!("failed to fetch {} from {}: {}", file, repo_name, e))
    })?;
    tracing::debug!("{} available at {:?}", file, path);
    Ok(path)
}

fn window_seconds(frames: usize) -> f64 {
    (frames * m::HOP_LENGTH) as f64 / m::SAMPLE_RATE as f64
}

/// Additive mask removing configured tokens and every timestamp token.
fn suppress_mask(vocab_size: usize, suppress_tokens: &[u32], no_timestamps: u32) -> Vec<f32> {
    (0..vocab_size as u32)
        .map(|id| {
            if suppress_tokens.contains(&id) || id > no_timestamps {
                f32::NEG_INFINITY
            } else {
                0.0
            }
        })
        .collect()
}

fn argmax(values: &[f32]) -> usize {
    values
        .iter()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)
        .unwrap_or(0)
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

fn log_softmax_at(logits: &[f32], index: usize) -> f64 {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max) as f64;
    let sum: f64 = logits.iter().map(|l| (*l as f64 - max).exp()).sum();
    logits[index] as f64 - max - sum.ln()
}
