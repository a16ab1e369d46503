//! # Engine Audio Decoding
//!
//! Turns the engine's input (a seekable byte stream or a file) into the
//! 16kHz mono `f32` samples the Whisper front end expects.
//!
//! ## Accepted Input:
//! - **Containers/codecs**: whatever symphonia probes (WAV, MP3, FLAC, Ogg Vorbis, MP4/AAC)
//! - **Channels**: any count, averaged down to mono
//! - **Sample rate**: any, band-limited sinc resampling to 16kHz
//!
//! The container is detected from the bytes, never from a file extension,
//! since temporary files always carry the configured suffix.
//!
//! A zero-length input is treated as zero samples (silence), not as an error.

use crate::engine::{AudioInput, EngineError, ReadSeek};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::fs::File;
use std::io::{Cursor, SeekFrom};
use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::FormatOptions;
use symphonia::core::io::{MediaSource, MediaSourceStream};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

/// Sample rate Whisper models are trained on.
pub const SAMPLE_RATE: u32 = 16_000;

/// Input frames per resampler call.
const RESAMPLE_CHUNK: usize = 1024;

/// Decode whatever the engine was handed into 16kHz mono samples.
pub fn load_input(input: AudioInput<'_>) -> Result<Vec<f32>, EngineError> {
    match input {
        AudioInput::Stream(reader) => decode(reader),
        AudioInput::File(path) => {
            let file = File::open(path)?;
            if file.metadata()?.len() == 0 {
                return Ok(Vec::new());
            }
            decode_source(Box::new(file))
        }
    }
}

/// Decode an in-memory stream into 16kHz mono samples.
pub fn decode(reader: &mut dyn ReadSeek) -> Result<Vec<f32>, EngineError> {
    reader.seek(SeekFrom::Start(0))?;
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes)?;
    if bytes.is_empty() {
        return Ok(Vec::new());
    }
    decode_source(Box::new(Cursor::new(bytes)))
}

fn decode_source(source: Box<dyn MediaSource>) -> Result<Vec<f32>, EngineError> {
    let stream = MediaSourceStream::new(source, Default::default());
    let probed = symphonia::default::get_probe()
        .format(
            &Hint::new(),
            stream,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| EngineError::Decode(format!("unrecognized audio container: {}", e)))?;
    let mut format = probed.format;

    let track = format
        .tracks()
        .iter()
        .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
        .ok_or_else(|| EngineError::Decode("no audio track found".to_string()))?;
    let track_id = track.id;
    let codec_params = track.codec_params.clone();
    let sample_rate = codec_params
        .sample_rate
        .ok_or_else(|| EngineError::Decode("audio track has no sample rate".to_string()))?;

    let mut decoder = symphonia::default::get_codecs()
        .make(&codec_params, &DecoderOptions::default())
        .map_err(|e| EngineError::Decode(format!("unsupported codec: {}", e)))?;

    let mut mono = Vec::new();
    let mut channels = 0;
    loop {
        let packet = match format.next_packet() {
            Ok(packet) => packet,
            Err(SymphoniaError::IoError(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break
            }
            Err(SymphoniaError::ResetRequired) => break,
            Err(e) => return Err(EngineError::Decode(format!("could not read packet: {}", e))),
        };
        if packet.track_id() != track_id {
            continue;
        }

        let decoded = match decoder.decode(&packet) {
            Ok(decoded) => decoded,
            Err(SymphoniaError::DecodeError(e)) => {
                tracing::warn!("Skipping corrupt audio packet: {}", e);
                continue;
            }
            Err(e) => return Err(EngineError::Decode(e.to_string())),
        };

        let spec = *decoded.spec();
        channels = spec.channels.count();
        let mut buffer = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
        buffer.copy_interleaved_ref(decoded);
        mono.extend(downmix(buffer.samples(), channels));
    }

    tracing::debug!(
        codec = ?codec_params.codec,
        channels,
        sample_rate,
        samples = mono.len(),
        "Decoded audio input"
    );

    resample(&mono, sample_rate, SAMPLE_RATE)
}

/// Average interleaved frames down to one channel.
pub fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Windowed-sinc resampling of mono audio.
///
/// The output is aligned with the input (the filter delay is trimmed) and
/// holds `len * to_rate / from_rate` samples, rounded.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, EngineError> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let params = SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    };
    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let mut resampler = SincFixedIn::<f32>::new(ratio, 1.0, params, RESAMPLE_CHUNK, 1)
        .map_err(|e| EngineError::Resample(e.to_string()))?;

    let expected = (samples.len() as f64 * ratio).round() as usize;
    let delay = resampler.output_delay();
    let mut output = Vec::with_capacity(delay + expected + RESAMPLE_CHUNK);

    let mut chunks = samples.chunks(RESAMPLE_CHUNK);
    while output.len() < delay + expected {
        // past the end of the input, keep feeding silence to flush the filter
        let mut chunk = chunks.next().map(<[f32]>::to_vec).unwrap_or_default();
        chunk.resize(RESAMPLE_CHUNK, 0.0);

        let resampled = resampler
            .process(&vec![chunk], None)
            .map_err(|e| EngineError::Resample(e.to_string()))?;
        if let Some(channel) = resampled.into_iter().next() {
            output.extend(channel);
        }
    }

    output.drain(..delay);
    output.truncate(expected);
    Ok(output)
}
