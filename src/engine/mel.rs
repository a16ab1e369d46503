//! # Mel Filter Bank
//!
//! Builds the Slaney-style mel filter bank Whisper was trained with
//! (librosa `filters.mel` with `htk=False, norm="slaney"`), laid out row-major
//! as `n_mels x (n_fft / 2 + 1)` for `candle_transformers`' log-mel front end.

const MIN_LOG_HZ: f64 = 1_000.0;
const LINEAR_STEP_HZ: f64 = 200.0 / 3.0;

fn min_log_mel() -> f64 {
    MIN_LOG_HZ / LINEAR_STEP_HZ
}

fn log_step() -> f64 {
    6.4f64.ln() / 27.0
}

fn hz_to_mel(hz: f64) -> f64 {
    if hz < MIN_LOG_HZ {
        hz / LINEAR_STEP_HZ
    } else {
        min_log_mel() + (hz / MIN_LOG_HZ).ln() / log_step()
    }
}

fn mel_to_hz(mel: f64) -> f64 {
    if mel < min_log_mel() {
        mel * LINEAR_STEP_HZ
    } else {
        MIN_LOG_HZ * (log_step() * (mel - min_log_mel())).exp()
    }
}

/// Create the filter bank for `n_mels` bands over an `n_fft`-point FFT.
pub fn filter_bank(sample_rate: u32, n_fft: usize, n_mels: usize) -> Vec<f32> {
    let n_bins = n_fft / 2 + 1;
    let nyquist = sample_rate as f64 / 2.0;

    let fft_freqs: Vec<f64> = (0..n_bins)
        .map(|i| i as f64 * nyquist / (n_bins - 1) as f64)
        .collect();

    let max_mel = hz_to_mel(nyquist);
    let mel_points: Vec<f64> = (0..n_mels + 2)
        .map(|i| mel_to_hz(max_mel * i as f64 / (n_mels + 1) as f64))
        .collect();

    let mut filters = vec![0.0f32; n_mels * n_bins];
    for m in 0..n_mels {
        let (left, center, right) = (mel_points[m], mel_points[m + 1], mel_points[m + 2]);
        // Slaney normalisation keeps each band's area constant.
        let norm = 2.0 / (right - left);

        for (bin, &freq) in fft_freqs.iter().enumerate() {
            let lower = (freq - left) / (center - left);
            let upper = (right - freq) / (right - center);
            let weight = lower.min(upper).max(0.0);
            filters[m * n_bins + bin] = (weight * norm) as f32;
        }
    }

    filters
}
