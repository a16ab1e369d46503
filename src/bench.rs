//! # Benchmark
//!
//! Sends the same clip through the in-process service a number of times,
//! one after another and/or all at once, and reports latency statistics.
//!
//! ## Report Format:
//! ```json
//! {
//!   "generated_at": "2025-01-01T12:00:00+00:00",
//!   "engine": "tiny/cpu/int8",
//!   "strategy": "memory",
//!   "audio_bytes": 32044,
//!   "runs": [{ "mode": "sequential", "wall_clock_secs": 4.1, "latency_secs": { ... } }]
//! }
//! ```

use crate::engine::EngineState;
use crate::transcription::TranscriptionService;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Which passes to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BenchMode {
    Sequential,
    Concurrent,
    Both,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchReport {
    pub generated_at: String,
    pub engine: String,
    pub strategy: String,
    pub audio_bytes: usize,
    pub runs: Vec<BenchRun>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BenchRun {
    pub mode: String,
    pub wall_clock_secs: f64,
    pub latency_secs: LatencyStats,
}

/// Per-request latency summary, in seconds. Failed requests are counted but
/// their latencies are left out.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyStats {
    pub count: usize,
    pub failures: usize,
    pub total: f64,
    pub mean: f64,
    pub median: f64,
    pub min: f64,
    pub max: f64,
    pub stdev: f64,
}

impl LatencyStats {
    pub fn from_samples(samples: &[f64], failures: usize) -> Self {
        let count = samples.len();
        if count == 0 {
            return Self {
                count,
                failures,
                total: 0.0,
                mean: 0.0,
                median: 0.0,
                min: 0.0,
                max: 0.0,
                stdev: 0.0,
            };
        }

        let mut sorted = samples.to_vec();
        sorted.sort_by(f64::total_cmp);

        let total: f64 = sorted.iter().sum();
        let mean = total / count as f64;
        let median = if count % 2 == 0 {
            (sorted[count / 2 - 1] + sorted[count / 2]) / 2.0
        } else {
            sorted[count / 2]
        };
        // sample standard deviation
        let stdev = if count < 2 {
            0.0
        } else {
            let variance = sorted.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / (count - 1) as f64;
            variance.sqrt()
        };

        Self {
            count,
            failures,
            total,
            mean,
            median,
            min: sorted[0],
            max: sorted[count - 1],
            stdev,
        }
    }
}

/// Run the requested passes against `service`.
///
/// ## Parameters:
/// - **audio**: the clip, sent unchanged with every request
/// - **requests**: requests per pass
/// - **mode**: sequential, concurrent, or both (sequential first)
pub async fn run(
    service: &TranscriptionService,
    audio: Vec<u8>,
    requests: usize,
    mode: BenchMode,
) -> BenchReport {
    if service.engine().state() != EngineState::Ready {
        tracing::warn!("Benchmarking a service without a ready engine; every request will fail");
    }
    let engine = service
        .engine()
        .current()
        .map(|handle| handle.config().to_string())
        .unwrap_or_else(|| "uninitialized".to_string());

    let mut runs = Vec::new();
    if matches!(mode, BenchMode::Sequential | BenchMode::Both) {
        tracing::info!("Running sequential benchmark ({} requests)", requests);
        runs.push(sequential(service, &audio, requests).await);
    }
    if matches!(mode, BenchMode::Concurrent | BenchMode::Both) {
        tracing::info!("Running concurrent benchmark ({} requests)", requests);
        runs.push(concurrent(service, &audio, requests).await);
    }

    BenchReport {
        generated_at: chrono::Utc::now().to_rfc3339(),
        engine,
        strategy: service.strategy().to_string(),
        audio_bytes: audio.len(),
        runs,
    }
}

async fn timed(service: &TranscriptionService, audio: Vec<u8>) -> Option<f64> {
    let start_time = Instant::now();
    match service.transcribe(audio).await {
        Ok(_) => Some(start_time.elapsed().as_secs_f64()),
        Err(e) => {
            tracing::warn!("Benchmark request failed: {}", e.report());
            None
        }
    }
}

async fn sequential(service: &TranscriptionService, audio: &[u8], requests: usize) -> BenchRun {
    let start_time = Instant::now();
    let mut outcomes = Vec::with_capacity(requests);
    for _ in 0..requests {
        outcomes.push(timed(service, audio.to_vec()).await);
    }
    summarize("sequential", start_time, outcomes)
}

async fn concurrent(service: &TranscriptionService, audio: &[u8], requests: usize) -> BenchRun {
    let start_time = Instant::now();
    let outcomes = join_all((0..requests).map(|_| {
        let service = service.clone();
        let audio = audio.to_vec();
        async move {
            tokio::spawn(async move { timed(&service, audio).await })
                .await
                .ok()
                .flatten()
        }
    }))
    .await;
    summarize("concurrent", start_time, outcomes)
}

fn summarize(mode: &str, start_time: Instant, outcomes: Vec<Option<f64>>) -> BenchRun {
    let wall_clock_secs = start_time.elapsed().as_secs_f64();
    let samples: Vec<f64> = outcomes.iter().flatten().copied().collect();
    let failures = outcomes.len() - samples.len();
    let latency_secs = LatencyStats::from_samples(&samples, failures);

    tracing::info!(
        mode,
        count = latency_secs.count,
        failures,
        "Benchmark finished in {:.2}s (mean {:.2}s, median {:.2}s)",
        wall_clock_secs,
        latency_secs.mean,
        latency_secs.median
    );

    BenchRun {
        mode: mode.to_string(),
        wall_clock_secs,
        latency_secs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineConfig, EngineSlot};
    use crate::testing::FakeLoader;
    use crate::transcription::adapter::InMemoryAdapter;
    use std::sync::Arc;

    #[test]
    fn test_stats_for_known_samples() {
        let stats = LatencyStats::from_samples(&[4.0, 1.0, 3.0, 2.0], 1);
        assert_eq!(stats.count, 4);
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.total, 10.0);
        assert_eq!(stats.mean, 2.5);
        assert_eq!(stats.median, 2.5);
        assert_eq!(stats.min, 1.0);
        assert_eq!(stats.max, 4.0);
        assert!((stats.stdev - 1.290_994).abs() < 1e-5);
    }

    #[test]
    fn test_stats_for_single_and_no_samples() {
        let single = LatencyStats::from_samples(&[0.5], 0);
        assert_eq!(single.median, 0.5);
        assert_eq!(single.stdev, 0.0);

        let none = LatencyStats::from_samples(&[], 3);
        assert_eq!(none.count, 0);
        assert_eq!(none.failures, 3);
        assert_eq!(none.mean, 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_run_both_modes() {
        let slot = Arc::new(EngineSlot::new(Arc::new(FakeLoader::default())));
        slot.initialize(EngineConfig::default()).await.unwrap();
        let service = TranscriptionService::new(slot, Arc::new(InMemoryAdapter));

        let report = run(&service, b"hello|world".to_vec(), 5, BenchMode::Both).await;

        assert_eq!(report.engine, "tiny/cpu/int8");
        assert_eq!(report.runs.len(), 2);
        assert_eq!(report.runs[0].mode, "sequential");
        assert_eq!(report.runs[1].mode, "concurrent");
        for run in &report.runs {
            assert_eq!(run.latency_secs.count, 5);
            assert_eq!(run.latency_secs.failures, 0);
        }
    }

    #[tokio::test]
    async fn test_failed_requests_are_counted() {
        let slot = Arc::new(EngineSlot::new(Arc::new(FakeLoader::default())));
        slot.initialize(EngineConfig::default()).await.unwrap();
        let service = TranscriptionService::new(slot, Arc::new(InMemoryAdapter));

        let report = run(&service, b"FAIL".to_vec(), 3, BenchMode::Sequential).await;

        assert_eq!(report.runs.len(), 1);
        assert_eq!(report.runs[0].latency_secs.count, 0);
        assert_eq!(report.runs[0].latency_secs.failures, 3);
    }
}
