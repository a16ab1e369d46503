//! # Engine Lifecycle
//!
//! Owns the single loaded engine instance of the process. The slot is created
//! empty at startup, filled by an explicit `initialize` call and then shared by
//! reference with every request context.
//!
//! ## State Transitions:
//! Uninitialized → Initializing → Ready
//!
//! A failed initialization returns the slot to where it was before the attempt
//! (Uninitialized, or the previous Ready handle), so another attempt is always
//! possible. There is no teardown and no automatic reload.

use crate::engine::{EngineConfig, EngineError, EngineLoader, InferenceEngine};
use crate::error::{ServiceError, ServiceResult};
use chrono::{DateTime, Utc};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

/// A fully constructed engine together with the configuration it was built from.
pub struct EngineHandle {
    engine: Arc<dyn InferenceEngine>,
    config: EngineConfig,
    load_time: Duration,
    loaded_at: DateTime<Utc>,
}

impl EngineHandle {
    pub fn engine(&self) -> &dyn InferenceEngine {
        self.engine.as_ref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// How long model construction took.
    pub fn load_time(&self) -> Duration {
        self.load_time
    }

    pub fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }
}

impl std::fmt::Debug for EngineHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineHandle")
            .field("engine", &self.engine.name())
            .field("config", &self.config)
            .field("load_time", &self.load_time)
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

/// Observable lifecycle state of the slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Initializing,
    Ready,
}

enum SlotState {
    Uninitialized,
    Initializing {
        previous: Option<Arc<EngineHandle>>,
    },
    Ready(Arc<EngineHandle>),
}

/// Process-wide holder of the engine handle.
///
/// ## Thread Safety:
/// The inner lock only guards swapping an `Arc`; it is never held across a
/// model load or an inference call, so readers never wait on either.
pub struct EngineSlot {
    loader: Arc<dyn EngineLoader>,
    state: RwLock<SlotState>,
}

impl EngineSlot {
    /// Create an empty slot. Nothing is loaded until [`EngineSlot::initialize`].
    pub fn new(loader: Arc<dyn EngineLoader>) -> Self {
        Self {
            loader,
            state: RwLock::new(SlotState::Uninitialized),
        }
    }

    pub fn state(&self) -> EngineState {
        match *self.state.read().unwrap_or_else(PoisonError::into_inner) {
            SlotState::Uninitialized => EngineState::Uninitialized,
            SlotState::Initializing { .. } => EngineState::Initializing,
            SlotState::Ready(_) => EngineState::Ready,
        }
    }

    /// The handle requests should use, if any engine has been loaded.
    pub fn current(&self) -> Option<Arc<EngineHandle>> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            SlotState::Uninitialized => None,
            SlotState::Initializing { previous } => previous.clone(),
            SlotState::Ready(handle) => Some(handle.clone()),
        }
    }

    /// Load an engine for `config` and make it the current handle.
    ///
    /// Every call performs a full model load. A call made while another load
    /// is in progress fails immediately instead of waiting for it.
    ///
    /// ## Returns:
    /// - **Ok(handle)**: the engine is loaded and now current
    /// - **Err(ServiceError::Initialization)**: construction failed; the slot is unchanged
    pub async fn initialize(&self, config: EngineConfig) -> ServiceResult<Arc<EngineHandle>> {
        let pending = self.begin(config)?;

        tracing::info!(
            model_size = %config.model_size,
            device = %config.device,
            compute_precision = %config.compute_precision,
            "Initializing transcription engine"
        );
        let start_time = Instant::now();

        let loaded = self.loader.load(&config).await;
        let load_time = start_time.elapsed();

        match loaded {
            Ok(engine) => {
                let handle = Arc::new(EngineHandle {
                    engine,
                    config,
                    load_time,
                    loaded_at: Utc::now(),
                });
                pending.complete(Some(handle.clone()));
                tracing::info!(
                    engine = handle.engine().name(),
                    "Engine initialized in {:.2}s",
                    load_time.as_secs_f64()
                );
                Ok(handle)
            }
            Err(e) => {
                pending.complete(None);
                tracing::error!(config = %config, "Engine initialization failed: {}", e);
                Err(ServiceError::initialization(config, e))
            }
        }
    }

    fn begin(&self, config: EngineConfig) -> ServiceResult<PendingInit<'_>> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let previous = match &*state {
            SlotState::Initializing { .. } => {
                return Err(ServiceError::initialization(config, EngineError::InitializationInProgress));
            }
            SlotState::Ready(handle) => Some(handle.clone()),
            SlotState::Uninitialized => None,
        };
        *state = SlotState::Initializing { previous };
        Ok(PendingInit { slot: self, armed: true })
    }

    /// Leave the Initializing state, either with a new handle or by restoring the previous one.
    fn settle(&self, loaded: Option<Arc<EngineHandle>>) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let previous = match std::mem::replace(&mut *state, SlotState::Uninitialized) {
            SlotState::Initializing { previous } => previous,
            SlotState::Ready(handle) => Some(handle),
            SlotState::Uninitialized => None,
        };
        *state = match loaded.or(previous) {
            Some(handle) => SlotState::Ready(handle),
            None => SlotState::Uninitialized,
        };
    }
}

/// An initialization in flight. Dropping it without completing (the
/// `initialize` future was cancelled) restores the slot.
struct PendingInit<'a> {
    slot: &'a EngineSlot,
    armed: bool,
}

impl PendingInit<'_> {
    fn complete(mut self, loaded: Option<Arc<EngineHandle>>) {
        self.armed = false;
        self.slot.settle(loaded);
    }
}

impl Drop for PendingInit<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!("Engine initialization was cancelled before completing");
            self.slot.settle(None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ComputePrecision, DeviceKind, ModelSize};
    use crate::testing::FakeLoader;

    fn cpu_config(compute_precision: ComputePrecision) -> EngineConfig {
        EngineConfig {
            model_size: ModelSize::Tiny,
            device: DeviceKind::Cpu,
            compute_precision,
        }
    }

    #[tokio::test]
    async fn test_slot_starts_uninitialized() {
        let slot = EngineSlot::new(Arc::new(FakeLoader::default()));
        assert_eq!(slot.state(), EngineState::Uninitialized);
        assert!(slot.current().is_none());
    }

    #[tokio::test]
    async fn test_initialize_makes_slot_ready() {
        let loader = Arc::new(FakeLoader::default());
        let slot = EngineSlot::new(loader.clone());

        let handle = slot.initialize(cpu_config(ComputePrecision::Int8)).await.unwrap();

        assert_eq!(slot.state(), EngineState::Ready);
        assert_eq!(handle.config().model_size, ModelSize::Tiny);
        assert_eq!(loader.load_count(), 1);
        assert!(Arc::ptr_eq(&handle, &slot.current().unwrap()));
    }

    #[tokio::test]
    async fn test_failed_initialize_leaves_slot_reusable() {
        let loader = Arc::new(FakeLoader::default());
        let slot = EngineSlot::new(loader.clone());

        let err = slot
            .initialize(cpu_config(ComputePrecision::Float16))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Initialization { .. }));
        assert_eq!(slot.state(), EngineState::Uninitialized);
        assert!(slot.current().is_none());

        slot.initialize(cpu_config(ComputePrecision::Int8)).await.unwrap();
        assert_eq!(slot.state(), EngineState::Ready);
        assert_eq!(loader.load_count(), 2);
    }

    #[tokio::test]
    async fn test_reinitialize_performs_full_load_each_time() {
        let loader = Arc::new(FakeLoader::default());
        let slot = EngineSlot::new(loader.clone());

        let first = slot.initialize(cpu_config(ComputePrecision::Int8)).await.unwrap();
        let second = slot.initialize(cpu_config(ComputePrecision::Float32)).await.unwrap();

        assert_eq!(loader.load_count(), 2);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(
            slot.current().unwrap().config().compute_precision,
            ComputePrecision::Float32
        );
    }

    #[tokio::test]
    async fn test_failed_reinitialize_keeps_previous_engine() {
        let slot = EngineSlot::new(Arc::new(FakeLoader::default()));
        let first = slot.initialize(cpu_config(ComputePrecision::Int8)).await.unwrap();

        assert!(slot
            .initialize(cpu_config(ComputePrecision::Float16))
            .await
            .is_err());

        assert_eq!(slot.state(), EngineState::Ready);
        assert!(Arc::ptr_eq(&first, &slot.current().unwrap()));
    }

    #[tokio::test]
    async fn test_concurrent_initialize_is_rejected() {
        let loader = Arc::new(FakeLoader::with_delay(Duration::from_millis(200)));
        let slot = Arc::new(EngineSlot::new(loader.clone()));

        let background = {
            let slot = slot.clone();
            tokio::spawn(async move { slot.initialize(cpu_config(ComputePrecision::Int8)).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(slot.state(), EngineState::Initializing);
        assert!(slot.current().is_none());

        let err = slot
            .initialize(cpu_config(ComputePrecision::Int8))
            .await
            .unwrap_err();
        assert!(err.report().contains("already in progress"));

        background.await.unwrap().unwrap();
        assert_eq!(slot.state(), EngineState::Ready);
        assert_eq!(loader.load_count(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_initialize_restores_slot() {
        let slot = EngineSlot::new(Arc::new(FakeLoader::with_delay(Duration::from_secs(5))));

        let attempt = tokio::time::timeout(
            Duration::from_millis(20),
            slot.initialize(cpu_config(ComputePrecision::Int8)),
        )
        .await;

        assert!(attempt.is_err());
        assert_eq!(slot.state(), EngineState::Uninitialized);
    }
}
