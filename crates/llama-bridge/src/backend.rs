//! Native backend lifecycle and system queries.

use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::{debug, info, warn};

use crate::engine::{Engine, LogLevel, LogSink};
use crate::error::{BridgeError, Result};

/// Explicitly constructed handle to the native library's global state.
///
/// Cloning is cheap and every clone refers to the same state. The top-level
/// application creates one, calls [`Backend::initialize`] before loading any
/// model, and [`Backend::cleanup`] at shutdown; dropping the last clone
/// cleans up as well.
#[derive(Clone)]
pub struct Backend {
    inner: Arc<Inner>,
}

struct Inner {
    engine: Arc<dyn Engine>,
    native: Mutex<Slot>,
    /// Serializes native `init` against a deferred `free` running on
    /// whichever thread drops the last model.
    lifecycle: Arc<Mutex<()>>,
}

#[derive(Default)]
struct Slot {
    /// `Some` while initialized. Models hold clones of the `Arc`, so the
    /// native free waits for the last of them.
    live: Option<Arc<NativeBackend>>,
    /// State handed off by the last `cleanup` whose free is still deferred.
    retired: Weak<NativeBackend>,
}

/// Owns the initialized native global state; frees it exactly once on drop.
pub(crate) struct NativeBackend {
    engine: Arc<dyn Engine>,
    lifecycle: Arc<Mutex<()>>,
}

impl Drop for NativeBackend {
    fn drop(&mut self) {
        let _guard = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        debug!(engine = self.engine.name(), "Freeing native backend");
        self.engine.free();
    }
}

impl Backend {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            inner: Arc::new(Inner {
                engine,
                native: Mutex::new(Slot::default()),
                lifecycle: Arc::default(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, Slot> {
        self.inner
            .native
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn engine(&self) -> &Arc<dyn Engine> {
        &self.inner.engine
    }

    /// The live native state, for entities that must not outlive it.
    pub(crate) fn acquire(&self) -> Result<Arc<NativeBackend>> {
        self.state()
            .live
            .clone()
            .ok_or(BridgeError::BackendNotInitialized)
    }

    //  Lifecycle

    /// Initialize the native backend (idempotent).
    ///
    /// A failure here is fatal: see [`BridgeError::is_fatal`].
    pub fn initialize(&self) -> Result<()> {
        let mut state = self.state();
        if state.live.is_some() {
            debug!("Backend already initialized");
            return Ok(());
        }
        // Native state kept alive by models from before a cleanup is still
        // initialized; take it back instead of initializing twice.
        if let Some(native) = state.retired.upgrade() {
            state.live = Some(native);
            state.retired = Weak::new();
            info!("Backend reinitialized from deferred native state");
            return Ok(());
        }
        let engine = &self.inner.engine;
        {
            let _guard = self
                .inner
                .lifecycle
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            engine.init().map_err(BridgeError::BackendInit)?;
        }
        state.live = Some(Arc::new(NativeBackend {
            engine: Arc::clone(engine),
            lifecycle: Arc::clone(&self.inner.lifecycle),
        }));
        info!(engine = engine.name(), "Backend initialized");
        Ok(())
    }

    /// Release the native global state (idempotent, never fails).
    ///
    /// Models still alive keep the native state until they are released.
    pub fn cleanup(&self) {
        let mut state = self.state();
        let Some(native) = state.live.take() else {
            debug!("Backend cleanup skipped: not initialized");
            return;
        };
        let dependents = Arc::strong_count(&native) - 1;
        state.retired = Arc::downgrade(&native);
        if dependents > 0 {
            warn!(
                dependents,
                "Backend cleaned up with live models; native free deferred until they are released"
            );
        }
        drop(native);
        drop(state);
        info!("Backend cleaned up");
    }

    pub fn is_initialized(&self) -> bool {
        self.state().live.is_some()
    }

    /// Initialize NUMA optimizations. Only meaningful before loading models.
    pub fn initialize_numa(&self, strategy: NumaStrategy) {
        self.inner.engine.numa_init(strategy);
        debug!(?strategy, "NUMA initialized");
    }

    //  Logging

    /// Install a process-wide sink for native log lines, replacing any
    /// previous one. `user_data` is handed back untouched on every call.
    pub fn set_log_callback<T, F>(&self, user_data: T, callback: F)
    where
        T: Send + Sync + 'static,
        F: Fn(LogLevel, &str, &T) + Send + Sync + 'static,
    {
        let sink: LogSink = Arc::new(move |level, msg| callback(level, msg, &user_data));
        self.inner.engine.set_log_sink(Some(sink));
        debug!("Native log callback installed");
    }

    /// Restore the native library's own log output.
    pub fn clear_log_callback(&self) {
        self.inner.engine.set_log_sink(None);
    }

    /// Forward native log lines to `tracing` under the `llama.cpp` target.
    pub fn route_logs_to_tracing(&self) {
        self.set_log_callback((), |level, msg, _| {
            let msg = msg.trim();
            if msg.is_empty() {
                return;
            }
            match level {
                LogLevel::Error => tracing::error!(target: "llama.cpp", "{msg}"),
                LogLevel::Warn => tracing::warn!(target: "llama.cpp", "{msg}"),
                LogLevel::Info => tracing::info!(target: "llama.cpp", "{msg}"),
                LogLevel::Debug => tracing::debug!(target: "llama.cpp", "{msg}"),
            }
        });
    }

    //  Capability queries (valid before initialize)

    pub fn time_us(&self) -> i64 {
        self.inner.engine.time_us()
    }

    pub fn max_devices(&self) -> usize {
        self.inner.engine.max_devices()
    }

    pub fn supports_mmap(&self) -> bool {
        self.inner.engine.supports_mmap()
    }

    pub fn supports_mlock(&self) -> bool {
        self.inner.engine.supports_mlock()
    }

    pub fn supports_gpu_offload(&self) -> bool {
        self.inner.engine.supports_gpu_offload()
    }

    pub fn supports_rpc(&self) -> bool {
        self.inner.engine.supports_rpc()
    }

    /// Human-readable system information string.
    pub fn system_info(&self) -> String {
        self.inner.engine.system_info()
    }

    /// Snapshot of all capability queries.
    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            max_devices: self.max_devices(),
            mmap: self.supports_mmap(),
            mlock: self.supports_mlock(),
            gpu_offload: self.supports_gpu_offload(),
            rpc: self.supports_rpc(),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let native = self
            .native
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .live
            .take();
        if native.is_some() {
            debug!("Backend dropped while initialized; cleaning up");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Capabilities {
    pub max_devices: usize,
    pub mmap: bool,
    pub mlock: bool,
    pub gpu_offload: bool,
    pub rpc: bool,
}

//  NUMA strategy

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NumaStrategy {
    Disabled,
    Distribute,
    Isolate,
    Numactl,
    Mirror,
}

impl NumaStrategy {
    pub fn as_raw(self) -> u32 {
        match self {
            Self::Disabled => 0,
            Self::Distribute => 1,
            Self::Isolate => 2,
            Self::Numactl => 3,
            Self::Mirror => 4,
        }
    }
}

impl FromStr for NumaStrategy {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "disabled" => Ok(Self::Disabled),
            "distribute" => Ok(Self::Distribute),
            "isolate" => Ok(Self::Isolate),
            "numactl" => Ok(Self::Numactl),
            "mirror" => Ok(Self::Mirror),
            other => Err(BridgeError::invalid(format!("unknown NUMA strategy '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::testing::{FakeEngine, NativeEvent};

    fn backend() -> (Arc<FakeEngine>, Backend) {
        let engine = Arc::new(FakeEngine::new());
        let backend = Backend::new(engine.clone());
        (engine, backend)
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (engine, backend) = backend();
        backend.initialize().unwrap();
        backend.initialize().unwrap();
        assert!(backend.is_initialized());
        assert_eq!(engine.init_calls(), 1);
    }

    #[test]
    fn test_cleanup_is_idempotent_and_safe_before_init() {
        let (engine, backend) = backend();
        backend.cleanup();
        backend.initialize().unwrap();
        backend.cleanup();
        backend.cleanup();
        assert!(!backend.is_initialized());
        assert_eq!(engine.count(NativeEvent::BackendFree), 1);
    }

    #[test]
    fn test_init_failure_is_fatal() {
        let (engine, backend) = backend();
        engine.fail_init("libllama.so: cannot open shared object file");
        let err = backend.initialize().unwrap_err();
        assert!(err.is_fatal());
        assert!(!backend.is_initialized());
    }

    #[test]
    fn test_reinitialize_after_cleanup() {
        let (engine, backend) = backend();
        backend.initialize().unwrap();
        backend.cleanup();
        backend.initialize().unwrap();
        assert_eq!(engine.init_calls(), 2);
    }

    #[test]
    fn test_reinitialize_reuses_deferred_native_state() {
        let fx = crate::testing::Fixture::new();
        let model = fx.load_model(crate::model::ModelParams::default());
        fx.backend.cleanup();
        assert!(!fx.backend.is_initialized());

        fx.backend.initialize().unwrap();
        assert!(fx.backend.is_initialized());
        assert_eq!(fx.engine.init_calls(), 1);

        drop(model);
        assert_eq!(fx.engine.count(NativeEvent::BackendFree), 0);
        let _again = fx.load_model(crate::model::ModelParams::default());
        assert_eq!(fx.engine.init_calls(), 1);
    }

    #[test]
    fn test_deferred_free_then_initialize_starts_fresh() {
        let fx = crate::testing::Fixture::new();
        let model = fx.load_model(crate::model::ModelParams::default());
        fx.backend.cleanup();
        drop(model);
        assert_eq!(fx.engine.count(NativeEvent::BackendFree), 1);

        fx.backend.initialize().unwrap();
        assert_eq!(fx.engine.init_calls(), 2);
    }

    #[test]
    fn test_concurrent_initialize_runs_native_init_once() {
        let (engine, backend) = backend();
        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| backend.initialize().unwrap());
            }
        });
        assert!(backend.is_initialized());
        assert_eq!(engine.init_calls(), 1);
    }

    #[test]
    fn test_drop_last_clone_cleans_up() {
        let (engine, backend) = backend();
        backend.initialize().unwrap();
        let clone = backend.clone();
        drop(backend);
        assert_eq!(engine.count(NativeEvent::BackendFree), 0);
        drop(clone);
        assert_eq!(engine.count(NativeEvent::BackendFree), 1);
    }

    #[test]
    fn test_queries_work_before_initialize() {
        let (_engine, backend) = backend();
        let caps = backend.capabilities();
        assert!(caps.mmap);
        assert!(!caps.gpu_offload);
        assert!(backend.system_info().contains("fake"));
        assert!(backend.time_us() >= 0);
    }

    #[test]
    fn test_log_callback_receives_user_data_and_replacement_discards_old() {
        let (engine, backend) = backend();
        let first: Arc<Mutex<Vec<String>>> = Arc::default();
        let second: Arc<Mutex<Vec<String>>> = Arc::default();

        backend.set_log_callback(first.clone(), |_, msg, seen| {
            seen.lock().unwrap().push(msg.to_string());
        });
        engine.emit_log(LogLevel::Info, "one");

        backend.set_log_callback(second.clone(), |level, msg, seen| {
            seen.lock().unwrap().push(format!("{level:?}:{msg}"));
        });
        engine.emit_log(LogLevel::Warn, "two");

        assert_eq!(*first.lock().unwrap(), vec!["one".to_string()]);
        assert_eq!(*second.lock().unwrap(), vec!["Warn:two".to_string()]);
    }

    #[test]
    fn test_numa_strategy_parsing() {
        assert_eq!("mirror".parse::<NumaStrategy>().unwrap().as_raw(), 4);
        assert_eq!("NUMACTL".parse::<NumaStrategy>().unwrap(), NumaStrategy::Numactl);
        assert!("sideways".parse::<NumaStrategy>().is_err());
    }
}
