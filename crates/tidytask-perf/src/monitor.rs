use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::{Mutex, RwLock};
use sysinfo::{get_current_pid, ProcessesToUpdate, System};
use tidytask_core::{MonitorConfig, Result, TidyTaskError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Memory pressure levels derived from the system used-memory ratio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryLevel {
    Normal,
    Warning,
    Critical,
}

/// One memory observation; produced fresh on every poll, never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct MemorySample {
    /// System used memory as a fraction of total, in [0, 1].
    pub used_ratio: f64,
    /// Resident set size of this process.
    pub process_bytes: u64,
    pub system_total_bytes: u64,
    pub system_available_bytes: u64,
    pub sampled_at: SystemTime,
}

impl MemorySample {
    /// Safe default returned when the OS memory query fails.
    pub fn zeroed() -> Self {
        Self {
            used_ratio: 0.0,
            process_bytes: 0,
            system_total_bytes: 0,
            system_available_bytes: 0,
            sampled_at: SystemTime::now(),
        }
    }
}

/// Invoked on a level transition with the sample that caused it.
pub type LevelCallback = Arc<dyn Fn(&MemorySample) -> Result<()> + Send + Sync>;

/// Frees best-effort state and reports how many entries were reclaimed.
pub type ReclaimHook = Arc<dyn Fn() -> usize + Send + Sync>;

/// Background memory pressure monitor.
///
/// A polling loop samples system memory every `poll_interval` and
/// dispatches level callbacks on transitions only (edge-triggered), so a
/// long stretch of Critical samples produces one callback, not a storm.
/// Sampling failures degrade to a zeroed sample and a single tick
/// failure never stops the loop.
///
/// Cheap to clone; clones share the loop, registries, and level state.
#[derive(Clone)]
pub struct MemoryMonitor {
    config: MonitorConfig,
    callbacks: Arc<RwLock<HashMap<MemoryLevel, LevelCallback>>>,
    reclaim_hooks: Arc<RwLock<HashMap<String, ReclaimHook>>>,
    system: Arc<Mutex<System>>,
    last_level: Arc<Mutex<MemoryLevel>>,
    stop: Arc<Notify>,
    loop_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl MemoryMonitor {
    pub fn new(config: MonitorConfig) -> Self {
        Self {
            config,
            callbacks: Arc::new(RwLock::new(HashMap::new())),
            reclaim_hooks: Arc::new(RwLock::new(HashMap::new())),
            system: Arc::new(Mutex::new(System::new())),
            last_level: Arc::new(Mutex::new(MemoryLevel::Normal)),
            stop: Arc::new(Notify::new()),
            loop_task: Arc::new(Mutex::new(None)),
        }
    }

    /// Register the callback for one level; last writer wins.
    pub fn register_callback<F>(&self, level: MemoryLevel, callback: F)
    where
        F: Fn(&MemorySample) -> Result<()> + Send + Sync + 'static,
    {
        self.callbacks.write().insert(level, Arc::new(callback));
    }

    /// Register a named reclamation hook run by [`force_reclaim`].
    ///
    /// [`force_reclaim`]: MemoryMonitor::force_reclaim
    pub fn register_reclaim_hook<F>(&self, name: impl Into<String>, hook: F) -> Result<()>
    where
        F: Fn() -> usize + Send + Sync + 'static,
    {
        let name = name.into();
        if name.is_empty() {
            return Err(TidyTaskError::InvalidKey(
                "reclaim hook name must not be empty".to_string(),
            ));
        }
        self.reclaim_hooks.write().insert(name, Arc::new(hook));
        Ok(())
    }

    /// Launch the polling loop. Starting an already-running monitor is a
    /// no-op. Must be called from within a tokio runtime.
    pub fn start_monitoring(&self) {
        let mut task = self.loop_task.lock();
        if task.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let monitor = self.clone();
        let interval = self.config.poll_interval();
        info!(interval_secs = self.config.poll_interval_secs, "starting memory monitor");

        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick of a tokio interval fires immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = monitor.stop.notified() => break,
                    _ = ticker.tick() => {
                        let sample = monitor.memory_info();
                        monitor.observe(&sample);
                    }
                }
            }
            debug!("memory monitor loop exited");
        }));
    }

    /// Signal the loop to exit and join it with a bounded wait.
    /// Idempotent; safe to call even if monitoring never started.
    pub async fn stop_monitoring(&self) {
        let handle = self.loop_task.lock().take();
        let Some(handle) = handle else { return };

        self.stop.notify_one();
        let abort = handle.abort_handle();
        if tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .is_err()
        {
            warn!("memory monitor loop did not stop in time, aborting");
            abort.abort();
        }
        info!("memory monitor stopped");
    }

    pub fn is_running(&self) -> bool {
        self.loop_task
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Classify a used-memory ratio against the configured thresholds.
    pub fn classify(&self, used_ratio: f64) -> MemoryLevel {
        if used_ratio >= self.config.critical_threshold {
            MemoryLevel::Critical
        } else if used_ratio >= self.config.warning_threshold {
            MemoryLevel::Warning
        } else {
            MemoryLevel::Normal
        }
    }

    /// Classify a sample and dispatch the level callback if the level
    /// changed since the previous observation (edge-triggered).
    ///
    /// The polling loop calls this every tick; it is public so pressure
    /// can be injected synthetically for diagnostics and tests.
    pub fn observe(&self, sample: &MemorySample) {
        let level = self.classify(sample.used_ratio);
        {
            let mut last = self.last_level.lock();
            if *last == level {
                return;
            }
            *last = level;
        }
        debug!(?level, used_ratio = sample.used_ratio, "memory level transition");

        // Lock released above; a callback may query the monitor freely.
        let callback = self.callbacks.read().get(&level).cloned();
        if let Some(callback) = callback {
            if let Err(e) = callback(sample) {
                warn!(?level, error = %e, "memory level callback failed");
            }
        }
    }

    /// Stateless point query of current memory usage, independent of the
    /// polling loop. A failing OS query degrades to a zeroed sample.
    pub fn memory_info(&self) -> MemorySample {
        match self.sample() {
            Ok(sample) => sample,
            Err(e) => {
                warn!(error = %e, "memory query failed, returning zeroed sample");
                MemorySample::zeroed()
            }
        }
    }

    /// Run every registered reclaim hook immediately and report how much
    /// each reclaimed. Callable at any time, loop-independent.
    pub fn force_reclaim(&self) -> HashMap<String, usize> {
        let hooks: Vec<(String, ReclaimHook)> = self
            .reclaim_hooks
            .read()
            .iter()
            .map(|(name, hook)| (name.clone(), Arc::clone(hook)))
            .collect();

        let mut reclaimed = HashMap::with_capacity(hooks.len());
        for (name, hook) in hooks {
            let count = hook();
            debug!(hook = %name, count, "reclaim hook ran");
            reclaimed.insert(name, count);
        }
        reclaimed
    }

    fn sample(&self) -> Result<MemorySample> {
        let mut system = self.system.lock();
        system.refresh_memory();

        let total = system.total_memory();
        let used = system.used_memory();
        let available = system.available_memory();

        let pid = get_current_pid().map_err(|e| TidyTaskError::System(e.to_string()))?;
        system.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
        let process_bytes = system.process(pid).map(|p| p.memory()).unwrap_or(0);

        Ok(MemorySample {
            used_ratio: if total == 0 {
                0.0
            } else {
                used as f64 / total as f64
            },
            process_bytes,
            system_total_bytes: total,
            system_available_bytes: available,
            sampled_at: SystemTime::now(),
        })
    }
}
