use std::sync::Arc;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tidytask_core::{PerfConfig, Result, TidyTaskError};
use tracing::{debug, error, info, warn};

use crate::batch::UpdateBatcher;
use crate::cache::{UrgencyCache, UrgencyCacheStats};
use crate::monitor::{MemoryLevel, MemoryMonitor, MemorySample};
use crate::throttle::RefreshThrottler;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Uninitialized,
    Running,
    Shutdown,
}

/// Aggregated diagnostics snapshot across all components.
#[derive(Debug, Clone)]
pub struct PerformanceStats {
    pub cache: UrgencyCacheStats,
    pub memory: MemorySample,
    pub batch_pending: usize,
    pub refresh_pending: usize,
}

/// Composition root and lifecycle owner for the performance layer.
///
/// Owns one urgency cache, one update batcher, one refresh throttler,
/// and one memory monitor, and wires the monitor's pressure callbacks to
/// relieve pressure through the other three. The rest of the application
/// talks to this coordinator (or to component clones handed out by it)
/// and never to component internals.
///
/// Lifecycle: `uninitialized → running → shutdown`. `initialize` is the
/// only way to start; `shutdown` is terminal — a stopped coordinator is
/// replaced, not restarted.
pub struct PerformanceCoordinator {
    cache: UrgencyCache,
    batcher: UpdateBatcher,
    throttler: RefreshThrottler,
    monitor: MemoryMonitor,
    lifecycle: Mutex<Lifecycle>,
}

impl PerformanceCoordinator {
    pub fn new(config: PerfConfig) -> Self {
        Self {
            cache: UrgencyCache::new(config.cache),
            batcher: UpdateBatcher::new(config.batch),
            throttler: RefreshThrottler::new(config.throttle),
            monitor: MemoryMonitor::new(config.monitor),
            lifecycle: Mutex::new(Lifecycle::Uninitialized),
        }
    }

    pub fn cache(&self) -> &UrgencyCache {
        &self.cache
    }

    pub fn batcher(&self) -> &UpdateBatcher {
        &self.batcher
    }

    pub fn throttler(&self) -> &RefreshThrottler {
        &self.throttler
    }

    pub fn monitor(&self) -> &MemoryMonitor {
        &self.monitor
    }

    /// Wire memory pressure handling and start the monitor loop.
    ///
    /// Idempotent while running; initializing after shutdown is an
    /// error — construct a fresh coordinator instead. Must be called
    /// from within a tokio runtime.
    pub fn initialize(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock();
        match *lifecycle {
            Lifecycle::Running => return Ok(()),
            Lifecycle::Shutdown => {
                return Err(TidyTaskError::InvalidOperation(
                    "coordinator was shut down; construct a fresh instance".to_string(),
                ))
            }
            Lifecycle::Uninitialized => {}
        }

        {
            let cache = self.cache.clone();
            self.monitor
                .register_reclaim_hook("urgency_cache", move || cache.purge_expired())?;
        }

        {
            let cache = self.cache.clone();
            let batcher = self.batcher.clone();
            let monitor = self.monitor.clone();
            self.monitor
                .register_callback(MemoryLevel::Warning, move |sample| {
                    warn!(used_ratio = sample.used_ratio, "memory warning, relieving pressure");
                    cache.clear();
                    batcher.force_flush();
                    let reclaimed = monitor.force_reclaim();
                    debug!(?reclaimed, "reclamation pass finished");
                    Ok(())
                });
        }

        {
            let cache = self.cache.clone();
            let batcher = self.batcher.clone();
            let throttler = self.throttler.clone();
            let monitor = self.monitor.clone();
            self.monitor
                .register_callback(MemoryLevel::Critical, move |sample| {
                    error!(used_ratio = sample.used_ratio, "memory critical, pausing refresh work");
                    cache.clear();
                    batcher.force_flush();
                    monitor.force_reclaim();
                    // Paused until the application restarts refresh work.
                    throttler.stop();
                    Ok(())
                });
        }

        self.monitor.start_monitoring();
        *lifecycle = Lifecycle::Running;
        info!("performance coordinator initialized");
        Ok(())
    }

    /// Force-flush pending writes, stop refresh work, and stop the
    /// monitor loop. Idempotent and terminal.
    pub async fn shutdown(&self) {
        {
            let mut lifecycle = self.lifecycle.lock();
            if *lifecycle == Lifecycle::Shutdown {
                return;
            }
            *lifecycle = Lifecycle::Shutdown;
        }

        self.batcher.shutdown();
        self.throttler.stop();
        self.monitor.stop_monitoring().await;
        info!("performance coordinator shut down");
    }

    /// Read-only aggregated snapshot for diagnostics; no side effects.
    pub fn performance_stats(&self) -> PerformanceStats {
        PerformanceStats {
            cache: self.cache.stats(),
            memory: self.monitor.memory_info(),
            batch_pending: self.batcher.pending_len(),
            refresh_pending: self.throttler.pending_len(),
        }
    }
}

static GLOBAL: OnceCell<Arc<PerformanceCoordinator>> = OnceCell::new();

/// Lazily constructed, process-wide coordinator for callers that need
/// ambient access.
///
/// Prefer constructing and injecting a [`PerformanceCoordinator`]
/// explicitly; this exists for application shells that have no better
/// place to thread one through. The caller still owns the lifecycle and
/// must call `initialize`.
pub fn global() -> Arc<PerformanceCoordinator> {
    Arc::clone(GLOBAL.get_or_init(|| Arc::new(PerformanceCoordinator::new(PerfConfig::default()))))
}
