//! Performance and resource management layer for the TidyTask desktop
//! todo manager: an urgency-level result cache, a batched-write
//! coalescer, a throttled refresh scheduler, and a background memory
//! monitor, composed by one coordinator.
//!
//! Everything here is best-effort optimization: losing a cached entry or
//! skipping a refresh is always safe. Persistence correctness belongs to
//! the flush handlers supplied by the embedding application.

pub mod batch;
pub mod cache;
pub mod coordinator;
pub mod monitor;
pub mod throttle;

pub use batch::{FlushHandler, PendingUpdate, UpdateBatcher};
pub use cache::{UrgencyCache, UrgencyCacheStats, NORMAL_LEVEL};
pub use coordinator::{global, PerformanceCoordinator, PerformanceStats};
pub use monitor::{LevelCallback, MemoryLevel, MemoryMonitor, MemorySample, ReclaimHook};
pub use throttle::{RefreshCallback, RefreshThrottler};

// Re-export common types for convenience
pub use tidytask_core::{
    BatchConfig, CacheConfig, MonitorConfig, PerfConfig, Result, ThrottleConfig, TidyTaskError,
};
