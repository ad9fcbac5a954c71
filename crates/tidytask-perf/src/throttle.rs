use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tidytask_core::{Result, ThrottleConfig, TidyTaskError};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Recomputes or redraws one component; assumed idempotent and tolerant
/// of being skipped under rate limiting.
pub type RefreshCallback = Arc<dyn Fn() -> Result<()> + Send + Sync>;

#[derive(Default)]
struct ThrottleState {
    pending: HashSet<String>,
    last_run: HashMap<String, Instant>,
    cycle: Option<JoinHandle<()>>,
    running: bool,
}

/// Collapses bursts of refresh requests into at most one callback
/// invocation per component per cycle, capped per component at
/// `max_updates_per_second`.
///
/// Only "is component X pending" is stored, so duplicate requests before
/// the next cycle collapse into one. A cycle is a single deferred tick;
/// the throttler goes idle when a tick finds nothing new. High-frequency
/// tick-style sources (clocks, live counters) feed this with O(requests)
/// signals and get O(cycles) work out.
///
/// Cheap to clone; clones share the same state and registry.
#[derive(Clone)]
pub struct RefreshThrottler {
    config: ThrottleConfig,
    state: Arc<Mutex<ThrottleState>>,
    callbacks: Arc<RwLock<HashMap<String, RefreshCallback>>>,
}

impl RefreshThrottler {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            state: Arc::new(Mutex::new(ThrottleState::default())),
            callbacks: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register the refresh callback for a component.
    ///
    /// One callback per component id, last writer wins; an empty id is
    /// rejected.
    pub fn register_callback<F>(&self, component_id: impl Into<String>, callback: F) -> Result<()>
    where
        F: Fn() -> Result<()> + Send + Sync + 'static,
    {
        let component_id = component_id.into();
        if component_id.is_empty() {
            return Err(TidyTaskError::InvalidKey(
                "component id must not be empty".to_string(),
            ));
        }
        self.callbacks
            .write()
            .insert(component_id, Arc::new(callback));
        Ok(())
    }

    /// Request a refresh of one component.
    ///
    /// Silently dropped when the component was actually refreshed less
    /// than `1 / max_updates_per_second` ago. Otherwise the component
    /// joins the pending set and a cycle is scheduled if none is.
    /// Must be called from within a tokio runtime.
    pub fn request_update(&self, component_id: &str) {
        let mut state = self.state.lock();

        if let Some(last) = state.last_run.get(component_id) {
            if last.elapsed() < self.config.min_update_gap() {
                debug!(component_id, "refresh request dropped by rate limit");
                return;
            }
        }

        state.pending.insert(component_id.to_string());

        if !state.running {
            state.running = true;
            state.cycle = Some(self.spawn_cycle());
        }
    }

    /// Components waiting for the next cycle.
    pub fn pending_len(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Cancel any scheduled cycle and clear the pending set. Idempotent;
    /// safe to call from inside a refresh callback.
    pub fn stop(&self) {
        let mut state = self.state.lock();
        if let Some(handle) = state.cycle.take() {
            handle.abort();
        }
        state.pending.clear();
        state.running = false;
    }

    fn spawn_cycle(&self) -> JoinHandle<()> {
        let throttler = self.clone();
        let interval = self.config.update_interval();
        tokio::spawn(async move {
            tokio::time::sleep(interval).await;
            throttler.run_cycle();
        })
    }

    /// One cycle tick: swap out the pending set, invoke each collected
    /// callback exactly once, then reschedule only if new requests
    /// arrived while this tick was running.
    fn run_cycle(&self) {
        let component_ids: Vec<String> = {
            let mut state = self.state.lock();
            state.pending.drain().collect()
        };

        if component_ids.is_empty() {
            let mut state = self.state.lock();
            state.running = false;
            state.cycle = None;
            return;
        }

        for component_id in &component_ids {
            let callback = self.callbacks.read().get(component_id).cloned();
            match callback {
                // Invoked with no lock held, so a callback may re-enter
                // request_update or stop without deadlocking.
                Some(callback) => match callback() {
                    Ok(()) => {
                        self.state
                            .lock()
                            .last_run
                            .insert(component_id.clone(), Instant::now());
                    }
                    Err(e) => {
                        warn!(%component_id, error = %e, "refresh callback failed");
                    }
                },
                None => {
                    debug!(%component_id, "refresh requested for unregistered component");
                }
            }
        }

        let mut state = self.state.lock();
        if state.pending.is_empty() {
            state.running = false;
            state.cycle = None;
        } else {
            state.cycle = Some(self.spawn_cycle());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_config() -> ThrottleConfig {
        ThrottleConfig {
            update_interval_ms: 50,
            max_updates_per_second: 30,
        }
    }

    fn counting_callback(throttler: &RefreshThrottler, id: &str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        throttler
            .register_callback(id, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
        count
    }

    #[test]
    fn empty_component_id_is_rejected() {
        let throttler = RefreshThrottler::new(ThrottleConfig::default());
        assert!(throttler.register_callback("", || Ok(())).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_requests_yields_one_invocation() {
        let throttler = RefreshThrottler::new(fast_config());
        let count = counting_callback(&throttler, "todo_tree");

        for _ in 0..10 {
            throttler.request_update("todo_tree");
        }
        assert_eq!(throttler.pending_len(), 1);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(throttler.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_inside_the_rate_window_are_dropped() {
        let throttler = RefreshThrottler::new(fast_config());
        let count = counting_callback(&throttler, "clock");

        throttler.request_update("clock");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Wall-clock time has barely advanced since the invocation, so
        // this request falls inside the 1/30s window and is dropped.
        throttler.request_update("clock");
        assert_eq!(throttler.pending_len(), 0);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn each_component_runs_once_per_cycle() {
        let throttler = RefreshThrottler::new(fast_config());
        let tree = counting_callback(&throttler, "tree");
        let status_bar = counting_callback(&throttler, "status_bar");

        throttler.request_update("tree");
        throttler.request_update("status_bar");
        throttler.request_update("tree");

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(tree.load(Ordering::SeqCst), 1);
        assert_eq!(status_bar.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_during_a_tick_get_a_follow_up_cycle() {
        let throttler = RefreshThrottler::new(fast_config());
        let second = counting_callback(&throttler, "second");

        let requester = throttler.clone();
        throttler
            .register_callback("first", move || {
                requester.request_update("second");
                Ok(())
            })
            .unwrap();

        throttler.request_update("first");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(second.load(Ordering::SeqCst), 1);
        assert_eq!(throttler.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_the_cycle_and_clears_pending() {
        let throttler = RefreshThrottler::new(fast_config());
        let count = counting_callback(&throttler, "tree");

        throttler.request_update("tree");
        throttler.stop();
        assert_eq!(throttler.pending_len(), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Idempotent.
        throttler.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn unregistered_component_is_skipped_quietly() {
        let throttler = RefreshThrottler::new(fast_config());
        throttler.request_update("ghost");
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(throttler.pending_len(), 0);
    }
}
