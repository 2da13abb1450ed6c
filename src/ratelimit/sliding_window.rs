//! Sliding window counter limiter.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant};
use tokio_util::sync::DropGuard;
use tracing::debug;

use super::dispatch::spawn_dispatch;
use super::limiter::Limiter;
use super::rate::{LimitParams, MIN_INTERVAL};
use super::request::Request;
use super::state::{spawn_background, LimiterState};
use crate::proxy::Upstream;

/// Counters of the current and previous fixed windows.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSnapshot {
    /// Requests admitted in the current window
    pub curr: usize,
    /// Final count of the previous window
    pub prev: usize,
    /// Time since the current window started
    pub elapsed: Duration,
}

impl WindowSnapshot {
    /// Weighted request count: the previous window contributes in
    /// proportion to how much of it still overlaps the sliding window.
    pub fn estimate(&self, interval: Duration) -> f64 {
        let remaining = interval.saturating_sub(self.elapsed);
        let weight = remaining.as_secs_f64() / interval.as_secs_f64();
        self.prev as f64 * weight + self.curr as f64
    }
}

#[derive(Debug)]
struct Windows {
    curr: usize,
    prev: usize,
    window_start: Instant,
}

impl Windows {
    fn snapshot(&self, now: Instant) -> WindowSnapshot {
        WindowSnapshot {
            curr: self.curr,
            prev: self.prev,
            elapsed: now.saturating_duration_since(self.window_start),
        }
    }
}

/// A sliding window counter.
///
/// Keeps a count for the current fixed window and the previous one and
/// admits while `prev * (interval - elapsed) / interval + curr` stays below
/// the capacity. Memory is constant; accuracy is approximate.
pub struct SlidingWindowCounter {
    capacity: usize,
    interval: Duration,
    state: Arc<LimiterState<Windows>>,
    _stop_on_drop: DropGuard,
    upstream: Arc<dyn Upstream>,
}

impl SlidingWindowCounter {
    pub const NAME: &'static str = "SLIDING-WINDOW";

    pub fn new(capacity: NonZeroUsize, interval: Duration, upstream: Arc<dyn Upstream>) -> Self {
        let interval = interval.max(MIN_INTERVAL);
        let start = Instant::now();
        let state = Arc::new(LimiterState::new(Windows {
            curr: 0,
            prev: 0,
            window_start: start,
        }));

        let shared = state.clone();
        spawn_background(Self::NAME, state.clone(), async move {
            let mut ticker = interval_at(start + interval, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let rolled = shared.update(|w| {
                            w.prev = w.curr;
                            w.curr = 0;
                            w.window_start = Instant::now();
                        });
                        if rolled.is_none() {
                            return;
                        }
                    }
                    _ = shared.shutdown().cancelled() => return,
                }
            }
        });

        Self {
            capacity: capacity.get(),
            interval,
            _stop_on_drop: state.stop_on_drop(),
            state,
            upstream,
        }
    }

    /// Build from configured parameters; the window admits one tick's quantity.
    pub fn from_params(params: &LimitParams, upstream: Arc<dyn Upstream>) -> Self {
        Self::new(params.quantity, params.interval, upstream)
    }

    /// A consistent view of both windows.
    pub fn snapshot(&self) -> WindowSnapshot {
        let now = Instant::now();
        self.state.read(|w| w.snapshot(now))
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl Limiter for SlidingWindowCounter {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn add_request(&self, request: Request) -> bool {
        let capacity = self.capacity as f64;
        let interval = self.interval;

        let mut estimate = 0.0;
        let admitted = self.state.admit(|w| {
            // One snapshot of (window_start, prev, curr) under the lock.
            estimate = w.snapshot(Instant::now()).estimate(interval);
            if estimate < capacity {
                w.curr += 1;
                true
            } else {
                false
            }
        });

        debug!(request_id = %request.id(), admitted, estimate, "Sliding window decision");
        if admitted {
            spawn_dispatch(&self.upstream, request, None);
        }
        admitted
    }

    fn stop(&self) {
        self.state.stop();
    }

    fn is_healthy(&self) -> bool {
        self.state.is_running()
    }
}
