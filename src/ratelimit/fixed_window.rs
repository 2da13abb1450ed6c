//! Fixed window limiter.

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

/// A simple window-based limiter.
///
/// Admits up to `capacity` requests per window; the counter drops back to
/// zero on every tick. Up to twice the capacity can pass in a short period
/// spanning a window boundary, which is inherent to this algorithm.
pub struct FixedWindow {
    capacity: usize,
    state: Arc<LimiterState<usize>>,
    _stop_on_drop: DropGuard,
    upstream: Arc<dyn Upstream>,
}

impl FixedWindow {
    pub const NAME: &'static str = "FIXED-WINDOW";

    /// Creates a new `FixedWindow` and starts its window resets.
    ///
    /// # Arguments
    ///
    /// * `capacity` - The maximum number of requests allowed within a single window.
    /// * `interval` - The duration of the fixed time window.
    pub fn new(capacity: NonZeroUsize, interval: Duration, upstream: Arc<dyn Upstream>) -> Self {
        let interval = interval.max(MIN_INTERVAL);
        let state = Arc::new(LimiterState::new(0));

        let shared = state.clone();
        spawn_background(Self::NAME, state.clone(), async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if shared.update(|curr| *curr = 0).is_none() {
                            return;
                        }
                    }
                    _ = shared.shutdown().cancelled() => return,
                }
            }
        });

        Self {
            capacity: capacity.get(),
            _stop_on_drop: state.stop_on_drop(),
            state,
            upstream,
        }
    }

    /// Build from configured parameters; the window admits one tick's quantity.
    pub fn from_params(params: &LimitParams, upstream: Arc<dyn Upstream>) -> Self {
        Self::new(params.quantity, params.interval, upstream)
    }

    /// Requests admitted in the current window.
    pub fn count(&self) -> usize {
        self.state.read(|curr| *curr)
    }
}

impl Limiter for FixedWindow {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn add_request(&self, request: Request) -> bool {
        let capacity = self.capacity;
        let admitted = self.state.admit(|curr| {
            if *curr < capacity {
                *curr += 1;
                true
            } else {
                false
            }
        });

        debug!(request_id = %request.id(), admitted, "Fixed window decision");
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
