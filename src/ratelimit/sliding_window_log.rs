//! Sliding window log limiter.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::DropGuard;
use tracing::{debug, trace};

use super::dispatch::spawn_dispatch;
use super::limiter::Limiter;
use super::rate::{LimitParams, MIN_INTERVAL};
use super::request::Request;
use super::state::{spawn_background, LimiterState};
use crate::proxy::Upstream;

/// A log of admission timestamps bounded by the window capacity.
///
/// An admission is a non-blocking push onto the log. The expiry task waits
/// for the oldest entry, sleeps until it is `interval` old, and only then
/// removes it, so the log length is always the exact number of admissions
/// in the trailing interval.
pub struct SlidingWindowLog {
    capacity: usize,
    state: Arc<LimiterState<VecDeque<Instant>>>,
    _stop_on_drop: DropGuard,
    pushed: Arc<Notify>,
    upstream: Arc<dyn Upstream>,
}

impl SlidingWindowLog {
    pub const NAME: &'static str = "SLIDING-WINDOW-LOG";

    pub fn new(capacity: NonZeroUsize, interval: Duration, upstream: Arc<dyn Upstream>) -> Self {
        let interval = interval.max(MIN_INTERVAL);
        let state = Arc::new(LimiterState::new(VecDeque::with_capacity(capacity.get())));
        let pushed = Arc::new(Notify::new());

        let shared = state.clone();
        let notify = pushed.clone();
        spawn_background(Self::NAME, state.clone(), async move {
            loop {
                // Wait for an entry to exist.
                let oldest = loop {
                    if let Some(oldest) = shared.read(|log| log.front().copied()) {
                        break oldest;
                    }
                    tokio::select! {
                        _ = notify.notified() => {}
                        _ = shared.shutdown().cancelled() => return,
                    }
                };

                // Hold its slot until it leaves the window.
                tokio::select! {
                    _ = sleep_until(oldest + interval) => {}
                    _ = shared.shutdown().cancelled() => return,
                }

                match shared.update(|log| log.pop_front()) {
                    Some(_) => trace!("Expired oldest log entry"),
                    None => return,
                }
            }
        });

        Self {
            capacity: capacity.get(),
            _stop_on_drop: state.stop_on_drop(),
            state,
            pushed,
            upstream,
        }
    }

    /// Build from configured parameters; the log holds one tick's quantity.
    pub fn from_params(params: &LimitParams, upstream: Arc<dyn Upstream>) -> Self {
        Self::new(params.quantity, params.interval, upstream)
    }

    /// Admissions currently in the log.
    pub fn len(&self) -> usize {
        self.state.read(|log| log.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Limiter for SlidingWindowLog {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn add_request(&self, request: Request) -> bool {
        let capacity = self.capacity;
        let admitted = self.state.admit(|log| {
            if log.len() < capacity {
                log.push_back(Instant::now());
                true
            } else {
                false
            }
        });

        debug!(request_id = %request.id(), admitted, "Sliding window log decision");
        if admitted {
            self.pushed.notify_one();
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
