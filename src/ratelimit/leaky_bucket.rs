//! Leaky bucket limiter.

use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::DropGuard;
use tracing::{debug, trace, warn};

use super::dispatch::spawn_dispatch;
use super::limiter::Limiter;
use super::rate::{LimitParams, MIN_INTERVAL};
use super::request::Request;
use super::state::{spawn_background, LimiterState};
use crate::proxy::Upstream;

/// Upper bound on concurrently dispatched requests per bucket.
pub const MAX_WORKERS: usize = 100;

/// A bounded FIFO of pending requests drained at a fixed rate.
///
/// Admission only queues the request. Every `interval` up to `drain_rate`
/// requests leave the queue and are dispatched through a worker pool of
/// `min(100, drain_rate)` slots, which bounds the number of requests in
/// flight upstream no matter how many leave in one tick.
pub struct LeakyBucket {
    capacity: usize,
    state: Arc<LimiterState<VecDeque<Request>>>,
    _stop_on_drop: DropGuard,
    workers: Arc<Semaphore>,
}

impl LeakyBucket {
    pub const NAME: &'static str = "LEAKY-BUCKET";

    pub fn new(
        capacity: NonZeroUsize,
        drain_rate: NonZeroUsize,
        interval: Duration,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        let interval = interval.max(MIN_INTERVAL);
        let drain_rate = drain_rate.get();
        let state = Arc::new(LimiterState::new(VecDeque::with_capacity(capacity.get())));
        let workers = Arc::new(Semaphore::new(MAX_WORKERS.min(drain_rate)));

        let shared = state.clone();
        let pool = workers.clone();
        spawn_background(Self::NAME, state.clone(), async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shared.shutdown().cancelled() => return,
                }

                let Some(drained) = shared.update(|queue| {
                    let n = drain_rate.min(queue.len());
                    queue.drain(..n).collect::<Vec<_>>()
                }) else {
                    return;
                };
                if !drained.is_empty() {
                    trace!(count = drained.len(), "Draining leaky bucket");
                }

                let mut drained = drained.into_iter();
                while let Some(request) = drained.next() {
                    let slot = tokio::select! {
                        slot = pool.clone().acquire_owned() => slot,
                        _ = shared.shutdown().cancelled() => {
                            let dropped = 1 + drained.len();
                            warn!(dropped, "Leaky bucket stopped while dispatching; dropping requests");
                            return;
                        }
                    };
                    match slot {
                        Ok(slot) => spawn_dispatch(&upstream, request, Some(slot)),
                        Err(_) => return,
                    }
                }
            }
        });

        Self {
            capacity: capacity.get(),
            _stop_on_drop: state.stop_on_drop(),
            state,
            workers,
        }
    }

    /// Build from configured parameters: `capacity` pending requests,
    /// draining one tick's quantity per interval.
    pub fn from_params(params: &LimitParams, upstream: Arc<dyn Upstream>) -> Self {
        Self::new(params.capacity, params.quantity, params.interval, upstream)
    }

    /// Requests waiting in the queue.
    pub fn queued(&self) -> usize {
        self.state.read(|queue| queue.len())
    }

    /// Worker slots currently free.
    pub fn available_workers(&self) -> usize {
        self.workers.available_permits()
    }
}

impl Limiter for LeakyBucket {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn add_request(&self, request: Request) -> bool {
        let capacity = self.capacity;
        let id = request.id().to_string();

        let mut pending = Some(request);
        let admitted = self.state.admit(|queue| {
            if queue.len() < capacity {
                queue.extend(pending.take());
                true
            } else {
                false
            }
        });

        debug!(request_id = %id, admitted, "Leaky bucket decision");
        admitted
    }

    /// Stop draining. Requests still queued are dropped, which completes
    /// them without a response.
    fn stop(&self) {
        self.state.stop_with(|queue| {
            if !queue.is_empty() {
                warn!(dropped = queue.len(), "Leaky bucket stopped with queued requests");
            }
            queue.clear();
        });
    }

    fn is_healthy(&self) -> bool {
        self.state.is_running()
    }
}
