//! Token bucket limiter.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant};
use tokio_util::sync::DropGuard;
use tracing::{debug, trace};

use super::dispatch::spawn_dispatch;
use super::limiter::Limiter;
use super::rate::{LimitParams, MIN_INTERVAL};
use super::request::Request;
use super::state::{spawn_background, LimiterState};
use crate::proxy::Upstream;

/// A bucket of up to `capacity` tokens, topped up by `refill` every
/// `interval`. Each admission takes one token; bursts up to the capacity
/// are allowed.
pub struct TokenBucket {
    state: Arc<LimiterState<usize>>,
    _stop_on_drop: DropGuard,
    upstream: Arc<dyn Upstream>,
}

impl TokenBucket {
    pub const NAME: &'static str = "TOKEN-BUCKET";

    /// Create a full bucket and start refilling it.
    pub fn new(
        capacity: NonZeroUsize,
        refill: NonZeroUsize,
        interval: Duration,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        let capacity = capacity.get();
        let refill = refill.get();
        let interval = interval.max(MIN_INTERVAL);
        let state = Arc::new(LimiterState::new(capacity));

        let shared = state.clone();
        spawn_background(Self::NAME, state.clone(), async move {
            let mut ticker = interval_at(Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let refilled = shared.update(|tokens| {
                            *tokens = tokens.saturating_add(refill).min(capacity);
                            *tokens
                        });
                        match refilled {
                            Some(tokens) => trace!(tokens, "Refilled token bucket"),
                            None => return,
                        }
                    }
                    _ = shared.shutdown().cancelled() => return,
                }
            }
        });

        Self {
            _stop_on_drop: state.stop_on_drop(),
            state,
            upstream,
        }
    }

    /// Build from configured parameters.
    pub fn from_params(params: &LimitParams, upstream: Arc<dyn Upstream>) -> Self {
        Self::new(params.capacity, params.quantity, params.interval, upstream)
    }

    /// Tokens currently available.
    pub fn tokens(&self) -> usize {
        self.state.read(|tokens| *tokens)
    }
}

impl Limiter for TokenBucket {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn add_request(&self, request: Request) -> bool {
        let admitted = self.state.admit(|tokens| {
            if *tokens > 0 {
                *tokens -= 1;
                true
            } else {
                false
            }
        });

        debug!(request_id = %request.id(), admitted, "Token bucket decision");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::testing::{request, settle, RecordingUpstream};

    fn bucket(capacity: usize, refill: usize, upstream: Arc<RecordingUpstream>) -> TokenBucket {
        TokenBucket::new(
            NonZeroUsize::new(capacity).unwrap(),
            NonZeroUsize::new(refill).unwrap(),
            Duration::from_secs(1),
            upstream,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_refill() {
        let upstream = RecordingUpstream::new();
        let tb = bucket(2, 1, upstream.clone());

        assert!(tb.add_request(request().0));
        assert!(tb.add_request(request().0));
        assert!(!tb.add_request(request().0));

        tokio::time::sleep(Duration::from_millis(1001)).await;

        assert!(tb.add_request(request().0));
        assert!(!tb.add_request(request().0));

        settle().await;
        assert_eq!(upstream.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_saturates_at_capacity() {
        let tb = bucket(3, 2, RecordingUpstream::new());
        assert_eq!(tb.tokens(), 3);

        for _ in 0..3 {
            assert!(tb.add_request(request().0));
        }
        assert_eq!(tb.tokens(), 0);

        tokio::time::sleep(Duration::from_millis(5500)).await;
        assert_eq!(tb.tokens(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refill_larger_than_capacity_is_clamped() {
        let tb = bucket(2, 10, RecordingUpstream::new());
        assert!(tb.add_request(request().0));

        tokio::time::sleep(Duration::from_millis(1001)).await;
        assert_eq!(tb.tokens(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_admissions_respect_capacity() {
        let capacity = 50;
        let tb = Arc::new(TokenBucket::new(
            NonZeroUsize::new(capacity).unwrap(),
            NonZeroUsize::new(1).unwrap(),
            Duration::from_secs(60),
            RecordingUpstream::new(),
        ));

        let mut handles = vec![];
        for _ in 0..capacity * 2 {
            let tb = tb.clone();
            handles.push(tokio::spawn(async move { tb.add_request(request().0) }));
        }

        let results = futures::future::join_all(handles).await;
        let admitted = results.into_iter().filter(|r| matches!(r, Ok(true))).count();

        assert_eq!(admitted, capacity);
        assert_eq!(tb.tokens(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_tokens_stay_bounded_while_refilling() {
        let capacity = 5;
        let refill = 2;
        let interval = Duration::from_millis(1);
        let started = Instant::now();
        let tb = Arc::new(TokenBucket::new(
            NonZeroUsize::new(capacity).unwrap(),
            NonZeroUsize::new(refill).unwrap(),
            interval,
            RecordingUpstream::new(),
        ));

        let mut handles = vec![];
        for _ in 0..8 {
            let tb = tb.clone();
            handles.push(tokio::spawn(async move {
                let mut admitted = 0;
                while started.elapsed() < Duration::from_millis(50) {
                    if tb.add_request(request().0) {
                        admitted += 1;
                    }
                    assert!(tb.tokens() <= capacity);
                    tokio::task::yield_now().await;
                }
                admitted
            }));
        }

        let mut admitted = 0;
        for result in futures::future::join_all(handles).await {
            admitted += result.unwrap();
        }
        tb.stop();

        let refills = (started.elapsed().as_millis() / interval.as_millis()) as usize + 1;
        assert!(tb.tokens() <= capacity);
        assert!(admitted > capacity, "no refill raced the admissions");
        assert!(
            admitted <= capacity + refills * refill,
            "admitted {admitted} with at most {refills} refills"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_ends_refill_task() {
        let tb = bucket(2, 1, RecordingUpstream::new());
        let state = Arc::downgrade(&tb.state);
        settle().await;

        drop(tb);
        settle().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(state.upgrade().is_none(), "refill task still running");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_freezes_bucket() {
        let tb = bucket(1, 1, RecordingUpstream::new());
        assert!(tb.add_request(request().0));

        tb.stop();
        assert!(!tb.is_healthy());

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(tb.tokens(), 0);
        assert!(!tb.add_request(request().0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_admitted_request_completes_after_stop() {
        let upstream = RecordingUpstream::gated();
        let tb = bucket(1, 1, upstream.clone());

        let (req, completion) = request();
        assert!(tb.add_request(req));
        settle().await;

        tb.stop();
        upstream.release(1);

        assert!(completion.wait().await.is_some());
    }
}
