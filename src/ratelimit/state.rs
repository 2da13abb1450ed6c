//! Shared state and background task plumbing common to every limiter.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::error;

/// Mutable limiter state behind the limiter's single lock.
///
/// Every admission decision and every background mutation goes through
/// [`LimiterState::admit`] or [`LimiterState::update`]. Both refuse to touch
/// the state once the limiter is stopped or has failed, and [`stop`] takes
/// the same lock, so nothing mutates the state after `stop` returns.
///
/// [`stop`]: LimiterState::stop
pub(crate) struct LimiterState<S> {
    inner: Mutex<S>,
    shutdown: CancellationToken,
    failed: AtomicBool,
}

impl<S> LimiterState<S> {
    pub(crate) fn new(state: S) -> Self {
        Self {
            inner: Mutex::new(state),
            shutdown: CancellationToken::new(),
            failed: AtomicBool::new(false),
        }
    }

    /// Run an admission decision. A stopped or failed limiter rejects.
    pub(crate) fn admit<F>(&self, decide: F) -> bool
    where
        F: FnOnce(&mut S) -> bool,
    {
        let mut state = self.inner.lock();
        if !self.is_running() {
            return false;
        }
        decide(&mut state)
    }

    /// Apply a background mutation. Returns `None` once the limiter stopped.
    pub(crate) fn update<R, F>(&self, mutate: F) -> Option<R>
    where
        F: FnOnce(&mut S) -> R,
    {
        let mut state = self.inner.lock();
        if !self.is_running() {
            return None;
        }
        Some(mutate(&mut state))
    }

    /// Read the state without mutating it.
    pub(crate) fn read<R, F>(&self, observe: F) -> R
    where
        F: FnOnce(&S) -> R,
    {
        observe(&self.inner.lock())
    }

    /// Stop the limiter, running `finish` on the state under the lock.
    pub(crate) fn stop_with<F>(&self, finish: F)
    where
        F: FnOnce(&mut S),
    {
        let mut state = self.inner.lock();
        self.shutdown.cancel();
        finish(&mut state);
    }

    pub(crate) fn stop(&self) {
        self.stop_with(|_| {});
    }

    /// The token cancelled by [`LimiterState::stop`].
    pub(crate) fn shutdown(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// A guard that cancels the background task when the owning limiter is
    /// dropped without being stopped.
    pub(crate) fn stop_on_drop(&self) -> DropGuard {
        self.shutdown.clone().drop_guard()
    }

    pub(crate) fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.failed.load(Ordering::Acquire)
    }

    fn fail(&self) {
        self.failed.store(true, Ordering::Release);
    }
}

/// Spawn the background task of a limiter.
///
/// A panic inside the task is contained: it is logged and the limiter is
/// marked failed, after which it rejects every admission.
pub(crate) fn spawn_background<S, F>(
    limiter: &'static str,
    state: std::sync::Arc<LimiterState<S>>,
    task: F,
) -> JoinHandle<()>
where
    S: Send + 'static,
    F: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        if AssertUnwindSafe(task).catch_unwind().await.is_err() {
            error!(
                limiter = limiter,
                "Background task failed; limiter now rejects all requests"
            );
            state.fail();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_admit_and_update() {
        let state = LimiterState::new(0u32);

        assert!(state.admit(|n| {
            *n += 1;
            true
        }));
        assert_eq!(state.update(|n| *n * 10), Some(10));
        assert_eq!(state.read(|n| *n), 1);
    }

    #[test]
    fn test_stopped_state_rejects_and_freezes() {
        let state = LimiterState::new(5u32);
        state.stop_with(|n| *n = 0);

        assert!(!state.admit(|_| true));
        assert_eq!(state.update(|n| *n += 1), None);
        assert_eq!(state.read(|n| *n), 0);
        assert!(state.shutdown().is_cancelled());
    }

    #[tokio::test]
    async fn test_panicking_task_fails_closed() {
        let state = Arc::new(LimiterState::new(()));

        let handle = spawn_background("test", state.clone(), async {
            panic!("inconsistent state");
        });
        handle.await.unwrap();

        assert!(!state.is_running());
        assert!(!state.admit(|_| true));
    }

    #[tokio::test]
    async fn test_drop_guard_ends_background_task() {
        let state = Arc::new(LimiterState::new(0u32));
        let shared = state.clone();
        let guard = state.stop_on_drop();

        let handle = spawn_background("test", state.clone(), async move {
            shared.shutdown().cancelled().await;
        });
        assert!(!handle.is_finished());

        drop(guard);
        handle.await.unwrap();
        assert!(!state.is_running());
        assert_eq!(Arc::strong_count(&state), 1);
    }
}
