//! The admission control contract shared by every algorithm.

use super::request::Request;

/// Trait for rate limiter implementations.
///
/// One limiter guards one (endpoint, method) pair. It owns a background task
/// started at construction and terminated by [`Limiter::stop`].
pub trait Limiter: Send + Sync {
    /// Strategy name, for logging.
    fn name(&self) -> &'static str;

    /// Offer a request for admission.
    ///
    /// Returns `true` if the request was admitted. An admitted request is
    /// dispatched asynchronously, either right away or (for queueing
    /// algorithms) later; the call itself never waits for the upstream. A
    /// rejected request is dropped, which closes its completion signal.
    #[must_use]
    fn add_request(&self, request: Request) -> bool;

    /// Terminate the background task.
    ///
    /// After `stop` returns no further state change is observable and every
    /// later admission is rejected. Requests admitted before still complete
    /// their dispatch.
    fn stop(&self);

    /// Whether the limiter is still running. A stopped limiter, or one whose
    /// background task failed, rejects everything.
    fn is_healthy(&self) -> bool;
}
