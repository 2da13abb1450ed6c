//! Admission control: the limiter contract, its five algorithms, and the
//! dispatch of admitted requests.

mod dispatch;
mod fixed_window;
mod leaky_bucket;
mod limiter;
mod rate;
mod registry;
mod request;
mod sliding_window;
mod sliding_window_log;
mod state;
mod token_bucket;

#[cfg(test)]
pub(crate) mod testing;

pub use dispatch::serve_request;
pub use fixed_window::FixedWindow;
pub use leaky_bucket::{LeakyBucket, MAX_WORKERS};
pub use limiter::Limiter;
pub use rate::{LimitParams, Rate, MIN_INTERVAL};
pub use registry::{Constructor, Registry};
pub use request::{Completion, Request, REQUEST_ID_HEADER};
pub use sliding_window::{SlidingWindowCounter, WindowSnapshot};
pub use sliding_window_log::SlidingWindowLog;
pub use token_bucket::TokenBucket;
