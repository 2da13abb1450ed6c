//! Sluice - Rate Limiting Reverse Proxy
//!
//! This crate implements an HTTP gateway that forwards calls to upstream
//! services, guarding every endpoint and method with its own admission
//! limiter. Five algorithms are available: token bucket, leaky bucket,
//! fixed window, sliding window counter and sliding window log.

pub mod config;
pub mod error;
pub mod proxy;
pub mod ratelimit;
