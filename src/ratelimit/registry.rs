//! Selection of limiter algorithms by name.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::fixed_window::FixedWindow;
use super::leaky_bucket::LeakyBucket;
use super::limiter::Limiter;
use super::rate::LimitParams;
use super::sliding_window::SlidingWindowCounter;
use super::sliding_window_log::SlidingWindowLog;
use super::token_bucket::TokenBucket;
use crate::error::{GatewayError, Result};
use crate::proxy::Upstream;

/// Builds a limiter from its parameters and the endpoint's upstream.
pub type Constructor = fn(&LimitParams, Arc<dyn Upstream>) -> Box<dyn Limiter>;

/// Map of strategy names to limiter constructors.
///
/// Names are matched case-insensitively, and `_` is accepted for `-`.
#[derive(Clone)]
pub struct Registry {
    constructors: BTreeMap<String, Constructor>,
}

impl Registry {
    /// A registry with no strategies.
    pub fn empty() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// Register (or replace) a strategy.
    pub fn register(&mut self, name: &str, constructor: Constructor) -> &mut Self {
        self.constructors.insert(normalize(name), constructor);
        self
    }

    /// Whether a strategy is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(&normalize(name))
    }

    /// Registered strategy names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }

    /// Build a limiter for `strategy`.
    pub fn build(
        &self,
        strategy: &str,
        params: &LimitParams,
        upstream: Arc<dyn Upstream>,
    ) -> Result<Box<dyn Limiter>> {
        let constructor = self
            .constructors
            .get(&normalize(strategy))
            .ok_or_else(|| GatewayError::UnknownStrategy(strategy.to_string()))?;
        Ok(constructor(params, upstream))
    }
}

impl Default for Registry {
    /// The five built-in algorithms.
    fn default() -> Self {
        let mut registry = Self::empty();
        registry
            .register(TokenBucket::NAME, token_bucket)
            .register(LeakyBucket::NAME, leaky_bucket)
            .register(FixedWindow::NAME, fixed_window)
            .register(SlidingWindowCounter::NAME, sliding_window)
            .register(SlidingWindowLog::NAME, sliding_window_log);
        registry
    }
}

fn token_bucket(params: &LimitParams, upstream: Arc<dyn Upstream>) -> Box<dyn Limiter> {
    Box::new(TokenBucket::from_params(params, upstream))
}

fn leaky_bucket(params: &LimitParams, upstream: Arc<dyn Upstream>) -> Box<dyn Limiter> {
    Box::new(LeakyBucket::from_params(params, upstream))
}

fn fixed_window(params: &LimitParams, upstream: Arc<dyn Upstream>) -> Box<dyn Limiter> {
    Box::new(FixedWindow::from_params(params, upstream))
}

fn sliding_window(params: &LimitParams, upstream: Arc<dyn Upstream>) -> Box<dyn Limiter> {
    Box::new(SlidingWindowCounter::from_params(params, upstream))
}

fn sliding_window_log(params: &LimitParams, upstream: Arc<dyn Upstream>) -> Box<dyn Limiter> {
    Box::new(SlidingWindowLog::from_params(params, upstream))
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

fn normalize(name: &str) -> String {
    name.trim().to_ascii_uppercase().replace('_', "-")
}
