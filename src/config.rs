//! Declarative executor configuration
//!
//! `RetryConfig` mirrors the builder in plain data so retry settings can live in a config file.
//! With the `serde` feature (on by default) it deserializes from any serde format:
//!
//! ```rust
//! # #[cfg(feature = "serde")]
//! # {
//! use encore::config::RetryConfig;
//!
//! #[derive(Debug)]
//! struct Flaky;
//! impl std::fmt::Display for Flaky {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "flaky") }
//! }
//! impl std::error::Error for Flaky {}
//!
//! let config: RetryConfig = serde_json::from_str(r#"{
//!     "max_attempts": 5,
//!     "backoff": { "type": "exponential", "initial_ms": 100, "max_ms": 2000 },
//!     "jitter": "full",
//!     "circuit_breaker": { "failure_threshold": 3 }
//! }"#).unwrap();
//! let executor = config.into_executor::<String, Flaky, _>(|_e| true).unwrap();
//! # let _ = executor;
//! # }
//! ```
//!
//! Which errors are retryable is code, not data, so it is passed to `into_executor`.

use crate::backoff::BackoffError;
use crate::circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerPolicy};
use crate::policy::{BoxedPolicy, MaxAttempts, RetryIf, RetryPolicyExt, Timeout};
use crate::retry::{BuildError, RetryExecutor, RetryExecutorBuilder};
use crate::{Backoff, Jitter};
use std::time::Duration;

/// Errors raised while turning configuration into an executor.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid retry settings: {0}")]
    Build(#[from] BuildError),
    #[error("invalid backoff: {0}")]
    Backoff(#[from] BackoffError),
    #[error("invalid circuit breaker: {0}")]
    CircuitBreaker(#[from] CircuitBreakerError),
    #[error("timeout_ms must be > 0")]
    ZeroTimeout,
}

/// Backoff strategy as data. Durations are in milliseconds.
#[derive(Debug, Clone, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(tag = "type", rename_all = "snake_case"))]
pub enum BackoffConfig {
    #[default]
    None,
    Fixed {
        delay_ms: u64,
    },
    Incrementing {
        initial_ms: u64,
        step_ms: u64,
    },
    Exponential {
        initial_ms: u64,
        max_ms: u64,
        #[cfg_attr(feature = "serde", serde(default, skip_serializing_if = "Option::is_none"))]
        multiplier: Option<f64>,
    },
    Fibonacci {
        initial_ms: u64,
        max_ms: u64,
    },
    Random {
        min_ms: u64,
        max_ms: u64,
    },
    Join {
        strategies: Vec<BackoffConfig>,
    },
}

impl BackoffConfig {
    pub fn to_backoff(&self) -> Result<Backoff, BackoffError> {
        let ms = Duration::from_millis;
        Ok(match self {
            BackoffConfig::None => Backoff::none(),
            BackoffConfig::Fixed { delay_ms } => Backoff::fixed(ms(*delay_ms)),
            BackoffConfig::Incrementing { initial_ms, step_ms } => {
                Backoff::incrementing(ms(*initial_ms), ms(*step_ms))
            }
            BackoffConfig::Exponential { initial_ms, max_ms, multiplier } => {
                let backoff = Backoff::exponential(ms(*initial_ms), ms(*max_ms))?;
                match multiplier {
                    Some(m) => backoff.with_multiplier(*m)?,
                    None => backoff,
                }
            }
            BackoffConfig::Fibonacci { initial_ms, max_ms } => {
                Backoff::fibonacci(ms(*initial_ms), ms(*max_ms))?
            }
            BackoffConfig::Random { min_ms, max_ms } => Backoff::random(ms(*min_ms), ms(*max_ms))?,
            BackoffConfig::Join { strategies } => Backoff::join(
                strategies.iter().map(BackoffConfig::to_backoff).collect::<Result<Vec<_>, _>>()?,
            )?,
        })
    }
}

/// Circuit breaker settings as data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CircuitBreakerSettings {
    pub failure_threshold: usize,
    pub open_timeout_ms: u64,
    pub reset_timeout_ms: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        let defaults = CircuitBreakerConfig::default();
        Self {
            failure_threshold: defaults.failure_threshold(),
            open_timeout_ms: defaults.open_timeout().as_millis() as u64,
            reset_timeout_ms: defaults.reset_timeout().as_millis() as u64,
        }
    }
}

impl CircuitBreakerSettings {
    pub fn to_config(&self) -> Result<CircuitBreakerConfig, CircuitBreakerError> {
        CircuitBreakerConfig::new(
            self.failure_threshold,
            Duration::from_millis(self.open_timeout_ms),
            Duration::from_millis(self.reset_timeout_ms),
        )
    }
}

/// Executor settings as data.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
pub struct RetryConfig {
    /// Total attempts including the first call.
    pub max_attempts: usize,
    /// Stop retrying once this much time has passed since the first attempt.
    pub timeout_ms: Option<u64>,
    pub backoff: BackoffConfig,
    pub jitter: Jitter,
    pub circuit_breaker: Option<CircuitBreakerSettings>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: MaxAttempts::default().max(),
            timeout_ms: None,
            backoff: BackoffConfig::None,
            jitter: Jitter::None,
            circuit_breaker: None,
        }
    }
}

impl RetryConfig {
    /// Validate and translate into a builder, leaving sleeper, clock and listeners to the caller.
    ///
    /// The policy retries errors matching `retry_on` while attempts remain (and, when
    /// `timeout_ms` is set, while time remains), wrapped in a circuit breaker when configured.
    pub fn into_builder<T, E, F>(
        self,
        retry_on: F,
    ) -> Result<RetryExecutorBuilder<BoxedPolicy<T, E>>, ConfigError>
    where
        T: 'static,
        E: 'static,
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        let mut policy: BoxedPolicy<T, E> =
            Box::new(RetryIf::new(retry_on).and(MaxAttempts::new(self.max_attempts)?));
        if let Some(timeout_ms) = self.timeout_ms {
            if timeout_ms == 0 {
                return Err(ConfigError::ZeroTimeout);
            }
            policy = Box::new(policy.and(Timeout::new(Duration::from_millis(timeout_ms))));
        }
        if let Some(settings) = self.circuit_breaker {
            policy = Box::new(CircuitBreakerPolicy::new(policy, settings.to_config()?));
        }
        let backoff = self.backoff.to_backoff()?;
        Ok(RetryExecutor::builder().policy(policy).backoff(backoff).with_jitter(self.jitter))
    }

    pub fn into_executor<T, E, F>(
        self,
        retry_on: F,
    ) -> Result<RetryExecutor<BoxedPolicy<T, E>>, ConfigError>
    where
        T: 'static,
        E: 'static,
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        Ok(self.into_builder(retry_on)?.build()?)
    }
}
