//! Convenient re-exports for common Encore types.
pub use crate::{
    backoff::{Backoff, BackoffError, BackoffStrategy, MAX_BACKOFF},
    circuit_breaker::{CircuitBreakerConfig, CircuitBreakerError, CircuitBreakerPolicy},
    config::{BackoffConfig, CircuitBreakerSettings, ConfigError, RetryConfig},
    context::{Attributes, RetryContext, RetryState},
    jitter::Jitter,
    listener::{Listeners, RetryListener, Termination},
    policy::{
        policy_fn, AlwaysRetry, MaxAttempts, NeverRetry, RetryIf, RetryIfResult, RetryPolicy,
        RetryPolicyExt, Timeout,
    },
    retry::{BuildError, CallOptions, RetryExecutor, RetryLayer},
    stats::{StatisticsListener, StatisticsRepository},
    RetryError,
};
