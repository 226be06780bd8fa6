#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Encore
//!
//! Retry execution engine for async Rust: run a fallible operation again under a policy,
//! with configurable waits, shared circuit breaking and per-key statistics.
//!
//! ## Features
//!
//! - **Retry policies**: max attempts, elapsed-time limit, error and result predicates,
//!   closures over the retry context, `and`/`or` composition
//! - **Backoff strategies**: fixed, incrementing, exponential, Fibonacci, random and joined,
//!   with optional jitter
//! - **Circuit breaker** keyed by logical operation, with lazy half-open trials
//! - **Listeners** notified on every attempt, and a **statistics repository** fed by one
//! - **Recovery callbacks** and **cancellation** per call
//! - **Tower layer** for retrying services
//!
//! ## Quick Start
//!
//! ```rust
//! use encore::{Backoff, Jitter, RetryExecutor};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     let executor = RetryExecutor::builder()
//!         .max_attempts(3)
//!         .backoff(Backoff::fibonacci(Duration::from_millis(10), Duration::from_secs(1)).unwrap())
//!         .with_jitter(Jitter::equal())
//!         .build()
//!         .unwrap();
//!
//!     let result = executor.execute(|| async {
//!         // Your async operation here
//!         Ok::<_, std::io::Error>(())
//!     }).await;
//!     assert!(result.is_ok());
//! }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod circuit_store;
pub mod clock;
pub mod config;
pub mod context;
pub mod error;
pub mod jitter;
pub mod listener;
pub mod policy;
pub mod prelude;
pub mod retry;
pub mod sleeper;
pub mod stats;

// Re-exports
pub use backoff::{Backoff, BackoffError};
pub use circuit_breaker::{CircuitBreakerConfig, CircuitBreakerPolicy, CircuitOpen};
pub use circuit_store::{CircuitState, CircuitStateStore, CircuitStatus};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::RetryConfig;
pub use context::{Attempt, AttemptOutcome, Attributes, RetryContext, RetryState};
pub use error::RetryError;
pub use jitter::Jitter;
pub use listener::{Listeners, LogListener, MemoryListener, RetryListener, Termination};
pub use policy::{RetryPolicy, RetryPolicyExt};
pub use retry::{BuildError, CallOptions, RetryExecutor, RetryExecutorBuilder, RetryLayer};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use stats::{RetryStatistics, StatisticsListener, StatisticsRepository};
