//! Backoff strategies for the retry executor.
//!
//! Provides fixed, incrementing, exponential, Fibonacci, random and joined strategies. Attempt
//! semantics: the delay is computed from the context's `retry_count` once an attempt has failed,
//! so `retry_count = 1` is the wait after the first attempt. `retry_count = 0` (nothing attempted
//! yet) always yields zero.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use encore::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100), Duration::from_secs(1)).unwrap();
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(5), Duration::from_secs(1)); // capped
//!
//! let fib = Backoff::fibonacci(Duration::from_millis(100), Duration::from_secs(1)).unwrap();
//! assert_eq!(fib.delay(5), Duration::from_millis(500));
//! ```
//!
//! Overflow behavior: computations that would overflow saturate to the strategy's cap, or to
//! `MAX_BACKOFF` (1 day) for uncapped strategies.

use crate::context::RetryContext;
use rand::{rng, Rng};
use std::fmt;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Default multiplier for exponential backoff.
pub const DEFAULT_MULTIPLIER: f64 = 2.0;

const FIB_LEN: usize = 94; // fib(93) is the largest value that fits in a u64

const FIBONACCI: [u64; FIB_LEN] = fibonacci_table();

const fn fibonacci_table() -> [u64; FIB_LEN] {
    let mut table = [0u64; FIB_LEN];
    table[1] = 1;
    table[2] = 1;
    let mut i = 3;
    while i < FIB_LEN {
        table[i] = table[i - 1] + table[i - 2];
        i += 1;
    }
    table
}

/// Errors returned by backoff configuration.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackoffError {
    #[error("max ({max:?}) must be >= initial ({initial:?})")]
    MaxLessThanInitial { initial: Duration, max: Duration },
    #[error("multiplier must be finite and >= 1.0 (got {0})")]
    InvalidMultiplier(f64),
    #[error("random backoff requires min ({min:?}) <= max ({max:?})")]
    InvertedRange { min: Duration, max: Duration },
    #[error("join requires at least one strategy")]
    EmptyJoin,
}

/// Trait implemented by all backoff strategies.
pub trait BackoffStrategy: Send + Sync + fmt::Debug {
    /// Delay to wait after `retry_count` attempts have been made.
    fn delay(&self, retry_count: usize) -> Duration;
}

#[derive(Debug, Clone, PartialEq)]
struct FixedBackoff {
    delay: Duration,
}

impl BackoffStrategy for FixedBackoff {
    fn delay(&self, retry_count: usize) -> Duration {
        if retry_count == 0 {
            Duration::ZERO
        } else {
            self.delay
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct IncrementingBackoff {
    initial: Duration,
    step: Duration,
}

impl BackoffStrategy for IncrementingBackoff {
    fn delay(&self, retry_count: usize) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let steps = (retry_count - 1).min(u32::MAX as usize) as u32;
        self.step
            .checked_mul(steps)
            .and_then(|grown| grown.checked_add(self.initial))
            .unwrap_or(MAX_BACKOFF)
            .min(MAX_BACKOFF)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ExponentialBackoff {
    initial: Duration,
    max: Duration,
    multiplier: f64,
}

impl BackoffStrategy for ExponentialBackoff {
    fn delay(&self, retry_count: usize) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let cap = self.max.min(MAX_BACKOFF);
        let exponent = (retry_count - 1).min(i32::MAX as usize) as i32;
        let nanos = self.initial.as_nanos() as f64 * self.multiplier.powi(exponent);
        // powi overflows to infinity long before the cast could misbehave
        if !nanos.is_finite() || nanos >= cap.as_nanos() as f64 {
            return cap;
        }
        Duration::from_nanos(nanos as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct FibonacciBackoff {
    initial: Duration,
    max: Duration,
}

impl BackoffStrategy for FibonacciBackoff {
    fn delay(&self, retry_count: usize) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let cap = self.max.min(MAX_BACKOFF);
        let Some(fib) = FIBONACCI.get(retry_count) else {
            return cap;
        };
        let nanos = self.initial.as_nanos().saturating_mul(u128::from(*fib));
        if nanos >= cap.as_nanos() {
            return cap;
        }
        Duration::from_nanos(nanos as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct RandomBackoff {
    min: Duration,
    max: Duration,
}

impl BackoffStrategy for RandomBackoff {
    fn delay(&self, retry_count: usize) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }
        let min = crate::clock::millis(self.min);
        let max = crate::clock::millis(self.max);
        Duration::from_millis(rng().random_range(min..=max))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum BackoffKind {
    Fixed(FixedBackoff),
    Incrementing(IncrementingBackoff),
    Exponential(ExponentialBackoff),
    Fibonacci(FibonacciBackoff),
    Random(RandomBackoff),
    Join(Vec<Backoff>),
}

impl BackoffStrategy for BackoffKind {
    fn delay(&self, retry_count: usize) -> Duration {
        match self {
            BackoffKind::Fixed(f) => f.delay(retry_count),
            BackoffKind::Incrementing(i) => i.delay(retry_count),
            BackoffKind::Exponential(e) => e.delay(retry_count),
            BackoffKind::Fibonacci(f) => f.delay(retry_count),
            BackoffKind::Random(r) => r.delay(retry_count),
            BackoffKind::Join(children) => {
                children.iter().map(|c| c.delay(retry_count)).max().unwrap_or(Duration::ZERO)
            }
        }
    }
}

/// Backoff strategy wrapper over the closed set of concrete strategies.
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    kind: BackoffKind,
}

impl Backoff {
    /// No wait between attempts.
    pub fn none() -> Self {
        Self::fixed(Duration::ZERO)
    }

    /// Always wait `delay`.
    pub fn fixed(delay: Duration) -> Self {
        Self { kind: BackoffKind::Fixed(FixedBackoff { delay }) }
    }

    /// `initial + step * (retry_count - 1)`, unbounded apart from `MAX_BACKOFF`.
    pub fn incrementing(initial: Duration, step: Duration) -> Self {
        Self { kind: BackoffKind::Incrementing(IncrementingBackoff { initial, step }) }
    }

    /// `min(max, initial * 2^(retry_count - 1))`.
    pub fn exponential(initial: Duration, max: Duration) -> Result<Self, BackoffError> {
        if max < initial {
            return Err(BackoffError::MaxLessThanInitial { initial, max });
        }
        Ok(Self {
            kind: BackoffKind::Exponential(ExponentialBackoff {
                initial,
                max,
                multiplier: DEFAULT_MULTIPLIER,
            }),
        })
    }

    /// Replace the exponential multiplier (must be finite and >= 1). No effect on other
    /// strategies.
    pub fn with_multiplier(mut self, multiplier: f64) -> Result<Self, BackoffError> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(BackoffError::InvalidMultiplier(multiplier));
        }
        if let BackoffKind::Exponential(exp) = &mut self.kind {
            exp.multiplier = multiplier;
        }
        Ok(self)
    }

    /// `min(max, initial * fib(retry_count))` with `fib(1) = fib(2) = 1`.
    pub fn fibonacci(initial: Duration, max: Duration) -> Result<Self, BackoffError> {
        if max < initial {
            return Err(BackoffError::MaxLessThanInitial { initial, max });
        }
        Ok(Self { kind: BackoffKind::Fibonacci(FibonacciBackoff { initial, max }) })
    }

    /// Uniformly random wait in `[min, max]` (millisecond resolution).
    pub fn random(min: Duration, max: Duration) -> Result<Self, BackoffError> {
        if max < min {
            return Err(BackoffError::InvertedRange { min, max });
        }
        Ok(Self { kind: BackoffKind::Random(RandomBackoff { min, max }) })
    }

    /// Longest delay among `children` for the same attempt, e.g. a fixed floor joined with a
    /// capped exponential curve.
    pub fn join<I>(children: I) -> Result<Self, BackoffError>
    where
        I: IntoIterator<Item = Backoff>,
    {
        let children: Vec<Backoff> = children.into_iter().collect();
        if children.is_empty() {
            return Err(BackoffError::EmptyJoin);
        }
        Ok(Self { kind: BackoffKind::Join(children) })
    }

    /// Calculate the delay after `retry_count` attempts.
    pub fn delay(&self, retry_count: usize) -> Duration {
        self.kind.delay(retry_count)
    }

    /// Delay for the next wait of an in-flight invocation.
    pub fn next_delay<E>(&self, ctx: &RetryContext<E>) -> Duration {
        self.delay(ctx.retry_count())
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::none()
    }
}

impl BackoffStrategy for Backoff {
    fn delay(&self, retry_count: usize) -> Duration {
        self.kind.delay(retry_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn fixed_backoff_returns_same_delay() {
        let backoff = Backoff::fixed(ms(250));
        assert_eq!(backoff.delay(0), Duration::ZERO);
        for retry_count in 1..=1000 {
            assert_eq!(backoff.delay(retry_count), ms(250));
        }
    }

    #[test]
    fn incrementing_backoff_grows_by_step() {
        let backoff = Backoff::incrementing(ms(200), ms(100));
        assert_eq!(backoff.delay(1), ms(200));
        assert_eq!(backoff.delay(2), ms(300));
        assert_eq!(backoff.delay(3), ms(400));
        assert_eq!(backoff.delay(11), ms(1200));
    }

    #[test]
    fn incrementing_backoff_saturates() {
        let backoff = Backoff::incrementing(Duration::from_secs(1), Duration::from_secs(u64::MAX / 4));
        assert_eq!(backoff.delay(1_000_000), MAX_BACKOFF);
    }

    #[test]
    fn exponential_backoff_doubles_until_cap() {
        let backoff = Backoff::exponential(ms(100), ms(1000)).unwrap();
        let delays: Vec<_> = (1..=5).map(|n| backoff.delay(n)).collect();
        assert_eq!(delays, vec![ms(100), ms(200), ms(400), ms(800), ms(1000)]);
        assert_eq!(backoff.delay(64), ms(1000));
    }

    #[test]
    fn exponential_backoff_custom_multiplier() {
        let backoff =
            Backoff::exponential(ms(100), Duration::from_secs(60)).unwrap().with_multiplier(3.0).unwrap();
        assert_eq!(backoff.delay(1), ms(100));
        assert_eq!(backoff.delay(2), ms(300));
        assert_eq!(backoff.delay(3), ms(900));
    }

    #[test]
    fn exponential_backoff_handles_overflow() {
        let backoff = Backoff::exponential(Duration::from_secs(1), Duration::MAX).unwrap();
        assert_eq!(backoff.delay(1_000_000_000), MAX_BACKOFF);
        assert_eq!(backoff.delay(usize::MAX), MAX_BACKOFF);
    }

    #[test]
    fn multiplier_validation() {
        let base = Backoff::exponential(ms(1), ms(2)).unwrap();
        assert!(matches!(
            base.clone().with_multiplier(0.5),
            Err(BackoffError::InvalidMultiplier(_))
        ));
        assert!(matches!(
            base.with_multiplier(f64::INFINITY),
            Err(BackoffError::InvalidMultiplier(_))
        ));
    }

    #[test]
    fn fibonacci_backoff_follows_sequence() {
        let backoff = Backoff::fibonacci(ms(100), ms(1000)).unwrap();
        let delays: Vec<_> = (1..=7).map(|n| backoff.delay(n)).collect();
        assert_eq!(delays, vec![ms(100), ms(100), ms(200), ms(300), ms(500), ms(800), ms(1000)]);
    }

    #[test]
    fn fibonacci_beyond_table_is_capped() {
        let backoff = Backoff::fibonacci(ms(1), Duration::from_secs(5)).unwrap();
        assert_eq!(backoff.delay(FIB_LEN + 10), Duration::from_secs(5));
        assert_eq!(FIBONACCI[93], 12_200_160_415_121_876_738);
    }

    #[test]
    fn random_backoff_stays_in_range() {
        let backoff = Backoff::random(ms(50), ms(80)).unwrap();
        for n in 1..100 {
            let d = backoff.delay(n);
            assert!(d >= ms(50) && d <= ms(80), "{d:?}");
        }
    }

    #[test]
    fn join_takes_longest_child() {
        let backoff = Backoff::join([
            Backoff::exponential(ms(25), ms(500)).unwrap(),
            Backoff::fixed(ms(50)),
        ])
        .unwrap();
        assert_eq!(backoff.delay(1), ms(50));
        assert_eq!(backoff.delay(2), ms(50));
        assert_eq!(backoff.delay(3), ms(100));
        assert_eq!(backoff.delay(10), ms(500));
    }

    #[test]
    fn constructor_validation() {
        assert!(matches!(
            Backoff::exponential(ms(10), ms(5)),
            Err(BackoffError::MaxLessThanInitial { .. })
        ));
        assert!(matches!(
            Backoff::fibonacci(ms(10), ms(5)),
            Err(BackoffError::MaxLessThanInitial { .. })
        ));
        assert!(matches!(Backoff::random(ms(10), ms(5)), Err(BackoffError::InvertedRange { .. })));
        assert_eq!(Backoff::join(Vec::new()), Err(BackoffError::EmptyJoin));
    }

    #[test]
    fn zero_retry_count_never_waits() {
        for backoff in [
            Backoff::fixed(ms(5)),
            Backoff::incrementing(ms(5), ms(5)),
            Backoff::exponential(ms(5), ms(50)).unwrap(),
            Backoff::fibonacci(ms(5), ms(50)).unwrap(),
            Backoff::random(ms(5), ms(6)).unwrap(),
        ] {
            assert_eq!(backoff.delay(0), Duration::ZERO);
        }
    }
}
