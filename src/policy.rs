//! Retry policies
//!
//! A policy decides, after a failed attempt (or a value it rejected), whether the executor
//! should try again. Besides `can_retry` the trait carries hooks the executor calls at fixed
//! points of an invocation; stateless policies ignore them, the circuit breaker relies on them.
//!
//! Semantics:
//! - `can_retry` is consulted only after a Failure or a rejected Success.
//! - `accepts` is consulted on every Success; `false` turns it into a soft failure.
//! - `admit` runs before every attempt and may refuse it (circuit open).
//! - `on_success` / `on_exhausted` / `on_cancelled` fire once, at the invocation's end.
//!
//! Composition: [`RetryPolicyExt::and`] retries only when both sides allow it,
//! [`RetryPolicyExt::or`] when either does. A value is acceptable only if every member accepts it.
//!
//! Example
//! ```rust
//! use encore::policy::{MaxAttempts, RetryIf, RetryPolicyExt};
//!
//! #[derive(Debug)]
//! enum ApiError { Transient, Invalid }
//! impl std::fmt::Display for ApiError {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{:?}", self) }
//! }
//! impl std::error::Error for ApiError {}
//!
//! let policy = RetryIf::new(|e: &ApiError| matches!(e, ApiError::Transient))
//!     .and(MaxAttempts::new(3).unwrap());
//! # let _ = policy;
//! ```

use crate::circuit_breaker::CircuitOpen;
use crate::context::RetryContext;
use crate::retry::BuildError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Decides retry eligibility from the invocation's context.
pub trait RetryPolicy<T, E>: Send + Sync {
    /// Whether another attempt may be made after the attempt just recorded in `ctx`.
    fn can_retry(&self, ctx: &RetryContext<E>) -> bool;

    /// Whether a returned value ends the invocation.
    fn accepts(&self, _value: &T) -> bool {
        true
    }

    /// Called before every attempt; an error aborts the invocation without calling the
    /// operation.
    fn admit(&self, _ctx: &mut RetryContext<E>) -> Result<(), CircuitOpen> {
        Ok(())
    }

    /// The invocation completed with an accepted value.
    fn on_success(&self, _ctx: &RetryContext<E>) {}

    /// `can_retry` returned false; the invocation is ending in recovery or exhaustion.
    fn on_exhausted(&self, _ctx: &RetryContext<E>) {}

    /// The invocation was cancelled from outside.
    fn on_cancelled(&self, _ctx: &RetryContext<E>) {}
}

/// Type-erased policy, used where the concrete policy is chosen at runtime.
pub type BoxedPolicy<T, E> = Box<dyn RetryPolicy<T, E>>;

macro_rules! forward_policy {
    () => {
        fn can_retry(&self, ctx: &RetryContext<E>) -> bool {
            (**self).can_retry(ctx)
        }
        fn accepts(&self, value: &T) -> bool {
            (**self).accepts(value)
        }
        fn admit(&self, ctx: &mut RetryContext<E>) -> Result<(), CircuitOpen> {
            (**self).admit(ctx)
        }
        fn on_success(&self, ctx: &RetryContext<E>) {
            (**self).on_success(ctx)
        }
        fn on_exhausted(&self, ctx: &RetryContext<E>) {
            (**self).on_exhausted(ctx)
        }
        fn on_cancelled(&self, ctx: &RetryContext<E>) {
            (**self).on_cancelled(ctx)
        }
    };
}

// Explicit derefs: `self` would otherwise unsize-coerce to the wrapper's own impl.
impl<T, E> RetryPolicy<T, E> for Box<dyn RetryPolicy<T, E>> {
    forward_policy!();
}

impl<T, E, P> RetryPolicy<T, E> for Arc<P>
where
    P: RetryPolicy<T, E> + ?Sized,
{
    forward_policy!();
}

/// Retry forever. Pair with cancellation or an outer timeout.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

impl<T, E> RetryPolicy<T, E> for AlwaysRetry {
    fn can_retry(&self, _ctx: &RetryContext<E>) -> bool {
        true
    }
}

/// Never retry; the first failure ends the invocation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NeverRetry;

impl<T, E> RetryPolicy<T, E> for NeverRetry {
    fn can_retry(&self, _ctx: &RetryContext<E>) -> bool {
        false
    }
}

/// Stop once `max` attempts (initial call included) have been made.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaxAttempts {
    max: usize,
}

impl MaxAttempts {
    pub fn new(max: usize) -> Result<Self, BuildError> {
        if max == 0 {
            return Err(BuildError::InvalidMaxAttempts(max));
        }
        Ok(Self { max })
    }

    pub fn max(&self) -> usize {
        self.max
    }
}

impl Default for MaxAttempts {
    fn default() -> Self {
        Self { max: 3 }
    }
}

impl<T, E> RetryPolicy<T, E> for MaxAttempts {
    fn can_retry(&self, ctx: &RetryContext<E>) -> bool {
        ctx.retry_count() < self.max
    }
}

/// Retry while less than `limit` has elapsed since the first attempt, however many attempts
/// that allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeout {
    limit: Duration,
}

impl Timeout {
    pub fn new(limit: Duration) -> Self {
        Self { limit }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }
}

impl<T, E> RetryPolicy<T, E> for Timeout {
    fn can_retry(&self, ctx: &RetryContext<E>) -> bool {
        ctx.elapsed() < self.limit
    }
}

/// Retry only failures whose error satisfies the predicate.
#[derive(Clone)]
pub struct RetryIf<F> {
    predicate: F,
}

impl<F> RetryIf<F> {
    pub fn new<E>(predicate: F) -> Self
    where
        F: Fn(&E) -> bool,
    {
        Self { predicate }
    }
}

impl<F> fmt::Debug for RetryIf<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryIf").field("predicate", &"<predicate>").finish()
    }
}

impl<T, E, F> RetryPolicy<T, E> for RetryIf<F>
where
    F: Fn(&E) -> bool + Send + Sync,
{
    fn can_retry(&self, ctx: &RetryContext<E>) -> bool {
        ctx.last_failure().is_some_and(|e| (self.predicate)(e))
    }
}

/// Retry while the returned value satisfies the predicate ("not good yet"). Failures are not
/// retried by this policy; combine with [`RetryIf`] through `or` for that.
#[derive(Clone)]
pub struct RetryIfResult<F> {
    predicate: F,
}

impl<F> RetryIfResult<F> {
    pub fn new<T>(predicate: F) -> Self
    where
        F: Fn(&T) -> bool,
    {
        Self { predicate }
    }
}

impl<F> fmt::Debug for RetryIfResult<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryIfResult").field("predicate", &"<predicate>").finish()
    }
}

impl<T, E, F> RetryPolicy<T, E> for RetryIfResult<F>
where
    F: Fn(&T) -> bool + Send + Sync,
{
    fn can_retry(&self, ctx: &RetryContext<E>) -> bool {
        ctx.last_result_rejected()
    }

    fn accepts(&self, value: &T) -> bool {
        !(self.predicate)(value)
    }
}

/// Policy backed by a closure over the whole context.
#[derive(Clone)]
pub struct FnPolicy<F> {
    f: F,
}

/// Build a policy from a closure, e.g. one reading a value the operation stored in the
/// context's attributes.
pub fn policy_fn<E, F>(f: F) -> FnPolicy<F>
where
    F: Fn(&RetryContext<E>) -> bool,
{
    FnPolicy { f }
}

impl<F> fmt::Debug for FnPolicy<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnPolicy").finish_non_exhaustive()
    }
}

impl<T, E, F> RetryPolicy<T, E> for FnPolicy<F>
where
    F: Fn(&RetryContext<E>) -> bool + Send + Sync,
{
    fn can_retry(&self, ctx: &RetryContext<E>) -> bool {
        (self.f)(ctx)
    }
}

/// Both policies must allow a retry.
#[derive(Debug, Clone)]
pub struct And<A, B> {
    first: A,
    second: B,
}

/// Either policy may allow a retry.
#[derive(Debug, Clone)]
pub struct Or<A, B> {
    first: A,
    second: B,
}

macro_rules! forward_hooks_to_both {
    () => {
        fn accepts(&self, value: &T) -> bool {
            self.first.accepts(value) && self.second.accepts(value)
        }

        fn admit(&self, ctx: &mut RetryContext<E>) -> Result<(), CircuitOpen> {
            self.first.admit(ctx)?;
            self.second.admit(ctx)
        }

        fn on_success(&self, ctx: &RetryContext<E>) {
            self.first.on_success(ctx);
            self.second.on_success(ctx);
        }

        fn on_exhausted(&self, ctx: &RetryContext<E>) {
            self.first.on_exhausted(ctx);
            self.second.on_exhausted(ctx);
        }

        fn on_cancelled(&self, ctx: &RetryContext<E>) {
            self.first.on_cancelled(ctx);
            self.second.on_cancelled(ctx);
        }
    };
}

impl<T, E, A, B> RetryPolicy<T, E> for And<A, B>
where
    A: RetryPolicy<T, E>,
    B: RetryPolicy<T, E>,
{
    fn can_retry(&self, ctx: &RetryContext<E>) -> bool {
        self.first.can_retry(ctx) && self.second.can_retry(ctx)
    }

    forward_hooks_to_both!();
}

impl<T, E, A, B> RetryPolicy<T, E> for Or<A, B>
where
    A: RetryPolicy<T, E>,
    B: RetryPolicy<T, E>,
{
    fn can_retry(&self, ctx: &RetryContext<E>) -> bool {
        self.first.can_retry(ctx) || self.second.can_retry(ctx)
    }

    forward_hooks_to_both!();
}

/// Combinators available on every policy.
pub trait RetryPolicyExt: Sized {
    fn and<P>(self, other: P) -> And<Self, P> {
        And { first: self, second: other }
    }

    fn or<P>(self, other: P) -> Or<Self, P> {
        Or { first: self, second: other }
    }
}

impl<P> RetryPolicyExt for P {}
