//! Retry executor
//!
//! Runs a fallible async operation under a [`RetryPolicy`], waiting between attempts according
//! to a [`Backoff`] (optionally jittered) and notifying [`Listeners`] as it goes.
//!
//! Semantics:
//! - The policy is asked for admission before every attempt; a refusal ends the invocation with
//!   `RetryError::CircuitOpen` and the operation is not called.
//! - A returned value the policy does not accept is a soft failure: it counts as an attempt and
//!   may be retried, but no failure is recorded.
//! - When the policy stops, the per-call recovery callback (if any) produces the final result;
//!   otherwise the invocation fails with `RetryError::RetryExhausted`.
//! - Cancellation is observed before each attempt, while the operation runs and while waiting
//!   out the backoff, and wins over every other outcome.
//!
//! Invariants:
//! - `retry_count` in the context equals the number of operation invocations so far.
//! - Backoff/Jitter are consulted exactly once per wait, never after the last attempt.
//! - The policy's end-of-invocation hook fires once.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use encore::{Backoff, Jitter, RetryError, RetryExecutor};
//!
//! #[derive(Debug)]
//! struct MyErr;
//! impl std::fmt::Display for MyErr { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "oops") } }
//! impl std::error::Error for MyErr {}
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let executor = RetryExecutor::builder()
//!     .max_attempts(3) // total attempts
//!     .backoff(Backoff::exponential(Duration::from_millis(1), Duration::from_millis(10)).unwrap())
//!     .with_jitter(Jitter::full())
//!     .build()
//!     .unwrap();
//! let result: Result<(), RetryError<MyErr>> = executor.execute(|| async { Err(MyErr) }).await;
//! assert_eq!(result.unwrap_err().attempts(), 3);
//! # });
//! ```

use crate::clock::{Clock, MonotonicClock};
use crate::context::{Attempt, AttemptOutcome, Attributes, RetryContext, RetryState};
use crate::listener::{Listeners, RetryListener, Termination};
use crate::policy::{MaxAttempts, RetryPolicy};
use crate::{Backoff, Jitter, RetryError, Sleeper, TokioSleeper};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_layer::Layer;
use tower_service::Service;

/// Errors produced when assembling an executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuildError {
    #[error("max_attempts must be > 0 (got {0})")]
    InvalidMaxAttempts(usize),
}

struct Inner<P> {
    policy: P,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    listeners: Listeners,
}

/// Executes operations with retry semantics. Cheap to clone; holds no per-invocation state.
pub struct RetryExecutor<P> {
    inner: Arc<Inner<P>>,
}

impl<P> Clone for RetryExecutor<P> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<P> fmt::Debug for RetryExecutor<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor")
            .field("policy", &"<policy>")
            .field("backoff", &self.inner.backoff)
            .field("jitter", &self.inner.jitter)
            .field("sleeper", &self.inner.sleeper)
            .field("listeners", &self.inner.listeners.len())
            .finish()
    }
}

impl RetryExecutor<MaxAttempts> {
    /// Construct a new builder with defaults (three attempts, no backoff, no jitter).
    pub fn builder() -> RetryExecutorBuilder<MaxAttempts> {
        RetryExecutorBuilder::new()
    }
}

impl<P> RetryExecutor<P> {
    pub fn policy(&self) -> &P {
        &self.inner.policy
    }

    pub fn backoff(&self) -> &Backoff {
        &self.inner.backoff
    }

    /// Execute an async operation with retry semantics.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, RetryError<E>>
    where
        P: RetryPolicy<T, E>,
        T: fmt::Debug + Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        self.execute_with(operation, CallOptions::new()).await
    }

    /// Execute with per-call options: a breaker/statistics key, a recovery callback, shared
    /// attributes and a cancellation token.
    pub async fn execute_with<T, E, Fut, Op>(
        &self,
        mut operation: Op,
        options: CallOptions<T, E>,
    ) -> Result<T, RetryError<E>>
    where
        P: RetryPolicy<T, E>,
        T: fmt::Debug + Send,
        E: std::error::Error + Send + Sync + 'static,
        Fut: Future<Output = Result<T, E>>,
        Op: FnMut() -> Fut,
    {
        let inner = &*self.inner;
        let CallOptions { state, attributes, cancel, recovery } = options;
        let cancel = cancel.unwrap_or_default();
        let state_key = state.clone();
        let key = state_key.as_ref().map(RetryState::key);
        let mut ctx = RetryContext::new(inner.clock.clone(), state, attributes);

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled::<T, E, P>(inner, &ctx, key));
            }

            if let Err(open) = inner.policy.admit(&mut ctx) {
                tracing::debug!(
                    key = %open.key,
                    failures = open.failure_count,
                    "retry refused: circuit open"
                );
                inner.listeners.close(key, Termination::CircuitOpen);
                return Err(open.into());
            }

            let attempt = ctx.begin_attempt();
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = operation() => Some(result),
            };
            let Some(result) = result else {
                return Err(cancelled::<T, E, P>(inner, &ctx, key));
            };

            match result {
                Ok(value) => {
                    let accepted = inner.policy.accepts(&value);
                    inner.listeners.attempt(
                        key,
                        &Attempt::new(
                            attempt,
                            ctx.elapsed(),
                            AttemptOutcome::Success { value: &value, accepted },
                        ),
                    );
                    if accepted {
                        inner.policy.on_success(&ctx);
                        inner.listeners.close(key, Termination::Completed);
                        return Ok(value);
                    }
                    ctx.record_rejection();
                }
                Err(error) => {
                    inner.listeners.attempt(
                        key,
                        &Attempt::new(attempt, ctx.elapsed(), AttemptOutcome::Failure(&error)),
                    );
                    ctx.record_failure(error);
                }
            }

            if !inner.policy.can_retry(&ctx) {
                inner.policy.on_exhausted(&ctx);
                let attempts = ctx.retry_count();
                return match recovery {
                    Some(recover) => match recover(ctx).await {
                        Ok(value) => {
                            tracing::debug!(key = key.unwrap_or("-"), attempts, "retry recovered");
                            inner.listeners.close(key, Termination::Recovered);
                            Ok(value)
                        }
                        Err(error) => {
                            tracing::warn!(
                                key = key.unwrap_or("-"),
                                attempts,
                                error = %error,
                                "retry recovery failed"
                            );
                            inner.listeners.close(key, Termination::RecoveryFailed);
                            Err(RetryError::Recovery(error))
                        }
                    },
                    None => {
                        tracing::warn!(key = key.unwrap_or("-"), attempts, "retry exhausted");
                        inner.listeners.close(key, Termination::Exhausted);
                        Err(RetryError::retry_exhausted(attempts, ctx.into_failures()))
                    }
                };
            }

            // Delay after the Nth attempt uses delay(N).
            let delay = inner.jitter.apply(inner.backoff.next_delay(&ctx));
            tracing::debug!(
                key = key.unwrap_or("-"),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "retrying after backoff"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(cancelled::<T, E, P>(inner, &ctx, key));
                }
                _ = inner.sleeper.sleep(delay) => {}
            }
        }
    }
}

fn cancelled<T, E, P>(inner: &Inner<P>, ctx: &RetryContext<E>, key: Option<&str>) -> RetryError<E>
where
    P: RetryPolicy<T, E>,
{
    let attempts = ctx.retry_count();
    tracing::debug!(key = key.unwrap_or("-"), attempts, "retry cancelled");
    inner.policy.on_cancelled(ctx);
    inner.listeners.close(key, Termination::Cancelled);
    RetryError::Cancelled { attempts }
}

type Recovery<T, E> = Box<dyn FnOnce(RetryContext<E>) -> BoxFuture<'static, Result<T, E>> + Send>;

/// Per-invocation options for [`RetryExecutor::execute_with`].
pub struct CallOptions<T, E> {
    state: Option<RetryState>,
    attributes: Attributes,
    cancel: Option<CancellationToken>,
    recovery: Option<Recovery<T, E>>,
}

impl<T, E> CallOptions<T, E> {
    pub fn new() -> Self {
        Self { state: None, attributes: Attributes::new(), cancel: None, recovery: None }
    }

    /// Key the invocation so breaker and statistics state is shared with other invocations.
    pub fn state(mut self, state: RetryState) -> Self {
        self.state = Some(state);
        self
    }

    /// Attribute map exposed to policies through the context.
    pub fn attributes(mut self, attributes: Attributes) -> Self {
        self.attributes = attributes;
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Produce the final result from the exhausted context instead of failing.
    pub fn recover<F, Fut>(mut self, recover: F) -> Self
    where
        F: FnOnce(RetryContext<E>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        self.recovery = Some(Box::new(move |ctx| recover(ctx).boxed()));
        self
    }
}

impl<T, E> Default for CallOptions<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for CallOptions<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallOptions")
            .field("state", &self.state)
            .field("attributes", &self.attributes)
            .field("cancellable", &self.cancel.is_some())
            .field("recovery", &self.recovery.is_some())
            .finish()
    }
}

/// Builder for `RetryExecutor`.
pub struct RetryExecutorBuilder<P> {
    policy: P,
    invalid: Option<BuildError>,
    backoff: Backoff,
    jitter: Jitter,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    listeners: Listeners,
}

impl RetryExecutorBuilder<MaxAttempts> {
    pub fn new() -> Self {
        Self {
            policy: MaxAttempts::default(),
            invalid: None,
            backoff: Backoff::none(),
            jitter: Jitter::None,
            sleeper: Arc::new(TokioSleeper),
            clock: Arc::new(MonotonicClock::default()),
            listeners: Listeners::new(),
        }
    }

    /// Total attempts including the first call. Validated in `build`.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        match MaxAttempts::new(attempts) {
            Ok(policy) => {
                self.policy = policy;
                self.invalid = None;
            }
            Err(e) => self.invalid = Some(e),
        }
        self
    }
}

impl Default for RetryExecutorBuilder<MaxAttempts> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> RetryExecutorBuilder<P> {
    /// Replace the retry policy.
    pub fn policy<Q>(self, policy: Q) -> RetryExecutorBuilder<Q> {
        RetryExecutorBuilder {
            policy,
            invalid: None,
            backoff: self.backoff,
            jitter: self.jitter,
            sleeper: self.sleeper,
            clock: self.clock,
            listeners: self.listeners,
        }
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = jitter;
        self
    }

    /// Provide a custom sleeper implementation.
    pub fn with_sleeper<S>(mut self, sleeper: S) -> Self
    where
        S: Sleeper + 'static,
    {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Clock used for elapsed-time bookkeeping in the retry context.
    pub fn with_clock<C>(mut self, clock: C) -> Self
    where
        C: Clock + 'static,
    {
        self.clock = Arc::new(clock);
        self
    }

    /// Append a listener; listeners fire in registration order.
    pub fn listener<L>(mut self, listener: L) -> Self
    where
        L: RetryListener + 'static,
    {
        self.listeners.register(listener);
        self
    }

    pub fn listeners(mut self, listeners: Listeners) -> Self {
        self.listeners = listeners;
        self
    }

    pub fn build(self) -> Result<RetryExecutor<P>, BuildError> {
        if let Some(e) = self.invalid {
            return Err(e);
        }
        Ok(RetryExecutor {
            inner: Arc::new(Inner {
                policy: self.policy,
                backoff: self.backoff,
                jitter: self.jitter,
                sleeper: self.sleeper,
                clock: self.clock,
                listeners: self.listeners,
            }),
        })
    }
}


/// Tower-native retry layer driven by a [`RetryExecutor`].
///
/// Requests must be `Clone`. Each attempt clones the inner service and waits for its
/// `poll_ready` before calling it.
pub struct RetryLayer<P> {
    executor: RetryExecutor<P>,
}

impl<P> RetryLayer<P> {
    pub fn new(executor: RetryExecutor<P>) -> Self {
        Self { executor }
    }
}

impl<P> Clone for RetryLayer<P> {
    fn clone(&self) -> Self {
        Self { executor: self.executor.clone() }
    }
}

impl<P> fmt::Debug for RetryLayer<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryLayer").field("executor", &self.executor).finish()
    }
}

/// Retry service produced by `RetryLayer`.
pub struct RetryService<S, P> {
    inner: S,
    executor: RetryExecutor<P>,
}

impl<S: Clone, P> Clone for RetryService<S, P> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone(), executor: self.executor.clone() }
    }
}

impl<S, P, Request> Service<Request> for RetryService<S, P>
where
    Request: Clone + Send + 'static,
    S: Service<Request> + Clone + Send + 'static,
    S::Response: fmt::Debug + Send + 'static,
    S::Error: std::error::Error + Send + Sync + 'static,
    S::Future: Send + 'static,
    P: RetryPolicy<S::Response, S::Error> + 'static,
{
    type Response = S::Response;
    type Error = RetryError<S::Error>;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Result<(), Self::Error>> {
        // readiness is awaited per attempt on a fresh clone
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let executor = self.executor.clone();
        let inner = self.inner.clone();
        Box::pin(async move {
            executor
                .execute(move || {
                    let mut svc = inner.clone();
                    let req = req.clone();
                    async move {
                        futures::future::poll_fn(|cx| svc.poll_ready(cx)).await?;
                        svc.call(req).await
                    }
                })
                .await
        })
    }
}

impl<S, P> Layer<S> for RetryLayer<P> {
    type Service = RetryService<S, P>;
    fn layer(&self, service: S) -> Self::Service {
        RetryService { inner: service, executor: self.executor.clone() }
    }
}
