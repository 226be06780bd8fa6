//! Stateful circuit breaker policy
//!
//! Wraps another policy and keeps per-key breaker state in a shared [`CircuitStateStore`].
//! Invocations without a [`RetryState`](crate::RetryState) key bypass the breaker entirely and
//! behave exactly like the delegate.
//!
//! State machine per key:
//! - CLOSED: invocations that exhaust their retries add one consecutive failure; reaching the
//!   threshold opens the circuit.
//! - OPEN: invocations are refused with [`CircuitOpen`] until `open_timeout` has elapsed.
//! - HALF_OPEN: entered lazily by the first invocation after `open_timeout`. That invocation is
//!   the single trial and gets exactly one attempt; success closes the circuit, failure reopens
//!   it. Other invocations are refused while the trial runs.
//!
//! Transitions are logged with `tracing`.

use crate::circuit_store::{Admission, CircuitState, CircuitStateStore, CircuitStatus};
use crate::clock::{Clock, MonotonicClock};
use crate::context::RetryContext;
use crate::error::RetryError;
use crate::policy::RetryPolicy;
use std::sync::Arc;
use std::time::Duration;

/// Details of a refused invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitOpen {
    pub key: String,
    pub failure_count: usize,
    /// How long the circuit has been open at the moment of refusal.
    pub open_duration: Duration,
}

impl<E> From<CircuitOpen> for RetryError<E> {
    fn from(open: CircuitOpen) -> Self {
        RetryError::CircuitOpen {
            key: open.key,
            failure_count: open.failure_count,
            open_duration: open.open_duration,
        }
    }
}

/// Errors produced when validating breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitBreakerError {
    #[error("failure_threshold must be > 0 (got {provided})")]
    InvalidFailureThreshold { provided: usize },
    #[error("open_timeout must be > 0 (got {0:?})")]
    InvalidOpenTimeout(Duration),
    #[error("reset_timeout must be > 0 (got {0:?})")]
    InvalidResetTimeout(Duration),
}

/// Validated configuration for the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: usize,
    open_timeout: Duration,
    reset_timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Create a config with validation.
    pub fn new(
        failure_threshold: usize,
        open_timeout: Duration,
        reset_timeout: Duration,
    ) -> Result<Self, CircuitBreakerError> {
        if failure_threshold == 0 {
            return Err(CircuitBreakerError::InvalidFailureThreshold {
                provided: failure_threshold,
            });
        }
        if open_timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidOpenTimeout(open_timeout));
        }
        if reset_timeout.is_zero() {
            return Err(CircuitBreakerError::InvalidResetTimeout(reset_timeout));
        }
        Ok(Self { failure_threshold, open_timeout, reset_timeout })
    }

    /// Consecutive exhausted invocations before opening from Closed.
    pub fn failure_threshold(&self) -> usize {
        self.failure_threshold
    }

    /// Duration to stay Open before a half-open trial.
    pub fn open_timeout(&self) -> Duration {
        self.open_timeout
    }

    /// Idle duration after which a key's state is discarded.
    pub fn reset_timeout(&self) -> Duration {
        self.reset_timeout
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(5),
            reset_timeout: Duration::from_secs(20),
        }
    }
}

/// Circuit breaker wrapped around a delegate retry policy.
#[derive(Debug, Clone)]
pub struct CircuitBreakerPolicy<P> {
    delegate: P,
    config: CircuitBreakerConfig,
    store: Arc<CircuitStateStore>,
    clock: Arc<dyn Clock>,
}

impl<P> CircuitBreakerPolicy<P> {
    pub fn new(delegate: P, config: CircuitBreakerConfig) -> Self {
        Self {
            delegate,
            config,
            store: Arc::new(CircuitStateStore::new()),
            clock: Arc::new(MonotonicClock::default()),
        }
    }

    /// Use a custom clock (tests drive OPEN/HALF_OPEN timing with [`ManualClock`](crate::ManualClock)).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Share breaker state with other policies.
    pub fn with_store(mut self, store: Arc<CircuitStateStore>) -> Self {
        self.store = store;
        self
    }

    pub fn store(&self) -> &Arc<CircuitStateStore> {
        &self.store
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn delegate(&self) -> &P {
        &self.delegate
    }

    /// Current breaker state for `key`.
    pub fn state(&self, key: &str) -> Option<CircuitState> {
        self.store.state(key)
    }
}

impl<T, E, P> RetryPolicy<T, E> for CircuitBreakerPolicy<P>
where
    P: RetryPolicy<T, E>,
{
    fn can_retry(&self, ctx: &RetryContext<E>) -> bool {
        if ctx.key().is_some() && ctx.is_half_open_trial() {
            return false;
        }
        self.delegate.can_retry(ctx)
    }

    fn accepts(&self, value: &T) -> bool {
        self.delegate.accepts(value)
    }

    fn admit(&self, ctx: &mut RetryContext<E>) -> Result<(), CircuitOpen> {
        let Some(state) = ctx.state().cloned() else {
            return self.delegate.admit(ctx);
        };
        let key = state.key();
        let now = self.clock.now_millis();
        self.store.sweep(now, self.config.reset_timeout);
        if ctx.retry_count() == 0 && state.force_refresh() {
            self.store.refresh(key);
        }
        if !ctx.is_half_open_trial() {
            let open_timeout = self.config.open_timeout;
            match self.store.admit(key, now, open_timeout) {
                (Admission::Closed, _) | (Admission::Trial, None) => {}
                (Admission::Trial, Some(guard)) => {
                    ctx.hold_trial(guard);
                    tracing::info!(key, "Circuit breaker → half-open");
                }
                (Admission::Rejected { failures, open_for }, _) => {
                    tracing::debug!(key, failures, ?open_for, "Circuit breaker: rejecting call");
                    return Err(CircuitOpen {
                        key: key.to_string(),
                        failure_count: failures,
                        open_duration: open_for,
                    });
                }
            }
        }
        self.delegate.admit(ctx)
    }

    fn on_success(&self, ctx: &RetryContext<E>) {
        self.delegate.on_success(ctx);
        let Some(key) = ctx.key() else { return };
        let trial = ctx.is_half_open_trial();
        let now = self.clock.now_millis();
        self.store.with_entry(key, now, |c| match c.status {
            CircuitStatus::HalfOpen if trial => {
                c.close();
                tracing::info!(key, "Circuit breaker → closed");
            }
            CircuitStatus::Closed => c.consecutive_failures = 0,
            _ => {}
        });
    }

    fn on_exhausted(&self, ctx: &RetryContext<E>) {
        self.delegate.on_exhausted(ctx);
        let Some(key) = ctx.key() else { return };
        let trial = ctx.is_half_open_trial();
        let threshold = self.config.failure_threshold;
        let now = self.clock.now_millis();
        self.store.with_entry(key, now, |c| {
            c.consecutive_failures = c.consecutive_failures.saturating_add(1);
            let failures = c.consecutive_failures;
            match c.status {
                CircuitStatus::HalfOpen if trial => {
                    c.open(now);
                    tracing::warn!(key, failures, "Circuit breaker: trial failed → open");
                }
                CircuitStatus::Closed if failures >= threshold => {
                    c.open(now);
                    tracing::error!(key, failures, threshold, "Circuit breaker → open");
                }
                _ => {}
            }
        });
    }

    fn on_cancelled(&self, ctx: &RetryContext<E>) {
        self.delegate.on_cancelled(ctx);
        let Some(key) = ctx.key() else { return };
        if !ctx.is_half_open_trial() {
            return;
        }
        let now = self.clock.now_millis();
        self.store.with_entry(key, now, |c| {
            if c.status == CircuitStatus::HalfOpen {
                c.trial_in_flight = false;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::context::{Attributes, RetryState};
    use crate::policy::{AlwaysRetry, MaxAttempts};

    type Policy = CircuitBreakerPolicy<MaxAttempts>;

    fn policy(clock: &ManualClock, threshold: usize) -> Policy {
        let config = CircuitBreakerConfig::new(
            threshold,
            Duration::from_millis(500),
            Duration::from_secs(60),
        )
        .expect("config");
        CircuitBreakerPolicy::new(MaxAttempts::new(1).expect("max"), config)
            .with_clock(clock.clone())
    }

    fn ctx(clock: &ManualClock, key: Option<&str>) -> RetryContext<String> {
        RetryContext::new(Arc::new(clock.clone()), key.map(RetryState::new), Attributes::new())
    }

    fn fail_invocation(policy: &Policy, clock: &ManualClock, key: &str) -> Result<(), CircuitOpen> {
        let mut ctx = ctx(clock, Some(key));
        RetryPolicy::<(), _>::admit(policy, &mut ctx)?;
        ctx.begin_attempt();
        ctx.record_failure("boom".into());
        assert!(!RetryPolicy::<(), _>::can_retry(policy, &ctx));
        RetryPolicy::<(), _>::on_exhausted(policy, &ctx);
        Ok(())
    }

    #[test]
    fn config_validation() {
        assert_eq!(
            CircuitBreakerConfig::new(0, Duration::from_secs(1), Duration::from_secs(1)),
            Err(CircuitBreakerError::InvalidFailureThreshold { provided: 0 })
        );
        assert!(matches!(
            CircuitBreakerConfig::new(1, Duration::ZERO, Duration::from_secs(1)),
            Err(CircuitBreakerError::InvalidOpenTimeout(_))
        ));
        assert!(matches!(
            CircuitBreakerConfig::new(1, Duration::from_secs(1), Duration::ZERO),
            Err(CircuitBreakerError::InvalidResetTimeout(_))
        ));
        let defaults = CircuitBreakerConfig::default();
        assert_eq!(defaults.failure_threshold(), 5);
        assert_eq!(defaults.open_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn opens_after_threshold_and_rejects_until_timeout() {
        let clock = ManualClock::new();
        let breaker = policy(&clock, 4);
        for _ in 0..4 {
            fail_invocation(&breaker, &clock, "svc").expect("closed circuit admits");
        }
        assert_eq!(breaker.state("svc").map(|s| s.status), Some(CircuitStatus::Open));

        clock.advance(Duration::from_millis(200));
        let refused = fail_invocation(&breaker, &clock, "svc").unwrap_err();
        assert_eq!(refused.key, "svc");
        assert_eq!(refused.failure_count, 4);
        assert_eq!(refused.open_duration, Duration::from_millis(200));
    }

    #[test]
    fn success_resets_consecutive_failures() {
        let clock = ManualClock::new();
        let breaker = policy(&clock, 2);
        fail_invocation(&breaker, &clock, "svc").unwrap();

        let mut ok = ctx(&clock, Some("svc"));
        RetryPolicy::<(), _>::admit(&breaker, &mut ok).unwrap();
        RetryPolicy::<(), _>::on_success(&breaker, &ok);
        assert_eq!(breaker.state("svc").map(|s| s.consecutive_failures), Some(0));

        fail_invocation(&breaker, &clock, "svc").unwrap();
        assert_eq!(breaker.state("svc").map(|s| s.status), Some(CircuitStatus::Closed));
    }

    #[test]
    fn half_open_admits_single_trial_and_closes_on_success() {
        let clock = ManualClock::new();
        let breaker = policy(&clock, 1);
        fail_invocation(&breaker, &clock, "svc").unwrap();
        clock.advance(Duration::from_millis(500));

        let mut trial = ctx(&clock, Some("svc"));
        RetryPolicy::<(), _>::admit(&breaker, &mut trial).unwrap();
        assert!(trial.is_half_open_trial());
        assert_eq!(breaker.state("svc").map(|s| s.status), Some(CircuitStatus::HalfOpen));

        let mut other = ctx(&clock, Some("svc"));
        assert!(RetryPolicy::<(), _>::admit(&breaker, &mut other).is_err());

        trial.begin_attempt();
        RetryPolicy::<(), _>::on_success(&breaker, &trial);
        let state = breaker.state("svc").unwrap();
        assert_eq!(state.status, CircuitStatus::Closed);
        assert_eq!(state.consecutive_failures, 0);
        assert_eq!(state.opened_at_millis, None);
    }

    #[test]
    fn failed_trial_reopens_with_fresh_timestamp() {
        let clock = ManualClock::new();
        let breaker = policy(&clock, 1);
        fail_invocation(&breaker, &clock, "svc").unwrap();
        clock.advance(Duration::from_millis(600));

        fail_invocation(&breaker, &clock, "svc").unwrap();
        let state = breaker.state("svc").unwrap();
        assert_eq!(state.status, CircuitStatus::Open);
        assert_eq!(state.opened_at_millis, Some(600));
    }

    #[test]
    fn trial_gets_exactly_one_attempt() {
        let clock = ManualClock::new();
        let config =
            CircuitBreakerConfig::new(1, Duration::from_millis(10), Duration::from_secs(60))
                .unwrap();
        let breaker = CircuitBreakerPolicy::new(AlwaysRetry, config).with_clock(clock.clone());
        let mut first = ctx(&clock, Some("svc"));
        RetryPolicy::<(), _>::admit(&breaker, &mut first).unwrap();
        first.begin_attempt();
        first.record_failure("x".into());
        assert!(RetryPolicy::<(), _>::can_retry(&breaker, &first));
        RetryPolicy::<(), _>::on_exhausted(&breaker, &first);

        clock.advance(Duration::from_millis(10));
        let mut trial = ctx(&clock, Some("svc"));
        RetryPolicy::<(), _>::admit(&breaker, &mut trial).unwrap();
        trial.begin_attempt();
        trial.record_failure("x".into());
        assert!(!RetryPolicy::<(), _>::can_retry(&breaker, &trial));
    }

    #[test]
    fn cancelled_trial_releases_slot() {
        let clock = ManualClock::new();
        let breaker = policy(&clock, 1);
        fail_invocation(&breaker, &clock, "svc").unwrap();
        clock.advance(Duration::from_secs(1));

        let mut trial = ctx(&clock, Some("svc"));
        RetryPolicy::<(), _>::admit(&breaker, &mut trial).unwrap();
        RetryPolicy::<(), _>::on_cancelled(&breaker, &trial);
        assert_eq!(breaker.state("svc").map(|s| s.status), Some(CircuitStatus::HalfOpen));

        let mut next = ctx(&clock, Some("svc"));
        RetryPolicy::<(), _>::admit(&breaker, &mut next).unwrap();
        assert!(next.is_half_open_trial());
    }

    #[test]
    fn abandoned_trial_releases_slot_on_drop() {
        let clock = ManualClock::new();
        let breaker = policy(&clock, 1);
        fail_invocation(&breaker, &clock, "svc").unwrap();
        clock.advance(Duration::from_secs(1));

        let mut trial = ctx(&clock, Some("svc"));
        RetryPolicy::<(), _>::admit(&breaker, &mut trial).unwrap();
        trial.begin_attempt();
        let mut blocked = ctx(&clock, Some("svc"));
        assert!(RetryPolicy::<(), _>::admit(&breaker, &mut blocked).is_err());

        drop(trial);
        assert_eq!(breaker.state("svc").map(|s| s.status), Some(CircuitStatus::HalfOpen));
        let mut next = ctx(&clock, Some("svc"));
        RetryPolicy::<(), _>::admit(&breaker, &mut next).unwrap();
        assert!(next.is_half_open_trial());
    }

    #[test]
    fn settled_trial_drop_keeps_circuit_open() {
        let clock = ManualClock::new();
        let breaker = policy(&clock, 1);
        fail_invocation(&breaker, &clock, "svc").unwrap();
        clock.advance(Duration::from_secs(1));

        let mut trial = ctx(&clock, Some("svc"));
        RetryPolicy::<(), _>::admit(&breaker, &mut trial).unwrap();
        trial.begin_attempt();
        trial.record_failure("still down".into());
        RetryPolicy::<(), _>::on_exhausted(&breaker, &trial);
        drop(trial);

        let mut next = ctx(&clock, Some("svc"));
        assert!(RetryPolicy::<(), _>::admit(&breaker, &mut next).is_err());
        assert_eq!(breaker.state("svc").map(|s| s.status), Some(CircuitStatus::Open));
    }

    #[test]
    fn keyless_invocations_bypass_breaker() {
        let clock = ManualClock::new();
        let breaker = policy(&clock, 1);
        for _ in 0..3 {
            let mut c = ctx(&clock, None);
            RetryPolicy::<(), _>::admit(&breaker, &mut c).unwrap();
            c.begin_attempt();
            c.record_failure("x".into());
            RetryPolicy::<(), _>::on_exhausted(&breaker, &c);
        }
        assert!(breaker.store().is_empty());
    }

    #[test]
    fn force_refresh_discards_open_state() {
        let clock = ManualClock::new();
        let breaker = policy(&clock, 1);
        fail_invocation(&breaker, &clock, "svc").unwrap();

        let mut refreshed = RetryContext::<String>::new(
            Arc::new(clock.clone()),
            Some(RetryState::new("svc").with_force_refresh(true)),
            Attributes::new(),
        );
        RetryPolicy::<(), _>::admit(&breaker, &mut refreshed).expect("refresh closes circuit");
        assert_eq!(breaker.state("svc").map(|s| s.status), Some(CircuitStatus::Closed));
    }

    #[test]
    fn shared_store_links_policies() {
        let clock = ManualClock::new();
        let store = Arc::new(CircuitStateStore::new());
        let a = policy(&clock, 1).with_store(store.clone());
        let b = policy(&clock, 1).with_store(store.clone());
        fail_invocation(&a, &clock, "svc").unwrap();
        assert!(fail_invocation(&b, &clock, "svc").is_err());
        store.reset("svc").unwrap();
        assert!(fail_invocation(&b, &clock, "svc").is_ok());
    }

    #[test]
    fn circuit_open_converts_into_retry_error() {
        let open = CircuitOpen {
            key: "svc".into(),
            failure_count: 3,
            open_duration: Duration::from_millis(5),
        };
        let err: RetryError<String> = open.into();
        assert_eq!(err.circuit_open_info(), Some(("svc", 3, Duration::from_millis(5))));
    }
}
