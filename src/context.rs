//! Per-invocation retry state, the optional logical-operation key, and attempt records handed
//! to listeners.

use crate::circuit_store::TrialGuard;
use crate::clock::Clock;
use crate::error::MAX_RETRY_FAILURES;
use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Identifies a logical operation so breaker and statistics state can be shared across
/// otherwise independent invocations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RetryState {
    key: Arc<str>,
    force_refresh: bool,
}

impl RetryState {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: Arc::from(key.into()), force_refresh: false }
    }

    /// Discard any stored breaker state for the key when the invocation starts.
    pub fn with_force_refresh(mut self, force_refresh: bool) -> Self {
        self.force_refresh = force_refresh;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn force_refresh(&self) -> bool {
        self.force_refresh
    }
}

type AttributeMap = HashMap<String, Arc<dyn Any + Send + Sync>>;

/// Open key/value store shared by an operation and the policies judging it.
///
/// Cloning yields another handle to the same map, so a caller can move one clone into the
/// operation closure and hand the other to the executor through
/// [`CallOptions::attributes`](crate::CallOptions::attributes).
#[derive(Clone, Default)]
pub struct Attributes {
    inner: Arc<Mutex<AttributeMap>>,
}

impl Attributes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a value.
    pub fn set<V>(&self, key: impl Into<String>, value: V)
    where
        V: Any + Send + Sync,
    {
        self.lock().insert(key.into(), Arc::new(value));
    }

    /// Typed read; `None` when the key is missing or holds a different type.
    pub fn get<V>(&self, key: &str) -> Option<V>
    where
        V: Any + Send + Sync + Clone,
    {
        self.lock().get(key).and_then(|v| v.downcast_ref::<V>()).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    pub fn remove(&self, key: &str) -> bool {
        self.lock().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, AttributeMap> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Attributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let map = self.lock();
        let mut keys: Vec<&String> = map.keys().collect();
        keys.sort();
        f.debug_struct("Attributes").field("keys", &keys).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LastAttempt {
    Failed,
    Rejected,
}

/// Mutable state owned by exactly one executor invocation.
pub struct RetryContext<E> {
    retry_count: usize,
    started_at_millis: u64,
    clock: Arc<dyn Clock>,
    failures: VecDeque<E>,
    last: Option<LastAttempt>,
    state: Option<RetryState>,
    attributes: Attributes,
    trial: Option<TrialGuard>,
}

impl<E> RetryContext<E> {
    pub(crate) fn new(
        clock: Arc<dyn Clock>,
        state: Option<RetryState>,
        attributes: Attributes,
    ) -> Self {
        let started_at_millis = clock.now_millis();
        Self {
            retry_count: 0,
            started_at_millis,
            clock,
            failures: VecDeque::new(),
            last: None,
            state,
            attributes,
            trial: None,
        }
    }

    /// Attempts made so far (the current attempt included once it has started).
    pub fn retry_count(&self) -> usize {
        self.retry_count
    }

    pub fn started_at_millis(&self) -> u64 {
        self.started_at_millis
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    /// Time since the context was created, i.e. since just before the first attempt.
    pub fn elapsed(&self) -> Duration {
        Duration::from_millis(self.now_millis().saturating_sub(self.started_at_millis))
    }

    /// Error of the most recent attempt, if that attempt failed.
    pub fn last_failure(&self) -> Option<&E> {
        match self.last {
            Some(LastAttempt::Failed) => self.failures.back(),
            _ => None,
        }
    }

    /// True when the most recent attempt returned a value a result predicate rejected.
    pub fn last_result_rejected(&self) -> bool {
        self.last == Some(LastAttempt::Rejected)
    }

    /// Most recent failures, oldest first, capped at [`MAX_RETRY_FAILURES`].
    pub fn failures(&self) -> impl ExactSizeIterator<Item = &E> + '_ {
        self.failures.iter()
    }

    pub fn into_failures(self) -> Vec<E> {
        self.failures.into()
    }

    /// Take the most recent failure regardless of what the last attempt did.
    pub fn into_last_failure(mut self) -> Option<E> {
        self.failures.pop_back()
    }

    pub fn state(&self) -> Option<&RetryState> {
        self.state.as_ref()
    }

    pub fn key(&self) -> Option<&str> {
        self.state.as_ref().map(RetryState::key)
    }

    pub fn attributes(&self) -> &Attributes {
        &self.attributes
    }

    /// True when this invocation holds the single half-open trial of its circuit.
    pub fn is_half_open_trial(&self) -> bool {
        self.trial.is_some()
    }

    pub(crate) fn begin_attempt(&mut self) -> usize {
        self.retry_count += 1;
        self.retry_count
    }

    pub(crate) fn record_failure(&mut self, error: E) {
        self.failures.push_back(error);
        while self.failures.len() > MAX_RETRY_FAILURES {
            self.failures.pop_front();
        }
        self.last = Some(LastAttempt::Failed);
    }

    pub(crate) fn record_rejection(&mut self) {
        self.last = Some(LastAttempt::Rejected);
    }

    pub(crate) fn hold_trial(&mut self, guard: TrialGuard) {
        self.trial = Some(guard);
    }
}

impl<E: fmt::Debug> fmt::Debug for RetryContext<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryContext")
            .field("retry_count", &self.retry_count)
            .field("started_at_millis", &self.started_at_millis)
            .field("last_failure", &self.last_failure())
            .field("last_result_rejected", &self.last_result_rejected())
            .field("state", &self.state)
            .field("attributes", &self.attributes)
            .finish()
    }
}

/// One invocation of the wrapped operation and its outcome, as seen by listeners.
#[derive(Debug, Clone, Copy)]
pub struct Attempt<'a> {
    number: usize,
    elapsed: Duration,
    outcome: AttemptOutcome<'a>,
}

/// Result of a single attempt.
#[derive(Debug, Clone, Copy)]
pub enum AttemptOutcome<'a> {
    /// The operation returned a value. `accepted` is false when a result predicate asked for
    /// another attempt.
    Success { value: &'a dyn fmt::Debug, accepted: bool },
    /// The operation failed.
    Failure(&'a (dyn std::error::Error + 'static)),
}

impl<'a> Attempt<'a> {
    pub(crate) fn new(number: usize, elapsed: Duration, outcome: AttemptOutcome<'a>) -> Self {
        Self { number, elapsed, outcome }
    }

    /// 1-based attempt number.
    pub fn number(&self) -> usize {
        self.number
    }

    pub fn elapsed_since_first_attempt(&self) -> Duration {
        self.elapsed
    }

    pub fn outcome(&self) -> AttemptOutcome<'a> {
        self.outcome
    }

    pub fn has_result(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Success { .. })
    }

    pub fn has_error(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Failure(_))
    }

    pub fn result(&self) -> Option<&'a dyn fmt::Debug> {
        match self.outcome {
            AttemptOutcome::Success { value, .. } => Some(value),
            AttemptOutcome::Failure(_) => None,
        }
    }

    pub fn error(&self) -> Option<&'a (dyn std::error::Error + 'static)> {
        match self.outcome {
            AttemptOutcome::Failure(err) => Some(err),
            AttemptOutcome::Success { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn context(clock: &ManualClock) -> RetryContext<String> {
        RetryContext::new(Arc::new(clock.clone()), Some(RetryState::new("svc")), Attributes::new())
    }

    #[test]
    fn failures_are_capped_and_ordered() {
        let clock = ManualClock::new();
        let mut ctx = context(&clock);
        for n in 0..(MAX_RETRY_FAILURES + 5) {
            ctx.begin_attempt();
            ctx.record_failure(format!("failure {n}"));
        }
        assert_eq!(ctx.failures().len(), MAX_RETRY_FAILURES);
        assert_eq!(ctx.failures().next().map(String::as_str), Some("failure 5"));
        assert_eq!(ctx.last_failure().map(String::as_str), Some("failure 14"));
        assert_eq!(ctx.retry_count(), MAX_RETRY_FAILURES + 5);
    }

    #[test]
    fn rejection_hides_last_failure() {
        let clock = ManualClock::new();
        let mut ctx = context(&clock);
        ctx.record_failure("boom".to_string());
        ctx.record_rejection();
        assert!(ctx.last_failure().is_none());
        assert!(ctx.last_result_rejected());
        assert_eq!(ctx.into_last_failure().as_deref(), Some("boom"));
    }

    #[test]
    fn elapsed_follows_clock() {
        let clock = ManualClock::starting_at(1_000);
        let ctx = context(&clock);
        clock.advance(Duration::from_millis(750));
        assert_eq!(ctx.elapsed(), Duration::from_millis(750));
        assert_eq!(ctx.started_at_millis(), 1_000);
        assert_eq!(ctx.key(), Some("svc"));
    }

    #[test]
    fn attributes_are_shared_between_handles() {
        let attrs = Attributes::new();
        let other = attrs.clone();
        attrs.set("value", 4_i32);
        assert_eq!(other.get::<i32>("value"), Some(4));
        assert_eq!(other.get::<String>("value"), None);
        assert!(other.remove("value"));
        assert!(attrs.is_empty());
    }

    #[test]
    fn attempt_accessors() {
        let value = 42_u32;
        let attempt = Attempt::new(
            2,
            Duration::from_millis(10),
            AttemptOutcome::Success { value: &value, accepted: false },
        );
        assert!(attempt.has_result());
        assert!(!attempt.has_error());
        assert_eq!(format!("{:?}", attempt.result().unwrap()), "42");

        let err = std::io::Error::new(std::io::ErrorKind::Other, "nope");
        let failed = Attempt::new(3, Duration::ZERO, AttemptOutcome::Failure(&err));
        assert_eq!(failed.error().map(|e| e.to_string()), Some("nope".to_string()));
        assert_eq!(failed.number(), 3);
    }
}
