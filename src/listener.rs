//! Attempt listeners
//!
//! Listeners observe every attempt and the end of every invocation. They run synchronously on
//! the executor's task, in registration order, and can neither alter nor veto the outcome. A
//! listener that panics is caught and logged; the remaining listeners still fire.

use crate::context::{Attempt, AttemptOutcome};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// How an invocation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Termination {
    /// An attempt returned an acceptable value.
    Completed,
    /// The policy stopped and no recovery callback was configured.
    Exhausted,
    /// The recovery callback produced the value.
    Recovered,
    /// The recovery callback failed.
    RecoveryFailed,
    /// The circuit refused the invocation.
    CircuitOpen,
    /// The caller cancelled the invocation.
    Cancelled,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Termination::Completed => "completed",
            Termination::Exhausted => "exhausted",
            Termination::Recovered => "recovered",
            Termination::RecoveryFailed => "recovery_failed",
            Termination::CircuitOpen => "circuit_open",
            Termination::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Observer of attempts. `key` is the invocation's [`RetryState`](crate::RetryState) key.
pub trait RetryListener: Send + Sync + fmt::Debug {
    fn on_attempt(&self, key: Option<&str>, attempt: &Attempt<'_>);

    fn on_close(&self, _key: Option<&str>, _termination: Termination) {}
}

impl<L: RetryListener + ?Sized> RetryListener for Arc<L> {
    fn on_attempt(&self, key: Option<&str>, attempt: &Attempt<'_>) {
        (**self).on_attempt(key, attempt)
    }

    fn on_close(&self, key: Option<&str>, termination: Termination) {
        (**self).on_close(key, termination)
    }
}

/// Ordered listener registry attached to an executor at build time.
#[derive(Debug, Clone, Default)]
pub struct Listeners {
    listeners: Vec<Arc<dyn RetryListener>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<L: RetryListener + 'static>(&mut self, listener: L) -> &mut Self {
        self.listeners.push(Arc::new(listener));
        self
    }

    pub fn with<L: RetryListener + 'static>(mut self, listener: L) -> Self {
        self.register(listener);
        self
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    pub(crate) fn attempt(&self, key: Option<&str>, attempt: &Attempt<'_>) {
        for listener in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_attempt(key, attempt))).is_err() {
                tracing::warn!(?listener, attempt = attempt.number(), "retry listener panicked");
            }
        }
    }

    pub(crate) fn close(&self, key: Option<&str>, termination: Termination) {
        for listener in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_close(key, termination))).is_err() {
                tracing::warn!(?listener, %termination, "retry listener panicked");
            }
        }
    }
}

/// Logs attempts and terminations with `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogListener;

impl RetryListener for LogListener {
    fn on_attempt(&self, key: Option<&str>, attempt: &Attempt<'_>) {
        let elapsed_ms = attempt.elapsed_since_first_attempt().as_millis() as u64;
        match attempt.outcome() {
            AttemptOutcome::Success { accepted, .. } => tracing::debug!(
                key = key.unwrap_or("-"),
                attempt = attempt.number(),
                elapsed_ms,
                accepted,
                "retry_attempt_success"
            ),
            AttemptOutcome::Failure(error) => tracing::debug!(
                key = key.unwrap_or("-"),
                attempt = attempt.number(),
                elapsed_ms,
                error = %error,
                "retry_attempt_failure"
            ),
        }
    }

    fn on_close(&self, key: Option<&str>, termination: Termination) {
        tracing::info!(key = key.unwrap_or("-"), %termination, "retry_closed");
    }
}

/// Owned copy of one listener notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerRecord {
    Attempt {
        key: Option<String>,
        number: usize,
        elapsed: Duration,
        /// `Debug` rendering of the value, `None` for failures.
        result: Option<String>,
        /// `Display` rendering of the error, `None` for successes.
        error: Option<String>,
        accepted: bool,
    },
    Closed {
        key: Option<String>,
        termination: Termination,
    },
}

/// Keeps the most recent notifications in memory.
#[derive(Clone, Debug)]
pub struct MemoryListener {
    records: Arc<Mutex<VecDeque<ListenerRecord>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemoryListener {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            records: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn records(&self) -> Vec<ListenerRecord> {
        self.lock().iter().cloned().collect()
    }

    /// Terminations in the order they were observed.
    pub fn terminations(&self) -> Vec<Termination> {
        self.lock()
            .iter()
            .filter_map(|r| match r {
                ListenerRecord::Closed { termination, .. } => Some(*termination),
                ListenerRecord::Attempt { .. } => None,
            })
            .collect()
    }

    pub fn attempt_count(&self) -> usize {
        self.lock().iter().filter(|r| matches!(r, ListenerRecord::Attempt { .. })).count()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    fn push(&self, record: ListenerRecord) {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.pop_front();
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push_back(record);
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<ListenerRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemoryListener {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryListener for MemoryListener {
    fn on_attempt(&self, key: Option<&str>, attempt: &Attempt<'_>) {
        let (result, error, accepted) = match attempt.outcome() {
            AttemptOutcome::Success { value, accepted } => {
                (Some(format!("{:?}", value)), None, accepted)
            }
            AttemptOutcome::Failure(error) => (None, Some(error.to_string()), false),
        };
        self.push(ListenerRecord::Attempt {
            key: key.map(str::to_string),
            number: attempt.number(),
            elapsed: attempt.elapsed_since_first_attempt(),
            result,
            error,
            accepted,
        });
    }

    fn on_close(&self, key: Option<&str>, termination: Termination) {
        self.push(ListenerRecord::Closed { key: key.map(str::to_string), termination });
    }
}
