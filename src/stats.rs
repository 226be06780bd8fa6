//! Per-key retry statistics
//!
//! [`StatisticsRepository`] aggregates invocation outcomes by [`RetryState`](crate::RetryState)
//! key; [`StatisticsListener`] feeds it from an executor. Counters only ever increase until the
//! key is reset. Invocations without a key are not counted.

use crate::context::Attempt;
use crate::listener::{RetryListener, Termination};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

#[derive(Debug, Default)]
struct Counters {
    started: AtomicU64,
    complete: AtomicU64,
    error: AtomicU64,
    recovery: AtomicU64,
    abort: AtomicU64,
    cancel: AtomicU64,
}

impl Counters {
    fn snapshot(&self, name: &str) -> RetryStatistics {
        RetryStatistics {
            name: name.to_string(),
            started_count: self.started.load(Ordering::Relaxed),
            complete_count: self.complete.load(Ordering::Relaxed),
            error_count: self.error.load(Ordering::Relaxed),
            recovery_count: self.recovery.load(Ordering::Relaxed),
            abort_count: self.abort.load(Ordering::Relaxed),
            cancel_count: self.cancel.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time counters for one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryStatistics {
    pub name: String,
    pub started_count: u64,
    pub complete_count: u64,
    pub error_count: u64,
    pub recovery_count: u64,
    pub abort_count: u64,
    pub cancel_count: u64,
}

impl fmt::Display for RetryStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: started={} complete={} error={} recovery={} abort={} cancel={}",
            self.name,
            self.started_count,
            self.complete_count,
            self.error_count,
            self.recovery_count,
            self.abort_count,
            self.cancel_count
        )
    }
}

/// Thread-safe statistics keyed by logical operation.
#[derive(Debug, Default)]
pub struct StatisticsRepository {
    entries: RwLock<HashMap<String, Arc<Counters>>>,
}

impl StatisticsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn counters(&self, name: &str) -> Arc<Counters> {
        if let Some(existing) =
            self.entries.read().unwrap_or_else(PoisonError::into_inner).get(name)
        {
            return existing.clone();
        }
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub fn add_started(&self, name: &str) {
        self.counters(name).started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_complete(&self, name: &str) {
        self.counters(name).complete.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_error(&self, name: &str) {
        self.counters(name).error.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_recovery(&self, name: &str) {
        self.counters(name).recovery.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_abort(&self, name: &str) {
        self.counters(name).abort.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_cancel(&self, name: &str) {
        self.counters(name).cancel.fetch_add(1, Ordering::Relaxed);
    }

    pub fn find_one(&self, name: &str) -> Option<RetryStatistics> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(name).map(|c| c.snapshot(name))
    }

    /// Every key's statistics sorted by name.
    pub fn find_all(&self) -> Vec<RetryStatistics> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<RetryStatistics> =
            entries.iter().map(|(name, c)| c.snapshot(name)).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Forget a key's counters; returns whether the key existed.
    pub fn reset(&self, name: &str) -> bool {
        self.entries.write().unwrap_or_else(PoisonError::into_inner).remove(name).is_some()
    }
}

/// Listener that feeds a [`StatisticsRepository`].
#[derive(Debug, Clone)]
pub struct StatisticsListener {
    repository: Arc<StatisticsRepository>,
}

impl StatisticsListener {
    pub fn new(repository: Arc<StatisticsRepository>) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &Arc<StatisticsRepository> {
        &self.repository
    }
}

impl RetryListener for StatisticsListener {
    fn on_attempt(&self, key: Option<&str>, attempt: &Attempt<'_>) {
        if let Some(key) = key {
            if attempt.number() == 1 {
                self.repository.add_started(key);
            }
        }
    }

    fn on_close(&self, key: Option<&str>, termination: Termination) {
        let Some(key) = key else { return };
        match termination {
            Termination::Completed => self.repository.add_complete(key),
            Termination::Exhausted | Termination::RecoveryFailed => self.repository.add_error(key),
            Termination::Recovered => self.repository.add_recovery(key),
            Termination::CircuitOpen => self.repository.add_abort(key),
            Termination::Cancelled => self.repository.add_cancel(key),
        }
    }
}
