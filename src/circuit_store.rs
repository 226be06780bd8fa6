//! Keyed store of circuit breaker state.
//!
//! One entry per logical operation key. The index is a read-mostly `RwLock`; each entry has its
//! own `Mutex`, so callers on different keys never wait on each other beyond the index read.
//! Entries idle for longer than the breaker's reset timeout are purged lazily.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use crate::clock::millis;
use tracing::debug;

/// Breaker status for one key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitStatus {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls until the open timeout elapses.
    Open,
    /// One trial invocation decides between Closed and Open.
    HalfOpen,
}

/// Read-only snapshot of one key's breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitState {
    pub status: CircuitStatus,
    pub consecutive_failures: usize,
    /// Set whenever `status` is `Open` (and kept through `HalfOpen`).
    pub opened_at_millis: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Closed,
    Trial,
    Rejected { failures: usize, open_for: Duration },
}

#[derive(Debug)]
pub(crate) struct KeyCircuit {
    pub(crate) status: CircuitStatus,
    pub(crate) consecutive_failures: usize,
    pub(crate) opened_at_millis: Option<u64>,
    pub(crate) trial_in_flight: bool,
    trial_generation: u64,
    last_activity_millis: u64,
}

impl KeyCircuit {
    fn new(now: u64) -> Self {
        Self {
            status: CircuitStatus::Closed,
            consecutive_failures: 0,
            opened_at_millis: None,
            trial_in_flight: false,
            trial_generation: 0,
            last_activity_millis: now,
        }
    }

    fn snapshot(&self) -> CircuitState {
        CircuitState {
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            opened_at_millis: self.opened_at_millis,
        }
    }

    /// Decide whether an attempt may proceed; OPEN turns into HALF_OPEN here, lazily.
    pub(crate) fn admit(&mut self, now: u64, open_timeout: Duration) -> Admission {
        match self.status {
            CircuitStatus::Closed => Admission::Closed,
            CircuitStatus::Open => {
                let opened_at = self.opened_at_millis.unwrap_or(now);
                let elapsed = now.saturating_sub(opened_at);
                if elapsed < millis(open_timeout) {
                    Admission::Rejected {
                        failures: self.consecutive_failures,
                        open_for: Duration::from_millis(elapsed),
                    }
                } else {
                    self.status = CircuitStatus::HalfOpen;
                    self.start_trial()
                }
            }
            CircuitStatus::HalfOpen if self.trial_in_flight => {
                let opened_at = self.opened_at_millis.unwrap_or(now);
                Admission::Rejected {
                    failures: self.consecutive_failures,
                    open_for: Duration::from_millis(now.saturating_sub(opened_at)),
                }
            }
            CircuitStatus::HalfOpen => self.start_trial(),
        }
    }

    fn start_trial(&mut self) -> Admission {
        self.trial_in_flight = true;
        self.trial_generation = self.trial_generation.wrapping_add(1);
        Admission::Trial
    }

    /// Free the trial slot, but only if `generation` still owns it.
    fn release_trial(&mut self, generation: u64) {
        if self.status == CircuitStatus::HalfOpen
            && self.trial_in_flight
            && self.trial_generation == generation
        {
            self.trial_in_flight = false;
        }
    }

    pub(crate) fn open(&mut self, now: u64) {
        self.status = CircuitStatus::Open;
        self.opened_at_millis = Some(now);
        self.trial_in_flight = false;
    }

    pub(crate) fn close(&mut self) {
        self.status = CircuitStatus::Closed;
        self.consecutive_failures = 0;
        self.opened_at_millis = None;
        self.trial_in_flight = false;
    }
}

/// Holds a half-open trial slot for one invocation.
///
/// Dropping the guard frees the slot unless the trial was already settled, so a trial whose
/// future is dropped or whose operation panics does not leave the key refusing calls forever.
#[derive(Debug)]
pub(crate) struct TrialGuard {
    entry: Arc<Mutex<KeyCircuit>>,
    generation: u64,
}

impl Drop for TrialGuard {
    fn drop(&mut self) {
        lock_entry(&self.entry).release_trial(self.generation);
    }
}

/// Errors from circuit stores.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CircuitStoreError {
    /// No state is stored for the key.
    #[error("circuit '{key}' not found")]
    NotFound { key: String },
}

/// In-memory, process-local breaker state keyed by logical operation.
#[derive(Debug, Default)]
pub struct CircuitStateStore {
    entries: RwLock<HashMap<String, Arc<Mutex<KeyCircuit>>>>,
    last_sweep_millis: AtomicU64,
}

impl CircuitStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on the key's state under its lock, creating a CLOSED entry on first use.
    pub(crate) fn with_entry<R>(&self, key: &str, now: u64, f: impl FnOnce(&mut KeyCircuit) -> R) -> R {
        let entry = self.entry(key, now);
        let mut circuit = lock_entry(&entry);
        circuit.last_activity_millis = now;
        f(&mut circuit)
    }

    /// Admission check for `key`. A granted trial comes with the guard that owns its slot.
    pub(crate) fn admit(
        &self,
        key: &str,
        now: u64,
        open_timeout: Duration,
    ) -> (Admission, Option<TrialGuard>) {
        let entry = self.entry(key, now);
        let mut circuit = lock_entry(&entry);
        circuit.last_activity_millis = now;
        let admission = circuit.admit(now, open_timeout);
        let guard = (admission == Admission::Trial)
            .then(|| TrialGuard { entry: entry.clone(), generation: circuit.trial_generation });
        drop(circuit);
        (admission, guard)
    }

    fn entry(&self, key: &str, now: u64) -> Arc<Mutex<KeyCircuit>> {
        let existing = self.read().get(key).cloned();
        match existing {
            Some(entry) => entry,
            None => self
                .write()
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(KeyCircuit::new(now))))
                .clone(),
        }
    }

    /// Purge entries idle for at least `idle`. Runs at most once per `idle` window.
    pub(crate) fn sweep(&self, now: u64, idle: Duration) {
        let idle = millis(idle);
        let last = self.last_sweep_millis.load(Ordering::Acquire);
        if now.saturating_sub(last) < idle {
            return;
        }
        if self
            .last_sweep_millis
            .compare_exchange(last, now, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return; // another caller is sweeping
        }
        let mut map = self.write();
        let before = map.len();
        map.retain(|_, entry| match entry.try_lock() {
            Ok(circuit) => now.saturating_sub(circuit.last_activity_millis) < idle,
            Err(_) => true,
        });
        let evicted = before - map.len();
        if evicted > 0 {
            debug!(target: "encore::circuit_store", evicted, remaining = map.len(), "purged idle circuit state");
        }
    }

    /// Drop the key's state so its next use starts CLOSED.
    pub(crate) fn refresh(&self, key: &str) {
        self.write().remove(key);
    }

    /// Current state of `key`, if any invocation has used it.
    pub fn state(&self, key: &str) -> Option<CircuitState> {
        let entry = self.read().get(key).cloned()?;
        let circuit = lock_entry(&entry);
        Some(circuit.snapshot())
    }

    /// Snapshot every key's state sorted by key.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        let map = self.read();
        let mut entries: Vec<(String, CircuitState)> =
            map.iter().map(|(k, v)| (k.clone(), lock_entry(v).snapshot())).collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Force the key back to CLOSED, clearing its failure count.
    pub fn reset(&self, key: &str) -> Result<(), CircuitStoreError> {
        let entry = self
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| CircuitStoreError::NotFound { key: key.to_string() })?;
        lock_entry(&entry).close();
        Ok(())
    }

    pub fn remove(&self, key: &str) -> bool {
        self.write().remove(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<Mutex<KeyCircuit>>>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<Mutex<KeyCircuit>>>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn lock_entry(entry: &Mutex<KeyCircuit>) -> MutexGuard<'_, KeyCircuit> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}
