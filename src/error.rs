//! Error types surfaced by the retry executor
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Cap the number of stored failures inside RetryExhausted to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Terminal outcome of an invocation that did not produce a value.
#[derive(Debug, Clone)]
pub enum RetryError<E> {
    /// The retry policy stopped and no recovery callback was configured. `failures` holds the
    /// most recent underlying errors (oldest first); it is empty when every attempt returned a
    /// value that a result predicate rejected.
    RetryExhausted { attempts: usize, failures: Arc<Vec<E>> },
    /// The circuit for `key` is open; the operation was not invoked.
    CircuitOpen { key: String, failure_count: usize, open_duration: Duration },
    /// The caller cancelled the invocation at a suspension point.
    Cancelled { attempts: usize },
    /// The recovery callback itself failed; this supersedes the original failures.
    Recovery(E),
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RetryExhausted { attempts, failures } => {
                let recorded = failures.len();
                let truncated_note = if recorded > 0 && recorded < *attempts {
                    format!(" (recorded last {} failures)", recorded)
                } else {
                    String::new()
                };
                match failures.last() {
                    Some(last) => write!(
                        f,
                        "retry exhausted after {} attempts{}; last error: {}",
                        attempts, truncated_note, last
                    ),
                    None => write!(
                        f,
                        "retry exhausted after {} attempts; no recorded failures",
                        attempts
                    ),
                }
            }
            Self::CircuitOpen { key, failure_count, open_duration } => write!(
                f,
                "circuit '{}' open ({} failures, open for {:?})",
                key, failure_count, open_duration
            ),
            Self::Cancelled { attempts } => {
                write!(f, "retry cancelled after {} attempts", attempts)
            }
            Self::Recovery(e) => write!(f, "recovery failed: {}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for RetryError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            Self::Recovery(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> RetryError<E> {
    /// Construct a `RetryExhausted` variant while enforcing the `MAX_RETRY_FAILURES` cap by
    /// keeping the most recent failures.
    pub fn retry_exhausted(attempts: usize, failures: Vec<E>) -> Self {
        let trimmed = if failures.len() > MAX_RETRY_FAILURES {
            let skip = failures.len() - MAX_RETRY_FAILURES;
            failures.into_iter().skip(skip).collect()
        } else {
            failures
        };
        RetryError::RetryExhausted { attempts, failures: Arc::new(trimmed) }
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    pub fn is_recovery(&self) -> bool {
        matches!(self, Self::Recovery(_))
    }

    /// Number of operation invocations made before the error surfaced.
    pub fn attempts(&self) -> usize {
        match self {
            Self::RetryExhausted { attempts, .. } | Self::Cancelled { attempts } => *attempts,
            Self::CircuitOpen { .. } | Self::Recovery(_) => 0,
        }
    }

    /// Most recent underlying failure for `RetryExhausted`, or the recovery error.
    pub fn last_failure(&self) -> Option<&E> {
        match self {
            Self::RetryExhausted { failures, .. } => failures.last(),
            Self::Recovery(e) => Some(e),
            _ => None,
        }
    }

    /// Access all recorded failures for RetryExhausted, if present.
    pub fn failures(&self) -> Option<&[E]> {
        match self {
            Self::RetryExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }

    /// Access circuit-open details as (key, failure_count, open_duration).
    pub fn circuit_open_info(&self) -> Option<(&str, usize, Duration)> {
        match self {
            Self::CircuitOpen { key, failure_count, open_duration } => {
                Some((key.as_str(), *failure_count, *open_duration))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct DummyError(&'static str);

    impl fmt::Display for DummyError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    impl std::error::Error for DummyError {}

    #[test]
    fn retry_exhausted_display_includes_last_error() {
        let err = RetryError::retry_exhausted(3, vec![DummyError("first"), DummyError("last")]);
        let msg = err.to_string();
        assert!(msg.contains("3 attempts"));
        assert!(msg.contains("recorded last 2 failures"));
        assert!(msg.ends_with("last error: last"));
    }

    #[test]
    fn retry_exhausted_display_handles_empty_failures() {
        let err: RetryError<DummyError> = RetryError::retry_exhausted(5, vec![]);
        assert_eq!(err.to_string(), "retry exhausted after 5 attempts; no recorded failures");
        assert!(err.source().is_none());
    }

    #[test]
    fn retry_exhausted_keeps_most_recent_failures() {
        let failures: Vec<DummyError> = (0..15).map(|_| DummyError("x")).collect();
        let mut failures = failures;
        failures[14] = DummyError("newest");
        let err = RetryError::retry_exhausted(15, failures);
        assert_eq!(err.failures().map(<[_]>::len), Some(MAX_RETRY_FAILURES));
        assert_eq!(err.last_failure(), Some(&DummyError("newest")));
        assert_eq!(err.source().map(|s| s.to_string()), Some("newest".to_string()));
    }

    #[test]
    fn circuit_open_display_and_accessors() {
        let err: RetryError<DummyError> = RetryError::CircuitOpen {
            key: "svc".into(),
            failure_count: 4,
            open_duration: Duration::from_millis(50),
        };
        assert!(err.is_circuit_open());
        assert!(err.to_string().contains("circuit 'svc' open"));
        assert_eq!(err.circuit_open_info(), Some(("svc", 4, Duration::from_millis(50))));
        assert_eq!(err.attempts(), 0);
        assert!(err.source().is_none());
    }

    #[test]
    fn recovery_error_is_its_own_source() {
        let err = RetryError::Recovery(DummyError("fallback broke"));
        assert!(err.is_recovery());
        assert_eq!(err.to_string(), "recovery failed: fallback broke");
        assert_eq!(err.source().map(|s| s.to_string()), Some("fallback broke".to_string()));
    }

    #[test]
    fn predicates_cover_all_variants() {
        let cancelled: RetryError<DummyError> = RetryError::Cancelled { attempts: 2 };
        assert!(cancelled.is_cancelled());
        assert!(!cancelled.is_retry_exhausted());
        assert_eq!(cancelled.attempts(), 2);
        assert!(cancelled.failures().is_none());

        let exhausted: RetryError<DummyError> = RetryError::retry_exhausted(1, vec![DummyError("a")]);
        assert!(exhausted.is_retry_exhausted());
        assert!(!exhausted.is_circuit_open());
        assert_eq!(exhausted.attempts(), 1);
    }
}
