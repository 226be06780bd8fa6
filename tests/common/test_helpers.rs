use std::future::{ready, Ready};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError(pub String);

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for TestError {}

/// Operation that fails its first `failures` calls and then returns the call number.
#[derive(Debug, Clone)]
pub struct Flaky {
    calls: Arc<AtomicUsize>,
    failures: usize,
}

impl Flaky {
    pub fn failing(failures: usize) -> Self {
        Self { calls: Arc::new(AtomicUsize::new(0)), failures }
    }

    pub fn always_failing() -> Self {
        Self::failing(usize::MAX)
    }

    pub fn healthy() -> Self {
        Self::failing(0)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn call(&self) -> Ready<Result<usize, TestError>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failures {
            ready(Err(TestError(format!("call {n} failed"))))
        } else {
            ready(Ok(n))
        }
    }
}
