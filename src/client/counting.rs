//! Operation counting for clients that do not count themselves

use super::transport::OperationCounts;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};

/// Ongoing/completed operation counters
#[derive(Debug, Default)]
pub struct OperationCounter {
    ongoing: AtomicU64,
    completed: AtomicU64,
}

impl OperationCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark an operation as started
    ///
    /// The operation counts as completed once the guard is dropped, whether
    /// it succeeded, failed, or was cancelled.
    pub fn start(&self) -> OperationGuard<'_> {
        self.ongoing.fetch_add(1, Ordering::SeqCst);
        OperationGuard { counter: self }
    }

    /// Run a future as one counted operation
    pub async fn track<F: Future>(&self, future: F) -> F::Output {
        let _guard = self.start();
        future.await
    }
}

impl OperationCounts for OperationCounter {
    fn ongoing_count(&self) -> u64 {
        self.ongoing.load(Ordering::SeqCst)
    }

    fn completed_count(&self) -> u64 {
        self.completed.load(Ordering::SeqCst)
    }
}

/// Guard for an in-flight operation
#[derive(Debug)]
pub struct OperationGuard<'a> {
    counter: &'a OperationCounter,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        // Bump completed first so request_count never dips mid-transition
        self.counter.completed.fetch_add(1, Ordering::SeqCst);
        self.counter.ongoing.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_guard_moves_ongoing_to_completed() {
        let counter = OperationCounter::new();

        let first = counter.start();
        let second = counter.start();
        assert_eq!(counter.ongoing_count(), 2);
        assert_eq!(counter.completed_count(), 0);
        assert_eq!(counter.request_count(), 2);

        drop(first);
        assert_eq!(counter.ongoing_count(), 1);
        assert_eq!(counter.completed_count(), 1);

        drop(second);
        assert_eq!(counter.ongoing_count(), 0);
        assert_eq!(counter.completed_count(), 2);
        assert_eq!(counter.request_count(), 2);
    }

    #[tokio::test]
    async fn test_track_counts_failures() {
        let counter = OperationCounter::new();

        let ok: Result<u32, String> = counter.track(async { Ok(1) }).await;
        let err: Result<u32, String> = counter.track(async { Err("nope".to_string()) }).await;

        assert!(ok.is_ok());
        assert!(err.is_err());
        assert_eq!(counter.completed_count(), 2);
        assert_eq!(counter.ongoing_count(), 0);
    }

    #[tokio::test]
    async fn test_track_counts_cancellation() {
        let counter = OperationCounter::new();

        let timed_out = tokio::time::timeout(
            Duration::from_millis(10),
            counter.track(std::future::pending::<()>()),
        )
        .await;

        assert!(timed_out.is_err());
        assert_eq!(counter.ongoing_count(), 0);
        assert_eq!(counter.completed_count(), 1);
    }
}
