//! Background cleanup of retired instances
//!
//! One sweeper task per manager, started on first use and stopped by the
//! manager's shutdown token. Each tick closes the retiring instances that are
//! no longer leased; a close that hangs is abandoned after the configured
//! timeout so the next tick is never starved.

use super::instance::ManagedInstance;
use super::manager::Inner;
use crate::client::Transport;
use futures::future::join_all;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// How a single close attempt settled
#[derive(Debug)]
pub(super) enum CloseOutcome {
    Closed,
    Failed(anyhow::Error),
    TimedOut(Duration),
    /// Another path already claimed this instance's close
    Skipped,
}

/// Summary of one sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Closes that completed successfully
    pub closed: usize,
    /// Closes that returned an error
    pub failed: usize,
    /// Closes abandoned at the timeout
    pub timed_out: usize,
    /// Instances left for a later sweep because they are still leased
    pub deferred: usize,
}

impl SweepReport {
    /// Instances removed from the retiring set by this sweep
    pub fn removed(&self) -> usize {
        self.closed + self.failed + self.timed_out
    }
}

pub(super) fn spawn_sweeper<C: Transport>(
    inner: Weak<Inner<C>>,
    shutdown: CancellationToken,
    period: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            // The manager is gone once the last handle drops
            let Some(manager) = inner.upgrade() else {
                break;
            };
            manager.sweep().await;
        }

        tracing::debug!("Cleanup sweeper stopped");
    })
}

impl<C: Transport> Inner<C> {
    /// Close every retiring instance that is not leased
    pub(super) async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();

        let snapshot: Vec<Arc<ManagedInstance<C>>> = {
            let state = self.state.lock().await;
            // Shutdown drains the retiring set itself
            if state.closing {
                return report;
            }
            state.retiring.values().cloned().collect()
        };
        if snapshot.is_empty() {
            return report;
        }

        let (ready, leased): (Vec<_>, Vec<_>) = snapshot
            .into_iter()
            .partition(|instance| instance.use_count() == 0);
        report.deferred = leased.len();

        let timeout = self.config.cleanup_close_timeout;
        let outcomes = join_all(
            ready
                .iter()
                .map(|instance| self.close_instance(instance, Some(timeout))),
        )
        .await;

        let mut state = self.state.lock().await;
        for (instance, outcome) in ready.iter().zip(outcomes) {
            match outcome {
                CloseOutcome::Closed => report.closed += 1,
                CloseOutcome::Failed(_) => report.failed += 1,
                CloseOutcome::TimedOut(_) => report.timed_out += 1,
                // The shutdown drain owns it
                CloseOutcome::Skipped => continue,
            }
            state.retiring.remove(&instance.id());
        }
        let remaining = state.retiring.len();
        drop(state);

        tracing::debug!(
            closed = report.closed,
            failed = report.failed,
            timed_out = report.timed_out,
            deferred = report.deferred,
            remaining,
            "Cleanup sweep finished"
        );

        report
    }

    /// Close one instance, at most once over its lifetime
    ///
    /// Errors and timeouts are logged and reported, never propagated. A
    /// caller that gets [`CloseOutcome::Skipped`] can wait on
    /// [`ManagedInstance::closed`] for the other attempt to settle.
    pub(super) async fn close_instance(
        &self,
        instance: &Arc<ManagedInstance<C>>,
        timeout: Option<Duration>,
    ) -> CloseOutcome {
        if !instance.begin_close() {
            return CloseOutcome::Skipped;
        }

        let force = instance.force_close();
        let close = (self.closer)(Arc::clone(instance.client()), force);

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, close).await {
                Ok(Ok(())) => CloseOutcome::Closed,
                Ok(Err(err)) => CloseOutcome::Failed(err),
                Err(_) => CloseOutcome::TimedOut(limit),
            },
            None => match close.await {
                Ok(()) => CloseOutcome::Closed,
                Err(err) => CloseOutcome::Failed(err),
            },
        };
        self.closed_total.fetch_add(1, Ordering::SeqCst);
        instance.finish_close();

        match &outcome {
            CloseOutcome::Closed => {
                tracing::debug!(instance_id = instance.id(), force, "Closed client instance");
            }
            CloseOutcome::Failed(err) => {
                tracing::warn!(
                    instance_id = instance.id(),
                    force,
                    error = %err,
                    "Failed to close client instance"
                );
            }
            CloseOutcome::TimedOut(limit) => {
                tracing::warn!(
                    instance_id = instance.id(),
                    force,
                    timeout_ms = limit.as_millis() as u64,
                    "Timed out closing client instance"
                );
            }
            CloseOutcome::Skipped => {}
        }

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::super::manager::RotationManager;
    use super::*;
    use crate::client::Created;
    use crate::config::RotationConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize};

    #[derive(Default)]
    struct CloseLog {
        calls: AtomicUsize,
        settled: AtomicUsize,
        hang: AtomicBool,
        fail: AtomicBool,
        delay_secs: AtomicU64,
    }

    struct Conn {
        log: Arc<CloseLog>,
    }

    #[async_trait]
    impl Transport for Conn {
        async fn close(&self, _force: bool) -> anyhow::Result<()> {
            self.log.calls.fetch_add(1, Ordering::SeqCst);
            if self.log.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            let delay = self.log.delay_secs.load(Ordering::SeqCst);
            if delay > 0 {
                tokio::time::sleep(Duration::from_secs(delay)).await;
            }
            self.log.settled.fetch_add(1, Ordering::SeqCst);
            if self.log.fail.load(Ordering::SeqCst) {
                anyhow::bail!("connection already reset");
            }
            Ok(())
        }
    }

    fn manager(log: &Arc<CloseLog>) -> RotationManager<Conn> {
        let log = Arc::clone(log);
        let config = RotationConfig::new()
            .with_cleanup_interval(Duration::from_secs(10))
            .with_cleanup_close_timeout(Duration::from_secs(5));
        RotationManager::new(
            move || {
                let log = Arc::clone(&log);
                async move { Ok::<_, anyhow::Error>(Created::plain(Conn { log })) }
            },
            config,
        )
        .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_closes_retired_instances_on_tick() {
        let log = Arc::new(CloseLog::default());
        let manager = manager(&log);

        drop(manager.acquire().await.unwrap());
        manager.expire_current(false).await;
        assert_eq!(manager.retiring_count().await, 1);

        tokio::time::sleep(Duration::from_secs(9)).await;
        assert_eq!(log.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(log.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.retiring_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_drops_instance_whose_close_hangs() {
        let log = Arc::new(CloseLog::default());
        log.hang.store(true, Ordering::SeqCst);
        let manager = manager(&log);

        drop(manager.acquire().await.unwrap());
        manager.expire_current(false).await;

        // First tick at 10s, close abandoned at 15s
        tokio::time::sleep(Duration::from_secs(16)).await;

        assert_eq!(log.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.retiring_count().await, 0);
        assert!(manager.acquire().await.is_ok());
    }

    #[tokio::test]
    async fn test_sweep_now_reports_failures_without_retry() {
        let log = Arc::new(CloseLog::default());
        log.fail.store(true, Ordering::SeqCst);
        let manager = manager(&log);

        drop(manager.acquire().await.unwrap());
        manager.expire_current(true).await;

        let report = manager.sweep_now().await;
        assert_eq!(report.failed, 1);
        assert_eq!(report.removed(), 1);
        assert_eq!(manager.retiring_count().await, 0);

        let report = manager.sweep_now().await;
        assert_eq!(report, SweepReport::default());
        assert_eq!(log.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_sweep_defers_leased_instances() {
        let log = Arc::new(CloseLog::default());
        let manager = manager(&log);

        let lease = manager.acquire().await.unwrap();
        manager.expire_current(false).await;

        let report = manager.sweep_now().await;
        assert_eq!(report.deferred, 1);
        assert_eq!(report.removed(), 0);
        assert_eq!(manager.retiring_count().await, 1);

        // A retired instance is never handed out again
        let fresh = manager.acquire().await.unwrap();
        assert_ne!(fresh.instance_id(), lease.instance_id());

        drop(lease);
        let report = manager.sweep_now().await;
        assert_eq!(report.closed, 1);
        assert_eq!(manager.retiring_count().await, 0);
    }

    #[tokio::test]
    async fn test_close_after_sweep_does_not_close_twice() {
        let log = Arc::new(CloseLog::default());
        let manager = manager(&log);

        drop(manager.acquire().await.unwrap());
        manager.expire_current(false).await;
        manager.sweep_now().await;
        assert_eq!(log.calls.load(Ordering::SeqCst), 1);

        manager.close(false).await;
        assert_eq!(log.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_stops_after_close() {
        let log = Arc::new(CloseLog::default());
        let manager = manager(&log);

        drop(manager.acquire().await.unwrap());
        manager.close(false).await;
        assert_eq!(log.calls.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(log.calls.load(Ordering::SeqCst), 1);
        assert_eq!(manager.stats().await.closed_total, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_waits_for_close_started_by_sweep() {
        let log = Arc::new(CloseLog::default());
        log.delay_secs.store(3, Ordering::SeqCst);
        let manager = manager(&log);

        drop(manager.acquire().await.unwrap());
        manager.expire_current(false).await;

        // The tick at 10s starts a close that takes until 13s
        tokio::time::sleep(Duration::from_millis(10_500)).await;
        assert_eq!(log.calls.load(Ordering::SeqCst), 1);
        assert_eq!(log.settled.load(Ordering::SeqCst), 0);

        let started = Instant::now();
        manager.close(false).await;

        assert_eq!(log.calls.load(Ordering::SeqCst), 1);
        assert_eq!(log.settled.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() >= Duration::from_millis(2_500));
        assert_eq!(manager.retiring_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_close_waits_for_first_close() {
        let log = Arc::new(CloseLog::default());
        log.delay_secs.store(3, Ordering::SeqCst);
        let manager = manager(&log);
        drop(manager.acquire().await.unwrap());

        let first = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.close(false).await })
        };
        while log.calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        manager.close(true).await;
        assert_eq!(log.calls.load(Ordering::SeqCst), 1);
        assert_eq!(log.settled.load(Ordering::SeqCst), 1);

        first.await.unwrap();
    }
}
