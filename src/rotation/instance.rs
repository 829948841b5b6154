//! Managed client instances and leases

use crate::client::{CountSource, Created, Transport};
use crate::config::RotationConfig;
use serde::Serialize;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

// ============================================================================
// Lifecycle Reasons
// ============================================================================

/// Why an instance left the active slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetireReason {
    /// Served more requests than the configured limit
    ExpiredRequests,
    /// Lived longer than the configured limit
    ExpiredAge,
    /// An operation failed with invalidation requested
    Invalidated,
    /// `expire_current` was called
    Explicit,
    /// The manager is shutting down
    Shutdown,
}

impl RetireReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ExpiredRequests => "expired_requests",
            Self::ExpiredAge => "expired_age",
            Self::Invalidated => "invalidated",
            Self::Explicit => "explicit",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for RetireReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Managed Instance
// ============================================================================

/// One client plus the bookkeeping the manager rotates it by
pub struct ManagedInstance<C> {
    id: u64,
    client: Arc<C>,
    counts: CountSource,
    created_at: Instant,
    use_count: AtomicUsize,
    force_close: AtomicBool,
    /// Latched by the first close attempt
    close_started: AtomicBool,
    /// Flipped once that attempt has settled
    close_settled: watch::Sender<bool>,
}

impl<C: Transport> ManagedInstance<C> {
    pub(crate) fn new(id: u64, created: Created<C>) -> Self {
        let (client, counts) = created.into_parts();
        Self {
            id,
            client,
            counts,
            created_at: Instant::now(),
            use_count: AtomicUsize::new(0),
            force_close: AtomicBool::new(false),
            close_started: AtomicBool::new(false),
            close_settled: watch::channel(false).0,
        }
    }
}

impl<C> ManagedInstance<C> {
    /// Sequence number assigned at creation, unique per manager
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Leases currently held on this instance
    pub fn use_count(&self) -> usize {
        self.use_count.load(Ordering::SeqCst)
    }

    /// Ongoing plus completed operations
    pub fn request_count(&self) -> u64 {
        self.counts.request_count()
    }

    pub fn force_close(&self) -> bool {
        self.force_close.load(Ordering::SeqCst)
    }

    pub(crate) fn set_force_close(&self, force: bool) {
        self.force_close.store(force, Ordering::SeqCst);
    }

    pub(crate) fn counts(&self) -> &CountSource {
        &self.counts
    }

    /// Check the rotation limits, request count first
    pub(crate) fn expiry(&self, config: &RotationConfig) -> Option<RetireReason> {
        if self.request_count() > config.request_limit {
            Some(RetireReason::ExpiredRequests)
        } else if self.age() > config.time_limit {
            Some(RetireReason::ExpiredAge)
        } else {
            None
        }
    }

    /// Claim the single close of this instance. Returns false if already claimed.
    pub(crate) fn begin_close(&self) -> bool {
        !self.close_started.swap(true, Ordering::SeqCst)
    }

    /// Record that the claimed close finished, failed, or was abandoned
    pub(crate) fn finish_close(&self) {
        self.close_settled.send_replace(true);
    }

    /// Whether a close attempt has settled
    pub fn is_closed(&self) -> bool {
        *self.close_settled.borrow()
    }

    /// Wait until whichever path claimed the close has settled it
    pub async fn closed(&self) {
        let mut settled = self.close_settled.subscribe();
        // The sender lives as long as `self`, so this cannot fail
        let _ = settled.wait_for(|done| *done).await;
    }

    pub(crate) fn lease(self: &Arc<Self>) -> ClientLease<C> {
        self.use_count.fetch_add(1, Ordering::SeqCst);
        ClientLease {
            instance: Arc::clone(self),
        }
    }

    pub fn stats(&self) -> InstanceStats {
        InstanceStats {
            id: self.id,
            age: self.age(),
            use_count: self.use_count(),
            request_count: self.request_count(),
            force_close: self.force_close(),
        }
    }
}

impl<C> fmt::Debug for ManagedInstance<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagedInstance")
            .field("id", &self.id)
            .field("use_count", &self.use_count())
            .field("request_count", &self.request_count())
            .field("force_close", &self.force_close())
            .finish()
    }
}

/// Point-in-time view of a managed instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstanceStats {
    pub id: u64,
    pub age: Duration,
    pub use_count: usize,
    pub request_count: u64,
    pub force_close: bool,
}

// ============================================================================
// Lease
// ============================================================================

/// A use of a managed instance, released on drop
///
/// Dropping the lease decrements the instance's use count, so release also
/// happens when the future holding it is cancelled.
pub struct ClientLease<C> {
    instance: Arc<ManagedInstance<C>>,
}

impl<C> ClientLease<C> {
    pub fn instance_id(&self) -> u64 {
        self.instance.id
    }

    /// Shared handle to the client, usable past the lease
    pub fn client(&self) -> Arc<C> {
        Arc::clone(&self.instance.client)
    }

    pub fn instance(&self) -> &Arc<ManagedInstance<C>> {
        &self.instance
    }

    /// Release explicitly instead of at end of scope
    pub fn release(self) {}
}

impl<C> Deref for ClientLease<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.instance.client
    }
}

impl<C> Drop for ClientLease<C> {
    fn drop(&mut self) {
        self.instance.use_count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<C> fmt::Debug for ClientLease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientLease")
            .field("instance_id", &self.instance.id)
            .finish()
    }
}
