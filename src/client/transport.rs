//! Client capability traits
//!
//! The rotation manager never performs requests itself. It only needs to be
//! able to close a client and, for expiry, to know how many operations the
//! client has handled. These traits are that boundary.

use super::counting::OperationCounter;
use async_trait::async_trait;
use std::sync::Arc;

// ============================================================================
// Capabilities
// ============================================================================

/// A transport-capable client that can be shut down
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Close the client. `force` asks the client to skip graceful shutdown.
    async fn close(&self, force: bool) -> anyhow::Result<()>;
}

/// Operation counts reported by a client
pub trait OperationCounts: Send + Sync {
    /// Operations currently in flight
    fn ongoing_count(&self) -> u64;

    /// Operations that have settled (success or failure)
    fn completed_count(&self) -> u64;

    /// Total operations attributed to the client
    fn request_count(&self) -> u64 {
        self.ongoing_count() + self.completed_count()
    }
}

/// A client that reports its own operation counts
pub trait CountableClient: Transport + OperationCounts {}

impl<T: Transport + OperationCounts> CountableClient for T {}

// ============================================================================
// Creation Result
// ============================================================================

/// What a creation capability hands back to the manager
///
/// Clients that already count their operations are used as they are; plain
/// clients get an [`OperationCounter`] attached that the manager feeds for
/// every operation it runs against them.
pub enum Created<C> {
    /// Client with its own counts
    Countable {
        client: Arc<C>,
        counts: Arc<dyn OperationCounts>,
    },
    /// Client without counts
    ///
    /// The attached counter only sees operations run through
    /// `RotationManager::with_client`. Work done on a lease taken with
    /// `RotationManager::acquire` does not count toward the request limit.
    Plain(C),
}

impl<C: Transport> Created<C> {
    /// Hand over a client that reports its own counts
    pub fn countable(client: C) -> Self
    where
        C: CountableClient,
    {
        let client = Arc::new(client);
        let counts: Arc<dyn OperationCounts> = client.clone();
        Created::Countable { client, counts }
    }

    /// Hand over a client the manager has to count for
    ///
    /// Only `with_client` operations are counted; see [`Created::Plain`].
    pub fn plain(client: C) -> Self {
        Created::Plain(client)
    }

    pub(crate) fn into_parts(self) -> (Arc<C>, CountSource) {
        match self {
            Created::Countable { client, counts } => (client, CountSource::Reported(counts)),
            Created::Plain(client) => (
                Arc::new(client),
                CountSource::Tracked(OperationCounter::new()),
            ),
        }
    }
}

/// Where a managed instance gets its request count from
pub(crate) enum CountSource {
    /// Read from the client
    Reported(Arc<dyn OperationCounts>),
    /// Maintained by the manager around each operation
    Tracked(OperationCounter),
}

impl CountSource {
    pub(crate) fn request_count(&self) -> u64 {
        match self {
            CountSource::Reported(counts) => counts.request_count(),
            CountSource::Tracked(counter) => counter.request_count(),
        }
    }

    pub(crate) fn tracker(&self) -> Option<&OperationCounter> {
        match self {
            CountSource::Reported(_) => None,
            CountSource::Tracked(counter) => Some(counter),
        }
    }
}
