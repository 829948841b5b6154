//! Rotation manager implementation
//!
//! Holds at most one active client instance, hands out leases on it, and
//! moves it to the retiring set when it expires, fails, or is retired
//! explicitly. Retired instances are closed by the background sweep or at
//! shutdown.

use super::instance::{ClientLease, InstanceStats, ManagedInstance, RetireReason};
use super::sweeper::{spawn_sweeper, SweepReport};
use crate::client::{Created, Transport};
use crate::config::RotationConfig;
use crate::error::{RotationError, RotationResult};
use anyhow::Context;
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture, FutureExt};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Capabilities
// ============================================================================

/// Creates new clients for the manager
#[async_trait]
pub trait ClientFactory<C>: Send + Sync + 'static {
    async fn create(&self) -> anyhow::Result<Created<C>>;
}

#[async_trait]
impl<C, F, Fut> ClientFactory<C> for F
where
    C: Transport,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Created<C>>> + Send,
{
    async fn create(&self) -> anyhow::Result<Created<C>> {
        (self)().await
    }
}

/// Closes a client; the flag asks for a forced (non-graceful) close
pub type CloseFn<C> = Arc<dyn Fn(Arc<C>, bool) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

fn default_closer<C: Transport>() -> CloseFn<C> {
    Arc::new(|client: Arc<C>, force: bool| {
        async move { client.close(force).await }.boxed()
    })
}

// ============================================================================
// Call Options
// ============================================================================

/// Per-call overrides of the manager's error policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Retire the instance if the operation fails (`None` = manager default)
    pub invalidate_on_error: Option<bool>,
    /// Force-close the invalidated instance (`None` = manager default)
    pub force_close_on_error: Option<bool>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invalidate_on_error(mut self, invalidate: bool) -> Self {
        self.invalidate_on_error = Some(invalidate);
        self
    }

    pub fn force_close_on_error(mut self, force: bool) -> Self {
        self.force_close_on_error = Some(force);
        self
    }
}

// ============================================================================
// Manager State
// ============================================================================

pub(super) struct State<C> {
    pub(super) active: Option<Arc<ManagedInstance<C>>>,
    pub(super) retiring: HashMap<u64, Arc<ManagedInstance<C>>>,
    pub(super) closing: bool,
    sweeper: Option<JoinHandle<()>>,
}

impl<C> State<C> {
    fn retire(&mut self, reason: RetireReason) -> Option<Arc<ManagedInstance<C>>> {
        let instance = self.active.take()?;
        tracing::info!(
            instance_id = instance.id(),
            reason = %reason,
            request_count = instance.request_count(),
            use_count = instance.use_count(),
            age_ms = instance.age().as_millis() as u64,
            force_close = instance.force_close(),
            "Retired client instance"
        );
        self.retiring.insert(instance.id(), Arc::clone(&instance));
        Some(instance)
    }
}

pub(super) struct Inner<C> {
    factory: Box<dyn ClientFactory<C>>,
    pub(super) closer: CloseFn<C>,
    pub(super) config: RotationConfig,
    pub(super) state: Mutex<State<C>>,
    /// Held for the duration of a creation; its holder is the single flight
    creation: Mutex<()>,
    next_id: AtomicU64,
    created_total: AtomicU64,
    pub(super) closed_total: AtomicU64,
    shutdown: CancellationToken,
}

impl<C> Drop for Inner<C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// Rotation Manager
// ============================================================================

/// A stable handle over a rotating client instance
///
/// Cloning the manager is cheap; all clones share the same active instance,
/// retiring set, and cleanup sweep.
pub struct RotationManager<C> {
    inner: Arc<Inner<C>>,
}

impl<C> Clone for RotationManager<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: Transport> RotationManager<C> {
    /// Create a manager that closes clients with [`Transport::close`]
    ///
    /// Fails if `config` does not pass [`RotationConfig::validate`].
    pub fn new(factory: impl ClientFactory<C>, config: RotationConfig) -> anyhow::Result<Self> {
        Self::build(Box::new(factory), default_closer(), config)
    }

    /// Create a manager with a custom close capability
    pub fn with_closer<F, Fut>(
        factory: impl ClientFactory<C>,
        config: RotationConfig,
        closer: F,
    ) -> anyhow::Result<Self>
    where
        F: Fn(Arc<C>, bool) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let close_fn: CloseFn<C> = Arc::new(move |client, force| closer(client, force).boxed());
        Self::build(Box::new(factory), close_fn, config)
    }

    fn build(
        factory: Box<dyn ClientFactory<C>>,
        closer: CloseFn<C>,
        config: RotationConfig,
    ) -> anyhow::Result<Self> {
        config
            .validate()
            .context("Invalid rotation configuration")?;

        Ok(Self {
            inner: Arc::new(Inner {
                factory,
                closer,
                config,
                state: Mutex::new(State {
                    active: None,
                    retiring: HashMap::new(),
                    closing: false,
                    sweeper: None,
                }),
                creation: Mutex::new(()),
                next_id: AtomicU64::new(1),
                created_total: AtomicU64::new(0),
                closed_total: AtomicU64::new(0),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn config(&self) -> &RotationConfig {
        &self.inner.config
    }

    // ========================================================================
    // Acquisition
    // ========================================================================

    /// Lease the active instance, creating one if there is none
    ///
    /// An expired active instance is retired first. Concurrent callers that
    /// find no active instance queue behind a single creation and share its
    /// result.
    pub async fn acquire(&self) -> RotationResult<ClientLease<C>> {
        {
            let mut state = self.inner.state.lock().await;
            if state.closing {
                return Err(RotationError::Closed);
            }
            self.ensure_sweeper(&mut state);
            if let Some(lease) = self.lease_active(&mut state) {
                return Ok(lease);
            }
        }

        let _creating = self.inner.creation.lock().await;

        // Whoever held the gate before us may have installed an instance
        {
            let mut state = self.inner.state.lock().await;
            if state.closing {
                return Err(RotationError::Closed);
            }
            if let Some(lease) = self.lease_active(&mut state) {
                return Ok(lease);
            }
        }

        let created = self.inner.factory.create().await.map_err(|err| {
            tracing::warn!(error = %err, "Failed to create client instance");
            RotationError::Create(err)
        })?;

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let instance = Arc::new(ManagedInstance::new(id, created));
        self.inner.created_total.fetch_add(1, Ordering::SeqCst);

        let mut state = self.inner.state.lock().await;
        if state.closing {
            drop(state);
            tracing::info!(
                instance_id = id,
                "Manager closed during creation, discarding new client instance"
            );
            self.inner.close_instance(&instance, None).await;
            return Err(RotationError::Closed);
        }

        tracing::debug!(instance_id = id, "Created client instance");
        let lease = instance.lease();
        state.active = Some(instance);
        Ok(lease)
    }

    /// Lease the current active instance unless it has expired
    fn lease_active(&self, state: &mut State<C>) -> Option<ClientLease<C>> {
        let active = state.active.as_ref()?;
        if let Some(reason) = active.expiry(&self.inner.config) {
            state.retire(reason);
            return None;
        }
        Some(active.lease())
    }

    fn ensure_sweeper(&self, state: &mut State<C>) {
        if state.sweeper.is_none() {
            tracing::debug!(
                interval_secs = self.inner.config.cleanup_interval.as_secs(),
                "Starting cleanup sweeper"
            );
            state.sweeper = Some(spawn_sweeper(
                Arc::downgrade(&self.inner),
                self.inner.shutdown.clone(),
                self.inner.config.cleanup_interval,
            ));
        }
    }

    // ========================================================================
    // Use
    // ========================================================================

    /// Run an operation against the active client using the manager's error policy
    pub async fn with_client<F, Fut, T, E>(&self, operation: F) -> Result<T, RotationError<E>>
    where
        F: FnOnce(Arc<C>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.with_client_opts(CallOptions::default(), operation).await
    }

    /// Run an operation against the active client
    ///
    /// The lease is released before this returns, on every path. A failed
    /// operation's error is returned unchanged; when invalidation applies the
    /// instance is retired first so the next caller gets a fresh one.
    pub async fn with_client_opts<F, Fut, T, E>(
        &self,
        options: CallOptions,
        operation: F,
    ) -> Result<T, RotationError<E>>
    where
        F: FnOnce(Arc<C>) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let lease = self.acquire().await.map_err(|err| err.widen())?;
        let instance = Arc::clone(lease.instance());

        let result = match instance.counts().tracker() {
            Some(tracker) => tracker.track(operation(lease.client())).await,
            None => operation(lease.client()).await,
        };
        drop(lease);

        match result {
            Ok(value) => Ok(value),
            Err(err) => {
                let config = &self.inner.config;
                let invalidate = options
                    .invalidate_on_error
                    .unwrap_or(config.invalidate_on_error);
                if invalidate {
                    let force = options
                        .force_close_on_error
                        .unwrap_or(config.force_close_on_error);
                    self.invalidate(&instance, force).await;
                }
                Err(RotationError::Operation(err))
            }
        }
    }

    /// Mark an instance after a failure and retire it if it is still active
    async fn invalidate(&self, instance: &Arc<ManagedInstance<C>>, force: bool) {
        instance.set_force_close(force);

        let mut state = self.inner.state.lock().await;
        let still_active = state
            .active
            .as_ref()
            .is_some_and(|active| active.id() == instance.id());
        if still_active {
            state.retire(RetireReason::Invalidated);
        }
    }

    // ========================================================================
    // Retirement and Shutdown
    // ========================================================================

    /// Retire the active instance, if any
    ///
    /// Returns whether an instance was retired; with nothing active this is a no-op.
    pub async fn expire_current(&self, force: bool) -> bool {
        let mut state = self.inner.state.lock().await;
        if let Some(active) = state.active.as_ref() {
            active.set_force_close(force);
        }
        state.retire(RetireReason::Explicit).is_some()
    }

    /// Run one cleanup pass now instead of waiting for the next tick
    pub async fn sweep_now(&self) -> SweepReport {
        self.inner.sweep().await
    }

    /// Shut the manager down and close every instance it still holds
    ///
    /// New acquisitions fail with [`RotationError::Closed`] from the moment
    /// this is called. In-flight operations are not waited for; they may fail
    /// once their client is closed. Close failures are logged, not returned.
    ///
    /// Returns once every close has settled, including closes a sweep or a
    /// concurrent `close` call started first. A sweep already under way is
    /// bounded by `cleanup_close_timeout`.
    pub async fn close(&self, force: bool) {
        let (former_active, draining, sweeper) = {
            let mut state = self.inner.state.lock().await;
            state.closing = true;

            if let Some(active) = state.active.as_ref() {
                active.set_force_close(force);
            }
            let former_active = state.retire(RetireReason::Shutdown);

            let former_id = former_active.as_ref().map(|instance| instance.id());
            let draining: Vec<_> = state
                .retiring
                .values()
                .filter(|instance| Some(instance.id()) != former_id)
                .cloned()
                .collect();
            (former_active, draining, state.sweeper.take())
        };

        tracing::info!(
            retiring = draining.len(),
            has_active = former_active.is_some(),
            force,
            "Shutting down client manager"
        );

        self.inner.shutdown.cancel();
        if let Some(handle) = sweeper {
            if let Err(err) = handle.await {
                tracing::warn!(error = %err, "Cleanup sweeper exited abnormally");
            }
        }

        join_all(draining.iter().map(|instance| self.drain(instance))).await;
        if let Some(instance) = former_active.as_ref() {
            self.drain(instance).await;
        }

        let mut state = self.inner.state.lock().await;
        for instance in draining.iter().chain(former_active.iter()) {
            state.retiring.remove(&instance.id());
        }
        drop(state);

        tracing::info!("Client manager shut down");
    }

    /// Close an instance without a timeout and wait until the close settles,
    /// whoever started it
    async fn drain(&self, instance: &Arc<ManagedInstance<C>>) {
        self.inner.close_instance(instance, None).await;
        instance.closed().await;
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub async fn is_closed(&self) -> bool {
        self.inner.state.lock().await.closing
    }

    pub async fn retiring_count(&self) -> usize {
        self.inner.state.lock().await.retiring.len()
    }

    /// Whether a creation currently holds the single-flight gate
    pub fn creation_in_flight(&self) -> bool {
        self.inner.creation.try_lock().is_err()
    }

    pub async fn stats(&self) -> RotationStats {
        let state = self.inner.state.lock().await;
        RotationStats {
            active: state.active.as_ref().map(|instance| instance.stats()),
            retiring: state.retiring.len(),
            created_total: self.inner.created_total.load(Ordering::SeqCst),
            closed_total: self.inner.closed_total.load(Ordering::SeqCst),
            closing: state.closing,
            creation_in_flight: self.creation_in_flight(),
        }
    }
}

// ============================================================================
// Statistics
// ============================================================================

/// Statistics about a rotation manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RotationStats {
    /// The instance currently handed out
    pub active: Option<InstanceStats>,
    /// Instances waiting to be closed
    pub retiring: usize,
    /// Instances created over the manager's lifetime
    pub created_total: u64,
    /// Close attempts that have settled
    pub closed_total: u64,
    /// Whether shutdown has started
    pub closing: bool,
    pub creation_in_flight: bool,
}

// ============================================================================
// Tests
// ============================================================================
