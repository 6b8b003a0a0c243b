//! Supervised resource pool.
//!
//! A [`ResourcePool`] holds one or more slots. Each slot is a single agent
//! task that owns one scoped resource (a broker session, say) and moves
//! through an explicit state machine:
//!
//! ```text
//! Starting ──► Ready ──► Stopping ──► Stopped
//!    │           │
//!    └───────────┴──► Faulted ──(next demand)──► Starting
//! ```
//!
//! Borrowers never touch slot state. They talk to the agent with messages
//! (borrow, return, stop); the agent lends the resource to exactly one
//! borrower at a time and queues the rest.
//!
//! # Guarantees
//!
//! - **Fail fast when stopping**: once `stop` begins, `send` fails at once
//!   with [`TetherError::TransportUnavailable`]. It never queues.
//! - **Drain**: `send` calls that entered before `stop` run to completion
//!   (bounded by [`PoolConfig::drain_timeout`] when set). A resource still
//!   lent when the timeout fires is released once its borrower returns it.
//! - **Fault containment**: a resource marked faulted, or one whose borrower
//!   was dropped mid-work, is discarded and a fresh one is created on the next
//!   demand.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Span};

use crate::config::PoolConfig;
use crate::context::{cancellable, Payloads, PipeContext};
use crate::error::TetherError;
use crate::pipe::Pipe;

// =============================================================================
// States
// =============================================================================

/// Lifecycle state of one resource slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotState {
    /// Creating the resource.
    Starting,
    /// Resource is available or lent out.
    Ready,
    /// Releasing the resource for good.
    Stopping,
    /// Released; the slot accepts no more work.
    Stopped,
    /// The resource was discarded; a new one is created on next demand.
    Faulted,
}

/// Lifecycle state of the pool as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolState {
    Ready,
    Stopping,
    Stopped,
}

impl fmt::Display for PoolState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolState::Ready => write!(f, "ready"),
            PoolState::Stopping => write!(f, "stopping"),
            PoolState::Stopped => write!(f, "stopped"),
        }
    }
}

// =============================================================================
// Resource Factory
// =============================================================================

/// Creates and releases the resources a slot holds.
#[async_trait]
pub trait ResourceFactory<R: Send + 'static>: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Create a fresh resource.
    async fn create(&self) -> Result<R>;

    /// Release a resource that is being discarded or shut down.
    async fn release(&self, resource: R) -> Result<()> {
        drop(resource);
        Ok(())
    }
}

// =============================================================================
// Resource Context
// =============================================================================

/// Context for work that runs with a borrowed resource.
///
/// The resource is exclusively the borrower's until the pipe returns. Filters
/// must not keep it past that point.
pub struct ResourceContext<R> {
    resource: R,
    slot: usize,
    faulted: bool,
    cancellation: CancellationToken,
    payloads: Payloads,
    span: Span,
}

impl<R> ResourceContext<R> {
    fn new(resource: R, slot: usize, cancellation: CancellationToken, span: Span) -> Self {
        Self {
            resource,
            slot,
            faulted: false,
            cancellation,
            payloads: Payloads::new(),
            span,
        }
    }

    pub fn resource(&self) -> &R {
        &self.resource
    }

    pub fn resource_mut(&mut self) -> &mut R {
        &mut self.resource
    }

    /// Index of the slot the resource was borrowed from.
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Discard the resource when this borrow ends instead of returning it.
    pub fn mark_faulted(&mut self) {
        self.faulted = true;
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }
}

impl<R: Send + 'static> PipeContext for ResourceContext<R> {
    fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    fn payloads(&self) -> &Payloads {
        &self.payloads
    }

    fn payloads_mut(&mut self) -> &mut Payloads {
        &mut self.payloads
    }

    fn span(&self) -> &Span {
        &self.span
    }
}

// =============================================================================
// Slot Agent
// =============================================================================

enum SlotRequest<R> {
    Borrow(oneshot::Sender<Result<R>>),
    Return { resource: R, faulted: bool },
    Abandoned,
    Stop { done: oneshot::Sender<()> },
}

/// Owns one resource and serializes access to it.
struct SlotAgent<R: Send + 'static> {
    index: usize,
    pool: String,
    factory: Arc<dyn ResourceFactory<R>>,
    resource: Option<R>,
    lent: bool,
    waiters: VecDeque<oneshot::Sender<Result<R>>>,
    state: watch::Sender<SlotState>,
    requests: mpsc::UnboundedReceiver<SlotRequest<R>>,
}

impl<R: Send + 'static> SlotAgent<R> {
    async fn run(mut self) {
        self.resource = self.create().await;

        while let Some(request) = self.requests.recv().await {
            match request {
                SlotRequest::Borrow(reply) => {
                    if self.lent {
                        self.waiters.push_back(reply);
                    } else {
                        self.lend(reply).await;
                    }
                }
                SlotRequest::Return { resource, faulted } => {
                    self.lent = false;
                    if faulted {
                        warn!(pool = %self.pool, slot = self.index, "resource faulted, discarding");
                        self.discard(resource).await;
                    } else {
                        self.resource = Some(resource);
                    }
                    self.serve_waiters().await;
                }
                SlotRequest::Abandoned => {
                    self.lent = false;
                    warn!(pool = %self.pool, slot = self.index, "borrower dropped mid-work, resource lost");
                    self.state.send_replace(SlotState::Faulted);
                    self.serve_waiters().await;
                }
                SlotRequest::Stop { done } => {
                    self.shutdown().await;
                    let _ = done.send(());
                    if self.lent {
                        self.release_late_return().await;
                    }
                    return;
                }
            }
        }

        // Every handle dropped without a stop.
        self.shutdown().await;
    }

    async fn create(&mut self) -> Option<R> {
        self.state.send_replace(SlotState::Starting);
        match self.factory.create().await {
            Ok(resource) => {
                debug!(pool = %self.pool, slot = self.index, factory = self.factory.name(), "resource created");
                self.state.send_replace(SlotState::Ready);
                Some(resource)
            }
            Err(e) => {
                warn!(pool = %self.pool, slot = self.index, error = %e, "resource creation failed");
                self.state.send_replace(SlotState::Faulted);
                None
            }
        }
    }

    async fn lend(&mut self, reply: oneshot::Sender<Result<R>>) {
        // Borrower gave up while queued.
        if reply.is_closed() {
            return;
        }

        let resource = match self.resource.take() {
            Some(resource) => resource,
            None => match self.create().await {
                Some(resource) => resource,
                None => {
                    let _ = reply.send(Err(anyhow!(
                        "pool {} slot {} could not create its resource",
                        self.pool,
                        self.index
                    )));
                    return;
                }
            },
        };

        match reply.send(Ok(resource)) {
            Ok(()) => self.lent = true,
            Err(returned) => self.resource = returned.ok(),
        }
    }

    async fn serve_waiters(&mut self) {
        while !self.lent {
            let Some(waiter) = self.waiters.pop_front() else {
                break;
            };
            self.lend(waiter).await;
        }
    }

    /// After a stop that outran the drain, wait for the lent resource and release it.
    async fn release_late_return(&mut self) {
        while let Some(request) = self.requests.recv().await {
            match request {
                SlotRequest::Return { resource, .. } => {
                    self.lent = false;
                    if let Err(e) = self.factory.release(resource).await {
                        warn!(pool = %self.pool, slot = self.index, error = %e, "failed to release late resource");
                    }
                    debug!(pool = %self.pool, slot = self.index, "late resource released");
                    return;
                }
                SlotRequest::Abandoned => return,
                SlotRequest::Borrow(reply) => {
                    let _ = reply.send(Err(TetherError::transport_unavailable("resource slot stopped").into()));
                }
                SlotRequest::Stop { done } => {
                    let _ = done.send(());
                }
            }
        }
    }

    async fn discard(&mut self, resource: R) {
        self.state.send_replace(SlotState::Faulted);
        if let Err(e) = self.factory.release(resource).await {
            warn!(pool = %self.pool, slot = self.index, error = %e, "failed to release faulted resource");
        }
    }

    async fn shutdown(&mut self) {
        self.state.send_replace(SlotState::Stopping);

        for waiter in self.waiters.drain(..) {
            let _ = waiter.send(Err(TetherError::transport_unavailable("resource slot stopped").into()));
        }

        if let Some(resource) = self.resource.take() {
            if let Err(e) = self.factory.release(resource).await {
                warn!(pool = %self.pool, slot = self.index, error = %e, "failed to release resource");
            }
        }
        if self.lent {
            warn!(
                pool = %self.pool,
                slot = self.index,
                "slot stopped while its resource was lent, releasing it when it comes back"
            );
        }

        self.state.send_replace(SlotState::Stopped);
        debug!(pool = %self.pool, slot = self.index, "slot stopped");
    }
}

/// Pool-side handle to a slot agent.
struct SlotHandle<R> {
    requests: mpsc::UnboundedSender<SlotRequest<R>>,
    state: watch::Receiver<SlotState>,
}

impl<R> Clone for SlotHandle<R> {
    fn clone(&self) -> Self {
        Self {
            requests: self.requests.clone(),
            state: self.state.clone(),
        }
    }
}

impl<R: Send + 'static> SlotHandle<R> {
    /// Queue a borrow with the agent. The resource arrives through [`Lease::granted`].
    fn borrow(&self) -> Result<Lease<R>> {
        let (reply, receive) = oneshot::channel();
        self.requests
            .send(SlotRequest::Borrow(reply))
            .map_err(|_| TetherError::transport_unavailable("resource slot stopped"))?;
        Ok(Lease {
            requests: self.requests.clone(),
            reply: Some(receive),
            settled: false,
        })
    }
}

/// One borrow, from request to return.
///
/// Dropping an unsettled lease gives the resource back to its slot if it was
/// already handed over but never read, and reports it lost if the borrower
/// was dropped mid-work.
struct Lease<R> {
    requests: mpsc::UnboundedSender<SlotRequest<R>>,
    reply: Option<oneshot::Receiver<Result<R>>>,
    settled: bool,
}

impl<R> Lease<R> {
    async fn granted(&mut self) -> Result<R> {
        let reply = self
            .reply
            .as_mut()
            .ok_or_else(|| anyhow!("lease already granted"))?;
        let outcome = match reply.await {
            Ok(outcome) => outcome,
            Err(_) => Err(TetherError::transport_unavailable("resource slot stopped").into()),
        };
        self.reply = None;

        // Nothing was lent.
        if outcome.is_err() {
            self.settled = true;
        }
        outcome
    }

    fn complete(mut self, resource: R, faulted: bool) {
        self.settled = true;
        if self.requests.send(SlotRequest::Return { resource, faulted }).is_err() {
            debug!("slot stopped before the resource came back, dropping it");
        }
    }
}

impl<R> Drop for Lease<R> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }

        let Some(mut reply) = self.reply.take() else {
            let _ = self.requests.send(SlotRequest::Abandoned);
            return;
        };

        // Still waiting. Once closed, the agent either keeps the resource or
        // already sent it, in which case it goes straight back.
        reply.close();
        if let Ok(Ok(resource)) = reply.try_recv() {
            let _ = self.requests.send(SlotRequest::Return {
                resource,
                faulted: false,
            });
        }
    }
}

// =============================================================================
// Resource Pool
// =============================================================================

struct PoolInner<R> {
    name: String,
    config: PoolConfig,
    slots: RwLock<Vec<SlotHandle<R>>>,
    next_slot: AtomicUsize,
    state: watch::Sender<PoolState>,
    inflight: AtomicUsize,
    drained: Notify,
}

/// Counts one `send` as in flight until dropped.
struct InflightGuard<'a, R> {
    inner: &'a PoolInner<R>,
}

impl<R> Drop for InflightGuard<'_, R> {
    fn drop(&mut self) {
        if self.inner.inflight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.drained.notify_waiters();
        }
    }
}

/// A supervised pool of resource slots.
///
/// Cloning is cheap; clones share the same slots.
///
/// # Example
///
/// ```ignore
/// let pool = ResourcePool::new("orders", PoolConfig::default());
/// pool.add(SessionFactory::new(client.clone()))?;
///
/// let work = Pipe::builder().add_filter(PublishFilter::new(message)).build();
/// pool.send(&work, CancellationToken::new()).await?;
///
/// pool.stop("shutdown").await?;
/// ```
pub struct ResourcePool<R> {
    inner: Arc<PoolInner<R>>,
}

impl<R> Clone for ResourcePool<R> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<R: Send + 'static> ResourcePool<R> {
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Self {
        let (state, _) = watch::channel(PoolState::Ready);
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                config,
                slots: RwLock::new(Vec::new()),
                next_slot: AtomicUsize::new(0),
                state,
                inflight: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> PoolState {
        *self.inner.state.borrow()
    }

    /// Number of `send` calls currently in flight.
    pub fn inflight(&self) -> usize {
        self.inner.inflight.load(Ordering::SeqCst)
    }

    pub fn slot_count(&self) -> usize {
        self.inner.slots.read().map(|slots| slots.len()).unwrap_or(0)
    }

    /// Current state of every slot, in slot order.
    pub fn slot_states(&self) -> Vec<SlotState> {
        match self.inner.slots.read() {
            Ok(slots) => slots.iter().map(|slot| *slot.state.borrow()).collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Add a slot backed by `factory`. Must be called inside a Tokio runtime.
    pub fn add<F: ResourceFactory<R>>(&self, factory: F) -> Result<()> {
        self.add_shared(Arc::new(factory))
    }

    /// Add a slot backed by a shared factory.
    pub fn add_shared(&self, factory: Arc<dyn ResourceFactory<R>>) -> Result<()> {
        let state = self.state();
        if state != PoolState::Ready {
            return Err(TetherError::transport_unavailable(format!(
                "pool {} is {}",
                self.inner.name, state
            ))
            .into());
        }

        let mut slots = self
            .inner
            .slots
            .write()
            .map_err(|e| anyhow!("slot registry poisoned: {}", e))?;

        let index = slots.len();
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SlotState::Starting);

        let agent = SlotAgent {
            index,
            pool: self.inner.name.clone(),
            factory,
            resource: None,
            lent: false,
            waiters: VecDeque::new(),
            state: state_tx,
            requests: requests_rx,
        };
        tokio::spawn(agent.run());

        slots.push(SlotHandle {
            requests: requests_tx,
            state: state_rx,
        });
        debug!(pool = %self.inner.name, slot = index, "slot added");
        Ok(())
    }

    /// Borrow a resource, run `work` with it, and return it.
    ///
    /// Fails at once with [`TetherError::TransportUnavailable`] if the pool is
    /// stopping or stopped. Waiting for a busy slot observes `cancellation`.
    pub async fn send(&self, work: &Pipe<ResourceContext<R>>, cancellation: CancellationToken) -> Result<()> {
        let _inflight = self.enter()?;
        let (index, slot) = self.pick()?;

        let mut lease = slot.borrow()?;
        let resource = cancellable(&cancellation, lease.granted()).await?;

        let span = tracing::debug_span!("resource", pool = %self.inner.name, slot = index);
        let mut ctx = ResourceContext::new(resource, index, cancellation, span);
        let result = work.send(&mut ctx).await;

        lease.complete(ctx.resource, ctx.faulted);
        result
    }

    /// Stop the pool.
    ///
    /// Refuses new work, waits for in-flight work to drain, then stops every
    /// slot and releases its resource. Calling `stop` again waits for the
    /// first call to finish.
    pub async fn stop(&self, reason: &str) -> Result<()> {
        let mut began = false;
        self.inner.state.send_if_modified(|state| {
            if *state != PoolState::Ready {
                return false;
            }
            *state = PoolState::Stopping;
            began = true;
            true
        });
        if !began {
            return self.wait_stopped().await;
        }

        info!(pool = %self.inner.name, reason, inflight = self.inflight(), "stopping resource pool");

        match self.inner.config.drain_timeout {
            Some(timeout) => {
                if tokio::time::timeout(timeout, self.drain()).await.is_err() {
                    warn!(
                        pool = %self.inner.name,
                        inflight = self.inflight(),
                        timeout_ms = timeout.as_millis() as u64,
                        "drain timeout elapsed, releasing resources with work in flight"
                    );
                }
            }
            None => self.drain().await,
        }

        let slots = match self.inner.slots.write() {
            Ok(mut slots) => std::mem::take(&mut *slots),
            Err(poisoned) => {
                warn!(pool = %self.inner.name, "slot registry was poisoned, recovering");
                std::mem::take(&mut *poisoned.into_inner())
            }
        };

        for slot in slots {
            let (done, stopped) = oneshot::channel();
            if slot.requests.send(SlotRequest::Stop { done }).is_ok() {
                let _ = stopped.await;
            }
        }

        self.inner.state.send_replace(PoolState::Stopped);
        info!(pool = %self.inner.name, reason, "resource pool stopped");
        Ok(())
    }

    /// Wait until the pool reaches [`PoolState::Stopped`].
    pub async fn wait_stopped(&self) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        state
            .wait_for(|s| *s == PoolState::Stopped)
            .await
            .map_err(|_| anyhow!("pool {} state channel closed", self.inner.name))?;
        Ok(())
    }

    fn enter(&self) -> Result<InflightGuard<'_, R>> {
        // Count first, check second: `stop` flips the state before it reads the count.
        self.inner.inflight.fetch_add(1, Ordering::SeqCst);
        let guard = InflightGuard { inner: &self.inner };

        let state = self.state();
        if state != PoolState::Ready {
            return Err(TetherError::transport_unavailable(format!(
                "pool {} is {}",
                self.inner.name, state
            ))
            .into());
        }
        Ok(guard)
    }

    fn pick(&self) -> Result<(usize, SlotHandle<R>)> {
        let slots = self
            .inner
            .slots
            .read()
            .map_err(|e| anyhow!("slot registry poisoned: {}", e))?;
        if slots.is_empty() {
            return Err(TetherError::transport_unavailable(format!(
                "pool {} has no resource slots",
                self.inner.name
            ))
            .into());
        }
        let index = self.inner.next_slot.fetch_add(1, Ordering::Relaxed) % slots.len();
        Ok((index, slots[index].clone()))
    }

    async fn drain(&self) {
        loop {
            let notified = self.inner.drained.notified();
            if self.inner.inflight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }
}

impl<R> fmt::Debug for ResourcePool<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourcePool")
            .field("name", &self.inner.name)
            .field("state", &*self.inner.state.borrow())
            .field("inflight", &self.inner.inflight.load(Ordering::SeqCst))
            .finish()
    }
}
