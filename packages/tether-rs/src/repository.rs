//! The saga repository: correlate, run consumer logic, write back.
//!
//! # Dispatch
//!
//! ```text
//! ConsumeContext<M>
//!     │
//!     ├─ no correlation id ───────────────► MissingCorrelationId (no store I/O)
//!     │
//!     ├─ policy pre-inserts? ── insert ──┬─ Ok ──────────────┐
//!     │                                  └─ DuplicateKey ─┐  │
//!     ▼                                                   ▼  │
//!   load(id) ── None ──► policy.missing(MissingPipe) ─► insert (never replace)
//!     │                                                      │
//!     └─ Some ───────────────────────────────────────────────┤
//!                                                            ▼
//!                                   policy.existing(SagaConsumeContext, next)
//!                                                            │
//!                                    completed? ── yes ──► delete(id)
//!                                                  no  ──► replace(saga, revision held)
//!                                                            └─ Conflict ─► ConcurrencyConflict
//! ```
//!
//! The repository never serializes deliveries for one correlation id
//! in-process and never retries. The store's revision check is the only thing
//! that orders concurrent writers; redelivery (or a [`RetryFilter`]) resolves
//! a [`TetherError::ConcurrencyConflict`].
//!
//! Failures outside the [`TetherError`] taxonomy are wrapped into
//! [`TetherError::SagaFault`] with the saga type, message type and
//! correlation id.
//!
//! [`RetryFilter`]: crate::filters::RetryFilter

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, Instrument};

use crate::context::{cancellable, ConsumeContext, PipeContext};
use crate::core::{CorrelationId, Message};
use crate::error::{is_cancelled, TetherError};
use crate::persistence::{SagaStore, StoreError, Versioned};
use crate::pipe::{Filter, Next, Pipe, ProbeContext};
use crate::policy::{MissingPipe, SagaPolicy};
use crate::saga::{Saga, SagaConsumeContext, SagaQuery};

// =============================================================================
// Repository
// =============================================================================

/// Correlates inbound messages to saga instances held in a [`SagaStore`].
pub struct SagaRepository<S: Saga> {
    store: Arc<dyn SagaStore<S>>,
}

impl<S: Saga> Clone for SagaRepository<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
        }
    }
}

impl<S: Saga> SagaRepository<S> {
    pub fn new(store: impl SagaStore<S>) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    pub fn from_shared(store: Arc<dyn SagaStore<S>>) -> Self {
        Self { store }
    }

    /// Backend name of the underlying store.
    pub fn store_kind(&self) -> &'static str {
        self.store.kind()
    }

    /// Dispatch a message to the instance its correlation id names.
    pub async fn dispatch<M, P>(
        &self,
        ctx: &mut ConsumeContext<M>,
        policy: &P,
        next: &Pipe<SagaConsumeContext<S, M>>,
    ) -> Result<()>
    where
        M: Message,
        P: SagaPolicy<S, M> + ?Sized,
    {
        let Some(correlation_id) = ctx.correlation_id() else {
            return Err(TetherError::MissingCorrelationId {
                message_type: M::message_type(),
            }
            .into());
        };

        let span = ctx.span().clone();
        self.dispatch_correlated(ctx, correlation_id, policy, next)
            .instrument(span)
            .await
            .map_err(|e| saga_fault::<S, M>(e, Some(correlation_id)))
    }

    /// Dispatch a message to every instance matching `query`.
    ///
    /// Each match is processed and written back independently, in stream
    /// order. Zero matches run the policy's missing path exactly once. A
    /// failure stops the fan-out, is logged and is returned.
    pub async fn dispatch_query<M, P>(
        &self,
        ctx: &mut ConsumeContext<M>,
        query: &SagaQuery<S>,
        policy: &P,
        next: &Pipe<SagaConsumeContext<S, M>>,
    ) -> Result<()>
    where
        M: Message,
        P: SagaPolicy<S, M> + ?Sized,
    {
        let span = ctx.span().clone();
        let mut failed_instance = None;
        let result = async {
            let token = ctx.cancellation().clone();
            let store = &self.store;
            let mut matches = cancellable(&token, async {
                store.query(query).await.map_err(anyhow::Error::from)
            })
            .await?;

            let mut matched = 0usize;
            while let Some(item) = cancellable(&token, async { Ok(matches.next().await) }).await? {
                let versioned = item?;
                matched += 1;
                let instance_id = versioned.saga.correlation_id();
                if let Err(e) = self.process(ctx, versioned, false, policy, next).await {
                    failed_instance = Some(instance_id);
                    return Err(e);
                }
            }

            if matched == 0 {
                let correlation_id = ctx.correlation_id().unwrap_or_default();
                debug!(query = query.description(), "saga query matched nothing");
                return policy
                    .missing(ctx, MissingPipe::new(correlation_id, &*self.store, next))
                    .await;
            }

            debug!(query = query.description(), matched, "saga query dispatched");
            Ok(())
        }
        .instrument(span)
        .await;

        result.map_err(|e| {
            // Instance that failed, else the message's own id.
            let correlation_id = failed_instance.or_else(|| ctx.correlation_id());
            if !is_cancelled(&e) {
                error!(
                    saga_type = S::saga_type(),
                    message_type = M::message_type(),
                    correlation_id = ?correlation_id,
                    query = query.description(),
                    error = %e,
                    "saga query dispatch failed"
                );
            }
            saga_fault::<S, M>(e, correlation_id)
        })
    }

    async fn dispatch_correlated<M, P>(
        &self,
        ctx: &mut ConsumeContext<M>,
        correlation_id: CorrelationId,
        policy: &P,
        next: &Pipe<SagaConsumeContext<S, M>>,
    ) -> Result<()>
    where
        M: Message,
        P: SagaPolicy<S, M> + ?Sized,
    {
        let token = ctx.cancellation().clone();

        let mut claimed = None;
        if policy.should_pre_insert() {
            if let Some(instance) = policy.create_instance(correlation_id, ctx) {
                claimed = self.pre_insert(instance, &token).await?;
            }
        }

        let (versioned, is_new) = match claimed {
            Some(versioned) => (versioned, true),
            None => match self.load(correlation_id, &token).await? {
                Some(versioned) => (versioned, false),
                None => {
                    debug!(
                        saga_type = S::saga_type(),
                        correlation_id = %correlation_id,
                        "no saga instance, taking missing path"
                    );
                    return policy
                        .missing(ctx, MissingPipe::new(correlation_id, &*self.store, next))
                        .await;
                }
            },
        };

        self.process(ctx, versioned, is_new, policy, next).await
    }

    /// Claim the id ahead of lookup. `None` means another consumer got there first.
    async fn pre_insert(&self, instance: S, token: &CancellationToken) -> Result<Option<Versioned<S>>> {
        let store = &self.store;
        let outcome = cancellable(token, async { Ok(store.insert(&instance).await) }).await?;

        match outcome {
            Ok(revision) => {
                debug!(
                    saga_type = S::saga_type(),
                    correlation_id = %instance.correlation_id(),
                    revision = %revision,
                    "saga pre-inserted"
                );
                Ok(Some(Versioned::new(instance, revision)))
            }
            Err(StoreError::DuplicateKey) => {
                debug!(
                    saga_type = S::saga_type(),
                    correlation_id = %instance.correlation_id(),
                    "pre-insert lost the claim, falling through to lookup"
                );
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn load(&self, id: CorrelationId, token: &CancellationToken) -> Result<Option<Versioned<S>>> {
        let store = &self.store;
        cancellable(token, async { store.load(id).await.map_err(anyhow::Error::from) }).await
    }

    /// Run consumer logic over a held instance, then delete or write it back.
    async fn process<M, P>(
        &self,
        ctx: &ConsumeContext<M>,
        versioned: Versioned<S>,
        is_new: bool,
        policy: &P,
        next: &Pipe<SagaConsumeContext<S, M>>,
    ) -> Result<()>
    where
        M: Message,
        P: SagaPolicy<S, M> + ?Sized,
    {
        let Versioned { saga, revision } = versioned;
        let mut saga_ctx = SagaConsumeContext::new(ctx.clone(), saga, revision, is_new);
        let span = saga_ctx.span().clone();

        policy.existing(&mut saga_ctx, next).await?;

        let token = saga_ctx.cancellation().clone();
        let correlation_id = saga_ctx.correlation_id();
        let store = &self.store;

        if saga_ctx.is_completed() {
            cancellable(&token, async { store.delete(correlation_id).await.map_err(anyhow::Error::from) })
                .instrument(span.clone())
                .await?;
            debug!(parent: &span, "saga completed and deleted");
            return Ok(());
        }

        let saga = saga_ctx.saga();
        let outcome = cancellable(&token, async { Ok(store.replace(saga, revision).await) })
            .instrument(span.clone())
            .await?;

        match outcome {
            Ok(updated) => {
                debug!(parent: &span, revision = %updated, "saga updated");
                Ok(())
            }
            // A concurrent delete moved the record on just as a concurrent write would.
            Err(StoreError::Conflict) | Err(StoreError::NotFound) => {
                debug!(parent: &span, expected = %revision, "saga write lost to a concurrent writer");
                Err(TetherError::ConcurrencyConflict {
                    saga_type: S::saga_type(),
                    correlation_id,
                    expected: revision,
                }
                .into())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn probe(&self, probe: &mut ProbeContext, mode: &str, consumer: serde_json::Value) {
        probe.add(
            "saga",
            json!({
                "persistence": self.store.kind(),
                "saga_type": S::saga_type(),
                "properties": S::properties(),
                "mode": mode,
                "consumer": consumer,
            }),
        );
    }
}

/// Annotate a failure outside the taxonomy with saga context.
fn saga_fault<S: Saga, M: Message>(error: anyhow::Error, correlation_id: Option<CorrelationId>) -> anyhow::Error {
    if error.downcast_ref::<TetherError>().is_some() {
        return error;
    }
    TetherError::SagaFault {
        saga_type: S::saga_type(),
        message_type: M::message_type(),
        correlation_id,
        source: error,
    }
    .into()
}

// =============================================================================
// Filters
// =============================================================================

/// Routes inbound messages to the saga their correlation id names.
///
/// # Example
///
/// ```ignore
/// let consumer = Pipe::builder().add_filter(ShipOrder).build();
/// let receive = Pipe::builder()
///     .add_filter(RetryFilter::new(RetryConfig::immediate(3)))
///     .add_filter(CorrelatedSagaFilter::new(repository, policy, consumer))
///     .build();
/// ```
pub struct CorrelatedSagaFilter<S: Saga, M: Message, P> {
    repository: SagaRepository<S>,
    policy: Arc<P>,
    next: Pipe<SagaConsumeContext<S, M>>,
}

impl<S: Saga, M: Message, P: SagaPolicy<S, M>> CorrelatedSagaFilter<S, M, P> {
    pub fn new(repository: SagaRepository<S>, policy: P, next: Pipe<SagaConsumeContext<S, M>>) -> Self {
        Self {
            repository,
            policy: Arc::new(policy),
            next,
        }
    }
}

#[async_trait]
impl<S: Saga, M: Message, P: SagaPolicy<S, M>> Filter<ConsumeContext<M>> for CorrelatedSagaFilter<S, M, P> {
    async fn send(&self, ctx: &mut ConsumeContext<M>, next: Next<'_, ConsumeContext<M>>) -> Result<()> {
        self.repository.dispatch(ctx, &*self.policy, &self.next).await?;
        next.send(ctx).await
    }

    fn probe(&self, probe: &mut ProbeContext) {
        self.repository.probe(probe, "correlated", self.next.probe());
    }
}

type QueryFactory<S, M> = Arc<dyn Fn(&ConsumeContext<M>) -> SagaQuery<S> + Send + Sync>;

/// Routes inbound messages to every saga a predicate selects.
pub struct QuerySagaFilter<S: Saga, M: Message, P> {
    repository: SagaRepository<S>,
    query: QueryFactory<S, M>,
    policy: Arc<P>,
    next: Pipe<SagaConsumeContext<S, M>>,
}

impl<S: Saga, M: Message, P: SagaPolicy<S, M>> QuerySagaFilter<S, M, P> {
    /// `query` builds the predicate from each inbound message.
    pub fn new<F>(repository: SagaRepository<S>, query: F, policy: P, next: Pipe<SagaConsumeContext<S, M>>) -> Self
    where
        F: Fn(&ConsumeContext<M>) -> SagaQuery<S> + Send + Sync + 'static,
    {
        Self {
            repository,
            query: Arc::new(query),
            policy: Arc::new(policy),
            next,
        }
    }
}

#[async_trait]
impl<S: Saga, M: Message, P: SagaPolicy<S, M>> Filter<ConsumeContext<M>> for QuerySagaFilter<S, M, P> {
    async fn send(&self, ctx: &mut ConsumeContext<M>, next: Next<'_, ConsumeContext<M>>) -> Result<()> {
        let query = (self.query)(ctx);
        self.repository
            .dispatch_query(ctx, &query, &*self.policy, &self.next)
            .await?;
        next.send(ctx).await
    }

    fn probe(&self, probe: &mut ProbeContext) {
        self.repository.probe(probe, "query", self.next.probe());
    }
}
