//! Saga policies.
//!
//! A policy is supplied per message type and answers three questions for the
//! repository:
//!
//! 1. Should a fresh instance be pre-inserted before lookup?
//! 2. What happens when lookup finds nothing? ([`SagaPolicy::missing`])
//! 3. What happens when lookup finds an instance? ([`SagaPolicy::existing`])
//!
//! Policies are stateless values shared across concurrent deliveries.
//!
//! | Policy                 | Pre-insert            | Missing                    |
//! |------------------------|-----------------------|----------------------------|
//! | [`NewOrExistingPolicy`]| when `insert_on_initial` | create via factory, insert |
//! | [`AnyExistingPolicy`]  | never                 | optional pipe, else discard |

use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tracing::{debug, Instrument};

use crate::context::{cancellable, ConsumeContext, PipeContext};
use crate::core::{CorrelationId, Message};
use crate::error::TetherError;
use crate::persistence::{Revision, SagaStore, StoreError};
use crate::pipe::Pipe;
use crate::saga::{Saga, SagaConsumeContext};

/// Decision points the repository consults while dispatching a message.
#[async_trait]
pub trait SagaPolicy<S: Saga, M: Message>: Send + Sync + 'static {
    /// Whether to claim the correlation id with an insert before lookup.
    fn should_pre_insert(&self) -> bool {
        false
    }

    /// Instance to pre-insert. Only called when [`should_pre_insert`](Self::should_pre_insert) is true.
    fn create_instance(&self, _correlation_id: CorrelationId, _ctx: &ConsumeContext<M>) -> Option<S> {
        None
    }

    /// Run consumer logic against an instance that exists.
    async fn existing(
        &self,
        ctx: &mut SagaConsumeContext<S, M>,
        next: &Pipe<SagaConsumeContext<S, M>>,
    ) -> Result<()> {
        next.send(ctx).await
    }

    /// Handle a message no stored instance correlates to.
    ///
    /// Driving `missing` with an instance runs consumer logic and inserts it.
    /// Returning without driving it drops the message without error.
    async fn missing(&self, ctx: &mut ConsumeContext<M>, missing: MissingPipe<'_, S, M>) -> Result<()>;
}

// =============================================================================
// Missing Pipe
// =============================================================================

/// Runs consumer logic for a new instance, then inserts it.
///
/// The instance is never replaced on this path: it did not exist, so it is
/// created directly. If consumer logic completes it immediately it is never
/// stored at all.
pub struct MissingPipe<'a, S: Saga, M: Message> {
    correlation_id: CorrelationId,
    store: &'a dyn SagaStore<S>,
    next: &'a Pipe<SagaConsumeContext<S, M>>,
}

impl<'a, S: Saga, M: Message> MissingPipe<'a, S, M> {
    pub(crate) fn new(
        correlation_id: CorrelationId,
        store: &'a dyn SagaStore<S>,
        next: &'a Pipe<SagaConsumeContext<S, M>>,
    ) -> Self {
        Self {
            correlation_id,
            store,
            next,
        }
    }

    /// Correlation id a new instance should carry.
    pub fn correlation_id(&self) -> CorrelationId {
        self.correlation_id
    }

    /// Run consumer logic against `instance` and insert it unless completed.
    pub async fn send(self, ctx: &ConsumeContext<M>, instance: S) -> Result<()> {
        let mut saga_ctx = SagaConsumeContext::new(ctx.clone(), instance, Revision::NONE, true);
        let span = saga_ctx.span().clone();

        self.next.send(&mut saga_ctx).await?;

        if saga_ctx.is_completed() {
            debug!(parent: &span, "saga completed on first message, not stored");
            return Ok(());
        }

        let token = saga_ctx.cancellation().clone();
        let store = self.store;
        let saga = saga_ctx.saga();
        let outcome = cancellable(&token, async { Ok(store.insert(saga).await) })
            .instrument(span.clone())
            .await?;

        match outcome {
            Ok(revision) => {
                debug!(parent: &span, revision = %revision, "saga inserted");
                Ok(())
            }
            Err(StoreError::DuplicateKey) => Err(TetherError::ConcurrencyConflict {
                saga_type: S::saga_type(),
                correlation_id: saga.correlation_id(),
                expected: Revision::NONE,
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// New Or Existing
// =============================================================================

type Factory<S, M> = Arc<dyn Fn(CorrelationId, &M) -> S + Send + Sync>;

/// Creates an instance when none exists, otherwise uses the stored one.
///
/// With `insert_on_initial` the instance is pre-inserted before lookup, which
/// settles races between concurrent first deliveries at the store.
///
/// # Example
///
/// ```ignore
/// let policy = NewOrExistingPolicy::new(|id, _msg: &OrderSubmitted| OrderState::new(id))
///     .with_insert_on_initial(true);
/// ```
pub struct NewOrExistingPolicy<S, M> {
    factory: Factory<S, M>,
    insert_on_initial: bool,
}

impl<S, M> NewOrExistingPolicy<S, M> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(CorrelationId, &M) -> S + Send + Sync + 'static,
    {
        Self {
            factory: Arc::new(factory),
            insert_on_initial: false,
        }
    }

    pub fn with_insert_on_initial(mut self, insert: bool) -> Self {
        self.insert_on_initial = insert;
        self
    }
}

#[async_trait]
impl<S: Saga, M: Message> SagaPolicy<S, M> for NewOrExistingPolicy<S, M> {
    fn should_pre_insert(&self) -> bool {
        self.insert_on_initial
    }

    fn create_instance(&self, correlation_id: CorrelationId, ctx: &ConsumeContext<M>) -> Option<S> {
        Some((self.factory)(correlation_id, ctx.message()))
    }

    async fn missing(&self, ctx: &mut ConsumeContext<M>, missing: MissingPipe<'_, S, M>) -> Result<()> {
        let instance = (self.factory)(missing.correlation_id(), ctx.message());
        missing.send(ctx, instance).await
    }
}

// =============================================================================
// Any Existing
// =============================================================================

/// Only acts on instances that already exist.
///
/// A message with no instance goes to the optional missing pipe, or is
/// discarded when there is none.
pub struct AnyExistingPolicy<M> {
    missing: Option<Pipe<ConsumeContext<M>>>,
    _message: PhantomData<fn(M)>,
}

impl<M: Message> AnyExistingPolicy<M> {
    pub fn new() -> Self {
        Self {
            missing: None,
            _message: PhantomData,
        }
    }

    /// Run `pipe` for messages that correlate to nothing.
    pub fn with_missing_pipe(mut self, pipe: Pipe<ConsumeContext<M>>) -> Self {
        self.missing = Some(pipe);
        self
    }
}

impl<M: Message> Default for AnyExistingPolicy<M> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: Saga, M: Message> SagaPolicy<S, M> for AnyExistingPolicy<M> {
    async fn missing(&self, ctx: &mut ConsumeContext<M>, missing: MissingPipe<'_, S, M>) -> Result<()> {
        match &self.missing {
            Some(pipe) => pipe.send(ctx).await,
            None => {
                debug!(
                    parent: ctx.span(),
                    saga_type = S::saga_type(),
                    correlation_id = %missing.correlation_id(),
                    "no saga instance, message discarded"
                );
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Envelope;
    use crate::testing::InMemorySagaStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone)]
    struct Started;
    impl Message for Started {}

    #[derive(Debug, Clone)]
    struct Job {
        id: CorrelationId,
        steps: u32,
    }

    impl Saga for Job {
        fn correlation_id(&self) -> CorrelationId {
            self.id
        }
    }

    type Ctx = SagaConsumeContext<Job, Started>;

    fn consume(id: CorrelationId) -> ConsumeContext<Started> {
        ConsumeContext::new(Envelope::new(Started).with_correlation_id(id))
    }

    fn policy() -> NewOrExistingPolicy<Job, Started> {
        NewOrExistingPolicy::new(|id, _: &Started| Job { id, steps: 0 })
    }

    fn step_pipe() -> Pipe<Ctx> {
        Pipe::builder()
            .execute(|ctx: &mut Ctx| {
                ctx.saga_mut().steps += 1;
                Ok(())
            })
            .build()
    }

    #[tokio::test]
    async fn test_new_or_existing_missing_inserts_new_instance() {
        let store = InMemorySagaStore::<Job>::new();
        let id = CorrelationId::new();
        let next = step_pipe();

        let mut ctx = consume(id);
        policy()
            .missing(&mut ctx, MissingPipe::<Job, Started>::new(id, &store, &next))
            .await
            .unwrap();

        let stored = store.get(id).unwrap();
        assert_eq!(stored.saga.steps, 1);
        assert_eq!(stored.revision, Revision::new(1));
    }

    #[tokio::test]
    async fn test_missing_completed_instance_is_not_stored() {
        let store = InMemorySagaStore::<Job>::new();
        let id = CorrelationId::new();
        let next = Pipe::builder()
            .execute(|ctx: &mut Ctx| {
                ctx.set_completed();
                Ok(())
            })
            .build();

        let mut ctx = consume(id);
        policy()
            .missing(&mut ctx, MissingPipe::<Job, Started>::new(id, &store, &next))
            .await
            .unwrap();

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_missing_insert_duplicate_is_conflict() {
        let store = InMemorySagaStore::<Job>::new();
        let id = CorrelationId::new();
        store.seed(Job { id, steps: 9 });
        let next = step_pipe();

        let mut ctx = consume(id);
        let err = policy()
            .missing(&mut ctx, MissingPipe::<Job, Started>::new(id, &store, &next))
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<TetherError>(),
            Some(TetherError::ConcurrencyConflict { expected, .. }) if expected.is_none()
        ));
        assert_eq!(store.get(id).unwrap().saga.steps, 9);
    }

    #[tokio::test]
    async fn test_pre_insert_follows_flag() {
        let id = CorrelationId::new();
        let ctx = consume(id);

        let lazy = policy();
        assert!(!SagaPolicy::<Job, Started>::should_pre_insert(&lazy));

        let eager = policy().with_insert_on_initial(true);
        assert!(SagaPolicy::<Job, Started>::should_pre_insert(&eager));
        let instance = eager.create_instance(id, &ctx).unwrap();
        assert_eq!(instance.id, id);
    }

    #[tokio::test]
    async fn test_any_existing_discards_without_pipe() {
        let store = InMemorySagaStore::<Job>::new();
        let id = CorrelationId::new();
        let next = step_pipe();

        let mut ctx = consume(id);
        AnyExistingPolicy::new()
            .missing(&mut ctx, MissingPipe::<Job, Started>::new(id, &store, &next))
            .await
            .unwrap();

        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_any_existing_runs_missing_pipe() {
        let store = InMemorySagaStore::<Job>::new();
        let id = CorrelationId::new();
        let next = step_pipe();
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = hits.clone();
        let missing_pipe = Pipe::builder()
            .execute(move |_: &mut ConsumeContext<Started>| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .build();

        let mut ctx = consume(id);
        AnyExistingPolicy::new()
            .with_missing_pipe(missing_pipe)
            .missing(&mut ctx, MissingPipe::<Job, Started>::new(id, &store, &next))
            .await
            .unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(store.is_empty());
    }
}
