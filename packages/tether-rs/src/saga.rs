//! Saga instances and the context consumer logic runs against.
//!
//! A [`Saga`] is a durable, correlation-keyed state object. For the length of
//! one pipe invocation the repository owns it and lends it to consumer filters
//! through a [`SagaConsumeContext`]; filters mutate it in place and call
//! [`SagaConsumeContext::set_completed`] when the workflow is done.
//!
//! # Example
//!
//! ```ignore
//! #[derive(Debug, Clone)]
//! struct OrderState {
//!     order_id: CorrelationId,
//!     status: OrderStatus,
//! }
//!
//! impl Saga for OrderState {
//!     fn correlation_id(&self) -> CorrelationId {
//!         self.order_id
//!     }
//!
//!     fn properties() -> &'static [&'static str] {
//!         &["status"]
//!     }
//! }
//!
//! struct ShipOrder;
//!
//! #[async_trait]
//! impl Filter<SagaConsumeContext<OrderState, OrderShipped>> for ShipOrder {
//!     async fn send(&self, ctx: &mut SagaConsumeContext<OrderState, OrderShipped>, next: Next<'_, _>) -> Result<()> {
//!         ctx.saga_mut().status = OrderStatus::Shipped;
//!         ctx.set_completed();
//!         next.send(ctx).await
//!     }
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::context::{ConsumeContext, Payloads, PipeContext};
use crate::core::{CorrelationId, Envelope, Message};
use crate::persistence::Revision;

/// A durable state object identified by a correlation id.
pub trait Saga: Clone + Send + Sync + 'static {
    /// Immutable identity of this instance.
    fn correlation_id(&self) -> CorrelationId;

    /// Stable name used in logs, errors and probe data.
    fn saga_type() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Names of the fields the saga tracks, for probe data.
    fn properties() -> &'static [&'static str] {
        &[]
    }
}

// =============================================================================
// Saga Consume Context
// =============================================================================

/// A consume context bound to one saga instance.
pub struct SagaConsumeContext<S, M> {
    consume: ConsumeContext<M>,
    saga: S,
    revision: Revision,
    is_new: bool,
    completed: bool,
    span: Span,
}

impl<S: Saga, M: Message> SagaConsumeContext<S, M> {
    /// Bind `saga`, read at `revision`, to a consume context.
    ///
    /// The payload bag and cancellation signal carry over from `consume`.
    pub fn new(consume: ConsumeContext<M>, saga: S, revision: Revision, is_new: bool) -> Self {
        let span = tracing::debug_span!(
            parent: consume.span(),
            "saga",
            saga_type = S::saga_type(),
            correlation_id = %saga.correlation_id(),
            revision = %revision,
        );
        Self {
            consume,
            saga,
            revision,
            is_new,
            completed: false,
            span,
        }
    }

    pub fn saga(&self) -> &S {
        &self.saga
    }

    pub fn saga_mut(&mut self) -> &mut S {
        &mut self.saga
    }

    pub fn into_saga(self) -> S {
        self.saga
    }

    pub fn correlation_id(&self) -> CorrelationId {
        self.saga.correlation_id()
    }

    /// Revision the instance was read or created at.
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Whether the instance was created during this delivery.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Mark the workflow finished. The instance is deleted instead of saved.
    pub fn set_completed(&mut self) {
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    pub fn message(&self) -> &M {
        self.consume.message()
    }

    pub fn envelope(&self) -> &Envelope<M> {
        self.consume.envelope()
    }

    /// The inbound context this one was derived from.
    pub fn consume_context(&self) -> &ConsumeContext<M> {
        &self.consume
    }
}

impl<S: Saga, M: Message> PipeContext for SagaConsumeContext<S, M> {
    fn cancellation(&self) -> &CancellationToken {
        self.consume.cancellation()
    }

    fn payloads(&self) -> &Payloads {
        self.consume.payloads()
    }

    fn payloads_mut(&mut self) -> &mut Payloads {
        self.consume.payloads_mut()
    }

    fn span(&self) -> &Span {
        &self.span
    }
}

impl<S: fmt::Debug, M> fmt::Debug for SagaConsumeContext<S, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaConsumeContext")
            .field("saga", &self.saga)
            .field("revision", &self.revision)
            .field("is_new", &self.is_new)
            .field("completed", &self.completed)
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Saga Query
// =============================================================================

/// A predicate over stored instances, used for fan-out dispatch.
pub struct SagaQuery<S> {
    description: String,
    predicate: Arc<dyn Fn(&S) -> bool + Send + Sync>,
}

impl<S> Clone for SagaQuery<S> {
    fn clone(&self) -> Self {
        Self {
            description: self.description.clone(),
            predicate: self.predicate.clone(),
        }
    }
}

impl<S> SagaQuery<S> {
    /// Build a query from a predicate and a description for logs.
    pub fn new<F>(description: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&S) -> bool + Send + Sync + 'static,
    {
        Self {
            description: description.into(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn matches(&self, saga: &S) -> bool {
        (self.predicate)(saga)
    }

    pub fn description(&self) -> &str {
        &self.description
    }
}

impl<S> fmt::Debug for SagaQuery<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SagaQuery")
            .field("description", &self.description)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Ping;
    impl Message for Ping {}

    #[derive(Debug, Clone)]
    struct Counter {
        id: CorrelationId,
        hits: u32,
    }

    impl Saga for Counter {
        fn correlation_id(&self) -> CorrelationId {
            self.id
        }

        fn saga_type() -> &'static str {
            "Counter"
        }
    }

    #[test]
    fn test_saga_context_carries_payloads_and_cancellation() {
        let token = CancellationToken::new();
        let mut consume = ConsumeContext::new(Envelope::new(Ping)).with_cancellation(token.clone());
        consume.payloads_mut().insert(5u8);

        let id = CorrelationId::new();
        let mut ctx = SagaConsumeContext::new(consume, Counter { id, hits: 0 }, Revision::new(2), false);

        assert_eq!(ctx.payloads().get::<u8>(), Some(&5));
        assert_eq!(ctx.correlation_id(), id);
        assert_eq!(ctx.revision(), Revision::new(2));

        ctx.saga_mut().hits += 1;
        assert_eq!(ctx.saga().hits, 1);

        token.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn test_completion_flag() {
        let consume = ConsumeContext::new(Envelope::new(Ping));
        let mut ctx = SagaConsumeContext::new(
            consume,
            Counter {
                id: CorrelationId::new(),
                hits: 0,
            },
            Revision::NONE,
            true,
        );

        assert!(ctx.is_new());
        assert!(!ctx.is_completed());
        ctx.set_completed();
        assert!(ctx.is_completed());
    }

    #[test]
    fn test_query_matches() {
        let query = SagaQuery::new("hits > 2", |c: &Counter| c.hits > 2);
        let id = CorrelationId::new();
        assert!(query.matches(&Counter { id, hits: 3 }));
        assert!(!query.clone().matches(&Counter { id, hits: 1 }));
        assert_eq!(query.description(), "hits > 2");
    }
}
