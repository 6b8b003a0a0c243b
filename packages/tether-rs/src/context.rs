//! Pipe contexts.
//!
//! A context is created per message per pipe invocation and discarded when
//! the pipe returns. It is never shared across concurrent invocations, so
//! filters get `&mut` access and need no locking.
//!
//! Every context implements [`PipeContext`], the capability set generic
//! filters (retry, concurrency limit, observers) are written against:
//!
//! - a cancellation signal, observed at every suspension point
//! - a type-keyed [`Payloads`] bag for filters to hand data forward
//! - an explicit `tracing::Span`, passed along instead of ambient state

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::Span;

use crate::core::{CorrelationId, Envelope, Message, MessageId};
use crate::error::TetherError;

// =============================================================================
// Pipe Context
// =============================================================================

/// Capabilities shared by every context a pipe can run over.
pub trait PipeContext: Send + 'static {
    /// Cancellation signal for this unit of work.
    fn cancellation(&self) -> &CancellationToken;

    /// Pipe-local payload bag.
    fn payloads(&self) -> &Payloads;

    /// Mutable access to the payload bag.
    fn payloads_mut(&mut self) -> &mut Payloads;

    /// Trace handle for this unit of work.
    fn span(&self) -> &Span;

    /// Whether cancellation has been requested.
    fn is_cancelled(&self) -> bool {
        self.cancellation().is_cancelled()
    }
}

/// Run a future unless the token fires first.
///
/// Used around store reads/writes, broker I/O and slot borrows so that a
/// cancelled unit of work yields [`TetherError::Cancelled`] promptly.
pub(crate) async fn cancellable<T, F>(token: &CancellationToken, fut: F) -> anyhow::Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(TetherError::Cancelled.into()),
        result = fut => result,
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// Type-keyed bag of values filters pass forward.
///
/// Cloning is cheap: values are reference counted, so a derived context
/// (for example a saga context built from a consume context) starts with
/// the same payloads without copying them.
#[derive(Clone, Default)]
pub struct Payloads {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Payloads {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing any previous value of the same type.
    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) {
        self.entries.insert(TypeId::of::<T>(), Arc::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|value| value.downcast_ref::<T>())
    }

    /// Get the value of type `T`, inserting one built by `f` if absent.
    pub fn get_or_insert_with<T, F>(&mut self, f: F) -> &T
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let entry = self
            .entries
            .entry(TypeId::of::<T>())
            .or_insert_with(|| Arc::new(f()));
        match entry.downcast_ref::<T>() {
            Some(value) => value,
            // Keys are the TypeId of the stored value.
            None => unreachable!("payload stored under a foreign TypeId"),
        }
    }

    pub fn contains<T: Any + Send + Sync>(&self) -> bool {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    pub fn remove<T: Any + Send + Sync>(&mut self) -> bool {
        self.entries.remove(&TypeId::of::<T>()).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for Payloads {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Payloads")
            .field("len", &self.entries.len())
            .finish()
    }
}

// =============================================================================
// Consume Context
// =============================================================================

/// Context for an inbound message.
///
/// Wraps the immutable [`Envelope`] with the ambient state of one delivery.
///
/// # Example
///
/// ```ignore
/// let envelope = Envelope::new(OrderSubmitted { order_id })
///     .with_message_id(MessageId::new());
///
/// let mut ctx = ConsumeContext::new(envelope).with_cancellation(shutdown.child_token());
/// receive_pipe.send(&mut ctx).await?;
/// ```
#[derive(Clone)]
pub struct ConsumeContext<M> {
    envelope: Arc<Envelope<M>>,
    cancellation: CancellationToken,
    payloads: Payloads,
    span: Span,
    received_at: DateTime<Utc>,
}

impl<M: Message> ConsumeContext<M> {
    /// Create a context for a freshly received envelope.
    pub fn new(envelope: Envelope<M>) -> Self {
        let span = tracing::info_span!(
            "consume",
            message_type = M::message_type(),
            message_id = ?envelope.message_id(),
            correlation_id = ?envelope.correlation_id(),
        );
        Self {
            envelope: Arc::new(envelope),
            cancellation: CancellationToken::new(),
            payloads: Payloads::new(),
            span,
            received_at: Utc::now(),
        }
    }

    /// Replace the cancellation signal (typically a child of a shutdown token).
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Replace the trace handle.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn message(&self) -> &M {
        self.envelope.payload()
    }

    pub fn envelope(&self) -> &Envelope<M> {
        &self.envelope
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.envelope.message_id()
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.envelope.correlation_id()
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

impl<M: Message> PipeContext for ConsumeContext<M> {
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

impl<M> std::fmt::Debug for ConsumeContext<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumeContext")
            .field("message_id", &self.envelope.message_id())
            .field("correlation_id", &self.envelope.correlation_id())
            .field("payloads", &self.payloads)
            .finish_non_exhaustive()
    }
}
