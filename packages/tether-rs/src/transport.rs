//! The send path.
//!
//! A [`SendTransport`] delivers typed messages through a [`BrokerClient`],
//! borrowing a [`BrokerSession`] from a supervised [`ResourcePool`] for every
//! send:
//!
//! ```text
//! transport.send(destination, message, pipe)
//!     │
//!     ├─ pool stopping/stopped ─────────────► TransportUnavailable
//!     ▼
//! borrow session (ResourcePool)
//!     ▼
//! topology: declare destination (once per session)
//!     ▼
//! caller pipe over SendContext<M>  (headers, ttl, priority, correlation)
//!     ▼
//! freeze Envelope<M> ─► encode ─► client.to_native
//!     ▼
//! observers.pre_send ─► client.send(producer, native) ─┬─ Ok  ─► observers.post_send
//!                                                      └─ Err ─► observers.send_fault ─► Err (unchanged)
//! ```
//!
//! Faults the client classifies as session faults mark the borrowed session
//! faulted, so the pool discards it instead of lending it out again.

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument, Span};

use crate::config::TransportConfig;
use crate::context::{cancellable, Payloads, PipeContext};
use crate::core::{CorrelationId, Envelope, Headers, Message, MessageId, DEFAULT_CONTENT_TYPE};
use crate::error::TetherError;
use crate::observer::{SendEvent, SendObserver, SendObservers};
use crate::pipe::{Filter, Next, Pipe, ProbeContext};
use crate::supervisor::{PoolState, ResourceContext, ResourceFactory, ResourcePool};

// =============================================================================
// Destination
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DestinationKind {
    Queue,
    Topic,
}

/// Where a message is sent.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Destination {
    name: String,
    kind: DestinationKind,
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Queue,
        }
    }

    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: DestinationKind::Topic,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> DestinationKind {
        self.kind
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            DestinationKind::Queue => write!(f, "queue:{}", self.name),
            DestinationKind::Topic => write!(f, "topic:{}", self.name),
        }
    }
}

// =============================================================================
// Broker Client
// =============================================================================

/// A concrete broker's session, producer and wire format.
///
/// Implementations own the protocol: connection handshakes, acknowledgement
/// semantics and the native message representation. The transport only
/// sequences the calls.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// A broker session. Used by one borrower at a time.
    type Session: Send + 'static;
    /// A producer bound to one destination within a session.
    type Producer: Send + 'static;
    /// The broker's native message.
    type Native: Send + 'static;

    /// Broker name, for logs and probe data.
    fn kind(&self) -> &'static str;

    async fn open_session(&self) -> Result<Self::Session>;

    async fn close_session(&self, session: Self::Session) -> Result<()> {
        drop(session);
        Ok(())
    }

    /// Make sure `destination` exists. Must be idempotent.
    async fn declare_destination(&self, session: &mut Self::Session, destination: &Destination) -> Result<()>;

    async fn create_producer(&self, session: &mut Self::Session, destination: &Destination) -> Result<Self::Producer>;

    /// Translate an encoded envelope into the native message.
    fn to_native(&self, envelope: Envelope<Vec<u8>>) -> Result<Self::Native>;

    async fn send(&self, producer: &mut Self::Producer, message: Self::Native) -> Result<()>;

    /// Whether `error` means the session itself is broken.
    fn is_session_fault(&self, _error: &anyhow::Error) -> bool {
        false
    }
}

// =============================================================================
// Broker Session
// =============================================================================

/// A pooled broker session with its producers and declared destinations.
pub struct BrokerSession<B: BrokerClient> {
    session: B::Session,
    producers: HashMap<Destination, B::Producer>,
    declared: HashSet<Destination>,
}

impl<B: BrokerClient> BrokerSession<B> {
    fn new(session: B::Session) -> Self {
        Self {
            session,
            producers: HashMap::new(),
            declared: HashSet::new(),
        }
    }

    pub fn session(&self) -> &B::Session {
        &self.session
    }

    pub fn is_declared(&self, destination: &Destination) -> bool {
        self.declared.contains(destination)
    }

    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }
}

/// Opens and closes broker sessions for a pool slot.
pub struct SessionFactory<B> {
    client: Arc<B>,
}

impl<B> SessionFactory<B> {
    pub fn new(client: Arc<B>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<B: BrokerClient> ResourceFactory<BrokerSession<B>> for SessionFactory<B> {
    fn name(&self) -> &str {
        self.client.kind()
    }

    async fn create(&self) -> Result<BrokerSession<B>> {
        let session = self.client.open_session().await?;
        Ok(BrokerSession::new(session))
    }

    async fn release(&self, resource: BrokerSession<B>) -> Result<()> {
        let BrokerSession { session, producers, .. } = resource;
        drop(producers);
        self.client.close_session(session).await
    }
}

// =============================================================================
// Send Context
// =============================================================================

/// Context for populating an outbound message.
///
/// Filters in the caller's pipe set envelope fields here. The envelope is
/// frozen from it right before the native send.
pub struct SendContext<M> {
    message: M,
    destination: Destination,
    message_id: MessageId,
    correlation_id: Option<CorrelationId>,
    headers: Headers,
    time_to_live: Option<Duration>,
    priority: Option<u8>,
    durable: Option<bool>,
    content_type: String,
    cancellation: CancellationToken,
    payloads: Payloads,
    span: Span,
}

impl<M: Message> SendContext<M> {
    pub fn new(message: M, destination: Destination, cancellation: CancellationToken) -> Self {
        let message_id = MessageId::new();
        let correlation_id = message.correlation_id();
        let span = tracing::info_span!(
            "send",
            message_type = M::message_type(),
            destination = %destination,
            message_id = %message_id,
        );
        Self {
            message,
            destination,
            message_id,
            correlation_id,
            headers: Headers::new(),
            time_to_live: None,
            priority: None,
            durable: None,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            cancellation,
            payloads: Payloads::new(),
            span,
        }
    }

    pub fn message(&self) -> &M {
        &self.message
    }

    pub fn destination(&self) -> &Destination {
        &self.destination
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn set_message_id(&mut self, id: MessageId) {
        self.message_id = id;
    }

    pub fn set_correlation_id(&mut self, id: CorrelationId) {
        self.correlation_id = Some(id);
    }

    pub fn set_header(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.headers.insert(key.into(), value.into());
    }

    pub fn set_time_to_live(&mut self, ttl: Duration) {
        self.time_to_live = Some(ttl);
    }

    pub fn set_priority(&mut self, priority: u8) {
        self.priority = Some(priority);
    }

    pub fn set_durable(&mut self, durable: bool) {
        self.durable = Some(durable);
    }

    pub fn set_content_type(&mut self, content_type: impl Into<String>) {
        self.content_type = content_type.into();
    }

    fn event(&self) -> SendEvent {
        SendEvent {
            message_type: M::message_type(),
            destination: self.destination.to_string(),
            message_id: self.message_id,
            correlation_id: self.correlation_id,
            timestamp: Utc::now(),
        }
    }

    /// Freeze the populated fields into an immutable envelope.
    pub fn into_envelope(self) -> Envelope<M> {
        let mut envelope = Envelope::raw(self.message)
            .with_message_id(self.message_id)
            .with_headers(self.headers)
            .with_content_type(self.content_type)
            .with_sent_at(Utc::now());
        if let Some(id) = self.correlation_id {
            envelope = envelope.with_correlation_id(id);
        }
        if let Some(ttl) = self.time_to_live {
            envelope = envelope.with_time_to_live(ttl);
        }
        if let Some(priority) = self.priority {
            envelope = envelope.with_priority(priority);
        }
        if let Some(durable) = self.durable {
            envelope = envelope.with_durable(durable);
        }
        envelope
    }
}

impl<M: Message> PipeContext for SendContext<M> {
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
// Send Filter
// =============================================================================

/// Runs one send against a borrowed session.
struct SendFilter<B, M> {
    client: Arc<B>,
    destination: Destination,
    message: M,
    pipe: Pipe<SendContext<M>>,
    observers: SendObservers,
}

impl<B: BrokerClient, M: Message + Serialize> SendFilter<B, M> {
    async fn declare(&self, session: &mut BrokerSession<B>, token: &CancellationToken) -> Result<()> {
        if session.declared.contains(&self.destination) {
            return Ok(());
        }
        let client = &self.client;
        let destination = &self.destination;
        let inner = &mut session.session;
        cancellable(token, client.declare_destination(inner, destination)).await?;
        session.declared.insert(self.destination.clone());
        debug!(destination = %self.destination, "destination declared");
        Ok(())
    }

    async fn deliver(
        &self,
        session: &mut BrokerSession<B>,
        native: B::Native,
        token: &CancellationToken,
    ) -> Result<()> {
        let client = &self.client;
        let producer = match session.producers.entry(self.destination.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let created = cancellable(token, client.create_producer(&mut session.session, &self.destination)).await?;
                entry.insert(created)
            }
        };
        cancellable(token, client.send(producer, native)).await
    }
}

#[async_trait]
impl<B: BrokerClient, M: Message + Serialize> Filter<ResourceContext<BrokerSession<B>>> for SendFilter<B, M> {
    async fn send(
        &self,
        ctx: &mut ResourceContext<BrokerSession<B>>,
        next: Next<'_, ResourceContext<BrokerSession<B>>>,
    ) -> Result<()> {
        let token = ctx.cancellation().clone();

        if let Err(e) = self.declare(ctx.resource_mut(), &token).await {
            if self.client.is_session_fault(&e) {
                ctx.mark_faulted();
            }
            return Err(e);
        }

        let mut send_ctx = SendContext::new(self.message.clone(), self.destination.clone(), token.clone());
        self.pipe.send(&mut send_ctx).await?;

        let span = send_ctx.span().clone();
        let event = send_ctx.event();
        let envelope = send_ctx.into_envelope().encode()?;
        let native = self.client.to_native(envelope)?;

        self.observers.pre_send(&event).await;
        let result = self
            .deliver(ctx.resource_mut(), native, &token)
            .instrument(span.clone())
            .await;

        match result {
            Ok(()) => {
                debug!(parent: &span, "message sent");
                self.observers.post_send(&event).await;
            }
            Err(e) => {
                debug!(parent: &span, error = %e, "send failed");
                self.observers.send_fault(&event, &e).await;
                if self.client.is_session_fault(&e) {
                    ctx.mark_faulted();
                }
                return Err(e);
            }
        }

        next.send(ctx).await
    }

    fn probe(&self, probe: &mut ProbeContext) {
        probe_send::<B, M>(&self.client, &self.destination, &self.pipe, probe);
    }
}

fn probe_send<B: BrokerClient, M: Message>(
    client: &B,
    destination: &Destination,
    pipe: &Pipe<SendContext<M>>,
    probe: &mut ProbeContext,
) {
    probe.add(
        "send",
        serde_json::json!({
            "broker": client.kind(),
            "destination": destination.to_string(),
            "message_type": M::message_type(),
        }),
    );
    pipe.probe_into(probe);
}

// =============================================================================
// Send Transport
// =============================================================================

/// Sends typed messages through a broker client over pooled sessions.
///
/// # Example
///
/// ```ignore
/// let transport = SendTransport::new("orders", client, TransportConfig::from_env()?)?;
///
/// let stamp = Pipe::builder()
///     .execute(|ctx: &mut SendContext<OrderSubmitted>| {
///         ctx.set_header("tenant", "acme");
///         ctx.set_time_to_live(Duration::from_secs(300));
///         Ok(())
///     })
///     .build();
///
/// transport
///     .send(&Destination::queue("orders"), OrderSubmitted { order_id }, &stamp, shutdown.child_token())
///     .await?;
/// ```
pub struct SendTransport<B: BrokerClient> {
    client: Arc<B>,
    pool: ResourcePool<BrokerSession<B>>,
    observers: SendObservers,
}

impl<B: BrokerClient> SendTransport<B> {
    /// Build a transport with `config.session_count` session slots.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn new(name: impl Into<String>, client: B, config: TransportConfig) -> Result<Self> {
        let client = Arc::new(client);
        let pool = ResourcePool::new(name, config.pool.clone());
        for _ in 0..config.session_count.max(1) {
            pool.add(SessionFactory::new(client.clone()))?;
        }
        Ok(Self {
            client,
            pool,
            observers: SendObservers::new(),
        })
    }

    pub fn connect_send_observer<O: SendObserver>(&mut self, observer: O) {
        self.observers.connect(observer);
    }

    pub fn pool(&self) -> &ResourcePool<BrokerSession<B>> {
        &self.pool
    }

    /// Send `message` to `destination`, letting `pipe` populate the envelope.
    ///
    /// Broker faults propagate unchanged, after the send observers saw them.
    pub async fn send<M>(
        &self,
        destination: &Destination,
        message: M,
        pipe: &Pipe<SendContext<M>>,
        cancellation: CancellationToken,
    ) -> Result<()>
    where
        M: Message + Serialize,
    {
        let state = self.pool.state();
        if state != PoolState::Ready {
            return Err(TetherError::transport_unavailable(format!(
                "transport {} is {}",
                self.pool.name(),
                state
            ))
            .into());
        }

        let work = Pipe::single(SendFilter {
            client: self.client.clone(),
            destination: destination.clone(),
            message,
            pipe: pipe.clone(),
            observers: self.observers.clone(),
        });
        self.pool.send(&work, cancellation).await
    }

    /// Describe the send path for `M` to `destination`, including `pipe`.
    pub fn probe<M: Message>(&self, destination: &Destination, pipe: &Pipe<SendContext<M>>) -> serde_json::Value {
        let mut probe = ProbeContext::new();
        probe_send::<B, M>(&self.client, destination, pipe, &mut probe);
        probe.into_value()
    }

    /// Refuse new sends, drain in-flight ones and close every session.
    pub async fn stop(&self, reason: &str) -> Result<()> {
        self.pool.stop(reason).await
    }
}
