//! Core message types for tether.
//!
//! # Overview
//!
//! A [`Message`] is any typed payload that flows through a pipe. On the wire
//! and inside the pipes it travels in an [`Envelope`], which carries the
//! metadata brokers and sagas care about:
//!
//! - [`MessageId`] - unique per send
//! - [`CorrelationId`] - links a message to a saga instance
//! - headers, time-to-live, priority, durability and content type
//!
//! Envelopes are immutable once built. Filters read them, they never edit
//! them; outbound metadata is populated on a
//! [`SendContext`](crate::transport::SendContext) and frozen into an envelope
//! right before the broker client sees it.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Content type used when nothing else is configured.
pub const DEFAULT_CONTENT_TYPE: &str = "application/json";

/// Message headers. Insertion order is irrelevant.
pub type Headers = HashMap<String, serde_json::Value>;

// =============================================================================
// Identifiers
// =============================================================================

/// Correlation ID linking messages to a saga instance.
///
/// # Example
///
/// ```ignore
/// use tether::CorrelationId;
///
/// let cid = CorrelationId::new();
/// let same = CorrelationId::from(cid.into_inner());
/// assert_eq!(cid, same);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Create a new random correlation ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Get the inner UUID value.
    pub fn into_inner(self) -> Uuid {
        self.0
    }

    /// Get a reference to the inner UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for CorrelationId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl From<CorrelationId> for Uuid {
    fn from(cid: CorrelationId) -> Uuid {
        cid.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier assigned to a message when it is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Create a new random message ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn into_inner(self) -> Uuid {
        self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for MessageId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Message
// =============================================================================

/// A typed payload that can be consumed by sagas or sent through a transport.
///
/// Implement it explicitly for each message type. Messages that know their
/// own correlation (an order id, a booking id) override
/// [`Message::correlation_id`] so envelopes pick it up automatically.
///
/// # Example
///
/// ```ignore
/// #[derive(Debug, Clone, Serialize, Deserialize)]
/// struct OrderSubmitted {
///     order_id: Uuid,
/// }
///
/// impl Message for OrderSubmitted {
///     fn correlation_id(&self) -> Option<CorrelationId> {
///         Some(self.order_id.into())
///     }
/// }
/// ```
pub trait Message: Clone + Send + Sync + 'static {
    /// Correlation carried by the message body itself, if any.
    ///
    /// Returns `None` by default; the envelope's explicit correlation id is
    /// used instead.
    fn correlation_id(&self) -> Option<CorrelationId> {
        None
    }

    /// Stable name used in logs and observer events.
    fn message_type() -> &'static str {
        std::any::type_name::<Self>()
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// Immutable message envelope.
///
/// Built once (at send time, or by a receive transport when a message
/// arrives) and consumed read-only afterwards. The builder methods consume
/// the envelope, so there is no way to edit one that is already shared.
#[derive(Debug, Clone)]
pub struct Envelope<M> {
    payload: M,
    headers: Headers,
    message_id: Option<MessageId>,
    correlation_id: Option<CorrelationId>,
    time_to_live: Option<Duration>,
    priority: Option<u8>,
    durable: Option<bool>,
    content_type: String,
    sent_at: DateTime<Utc>,
}

impl<M: Message> Envelope<M> {
    /// Wrap a message, adopting its own correlation id if it has one.
    pub fn new(payload: M) -> Self {
        let correlation_id = payload.correlation_id();
        Self::from_parts(payload, correlation_id)
    }
}

impl<M> Envelope<M> {
    fn from_parts(payload: M, correlation_id: Option<CorrelationId>) -> Self {
        Self {
            payload,
            headers: Headers::new(),
            message_id: None,
            correlation_id,
            time_to_live: None,
            priority: None,
            durable: None,
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            sent_at: Utc::now(),
        }
    }

    /// Wrap a raw payload with no correlation.
    pub fn raw(payload: M) -> Self {
        Self::from_parts(payload, None)
    }

    pub fn with_message_id(mut self, id: MessageId) -> Self {
        self.message_id = Some(id);
        self
    }

    pub fn with_correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_time_to_live(mut self, ttl: Duration) -> Self {
        self.time_to_live = Some(ttl);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = Some(durable);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn with_sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.sent_at = sent_at;
        self
    }

    pub fn payload(&self) -> &M {
        &self.payload
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, key: &str) -> Option<&serde_json::Value> {
        self.headers.get(key)
    }

    pub fn message_id(&self) -> Option<MessageId> {
        self.message_id
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn time_to_live(&self) -> Option<Duration> {
        self.time_to_live
    }

    pub fn priority(&self) -> Option<u8> {
        self.priority
    }

    pub fn durable(&self) -> Option<bool> {
        self.durable
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    pub fn sent_at(&self) -> DateTime<Utc> {
        self.sent_at
    }

    /// Replace the payload while keeping every piece of metadata.
    pub fn map_payload<T>(self, f: impl FnOnce(M) -> T) -> Envelope<T> {
        Envelope {
            payload: f(self.payload),
            headers: self.headers,
            message_id: self.message_id,
            correlation_id: self.correlation_id,
            time_to_live: self.time_to_live,
            priority: self.priority,
            durable: self.durable,
            content_type: self.content_type,
            sent_at: self.sent_at,
        }
    }
}

impl<M: Serialize> Envelope<M> {
    /// Serialize the payload into a JSON body, keeping the metadata.
    ///
    /// This is the last generic step before a broker client turns the
    /// envelope into its native representation.
    pub fn encode(self) -> serde_json::Result<Envelope<Vec<u8>>> {
        let body = serde_json::to_vec(&self.payload)?;
        Ok(self.map_payload(|_| body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Serialize)]
    struct Plain {
        value: i32,
    }
    impl Message for Plain {}

    #[derive(Debug, Clone)]
    struct SelfCorrelated {
        order_id: Uuid,
    }
    impl Message for SelfCorrelated {
        fn correlation_id(&self) -> Option<CorrelationId> {
            Some(self.order_id.into())
        }
    }

    #[test]
    fn test_envelope_defaults() {
        let envelope = Envelope::new(Plain { value: 1 });
        assert!(envelope.correlation_id().is_none());
        assert!(envelope.message_id().is_none());
        assert_eq!(envelope.content_type(), DEFAULT_CONTENT_TYPE);
        assert!(envelope.headers().is_empty());
    }

    #[test]
    fn test_envelope_adopts_message_correlation() {
        let order_id = Uuid::new_v4();
        let envelope = Envelope::new(SelfCorrelated { order_id });
        assert_eq!(envelope.correlation_id(), Some(CorrelationId::from(order_id)));
    }

    #[test]
    fn test_explicit_correlation_wins() {
        let explicit = CorrelationId::new();
        let envelope = Envelope::new(SelfCorrelated {
            order_id: Uuid::new_v4(),
        })
        .with_correlation_id(explicit);
        assert_eq!(envelope.correlation_id(), Some(explicit));
    }

    #[test]
    fn test_encode_keeps_metadata() {
        let id = MessageId::new();
        let envelope = Envelope::new(Plain { value: 7 })
            .with_message_id(id)
            .with_header("tenant", "acme")
            .with_priority(4)
            .with_time_to_live(Duration::from_secs(30));

        let encoded = envelope.encode().unwrap();
        assert_eq!(encoded.payload().as_slice(), br#"{"value":7}"#);
        assert_eq!(encoded.message_id(), Some(id));
        assert_eq!(encoded.header("tenant"), Some(&serde_json::json!("acme")));
        assert_eq!(encoded.priority(), Some(4));
        assert_eq!(encoded.time_to_live(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_correlation_id_display_is_uuid() {
        let uuid = Uuid::new_v4();
        assert_eq!(CorrelationId::from(uuid).to_string(), uuid.to_string());
    }
}
