//! Send and consume observers.
//!
//! Observers watch messages go by without taking part in processing:
//!
//! | Role      | Purpose                | Can fail the send? | Can mutate? |
//! |-----------|------------------------|--------------------|-------------|
//! | Filter    | Process the message    | yes                | context     |
//! | Observer  | Watch the message      | no                 | no          |
//!
//! Observer errors are logged with `warn!` and dropped. They never change the
//! outcome of the send or consume they observe.
//!
//! # Example
//!
//! ```ignore
//! use tether::{SendEvent, SendObserver};
//!
//! struct SendLatency {
//!     histogram: Histogram,
//! }
//!
//! #[async_trait]
//! impl SendObserver for SendLatency {
//!     async fn post_send(&self, event: &SendEvent) -> Result<()> {
//!         self.histogram.record(Utc::now() - event.timestamp);
//!         Ok(())
//!     }
//! }
//!
//! transport.connect_send_observer(SendLatency { histogram });
//! ```

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;

use crate::context::{ConsumeContext, PipeContext};
use crate::core::{CorrelationId, Message, MessageId};
use crate::pipe::{Filter, Next, ProbeContext};

// =============================================================================
// Events
// =============================================================================

/// What an observer learns about an outbound message.
#[derive(Debug, Clone)]
pub struct SendEvent {
    pub message_type: &'static str,
    pub destination: String,
    pub message_id: MessageId,
    pub correlation_id: Option<CorrelationId>,
    pub timestamp: DateTime<Utc>,
}

/// What an observer learns about an inbound message.
#[derive(Debug, Clone)]
pub struct ConsumeEvent {
    pub message_type: &'static str,
    pub message_id: Option<MessageId>,
    pub correlation_id: Option<CorrelationId>,
    pub timestamp: DateTime<Utc>,
}

impl ConsumeEvent {
    pub fn from_context<M: Message>(ctx: &ConsumeContext<M>) -> Self {
        Self {
            message_type: M::message_type(),
            message_id: ctx.message_id(),
            correlation_id: ctx.correlation_id(),
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// Observer Traits
// =============================================================================

/// Watches outbound messages around the broker send.
#[async_trait]
pub trait SendObserver: Send + Sync + 'static {
    /// Called right before the native send.
    async fn pre_send(&self, _event: &SendEvent) -> Result<()> {
        Ok(())
    }

    /// Called after the broker accepted the message.
    async fn post_send(&self, _event: &SendEvent) -> Result<()> {
        Ok(())
    }

    /// Called when the native send failed, before the failure propagates.
    async fn send_fault(&self, _event: &SendEvent, _error: &anyhow::Error) -> Result<()> {
        Ok(())
    }
}

/// Watches inbound messages around a consume pipe.
#[async_trait]
pub trait ConsumeObserver: Send + Sync + 'static {
    async fn pre_consume(&self, _event: &ConsumeEvent) -> Result<()> {
        Ok(())
    }

    async fn post_consume(&self, _event: &ConsumeEvent) -> Result<()> {
        Ok(())
    }

    async fn consume_fault(&self, _event: &ConsumeEvent, _error: &anyhow::Error) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Observer Sets
// =============================================================================

/// The send observers connected to a transport.
#[derive(Clone, Default)]
pub struct SendObservers {
    observers: Vec<(&'static str, Arc<dyn SendObserver>)>,
}

impl SendObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect<O: SendObserver>(&mut self, observer: O) {
        self.observers
            .push((std::any::type_name::<O>(), Arc::new(observer)));
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub async fn pre_send(&self, event: &SendEvent) {
        for (name, observer) in &self.observers {
            if let Err(e) = observer.pre_send(event).await {
                warn!(observer = name, hook = "pre_send", error = %e, "send observer failed");
            }
        }
    }

    pub async fn post_send(&self, event: &SendEvent) {
        for (name, observer) in &self.observers {
            if let Err(e) = observer.post_send(event).await {
                warn!(observer = name, hook = "post_send", error = %e, "send observer failed");
            }
        }
    }

    pub async fn send_fault(&self, event: &SendEvent, error: &anyhow::Error) {
        for (name, observer) in &self.observers {
            if let Err(e) = observer.send_fault(event, error).await {
                warn!(observer = name, hook = "send_fault", error = %e, "send observer failed");
            }
        }
    }
}

impl std::fmt::Debug for SendObservers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.observers.iter().map(|(name, _)| *name).collect();
        f.debug_struct("SendObservers").field("observers", &names).finish()
    }
}

/// A set of consume observers.
#[derive(Clone, Default)]
pub struct ConsumeObservers {
    observers: Vec<(&'static str, Arc<dyn ConsumeObserver>)>,
}

impl ConsumeObservers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect<O: ConsumeObserver>(&mut self, observer: O) {
        self.observers
            .push((std::any::type_name::<O>(), Arc::new(observer)));
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    async fn pre_consume(&self, event: &ConsumeEvent) {
        for (name, observer) in &self.observers {
            if let Err(e) = observer.pre_consume(event).await {
                warn!(observer = name, hook = "pre_consume", error = %e, "consume observer failed");
            }
        }
    }

    async fn post_consume(&self, event: &ConsumeEvent) {
        for (name, observer) in &self.observers {
            if let Err(e) = observer.post_consume(event).await {
                warn!(observer = name, hook = "post_consume", error = %e, "consume observer failed");
            }
        }
    }

    async fn consume_fault(&self, event: &ConsumeEvent, error: &anyhow::Error) {
        for (name, observer) in &self.observers {
            if let Err(e) = observer.consume_fault(event, error).await {
                warn!(observer = name, hook = "consume_fault", error = %e, "consume observer failed");
            }
        }
    }
}

// =============================================================================
// Consume Observer Filter
// =============================================================================

/// Notifies consume observers around the rest of the pipe.
///
/// Put it first in a receive pipe so it sees every outcome.
pub struct ConsumeObserverFilter {
    observers: ConsumeObservers,
}

impl ConsumeObserverFilter {
    pub fn new(observers: ConsumeObservers) -> Self {
        Self { observers }
    }
}

#[async_trait]
impl<M: Message> Filter<ConsumeContext<M>> for ConsumeObserverFilter {
    async fn send(&self, ctx: &mut ConsumeContext<M>, next: Next<'_, ConsumeContext<M>>) -> Result<()> {
        let event = ConsumeEvent::from_context(ctx);
        self.observers.pre_consume(&event).await;

        let result = next.send(ctx).await;
        match &result {
            Ok(()) => self.observers.post_consume(&event).await,
            Err(e) => {
                if !ctx.is_cancelled() {
                    self.observers.consume_fault(&event, e).await;
                }
            }
        }
        result
    }

    fn probe(&self, probe: &mut ProbeContext) {
        probe.add(
            "consume-observer",
            serde_json::json!({ "observers": self.observers.len() }),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Envelope;
    use crate::pipe::Pipe;
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct Ping;
    impl Message for Ping {}

    #[derive(Default)]
    struct Journal {
        hooks: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl ConsumeObserver for Arc<Journal> {
        async fn pre_consume(&self, _event: &ConsumeEvent) -> Result<()> {
            self.hooks.lock().unwrap().push("pre");
            Ok(())
        }

        async fn post_consume(&self, _event: &ConsumeEvent) -> Result<()> {
            self.hooks.lock().unwrap().push("post");
            Ok(())
        }

        async fn consume_fault(&self, _event: &ConsumeEvent, _error: &anyhow::Error) -> Result<()> {
            self.hooks.lock().unwrap().push("fault");
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl ConsumeObserver for Broken {
        async fn pre_consume(&self, _event: &ConsumeEvent) -> Result<()> {
            anyhow::bail!("metrics sink offline")
        }
    }

    #[async_trait]
    impl SendObserver for Broken {
        async fn pre_send(&self, _event: &SendEvent) -> Result<()> {
            anyhow::bail!("metrics sink offline")
        }
    }

    fn observed(journal: &Arc<Journal>) -> ConsumeObserverFilter {
        let mut observers = ConsumeObservers::new();
        observers.connect(Broken);
        observers.connect(journal.clone());
        ConsumeObserverFilter::new(observers)
    }

    #[tokio::test]
    async fn test_consume_observers_see_success() {
        let journal = Arc::new(Journal::default());
        let pipe: Pipe<ConsumeContext<Ping>> = Pipe::builder().add_filter(observed(&journal)).build();

        pipe.send(&mut ConsumeContext::new(Envelope::new(Ping))).await.unwrap();

        assert_eq!(*journal.hooks.lock().unwrap(), vec!["pre", "post"]);
    }

    #[tokio::test]
    async fn test_consume_observers_see_fault_and_error_is_unchanged() {
        let journal = Arc::new(Journal::default());
        let pipe: Pipe<ConsumeContext<Ping>> = Pipe::builder()
            .add_filter(observed(&journal))
            .execute(|_: &mut ConsumeContext<Ping>| Err(anyhow::anyhow!("handler failed")))
            .build();

        let err = pipe
            .send(&mut ConsumeContext::new(Envelope::new(Ping)))
            .await
            .unwrap_err();

        assert_eq!(err.to_string(), "handler failed");
        assert_eq!(*journal.hooks.lock().unwrap(), vec!["pre", "fault"]);
    }

    #[tokio::test]
    async fn test_failing_send_observer_is_only_logged() {
        let mut observers = SendObservers::new();
        observers.connect(Broken);

        let event = SendEvent {
            message_type: "Ping",
            destination: "queue:pings".to_string(),
            message_id: MessageId::new(),
            correlation_id: None,
            timestamp: Utc::now(),
        };

        observers.pre_send(&event).await;
        observers.post_send(&event).await;
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn test_observer_filter_probe() {
        let journal = Arc::new(Journal::default());
        let pipe: Pipe<ConsumeContext<Ping>> = Pipe::single(observed(&journal));
        let probe = pipe.probe();
        assert_eq!(probe["filters"][0]["filter"], "consume-observer");
        assert_eq!(probe["filters"][0]["data"]["observers"], 2);
    }
}
