//! In-memory test doubles for stores and brokers.
//!
//! # Feature Flag
//!
//! This module is only available with the `testing` feature:
//!
//! ```toml
//! [dev-dependencies]
//! tether = { version = "0.1", features = ["testing"] }
//! ```
//!
//! # Saga Stores
//!
//! [`InMemorySagaStore`] honours the full [`SagaStore`] contract: inserts
//! claim the id atomically and replaces check the revision under the entry
//! lock. [`RecordingSagaStore`] wraps it and counts every call, so tests can
//! assert on exactly what the repository asked the store to do.
//!
//! ```ignore
//! let store = Arc::new(RecordingSagaStore::<OrderState>::new());
//! let repository = SagaRepository::from_shared(store.clone());
//!
//! repository.dispatch(&mut ctx, &policy, &next).await?;
//!
//! assert_eq!(store.inserts(), 1);
//! assert_eq!(store.replaces(), 0);
//! ```
//!
//! # Brokers
//!
//! [`InMemoryBroker`] records declarations and sent envelopes, and can be
//! told to fail upcoming sends, with or without losing the session.
//!
//! ```ignore
//! let broker = InMemoryBroker::new();
//! let transport = SendTransport::new("orders", broker.clone(), TransportConfig::default())?;
//!
//! broker.fail_next_sends(1, true);
//! assert!(transport.send(&queue, msg, &Pipe::empty(), token).await.is_err());
//! assert_eq!(broker.sessions_closed(), 1);
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::stream::{self, BoxStream, StreamExt};
use thiserror::Error;

use crate::core::{CorrelationId, Envelope};
use crate::persistence::{Revision, SagaStore, StoreError, Versioned};
use crate::saga::{Saga, SagaQuery};
use crate::transport::{BrokerClient, Destination};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// =============================================================================
// In-Memory Saga Store
// =============================================================================

/// A [`SagaStore`] backed by a concurrent map.
pub struct InMemorySagaStore<S> {
    instances: DashMap<CorrelationId, Versioned<S>>,
    fail_writes: AtomicBool,
}

impl<S: Saga> InMemorySagaStore<S> {
    pub fn new() -> Self {
        Self {
            instances: DashMap::new(),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Store `saga` directly at the first revision, bypassing the contract checks.
    pub fn seed(&self, saga: S) -> Revision {
        let revision = Revision::new(1);
        self.instances
            .insert(saga.correlation_id(), Versioned::new(saga, revision));
        revision
    }

    pub fn get(&self, id: CorrelationId) -> Option<Versioned<S>> {
        self.instances.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Bump the stored revision, as if another writer committed.
    pub fn touch(&self, id: CorrelationId) {
        if let Some(mut entry) = self.instances.get_mut(&id) {
            entry.revision = entry.revision.next();
        }
    }

    /// Make inserts, replaces and deletes fail with a backend error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend(anyhow!("injected write failure")));
        }
        Ok(())
    }
}

impl<S: Saga> Default for InMemorySagaStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: Saga> SagaStore<S> for InMemorySagaStore<S> {
    fn kind(&self) -> &'static str {
        "in-memory"
    }

    async fn load(&self, id: CorrelationId) -> Result<Option<Versioned<S>>, StoreError> {
        Ok(self.get(id))
    }

    async fn insert(&self, saga: &S) -> Result<Revision, StoreError> {
        self.check_writable()?;
        match self.instances.entry(saga.correlation_id()) {
            Entry::Occupied(_) => Err(StoreError::DuplicateKey),
            Entry::Vacant(entry) => {
                let revision = Revision::new(1);
                entry.insert(Versioned::new(saga.clone(), revision));
                Ok(revision)
            }
        }
    }

    async fn replace(&self, saga: &S, expected: Revision) -> Result<Revision, StoreError> {
        self.check_writable()?;
        let mut entry = self
            .instances
            .get_mut(&saga.correlation_id())
            .ok_or(StoreError::NotFound)?;
        if entry.revision != expected {
            return Err(StoreError::Conflict);
        }
        let revision = expected.next();
        *entry = Versioned::new(saga.clone(), revision);
        Ok(revision)
    }

    async fn delete(&self, id: CorrelationId) -> Result<(), StoreError> {
        self.check_writable()?;
        self.instances.remove(&id);
        Ok(())
    }

    async fn query(
        &self,
        query: &SagaQuery<S>,
    ) -> Result<BoxStream<'static, Result<Versioned<S>, StoreError>>, StoreError> {
        let matches: Vec<_> = self
            .instances
            .iter()
            .filter(|entry| query.matches(&entry.saga))
            .map(|entry| Ok(entry.value().clone()))
            .collect();
        Ok(stream::iter(matches).boxed())
    }
}

// =============================================================================
// Recording Saga Store
// =============================================================================

/// Wraps an [`InMemorySagaStore`] and records every call made to it.
pub struct RecordingSagaStore<S> {
    inner: InMemorySagaStore<S>,
    calls: AtomicUsize,
    loads: AtomicUsize,
    inserts: AtomicUsize,
    duplicate_inserts: AtomicUsize,
    deletes: AtomicUsize,
    queries: AtomicUsize,
    replace_revisions: Mutex<Vec<Revision>>,
}

impl<S: Saga> RecordingSagaStore<S> {
    pub fn new() -> Self {
        Self {
            inner: InMemorySagaStore::new(),
            calls: AtomicUsize::new(0),
            loads: AtomicUsize::new(0),
            inserts: AtomicUsize::new(0),
            duplicate_inserts: AtomicUsize::new(0),
            deletes: AtomicUsize::new(0),
            queries: AtomicUsize::new(0),
            replace_revisions: Mutex::new(Vec::new()),
        }
    }

    pub fn inner(&self) -> &InMemorySagaStore<S> {
        &self.inner
    }

    /// Calls of any kind.
    pub fn total_calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Inserts that succeeded.
    pub fn inserts(&self) -> usize {
        self.inserts.load(Ordering::SeqCst)
    }

    /// Inserts rejected with [`StoreError::DuplicateKey`].
    pub fn duplicate_inserts(&self) -> usize {
        self.duplicate_inserts.load(Ordering::SeqCst)
    }

    /// Replace attempts, whatever their outcome.
    pub fn replaces(&self) -> usize {
        lock(&self.replace_revisions).len()
    }

    /// The expected revision passed to each replace attempt, in call order.
    pub fn replace_revisions(&self) -> Vec<Revision> {
        lock(&self.replace_revisions).clone()
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl<S: Saga> Default for RecordingSagaStore<S> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<S: Saga> SagaStore<S> for RecordingSagaStore<S> {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    async fn load(&self, id: CorrelationId) -> Result<Option<Versioned<S>>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.inner.load(id).await
    }

    async fn insert(&self, saga: &S) -> Result<Revision, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let result = self.inner.insert(saga).await;
        match &result {
            Ok(_) => {
                self.inserts.fetch_add(1, Ordering::SeqCst);
            }
            Err(StoreError::DuplicateKey) => {
                self.duplicate_inserts.fetch_add(1, Ordering::SeqCst);
            }
            Err(_) => {}
        }
        result
    }

    async fn replace(&self, saga: &S, expected: Revision) -> Result<Revision, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        lock(&self.replace_revisions).push(expected);
        self.inner.replace(saga, expected).await
    }

    async fn delete(&self, id: CorrelationId) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.inner.delete(id).await
    }

    async fn query(
        &self,
        query: &SagaQuery<S>,
    ) -> Result<BoxStream<'static, Result<Versioned<S>, StoreError>>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.query(query).await
    }
}

// =============================================================================
// In-Memory Broker
// =============================================================================

/// Failures the in-memory broker can be told to produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InMemoryBrokerError {
    #[error("broker rejected message")]
    Rejected,
    #[error("broker session lost")]
    SessionLost,
}

/// An envelope the broker accepted.
#[derive(Debug, Clone)]
pub struct SentMessage {
    pub destination: Destination,
    pub envelope: Envelope<Vec<u8>>,
}

#[derive(Debug)]
pub struct InMemorySession {
    pub id: usize,
}

#[derive(Debug)]
pub struct InMemoryProducer {
    destination: Destination,
}

#[derive(Default)]
struct BrokerState {
    sessions_opened: AtomicUsize,
    sessions_closed: AtomicUsize,
    producers_created: AtomicUsize,
    declarations: Mutex<Vec<Destination>>,
    sent: Mutex<Vec<SentMessage>>,
    pending_failures: Mutex<Option<(usize, InMemoryBrokerError)>>,
    send_delay: Mutex<Option<Duration>>,
}

/// A [`BrokerClient`] that keeps everything in memory.
///
/// Clones share state, so a test can keep one handle while the transport
/// owns another.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sessions_opened(&self) -> usize {
        self.state.sessions_opened.load(Ordering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.state.sessions_closed.load(Ordering::SeqCst)
    }

    pub fn producers_created(&self) -> usize {
        self.state.producers_created.load(Ordering::SeqCst)
    }

    /// Every destination declaration, in call order.
    pub fn declarations(&self) -> Vec<Destination> {
        lock(&self.state.declarations).clone()
    }

    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.state.sent).clone()
    }

    /// Fail the next `count` sends. With `session_lost` the failure also
    /// counts as a session fault.
    pub fn fail_next_sends(&self, count: usize, session_lost: bool) {
        let error = if session_lost {
            InMemoryBrokerError::SessionLost
        } else {
            InMemoryBrokerError::Rejected
        };
        *lock(&self.state.pending_failures) = (count > 0).then_some((count, error));
    }

    /// Hold every send for `delay` before accepting it.
    pub fn set_send_delay(&self, delay: Duration) {
        *lock(&self.state.send_delay) = Some(delay);
    }

    fn take_failure(&self) -> Option<InMemoryBrokerError> {
        let mut pending = lock(&self.state.pending_failures);
        let (remaining, error) = pending.take()?;
        if remaining > 1 {
            *pending = Some((remaining - 1, error));
        }
        Some(error)
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    type Session = InMemorySession;
    type Producer = InMemoryProducer;
    type Native = Envelope<Vec<u8>>;

    fn kind(&self) -> &'static str {
        "in-memory"
    }

    async fn open_session(&self) -> Result<InMemorySession> {
        let id = self.state.sessions_opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(InMemorySession { id })
    }

    async fn close_session(&self, _session: InMemorySession) -> Result<()> {
        self.state.sessions_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn declare_destination(&self, _session: &mut InMemorySession, destination: &Destination) -> Result<()> {
        lock(&self.state.declarations).push(destination.clone());
        Ok(())
    }

    async fn create_producer(&self, _session: &mut InMemorySession, destination: &Destination) -> Result<InMemoryProducer> {
        self.state.producers_created.fetch_add(1, Ordering::SeqCst);
        Ok(InMemoryProducer {
            destination: destination.clone(),
        })
    }

    fn to_native(&self, envelope: Envelope<Vec<u8>>) -> Result<Envelope<Vec<u8>>> {
        Ok(envelope)
    }

    async fn send(&self, producer: &mut InMemoryProducer, message: Envelope<Vec<u8>>) -> Result<()> {
        let delay = *lock(&self.state.send_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(error) = self.take_failure() {
            return Err(error.into());
        }
        lock(&self.state.sent).push(SentMessage {
            destination: producer.destination.clone(),
            envelope: message,
        });
        Ok(())
    }

    fn is_session_fault(&self, error: &anyhow::Error) -> bool {
        matches!(
            error.downcast_ref::<InMemoryBrokerError>(),
            Some(InMemoryBrokerError::SessionLost)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone)]
    struct Counter {
        id: CorrelationId,
        hits: u32,
    }

    impl Saga for Counter {
        fn correlation_id(&self) -> CorrelationId {
            self.id
        }
    }

    #[tokio::test]
    async fn test_store_insert_claims_id_once() {
        let store = InMemorySagaStore::new();
        let saga = Counter {
            id: CorrelationId::new(),
            hits: 0,
        };

        assert_eq!(store.insert(&saga).await.unwrap(), Revision::new(1));
        assert!(matches!(store.insert(&saga).await, Err(StoreError::DuplicateKey)));
    }

    #[tokio::test]
    async fn test_store_replace_checks_revision() {
        let store = InMemorySagaStore::new();
        let mut saga = Counter {
            id: CorrelationId::new(),
            hits: 0,
        };
        let first = store.seed(saga.clone());

        saga.hits = 1;
        let second = store.replace(&saga, first).await.unwrap();
        assert_eq!(second, first.next());

        saga.hits = 2;
        assert!(matches!(store.replace(&saga, first).await, Err(StoreError::Conflict)));
        assert_eq!(store.get(saga.id).unwrap().saga.hits, 1);
    }

    #[tokio::test]
    async fn test_store_replace_absent_is_not_found() {
        let store = InMemorySagaStore::new();
        let saga = Counter {
            id: CorrelationId::new(),
            hits: 0,
        };
        assert!(matches!(
            store.replace(&saga, Revision::new(1)).await,
            Err(StoreError::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_failed_writes_leave_reads_working() {
        let store = InMemorySagaStore::new();
        let saga = Counter {
            id: CorrelationId::new(),
            hits: 3,
        };
        store.seed(saga.clone());
        store.fail_writes(true);

        assert!(matches!(store.delete(saga.id).await, Err(StoreError::Backend(_))));
        assert_eq!(store.load(saga.id).await.unwrap().unwrap().saga.hits, 3);
    }

    #[tokio::test]
    async fn test_broker_failures_count_down() {
        let broker = InMemoryBroker::new();
        let mut session = broker.open_session().await.unwrap();
        let queue = Destination::queue("jobs");
        let mut producer = broker.create_producer(&mut session, &queue).await.unwrap();

        broker.fail_next_sends(2, false);
        for _ in 0..2 {
            let err = broker
                .send(&mut producer, Envelope::raw(Vec::new()))
                .await
                .unwrap_err();
            assert!(!broker.is_session_fault(&err));
        }
        broker.send(&mut producer, Envelope::raw(Vec::new())).await.unwrap();

        assert_eq!(broker.sent().len(), 1);
        assert_eq!(broker.sent()[0].destination, queue);
    }
}
