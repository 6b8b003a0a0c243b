//! Stress tests for the concurrency guarantees.
//!
//! These run many deliveries and sends at once on a multi-threaded runtime
//! and check what must hold regardless of interleaving.

#[cfg(test)]
mod stress_tests {
    use crate::config::{RetryConfig, TransportConfig};
    use crate::context::ConsumeContext;
    use crate::core::{CorrelationId, Envelope, Message};
    use crate::error::{is_cancelled, TetherError};
    use crate::filters::RetryFilter;
    use crate::pipe::{Filter, Next, Pipe};
    use crate::policy::NewOrExistingPolicy;
    use crate::repository::{CorrelatedSagaFilter, SagaRepository};
    use crate::saga::{Saga, SagaConsumeContext};
    use crate::testing::{InMemoryBroker, RecordingSagaStore};
    use crate::transport::{Destination, SendTransport};
    use anyhow::Result;
    use serde::Serialize;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    // ==========================================================================
    // Test Types
    // ==========================================================================

    #[derive(Debug, Clone, Serialize)]
    struct Tick {
        counter_id: CorrelationId,
    }

    impl Message for Tick {
        fn correlation_id(&self) -> Option<CorrelationId> {
            Some(self.counter_id)
        }
    }

    #[derive(Debug, Clone)]
    struct Counter {
        id: CorrelationId,
        ticks: u32,
    }

    impl Saga for Counter {
        fn correlation_id(&self) -> CorrelationId {
            self.id
        }
    }

    type Ctx = SagaConsumeContext<Counter, Tick>;

    /// Sleeps a random few milliseconds to shake up interleavings.
    struct Jitter {
        max_ms: u64,
    }

    #[async_trait::async_trait]
    impl Filter<Ctx> for Jitter {
        async fn send(&self, ctx: &mut Ctx, next: Next<'_, Ctx>) -> Result<()> {
            tokio::time::sleep(Duration::from_millis(fastrand::u64(0..=self.max_ms))).await;
            next.send(ctx).await
        }
    }

    fn tick_pipe() -> Pipe<Ctx> {
        Pipe::builder()
            .add_filter(Jitter { max_ms: 3 })
            .execute(|ctx: &mut Ctx| {
                ctx.saga_mut().ticks += 1;
                Ok(())
            })
            .build()
    }

    fn policy() -> NewOrExistingPolicy<Counter, Tick> {
        NewOrExistingPolicy::new(|id, _: &Tick| Counter { id, ticks: 0 })
    }

    fn tick(id: CorrelationId) -> ConsumeContext<Tick> {
        ConsumeContext::new(Envelope::new(Tick { counter_id: id }))
    }

    /// `RUST_LOG=tether=debug cargo test stress` shows the conflict and drain logs.
    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    // ==========================================================================
    // Saga Races
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_first_delivery_inserts_once() {
        init_tracing();
        let store = Arc::new(RecordingSagaStore::<Counter>::new());
        let repository = SagaRepository::from_shared(store.clone());
        let policy = Arc::new(policy().with_insert_on_initial(true));
        let next = tick_pipe();
        let id = CorrelationId::new();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let repository = repository.clone();
            let policy = policy.clone();
            let next = next.clone();
            handles.push(tokio::spawn(async move {
                repository.dispatch(&mut tick(id), policy.as_ref(), &next).await
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => succeeded += 1,
                Err(e) => assert!(
                    matches!(
                        e.downcast_ref::<TetherError>(),
                        Some(TetherError::ConcurrencyConflict { .. })
                    ),
                    "unexpected error: {:#}",
                    e
                ),
            }
        }

        assert_eq!(store.inserts(), 1);
        assert_eq!(store.duplicate_inserts(), 31);
        assert_eq!(store.inner().len(), 1);
        // Every successful write was based on the one before it.
        assert_eq!(store.inner().get(id).unwrap().saga.ticks, succeeded);
        assert!(succeeded >= 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_missing_path_stores_one_instance() {
        init_tracing();
        let store = Arc::new(RecordingSagaStore::<Counter>::new());
        let repository = SagaRepository::from_shared(store.clone());
        let policy = Arc::new(policy());
        let next = tick_pipe();
        let id = CorrelationId::new();

        let mut handles = Vec::new();
        for _ in 0..16 {
            let repository = repository.clone();
            let policy = policy.clone();
            let next = next.clone();
            handles.push(tokio::spawn(async move {
                repository.dispatch(&mut tick(id), policy.as_ref(), &next).await
            }));
        }

        for handle in handles {
            if let Err(e) = handle.await.unwrap() {
                assert!(matches!(
                    e.downcast_ref::<TetherError>(),
                    Some(TetherError::ConcurrencyConflict { .. })
                ));
            }
        }

        assert_eq!(store.inserts(), 1);
        assert_eq!(store.inner().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_retry_resolves_conflicts_without_lost_updates() {
        init_tracing();
        let store = Arc::new(RecordingSagaStore::<Counter>::new());
        let repository = SagaRepository::from_shared(store.clone());
        let id = CorrelationId::new();
        store.inner().seed(Counter { id, ticks: 0 });

        let pipe: Pipe<ConsumeContext<Tick>> = Pipe::builder()
            .add_filter(RetryFilter::new(RetryConfig::immediate(100)))
            .add_filter(CorrelatedSagaFilter::new(repository, policy(), tick_pipe()))
            .build();

        let mut handles = Vec::new();
        for _ in 0..20 {
            let pipe = pipe.clone();
            handles.push(tokio::spawn(async move { pipe.send(&mut tick(id)).await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(store.inner().get(id).unwrap().saga.ticks, 20);
    }

    // ==========================================================================
    // Transport Shutdown
    // ==========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stop_mid_flight_drains_entered_sends() {
        init_tracing();
        let broker = InMemoryBroker::new();
        broker.set_send_delay(Duration::from_millis(5));
        let transport = Arc::new(
            SendTransport::new(
                "stress",
                broker.clone(),
                TransportConfig::default().with_session_count(3),
            )
            .unwrap(),
        );
        let destination = Destination::queue("ticks");

        let mut handles = Vec::new();
        for _ in 0..40 {
            let transport = transport.clone();
            let destination = destination.clone();
            handles.push(tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(fastrand::u64(0..20))).await;
                let message = Tick {
                    counter_id: CorrelationId::new(),
                };
                transport
                    .send(&destination, message, &Pipe::empty(), CancellationToken::new())
                    .await
            }));
        }

        tokio::time::sleep(Duration::from_millis(10)).await;
        transport.stop("stress").await.unwrap();

        let mut delivered = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(()) => delivered += 1,
                Err(e) => assert!(
                    matches!(
                        e.downcast_ref::<TetherError>(),
                        Some(TetherError::TransportUnavailable { .. })
                    ),
                    "unexpected error: {:#}",
                    e
                ),
            }
        }

        assert_eq!(broker.sent().len(), delivered);
        assert_eq!(transport.pool().inflight(), 0);
        assert_eq!(broker.sessions_closed(), broker.sessions_opened());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_session_faults_under_load_recover() {
        init_tracing();
        let broker = InMemoryBroker::new();
        let transport = Arc::new(
            SendTransport::new(
                "stress",
                broker.clone(),
                TransportConfig::default().with_session_count(2),
            )
            .unwrap(),
        );
        broker.fail_next_sends(5, true);

        let mut handles = Vec::new();
        for _ in 0..30 {
            let transport = transport.clone();
            handles.push(tokio::spawn(async move {
                let message = Tick {
                    counter_id: CorrelationId::new(),
                };
                transport
                    .send(&Destination::topic("ticks"), message, &Pipe::empty(), CancellationToken::new())
                    .await
            }));
        }

        let mut failed = 0;
        for handle in handles {
            if handle.await.unwrap().is_err() {
                failed += 1;
            }
        }

        assert_eq!(failed, 5);
        assert_eq!(broker.sent().len(), 25);
        // Two initial sessions plus one replacement per lost session.
        assert_eq!(broker.sessions_opened(), 7);
        assert_eq!(broker.sessions_closed(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancelled_and_aborted_sends_never_wedge_sessions() {
        init_tracing();
        let broker = InMemoryBroker::new();
        broker.set_send_delay(Duration::from_millis(1));
        let transport = Arc::new(
            SendTransport::new(
                "stress",
                broker.clone(),
                TransportConfig::default().with_session_count(2),
            )
            .unwrap(),
        );
        let destination = Destination::queue("ticks");

        let mut handles = Vec::new();
        for i in 0..60 {
            let transport = transport.clone();
            let destination = destination.clone();
            let token = CancellationToken::new();
            let cancel = token.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(fastrand::u64(0..5))).await;
                cancel.cancel();
            });
            let handle = tokio::spawn(async move {
                let message = Tick {
                    counter_id: CorrelationId::new(),
                };
                transport.send(&destination, message, &Pipe::empty(), token).await
            });
            if i % 3 == 0 {
                let abort = handle.abort_handle();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(fastrand::u64(0..5))).await;
                    abort.abort();
                });
            }
            handles.push(handle);
        }

        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => assert!(is_cancelled(&e), "unexpected error: {:#}", e),
                Err(join) => assert!(join.is_cancelled()),
            }
        }

        // Every session is still lendable: one send per session goes through.
        for _ in 0..2 {
            let message = Tick {
                counter_id: CorrelationId::new(),
            };
            tokio::time::timeout(
                Duration::from_secs(2),
                transport.send(&destination, message, &Pipe::empty(), CancellationToken::new()),
            )
            .await
            .expect("a session stayed lent after its borrower went away")
            .unwrap();
        }
        assert_eq!(transport.pool().inflight(), 0);
    }
}
