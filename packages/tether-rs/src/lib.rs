//! # Tether
//!
//! A transport-agnostic message dispatch runtime where pipes compose, sagas
//! correlate, and supervisors own transport resources.
//!
//! ## Core Concepts
//!
//! - [`Pipe`] = an ordered, typed chain of [`Filter`]s, built once and run
//!   many times concurrently
//! - [`Saga`] = durable, correlation-keyed workflow state, loaded and saved
//!   by a [`SagaRepository`] under optimistic concurrency
//! - [`ResourcePool`] = supervised slots, each a single task owning one
//!   scoped resource such as a broker session
//! - [`SendTransport`] = the outbound path that ties pipes and pools to a
//!   [`BrokerClient`]
//!
//! ## Architecture
//!
//! ```text
//! Inbound                                   Outbound
//!
//! ConsumeContext<M>                         transport.send(dest, msg, pipe)
//!     │                                         │
//!     ▼                                         ▼
//! Pipe<ConsumeContext<M>>                   ResourcePool ── borrow ──► Slot agent
//!     │  RetryFilter, observers, ...            │                      (owns session)
//!     ▼                                         ▼
//! CorrelatedSagaFilter / QuerySagaFilter    SendFilter over ResourceContext
//!     │                                         │  declare topology
//!     ▼                                         │  Pipe<SendContext<M>>
//! SagaRepository::dispatch                      │  freeze Envelope, encode
//!     │                                         ▼
//!     ├─ pre-insert? ──► SagaStore::insert  BrokerClient::send
//!     ├─ load ──► found ──► SagaPolicy::existing ──► replace / delete
//!     └─ load ──► none  ──► SagaPolicy::missing  ──► insert
//!                               │
//!                               ▼
//!                 Pipe<SagaConsumeContext<S, M>>   (consumer logic)
//! ```
//!
//! ## Guarantees
//!
//! - **Fixed filter order**: the engine never skips, reorders or retries.
//!   Retry is a filter.
//! - **Store orders writers**: a replace only lands if the stored
//!   [`Revision`] is the one read. Otherwise [`TetherError::ConcurrencyConflict`].
//! - **One winner on first delivery**: concurrent pre-inserts for one
//!   correlation id produce one instance; losers fall through to lookup.
//! - **Fail fast on shutdown**: once a pool stops, sends fail with
//!   [`TetherError::TransportUnavailable`]; sends already in flight finish.
//!
//! ## Example
//!
//! ```ignore
//! use tether::{
//!     CorrelatedSagaFilter, NewOrExistingPolicy, Pipe, RetryConfig, RetryFilter,
//!     SagaRepository,
//! };
//!
//! let repository = SagaRepository::new(store);
//! let policy = NewOrExistingPolicy::new(|id, msg: &OrderSubmitted| OrderState::new(id, msg))
//!     .with_insert_on_initial(true);
//!
//! let consumer = Pipe::builder()
//!     .execute(|ctx: &mut SagaConsumeContext<OrderState, OrderSubmitted>| {
//!         ctx.saga_mut().submitted = true;
//!         Ok(())
//!     })
//!     .build();
//!
//! let receive = Pipe::builder()
//!     .add_filter(RetryFilter::new(RetryConfig::immediate(5)))
//!     .add_filter(CorrelatedSagaFilter::new(repository, policy, consumer))
//!     .build();
//!
//! receive.send(&mut ConsumeContext::new(envelope)).await?;
//! ```

// Core modules
mod config;
mod context;
mod core;
mod error;
mod filters;
mod observer;
mod persistence;
mod pipe;
mod policy;
mod repository;
mod saga;
mod supervisor;
mod transport;

// Testing utilities (feature-gated)
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// Stress tests (test-only)
#[cfg(test)]
mod stress_tests;

// Re-export core types
pub use crate::core::{CorrelationId, Envelope, Headers, Message, MessageId, DEFAULT_CONTENT_TYPE};

// Re-export error types
pub use crate::error::{is_cancelled, is_retryable, TetherError};

// Re-export config types
pub use config::{PoolConfig, RetryConfig, TransportConfig, DRAIN_TIMEOUT_ENV, SESSION_COUNT_ENV};

// Re-export pipeline types
pub use context::{ConsumeContext, Payloads, PipeContext};
pub use filters::{ConcurrencyLimitFilter, InlineFilter, RetryFilter};
pub use pipe::{Filter, Next, Pipe, PipeBuilder, ProbeContext};

// Re-export saga types
pub use persistence::{Revision, SagaStore, StoreError, Versioned};
pub use policy::{AnyExistingPolicy, MissingPipe, NewOrExistingPolicy, SagaPolicy};
pub use repository::{CorrelatedSagaFilter, QuerySagaFilter, SagaRepository};
pub use saga::{Saga, SagaConsumeContext, SagaQuery};

// Re-export supervisor types
pub use supervisor::{PoolState, ResourceContext, ResourceFactory, ResourcePool, SlotState};

// Re-export transport types
pub use transport::{
    BrokerClient, BrokerSession, Destination, DestinationKind, SendContext, SendTransport,
    SessionFactory,
};

// Re-export observer types
pub use observer::{
    ConsumeEvent, ConsumeObserver, ConsumeObserverFilter, ConsumeObservers, SendEvent,
    SendObserver, SendObservers,
};

// Re-export async_trait for implementing Filter, SagaStore and friends
pub use async_trait::async_trait;
