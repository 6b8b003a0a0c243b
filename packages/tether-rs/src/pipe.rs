//! Typed pipes of filters.
//!
//! A [`Pipe<C>`] is an ordered sequence of [`Filter<C>`]s over one context
//! type. It is composed once at setup time and invoked many times,
//! concurrently, each invocation with its own context.
//!
//! ```text
//! pipe.send(ctx)
//!     │
//!     ▼
//! Filter A ── next.send(ctx) ──► Filter B ── next.send(ctx) ──► Filter C ──► Ok(())
//!     │                             │
//!     └─ may short-circuit          └─ may fail, derive a new context
//!        with Ok(())                   and run another pipe over it
//! ```
//!
//! # Guarantees
//!
//! - **Fixed order**: filters run depth-first, in the order they were added.
//!   None is skipped or reordered by the engine.
//! - **Typed composition**: a `Pipe<C>` only accepts `Filter<C>`. Generic
//!   filters written against [`PipeContext`] plug into any pipe.
//! - **No hidden policy**: the engine never retries or swallows a failure.
//!   Errors propagate to the caller as raised; retry is just another filter.
//! - **Cancellation**: before handing control to each filter the engine
//!   checks the context's cancellation signal and stops with
//!   [`TetherError::Cancelled`].
//!
//! # Example
//!
//! ```ignore
//! use tether::{Filter, Next, Pipe};
//!
//! struct StampTenant;
//!
//! #[async_trait]
//! impl<M: Message> Filter<ConsumeContext<M>> for StampTenant {
//!     async fn send(&self, ctx: &mut ConsumeContext<M>, next: Next<'_, ConsumeContext<M>>) -> Result<()> {
//!         ctx.payloads_mut().insert(TenantId::from_headers(ctx.envelope().headers()));
//!         next.send(ctx).await
//!     }
//! }
//!
//! let pipe = Pipe::builder()
//!     .add_filter(StampTenant)
//!     .add_filter(RetryFilter::new(RetryConfig::immediate(3)))
//!     .add_filter(saga_filter)
//!     .build();
//!
//! pipe.send(&mut ctx).await?;
//! ```

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{json, Value};

use crate::context::PipeContext;
use crate::error::TetherError;
use crate::filters::InlineFilter;

// =============================================================================
// Filter
// =============================================================================

/// A unit of processing logic in a pipe.
///
/// A filter may:
/// - forward the context unchanged (`next.send(ctx)`)
/// - forward a derived context by running another pipe over it
/// - short-circuit with `Ok(())`
/// - fail with `Err`
#[async_trait]
pub trait Filter<C>: Send + Sync + 'static {
    /// Process the context and (usually) hand it to the rest of the pipe.
    async fn send(&self, ctx: &mut C, next: Next<'_, C>) -> Result<()>;

    /// Describe this filter for diagnostics.
    ///
    /// Consumed by observability tooling only. The default reports the
    /// filter's type name.
    fn probe(&self, probe: &mut ProbeContext) {
        probe.add(std::any::type_name::<Self>(), Value::Null);
    }
}

// =============================================================================
// Next
// =============================================================================

/// The remainder of a pipe, handed to each filter.
///
/// `Next` is `Copy`, so a filter can drive the rest of the pipe more than
/// once (this is how [`RetryFilter`](crate::filters::RetryFilter) works).
pub struct Next<'a, C> {
    filters: &'a [Arc<dyn Filter<C>>],
}

impl<C> Clone for Next<'_, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for Next<'_, C> {}

impl<'a, C: PipeContext> Next<'a, C> {
    /// Run the remaining filters over `ctx`.
    pub async fn send(self, ctx: &mut C) -> Result<()> {
        let Some((filter, rest)) = self.filters.split_first() else {
            return Ok(());
        };
        if ctx.is_cancelled() {
            return Err(TetherError::Cancelled.into());
        }
        filter.send(ctx, Next { filters: rest }).await
    }

    /// Number of filters still to run.
    pub fn remaining(&self) -> usize {
        self.filters.len()
    }
}

// =============================================================================
// Pipe
// =============================================================================

/// An immutable, cheaply clonable sequence of filters.
pub struct Pipe<C> {
    filters: Arc<[Arc<dyn Filter<C>>]>,
}

impl<C> Clone for Pipe<C> {
    fn clone(&self) -> Self {
        Self {
            filters: self.filters.clone(),
        }
    }
}

impl<C: PipeContext> Pipe<C> {
    /// Start composing a pipe.
    pub fn builder() -> PipeBuilder<C> {
        PipeBuilder::new()
    }

    /// A pipe with no filters; sending through it always succeeds.
    pub fn empty() -> Self {
        Self {
            filters: Arc::from(Vec::new()),
        }
    }

    /// A pipe with exactly one filter.
    pub fn single<F: Filter<C>>(filter: F) -> Self {
        Self::builder().add_filter(filter).build()
    }

    /// Run every filter over `ctx`, in order.
    pub async fn send(&self, ctx: &mut C) -> Result<()> {
        Next {
            filters: &self.filters,
        }
        .send(ctx)
        .await
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    /// Describe the pipe for diagnostics.
    pub fn probe(&self) -> Value {
        let mut probe = ProbeContext::new();
        self.probe_into(&mut probe);
        probe.into_value()
    }

    /// Append this pipe's filters to an existing probe.
    pub fn probe_into(&self, probe: &mut ProbeContext) {
        for filter in self.filters.iter() {
            filter.probe(probe);
        }
    }
}

impl<C: PipeContext> Default for Pipe<C> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<C> std::fmt::Debug for Pipe<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("filter_count", &self.filters.len())
            .finish()
    }
}

/// Builder for [`Pipe`].
pub struct PipeBuilder<C> {
    filters: Vec<Arc<dyn Filter<C>>>,
}

impl<C: PipeContext> PipeBuilder<C> {
    pub fn new() -> Self {
        Self {
            filters: Vec::new(),
        }
    }

    /// Append a filter.
    pub fn add_filter<F: Filter<C>>(mut self, filter: F) -> Self {
        self.filters.push(Arc::new(filter));
        self
    }

    /// Append a filter that is already shared.
    pub fn add_shared(mut self, filter: Arc<dyn Filter<C>>) -> Self {
        self.filters.push(filter);
        self
    }

    /// Append every filter of an existing pipe.
    pub fn add_pipe(mut self, pipe: &Pipe<C>) -> Self {
        self.filters.extend(pipe.filters.iter().cloned());
        self
    }

    /// Append a synchronous step that runs and then forwards.
    ///
    /// ```ignore
    /// let pipe = Pipe::builder()
    ///     .execute(|ctx: &mut SendContext<OrderSubmitted>| {
    ///         ctx.set_priority(9);
    ///         Ok(())
    ///     })
    ///     .build();
    /// ```
    pub fn execute<F>(self, f: F) -> Self
    where
        F: Fn(&mut C) -> Result<()> + Send + Sync + 'static,
    {
        self.add_filter(InlineFilter::new(f))
    }

    pub fn build(self) -> Pipe<C> {
        Pipe {
            filters: Arc::from(self.filters),
        }
    }
}

impl<C: PipeContext> Default for PipeBuilder<C> {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Probe
// =============================================================================

/// Collects diagnostic descriptions of filters.
#[derive(Debug, Default)]
pub struct ProbeContext {
    filters: Vec<Value>,
}

impl ProbeContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one filter and its metadata.
    pub fn add(&mut self, filter: &str, data: Value) {
        let entry = if data.is_null() {
            json!({ "filter": filter })
        } else {
            json!({ "filter": filter, "data": data })
        };
        self.filters.push(entry);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn into_value(self) -> Value {
        json!({ "filters": self.filters })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ConsumeContext;
    use crate::core::{Envelope, Message};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct Ping;
    impl Message for Ping {}

    type Ctx = ConsumeContext<Ping>;

    fn ctx() -> Ctx {
        ConsumeContext::new(Envelope::new(Ping))
    }

    struct Record {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait]
    impl Filter<Ctx> for Record {
        async fn send(&self, ctx: &mut Ctx, next: Next<'_, Ctx>) -> Result<()> {
            self.log.lock().unwrap().push(self.name);
            next.send(ctx).await
        }
    }

    struct ShortCircuit;

    #[async_trait]
    impl Filter<Ctx> for ShortCircuit {
        async fn send(&self, _ctx: &mut Ctx, _next: Next<'_, Ctx>) -> Result<()> {
            Ok(())
        }

        fn probe(&self, probe: &mut ProbeContext) {
            probe.add("short-circuit", json!({ "reason": "test" }));
        }
    }

    struct Fail;

    #[async_trait]
    impl Filter<Ctx> for Fail {
        async fn send(&self, _ctx: &mut Ctx, _next: Next<'_, Ctx>) -> Result<()> {
            anyhow::bail!("boom")
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Record {
        Record {
            name,
            log: log.clone(),
        }
    }

    #[tokio::test]
    async fn test_filters_run_in_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipe = Pipe::builder()
            .add_filter(recorder("a", &log))
            .add_filter(recorder("b", &log))
            .add_filter(recorder("c", &log))
            .build();

        pipe.send(&mut ctx()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_short_circuit_stops_chain() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipe = Pipe::builder()
            .add_filter(recorder("a", &log))
            .add_filter(ShortCircuit)
            .add_filter(recorder("never", &log))
            .build();

        pipe.send(&mut ctx()).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[tokio::test]
    async fn test_error_propagates_unmodified() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipe = Pipe::builder()
            .add_filter(Fail)
            .add_filter(recorder("never", &log))
            .build();

        let err = pipe.send(&mut ctx()).await.unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert!(err.downcast_ref::<TetherError>().is_none());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_context_stops_before_first_filter() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipe = Pipe::builder().add_filter(recorder("a", &log)).build();

        let mut ctx = ctx();
        ctx.cancellation().cancel();

        let err = pipe.send(&mut ctx).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TetherError>(),
            Some(TetherError::Cancelled)
        ));
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_pipe_succeeds() {
        let pipe: Pipe<Ctx> = Pipe::empty();
        assert!(pipe.is_empty());
        pipe.send(&mut ctx()).await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_invocations_are_independent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipe = Pipe::builder()
            .add_filter(recorder("a", &log))
            .execute(|ctx: &mut Ctx| {
                ctx.payloads_mut().insert(1u8);
                Ok(())
            })
            .build();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pipe = pipe.clone();
            handles.push(tokio::spawn(async move {
                let mut ctx = ctx();
                pipe.send(&mut ctx).await.map(|_| ctx.payloads().len())
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 1);
        }
        assert_eq!(log.lock().unwrap().len(), 8);
    }

    #[test]
    fn test_probe_lists_filters() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let pipe = Pipe::builder()
            .add_filter(recorder("a", &log))
            .add_filter(ShortCircuit)
            .build();

        let probe = pipe.probe();
        let filters = probe["filters"].as_array().unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[1]["filter"], "short-circuit");
        assert_eq!(filters[1]["data"]["reason"], "test");
    }
}
