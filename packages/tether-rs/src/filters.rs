//! Reusable filters.
//!
//! These are ordinary [`Filter`]s written against the [`PipeContext`]
//! capability set, so they fit any pipe: consume, saga, send or resource.
//!
//! - [`InlineFilter`] - run a synchronous closure, then forward
//! - [`RetryFilter`] - drive the rest of the pipe again on retryable failure
//! - [`ConcurrencyLimitFilter`] - cap how many invocations run the rest of the pipe at once

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::RetryConfig;
use crate::context::{cancellable, PipeContext};
use crate::error::{is_cancelled, is_retryable, TetherError};
use crate::pipe::{Filter, Next, ProbeContext};

// =============================================================================
// Inline
// =============================================================================

/// Runs a synchronous closure over the context, then forwards.
pub struct InlineFilter<F> {
    f: F,
}

impl<F> InlineFilter<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<C, F> Filter<C> for InlineFilter<F>
where
    C: PipeContext,
    F: Fn(&mut C) -> Result<()> + Send + Sync + 'static,
{
    async fn send(&self, ctx: &mut C, next: Next<'_, C>) -> Result<()> {
        (self.f)(ctx)?;
        next.send(ctx).await
    }

    fn probe(&self, probe: &mut ProbeContext) {
        probe.add("inline", serde_json::Value::Null);
    }
}

// =============================================================================
// Retry
// =============================================================================

/// Retries the remainder of the pipe.
///
/// Only failures classified as retryable are retried: a
/// [`TetherError::MissingCorrelationId`] or [`TetherError::TransportUnavailable`]
/// is returned immediately, and cancellation always wins over retry.
///
/// # Example
///
/// ```ignore
/// let pipe = Pipe::builder()
///     .add_filter(RetryFilter::new(RetryConfig::interval(5, Duration::from_millis(200))))
///     .add_filter(saga_filter)
///     .build();
/// ```
pub struct RetryFilter {
    config: RetryConfig,
}

impl RetryFilter {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl<C: PipeContext> Filter<C> for RetryFilter {
    async fn send(&self, ctx: &mut C, next: Next<'_, C>) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            let error = match next.send(ctx).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };

            attempt += 1;
            if is_cancelled(&error) || !is_retryable(&error) || attempt > self.config.retry_limit {
                if attempt > 1 {
                    warn!(attempts = attempt, error = %error, "giving up after retries");
                }
                return Err(error);
            }

            debug!(attempt, error = %error, "retrying pipe");

            if let Some(delay) = self.config.delay_for(attempt) {
                let token = ctx.cancellation().clone();
                cancellable(&token, async {
                    tokio::time::sleep(delay).await;
                    Ok(())
                })
                .await?;
            }
        }
    }

    fn probe(&self, probe: &mut ProbeContext) {
        probe.add(
            "retry",
            json!({
                "limit": self.config.retry_limit,
                "intervals_ms": self.config.intervals.iter().map(|d| d.as_millis() as u64).collect::<Vec<_>>(),
            }),
        );
    }
}

// =============================================================================
// Concurrency Limit
// =============================================================================

/// Caps how many invocations run the remainder of the pipe concurrently.
///
/// Waiting for a permit is a suspension point and observes cancellation.
pub struct ConcurrencyLimitFilter {
    limit: usize,
    permits: Arc<Semaphore>,
}

impl ConcurrencyLimitFilter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            limit,
            permits: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Permits currently free.
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

#[async_trait]
impl<C: PipeContext> Filter<C> for ConcurrencyLimitFilter {
    async fn send(&self, ctx: &mut C, next: Next<'_, C>) -> Result<()> {
        let token = ctx.cancellation().clone();
        let permits = self.permits.clone();
        let _permit = cancellable(&token, async move {
            permits
                .acquire_owned()
                .await
                .map_err(|_| anyhow::Error::from(TetherError::transport_unavailable("concurrency limit closed")))
        })
        .await?;

        next.send(ctx).await
    }

    fn probe(&self, probe: &mut ProbeContext) {
        probe.add("concurrency-limit", json!({ "limit": self.limit }));
    }
}
