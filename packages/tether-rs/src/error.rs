//! Structured error types for tether.
//!
//! `TetherError` provides pattern-matchable errors instead of generic
//! `anyhow::Error`. Filters, policies and collaborators return
//! `anyhow::Result` internally; the runtime raises a `TetherError` into it
//! whenever a failure belongs to the taxonomy below, so callers recover it
//! with `downcast_ref`.
//!
//! | Variant                  | Meaning                                  | Retryable |
//! |--------------------------|------------------------------------------|-----------|
//! | `MissingCorrelationId`   | message can never be correlated          | no        |
//! | `ConcurrencyConflict`    | optimistic write lost against a newer one| yes       |
//! | `TransportUnavailable`   | resource pool stopping or stopped        | no        |
//! | `SagaFault`              | anything else during saga processing     | yes       |
//! | `Cancelled`              | the context's cancellation fired         | no        |
//!
//! Duplicate-claim on pre-insert and not-found on lookup are not errors at
//! all; the repository turns them into control flow.
//!
//! # Example
//!
//! ```ignore
//! use tether::TetherError;
//!
//! match repository.dispatch(&mut ctx, &policy, &pipe).await {
//!     Ok(()) => {}
//!     Err(e) => match e.downcast_ref::<TetherError>() {
//!         Some(TetherError::ConcurrencyConflict { .. }) => redeliver(ctx),
//!         Some(TetherError::MissingCorrelationId { .. }) => dead_letter(ctx),
//!         _ => return Err(e),
//!     },
//! }
//! ```

use thiserror::Error;

use crate::core::CorrelationId;
use crate::persistence::Revision;

/// Structured error type for tether operations.
#[derive(Debug, Error)]
pub enum TetherError {
    /// The inbound message has no correlation id, so no saga can own it.
    #[error("message {message_type} has no correlation id")]
    MissingCorrelationId {
        /// Type name of the message.
        message_type: &'static str,
    },

    /// An optimistic write was rejected because the stored revision moved on.
    #[error("concurrency conflict on saga {saga_type} ({correlation_id}) at revision {expected}")]
    ConcurrencyConflict {
        /// Type name of the saga.
        saga_type: &'static str,
        /// Identity of the instance that was written concurrently.
        correlation_id: CorrelationId,
        /// The revision this unit of work held when it tried to write.
        expected: Revision,
    },

    /// The resource pool is stopping or stopped.
    #[error("transport unavailable: {reason}")]
    TransportUnavailable {
        /// Why the pool refused the request.
        reason: String,
    },

    /// Unexpected failure while processing a saga, annotated with context.
    #[error("saga {saga_type} failed handling {message_type} ({})", display_cid(.correlation_id))]
    SagaFault {
        /// Type name of the saga.
        saga_type: &'static str,
        /// Type name of the message being handled.
        message_type: &'static str,
        /// Correlation id, when it was known at the time of failure.
        correlation_id: Option<CorrelationId>,
        /// The underlying failure.
        #[source]
        source: anyhow::Error,
    },

    /// The unit of work was cancelled before it completed.
    #[error("operation cancelled")]
    Cancelled,
}

fn display_cid(cid: &Option<CorrelationId>) -> String {
    match cid {
        Some(cid) => cid.to_string(),
        None => "uncorrelated".to_string(),
    }
}

impl TetherError {
    /// Whether reprocessing the same message could succeed.
    ///
    /// Retry filters consult this before trying again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TetherError::ConcurrencyConflict { .. } | TetherError::SagaFault { .. }
        )
    }

    /// Build a transport-unavailable error.
    pub fn transport_unavailable(reason: impl Into<String>) -> Self {
        TetherError::TransportUnavailable {
            reason: reason.into(),
        }
    }
}

/// Whether an `anyhow::Error` is worth retrying.
///
/// Errors outside the taxonomy are treated as retryable; the runtime cannot
/// know better than the filter that raised them.
pub fn is_retryable(error: &anyhow::Error) -> bool {
    match error.downcast_ref::<TetherError>() {
        Some(e) => e.is_retryable(),
        None => true,
    }
}

/// Whether an `anyhow::Error` is a cancellation outcome.
pub fn is_cancelled(error: &anyhow::Error) -> bool {
    matches!(error.downcast_ref::<TetherError>(), Some(TetherError::Cancelled))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_correlation_display() {
        let err = TetherError::MissingCorrelationId {
            message_type: "OrderSubmitted",
        };
        assert!(err.to_string().contains("no correlation id"));
        assert!(err.to_string().contains("OrderSubmitted"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_conflict_display_includes_revision() {
        let cid = CorrelationId::new();
        let err = TetherError::ConcurrencyConflict {
            saga_type: "OrderState",
            correlation_id: cid,
            expected: Revision::new(3),
        };
        let display = err.to_string();
        assert!(display.contains("OrderState"));
        assert!(display.contains(&cid.to_string()));
        assert!(display.contains("r3"));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_saga_fault_keeps_source() {
        let err = TetherError::SagaFault {
            saga_type: "OrderState",
            message_type: "OrderSubmitted",
            correlation_id: None,
            source: anyhow::anyhow!("connection reset"),
        };
        assert!(err.to_string().contains("uncorrelated"));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("connection reset"));
    }

    #[test]
    fn test_error_can_be_downcast_from_anyhow() {
        let err: anyhow::Error = TetherError::transport_unavailable("pool stopped").into();

        match err.downcast_ref::<TetherError>() {
            Some(TetherError::TransportUnavailable { reason }) => {
                assert_eq!(reason, "pool stopped");
            }
            _ => panic!("Expected TransportUnavailable"),
        }
        assert!(!is_retryable(&err));
    }

    #[test]
    fn test_foreign_errors_are_retryable() {
        assert!(is_retryable(&anyhow::anyhow!("socket closed")));
        assert!(!is_cancelled(&anyhow::anyhow!("socket closed")));
        assert!(is_cancelled(&TetherError::Cancelled.into()));
    }
}
