//! Saga persistence with optimistic concurrency.
//!
//! # The Contract
//!
//! 1. **Lookup is not an error.** A point lookup that finds nothing returns
//!    `Ok(None)`. Absence is control flow, not a fault.
//!
//! 2. **Create claims the id.** [`SagaStore::insert`] fails with
//!    [`StoreError::DuplicateKey`] when the correlation id is already taken.
//!    Under concurrent first delivery exactly one insert wins.
//!
//! 3. **Replace checks the stamp.** [`SagaStore::replace`] only writes when the
//!    stored [`Revision`] equals the expected one, and otherwise fails with
//!    [`StoreError::Conflict`]. The store is the only thing that orders
//!    concurrent writers for one correlation id, in this process or any other.
//!
//! 4. **Query is one-shot.** [`SagaStore::query`] yields a finite stream that
//!    cannot be restarted.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::core::CorrelationId;
use crate::saga::{Saga, SagaQuery};

// =============================================================================
// Store Error
// =============================================================================

/// Outcomes of a store call other than success.
///
/// The distinction matters to the repository:
/// - [`StoreError::DuplicateKey`] on pre-insert means another consumer claimed
///   the id first. It is expected and becomes "fall through to lookup".
/// - [`StoreError::Conflict`] means another writer moved the revision on.
///   It surfaces as a concurrency conflict.
/// - [`StoreError::Backend`] is a genuine storage failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No instance is stored under the id.
    #[error("saga instance not found")]
    NotFound,

    /// An instance with the same correlation id already exists.
    #[error("duplicate saga instance")]
    DuplicateKey,

    /// The stored revision no longer matches the expected one.
    #[error("revision conflict: instance was modified concurrently")]
    Conflict,

    /// Storage backend failed (timeout, connection, serialization).
    #[error("storage backend error: {0}")]
    Backend(#[source] anyhow::Error),
}

impl From<anyhow::Error> for StoreError {
    fn from(err: anyhow::Error) -> Self {
        StoreError::Backend(err)
    }
}

// =============================================================================
// Revision
// =============================================================================

/// Concurrency stamp for a stored saga instance.
///
/// - [`Revision::NONE`] marks an instance that has never been stored.
/// - Every successful insert or replace yields a new revision.
///
/// Stores may derive it from whatever their backend offers (a version
/// column, an entity tag hash); the engine only compares and echoes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Revision(pub u64);

impl Revision {
    /// Sentinel for an instance that has never been stored.
    pub const NONE: Revision = Revision(0);

    pub fn new(value: u64) -> Self {
        Revision(value)
    }

    /// The revision that follows this one.
    pub fn next(self) -> Self {
        Revision(self.0.saturating_add(1))
    }

    pub fn is_none(&self) -> bool {
        self.0 == 0
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "NONE")
        } else {
            write!(f, "r{}", self.0)
        }
    }
}

/// A saga instance together with the revision it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<S> {
    pub saga: S,
    pub revision: Revision,
}

impl<S> Versioned<S> {
    pub fn new(saga: S, revision: Revision) -> Self {
        Self { saga, revision }
    }
}

// =============================================================================
// Saga Store
// =============================================================================

/// Persists saga instances keyed by correlation id.
///
/// Implementations wrap a concrete backend (a document store, a SQL table).
/// They must map the backend's native duplicate-key and version-mismatch
/// signals to [`StoreError::DuplicateKey`] and [`StoreError::Conflict`];
/// anything else is [`StoreError::Backend`].
#[async_trait]
pub trait SagaStore<S: Saga>: Send + Sync + 'static {
    /// Short name of the backend, reported in probe data and logs.
    fn kind(&self) -> &'static str;

    /// Point lookup by correlation id.
    async fn load(&self, id: CorrelationId) -> Result<Option<Versioned<S>>, StoreError>;

    /// Create a new instance. Returns its first revision.
    async fn insert(&self, saga: &S) -> Result<Revision, StoreError>;

    /// Overwrite an instance if its stored revision equals `expected`.
    ///
    /// Returns the new revision.
    async fn replace(&self, saga: &S, expected: Revision) -> Result<Revision, StoreError>;

    /// Remove an instance. Removing an absent instance is not an error.
    async fn delete(&self, id: CorrelationId) -> Result<(), StoreError>;

    /// Every instance matching the query, as a one-shot stream.
    async fn query(
        &self,
        query: &SagaQuery<S>,
    ) -> Result<BoxStream<'static, Result<Versioned<S>, StoreError>>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_none() {
        assert!(Revision::NONE.is_none());
        assert_eq!(Revision::NONE.value(), 0);
        assert_eq!(Revision::default(), Revision::NONE);
    }

    #[test]
    fn test_revision_next_advances() {
        let rev = Revision::NONE.next().next();
        assert_eq!(rev, Revision::new(2));
        assert!(!rev.is_none());
        assert_eq!(Revision(u64::MAX).next(), Revision(u64::MAX));
    }

    #[test]
    fn test_revision_display() {
        assert_eq!(Revision::NONE.to_string(), "NONE");
        assert_eq!(Revision::new(7).to_string(), "r7");
    }

    #[test]
    fn test_store_error_from_anyhow_is_backend() {
        let err = StoreError::from(anyhow::anyhow!("connection refused"));
        assert!(matches!(err, StoreError::Backend(_)));
        assert!(err.to_string().contains("connection refused"));
    }
}
