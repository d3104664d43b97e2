//! Ordered queue store abstraction and backend adapters.
//!
//! The store owns the outbox rows. The engine's contract with it is narrow:
//! open a transaction, fetch-and-lock the next batch of pending records,
//! write every record's outcome back in one statement, commit. The engine
//! never inserts or deletes rows.
//!
//! ## Locking discipline
//!
//! `fetch_messages` must acquire row-level write locks on the returned rows
//! for the duration of the transaction. Single-instance deployments get a
//! plain locking read; multi-instance deployments additionally skip rows
//! locked by a concurrent poller so instances drain disjoint subsets (see
//! each adapter's `with_skip_locked`).
//!
//! ## Batch ceiling
//!
//! The batched write-back encodes a fixed number of parameters per row, and
//! every backend caps the parameters one statement may carry.
//! [`OutboxStore::batch_ceiling`] surfaces that bound so callers cannot
//! configure a batch size the write-back could never persist.
//!
//! ## Adapters
//!
//! - [`inmemory`]: always available, used by tests and local pipelines
//! - [`postgres`], [`mysql`]: sqlx-backed, feature-gated

pub mod inmemory;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "postgres")]
pub mod postgres;

use async_trait::async_trait;

use crate::record::{OutboxRecord, OutboxUpdate};

/// Backend adapter for the durable outbox queue.
///
/// A transaction is exclusive to one processing cycle. Dropping an
/// uncommitted transaction rolls back: fetched rows revert to pending and
/// their locks are released.
#[async_trait]
pub trait OutboxStore {
    /// Backend-specific error type.
    type Error: Into<tower::BoxError> + Send;
    /// Transaction handle scoping one cycle's fetch and write-back.
    type Transaction: Send;

    /// Upper bound on the batch size this backend can write back in one
    /// statement.
    fn batch_ceiling(&self) -> usize;

    /// Open the transaction for one processing cycle.
    async fn begin(&self) -> Result<Self::Transaction, Self::Error>;

    /// Fetch and write-lock up to `batch_size` pending records, ordered by
    /// `occurred_on_utc` ascending.
    ///
    /// An empty result means the queue is drained.
    async fn fetch_messages(
        &self,
        batch_size: usize,
        tx: &mut Self::Transaction,
    ) -> Result<Vec<OutboxRecord>, Self::Error>;

    /// Persist a batch of outcomes in a single statement.
    ///
    /// Must be a no-op for an empty batch, and all-or-nothing within the
    /// transaction otherwise.
    async fn write_outcomes(
        &self,
        updates: Vec<OutboxUpdate>,
        tx: &mut Self::Transaction,
    ) -> Result<(), Self::Error>;

    /// Commit the cycle's transaction, making its outcomes durable and
    /// releasing the row locks.
    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error>;
}
