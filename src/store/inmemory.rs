use std::{
    collections::HashSet,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::record::{OutboxRecord, OutboxUpdate};
use crate::store::OutboxStore;

/// An in-memory outbox store for testing or local usage.
///
/// Mirrors the transactional semantics the engine relies on: fetched rows
/// are locked until their transaction commits or drops, outcomes stage
/// inside the transaction and apply atomically on commit, and dropping an
/// uncommitted transaction reverts every fetched row to pending.
///
/// Concurrent fetches always skip locked rows, so two transactions receive
/// disjoint subsets of the pending set.
pub struct InMemoryStore {
    state: Arc<Mutex<State>>,
    failing_writes: Arc<AtomicUsize>,
}

struct State {
    rows: Vec<StoredRecord>,
    locked: HashSet<Uuid>,
}

/// A row as held by the in-memory store, terminal columns included.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRecord {
    pub record: OutboxRecord,
    pub processed_on_utc: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl StoredRecord {
    /// Whether the record's single delivery attempt has been recorded.
    pub fn is_terminal(&self) -> bool {
        self.processed_on_utc.is_some()
    }
}

impl Clone for InMemoryStore {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            failing_writes: Arc::clone(&self.failing_writes),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                rows: Vec::new(),
                locked: HashSet::new(),
            })),
            failing_writes: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` outcome write-backs fail.
    ///
    /// Lets tests observe the cycle-level rollback path without a real
    /// database fault.
    pub fn with_failing_writes(self, count: usize) -> Self {
        self.failing_writes.store(count, Ordering::SeqCst);
        self
    }

    /// Insert a pending record, playing the producer role.
    pub fn insert(&self, record: OutboxRecord) {
        let mut state = self.lock_state();
        state.rows.push(StoredRecord {
            record,
            processed_on_utc: None,
            error: None,
        });
    }

    /// Number of rows still pending.
    pub fn pending_count(&self) -> usize {
        self.lock_state()
            .rows
            .iter()
            .filter(|row| !row.is_terminal())
            .count()
    }

    /// Snapshot a row by id.
    pub fn row(&self, id: Uuid) -> Option<StoredRecord> {
        self.lock_state()
            .rows
            .iter()
            .find(|row| row.record.id == id)
            .cloned()
    }

    /// Snapshot every row.
    pub fn rows(&self) -> Vec<StoredRecord> {
        self.lock_state().rows.clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Transaction handle over the in-memory store.
///
/// Holds the locks taken by its fetches and the outcomes staged for commit.
pub struct InMemoryTransaction {
    state: Arc<Mutex<State>>,
    locked: Vec<Uuid>,
    staged: Vec<OutboxUpdate>,
    committed: bool,
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        // Rollback: staged outcomes are discarded, locks released.
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for id in &self.locked {
            state.locked.remove(id);
        }
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    type Error = InMemoryStoreError;
    type Transaction = InMemoryTransaction;

    fn batch_ceiling(&self) -> usize {
        usize::MAX
    }

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        Ok(InMemoryTransaction {
            state: Arc::clone(&self.state),
            locked: Vec::new(),
            staged: Vec::new(),
            committed: false,
        })
    }

    async fn fetch_messages(
        &self,
        batch_size: usize,
        tx: &mut Self::Transaction,
    ) -> Result<Vec<OutboxRecord>, Self::Error> {
        let mut state = self.lock_state();

        let mut picked: Vec<OutboxRecord> = state
            .rows
            .iter()
            .filter(|row| !row.is_terminal() && !state.locked.contains(&row.record.id))
            .map(|row| row.record.clone())
            .collect();
        picked.sort_by_key(|record| record.occurred_on_utc);
        picked.truncate(batch_size);

        for record in &picked {
            state.locked.insert(record.id);
            tx.locked.push(record.id);
        }

        Ok(picked)
    }

    async fn write_outcomes(
        &self,
        updates: Vec<OutboxUpdate>,
        tx: &mut Self::Transaction,
    ) -> Result<(), Self::Error> {
        if updates.is_empty() {
            return Ok(());
        }
        if self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(InMemoryStoreError::write_failed());
        }
        tx.staged.extend(updates);
        Ok(())
    }

    async fn commit(&self, mut tx: Self::Transaction) -> Result<(), Self::Error> {
        let mut state = self.lock_state();

        for update in tx.staged.drain(..) {
            if let Some(row) = state
                .rows
                .iter_mut()
                .find(|row| row.record.id == update.id)
            {
                row.processed_on_utc = Some(update.processed_on_utc);
                row.error = update.error;
            }
        }
        for id in tx.locked.drain(..) {
            state.locked.remove(&id);
        }
        tx.committed = true;

        Ok(())
    }
}

/// Error type for [`InMemoryStore`] operations.
#[derive(Debug)]
pub struct InMemoryStoreError {
    kind: InMemoryStoreErrorKind,
}

#[derive(Debug)]
enum InMemoryStoreErrorKind {
    WriteFailed,
}

impl InMemoryStoreError {
    fn write_failed() -> Self {
        Self {
            kind: InMemoryStoreErrorKind::WriteFailed,
        }
    }
}

impl std::fmt::Display for InMemoryStoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            InMemoryStoreErrorKind::WriteFailed => {
                write!(f, "Outcome write-back failed in in-memory store")
            }
        }
    }
}

impl std::error::Error for InMemoryStoreError {}
