//! One processing cycle: fetch, deliver, write back, commit.
//!
//! A cycle runs inside a single store transaction. The fetch locks the
//! batch, the fan-out delivers every record concurrently and captures one
//! outcome per record, and the write-back persists all outcomes in one
//! statement before the commit releases the locks. If anything store-side
//! fails, the transaction rolls back and the whole batch reverts to
//! pending.
//!
//! Per-record failures (unknown type tag, decode error, sink rejection) are
//! data: they become failed [`OutboxUpdate`]s and never abort the cycle or
//! affect sibling records.

use std::{sync::Arc, time::Instant};

use futures_util::future::join_all;
use tower::Service;
use tracing_error::SpanTrace;

use crate::record::{OutboxRecord, OutboxUpdate};
use crate::registry::{DecoderCatalog, StaticCatalog, TypeRegistry};
use crate::sink::MessageSink;
use crate::store::OutboxStore;

/// Default number of records fetched per cycle.
pub const DEFAULT_BATCH_SIZE: usize = 1_000;

/// Executes processing cycles against a store, sink, and type registry.
///
/// Generic parameters:
/// - `D`: Store adapter
/// - `S`: Sink service type
/// - `P`: Decoded payload type
/// - `C`: Decoder catalog backing the registry
pub struct Processor<D, S, P, C = StaticCatalog<P>> {
    store: D,
    sink: MessageSink<S>,
    registry: Arc<TypeRegistry<P, C>>,
    batch_size: usize,
}

impl<D, S, P, C> Processor<D, S, P, C>
where
    D: OutboxStore,
    C: DecoderCatalog<P> + Send + Sync,
    P: Send + 'static,
    S: Service<P> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
{
    /// Create a processor with the default batch size.
    pub fn new(store: D, sink: MessageSink<S>, registry: Arc<TypeRegistry<P, C>>) -> Self {
        Self {
            store,
            sink,
            registry,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Set the number of records fetched per cycle.
    ///
    /// The effective size is clamped to the store's batch ceiling, since the
    /// batched write-back cannot persist more rows than the backend accepts
    /// parameters in one statement.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// The effective batch size after clamping to the store's ceiling.
    pub fn batch_size(&self) -> usize {
        self.batch_size.clamp(1, self.store.batch_ceiling())
    }

    /// Run one fetch → deliver → write-back cycle in its own transaction.
    ///
    /// Returns the number of records fetched (= attempted) this cycle. A
    /// non-zero count only signals there was work, not that every delivery
    /// succeeded; zero means the queue is drained.
    #[tracing::instrument(skip_all)]
    pub async fn run_cycle(&self) -> Result<usize, CycleError> {
        let cycle_started = Instant::now();

        let mut tx = self.store.begin().await.map_err(CycleError::store)?;

        let step_started = Instant::now();
        let records = self
            .store
            .fetch_messages(self.batch_size(), &mut tx)
            .await
            .map_err(CycleError::store)?;
        let query_time = step_started.elapsed();

        if records.is_empty() {
            self.store.commit(tx).await.map_err(CycleError::store)?;
            tracing::debug!("No pending outbox messages");
            return Ok(0);
        }

        let fetched = records.len();

        let step_started = Instant::now();
        let updates = self.deliver(&records).await;
        let publish_time = step_started.elapsed();

        // Exactly one outcome per fetched record, dropped and duplicated
        // neither by the fan-out nor by the join.
        debug_assert_eq!(updates.len(), fetched);

        let step_started = Instant::now();
        self.store
            .write_outcomes(updates, &mut tx)
            .await
            .map_err(CycleError::store)?;
        let update_time = step_started.elapsed();

        self.store.commit(tx).await.map_err(CycleError::store)?;

        tracing::info!(
            total_ms = cycle_started.elapsed().as_millis() as u64,
            query_ms = query_time.as_millis() as u64,
            publish_ms = publish_time.as_millis() as u64,
            update_ms = update_time.as_millis() as u64,
            messages = fetched,
            "Outbox cycle completed",
        );

        Ok(fetched)
    }

    /// Deliver every record concurrently, capturing one outcome each.
    ///
    /// All units are joined before returning; delivery order across records
    /// is unspecified.
    async fn deliver(&self, records: &[OutboxRecord]) -> Vec<OutboxUpdate> {
        let attempts = records.iter().map(|record| async move {
            match self.publish_record(record).await {
                Ok(()) => OutboxUpdate::delivered(record.id),
                Err(error) => OutboxUpdate::failed(record.id, error.to_string()),
            }
        });

        join_all(attempts).await
    }

    async fn publish_record(&self, record: &OutboxRecord) -> Result<(), tower::BoxError> {
        let decoder = self.registry.resolve(&record.type_name)?;
        let payload = decoder(&record.content)?;
        self.sink.publish(payload).await?;
        Ok(())
    }
}

/// Error returned when a cycle fails store-side.
///
/// Per-record delivery failures never produce a `CycleError`; they are
/// recorded as outcomes instead.
#[derive(Debug)]
pub struct CycleError {
    context: SpanTrace,
    source: tower::BoxError,
}

impl CycleError {
    fn store(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            source: err.into(),
        }
    }
}

impl std::fmt::Display for CycleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Store error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for CycleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.source.as_ref())
    }
}
