//! Drive loop running processing cycles until the queue drains.
//!
//! The runner executes one [`Processor`] cycle per iteration and stops:
//!
//! - when a cycle fetches zero records (the queue is drained), which also
//!   cancels the drained token, the runner's request for host shutdown
//! - on caller cancellation or the time budget expiring: a soft-cancel,
//!   observed at cycle boundaries so an in-flight batch finishes
//! - after too many consecutive cycle errors
//!
//! Failures never escape [`Runner::run`]: the loop reports through logs,
//! lifecycle hooks, and the final [`RunReport`].

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tower::Service;

use crate::processor::{CycleError, Processor};
use crate::registry::DecoderCatalog;
use crate::store::OutboxStore;

/// Default absolute time budget for one run.
pub const DEFAULT_TIME_BUDGET: Duration = Duration::from_secs(60);

/// Default number of consecutive cycle errors tolerated before faulting.
pub const DEFAULT_MAX_CONSECUTIVE_FAULTS: u32 = 3;

/// Outbox drive loop.
///
/// Generic parameters:
/// - `D`: Store adapter
/// - `S`: Sink service type
/// - `P`: Decoded payload type
/// - `C`: Decoder catalog backing the registry
/// - `HK`: Hook implementation for lifecycle events
pub struct Runner<D, S, P, C, HK = DefaultRunnerHook> {
    processor: Processor<D, S, P, C>,
    hook: HK,
    time_budget: Duration,
    max_consecutive_faults: u32,
    drained: CancellationToken,
}

impl<D, S, P, C> Runner<D, S, P, C, DefaultRunnerHook> {
    /// Create a runner with the default hook implementation.
    pub fn new(processor: Processor<D, S, P, C>) -> Self {
        Self {
            processor,
            hook: DefaultRunnerHook,
            time_budget: DEFAULT_TIME_BUDGET,
            max_consecutive_faults: DEFAULT_MAX_CONSECUTIVE_FAULTS,
            drained: CancellationToken::new(),
        }
    }
}

impl<D, S, P, C, HK> Runner<D, S, P, C, HK>
where
    D: OutboxStore,
    C: DecoderCatalog<P> + Send + Sync,
    P: Send + 'static,
    S: Service<P> + Clone + Send + 'static,
    S::Future: Send + 'static,
    S::Error: Into<tower::BoxError>,
    HK: RunnerHook,
{
    /// Replace the runner hook while keeping all other generics unchanged.
    ///
    /// This allows customizing behavior (logging, metrics, etc.) without
    /// rebuilding the runner.
    pub fn with_hook<HK2: RunnerHook>(self, hook: HK2) -> Runner<D, S, P, C, HK2> {
        Runner {
            processor: self.processor,
            hook,
            time_budget: self.time_budget,
            max_consecutive_faults: self.max_consecutive_faults,
            drained: self.drained,
        }
    }

    /// Set the absolute time budget for the run.
    pub fn with_time_budget(mut self, time_budget: Duration) -> Self {
        self.time_budget = time_budget;
        self
    }

    /// Set how many consecutive cycle errors stop the run as faulted.
    ///
    /// An isolated store error rolls its cycle back and the loop carries on;
    /// the reverted rows are simply refetched. A run of `count` consecutive
    /// errors is treated as a fatal condition instead.
    pub fn with_max_consecutive_faults(mut self, count: u32) -> Self {
        self.max_consecutive_faults = count.max(1);
        self
    }

    /// Token cancelled when the queue drains.
    ///
    /// This is the runner's only upward control surface: the host observes
    /// it to trigger graceful shutdown once no pending records remain.
    pub fn drained_signal(&self) -> CancellationToken {
        self.drained.clone()
    }

    /// Run cycles until drained, cancelled, out of time, or faulted.
    ///
    /// Cancellation and the time budget are checked between cycles; an
    /// in-flight cycle finishes its batch so the all-or-nothing write-back
    /// is never torn down mid-transaction.
    #[tracing::instrument(skip_all)]
    pub async fn run(self, cancel: CancellationToken) -> RunReport {
        self.hook.on_startup();

        let started = Instant::now();
        let deadline = started + self.time_budget;
        let mut iterations: u64 = 0;
        let mut processed: u64 = 0;
        let mut consecutive_faults: u32 = 0;

        let outcome = loop {
            if cancel.is_cancelled() || Instant::now() >= deadline {
                self.hook.on_cancelled();
                break RunOutcome::Cancelled;
            }

            iterations += 1;
            self.hook.on_iteration_started(iterations);

            match self.processor.run_cycle().await {
                Ok(fetched) => {
                    consecutive_faults = 0;
                    processed += fetched as u64;
                    self.hook.on_iteration_completed(iterations, fetched, processed);

                    if fetched == 0 {
                        self.drained.cancel();
                        self.hook.on_drained();
                        break RunOutcome::Drained;
                    }
                }
                Err(error) => {
                    consecutive_faults += 1;
                    self.hook.on_cycle_error(&error);

                    if consecutive_faults >= self.max_consecutive_faults {
                        break RunOutcome::Faulted;
                    }
                }
            }
        };

        let report = RunReport {
            outcome,
            iterations,
            processed,
            elapsed: started.elapsed(),
        };
        self.hook.on_finished(&report);

        report
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The queue emptied; shutdown was requested via the drained token.
    Drained,
    /// The caller cancelled or the time budget expired.
    Cancelled,
    /// Too many consecutive cycle errors.
    Faulted,
}

/// Final totals for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Why the run stopped.
    pub outcome: RunOutcome,
    /// Iterations executed, the terminating zero-fetch cycle included.
    pub iterations: u64,
    /// Records attempted across all cycles.
    pub processed: u64,
    /// Wall-clock duration of the run.
    pub elapsed: std::time::Duration,
}

/// Hook trait for observing runner lifecycle events.
///
/// Hooks are invoked synchronously and should avoid heavy or blocking work.
/// Typical use cases include logging, metrics, and tracing integration.
pub trait RunnerHook: Send + Sync {
    fn on_startup(&self);
    fn on_iteration_started(&self, iteration: u64);
    fn on_iteration_completed(&self, iteration: u64, fetched: usize, total_processed: u64);
    fn on_cycle_error(&self, error: &CycleError);
    fn on_drained(&self);
    fn on_cancelled(&self);
    fn on_finished(&self, report: &RunReport);
}

/// Default runner hook implementation.
///
/// Logs lifecycle events using `tracing`.
pub struct DefaultRunnerHook;

impl RunnerHook for DefaultRunnerHook {
    fn on_startup(&self) {
        tracing::info!("Outbox runner is starting up");
    }

    fn on_iteration_started(&self, iteration: u64) {
        tracing::info!(iteration, "Starting iteration");
    }

    fn on_iteration_completed(&self, iteration: u64, fetched: usize, total_processed: u64) {
        tracing::info!(iteration, fetched, total_processed, "Iteration completed");
    }

    fn on_cycle_error(&self, error: &CycleError) {
        tracing::error!(?error, "Outbox cycle failed");
    }

    fn on_drained(&self) {
        tracing::info!("Outbox drained, requesting shutdown");
    }

    fn on_cancelled(&self) {
        tracing::info!("Outbox runner cancelled");
    }

    fn on_finished(&self, report: &RunReport) {
        tracing::info!(
            outcome = ?report.outcome,
            total_ms = report.elapsed.as_millis() as u64,
            iterations = report.iterations,
            total_processed = report.processed,
            "Outbox runner finished",
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processor::Processor;
    use crate::record::OutboxRecord;
    use crate::registry::{StaticCatalog, TypeRegistry};
    use crate::sink::{InMemory, MessageSink};
    use crate::store::inmemory::InMemoryStore;
    use chrono::{TimeDelta, Utc};
    use serde::{Deserialize, Serialize};
    use std::sync::{Arc, Mutex};
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct OrderPlaced {
        order_id: u64,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Event {
        Order(OrderPlaced),
    }

    impl From<OrderPlaced> for Event {
        fn from(value: OrderPlaced) -> Self {
            Event::Order(value)
        }
    }

    fn registry() -> Arc<TypeRegistry<Event>> {
        Arc::new(TypeRegistry::new(
            StaticCatalog::new().with_json::<OrderPlaced>("orders.placed"),
        ))
    }

    fn seed(store: &InMemoryStore, count: usize) {
        for i in 0..count {
            store.insert(OutboxRecord {
                id: Uuid::new_v4(),
                type_name: "orders.placed".to_owned(),
                content: serde_json::json!({"order_id": i as u64}),
                occurred_on_utc: Utc::now() + TimeDelta::milliseconds(i as i64),
            });
        }
    }

    /// Hook recording the fetched count of every iteration.
    struct RecordingHook {
        fetches: Arc<Mutex<Vec<usize>>>,
    }

    impl RunnerHook for RecordingHook {
        fn on_startup(&self) {}
        fn on_iteration_started(&self, _iteration: u64) {}
        fn on_iteration_completed(&self, _iteration: u64, fetched: usize, _total: u64) {
            self.fetches
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(fetched);
        }
        fn on_cycle_error(&self, _error: &CycleError) {}
        fn on_drained(&self) {}
        fn on_cancelled(&self) {}
        fn on_finished(&self, _report: &RunReport) {}
    }

    #[tokio::test]
    async fn drains_the_queue_in_batch_sized_cycles() {
        let store = InMemoryStore::new();
        seed(&store, 2_500);
        let publisher: InMemory<Event> = InMemory::default();
        let processor = Processor::new(
            store.clone(),
            MessageSink::new(publisher.clone()),
            registry(),
        )
        .with_batch_size(1_000);

        let fetches = Arc::new(Mutex::new(Vec::new()));
        let runner = Runner::new(processor).with_hook(RecordingHook {
            fetches: Arc::clone(&fetches),
        });
        let drained = runner.drained_signal();

        let report = runner.run(CancellationToken::new()).await;

        assert_eq!(report.outcome, RunOutcome::Drained);
        assert_eq!(report.processed, 2_500);
        assert_eq!(report.iterations, 4);
        assert_eq!(
            *fetches
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner),
            vec![1_000, 1_000, 500, 0]
        );
        assert!(drained.is_cancelled());
        assert_eq!(store.pending_count(), 0);
        assert_eq!(publisher.published_count().await, 2_500);
    }

    #[tokio::test]
    async fn stops_on_the_first_empty_cycle() {
        let store = InMemoryStore::new();
        let publisher: InMemory<Event> = InMemory::default();
        let processor = Processor::new(store, MessageSink::new(publisher), registry());

        let report = Runner::new(processor).run(CancellationToken::new()).await;

        assert_eq!(report.outcome, RunOutcome::Drained);
        assert_eq!(report.iterations, 1);
        assert_eq!(report.processed, 0);
    }

    #[tokio::test]
    async fn cancellation_stops_the_loop_without_requesting_shutdown() {
        let store = InMemoryStore::new();
        seed(&store, 5);
        let publisher: InMemory<Event> = InMemory::default();
        let processor = Processor::new(store, MessageSink::new(publisher), registry());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let runner = Runner::new(processor);
        let drained = runner.drained_signal();

        let report = runner.run(cancel).await;

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.iterations, 0);
        assert!(!drained.is_cancelled());
    }

    #[tokio::test]
    async fn expired_time_budget_is_a_soft_cancel() {
        let store = InMemoryStore::new();
        seed(&store, 5);
        let publisher: InMemory<Event> = InMemory::default();
        let processor = Processor::new(store, MessageSink::new(publisher), registry());

        let report = Runner::new(processor)
            .with_time_budget(Duration::ZERO)
            .run(CancellationToken::new())
            .await;

        assert_eq!(report.outcome, RunOutcome::Cancelled);
        assert_eq!(report.iterations, 0);
    }

    #[tokio::test]
    async fn isolated_cycle_errors_are_retried_on_the_next_iteration() {
        let store = InMemoryStore::new().with_failing_writes(1);
        seed(&store, 3);
        let publisher: InMemory<Event> = InMemory::default();
        let processor = Processor::new(
            store.clone(),
            MessageSink::new(publisher),
            registry(),
        );

        let report = Runner::new(processor).run(CancellationToken::new()).await;

        assert_eq!(report.outcome, RunOutcome::Drained);
        assert_eq!(report.processed, 3);
        assert_eq!(store.pending_count(), 0);
    }

    #[tokio::test]
    async fn repeated_cycle_errors_fault_the_run() {
        let store = InMemoryStore::new().with_failing_writes(10);
        seed(&store, 3);
        let publisher: InMemory<Event> = InMemory::default();
        let processor = Processor::new(store.clone(), MessageSink::new(publisher), registry());

        let runner = Runner::new(processor).with_max_consecutive_faults(3);
        let drained = runner.drained_signal();
        let report = runner.run(CancellationToken::new()).await;

        assert_eq!(report.outcome, RunOutcome::Faulted);
        assert_eq!(report.iterations, 3);
        assert_eq!(report.processed, 0);
        assert!(!drained.is_cancelled());
        assert_eq!(store.pending_count(), 3);
    }
}
