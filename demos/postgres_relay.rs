use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use courier::sink::{InMemory, MessageSink};
use courier::store::postgres::PgOutboxStore;
use courier::{Processor, Runner, StaticCatalog, TypeRegistry};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use tracing_error::ErrorLayer;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: Uuid,
}

#[derive(Debug, Clone)]
enum Event {
    Order(OrderPlaced),
}

impl From<OrderPlaced> for Event {
    fn from(value: OrderPlaced) -> Self {
        Event::Order(value)
    }
}

#[tokio::main]
async fn main() {
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(EnvFilter::from_default_env())
        .with(ErrorLayer::default())
        .init();

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPool::connect(&database_url).await.unwrap();

    let store = PgOutboxStore::try_new(pool.clone()).await.unwrap();

    // Producer role: seed a batch of pending records.
    for _ in 0..2_500 {
        sqlx::query(
            "INSERT INTO outbox_messages (id, type, content, occurred_on_utc) \
             VALUES ($1, $2, $3, $4)",
        )
        .bind(Uuid::new_v4())
        .bind("orders.placed")
        .bind(serde_json::json!({ "order_id": Uuid::new_v4() }))
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap();
    }

    let registry = Arc::new(TypeRegistry::new(
        StaticCatalog::new().with_json::<OrderPlaced>("orders.placed"),
    ));
    let sink = MessageSink::new(InMemory::<Event>::default());
    let processor = Processor::new(store, sink, registry).with_batch_size(1_000);

    let cancel = CancellationToken::new();
    let cancel_signal = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
        cancel_signal.cancel();
    });

    let runner = Runner::new(processor).with_time_budget(Duration::from_secs(60));
    let drained = runner.drained_signal();

    let report = runner.run(cancel).await;
    tracing::info!(?report, "Run finished");

    if drained.is_cancelled() {
        tracing::info!("Queue drained, shutting down");
    }
}
