use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};

use crate::record::{OutboxRecord, OutboxUpdate};
use crate::store::OutboxStore;

/// Binds consumed per row by the batched write-back statement.
const PARAMS_PER_UPDATE: usize = 3;

/// Postgres caps a single statement at `u16::MAX` binds.
const BIND_LIMIT: usize = u16::MAX as usize;

const QUERY_SQL: &str = "\
    SELECT id, type, content, occurred_on_utc \
    FROM outbox_messages \
    WHERE processed_on_utc IS NULL \
    ORDER BY occurred_on_utc \
    LIMIT $1 \
    FOR UPDATE";

const QUERY_SQL_SKIP_LOCKED: &str = "\
    SELECT id, type, content, occurred_on_utc \
    FROM outbox_messages \
    WHERE processed_on_utc IS NULL \
    ORDER BY occurred_on_utc \
    LIMIT $1 \
    FOR UPDATE SKIP LOCKED";

/// Postgres-backed outbox store.
///
/// Fetches lock the selected rows with `FOR UPDATE`; in multi-instance
/// deployments enable [`with_skip_locked`](Self::with_skip_locked) so
/// concurrent pollers skip each other's rows instead of blocking on them.
/// The write-back updates every row of the batch in one statement through a
/// `VALUES` derived table.
#[derive(Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
    skip_locked: bool,
}

impl PgOutboxStore {
    /// Creates a new store without touching the schema.
    pub fn new_uninitialized(pool: PgPool) -> Self {
        Self {
            pool,
            skip_locked: false,
        }
    }

    /// Creates a new store and ensures the table and pending index exist.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: PgPool) -> Result<Self, Error> {
        create_table(&pool).await?;
        Ok(Self::new_uninitialized(pool))
    }

    /// Skip rows locked by concurrent instances instead of blocking.
    pub fn with_skip_locked(mut self) -> Self {
        self.skip_locked = true;
        self
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    type Error = Error;
    type Transaction = sqlx::PgTransaction<'static>;

    fn batch_ceiling(&self) -> usize {
        BIND_LIMIT / PARAMS_PER_UPDATE
    }

    async fn begin(&self) -> Result<Self::Transaction, Self::Error> {
        Ok(self.pool.begin().await?)
    }

    #[tracing::instrument(skip(self, tx))]
    async fn fetch_messages(
        &self,
        batch_size: usize,
        tx: &mut Self::Transaction,
    ) -> Result<Vec<OutboxRecord>, Self::Error> {
        let sql = if self.skip_locked {
            QUERY_SQL_SKIP_LOCKED
        } else {
            QUERY_SQL
        };
        let batch_size = batch_size.min(self.batch_ceiling());

        let rows = sqlx::query(sql)
            .bind(batch_size as i64)
            .fetch_all(&mut **tx)
            .await?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(OutboxRecord {
                id: row.try_get("id")?,
                type_name: row.try_get("type")?,
                content: row.try_get("content")?,
                occurred_on_utc: row.try_get("occurred_on_utc")?,
            });
        }

        Ok(records)
    }

    #[tracing::instrument(skip_all, fields(updates = updates.len()))]
    async fn write_outcomes(
        &self,
        updates: Vec<OutboxUpdate>,
        tx: &mut Self::Transaction,
    ) -> Result<(), Self::Error> {
        if updates.is_empty() {
            return Ok(());
        }

        let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
            "UPDATE outbox_messages \
             SET processed_on_utc = v.processed_on_utc, error = v.error \
             FROM (",
        );
        builder.push_values(updates.iter(), |mut row, update| {
            row.push_bind(update.id)
                .push_bind(update.processed_on_utc)
                .push_bind(update.error.as_deref());
        });
        builder.push(") AS v(id, processed_on_utc, error) WHERE outbox_messages.id = v.id");

        builder.build().execute(&mut **tx).await?;

        Ok(())
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        Ok(tx.commit().await?)
    }
}

/// Ensures the outbox table and its pending-scan index exist.
async fn create_table(pool: &PgPool) -> Result<(), Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS outbox_messages (
            id UUID PRIMARY KEY,
            type VARCHAR NOT NULL,
            content JSONB NOT NULL,
            occurred_on_utc TIMESTAMPTZ NOT NULL,
            processed_on_utc TIMESTAMPTZ,
            error TEXT
        )",
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_outbox_messages_unprocessed \
         ON outbox_messages (occurred_on_utc) \
         WHERE processed_on_utc IS NULL",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Postgres store errors.
#[derive(Debug)]
pub struct Error {
    context: tracing_error::SpanTrace,
    source: sqlx::Error,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Database error: {}", self.source)?;
        self.context.fmt(f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

impl From<sqlx::Error> for Error {
    fn from(source: sqlx::Error) -> Self {
        Self {
            context: tracing_error::SpanTrace::capture(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use std::collections::HashSet;
    use uuid::Uuid;

    async fn seed(pool: &PgPool, count: usize) -> Vec<Uuid> {
        let mut ids = Vec::with_capacity(count);
        for i in 0..count {
            let id = Uuid::new_v4();
            sqlx::query(
                "INSERT INTO outbox_messages (id, type, content, occurred_on_utc) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(id)
            .bind("orders.placed")
            .bind(serde_json::json!({"order_id": i}))
            .bind(Utc::now() + TimeDelta::seconds(i as i64))
            .execute(pool)
            .await
            .unwrap();
            ids.push(id);
        }
        ids
    }

    #[sqlx::test]
    async fn fetch_returns_pending_in_occurrence_order(pool: PgPool) {
        let store = PgOutboxStore::try_new(pool).await.unwrap();
        let ids = seed(&store.pool, 3).await;

        let mut tx = store.begin().await.unwrap();
        let fetched = store.fetch_messages(10, &mut tx).await.unwrap();

        let fetched_ids: Vec<Uuid> = fetched.iter().map(|r| r.id).collect();
        assert_eq!(fetched_ids, ids);
    }

    #[sqlx::test]
    async fn write_back_marks_the_batch_terminal(pool: PgPool) {
        let store = PgOutboxStore::try_new(pool.clone()).await.unwrap();
        let ids = seed(&pool, 2).await;

        let mut tx = store.begin().await.unwrap();
        let fetched = store.fetch_messages(10, &mut tx).await.unwrap();
        let updates = vec![
            OutboxUpdate::delivered(fetched[0].id),
            OutboxUpdate::failed(fetched[1].id, "sink unavailable"),
        ];
        store.write_outcomes(updates, &mut tx).await.unwrap();
        store.commit(tx).await.unwrap();

        let pending: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outbox_messages WHERE processed_on_utc IS NULL")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(pending, 0);

        let error: Option<String> =
            sqlx::query_scalar("SELECT error FROM outbox_messages WHERE id = $1")
                .bind(ids[1])
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(error.as_deref(), Some("sink unavailable"));
    }

    #[sqlx::test]
    async fn dropped_transaction_reverts_the_batch_to_pending(pool: PgPool) {
        let store = PgOutboxStore::try_new(pool.clone()).await.unwrap();
        seed(&pool, 2).await;

        {
            let mut tx = store.begin().await.unwrap();
            let fetched = store.fetch_messages(10, &mut tx).await.unwrap();
            let updates = fetched
                .iter()
                .map(|record| OutboxUpdate::delivered(record.id))
                .collect();
            store.write_outcomes(updates, &mut tx).await.unwrap();
            // Dropped without commit.
        }

        let mut tx = store.begin().await.unwrap();
        let refetched = store.fetch_messages(10, &mut tx).await.unwrap();
        assert_eq!(refetched.len(), 2);
    }

    #[sqlx::test]
    async fn skip_locked_fetches_are_disjoint(pool: PgPool) {
        let store = PgOutboxStore::try_new(pool).await.unwrap().with_skip_locked();
        seed(&store.pool, 10).await;

        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();

        let a = store.fetch_messages(6, &mut first).await.unwrap();
        let b = store.fetch_messages(6, &mut second).await.unwrap();

        assert_eq!(a.len(), 6);
        assert_eq!(b.len(), 4);
        let ids_a: HashSet<Uuid> = a.iter().map(|r| r.id).collect();
        assert!(b.iter().all(|r| !ids_a.contains(&r.id)));
    }
}
