use async_trait::async_trait;
use sqlx::{MySql, MySqlPool, QueryBuilder, Row};

use crate::record::{OutboxRecord, OutboxUpdate};
use crate::store::OutboxStore;

/// Binds consumed per row by the batched write-back statement.
const PARAMS_PER_UPDATE: usize = 3;

/// MySQL caps a prepared statement at `u16::MAX` placeholders.
const BIND_LIMIT: usize = u16::MAX as usize;

const QUERY_SQL: &str = "\
    SELECT id, type, content, occurred_on_utc \
    FROM outbox_messages \
    WHERE processed_on_utc IS NULL \
    ORDER BY occurred_on_utc \
    LIMIT ? \
    FOR UPDATE";

const QUERY_SQL_SKIP_LOCKED: &str = "\
    SELECT id, type, content, occurred_on_utc \
    FROM outbox_messages \
    WHERE processed_on_utc IS NULL \
    ORDER BY occurred_on_utc \
    LIMIT ? \
    FOR UPDATE SKIP LOCKED";

/// MySQL-backed outbox store.
///
/// Same contract as the Postgres adapter, expressed in MySQL 8 syntax: the
/// locking read is `FOR UPDATE [SKIP LOCKED]`, and the batched write-back
/// joins a `UNION ALL` derived table (MySQL has no updatable `VALUES`
/// table in its 8.0 baseline).
#[derive(Clone)]
pub struct MySqlOutboxStore {
    pool: MySqlPool,
    skip_locked: bool,
}

impl MySqlOutboxStore {
    /// Creates a new store without touching the schema.
    pub fn new_uninitialized(pool: MySqlPool) -> Self {
        Self {
            pool,
            skip_locked: false,
        }
    }

    /// Creates a new store and ensures the table exists.
    #[tracing::instrument(skip_all)]
    pub async fn try_new(pool: MySqlPool) -> Result<Self, Error> {
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
impl OutboxStore for MySqlOutboxStore {
    type Error = Error;
    type Transaction = sqlx::Transaction<'static, MySql>;

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

        let mut builder: QueryBuilder<MySql> =
            QueryBuilder::new("UPDATE outbox_messages AS m JOIN (");
        let mut first = true;
        for update in updates.iter() {
            // Column aliases belong on the first SELECT of the derived table.
            builder.push(if first { "SELECT " } else { " UNION ALL SELECT " });
            builder.push_bind(update.id);
            builder.push(if first { " AS id, " } else { ", " });
            builder.push_bind(update.processed_on_utc);
            builder.push(if first { " AS processed_on_utc, " } else { ", " });
            builder.push_bind(update.error.as_deref());
            if first {
                builder.push(" AS error");
            }
            first = false;
        }
        builder.push(
            ") AS v ON m.id = v.id \
             SET m.processed_on_utc = v.processed_on_utc, m.error = v.error",
        );

        builder.build().execute(&mut **tx).await?;

        Ok(())
    }

    async fn commit(&self, tx: Self::Transaction) -> Result<(), Self::Error> {
        Ok(tx.commit().await?)
    }
}

/// Ensures the outbox table and its pending-scan index exist.
async fn create_table(pool: &MySqlPool) -> Result<(), Error> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS outbox_messages (
            id BINARY(16) PRIMARY KEY,
            type VARCHAR(255) NOT NULL,
            content JSON NOT NULL,
            occurred_on_utc TIMESTAMP(6) NOT NULL,
            processed_on_utc TIMESTAMP(6) NULL,
            error TEXT NULL,
            INDEX idx_outbox_messages_unprocessed (processed_on_utc, occurred_on_utc)
        )",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// MySQL store errors.
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
