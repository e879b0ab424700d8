//! PostgreSQL gateway.
//!
//! Expected layout of the jobs table (provisioning is left to the application):
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id           BIGSERIAL PRIMARY KEY,
//!     queue        TEXT        NOT NULL,
//!     data         TEXT        NOT NULL,
//!     worker       TEXT        NOT NULL DEFAULT 'unassigned',
//!     locked_until TIMESTAMPTZ NOT NULL DEFAULT 'epoch',
//!     create_time  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
//!     update_time  TIMESTAMPTZ NOT NULL DEFAULT NOW()
//! );
//! CREATE INDEX jobs_queue_locked_until ON jobs (queue, locked_until);
//! ```

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tracing::instrument;

use super::StorageGateway;
use crate::{
    config::validate_table_name,
    error::QueueError,
    types::{JobRow, UNASSIGNED, UNLOCKED},
};

/// [`StorageGateway`] backed by a PostgreSQL table.
///
/// The claim is one `UPDATE` whose candidate rows are picked with `FOR UPDATE SKIP LOCKED`
/// and re-checked against `locked_until` by the outer statement.
#[derive(Debug, Clone)]
pub struct PostgresGateway {
    pool: Arc<PgPool>,
    table_name: String,
    statements: Arc<Statements>,
}

#[derive(Debug)]
struct Statements {
    insert: String,
    claim: String,
    fetch_claimed: String,
    delete: String,
    count: String,
}

impl Statements {
    fn new(table: &str) -> Self {
        Self {
            insert: format!(
                "INSERT INTO {table} (queue, data, worker, locked_until, create_time, update_time) \
                 VALUES ($1, $2, $3, $4, NOW(), NOW()) \
                 RETURNING id"
            ),
            claim: format!(
                "UPDATE {table} \
                 SET worker = $1, locked_until = $2, update_time = $3 \
                 WHERE id IN ( \
                     SELECT id FROM {table} \
                     WHERE queue = ANY($4) AND locked_until < $3 \
                     LIMIT $5 \
                     FOR UPDATE SKIP LOCKED \
                 ) \
                 AND locked_until < $3"
            ),
            fetch_claimed: format!(
                "SELECT id, queue, data, worker, locked_until, create_time, update_time \
                 FROM {table} \
                 WHERE worker = $1 AND locked_until = $2 \
                 ORDER BY id ASC"
            ),
            delete: format!("DELETE FROM {table} WHERE id = $1"),
            count: format!("SELECT COUNT(*) FROM {table} WHERE queue = ANY($1)"),
        }
    }
}

impl PostgresGateway {
    pub async fn connect(url: &str, table_name: impl Into<String>) -> Result<Self, QueueError> {
        let pool = PgPool::connect(url)
            .await
            .context("Failed to connect to PostgreSQL")?;
        Self::new(pool, table_name)
    }

    /// Gateway over an existing pool.
    pub fn new(pool: PgPool, table_name: impl Into<String>) -> Result<Self, QueueError> {
        let table_name = table_name.into();
        validate_table_name(&table_name)?;

        Ok(Self {
            pool: Arc::new(pool),
            statements: Arc::new(Statements::new(&table_name)),
            table_name,
        })
    }
}

#[async_trait]
impl StorageGateway for PostgresGateway {
    fn table_name(&self) -> &str {
        &self.table_name
    }

    async fn now(&self) -> Result<DateTime<Utc>, QueueError> {
        Ok(sqlx::query_scalar::<_, DateTime<Utc>>("SELECT NOW()")
            .fetch_one(&*self.pool)
            .await
            .context("Failed to read server time")?)
    }

    #[instrument(skip_all, err, fields(table = %self.table_name, queue = %queue))]
    async fn insert(&self, queue: &str, data: &str) -> Result<i64, QueueError> {
        Ok(sqlx::query_scalar::<_, i64>(&self.statements.insert)
            .bind(queue)
            .bind(data)
            .bind(UNASSIGNED)
            .bind(UNLOCKED)
            .fetch_one(&*self.pool)
            .await
            .context("Failed to add job to the queue")?)
    }

    #[instrument(skip_all, err, fields(table = %self.table_name, worker = %worker))]
    async fn claim(
        &self,
        queues: &[String],
        worker: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, QueueError> {
        let result = sqlx::query(&self.statements.claim)
            .bind(worker)
            .bind(lease_until)
            .bind(now)
            .bind(queues)
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .execute(&*self.pool)
            .await
            .context("Failed to reserve jobs")?;

        Ok(result.rows_affected())
    }

    async fn fetch_claimed(
        &self,
        worker: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<JobRow>, QueueError> {
        Ok(sqlx::query_as::<_, JobRow>(&self.statements.fetch_claimed)
            .bind(worker)
            .bind(lease_until)
            .fetch_all(&*self.pool)
            .await
            .context("Failed to fetch reserved jobs")?)
    }

    async fn delete(&self, id: i64) -> Result<u64, QueueError> {
        let result = sqlx::query(&self.statements.delete)
            .bind(id)
            .execute(&*self.pool)
            .await
            .context("Failed to remove job from the queue")?;

        Ok(result.rows_affected())
    }

    async fn count(&self, queues: &[String]) -> Result<u64, QueueError> {
        let total = sqlx::query_scalar::<_, i64>(&self.statements.count)
            .bind(queues)
            .fetch_one(&*self.pool)
            .await
            .context("Failed to count jobs")?;

        Ok(u64::try_from(total).unwrap_or_default())
    }
}
