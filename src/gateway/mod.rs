//! Operation surface over the durable store.
//!
//! A gateway is bound to one table. Every method is a single round trip and
//! acquires/releases its own connection.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{error::QueueError, types::JobRow};

mod memory;
#[cfg(feature = "mongodb")]
mod mongo;
#[cfg(feature = "postgres")]
mod postgres;

pub use memory::{MemoryGateway, MemoryStore};
#[cfg(feature = "mongodb")]
pub use mongo::MongoDbGateway;
#[cfg(feature = "postgres")]
pub use postgres::PostgresGateway;

#[async_trait]
pub trait StorageGateway: Send + Sync + 'static {
    /// Name of the table this gateway reads and writes.
    fn table_name(&self) -> &str;

    /// Current time according to the store.
    async fn now(&self) -> Result<DateTime<Utc>, QueueError>;

    /// Write a new unassigned, unlocked row and return its id.
    async fn insert(&self, queue: &str, data: &str) -> Result<i64, QueueError>;

    /// Atomically lease up to `limit` rows of `queues` whose `locked_until` is before
    /// `now`, setting `worker`, `locked_until = lease_until` and `update_time = now`.
    ///
    /// Returns the number of rows actually modified. The `locked_until < now` check
    /// must be applied at update time, not when candidates are read.
    async fn claim(
        &self,
        queues: &[String],
        worker: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, QueueError>;

    /// Rows leased by `worker` until exactly `lease_until`, ordered by id.
    async fn fetch_claimed(
        &self,
        worker: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<JobRow>, QueueError>;

    /// Delete one row by id, returning the number of rows removed.
    async fn delete(&self, id: i64) -> Result<u64, QueueError>;

    /// Count rows belonging to any of `queues`.
    async fn count(&self, queues: &[String]) -> Result<u64, QueueError>;
}

#[async_trait]
impl<G> StorageGateway for Arc<G>
where
    G: StorageGateway + ?Sized,
{
    fn table_name(&self) -> &str {
        self.as_ref().table_name()
    }

    async fn now(&self) -> Result<DateTime<Utc>, QueueError> {
        self.as_ref().now().await
    }

    async fn insert(&self, queue: &str, data: &str) -> Result<i64, QueueError> {
        self.as_ref().insert(queue, data).await
    }

    async fn claim(
        &self,
        queues: &[String],
        worker: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, QueueError> {
        self.as_ref()
            .claim(queues, worker, now, lease_until, limit)
            .await
    }

    async fn fetch_claimed(
        &self,
        worker: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<JobRow>, QueueError> {
        self.as_ref().fetch_claimed(worker, lease_until).await
    }

    async fn delete(&self, id: i64) -> Result<u64, QueueError> {
        self.as_ref().delete(id).await
    }

    async fn count(&self, queues: &[String]) -> Result<u64, QueueError> {
        self.as_ref().count(queues).await
    }
}
