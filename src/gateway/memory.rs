use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use super::StorageGateway;
use crate::{
    error::QueueError,
    types::{JobRow, UNASSIGNED, UNLOCKED},
};

struct MemoryState {
    tables: HashMap<String, BTreeMap<i64, JobRow>>,
    last_id: i64,
    clock_offset: Duration,
    claim_calls: u64,
}

impl Default for MemoryState {
    fn default() -> Self {
        Self {
            tables: HashMap::new(),
            last_id: 0,
            clock_offset: Duration::zero(),
            claim_calls: 0,
        }
    }
}

impl MemoryState {
    fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.clock_offset
    }
}

/// Process-local store shared by any number of [`MemoryGateway`]s.
///
/// Useful for tests and local development. Its clock can be moved forward with
/// [`MemoryStore::advance`] to expire leases without waiting.
#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gateway bound to `table_name` inside this store.
    pub fn gateway(&self, table_name: impl Into<String>) -> MemoryGateway {
        MemoryGateway {
            store: self.clone(),
            table_name: table_name.into(),
        }
    }

    /// Move the store clock forward.
    pub async fn advance(&self, by: Duration) {
        let mut state = self.state.write().await;
        state.clock_offset += by;
    }

    /// Snapshot of the rows of a table, ordered by id.
    pub async fn rows(&self, table_name: &str) -> Vec<JobRow> {
        let state = self.state.read().await;
        state
            .tables
            .get(table_name)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Number of claim statements issued against this store.
    pub async fn claim_calls(&self) -> u64 {
        self.state.read().await.claim_calls
    }
}

/// [`StorageGateway`] over a [`MemoryStore`] table.
#[derive(Clone)]
pub struct MemoryGateway {
    store: MemoryStore,
    table_name: String,
}

impl MemoryGateway {
    pub fn store(&self) -> &MemoryStore {
        &self.store
    }
}

#[async_trait]
impl StorageGateway for MemoryGateway {
    fn table_name(&self) -> &str {
        &self.table_name
    }

    async fn now(&self) -> Result<DateTime<Utc>, QueueError> {
        Ok(self.store.state.read().await.now())
    }

    async fn insert(&self, queue: &str, data: &str) -> Result<i64, QueueError> {
        let mut state = self.store.state.write().await;
        let now = state.now();
        state.last_id += 1;
        let id = state.last_id;

        state.tables.entry(self.table_name.clone()).or_default().insert(
            id,
            JobRow {
                id,
                queue: queue.to_string(),
                data: data.to_string(),
                worker: UNASSIGNED.to_string(),
                locked_until: UNLOCKED,
                create_time: now,
                update_time: now,
            },
        );

        Ok(id)
    }

    async fn claim(
        &self,
        queues: &[String],
        worker: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, QueueError> {
        let mut state = self.store.state.write().await;
        state.claim_calls += 1;

        let Some(rows) = state.tables.get_mut(&self.table_name) else {
            return Ok(0);
        };

        let mut claimed = 0;
        for row in rows
            .values_mut()
            .filter(|row| queues.contains(&row.queue) && row.is_claimable(now))
            .take(limit)
        {
            row.worker = worker.to_string();
            row.locked_until = lease_until;
            row.update_time = now;
            claimed += 1;
        }

        Ok(claimed)
    }

    async fn fetch_claimed(
        &self,
        worker: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<JobRow>, QueueError> {
        let state = self.store.state.read().await;
        Ok(state
            .tables
            .get(&self.table_name)
            .map(|rows| {
                rows.values()
                    .filter(|row| row.worker == worker && row.locked_until == lease_until)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn delete(&self, id: i64) -> Result<u64, QueueError> {
        let mut state = self.store.state.write().await;
        let removed = state
            .tables
            .get_mut(&self.table_name)
            .and_then(|rows| rows.remove(&id));
        Ok(u64::from(removed.is_some()))
    }

    async fn count(&self, queues: &[String]) -> Result<u64, QueueError> {
        let state = self.store.state.read().await;
        Ok(state
            .tables
            .get(&self.table_name)
            .map(|rows| rows.values().filter(|row| queues.contains(&row.queue)).count() as u64)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[tokio::test]
    async fn insert_writes_unassigned_unlocked_row() {
        let store = MemoryStore::new();
        let gateway = store.gateway("jobs");

        let id = gateway.insert("waffles", r#"{"example":"message data"}"#).await.unwrap();

        let rows = store.rows("jobs").await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, id);
        assert_eq!(rows[0].queue, "waffles");
        assert_eq!(rows[0].worker, UNASSIGNED);
        assert_eq!(rows[0].locked_until, UNLOCKED);
        assert_eq!(rows[0].create_time, rows[0].update_time);
    }

    #[tokio::test]
    async fn claim_only_touches_expired_rows_of_requested_queues() {
        let store = MemoryStore::new();
        let gateway = store.gateway("jobs");
        gateway.insert("a", "1").await.unwrap();
        gateway.insert("b", "2").await.unwrap();
        gateway.insert("a", "3").await.unwrap();

        let now = gateway.now().await.unwrap();
        let lease_until = now + Duration::seconds(30);
        let claimed = gateway
            .claim(&names(&["a"]), "w1", now, lease_until, 10)
            .await
            .unwrap();
        assert_eq!(claimed, 2);

        // Leased rows are skipped, only the `b` row is left.
        let again = gateway
            .claim(&names(&["a", "b"]), "w2", now, lease_until, 10)
            .await
            .unwrap();
        assert_eq!(again, 1);

        let mine = gateway.fetch_claimed("w1", lease_until).await.unwrap();
        assert_eq!(
            mine.iter().map(|row| row.data.as_str()).collect::<Vec<_>>(),
            ["1", "3"]
        );
        assert!(mine.iter().all(|row| row.update_time == now));
    }

    #[tokio::test]
    async fn claim_honours_limit() {
        let store = MemoryStore::new();
        let gateway = store.gateway("jobs");
        for i in 0..5 {
            gateway.insert("q", &i.to_string()).await.unwrap();
        }

        let now = gateway.now().await.unwrap();
        let claimed = gateway
            .claim(&names(&["q"]), "w", now, now + Duration::seconds(5), 2)
            .await
            .unwrap();
        assert_eq!(claimed, 2);
        assert_eq!(store.claim_calls().await, 1);
    }

    #[tokio::test]
    async fn tables_are_isolated() {
        let store = MemoryStore::new();
        store.gateway("t2").insert("q", "x").await.unwrap();

        assert!(store.rows("jobs").await.is_empty());
        assert_eq!(store.gateway("jobs").count(&names(&["q"])).await.unwrap(), 0);
        assert_eq!(store.gateway("t2").count(&names(&["q"])).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delete_reports_missing_rows() {
        let store = MemoryStore::new();
        let gateway = store.gateway("jobs");
        let id = gateway.insert("q", "x").await.unwrap();

        assert_eq!(gateway.delete(id).await.unwrap(), 1);
        assert_eq!(gateway.delete(id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn advance_moves_store_clock() {
        let store = MemoryStore::new();
        let gateway = store.gateway("jobs");
        let before = gateway.now().await.unwrap();

        gateway.store().advance(Duration::minutes(10)).await;

        let after = gateway.now().await.unwrap();
        assert!(after - before >= Duration::minutes(10));
    }
}
