use anyhow::Context;
use async_trait::async_trait;
use bson::{doc, Document};
use chrono::{DateTime, Utc};
use mongodb::{
    options::{
        ClientOptions, ConnectionString, FindOneAndUpdateOptions, FindOptions, ReturnDocument, Tls,
        TlsOptions,
    },
    Client, Collection, Database,
};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use super::StorageGateway;
use crate::{
    config::validate_table_name,
    error::QueueError,
    types::{JobRow, UNASSIGNED, UNLOCKED},
};

const DEFAULT_DATABASE: &str = "dbqueue";
const COUNTERS_COLLECTION: &str = "dbqueue_counters";

#[derive(Debug, Serialize, Deserialize)]
struct MongoJobRow {
    #[serde(rename = "_id")]
    id: i64,
    queue: String,
    data: String,
    worker: String,
    locked_until: bson::DateTime,
    create_time: bson::DateTime,
    update_time: bson::DateTime,
}

impl From<MongoJobRow> for JobRow {
    fn from(row: MongoJobRow) -> Self {
        Self {
            id: row.id,
            queue: row.queue,
            data: row.data,
            worker: row.worker,
            locked_until: row.locked_until.to_chrono(),
            create_time: row.create_time.to_chrono(),
            update_time: row.update_time.to_chrono(),
        }
    }
}

/// [`StorageGateway`] backed by a MongoDB collection.
///
/// Ids come from a per-collection counter document so they keep insertion order.
#[derive(Clone)]
pub struct MongoDbGateway {
    database: Database,
    table_name: String,
}

impl MongoDbGateway {
    pub async fn connect(
        uri: &str,
        cert_file: Option<String>,
        table_name: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let client = Self::new_client(uri, cert_file)
            .await
            .context("Failed to connect to MongoDB")?;
        let database = client
            .default_database()
            .unwrap_or(client.database(DEFAULT_DATABASE));

        Self::new(database, table_name)
    }

    /// Gateway over an existing database handle.
    pub fn new(database: Database, table_name: impl Into<String>) -> Result<Self, QueueError> {
        let table_name = table_name.into();
        validate_table_name(&table_name)?;

        Ok(Self {
            database,
            table_name,
        })
    }

    async fn new_client(
        uri: &str,
        cert_path: Option<String>,
    ) -> Result<Client, mongodb::error::Error> {
        match cert_path {
            Some(cert_path) => {
                let conn_str = ConnectionString::parse(uri)?;
                let mut options = ClientOptions::parse_connection_string(conn_str).await?;
                let mut tls_options = TlsOptions::default();
                tls_options.ca_file_path = Some(cert_path.into());
                tls_options.allow_invalid_hostnames = Some(true);
                options.tls = Some(Tls::Enabled(tls_options));
                Client::with_options(options)
            }
            None => Client::with_uri_str(uri).await,
        }
    }

    #[cfg(test)]
    pub async fn delete_database(&self) -> Result<(), mongodb::error::Error> {
        self.database.drop(None).await
    }

    fn collection(&self) -> Collection<MongoJobRow> {
        self.database.collection(&self.table_name)
    }

    async fn next_id(&self) -> Result<i64, QueueError> {
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        let counter = self
            .database
            .collection::<Document>(COUNTERS_COLLECTION)
            .find_one_and_update(
                doc! { "_id": self.table_name.as_str() },
                doc! { "$inc": { "seq": 1_i64 } },
                options,
            )
            .await
            .context("Failed to allocate job id")?
            .context("Job id counter was not returned")?;

        Ok(counter
            .get_i64("seq")
            .context("Job id counter has an unexpected type")?)
    }
}

#[async_trait]
impl StorageGateway for MongoDbGateway {
    fn table_name(&self) -> &str {
        &self.table_name
    }

    async fn now(&self) -> Result<DateTime<Utc>, QueueError> {
        let reply = self
            .database
            .run_command(doc! { "hello": 1 }, None)
            .await
            .context("Failed to read server time")?;

        let now = reply
            .get_datetime("localTime")
            .context("Server reply has no localTime")?;

        Ok(now.to_chrono())
    }

    #[instrument(skip_all, err, fields(table = %self.table_name, queue = %queue))]
    async fn insert(&self, queue: &str, data: &str) -> Result<i64, QueueError> {
        let id = self.next_id().await?;
        let now = bson::DateTime::from_chrono(self.now().await?);

        self.collection()
            .insert_one(
                MongoJobRow {
                    id,
                    queue: queue.to_string(),
                    data: data.to_string(),
                    worker: UNASSIGNED.to_string(),
                    locked_until: bson::DateTime::from_chrono(UNLOCKED),
                    create_time: now,
                    update_time: now,
                },
                None,
            )
            .await
            .context("Failed to add job to the queue")?;

        Ok(id)
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
        let now = bson::DateTime::from_chrono(now);

        let find_options = FindOptions::builder()
            .projection(doc! { "_id": 1 })
            .sort(doc! { "_id": 1 })
            .limit(i64::try_from(limit).unwrap_or(i64::MAX))
            .build();
        let mut cursor = self
            .database
            .collection::<Document>(&self.table_name)
            .find(
                doc! {
                    "queue": { "$in": queues.to_vec() },
                    "locked_until": { "$lt": now },
                },
                find_options,
            )
            .await
            .context("Failed to look up claimable jobs")?;

        let mut ids = Vec::with_capacity(limit);
        while cursor
            .advance()
            .await
            .context("Failed to read claimable jobs")?
        {
            let candidate = cursor
                .deserialize_current()
                .context("Failed to read claimable job id")?;
            ids.push(candidate.get_i64("_id").context("Job id has an unexpected type")?);
        }

        if ids.is_empty() {
            return Ok(0);
        }

        // The lease check is repeated here so a job taken by another worker since the
        // lookup is left alone.
        let result = self
            .collection()
            .update_many(
                doc! {
                    "_id": { "$in": ids },
                    "locked_until": { "$lt": now },
                },
                doc! {
                    "$set": {
                        "worker": worker,
                        "locked_until": bson::DateTime::from_chrono(lease_until),
                        "update_time": now,
                    }
                },
                None,
            )
            .await
            .context("Failed to reserve jobs")?;

        Ok(result.modified_count)
    }

    async fn fetch_claimed(
        &self,
        worker: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<JobRow>, QueueError> {
        let find_options = FindOptions::builder().sort(doc! { "_id": 1 }).build();
        let mut cursor = self
            .collection()
            .find(
                doc! {
                    "worker": worker,
                    "locked_until": bson::DateTime::from_chrono(lease_until),
                },
                find_options,
            )
            .await
            .context("Failed to fetch reserved jobs")?;

        let mut rows = Vec::new();
        while cursor
            .advance()
            .await
            .context("Failed to read reserved jobs")?
        {
            let row = cursor
                .deserialize_current()
                .context("Failed to read reserved job")?;
            rows.push(row.into());
        }

        Ok(rows)
    }

    async fn delete(&self, id: i64) -> Result<u64, QueueError> {
        let result = self
            .collection()
            .delete_one(doc! { "_id": id }, None)
            .await
            .context("Failed to remove job from the queue")?;
        Ok(result.deleted_count)
    }

    async fn count(&self, queues: &[String]) -> Result<u64, QueueError> {
        Ok(self
            .collection()
            .count_documents(doc! { "queue": { "$in": queues.to_vec() } }, None)
            .await
            .context("Failed to count jobs")?)
    }
}
