use std::sync::Arc;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{de::DeserializeOwned, Serialize};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    codec::{Codec, JsonCodec},
    config::{ConsumeOptions, QueueConfig},
    error::QueueError,
    gateway::{MemoryStore, StorageGateway},
    job_handle::Job,
    types::{JobRow, QueueNames},
};

/// Result of reserving one job. A payload that fails to decode is reported for that job
/// alone; the job stays leased and is retried after the lease expires.
pub type Reserved<T> = Result<Job<T>, QueueError>;

/// A job queue stored in a shared table.
///
/// Any number of processes can open the same table; they coordinate only through the
/// conditional updates performed by the store.
pub struct Queue<C = JsonCodec> {
    gateway: Arc<dyn StorageGateway>,
    codec: Arc<C>,
}

impl<C> Clone for Queue<C> {
    fn clone(&self) -> Self {
        Self {
            gateway: Arc::clone(&self.gateway),
            codec: Arc::clone(&self.codec),
        }
    }
}

impl Queue<JsonCodec> {
    /// Queue over an already built gateway, using the JSON codec.
    pub fn new<G: StorageGateway>(gateway: G) -> Self {
        Self::with_codec(gateway, JsonCodec)
    }

    /// Connect to the store named by `config.url`.
    pub async fn connect(config: &QueueConfig) -> Result<Self, QueueError> {
        Self::connect_with_codec(config, JsonCodec).await
    }
}

impl<C: Codec> Queue<C> {
    pub fn with_codec<G: StorageGateway>(gateway: G, codec: C) -> Self {
        Self {
            gateway: Arc::new(gateway),
            codec: Arc::new(codec),
        }
    }

    pub async fn connect_with_codec(config: &QueueConfig, codec: C) -> Result<Self, QueueError> {
        config.validate()?;

        let scheme = config.url.split_once("://").map(|(scheme, _)| scheme);
        let gateway: Arc<dyn StorageGateway> = match scheme {
            #[cfg(feature = "mongodb")]
            Some("mongodb" | "mongodb+srv") => Arc::new(
                crate::gateway::MongoDbGateway::connect(
                    &config.url,
                    config.cert_file.clone(),
                    &config.table_name,
                )
                .await?,
            ),
            #[cfg(feature = "postgres")]
            Some("postgres" | "postgresql") => Arc::new(
                crate::gateway::PostgresGateway::connect(&config.url, &config.table_name).await?,
            ),
            Some("memory") => Arc::new(MemoryStore::new().gateway(&config.table_name)),
            _ => {
                return Err(QueueError::InvalidConfig(format!(
                    "unsupported store url {:?}",
                    config.url
                )))
            }
        };

        tracing::debug!(table = %config.table_name, "Connected job queue");

        Ok(Self {
            gateway,
            codec: Arc::new(codec),
        })
    }

    pub fn table_name(&self) -> &str {
        self.gateway.table_name()
    }

    /// Add a job to `queue`. It can be reserved immediately.
    ///
    /// Returns the id of the new row. If the payload cannot be encoded nothing is written.
    #[instrument(skip_all, err, fields(queue = %queue, payload_size))]
    pub async fn insert<P>(&self, queue: &str, payload: &P) -> Result<i64, QueueError>
    where
        P: Serialize + ?Sized,
    {
        let data = self.codec.encode(payload).map_err(QueueError::Encode)?;

        tracing::Span::current().record("payload_size", data.len());

        self.gateway.insert(queue, &data).await
    }

    /// Number of stored jobs, pending or leased, in any of `queues`.
    #[instrument(skip_all, err, fields(queues))]
    pub async fn size(&self, queues: impl Into<QueueNames>) -> Result<u64, QueueError> {
        let queues = queues.into();
        tracing::Span::current().record("queues", tracing::field::display(&queues));

        if queues.is_empty() {
            return Ok(0);
        }

        self.gateway.count(queues.as_slice()).await
    }

    /// Reserve up to `options.max_count` jobs from any of `queues`.
    ///
    /// An empty vector means nothing was claimable. Each reserved job must be acknowledged
    /// through its handle; jobs that are not are redelivered once their lease expires.
    pub async fn consume<T>(
        &self,
        queues: impl Into<QueueNames>,
        options: ConsumeOptions,
    ) -> Result<Vec<Reserved<T>>, QueueError>
    where
        T: DeserializeOwned,
    {
        let rows = self
            .reserve(&queues.into(), options.lease_seconds, options.max_count)
            .await?;

        Ok(rows.into_iter().map(|row| self.decode(row)).collect())
    }

    /// Reserve a single job with the default lease.
    pub async fn consume_one<T>(
        &self,
        queues: impl Into<QueueNames>,
    ) -> Result<Option<Job<T>>, QueueError>
    where
        T: DeserializeOwned,
    {
        self.consume(queues, ConsumeOptions::default())
            .await?
            .into_iter()
            .next()
            .transpose()
    }

    /// Claim up to `max_count` claimable rows under a fresh worker token and return
    /// exactly the rows claimed.
    #[instrument(skip_all, err, fields(queues = %queues, lease_seconds, max_count, worker, claimed))]
    pub(crate) async fn reserve(
        &self,
        queues: &QueueNames,
        lease_seconds: u32,
        max_count: usize,
    ) -> Result<Vec<JobRow>, QueueError> {
        ConsumeOptions {
            lease_seconds,
            max_count,
        }
        .validate()?;

        if queues.is_empty() || max_count == 0 {
            return Ok(Vec::new());
        }

        let now = truncate_to_millis(self.gateway.now().await?);
        let lease_until = now + TimeDelta::seconds(i64::from(lease_seconds));
        let worker = Uuid::now_v7().to_string();

        let span = tracing::Span::current();
        span.record("lease_seconds", lease_seconds);
        span.record("max_count", max_count);
        span.record("worker", worker.as_str());

        let claimed = self
            .gateway
            .claim(queues.as_slice(), &worker, now, lease_until, max_count)
            .await?;
        span.record("claimed", claimed);

        if claimed == 0 {
            return Ok(Vec::new());
        }

        // The token and exact expiry together identify the rows of this claim only.
        let rows = self.gateway.fetch_claimed(&worker, lease_until).await?;
        if rows.len() as u64 != claimed {
            tracing::warn!(
                claimed,
                fetched = rows.len(),
                "Reserved job count differs from fetched rows"
            );
        }

        Ok(rows)
    }

    fn decode<T>(&self, row: JobRow) -> Reserved<T>
    where
        T: DeserializeOwned,
    {
        match self.codec.decode(&row.data) {
            Ok(payload) => Ok(Job::new(row, payload, Arc::clone(&self.gateway))),
            Err(source) => {
                tracing::warn!(
                    job_id = row.id,
                    queue = %row.queue,
                    locked_until = %row.locked_until,
                    error = %source,
                    "Failed to decode reserved job, it will be retried after its lease"
                );
                Err(QueueError::Decode { id: row.id, source })
            }
        }
    }
}

// Millisecond precision is the coarsest any supported store keeps, so the lease expiry
// written by a claim reads back unchanged.
fn truncate_to_millis(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(TimeDelta::milliseconds(1)).unwrap_or(now)
}
