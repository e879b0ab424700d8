//! Job queue kept in a shared database table.
//!
//! Producers [`insert`](Queue::insert) payloads under a queue name. Workers reserve jobs
//! with a time-limited lease, process them and acknowledge them; a completed job is
//! deleted, a failed or abandoned one becomes available again once its lease runs out.
//! Workers never talk to each other: a reservation is a single conditional update that
//! only touches rows whose lease is over, so two workers cannot hold the same job at
//! the same time. Delivery is at least once.
//!
//! Backends:
//!
//! - [`MongoDbGateway`] - MongoDB collection (feature `mongodb`, on by default)
//! - [`PostgresGateway`] - PostgreSQL table (feature `postgres`)
//! - [`MemoryGateway`] - process-local store for tests
//!
//! # Example
//!
//! ```rust,no_run
//! use dbqueue::{ListenOptions, Queue, QueueConfig, Reserved};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Email {
//!     to: String,
//! }
//!
//! # async fn example() -> Result<(), dbqueue::QueueError> {
//! let queue = Queue::connect(&QueueConfig::new("mongodb://localhost:27017/app")).await?;
//! queue.insert("emails", &Email { to: "ops@example.com".into() }).await?;
//!
//! let listener = queue.listen(
//!     "emails",
//!     ListenOptions::default().with_max_outstanding(8),
//!     |job: Reserved<Email>| async move {
//!         if let Ok(job) = job {
//!             println!("sending to {}", job.payload().to);
//!             job.complete().await;
//!         }
//!     },
//! )?;
//!
//! // ...
//! listener.stop();
//! # Ok(())
//! # }
//! ```

mod codec;
mod config;
mod error;
mod gateway;
mod job_handle;
mod listener;
mod queue;
mod types;

pub use codec::{Codec, CodecError, JsonCodec};
pub use config::{
    validate_table_name, ConsumeOptions, ListenOptions, QueueConfig, DEFAULT_LEASE_SECONDS,
    DEFAULT_TABLE_NAME,
};
pub use error::QueueError;
#[cfg(feature = "mongodb")]
pub use gateway::MongoDbGateway;
#[cfg(feature = "postgres")]
pub use gateway::PostgresGateway;
pub use gateway::{MemoryGateway, MemoryStore, StorageGateway};
pub use job_handle::{Ack, AckOutcome, Job};
pub use listener::Listener;
pub use queue::{Queue, Reserved};
pub use types::{JobRow, QueueNames, UNASSIGNED, UNLOCKED};
