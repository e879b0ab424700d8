use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{gateway::StorageGateway, types::JobRow};

/// What an acknowledgment did to the stored job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The row was deleted.
    Deleted,
    /// The row was already gone, typically reclaimed and completed by another worker
    /// after this lease expired.
    Missing,
    /// The job failed; the row stays and is redelivered once the lease expires.
    Retained,
    /// The job had already been acknowledged. Nothing was done.
    AlreadyResolved,
    /// The delete failed. The row is redelivered once the lease expires.
    DeleteFailed,
}

/// Completion handle of a reserved job.
///
/// Only the first acknowledgment has an effect, later calls return
/// [`AckOutcome::AlreadyResolved`]. Dropping the handle without acknowledging leaves the
/// row leased until `locked_until`, after which any worker can reserve it again.
pub struct Ack {
    id: i64,
    gateway: Arc<dyn StorageGateway>,
    resolved: AtomicBool,
    slot: Option<OutstandingSlot>,
}

impl Ack {
    pub(crate) fn new(id: i64, gateway: Arc<dyn StorageGateway>) -> Self {
        Self {
            id,
            gateway,
            resolved: AtomicBool::new(false),
            slot: None,
        }
    }

    pub(crate) fn hold(&mut self, slot: OutstandingSlot) {
        self.slot = Some(slot);
    }

    pub fn job_id(&self) -> i64 {
        self.id
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::Acquire)
    }

    /// Mark the job as done and delete it.
    pub async fn complete(&self) -> AckOutcome {
        if self.resolve() {
            return AckOutcome::AlreadyResolved;
        }

        let outcome = match self.gateway.delete(self.id).await {
            Ok(0) => {
                tracing::warn!(job_id = self.id, "Acknowledged job was no longer stored");
                AckOutcome::Missing
            }
            Ok(_) => AckOutcome::Deleted,
            Err(error) => {
                tracing::error!(
                    job_id = self.id,
                    error = %error,
                    "Failed to delete acknowledged job, it will be redelivered after its lease"
                );
                AckOutcome::DeleteFailed
            }
        };

        self.release();
        outcome
    }

    /// Mark the job as failed. The row is kept and becomes claimable when the lease expires.
    pub async fn fail(&self, reason: impl Display) -> AckOutcome {
        if self.resolve() {
            return AckOutcome::AlreadyResolved;
        }

        tracing::debug!(job_id = self.id, reason = %reason, "Job failed, leaving it for retry");
        self.release();
        AckOutcome::Retained
    }

    /// Acknowledge with the outcome of processing: `Ok` completes, `Err` fails.
    pub async fn ack<E: Display>(&self, result: Result<(), E>) -> AckOutcome {
        match result {
            Ok(()) => self.complete().await,
            Err(error) => self.fail(error).await,
        }
    }

    // Returns whether the handle had already been resolved.
    fn resolve(&self) -> bool {
        self.resolved.swap(true, Ordering::AcqRel)
    }

    fn release(&self) {
        if let Some(slot) = &self.slot {
            slot.release();
        }
    }
}

impl std::fmt::Debug for Ack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ack")
            .field("id", &self.id)
            .field("table", &self.gateway.table_name())
            .field("resolved", &self.is_resolved())
            .finish()
    }
}

/// One unit of a listener's outstanding count.
///
/// Released exactly once, either when the job is acknowledged or when it is dropped.
pub(crate) struct OutstandingSlot {
    outstanding: Arc<AtomicUsize>,
    released: AtomicBool,
}

impl OutstandingSlot {
    pub(crate) fn acquire(outstanding: Arc<AtomicUsize>) -> Self {
        outstanding.fetch_add(1, Ordering::AcqRel);
        Self {
            outstanding,
            released: AtomicBool::new(false),
        }
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Drop for OutstandingSlot {
    fn drop(&mut self) {
        self.release();
    }
}

/// A reserved job: the decoded payload, the row it came from and its completion handle.
#[derive(Debug)]
pub struct Job<T> {
    payload: T,
    queue: String,
    worker: String,
    locked_until: DateTime<Utc>,
    create_time: DateTime<Utc>,
    update_time: DateTime<Utc>,
    ack: Ack,
}

impl<T> Job<T> {
    pub(crate) fn new(row: JobRow, payload: T, gateway: Arc<dyn StorageGateway>) -> Self {
        Self {
            payload,
            ack: Ack::new(row.id, gateway),
            queue: row.queue,
            worker: row.worker,
            locked_until: row.locked_until,
            create_time: row.create_time,
            update_time: row.update_time,
        }
    }

    pub(crate) fn hold(&mut self, slot: OutstandingSlot) {
        self.ack.hold(slot);
    }

    pub fn id(&self) -> i64 {
        self.ack.job_id()
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Token of the reservation holding this job.
    pub fn worker(&self) -> &str {
        &self.worker
    }

    /// End of the lease. Past this instant another worker may reserve the job.
    pub fn locked_until(&self) -> DateTime<Utc> {
        self.locked_until
    }

    pub fn create_time(&self) -> DateTime<Utc> {
        self.create_time
    }

    pub fn update_time(&self) -> DateTime<Utc> {
        self.update_time
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_parts(self) -> (T, Ack) {
        (self.payload, self.ack)
    }

    pub async fn complete(&self) -> AckOutcome {
        self.ack.complete().await
    }

    pub async fn fail(&self, reason: impl Display) -> AckOutcome {
        self.ack.fail(reason).await
    }

    pub async fn ack<E: Display>(&self, result: Result<(), E>) -> AckOutcome {
        self.ack.ack(result).await
    }
}
