//! Polling consumer.
//!
//! A listener owns one task that wakes up every `interval_ms`, works out how many more
//! jobs it may hold, reserves at most that many and hands each one to the consumer on
//! its own task. The number of jobs handed out but not yet acknowledged never exceeds
//! `max_outstanding`.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error, trace};

use crate::{
    codec::Codec,
    config::{ConsumeOptions, ListenOptions},
    error::QueueError,
    job_handle::OutstandingSlot,
    queue::{Queue, Reserved},
    types::QueueNames,
};

/// Handle of a running [`Queue::listen`] loop.
///
/// Stopping only prevents new reservations; jobs already handed to the consumer keep
/// running. Dropping the handle stops the loop as well.
#[derive(Debug)]
#[must_use = "dropping a Listener stops it"]
pub struct Listener {
    token: CancellationToken,
    outstanding: Arc<AtomicUsize>,
    task: JoinHandle<()>,
    _guard: DropGuard,
}

impl Listener {
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Jobs handed to the consumer and not yet acknowledged.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Wait for the polling loop to exit after [`Listener::stop`].
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::ListenerPanicked`] if the loop panicked.
    pub async fn join(self) -> Result<(), QueueError> {
        let Listener { task, _guard, .. } = self;
        task.await
            .map_err(|e| QueueError::ListenerPanicked(e.to_string()))
    }
}

impl<C: Codec> Queue<C> {
    /// Poll `queue` and hand every reserved job to `consumer`.
    ///
    /// The consumer receives either a job, which it acknowledges through
    /// [`Job::complete`](crate::Job::complete) / [`Job::fail`](crate::Job::fail), or the
    /// decode error of a job that could not be read. Acknowledging or dropping a job frees
    /// its place under `max_outstanding`.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`QueueError::InvalidConfig`] if `options` are invalid.
    pub fn listen<T, F, Fut>(
        &self,
        queue: impl Into<QueueNames>,
        options: ListenOptions,
        consumer: F,
    ) -> Result<Listener, QueueError>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Reserved<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        options.validate()?;

        let queues = queue.into();
        let token = CancellationToken::new();
        let outstanding = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn(poll(
            self.clone(),
            queues,
            options,
            Arc::new(consumer),
            token.clone(),
            Arc::clone(&outstanding),
        ));

        Ok(Listener {
            _guard: token.clone().drop_guard(),
            token,
            outstanding,
            task,
        })
    }
}

async fn poll<C, T, F, Fut>(
    queue: Queue<C>,
    queues: QueueNames,
    options: ListenOptions,
    consumer: Arc<F>,
    token: CancellationToken,
    outstanding: Arc<AtomicUsize>,
) where
    C: Codec,
    T: DeserializeOwned + Send + 'static,
    F: Fn(Reserved<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    debug!(queues = %queues, ?options, "Listener starting");

    let mut ticker = tokio::time::interval(options.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {}
        }

        // Capacity is settled before the store round trip; ticks never overlap since the
        // next one is only awaited after dispatch.
        let capacity = options.capacity(outstanding.load(Ordering::Acquire));
        if capacity == 0 {
            trace!(queues = %queues, "At max outstanding, skipping tick");
            continue;
        }

        let consume = ConsumeOptions {
            lease_seconds: options.lease_seconds,
            max_count: capacity,
        };
        let reserved = match queue.consume::<T>(&queues, consume).await {
            Ok(reserved) => reserved,
            Err(e) => {
                error!(queues = %queues, error = %e, "Failed to reserve jobs");
                continue;
            }
        };

        if reserved.is_empty() {
            continue;
        }
        debug!(queues = %queues, count = reserved.len(), capacity, "Dispatching jobs");

        for item in reserved {
            let item = item.map(|mut job| {
                job.hold(OutstandingSlot::acquire(Arc::clone(&outstanding)));
                job
            });
            let consumer = Arc::clone(&consumer);
            tokio::spawn(async move { consumer(item).await });
        }
    }

    debug!(queues = %queues, "Listener stopped");
}
