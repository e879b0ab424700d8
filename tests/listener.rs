use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dbqueue::{
    AckOutcome, Job, JobRow, ListenOptions, MemoryGateway, MemoryStore, Queue, QueueError,
    Reserved, StorageGateway,
};
use tokio::sync::mpsc;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

async fn seeded_queue(jobs: i32) -> (MemoryStore, Queue) {
    init_tracing();
    let store = MemoryStore::new();
    let queue = Queue::new(store.gateway("jobs"));
    for i in 0..jobs {
        queue.insert("q", &i).await.unwrap();
    }
    (store, queue)
}

fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.try_recv() {
        items.push(item);
    }
    items
}

/// Consumer that forwards every job to the test without acknowledging it.
fn forward(
    tx: mpsc::UnboundedSender<Reserved<i32>>,
) -> impl Fn(Reserved<i32>) -> std::future::Ready<()> + Send + Sync + 'static {
    move |job| {
        let _ = tx.send(job);
        std::future::ready(())
    }
}

fn jobs(items: Vec<Reserved<i32>>) -> Vec<Job<i32>> {
    items.into_iter().map(|item| item.unwrap()).collect()
}

#[tokio::test(start_paused = true)]
async fn capacity_gates_each_tick() {
    let (store, queue) = seeded_queue(5).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let options = ListenOptions::default()
        .with_interval(Duration::from_millis(100))
        .with_max_outstanding(2);

    let listener = queue.listen("q", options, forward(tx)).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let first = jobs(drain(&mut rx));
    assert_eq!(first.len(), 2);
    assert_eq!(listener.outstanding(), 2);
    assert_eq!(store.claim_calls().await, 1);

    // Full: the next tick does not reach the store.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(drain(&mut rx).is_empty());
    assert_eq!(store.claim_calls().await, 1);

    assert_eq!(first[0].complete().await, AckOutcome::Deleted);
    assert_eq!(listener.outstanding(), 1);

    tokio::time::sleep(Duration::from_millis(100)).await;
    let second = jobs(drain(&mut rx));
    assert_eq!(second.len(), 1);
    assert_eq!(listener.outstanding(), 2);
    assert_eq!(store.claim_calls().await, 2);

    listener.stop();
    listener.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn per_tick_cap_limits_each_reservation() {
    let (_store, queue) = seeded_queue(5).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let options = ListenOptions::default()
        .with_interval(Duration::from_millis(100))
        .with_max_outstanding(10)
        .with_max_per_tick(2);

    let listener = queue.listen("q", options, forward(tx)).unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let mut held = jobs(drain(&mut rx));
    assert_eq!(held.len(), 2);

    tokio::time::sleep(Duration::from_millis(100)).await;
    held.extend(jobs(drain(&mut rx)));
    assert_eq!(held.len(), 4);

    tokio::time::sleep(Duration::from_millis(100)).await;
    held.extend(jobs(drain(&mut rx)));
    assert_eq!(held.len(), 5);
    assert_eq!(listener.outstanding(), 5);

    listener.stop();
    listener.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn outstanding_never_exceeds_ceiling() {
    let (_store, queue) = seeded_queue(20).await;
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let processed = Arc::new(AtomicUsize::new(0));

    let consumer = {
        let in_flight = Arc::clone(&in_flight);
        let peak = Arc::clone(&peak);
        let processed = Arc::clone(&processed);
        move |job: Reserved<i32>| {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            let processed = Arc::clone(&processed);
            async move {
                let job = job.unwrap();
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);

                let work = 10 + (*job.payload() as u64 % 4) * 15;
                tokio::time::sleep(Duration::from_millis(work)).await;

                in_flight.fetch_sub(1, Ordering::SeqCst);
                job.complete().await;
                processed.fetch_add(1, Ordering::SeqCst);
            }
        }
    };

    let options = ListenOptions::default()
        .with_interval(Duration::from_millis(5))
        .with_max_outstanding(3);
    let listener = queue.listen("q", options, consumer).unwrap();

    for _ in 0..200 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(listener.outstanding() <= 3);
        if processed.load(Ordering::SeqCst) == 20 {
            break;
        }
    }

    assert_eq!(processed.load(Ordering::SeqCst), 20);
    assert!(peak.load(Ordering::SeqCst) <= 3);
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert_eq!(queue.size("q").await.unwrap(), 0);

    listener.stop();
    listener.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_jobs_free_their_slot_and_stay_stored() {
    let (store, queue) = seeded_queue(1).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let options = ListenOptions::default()
        .with_interval(Duration::from_millis(100))
        .with_lease_seconds(60);

    let listener = queue.listen("q", options, forward(tx)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let job = jobs(drain(&mut rx)).remove(0);
    assert_eq!(job.fail("downstream timeout").await, AckOutcome::Retained);
    assert_eq!(listener.outstanding(), 0);
    assert_eq!(store.rows("jobs").await.len(), 1);

    // Still leased: polling finds nothing until the lease runs out.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(drain(&mut rx).is_empty());

    store.advance(chrono::Duration::seconds(61)).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    let redelivered = jobs(drain(&mut rx));
    assert_eq!(redelivered.len(), 1);
    assert_eq!(redelivered[0].id(), job.id());

    listener.stop();
    listener.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn dropped_jobs_free_their_slot() {
    let (_store, queue) = seeded_queue(3).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let options = ListenOptions::default()
        .with_interval(Duration::from_millis(100))
        .with_max_outstanding(1);

    let listener = queue.listen("q", options, forward(tx)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let first = jobs(drain(&mut rx));
    assert_eq!(first.len(), 1);
    assert_eq!(listener.outstanding(), 1);

    drop(first);
    assert_eq!(listener.outstanding(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(drain(&mut rx).len(), 1);

    listener.stop();
    listener.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn undecodable_jobs_reach_the_consumer_as_errors() {
    init_tracing();
    let store = MemoryStore::new();
    let queue = Queue::new(store.gateway("jobs"));
    queue.insert("q", "not a number").await.unwrap();
    queue.insert("q", &2).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let options = ListenOptions::default()
        .with_interval(Duration::from_millis(100))
        .with_max_outstanding(5);
    let listener = queue.listen("q", options, forward(tx)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let delivered = drain(&mut rx);
    assert_eq!(delivered.len(), 2);
    assert!(delivered
        .iter()
        .any(|item| matches!(item, Err(QueueError::Decode { .. }))));
    assert!(delivered
        .iter()
        .any(|item| matches!(item, Ok(job) if *job.payload() == 2)));
    assert_eq!(listener.outstanding(), 1);

    listener.stop();
    listener.join().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn stop_leaves_dispatched_jobs_running() {
    let (store, queue) = seeded_queue(2).await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let options = ListenOptions::default()
        .with_interval(Duration::from_millis(100))
        .with_max_outstanding(1);

    let listener = queue.listen("q", options, forward(tx)).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let held = jobs(drain(&mut rx));

    listener.stop();
    let calls = store.claim_calls().await;

    assert_eq!(held[0].complete().await, AckOutcome::Deleted);
    assert_eq!(listener.outstanding(), 0);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(drain(&mut rx).is_empty());
    assert_eq!(store.claim_calls().await, calls);
    assert_eq!(queue.size("q").await.unwrap(), 1);

    listener.join().await.unwrap();
}

/// Gateway whose first claims fail as if the store were unreachable.
struct Unreachable {
    inner: MemoryGateway,
    failures_left: AtomicUsize,
}

#[async_trait]
impl StorageGateway for Unreachable {
    fn table_name(&self) -> &str {
        self.inner.table_name()
    }

    async fn now(&self) -> Result<DateTime<Utc>, QueueError> {
        self.inner.now().await
    }

    async fn insert(&self, queue: &str, data: &str) -> Result<i64, QueueError> {
        self.inner.insert(queue, data).await
    }

    async fn claim(
        &self,
        queues: &[String],
        worker: &str,
        now: DateTime<Utc>,
        lease_until: DateTime<Utc>,
        limit: usize,
    ) -> Result<u64, QueueError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(anyhow::anyhow!("connection refused").into());
        }
        self.inner.claim(queues, worker, now, lease_until, limit).await
    }

    async fn fetch_claimed(
        &self,
        worker: &str,
        lease_until: DateTime<Utc>,
    ) -> Result<Vec<JobRow>, QueueError> {
        self.inner.fetch_claimed(worker, lease_until).await
    }

    async fn delete(&self, id: i64) -> Result<u64, QueueError> {
        self.inner.delete(id).await
    }

    async fn count(&self, queues: &[String]) -> Result<u64, QueueError> {
        self.inner.count(queues).await
    }
}

#[tokio::test(start_paused = true)]
async fn store_errors_skip_the_tick() {
    init_tracing();
    let store = MemoryStore::new();
    let queue = Queue::new(Unreachable {
        inner: store.gateway("jobs"),
        failures_left: AtomicUsize::new(2),
    });
    queue.insert("q", &1).await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let options = ListenOptions::default().with_interval(Duration::from_millis(100));
    let listener = queue.listen("q", options, forward(tx)).unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(drain(&mut rx).is_empty());
    assert_eq!(listener.outstanding(), 0);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(jobs(drain(&mut rx)).len(), 1);

    listener.stop();
    listener.join().await.unwrap();
}
