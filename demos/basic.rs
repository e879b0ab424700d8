use std::time::Duration;

use dbqueue::{ListenOptions, Queue, QueueConfig, Reserved};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Resize {
    image: String,
    width: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let url = std::env::var("DBQUEUE_URL")
        .unwrap_or_else(|_| "mongodb://localhost:27017/queues".to_string());
    let queue = Queue::connect(&QueueConfig::new(url)).await?;

    for width in [320, 640, 1280] {
        queue
            .insert(
                "thumbnails",
                &Resize {
                    image: "cat.png".into(),
                    width,
                },
            )
            .await?;
    }
    println!("queued: {}", queue.size("thumbnails").await?);

    // Hold at most two jobs at a time, poll every 100ms.
    let options = ListenOptions::default()
        .with_interval(Duration::from_millis(100))
        .with_max_outstanding(2)
        .with_lease_seconds(30);
    let listener = queue.listen("thumbnails", options, |job: Reserved<Resize>| async move {
        match job {
            Ok(job) => {
                println!("resizing {:?}", job.payload());
                job.complete().await;
            }
            Err(e) => eprintln!("skipping unreadable job: {e}"),
        }
    })?;

    tokio::time::sleep(Duration::from_secs(1)).await;
    listener.stop();
    listener.join().await?;

    println!("left: {}", queue.size("thumbnails").await?);
    Ok(())
}
