//! Enqueues five jobs with increasing delays and processes them with a worker.
//! Job 3 fails twice before succeeding. Stop with Ctrl+C.
//!
//! Run with `cargo run --example simple`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use jobq::backoff::Backoff;
use jobq::queue::{self, Config, Queue};
use jobq::worker::{Worker, WorkerConfig, WorkerEvent};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct Job {
    id: String,
    message: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let pool = queue::init_pool(&Config::at("./jobq-demo.db"))
        .await
        .context("opening demo database")?;
    let q = Queue::new(pool, "example");

    let config = WorkerConfig {
        poll_interval: Duration::from_secs(2),
        max_concurrent: 1,
        max_attempts: 3,
        backoff: Backoff::new(Duration::from_secs(1)),
    };

    let seen: Arc<Mutex<HashMap<String, u32>>> = Arc::default();
    let worker = Worker::new(q.clone(), config, move |payload: Vec<u8>| {
        let seen = seen.clone();
        async move {
            let job: Job = serde_json::from_slice(&payload)?;
            let calls = {
                let mut seen = seen.lock().map_err(|_| anyhow::anyhow!("poisoned"))?;
                let n = seen.entry(job.id.clone()).or_default();
                *n += 1;
                *n
            };
            tracing::info!("processing {}: {}", job.id, job.message);
            if job.id == "job-3" && calls <= 2 {
                anyhow::bail!("simulated failure for {} (call {calls})", job.id);
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
            anyhow::Ok(())
        }
    });

    let mut events = worker.subscribe();
    tokio::spawn(async move {
        while let Ok(ev) = events.recv().await {
            match ev {
                WorkerEvent::Retrying { id, attempts, delay, error } => {
                    tracing::warn!("item {id} attempt {attempts} failed ({error}); retrying in {delay:?}")
                }
                WorkerEvent::Failed { id, error, .. } => tracing::error!("item {id} gave up: {error}"),
                WorkerEvent::Completed { id, attempts } => {
                    tracing::info!("item {id} done after {attempts} attempt(s)")
                }
                _ => {}
            }
        }
    });
    let handle = worker.start();

    for i in 0..5u64 {
        let job = Job {
            id: format!("job-{}", i + 1),
            message: format!("This is job {}", i + 1),
        };
        let id = q.enqueue_with_delay(&job, Duration::from_secs(i)).await?;
        tracing::info!("enqueued {} with id {id}", job.id);
    }

    tracing::info!("worker running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    handle.shutdown().await;
    tracing::info!("worker stopped");
    Ok(())
}
