use crate::backoff::Backoff;
use crate::models::{ItemStatus, QueueItem};
use crate::queue::{self, Config, Queue};
use crate::server;
use crate::worker::{Worker, WorkerConfig};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// jobq CLI interface
#[derive(Parser, Debug)]
#[command(name = "jobq", about = "SQLite-backed job queue")]
pub struct Cli {
    /// Path to the SQLite database file
    #[arg(long, global = true, default_value = "jobq.db")]
    pub db: PathBuf,
    /// Name of the queue to operate on
    #[arg(short, long, global = true, default_value = "default")]
    pub queue: String,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Create the database and apply the schema
    Init,
    /// Enqueue JSON payload(s). Use --json or --file (JSON value, JSON array or NDJSON).
    Enqueue {
        /// Inline JSON payload (e.g. '{"k":"v"}')
        #[arg(long, conflicts_with = "file")]
        json: Option<String>,
        /// Read payload(s) from file
        #[arg(long)]
        file: Option<PathBuf>,
        /// Delay before the item becomes claimable, in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
    /// List items in the queue, newest first
    List {
        /// Filter by status (pending, processing, completed, failed)
        #[arg(long)]
        status: Option<ItemStatus>,
        /// Maximum number of items to show
        #[arg(long, default_value_t = 10)]
        limit: i64,
    },
    /// Show the number of due items and per-status counts
    Size,
    /// Put an item back into the pending pool (e.g. after it failed)
    Retry {
        /// Item ID
        id: i64,
        /// Delay before the item becomes claimable again, in milliseconds
        #[arg(long, default_value_t = 0)]
        delay_ms: u64,
    },
    /// Run a worker that prints each payload and completes it
    Work {
        /// Poll interval when the queue is empty, in milliseconds
        #[arg(long, default_value_t = 5_000)]
        poll_ms: u64,
        /// Maximum number of items processed at once
        #[arg(
            long,
            default_value_t = 1,
            value_parser = clap::builder::RangedU64ValueParser::<usize>::new().range(1..)
        )]
        max_concurrent: usize,
        /// Attempts before an item is marked failed
        #[arg(long, default_value_t = 3)]
        max_attempts: u32,
        /// Base retry delay, in milliseconds
        #[arg(long, default_value_t = 2_000)]
        backoff_ms: u64,
        /// Randomize retry delays
        #[arg(long)]
        jitter: bool,
    },
    /// Run the HTTP server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value_t = 8888)]
        port: u16,
    },
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let pool = queue::init_pool(&Config::at(&self.db))
            .await
            .with_context(|| format!("Failed to open database {}", self.db.display()))?;
        let q = Queue::new(pool.clone(), self.queue);

        match self.command {
            Commands::Init => {
                println!("Database {} initialized", self.db.display());
            }
            Commands::Enqueue { json, file, delay_ms } => {
                let mut items: Vec<Value> = Vec::new();
                if let Some(path) = file {
                    items.extend(read_payload_file(&path)?);
                }
                if let Some(raw) = json {
                    items.push(serde_json::from_str(&raw).context("Invalid JSON payload")?);
                }
                if items.is_empty() {
                    anyhow::bail!("Provide --json or --file");
                }
                let delay = Duration::from_millis(delay_ms);
                for v in &items {
                    let id = q
                        .enqueue_with_delay(v, delay)
                        .await
                        .context("Failed to enqueue item")?;
                    println!("Enqueued item with ID {} to queue '{}'", id, q.name());
                }
            }
            Commands::List { status, limit } => {
                let items = q.list(status, limit).await.context("Error listing items")?;
                println!("Items in queue '{}':", q.name());
                println!(
                    "{:<6} {:<11} {:<9} {:<14} {:<14} PAYLOAD",
                    "ID", "STATUS", "ATTEMPTS", "CREATED_AT", "SCHEDULED_AT"
                );
                for item in items {
                    println!(
                        "{:<6} {:<11} {:<9} {:<14} {:<14} {}",
                        item.id,
                        item.status,
                        item.attempts,
                        item.created_at,
                        item.scheduled_at,
                        payload_text(&item)
                    );
                }
            }
            Commands::Size => {
                let size = q.size().await.context("Error counting items")?;
                let c = q.counts().await.context("Error counting items")?;
                println!("Queue '{}': {} item(s) ready", q.name(), size);
                println!(
                    "  pending={} processing={} completed={} failed={}",
                    c.pending, c.processing, c.completed, c.failed
                );
            }
            Commands::Retry { id, delay_ms } => {
                if q.retry_with_delay(id, Duration::from_millis(delay_ms)).await? {
                    println!("Item {} requeued", id);
                } else {
                    anyhow::bail!("Item {} not found in queue '{}'", id, q.name());
                }
            }
            Commands::Work { poll_ms, max_concurrent, max_attempts, backoff_ms, jitter } => {
                let config = WorkerConfig {
                    poll_interval: Duration::from_millis(poll_ms),
                    max_concurrent,
                    max_attempts,
                    backoff: Backoff::new(Duration::from_millis(backoff_ms)).with_jitter(jitter),
                };
                let queue_name = q.name().to_owned();
                let worker = Worker::new(q, config, |payload: Vec<u8>| async move {
                    println!("{}", String::from_utf8_lossy(&payload));
                    anyhow::Ok(())
                });
                tracing::info!(
                    "Worker {} processing queue '{}' - Use Ctrl+C to stop.",
                    worker.id(),
                    queue_name
                );
                let handle = worker.start();
                tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
                tracing::info!("Received Ctrl+C, waiting for in-flight items...");
                handle.shutdown().await;
            }
            Commands::Serve { port } => server::run_server(pool, port).await?,
        }
        Ok(())
    }
}

/// Parse a payload file: a JSON array yields one item per element, any other
/// JSON value a single item, otherwise the file is read as NDJSON.
fn read_payload_file(path: &Path) -> Result<Vec<Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read file: {}", path.display()))?;
    match serde_json::from_str::<Value>(&content) {
        Ok(Value::Array(items)) => return Ok(items),
        Ok(v) => return Ok(vec![v]),
        Err(_) => {}
    }
    let mut items = Vec::new();
    for (i, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let v: Value = serde_json::from_str(line)
            .with_context(|| format!("Invalid JSON at line {}", i + 1))?;
        items.push(v);
    }
    Ok(items)
}

fn payload_text(item: &QueueItem) -> String {
    match serde_json::from_slice::<Value>(&item.payload) {
        Ok(v) => v.to_string(),
        Err(_) => String::from_utf8_lossy(&item.payload).into_owned(),
    }
}
