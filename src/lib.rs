//! A persistent, single-node job queue on SQLite.
//!
//! Producers enqueue opaque payloads (optionally delayed) into named queues
//! sharing one database. Workers claim items atomically, run a handler and
//! retire each item as completed, failed, or pending again with backoff.
//!
//! ```no_run
//! use jobq::queue::{self, Config, Queue};
//! use jobq::worker::{Worker, WorkerConfig};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let pool = queue::init_pool(&Config::at("jobq.db")).await?;
//! let emails = Queue::new(pool, "emails");
//! emails.enqueue(&serde_json::json!({"to": "me@example.com"})).await?;
//!
//! let handle = Worker::new(emails, WorkerConfig::default(), |payload: Vec<u8>| async move {
//!     let job: serde_json::Value = serde_json::from_slice(&payload)?;
//!     tracing::info!("sending {job}");
//!     anyhow::Ok(())
//! })
//! .start();
//! // ...
//! handle.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod cli;
pub mod db;
pub mod error;
pub mod models;
pub mod queue;
pub mod server;
pub mod worker;

pub use backoff::Backoff;
pub use error::{QueueError, Result};
pub use models::{ItemStatus, QueueItem, StatusCounts};
pub use queue::Queue;
pub use worker::{Worker, WorkerConfig, WorkerEvent, WorkerHandle};
