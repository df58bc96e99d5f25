use crate::db;
use crate::error::Result;
use crate::models::{ItemStatus, QueueItem, StatusCounts};
use serde::Serialize;
use sqlx::SqlitePool;
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Configuration for queue/database setup
#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub force_recreate: bool,
}

impl Config {
    pub fn at(db_path: impl Into<PathBuf>) -> Self {
        Self { db_path: db_path.into(), force_recreate: false }
    }
}

/// Initialize the pool, ensuring the database exists and the schema is current.
pub async fn init_pool(cfg: &Config) -> Result<SqlitePool> {
    db::prepare_db_file(&cfg.db_path, cfg.force_recreate)?;
    let pool = db::init_pool_at(&cfg.db_path).await?;
    db::migrate(&pool).await?;
    Ok(pool)
}

pub(crate) fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn after(now: i64, delay: Duration) -> i64 {
    now.saturating_add(i64::try_from(delay.as_millis()).unwrap_or(i64::MAX))
}

/// Handle on one named queue inside a shared store.
///
/// Cheap to clone; holds nothing but the pool and the queue name.
#[derive(Debug, Clone)]
pub struct Queue {
    pool: SqlitePool,
    name: String,
}

impl Queue {
    pub fn new(pool: SqlitePool, name: impl Into<String>) -> Self {
        Self { pool, name: name.into() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue a JSON-encoded payload, claimable immediately.
    pub async fn enqueue<T: Serialize + ?Sized>(&self, payload: &T) -> Result<i64> {
        self.enqueue_with_delay(payload, Duration::ZERO).await
    }

    /// Enqueue a JSON-encoded payload that becomes claimable after `delay`.
    pub async fn enqueue_with_delay<T: Serialize + ?Sized>(
        &self,
        payload: &T,
        delay: Duration,
    ) -> Result<i64> {
        let bytes = serde_json::to_vec(payload)?;
        self.enqueue_bytes(&bytes, delay).await
    }

    /// Enqueue an already-encoded payload. The store never inspects it.
    pub async fn enqueue_bytes(&self, payload: &[u8], delay: Duration) -> Result<i64> {
        let now = now_ms();
        let id = db::insert_item(&self.pool, &self.name, payload, now, after(now, delay)).await?;
        tracing::debug!(queue = %self.name, id, delay_ms = delay.as_millis() as u64, "enqueued item");
        Ok(id)
    }

    /// Claim the oldest due item, or `None` when nothing is eligible.
    ///
    /// The returned item is `processing` with `attempts` already incremented.
    pub async fn claim(&self) -> Result<Option<QueueItem>> {
        db::claim_next_item(&self.pool, &self.name, now_ms()).await
    }

    /// Mark an item completed. Returns whether a row matched.
    pub async fn complete(&self, id: i64) -> Result<bool> {
        let n = db::set_item_status(&self.pool, &self.name, id, ItemStatus::Completed).await?;
        Ok(n > 0)
    }

    /// Mark an item failed. Returns whether a row matched.
    pub async fn fail(&self, id: i64) -> Result<bool> {
        let n = db::set_item_status(&self.pool, &self.name, id, ItemStatus::Failed).await?;
        Ok(n > 0)
    }

    /// Return an item to `pending`, claimable again after `delay`.
    /// `attempts` is left alone; the next claim increments it.
    pub async fn retry_with_delay(&self, id: i64, delay: Duration) -> Result<bool> {
        let n = db::reschedule_item(&self.pool, &self.name, id, after(now_ms(), delay)).await?;
        Ok(n > 0)
    }

    /// Number of pending items that are due now.
    pub async fn size(&self) -> Result<i64> {
        db::count_due_items(&self.pool, &self.name, now_ms()).await
    }

    pub async fn counts(&self) -> Result<StatusCounts> {
        db::count_items_by_status(&self.pool, &self.name).await
    }

    pub async fn get(&self, id: i64) -> Result<Option<QueueItem>> {
        db::get_item(&self.pool, &self.name, id).await
    }

    /// Newest items first, optionally filtered by status.
    pub async fn list(&self, status: Option<ItemStatus>, limit: i64) -> Result<Vec<QueueItem>> {
        db::list_items(&self.pool, &self.name, status, limit).await
    }
}
