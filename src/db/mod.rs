//! Item store: schema, pool bootstrap and every SQL statement the crate runs.
//!
//! Nothing outside this module writes to `queue_items`.

use crate::error::Result;
use crate::models::{ItemStatus, QueueItem, StatusCounts};
use sqlx::migrate::Migrator;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

const ITEM_COLUMNS: &str =
    "id, queue_name, payload, created_at, scheduled_at, status, attempts, last_attempt_at";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// Embed migrations from the `migrations` directory
static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Make sure the database file's directory exists. With `force_recreate`, an
/// existing database (and its WAL side files) is removed first.
pub fn prepare_db_file(db_file: &Path, force_recreate: bool) -> Result<()> {
    if let Some(dir) = db_file.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)?;
    }
    if force_recreate {
        for path in [
            db_file.to_path_buf(),
            side_file(db_file, "-wal"),
            side_file(db_file, "-shm"),
        ] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
    Ok(())
}

fn side_file(db_file: &Path, suffix: &str) -> PathBuf {
    let mut name = db_file.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Open a pool on the given file, creating it if missing.
pub async fn init_pool_at(db_file: &Path) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::new()
        .filename(db_file)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(BUSY_TIMEOUT);
    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;
    Ok(pool)
}

/// Apply the embedded migrations. Safe to run on every start.
pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    MIGRATOR.run(pool).await?;
    Ok(())
}

pub async fn insert_item(
    pool: &SqlitePool,
    queue_name: &str,
    payload: &[u8],
    created_at: i64,
    scheduled_at: i64,
) -> Result<i64> {
    let rec = sqlx::query(
        "INSERT INTO queue_items (queue_name, payload, created_at, scheduled_at, status, attempts)
         VALUES (?, ?, ?, ?, ?, 0)",
    )
    .bind(queue_name)
    .bind(payload)
    .bind(created_at)
    .bind(scheduled_at)
    .bind(ItemStatus::Pending.as_str())
    .execute(pool)
    .await?;
    Ok(rec.last_insert_rowid())
}

/// Claim the oldest eligible item of `queue_name`.
///
/// The select and the guarded update run in one `BEGIN IMMEDIATE`
/// transaction, which holds SQLite's write lock from the start, so concurrent
/// claimers are serialized. The update still re-checks `status = 'pending'`:
/// if the row was taken in between, nothing is claimed.
pub async fn claim_next_item(
    pool: &SqlitePool,
    queue_name: &str,
    now_ms: i64,
) -> Result<Option<QueueItem>> {
    let mut tx = pool.begin_with("BEGIN IMMEDIATE").await?;

    let candidate = sqlx::query_as::<_, QueueItem>(&format!(
        "SELECT {ITEM_COLUMNS}
         FROM queue_items
         WHERE queue_name = ? AND status = ? AND scheduled_at <= ?
         ORDER BY scheduled_at ASC, id ASC
         LIMIT 1"
    ))
    .bind(queue_name)
    .bind(ItemStatus::Pending.as_str())
    .bind(now_ms)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(mut item) = candidate else {
        tx.commit().await?;
        return Ok(None);
    };

    let res = sqlx::query(
        "UPDATE queue_items
         SET status = ?, attempts = attempts + 1, last_attempt_at = ?
         WHERE id = ? AND queue_name = ? AND status = ?",
    )
    .bind(ItemStatus::Processing.as_str())
    .bind(now_ms)
    .bind(item.id)
    .bind(queue_name)
    .bind(ItemStatus::Pending.as_str())
    .execute(&mut *tx)
    .await?;

    if res.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(None);
    }
    tx.commit().await?;

    item.status = ItemStatus::Processing;
    item.attempts += 1;
    item.last_attempt_at = Some(now_ms);
    Ok(Some(item))
}

/// Unconditionally set the status of one item. Returns the number of rows matched.
pub async fn set_item_status(
    pool: &SqlitePool,
    queue_name: &str,
    id: i64,
    status: ItemStatus,
) -> Result<u64> {
    let res = sqlx::query("UPDATE queue_items SET status = ? WHERE id = ? AND queue_name = ?")
        .bind(status.as_str())
        .bind(id)
        .bind(queue_name)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

/// Put an item back into the pending pool, due at `scheduled_at`.
pub async fn reschedule_item(
    pool: &SqlitePool,
    queue_name: &str,
    id: i64,
    scheduled_at: i64,
) -> Result<u64> {
    let res = sqlx::query(
        "UPDATE queue_items SET status = ?, scheduled_at = ? WHERE id = ? AND queue_name = ?",
    )
    .bind(ItemStatus::Pending.as_str())
    .bind(scheduled_at)
    .bind(id)
    .bind(queue_name)
    .execute(pool)
    .await?;
    Ok(res.rows_affected())
}

/// Count pending items that are due
pub async fn count_due_items(pool: &SqlitePool, queue_name: &str, now_ms: i64) -> Result<i64> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM queue_items
         WHERE queue_name = ? AND status = ? AND scheduled_at <= ?",
    )
    .bind(queue_name)
    .bind(ItemStatus::Pending.as_str())
    .bind(now_ms)
    .fetch_one(pool)
    .await?;
    Ok(count)
}

pub async fn count_items_by_status(pool: &SqlitePool, queue_name: &str) -> Result<StatusCounts> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status, COUNT(*) FROM queue_items WHERE queue_name = ? GROUP BY status",
    )
    .bind(queue_name)
    .fetch_all(pool)
    .await?;

    let mut counts = StatusCounts::default();
    for (status, n) in rows {
        let status = status
            .parse::<ItemStatus>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        counts.add(status, n);
    }
    Ok(counts)
}

pub async fn get_item(pool: &SqlitePool, queue_name: &str, id: i64) -> Result<Option<QueueItem>> {
    let item = sqlx::query_as::<_, QueueItem>(&format!(
        "SELECT {ITEM_COLUMNS} FROM queue_items WHERE id = ? AND queue_name = ?"
    ))
    .bind(id)
    .bind(queue_name)
    .fetch_optional(pool)
    .await?;
    Ok(item)
}

/// List items newest first, optionally restricted to one status.
pub async fn list_items(
    pool: &SqlitePool,
    queue_name: &str,
    status: Option<ItemStatus>,
    limit: i64,
) -> Result<Vec<QueueItem>> {
    let items = match status {
        Some(status) => {
            sqlx::query_as::<_, QueueItem>(&format!(
                "SELECT {ITEM_COLUMNS} FROM queue_items
                 WHERE queue_name = ? AND status = ?
                 ORDER BY id DESC
                 LIMIT ?"
            ))
            .bind(queue_name)
            .bind(status.as_str())
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, QueueItem>(&format!(
                "SELECT {ITEM_COLUMNS} FROM queue_items
                 WHERE queue_name = ?
                 ORDER BY id DESC
                 LIMIT ?"
            ))
            .bind(queue_name)
            .bind(limit)
            .fetch_all(pool)
            .await?
        }
    };
    Ok(items)
}
