use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::error::Result;

/// Lifecycle state of a queue item.
///
/// `Pending -> Processing` happens only through a claim. From `Processing` an
/// item moves to `Completed` or `Failed`, or back to `Pending` on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 4] = [
        ItemStatus::Pending,
        ItemStatus::Processing,
        ItemStatus::Completed,
        ItemStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Processing => "processing",
            ItemStatus::Completed => "completed",
            ItemStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown item status '{0}' (expected pending, processing, completed or failed)")]
pub struct ParseStatusError(pub String);

impl FromStr for ItemStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(ItemStatus::Pending),
            "processing" => Ok(ItemStatus::Processing),
            "completed" => Ok(ItemStatus::Completed),
            "failed" => Ok(ItemStatus::Failed),
            _ => Err(ParseStatusError(s.to_string())),
        }
    }
}

/// A row of the `queue_items` table.
///
/// All timestamps are milliseconds since the Unix epoch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: i64,
    pub queue_name: String,
    pub payload: Vec<u8>,
    pub created_at: i64,
    pub scheduled_at: i64,
    pub status: ItemStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<i64>,
}

impl QueueItem {
    /// Decode the payload as JSON.
    pub fn json_payload<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.payload)?)
    }
}

impl<'r> FromRow<'r, SqliteRow> for QueueItem {
    fn from_row(row: &'r SqliteRow) -> sqlx::Result<Self> {
        let status: String = row.try_get("status")?;
        let status = status
            .parse::<ItemStatus>()
            .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        Ok(Self {
            id: row.try_get("id")?,
            queue_name: row.try_get("queue_name")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            scheduled_at: row.try_get("scheduled_at")?,
            status,
            attempts: row.try_get("attempts")?,
            last_attempt_at: row.try_get("last_attempt_at")?,
        })
    }
}

/// Per-status totals for one queue. `pending` includes items not yet due.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl StatusCounts {
    pub(crate) fn add(&mut self, status: ItemStatus, n: i64) {
        match status {
            ItemStatus::Pending => self.pending += n,
            ItemStatus::Processing => self.processing += n,
            ItemStatus::Completed => self.completed += n,
            ItemStatus::Failed => self.failed += n,
        }
    }

    pub fn total(&self) -> i64 {
        self.pending + self.processing + self.completed + self.failed
    }
}
