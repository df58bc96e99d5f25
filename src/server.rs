use crate::error::QueueError;
use crate::models::{ItemStatus, QueueItem, StatusCounts};
use crate::queue::Queue;
use anyhow::Context;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sqlx::SqlitePool;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;

type ApiError = (StatusCode, String);

const BIND_ENV: &str = "JOBQ_BIND";

/// Serve the HTTP surface until Ctrl+C. The listen address is `JOBQ_BIND`
/// (default `127.0.0.1`) on `port`.
pub async fn run_server(pool: SqlitePool, port: u16) -> anyhow::Result<()> {
    let addr = bind_addr(std::env::var(BIND_ENV).ok().as_deref(), port)?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(%addr, "jobq server listening - Use Ctrl+C to quit.");

    axum::serve(listener, app_router(pool))
        .with_graceful_shutdown(ctrl_c())
        .await
        .context("HTTP server failed")?;
    tracing::info!("server stopped");
    Ok(())
}

fn bind_addr(ip: Option<&str>, port: u16) -> anyhow::Result<SocketAddr> {
    let ip = match ip.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => raw
            .parse::<IpAddr>()
            .with_context(|| format!("{BIND_ENV} is not an IP address: '{raw}'"))?,
        None => IpAddr::V4(Ipv4Addr::LOCALHOST),
    };
    Ok(SocketAddr::new(ip, port))
}

async fn ctrl_c() {
    match signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C, draining connections"),
        // without a signal handler the server runs until killed
        Err(e) => {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await
        }
    }
}

/// Construct the Axum `Router` for the service, injecting shared state.
pub fn app_router(pool: SqlitePool) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/queues/{name}/size", get(queue_size))
        .route("/queues/{name}/items", get(list_items).post(enqueue_item))
        .route("/queues/{name}/items/{id}", get(get_item))
        .route("/queues/{name}/items/{id}/retry", post(retry_item))
        .with_state(pool)
}

/// An item as rendered over HTTP; the payload is shown as JSON when it parses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ItemView {
    pub id: i64,
    pub queue_name: String,
    pub payload: Value,
    pub created_at: i64,
    pub scheduled_at: i64,
    pub status: ItemStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<i64>,
}

impl From<QueueItem> for ItemView {
    fn from(item: QueueItem) -> Self {
        let payload = serde_json::from_slice(&item.payload)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&item.payload).into_owned()));
        Self {
            id: item.id,
            queue_name: item.queue_name,
            payload,
            created_at: item.created_at,
            scheduled_at: item.scheduled_at,
            status: item.status,
            attempts: item.attempts,
            last_attempt_at: item.last_attempt_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SizeView {
    pub size: i64,
    pub counts: StatusCounts,
}

// Request payload for enqueueing an item
#[derive(Deserialize)]
struct EnqueueBody {
    payload: Value,
    #[serde(default)]
    delay_ms: Option<u64>,
}

// Query parameters for listing items
#[derive(Deserialize)]
struct ListParams {
    status: Option<String>,
    limit: Option<i64>,
}

#[derive(Deserialize)]
struct RetryParams {
    delay_ms: Option<u64>,
}

fn internal(e: QueueError) -> ApiError {
    tracing::error!("request failed: {e}");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

// Enqueue a single item into a queue
async fn enqueue_item(
    Path(name): Path<String>,
    State(pool): State<SqlitePool>,
    Json(body): Json<EnqueueBody>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let delay = Duration::from_millis(body.delay_ms.unwrap_or(0));
    let id = Queue::new(pool, name)
        .enqueue_with_delay(&body.payload, delay)
        .await
        .map_err(internal)?;
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

// List items in a queue, newest first
async fn list_items(
    Path(name): Path<String>,
    Query(params): Query<ListParams>,
    State(pool): State<SqlitePool>,
) -> Result<Json<Vec<ItemView>>, ApiError> {
    let status = params
        .status
        .as_deref()
        .map(str::parse::<ItemStatus>)
        .transpose()
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let limit = params.limit.unwrap_or(10);
    let items = Queue::new(pool, name)
        .list(status, limit)
        .await
        .map_err(internal)?;
    Ok(Json(items.into_iter().map(ItemView::from).collect()))
}

async fn get_item(
    Path((name, id)): Path<(String, i64)>,
    State(pool): State<SqlitePool>,
) -> Result<Json<ItemView>, ApiError> {
    let item = Queue::new(pool, name.clone())
        .get(id)
        .await
        .map_err(internal)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, format!("Item {id} not found in queue '{name}'")))?;
    Ok(Json(item.into()))
}

// Requeue an item (typically one that failed)
async fn retry_item(
    Path((name, id)): Path<(String, i64)>,
    Query(params): Query<RetryParams>,
    State(pool): State<SqlitePool>,
) -> StatusCode {
    let delay = params.delay_ms.unwrap_or(0);
    match Queue::new(pool, name).retry_with_delay(id, Duration::from_millis(delay)).await {
        Ok(true) => StatusCode::NO_CONTENT,
        Ok(false) => StatusCode::NOT_FOUND,
        Err(e) => internal(e).0,
    }
}

async fn queue_size(
    Path(name): Path<String>,
    State(pool): State<SqlitePool>,
) -> Result<Json<SizeView>, ApiError> {
    let q = Queue::new(pool, name);
    let size = q.size().await.map_err(internal)?;
    let counts = q.counts().await.map_err(internal)?;
    Ok(Json(SizeView { size, counts }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bind_defaults_to_localhost() {
        let addr = bind_addr(None, 8888).unwrap();
        assert_eq!(addr, SocketAddr::from(([127, 0, 0, 1], 8888)));
        assert_eq!(bind_addr(Some("  "), 1).unwrap().ip(), IpAddr::V4(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn bind_accepts_v4_and_v6() {
        assert_eq!(bind_addr(Some("0.0.0.0"), 80).unwrap().to_string(), "0.0.0.0:80");
        assert_eq!(bind_addr(Some("::"), 80).unwrap().to_string(), "[::]:80");
    }

    #[test]
    fn bind_rejects_garbage() {
        let err = bind_addr(Some("localhost"), 80).unwrap_err();
        assert!(err.to_string().contains("JOBQ_BIND"), "{err}");
    }
}
