use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode},
};
use jobq::models::ItemStatus;
use jobq::queue::{self, Config, Queue};
use jobq::server::{ItemView, SizeView, app_router};
use serde_json::{Value, json};
use tower::ServiceExt; // for `oneshot`

async fn setup(tmp: &tempfile::TempDir) -> anyhow::Result<(Router, sqlx::SqlitePool)> {
    let mut cfg = Config::at(tmp.path().join("server.db"));
    cfg.force_recreate = true;
    let pool = queue::init_pool(&cfg).await?;
    Ok((app_router(pool.clone()), pool))
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> anyhow::Result<(StatusCode, Vec<u8>)> {
    let mut req = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(v) => {
            req = req.header("content-type", "application/json");
            Body::from(serde_json::to_vec(&v)?)
        }
        None => Body::empty(),
    };
    let resp = app.clone().oneshot(req.body(body)?).await?;
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), 1024 * 1024).await?;
    Ok((status, bytes.to_vec()))
}

#[tokio::test]
async fn health_ok() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (app, _pool) = setup(&dir).await?;
    let (status, body) = send(&app, "GET", "/health", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, b"ok");
    Ok(())
}

#[tokio::test]
async fn enqueue_list_and_get() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (app, _pool) = setup(&dir).await?;

    let (status, body) = send(
        &app,
        "POST",
        "/queues/mail/items",
        Some(json!({"payload": {"to": "a@example.com"}})),
    )
    .await?;
    assert_eq!(status, StatusCode::CREATED);
    let id = serde_json::from_slice::<Value>(&body)?["id"].as_i64().expect("id");

    let (status, body) = send(&app, "GET", "/queues/mail/items", None).await?;
    assert_eq!(status, StatusCode::OK);
    let items: Vec<ItemView> = serde_json::from_slice(&body)?;
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].id, id);
    assert_eq!(items[0].status, ItemStatus::Pending);
    assert_eq!(items[0].payload, json!({"to": "a@example.com"}));

    let (status, body) = send(&app, "GET", &format!("/queues/mail/items/{id}"), None).await?;
    assert_eq!(status, StatusCode::OK);
    let item: ItemView = serde_json::from_slice(&body)?;
    assert_eq!(item.queue_name, "mail");
    assert_eq!(item.attempts, 0);

    // Same id under another queue name is not visible
    let (status, _) = send(&app, "GET", &format!("/queues/other/items/{id}"), None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn delayed_enqueue_is_not_counted_as_ready() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (app, _pool) = setup(&dir).await?;

    send(&app, "POST", "/queues/q/items", Some(json!({"payload": 1}))).await?;
    send(&app, "POST", "/queues/q/items", Some(json!({"payload": 2, "delay_ms": 60_000}))).await?;

    let (status, body) = send(&app, "GET", "/queues/q/size", None).await?;
    assert_eq!(status, StatusCode::OK);
    let size: SizeView = serde_json::from_slice(&body)?;
    assert_eq!(size.size, 1);
    assert_eq!(size.counts.pending, 2);
    Ok(())
}

#[tokio::test]
async fn list_rejects_unknown_status() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (app, _pool) = setup(&dir).await?;
    let (status, _) = send(&app, "GET", "/queues/q/items?status=done", None).await?;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, "GET", "/queues/q/items?status=failed&limit=5", None).await?;
    assert_eq!(status, StatusCode::OK);
    assert!(serde_json::from_slice::<Vec<ItemView>>(&body)?.is_empty());
    Ok(())
}

#[tokio::test]
async fn retry_requeues_failed_item() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (app, pool) = setup(&dir).await?;
    let q = Queue::new(pool, "ops");
    let id = q.enqueue(&json!({"n": 1})).await?;
    q.claim().await?.expect("item");
    q.fail(id).await?;
    assert!(q.claim().await?.is_none());

    let (status, _) = send(&app, "POST", &format!("/queues/ops/items/{id}/retry"), None).await?;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let item = q.claim().await?.expect("requeued item");
    assert_eq!(item.id, id);
    assert_eq!(item.attempts, 2);

    let (status, _) = send(&app, "POST", "/queues/ops/items/999999/retry", None).await?;
    assert_eq!(status, StatusCode::NOT_FOUND);
    Ok(())
}

#[tokio::test]
async fn non_json_payload_is_rendered_as_text() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let (app, pool) = setup(&dir).await?;
    let q = Queue::new(pool, "raw");
    let id = q.enqueue_bytes(b"plain text", std::time::Duration::ZERO).await?;

    let (_, body) = send(&app, "GET", &format!("/queues/raw/items/{id}"), None).await?;
    let item: ItemView = serde_json::from_slice(&body)?;
    assert_eq!(item.payload, json!("plain text"));
    Ok(())
}
