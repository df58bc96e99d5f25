use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use jobq::models::ItemStatus;
use jobq::queue::{self, Config, Queue};
use jobq::server::app_router;
use serde_json::json;
use tokio::sync::{Barrier, Mutex};
use tower::ServiceExt; // for `oneshot`

// Helper to build a test Config pointing to a temp DB
fn test_config(tmp: &tempfile::TempDir) -> Config {
    let mut cfg = Config::at(tmp.path().join("stress.db"));
    cfg.force_recreate = true;
    cfg
}

fn env_or(name: &str, default: usize) -> usize {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn two_simultaneous_claims_on_one_item() -> anyhow::Result<()> {
    let dir = tempfile::tempdir()?;
    let pool = queue::init_pool(&test_config(&dir)).await?;
    let q = Queue::new(pool, "race");

    for _ in 0..25 {
        let id = q.enqueue(&json!({"race": true})).await?;

        let barrier = Arc::new(Barrier::new(2));
        let claimers: Vec<_> = (0..2)
            .map(|_| {
                let q = q.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    q.claim().await
                })
            })
            .collect();

        let mut winners = Vec::new();
        for c in claimers {
            if let Some(item) = c.await?? {
                winners.push(item);
            }
        }
        assert_eq!(winners.len(), 1, "exactly one claimer must win item {id}");
        assert_eq!(winners[0].id, id);
        assert_eq!(winners[0].attempts, 1);

        let stored = q.get(id).await?.expect("row");
        assert_eq!(stored.status, ItemStatus::Processing);
        assert_eq!(stored.attempts, 1);
        q.complete(id).await?;
    }
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimers_never_share_an_item() -> anyhow::Result<()> {
    let total = env_or("JOBQ_STRESS_TOTAL", 300);
    let claimers = env_or("JOBQ_STRESS_CLAIMERS", 8);

    let dir = tempfile::tempdir()?;
    let pool = queue::init_pool(&test_config(&dir)).await?;
    let q = Queue::new(pool, "stress");
    for i in 0..total {
        q.enqueue(&json!({"seq": i})).await?;
    }

    let seen = Arc::new(Mutex::new(HashSet::<i64>::new()));
    let mut tasks = Vec::with_capacity(claimers);
    for _ in 0..claimers {
        let q = q.clone();
        let seen = seen.clone();
        tasks.push(tokio::spawn(async move {
            let mut mine = 0usize;
            while let Some(item) = q.claim().await? {
                if !seen.lock().await.insert(item.id) {
                    anyhow::bail!("duplicate claim detected for id={}", item.id);
                }
                assert_eq!(item.attempts, 1);
                q.complete(item.id).await?;
                mine += 1;
            }
            anyhow::Ok(mine)
        }));
    }

    let mut claimed = 0;
    for t in tasks {
        claimed += t.await??;
    }
    assert_eq!(claimed, total, "claimed != total");
    assert_eq!(seen.lock().await.len(), total);

    let counts = q.counts().await?;
    assert_eq!(counts.completed as usize, total);
    assert_eq!(counts.pending + counts.processing + counts.failed, 0);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_http_enqueue_no_loss() -> anyhow::Result<()> {
    let concurrency = env_or("JOBQ_STRESS_CONCURRENCY", 16);
    let total = env_or("JOBQ_STRESS_HTTP_TOTAL", 400);

    let dir = tempfile::tempdir()?;
    let pool = queue::init_pool(&test_config(&dir)).await?;
    let qname = "http-stress";

    // Build the in-process app router (no sockets)
    let app = app_router(pool.clone());

    // Partition total across workers
    let per = total / concurrency;
    let extra = total % concurrency;

    let mut tasks = Vec::with_capacity(concurrency);
    for w in 0..concurrency {
        let app = app.clone();
        let count = per + if w < extra { 1 } else { 0 };
        tasks.push(tokio::spawn(async move {
            for i in 0..count {
                let body = json!({ "payload": {"worker": w, "seq": i} });
                let req = Request::builder()
                    .method("POST")
                    .uri(format!("/queues/{}/items", qname))
                    .header("content-type", "application/json")
                    .body(Body::from(serde_json::to_vec(&body)?))?;
                let resp = app.clone().oneshot(req).await?;
                if resp.status() != StatusCode::CREATED {
                    anyhow::bail!("enqueue failed: {}", resp.status());
                }
            }
            anyhow::Ok(())
        }));
    }
    for t in tasks {
        t.await??;
    }

    // Poll until the ready count reaches the expected total or timeout
    let q = Queue::new(pool, qname);
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    loop {
        let ready = q.size().await?;
        if ready as usize == total {
            break;
        }
        if std::time::Instant::now() > deadline {
            anyhow::bail!("timed out: ready={} expected={}", ready, total);
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}
