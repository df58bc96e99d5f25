//! Worker loop: claims items, dispatches them to a handler and records the outcome.

use crate::backoff::Backoff;
use crate::models::QueueItem;
use crate::queue::Queue;
use futures_util::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::sleep;
use tracing::{Instrument, debug, error, info, info_span, trace, warn};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to wait before claiming again after finding nothing to do.
    pub poll_interval: Duration,
    /// Upper bound on handler invocations running at once. `0` is treated as `1`.
    pub max_concurrent: usize,
    /// Once an item has been claimed this many times, a handler failure is final.
    pub max_attempts: u32,
    pub backoff: Backoff,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_concurrent: 1,
            max_attempts: 3,
            backoff: Backoff::default(),
        }
    }
}

/// Notifications published by a running worker. Nothing in the worker depends
/// on them being received.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerEvent {
    Claimed { id: i64, attempts: u32 },
    Completed { id: i64, attempts: u32 },
    Retrying { id: i64, attempts: u32, delay: Duration, error: String },
    Failed { id: i64, attempts: u32, error: String },
    InternalError { error: String },
}

struct Inner<F> {
    id: Uuid,
    queue: Queue,
    handler: F,
    config: WorkerConfig,
    events: broadcast::Sender<WorkerEvent>,
}

impl<F> Inner<F> {
    fn emit(&self, event: WorkerEvent) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Processes items of one queue with a caller-supplied handler.
///
/// The handler receives the raw payload bytes and reports success or failure.
/// Failures are retried with backoff until `max_attempts` is reached, after
/// which the item is marked failed. A panicking handler counts as a failure.
pub struct Worker<F> {
    inner: Arc<Inner<F>>,
}

impl<F, Fut> Worker<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    pub fn new(queue: Queue, config: WorkerConfig, handler: F) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                id: Uuid::new_v4(),
                queue,
                handler,
                config,
                events,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Receive worker events. Slow receivers may miss events once the
    /// channel buffer is full.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    /// Spawn the worker loop onto the current tokio runtime.
    pub fn start(self) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = self.inner.events.clone();
        let join = tokio::spawn(self.run(shutdown_rx));
        WorkerHandle { shutdown_tx, events, join }
    }

    /// Run until `shutdown` becomes `true` or its sender is dropped, then wait
    /// for in-flight handlers to finish.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let span = info_span!("worker", worker.id = %self.inner.id, queue = %self.inner.queue.name());
        run_loop(self.inner, shutdown).instrument(span).await
    }
}

async fn run_loop<F, Fut>(inner: Arc<Inner<F>>, mut shutdown: watch::Receiver<bool>)
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let semaphore = Arc::new(Semaphore::new(inner.config.max_concurrent.max(1)));
    let mut in_flight = JoinSet::new();
    info!(
        max_concurrent = inner.config.max_concurrent,
        max_attempts = inner.config.max_attempts,
        "worker started"
    );

    loop {
        while let Some(res) = in_flight.try_join_next() {
            log_join_result(res);
        }
        if *shutdown.borrow() {
            break;
        }

        let permit = tokio::select! {
            biased;
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
            permit = semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        // a stop may have landed while waiting for the permit
        if *shutdown.borrow() {
            break;
        }

        match inner.queue.claim().await {
            Ok(Some(item)) => {
                debug!(item.id = item.id, attempts = item.attempts, "claimed item");
                inner.emit(WorkerEvent::Claimed { id: item.id, attempts: item.attempts });
                let span = info_span!("item", item.id = item.id, attempt = item.attempts);
                in_flight.spawn(process_item(inner.clone(), item, permit).instrument(span));
            }
            Ok(None) => {
                drop(permit);
                trace!("no eligible items, polling again in {:?}", inner.config.poll_interval);
                if !pause(&mut shutdown, inner.config.poll_interval).await {
                    break;
                }
            }
            Err(e) => {
                drop(permit);
                error!("failed to claim item: {e}");
                inner.emit(WorkerEvent::InternalError { error: e.to_string() });
                if !pause(&mut shutdown, inner.config.poll_interval).await {
                    break;
                }
            }
        }
    }

    if !in_flight.is_empty() {
        info!(in_flight = in_flight.len(), "stopping, waiting for in-flight handlers");
    }
    while let Some(res) = in_flight.join_next().await {
        log_join_result(res);
    }
    info!("worker stopped");
}

/// Sleep for `period` or until the stop flag changes. Returns `false` once
/// the stop sender is gone.
async fn pause(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        _ = sleep(period) => true,
        changed = shutdown.changed() => changed.is_ok(),
    }
}

async fn process_item<F, Fut>(inner: Arc<Inner<F>>, mut item: QueueItem, _permit: OwnedSemaphorePermit)
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let payload = std::mem::take(&mut item.payload);
    let handler = &inner.handler;
    let outcome = AssertUnwindSafe(async { handler(payload).await })
        .catch_unwind()
        .await
        .map_err(panic_error)
        .and_then(std::convert::identity);

    let (id, attempts) = (item.id, item.attempts);
    match outcome {
        Ok(()) => match inner.queue.complete(id).await {
            Ok(_) => {
                debug!("completed");
                inner.emit(WorkerEvent::Completed { id, attempts });
            }
            Err(e) => report_internal(&inner, format!("failed to mark item {id} completed: {e}")),
        },
        Err(err) if attempts >= inner.config.max_attempts => {
            let error = format!("{err:#}");
            warn!("handler failed on attempt {attempts}, giving up: {error}");
            match inner.queue.fail(id).await {
                Ok(_) => inner.emit(WorkerEvent::Failed { id, attempts, error }),
                Err(e) => report_internal(&inner, format!("failed to mark item {id} failed: {e}")),
            }
        }
        Err(err) => {
            let error = format!("{err:#}");
            let delay = inner.config.backoff.delay(attempts);
            warn!("handler failed on attempt {attempts}, retrying in {delay:?}: {error}");
            match inner.queue.retry_with_delay(id, delay).await {
                Ok(_) => inner.emit(WorkerEvent::Retrying { id, attempts, delay, error }),
                Err(e) => report_internal(&inner, format!("failed to reschedule item {id}: {e}")),
            }
        }
    }
}

fn report_internal<F>(inner: &Inner<F>, error: String) {
    error!("{error}");
    inner.emit(WorkerEvent::InternalError { error });
}

fn panic_error(payload: Box<dyn Any + Send>) -> anyhow::Error {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        anyhow::anyhow!("handler panicked: {msg}")
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        anyhow::anyhow!("handler panicked: {msg}")
    } else {
        anyhow::anyhow!("handler panicked")
    }
}

fn log_join_result(res: Result<(), JoinError>) {
    if let Err(e) = res {
        error!("item task ended abnormally: {e}");
    }
}

/// Handle to a spawned worker.
///
/// `stop` only prevents new claims; handlers already running finish normally.
/// Dropping the handle also stops the worker.
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    events: broadcast::Sender<WorkerEvent>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn stop(&self) {
        // ignore send error: the loop may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop and wait for the loop and every in-flight handler to finish.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.join.await {
            error!("worker task ended abnormally: {e}");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.events.subscribe()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}
