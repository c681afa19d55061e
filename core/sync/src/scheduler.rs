//! Background tasks driving a sync engine.
//!
//! One drain task pushes the outbox, one stream task per collection
//! follows the remote change feed, and a ping task watches for the
//! remote store to come back after a connectivity loss.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tidesync_common::{CollectionName, Error, Result};

use crate::engine::{DrainReport, PullReport, SyncEngine};
use crate::retry::is_retryable;

/// Work a caller can ask the scheduler to run now.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncRequest {
    /// One outbox drain cycle.
    Drain,
    /// Poll one collection's change feed until caught up.
    Pull(CollectionName),
    /// Rebuild one collection from a snapshot.
    Resync(CollectionName),
}

/// Result of a [`SyncRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum SyncResult {
    Drained(DrainReport),
    Pulled(PullReport),
    Resynced { applied: usize },
}

type Request = (SyncRequest, oneshot::Sender<Result<SyncResult>>);

/// Running sync tasks for one engine.
pub struct SyncScheduler {
    engine: Arc<SyncEngine>,
    request_tx: mpsc::Sender<Request>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SyncScheduler {
    /// Spawn the drain, ping and stream tasks on the current runtime.
    pub fn start(engine: Arc<SyncEngine>) -> Self {
        let (request_tx, request_rx) = mpsc::channel(100);
        let cancel = CancellationToken::new();

        let mut tasks = vec![
            tokio::spawn(run_drain(engine.clone(), request_rx, cancel.clone())),
            tokio::spawn(run_ping(engine.clone(), cancel.clone())),
        ];
        for collection in &engine.config.collections {
            tasks.push(tokio::spawn(run_stream(
                engine.clone(),
                collection.clone(),
                cancel.clone(),
            )));
        }
        info!(
            "Sync scheduler started with {} collection streams",
            engine.config.collections.len()
        );

        Self {
            engine,
            request_tx,
            cancel,
            tasks,
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// Run a request on the drain task and wait for its result.
    pub async fn request(&self, request: SyncRequest) -> Result<SyncResult> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx
            .send((request, response_tx))
            .await
            .map_err(|_| Error::Shutdown)?;
        response_rx.await.map_err(|_| Error::Shutdown)?
    }

    pub async fn request_drain(&self) -> Result<DrainReport> {
        match self.request(SyncRequest::Drain).await? {
            SyncResult::Drained(report) => Ok(report),
            other => Err(Error::InvalidInput(format!(
                "Unexpected drain result: {:?}",
                other
            ))),
        }
    }

    /// Stop every task. In-flight commits finish first; nothing is lost
    /// since all progress is durable.
    pub async fn shutdown(self) {
        info!("Stopping sync scheduler");
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!("Sync task ended abnormally: {}", e);
            }
        }
        let mut state = self.engine.state.write().await;
        for collection in &self.engine.config.collections {
            state.status_mut(collection).mark_idle();
        }
    }

    /// Stop the tasks and wipe the session's local state.
    pub async fn sign_out(self) -> Result<()> {
        let engine = self.engine.clone();
        self.shutdown().await;
        engine.sign_out()
    }
}

async fn handle_request(engine: &SyncEngine, request: SyncRequest) -> Result<SyncResult> {
    match request {
        SyncRequest::Drain => engine.drain_once().await.map(SyncResult::Drained),
        SyncRequest::Pull(collection) => engine.pull_once(&collection).await.map(SyncResult::Pulled),
        SyncRequest::Resync(collection) => engine
            .resync(&collection)
            .await
            .map(|applied| SyncResult::Resynced { applied }),
    }
}

async fn run_drain(
    engine: Arc<SyncEngine>,
    mut requests: mpsc::Receiver<Request>,
    cancel: CancellationToken,
) {
    let mut ticker = interval(engine.config.drain_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            Some((request, response_tx)) = requests.recv() => {
                debug!("Processing sync request: {:?}", request);
                let result = handle_request(&engine, request).await;
                let _ = response_tx.send(result);
                continue;
            }
            _ = engine.wake.notified() => {}
            _ = ticker.tick() => {}
        }

        if let Err(e) = engine.check_staleness() {
            warn!("Staleness check failed: {}", e);
        }
        if !engine.connectivity().is_online() {
            continue;
        }
        match engine.drain_once().await {
            Ok(report) if report.sent >= engine.config.batch_size => {
                // More may be waiting behind a full batch.
                engine.wake.notify_one();
            }
            Ok(_) => {}
            Err(e) => error!("Drain cycle failed: {}", e),
        }
    }
    debug!("Drain task stopped");
}

async fn run_ping(engine: Arc<SyncEngine>, cancel: CancellationToken) {
    let mut connectivity = engine.watch_connectivity();
    loop {
        while connectivity.borrow_and_update().is_online() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        if let Some(delay) = engine.ping().await {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = sleep(delay) => {}
                _ = connectivity.changed() => {}
            }
        }
    }
}

async fn run_stream(engine: Arc<SyncEngine>, collection: CollectionName, cancel: CancellationToken) {
    let mut connectivity = engine.watch_connectivity();
    let mut failures = 0u32;
    loop {
        while !connectivity.borrow_and_update().is_online() {
            tokio::select! {
                _ = cancel.cancelled() => return,
                changed = connectivity.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
            }
        }

        match engine.stream_collection(&collection, &cancel).await {
            Ok(()) => return,
            Err(e) => {
                warn!("Stream for {} stopped: {}", collection, e);
                engine.suspend(&collection, &e).await;
                if is_retryable(&e) {
                    failures = 0;
                    continue;
                }
                // Not a connectivity problem; slow down before retrying.
                let delay: Duration = engine.config.retry.delay_for_attempt(failures);
                failures = failures.saturating_add(1);
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::replica::MutationOutcome;
    use crate::retry::RetryConfig;
    use tidesync_common::{EntityKey, FieldPatch, MutationOp, ReplicaId, Value};
    use tidesync_remote::MemoryRemote;
    use tidesync_store::Database;
    use tokio::time::timeout;

    fn key(id: &str) -> EntityKey {
        EntityKey::parse("players", id).unwrap()
    }

    fn start(remote: &MemoryRemote) -> SyncScheduler {
        let mut config = SyncConfig::for_collections(["players"]).unwrap().with_retry(
            RetryConfig::new(1)
                .with_initial_delay(Duration::from_millis(5))
                .with_max_delay(Duration::from_millis(20)),
        );
        config.drain_interval = Duration::from_millis(20);
        let db = Arc::new(Database::in_memory().unwrap());
        let engine = SyncEngine::open(db, Arc::new(remote.clone()), config).unwrap();
        SyncScheduler::start(Arc::new(engine))
    }

    async fn eventually<F: Fn() -> bool>(check: F) -> bool {
        for _ in 0..300 {
            if check() {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_background_drain_settles_handles() {
        let remote = MemoryRemote::new();
        let scheduler = start(&remote);
        let handle = scheduler
            .engine()
            .submit_mutation(key("p1"), MutationOp::Create, FieldPatch::new().set("hp", 1))
            .unwrap();

        let outcome = timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, MutationOutcome::Acknowledged { .. }));
        assert!(remote.document(&key("p1")).is_some());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_stream_applies_remote_writes() {
        let remote = MemoryRemote::new();
        let scheduler = start(&remote);
        remote.apply_remote_write(
            &key("p9"),
            MutationOp::Create,
            &FieldPatch::new().set("hp", 9),
            &ReplicaId::new("other").unwrap(),
        );

        let engine = scheduler.engine().clone();
        assert!(
            eventually(|| {
                engine
                    .get(&key("p9"))
                    .ok()
                    .flatten()
                    .and_then(|e| e.value("hp").cloned())
                    == Some(Value::Int(9))
            })
            .await
        );
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_recovers_after_outage() {
        let remote = MemoryRemote::new();
        remote.set_online(false);
        let scheduler = start(&remote);
        let handle = scheduler
            .engine()
            .submit_mutation(key("p1"), MutationOp::Create, FieldPatch::new().set("hp", 1))
            .unwrap();

        let engine = scheduler.engine().clone();
        assert!(eventually(|| !engine.connectivity().is_online()).await);

        remote.set_online(true);
        let outcome = timeout(Duration::from_secs(5), handle.wait())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, MutationOutcome::Acknowledged { .. }));
        assert!(engine.connectivity().is_online());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_requests_run_on_drain_task() {
        let remote = MemoryRemote::new();
        let scheduler = start(&remote);
        let players = CollectionName::new("players").unwrap();

        let result = scheduler
            .request(SyncRequest::Resync(players))
            .await
            .unwrap();
        assert_eq!(result, SyncResult::Resynced { applied: 0 });
        assert_eq!(scheduler.request_drain().await.unwrap(), DrainReport::default());
        scheduler.shutdown().await;
    }

    #[tokio::test]
    async fn test_sign_out_stops_and_wipes() {
        let remote = MemoryRemote::new();
        remote.set_online(false);
        let scheduler = start(&remote);
        let engine = scheduler.engine().clone();
        engine
            .submit_mutation(key("p1"), MutationOp::Create, FieldPatch::new().set("hp", 1))
            .unwrap();

        scheduler.sign_out().await.unwrap();
        assert!(engine.outbox().is_empty().unwrap());
        assert!(engine.get(&key("p1")).unwrap().is_none());
    }
}
