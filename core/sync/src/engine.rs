//! Core sync engine that drains the outbox and applies remote changes.

use chrono::Utc;
use futures::{stream, StreamExt};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch, Notify, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use tidesync_common::{
    CollectionName, Entity, EntityKey, Error, FieldPatch, Mutation, MutationDraft, MutationId,
    MutationOp, MutationState, RemoteDelta, RemoteError, Result, Version,
};
use tidesync_remote::{resumable, DeltaBatch, RemoteGateway};
use tidesync_store::{Carry, CursorStore, Database, EntityGuard, LocalStore, Outbox};

use crate::config::SyncConfig;
use crate::conflict::{acknowledge, apply_local, resolve, Rebase};
use crate::replica::{MutationOutcome, SyncEvent};
use crate::retry::{Backoff, RetryExecutor};
use crate::state::{CollectionStatus, Connectivity, Session, SyncState};

/// Buffered advisory events per subscriber before the oldest are dropped.
const EVENT_CAPACITY: usize = 256;

/// Counters for one drain cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub sent: usize,
    pub acknowledged: usize,
    pub merged: usize,
    pub failed: usize,
    /// The remote store became unreachable during the cycle.
    pub suspended: bool,
}

impl DrainReport {
    fn absorb(&mut self, other: DrainReport) {
        self.sent += other.sent;
        self.acknowledged += other.acknowledged;
        self.merged += other.merged;
        self.failed += other.failed;
        self.suspended |= other.suspended;
    }
}

/// Counters for applied remote changes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PullReport {
    /// Written to the local store.
    pub applied: usize,
    /// Held back behind open local mutations.
    pub parked: usize,
    /// Already reflected locally and dropped.
    pub stale: usize,
    pub resynced: bool,
}

impl PullReport {
    fn absorb(&mut self, other: PullReport) {
        self.applied += other.applied;
        self.parked += other.parked;
        self.stale += other.stale;
        self.resynced |= other.resynced;
    }

    fn count(&mut self, applied: Applied) {
        match applied {
            Applied::Stored => self.applied += 1,
            Applied::Parked => self.parked += 1,
            Applied::Stale => self.stale += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Stored,
    Parked,
    Stale,
}

/// Op of a mutation that carries a rebased intent followed by its own.
fn fold_op(carried: MutationOp, next: MutationOp) -> MutationOp {
    match (carried, next) {
        (_, MutationOp::Delete) => MutationOp::Delete,
        (MutationOp::Create | MutationOp::Delete, MutationOp::Update) => MutationOp::Create,
        (_, op) => op,
    }
}

/// Offline-first sync engine for one replica.
///
/// Callers write through [`SyncEngine::submit_mutation`]; the engine
/// pushes the outbox to the remote store and folds remote changes into
/// the local store. All durable state lives in the [`Database`], so an
/// engine can be dropped and reopened at any point.
pub struct SyncEngine {
    pub(crate) db: Arc<Database>,
    pub(crate) store: Arc<LocalStore>,
    pub(crate) outbox: Arc<Outbox>,
    pub(crate) cursors: Arc<CursorStore>,
    pub(crate) gateway: Arc<dyn RemoteGateway>,
    pub(crate) session: Session,
    pub(crate) state: Arc<RwLock<SyncState>>,
    pub(crate) retry_executor: Arc<RetryExecutor>,
    pub(crate) backoff: Mutex<Backoff>,
    pub(crate) connectivity: watch::Sender<Connectivity>,
    pub(crate) events: broadcast::Sender<SyncEvent>,
    pub(crate) waiters: Mutex<HashMap<MutationId, oneshot::Sender<MutationOutcome>>>,
    pub(crate) wake: Notify,
    degraded: AtomicBool,
    pub(crate) config: SyncConfig,
}

impl SyncEngine {
    /// Open an engine over a database and run crash recovery.
    pub fn open(
        db: Arc<Database>,
        gateway: Arc<dyn RemoteGateway>,
        config: SyncConfig,
    ) -> Result<Self> {
        config.validate()?;
        let session = Session::new(db.replica_id()?);
        let (connectivity, _) = watch::channel(Connectivity::Online);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let engine = Self {
            store: Arc::new(LocalStore::new(db.clone())),
            outbox: Arc::new(Outbox::with_capacity(db.clone(), config.outbox_capacity)),
            cursors: Arc::new(CursorStore::new(db.clone())),
            db,
            gateway,
            session,
            state: Arc::new(RwLock::new(SyncState::new())),
            retry_executor: Arc::new(RetryExecutor::new(config.retry.clone())),
            backoff: Mutex::new(Backoff::new(config.retry.clone())),
            connectivity,
            events,
            waiters: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            degraded: AtomicBool::new(false),
            config,
        };
        engine.recover()?;
        info!(
            "Sync engine ready for replica {} via {}",
            engine.session.replica_id,
            engine.gateway.name()
        );
        Ok(engine)
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    pub fn cursors(&self) -> &Arc<CursorStore> {
        &self.cursors
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Snapshot of per-collection sync state.
    pub async fn status(&self) -> SyncState {
        self.state.read().await.clone()
    }

    pub fn connectivity(&self) -> Connectivity {
        *self.connectivity.borrow()
    }

    pub fn watch_connectivity(&self) -> watch::Receiver<Connectivity> {
        self.connectivity.subscribe()
    }

    /// Ask the drain task to run a cycle soon.
    pub fn request_drain(&self) {
        self.wake.notify_one();
    }

    pub(crate) fn emit(&self, event: SyncEvent) {
        // No receivers is fine; events are advisory.
        let _ = self.events.send(event);
    }

    pub(crate) fn lock_waiters(
        &self,
    ) -> MutexGuard<'_, HashMap<MutationId, oneshot::Sender<MutationOutcome>>> {
        self.waiters.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_backoff(&self) -> MutexGuard<'_, Backoff> {
        self.backoff.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub(crate) fn set_connectivity(&self, next: Connectivity) {
        let changed = self.connectivity.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
        if !changed {
            return;
        }
        info!("Remote store is now {:?}", next);
        if next.is_online() {
            self.lock_backoff().reset();
            self.wake.notify_one();
        }
        self.emit(SyncEvent::ConnectivityChanged(next));
    }

    async fn update_status<F>(&self, collection: &CollectionName, f: F)
    where
        F: FnOnce(&mut CollectionStatus) -> Result<()>,
    {
        let mut state = self.state.write().await;
        let status = state.status_mut(collection);
        let before = status.state;
        if let Err(e) = f(status) {
            debug!("Status update skipped: {}", e);
        }
        let after = status.state;
        drop(state);
        if before != after {
            self.emit(SyncEvent::StateChanged {
                collection: collection.clone(),
                state: after,
            });
        }
    }

    /// Hand the outcome to a waiting handle and publish it.
    pub(crate) fn settle(&self, mutation: &Mutation, outcome: MutationOutcome) {
        if let Some(tx) = self.lock_waiters().remove(&mutation.mutation_id) {
            let _ = tx.send(outcome.clone());
        }
        let event = match outcome {
            MutationOutcome::Failed { error } => SyncEvent::MutationFailed {
                mutation_id: mutation.mutation_id,
                key: mutation.key.clone(),
                error,
            },
            outcome => SyncEvent::MutationSettled {
                mutation_id: mutation.mutation_id,
                key: mutation.key.clone(),
                outcome,
            },
        };
        self.emit(event);
    }

    /// Rewrite the materialized row from a confirmed state and whatever
    /// is still open in the outbox. Removes the row when nothing is left.
    pub(crate) fn rebuild(
        &self,
        guard: &EntityGuard<'_>,
        confirmed: Option<&Entity>,
    ) -> Result<Option<Entity>> {
        let open = self.outbox.open_for(guard.key())?;
        match apply_local(confirmed, &open) {
            Some(entity) => guard.put_with_confirmed(entity, confirmed).map(Some),
            None => {
                guard.remove()?;
                Ok(None)
            }
        }
    }

    // ---- crash recovery ----

    /// Bring the outbox and the local store back in line after a restart.
    ///
    /// - `sent` rows are sent again; the remote store deduplicates them
    /// - `acknowledged` rows are applied if the store missed them, then purged
    /// - `conflicted` rows already had their rebase carried forward and are purged
    /// - entities with `failed` rows are rebuilt if the revert never landed
    fn recover(&self) -> Result<()> {
        let requeued = self.outbox.requeue_in_flight()?;

        let acknowledged = self.outbox.acknowledged()?;
        for mutation in &acknowledged {
            match mutation.acked_version {
                Some(version) => self.finish_acknowledged(mutation, version)?,
                None => {
                    warn!("{} acknowledged without a version", mutation.mutation_id);
                    self.outbox.purge(mutation.mutation_id)?;
                }
            }
        }

        let conflicted = self.outbox.in_state(MutationState::Conflicted)?;
        for mutation in &conflicted {
            let guard = self.store.lock(&mutation.key)?;
            let confirmed = guard.confirmed()?;
            self.rebuild(&guard, confirmed.as_ref())?;
            self.outbox.purge(mutation.mutation_id)?;
        }

        let mut reverted = 0;
        let failed_keys: HashSet<EntityKey> = self
            .outbox
            .failed()?
            .into_iter()
            .map(|m| m.key)
            .collect();
        for key in &failed_keys {
            if self.revert_failed(key)? {
                reverted += 1;
            }
        }

        if requeued + acknowledged.len() + conflicted.len() + reverted > 0 {
            info!(
                "Recovered outbox: {} requeued, {} acknowledged, {} conflicted, {} reverted",
                requeued,
                acknowledged.len(),
                conflicted.len(),
                reverted
            );
        }
        Ok(())
    }

    /// Rebuild an entity whose stored state still carries the effect of a
    /// failed mutation. Returns whether anything changed.
    fn revert_failed(&self, key: &EntityKey) -> Result<bool> {
        let guard = self.store.lock(key)?;
        let row = guard.row()?;
        let confirmed = row.as_ref().and_then(|r| r.confirmed.clone());
        let expected = apply_local(confirmed.as_ref(), &self.outbox.open_for(key)?);

        let stale = match (row.as_ref(), expected.as_ref()) {
            (Some(r), Some(e)) => r.entity.fields != e.fields || r.entity.tombstone != e.tombstone,
            (None, None) => false,
            _ => true,
        };
        if stale {
            debug!("Reverting failed mutations on {}", key);
            self.rebuild(&guard, confirmed.as_ref())?;
        }
        Ok(stale)
    }

    // ---- push ----

    /// Push up to `batch_size` pending mutations.
    ///
    /// Entities are committed in parallel; mutations of one entity go out
    /// one at a time in id order.
    pub async fn drain_once(&self) -> Result<DrainReport> {
        let batch = self.outbox.peek_batch(self.config.batch_size)?;
        if batch.is_empty() {
            return Ok(DrainReport::default());
        }

        let mut groups: BTreeMap<EntityKey, Vec<MutationId>> = BTreeMap::new();
        for mutation in &batch {
            groups
                .entry(mutation.key.clone())
                .or_default()
                .push(mutation.mutation_id);
        }
        let collections: HashSet<CollectionName> =
            groups.keys().map(|k| k.collection.clone()).collect();
        for collection in &collections {
            self.update_status(collection, CollectionStatus::mark_draining)
                .await;
        }

        debug!(
            "Draining {} mutations across {} entities",
            batch.len(),
            groups.len()
        );
        let results: Vec<Result<DrainReport>> = stream::iter(groups)
            .map(|(key, ids)| self.drain_entity(key, ids))
            .buffer_unordered(self.config.max_parallel_entities)
            .collect()
            .await;

        let mut report = DrainReport::default();
        let mut first_error = None;
        for result in results {
            match result {
                Ok(r) => report.absorb(r),
                Err(e) => {
                    error!("Drain failed: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }

        for collection in &collections {
            if report.suspended {
                self.update_status(collection, |s| s.mark_suspended("remote unreachable"))
                    .await;
            } else {
                self.update_status(collection, CollectionStatus::finish_draining)
                    .await;
            }
        }
        if report.suspended {
            self.set_connectivity(Connectivity::Offline);
        }

        info!(
            "Drain cycle: {} sent, {} acknowledged, {} merged, {} failed",
            report.sent, report.acknowledged, report.merged, report.failed
        );
        match first_error {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }

    async fn drain_entity(&self, key: EntityKey, ids: Vec<MutationId>) -> Result<DrainReport> {
        let mut report = DrainReport::default();
        for id in ids {
            // Re-read: an earlier commit may have amended or folded it.
            let mutation = match self.outbox.get(id)? {
                Some(m) if m.state == MutationState::Pending => m,
                _ => continue,
            };
            if !self.outbox.mark_sent(id)? {
                continue;
            }
            report.sent += 1;
            trace!("Committing {} for {}", id, key);

            match self.gateway.commit(&mutation).await {
                Ok(remote_version) => {
                    self.finish_acknowledged(&mutation, remote_version)?;
                    self.settle(&mutation, MutationOutcome::Acknowledged { remote_version });
                    report.acknowledged += 1;
                }
                Err(RemoteError::VersionConflict {
                    current_version,
                    current_value,
                }) => {
                    let outcome = self.finish_conflicted(
                        &mutation,
                        current_version,
                        current_value.map(|v| *v),
                    )?;
                    self.settle(&mutation, outcome);
                    report.merged += 1;
                }
                Err(RemoteError::Unreachable(reason)) => {
                    self.outbox.mark_pending(id, &reason)?;
                    warn!("{} left pending: {}", id, reason);
                    report.suspended = true;
                    break;
                }
                Err(err) => {
                    self.finish_failed(&mutation, &err)?;
                    self.settle(&mutation, MutationOutcome::Failed { error: err });
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    /// Fold an accepted mutation into the confirmed state and purge it.
    ///
    /// Safe to repeat: a confirmed state already at `remote_version` is
    /// left alone.
    fn finish_acknowledged(&self, mutation: &Mutation, remote_version: Version) -> Result<()> {
        self.db.observe_server_time(remote_version)?;
        let guard = self.store.lock(&mutation.key)?;
        self.outbox
            .mark_acknowledged(mutation.mutation_id, remote_version)?;

        let confirmed = acknowledge(guard.confirmed()?.as_ref(), mutation, remote_version);
        // Later mutations were built on top of this one.
        for next in self.outbox.open_for(&mutation.key)? {
            if next.state == MutationState::Pending && next.base_version == mutation.base_version
            {
                self.outbox.amend(
                    next.mutation_id,
                    next.op,
                    &next.field_patch,
                    remote_version,
                )?;
            }
        }
        self.rebuild(&guard, Some(&confirmed))?;
        self.outbox.purge(mutation.mutation_id)?;
        debug!(
            "{} acknowledged at {} for {}",
            mutation.mutation_id, remote_version, mutation.key
        );
        Ok(())
    }

    /// Resolve a rejected-as-stale mutation against the server's state.
    ///
    /// Surviving local intent moves to the next pending mutation of the
    /// entity, or to a fresh one; the conflicted id is never sent again.
    fn finish_conflicted(
        &self,
        mutation: &Mutation,
        current_version: Version,
        current: Option<Entity>,
    ) -> Result<MutationOutcome> {
        self.db.observe_server_time(current_version)?;
        let remote = current.map(|mut e| {
            e.version = current_version;
            e.remote_version = current_version;
            e
        });

        let guard = self.store.lock(&mutation.key)?;
        let base = guard.confirmed()?;
        let resolution = resolve(base.as_ref(), mutation, remote.as_ref());
        debug!(
            "{} conflicted at {} for {}: {:?}",
            mutation.mutation_id, current_version, mutation.key, resolution.outcome
        );

        let carry = resolution
            .rebase
            .map(|rebase| self.plan_carry(mutation, rebase, current_version))
            .transpose()?;
        let carried_by = self.outbox.conflict(mutation.mutation_id, carry)?;
        if carried_by.is_some() {
            self.wake.notify_one();
        }

        // A parked delta may already be ahead of the conflict snapshot.
        let confirmed = match base {
            Some(b) if b.remote_version > current_version => Some(b),
            _ => remote,
        };
        self.rebuild(&guard, confirmed.as_ref())?;
        self.outbox.purge(mutation.mutation_id)?;

        Ok(MutationOutcome::Merged {
            outcome: resolution.outcome,
            remote_version: current_version,
            carried_by,
        })
    }

    /// Decide where the surviving local intent goes: folded into the next
    /// pending mutation of the entity, or queued at the remote version.
    fn plan_carry(
        &self,
        mutation: &Mutation,
        rebase: Rebase,
        remote_version: Version,
    ) -> Result<Carry> {
        let next = self
            .outbox
            .open_for(&mutation.key)?
            .into_iter()
            .find(|m| m.state == MutationState::Pending && m.mutation_id != mutation.mutation_id);

        if let Some(next) = next {
            let op = fold_op(rebase.op, next.op);
            let field_patch = match op {
                MutationOp::Delete => FieldPatch::new(),
                _ => rebase.patch.then(&next.field_patch),
            };
            // Keeps its own base so its own fields still get resolved.
            return Ok(Carry::Fold {
                into: next.mutation_id,
                op,
                field_patch,
            });
        }

        Ok(Carry::Enqueue(MutationDraft {
            key: mutation.key.clone(),
            op: rebase.op,
            field_patch: rebase.patch,
            base_version: remote_version,
            created_at: mutation.created_at,
            submitted_at: mutation.submitted_at,
            origin: mutation.origin.clone(),
        }))
    }

    /// Drop a refused mutation and revert its optimistic effect.
    fn finish_failed(&self, mutation: &Mutation, err: &RemoteError) -> Result<()> {
        let guard = self.store.lock(&mutation.key)?;
        self.outbox
            .mark_failed(mutation.mutation_id, &err.to_string())?;
        let confirmed = guard.confirmed()?;
        self.rebuild(&guard, confirmed.as_ref())?;
        warn!(
            "{} for {} failed: {}",
            mutation.mutation_id, mutation.key, err
        );
        Ok(())
    }

    // ---- pull ----

    /// Fold a remote state into the store under the entity lock.
    ///
    /// `build` sees the current confirmed state and returns the remote one.
    fn apply_remote<F>(&self, key: &EntityKey, build: F) -> Result<Applied>
    where
        F: FnOnce(Option<&Entity>) -> Entity,
    {
        let guard = self.store.lock(key)?;
        let row = guard.row()?;
        let applied = row
            .as_ref()
            .map(|r| {
                let confirmed = r
                    .confirmed
                    .as_ref()
                    .map(|c| c.remote_version)
                    .unwrap_or(Version::ZERO);
                confirmed.max(r.entity.remote_version)
            })
            .unwrap_or(Version::ZERO);
        let remote = build(row.as_ref().and_then(|r| r.confirmed.as_ref()));

        if remote.remote_version <= applied {
            trace!(
                "Dropping stale {} for {} (have {})",
                remote.remote_version, key, applied
            );
            return Ok(Applied::Stale);
        }

        if self.outbox.has_open(key)? {
            guard.park(&remote)?;
            return Ok(Applied::Parked);
        }

        let current = row.map(|r| r.entity);
        let noop = Mutation::noop(key.clone(), applied, self.session.replica_id.clone());
        let resolution = resolve(current.as_ref(), &noop, Some(&remote));
        guard.put_with_confirmed(resolution.entity, Some(&remote))?;
        Ok(Applied::Stored)
    }

    fn apply_delta(&self, delta: &RemoteDelta) -> Result<Applied> {
        self.apply_remote(&delta.key, |confirmed| delta.materialize(confirmed))
    }

    /// Apply one batch of remote changes and persist the cursor after it.
    ///
    /// Deltas at or below the persisted watermark were applied before and
    /// are skipped.
    pub fn apply_batch(&self, batch: &DeltaBatch) -> Result<PullReport> {
        let mut cursor = self.cursors.load(&batch.collection)?;
        let mut report = PullReport::default();
        for delta in &batch.deltas {
            if delta.remote_version <= cursor.watermark {
                report.stale += 1;
                continue;
            }
            report.count(self.apply_delta(delta)?);
        }

        self.db.observe_server_time(batch.watermark)?;
        if batch.watermark >= cursor.watermark {
            cursor.advance(batch.cursor.clone(), batch.watermark);
            self.cursors.save(&cursor)?;
        }
        self.store
            .compact_tombstones(&batch.collection, cursor.watermark)?;
        if !batch.is_empty() {
            debug!(
                "Applied batch for {} up to {}: {:?}",
                batch.collection, batch.watermark, report
            );
        }
        Ok(report)
    }

    /// Catch a collection up by polling the change feed.
    ///
    /// Without a cursor, or when the cursor can no longer be resumed, the
    /// collection is resynced from a snapshot instead.
    pub async fn pull_once(&self, collection: &CollectionName) -> Result<PullReport> {
        let cursor = self.cursors.load(collection)?;
        let Some(mut token) = cursor.token else {
            let applied = self.resync(collection).await?;
            return Ok(PullReport {
                applied,
                resynced: true,
                ..PullReport::default()
            });
        };

        let mut total = PullReport::default();
        loop {
            let batch = match self
                .gateway
                .changes_since(collection, Some(&token), self.config.pull_batch_size)
                .await
            {
                Ok(batch) => batch,
                Err(Error::StreamBroken { .. }) => {
                    total.applied += self.resync(collection).await?;
                    total.resynced = true;
                    break;
                }
                Err(e) => return Err(e),
            };
            total.absorb(self.apply_batch(&batch)?);
            let watermark = batch.watermark;
            self.update_status(collection, |s| {
                s.record_batch(watermark);
                Ok(())
            })
            .await;
            let done = batch.deltas.len() < self.config.pull_batch_size;
            token = batch.cursor;
            if done {
                break;
            }
        }
        Ok(total)
    }

    /// Discard the cursor and rebuild a collection from a full snapshot.
    ///
    /// Entities the snapshot no longer has become tombstones; rows with open
    /// local mutations keep their optimistic state until those settle.
    pub async fn resync(&self, collection: &CollectionName) -> Result<usize> {
        warn!("Resyncing {} from a full snapshot", collection);
        self.cursors.discard_token(collection)?;

        let gateway = self.gateway.clone();
        let name = collection.clone();
        let snapshot = self
            .retry_executor
            .execute(|| {
                let gateway = gateway.clone();
                let name = name.clone();
                async move { gateway.fetch_collection(&name).await.map_err(Error::from) }
            })
            .await?;

        let mut report = PullReport::default();
        let mut present = HashSet::new();
        for entity in &snapshot.entities {
            present.insert(entity.key.clone());
            report.count(self.apply_remote(&entity.key, |_| entity.clone())?);
        }

        let watermark = snapshot.watermark;
        for row in self.store.rows(collection, true)? {
            let live_remotely = row.confirmed.as_ref().map(|c| !c.tombstone).unwrap_or(false);
            if !live_remotely || present.contains(&row.entity.key) {
                continue;
            }
            report.count(self.apply_remote(&row.entity.key, |confirmed| {
                let mut gone = confirmed
                    .cloned()
                    .unwrap_or_else(|| Entity::new(row.entity.key.clone()));
                gone.make_tombstone();
                gone.version = watermark;
                gone.remote_version = watermark;
                gone
            })?);
        }

        self.db.observe_server_time(watermark)?;
        let mut cursor = self.cursors.load(collection)?;
        cursor.advance(snapshot.cursor.clone(), watermark);
        self.cursors.save(&cursor)?;
        self.store.compact_tombstones(collection, watermark)?;

        {
            let mut state = self.state.write().await;
            state.status_mut(collection).mark_resynced(watermark);
        }
        info!(
            "Resynced {} at {}: {} entities, {:?}",
            collection,
            watermark,
            snapshot.entities.len(),
            report
        );
        self.emit(SyncEvent::Resynced {
            collection: collection.clone(),
            entities: snapshot.entities.len(),
        });
        Ok(report.applied)
    }

    /// Follow a collection's change stream until cancelled.
    ///
    /// Returns `Ok(())` on cancellation and the error that ended the
    /// stream otherwise. Broken cursors are handled here by resyncing.
    pub async fn stream_collection(
        &self,
        collection: &CollectionName,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.update_status(collection, CollectionStatus::mark_subscribing)
            .await;
        if self.cursors.load(collection)?.token.is_none() {
            self.resync(collection).await?;
        }

        'subscribe: loop {
            let cursor = self.cursors.load(collection)?;
            let mut stream = resumable(
                self.gateway.clone(),
                collection.clone(),
                cursor.token,
                self.config.retry.reconnect_policy(),
            );
            let watermark = cursor.watermark;
            self.update_status(collection, |s| s.mark_streaming(watermark))
                .await;

            loop {
                let next = tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    next = stream.next() => next,
                };
                match next {
                    Some(Ok(batch)) => {
                        self.apply_batch(&batch)?;
                        let watermark = batch.watermark;
                        self.update_status(collection, |s| {
                            s.record_batch(watermark);
                            Ok(())
                        })
                        .await;
                    }
                    Some(Err(Error::StreamBroken { .. })) => {
                        self.update_status(collection, CollectionStatus::mark_subscribing)
                            .await;
                        self.resync(collection).await?;
                        continue 'subscribe;
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        return Err(RemoteError::Unreachable(format!(
                            "change stream for {} ended",
                            collection
                        ))
                        .into())
                    }
                }
            }
        }
    }

    // ---- connectivity ----

    /// Ping the remote store. Returns how long to wait before pinging
    /// again, or `None` once it answered.
    pub async fn ping(&self) -> Option<Duration> {
        match self.gateway.ping().await {
            Ok(()) => {
                self.set_connectivity(Connectivity::Online);
                None
            }
            Err(e) => {
                let delay = self.lock_backoff().next_delay();
                if e.is_transient() {
                    self.set_connectivity(Connectivity::Offline);
                }
                debug!("Ping failed ({}), next in {:?}", e, delay);
                Some(delay)
            }
        }
    }

    /// Mark a collection suspended after its stream gave up.
    pub(crate) async fn suspend(&self, collection: &CollectionName, err: &Error) {
        self.update_status(collection, |s| s.mark_suspended(err.to_string()))
            .await;
        if matches!(err, Error::Remote(e) if e.is_transient()) {
            self.set_connectivity(Connectivity::Offline);
        }
    }

    /// Raise a `SyncDegraded` advisory once the oldest open mutation has
    /// waited longer than the staleness threshold. Returns its age then.
    pub fn check_staleness(&self) -> Result<Option<Duration>> {
        let Some(oldest) = self.outbox.oldest_pending()? else {
            self.degraded.store(false, Ordering::SeqCst);
            return Ok(None);
        };
        let age = (Utc::now() - oldest.submitted_at)
            .to_std()
            .unwrap_or(Duration::ZERO);
        if age < self.config.staleness_threshold {
            self.degraded.store(false, Ordering::SeqCst);
            return Ok(None);
        }
        if !self.degraded.swap(true, Ordering::SeqCst) {
            warn!(
                "Sync degraded: {} pending for {:?}",
                oldest.mutation_id, age
            );
            self.emit(SyncEvent::SyncDegraded {
                oldest: oldest.mutation_id,
                age,
            });
        }
        Ok(Some(age))
    }

    /// Tear down the session: forget waiters and wipe every local table.
    pub fn sign_out(&self) -> Result<()> {
        self.lock_waiters().clear();
        self.db.wipe()?;
        info!("Signed out replica {}", self.session.replica_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::Outcome;
    use crate::retry::RetryConfig;
    use tempfile::TempDir;
    use tidesync_common::{ReplicaId, Value};
    use tidesync_remote::MemoryRemote;
    use tidesync_store::Predicate;

    fn players() -> CollectionName {
        CollectionName::new("players").unwrap()
    }

    fn key(id: &str) -> EntityKey {
        EntityKey::parse("players", id).unwrap()
    }

    fn other() -> ReplicaId {
        ReplicaId::new("other-device").unwrap()
    }

    fn config() -> SyncConfig {
        SyncConfig::for_collections(["players"]).unwrap().with_retry(
            RetryConfig::new(1)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    fn open(db: Arc<Database>, remote: &MemoryRemote) -> SyncEngine {
        SyncEngine::open(db, Arc::new(remote.clone()), config()).unwrap()
    }

    fn setup() -> (SyncEngine, MemoryRemote) {
        let remote = MemoryRemote::new();
        let db = Arc::new(Database::in_memory().unwrap());
        (open(db, &remote), remote)
    }

    fn int(entity: &Entity, field: &str) -> Option<i64> {
        entity.value(field).and_then(Value::as_int)
    }

    fn text<'a>(entity: &'a Entity, field: &str) -> Option<&'a str> {
        entity.value(field).and_then(Value::as_str)
    }

    #[tokio::test]
    async fn test_submit_then_drain_acknowledges() {
        let (engine, remote) = setup();
        let handle = engine
            .submit_mutation(key("p1"), MutationOp::Create, FieldPatch::new().set("hp", 10))
            .unwrap();

        // Optimistic write is visible immediately.
        assert_eq!(int(&engine.get(&key("p1")).unwrap().unwrap(), "hp"), Some(10));

        let report = engine.drain_once().await.unwrap();
        assert_eq!(report.acknowledged, 1);

        let outcome = handle.wait().await.unwrap();
        let remote_version = match outcome {
            MutationOutcome::Acknowledged { remote_version } => remote_version,
            other => panic!("unexpected outcome {:?}", other),
        };
        let local = engine.get(&key("p1")).unwrap().unwrap();
        assert_eq!(local.remote_version, remote_version);
        assert!(engine.outbox().is_empty().unwrap());
        assert_eq!(int(&remote.document(&key("p1")).unwrap(), "hp"), Some(10));
    }

    #[tokio::test]
    async fn test_concurrent_field_edits_merge() {
        let (engine, remote) = setup();
        remote.apply_remote_write(
            &key("E1"),
            MutationOp::Create,
            &FieldPatch::new().set("name", "A").set("hp", 10),
            &other(),
        );
        engine.pull_once(&players()).await.unwrap();

        remote.set_online(false);
        engine
            .submit_mutation(key("E1"), MutationOp::Update, FieldPatch::new().set("hp", 12))
            .unwrap();
        let report = engine.drain_once().await.unwrap();
        assert!(report.suspended);
        assert_eq!(engine.connectivity(), Connectivity::Offline);

        remote.set_online(true);
        remote.apply_remote_write(
            &key("E1"),
            MutationOp::Update,
            &FieldPatch::new().set("name", "B"),
            &other(),
        );

        // Conflict, merge, then the carried rebase commits.
        let first = engine.drain_once().await.unwrap();
        assert_eq!(first.merged, 1);
        engine.drain_once().await.unwrap();
        engine.pull_once(&players()).await.unwrap();

        let local = engine.get(&key("E1")).unwrap().unwrap();
        assert_eq!(text(&local, "name"), Some("B"));
        assert_eq!(int(&local, "hp"), Some(12));
        let server = remote.document(&key("E1")).unwrap();
        assert_eq!(server.values(), local.values());
        assert!(engine.outbox().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_offline_mutations_commit_in_order() {
        let (engine, remote) = setup();
        remote.set_online(false);
        engine
            .submit_mutation(key("E2"), MutationOp::Create, FieldPatch::new().set("x", 1))
            .unwrap();
        engine
            .submit_mutation(key("E2"), MutationOp::Update, FieldPatch::new().set("x", 2))
            .unwrap();
        engine.drain_once().await.unwrap();

        remote.set_online(true);
        engine.connectivity_hint(true);
        let report = engine.drain_once().await.unwrap();
        assert_eq!(report.acknowledged, 2);

        let commits = remote.commits(&key("E2"));
        let xs: Vec<_> = commits
            .iter()
            .map(|c| c.patch.get("x").cloned())
            .collect();
        assert_eq!(
            xs,
            vec![
                Some(tidesync_common::FieldOp::Set { value: Value::Int(1) }),
                Some(tidesync_common::FieldOp::Set { value: Value::Int(2) }),
            ]
        );
        assert!(commits[0].version < commits[1].version);
        assert_eq!(int(&engine.get(&key("E2")).unwrap().unwrap(), "x"), Some(2));
    }

    #[tokio::test]
    async fn test_redelivered_delta_is_ignored() {
        let (engine, remote) = setup();
        remote.apply_remote_write(
            &key("p1"),
            MutationOp::Create,
            &FieldPatch::new().set("hp", 3),
            &other(),
        );
        engine.pull_once(&players()).await.unwrap();
        remote.apply_remote_write(
            &key("p1"),
            MutationOp::Update,
            &FieldPatch::new().set("hp", 4),
            &other(),
        );

        let batch = remote.changes_since(&players(), None, 100).await.unwrap();
        let first = engine.apply_batch(&batch).unwrap();
        assert_eq!(first.applied, 1);
        let after_first = engine.store().get_row(&key("p1")).unwrap().unwrap();

        let second = engine.apply_batch(&batch).unwrap();
        assert_eq!(second.applied, 0);
        assert_eq!(
            engine.store().get_row(&key("p1")).unwrap().unwrap(),
            after_first
        );
    }

    #[tokio::test]
    async fn test_conflicted_mutation_is_never_resent() {
        let (engine, remote) = setup();
        remote.apply_remote_write(
            &key("p1"),
            MutationOp::Create,
            &FieldPatch::new().set("hp", 1),
            &other(),
        );
        engine.pull_once(&players()).await.unwrap();

        let handle = engine
            .submit_mutation(key("p1"), MutationOp::Update, FieldPatch::new().set("mp", 5))
            .unwrap();
        let conflicted_id = handle.mutation_id();
        remote.apply_remote_write(
            &key("p1"),
            MutationOp::Update,
            &FieldPatch::new().set("hp", 2),
            &other(),
        );

        engine.drain_once().await.unwrap();
        let carried = match handle.wait().await.unwrap() {
            MutationOutcome::Merged {
                carried_by: Some(id),
                outcome: Outcome::Merged,
                ..
            } => id,
            other => panic!("unexpected outcome {:?}", other),
        };
        assert_ne!(carried, conflicted_id);
        assert!(engine.outbox().get(conflicted_id).unwrap().is_none());

        engine.drain_once().await.unwrap();
        let sent: Vec<_> = remote
            .attempts()
            .into_iter()
            .filter(|(_, id)| *id == conflicted_id)
            .collect();
        assert_eq!(sent.len(), 1);
        let server = remote.document(&key("p1")).unwrap();
        assert_eq!(int(&server, "hp"), Some(2));
        assert_eq!(int(&server, "mp"), Some(5));
    }

    #[tokio::test]
    async fn test_lost_ack_is_resent_idempotently() {
        let (engine, remote) = setup();
        engine
            .submit_mutation(key("p1"), MutationOp::Create, FieldPatch::new().set("hp", 1))
            .unwrap();
        remote.lose_next_ack();

        let report = engine.drain_once().await.unwrap();
        assert!(report.suspended);
        assert_eq!(engine.outbox().len().unwrap(), 1);

        engine.connectivity_hint(true);
        let report = engine.drain_once().await.unwrap();
        assert_eq!(report.acknowledged, 1);
        assert_eq!(remote.commits(&key("p1")).len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_mutation_reverts() {
        let (engine, remote) = setup();
        remote.apply_remote_write(
            &key("p1"),
            MutationOp::Create,
            &FieldPatch::new().set("hp", 1),
            &other(),
        );
        engine.pull_once(&players()).await.unwrap();
        remote.reject_field("admin", "field is read-only");

        let mut events = engine.events();
        let handle = engine
            .submit_mutation(key("p1"), MutationOp::Update, FieldPatch::new().set("admin", true))
            .unwrap();
        assert!(engine.get(&key("p1")).unwrap().unwrap().value("admin").is_some());

        engine.drain_once().await.unwrap();
        assert!(matches!(
            handle.wait().await.unwrap(),
            MutationOutcome::Failed {
                error: RemoteError::Rejected(_)
            }
        ));
        let local = engine.get(&key("p1")).unwrap().unwrap();
        assert!(local.value("admin").is_none());
        assert_eq!(engine.outbox().failed().unwrap().len(), 1);

        let mut saw_failure = false;
        while let Ok(event) = events.try_recv() {
            saw_failure |= matches!(event, SyncEvent::MutationFailed { .. });
        }
        assert!(saw_failure);
    }

    #[tokio::test]
    async fn test_unauthorized_is_terminal() {
        let (engine, remote) = setup();
        remote.set_authorized(false);
        let handle = engine
            .submit_mutation(key("p1"), MutationOp::Create, FieldPatch::new().set("hp", 1))
            .unwrap();
        let report = engine.drain_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert!(!report.suspended);
        assert!(matches!(
            handle.wait().await.unwrap(),
            MutationOutcome::Failed {
                error: RemoteError::Unauthorized
            }
        ));
        assert!(engine.get(&key("p1")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_remote_delta_parks_behind_open_mutation() {
        let (engine, remote) = setup();
        remote.apply_remote_write(
            &key("p1"),
            MutationOp::Create,
            &FieldPatch::new().set("hp", 1).set("name", "A"),
            &other(),
        );
        engine.pull_once(&players()).await.unwrap();

        engine
            .submit_mutation(key("p1"), MutationOp::Update, FieldPatch::new().set("hp", 7))
            .unwrap();
        remote.apply_remote_write(
            &key("p1"),
            MutationOp::Update,
            &FieldPatch::new().set("name", "B"),
            &other(),
        );
        let report = engine.pull_once(&players()).await.unwrap();
        assert_eq!(report.parked, 1);

        // Readers keep seeing the optimistic state.
        let local = engine.get(&key("p1")).unwrap().unwrap();
        assert_eq!(text(&local, "name"), Some("A"));
        assert_eq!(int(&local, "hp"), Some(7));

        engine.drain_once().await.unwrap();
        engine.drain_once().await.unwrap();
        engine.pull_once(&players()).await.unwrap();
        let local = engine.get(&key("p1")).unwrap().unwrap();
        assert_eq!(text(&local, "name"), Some("B"));
        assert_eq!(int(&local, "hp"), Some(7));
    }

    #[tokio::test]
    async fn test_ack_before_stream_does_not_double_apply() {
        let (engine, remote) = setup();
        engine
            .submit_mutation(
                key("p1"),
                MutationOp::Create,
                FieldPatch::new().add_to_set("tags", ["a"]),
            )
            .unwrap();
        engine.drain_once().await.unwrap();
        let before = engine.store().get_row(&key("p1")).unwrap().unwrap();

        let report = engine.pull_once(&players()).await.unwrap();
        assert_eq!(report.applied, 0);
        assert_eq!(engine.store().get_row(&key("p1")).unwrap().unwrap(), before);
    }

    #[tokio::test]
    async fn test_stream_broken_triggers_resync() {
        let (engine, remote) = setup();
        for id in ["p1", "p2"] {
            remote.apply_remote_write(
                &key(id),
                MutationOp::Create,
                &FieldPatch::new().set("hp", 1),
                &other(),
            );
        }
        engine.pull_once(&players()).await.unwrap();

        remote.apply_remote_write(&key("p2"), MutationOp::Delete, &FieldPatch::new(), &other());
        remote.apply_remote_write(
            &key("p3"),
            MutationOp::Create,
            &FieldPatch::new().set("hp", 3),
            &other(),
        );
        remote.compact(&players());
        let mut events = engine.events();

        let report = engine.pull_once(&players()).await.unwrap();
        assert!(report.resynced);
        assert!(engine.get(&key("p1")).unwrap().is_some());
        assert!(engine.get(&key("p2")).unwrap().is_none());
        assert_eq!(int(&engine.get(&key("p3")).unwrap().unwrap(), "hp"), Some(3));
        assert_eq!(engine.cursors().load(&players()).unwrap().watermark, remote.clock());
        assert!(matches!(events.try_recv(), Ok(SyncEvent::Resynced { .. })));
        // The first pull had no cursor and resynced too.
        assert_eq!(engine.status().await.get(&players()).unwrap().resyncs, 2);
    }

    #[tokio::test]
    async fn test_acknowledged_delete_keeps_tombstone_until_watermark() {
        let (engine, remote) = setup();
        remote.apply_remote_write(
            &key("p1"),
            MutationOp::Create,
            &FieldPatch::new().set("hp", 1),
            &other(),
        );
        engine.pull_once(&players()).await.unwrap();

        engine
            .submit_mutation(key("p1"), MutationOp::Delete, FieldPatch::new())
            .unwrap();
        engine.drain_once().await.unwrap();
        let row = engine.store().get_row(&key("p1")).unwrap().unwrap();
        assert!(row.entity.tombstone);

        // An older delta replayed before the stream passes the delete is dropped.
        let stale = remote.changes_since(&players(), None, 1).await.unwrap();
        let mut replay = stale.clone();
        replay.watermark = Version::ZERO;
        assert_eq!(engine.apply_batch(&replay).unwrap().applied, 0);
        assert!(engine.get(&key("p1")).unwrap().is_none());

        engine.pull_once(&players()).await.unwrap();
        assert!(engine.store().get_row(&key("p1")).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_recovery_after_crash_mid_drain() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("replica.db");
        let remote = MemoryRemote::new();

        let (acked, pending) = {
            let engine = open(Arc::new(Database::open(&path).unwrap()), &remote);
            let a = engine
                .submit_mutation(key("p1"), MutationOp::Create, FieldPatch::new().set("hp", 1))
                .unwrap()
                .mutation_id();
            let b = engine
                .submit_mutation(key("p2"), MutationOp::Create, FieldPatch::new().set("hp", 2))
                .unwrap()
                .mutation_id();
            // Simulate a crash between the commit and its bookkeeping.
            let m = engine.outbox().get(a).unwrap().unwrap();
            engine.outbox().mark_sent(a).unwrap();
            let version = remote.commit(&m).await.unwrap();
            engine.outbox().mark_acknowledged(a, version).unwrap();
            engine.outbox().mark_sent(b).unwrap();
            (a, b)
        };

        let engine = open(Arc::new(Database::open(&path).unwrap()), &remote);
        assert!(engine.outbox().get(acked).unwrap().is_none());
        assert_eq!(
            engine.outbox().get(pending).unwrap().unwrap().state,
            MutationState::Pending
        );
        let p1 = engine.store().get_row(&key("p1")).unwrap().unwrap();
        assert!(p1.confirmed.is_some());

        engine.drain_once().await.unwrap();
        assert!(engine.outbox().is_empty().unwrap());
        assert_eq!(remote.commits(&key("p1")).len(), 1);
        assert_eq!(remote.commits(&key("p2")).len(), 1);
    }

    #[tokio::test]
    async fn test_recovery_after_crash_mid_conflict() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("replica.db");
        let remote = MemoryRemote::new();
        remote.apply_remote_write(
            &key("p1"),
            MutationOp::Create,
            &FieldPatch::new().set("hp", 1),
            &other(),
        );

        let (conflicted, successor) = {
            let engine = open(Arc::new(Database::open(&path).unwrap()), &remote);
            engine.pull_once(&players()).await.unwrap();
            let first = engine
                .submit_mutation(key("p1"), MutationOp::Update, FieldPatch::new().set("mp", 5))
                .unwrap()
                .mutation_id();
            let second = engine
                .submit_mutation(key("p1"), MutationOp::Update, FieldPatch::new().set("sp", 7))
                .unwrap()
                .mutation_id();
            remote.apply_remote_write(
                &key("p1"),
                MutationOp::Update,
                &FieldPatch::new().set("hp", 2),
                &other(),
            );

            // Crash after the conflict was recorded, before the store caught up.
            let m = engine.outbox().get(first).unwrap().unwrap();
            engine.outbox().mark_sent(first).unwrap();
            assert!(matches!(
                remote.commit(&m).await,
                Err(RemoteError::VersionConflict { .. })
            ));
            let carry = Carry::Fold {
                into: second,
                op: MutationOp::Update,
                field_patch: FieldPatch::new().set("mp", 5).set("sp", 7),
            };
            assert_eq!(
                engine.outbox().conflict(first, Some(carry)).unwrap(),
                Some(second)
            );
            (first, second)
        };

        let engine = open(Arc::new(Database::open(&path).unwrap()), &remote);
        assert!(engine.outbox().get(conflicted).unwrap().is_none());
        assert_eq!(
            engine.outbox().get(successor).unwrap().unwrap().state,
            MutationState::Pending
        );

        for _ in 0..4 {
            engine.drain_once().await.unwrap();
        }
        engine.pull_once(&players()).await.unwrap();
        assert!(engine.outbox().is_empty().unwrap());

        let resent = remote
            .attempts()
            .into_iter()
            .filter(|(_, id)| *id == conflicted)
            .count();
        assert_eq!(resent, 1);
        let carried = remote
            .commits(&key("p1"))
            .into_iter()
            .filter(|c| c.patch.get("mp").is_some())
            .count();
        assert_eq!(carried, 1);

        let server = remote.document(&key("p1")).unwrap();
        assert_eq!(int(&server, "hp"), Some(2));
        assert_eq!(int(&server, "mp"), Some(5));
        assert_eq!(int(&server, "sp"), Some(7));
        assert_eq!(engine.get(&key("p1")).unwrap().unwrap().values(), server.values());
    }

    #[tokio::test]
    async fn test_recovery_reverts_failed_mutation() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("replica.db");
        let remote = MemoryRemote::new();
        remote.apply_remote_write(
            &key("p1"),
            MutationOp::Create,
            &FieldPatch::new().set("hp", 1),
            &other(),
        );

        {
            let engine = open(Arc::new(Database::open(&path).unwrap()), &remote);
            engine.pull_once(&players()).await.unwrap();
            let id = engine
                .submit_mutation(key("p1"), MutationOp::Update, FieldPatch::new().set("admin", true))
                .unwrap()
                .mutation_id();
            // Crash after the refusal was recorded, before the revert.
            engine.outbox().mark_sent(id).unwrap();
            engine.outbox().mark_failed(id, "field is read-only").unwrap();
            assert!(engine.get(&key("p1")).unwrap().unwrap().value("admin").is_some());
        }

        let reverted = {
            let engine = open(Arc::new(Database::open(&path).unwrap()), &remote);
            let local = engine.get(&key("p1")).unwrap().unwrap();
            assert!(local.value("admin").is_none());
            assert_eq!(int(&local, "hp"), Some(1));
            assert_eq!(engine.outbox().failed().unwrap().len(), 1);
            local.version
        };

        // Already consistent: a further restart leaves the row alone.
        let engine = open(Arc::new(Database::open(&path).unwrap()), &remote);
        assert_eq!(engine.get(&key("p1")).unwrap().unwrap().version, reverted);
    }

    #[tokio::test]
    async fn test_parallel_drain_keeps_per_entity_order() {
        let remote = MemoryRemote::new();
        let db = Arc::new(Database::in_memory().unwrap());
        let mut config = config();
        config.max_parallel_entities = 4;
        let engine = SyncEngine::open(db, Arc::new(remote.clone()), config).unwrap();

        let ids = ["a", "b", "c"];
        for id in ids {
            engine
                .submit_mutation(key(id), MutationOp::Create, FieldPatch::new().set("x", 1))
                .unwrap();
        }
        for id in ids {
            engine
                .submit_mutation(key(id), MutationOp::Update, FieldPatch::new().set("x", 2))
                .unwrap();
        }

        let report = engine.drain_once().await.unwrap();
        assert_eq!(report.acknowledged, 6);
        assert!(engine.outbox().is_empty().unwrap());

        for id in ids {
            let commits = remote.commits(&key(id));
            let ops: Vec<_> = commits.iter().map(|c| c.op).collect();
            assert_eq!(ops, vec![MutationOp::Create, MutationOp::Update]);
            assert!(commits[0].version < commits[1].version);
            assert_eq!(int(&remote.document(&key(id)).unwrap(), "x"), Some(2));
            assert_eq!(int(&engine.get(&key(id)).unwrap().unwrap(), "x"), Some(2));
        }
    }

    #[tokio::test]
    async fn test_cursor_survives_restart() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("replica.db");
        let remote = MemoryRemote::new();
        remote.apply_remote_write(
            &key("p1"),
            MutationOp::Create,
            &FieldPatch::new().set("hp", 1),
            &other(),
        );

        {
            let engine = open(Arc::new(Database::open(&path).unwrap()), &remote);
            engine.pull_once(&players()).await.unwrap();
        }
        remote.apply_remote_write(
            &key("p1"),
            MutationOp::Update,
            &FieldPatch::new().set("hp", 2),
            &other(),
        );

        let engine = open(Arc::new(Database::open(&path).unwrap()), &remote);
        let report = engine.pull_once(&players()).await.unwrap();
        assert!(!report.resynced);
        assert_eq!(report.applied, 1);
        assert_eq!(int(&engine.get(&key("p1")).unwrap().unwrap(), "hp"), Some(2));
    }

    #[tokio::test]
    async fn test_sync_degraded_advisory() {
        let remote = MemoryRemote::new();
        let db = Arc::new(Database::in_memory().unwrap());
        let engine = SyncEngine::open(
            db,
            Arc::new(remote.clone()),
            config().with_staleness_threshold(Duration::ZERO),
        )
        .unwrap();
        assert_eq!(engine.check_staleness().unwrap(), None);

        remote.set_online(false);
        let mut events = engine.events();
        engine
            .submit_mutation(key("p1"), MutationOp::Create, FieldPatch::new().set("hp", 1))
            .unwrap();
        engine.drain_once().await.unwrap();

        assert!(engine.check_staleness().unwrap().is_some());
        assert!(engine.check_staleness().unwrap().is_some());
        let degraded = std::iter::from_fn(|| events.try_recv().ok())
            .filter(|e| matches!(e, SyncEvent::SyncDegraded { .. }))
            .count();
        assert_eq!(degraded, 1);
    }

    #[tokio::test]
    async fn test_observers_see_remote_changes() {
        let (engine, remote) = setup();
        let mut changes = engine
            .observe_query(&players(), Predicate::exists("hp"))
            .unwrap();
        remote.apply_remote_write(
            &key("p1"),
            MutationOp::Create,
            &FieldPatch::new().set("hp", 1),
            &other(),
        );
        engine.pull_once(&players()).await.unwrap();

        let event = changes.try_next().unwrap();
        assert_eq!(event.kind, tidesync_store::ChangeKind::Added);
        assert_eq!(event.key(), &key("p1"));
    }

    #[tokio::test]
    async fn test_sign_out_wipes_local_state() {
        let (engine, _remote) = setup();
        engine
            .submit_mutation(key("p1"), MutationOp::Create, FieldPatch::new().set("hp", 1))
            .unwrap();
        engine.sign_out().unwrap();
        assert!(engine.get(&key("p1")).unwrap().is_none());
        assert!(engine.outbox().is_empty().unwrap());
    }

    #[test]
    fn test_fold_op() {
        assert_eq!(fold_op(MutationOp::Update, MutationOp::Update), MutationOp::Update);
        assert_eq!(fold_op(MutationOp::Create, MutationOp::Update), MutationOp::Create);
        assert_eq!(fold_op(MutationOp::Delete, MutationOp::Update), MutationOp::Create);
        assert_eq!(fold_op(MutationOp::Update, MutationOp::Delete), MutationOp::Delete);
    }
}
