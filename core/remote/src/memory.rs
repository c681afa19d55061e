//! In-memory remote document store for testing and demos.
//!
//! Models the server side of the sync protocol: a global commit clock,
//! optimistic concurrency on `base_version`, idempotent commits per
//! `(origin, mutation_id)`, a per-collection change log that can be
//! compacted, and switches for connectivity, authorization and rejections.

use async_trait::async_trait;
use futures::stream;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::watch;
use tracing::{debug, info};

use tidesync_common::{
    CollectionName, DeltaKind, DeltaValue, Entity, EntityKey, Error, FieldPatch, Mutation,
    MutationId, MutationOp, RemoteDelta, RemoteError, ReplicaId, ResumeToken, Result, Version,
};

use crate::gateway::{DeltaBatch, DeltaStream, RemoteGateway, RemoteResult, Snapshot};

/// Deltas handed out per poll of a live stream.
const STREAM_BATCH: usize = 64;

/// One write applied by the server, in commit order.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitRecord {
    pub key: EntityKey,
    pub op: MutationOp,
    pub patch: FieldPatch,
    pub version: Version,
    pub writer: ReplicaId,
    /// `None` for writes made through [`MemoryRemote::apply_remote_write`].
    pub mutation_id: Option<MutationId>,
}

struct ServerState {
    clock: Version,
    docs: BTreeMap<EntityKey, Entity>,
    logs: HashMap<CollectionName, Vec<RemoteDelta>>,
    /// Positions below this can no longer be resumed.
    horizons: HashMap<CollectionName, Version>,
    applied: HashMap<(ReplicaId, MutationId), Version>,
    history: Vec<CommitRecord>,
    attempts: Vec<(ReplicaId, MutationId)>,
    online: bool,
    authorized: bool,
    rejected_fields: HashMap<String, String>,
    lose_next_ack: bool,
}

impl ServerState {
    fn new() -> Self {
        Self {
            clock: Version::ZERO,
            docs: BTreeMap::new(),
            logs: HashMap::new(),
            horizons: HashMap::new(),
            applied: HashMap::new(),
            history: Vec::new(),
            attempts: Vec::new(),
            online: true,
            authorized: true,
            rejected_fields: HashMap::new(),
            lose_next_ack: false,
        }
    }

    fn check_access(&self) -> RemoteResult<()> {
        if !self.online {
            return Err(RemoteError::Unreachable("memory remote is offline".to_string()));
        }
        if !self.authorized {
            return Err(RemoteError::Unauthorized);
        }
        Ok(())
    }

    fn current_version(&self, key: &EntityKey) -> Version {
        self.docs
            .get(key)
            .map(|d| d.remote_version)
            .unwrap_or(Version::ZERO)
    }

    fn apply_write(
        &mut self,
        key: &EntityKey,
        op: MutationOp,
        patch: &FieldPatch,
        writer: &ReplicaId,
        mutation_id: Option<MutationId>,
    ) -> Version {
        self.clock = self.clock.next();
        let version = self.clock;

        let was_live = self.docs.get(key).map(|d| !d.tombstone).unwrap_or(false);
        let doc = self
            .docs
            .entry(key.clone())
            .or_insert_with(|| Entity::new(key.clone()));
        match op {
            MutationOp::Create => {
                doc.fields.clear();
                doc.tombstone = false;
                doc.apply_patch(patch, version, writer);
            }
            MutationOp::Update => {
                doc.tombstone = false;
                doc.apply_patch(patch, version, writer);
            }
            MutationOp::Delete => doc.make_tombstone(),
        }
        doc.version = version;
        doc.remote_version = version;

        let kind = if doc.tombstone {
            DeltaKind::Removed
        } else if was_live {
            DeltaKind::Modified
        } else {
            DeltaKind::Added
        };
        let delta = RemoteDelta {
            key: key.clone(),
            kind,
            value: DeltaValue::Full(doc.fields.clone()),
            remote_version: version,
            writer: writer.clone(),
        };
        self.logs
            .entry(key.collection.clone())
            .or_default()
            .push(delta);
        self.history.push(CommitRecord {
            key: key.clone(),
            op,
            patch: patch.clone(),
            version,
            writer: writer.clone(),
            mutation_id,
        });
        version
    }

    fn commit(&mut self, mutation: &Mutation) -> RemoteResult<Version> {
        self.check_access()?;
        self.attempts
            .push((mutation.origin.clone(), mutation.mutation_id));

        let idem = (mutation.origin.clone(), mutation.mutation_id);
        if let Some(version) = self.applied.get(&idem) {
            debug!("Replayed commit {} -> {}", mutation.mutation_id, version);
            return Ok(*version);
        }

        if let Some(reason) = mutation
            .field_patch
            .fields()
            .find_map(|f| self.rejected_fields.get(f))
        {
            return Err(RemoteError::Rejected(reason.clone()));
        }

        let current = self.current_version(&mutation.key);
        if mutation.base_version != current {
            return Err(RemoteError::VersionConflict {
                current_version: current,
                current_value: self.docs.get(&mutation.key).cloned().map(Box::new),
            });
        }

        let version = self.apply_write(
            &mutation.key,
            mutation.op,
            &mutation.field_patch,
            &mutation.origin,
            Some(mutation.mutation_id),
        );
        self.applied.insert(idem, version);

        if self.lose_next_ack {
            self.lose_next_ack = false;
            return Err(RemoteError::Unreachable(
                "connection dropped before acknowledgment".to_string(),
            ));
        }
        Ok(version)
    }

    fn changes_since(
        &self,
        collection: &CollectionName,
        cursor: Option<&ResumeToken>,
        limit: usize,
    ) -> Result<DeltaBatch> {
        self.check_access()?;
        let broken = || Error::StreamBroken {
            collection: collection.to_string(),
            cursor_invalid: true,
        };
        let from = match cursor {
            Some(token) => parse_token(token).ok_or_else(broken)?,
            None => Version::ZERO,
        };
        let horizon = self
            .horizons
            .get(collection)
            .copied()
            .unwrap_or(Version::ZERO);
        if from < horizon {
            return Err(broken());
        }

        let deltas: Vec<RemoteDelta> = self
            .logs
            .get(collection)
            .map(|log| {
                log.iter()
                    .filter(|d| d.remote_version > from)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let position = match deltas.last() {
            Some(last) if deltas.len() == limit => last.remote_version,
            _ => self.clock.max(from),
        };
        Ok(DeltaBatch {
            collection: collection.clone(),
            deltas,
            cursor: token_for(position),
            watermark: position,
        })
    }
}

fn token_for(version: Version) -> ResumeToken {
    ResumeToken::new(version.get().to_string())
}

fn parse_token(token: &ResumeToken) -> Option<Version> {
    token.as_str().parse::<u64>().ok().map(Version::new)
}

/// In-memory remote store.
///
/// Cloning shares the same server, so several replicas can talk to it.
#[derive(Clone)]
pub struct MemoryRemote {
    state: Arc<Mutex<ServerState>>,
    wake: Arc<watch::Sender<u64>>,
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (wake, _) = watch::channel(0);
        Self {
            state: Arc::new(Mutex::new(ServerState::new())),
            wake: Arc::new(wake),
        }
    }

    fn lock(state: &Mutex<ServerState>) -> MutexGuard<'_, ServerState> {
        state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        Self::lock(&self.state)
    }

    fn wake_streams(&self) {
        self.wake.send_modify(|generation| *generation += 1);
    }

    /// Write directly on the server, as another client would.
    pub fn apply_remote_write(
        &self,
        key: &EntityKey,
        op: MutationOp,
        patch: &FieldPatch,
        writer: &ReplicaId,
    ) -> Version {
        let version = self.state().apply_write(key, op, patch, writer, None);
        debug!("Remote write to {} by {} at {}", key, writer, version);
        self.wake_streams();
        version
    }

    /// Switch connectivity. Going offline ends every open stream.
    pub fn set_online(&self, online: bool) {
        self.state().online = online;
        info!("Memory remote {}", if online { "online" } else { "offline" });
        self.wake_streams();
    }

    pub fn set_authorized(&self, authorized: bool) {
        self.state().authorized = authorized;
        self.wake_streams();
    }

    /// Refuse any mutation touching `field`.
    pub fn reject_field(&self, field: impl Into<String>, reason: impl Into<String>) {
        self.state()
            .rejected_fields
            .insert(field.into(), reason.into());
    }

    /// Apply the next commit but report it as lost in transit.
    pub fn lose_next_ack(&self) {
        self.state().lose_next_ack = true;
    }

    /// Drop a collection's change log. Older cursors become unresumable.
    pub fn compact(&self, collection: &CollectionName) {
        let mut state = self.state();
        let clock = state.clock;
        state.logs.remove(collection);
        state.horizons.insert(collection.clone(), clock);
        info!("Compacted change log of {} at {}", collection, clock);
    }

    /// Current commit clock.
    pub fn clock(&self) -> Version {
        self.state().clock
    }

    /// Stored document, including tombstones.
    pub fn document(&self, key: &EntityKey) -> Option<Entity> {
        self.state().docs.get(key).cloned()
    }

    /// Applied writes to one entity, in commit order.
    pub fn commits(&self, key: &EntityKey) -> Vec<CommitRecord> {
        self.state()
            .history
            .iter()
            .filter(|c| &c.key == key)
            .cloned()
            .collect()
    }

    /// Every commit attempt received, including refused ones.
    pub fn attempts(&self) -> Vec<(ReplicaId, MutationId)> {
        self.state().attempts.clone()
    }
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteGateway for MemoryRemote {
    fn name(&self) -> &str {
        "memory"
    }

    async fn commit(&self, mutation: &Mutation) -> RemoteResult<Version> {
        let result = self.state().commit(mutation);
        if result.is_ok() {
            self.wake_streams();
        }
        result
    }

    async fn get(&self, key: &EntityKey) -> RemoteResult<Option<Entity>> {
        let state = self.state();
        state.check_access()?;
        Ok(state.docs.get(key).filter(|d| !d.tombstone).cloned())
    }

    async fn fetch_collection(&self, collection: &CollectionName) -> RemoteResult<Snapshot> {
        let state = self.state();
        state.check_access()?;
        let entities = state
            .docs
            .values()
            .filter(|d| &d.key.collection == collection && !d.tombstone)
            .cloned()
            .collect();
        Ok(Snapshot {
            collection: collection.clone(),
            entities,
            cursor: token_for(state.clock),
            watermark: state.clock,
        })
    }

    async fn changes_since(
        &self,
        collection: &CollectionName,
        cursor: Option<&ResumeToken>,
        limit: usize,
    ) -> Result<DeltaBatch> {
        self.state().changes_since(collection, cursor, limit)
    }

    async fn subscribe(
        &self,
        collection: &CollectionName,
        cursor: Option<ResumeToken>,
    ) -> Result<DeltaStream> {
        // Fail fast, like a real connection attempt would.
        self.state().check_access()?;

        let state = Arc::clone(&self.state);
        let wake = self.wake.subscribe();
        let collection = collection.clone();
        let stream = stream::unfold(
            (state, wake, collection, cursor, false),
            |(state, mut wake, collection, mut cursor, done)| async move {
                if done {
                    return None;
                }
                loop {
                    let _ = wake.borrow_and_update();
                    let polled =
                        Self::lock(&state).changes_since(&collection, cursor.as_ref(), STREAM_BATCH);
                    match polled {
                        Ok(batch) if batch.is_empty() => {
                            cursor = Some(batch.cursor);
                            if wake.changed().await.is_err() {
                                return None;
                            }
                        }
                        Ok(batch) => {
                            cursor = Some(batch.cursor.clone());
                            return Some((Ok(batch), (state, wake, collection, cursor, false)));
                        }
                        Err(e) => {
                            return Some((Err(e), (state, wake, collection, cursor, true)));
                        }
                    }
                }
            },
        );
        Ok(Box::pin(stream))
    }

    async fn ping(&self) -> RemoteResult<()> {
        self.state().check_access()
    }
}
