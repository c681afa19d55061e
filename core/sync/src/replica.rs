//! Caller API: submit and cancel mutations, read and observe local state.

use chrono::Utc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, info};

use tidesync_common::{
    CollectionName, Entity, EntityKey, Error, FieldPatch, MutationDraft, MutationId, MutationOp,
    RemoteError, Result, Version,
};
use tidesync_store::{ChangeStream, Predicate};

use crate::conflict::Outcome;
use crate::engine::SyncEngine;
use crate::state::{CollectionState, Connectivity};

/// Terminal result of a submitted mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// Committed as sent.
    Acknowledged { remote_version: Version },
    /// Committed state moved on concurrently; the local intent was merged.
    /// Whatever survived is carried by `carried_by`.
    Merged {
        outcome: Outcome,
        remote_version: Version,
        carried_by: Option<MutationId>,
    },
    /// Refused by the remote store; the optimistic write was reverted.
    Failed { error: RemoteError },
    /// Withdrawn before it was sent.
    Cancelled,
}

/// Advisory notifications from the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent {
    MutationSettled {
        mutation_id: MutationId,
        key: EntityKey,
        outcome: MutationOutcome,
    },
    MutationFailed {
        mutation_id: MutationId,
        key: EntityKey,
        error: RemoteError,
    },
    /// The oldest open mutation has waited longer than the staleness
    /// threshold. Informational only.
    SyncDegraded { oldest: MutationId, age: Duration },
    StateChanged {
        collection: CollectionName,
        state: CollectionState,
    },
    ConnectivityChanged(Connectivity),
    Resynced {
        collection: CollectionName,
        entities: usize,
    },
}

/// Handle to a submitted mutation.
#[derive(Debug)]
pub struct MutationHandle {
    mutation_id: MutationId,
    key: EntityKey,
    rx: oneshot::Receiver<MutationOutcome>,
}

impl MutationHandle {
    pub fn mutation_id(&self) -> MutationId {
        self.mutation_id
    }

    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    /// Wait for the mutation to reach a terminal state.
    ///
    /// # Errors
    /// - `Shutdown` if the engine went away first; the mutation stays in
    ///   the outbox and is picked up on the next start
    pub async fn wait(self) -> Result<MutationOutcome> {
        self.rx.await.map_err(|_| Error::Shutdown)
    }
}

impl SyncEngine {
    /// Record a local edit: durable outbox append plus optimistic write.
    ///
    /// # Errors
    /// - `InvalidInput` for an update without changes or a delete with a patch
    /// - `NotFound` when deleting an entity that is not live locally
    /// - `StorageFull`/`StorageCorrupt` when the outbox cannot take it; the
    ///   local store is left untouched
    pub fn submit_mutation(
        &self,
        key: EntityKey,
        op: MutationOp,
        field_patch: FieldPatch,
    ) -> Result<MutationHandle> {
        match op {
            MutationOp::Update if field_patch.is_empty() => {
                return Err(Error::InvalidInput(format!("Empty update for {}", key)));
            }
            MutationOp::Delete if !field_patch.is_empty() => {
                return Err(Error::InvalidInput(format!(
                    "Delete of {} cannot carry fields",
                    key
                )));
            }
            _ => {}
        }

        let (tx, rx) = oneshot::channel();
        let mutation = {
            let guard = self.store.lock(&key)?;
            let row = guard.row()?;
            let current = row.as_ref().map(|r| r.entity.clone());
            if op == MutationOp::Delete && current.as_ref().map_or(true, |e| e.tombstone) {
                return Err(Error::NotFound(format!("No live entity {}", key)));
            }
            let base_version = row
                .as_ref()
                .and_then(|r| r.confirmed.as_ref())
                .map(|c| c.remote_version)
                .unwrap_or(Version::ZERO);

            let created_at = self.db.next_local_stamp()?;
            let mutation = self.outbox.enqueue(MutationDraft {
                key: key.clone(),
                op,
                field_patch,
                base_version,
                created_at,
                submitted_at: Utc::now(),
                origin: self.session.replica_id.clone(),
            })?;

            let optimistic = mutation.overlay(current.as_ref(), created_at);
            if let Err(e) = guard.put(optimistic) {
                // No optimistic row without its durable record, and vice versa.
                self.outbox.purge(mutation.mutation_id)?;
                return Err(e);
            }
            self.lock_waiters().insert(mutation.mutation_id, tx);
            mutation
        };

        debug!(
            "Submitted {} {} for {}",
            mutation.mutation_id, mutation.op, mutation.key
        );
        self.wake.notify_one();
        Ok(MutationHandle {
            mutation_id: mutation.mutation_id,
            key,
            rx,
        })
    }

    /// Withdraw a mutation that has not been sent yet and revert its
    /// optimistic write.
    ///
    /// # Errors
    /// - `NotFound` for an unknown or already settled mutation
    /// - `NotCancellable` once it is in flight; its handle still settles
    pub fn cancel_mutation(&self, mutation_id: MutationId) -> Result<()> {
        let mutation = self
            .outbox
            .get(mutation_id)?
            .ok_or_else(|| Error::NotFound(format!("Mutation {}", mutation_id)))?;

        {
            let guard = self.store.lock(&mutation.key)?;
            self.outbox.cancel(mutation_id)?;
            let confirmed = guard.confirmed()?;
            self.rebuild(&guard, confirmed.as_ref())?;
        }

        info!("Cancelled {} for {}", mutation_id, mutation.key);
        self.settle(&mutation, MutationOutcome::Cancelled);
        Ok(())
    }

    /// Live entity as readers currently see it.
    pub fn get(&self, key: &EntityKey) -> Result<Option<Entity>> {
        self.store.get(key)
    }

    pub fn query(&self, collection: &CollectionName, predicate: &Predicate) -> Result<Vec<Entity>> {
        self.store.query(collection, predicate)
    }

    /// Current matches followed by live changes to them.
    pub fn observe_query(
        &self,
        collection: &CollectionName,
        predicate: Predicate,
    ) -> Result<ChangeStream> {
        self.store.subscribe(collection, predicate)
    }

    /// Host signal about network state, e.g. from a platform callback.
    pub fn connectivity_hint(&self, online: bool) {
        let next = if online {
            Connectivity::Online
        } else {
            Connectivity::Offline
        };
        self.set_connectivity(next);
        if online {
            self.wake.notify_one();
        }
    }

    /// Subscribe to advisory events. Slow receivers lose the oldest ones.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use futures::StreamExt;
    use std::sync::Arc;
    use tidesync_common::{MutationState, Value};
    use tidesync_remote::MemoryRemote;
    use tidesync_store::{ChangeKind, Database};

    fn key(id: &str) -> EntityKey {
        EntityKey::parse("players", id).unwrap()
    }

    fn engine_with(config: SyncConfig) -> (SyncEngine, MemoryRemote) {
        let remote = MemoryRemote::new();
        let db = Arc::new(Database::in_memory().unwrap());
        let engine = SyncEngine::open(db, Arc::new(remote.clone()), config).unwrap();
        (engine, remote)
    }

    fn engine() -> (SyncEngine, MemoryRemote) {
        engine_with(SyncConfig::for_collections(["players"]).unwrap())
    }

    #[test]
    fn test_submit_validates_input() {
        let (engine, _) = engine();
        assert!(matches!(
            engine.submit_mutation(key("p1"), MutationOp::Update, FieldPatch::new()),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            engine.submit_mutation(key("p1"), MutationOp::Delete, FieldPatch::new().set("a", 1)),
            Err(Error::InvalidInput(_))
        ));
        assert!(matches!(
            engine.submit_mutation(key("p1"), MutationOp::Delete, FieldPatch::new()),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn test_chained_mutations_share_base() {
        let (engine, _) = engine();
        let a = engine
            .submit_mutation(key("p1"), MutationOp::Create, FieldPatch::new().set("hp", 1))
            .unwrap();
        let b = engine
            .submit_mutation(key("p1"), MutationOp::Update, FieldPatch::new().set("mp", 2))
            .unwrap();

        let a = engine.outbox().get(a.mutation_id()).unwrap().unwrap();
        let b = engine.outbox().get(b.mutation_id()).unwrap().unwrap();
        assert!(a.mutation_id < b.mutation_id);
        assert_eq!(a.base_version, b.base_version);
        assert!(a.created_at <= b.created_at);

        let local = engine.get(&key("p1")).unwrap().unwrap();
        assert_eq!(local.value("hp"), Some(&Value::Int(1)));
        assert_eq!(local.value("mp"), Some(&Value::Int(2)));
    }

    #[tokio::test]
    async fn test_cancel_reverts_optimistic_write() {
        let (engine, _) = engine();
        let handle = engine
            .submit_mutation(key("p1"), MutationOp::Create, FieldPatch::new().set("hp", 1))
            .unwrap();
        let id = handle.mutation_id();

        engine.cancel_mutation(id).unwrap();
        assert_eq!(handle.wait().await.unwrap(), MutationOutcome::Cancelled);
        assert!(engine.get(&key("p1")).unwrap().is_none());
        assert!(engine.outbox().is_empty().unwrap());
        assert!(matches!(engine.cancel_mutation(id), Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_cancel_keeps_earlier_mutations() {
        let (engine, _) = engine();
        engine
            .submit_mutation(key("p1"), MutationOp::Create, FieldPatch::new().set("hp", 1))
            .unwrap();
        let second = engine
            .submit_mutation(key("p1"), MutationOp::Update, FieldPatch::new().set("hp", 5))
            .unwrap();

        engine.cancel_mutation(second.mutation_id()).unwrap();
        let local = engine.get(&key("p1")).unwrap().unwrap();
        assert_eq!(local.value("hp"), Some(&Value::Int(1)));
    }

    #[tokio::test]
    async fn test_cancel_after_send_is_refused() {
        let (engine, _) = engine();
        let handle = engine
            .submit_mutation(key("p1"), MutationOp::Create, FieldPatch::new().set("hp", 1))
            .unwrap();
        engine.outbox().mark_sent(handle.mutation_id()).unwrap();

        assert!(matches!(
            engine.cancel_mutation(handle.mutation_id()),
            Err(Error::NotCancellable(_))
        ));
        assert_eq!(
            engine.outbox().get(handle.mutation_id()).unwrap().unwrap().state,
            MutationState::Sent
        );
        assert!(engine.get(&key("p1")).unwrap().is_some());
    }

    #[test]
    fn test_storage_full_rolls_back() {
        let (engine, _) =
            engine_with(SyncConfig::for_collections(["players"]).unwrap().with_outbox_capacity(1));
        engine
            .submit_mutation(key("p1"), MutationOp::Create, FieldPatch::new().set("hp", 1))
            .unwrap();

        let err = engine
            .submit_mutation(key("p2"), MutationOp::Create, FieldPatch::new().set("hp", 2))
            .unwrap_err();
        assert!(matches!(err, Error::StorageFull(_)));
        assert!(engine.get(&key("p2")).unwrap().is_none());
        assert_eq!(engine.outbox().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_observe_query_reports_local_edits() {
        let (engine, _) = engine();
        let players = CollectionName::new("players").unwrap();
        engine
            .submit_mutation(key("p1"), MutationOp::Create, FieldPatch::new().set("hp", 1))
            .unwrap();

        let mut changes = engine
            .observe_query(&players, Predicate::eq("hp", 1))
            .unwrap();
        let initial = changes.next().await.unwrap();
        assert_eq!(initial.kind, ChangeKind::Added);

        engine
            .submit_mutation(key("p1"), MutationOp::Update, FieldPatch::new().set("hp", 2))
            .unwrap();
        let removed = changes.next().await.unwrap();
        assert_eq!(removed.kind, ChangeKind::Removed);
        assert!(removed.version() > initial.version());

        let matching = engine.query(&players, &Predicate::eq("hp", 2)).unwrap();
        assert_eq!(matching.len(), 1);
    }

    #[test]
    fn test_connectivity_hint_emits_once() {
        let (engine, _) = engine();
        let mut events = engine.events();
        engine.connectivity_hint(false);
        engine.connectivity_hint(false);
        assert_eq!(engine.connectivity(), Connectivity::Offline);

        assert_eq!(
            events.try_recv().unwrap(),
            SyncEvent::ConnectivityChanged(Connectivity::Offline)
        );
        assert!(events.try_recv().is_err());
    }
}
