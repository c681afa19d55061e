//! Remote document store gateway trait definition.

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

use tidesync_common::{
    CollectionName, Entity, EntityKey, Mutation, RemoteDelta, RemoteError, ResumeToken, Result,
    Version,
};

/// Result of a remote call that can only fail with a [`RemoteError`].
pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// A contiguous run of remote changes for one collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaBatch {
    pub collection: CollectionName,
    /// Changes in commit order.
    pub deltas: Vec<RemoteDelta>,
    /// Where to resume after this batch.
    pub cursor: ResumeToken,
    /// Highest remote version covered by this batch.
    pub watermark: Version,
}

impl DeltaBatch {
    pub fn is_empty(&self) -> bool {
        self.deltas.is_empty()
    }
}

/// Complete state of a collection at one point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub collection: CollectionName,
    /// Live entities only.
    pub entities: Vec<Entity>,
    /// Change-stream position matching the snapshot.
    pub cursor: ResumeToken,
    pub watermark: Version,
}

/// Stream of delta batches.
///
/// Yields `Error::Remote` for connection problems and
/// `Error::StreamBroken` when the position can no longer be resumed.
pub type DeltaStream = Pin<Box<dyn Stream<Item = Result<DeltaBatch>> + Send>>;

/// Gateway to the remote document store.
///
/// Implementations must be idempotent per `(origin, mutation_id)`: a
/// commit that is retried after an unknown outcome returns the version of
/// the first successful application instead of applying twice.
#[async_trait]
pub trait RemoteGateway: Send + Sync {
    /// Get the gateway name (e.g., "memory", "firestore").
    fn name(&self) -> &str;

    /// Apply one mutation remotely.
    ///
    /// # Preconditions
    /// - `mutation.base_version` is the remote version the edit was based on
    ///
    /// # Postconditions
    /// - Returns the remote version assigned to the write
    ///
    /// # Errors
    /// - `VersionConflict` when the entity moved past `base_version`
    /// - `Rejected` when the write is refused for good
    /// - `Unreachable` on connectivity loss
    /// - `Unauthorized` when the session is refused
    async fn commit(&self, mutation: &Mutation) -> RemoteResult<Version>;

    /// Point read of one live entity.
    async fn get(&self, key: &EntityKey) -> RemoteResult<Option<Entity>>;

    /// Full snapshot of a collection plus a fresh cursor.
    async fn fetch_collection(&self, collection: &CollectionName) -> RemoteResult<Snapshot>;

    /// One poll of the change feed after `cursor` (`None` = from the start).
    ///
    /// # Errors
    /// - `StreamBroken` when the cursor is no longer resumable
    async fn changes_since(
        &self,
        collection: &CollectionName,
        cursor: Option<&ResumeToken>,
        limit: usize,
    ) -> Result<DeltaBatch>;

    /// Open a live change stream after `cursor`.
    ///
    /// The returned stream ends on connection loss; see
    /// [`crate::resume::resumable`] for a stream that reconnects.
    async fn subscribe(
        &self,
        collection: &CollectionName,
        cursor: Option<ResumeToken>,
    ) -> Result<DeltaStream>;

    /// Cheap connectivity check.
    async fn ping(&self) -> RemoteResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tidesync_common::{DeltaKind, DeltaValue, ReplicaId};

    #[test]
    fn test_delta_batch_serialization() {
        let batch = DeltaBatch {
            collection: CollectionName::new("players").unwrap(),
            deltas: vec![RemoteDelta {
                key: EntityKey::parse("players", "p1").unwrap(),
                kind: DeltaKind::Removed,
                value: DeltaValue::Full(BTreeMap::new()),
                remote_version: Version::new(4),
                writer: ReplicaId::new("r2").unwrap(),
            }],
            cursor: ResumeToken::new("4"),
            watermark: Version::new(4),
        };

        let json = serde_json::to_string(&batch).unwrap();
        let back: DeltaBatch = serde_json::from_str(&json).unwrap();
        assert_eq!(back, batch);
        assert!(!back.is_empty());
    }
}
