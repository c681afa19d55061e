//! Entities, mutations, remote deltas and sync cursors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::types::{CollectionName, EntityKey, MutationId, ReplicaId, Version};
use crate::value::{FieldOp, FieldPatch, Value};
use crate::{Error, Result};

/// A field value with its last-writer metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub value: Value,
    /// Server-anchored logical time of the last write to this field.
    pub modified_at: Version,
    /// Replica that performed the last write.
    pub writer: ReplicaId,
}

/// A synchronized record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub key: EntityKey,
    pub fields: BTreeMap<String, Field>,
    /// Materialization counter; strictly increases with every stored write.
    pub version: Version,
    /// Last remote version folded into this state.
    pub remote_version: Version,
    pub tombstone: bool,
}

impl Entity {
    /// Create an empty, live entity that has never been stored.
    pub fn new(key: EntityKey) -> Self {
        Self {
            key,
            fields: BTreeMap::new(),
            version: Version::ZERO,
            remote_version: Version::ZERO,
            tombstone: false,
        }
    }

    pub fn value(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).map(|f| &f.value)
    }

    /// Plain field values without metadata.
    pub fn values(&self) -> BTreeMap<String, Value> {
        self.fields
            .iter()
            .map(|(name, f)| (name.clone(), f.value.clone()))
            .collect()
    }

    /// Apply a patch, stamping every touched field.
    pub fn apply_patch(&mut self, patch: &FieldPatch, stamp: Version, writer: &ReplicaId) {
        for (name, op) in patch.iter() {
            self.apply_op(name, op, stamp, writer);
        }
    }

    /// Apply a patch, skipping fields that already carry a newer stamp.
    ///
    /// Set edits always apply since they commute with concurrent edits.
    pub fn apply_patch_if_newer(
        &mut self,
        patch: &FieldPatch,
        stamp: Version,
        writer: &ReplicaId,
    ) {
        for (name, op) in patch.iter() {
            let newer_exists = self
                .fields
                .get(name)
                .map(|f| f.modified_at > stamp)
                .unwrap_or(false);
            if newer_exists && !op.is_set_edit() {
                continue;
            }
            self.apply_op(name, op, stamp, writer);
        }
    }

    pub(crate) fn apply_op(&mut self, name: &str, op: &FieldOp, stamp: Version, writer: &ReplicaId) {
        match op.apply(self.value(name)) {
            Some(value) => {
                let modified_at = self
                    .fields
                    .get(name)
                    .map(|f| f.modified_at.max(stamp))
                    .unwrap_or(stamp);
                self.fields.insert(
                    name.to_string(),
                    Field {
                        value,
                        modified_at,
                        writer: writer.clone(),
                    },
                );
            }
            None => {
                self.fields.remove(name);
            }
        }
    }

    /// The most recent write time observed on this entity.
    pub fn last_modified(&self) -> Version {
        self.fields
            .values()
            .map(|f| f.modified_at)
            .max()
            .unwrap_or(Version::ZERO)
            .max(self.remote_version)
    }

    /// Turn this entity into a tombstone, dropping its fields.
    pub fn make_tombstone(&mut self) {
        self.fields.clear();
        self.tombstone = true;
    }

    /// A patch that recreates every field of this entity.
    pub fn as_full_patch(&self) -> FieldPatch {
        self.fields
            .iter()
            .map(|(name, f)| {
                (
                    name.clone(),
                    FieldOp::Set {
                        value: f.value.clone(),
                    },
                )
            })
            .collect()
    }

    pub fn with_version(mut self, version: Version) -> Self {
        self.version = version;
        self
    }
}

/// Kind of a local mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationOp {
    Create,
    Update,
    Delete,
}

impl MutationOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationOp::Create => "create",
            MutationOp::Update => "update",
            MutationOp::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "create" => Ok(MutationOp::Create),
            "update" => Ok(MutationOp::Update),
            "delete" => Ok(MutationOp::Delete),
            other => Err(Error::InvalidInput(format!("Unknown mutation op: {}", other))),
        }
    }
}

impl fmt::Display for MutationOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a mutation in the outbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MutationState {
    /// Waiting to be sent.
    Pending,
    /// Commit issued, outcome unknown.
    Sent,
    /// Remote confirmed the write.
    Acknowledged,
    /// Remote refused the write for good.
    Failed,
    /// Remote reported a version conflict; resolved locally.
    Conflicted,
}

impl MutationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationState::Pending => "pending",
            MutationState::Sent => "sent",
            MutationState::Acknowledged => "acknowledged",
            MutationState::Failed => "failed",
            MutationState::Conflicted => "conflicted",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(MutationState::Pending),
            "sent" => Ok(MutationState::Sent),
            "acknowledged" => Ok(MutationState::Acknowledged),
            "failed" => Ok(MutationState::Failed),
            "conflicted" => Ok(MutationState::Conflicted),
            other => Err(Error::StorageCorrupt(format!(
                "Unknown mutation state: {}",
                other
            ))),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MutationState::Acknowledged | MutationState::Failed | MutationState::Conflicted
        )
    }

    /// Pending or sent: the mutation still shapes the local view.
    pub fn is_open(&self) -> bool {
        matches!(self, MutationState::Pending | MutationState::Sent)
    }
}

impl fmt::Display for MutationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mutation before it has been assigned an outbox id.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationDraft {
    pub key: EntityKey,
    pub op: MutationOp,
    pub field_patch: FieldPatch,
    pub base_version: Version,
    pub created_at: Version,
    pub submitted_at: DateTime<Utc>,
    pub origin: ReplicaId,
}

/// A local mutation owned by the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    pub mutation_id: MutationId,
    pub key: EntityKey,
    pub op: MutationOp,
    pub field_patch: FieldPatch,
    /// Remote version this edit was based on.
    pub base_version: Version,
    /// Server-anchored logical time of the edit.
    pub created_at: Version,
    /// Wall-clock submission time, only used for staleness advisories.
    pub submitted_at: DateTime<Utc>,
    pub origin: ReplicaId,
    pub state: MutationState,
    pub attempts: u32,
    pub last_error: Option<String>,
    /// Remote version assigned on acknowledgment.
    pub acked_version: Option<Version>,
}

impl Mutation {
    /// Build an outbox row from a draft and its assigned id.
    pub fn from_draft(mutation_id: MutationId, draft: MutationDraft) -> Self {
        Self {
            mutation_id,
            key: draft.key,
            op: draft.op,
            field_patch: draft.field_patch,
            base_version: draft.base_version,
            created_at: draft.created_at,
            submitted_at: draft.submitted_at,
            origin: draft.origin,
            state: MutationState::Pending,
            attempts: 0,
            last_error: None,
            acked_version: None,
        }
    }

    /// A mutation carrying no local intent, used to resolve a remote delta
    /// against the current local state.
    pub fn noop(key: EntityKey, base_version: Version, origin: ReplicaId) -> Self {
        Self {
            mutation_id: MutationId::new(0),
            key,
            op: MutationOp::Update,
            field_patch: FieldPatch::new(),
            base_version,
            created_at: base_version,
            submitted_at: Utc::now(),
            origin,
            state: MutationState::Pending,
            attempts: 0,
            last_error: None,
            acked_version: None,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.op == MutationOp::Update && self.field_patch.is_empty()
    }

    /// Overlay this mutation onto an entity state, stamping with the given
    /// logical time. The returned entity keeps the input's versions.
    pub fn overlay(&self, entity: Option<&Entity>, stamp: Version) -> Entity {
        let mut out = entity
            .cloned()
            .unwrap_or_else(|| Entity::new(self.key.clone()));
        match self.op {
            MutationOp::Create => {
                out.fields.clear();
                out.tombstone = false;
                out.apply_patch(&self.field_patch, stamp, &self.origin);
            }
            MutationOp::Update => {
                out.tombstone = false;
                out.apply_patch(&self.field_patch, stamp, &self.origin);
            }
            MutationOp::Delete => out.make_tombstone(),
        }
        out
    }
}

/// Kind of remote change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    Added,
    Modified,
    Removed,
}

/// Payload of a remote change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaValue {
    /// The complete field map after the change.
    Full(BTreeMap<String, Field>),
    /// Only the operations of the change.
    Patch(FieldPatch),
}

/// An incremental remote change event for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteDelta {
    pub key: EntityKey,
    pub kind: DeltaKind,
    pub value: DeltaValue,
    pub remote_version: Version,
    /// Replica whose commit produced the change.
    pub writer: ReplicaId,
}

impl RemoteDelta {
    /// The remote entity this delta describes, given the entity it applies to.
    pub fn materialize(&self, base: Option<&Entity>) -> Entity {
        let mut entity = match (&self.value, base) {
            (DeltaValue::Full(fields), _) => {
                let mut e = Entity::new(self.key.clone());
                e.fields = fields.clone();
                e
            }
            (DeltaValue::Patch(patch), base) => {
                let mut e = base
                    .cloned()
                    .unwrap_or_else(|| Entity::new(self.key.clone()));
                e.apply_patch(patch, self.remote_version, &self.writer);
                e
            }
        };
        entity.tombstone = false;
        if self.kind == DeltaKind::Removed {
            entity.make_tombstone();
        }
        entity.version = self.remote_version;
        entity.remote_version = self.remote_version;
        entity
    }
}

/// Opaque position in a remote change stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResumeToken(String);

impl ResumeToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResumeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persisted resume point of one collection's change stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub collection: CollectionName,
    pub token: Option<ResumeToken>,
    /// Highest remote version applied for this collection.
    pub watermark: Version,
    pub updated_at: DateTime<Utc>,
}

impl SyncCursor {
    pub fn new(collection: CollectionName) -> Self {
        Self {
            collection,
            token: None,
            watermark: Version::ZERO,
            updated_at: Utc::now(),
        }
    }

    /// Move the cursor forward. The watermark never goes back.
    pub fn advance(&mut self, token: ResumeToken, watermark: Version) {
        self.token = Some(token);
        self.watermark = self.watermark.max(watermark);
        self.updated_at = Utc::now();
    }
}
