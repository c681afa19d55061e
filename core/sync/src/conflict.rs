//! Conflict resolution between local mutations and remote state.
//!
//! Everything here is pure: the same inputs always give the same result,
//! and wall-clock time never enters a decision. Field timestamps are
//! server-anchored logical times, ties are broken on
//! `(entity_id, writer)`.

use tracing::debug;

use tidesync_common::{
    Entity, FieldOp, FieldPatch, Mutation, MutationOp, ReplicaId, Version,
};

/// Local intent that the remote store has not seen yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Rebase {
    pub op: MutationOp,
    pub patch: FieldPatch,
}

/// How a resolution went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// No concurrent remote change; the local mutation applies as is.
    Clean,
    /// Concurrent changes merged field by field; some local intent survives.
    Merged,
    /// The remote state wins entirely.
    RemoteWon,
    /// A local update outlived a concurrent remote delete.
    Resurrected,
}

/// Result of [`resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Remote state with the surviving local intent applied.
    pub entity: Entity,
    pub rebase: Option<Rebase>,
    pub outcome: Outcome,
}

/// Does a local write stamped `(local_at, local_writer)` beat a remote
/// field stamped `(remote_at, remote_writer)` on the same entity?
///
/// Later stamps win. Equal stamps compare `(entity_id, writer)`; the
/// entity id is shared, so the writer decides, and a full tie keeps the
/// local write.
fn local_wins(
    entity: &Entity,
    local_at: Version,
    local_writer: &ReplicaId,
    remote_at: Version,
    remote_writer: &ReplicaId,
) -> bool {
    if local_at != remote_at {
        return local_at > remote_at;
    }
    let id = &entity.key.entity_id;
    (id, local_writer) >= (id, remote_writer)
}

fn resolved_version(base: Option<&Entity>, remote: Option<&Entity>, local: &Mutation) -> Version {
    let base_v = base.map(|b| b.version).unwrap_or(Version::ZERO);
    let remote_v = remote.map(|r| r.version).unwrap_or(Version::ZERO);
    base_v.max(remote_v).max(local.base_version).next()
}

fn finish(
    mut entity: Entity,
    version: Version,
    rebase: Option<Rebase>,
    outcome: Outcome,
) -> Resolution {
    entity.version = version;
    Resolution {
        entity,
        rebase,
        outcome,
    }
}

/// Merge a local mutation with the remote state of its entity.
///
/// - `base`: the local state the mutation was made on (may be `None`)
/// - `local`: the mutation; a no-op mutation resolves a plain remote delta
/// - `remote`: current remote state, `None` if it never existed remotely
///
/// The resolved entity carries a version above every input.
pub fn resolve(base: Option<&Entity>, local: &Mutation, remote: Option<&Entity>) -> Resolution {
    let version = resolved_version(base, remote, local);
    let stamp = local.created_at;

    let remote = match remote {
        Some(r) => r,
        None => {
            let entity = local.overlay(None, stamp);
            if local.op == MutationOp::Delete || local.is_noop() {
                return finish(entity, version, None, Outcome::Clean);
            }
            let rebase = Rebase {
                op: local.op,
                patch: local.field_patch.clone(),
            };
            return finish(entity, version, Some(rebase), Outcome::Clean);
        }
    };

    if local.is_noop() {
        return finish(remote.clone(), version, None, Outcome::RemoteWon);
    }

    if remote.tombstone {
        return resolve_against_delete(local, remote, version);
    }

    let concurrent = remote.remote_version != local.base_version;

    if local.op == MutationOp::Delete {
        let delete_wins = !concurrent || stamp > remote.last_modified();
        if delete_wins {
            let mut entity = remote.clone();
            entity.make_tombstone();
            let rebase = Rebase {
                op: MutationOp::Delete,
                patch: FieldPatch::new(),
            };
            let outcome = if concurrent { Outcome::Merged } else { Outcome::Clean };
            return finish(entity, version, Some(rebase), outcome);
        }
        debug!(
            "Delete of {} lost to concurrent update at {}",
            local.key,
            remote.last_modified()
        );
        return finish(remote.clone(), version, None, Outcome::RemoteWon);
    }

    if !concurrent {
        let entity = local.overlay(Some(remote), stamp);
        let rebase = Rebase {
            op: local.op,
            patch: local.field_patch.clone(),
        };
        return finish(entity, version, Some(rebase), Outcome::Clean);
    }

    // Field-wise last-writer-wins against a remote that moved on.
    let surviving: FieldPatch = local
        .field_patch
        .iter()
        .filter(|(name, op)| match (op, remote.fields.get(name.as_str())) {
            (FieldOp::SetEdit { .. }, _) => true,
            (_, None) => true,
            (_, Some(field)) => {
                local_wins(remote, stamp, &local.origin, field.modified_at, &field.writer)
            }
        })
        .map(|(name, op)| (name.clone(), op.clone()))
        .collect();

    if surviving.is_empty() {
        debug!("Remote wins every field of {}", local.key);
        return finish(remote.clone(), version, None, Outcome::RemoteWon);
    }

    let mut entity = remote.clone();
    entity.apply_patch(&surviving, stamp, &local.origin);
    debug!(
        "Merged {} of {} local fields into {}",
        surviving.len(),
        local.field_patch.len(),
        local.key
    );
    let rebase = Rebase {
        op: MutationOp::Update,
        patch: surviving,
    };
    finish(entity, version, Some(rebase), Outcome::Merged)
}

fn resolve_against_delete(local: &Mutation, remote: &Entity, version: Version) -> Resolution {
    if local.op == MutationOp::Delete {
        return finish(remote.clone(), version, None, Outcome::RemoteWon);
    }
    let deleted_at = remote.last_modified();
    if local.created_at >= deleted_at {
        debug!("Update resurrects {} deleted at {}", local.key, deleted_at);
        let mut entity = remote.clone();
        entity.tombstone = false;
        entity.fields.clear();
        entity.apply_patch(&local.field_patch, local.created_at, &local.origin);
        let rebase = Rebase {
            op: local.op,
            patch: local.field_patch.clone(),
        };
        return finish(entity, version, Some(rebase), Outcome::Resurrected);
    }
    finish(remote.clone(), version, None, Outcome::RemoteWon)
}

/// Confirmed state after the remote store accepted `mutation` at
/// `remote_version`.
///
/// If the confirmed state already reflects that version (its delta came
/// through the change stream first) it is returned unchanged.
pub fn acknowledge(confirmed: Option<&Entity>, mutation: &Mutation, remote_version: Version) -> Entity {
    if let Some(c) = confirmed {
        if c.remote_version >= remote_version {
            return c.clone();
        }
    }
    let mut entity = mutation.overlay(confirmed, remote_version);
    entity.version = remote_version;
    entity.remote_version = remote_version;
    entity
}

/// Materialized state: confirmed state with open mutations overlaid in
/// id order. `None` when there is nothing to show.
pub fn apply_local(confirmed: Option<&Entity>, open: &[Mutation]) -> Option<Entity> {
    open.iter().fold(confirmed.cloned(), |state, m| {
        Some(m.overlay(state.as_ref(), m.created_at))
    })
}
