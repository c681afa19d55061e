//! Durable, ordered log of local mutations awaiting remote confirmation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::sync::Arc;
use tracing::{debug, info, warn};

use tidesync_common::{
    EntityKey, Error, FieldPatch, Mutation, MutationDraft, MutationId, MutationOp, MutationState,
    ReplicaId, Result, Version,
};

use crate::db::{map_sqlite, Database};
use crate::local::{version_from_sql, version_to_sql};

/// Default number of open mutations the outbox accepts.
pub const DEFAULT_CAPACITY: usize = 10_000;

const COLUMNS: &str = "mutation_id, collection, entity_id, op, field_patch, base_version, \
                       created_at, submitted_at, origin, state, attempts, last_error, acked_version";

struct RawMutation {
    mutation_id: i64,
    collection: String,
    entity_id: String,
    op: String,
    field_patch: String,
    base_version: i64,
    created_at: i64,
    submitted_at: String,
    origin: String,
    state: String,
    attempts: i64,
    last_error: Option<String>,
    acked_version: Option<i64>,
}

impl RawMutation {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            mutation_id: row.get(0)?,
            collection: row.get(1)?,
            entity_id: row.get(2)?,
            op: row.get(3)?,
            field_patch: row.get(4)?,
            base_version: row.get(5)?,
            created_at: row.get(6)?,
            submitted_at: row.get(7)?,
            origin: row.get(8)?,
            state: row.get(9)?,
            attempts: row.get(10)?,
            last_error: row.get(11)?,
            acked_version: row.get(12)?,
        })
    }

    fn decode(self) -> Result<Mutation> {
        let corrupt = |what: &str, e: String| {
            Error::StorageCorrupt(format!("Mutation {}: bad {}: {}", self.mutation_id, what, e))
        };
        let field_patch: FieldPatch = serde_json::from_str(&self.field_patch)
            .map_err(|e| corrupt("field_patch", e.to_string()))?;
        let submitted_at = DateTime::parse_from_rfc3339(&self.submitted_at)
            .map_err(|e| corrupt("submitted_at", e.to_string()))?
            .with_timezone(&Utc);
        let op = MutationOp::parse(&self.op).map_err(|e| corrupt("op", e.to_string()))?;
        Ok(Mutation {
            mutation_id: MutationId::new(self.mutation_id as u64),
            key: EntityKey::parse(&self.collection, &self.entity_id)?,
            op,
            field_patch,
            base_version: version_from_sql(self.base_version),
            created_at: version_from_sql(self.created_at),
            submitted_at,
            origin: ReplicaId::new(self.origin.clone())?,
            state: MutationState::parse(&self.state)?,
            attempts: self.attempts.max(0) as u32,
            last_error: self.last_error.clone(),
            acked_version: self.acked_version.map(version_from_sql),
        })
    }
}

fn id_to_sql(id: MutationId) -> i64 {
    id.get() as i64
}

/// Where the surviving intent of a conflicted mutation goes.
#[derive(Debug, Clone, PartialEq)]
pub enum Carry {
    /// Rewrite a still-pending mutation of the same entity. Its base
    /// version is kept.
    Fold {
        into: MutationId,
        op: MutationOp,
        field_patch: FieldPatch,
    },
    /// Queue a new mutation.
    Enqueue(MutationDraft),
}

fn insert_draft(conn: &Connection, draft: &MutationDraft, capacity: usize) -> Result<MutationId> {
    let field_patch = serde_json::to_string(&draft.field_patch)?;
    let open: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM outbox WHERE state IN ('pending', 'sent')",
            [],
            |row| row.get(0),
        )
        .map_err(map_sqlite)?;
    if open as usize >= capacity {
        return Err(Error::StorageFull(format!(
            "Outbox holds {} open mutations (capacity {})",
            open, capacity
        )));
    }
    conn.execute(
        r#"
        INSERT INTO outbox
        (collection, entity_id, op, field_patch, base_version, created_at, submitted_at, origin, state)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending')
        "#,
        params![
            draft.key.collection.as_str(),
            draft.key.entity_id.as_str(),
            draft.op.as_str(),
            field_patch,
            version_to_sql(draft.base_version),
            version_to_sql(draft.created_at),
            draft.submitted_at.to_rfc3339(),
            draft.origin.as_str(),
        ],
    )
    .map_err(map_sqlite)?;
    Ok(MutationId::new(conn.last_insert_rowid() as u64))
}

/// Durable mutation queue.
///
/// Mutation ids come from SQLite's `AUTOINCREMENT`, so they grow
/// monotonically and are never reused, even after purges and restarts.
pub struct Outbox {
    db: Arc<Database>,
    capacity: usize,
}

impl Outbox {
    pub fn new(db: Arc<Database>) -> Self {
        Self::with_capacity(db, DEFAULT_CAPACITY)
    }

    pub fn with_capacity(db: Arc<Database>, capacity: usize) -> Self {
        Self { db, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a mutation durably and assign its id.
    ///
    /// # Errors
    /// - `StorageFull` if the configured capacity is reached or the disk is full
    /// - `StorageCorrupt` if the database is damaged
    pub fn enqueue(&self, draft: MutationDraft) -> Result<Mutation> {
        let capacity = self.capacity;
        let id = self.db.with_tx(|tx| insert_draft(tx, &draft, capacity))?;
        debug!("Enqueued {} {} for {}", id, draft.op, draft.key);
        Ok(Mutation::from_draft(id, draft))
    }

    /// Mark a mutation conflicted and hand its surviving intent on, in one
    /// transaction. Returns the mutation now carrying that intent.
    ///
    /// A conflicted row no longer counts against capacity, so a new row
    /// fits whenever the conflicted one was admitted.
    pub fn conflict(&self, id: MutationId, carry: Option<Carry>) -> Result<Option<MutationId>> {
        let capacity = self.capacity;
        let carried = self.db.with_tx(|tx| {
            let changed = tx
                .execute(
                    "UPDATE outbox SET state = 'conflicted' WHERE mutation_id = ?1",
                    [id_to_sql(id)],
                )
                .map_err(map_sqlite)?;
            if changed == 0 {
                return Err(Error::NotFound(format!("Mutation {}", id)));
            }
            match &carry {
                None => Ok(None),
                Some(Carry::Fold {
                    into,
                    op,
                    field_patch,
                }) => {
                    let raw = serde_json::to_string(field_patch)?;
                    let changed = tx
                        .execute(
                            "UPDATE outbox SET op = ?2, field_patch = ?3
                             WHERE mutation_id = ?1 AND state = 'pending'",
                            params![id_to_sql(*into), op.as_str(), raw],
                        )
                        .map_err(map_sqlite)?;
                    if changed == 0 {
                        return Err(Error::NotCancellable(*into));
                    }
                    Ok(Some(*into))
                }
                Some(Carry::Enqueue(draft)) => insert_draft(tx, draft, capacity).map(Some),
            }
        })?;
        debug!("{} conflicted, intent carried by {:?}", id, carried);
        Ok(carried)
    }

    pub fn get(&self, id: MutationId) -> Result<Option<Mutation>> {
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    &format!("SELECT {} FROM outbox WHERE mutation_id = ?1", COLUMNS),
                    [id_to_sql(id)],
                    RawMutation::from_row,
                )
                .optional()
            })?
            .map(RawMutation::decode)
            .transpose()
    }

    /// Pending mutations in id order, at most `max_n`.
    ///
    /// A mutation is held back while an earlier mutation for the same entity
    /// is in flight or awaiting resolution.
    pub fn peek_batch(&self, max_n: usize) -> Result<Vec<Mutation>> {
        self.select(
            r#"
            WHERE o.state = 'pending' AND NOT EXISTS (
                SELECT 1 FROM outbox e
                WHERE e.collection = o.collection AND e.entity_id = o.entity_id
                  AND e.mutation_id < o.mutation_id
                  AND e.state IN ('sent', 'acknowledged', 'conflicted')
            )
            ORDER BY o.mutation_id LIMIT ?1
            "#,
            params![max_n as i64],
        )
    }

    /// Set a mutation's state.
    pub fn mark(&self, id: MutationId, state: MutationState) -> Result<()> {
        self.update(
            id,
            "UPDATE outbox SET state = ?2 WHERE mutation_id = ?1",
            params![id_to_sql(id), state.as_str()],
        )
    }

    /// Move a mutation from pending to sent and count the attempt.
    ///
    /// Returns `false` if it was no longer pending (e.g. cancelled).
    pub fn mark_sent(&self, id: MutationId) -> Result<bool> {
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox SET state = 'sent', attempts = attempts + 1
                 WHERE mutation_id = ?1 AND state = 'pending'",
                [id_to_sql(id)],
            )
        })?;
        Ok(changed == 1)
    }

    /// Put a sent mutation back in the queue after a transient failure.
    pub fn mark_pending(&self, id: MutationId, reason: &str) -> Result<()> {
        self.update(
            id,
            "UPDATE outbox SET state = 'pending', last_error = ?2 WHERE mutation_id = ?1",
            params![id_to_sql(id), reason],
        )
    }

    /// Record the remote version assigned to a confirmed write.
    pub fn mark_acknowledged(&self, id: MutationId, remote_version: Version) -> Result<()> {
        self.update(
            id,
            "UPDATE outbox SET state = 'acknowledged', acked_version = ?2, last_error = NULL
             WHERE mutation_id = ?1",
            params![id_to_sql(id), version_to_sql(remote_version)],
        )
    }

    /// Record a terminal refusal.
    pub fn mark_failed(&self, id: MutationId, reason: &str) -> Result<()> {
        warn!("Mutation {} failed: {}", id, reason);
        self.update(
            id,
            "UPDATE outbox SET state = 'failed', last_error = ?2 WHERE mutation_id = ?1",
            params![id_to_sql(id), reason],
        )
    }

    /// Remove a mutation for good.
    pub fn purge(&self, id: MutationId) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM outbox WHERE mutation_id = ?1", [id_to_sql(id)])
        })?;
        debug!("Purged {}", id);
        Ok(())
    }

    /// Remove a mutation that has not been sent yet.
    ///
    /// # Errors
    /// - `NotFound` if there is no such mutation
    /// - `NotCancellable` once it has left the pending state
    pub fn cancel(&self, id: MutationId) -> Result<Mutation> {
        let mutation = self.db.with_tx(|tx| {
            let raw = tx
                .query_row(
                    &format!("SELECT {} FROM outbox WHERE mutation_id = ?1", COLUMNS),
                    [id_to_sql(id)],
                    RawMutation::from_row,
                )
                .optional()
                .map_err(map_sqlite)?;
            let mutation = raw
                .ok_or_else(|| Error::NotFound(format!("Mutation {}", id)))?
                .decode()?;
            if mutation.state != MutationState::Pending {
                return Err(Error::NotCancellable(id));
            }
            tx.execute("DELETE FROM outbox WHERE mutation_id = ?1", [id_to_sql(id)])
                .map_err(map_sqlite)?;
            Ok(mutation)
        })?;
        info!("Cancelled {} for {}", id, mutation.key);
        Ok(mutation)
    }

    /// Replace the content of a still-pending mutation.
    ///
    /// Used to fold a rebased local intent into the next queued mutation
    /// for the same entity.
    pub fn amend(
        &self,
        id: MutationId,
        op: MutationOp,
        field_patch: &FieldPatch,
        base_version: Version,
    ) -> Result<()> {
        let raw = serde_json::to_string(field_patch)?;
        let changed = self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE outbox SET op = ?2, field_patch = ?3, base_version = ?4
                 WHERE mutation_id = ?1 AND state = 'pending'",
                params![id_to_sql(id), op.as_str(), raw, version_to_sql(base_version)],
            )
        })?;
        if changed == 0 {
            return Err(Error::NotCancellable(id));
        }
        debug!("Amended {} onto base {}", id, base_version);
        Ok(())
    }

    /// Pending and sent mutations for one entity, in id order.
    pub fn open_for(&self, key: &EntityKey) -> Result<Vec<Mutation>> {
        self.select(
            "WHERE o.collection = ?1 AND o.entity_id = ?2 AND o.state IN ('pending', 'sent')
             ORDER BY o.mutation_id",
            params![key.collection.as_str(), key.entity_id.as_str()],
        )
    }

    pub fn has_open(&self, key: &EntityKey) -> Result<bool> {
        let count: i64 = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM outbox
                 WHERE collection = ?1 AND entity_id = ?2 AND state IN ('pending', 'sent')",
                params![key.collection.as_str(), key.entity_id.as_str()],
                |row| row.get(0),
            )
        })?;
        Ok(count > 0)
    }

    /// Crash recovery: a sent mutation whose outcome is unknown is sent
    /// again. The remote store deduplicates by `(origin, mutation_id)`.
    pub fn requeue_in_flight(&self) -> Result<usize> {
        let n = self.db.with_conn(|conn| {
            conn.execute("UPDATE outbox SET state = 'pending' WHERE state = 'sent'", [])
        })?;
        if n > 0 {
            info!("Requeued {} in-flight mutations", n);
        }
        Ok(n)
    }

    pub fn in_state(&self, state: MutationState) -> Result<Vec<Mutation>> {
        self.select(
            "WHERE o.state = ?1 ORDER BY o.mutation_id",
            params![state.as_str()],
        )
    }

    pub fn acknowledged(&self) -> Result<Vec<Mutation>> {
        self.in_state(MutationState::Acknowledged)
    }

    pub fn failed(&self) -> Result<Vec<Mutation>> {
        self.in_state(MutationState::Failed)
    }

    /// Every mutation in id order.
    pub fn all(&self) -> Result<Vec<Mutation>> {
        self.select("ORDER BY o.mutation_id", params![])
    }

    pub fn oldest_pending(&self) -> Result<Option<Mutation>> {
        Ok(self
            .select(
                "WHERE o.state IN ('pending', 'sent') ORDER BY o.mutation_id LIMIT 1",
                params![],
            )?
            .into_iter()
            .next())
    }

    /// Number of mutations of any state.
    pub fn len(&self) -> Result<usize> {
        let n: i64 = self
            .db
            .with_conn(|conn| conn.query_row("SELECT COUNT(*) FROM outbox", [], |row| row.get(0)))?;
        Ok(n as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    fn select(&self, clause: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<Mutation>> {
        let raws = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {} FROM outbox o {}", qualified(), clause))?;
            let rows = stmt.query_map(args, RawMutation::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        raws.into_iter().map(RawMutation::decode).collect()
    }

    fn update(&self, id: MutationId, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<()> {
        let changed = self.db.with_conn(|conn| conn.execute(sql, args))?;
        if changed == 0 {
            return Err(Error::NotFound(format!("Mutation {}", id)));
        }
        Ok(())
    }
}

fn qualified() -> String {
    COLUMNS
        .split(',')
        .map(|c| format!("o.{}", c.trim()))
        .collect::<Vec<_>>()
        .join(", ")
}
