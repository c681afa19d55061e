//! Materialized local mirror of synchronized entities.
//!
//! Each row holds two states: the materialized entity that readers see and
//! a confirmed shadow holding the last state the remote store agreed on.
//! The materialized state is the confirmed state with every open local
//! mutation overlaid on top.
//!
//! All writes to a row go through an [`EntityGuard`], which serializes
//! writers per key with striped locks. Change notifications are emitted
//! while the guard is held so that each subscriber sees a row's changes in
//! version order.

use futures::Stream;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use tidesync_common::{
    CollectionName, Entity, EntityId, EntityKey, Error, Field, Result, Version,
};

use crate::db::{map_sqlite, Database};
use crate::predicate::Predicate;

const LOCK_STRIPES: usize = 64;
const META_ROW_SEQ: &str = "row_seq";

/// A row of the local store: materialized view plus confirmed shadow.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    /// What readers see. May be a tombstone.
    pub entity: Entity,
    /// Last remote-confirmed state, `None` if the entity only exists locally.
    pub confirmed: Option<Entity>,
}

/// How a change affects a subscriber's result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

/// A change notification for one entity.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    /// State after the change; for `Removed` this no longer matches.
    pub entity: Entity,
}

impl ChangeEvent {
    pub fn key(&self) -> &EntityKey {
        &self.entity.key
    }

    pub fn version(&self) -> Version {
        self.entity.version
    }
}

struct Subscriber {
    collection: CollectionName,
    predicate: Predicate,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

/// Stream of change events for one query.
///
/// Events for an entity never go back in version; duplicates of an
/// already-seen version are dropped. Entities that left the result set
/// are forgotten.
pub struct ChangeStream {
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
    seen: HashMap<EntityId, Version>,
}

impl ChangeStream {
    fn new(rx: mpsc::UnboundedReceiver<ChangeEvent>) -> Self {
        Self {
            rx,
            seen: HashMap::new(),
        }
    }

    /// Next event that is already buffered, without waiting.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        while let Ok(event) = self.rx.try_recv() {
            if self.admit(&event) {
                return Some(event);
            }
        }
        None
    }

    fn admit(&mut self, event: &ChangeEvent) -> bool {
        let id = &event.entity.key.entity_id;
        match self.seen.get(id) {
            Some(last) if *last >= event.version() => {
                trace!("Dropping duplicate change for {} at {}", id, event.version());
                false
            }
            _ if event.kind == ChangeKind::Removed || event.entity.tombstone => {
                // Row versions come from one store-wide sequence, so any
                // later event for this entity is newer than this one.
                self.seen.remove(id);
                true
            }
            _ => {
                self.seen.insert(id.clone(), event.version());
                true
            }
        }
    }
}

impl Stream for ChangeStream {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match self.rx.poll_recv(cx) {
                Poll::Ready(Some(event)) => {
                    if self.admit(&event) {
                        return Poll::Ready(Some(event));
                    }
                }
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

struct RawRow {
    entity_id: String,
    fields: String,
    version: i64,
    remote_version: i64,
    tombstone: bool,
    confirmed: Option<String>,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            entity_id: row.get(0)?,
            fields: row.get(1)?,
            version: row.get(2)?,
            remote_version: row.get(3)?,
            tombstone: row.get::<_, i32>(4)? != 0,
            confirmed: row.get(5)?,
        })
    }

    fn decode(self, collection: &CollectionName) -> Result<StoredRow> {
        let fields: BTreeMap<String, Field> = serde_json::from_str(&self.fields)
            .map_err(|e| Error::StorageCorrupt(format!("Bad fields for {}: {}", self.entity_id, e)))?;
        let confirmed = match self.confirmed {
            Some(raw) => Some(serde_json::from_str::<Entity>(&raw).map_err(|e| {
                Error::StorageCorrupt(format!("Bad confirmed state for {}: {}", self.entity_id, e))
            })?),
            None => None,
        };
        Ok(StoredRow {
            entity: Entity {
                key: EntityKey::new(collection.clone(), EntityId::new(self.entity_id)?),
                fields,
                version: version_from_sql(self.version),
                remote_version: version_from_sql(self.remote_version),
                tombstone: self.tombstone,
            },
            confirmed,
        })
    }
}

const ROW_COLUMNS: &str = "entity_id, fields, version, remote_version, tombstone, confirmed";

pub(crate) fn version_to_sql(v: Version) -> i64 {
    v.get() as i64
}

pub(crate) fn version_from_sql(v: i64) -> Version {
    Version::new(v.max(0) as u64)
}

fn read_row(conn: &Connection, key: &EntityKey) -> Result<Option<StoredRow>> {
    let raw = conn
        .query_row(
            &format!(
                "SELECT {} FROM entities WHERE collection = ?1 AND entity_id = ?2",
                ROW_COLUMNS
            ),
            params![key.collection.as_str(), key.entity_id.as_str()],
            RawRow::from_row,
        )
        .optional()
        .map_err(map_sqlite)?;
    raw.map(|r| r.decode(&key.collection)).transpose()
}

fn next_row_version(tx: &Transaction<'_>, floor: Version) -> Result<Version> {
    let seq: Option<String> = tx
        .query_row("SELECT value FROM meta WHERE key = ?1", [META_ROW_SEQ], |row| {
            row.get(0)
        })
        .optional()
        .map_err(map_sqlite)?;
    let seq = seq
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Version::new)
        .unwrap_or(Version::ZERO);
    let next = seq.max(floor).next();
    bump_row_seq(tx, next)?;
    Ok(next)
}

fn bump_row_seq(tx: &Transaction<'_>, at_least: Version) -> Result<()> {
    tx.execute(
        "INSERT INTO meta (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value
         WHERE CAST(meta.value AS INTEGER) < CAST(excluded.value AS INTEGER)",
        params![META_ROW_SEQ, at_least.get().to_string()],
    )
    .map_err(map_sqlite)?;
    Ok(())
}

fn write_materialized(tx: &Transaction<'_>, entity: &Entity) -> Result<()> {
    let fields = serde_json::to_string(&entity.fields)?;
    tx.execute(
        r#"
        INSERT INTO entities (collection, entity_id, fields, version, remote_version, tombstone, confirmed)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL)
        ON CONFLICT(collection, entity_id) DO UPDATE SET
            fields = excluded.fields,
            version = excluded.version,
            remote_version = excluded.remote_version,
            tombstone = excluded.tombstone
        "#,
        params![
            entity.key.collection.as_str(),
            entity.key.entity_id.as_str(),
            fields,
            version_to_sql(entity.version),
            version_to_sql(entity.remote_version),
            entity.tombstone as i32,
        ],
    )
    .map_err(map_sqlite)?;
    Ok(())
}

fn write_confirmed(tx: &Transaction<'_>, key: &EntityKey, confirmed: Option<&Entity>) -> Result<()> {
    let raw = confirmed.map(serde_json::to_string).transpose()?;
    tx.execute(
        "UPDATE entities SET confirmed = ?3 WHERE collection = ?1 AND entity_id = ?2",
        params![key.collection.as_str(), key.entity_id.as_str(), raw],
    )
    .map_err(map_sqlite)?;
    Ok(())
}

/// Same observable content, ignoring the materialization counter.
fn same_content(a: &Entity, b: &Entity) -> bool {
    a.fields == b.fields && a.tombstone == b.tombstone && a.remote_version == b.remote_version
}

/// Durable mirror of synchronized entities.
pub struct LocalStore {
    db: Arc<Database>,
    locks: Vec<Mutex<()>>,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl LocalStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            locks: (0..LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    /// Take the per-entity write lock.
    ///
    /// Keys share stripes, so a caller must hold at most one guard at a
    /// time and must not hold it across an `.await`.
    pub fn lock(&self, key: &EntityKey) -> Result<EntityGuard<'_>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let stripe = (hasher.finish() as usize) % self.locks.len();
        let lock = self.locks[stripe]
            .lock()
            .map_err(|_| Error::Storage("Entity lock poisoned".to_string()))?;
        Ok(EntityGuard {
            store: self,
            key: key.clone(),
            _lock: lock,
        })
    }

    /// Store an entity as given.
    ///
    /// # Errors
    /// - `StaleWrite` if `entity.version` is not newer than the stored row
    pub fn upsert(&self, entity: Entity) -> Result<Entity> {
        let guard = self.lock(&entity.key)?;
        let (before, after) = self.db.with_tx(|tx| {
            let before = read_row(tx, &entity.key)?;
            if let Some(row) = &before {
                if entity.version <= row.entity.version {
                    return Err(Error::StaleWrite {
                        key: entity.key.clone(),
                        stored: row.entity.version,
                        incoming: entity.version,
                    });
                }
            }
            write_materialized(tx, &entity)?;
            bump_row_seq(tx, entity.version)?;
            Ok((before.map(|r| r.entity), entity.clone()))
        })?;
        self.notify(before.as_ref(), &after);
        drop(guard);
        Ok(after)
    }

    /// Mark an entity deleted, keeping a tombstone row.
    ///
    /// Returns the tombstone, or `None` if there was no live row.
    pub fn tombstone(&self, key: &EntityKey) -> Result<Option<Entity>> {
        let guard = self.lock(key)?;
        match guard.current()? {
            Some(entity) if !entity.tombstone => {
                let mut dead = entity;
                dead.make_tombstone();
                guard.put(dead).map(Some)
            }
            _ => Ok(None),
        }
    }

    /// Live entity by key.
    pub fn get(&self, key: &EntityKey) -> Result<Option<Entity>> {
        Ok(self.get_row(key)?.map(|r| r.entity).filter(|e| !e.tombstone))
    }

    /// Full row including tombstone and confirmed shadow.
    pub fn get_row(&self, key: &EntityKey) -> Result<Option<StoredRow>> {
        self.db
            .with_conn(|conn| {
                conn.query_row(
                    &format!(
                        "SELECT {} FROM entities WHERE collection = ?1 AND entity_id = ?2",
                        ROW_COLUMNS
                    ),
                    params![key.collection.as_str(), key.entity_id.as_str()],
                    RawRow::from_row,
                )
                .optional()
            })?
            .map(|raw| raw.decode(&key.collection))
            .transpose()
    }

    /// Live entities of a collection matching a predicate.
    ///
    /// The result is read in a single statement and reflects one point in
    /// time.
    pub fn query(&self, collection: &CollectionName, predicate: &Predicate) -> Result<Vec<Entity>> {
        Ok(self
            .rows(collection, false)?
            .into_iter()
            .map(|r| r.entity)
            .filter(|e| predicate.matches(e))
            .collect())
    }

    /// Every row of a collection, optionally including tombstones.
    pub fn rows(&self, collection: &CollectionName, with_tombstones: bool) -> Result<Vec<StoredRow>> {
        let raws = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM entities WHERE collection = ?1 AND (?2 OR tombstone = 0) ORDER BY entity_id",
                ROW_COLUMNS
            ))?;
            let rows = stmt.query_map(params![collection.as_str(), with_tombstones], RawRow::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        raws.into_iter().map(|r| r.decode(collection)).collect()
    }

    /// Subscribe to a query.
    ///
    /// The stream starts with every current match as `Added`, then reports
    /// changes relative to the predicate.
    pub fn subscribe(&self, collection: &CollectionName, predicate: Predicate) -> Result<ChangeStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers()?;
        for entity in self.query(collection, &predicate)? {
            let _ = tx.send(ChangeEvent {
                kind: ChangeKind::Added,
                entity,
            });
        }
        subscribers.push(Subscriber {
            collection: collection.clone(),
            predicate,
            tx,
        });
        debug!("Subscriber added for {} ({} total)", collection, subscribers.len());
        Ok(ChangeStream::new(rx))
    }

    /// Drop tombstones the change stream can no longer contradict.
    ///
    /// A tombstone goes once the collection watermark has passed its remote
    /// version and no open mutation refers to it.
    pub fn compact_tombstones(&self, collection: &CollectionName, watermark: Version) -> Result<usize> {
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                r#"
                DELETE FROM entities
                WHERE collection = ?1 AND tombstone = 1 AND remote_version <= ?2
                  AND NOT EXISTS (
                    SELECT 1 FROM outbox o
                    WHERE o.collection = entities.collection
                      AND o.entity_id = entities.entity_id
                      AND o.state IN ('pending', 'sent')
                  )
                "#,
                params![collection.as_str(), version_to_sql(watermark)],
            )
        })?;
        if removed > 0 {
            debug!("Compacted {} tombstones in {} up to {}", removed, collection, watermark);
        }
        Ok(removed)
    }

    fn subscribers(&self) -> Result<MutexGuard<'_, Vec<Subscriber>>> {
        self.subscribers
            .lock()
            .map_err(|_| Error::Storage("Subscriber list poisoned".to_string()))
    }

    fn notify(&self, before: Option<&Entity>, after: &Entity) {
        let mut subscribers = match self.subscribers() {
            Ok(s) => s,
            Err(e) => {
                warn!("Skipping change notification: {}", e);
                return;
            }
        };
        subscribers.retain(|sub| {
            if sub.collection != after.key.collection {
                return !sub.tx.is_closed();
            }
            let was = before.map(|b| sub.predicate.matches(b)).unwrap_or(false);
            let is = sub.predicate.matches(after);
            let kind = match (was, is) {
                (false, true) => ChangeKind::Added,
                (true, true) => ChangeKind::Modified,
                (true, false) => ChangeKind::Removed,
                (false, false) => return !sub.tx.is_closed(),
            };
            sub.tx
                .send(ChangeEvent {
                    kind,
                    entity: after.clone(),
                })
                .is_ok()
        });
    }
}

/// Exclusive write access to one entity row.
pub struct EntityGuard<'a> {
    store: &'a LocalStore,
    key: EntityKey,
    _lock: MutexGuard<'a, ()>,
}

impl<'a> EntityGuard<'a> {
    pub fn key(&self) -> &EntityKey {
        &self.key
    }

    pub fn row(&self) -> Result<Option<StoredRow>> {
        self.store.get_row(&self.key)
    }

    /// Materialized state, including tombstones.
    pub fn current(&self) -> Result<Option<Entity>> {
        Ok(self.row()?.map(|r| r.entity))
    }

    /// Last remote-confirmed state.
    pub fn confirmed(&self) -> Result<Option<Entity>> {
        Ok(self.row()?.and_then(|r| r.confirmed))
    }

    /// Write the materialized state, keeping the confirmed shadow.
    ///
    /// The row gets a fresh version unless its content is unchanged.
    pub fn put(&self, entity: Entity) -> Result<Entity> {
        self.write(entity, None)
    }

    /// Write both the materialized state and the confirmed shadow.
    pub fn put_with_confirmed(&self, entity: Entity, confirmed: Option<&Entity>) -> Result<Entity> {
        self.write(entity, Some(confirmed))
    }

    /// Record a new confirmed state without touching what readers see.
    pub fn park(&self, confirmed: &Entity) -> Result<()> {
        self.store.db.with_tx(|tx| {
            if read_row(tx, &self.key)?.is_none() {
                return Err(Error::NotFound(format!("No local row for {}", self.key)));
            }
            write_confirmed(tx, &self.key, Some(confirmed))
        })?;
        trace!("Parked remote {} for {}", confirmed.remote_version, self.key);
        Ok(())
    }

    /// Delete the row entirely. Used when nothing remains to show.
    pub fn remove(&self) -> Result<()> {
        let before = self.store.db.with_tx(|tx| {
            let before = read_row(tx, &self.key)?;
            tx.execute(
                "DELETE FROM entities WHERE collection = ?1 AND entity_id = ?2",
                params![self.key.collection.as_str(), self.key.entity_id.as_str()],
            )
            .map_err(map_sqlite)?;
            let floor = before
                .as_ref()
                .map(|r| r.entity.version)
                .unwrap_or(Version::ZERO);
            let version = next_row_version(tx, floor)?;
            Ok(before.map(|r| (r.entity, version)))
        })?;
        if let Some((entity, version)) = before {
            if !entity.tombstone {
                let mut gone = entity.clone();
                gone.make_tombstone();
                gone.version = version;
                self.store.notify(Some(&entity), &gone);
            }
        }
        Ok(())
    }

    fn write(&self, mut entity: Entity, confirmed: Option<Option<&Entity>>) -> Result<Entity> {
        if entity.key != self.key {
            return Err(Error::InvalidInput(format!(
                "Guard for {} cannot write {}",
                self.key, entity.key
            )));
        }
        let outcome = self.store.db.with_tx(|tx| {
            let before = read_row(tx, &self.key)?;
            if let Some(row) = &before {
                if same_content(&row.entity, &entity) {
                    if let Some(confirmed) = confirmed {
                        write_confirmed(tx, &self.key, confirmed)?;
                    }
                    return Ok((None, row.entity.clone()));
                }
            }
            let floor = before
                .as_ref()
                .map(|r| r.entity.version)
                .unwrap_or(Version::ZERO);
            entity.version = next_row_version(tx, floor)?;
            write_materialized(tx, &entity)?;
            if let Some(confirmed) = confirmed {
                write_confirmed(tx, &self.key, confirmed)?;
            }
            Ok((Some(before.map(|r| r.entity)), entity.clone()))
        })?;
        match outcome {
            (Some(before), after) => {
                trace!("Stored {} at {}", self.key, after.version);
                self.store.notify(before.as_ref(), &after);
                Ok(after)
            }
            (None, unchanged) => Ok(unchanged),
        }
    }
}
