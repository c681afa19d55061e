//! Persisted change-stream positions.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use std::sync::Arc;
use tracing::{debug, info};

use tidesync_common::{CollectionName, Error, ResumeToken, Result, SyncCursor};

use crate::db::Database;
use crate::local::{version_from_sql, version_to_sql};

/// Per-collection sync cursors.
pub struct CursorStore {
    db: Arc<Database>,
}

impl CursorStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Load a collection's cursor, or a fresh one if none was saved.
    pub fn load(&self, collection: &CollectionName) -> Result<SyncCursor> {
        let row = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT token, watermark, updated_at FROM cursors WHERE collection = ?1",
                [collection.as_str()],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                },
            )
            .optional()
        })?;
        match row {
            Some((token, watermark, updated_at)) => Ok(SyncCursor {
                collection: collection.clone(),
                token: token.map(ResumeToken::new),
                watermark: version_from_sql(watermark),
                updated_at: DateTime::parse_from_rfc3339(&updated_at)
                    .map_err(|e| Error::StorageCorrupt(format!("Bad cursor timestamp: {}", e)))?
                    .with_timezone(&Utc),
            }),
            None => Ok(SyncCursor::new(collection.clone())),
        }
    }

    /// Persist a cursor. The stored watermark never moves back.
    pub fn save(&self, cursor: &SyncCursor) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT INTO cursors (collection, token, watermark, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(collection) DO UPDATE SET
                    token = excluded.token,
                    watermark = MAX(cursors.watermark, excluded.watermark),
                    updated_at = excluded.updated_at
                "#,
                params![
                    cursor.collection.as_str(),
                    cursor.token.as_ref().map(|t| t.as_str().to_string()),
                    version_to_sql(cursor.watermark),
                    cursor.updated_at.to_rfc3339(),
                ],
            )
        })?;
        debug!(
            "Saved cursor for {} at {}",
            cursor.collection, cursor.watermark
        );
        Ok(())
    }

    /// Forget a collection's resume token, keeping its watermark.
    ///
    /// Used when the remote store can no longer resume from the token and
    /// the collection is about to be rebuilt from a full snapshot. The
    /// watermark stays: every delta at or below it is already folded into
    /// the local rows, and the snapshot's own watermark is never lower
    /// since remote versions only grow. Dropping it would let tombstones
    /// the snapshot has not yet vouched for look compactable again.
    pub fn discard_token(&self, collection: &CollectionName) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE cursors SET token = NULL WHERE collection = ?1",
                [collection.as_str()],
            )
        })?;
        info!("Discarded resume token for {}", collection);
        Ok(())
    }

    /// Every saved cursor, ordered by collection.
    pub fn all(&self) -> Result<Vec<SyncCursor>> {
        let names = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT collection FROM cursors ORDER BY collection")?;
            let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })?;
        names
            .into_iter()
            .map(|name| self.load(&CollectionName::new(name)?))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidesync_common::Version;

    fn players() -> CollectionName {
        CollectionName::new("players").unwrap()
    }

    #[test]
    fn test_missing_cursor_is_fresh() {
        let cursors = CursorStore::new(Arc::new(Database::in_memory().unwrap()));
        let cursor = cursors.load(&players()).unwrap();
        assert!(cursor.token.is_none());
        assert_eq!(cursor.watermark, Version::ZERO);
    }

    #[test]
    fn test_save_is_monotonic() {
        let cursors = CursorStore::new(Arc::new(Database::in_memory().unwrap()));
        let mut cursor = SyncCursor::new(players());
        cursor.advance(ResumeToken::new("9"), Version::new(9));
        cursors.save(&cursor).unwrap();

        let mut older = SyncCursor::new(players());
        older.advance(ResumeToken::new("4"), Version::new(4));
        cursors.save(&older).unwrap();

        let loaded = cursors.load(&players()).unwrap();
        assert_eq!(loaded.watermark, Version::new(9));
    }

    #[test]
    fn test_discard_token_keeps_watermark() {
        let cursors = CursorStore::new(Arc::new(Database::in_memory().unwrap()));
        let mut cursor = SyncCursor::new(players());
        cursor.advance(ResumeToken::new("3"), Version::new(3));
        cursors.save(&cursor).unwrap();

        cursors.discard_token(&players()).unwrap();
        let mut loaded = cursors.load(&players()).unwrap();
        assert!(loaded.token.is_none());
        assert_eq!(loaded.watermark, Version::new(3));
        assert_eq!(cursors.all().unwrap().len(), 1);

        // The snapshot that follows picks up from the kept watermark.
        loaded.advance(ResumeToken::new("snap-7"), Version::new(7));
        cursors.save(&loaded).unwrap();
        let resumed = cursors.load(&players()).unwrap();
        assert_eq!(resumed.token, Some(ResumeToken::new("snap-7")));
        assert_eq!(resumed.watermark, Version::new(7));
    }
}
