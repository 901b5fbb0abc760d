//! SQLite-backed relation store.
//!
//! Rows live in `related_items`, keyed by `(reference_id, related_id)` with
//! secondary indexes on `score` and `related_id`. Replacing a reference's
//! rows is a single transaction, so readers never observe a partial set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use super::{RelationStore, StoreSummary};
use crate::error::StoreError;
use crate::model::{unix_now, CacheState, ItemId, ScoredRelation, EMPTY_MARKER};

const FINGERPRINT_KEY: &str = "config_fingerprint";

/// SQLite relation store. The connection is serialized behind a mutex.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path. `":memory:"` gives a
    /// private in-memory database.
    pub fn open_or_create(path: &str) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| {
            StoreError::Backend(format!("Failed to open relation store at '{path}': {e}"))
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )
        .map_err(|e| StoreError::Backend(format!("Failed to set PRAGMA: {e}")))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS related_items (
                reference_id  INTEGER NOT NULL,
                related_id    INTEGER NOT NULL,
                score         REAL NOT NULL,
                computed_at   INTEGER NOT NULL,
                PRIMARY KEY (reference_id, related_id)
            );
            CREATE INDEX IF NOT EXISTS idx_related_score
                ON related_items(score);
            CREATE INDEX IF NOT EXISTS idx_related_related_id
                ON related_items(related_id);
            CREATE TABLE IF NOT EXISTS cache_meta (
                key    TEXT PRIMARY KEY,
                value  INTEGER NOT NULL
            );",
        )
        .map_err(|e| StoreError::Backend(format!("Failed to create relation schema: {e}")))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        Self::open_or_create(":memory:")
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }
}

fn relation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScoredRelation> {
    Ok(ScoredRelation {
        reference_id: row.get::<_, i64>(0)? as ItemId,
        related_id: row.get::<_, i64>(1)? as ItemId,
        score: row.get(2)?,
        computed_at: row.get::<_, i64>(3)? as u64,
    })
}

impl RelationStore for SqliteStore {
    fn replace(&self, reference: ItemId, relations: &[ScoredRelation]) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM related_items WHERE reference_id = ?1",
            params![reference as i64],
        )?;

        let real: Vec<&ScoredRelation> = relations
            .iter()
            .filter(|r| r.related_id != EMPTY_MARKER)
            .collect();
        {
            let mut insert = tx.prepare(
                "INSERT OR REPLACE INTO related_items (reference_id, related_id, score, computed_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            if real.is_empty() {
                insert.execute(params![
                    reference as i64,
                    EMPTY_MARKER as i64,
                    0.0f64,
                    unix_now() as i64
                ])?;
            }
            for rel in real {
                insert.execute(params![
                    reference as i64,
                    rel.related_id as i64,
                    rel.score,
                    rel.computed_at as i64
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn ensure_marker(&self, reference: ItemId) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO related_items (reference_id, related_id, score, computed_at)
             SELECT ?1, ?2, 0.0, ?3
             WHERE NOT EXISTS (SELECT 1 FROM related_items WHERE reference_id = ?1)",
            params![reference as i64, EMPTY_MARKER as i64, unix_now() as i64],
        )?;
        Ok(())
    }

    fn state(&self, reference: ItemId) -> Result<CacheState, StoreError> {
        let conn = self.conn()?;
        let (rows, real): (i64, i64) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(CASE WHEN related_id != ?2 THEN 1 ELSE 0 END), 0)
             FROM related_items WHERE reference_id = ?1",
            params![reference as i64, EMPTY_MARKER as i64],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(match (rows, real) {
            (0, _) => CacheState::Absent,
            (_, 0) => CacheState::Empty,
            (_, n) => CacheState::Populated(n as usize),
        })
    }

    fn relations(&self, reference: ItemId) -> Result<Vec<ScoredRelation>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT reference_id, related_id, score, computed_at
             FROM related_items
             WHERE reference_id = ?1 AND related_id != ?2
             ORDER BY score DESC, related_id DESC",
        )?;
        let rows = stmt.query_map(
            params![reference as i64, EMPTY_MARKER as i64],
            relation_from_row,
        )?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn related(
        &self,
        reference: ItemId,
        threshold: f64,
        limit: usize,
    ) -> Result<Vec<ScoredRelation>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT reference_id, related_id, score, computed_at
             FROM related_items
             WHERE reference_id = ?1 AND related_id != ?2 AND score >= ?3
             ORDER BY score DESC, related_id DESC
             LIMIT ?4",
        )?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = stmt.query_map(
            params![reference as i64, EMPTY_MARKER as i64, threshold, limit],
            relation_from_row,
        )?;
        let mut result = Vec::new();
        for row in rows {
            result.push(row?);
        }
        Ok(result)
    }

    fn score(&self, reference: ItemId, related: ItemId) -> Result<Option<f64>, StoreError> {
        if related == EMPTY_MARKER {
            return Ok(None);
        }
        let conn = self.conn()?;
        let score = conn
            .query_row(
                "SELECT score FROM related_items WHERE reference_id = ?1 AND related_id = ?2",
                params![reference as i64, related as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(score)
    }

    fn referencing(&self, related: ItemId) -> Result<BTreeMap<ItemId, f64>, StoreError> {
        if related == EMPTY_MARKER {
            return Ok(BTreeMap::new());
        }
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT reference_id, score FROM related_items WHERE related_id = ?1",
        )?;
        let rows = stmt.query_map(params![related as i64], |row| {
            Ok((row.get::<_, i64>(0)? as ItemId, row.get::<_, f64>(1)?))
        })?;
        let mut result = BTreeMap::new();
        for row in rows {
            let (reference, score) = row?;
            result.insert(reference, score);
        }
        Ok(result)
    }

    fn remove(&self, ids: &BTreeSet<ItemId>) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut removed = 0;
        {
            let mut delete = tx.prepare(
                "DELETE FROM related_items WHERE reference_id = ?1 OR related_id = ?1",
            )?;
            for &id in ids.iter().filter(|&&id| id != EMPTY_MARKER) {
                removed += delete.execute(params![id as i64])?;
            }
        }
        tx.commit()?;
        Ok(removed)
    }

    fn truncate(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        Ok(conn.execute("DELETE FROM related_items", [])?)
    }

    fn summary(&self) -> Result<StoreSummary, StoreError> {
        let conn = self.conn()?;
        let (cached, relations, score_sum): (i64, i64, f64) = conn.query_row(
            "SELECT COUNT(DISTINCT reference_id),
                    COALESCE(SUM(CASE WHEN related_id != ?1 THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN related_id != ?1 THEN score ELSE 0.0 END), 0.0)
             FROM related_items",
            params![EMPTY_MARKER as i64],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(StoreSummary {
            cached_items: cached as usize,
            total_relations: relations as usize,
            score_sum,
        })
    }

    fn config_fingerprint(&self) -> Result<Option<u64>, StoreError> {
        let conn = self.conn()?;
        let value: Option<i64> = conn
            .query_row(
                "SELECT value FROM cache_meta WHERE key = ?1",
                params![FINGERPRINT_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(|v| v as u64))
    }

    fn set_config_fingerprint(&self, fingerprint: u64) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO cache_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![FINGERPRINT_KEY, fingerprint as i64],
        )?;
        Ok(())
    }
}
