//! SQLite identity store with sqlite-vec cosine ranking.
//!
//! Descriptors live in the `identities` table as little-endian f32 BLOBs
//! next to their dimensionality. `vec_distance_cosine` ranks candidates in
//! SQL; the few rows within reach of the threshold are re-scored with the
//! core cosine matcher so the inclusive bound and id tie-break behave exactly
//! like the in-memory store.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use kinsight_core::store::new_record;
use kinsight_core::{CosineMatcher, Embedding, IdentityMatch, IdentityRecord, IdentityStore, Matcher, NewIdentity, StoreError};
use rusqlite::{params, Connection, OptionalExtension, Row};
use sqlite_vec::sqlite3_vec_init;
use std::path::Path;
use std::sync::{Mutex, Once};
use std::time::Duration;

const SCHEMA_VERSION: &str = "1";

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS identities (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL CHECK(length(trim(name)) > 0),
    relationship TEXT NOT NULL CHECK(length(trim(relationship)) > 0),
    color TEXT NOT NULL,
    descriptor BLOB NOT NULL,
    dim INTEGER NOT NULL CHECK(dim > 0),
    model_version TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_identities_dim ON identities(dim);
CREATE INDEX IF NOT EXISTS idx_identities_created ON identities(created_at);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

/// Rows this close below the threshold are still fetched, since SQL scoring
/// happens in f32.
const CANDIDATE_SLACK: f64 = 1e-4;
const CANDIDATE_LIMIT: i64 = 16;

const COLUMNS: &str = "id, name, relationship, color, descriptor, model_version, created_at, updated_at";

static SQLITE_VEC_INIT: Once = Once::new();

/// Register the sqlite-vec extension for every connection opened afterwards.
pub fn load_sqlite_vec() {
    SQLITE_VEC_INIT.call_once(|| unsafe {
        rusqlite::ffi::sqlite3_auto_extension(Some(std::mem::transmute(sqlite3_vec_init as *const ())));
    });
}

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and initialize the schema.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        load_sqlite_vec();
        let conn =
            Connection::open(path).with_context(|| format!("failed to open database at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.busy_timeout(Duration::from_secs(5))?;

        let store = Self::init(conn)?;
        tracing::info!(
            path = %path.display(),
            schema = store.schema_version().ok().flatten().as_deref().unwrap_or("?"),
            "identity database ready"
        );
        Ok(store)
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        load_sqlite_vec();
        let conn = Connection::open_in_memory().context("failed to open in-memory database")?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        let vec_version: String = conn
            .query_row("SELECT vec_version()", [], |row| row.get(0))
            .context("sqlite-vec extension not loaded")?;
        conn.execute_batch(SCHEMA_SQL).context("failed to initialize schema")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
            params![SCHEMA_VERSION],
        )?;
        tracing::debug!(sqlite_vec = %vec_version, "schema initialized");
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Unavailable("database connection lock poisoned".into()))
    }
}

fn db_err(e: rusqlite::Error) -> StoreError {
    tracing::error!(error = %e, "identity database error");
    StoreError::Unavailable(e.to_string())
}

pub fn encode_descriptor(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn decode_descriptor(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Raw columns of one `identities` row, before validation.
struct RawRow {
    id: String,
    name: String,
    relationship: String,
    color: String,
    descriptor: Vec<u8>,
    model_version: Option<String>,
    created_at: String,
    updated_at: String,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            relationship: row.get(2)?,
            color: row.get(3)?,
            descriptor: row.get(4)?,
            model_version: row.get(5)?,
            created_at: row.get(6)?,
            updated_at: row.get(7)?,
        })
    }

    fn into_record(self) -> Result<IdentityRecord, StoreError> {
        let corrupt = |id: &str, reason: &str| StoreError::Corrupt {
            id: id.to_string(),
            reason: reason.to_string(),
        };
        let values = decode_descriptor(&self.descriptor).ok_or_else(|| corrupt(&self.id, "malformed descriptor blob"))?;
        let created_at = parse_time(&self.created_at).ok_or_else(|| corrupt(&self.id, "bad created_at"))?;
        let updated_at = parse_time(&self.updated_at).ok_or_else(|| corrupt(&self.id, "bad updated_at"))?;
        Ok(IdentityRecord {
            id: self.id,
            name: self.name,
            relationship: self.relationship,
            color: self.color,
            descriptor: Embedding {
                values,
                model_version: self.model_version,
            },
            created_at,
            updated_at,
        })
    }
}

/// Fixed-width RFC 3339 so that text order is time order.
fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s).ok().map(|t| t.with_timezone(&Utc))
}

impl IdentityStore for SqliteStore {
    fn find_nearest(&self, descriptor: &[f32], threshold: f32) -> Result<Option<IdentityMatch>, StoreError> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {COLUMNS} FROM (
                SELECT *,
                    CASE WHEN dim = ?2 THEN 1.0 - vec_distance_cosine(descriptor, ?1) END AS similarity
                FROM identities WHERE dim = ?2
             )
             WHERE similarity >= ?3
             ORDER BY similarity DESC, id ASC
             LIMIT ?4"
        );
        let mut stmt = conn.prepare_cached(&sql).map_err(db_err)?;
        let rows = stmt
            .query_map(
                params![
                    encode_descriptor(descriptor),
                    descriptor.len() as i64,
                    threshold as f64 - CANDIDATE_SLACK,
                    CANDIDATE_LIMIT
                ],
                RawRow::from_row,
            )
            .map_err(db_err)?;

        let mut candidates = Vec::new();
        for row in rows {
            candidates.push(row.map_err(db_err)?.into_record()?);
        }
        Ok(CosineMatcher.nearest(descriptor, &candidates, threshold))
    }

    fn insert(&self, identity: NewIdentity) -> Result<IdentityRecord, StoreError> {
        let record = new_record(identity);
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO identities (id, name, relationship, color, descriptor, dim, model_version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                record.id,
                record.name,
                record.relationship,
                record.color,
                encode_descriptor(&record.descriptor.values),
                record.descriptor.dim() as i64,
                record.descriptor.model_version,
                timestamp(&record.created_at),
                timestamp(&record.updated_at),
            ],
        )
        .map_err(db_err)?;
        tracing::debug!(id = %record.id, name = %record.name, "identity inserted");
        Ok(record)
    }

    fn list(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare_cached(&format!("SELECT {COLUMNS} FROM identities ORDER BY created_at ASC, rowid ASC"))
            .map_err(db_err)?;
        let rows = stmt.query_map([], RawRow::from_row).map_err(db_err)?;
        let records: Result<Vec<_>, StoreError> = rows.map(|row| row.map_err(db_err)?.into_record()).collect();
        records
    }

    fn count(&self) -> Result<usize, StoreError> {
        let conn = self.conn()?;
        let n: i64 = conn
            .query_row("SELECT COUNT(*) FROM identities", [], |row| row.get(0))
            .map_err(db_err)?;
        Ok(n as usize)
    }
}

impl SqliteStore {
    pub fn schema_version(&self) -> Result<Option<String>, StoreError> {
        let conn = self.conn()?;
        conn.query_row("SELECT value FROM schema_meta WHERE key = 'schema_version'", [], |row| row.get(0))
            .optional()
            .map_err(db_err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::spike;
    use kinsight_core::{Registration, Resolution, Resolver, ResolverConfig};

    fn identity(name: &str, values: Vec<f32>) -> NewIdentity {
        NewIdentity {
            name: name.into(),
            relationship: "friend".into(),
            color: "orange".into(),
            descriptor: Embedding {
                values,
                model_version: Some("w600k_r50".into()),
            },
        }
    }

    #[test]
    fn test_descriptor_blob_encoding() {
        let values = vec![0.25f32, -1.5, 3.0];
        let blob = encode_descriptor(&values);
        assert_eq!(blob.len(), 12);
        assert_eq!(&blob[0..4], &0.25f32.to_le_bytes());
        assert_eq!(decode_descriptor(&blob).unwrap(), values);
        assert!(decode_descriptor(&blob[..5]).is_none());
        assert!(decode_descriptor(&[]).is_none());
    }

    #[test]
    fn test_schema_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("identities.db");
        let first = SqliteStore::open(&path).unwrap();
        first.insert(identity("Ana", spike(0))).unwrap();
        drop(first);

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.count().unwrap(), 1);
        assert_eq!(reopened.schema_version().unwrap().as_deref(), Some(SCHEMA_VERSION));
    }

    #[test]
    fn test_roundtrip_preserves_record() {
        let store = SqliteStore::open_in_memory().unwrap();
        let inserted = store.insert(identity("Ben", spike(3))).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed.len(), 1);
        let got = &listed[0];
        assert_eq!(got.id, inserted.id);
        assert_eq!(got.descriptor, inserted.descriptor);
        assert_eq!(got.created_at, inserted.created_at);
    }

    #[test]
    fn test_find_nearest_ranks_by_similarity() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(identity("Far", spike(0))).unwrap();
        let mut diagonal = spike(0);
        diagonal[1] = 1.0;
        let close = store.insert(identity("Close", diagonal)).unwrap();
        store.insert(identity("Other", spike(9))).unwrap();

        let mut probe = spike(0);
        probe[1] = 0.5;
        let found = store.find_nearest(&probe, 0.7).unwrap().unwrap();
        assert_eq!(found.record.id, close.id);
        assert!((found.similarity - 0.948_683_3).abs() < 1e-4);
    }

    #[test]
    fn test_find_nearest_respects_threshold_and_dim() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(identity("Ana", spike(0))).unwrap();
        assert!(store.find_nearest(&spike(1), 0.7).unwrap().is_none());
        assert!(store.find_nearest(&[1.0, 0.0], 0.0).unwrap().is_none());
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.insert(identity("Eve", spike(0))).unwrap();
        let mut probe = vec![0.0f32; 512];
        probe[0] = 7.0;
        probe[1] = 7.0;
        probe[2] = 1.0;
        probe[3] = 1.0;
        let found = store.find_nearest(&probe, 0.7).unwrap().unwrap();
        assert_eq!(found.record.name, "Eve");
    }

    #[test]
    fn test_ties_go_to_smallest_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut ids: Vec<String> = (0..3)
            .map(|i| store.insert(identity(&format!("twin-{i}"), spike(4))).unwrap().id)
            .collect();
        ids.sort();
        let found = store.find_nearest(&spike(4), 0.7).unwrap().unwrap();
        assert_eq!(found.record.id, ids[0]);
    }

    #[test]
    fn test_list_in_creation_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            store.insert(identity(name, spike(i))).unwrap();
        }
        let names: Vec<String> = store.list().unwrap().into_iter().map(|r| r.name).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_blank_name_rejected_by_schema() {
        let store = SqliteStore::open_in_memory().unwrap();
        let err = store.insert(identity("   ", spike(0))).unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert_eq!(store.count().unwrap(), 0);
    }

    #[test]
    fn test_resolver_scenario_on_sqlite() {
        let store = SqliteStore::open_in_memory().unwrap();
        let resolver = Resolver::new(ResolverConfig::default());

        let first = resolver
            .resolve(&store, &crate::testing::descriptor(0, 0.95), &Registration::new("Ana", "Daughter"))
            .unwrap();
        assert!(first.is_new_person());

        let second = resolver
            .resolve(&store, &crate::testing::descriptor(0, 0.91), &Registration::default())
            .unwrap();
        match second {
            Resolution::Matched { record, similarity, .. } => {
                assert_eq!(record.name, "Ana");
                assert!((similarity - 1.0).abs() < 1e-5);
            }
            other => panic!("expected a match, got {other:?}"),
        }
        assert_eq!(store.count().unwrap(), 1);
    }
}
