// src/storage/mod.rs

//! Installed-state persistence
//!
//! The runtime survives restarts by recording, per bundle, its location,
//! current generation number, manifest, and start settings. On startup the
//! embedder replays [`BundleStore::load_all`] through fresh installs.
//! Resolution wiring is deliberately not persisted; it is recomputed.

use crate::bundle::BundleId;
use crate::error::Result;
use crate::manifest::BundleManifest;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use std::path::Path;
use tracing::debug;

/// One persisted bundle record
#[derive(Debug, Clone)]
pub struct StoredBundle {
    pub id: BundleId,
    pub location: String,
    /// Generation counter at the time of the last save
    pub generation: u32,
    pub manifest: BundleManifest,
    pub autostart: bool,
    pub start_level: u32,
    pub installed_at: DateTime<Utc>,
}

/// Persistence seam for the runtime
///
/// Implementations must tolerate repeated saves of the same bundle id; a
/// save after update overwrites the previous record.
pub trait BundleStore: Send + Sync {
    fn save_bundle(&self, record: &StoredBundle) -> Result<()>;

    fn delete_bundle(&self, id: BundleId) -> Result<()>;

    fn set_autostart(&self, id: BundleId, autostart: bool) -> Result<()>;

    fn set_start_level(&self, id: BundleId, level: u32) -> Result<()>;

    /// Every persisted record, ordered by bundle id
    fn load_all(&self) -> Result<Vec<StoredBundle>>;
}

/// SQLite-backed store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Volatile store for tests and throwaway embeddings
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS bundles (
                id           INTEGER PRIMARY KEY,
                location     TEXT NOT NULL,
                generation   INTEGER NOT NULL,
                manifest     TEXT NOT NULL,
                autostart    INTEGER NOT NULL DEFAULT 0,
                start_level  INTEGER NOT NULL DEFAULT 1,
                installed_at TEXT NOT NULL
            );",
        )?;
        Ok(())
    }
}

impl BundleStore for SqliteStore {
    fn save_bundle(&self, record: &StoredBundle) -> Result<()> {
        let manifest = serde_json::to_string(&record.manifest)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO bundles (id, location, generation, manifest, autostart, start_level, installed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                location = excluded.location,
                generation = excluded.generation,
                manifest = excluded.manifest",
            params![
                record.id.0 as i64,
                record.location,
                record.generation,
                manifest,
                record.autostart,
                record.start_level,
                record.installed_at.to_rfc3339(),
            ],
        )?;
        debug!(bundle = %record.id, generation = record.generation, "bundle persisted");
        Ok(())
    }

    fn delete_bundle(&self, id: BundleId) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute("DELETE FROM bundles WHERE id = ?1", params![id.0 as i64])?;
        Ok(())
    }

    fn set_autostart(&self, id: BundleId, autostart: bool) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE bundles SET autostart = ?2 WHERE id = ?1",
            params![id.0 as i64, autostart],
        )?;
        Ok(())
    }

    fn set_start_level(&self, id: BundleId, level: u32) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE bundles SET start_level = ?2 WHERE id = ?1",
            params![id.0 as i64, level],
        )?;
        Ok(())
    }

    fn load_all(&self) -> Result<Vec<StoredBundle>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, location, generation, manifest, autostart, start_level, installed_at
             FROM bundles ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, u32>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, location, generation, manifest, autostart, start_level, installed_at) = row?;
            let manifest: BundleManifest = serde_json::from_str(&manifest)?;
            let installed_at = DateTime::parse_from_rfc3339(&installed_at)
                .map(|t| t.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now());
            records.push(StoredBundle {
                id: BundleId(id as u64),
                location,
                generation,
                manifest,
                autostart,
                start_level,
                installed_at,
            });
        }
        Ok(records)
    }
}
