//! SQLite-backed storage areas.
//!
//! A single database file hosts every [`AreaKind`]; each area is a
//! partition keyed by an `area` column. [`SqliteStore`] owns the
//! connection, [`SqliteArea`] is the per-area handle implementing
//! [`StorageArea`].

use crate::error::{AegisError, Result};
use crate::storage::area::{entry_size, AreaKind, StorageArea};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Owner of the storage database connection.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the storage database at the given path.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let db_path = db_path.as_ref().to_path_buf();

        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| AegisError::io_with_path(e, parent))?;
        }

        let conn = Connection::open(&db_path).map_err(|e| AegisError::Storage {
            message: format!("Failed to open storage database: {}", e),
            source: Some(e),
        })?;

        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
            db_path,
        };
        store.init_schema()?;

        debug!("Storage database ready at {:?}", store.db_path);
        Ok(store)
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().map_err(|e| AegisError::Storage {
            message: format!("Failed to lock database: {}", e),
            source: None,
        })?;

        conn.execute_batch(
            r#"
            -- Performance settings
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;

            -- Key-value entries, partitioned by storage area
            CREATE TABLE IF NOT EXISTS kv_entries (
                area TEXT NOT NULL,
                key TEXT NOT NULL,
                value TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (area, key)
            );

            CREATE INDEX IF NOT EXISTS idx_kv_entries_area
                ON kv_entries(area);
            "#,
        )
        .map_err(|e| AegisError::Storage {
            message: format!("Failed to initialize schema: {}", e),
            source: Some(e),
        })?;

        Ok(())
    }

    /// Handle for one storage area, capacity-bounded at its default quota.
    pub fn area(&self, kind: AreaKind) -> SqliteArea {
        SqliteArea {
            conn: Arc::clone(&self.conn),
            kind,
            capacity: Some(kind.default_quota()),
        }
    }

    /// Path of the backing database file.
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}

/// One storage area backed by the shared database.
pub struct SqliteArea {
    conn: Arc<Mutex<Connection>>,
    kind: AreaKind,
    capacity: Option<u64>,
}

impl SqliteArea {
    /// Override the capacity bound (`None` disables enforcement).
    pub fn with_capacity(mut self, bytes: Option<u64>) -> Self {
        self.capacity = bytes;
        self
    }

    pub fn kind(&self) -> AreaKind {
        self.kind
    }

    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|e| AegisError::Storage {
            message: format!("Failed to lock database: {}", e),
            source: None,
        })
    }

    fn parse_value(key: &str, raw: String) -> Result<Value> {
        serde_json::from_str(&raw).map_err(|e| AegisError::Storage {
            message: format!("Corrupt entry for key {}: {}", key, e),
            source: None,
        })
    }

    fn total_size(&self, conn: &Connection) -> Result<u64> {
        let total: i64 = conn
            .query_row(
                "SELECT COALESCE(SUM(size_bytes), 0) FROM kv_entries WHERE area = ?1",
                params![self.kind.as_str()],
                |row| row.get(0),
            )
            .map_err(|e| AegisError::Storage {
                message: format!("Failed to read area usage: {}", e),
                source: Some(e),
            })?;
        Ok(total as u64)
    }

    fn stored_size(&self, conn: &Connection, key: &str) -> Result<Option<u64>> {
        let size: Option<i64> = conn
            .query_row(
                "SELECT size_bytes FROM kv_entries WHERE area = ?1 AND key = ?2",
                params![self.kind.as_str(), key],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| AegisError::Storage {
                message: format!("Failed to read entry size: {}", e),
                source: Some(e),
            })?;
        Ok(size.map(|s| s as u64))
    }
}

#[async_trait]
impl StorageArea for SqliteArea {
    async fn get(&self, keys: &[String]) -> Result<HashMap<String, Value>> {
        let conn = self.lock_conn()?;
        let mut out = HashMap::new();
        for key in keys {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT value FROM kv_entries WHERE area = ?1 AND key = ?2",
                    params![self.kind.as_str(), key],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| AegisError::Storage {
                    message: format!("Failed to read entry: {}", e),
                    source: Some(e),
                })?;
            if let Some(raw) = raw {
                out.insert(key.clone(), Self::parse_value(key, raw)?);
            }
        }
        Ok(out)
    }

    async fn get_all(&self) -> Result<HashMap<String, Value>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn
            .prepare("SELECT key, value FROM kv_entries WHERE area = ?1")
            .map_err(|e| AegisError::Storage {
                message: format!("Failed to prepare query: {}", e),
                source: Some(e),
            })?;

        let rows = stmt
            .query_map(params![self.kind.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| AegisError::Storage {
                message: format!("Failed to list entries: {}", e),
                source: Some(e),
            })?;

        let mut out = HashMap::new();
        for row in rows {
            let (key, raw) = row.map_err(|e| AegisError::Storage {
                message: format!("Failed to read row: {}", e),
                source: Some(e),
            })?;
            let value = Self::parse_value(&key, raw)?;
            out.insert(key, value);
        }
        Ok(out)
    }

    async fn set(&self, items: HashMap<String, Value>) -> Result<()> {
        let conn = self.lock_conn()?;

        if let Some(capacity) = self.capacity {
            let mut projected = self.total_size(&conn)?;
            for (key, value) in &items {
                if let Some(existing) = self.stored_size(&conn, key)? {
                    projected = projected.saturating_sub(existing);
                }
                projected += entry_size(key, value);
            }
            if projected > capacity {
                return Err(AegisError::QuotaExceeded {
                    size_bytes: projected,
                    limit_bytes: capacity,
                });
            }
        }

        let now = Utc::now().to_rfc3339();
        for (key, value) in items {
            let raw = serde_json::to_string(&value)?;
            let size = entry_size(&key, &value);
            conn.execute(
                r#"
                INSERT INTO kv_entries (area, key, value, size_bytes, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(area, key) DO UPDATE SET
                    value = ?3,
                    size_bytes = ?4,
                    updated_at = ?5
                "#,
                params![self.kind.as_str(), key, raw, size as i64, now],
            )
            .map_err(|e| AegisError::Storage {
                message: format!("Failed to write entry {}: {}", key, e),
                source: Some(e),
            })?;
        }
        Ok(())
    }

    async fn remove(&self, keys: &[String]) -> Result<()> {
        let conn = self.lock_conn()?;
        for key in keys {
            conn.execute(
                "DELETE FROM kv_entries WHERE area = ?1 AND key = ?2",
                params![self.kind.as_str(), key],
            )
            .map_err(|e| AegisError::Storage {
                message: format!("Failed to delete entry {}: {}", key, e),
                source: Some(e),
            })?;
        }
        Ok(())
    }

    async fn bytes_in_use(&self, keys: Option<&[String]>) -> Result<u64> {
        let conn = self.lock_conn()?;
        match keys {
            None => self.total_size(&conn),
            Some(keys) => {
                let mut total = 0u64;
                for key in keys {
                    if let Some(size) = self.stored_size(&conn, key)? {
                        total += size;
                    }
                }
                Ok(total)
            }
        }
    }
}
