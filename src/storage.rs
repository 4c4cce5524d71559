//! # Durable Key-Value Storage
//!
//! ## Responsibility
//! The persistence collaborator behind connection profiles, request-shape
//! settings and the polling interval. A browser console keeps these in
//! `localStorage`; here the same flat string-to-string model is backed either
//! by memory or by a single SQLite table.
//!
//! ## Guarantees
//! - Thread-safe: every store is `Send + Sync`
//! - Typed helpers ([`load_json`], [`save_json`]) never propagate corruption:
//!   an unparseable value reads as absent and is logged
//!
//! ## NOT Responsible For
//! - Caching (every read goes to the backend)
//! - Schema migration of stored values

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::{ConnectError, Result};

// ---------------------------------------------------------------------------
// Storage keys
// ---------------------------------------------------------------------------

/// Map of profile name → connection profile.
pub const CONNECTIONS_KEY: &str = "jvmConnect";
/// Most-recently-used connection names.
pub const RECENT_CONNECTIONS_KEY: &str = "recentConnections";
/// Request-shape settings (`maxDepth`, `maxCollectionSize`, ...).
pub const REQUEST_PARAMS_KEY: &str = "jolokiaParams";
/// Polling interval in milliseconds.
pub const UPDATE_RATE_KEY: &str = "updateRate";

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Flat string key-value storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn remove(&self, key: &str) -> Result<()>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Process-local store, used when no storage file is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned(key: &str) -> ConnectError {
    ConnectError::Storage {
        key: key.to_string(),
        detail: "store mutex poisoned".to_string(),
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let entries = self.entries.lock().map_err(|_| poisoned(key))?;
        Ok(entries.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| poisoned(key))?;
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().map_err(|_| poisoned(key))?;
        entries.remove(key);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQLite backend
// ---------------------------------------------------------------------------

/// SQLite-backed store: one `kv` table, one row per key.
pub struct SqliteStore {
    conn: Mutex<rusqlite::Connection>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = rusqlite::Connection::open(path.as_ref())?;
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        let conn = rusqlite::Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: rusqlite::Connection) -> Result<Self> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)",
            [],
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn storage_err(key: &str, e: rusqlite::Error) -> ConnectError {
        ConnectError::Storage {
            key: key.to_string(),
            detail: e.to_string(),
        }
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

impl KeyValueStore for SqliteStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().map_err(|_| poisoned(key))?;
        let mut stmt = conn
            .prepare_cached("SELECT value FROM kv WHERE key = ?1")
            .map_err(|e| Self::storage_err(key, e))?;
        let mut rows = stmt.query([key]).map_err(|e| Self::storage_err(key, e))?;
        let value = match rows.next().map_err(|e| Self::storage_err(key, e))? {
            Some(row) => Some(
                row.get::<_, String>(0)
                    .map_err(|e| Self::storage_err(key, e))?,
            ),
            None => None,
        };
        Ok(value)
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| poisoned(key))?;
        conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [key, value],
        )
        .map_err(|e| Self::storage_err(key, e))?;
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        let conn = self.conn.lock().map_err(|_| poisoned(key))?;
        conn.execute("DELETE FROM kv WHERE key = ?1", [key])
            .map_err(|e| Self::storage_err(key, e))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Typed helpers
// ---------------------------------------------------------------------------

/// Read and parse the JSON value at `key`.
///
/// Returns `None` when the key is absent, the backend fails, or the value is
/// not valid JSON for `T`. Failures are logged, never returned.
pub fn load_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> Option<T> {
    let raw = match store.get(key) {
        Ok(Some(raw)) => raw,
        Ok(None) => return None,
        Err(e) => {
            warn!(key, error = %e, "storage read failed, treating as absent");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(key, error = %e, "stored value is corrupt, ignoring it");
            None
        }
    }
}

/// Serialize `value` as JSON under `key`. Failures are logged and reported as `false`.
pub fn save_json<T: Serialize + ?Sized>(store: &dyn KeyValueStore, key: &str, value: &T) -> bool {
    let raw = match serde_json::to_string(value) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(key, error = %e, "could not serialize value for storage");
            return false;
        }
    };
    match store.set(key, &raw) {
        Ok(()) => true,
        Err(e) => {
            warn!(key, error = %e, "storage write failed");
            false
        }
    }
}
