//! SQLite persistence for named record collections.
//!
//! Each collection (`files.shares`, `files.favorites`, ...) is a single JSON
//! value under a key. Mutators take a per-key async lock for the whole
//! read-modify-write, so two writers on the same collection never lose an
//! update while writers on different collections never contend.

use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Collection key for local share records.
pub const SHARES_KEY: &str = "files.shares";
/// Collection key for mounted network share records.
pub const NETWORK_SHARES_KEY: &str = "files.networkShares";
/// Collection key for favorited virtual paths.
pub const FAVORITES_KEY: &str = "files.favorites";
/// Key for the shared secret used by every local share.
pub const SHARED_SECRET_KEY: &str = "files.sharedSecret";

/// Persistence error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt value for {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot encode value for {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS collections (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at INTEGER DEFAULT (unixepoch())
);
"#;

/// Keyed JSON collections with scoped read-modify-write transactions.
pub struct CollectionStore {
    conn: Mutex<Connection>,
    locks: DashMap<String, Arc<AsyncMutex<()>>>,
}

impl std::fmt::Debug for CollectionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectionStore")
            .field("locks", &self.locks.len())
            .finish_non_exhaustive()
    }
}

impl CollectionStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::with_connection(conn)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> StoreResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            locks: DashMap::new(),
        })
    }

    /// Read a collection without locking. Missing keys read as `T::default()`.
    pub fn get<T: DeserializeOwned + Default>(&self, key: &str) -> StoreResult<T> {
        self.load(key)
    }

    /// Acquire the exclusive lock for `key`.
    ///
    /// The returned guard is the only handle that can write the collection;
    /// the lock is released when it drops.
    pub async fn lock(self: &Arc<Self>, key: &str) -> CollectionGuard {
        let mutex = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let held = mutex.lock_owned().await;
        CollectionGuard {
            store: Arc::clone(self),
            key: key.to_string(),
            _held: held,
        }
    }

    fn load<T: DeserializeOwned + Default>(&self, key: &str) -> StoreResult<T> {
        let raw: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM collections WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;

        match raw {
            Some(json) => serde_json::from_str(&json).map_err(|source| StoreError::Decode {
                key: key.to_string(),
                source,
            }),
            None => Ok(T::default()),
        }
    }

    fn save<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> StoreResult<()> {
        let json = serde_json::to_string(value).map_err(|source| StoreError::Encode {
            key: key.to_string(),
            source,
        })?;
        self.conn.lock().execute(
            "INSERT INTO collections (key, value, updated_at) VALUES (?1, ?2, unixepoch())
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, json],
        )?;
        Ok(())
    }
}

/// Exclusive handle on one collection.
pub struct CollectionGuard {
    store: Arc<CollectionStore>,
    key: String,
    _held: OwnedMutexGuard<()>,
}

impl CollectionGuard {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Read the current value under the lock.
    pub fn read<T: DeserializeOwned + Default>(&self) -> StoreResult<T> {
        self.store.load(&self.key)
    }

    /// Replace the value under the lock.
    pub fn write<T: Serialize + ?Sized>(&self, value: &T) -> StoreResult<()> {
        self.store.save(&self.key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn store() -> Arc<CollectionStore> {
        Arc::new(CollectionStore::in_memory().unwrap())
    }

    #[tokio::test]
    async fn test_missing_key_is_default() {
        let store = store();
        let v: Vec<String> = store.get(FAVORITES_KEY).unwrap();
        assert!(v.is_empty());
        let s: Option<String> = store.get(SHARED_SECRET_KEY).unwrap();
        assert!(s.is_none());
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let store = store();
        {
            let guard = store.lock(FAVORITES_KEY).await;
            guard.write(&vec!["/Home/a".to_string()]).unwrap();
            let v: Vec<String> = guard.read().unwrap();
            assert_eq!(v, vec!["/Home/a"]);
        }
        let v: Vec<String> = store.get(FAVORITES_KEY).unwrap();
        assert_eq!(v, vec!["/Home/a"]);
    }

    #[tokio::test]
    async fn test_persists_across_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("hearth.db");
        {
            let store = Arc::new(CollectionStore::open(&path).unwrap());
            store.lock(SHARED_SECRET_KEY).await.write(&Some("abc")).unwrap();
        }
        let store = CollectionStore::open(&path).unwrap();
        let s: Option<String> = store.get(SHARED_SECRET_KEY).unwrap();
        assert_eq!(s.as_deref(), Some("abc"));
    }

    #[tokio::test]
    async fn test_corrupt_value_is_an_error() {
        let store = store();
        store.lock(FAVORITES_KEY).await.write("not a list").unwrap();
        let result: StoreResult<Vec<String>> = store.get(FAVORITES_KEY);
        assert!(matches!(result, Err(StoreError::Decode { .. })));
    }

    #[tokio::test]
    async fn test_lock_serializes_writers() {
        let store = store();
        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                let guard = store.lock(FAVORITES_KEY).await;
                let mut v: Vec<String> = guard.read().unwrap();
                tokio::time::sleep(Duration::from_millis(1)).await;
                v.push(format!("/Home/{i}"));
                guard.write(&v).unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }
        let v: Vec<String> = store.get(FAVORITES_KEY).unwrap();
        assert_eq!(v.len(), 16);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_contend() {
        let store = store();
        let _shares = store.lock(SHARES_KEY).await;
        let favorites = tokio::time::timeout(Duration::from_millis(100), store.lock(FAVORITES_KEY)).await;
        assert!(favorites.is_ok());
    }
}
