//! `SQLite`-backed implementation of [`StorageBackend`].
//!
//! All namespaces share one `Mutex<Connection>` and a single table keyed by
//! `(namespace, key)`.

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};

use super::{Result, Storage, StorageBackend};

/// Idempotent DDL for the blob table.
const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS kv_store (
    namespace TEXT NOT NULL,
    key TEXT NOT NULL,
    value BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (namespace, key)
);
";

/// `SQLite` storage.
///
/// Create with [`SqliteBackend::open`] for file-backed persistence or
/// [`SqliteBackend::in_memory`] for tests.
#[derive(Debug, Clone)]
pub struct SqliteBackend {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteBackend {
    /// Open or create a database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Io`](super::StorageError::Io) if the directory can't be created,
    /// or [`StorageError::Sqlite`](super::StorageError::Sqlite) if the database can't be opened.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(CREATE_TABLES)?;
        log::debug!("Opened storage database {}", path.display());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory database.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_TABLES)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }
}

impl StorageBackend for SqliteBackend {
    fn namespace(&self, name: &str) -> Result<Arc<dyn Storage>> {
        Ok(Arc::new(SqliteStorage {
            namespace: name.to_string(),
            conn: Arc::clone(&self.conn),
        }))
    }
}

#[derive(Debug)]
struct SqliteStorage {
    namespace: String,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStorage {
    fn lock_conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Storage for SqliteStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.lock_conn();
        let value = conn
            .query_row(
                "SELECT value FROM kv_store WHERE namespace = ?1 AND key = ?2",
                rusqlite::params![self.namespace, key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let conn = self.lock_conn();
        conn.execute(
            "INSERT INTO kv_store (namespace, key, value) VALUES (?1, ?2, ?3) \
             ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value, \
             updated_at = datetime('now')",
            rusqlite::params![self.namespace, key, value],
        )?;
        Ok(())
    }

    fn update(&self, key: &str, f: &mut dyn FnMut(Option<Vec<u8>>) -> Vec<u8>) -> Result<()> {
        let mut conn = self.lock_conn();
        // IMMEDIATE: writers in other processes wait until commit.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current = tx
            .query_row(
                "SELECT value FROM kv_store WHERE namespace = ?1 AND key = ?2",
                rusqlite::params![self.namespace, key],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .optional()?;
        let next = f(current);
        tx.execute(
            "INSERT INTO kv_store (namespace, key, value) VALUES (?1, ?2, ?3) \
             ON CONFLICT(namespace, key) DO UPDATE SET value = excluded.value, \
             updated_at = datetime('now')",
            rusqlite::params![self.namespace, key, next],
        )?;
        tx.commit()?;
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let conn = self.lock_conn();
        let mut stmt =
            conn.prepare("SELECT key FROM kv_store WHERE namespace = ?1 ORDER BY key")?;
        let rows = stmt.query_map([&self.namespace], |row| row.get::<_, String>(0))?;
        let mut keys = Vec::new();
        for key in rows {
            keys.push(key?);
        }
        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_then_get() {
        let backend = SqliteBackend::in_memory().unwrap();
        let ns = backend.namespace("abtester_lua").unwrap();

        ns.set("greeting", b"hello;;;hi").unwrap();
        assert_eq!(ns.get("greeting").unwrap().as_deref(), Some(&b"hello;;;hi"[..]));
    }

    #[test]
    fn test_set_overwrites() {
        let backend = SqliteBackend::in_memory().unwrap();
        let ns = backend.namespace("ns").unwrap();

        ns.set("k", b"one").unwrap();
        ns.set("k", b"two").unwrap();
        assert_eq!(ns.get("k").unwrap().as_deref(), Some(&b"two"[..]));
        assert_eq!(ns.keys().unwrap(), vec!["k".to_string()]);
    }

    #[test]
    fn test_update_is_read_modify_write() {
        let backend = SqliteBackend::in_memory().unwrap();
        let ns = backend.namespace("ns").unwrap();
        ns.set("k", b"a").unwrap();

        ns.update("k", &mut |old| [old.unwrap_or_default(), b"b".to_vec()].concat())
            .unwrap();
        ns.update("fresh", &mut |old| {
            assert!(old.is_none());
            b"new".to_vec()
        })
        .unwrap();

        assert_eq!(ns.get("k").unwrap().as_deref(), Some(&b"ab"[..]));
        assert_eq!(ns.get("fresh").unwrap().as_deref(), Some(&b"new"[..]));
    }

    #[test]
    fn test_namespaces_are_isolated() {
        let backend = SqliteBackend::in_memory().unwrap();
        backend.namespace("a").unwrap().set("k", b"v").unwrap();
        assert!(backend.namespace("b").unwrap().get("k").unwrap().is_none());
    }

    #[test]
    fn test_persists_across_reopen() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("store.db");

        {
            let backend = SqliteBackend::open(&path).unwrap();
            backend.namespace("ns").unwrap().set("k", b"kept").unwrap();
        }

        let backend = SqliteBackend::open(&path).unwrap();
        assert_eq!(
            backend.namespace("ns").unwrap().get("k").unwrap().as_deref(),
            Some(&b"kept"[..])
        );
    }
}
