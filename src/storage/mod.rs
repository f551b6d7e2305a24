//! Namespaced key/value storage.
//!
//! The A/B store keeps its variant lists here. A [`StorageBackend`] hands
//! out one [`Storage`] view per namespace; every view maps string keys to
//! opaque byte blobs.
//!
//! Two backends ship with the crate:
//!
//! - [`SqliteBackend`] - durable, single-file `SQLite` database; the default
//! - [`MemoryBackend`] - process-local, for tests and explicit opt-in

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

/// Errors produced by storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience alias used by the storage modules.
pub type Result<T> = std::result::Result<T, StorageError>;

/// One namespace of a storage backend.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Read the blob stored under `key`, `None` if never written.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store `value` under `key`, replacing any previous blob.
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Replace the blob under `key` with `f(current)` as one atomic step.
    ///
    /// No other write to the namespace, from any view of the same backend,
    /// lands between the read and the write.
    fn update(&self, key: &str, f: &mut dyn FnMut(Option<Vec<u8>>) -> Vec<u8>) -> Result<()>;

    /// All keys written in this namespace, sorted.
    fn keys(&self) -> Result<Vec<String>>;
}

/// Source of namespaced [`Storage`] views.
pub trait StorageBackend: Send + Sync + std::fmt::Debug {
    /// Open (or create) the namespace called `name`.
    fn namespace(&self, name: &str) -> Result<Arc<dyn Storage>>;
}
