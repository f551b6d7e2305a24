//! In-memory storage backend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{Result, Storage, StorageBackend};

type Namespaces = Arc<Mutex<HashMap<String, HashMap<String, Vec<u8>>>>>;

/// Process-local backend. Namespaces opened from the same backend share data.
#[derive(Debug, Default, Clone)]
pub struct MemoryBackend {
    data: Namespaces,
}

impl MemoryBackend {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageBackend for MemoryBackend {
    fn namespace(&self, name: &str) -> Result<Arc<dyn Storage>> {
        lock(&self.data)
            .entry(name.to_string())
            .or_default();

        Ok(Arc::new(MemoryStorage {
            namespace: name.to_string(),
            data: Arc::clone(&self.data),
        }))
    }
}

// Every write is a single map operation, so a panicked holder leaves the
// data consistent.
fn lock(data: &Namespaces) -> MutexGuard<'_, HashMap<String, HashMap<String, Vec<u8>>>> {
    data.lock().unwrap_or_else(PoisonError::into_inner)
}

/// View of a single namespace inside a [`MemoryBackend`].
#[derive(Debug)]
struct MemoryStorage {
    namespace: String,
    data: Namespaces,
}

impl Storage for MemoryStorage {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let data = lock(&self.data);
        Ok(data
            .get(&self.namespace)
            .and_then(|ns| ns.get(key))
            .cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        lock(&self.data)
            .entry(self.namespace.clone())
            .or_default()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn update(&self, key: &str, f: &mut dyn FnMut(Option<Vec<u8>>) -> Vec<u8>) -> Result<()> {
        let mut data = lock(&self.data);
        let namespace = data.entry(self.namespace.clone()).or_default();
        let next = f(namespace.get(key).cloned());
        namespace.insert(key.to_string(), next);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        let data = lock(&self.data);
        let mut keys: Vec<String> = data
            .get(&self.namespace)
            .map(|ns| ns.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        Ok(keys)
    }
}
