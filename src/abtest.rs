//! A/B response variants.
//!
//! Scripts use the store to vary what the honeypot says: every key maps to
//! an append-only list of candidate responses and a read picks one of them,
//! either pinned by index (so a session stays consistent) or at random.
//!
//! # Storage layout
//!
//! ```text
//! namespace  "abtester_<name>"
//! key        "<group>_<key>"      (or "<key>" for ungrouped variants)
//! value      "first;;;second;;;third"
//! ```
//!
//! # Bulk import
//!
//! [`AbTester::load_from_file`] reads a JSON document shaped
//! `{ "group": { "key": ["variant", ...] } }` and appends every value.
//! [`AbTester::load_from_file_once`] does the same but records the file's
//! content hash in the namespace and skips a file it has seen before, so a
//! startup import does not grow the lists on every restart.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::storage::{Storage, StorageBackend, StorageError};

/// Separator between variants in a stored blob.
pub const VARIANT_DELIMITER: &str = ";;;";

/// Prefix for storage namespaces owned by the A/B store.
pub const NAMESPACE_PREFIX: &str = "abtester_";

/// Key prefix marking an imported file, followed by its SHA-256.
pub const IMPORT_MARKER_PREFIX: &str = "__import_";

/// Errors returned by [`AbTester`].
#[derive(Debug, thiserror::Error)]
pub enum AbTestError {
    /// The key has no variants.
    #[error("no variant found for '{0}'")]
    NoVariant(String),

    /// The value cannot be stored as a variant.
    #[error("invalid variant for '{key}': {reason}")]
    InvalidVariant {
        /// Key the value was meant for.
        key: String,
        /// Why it was rejected.
        reason: &'static str,
    },

    /// The import file could not be read.
    #[error("failed to read import file: {0}")]
    Io(#[from] std::io::Error),

    /// The import file is not valid JSON.
    #[error("invalid import file: {0}")]
    Parse(#[from] serde_json::Error),

    /// The import file is valid JSON but not `{group: {key: [string]}}`.
    #[error("unexpected import structure at {path}: {reason}")]
    Structure {
        /// Dotted location of the offending value.
        path: String,
        /// What was expected there.
        reason: &'static str,
    },

    /// The storage backend failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Keyed, append-only variant registry on top of a [`Storage`] namespace.
#[derive(Debug)]
pub struct AbTester {
    storage: Arc<dyn Storage>,
}

impl AbTester {
    /// Open the A/B namespace `abtester_<name>` on `backend`.
    pub fn namespace(backend: &dyn StorageBackend, name: &str) -> Result<Self, AbTestError> {
        let storage = backend.namespace(&format!("{NAMESPACE_PREFIX}{name}"))?;
        Ok(Self::with_storage(storage))
    }

    /// Wrap an already opened storage namespace.
    #[must_use]
    pub fn with_storage(storage: Arc<dyn Storage>) -> Self {
        Self { storage }
    }

    /// Pick a variant for `key`.
    ///
    /// `Some(index)` inside the list returns exactly that variant. `None`
    /// or an out-of-range index picks uniformly over the whole list.
    pub fn get(&self, key: &str, index: Option<usize>) -> Result<String, AbTestError> {
        let variants = self.variants(key)?;
        select(key, variants, index)
    }

    /// [`get`](Self::get) for a variant list segmented by `group`.
    pub fn get_for_group(
        &self,
        group: &str,
        key: &str,
        index: Option<usize>,
    ) -> Result<String, AbTestError> {
        self.get(&group_key(group, key), index)
    }

    /// Append `value` to the variant list of `key`. The first write creates
    /// the list.
    ///
    /// The append is one atomic storage update, so concurrent writers on the
    /// same backend never lose each other's variants.
    pub fn set(&self, key: &str, value: &str) -> Result<(), AbTestError> {
        validate(key, value)?;

        let mut count = 0;
        self.storage.update(key, &mut |current| {
            let mut variants = decode(&current.unwrap_or_default());
            variants.push(value.to_string());
            count = variants.len();
            encode(&variants).into_bytes()
        })?;

        log::debug!("Appended A/B variant #{} for '{}'", count - 1, key);
        Ok(())
    }

    /// [`set`](Self::set) for a variant list segmented by `group`.
    pub fn set_for_group(&self, group: &str, key: &str, value: &str) -> Result<(), AbTestError> {
        self.set(&group_key(group, key), value)
    }

    /// All variants stored under `key`, in append order.
    pub fn variants(&self, key: &str) -> Result<Vec<String>, AbTestError> {
        let data = self.storage.get(key)?.unwrap_or_default();
        Ok(decode(&data))
    }

    /// Import `{ group: { key: [variant, ...] } }` from a JSON file.
    ///
    /// Every well-formed value is appended before any structural problem is
    /// reported, so a partially malformed file still applies what it can.
    /// Returns the number of variants appended.
    pub fn load_from_file(&self, path: &Path) -> Result<usize, AbTestError> {
        let content = std::fs::read_to_string(path)?;
        let added = self.load_from_str(&content)?;
        log::info!("Imported {} A/B variant(s) from {}", added, path.display());
        Ok(added)
    }

    /// [`load_from_file`](Self::load_from_file) unless this exact content
    /// was imported into the namespace before.
    ///
    /// Returns `None` for a file already imported. A file that is not valid
    /// JSON applies nothing and is not recorded, so a fixed version imports
    /// normally.
    pub fn load_from_file_once(&self, path: &Path) -> Result<Option<usize>, AbTestError> {
        let content = std::fs::read_to_string(path)?;
        let marker = format!("{IMPORT_MARKER_PREFIX}{:x}", Sha256::digest(content.as_bytes()));
        if self.storage.get(&marker)?.is_some() {
            log::info!("A/B file {} already imported, skipping", path.display());
            return Ok(None);
        }

        let result = self.load_from_str(&content);
        if !matches!(result, Err(AbTestError::Parse(_))) {
            self.storage.set(&marker, path.to_string_lossy().as_bytes())?;
        }
        let added = result?;
        log::info!("Imported {} A/B variant(s) from {}", added, path.display());
        Ok(Some(added))
    }

    /// Same as [`load_from_file`](Self::load_from_file) for in-memory JSON.
    pub fn load_from_str(&self, content: &str) -> Result<usize, AbTestError> {
        let document: serde_json::Value = serde_json::from_str(content)?;

        let mut first_error: Option<AbTestError> = None;
        let mut record = |err: AbTestError| {
            log::warn!("Skipping A/B import entry: {}", err);
            first_error.get_or_insert(err);
        };

        let Some(groups) = document.as_object() else {
            return Err(AbTestError::Structure {
                path: "$".to_string(),
                reason: "expected an object of groups",
            });
        };

        // BTreeMap keeps the import order stable across runs.
        let groups: BTreeMap<_, _> = groups.iter().collect();
        let mut added = 0;

        for (group_name, group) in groups {
            let Some(keys) = group.as_object() else {
                record(AbTestError::Structure {
                    path: group_name.clone(),
                    reason: "expected an object of keys",
                });
                continue;
            };

            for (key, values) in keys {
                let Some(values) = values.as_array() else {
                    record(AbTestError::Structure {
                        path: format!("{group_name}.{key}"),
                        reason: "expected an array of strings",
                    });
                    continue;
                };

                for (i, value) in values.iter().enumerate() {
                    let Some(value) = value.as_str() else {
                        record(AbTestError::Structure {
                            path: format!("{group_name}.{key}[{i}]"),
                            reason: "expected a string",
                        });
                        continue;
                    };

                    match self.set_for_group(group_name, key, value) {
                        Ok(()) => added += 1,
                        Err(e) => record(e),
                    }
                }
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(added),
        }
    }
}

/// Storage key for a grouped variant list.
#[must_use]
pub fn group_key(group: &str, key: &str) -> String {
    format!("{group}_{key}")
}

fn validate(key: &str, value: &str) -> Result<(), AbTestError> {
    if value.is_empty() {
        return Err(AbTestError::InvalidVariant {
            key: key.to_string(),
            reason: "empty value",
        });
    }
    if value.contains(VARIANT_DELIMITER) {
        return Err(AbTestError::InvalidVariant {
            key: key.to_string(),
            reason: "value contains the ';;;' delimiter",
        });
    }
    // A leading or trailing ';' would merge with the delimiter when joined.
    if value.starts_with(';') || value.ends_with(';') {
        return Err(AbTestError::InvalidVariant {
            key: key.to_string(),
            reason: "value starts or ends with ';'",
        });
    }
    Ok(())
}

fn select(key: &str, mut variants: Vec<String>, index: Option<usize>) -> Result<String, AbTestError> {
    if variants.is_empty() {
        return Err(AbTestError::NoVariant(key.to_string()));
    }

    let pick = match index {
        Some(i) if i < variants.len() => i,
        _ => rand::rng().random_range(0..variants.len()),
    };

    Ok(variants.swap_remove(pick))
}

fn decode(data: &[u8]) -> Vec<String> {
    if data.is_empty() {
        return Vec::new();
    }
    String::from_utf8_lossy(data)
        .split(VARIANT_DELIMITER)
        .map(str::to_string)
        .collect()
}

fn encode(variants: &[String]) -> String {
    variants.join(VARIANT_DELIMITER)
}
