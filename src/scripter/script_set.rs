//! The scripts of one service directory, with content fingerprints.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::ScriptError;

/// One script file as it was loaded.
#[derive(Debug, Clone)]
pub struct ScriptEntry {
    name: String,
    path: PathBuf,
    source: String,
    fingerprint: String,
}

impl ScriptEntry {
    /// File name, used as the chunk name in interpreter errors.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Script text.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// SHA-256 of the content at load time, lowercase hex.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// All scripts of a service, ordered by file name.
#[derive(Debug, Clone)]
pub struct ScriptSet {
    dir: PathBuf,
    entries: Vec<ScriptEntry>,
}

impl ScriptSet {
    /// Read every script file in `dir`.
    ///
    /// Sub-directories and dot-files are ignored. Fails if the directory or
    /// any script in it cannot be read.
    pub fn load(dir: &Path) -> Result<Self, ScriptError> {
        let mut entries = Vec::new();
        for path in script_paths(dir)? {
            let source = std::fs::read_to_string(&path).map_err(|source| ScriptError::ReadScript {
                path: path.clone(),
                source,
            })?;
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            entries.push(ScriptEntry {
                fingerprint: fingerprint(source.as_bytes()),
                name,
                path,
                source,
            });
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            entries,
        })
    }

    /// Directory the scripts came from.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loaded scripts in execution order.
    pub fn entries(&self) -> &[ScriptEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the directory no longer matches what was loaded.
    ///
    /// True when the set of file paths differs from the loaded one, or when
    /// a loaded script's content changed or it cannot be read any more.
    pub fn is_stale(&self) -> bool {
        let on_disk = match script_paths(&self.dir) {
            Ok(paths) => paths,
            Err(e) => {
                log::warn!("Cannot scan {}: {}", self.dir.display(), e);
                return true;
            }
        };

        if !on_disk.iter().eq(self.entries.iter().map(|e| &e.path)) {
            log::debug!("Script files in {} changed", self.dir.display());
            return true;
        }

        for entry in &self.entries {
            match std::fs::read(&entry.path) {
                Ok(content) if fingerprint(&content) == entry.fingerprint => {}
                Ok(_) => {
                    log::debug!("Script {} changed", entry.path.display());
                    return true;
                }
                Err(e) => {
                    log::debug!("Script {} unreadable: {}", entry.path.display(), e);
                    return true;
                }
            }
        }

        false
    }
}

/// SHA-256 of `content` as lowercase hex.
pub fn fingerprint(content: &[u8]) -> String {
    format!("{:x}", Sha256::digest(content))
}

fn script_paths(dir: &Path) -> Result<Vec<PathBuf>, ScriptError> {
    let read_dir = std::fs::read_dir(dir).map_err(|source| ScriptError::ReadDir {
        dir: dir.to_path_buf(),
        source,
    })?;

    let mut paths = Vec::new();
    for entry in read_dir {
        let entry = entry.map_err(|source| ScriptError::ReadDir {
            dir: dir.to_path_buf(),
            source,
        })?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        let is_file = entry.file_type().map(|t| t.is_file()).unwrap_or(false);
        if is_file {
            paths.push(entry.path());
        }
    }
    paths.sort();
    Ok(paths)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_load_orders_by_name() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "20-second.lua", "-- b");
        write(tmp.path(), "10-first.lua", "-- a");
        std::fs::create_dir(tmp.path().join("nested")).unwrap();
        write(tmp.path(), ".swap", "ignored");

        let set = ScriptSet::load(tmp.path()).unwrap();
        let names: Vec<_> = set.entries().iter().map(ScriptEntry::name).collect();
        assert_eq!(names, vec!["10-first.lua", "20-second.lua"]);
        assert_eq!(set.entries()[0].source(), "-- a");
    }

    #[test]
    fn test_missing_dir_fails() {
        let tmp = TempDir::new().unwrap();
        let err = ScriptSet::load(&tmp.path().join("nope")).unwrap_err();
        assert!(matches!(err, ScriptError::ReadDir { .. }));
    }

    #[test]
    fn test_rename_with_edit_is_stale() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.lua", "-- one");
        let set = ScriptSet::load(tmp.path()).unwrap();

        std::fs::rename(tmp.path().join("a.lua"), tmp.path().join("b.lua")).unwrap();
        assert!(set.is_stale());

        write(tmp.path(), "b.lua", "-- two");
        assert!(set.is_stale());
    }

    #[test]
    fn test_fresh_set_is_not_stale() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.lua", "x");
        let set = ScriptSet::load(tmp.path()).unwrap();
        assert!(!set.is_stale());
    }

    #[test]
    fn test_content_change_is_stale() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.lua", "x");
        let set = ScriptSet::load(tmp.path()).unwrap();

        write(tmp.path(), "a.lua", "y");
        assert!(set.is_stale());
    }

    #[test]
    fn test_added_and_removed_files_are_stale() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "a.lua", "x");
        let set = ScriptSet::load(tmp.path()).unwrap();

        write(tmp.path(), "b.lua", "y");
        assert!(set.is_stale());

        std::fs::remove_file(tmp.path().join("b.lua")).unwrap();
        std::fs::remove_file(tmp.path().join("a.lua")).unwrap();
        assert!(set.is_stale());
    }

    #[test]
    fn test_fingerprint_is_sha256_hex() {
        assert_eq!(
            fingerprint(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
