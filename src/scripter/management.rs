//! Remote script management.
//!
//! Requests are JSON objects tagged by `action`:
//!
//! ```json
//! {"action": "script_put", "path": "lua/generic/10-echo.lua", "file": "function handle(m) return m end"}
//! {"action": "script_delete", "path": "lua/generic/10-echo.lua"}
//! {"action": "script_read", "dir": "lua/generic"}
//! {"action": "script_reload"}
//! ```
//!
//! Paths are relative to the script root and may not leave it. A successful
//! put or delete reloads every scripter. `script_read` answers with
//! `{"type": "scripts", "data": [{"path": ..., "content": <base64>}]}`.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use base64::Engine;
use serde::{Deserialize, Serialize};

use super::{reload_all, Scripter};

/// A management command.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ManagementRequest {
    /// Reload every service of every scripter.
    ScriptReload,
    /// Create or replace a script file.
    ScriptPut {
        /// Path relative to the script root.
        path: String,
        /// New file content.
        file: String,
    },
    /// Remove a script file.
    ScriptDelete {
        /// Path relative to the script root.
        path: String,
    },
    /// Read every file below a directory.
    ScriptRead {
        /// Directory relative to the script root; empty for the root.
        #[serde(default)]
        dir: String,
    },
}

/// Reply to a management command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ManagementResponse {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: serde_json::Value,
}

impl ManagementResponse {
    fn ok() -> Self {
        Self {
            kind: "ok".to_string(),
            data: serde_json::Value::Null,
        }
    }

    /// Failure reply carrying `message`.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            data: serde_json::Value::String(message.into()),
        }
    }
}

/// One file returned by `script_read`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScriptFile {
    /// Path relative to the script root, `/`-separated.
    pub path: String,
    /// Base64 of the file content.
    pub content: String,
}

/// Applies management commands to the script root.
#[derive(Debug)]
pub struct ScriptManager {
    root: PathBuf,
    scripters: Vec<Arc<dyn Scripter>>,
}

impl ScriptManager {
    pub fn new(root: impl Into<PathBuf>, scripters: Vec<Arc<dyn Scripter>>) -> Self {
        Self {
            root: root.into(),
            scripters,
        }
    }

    /// Decode one JSON request and apply it.
    pub fn handle_message(&self, message: &[u8]) -> Result<ManagementResponse> {
        let request: ManagementRequest =
            serde_json::from_slice(message).context("invalid management request")?;
        self.handle(request)
    }

    /// Apply `request`. Blocks on file I/O and script reloads.
    pub fn handle(&self, request: ManagementRequest) -> Result<ManagementResponse> {
        match request {
            ManagementRequest::ScriptReload => {
                reload_all(&self.scripters);
                Ok(ManagementResponse::ok())
            }
            ManagementRequest::ScriptPut { path, file } => {
                let target = self.resolve(&path)?;
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                std::fs::write(&target, file).with_context(|| format!("writing {path}"))?;
                log::info!("Stored script {}", path);
                reload_all(&self.scripters);
                Ok(ManagementResponse::ok())
            }
            ManagementRequest::ScriptDelete { path } => {
                let target = self.resolve(&path)?;
                std::fs::remove_file(&target).with_context(|| format!("deleting {path}"))?;
                log::info!("Deleted script {}", path);
                reload_all(&self.scripters);
                Ok(ManagementResponse::ok())
            }
            ManagementRequest::ScriptRead { dir } => {
                let files = self.read_files(&dir)?;
                Ok(ManagementResponse {
                    kind: "scripts".to_string(),
                    data: serde_json::to_value(files)?,
                })
            }
        }
    }

    /// Join `relative` onto the root, refusing anything that escapes it.
    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        let path = Path::new(relative);
        let mut resolved = self.root.clone();
        for component in path.components() {
            match component {
                Component::Normal(part) => resolved.push(part),
                Component::CurDir => {}
                _ => bail!("path '{}' is outside the script root", relative),
            }
        }
        Ok(resolved)
    }

    fn read_files(&self, dir: &str) -> Result<Vec<ScriptFile>> {
        let start = self.resolve(dir)?;
        let mut files = Vec::new();
        let mut pending = vec![start];

        while let Some(current) = pending.pop() {
            let entries = std::fs::read_dir(&current)
                .with_context(|| format!("reading {}", current.display()))?;
            for entry in entries {
                let path = entry?.path();
                if path.is_dir() {
                    pending.push(path);
                    continue;
                }
                let content = std::fs::read(&path)
                    .with_context(|| format!("reading {}", path.display()))?;
                files.push(ScriptFile {
                    path: self.display_path(&path),
                    content: base64::engine::general_purpose::STANDARD.encode(content),
                });
            }
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    fn display_path(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.root).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripter::{LuaScripter, ScriptResponse, ScriptPeer};
    use tempfile::TempDir;

    fn manager() -> (TempDir, Arc<LuaScripter>, ScriptManager) {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path().join("lua").join("generic");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("10-echo.lua"), "function handle(m) return m end").unwrap();

        let scripter = Arc::new(LuaScripter::new("lua", tmp.path()));
        scripter.init("generic").unwrap();
        let manager = ScriptManager::new(tmp.path(), vec![Arc::clone(&scripter) as Arc<dyn Scripter>]);
        (tmp, scripter, manager)
    }

    #[test]
    fn test_parse_requests() {
        let req: ManagementRequest = serde_json::from_str(r#"{"action":"script_read"}"#).unwrap();
        assert_eq!(req, ManagementRequest::ScriptRead { dir: String::new() });

        let req: ManagementRequest =
            serde_json::from_str(r#"{"action":"script_delete","path":"lua/x.lua"}"#).unwrap();
        assert_eq!(req, ManagementRequest::ScriptDelete { path: "lua/x.lua".into() });

        assert!(serde_json::from_str::<ManagementRequest>(r#"{"action":"format_disk"}"#).is_err());
    }

    #[test]
    fn test_put_reloads_scripts() {
        let (_tmp, scripter, manager) = manager();
        let peer = ScriptPeer {
            remote: "1.2.3.4:1".parse().unwrap(),
            local: "127.0.0.1:2".parse().unwrap(),
        };
        let conn = scripter.get_connection("generic", peer);

        let reply = manager
            .handle_message(
                br#"{"action":"script_put","path":"lua/generic/10-echo.lua","file":"function handle(m) return 'v2' end"}"#,
            )
            .unwrap();
        assert_eq!(reply.kind, "ok");
        assert_eq!(conn.handle("x").unwrap(), ScriptResponse::Text("v2".into()));
    }

    #[test]
    fn test_read_returns_base64() {
        let (_tmp, _scripter, manager) = manager();
        let reply = manager
            .handle(ManagementRequest::ScriptRead { dir: "lua".into() })
            .unwrap();

        assert_eq!(reply.kind, "scripts");
        let files = reply.data.as_array().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0]["path"], "lua/generic/10-echo.lua");
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(files[0]["content"].as_str().unwrap())
            .unwrap();
        assert_eq!(decoded, b"function handle(m) return m end");
    }

    #[test]
    fn test_delete_removes_file() {
        let (tmp, _scripter, manager) = manager();
        manager
            .handle(ManagementRequest::ScriptDelete {
                path: "lua/generic/10-echo.lua".into(),
            })
            .unwrap();
        assert!(!tmp.path().join("lua/generic/10-echo.lua").exists());
    }

    #[test]
    fn test_rejects_escaping_paths() {
        let (_tmp, _scripter, manager) = manager();
        for path in ["../outside.lua", "/etc/passwd", "lua/../../x"] {
            let err = manager
                .handle(ManagementRequest::ScriptPut {
                    path: path.into(),
                    file: String::new(),
                })
                .unwrap_err();
            assert!(err.to_string().contains("outside the script root"), "{path}");
        }
    }
}
