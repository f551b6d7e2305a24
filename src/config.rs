//! Configuration loading and persistence.
//!
//! The configuration is a JSON file (`config.json`) looked up in:
//!
//! 1. the path passed with `--config`
//! 2. `$TRAPLINE_CONFIG_DIR/config.json`
//! 3. the platform config dir (Linux: `~/.config/trapline/config.json`)
//!
//! A missing file in 2 or 3 means defaults. Environment overrides are
//! applied last.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::connector::Mode;
use crate::storage::{MemoryBackend, SqliteBackend, StorageBackend};

/// Runtime configuration.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Address the honeypot listener binds.
    pub listen: String,
    /// Address of the script management endpoint; disabled when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub management: Option<String>,
    /// Seconds to wait for a peer's first bytes before picking a connector
    /// without them.
    pub sniff_timeout_secs: u64,
    pub scripter: ScripterConfig,
    pub abtester: AbTesterConfig,
    pub storage: StorageConfig,
    /// Connectors tried in order when sniffing a new connection.
    pub connectors: Vec<ConnectorConfig>,
    /// Connector used when none claims the connection.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_connector: Option<String>,
}

/// Scripting runtime settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct ScripterConfig {
    /// Registered scripter kind.
    pub kind: String,
    /// Scripter name; its scripts live in `<folder>/<name>/`.
    pub name: String,
    /// Root script folder.
    pub folder: PathBuf,
    /// Services initialised at startup.
    pub services: Vec<String>,
    /// Seconds between script change checks.
    pub reload_interval_secs: u64,
    /// Seconds a peer's Lua state survives without traffic; 0 keeps it
    /// for the process lifetime.
    pub idle_timeout_secs: u64,
}

/// A/B variant store settings.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AbTesterConfig {
    /// Namespace suffix (`abtester_<namespace>`).
    pub namespace: String,
    /// Variants imported at startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

/// Storage backend settings.
///
/// Storage is a SQLite file unless `in_memory` is set.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database file; [`StorageConfig::database_path`] when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    /// Keep everything in process memory; nothing survives a restart.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub in_memory: bool,
}

impl StorageConfig {
    /// Database file used when no `path` is configured:
    /// `$TRAPLINE_DATA_DIR/trapline.db`, else the platform data dir
    /// (Linux: `~/.local/share/trapline/trapline.db`).
    pub fn database_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        let dir = match std::env::var("TRAPLINE_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => dirs::data_dir()
                .context("Could not determine data directory")?
                .join("trapline"),
        };
        Ok(dir.join("trapline.db"))
    }
}

/// One connector instance.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ConnectorConfig {
    /// Instance name, used in logs and events.
    pub name: String,
    /// Registered connector kind.
    #[serde(default = "default_connector_kind")]
    pub kind: String,
    /// Initial mode; the connector's own default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<Mode>,
    /// Connector-specific options.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub options: serde_json::Value,
}

fn default_connector_kind() -> String {
    "generic".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8022".to_string(),
            management: None,
            sniff_timeout_secs: 5,
            scripter: ScripterConfig::default(),
            abtester: AbTesterConfig::default(),
            storage: StorageConfig::default(),
            connectors: vec![ConnectorConfig {
                name: "generic".to_string(),
                kind: default_connector_kind(),
                mode: None,
                options: serde_json::Value::Null,
            }],
            fallback_connector: Some("generic".to_string()),
        }
    }
}

impl Default for ScripterConfig {
    fn default() -> Self {
        Self {
            kind: "lua".to_string(),
            name: "lua".to_string(),
            folder: PathBuf::from("scripts"),
            services: vec!["generic".to_string()],
            reload_interval_secs: 10,
            idle_timeout_secs: 1800,
        }
    }
}

impl Default for AbTesterConfig {
    fn default() -> Self {
        Self {
            namespace: "lua".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Directory holding `config.json`.
    pub fn config_dir() -> Result<PathBuf> {
        if let Ok(dir) = std::env::var("TRAPLINE_CONFIG_DIR") {
            return Ok(PathBuf::from(dir));
        }
        Ok(dirs::config_dir()
            .context("Could not determine config directory")?
            .join("trapline"))
    }

    /// Load the configuration, with environment overrides.
    ///
    /// An explicit `path` must exist; the default location may be absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let default_path = Self::config_dir()?.join("config.json");
                if default_path.exists() {
                    Self::load_from_file(&default_path)?
                } else {
                    log::debug!("No config at {}, using defaults", default_path.display());
                    Self::default()
                }
            }
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse one configuration file.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(listen) = std::env::var("TRAPLINE_LISTEN") {
            self.listen = listen;
        }

        if let Ok(folder) = std::env::var("TRAPLINE_SCRIPT_FOLDER") {
            self.scripter.folder = PathBuf::from(folder);
        }

        if let Ok(management) = std::env::var("TRAPLINE_MANAGEMENT") {
            self.management = Some(management).filter(|m| !m.is_empty());
        }
    }

    /// Reject configurations that cannot start.
    pub fn validate(&self) -> Result<()> {
        if self.connectors.is_empty() {
            anyhow::bail!("at least one connector must be configured");
        }
        let mut names: Vec<&str> = self.connectors.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|w| w[0] == w[1]) {
            anyhow::bail!("duplicate connector name '{}'", pair[0]);
        }
        if let Some(fallback) = &self.fallback_connector {
            if !names.contains(&fallback.as_str()) {
                anyhow::bail!("fallback connector '{}' is not configured", fallback);
            }
        }
        if self.scripter.reload_interval_secs == 0 {
            anyhow::bail!("scripter.reload_interval_secs must be positive");
        }
        Ok(())
    }

    /// Write the configuration to `path`, owner-readable only.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(self)?)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    pub fn reload_interval(&self) -> Duration {
        Duration::from_secs(self.scripter.reload_interval_secs)
    }

    pub fn sniff_timeout(&self) -> Duration {
        Duration::from_secs(self.sniff_timeout_secs)
    }

    /// Idle lifetime of a peer's Lua state, `None` when disabled.
    pub fn idle_timeout(&self) -> Option<Duration> {
        Some(self.scripter.idle_timeout_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Open the configured storage backend.
    pub fn open_storage(&self) -> Result<Arc<dyn StorageBackend>> {
        if self.storage.in_memory {
            log::info!("Using in-memory storage");
            return Ok(Arc::new(MemoryBackend::new()));
        }
        let path = self.storage.database_path()?;
        let backend = SqliteBackend::open(&path)
            .with_context(|| format!("Failed to open storage {}", path.display()))?;
        log::info!("Using storage {}", path.display());
        Ok(Arc::new(backend))
    }
}
