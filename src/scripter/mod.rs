//! Per-service, per-peer Lua responders.
//!
//! A scripter owns a folder of scripts grouped by service:
//!
//! ```text
//! <folder>/<scripter-name>/<service>/<file>
//! ```
//!
//! Every file of a service is one pipeline stage. For each peer (keyed by
//! remote IP, so reconnecting attackers keep their script state) the runtime
//! builds one interpreter per stage, binds the host primitives into it, and
//! runs `handle(message)` through the stages in file-name order.
//!
//! # Architecture
//!
//! ```text
//! LuaScripter
//!  ├── services: service -> Generation (ScriptSet + canHandle states)
//!  ├── connections: (identity, service) -> LuaConnection
//!  │                                        └── ContextSet (one Lua per stage)
//!  └── reload task: fingerprints every N seconds, re-inits changed services
//! ```
//!
//! # Host functions
//!
//! Scripts call host functions with plain arguments. The host sees those
//! arguments as a [`ParamStack`] and pops the declared parameter names off
//! its top, in declaration order:
//!
//! ```lua
//! -- getAbTest declares ("key"); doLog declares ("logType", "message")
//! local banner = getAbTest("banner")
//! doLog("info", "served " .. banner)
//! ```

pub mod connection;
pub mod management;
pub mod params;
pub mod primitives;
pub mod runtime;
pub mod script_set;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::abtest::AbTester;
use crate::event::SharedEventSink;
use crate::registry::Registry;

pub use connection::{HostFunction, LuaConnection, ScriptConnection};
pub use management::{ManagementRequest, ScriptManager};
pub use params::ParamStack;
pub use runtime::{LuaScripter, DEFAULT_IDLE_TIMEOUT};
pub use script_set::{ScriptEntry, ScriptSet};

/// Value a script returns to end the session instead of answering.
pub const RETURN_SENTINEL: &str = "_return";

/// Default interval between script fingerprint checks.
pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(10);

/// Errors raised while loading or running scripts.
#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    /// The service directory could not be read.
    #[error("failed to read scripts in {dir}: {source}")]
    ReadDir {
        /// Directory that was scanned.
        dir: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A script file could not be read.
    #[error("failed to read script {path}: {source}")]
    ReadScript {
        /// File that failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A script failed to execute while being loaded.
    #[error("failed to load script '{script}': {source}")]
    Load {
        /// File name of the script.
        script: String,
        /// Interpreter error.
        #[source]
        source: mlua::Error,
    },

    /// `handle` was called for a service that was never initialized.
    #[error("service '{0}' is not initialized")]
    NotInitialized(String),

    /// The service has no scripts bound for this connection.
    #[error("no scripts loaded for service '{0}'")]
    NoScripts(String),

    /// A script does not define the expected global function.
    #[error("script '{script}' does not define {function}()")]
    MissingHandler {
        /// File name of the script.
        script: String,
        /// Name of the missing function.
        function: &'static str,
    },

    /// A script raised an error while handling a message.
    #[error("script '{script}' failed: {source}")]
    Runtime {
        /// File name of the script.
        script: String,
        /// Interpreter error.
        #[source]
        source: mlua::Error,
    },

    /// A script returned something that is neither text nor nil.
    #[error("script '{script}' returned a {type_name}, expected a string")]
    InvalidReturn {
        /// File name of the script.
        script: String,
        /// Lua type name of the returned value.
        type_name: &'static str,
    },
}

/// Outcome of running the script pipeline on one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptResponse {
    /// Text to send back to the peer.
    Text(String),
    /// A script asked to end the session.
    Return,
}

/// Endpoint addresses of the peer a script connection talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptPeer {
    /// Remote endpoint.
    pub remote: SocketAddr,
    /// Local endpoint.
    pub local: SocketAddr,
}

impl ScriptPeer {
    /// Stable identity for rejoining script state: the remote IP without port.
    pub fn identity(&self) -> String {
        self.remote.ip().to_string()
    }
}

impl From<&crate::connection::Connection> for ScriptPeer {
    fn from(conn: &crate::connection::Connection) -> Self {
        Self {
            remote: conn.peer_addr(),
            local: conn.local_addr(),
        }
    }
}

/// A scripting runtime serving one script folder.
pub trait Scripter: Send + Sync + std::fmt::Debug {
    /// Registered name; also the sub-folder holding this scripter's services.
    fn name(&self) -> &str;

    /// Load (or reload) every script of `service` and publish them as a new
    /// generation. Fails without touching the current generation.
    fn init(&self, service: &str) -> Result<(), ScriptError>;

    /// Script connection for `peer` on `service`, shared by every connection
    /// from the same remote IP.
    fn get_connection(&self, service: &str, peer: ScriptPeer) -> Arc<dyn ScriptConnection>;

    /// Whether any script of `service` claims the sniffed first bytes `payload`.
    fn can_handle(&self, service: &str, payload: &[u8]) -> bool;

    /// Loaded scripts: service -> file name -> path.
    fn scripts(&self) -> BTreeMap<String, BTreeMap<String, PathBuf>>;

    /// Folder holding this scripter's service directories.
    fn script_folder(&self) -> PathBuf;

    /// Re-initialize every service whose scripts changed on disk. Returns the
    /// services that were reloaded.
    fn check_reload(&self) -> Vec<String>;

    /// Forget per-peer script state that no session holds and that saw no
    /// traffic for the idle timeout, and free interpreters bound to
    /// replaced generations. Returns the number of peers forgotten.
    fn evict_idle(&self) -> usize;
}

/// Inputs handed to a scripter factory.
#[derive(Debug, Clone)]
pub struct ScripterSettings {
    /// Scripter name (sub-folder under `folder`).
    pub name: String,
    /// Root script folder.
    pub folder: PathBuf,
    /// Variant store exposed through `getAbTest`.
    pub abtester: Option<Arc<AbTester>>,
    /// Sink for script-emitted and reload events.
    pub events: Option<SharedEventSink>,
    /// Idle lifetime of per-peer script state; `None` keeps it forever.
    pub idle_timeout: Option<Duration>,
}

/// Constructor registered under a scripter kind.
pub type ScripterFactory =
    Arc<dyn Fn(ScripterSettings) -> anyhow::Result<Arc<dyn Scripter>> + Send + Sync>;

/// Name -> factory map for scripter kinds.
pub type ScripterRegistry = Registry<ScripterFactory>;

impl Registry<ScripterFactory> {
    /// Registry with the built-in `lua` scripter.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new("scripter");
        registry.register(
            "lua",
            Arc::new(|settings: ScripterSettings| {
                Ok(Arc::new(LuaScripter::from_settings(settings)) as Arc<dyn Scripter>)
            }) as ScripterFactory,
        );
        registry
    }

    /// Build a scripter of `kind`.
    pub fn build(&self, kind: &str, settings: ScripterSettings) -> anyhow::Result<Arc<dyn Scripter>> {
        let factory = self.require(kind)?;
        factory(settings)
    }
}

/// Re-initialize every loaded service of `scripter`.
pub fn reload_scripts(scripter: &dyn Scripter) {
    for service in scripter.scripts().keys() {
        match scripter.init(service) {
            Ok(()) => log::info!("Successfully updated service: {}", service),
            Err(e) => log::error!("Error initializing service '{}': {}", service, e),
        }
    }
}

/// [`reload_scripts`] for every scripter.
pub fn reload_all(scripters: &[Arc<dyn Scripter>]) {
    for scripter in scripters {
        reload_scripts(scripter.as_ref());
    }
}

/// Spawn the periodic change check for `scripter`.
///
/// Each tick runs [`Scripter::check_reload`] and then
/// [`Scripter::evict_idle`] on the blocking pool. The task stops when
/// `cancel` fires.
pub fn spawn_reload_task(
    scripter: Arc<dyn Scripter>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; scripts were just loaded.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let scripter = Arc::clone(&scripter);
                    let checked = tokio::task::spawn_blocking(move || {
                        (scripter.check_reload(), scripter.evict_idle())
                    });
                    match checked.await {
                        Ok((reloaded, evicted)) => {
                            if !reloaded.is_empty() {
                                log::debug!("Reload check updated {:?}", reloaded);
                            }
                            if evicted > 0 {
                                log::debug!("Evicted {} idle script state(s)", evicted);
                            }
                        }
                        Err(e) => log::error!("Script reload check panicked: {}", e),
                    }
                }
            }
        }

        log::debug!("Script reload task stopped");
    })
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
