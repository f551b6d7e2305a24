//! The Lua scripter: script generations, per-peer connections and reload.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use mlua::{Lua, Value};

use super::connection::{LuaConnection, ScriptConnection};
use super::primitives::{self, PrimitiveContext};
use super::script_set::ScriptSet;
use super::{lock, ScriptError, ScriptPeer, Scripter, ScripterSettings};
use crate::abtest::AbTester;
use crate::event::{Event, SharedEventSink};

/// Idle `canHandle` interpreter sets kept per generation.
const MAX_IDLE_SNIFF_SETS: usize = 8;

/// Default lifetime of a peer's script state without traffic.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// One interpreter per script, used only for `canHandle`.
type SniffSet = Vec<(String, Lua)>;

/// One loaded version of a service's scripts.
pub(crate) struct Generation {
    pub(crate) number: u64,
    pub(crate) scripts: ScriptSet,
    /// `canHandle` interpreter sets not in use. A caller takes one out for
    /// the duration of its call, so concurrent callers never share a state.
    sniffers: Mutex<Vec<SniffSet>>,
}

/// Current generation per service.
pub(crate) type ServiceTable = RwLock<HashMap<String, Arc<Generation>>>;

/// Scripter running Lua 5.4 scripts from `<folder>/<name>/<service>/`.
pub struct LuaScripter {
    name: String,
    folder: PathBuf,
    abtester: Option<Arc<AbTester>>,
    events: Option<SharedEventSink>,
    services: Arc<ServiceTable>,
    connections: Mutex<HashMap<(String, String), Arc<LuaConnection>>>,
    next_generation: AtomicU64,
    /// Serialises `init` so concurrent reloads publish in order.
    init_lock: Mutex<()>,
    idle_timeout: Option<Duration>,
}

impl std::fmt::Debug for LuaScripter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaScripter")
            .field("name", &self.name)
            .field("folder", &self.folder)
            .finish_non_exhaustive()
    }
}

impl LuaScripter {
    /// Scripter `name` reading services from `folder/name`.
    pub fn new(name: impl Into<String>, folder: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            folder: folder.into(),
            abtester: None,
            events: None,
            services: Arc::new(RwLock::new(HashMap::new())),
            connections: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            init_lock: Mutex::new(()),
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }

    pub fn from_settings(settings: ScripterSettings) -> Self {
        let mut scripter = Self::new(settings.name, settings.folder);
        scripter.abtester = settings.abtester;
        scripter.events = settings.events;
        scripter.idle_timeout = settings.idle_timeout;
        scripter
    }

    /// Forget a peer's script state after `timeout` without traffic;
    /// `None` keeps it for the scripter's lifetime.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Expose `abtester` to scripts through `getAbTest`.
    #[must_use]
    pub fn with_abtester(mut self, abtester: Arc<AbTester>) -> Self {
        self.abtester = Some(abtester);
        self
    }

    /// Send reload and `doEvent` events to `events`.
    #[must_use]
    pub fn with_events(mut self, events: SharedEventSink) -> Self {
        self.events = Some(events);
        self
    }

    /// Number of distinct (peer, service) script connections.
    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    fn primitive_context(&self, service: &str, peer: Option<Arc<Mutex<ScriptPeer>>>) -> PrimitiveContext {
        PrimitiveContext {
            service: service.to_string(),
            abtester: self.abtester.clone(),
            events: self.events.clone(),
            base_dir: self.folder.clone(),
            peer,
        }
    }

    fn current(&self, service: &str) -> Option<Arc<Generation>> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(service)
            .cloned()
    }

    /// Fresh `canHandle` interpreters for every script of `scripts`.
    fn sniff_set(&self, service: &str, scripts: &ScriptSet) -> Result<SniffSet, ScriptError> {
        scripts
            .entries()
            .iter()
            .map(|entry| {
                let lua = self.load_sniff_state(service, entry.name(), entry.source())?;
                Ok((entry.name().to_string(), lua))
            })
            .collect()
    }

    fn load_sniff_state(&self, service: &str, name: &str, source: &str) -> Result<Lua, ScriptError> {
        let lua = Lua::new();
        for (function_name, function) in primitives::standard_functions(&self.primitive_context(service, None)) {
            function.bind(&lua, function_name).map_err(|source| ScriptError::Load {
                script: name.to_string(),
                source,
            })?;
        }
        lua.load(source)
            .set_name(name)
            .exec()
            .map_err(|source| ScriptError::Load {
                script: name.to_string(),
                source,
            })?;
        Ok(lua)
    }
}

impl Scripter for LuaScripter {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&self, service: &str) -> Result<(), ScriptError> {
        let _init = lock(&self.init_lock);

        let dir = self.script_folder().join(service);
        let scripts = ScriptSet::load(&dir)?;

        let sniffers = self.sniff_set(service, &scripts)?;

        let number = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let count = scripts.len();
        let generation = Arc::new(Generation {
            number,
            scripts,
            sniffers: Mutex::new(vec![sniffers]),
        });

        self.services
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(service.to_string(), generation);

        log::info!(
            "Loaded {} script(s) for {}/{} (generation {})",
            count,
            self.name,
            service,
            number
        );
        if let Some(events) = &self.events {
            events.send(
                Event::new("scripter", "reload")
                    .custom("scripter.name", self.name.clone())
                    .custom("scripter.service", service)
                    .custom("scripter.generation", number)
                    .custom("scripter.scripts", count),
            );
        }
        Ok(())
    }

    fn get_connection(&self, service: &str, peer: ScriptPeer) -> Arc<dyn ScriptConnection> {
        let key = (peer.identity(), service.to_string());
        let mut connections = lock(&self.connections);

        if let Some(existing) = connections.get(&key) {
            existing.set_peer(peer);
            existing.touch();
            return Arc::clone(existing) as Arc<dyn ScriptConnection>;
        }

        let shared_peer = Arc::new(Mutex::new(peer));
        let functions =
            primitives::standard_functions(&self.primitive_context(service, Some(Arc::clone(&shared_peer))));
        let connection = Arc::new(LuaConnection::new(
            service,
            Arc::clone(&self.services),
            shared_peer,
            functions,
        ));
        log::debug!("New script connection for {} on {}", key.0, service);
        connections.insert(key, Arc::clone(&connection));
        connection
    }

    fn can_handle(&self, service: &str, payload: &[u8]) -> bool {
        let Some(generation) = self.current(service) else {
            return false;
        };

        let idle = lock(&generation.sniffers).pop();
        let states = match idle {
            Some(states) => states,
            None => match self.sniff_set(service, &generation.scripts) {
                Ok(states) => states,
                Err(e) => {
                    log::error!("canHandle states for {} failed to load: {}", service, e);
                    return false;
                }
            },
        };

        let claimed = run_can_handle(&states, &String::from_utf8_lossy(payload));

        let mut idle = lock(&generation.sniffers);
        if idle.len() < MAX_IDLE_SNIFF_SETS {
            idle.push(states);
        }
        claimed
    }

    fn scripts(&self) -> BTreeMap<String, BTreeMap<String, PathBuf>> {
        self.services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(service, generation)| {
                let files = generation
                    .scripts
                    .entries()
                    .iter()
                    .map(|e| (e.name().to_string(), e.path().to_path_buf()))
                    .collect();
                (service.clone(), files)
            })
            .collect()
    }

    fn script_folder(&self) -> PathBuf {
        self.folder.join(&self.name)
    }

    fn check_reload(&self) -> Vec<String> {
        let stale: Vec<String> = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, generation)| generation.scripts.is_stale())
            .map(|(service, _)| service.clone())
            .collect();

        let mut reloaded = Vec::new();
        for service in stale {
            match self.init(&service) {
                Ok(()) => {
                    log::info!("Reloaded scripts for {}", service);
                    reloaded.push(service);
                }
                Err(e) => log::error!("Reload of {} failed, keeping previous scripts: {}", service, e),
            }
        }
        reloaded
    }

    fn evict_idle(&self) -> usize {
        let current: HashMap<String, u64> = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(service, generation)| (service.clone(), generation.number))
            .collect();

        let mut connections = lock(&self.connections);
        let before = connections.len();
        connections.retain(|(identity, service), connection| {
            // Held by a live session: keep.
            let unused = Arc::strong_count(connection) == 1;
            if unused && self.idle_timeout.is_some_and(|limit| connection.idle_for() >= limit) {
                log::debug!("Evicting idle script state of {} on {}", identity, service);
                return false;
            }
            connection.release_stale_contexts(current.get(service).copied());
            true
        });
        before - connections.len()
    }
}

/// Whether any script's `canHandle` returns true for `payload`.
fn run_can_handle(states: &[(String, Lua)], payload: &str) -> bool {
    for (name, lua) in states {
        let function: Value = match lua.globals().get("canHandle") {
            Ok(value) => value,
            Err(e) => {
                log::error!("Reading canHandle of {}: {}", name, e);
                continue;
            }
        };
        let Value::Function(function) = function else {
            continue;
        };
        match function.call::<bool>(payload) {
            Ok(true) => return true,
            Ok(false) => {}
            Err(e) => log::error!("canHandle of {} failed: {}", name, e),
        }
    }
    false
}
