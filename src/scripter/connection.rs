//! Per-peer script state and the `handle` pipeline.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::Result;
use mlua::{IntoLuaMulti, Lua, MultiValue, Value};

use super::params::ParamStack;
use super::runtime::{Generation, ServiceTable};
use super::{lock, ScriptError, ScriptPeer, ScriptResponse, RETURN_SENTINEL};

type StringFn = dyn Fn(&mut ParamStack) -> Result<String> + Send + Sync;
type FloatFn = dyn Fn(&mut ParamStack) -> Result<f64> + Send + Sync;
type VoidFn = dyn Fn(&mut ParamStack) -> Result<()> + Send + Sync;

/// A host function scripts can call, by return kind.
#[derive(Clone)]
pub enum HostFunction {
    /// Returns one string.
    String(Arc<StringFn>),
    /// Returns one number.
    Float(Arc<FloatFn>),
    /// Returns nothing.
    Void(Arc<VoidFn>),
}

impl fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::String(_) => "String",
            Self::Float(_) => "Float",
            Self::Void(_) => "Void",
        };
        f.debug_tuple("HostFunction").field(&kind).finish()
    }
}

impl HostFunction {
    pub fn string<F>(f: F) -> Self
    where
        F: Fn(&mut ParamStack) -> Result<String> + Send + Sync + 'static,
    {
        Self::String(Arc::new(f))
    }

    pub fn float<F>(f: F) -> Self
    where
        F: Fn(&mut ParamStack) -> Result<f64> + Send + Sync + 'static,
    {
        Self::Float(Arc::new(f))
    }

    pub fn void<F>(f: F) -> Self
    where
        F: Fn(&mut ParamStack) -> Result<()> + Send + Sync + 'static,
    {
        Self::Void(Arc::new(f))
    }

    /// Expose this function as global `name` in `lua`.
    ///
    /// A host error surfaces in the script as a Lua error.
    pub(crate) fn bind(&self, lua: &Lua, name: &str) -> mlua::Result<()> {
        let host = self.clone();
        let function = lua.create_function(move |lua, args: MultiValue| {
            let mut params = ParamStack::from_lua(lua, args)?;
            match &host {
                Self::String(f) => f(&mut params)
                    .map_err(mlua::Error::external)?
                    .into_lua_multi(lua),
                Self::Float(f) => f(&mut params)
                    .map_err(mlua::Error::external)?
                    .into_lua_multi(lua),
                Self::Void(f) => {
                    f(&mut params).map_err(mlua::Error::external)?;
                    Ok(MultiValue::new())
                }
            }
        })?;
        lua.globals().set(name, function)
    }
}

/// A peer's view of one service's scripts.
///
/// [`handle`](Self::handle) runs synchronously inside the interpreter and
/// may block on host functions (file downloads); async callers run it on the
/// blocking pool.
pub trait ScriptConnection: Send + Sync + fmt::Debug {
    /// Run `message` through every script of the service in order.
    ///
    /// Each script's `handle` gets the previous script's output. A `nil`
    /// result leaves the message unchanged and `"_return"` ends the
    /// pipeline with [`ScriptResponse::Return`].
    fn handle(&self, message: &str) -> Result<ScriptResponse, ScriptError>;

    /// Register `function` as global `name` in every script of this
    /// connection, replacing a previous registration of the same name.
    fn set_function(&self, name: &str, function: HostFunction);
}

impl dyn ScriptConnection {
    /// Register a host function returning a string.
    pub fn set_string_function<F>(&self, name: &str, f: F)
    where
        F: Fn(&mut ParamStack) -> Result<String> + Send + Sync + 'static,
    {
        self.set_function(name, HostFunction::string(f));
    }

    /// Register a host function returning a number.
    pub fn set_float_function<F>(&self, name: &str, f: F)
    where
        F: Fn(&mut ParamStack) -> Result<f64> + Send + Sync + 'static,
    {
        self.set_function(name, HostFunction::float(f));
    }

    /// Register a host function returning nothing.
    pub fn set_void_function<F>(&self, name: &str, f: F)
    where
        F: Fn(&mut ParamStack) -> Result<()> + Send + Sync + 'static,
    {
        self.set_function(name, HostFunction::void(f));
    }
}

/// Interpreters bound for one script generation.
struct ContextSet {
    generation: u64,
    scripts: Mutex<Vec<(String, Lua)>>,
}

#[derive(Default)]
struct BoundState {
    functions: BTreeMap<String, HostFunction>,
    contexts: Option<Arc<ContextSet>>,
}

/// Lua-backed [`ScriptConnection`].
///
/// Interpreters are created lazily and rebuilt when the service's script
/// generation changes, so a reload reaches existing peers on their next
/// message. Host functions registered on the connection are re-bound into
/// every rebuilt interpreter.
pub struct LuaConnection {
    identity: String,
    service: String,
    services: Arc<ServiceTable>,
    peer: Arc<Mutex<ScriptPeer>>,
    state: Mutex<BoundState>,
    last_used: Mutex<Instant>,
}

impl fmt::Debug for LuaConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LuaConnection")
            .field("identity", &self.identity)
            .field("service", &self.service)
            .finish_non_exhaustive()
    }
}

impl LuaConnection {
    pub(crate) fn new(
        service: &str,
        services: Arc<ServiceTable>,
        peer: Arc<Mutex<ScriptPeer>>,
        functions: Vec<(&'static str, HostFunction)>,
    ) -> Self {
        let identity = lock(&peer).identity();
        let functions = functions
            .into_iter()
            .map(|(name, f)| (name.to_string(), f))
            .collect();
        Self {
            identity,
            service: service.to_string(),
            services,
            peer,
            state: Mutex::new(BoundState {
                functions,
                contexts: None,
            }),
            last_used: Mutex::new(Instant::now()),
        }
    }

    /// Remote IP this connection belongs to.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Service whose scripts this connection runs.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current peer addresses.
    pub fn peer(&self) -> ScriptPeer {
        *lock(&self.peer)
    }

    /// Record the addresses of the latest connection from this peer.
    pub(crate) fn set_peer(&self, peer: ScriptPeer) {
        *lock(&self.peer) = peer;
    }

    pub(crate) fn touch(&self) {
        *lock(&self.last_used) = Instant::now();
    }

    /// Time since this peer last connected or sent a message.
    pub fn idle_for(&self) -> Duration {
        lock(&self.last_used).elapsed()
    }

    /// Generation the interpreters are currently bound to, if any.
    pub fn bound_generation(&self) -> Option<u64> {
        lock(&self.state).contexts.as_ref().map(|c| c.generation)
    }

    /// Drop interpreters bound to anything but `current`. A call already
    /// running on them finishes; the next one rebinds.
    pub(crate) fn release_stale_contexts(&self, current: Option<u64>) {
        let mut state = lock(&self.state);
        let stale = state
            .contexts
            .as_ref()
            .is_some_and(|contexts| Some(contexts.generation) != current);
        if stale {
            log::debug!("Releasing replaced script state of {} on {}", self.identity, self.service);
            state.contexts = None;
        }
    }

    /// Interpreters for the current generation, rebuilt when stale.
    fn contexts(&self) -> Result<Arc<ContextSet>, ScriptError> {
        let generation = self
            .services
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&self.service)
            .cloned()
            .ok_or_else(|| ScriptError::NotInitialized(self.service.clone()))?;

        let mut state = lock(&self.state);
        if let Some(contexts) = &state.contexts {
            if contexts.generation == generation.number {
                return Ok(Arc::clone(contexts));
            }
        }

        let contexts = Arc::new(self.build_contexts(&generation, &state.functions)?);
        state.contexts = Some(Arc::clone(&contexts));
        Ok(contexts)
    }

    /// Bind every script of `generation`. Any failure aborts the whole set
    /// and nothing is cached, so the next message tries again.
    fn build_contexts(
        &self,
        generation: &Generation,
        functions: &BTreeMap<String, HostFunction>,
    ) -> Result<ContextSet, ScriptError> {
        let mut scripts = Vec::with_capacity(generation.scripts.len());
        for entry in generation.scripts.entries() {
            let load_error = |source: mlua::Error| {
                log::error!(
                    "Failed to load {} for {} on {}: {}",
                    entry.name(),
                    self.identity,
                    self.service,
                    source
                );
                ScriptError::Load {
                    script: entry.name().to_string(),
                    source,
                }
            };

            let lua = Lua::new();
            for (name, function) in functions {
                function.bind(&lua, name).map_err(load_error)?;
            }
            lua.load(entry.source())
                .set_name(entry.name())
                .exec()
                .map_err(load_error)?;
            scripts.push((entry.name().to_string(), lua));
        }

        log::debug!(
            "Bound {} script(s) of {} (generation {}) for {}",
            scripts.len(),
            self.service,
            generation.number,
            self.identity
        );

        Ok(ContextSet {
            generation: generation.number,
            scripts: Mutex::new(scripts),
        })
    }
}

impl ScriptConnection for LuaConnection {
    fn handle(&self, message: &str) -> Result<ScriptResponse, ScriptError> {
        self.touch();
        let contexts = self.contexts()?;
        let scripts = lock(&contexts.scripts);
        if scripts.is_empty() {
            return Err(ScriptError::NoScripts(self.service.clone()));
        }

        let mut current = message.to_string();
        for (name, lua) in scripts.iter() {
            match call_handle(lua, name, &current)? {
                Some(reply) if reply == RETURN_SENTINEL => {
                    log::debug!("{} ended the session for {}", name, self.identity);
                    return Ok(ScriptResponse::Return);
                }
                Some(reply) => current = reply,
                None => {}
            }
        }

        Ok(ScriptResponse::Text(current))
    }

    fn set_function(&self, name: &str, function: HostFunction) {
        let mut state = lock(&self.state);
        if let Some(contexts) = &state.contexts {
            for (script, lua) in lock(&contexts.scripts).iter() {
                if let Err(e) = function.bind(lua, name) {
                    log::error!("Failed to bind {} for {}: {}", name, script, e);
                }
            }
        }
        state.functions.insert(name.to_string(), function);
    }
}

/// Call the global `handle(message)` of one script.
fn call_handle(lua: &Lua, script: &str, message: &str) -> Result<Option<String>, ScriptError> {
    let runtime_error = |source| ScriptError::Runtime {
        script: script.to_string(),
        source,
    };

    let handler: Value = lua.globals().get("handle").map_err(runtime_error)?;
    let Value::Function(handler) = handler else {
        return Err(ScriptError::MissingHandler {
            script: script.to_string(),
            function: "handle",
        });
    };

    let reply: Value = handler.call(message).map_err(runtime_error)?;
    match reply {
        Value::Nil => Ok(None),
        Value::String(s) => Ok(Some(s.to_string_lossy().to_string())),
        Value::Integer(_) | Value::Number(_) => Ok(lua
            .coerce_string(reply)
            .map_err(runtime_error)?
            .map(|s| s.to_string_lossy().to_string())),
        other => Err(ScriptError::InvalidReturn {
            script: script.to_string(),
            type_name: other.type_name(),
        }),
    }
}
