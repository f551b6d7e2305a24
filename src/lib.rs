//! Trapline - honeypot runtime.
//!
//! Accepts connections on arbitrary protocols, routes each one through a
//! pluggable connector and records what the attacker did as structured
//! events.
//!
//! # Architecture
//!
//! - **Connector dispatch** - handshake, then a mode loop (service, director,
//!   scripter) until the connector terminates
//! - **Scripter** - per-service Lua pipelines with per-peer state, host
//!   primitives and hot reload
//! - **A/B store** - append-only response variants read by scripts
//!
//! # Modules
//!
//! - [`connector`] - Connector contract, options, registry and dispatch
//! - [`scripter`] - Lua runtime, script sets, host primitives, management
//! - [`abtest`] - Variant store on top of [`storage`]
//! - [`listener`] - TCP accept loops
//! - [`config`] - Configuration loading/saving

pub mod abtest;
pub mod app;
pub mod config;
pub mod connection;
pub mod connector;
pub mod event;
pub mod listener;
pub mod registry;
pub mod scripter;
pub mod service;
pub mod storage;

// Re-export commonly used types
pub use abtest::{AbTestError, AbTester};
pub use app::App;
pub use config::Config;
pub use connection::Connection;
pub use connector::{dispatch, Connector, ConnectorRegistry, DispatchError, Mode};
pub use event::{Event, EventSink, SharedEventSink};
pub use scripter::{LuaScripter, ScriptConnection, ScriptError, ScriptResponse, Scripter};
