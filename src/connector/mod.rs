//! Protocol connectors and the per-connection dispatch loop.
//!
//! A connector owns one accepted connection. It may run a handshake first,
//! then reports a [`Mode`] before every dispatch iteration and must provide
//! the capability that mode needs:
//!
//! | Mode        | Capability                                   |
//! |-------------|----------------------------------------------|
//! | `service`   | [`ServiceConnector::handle_service`]         |
//! | `director`  | [`ContainerConnector::dial_container`]       |
//! | `scripter`  | [`ScripterConnector::handle_scripter`]       |
//! | `terminate` | none, the loop ends                          |
//!
//! Capabilities are declared through the `as_*` accessors of [`Connector`].
//! A connector that reports a mode it cannot serve fails dispatch with
//! [`DispatchError::MissingCapability`].

pub mod base;
pub mod dispatch;
pub mod generic;
pub mod registry;

use std::any::Any;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::connection::Connection;

pub use base::{
    with_cancellation, with_config, with_director, with_events, with_mode, with_scripter,
    with_service, BaseConnector, ConnectorOption, ConnectorSettings,
};
pub use dispatch::{dispatch, DispatchError};
pub use generic::GenericConnector;
pub use registry::{ConnectorFactory, ConnectorRegistry};

/// What a connector does with its connection next.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Hand the connection to an emulated service.
    Service,
    /// Forward the connection to a container.
    Director,
    /// Answer through the scripting runtime.
    Scripter,
    /// Close the connection.
    Terminate,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Service => "service",
            Self::Director => "director",
            Self::Scripter => "scripter",
            Self::Terminate => "terminate",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "service" => Ok(Self::Service),
            "director" => Ok(Self::Director),
            "scripter" => Ok(Self::Scripter),
            "terminate" => Ok(Self::Terminate),
            other => anyhow::bail!(
                "unknown connector mode '{}' (expected service, director, scripter or terminate)",
                other
            ),
        }
    }
}

/// Protocol state produced by a handshake and carried through dispatch.
#[derive(Default)]
pub struct HandshakeState(Option<Box<dyn Any + Send + Sync>>);

impl fmt::Debug for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandshakeState")
            .field(&self.0.as_ref().map(|_| ".."))
            .finish()
    }
}

impl HandshakeState {
    /// State holding `value`.
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Box::new(value)))
    }

    /// No handshake state.
    pub fn empty() -> Self {
        Self(None)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_none()
    }

    /// The state, if it holds a `T`.
    pub fn get<T: Any>(&self) -> Option<&T> {
        self.0.as_ref().and_then(|v| v.downcast_ref())
    }

    /// Mutable access to the state, if it holds a `T`.
    pub fn get_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.0.as_mut().and_then(|v| v.downcast_mut())
    }
}

/// Result of a handshake.
#[derive(Debug)]
pub enum HandshakeOutcome {
    /// The protocol is set up; carry this state forward.
    Established(HandshakeState),
    /// The peer closed the connection in an orderly way.
    Closed,
}

/// Optional first step run once per connection.
#[async_trait]
pub trait Handshaker: Send {
    async fn handshake(&mut self, conn: &mut Connection) -> anyhow::Result<HandshakeOutcome>;
}

/// Capability used in [`Mode::Service`].
#[async_trait]
pub trait ServiceConnector: Send {
    async fn handle_service(
        &mut self,
        conn: &mut Connection,
        state: &mut HandshakeState,
    ) -> anyhow::Result<()>;
}

/// Capability used in [`Mode::Director`].
#[async_trait]
pub trait ContainerConnector: Send {
    async fn dial_container(
        &mut self,
        conn: &mut Connection,
        state: &mut HandshakeState,
    ) -> anyhow::Result<()>;
}

/// Capability used in [`Mode::Scripter`].
#[async_trait]
pub trait ScripterConnector: Send {
    async fn handle_scripter(
        &mut self,
        conn: &mut Connection,
        state: &mut HandshakeState,
    ) -> anyhow::Result<()>;
}

/// A protocol emulator bound to one connection.
///
/// Implementations embed a [`BaseConnector`] for identity, mode and
/// collaborators, and override the `as_*` accessors for the capabilities
/// they provide.
pub trait Connector: Send + fmt::Debug {
    fn base(&self) -> &BaseConnector;

    fn base_mut(&mut self) -> &mut BaseConnector;

    /// Instance name from configuration.
    fn name(&self) -> &str {
        self.base().name()
    }

    /// Registered kind the instance was built from.
    fn kind(&self) -> &str {
        self.base().kind()
    }

    /// Mode for the next dispatch iteration.
    fn mode(&self) -> Mode {
        self.base().mode()
    }

    fn set_mode(&mut self, mode: Mode) {
        self.base_mut().set_mode(mode);
    }

    fn cancellation(&self) -> CancellationToken {
        self.base().cancellation()
    }

    /// Whether this connector claims a connection starting with `payload`.
    fn can_handle(&self, _payload: &[u8]) -> bool {
        false
    }

    fn as_handshaker(&mut self) -> Option<&mut dyn Handshaker> {
        None
    }

    fn as_service(&mut self) -> Option<&mut dyn ServiceConnector> {
        None
    }

    fn as_director(&mut self) -> Option<&mut dyn ContainerConnector> {
        None
    }

    fn as_scripter(&mut self) -> Option<&mut dyn ScripterConnector> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_parse_and_display() {
        for mode in [Mode::Service, Mode::Director, Mode::Scripter, Mode::Terminate] {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
        }
        assert_eq!("SCRIPTER".parse::<Mode>().unwrap(), Mode::Scripter);
    }

    #[test]
    fn test_unknown_mode_is_rejected() {
        let err = "proxy".parse::<Mode>().unwrap_err().to_string();
        assert!(err.contains("unknown connector mode 'proxy'"));
        assert!(serde_json::from_str::<Mode>(r#""proxy""#).is_err());
        assert_eq!(serde_json::from_str::<Mode>(r#""director""#).unwrap(), Mode::Director);
    }

    #[test]
    fn test_handshake_state_downcasts() {
        #[derive(Debug, PartialEq)]
        struct Banner(String);

        let mut state = HandshakeState::new(Banner("SSH-2.0".into()));
        assert_eq!(state.get::<Banner>(), Some(&Banner("SSH-2.0".into())));
        assert!(state.get::<u32>().is_none());

        state.get_mut::<Banner>().unwrap().0.push_str("-x");
        assert_eq!(state.get::<Banner>().unwrap().0, "SSH-2.0-x");
        assert!(HandshakeState::empty().is_empty());
    }
}
