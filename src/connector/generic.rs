//! Generic scripted connector.
//!
//! Claims connections whose first bytes a script of its service accepts via
//! `canHandle`, then relays every chunk the peer sends through the script
//! pipeline and writes the result back:
//!
//! ```text
//! peer -> read -> ScriptConnection::handle (blocking pool) -> write -> peer
//! ```
//!
//! EOF or a script returning `"_return"` switches the connector to
//! [`Mode::Terminate`]. A configured service or director additionally makes
//! the connector usable in those modes as a plain pass-through.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::{
    BaseConnector, ConnectorSettings, ContainerConnector, Connector, HandshakeState, Mode,
    ScripterConnector, ServiceConnector,
};
use crate::connection::Connection;
use crate::event::Event;
use crate::scripter::{ScriptError, ScriptPeer, ScriptResponse};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct GenericOptions {
    /// Script service to run.
    service: String,
    /// Close idle sessions after this many seconds; 0 keeps them open
    /// until the peer leaves.
    read_timeout_secs: u64,
    buffer_size: usize,
}

/// Idle limit of a session when the options do not set one.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 300;

impl Default for GenericOptions {
    fn default() -> Self {
        Self {
            service: "generic".to_string(),
            read_timeout_secs: DEFAULT_READ_TIMEOUT_SECS,
            buffer_size: 4096,
        }
    }
}

/// Scripted connector for arbitrary line or chunk based protocols.
#[derive(Debug)]
pub struct GenericConnector {
    base: BaseConnector,
    service: String,
    read_timeout: Option<Duration>,
    buffer_size: usize,
}

impl GenericConnector {
    /// Registered kind name.
    pub const KIND: &'static str = "generic";

    pub fn new(settings: ConnectorSettings) -> Result<Self> {
        let options: GenericOptions = settings.decode_config()?;
        if options.buffer_size == 0 {
            anyhow::bail!("connector '{}': buffer_size must be positive", settings.name);
        }

        Ok(Self {
            base: BaseConnector::new(Self::KIND, Mode::Scripter, settings),
            service: options.service,
            read_timeout: (options.read_timeout_secs > 0)
                .then(|| Duration::from_secs(options.read_timeout_secs)),
            buffer_size: options.buffer_size,
        })
    }

    /// Factory for the connector registry.
    pub fn boxed(settings: ConnectorSettings) -> Result<Box<dyn Connector>> {
        Ok(Box::new(Self::new(settings)?))
    }

    /// Script service this connector runs.
    pub fn service(&self) -> &str {
        &self.service
    }

    fn session_event(&self, kind: &str, conn: &Connection) -> Event {
        Event::new("generic", kind)
            .source(conn.peer_addr())
            .destination(conn.local_addr())
            .custom("generic.connector", self.base.name())
            .custom("generic.service", self.service.as_str())
            .custom("generic.session", conn.id().to_string())
    }

    async fn read_chunk(&self, conn: &mut Connection, buf: &mut [u8]) -> Result<usize> {
        let read = conn.read(buf);
        match self.read_timeout {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(n) => Ok(n?),
                Err(_) => {
                    log::debug!("Session with {} idle for {:?}", conn.peer_addr(), limit);
                    Ok(0)
                }
            },
            None => Ok(read.await?),
        }
    }
}

impl Connector for GenericConnector {
    fn base(&self) -> &BaseConnector {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseConnector {
        &mut self.base
    }

    fn can_handle(&self, payload: &[u8]) -> bool {
        self.base
            .scripter()
            .is_some_and(|scripter| scripter.can_handle(&self.service, payload))
    }

    fn as_service(&mut self) -> Option<&mut dyn ServiceConnector> {
        if self.base.service().is_some() {
            Some(self)
        } else {
            None
        }
    }

    fn as_director(&mut self) -> Option<&mut dyn ContainerConnector> {
        if self.base.director().is_some() {
            Some(self)
        } else {
            None
        }
    }

    fn as_scripter(&mut self) -> Option<&mut dyn ScripterConnector> {
        if self.base.scripter().is_some() {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl ServiceConnector for GenericConnector {
    async fn handle_service(&mut self, conn: &mut Connection, _state: &mut HandshakeState) -> Result<()> {
        let service = Arc::clone(self.base.service().context("no service configured")?);
        service.handle(self.base.cancellation(), conn).await?;
        self.set_mode(Mode::Terminate);
        Ok(())
    }
}

#[async_trait]
impl ContainerConnector for GenericConnector {
    async fn dial_container(&mut self, conn: &mut Connection, _state: &mut HandshakeState) -> Result<()> {
        let director = Arc::clone(self.base.director().context("no director configured")?);
        director.dial_container(conn).await?;
        self.set_mode(Mode::Terminate);
        Ok(())
    }
}

#[async_trait]
impl ScripterConnector for GenericConnector {
    async fn handle_scripter(&mut self, conn: &mut Connection, _state: &mut HandshakeState) -> Result<()> {
        let scripter = Arc::clone(self.base.scripter().context("no scripter configured")?);
        let session = scripter.get_connection(&self.service, ScriptPeer::from(&*conn));

        log::info!("Generic session from {} on {}", conn.peer_addr(), self.service);
        self.base.emit(self.session_event("session-start", conn));

        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let n = self.read_chunk(conn, &mut buf).await?;
            if n == 0 {
                break;
            }

            let message = String::from_utf8_lossy(&buf[..n]).into_owned();
            self.base
                .emit(self.session_event("data", conn).payload(&buf[..n]));

            let handle = Arc::clone(&session);
            let response = tokio::task::spawn_blocking(move || handle.handle(&message))
                .await
                .context("script task panicked")?;

            match response {
                Ok(ScriptResponse::Text(reply)) => {
                    conn.write_all(reply.as_bytes()).await?;
                    conn.flush().await?;
                }
                Ok(ScriptResponse::Return) => {
                    log::debug!("Script ended session with {}", conn.peer_addr());
                    break;
                }
                Err(e @ (ScriptError::NotInitialized(_) | ScriptError::NoScripts(_))) => {
                    return Err(e.into());
                }
                Err(e) => {
                    log::error!("Script error for {}: {}", conn.peer_addr(), e);
                    self.base.emit(
                        self.session_event("script-error", conn)
                            .custom("generic.error", e.to_string()),
                    );
                }
            }
        }

        self.base.emit(self.session_event("session-end", conn));
        self.set_mode(Mode::Terminate);
        Ok(())
    }
}
