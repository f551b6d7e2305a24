//! The per-connection lifecycle: handshake, mode loop, termination.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use super::{Connector, HandshakeOutcome, HandshakeState, Mode};
use crate::connection::Connection;

/// Why [`dispatch`] stopped early.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The connector reported a mode it has no capability for.
    #[error("connector '{connector}' reported mode {mode} but does not implement it")]
    MissingCapability {
        /// Connector name.
        connector: String,
        /// Reported mode.
        mode: Mode,
    },

    /// The handshake failed.
    #[error("handshake of connector '{connector}' failed: {source}")]
    Handshake {
        /// Connector name.
        connector: String,
        /// Underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// A capability returned an error.
    #[error("{mode} handler of connector '{connector}' failed: {source}")]
    Handler {
        /// Connector name.
        connector: String,
        /// Mode whose handler failed.
        mode: Mode,
        /// Underlying error.
        #[source]
        source: anyhow::Error,
    },

    /// The connector's cancellation token fired.
    #[error("connection cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Whether this is a configuration problem rather than a runtime failure.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::MissingCapability { .. })
    }
}

/// Drive `connector` over `conn` until it terminates.
///
/// Runs the handshake once if the connector has one, then reads the mode
/// before every iteration and calls the matching capability. Returns `Ok`
/// on [`Mode::Terminate`] or an orderly close during the handshake.
pub async fn dispatch(connector: &mut dyn Connector, conn: &mut Connection) -> Result<(), DispatchError> {
    let cancel = connector.cancellation();
    let name = connector.name().to_string();
    let mut state = HandshakeState::empty();

    if let Some(handshaker) = connector.as_handshaker() {
        let outcome = until_cancelled(&cancel, handshaker.handshake(conn))
            .await?
            .map_err(|source| DispatchError::Handshake {
                connector: name.clone(),
                source,
            })?;
        match outcome {
            HandshakeOutcome::Established(established) => state = established,
            HandshakeOutcome::Closed => {
                log::debug!("Peer {} closed during handshake of {}", conn.peer_addr(), name);
                return Ok(());
            }
        }
    }

    let mut previous: Option<Mode> = None;
    loop {
        let mode = connector.mode();
        if previous != Some(mode) {
            log::debug!("Connector {} for {} entering {} mode", name, conn.peer_addr(), mode);
            previous = Some(mode);
        }

        let missing = || DispatchError::MissingCapability {
            connector: name.clone(),
            mode,
        };

        let result = match mode {
            Mode::Terminate => return Ok(()),
            Mode::Service => {
                let capability = connector.as_service().ok_or_else(missing)?;
                until_cancelled(&cancel, capability.handle_service(conn, &mut state)).await?
            }
            Mode::Director => {
                let capability = connector.as_director().ok_or_else(missing)?;
                until_cancelled(&cancel, capability.dial_container(conn, &mut state)).await?
            }
            Mode::Scripter => {
                let capability = connector.as_scripter().ok_or_else(missing)?;
                until_cancelled(&cancel, capability.handle_scripter(conn, &mut state)).await?
            }
        };

        result.map_err(|source| DispatchError::Handler {
            connector: name.clone(),
            mode,
            source,
        })?;
    }
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    future: impl Future<Output = T>,
) -> Result<T, DispatchError> {
    tokio::select! {
        () = cancel.cancelled() => Err(DispatchError::Cancelled),
        output = future => Ok(output),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::connection::tests::pipe;
    use crate::connector::{
        BaseConnector, ConnectorSettings, ScripterConnector, ServiceConnector, Handshaker,
    };

    /// Scripted test connector: each service call pops the next mode.
    #[derive(Debug)]
    struct Scripted {
        base: BaseConnector,
        provides_service: bool,
        handshake: Option<bool>,
        next_modes: Vec<Mode>,
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Scripted {
        fn new(mode: Mode) -> Self {
            Self {
                base: BaseConnector::new("scripted", mode, ConnectorSettings::default()),
                provides_service: true,
                handshake: None,
                next_modes: Vec::new(),
                calls: Arc::new(AtomicUsize::new(0)),
                fail: false,
            }
        }
    }

    impl Connector for Scripted {
        fn base(&self) -> &BaseConnector {
            &self.base
        }

        fn base_mut(&mut self) -> &mut BaseConnector {
            &mut self.base
        }

        fn as_handshaker(&mut self) -> Option<&mut dyn Handshaker> {
            if self.handshake.is_some() {
                Some(self)
            } else {
                None
            }
        }

        fn as_service(&mut self) -> Option<&mut dyn ServiceConnector> {
            if self.provides_service {
                Some(self)
            } else {
                None
            }
        }
    }

    #[async_trait]
    impl Handshaker for Scripted {
        async fn handshake(&mut self, conn: &mut Connection) -> anyhow::Result<HandshakeOutcome> {
            if self.handshake == Some(false) {
                return Ok(HandshakeOutcome::Closed);
            }
            conn.write_all(b"banner\n").await?;
            Ok(HandshakeOutcome::Established(HandshakeState::new(7u32)))
        }
    }

    #[async_trait]
    impl ServiceConnector for Scripted {
        async fn handle_service(
            &mut self,
            conn: &mut Connection,
            state: &mut HandshakeState,
        ) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                anyhow::bail!("broken pipe");
            }
            if let Some(n) = state.get_mut::<u32>() {
                *n += 1;
                conn.write_all(format!("{n}\n").as_bytes()).await?;
            }
            let next = self.next_modes.pop().unwrap_or(Mode::Terminate);
            self.set_mode(next);
            Ok(())
        }
    }

    #[derive(Debug)]
    struct Hanging(BaseConnector);

    impl Connector for Hanging {
        fn base(&self) -> &BaseConnector {
            &self.0
        }

        fn base_mut(&mut self) -> &mut BaseConnector {
            &mut self.0
        }

        fn as_scripter(&mut self) -> Option<&mut dyn ScripterConnector> {
            Some(self)
        }
    }

    #[async_trait]
    impl ScripterConnector for Hanging {
        async fn handle_scripter(
            &mut self,
            _conn: &mut Connection,
            _state: &mut HandshakeState,
        ) -> anyhow::Result<()> {
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_terminate_invokes_nothing() {
        let (mut conn, _client) = pipe("10.0.0.9:1234");
        let mut connector = Scripted::new(Mode::Terminate);
        let calls = Arc::clone(&connector.calls);

        dispatch(&mut connector, &mut conn).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_capability_is_configuration_error() {
        let (mut conn, _client) = pipe("10.0.0.9:1234");
        let mut connector = Scripted::new(Mode::Service);
        connector.provides_service = false;

        let err = dispatch(&mut connector, &mut conn).await.unwrap_err();
        assert!(err.is_configuration());
        assert!(matches!(err, DispatchError::MissingCapability { mode: Mode::Service, .. }));
    }

    #[tokio::test]
    async fn test_missing_capability_after_mode_change() {
        let (mut conn, _client) = pipe("10.0.0.9:1234");
        let mut connector = Scripted::new(Mode::Service);
        connector.next_modes = vec![Mode::Director];

        let err = dispatch(&mut connector, &mut conn).await.unwrap_err();
        assert!(matches!(err, DispatchError::MissingCapability { mode: Mode::Director, .. }));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_loops_until_terminate() {
        let (mut conn, _client) = pipe("10.0.0.9:1234");
        let mut connector = Scripted::new(Mode::Service);
        connector.next_modes = vec![Mode::Service, Mode::Service];

        dispatch(&mut connector, &mut conn).await.unwrap();
        assert_eq!(connector.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_handshake_state_is_carried() {
        let (mut conn, mut client) = pipe("10.0.0.9:1234");
        let mut connector = Scripted::new(Mode::Service);
        connector.handshake = Some(true);
        connector.next_modes = vec![Mode::Service];

        dispatch(&mut connector, &mut conn).await.unwrap();
        drop(conn);

        let mut out = String::new();
        client.read_to_string(&mut out).await.unwrap();
        assert_eq!(out, "banner\n8\n9\n");
    }

    #[tokio::test]
    async fn test_closed_handshake_is_success() {
        let (mut conn, _client) = pipe("10.0.0.9:1234");
        let mut connector = Scripted::new(Mode::Service);
        connector.handshake = Some(false);

        dispatch(&mut connector, &mut conn).await.unwrap();
        assert_eq!(connector.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_handler_error_propagates() {
        let (mut conn, _client) = pipe("10.0.0.9:1234");
        let mut connector = Scripted::new(Mode::Service);
        connector.fail = true;

        let err = dispatch(&mut connector, &mut conn).await.unwrap_err();
        assert!(!err.is_configuration());
        assert!(err.to_string().contains("broken pipe"));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_stops_hung_handler() {
        let (mut conn, _client) = pipe("10.0.0.9:1234");
        let cancel = CancellationToken::new();
        let settings = ConnectorSettings {
            cancel: cancel.clone(),
            ..ConnectorSettings::default()
        };
        let mut connector = Hanging(BaseConnector::new("hanging", Mode::Scripter, settings));

        let task = tokio::spawn(async move { dispatch(&mut connector, &mut conn).await });
        cancel.cancel();
        let result = task.await.unwrap();
        assert!(matches!(result, Err(DispatchError::Cancelled)));
    }
}
