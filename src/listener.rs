//! TCP front doors: the honeypot listener and the management endpoint.
//!
//! The honeypot listener accepts connections, sniffs the first bytes and
//! hands each connection to the first connector that claims it (or the
//! fallback connector), one task per connection. The management endpoint
//! reads newline-delimited JSON requests and answers each with one JSON line.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, PEEK_SIZE};
use crate::connector::{dispatch, Connector, DispatchError};
use crate::scripter::management::ManagementResponse;
use crate::scripter::ScriptManager;

/// Builds a fresh connector instance for one connection.
pub type ConnectorBuilder =
    Arc<dyn Fn(CancellationToken) -> Result<Box<dyn Connector>> + Send + Sync>;

/// How accepted connections are assigned to connectors.
#[derive(Clone)]
pub struct Routing {
    connectors: Vec<(String, ConnectorBuilder)>,
    fallback: Option<String>,
    sniff_timeout: Duration,
}

impl std::fmt::Debug for Routing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.connectors.iter().map(|(n, _)| n.as_str()).collect();
        f.debug_struct("Routing")
            .field("connectors", &names)
            .field("fallback", &self.fallback)
            .field("sniff_timeout", &self.sniff_timeout)
            .finish()
    }
}

impl Routing {
    pub fn new(sniff_timeout: Duration) -> Self {
        Self {
            connectors: Vec::new(),
            fallback: None,
            sniff_timeout,
        }
    }

    /// Add a connector; connectors are asked in the order added.
    #[must_use]
    pub fn connector(mut self, name: impl Into<String>, build: ConnectorBuilder) -> Self {
        self.connectors.push((name.into(), build));
        self
    }

    /// Connector used when no connector claims the first bytes.
    #[must_use]
    pub fn fallback(mut self, name: impl Into<String>) -> Self {
        self.fallback = Some(name.into());
        self
    }

    /// Pick a connector for a connection that started with `payload`.
    ///
    /// Runs script `canHandle` functions synchronously; async callers use
    /// the blocking pool.
    fn select(&self, payload: &[u8], cancel: &CancellationToken) -> Result<Option<Box<dyn Connector>>> {
        for (name, build) in &self.connectors {
            let connector = build(cancel.clone()).with_context(|| format!("building connector '{name}'"))?;
            if connector.can_handle(payload) {
                log::debug!("Connector {} claimed the connection", name);
                return Ok(Some(connector));
            }
        }

        let Some(fallback) = &self.fallback else {
            return Ok(None);
        };
        let Some((_, build)) = self.connectors.iter().find(|(name, _)| name == fallback) else {
            anyhow::bail!("fallback connector '{}' is not configured", fallback);
        };
        build(cancel.clone()).map(Some)
    }
}

/// Accept loop for honeypot traffic.
#[derive(Debug)]
pub struct Listener {
    local_addr: SocketAddr,
    accept_handle: JoinHandle<()>,
}

impl Listener {
    /// Bind `addr` and start accepting. Connection tasks get child tokens of
    /// `cancel`; cancelling it stops the loop and every session.
    pub async fn start(addr: &str, routing: Routing, cancel: CancellationToken) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind listener on {addr}"))?;
        let local_addr = listener.local_addr()?;
        log::info!("Listening on {}", local_addr);

        let accept_handle = tokio::spawn(Self::accept_loop(listener, Arc::new(routing), cancel));
        Ok(Self {
            local_addr,
            accept_handle,
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the accept loop to stop.
    pub async fn join(self) {
        if let Err(e) = self.accept_handle.await {
            log::error!("Listener task failed: {}", e);
        }
    }

    async fn accept_loop(listener: TcpListener, routing: Arc<Routing>, cancel: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                () = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    log::debug!("Accepted connection from {}", peer);
                    let routing = Arc::clone(&routing);
                    let cancel = cancel.child_token();
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, routing, cancel).await {
                            log::warn!("Connection from {} failed: {:#}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    log::error!("Accept error: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
        log::info!("Listener stopped");
    }
}

async fn handle_connection(stream: TcpStream, routing: Arc<Routing>, cancel: CancellationToken) -> Result<()> {
    let mut conn = Connection::from_tcp(stream)?;
    let peer = conn.peer_addr();

    let payload = match tokio::time::timeout(routing.sniff_timeout, conn.peek(PEEK_SIZE)).await {
        Ok(Ok([])) => {
            log::debug!("{} closed before sending anything", peer);
            return Ok(());
        }
        Ok(Ok(bytes)) => bytes.to_vec(),
        Ok(Err(e)) => return Err(e).context("sniffing first bytes"),
        Err(_) => Vec::new(),
    };

    let selected = {
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || routing.select(&payload, &cancel))
            .await
            .context("connector selection panicked")??
    };
    let Some(mut connector) = selected else {
        log::info!("No connector for {}, closing", peer);
        return Ok(());
    };

    match dispatch(connector.as_mut(), &mut conn).await {
        Ok(()) => {
            log::debug!("Session with {} on {} finished", peer, connector.name());
            Ok(())
        }
        Err(DispatchError::Cancelled) => {
            log::debug!("Session with {} cancelled", peer);
            Ok(())
        }
        Err(e) if e.is_configuration() => {
            log::error!("{}", e);
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Newline-delimited JSON endpoint for [`ScriptManager`].
#[derive(Debug)]
pub struct ManagementServer {
    local_addr: SocketAddr,
    accept_handle: JoinHandle<()>,
}

impl ManagementServer {
    pub async fn start(addr: &str, manager: Arc<ScriptManager>, cancel: CancellationToken) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind management endpoint on {addr}"))?;
        let local_addr = listener.local_addr()?;
        log::info!("Management endpoint on {}", local_addr);

        let accept_handle = tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    () = cancel.cancelled() => break,
                    accepted = listener.accept() => accepted,
                };
                match accepted {
                    Ok((stream, peer)) => {
                        let manager = Arc::clone(&manager);
                        let cancel = cancel.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = serve_management(stream, manager, cancel).await {
                                log::warn!("Management client {} failed: {:#}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        log::error!("Management accept error: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });

        Ok(Self {
            local_addr,
            accept_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn join(self) {
        if let Err(e) = self.accept_handle.await {
            log::error!("Management task failed: {}", e);
        }
    }
}

async fn serve_management(stream: TcpStream, manager: Arc<ScriptManager>, cancel: CancellationToken) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut lines = BufReader::new(read).lines();

    loop {
        let line = tokio::select! {
            () = cancel.cancelled() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let manager = Arc::clone(&manager);
        let response = tokio::task::spawn_blocking(move || manager.handle_message(line.as_bytes()))
            .await
            .context("management task panicked")?
            .unwrap_or_else(|e| {
                log::warn!("Management request failed: {:#}", e);
                ManagementResponse::error(format!("{e:#}"))
            });

        let mut reply = serde_json::to_vec(&response)?;
        reply.push(b'\n');
        write.write_all(&reply).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::{with_cancellation, with_scripter, ConnectorSettings, GenericConnector};
    use crate::scripter::{LuaScripter, Scripter};
    use tokio::io::AsyncReadExt;

    fn scripter_with(tmp: &tempfile::TempDir, source: &str) -> Arc<dyn Scripter> {
        let dir = tmp.path().join("lua").join("generic");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("echo.lua"), source).unwrap();
        let scripter = LuaScripter::new("lua", tmp.path());
        scripter.init("generic").unwrap();
        Arc::new(scripter)
    }

    fn echo_scripter(tmp: &tempfile::TempDir) -> Arc<dyn Scripter> {
        scripter_with(tmp, "function handle(m) return m end")
    }

    fn generic_builder(scripter: Arc<dyn Scripter>) -> ConnectorBuilder {
        Arc::new(move |cancel| {
            let settings = ConnectorSettings::apply(
                "generic",
                vec![with_scripter(Arc::clone(&scripter)), with_cancellation(cancel)],
            )?;
            GenericConnector::boxed(settings)
        })
    }

    #[tokio::test]
    async fn test_fallback_connector_echoes() {
        let tmp = tempfile::TempDir::new().unwrap();
        let routing = Routing::new(Duration::from_millis(200))
            .connector("generic", generic_builder(echo_scripter(&tmp)))
            .fallback("generic");
        let cancel = CancellationToken::new();
        let listener = Listener::start("127.0.0.1:0", routing, cancel.clone()).await.unwrap();

        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        cancel.cancel();
        listener.join().await;
    }

    #[tokio::test]
    async fn test_unclaimed_connection_is_closed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let routing = Routing::new(Duration::from_millis(200))
            .connector("generic", generic_builder(echo_scripter(&tmp)));
        let cancel = CancellationToken::new();
        let listener = Listener::start("127.0.0.1:0", routing, cancel.clone()).await.unwrap();

        let mut client = TcpStream::connect(listener.local_addr()).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut rest = Vec::new();
        client.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_slow_sniff_does_not_stall_other_connections() {
        let tmp = tempfile::TempDir::new().unwrap();
        let scripter = scripter_with(
            &tmp,
            "function canHandle(m)\n\
               if m == 'slow' then\n\
                 local deadline = os.clock() + 2\n\
                 while os.clock() < deadline do end\n\
               end\n\
               return m == 'fast'\n\
             end\n\
             function handle(m) return m end\n",
        );
        let routing = Routing::new(Duration::from_millis(200)).connector("generic", generic_builder(scripter));
        let cancel = CancellationToken::new();
        let listener = Listener::start("127.0.0.1:0", routing, cancel.clone()).await.unwrap();

        let mut slow = TcpStream::connect(listener.local_addr()).await.unwrap();
        slow.write_all(b"slow").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let mut fast = TcpStream::connect(listener.local_addr()).await.unwrap();
        fast.write_all(b"fast").await.unwrap();
        let mut buf = [0u8; 4];
        tokio::time::timeout(Duration::from_secs(1), fast.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"fast");

        drop(slow);
        cancel.cancel();
        listener.join().await;
    }

    #[tokio::test]
    async fn test_management_round_trip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let scripter = echo_scripter(&tmp);
        let manager = Arc::new(ScriptManager::new(tmp.path(), vec![scripter]));
        let cancel = CancellationToken::new();
        let server = ManagementServer::start("127.0.0.1:0", manager, cancel.clone()).await.unwrap();

        let stream = TcpStream::connect(server.local_addr()).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"{\"action\":\"script_read\",\"dir\":\"lua\"}\n").await.unwrap();
        let reply: serde_json::Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["type"], "scripts");
        assert_eq!(reply["data"][0]["path"], "lua/generic/echo.lua");

        write.write_all(b"{\"action\":\"script_delete\",\"path\":\"../x\"}\n").await.unwrap();
        let reply: serde_json::Value =
            serde_json::from_str(&lines.next_line().await.unwrap().unwrap()).unwrap();
        assert_eq!(reply["type"], "error");

        cancel.cancel();
        server.join().await;
    }
}
