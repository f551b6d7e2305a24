//! Process wiring: builds the runtime from a [`Config`] and runs it.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::abtest::AbTester;
use crate::config::Config;
use crate::connector::{
    with_cancellation, with_config, with_events, with_mode, with_scripter, ConnectorOption,
    ConnectorRegistry,
};
use crate::event::{LogSink, SharedEventSink};
use crate::listener::{ConnectorBuilder, Listener, ManagementServer, Routing};
use crate::scripter::{self, ScriptManager, Scripter, ScripterRegistry, ScripterSettings};

/// A configured, not yet running honeypot.
#[derive(Debug)]
pub struct App {
    config: Config,
    abtester: Arc<AbTester>,
    scripter: Arc<dyn Scripter>,
    events: SharedEventSink,
    connectors: Arc<ConnectorRegistry>,
}

impl App {
    /// Build with the built-in connector kinds and events logged as JSON.
    pub fn from_config(config: Config) -> Result<Self> {
        Self::with_parts(config, ConnectorRegistry::with_defaults(), Arc::new(LogSink))
    }

    /// Build with an explicit connector registry and event sink.
    ///
    /// Opens storage, imports the configured A/B file unless its content
    /// was imported before, creates the scripter
    /// and initialises every configured service. A service that fails to
    /// load stops startup.
    pub fn with_parts(config: Config, connectors: ConnectorRegistry, events: SharedEventSink) -> Result<Self> {
        let storage = config.open_storage()?;
        let abtester = Arc::new(
            AbTester::namespace(storage.as_ref(), &config.abtester.namespace)
                .context("Failed to open A/B store")?,
        );

        if let Some(file) = &config.abtester.file {
            if let Err(e) = abtester.load_from_file_once(file) {
                log::warn!("A/B import from {} incomplete: {}", file.display(), e);
            }
        }

        let scripter = ScripterRegistry::with_defaults().build(
            &config.scripter.kind,
            ScripterSettings {
                name: config.scripter.name.clone(),
                folder: config.scripter.folder.clone(),
                abtester: Some(Arc::clone(&abtester)),
                events: Some(Arc::clone(&events)),
                idle_timeout: config.idle_timeout(),
            },
        )?;

        for service in &config.scripter.services {
            scripter
                .init(service)
                .with_context(|| format!("Failed to initialise scripts for service '{service}'"))?;
        }

        for connector in &config.connectors {
            connectors.require(&connector.kind)?;
        }

        Ok(Self {
            config,
            abtester,
            scripter,
            events,
            connectors: Arc::new(connectors),
        })
    }

    pub fn scripter(&self) -> &Arc<dyn Scripter> {
        &self.scripter
    }

    pub fn abtester(&self) -> &Arc<AbTester> {
        &self.abtester
    }

    /// Connector routing described by the configuration.
    pub fn routing(&self) -> Routing {
        let mut routing = Routing::new(self.config.sniff_timeout());

        for connector in &self.config.connectors {
            let registry = Arc::clone(&self.connectors);
            let scripter = Arc::clone(&self.scripter);
            let events = Arc::clone(&self.events);
            let entry = connector.clone();

            let build: ConnectorBuilder = Arc::new(move |cancel| {
                let mut options: Vec<ConnectorOption> = vec![
                    with_config(entry.options.clone()),
                    with_cancellation(cancel),
                    with_events(Arc::clone(&events)),
                    with_scripter(Arc::clone(&scripter)),
                ];
                if let Some(mode) = entry.mode {
                    options.push(with_mode(mode));
                }
                registry.build(&entry.kind, &entry.name, options)
            });
            routing = routing.connector(connector.name.clone(), build);
        }

        if let Some(fallback) = &self.config.fallback_connector {
            routing = routing.fallback(fallback.clone());
        }
        routing
    }

    /// Run until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let reload = scripter::spawn_reload_task(
            Arc::clone(&self.scripter),
            self.config.reload_interval(),
            shutdown.child_token(),
        );

        let management = match &self.config.management {
            Some(addr) => {
                let manager = Arc::new(ScriptManager::new(
                    self.config.scripter.folder.clone(),
                    vec![Arc::clone(&self.scripter)],
                ));
                Some(ManagementServer::start(addr, manager, shutdown.child_token()).await?)
            }
            None => None,
        };

        let listener = Listener::start(&self.config.listen, self.routing(), shutdown.child_token()).await?;
        listener.join().await;

        if let Some(management) = management {
            management.join().await;
        }
        if let Err(e) = reload.await {
            log::error!("Reload task failed: {}", e);
        }
        log::info!("Shut down");
        Ok(())
    }
}
