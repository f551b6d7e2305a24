//! Connector kinds available to configuration.

use std::sync::Arc;

use anyhow::Result;

use super::{ConnectorOption, ConnectorSettings, Connector, GenericConnector};
use crate::registry::Registry;

/// Builds a connector from its settings.
pub type ConnectorFactory =
    Arc<dyn Fn(ConnectorSettings) -> Result<Box<dyn Connector>> + Send + Sync>;

/// Name -> factory map for connector kinds.
pub type ConnectorRegistry = Registry<ConnectorFactory>;

impl Registry<ConnectorFactory> {
    /// Registry with the built-in connectors.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new("connector");
        registry.register(
            GenericConnector::KIND,
            Arc::new(GenericConnector::boxed) as ConnectorFactory,
        );
        registry
    }

    /// Build a connector of `kind` named `name`.
    pub fn build(
        &self,
        kind: &str,
        name: &str,
        options: Vec<ConnectorOption>,
    ) -> Result<Box<dyn Connector>> {
        let factory = self.require(kind)?;
        let settings = ConnectorSettings::apply(name, options)?;
        factory(settings)
    }
}
