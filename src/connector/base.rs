//! Shared connector state and construction options.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use super::Mode;
use crate::event::{Event, SharedEventSink};
use crate::scripter::Scripter;
use crate::service::{Director, Service};

/// Everything a connector factory receives.
#[derive(Debug, Default)]
pub struct ConnectorSettings {
    /// Instance name.
    pub name: String,
    /// Connector-specific options, decoded by the factory.
    pub config: serde_json::Value,
    /// Initial mode; factories pick their own default when unset.
    pub mode: Option<Mode>,
    pub cancel: CancellationToken,
    pub events: Option<SharedEventSink>,
    pub service: Option<Arc<dyn Service>>,
    pub director: Option<Arc<dyn Director>>,
    pub scripter: Option<Arc<dyn Scripter>>,
}

impl ConnectorSettings {
    /// Settings for `name` with every option applied in order.
    pub fn apply(name: impl Into<String>, options: Vec<ConnectorOption>) -> Result<Self> {
        let mut settings = Self {
            name: name.into(),
            ..Self::default()
        };
        for option in options {
            option(&mut settings)?;
        }
        Ok(settings)
    }

    /// Decode the connector-specific options; `null` yields the default.
    pub fn decode_config<T: DeserializeOwned + Default>(&self) -> Result<T> {
        if self.config.is_null() {
            return Ok(T::default());
        }
        serde_json::from_value(self.config.clone())
            .with_context(|| format!("invalid options for connector '{}'", self.name))
    }
}

/// One construction option.
pub type ConnectorOption = Box<dyn FnOnce(&mut ConnectorSettings) -> Result<()> + Send>;

/// Connector-specific options.
pub fn with_config(config: serde_json::Value) -> ConnectorOption {
    Box::new(move |s| {
        if !(config.is_object() || config.is_null()) {
            anyhow::bail!("connector options for '{}' must be an object", s.name);
        }
        s.config = config;
        Ok(())
    })
}

pub fn with_mode(mode: Mode) -> ConnectorOption {
    Box::new(move |s| {
        s.mode = Some(mode);
        Ok(())
    })
}

pub fn with_cancellation(cancel: CancellationToken) -> ConnectorOption {
    Box::new(move |s| {
        s.cancel = cancel;
        Ok(())
    })
}

pub fn with_events(events: SharedEventSink) -> ConnectorOption {
    Box::new(move |s| {
        s.events = Some(events);
        Ok(())
    })
}

pub fn with_service(service: Arc<dyn Service>) -> ConnectorOption {
    Box::new(move |s| {
        s.service = Some(service);
        Ok(())
    })
}

pub fn with_director(director: Arc<dyn Director>) -> ConnectorOption {
    Box::new(move |s| {
        s.director = Some(director);
        Ok(())
    })
}

pub fn with_scripter(scripter: Arc<dyn Scripter>) -> ConnectorOption {
    Box::new(move |s| {
        s.scripter = Some(scripter);
        Ok(())
    })
}

/// Identity, mode and collaborators every connector carries.
#[derive(Debug)]
pub struct BaseConnector {
    name: String,
    kind: String,
    mode: Mode,
    cancel: CancellationToken,
    events: Option<SharedEventSink>,
    service: Option<Arc<dyn Service>>,
    director: Option<Arc<dyn Director>>,
    scripter: Option<Arc<dyn Scripter>>,
}

impl BaseConnector {
    /// Take ownership of `settings` for a connector of `kind`, starting in
    /// `default_mode` unless the settings chose one.
    pub fn new(kind: &str, default_mode: Mode, settings: ConnectorSettings) -> Self {
        Self {
            name: settings.name,
            kind: kind.to_string(),
            mode: settings.mode.unwrap_or(default_mode),
            cancel: settings.cancel,
            events: settings.events,
            service: settings.service,
            director: settings.director,
            scripter: settings.scripter,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: Mode) {
        if mode != self.mode {
            log::debug!("Connector {} mode {} -> {}", self.name, self.mode, mode);
        }
        self.mode = mode;
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn service(&self) -> Option<&Arc<dyn Service>> {
        self.service.as_ref()
    }

    pub fn director(&self) -> Option<&Arc<dyn Director>> {
        self.director.as_ref()
    }

    pub fn scripter(&self) -> Option<&Arc<dyn Scripter>> {
        self.scripter.as_ref()
    }

    /// Send `event` if an event sink is configured.
    pub fn emit(&self, event: Event) {
        if let Some(events) = &self.events {
            events.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, serde::Deserialize, PartialEq)]
    #[serde(default)]
    struct Options {
        service: Option<String>,
    }

    #[test]
    fn test_options_apply_in_order() {
        let settings = ConnectorSettings::apply(
            "telnet",
            vec![with_mode(Mode::Service), with_mode(Mode::Terminate)],
        )
        .unwrap();
        assert_eq!(settings.name, "telnet");
        assert_eq!(settings.mode, Some(Mode::Terminate));
    }

    #[test]
    fn test_decode_config() {
        let settings = ConnectorSettings::apply(
            "generic",
            vec![with_config(serde_json::json!({"service": "ftp"}))],
        )
        .unwrap();
        let options: Options = settings.decode_config().unwrap();
        assert_eq!(options.service.as_deref(), Some("ftp"));

        let empty = ConnectorSettings::apply("generic", Vec::new()).unwrap();
        assert_eq!(empty.decode_config::<Options>().unwrap(), Options::default());
    }

    #[test]
    fn test_non_object_config_is_rejected() {
        let err = ConnectorSettings::apply("generic", vec![with_config(serde_json::json!([1, 2]))])
            .unwrap_err();
        assert!(err.to_string().contains("must be an object"));
    }

    #[test]
    fn test_base_defaults_mode() {
        let base = BaseConnector::new("generic", Mode::Scripter, ConnectorSettings::default());
        assert_eq!(base.mode(), Mode::Scripter);
        assert!(base.scripter().is_none());

        let settings = ConnectorSettings::apply("x", vec![with_mode(Mode::Director)]).unwrap();
        let base = BaseConnector::new("generic", Mode::Scripter, settings);
        assert_eq!(base.mode(), Mode::Director);
    }
}
