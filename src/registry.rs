//! Name -> factory lookup tables.
//!
//! Connector and scripter kinds are registered explicitly at startup into a
//! [`Registry`] that is then passed to whoever builds instances. Nothing is
//! registered through global state.

use std::collections::BTreeMap;

use anyhow::{bail, Result};

/// Factories keyed by kind name.
pub struct Registry<F> {
    what: &'static str,
    factories: BTreeMap<String, F>,
}

impl<F> std::fmt::Debug for Registry<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("what", &self.what)
            .field("names", &self.names())
            .finish()
    }
}

impl<F> Registry<F> {
    /// Empty registry; `what` names the registered things in error messages.
    pub fn new(what: &'static str) -> Self {
        Self {
            what,
            factories: BTreeMap::new(),
        }
    }

    /// Register `factory` under `name`, returning the factory it replaced.
    pub fn register(&mut self, name: impl Into<String>, factory: F) -> Option<F> {
        let name = name.into();
        let previous = self.factories.insert(name.clone(), factory);
        if previous.is_some() {
            log::warn!("Replaced {} factory '{}'", self.what, name);
        }
        previous
    }

    /// Factory registered under `name`.
    pub fn get(&self, name: &str) -> Option<&F> {
        self.factories.get(name)
    }

    /// Factory registered under `name`, or an error listing what exists.
    pub fn require(&self, name: &str) -> Result<&F> {
        match self.factories.get(name) {
            Some(factory) => Ok(factory),
            None => bail!(
                "unknown {} '{}' (available: {})",
                self.what,
                name,
                self.names().join(", ")
            ),
        }
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_lookup() {
        let mut registry: Registry<u32> = Registry::new("widget");
        assert!(registry.register("b", 2).is_none());
        assert!(registry.register("a", 1).is_none());

        assert_eq!(registry.get("a"), Some(&1));
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert_eq!(registry.register("a", 10), Some(1));
    }

    #[test]
    fn test_require_lists_available() {
        let mut registry: Registry<u32> = Registry::new("widget");
        registry.register("telnet", 1);

        let err = registry.require("ssh").unwrap_err().to_string();
        assert!(err.contains("unknown widget 'ssh'"));
        assert!(err.contains("telnet"));
    }
}
