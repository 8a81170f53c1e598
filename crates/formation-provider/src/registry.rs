//! Name-to-factory plugin registries.
//!
//! Collaborators are selected by string name at configuration time; the
//! registry maps a (case-insensitive) name to a factory producing a
//! shared plugin instance. An unknown name is an explicit error.

use std::collections::HashMap;
use std::sync::Arc;

use crate::capability::{DnsProvider, LoadBalancer, Provider};
use crate::error::RegistryError;
use crate::stub::{StubBalancer, StubDns, StubProvider};

type Factory<T> = Box<dyn Fn() -> Arc<T> + Send + Sync>;

/// A registry of plugin factories for one capability interface.
pub struct Registry<T: ?Sized> {
    kind: &'static str,
    factories: HashMap<String, Factory<T>>,
}

impl<T: ?Sized> Registry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            factories: HashMap::new(),
        }
    }

    /// Register a factory under a name. Names are case-insensitive;
    /// re-registering replaces the previous factory.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn() -> Arc<T> + Send + Sync + 'static,
    {
        self.factories
            .insert(name.to_lowercase(), Box::new(factory));
    }

    /// Produce the plugin registered under `name`.
    pub fn resolve(&self, name: &str) -> Result<Arc<T>, RegistryError> {
        self.factories
            .get(&name.to_lowercase())
            .map(|factory| factory())
            .ok_or_else(|| RegistryError {
                kind: self.kind,
                name: name.to_string(),
            })
    }

    /// Registered plugin names.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl<T: ?Sized> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("kind", &self.kind)
            .field("names", &self.names())
            .finish()
    }
}

/// The built-in provider registry.
pub fn builtin_providers() -> Registry<dyn Provider> {
    let mut registry = Registry::new("provider");
    registry.register("stub", || Arc::new(StubProvider::new()) as Arc<dyn Provider>);
    registry
}

/// The built-in load-balancer registry.
pub fn builtin_balancers() -> Registry<dyn LoadBalancer> {
    let mut registry = Registry::new("load balancer");
    registry.register("stub", || {
        Arc::new(StubBalancer::new()) as Arc<dyn LoadBalancer>
    });
    registry
}

/// The built-in DNS registry.
pub fn builtin_dns() -> Registry<dyn DnsProvider> {
    let mut registry = Registry::new("dns");
    registry.register("stub", || Arc::new(StubDns::new()) as Arc<dyn DnsProvider>);
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_is_case_insensitive() {
        let registry = builtin_providers();
        assert_eq!(registry.resolve("stub").unwrap().name(), "stub");
        assert_eq!(registry.resolve("Stub").unwrap().name(), "stub");
        assert_eq!(registry.resolve("STUB").unwrap().name(), "stub");
    }

    #[test]
    fn unknown_name_is_an_explicit_error() {
        let registry = builtin_providers();
        let err = registry.resolve("rackspace").err().unwrap();
        assert_eq!(err.kind, "provider");
        assert_eq!(err.name, "rackspace");
        assert!(err.to_string().contains("rackspace"));
    }

    #[test]
    fn registration_replaces_and_lists() {
        let mut registry: Registry<dyn Provider> = Registry::new("provider");
        registry.register("a", || Arc::new(StubProvider::new()) as Arc<dyn Provider>);
        registry.register("B", || Arc::new(StubProvider::new()) as Arc<dyn Provider>);
        assert_eq!(registry.names(), vec!["a", "b"]);
        assert!(registry.resolve("b").is_ok());
    }
}
