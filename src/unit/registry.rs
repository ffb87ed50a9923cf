/// Implementation registry
///
/// Maps implementation names to the interface able to execute them. Built
/// once at process start and handed to the executor and the isolated runner;
/// there is no process-wide registry.
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{EngineError, Result};
use crate::unit::{ImplementationId, Inputs, Interface, UnitOfWork};

#[derive(Clone)]
struct Registered {
    version: String,
    interface: Arc<dyn Interface>,
}

#[derive(Clone, Default)]
pub struct ImplementationRegistry {
    implementations: HashMap<String, Registered>,
}

impl ImplementationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the current version of an implementation.
    ///
    /// Returns the version that was previously registered under `name`.
    pub fn register(
        &mut self,
        name: impl Into<String>,
        version: impl Into<String>,
        interface: Arc<dyn Interface>,
    ) -> Option<String> {
        let name = name.into();
        let version = version.into();
        tracing::debug!(implementation = %name, version = %version, "registered implementation");
        self.implementations
            .insert(name, Registered { version, interface })
            .map(|previous| previous.version)
    }

    /// Builder-style [`register`](Self::register)
    pub fn with(
        mut self,
        name: impl Into<String>,
        version: impl Into<String>,
        interface: Arc<dyn Interface>,
    ) -> Self {
        self.register(name, version, interface);
        self
    }

    /// Current identifier registered under `name`
    pub fn current(&self, name: &str) -> Option<ImplementationId> {
        self.implementations
            .get(name)
            .map(|r| ImplementationId::new(name, r.version.clone()))
    }

    /// Resolve an exact identifier; a registered name with a different
    /// version does not match.
    pub fn resolve(&self, id: &ImplementationId) -> Result<Arc<dyn Interface>> {
        match self.implementations.get(&id.name) {
            Some(registered) if registered.version == id.version => {
                Ok(Arc::clone(&registered.interface))
            }
            _ => Err(EngineError::UnknownImplementation(id.to_string())),
        }
    }

    /// Build a unit of work for the current version of `name`
    pub fn instantiate(&self, name: &str, inputs: Inputs) -> Result<UnitOfWork> {
        let id = self
            .current(name)
            .ok_or_else(|| EngineError::UnknownImplementation(name.to_string()))?;
        self.rehydrate(id, inputs)
    }

    /// Rebuild a unit of work for an exact identifier
    pub fn rehydrate(&self, id: ImplementationId, inputs: Inputs) -> Result<UnitOfWork> {
        let interface = self.resolve(&id)?;
        UnitOfWork::new(id, interface, inputs)
    }

    /// Registered identifiers, sorted
    pub fn ids(&self) -> Vec<ImplementationId> {
        let mut ids: Vec<_> = self
            .implementations
            .iter()
            .map(|(name, r)| ImplementationId::new(name.clone(), r.version.clone()))
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.implementations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.implementations.is_empty()
    }
}

impl std::fmt::Debug for ImplementationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.ids()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::{ExecutionContext, Outputs};

    struct Noop;

    impl Interface for Noop {
        fn execute(&self, _inputs: &Inputs, _ctx: &ExecutionContext) -> anyhow::Result<Outputs> {
            Ok(Outputs::new())
        }
    }

    #[test]
    fn test_resolve_exact_version() {
        let registry = ImplementationRegistry::new().with("noop", "1", Arc::new(Noop));

        assert!(registry.resolve(&ImplementationId::new("noop", "1")).is_ok());

        let err = registry
            .resolve(&ImplementationId::new("noop", "2"))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::UnknownImplementation(ref id) if id == "noop@2"));

        assert!(registry
            .resolve(&ImplementationId::new("missing", "1"))
            .is_err());
    }

    #[test]
    fn test_register_replaces_version() {
        let mut registry = ImplementationRegistry::new();
        assert_eq!(registry.register("noop", "1", Arc::new(Noop)), None);
        assert_eq!(
            registry.register("noop", "2", Arc::new(Noop)),
            Some("1".to_string())
        );
        assert_eq!(
            registry.current("noop"),
            Some(ImplementationId::new("noop", "2"))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_instantiate_uses_current_version() {
        let registry = ImplementationRegistry::new().with("noop", "3", Arc::new(Noop));
        let unit = registry.instantiate("noop", Inputs::new()).unwrap();
        assert_eq!(unit.implementation().version, "3");
        assert!(registry.instantiate("other", Inputs::new()).is_err());
    }
}
