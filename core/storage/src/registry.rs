//! Backend registry for resolving execution orders by name.

use std::collections::HashMap;
use std::sync::Arc;

use lodestar_common::{Error, Result};

use crate::backend::Backend;

/// Registry of named backends.
///
/// Execution orders refer to backends by name; the registry turns those
/// names back into adapters.
#[derive(Default, Clone)]
pub struct BackendRegistry {
    backends: HashMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            backends: HashMap::new(),
        }
    }

    /// Register a backend under its own name.
    ///
    /// # Errors
    /// - Returns error if the name is already registered
    pub fn register(&mut self, backend: Arc<dyn Backend>) -> Result<()> {
        let name = backend.name().to_string();
        if self.backends.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Backend '{}' is already registered",
                name
            )));
        }
        self.backends.insert(name, backend);
        Ok(())
    }

    /// Resolve a backend by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Backend>> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| Error::UnknownBackend(name.to_string()))
    }

    /// Resolve every name of an execution order, keeping its order.
    pub fn resolve_order(&self, names: &[String]) -> Result<Vec<Arc<dyn Backend>>> {
        names.iter().map(|name| self.resolve(name)).collect()
    }

    /// Get list of registered backend names.
    pub fn backends(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    /// Check if a backend is registered.
    pub fn has_backend(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.backends())
            .finish()
    }
}
