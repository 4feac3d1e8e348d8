use std::collections::BTreeMap;

use crate::definition::Protocol;
use crate::error::{QueryError, Result};
use crate::games;

/// Builds a fresh definition instance
pub type Constructor = fn() -> Protocol;

/// Id → constructor table
///
/// Every lookup builds a new instance, so per-server state (challenge token,
/// bound target) is never shared between servers or runs.
#[derive(Debug, Clone)]
pub struct Registry {
    constructors: BTreeMap<String, Constructor>,
}

impl Registry {
    /// An empty registry
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
        }
    }

    /// A registry holding every bundled definition
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for (name, constructor) in games::builtin() {
            registry.register(name, constructor);
        }
        registry
    }

    /// Adds or replaces a definition
    pub fn register(&mut self, name: impl Into<String>, constructor: Constructor) {
        self.constructors.insert(name.into().to_lowercase(), constructor);
    }

    pub fn create(&self, name: &str) -> Result<Protocol> {
        self.constructors
            .get(&name.to_lowercase())
            .map(|constructor| constructor())
            .ok_or_else(|| QueryError::UnknownProtocol(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.constructors.contains_key(&name.to_lowercase())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.constructors.keys().map(String::as_str)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
