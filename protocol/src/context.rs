//! State scoped to a single query run

use std::collections::HashMap;

use crate::error::Result;

/// Memo shared by the definitions of one run
///
/// Pre-send hooks that need an expensive lookup (a master list, a port map)
/// store it here instead of in process-wide state, so two runs never see each
/// other's data. The engine creates one per run and drops it afterwards.
#[derive(Debug, Default)]
pub struct RunContext {
    cache: HashMap<String, Vec<u8>>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&[u8]> {
        self.cache.get(key).map(Vec::as_slice)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Vec<u8>) {
        self.cache.insert(key.into(), value);
    }

    /// Returns the cached value for `key`, computing it on first use
    ///
    /// A failed computation is not cached, so the next caller tries again.
    pub fn get_or_try_insert_with<F>(&mut self, key: &str, fetch: F) -> Result<&[u8]>
    where
        F: FnOnce() -> Result<Vec<u8>>,
    {
        if !self.cache.contains_key(key) {
            let value = fetch()?;
            self.cache.insert(key.to_string(), value);
        }
        Ok(self.cache.get(key).map(Vec::as_slice).unwrap_or_default())
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }
}
