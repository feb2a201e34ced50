use std::collections::HashMap;

use parking_lot::RwLock;

use crate::{CacheError, CacheManager, check_identifier};

#[derive(Debug, Clone)]
struct Entry {
    revision: String,
    data: Vec<u8>,
}

/// A [`CacheManager`] holding entries in memory. Nothing is evicted.
#[derive(Debug, Default)]
pub struct MemoryCacheManager {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCacheManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Total payload bytes held.
    #[must_use]
    pub fn cache_size(&self) -> u64 {
        self.entries.read().values().map(|e| e.data.len() as u64).sum()
    }
}

impl CacheManager for MemoryCacheManager {
    fn revision_for_identifier(&self, identifier: &str) -> Option<String> {
        self.entries
            .read()
            .get(identifier)
            .map(|entry| entry.revision.clone())
    }

    fn cache_data(&self, data: &[u8], identifier: &str, revision: &str) -> Result<(), CacheError> {
        check_identifier(identifier)?;
        self.entries.write().insert(
            identifier.to_string(),
            Entry {
                revision: revision.to_string(),
                data: data.to_vec(),
            },
        );
        Ok(())
    }

    fn cached_data_for_identifier(&self, identifier: &str) -> Result<Option<Vec<u8>>, CacheError> {
        check_identifier(identifier)?;
        Ok(self
            .entries
            .read()
            .get(identifier)
            .map(|entry| entry.data.clone()))
    }

    fn remove_cache_for_identifier(&self, identifier: &str) -> Result<(), CacheError> {
        check_identifier(identifier)?;
        self.entries.write().remove(identifier);
        Ok(())
    }

    fn remove_all_cache(&self) -> Result<(), CacheError> {
        self.entries.write().clear();
        Ok(())
    }
}
