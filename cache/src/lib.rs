//! Payload caches keyed by opaque identifiers.
//!
//! A [`CacheManager`] maps `identifier → (revision, payload)`. Request
//! promises use the revision to decide whether a server response is new and
//! fall back to the payload when offline.
//!
//! Two managers are provided:
//!
//! - [`FileSystemCacheManager`] persists entries on disk with a size limit.
//! - [`MemoryCacheManager`] keeps entries in memory for tests and short-lived
//!   processes.
//!
//! Identifiers beginning with `__` are reserved for internal use and are
//! rejected by both managers.

mod atomic_write;
mod filesystem;
mod memory;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use filesystem::{DEFAULT_MAX_CACHE_SIZE, FileSystemCacheManager, METADATA_VERSION};
pub use memory::MemoryCacheManager;

/// Prefix of identifiers reserved for internal bookkeeping.
pub const RESERVED_PREFIX: &str = "__";

/// Failures reported by cache managers.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache identifier {0:?} uses the reserved `__` prefix")]
    ReservedIdentifier(String),

    #[error("cache I/O failed at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("cache metadata at {} is corrupt: {message}", path.display())]
    CorruptMetadata { path: PathBuf, message: String },

    #[error("entry of {size} bytes exceeds the cache limit of {max} bytes")]
    EntryTooLarge { size: u64, max: u64 },

    /// A payload was expected for `identifier` but none is stored.
    #[error("no payload is cached for {identifier:?}")]
    MissingPayload { identifier: String },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Storage for revisioned payloads.
///
/// Implementations are shared between threads and must synchronize
/// internally. Methods may block on I/O; call them from worker threads.
pub trait CacheManager: Send + Sync {
    /// The revision stored for `identifier`, if there is a readable entry.
    fn revision_for_identifier(&self, identifier: &str) -> Option<String>;

    /// Store `data` under `identifier`, replacing any previous entry.
    fn cache_data(&self, data: &[u8], identifier: &str, revision: &str) -> Result<(), CacheError>;

    /// The payload stored for `identifier`. `Ok(None)` means no entry.
    fn cached_data_for_identifier(&self, identifier: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Drop the entry for `identifier`. Removing a missing entry succeeds.
    fn remove_cache_for_identifier(&self, identifier: &str) -> Result<(), CacheError>;

    fn remove_all_cache(&self) -> Result<(), CacheError>;
}

/// Reject identifiers in the reserved namespace.
pub fn check_identifier(identifier: &str) -> Result<(), CacheError> {
    if identifier.starts_with(RESERVED_PREFIX) {
        return Err(CacheError::ReservedIdentifier(identifier.to_string()));
    }
    Ok(())
}
