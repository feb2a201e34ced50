//! Persistent cache manager backed by a directory tree.
//!
//! Layout, keyed by the SHA-256 of the identifier:
//! - `{dir}/{first2}/{keyhex}.json`: entry metadata
//! - `{dir}/{first2}/{keyhex}.bin`: payload
//!
//! Both files are written atomically (temp + rename), payload first. The
//! cache keeps an in-memory index of entry sizes in store order and evicts
//! the least recently stored entries when a write would exceed the limit.
//!
//! The index lock also orders file access: lookups read both files under a
//! shared guard, while stores, evictions and removals hold it exclusively.
//! A reader therefore never pairs one write's metadata with another's
//! payload.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::atomic_write::atomic_write;
use crate::{CacheError, CacheManager, check_identifier};

/// Current metadata format version. Entries with another version are
/// treated as absent and deleted.
pub const METADATA_VERSION: u32 = 1;

/// Default size limit: 30 MiB.
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 30 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryMetadata {
    version: u32,
    identifier: String,
    revision: String,
    /// Seconds since the Unix epoch.
    stored_at: u64,
    size: u64,
}

/// Outcome of reading an entry's metadata.
#[derive(Debug)]
enum Lookup {
    Current(EntryMetadata),
    /// Written with another metadata version.
    Stale,
    Absent,
}

#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    /// Store order; lower is older.
    sequence: u64,
    size: u64,
}

#[derive(Debug, Default)]
struct Index {
    entries: HashMap<String, IndexEntry>,
    next_sequence: u64,
}

impl Index {
    fn total(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }

    fn record(&mut self, key: String, size: u64) {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.insert(key, IndexEntry { sequence, size });
    }
}

/// A [`CacheManager`] that persists entries under a directory.
pub struct FileSystemCacheManager {
    dir: PathBuf,
    max_cache_size: AtomicU64,
    index: RwLock<Index>,
}

impl FileSystemCacheManager {
    /// Open (creating if needed) a cache rooted at `dir` with the default
    /// size limit.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        Self::with_max_size(dir, DEFAULT_MAX_CACHE_SIZE)
    }

    pub fn with_max_size(dir: impl Into<PathBuf>, max_cache_size: u64) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, e))?;

        let manager = Self {
            index: RwLock::new(scan_entries(&dir)),
            dir,
            max_cache_size: AtomicU64::new(max_cache_size),
        };
        tracing::debug!(
            dir = %manager.dir.display(),
            entries = manager.index.read().entries.len(),
            "Opened file system cache"
        );
        Ok(manager)
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn max_cache_size(&self) -> u64 {
        self.max_cache_size.load(Ordering::Relaxed)
    }

    /// Change the size limit. It is enforced on the next write.
    pub fn set_max_cache_size(&self, max: u64) {
        self.max_cache_size.store(max, Ordering::Relaxed);
    }

    /// Estimated bytes on disk, metadata included.
    #[must_use]
    pub fn cache_size(&self) -> u64 {
        self.index.read().total()
    }

    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.index.read().entries.len()
    }

    fn metadata_path(&self, key: &str) -> PathBuf {
        self.shard(key).join(format!("{key}.json"))
    }

    fn payload_path(&self, key: &str) -> PathBuf {
        self.shard(key).join(format!("{key}.bin"))
    }

    fn shard(&self, key: &str) -> PathBuf {
        let prefix = key.get(..2).unwrap_or("00");
        self.dir.join(prefix)
    }

    /// Read metadata for `key`. Callers hold the index lock.
    fn lookup(&self, key: &str, identifier: &str) -> Result<Lookup, CacheError> {
        let path = self.metadata_path(key);
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Lookup::Absent),
            Err(e) => return Err(CacheError::io(path, e)),
        };

        let metadata: EntryMetadata =
            serde_json::from_slice(&content).map_err(|e| CacheError::CorruptMetadata {
                path: path.clone(),
                message: e.to_string(),
            })?;

        if metadata.version != METADATA_VERSION {
            return Ok(Lookup::Stale);
        }
        if metadata.identifier != identifier {
            // Hash collision; the slot belongs to another identifier.
            return Ok(Lookup::Absent);
        }
        Ok(Lookup::Current(metadata))
    }

    /// Delete an entry left by another metadata version, unless a writer
    /// replaced it after the shared guard was released.
    fn drop_stale(&self, key: &str, identifier: &str) -> Result<(), CacheError> {
        let mut index = self.index.write();
        if matches!(self.lookup(key, identifier), Ok(Lookup::Stale)) {
            tracing::debug!(key, "Dropping cache entry with old metadata version");
            self.remove_files(key)?;
            index.entries.remove(key);
        }
        Ok(())
    }

    fn remove_key(&self, key: &str) -> Result<(), CacheError> {
        let mut index = self.index.write();
        self.remove_files(key)?;
        index.entries.remove(key);
        Ok(())
    }

    fn remove_files(&self, key: &str) -> Result<(), CacheError> {
        for path in [self.metadata_path(key), self.payload_path(key)] {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(path, e)),
            }
        }
        Ok(())
    }

    /// Evict oldest entries until `incoming` more bytes fit.
    fn evict_if_needed(&self, index: &mut Index, incoming: u64) {
        let max = self.max_cache_size();
        let mut total = index.total();
        if total + incoming <= max {
            return;
        }

        let mut entries: Vec<_> = index
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), *entry))
            .collect();
        entries.sort_by(|a, b| a.1.sequence.cmp(&b.1.sequence).then_with(|| a.0.cmp(&b.0)));

        for (key, entry) in entries {
            if total + incoming <= max {
                break;
            }
            match self.remove_files(&key) {
                Ok(()) => {
                    index.entries.remove(&key);
                    total = total.saturating_sub(entry.size);
                    tracing::debug!(key = %key, size = entry.size, "Evicted cache entry");
                }
                Err(e) => tracing::warn!(key = %key, "Failed to evict cache entry: {e}"),
            }
        }
    }
}

impl CacheManager for FileSystemCacheManager {
    fn revision_for_identifier(&self, identifier: &str) -> Option<String> {
        if check_identifier(identifier).is_err() {
            return None;
        }
        let key = cache_key(identifier);
        let lookup = {
            let _index = self.index.read();
            self.lookup(&key, identifier)
        };
        match lookup {
            Ok(Lookup::Current(metadata)) => Some(metadata.revision),
            Ok(Lookup::Absent) => None,
            Ok(Lookup::Stale) => {
                if let Err(e) = self.drop_stale(&key, identifier) {
                    tracing::debug!(identifier, "Failed to drop stale cache entry: {e}");
                }
                None
            }
            Err(e) => {
                tracing::debug!(identifier, "Cache revision unavailable: {e}");
                None
            }
        }
    }

    fn cache_data(&self, data: &[u8], identifier: &str, revision: &str) -> Result<(), CacheError> {
        check_identifier(identifier)?;
        let key = cache_key(identifier);

        let metadata = EntryMetadata {
            version: METADATA_VERSION,
            identifier: identifier.to_string(),
            revision: revision.to_string(),
            stored_at: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_or(0, |d| d.as_secs()),
            size: data.len() as u64,
        };
        let encoded = serde_json::to_vec_pretty(&metadata).map_err(|e| CacheError::CorruptMetadata {
            path: self.metadata_path(&key),
            message: e.to_string(),
        })?;

        let size = data.len() as u64 + encoded.len() as u64;
        let max = self.max_cache_size();
        if size > max {
            return Err(CacheError::EntryTooLarge { size, max });
        }

        let mut index = self.index.write();
        // The entry being replaced no longer counts against the limit.
        index.entries.remove(&key);
        self.evict_if_needed(&mut index, size);

        let shard = self.shard(&key);
        fs::create_dir_all(&shard).map_err(|e| CacheError::io(&shard, e))?;

        let payload_path = self.payload_path(&key);
        atomic_write(&payload_path, data).map_err(|e| CacheError::io(&payload_path, e))?;
        let metadata_path = self.metadata_path(&key);
        atomic_write(&metadata_path, &encoded).map_err(|e| CacheError::io(&metadata_path, e))?;

        index.record(key, size);
        Ok(())
    }

    fn cached_data_for_identifier(&self, identifier: &str) -> Result<Option<Vec<u8>>, CacheError> {
        check_identifier(identifier)?;
        let key = cache_key(identifier);
        let index = self.index.read();
        let metadata = match self.lookup(&key, identifier)? {
            Lookup::Current(metadata) => metadata,
            Lookup::Absent => return Ok(None),
            Lookup::Stale => {
                drop(index);
                self.drop_stale(&key, identifier)?;
                return Ok(None);
            }
        };

        let path = self.payload_path(&key);
        let data = fs::read(&path).map_err(|e| CacheError::io(&path, e))?;
        if data.len() as u64 != metadata.size {
            return Err(CacheError::CorruptMetadata {
                path: self.metadata_path(&key),
                message: format!(
                    "payload is {} bytes but metadata records {}",
                    data.len(),
                    metadata.size
                ),
            });
        }
        Ok(Some(data))
    }

    fn remove_cache_for_identifier(&self, identifier: &str) -> Result<(), CacheError> {
        check_identifier(identifier)?;
        self.remove_key(&cache_key(identifier))
    }

    fn remove_all_cache(&self) -> Result<(), CacheError> {
        let mut index = self.index.write();
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(CacheError::io(&self.dir, e)),
        }
        fs::create_dir_all(&self.dir).map_err(|e| CacheError::io(&self.dir, e))?;
        index.entries.clear();
        tracing::debug!(dir = %self.dir.display(), "Cleared file system cache");
        Ok(())
    }
}

impl std::fmt::Debug for FileSystemCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileSystemCacheManager")
            .field("dir", &self.dir)
            .field("max_cache_size", &self.max_cache_size())
            .finish_non_exhaustive()
    }
}

/// Build the index from entries already on disk, oldest first.
fn scan_entries(dir: &Path) -> Index {
    let mut found: Vec<(String, SystemTime, u64)> = Vec::new();
    let Ok(shards) = fs::read_dir(dir) else {
        return Index::default();
    };

    for shard in shards.flatten() {
        let shard_path = shard.path();
        if !shard_path.is_dir() {
            continue;
        }
        let Ok(files) = fs::read_dir(&shard_path) else {
            continue;
        };

        for file in files.flatten() {
            let path = file.path();
            if path.extension().is_some_and(|e| e == "json")
                && let Some(key) = path.file_stem().and_then(|s| s.to_str())
            {
                let meta = file.metadata().ok();
                let mtime = meta
                    .as_ref()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(UNIX_EPOCH);
                let payload = fs::metadata(path.with_extension("bin")).map_or(0, |m| m.len());
                let size = meta.map_or(0, |m| m.len()) + payload;
                found.push((key.to_string(), mtime, size));
            }
        }
    }

    found.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    let mut index = Index::default();
    for (key, _, size) in found {
        index.record(key, size);
    }
    index
}

/// Hex SHA-256 of the identifier. Keeps file names short and safe for any
/// identifier length or content.
fn cache_key(identifier: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(identifier.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_key_is_stable_hex() {
        let key = cache_key("https://example.com/feed");
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, cache_key("https://example.com/feed"));
        assert_ne!(key, cache_key("https://example.com/feed2"));
    }

    #[test]
    fn entry_layout() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSystemCacheManager::open(dir.path()).unwrap();
        cache.cache_data(b"payload", "layout", "r1").unwrap();

        let key = cache_key("layout");
        let shard = dir.path().join(&key[..2]);
        assert!(shard.join(format!("{key}.json")).exists());
        assert!(shard.join(format!("{key}.bin")).exists());
    }

    #[test]
    fn old_metadata_version_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSystemCacheManager::open(dir.path()).unwrap();
        cache.cache_data(b"payload", "versioned", "r1").unwrap();

        let path = cache.metadata_path(&cache_key("versioned"));
        let mut metadata: EntryMetadata =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        metadata.version = METADATA_VERSION + 1;
        fs::write(&path, serde_json::to_vec(&metadata).unwrap()).unwrap();

        assert_eq!(cache.cached_data_for_identifier("versioned").unwrap(), None);
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_metadata_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSystemCacheManager::open(dir.path()).unwrap();
        cache.cache_data(b"payload", "corrupt", "r1").unwrap();
        fs::write(cache.metadata_path(&cache_key("corrupt")), b"{not json").unwrap();

        assert!(matches!(
            cache.cached_data_for_identifier("corrupt"),
            Err(CacheError::CorruptMetadata { .. })
        ));
        assert_eq!(cache.revision_for_identifier("corrupt"), None);
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileSystemCacheManager::open(dir.path()).unwrap();
        cache.cache_data(b"payload", "short", "r1").unwrap();
        fs::write(cache.payload_path(&cache_key("short")), b"pay").unwrap();

        assert!(cache.cached_data_for_identifier("short").is_err());
    }
}
