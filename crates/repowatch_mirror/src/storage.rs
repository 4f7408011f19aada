//! Persistence backends for the client mirror.
//!
//! The mirror keeps its working set in memory and hands the full entry list
//! to a [`MirrorStorage`] whenever a debounced flush runs. Storage is
//! session-scoped: whoever owns the session calls [`MirrorStorage::clear`]
//! when it ends.

use crate::error::{MirrorError, MirrorResult};
use parking_lot::RwLock;
use repowatch_core::{EntityKey, PluginState};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

/// One cached entity state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Entity key.
    pub entity: EntityKey,
    /// Last known state.
    pub state: PluginState,
    /// When the state was written (unix millis).
    pub timestamp: u64,
}

impl CacheEntry {
    /// Creates an entry.
    pub fn new(entity: EntityKey, state: PluginState, timestamp: u64) -> Self {
        Self {
            entity,
            state,
            timestamp,
        }
    }

    /// Returns true if the entry is older than `ttl_millis` at `now`.
    pub fn is_expired(&self, now: u64, ttl_millis: u64) -> bool {
        now.saturating_sub(self.timestamp) > ttl_millis
    }
}

/// Where the mirror persists its entries.
///
/// Implementations must be safe to call from the persistence task and from
/// callers at the same time.
pub trait MirrorStorage: Send + Sync {
    /// Loads every stored entry, expired ones included.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store exists but cannot be read.
    fn load(&self) -> MirrorResult<Vec<CacheEntry>>;

    /// Replaces the stored entries with `entries`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn save(&self, entries: &[CacheEntry]) -> MirrorResult<()>;

    /// Removes everything stored for this session.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be removed.
    fn clear(&self) -> MirrorResult<()>;
}

/// Storage that lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    entries: RwLock<Vec<CacheEntry>>,
    writes: AtomicUsize,
}

impl MemoryStorage {
    /// Creates an empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a storage holding `entries`, as if a previous page had
    /// saved them.
    pub fn with_entries(entries: Vec<CacheEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
            writes: AtomicUsize::new(0),
        }
    }

    /// Returns a copy of the stored entries.
    pub fn entries(&self) -> Vec<CacheEntry> {
        self.entries.read().clone()
    }

    /// Returns how many times [`MirrorStorage::save`] ran.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl MirrorStorage for MemoryStorage {
    fn load(&self) -> MirrorResult<Vec<CacheEntry>> {
        Ok(self.entries.read().clone())
    }

    fn save(&self, entries: &[CacheEntry]) -> MirrorResult<()> {
        *self.entries.write() = entries.to_vec();
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn clear(&self) -> MirrorResult<()> {
        self.entries.write().clear();
        Ok(())
    }
}

const DOCUMENT_VERSION: u32 = 1;

#[derive(Serialize)]
struct DocumentRef<'a> {
    version: u32,
    entries: &'a [CacheEntry],
}

#[derive(Deserialize)]
struct Document {
    version: u32,
    entries: Vec<CacheEntry>,
}

/// Storage backed by a single JSON document.
///
/// Writes go to a sibling temporary file which is synced and then renamed
/// over the document, so a crash mid-write leaves the previous version.
#[derive(Debug)]
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    /// Uses the document at `path`, creating parent directories if needed.
    /// The document itself is created on the first save.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created.
    pub fn open(path: impl AsRef<Path>) -> MirrorResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self { path })
    }

    /// Returns the document path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl MirrorStorage for JsonFileStorage {
    fn load(&self) -> MirrorResult<Vec<CacheEntry>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let document: Document = serde_json::from_slice(&bytes)?;
        if document.version != DOCUMENT_VERSION {
            return Err(MirrorError::UnsupportedVersion {
                found: document.version,
                expected: DOCUMENT_VERSION,
            });
        }
        Ok(document.entries)
    }

    fn save(&self, entries: &[CacheEntry]) -> MirrorResult<()> {
        let encoded = serde_json::to_vec(&DocumentRef {
            version: DOCUMENT_VERSION,
            entries,
        })?;

        let temp = self.temp_path();
        {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&encoded)?;
            file.sync_all()?;
        }
        fs::rename(&temp, &self.path)?;

        debug!(path = %self.path.display(), entries = entries.len(), "mirror document written");
        Ok(())
    }

    fn clear(&self) -> MirrorResult<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}
