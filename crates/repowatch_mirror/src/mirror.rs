//! The client mirror.
//!
//! A read-only local view of entity states. It is fed from two paths, the
//! change stream and direct operation responses, and reconciles them by
//! timestamp: the newest write wins, so applying the same `{entity, state}`
//! through both paths is a no-op the second time.
//!
//! # Usage
//!
//! ```rust,ignore
//! let mirror = Arc::new(ClientMirror::new(MirrorConfig::default(), storage));
//! mirror.load()?;
//! let _persist = mirror.spawn_persistence();
//! mirror.subscribe(|update| println!("{update:?}"));
//! mirror.follow(coordinator.subscribe(None).into_stream()).await;
//! ```

use crate::config::MirrorConfig;
use crate::error::{MirrorError, MirrorResult};
use crate::sse::{SseDecoder, SseFrame};
use crate::storage::{CacheEntry, MemoryStorage, MirrorStorage};
use futures::{Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use repowatch_core::{unix_millis, EntityKey, OperationReport, PluginState, StateChange};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Stream event name carrying a transition.
const STATE_CHANGE_EVENT: &str = "state_change";

/// What a listener is told about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorUpdate {
    /// An entity's cached state changed.
    Changed {
        /// The entity.
        entity: EntityKey,
        /// New state.
        state: PluginState,
        /// State cached before, if any.
        previous: Option<PluginState>,
        /// Timestamp of the winning write.
        timestamp: u64,
    },
    /// An entity was dropped and now awaits a rescan.
    Invalidated {
        /// The entity.
        entity: EntityKey,
    },
    /// The session was cleared.
    Cleared,
}

/// Handle returned by [`ClientMirror::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Listener = Arc<dyn Fn(&MirrorUpdate) + Send + Sync>;

enum Merge {
    Stale,
    Uncached,
    Refreshed,
    Changed(MirrorUpdate),
}

/// Payload of a `state_change` frame. Only the fields the mirror needs.
#[derive(Deserialize)]
struct ChangePayload {
    repository: EntityKey,
    to: PluginState,
    timestamp: u64,
    #[serde(default)]
    sequence: Option<u64>,
}

/// TTL-bounded local cache of entity states.
pub struct ClientMirror {
    config: MirrorConfig,
    storage: Arc<dyn MirrorStorage>,
    entries: RwLock<HashMap<EntityKey, CacheEntry>>,
    listeners: RwLock<Vec<(ListenerId, Listener)>>,
    next_listener: AtomicU64,
    last_event_id: Mutex<Option<u64>>,
    dirty: AtomicBool,
    persist_tx: Mutex<Option<mpsc::UnboundedSender<()>>>,
}

impl ClientMirror {
    /// Creates an empty mirror over `storage`. Call [`load`](Self::load)
    /// to pick up what a previous page saved.
    pub fn new(config: MirrorConfig, storage: Arc<dyn MirrorStorage>) -> Self {
        Self {
            config,
            storage,
            entries: RwLock::new(HashMap::new()),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            last_event_id: Mutex::new(None),
            dirty: AtomicBool::new(false),
            persist_tx: Mutex::new(None),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &MirrorConfig {
        &self.config
    }

    /// Loads non-expired entries from storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    pub fn load(&self) -> MirrorResult<usize> {
        self.load_at(unix_millis())
    }

    /// Like [`load`](Self::load), with an explicit clock.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage cannot be read.
    pub fn load_at(&self, now: u64) -> MirrorResult<usize> {
        let stored = self.storage.load()?;
        let ttl = self.config.ttl_millis();

        let mut loaded = 0;
        let mut skipped = 0;
        {
            let mut entries = self.entries.write();
            for entry in stored {
                if entry.is_expired(now, ttl) {
                    skipped += 1;
                    continue;
                }
                let newer = entries
                    .get(&entry.entity)
                    .map_or(true, |current| entry.timestamp > current.timestamp);
                if newer {
                    entries.insert(entry.entity.clone(), entry);
                    loaded += 1;
                }
            }
            evict(&mut entries, now, ttl, self.config.max_entries);
        }

        debug!(loaded, skipped, "mirror loaded from storage");
        Ok(loaded)
    }

    /// Returns the cached state. Never fetches: `None` means the entity is
    /// unknown and awaits a scan.
    pub fn get(&self, entity: &EntityKey) -> Option<PluginState> {
        self.get_at(entity, unix_millis())
    }

    /// Like [`get`](Self::get), with an explicit clock.
    pub fn get_at(&self, entity: &EntityKey, now: u64) -> Option<PluginState> {
        let entries = self.entries.read();
        entries
            .get(entity)
            .filter(|entry| !entry.is_expired(now, self.config.ttl_millis()))
            .map(|entry| entry.state)
    }

    /// Returns the raw cached entry, expired or not.
    pub fn entry(&self, entity: &EntityKey) -> Option<CacheEntry> {
        self.entries.read().get(entity).cloned()
    }

    /// Records a locally observed state, stamped now.
    pub fn set(&self, entity: EntityKey, state: PluginState) -> bool {
        self.apply(CacheEntry::new(entity, state, unix_millis()))
    }

    /// Merges an entry. Returns true if the cached state changed.
    ///
    /// Older writes are ignored. A write carrying the cached state only
    /// refreshes the timestamp. On equal timestamps the later arrival wins.
    pub fn apply(&self, entry: CacheEntry) -> bool {
        let merge = {
            let mut entries = self.entries.write();
            match entries.get_mut(&entry.entity) {
                Some(current) if entry.timestamp < current.timestamp => Merge::Stale,
                Some(current) if current.state == entry.state => {
                    current.timestamp = entry.timestamp;
                    Merge::Refreshed
                }
                None if self.config.max_entries == 0 => Merge::Uncached,
                existing => {
                    let previous = existing.map(|current| current.state);
                    if previous.is_none() && entries.len() >= self.config.max_entries {
                        let cap = self.config.max_entries.saturating_sub(1);
                        evict(&mut entries, unix_millis(), self.config.ttl_millis(), cap);
                    }
                    let update = MirrorUpdate::Changed {
                        entity: entry.entity.clone(),
                        state: entry.state,
                        previous,
                        timestamp: entry.timestamp,
                    };
                    entries.insert(entry.entity.clone(), entry.clone());
                    Merge::Changed(update)
                }
            }
        };

        match merge {
            Merge::Stale => {
                debug!(
                    entity = %entry.entity,
                    state = %entry.state,
                    "ignoring stale mirror write"
                );
                false
            }
            Merge::Uncached => {
                debug!(entity = %entry.entity, "mirror has no capacity, write dropped");
                false
            }
            Merge::Refreshed => {
                self.dirty.store(true, Ordering::SeqCst);
                self.schedule_persist();
                false
            }
            Merge::Changed(update) => {
                self.dirty.store(true, Ordering::SeqCst);
                self.notify(&update);
                self.schedule_persist();
                true
            }
        }
    }

    /// Applies a change pushed by the coordinator.
    pub fn apply_change(&self, change: &StateChange) -> bool {
        self.record_event_id(change.sequence);
        self.apply(CacheEntry::new(
            change.entity.clone(),
            change.to,
            change.timestamp,
        ))
    }

    /// Applies a decoded stream frame. Frames other than `state_change`
    /// are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`MirrorError::InvalidFrame`] if the payload or id cannot be
    /// read.
    pub fn apply_frame(&self, frame: &SseFrame) -> MirrorResult<bool> {
        if frame.event != STATE_CHANGE_EVENT {
            return Ok(false);
        }

        let payload: ChangePayload = serde_json::from_str(&frame.data)
            .map_err(|err| MirrorError::InvalidFrame(err.to_string()))?;

        let id = match frame.id.as_deref() {
            Some(id) => Some(
                id.parse::<u64>()
                    .map_err(|_| MirrorError::InvalidFrame(format!("non-numeric id {id:?}")))?,
            ),
            None => payload.sequence,
        };
        if let Some(id) = id {
            self.record_event_id(id);
        }

        Ok(self.apply(CacheEntry::new(
            payload.repository,
            payload.to,
            payload.timestamp,
        )))
    }

    /// Applies the result of a direct operation call.
    ///
    /// Reports for entities the coordinator has never stored carry no
    /// timestamp and are ignored.
    pub fn apply_report(&self, report: &OperationReport) -> bool {
        match report.updated_at {
            Some(timestamp) => self.apply(CacheEntry::new(
                report.entity.clone(),
                report.state,
                timestamp,
            )),
            None => false,
        }
    }

    /// Drops an entity so the next scan repopulates it.
    pub fn invalidate(&self, entity: &EntityKey) -> bool {
        let removed = self.entries.write().remove(entity).is_some();
        if removed {
            self.dirty.store(true, Ordering::SeqCst);
            self.notify(&MirrorUpdate::Invalidated {
                entity: entity.clone(),
            });
            self.schedule_persist();
        }
        removed
    }

    /// Drops every entity of `owner`.
    pub fn invalidate_by_prefix(&self, owner: &str) -> usize {
        let removed: Vec<EntityKey> = {
            let mut entries = self.entries.write();
            let keys: Vec<EntityKey> = entries
                .keys()
                .filter(|key| key.owner() == owner)
                .cloned()
                .collect();
            for key in &keys {
                entries.remove(key);
            }
            keys
        };

        if !removed.is_empty() {
            self.dirty.store(true, Ordering::SeqCst);
            for entity in &removed {
                self.notify(&MirrorUpdate::Invalidated {
                    entity: entity.clone(),
                });
            }
            self.schedule_persist();
        }
        debug!(owner, removed = removed.len(), "mirror invalidated by owner");
        removed.len()
    }

    /// Evicts expired entries, then the oldest beyond the size cap.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(unix_millis())
    }

    /// Like [`cleanup`](Self::cleanup), with an explicit clock.
    pub fn cleanup_at(&self, now: u64) -> usize {
        let evicted = evict(
            &mut self.entries.write(),
            now,
            self.config.ttl_millis(),
            self.config.max_entries,
        );
        if evicted > 0 {
            self.dirty.store(true, Ordering::SeqCst);
            self.schedule_persist();
        }
        evicted
    }

    /// Writes the entries to storage if anything changed since the last
    /// write. Returns whether a write happened.
    ///
    /// # Errors
    ///
    /// Returns the storage error; the mirror stays dirty so the next flush
    /// retries.
    pub fn flush(&self) -> MirrorResult<bool> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }

        let entries = self.entries();
        if let Err(err) = self.storage.save(&entries) {
            self.dirty.store(true, Ordering::SeqCst);
            return Err(err);
        }
        Ok(true)
    }

    /// Starts the debounced persistence task. Writes are batched until
    /// `persist_debounce` passes without a new one, but never held back
    /// longer than `max_persist_delay` after the first of them.
    ///
    /// The task ends when the mirror is dropped.
    pub fn spawn_persistence(self: &Arc<Self>) -> JoinHandle<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        *self.persist_tx.lock() = Some(tx);

        let weak: Weak<Self> = Arc::downgrade(self);
        let debounce = self.config.persist_debounce;
        let max_delay = self.config.max_persist_delay;

        tokio::spawn(async move {
            while rx.recv().await.is_some() {
                let first = tokio::time::Instant::now();
                loop {
                    let remaining = max_delay.saturating_sub(first.elapsed());
                    tokio::time::sleep(debounce.min(remaining)).await;
                    let mut more = false;
                    while rx.try_recv().is_ok() {
                        more = true;
                    }
                    if !more || first.elapsed() >= max_delay {
                        break;
                    }
                }

                let Some(mirror) = weak.upgrade() else {
                    break;
                };
                if let Err(err) = mirror.flush() {
                    warn!(error = %err, "mirror persistence failed");
                }
            }
            debug!("mirror persistence stopped");
        })
    }

    /// Registers a listener called after every effective change. Listeners
    /// run on the caller's thread, outside the mirror's locks.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&MirrorUpdate) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::SeqCst));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    /// Ends the session: forgets every entry and clears storage.
    ///
    /// # Errors
    ///
    /// Returns the storage error; memory is cleared regardless.
    pub fn clear_session(&self) -> MirrorResult<()> {
        self.entries.write().clear();
        *self.last_event_id.lock() = None;
        self.dirty.store(false, Ordering::SeqCst);
        self.notify(&MirrorUpdate::Cleared);
        self.storage.clear()
    }

    /// Applies changes from `stream` until it ends. Returns how many
    /// changed the cache.
    pub async fn follow<S>(&self, stream: S) -> usize
    where
        S: Stream<Item = StateChange>,
    {
        let mut stream = std::pin::pin!(stream);
        let mut applied = 0;
        while let Some(change) = stream.next().await {
            if self.apply_change(&change) {
                applied += 1;
            }
        }
        applied
    }

    /// Decodes an SSE body delivered as text chunks and applies its frames
    /// until the body ends. Malformed frames are logged and skipped.
    pub async fn follow_sse<S>(&self, chunks: S) -> usize
    where
        S: Stream<Item = String>,
    {
        let mut chunks = std::pin::pin!(chunks);
        let mut decoder = SseDecoder::new();
        let mut applied = 0;
        while let Some(chunk) = chunks.next().await {
            for frame in decoder.feed(&chunk) {
                match self.apply_frame(&frame) {
                    Ok(true) => applied += 1,
                    Ok(false) => {}
                    Err(err) => warn!(id = ?frame.id, error = %err, "skipping stream frame"),
                }
            }
        }
        applied
    }

    /// Returns the newest stream event id applied, for `Last-Event-ID` on
    /// reconnect.
    pub fn last_event_id(&self) -> Option<u64> {
        *self.last_event_id.lock()
    }

    /// Returns all entries ordered by entity.
    pub fn entries(&self) -> Vec<CacheEntry> {
        let mut entries: Vec<CacheEntry> = self.entries.read().values().cloned().collect();
        entries.sort_by(|a, b| a.entity.cmp(&b.entity));
        entries
    }

    /// Returns the number of cached entities.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    fn record_event_id(&self, id: u64) {
        let mut last = self.last_event_id.lock();
        if last.map_or(true, |current| id > current) {
            *last = Some(id);
        }
    }

    fn notify(&self, update: &MirrorUpdate) {
        let listeners: Vec<Listener> = self
            .listeners
            .read()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(update);
        }
    }

    fn schedule_persist(&self) {
        if let Some(tx) = self.persist_tx.lock().as_ref() {
            // A closed channel means the task is gone; flush() still works.
            let _ = tx.send(());
        }
    }
}

impl Default for ClientMirror {
    fn default() -> Self {
        Self::new(MirrorConfig::default(), Arc::new(MemoryStorage::new()))
    }
}

/// Drops expired entries, then the oldest until at most `cap` remain.
fn evict(
    entries: &mut HashMap<EntityKey, CacheEntry>,
    now: u64,
    ttl_millis: u64,
    cap: usize,
) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| !entry.is_expired(now, ttl_millis));

    if entries.len() > cap {
        let mut by_age: Vec<(u64, EntityKey)> = entries
            .values()
            .map(|entry| (entry.timestamp, entry.entity.clone()))
            .collect();
        by_age.sort();
        let excess = entries.len() - cap;
        for (_, key) in by_age.into_iter().take(excess) {
            entries.remove(&key);
        }
    }

    let evicted = before - entries.len();
    if evicted > 0 {
        debug!(evicted, remaining = entries.len(), "mirror entries evicted");
    }
    evicted
}
