//! Configuration for the client mirror.

use std::time::Duration;

/// Configuration for a [`ClientMirror`](crate::ClientMirror).
#[derive(Debug, Clone)]
pub struct MirrorConfig {
    /// Entries older than this are ignored on load and evicted first.
    pub ttl: Duration,
    /// Size cap; the oldest entries are evicted beyond it.
    pub max_entries: usize,
    /// Quiet period before a burst of writes is persisted.
    pub persist_debounce: Duration,
    /// Longest a pending write waits for a quiet period.
    pub max_persist_delay: Duration,
}

impl MirrorConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            ttl: Duration::from_secs(30 * 60),
            max_entries: 500,
            persist_debounce: Duration::from_millis(250),
            max_persist_delay: Duration::from_secs(2),
        }
    }

    /// Sets the entry time-to-live.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the size cap.
    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Sets the persistence debounce.
    pub fn with_persist_debounce(mut self, debounce: Duration) -> Self {
        self.persist_debounce = debounce;
        self
    }

    /// Sets the upper bound on how long the debounce may postpone a write.
    pub fn with_max_persist_delay(mut self, delay: Duration) -> Self {
        self.max_persist_delay = delay;
        self
    }

    pub(crate) fn ttl_millis(&self) -> u64 {
        u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self::new()
    }
}
