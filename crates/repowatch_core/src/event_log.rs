//! Capped in-memory log of transition attempts.

use crate::broadcast::StateChange;
use crate::entity::EntityKey;
use crate::state::PluginState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// Returns the current wall-clock time in unix milliseconds.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Who asked for a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionSource {
    /// The discovery feed.
    Discovery,
    /// An operator action.
    User,
    /// The outcome of an install/activate/deactivate/check executor.
    Executor,
    /// A scheduled retry out of the error state.
    AutoRetry,
    /// The trusted re-scan path, usually forced.
    Rescan,
    /// Anything else internal.
    System,
}

/// What happened to a transition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    /// The edge was in the graph and the state changed.
    Accepted,
    /// The edge was not in the graph; the state was left alone.
    Rejected,
    /// The graph was bypassed and the state set unconditionally.
    Forced,
}

/// One transition attempt. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    /// Position in the log, assigned on append.
    pub sequence: u64,
    /// Entity the attempt targeted.
    pub entity: EntityKey,
    /// State at the time of the attempt.
    pub from: PluginState,
    /// Requested state.
    pub to: PluginState,
    /// When the attempt was made (unix millis).
    pub timestamp: u64,
    /// Who asked.
    pub source: TransitionSource,
    /// Caller-supplied payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    /// Outcome of the attempt.
    pub status: RecordStatus,
}

impl TransitionRecord {
    /// Returns true if the attempt changed the entity's state.
    pub fn is_effective(&self) -> bool {
        self.status != RecordStatus::Rejected
    }

    /// Converts an effective record to the event pushed to subscribers.
    pub fn to_change(&self) -> StateChange {
        StateChange {
            sequence: self.sequence,
            entity: self.entity.clone(),
            from: self.from,
            to: self.to,
            timestamp: self.timestamp,
        }
    }
}

struct LogInner {
    records: VecDeque<TransitionRecord>,
    next_sequence: u64,
}

/// Ring buffer of the most recent transition attempts across all entities.
///
/// Serves audit/debugging and the replay handed to new stream subscribers.
/// Nothing is persisted beyond the process.
pub struct EventLog {
    inner: Mutex<LogInner>,
    capacity: usize,
}

impl EventLog {
    /// Creates a log keeping at most `capacity` records.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(LogInner {
                records: VecDeque::with_capacity(capacity),
                next_sequence: 1,
            }),
            capacity,
        }
    }

    /// Appends a record, assigning the next sequence number.
    ///
    /// The oldest record is evicted once the log is full.
    pub fn append(&self, mut record: TransitionRecord) -> TransitionRecord {
        let mut inner = self.inner.lock();
        record.sequence = inner.next_sequence;
        inner.next_sequence += 1;

        if inner.records.len() == self.capacity {
            inner.records.pop_front();
        }
        inner.records.push_back(record.clone());
        record
    }

    /// Returns up to `limit` of the newest records, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<TransitionRecord> {
        let inner = self.inner.lock();
        let skip = inner.records.len().saturating_sub(limit);
        inner.records.iter().skip(skip).cloned().collect()
    }

    /// Returns all retained records for one entity, oldest first.
    pub fn for_entity(&self, entity: &EntityKey) -> Vec<TransitionRecord> {
        self.inner
            .lock()
            .records
            .iter()
            .filter(|r| &r.entity == entity)
            .cloned()
            .collect()
    }

    /// Returns retained effective transitions with a sequence greater
    /// than `after`, oldest first.
    pub fn changes_since(&self, after: Option<u64>) -> Vec<StateChange> {
        let after = after.unwrap_or(0);
        self.inner
            .lock()
            .records
            .iter()
            .filter(|r| r.sequence > after && r.is_effective())
            .map(TransitionRecord::to_change)
            .collect()
    }

    /// Returns the sequence of the last appended record, 0 if none.
    pub fn latest_sequence(&self) -> u64 {
        self.inner.lock().next_sequence - 1
    }

    /// Returns the number of retained records.
    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    /// Returns true if nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    /// Returns the maximum number of retained records.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
