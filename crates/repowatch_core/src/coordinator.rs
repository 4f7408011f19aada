//! The coordination engine.
//!
//! One [`Coordinator`] owns the state store, lock table, event log,
//! broadcaster and error contexts. It is constructed once per process and
//! shared by `Arc` with every collaborator.
//!
//! Every transition attempt runs under the entity's lease:
//!
//! 1. validate against the transition graph (unless forced)
//! 2. write the state store on success
//! 3. append the attempt to the event log
//! 4. record or clear the error context
//! 5. broadcast effective transitions

use crate::broadcast::{Broadcaster, StateChange, Subscription};
use crate::config::CoordinatorConfig;
use crate::entity::EntityKey;
use crate::error::{CoreError, CoreResult};
use crate::error_context::{ErrorContext, ErrorContextManager, Failure, RetryDecision};
use crate::event_log::{unix_millis, EventLog, RecordStatus, TransitionRecord, TransitionSource};
use crate::lock::{Lease, LeaseGuard, LockManager};
use crate::state::PluginState;
use crate::store::{StateEntry, StateMetadata, StateStore};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// An automatic re-check requested by a freshly recorded failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryTicket {
    /// Entity to re-check.
    pub entity: EntityKey,
    /// Retry number, 1-based.
    pub attempt: u32,
    /// Delay before the re-check.
    pub delay: Duration,
    /// Timestamp of the error context that asked for the retry.
    ///
    /// Store writes are strictly increasing per entity, so this identifies
    /// one failure. A ticket whose context was replaced must not fire.
    pub recorded_at: u64,
}

/// Schedules automatic re-checks for entities in the error state.
pub trait RetryScheduler: Send + Sync {
    /// Re-checks `ticket.entity` after `ticket.delay`.
    fn schedule_retry(&self, ticket: RetryTicket);
}

/// A request to move an entity to a new state.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionRequest {
    /// Target entity.
    pub entity: EntityKey,
    /// Requested state.
    pub to: PluginState,
    /// Payload recorded with the attempt.
    pub context: Option<Value>,
    /// Bypass the transition graph.
    pub force: bool,
    /// Who is asking.
    pub source: TransitionSource,
    /// Reject unless the entity is currently in this state.
    pub expected: Option<PluginState>,
}

impl TransitionRequest {
    /// Creates an unforced user request.
    pub fn new(entity: EntityKey, to: PluginState) -> Self {
        Self {
            entity,
            to,
            context: None,
            force: false,
            source: TransitionSource::User,
            expected: None,
        }
    }

    /// Attaches a context payload.
    pub fn with_context(mut self, context: Value) -> Self {
        self.context = Some(context);
        self
    }

    /// Sets the source.
    pub fn with_source(mut self, source: TransitionSource) -> Self {
        self.source = source;
        self
    }

    /// Bypasses the transition graph.
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Rejects the request unless the entity is currently in `state`.
    pub fn expecting(mut self, state: PluginState) -> Self {
        self.expected = Some(state);
        self
    }
}

/// Result of a transition attempt.
///
/// Illegal transitions are not errors: they come back with
/// [`RecordStatus::Rejected`] and leave the state alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    /// State before the attempt.
    pub from: PluginState,
    /// State after the attempt.
    pub to: PluginState,
    /// What happened.
    pub status: RecordStatus,
    /// Event log sequence of the attempt.
    pub sequence: u64,
}

impl TransitionOutcome {
    /// Returns true if the state was written.
    pub fn is_applied(&self) -> bool {
        self.status != RecordStatus::Rejected
    }
}

/// Everything known about one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    /// The entity.
    pub entity: EntityKey,
    /// Current state.
    pub state: PluginState,
    /// When the state was last written, if ever.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
    /// Metadata bag.
    #[serde(default, skip_serializing_if = "StateMetadata::is_empty")]
    pub metadata: StateMetadata,
    /// Error details while in the error state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorContext>,
}

/// The per-process coordination engine.
pub struct Coordinator {
    config: CoordinatorConfig,
    store: StateStore,
    locks: Arc<LockManager>,
    log: EventLog,
    broadcaster: Broadcaster,
    errors: ErrorContextManager,
    scheduler: RwLock<Option<Weak<dyn RetryScheduler>>>,
}

impl Coordinator {
    /// Creates a coordinator.
    pub fn new(config: CoordinatorConfig) -> Self {
        info!(
            lock_ttl_ms = config.lock_ttl.as_millis() as u64,
            log_capacity = config.event_log_capacity,
            max_retries = config.retry.max_attempts,
            "coordinator created"
        );

        Self {
            store: StateStore::new(),
            locks: Arc::new(LockManager::new(config.lock_ttl)),
            log: EventLog::new(config.event_log_capacity),
            broadcaster: Broadcaster::new(config.broadcast_capacity),
            errors: ErrorContextManager::new(config.retry.clone()),
            scheduler: RwLock::new(None),
            config,
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Returns the lock manager.
    pub fn locks(&self) -> &Arc<LockManager> {
        &self.locks
    }

    /// Installs the component that runs automatic retries.
    ///
    /// Held weakly; retries stop once the scheduler is dropped.
    pub fn set_retry_scheduler(&self, scheduler: Weak<dyn RetryScheduler>) {
        *self.scheduler.write() = Some(scheduler);
    }

    /// Requests a transition with the engine's usual entry point.
    ///
    /// `force` is reserved for the trusted re-scan path and is recorded as
    /// such. Returns [`CoreError::LockBusy`](crate::CoreError::LockBusy) if
    /// an operation currently holds the entity.
    pub fn request_transition(
        &self,
        entity: &EntityKey,
        to: PluginState,
        context: Option<Value>,
        force: bool,
    ) -> CoreResult<TransitionOutcome> {
        let source = if force {
            TransitionSource::Rescan
        } else {
            TransitionSource::User
        };

        self.submit(TransitionRequest {
            entity: entity.clone(),
            to,
            context,
            force,
            source,
            expected: None,
        })
    }

    /// Submits a request, taking the entity's lease for its duration.
    pub fn submit(&self, request: TransitionRequest) -> CoreResult<TransitionOutcome> {
        let _guard = self.lease_guard(&request.entity)?;
        Ok(self.apply_locked(request))
    }

    /// Submits a request under a lease the caller already holds.
    pub fn submit_with_lease(
        &self,
        lease: &Lease,
        request: TransitionRequest,
    ) -> CoreResult<TransitionOutcome> {
        if lease.entity() != &request.entity {
            return Err(CoreError::LeaseMismatch {
                entity: request.entity.to_string(),
            });
        }
        if let Err(err) = self.locks.verify(lease) {
            warn!(entity = %request.entity, to = %request.to, "lease lost before transition");
            return Err(err);
        }
        Ok(self.apply_locked(request))
    }

    /// Acquires the entity's lease and wraps it in a guard.
    pub fn lease_guard(&self, entity: &EntityKey) -> CoreResult<LeaseGuard> {
        let lease = self.locks.acquire_default(entity)?;
        Ok(LeaseGuard::new(Arc::clone(&self.locks), lease))
    }

    fn apply_locked(&self, request: TransitionRequest) -> TransitionOutcome {
        let TransitionRequest {
            entity,
            to,
            context,
            force,
            source,
            expected,
        } = request;
        let now = unix_millis();

        let (from, written) = self.store.update_with(&entity, now, |current| {
            let precondition = expected.map_or(true, |state| state == current);
            (precondition && (force || current.can_transition_to(to))).then_some(to)
        });

        let now = written.map_or(now, |entry| entry.updated_at);
        let status = match written {
            None => RecordStatus::Rejected,
            Some(_) if force => RecordStatus::Forced,
            Some(_) => RecordStatus::Accepted,
        };

        let record = self.log.append(TransitionRecord {
            sequence: 0,
            entity: entity.clone(),
            from,
            to,
            timestamp: now,
            source,
            context,
            status,
        });

        let outcome = TransitionOutcome {
            from,
            to: if record.is_effective() { to } else { from },
            status,
            sequence: record.sequence,
        };

        if !record.is_effective() {
            warn!(
                entity = %entity,
                from = %from,
                to = %to,
                source = ?source,
                sequence = record.sequence,
                "transition rejected"
            );
            return outcome;
        }

        match status {
            RecordStatus::Forced => info!(
                entity = %entity,
                from = %from,
                to = %to,
                source = ?source,
                sequence = record.sequence,
                "transition forced"
            ),
            _ => debug!(
                entity = %entity,
                from = %from,
                to = %to,
                source = ?source,
                sequence = record.sequence,
                "transition accepted"
            ),
        }

        if to == PluginState::Error {
            let failure = Failure::from_context(record.context.as_ref());
            let (_, decision) = self.errors.record(&entity, &failure, now);
            if let RetryDecision::Scheduled { attempt, delay } = decision {
                self.schedule_retry(RetryTicket {
                    entity: entity.clone(),
                    attempt,
                    delay,
                    recorded_at: now,
                });
            }
        }
        self.errors.on_transition(&entity, from, to, source);

        self.broadcaster.publish(record.to_change());
        outcome
    }

    fn schedule_retry(&self, ticket: RetryTicket) {
        let scheduler = self.scheduler.read().as_ref().and_then(Weak::upgrade);
        match scheduler {
            Some(scheduler) => scheduler.schedule_retry(ticket),
            None => warn!(entity = %ticket.entity, attempt = ticket.attempt, "no retry scheduler installed"),
        }
    }

    /// Returns true while `ticket` still belongs to the entity's current
    /// failure and that failure still asks for an automatic retry.
    pub fn retry_is_current(&self, ticket: &RetryTicket) -> bool {
        if self.get_state(&ticket.entity) != PluginState::Error {
            return false;
        }
        self.errors.get(&ticket.entity).map_or(false, |context| {
            context.timestamp == ticket.recorded_at
                && context.recoverable
                && context.will_auto_retry()
        })
    }

    /// Returns the entity's current state.
    pub fn get_state(&self, entity: &EntityKey) -> PluginState {
        self.store.get(entity)
    }

    /// Returns the entity's state and last write time.
    pub fn state_entry(&self, entity: &EntityKey) -> Option<StateEntry> {
        self.store.entry(entity)
    }

    /// Returns the entity's metadata.
    pub fn get_metadata(&self, entity: &EntityKey) -> StateMetadata {
        self.store.metadata(entity)
    }

    /// Sets one metadata value. The key `state` is refused.
    pub fn set_metadata(
        &self,
        entity: &EntityKey,
        key: &str,
        value: Value,
    ) -> CoreResult<Option<Value>> {
        let previous = self.store.set_metadata(entity, key, value)?;
        debug!(entity = %entity, key, "metadata set");
        Ok(previous)
    }

    /// Removes one metadata value.
    pub fn remove_metadata(&self, entity: &EntityKey, key: &str) -> Option<Value> {
        self.store.remove_metadata(entity, key)
    }

    /// Returns the error context while the entity is in the error state.
    pub fn error_context(&self, entity: &EntityKey) -> Option<ErrorContext> {
        self.errors.get(entity)
    }

    /// Returns automatic retries spent on the entity since it last settled.
    pub fn retry_attempts(&self, entity: &EntityKey) -> u32 {
        self.errors.attempts(entity)
    }

    /// Describes one entity.
    pub fn describe(&self, entity: &EntityKey) -> EntitySnapshot {
        let entry = self.store.entry(entity);
        EntitySnapshot {
            entity: entity.clone(),
            state: entry.map(|e| e.state).unwrap_or_default(),
            updated_at: entry.map(|e| e.updated_at),
            metadata: self.store.metadata(entity),
            error: self.errors.get(entity),
        }
    }

    /// Describes every tracked entity, sorted by key.
    pub fn snapshot(&self) -> Vec<EntitySnapshot> {
        self.store
            .entities()
            .iter()
            .map(|entity| self.describe(entity))
            .collect()
    }

    /// Returns up to `limit` of the newest transition attempts.
    pub fn recent_events(&self, limit: usize) -> Vec<TransitionRecord> {
        self.log.recent(limit)
    }

    /// Returns retained transition attempts for one entity.
    pub fn events_for(&self, entity: &EntityKey) -> Vec<TransitionRecord> {
        self.log.for_entity(entity)
    }

    /// Returns the sequence of the newest log record.
    pub fn latest_sequence(&self) -> u64 {
        self.log.latest_sequence()
    }

    /// Subscribes with a replay of retained transitions after `after`.
    pub fn subscribe(&self, after: Option<u64>) -> Subscription {
        self.broadcaster.subscribe(&self.log, after)
    }

    /// Subscribes to live transitions only.
    pub fn subscribe_live(&self) -> Subscription {
        self.broadcaster.subscribe_live()
    }

    /// Returns the number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.broadcaster.subscriber_count()
    }

    /// Effective transitions still retained in the log.
    pub fn replay(&self, after: Option<u64>) -> Vec<StateChange> {
        self.log.changes_since(after)
    }
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new(CoordinatorConfig::default())
    }
}
