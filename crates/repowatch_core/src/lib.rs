//! # repowatch core
//!
//! Per-entity lifecycle coordination for plugin candidates identified by
//! `owner/name`.
//!
//! This crate provides:
//! - A closed state machine with an explicit transition graph
//! - Leased mutual exclusion per entity
//! - A capped event log of every transition attempt
//! - Best-effort fan-out of accepted transitions with replay on subscribe
//! - Classified error contexts with automatic retry scheduling
//! - Install/activate/deactivate/re-check operations over an executor
//!
//! ## Key Invariants
//!
//! - The state store is the only writer of state
//! - Illegal transitions never mutate state but are always logged
//! - Only the lease holder transitions an entity while the lease is valid
//! - Broadcast happens strictly after the state store write
//! - Metadata never encodes a state and is never consulted by the validator
//!
//! ## Usage
//!
//! ```rust,ignore
//! use repowatch_core::{Coordinator, EntityKey, PluginState};
//!
//! let coordinator = Coordinator::default();
//! let widget = EntityKey::parse("acme/widget")?;
//!
//! coordinator.request_transition(&widget, PluginState::Checking, None, false)?;
//! assert_eq!(coordinator.get_state(&widget), PluginState::Checking);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod broadcast;
mod config;
mod coordinator;
mod entity;
mod error;
mod error_context;
mod event_log;
mod executor;
mod lock;
mod operations;
mod state;
mod store;

pub use broadcast::{Broadcaster, StateChange, Subscription};
pub use config::{CoordinatorConfig, RetryPolicy};
pub use coordinator::{
    Coordinator, EntitySnapshot, RetryScheduler, RetryTicket, TransitionOutcome, TransitionRequest,
};
pub use entity::EntityKey;
pub use error::{CoreError, CoreResult};
pub use error_context::{
    classify, ErrorContext, ErrorContextManager, ErrorGuidance, ErrorKind, ErrorSeverity,
    Failure, GuidanceLink, RetryDecision,
};
pub use event_log::{unix_millis, EventLog, RecordStatus, TransitionRecord, TransitionSource};
pub use executor::{CheckOutcome, Executor, ExecutorError, MockExecutor, OperationKind};
pub use lock::{Lease, LeaseGuard, LockManager};
pub use operations::{OperationReport, OperationRunner, OperationStatus};
pub use state::{transition_table, PluginState};
pub use store::{StateEntry, StateMetadata, StateStore};
