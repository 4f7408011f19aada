//! Boundary to the host-specific executor.

use crate::entity::EntityKey;
use crate::error_context::ErrorKind;
use crate::state::PluginState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use thiserror::Error;

/// The operations the engine wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    /// Install the package.
    Install,
    /// Activate an installed package.
    Activate,
    /// Deactivate an active package.
    Deactivate,
    /// Scan the candidate.
    Check,
    /// A bare transition request with no executor behind it.
    Transition,
}

impl OperationKind {
    /// Returns the wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Install => "install",
            OperationKind::Activate => "activate",
            OperationKind::Deactivate => "deactivate",
            OperationKind::Check => "check",
            OperationKind::Transition => "transition",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed failure reported by an executor.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct ExecutorError {
    /// Human-readable message, classified when `kind` is absent.
    pub message: String,
    /// Classification, if the executor knows it.
    pub kind: Option<ErrorKind>,
}

impl ExecutorError {
    /// Creates an error classified from its message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
        }
    }

    /// Creates an error with an explicit classification.
    pub fn with_kind(message: impl Into<String>, kind: ErrorKind) -> Self {
        Self {
            message: message.into(),
            kind: Some(kind),
        }
    }
}

/// Result of scanning a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    /// The candidate is an installable plugin.
    Available,
    /// The candidate is not a plugin.
    NotPlugin,
}

impl CheckOutcome {
    /// The state a successful check lands in.
    pub fn state(self) -> PluginState {
        match self {
            CheckOutcome::Available => PluginState::Available,
            CheckOutcome::NotPlugin => PluginState::NotPlugin,
        }
    }
}

/// Performs host-specific actions for an entity.
///
/// Implementations may block; the engine calls them off the async runtime.
/// Failures are caught at this boundary and become the error state.
pub trait Executor: Send + Sync {
    /// Scans the candidate.
    fn check(&self, entity: &EntityKey) -> Result<CheckOutcome, ExecutorError>;

    /// Installs the package, leaving it inactive.
    fn install(&self, entity: &EntityKey) -> Result<(), ExecutorError>;

    /// Activates an installed package.
    fn activate(&self, entity: &EntityKey) -> Result<(), ExecutorError>;

    /// Deactivates an active package.
    fn deactivate(&self, entity: &EntityKey) -> Result<(), ExecutorError>;
}

/// A scriptable executor for testing.
///
/// Queued results are consumed in order per operation; once a queue is
/// empty the operation succeeds (checks report the default outcome).
#[derive(Debug)]
pub struct MockExecutor {
    default_check: Mutex<Result<CheckOutcome, ExecutorError>>,
    checks: Mutex<VecDeque<Result<CheckOutcome, ExecutorError>>>,
    installs: Mutex<VecDeque<Result<(), ExecutorError>>>,
    activations: Mutex<VecDeque<Result<(), ExecutorError>>>,
    deactivations: Mutex<VecDeque<Result<(), ExecutorError>>>,
    calls: Mutex<Vec<(OperationKind, EntityKey)>>,
}

impl MockExecutor {
    /// Creates an executor where everything succeeds.
    pub fn new() -> Self {
        Self {
            default_check: Mutex::new(Ok(CheckOutcome::Available)),
            checks: Mutex::new(VecDeque::new()),
            installs: Mutex::new(VecDeque::new()),
            activations: Mutex::new(VecDeque::new()),
            deactivations: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Sets what checks return once the queue is empty.
    pub fn set_default_check(&self, result: Result<CheckOutcome, ExecutorError>) {
        *self.default_check.lock() = result;
    }

    /// Queues a check result.
    pub fn push_check(&self, result: Result<CheckOutcome, ExecutorError>) {
        self.checks.lock().push_back(result);
    }

    /// Queues an install result.
    pub fn push_install(&self, result: Result<(), ExecutorError>) {
        self.installs.lock().push_back(result);
    }

    /// Queues an activation result.
    pub fn push_activate(&self, result: Result<(), ExecutorError>) {
        self.activations.lock().push_back(result);
    }

    /// Queues a deactivation result.
    pub fn push_deactivate(&self, result: Result<(), ExecutorError>) {
        self.deactivations.lock().push_back(result);
    }

    /// Returns every call made so far.
    pub fn calls(&self) -> Vec<(OperationKind, EntityKey)> {
        self.calls.lock().clone()
    }

    /// Returns how many times `operation` was called.
    pub fn call_count(&self, operation: OperationKind) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(kind, _)| *kind == operation)
            .count()
    }

    fn record(&self, operation: OperationKind, entity: &EntityKey) {
        self.calls.lock().push((operation, entity.clone()));
    }

    fn next(queue: &Mutex<VecDeque<Result<(), ExecutorError>>>) -> Result<(), ExecutorError> {
        queue.lock().pop_front().unwrap_or(Ok(()))
    }
}

impl Default for MockExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for MockExecutor {
    fn check(&self, entity: &EntityKey) -> Result<CheckOutcome, ExecutorError> {
        self.record(OperationKind::Check, entity);
        let queued = self.checks.lock().pop_front();
        queued.unwrap_or_else(|| self.default_check.lock().clone())
    }

    fn install(&self, entity: &EntityKey) -> Result<(), ExecutorError> {
        self.record(OperationKind::Install, entity);
        Self::next(&self.installs)
    }

    fn activate(&self, entity: &EntityKey) -> Result<(), ExecutorError> {
        self.record(OperationKind::Activate, entity);
        Self::next(&self.activations)
    }

    fn deactivate(&self, entity: &EntityKey) -> Result<(), ExecutorError> {
        self.record(OperationKind::Deactivate, entity);
        Self::next(&self.deactivations)
    }
}
