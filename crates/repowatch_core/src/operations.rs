//! Install, activate, deactivate and re-check wrapped around an executor.
//!
//! Each operation holds the entity's lease from the first check of the
//! starting state until the terminal transition is recorded, renewing it
//! while the executor runs. Once the starting transition is applied the
//! rest runs on its own task, so a caller that goes away does not strand
//! the entity mid-operation. Executor calls run on the blocking pool; a
//! failure (or a panic) becomes the error state with a classified context,
//! never an error returned to the caller.

use crate::coordinator::{
    Coordinator, RetryScheduler, RetryTicket, TransitionOutcome, TransitionRequest,
};
use crate::entity::EntityKey;
use crate::error::{CoreError, CoreResult};
use crate::error_context::{ErrorContext, Failure};
use crate::event_log::TransitionSource;
use crate::executor::{Executor, ExecutorError, OperationKind};
use crate::lock::{Lease, LeaseGuard};
use crate::state::PluginState;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

/// How an operation ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// The executor succeeded and the terminal state was recorded.
    Completed,
    /// The executor failed; the entity is in the error state.
    Failed,
    /// The entity was not in a state the operation starts from.
    Rejected,
}

/// What an operation did, returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationReport {
    /// Target entity.
    pub entity: EntityKey,
    /// Operation that ran.
    pub operation: OperationKind,
    /// How it ended.
    pub status: OperationStatus,
    /// State after the operation.
    pub state: PluginState,
    /// When the state was last written.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<u64>,
    /// Error details if the entity ended in the error state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorContext>,
}

impl OperationReport {
    /// Returns true if the operation completed.
    pub fn is_completed(&self) -> bool {
        self.status == OperationStatus::Completed
    }
}

/// Runs executor-backed operations and automatic retries.
pub struct OperationRunner {
    coordinator: Arc<Coordinator>,
    executor: Arc<dyn Executor>,
    me: Weak<OperationRunner>,
}

impl OperationRunner {
    /// Creates a runner and installs it as the coordinator's retry
    /// scheduler.
    pub fn new(coordinator: Arc<Coordinator>, executor: Arc<dyn Executor>) -> Arc<Self> {
        let runner = Arc::new_cyclic(|me| Self {
            coordinator: Arc::clone(&coordinator),
            executor,
            me: me.clone(),
        });

        let scheduler: Weak<dyn RetryScheduler> = Arc::downgrade(&runner) as Weak<dyn RetryScheduler>;
        coordinator.set_retry_scheduler(scheduler);
        runner
    }

    /// Returns the coordinator.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// Installs an available package.
    ///
    /// `AVAILABLE -> INSTALLING -> INSTALLED_INACTIVE | ERROR`
    pub async fn install(self: &Arc<Self>, entity: &EntityKey) -> CoreResult<OperationReport> {
        let guard = self.coordinator.lease_guard(entity)?;
        info!(entity = %entity, "install started");

        let started = self.coordinator.submit_with_lease(
            guard.lease(),
            TransitionRequest::new(entity.clone(), PluginState::Installing),
        )?;
        if !started.is_applied() {
            return Ok(self.report(entity, OperationKind::Install, OperationStatus::Rejected));
        }

        let target = entity.clone();
        self.run_to_completion(
            guard,
            OperationKind::Install,
            entity,
            |executor, entity| executor.install(entity),
            move |()| {
                TransitionRequest::new(target, PluginState::InstalledInactive)
                    .expecting(PluginState::Installing)
            },
        )
        .await
    }

    /// Activates an installed, inactive package.
    pub async fn activate(self: &Arc<Self>, entity: &EntityKey) -> CoreResult<OperationReport> {
        self.toggle(
            entity,
            OperationKind::Activate,
            PluginState::InstalledInactive,
            PluginState::InstalledActive,
        )
        .await
    }

    /// Deactivates an active package.
    pub async fn deactivate(self: &Arc<Self>, entity: &EntityKey) -> CoreResult<OperationReport> {
        self.toggle(
            entity,
            OperationKind::Deactivate,
            PluginState::InstalledActive,
            PluginState::InstalledInactive,
        )
        .await
    }

    /// Scans the entity again.
    ///
    /// `CHECKING -> AVAILABLE | NOT_PLUGIN | ERROR`. The hop into `CHECKING`
    /// follows the graph except for [`TransitionSource::Rescan`], which
    /// forces it.
    pub async fn recheck(
        self: &Arc<Self>,
        entity: &EntityKey,
        source: TransitionSource,
    ) -> CoreResult<OperationReport> {
        let guard = self.coordinator.lease_guard(entity)?;

        let mut request =
            TransitionRequest::new(entity.clone(), PluginState::Checking).with_source(source);
        if source == TransitionSource::Rescan {
            request = request.forced();
        }

        let started = self.coordinator.submit_with_lease(guard.lease(), request)?;
        if !started.is_applied() {
            return Ok(self.report(entity, OperationKind::Check, OperationStatus::Rejected));
        }
        debug!(entity = %entity, source = ?source, "check started");

        let target = entity.clone();
        self.run_to_completion(
            guard,
            OperationKind::Check,
            entity,
            |executor, entity| executor.check(entity),
            move |outcome| {
                TransitionRequest::new(target, outcome.state()).expecting(PluginState::Checking)
            },
        )
        .await
    }

    async fn toggle(
        self: &Arc<Self>,
        entity: &EntityKey,
        operation: OperationKind,
        from: PluginState,
        to: PluginState,
    ) -> CoreResult<OperationReport> {
        let guard = self.coordinator.lease_guard(entity)?;

        // Record the refused attempt so it shows up in the log.
        if self.coordinator.get_state(entity) != from {
            self.coordinator.submit_with_lease(
                guard.lease(),
                TransitionRequest::new(entity.clone(), to).expecting(from),
            )?;
            return Ok(self.report(entity, operation, OperationStatus::Rejected));
        }
        info!(entity = %entity, operation = %operation, "operation started");

        let target = entity.clone();
        self.run_to_completion(
            guard,
            operation,
            entity,
            move |executor, entity| match operation {
                OperationKind::Activate => executor.activate(entity),
                _ => executor.deactivate(entity),
            },
            move |()| TransitionRequest::new(target, to).expecting(from),
        )
        .await
    }

    /// Runs the executor call and records the terminal transition on a
    /// task of its own that owns the lease.
    async fn run_to_completion<T, F, S>(
        self: &Arc<Self>,
        guard: LeaseGuard,
        operation: OperationKind,
        entity: &EntityKey,
        call: F,
        terminal: S,
    ) -> CoreResult<OperationReport>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Executor, &EntityKey) -> Result<T, ExecutorError> + Send + 'static,
        S: FnOnce(T) -> TransitionRequest + Send + 'static,
    {
        let runner = Arc::clone(self);
        let key = entity.clone();

        let task = tokio::spawn(async move {
            let result = runner.execute_leased(guard.lease(), operation, &key, call).await;
            match result {
                Ok(value) => runner.complete(guard.lease(), operation, terminal(value)),
                Err(err) => runner.fail(guard.lease(), &key, operation, err),
            }
        });

        match task.await {
            Ok(report) => report,
            Err(err) => {
                warn!(entity = %entity, operation = %operation, error = %err, "operation task aborted");
                Ok(self.report(entity, operation, OperationStatus::Failed))
            }
        }
    }

    /// Runs the executor call while keeping `lease` from expiring.
    async fn execute_leased<T, F>(
        &self,
        lease: &Lease,
        operation: OperationKind,
        entity: &EntityKey,
        call: F,
    ) -> Result<T, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Executor, &EntityKey) -> Result<T, ExecutorError> + Send + 'static,
    {
        let locks = self.coordinator.locks();
        let period = (locks.default_ttl() / 2).max(Duration::from_millis(1));
        let mut heartbeat = tokio::time::interval(period);
        heartbeat.tick().await;

        let work = self.execute(operation, entity, call);
        tokio::pin!(work);
        let mut renewing = true;

        loop {
            tokio::select! {
                result = &mut work => return result,
                _ = heartbeat.tick(), if renewing => {
                    if locks.renew(lease).is_err() {
                        warn!(entity = %entity, operation = %operation, "lease lost while executor ran");
                        renewing = false;
                    }
                }
            }
        }
    }

    async fn execute<T, F>(
        &self,
        operation: OperationKind,
        entity: &EntityKey,
        call: F,
    ) -> Result<T, ExecutorError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn Executor, &EntityKey) -> Result<T, ExecutorError> + Send + 'static,
    {
        let executor = Arc::clone(&self.executor);
        let key = entity.clone();

        match tokio::task::spawn_blocking(move || call(executor.as_ref(), &key)).await {
            Ok(result) => result,
            Err(err) => {
                warn!(entity = %entity, operation = %operation, error = %err, "executor aborted");
                Err(ExecutorError::new(format!("{operation} executor aborted: {err}")))
            }
        }
    }

    /// Records a terminal transition under `lease`, or under a fresh lease
    /// if this one was reclaimed after it lapsed.
    fn settle(&self, lease: &Lease, request: TransitionRequest) -> CoreResult<TransitionOutcome> {
        match self.coordinator.submit_with_lease(lease, request.clone()) {
            Err(CoreError::LeaseMismatch { .. }) => {
                warn!(entity = %request.entity, to = %request.to, "lease lost, recording outcome under a new lease");
                self.coordinator.submit(request)
            }
            other => other,
        }
    }

    fn complete(
        &self,
        lease: &Lease,
        operation: OperationKind,
        request: TransitionRequest,
    ) -> CoreResult<OperationReport> {
        let entity = request.entity.clone();
        let request = request.with_source(TransitionSource::Executor);
        let outcome = self.settle(lease, request)?;

        let status = if outcome.is_applied() {
            info!(entity = %entity, operation = %operation, state = %outcome.to, "operation completed");
            OperationStatus::Completed
        } else {
            // Someone forced the entity elsewhere while the executor ran.
            warn!(entity = %entity, operation = %operation, state = %outcome.to, "operation outcome discarded");
            OperationStatus::Rejected
        };
        Ok(self.report(&entity, operation, status))
    }

    fn fail(
        &self,
        lease: &Lease,
        entity: &EntityKey,
        operation: OperationKind,
        err: ExecutorError,
    ) -> CoreResult<OperationReport> {
        warn!(entity = %entity, operation = %operation, error = %err, "operation failed");

        let mut failure = Failure::new(err.message, operation);
        if let Some(kind) = err.kind {
            failure = failure.with_kind(kind);
        }

        self.settle(
            lease,
            TransitionRequest::new(entity.clone(), PluginState::Error)
                .with_context(failure.to_context())
                .with_source(TransitionSource::Executor),
        )?;
        Ok(self.report(entity, operation, OperationStatus::Failed))
    }

    fn report(
        &self,
        entity: &EntityKey,
        operation: OperationKind,
        status: OperationStatus,
    ) -> OperationReport {
        let snapshot = self.coordinator.describe(entity);
        OperationReport {
            entity: entity.clone(),
            operation,
            status,
            state: snapshot.state,
            updated_at: snapshot.updated_at,
            error: snapshot.error,
        }
    }

    async fn run_retry(self: &Arc<Self>, ticket: RetryTicket) {
        let entity = &ticket.entity;
        let attempt = ticket.attempt;
        if !self.coordinator.retry_is_current(&ticket) {
            debug!(entity = %entity, attempt, "failure superseded, retry skipped");
            return;
        }

        info!(entity = %entity, attempt, "automatic retry");
        match self.recheck(entity, TransitionSource::AutoRetry).await {
            Ok(report) => {
                debug!(entity = %entity, attempt, state = %report.state, "automatic retry finished");
            }
            Err(err) if err.is_busy() => {
                let delay = self.coordinator.config().retry.default_delay;
                debug!(entity = %entity, attempt, "entity busy, retry postponed");
                self.schedule_retry(RetryTicket {
                    delay,
                    ..ticket.clone()
                });
            }
            Err(err) => warn!(entity = %entity, attempt, error = %err, "automatic retry failed"),
        }
    }
}

impl RetryScheduler for OperationRunner {
    fn schedule_retry(&self, ticket: RetryTicket) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(entity = %ticket.entity, attempt = ticket.attempt, "no async runtime, retry not scheduled");
            return;
        };

        let runner = self.me.clone();
        handle.spawn(async move {
            tokio::time::sleep(ticket.delay).await;
            if let Some(runner) = runner.upgrade() {
                runner.run_retry(ticket).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error_context::ErrorKind;
    use crate::event_log::RecordStatus;
    use crate::executor::{CheckOutcome, MockExecutor};

    fn key() -> EntityKey {
        EntityKey::parse("acme/widget").unwrap()
    }

    fn setup() -> (Arc<Coordinator>, Arc<MockExecutor>, Arc<OperationRunner>) {
        let coordinator = Arc::new(Coordinator::default());
        let executor = Arc::new(MockExecutor::new());
        let runner = OperationRunner::new(
            Arc::clone(&coordinator),
            Arc::clone(&executor) as Arc<dyn Executor>,
        );
        (coordinator, executor, runner)
    }

    fn seed(coordinator: &Coordinator, state: PluginState) {
        coordinator
            .request_transition(&key(), state, None, true)
            .unwrap();
    }

    /// Installs slowly; everything else succeeds at once.
    struct SlowInstall;

    impl Executor for SlowInstall {
        fn check(&self, _: &EntityKey) -> Result<CheckOutcome, ExecutorError> {
            Ok(CheckOutcome::Available)
        }
        fn install(&self, _: &EntityKey) -> Result<(), ExecutorError> {
            std::thread::sleep(Duration::from_millis(200));
            Ok(())
        }
        fn activate(&self, _: &EntityKey) -> Result<(), ExecutorError> {
            Ok(())
        }
        fn deactivate(&self, _: &EntityKey) -> Result<(), ExecutorError> {
            Ok(())
        }
    }

    /// Lets another caller take and drop the lapsed lease mid-install.
    struct Reclaiming {
        coordinator: Arc<Coordinator>,
        outcome: Result<(), ExecutorError>,
    }

    impl Executor for Reclaiming {
        fn check(&self, _: &EntityKey) -> Result<CheckOutcome, ExecutorError> {
            Ok(CheckOutcome::Available)
        }
        fn install(&self, entity: &EntityKey) -> Result<(), ExecutorError> {
            let guard = self
                .coordinator
                .lease_guard(entity)
                .map_err(|err| ExecutorError::new(err.to_string()))?;
            drop(guard);
            self.outcome.clone()
        }
        fn activate(&self, _: &EntityKey) -> Result<(), ExecutorError> {
            Ok(())
        }
        fn deactivate(&self, _: &EntityKey) -> Result<(), ExecutorError> {
            Ok(())
        }
    }

    fn zero_ttl_coordinator() -> Arc<Coordinator> {
        Arc::new(Coordinator::new(
            crate::CoordinatorConfig::new().with_lock_ttl(Duration::ZERO),
        ))
    }

    #[tokio::test]
    async fn install_success() {
        let (coordinator, executor, runner) = setup();
        seed(&coordinator, PluginState::Available);

        let report = runner.install(&key()).await.unwrap();

        assert_eq!(report.status, OperationStatus::Completed);
        assert_eq!(report.state, PluginState::InstalledInactive);
        assert_eq!(executor.call_count(OperationKind::Install), 1);
        assert!(!coordinator.locks().is_locked(&key()));

        let states: Vec<PluginState> = coordinator
            .events_for(&key())
            .iter()
            .map(|r| r.to)
            .collect();
        assert_eq!(
            states,
            vec![
                PluginState::Available,
                PluginState::Installing,
                PluginState::InstalledInactive
            ]
        );
    }

    #[tokio::test]
    async fn install_from_wrong_state_is_rejected() {
        let (coordinator, executor, runner) = setup();
        seed(&coordinator, PluginState::NotPlugin);

        let report = runner.install(&key()).await.unwrap();

        assert_eq!(report.status, OperationStatus::Rejected);
        assert_eq!(report.state, PluginState::NotPlugin);
        assert_eq!(executor.call_count(OperationKind::Install), 0);
        let last = coordinator.recent_events(1).pop().unwrap();
        assert_eq!(last.status, RecordStatus::Rejected);
    }

    #[tokio::test]
    async fn install_failure_enters_error() {
        let (coordinator, executor, runner) = setup();
        seed(&coordinator, PluginState::Available);
        executor.push_install(Err(ExecutorError::new("403 Forbidden")));

        let report = runner.install(&key()).await.unwrap();

        assert_eq!(report.status, OperationStatus::Failed);
        assert_eq!(report.state, PluginState::Error);
        let error = report.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Permission);
        assert_eq!(error.source, OperationKind::Install);
        assert!(!error.recoverable);
        assert!(coordinator.error_context(&key()).is_some());
    }

    #[tokio::test]
    async fn activate_requires_inactive() {
        let (coordinator, executor, runner) = setup();

        // UNKNOWN -> INSTALLED_ACTIVE is a legal edge but not an activation.
        let report = runner.activate(&key()).await.unwrap();
        assert_eq!(report.status, OperationStatus::Rejected);
        assert_eq!(coordinator.get_state(&key()), PluginState::Unknown);
        assert_eq!(executor.call_count(OperationKind::Activate), 0);

        seed(&coordinator, PluginState::InstalledInactive);
        let report = runner.activate(&key()).await.unwrap();
        assert_eq!(report.status, OperationStatus::Completed);
        assert_eq!(report.state, PluginState::InstalledActive);

        let report = runner.deactivate(&key()).await.unwrap();
        assert_eq!(report.state, PluginState::InstalledInactive);
    }

    #[tokio::test]
    async fn activation_failure_is_classified() {
        let (coordinator, executor, runner) = setup();
        seed(&coordinator, PluginState::InstalledInactive);
        executor.push_activate(Err(ExecutorError::new("plugin raised a fatal error")));

        let report = runner.activate(&key()).await.unwrap();
        let error = report.error.unwrap();
        assert_eq!(error.kind, ErrorKind::Activation);
        assert!(error.recoverable);
        assert!(!error.will_auto_retry());
    }

    #[tokio::test]
    async fn busy_entity() {
        let (coordinator, _executor, runner) = setup();
        seed(&coordinator, PluginState::Available);

        let _guard = coordinator.lease_guard(&key()).unwrap();
        let err = runner.install(&key()).await.unwrap_err();
        assert!(err.is_busy());
    }

    #[tokio::test]
    async fn recheck_reports_outcome() {
        let (coordinator, executor, runner) = setup();
        executor.push_check(Ok(CheckOutcome::NotPlugin));

        let report = runner
            .recheck(&key(), TransitionSource::Discovery)
            .await
            .unwrap();
        assert_eq!(report.state, PluginState::NotPlugin);
        assert_eq!(coordinator.get_state(&key()), PluginState::NotPlugin);
    }

    #[tokio::test]
    async fn rescan_forces_checking() {
        let (coordinator, _executor, runner) = setup();
        seed(&coordinator, PluginState::InstalledActive);

        let report = runner.recheck(&key(), TransitionSource::User).await.unwrap();
        assert_eq!(report.status, OperationStatus::Rejected);

        let report = runner.recheck(&key(), TransitionSource::Rescan).await.unwrap();
        assert_eq!(report.status, OperationStatus::Completed);
        assert_eq!(report.state, PluginState::Available);
    }

    #[tokio::test]
    async fn executor_panic_becomes_error() {
        struct Panicking;
        impl Executor for Panicking {
            fn check(&self, _: &EntityKey) -> Result<CheckOutcome, ExecutorError> {
                panic!("boom")
            }
            fn install(&self, _: &EntityKey) -> Result<(), ExecutorError> {
                Ok(())
            }
            fn activate(&self, _: &EntityKey) -> Result<(), ExecutorError> {
                Ok(())
            }
            fn deactivate(&self, _: &EntityKey) -> Result<(), ExecutorError> {
                Ok(())
            }
        }

        let coordinator = Arc::new(Coordinator::new(
            crate::CoordinatorConfig::new().with_retry(crate::RetryPolicy::no_retry()),
        ));
        let runner = OperationRunner::new(Arc::clone(&coordinator), Arc::new(Panicking));

        let report = runner.recheck(&key(), TransitionSource::User).await.unwrap();
        assert_eq!(report.status, OperationStatus::Failed);
        assert_eq!(report.state, PluginState::Error);
        assert!(report.error.unwrap().message.contains("aborted"));
    }

    #[tokio::test(start_paused = true)]
    async fn generic_failure_retries_after_two_seconds() {
        let (coordinator, executor, runner) = setup();
        seed(&coordinator, PluginState::Available);
        executor.push_install(Err(ExecutorError::new("unexpected output")));

        let report = runner.install(&key()).await.unwrap();
        assert_eq!(
            report.error.unwrap().retry_delay(),
            Some(Duration::from_secs(2))
        );

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert_eq!(executor.call_count(OperationKind::Check), 0);

        tokio::time::sleep(Duration::from_millis(200)).await;
        for _ in 0..100 {
            if coordinator.get_state(&key()) == PluginState::Available {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(coordinator.get_state(&key()), PluginState::Available);
        assert_eq!(executor.call_count(OperationKind::Check), 1);
        assert_eq!(coordinator.retry_attempts(&key()), 0);
        assert!(coordinator.error_context(&key()).is_none());

        let retry = coordinator
            .events_for(&key())
            .into_iter()
            .find(|r| r.source == TransitionSource::AutoRetry)
            .unwrap();
        assert_eq!(retry.from, PluginState::Error);
        assert_eq!(retry.to, PluginState::Checking);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_skipped_when_operator_recovers_first() {
        let (coordinator, executor, runner) = setup();
        seed(&coordinator, PluginState::Available);
        executor.push_install(Err(ExecutorError::new("network timeout")));

        runner.install(&key()).await.unwrap();
        runner.recheck(&key(), TransitionSource::User).await.unwrap();
        assert_eq!(coordinator.get_state(&key()), PluginState::Available);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(executor.call_count(OperationKind::Check), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_retry_does_not_fire() {
        let (coordinator, executor, runner) = setup();
        seed(&coordinator, PluginState::Available);
        executor.push_install(Err(ExecutorError::new("API rate limit exceeded")));

        let report = runner.install(&key()).await.unwrap();
        assert!(report.error.unwrap().will_auto_retry());

        executor.push_check(Err(ExecutorError::new("repository not found")));
        let report = runner.recheck(&key(), TransitionSource::User).await.unwrap();
        let error = report.error.unwrap();
        assert_eq!(error.kind, ErrorKind::NotFound);
        assert!(!error.will_auto_retry());

        tokio::time::sleep(Duration::from_secs(120)).await;

        assert_eq!(executor.call_count(OperationKind::Check), 1);
        assert_eq!(coordinator.get_state(&key()), PluginState::Error);
        assert!(coordinator
            .events_for(&key())
            .iter()
            .all(|r| r.source != TransitionSource::AutoRetry));
    }

    #[tokio::test]
    async fn dropped_caller_does_not_strand_install() {
        let coordinator = Arc::new(Coordinator::default());
        let runner = OperationRunner::new(Arc::clone(&coordinator), Arc::new(SlowInstall));
        seed(&coordinator, PluginState::Available);

        let abandoned =
            tokio::time::timeout(Duration::from_millis(20), runner.install(&key())).await;
        assert!(abandoned.is_err());
        assert_eq!(coordinator.get_state(&key()), PluginState::Installing);

        for _ in 0..100 {
            if coordinator.get_state(&key()) == PluginState::InstalledInactive {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(coordinator.get_state(&key()), PluginState::InstalledInactive);
        assert!(!coordinator.locks().is_locked(&key()));
    }

    #[tokio::test]
    async fn lease_is_renewed_while_executor_runs() {
        let coordinator = Arc::new(Coordinator::new(
            crate::CoordinatorConfig::new().with_lock_ttl(Duration::from_millis(50)),
        ));
        let runner = OperationRunner::new(Arc::clone(&coordinator), Arc::new(SlowInstall));
        seed(&coordinator, PluginState::Available);

        let install = {
            let runner = Arc::clone(&runner);
            tokio::spawn(async move { runner.install(&key()).await })
        };
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(matches!(coordinator.lease_guard(&key()), Err(err) if err.is_busy()));

        let report = install.await.unwrap().unwrap();
        assert_eq!(report.status, OperationStatus::Completed);
        assert_eq!(report.state, PluginState::InstalledInactive);
    }

    #[tokio::test]
    async fn reclaimed_lease_still_records_completion() {
        let coordinator = zero_ttl_coordinator();
        let executor = Reclaiming {
            coordinator: Arc::clone(&coordinator),
            outcome: Ok(()),
        };
        let runner = OperationRunner::new(Arc::clone(&coordinator), Arc::new(executor));
        seed(&coordinator, PluginState::Available);

        let report = runner.install(&key()).await.unwrap();

        assert_eq!(report.status, OperationStatus::Completed);
        assert_eq!(coordinator.get_state(&key()), PluginState::InstalledInactive);
        assert!(!coordinator.locks().is_locked(&key()));
    }

    #[tokio::test]
    async fn reclaimed_lease_still_records_failure() {
        let coordinator = zero_ttl_coordinator();
        let executor = Reclaiming {
            coordinator: Arc::clone(&coordinator),
            outcome: Err(ExecutorError::new("403 Forbidden")),
        };
        let runner = OperationRunner::new(Arc::clone(&coordinator), Arc::new(executor));
        seed(&coordinator, PluginState::Available);

        let report = runner.install(&key()).await.unwrap();

        assert_eq!(report.status, OperationStatus::Failed);
        assert_eq!(coordinator.get_state(&key()), PluginState::Error);
        let error = coordinator.error_context(&key()).unwrap();
        assert_eq!(error.kind, ErrorKind::Permission);
        assert_eq!(error.source, OperationKind::Install);
    }
}
