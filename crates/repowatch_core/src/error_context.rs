//! Classified failure information for entities in the error state.
//!
//! Failures reported by executors are classified into a fixed taxonomy.
//! Each kind carries a default recoverability, a retry delay and a guidance
//! bundle shown to the operator. Recoverable kinds with `auto_retry` get a
//! scheduled re-check, up to the policy's attempt cap.

use crate::config::RetryPolicy;
use crate::entity::EntityKey;
use crate::event_log::TransitionSource;
use crate::executor::OperationKind;
use crate::state::PluginState;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{info, warn};

/// Failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Remote API rate limit hit.
    RateLimit,
    /// The candidate does not exist remotely.
    NotFound,
    /// The host or remote refused access.
    Permission,
    /// Network failure or timeout.
    Network,
    /// Activation failed on the host.
    Activation,
    /// Deactivation failed on the host.
    Deactivation,
    /// Anything unclassified.
    Generic,
}

impl ErrorKind {
    /// Returns the wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Permission => "permission",
            ErrorKind::Network => "network",
            ErrorKind::Activation => "activation",
            ErrorKind::Deactivation => "deactivation",
            ErrorKind::Generic => "generic",
        }
    }

    /// Returns true if the condition can clear without code or config
    /// changes on the operator's side.
    pub fn is_recoverable(self) -> bool {
        !matches!(self, ErrorKind::NotFound | ErrorKind::Permission)
    }

    /// Returns true if a re-check may be scheduled automatically.
    pub fn auto_retry(self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit | ErrorKind::Network | ErrorKind::Generic
        )
    }

    /// Returns the default severity.
    pub fn severity(self) -> ErrorSeverity {
        match self {
            ErrorKind::RateLimit | ErrorKind::Network | ErrorKind::Deactivation => {
                ErrorSeverity::Warning
            }
            ErrorKind::NotFound | ErrorKind::Activation | ErrorKind::Generic => {
                ErrorSeverity::Error
            }
            ErrorKind::Permission => ErrorSeverity::Critical,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How loudly the failure should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Expected to clear by itself.
    Warning,
    /// Needs attention.
    Error,
    /// Blocks the entity until the operator acts.
    Critical,
}

impl ErrorSeverity {
    /// Returns the wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorSeverity::Warning => "warning",
            ErrorSeverity::Error => "error",
            ErrorSeverity::Critical => "critical",
        }
    }
}

/// Classifies a failure message.
///
/// Message keywords win; otherwise the failing operation decides between
/// activation, deactivation and generic. Status codes and single words
/// match whole words only, so `4015ms` is not a 401 and `dnsmasq` is not
/// DNS; multi-word phrases match anywhere.
pub fn classify(message: &str, operation: OperationKind) -> ErrorKind {
    let message = message.to_ascii_lowercase();
    let words: Vec<&str> = message
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    let has = |needles: &[&str]| {
        needles.iter().any(|needle| {
            if needle.contains(' ') {
                message.contains(needle)
            } else {
                words.contains(needle)
            }
        })
    };

    if has(&["rate limit", "ratelimit", "ratelimited", "too many requests", "429"]) {
        ErrorKind::RateLimit
    } else if has(&["not found", "404", "does not exist", "no such"]) {
        ErrorKind::NotFound
    } else if has(&[
        "permission",
        "permissions",
        "forbidden",
        "403",
        "unauthorized",
        "401",
        "access denied",
    ]) {
        ErrorKind::Permission
    } else if has(&[
        "timeout",
        "timed out",
        "network",
        "connection",
        "unreachable",
        "could not resolve",
        "dns",
    ]) {
        ErrorKind::Network
    } else {
        match operation {
            OperationKind::Activate => ErrorKind::Activation,
            OperationKind::Deactivate => ErrorKind::Deactivation,
            _ => ErrorKind::Generic,
        }
    }
}

/// A link offered alongside guidance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidanceLink {
    /// Link text.
    pub label: String,
    /// Target URL.
    pub url: String,
}

/// Operator-facing explanation of a failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorGuidance {
    /// Short headline.
    pub title: String,
    /// One or two sentences of explanation.
    pub description: String,
    /// Things the operator can do.
    pub steps: Vec<String>,
    /// Further reading.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<GuidanceLink>,
    /// Whether a retry will happen without operator action.
    pub auto_retry: bool,
}

impl ErrorGuidance {
    /// Builds the default guidance for a kind. `retry_in` is set when an
    /// automatic retry was scheduled.
    pub fn for_kind(kind: ErrorKind, retry_in: Option<Duration>) -> Self {
        let (title, description, steps, links): (&str, &str, Vec<&str>, Vec<GuidanceLink>) =
            match kind {
                ErrorKind::RateLimit => (
                    "Rate limit reached",
                    "The remote API refused the request because too many were made in a short time.",
                    vec![
                        "Wait for the automatic retry",
                        "Configure an API token to raise the limit",
                    ],
                    vec![GuidanceLink {
                        label: "GitHub REST API rate limits".into(),
                        url: "https://docs.github.com/en/rest/using-the-rest-api/rate-limits-for-the-rest-api".into(),
                    }],
                ),
                ErrorKind::NotFound => (
                    "Repository not found",
                    "The repository could not be found. It may have been renamed, deleted or made private.",
                    vec![
                        "Check the owner and repository name",
                        "Confirm the repository is public or that the token can read it",
                    ],
                    Vec::new(),
                ),
                ErrorKind::Permission => (
                    "Permission denied",
                    "The host or the remote service refused the operation.",
                    vec![
                        "Check that the current account may install and activate plugins",
                        "Check file system permissions of the plugin directory",
                    ],
                    vec![GuidanceLink {
                        label: "GitHub authentication".into(),
                        url: "https://docs.github.com/en/authentication".into(),
                    }],
                ),
                ErrorKind::Network => (
                    "Network problem",
                    "The remote service could not be reached or did not answer in time.",
                    vec![
                        "Wait for the automatic retry",
                        "Check the host's outbound connectivity",
                    ],
                    Vec::new(),
                ),
                ErrorKind::Activation => (
                    "Activation failed",
                    "The plugin was installed but the host could not activate it.",
                    vec![
                        "Check the host's error log for fatal errors raised by the plugin",
                        "Look for conflicts with already active plugins",
                        "Retry activation once the cause is fixed",
                    ],
                    Vec::new(),
                ),
                ErrorKind::Deactivation => (
                    "Deactivation failed",
                    "The host could not deactivate the plugin.",
                    vec![
                        "Check the host's error log",
                        "Retry deactivation",
                    ],
                    Vec::new(),
                ),
                ErrorKind::Generic => (
                    "Unexpected error",
                    "The operation failed for an unexpected reason.",
                    vec!["Wait for the automatic retry", "Re-check the repository manually"],
                    Vec::new(),
                ),
            };

        let description = match retry_in {
            Some(delay) => format!(
                "{description} Retrying automatically in {} seconds.",
                delay.as_secs().max(1)
            ),
            None => description.to_string(),
        };

        Self {
            title: title.to_string(),
            description,
            steps: steps.iter().map(|s| s.to_string()).collect(),
            links,
            auto_retry: retry_in.is_some(),
        }
    }

    /// Guidance once automatic retries are used up.
    pub fn retries_exhausted(kind: ErrorKind, attempts: u32) -> Self {
        let base = Self::for_kind(kind, None);
        let mut steps = vec!["Re-check the repository manually once the cause is fixed".to_string()];
        steps.extend(base.steps);

        Self {
            title: format!("{} (automatic retries exhausted)", base.title),
            description: format!(
                "{} Gave up after {attempts} automatic retries; manual action is required.",
                base.description
            ),
            steps,
            links: base.links,
            auto_retry: false,
        }
    }
}

/// A failure to record, as reported at the executor boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Failure {
    /// Human-readable message.
    pub message: String,
    /// Operation that failed.
    #[serde(rename = "operation")]
    pub source: OperationKind,
    /// Classification supplied by the executor, if it knows better than
    /// the keyword classifier.
    #[serde(default, rename = "error_type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
}

impl Failure {
    /// Creates a failure to be classified from its message.
    pub fn new(message: impl Into<String>, source: OperationKind) -> Self {
        Self {
            message: message.into(),
            source,
            kind: None,
        }
    }

    /// Sets an explicit classification.
    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Encodes the failure as a transition context payload.
    pub fn to_context(&self) -> Value {
        serde_json::to_value(self).unwrap_or_else(|_| json!({ "message": self.message }))
    }

    /// Extracts a failure from a transition context payload.
    ///
    /// Missing fields fall back to a generic transition failure.
    pub fn from_context(context: Option<&Value>) -> Self {
        let message = context
            .and_then(|c| c.get("message"))
            .and_then(Value::as_str)
            .unwrap_or("entered error state without a message");
        let source = context
            .and_then(|c| c.get("operation"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or(OperationKind::Transition);
        let kind = context
            .and_then(|c| c.get("error_type"))
            .and_then(|v| serde_json::from_value(v.clone()).ok());

        Self {
            message: message.to_string(),
            source,
            kind,
        }
    }
}

/// Failure details attached to an entity while it is in the error state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Failed entity.
    pub entity: EntityKey,
    /// When the failure was recorded (unix millis).
    pub timestamp: u64,
    /// Message from the executor.
    pub message: String,
    /// Operation that failed.
    pub source: OperationKind,
    /// Classification.
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    /// Presentation severity.
    pub severity: ErrorSeverity,
    /// Automatic retries already spent before this failure.
    pub retry_count: u32,
    /// Whether the entity can leave the error state through a re-check.
    pub recoverable: bool,
    /// Delay of the scheduled retry, if any (millis).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay_ms: Option<u64>,
    /// When the scheduled retry fires (unix millis).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<u64>,
    /// Operator guidance.
    pub guidance: ErrorGuidance,
}

impl ErrorContext {
    /// Returns true if an automatic retry is scheduled.
    pub fn will_auto_retry(&self) -> bool {
        self.next_retry_at.is_some()
    }

    /// Returns the scheduled retry delay.
    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay_ms.map(Duration::from_millis)
    }
}

/// What to do about a freshly recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-check after `delay`; this is retry number `attempt` (1-based).
    Scheduled {
        /// Retry number.
        attempt: u32,
        /// Delay before the retry.
        delay: Duration,
    },
    /// The cap was reached after `attempts` retries.
    Exhausted {
        /// Retries spent.
        attempts: u32,
    },
    /// The kind is not retried automatically.
    NotEligible,
}

#[derive(Default)]
struct ManagerInner {
    contexts: HashMap<EntityKey, ErrorContext>,
    attempts: HashMap<EntityKey, u32>,
}

/// Owns error contexts and consecutive-retry counters per entity.
pub struct ErrorContextManager {
    policy: RetryPolicy,
    inner: Mutex<ManagerInner>,
}

impl ErrorContextManager {
    /// Creates a manager using `policy`.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(ManagerInner::default()),
        }
    }

    /// Returns the retry policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Records a failure for an entity entering the error state.
    pub fn record(
        &self,
        entity: &EntityKey,
        failure: &Failure,
        now: u64,
    ) -> (ErrorContext, RetryDecision) {
        let kind = failure
            .kind
            .unwrap_or_else(|| classify(&failure.message, failure.source));
        let recoverable = kind.is_recoverable();

        let mut inner = self.inner.lock();
        let spent = inner.attempts.get(entity).copied().unwrap_or(0);

        let decision = if !self.policy.auto_retry || !recoverable || !kind.auto_retry() {
            RetryDecision::NotEligible
        } else if spent >= self.policy.max_attempts {
            RetryDecision::Exhausted { attempts: spent }
        } else {
            RetryDecision::Scheduled {
                attempt: spent + 1,
                delay: self.policy.delay_for(kind, spent),
            }
        };

        let (guidance, retry_delay_ms, next_retry_at) = match decision {
            RetryDecision::Scheduled { attempt, delay } => {
                inner.attempts.insert(entity.clone(), attempt);
                let delay_ms = delay.as_millis() as u64;
                info!(entity = %entity, kind = %kind, attempt, delay_ms, "retry scheduled");
                (
                    ErrorGuidance::for_kind(kind, Some(delay)),
                    Some(delay_ms),
                    Some(now + delay_ms),
                )
            }
            RetryDecision::Exhausted { attempts } => {
                warn!(entity = %entity, kind = %kind, attempts, "automatic retries exhausted");
                (ErrorGuidance::retries_exhausted(kind, attempts), None, None)
            }
            RetryDecision::NotEligible => (ErrorGuidance::for_kind(kind, None), None, None),
        };

        let context = ErrorContext {
            entity: entity.clone(),
            timestamp: now,
            message: failure.message.clone(),
            source: failure.source,
            kind,
            severity: kind.severity(),
            retry_count: spent,
            recoverable,
            retry_delay_ms,
            next_retry_at,
            guidance,
        };
        inner.contexts.insert(entity.clone(), context.clone());

        (context, decision)
    }

    /// Updates bookkeeping after an effective transition.
    ///
    /// Leaving the error state drops the context. The retry counter
    /// survives an automatic retry's hop to `Checking` and is reset once the
    /// entity settles in a stable state or an operator moves it out of the
    /// error state.
    pub(crate) fn on_transition(
        &self,
        entity: &EntityKey,
        from: PluginState,
        to: PluginState,
        source: TransitionSource,
    ) {
        let mut inner = self.inner.lock();
        let leaving_error = from == PluginState::Error && to != PluginState::Error;

        if leaving_error {
            inner.contexts.remove(entity);
        }
        if to.is_stable() || (leaving_error && source != TransitionSource::AutoRetry) {
            inner.attempts.remove(entity);
        }
    }

    /// Returns the entity's error context.
    pub fn get(&self, entity: &EntityKey) -> Option<ErrorContext> {
        self.inner.lock().contexts.get(entity).cloned()
    }

    /// Returns the automatic retries spent on the entity.
    pub fn attempts(&self, entity: &EntityKey) -> u32 {
        self.inner.lock().attempts.get(entity).copied().unwrap_or(0)
    }

    /// Returns the number of entities with an error context.
    pub fn len(&self) -> usize {
        self.inner.lock().contexts.len()
    }

    /// Returns true if no entity has an error context.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().contexts.is_empty()
    }
}
