//! Configuration for the coordinator.

use crate::error_context::ErrorKind;
use std::time::Duration;

/// Configuration for a [`Coordinator`](crate::Coordinator).
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long a lease protects an entity.
    pub lock_ttl: Duration,
    /// Number of transition records kept in the event log.
    pub event_log_capacity: usize,
    /// Events buffered per subscriber before it starts lagging.
    pub broadcast_capacity: usize,
    /// Automatic retry behaviour for failed entities.
    pub retry: RetryPolicy,
}

impl CoordinatorConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            lock_ttl: Duration::from_secs(45),
            event_log_capacity: 300,
            broadcast_capacity: 256,
            retry: RetryPolicy::default(),
        }
    }

    /// Sets the lease TTL.
    pub fn with_lock_ttl(mut self, ttl: Duration) -> Self {
        self.lock_ttl = ttl;
        self
    }

    /// Sets the event log capacity.
    pub fn with_event_log_capacity(mut self, capacity: usize) -> Self {
        self.event_log_capacity = capacity;
        self
    }

    /// Sets the per-subscriber buffer size.
    pub fn with_broadcast_capacity(mut self, capacity: usize) -> Self {
        self.broadcast_capacity = capacity;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry scheduling for entities in the error state.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Whether eligible errors are retried automatically at all.
    pub auto_retry: bool,
    /// Consecutive automatic retries before giving up.
    pub max_attempts: u32,
    /// Flat delay after a rate-limit error.
    pub rate_limit_delay: Duration,
    /// First delay after a network error; doubles per attempt.
    pub network_initial_delay: Duration,
    /// Upper bound for network backoff.
    pub network_max_delay: Duration,
    /// Delay for every other retryable error.
    pub default_delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy with `max_attempts` retries and default delays.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            auto_retry: true,
            max_attempts,
            rate_limit_delay: Duration::from_secs(60),
            network_initial_delay: Duration::from_secs(5),
            network_max_delay: Duration::from_secs(30),
            default_delay: Duration::from_secs(2),
        }
    }

    /// Creates a policy that never retries automatically.
    pub fn no_retry() -> Self {
        Self {
            auto_retry: false,
            max_attempts: 0,
            ..Self::new(0)
        }
    }

    /// Sets the rate-limit delay.
    pub fn with_rate_limit_delay(mut self, delay: Duration) -> Self {
        self.rate_limit_delay = delay;
        self
    }

    /// Sets the network backoff bounds.
    pub fn with_network_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.network_initial_delay = initial;
        self.network_max_delay = max;
        self
    }

    /// Sets the delay for other retryable errors.
    pub fn with_default_delay(mut self, delay: Duration) -> Self {
        self.default_delay = delay;
        self
    }

    /// Calculates the delay before retry number `attempt` (0-indexed).
    pub fn delay_for(&self, kind: ErrorKind, attempt: u32) -> Duration {
        match kind {
            ErrorKind::RateLimit => self.rate_limit_delay,
            ErrorKind::Network => {
                let factor = 2u32.saturating_pow(attempt);
                self.network_initial_delay
                    .saturating_mul(factor)
                    .min(self.network_max_delay)
            }
            _ => self.default_delay,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}
