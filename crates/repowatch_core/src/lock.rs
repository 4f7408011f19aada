//! Leased mutual exclusion per entity.

use crate::entity::EntityKey;
use crate::error::{CoreError, CoreResult};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

/// A time-bounded exclusive claim on one entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    entity: EntityKey,
    holder_token: Uuid,
    acquired_at: Instant,
    expires_at: Instant,
}

impl Lease {
    /// The leased entity.
    pub fn entity(&self) -> &EntityKey {
        &self.entity
    }

    /// Token identifying the holder.
    pub fn holder_token(&self) -> Uuid {
        self.holder_token
    }

    /// When the lease was granted.
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// When the lease stops protecting the entity.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Returns true if the lease has lapsed at `now`.
    pub fn is_expired_at(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// Returns true if the lease has lapsed.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Instant::now())
    }
}

/// Grants at most one valid lease per entity.
///
/// Acquisition never blocks: a held, unexpired lease yields
/// [`CoreError::LockBusy`] immediately. Expiry is enforced lazily when the
/// next caller tries to acquire.
pub struct LockManager {
    leases: Mutex<HashMap<EntityKey, Lease>>,
    default_ttl: Duration,
}

impl LockManager {
    /// Creates a lock manager whose leases last `default_ttl` unless
    /// acquired with an explicit TTL.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    /// Returns the TTL used by [`LockManager::acquire_default`].
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Acquires a lease on `entity` for `ttl`.
    pub fn acquire(&self, entity: &EntityKey, ttl: Duration) -> CoreResult<Lease> {
        let now = Instant::now();
        let mut leases = self.leases.lock();

        if let Some(existing) = leases.get(entity) {
            if !existing.is_expired_at(now) {
                debug!(entity = %entity, "lease busy");
                return Err(CoreError::LockBusy {
                    entity: entity.to_string(),
                });
            }
            info!(
                entity = %entity,
                holder = %existing.holder_token,
                "reclaiming expired lease"
            );
        }

        let lease = Lease {
            entity: entity.clone(),
            holder_token: Uuid::new_v4(),
            acquired_at: now,
            expires_at: now + ttl,
        };
        leases.insert(entity.clone(), lease.clone());
        Ok(lease)
    }

    /// Acquires a lease with the default TTL.
    pub fn acquire_default(&self, entity: &EntityKey) -> CoreResult<Lease> {
        self.acquire(entity, self.default_ttl)
    }

    /// Releases a lease.
    ///
    /// Returns false if the entity's recorded lease belongs to someone else,
    /// which happens when this lease expired and was reclaimed.
    pub fn release(&self, lease: &Lease) -> bool {
        let mut leases = self.leases.lock();
        match leases.get(&lease.entity) {
            Some(current) if current.holder_token == lease.holder_token => {
                leases.remove(&lease.entity);
                true
            }
            _ => false,
        }
    }

    /// Pushes the recorded expiry of `lease` to a full TTL from now.
    ///
    /// Fails with [`CoreError::LeaseMismatch`] once the lease was reclaimed.
    pub fn renew(&self, lease: &Lease) -> CoreResult<()> {
        let mut leases = self.leases.lock();
        match leases.get_mut(&lease.entity) {
            Some(current) if current.holder_token == lease.holder_token => {
                current.expires_at = Instant::now() + self.default_ttl;
                Ok(())
            }
            _ => Err(CoreError::LeaseMismatch {
                entity: lease.entity.to_string(),
            }),
        }
    }

    /// Checks that `lease` is still the one recorded for its entity.
    ///
    /// An expired lease that nobody reclaimed still verifies, so an
    /// operation that outlives its TTL can record its own outcome.
    pub fn verify(&self, lease: &Lease) -> CoreResult<()> {
        match self.leases.lock().get(&lease.entity) {
            Some(current) if current.holder_token == lease.holder_token => Ok(()),
            _ => Err(CoreError::LeaseMismatch {
                entity: lease.entity.to_string(),
            }),
        }
    }

    /// Returns true if the entity has a valid lease.
    pub fn is_locked(&self, entity: &EntityKey) -> bool {
        self.holder(entity).is_some()
    }

    /// Returns the valid lease on the entity, if any.
    pub fn holder(&self, entity: &EntityKey) -> Option<Lease> {
        let now = Instant::now();
        self.leases
            .lock()
            .get(entity)
            .filter(|lease| !lease.is_expired_at(now))
            .cloned()
    }

}

/// Releases its lease when dropped.
pub struct LeaseGuard {
    locks: Arc<LockManager>,
    lease: Lease,
}

impl LeaseGuard {
    pub(crate) fn new(locks: Arc<LockManager>, lease: Lease) -> Self {
        Self { locks, lease }
    }

    /// The held lease.
    pub fn lease(&self) -> &Lease {
        &self.lease
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if !self.locks.release(&self.lease) {
            debug!(entity = %self.lease.entity, "lease was reclaimed before release");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(s: &str) -> EntityKey {
        EntityKey::parse(s).unwrap()
    }

    #[test]
    fn second_acquire_is_busy() {
        let locks = LockManager::new(Duration::from_secs(30));
        let entity = key("acme/widget");

        let lease = locks.acquire_default(&entity).unwrap();
        assert!(locks.is_locked(&entity));

        let err = locks.acquire_default(&entity).unwrap_err();
        assert!(err.is_busy());

        assert!(locks.release(&lease));
        assert!(!locks.is_locked(&entity));
        assert!(locks.acquire_default(&entity).is_ok());
    }

    #[test]
    fn different_entities_do_not_contend() {
        let locks = LockManager::new(Duration::from_secs(30));
        locks.acquire_default(&key("acme/widget")).unwrap();
        locks.acquire_default(&key("acme/gadget")).unwrap();
        assert!(locks.is_locked(&key("acme/widget")));
        assert!(locks.is_locked(&key("acme/gadget")));
    }

    #[test]
    fn expired_lease_is_reclaimed() {
        let locks = LockManager::new(Duration::from_secs(30));
        let entity = key("acme/widget");

        let stale = locks.acquire(&entity, Duration::ZERO).unwrap();
        assert!(stale.is_expired());
        assert!(!locks.is_locked(&entity));

        let fresh = locks.acquire_default(&entity).unwrap();
        assert_ne!(fresh.holder_token(), stale.holder_token());

        // The stale holder can neither release nor use the new lease.
        assert!(!locks.release(&stale));
        assert!(locks.verify(&stale).is_err());
        assert!(locks.verify(&fresh).is_ok());
    }

    #[test]
    fn expiry_after_ttl() {
        let locks = LockManager::new(Duration::from_secs(30));
        let entity = key("acme/widget");

        locks.acquire(&entity, Duration::from_millis(20)).unwrap();
        assert!(locks.acquire_default(&entity).unwrap_err().is_busy());

        std::thread::sleep(Duration::from_millis(40));
        assert!(locks.acquire_default(&entity).is_ok());
    }

    #[test]
    fn expired_but_unclaimed_lease_still_verifies() {
        let locks = LockManager::new(Duration::from_secs(30));
        let lease = locks.acquire(&key("acme/widget"), Duration::ZERO).unwrap();
        assert!(locks.verify(&lease).is_ok());
    }

    #[test]
    fn renewal_keeps_the_lease_alive() {
        let locks = LockManager::new(Duration::from_millis(30));
        let entity = key("acme/widget");

        let lease = locks.acquire_default(&entity).unwrap();
        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(15));
            locks.renew(&lease).unwrap();
        }
        assert!(locks.acquire_default(&entity).unwrap_err().is_busy());
    }

    #[test]
    fn reclaimed_lease_cannot_be_renewed() {
        let locks = LockManager::new(Duration::from_secs(30));
        let entity = key("acme/widget");

        let stale = locks.acquire(&entity, Duration::ZERO).unwrap();
        locks.acquire_default(&entity).unwrap();
        assert!(matches!(
            locks.renew(&stale),
            Err(CoreError::LeaseMismatch { .. })
        ));
    }

    #[test]
    fn guard_releases_on_drop() {
        let locks = Arc::new(LockManager::new(Duration::from_secs(30)));
        let entity = key("acme/widget");

        {
            let lease = locks.acquire_default(&entity).unwrap();
            let _guard = LeaseGuard::new(Arc::clone(&locks), lease);
            assert!(locks.is_locked(&entity));
        }

        assert!(!locks.is_locked(&entity));
    }
}
