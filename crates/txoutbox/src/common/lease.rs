//! Lane leasing
//!
//! At most one worker across all relay nodes may pump a lane at a time.
//! Ownership is a time-bounded lease on the lane's lock name; workers
//! refresh it well inside the TTL and fall back to re-acquiring when a
//! refresh fails. [`MemoryLeaseCoordinator`] covers single-process
//! deployments and tests; clustered deployments plug in a coordinator
//! backed by their consensus store.

use crate::common::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Proof of lane ownership handed out by a coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseToken {
    /// Resource the lease covers
    pub resource: String,
    /// Distinguishes successive holders of the same resource
    pub holder_id: u64,
}

/// Exclusive, TTL-bounded locks over lane resources.
#[async_trait]
pub trait LeaseCoordinator: Send + Sync {
    /// Try to take the lease. Returns `None` while another holder has it.
    async fn try_acquire(&self, resource: &str, ttl: Duration) -> Result<Option<LeaseToken>>;

    /// Extend a held lease by its TTL. Returns `false` once the lease has
    /// expired or moved to another holder; the caller must stop working
    /// the lane and re-acquire.
    async fn refresh(&self, token: &LeaseToken) -> Result<bool>;

    /// Give the lease up.
    async fn release(&self, token: &LeaseToken) -> Result<()>;

    /// Cheap local check that the lease still looks held. Workers call
    /// this every cycle; it must not block on the network.
    fn is_held(&self, token: &LeaseToken) -> bool;
}

struct HeldLease {
    holder_id: u64,
    ttl: Duration,
    expires_at: Instant,
}

/// In-process lease coordinator.
pub struct MemoryLeaseCoordinator {
    leases: Mutex<HashMap<String, HeldLease>>,
    next_holder_id: AtomicU64,
}

impl MemoryLeaseCoordinator {
    pub fn new() -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            next_holder_id: AtomicU64::new(1),
        }
    }

    /// Drop a lease immediately regardless of holder. Simulates an expiry
    /// or a coordinator-side eviction.
    pub fn expire(&self, resource: &str) {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        leases.remove(resource);
    }

    /// Drop every held lease.
    pub fn expire_all(&self) {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        leases.clear();
    }

    /// Number of currently held, unexpired leases.
    pub fn held_count(&self) -> usize {
        let leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        leases.values().filter(|l| l.expires_at > now).count()
    }
}

impl Default for MemoryLeaseCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LeaseCoordinator for MemoryLeaseCoordinator {
    async fn try_acquire(&self, resource: &str, ttl: Duration) -> Result<Option<LeaseToken>> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        if let Some(held) = leases.get(resource) {
            if held.expires_at > now {
                return Ok(None);
            }
        }
        let holder_id = self.next_holder_id.fetch_add(1, Ordering::SeqCst);
        leases.insert(
            resource.to_string(),
            HeldLease {
                holder_id,
                ttl,
                expires_at: now + ttl,
            },
        );
        Ok(Some(LeaseToken {
            resource: resource.to_string(),
            holder_id,
        }))
    }

    async fn refresh(&self, token: &LeaseToken) -> Result<bool> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        match leases.get_mut(&token.resource) {
            Some(held) if held.holder_id == token.holder_id && held.expires_at > now => {
                // Extend from now, not from the previous deadline
                held.expires_at = now + held.ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release(&self, token: &LeaseToken) -> Result<()> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(held) = leases.get(&token.resource) {
            if held.holder_id == token.holder_id {
                leases.remove(&token.resource);
            }
        }
        Ok(())
    }

    fn is_held(&self, token: &LeaseToken) -> bool {
        let leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        leases
            .get(&token.resource)
            .is_some_and(|held| held.holder_id == token.holder_id && held.expires_at > Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn test_acquire_is_exclusive() {
        let coordinator = MemoryLeaseCoordinator::new();
        let token = coordinator.try_acquire("lane-0", TTL).await.unwrap().unwrap();
        assert!(coordinator.is_held(&token));

        // Second acquire is refused while the first holder lives
        assert!(coordinator.try_acquire("lane-0", TTL).await.unwrap().is_none());

        // A different resource is independent
        assert!(coordinator.try_acquire("lane-1", TTL).await.unwrap().is_some());
        assert_eq!(coordinator.held_count(), 2);
    }

    #[tokio::test]
    async fn test_release_enables_reacquire() {
        let coordinator = MemoryLeaseCoordinator::new();
        let token = coordinator.try_acquire("lane-0", TTL).await.unwrap().unwrap();
        coordinator.release(&token).await.unwrap();
        assert!(!coordinator.is_held(&token));

        let again = coordinator.try_acquire("lane-0", TTL).await.unwrap().unwrap();
        assert_ne!(again.holder_id, token.holder_id);
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken() {
        let coordinator = MemoryLeaseCoordinator::new();
        let token = coordinator
            .try_acquire("lane-0", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert!(!coordinator.is_held(&token));
        assert!(!coordinator.refresh(&token).await.unwrap());

        let successor = coordinator.try_acquire("lane-0", TTL).await.unwrap();
        assert!(successor.is_some());
    }

    #[tokio::test]
    async fn test_refresh_keeps_lease_alive() {
        let coordinator = MemoryLeaseCoordinator::new();
        let token = coordinator
            .try_acquire("lane-0", Duration::from_millis(80))
            .await
            .unwrap()
            .unwrap();

        for _ in 0..4 {
            tokio::time::sleep(Duration::from_millis(40)).await;
            assert!(coordinator.refresh(&token).await.unwrap());
        }
        assert!(coordinator.is_held(&token));
    }

    #[tokio::test]
    async fn test_stale_holder_cannot_release_successor() {
        let coordinator = MemoryLeaseCoordinator::new();
        let stale = coordinator.try_acquire("lane-0", TTL).await.unwrap().unwrap();
        coordinator.expire("lane-0");
        let current = coordinator.try_acquire("lane-0", TTL).await.unwrap().unwrap();

        // The evicted holder's release must not unseat the new one
        coordinator.release(&stale).await.unwrap();
        assert!(coordinator.is_held(&current));
        assert!(!coordinator.refresh(&stale).await.unwrap());
    }

    #[tokio::test]
    async fn test_expire_forces_loss() {
        let coordinator = MemoryLeaseCoordinator::new();
        let token = coordinator.try_acquire("lane-0", TTL).await.unwrap().unwrap();
        coordinator.expire("lane-0");
        assert!(!coordinator.is_held(&token));
        assert!(!coordinator.refresh(&token).await.unwrap());
    }
}
