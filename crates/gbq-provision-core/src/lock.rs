//! Per-stack-name mutual exclusion.
//!
//! One async mutex per stack name, created on first use. Every holder and
//! waiter is counted on the entry, and the entry is removed when the count
//! drops to zero, whether the last user released, failed or was cancelled
//! while still waiting. Waiters queue in FIFO order on the tokio mutex. The
//! lock is released when the [`StackGuard`] drops, which also covers early
//! returns, panics and a cancelled future.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::debug;

use crate::types::StackHandle;

#[derive(Debug, Default)]
struct Slot {
    lock: Arc<AsyncMutex<()>>,
    users: usize,
}

type Registry = HashMap<String, Slot>;

#[derive(Debug, Default)]
pub struct StackLocks {
    entries: Mutex<Registry>,
}

impl StackLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits until no other guard for `name` is alive, then returns one.
    pub async fn acquire(self: &Arc<Self>, name: &str) -> StackGuard {
        let (registration, lock) = self.register(name);
        let held = lock.lock_owned().await;
        debug!(stack = name, "stack lock acquired");
        StackGuard::new(registration, held)
    }

    pub fn try_acquire(self: &Arc<Self>, name: &str) -> Option<StackGuard> {
        let (registration, lock) = self.register(name);
        let held = lock.try_lock_owned().ok()?;
        Some(StackGuard::new(registration, held))
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.registry()
            .get(name)
            .is_some_and(|slot| slot.lock.try_lock().is_err())
    }

    /// Number of names with a live holder or waiter.
    pub fn tracked(&self) -> usize {
        self.registry().len()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register(self: &Arc<Self>, name: &str) -> (Registration, Arc<AsyncMutex<()>>) {
        let mut entries = self.registry();
        let slot = entries.entry(name.to_string()).or_default();
        slot.users += 1;
        let lock = Arc::clone(&slot.lock);
        let registration = Registration {
            locks: Arc::clone(self),
            name: name.to_string(),
        };
        (registration, lock)
    }

    fn release(&self, name: &str) {
        let mut entries = self.registry();
        if let Some(slot) = entries.get_mut(name) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                entries.remove(name);
            }
        }
    }
}

/// One counted user of a registry entry, from the start of the wait until
/// the guard is gone.
#[derive(Debug)]
struct Registration {
    locks: Arc<StackLocks>,
    name: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.locks.release(&self.name);
    }
}

#[derive(Debug)]
pub struct StackGuard {
    handle: StackHandle,
    held: Option<OwnedMutexGuard<()>>,
    registration: Registration,
}

impl StackGuard {
    fn new(registration: Registration, held: OwnedMutexGuard<()>) -> Self {
        Self {
            handle: StackHandle {
                name: registration.name.clone(),
                locked: true,
            },
            held: Some(held),
            registration,
        }
    }

    pub fn handle(&self) -> &StackHandle {
        &self.handle
    }

    pub fn name(&self) -> &str {
        &self.handle.name
    }
}

impl Drop for StackGuard {
    // `registration` drops after this body, so the entry outlives the unlock.
    fn drop(&mut self) {
        drop(self.held.take());
        self.handle.locked = false;
        debug!(stack = %self.registration.name, "stack lock released");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn same_name_is_exclusive() {
        let locks = Arc::new(StackLocks::new());
        let guard = locks.acquire("tenant-a.b").await;
        assert!(guard.handle().locked);
        assert!(locks.is_locked("tenant-a.b"));
        assert!(locks.try_acquire("tenant-a.b").is_none());

        drop(guard);
        assert!(!locks.is_locked("tenant-a.b"));
        assert!(locks.try_acquire("tenant-a.b").is_some());
    }

    #[tokio::test]
    async fn distinct_names_do_not_block() {
        let locks = Arc::new(StackLocks::new());
        let _first = locks.acquire("tenant-a.one").await;
        let second = tokio::time::timeout(Duration::from_secs(1), locks.acquire("tenant-a.two"))
            .await
            .expect("distinct stack names must not block each other");
        assert_eq!(second.name(), "tenant-a.two");
    }

    #[tokio::test]
    async fn waiter_proceeds_after_release() {
        let locks = Arc::new(StackLocks::new());
        let guard = locks.acquire("tenant-a.b").await;

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let guard = locks.acquire("tenant-a.b").await;
                guard.name().to_string()
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        let name = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be released")
            .expect("waiter task panicked");
        assert_eq!(name, "tenant-a.b");
    }

    #[tokio::test]
    async fn released_entries_are_pruned() {
        let locks = Arc::new(StackLocks::new());
        drop(locks.acquire("tenant-a.b").await);
        drop(locks.acquire("tenant-c.d").await);
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn cancelled_holder_releases() {
        let locks = Arc::new(StackLocks::new());
        let holder = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("tenant-a.b").await;
                std::future::pending::<()>().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(locks.is_locked("tenant-a.b"));

        holder.abort();
        let _ = holder.await;
        assert!(locks.try_acquire("tenant-a.b").is_some());
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_is_pruned() {
        let locks = Arc::new(StackLocks::new());
        let guard = locks.acquire("tenant-a.b").await;
        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                let _guard = locks.acquire("tenant-a.b").await;
            })
        };
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(guard);
        waiter.abort();
        let _ = waiter.await;
        assert_eq!(locks.tracked(), 0);
    }

    #[tokio::test]
    async fn failed_try_acquire_is_not_tracked() {
        let locks = Arc::new(StackLocks::new());
        let guard = locks.acquire("tenant-a.b").await;
        assert!(locks.try_acquire("tenant-a.b").is_none());
        drop(guard);
        assert_eq!(locks.tracked(), 0);
    }
}
