//! Per-key serialization and cooperative cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use lmsh_state::EntityKey;
use tokio::sync::{Mutex as AsyncMutex, Notify, OwnedMutexGuard};

use crate::domain::{LmshError, Result};

/// Async lock per logical key.
///
/// Runs sharing one engine instance take the lock for their key, so two
/// reconciles of the same classroom never interleave while distinct keys
/// proceed in parallel. Cross-process safety comes from compare-and-swap in
/// the state store, not from this map.
///
/// An entry lives only while someone holds or waits for its lock.
#[derive(Debug, Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
        self.locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub async fn lock(&self, key: &EntityKey) -> KeyGuard<'_> {
        let id = key.storage_id();
        let lock = Arc::clone(self.map().entry(id.clone()).or_default());
        KeyGuard {
            locks: self,
            id,
            guard: Some(lock.lock_owned().await),
        }
    }

    /// Keys currently held or waited on.
    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Holds one key's lock; releasing the last interest drops the map entry.
#[derive(Debug)]
pub struct KeyGuard<'a> {
    locks: &'a KeyLocks,
    id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // release first so our own reference is gone before counting
        drop(self.guard.take());
        let mut map = self.locks.map();
        if map
            .get(&self.id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            map.remove(&self.id);
        }
    }
}

#[derive(Debug, Default)]
struct CancelState {
    cancelled: AtomicBool,
    notify: Notify,
}

/// Cooperative cancellation flag, checked between logical steps and
/// awaitable with [`CancelToken::cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    state: Arc<CancelState>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.state.cancelled.store(true, Ordering::SeqCst);
        self.state.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(LmshError::Cancelled)` once cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(LmshError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the token is cancelled (immediately if it already is).
    pub async fn cancelled(&self) {
        loop {
            let notified = self.state.notify.notified();
            tokio::pin!(notified);
            // register before checking the flag so a concurrent cancel is not missed
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_is_serialized() {
        let locks = Arc::new(KeyLocks::new());
        let key = EntityKey::classroom("org", "CS101");
        let guard = locks.lock(&key).await;

        let contender = {
            let locks = Arc::clone(&locks);
            let key = key.clone();
            tokio::spawn(async move {
                let _guard = locks.lock(&key).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        contender.await.unwrap();
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_released_keys_are_pruned() {
        let locks = KeyLocks::new();
        for student in ["alice", "bob", "carol"] {
            let key = EntityKey::assignment("org", "CS101", "midterm")
                .submission(student)
                .unwrap();
            let _guard = locks.lock(&key).await;
            assert_eq!(locks.len(), 1);
        }
        assert!(locks.is_empty());

        let a = locks.lock(&EntityKey::classroom("org", "CS101")).await;
        let b = locks.lock(&EntityKey::classroom("org", "CS202")).await;
        assert_eq!(locks.len(), 2);
        drop(a);
        assert_eq!(locks.len(), 1);
        drop(b);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyLocks::new();
        let _a = locks.lock(&EntityKey::classroom("org", "CS101")).await;
        let _b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.lock(&EntityKey::classroom("org", "CS202")),
        )
        .await
        .expect("distinct key must not wait");
    }

    #[test]
    fn test_cancel_token_is_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(token.is_cancelled());
        assert!(matches!(token.check(), Err(LmshError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wakes_waiters() {
        let token = CancelToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!waiter.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_millis(10), waiter)
            .await
            .expect("waiter must wake on cancel")
            .unwrap();

        // already cancelled resolves at once
        tokio::time::timeout(Duration::from_millis(10), token.cancelled())
            .await
            .expect("cancelled token resolves immediately");
    }
}
