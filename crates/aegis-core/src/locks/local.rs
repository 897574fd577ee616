//! Process-local named locks.

use crate::error::Result;
use crate::locks::traits::{LockGuard, NamedLock};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Keyed mutex registry.
///
/// Sufficient whenever every caller shares this process. Coordination
/// across processes needs the lease-backed variant instead.
pub struct LocalLockManager {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalLockManager {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn slot(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Names with a registered slot, held or not.
    pub fn known_names(&self) -> Vec<String> {
        self.locks.lock().unwrap().keys().cloned().collect()
    }
}

impl Default for LocalLockManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NamedLock for LocalLockManager {
    async fn acquire(&self, name: &str) -> Result<LockGuard> {
        let slot = self.slot(name);
        let guard = slot.lock_owned().await;
        Ok(LockGuard::local(name, guard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locks::traits::with_lock;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_name_is_serialized() {
        let locks = Arc::new(LocalLockManager::new());
        let active = Arc::new(AtomicU32::new(0));
        let max_active = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = Arc::clone(&locks);
            let active = Arc::clone(&active);
            let max_active = Arc::clone(&max_active);
            handles.push(tokio::spawn(async move {
                with_lock(&*locks, "shared", async {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_distinct_names_use_distinct_slots() {
        let locks = LocalLockManager::new();
        let first = locks.acquire("alpha").await.unwrap();
        // A held "alpha" does not block "beta".
        let second = locks.acquire("beta").await.unwrap();
        assert_eq!(first.name(), "alpha");
        assert_eq!(second.name(), "beta");

        let mut names = locks.known_names();
        names.sort();
        assert_eq!(names, vec!["alpha", "beta"]);
    }

    #[tokio::test]
    async fn test_lock_released_after_error() {
        let locks = LocalLockManager::new();
        let result: Result<()> = with_lock(&locks, "fallible", async {
            Err(crate::error::AegisError::Other("boom".to_string()))
        })
        .await;
        assert!(result.is_err());

        // The failed section released the lock.
        let reacquired = with_lock(&locks, "fallible", async { Ok(42) }).await.unwrap();
        assert_eq!(reacquired, 42);
    }

    #[tokio::test]
    async fn test_guard_drop_releases() {
        let locks = LocalLockManager::new();
        {
            let _guard = locks.acquire("scoped").await.unwrap();
        }
        let again = locks.acquire("scoped").await.unwrap();
        again.release().await;
    }
}
