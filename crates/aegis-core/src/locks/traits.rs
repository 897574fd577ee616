//! Named mutual-exclusion contract.

use crate::error::Result;
use crate::storage::StorageArea;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, warn};

/// Named mutual-exclusion service.
///
/// At most one holder exists per name at any instant. The scope of the
/// guarantee depends on the implementation: process-wide for the keyed
/// mutex, store-wide for the lease variant.
#[async_trait]
pub trait NamedLock: Send + Sync {
    /// Block until the named lock is held, then return its guard.
    async fn acquire(&self, name: &str) -> Result<LockGuard>;
}

/// Scoped handle to a held lock.
///
/// Prefer [`LockGuard::release`] (or [`with_lock`], which calls it) so
/// lease-backed locks free their store record promptly. A guard that is
/// simply dropped still releases: local locks immediately, lease locks
/// via a background task or, failing that, lease expiry.
pub struct LockGuard {
    name: String,
    inner: GuardInner,
}

enum GuardInner {
    Local {
        _guard: OwnedMutexGuard<()>,
    },
    Lease {
        _local: OwnedMutexGuard<()>,
        cleanup: Option<LeaseCleanup>,
    },
}

pub(crate) struct LeaseCleanup {
    pub(crate) area: Arc<dyn StorageArea>,
    pub(crate) record_key: String,
    pub(crate) holder: String,
}

impl LeaseCleanup {
    /// Delete the lease record if this holder still owns it.
    async fn run(self) {
        let key = self.record_key.clone();
        let current = match self.area.get(&[key.clone()]).await {
            Ok(mut entries) => entries.remove(&key),
            Err(e) => {
                warn!(key = %key, error = %e, "Failed to read lease during release");
                return;
            }
        };

        let still_ours = current
            .as_ref()
            .and_then(|record| record.get("holder"))
            .and_then(|holder| holder.as_str())
            == Some(self.holder.as_str());
        if !still_ours {
            debug!(key = %key, "Lease no longer held by us, skipping delete");
            return;
        }

        if let Err(e) = self.area.remove(&[key.clone()]).await {
            warn!(key = %key, error = %e, "Failed to delete lease record");
        }
    }
}

impl LockGuard {
    pub(crate) fn local(name: &str, guard: OwnedMutexGuard<()>) -> Self {
        Self {
            name: name.to_string(),
            inner: GuardInner::Local { _guard: guard },
        }
    }

    pub(crate) fn lease(
        name: &str,
        local: OwnedMutexGuard<()>,
        cleanup: LeaseCleanup,
    ) -> Self {
        Self {
            name: name.to_string(),
            inner: GuardInner::Lease {
                _local: local,
                cleanup: Some(cleanup),
            },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Release the lock, deleting any backing lease record.
    pub async fn release(mut self) {
        if let GuardInner::Lease { cleanup, .. } = &mut self.inner {
            if let Some(cleanup) = cleanup.take() {
                cleanup.run().await;
            }
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let GuardInner::Lease { cleanup, .. } = &mut self.inner {
            if let Some(cleanup) = cleanup.take() {
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        handle.spawn(cleanup.run());
                    }
                    Err(_) => {
                        debug!(name = %self.name, "No runtime at guard drop, lease will expire on its own");
                    }
                }
            }
        }
    }
}

/// Run `operation` while holding the named lock.
///
/// The lock is released after the operation settles, whether it
/// returned a value or an error.
pub async fn with_lock<T, F>(locks: &dyn NamedLock, name: &str, operation: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    let guard = locks.acquire(name).await?;
    let result = operation.await;
    guard.release().await;
    result
}
