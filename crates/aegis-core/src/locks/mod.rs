//! Named mutual exclusion.
//!
//! Guards singleton operations such as credential refresh. The
//! [`LocalLockManager`] covers callers inside one process; [`LeaseLock`]
//! extends the guarantee across contexts sharing only a storage area.

mod lease;
mod local;
mod traits;

pub use lease::{LeaseConfig, LeaseLock};
pub use local::LocalLockManager;
pub use traits::{with_lock, LockGuard, NamedLock};
