//! Persistent key-value storage.
//!
//! - [`StorageArea`]: async KV contract shared by every backend
//! - [`MemoryArea`]: in-memory backend, used heavily in tests
//! - [`SqliteStore`] / [`SqliteArea`]: durable backend, one file for all areas
//! - [`QuotaManager`]: budget-enforcing writer layered on top

mod area;
mod quota;
mod sqlite;

pub use area::{entry_size, AreaKind, MemoryArea, StorageArea};
pub use quota::{LargestItem, QuotaConfig, QuotaManager, StoreOptions, UsageStats};
pub use sqlite::{SqliteArea, SqliteStore};
