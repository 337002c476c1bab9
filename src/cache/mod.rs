//! Generic in-memory query cache.
//!
//! This module is agnostic of the project/task API. It provides:
//! - Structural query keys with canonical encoding
//! - An entity cache with per-entry staleness, invalidation and in-flight markers
//! - Sequence-tagged writes so late responses cannot clobber newer data
//! - Optional SQLite snapshots so fetched data survives restarts

mod clock;
mod key;
mod snapshot;
mod store;

pub use clock::{Clock, ManualClock, SystemClock};
pub use key::QueryKey;
pub use snapshot::SqliteSnapshot;
pub use store::{CacheEntry, CacheStats, EntityCache, FetchHandle, FetchTicket, DEFAULT_STALE_TIME};
