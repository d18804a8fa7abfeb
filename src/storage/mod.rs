//! Storage Engine
//!
//! Per-node in-memory item store with eviction and TTL support.

mod eviction;
mod item;
mod store;
mod ttl;

pub use eviction::{EvictionConfig, EvictionMeta, EvictionPolicy, Rank};
pub use item::{CacheItem, Record, Tombstone};
pub use store::{Store, StoreStats};
pub use ttl::TtlSweeper;
