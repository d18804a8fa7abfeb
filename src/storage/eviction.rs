//! Eviction Module
//!
//! LRU/LFU/TTL/FIFO victim selection under a memory limit.

use std::time::Duration;

use super::CacheItem;

/// Eviction policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionPolicy {
    /// Least Recently Used
    Lru,
    /// Least Frequently Used
    Lfu,
    /// Expired first, then soonest to expire
    Ttl,
    /// Oldest write first
    Fifo,
}

impl Default for EvictionPolicy {
    fn default() -> Self {
        Self::Lru
    }
}

impl std::str::FromStr for EvictionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lru" => Ok(Self::Lru),
            "lfu" => Ok(Self::Lfu),
            "ttl" => Ok(Self::Ttl),
            "fifo" => Ok(Self::Fifo),
            other => Err(format!("unknown eviction policy: {}", other)),
        }
    }
}

/// Eviction configuration
#[derive(Debug, Clone)]
pub struct EvictionConfig {
    /// Maximum memory in bytes (0 = unlimited)
    pub max_memory: usize,
    /// Eviction policy
    pub policy: EvictionPolicy,
    /// How long a delete is remembered
    pub tombstone_ttl: Duration,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            max_memory: 0,
            policy: EvictionPolicy::Lru,
            tombstone_ttl: Duration::from_secs(3600),
        }
    }
}

impl EvictionConfig {
    pub fn with_max_memory(mut self, bytes: usize) -> Self {
        self.max_memory = bytes;
        self
    }

    pub fn with_policy(mut self, policy: EvictionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_tombstone_ttl(mut self, ttl: Duration) -> Self {
        self.tombstone_ttl = ttl;
        self
    }

    /// Bytes that must be released before `incoming` more fit
    pub fn overflow(&self, used: usize, incoming: usize) -> usize {
        if self.max_memory == 0 {
            return 0;
        }
        (used + incoming).saturating_sub(self.max_memory)
    }
}

/// Store-local ordering metadata for one entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EvictionMeta {
    /// Logical tick of insertion
    pub inserted: u64,
    /// Logical tick of the last read or write
    pub touched: u64,
}

impl EvictionMeta {
    pub fn new(tick: u64) -> Self {
        Self {
            inserted: tick,
            touched: tick,
        }
    }

    pub fn touch(&mut self, tick: u64) {
        self.touched = tick;
    }
}

/// Position in eviction order; the smallest rank is evicted first.
///
/// The second component is a unique logical tick, so ranks never collide
/// within one store.
pub type Rank = (i128, u64);

impl EvictionPolicy {
    pub fn rank(&self, item: &CacheItem, meta: &EvictionMeta) -> Rank {
        match self {
            EvictionPolicy::Lru => (meta.touched as i128, meta.inserted),
            EvictionPolicy::Lfu => (item.access_count as i128, meta.touched),
            EvictionPolicy::Fifo => (item.created_at.timestamp_micros() as i128, meta.inserted),
            EvictionPolicy::Ttl => (
                item.expires_at()
                    .map(|t| t.timestamp_micros() as i128)
                    .unwrap_or(i128::MAX),
                meta.inserted,
            ),
        }
    }
}
