//! In-Memory Item Store
//!
//! One node's item table with memory accounting. Every mutation, including
//! eviction, runs under a single lock so size accounting never drifts.
//! Eviction order and expiry times are indexed as items change, so making
//! room pops victims instead of scanning the table.

use chrono::{DateTime, Utc};
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

use super::eviction::{EvictionConfig, EvictionMeta, EvictionPolicy, Rank};
use super::{CacheItem, Record, Tombstone};
use crate::error::{CacheError, Result};
use crate::metrics::CacheMetrics;

#[derive(Debug)]
struct Entry {
    item: CacheItem,
    meta: EvictionMeta,
    rank: Rank,
}

impl Entry {
    fn expiry_slot(&self) -> Option<(i64, u64)> {
        let at = self.item.expires_at()?;
        Some((at.timestamp_micros(), self.meta.inserted))
    }
}

#[derive(Debug, Default)]
struct Inner {
    items: HashMap<String, Entry>,
    /// Live keys in eviction order
    order: BTreeMap<Rank, String>,
    /// Keys with a TTL, soonest expiry first
    expiry: BTreeMap<(i64, u64), String>,
    /// Deleted keys and when they were deleted
    tombstones: HashMap<String, DateTime<Utc>>,
    memory: usize,
    tick: u64,
}

impl Inner {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    fn insert(&mut self, item: CacheItem, policy: EvictionPolicy) {
        let tick = self.next_tick();
        let meta = EvictionMeta::new(tick);
        let entry = Entry {
            rank: policy.rank(&item, &meta),
            item,
            meta,
        };
        let key = entry.item.key.clone();
        self.order.insert(entry.rank, key.clone());
        if let Some(slot) = entry.expiry_slot() {
            self.expiry.insert(slot, key.clone());
        }
        self.memory += entry.item.size;
        self.items.insert(key, entry);
    }

    fn remove(&mut self, key: &str) -> Option<CacheItem> {
        let entry = self.items.remove(key)?;
        self.order.remove(&entry.rank);
        if let Some(slot) = entry.expiry_slot() {
            self.expiry.remove(&slot);
        }
        self.memory -= entry.item.size;
        Some(entry.item)
    }

    /// Record an access and move the key to its new place in eviction order
    fn touch(&mut self, key: &str, policy: EvictionPolicy) -> Option<CacheItem> {
        let tick = self.next_tick();
        let entry = self.items.get_mut(key)?;
        entry.item.touch();
        entry.meta.touch(tick);

        let rank = policy.rank(&entry.item, &entry.meta);
        if rank != entry.rank {
            self.order.remove(&entry.rank);
            self.order.insert(rank, key.to_string());
            entry.rank = rank;
        }
        Some(entry.item.clone())
    }

    /// Expired keys, found by walking the expiry index from its front
    fn expired(&self, now: DateTime<Utc>) -> Vec<String> {
        self.expiry
            .values()
            .map_while(|key| {
                let entry = self.items.get(key)?;
                entry.item.is_expired_at(now).then(|| key.clone())
            })
            .collect()
    }
}

/// Point-in-time store statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreStats {
    pub items: usize,
    pub tombstones: usize,
    pub memory: usize,
    pub max_memory: usize,
}

/// Thread-safe in-memory item store for a single node
#[derive(Debug)]
pub struct Store {
    inner: Mutex<Inner>,
    config: EvictionConfig,
    metrics: Arc<CacheMetrics>,
}

impl Store {
    pub fn new(config: EvictionConfig, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            config,
            metrics,
        }
    }

    pub fn policy(&self) -> EvictionPolicy {
        self.config.policy
    }

    /// Insert or replace an item.
    ///
    /// Returns `Ok(false)` when a newer live version or a delete at least as
    /// recent is already stored; the write is then dropped (last-write-wins).
    pub fn put(&self, item: CacheItem) -> Result<bool> {
        let max_memory = self.config.max_memory;
        if max_memory > 0 && item.size > max_memory {
            return Err(CacheError::CapacityExceeded {
                size: item.size,
                max_memory,
            });
        }

        let mut inner = self.inner.lock();

        if let Some(deleted_at) = inner.tombstones.get(&item.key) {
            if *deleted_at >= item.created_at {
                return Ok(false);
            }
        }
        if let Some(existing) = inner.items.get(&item.key) {
            if !existing.item.is_expired() && !item.supersedes(&existing.item) {
                return Ok(false);
            }
        }
        inner.tombstones.remove(&item.key);
        if let Some(old) = inner.remove(&item.key) {
            self.metrics.sub_memory(old.size);
        }

        let overflow = self.config.overflow(inner.memory, item.size);
        if overflow > 0 {
            self.evict_locked(&mut inner, overflow);
        }

        self.metrics.add_memory(item.size);
        inner.insert(item, self.config.policy);
        Ok(true)
    }

    /// Get an item and record the access; expired items read as absent
    pub fn get(&self, key: &str) -> Option<CacheItem> {
        self.read(key).and_then(Record::into_item)
    }

    /// Like `get`, but a deleted key answers with its tombstone
    pub fn read(&self, key: &str) -> Option<Record> {
        let mut inner = self.inner.lock();
        if let Some(expired) = inner.items.get(key).map(|e| e.item.is_expired()) {
            if !expired {
                return inner.touch(key, self.config.policy).map(Record::Live);
            }
            self.expire_locked(&mut inner, key);
        }
        inner.tombstones.get(key).map(|deleted_at| {
            Record::Deleted(Tombstone {
                key: key.to_string(),
                deleted_at: *deleted_at,
            })
        })
    }

    /// Get an item without counting an access
    pub fn peek(&self, key: &str) -> Option<CacheItem> {
        let inner = self.inner.lock();
        inner
            .items
            .get(key)
            .filter(|e| !e.item.is_expired())
            .map(|e| e.item.clone())
    }

    /// Delete a key as of `deleted_at`, leaving a tombstone that outranks
    /// older copies. A copy written after `deleted_at` is kept.
    ///
    /// Returns true if a live item was removed.
    pub fn delete(&self, key: &str, deleted_at: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.items.get(key) {
            if existing.item.created_at > deleted_at {
                return false;
            }
        }

        let stamp = inner
            .tombstones
            .entry(key.to_string())
            .or_insert(deleted_at);
        if *stamp < deleted_at {
            *stamp = deleted_at;
        }

        match inner.remove(key) {
            Some(old) => {
                self.metrics.sub_memory(old.size);
                !old.is_expired()
            }
            None => false,
        }
    }

    /// Drop a key and its tombstone without recording a delete, for copies
    /// handed off to other nodes. Returns true if an item was held.
    pub fn discard(&self, key: &str) -> bool {
        let mut inner = self.inner.lock();
        inner.tombstones.remove(key);
        match inner.remove(key) {
            Some(old) => {
                self.metrics.sub_memory(old.size);
                true
            }
            None => false,
        }
    }

    /// Remove expired items, returns count of removed items
    pub fn sweep_expired(&self) -> usize {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let expired = inner.expired(now);
        for key in &expired {
            self.expire_locked(&mut inner, key);
        }
        expired.len()
    }

    /// Forget deletes older than the tombstone TTL, returns count forgotten
    pub fn purge_tombstones(&self) -> usize {
        let cutoff = chrono::Duration::from_std(self.config.tombstone_ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_sub_signed(ttl));
        let Some(cutoff) = cutoff else {
            return 0;
        };

        let mut inner = self.inner.lock();
        let before = inner.tombstones.len();
        inner.tombstones.retain(|_, deleted_at| *deleted_at > cutoff);
        before - inner.tombstones.len()
    }

    /// Drop every item and tombstone without counting evictions, returns
    /// bytes released
    pub fn clear(&self) -> usize {
        let mut inner = self.inner.lock();
        let released = inner.memory;
        inner.items.clear();
        inner.order.clear();
        inner.expiry.clear();
        inner.tombstones.clear();
        inner.memory = 0;
        self.metrics.sub_memory(released);
        released
    }

    /// Live items
    pub fn items(&self) -> Vec<CacheItem> {
        let now = Utc::now();
        let inner = self.inner.lock();
        inner
            .items
            .values()
            .filter(|e| !e.item.is_expired_at(now))
            .map(|e| e.item.clone())
            .collect()
    }

    /// Live items and tombstones, for migration
    pub fn records(&self) -> Vec<Record> {
        let now = Utc::now();
        let inner = self.inner.lock();
        let live = inner
            .items
            .values()
            .filter(|e| !e.item.is_expired_at(now))
            .map(|e| Record::Live(e.item.clone()));
        let deleted = inner.tombstones.iter().map(|(key, deleted_at)| {
            Record::Deleted(Tombstone {
                key: key.clone(),
                deleted_at: *deleted_at,
            })
        });
        live.chain(deleted).collect()
    }

    pub fn current_memory(&self) -> usize {
        self.inner.lock().memory
    }

    /// Number of items, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StoreStats {
        let inner = self.inner.lock();
        StoreStats {
            items: inner.items.len(),
            tombstones: inner.tombstones.len(),
            memory: inner.memory,
            max_memory: self.config.max_memory,
        }
    }

    fn expire_locked(&self, inner: &mut Inner, key: &str) {
        if let Some(old) = inner.remove(key) {
            self.metrics.sub_memory(old.size);
            self.metrics.record_eviction();
        }
    }

    /// Free at least `needed` bytes: expired items first, then policy order.
    fn evict_locked(&self, inner: &mut Inner, needed: usize) {
        let mut freed = 0;

        for key in inner.expired(Utc::now()) {
            if let Some(size) = inner.items.get(&key).map(|e| e.item.size) {
                self.expire_locked(inner, &key);
                freed += size;
            }
        }

        while freed < needed {
            let Some((_, key)) = inner.order.pop_first() else {
                break;
            };
            if let Some(old) = inner.remove(&key) {
                freed += old.size;
                self.metrics.sub_memory(old.size);
                self.metrics.record_eviction();
                debug!(key = %key, size = old.size, policy = ?self.config.policy, "Evicted item");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn store(max_memory: usize, policy: EvictionPolicy) -> Store {
        Store::new(
            EvictionConfig::default()
                .with_max_memory(max_memory)
                .with_policy(policy),
            Arc::new(CacheMetrics::new()),
        )
    }

    /// Item of exactly `size` bytes under a one-character key
    fn sized(key: &str, size: usize) -> CacheItem {
        CacheItem::new(key, vec![b'x'; size - key.len()], None)
    }

    #[test]
    fn test_basic_operations() {
        let store = store(0, EvictionPolicy::Lru);

        assert!(store.put(CacheItem::new("key", &b"value"[..], None)).unwrap());
        assert_eq!(store.get("key").unwrap().value.as_ref(), b"value");
        assert_eq!(store.current_memory(), 8);

        assert!(store.delete("key", Utc::now()));
        assert!(!store.delete("key", Utc::now()));
        assert_eq!(store.get("key"), None);
        assert_eq!(store.current_memory(), 0);
    }

    #[test]
    fn test_replace_releases_old_size() {
        let store = store(0, EvictionPolicy::Lru);
        store.put(sized("a", 40)).unwrap();
        store.put(sized("a", 10)).unwrap();
        assert_eq!(store.current_memory(), 10);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_counts_accesses() {
        let store = store(0, EvictionPolicy::Lfu);
        store.put(sized("a", 10)).unwrap();
        store.get("a");
        store.get("a");
        assert_eq!(store.peek("a").unwrap().access_count, 2);
    }

    #[test]
    fn test_lru_scenario() {
        let store = store(120, EvictionPolicy::Lru);
        store.put(sized("a", 40)).unwrap();
        store.put(sized("b", 40)).unwrap();
        store.put(sized("c", 40)).unwrap();
        store.get("a");

        store.put(sized("d", 40)).unwrap();

        assert!(store.peek("b").is_none());
        assert!(store.peek("a").is_some());
        assert!(store.peek("c").is_some());
        assert!(store.peek("d").is_some());
        assert_eq!(store.current_memory(), 120);
        assert_eq!(store.metrics.evictions(), 1);
    }

    #[test]
    fn test_lfu_evicts_least_used() {
        let store = store(120, EvictionPolicy::Lfu);
        store.put(sized("a", 40)).unwrap();
        store.put(sized("b", 40)).unwrap();
        store.put(sized("c", 40)).unwrap();
        store.get("a");
        store.get("a");
        store.get("c");

        store.put(sized("d", 40)).unwrap();
        assert!(store.peek("b").is_none());
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_fifo_ignores_access() {
        let store = store(120, EvictionPolicy::Fifo);
        store.put(sized("a", 40)).unwrap();
        thread::sleep(Duration::from_millis(2));
        store.put(sized("b", 40)).unwrap();
        thread::sleep(Duration::from_millis(2));
        store.put(sized("c", 40)).unwrap();
        store.get("a");

        store.put(sized("d", 40)).unwrap();
        assert!(store.peek("a").is_none());
        assert!(store.peek("b").is_some());
    }

    #[test]
    fn test_batch_eviction_for_large_item() {
        let store = store(100, EvictionPolicy::Lru);
        for key in ["a", "b", "c", "d", "e"] {
            store.put(sized(key, 20)).unwrap();
        }
        store.put(sized("z", 70)).unwrap();

        // needs 70 bytes free: a, b, c, d go
        assert_eq!(store.len(), 2);
        assert!(store.peek("e").is_some());
        assert_eq!(store.current_memory(), 90);
        assert_eq!(store.metrics.evictions(), 4);
    }

    #[test]
    fn test_capacity_exceeded() {
        let store = store(100, EvictionPolicy::Lru);
        store.put(sized("a", 50)).unwrap();
        let err = store.put(sized("b", 101)).unwrap_err();
        assert_eq!(
            err,
            CacheError::CapacityExceeded {
                size: 101,
                max_memory: 100
            }
        );
        // nothing was evicted for the rejected item
        assert!(store.peek("a").is_some());
    }

    #[test]
    fn test_stale_write_is_ignored() {
        let store = store(0, EvictionPolicy::Lru);
        let newer = CacheItem::new("k", &b"new"[..], None);
        let older = CacheItem::new("k", &b"old"[..], None)
            .with_created_at(newer.created_at - chrono::Duration::seconds(1));

        assert!(store.put(newer).unwrap());
        assert!(!store.put(older).unwrap());
        assert_eq!(store.peek("k").unwrap().value.as_ref(), b"new");
    }

    #[test]
    fn test_ttl_expiration_every_policy() {
        for policy in [
            EvictionPolicy::Lru,
            EvictionPolicy::Lfu,
            EvictionPolicy::Ttl,
            EvictionPolicy::Fifo,
        ] {
            let store = store(1024, policy);
            store
                .put(CacheItem::new("expiring", &b"temporary"[..], Some(Duration::from_secs(1))))
                .unwrap();
            assert!(store.get("expiring").is_some());

            thread::sleep(Duration::from_millis(1100));
            assert_eq!(store.get("expiring"), None, "policy {:?}", policy);
            assert_eq!(store.current_memory(), 0);
        }
    }

    #[test]
    fn test_sweep_expired() {
        let store = store(0, EvictionPolicy::Ttl);
        let past = Utc::now() - chrono::Duration::seconds(10);
        for i in 0..10 {
            store
                .put(
                    CacheItem::new(format!("key{}", i), &b"value"[..], Some(Duration::from_secs(1)))
                        .with_created_at(past),
                )
                .unwrap();
        }
        store.put(CacheItem::new("keep", &b"value"[..], None)).unwrap();

        assert_eq!(store.sweep_expired(), 10);
        assert_eq!(store.len(), 1);
        assert_eq!(store.metrics.evictions(), 10);
    }

    #[test]
    fn test_expired_items_evicted_before_live_ones() {
        let store = store(100, EvictionPolicy::Lru);
        let past = Utc::now() - chrono::Duration::seconds(10);
        store.put(sized("a", 40)).unwrap();
        store
            .put(sized("b", 40).with_created_at(past))
            .unwrap();
        // c carries a TTL that has already run out
        let mut stale = sized("c", 20).with_created_at(past);
        stale.ttl = Some(Duration::from_secs(1));
        store.put(stale).unwrap();

        store.put(sized("d", 20)).unwrap();
        assert!(store.peek("a").is_some());
        assert!(store.peek("b").is_some());
        assert!(store.peek("c").is_none());
        assert!(store.peek("d").is_some());
        assert_eq!(store.metrics.evictions(), 1);
    }

    #[test]
    fn test_delete_leaves_tombstone() {
        let store = store(0, EvictionPolicy::Lru);
        let item = CacheItem::new("k", &b"v"[..], None);
        let written = item.created_at;
        store.put(item.clone()).unwrap();

        let deleted_at = written + chrono::Duration::milliseconds(5);
        assert!(store.delete("k", deleted_at));
        assert_eq!(store.get("k"), None);
        assert_eq!(
            store.read("k"),
            Some(Record::Deleted(Tombstone {
                key: "k".into(),
                deleted_at
            }))
        );
        assert_eq!(store.stats().tombstones, 1);

        // the copy that existed before the delete cannot come back
        assert!(!store.put(item).unwrap());
        assert!(store.peek("k").is_none());

        // a later write replaces the tombstone
        let rewritten = CacheItem::new("k", &b"w"[..], None)
            .with_created_at(deleted_at + chrono::Duration::milliseconds(1));
        assert!(store.put(rewritten).unwrap());
        assert_eq!(store.get("k").unwrap().value.as_ref(), b"w");
        assert_eq!(store.stats().tombstones, 0);
    }

    #[test]
    fn test_older_delete_keeps_newer_write() {
        let store = store(0, EvictionPolicy::Lru);
        let item = CacheItem::new("k", &b"v"[..], None);
        let before = item.created_at - chrono::Duration::seconds(1);
        store.put(item).unwrap();

        assert!(!store.delete("k", before));
        assert!(store.peek("k").is_some());
        assert_eq!(store.stats().tombstones, 0);
    }

    #[test]
    fn test_records_include_tombstones() {
        let store = store(0, EvictionPolicy::Lru);
        store.put(CacheItem::new("live", &b"v"[..], None)).unwrap();
        store.delete("gone", Utc::now());

        let records = store.records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().any(|r| r.key() == "live" && r.is_live()));
        assert!(records.iter().any(|r| r.key() == "gone" && !r.is_live()));
        assert_eq!(store.items().len(), 1);
    }

    #[test]
    fn test_discard_forgets_the_key() {
        let store = store(0, EvictionPolicy::Lru);
        let item = CacheItem::new("k", &b"v"[..], None);
        store.put(item.clone()).unwrap();
        assert!(store.discard("k"));
        assert_eq!(store.read("k"), None);
        assert_eq!(store.current_memory(), 0);

        store.delete("k", Utc::now());
        store.discard("k");
        // nothing remembers the delete, so the handed-off copy may return
        assert!(store.put(item).unwrap());
    }

    #[test]
    fn test_purge_tombstones() {
        let store = Store::new(
            EvictionConfig::default().with_tombstone_ttl(Duration::from_secs(60)),
            Arc::new(CacheMetrics::new()),
        );
        store.delete("old", Utc::now() - chrono::Duration::seconds(120));
        store.delete("recent", Utc::now());

        assert_eq!(store.purge_tombstones(), 1);
        assert_eq!(store.read("old"), None);
        assert!(store.read("recent").is_some());
    }

    #[test]
    fn test_eviction_index_follows_churn() {
        let store = store(1_000, EvictionPolicy::Lru);
        for i in 0..500 {
            store.put(sized(&format!("k{}", i % 80), 20)).unwrap();
            store.get(&format!("k{}", (i * 7) % 80));
            if i % 11 == 0 {
                store.delete(&format!("k{}", (i * 3) % 80), Utc::now());
            }
        }

        let inner = store.inner.lock();
        assert_eq!(inner.order.len(), inner.items.len());
        assert!(inner.memory <= 1_000);
        for entry in inner.items.values() {
            assert_eq!(inner.order.get(&entry.rank), Some(&entry.item.key));
        }
    }

    #[test]
    fn test_lru_evicts_only_what_is_needed() {
        let store = store(10_000, EvictionPolicy::Lru);
        for i in 0..1_000 {
            store.put(sized(&format!("k{:04}", i), 10)).unwrap();
        }
        // k0000 is now the most recent
        store.get("k0000");

        store.put(sized("new", 30)).unwrap();
        assert_eq!(store.metrics.evictions(), 3);
        assert!(store.peek("k0000").is_some());
        for evicted in ["k0001", "k0002", "k0003"] {
            assert!(store.peek(evicted).is_none());
        }
        assert!(store.peek("k0004").is_some());
    }

    #[test]
    fn test_concurrent_puts_keep_accounting() {
        let store = Arc::new(store(2_000, EvictionPolicy::Lru));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let s = store.clone();
                thread::spawn(move || {
                    for j in 0..200 {
                        s.put(CacheItem::new(format!("k{}-{}", t, j), vec![0u8; 16], None))
                            .unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let expected: usize = store.items().iter().map(|i| i.size).sum();
        assert_eq!(store.current_memory(), expected);
        assert!(store.current_memory() <= 2_000);
        assert_eq!(store.metrics.memory_usage() as usize, expected);
    }
}
