//! Cache Item

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// A value held by one replica
#[derive(Debug, Clone, PartialEq)]
pub struct CacheItem {
    pub key: String,
    pub value: Bytes,
    /// Time to live (None = never expires)
    pub ttl: Option<Duration>,
    /// Write time; doubles as the version for last-write-wins
    pub created_at: DateTime<Utc>,
    pub accessed_at: DateTime<Utc>,
    pub access_count: u64,
    /// Accounted size in bytes (key + value)
    pub size: usize,
}

impl CacheItem {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>, ttl: Option<Duration>) -> Self {
        let key = key.into();
        let value = value.into();
        let now = Utc::now();
        Self {
            size: key.len() + value.len(),
            key,
            value,
            ttl,
            created_at: now,
            accessed_at: now,
            access_count: 0,
        }
    }

    /// Override the write timestamp
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self.accessed_at = created_at;
        self
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.ttl?).ok()?;
        self.created_at.checked_add_signed(ttl)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().map(|t| now > t).unwrap_or(false)
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether this version should replace `other`
    pub fn supersedes(&self, other: &CacheItem) -> bool {
        self.created_at >= other.created_at
    }

    pub(crate) fn touch(&mut self) {
        self.accessed_at = Utc::now();
        self.access_count = self.access_count.saturating_add(1);
    }
}

/// Marker left by a delete so that older copies of the key lose to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tombstone {
    pub key: String,
    pub deleted_at: DateTime<Utc>,
}

/// What one replica holds for a key: a live value or the delete that
/// removed it
#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Live(CacheItem),
    Deleted(Tombstone),
}

impl Record {
    pub fn key(&self) -> &str {
        match self {
            Record::Live(item) => &item.key,
            Record::Deleted(tombstone) => &tombstone.key,
        }
    }

    /// Last-write-wins order. A delete beats a write with the same timestamp.
    pub fn rank(&self) -> (DateTime<Utc>, bool) {
        match self {
            Record::Live(item) => (item.created_at, false),
            Record::Deleted(tombstone) => (tombstone.deleted_at, true),
        }
    }

    pub fn newer_than(&self, other: &Record) -> bool {
        self.rank() > other.rank()
    }

    pub fn is_live(&self) -> bool {
        matches!(self, Record::Live(_))
    }

    pub fn into_item(self) -> Option<CacheItem> {
        match self {
            Record::Live(item) => Some(item),
            Record::Deleted(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_size_counts_key_and_value() {
        let item = CacheItem::new("key", &b"value"[..], None);
        assert_eq!(item.size, 8);
    }

    #[test]
    fn test_expiry() {
        let created = Utc::now() - chrono::Duration::seconds(5);
        let item = CacheItem::new("k", &b"v"[..], Some(Duration::from_secs(2)))
            .with_created_at(created);
        assert!(item.is_expired());

        let fresh = CacheItem::new("k", &b"v"[..], Some(Duration::from_secs(60)));
        assert!(!fresh.is_expired());

        let forever = CacheItem::new("k", &b"v"[..], None).with_created_at(created);
        assert!(!forever.is_expired());
        assert_eq!(forever.expires_at(), None);
    }

    #[test]
    fn test_last_write_wins_ordering() {
        let older = CacheItem::new("k", &b"old"[..], None)
            .with_created_at(Utc::now() - chrono::Duration::seconds(1));
        let newer = CacheItem::new("k", &b"new"[..], None);
        assert!(newer.supersedes(&older));
        assert!(!older.supersedes(&newer));
    }

    #[test]
    fn test_delete_outranks_same_or_older_write() {
        let item = CacheItem::new("k", &b"v"[..], None);
        let written = Record::Live(item.clone());
        let deleted = Record::Deleted(Tombstone {
            key: "k".into(),
            deleted_at: item.created_at,
        });
        assert!(deleted.newer_than(&written));
        assert!(!written.newer_than(&deleted));

        let rewritten = Record::Live(
            item.with_created_at(Utc::now() + chrono::Duration::seconds(1)),
        );
        assert!(rewritten.newer_than(&deleted));
        assert_eq!(deleted.key(), "k");
        assert_eq!(deleted.into_item(), None);
    }
}
