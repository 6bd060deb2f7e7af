//! # Deduplication Cache
//!
//! Bounded-lifetime table of message fingerprints the node has already
//! witnessed. Every inbound message is checked here exactly once; the first
//! sighting records the fingerprint and lets the message through, every
//! later sighting inside the retention window is reported as a duplicate.
//!
//! ## Check-and-Mark Atomicity
//!
//! [`DedupCache::is_duplicate`] performs the membership check and the
//! recording as one step under the write lock. Two concurrent arrivals of
//! the same fingerprint therefore resolve deterministically: exactly one
//! caller observes "new", the other observes "duplicate". Splitting the
//! check from the mark would reintroduce the race this cache exists to
//! close.
//!
//! ## Eviction
//!
//! Entries expire `MESSAGE_RETENTION` after their first sighting. Expiry is
//! realized by a periodic sweep ([`DedupCache::evict_expired`], driven every
//! `SWEEP_INTERVAL` by the engine) rather than per-entry timers, so the
//! steady-state cost is one pass over the table per interval. Between
//! expiry and the next sweep an entry still counts as seen; nothing else
//! removes entries short of [`DedupCache::clear`].
//!
//! Growth is bounded by message rate times retention and is intentionally
//! not capped by entry count: forgetting a live fingerprint would re-open
//! the mesh to duplicate cascades, which costs far more than the table.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

use crate::message::Fingerprint;

/// How long a fingerprint stays in the cache after its first sighting.
/// Messages rarely circulate longer than this in a mesh of bounded depth;
/// older duplicates are indistinguishable from a legitimate re-send.
pub const MESSAGE_RETENTION: Duration = Duration::from_secs(300);

/// Interval between eviction sweeps.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Point-in-time view of the cache counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStatistics {
    /// Distinct fingerprints recorded since startup.
    pub total_seen: u64,
    /// Sightings reported as duplicates.
    pub duplicates_blocked: u64,
    /// Entries currently held.
    pub currently_cached: usize,
    /// Entries removed by eviction sweeps.
    pub evicted: u64,
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<Fingerprint, Instant>,
    total_seen: u64,
    duplicates_blocked: u64,
    evicted: u64,
}

/// Shared-read, exclusive-write fingerprint table.
///
/// Reads (`contains`, `statistics`) take the read lock and run in parallel;
/// mutations serialize through the write lock. All operations are total:
/// nothing here returns an error or blocks beyond lock acquisition.
pub struct DedupCache {
    inner: RwLock<CacheInner>,
    retention: Duration,
}

impl DedupCache {
    pub fn new() -> Self {
        Self::with_retention(MESSAGE_RETENTION)
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            retention,
        }
    }

    /// Check whether the fingerprint was already seen, recording it if not.
    ///
    /// Check and record happen in one step under the write lock; of any
    /// number of concurrent callers with the same fingerprint, exactly one
    /// gets `false`.
    pub async fn is_duplicate(&self, fingerprint: &Fingerprint) -> bool {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        match inner.entries.entry(*fingerprint) {
            Entry::Occupied(_) => {
                inner.duplicates_blocked += 1;
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Instant::now());
                inner.total_seen += 1;
                false
            }
        }
    }

    /// Record a fingerprint without asking whether it was known.
    ///
    /// Used on the send path to pre-seed the sender's own messages, so a
    /// copy bounced back by a neighbor is flagged as a duplicate. The first
    /// sighting timestamp of an existing entry is preserved.
    pub async fn mark_seen(&self, fingerprint: &Fingerprint) {
        let mut guard = self.inner.write().await;
        let inner = &mut *guard;
        if let Entry::Vacant(vacant) = inner.entries.entry(*fingerprint) {
            vacant.insert(Instant::now());
            inner.total_seen += 1;
        }
    }

    /// Read-only membership probe. Never records the fingerprint.
    pub async fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.inner.read().await.entries.contains_key(fingerprint)
    }

    /// Remove entries whose first sighting is older than the retention
    /// window. Returns how many were dropped.
    pub async fn evict_expired(&self) -> usize {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let retention = self.retention;
        let before = inner.entries.len();
        inner
            .entries
            .retain(|_, first_seen| now.duration_since(*first_seen) <= retention);
        let removed = before - inner.entries.len();
        if removed > 0 {
            inner.evicted += removed as u64;
            debug!(
                removed,
                remaining = inner.entries.len(),
                "evicted expired dedup entries"
            );
        }
        removed
    }

    /// Drop every entry. Counters other than the current size are kept.
    pub async fn clear(&self) -> usize {
        let mut inner = self.inner.write().await;
        let removed = inner.entries.len();
        inner.entries.clear();
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }

    pub async fn statistics(&self) -> CacheStatistics {
        let inner = self.inner.read().await;
        CacheStatistics {
            total_seen: inner.total_seen,
            duplicates_blocked: inner.duplicates_blocked,
            currently_cached: inner.entries.len(),
            evicted: inner.evicted,
        }
    }
}

impl Default for DedupCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fp(seed: u8) -> Fingerprint {
        [seed; 32]
    }

    #[tokio::test]
    async fn first_sighting_is_not_a_duplicate() {
        let cache = DedupCache::new();

        assert!(!cache.is_duplicate(&fp(1)).await);
        assert!(cache.is_duplicate(&fp(1)).await);
        assert!(cache.is_duplicate(&fp(1)).await);

        let stats = cache.statistics().await;
        assert_eq!(stats.total_seen, 1);
        assert_eq!(stats.duplicates_blocked, 2);
        assert_eq!(stats.currently_cached, 1);
    }

    #[tokio::test]
    async fn mark_seen_preseeds_the_duplicate_check() {
        let cache = DedupCache::new();

        cache.mark_seen(&fp(7)).await;
        assert!(
            cache.is_duplicate(&fp(7)).await,
            "a pre-seeded fingerprint must be flagged on first check"
        );
    }

    #[tokio::test]
    async fn contains_never_records() {
        let cache = DedupCache::new();

        assert!(!cache.contains(&fp(2)).await);
        assert!(!cache.is_duplicate(&fp(2)).await);
        assert!(cache.contains(&fp(2)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn retention_expiry_requires_a_sweep() {
        let cache = DedupCache::new();

        assert!(!cache.is_duplicate(&fp(3)).await);
        tokio::time::advance(MESSAGE_RETENTION + Duration::from_secs(1)).await;

        // Past retention but not yet swept: still counts as seen.
        assert!(cache.contains(&fp(3)).await);

        assert_eq!(cache.evict_expired().await, 1);
        assert!(!cache.contains(&fp(3)).await);
        assert!(
            !cache.is_duplicate(&fp(3)).await,
            "an evicted fingerprint is a fresh sighting again"
        );

        let stats = cache.statistics().await;
        assert_eq!(stats.evicted, 1);
        assert_eq!(stats.total_seen, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_spares_entries_inside_the_window() {
        let cache = DedupCache::new();

        cache.mark_seen(&fp(1)).await;
        tokio::time::advance(Duration::from_secs(200)).await;
        cache.mark_seen(&fp(2)).await;
        tokio::time::advance(Duration::from_secs(101)).await;

        // fp(1) is 301s old, fp(2) only 101s.
        assert_eq!(cache.evict_expired().await, 1);
        assert!(!cache.contains(&fp(1)).await);
        assert!(cache.contains(&fp(2)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn mark_seen_keeps_the_first_sighting_time() {
        let cache = DedupCache::new();

        cache.mark_seen(&fp(5)).await;
        tokio::time::advance(Duration::from_secs(200)).await;
        // Re-marking must not extend the entry's life.
        cache.mark_seen(&fp(5)).await;
        tokio::time::advance(Duration::from_secs(150)).await;

        assert_eq!(cache.evict_expired().await, 1);
        assert!(!cache.contains(&fp(5)).await);
    }

    #[tokio::test]
    async fn clear_empties_the_table() {
        let cache = DedupCache::new();
        for seed in 0..3 {
            cache.mark_seen(&fp(seed)).await;
        }

        assert_eq!(cache.clear().await, 3);
        assert!(cache.is_empty().await);
        assert_eq!(cache.statistics().await.total_seen, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_check_and_mark_admits_exactly_one() {
        let cache = Arc::new(DedupCache::new());
        let admitted = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..32 {
            let cache = cache.clone();
            let admitted = admitted.clone();
            handles.push(tokio::spawn(async move {
                if !cache.is_duplicate(&fp(9)).await {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            admitted.load(Ordering::SeqCst),
            1,
            "exactly one concurrent sighting may pass the duplicate check"
        );
        let stats = cache.statistics().await;
        assert_eq!(stats.total_seen, 1);
        assert_eq!(stats.duplicates_blocked, 31);
    }
}
