//! # Flood-Control Metrics
//!
//! Monotonic counters covering the whole receive/relay pipeline, updated
//! from every context that touches a message: inbound handlers on
//! arbitrary tasks, the scheduler's firing loop, and the send path. All
//! counters are relaxed atomics; there is no lock to contend and no
//! ordering dependency between counters.
//!
//! [`MeshMetrics::snapshot`] derives the ratios on read, so the stored
//! state stays append-only.
//!
//! ## Invariants
//!
//! - C1: every counter is monotonically non-decreasing
//! - C2: `relays_executed + relays_cancelled <= relays_scheduled`
//! - C3: `relays_executed` and `relayed_sent` count transmissions by this
//!   node; `relayed_received` counts arrivals of other nodes' relays and is
//!   the sole feed of the hop average. The two directions never mix.
//!
//! The hop average is maintained as a running `hop_total` next to
//! `relayed_received` and divided on read. This is algebraically the
//! incremental form `avg' = ((n-1)*avg + hops) / n` without the
//! read-modify-write race that form would need under concurrent arrivals.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared counter block for one engine instance.
#[derive(Debug, Default)]
pub struct MeshMetrics {
    received: AtomicU64,
    duplicates_blocked: AtomicU64,
    relays_scheduled: AtomicU64,
    relays_executed: AtomicU64,
    relays_cancelled: AtomicU64,
    direct_received: AtomicU64,
    relayed_received: AtomicU64,
    relayed_sent: AtomicU64,
    hop_total: AtomicU64,
}

/// Point-in-time counter values plus ratios derived at read time.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Distinct messages accepted (first sighting of their fingerprint).
    pub received: u64,
    /// Sightings rejected by the dedup cache.
    pub duplicates_blocked: u64,
    pub relays_scheduled: u64,
    pub relays_executed: u64,
    pub relays_cancelled: u64,
    /// Accepted messages that arrived straight from their origin.
    pub direct_received: u64,
    /// Accepted messages that arrived through at least one relay.
    pub relayed_received: u64,
    /// Relay copies this node has put on the air.
    pub relayed_sent: u64,
    /// Share of sightings that were duplicates, in [0, 1].
    pub duplicate_ratio: f64,
    /// Executed relays over scheduled relays; 1.0 while nothing was
    /// scheduled.
    pub relay_completion_ratio: f64,
    /// Mean relay hop count over relayed arrivals.
    pub average_relay_hops: f64,
}

impl MeshMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received_direct(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.direct_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received_relayed(&self, hops: u8) {
        self.received.fetch_add(1, Ordering::Relaxed);
        self.relayed_received.fetch_add(1, Ordering::Relaxed);
        self.hop_total.fetch_add(hops as u64, Ordering::Relaxed);
    }

    pub fn record_duplicate_blocked(&self) {
        self.duplicates_blocked.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay_scheduled(&self) {
        self.relays_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_relay_cancelled(&self) {
        self.relays_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Bulk variant for the shutdown path, where every still-pending relay
    /// is dropped at once.
    pub fn record_relays_cancelled(&self, count: u64) {
        self.relays_cancelled.fetch_add(count, Ordering::Relaxed);
    }

    /// One relay copy fired and went out. Counts both the scheduler-side
    /// execution and the transmission itself (C3).
    pub fn record_relay_executed(&self) {
        self.relays_executed.fetch_add(1, Ordering::Relaxed);
        self.relayed_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let received = self.received.load(Ordering::Relaxed);
        let duplicates_blocked = self.duplicates_blocked.load(Ordering::Relaxed);
        let relays_scheduled = self.relays_scheduled.load(Ordering::Relaxed);
        let relays_executed = self.relays_executed.load(Ordering::Relaxed);
        let relayed_received = self.relayed_received.load(Ordering::Relaxed);
        let hop_total = self.hop_total.load(Ordering::Relaxed);

        let sightings = received + duplicates_blocked;
        let duplicate_ratio = if sightings > 0 {
            duplicates_blocked as f64 / sightings as f64
        } else {
            0.0
        };
        let relay_completion_ratio = if relays_scheduled > 0 {
            relays_executed as f64 / relays_scheduled as f64
        } else {
            1.0
        };
        let average_relay_hops = if relayed_received > 0 {
            hop_total as f64 / relayed_received as f64
        } else {
            0.0
        };

        MetricsSnapshot {
            received,
            duplicates_blocked,
            relays_scheduled,
            relays_executed,
            relays_cancelled: self.relays_cancelled.load(Ordering::Relaxed),
            direct_received: self.direct_received.load(Ordering::Relaxed),
            relayed_received,
            relayed_sent: self.relayed_sent.load(Ordering::Relaxed),
            duplicate_ratio,
            relay_completion_ratio,
            average_relay_hops,
        }
    }
}
