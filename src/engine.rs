//! # Mesh Engine
//!
//! Composition root of the flood-control pipeline. Wires the dedup cache,
//! the relay policy, the relay scheduler and the metrics block to the
//! collaborator seams in [`crate::protocols`], and owns the two paths a
//! message can take through this node:
//!
//! - **Receive** ([`MeshEngine::handle_inbound`]): dedup check, exactly-once
//!   delivery to the application, then a probabilistic relay commitment.
//! - **Send** ([`MeshEngine::send`]): originate a message, pre-seed the
//!   dedup cache so the node's own transmission cannot bounce back in, and
//!   broadcast it.
//!
//! The engine never fails a caller over mesh conditions. Refusals (duplicate,
//! capacity, hop budget) are counted and logged; only a local misuse
//! (oversized payload) or a transport fault surfaces as an error.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::dedup::{CacheStatistics, DedupCache, MESSAGE_RETENTION, SWEEP_INTERVAL};
use crate::message::{
    encode_message, Fingerprint, MeshMessage, MessageClass, NodeId, DEFAULT_TTL, MAX_PAYLOAD_SIZE,
};
use crate::metrics::{MeshMetrics, MetricsSnapshot};
use crate::policy::{self, HIGH_DEGREE_THRESHOLD};
use crate::protocols::{MeshTransport, MessageDelivery, RelayExecutor};
use crate::scheduler::{
    RelayPriority, RelayScheduler, SchedulerConfig, SchedulerStatistics, RELAY_CAPACITY,
    STALE_AFTER,
};

// ============================================================================
// Configuration
// ============================================================================

/// Tunables for one engine instance. [`Default`] mirrors the module
/// constants; tests override individual fields with struct-update syntax.
#[derive(Clone, Copy, Debug)]
pub struct FloodConfig {
    /// Hop budget stamped on locally originated messages.
    pub default_ttl: u8,
    /// Degree at or above which the tighter density TTL cap applies.
    pub high_degree_threshold: usize,
    /// How long a fingerprint stays in the dedup cache.
    pub retention: Duration,
    /// Interval of the cache eviction sweep.
    pub sweep_interval: Duration,
    /// Maximum number of relays pending at once.
    pub capacity: usize,
    /// Age at which a pending relay is force-cancelled.
    pub stale_after: Duration,
    /// Seed for the policy and jitter RNGs. `None` uses system entropy;
    /// tests pass a seed for reproducible decisions.
    pub rng_seed: Option<u64>,
}

impl Default for FloodConfig {
    fn default() -> Self {
        Self {
            default_ttl: DEFAULT_TTL,
            high_degree_threshold: HIGH_DEGREE_THRESHOLD,
            retention: MESSAGE_RETENTION,
            sweep_interval: SWEEP_INTERVAL,
            capacity: RELAY_CAPACITY,
            stale_after: STALE_AFTER,
            rng_seed: None,
        }
    }
}

// ============================================================================
// Send-path rejection
// ============================================================================

/// Why a locally originated send was refused before touching the mesh.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SendRejection {
    /// Payload exceeds [`MAX_PAYLOAD_SIZE`].
    PayloadTooLarge { size: usize },
}

impl std::fmt::Display for SendRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendRejection::PayloadTooLarge { size } => write!(
                f,
                "payload of {} bytes exceeds the {} byte limit",
                size, MAX_PAYLOAD_SIZE
            ),
        }
    }
}

impl std::error::Error for SendRejection {}

// ============================================================================
// Relay firing bridge
// ============================================================================

/// [`RelayExecutor`] the engine installs into the scheduler: counts the
/// execution, encodes the relay copy and puts it on the air. Transport
/// faults are logged and absorbed; the flood tolerates a lost copy.
struct RelayBroadcaster<T: MeshTransport> {
    transport: Arc<T>,
    metrics: Arc<MeshMetrics>,
}

#[async_trait]
impl<T: MeshTransport> RelayExecutor for RelayBroadcaster<T> {
    async fn execute(&self, relay: MeshMessage) {
        self.metrics.record_relay_executed();

        let frame = match encode_message(&relay) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "failed to encode relay copy, dropping");
                return;
            }
        };

        trace!(
            message_id = ?relay.id,
            ttl = relay.ttl,
            relay_count = relay.relay_count,
            "re-broadcasting relay copy"
        );
        if let Err(e) = self.transport.broadcast(frame).await {
            warn!(error = %e, "relay broadcast failed");
        }
    }
}

// ============================================================================
// MeshEngine
// ============================================================================

/// Flood-control engine for one mesh node.
pub struct MeshEngine<T: MeshTransport, D: MessageDelivery> {
    transport: Arc<T>,
    delivery: Arc<D>,
    cache: Arc<DedupCache>,
    metrics: Arc<MeshMetrics>,
    scheduler: RelayScheduler,
    /// RNG behind the relay-probability and jitter draws. A short critical
    /// section per inbound message; decisions stay serialized so seeded
    /// runs are reproducible.
    policy_rng: Mutex<StdRng>,
    config: FloodConfig,
    sweep_task: tokio::task::JoinHandle<()>,
}

impl<T: MeshTransport, D: MessageDelivery> MeshEngine<T, D> {
    /// Build the engine, spawn the relay scheduler and the cache sweep.
    pub fn new(transport: Arc<T>, delivery: Arc<D>, config: FloodConfig) -> Self {
        let cache = Arc::new(DedupCache::with_retention(config.retention));
        let metrics = Arc::new(MeshMetrics::new());

        let scheduler = RelayScheduler::spawn(
            Arc::new(RelayBroadcaster {
                transport: Arc::clone(&transport),
                metrics: Arc::clone(&metrics),
            }),
            SchedulerConfig {
                capacity: config.capacity,
                stale_after: config.stale_after,
                sweep_interval: config.sweep_interval,
                rng_seed: config.rng_seed,
            },
        );

        let sweep_task = tokio::spawn({
            let cache = Arc::clone(&cache);
            let sweep_interval = config.sweep_interval;
            async move {
                let mut ticker = tokio::time::interval(sweep_interval);
                ticker.tick().await; // Skip initial tick
                loop {
                    ticker.tick().await;
                    cache.evict_expired().await;
                }
            }
        });

        let policy_rng = Mutex::new(match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        });

        debug!(
            node = ?transport.local_id(),
            default_ttl = config.default_ttl,
            "mesh engine started"
        );

        Self {
            transport,
            delivery,
            cache,
            metrics,
            scheduler,
            policy_rng,
            config,
            sweep_task,
        }
    }

    /// Process one decoded message that arrived over a direct link.
    ///
    /// Every distinct fingerprint is delivered to the application exactly
    /// once, whether or not this node goes on to relay it. Duplicates are
    /// dropped and, when a relay of the same fingerprint is still pending,
    /// that relay is cancelled: a second copy on the air means a neighbor
    /// already covered this region.
    pub async fn handle_inbound(&self, message: MeshMessage) {
        let fingerprint = message.fingerprint();

        if self.cache.is_duplicate(&fingerprint).await {
            if self.scheduler.cancel_relay(&fingerprint).await {
                self.metrics.record_relay_cancelled();
                debug!(
                    fingerprint = %hex::encode(&fingerprint[..8]),
                    "duplicate arrival, pending relay cancelled"
                );
            }
            self.metrics.record_duplicate_blocked();
            trace!(
                fingerprint = %hex::encode(&fingerprint[..8]),
                "duplicate suppressed"
            );
            return;
        }

        if message.is_relayed {
            self.metrics.record_received_relayed(message.relay_count);
        } else {
            self.metrics.record_received_direct();
        }
        self.delivery.deliver(message.clone()).await;

        if !message.can_relay() {
            trace!(
                fingerprint = %hex::encode(&fingerprint[..8]),
                ttl = message.ttl,
                "hop budget exhausted, not relaying"
            );
            return;
        }

        // Degree is sampled at decision time; by the moment the relay
        // fires the neighborhood may have changed, and that is fine.
        let degree = self.transport.degree();
        let sender_is_self = message.origin == self.transport.local_id();
        let decision = {
            let mut rng = self.policy_rng.lock().await;
            policy::decide(
                message.ttl,
                sender_is_self,
                degree,
                self.config.high_degree_threshold,
                message.class,
                &mut *rng,
            )
        };

        if !decision.should_relay {
            trace!(
                fingerprint = %hex::encode(&fingerprint[..8]),
                degree,
                sender_is_self,
                "not relaying"
            );
            return;
        }

        let relay = message.derive_relay(decision.new_ttl, self.transport.local_id());
        let priority = RelayPriority::from(message.class);
        if self
            .scheduler
            .schedule_relay(relay, decision.delay, priority)
            .await
        {
            self.metrics.record_relay_scheduled();
            trace!(
                fingerprint = %hex::encode(&fingerprint[..8]),
                new_ttl = decision.new_ttl,
                delay_ms = decision.delay.as_millis() as u64,
                "relay committed"
            );
        }
    }

    /// Originate a message with the default hop budget and standard class.
    pub async fn send(&self, payload: Vec<u8>) -> Result<Fingerprint> {
        self.send_with(payload, self.config.default_ttl, MessageClass::Standard)
            .await
    }

    /// Originate a message with an explicit hop budget and class.
    ///
    /// The fingerprint is marked as seen before the frame leaves, so a
    /// copy bounced straight back by a neighbor is already a duplicate.
    /// The content is not delivered back to this node's own application;
    /// the sender has it.
    pub async fn send_with(
        &self,
        payload: Vec<u8>,
        ttl: u8,
        class: MessageClass,
    ) -> Result<Fingerprint> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            let rejection = SendRejection::PayloadTooLarge {
                size: payload.len(),
            };
            debug!(%rejection, "send refused");
            return Err(rejection.into());
        }

        let message =
            MeshMessage::original_with(self.transport.local_id(), payload, ttl, class);
        let fingerprint = message.fingerprint();

        self.cache.mark_seen(&fingerprint).await;

        let frame = encode_message(&message).context("encode outbound message")?;
        self.transport
            .broadcast(frame)
            .await
            .context("broadcast outbound message")?;

        debug!(
            fingerprint = %hex::encode(&fingerprint[..8]),
            ttl,
            class = ?class,
            "sent original message"
        );
        Ok(fingerprint)
    }

    /// Stop background work: the cache sweep, then every pending relay.
    /// In-flight firing finishes; nothing new is committed afterwards.
    pub async fn shutdown(&self) {
        self.sweep_task.abort();

        let dropped = self.scheduler.cancel_all_relays().await;
        if dropped > 0 {
            self.metrics.record_relays_cancelled(dropped as u64);
        }
        self.scheduler.quit().await;

        debug!(dropped, "mesh engine shut down");
    }

    pub fn local_id(&self) -> NodeId {
        self.transport.local_id()
    }

    pub fn config(&self) -> &FloodConfig {
        &self.config
    }

    pub fn metrics_snapshot(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    pub async fn cache_statistics(&self) -> CacheStatistics {
        self.cache.statistics().await
    }

    pub async fn scheduler_statistics(&self) -> SchedulerStatistics {
        self.scheduler.statistics().await
    }
}
