//! # Relay Scheduler
//!
//! Owns every pending re-broadcast: which message copies this node has
//! committed to forward, and when each one fires. Jittered timing is the
//! whole point of this component, so deadlines are tracked precisely
//! rather than batched.
//!
//! ## Architecture
//!
//! A cloneable [`RelayScheduler`] handle feeds commands over an mpsc
//! channel into a private actor that owns all state. One loop drives a
//! priority queue of `(execute_at, fingerprint)` deadlines, sleeping until
//! the earliest one, instead of arming a timer per entry: the entry count
//! is already capped, and a single loop keeps firing strictly ordered.
//!
//! Because every mutation funnels through the actor, the lifecycle rules
//! come out exact rather than best-effort approximations:
//!
//! - Pending -> Executed and Pending -> Cancelled are terminal and
//!   mutually exclusive; a fingerprint makes at most one transition per
//!   scheduling cycle.
//! - Once firing has begun, a racing cancel request is sequenced after it
//!   and reports failure. Execution wins; cancellation is best-effort.
//!
//! ## Backpressure
//!
//! At most [`RELAY_CAPACITY`] entries may be pending. Beyond that the
//! scheduler refuses new work (the newcomer is dropped, never an older
//! commitment) and the message simply is not relayed by this node - a
//! degradation the flood absorbs, not an error.
//!
//! Cancelled deadlines stay in the queue and are skipped when they
//! surface; a live entry is recognized by matching deadline. Pending
//! entries that somehow outlive [`STALE_AFTER`] are force-cancelled by a
//! periodic sweep and counted as anomalies.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::message::{Fingerprint, MeshMessage, MessageClass};
use crate::protocols::RelayExecutor;

/// Maximum number of relays pending at once.
/// A node that cannot keep up stops accepting new relay work instead of
/// queueing unboundedly; the mesh routes around it.
pub const RELAY_CAPACITY: usize = 20;

/// Age at which a Pending entry is considered lost to a missed timer and
/// force-cancelled by the maintenance sweep. Should never trigger while
/// the firing loop is healthy.
pub const STALE_AFTER: Duration = Duration::from_secs(300);

/// Interval between maintenance sweeps over the pending table.
pub const STALE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

// ============================================================================
// Priority
// ============================================================================

/// Scheduling priority of a relay, expressed as jitter spread.
///
/// Urgent traffic fires in a tight, predictable window; low-priority
/// traffic is smeared wide to soak up contention from everything else.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RelayPriority {
    Urgent,
    High,
    Normal,
    Low,
}

impl RelayPriority {
    /// Exclusive upper bound of the priority jitter in milliseconds,
    /// added on top of the policy's base delay.
    #[inline]
    pub fn jitter_window_ms(self) -> u64 {
        match self {
            RelayPriority::Urgent => 25,
            RelayPriority::High => 50,
            RelayPriority::Normal => 100,
            RelayPriority::Low => 200,
        }
    }
}

impl From<MessageClass> for RelayPriority {
    fn from(class: MessageClass) -> Self {
        match class {
            MessageClass::Standard => RelayPriority::Normal,
            MessageClass::LowPriority => RelayPriority::Low,
        }
    }
}

// ============================================================================
// Configuration & statistics
// ============================================================================

#[derive(Clone, Copy, Debug)]
pub struct SchedulerConfig {
    pub capacity: usize,
    pub stale_after: Duration,
    pub sweep_interval: Duration,
    /// Seed for the priority-jitter RNG. `None` uses system entropy;
    /// tests pass a seed for reproducible deadlines.
    pub rng_seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            capacity: RELAY_CAPACITY,
            stale_after: STALE_AFTER,
            sweep_interval: STALE_SWEEP_INTERVAL,
            rng_seed: None,
        }
    }
}

/// Running totals kept by the actor. `scheduled` always equals
/// `executed + cancelled + pending`.
#[derive(Clone, Copy, Debug, Default)]
pub struct SchedulerStatistics {
    pub scheduled: u64,
    pub executed: u64,
    /// Explicit cancellations plus stale force-cancellations.
    pub cancelled: u64,
    pub pending: usize,
    /// Schedule calls refused because the table was full.
    pub rejected_capacity: u64,
    /// Schedule calls refused because the fingerprint was already pending.
    pub rejected_duplicate: u64,
    /// Pending entries force-cancelled by the maintenance sweep.
    pub stale_expired: u64,
}

/// A relay commitment awaiting its deadline.
struct PendingRelay {
    relay: MeshMessage,
    scheduled_at: Instant,
    execute_at: Instant,
    priority: RelayPriority,
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum SchedulerCommand {
    Schedule {
        relay: MeshMessage,
        base_delay: Duration,
        priority: RelayPriority,
        reply: oneshot::Sender<bool>,
    },
    Cancel {
        fingerprint: Fingerprint,
        reply: oneshot::Sender<bool>,
    },
    CancelAll {
        reply: oneshot::Sender<usize>,
    },
    Statistics {
        reply: oneshot::Sender<SchedulerStatistics>,
    },
    Quit,
}

// ============================================================================
// RelayScheduler Handle (public API - cheap to clone)
// ============================================================================

/// Handle to the scheduler actor. Cheap to clone.
#[derive(Clone)]
pub struct RelayScheduler {
    cmd_tx: mpsc::Sender<SchedulerCommand>,
}

impl std::fmt::Debug for RelayScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayScheduler").finish_non_exhaustive()
    }
}

impl RelayScheduler {
    /// Spawn the scheduler actor with the given firing collaborator.
    pub fn spawn<E: RelayExecutor>(executor: Arc<E>, config: SchedulerConfig) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(256);

        debug!(
            capacity = config.capacity,
            stale_secs = config.stale_after.as_secs(),
            "relay scheduler started"
        );

        let actor = RelaySchedulerActor::new(executor, config);
        tokio::spawn(actor.run(cmd_rx));

        Self { cmd_tx }
    }

    /// Commit to relaying a derived message copy after `base_delay` plus a
    /// priority-scaled jitter.
    ///
    /// Returns false, with no state change, if the fingerprint is already
    /// pending or the table is at capacity.
    pub async fn schedule_relay(
        &self,
        relay: MeshMessage,
        base_delay: Duration,
        priority: RelayPriority,
    ) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();

        if self
            .cmd_tx
            .send(SchedulerCommand::Schedule {
                relay,
                base_delay,
                priority,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }

        reply_rx.await.unwrap_or(false)
    }

    /// Cancel the pending relay for a fingerprint, if there is one.
    ///
    /// Returns false if nothing was pending - including the case where the
    /// relay is firing right now: once firing has begun, execution wins.
    pub async fn cancel_relay(&self, fingerprint: &Fingerprint) -> bool {
        let (reply_tx, reply_rx) = oneshot::channel();

        if self
            .cmd_tx
            .send(SchedulerCommand::Cancel {
                fingerprint: *fingerprint,
                reply: reply_tx,
            })
            .await
            .is_err()
        {
            return false;
        }

        reply_rx.await.unwrap_or(false)
    }

    /// Force-cancel every pending relay (shutdown path). Returns how many
    /// were dropped.
    pub async fn cancel_all_relays(&self) -> usize {
        let (reply_tx, reply_rx) = oneshot::channel();

        if self
            .cmd_tx
            .send(SchedulerCommand::CancelAll { reply: reply_tx })
            .await
            .is_err()
        {
            return 0;
        }

        reply_rx.await.unwrap_or(0)
    }

    pub async fn statistics(&self) -> SchedulerStatistics {
        let (reply_tx, reply_rx) = oneshot::channel();

        if self
            .cmd_tx
            .send(SchedulerCommand::Statistics { reply: reply_tx })
            .await
            .is_err()
        {
            return SchedulerStatistics::default();
        }

        reply_rx.await.unwrap_or_default()
    }

    /// Shut down the scheduler actor.
    pub async fn quit(&self) {
        let _ = self.cmd_tx.send(SchedulerCommand::Quit).await;
    }
}

// ============================================================================
// RelayScheduler Actor (owns all state, processes commands sequentially)
// ============================================================================

struct RelaySchedulerActor<E: RelayExecutor> {
    executor: Arc<E>,
    config: SchedulerConfig,
    /// Pending relays by fingerprint. Presence here is what "Pending"
    /// means; removal is the terminal transition.
    pending: HashMap<Fingerprint, PendingRelay>,
    /// Min-heap of deadlines. May contain entries for relays that were
    /// cancelled or rescheduled since; those are skipped on pop by
    /// comparing deadlines against the pending table.
    deadlines: BinaryHeap<Reverse<(Instant, Fingerprint)>>,
    rng: StdRng,
    scheduled: u64,
    executed: u64,
    cancelled: u64,
    rejected_capacity: u64,
    rejected_duplicate: u64,
    stale_expired: u64,
}

impl<E: RelayExecutor> RelaySchedulerActor<E> {
    fn new(executor: Arc<E>, config: SchedulerConfig) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            executor,
            config,
            pending: HashMap::new(),
            deadlines: BinaryHeap::new(),
            rng,
            scheduled: 0,
            executed: 0,
            cancelled: 0,
            rejected_capacity: 0,
            rejected_duplicate: 0,
            stale_expired: 0,
        }
    }

    async fn run(mut self, mut cmd_rx: mpsc::Receiver<SchedulerCommand>) {
        let mut sweep_interval = tokio::time::interval(self.config.sweep_interval);
        sweep_interval.tick().await; // Skip initial tick

        loop {
            let next_deadline = self.deadlines.peek().map(|Reverse((at, _))| *at);
            // Placeholder target; the branch is disabled while the queue
            // is empty.
            let sleep_target =
                next_deadline.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(SchedulerCommand::Schedule { relay, base_delay, priority, reply }) => {
                            let _ = reply.send(self.schedule(relay, base_delay, priority));
                        }
                        Some(SchedulerCommand::Cancel { fingerprint, reply }) => {
                            let _ = reply.send(self.cancel(&fingerprint));
                        }
                        Some(SchedulerCommand::CancelAll { reply }) => {
                            let _ = reply.send(self.cancel_all());
                        }
                        Some(SchedulerCommand::Statistics { reply }) => {
                            let _ = reply.send(self.statistics());
                        }
                        Some(SchedulerCommand::Quit) | None => {
                            debug!("relay scheduler shutting down");
                            break;
                        }
                    }
                }

                _ = tokio::time::sleep_until(sleep_target), if next_deadline.is_some() => {
                    self.fire_due().await;
                }

                _ = sweep_interval.tick() => {
                    self.sweep_stale();
                }
            }
        }
    }

    fn schedule(
        &mut self,
        relay: MeshMessage,
        base_delay: Duration,
        priority: RelayPriority,
    ) -> bool {
        let fingerprint = relay.fingerprint();

        if self.pending.contains_key(&fingerprint) {
            self.rejected_duplicate += 1;
            debug!(
                fingerprint = %hex::encode(&fingerprint[..8]),
                "relay already pending, rejecting"
            );
            return false;
        }
        if self.pending.len() >= self.config.capacity {
            self.rejected_capacity += 1;
            debug!(
                capacity = self.config.capacity,
                "relay table full, rejecting"
            );
            return false;
        }

        let now = Instant::now();
        let jitter = Duration::from_millis(self.rng.gen_range(0..priority.jitter_window_ms()));
        let execute_at = now + base_delay + jitter;

        self.deadlines.push(Reverse((execute_at, fingerprint)));
        self.pending.insert(
            fingerprint,
            PendingRelay {
                relay,
                scheduled_at: now,
                execute_at,
                priority,
            },
        );
        self.scheduled += 1;

        trace!(
            fingerprint = %hex::encode(&fingerprint[..8]),
            delay_ms = (base_delay + jitter).as_millis() as u64,
            priority = ?priority,
            pending = self.pending.len(),
            "scheduled relay"
        );
        true
    }

    fn cancel(&mut self, fingerprint: &Fingerprint) -> bool {
        match self.pending.remove(fingerprint) {
            Some(_) => {
                self.cancelled += 1;
                trace!(
                    fingerprint = %hex::encode(&fingerprint[..8]),
                    "cancelled pending relay"
                );
                true
            }
            None => false,
        }
    }

    fn cancel_all(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.deadlines.clear();
        self.cancelled += dropped as u64;
        if dropped > 0 {
            debug!(dropped, "cancelled all pending relays");
        }
        dropped
    }

    /// Pop and fire every deadline that has come due.
    async fn fire_due(&mut self) {
        let now = Instant::now();

        while let Some(&Reverse((execute_at, fingerprint))) = self.deadlines.peek() {
            if execute_at > now {
                break;
            }
            self.deadlines.pop();

            let Some(pending) = self.pending.remove(&fingerprint) else {
                // Deadline of a relay cancelled since; skip.
                continue;
            };
            if pending.execute_at != execute_at {
                // Deadline left over from an earlier scheduling cycle of
                // this fingerprint; the live entry keeps its own deadline.
                self.pending.insert(fingerprint, pending);
                continue;
            }

            self.executed += 1;
            trace!(
                fingerprint = %hex::encode(&fingerprint[..8]),
                priority = ?pending.priority,
                "firing relay"
            );
            self.executor.execute(pending.relay).await;
        }
    }

    /// Force-cancel Pending entries that outlived the stale threshold.
    /// Entries only get this old if their deadline was somehow missed.
    fn sweep_stale(&mut self) {
        let now = Instant::now();
        let stale_after = self.config.stale_after;

        let stale: Vec<Fingerprint> = self
            .pending
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.scheduled_at) > stale_after)
            .map(|(fingerprint, _)| *fingerprint)
            .collect();

        for fingerprint in stale {
            if self.pending.remove(&fingerprint).is_some() {
                self.cancelled += 1;
                self.stale_expired += 1;
                warn!(
                    fingerprint = %hex::encode(&fingerprint[..8]),
                    "force-cancelled stale pending relay"
                );
            }
        }
    }

    fn statistics(&self) -> SchedulerStatistics {
        SchedulerStatistics {
            scheduled: self.scheduled,
            executed: self.executed,
            cancelled: self.cancelled,
            pending: self.pending.len(),
            rejected_capacity: self.rejected_capacity,
            rejected_duplicate: self.rejected_duplicate,
            stale_expired: self.stale_expired,
        }
    }
}
