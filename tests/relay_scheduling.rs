//! Relay scheduler behavior through the public API: capacity pressure,
//! the one-pending-per-fingerprint rule, deadline ordering, and the
//! statistics identity.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use meshflood::{
    MeshMessage, NodeId, RelayExecutor, RelayPriority, RelayScheduler, SchedulerConfig,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(15);

// =============================================================================
// Recording executor
// =============================================================================

struct RecordingExecutor {
    fired: mpsc::UnboundedSender<MeshMessage>,
}

#[async_trait]
impl RelayExecutor for RecordingExecutor {
    async fn execute(&self, relay: MeshMessage) {
        let _ = self.fired.send(relay);
    }
}

fn spawn_scheduler(
    config: SchedulerConfig,
) -> (RelayScheduler, mpsc::UnboundedReceiver<MeshMessage>) {
    let (fired_tx, fired_rx) = mpsc::unbounded_channel();
    (
        RelayScheduler::spawn(Arc::new(RecordingExecutor { fired: fired_tx }), config),
        fired_rx,
    )
}

fn seeded(capacity: usize) -> SchedulerConfig {
    SchedulerConfig {
        capacity,
        rng_seed: Some(31),
        ..SchedulerConfig::default()
    }
}

fn relay_copy(tag: u8) -> MeshMessage {
    MeshMessage::original(NodeId::from_bytes([tag; 16]), vec![tag])
        .derive_relay(3, NodeId::from_bytes([0xF0; 16]))
}

// =============================================================================
// Test: capacity pressure drops the newcomer
// =============================================================================

/// Test that with capacity 2, a third schedule attempt is refused while
/// both existing commitments are kept.
#[tokio::test(start_paused = true)]
async fn capacity_two_refuses_third_commitment() {
    let (scheduler, mut fired_rx) = spawn_scheduler(seeded(2));
    let delay = Duration::from_millis(100);

    let first = relay_copy(1);
    let second = relay_copy(2);
    let third = relay_copy(3);

    assert!(scheduler.schedule_relay(first.clone(), delay, RelayPriority::Normal).await);
    assert!(scheduler.schedule_relay(second.clone(), delay, RelayPriority::Normal).await);
    assert!(!scheduler.schedule_relay(third.clone(), delay, RelayPriority::Normal).await);

    let stats = scheduler.statistics().await;
    assert_eq!(stats.pending, 2);
    assert_eq!(stats.rejected_capacity, 1);

    // The two accepted commitments still fire; the rejected one never does.
    let mut fired = Vec::new();
    for _ in 0..2 {
        let relay = timeout(TEST_TIMEOUT, fired_rx.recv())
            .await
            .expect("relay firing timeout")
            .expect("scheduler gone");
        fired.push(relay.fingerprint());
    }
    assert!(fired.contains(&first.fingerprint()));
    assert!(fired.contains(&second.fingerprint()));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(fired_rx.try_recv().is_err(), "rejected relay fired anyway");

    scheduler.quit().await;
}

// =============================================================================
// Test: duplicate arrival cancellation flow
// =============================================================================

/// Test the second-copy flow: one pending commitment per fingerprint, one
/// successful cancellation, and no transmission afterwards.
#[tokio::test(start_paused = true)]
async fn duplicate_copy_cancels_exactly_once() {
    let (scheduler, mut fired_rx) = spawn_scheduler(seeded(20));
    let relay = relay_copy(7);
    let fingerprint = relay.fingerprint();

    assert!(
        scheduler
            .schedule_relay(relay, Duration::from_millis(200), RelayPriority::Normal)
            .await
    );

    // First duplicate cancels; a second has nothing left to cancel.
    assert!(scheduler.cancel_relay(&fingerprint).await);
    assert!(!scheduler.cancel_relay(&fingerprint).await);

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(fired_rx.try_recv().is_err(), "cancelled relay fired");

    let stats = scheduler.statistics().await;
    assert_eq!(stats.scheduled, 1);
    assert_eq!(stats.cancelled, 1);
    assert_eq!(stats.executed, 0);
    assert_eq!(stats.pending, 0);

    scheduler.quit().await;
}

// =============================================================================
// Test: deadline ordering
// =============================================================================

/// Test that commitments fire in deadline order regardless of the order
/// they were scheduled in. Urgent jitter is narrower than the gaps used.
#[tokio::test(start_paused = true)]
async fn firing_respects_deadline_order() {
    let (scheduler, mut fired_rx) = spawn_scheduler(seeded(20));

    let slow = relay_copy(1);
    let fast = relay_copy(2);
    let middle = relay_copy(3);

    assert!(
        scheduler
            .schedule_relay(slow.clone(), Duration::from_millis(500), RelayPriority::Urgent)
            .await
    );
    assert!(
        scheduler
            .schedule_relay(fast.clone(), Duration::from_millis(100), RelayPriority::Urgent)
            .await
    );
    assert!(
        scheduler
            .schedule_relay(middle.clone(), Duration::from_millis(300), RelayPriority::Urgent)
            .await
    );

    let mut order = Vec::new();
    for _ in 0..3 {
        let relay = timeout(TEST_TIMEOUT, fired_rx.recv())
            .await
            .expect("relay firing timeout")
            .expect("scheduler gone");
        order.push(relay.fingerprint());
    }
    assert_eq!(
        order,
        vec![
            fast.fingerprint(),
            middle.fingerprint(),
            slow.fingerprint()
        ]
    );

    scheduler.quit().await;
}

// =============================================================================
// Test: a fingerprint may be committed again after executing
// =============================================================================

/// Test that execution ends the scheduling cycle: the same fingerprint is
/// accepted again afterwards and the statistics identity holds throughout.
#[tokio::test(start_paused = true)]
async fn fingerprint_readmitted_after_execution() {
    let (scheduler, mut fired_rx) = spawn_scheduler(seeded(20));
    let relay = relay_copy(9);

    assert!(
        scheduler
            .schedule_relay(relay.clone(), Duration::from_millis(50), RelayPriority::High)
            .await
    );
    assert!(timeout(TEST_TIMEOUT, fired_rx.recv()).await.expect("timeout").is_some());

    assert!(
        scheduler
            .schedule_relay(relay.clone(), Duration::from_millis(50), RelayPriority::High)
            .await
    );

    let stats = scheduler.statistics().await;
    assert_eq!(stats.scheduled, 2);
    assert_eq!(stats.executed, 1);
    assert_eq!(stats.pending, 1);
    assert_eq!(
        stats.scheduled,
        stats.executed + stats.cancelled + stats.pending as u64
    );

    scheduler.quit().await;
}

// =============================================================================
// Test: statistics identity over a mixed workload
// =============================================================================

/// Test that `scheduled == executed + cancelled + pending` after an
/// interleaving of schedules, cancels, firings, and a drain.
#[tokio::test(start_paused = true)]
async fn statistics_identity_over_mixed_workload() {
    let (scheduler, mut fired_rx) = spawn_scheduler(seeded(20));
    let near = Duration::from_millis(20);
    let far = Duration::from_secs(60);

    // Two fire, one is cancelled, two are left pending and drained.
    let copies: Vec<MeshMessage> = (1u8..=5).map(relay_copy).collect();
    for (index, delay) in [near, near, far, far, far].into_iter().enumerate() {
        assert!(
            scheduler
                .schedule_relay(copies[index].clone(), delay, RelayPriority::Normal)
                .await
        );
    }
    assert!(scheduler.cancel_relay(&copies[2].fingerprint()).await);

    for _ in 0..2 {
        assert!(timeout(TEST_TIMEOUT, fired_rx.recv()).await.expect("timeout").is_some());
    }

    let drained = scheduler.cancel_all_relays().await;
    assert_eq!(drained, 2);

    let stats = scheduler.statistics().await;
    assert_eq!(stats.scheduled, 5);
    assert_eq!(stats.executed, 2);
    assert_eq!(stats.cancelled, 3);
    assert_eq!(stats.pending, 0);
    assert_eq!(
        stats.scheduled,
        stats.executed + stats.cancelled + stats.pending as u64
    );

    scheduler.quit().await;
}
