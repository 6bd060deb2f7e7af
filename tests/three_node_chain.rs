//! End-to-end relay chains over an in-memory mesh.
//!
//! These tests wire several engines together with channel-backed
//! transports and validate multi-hop propagation: hop-state rewriting,
//! exactly-once delivery at every node, and hop-budget exhaustion.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::timeout;

use meshflood::{
    decode_message, FloodConfig, MeshEngine, MeshMessage, MeshTransport, MessageClass,
    MessageDelivery, NodeId,
};

const TEST_TIMEOUT: Duration = Duration::from_secs(15);
const MESSAGE_WAIT: Duration = Duration::from_millis(500);

// =============================================================================
// In-memory mesh harness
// =============================================================================

struct LineTransport {
    id: NodeId,
    lines: Vec<mpsc::Sender<Vec<u8>>>,
}

#[async_trait]
impl MeshTransport for LineTransport {
    async fn broadcast(&self, frame: Vec<u8>) -> Result<()> {
        for line in &self.lines {
            let _ = line.send(frame.clone()).await;
        }
        Ok(())
    }

    fn degree(&self) -> usize {
        self.lines.len()
    }

    fn local_id(&self) -> NodeId {
        self.id
    }
}

struct TaggedDelivery {
    node: usize,
    delivered: mpsc::UnboundedSender<(usize, MeshMessage)>,
}

#[async_trait]
impl MessageDelivery for TaggedDelivery {
    async fn deliver(&self, message: MeshMessage) {
        let _ = self.delivered.send((self.node, message));
    }
}

type ChainEngine = Arc<MeshEngine<LineTransport, TaggedDelivery>>;

fn node_id(index: usize) -> NodeId {
    let mut bytes = [0u8; 16];
    bytes[15] = index as u8;
    NodeId::from_bytes(bytes)
}

/// Build a line topology `0 - 1 - ... - n-1`: every engine broadcasts to
/// the inbound channel of its direct neighbors only.
fn spawn_line_mesh(
    nodes: usize,
) -> (Vec<ChainEngine>, mpsc::UnboundedReceiver<(usize, MeshMessage)>) {
    let (delivered_tx, delivered_rx) = mpsc::unbounded_channel();

    let mut inbound_txs = Vec::with_capacity(nodes);
    let mut inbound_rxs = Vec::with_capacity(nodes);
    for _ in 0..nodes {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(64);
        inbound_txs.push(tx);
        inbound_rxs.push(rx);
    }

    let mut engines: Vec<ChainEngine> = Vec::with_capacity(nodes);
    for index in 0..nodes {
        let mut lines = Vec::new();
        if index > 0 {
            lines.push(inbound_txs[index - 1].clone());
        }
        if index + 1 < nodes {
            lines.push(inbound_txs[index + 1].clone());
        }

        let transport = Arc::new(LineTransport {
            id: node_id(index),
            lines,
        });
        let delivery = Arc::new(TaggedDelivery {
            node: index,
            delivered: delivered_tx.clone(),
        });
        let config = FloodConfig {
            rng_seed: Some(17 + index as u64),
            ..FloodConfig::default()
        };
        engines.push(Arc::new(MeshEngine::new(transport, delivery, config)));
    }
    drop(inbound_txs);
    drop(delivered_tx);

    for (index, mut rx) in inbound_rxs.into_iter().enumerate() {
        let engine = Arc::clone(&engines[index]);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                if let Ok(message) = decode_message(&frame) {
                    engine.handle_inbound(message).await;
                }
            }
        });
    }

    (engines, delivered_rx)
}

async fn next_delivery(
    rx: &mut mpsc::UnboundedReceiver<(usize, MeshMessage)>,
) -> (usize, MeshMessage) {
    timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("delivery timeout")
        .expect("mesh torn down")
}

// =============================================================================
// Test: A - B - C relay chain
// =============================================================================

/// Test that a three-node chain relays A's message through B to C with the
/// hop state rewritten at every hop, delivering exactly once per node.
#[tokio::test]
async fn three_node_chain_relays_end_to_end() {
    let (engines, mut delivered_rx) = spawn_line_mesh(3);

    let payload = b"hello chain".to_vec();
    engines[0]
        .send_with(payload.clone(), 3, MessageClass::Standard)
        .await
        .expect("send failed");

    // B hears A directly.
    let (node, at_b) = next_delivery(&mut delivered_rx).await;
    assert_eq!(node, 1);
    assert_eq!(at_b.origin, node_id(0));
    assert_eq!(at_b.payload, payload);
    assert_eq!(at_b.ttl, 3);
    assert_eq!(at_b.relay_count, 0);
    assert!(!at_b.is_relayed);
    assert_eq!(at_b.last_relay, None);

    // C only hears B's relay copy.
    let (node, at_c) = next_delivery(&mut delivered_rx).await;
    assert_eq!(node, 2);
    assert_eq!(at_c.origin, node_id(0));
    assert_eq!(at_c.payload, payload);
    assert_eq!(at_c.ttl, 2);
    assert_eq!(at_c.relay_count, 1);
    assert!(at_c.is_relayed);
    assert_eq!(at_c.last_relay, Some(node_id(1)));
    assert_eq!(at_c.fingerprint(), at_b.fingerprint());

    // Let echoes settle: nothing is delivered twice anywhere, and A never
    // delivers its own message.
    tokio::time::sleep(MESSAGE_WAIT).await;
    assert!(
        delivered_rx.try_recv().is_err(),
        "a node delivered the same message twice"
    );

    // A heard B's relay copy of its own message and suppressed it.
    let at_a = engines[0].metrics_snapshot();
    assert_eq!(at_a.received, 0);
    assert!(at_a.duplicates_blocked >= 1);

    let at_b = engines[1].metrics_snapshot();
    assert_eq!(at_b.received, 1);
    assert_eq!(at_b.relays_executed, 1);

    for engine in &engines {
        engine.shutdown().await;
    }
}

// =============================================================================
// Test: hop budget exhaustion down a longer line
// =============================================================================

/// Test that a ttl-3 message crossing a five-node line reaches nodes 1-3
/// and dies before node 4: the last deliverable copy carries ttl 1.
#[tokio::test]
async fn five_node_line_respects_hop_budget() {
    let (engines, mut delivered_rx) = spawn_line_mesh(5);

    engines[0]
        .send_with(b"limited reach".to_vec(), 3, MessageClass::Standard)
        .await
        .expect("send failed");

    let mut reached = Vec::new();
    for _ in 0..3 {
        let (node, message) = next_delivery(&mut delivered_rx).await;
        reached.push((node, message.ttl, message.relay_count));
    }
    assert_eq!(reached, vec![(1, 3, 0), (2, 2, 1), (3, 1, 2)]);

    tokio::time::sleep(MESSAGE_WAIT).await;
    assert!(
        delivered_rx.try_recv().is_err(),
        "message travelled past its hop budget"
    );

    // Node 3 held a dead copy; it must not have committed a relay.
    assert_eq!(engines[3].metrics_snapshot().relays_scheduled, 0);
    assert_eq!(engines[4].metrics_snapshot().received, 0);

    for engine in &engines {
        engine.shutdown().await;
    }
}

// =============================================================================
// Test: duplicate copies racing down both sides of a loop
// =============================================================================

/// Test that with two originators flooding at once, every node still
/// delivers each distinct message exactly once.
#[tokio::test]
async fn concurrent_floods_deliver_each_message_once() {
    let nodes = 4;
    let (engines, mut delivered_rx) = spawn_line_mesh(nodes);

    let fp_left = engines[0]
        .send(b"from the left".to_vec())
        .await
        .expect("left send failed");
    let fp_right = engines[nodes - 1]
        .send(b"from the right".to_vec())
        .await
        .expect("right send failed");

    // Each message must surface on every node except its origin.
    let mut seen = std::collections::HashMap::new();
    for _ in 0..(2 * (nodes - 1)) {
        let (node, message) = next_delivery(&mut delivered_rx).await;
        let count = seen.entry((node, message.fingerprint())).or_insert(0u32);
        *count += 1;
    }

    tokio::time::sleep(MESSAGE_WAIT).await;
    assert!(delivered_rx.try_recv().is_err(), "duplicate delivery");

    for (index, _) in engines.iter().enumerate() {
        for fingerprint in [fp_left, fp_right] {
            let origin_index = if fingerprint == fp_left { 0 } else { nodes - 1 };
            if index == origin_index {
                assert!(!seen.contains_key(&(index, fingerprint)));
            } else {
                assert_eq!(seen.get(&(index, fingerprint)), Some(&1));
            }
        }
    }

    for engine in &engines {
        engine.shutdown().await;
    }
}
