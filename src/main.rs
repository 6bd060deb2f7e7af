use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::mpsc;
use tokio::time::{self, Duration};
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use meshflood::{
    decode_message, FloodConfig, MeshEngine, MeshMessage, MeshTransport, MessageDelivery, NodeId,
};

/// Simulated radio: broadcasting hands the frame to every neighbor's
/// inbound line. Degree is simply how many lines are attached.
struct SimTransport {
    id: NodeId,
    lines: Vec<mpsc::Sender<Vec<u8>>>,
}

#[async_trait]
impl MeshTransport for SimTransport {
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

struct SimDelivery {
    node: usize,
    delivered: Arc<AtomicU64>,
}

#[async_trait]
impl MessageDelivery for SimDelivery {
    async fn deliver(&self, message: MeshMessage) {
        self.delivered.fetch_add(1, Ordering::Relaxed);
        debug!(
            node = self.node,
            origin = ?message.origin,
            hops = message.relay_count,
            payload = %String::from_utf8_lossy(&message.payload),
            "delivered"
        );
    }
}

#[derive(Parser, Debug)]
#[command(name = "meshflood")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Number of simulated nodes, connected in a ring
    #[arg(short, long, default_value = "8")]
    nodes: usize,

    /// Probability of an extra chord link between two non-adjacent nodes
    #[arg(short, long, default_value = "0.15")]
    chords: f64,

    /// Messages to inject into the mesh
    #[arg(short, long, default_value = "4")]
    messages: usize,

    /// Milliseconds between injected messages
    #[arg(long, default_value = "250")]
    inject_interval: u64,

    /// Seconds between metrics snapshots
    #[arg(short = 't', long, default_value = "2")]
    metrics_interval: u64,

    /// RNG seed for the topology and all relay decisions
    #[arg(short, long, default_value = "42")]
    seed: u64,
}

/// Ring adjacency plus seeded random chords.
fn build_links(nodes: usize, chords: f64, rng: &mut StdRng) -> Vec<Vec<usize>> {
    let mut links = vec![Vec::new(); nodes];
    // A two-node ring is a single link, not two.
    let ring_edges = if nodes == 2 { 1 } else { nodes };
    for i in 0..ring_edges {
        let next = (i + 1) % nodes;
        links[i].push(next);
        links[next].push(i);
    }
    for i in 0..nodes {
        for j in (i + 2)..nodes {
            if i == 0 && j == nodes - 1 {
                continue; // already ring neighbors
            }
            if rng.gen::<f64>() < chords {
                links[i].push(j);
                links[j].push(i);
            }
        }
    }
    links
}

fn node_id(index: usize) -> NodeId {
    let mut bytes = [0u8; 16];
    bytes[15] = index as u8;
    NodeId::from_bytes(bytes)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    if args.nodes < 2 || args.nodes > 255 {
        bail!("node count must be between 2 and 255");
    }
    if args.messages == 0 {
        bail!("nothing to inject");
    }

    let mut rng = StdRng::seed_from_u64(args.seed);
    let links = build_links(args.nodes, args.chords, &mut rng);
    info!(
        nodes = args.nodes,
        links = links.iter().map(Vec::len).sum::<usize>() / 2,
        seed = args.seed,
        "building simulated mesh"
    );

    let mut inbound_txs = Vec::with_capacity(args.nodes);
    let mut inbound_rxs = Vec::with_capacity(args.nodes);
    for _ in 0..args.nodes {
        let (tx, rx) = mpsc::channel::<Vec<u8>>(1024);
        inbound_txs.push(tx);
        inbound_rxs.push(rx);
    }

    let delivered = Arc::new(AtomicU64::new(0));
    let mut engines = Vec::with_capacity(args.nodes);
    for (index, neighbors) in links.iter().enumerate() {
        let transport = Arc::new(SimTransport {
            id: node_id(index),
            lines: neighbors
                .iter()
                .map(|&n| inbound_txs[n].clone())
                .collect(),
        });
        let delivery = Arc::new(SimDelivery {
            node: index,
            delivered: Arc::clone(&delivered),
        });
        let config = FloodConfig {
            rng_seed: Some(args.seed.wrapping_add(index as u64)),
            ..FloodConfig::default()
        };
        engines.push(Arc::new(MeshEngine::new(transport, delivery, config)));
    }
    drop(inbound_txs);

    for (index, mut rx) in inbound_rxs.into_iter().enumerate() {
        let engine = Arc::clone(&engines[index]);
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                match decode_message(&frame) {
                    Ok(message) => engine.handle_inbound(message).await,
                    Err(e) => warn!(node = index, error = %e, "dropping malformed frame"),
                }
            }
        });
    }

    for i in 0..args.messages {
        let origin = rng.gen_range(0..args.nodes);
        let payload = format!("mesh flood message {i}").into_bytes();
        let fingerprint = engines[origin].send(payload).await?;
        info!(
            origin,
            fingerprint = %hex::encode(&fingerprint[..8]),
            "injected message"
        );
        time::sleep(Duration::from_millis(args.inject_interval)).await;
    }

    // Every injection should surface on every node except its origin.
    let expected = (args.messages * (args.nodes - 1)) as u64;
    let mut interval = time::interval(Duration::from_secs(args.metrics_interval));

    // Graceful shutdown on Ctrl+C or full coverage
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            _ = interval.tick() => {
                let mut received = 0u64;
                let mut duplicates = 0u64;
                let mut scheduled = 0u64;
                let mut executed = 0u64;
                let mut cancelled = 0u64;
                let mut relayed_received = 0u64;
                let mut hop_weighted = 0.0f64;
                for engine in &engines {
                    let s = engine.metrics_snapshot();
                    received += s.received;
                    duplicates += s.duplicates_blocked;
                    scheduled += s.relays_scheduled;
                    executed += s.relays_executed;
                    cancelled += s.relays_cancelled;
                    relayed_received += s.relayed_received;
                    hop_weighted += s.average_relay_hops * s.relayed_received as f64;
                }
                let avg_hops = if relayed_received > 0 {
                    hop_weighted / relayed_received as f64
                } else {
                    0.0
                };
                let covered = delivered.load(Ordering::Relaxed);
                info!(
                    delivered = covered,
                    expected,
                    received,
                    duplicates,
                    relays_scheduled = scheduled,
                    relays_executed = executed,
                    relays_cancelled = cancelled,
                    avg_hops = %format!("{avg_hops:.2}"),
                    "mesh snapshot"
                );
                if covered >= expected {
                    info!("flood reached every node, exiting");
                    break;
                }
            }
        }
    }

    for engine in &engines {
        engine.shutdown().await;
    }

    Ok(())
}
