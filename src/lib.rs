//! # MeshFlood - Flood Control for Multi-Hop Mesh Broadcast
//!
//! MeshFlood decides whether, when, and with what remaining hop budget a
//! node re-broadcasts messages flooding through a multi-hop wireless mesh
//! of intermittently connected peers:
//!
//! - **Deduplication**: content fingerprints stop duplicate delivery and
//!   relay loops without any routing state
//! - **Probabilistic relay**: denser neighborhoods relay with lower
//!   probability, so coverage stays high while storms stay out
//! - **Hop budgets**: TTL capping keeps a flood local to the region that
//!   needs it
//! - **Jittered scheduling**: randomized relay timing desynchronizes
//!   neighbors that all heard the same transmission
//!
//! ## Architecture
//!
//! The scheduler uses the **Actor Pattern** for safe concurrent state: a
//! cheap-to-clone handle communicates over async channels with a private
//! actor that owns all pending relays and processes commands sequentially.
//! The dedup cache is shared behind a read/write lock, metrics are plain
//! atomics, and the relay policy is a pure function over an injected RNG.
//!
//! The engine consumes its environment through traits: a transport that
//! broadcasts bytes to whoever is in range, and a delivery sink handed
//! each distinct message exactly once. No routing tables, no link state,
//! no identity beyond an opaque node id.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `engine` | High-level API combining all components |
//! | `message` | Message model, fingerprints, wire codec |
//! | `dedup` | Time-bounded duplicate-suppression cache |
//! | `policy` | Density-keyed relay probability, TTL caps, jitter |
//! | `scheduler` | Pending-relay actor with a single timer loop |
//! | `metrics` | Atomic counters and derived-ratio snapshots |
//! | `protocols` | Collaborator trait definitions (transport, delivery) |

mod dedup;
mod engine;
mod message;
mod metrics;
mod policy;
mod protocols;
mod scheduler;

pub use dedup::{CacheStatistics, DedupCache, MESSAGE_RETENTION, SWEEP_INTERVAL};
pub use engine::{FloodConfig, MeshEngine, SendRejection};
pub use message::{
    decode_message, encode_message, Fingerprint, MeshMessage, MessageClass, MessageId, NodeId,
    DEFAULT_TTL, MAX_PAYLOAD_SIZE,
};
pub use metrics::{MeshMetrics, MetricsSnapshot};
pub use policy::{decide, relay_probability, RelayDecision, HIGH_DEGREE_THRESHOLD};
pub use protocols::{MeshTransport, MessageDelivery, RelayExecutor};
pub use scheduler::{
    RelayPriority, RelayScheduler, SchedulerConfig, SchedulerStatistics, RELAY_CAPACITY,
    STALE_AFTER, STALE_SWEEP_INTERVAL,
};
