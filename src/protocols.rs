//! Collaborator trait definitions for the flood-control core.
//!
//! This module defines the seams between the engine and everything it does
//! not own: the physical link layer, the application above it, and the
//! scheduler's firing side.
//!
//! ## Collaborator Traits
//!
//! | Concern | Trait | Direction |
//! |---------|-------|-----------|
//! | Link layer | [`MeshTransport`] | consumed by the engine |
//! | Application | [`MessageDelivery`] | invoked by the engine |
//! | Relay firing | [`RelayExecutor`] | invoked by the scheduler |
//!
//! ## Design
//!
//! Traits are defined here separately from implementations to:
//! - Let the scheduler depend only on [`RelayExecutor`], not on the engine
//! - Let tests substitute in-memory links and recording sinks
//! - Avoid circular dependencies between modules

use anyhow::Result;
use async_trait::async_trait;

use crate::message::{MeshMessage, NodeId};

/// Physical link layer under the engine.
///
/// The engine never learns about individual neighbors; it only broadcasts
/// frames and samples how many neighbors are currently reachable.
#[async_trait]
pub trait MeshTransport: Send + Sync + 'static {
    /// Best-effort broadcast of an encoded frame to all reachable
    /// neighbors. No delivery or ordering guarantee.
    async fn broadcast(&self, frame: Vec<u8>) -> Result<()>;

    /// Current neighbor count, sampled at decision time. May change
    /// between calls.
    fn degree(&self) -> usize;

    /// Stable opaque identity of this node, used as the origin of locally
    /// created messages.
    fn local_id(&self) -> NodeId;
}

/// Application sink above the engine.
#[async_trait]
pub trait MessageDelivery: Send + Sync + 'static {
    /// Hand an accepted message to the application.
    ///
    /// Called exactly once per distinct fingerprint, no matter how many
    /// physical copies arrive and regardless of whether the node will
    /// relay the message.
    async fn deliver(&self, message: MeshMessage);
}

/// Firing-side collaborator of the relay scheduler.
///
/// Injected at scheduler construction so the scheduler stays free of any
/// engine or transport knowledge. The engine's implementation counts the
/// execution and re-broadcasts the derived copy.
#[async_trait]
pub trait RelayExecutor: Send + Sync + 'static {
    /// Transmit a relay copy whose timer has fired.
    async fn execute(&self, relay: MeshMessage);
}
