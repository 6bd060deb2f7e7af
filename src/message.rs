//! # Mesh Message Model and Wire Codec
//!
//! This module defines the message unit that floods through the mesh:
//!
//! - [`NodeId`]: 16-byte opaque identifier for a local peer
//! - [`MessageId`]: 16-byte random token minted once at original creation
//! - [`Fingerprint`]: 32-byte stable identity used for deduplication
//! - [`MeshMessage`]: the flood-controlled unit itself
//!
//! ## Message Lifecycle
//!
//! Messages are immutable once created. A node that decides to forward a
//! message never mutates the copy it received; it derives a new value via
//! [`MeshMessage::derive_relay`] with a reduced hop budget, an incremented
//! relay count, and itself recorded as the last relay.
//!
//! ## Fingerprints
//!
//! The fingerprint is computed as `BLAKE3(domain || origin || id)` over the
//! fields that never change across relays. Hop-mutable fields (`ttl`,
//! `relay_count`, `is_relayed`, `last_relay`) are deliberately excluded, so
//! every copy of a message seen anywhere in the mesh maps to the same
//! 32-byte key. The fingerprint is the sole input to duplicate suppression
//! and loop prevention.
//!
//! ## Security Limits
//!
//! - `MAX_PAYLOAD_SIZE`: Maximum application payload (64 KiB)
//! - `MAX_WIRE_SIZE`: Maximum deserialization buffer (prevents OOM)
//! - All decoding uses [`decode_message`] with size limits enforced
//!
//! ## Invariants
//!
//! - M1: `fingerprint()` is identical for a message and every relay derived
//!   from it, at any depth
//! - M2: `relay_count` never decreases across derivations (saturating)
//! - M3: encode/decode round-trips preserve every field exactly

use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Domain separation prefix for fingerprint hashing.
/// Prevents cross-protocol hash reuse.
const FINGERPRINT_DOMAIN: &[u8] = b"meshflood-fp-v1:";

/// Default hop budget for newly created messages.
/// The relay policy clamps this further under high neighbor density.
pub const DEFAULT_TTL: u8 = 5;

/// Maximum size of an application payload (64 KiB).
/// Larger content should be chunked by the application.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024;

/// Maximum buffer size for deserialization.
/// Set slightly larger than MAX_PAYLOAD_SIZE to allow for framing overhead.
pub const MAX_WIRE_SIZE: u64 = (MAX_PAYLOAD_SIZE as u64) + 512;

/// Stable 32-byte message identity, shared by all relayed copies.
pub type Fingerprint = [u8; 32];

/// Returns current time as milliseconds since Unix epoch.
/// Used for message creation timestamps.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

// ============================================================================
// Identifiers
// ============================================================================

/// Opaque identifier for a node on the mesh.
///
/// Carries no cryptographic meaning; it only has to be unique enough to
/// distinguish neighbors for loop detection and relay attribution.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId([u8; 16]);

impl NodeId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Generate a fresh random node identifier.
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 16 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 16];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", &self.to_hex()[..8])
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; 16]> for NodeId {
    fn from(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }
}

impl From<NodeId> for [u8; 16] {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for NodeId {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Unique token minted exactly once, when a message is originally created.
/// Relayed copies carry the same id; together with the origin it anchors
/// the fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MessageId([u8; 16]);

impl MessageId {
    #[inline]
    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// Mint a fresh random message id.
    pub fn random() -> Self {
        Self(rand::random())
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MessageId({})", &self.to_hex()[..8])
    }
}

// ============================================================================
// Message
// ============================================================================

/// Delivery class of a message.
///
/// Low-priority traffic is throttled harder by the relay policy under
/// dense topologies and fires with a wider jitter window.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageClass {
    #[default]
    Standard,
    LowPriority,
}

/// A flood-controlled mesh message.
///
/// `id`, `origin`, `payload`, `created_at_ms` and `class` are fixed at
/// original creation and survive every relay hop unchanged. `ttl`,
/// `relay_count`, `is_relayed` and `last_relay` describe the copy's journey
/// and are rewritten by [`derive_relay`](Self::derive_relay).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshMessage {
    pub id: MessageId,
    pub origin: NodeId,
    pub payload: Vec<u8>,
    /// Milliseconds since Unix epoch at original creation.
    pub created_at_ms: u64,
    /// Remaining hop budget. A message with `ttl <= 1` is never forwarded.
    pub ttl: u8,
    /// Number of relay hops this copy has taken since the origin.
    pub relay_count: u8,
    /// True once the copy has been forwarded at least once.
    pub is_relayed: bool,
    /// The node that most recently forwarded this copy, if any.
    pub last_relay: Option<NodeId>,
    pub class: MessageClass,
}

impl MeshMessage {
    /// Create an original message with the default hop budget and class.
    pub fn original(origin: NodeId, payload: Vec<u8>) -> Self {
        Self::original_with(origin, payload, DEFAULT_TTL, MessageClass::Standard)
    }

    /// Create an original message with an explicit hop budget and class.
    pub fn original_with(origin: NodeId, payload: Vec<u8>, ttl: u8, class: MessageClass) -> Self {
        Self {
            id: MessageId::random(),
            origin,
            payload,
            created_at_ms: now_ms(),
            ttl,
            relay_count: 0,
            is_relayed: false,
            last_relay: None,
            class,
        }
    }

    /// Derive the forwarded copy of this message.
    ///
    /// The identity-bearing fields are preserved, so the derived copy maps
    /// to the same fingerprint (M1). The hop-state fields are rewritten:
    /// `ttl` becomes `new_ttl` (already reduced by the relay policy),
    /// `relay_count` grows by one (saturating, M2), and `relayed_by` is
    /// recorded as the last relay.
    ///
    /// Callers must have checked [`can_relay`](Self::can_relay) first.
    pub fn derive_relay(&self, new_ttl: u8, relayed_by: NodeId) -> Self {
        debug_assert!(
            self.can_relay(),
            "derive_relay called on a message with exhausted hop budget"
        );
        Self {
            id: self.id,
            origin: self.origin,
            payload: self.payload.clone(),
            created_at_ms: self.created_at_ms,
            ttl: new_ttl,
            relay_count: self.relay_count.saturating_add(1),
            is_relayed: true,
            last_relay: Some(relayed_by),
            class: self.class,
        }
    }

    /// Whether this copy still has hop budget to be forwarded.
    /// A relay at `ttl == 1` would arrive dead, so it is not attempted.
    #[inline]
    pub fn can_relay(&self) -> bool {
        self.ttl > 1
    }

    /// Compute the stable fingerprint of this message.
    ///
    /// `BLAKE3(FINGERPRINT_DOMAIN || origin || id)`: identical for every
    /// copy of the message anywhere in the mesh, regardless of hop state.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = blake3::Hasher::new();
        hasher.update(FINGERPRINT_DOMAIN);
        hasher.update(self.origin.as_bytes());
        hasher.update(self.id.as_bytes());
        *hasher.finalize().as_bytes()
    }
}

// ============================================================================
// Wire codec
// ============================================================================

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_WIRE_SIZE)
        .with_fixint_encoding()
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Encode a message into its wire frame.
pub fn encode_message(message: &MeshMessage) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(message)
}

/// Decode a wire frame into a message, with size bounds enforced.
///
/// The engine itself never decodes; this is the helper for the transport
/// side of the boundary, which turns link bytes into typed messages before
/// handing them in. Frames that are truncated, oversized or garbage are
/// rejected here and must not reach the engine.
pub fn decode_message(bytes: &[u8]) -> Result<MeshMessage, bincode::Error> {
    let message: MeshMessage = deserialize_bounded(bytes)?;
    if message.payload.len() > MAX_PAYLOAD_SIZE {
        return Err(bincode::Error::new(bincode::ErrorKind::SizeLimit));
    }
    Ok(message)
}
