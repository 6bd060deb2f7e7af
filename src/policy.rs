//! # Relay Decision Policy
//!
//! Pure decision logic for the flood-control core: given what a node can
//! observe locally at the instant a message arrives, should it re-broadcast
//! the message, with what remaining hop budget, and after what delay?
//!
//! The policy adapts to neighbor density. In sparse neighborhoods every
//! node must forward or the flood dies; in dense neighborhoods most
//! transmissions are redundant and forwarding probability drops.
//!
//! | Degree | Base probability |
//! |--------|------------------|
//! | 0-2    | 1.00             |
//! | 3-4    | 0.90             |
//! | 5-6    | 0.70             |
//! | 7-9    | 0.55             |
//! | >= 10  | 0.45             |
//!
//! [`decide`] is deliberately free of I/O, clocks and shared state; the
//! caller supplies the degree sample and the RNG. A seeded RNG makes every
//! decision reproducible, which the statistical tests below rely on.
//! After the ttl/self short-circuit the function performs exactly two
//! draws, in a fixed order: the relay draw, then the jitter draw.

use rand::Rng;
use std::time::Duration;

use crate::message::MessageClass;

/// Neighbor count at and above which a node is considered to sit in a
/// dense region of the mesh and clamps hop budgets harder.
pub const HIGH_DEGREE_THRESHOLD: usize = 6;

/// Hop-budget cap applied by nodes at or above [`HIGH_DEGREE_THRESHOLD`].
/// Messages crossing a dense region do not need many hops to saturate it.
pub const TTL_CAP_DENSE: u8 = 3;

/// Hop-budget cap applied by sparsely connected nodes.
pub const TTL_CAP_SPARSE: u8 = 5;

/// Lower edge of the re-broadcast jitter window, in milliseconds.
/// Jitter desynchronizes neighbors that all heard the same transmission,
/// so their relays do not collide on the shared medium.
pub const JITTER_MIN_MS: u64 = 20;

/// Upper edge (exclusive) of the re-broadcast jitter window.
pub const JITTER_MAX_MS: u64 = 80;

/// Probability multiplier applied to low-priority traffic.
pub const LOW_PRIORITY_FACTOR: f64 = 0.6;

/// Floor under the class-adjusted probability. No traffic class is ever
/// suppressed entirely; a floor of 0.3 keeps low-priority floods alive
/// even in the densest neighborhoods.
pub const MIN_CLASS_PROBABILITY: f64 = 0.3;

/// Outcome of a relay decision.
///
/// `new_ttl` and `delay` are computed even when `should_relay` is false,
/// so callers observe the same hop-budget clamping regardless of how the
/// probability draw went.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RelayDecision {
    pub should_relay: bool,
    /// Hop budget for the derived relay copy: the inbound ttl clamped to
    /// the density cap, minus the hop being taken.
    pub new_ttl: u8,
    /// How long to wait before re-broadcasting.
    pub delay: Duration,
}

impl RelayDecision {
    fn skip(ttl: u8) -> Self {
        Self {
            should_relay: false,
            new_ttl: ttl,
            delay: Duration::ZERO,
        }
    }
}

/// Base forwarding probability for a given neighbor count.
/// Monotonically non-increasing in `degree`.
pub fn base_relay_probability(degree: usize) -> f64 {
    match degree {
        0..=2 => 1.0,
        3..=4 => 0.9,
        5..=6 => 0.7,
        7..=9 => 0.55,
        _ => 0.45,
    }
}

/// Class-adjusted forwarding probability.
pub fn relay_probability(degree: usize, class: MessageClass) -> f64 {
    let base = base_relay_probability(degree);
    match class {
        MessageClass::Standard => base,
        MessageClass::LowPriority => (base * LOW_PRIORITY_FACTOR).max(MIN_CLASS_PROBABILITY),
    }
}

/// Hop-budget cap as a function of local density.
#[inline]
pub fn density_ttl_cap(degree: usize, high_degree_threshold: usize) -> u8 {
    if degree >= high_degree_threshold {
        TTL_CAP_DENSE
    } else {
        TTL_CAP_SPARSE
    }
}

/// Decide whether to relay a message.
///
/// A message with exhausted hop budget (`ttl <= 1`) or originated by this
/// node is never relayed and the function returns without touching the
/// RNG. Otherwise one uniform draw against the class-adjusted probability
/// decides the relay, and one more draw picks the jitter delay.
pub fn decide(
    ttl: u8,
    sender_is_self: bool,
    degree: usize,
    high_degree_threshold: usize,
    class: MessageClass,
    rng: &mut impl Rng,
) -> RelayDecision {
    if ttl <= 1 || sender_is_self {
        return RelayDecision::skip(ttl);
    }

    let probability = relay_probability(degree, class);
    let should_relay = rng.gen::<f64>() <= probability;

    let cap = density_ttl_cap(degree, high_degree_threshold);
    let new_ttl = ttl.clamp(1, cap) - 1;

    let delay = Duration::from_millis(rng.gen_range(JITTER_MIN_MS..JITTER_MAX_MS));

    RelayDecision {
        should_relay,
        new_ttl,
        delay,
    }
}
