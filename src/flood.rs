//! Duplicate-suppressed flooding for the baseline protocol.
//!
//! A small ring of `(source, sequence)` pairs with a cache timeout filters
//! rebroadcast loops; the forwarding decision is role-driven: gateways
//! terminate the flood, relays rebroadcast while TTL remains, sensors only
//! originate.

use embassy_time::{Duration, Instant};

use crate::{NodeAddress, Role, DUPLICATE_CACHE_SIZE};

#[derive(Clone, Copy)]
struct DuplicateCacheEntry {
    source: NodeAddress,
    sequence: u32,
    recorded_at: Instant,
    valid: bool,
}

const EMPTY_ENTRY: DuplicateCacheEntry = DuplicateCacheEntry {
    source: 0,
    sequence: 0,
    recorded_at: Instant::from_ticks(0),
    valid: false,
};

/// What the dispatcher should do with a flooded application packet.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum FloodDecision {
    /// Already seen within the cache window.
    Duplicate,
    /// Gateway: deliver upward, terminate the flood.
    Deliver,
    /// Relay with TTL remaining: rebroadcast (after duty-cycle admission).
    Rebroadcast,
    /// Sensor, or relay with exhausted TTL: consume silently.
    Discard,
}

pub struct FloodForwarder {
    cache: [DuplicateCacheEntry; DUPLICATE_CACHE_SIZE],
    next_slot: usize,
    cache_timeout: Duration,
}

impl FloodForwarder {
    pub const fn new() -> Self {
        FloodForwarder {
            cache: [EMPTY_ENTRY; DUPLICATE_CACHE_SIZE],
            next_slot: 0,
            cache_timeout: Duration::from_secs(30),
        }
    }

    pub fn configure(&mut self, cache_timeout: Duration) {
        self.cache_timeout = cache_timeout;
    }

    /// Classifies a received flooded packet and records it in the cache.
    pub fn handle(&mut self, source: NodeAddress, sequence: u32, ttl: u8, role: Role, now: Instant) -> FloodDecision {
        if self.is_duplicate(source, sequence, now) {
            return FloodDecision::Duplicate;
        }
        self.insert(source, sequence, now);

        if role.contains(Role::GATEWAY) {
            FloodDecision::Deliver
        } else if role.contains(Role::RELAY) && ttl > 0 {
            FloodDecision::Rebroadcast
        } else {
            FloodDecision::Discard
        }
    }

    /// Records a locally originated packet so flooded copies of it are
    /// recognized as duplicates when they echo back.
    pub fn note_sent(&mut self, source: NodeAddress, sequence: u32, now: Instant) {
        self.insert(source, sequence, now);
    }

    fn is_duplicate(&self, source: NodeAddress, sequence: u32, now: Instant) -> bool {
        self.cache.iter().any(|entry| {
            entry.valid
                && entry.source == source
                && entry.sequence == sequence
                && now.saturating_duration_since(entry.recorded_at) < self.cache_timeout
        })
    }

    fn insert(&mut self, source: NodeAddress, sequence: u32, now: Instant) {
        self.cache[self.next_slot] = DuplicateCacheEntry {
            source,
            sequence,
            recorded_at: now,
            valid: true,
        };
        self.next_slot = (self.next_slot + 1) % DUPLICATE_CACHE_SIZE;
    }
}
