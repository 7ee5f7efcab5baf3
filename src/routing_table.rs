//! # Routing Table
//!
//! Fixed-capacity per-destination route store. Each destination holds at
//! most one entry naming the next hop, the hop metric, the destination's
//! advertised role and gateway-load hint, and an expiry deadline refreshed
//! by every advertisement for the same path.
//!
//! Best-route selection under the cost function follows a two-phase
//! pattern: candidates are copied out while the table guard is held, and
//! the cost function is evaluated over the copies only after the guard is
//! released (the cost function reads gateway loads from this same table).
//! `candidates_for_role` and `gateway_load_snapshot` are the copy phase;
//! the dispatcher performs the evaluation phase.

use embassy_time::{Duration, Instant};
use log::log;

use crate::cost::RouteCandidate;
use crate::{NodeAddress, Role, GATEWAY_LOAD_UNKNOWN, MAX_GATEWAYS, ROUTING_TABLE_SIZE};

/// Best known route towards one destination.
#[derive(Clone, Copy)]
pub struct RouteEntry {
    pub dest: NodeAddress,
    /// Next hop; equals `dest` for direct neighbors.
    pub via: NodeAddress,
    /// Hop count from this node.
    pub metric: u8,
    pub role: Role,
    /// Advertised packets/minute, saturated to 254. 255 means unknown.
    pub gateway_load: u8,
    /// SNR of the advertisement that last installed or refreshed this
    /// entry; only meaningful for direct neighbors.
    pub received_snr: i8,
    pub expires_at: Instant,
}

pub struct RoutingTable {
    entries: [Option<RouteEntry>; ROUTING_TABLE_SIZE],
    route_timeout: Duration,
}

impl RoutingTable {
    pub const fn new() -> Self {
        RoutingTable {
            entries: [const { None }; ROUTING_TABLE_SIZE],
            route_timeout: Duration::from_secs(600),
        }
    }

    pub fn configure(&mut self, route_timeout: Duration) {
        self.route_timeout = route_timeout;
    }

    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.is_none())
    }

    pub fn is_full(&self) -> bool {
        self.entries.iter().all(|e| e.is_some())
    }

    pub fn find(&self, dest: NodeAddress) -> Option<&RouteEntry> {
        self.entries.iter().flatten().find(|e| e.dest == dest)
    }

    pub(crate) fn find_mut(&mut self, dest: NodeAddress) -> Option<&mut RouteEntry> {
        self.entries.iter_mut().flatten().find(|e| e.dest == dest)
    }

    pub fn next_hop(&self, dest: NodeAddress) -> Option<NodeAddress> {
        self.find(dest).map(|e| e.via)
    }

    /// Installs a new entry, stamping its expiry. Fails when the table is
    /// full or the destination is already present.
    pub(crate) fn insert(&mut self, mut entry: RouteEntry, now: Instant) -> Result<(), RouteTableFull> {
        if self.find(entry.dest).is_some() {
            // One entry per destination; updates go through find_mut.
            return Ok(());
        }
        entry.expires_at = now + self.route_timeout;
        for slot in self.entries.iter_mut() {
            if slot.is_none() {
                log!(
                    log::Level::Info,
                    "New route added: {:04X} via {:04X} metric {} role {}",
                    entry.dest,
                    entry.via,
                    entry.metric,
                    entry.role.bits()
                );
                *slot = Some(entry);
                return Ok(());
            }
        }
        log!(
            log::Level::Warn,
            "Routing table full, dropping route to {:04X}",
            entry.dest
        );
        Err(RouteTableFull)
    }

    pub(crate) fn remove(&mut self, dest: NodeAddress) -> bool {
        for slot in self.entries.iter_mut() {
            if slot.map_or(false, |e| e.dest == dest) {
                *slot = None;
                return true;
            }
        }
        false
    }

    /// Refreshes the expiry of the entry for this address only.
    pub fn mark_heard(&mut self, address: NodeAddress, now: Instant) {
        let timeout = self.route_timeout;
        if let Some(entry) = self.find_mut(address) {
            entry.expires_at = now + timeout;
        }
    }

    pub(crate) fn refresh(&mut self, dest: NodeAddress, now: Instant) {
        self.mark_heard(dest, now);
    }

    /// Deletes every entry whose expiry has passed. Returns the number of
    /// routes removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        for slot in self.entries.iter_mut() {
            if let Some(entry) = slot {
                if entry.expires_at < now {
                    log!(
                        log::Level::Warn,
                        "Route timeout: {:04X} via {:04X}",
                        entry.dest,
                        entry.via
                    );
                    *slot = None;
                    removed += 1;
                }
            }
        }
        removed
    }

    /// Largest hop metric currently in the table (0 when empty).
    pub fn max_metric(&self) -> u8 {
        self.entries.iter().flatten().map(|e| e.metric).max().unwrap_or(0)
    }

    /// Minimum-hop entry whose role includes the given bits, ties broken
    /// towards the lower address.
    pub fn best_for_role_by_hops(&self, role: Role) -> Option<RouteEntry> {
        let mut best: Option<RouteEntry> = None;
        for entry in self.entries.iter().flatten() {
            if !entry.role.contains(role) {
                continue;
            }
            match best {
                None => best = Some(*entry),
                Some(current)
                    if entry.metric < current.metric
                        || (entry.metric == current.metric && entry.dest < current.dest) =>
                {
                    best = Some(*entry)
                }
                _ => {}
            }
        }
        best
    }

    /// Copy phase of the two-phase best-route lookup: fills `out` with all
    /// entries whose role includes the given bits.
    pub fn candidates_for_role(&self, role: Role, out: &mut [RouteCandidate; ROUTING_TABLE_SIZE]) -> usize {
        let mut count = 0;
        for entry in self.entries.iter().flatten() {
            if entry.role.contains(role) {
                out[count] = RouteCandidate {
                    dest: entry.dest,
                    via: entry.via,
                    metric: entry.metric,
                    role: entry.role,
                    gateway_load: entry.gateway_load,
                };
                count += 1;
            }
        }
        count
    }

    /// Copies `(address, load)` for every gateway with known load data.
    pub fn gateway_load_snapshot(&self, out: &mut [(NodeAddress, u8); MAX_GATEWAYS]) -> usize {
        let mut count = 0;
        for entry in self.entries.iter().flatten() {
            if entry.role.contains(Role::GATEWAY) && entry.gateway_load != GATEWAY_LOAD_UNKNOWN {
                if count < MAX_GATEWAYS {
                    out[count] = (entry.dest, entry.gateway_load);
                    count += 1;
                }
            }
        }
        count
    }

    /// Copies every entry, for advertisement packing and diagnostics.
    pub fn snapshot_all(&self, out: &mut [RouteEntry; ROUTING_TABLE_SIZE]) -> usize {
        let mut count = 0;
        for entry in self.entries.iter().flatten() {
            out[count] = *entry;
            count += 1;
        }
        count
    }

    pub fn iter(&self) -> impl Iterator<Item = &RouteEntry> {
        self.entries.iter().flatten()
    }
}

/// Install attempt against a full table.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct RouteTableFull;
