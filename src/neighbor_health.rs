//! Proactive neighbor fault detection from advertisement silence.
//!
//! A neighbor that has not been heard for one safety-HELLO interval gets a
//! warning; after two intervals it is flagged as failed and the caller
//! evicts its route and resets the Trickle timer. Recovery on a later
//! heartbeat clears the flag.

use embassy_time::{Duration, Instant};
use log::log;

use crate::{NodeAddress, NEIGHBOR_TABLE_SIZE};

#[derive(Clone, Copy)]
pub struct NeighborHealth {
    pub neighbor: NodeAddress,
    pub last_heard: Instant,
    pub missed_safety_hellos: u8,
    pub failure_flagged: bool,
}

pub struct NeighborHealthMonitor {
    neighbors: [Option<NeighborHealth>; NEIGHBOR_TABLE_SIZE],
    warn_after: Duration,
    fail_after: Duration,
}

impl NeighborHealthMonitor {
    pub const fn new() -> Self {
        NeighborHealthMonitor {
            neighbors: [const { None }; NEIGHBOR_TABLE_SIZE],
            warn_after: Duration::from_secs(180),
            fail_after: Duration::from_secs(360),
        }
    }

    pub fn configure(&mut self, warn_after: Duration, fail_after: Duration) {
        self.warn_after = warn_after;
        self.fail_after = fail_after;
    }

    /// Records an advertisement from a neighbor, creating its entry on
    /// first contact. Returns true when the neighbor recovers from a
    /// flagged failure.
    pub fn on_heard(&mut self, neighbor: NodeAddress, now: Instant) -> bool {
        let mut free_slot = None;
        let mut oldest_slot = 0;
        let mut oldest_heard = Instant::MAX;

        for (i, slot) in self.neighbors.iter_mut().enumerate() {
            match slot {
                Some(health) if health.neighbor == neighbor => {
                    let recovered = health.failure_flagged;
                    health.last_heard = now;
                    health.missed_safety_hellos = 0;
                    health.failure_flagged = false;
                    if recovered {
                        log!(log::Level::Info, "Neighbor {:04X} recovered", neighbor);
                    }
                    return recovered;
                }
                Some(health) => {
                    if health.last_heard < oldest_heard {
                        oldest_heard = health.last_heard;
                        oldest_slot = i;
                    }
                }
                None => {
                    if free_slot.is_none() {
                        free_slot = Some(i);
                    }
                }
            }
        }

        let slot = free_slot.unwrap_or(oldest_slot);
        self.neighbors[slot] = Some(NeighborHealth {
            neighbor,
            last_heard: now,
            missed_safety_hellos: 0,
            failure_flagged: false,
        });
        false
    }

    /// Periodic silence check; call at least every 30 s. Newly failed
    /// neighbors are written to `out` and the count returned; the caller
    /// performs recovery (route eviction, Trickle reset). Each failure
    /// fires at most once until the neighbor is heard again.
    pub fn check(&mut self, now: Instant, out: &mut [NodeAddress; NEIGHBOR_TABLE_SIZE]) -> usize {
        let mut failed = 0;
        for health in self.neighbors.iter_mut().flatten() {
            let silence = now.saturating_duration_since(health.last_heard);

            if silence >= self.fail_after {
                if !health.failure_flagged {
                    health.missed_safety_hellos = 2;
                    health.failure_flagged = true;
                    log!(
                        log::Level::Warn,
                        "Neighbor {:04X} failed: silent for {}s, evicting route",
                        health.neighbor,
                        silence.as_secs()
                    );
                    out[failed] = health.neighbor;
                    failed += 1;
                }
            } else if silence > self.warn_after && health.missed_safety_hellos == 0 {
                health.missed_safety_hellos = 1;
                log!(
                    log::Level::Warn,
                    "Neighbor {:04X} silent for {}s (missed safety HELLO)",
                    health.neighbor,
                    silence.as_secs()
                );
            }
        }
        failed
    }

    pub fn get(&self, neighbor: NodeAddress) -> Option<&NeighborHealth> {
        self.neighbors.iter().flatten().find(|h| h.neighbor == neighbor)
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;

    const N1: NodeAddress = 0x0042;

    fn now() -> Instant {
        Instant::from_ticks(0)
    }

    #[test]
    fn test_silence_progression_warn_then_fail() {
        let mut monitor = NeighborHealthMonitor::new();
        monitor.on_heard(N1, now());
        let mut out = [0u16; NEIGHBOR_TABLE_SIZE];

        // Inside the warning window: nothing happens.
        assert_eq!(monitor.check(now() + Duration::from_secs(170), &mut out), 0);
        assert_eq!(monitor.get(N1).unwrap().missed_safety_hellos, 0);

        // Past one safety interval: warning only.
        assert_eq!(monitor.check(now() + Duration::from_secs(200), &mut out), 0);
        assert_eq!(monitor.get(N1).unwrap().missed_safety_hellos, 1);
        assert!(!monitor.get(N1).unwrap().failure_flagged);

        // Past two safety intervals: failure reported once.
        assert_eq!(monitor.check(now() + Duration::from_secs(360), &mut out), 1);
        assert_eq!(out[0], N1);
        assert!(monitor.get(N1).unwrap().failure_flagged);

        // A second sweep does not re-report the same failure.
        assert_eq!(monitor.check(now() + Duration::from_secs(400), &mut out), 0);
    }

    #[test]
    fn test_heartbeat_clears_flag_and_reports_recovery() {
        let mut monitor = NeighborHealthMonitor::new();
        monitor.on_heard(N1, now());
        let mut out = [0u16; NEIGHBOR_TABLE_SIZE];

        monitor.check(now() + Duration::from_secs(360), &mut out);
        assert!(monitor.get(N1).unwrap().failure_flagged);

        let recovered = monitor.on_heard(N1, now() + Duration::from_secs(420));
        assert!(recovered);
        let health = monitor.get(N1).unwrap();
        assert!(!health.failure_flagged);
        assert_eq!(health.missed_safety_hellos, 0);

        // Healthy again: no failure on the next sweep.
        assert_eq!(monitor.check(now() + Duration::from_secs(450), &mut out), 0);
    }

    #[test]
    fn test_regular_heartbeats_keep_neighbor_healthy() {
        let mut monitor = NeighborHealthMonitor::new();
        let mut out = [0u16; NEIGHBOR_TABLE_SIZE];
        for i in 0..10u64 {
            monitor.on_heard(N1, now() + Duration::from_secs(i * 120));
            assert_eq!(monitor.check(now() + Duration::from_secs(i * 120 + 60), &mut out), 0);
        }
        assert_eq!(monitor.get(N1).unwrap().missed_safety_hellos, 0);
    }

    #[test]
    fn test_table_overflow_replaces_oldest() {
        let mut monitor = NeighborHealthMonitor::new();
        for i in 0..NEIGHBOR_TABLE_SIZE as u16 {
            monitor.on_heard(0x0100 + i, now() + Duration::from_secs(i as u64));
        }
        monitor.on_heard(0x0999, now() + Duration::from_secs(100));
        assert!(monitor.get(0x0100).is_none());
        assert!(monitor.get(0x0999).is_some());
    }

    #[test]
    fn test_multiple_failures_reported_together() {
        let mut monitor = NeighborHealthMonitor::new();
        monitor.on_heard(0x0001, now());
        monitor.on_heard(0x0002, now());
        monitor.on_heard(0x0003, now() + Duration::from_secs(300));
        let mut out = [0u16; NEIGHBOR_TABLE_SIZE];

        let failed = monitor.check(now() + Duration::from_secs(400), &mut out);
        assert_eq!(failed, 2);
    }
}
