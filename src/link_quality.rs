//! # Link-Quality Tracker
//!
//! Per-neighbor signal and reliability metrics feeding the routing cost
//! function.
//!
//! Two observation paths update a neighbor's metrics:
//!
//! 1. **Data packets** update the RSSI/SNR moving averages and infer
//!    delivery successes and failures from gaps in the sender's sequence
//!    numbers. A gap of `n` sequence numbers records `n-1` failures
//!    (bounded by the window size) followed by one success.
//! 2. **Routing advertisements** update RSSI/SNR and record one success.
//!    Advertisements carry no data sequence, so no gap inference runs.
//!
//! Delivery results feed a sliding window of `ETX_WINDOW_SIZE` slots. The
//! instantaneous ETX is the reciprocal of the window's delivery ratio and
//! is EWMA-smoothed once the window holds at least three samples. ETX is
//! clamped to `[1.0, 10.0]`.

use embassy_time::Instant;
use log::log;

use crate::{NodeAddress, ETX_DEFAULT, ETX_MAX, ETX_MIN, ETX_WINDOW_SIZE, MAX_TRACKED_LINKS};

/// Tracked metrics for one neighbor.
pub struct LinkMetrics {
    pub neighbor: NodeAddress,
    pub rssi_dbm: i16,
    pub snr_db: i8,
    pub etx: f32,
    window: [bool; ETX_WINDOW_SIZE],
    window_index: u8,
    window_fill: u8,
    last_seq: u32,
    seq_initialized: bool,
    signal_seeded: bool,
    pub last_update: Instant,
    pub tx_attempts: u32,
    pub tx_success: u32,
    pub tx_failures: u32,
}

/// Read-only copy of the metrics the cost function needs.
///
/// Defaults describe an unknown link: floor signal values and the default
/// ETX, matching a freshly created entry.
#[derive(Clone, Copy)]
pub struct LinkSnapshot {
    pub rssi_dbm: i16,
    pub snr_db: i8,
    pub etx: f32,
}

impl LinkSnapshot {
    pub const fn unknown() -> Self {
        LinkSnapshot {
            rssi_dbm: -120,
            snr_db: -20,
            etx: ETX_DEFAULT,
        }
    }
}

impl LinkMetrics {
    fn new(neighbor: NodeAddress, now: Instant) -> Self {
        LinkMetrics {
            neighbor,
            rssi_dbm: -120,
            snr_db: -20,
            etx: ETX_DEFAULT,
            window: [false; ETX_WINDOW_SIZE],
            window_index: 0,
            window_fill: 0,
            last_seq: 0,
            seq_initialized: false,
            signal_seeded: false,
            last_update: now,
            tx_attempts: 0,
            tx_success: 0,
            tx_failures: 0,
        }
    }

    fn push_result(&mut self, success: bool, alpha: f32) {
        self.window[self.window_index as usize] = success;
        self.window_index = (self.window_index + 1) % ETX_WINDOW_SIZE as u8;
        if (self.window_fill as usize) < ETX_WINDOW_SIZE {
            self.window_fill += 1;
        }

        self.tx_attempts += 1;
        if success {
            self.tx_success += 1;
        } else {
            self.tx_failures += 1;
        }

        let successes = self.window[..self.window_fill as usize].iter().filter(|&&s| s).count();
        let ratio = successes as f32 / self.window_fill as f32;
        let instant_etx = 1.0 / if ratio > 0.01 { ratio } else { 0.01 };

        if self.window_fill >= 3 {
            self.etx = alpha * instant_etx + (1.0 - alpha) * self.etx;
        } else {
            self.etx = instant_etx;
        }
        self.etx = self.etx.clamp(ETX_MIN, ETX_MAX);
    }

    fn update_signal(&mut self, rssi_dbm: i16, snr_db: i8, alpha: f32) {
        if !self.signal_seeded {
            self.signal_seeded = true;
            self.rssi_dbm = rssi_dbm;
            self.snr_db = snr_db;
        } else {
            self.rssi_dbm = ((1.0 - alpha) * self.rssi_dbm as f32 + alpha * rssi_dbm as f32) as i16;
            self.snr_db = ((1.0 - alpha) * self.snr_db as f32 + alpha * snr_db as f32) as i8;
        }
    }
}

/// Bounded table of per-neighbor link metrics with LRU eviction.
///
/// Written only by the receive handler; the transmit path reads snapshots.
pub struct LinkQualityTracker {
    links: [Option<LinkMetrics>; MAX_TRACKED_LINKS],
    alpha: f32,
}

impl LinkQualityTracker {
    pub const fn new() -> Self {
        LinkQualityTracker {
            links: [const { None }; MAX_TRACKED_LINKS],
            alpha: 0.3,
        }
    }

    pub fn configure(&mut self, alpha: f32) {
        self.alpha = alpha;
    }

    /// Records a data packet heard directly from a neighbor.
    ///
    /// `sequence` is the sender's data sequence number; pass `None` when the
    /// packet was forwarded and the envelope sequence does not belong to the
    /// transmitting neighbor.
    pub fn observe_data(&mut self, neighbor: NodeAddress, rssi_dbm: i16, snr_db: i8, sequence: Option<u32>, now: Instant) {
        let alpha = self.alpha;
        let Some(link) = self.entry(neighbor, now) else {
            return;
        };

        link.update_signal(rssi_dbm, snr_db, alpha);
        link.last_update = now;

        let Some(seq) = sequence else {
            return;
        };

        if !link.seq_initialized {
            link.seq_initialized = true;
            link.last_seq = seq;
            link.push_result(true, alpha);
            return;
        }

        let expected = link.last_seq.wrapping_add(1);
        if seq == expected {
            link.push_result(true, alpha);
            link.last_seq = seq;
        } else if seq > expected {
            // Every skipped sequence number is a lost packet, bounded by the
            // window size so a sender restart cannot zero out the link.
            let missed = (seq - expected).min(ETX_WINDOW_SIZE as u32);
            for _ in 0..missed {
                link.push_result(false, alpha);
            }
            link.push_result(true, alpha);
            link.last_seq = seq;
            log!(
                log::Level::Debug,
                "Link {:04X}: inferred {} lost packets from sequence gap, ETX={}",
                neighbor,
                missed,
                link.etx
            );
        } else {
            // Reordered or restarted sender: count the delivery, resync.
            link.push_result(true, alpha);
            link.last_seq = seq;
        }
    }

    /// Records a routing advertisement heard from a neighbor.
    ///
    /// When the radio exposes no RSSI for the frame, pass `None` and an
    /// estimate of `-120 + 3*snr` dBm is used.
    pub fn observe_advert(&mut self, neighbor: NodeAddress, rssi_dbm: Option<i16>, snr_db: i8, now: Instant) {
        let alpha = self.alpha;
        let Some(link) = self.entry(neighbor, now) else {
            return;
        };

        let rssi = rssi_dbm.unwrap_or(-120 + 3 * snr_db as i16);
        link.update_signal(rssi, snr_db, alpha);
        link.last_update = now;
        link.push_result(true, alpha);
    }

    /// Copies the metrics for a neighbor, or the unknown-link defaults.
    pub fn snapshot(&self, neighbor: NodeAddress) -> LinkSnapshot {
        for link in self.links.iter().flatten() {
            if link.neighbor == neighbor {
                return LinkSnapshot {
                    rssi_dbm: link.rssi_dbm,
                    snr_db: link.snr_db,
                    etx: link.etx,
                };
            }
        }
        LinkSnapshot::unknown()
    }

    pub fn get(&self, neighbor: NodeAddress) -> Option<&LinkMetrics> {
        self.links.iter().flatten().find(|link| link.neighbor == neighbor)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LinkMetrics> {
        self.links.iter().flatten()
    }

    /// Finds or creates the entry for a neighbor, evicting the
    /// least-recently-updated entry when the table is full.
    fn entry(&mut self, neighbor: NodeAddress, now: Instant) -> Option<&mut LinkMetrics> {
        let mut free_slot = None;
        let mut found = None;
        let mut oldest_slot = 0;
        let mut oldest_update = Instant::MAX;

        for (i, slot) in self.links.iter().enumerate() {
            match slot {
                Some(link) if link.neighbor == neighbor => {
                    found = Some(i);
                    break;
                }
                Some(link) => {
                    if link.last_update < oldest_update {
                        oldest_update = link.last_update;
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

        let index = match (found, free_slot) {
            (Some(i), _) => i,
            (None, Some(i)) => {
                self.links[i] = Some(LinkMetrics::new(neighbor, now));
                i
            }
            (None, None) => {
                log!(
                    log::Level::Debug,
                    "Link table full, evicting {:04X} for {:04X}",
                    self.links[oldest_slot].as_ref().map(|l| l.neighbor).unwrap_or(0),
                    neighbor
                );
                self.links[oldest_slot] = Some(LinkMetrics::new(neighbor, now));
                oldest_slot
            }
        };

        self.links[index].as_mut()
    }
}

#[cfg(all(test, feature = "std"))]
mod tests {
    use super::*;
    use embassy_time::Duration;

    const N1: NodeAddress = 0x0101;

    fn now() -> Instant {
        Instant::from_ticks(0)
    }

    #[test]
    fn test_first_observation_seeds_signal_values() {
        let mut tracker = LinkQualityTracker::new();
        tracker.observe_data(N1, -90, 5, Some(0), now());

        let link = tracker.get(N1).unwrap();
        assert_eq!(link.rssi_dbm, -90);
        assert_eq!(link.snr_db, 5);
    }

    #[test]
    fn test_signal_ewma_converges_toward_new_values() {
        let mut tracker = LinkQualityTracker::new();
        tracker.observe_data(N1, -100, 0, Some(0), now());
        tracker.observe_data(N1, -60, 8, Some(1), now());

        let link = tracker.get(N1).unwrap();
        // 0.7 * -100 + 0.3 * -60 = -88
        assert_eq!(link.rssi_dbm, -88);
        // 0.7 * 0 + 0.3 * 8 = 2.4
        assert_eq!(link.snr_db, 2);
    }

    #[test]
    fn test_consecutive_sequences_keep_etx_at_floor() {
        let mut tracker = LinkQualityTracker::new();
        for seq in 0..10u32 {
            tracker.observe_data(N1, -90, 5, Some(seq), now());
        }
        let link = tracker.get(N1).unwrap();
        assert_eq!(link.etx, 1.0);
        assert_eq!(link.tx_success, 10);
        assert_eq!(link.tx_failures, 0);
    }

    #[test]
    fn test_sequence_gaps_infer_failures() {
        let mut tracker = LinkQualityTracker::new();
        // Sequences 0,1,2,4,5,6,7,9,10,11: gaps at 2->4 and 7->9.
        for seq in [0u32, 1, 2, 4, 5, 6, 7, 9, 10, 11] {
            tracker.observe_data(N1, -90, 5, Some(seq), now());
        }
        let link = tracker.get(N1).unwrap();
        assert_eq!(link.tx_success, 10);
        assert_eq!(link.tx_failures, 2);
        // Window of 10 holds the last results: ratio 8/10 after overflow,
        // smoothed ETX converges near 10/12 overall delivery, stays well
        // inside the clamp bounds.
        assert!(link.etx > 1.0 && link.etx < 1.6, "etx={}", link.etx);
    }

    #[test]
    fn test_reordered_sequence_counts_success_and_resyncs() {
        let mut tracker = LinkQualityTracker::new();
        tracker.observe_data(N1, -90, 5, Some(10), now());
        tracker.observe_data(N1, -90, 5, Some(3), now());

        let link = tracker.get(N1).unwrap();
        assert_eq!(link.tx_failures, 0);
        assert_eq!(link.tx_success, 2);
        assert_eq!(link.last_seq, 3);
    }

    #[test]
    fn test_huge_gap_is_bounded_by_window() {
        let mut tracker = LinkQualityTracker::new();
        tracker.observe_data(N1, -90, 5, Some(0), now());
        tracker.observe_data(N1, -90, 5, Some(1_000_000), now());

        let link = tracker.get(N1).unwrap();
        assert_eq!(link.tx_failures, ETX_WINDOW_SIZE as u32);
        assert!(link.etx >= ETX_MIN && link.etx <= ETX_MAX);
    }

    #[test]
    fn test_etx_stays_clamped_under_total_loss() {
        let mut tracker = LinkQualityTracker::new();
        tracker.observe_data(N1, -90, 5, Some(0), now());
        for i in 0..5u32 {
            // Every second packet lost.
            tracker.observe_data(N1, -90, 5, Some(2 + i * 2), now());
        }
        let link = tracker.get(N1).unwrap();
        assert!(link.etx >= ETX_MIN && link.etx <= ETX_MAX);
    }

    #[test]
    fn test_advert_observation_estimates_rssi_from_snr() {
        let mut tracker = LinkQualityTracker::new();
        tracker.observe_advert(N1, None, -5, now());

        let link = tracker.get(N1).unwrap();
        assert_eq!(link.rssi_dbm, -135);
        assert_eq!(link.snr_db, -5);
        assert_eq!(link.tx_success, 1);
    }

    #[test]
    fn test_snapshot_of_unknown_neighbor_uses_defaults() {
        let tracker = LinkQualityTracker::new();
        let snapshot = tracker.snapshot(0x0202);
        assert_eq!(snapshot.rssi_dbm, -120);
        assert_eq!(snapshot.snr_db, -20);
        assert_eq!(snapshot.etx, ETX_DEFAULT);
    }

    #[test]
    fn test_full_table_evicts_least_recently_updated() {
        let mut tracker = LinkQualityTracker::new();
        for i in 0..MAX_TRACKED_LINKS as u16 {
            tracker.observe_advert(0x0100 + i, None, 0, now() + Duration::from_secs(i as u64));
        }
        // 0x0100 is the oldest entry; a new neighbor takes its slot.
        tracker.observe_advert(0x0999, None, 0, now() + Duration::from_secs(100));
        assert!(tracker.get(0x0100).is_none());
        assert!(tracker.get(0x0999).is_some());
        assert!(tracker.get(0x0101).is_some());
    }
}
