//! # Duty-Cycle Ledger
//!
//! Sliding-window airtime accounting and admission control for regional
//! duty-cycle regulation (1 % channel occupancy over a one-hour window for
//! EU868/AS923).
//!
//! ## Architecture
//!
//! The ledger keeps a bounded ring of transmission records, each stamped
//! with its wall-clock time and airtime. On every call the window is
//! maintained: records older than the window are evicted and their airtime
//! subtracted, and a hard window boundary resets all state including the
//! warning/critical one-shots.
//!
//! ## Admission
//!
//! `may_transmit` projects the airtime of the candidate payload via the
//! airtime model and denies the transmission when the projection would
//! exceed the configured ceiling. A denial is final for that attempt; the
//! caller must not retry without a fresh admission.
//!
//! ## Threshold events
//!
//! Crossing 83 % of the ceiling logs a warning, crossing 94 % logs a
//! critical warning. Each fires at most once per window and re-arms on
//! window reset.

use embassy_time::Instant;
use log::log;

use crate::airtime::time_on_air_ms;
use crate::{DutyCycleConfig, RadioParams, DUTY_LEDGER_CAPACITY};

/// One recorded transmission inside the sliding window.
#[derive(Clone, Copy)]
struct TransmissionRecord {
    recorded_at: Instant,
    airtime_ms: u32,
}

const EMPTY_RECORD: TransmissionRecord = TransmissionRecord {
    recorded_at: Instant::from_ticks(0),
    airtime_ms: 0,
};

/// Sliding-hour airtime ledger with admission control.
///
/// All methods take an explicit `now` so the window logic is deterministic
/// under test; tasks pass `Instant::now()`.
pub struct DutyCycleLedger {
    records: [TransmissionRecord; DUTY_LEDGER_CAPACITY],
    head: usize,
    len: usize,
    total_airtime_ms: u64,
    window_start: Instant,
    warning_issued: bool,
    critical_issued: bool,
    denials: u32,
    config: DutyCycleConfig,
    radio: RadioParams,
}

impl DutyCycleLedger {
    pub const fn new() -> Self {
        DutyCycleLedger {
            records: [EMPTY_RECORD; DUTY_LEDGER_CAPACITY],
            head: 0,
            len: 0,
            total_airtime_ms: 0,
            window_start: Instant::from_ticks(0),
            warning_issued: false,
            critical_issued: false,
            denials: 0,
            config: DutyCycleConfig::new(),
            radio: RadioParams::new(),
        }
    }

    pub fn configure(&mut self, config: DutyCycleConfig, radio: RadioParams, now: Instant) {
        self.config = config;
        self.radio = radio;
        self.window_start = now;
        log!(
            log::Level::Info,
            "Duty-cycle ledger configured: {} ms ceiling per {} ms window (SF{}, BW{} kHz)",
            self.config.max_airtime_ms,
            self.config.window_ms,
            self.radio.spreading_factor,
            self.radio.bandwidth_khz
        );
    }

    /// Checks whether a payload of the given size may be transmitted now.
    ///
    /// Returns false when the projected airtime would exceed the ceiling and
    /// enforcement is enabled. The caller must not retry a denied attempt.
    pub fn may_transmit(&mut self, payload_bytes: usize, now: Instant) -> bool {
        let airtime = time_on_air_ms(payload_bytes, &self.radio);
        self.may_transmit_airtime(airtime, now)
    }

    /// Admission check for a transmission with a pre-computed airtime.
    pub fn may_transmit_airtime(&mut self, airtime_ms: u32, now: Instant) -> bool {
        self.maintain(now);

        let projected = self.total_airtime_ms + airtime_ms as u64;
        if projected > self.config.max_airtime_ms {
            if self.config.enforce {
                self.denials += 1;
                log!(
                    log::Level::Warn,
                    "Duty-cycle ceiling would be exceeded: {}/{} ms, denying transmission",
                    projected,
                    self.config.max_airtime_ms
                );
                return false;
            }
            log!(
                log::Level::Warn,
                "Duty-cycle ceiling would be exceeded (not enforced): {}/{} ms",
                projected,
                self.config.max_airtime_ms
            );
        }
        true
    }

    /// Records a confirmed transmission attempt of the given payload size.
    pub fn record(&mut self, payload_bytes: usize, now: Instant) {
        let airtime = time_on_air_ms(payload_bytes, &self.radio);
        self.record_airtime(airtime, now);
    }

    /// Records a confirmed transmission attempt with a pre-computed airtime.
    pub fn record_airtime(&mut self, airtime_ms: u32, now: Instant) {
        self.maintain(now);
        self.push(TransmissionRecord {
            recorded_at: now,
            airtime_ms,
        });
        self.total_airtime_ms += airtime_ms as u64;
        self.check_thresholds();
    }

    /// Evicts expired records; resets all state on a hard window boundary.
    pub fn maintain(&mut self, now: Instant) {
        if now.saturating_duration_since(self.window_start).as_millis() >= self.config.window_ms {
            self.reset(now);
            return;
        }

        while self.len > 0 {
            let oldest = self.records[self.head];
            if now.saturating_duration_since(oldest.recorded_at).as_millis() < self.config.window_ms {
                break;
            }
            self.total_airtime_ms -= oldest.airtime_ms as u64;
            self.head = (self.head + 1) % DUTY_LEDGER_CAPACITY;
            self.len -= 1;
        }
    }

    pub fn reset(&mut self, now: Instant) {
        self.head = 0;
        self.len = 0;
        self.total_airtime_ms = 0;
        self.window_start = now;
        self.warning_issued = false;
        self.critical_issued = false;
        log!(log::Level::Info, "Duty-cycle window reset");
    }

    pub fn set_enforcement(&mut self, enforce: bool) {
        self.config.enforce = enforce;
    }

    pub fn total_airtime_ms(&self) -> u64 {
        self.total_airtime_ms
    }

    pub fn remaining_airtime_ms(&self) -> u64 {
        self.config.max_airtime_ms.saturating_sub(self.total_airtime_ms)
    }

    /// Channel occupancy relative to the full window, in percent.
    pub fn utilization_percent(&self) -> f32 {
        self.total_airtime_ms as f32 * 100.0 / self.config.window_ms as f32
    }

    pub fn is_warning(&self) -> bool {
        self.total_airtime_ms >= self.config.warning_airtime_ms
    }

    pub fn is_critical(&self) -> bool {
        self.total_airtime_ms >= self.config.critical_airtime_ms
    }

    pub fn denials(&self) -> u32 {
        self.denials
    }

    fn push(&mut self, record: TransmissionRecord) {
        if self.len == DUTY_LEDGER_CAPACITY {
            // Ring full with live records: fold the oldest record into its
            // successor. The combined record keeps the newer timestamp, so
            // airtime is never released earlier than it should be.
            let oldest = self.head;
            let next = (self.head + 1) % DUTY_LEDGER_CAPACITY;
            self.records[next].airtime_ms += self.records[oldest].airtime_ms;
            self.head = next;
            self.len -= 1;
        }
        let tail = (self.head + self.len) % DUTY_LEDGER_CAPACITY;
        self.records[tail] = record;
        self.len += 1;
    }

    fn check_thresholds(&mut self) {
        if self.total_airtime_ms >= self.config.critical_airtime_ms && !self.critical_issued {
            self.critical_issued = true;
            log!(
                log::Level::Warn,
                "Duty cycle CRITICAL: {:.2}% of window used ({}/{} ms)",
                self.utilization_percent(),
                self.total_airtime_ms,
                self.config.max_airtime_ms
            );
        } else if self.total_airtime_ms >= self.config.warning_airtime_ms && !self.warning_issued {
            self.warning_issued = true;
            log!(
                log::Level::Warn,
                "Duty cycle warning: {:.2}% of window used ({}/{} ms)",
                self.utilization_percent(),
                self.total_airtime_ms,
                self.config.max_airtime_ms
            );
        }
    }

    #[cfg(all(test, feature = "std"))]
    fn live_record_sum(&self) -> u64 {
        let mut sum = 0u64;
        for i in 0..self.len {
            sum += self.records[(self.head + i) % DUTY_LEDGER_CAPACITY].airtime_ms as u64;
        }
        sum
    }
}
