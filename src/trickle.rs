//! # Trickle Scheduler
//!
//! Adaptive transmission interval for routing advertisements, following
//! the RFC 6206 state machine: while the network is consistent the
//! interval doubles up to `I_max`; an inconsistency resets it to `I_min`
//! for fast reconvergence; transmissions whose information is already
//! circulating are suppressed.
//!
//! ## Per-interval behavior
//!
//! Each interval of length `I` picks a uniformly random transmit point `t`
//! in `[I/2, I]`. When the wall clock reaches `t`, the timer fires exactly
//! once: it transmits unless at least `k` consistent advertisements were
//! heard during the interval, in which case the transmission is
//! suppressed. When the interval expires, `I` doubles (capped at `I_max`)
//! and a new interval begins.
//!
//! ## Safety override
//!
//! Suppression under `k = 1` can silence a node indefinitely when its
//! neighbors all happen to stay consistent. A safety override therefore
//! forces a transmission whenever no advertisement has left this node for
//! the safety interval (180 s by default, chosen so two consecutive misses
//! still fall inside the 600 s route timeout). Suppression does not feed
//! the safety timer; only an actual transmission does.
//!
//! `poll` is intended to be called at 1 Hz or driven from a timer; all
//! methods take an explicit `now` and RNG so the state machine is
//! deterministic under test.

use embassy_time::{Duration, Instant};
use log::log;
use rand_core::RngCore;
use rand_wyrand::WyRand;

use crate::TrickleConfig;

/// What the caller should do after polling the timer.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum TrickleAction {
    /// Nothing to do this poll.
    None,
    /// The transmit point was reached without suppression.
    Transmit,
    /// The safety override fired: transmit regardless of suppression.
    SafetyTransmit,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Active,
}

pub struct TrickleTimer {
    config: TrickleConfig,
    i_current: Duration,
    interval_start: Instant,
    transmit_point: Instant,
    consistent_heard: u8,
    fired_this_interval: bool,
    last_transmit: Instant,
    state: State,
    transmit_count: u32,
    suppress_count: u32,
}

impl TrickleTimer {
    pub const fn new(config: TrickleConfig) -> Self {
        TrickleTimer {
            config,
            i_current: config.i_min,
            interval_start: Instant::from_ticks(0),
            transmit_point: Instant::from_ticks(0),
            consistent_heard: 0,
            fired_this_interval: false,
            last_transmit: Instant::from_ticks(0),
            state: State::Idle,
            transmit_count: 0,
            suppress_count: 0,
        }
    }

    pub fn start(&mut self, now: Instant, rng: &mut WyRand) {
        self.state = State::Active;
        self.i_current = self.config.i_min;
        self.last_transmit = now;
        self.begin_interval(now, rng);
        log!(
            log::Level::Info,
            "Trickle started: I={}s, next TX point in {}s",
            self.i_current.as_secs(),
            (self.transmit_point - now).as_secs()
        );
    }

    /// Resets the interval to `I_min` with a fresh random transmit point.
    /// Called on inconsistent advertisements and neighbor failures.
    pub fn reset(&mut self, now: Instant, rng: &mut WyRand) {
        if self.state == State::Idle {
            return;
        }
        self.i_current = self.config.i_min;
        self.begin_interval(now, rng);
        log!(log::Level::Info, "Trickle reset: I={}s", self.i_current.as_secs());
    }

    /// Counts a consistent advertisement towards suppression.
    pub fn heard_consistent(&mut self) {
        if self.state == State::Idle {
            return;
        }
        self.consistent_heard = self.consistent_heard.saturating_add(1);
    }

    /// Advances the state machine. Poll at 1 Hz or faster.
    pub fn poll(&mut self, now: Instant, rng: &mut WyRand) -> TrickleAction {
        if self.state == State::Idle {
            return TrickleAction::None;
        }

        // The transmit point is checked before interval expiry: a fire
        // pending at the very end of an interval must not be lost to the
        // poll that also observes the expiry.
        if !self.fired_this_interval && now >= self.transmit_point {
            self.fired_this_interval = true;
            if self.consistent_heard >= self.config.k {
                self.suppress_count += 1;
                log!(
                    log::Level::Debug,
                    "Trickle suppressed: heard {} consistent advertisements",
                    self.consistent_heard
                );
            } else {
                return TrickleAction::Transmit;
            }
        }

        if now >= self.interval_start + self.i_current {
            let doubled = self.i_current * 2;
            self.i_current = if doubled > self.config.i_max { self.config.i_max } else { doubled };
            self.begin_interval(now, rng);
            log!(log::Level::Debug, "Trickle interval expired, I={}s", self.i_current.as_secs());
        }

        if now.saturating_duration_since(self.last_transmit) >= self.config.safety_interval {
            log!(
                log::Level::Warn,
                "Trickle safety override: {}s since last advertisement",
                now.saturating_duration_since(self.last_transmit).as_secs()
            );
            return TrickleAction::SafetyTransmit;
        }

        TrickleAction::None
    }

    /// Marks that an advertisement actually left this node. Feeds the
    /// safety timer; suppressed transmissions must not call this.
    pub fn record_transmission(&mut self, now: Instant) {
        self.last_transmit = now;
        self.transmit_count += 1;
    }

    pub fn current_interval(&self) -> Duration {
        self.i_current
    }

    pub fn transmit_count(&self) -> u32 {
        self.transmit_count
    }

    pub fn suppress_count(&self) -> u32 {
        self.suppress_count
    }

    fn begin_interval(&mut self, now: Instant, rng: &mut WyRand) {
        self.interval_start = now;
        self.consistent_heard = 0;
        self.fired_this_interval = false;

        let half = self.i_current.as_millis() / 2;
        let span = self.i_current.as_millis() - half;
        let offset = half + rng.next_u64() % (span + 1);
        self.transmit_point = now + Duration::from_millis(offset);
    }
}
