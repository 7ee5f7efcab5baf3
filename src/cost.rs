//! # Route Cost Function
//!
//! Weighted multi-metric cost for gateway-aware routing. Lower is better.
//!
//! ```text
//! cost = W1*hops
//!      + W2*(1 - normalize(rssi, -120, -30))
//!      + W3*(1 - normalize(snr, -20, 10))
//!      + W4*max(0, etx - 1)
//!      + weak_link_penalty
//!      + W5*gateway_bias(dest)   (gateway destinations only)
//! ```
//!
//! The weak-link penalty makes a clean two-hop path beat a marginal
//! one-hop path. The gateway bias spreads sensor traffic across gateways
//! by penalizing the more heavily loaded ones.
//!
//! Cost evaluation deliberately runs over snapshots: callers copy the link
//! metrics and gateway loads out of their guarded tables first, so no table
//! guard is ever held while a cost is computed.

use crate::link_quality::LinkSnapshot;
use crate::{CostConfig, NodeAddress, Role, GATEWAY_LOAD_UNKNOWN, MAX_GATEWAYS};

const RSSI_MIN: f32 = -120.0;
const RSSI_MAX: f32 = -30.0;
const SNR_MIN: f32 = -20.0;
const SNR_MAX: f32 = 10.0;

/// Linearly maps `value` from `[lo, hi]` onto `[0, 1]`, clamping outside.
pub fn normalize(value: f32, lo: f32, hi: f32) -> f32 {
    ((value - lo) / (hi - lo)).clamp(0.0, 1.0)
}

/// Cost evaluator over snapshots of link metrics and gateway loads.
pub struct CostModel<'a> {
    config: &'a CostConfig,
    gateway_loads: &'a [(NodeAddress, u8)],
}

impl<'a> CostModel<'a> {
    /// `gateway_loads` holds `(address, load)` pairs for known gateways;
    /// entries with the unknown marker are ignored.
    pub fn new(config: &'a CostConfig, gateway_loads: &'a [(NodeAddress, u8)]) -> Self {
        CostModel { config, gateway_loads }
    }

    /// Cost of reaching `dest` in `metric` hops over the link described by
    /// `link` (the next hop's metrics).
    pub fn route_cost(&self, metric: u8, link: &LinkSnapshot, dest: NodeAddress, dest_role: Role) -> f32 {
        let cfg = self.config;

        let mut cost = cfg.w_hops * metric as f32;
        cost += cfg.w_rssi * (1.0 - normalize(link.rssi_dbm as f32, RSSI_MIN, RSSI_MAX));
        cost += cfg.w_snr * (1.0 - normalize(link.snr_db as f32, SNR_MIN, SNR_MAX));
        cost += cfg.w_etx * (link.etx - 1.0).max(0.0);

        if link.rssi_dbm < cfg.weak_rssi_dbm || link.snr_db < cfg.weak_snr_db {
            cost += cfg.weak_link_penalty;
        }

        if dest_role.contains(Role::GATEWAY) {
            cost += cfg.w_gateway_bias * self.gateway_bias(dest);
        }

        cost
    }

    /// Load imbalance of `dest` relative to the mean gateway load, in
    /// multiples of the mean. Zero unless at least two gateways carry load
    /// data and the mean clears a small floor.
    fn gateway_bias(&self, dest: NodeAddress) -> f32 {
        let mut known = 0u32;
        let mut total = 0u32;
        let mut dest_load: Option<u8> = None;

        for &(address, load) in self.gateway_loads {
            if load == GATEWAY_LOAD_UNKNOWN {
                continue;
            }
            known += 1;
            total += load as u32;
            if address == dest {
                dest_load = Some(load);
            }
        }

        if known < 2 {
            return 0.0;
        }
        let mean = total as f32 / known as f32;
        if mean < self.config.min_gateway_mean_load {
            return 0.0;
        }
        match dest_load {
            Some(load) => (load as f32 - mean) / mean,
            None => 0.0,
        }
    }
}

/// Route candidate copied out of the routing table for cost evaluation
/// outside the table guard.
#[derive(Clone, Copy)]
pub struct RouteCandidate {
    pub dest: NodeAddress,
    pub via: NodeAddress,
    pub metric: u8,
    pub role: Role,
    pub gateway_load: u8,
}

/// Fixed-size buffer of gateway load pairs used for snapshots.
pub type GatewayLoadSnapshot = [(NodeAddress, u8); MAX_GATEWAYS];
