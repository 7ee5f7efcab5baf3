//! # Airtime Model
//!
//! Pure time-on-air calculation for LoRa transmissions, following the
//! Semtech AN1200.13 formula.
//!
//! The duty-cycle ledger uses this module to convert payload sizes into
//! channel occupancy before admitting a transmission. The calculation is a
//! pure function of the payload size and the modem parameters; it performs
//! no I/O and holds no state.
//!
//! ## Formula
//!
//! - Symbol time: `T_sym = 2^SF / BW`
//! - Preamble time: `(preamble_symbols + 4.25) * T_sym`
//! - Payload symbols: `8 + ceil(max(0, 8*bytes - 4*SF + 28 + 16*crc) / divisor) * CR`
//!   where the divisor is `4*(SF - 2)` with low-data-rate optimization and
//!   `4*SF` without, and `CR` is the coding-rate denominator (5..8 for
//!   4/5..4/8).
//!
//! The result is rounded to whole milliseconds.

use crate::RadioParams;

/// Computes the time-on-air in milliseconds for a payload of the given size.
///
/// # Arguments
/// * `payload_bytes` - Number of PHY payload bytes to transmit
/// * `params` - Modem parameters (spreading factor, bandwidth, coding rate,
///   preamble length, CRC, low-data-rate optimization)
///
/// # Returns
/// Time-on-air in milliseconds, rounded to the nearest whole millisecond.
pub fn time_on_air_ms(payload_bytes: usize, params: &RadioParams) -> u32 {
    let sf = params.spreading_factor as u32;
    let symbol_time_ms = (1u64 << sf) as f32 / params.bandwidth_khz as f32;

    let preamble_ms = (params.preamble_symbols as f32 + 4.25) * symbol_time_ms;

    let crc_bits = if params.crc_enabled { 16 } else { 0 };
    let numerator = 8 * payload_bytes as i32 - 4 * sf as i32 + 28 + crc_bits;

    let divisor = if params.low_data_rate_optimize {
        4 * (sf as i32 - 2)
    } else {
        4 * sf as i32
    };

    let ceil_div = if numerator <= 0 {
        0
    } else {
        (numerator + divisor - 1) / divisor
    };

    let payload_symbols = 8 + ceil_div as u32 * params.coding_rate_denom as u32;
    let payload_ms = payload_symbols as f32 * symbol_time_ms;

    round_to_ms(preamble_ms + payload_ms)
}

// f32::round is not available in core; nearest-integer rounding for
// positive durations.
fn round_to_ms(value: f32) -> u32 {
    (value + 0.5) as u32
}
