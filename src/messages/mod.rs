//! # Messages Module
//!
//! Wire formats for the two frame kinds the mesh exchanges:
//!
//! - **Routing advertisements**: a compact header plus a tightly packed
//!   array of per-destination records, fragmented across frames when the
//!   routing table exceeds one PHY frame.
//! - **Application data packets**: the envelope carrying telemetry from
//!   sensors to gateways.
//!
//! `RadioPacket` is the fixed-size wire buffer shared with the radio
//! driver; the higher-level types parse from and serialize into it.

pub mod data_packet;
pub mod radio_packet;
pub mod route_advert;

pub use data_packet::{DataPacket, DataParseError};
pub use radio_packet::{PacketKind, RadioPacket};
pub use route_advert::{AdvertParseError, NetworkNodeRecord, RouteAdvert};
