//! # Routing Advertisement Wire Format
//!
//! A routing advertisement carries the sender's identity, role, and
//! gateway-load hint, followed by a tightly packed array of
//! per-destination records summarizing the sender's routing table.
//!
//! ## Frame layout
//!
//! ```text
//! Byte 0:    packet kind (RouteAdvertisement)
//! Bytes 1-2: sender address (u16 LE)
//! Byte 3:    packet size (total frame bytes)
//! Byte 4:    sender role bitmask
//! Byte 5:    sender gateway load (255 = unknown)
//! Bytes 6..: N x NetworkNodeRecord, 5 bytes each:
//!            address (u16 LE), metric (u8), role (u8), gateway_load (u8)
//! ```
//!
//! The record count is derived from `(packet_size - header) / 5`; a
//! receiver must verify the division is exact and drop the frame
//! otherwise.
//!
//! A table that does not fit in one frame is fragmented across successive
//! frames within the same emission, each frame carrying as many records as
//! fit below the PHY MTU.

use super::radio_packet::{PacketKind, RadioPacket};
use crate::{NodeAddress, Role, MAX_ADVERT_FRAMES, RADIO_PACKET_SIZE};

/// Header bytes preceding the packed records.
pub const ADVERT_HEADER_SIZE: usize = 6;

/// Wire size of one packed record.
pub const NODE_RECORD_SIZE: usize = 5;

/// Most records a single maximum-size frame can carry.
pub const MAX_NODES_PER_FRAME: usize = (RADIO_PACKET_SIZE - ADVERT_HEADER_SIZE) / NODE_RECORD_SIZE;

/// One destination summary inside an advertisement.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct NetworkNodeRecord {
    pub address: NodeAddress,
    pub metric: u8,
    pub role: u8,
    pub gateway_load: u8,
}

impl NetworkNodeRecord {
    pub const fn empty() -> Self {
        NetworkNodeRecord {
            address: 0,
            metric: 0,
            role: 0,
            gateway_load: 255,
        }
    }

    fn write(&self, out: &mut [u8]) {
        out[0..2].copy_from_slice(&self.address.to_le_bytes());
        out[2] = self.metric;
        out[3] = self.role;
        out[4] = self.gateway_load;
    }

    fn read(data: &[u8]) -> Self {
        NetworkNodeRecord {
            address: u16::from_le_bytes([data[0], data[1]]),
            metric: data[2],
            role: data[3],
            gateway_load: data[4],
        }
    }
}

/// Reasons an advertisement frame is rejected.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum AdvertParseError {
    /// Frame shorter than the fixed header.
    TooShort,
    /// Kind byte is not a routing advertisement.
    WrongKind,
    /// Header packet size disagrees with the received byte count.
    LengthMismatch,
    /// Record area is not a whole multiple of the record size.
    SizeMismatch,
}

/// Parsed routing advertisement.
pub struct RouteAdvert {
    pub src: NodeAddress,
    pub node_role: Role,
    pub gateway_load: u8,
    nodes: [NetworkNodeRecord; MAX_NODES_PER_FRAME],
    node_count: usize,
}

impl RouteAdvert {
    /// Parses one received frame, validating the size invariants.
    pub fn parse(data: &[u8]) -> Result<RouteAdvert, AdvertParseError> {
        if data.len() < ADVERT_HEADER_SIZE {
            return Err(AdvertParseError::TooShort);
        }
        if PacketKind::from_byte(data[0]) != Some(PacketKind::RouteAdvertisement) {
            return Err(AdvertParseError::WrongKind);
        }
        if data[3] as usize != data.len() {
            return Err(AdvertParseError::LengthMismatch);
        }
        let record_bytes = data.len() - ADVERT_HEADER_SIZE;
        if record_bytes % NODE_RECORD_SIZE != 0 {
            return Err(AdvertParseError::SizeMismatch);
        }

        let node_count = record_bytes / NODE_RECORD_SIZE;
        let mut nodes = [NetworkNodeRecord::empty(); MAX_NODES_PER_FRAME];
        for i in 0..node_count {
            let offset = ADVERT_HEADER_SIZE + i * NODE_RECORD_SIZE;
            nodes[i] = NetworkNodeRecord::read(&data[offset..offset + NODE_RECORD_SIZE]);
        }

        Ok(RouteAdvert {
            src: u16::from_le_bytes([data[1], data[2]]),
            node_role: Role::from_bits(data[4]),
            gateway_load: data[5],
            nodes,
            node_count,
        })
    }

    pub fn nodes(&self) -> &[NetworkNodeRecord] {
        &self.nodes[..self.node_count]
    }
}

/// Packs a table summary into as few frames as fit under `max_frame_size`,
/// writing them into `frames`. An empty summary still produces one frame:
/// the bare header announces the sender itself.
///
/// Returns the number of frames written.
pub fn build_advert_frames(
    src: NodeAddress,
    role: Role,
    gateway_load: u8,
    records: &[NetworkNodeRecord],
    max_frame_size: usize,
    frames: &mut [RadioPacket; MAX_ADVERT_FRAMES],
) -> usize {
    let per_frame = (max_frame_size.min(RADIO_PACKET_SIZE) - ADVERT_HEADER_SIZE) / NODE_RECORD_SIZE;
    if per_frame == 0 {
        return 0;
    }

    let mut frame_count = 0;
    let mut offset = 0;
    loop {
        if frame_count == MAX_ADVERT_FRAMES {
            break;
        }
        let chunk_len = (records.len() - offset).min(per_frame);
        let chunk = &records[offset..offset + chunk_len];

        let frame = &mut frames[frame_count];
        let total = ADVERT_HEADER_SIZE + chunk.len() * NODE_RECORD_SIZE;
        frame.data[0] = PacketKind::RouteAdvertisement as u8;
        frame.data[1..3].copy_from_slice(&src.to_le_bytes());
        frame.data[3] = total as u8;
        frame.data[4] = role.bits();
        frame.data[5] = gateway_load;
        for (i, record) in chunk.iter().enumerate() {
            let start = ADVERT_HEADER_SIZE + i * NODE_RECORD_SIZE;
            record.write(&mut frame.data[start..start + NODE_RECORD_SIZE]);
        }
        frame.length = total;
        frame_count += 1;

        offset += chunk_len;
        if offset >= records.len() {
            break;
        }
    }
    frame_count
}
