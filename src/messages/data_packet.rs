//! Application-packet envelope carrying telemetry through the mesh.
//!
//! ```text
//! Byte 0:      packet kind (Data)
//! Bytes 1-2:   destination address (u16 LE, 0xFFFF broadcast)
//! Bytes 3-4:   source address (u16 LE)
//! Bytes 5-8:   sequence number (u32 LE, monotonic per sender)
//! Byte 9:      TTL (decremented on flood rebroadcast)
//! Byte 10:     application data type
//! Bytes 11-14: timestamp, milliseconds since sender boot (u32 LE)
//! Byte 15:     payload length
//! Bytes 16..:  opaque telemetry payload
//! ```

use super::radio_packet::{PacketKind, RadioPacket};
use crate::{NodeAddress, MAX_DATA_PAYLOAD};

pub const DATA_HEADER_SIZE: usize = 16;

#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum DataParseError {
    TooShort,
    WrongKind,
    PayloadTooLong,
}

/// Parsed or to-be-sent application packet.
#[derive(Clone)]
pub struct DataPacket {
    pub dest: NodeAddress,
    pub src: NodeAddress,
    pub sequence: u32,
    pub ttl: u8,
    pub data_type: u8,
    pub timestamp_ms: u32,
    payload: [u8; MAX_DATA_PAYLOAD],
    payload_len: u8,
}

impl DataPacket {
    /// Builds a packet, truncating the payload to the envelope capacity.
    pub fn new(
        dest: NodeAddress,
        src: NodeAddress,
        sequence: u32,
        ttl: u8,
        data_type: u8,
        timestamp_ms: u32,
        payload: &[u8],
    ) -> Self {
        let len = payload.len().min(MAX_DATA_PAYLOAD);
        let mut buffer = [0u8; MAX_DATA_PAYLOAD];
        buffer[..len].copy_from_slice(&payload[..len]);
        DataPacket {
            dest,
            src,
            sequence,
            ttl,
            data_type,
            timestamp_ms,
            payload: buffer,
            payload_len: len as u8,
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload[..self.payload_len as usize]
    }

    pub fn to_packet(&self) -> RadioPacket {
        let mut packet = RadioPacket::empty();
        packet.data[0] = PacketKind::Data as u8;
        packet.data[1..3].copy_from_slice(&self.dest.to_le_bytes());
        packet.data[3..5].copy_from_slice(&self.src.to_le_bytes());
        packet.data[5..9].copy_from_slice(&self.sequence.to_le_bytes());
        packet.data[9] = self.ttl;
        packet.data[10] = self.data_type;
        packet.data[11..15].copy_from_slice(&self.timestamp_ms.to_le_bytes());
        packet.data[15] = self.payload_len;
        let end = DATA_HEADER_SIZE + self.payload_len as usize;
        packet.data[DATA_HEADER_SIZE..end].copy_from_slice(self.payload());
        packet.length = end;
        packet
    }

    pub fn parse(data: &[u8]) -> Result<DataPacket, DataParseError> {
        if data.len() < DATA_HEADER_SIZE {
            return Err(DataParseError::TooShort);
        }
        if PacketKind::from_byte(data[0]) != Some(PacketKind::Data) {
            return Err(DataParseError::WrongKind);
        }
        let payload_len = data[15] as usize;
        if payload_len > MAX_DATA_PAYLOAD || DATA_HEADER_SIZE + payload_len > data.len() {
            return Err(DataParseError::PayloadTooLong);
        }

        let mut payload = [0u8; MAX_DATA_PAYLOAD];
        payload[..payload_len].copy_from_slice(&data[DATA_HEADER_SIZE..DATA_HEADER_SIZE + payload_len]);
        Ok(DataPacket {
            dest: u16::from_le_bytes([data[1], data[2]]),
            src: u16::from_le_bytes([data[3], data[4]]),
            sequence: u32::from_le_bytes([data[5], data[6], data[7], data[8]]),
            ttl: data[9],
            data_type: data[10],
            timestamp_ms: u32::from_le_bytes([data[11], data[12], data[13], data[14]]),
            payload,
            payload_len: payload_len as u8,
        })
    }
}
