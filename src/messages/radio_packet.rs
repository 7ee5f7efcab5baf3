//! Low-level fixed-size packet buffer exchanged with the radio driver.
//!
//! Every frame starts with a one-byte kind discriminator; the rest of the
//! layout belongs to the kind-specific modules. The `data` and `length`
//! fields are public for zero-copy hand-off to radio hardware interfaces.

use crate::RADIO_PACKET_SIZE;

/// Frame kind discriminator at byte 0 of every packet.
#[derive(Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(Debug))]
pub enum PacketKind {
    RouteAdvertisement = 1,
    Data = 2,
}

impl PacketKind {
    pub fn from_byte(byte: u8) -> Option<PacketKind> {
        match byte {
            1 => Some(PacketKind::RouteAdvertisement),
            2 => Some(PacketKind::Data),
            _ => None,
        }
    }
}

/// Wire-format packet: a fixed-size buffer and the valid byte count.
#[derive(Clone)]
#[cfg_attr(feature = "std", derive(Debug))]
pub struct RadioPacket {
    pub data: [u8; RADIO_PACKET_SIZE],
    pub length: usize,
}

impl RadioPacket {
    pub const fn empty() -> Self {
        RadioPacket {
            data: [0; RADIO_PACKET_SIZE],
            length: 0,
        }
    }

    pub fn kind(&self) -> Option<PacketKind> {
        if self.length == 0 {
            return None;
        }
        PacketKind::from_byte(self.data[0])
    }

    pub fn payload(&self) -> &[u8] {
        &self.data[..self.length]
    }
}
