//! Addressed packets and the 32-bit extended id

use std::fmt;

use crate::pool::{PacketPool, PooledBuf};
use crate::CspError;

/// Largest payload that fits one radio frame body after the frame
/// header and the extended id.
pub const MAX_DATA: usize = 241;

pub const MAX_ADDRESS: u8 = 31;
pub const MAX_PORT: u8 = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    Critical = 0,
    High = 1,
    Normal = 2,
    Low = 3,
}

impl Priority {
    fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Priority::Critical,
            1 => Priority::High,
            2 => Priority::Normal,
            _ => Priority::Low,
        }
    }
}

/// Extended packet id, wire layout (big-endian word):
/// `pri:2 | src:5 | dst:5 | dport:6 | sport:6 | flags:8`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketId {
    pub priority: Priority,
    pub src: u8,
    pub dst: u8,
    pub dport: u8,
    pub sport: u8,
    pub flags: u8,
}

impl PacketId {
    pub fn new(
        priority: Priority,
        src: u8,
        dst: u8,
        dport: u8,
        sport: u8,
    ) -> Result<Self, CspError> {
        if src > MAX_ADDRESS || dst > MAX_ADDRESS || dport > MAX_PORT || sport > MAX_PORT {
            return Err(CspError::InvalidAddress);
        }
        Ok(Self {
            priority,
            src,
            dst,
            dport,
            sport,
            flags: 0,
        })
    }

    pub fn to_word(&self) -> u32 {
        ((self.priority as u32) << 30)
            | ((self.src as u32) << 25)
            | ((self.dst as u32) << 20)
            | ((self.dport as u32) << 14)
            | ((self.sport as u32) << 8)
            | self.flags as u32
    }

    pub fn from_word(word: u32) -> Self {
        Self {
            priority: Priority::from_bits(word >> 30),
            src: ((word >> 25) & 0x1F) as u8,
            dst: ((word >> 20) & 0x1F) as u8,
            dport: ((word >> 14) & 0x3F) as u8,
            sport: ((word >> 8) & 0x3F) as u8,
            flags: (word & 0xFF) as u8,
        }
    }
}

/// The in-memory routable unit. The payload lives in a pooled buffer and
/// travels with the packet; whoever drops the packet releases the buffer.
pub struct Packet {
    pub id: PacketId,
    pub data: PooledBuf,
}

impl Packet {
    pub fn new(id: PacketId, pool: &PacketPool) -> Result<Self, CspError> {
        Ok(Self {
            id,
            data: pool.get()?,
        })
    }

    pub fn with_payload(id: PacketId, pool: &PacketPool, payload: &[u8]) -> Result<Self, CspError> {
        if payload.len() > MAX_DATA {
            return Err(CspError::PayloadTooLarge);
        }
        let mut data = pool.get()?;
        data.extend_from_slice(payload)?;
        Ok(Self { id, data })
    }

    pub fn from_parts(id: PacketId, data: PooledBuf) -> Self {
        Self { id, data }
    }
}

impl PartialEq for Packet {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.data == other.data
    }
}

impl Eq for Packet {}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Packet {}:{} -> {}:{} ({} bytes)",
            self.id.src,
            self.id.sport,
            self.id.dst,
            self.id.dport,
            self.data.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_word_round_trip() {
        let cases = [
            (Priority::Critical, 0, 31, 0, 63),
            (Priority::High, 1, 5, 16, 48),
            (Priority::Normal, 26, 1, 19, 17),
            (Priority::Low, 31, 0, 63, 0),
        ];
        for (priority, src, dst, dport, sport) in cases {
            let id = PacketId::new(priority, src, dst, dport, sport).unwrap();
            assert_eq!(PacketId::from_word(id.to_word()), id);
        }
    }

    #[test]
    fn test_id_field_placement() {
        let id = PacketId::new(Priority::High, 2, 3, 4, 5).unwrap();
        let word = id.to_word();
        assert_eq!(word >> 30, 1);
        assert_eq!((word >> 25) & 0x1F, 2);
        assert_eq!((word >> 20) & 0x1F, 3);
        assert_eq!((word >> 14) & 0x3F, 4);
        assert_eq!((word >> 8) & 0x3F, 5);
        assert_eq!(word & 0xFF, 0);
    }

    #[test]
    fn test_id_range_validation() {
        assert!(PacketId::new(Priority::Normal, 32, 1, 1, 1).is_err());
        assert!(PacketId::new(Priority::Normal, 1, 32, 1, 1).is_err());
        assert!(PacketId::new(Priority::Normal, 1, 1, 64, 1).is_err());
        assert!(PacketId::new(Priority::Normal, 1, 1, 1, 64).is_err());
    }

    #[test]
    fn test_payload_limit() {
        let pool = PacketPool::new(2);
        let id = PacketId::new(Priority::Normal, 1, 5, 16, 48).unwrap();
        assert!(Packet::with_payload(id, &pool, &[0u8; MAX_DATA]).is_ok());
        assert!(matches!(
            Packet::with_payload(id, &pool, &[0u8; MAX_DATA + 1]),
            Err(CspError::PayloadTooLarge)
        ));
    }
}
