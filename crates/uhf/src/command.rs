//! Radio command set.
//!
//! Opcodes, the request/response pairing table the correlator consults,
//! and codecs for the argument payloads that are more than raw bytes.

use bytes::{Buf, BufMut};

use crate::UhfError;

pub mod opcode {
    pub const ACK: u8 = 0x01;
    pub const NACK: u8 = 0x02;
    pub const REBOOT: u8 = 0x03;
    pub const GET_TIME: u8 = 0x04;
    pub const SET_TIME: u8 = 0x05;
    pub const TIME: u8 = 0x06;
    pub const GET_CALLSIGN: u8 = 0x07;
    pub const SET_CALLSIGN: u8 = 0x08;
    pub const CALLSIGN: u8 = 0x09;
    pub const GET_TELEMETRY: u8 = 0x0A;
    pub const TELEMETRY: u8 = 0x0B;
    pub const RANGING: u8 = 0x0C;
    pub const RANGE_ACK: u8 = 0x0D;
    pub const SET_BEACON: u8 = 0x0E;
    pub const GET_BEACON: u8 = 0x0F;
    pub const BEACON: u8 = 0x10;

    /// Bootloader page programming.
    pub const BOOT_PING: u8 = 0x20;
    pub const BOOT_ACK: u8 = 0x21;
    pub const BOOT_NACK: u8 = 0x22;
    pub const WRITE_PAGE: u8 = 0x23;
    pub const ERASE: u8 = 0x24;
}

/// Placeholder argument for requests with no parameters. Bodies no
/// longer than the frame header are dropped as runts on receive, so
/// even an empty request carries one byte.
pub const NO_ARGS: [u8; 1] = [0x00];

/// Response opcodes that complete a pending request.
pub fn expected_responses(op: u8) -> &'static [u8] {
    use opcode::*;
    match op {
        REBOOT | SET_TIME | SET_CALLSIGN | SET_BEACON => &[ACK, NACK],
        GET_TIME => &[TIME, NACK],
        GET_CALLSIGN => &[CALLSIGN, NACK],
        GET_TELEMETRY => &[TELEMETRY, NACK],
        GET_BEACON => &[BEACON, NACK],
        RANGING => &[RANGE_ACK, NACK],
        BOOT_PING | WRITE_PAGE | ERASE => &[BOOT_ACK, BOOT_NACK],
        _ => &[],
    }
}

pub const MAX_CALLSIGN: usize = 16;
pub const MAX_BEACON_TEXT: usize = 64;
pub const MAX_PAGE_DATA: usize = 128;

pub fn encode_time(unix_seconds: u32) -> [u8; 4] {
    unix_seconds.to_le_bytes()
}

pub fn decode_time(args: &[u8]) -> Result<u32, UhfError> {
    let mut cur = args;
    if cur.remaining() < 4 {
        return Err(UhfError::InvalidFrame);
    }
    Ok(cur.get_u32_le())
}

/// Bootloader page write: page index, byte offset, data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageWrite {
    pub page: u8,
    pub offset: u16,
    pub data: Vec<u8>,
}

impl PageWrite {
    pub fn encode(&self) -> Result<Vec<u8>, UhfError> {
        if self.data.len() > MAX_PAGE_DATA {
            return Err(UhfError::FrameTooLarge);
        }
        let mut out = Vec::with_capacity(3 + self.data.len());
        out.put_u8(self.page);
        out.put_u16_le(self.offset);
        out.extend_from_slice(&self.data);
        Ok(out)
    }

    pub fn decode(args: &[u8]) -> Result<Self, UhfError> {
        let mut cur = args;
        if cur.remaining() < 3 {
            return Err(UhfError::ShortIpcPayload);
        }
        let page = cur.get_u8();
        let offset = cur.get_u16_le();
        Ok(Self {
            page,
            offset,
            data: cur.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pairing_table_covers_both_outcomes() {
        assert_eq!(expected_responses(opcode::SET_TIME), &[opcode::ACK, opcode::NACK]);
        assert_eq!(
            expected_responses(opcode::GET_TELEMETRY),
            &[opcode::TELEMETRY, opcode::NACK]
        );
        assert_eq!(
            expected_responses(opcode::WRITE_PAGE),
            &[opcode::BOOT_ACK, opcode::BOOT_NACK]
        );
        // replies themselves expect nothing
        assert!(expected_responses(opcode::ACK).is_empty());
        assert!(expected_responses(opcode::TELEMETRY).is_empty());
    }

    #[test]
    fn test_time_codec() {
        let wire = encode_time(1_756_000_000);
        assert_eq!(decode_time(&wire).unwrap(), 1_756_000_000);
        assert!(decode_time(&wire[..3]).is_err());
    }

    #[test]
    fn test_page_write_codec() {
        let pw = PageWrite {
            page: 3,
            offset: 0x0180,
            data: vec![0xAA; 64],
        };
        let wire = pw.encode().unwrap();
        assert_eq!(wire.len(), 3 + 64);
        assert_eq!(PageWrite::decode(&wire).unwrap(), pw);

        assert!(PageWrite::decode(&wire[..2]).is_err());
        let too_big = PageWrite {
            page: 0,
            offset: 0,
            data: vec![0; MAX_PAGE_DATA + 1],
        };
        assert!(too_big.encode().is_err());
    }
}
