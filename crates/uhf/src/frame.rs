//! Wire frame codec.
//!
//! Two variants share the `sync0 sync1 length` preamble and the
//! six-byte header. Data frames append a big-endian extended CSP id
//! before the payload; command frames carry their opcode in the
//! header's command byte and go straight to arguments.

use bytes::{Buf, BufMut};

use kestrel_csp::{Packet, PacketId, PooledBuf};

use crate::{
    UhfError, CSP_ID_LEN, FRAME_HEADER_LEN, HWID_BCAST, HWID_OBC, HWID_RADIO, MAX_CSP_PAYLOAD,
    MAX_FRAME_BODY, SYNC0, SYNC1, SYSTEM_DATA, SYSTEM_UHF,
};

/// Fixed header present in every frame body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub hwid: u16,
    pub seq: u16,
    pub system: u8,
    pub command: u8,
}

impl FrameHeader {
    pub fn read_from(cur: &mut &[u8]) -> Result<Self, UhfError> {
        if cur.remaining() < FRAME_HEADER_LEN {
            return Err(UhfError::InvalidFrame);
        }
        Ok(Self {
            hwid: cur.get_u16_le(),
            seq: cur.get_u16_le(),
            system: cur.get_u8(),
            command: cur.get_u8(),
        })
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.put_u16_le(self.hwid);
        out.put_u16_le(self.seq);
        out.put_u8(self.system);
        out.put_u8(self.command);
    }

    /// Host command convention: one of the reserved hardware ids plus
    /// the UHF system code.
    pub fn is_host_command(&self) -> bool {
        matches!(self.hwid, HWID_OBC | HWID_RADIO | HWID_BCAST) && self.system == SYSTEM_UHF
    }
}

/// Stateful packer. Owns the two free-running sequence counters, one
/// per pipe; they wrap at 0xFFFF and are never validated on receive.
#[derive(Debug)]
pub struct FrameCodec {
    data_hwid: u16,
    command_hwid: u16,
    data_seq: u16,
    command_seq: u16,
}

impl FrameCodec {
    pub fn new(data_hwid: u16, command_hwid: u16) -> Self {
        Self {
            data_hwid,
            command_hwid,
            data_seq: 0,
            command_seq: 0,
        }
    }

    /// Full wire image of a CSP data frame.
    pub fn pack_csp(&mut self, packet: &Packet) -> Result<Vec<u8>, UhfError> {
        if packet.data.len() > MAX_CSP_PAYLOAD {
            return Err(UhfError::FrameTooLarge);
        }
        let body_len = FRAME_HEADER_LEN + CSP_ID_LEN + packet.data.len();
        let mut out = Vec::with_capacity(3 + body_len);
        out.put_u8(SYNC0);
        out.put_u8(SYNC1);
        out.put_u8(body_len as u8);
        let header = FrameHeader {
            hwid: self.data_hwid,
            seq: self.data_seq,
            system: SYSTEM_DATA,
            command: 0,
        };
        self.data_seq = self.data_seq.wrapping_add(1);
        header.write_to(&mut out);
        out.put_u32(packet.id.to_word());
        out.extend_from_slice(&packet.data);
        Ok(out)
    }

    /// Full wire image of a command frame.
    pub fn pack_command(&mut self, opcode: u8, args: &[u8]) -> Result<Vec<u8>, UhfError> {
        let body_len = FRAME_HEADER_LEN + args.len();
        if body_len > MAX_FRAME_BODY {
            return Err(UhfError::FrameTooLarge);
        }
        let mut out = Vec::with_capacity(3 + body_len);
        out.put_u8(SYNC0);
        out.put_u8(SYNC1);
        out.put_u8(body_len as u8);
        let header = FrameHeader {
            hwid: self.command_hwid,
            seq: self.command_seq,
            system: SYSTEM_UHF,
            command: opcode,
        };
        self.command_seq = self.command_seq.wrapping_add(1);
        header.write_to(&mut out);
        out.extend_from_slice(args);
        Ok(out)
    }
}

/// Unpack a deframed CSP body into a routable packet. The frame buffer
/// is kept and becomes the packet payload buffer.
pub fn unpack_csp(mut body: PooledBuf) -> Result<(FrameHeader, Packet), UhfError> {
    let (header, id_word) = {
        let mut cur: &[u8] = &body;
        if cur.remaining() < FRAME_HEADER_LEN + CSP_ID_LEN {
            return Err(UhfError::InvalidFrame);
        }
        let header = FrameHeader::read_from(&mut cur)?;
        (header, cur.get_u32())
    };
    body.trim_front(FRAME_HEADER_LEN + CSP_ID_LEN);
    Ok((header, Packet::from_parts(PacketId::from_word(id_word), body)))
}

/// Unpack a deframed command body. The opcode rides in
/// `header.command`; the returned buffer holds only the arguments.
pub fn unpack_command(mut body: PooledBuf) -> Result<(FrameHeader, PooledBuf), UhfError> {
    let header = {
        let mut cur: &[u8] = &body;
        FrameHeader::read_from(&mut cur)?
    };
    body.trim_front(FRAME_HEADER_LEN);
    Ok((header, body))
}
