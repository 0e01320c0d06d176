//! Byte-stream deframer.
//!
//! Recovers frames from an arbitrarily chunked serial stream, one byte
//! at a time, and classifies each completed body as a host command or
//! a CSP data frame. Losing a frame must never lose stream sync: bad
//! lengths re-enter the sync hunt and a dry buffer pool skips the
//! frame while still counting its bytes.

use log::{debug, trace};

use kestrel_csp::{Packet, PacketPool, PooledBuf};

use crate::frame::{self, FrameHeader};
use crate::{FRAME_HEADER_LEN, MAX_FRAME_BODY, SYNC0, SYNC1};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeframerState {
    WaitSync0,
    WaitSync1,
    WaitLength,
    ReceiveData,
}

/// A completed inbound frame.
#[derive(Debug)]
pub enum Deframed {
    /// Host command or response frame, bound for the link controller.
    Command { header: FrameHeader, args: PooledBuf },
    /// CSP data frame, bound for the router.
    Csp(Packet),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DeframerStats {
    /// Bytes discarded while hunting for sync.
    pub sync_discards: u64,
    /// Length bytes outside 1..=251.
    pub bad_lengths: u64,
    /// Frames skipped because no buffer was free.
    pub pool_drops: u64,
    /// Bodies too short to carry anything past the header.
    pub runt_frames: u64,
    /// Bodies whose header or id failed to parse.
    pub header_errors: u64,
    pub command_frames: u64,
    pub csp_frames: u64,
}

pub struct Deframer {
    state: DeframerState,
    pool: PacketPool,
    body: Option<PooledBuf>,
    want: usize,
    got: usize,
    stats: DeframerStats,
}

impl Deframer {
    pub fn new(pool: PacketPool) -> Self {
        Self {
            state: DeframerState::WaitSync0,
            pool,
            body: None,
            want: 0,
            got: 0,
            stats: DeframerStats::default(),
        }
    }

    pub fn reset(&mut self) {
        self.state = DeframerState::WaitSync0;
        self.body = None;
        self.want = 0;
        self.got = 0;
    }

    pub fn stats(&self) -> DeframerStats {
        self.stats
    }

    /// Feed one byte; returns a frame when this byte completes one.
    pub fn feed(&mut self, byte: u8) -> Option<Deframed> {
        match self.state {
            DeframerState::WaitSync0 => {
                if byte == SYNC0 {
                    self.state = DeframerState::WaitSync1;
                } else {
                    self.stats.sync_discards += 1;
                }
                None
            }
            DeframerState::WaitSync1 => {
                match byte {
                    SYNC1 => self.state = DeframerState::WaitLength,
                    // a repeated first sync byte keeps the candidate alive
                    SYNC0 => {}
                    _ => {
                        self.stats.sync_discards += 1;
                        self.state = DeframerState::WaitSync0;
                    }
                }
                None
            }
            DeframerState::WaitLength => {
                let len = byte as usize;
                if len == 0 || len > MAX_FRAME_BODY {
                    // the stray byte may itself precede a real sync pair
                    self.stats.bad_lengths += 1;
                    self.state = DeframerState::WaitSync1;
                    return None;
                }
                self.body = self.pool.try_get();
                if self.body.is_none() {
                    self.stats.pool_drops += 1;
                    debug!("buffer pool dry, skipping {len} frame bytes");
                }
                self.want = len;
                self.got = 0;
                self.state = DeframerState::ReceiveData;
                None
            }
            DeframerState::ReceiveData => {
                if let Some(body) = self.body.as_mut() {
                    // want <= MAX_FRAME_BODY <= buffer capacity
                    let _ = body.push(byte);
                }
                self.got += 1;
                if self.got == self.want {
                    let body = self.body.take();
                    self.state = DeframerState::WaitSync0;
                    return body.and_then(|b| self.complete(b));
                }
                None
            }
        }
    }

    /// Feed a chunk, collecting every frame completed inside it.
    pub fn feed_slice(&mut self, bytes: &[u8], out: &mut Vec<Deframed>) {
        for &byte in bytes {
            if let Some(frame) = self.feed(byte) {
                out.push(frame);
            }
        }
    }

    fn complete(&mut self, body: PooledBuf) -> Option<Deframed> {
        if body.len() <= FRAME_HEADER_LEN {
            self.stats.runt_frames += 1;
            debug!("runt frame ({} bytes) dropped", body.len());
            return None;
        }
        let header = {
            let mut cur: &[u8] = &body;
            match FrameHeader::read_from(&mut cur) {
                Ok(header) => header,
                Err(_) => {
                    self.stats.header_errors += 1;
                    return None;
                }
            }
        };
        if header.is_host_command() {
            self.stats.command_frames += 1;
            let mut args = body;
            args.trim_front(FRAME_HEADER_LEN);
            trace!(
                "command frame {:#04x} seq {} ({} arg bytes)",
                header.command,
                header.seq,
                args.len()
            );
            return Some(Deframed::Command { header, args });
        }
        match frame::unpack_csp(body) {
            Ok((header, packet)) => {
                self.stats.csp_frames += 1;
                trace!("csp frame seq {}: {:?}", header.seq, packet);
                Some(Deframed::Csp(packet))
            }
            Err(_) => {
                self.stats.header_errors += 1;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameCodec;
    use crate::{HWID_RADIO, SYSTEM_UHF};
    use kestrel_csp::{PacketId, Priority};

    fn command_wire(opcode: u8, args: &[u8]) -> Vec<u8> {
        FrameCodec::new(0x0010, HWID_RADIO)
            .pack_command(opcode, args)
            .unwrap()
    }

    fn collect(deframer: &mut Deframer, bytes: &[u8]) -> Vec<Deframed> {
        let mut out = Vec::new();
        deframer.feed_slice(bytes, &mut out);
        out
    }

    #[test]
    fn test_whole_frame_in_one_chunk() {
        let mut deframer = Deframer::new(PacketPool::new(4));
        let frames = collect(&mut deframer, &command_wire(0x01, &[7, 8, 9]));
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Deframed::Command { header, args } => {
                assert_eq!(header.command, 0x01);
                assert_eq!(header.system, SYSTEM_UHF);
                assert_eq!(&args[..], &[7, 8, 9]);
            }
            other => panic!("expected command frame, got {other:?}"),
        }
    }

    #[test]
    fn test_chunk_boundaries_do_not_matter() {
        let mut wire = vec![0x00, 0x22, 0x41, 0x69, 0xFF];
        wire.extend_from_slice(&command_wire(0x0B, &[1, 2, 3, 4]));
        wire.extend_from_slice(&[0x13, 0x37]);

        for chunk_len in 1..=wire.len() {
            let mut deframer = Deframer::new(PacketPool::new(4));
            let mut frames = Vec::new();
            for chunk in wire.chunks(chunk_len) {
                deframer.feed_slice(chunk, &mut frames);
            }
            assert_eq!(frames.len(), 1, "chunk_len {chunk_len}");
            match &frames[0] {
                Deframed::Command { header, args } => {
                    assert_eq!(header.command, 0x0B);
                    assert_eq!(&args[..], &[1, 2, 3, 4]);
                }
                other => panic!("expected command frame, got {other:?}"),
            }
        }
    }

    #[test]
    fn test_invalid_length_rejoins_sync_hunt() {
        let mut deframer = Deframer::new(PacketPool::new(4));
        // zero and oversize lengths are both refused
        assert!(collect(&mut deframer, &[0x22, 0x69, 0x00]).is_empty());
        assert!(collect(&mut deframer, &[0x22, 0x69, 0xFC]).is_empty());
        assert_eq!(deframer.stats().bad_lengths, 2);

        // a following valid frame still parses
        let frames = collect(&mut deframer, &command_wire(0x06, &[9]));
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_bad_length_byte_may_precede_sync() {
        // after a refused length the very next byte can be the second
        // sync byte of a real frame
        let mut wire = vec![0x22, 0x69, 0x00];
        let frame = command_wire(0x06, &[9]);
        wire.extend_from_slice(&frame[1..]);

        let mut deframer = Deframer::new(PacketPool::new(4));
        let frames = collect(&mut deframer, &wire);
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_pool_dry_skips_frame_but_keeps_sync() {
        let pool = PacketPool::new(1);
        let held = pool.try_get().unwrap();
        let mut deframer = Deframer::new(pool);

        let frames = collect(&mut deframer, &command_wire(0x01, &[1]));
        assert!(frames.is_empty());
        assert_eq!(deframer.stats().pool_drops, 1);

        drop(held);
        let frames = collect(&mut deframer, &command_wire(0x01, &[2]));
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_runt_body_dropped() {
        // header-only body carries no opcode arguments or id
        let wire = [0x22, 0x69, 0x06, 0x01, 0x00, 0x00, 0x00, 0x01, 0x04];
        let mut deframer = Deframer::new(PacketPool::new(4));
        let frames = collect(&mut deframer, &wire);
        assert!(frames.is_empty());
        assert_eq!(deframer.stats().runt_frames, 1);

        let buf = deframer.pool.stats();
        assert_eq!(buf.1, 0, "runt drop must return its buffer");
    }

    #[test]
    fn test_csp_frame_routes_through() {
        let pool = PacketPool::new(4);
        let id = PacketId::new(Priority::Normal, 26, 1, 17, 49).unwrap();
        let packet = kestrel_csp::Packet::with_payload(id, &pool, b"ping").unwrap();
        let wire = FrameCodec::new(0x0010, HWID_RADIO)
            .pack_csp(&packet)
            .unwrap();

        let mut deframer = Deframer::new(pool);
        let frames = collect(&mut deframer, &wire);
        assert_eq!(frames.len(), 1);
        match &frames[0] {
            Deframed::Csp(out) => {
                assert_eq!(out.id, id);
                assert_eq!(&out.data[..], b"ping");
            }
            other => panic!("expected csp frame, got {other:?}"),
        }
        assert_eq!(deframer.stats().csp_frames, 1);
    }

    #[test]
    fn test_noise_between_frames_is_counted() {
        let mut wire = command_wire(0x01, &[1]);
        wire.extend_from_slice(&[0xDE, 0xAD, 0xBE]);
        wire.extend_from_slice(&command_wire(0x01, &[2]));

        let mut deframer = Deframer::new(PacketPool::new(4));
        let frames = collect(&mut deframer, &wire);
        assert_eq!(frames.len(), 2);
        assert_eq!(deframer.stats().sync_discards, 3);
    }
}
