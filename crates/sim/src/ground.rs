//! Emulated transceiver and ground station.
//!
//! Sits on the far end of the serial line and plays the radio: answers
//! command frames with canned firmware responses and records every CSP
//! frame the spacecraft downlinks. Responses can be switched off to
//! play a hung radio.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, trace};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use kestrel_csp::{port, PacketId, PacketPool};
use kestrel_uhf::command::opcode;
use kestrel_uhf::frame::FrameCodec;
use kestrel_uhf::framer::{Deframed, Deframer};
use kestrel_uhf::serial::SerialLink;
use kestrel_uhf::HWID_RADIO;

/// A recorded CSP frame with its arrival offset.
#[derive(Debug, Clone)]
pub struct CspRecord {
    pub id: PacketId,
    pub data: Vec<u8>,
    pub at_ms: u64,
}

#[derive(Debug, Clone, Default)]
pub struct GroundLog {
    pub beacons: Vec<CspRecord>,
    pub downlink: Vec<CspRecord>,
    pub commands_seen: Vec<u8>,
}

/// Firmware reply table.
fn canned_response(op: u8) -> Option<(u8, Vec<u8>)> {
    match op {
        opcode::REBOOT | opcode::SET_TIME | opcode::SET_CALLSIGN | opcode::SET_BEACON => {
            Some((opcode::ACK, vec![0x00]))
        }
        opcode::GET_TIME => Some((opcode::TIME, 1_756_500_000u32.to_le_bytes().to_vec())),
        opcode::GET_CALLSIGN => Some((opcode::CALLSIGN, b"VA6KST".to_vec())),
        opcode::GET_TELEMETRY => {
            // temp, rssi, battery bus voltage, tx count
            Some((opcode::TELEMETRY, vec![0x1A, 0x9C, 0x0E, 0x42]))
        }
        opcode::GET_BEACON => Some((opcode::BEACON, b"KESTREL".to_vec())),
        opcode::RANGING => Some((opcode::RANGE_ACK, vec![0x00])),
        opcode::BOOT_PING | opcode::WRITE_PAGE | opcode::ERASE => {
            Some((opcode::BOOT_ACK, vec![0x00]))
        }
        _ => None,
    }
}

pub struct RadioEmulator {
    link: Arc<dyn SerialLink>,
    codec: Mutex<FrameCodec>,
    log: Arc<Mutex<GroundLog>>,
    answering: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl RadioEmulator {
    pub fn start(link: Arc<dyn SerialLink>) -> Self {
        let log = Arc::new(Mutex::new(GroundLog::default()));
        let answering = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(run(link.clone(), log.clone(), answering.clone()));
        Self {
            link,
            codec: Mutex::new(FrameCodec::new(0x0010, HWID_RADIO)),
            log,
            answering,
            handle,
        }
    }

    /// Stop or resume answering command frames.
    pub fn set_answering(&self, on: bool) {
        self.answering.store(on, Ordering::Relaxed);
    }

    /// Push an unsolicited command frame up the line, as the radio
    /// firmware does with autonomous telemetry.
    pub async fn uplink_command(&self, op: u8, args: &[u8]) {
        let wire = {
            let mut codec = self.codec.lock().await;
            match codec.pack_command(op, args) {
                Ok(wire) => wire,
                Err(e) => {
                    debug!("uplink command refused: {e}");
                    return;
                }
            }
        };
        let _ = self.link.write(&wire).await;
    }

    pub async fn snapshot(&self) -> GroundLog {
        self.log.lock().await.clone()
    }
}

impl Drop for RadioEmulator {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn run(link: Arc<dyn SerialLink>, log: Arc<Mutex<GroundLog>>, answering: Arc<AtomicBool>) {
    let started = Instant::now();
    let mut deframer = Deframer::new(PacketPool::new(16));
    let mut codec = FrameCodec::new(0x0010, HWID_RADIO);
    let mut buf = [0u8; 64];
    let mut frames = Vec::new();
    loop {
        let n = match link.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        deframer.feed_slice(&buf[..n], &mut frames);
        for frame in frames.drain(..) {
            match frame {
                Deframed::Command { header, .. } => {
                    trace!("radio saw command {:#04x}", header.command);
                    {
                        let mut log = log.lock().await;
                        log.commands_seen.push(header.command);
                    }
                    if !answering.load(Ordering::Relaxed) {
                        continue;
                    }
                    if let Some((op, reply)) = canned_response(header.command) {
                        if let Ok(wire) = codec.pack_command(op, &reply) {
                            let _ = link.write(&wire).await;
                        }
                    }
                }
                Deframed::Csp(packet) => {
                    let record = CspRecord {
                        id: packet.id,
                        data: packet.data.to_vec(),
                        at_ms: started.elapsed().as_millis() as u64,
                    };
                    let mut log = log.lock().await;
                    if record.id.dport == port::BEACON {
                        log.beacons.push(record);
                    } else {
                        log.downlink.push(record);
                    }
                }
            }
        }
    }
}
