//! UHF transport driver.
//!
//! Owns the serial link. The receive task feeds every byte through the
//! deframer and forwards completed frames: command frames to the
//! controller queue, CSP frames to the router. The transmit task
//! drains a bounded outbound queue through the single-permit transmit
//! gate; the line is half duplex and only one frame may be on it.

use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use kestrel_csp::{CspError, Interface, Packet, PacketPool, Router};

use crate::controller::Event;
use crate::frame::FrameCodec;
use crate::framer::{Deframed, Deframer};
use crate::serial::SerialLink;
use crate::{UhfConfig, UhfError, MAX_CSP_PAYLOAD};

const RX_CHUNK: usize = 64;

#[derive(Debug, Default)]
struct TransportStats {
    frames_tx: u64,
    bytes_tx: u64,
    tx_timeouts: u64,
    enqueue_timeouts: u64,
}

pub struct UhfTransport {
    codec: std::sync::Mutex<FrameCodec>,
    outbound: mpsc::Sender<Vec<u8>>,
    tx_gate: Arc<Semaphore>,
    tx_timeout: Duration,
    stats: Arc<Mutex<TransportStats>>,
}

impl UhfTransport {
    /// Wire up the driver tasks around a serial link. Returns the
    /// transport handle and the spawned task handles.
    pub fn start(
        link: Arc<dyn SerialLink>,
        router: Arc<Router>,
        event_tx: mpsc::Sender<Event>,
        pool: PacketPool,
        config: &UhfConfig,
    ) -> (Arc<Self>, Vec<JoinHandle<()>>) {
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_depth);
        let transport = Arc::new(Self {
            codec: std::sync::Mutex::new(FrameCodec::new(config.data_hwid, config.command_hwid)),
            outbound,
            tx_gate: Arc::new(Semaphore::new(1)),
            tx_timeout: config.tx_timeout,
            stats: Arc::new(Mutex::new(TransportStats::default())),
        });

        let rx = tokio::spawn(rx_task(link.clone(), router, event_tx, pool));
        let tx = tokio::spawn(tx_task(
            link,
            outbound_rx,
            transport.tx_gate.clone(),
            config.tx_timeout,
            transport.stats.clone(),
        ));
        (transport, vec![rx, tx])
    }

    /// Pack one CSP packet and queue it for transmission, waiting up
    /// to the transmit timeout for queue space.
    pub async fn send_packet(&self, packet: &Packet) -> Result<(), UhfError> {
        let wire = {
            let mut codec = self.codec.lock().unwrap_or_else(|e| e.into_inner());
            codec.pack_csp(packet)?
        };
        self.enqueue(wire).await
    }

    /// Pack one command frame and queue it for transmission.
    pub async fn send_command(&self, opcode: u8, args: &[u8]) -> Result<(), UhfError> {
        let wire = {
            let mut codec = self.codec.lock().unwrap_or_else(|e| e.into_inner());
            codec.pack_command(opcode, args)?
        };
        trace!("queue command {opcode:#04x} ({} wire bytes)", wire.len());
        self.enqueue(wire).await
    }

    async fn enqueue(&self, wire: Vec<u8>) -> Result<(), UhfError> {
        match timeout(self.tx_timeout, self.outbound.send(wire)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(UhfError::LinkClosed),
            Err(_) => {
                let mut stats = self.stats.lock().await;
                stats.enqueue_timeouts += 1;
                Err(UhfError::Busy)
            }
        }
    }

    /// (frames_tx, bytes_tx, tx_timeouts, enqueue_timeouts)
    pub async fn get_stats(&self) -> (u64, u64, u64, u64) {
        let stats = self.stats.lock().await;
        (
            stats.frames_tx,
            stats.bytes_tx,
            stats.tx_timeouts,
            stats.enqueue_timeouts,
        )
    }
}

async fn rx_task(
    link: Arc<dyn SerialLink>,
    router: Arc<Router>,
    event_tx: mpsc::Sender<Event>,
    pool: PacketPool,
) {
    info!("uhf receive task started");
    let mut deframer = Deframer::new(pool);
    let mut buf = [0u8; RX_CHUNK];
    let mut frames = Vec::new();
    'read: loop {
        let n = match link.read(&mut buf).await {
            Ok(0) => {
                warn!("serial link closed, receive task exiting");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                error!("serial read failed: {e}");
                break;
            }
        };
        deframer.feed_slice(&buf[..n], &mut frames);
        for frame in frames.drain(..) {
            match frame {
                Deframed::Command { header, args } => {
                    if event_tx.send(Event::FrameReceived { header, args }).await.is_err() {
                        warn!("controller queue closed, receive task exiting");
                        break 'read;
                    }
                }
                Deframed::Csp(packet) => {
                    if let Err(e) = router.send(packet).await {
                        debug!("inbound packet not routed: {e}");
                    }
                }
            }
        }
    }
    let stats = deframer.stats();
    info!(
        "uhf receive task stopped ({} csp, {} command, {} dropped)",
        stats.csp_frames,
        stats.command_frames,
        stats.pool_drops + stats.runt_frames + stats.header_errors
    );
}

async fn tx_task(
    link: Arc<dyn SerialLink>,
    mut outbound_rx: mpsc::Receiver<Vec<u8>>,
    tx_gate: Arc<Semaphore>,
    tx_timeout: Duration,
    stats: Arc<Mutex<TransportStats>>,
) {
    info!("uhf transmit task started");
    while let Some(wire) = outbound_rx.recv().await {
        let permit = match timeout(tx_timeout, tx_gate.acquire()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => break,
            Err(_) => {
                warn!("transmit path held past {tx_timeout:?}, frame dropped");
                let mut stats = stats.lock().await;
                stats.tx_timeouts += 1;
                continue;
            }
        };
        trace!(
            "tx {} bytes: {}",
            wire.len(),
            hex::encode(&wire[..wire.len().min(16)])
        );
        let result = link.write(&wire).await;
        drop(permit);
        if let Err(e) = result {
            error!("serial write failed: {e}");
            break;
        }
        let mut stats = stats.lock().await;
        stats.frames_tx += 1;
        stats.bytes_tx += wire.len() as u64;
    }
    info!("uhf transmit task stopped");
}

/// Router-facing adapter for the UHF data pipe.
pub struct UhfInterface {
    transport: Arc<UhfTransport>,
}

impl UhfInterface {
    pub fn new(transport: Arc<UhfTransport>) -> Arc<Self> {
        Arc::new(Self { transport })
    }
}

#[async_trait]
impl Interface for UhfInterface {
    fn name(&self) -> &str {
        "uhf"
    }

    fn mtu(&self) -> usize {
        MAX_CSP_PAYLOAD
    }

    async fn tx(&self, packet: Packet) -> Result<(), CspError> {
        match self.transport.send_packet(&packet).await {
            Ok(()) => Ok(()),
            Err(UhfError::Busy) => Err(CspError::Busy),
            Err(UhfError::FrameTooLarge) => Err(CspError::PayloadTooLarge),
            Err(_) => Err(CspError::LinkDown),
        }
    }
}
