//! Serial link abstraction.
//!
//! The transport driver talks to the radio through [`SerialLink`] so
//! the same code runs against a UART device handle, the TCP backdoor
//! socket, an in-memory duplex in tests, or the simulated channel with
//! radio-grade impairments.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;

use crate::{UhfError, MAX_FRAME_BODY};

/// Largest write the link accepts: a full frame plus its preamble.
pub const MAX_WIRE_FRAME: usize = MAX_FRAME_BODY + 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Up,
    Down,
}

#[async_trait]
pub trait SerialLink: Send + Sync {
    /// Read whatever is available; 0 means the peer closed.
    async fn read(&self, buf: &mut [u8]) -> Result<usize, UhfError>;

    async fn write(&self, data: &[u8]) -> Result<(), UhfError>;

    fn state(&self) -> LinkState;
}

/// Any async byte stream as a serial link.
pub struct StreamLink<T> {
    reader: Mutex<ReadHalf<T>>,
    writer: Mutex<WriteHalf<T>>,
}

impl<T: AsyncRead + AsyncWrite + Send + 'static> StreamLink<T> {
    pub fn new(stream: T) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
        }
    }
}

#[async_trait]
impl<T: AsyncRead + AsyncWrite + Send + 'static> SerialLink for StreamLink<T> {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, UhfError> {
        let mut reader = self.reader.lock().await;
        reader.read(buf).await.map_err(|_| UhfError::LinkClosed)
    }

    async fn write(&self, data: &[u8]) -> Result<(), UhfError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await.map_err(|_| UhfError::LinkClosed)
    }

    fn state(&self) -> LinkState {
        LinkState::Up
    }
}

/// Channel impairments for the simulated link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelParams {
    pub bandwidth_bps: u32,
    /// Chance that a written frame never arrives.
    pub frame_loss: f32,
    pub latency: Duration,
    pub latency_jitter: Duration,
}

impl Default for ChannelParams {
    fn default() -> Self {
        Self {
            bandwidth_bps: 9600,
            frame_loss: 0.0,
            latency: Duration::from_millis(20),
            latency_jitter: Duration::from_millis(5),
        }
    }
}

#[derive(Debug, Default)]
struct LinkStats {
    frames_sent: u64,
    frames_dropped: u64,
    bytes_sent: u64,
}

struct Inbound {
    rx: mpsc::Receiver<Vec<u8>>,
    leftover: Vec<u8>,
}

/// One end of an in-process UART pair. Writes pay serialization time
/// for the configured bandwidth, then propagation latency with jitter,
/// and may be lost outright. A lost frame still returns `Ok`: the
/// radio has no way of knowing nobody heard it.
pub struct SimulatedLink {
    params: ChannelParams,
    peer_tx: mpsc::Sender<Vec<u8>>,
    inbound: Mutex<Inbound>,
    stats: Arc<Mutex<LinkStats>>,
}

impl SimulatedLink {
    pub fn pair(params: ChannelParams) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(64);
        let (b_tx, b_rx) = mpsc::channel(64);
        (
            Self::endpoint(params.clone(), b_tx, a_rx),
            Self::endpoint(params, a_tx, b_rx),
        )
    }

    fn endpoint(
        params: ChannelParams,
        peer_tx: mpsc::Sender<Vec<u8>>,
        rx: mpsc::Receiver<Vec<u8>>,
    ) -> Self {
        Self {
            params,
            peer_tx,
            inbound: Mutex::new(Inbound {
                rx,
                leftover: Vec::new(),
            }),
            stats: Arc::new(Mutex::new(LinkStats::default())),
        }
    }

    /// Serialization delay, propagation delay, then the loss dice.
    /// Returns false when the frame is lost.
    async fn impair(&self, len: usize) -> bool {
        if self.params.bandwidth_bps > 0 {
            let serialization =
                Duration::from_secs_f64((len * 8) as f64 / self.params.bandwidth_bps as f64);
            sleep(serialization).await;
        }
        let jitter_ms = self.params.latency_jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };
        sleep(self.params.latency + jitter).await;
        !(self.params.frame_loss > 0.0 && rand::rng().random::<f32>() < self.params.frame_loss)
    }

    /// (frames_sent, frames_dropped, bytes_sent)
    pub async fn get_stats(&self) -> (u64, u64, u64) {
        let stats = self.stats.lock().await;
        (stats.frames_sent, stats.frames_dropped, stats.bytes_sent)
    }
}

#[async_trait]
impl SerialLink for SimulatedLink {
    async fn read(&self, buf: &mut [u8]) -> Result<usize, UhfError> {
        let mut inbound = self.inbound.lock().await;
        if inbound.leftover.is_empty() {
            match inbound.rx.recv().await {
                Some(chunk) => inbound.leftover = chunk,
                None => return Ok(0),
            }
        }
        let n = inbound.leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&inbound.leftover[..n]);
        inbound.leftover.drain(..n);
        Ok(n)
    }

    async fn write(&self, data: &[u8]) -> Result<(), UhfError> {
        if data.len() > MAX_WIRE_FRAME {
            return Err(UhfError::FrameTooLarge);
        }
        if !self.impair(data.len()).await {
            let mut stats = self.stats.lock().await;
            stats.frames_dropped += 1;
            debug!("simulated channel lost a {} byte frame", data.len());
            return Ok(());
        }
        {
            let mut stats = self.stats.lock().await;
            stats.frames_sent += 1;
            stats.bytes_sent += data.len() as u64;
        }
        self.peer_tx
            .send(data.to_vec())
            .await
            .map_err(|_| UhfError::LinkClosed)
    }

    fn state(&self) -> LinkState {
        if self.peer_tx.is_closed() {
            LinkState::Down
        } else {
            LinkState::Up
        }
    }
}
