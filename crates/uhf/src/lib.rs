//! UHF radio link layer for the Kestrel on-board computer.
//!
//! Everything that sits between the CSP router and the half-duplex
//! serial line to the transceiver lives here: the wire frame codec,
//! the byte-stream deframer, the transmit/receive driver tasks, and
//! the link controller that services host commands, beaconing and
//! telemetry collection.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod command;
pub mod controller;
pub mod correlator;
pub mod frame;
pub mod framer;
pub mod ipc;
pub mod serial;
pub mod timers;
pub mod transport;

pub use controller::{Controller, ControllerContext, Event};
pub use correlator::{CmdStatus, Correlator};
pub use frame::{FrameCodec, FrameHeader};
pub use framer::{Deframed, Deframer};
pub use serial::{ChannelParams, LinkState, SerialLink, SimulatedLink, StreamLink};
pub use timers::{TimerConfig, TimerId, TimerSet};
pub use transport::{UhfInterface, UhfTransport};

/// First and second sync bytes of every frame on the wire.
pub const SYNC0: u8 = 0x22;
pub const SYNC1: u8 = 0x69;

/// Largest value the length byte may carry.
pub const MAX_FRAME_BODY: usize = 251;

/// hwid + sequence + system + command.
pub const FRAME_HEADER_LEN: usize = 6;

/// Big-endian extended CSP id carried by data frames.
pub const CSP_ID_LEN: usize = 4;

/// Largest CSP payload once the frame header and extended id are paid for.
pub const MAX_CSP_PAYLOAD: usize = MAX_FRAME_BODY - FRAME_HEADER_LEN - CSP_ID_LEN;

/// Hardware ids reserved for the host command path.
pub const HWID_OBC: u16 = 0x0000;
pub const HWID_RADIO: u16 = 0x0001;
pub const HWID_BCAST: u16 = 0xFFFF;

/// `system` byte values: 1 is the command/response path, 0 the data pipe.
pub const SYSTEM_UHF: u8 = 1;
pub const SYSTEM_DATA: u8 = 0;

#[derive(Debug, Error)]
pub enum UhfError {
    #[error("Frame too large for the wire format")]
    FrameTooLarge,

    #[error("Malformed frame")]
    InvalidFrame,

    #[error("Transmit path busy")]
    Busy,

    #[error("Serial link closed")]
    LinkClosed,

    #[error("Unknown IPC message id {0:#06x}")]
    UnknownMessage(u16),

    #[error("IPC payload too short")]
    ShortIpcPayload,
}

/// Link-layer settings. Loaded from JSON by the simulator, defaulted
/// on the flight build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UhfConfig {
    /// Hardware id stamped into outbound CSP data frames.
    pub data_hwid: u16,
    /// Hardware id stamped into outbound command frames.
    pub command_hwid: u16,
    /// Longest wait for the transmit path before a send is refused.
    pub tx_timeout: Duration,
    /// Response deadline for an issued radio command.
    pub command_timeout: Duration,
    /// Resend attempts before a pending command is abandoned.
    pub command_retries: u8,
    /// Depth of the outbound frame queue.
    pub outbound_depth: usize,
}

impl Default for UhfConfig {
    fn default() -> Self {
        Self {
            data_hwid: 0x0010,
            command_hwid: HWID_RADIO,
            tx_timeout: Duration::from_millis(1000),
            command_timeout: Duration::from_millis(2000),
            command_retries: 2,
            outbound_depth: 32,
        }
    }
}
