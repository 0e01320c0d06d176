//! CSP-style network layer for the Kestrel on-board computer

use thiserror::Error;

pub mod connection;
pub mod packet;
pub mod pool;
pub mod router;

pub use connection::{bind_listen, connect, Connection, Listener};
pub use packet::{Packet, PacketId, Priority, MAX_DATA};
pub use pool::{PacketPool, PooledBuf, BUFFER_SIZE};
pub use router::{Interface, Route, Router};

/// Node addresses used across the bus. CSP addresses are 5 bits wide.
pub mod addr {
    pub const OBC: u8 = 1;
    pub const UHF: u8 = 5;
    pub const GROUND: u8 = 26;
}

/// Well-known ports. CSP ports are 6 bits wide; 48..=63 are ephemeral.
pub mod port {
    pub const UHF_CONTROL: u8 = 16;
    pub const UHF_DATA: u8 = 17;
    pub const BACKDOOR: u8 = 18;
    pub const BEACON: u8 = 19;
}

#[derive(Debug, Error)]
pub enum CspError {
    #[error("No route to destination address")]
    RouteNotFound,

    #[error("Outbound interface busy")]
    Busy,

    #[error("Packet buffer pool exhausted")]
    PoolExhausted,

    #[error("Payload exceeds buffer capacity")]
    PayloadTooLarge,

    #[error("Address or port out of range")]
    InvalidAddress,

    #[error("Port already bound")]
    PortInUse,

    #[error("No free ephemeral port")]
    PortsExhausted,

    #[error("Timed out waiting for data")]
    Timeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Link down")]
    LinkDown,
}
