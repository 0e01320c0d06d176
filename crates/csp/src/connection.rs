//! Connection and port layer: client-style connect/send, server-style
//! bind/listen/accept, addressed by (node address, port).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, trace, warn};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::packet::{Packet, PacketId, Priority, MAX_ADDRESS, MAX_DATA, MAX_PORT};
use crate::router::Router;
use crate::CspError;

pub const EPHEMERAL_FIRST: u8 = 48;
pub const EPHEMERAL_LAST: u8 = 63;

const CONN_QUEUE_DEPTH: usize = 16;
const ACCEPT_QUEUE_DEPTH: usize = 8;

/// (local_port, remote_addr, remote_port)
type PeerKey = (u8, u8, u8);

pub(crate) struct PendingConn {
    remote_addr: u8,
    remote_port: u8,
    rx: mpsc::Receiver<Packet>,
}

/// Demultiplexes inbound packets onto active conversations and listening
/// ports. Unbound destinations are counted and the packet is dropped,
/// which releases its buffer.
pub(crate) struct PortTable {
    conns: Mutex<HashMap<PeerKey, mpsc::Sender<Packet>>>,
    listeners: Mutex<HashMap<u8, mpsc::Sender<PendingConn>>>,
    no_port_drops: AtomicU64,
    queue_drops: AtomicU64,
}

impl PortTable {
    pub(crate) fn new() -> Self {
        Self {
            conns: Mutex::new(HashMap::new()),
            listeners: Mutex::new(HashMap::new()),
            no_port_drops: AtomicU64::new(0),
            queue_drops: AtomicU64::new(0),
        }
    }

    pub(crate) fn deliver(&self, packet: Packet) {
        let key = (packet.id.dport, packet.id.src, packet.id.sport);

        let conn_tx = {
            let conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
            conns.get(&key).cloned()
        };
        if let Some(tx) = conn_tx {
            if tx.try_send(packet).is_err() {
                self.queue_drops.fetch_add(1, Ordering::Relaxed);
                warn!("inbound queue full on port {}, packet dropped", key.0);
            }
            return;
        }

        let listener_tx = {
            let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners.get(&packet.id.dport).cloned()
        };
        if let Some(listener_tx) = listener_tx {
            let (tx, rx) = mpsc::channel(CONN_QUEUE_DEPTH);
            let pending = PendingConn {
                remote_addr: key.1,
                remote_port: key.2,
                rx,
            };
            // fresh queue, the first packet always fits
            let _ = tx.try_send(packet);
            {
                let mut conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
                conns.insert(key, tx);
            }
            if listener_tx.try_send(pending).is_err() {
                let mut conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
                conns.remove(&key);
                self.queue_drops.fetch_add(1, Ordering::Relaxed);
                warn!("accept backlog full on port {}, peer dropped", key.0);
            }
            return;
        }

        self.no_port_drops.fetch_add(1, Ordering::Relaxed);
        debug!(
            "no port bound for {}:{} -> port {}",
            packet.id.src, packet.id.sport, packet.id.dport
        );
    }

    fn open_ephemeral(
        &self,
        remote_addr: u8,
        remote_port: u8,
    ) -> Result<(u8, mpsc::Receiver<Packet>), CspError> {
        let listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        let mut conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        for port in EPHEMERAL_FIRST..=EPHEMERAL_LAST {
            let key = (port, remote_addr, remote_port);
            if listeners.contains_key(&port) || conns.contains_key(&key) {
                continue;
            }
            let (tx, rx) = mpsc::channel(CONN_QUEUE_DEPTH);
            conns.insert(key, tx);
            return Ok((port, rx));
        }
        Err(CspError::PortsExhausted)
    }

    fn bind(&self, port: u8) -> Result<mpsc::Receiver<PendingConn>, CspError> {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if listeners.contains_key(&port) {
            return Err(CspError::PortInUse);
        }
        let (tx, rx) = mpsc::channel(ACCEPT_QUEUE_DEPTH);
        listeners.insert(port, tx);
        Ok(rx)
    }

    fn unbind(&self, port: u8) {
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        listeners.remove(&port);
    }

    fn close(&self, key: PeerKey) {
        let mut conns = self.conns.lock().unwrap_or_else(|e| e.into_inner());
        conns.remove(&key);
    }

    /// (no_port_drops, queue_drops)
    pub(crate) fn stats(&self) -> (u64, u64) {
        (
            self.no_port_drops.load(Ordering::Relaxed),
            self.queue_drops.load(Ordering::Relaxed),
        )
    }
}

/// One logical exchange with a remote (address, port). Dropping the
/// connection releases its local port entry.
pub struct Connection {
    router: Arc<Router>,
    priority: Priority,
    local_port: u8,
    remote_addr: u8,
    remote_port: u8,
    rx: mpsc::Receiver<Packet>,
    timeout: Duration,
}

impl Connection {
    pub fn local_port(&self) -> u8 {
        self.local_port
    }

    pub fn remote_addr(&self) -> u8 {
        self.remote_addr
    }

    pub fn remote_port(&self) -> u8 {
        self.remote_port
    }

    pub async fn send(&self, payload: &[u8]) -> Result<(), CspError> {
        let id = PacketId::new(
            self.priority,
            self.router.local_addr(),
            self.remote_addr,
            self.remote_port,
            self.local_port,
        )?;
        let packet = Packet::with_payload(id, self.router.pool(), payload)?;
        trace!("conn send {:?}", packet);
        self.router.send(packet).await
    }

    /// Caller-side fragmentation: split `data` into MTU-sized packets,
    /// in order. Returns the number of packets sent.
    pub async fn send_chunked(&self, data: &[u8], mtu: usize) -> Result<usize, CspError> {
        let chunk = mtu.min(MAX_DATA);
        if chunk == 0 {
            return Err(CspError::PayloadTooLarge);
        }
        let mut sent = 0;
        for part in data.chunks(chunk) {
            self.send(part).await?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Wait up to the connection timeout for the next inbound packet.
    pub async fn recv(&mut self) -> Result<Packet, CspError> {
        match timeout(self.timeout, self.rx.recv()).await {
            Ok(Some(packet)) => Ok(packet),
            Ok(None) => Err(CspError::ConnectionClosed),
            Err(_) => Err(CspError::Timeout),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.router
            .ports()
            .close((self.local_port, self.remote_addr, self.remote_port));
    }
}

/// Server side of the port layer; each new remote peer on the bound port
/// materializes one `Connection` through `accept`.
pub struct Listener {
    router: Arc<Router>,
    port: u8,
    accept_rx: mpsc::Receiver<PendingConn>,
    conn_timeout: Duration,
}

impl Listener {
    pub fn port(&self) -> u8 {
        self.port
    }

    pub async fn accept(&mut self) -> Result<Connection, CspError> {
        let pending = self
            .accept_rx
            .recv()
            .await
            .ok_or(CspError::ConnectionClosed)?;
        debug!(
            "accepted {}:{} on port {}",
            pending.remote_addr, pending.remote_port, self.port
        );
        Ok(Connection {
            router: self.router.clone(),
            priority: Priority::Normal,
            local_port: self.port,
            remote_addr: pending.remote_addr,
            remote_port: pending.remote_port,
            rx: pending.rx,
            timeout: self.conn_timeout,
        })
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.router.ports().unbind(self.port);
    }
}

/// Open a client connection to `(dst, dport)` with an ephemeral local
/// port. `conn_timeout` bounds each `recv` on the returned connection.
pub fn connect(
    router: &Arc<Router>,
    priority: Priority,
    dst: u8,
    dport: u8,
    conn_timeout: Duration,
) -> Result<Connection, CspError> {
    if dst > MAX_ADDRESS || dport > MAX_PORT {
        return Err(CspError::InvalidAddress);
    }
    let (local_port, rx) = router.ports().open_ephemeral(dst, dport)?;
    Ok(Connection {
        router: router.clone(),
        priority,
        local_port,
        remote_addr: dst,
        remote_port: dport,
        rx,
        timeout: conn_timeout,
    })
}

/// Bind a port and listen for inbound peers.
pub fn bind_listen(
    router: &Arc<Router>,
    port: u8,
    conn_timeout: Duration,
) -> Result<Listener, CspError> {
    if port > MAX_PORT {
        return Err(CspError::InvalidAddress);
    }
    let accept_rx = router.ports().bind(port)?;
    Ok(Listener {
        router: router.clone(),
        port,
        accept_rx,
        conn_timeout,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PacketPool;
    use crate::{addr, port};

    fn test_router() -> Arc<Router> {
        Router::new(addr::OBC, PacketPool::new(16))
    }

    #[tokio::test]
    async fn test_local_round_trip() {
        let router = test_router();
        let mut listener =
            bind_listen(&router, port::UHF_DATA, Duration::from_millis(200)).unwrap();
        let mut client = connect(
            &router,
            Priority::Normal,
            addr::OBC,
            port::UHF_DATA,
            Duration::from_millis(200),
        )
        .unwrap();

        client.send(b"ping").await.unwrap();
        let mut server = listener.accept().await.unwrap();
        let inbound = server.recv().await.unwrap();
        assert_eq!(&inbound.data[..], b"ping");
        assert_eq!(inbound.id.sport, client.local_port());
        drop(inbound);

        server.send(b"pong").await.unwrap();
        let reply = client.recv().await.unwrap();
        assert_eq!(&reply.data[..], b"pong");
    }

    #[tokio::test]
    async fn test_send_chunked_order_and_sizes() {
        let router = test_router();
        let mut listener =
            bind_listen(&router, port::BACKDOOR, Duration::from_millis(200)).unwrap();
        let client = connect(
            &router,
            Priority::Normal,
            addr::OBC,
            port::BACKDOOR,
            Duration::from_millis(200),
        )
        .unwrap();

        let data: Vec<u8> = (0..600).map(|i| (i % 251) as u8).collect();
        let sent = client.send_chunked(&data, MAX_DATA).await.unwrap();
        assert_eq!(sent, 3);

        let mut server = listener.accept().await.unwrap();
        let mut reassembled = Vec::new();
        let mut sizes = Vec::new();
        for _ in 0..3 {
            let packet = server.recv().await.unwrap();
            sizes.push(packet.data.len());
            reassembled.extend_from_slice(&packet.data);
        }
        assert_eq!(sizes, vec![241, 241, 118]);
        assert_eq!(reassembled, data);
    }

    #[tokio::test]
    async fn test_ephemeral_exhaustion() {
        let router = test_router();
        let mut held = Vec::new();
        for _ in 0..=(EPHEMERAL_LAST - EPHEMERAL_FIRST) {
            held.push(
                connect(
                    &router,
                    Priority::Normal,
                    addr::UHF,
                    port::UHF_CONTROL,
                    Duration::from_millis(50),
                )
                .unwrap(),
            );
        }
        let result = connect(
            &router,
            Priority::Normal,
            addr::UHF,
            port::UHF_CONTROL,
            Duration::from_millis(50),
        );
        assert!(matches!(result, Err(CspError::PortsExhausted)));

        // closing one frees its port
        held.pop();
        assert!(connect(
            &router,
            Priority::Normal,
            addr::UHF,
            port::UHF_CONTROL,
            Duration::from_millis(50),
        )
        .is_ok());
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let router = test_router();
        let _listener = bind_listen(&router, port::BEACON, Duration::from_millis(50)).unwrap();
        assert!(matches!(
            bind_listen(&router, port::BEACON, Duration::from_millis(50)),
            Err(CspError::PortInUse)
        ));
    }

    #[tokio::test]
    async fn test_recv_timeout() {
        let router = test_router();
        let mut client = connect(
            &router,
            Priority::Normal,
            addr::OBC,
            port::UHF_DATA,
            Duration::from_millis(20),
        )
        .unwrap();
        assert!(matches!(client.recv().await, Err(CspError::Timeout)));
    }

    #[tokio::test]
    async fn test_unbound_port_drop_returns_buffer() {
        let router = test_router();
        let pool = router.pool().clone();
        let id = PacketId::new(Priority::Normal, addr::GROUND, addr::OBC, 40, 41).unwrap();
        let packet = Packet::with_payload(id, &pool, b"stray").unwrap();
        router.send(packet).await.unwrap();
        assert_eq!(router.ports().stats().0, 1);
        assert_eq!(pool.stats().1, 0);
    }
}
