//! Static routing between the local port table and outgoing interfaces

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, trace, warn};
use tokio::sync::RwLock;

use crate::connection::PortTable;
use crate::packet::Packet;
use crate::pool::PacketPool;
use crate::CspError;

/// An outgoing interface. Implementations own their transmit path and
/// apply their own backpressure policy behind `tx`.
#[async_trait]
pub trait Interface: Send + Sync {
    fn name(&self) -> &str;

    fn mtu(&self) -> usize;

    async fn tx(&self, packet: Packet) -> Result<(), CspError>;
}

pub struct Route {
    pub iface: Arc<dyn Interface>,
    pub via: Option<u8>,
}

/// Exact-match destination table, built once at startup. Packets for the
/// local address go to the port table instead of an interface.
pub struct Router {
    local_addr: u8,
    pool: PacketPool,
    routes: RwLock<HashMap<u8, Route>>,
    ports: Arc<PortTable>,
    sent: AtomicU64,
    delivered_local: AtomicU64,
    route_misses: AtomicU64,
}

impl Router {
    pub fn new(local_addr: u8, pool: PacketPool) -> Arc<Self> {
        Arc::new(Self {
            local_addr,
            pool,
            routes: RwLock::new(HashMap::new()),
            ports: Arc::new(PortTable::new()),
            sent: AtomicU64::new(0),
            delivered_local: AtomicU64::new(0),
            route_misses: AtomicU64::new(0),
        })
    }

    pub fn local_addr(&self) -> u8 {
        self.local_addr
    }

    pub fn pool(&self) -> &PacketPool {
        &self.pool
    }

    pub(crate) fn ports(&self) -> &Arc<PortTable> {
        &self.ports
    }

    /// Install or overwrite the route for one destination address.
    pub async fn route_set(&self, dst: u8, iface: Arc<dyn Interface>, via: Option<u8>) {
        debug!(
            "route {} -> {} (via {:?})",
            dst,
            iface.name(),
            via
        );
        self.routes.write().await.insert(dst, Route { iface, via });
    }

    /// Route one packet: local destinations are handed to the port
    /// table, everything else goes out the matching interface. A missing
    /// route is the caller's problem, never a silent drop.
    pub async fn send(&self, packet: Packet) -> Result<(), CspError> {
        if packet.id.dst == self.local_addr {
            self.delivered_local.fetch_add(1, Ordering::Relaxed);
            self.ports.deliver(packet);
            return Ok(());
        }

        let routes = self.routes.read().await;
        let route = match routes.get(&packet.id.dst) {
            Some(route) => route,
            None => {
                self.route_misses.fetch_add(1, Ordering::Relaxed);
                warn!("no route to address {}", packet.id.dst);
                return Err(CspError::RouteNotFound);
            }
        };

        match route.via {
            Some(via) => trace!(
                "tx {:?} on {} via {}",
                packet,
                route.iface.name(),
                via
            ),
            None => trace!("tx {:?} on {}", packet, route.iface.name()),
        }

        self.sent.fetch_add(1, Ordering::Relaxed);
        route.iface.tx(packet).await
    }

    /// (sent, delivered_local, route_misses)
    pub fn stats(&self) -> (u64, u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.delivered_local.load(Ordering::Relaxed),
            self.route_misses.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{PacketId, Priority};
    use tokio::sync::Mutex;

    struct CaptureInterface {
        captured: Mutex<Vec<Packet>>,
    }

    impl CaptureInterface {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                captured: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Interface for CaptureInterface {
        fn name(&self) -> &str {
            "capture"
        }

        fn mtu(&self) -> usize {
            241
        }

        async fn tx(&self, packet: Packet) -> Result<(), CspError> {
            self.captured.lock().await.push(packet);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_send_follows_route() {
        let pool = PacketPool::new(4);
        let router = Router::new(1, pool.clone());
        let iface = CaptureInterface::new();
        router.route_set(5, iface.clone(), None).await;

        let id = PacketId::new(Priority::Normal, 1, 5, 16, 48).unwrap();
        let packet = Packet::with_payload(id, &pool, b"hello").unwrap();
        router.send(packet).await.unwrap();

        let captured = iface.captured.lock().await;
        assert_eq!(captured.len(), 1);
        assert_eq!(&captured[0].data[..], b"hello");
        assert_eq!(router.stats().0, 1);
    }

    #[tokio::test]
    async fn test_missing_route_is_an_error() {
        let pool = PacketPool::new(4);
        let router = Router::new(1, pool.clone());

        let id = PacketId::new(Priority::Normal, 1, 9, 16, 48).unwrap();
        let packet = Packet::with_payload(id, &pool, b"x").unwrap();
        let result = router.send(packet).await;
        assert!(matches!(result, Err(CspError::RouteNotFound)));
        assert_eq!(router.stats().2, 1);
        // the dropped packet's buffer went back to the pool
        assert_eq!(pool.stats().1, 0);
    }

    #[tokio::test]
    async fn test_route_overwrite() {
        let pool = PacketPool::new(4);
        let router = Router::new(1, pool.clone());
        let first = CaptureInterface::new();
        let second = CaptureInterface::new();
        router.route_set(5, first.clone(), None).await;
        router.route_set(5, second.clone(), Some(7)).await;

        let id = PacketId::new(Priority::Normal, 1, 5, 16, 48).unwrap();
        let packet = Packet::with_payload(id, &pool, b"y").unwrap();
        router.send(packet).await.unwrap();

        assert!(first.captured.lock().await.is_empty());
        assert_eq!(second.captured.lock().await.len(), 1);
    }
}
