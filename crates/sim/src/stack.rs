//! Flight stack assembly.
//!
//! Wires the full spacecraft side together the way the flight build
//! does: pool, router, transport driver, link controller and the host
//! IPC bridge, all over one serial link.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

use kestrel_csp::{addr, PacketPool, Router};
use kestrel_uhf::ipc::{entity, msg_id, spawn_ipc_bridge, IpcMessage};
use kestrel_uhf::serial::SerialLink;
use kestrel_uhf::transport::{UhfInterface, UhfTransport};
use kestrel_uhf::{Controller, ControllerContext, TimerConfig, UhfConfig};

pub struct FlightStack {
    pub router: Arc<Router>,
    pub pool: PacketPool,
    pub transport: Arc<UhfTransport>,
    ipc_tx: mpsc::Sender<IpcMessage>,
    ipc_rx: mpsc::Receiver<IpcMessage>,
    handles: Vec<JoinHandle<()>>,
}

impl FlightStack {
    pub async fn launch(
        link: Arc<dyn SerialLink>,
        config: UhfConfig,
        timers: TimerConfig,
    ) -> Self {
        let pool = PacketPool::new(16);
        let router = Router::new(addr::OBC, pool.clone());
        let (event_tx, event_rx) = mpsc::channel(64);
        let (resp_tx, resp_rx) = mpsc::channel(64);
        let (host_tx, host_rx) = mpsc::channel(64);

        let (transport, mut handles) =
            UhfTransport::start(link, router.clone(), event_tx.clone(), pool.clone(), &config);
        let iface = UhfInterface::new(transport.clone());
        router
            .route_set(addr::GROUND, iface.clone(), Some(addr::UHF))
            .await;
        router.route_set(addr::UHF, iface, None).await;

        let ctx = ControllerContext::new(
            config,
            timers,
            transport.clone(),
            router.clone(),
            resp_tx,
            event_tx.clone(),
        );
        handles.push(tokio::spawn(Controller::new(ctx, event_rx).run()));
        handles.push(spawn_ipc_bridge(host_rx, event_tx));

        Self {
            router,
            pool,
            transport,
            ipc_tx: host_tx,
            ipc_rx: resp_rx,
            handles,
        }
    }

    /// Post a host request without waiting for anything back.
    pub async fn post(&self, id: u16, payload: Vec<u8>) -> Result<()> {
        self.ipc_tx
            .send(IpcMessage::new(id, entity::HOST, payload))
            .await
            .map_err(|_| anyhow!("controller gone"))
    }

    /// Post a host request and wait for the matching command response.
    pub async fn request(
        &mut self,
        id: u16,
        payload: Vec<u8>,
        wait: Duration,
    ) -> Result<IpcMessage> {
        self.post(id, payload).await?;
        loop {
            let resp = timeout(wait, self.ipc_rx.recv())
                .await
                .map_err(|_| anyhow!("no response within {wait:?}"))?
                .ok_or_else(|| anyhow!("controller gone"))?;
            if resp.msg_id != msg_id::CMD_RESP {
                return Ok(resp);
            }
            let req = u16::from_le_bytes([resp.payload[0], resp.payload[1]]);
            if req == id {
                return Ok(resp);
            }
            // stale response from an earlier displaced command
        }
    }

    pub fn shutdown(&self) {
        for handle in &self.handles {
            handle.abort();
        }
    }
}

impl Drop for FlightStack {
    fn drop(&mut self) {
        self.shutdown();
    }
}
