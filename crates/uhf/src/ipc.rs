//! IPC boundary.
//!
//! Host entities (command handler, ground-station backdoor) talk to
//! the link controller through typed messages. Inbound messages are
//! decoded into controller events here; anything unrecognized is
//! logged and dropped without disturbing the controller.

use bytes::Buf;
use log::warn;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::command::PageWrite;
use crate::controller::Event;
use crate::timers::TimerConfig;
use crate::UhfError;

pub mod msg_id {
    pub const SET_TIMER_CFG: u16 = 0x0101;
    pub const GET_TIMER_CFG: u16 = 0x0102;
    pub const BEACON_TX_START: u16 = 0x0103;
    pub const BEACON_TX_STOP: u16 = 0x0104;
    pub const SET_TIME: u16 = 0x0105;
    pub const GET_TIME: u16 = 0x0106;
    pub const SET_CALLSIGN: u16 = 0x0107;
    pub const GET_CALLSIGN: u16 = 0x0108;
    pub const GET_TELEMETRY: u16 = 0x0109;
    pub const RANGING: u16 = 0x010A;
    pub const RADIO_REBOOT: u16 = 0x010B;
    pub const BOOT_PING: u16 = 0x010C;
    pub const WRITE_PAGE: u16 = 0x010D;
    pub const ERASE: u16 = 0x010E;
    pub const SET_BEACON_TEXT: u16 = 0x010F;
    pub const GET_BEACON_TEXT: u16 = 0x0110;

    /// Controller to host.
    pub const CMD_RESP: u16 = 0x0180;
    pub const TIMER_CFG_RESP: u16 = 0x0181;
}

pub mod entity {
    pub const HOST: u8 = 1;
    pub const COMMS: u8 = 2;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpcMessage {
    pub msg_id: u16,
    pub src_entity: u8,
    pub payload: Vec<u8>,
}

impl IpcMessage {
    pub fn new(msg_id: u16, src_entity: u8, payload: Vec<u8>) -> Self {
        Self {
            msg_id,
            src_entity,
            payload,
        }
    }
}

impl TryFrom<IpcMessage> for Event {
    type Error = UhfError;

    fn try_from(msg: IpcMessage) -> Result<Self, UhfError> {
        match msg.msg_id {
            msg_id::SET_TIMER_CFG => Ok(Event::SetTimerConfig(TimerConfig::from_bytes(
                &msg.payload,
            )?)),
            msg_id::GET_TIMER_CFG => Ok(Event::GetTimerConfig),
            msg_id::BEACON_TX_START => Ok(Event::BeaconTxStart),
            msg_id::BEACON_TX_STOP => Ok(Event::BeaconTxStop),
            msg_id::SET_TIME => {
                let mut cur: &[u8] = &msg.payload;
                if cur.remaining() < 4 {
                    return Err(UhfError::ShortIpcPayload);
                }
                Ok(Event::SetTime(cur.get_u32_le()))
            }
            msg_id::GET_TIME => Ok(Event::GetTime),
            msg_id::SET_CALLSIGN => Ok(Event::SetCallsign(msg.payload)),
            msg_id::GET_CALLSIGN => Ok(Event::GetCallsign),
            msg_id::GET_TELEMETRY => Ok(Event::GetTelemetry),
            msg_id::RANGING => Ok(Event::Ranging),
            msg_id::RADIO_REBOOT => Ok(Event::RadioReboot),
            msg_id::BOOT_PING => Ok(Event::BootPing),
            msg_id::WRITE_PAGE => Ok(Event::WritePage(PageWrite::decode(&msg.payload)?)),
            msg_id::ERASE => {
                let page = msg
                    .payload
                    .first()
                    .copied()
                    .ok_or(UhfError::ShortIpcPayload)?;
                Ok(Event::Erase(page))
            }
            msg_id::SET_BEACON_TEXT => Ok(Event::SetBeaconText(msg.payload)),
            msg_id::GET_BEACON_TEXT => Ok(Event::GetBeaconText),
            other => Err(UhfError::UnknownMessage(other)),
        }
    }
}

/// Forward host messages into the controller queue.
pub fn spawn_ipc_bridge(
    mut ipc_rx: mpsc::Receiver<IpcMessage>,
    event_tx: mpsc::Sender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(msg) = ipc_rx.recv().await {
            match Event::try_from(msg) {
                Ok(event) => {
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!("ipc message dropped: {e}"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(id: u16, payload: Vec<u8>) -> IpcMessage {
        IpcMessage::new(id, entity::HOST, payload)
    }

    #[test]
    fn test_simple_requests_decode() {
        assert!(matches!(
            Event::try_from(msg(msg_id::GET_TIME, vec![])),
            Ok(Event::GetTime)
        ));
        assert!(matches!(
            Event::try_from(msg(msg_id::BEACON_TX_STOP, vec![])),
            Ok(Event::BeaconTxStop)
        ));
        assert!(matches!(
            Event::try_from(msg(msg_id::ERASE, vec![7])),
            Ok(Event::Erase(7))
        ));
    }

    #[test]
    fn test_payload_carrying_requests_decode() {
        match Event::try_from(msg(msg_id::SET_TIME, 1234u32.to_le_bytes().to_vec())) {
            Ok(Event::SetTime(t)) => assert_eq!(t, 1234),
            other => panic!("bad decode: {other:?}"),
        }
        match Event::try_from(msg(msg_id::SET_CALLSIGN, b"VA6KST".to_vec())) {
            Ok(Event::SetCallsign(cs)) => assert_eq!(cs, b"VA6KST"),
            other => panic!("bad decode: {other:?}"),
        }
        let cfg = TimerConfig::default();
        match Event::try_from(msg(msg_id::SET_TIMER_CFG, cfg.to_bytes())) {
            Ok(Event::SetTimerConfig(got)) => assert_eq!(got, cfg),
            other => panic!("bad decode: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_payloads_refused() {
        assert!(matches!(
            Event::try_from(msg(msg_id::SET_TIME, vec![1, 2])),
            Err(UhfError::ShortIpcPayload)
        ));
        assert!(matches!(
            Event::try_from(msg(msg_id::ERASE, vec![])),
            Err(UhfError::ShortIpcPayload)
        ));
        assert!(matches!(
            Event::try_from(msg(msg_id::SET_TIMER_CFG, vec![0; 5])),
            Err(UhfError::ShortIpcPayload)
        ));
    }

    #[test]
    fn test_unknown_id_refused() {
        assert!(matches!(
            Event::try_from(msg(0x7777, vec![])),
            Err(UhfError::UnknownMessage(0x7777))
        ));
    }
}
