//! UHF link controller.
//!
//! One task owns all link state and consumes a single event queue fed
//! by the receive path, the timers and the host IPC bridge. Every
//! event is handled to completion before the next is taken, so no
//! handler ever races another. The dispatch is a flat match over the
//! event alternatives.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::BufMut;
use log::{debug, info, trace, warn};
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};

use kestrel_csp::{addr, port, Packet, PacketId, PooledBuf, Priority, Router};

use crate::command::{
    encode_time, opcode, PageWrite, MAX_BEACON_TEXT, MAX_CALLSIGN, NO_ARGS,
};
use crate::correlator::{CmdStatus, Correlator, Disposition, PendingCommand, TimeoutDisposition};
use crate::frame::FrameHeader;
use crate::ipc::{entity, msg_id, IpcMessage};
use crate::timers::{TimerConfig, TimerId, TimerSet};
use crate::transport::UhfTransport;
use crate::UhfConfig;

/// Telemetry polls per housekeeping buffer; the beacon advertises
/// which buffer is filling.
const HK_SAMPLES_PER_BUFFER: u32 = 16;

/// Everything that can happen to the link, in one flat alternative.
#[derive(Debug)]
pub enum Event {
    /// A command or response frame arrived off the wire.
    FrameReceived { header: FrameHeader, args: PooledBuf },

    BeaconEnableExpired,
    BeaconPeriodExpired,
    BeaconRepeatExpired,
    TelemetryReadExpired,
    ResponseTimeout { generation: u32 },

    SetTimerConfig(TimerConfig),
    GetTimerConfig,
    BeaconTxStart,
    BeaconTxStop,
    SetTime(u32),
    GetTime,
    SetCallsign(Vec<u8>),
    GetCallsign,
    GetTelemetry,
    Ranging,
    RadioReboot,
    BootPing,
    WritePage(PageWrite),
    Erase(u8),
    SetBeaconText(Vec<u8>),
    GetBeaconText,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ControllerStats {
    pub beacons_tx: u64,
    pub commands_issued: u64,
    pub displaced: u64,
}

/// Link state owned by the controller task.
pub struct ControllerContext {
    config: UhfConfig,
    timer_cfg: TimerConfig,
    timers: TimerSet,
    correlator: Correlator,
    transport: Arc<UhfTransport>,
    router: Arc<Router>,
    ipc_tx: mpsc::Sender<IpcMessage>,

    // parameters latched from the last set requests
    time_param: u32,
    callsign: Vec<u8>,
    beacon_text: Vec<u8>,
    page_latch: Option<PageWrite>,

    // the rendered beacon is reused verbatim by repeats
    beacon_payload: Vec<u8>,
    repeats_left: u8,

    telemetry: Vec<u8>,
    hk_samples: u32,
    hk_buffer_full: bool,

    generation: u32,
    stats: ControllerStats,
}

impl ControllerContext {
    pub fn new(
        config: UhfConfig,
        timer_cfg: TimerConfig,
        transport: Arc<UhfTransport>,
        router: Arc<Router>,
        ipc_tx: mpsc::Sender<IpcMessage>,
        event_tx: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            config,
            timer_cfg,
            timers: TimerSet::new(event_tx),
            correlator: Correlator::new(),
            transport,
            router,
            ipc_tx,
            time_param: 0,
            callsign: Vec::new(),
            beacon_text: b"KESTREL".to_vec(),
            page_latch: None,
            beacon_payload: Vec::new(),
            repeats_left: 0,
            telemetry: Vec::new(),
            hk_samples: 0,
            hk_buffer_full: false,
            generation: 0,
            stats: ControllerStats::default(),
        }
    }

    pub fn timer_cfg(&self) -> &TimerConfig {
        &self.timer_cfg
    }

    pub fn hk_buffer_full(&self) -> bool {
        self.hk_buffer_full
    }

    pub fn telemetry(&self) -> &[u8] {
        &self.telemetry
    }

    pub fn stats(&self) -> ControllerStats {
        self.stats
    }

    pub async fn handle(&mut self, event: Event) {
        trace!("controller event: {event:?}");
        match event {
            Event::FrameReceived { header, args } => self.on_frame(header, args).await,

            Event::BeaconEnableExpired => {
                debug!("beacon quiet period over");
                self.timers
                    .arm(TimerId::BeaconPeriod, ms(self.timer_cfg.beacon_period_ms));
            }
            Event::BeaconPeriodExpired => self.on_beacon_period().await,
            Event::BeaconRepeatExpired => self.on_beacon_repeat().await,
            Event::TelemetryReadExpired => self.on_telemetry_poll().await,
            Event::ResponseTimeout { generation } => self.on_response_timeout(generation).await,

            Event::SetTimerConfig(cfg) => self.on_set_timer_config(cfg),
            Event::GetTimerConfig => {
                let wire = self.timer_cfg.to_bytes();
                self.reply(msg_id::TIMER_CFG_RESP, wire).await;
            }
            Event::BeaconTxStart => {
                self.timers.disarm(TimerId::BeaconEnable);
                self.timers
                    .arm(TimerId::BeaconPeriod, ms(self.timer_cfg.beacon_period_ms));
            }
            Event::BeaconTxStop => {
                self.timers.disarm(TimerId::BeaconPeriod);
                self.timers.disarm(TimerId::BeaconRepeat);
                self.repeats_left = 0;
                // beaconing turns itself back on after the quiet period
                self.timers
                    .arm(TimerId::BeaconEnable, ms(self.timer_cfg.beacon_enable_ms));
            }

            Event::SetTime(t) => {
                self.time_param = t;
                self.issue(msg_id::SET_TIME, opcode::SET_TIME, encode_time(t).to_vec())
                    .await;
            }
            Event::GetTime => {
                self.issue(msg_id::GET_TIME, opcode::GET_TIME, NO_ARGS.to_vec())
                    .await
            }
            Event::SetCallsign(mut cs) => {
                cs.truncate(MAX_CALLSIGN);
                self.callsign = cs.clone();
                self.issue(msg_id::SET_CALLSIGN, opcode::SET_CALLSIGN, cs).await;
            }
            Event::GetCallsign => {
                self.issue(msg_id::GET_CALLSIGN, opcode::GET_CALLSIGN, NO_ARGS.to_vec())
                    .await
            }
            Event::GetTelemetry => {
                self.issue(msg_id::GET_TELEMETRY, opcode::GET_TELEMETRY, NO_ARGS.to_vec())
                    .await
            }
            Event::Ranging => {
                self.issue(msg_id::RANGING, opcode::RANGING, NO_ARGS.to_vec())
                    .await
            }
            Event::RadioReboot => {
                self.issue(msg_id::RADIO_REBOOT, opcode::REBOOT, NO_ARGS.to_vec())
                    .await
            }
            Event::BootPing => {
                self.issue(msg_id::BOOT_PING, opcode::BOOT_PING, NO_ARGS.to_vec())
                    .await
            }
            Event::WritePage(pw) => match pw.encode() {
                Ok(args) => {
                    self.page_latch = Some(pw);
                    self.issue(msg_id::WRITE_PAGE, opcode::WRITE_PAGE, args).await;
                }
                Err(e) => warn!("page write refused: {e}"),
            },
            Event::Erase(page) => {
                self.issue(msg_id::ERASE, opcode::ERASE, vec![page]).await
            }
            Event::SetBeaconText(mut text) => {
                text.truncate(MAX_BEACON_TEXT);
                self.beacon_text = text.clone();
                self.issue(msg_id::SET_BEACON_TEXT, opcode::SET_BEACON, text).await;
            }
            Event::GetBeaconText => {
                self.issue(msg_id::GET_BEACON_TEXT, opcode::GET_BEACON, NO_ARGS.to_vec())
                    .await
            }
        }
    }

    async fn on_frame(&mut self, header: FrameHeader, args: PooledBuf) {
        match self.correlator.on_response(header.command, &args) {
            Disposition::Completed {
                msg_id: req_id,
                opcode: op,
                status,
                payload,
            } => {
                self.timers.disarm(TimerId::Response);
                if op == opcode::GET_TELEMETRY && status == CmdStatus::Ok {
                    self.telemetry = payload.clone();
                }
                self.send_cmd_resp(req_id, op, status, &payload).await;
            }
            Disposition::TelemetryUpdate(data) => {
                trace!("telemetry cache refreshed ({} bytes)", data.len());
                self.telemetry = data;
            }
            Disposition::Unsolicited => {}
        }
    }

    async fn on_beacon_period(&mut self) {
        self.timers
            .arm(TimerId::BeaconPeriod, ms(self.timer_cfg.beacon_period_ms));
        self.beacon_payload = self.render_beacon();
        self.transmit_beacon().await;
        if self.timer_cfg.repeat_count > 0 {
            self.repeats_left = self.timer_cfg.repeat_count;
            self.timers
                .arm(TimerId::BeaconRepeat, ms(self.timer_cfg.beacon_repeat_ms));
        }
    }

    async fn on_beacon_repeat(&mut self) {
        if self.repeats_left == 0 {
            return;
        }
        // repeats resend the burst's rendered payload, not a fresh one
        self.transmit_beacon().await;
        self.repeats_left -= 1;
        if self.repeats_left > 0 {
            self.timers
                .arm(TimerId::BeaconRepeat, ms(self.timer_cfg.beacon_repeat_ms));
        }
    }

    async fn on_telemetry_poll(&mut self) {
        self.timers
            .arm(TimerId::TelemetryRead, ms(self.timer_cfg.telemetry_read_ms));
        // background poll: the reply refreshes the cache through the
        // unsolicited path and never occupies the command slot
        if let Err(e) = self.transport.send_command(opcode::GET_TELEMETRY, &NO_ARGS).await {
            debug!("telemetry poll skipped: {e}");
        }
        self.hk_samples += 1;
        if self.hk_samples % HK_SAMPLES_PER_BUFFER == 0 {
            self.hk_buffer_full = !self.hk_buffer_full;
            debug!("housekeeping buffer flag now {}", self.hk_buffer_full);
        }
    }

    async fn on_response_timeout(&mut self, generation: u32) {
        match self.correlator.on_timeout(generation) {
            TimeoutDisposition::Resend { opcode: op, args } => {
                debug!("resending command {op:#04x}");
                if let Err(e) = self.transport.send_command(op, &args).await {
                    warn!("resend of {op:#04x} failed: {e}");
                }
                self.timers
                    .arm_response(generation, self.config.command_timeout);
            }
            TimeoutDisposition::Expired { msg_id: req_id, opcode: op } => {
                self.send_cmd_resp(req_id, op, CmdStatus::TimedOut, &[]).await;
            }
            TimeoutDisposition::Stale => {}
        }
    }

    fn on_set_timer_config(&mut self, cfg: TimerConfig) {
        info!("timer config updated: {cfg:?}");
        self.timer_cfg = cfg;
        // restart the whole beacon chain under the new schedule
        self.timers.disarm(TimerId::BeaconPeriod);
        self.timers.disarm(TimerId::BeaconRepeat);
        self.repeats_left = 0;
        self.timers
            .arm(TimerId::BeaconEnable, ms(cfg.beacon_enable_ms));
        self.timers
            .arm(TimerId::TelemetryRead, ms(cfg.telemetry_read_ms));
    }

    /// Install the command in the correlator slot, put it on the wire
    /// and arm the response deadline.
    async fn issue(&mut self, req_id: u16, op: u8, args: Vec<u8>) {
        self.generation = self.generation.wrapping_add(1);
        let displaced = self.correlator.issue(PendingCommand {
            opcode: op,
            args: args.clone(),
            msg_id: req_id,
            generation: self.generation,
            issued_at: Instant::now(),
            retries_left: self.config.command_retries,
        });
        if displaced.is_some() {
            self.stats.displaced += 1;
        }
        self.stats.commands_issued += 1;
        if let Err(e) = self.transport.send_command(op, &args).await {
            // the response timer will drive the resend
            warn!("command {op:#04x} not sent: {e}");
        }
        self.timers
            .arm_response(self.generation, self.config.command_timeout);
    }

    fn render_beacon(&self) -> Vec<u8> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        let mut out = Vec::with_capacity(5 + self.beacon_text.len());
        out.put_u32_le(now);
        out.put_u8(self.hk_buffer_full as u8);
        out.extend_from_slice(&self.beacon_text);
        out
    }

    async fn transmit_beacon(&mut self) {
        let id = match PacketId::new(
            Priority::Normal,
            self.router.local_addr(),
            addr::GROUND,
            port::BEACON,
            port::BEACON,
        ) {
            Ok(id) => id,
            Err(e) => {
                warn!("beacon address invalid: {e}");
                return;
            }
        };
        let packet = match Packet::with_payload(id, self.router.pool(), &self.beacon_payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("beacon skipped: {e}");
                return;
            }
        };
        match self.router.send(packet).await {
            Ok(()) => self.stats.beacons_tx += 1,
            Err(e) => warn!("beacon not sent: {e}"),
        }
    }

    async fn send_cmd_resp(&self, req_id: u16, op: u8, status: CmdStatus, args: &[u8]) {
        let mut payload = Vec::with_capacity(4 + args.len());
        payload.put_u16_le(req_id);
        payload.put_u8(op);
        payload.put_u8(status as u8);
        payload.extend_from_slice(args);
        self.reply(msg_id::CMD_RESP, payload).await;
    }

    async fn reply(&self, id: u16, payload: Vec<u8>) {
        let msg = IpcMessage::new(id, entity::COMMS, payload);
        if self.ipc_tx.send(msg).await.is_err() {
            debug!("host ipc queue closed");
        }
    }
}

/// The controller task: arms the startup timers, then drains the event
/// queue until every sender is gone.
pub struct Controller {
    ctx: ControllerContext,
    event_rx: mpsc::Receiver<Event>,
}

impl Controller {
    pub fn new(ctx: ControllerContext, event_rx: mpsc::Receiver<Event>) -> Self {
        Self { ctx, event_rx }
    }

    pub async fn run(mut self) {
        info!("uhf link controller started");
        self.ctx
            .timers
            .arm(TimerId::BeaconEnable, ms(self.ctx.timer_cfg.beacon_enable_ms));
        self.ctx.timers.arm(
            TimerId::TelemetryRead,
            ms(self.ctx.timer_cfg.telemetry_read_ms),
        );
        while let Some(event) = self.event_rx.recv().await {
            self.ctx.handle(event).await;
        }
        info!("uhf link controller stopped");
    }
}

fn ms(v: u32) -> Duration {
    Duration::from_millis(v as u64)
}
