//! Link timers.
//!
//! Five one-shot timers drive all periodic behavior. A timer never
//! touches controller state itself; expiry posts an event into the
//! controller queue and the controller decides what to do, so every
//! state transition happens on the one event loop.

use std::time::Duration;

use bytes::{Buf, BufMut};
use log::trace;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::controller::Event;
use crate::UhfError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerId {
    BeaconEnable = 0,
    BeaconPeriod = 1,
    BeaconRepeat = 2,
    TelemetryRead = 3,
    Response = 4,
}

const TIMER_COUNT: usize = 5;

/// Beacon and telemetry scheduling, settable from the ground.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerConfig {
    /// Quiet period before beaconing turns on.
    pub beacon_enable_ms: u32,
    /// Interval between beacon bursts.
    pub beacon_period_ms: u32,
    /// Spacing of repeats inside one burst.
    pub beacon_repeat_ms: u32,
    /// Repeats after the first transmission of each burst.
    pub repeat_count: u8,
    /// Housekeeping telemetry poll interval.
    pub telemetry_read_ms: u32,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            beacon_enable_ms: 30_000,
            beacon_period_ms: 10_000,
            beacon_repeat_ms: 500,
            repeat_count: 0,
            telemetry_read_ms: 5_000,
        }
    }
}

impl TimerConfig {
    pub const WIRE_LEN: usize = 17;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::WIRE_LEN);
        out.put_u32_le(self.beacon_enable_ms);
        out.put_u32_le(self.beacon_period_ms);
        out.put_u32_le(self.beacon_repeat_ms);
        out.put_u8(self.repeat_count);
        out.put_u32_le(self.telemetry_read_ms);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, UhfError> {
        let mut cur = bytes;
        if cur.remaining() < Self::WIRE_LEN {
            return Err(UhfError::ShortIpcPayload);
        }
        Ok(Self {
            beacon_enable_ms: cur.get_u32_le(),
            beacon_period_ms: cur.get_u32_le(),
            beacon_repeat_ms: cur.get_u32_le(),
            repeat_count: cur.get_u8(),
            telemetry_read_ms: cur.get_u32_le(),
        })
    }
}

/// The timer slots. Arming a slot replaces any shot already in it.
pub struct TimerSet {
    event_tx: mpsc::Sender<Event>,
    shots: [Option<JoinHandle<()>>; TIMER_COUNT],
}

impl TimerSet {
    pub fn new(event_tx: mpsc::Sender<Event>) -> Self {
        Self {
            event_tx,
            shots: Default::default(),
        }
    }

    pub fn arm(&mut self, id: TimerId, after: Duration) {
        let event = match id {
            TimerId::BeaconEnable => Event::BeaconEnableExpired,
            TimerId::BeaconPeriod => Event::BeaconPeriodExpired,
            TimerId::BeaconRepeat => Event::BeaconRepeatExpired,
            TimerId::TelemetryRead => Event::TelemetryReadExpired,
            TimerId::Response => {
                self.arm_response(0, after);
                return;
            }
        };
        self.spawn_shot(id, after, event);
    }

    /// The response timer carries the issue generation so a stale shot
    /// cannot cancel a newer command.
    pub fn arm_response(&mut self, generation: u32, after: Duration) {
        self.spawn_shot(
            TimerId::Response,
            after,
            Event::ResponseTimeout { generation },
        );
    }

    pub fn disarm(&mut self, id: TimerId) {
        if let Some(handle) = self.shots[id as usize].take() {
            handle.abort();
        }
    }

    pub fn disarm_all(&mut self) {
        for slot in &mut self.shots {
            if let Some(handle) = slot.take() {
                handle.abort();
            }
        }
    }

    fn spawn_shot(&mut self, id: TimerId, after: Duration, event: Event) {
        self.disarm(id);
        trace!("timer {id:?} armed for {after:?}");
        let tx = self.event_tx.clone();
        self.shots[id as usize] = Some(tokio::spawn(async move {
            sleep(after).await;
            let _ = tx.send(event).await;
        }));
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        self.disarm_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::error::TryRecvError;

    #[tokio::test(start_paused = true)]
    async fn test_expiry_posts_one_event() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = TimerSet::new(tx);
        timers.arm(TimerId::BeaconPeriod, Duration::from_millis(100));

        sleep(Duration::from_millis(99)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        sleep(Duration::from_millis(2)).await;
        assert!(matches!(rx.try_recv(), Ok(Event::BeaconPeriodExpired)));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rearm_replaces_pending_shot() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = TimerSet::new(tx);
        timers.arm(TimerId::TelemetryRead, Duration::from_millis(100));
        timers.arm(TimerId::TelemetryRead, Duration::from_millis(500));

        sleep(Duration::from_millis(200)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        sleep(Duration::from_millis(350)).await;
        assert!(matches!(rx.try_recv(), Ok(Event::TelemetryReadExpired)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disarm_cancels_shot() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = TimerSet::new(tx);
        timers.arm(TimerId::BeaconEnable, Duration::from_millis(50));
        timers.disarm(TimerId::BeaconEnable);

        sleep(Duration::from_millis(200)).await;
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_shot_carries_generation() {
        let (tx, mut rx) = mpsc::channel(8);
        let mut timers = TimerSet::new(tx);
        timers.arm_response(42, Duration::from_millis(10));

        sleep(Duration::from_millis(11)).await;
        assert!(matches!(
            rx.try_recv(),
            Ok(Event::ResponseTimeout { generation: 42 })
        ));
    }

    #[test]
    fn test_config_wire_round_trip() {
        let cfg = TimerConfig {
            beacon_enable_ms: 1,
            beacon_period_ms: 1000,
            beacon_repeat_ms: 100,
            repeat_count: 2,
            telemetry_read_ms: 5000,
        };
        let wire = cfg.to_bytes();
        assert_eq!(wire.len(), TimerConfig::WIRE_LEN);
        assert_eq!(TimerConfig::from_bytes(&wire).unwrap(), cfg);
        assert!(TimerConfig::from_bytes(&wire[..16]).is_err());
    }
}
