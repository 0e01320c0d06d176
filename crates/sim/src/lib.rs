//! simulation tools for the Kestrel comms stack

pub mod config;
pub mod ground;
pub mod scenarios;
pub mod stack;

use std::time::Duration;

use kestrel_uhf::ChannelParams;

pub struct SimulationPresets;

impl SimulationPresets {
    pub fn clean_pass() -> ChannelParams {
        ChannelParams {
            bandwidth_bps: 9600,
            frame_loss: 0.0,
            latency: Duration::from_millis(10),
            latency_jitter: Duration::from_millis(2), // overhead pass, strong signal
        }
    }

    pub fn average_pass() -> ChannelParams {
        ChannelParams {
            bandwidth_bps: 9600,
            frame_loss: 0.05,
            latency: Duration::from_millis(40),
            latency_jitter: Duration::from_millis(10), // typical mid-elevation pass
        }
    }

    pub fn low_elevation_pass() -> ChannelParams {
        ChannelParams {
            bandwidth_bps: 2400,
            frame_loss: 0.20,
            latency: Duration::from_millis(120),
            latency_jitter: Duration::from_millis(40), // horizon grazing, long path
        }
    }

    pub fn tumbling_pass() -> ChannelParams {
        ChannelParams {
            bandwidth_bps: 1200,
            frame_loss: 0.40,
            latency: Duration::from_millis(250),
            latency_jitter: Duration::from_millis(100), // uncontrolled attitude, deep fades
        }
    }
}
