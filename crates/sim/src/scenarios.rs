//! Simulation scenarios for exercising the comms stack over an
//! impaired channel.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, Instant};

use kestrel_csp::{addr, connect, port, Priority};
use kestrel_uhf::command::{decode_time, opcode};
use kestrel_uhf::ipc::msg_id;
use kestrel_uhf::{
    ChannelParams, CmdStatus, SimulatedLink, TimerConfig, UhfConfig, MAX_CSP_PAYLOAD,
};

use crate::config::BenchConfig;
use crate::ground::RadioEmulator;
use crate::stack::FlightStack;

fn quiet_timers() -> TimerConfig {
    TimerConfig {
        beacon_enable_ms: 600_000,
        telemetry_read_ms: 600_000,
        ..TimerConfig::default()
    }
}

fn check(ok: bool, label: &str) {
    if ok {
        println!("✓ {label}");
    } else {
        println!("✗ {label}");
    }
}

/// Beacon bursts under the configured channel: enable delay, period,
/// and in-burst repeats.
pub async fn beacon_cadence(channel: ChannelParams, window: Duration) {
    println!("\n=== Beacon Cadence ===");
    println!("channel: {channel:?}");

    let (flight_end, ground_end) = SimulatedLink::pair(channel);
    let emulator = RadioEmulator::start(Arc::new(ground_end));
    let timers = TimerConfig {
        beacon_enable_ms: 1000,
        beacon_period_ms: 1000,
        beacon_repeat_ms: 100,
        repeat_count: 2,
        telemetry_read_ms: 600_000,
    };
    let stack = FlightStack::launch(Arc::new(flight_end), UhfConfig::default(), timers).await;

    println!("listening for {window:?} >>>");
    sleep(window).await;

    let log = emulator.snapshot().await;
    println!("beacons heard: {}", log.beacons.len());
    if let Some(first) = log.beacons.first() {
        println!("first payload: {}", hex::encode(&first.data));
    }
    let mut close_pairs = 0usize;
    let mut verbatim_pairs = 0usize;
    for pair in log.beacons.windows(2) {
        let delta = pair[1].at_ms.saturating_sub(pair[0].at_ms);
        // deltas under the period gap belong to one burst
        if delta <= 400 {
            close_pairs += 1;
            if pair[0].data == pair[1].data {
                verbatim_pairs += 1;
            }
        }
        println!("  +{delta} ms  ({} bytes)", pair[1].data.len());
    }

    check(!log.beacons.is_empty(), "at least one beacon made it down");
    if close_pairs > 0 {
        check(
            verbatim_pairs == close_pairs,
            "in-burst repeats carry the payload verbatim",
        );
    }
    let from_obc = log
        .beacons
        .iter()
        .filter(|b| b.id.src == addr::OBC)
        .count();
    check(
        from_obc == log.beacons.len(),
        "every beacon originates at the flight computer",
    );

    stack.shutdown();
    let (frames, bytes, _, _) = stack.transport.get_stats().await;
    println!("transport: {frames} frames, {bytes} bytes on the wire");
}

/// A 600 byte file leaves as three frames and reassembles in order.
pub async fn bulk_downlink(channel: ChannelParams) {
    println!("\n=== Bulk Downlink ===");
    println!("channel: {channel:?}");

    let bandwidth = channel.bandwidth_bps.max(1);
    let (flight_end, ground_end) = SimulatedLink::pair(channel);
    let emulator = RadioEmulator::start(Arc::new(ground_end));
    let stack =
        FlightStack::launch(Arc::new(flight_end), UhfConfig::default(), quiet_timers()).await;

    let conn = match connect(
        &stack.router,
        Priority::High,
        addr::GROUND,
        port::UHF_DATA,
        Duration::from_secs(2),
    ) {
        Ok(conn) => conn,
        Err(e) => {
            println!("✗ connect failed: {e}");
            return;
        }
    };

    let mut rng = rand::rng();
    let blob: Vec<u8> = (0..600).map(|_| rng.random()).collect();
    match conn.send_chunked(&blob, MAX_CSP_PAYLOAD).await {
        Ok(n) => check(n == 3, "600 bytes queued as 3 frames"),
        Err(e) => {
            println!("✗ send failed: {e}");
            return;
        }
    }

    // wait out serialization time for the whole transfer plus margin
    let wire_bits = (blob.len() + 3 * 13) * 8;
    let drain = Duration::from_secs_f64(wire_bits as f64 / bandwidth as f64)
        + Duration::from_millis(1500);
    sleep(drain).await;

    let log = emulator.snapshot().await;
    let sizes: Vec<usize> = log.downlink.iter().map(|r| r.data.len()).collect();
    let span_ms = match (log.downlink.first(), log.downlink.last()) {
        (Some(first), Some(last)) => last.at_ms.saturating_sub(first.at_ms),
        _ => 0,
    };
    println!(
        "received {} of 3 frames over {span_ms} ms: sizes {sizes:?}",
        log.downlink.len()
    );

    if log.downlink.len() == 3 {
        check(sizes == vec![241, 241, 118], "frame sizes 241 + 241 + 118");
        let mut rebuilt = Vec::new();
        for record in &log.downlink {
            rebuilt.extend_from_slice(&record.data);
        }
        check(rebuilt == blob, "reassembled file matches the original");
        check(
            log.downlink.iter().all(|r| r.id.dport == port::UHF_DATA),
            "all frames arrived on the data port",
        );
    } else {
        println!("  (channel loss ate part of the transfer)");
    }

    stack.shutdown();
}

/// A hung radio times the command out through its resends, then the
/// slot recovers and the next command completes.
pub async fn command_recovery(channel: ChannelParams) {
    println!("\n=== Command Timeout Recovery ===");
    println!("channel: {channel:?}");

    let (flight_end, ground_end) = SimulatedLink::pair(channel);
    let emulator = RadioEmulator::start(Arc::new(ground_end));
    let config = UhfConfig {
        command_timeout: Duration::from_millis(700),
        command_retries: 1,
        ..UhfConfig::default()
    };
    let mut stack = FlightStack::launch(Arc::new(flight_end), config, quiet_timers()).await;

    emulator.set_answering(false);
    println!("radio muted, asking for the time >>>");
    let start = Instant::now();
    match stack
        .request(msg_id::GET_TIME, Vec::new(), Duration::from_secs(10))
        .await
    {
        Ok(resp) => {
            let timed_out = resp.payload[3] == CmdStatus::TimedOut as u8;
            check(timed_out, "request reported timed out");
            println!("  gave up after {:?}", start.elapsed());
        }
        Err(e) => println!("✗ no verdict from the controller: {e}"),
    }

    emulator.set_answering(true);
    println!("radio back, asking again >>>");
    match stack
        .request(msg_id::GET_TIME, Vec::new(), Duration::from_secs(10))
        .await
    {
        Ok(resp) => {
            let ok = resp.payload[3] == CmdStatus::Ok as u8;
            check(ok, "slot recovered, fresh request completed");
            if ok {
                match decode_time(&resp.payload[4..]) {
                    Ok(t) => println!("  radio reports unix time {t}"),
                    Err(e) => println!("✗ short time payload: {e}"),
                }
            }
        }
        Err(e) => println!("✗ recovery request failed: {e}"),
    }

    let log = emulator.snapshot().await;
    let polls = log
        .commands_seen
        .iter()
        .filter(|&&op| op == opcode::GET_TIME)
        .count();
    check(polls >= 3, "resend visible on the wire before expiry");

    stack.shutdown();
}

/// Soak run with an operator supplied profile: timers, link settings
/// and channel all come from the loaded config.
pub async fn mission_profile(config: BenchConfig) {
    println!("\n=== Mission Profile ===");
    println!("channel: {:?}", config.channel);
    println!("timers:  {:?}", config.timers);

    let (flight_end, ground_end) = SimulatedLink::pair(config.channel.clone());
    let flight = Arc::new(flight_end);
    let emulator = RadioEmulator::start(Arc::new(ground_end));
    let mut stack = FlightStack::launch(flight.clone(), config.uhf.clone(), config.timers).await;

    // operator traffic while the timers run on their own
    let wait = Duration::from_secs(10);
    match stack
        .request(msg_id::SET_CALLSIGN, b"VA6KST".to_vec(), wait)
        .await
    {
        Ok(resp) => check(
            resp.payload[3] == CmdStatus::Ok as u8,
            "callsign change acknowledged",
        ),
        Err(e) => println!("✗ callsign change: {e}"),
    }
    match stack
        .request(msg_id::GET_TELEMETRY, Vec::new(), wait)
        .await
    {
        Ok(resp) => check(
            resp.payload[3] == CmdStatus::Ok as u8 && resp.payload.len() > 4,
            "telemetry frame came back with data",
        ),
        Err(e) => println!("✗ telemetry request: {e}"),
    }

    println!("soaking for {} s >>>", config.run_secs);
    sleep(Duration::from_secs(config.run_secs)).await;

    let log = emulator.snapshot().await;
    let (frames, bytes, tx_timeouts, enqueue_timeouts) = stack.transport.get_stats().await;
    let (link_sent, link_dropped, link_bytes) = flight.get_stats().await;
    println!(
        "ground heard {} beacons, {} data frames, {} radio commands",
        log.beacons.len(),
        log.downlink.len(),
        log.commands_seen.len()
    );
    println!(
        "transport: {frames} frames / {bytes} bytes out, {tx_timeouts} line stalls, {enqueue_timeouts} queue stalls"
    );
    println!(
        "channel:   {link_sent} frames offered, {link_dropped} lost, {link_bytes} bytes"
    );

    stack.shutdown();
}
