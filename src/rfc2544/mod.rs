//! RFC 2544 benchmarking driver
//!
//! Reuses the TX/RX workers with synthesized profiles: a binary search over
//! offered rate for throughput, a fixed-rate run for latency, a per-size
//! sweep, a descending frame-loss sweep, and a mirrored bidirectional
//! variant. The driver blocks its calling thread for the duration of the
//! test; workers are used exclusively by the test while it runs.

use crate::profile::TrafficProfile;
use crate::{Engine, Error, Result};
use std::time::Duration;

/// Binary search terminates when the bracket narrows to this width
const RATE_RESOLUTION_MBPS: f64 = 0.1;

/// Frame-loss sweep step, as a fraction of link capacity
const FRAME_LOSS_STEP_PCT: f64 = 10.0;

/// Throughput test parameters
#[derive(Debug, Clone)]
pub struct ThroughputConfig {
    pub duration: Duration,
    pub frame_size: u16,
    pub loss_threshold_pct: f64,
}

impl Default for ThroughputConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(60),
            frame_size: 1518,
            loss_threshold_pct: 0.01,
        }
    }
}

/// Throughput test result
#[derive(Debug, Clone)]
pub struct ThroughputResult {
    pub frame_size: u16,
    pub max_rate_mbps: f64,
    pub max_rate_fps: f64,
    pub iterations: u32,
}

/// Latency test parameters
#[derive(Debug, Clone)]
pub struct LatencyConfig {
    pub rate_mbps: f64,
    pub duration: Duration,
    pub frame_size: u16,
}

/// Latency test result
#[derive(Debug, Clone)]
pub struct LatencyResult {
    pub min_latency_ns: u64,
    pub avg_latency_ns: u64,
    pub max_latency_ns: u64,
    pub jitter_ns: u64,
    pub samples: u64,
}

/// One row of the frame-loss sweep
#[derive(Debug, Clone)]
pub struct FrameLossStep {
    pub offered_mbps: f64,
    pub offered_pct: f64,
    pub loss_pct: f64,
}

/// Bidirectional test result
#[derive(Debug, Clone)]
pub struct BidirectionalResult {
    pub tx_packets: u64,
    pub rx_packets: u64,
    pub loss_pct: f64,
    pub avg_latency_ns: u64,
}

/// The synthetic profile every test drives the workers with
fn synthetic_profile(name: &str, rate_mbps: f64, frame_size: u16, port: usize) -> TrafficProfile {
    let mut prof = TrafficProfile::udp(
        name,
        "192.168.2.2:5000".parse().unwrap(),
        frame_size,
        rate_mbps,
    );
    prof.stream_id = port as u16;
    prof.port = port;
    prof
}

/// Run one timed trial and return (tx_packets, rx_packets, loss percent)
fn run_trial(
    engine: &mut Engine,
    rate_mbps: f64,
    frame_size: u16,
    duration: Duration,
) -> Result<(u64, u64, f64)> {
    let prof = synthetic_profile("rfc2544-trial", rate_mbps, frame_size, 0);
    engine.configure(vec![prof])?;
    engine.reset_stats();
    engine.start()?;
    std::thread::sleep(duration);
    engine.stop()?;

    let stats = engine.stats();
    let tx = stats.tx.packets_sent;
    let rx = stats.rx.packets_received.min(tx);
    let loss_pct = if tx > 0 {
        100.0 * (tx - rx) as f64 / tx as f64
    } else {
        0.0
    };
    Ok((tx, stats.rx.packets_received, loss_pct))
}

/// Binary-search throughput test over [0, link capacity]
pub fn run_throughput(engine: &mut Engine, config: &ThroughputConfig) -> Result<ThroughputResult> {
    if !engine.has_rx_path() {
        return Err(Error::InvalidConfig(
            "throughput test requires a receive path".to_string(),
        ));
    }

    let link = engine.link_mbps();
    let mut lower = 0.0f64;
    let mut upper = link;
    let mut iterations = 0u32;

    log::info!(
        "rfc2544 throughput: frame {} B, loss threshold {}%, bracket [0, {}] Mb/s",
        config.frame_size,
        config.loss_threshold_pct,
        link
    );

    while upper - lower > RATE_RESOLUTION_MBPS {
        iterations += 1;
        let rate = (lower + upper) / 2.0;
        let (tx, rx, loss_pct) = run_trial(engine, rate, config.frame_size, config.duration)?;

        log::info!(
            "  iteration {}: {:.2} Mb/s -> tx {} rx {} loss {:.4}%",
            iterations,
            rate,
            tx,
            rx,
            loss_pct
        );

        if loss_pct <= config.loss_threshold_pct {
            lower = rate;
        } else {
            upper = rate;
        }
    }

    let max_rate_fps = lower * 1e6 / (config.frame_size as f64 * 8.0);
    log::info!(
        "rfc2544 throughput done: {:.2} Mb/s in {} iterations",
        lower,
        iterations
    );

    Ok(ThroughputResult {
        frame_size: config.frame_size,
        max_rate_mbps: lower,
        max_rate_fps,
        iterations,
    })
}

/// Fixed-rate latency test
pub fn run_latency(engine: &mut Engine, config: &LatencyConfig) -> Result<LatencyResult> {
    if !engine.has_rx_path() {
        return Err(Error::InvalidConfig(
            "latency test requires a receive path".to_string(),
        ));
    }

    let prof = synthetic_profile("rfc2544-latency", config.rate_mbps, config.frame_size, 0);
    engine.configure(vec![prof])?;
    engine.reset_stats();
    engine.start()?;
    std::thread::sleep(config.duration);
    engine.stop()?;

    let rx = engine.stats().rx;
    log::info!(
        "rfc2544 latency done: {} samples, min {} avg {} max {} ns",
        rx.latency_samples,
        rx.min_latency_ns,
        rx.avg_latency_ns,
        rx.max_latency_ns
    );

    Ok(LatencyResult {
        min_latency_ns: rx.min_latency_ns,
        avg_latency_ns: rx.avg_latency_ns,
        max_latency_ns: rx.max_latency_ns,
        jitter_ns: rx.jitter_ns,
        samples: rx.latency_samples,
    })
}

/// Throughput search repeated across frame sizes, one result row each
pub fn run_multi_size(
    engine: &mut Engine,
    frame_sizes: &[u16],
    duration: Duration,
    loss_threshold_pct: f64,
) -> Result<Vec<ThroughputResult>> {
    let mut results = Vec::with_capacity(frame_sizes.len());
    for &frame_size in frame_sizes {
        let config = ThroughputConfig {
            duration,
            frame_size,
            loss_threshold_pct,
        };
        results.push(run_throughput(engine, &config)?);
    }
    Ok(results)
}

/// Sweep offered rate from link capacity downward in 10% steps
pub fn run_frame_loss(
    engine: &mut Engine,
    frame_size: u16,
    duration: Duration,
) -> Result<Vec<FrameLossStep>> {
    let link = engine.link_mbps();
    let mut rows = Vec::new();

    let mut pct = 100.0;
    while pct > 0.0 {
        let offered = link * pct / 100.0;
        let (_, _, loss_pct) = run_trial(engine, offered, frame_size, duration)?;
        log::info!(
            "rfc2544 frame-loss: {:.0}% of link ({:.1} Mb/s) -> {:.4}% loss",
            pct,
            offered,
            loss_pct
        );
        rows.push(FrameLossStep {
            offered_mbps: offered,
            offered_pct: pct,
            loss_pct,
        });
        pct -= FRAME_LOSS_STEP_PCT;
    }

    Ok(rows)
}

/// Mirrored profiles on opposite ports, transmitted simultaneously
pub fn run_bidirectional(
    engine: &mut Engine,
    rate_mbps: f64,
    frame_size: u16,
    duration: Duration,
) -> Result<BidirectionalResult> {
    if engine.port_count() < 2 {
        return Err(Error::InvalidConfig(
            "bidirectional test requires two ports".to_string(),
        ));
    }

    let forward = synthetic_profile("rfc2544-bidir-fwd", rate_mbps, frame_size, 0);
    let mut reverse = synthetic_profile("rfc2544-bidir-rev", rate_mbps, frame_size, 1);
    if let crate::profile::L3Endpoints::Ipv4 { src, dst, dscp } = forward.l3 {
        reverse.l3 = crate::profile::L3Endpoints::Ipv4 {
            src: dst,
            dst: src,
            dscp,
        };
    }
    engine.configure(vec![forward, reverse])?;
    engine.reset_stats();
    engine.start()?;
    std::thread::sleep(duration);
    engine.stop()?;

    let stats = engine.stats();
    let tx = stats.tx.packets_sent;
    let rx = stats.rx.packets_received;
    let loss_pct = if tx > 0 {
        100.0 * (tx.saturating_sub(rx)) as f64 / tx as f64
    } else {
        0.0
    };

    Ok(BidirectionalResult {
        tx_packets: tx,
        rx_packets: rx,
        loss_pct,
        avg_latency_ns: stats.rx.avg_latency_ns,
    })
}
