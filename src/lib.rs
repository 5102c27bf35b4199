//! pktforge - Kernel-bypass traffic generator and measurement engine
//!
//! A DPDK-inspired userspace traffic engine featuring per-core packet
//! forging with TSC-accurate pacing, time-varying rate patterns, network
//! impairment injection, receive-side latency correlation, and an
//! RFC 2544 test driver, all over a pluggable burst-I/O port boundary.

pub mod control;
pub mod forge;
pub mod impair;
pub mod memory;
pub mod pattern;
pub mod port;
pub mod profile;
pub mod rfc2544;
pub mod ring;
pub mod rx;
pub mod utils;
pub mod worker;

// Re-export key components
pub use forge::{CorrelationTag, ParsedFrame};
pub use memory::{Mbuf, MbufPool, PoolManager};
pub use pattern::RatePattern;
pub use port::{BurstPort, LoopbackPort, PcapPort};
pub use profile::{ProfileStore, TrafficProfile};
pub use rx::{RxSummary, TagRegistry};
pub use utils::time::TscClock;
pub use worker::{EngineState, WorkerPool, WorkerRole};

use std::sync::Arc;
use thiserror::Error;

/// pktforge error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("Initialization failed: {0}")]
    Init(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Memory allocation failed: {0}")]
    MemoryAllocation(String),

    #[error("Queue error: {0}")]
    QueueError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Test aborted: {0}")]
    TestAborted(String),

    #[error("pcap error: {0}")]
    Pcap(#[from] pcap::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Engine configuration
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of mbufs per NUMA-local pool
    pub pool_size: usize,

    /// Size of each packet buffer in bytes
    pub buf_size: usize,

    /// Logical cores available to workers (the control thread keeps its own)
    pub worker_cores: Vec<usize>,

    /// Ports that are polled for received traffic, by port index
    pub rx_ports: Vec<usize>,

    /// Nominal link capacity in Mb/s, used for rate validation and as the
    /// upper bracket of the RFC 2544 throughput search
    pub link_mbps: f64,

    /// Capacity of each TX timestamp registry shard (rounded to a power of two)
    pub registry_capacity: usize,

    /// Capacity of the per-worker inbound/outbound rings
    pub ring_capacity: usize,

    /// Bound on the time a worker may spend draining in-flight buffers on stop
    pub drain_timeout: std::time::Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 8192,
            buf_size: 2048,
            worker_cores: (1..num_cpus::get().max(2)).collect(),
            rx_ports: Vec::new(),
            link_mbps: 10_000.0,
            registry_capacity: 65536,
            ring_capacity: 4096,
            drain_timeout: std::time::Duration::from_millis(100),
        }
    }
}

/// Main engine context
///
/// Owns the profile store, the NUMA pools, the worker set and the command
/// state machine. The control thread owns this value; workers only ever see
/// the shared pieces (`Arc`-held pools, counters, registry, stop flag).
pub struct Engine {
    config: EngineConfig,
    clock: Arc<TscClock>,
    pools: Arc<PoolManager>,
    ports: Vec<Arc<dyn BurstPort>>,
    store: ProfileStore,
    registry: Arc<TagRegistry>,
    rx_summary: Arc<RxSummary>,
    workers: WorkerPool,
}

impl Engine {
    /// Create a new engine over the given ports
    pub fn new(config: EngineConfig, ports: Vec<Arc<dyn BurstPort>>) -> Result<Self> {
        if ports.is_empty() {
            return Err(Error::Init("at least one port is required".to_string()));
        }
        for &rx in &config.rx_ports {
            if rx >= ports.len() {
                return Err(Error::Init(format!("rx port index {} out of range", rx)));
            }
        }
        if config.worker_cores.is_empty() {
            return Err(Error::Init("no worker cores configured".to_string()));
        }

        let clock = Arc::new(TscClock::calibrate());
        let pools = Arc::new(PoolManager::new(
            &config.worker_cores,
            config.pool_size,
            config.buf_size,
        )?);
        let tx_workers = Self::tx_worker_count(&config);
        let registry = Arc::new(TagRegistry::new(tx_workers, config.registry_capacity));
        let rx_summary = Arc::new(RxSummary::new());
        let workers = WorkerPool::new(&config, clock.clone());

        log::info!(
            "engine ready: {} ports, {} worker cores, tsc {} Hz",
            ports.len(),
            config.worker_cores.len(),
            clock.tsc_hz()
        );

        Ok(Self {
            config,
            clock,
            pools,
            ports,
            store: ProfileStore::new(),
            registry,
            rx_summary,
            workers,
        })
    }

    /// Cores used for transmit workers; the remainder run receive workers.
    fn tx_worker_count(config: &EngineConfig) -> usize {
        let rx = config
            .rx_ports
            .len()
            .min(config.worker_cores.len().saturating_sub(1));
        (config.worker_cores.len() - rx).max(1)
    }

    /// Replace the active profile set. Rejected unless the engine is IDLE.
    pub fn configure(&mut self, profiles: Vec<TrafficProfile>) -> Result<()> {
        if self.workers.state() != EngineState::Idle {
            return Err(Error::InvalidConfig(
                "cannot reconfigure while workers are running".to_string(),
            ));
        }
        for prof in &profiles {
            if prof.frame_size as usize > self.config.buf_size {
                return Err(Error::InvalidConfig(format!(
                    "profile '{}': frame size {} exceeds buffer size {}",
                    prof.name, prof.frame_size, self.config.buf_size
                )));
            }
        }
        let tx_workers = Self::tx_worker_count(&self.config);
        self.store
            .replace(profiles, self.link_mbps(), tx_workers, self.ports.len())
    }

    /// Transition IDLE -> RUNNING and launch workers on their cores.
    pub fn start(&mut self) -> Result<()> {
        self.registry.clear();
        self.workers.start(
            &self.store,
            &self.ports,
            &self.config.rx_ports,
            self.pools.clone(),
            self.registry.clone(),
            self.rx_summary.clone(),
        )
    }

    /// Signal RUNNING -> DRAINING, join workers, transition to IDLE.
    pub fn stop(&mut self) -> Result<()> {
        self.workers.stop()
    }

    /// Zero the receive summary and per-profile counters.
    pub fn reset_stats(&self) {
        self.rx_summary.reset();
        for prof in self.store.profiles() {
            prof.counters.reset();
        }
    }

    /// Snapshot of aggregate counters. Never blocks workers; all reads are
    /// relaxed atomic loads.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            state: self.workers.state(),
            tx: self.store.aggregate(),
            rx: self.rx_summary.snapshot(),
            workers: self.workers.stats(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.workers.state()
    }

    pub fn link_mbps(&self) -> f64 {
        self.ports
            .iter()
            .map(|p| p.link_mbps())
            .fold(self.config.link_mbps, f64::min)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<TscClock> {
        &self.clock
    }

    pub fn port_count(&self) -> usize {
        self.ports.len()
    }

    /// Whether a receive path is configured at all.
    pub fn has_rx_path(&self) -> bool {
        !self.config.rx_ports.is_empty()
    }

    /// Whether any profiles are installed.
    pub fn has_profiles(&self) -> bool {
        !self.store.is_empty()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if self.workers.state() != EngineState::Idle {
            let _ = self.workers.stop();
        }
    }
}

/// Aggregate engine statistics snapshot
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub state: EngineState,
    pub tx: profile::TxTotals,
    pub rx: rx::RxSnapshot,
    pub workers: Vec<worker::WorkerStatsView>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_engine() -> Engine {
        let port: Arc<dyn BurstPort> = Arc::new(LoopbackPort::new(4096, 1_000.0));
        let config = EngineConfig {
            pool_size: 512,
            worker_cores: vec![0, 1],
            rx_ports: vec![0],
            link_mbps: 1_000.0,
            ..Default::default()
        };
        Engine::new(config, vec![port]).unwrap()
    }

    #[test]
    fn test_engine_creation() {
        let engine = loopback_engine();
        assert_eq!(engine.state(), EngineState::Idle);
        assert_eq!(engine.port_count(), 1);
        assert!(engine.has_rx_path());
    }

    #[test]
    fn test_engine_requires_ports() {
        let result = Engine::new(EngineConfig::default(), Vec::new());
        assert!(matches!(result, Err(Error::Init(_))));
    }

    #[test]
    fn test_configure_rejected_while_running() {
        let mut engine = loopback_engine();
        let prof = TrafficProfile::udp(
            "cfg-test",
            "192.168.2.2:5000".parse().unwrap(),
            512,
            10.0,
        );
        engine.configure(vec![prof.clone()]).unwrap();
        engine.start().unwrap();
        assert_eq!(engine.state(), EngineState::Running);
        assert!(engine.configure(vec![prof]).is_err());
        engine.stop().unwrap();
        assert_eq!(engine.state(), EngineState::Idle);
    }
}
