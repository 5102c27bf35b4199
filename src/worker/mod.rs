//! Per-core workers and the engine state machine
//!
//! One TX worker per assigned core paces and forges the profiles it owns;
//! an optional RX worker per receive port runs the correlator. The control
//! thread owns the IDLE/RUNNING/DRAINING state machine; workers observe a
//! single shared stop flag and acknowledge it by exiting their loop within
//! one burst. Profile runtime state (sequence numbers, pacing deadlines)
//! lives on the worker stack, so every profile has exactly one writer.

use crate::impair::{BurstLossState, ImpairmentEngine};
use crate::memory::{mbuf_clone, mbuf_free, Mbuf, MbufPool, PoolManager};
use crate::port::{BurstPort, BURST_SIZE};
use crate::profile::{ProfileStore, TrafficProfile};
use crate::ring::PktRing;
use crate::rx::{Correlator, RxSummary, TagRegistry};
use crate::utils::cpu::{pin_current_thread, CpuTopology};
use crate::utils::time::TscClock;
use crate::{EngineConfig, Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

bitflags::bitflags! {
    /// Worker role flags
    pub struct WorkerRole: u32 {
        const TX = 0x01;
        const RX = 0x02;
    }
}

/// Command-level engine state, owned by the control thread
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Running,
    Draining,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EngineState::Idle => "idle",
            EngineState::Running => "running",
            EngineState::Draining => "draining",
        };
        f.write_str(s)
    }
}

/// Per-worker counters
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub packets_processed: AtomicU64,
    pub bytes_processed: AtomicU64,
    /// TSC cycles spent on emission/correlation work, idle polling excluded
    pub cycles_processed: AtomicU64,
}

/// Control-plane view of one worker
#[derive(Debug, Clone)]
pub struct WorkerStatsView {
    pub core: usize,
    pub numa_node: usize,
    pub role: String,
    pub packets_processed: u64,
    pub bytes_processed: u64,
    pub cycles_processed: u64,
}

struct WorkerHandle {
    core: usize,
    numa_node: usize,
    role: WorkerRole,
    stats: Arc<WorkerStats>,
    // Uniform worker attachment; idle in the single-path layout
    #[allow(dead_code)]
    inbound: Arc<PktRing>,
    #[allow(dead_code)]
    outbound: Arc<PktRing>,
    thread: Option<JoinHandle<()>>,
}

/// Worker launch/join coordinator
pub struct WorkerPool {
    clock: Arc<TscClock>,
    worker_cores: Vec<usize>,
    ring_capacity: usize,
    drain_timeout: Duration,
    topology: CpuTopology,
    stop: Arc<AtomicBool>,
    state: EngineState,
    handles: Vec<WorkerHandle>,
}

impl WorkerPool {
    pub fn new(config: &EngineConfig, clock: Arc<TscClock>) -> Self {
        Self {
            clock,
            worker_cores: config.worker_cores.clone(),
            ring_capacity: config.ring_capacity,
            drain_timeout: config.drain_timeout,
            topology: CpuTopology::detect(),
            stop: Arc::new(AtomicBool::new(false)),
            state: EngineState::Idle,
            handles: Vec::new(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Launch TX workers for every owned profile set and one RX worker per
    /// receive port. IDLE -> RUNNING.
    pub fn start(
        &mut self,
        store: &ProfileStore,
        ports: &[Arc<dyn BurstPort>],
        rx_ports: &[usize],
        pools: Arc<PoolManager>,
        registry: Arc<TagRegistry>,
        rx_summary: Arc<RxSummary>,
    ) -> Result<()> {
        if self.state != EngineState::Idle {
            return Err(Error::InvalidConfig(format!(
                "cannot start while {}",
                self.state
            )));
        }
        if store.is_empty() {
            return Err(Error::InvalidConfig("no profiles configured".to_string()));
        }

        let rx_count = rx_ports.len().min(self.worker_cores.len().saturating_sub(1));
        let tx_count = (self.worker_cores.len() - rx_count).max(1);

        self.stop.store(false, Ordering::Release);

        for w in 0..tx_count {
            let core = self.worker_cores[w];
            let numa_node = self.topology.numa_node_of(core);
            let ctx = TxWorkerCtx {
                core,
                worker_index: w,
                clock: self.clock.clone(),
                pool: pools.pool_for_node(numa_node).clone(),
                ports: ports.to_vec(),
                profiles: store.for_worker(w),
                registry: registry.clone(),
                stop: self.stop.clone(),
                stats: Arc::new(WorkerStats::default()),
            };
            self.spawn(ctx.core, numa_node, WorkerRole::TX, ctx.stats.clone(), move || {
                tx_worker_main(ctx)
            })?;
        }

        for (i, &port_idx) in rx_ports.iter().take(rx_count).enumerate() {
            let core = self.worker_cores[tx_count + i];
            let numa_node = self.topology.numa_node_of(core);
            let ctx = RxWorkerCtx {
                core,
                clock: self.clock.clone(),
                port: ports[port_idx].clone(),
                registry: registry.clone(),
                summary: rx_summary.clone(),
                stop: self.stop.clone(),
                stats: Arc::new(WorkerStats::default()),
                drain_timeout: self.drain_timeout,
            };
            self.spawn(ctx.core, numa_node, WorkerRole::RX, ctx.stats.clone(), move || {
                rx_worker_main(ctx)
            })?;
        }

        self.state = EngineState::Running;
        log::info!(
            "workers started: {} tx, {} rx",
            tx_count,
            rx_count
        );
        Ok(())
    }

    fn spawn<F>(
        &mut self,
        core: usize,
        numa_node: usize,
        role: WorkerRole,
        stats: Arc<WorkerStats>,
        body: F,
    ) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let name = format!(
            "pktforge-{}{}",
            if role.contains(WorkerRole::TX) { "tx" } else { "rx" },
            core
        );
        let thread = std::thread::Builder::new()
            .name(name)
            .spawn(body)
            .map_err(Error::IoError)?;

        self.handles.push(WorkerHandle {
            core,
            numa_node,
            role,
            stats,
            inbound: Arc::new(PktRing::new(self.ring_capacity)),
            outbound: Arc::new(PktRing::new(self.ring_capacity)),
            thread: Some(thread),
        });
        Ok(())
    }

    /// RUNNING -> DRAINING -> IDLE. Idempotent when already idle.
    pub fn stop(&mut self) -> Result<()> {
        if self.state == EngineState::Idle {
            return Ok(());
        }

        self.state = EngineState::Draining;
        self.stop.store(true, Ordering::Release);

        for handle in &mut self.handles {
            if let Some(thread) = handle.thread.take() {
                if thread.join().is_err() {
                    log::error!("worker on core {} panicked", handle.core);
                }
            }
        }
        self.handles.clear();
        self.state = EngineState::Idle;
        log::info!("workers joined, engine idle");
        Ok(())
    }

    pub fn stats(&self) -> Vec<WorkerStatsView> {
        self.handles
            .iter()
            .map(|h| WorkerStatsView {
                core: h.core,
                numa_node: h.numa_node,
                role: if h.role.contains(WorkerRole::TX) {
                    "tx".to_string()
                } else {
                    "rx".to_string()
                },
                packets_processed: h.stats.packets_processed.load(Ordering::Relaxed),
                bytes_processed: h.stats.bytes_processed.load(Ordering::Relaxed),
                cycles_processed: h.stats.cycles_processed.load(Ordering::Relaxed),
            })
            .collect()
    }
}

// ============================================================================
// TX worker
// ============================================================================

/// Impairment delays above this are applied by deferring the next send
/// instant instead of spinning on the worker core.
const SPIN_DELAY_MAX_NS: u64 = 10_000;

/// Re-check period while a pattern sits at zero rate
const ZERO_RATE_RECHECK_NS: u64 = 1_000_000;

struct TxWorkerCtx {
    core: usize,
    worker_index: usize,
    clock: Arc<TscClock>,
    pool: Arc<MbufPool>,
    ports: Vec<Arc<dyn BurstPort>>,
    profiles: Vec<Arc<TrafficProfile>>,
    registry: Arc<TagRegistry>,
    stop: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
}

/// Runtime pacing state; single-writer by construction
struct TxProfileState {
    prof: Arc<TrafficProfile>,
    port: Arc<dyn BurstPort>,
    seq: u32,
    start_tsc: u64,
    next_send_tsc: u64,
    interval_cycles: u64,
    current_rate_mbps: f64,
    burst_loss: BurstLossState,
    delay_deferred: bool,
    held: Option<*mut Mbuf>,
}

fn tx_worker_main(ctx: TxWorkerCtx) {
    if let Err(e) = pin_current_thread(ctx.core) {
        log::warn!("tx worker: could not pin to core {}: {}", ctx.core, e);
    }

    let clock = &ctx.clock;
    let tsc_hz = clock.tsc_hz();
    let mut impair = ImpairmentEngine::new(clock.now_cycles() ^ ctx.worker_index as u64);
    let zero_recheck = clock.ns_to_cycles(ZERO_RATE_RECHECK_NS);
    let spin_max = clock.ns_to_cycles(SPIN_DELAY_MAX_NS);

    let now = clock.now_cycles();
    let mut states: Vec<TxProfileState> = ctx
        .profiles
        .iter()
        .map(|prof| TxProfileState {
            port: ctx.ports[prof.port].clone(),
            seq: 0,
            start_tsc: now,
            next_send_tsc: now,
            interval_cycles: prof.interval_cycles(prof.rate_mbps, tsc_hz),
            current_rate_mbps: f64::NAN,
            burst_loss: BurstLossState::default(),
            delay_deferred: false,
            held: None,
            prof: prof.clone(),
        })
        .collect();

    log::debug!(
        "tx worker {} on core {}: {} profiles",
        ctx.worker_index,
        ctx.core,
        states.len()
    );

    while !ctx.stop.load(Ordering::Relaxed) {
        let now = clock.now_cycles();

        let mut worked = false;
        for state in states.iter_mut() {
            if state.next_send_tsc > now {
                continue;
            }
            worked = true;
            let prof = &state.prof;

            let rate = match &prof.pattern {
                Some(pattern) => {
                    let elapsed = clock.elapsed_sec(state.start_tsc, now);
                    pattern.evaluate(elapsed, impair.rng())
                }
                None => prof.rate_mbps,
            };
            if rate != state.current_rate_mbps {
                state.current_rate_mbps = rate;
                state.interval_cycles = prof.interval_cycles(rate, tsc_hz);
            }
            if rate <= 0.0 {
                state.next_send_tsc = now + zero_recheck;
                continue;
            }

            // Impairment delay: short delays spin, long ones reschedule
            let mut spin = 0u64;
            if state.delay_deferred {
                state.delay_deferred = false;
            } else {
                let delay_ns = impair.extra_delay_ns(&prof.impairment);
                if delay_ns > 0 {
                    let delay_cycles = clock.ns_to_cycles(delay_ns);
                    if delay_cycles > spin_max {
                        state.next_send_tsc = now + delay_cycles;
                        state.delay_deferred = true;
                        continue;
                    }
                    spin = delay_cycles;
                }
            }

            let mut alloc_failed = false;
            for _ in 0..prof.burst_size {
                if impair.should_drop(&prof.impairment, &mut state.burst_loss) {
                    prof.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                let mbuf = match ctx.pool.alloc() {
                    Ok(m) => m,
                    Err(_) => {
                        prof.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                        alloc_failed = true;
                        break;
                    }
                };

                let tx_ns = clock.now_ns();
                unsafe {
                    let m = &mut *mbuf;
                    m.len = prof.frame_size as usize;
                    let buf = std::slice::from_raw_parts_mut(m.data, m.len);
                    if crate::forge::forge_into(prof, state.seq, tx_ns, impair.rng(), buf)
                        .is_err()
                    {
                        mbuf_free(mbuf);
                        prof.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                }
                if prof.embeds_tag() {
                    ctx.registry.record(prof.stream_id, state.seq, tx_ns);
                }
                state.seq = state.seq.wrapping_add(1);

                if spin > 0 {
                    clock.spin_cycles(spin);
                    spin = 0;
                }

                if state.held.is_none() && impair.should_reorder(&prof.impairment) {
                    // Held back one slot so a later sequence overtakes it
                    state.held = Some(mbuf);
                    continue;
                }

                transmit(state, mbuf, &mut impair, &ctx.stats);
                if let Some(held) = state.held.take() {
                    transmit(state, held, &mut impair, &ctx.stats);
                }
            }

            // Additive advancement keeps long-run pacing drift-free; a
            // worker that has fallen more than one interval behind snaps
            // forward and discards the backlog.
            if alloc_failed {
                continue;
            }
            let interval = state.interval_cycles * prof.burst_size as u64;
            state.next_send_tsc = state.next_send_tsc.wrapping_add(interval);
            if now.wrapping_sub(state.next_send_tsc) as i64 > interval as i64 {
                state.next_send_tsc = now;
            }
        }

        if worked {
            ctx.stats
                .cycles_processed
                .fetch_add(clock.now_cycles().wrapping_sub(now), Ordering::Relaxed);
        }
    }

    // DRAINING: release anything still held back
    for state in states.iter_mut() {
        if let Some(held) = state.held.take() {
            unsafe { mbuf_free(held) };
        }
    }
}

fn transmit(
    state: &TxProfileState,
    mbuf: *mut Mbuf,
    impair: &mut ImpairmentEngine,
    stats: &WorkerStats,
) {
    let prof = &state.prof;
    let frame_bytes = prof.frame_size as u64;

    if state.port.tx_burst(&[mbuf]) == 0 {
        unsafe { mbuf_free(mbuf) };
        prof.counters.packets_dropped.fetch_add(1, Ordering::Relaxed);
        return;
    }

    prof.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
    prof.counters.bytes_sent.fetch_add(frame_bytes, Ordering::Relaxed);
    stats.packets_processed.fetch_add(1, Ordering::Relaxed);
    stats.bytes_processed.fetch_add(frame_bytes, Ordering::Relaxed);

    if impair.should_duplicate(&prof.impairment) {
        let dup = unsafe { mbuf_clone(mbuf) };
        if state.port.tx_burst(&[dup]) == 0 {
            unsafe { mbuf_free(dup) };
        } else {
            prof.counters
                .packets_duplicated
                .fetch_add(1, Ordering::Relaxed);
            prof.counters.bytes_sent.fetch_add(frame_bytes, Ordering::Relaxed);
        }
    }
}

// ============================================================================
// RX worker
// ============================================================================

struct RxWorkerCtx {
    core: usize,
    clock: Arc<TscClock>,
    port: Arc<dyn BurstPort>,
    registry: Arc<TagRegistry>,
    summary: Arc<RxSummary>,
    stop: Arc<AtomicBool>,
    stats: Arc<WorkerStats>,
    drain_timeout: Duration,
}

fn rx_worker_main(ctx: RxWorkerCtx) {
    if let Err(e) = pin_current_thread(ctx.core) {
        log::warn!("rx worker: could not pin to core {}: {}", ctx.core, e);
    }

    let mut correlator = Correlator::new(ctx.registry.clone(), ctx.summary.clone());
    let mut bufs: [*mut Mbuf; BURST_SIZE] = [std::ptr::null_mut(); BURST_SIZE];

    while !ctx.stop.load(Ordering::Relaxed) {
        let n = ctx.port.rx_burst(&mut bufs);
        if n == 0 {
            std::hint::spin_loop();
            continue;
        }
        process_burst(&ctx, &mut correlator, &bufs[..n]);
    }

    // DRAINING: bounded sweep of in-flight buffers. The TX side observes
    // the same stop flag, so a short empty streak means the pipe is dry.
    let deadline = ctx.clock.now_ns() + ctx.drain_timeout.as_nanos() as u64;
    let mut idle_polls = 0u32;
    while ctx.clock.now_ns() < deadline {
        let n = ctx.port.rx_burst(&mut bufs);
        if n == 0 {
            idle_polls += 1;
            if idle_polls > 3 {
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
            continue;
        }
        idle_polls = 0;
        process_burst(&ctx, &mut correlator, &bufs[..n]);
    }
}

fn process_burst(ctx: &RxWorkerCtx, correlator: &mut Correlator, bufs: &[*mut Mbuf]) {
    let start_cycles = ctx.clock.now_cycles();
    let rx_ns = ctx.clock.now_ns();
    for &pkt in bufs {
        unsafe {
            let frame = (*pkt).data();
            correlator.process_frame(frame, rx_ns);
            ctx.stats.packets_processed.fetch_add(1, Ordering::Relaxed);
            ctx.stats
                .bytes_processed
                .fetch_add(frame.len() as u64, Ordering::Relaxed);
            mbuf_free(pkt);
        }
    }
    ctx.stats.cycles_processed.fetch_add(
        ctx.clock.now_cycles().wrapping_sub(start_cycles),
        Ordering::Relaxed,
    );
}
