//! Receive-side correlation
//!
//! The TX worker records (sequence, tx timestamp) pairs into the timestamp
//! registry at emission; the RX worker takes them back out at receipt and
//! reconstructs loss, reordering, duplication and latency from the
//! correlation tag.
//!
//! The registry is a fixed ring of atomic slots indexed by sequence modulo
//! capacity, one shard per TX worker so every shard keeps a single writer.
//! Stale entries are overwritten as the sequence space wraps the ring; that
//! overwrite is the eviction policy, and the reachable latency horizon is
//! capacity times the inter-packet interval.

use crate::forge;
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Sentinel for an empty registry slot
const SLOT_EMPTY: u64 = u64::MAX;

struct Slot {
    seq: AtomicU64,
    tx_ns: AtomicU64,
}

struct RegistryShard {
    slots: Box<[CachePadded<Slot>]>,
    mask: usize,
}

impl RegistryShard {
    fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| {
                CachePadded::new(Slot {
                    seq: AtomicU64::new(SLOT_EMPTY),
                    tx_ns: AtomicU64::new(0),
                })
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: capacity - 1,
        }
    }

    #[inline]
    fn record(&self, seq: u32, tx_ns: u64) {
        let slot = &self.slots[seq as usize & self.mask];
        slot.tx_ns.store(tx_ns, Ordering::Relaxed);
        slot.seq.store(seq as u64, Ordering::Release);
    }

    #[inline]
    fn take(&self, seq: u32) -> Option<u64> {
        let slot = &self.slots[seq as usize & self.mask];
        if slot.seq.load(Ordering::Acquire) != seq as u64 {
            return None;
        }
        let tx_ns = slot.tx_ns.load(Ordering::Relaxed);
        slot.seq.store(SLOT_EMPTY, Ordering::Release);
        Some(tx_ns)
    }

    fn clear(&self) {
        for slot in self.slots.iter() {
            slot.seq.store(SLOT_EMPTY, Ordering::Relaxed);
        }
    }
}

/// Sharded sequence -> TX timestamp map
///
/// Streams are pinned to TX workers by `stream_id % shards`, so each shard
/// sees exactly one writer and the slots never need compare-and-swap.
pub struct TagRegistry {
    shards: Vec<RegistryShard>,
}

impl TagRegistry {
    pub fn new(shards: usize, capacity_per_shard: usize) -> Self {
        let shards = (0..shards.max(1))
            .map(|_| RegistryShard::new(capacity_per_shard))
            .collect();
        Self { shards }
    }

    #[inline]
    fn shard(&self, stream_id: u16) -> &RegistryShard {
        &self.shards[stream_id as usize % self.shards.len()]
    }

    /// Record an emission; called by the stream's owning TX worker only
    #[inline]
    pub fn record(&self, stream_id: u16, seq: u32, tx_ns: u64) {
        self.shard(stream_id).record(seq, tx_ns);
    }

    /// Read and remove an entry at receipt
    #[inline]
    pub fn take(&self, stream_id: u16, seq: u32) -> Option<u64> {
        self.shard(stream_id).take(seq)
    }

    /// Empty every shard; called while workers are idle
    pub fn clear(&self) {
        for shard in &self.shards {
            shard.clear();
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }
}

/// Receive summary, shared between the RX worker (writer) and the control
/// thread (relaxed reader)
#[derive(Debug)]
pub struct RxSummary {
    pub packets_received: AtomicU64,
    pub bytes_received: AtomicU64,
    pub lost_packets: AtomicU64,
    pub out_of_order: AtomicU64,
    pub duplicates: AtomicU64,
    /// Tagged arrivals whose registry entry had already been evicted
    pub late_arrivals: AtomicU64,
    pub min_latency_ns: AtomicU64,
    pub max_latency_ns: AtomicU64,
    pub sum_latency_ns: AtomicU64,
    pub latency_samples: AtomicU64,
}

impl RxSummary {
    pub fn new() -> Self {
        Self {
            packets_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            lost_packets: AtomicU64::new(0),
            out_of_order: AtomicU64::new(0),
            duplicates: AtomicU64::new(0),
            late_arrivals: AtomicU64::new(0),
            min_latency_ns: AtomicU64::new(u64::MAX),
            max_latency_ns: AtomicU64::new(0),
            sum_latency_ns: AtomicU64::new(0),
            latency_samples: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn record_latency(&self, latency_ns: u64) {
        self.min_latency_ns.fetch_min(latency_ns, Ordering::Relaxed);
        self.max_latency_ns.fetch_max(latency_ns, Ordering::Relaxed);
        self.sum_latency_ns.fetch_add(latency_ns, Ordering::Relaxed);
        self.latency_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn reset(&self) {
        self.packets_received.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.lost_packets.store(0, Ordering::Relaxed);
        self.out_of_order.store(0, Ordering::Relaxed);
        self.duplicates.store(0, Ordering::Relaxed);
        self.late_arrivals.store(0, Ordering::Relaxed);
        self.min_latency_ns.store(u64::MAX, Ordering::Relaxed);
        self.max_latency_ns.store(0, Ordering::Relaxed);
        self.sum_latency_ns.store(0, Ordering::Relaxed);
        self.latency_samples.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> RxSnapshot {
        let samples = self.latency_samples.load(Ordering::Relaxed);
        let sum = self.sum_latency_ns.load(Ordering::Relaxed);
        let min = self.min_latency_ns.load(Ordering::Relaxed);
        let max = self.max_latency_ns.load(Ordering::Relaxed);
        let (min, jitter) = if samples == 0 {
            (0, 0)
        } else {
            (min, max.saturating_sub(min))
        };
        RxSnapshot {
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            lost_packets: self.lost_packets.load(Ordering::Relaxed),
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            late_arrivals: self.late_arrivals.load(Ordering::Relaxed),
            min_latency_ns: min,
            max_latency_ns: max,
            avg_latency_ns: if samples > 0 { sum / samples } else { 0 },
            jitter_ns: jitter,
            latency_samples: samples,
        }
    }
}

impl Default for RxSummary {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time receive statistics
#[derive(Debug, Clone, Copy, Default)]
pub struct RxSnapshot {
    pub packets_received: u64,
    pub bytes_received: u64,
    pub lost_packets: u64,
    pub out_of_order: u64,
    pub duplicates: u64,
    pub late_arrivals: u64,
    pub min_latency_ns: u64,
    pub max_latency_ns: u64,
    pub avg_latency_ns: u64,
    pub jitter_ns: u64,
    pub latency_samples: u64,
}

/// Per-stream sequence reconstruction, owned by a single RX worker
pub struct Correlator {
    registry: Arc<TagRegistry>,
    summary: Arc<RxSummary>,
    expected_seq: Box<[u32]>,
}

impl Correlator {
    pub fn new(registry: Arc<TagRegistry>, summary: Arc<RxSummary>) -> Self {
        Self {
            registry,
            summary,
            expected_seq: vec![0u32; usize::from(u16::MAX) + 1].into_boxed_slice(),
        }
    }

    /// Process one received frame
    pub fn process_frame(&mut self, frame: &[u8], rx_ns: u64) {
        self.summary.packets_received.fetch_add(1, Ordering::Relaxed);
        self.summary
            .bytes_received
            .fetch_add(frame.len() as u64, Ordering::Relaxed);

        let Some((_, tag)) = forge::locate_tag(frame) else {
            return;
        };

        match self.registry.take(tag.stream_id, tag.sequence) {
            Some(_) => {
                let latency = rx_ns.saturating_sub(tag.tx_timestamp_ns);
                self.summary.record_latency(latency);
            }
            None => {
                self.summary.late_arrivals.fetch_add(1, Ordering::Relaxed);
            }
        }

        let expected = &mut self.expected_seq[tag.stream_id as usize];
        let seq = tag.sequence;
        if seq == *expected {
            *expected += 1;
        } else if seq > *expected {
            self.summary
                .lost_packets
                .fetch_add((seq - *expected) as u64, Ordering::Relaxed);
            *expected = seq + 1;
        } else if *expected >= 1 && seq == *expected - 1 {
            self.summary.duplicates.fetch_add(1, Ordering::Relaxed);
        } else {
            self.summary.out_of_order.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Reset stream cursors; paired with `RxSummary::reset` on test start
    pub fn reset_cursors(&mut self) {
        self.expected_seq.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forge::forge_into;
    use crate::profile::TrafficProfile;
    use rand::rngs::SmallRng;
    use rand::SeedableRng;

    #[test]
    fn test_registry_record_take() {
        let reg = TagRegistry::new(1, 1024);
        reg.record(0, 42, 1_000_000);
        assert_eq!(reg.take(0, 42), Some(1_000_000));
        // Read-and-remove: second take misses
        assert_eq!(reg.take(0, 42), None);
    }

    #[test]
    fn test_registry_miss() {
        let reg = TagRegistry::new(1, 1024);
        assert_eq!(reg.take(0, 7), None);
    }

    #[test]
    fn test_registry_wrap_evicts() {
        let reg = TagRegistry::new(1, 64);
        reg.record(0, 5, 111);
        // Same slot, one ring later
        reg.record(0, 5 + 64, 222);
        assert_eq!(reg.take(0, 5), None, "overwritten entry must be gone");
        assert_eq!(reg.take(0, 5 + 64), Some(222));
    }

    #[test]
    fn test_registry_shards_by_stream() {
        let reg = TagRegistry::new(2, 64);
        assert_eq!(reg.shard_count(), 2);
        reg.record(0, 9, 100);
        reg.record(1, 9, 200);
        assert_eq!(reg.take(0, 9), Some(100));
        assert_eq!(reg.take(1, 9), Some(200));
    }

    #[test]
    fn test_registry_clear() {
        let reg = TagRegistry::new(1, 64);
        reg.record(0, 3, 30);
        reg.clear();
        assert_eq!(reg.take(0, 3), None);
    }

    fn tagged_frame(stream_id: u16, seq: u32, tx_ns: u64) -> Vec<u8> {
        let mut prof =
            TrafficProfile::udp("corr", "10.0.0.2:5000".parse().unwrap(), 128, 100.0);
        prof.stream_id = stream_id;
        let mut rng = SmallRng::seed_from_u64(1);
        let mut buf = vec![0u8; 128];
        forge_into(&prof, seq, tx_ns, &mut rng, &mut buf).unwrap();
        buf
    }

    fn correlator() -> (Correlator, Arc<TagRegistry>, Arc<RxSummary>) {
        let registry = Arc::new(TagRegistry::new(1, 1024));
        let summary = Arc::new(RxSummary::new());
        (
            Correlator::new(registry.clone(), summary.clone()),
            registry,
            summary,
        )
    }

    #[test]
    fn test_in_order_stream() {
        let (mut corr, registry, summary) = correlator();
        for seq in 0..10u32 {
            let tx_ns = 1_000 * seq as u64;
            registry.record(0, seq, tx_ns);
            corr.process_frame(&tagged_frame(0, seq, tx_ns), tx_ns + 500);
        }
        let snap = summary.snapshot();
        assert_eq!(snap.packets_received, 10);
        assert_eq!(snap.lost_packets, 0);
        assert_eq!(snap.out_of_order, 0);
        assert_eq!(snap.duplicates, 0);
        assert_eq!(snap.latency_samples, 10);
        assert_eq!(snap.min_latency_ns, 500);
        assert_eq!(snap.max_latency_ns, 500);
        assert_eq!(snap.jitter_ns, 0);
    }

    #[test]
    fn test_gap_counts_lost() {
        let (mut corr, registry, summary) = correlator();
        for seq in [0u32, 1, 5] {
            registry.record(0, seq, 100);
            corr.process_frame(&tagged_frame(0, seq, 100), 200);
        }
        let snap = summary.snapshot();
        assert_eq!(snap.lost_packets, 3, "sequences 2,3,4 are lost");
    }

    #[test]
    fn test_duplicate_detection() {
        let (mut corr, registry, summary) = correlator();
        for seq in [0u32, 1, 1] {
            registry.record(0, seq, 100);
            corr.process_frame(&tagged_frame(0, seq, 100), 150);
        }
        let snap = summary.snapshot();
        assert_eq!(snap.duplicates, 1);
        assert_eq!(snap.lost_packets, 0);
    }

    #[test]
    fn test_out_of_order_detection() {
        let (mut corr, registry, summary) = correlator();
        for seq in [0u32, 1, 2, 3, 1] {
            registry.record(0, seq, 100);
            corr.process_frame(&tagged_frame(0, seq, 100), 150);
        }
        let snap = summary.snapshot();
        assert_eq!(snap.out_of_order, 1);
    }

    #[test]
    fn test_unmatched_arrival_is_late() {
        let (mut corr, _registry, summary) = correlator();
        // No registry entry for this sequence
        corr.process_frame(&tagged_frame(0, 0, 100), 150);
        let snap = summary.snapshot();
        assert_eq!(snap.late_arrivals, 1);
        assert_eq!(snap.latency_samples, 0, "no latency without a registry hit");
        assert_eq!(snap.packets_received, 1);
    }

    #[test]
    fn test_untagged_frame_only_counts_bytes() {
        let (mut corr, _registry, summary) = correlator();
        let frame = vec![0u8; 64];
        corr.process_frame(&frame, 100);
        let snap = summary.snapshot();
        assert_eq!(snap.packets_received, 1);
        assert_eq!(snap.bytes_received, 64);
        assert_eq!(snap.latency_samples, 0);
        assert_eq!(snap.late_arrivals, 0);
    }

    #[test]
    fn test_streams_track_independent_cursors() {
        let (mut corr, registry, summary) = correlator();
        for (stream, seq) in [(1u16, 0u32), (2, 0), (1, 1), (2, 1)] {
            registry.record(stream, seq, 100);
            corr.process_frame(&tagged_frame(stream, seq, 100), 150);
        }
        let snap = summary.snapshot();
        assert_eq!(snap.lost_packets, 0);
        assert_eq!(snap.out_of_order, 0);
    }

    #[test]
    fn test_summary_reset() {
        let (mut corr, registry, summary) = correlator();
        registry.record(0, 0, 100);
        corr.process_frame(&tagged_frame(0, 0, 100), 150);
        summary.reset();
        corr.reset_cursors();
        let snap = summary.snapshot();
        assert_eq!(snap.packets_received, 0);
        assert_eq!(snap.latency_samples, 0);
        assert_eq!(snap.min_latency_ns, 0);
    }

    #[test]
    fn test_latency_jitter() {
        let (mut corr, registry, summary) = correlator();
        for (seq, latency) in [(0u32, 1_000u64), (1, 3_000), (2, 2_000)] {
            registry.record(0, seq, 10_000);
            corr.process_frame(&tagged_frame(0, seq, 10_000), 10_000 + latency);
        }
        let snap = summary.snapshot();
        assert_eq!(snap.min_latency_ns, 1_000);
        assert_eq!(snap.max_latency_ns, 3_000);
        assert_eq!(snap.avg_latency_ns, 2_000);
        assert_eq!(snap.jitter_ns, 2_000);
    }
}
