//! Lock-free single-producer single-consumer packet ring
//!
//! Fixed power-of-two capacity, cache-padded indices. Carries raw mbuf
//! pointers between exactly one producer thread and one consumer thread:
//! worker inbound/outbound queues and the loopback port are built on it.
//! Multi-producer layouts are handled by sharding at the caller, never by
//! widening the ring.

use crate::memory::Mbuf;
use crossbeam_utils::CachePadded;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// SPSC ring of mbuf pointers
pub struct PktRing {
    /// Slot storage
    slots: Box<[UnsafeCell<*mut Mbuf>]>,
    /// Mask for index wrapping (capacity - 1)
    mask: usize,
    /// Consumer index
    head: CachePadded<AtomicUsize>,
    /// Producer index
    tail: CachePadded<AtomicUsize>,
    /// Drop counter for full-ring pushes
    drops: AtomicUsize,
}

unsafe impl Send for PktRing {}
unsafe impl Sync for PktRing {}

impl PktRing {
    /// Create a ring; capacity is rounded up to the next power of two
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2).next_power_of_two();
        let slots = (0..capacity)
            .map(|_| UnsafeCell::new(std::ptr::null_mut()))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            slots,
            mask: capacity - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            drops: AtomicUsize::new(0),
        }
    }

    /// Push one packet; returns false when the ring is full
    #[inline]
    pub fn push(&self, pkt: *mut Mbuf) -> bool {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        if tail.wrapping_sub(head) > self.mask {
            self.drops.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        unsafe {
            *self.slots[tail & self.mask].get() = pkt;
        }
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        true
    }

    /// Pop one packet
    #[inline]
    pub fn pop(&self) -> Option<*mut Mbuf> {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        if head == tail {
            return None;
        }
        let pkt = unsafe { *self.slots[head & self.mask].get() };
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(pkt)
    }

    /// Push up to `pkts.len()` packets; returns how many were accepted
    pub fn push_burst(&self, pkts: &[*mut Mbuf]) -> usize {
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let free = self.mask + 1 - tail.wrapping_sub(head);
        let count = pkts.len().min(free);

        for (i, &pkt) in pkts[..count].iter().enumerate() {
            unsafe {
                *self.slots[(tail.wrapping_add(i)) & self.mask].get() = pkt;
            }
        }
        self.tail.store(tail.wrapping_add(count), Ordering::Release);

        if count < pkts.len() {
            self.drops
                .fetch_add(pkts.len() - count, Ordering::Relaxed);
        }
        count
    }

    /// Pop up to `out.len()` packets; returns how many were produced
    pub fn pop_burst(&self, out: &mut [*mut Mbuf]) -> usize {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let count = out.len().min(tail.wrapping_sub(head));

        for (i, slot) in out[..count].iter_mut().enumerate() {
            *slot = unsafe { *self.slots[(head.wrapping_add(i)) & self.mask].get() };
        }
        self.head.store(head.wrapping_add(count), Ordering::Release);
        count
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.tail
            .load(Ordering::Acquire)
            .wrapping_sub(self.head.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Packets rejected because the ring was full
    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn fake(v: usize) -> *mut Mbuf {
        v as *mut Mbuf
    }

    #[test]
    fn test_push_pop() {
        let ring = PktRing::new(8);
        assert!(ring.is_empty());
        assert!(ring.push(fake(1)));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.pop(), Some(fake(1)));
        assert!(ring.pop().is_none());
    }

    #[test]
    fn test_full_ring_rejects() {
        let ring = PktRing::new(4);
        for i in 0..4 {
            assert!(ring.push(fake(i + 1)));
        }
        assert!(!ring.push(fake(99)));
        assert_eq!(ring.drops(), 1);
    }

    #[test]
    fn test_capacity_rounds_up() {
        let ring = PktRing::new(100);
        assert_eq!(ring.capacity(), 128);
    }

    #[test]
    fn test_burst_operations() {
        let ring = PktRing::new(8);
        let input: Vec<_> = (1..=6).map(fake).collect();
        assert_eq!(ring.push_burst(&input), 6);

        let mut out = [std::ptr::null_mut(); 8];
        let n = ring.pop_burst(&mut out);
        assert_eq!(n, 6);
        assert_eq!(&out[..6], &input[..]);
    }

    #[test]
    fn test_burst_partial_accept() {
        let ring = PktRing::new(4);
        let input: Vec<_> = (1..=6).map(fake).collect();
        assert_eq!(ring.push_burst(&input), 4);
        assert_eq!(ring.drops(), 2);
    }

    #[test]
    fn test_wraparound() {
        let ring = PktRing::new(4);
        for round in 0..100usize {
            assert!(ring.push(fake(round + 1)));
            assert_eq!(ring.pop(), Some(fake(round + 1)));
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn test_spsc_cross_thread() {
        let ring = Arc::new(PktRing::new(1024));
        let producer_ring = ring.clone();
        let count = 100_000usize;

        let producer = std::thread::spawn(move || {
            for i in 1..=count {
                while !producer_ring.push(fake(i)) {
                    std::hint::spin_loop();
                }
            }
        });

        let mut expected = 1usize;
        while expected <= count {
            if let Some(pkt) = ring.pop() {
                assert_eq!(pkt, fake(expected));
                expected += 1;
            }
        }
        producer.join().unwrap();
    }
}
