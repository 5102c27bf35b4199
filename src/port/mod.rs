//! Burst-I/O port boundary
//!
//! The engine core only ever sees this trait: a burst transmit, a burst
//! receive and a link capacity. `PcapPort` adapts a libpcap handle for
//! runs against real interfaces; `LoopbackPort` connects TX directly to RX
//! through an SPSC ring and backs the test suite and single-host runs.

use crate::memory::{mbuf_free, Mbuf, MbufPool};
use crate::ring::PktRing;
use crate::{Error, Result};
use parking_lot::Mutex;
use pcap::{Active, Capture};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Maximum packets moved by one burst call
pub const BURST_SIZE: usize = 64;

/// Port statistics
#[derive(Debug, Default)]
pub struct PortStats {
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub tx_errors: AtomicU64,
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
}

/// Burst transmit/receive boundary the workers drive
///
/// `tx_burst` consumes the packets it accepts; rejected packets stay owned
/// by the caller, which frees them and counts a drop.
pub trait BurstPort: Send + Sync {
    /// Transmit up to `pkts.len()` packets, returning how many were accepted
    fn tx_burst(&self, pkts: &[*mut Mbuf]) -> usize;

    /// Receive up to `out.len()` packets, returning how many were produced
    fn rx_burst(&self, out: &mut [*mut Mbuf]) -> usize;

    /// Nominal link capacity in Mb/s
    fn link_mbps(&self) -> f64;

    /// Counter snapshot source
    fn stats(&self) -> &PortStats;
}

/// In-memory port: transmitted buffers appear on the receive side untouched
pub struct LoopbackPort {
    ring: PktRing,
    link_mbps: f64,
    stats: PortStats,
}

impl LoopbackPort {
    pub fn new(queue_depth: usize, link_mbps: f64) -> Self {
        Self {
            ring: PktRing::new(queue_depth),
            link_mbps,
            stats: PortStats::default(),
        }
    }

    /// Packets sitting in the loopback queue
    pub fn pending(&self) -> usize {
        self.ring.len()
    }
}

impl Drop for LoopbackPort {
    fn drop(&mut self) {
        while let Some(pkt) = self.ring.pop() {
            unsafe { mbuf_free(pkt) };
        }
    }
}

impl BurstPort for LoopbackPort {
    fn tx_burst(&self, pkts: &[*mut Mbuf]) -> usize {
        let sent = self.ring.push_burst(pkts);
        let mut bytes = 0u64;
        for &pkt in &pkts[..sent] {
            bytes += unsafe { (*pkt).len as u64 };
        }
        self.stats.tx_packets.fetch_add(sent as u64, Ordering::Relaxed);
        self.stats.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
        sent
    }

    fn rx_burst(&self, out: &mut [*mut Mbuf]) -> usize {
        let n = self.ring.pop_burst(out);
        let mut bytes = 0u64;
        for &pkt in &out[..n] {
            bytes += unsafe { (*pkt).len as u64 };
        }
        self.stats.rx_packets.fetch_add(n as u64, Ordering::Relaxed);
        self.stats.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
        n
    }

    fn link_mbps(&self) -> f64 {
        self.link_mbps
    }

    fn stats(&self) -> &PortStats {
        &self.stats
    }
}

/// libpcap-backed port for real interfaces
pub struct PcapPort {
    capture: Mutex<Capture<Active>>,
    pool: Arc<MbufPool>,
    link_mbps: f64,
    stats: PortStats,
}

impl PcapPort {
    /// Open an interface in immediate mode with a short poll timeout
    pub fn open(interface: &str, pool: Arc<MbufPool>, link_mbps: f64) -> Result<Self> {
        let capture = Capture::from_device(interface)?
            .promisc(true)
            .snaplen(65535)
            .immediate_mode(true)
            .timeout(1)
            .open()?;

        log::info!("pcap port open on {} ({} Mb/s)", interface, link_mbps);

        Ok(Self {
            capture: Mutex::new(capture),
            pool,
            link_mbps,
            stats: PortStats::default(),
        })
    }
}

impl BurstPort for PcapPort {
    fn tx_burst(&self, pkts: &[*mut Mbuf]) -> usize {
        let mut capture = self.capture.lock();
        let mut sent = 0;
        for &pkt in pkts {
            let data = unsafe { (*pkt).data() };
            match capture.sendpacket(data) {
                Ok(()) => {
                    self.stats.tx_packets.fetch_add(1, Ordering::Relaxed);
                    self.stats
                        .tx_bytes
                        .fetch_add(data.len() as u64, Ordering::Relaxed);
                    unsafe { mbuf_free(pkt) };
                    sent += 1;
                }
                Err(_) => {
                    self.stats.tx_errors.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            }
        }
        sent
    }

    fn rx_burst(&self, out: &mut [*mut Mbuf]) -> usize {
        let mut capture = self.capture.lock();
        let mut received = 0;

        for slot in out.iter_mut() {
            let packet = match capture.next_packet() {
                Ok(p) => p,
                Err(pcap::Error::TimeoutExpired) => break,
                Err(_) => break,
            };

            let Ok(mbuf) = self.pool.alloc() else {
                break;
            };

            let data_len = packet.data.len();
            unsafe {
                let m = &mut *mbuf;
                if data_len > m.buf_len {
                    mbuf_free(mbuf);
                    continue;
                }
                std::ptr::copy_nonoverlapping(packet.data.as_ptr(), m.data, data_len);
                m.len = data_len;
            }

            self.stats.rx_packets.fetch_add(1, Ordering::Relaxed);
            self.stats
                .rx_bytes
                .fetch_add(data_len as u64, Ordering::Relaxed);
            *slot = mbuf;
            received += 1;
        }

        received
    }

    fn link_mbps(&self) -> f64 {
        self.link_mbps
    }

    fn stats(&self) -> &PortStats {
        &self.stats
    }
}

/// Parse a port argument of the form `name[@mbps]`
pub fn parse_port_spec(spec: &str) -> Result<(String, f64)> {
    match spec.split_once('@') {
        Some((name, mbps)) => {
            let mbps: f64 = mbps.parse().map_err(|_| {
                Error::InvalidConfig(format!("invalid link speed in port spec '{}'", spec))
            })?;
            Ok((name.to_string(), mbps))
        }
        None => Ok((spec.to_string(), 10_000.0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MbufPool;

    #[test]
    fn test_loopback_transfers_packets() {
        let pool = MbufPool::new("loop".to_string(), 16, 512, 0).unwrap();
        let port = LoopbackPort::new(64, 1000.0);

        let mbuf = pool.alloc().unwrap();
        unsafe {
            (*mbuf).append(b"ping").unwrap();
        }
        assert_eq!(port.tx_burst(&[mbuf]), 1);
        assert_eq!(port.pending(), 1);

        let mut out = [std::ptr::null_mut(); BURST_SIZE];
        let n = port.rx_burst(&mut out);
        assert_eq!(n, 1);
        assert_eq!(out[0], mbuf);
        assert_eq!(unsafe { (*out[0]).data() }, b"ping");

        unsafe { mbuf_free(out[0]) };
        assert_eq!(port.stats().tx_packets.load(Ordering::Relaxed), 1);
        assert_eq!(port.stats().rx_packets.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_loopback_full_queue_partial_send() {
        let pool = MbufPool::new("full".to_string(), 16, 256, 0).unwrap();
        let port = LoopbackPort::new(4, 1000.0);

        let pkts: Vec<_> = (0..6).map(|_| pool.alloc().unwrap()).collect();
        let sent = port.tx_burst(&pkts);
        assert_eq!(sent, 4, "queue depth bounds the burst");

        // Unaccepted packets stay with the caller
        for &pkt in &pkts[sent..] {
            unsafe { mbuf_free(pkt) };
        }
        let mut out = [std::ptr::null_mut(); BURST_SIZE];
        let n = port.rx_burst(&mut out);
        for &pkt in &out[..n] {
            unsafe { mbuf_free(pkt) };
        }
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_loopback_drop_cleans_pending() {
        let pool = MbufPool::new("dropclean".to_string(), 8, 256, 0).unwrap();
        {
            let port = LoopbackPort::new(8, 1000.0);
            let mbuf = pool.alloc().unwrap();
            assert_eq!(port.tx_burst(&[mbuf]), 1);
        }
        assert_eq!(pool.stats().in_use, 0, "dropping the port frees queued buffers");
    }

    #[test]
    fn test_parse_port_spec() {
        assert_eq!(
            parse_port_spec("eth0@1000").unwrap(),
            ("eth0".to_string(), 1000.0)
        );
        assert_eq!(
            parse_port_spec("eth1").unwrap(),
            ("eth1".to_string(), 10_000.0)
        );
        assert!(parse_port_spec("eth0@fast").is_err());
    }
}
