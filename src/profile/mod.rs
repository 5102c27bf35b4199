//! Traffic profiles
//!
//! A profile bundles a forging template (L2 through payload), pacing
//! parameters, and impairment settings, plus the atomic counters the
//! control thread snapshots for stats. All validation happens here at
//! configure time; the forge path never re-checks sizes.

use crate::forge;
use crate::impair::ImpairmentConfig;
use crate::pattern::RatePattern;
use crate::{Error, Result};
use serde::Deserialize;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddrV4};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Maximum profile name length
pub const MAX_NAME_LEN: usize = 63;

/// Maximum MPLS label stack depth
pub const MPLS_MAX_LABELS: usize = 4;

/// Default source MAC for forged frames
pub const DEFAULT_SRC_MAC: [u8; 6] = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];

/// Default destination MAC for forged frames
pub const DEFAULT_DST_MAC: [u8; 6] = [0x00, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE];

/// Single 802.1Q tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct VlanTag {
    pub id: u16,
    #[serde(default)]
    pub pcp: u8,
}

/// Q-in-Q double tag; the outer TPID is configurable because deployed
/// gear disagrees between 0x88A8 and legacy 0x8100
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct QinqTags {
    pub outer_id: u16,
    pub inner_id: u16,
    #[serde(default = "default_qinq_tpid")]
    pub outer_tpid: u16,
}

fn default_qinq_tpid() -> u16 {
    forge::ETHERTYPE_QINQ
}

/// One MPLS label stack entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct MplsLabel {
    pub label: u32,
    #[serde(default)]
    pub tc: u8,
    #[serde(default = "default_mpls_ttl")]
    pub ttl: u8,
}

fn default_mpls_ttl() -> u8 {
    64
}

/// L2 forging template
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L2Template {
    pub src_mac: [u8; 6],
    pub dst_mac: [u8; 6],
    /// Single VLAN tag; mutually exclusive with `qinq`
    pub vlan: Option<VlanTag>,
    pub qinq: Option<QinqTags>,
    /// Label stack, outermost first; bottom-of-stack is set on the last
    pub mpls: Vec<MplsLabel>,
}

impl Default for L2Template {
    fn default() -> Self {
        Self {
            src_mac: DEFAULT_SRC_MAC,
            dst_mac: DEFAULT_DST_MAC,
            vlan: None,
            qinq: None,
            mpls: Vec::new(),
        }
    }
}

/// L3 selector with both endpoints and the DSCP code point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L3Endpoints {
    Ipv4 {
        src: Ipv4Addr,
        dst: Ipv4Addr,
        dscp: u8,
    },
    Ipv6 {
        src: Ipv6Addr,
        dst: Ipv6Addr,
        dscp: u8,
    },
}

impl L3Endpoints {
    pub fn dscp(&self) -> u8 {
        match *self {
            L3Endpoints::Ipv4 { dscp, .. } | L3Endpoints::Ipv6 { dscp, .. } => dscp,
        }
    }

    pub fn header_len(&self) -> usize {
        match self {
            L3Endpoints::Ipv4 { .. } => forge::IPV4_HLEN,
            L3Endpoints::Ipv6 { .. } => forge::IPV6_HLEN,
        }
    }
}

/// VXLAN encapsulation: outer UDP on 4789 plus the 8-byte shim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct VxlanOuter {
    pub vni: u32,
}

/// L4 protocol variant
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L4Proto {
    Udp {
        src_port_min: u16,
        src_port_max: u16,
        dst_port: u16,
    },
    /// Flat SYN segments; no state machine behind them
    TcpSyn {
        src_port_min: u16,
        src_port_max: u16,
        dst_port: u16,
    },
    IcmpEcho,
    /// UDP carrying a DNS A query for `domain`
    DnsQuery {
        src_port_min: u16,
        src_port_max: u16,
        dst_port: u16,
        domain: String,
    },
    /// TCP segment carrying a fixed HTTP request
    HttpRequest {
        src_port_min: u16,
        src_port_max: u16,
        dst_port: u16,
        method: String,
        uri: String,
        host: String,
    },
}

impl L4Proto {
    pub fn header_len(&self) -> usize {
        match self {
            L4Proto::Udp { .. } | L4Proto::DnsQuery { .. } => forge::UDP_HLEN,
            L4Proto::TcpSyn { .. } | L4Proto::HttpRequest { .. } => forge::TCP_HLEN,
            L4Proto::IcmpEcho => forge::ICMP_HLEN,
        }
    }

    pub fn src_port_range(&self) -> Option<(u16, u16)> {
        match *self {
            L4Proto::Udp {
                src_port_min,
                src_port_max,
                ..
            }
            | L4Proto::TcpSyn {
                src_port_min,
                src_port_max,
                ..
            }
            | L4Proto::DnsQuery {
                src_port_min,
                src_port_max,
                ..
            }
            | L4Proto::HttpRequest {
                src_port_min,
                src_port_max,
                ..
            } => Some((src_port_min, src_port_max)),
            L4Proto::IcmpEcho => None,
        }
    }
}

/// Payload fill pattern for the bytes after any embedded tag
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadKind {
    Random,
    Zeros,
    Ones,
    Increment,
    /// Caller-supplied bytes, truncated to the available length
    Fixed(Vec<u8>),
}

impl Default for PayloadKind {
    fn default() -> Self {
        PayloadKind::Random
    }
}

/// Emission counters, written by the owning worker and snapshotted by the
/// control thread with relaxed loads
#[derive(Debug, Default)]
pub struct ProfileCounters {
    pub packets_sent: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub packets_dropped: AtomicU64,
    pub packets_duplicated: AtomicU64,
}

impl ProfileCounters {
    pub fn reset(&self) {
        self.packets_sent.store(0, Ordering::Relaxed);
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.packets_dropped.store(0, Ordering::Relaxed);
        self.packets_duplicated.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            packets_duplicated: self.packets_duplicated.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of one profile's counters
#[derive(Debug, Clone, Copy, Default)]
pub struct CountersSnapshot {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub packets_dropped: u64,
    pub packets_duplicated: u64,
}

/// Aggregate transmit totals across all profiles
pub type TxTotals = CountersSnapshot;

/// Traffic profile: identity, forging template, pacing and impairments
#[derive(Debug, Clone)]
pub struct TrafficProfile {
    pub name: String,
    pub stream_id: u16,
    /// TX worker index; assigned by the store so that the registry shard
    /// for this stream has a single writer
    pub worker: usize,
    /// Port the profile transmits on
    pub port: usize,
    pub l2: L2Template,
    pub l3: L3Endpoints,
    pub vxlan: Option<VxlanOuter>,
    pub l4: L4Proto,
    pub payload: PayloadKind,
    /// Target frame size in bytes
    pub frame_size: u16,
    /// Target rate in Mb/s; the floor of any pattern
    pub rate_mbps: f64,
    pub pattern: Option<RatePattern>,
    /// Packets emitted per pacing tick
    pub burst_size: u32,
    pub impairment: ImpairmentConfig,
    pub counters: Arc<ProfileCounters>,
}

impl TrafficProfile {
    /// Plain constant-rate IPv4/UDP profile
    pub fn udp(name: &str, dst: SocketAddrV4, frame_size: u16, rate_mbps: f64) -> Self {
        Self {
            name: name.to_string(),
            stream_id: 0,
            worker: 0,
            port: 0,
            l2: L2Template::default(),
            l3: L3Endpoints::Ipv4 {
                src: Ipv4Addr::new(192, 168, 1, 1),
                dst: *dst.ip(),
                dscp: 0,
            },
            vxlan: None,
            l4: L4Proto::Udp {
                src_port_min: 10_000,
                src_port_max: 20_000,
                dst_port: dst.port(),
            },
            payload: PayloadKind::Random,
            frame_size,
            rate_mbps,
            pattern: None,
            burst_size: 1,
            impairment: ImpairmentConfig::default(),
            counters: Arc::new(ProfileCounters::default()),
        }
    }

    /// Whether frames of this profile carry a correlation tag
    pub fn embeds_tag(&self) -> bool {
        matches!(self.l4, L4Proto::Udp { .. } | L4Proto::TcpSyn { .. })
    }

    /// Smallest frame that fits the configured header stack
    pub fn min_frame_size(&self) -> usize {
        let mut len = forge::ETH_HLEN;

        if self.l2.qinq.is_some() {
            len += 2 * forge::VLAN_HLEN;
        } else if self.l2.vlan.is_some() {
            len += forge::VLAN_HLEN;
        }
        len += self.l2.mpls.len() * forge::MPLS_HLEN;
        len += self.l3.header_len();
        if self.vxlan.is_some() {
            len += forge::UDP_HLEN + forge::VXLAN_HLEN;
        }
        len += self.l4.header_len();

        len += match &self.l4 {
            L4Proto::DnsQuery { domain, .. } => forge::dns_query_len(domain),
            L4Proto::HttpRequest {
                method, uri, host, ..
            } => forge::http_request_len(method, uri, host),
            _ if self.embeds_tag() => forge::TAG_LEN,
            _ => 0,
        };

        len
    }

    /// Inter-packet interval in TSC cycles for a given instantaneous rate.
    /// Stored in cycles so the hot loop never divides.
    pub fn interval_cycles(&self, rate_mbps: f64, tsc_hz: u64) -> u64 {
        if rate_mbps <= 0.0 {
            return 0;
        }
        let frame_bits = self.frame_size as f64 * 8.0;
        let cycles = frame_bits * tsc_hz as f64 / (rate_mbps * 1e6);
        (cycles as u64).max(1)
    }

    /// Configure-time validation; never called from the forge path
    pub fn validate(&self, link_mbps: f64) -> Result<()> {
        if self.name.is_empty() || self.name.len() > MAX_NAME_LEN {
            return Err(Error::InvalidConfig(format!(
                "profile name must be 1-{} characters",
                MAX_NAME_LEN
            )));
        }

        if self.l2.vlan.is_some() && self.l2.qinq.is_some() {
            return Err(Error::InvalidConfig(
                "single VLAN and Q-in-Q are mutually exclusive".to_string(),
            ));
        }
        if let Some(vlan) = self.l2.vlan {
            if vlan.id >= 4096 || vlan.pcp >= 8 {
                return Err(Error::InvalidConfig("invalid VLAN tag".to_string()));
            }
        }
        if let Some(qinq) = self.l2.qinq {
            if qinq.outer_id >= 4096 || qinq.inner_id >= 4096 {
                return Err(Error::InvalidConfig("invalid Q-in-Q tag".to_string()));
            }
        }
        if self.l2.mpls.len() > MPLS_MAX_LABELS {
            return Err(Error::InvalidConfig(format!(
                "MPLS stack limited to {} labels",
                MPLS_MAX_LABELS
            )));
        }
        for label in &self.l2.mpls {
            if label.label >= 1 << 20 || label.tc >= 8 {
                return Err(Error::InvalidConfig("invalid MPLS label".to_string()));
            }
        }

        if self.l3.dscp() >= 64 {
            return Err(Error::InvalidConfig("DSCP must be below 64".to_string()));
        }

        if let Some(vxlan) = self.vxlan {
            if vxlan.vni >= 1 << 24 {
                return Err(Error::InvalidConfig("VXLAN VNI must fit 24 bits".to_string()));
            }
        }

        if let Some((min, max)) = self.l4.src_port_range() {
            if min > max {
                return Err(Error::InvalidConfig(format!(
                    "src_port_min {} exceeds src_port_max {}",
                    min, max
                )));
            }
        }

        if let L4Proto::DnsQuery { domain, .. } = &self.l4 {
            if domain.is_empty() || domain.split('.').any(|l| l.is_empty() || l.len() > 63) {
                return Err(Error::InvalidConfig(format!(
                    "invalid DNS query domain '{}'",
                    domain
                )));
            }
        }

        let min_frame = self.min_frame_size();
        if (self.frame_size as usize) < min_frame {
            return Err(Error::InvalidConfig(format!(
                "frame size {} below minimum {} for the configured header stack",
                self.frame_size, min_frame
            )));
        }

        if self.rate_mbps < 0.0 {
            return Err(Error::InvalidConfig("rate must be non-negative".to_string()));
        }
        if self.rate_mbps > link_mbps {
            return Err(Error::InvalidConfig(format!(
                "rate {} Mb/s exceeds link capacity {} Mb/s",
                self.rate_mbps, link_mbps
            )));
        }
        if let Some(pattern) = &self.pattern {
            pattern.validate()?;
            if pattern.peak() > link_mbps {
                return Err(Error::InvalidConfig(format!(
                    "pattern peak {} Mb/s exceeds link capacity {} Mb/s",
                    pattern.peak(),
                    link_mbps
                )));
            }
        }

        if self.burst_size == 0 {
            return Err(Error::InvalidConfig(
                "burst size must be at least 1".to_string(),
            ));
        }

        self.impairment.validate()?;

        Ok(())
    }
}

/// In-memory set of active profiles
///
/// Mutated only while workers are IDLE; the engine enforces that before
/// calling `replace`.
pub struct ProfileStore {
    profiles: Vec<Arc<TrafficProfile>>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self {
            profiles: Vec::new(),
        }
    }

    /// Atomically replace the active set. Each profile is validated and
    /// pinned to the TX worker `stream_id % tx_workers`, which keeps every
    /// registry shard single-writer.
    pub fn replace(
        &mut self,
        mut profiles: Vec<TrafficProfile>,
        link_mbps: f64,
        tx_workers: usize,
        num_ports: usize,
    ) -> Result<()> {
        let mut seen_streams = std::collections::HashSet::new();
        for prof in &mut profiles {
            prof.validate(link_mbps)?;
            if prof.port >= num_ports {
                return Err(Error::InvalidConfig(format!(
                    "profile '{}': port {} out of range",
                    prof.name, prof.port
                )));
            }
            if !seen_streams.insert(prof.stream_id) {
                return Err(Error::InvalidConfig(format!(
                    "duplicate stream id {}",
                    prof.stream_id
                )));
            }
            prof.worker = prof.stream_id as usize % tx_workers;
        }

        self.profiles = profiles.into_iter().map(Arc::new).collect();
        log::info!("profile store replaced: {} active profiles", self.profiles.len());
        Ok(())
    }

    pub fn clear(&mut self) {
        self.profiles.clear();
    }

    pub fn profiles(&self) -> &[Arc<TrafficProfile>] {
        &self.profiles
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Profiles owned by one TX worker
    pub fn for_worker(&self, worker: usize) -> Vec<Arc<TrafficProfile>> {
        self.profiles
            .iter()
            .filter(|p| p.worker == worker)
            .cloned()
            .collect()
    }

    /// Sum of all profile counters
    pub fn aggregate(&self) -> TxTotals {
        let mut total = TxTotals::default();
        for prof in &self.profiles {
            let snap = prof.counters.snapshot();
            total.packets_sent += snap.packets_sent;
            total.bytes_sent += snap.bytes_sent;
            total.packets_dropped += snap.packets_dropped;
            total.packets_duplicated += snap.packets_duplicated;
        }
        total
    }
}

impl Default for ProfileStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_profile() -> TrafficProfile {
        TrafficProfile::udp("test", "192.168.2.2:5000".parse().unwrap(), 512, 100.0)
    }

    #[test]
    fn test_udp_profile_valid() {
        assert!(base_profile().validate(1000.0).is_ok());
    }

    #[test]
    fn test_min_frame_boundary() {
        let mut prof = base_profile();
        let min = prof.min_frame_size();
        // Ethernet 14 + IPv4 20 + UDP 8 + tag 16
        assert_eq!(min, 58);

        prof.frame_size = min as u16;
        assert!(prof.validate(1000.0).is_ok());

        prof.frame_size = (min - 1) as u16;
        assert!(prof.validate(1000.0).is_err());
    }

    #[test]
    fn test_min_frame_grows_with_stack() {
        let mut prof = base_profile();
        let plain = prof.min_frame_size();

        prof.l2.vlan = Some(VlanTag { id: 100, pcp: 0 });
        assert_eq!(prof.min_frame_size(), plain + 4);

        prof.l2.vlan = None;
        prof.l2.qinq = Some(QinqTags {
            outer_id: 200,
            inner_id: 100,
            outer_tpid: 0x88A8,
        });
        assert_eq!(prof.min_frame_size(), plain + 8);

        prof.l2.mpls = vec![
            MplsLabel {
                label: 16,
                tc: 0,
                ttl: 64,
            };
            2
        ];
        assert_eq!(prof.min_frame_size(), plain + 8 + 8);

        prof.vxlan = Some(VxlanOuter { vni: 42 });
        assert_eq!(prof.min_frame_size(), plain + 8 + 8 + 16);
    }

    #[test]
    fn test_port_range_validation() {
        let mut prof = base_profile();
        prof.l4 = L4Proto::Udp {
            src_port_min: 2000,
            src_port_max: 1000,
            dst_port: 5000,
        };
        assert!(prof.validate(1000.0).is_err());
    }

    #[test]
    fn test_rate_exceeds_link() {
        let prof = base_profile();
        assert!(prof.validate(50.0).is_err());
    }

    #[test]
    fn test_pattern_period_zero_rejected() {
        let mut prof = base_profile();
        prof.pattern = Some(RatePattern::Sine {
            min: 10.0,
            max: 100.0,
            period_sec: 0.0,
        });
        assert!(prof.validate(1000.0).is_err());
    }

    #[test]
    fn test_name_length() {
        let mut prof = base_profile();
        prof.name = "x".repeat(64);
        assert!(prof.validate(1000.0).is_err());
        prof.name = "x".repeat(63);
        assert!(prof.validate(1000.0).is_ok());
        prof.name.clear();
        assert!(prof.validate(1000.0).is_err());
    }

    #[test]
    fn test_interval_cycles() {
        let prof = base_profile();
        // 512 B at 100 Mb/s = 40.96 us/packet; at 1 GHz that is 40960 cycles
        let cycles = prof.interval_cycles(100.0, 1_000_000_000);
        assert_eq!(cycles, 40_960);
        assert_eq!(prof.interval_cycles(0.0, 1_000_000_000), 0);
        // Absurd rates still yield a positive interval
        assert!(prof.interval_cycles(1e15, 1_000_000_000) >= 1);
    }

    #[test]
    fn test_store_assigns_workers_by_stream() {
        let mut store = ProfileStore::new();
        let mut p0 = base_profile();
        p0.stream_id = 0;
        let mut p1 = base_profile();
        p1.name = "second".to_string();
        p1.stream_id = 1;
        let mut p2 = base_profile();
        p2.name = "third".to_string();
        p2.stream_id = 2;

        store.replace(vec![p0, p1, p2], 1000.0, 2, 1).unwrap();
        let workers: Vec<_> = store.profiles().iter().map(|p| p.worker).collect();
        assert_eq!(workers, vec![0, 1, 0]);
        assert_eq!(store.for_worker(0).len(), 2);
        assert_eq!(store.for_worker(1).len(), 1);
    }

    #[test]
    fn test_store_rejects_duplicate_streams() {
        let mut store = ProfileStore::new();
        let p0 = base_profile();
        let p1 = base_profile();
        assert!(store.replace(vec![p0, p1], 1000.0, 2, 1).is_err());
    }

    #[test]
    fn test_store_rejects_bad_port() {
        let mut store = ProfileStore::new();
        let mut p = base_profile();
        p.port = 3;
        assert!(store.replace(vec![p], 1000.0, 1, 2).is_err());
    }

    #[test]
    fn test_aggregate_counters() {
        let mut store = ProfileStore::new();
        store.replace(vec![base_profile()], 1000.0, 1, 1).unwrap();
        let prof = &store.profiles()[0];
        prof.counters.packets_sent.store(10, Ordering::Relaxed);
        prof.counters.bytes_sent.store(5120, Ordering::Relaxed);
        let agg = store.aggregate();
        assert_eq!(agg.packets_sent, 10);
        assert_eq!(agg.bytes_sent, 5120);
    }
}
