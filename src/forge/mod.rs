//! In-place packet forging
//!
//! Builds wire-ready frames directly into a pre-allocated buffer, walking
//! forward from offset 0: Ethernet, optional VLAN / Q-in-Q / MPLS, IPv4 or
//! IPv6, optional VXLAN encapsulation, then the transport header and
//! payload. The ethertype of the outermost header is rewritten as the
//! stack grows. No allocation happens on the forge path.
//!
//! The module also carries the parse path used by the receive correlator
//! (tag location) and by tests (full template reconstruction).

use crate::profile::{L3Endpoints, L4Proto, PayloadKind, TrafficProfile};
use crate::{Error, Result};
use rand::rngs::SmallRng;
use rand::Rng;
use std::ptr;

pub const ETH_HLEN: usize = 14;
pub const VLAN_HLEN: usize = 4;
pub const MPLS_HLEN: usize = 4;
pub const IPV4_HLEN: usize = 20;
pub const IPV6_HLEN: usize = 40;
pub const UDP_HLEN: usize = 8;
pub const TCP_HLEN: usize = 20;
pub const ICMP_HLEN: usize = 8;
pub const VXLAN_HLEN: usize = 8;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_IPV6: u16 = 0x86DD;
pub const ETHERTYPE_VLAN: u16 = 0x8100;
pub const ETHERTYPE_QINQ: u16 = 0x88A8;
pub const ETHERTYPE_MPLS: u16 = 0x8847;

pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

/// VXLAN outer UDP port
pub const VXLAN_PORT: u16 = 4789;

/// Correlation tag magic constant
pub const TAG_MAGIC: u16 = 0xBEEF;

/// Correlation tag wire length
pub const TAG_LEN: usize = 16;

// ============================================================================
// Wire header structures
// ============================================================================

/// Ethernet header
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct EthernetHeader {
    /// Destination MAC
    pub dst_mac: [u8; 6],
    /// Source MAC
    pub src_mac: [u8; 6],
    /// EtherType
    pub ether_type: u16,
}

impl EthernetHeader {
    pub fn new(src_mac: [u8; 6], dst_mac: [u8; 6], ether_type: u16) -> Self {
        Self {
            dst_mac,
            src_mac,
            ether_type: ether_type.to_be(),
        }
    }

    /// Get EtherType (host byte order)
    pub fn ether_type(&self) -> u16 {
        u16::from_be(self.ether_type)
    }
}

/// IPv4 header, options-free
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct Ipv4Header {
    pub version_ihl: u8,
    pub tos: u8,
    pub total_length: u16,
    pub identification: u16,
    pub flags_fragment: u16,
    pub ttl: u8,
    pub protocol: u8,
    pub checksum: u16,
    pub src_addr: [u8; 4],
    pub dst_addr: [u8; 4],
}

impl Ipv4Header {
    pub fn new(src: [u8; 4], dst: [u8; 4], dscp: u8, total_length: u16, protocol: u8) -> Self {
        Self {
            version_ihl: 0x45,
            tos: dscp << 2,
            total_length: total_length.to_be(),
            identification: 0,
            flags_fragment: 0,
            ttl: 64,
            protocol,
            checksum: 0,
            src_addr: src,
            dst_addr: dst,
        }
    }

    pub fn total_length(&self) -> u16 {
        u16::from_be(self.total_length)
    }

    pub fn header_len(&self) -> usize {
        ((self.version_ihl & 0x0F) as usize) * 4
    }
}

/// IPv6 header
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct Ipv6Header {
    pub vtc_flow: u32,
    pub payload_len: u16,
    pub next_header: u8,
    pub hop_limit: u8,
    pub src_addr: [u8; 16],
    pub dst_addr: [u8; 16],
}

impl Ipv6Header {
    pub fn new(src: [u8; 16], dst: [u8; 16], payload_len: u16, next_header: u8) -> Self {
        Self {
            vtc_flow: (6u32 << 28).to_be(),
            payload_len: payload_len.to_be(),
            next_header,
            hop_limit: 64,
            src_addr: src,
            dst_addr: dst,
        }
    }

    pub fn payload_len(&self) -> u16 {
        u16::from_be(self.payload_len)
    }
}

/// UDP header
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct UdpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub length: u16,
    pub checksum: u16,
}

impl UdpHeader {
    pub fn new(src_port: u16, dst_port: u16, length: u16) -> Self {
        Self {
            src_port: src_port.to_be(),
            dst_port: dst_port.to_be(),
            length: length.to_be(),
            checksum: 0,
        }
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be(self.src_port)
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be(self.dst_port)
    }
}

/// TCP header, options-free
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct TcpHeader {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub data_off: u8,
    pub flags: u8,
    pub window: u16,
    pub checksum: u16,
    pub urgent: u16,
}

/// TCP SYN flag
pub const TCP_FLAG_SYN: u8 = 0x02;

impl TcpHeader {
    pub fn new_syn(src_port: u16, dst_port: u16, seq: u32) -> Self {
        Self {
            src_port: src_port.to_be(),
            dst_port: dst_port.to_be(),
            seq: seq.to_be(),
            ack: 0,
            data_off: 5 << 4,
            flags: TCP_FLAG_SYN,
            window: 65535u16.to_be(),
            checksum: 0,
            urgent: 0,
        }
    }

    pub fn src_port(&self) -> u16 {
        u16::from_be(self.src_port)
    }

    pub fn dst_port(&self) -> u16 {
        u16::from_be(self.dst_port)
    }

    pub fn seq(&self) -> u32 {
        u32::from_be(self.seq)
    }
}

/// ICMP echo header
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct IcmpHeader {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub ident: u16,
    pub seq: u16,
}

impl IcmpHeader {
    pub fn echo_request(ident: u16, seq: u16) -> Self {
        Self {
            icmp_type: 8,
            code: 0,
            checksum: 0,
            ident: ident.to_be(),
            seq: seq.to_be(),
        }
    }

    pub fn ident(&self) -> u16 {
        u16::from_be(self.ident)
    }

    pub fn seq(&self) -> u16 {
        u16::from_be(self.seq)
    }
}

/// VXLAN shim, RFC 7348 layout: VNI in the upper 24 bits of the second word
#[repr(C, packed)]
#[derive(Debug, Clone, Copy)]
pub struct VxlanHeader {
    pub flags: u8,
    pub reserved: [u8; 3],
    pub vni_reserved: u32,
}

impl VxlanHeader {
    pub fn new(vni: u32) -> Self {
        Self {
            flags: 0x08,
            reserved: [0; 3],
            vni_reserved: (vni << 8).to_be(),
        }
    }

    pub fn vni(&self) -> u32 {
        u32::from_be(self.vni_reserved) >> 8
    }
}

// ============================================================================
// Correlation tag
// ============================================================================

/// The 16-byte tag embedded at the start of the L4 payload of generic
/// UDP/TCP streams. All fields are little-endian on the wire so
/// endian-different TX and RX hosts agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CorrelationTag {
    pub tx_timestamp_ns: u64,
    pub sequence: u32,
    pub stream_id: u16,
    pub magic: u16,
}

impl CorrelationTag {
    pub fn new(tx_timestamp_ns: u64, sequence: u32, stream_id: u16) -> Self {
        Self {
            tx_timestamp_ns,
            sequence,
            stream_id,
            magic: TAG_MAGIC,
        }
    }

    /// Serialize into the first TAG_LEN bytes of `buf`
    #[inline]
    pub fn write(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.tx_timestamp_ns.to_le_bytes());
        buf[8..12].copy_from_slice(&self.sequence.to_le_bytes());
        buf[12..14].copy_from_slice(&self.stream_id.to_le_bytes());
        buf[14..16].copy_from_slice(&self.magic.to_le_bytes());
    }

    /// Deserialize; `None` when the buffer is short or the magic mismatches
    #[inline]
    pub fn read(buf: &[u8]) -> Option<Self> {
        if buf.len() < TAG_LEN {
            return None;
        }
        let magic = u16::from_le_bytes([buf[14], buf[15]]);
        if magic != TAG_MAGIC {
            return None;
        }
        Some(Self {
            tx_timestamp_ns: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            sequence: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            stream_id: u16::from_le_bytes(buf[12..14].try_into().unwrap()),
            magic,
        })
    }
}

// ============================================================================
// Checksums and payload builders
// ============================================================================

/// Internet checksum over a header slice
pub fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += (*last as u32) << 8;
    }
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// Wire length of a DNS A query for `domain`
pub fn dns_query_len(domain: &str) -> usize {
    // 12-byte header, length-prefixed labels plus terminator, QTYPE + QCLASS
    12 + domain.len() + 2 + 4
}

/// Build a DNS standard query; returns the bytes written
pub fn build_dns_query(buf: &mut [u8], domain: &str, rng: &mut SmallRng) -> usize {
    let id: u16 = rng.gen();
    buf[0..2].copy_from_slice(&id.to_be_bytes());
    buf[2..4].copy_from_slice(&0x0100u16.to_be_bytes()); // standard query, RD
    buf[4..6].copy_from_slice(&1u16.to_be_bytes()); // QDCOUNT
    buf[6..12].fill(0); // AN/NS/AR counts

    let mut pos = 12;
    for label in domain.split('.') {
        buf[pos] = label.len() as u8;
        pos += 1;
        buf[pos..pos + label.len()].copy_from_slice(label.as_bytes());
        pos += label.len();
    }
    buf[pos] = 0;
    pos += 1;

    buf[pos..pos + 2].copy_from_slice(&1u16.to_be_bytes()); // QTYPE A
    buf[pos + 2..pos + 4].copy_from_slice(&1u16.to_be_bytes()); // QCLASS IN
    pos + 4
}

/// The fixed HTTP request template
pub fn http_request(method: &str, uri: &str, host: &str) -> String {
    format!(
        "{} {} HTTP/1.1\r\nHost: {}\r\nUser-Agent: pktforge/0.1\r\nAccept: */*\r\nConnection: keep-alive\r\n\r\n",
        method, uri, host
    )
}

/// Wire length of the HTTP request template
pub fn http_request_len(method: &str, uri: &str, host: &str) -> usize {
    http_request(method, uri, host).len()
}

/// Fill `buf` according to the payload pattern
fn fill_payload(buf: &mut [u8], kind: &PayloadKind, rng: &mut SmallRng) {
    match kind {
        PayloadKind::Random => rng.fill(buf),
        PayloadKind::Zeros => buf.fill(0),
        PayloadKind::Ones => buf.fill(0xFF),
        PayloadKind::Increment => {
            for (i, byte) in buf.iter_mut().enumerate() {
                *byte = i as u8;
            }
        }
        PayloadKind::Fixed(bytes) => {
            let n = bytes.len().min(buf.len());
            buf[..n].copy_from_slice(&bytes[..n]);
            buf[n..].fill(0);
        }
    }
}

// ============================================================================
// Frame assembly
// ============================================================================

#[inline]
unsafe fn put<T>(buf: &mut [u8], offset: usize, value: T) {
    ptr::write_unaligned(buf.as_mut_ptr().add(offset) as *mut T, value);
}

#[inline]
unsafe fn get<T: Copy>(buf: &[u8], offset: usize) -> T {
    ptr::read_unaligned(buf.as_ptr().add(offset) as *const T)
}

fn put_be16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

fn get_be16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

/// Forge a wire-ready frame for `prof` into `buf`
///
/// `buf` must be exactly the profile's frame size; the store guarantees at
/// configure time that the header stack fits. The caller owns the sequence
/// counter and increments it after a successful forge.
pub fn forge_into(
    prof: &TrafficProfile,
    seq: u32,
    tx_timestamp_ns: u64,
    rng: &mut SmallRng,
    buf: &mut [u8],
) -> Result<()> {
    let frame_size = buf.len();
    debug_assert_eq!(frame_size, prof.frame_size as usize);

    let mut offset = ETH_HLEN;
    // Position of the ethertype field that names whatever comes next;
    // rewritten as tags and labels are appended.
    let mut ethertype_slot = ETH_HLEN - 2;

    unsafe {
        put(
            buf,
            0,
            EthernetHeader::new(prof.l2.src_mac, prof.l2.dst_mac, ETHERTYPE_IPV4),
        );
    }

    if let Some(qinq) = prof.l2.qinq {
        put_be16(buf, ethertype_slot, qinq.outer_tpid);
        put_be16(buf, offset, qinq.outer_id);
        put_be16(buf, offset + 2, ETHERTYPE_VLAN);
        put_be16(buf, offset + 4, qinq.inner_id);
        ethertype_slot = offset + 6;
        offset += 2 * VLAN_HLEN;
    } else if let Some(vlan) = prof.l2.vlan {
        put_be16(buf, ethertype_slot, ETHERTYPE_VLAN);
        put_be16(buf, offset, (vlan.pcp as u16) << 13 | vlan.id);
        ethertype_slot = offset + 2;
        offset += VLAN_HLEN;
    }

    if !prof.l2.mpls.is_empty() {
        put_be16(buf, ethertype_slot, ETHERTYPE_MPLS);
        let last = prof.l2.mpls.len() - 1;
        for (i, label) in prof.l2.mpls.iter().enumerate() {
            let bos = (i == last) as u32;
            let word =
                label.label << 12 | (label.tc as u32) << 9 | bos << 8 | label.ttl as u32;
            buf[offset..offset + 4].copy_from_slice(&word.to_be_bytes());
            offset += MPLS_HLEN;
        }
    }

    // Transport protocol carried by the IP header; VXLAN hides the real
    // one behind its outer UDP.
    let next_proto = if prof.vxlan.is_some() {
        IPPROTO_UDP
    } else {
        match (&prof.l4, &prof.l3) {
            (L4Proto::Udp { .. } | L4Proto::DnsQuery { .. }, _) => IPPROTO_UDP,
            (L4Proto::TcpSyn { .. } | L4Proto::HttpRequest { .. }, _) => IPPROTO_TCP,
            (L4Proto::IcmpEcho, L3Endpoints::Ipv4 { .. }) => IPPROTO_ICMP,
            (L4Proto::IcmpEcho, L3Endpoints::Ipv6 { .. }) => IPPROTO_ICMPV6,
        }
    };

    match prof.l3 {
        L3Endpoints::Ipv4 { src, dst, dscp } => {
            if prof.l2.mpls.is_empty() {
                put_be16(buf, ethertype_slot, ETHERTYPE_IPV4);
            }
            let total_length = (frame_size - offset) as u16;
            let mut ip = Ipv4Header::new(src.octets(), dst.octets(), dscp, total_length, next_proto);
            unsafe { put(buf, offset, ip) };
            let checksum = internet_checksum(&buf[offset..offset + IPV4_HLEN]);
            ip.checksum = checksum.to_be();
            unsafe { put(buf, offset, ip) };
            offset += IPV4_HLEN;
        }
        L3Endpoints::Ipv6 { src, dst, .. } => {
            if prof.l2.mpls.is_empty() {
                put_be16(buf, ethertype_slot, ETHERTYPE_IPV6);
            }
            let payload_len = (frame_size - offset - IPV6_HLEN) as u16;
            let ip = Ipv6Header::new(src.octets(), dst.octets(), payload_len, next_proto);
            unsafe { put(buf, offset, ip) };
            offset += IPV6_HLEN;
        }
    }

    if let Some(vxlan) = prof.vxlan {
        let outer_len = (frame_size - offset) as u16;
        unsafe {
            put(buf, offset, UdpHeader::new(VXLAN_PORT, VXLAN_PORT, outer_len));
            put(buf, offset + UDP_HLEN, VxlanHeader::new(vxlan.vni));
        }
        offset += UDP_HLEN + VXLAN_HLEN;
    }

    match &prof.l4 {
        L4Proto::Udp {
            src_port_min,
            src_port_max,
            dst_port,
        } => {
            let src_port = rng.gen_range(*src_port_min..=*src_port_max);
            let length = (frame_size - offset) as u16;
            unsafe { put(buf, offset, UdpHeader::new(src_port, *dst_port, length)) };
            offset += UDP_HLEN;

            CorrelationTag::new(tx_timestamp_ns, seq, prof.stream_id)
                .write(&mut buf[offset..offset + TAG_LEN]);
            fill_payload(&mut buf[offset + TAG_LEN..], &prof.payload, rng);
        }

        L4Proto::TcpSyn {
            src_port_min,
            src_port_max,
            dst_port,
        } => {
            let src_port = rng.gen_range(*src_port_min..=*src_port_max);
            unsafe { put(buf, offset, TcpHeader::new_syn(src_port, *dst_port, seq)) };
            offset += TCP_HLEN;

            CorrelationTag::new(tx_timestamp_ns, seq, prof.stream_id)
                .write(&mut buf[offset..offset + TAG_LEN]);
            fill_payload(&mut buf[offset + TAG_LEN..], &prof.payload, rng);
        }

        L4Proto::IcmpEcho => {
            unsafe {
                put(
                    buf,
                    offset,
                    IcmpHeader::echo_request(prof.stream_id, seq as u16),
                )
            };
            offset += ICMP_HLEN;
            fill_payload(&mut buf[offset..], &prof.payload, rng);
        }

        L4Proto::DnsQuery {
            src_port_min,
            src_port_max,
            dst_port,
            domain,
        } => {
            let src_port = rng.gen_range(*src_port_min..=*src_port_max);
            let length = (frame_size - offset) as u16;
            unsafe { put(buf, offset, UdpHeader::new(src_port, *dst_port, length)) };
            offset += UDP_HLEN;

            let written = build_dns_query(&mut buf[offset..], domain, rng);
            buf[offset + written..].fill(0);
        }

        L4Proto::HttpRequest {
            src_port_min,
            src_port_max,
            dst_port,
            method,
            uri,
            host,
        } => {
            let src_port = rng.gen_range(*src_port_min..=*src_port_max);
            unsafe { put(buf, offset, TcpHeader::new_syn(src_port, *dst_port, seq)) };
            offset += TCP_HLEN;

            let request = http_request(method, uri, host);
            let n = request.len().min(frame_size - offset);
            buf[offset..offset + n].copy_from_slice(&request.as_bytes()[..n]);
            buf[offset + n..].fill(0);
        }
    }

    Ok(())
}

// ============================================================================
// Parse path
// ============================================================================

/// Outermost transport header of a parsed frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedL4 {
    Udp { src_port: u16, dst_port: u16 },
    Tcp { src_port: u16, dst_port: u16, seq: u32, flags: u8 },
    Icmp { ident: u16, seq: u16 },
}

/// Parsed L3 header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedL3 {
    Ipv4 {
        src: std::net::Ipv4Addr,
        dst: std::net::Ipv4Addr,
        dscp: u8,
        protocol: u8,
    },
    Ipv6 {
        src: std::net::Ipv6Addr,
        dst: std::net::Ipv6Addr,
        next_header: u8,
    },
}

/// A frame decomposed back into template fields; used by tests and the
/// control-plane packet inspector
#[derive(Debug, Clone)]
pub struct ParsedFrame {
    pub vlan: Option<u16>,
    pub qinq: Option<(u16, u16)>,
    pub mpls_labels: Vec<u32>,
    pub l3: ParsedL3,
    pub vxlan_vni: Option<u32>,
    pub l4: ParsedL4,
    /// Offset of the L4 payload (past the VXLAN shim for encapsulated frames)
    pub payload_offset: usize,
}

impl ParsedFrame {
    /// Parse a forged frame
    pub fn parse(frame: &[u8]) -> Result<Self> {
        let short = || Error::NetworkError("frame truncated".to_string());
        if frame.len() < ETH_HLEN {
            return Err(short());
        }

        let mut vlan = None;
        let mut qinq = None;
        let mut mpls_labels = Vec::new();

        let mut ethertype = get_be16(frame, ETH_HLEN - 2);
        let mut offset = ETH_HLEN;

        if ethertype == ETHERTYPE_QINQ
            || (ethertype == ETHERTYPE_VLAN
                && frame.len() >= offset + 4
                && get_be16(frame, offset + 2) == ETHERTYPE_VLAN)
        {
            if frame.len() < offset + 2 * VLAN_HLEN {
                return Err(short());
            }
            let outer = get_be16(frame, offset) & 0x0FFF;
            let inner = get_be16(frame, offset + 4) & 0x0FFF;
            qinq = Some((outer, inner));
            ethertype = get_be16(frame, offset + 6);
            offset += 2 * VLAN_HLEN;
        } else if ethertype == ETHERTYPE_VLAN {
            if frame.len() < offset + VLAN_HLEN {
                return Err(short());
            }
            vlan = Some(get_be16(frame, offset) & 0x0FFF);
            ethertype = get_be16(frame, offset + 2);
            offset += VLAN_HLEN;
        }

        if ethertype == ETHERTYPE_MPLS {
            loop {
                if frame.len() < offset + MPLS_HLEN {
                    return Err(short());
                }
                let word = u32::from_be_bytes(frame[offset..offset + 4].try_into().unwrap());
                mpls_labels.push(word >> 12);
                offset += MPLS_HLEN;
                if word & 0x100 != 0 {
                    break;
                }
            }
            // The IP version nibble names the inner protocol
            ethertype = match frame.get(offset).map(|b| b >> 4) {
                Some(6) => ETHERTYPE_IPV6,
                _ => ETHERTYPE_IPV4,
            };
        }

        let (l3, protocol) = match ethertype {
            ETHERTYPE_IPV4 => {
                if frame.len() < offset + IPV4_HLEN {
                    return Err(short());
                }
                let ip: Ipv4Header = unsafe { get(frame, offset) };
                let hdr_len = ip.header_len();
                let l3 = ParsedL3::Ipv4 {
                    src: std::net::Ipv4Addr::from(ip.src_addr),
                    dst: std::net::Ipv4Addr::from(ip.dst_addr),
                    dscp: ip.tos >> 2,
                    protocol: ip.protocol,
                };
                offset += hdr_len;
                (l3, ip.protocol)
            }
            ETHERTYPE_IPV6 => {
                if frame.len() < offset + IPV6_HLEN {
                    return Err(short());
                }
                let ip: Ipv6Header = unsafe { get(frame, offset) };
                let l3 = ParsedL3::Ipv6 {
                    src: std::net::Ipv6Addr::from(ip.src_addr),
                    dst: std::net::Ipv6Addr::from(ip.dst_addr),
                    next_header: ip.next_header,
                };
                offset += IPV6_HLEN;
                (l3, ip.next_header)
            }
            other => {
                return Err(Error::NetworkError(format!(
                    "unsupported ethertype 0x{:04x}",
                    other
                )))
            }
        };

        let (l4, vxlan_vni, payload_offset) = match protocol {
            IPPROTO_UDP => {
                if frame.len() < offset + UDP_HLEN {
                    return Err(short());
                }
                let udp: UdpHeader = unsafe { get(frame, offset) };
                let l4 = ParsedL4::Udp {
                    src_port: udp.src_port(),
                    dst_port: udp.dst_port(),
                };
                if udp.dst_port() == VXLAN_PORT && frame.len() >= offset + UDP_HLEN + VXLAN_HLEN {
                    let shim: VxlanHeader = unsafe { get(frame, offset + UDP_HLEN) };
                    if shim.flags == 0x08 {
                        let payload = offset + UDP_HLEN + VXLAN_HLEN;
                        (l4, Some(shim.vni()), payload)
                    } else {
                        (l4, None, offset + UDP_HLEN)
                    }
                } else {
                    (l4, None, offset + UDP_HLEN)
                }
            }
            IPPROTO_TCP => {
                if frame.len() < offset + TCP_HLEN {
                    return Err(short());
                }
                let tcp: TcpHeader = unsafe { get(frame, offset) };
                (
                    ParsedL4::Tcp {
                        src_port: tcp.src_port(),
                        dst_port: tcp.dst_port(),
                        seq: tcp.seq(),
                        flags: tcp.flags,
                    },
                    None,
                    offset + ((tcp.data_off >> 4) as usize) * 4,
                )
            }
            IPPROTO_ICMP | IPPROTO_ICMPV6 => {
                if frame.len() < offset + ICMP_HLEN {
                    return Err(short());
                }
                let icmp: IcmpHeader = unsafe { get(frame, offset) };
                (
                    ParsedL4::Icmp {
                        ident: icmp.ident(),
                        seq: icmp.seq(),
                    },
                    None,
                    offset + ICMP_HLEN,
                )
            }
            other => {
                return Err(Error::NetworkError(format!(
                    "unsupported IP protocol {}",
                    other
                )))
            }
        };

        Ok(Self {
            vlan,
            qinq,
            mpls_labels,
            l3,
            vxlan_vni,
            l4,
            payload_offset,
        })
    }
}

/// Locate a correlation tag in a received frame
///
/// Walks the header stack to the L4 payload and validates the magic. For
/// VXLAN frames the inner transport is not named on the wire, so both the
/// inner-UDP and inner-TCP payload offsets are probed.
pub fn locate_tag(frame: &[u8]) -> Option<(usize, CorrelationTag)> {
    let parsed = ParsedFrame::parse(frame).ok()?;

    let candidates: [usize; 2] = if parsed.vxlan_vni.is_some() {
        [
            parsed.payload_offset + UDP_HLEN,
            parsed.payload_offset + TCP_HLEN,
        ]
    } else {
        [parsed.payload_offset, parsed.payload_offset]
    };

    for offset in candidates {
        if frame.len() >= offset + TAG_LEN {
            if let Some(tag) = CorrelationTag::read(&frame[offset..]) {
                return Some((offset, tag));
            }
        }
    }
    None
}
