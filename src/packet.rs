use std::net::Ipv4Addr;

const IPV4_MIN_HDR: usize = 20;
const UDP_HDR: usize = 8;
const IPPROTO_UDP: u8 = 17;

/// Bytes to skip for a pcap-record wrapper: the 16-byte saved-record header
/// followed by a 14-byte ethernet header.
pub const PCAP_RECORD_STRIP: usize = 16 + 14;

/// Bytes to skip for a jmirror wrapper: intercept_id and session_id.
pub const JMIRROR_STRIP: usize = 4 + 4;

/// Outer UDP destination ports that mark an encapsulated inner packet.
/// At most one level is peeled.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncapPorts {
    pub pcap_record: Option<u16>,
    pub jmirror: Option<u16>,
}

impl EncapPorts {
    fn strip_len(&self, dst_port: u16) -> Option<usize> {
        if self.pcap_record == Some(dst_port) {
            Some(PCAP_RECORD_STRIP)
        } else if self.jmirror == Some(dst_port) {
            Some(JMIRROR_STRIP)
        } else {
            None
        }
    }
}

/// A bounds-checked view of one IPv4/UDP datagram.
#[derive(Debug)]
pub struct UdpView<'a> {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    /// UDP payload, truncated to the length claimed by the UDP header.
    pub payload: &'a [u8],
}

/// IPv4 header checks (RFC 791): version, header length, total length.
/// Returns the header length in bytes.
fn ip4_check(pkt: &[u8]) -> Option<usize> {
    if pkt.len() < IPV4_MIN_HDR {
        return None;
    }
    if pkt[0] >> 4 != 4 {
        return None;
    }
    let hdr_len = ((pkt[0] & 0x0f) as usize) * 4;
    if pkt.len() < hdr_len {
        return None;
    }
    let total_len = u16::from_be_bytes([pkt[2], pkt[3]]) as usize;
    if pkt.len() < total_len {
        return None;
    }
    if total_len < hdr_len {
        return None;
    }
    Some(hdr_len)
}

/// UDP header checks (RFC 768) against the captured length.
/// Returns the UDP length field in bytes.
fn udp4_check(pkt: &[u8], ip_hdr_len: usize) -> Option<usize> {
    if pkt[9] != IPPROTO_UDP {
        return None;
    }
    if pkt.len() < ip_hdr_len + UDP_HDR {
        return None;
    }
    let udp_len = u16::from_be_bytes([pkt[ip_hdr_len + 4], pkt[ip_hdr_len + 5]]) as usize;
    if pkt.len() < ip_hdr_len + udp_len {
        return None;
    }
    if udp_len < UDP_HDR {
        return None;
    }
    Some(udp_len)
}

/// Validate an IPv4/UDP packet and return a view of its headers and payload.
/// Any failed check drops the packet silently; the capture filter already
/// excludes fragments, and checksums are not verified.
pub fn ip_udp_check(pkt: &[u8]) -> Option<UdpView<'_>> {
    let ip_hdr_len = ip4_check(pkt)?;
    let udp_len = udp4_check(pkt, ip_hdr_len)?;

    Some(UdpView {
        src_ip: Ipv4Addr::new(pkt[12], pkt[13], pkt[14], pkt[15]),
        dst_ip: Ipv4Addr::new(pkt[16], pkt[17], pkt[18], pkt[19]),
        src_port: u16::from_be_bytes([pkt[ip_hdr_len], pkt[ip_hdr_len + 1]]),
        dst_port: u16::from_be_bytes([pkt[ip_hdr_len + 2], pkt[ip_hdr_len + 3]]),
        payload: &pkt[ip_hdr_len + UDP_HDR..ip_hdr_len + udp_len],
    })
}

/// Validate a captured IPv4 packet, peeling one encapsulation layer when the
/// outer UDP destination port matches a configured wrapper port. The inner
/// packet is revalidated from scratch.
pub fn validate<'a>(pkt: &'a [u8], encap: &EncapPorts) -> Option<UdpView<'a>> {
    let outer = ip_udp_check(pkt)?;
    let Some(strip) = encap.strip_len(outer.dst_port) else {
        return Some(outer);
    };
    let inner = outer.payload.get(strip..)?;
    ip_udp_check(inner)
}
