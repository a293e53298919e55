//! Capture filter generation.
//!
//! The filter does as much work as possible in the kernel: it matches only
//! UDP responses from port 53 (and optionally 5353) whose DNS flags mark a
//! successful recursive reply, and when several workers share an interface
//! it selects one shard of the client address space per worker.

const IP_HDR_LEN: usize = 20;
const UDP_HDR_LEN: usize = 8;

// Offsets of the matched fields inside the udp and ip headers. Per
// pcap-filter(7) these accessors only work for IPv4.
const SRC_PORT_OFFSET: usize = 0;
const DNS_FLAGS_OFFSET: usize = 10;
const DST_IP_OFFSET: usize = 16;

/// Build the capture filter for one worker.
///
/// `encap_offset` is the number of bytes between the end of the outer UDP
/// header and the start of the encapsulated IP header, 0 when capturing
/// plain DNS. `worker_index` and `n_workers` are 1-based. The whole
/// expression is duplicated under a `vlan` alternative so one level of
/// 802.1Q tagging is matched as well.
pub fn build_capture_filter(
    encap_offset: usize,
    worker_index: u32,
    n_workers: u32,
    enable_mdns: bool,
) -> String {
    // Shift every accessor past "udp encap ip" when the DNS sits inside an
    // encapsulated packet.
    let (udp_off, ip_off) = if encap_offset != 0 {
        (
            UDP_HDR_LEN + encap_offset + IP_HDR_LEN,
            IP_HDR_LEN + UDP_HDR_LEN + encap_offset,
        )
    } else {
        (0, 0)
    };

    let port_filter = if enable_mdns {
        format!(
            "(udp[{0}:2] = 53 or udp[{0}:2] = 5353)",
            SRC_PORT_OFFSET + udp_off
        )
    } else {
        format!("udp[{}:2] = 53", SRC_PORT_OFFSET + udp_off)
    };

    // qr=1, rd=1, ra=1, rcode=0; tc, aa, z and cd are masked out.
    let resp_filter = format!(
        "udp and {} and udp[{}:2] & 0x8187 = 0x8180",
        port_filter,
        DNS_FLAGS_OFFSET + udp_off
    );

    // Shard on the client (destination) address. The filter language has no
    // modulus, so dst_ip mod n is spelled with division and multiplication.
    // Keeping each client on one worker keeps its stream in one sequence.
    let worker_filter = if n_workers > 1 {
        format!(
            "{0} and ip[{1}:4] - ip[{1}:4] / {2} * {2} = {3}",
            resp_filter,
            DST_IP_OFFSET + ip_off,
            n_workers,
            worker_index - 1
        )
    } else {
        resp_filter
    };

    format!("({0}) or (vlan and ({0}))", worker_filter)
}
