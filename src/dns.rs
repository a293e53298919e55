use std::net::Ipv4Addr;

use bytes::Bytes;
use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::{RData, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use log::warn;

/// Cap on names and ips taken from a single response. Matches the wire
/// format's one-byte counts.
pub const MAX_PARSE: usize = 255;

/// Longest wire-format domain name (RFC 1035 Section 2.3.4).
pub const MAX_NAME_LEN: usize = 255;

/// One qualifying response, reduced to what the flow packet carries:
/// the requesting client, the question name followed by the CNAME chain,
/// and the resolved addresses.
#[derive(Debug, Clone)]
pub struct FlowRecord {
    pub client_ip: Ipv4Addr,
    /// Wire-format names. The first is the question owner, the rest are
    /// CNAME targets in answer order.
    pub names: Vec<Bytes>,
    pub ips: Vec<Ipv4Addr>,
}

/// Decode a DNS payload and keep it only if it is a successful recursive
/// reply to a single A question: qr=1, rd=1, ra=1, rcode=0, qdcount=1.
///
/// CNAME questions could qualify too, but resolvers rarely issue them.
pub fn response_check(payload: &[u8]) -> Option<Message> {
    let msg = match Message::from_vec(payload) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("bad DNS packet: {e}");
            return None;
        }
    };

    let header = msg.header();
    if header.message_type() != MessageType::Response
        || !header.recursion_desired()
        || !header.recursion_available()
        || header.response_code() != ResponseCode::NoError
    {
        return None;
    }

    // A reply can only answer one question prior to EDNS proposals.
    if header.query_count() != 1 {
        return None;
    }

    if msg.queries().first()?.query_type() != RecordType::A {
        return None;
    }

    Some(msg)
}

/// Walk the answer section of an accepted response and collect the question
/// owner, every CNAME target, and every A address. Returns `None` when the
/// answers yield no name or no address.
pub fn extract(msg: &Message, client_ip: Ipv4Addr) -> Option<FlowRecord> {
    let mut names: Vec<Bytes> = Vec::new();
    let mut ips: Vec<Ipv4Addr> = Vec::new();

    let owner = msg.queries().first()?.name().to_bytes().ok()?;
    if owner.len() > MAX_NAME_LEN {
        // Should never happen for DNS the decoder accepted.
        warn!("invalid query name");
        return None;
    }
    names.push(Bytes::from(owner));

    for rr in msg.answers() {
        match rr.data() {
            Some(RData::CNAME(target)) => {
                if names.len() == MAX_PARSE {
                    warn!("too many names");
                    continue;
                }
                let Ok(wire) = target.0.to_bytes() else {
                    continue;
                };
                if wire.len() > MAX_NAME_LEN {
                    warn!("invalid name");
                    continue;
                }
                names.push(Bytes::from(wire));
            }
            Some(RData::A(addr)) => {
                if ips.len() == MAX_PARSE {
                    warn!("too many ips");
                    continue;
                }
                ips.push(addr.0);
            }
            // Replies to A questions carry nothing else we care about.
            _ => {}
        }
    }

    if names.is_empty() || ips.is_empty() {
        return None;
    }

    Some(FlowRecord {
        client_ip,
        names,
        ips,
    })
}

/// Gate and extract in one step.
pub fn process_response(payload: &[u8], client_ip: Ipv4Addr) -> Option<FlowRecord> {
    let msg = response_check(payload)?;
    extract(&msg, client_ip)
}
