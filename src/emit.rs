use std::net::{SocketAddrV4, UdpSocket};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use log::warn;
use pcap::{Capture, Linktype, Packet, PacketHeader, Savefile};

use crate::flow::FlowSink;

/// Upper bound on configured UDP collectors.
pub const UDP_MAX_DSTS: usize = 10;

/// Saved flow datagrams use the loopback link type: a 4-byte protocol family
/// header (PF_UNSPEC) precedes each datagram.
const LOOPBACK_HDR: [u8; 4] = 0u32.to_ne_bytes();

/// Fans finished datagrams out to the configured UDP collectors and,
/// optionally, a capture file. Sends are best effort; one failing
/// destination does not stop the others.
pub struct Emitter {
    dsts: Vec<SocketAddrV4>,
    socket: Option<UdpSocket>,
    dump: Option<Savefile>,
}

impl Emitter {
    pub fn new(dsts: Vec<SocketAddrV4>, dump_path: Option<&Path>) -> Result<Self> {
        let dump = match dump_path {
            Some(path) => {
                let dead = Capture::dead(Linktype::NULL).context("pcap dead handle")?;
                let savefile = dead
                    .savefile(path)
                    .with_context(|| format!("open capture file {}", path.display()))?;
                Some(savefile)
            }
            None => None,
        };
        Ok(Emitter {
            dsts,
            socket: None,
            dump,
        })
    }

    fn dump_record(&mut self, frame: &[u8]) {
        let Some(dump) = self.dump.as_mut() else {
            return;
        };
        let mut record = Vec::with_capacity(LOOPBACK_HDR.len() + frame.len());
        record.extend_from_slice(&LOOPBACK_HDR);
        record.extend_from_slice(frame);

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let header = PacketHeader {
            ts: libc::timeval {
                tv_sec: now.as_secs() as libc::time_t,
                tv_usec: now.subsec_micros() as libc::suseconds_t,
            },
            caplen: record.len() as u32,
            len: record.len() as u32,
        };
        dump.write(&Packet::new(&header, &record));
    }

    /// Flush and close the capture-file writer. UDP needs no teardown.
    pub fn close(&mut self) {
        if let Some(mut dump) = self.dump.take() {
            if let Err(e) = dump.flush() {
                warn!("capture file flush failed: {e}");
            }
        }
    }
}

impl FlowSink for Emitter {
    fn emit(&mut self, frame: &[u8]) {
        if self.dump.is_some() {
            self.dump_record(frame);
        }

        if self.dsts.is_empty() {
            return;
        }
        if self.socket.is_none() {
            // One socket per worker, created on first send and kept for the
            // process lifetime.
            match UdpSocket::bind(("0.0.0.0", 0)) {
                Ok(socket) => self.socket = Some(socket),
                Err(e) => {
                    warn!("udp socket failed: {e}");
                    return;
                }
            }
        }
        let socket = self.socket.as_ref().unwrap();
        for dst in &self.dsts {
            if let Err(e) = socket.send_to(frame, dst) {
                warn!("send to {dst} failed: {e}");
            }
        }
    }
}
