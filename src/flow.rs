use std::time::Instant;

use log::error;

use crate::capture::CaptureCounters;
use crate::dns::FlowRecord;

/// DNS flow packet format, version 2.
///
/// Header:
///   version          [1 byte]
///   sets_count       [1 byte]
///   flags            [2 bytes]
///   sequence_number  [4 bytes]
///
/// Data set:
///   client_ip        [4 bytes]
///   names_count      [1 byte]
///   ips_count        [1 byte]
///   names_len        [2 bytes]
///   names            [names_len bytes] wire-format names, zero-padded to a
///                    4-byte boundary from packet start
///   ips              [ips_count * 4 bytes]
///
/// Stats set: five 32-bit counters (captured, received, dropped, ifdropped,
/// sample_rate). All multi-byte fields are network byte order.
pub const FLOW_VERSION: u8 = 2;

/// Destination port collectors listen on.
pub const FLOW_PORT: u16 = 5300;

pub const PKT_MAX_SIZE: usize = 65_535;
pub const PKT_TARGET_SIZE: usize = 1_200;
pub const SETS_COUNT_MAX: u8 = 255;
pub const FLAG_STATS: u16 = 0x0001;

pub const HDR_LEN: usize = 8;
pub const SET_HDR_LEN: usize = 8;
pub const STATS_FRAME_LEN: usize = HDR_LEN + 20;

/// Receives finished datagrams. Implemented by the emitter; tests substitute
/// a capturing sink.
pub trait FlowSink {
    fn emit(&mut self, frame: &[u8]);
}

/// Per-worker datagram counter, shared by data and stats frames. Starts at 1
/// and wraps modulo 2^32.
pub struct Sequence(u32);

impl Sequence {
    pub fn new() -> Self {
        Sequence(1)
    }

    pub fn next(&mut self) -> u32 {
        let n = self.0;
        self.0 = self.0.wrapping_add(1);
        n
    }
}

fn write_header(buf: &mut [u8], sets_count: u8, flags: u16, sequence: u32) {
    buf[0] = FLOW_VERSION;
    buf[1] = sets_count;
    buf[2..4].copy_from_slice(&flags.to_be_bytes());
    buf[4..8].copy_from_slice(&sequence.to_be_bytes());
}

/// Accumulates flow sets into a single reusable datagram buffer and hands the
/// buffer to the sink when a threshold is reached.
pub struct FlowBatch {
    buf: Box<[u8]>,
    len: usize,
    sets_count: u8,
    last_send: Instant,
}

impl FlowBatch {
    pub fn new() -> Self {
        FlowBatch {
            buf: vec![0u8; PKT_MAX_SIZE].into_boxed_slice(),
            len: 0,
            sets_count: 0,
            last_send: Instant::now(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Instant of the last flush. Used by the push timer to rate-limit sends.
    pub fn last_send(&self) -> Instant {
        self.last_send
    }

    /// Append one record as a flow set, then flush if the datagram reached
    /// the target size or the set count limit.
    pub fn append(&mut self, rec: &FlowRecord, seq: &mut Sequence, out: &mut impl FlowSink) {
        if self.len == 0 {
            write_header(&mut self.buf, 0, 0, 0);
            self.len = HDR_LEN;
            self.sets_count = 0;
        }

        let names_count = rec.names.len().min(crate::dns::MAX_PARSE);
        let ips_count = rec.ips.len().min(crate::dns::MAX_PARSE);

        let set_start = self.len;
        if self.len + SET_HDR_LEN > PKT_MAX_SIZE {
            return self.overrun();
        }
        self.buf[set_start..set_start + 4].copy_from_slice(&rec.client_ip.octets());
        self.buf[set_start + 4] = names_count as u8;
        self.buf[set_start + 5] = ips_count as u8;
        // names_len is patched once the names and padding are in place.
        self.buf[set_start + 6..set_start + 8].fill(0);
        self.len += SET_HDR_LEN;

        let names_start = self.len;
        for name in rec.names.iter().take(names_count) {
            if self.len + name.len() > PKT_MAX_SIZE {
                return self.overrun();
            }
            self.buf[self.len..self.len + name.len()].copy_from_slice(name);
            self.len += name.len();
        }
        while self.len % 4 != 0 {
            if self.len >= PKT_MAX_SIZE {
                return self.overrun();
            }
            self.buf[self.len] = 0;
            self.len += 1;
        }
        let names_len = (self.len - names_start) as u16;
        self.buf[set_start + 6..set_start + 8].copy_from_slice(&names_len.to_be_bytes());

        for ip in rec.ips.iter().take(ips_count) {
            if self.len + 4 > PKT_MAX_SIZE {
                return self.overrun();
            }
            self.buf[self.len..self.len + 4].copy_from_slice(&ip.octets());
            self.len += 4;
        }

        self.sets_count += 1;
        self.buf[1] = self.sets_count;

        if self.len >= PKT_TARGET_SIZE || self.sets_count == SETS_COUNT_MAX {
            self.flush(seq, out);
        }
    }

    /// The capture filter bounds DNS payloads far below the buffer size, so
    /// running out of room means a builder bug. Drop the batch and carry on.
    fn overrun(&mut self) {
        error!("flow packet overrun, discarding batch");
        self.len = 0;
        self.sets_count = 0;
    }

    /// Stamp the sequence number, emit the datagram, and reset. No-op when
    /// the batch is empty.
    pub fn flush(&mut self, seq: &mut Sequence, out: &mut impl FlowSink) {
        if self.len == 0 {
            return;
        }
        self.buf[4..8].copy_from_slice(&seq.next().to_be_bytes());
        out.emit(&self.buf[..self.len]);
        self.len = 0;
        self.sets_count = 0;
        self.last_send = Instant::now();
    }
}

/// Serialize capture counters as a single-set stats datagram.
pub fn build_stats_frame(
    counters: &CaptureCounters,
    sample_rate: u32,
    seq: &mut Sequence,
) -> [u8; STATS_FRAME_LEN] {
    let mut frame = [0u8; STATS_FRAME_LEN];
    write_header(&mut frame, 1, FLAG_STATS, seq.next());
    frame[8..12].copy_from_slice(&counters.captured.to_be_bytes());
    frame[12..16].copy_from_slice(&counters.received.to_be_bytes());
    frame[16..20].copy_from_slice(&counters.dropped.to_be_bytes());
    frame[20..24].copy_from_slice(&counters.if_dropped.to_be_bytes());
    frame[24..28].copy_from_slice(&sample_rate.to_be_bytes());
    frame
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::net::Ipv4Addr;

    #[derive(Default)]
    struct VecSink(Vec<Vec<u8>>);

    impl FlowSink for VecSink {
        fn emit(&mut self, frame: &[u8]) {
            self.0.push(frame.to_vec());
        }
    }

    fn record(client: [u8; 4], names: &[&[u8]], ips: &[[u8; 4]]) -> FlowRecord {
        FlowRecord {
            client_ip: client.into(),
            names: names.iter().map(|n| Bytes::copy_from_slice(n)).collect(),
            ips: ips.iter().map(|ip| Ipv4Addr::from(*ip)).collect(),
        }
    }

    struct ParsedSet {
        client_ip: [u8; 4],
        names_count: u8,
        ips_count: u8,
        names_len: u16,
        names: Vec<u8>,
        ips: Vec<[u8; 4]>,
    }

    struct ParsedFrame {
        version: u8,
        flags: u16,
        sequence: u32,
        sets: Vec<ParsedSet>,
    }

    /// Decode a data datagram, checking alignment and that every byte is
    /// consumed.
    fn parse_frame(frame: &[u8]) -> ParsedFrame {
        assert!(frame.len() >= HDR_LEN);
        assert!(frame.len() <= PKT_MAX_SIZE);
        let sets_count = frame[1];
        let mut parsed = ParsedFrame {
            version: frame[0],
            flags: u16::from_be_bytes([frame[2], frame[3]]),
            sequence: u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]),
            sets: Vec::new(),
        };
        let mut off = HDR_LEN;
        for _ in 0..sets_count {
            let hdr = &frame[off..off + SET_HDR_LEN];
            let names_len = u16::from_be_bytes([hdr[6], hdr[7]]);
            assert_eq!(names_len % 4, 0, "names_len must be a multiple of 4");
            let names_start = off + SET_HDR_LEN;
            let ips_start = names_start + names_len as usize;
            assert_eq!(ips_start % 4, 0, "ip array must be 4-byte aligned");
            let ips_end = ips_start + hdr[5] as usize * 4;
            let set = ParsedSet {
                client_ip: [hdr[0], hdr[1], hdr[2], hdr[3]],
                names_count: hdr[4],
                ips_count: hdr[5],
                names_len,
                names: frame[names_start..ips_start].to_vec(),
                ips: frame[ips_start..ips_end]
                    .chunks(4)
                    .map(|c| [c[0], c[1], c[2], c[3]])
                    .collect(),
            };
            parsed.sets.push(set);
            off = ips_end;
        }
        assert_eq!(off, frame.len(), "datagram must be fully consumed");
        parsed
    }

    fn reserialize(frame: &ParsedFrame) -> Vec<u8> {
        let mut out = vec![0u8; HDR_LEN];
        write_header(&mut out, frame.sets.len() as u8, frame.flags, frame.sequence);
        for set in &frame.sets {
            out.extend_from_slice(&set.client_ip);
            out.push(set.names_count);
            out.push(set.ips_count);
            out.extend_from_slice(&set.names_len.to_be_bytes());
            out.extend_from_slice(&set.names);
            for ip in &set.ips {
                out.extend_from_slice(ip);
            }
        }
        out
    }

    #[test]
    fn minimal_record_layout() {
        let mut batch = FlowBatch::new();
        let mut seq = Sequence::new();
        let mut sink = VecSink::default();

        let rec = record(
            [192, 0, 2, 10],
            &[b"\x07example\x03com\x00"],
            &[[198, 51, 100, 5]],
        );
        batch.append(&rec, &mut seq, &mut sink);
        assert!(sink.0.is_empty());
        batch.flush(&mut seq, &mut sink);

        let frame = &sink.0[0];
        assert_eq!(frame.len(), 36);
        assert_eq!(&frame[..8], &[0x02, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01]);
        assert_eq!(&frame[8..16], &[0xc0, 0x00, 0x02, 0x0a, 0x01, 0x01, 0x00, 0x10]);
        assert_eq!(
            &frame[16..32],
            b"\x07example\x03com\x00\x00\x00\x00"
        );
        assert_eq!(&frame[32..36], &[0xc6, 0x33, 0x64, 0x05]);
    }

    #[test]
    fn size_threshold_flushes_once() {
        let mut batch = FlowBatch::new();
        let mut seq = Sequence::new();
        let mut sink = VecSink::default();

        // Each set serializes to 8 + 60 + 4 = 72 bytes, so the seventeenth
        // append crosses the 1,200-byte target.
        let name = vec![7u8; 59];
        let rec = record([10, 0, 0, 1], &[&name], &[[1, 2, 3, 4]]);
        let mut appended = 0;
        while sink.0.is_empty() {
            batch.append(&rec, &mut seq, &mut sink);
            appended += 1;
            assert!(appended < 100, "size flush never triggered");
        }
        assert_eq!(sink.0.len(), 1);
        assert!(sink.0[0].len() >= PKT_TARGET_SIZE);
        assert!(batch.is_empty());

        // Next append opens a new batch with the next sequence number.
        batch.append(&rec, &mut seq, &mut sink);
        batch.flush(&mut seq, &mut sink);
        let first = parse_frame(&sink.0[0]);
        let second = parse_frame(&sink.0[1]);
        assert_eq!(first.sequence, 1);
        assert_eq!(second.sequence, 2);
    }

    #[test]
    fn set_count_threshold_flushes() {
        let mut batch = FlowBatch::new();
        let mut seq = Sequence::new();
        let mut sink = VecSink::default();

        // The smallest set is 16 bytes, so the 1,200-byte target trips before
        // 255 sets can accumulate; the count limit is a backstop. Either way
        // no frame may exceed the caps and every frame must parse cleanly.
        let rec = record([10, 0, 0, 2], &[b"\x01x\x00"], &[[1, 2, 3, 4]]);
        for _ in 0..255 {
            batch.append(&rec, &mut seq, &mut sink);
        }
        assert!(!sink.0.is_empty());
        let frame = parse_frame(&sink.0[0]);
        assert!(frame.sets.len() == 255 || sink.0[0].len() >= PKT_TARGET_SIZE);
        // Every emitted frame fully parses and stays within bounds.
        for raw in &sink.0 {
            parse_frame(raw);
        }
    }

    #[test]
    fn round_trip_is_byte_identical() {
        let mut batch = FlowBatch::new();
        let mut seq = Sequence::new();
        let mut sink = VecSink::default();

        batch.append(
            &record(
                [192, 0, 2, 10],
                &[b"\x01a\x04test\x00", b"\x01b\x04test\x00"],
                &[[203, 0, 113, 7], [203, 0, 113, 8]],
            ),
            &mut seq,
            &mut sink,
        );
        batch.append(
            &record([192, 0, 2, 11], &[b"\x02xy\x00"], &[[9, 9, 9, 9]]),
            &mut seq,
            &mut sink,
        );
        batch.flush(&mut seq, &mut sink);

        let raw = &sink.0[0];
        let parsed = parse_frame(raw);
        assert_eq!(parsed.version, FLOW_VERSION);
        assert_eq!(parsed.sets.len(), 2);
        assert_eq!(parsed.sets[0].names_count, 2);
        assert_eq!(parsed.sets[0].ips_count, 2);
        assert_eq!(&reserialize(&parsed), raw);
    }

    #[test]
    fn name_order_is_preserved() {
        let mut batch = FlowBatch::new();
        let mut seq = Sequence::new();
        let mut sink = VecSink::default();

        let names: &[&[u8]] = &[b"\x01q\x00", b"\x01a\x00", b"\x01b\x00"];
        batch.append(&record([1, 1, 1, 1], names, &[[2, 2, 2, 2]]), &mut seq, &mut sink);
        batch.flush(&mut seq, &mut sink);

        let parsed = parse_frame(&sink.0[0]);
        let mut concat: Vec<u8> = names.concat();
        while concat.len() % 4 != 0 {
            concat.push(0);
        }
        assert_eq!(parsed.sets[0].names, concat);
    }

    #[test]
    fn sequence_shared_with_stats() {
        let mut batch = FlowBatch::new();
        let mut seq = Sequence::new();
        let mut sink = VecSink::default();

        batch.append(
            &record([1, 1, 1, 1], &[b"\x01a\x00"], &[[2, 2, 2, 2]]),
            &mut seq,
            &mut sink,
        );
        batch.flush(&mut seq, &mut sink);

        let counters = CaptureCounters {
            captured: 7,
            received: 8,
            dropped: 1,
            if_dropped: 0,
            valid: true,
        };
        let stats = build_stats_frame(&counters, 4, &mut seq);
        assert_eq!(stats.len(), 28);
        assert_eq!(stats[0], FLOW_VERSION);
        assert_eq!(stats[1], 1);
        assert_eq!(u16::from_be_bytes([stats[2], stats[3]]), FLAG_STATS);
        assert_eq!(u32::from_be_bytes([stats[4], stats[5], stats[6], stats[7]]), 2);
        assert_eq!(u32::from_be_bytes([stats[8], stats[9], stats[10], stats[11]]), 7);
        assert_eq!(u32::from_be_bytes([stats[24], stats[25], stats[26], stats[27]]), 4);

        batch.append(
            &record([1, 1, 1, 1], &[b"\x01a\x00"], &[[2, 2, 2, 2]]),
            &mut seq,
            &mut sink,
        );
        batch.flush(&mut seq, &mut sink);
        let parsed = parse_frame(&sink.0[1]);
        assert_eq!(parsed.sequence, 3);
    }

    #[test]
    fn empty_flush_is_noop() {
        let mut batch = FlowBatch::new();
        let mut seq = Sequence::new();
        let mut sink = VecSink::default();
        batch.flush(&mut seq, &mut sink);
        assert!(sink.0.is_empty());
        // The skipped flush must not consume a sequence number.
        assert_eq!(seq.next(), 1);
    }

    #[test]
    fn truncates_counts_at_255() {
        let mut batch = FlowBatch::new();
        let mut seq = Sequence::new();
        let mut sink = VecSink::default();

        let name: &[u8] = b"\x01n\x00";
        let rec = FlowRecord {
            client_ip: Ipv4Addr::new(1, 1, 1, 1),
            names: vec![Bytes::copy_from_slice(name); 300],
            ips: vec![Ipv4Addr::new(2, 2, 2, 2); 300],
        };
        batch.append(&rec, &mut seq, &mut sink);
        // 8 + 8 + 255*3 padded + 255*4 is past the target size, so the append
        // flushed already.
        let parsed = parse_frame(&sink.0[0]);
        assert_eq!(parsed.sets[0].names_count, 255);
        assert_eq!(parsed.sets[0].ips_count, 255);
    }
}
