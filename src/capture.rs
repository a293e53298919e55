use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use log::{info, warn};
use pcap::{Active, Capture, Device, Error, Linktype};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::dns::{self, FlowRecord};
use crate::packet::{self, EncapPorts};

/// How a captured frame reaches its IP header.
#[derive(Debug, Clone, Copy)]
enum LinkLayer {
    /// 4-byte protocol family header (DLT_NULL, DLT_LOOP).
    Null,
    /// 14-byte ethernet header, 18 with one 802.1Q tag.
    Ethernet,
    /// Bare IP.
    Raw,
}

fn link_layer(linktype: Linktype) -> Result<LinkLayer> {
    if linktype == Linktype::NULL || linktype == Linktype::LOOP {
        Ok(LinkLayer::Null)
    } else if linktype == Linktype::ETHERNET {
        Ok(LinkLayer::Ethernet)
    } else if linktype == Linktype::RAW {
        Ok(LinkLayer::Raw)
    } else {
        bail!("unsupported datalink type {linktype:?}")
    }
}

/// Strip the link-layer header, leaving the IPv4 packet.
fn strip_link(link: LinkLayer, frame: &[u8]) -> Option<&[u8]> {
    match link {
        LinkLayer::Null => frame.get(4..),
        LinkLayer::Raw => Some(frame),
        LinkLayer::Ethernet => {
            let ethertype = u16::from_be_bytes([*frame.get(12)?, *frame.get(13)?]);
            match ethertype {
                0x0800 => frame.get(14..),
                // One level of 802.1Q tagging, matching the vlan filter arm.
                0x8100 => {
                    let inner = u16::from_be_bytes([*frame.get(16)?, *frame.get(17)?]);
                    if inner == 0x0800 { frame.get(18..) } else { None }
                }
                _ => None,
            }
        }
    }
}

/// Run one captured frame through link strip, header validation, the DNS
/// gate, and extraction. Any failure drops the frame silently.
fn process_frame(link: LinkLayer, encap: &EncapPorts, frame: &[u8]) -> Option<FlowRecord> {
    let ip_pkt = strip_link(link, frame)?;
    let udp = packet::validate(ip_pkt, encap)?;
    dns::process_response(udp.payload, udp.dst_ip)
}

/// Counters mirrored out of the capture loop. `captured` counts frames
/// delivered to the loop; the rest come from the kernel and are only valid
/// on a live capture.
pub struct CaptureCounters {
    pub captured: u32,
    pub received: u32,
    pub dropped: u32,
    pub if_dropped: u32,
    pub valid: bool,
}

#[derive(Default)]
pub struct SharedStats {
    captured: AtomicU32,
    received: AtomicU32,
    dropped: AtomicU32,
    if_dropped: AtomicU32,
    valid: AtomicBool,
}

impl SharedStats {
    pub fn snapshot(&self) -> CaptureCounters {
        CaptureCounters {
            captured: self.captured.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            if_dropped: self.if_dropped.load(Ordering::Relaxed),
            valid: self.valid.load(Ordering::Relaxed),
        }
    }

    fn refresh(&self, cap: &mut Capture<Active>) {
        if let Ok(stat) = cap.stats() {
            self.received.store(stat.received, Ordering::Relaxed);
            self.dropped.store(stat.dropped, Ordering::Relaxed);
            self.if_dropped.store(stat.if_dropped, Ordering::Relaxed);
            self.valid.store(true, Ordering::Relaxed);
        }
    }
}

pub struct CaptureConfig {
    pub interface: Option<String>,
    pub promisc: bool,
    pub filter: String,
    pub encap: EncapPorts,
    /// Process every n-th frame when greater than 1.
    pub sample_rate: u32,
}

pub struct LiveCapture {
    pub handle: JoinHandle<()>,
    pub events: mpsc::Receiver<FlowRecord>,
    pub cancel: CancellationToken,
    pub stats: Arc<SharedStats>,
}

pub fn select_default_interface() -> Result<String> {
    let devices = Device::list()?;

    for device in &devices {
        if device.name == "any" {
            continue;
        }
        if !device.flags.is_loopback() && device.flags.is_up() && device.flags.is_running() {
            return Ok(device.name.clone());
        }
    }

    for device in &devices {
        if device.name != "any" && device.flags.is_up() {
            return Ok(device.name.clone());
        }
    }

    bail!("no suitable network interface found")
}

fn open_live(interface: &str, promisc: bool) -> Result<Capture<Active>> {
    let cap = if interface == "any" {
        Capture::from_device("any")?
            .promisc(promisc)
            .immediate_mode(true)
            .timeout(100)
            .open()?
    } else {
        let device = Device::list()?
            .into_iter()
            .find(|d| d.name == interface)
            .with_context(|| format!("interface {interface} not found"))?;

        Capture::from_device(device)?
            .promisc(promisc)
            .immediate_mode(true)
            .timeout(100)
            .open()?
    };
    Ok(cap)
}

/// Open a live capture and run it on a blocking task. Qualifying responses
/// arrive on the returned channel; cancel the token to stop the loop.
pub fn start_live(cfg: CaptureConfig) -> Result<LiveCapture> {
    let interface = match cfg.interface {
        Some(ref iface) => iface.clone(),
        None => select_default_interface()?,
    };

    let mut cap = open_live(&interface, cfg.promisc)
        .with_context(|| format!("open capture on {interface}"))?;
    cap.filter(&cfg.filter, true).context("install capture filter")?;
    let link = link_layer(cap.get_datalink())?;

    info!("listening on {interface}, filter {}", cfg.filter);

    let (tx, rx) = mpsc::channel(10_000);
    let cancel = CancellationToken::new();
    let stats = Arc::new(SharedStats::default());

    let should_stop = Arc::new(AtomicBool::new(false));
    let stop_flag = should_stop.clone();
    let token = cancel.clone();
    tokio::spawn(async move {
        token.cancelled().await;
        stop_flag.store(true, Ordering::Relaxed);
    });

    let loop_stats = stats.clone();
    let encap = cfg.encap;
    let sample_rate = cfg.sample_rate;
    let handle = tokio::task::spawn_blocking(move || {
        let mut last_refresh = Instant::now();
        let mut seen: u64 = 0;

        while !should_stop.load(Ordering::Relaxed) {
            match cap.next_packet() {
                Ok(packet) => {
                    seen += 1;
                    loop_stats.captured.fetch_add(1, Ordering::Relaxed);
                    if sample_rate > 1 && seen % u64::from(sample_rate) != 0 {
                        continue;
                    }
                    if let Some(rec) = process_frame(link, &encap, packet.data)
                        && tx.blocking_send(rec).is_err()
                    {
                        info!("channel closed, stopping capture");
                        break;
                    }
                }
                Err(Error::TimeoutExpired) => {
                    // Expected, loop back to check the stop flag.
                }
                Err(e) => {
                    warn!("error reading packet: {e}");
                }
            }
            if last_refresh.elapsed() >= Duration::from_secs(1) {
                loop_stats.refresh(&mut cap);
                last_refresh = Instant::now();
            }
        }
        info!("packet capture task terminated");
    });

    Ok(LiveCapture {
        handle,
        events: rx,
        cancel,
        stats,
    })
}

/// Drain a capture file, feeding each qualifying response to `on_record`.
/// Returns the number of frames read.
pub fn run_file(
    path: &Path,
    filter: &str,
    encap: &EncapPorts,
    sample_rate: u32,
    mut on_record: impl FnMut(FlowRecord),
) -> Result<u32> {
    let mut cap = Capture::from_file(path)
        .with_context(|| format!("open capture file {}", path.display()))?;
    cap.filter(filter, true).context("install capture filter")?;
    let link = link_layer(cap.get_datalink())?;

    info!("reading from file {}, filter {filter}", path.display());

    let mut captured: u32 = 0;
    let mut seen: u64 = 0;
    loop {
        match cap.next_packet() {
            Ok(packet) => {
                captured += 1;
                seen += 1;
                if sample_rate > 1 && seen % u64::from(sample_rate) != 0 {
                    continue;
                }
                if let Some(rec) = process_frame(link, encap, packet.data) {
                    on_record(rec);
                }
            }
            Err(Error::NoMorePackets) => break,
            Err(e) => {
                warn!("error reading packet: {e}");
                break;
            }
        }
    }
    Ok(captured)
}
