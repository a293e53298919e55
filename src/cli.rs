use std::net::{Ipv4Addr, SocketAddrV4};
use std::path::PathBuf;

use clap::Parser;
use thiserror::Error;

use crate::emit::UDP_MAX_DSTS;
use crate::flow::FLOW_PORT;
use crate::mproc::MAX_WORKERS;
use crate::packet::{EncapPorts, JMIRROR_STRIP, PCAP_RECORD_STRIP};

#[derive(Parser, Debug)]
#[command(name = "dnsflow")]
#[command(about = "Export aggregated DNS A-record flows from captured traffic", long_about = None)]
#[command(after_help = "Without -f the capture filter matches recursive A \
responses from port 53 and shards on client ip when running multiple workers.")]
pub struct Args {
    /// Interface to capture on (default: first suitable device)
    #[arg(short, long)]
    pub interface: Option<String>,

    /// Read packets from a capture file instead of a live interface
    #[arg(short = 'r', long, value_name = "file")]
    pub read_file: Option<PathBuf>,

    /// Override the generated capture filter
    #[arg(short, long)]
    pub filter: Option<String>,

    /// Run as one worker of a group started externally, e.g. 2/4
    #[arg(short = 'm', long, value_name = "i/n")]
    pub worker: Option<String>,

    /// Fork into n workers sharded by client ip
    #[arg(short = 'M', long, value_name = "n")]
    pub fork_workers: Option<u32>,

    /// Disable promiscuous mode
    #[arg(short = 'p', long)]
    pub no_promisc: bool,

    /// Write and lock a pid file
    #[arg(short = 'P', long, value_name = "file")]
    pub pid_file: Option<PathBuf>,

    /// Process every n-th captured packet
    #[arg(short = 's', long, value_name = "rate")]
    pub sample_rate: Option<u32>,

    /// Send flow datagrams to this collector (repeatable, port 5300)
    #[arg(short = 'u', long = "udp-dst", value_name = "ip")]
    pub udp_dsts: Vec<Ipv4Addr>,

    /// Outer UDP port carrying pcap-record encapsulated DNS
    #[arg(short = 'X', long, value_name = "port")]
    pub pcap_record_port: Option<u16>,

    /// Outer UDP port carrying jmirror encapsulated DNS (usually 30030)
    #[arg(short = 'J', long, value_name = "port")]
    pub jmirror_port: Option<u16>,

    /// Also match mDNS (port 5353) responses
    #[arg(short = 'Y', long)]
    pub mdns: bool,

    /// Write flow datagrams to a capture file
    #[arg(short = 'w', long, value_name = "file")]
    pub write_file: Option<PathBuf>,

    /// Default log filter, overridden by RUST_LOG
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid worker spec {0:?}, expected i/n")]
    WorkerSpec(String),

    #[error("invalid worker count {0}, expected 1..={MAX_WORKERS}")]
    WorkerCount(u32),

    #[error("forked workers cannot share a capture file, drop -M or -w")]
    ForkWithFileOutput,

    #[error("too many udp destinations, at most {UDP_MAX_DSTS}")]
    TooManyDestinations,

    #[error("pid file: {0}")]
    PidFile(String),

    #[error("no output configured, need -u or -w")]
    MissingOutput,
}

/// Validated runtime configuration.
pub struct Config {
    pub interface: Option<String>,
    pub read_file: Option<PathBuf>,
    pub filter_override: Option<String>,
    /// Manual (worker_index, n_workers) from -m.
    pub shard: (u32, u32),
    /// Workers to fork from -M, when -m did not already shard.
    pub fork_workers: Option<u32>,
    pub promisc: bool,
    pub pid_file: Option<PathBuf>,
    pub sample_rate: u32,
    pub udp_dsts: Vec<SocketAddrV4>,
    pub encap: EncapPorts,
    /// Byte distance from the outer UDP header to the inner IP header, for
    /// the filter generator.
    pub encap_offset: usize,
    pub enable_mdns: bool,
    pub write_file: Option<PathBuf>,
}

fn parse_worker_spec(spec: &str) -> Result<(u32, u32), ConfigError> {
    let err = || ConfigError::WorkerSpec(spec.to_string());
    let (i, n) = spec.split_once('/').ok_or_else(err)?;
    let i: u32 = i.trim().parse().map_err(|_| err())?;
    let n: u32 = n.trim().parse().map_err(|_| err())?;
    if n == 0 || i == 0 || i > n {
        return Err(err());
    }
    Ok((i, n))
}

impl Args {
    pub fn into_config(self) -> Result<Config, ConfigError> {
        let shard = match self.worker.as_deref() {
            Some(spec) => parse_worker_spec(spec)?,
            None => (1, 1),
        };

        let fork_workers = match self.fork_workers {
            Some(n) if n == 0 || n > MAX_WORKERS => return Err(ConfigError::WorkerCount(n)),
            Some(n) if shard.1 == 1 => {
                if self.write_file.is_some() {
                    return Err(ConfigError::ForkWithFileOutput);
                }
                Some(n)
            }
            // -m already placed us in an externally managed group.
            Some(_) | None => None,
        };

        if self.udp_dsts.len() > UDP_MAX_DSTS {
            return Err(ConfigError::TooManyDestinations);
        }
        if self.udp_dsts.is_empty() && self.write_file.is_none() {
            return Err(ConfigError::MissingOutput);
        }

        let encap = EncapPorts {
            pcap_record: self.pcap_record_port,
            jmirror: self.jmirror_port,
        };
        let encap_offset = if self.pcap_record_port.is_some() {
            PCAP_RECORD_STRIP
        } else if self.jmirror_port.is_some() {
            JMIRROR_STRIP
        } else {
            0
        };

        Ok(Config {
            interface: self.interface,
            read_file: self.read_file,
            filter_override: self.filter,
            shard,
            fork_workers,
            promisc: !self.no_promisc,
            pid_file: self.pid_file,
            sample_rate: self.sample_rate.unwrap_or(1),
            udp_dsts: self
                .udp_dsts
                .into_iter()
                .map(|ip| SocketAddrV4::new(ip, FLOW_PORT))
                .collect(),
            encap,
            encap_offset,
            enable_mdns: self.mdns,
            write_file: self.write_file,
        })
    }
}
