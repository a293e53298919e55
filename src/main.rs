mod capture;
mod cli;
mod dns;
mod emit;
mod filter;
mod flow;
mod mproc;
mod packet;
mod pidfile;
mod worker;

use std::process::exit;

use anyhow::Result;
use clap::Parser;
use cli::{Args, Config};
use log::{error, info};

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&args.log_level))
        .init();

    if let Err(e) = run(args) {
        error!("{e:#}");
        exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    let config: Config = args.into_config()?;

    // The lock rides on the open file descriptor; keep it for the process
    // lifetime. Children inherit it across fork.
    let _pid_lock = match config.pid_file.as_deref() {
        Some(path) => Some(pidfile::write_pid_file(path)?),
        None => None,
    };

    // Fork before any runtime or capture state exists. Each worker builds
    // its own from scratch.
    let group = match config.fork_workers {
        Some(n) => mproc::fork_workers(n)?,
        None => mproc::WorkerGroup::single(config.shard.0, config.shard.1),
    };

    info!(
        "dnsflow worker {}/{} (pid {})",
        group.index,
        group.total,
        std::process::id()
    );

    let filter_expr = match config.filter_override {
        Some(ref expr) => expr.clone(),
        None => filter::build_capture_filter(
            config.encap_offset,
            group.index,
            group.total,
            config.enable_mdns,
        ),
    };

    let is_child = group.is_child();
    let worker = worker::Worker {
        group,
        batch: flow::FlowBatch::new(),
        seq: flow::Sequence::new(),
        emitter: emit::Emitter::new(config.udp_dsts.clone(), config.write_file.as_deref())?,
        sample_rate: config.sample_rate,
    };

    if let Some(ref path) = config.read_file {
        return worker::run_file(worker, path, &filter_expr, &config.encap);
    }

    let watch = if is_child {
        Some(mproc::ParentWatch::install()?)
    } else {
        None
    };

    let capture_cfg = capture::CaptureConfig {
        interface: config.interface.clone(),
        promisc: config.promisc,
        filter: filter_expr,
        encap: config.encap,
        sample_rate: config.sample_rate,
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(worker::run_live(worker, capture_cfg, watch))
}
