use std::process::exit;
use std::time::Duration;

use anyhow::{Result, bail};
use log::info;
use rand::Rng;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;

use crate::capture::{self, CaptureConfig, CaptureCounters, SharedStats};
use crate::emit::Emitter;
use crate::flow::{FlowBatch, FlowSink, Sequence, build_stats_frame};
use crate::mproc::{ParentWatch, WorkerGroup};
use crate::packet::EncapPorts;

/// Even a partially filled batch is pushed on this cadence.
pub const PUSH_INTERVAL: Duration = Duration::from_secs(1);

/// Stats datagram cadence; counters are printed every sixth frame.
pub const STATS_INTERVAL: Duration = Duration::from_secs(10);

/// Everything one worker owns: its place in the group, the batch being
/// built, the datagram counter, and the fan-out. Nothing here is shared
/// across workers.
pub struct Worker {
    pub group: WorkerGroup,
    pub batch: FlowBatch,
    pub seq: Sequence,
    pub emitter: Emitter,
    pub sample_rate: u32,
}

/// Spread timer firings so sibling workers do not push in lockstep.
fn jittered(base: Duration) -> Duration {
    base + Duration::from_micros(rand::rng().random_range(0..1_000_000))
}

fn print_stats(counters: &CaptureCounters) {
    info!("{} packets captured", counters.captured);
    if counters.valid {
        info!("{} packets received by filter", counters.received);
        info!("{} packets dropped by kernel", counters.dropped);
        info!("{} packets dropped by interface", counters.if_dropped);
    }
}

/// Ordered shutdown: children first, then final stats, then the writer.
/// A batch still being built is dropped; collectors tolerate the gap.
fn clean_exit(worker: &mut Worker, stats: &SharedStats, cancel: &CancellationToken) -> ! {
    worker.group.signal_children();
    info!("shutting down");
    cancel.cancel();
    print_stats(&stats.snapshot());
    worker.emitter.close();
    exit(0)
}

/// Capture from a live interface until a signal arrives. Single-threaded:
/// record appends, timer pushes, and stats emission all interleave on this
/// loop, so every datagram a worker sends carries an increasing sequence
/// number.
pub async fn run_live(mut worker: Worker, cfg: CaptureConfig, watch: Option<ParentWatch>) -> Result<()> {
    let live = capture::start_live(cfg)?;
    // Hold the blocking task's handle; the loop below outlives it only on
    // shutdown paths that exit the process anyway.
    let _capture_handle = live.handle;
    let mut events = live.events;
    let stats = live.stats;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigchld = signal(SignalKind::child())?;

    let poll_parent = watch.as_ref().is_some_and(ParentWatch::needs_poll);
    let mut parent_tick = tokio::time::interval(Duration::from_secs(1));
    let mut stats_ticks: u32 = 0;

    tokio::pin! {
        let push = tokio::time::sleep(jittered(PUSH_INTERVAL));
        let stats_timer = tokio::time::sleep(jittered(STATS_INTERVAL));
    }

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(rec) => {
                    worker.batch.append(&rec, &mut worker.seq, &mut worker.emitter);
                }
                None => bail!("capture loop terminated"),
            },

            () = &mut push => {
                if worker.batch.last_send().elapsed() >= PUSH_INTERVAL {
                    worker.batch.flush(&mut worker.seq, &mut worker.emitter);
                }
                push.as_mut()
                    .reset(tokio::time::Instant::now() + jittered(PUSH_INTERVAL));
            }

            () = &mut stats_timer => {
                stats_ticks += 1;
                let counters = stats.snapshot();
                if stats_ticks % 6 == 0 {
                    print_stats(&counters);
                }
                let frame = build_stats_frame(&counters, worker.sample_rate, &mut worker.seq);
                worker.emitter.emit(&frame);
                stats_timer
                    .as_mut()
                    .reset(tokio::time::Instant::now() + jittered(STATS_INTERVAL));
            }

            _ = sigterm.recv() => {
                info!("received SIGTERM");
                clean_exit(&mut worker, &stats, &live.cancel);
            }

            _ = sigint.recv() => {
                info!("received SIGINT");
                clean_exit(&mut worker, &stats, &live.cancel);
            }

            // Any child death takes the whole group down.
            _ = sigchld.recv() => {
                if let Ok(status) = nix::sys::wait::wait() {
                    info!("child exited: {:?}", status.pid());
                }
                clean_exit(&mut worker, &stats, &live.cancel);
            }

            _ = parent_tick.tick(), if poll_parent => {
                if watch.as_ref().is_some_and(ParentWatch::orphaned) {
                    info!("parent exited");
                    clean_exit(&mut worker, &stats, &live.cancel);
                }
            }
        }
    }
}

/// Drain a capture file, then push whatever is left in the batch and report
/// how much was read. No timers run in this mode.
pub fn run_file(
    mut worker: Worker,
    path: &std::path::Path,
    filter: &str,
    encap: &EncapPorts,
) -> Result<()> {
    let sample_rate = worker.sample_rate;
    let captured = capture::run_file(path, filter, encap, sample_rate, |rec| {
        worker.batch.append(&rec, &mut worker.seq, &mut worker.emitter);
    })?;

    worker.batch.flush(&mut worker.seq, &mut worker.emitter);
    worker.emitter.close();
    info!("{captured} packets captured");
    Ok(())
}
