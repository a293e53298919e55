use anyhow::{Result, bail};
use log::info;
use nix::sys::signal::{Signal, kill};
use nix::unistd::{ForkResult, Pid, fork, getppid};

/// Upper bound on forked workers.
pub const MAX_WORKERS: u32 = 64;

/// This process's place in the worker group. The parent keeps index 1 and
/// the pids of its children; children carry an empty table. A shard index
/// handed in from outside does not make this process anyone's child, so
/// `forked` records whether the group came from our own fork.
pub struct WorkerGroup {
    pub index: u32,
    pub total: u32,
    forked: bool,
    children: Vec<Pid>,
}

impl WorkerGroup {
    /// A worker whose shard was assigned externally. Its parent process is
    /// not part of the group, so it gets no parent-death supervision.
    pub fn single(index: u32, total: u32) -> Self {
        WorkerGroup {
            index,
            total,
            forked: false,
            children: Vec::new(),
        }
    }

    pub fn is_child(&self) -> bool {
        self.forked && self.index != 1
    }

    /// Ask every child to exit. Best effort, a child may already be gone.
    pub fn signal_children(&self) {
        for pid in &self.children {
            let _ = kill(*pid, Signal::SIGTERM);
        }
    }
}

/// Fork `n - 1` children. Each child returns its own 1-based index with an
/// empty child table; the parent returns index 1 holding every child pid.
///
/// Must run before the async runtime is created. Each worker then opens its
/// own capture with its own shard filter.
pub fn fork_workers(n: u32) -> Result<WorkerGroup> {
    if n > MAX_WORKERS {
        bail!("at most {MAX_WORKERS} workers");
    }

    let mut children = Vec::new();
    for index in 2..=n {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                return Ok(WorkerGroup {
                    index,
                    total: n,
                    forked: true,
                    children: Vec::new(),
                });
            }
            Ok(ForkResult::Parent { child }) => {
                info!("forked worker {index} (pid {child})");
                children.push(child);
            }
            Err(e) => bail!("fork failed: {e}"),
        }
    }

    Ok(WorkerGroup {
        index: 1,
        total: n,
        forked: true,
        children,
    })
}

/// Makes a forked worker exit when its parent dies. On Linux the kernel
/// delivers SIGTERM directly; elsewhere the scheduler polls for
/// reparenting to init.
pub struct ParentWatch {
    poll: bool,
}

impl ParentWatch {
    pub fn install() -> Result<Self> {
        if cfg!(target_os = "linux") {
            #[cfg(target_os = "linux")]
            nix::sys::prctl::set_pdeathsig(Signal::SIGTERM)?;
            Ok(ParentWatch { poll: false })
        } else {
            Ok(ParentWatch { poll: true })
        }
    }

    pub fn needs_poll(&self) -> bool {
        self.poll
    }

    pub fn orphaned(&self) -> bool {
        self.poll && getppid() == Pid::from_raw(1)
    }
}
