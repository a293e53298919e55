use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use nix::fcntl::{Flock, FlockArg};

use crate::cli::ConfigError;

/// An exclusively locked pid file. The advisory lock is released when the
/// process exits, so keep the handle alive for the process lifetime.
pub struct PidFile {
    _lock: Flock<File>,
}

/// Write and lock the pid file. A second instance pointed at the same path
/// fails with a contention error instead of starting.
pub fn write_pid_file(path: &Path) -> Result<PidFile, ConfigError> {
    let fail = |e: std::io::Error| ConfigError::PidFile(format!("{}: {e}", path.display()));

    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(path)
        .map_err(fail)?;

    let mut lock = Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
        ConfigError::PidFile(format!(
            "{} is locked ({errno}), already running?",
            path.display()
        ))
    })?;

    lock.set_len(0).map_err(fail)?;
    writeln!(&mut *lock, "{}", std::process::id()).map_err(fail)?;
    lock.sync_all().map_err(fail)?;

    Ok(PidFile { _lock: lock })
}
