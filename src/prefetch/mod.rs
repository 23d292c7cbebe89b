//! Shared reference dataset prefetch, guarded by an advisory file lock.
//!
//! Many array tasks land on the same node set at once and all of them need
//! the same reference data. The lock guarantees at most one populate runs
//! at a time; the populate command itself is expected to be idempotent and
//! cheap when the data is already present.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

use crate::config::PrefetchSection;

/// Run `f` while holding an exclusive advisory lock on `lock_path`.
/// Acquisition blocks indefinitely; the scheduler's wall-clock limit is
/// the only bound.
pub fn with_lock<T>(lock_path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create lock directory {}", parent.display()))?;
    }
    let lock_file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(lock_path)
        .with_context(|| format!("Failed to open lock file {}", lock_path.display()))?;

    debug!(lock = %lock_path.display(), "waiting for prefetch lock");
    lock_file
        .lock_exclusive()
        .with_context(|| format!("Failed to lock {}", lock_path.display()))?;
    debug!(lock = %lock_path.display(), "prefetch lock acquired");

    let result = f();

    if let Err(err) = fs2::FileExt::unlock(&lock_file) {
        // The lock is released on close anyway; this is just noise.
        debug!(lock = %lock_path.display(), %err, "explicit unlock failed");
    }
    result
}

/// Populate the shared reference dataset exactly once under contention.
/// A populate failure is fatal: the compute step cannot run without the
/// reference data.
pub fn run(section: &PrefetchSection) -> Result<()> {
    with_lock(&section.lock_path, || {
        let (program, args) = section
            .command
            .split_first()
            .context("Prefetch command is empty")?;
        info!(command = %program, "running prefetch populate step");
        let status = Command::new(program)
            .args(args)
            .status()
            .with_context(|| format!("Failed to spawn prefetch command: {}", program))?;
        anyhow::ensure!(
            status.success(),
            "Prefetch populate step failed with status {}",
            status
        );
        Ok(())
    })
}
