//! Invocation of the opaque compute step.
//!
//! The scientific computation is an external process handed the input
//! tree, the output tree, and the unit id; success or failure comes back
//! through its exit status and nothing else.

use anyhow::{Context, Result};
use std::path::Path;
use std::process::Command;
use tracing::info;

use crate::config::ComputeSection;

pub fn run(section: &ComputeSection, input: &Path, output: &Path, unit_id: &str) -> Result<()> {
    let (program, args) = section
        .command
        .split_first()
        .context("Compute command is empty")?;
    info!(command = %program, unit = unit_id, "starting compute step");
    let status = Command::new(program)
        .args(args)
        .arg(input)
        .arg(output)
        .arg(unit_id)
        .status()
        .with_context(|| format!("Failed to spawn compute command: {}", program))?;
    anyhow::ensure!(
        status.success(),
        "Compute step for unit {} failed with status {}",
        unit_id,
        status
    );
    info!(unit = unit_id, "compute step finished");
    Ok(())
}
