//! `prepflow merge` — the branch merge reconciler.

use anyhow::Result;
use console::style;
use std::path::Path;

use prepflow::config::Config;
use prepflow::reconcile::{ReconcileSettings, run};

pub fn cmd_merge(config_path: &Path, repo: &Path) -> Result<()> {
    let cfg = Config::load(config_path)?;
    let settings = ReconcileSettings {
        trunk: cfg.toml.reconcile.trunk.clone(),
        logs_dir: cfg.toml.reconcile.logs_dir.clone(),
    };
    let outcome = run(repo, &settings)?;

    // The summary prints regardless of per-branch failures; a failed
    // branch is operator follow-up, not a failed run.
    println!(
        "{} {} newly merged, {} already merged, {} failed",
        style("reconciled:").bold(),
        outcome.newly_merged.len(),
        outcome.already_merged.len(),
        outcome.failed.len()
    );
    for (branch, reason) in &outcome.failed {
        println!("  {} {}: {}", style("failed").yellow(), branch, reason);
    }
    Ok(())
}
