//! `prepflow run` — one task-array instance.

use anyhow::Result;
use console::style;
use std::path::Path;

use prepflow::config::Config;
use prepflow::coordinator::{RunOptions, run_task};

pub fn cmd_run(config_path: &Path, opts: RunOptions) -> Result<()> {
    let cfg = Config::load(config_path)?;
    let summary = run_task(&cfg, &opts)?;

    println!(
        "{} {} on branch {}",
        style("replicated").green().bold(),
        summary.unit.id,
        summary.branch
    );
    for report in &summary.reports {
        match &report.outcome {
            Ok(()) => println!(
                "  {} {} ({})",
                style("ok").green(),
                report.target,
                report.capability
            ),
            Err(err) => println!(
                "  {} {} ({}): {}",
                style("failed").yellow(),
                report.target,
                report.capability,
                err
            ),
        }
    }
    Ok(())
}
