//! The per-task driver: unit resolution and the task flow.
//!
//! Selection happens first and fails fast: no scratch directory, branch,
//! or lock exists until a unit has been resolved. The rest of the flow is
//! prefetch → workspace → compute → replicate → cleanup.

use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::{info, warn};

use crate::compute;
use crate::config::{Config, TaskIdentity};
use crate::index::{FacetFilter, IndexTable, Unit, resolve_unit};
use crate::prefetch;
use crate::replicate::{self, StageReport};

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Explicit unit id; wins over every other selection mode.
    pub unit: Option<String>,
    /// One unit id per line; the task index picks the line.
    pub list_file: Option<PathBuf>,
    pub dataset: Option<String>,
    pub site: Option<String>,
    pub job_id: Option<String>,
    pub task_index: Option<usize>,
    /// Marks a diagnostic run; branch goes under `test/<purpose>/...`.
    pub test_purpose: Option<String>,
}

#[derive(Debug)]
pub struct RunSummary {
    pub unit: Unit,
    pub branch: String,
    pub reports: Vec<StageReport>,
}

/// Resolve which unit this instance handles. No side effects.
pub fn select(cfg: &Config, opts: &RunOptions) -> Result<(Unit, TaskIdentity)> {
    let table = IndexTable::load(&cfg.index_table)?;
    let (job_id, mut task_index) = TaskIdentity::resolve(opts.job_id.clone(), opts.task_index);

    let filter = FacetFilter {
        dataset: opts.dataset.clone(),
        site: opts.site.clone(),
    };
    let unit = resolve_unit(
        &table,
        opts.unit.as_deref(),
        opts.list_file.as_deref(),
        &filter,
        task_index,
    )?;

    // An explicit unit id needs no array index for selection; default the
    // scratch/branch component so single ad-hoc runs work outside arrays.
    if opts.unit.is_some() {
        task_index = task_index.or(Some(1));
    }
    let identity = TaskIdentity::require(job_id, task_index)?;
    Ok((unit, identity))
}

/// The whole per-task flow.
pub fn run_task(cfg: &Config, opts: &RunOptions) -> Result<RunSummary> {
    let (unit, identity) = select(cfg, opts)?;
    info!(unit = %unit.id, job = %identity.job_id, task = identity.task_index, "unit resolved");

    if let Some(section) = &cfg.toml.prefetch {
        prefetch::run(section).context("Shared resource prefetch failed")?;
    }

    let workspace =
        crate::workspace::Workspace::create(cfg, &unit, &identity, opts.test_purpose.as_deref())?;
    workspace.fetch_unit_input(&unit.id)?;

    compute::run(
        &cfg.toml.compute,
        workspace.input_dir()?,
        workspace.output_dir()?,
        &unit.id,
    )?;

    // Rescue copy runs before anything that can still fail, so output
    // survives a total replication loss.
    if let Some(rescue_root) = &cfg.toml.store.rescue_dir {
        let dest = rescue_root.join(format!(
            "{}_{}_{}",
            unit.id, identity.job_id, identity.task_index
        ));
        match replicate::rescue_copy(
            workspace.output_dir()?,
            std::path::Path::new(&unit.id),
            &dest,
        ) {
            Ok(n) => info!(files = n, dest = %dest.display(), "rescue copy written"),
            Err(err) => warn!(%err, "rescue copy failed"),
        }
    }

    let branch = workspace.branch.to_string();
    let (_, keys) = replicate::commit_output(&workspace.derivatives, &unit.id, &branch)?;
    let reports = replicate::replicate(
        &workspace.derivatives,
        &branch,
        &keys,
        &cfg.toml.replicas,
    )?;

    workspace.cleanup(&unit.id);

    Ok(RunSummary {
        unit,
        branch,
        reports,
    })
}
