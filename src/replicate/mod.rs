//! Artifact replication: rescue copy, commit, and the two-stage push.
//!
//! The push targets are data, not control flow: an ordered list of
//! capability-tagged sinks, each attempted exactly once, aggregated with
//! logical OR. The content-capable sink runs first (fast, on shared disk)
//! so output bytes are recoverable even if the authoritative refs-only
//! sink is down; retry policy belongs to the external scheduler, not here.

use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::{Capability, ReplicaSection};
use crate::errors::ReplicationError;
use crate::store::{Store, content};
use crate::store::content::ContentKey;

/// Outcome of one push stage.
#[derive(Debug)]
pub struct StageReport {
    pub target: String,
    pub capability: Capability,
    pub outcome: Result<(), String>,
}

/// Best-effort plain-file rescue copy of the output tree, dereferencing
/// pointer files into real bytes where possible. Runs before anything
/// that could fail, so output survives even a total replication loss.
pub fn rescue_copy(output_root: &Path, subtree: &Path, dest: &Path) -> Result<usize> {
    let src_root = output_root.join(subtree);
    anyhow::ensure!(
        src_root.exists(),
        "Nothing to rescue: {} does not exist",
        src_root.display()
    );
    let objects = content::objects_dir(output_root);
    let mut copied = 0;
    for entry in WalkDir::new(&src_root)
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git" && e.file_name() != ".prepflow")
    {
        let entry = entry?;
        let rel = entry.path().strip_prefix(&src_root)?;
        let target = dest.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        match content::read_pointer(entry.path())? {
            Some(key) => {
                let obj = content::object_path(&objects, &key);
                if obj.exists() {
                    fs::copy(&obj, &target)?;
                } else {
                    // No bytes on hand; the pointer is still better than
                    // nothing.
                    fs::copy(entry.path(), &target)?;
                }
            }
            None => {
                fs::copy(entry.path(), &target)?;
            }
        }
        copied += 1;
    }
    Ok(copied)
}

/// Annex new large output files and commit everything on the task branch.
/// Returns the commit and the keys of newly annexed content.
pub fn commit_output(
    derivatives: &Store,
    unit_id: &str,
    branch: &str,
) -> Result<(git2::Oid, Vec<ContentKey>)> {
    let workdir = derivatives.workdir()?;
    let keys = content::annex_tree(workdir, Path::new(unit_id))?;
    let message = format!("fMRIPrep output for {unit_id}\n\nBranch: {branch}");
    let oid = derivatives
        .stage_all_and_commit(&message)?
        .context("Compute step produced no committable output")?;
    info!(unit = unit_id, commit = %oid, annexed = keys.len(), "committed task output");
    Ok((oid, keys))
}

/// Push the task branch to every configured target in order. Overall
/// success is the OR of the per-target outcomes; only a clean sweep of
/// failures is fatal.
pub fn replicate(
    derivatives: &Store,
    branch: &str,
    keys: &[ContentKey],
    targets: &[ReplicaSection],
) -> Result<Vec<StageReport>, ReplicationError> {
    if targets.is_empty() {
        warn!("no replica targets configured; task output exists only locally");
        return Ok(Vec::new());
    }

    let refspec = format!("refs/heads/{branch}:refs/heads/{branch}");
    let mut reports = Vec::with_capacity(targets.len());
    for target in targets {
        let outcome = push_target(derivatives, &refspec, keys, target);
        match &outcome {
            Ok(()) => info!(target = %target.name, capability = %target.capability, "push succeeded"),
            Err(err) => warn!(target = %target.name, error = %err, "push failed"),
        }
        reports.push(StageReport {
            target: target.name.clone(),
            capability: target.capability,
            outcome: outcome.map_err(|e| format!("{e:#}")),
        });
    }

    if reports.iter().all(|r| r.outcome.is_err()) {
        let summary = reports
            .iter()
            .map(|r| {
                format!(
                    "{}: {}",
                    r.target,
                    r.outcome.as_ref().err().map(String::as_str).unwrap_or("?")
                )
            })
            .collect::<Vec<_>>()
            .join("; ");
        return Err(ReplicationError::AllTargetsFailed {
            attempted: reports.len(),
            summary,
        });
    }
    Ok(reports)
}

fn push_target(
    derivatives: &Store,
    refspec: &str,
    keys: &[ContentKey],
    target: &ReplicaSection,
) -> Result<()> {
    derivatives.push(&target.url, &[refspec])?;
    if target.capability == Capability::Content {
        transfer_content(derivatives, keys, target)?;
        // Location tracking is advisory; losing it only costs a lookup.
        if let Err(err) = sync_location_log(derivatives, keys, target) {
            warn!(target = %target.name, %err, "location log sync failed");
        }
    }
    Ok(())
}

fn transfer_content(derivatives: &Store, keys: &[ContentKey], target: &ReplicaSection) -> Result<()> {
    if keys.is_empty() {
        return Ok(());
    }
    let remote_objects = content::objects_dir(Path::new(&target.url));
    let local_objects = content::objects_dir(derivatives.workdir()?);
    let copied = content::copy_objects(&local_objects, &remote_objects, keys)
        .with_context(|| format!("Content transfer to {} failed", target.name))?;
    info!(target = %target.name, objects = copied, "content transferred");
    Ok(())
}

/// Append this task's location entries on top of the target's current log
/// tip and push. Parenting on the fetched tip is what lets concurrent
/// tasks union their entries instead of racing unrelated roots; a push
/// rejected by a concurrent writer is retried once on the fresh tip.
fn sync_location_log(derivatives: &Store, keys: &[ContentKey], target: &ReplicaSection) -> Result<()> {
    let refspec = format!(
        "refs/heads/{b}:refs/heads/{b}",
        b = content::LOCATION_BRANCH
    );
    content::fetch_location_tip(derivatives, &target.url)?;
    if content::record_locations(derivatives, keys, &target.name)?.is_none() {
        return Ok(());
    }
    if let Err(first_err) = derivatives.push(&target.url, &[refspec.as_str()]) {
        debug!(target = %target.name, err = %first_err, "location log push raced, re-unioning");
        content::fetch_location_tip(derivatives, &target.url)?;
        content::record_locations(derivatives, keys, &target.name)?;
        derivatives.push(&target.url, &[refspec.as_str()])?;
    }
    Ok(())
}
