//! Typed error hierarchy for prepflow.
//!
//! Three top-level enums cover the three subsystems:
//! - `SelectionError` — unit resolution failures (all fatal preconditions)
//! - `ReplicationError` — push pipeline failures
//! - `ReconcileError` — branch merge reconciler failures

use std::path::PathBuf;
use thiserror::Error;

/// Errors from unit selection. All of these fire before any workspace
/// is created, so they have no side effects to unwind.
#[derive(Debug, Error)]
pub enum SelectionError {
    #[error("No task index available (pass --task-index or set SLURM_ARRAY_TASK_ID)")]
    MissingTaskIndex,

    #[error("Unit '{id}' not found in index table {path}")]
    UnitNotFound { id: String, path: PathBuf },

    #[error("List file {path} has no usable line {index}")]
    ListLineMissing { path: PathBuf, index: usize },

    #[error("No units match the given facet filters")]
    NoFacetMatches,

    #[error("Task index {index} out of range: {count} matching unit(s)")]
    IndexOutOfRange { index: usize, count: usize },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the artifact replication pipeline.
#[derive(Debug, Error)]
pub enum ReplicationError {
    /// Every configured replica target failed. A single target failing is
    /// only a warning; this fires when no copy of the branch exists anywhere.
    #[error("All {attempted} replica target(s) failed: {summary}")]
    AllTargetsFailed { attempted: usize, summary: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Errors from the merge reconciler.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The reconciler refuses to run unless the working copy sits on trunk.
    /// Anything else usually means a half-finished merge or a manual edit.
    #[error("Reconciler must run on trunk '{trunk}', but HEAD is '{current}'")]
    NotOnTrunk { trunk: String, current: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
