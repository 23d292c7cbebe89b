//! Configuration for prepflow.
//!
//! Settings come from a `prepflow.toml` file, layered with environment
//! variables (the SLURM array variables) and CLI flags:
//!
//! ```toml
//! [store]
//! canonical = "/data/store/abide-fmriprep"
//! scratch_root = "/scratch/prepflow"
//! rescue_dir = "/data/rescue"
//!
//! [prefetch]
//! lock_path = "/data/templateflow/.prepflow-prefetch.lock"
//! command = ["/usr/local/bin/populate-templateflow"]
//!
//! [compute]
//! command = ["fmriprep-docker", "--skip-bids-validation"]
//!
//! [[replicas]]
//! name = "gin"
//! url = "/mnt/gin/abide-fmriprep-derivatives"
//! capability = "content"
//!
//! [[replicas]]
//! name = "github"
//! url = "https://github.com/lab/abide-fmriprep-derivatives"
//! capability = "refs"
//!
//! [reconcile]
//! trunk = "main"
//! logs_dir = "/data/store/abide-fmriprep/slurm-logs"
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::errors::SelectionError;

/// What a replica target can accept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    /// Accepts refs and annexed content (a sibling store on shared disk).
    Content,
    /// Accepts refs only (a plain git hosting remote).
    Refs,
}

impl std::fmt::Display for Capability {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Capability::Content => write!(f, "content"),
            Capability::Refs => write!(f, "refs"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreSection {
    /// Directory holding `inputs/`, `derivatives/` and `participants.tsv`.
    pub canonical: PathBuf,
    /// Parent for per-task scratch clones.
    pub scratch_root: PathBuf,
    /// Destination for the best-effort plain-file rescue copy.
    #[serde(default)]
    pub rescue_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefetchSection {
    /// Lock file guarding the shared reference dataset.
    pub lock_path: PathBuf,
    /// Populate command, run while holding the lock. Must be idempotent.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputeSection {
    /// Compute command; prepflow appends `<input> <output> <unit-id>`.
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSection {
    pub name: String,
    pub url: String,
    pub capability: Capability,
}

fn default_trunk() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileSection {
    /// Trunk branch of the derivatives store.
    #[serde(default = "default_trunk")]
    pub trunk: String,
    /// Directory of scheduler job logs, indexed by unit id.
    #[serde(default)]
    pub logs_dir: Option<PathBuf>,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            trunk: default_trunk(),
            logs_dir: None,
        }
    }
}

/// The `prepflow.toml` schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrepflowToml {
    pub store: StoreSection,
    #[serde(default)]
    pub prefetch: Option<PrefetchSection>,
    pub compute: ComputeSection,
    #[serde(default)]
    pub replicas: Vec<ReplicaSection>,
    #[serde(default)]
    pub reconcile: ReconcileSection,
}

impl PrepflowToml {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let parsed: Self = toml::from_str(&raw)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        Ok(parsed)
    }
}

/// Runtime configuration: the parsed TOML plus derived canonical paths.
#[derive(Debug, Clone)]
pub struct Config {
    pub toml: PrepflowToml,
    pub inputs_repo: PathBuf,
    pub derivatives_repo: PathBuf,
    pub index_table: PathBuf,
}

impl Config {
    pub fn load(config_path: &Path) -> Result<Self> {
        let toml = PrepflowToml::load(config_path)?;
        let canonical = &toml.store.canonical;
        anyhow::ensure!(
            canonical.is_dir(),
            "Canonical store {} does not exist",
            canonical.display()
        );
        let inputs_repo = canonical.join("inputs");
        let derivatives_repo = canonical.join("derivatives");
        let index_table = canonical.join("participants.tsv");
        Ok(Self {
            toml,
            inputs_repo,
            derivatives_repo,
            index_table,
        })
    }
}

/// Who this task instance is, per the scheduler contract.
#[derive(Debug, Clone)]
pub struct TaskIdentity {
    pub job_id: String,
    /// 1-based array index.
    pub task_index: usize,
}

impl TaskIdentity {
    /// Resolve from CLI flags, falling back to the SLURM array variables.
    ///
    /// A missing task index is only an error once selection actually needs
    /// it, so the index stays optional here and `require_index` enforces it.
    pub fn resolve(job_id: Option<String>, task_index: Option<usize>) -> (Option<String>, Option<usize>) {
        let job_id = job_id.or_else(|| std::env::var("SLURM_ARRAY_JOB_ID").ok());
        let task_index = task_index.or_else(|| {
            std::env::var("SLURM_ARRAY_TASK_ID")
                .ok()
                .and_then(|v| v.parse().ok())
        });
        (job_id, task_index)
    }

    pub fn require(
        job_id: Option<String>,
        task_index: Option<usize>,
    ) -> Result<Self, SelectionError> {
        let job_id = job_id.ok_or_else(|| {
            SelectionError::Other(anyhow::anyhow!(
                "No job id available (pass --job-id or set SLURM_ARRAY_JOB_ID)"
            ))
        })?;
        let task_index = task_index.ok_or(SelectionError::MissingTaskIndex)?;
        Ok(Self { job_id, task_index })
    }
}
