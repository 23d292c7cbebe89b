//! Per-task isolated workspaces and task-branch naming.
//!
//! Every task instance gets a scratch directory keyed by (job id, task
//! index) with metadata-only clones of the inputs and derivatives stores,
//! plus a uniquely named branch in the derivatives clone. Uniqueness of
//! both is what lets an arbitrary number of array tasks share the
//! canonical store without any store-level locking.

use anyhow::{Context, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::{Config, TaskIdentity};
use crate::index::Unit;
use crate::store::{Store, content};

/// A task branch name. The job id component keeps names collision-free
/// across repeated re-runs of the same unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchName {
    /// `job/<dataset>/<site>/<unit>/<job-id>_<task-index>`
    Job {
        dataset: String,
        site: String,
        unit: String,
        job_id: String,
        task_index: usize,
    },
    /// `test/<purpose>/<unit>/<job-id>` for diagnostic runs.
    Test {
        purpose: String,
        unit: String,
        job_id: String,
    },
}

impl BranchName {
    pub fn for_task(unit: &Unit, identity: &TaskIdentity, test_purpose: Option<&str>) -> Self {
        match test_purpose {
            Some(purpose) => BranchName::Test {
                purpose: purpose.to_string(),
                unit: unit.id.clone(),
                job_id: identity.job_id.clone(),
            },
            None => BranchName::Job {
                dataset: unit.dataset.clone(),
                site: unit.site.clone(),
                unit: unit.id.clone(),
                job_id: identity.job_id.clone(),
                task_index: identity.task_index,
            },
        }
    }

    /// Parse a branch name back into its components. `None` for branches
    /// outside the task naming convention.
    pub fn parse(name: &str) -> Option<Self> {
        let parts: Vec<&str> = name.split('/').collect();
        match parts.as_slice() {
            ["job", dataset, site, unit, run] => {
                let (job_id, task_index) = run.rsplit_once('_')?;
                Some(BranchName::Job {
                    dataset: dataset.to_string(),
                    site: site.to_string(),
                    unit: unit.to_string(),
                    job_id: job_id.to_string(),
                    task_index: task_index.parse().ok()?,
                })
            }
            ["test", purpose, unit, job_id] => Some(BranchName::Test {
                purpose: purpose.to_string(),
                unit: unit.to_string(),
                job_id: job_id.to_string(),
            }),
            _ => None,
        }
    }

    pub fn unit_id(&self) -> &str {
        match self {
            BranchName::Job { unit, .. } | BranchName::Test { unit, .. } => unit,
        }
    }
}

impl fmt::Display for BranchName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchName::Job {
                dataset,
                site,
                unit,
                job_id,
                task_index,
            } => write!(f, "job/{dataset}/{site}/{unit}/{job_id}_{task_index}"),
            BranchName::Test {
                purpose,
                unit,
                job_id,
            } => write!(f, "test/{purpose}/{unit}/{job_id}"),
        }
    }
}

/// A task's private working area.
pub struct Workspace {
    pub root: PathBuf,
    pub inputs: Store,
    pub derivatives: Store,
    pub branch: BranchName,
    /// Object dir of the canonical inputs store, for materialization.
    canonical_input_objects: PathBuf,
}

impl Workspace {
    /// Clone the canonical store into scratch and check out the task
    /// branch. Clones carry pointer files only, so this is cheap no
    /// matter how much imaging data the store holds.
    pub fn create(
        cfg: &Config,
        unit: &Unit,
        identity: &TaskIdentity,
        test_purpose: Option<&str>,
    ) -> Result<Self> {
        let root = cfg
            .toml
            .store
            .scratch_root
            .join(format!("{}_{}", identity.job_id, identity.task_index));
        anyhow::ensure!(
            !root.exists(),
            "Scratch directory {} already exists; refusing to reuse it",
            root.display()
        );
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create scratch dir {}", root.display()))?;

        let inputs_src = cfg
            .inputs_repo
            .to_str()
            .context("Inputs store path is not valid UTF-8")?;
        let derivatives_src = cfg
            .derivatives_repo
            .to_str()
            .context("Derivatives store path is not valid UTF-8")?;

        let inputs = Store::clone(inputs_src, &root.join("inputs"))?;
        let derivatives = Store::clone(derivatives_src, &root.join("derivatives"))?;

        let branch = BranchName::for_task(unit, identity, test_purpose);
        derivatives.checkout_new_branch(&branch.to_string())?;
        info!(branch = %branch, root = %root.display(), "workspace ready");

        Ok(Self {
            root,
            inputs,
            derivatives,
            branch,
            canonical_input_objects: content::objects_dir(&cfg.inputs_repo),
        })
    }

    pub fn input_dir(&self) -> Result<&Path> {
        self.inputs.workdir()
    }

    pub fn output_dir(&self) -> Result<&Path> {
        self.derivatives.workdir()
    }

    /// Fetch the one unit's raw input content, and nothing else.
    pub fn fetch_unit_input(&self, unit_id: &str) -> Result<usize> {
        let count = content::materialize_tree(
            self.input_dir()?,
            Path::new(unit_id),
            &self.canonical_input_objects,
        )?;
        info!(unit = unit_id, files = count, "fetched raw input content");
        Ok(count)
    }

    /// Best-effort space reclamation after successful replication. Both
    /// drops are warnings on failure; the produce+replicate contract is
    /// already met by the time this runs.
    pub fn cleanup(&self, unit_id: &str) {
        match content::drop_objects(
            self.output_dir().unwrap_or(&self.root),
            Path::new(unit_id),
        ) {
            Ok(n) => info!(unit = unit_id, objects = n, "dropped local output content"),
            Err(err) => warn!(unit = unit_id, %err, "failed to drop local output content"),
        }
        match self.restore_input_pointers(unit_id) {
            Ok(()) => info!(unit = unit_id, "dropped fetched input content"),
            Err(err) => warn!(unit = unit_id, %err, "failed to drop fetched input content"),
        }
    }

    /// Materialized input files are restored to their committed pointer
    /// form; the clone holds no input objects of its own.
    fn restore_input_pointers(&self, unit_id: &str) -> Result<()> {
        let repo = self.inputs.repo();
        let mut checkout = git2::build::CheckoutBuilder::new();
        checkout.force().path(unit_id);
        repo.checkout_head(Some(&mut checkout))
            .context("Failed to restore input pointers")?;
        Ok(())
    }
}
