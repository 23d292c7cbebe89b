//! The branch merge reconciler.
//!
//! Runs periodically, outside the task array, in an operator clone of the
//! derivatives store positioned on trunk. Consumes the task branches the
//! array left behind: extracts per-unit metadata, merges pending branches,
//! and maintains the aggregate table, sidecar and changelog.

pub mod metadata;
pub mod table;

use anyhow::{Context, Result};
use chrono::Utc;
use git2::build::CheckoutBuilder;
use git2::{Oid, ResetType};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::errors::ReconcileError;
use crate::store::Store;
use crate::workspace::BranchName;
use metadata::MetaRecord;
use table::Table;

/// Low-value generated files whose conflicts are auto-resolved by keeping
/// trunk's version. Every fMRIPrep run regenerates these with trivial
/// differences; real data conflicts are never auto-resolved.
pub const CITATION_ALLOW_LIST: [&str; 4] = [
    "CITATION.md",
    "CITATION.bib",
    "CITATION.tex",
    "CITATION.html",
];

#[derive(Debug, Clone)]
pub struct ReconcileSettings {
    pub trunk: String,
    pub logs_dir: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    /// (unit id, branch name) merged by this run.
    pub newly_merged: Vec<(String, String)>,
    /// Unit ids whose branches were already ancestors of trunk.
    pub already_merged: Vec<String>,
    /// (branch name, reason) for isolated merge failures.
    pub failed: Vec<(String, String)>,
    /// Branches matching no naming convention, skipped with a warning.
    pub skipped: usize,
    /// The metadata commit, when table/sidecar/changelog changed.
    pub committed: Option<Oid>,
}

/// One full reconciliation pass. A single branch's failure is isolated;
/// the pass still succeeds and reports it.
pub fn run(repo_path: &Path, settings: &ReconcileSettings) -> Result<ReconcileOutcome, ReconcileError> {
    let store = Store::open(repo_path).map_err(ReconcileError::Other)?;
    let current = store.current_branch()?;
    if current != settings.trunk {
        return Err(ReconcileError::NotOnTrunk {
            trunk: settings.trunk.clone(),
            current,
        });
    }

    store.fetch("origin")?;
    let mut outcome = ReconcileOutcome::default();
    let mut pending: Vec<(BranchName, String, Oid)> = Vec::new();
    let mut fresh = Table::new();

    let trunk_tip = store.head_oid()?;
    for (name, oid) in store.remote_branches("origin")? {
        if !name.starts_with("job/") && !name.starts_with("test/") {
            continue;
        }
        let Some(parsed) = BranchName::parse(&name) else {
            warn!(branch = %name, "branch matches no naming convention, skipping");
            outcome.skipped += 1;
            continue;
        };
        let unit_id = parsed.unit_id().to_string();

        // Extraction runs for merged branches too: their metadata may not
        // yet be reflected in the table.
        fresh.insert(unit_id.clone(), extract_for_branch(&store, oid, settings, &unit_id)?);

        if store.is_ancestor_of(oid, trunk_tip).map_err(ReconcileError::Other)? {
            outcome.already_merged.push(unit_id);
        } else {
            pending.push((parsed, name, oid));
        }
    }
    outcome.already_merged.sort();
    outcome.already_merged.dedup();

    for (parsed, name, oid) in pending {
        match merge_one(&store, &name, oid) {
            Ok(()) => {
                info!(branch = %name, "merged");
                outcome
                    .newly_merged
                    .push((parsed.unit_id().to_string(), name));
            }
            Err(reason) => {
                warn!(branch = %name, %reason, "merge failed, trunk left unmodified by it");
                outcome.failed.push((name, reason));
            }
        }
    }

    outcome.committed = write_metadata(&store, &fresh, &outcome)?;
    Ok(outcome)
}

fn extract_for_branch(
    store: &Store,
    oid: Oid,
    settings: &ReconcileSettings,
    unit_id: &str,
) -> Result<MetaRecord, ReconcileError> {
    let citations = store.blobs_named(oid, "CITATION.md")?;
    let dir_names = store.tree_dir_names(oid, unit_id)?;
    Ok(metadata::extract_record(
        &citations,
        &dir_names,
        settings.logs_dir.as_deref(),
        unit_id,
    ))
}

/// Merge one pending branch into trunk. Returns the failure reason instead
/// of an `Err` so callers can record it without aborting the pass; real
/// errors (index corruption, I/O) still propagate as failure reasons.
fn merge_one(store: &Store, branch_name: &str, branch_oid: Oid) -> std::result::Result<(), String> {
    try_merge(store, branch_name, branch_oid).map_err(|err| {
        // Whatever happened, leave trunk in its prior state.
        if let Err(restore_err) = restore_trunk(store) {
            warn!(%restore_err, "failed to restore trunk after aborted merge");
        }
        format!("{err:#}")
    })
}

fn try_merge(store: &Store, branch_name: &str, branch_oid: Oid) -> Result<()> {
    let repo = store.repo();
    let trunk_commit = repo.head()?.peel_to_commit()?;
    let annotated = repo.find_annotated_commit(branch_oid)?;

    let mut checkout = CheckoutBuilder::new();
    checkout.allow_conflicts(true).force();
    repo.merge(&[&annotated], None, Some(&mut checkout))?;

    let mut index = repo.index()?;
    if index.has_conflicts() {
        let conflicted = conflicted_paths(&index)?;
        let only_citations = conflicted
            .iter()
            .all(|p| file_name_allowed(p));
        if !only_citations {
            anyhow::bail!(
                "non-citation conflicts in {}: {}",
                branch_name,
                conflicted.join(", ")
            );
        }
        resolve_keeping_trunk(repo, &mut index)?;
    }

    let tree_id = index.write_tree()?;
    let tree = repo.find_tree(tree_id)?;
    let sig = Store::signature()?;
    let branch_commit = repo.find_commit(branch_oid)?;
    repo.commit(
        Some("HEAD"),
        &sig,
        &sig,
        &format!("Merge branch '{branch_name}'"),
        &tree,
        &[&trunk_commit, &branch_commit],
    )?;
    repo.cleanup_state()?;
    repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
    Ok(())
}

fn conflicted_paths(index: &git2::Index) -> Result<Vec<String>> {
    let mut paths = Vec::new();
    for conflict in index.conflicts()? {
        let conflict = conflict?;
        let entry = conflict
            .our
            .as_ref()
            .or(conflict.ancestor.as_ref())
            .or(conflict.their.as_ref())
            .context("conflict with no entries")?;
        paths.push(String::from_utf8_lossy(&entry.path).into_owned());
    }
    paths.sort();
    paths.dedup();
    Ok(paths)
}

fn file_name_allowed(path: &str) -> bool {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| CITATION_ALLOW_LIST.contains(&n))
}

/// Resolve every conflict by keeping trunk's side of exactly those files.
/// A file trunk deleted stays deleted.
fn resolve_keeping_trunk(repo: &git2::Repository, index: &mut git2::Index) -> Result<()> {
    // Stage bits of an index entry's flags.
    const STAGE_MASK: u16 = 0x3000;

    let conflicts: Vec<git2::IndexConflict> = index
        .conflicts()?
        .collect::<std::result::Result<_, git2::Error>>()?;
    for conflict in conflicts {
        match conflict.our {
            Some(mut ours) => {
                ours.flags &= !STAGE_MASK;
                index.add(&ours)?;
            }
            None => {
                let entry = conflict
                    .ancestor
                    .as_ref()
                    .or(conflict.their.as_ref())
                    .context("conflict with no entries")?;
                let path = String::from_utf8_lossy(&entry.path).into_owned();
                index.remove_path(Path::new(&path))?;
            }
        }
    }
    index.write()?;
    anyhow::ensure!(!index.has_conflicts(), "conflicts remain after resolution");
    repo.checkout_index(None, Some(CheckoutBuilder::new().force()))?;
    Ok(())
}

fn restore_trunk(store: &Store) -> Result<()> {
    let repo = store.repo();
    repo.cleanup_state()?;
    let head = repo.head()?.peel_to_commit()?;
    repo.reset(head.as_object(), ResetType::Hard, None)?;
    Ok(())
}

/// Rebuild table/sidecar/changelog in the working tree and commit them
/// together, only if anything actually changed.
fn write_metadata(
    store: &Store,
    fresh: &Table,
    outcome: &ReconcileOutcome,
) -> Result<Option<Oid>, ReconcileError> {
    let workdir = store.workdir()?;
    let table_path = workdir.join(table::TABLE_FILE);

    let persisted = table::load(&table_path)?;
    let merged = table::merge_rows(persisted, fresh.clone());
    std::fs::write(&table_path, table::render(&merged))
        .with_context(|| format!("Failed to write {}", table_path.display()))?;
    std::fs::write(workdir.join(table::SIDECAR_FILE), table::sidecar())
        .context("Failed to write sidecar")?;

    if !outcome.newly_merged.is_empty() || !outcome.failed.is_empty() {
        let section = table::changelog_section(
            Utc::now().date_naive(),
            &outcome.already_merged,
            &outcome.newly_merged,
            outcome.failed.len(),
        );
        table::append_changelog(&workdir.join(table::CHANGELOG_FILE), &section)?;
    }

    let message = format!(
        "Reconcile task branches: {} merged, {} failed",
        outcome.newly_merged.len(),
        outcome.failed.len()
    );
    let committed = store.stage_all_and_commit(&message)?;
    Ok(committed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use git2::Repository;
    use std::fs;
    use tempfile::tempdir;

    /// Origin with a trunk commit, an operator clone on trunk, and a
    /// helper to publish task branches from scratch clones.
    struct Fixture {
        _origin_dir: tempfile::TempDir,
        origin_url: String,
        clone_dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let origin_dir = tempdir().unwrap();
            let bare = Repository::init_bare(origin_dir.path()).unwrap();
            bare.set_head("refs/heads/main").unwrap();
            let origin_url = origin_dir.path().to_str().unwrap().to_string();

            let seed = tempdir().unwrap();
            let store = Store::init(seed.path()).unwrap();
            fs::write(seed.path().join("dataset_description.json"), "{}\n").unwrap();
            store.stage_all_and_commit("init derivatives").unwrap();
            store
                .push(&origin_url, &["refs/heads/main:refs/heads/main"])
                .unwrap();

            let clone_dir = tempdir().unwrap();
            Store::clone(&origin_url, clone_dir.path()).unwrap();
            Self {
                _origin_dir: origin_dir,
                origin_url,
                clone_dir,
            }
        }

        /// Publish a task branch carrying `files` (path → contents).
        fn publish_branch(&self, branch: &str, files: &[(&str, &str)]) {
            let scratch = tempdir().unwrap();
            let store = Store::clone(&self.origin_url, scratch.path()).unwrap();
            store.checkout_new_branch(branch).unwrap();
            for (path, contents) in files {
                let full = scratch.path().join(path);
                fs::create_dir_all(full.parent().unwrap()).unwrap();
                fs::write(full, contents).unwrap();
            }
            store.stage_all_and_commit("task output").unwrap();
            store
                .push(
                    &self.origin_url,
                    &[&format!("refs/heads/{branch}:refs/heads/{branch}")],
                )
                .unwrap();
        }

        fn settings(&self) -> ReconcileSettings {
            ReconcileSettings {
                trunk: "main".into(),
                logs_dir: None,
            }
        }

        fn reconcile(&self) -> ReconcileOutcome {
            run(self.clone_dir.path(), &self.settings()).unwrap()
        }
    }

    const CITATION: &str = "BOLD runs were slice-time corrected to 0.71s using 3dTshift.\n";

    #[test]
    fn not_on_trunk_is_fatal() {
        let fixture = Fixture::new();
        let clone = Store::open(fixture.clone_dir.path()).unwrap();
        clone.checkout_new_branch("job/d/s/sub-a/1_1").unwrap();
        let err = run(fixture.clone_dir.path(), &fixture.settings()).unwrap_err();
        assert!(matches!(err, ReconcileError::NotOnTrunk { .. }));
    }

    #[test]
    fn merges_pending_branch_and_builds_table() {
        let fixture = Fixture::new();
        fixture.publish_branch(
            "job/abide1/nyu/sub-a001/9_1",
            &[("sub-a001/figures/CITATION.md", CITATION)],
        );

        let outcome = fixture.reconcile();
        assert_eq!(outcome.newly_merged.len(), 1);
        assert_eq!(outcome.newly_merged[0].0, "sub-a001");
        assert!(outcome.failed.is_empty());
        assert!(outcome.committed.is_some());

        let table_text =
            fs::read_to_string(fixture.clone_dir.path().join(table::TABLE_FILE)).unwrap();
        assert!(table_text.contains("sub-a001\t0.71\tn/a\tn/a"));
        let changes =
            fs::read_to_string(fixture.clone_dir.path().join(table::CHANGELOG_FILE)).unwrap();
        assert!(changes.contains("Merged sub-a001 from job/abide1/nyu/sub-a001/9_1"));
        assert!(fixture
            .clone_dir
            .path()
            .join(table::SIDECAR_FILE)
            .exists());
    }

    #[test]
    fn second_run_is_idempotent() {
        let fixture = Fixture::new();
        fixture.publish_branch(
            "job/abide1/nyu/sub-a001/9_1",
            &[("sub-a001/figures/CITATION.md", CITATION)],
        );
        let first = fixture.reconcile();
        assert_eq!(first.newly_merged.len(), 1);
        let table_after_first =
            fs::read_to_string(fixture.clone_dir.path().join(table::TABLE_FILE)).unwrap();

        let second = fixture.reconcile();
        assert!(second.newly_merged.is_empty());
        assert_eq!(second.already_merged, vec!["sub-a001".to_string()]);
        assert!(second.committed.is_none(), "no no-op commits");
        let table_after_second =
            fs::read_to_string(fixture.clone_dir.path().join(table::TABLE_FILE)).unwrap();
        assert_eq!(table_after_first, table_after_second);
    }

    #[test]
    fn citation_only_conflicts_auto_resolve_keeping_trunk() {
        let fixture = Fixture::new();
        // Two branches touching the same CITATION.md with different text.
        fixture.publish_branch(
            "job/abide1/nyu/sub-a001/9_1",
            &[("logs/CITATION.md", "citation text from run 9\n")],
        );
        fixture.publish_branch(
            "job/abide1/nyu/sub-a002/10_1",
            &[("logs/CITATION.md", "citation text from run 10\n")],
        );

        let outcome = fixture.reconcile();
        assert_eq!(outcome.newly_merged.len(), 2);
        assert!(outcome.failed.is_empty());

        // Trunk keeps the first-merged version; the second branch's
        // citation loses.
        let kept =
            fs::read_to_string(fixture.clone_dir.path().join("logs/CITATION.md")).unwrap();
        assert_eq!(kept, "citation text from run 9\n");
    }

    #[test]
    fn real_conflict_is_isolated_failure() {
        let fixture = Fixture::new();
        fixture.publish_branch(
            "job/abide1/nyu/sub-a001/9_1",
            &[("shared/notes.txt", "from run 9\n")],
        );
        fixture.publish_branch(
            "job/abide1/nyu/sub-a002/10_1",
            &[
                ("shared/notes.txt", "from run 10\n"),
                ("sub-a002/ok.json", "{}\n"),
            ],
        );

        let outcome = fixture.reconcile();
        assert_eq!(outcome.newly_merged.len(), 1);
        assert_eq!(outcome.failed.len(), 1);
        assert!(outcome.failed[0].0.contains("sub-a002") || outcome.failed[0].0.contains("sub-a001"));

        // Trunk is untouched by the failed branch: only one version of
        // notes.txt landed.
        let notes =
            fs::read_to_string(fixture.clone_dir.path().join("shared/notes.txt")).unwrap();
        assert!(notes == "from run 9\n" || notes == "from run 10\n");
        // The failed branch's unique file never reached trunk when a002 failed.
        let changes =
            fs::read_to_string(fixture.clone_dir.path().join(table::CHANGELOG_FILE)).unwrap();
        assert!(changes.contains("Failed merges: 1"));
    }

    #[test]
    fn dir_name_fallback_ignores_other_units_run_dirs() {
        let fixture = Fixture::new();
        // The branch also carries another unit's older, already-merged run
        // log dir, as any branch cut from trunk does.
        fixture.publish_branch(
            "job/abide1/nyu/sub-a002/11_1",
            &[
                ("sub-a001/log/20240101-090000_aaaa/run.toml", "ok = true\n"),
                ("sub-a002/log/20240601-120000_bbbb/run.toml", "ok = true\n"),
            ],
        );

        let outcome = fixture.reconcile();
        assert_eq!(outcome.newly_merged.len(), 1);
        let table_text =
            fs::read_to_string(fixture.clone_dir.path().join(table::TABLE_FILE)).unwrap();
        assert!(
            table_text.contains("sub-a002\tn/a\t2024-06-01T12:00:00\tn/a"),
            "start must come from the unit's own run dir, got:\n{table_text}"
        );
    }

    #[test]
    fn nonconforming_branches_are_skipped_with_warning() {
        let fixture = Fixture::new();
        fixture.publish_branch("job/too/short", &[("x.txt", "x\n")]);
        let outcome = fixture.reconcile();
        assert_eq!(outcome.skipped, 1);
        assert!(outcome.newly_merged.is_empty());
    }

    #[test]
    fn extraction_covers_already_merged_branches() {
        let fixture = Fixture::new();
        fixture.publish_branch(
            "job/abide1/nyu/sub-a001/9_1",
            &[("sub-a001/figures/CITATION.md", CITATION)],
        );
        fixture.reconcile();

        // Wipe the table from trunk to simulate it lagging behind merges.
        fs::remove_file(fixture.clone_dir.path().join(table::TABLE_FILE)).unwrap();
        let clone = Store::open(fixture.clone_dir.path()).unwrap();
        clone.stage_all_and_commit("drop table").unwrap();

        let outcome = fixture.reconcile();
        assert!(outcome.newly_merged.is_empty());
        assert!(outcome.committed.is_some());
        let table_text =
            fs::read_to_string(fixture.clone_dir.path().join(table::TABLE_FILE)).unwrap();
        assert!(table_text.contains("sub-a001\t0.71"));
    }
}
