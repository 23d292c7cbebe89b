//! Versioned store plumbing on top of git2.
//!
//! `Store` wraps a repository and exposes the capability contract the rest
//! of the system needs: clone, branch-from-tip, stage/commit, push, fetch,
//! ancestry checks, and read-only tree scans. Target refs are always passed
//! explicitly rather than relying on whatever happens to be checked out;
//! the reconciler's trunk precondition is the one deliberate exception.

pub mod content;

use anyhow::{Context, Result};
use git2::build::CheckoutBuilder;
use git2::{
    BranchType, IndexAddOption, ObjectType, Oid, Repository, RepositoryInitOptions, Signature,
    TreeWalkMode, TreeWalkResult,
};
use std::path::Path;

pub struct Store {
    repo: Repository,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Repository::open(path)
            .with_context(|| format!("Failed to open store at {}", path.display()))?;
        Ok(Self { repo })
    }

    /// Initialize a new store with trunk named `main`.
    pub fn init(path: &Path) -> Result<Self> {
        let mut opts = RepositoryInitOptions::new();
        opts.initial_head("main");
        let repo = Repository::init_opts(path, &opts)
            .with_context(|| format!("Failed to init store at {}", path.display()))?;
        Ok(Self { repo })
    }

    /// Clone a store. Large content never lives in history (only pointer
    /// files do), so this transfers metadata regardless of content size.
    pub fn clone(src: &str, dst: &Path) -> Result<Self> {
        let repo = Repository::clone(src, dst)
            .with_context(|| format!("Failed to clone {} into {}", src, dst.display()))?;
        Ok(Self { repo })
    }

    pub fn repo(&self) -> &Repository {
        &self.repo
    }

    pub fn workdir(&self) -> Result<&Path> {
        self.repo
            .workdir()
            .context("Store has no working directory")
    }

    pub fn signature() -> Result<Signature<'static>> {
        Ok(Signature::now("prepflow", "prepflow@localhost")?)
    }

    pub fn head_oid(&self) -> Result<Oid> {
        Ok(self.repo.head()?.peel_to_commit()?.id())
    }

    /// Shorthand of the currently checked-out ref.
    pub fn current_branch(&self) -> Result<String> {
        let head = self.repo.head()?;
        Ok(head.shorthand().unwrap_or("HEAD").to_string())
    }

    /// Tip of a local branch, `None` when it does not exist.
    pub fn local_branch_tip(&self, name: &str) -> Option<Oid> {
        self.repo
            .find_branch(name, BranchType::Local)
            .ok()
            .and_then(|b| b.get().target())
    }

    /// Force-fetch a single branch head from an address into the same-named
    /// local branch, without requiring a configured remote. Returns the new
    /// local tip; `None` when the address does not serve that branch.
    pub fn fetch_branch(&self, url: &str, branch: &str) -> Result<Option<Oid>> {
        let mut remote = self.repo.remote_anonymous(url)?;
        let refspec = format!("+refs/heads/{branch}:refs/heads/{branch}");
        if remote.fetch(&[refspec.as_str()], None, None).is_err() {
            return Ok(None);
        }
        Ok(self.local_branch_tip(branch))
    }

    /// Create `name` at the current HEAD tip and check it out.
    pub fn checkout_new_branch(&self, name: &str) -> Result<()> {
        let head = self.repo.head()?.peel_to_commit()?;
        self.repo
            .branch(name, &head, false)
            .with_context(|| format!("Failed to create branch {}", name))?;
        self.repo.set_head(&format!("refs/heads/{name}"))?;
        self.repo
            .checkout_head(Some(CheckoutBuilder::new().force()))?;
        Ok(())
    }

    /// Stage everything and commit on HEAD. Returns `None` when the staged
    /// tree is identical to HEAD's tree (no no-op commits).
    pub fn stage_all_and_commit(&self, message: &str) -> Result<Option<Oid>> {
        let mut index = self.repo.index()?;
        index.add_all(["*"].iter(), IndexAddOption::DEFAULT, None)?;
        index.update_all(["*"].iter(), None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = self.repo.find_tree(tree_id)?;
        let sig = Self::signature()?;

        match self.head_commit() {
            Some(parent) => {
                if parent.tree_id() == tree_id {
                    return Ok(None);
                }
                let oid = self
                    .repo
                    .commit(Some("HEAD"), &sig, &sig, message, &tree, &[&parent])?;
                Ok(Some(oid))
            }
            None => {
                let oid = self
                    .repo
                    .commit(Some("HEAD"), &sig, &sig, message, &tree, &[])?;
                Ok(Some(oid))
            }
        }
    }

    fn head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Push refspecs to an address, without requiring a configured remote.
    pub fn push(&self, url: &str, refspecs: &[&str]) -> Result<()> {
        let mut remote = self.repo.remote_anonymous(url)?;
        remote
            .push(refspecs, None)
            .with_context(|| format!("Push to {} failed", url))?;
        Ok(())
    }

    /// Fetch all branch heads from a configured remote.
    pub fn fetch(&self, remote: &str) -> Result<()> {
        let mut r = self
            .repo
            .find_remote(remote)
            .with_context(|| format!("No remote named {}", remote))?;
        let refspec = format!("+refs/heads/*:refs/remotes/{remote}/*");
        r.fetch(&[refspec.as_str()], None, None)
            .with_context(|| format!("Fetch from {} failed", remote))?;
        Ok(())
    }

    /// All remote-tracking branches of `remote`, names stripped of the
    /// `<remote>/` prefix, excluding the symbolic HEAD entry.
    pub fn remote_branches(&self, remote: &str) -> Result<Vec<(String, Oid)>> {
        let prefix = format!("{remote}/");
        let mut out = Vec::new();
        for entry in self.repo.branches(Some(BranchType::Remote))? {
            let (branch, _) = entry?;
            let Some(name) = branch.name()? else { continue };
            let Some(stripped) = name.strip_prefix(&prefix) else {
                continue;
            };
            if stripped == "HEAD" {
                continue;
            }
            if let Some(oid) = branch.get().target() {
                out.push((stripped.to_string(), oid));
            }
        }
        out.sort();
        Ok(out)
    }

    pub fn is_ancestor_of(&self, ancestor: Oid, descendant: Oid) -> Result<bool> {
        if ancestor == descendant {
            return Ok(true);
        }
        Ok(self.repo.graph_descendant_of(descendant, ancestor)?)
    }

    /// UTF-8 contents of every blob named `file_name` anywhere in the
    /// commit's tree, in tree-walk order.
    pub fn blobs_named(&self, commit: Oid, file_name: &str) -> Result<Vec<String>> {
        let tree = self.repo.find_commit(commit)?.tree()?;
        let mut out = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |_, entry| {
            if entry.kind() == Some(ObjectType::Blob)
                && entry.name() == Some(file_name)
                && let Ok(obj) = entry.to_object(&self.repo)
                && let Some(blob) = obj.as_blob()
            {
                out.push(String::from_utf8_lossy(blob.content()).into_owned());
            }
            TreeWalkResult::Ok
        })?;
        Ok(out)
    }

    /// Names of every directory entry under `subtree` in the commit's
    /// tree, sorted. Entries outside the subtree are ignored; a branch cut
    /// from trunk also carries other units' already-merged artifacts.
    pub fn tree_dir_names(&self, commit: Oid, subtree: &str) -> Result<Vec<String>> {
        let tree = self.repo.find_commit(commit)?.tree()?;
        let prefix = format!("{subtree}/");
        let mut out = Vec::new();
        tree.walk(TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() == Some(ObjectType::Tree)
                && let Some(name) = entry.name()
                && format!("{root}{name}").starts_with(&prefix)
            {
                out.push(name.to_string());
            }
            TreeWalkResult::Ok
        })?;
        out.sort();
        out.dedup();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn store_with_commit(dir: &Path) -> Store {
        let store = Store::init(dir).unwrap();
        fs::write(dir.join("README.md"), "derivatives\n").unwrap();
        store.stage_all_and_commit("init").unwrap().unwrap();
        store
    }

    #[test]
    fn init_uses_main_as_trunk() {
        let dir = tempdir().unwrap();
        let store = store_with_commit(dir.path());
        assert_eq!(store.current_branch().unwrap(), "main");
    }

    #[test]
    fn stage_all_and_commit_skips_noop() {
        let dir = tempdir().unwrap();
        let store = store_with_commit(dir.path());
        assert!(store.stage_all_and_commit("again").unwrap().is_none());
        fs::write(dir.path().join("new.tsv"), "a\t1\n").unwrap();
        assert!(store.stage_all_and_commit("change").unwrap().is_some());
    }

    #[test]
    fn checkout_new_branch_starts_at_trunk_tip() {
        let dir = tempdir().unwrap();
        let store = store_with_commit(dir.path());
        let trunk_tip = store.head_oid().unwrap();
        store.checkout_new_branch("job/a/n/u/1_1").unwrap();
        assert_eq!(store.current_branch().unwrap(), "job/a/n/u/1_1");
        assert_eq!(store.head_oid().unwrap(), trunk_tip);
    }

    #[test]
    fn push_and_remote_branches_round_trip() {
        let src = tempdir().unwrap();
        let bare = tempdir().unwrap();
        let clone_dir = tempdir().unwrap();

        let store = store_with_commit(src.path());
        let bare_repo = Repository::init_bare(bare.path()).unwrap();
        bare_repo.set_head("refs/heads/main").unwrap();
        let bare_url = bare.path().to_str().unwrap();
        store
            .push(bare_url, &["refs/heads/main:refs/heads/main"])
            .unwrap();
        store.checkout_new_branch("job/d/s/u/7_1").unwrap();
        store
            .push(bare_url, &["refs/heads/job/d/s/u/7_1:refs/heads/job/d/s/u/7_1"])
            .unwrap();

        let clone = Store::clone(bare_url, clone_dir.path()).unwrap();
        clone.fetch("origin").unwrap();
        let branches = clone.remote_branches("origin").unwrap();
        let names: Vec<&str> = branches.iter().map(|(n, _)| n.as_str()).collect();
        assert!(names.contains(&"main"));
        assert!(names.contains(&"job/d/s/u/7_1"));
    }

    #[test]
    fn ancestry_detects_merged_tips() {
        let dir = tempdir().unwrap();
        let store = store_with_commit(dir.path());
        let first = store.head_oid().unwrap();
        fs::write(dir.path().join("more.txt"), "x\n").unwrap();
        let second = store.stage_all_and_commit("more").unwrap().unwrap();
        assert!(store.is_ancestor_of(first, second).unwrap());
        assert!(!store.is_ancestor_of(second, first).unwrap());
        assert!(store.is_ancestor_of(second, second).unwrap());
    }

    #[test]
    fn blobs_named_finds_nested_files() {
        let dir = tempdir().unwrap();
        let store = store_with_commit(dir.path());
        let nested = dir.path().join("sub-1/figures");
        fs::create_dir_all(&nested).unwrap();
        fs::write(nested.join("CITATION.md"), "boilerplate\n").unwrap();
        let oid = store.stage_all_and_commit("citation").unwrap().unwrap();
        let blobs = store.blobs_named(oid, "CITATION.md").unwrap();
        assert_eq!(blobs, vec!["boilerplate\n".to_string()]);
    }

    #[test]
    fn tree_dir_names_lists_generated_dirs() {
        let dir = tempdir().unwrap();
        let store = store_with_commit(dir.path());
        let log_dir = dir.path().join("sub-1/log/20240101-093000_abcd");
        fs::create_dir_all(&log_dir).unwrap();
        fs::write(log_dir.join("run.toml"), "ok = true\n").unwrap();
        let oid = store.stage_all_and_commit("logs").unwrap().unwrap();
        let names = store.tree_dir_names(oid, "sub-1").unwrap();
        assert!(names.iter().any(|n| n == "20240101-093000_abcd"));
    }

    #[test]
    fn tree_dir_names_excludes_other_subtrees() {
        let dir = tempdir().unwrap();
        let store = store_with_commit(dir.path());
        for (unit, stamp) in [("sub-1", "20240101-090000_aaaa"), ("sub-2", "20240601-120000_bbbb")] {
            let log_dir = dir.path().join(unit).join("log").join(stamp);
            fs::create_dir_all(&log_dir).unwrap();
            fs::write(log_dir.join("run.toml"), "ok = true\n").unwrap();
        }
        let oid = store.stage_all_and_commit("logs").unwrap().unwrap();
        let names = store.tree_dir_names(oid, "sub-2").unwrap();
        assert!(names.iter().any(|n| n == "20240601-120000_bbbb"));
        assert!(!names.iter().any(|n| n == "20240101-090000_aaaa"));
        assert!(!names.iter().any(|n| n == "sub-1"));
    }
}
