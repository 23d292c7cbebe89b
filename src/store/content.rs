//! Large-content layer: pointer files, an object directory, and a
//! union-mergeable location log branch.
//!
//! History only ever carries pointer files for large artifacts; the bytes
//! live under `.prepflow/objects/` keyed by content hash. Which files count
//! as large follows the BIDS setup of the original store: structured text
//! stays in git, everything else (imaging data, surfaces, HDF5, SVG) is
//! pointered.

use anyhow::{Context, Result};
use chrono::Utc;
use git2::Oid;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use super::Store;

pub const POINTER_MAGIC: &str = "prepflow-pointer v1";

/// Branch carrying per-key location logs. Writers only append lines and
/// updates sort+dedupe, so concurrent updates from different tasks merge
/// as a union without destroying each other's entries.
pub const LOCATION_BRANCH: &str = "content-index";

const KEEP_IN_GIT_EXTENSIONS: [&str; 15] = [
    "json", "tsv", "txt", "md", "html", "bib", "tex", "toml", "yml", "yaml", "csv", "log", "bval",
    "bvec", "rst",
];

const KEEP_IN_GIT_NAMES: [&str; 3] = ["CHANGES", "LICENSE", ".bidsignore"];

/// Content-addressed key of a large file.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentKey {
    pub hash: String,
    pub size: u64,
}

impl fmt::Display for ContentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sha256-{}-s{}", self.hash, self.size)
    }
}

impl ContentKey {
    pub fn parse(s: &str) -> Option<Self> {
        let rest = s.strip_prefix("sha256-")?;
        let (hash, size) = rest.rsplit_once("-s")?;
        if hash.len() != 64 || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self {
            hash: hash.to_string(),
            size: size.parse().ok()?,
        })
    }
}

/// Whether a file is kept directly in git rather than pointered.
pub fn keeps_in_git(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if KEEP_IN_GIT_NAMES.contains(&name) || name.starts_with("README") {
        return true;
    }
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| KEEP_IN_GIT_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

pub fn objects_dir(workdir: &Path) -> PathBuf {
    workdir.join(".prepflow").join("objects")
}

pub fn object_path(objects: &Path, key: &ContentKey) -> PathBuf {
    objects.join(&key.hash[..2]).join(key.to_string())
}

/// Parse a pointer file. `None` when the file is regular content.
pub fn read_pointer(path: &Path) -> Result<Option<ContentKey>> {
    // Pointer files are two short text lines; skip anything bigger.
    let meta = fs::metadata(path)?;
    if meta.len() > 256 {
        return Ok(None);
    }
    let raw = fs::read(path)?;
    let Ok(text) = std::str::from_utf8(&raw) else {
        return Ok(None);
    };
    let mut lines = text.lines();
    if lines.next() != Some(POINTER_MAGIC) {
        return Ok(None);
    }
    let key = lines
        .next()
        .and_then(ContentKey::parse)
        .with_context(|| format!("Malformed pointer file {}", path.display()))?;
    Ok(Some(key))
}

pub fn write_pointer(path: &Path, key: &ContentKey) -> Result<()> {
    fs::write(path, format!("{POINTER_MAGIC}\n{key}\n"))
        .with_context(|| format!("Failed to write pointer {}", path.display()))
}

fn hash_file(path: &Path) -> Result<ContentKey> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let size = std::io::copy(&mut file, &mut hasher)?;
    Ok(ContentKey {
        hash: format!("{:x}", hasher.finalize()),
        size,
    })
}

fn is_internal(entry: &walkdir::DirEntry) -> bool {
    entry.file_name() == ".git" || entry.file_name() == ".prepflow"
}

/// Replace every large file under `workdir/subtree` with a pointer, moving
/// the bytes into the local object dir. Returns the keys annexed.
pub fn annex_tree(workdir: &Path, subtree: &Path) -> Result<Vec<ContentKey>> {
    let objects = objects_dir(workdir);
    let root = workdir.join(subtree);
    let mut keys = Vec::new();
    if !root.exists() {
        return Ok(keys);
    }
    for entry in WalkDir::new(&root).into_iter().filter_entry(|e| !is_internal(e)) {
        let entry = entry?;
        if !entry.file_type().is_file() || keeps_in_git(entry.path()) {
            continue;
        }
        if read_pointer(entry.path())?.is_some() {
            continue;
        }
        let key = hash_file(entry.path())?;
        let dest = object_path(&objects, &key);
        fs::create_dir_all(dest.parent().context("object path has no parent")?)?;
        if !dest.exists() {
            fs::rename(entry.path(), &dest).or_else(|_| {
                fs::copy(entry.path(), &dest).map(|_| ()).and_then(|_| {
                    fs::remove_file(entry.path())
                })
            })?;
        } else {
            fs::remove_file(entry.path())?;
        }
        write_pointer(entry.path(), &key)?;
        keys.push(key);
    }
    keys.sort_by(|a, b| a.hash.cmp(&b.hash));
    keys.dedup();
    Ok(keys)
}

/// Pointer files under `workdir/subtree` with their keys.
pub fn pointer_keys(workdir: &Path, subtree: &Path) -> Result<Vec<(PathBuf, ContentKey)>> {
    let root = workdir.join(subtree);
    let mut out = Vec::new();
    if !root.exists() {
        return Ok(out);
    }
    for entry in WalkDir::new(&root).into_iter().filter_entry(|e| !is_internal(e)) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(key) = read_pointer(entry.path())? {
            out.push((entry.path().to_path_buf(), key));
        }
    }
    Ok(out)
}

/// Turn pointers under `workdir/subtree` back into real bytes, copying
/// objects from `source_objects` (the origin store's object dir). Returns
/// how many files were materialized.
pub fn materialize_tree(workdir: &Path, subtree: &Path, source_objects: &Path) -> Result<usize> {
    let mut count = 0;
    for (path, key) in pointer_keys(workdir, subtree)? {
        let src = object_path(source_objects, &key);
        anyhow::ensure!(
            src.exists(),
            "Content {} for {} missing from {}",
            key,
            path.display(),
            source_objects.display()
        );
        fs::copy(&src, &path)
            .with_context(|| format!("Failed to materialize {}", path.display()))?;
        count += 1;
    }
    Ok(count)
}

/// Delete local object bytes for every pointer under `workdir/subtree`.
/// The pointers themselves stay; content can be re-fetched from a
/// content-capable replica.
pub fn drop_objects(workdir: &Path, subtree: &Path) -> Result<usize> {
    let objects = objects_dir(workdir);
    let mut dropped = 0;
    for (_, key) in pointer_keys(workdir, subtree)? {
        let obj = object_path(&objects, &key);
        if obj.exists() {
            fs::remove_file(&obj)
                .with_context(|| format!("Failed to drop object {}", obj.display()))?;
            dropped += 1;
        }
    }
    Ok(dropped)
}

/// Copy object bytes for `keys` from one object dir into another.
pub fn copy_objects(src_objects: &Path, dst_objects: &Path, keys: &[ContentKey]) -> Result<usize> {
    let mut copied = 0;
    for key in keys {
        let src = object_path(src_objects, key);
        let dst = object_path(dst_objects, key);
        anyhow::ensure!(src.exists(), "Object {} missing from {}", key, src_objects.display());
        if dst.exists() {
            continue;
        }
        fs::create_dir_all(dst.parent().context("object path has no parent")?)?;
        fs::copy(&src, &dst)?;
        copied += 1;
    }
    Ok(copied)
}

/// Record that `remote` now holds `keys`, on the location log branch,
/// parented on the current local tip of that branch. Returns the new tip,
/// or `None` when nothing changed.
///
/// Callers syncing with a replica must first bring the local branch up to
/// the replica's tip (`fetch_location_tip`); otherwise independent task
/// clones commit unrelated roots and all but the first push is rejected.
pub fn record_locations(store: &Store, keys: &[ContentKey], remote: &str) -> Result<Option<Oid>> {
    if keys.is_empty() {
        return Ok(None);
    }
    let repo = store.repo();
    let parent_oid = store.local_branch_tip(LOCATION_BRANCH);
    let parent_tree = match parent_oid {
        Some(oid) => Some(repo.find_commit(oid)?.tree()?),
        None => None,
    };
    let mut builder = repo.treebuilder(parent_tree.as_ref())?;

    let stamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    for key in keys {
        let name = format!("{key}.log");
        let mut lines: Vec<String> = match builder.get(&name)? {
            Some(entry) => {
                let blob = repo.find_blob(entry.id())?;
                String::from_utf8_lossy(blob.content())
                    .lines()
                    .map(str::to_string)
                    .collect()
            }
            None => Vec::new(),
        };
        lines.push(format!("{stamp} {remote} +"));
        lines.sort();
        lines.dedup();
        let blob = repo.blob(format!("{}\n", lines.join("\n")).as_bytes())?;
        builder.insert(&name, blob, 0o100644)?;
    }

    let tree_id = builder.write()?;
    if let Some(ref t) = parent_tree
        && t.id() == tree_id
    {
        return Ok(None);
    }
    let tree = repo.find_tree(tree_id)?;
    let sig = Store::signature()?;
    let message = format!("Record content locations on {remote}");
    let oid = match parent_oid {
        Some(oid) => {
            let parent = repo.find_commit(oid)?;
            repo.commit(
                Some(&format!("refs/heads/{LOCATION_BRANCH}")),
                &sig,
                &sig,
                &message,
                &tree,
                &[&parent],
            )?
        }
        None => repo.commit(
            Some(&format!("refs/heads/{LOCATION_BRANCH}")),
            &sig,
            &sig,
            &message,
            &tree,
            &[],
        )?,
    };
    Ok(Some(oid))
}

/// Update the local location branch to the content target's tip. `None`
/// when the target does not carry the branch yet (first writer).
pub fn fetch_location_tip(store: &Store, url: &str) -> Result<Option<Oid>> {
    store.fetch_branch(url, LOCATION_BRANCH)
}
