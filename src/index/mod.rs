//! The unit index table and deterministic unit selection.
//!
//! The table is the single lookup surface for everything a task needs to
//! know about a unit: its normalized id and the facets used for branch
//! naming and enumeration filtering.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::errors::SelectionError;

pub const INDEX_COLUMNS: [&str; 5] = [
    "unit_id",
    "source_dataset",
    "source_site",
    "site_index",
    "source_original_id",
];

/// One row of the index table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    pub id: String,
    pub dataset: String,
    pub site: String,
    pub site_index: String,
    pub original_id: String,
}

/// Facet filters for enumeration-based selection.
#[derive(Debug, Clone, Default)]
pub struct FacetFilter {
    pub dataset: Option<String>,
    pub site: Option<String>,
}

impl FacetFilter {
    fn matches(&self, unit: &Unit) -> bool {
        self.dataset.as_deref().is_none_or(|d| d == unit.dataset)
            && self.site.as_deref().is_none_or(|s| s == unit.site)
    }
}

#[derive(Debug)]
pub struct IndexTable {
    path: PathBuf,
    units: Vec<Unit>,
}

impl IndexTable {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read index table {}", path.display()))?;
        let mut lines = raw.lines();
        let header = lines
            .next()
            .with_context(|| format!("Index table {} is empty", path.display()))?;
        let cols: Vec<&str> = header.split('\t').collect();
        anyhow::ensure!(
            cols == INDEX_COLUMNS,
            "Index table {} has unexpected header {:?}",
            path.display(),
            cols
        );

        let mut units = Vec::new();
        for (lineno, line) in lines.enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let fields: Vec<&str> = line.split('\t').collect();
            anyhow::ensure!(
                fields.len() == INDEX_COLUMNS.len(),
                "Index table {} line {}: expected {} fields, got {}",
                path.display(),
                lineno + 2,
                INDEX_COLUMNS.len(),
                fields.len()
            );
            units.push(Unit {
                id: fields[0].to_string(),
                dataset: fields[1].to_string(),
                site: fields[2].to_string(),
                site_index: fields[3].to_string(),
                original_id: fields[4].to_string(),
            });
        }
        Ok(Self {
            path: path.to_path_buf(),
            units,
        })
    }

    pub fn lookup(&self, id: &str) -> Option<&Unit> {
        self.units.iter().find(|u| u.id == id)
    }

    /// Units matching the filter, sorted by id. Sorting makes array-index
    /// selection reproducible across runs regardless of table row order.
    pub fn filtered(&self, filter: &FacetFilter) -> Vec<&Unit> {
        let mut matched: Vec<&Unit> = self.units.iter().filter(|u| filter.matches(u)).collect();
        matched.sort_by(|a, b| a.id.cmp(&b.id));
        matched
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Resolve the unit this task instance handles.
///
/// Order: an explicit id wins outright; else the list file's line at
/// `task_index`; else filtered enumeration picked at `task_index - 1`.
/// Every id has to resolve against the index table, since branch naming
/// needs the unit's facets.
pub fn resolve_unit(
    table: &IndexTable,
    explicit: Option<&str>,
    list_file: Option<&Path>,
    filter: &FacetFilter,
    task_index: Option<usize>,
) -> Result<Unit, SelectionError> {
    if let Some(id) = explicit {
        return lookup_required(table, id);
    }

    if let Some(list) = list_file {
        let index = task_index.ok_or(SelectionError::MissingTaskIndex)?;
        let raw = std::fs::read_to_string(list)
            .with_context(|| format!("Failed to read list file {}", list.display()))
            .map_err(SelectionError::Other)?;
        let line = raw
            .lines()
            .nth(index.saturating_sub(1))
            .map(str::trim)
            .filter(|l| !l.is_empty());
        let id = match (index, line) {
            (0, _) | (_, None) => {
                return Err(SelectionError::ListLineMissing {
                    path: list.to_path_buf(),
                    index,
                });
            }
            (_, Some(id)) => id,
        };
        return lookup_required(table, id);
    }

    let index = task_index.ok_or(SelectionError::MissingTaskIndex)?;
    let matched = table.filtered(filter);
    if matched.is_empty() {
        return Err(SelectionError::NoFacetMatches);
    }
    if index == 0 || index > matched.len() {
        return Err(SelectionError::IndexOutOfRange {
            index,
            count: matched.len(),
        });
    }
    Ok(matched[index - 1].clone())
}

fn lookup_required(table: &IndexTable, id: &str) -> Result<Unit, SelectionError> {
    table
        .lookup(id)
        .cloned()
        .ok_or_else(|| SelectionError::UnitNotFound {
            id: id.to_string(),
            path: table.path.clone(),
        })
}
