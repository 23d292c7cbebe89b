//! The aggregate metadata table, its sidecar, and the changelog.

use anyhow::{Context, Result};
use chrono::NaiveDate;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::Path;

use super::metadata::{MetaField, MetaRecord};

pub const TABLE_FILE: &str = "fmriprep_runs.tsv";
pub const SIDECAR_FILE: &str = "fmriprep_runs.json";
pub const CHANGELOG_FILE: &str = "CHANGES";

pub const TABLE_COLUMNS: [&str; 4] = [
    "participant_id",
    "stc_ref_time",
    "fmriprep_start",
    "fmriprep_stop",
];

pub type Table = BTreeMap<String, MetaRecord>;

/// Load the persisted table. A missing file is an empty table (first
/// reconciliation run).
pub fn load(path: &Path) -> Result<Table> {
    let mut table = Table::new();
    if !path.exists() {
        return Ok(table);
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read table {}", path.display()))?;
    let mut lines = raw.lines();
    let header = lines.next().unwrap_or_default();
    let cols: Vec<&str> = header.split('\t').collect();
    anyhow::ensure!(
        cols == TABLE_COLUMNS,
        "Aggregate table {} has unexpected header {:?}",
        path.display(),
        cols
    );
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let fields: Vec<&str> = line.split('\t').collect();
        anyhow::ensure!(
            fields.len() == TABLE_COLUMNS.len(),
            "Aggregate table {} has malformed row {:?}",
            path.display(),
            line
        );
        table.insert(
            fields[0].to_string(),
            MetaRecord {
                stc_ref_time: MetaField::parse(fields[1]),
                start: MetaField::parse(fields[2]),
                stop: MetaField::parse(fields[3]),
            },
        );
    }
    Ok(table)
}

/// Union of persisted and fresh rows. On key collision the fresh row
/// wholly replaces the old one, field by field losses included.
pub fn merge_rows(persisted: Table, fresh: Table) -> Table {
    let mut merged = persisted;
    for (id, record) in fresh {
        merged.insert(id, record);
    }
    merged
}

pub fn render(table: &Table) -> String {
    let mut out = String::from(
        "participant_id\tstc_ref_time\tfmriprep_start\tfmriprep_stop\n",
    );
    for (id, rec) in table {
        out.push_str(&format!(
            "{id}\t{}\t{}\t{}\n",
            rec.stc_ref_time, rec.start, rec.stop
        ));
    }
    out
}

/// Static field-description sidecar, one entry per table column.
pub fn sidecar() -> String {
    let doc = json!({
        "participant_id": {
            "Description": "Normalized participant identifier in the merged dataset"
        },
        "stc_ref_time": {
            "Description": "Slice-timing correction reference time applied by fMRIPrep",
            "Units": "s"
        },
        "fmriprep_start": {
            "Description": "fMRIPrep run start, from the scheduler job log or the run log directory name"
        },
        "fmriprep_stop": {
            "Description": "fMRIPrep run completion, from the scheduler job log"
        }
    });
    format!("{}\n", serde_json::to_string_pretty(&doc).expect("static sidecar serializes"))
}

/// A dated changelog section for one reconciliation run.
pub fn changelog_section(
    date: NaiveDate,
    already_merged: &[String],
    newly_merged: &[(String, String)],
    failed: usize,
) -> String {
    let mut out = format!("{}\n", date.format("%Y-%m-%d"));
    if !already_merged.is_empty() {
        out.push_str(&format!(
            "  Previously merged: {}\n",
            already_merged.join(", ")
        ));
    }
    for (unit, branch) in newly_merged {
        out.push_str(&format!("  Merged {unit} from {branch}\n"));
    }
    if failed > 0 {
        out.push_str(&format!("  Failed merges: {failed}\n"));
    }
    out
}

pub fn append_changelog(path: &Path, section: &str) -> Result<()> {
    let mut existing = if path.exists() {
        std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read changelog {}", path.display()))?
    } else {
        String::new()
    };
    if !existing.is_empty() && !existing.ends_with("\n\n") {
        while existing.ends_with('\n') {
            existing.pop();
        }
        existing.push_str("\n\n");
    }
    existing.push_str(section);
    std::fs::write(path, existing)
        .with_context(|| format!("Failed to write changelog {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn rec(stc: &str, start: &str, stop: &str) -> MetaRecord {
        MetaRecord {
            stc_ref_time: MetaField::parse(stc),
            start: MetaField::parse(start),
            stop: MetaField::parse(stop),
        }
    }

    #[test]
    fn render_is_sorted_with_fixed_header() {
        let mut table = Table::new();
        table.insert("sub-b".into(), rec("0.5", "n/a", "n/a"));
        table.insert("sub-a".into(), rec("n/a", "2024-01-01T10:00:00", "n/a"));
        let text = render(&table);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(
            lines[0],
            "participant_id\tstc_ref_time\tfmriprep_start\tfmriprep_stop"
        );
        assert!(lines[1].starts_with("sub-a\t"));
        assert!(lines[2].starts_with("sub-b\t"));
    }

    #[test]
    fn load_round_trips_render() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(TABLE_FILE);
        let mut table = Table::new();
        table.insert("sub-x".into(), rec("0.71", "2024-01-01T10:00:00", "n/a"));
        std::fs::write(&path, render(&table)).unwrap();
        assert_eq!(load(&path).unwrap(), table);
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        assert!(load(&dir.path().join(TABLE_FILE)).unwrap().is_empty());
    }

    #[test]
    fn collision_replaces_whole_row() {
        let mut persisted = Table::new();
        persisted.insert("sub-x".into(), rec("12.5", "2024-01-01T10:00:00", "n/a"));
        let mut fresh = Table::new();
        fresh.insert("sub-x".into(), rec("n/a", "n/a", "2024-01-01T11:00:00"));

        let merged = merge_rows(persisted, fresh);
        let row = &merged["sub-x"];
        // The fresh row wins in full; previously known fields regress to n/a.
        assert_eq!(row.stc_ref_time, MetaField::Unavailable);
        assert_eq!(row.start, MetaField::Unavailable);
        assert_eq!(row.stop, MetaField::Known("2024-01-01T11:00:00".into()));
    }

    #[test]
    fn merge_keeps_disjoint_rows() {
        let mut persisted = Table::new();
        persisted.insert("sub-a".into(), rec("0.5", "n/a", "n/a"));
        let mut fresh = Table::new();
        fresh.insert("sub-b".into(), rec("0.6", "n/a", "n/a"));
        let merged = merge_rows(persisted, fresh);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn sidecar_describes_every_column() {
        let doc: serde_json::Value = serde_json::from_str(&sidecar()).unwrap();
        for col in TABLE_COLUMNS {
            assert!(doc.get(col).is_some(), "missing sidecar entry for {col}");
        }
    }

    #[test]
    fn changelog_sections_accumulate() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CHANGELOG_FILE);
        let date = NaiveDate::from_ymd_opt(2024, 2, 1).unwrap();
        let s1 = changelog_section(
            date,
            &[],
            &[("sub-a".into(), "job/d/s/sub-a/1_1".into())],
            0,
        );
        append_changelog(&path, &s1).unwrap();
        let s2 = changelog_section(
            NaiveDate::from_ymd_opt(2024, 2, 8).unwrap(),
            &["sub-a".into()],
            &[("sub-b".into(), "job/d/s/sub-b/2_1".into())],
            1,
        );
        append_changelog(&path, &s2).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("2024-02-01\n  Merged sub-a from job/d/s/sub-a/1_1"));
        assert!(text.contains("2024-02-08\n  Previously merged: sub-a"));
        assert!(text.contains("Failed merges: 1"));
    }
}
