//! Per-unit metadata extraction.
//!
//! Each field comes from an ordered chain of extractors tried in sequence,
//! stopping at the first hit. Absence is an explicit `Unavailable` marker
//! rendered as `n/a`, never an empty cell, so downstream consumers always
//! see all four columns.

use chrono::NaiveDateTime;
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::LazyLock;

/// Either a recovered value or an explicit marker that none of the
/// sources had one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetaField {
    Known(String),
    Unavailable,
}

pub const UNAVAILABLE: &str = "n/a";

impl MetaField {
    pub fn parse(s: &str) -> Self {
        if s == UNAVAILABLE {
            MetaField::Unavailable
        } else {
            MetaField::Known(s.to_string())
        }
    }

    pub fn is_known(&self) -> bool {
        matches!(self, MetaField::Known(_))
    }
}

impl fmt::Display for MetaField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaField::Known(v) => write!(f, "{v}"),
            MetaField::Unavailable => write!(f, "{UNAVAILABLE}"),
        }
    }
}

/// One reconciled row of the aggregate table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaRecord {
    pub stc_ref_time: MetaField,
    pub start: MetaField,
    pub stop: MetaField,
}

static STC_REF: LazyLock<Regex> = LazyLock::new(|| {
    // fMRIPrep's citation boilerplate: "... slice-time corrected to 0.71s ..."
    Regex::new(r"slice-time corrected to ([0-9]+(?:\.[0-9]+)?)s").unwrap()
});

static COMPACT_TS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{8}T\d{6}$").unwrap());

static DIR_TS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{8}-\d{6})").unwrap());

pub const LOG_START_MARKER: &str = "=== fmriprep start ===";
pub const LOG_STOP_MARKER: &str = "=== fmriprep done ===";
pub const LOG_SUCCESS_MARKER: &str = "fMRIPrep finished successfully";

/// First labeled slice-timing reference value found in the given
/// provenance blobs.
pub fn extract_stc_ref(citation_blobs: &[String]) -> MetaField {
    for blob in citation_blobs {
        if let Some(cap) = STC_REF.captures(blob) {
            return MetaField::Known(cap[1].to_string());
        }
    }
    MetaField::Unavailable
}

/// Start/stop timestamps from the scheduler log directory.
///
/// Only logs that prove successful completion count. The timestamp is the
/// compact line (`YYYYMMDDThhmmss`) immediately preceding the start or
/// done marker, converted to ISO form.
pub fn times_from_scheduler_logs(logs_dir: &Path, unit_id: &str) -> (MetaField, MetaField) {
    let Ok(entries) = std::fs::read_dir(logs_dir) else {
        return (MetaField::Unavailable, MetaField::Unavailable);
    };
    let mut names: Vec<_> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.contains(unit_id))
        })
        .collect();
    names.sort();

    for path in names {
        let Ok(text) = std::fs::read_to_string(&path) else {
            continue;
        };
        if !text.contains(LOG_SUCCESS_MARKER) {
            continue;
        }
        let start = timestamp_before_marker(&text, LOG_START_MARKER);
        let stop = timestamp_before_marker(&text, LOG_STOP_MARKER);
        return (start, stop);
    }
    (MetaField::Unavailable, MetaField::Unavailable)
}

fn timestamp_before_marker(text: &str, marker: &str) -> MetaField {
    let mut previous: Option<&str> = None;
    for line in text.lines() {
        let trimmed = line.trim();
        if trimmed.contains(marker) {
            if let Some(prev) = previous
                && COMPACT_TS.is_match(prev)
                && let Ok(ts) = NaiveDateTime::parse_from_str(prev, "%Y%m%dT%H%M%S")
            {
                return MetaField::Known(ts.format("%Y-%m-%dT%H:%M:%S").to_string());
            }
            return MetaField::Unavailable;
        }
        previous = Some(trimmed);
    }
    MetaField::Unavailable
}

/// Fallback start time from fMRIPrep's per-run log directory name
/// (`YYYYMMDD-hhmmss_<uuid>`), found among the branch tree's directory
/// names. Only the workflow start is recoverable this way.
pub fn start_from_run_dir_names(dir_names: &[String]) -> MetaField {
    for name in dir_names {
        if let Some(cap) = DIR_TS.captures(name)
            && let Ok(ts) = NaiveDateTime::parse_from_str(&cap[1], "%Y%m%d-%H%M%S")
        {
            return MetaField::Known(ts.format("%Y-%m-%dT%H:%M:%S").to_string());
        }
    }
    MetaField::Unavailable
}

/// Assemble a record for one branch from the available sources, in
/// precedence order: scheduler log first, branch artifacts second.
pub fn extract_record(
    citation_blobs: &[String],
    dir_names: &[String],
    logs_dir: Option<&Path>,
    unit_id: &str,
) -> MetaRecord {
    let stc_ref_time = extract_stc_ref(citation_blobs);
    let (mut start, stop) = match logs_dir {
        Some(dir) => times_from_scheduler_logs(dir, unit_id),
        None => (MetaField::Unavailable, MetaField::Unavailable),
    };
    if !start.is_known() {
        start = start_from_run_dir_names(dir_names);
    }
    MetaRecord {
        stc_ref_time,
        start,
        stop,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const CITATION: &str = "Results included in this manuscript come from preprocessing \
        performed using fMRIPrep. BOLD runs were slice-time corrected to 0.71s (0.5 of \
        slice acquisition range 0s-1.42s).";

    #[test]
    fn stc_ref_takes_first_match() {
        let blobs = vec![
            "no numbers here".to_string(),
            CITATION.to_string(),
            "slice-time corrected to 9.99s".to_string(),
        ];
        assert_eq!(extract_stc_ref(&blobs), MetaField::Known("0.71".into()));
        assert_eq!(extract_stc_ref(&[]), MetaField::Unavailable);
    }

    #[test]
    fn meta_field_renders_and_parses_sentinel() {
        assert_eq!(MetaField::Unavailable.to_string(), "n/a");
        assert_eq!(MetaField::parse("n/a"), MetaField::Unavailable);
        assert_eq!(
            MetaField::parse("2024-01-01T10:00:00"),
            MetaField::Known("2024-01-01T10:00:00".into())
        );
    }

    fn write_log(dir: &Path, name: &str, body: &str) {
        fs::write(dir.join(name), body).unwrap();
    }

    const GOOD_LOG: &str = "\
loading modules
20240101T100000
=== fmriprep start ===
chatter
20240101T113000
=== fmriprep done ===
fMRIPrep finished successfully!
";

    #[test]
    fn scheduler_log_yields_both_timestamps() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), "fmriprep_sub-a001_8812.out", GOOD_LOG);
        let (start, stop) = times_from_scheduler_logs(dir.path(), "sub-a001");
        assert_eq!(start, MetaField::Known("2024-01-01T10:00:00".into()));
        assert_eq!(stop, MetaField::Known("2024-01-01T11:30:00".into()));
    }

    #[test]
    fn unsuccessful_logs_are_ignored() {
        let dir = tempdir().unwrap();
        let failed = GOOD_LOG.replace("fMRIPrep finished successfully!", "OOM killed");
        write_log(dir.path(), "fmriprep_sub-a001_8810.out", &failed);
        let (start, stop) = times_from_scheduler_logs(dir.path(), "sub-a001");
        assert_eq!(start, MetaField::Unavailable);
        assert_eq!(stop, MetaField::Unavailable);
    }

    #[test]
    fn marker_without_preceding_timestamp_is_unavailable() {
        let dir = tempdir().unwrap();
        let body = "=== fmriprep start ===\n20240101T113000\n=== fmriprep done ===\nfMRIPrep finished successfully!\n";
        write_log(dir.path(), "fmriprep_sub-a001_1.out", body);
        let (start, stop) = times_from_scheduler_logs(dir.path(), "sub-a001");
        assert_eq!(start, MetaField::Unavailable);
        assert_eq!(stop, MetaField::Known("2024-01-01T11:30:00".into()));
    }

    #[test]
    fn logs_for_other_units_are_not_consulted() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), "fmriprep_sub-b999_8812.out", GOOD_LOG);
        let (start, _) = times_from_scheduler_logs(dir.path(), "sub-a001");
        assert_eq!(start, MetaField::Unavailable);
    }

    #[test]
    fn run_dir_name_fallback_parses_fixed_width_stamp() {
        let names = vec![
            "func".to_string(),
            "20240315-221104_7f3a".to_string(),
        ];
        assert_eq!(
            start_from_run_dir_names(&names),
            MetaField::Known("2024-03-15T22:11:04".into())
        );
        assert_eq!(
            start_from_run_dir_names(&["figures".to_string()]),
            MetaField::Unavailable
        );
    }

    #[test]
    fn extract_record_applies_precedence() {
        let dir = tempdir().unwrap();
        write_log(dir.path(), "fmriprep_sub-a001_8812.out", GOOD_LOG);
        let dirs = vec!["20990101-000000_x".to_string()];
        let rec = extract_record(
            &[CITATION.to_string()],
            &dirs,
            Some(dir.path()),
            "sub-a001",
        );
        // Scheduler log wins over the dir-name fallback.
        assert_eq!(rec.start, MetaField::Known("2024-01-01T10:00:00".into()));
        assert_eq!(rec.stop, MetaField::Known("2024-01-01T11:30:00".into()));
        assert_eq!(rec.stc_ref_time, MetaField::Known("0.71".into()));

        // Without a usable log, the dir name supplies the start only.
        let rec = extract_record(&[], &dirs, None, "sub-a001");
        assert_eq!(rec.start, MetaField::Known("2099-01-01T00:00:00".into()));
        assert_eq!(rec.stop, MetaField::Unavailable);
        assert_eq!(rec.stc_ref_time, MetaField::Unavailable);
    }
}
