//! Consistency validator: a cheap, header-only pass over an index.
//!
//! # Checks
//!
//! Per file, in order:
//!
//! | Issue | Condition |
//! |-------|-----------|
//! | `Empty` | zero-byte file (header not read) |
//! | `CorruptHeader` | catalog decoder rejected the header |
//! | `VariableDrift` | variable set differs from the reference catalog |
//! | `DuplicateVariable` | catalog repeats a name (warning only) |
//! | `DuplicateStep` | other files resolved to the same step |
//! | `OutOfOrder` | listed after a file with a later step |
//!
//! Files are checked and reported in ascending step order whatever order
//! the index lists them in.  The reference catalog is the first one read
//! successfully in that order.
//! Across files, gaps in the step sequence are reported as [`StepGap`]s
//! rather than attached to any single file.
//!
//! Issues are data: `validate` only returns `Err` when the filesystem itself
//! refuses access.  The report carries no timestamps, so validating an
//! unchanged directory twice yields equal reports.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io;
use std::path::PathBuf;
use thiserror::Error;
use tracing::{info, warn};

use crate::catalog::{read_header_file, FormatError, VariableCatalog};
use crate::index::{SnapshotFile, SnapshotIndex};

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Cannot read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IssueKind {
    Empty,
    CorruptHeader { reason: String },
    VariableDrift { missing: Vec<String>, extra: Vec<String> },
    DuplicateVariable { names: Vec<String> },
    DuplicateStep { shadowed: Vec<PathBuf> },
    /// The index listed this file after one with the later step `after`.
    OutOfOrder { after: u64 },
}

impl IssueKind {
    /// Issues that make a file unfit for conversion.
    pub fn is_blocking(&self) -> bool {
        matches!(self, IssueKind::Empty | IssueKind::CorruptHeader { .. } | IssueKind::VariableDrift { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIssues {
    pub file:   SnapshotFile,
    pub issues: BTreeSet<IssueKind>,
}

/// Steps strictly between `after` and `before` are missing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepGap {
    pub after:  u64,
    pub before: u64,
    pub stride: u64,
}

impl StepGap {
    /// Steps expected on the stride grid inside the gap.
    pub fn missing_steps(&self) -> impl Iterator<Item = u64> {
        let stride = self.stride.max(1) as usize;
        (self.after + self.stride..self.before).step_by(stride)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidateOptions {
    /// Known output frequency.  Inferred from the index when `None`.
    pub expected_stride: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Every indexed file in step order, including those without issues.
    pub per_file_issues:   Vec<FileIssues>,
    pub sequence_gaps:     Vec<StepGap>,
    pub stride:            Option<u64>,
    pub reference_catalog: VariableCatalog,
    pub reference_file:    Option<PathBuf>,
}

impl ValidationReport {
    pub fn issues_for(&self, step: u64) -> Option<&BTreeSet<IssueKind>> {
        self.per_file_issues
            .iter()
            .find(|f| f.file.step_id == step)
            .map(|f| &f.issues)
    }

    pub fn is_clean(&self) -> bool {
        self.sequence_gaps.is_empty() && self.per_file_issues.iter().all(|f| f.issues.is_empty())
    }

    pub fn issue_count(&self) -> usize {
        self.per_file_issues.iter().map(|f| f.issues.len()).sum()
    }

    /// Files with no blocking issue, ready to hand to a conversion job.
    pub fn convertible_files(&self) -> Vec<SnapshotFile> {
        self.per_file_issues
            .iter()
            .filter(|f| !f.issues.iter().any(IssueKind::is_blocking))
            .map(|f| f.file.clone())
            .collect()
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Minimum positive difference between consecutive steps.
pub fn infer_stride(steps: &[u64]) -> Option<u64> {
    steps.windows(2).map(|w| w[0].abs_diff(w[1])).filter(|&d| d > 0).min()
}

/// Ascending pairs further apart than `stride`.  Expects sorted steps; a
/// descending pair is never a gap.
pub fn find_gaps(steps: &[u64], stride: u64) -> Vec<StepGap> {
    steps
        .windows(2)
        .filter(|w| w[1].saturating_sub(w[0]) > stride)
        .map(|w| StepGap { after: w[0], before: w[1], stride })
        .collect()
}

/// Steps listed after a larger one, as `(position, largest step before it)`.
fn out_of_order(files: &[SnapshotFile]) -> Vec<(usize, u64)> {
    let mut found = Vec::new();
    let mut latest: Option<u64> = None;
    for (pos, file) in files.iter().enumerate() {
        match latest {
            Some(prev) if file.step_id < prev => found.push((pos, prev)),
            _ => latest = Some(file.step_id),
        }
    }
    found
}

pub fn validate(index: &SnapshotIndex) -> Result<ValidationReport, ValidationError> {
    validate_with(index, &ValidateOptions::default())
}

pub fn validate_with(index: &SnapshotIndex, options: &ValidateOptions) -> Result<ValidationReport, ValidationError> {
    let misplaced = out_of_order(&index.files);
    let mut order: Vec<usize> = (0..index.len()).collect();
    order.sort_by_key(|&pos| index.files[pos].step_id);

    let mut reference: Option<(VariableCatalog, PathBuf)> = None;
    let mut per_file_issues = Vec::with_capacity(index.len());

    for &pos in &order {
        let file = &index.files[pos];
        let mut issues = BTreeSet::new();

        if let Some(&(_, after)) = misplaced.iter().find(|(p, _)| *p == pos) {
            issues.insert(IssueKind::OutOfOrder { after });
        }

        let mut shadowed = index.duplicates_of(file.step_id);
        shadowed.extend(
            index
                .iter()
                .enumerate()
                .filter(|&(other, f)| other != pos && f.step_id == file.step_id)
                .map(|(_, f)| f.path.clone()),
        );
        if !shadowed.is_empty() {
            issues.insert(IssueKind::DuplicateStep { shadowed });
        }

        if file.byte_size == 0 {
            issues.insert(IssueKind::Empty);
        } else {
            match read_header_file(&file.path) {
                Ok((header, _)) => {
                    let catalog = header.variables;
                    let dups = catalog.duplicates();
                    if !dups.is_empty() {
                        issues.insert(IssueKind::DuplicateVariable { names: dups });
                    }
                    match &reference {
                        None => reference = Some((catalog, file.path.clone())),
                        Some((ref_catalog, _)) => {
                            let (missing, extra) = catalog.drift_from(ref_catalog);
                            if !missing.is_empty() || !extra.is_empty() {
                                issues.insert(IssueKind::VariableDrift { missing, extra });
                            }
                        }
                    }
                }
                Err(FormatError::Io(source)) => {
                    return Err(ValidationError::Io { path: file.path.clone(), source });
                }
                Err(e) => {
                    issues.insert(IssueKind::CorruptHeader { reason: e.to_string() });
                }
            }
        }

        for issue in &issues {
            warn!(step = file.step_id, path = %file.path.display(), issue = ?issue, "validation issue");
        }
        per_file_issues.push(FileIssues { file: file.clone(), issues });
    }

    let mut steps = index.steps();
    steps.sort_unstable();
    steps.dedup();
    let stride = options.expected_stride.filter(|&s| s > 0).or_else(|| infer_stride(&steps));
    let sequence_gaps = stride.map(|s| find_gaps(&steps, s)).unwrap_or_default();
    for gap in &sequence_gaps {
        warn!(after = gap.after, before = gap.before, stride = gap.stride, "missing steps");
    }

    let (reference_catalog, reference_file) = match reference {
        Some((catalog, path)) => (catalog, Some(path)),
        None => (VariableCatalog::default(), None),
    };

    let report = ValidationReport {
        per_file_issues,
        sequence_gaps,
        stride,
        reference_catalog,
        reference_file,
    };
    info!(
        files = report.per_file_issues.len(),
        issues = report.issue_count(),
        gaps = report.sequence_gaps.len(),
        "validation finished"
    );
    Ok(report)
}
