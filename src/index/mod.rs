//! Snapshot index: the ordered list of timestep files for one problem.
//!
//! Files follow `<problem>.<step>.<ext>`, e.g. `riser.150.plt`.  The scan is
//! purely filesystem-driven; nothing is decoded here.  Names that carry the
//! problem prefix but no usable step token are not dropped silently: they
//! land in [`SnapshotIndex::skipped`] with a reason.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("Cannot scan {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Not a directory: {0}")]
    NotADirectory(PathBuf),
}

/// One indexed timestep file.  Immutable once indexed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SnapshotFile {
    pub step_id:       u64,
    pub path:          PathBuf,
    pub byte_size:     u64,
    pub modified_time: DateTime<Utc>,
}

impl SnapshotFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    /// File name without its final extension (`riser.150` for `riser.150.plt`).
    pub fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SkipReason {
    /// Step token is not a non-negative integer.
    MalformedStep { token: String },
    /// `<problem>.<step>` with nothing after the step.
    MissingExtension,
    /// Another file already claimed this step.
    DuplicateStep { step: u64, kept: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedEntry {
    pub path:   PathBuf,
    pub reason: SkipReason,
}

/// Scan options supplied by case configuration.
#[derive(Debug, Clone, Default)]
pub struct IndexOptions {
    /// Only index this extension (no leading dot).  `None` accepts any.
    pub extension: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotIndex {
    pub directory: PathBuf,
    pub problem:   String,
    /// Sorted by ascending step, one file per step.
    pub files:     Vec<SnapshotFile>,
    pub skipped:   Vec<SkippedEntry>,
}

impl SnapshotIndex {
    pub fn len(&self) -> usize { self.files.len() }
    pub fn is_empty(&self) -> bool { self.files.is_empty() }
    pub fn iter(&self) -> std::slice::Iter<'_, SnapshotFile> { self.files.iter() }
    pub fn skipped_count(&self) -> usize { self.skipped.len() }

    pub fn steps(&self) -> Vec<u64> {
        self.files.iter().map(|f| f.step_id).collect()
    }

    pub fn get(&self, step: u64) -> Option<&SnapshotFile> {
        self.files
            .binary_search_by_key(&step, |f| f.step_id)
            .ok()
            .map(|i| &self.files[i])
    }

    pub fn first(&self) -> Option<&SnapshotFile> { self.files.first() }
    pub fn last(&self) -> Option<&SnapshotFile> { self.files.last() }

    /// Files with `start <= step <= end`, as a new index over the same
    /// directory.  Duplicate-step records inside the range are carried over.
    pub fn filter_range(&self, start: u64, end: u64) -> SnapshotIndex {
        let in_range = |step: u64| step >= start && step <= end;
        SnapshotIndex {
            directory: self.directory.clone(),
            problem:   self.problem.clone(),
            files:     self.files.iter().filter(|f| in_range(f.step_id)).cloned().collect(),
            skipped:   self
                .skipped
                .iter()
                .filter(|s| match &s.reason {
                    SkipReason::DuplicateStep { step, .. } => in_range(*step),
                    _ => false,
                })
                .cloned()
                .collect(),
        }
    }

    /// Paths shadowed by the file kept for `step`.
    pub fn duplicates_of(&self, step: u64) -> Vec<PathBuf> {
        self.skipped
            .iter()
            .filter_map(|s| match &s.reason {
                SkipReason::DuplicateStep { step: st, .. } if *st == step => Some(s.path.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Split `name` into `(step token, extension)` when it starts with
/// `<problem>.`.  `None` means the file belongs to another problem.
fn split_name<'a>(name: &'a str, problem: &str) -> Option<(&'a str, Option<&'a str>)> {
    let rest = name.strip_prefix(problem)?.strip_prefix('.')?;
    Some(match rest.split_once('.') {
        Some((token, ext)) => (token, Some(ext)),
        None => (rest, None),
    })
}

fn parse_step(token: &str) -> Option<u64> {
    if token.is_empty() || !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}

/// Scan `directory` for snapshots of `problem`, accepting any extension.
pub fn discover(directory: impl AsRef<Path>, problem: &str) -> Result<SnapshotIndex, IndexError> {
    discover_with(directory, problem, &IndexOptions::default())
}

pub fn discover_with(
    directory: impl AsRef<Path>,
    problem:   &str,
    options:   &IndexOptions,
) -> Result<SnapshotIndex, IndexError> {
    let directory = directory.as_ref();
    let meta = std::fs::metadata(directory)
        .map_err(|source| IndexError::Io { path: directory.to_owned(), source })?;
    if !meta.is_dir() {
        return Err(IndexError::NotADirectory(directory.to_owned()));
    }

    let mut by_step: BTreeMap<u64, SnapshotFile> = BTreeMap::new();
    let mut skipped = Vec::new();

    // Sorted by name so the kept file of a duplicated step is deterministic.
    for entry in WalkDir::new(directory)
        .min_depth(1)
        .max_depth(1)
        .follow_links(true)
        .sort_by_file_name()
    {
        let entry = entry.map_err(|e| {
            let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| directory.to_owned());
            let source = e.into_io_error().unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "walk error"));
            IndexError::Io { path, source }
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some((token, ext)) = split_name(&name, problem) else {
            continue;
        };
        let path = entry.path().to_path_buf();

        let Some(ext) = ext else {
            skipped.push(SkippedEntry { path, reason: SkipReason::MissingExtension });
            continue;
        };
        if let Some(wanted) = &options.extension {
            if ext != wanted {
                continue;
            }
        }
        let Some(step_id) = parse_step(token) else {
            skipped.push(SkippedEntry {
                path,
                reason: SkipReason::MalformedStep { token: token.to_string() },
            });
            continue;
        };

        if let Some(kept) = by_step.get(&step_id) {
            skipped.push(SkippedEntry {
                path,
                reason: SkipReason::DuplicateStep { step: step_id, kept: kept.path.clone() },
            });
            continue;
        }

        let meta = entry
            .metadata()
            .map_err(|e| IndexError::Io {
                path:   path.clone(),
                source: e.into_io_error().unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "metadata")),
            })?;
        let modified_time = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .map_err(|source| IndexError::Io { path: path.clone(), source })?;

        by_step.insert(step_id, SnapshotFile {
            step_id,
            path,
            byte_size: meta.len(),
            modified_time,
        });
    }

    for s in &skipped {
        warn!(path = %s.path.display(), reason = ?s.reason, "snapshot file skipped");
    }
    let files: Vec<SnapshotFile> = by_step.into_values().collect();
    info!(
        directory = %directory.display(),
        problem,
        files = files.len(),
        skipped = skipped.len(),
        "snapshot index built"
    );
    debug!(steps = ?files.iter().map(|f| f.step_id).collect::<Vec<_>>(), "indexed steps");

    Ok(SnapshotIndex {
        directory: directory.to_owned(),
        problem:   problem.to_string(),
        files,
        skipped,
    })
}
