//! Batch conversion of snapshot files into interchange formats.
//!
//! A [`ConversionJob`] lists the input files, the target format and the
//! output directory.  [`convert`] runs it to completion and returns one
//! [`FileResult`] per input file, in input order, however many of them fail.
//!
//! # Strategies
//!
//! | Strategy | Path |
//! |----------|------|
//! | `InProcess` | decode here, re-encode with [`export`] |
//! | `ExternalTool` | generate a macro, run the licensed batch tool ([`external`]) |
//!
//! The strategy is chosen per file.  An in-process failure is retried once
//! through the external tool; an external failure is final.
//!
//! # Job-level failures
//!
//! Only environmental preconditions abort a job: an unwritable output
//! directory, a missing tool when the tool is required, or a licensing
//! failure on the tool's first invocation.  These surface as
//! [`EnvironmentalError`] before any per-file work starts.

pub mod export;
pub mod external;
mod orchestrator;

pub use external::ToolLocation;
pub use orchestrator::{convert, run};

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::index::SnapshotFile;

/// Default bound on one progress-poll wait.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Budget multiplier over the naive `per-file × count` estimate.
pub const DEFAULT_BUDGET_SLACK: f64 = 1.5;

// ── Formats and strategies ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetFormat {
    Hdf5,
    Vtk,
    Ascii,
}

impl TargetFormat {
    pub fn extension(self) -> &'static str {
        match self {
            TargetFormat::Hdf5  => "h5",
            TargetFormat::Vtk   => "vtk",
            TargetFormat::Ascii => "dat",
        }
    }

    /// Whether this crate can write the format without the external tool.
    pub fn has_in_process_path(self) -> bool {
        matches!(self, TargetFormat::Vtk | TargetFormat::Ascii)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "hdf5" | "h5"           => Some(TargetFormat::Hdf5),
            "vtk"                   => Some(TargetFormat::Vtk),
            "ascii" | "dat" | "txt" => Some(TargetFormat::Ascii),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Strategy {
    InProcess,
    ExternalTool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Aborted,
}

// ── Job ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ConversionOptions {
    /// Upper bound on each wait between progress polls.
    pub poll_interval:     Duration,
    /// Historical per-file time, seeding the job budget.
    pub expected_per_file: Option<Duration>,
    pub budget_slack:      f64,
    /// Skip files whose output already exists and is newer than the source.
    pub skip_existing:     bool,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            poll_interval:     DEFAULT_POLL_INTERVAL,
            expected_per_file: None,
            budget_slack:      DEFAULT_BUDGET_SLACK,
            skip_existing:     false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub id:            Uuid,
    pub input_files:   Vec<SnapshotFile>,
    pub target_format: TargetFormat,
    pub output_dir:    PathBuf,
    /// Preferred strategy; `InProcess` degrades to `ExternalTool` for
    /// formats without an in-process writer.
    pub strategy:      Strategy,
    pub tool:          Option<ToolLocation>,
    pub options:       ConversionOptions,
    state:             JobState,
}

impl ConversionJob {
    pub fn new(
        input_files:   Vec<SnapshotFile>,
        target_format: TargetFormat,
        output_dir:    impl Into<PathBuf>,
        strategy:      Strategy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            input_files,
            target_format,
            output_dir: output_dir.into(),
            strategy,
            tool: None,
            options: ConversionOptions::default(),
            state: JobState::Pending,
        }
    }

    pub fn with_tool(mut self, tool: ToolLocation) -> Self {
        self.tool = Some(tool);
        self
    }

    pub fn with_options(mut self, options: ConversionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: JobState) {
        self.state = state;
    }

    /// Strategy the first attempt at a file uses.
    pub fn initial_strategy(&self) -> Strategy {
        match self.strategy {
            Strategy::InProcess if self.target_format.has_in_process_path() => Strategy::InProcess,
            _ => Strategy::ExternalTool,
        }
    }

    /// True when no file can be converted without the external tool.
    pub fn requires_tool(&self) -> bool {
        self.initial_strategy() == Strategy::ExternalTool
    }

    /// Output path for `file`: its stem plus the target extension.
    pub fn output_path(&self, file: &SnapshotFile) -> PathBuf {
        self.output_dir.join(format!("{}.{}", file.stem(), self.target_format.extension()))
    }
}

// ── Results ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    Decode,
    Export,
    ExternalTool,
    License,
    Cancelled,
    Io,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SkipReason {
    Cancelled,
    AlreadyConverted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ConversionOutcome {
    Success { output: PathBuf, elapsed: Duration, strategy: Strategy },
    Failed { kind: ErrorKind, message: String },
    Skipped(SkipReason),
}

impl ConversionOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, ConversionOutcome::Success { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, ConversionOutcome::Failed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileResult {
    pub source:  SnapshotFile,
    pub outcome: ConversionOutcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobWarning {
    BudgetExceeded { budget: Duration, elapsed: Duration },
    ToolProbeFailed { diagnostic: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversionResult {
    pub job_id:        Uuid,
    pub per_file:      Vec<FileResult>,
    pub total_elapsed: Duration,
    pub warnings:      Vec<JobWarning>,
}

impl ConversionResult {
    pub fn succeeded(&self) -> usize {
        self.per_file.iter().filter(|r| r.outcome.is_success()).count()
    }

    pub fn failed(&self) -> usize {
        self.per_file.iter().filter(|r| r.outcome.is_failed()).count()
    }

    /// Sources to feed into a follow-up job that retries only the failures.
    pub fn failed_sources(&self) -> Vec<SnapshotFile> {
        self.per_file
            .iter()
            .filter(|r| r.outcome.is_failed())
            .map(|r| r.source.clone())
            .collect()
    }

    pub fn summary(&self) -> String {
        format!(
            "{} file(s): {} converted, {} failed, {} skipped in {:.1}s",
            self.per_file.len(),
            self.succeeded(),
            self.failed(),
            self.per_file.len() - self.succeeded() - self.failed(),
            self.total_elapsed.as_secs_f64(),
        )
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

/// Job-level precondition failures.  Raised before any per-file work.
#[derive(Error, Debug)]
pub enum EnvironmentalError {
    #[error("External tool not found: {}", describe_tool_path(.path))]
    ToolNotFound { path: Option<PathBuf> },
    #[error("External tool license unavailable: {diagnostic}")]
    LicenseUnavailable { diagnostic: String },
    #[error("Output directory {path} is not writable: {source}")]
    OutputDirUnwritable { path: PathBuf, source: io::Error },
}

fn describe_tool_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(p) => p.display().to_string(),
        None    => "no tool configured".to_string(),
    }
}

// ── Cancellation and progress ────────────────────────────────────────────────

/// Cooperative cancellation flag shared between the caller and a running job.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Snapshot of job progress.  `outputs_seen` counts target files that
/// appeared in the output directory since the job started and is the
/// authoritative signal; `tool_line` is whatever the tool printed last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    pub outputs_seen: usize,
    pub total:        usize,
    pub current:      Option<PathBuf>,
    pub tool_line:    Option<String>,
}

impl Progress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 { return 1.0; }
        (self.outputs_seen as f64 / self.total as f64).min(1.0)
    }
}
