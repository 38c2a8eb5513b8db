//! Job runner: preconditions, the per-file loop, fallback and bookkeeping.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};
use tempfile::TempDir;
use thiserror::Error;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use super::export::{export, ExportError};
use super::external::{conversion_macro, probe, ToolExit, ToolLocation, ToolRun};
use super::{
    CancelToken, ConversionJob, ConversionOutcome, ConversionResult, EnvironmentalError, ErrorKind,
    FileResult, JobState, JobWarning, Progress, SkipReason, Strategy,
};
use crate::catalog::FormatError;
use crate::index::SnapshotFile;
use crate::snapshot::decode;

/// Run `job` to completion without progress reporting or cancellation.
pub fn convert(job: &mut ConversionJob) -> Result<ConversionResult, EnvironmentalError> {
    run(job, &CancelToken::new(), None::<&mut fn(&Progress)>)
}

/// Run `job`, reporting to `progress` on every poll tick and after every
/// file.  Once preconditions pass this always returns `Ok` with exactly one
/// [`FileResult`] per input file, in input order.
pub fn run<F>(
    job:      &mut ConversionJob,
    cancel:   &CancelToken,
    progress: Option<&mut F>,
) -> Result<ConversionResult, EnvironmentalError>
where
    F: FnMut(&Progress),
{
    let started = Instant::now();
    info!(
        job = %job.id,
        files = job.input_files.len(),
        format = ?job.target_format,
        strategy = ?job.initial_strategy(),
        "conversion job starting"
    );

    let Preflight { tool, scratch, mut warnings } = match preflight(job, cancel) {
        Ok(p) => p,
        Err(e) => {
            error!(job = %job.id, error = %e, "conversion job aborted");
            job.set_state(JobState::Aborted);
            return Err(e);
        }
    };
    job.set_state(JobState::Running);

    let total = job.input_files.len();
    let mut reporter = Reporter::new(progress, &job.output_dir, job.target_format.extension(), total);
    let factor = job.options.budget_slack.max(1.0) * total as f64;
    let mut budget = job.options.expected_per_file.and_then(|d| scaled(d, factor));
    let mut over_budget = false;
    let mut per_file = Vec::with_capacity(total);

    for file in &job.input_files {
        let outcome = if cancel.is_cancelled() {
            ConversionOutcome::Skipped(SkipReason::Cancelled)
        } else {
            let output = job.output_path(file);
            if job.options.skip_existing && is_up_to_date(&output, file) {
                reporter.credit();
                ConversionOutcome::Skipped(SkipReason::AlreadyConverted)
            } else {
                let outcome = convert_file(job, tool.as_ref(), scratch.path(), file, &output, cancel, &mut reporter);
                if budget.is_none() {
                    budget = seed_budget(&outcome, factor);
                }
                outcome
            }
        };
        log_outcome(file, &outcome);
        per_file.push(FileResult { source: file.clone(), outcome });
        reporter.emit(None, None);

        if let Some(budget) = budget.filter(|_| !over_budget) {
            let elapsed = started.elapsed();
            if elapsed > budget {
                warn!(job = %job.id, ?budget, ?elapsed, "conversion job is over its time budget");
                warnings.push(JobWarning::BudgetExceeded { budget, elapsed });
                over_budget = true;
            }
        }
    }

    drop(scratch);
    job.set_state(JobState::Completed);
    let result = ConversionResult {
        job_id: job.id,
        per_file,
        total_elapsed: started.elapsed(),
        warnings,
    };
    info!(job = %job.id, "{}", result.summary());
    Ok(result)
}

fn scaled(d: Duration, factor: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(d.as_secs_f64() * factor).ok()
}

/// Job budget from the first successful conversion.  Failures and skips
/// say nothing about how long a real conversion takes.
fn seed_budget(outcome: &ConversionOutcome, factor: f64) -> Option<Duration> {
    match outcome {
        ConversionOutcome::Success { elapsed, .. } => scaled(*elapsed, factor),
        _ => None,
    }
}

fn is_up_to_date(output: &Path, source: &SnapshotFile) -> bool {
    fs::metadata(output)
        .and_then(|m| m.modified())
        .map(|t| DateTime::<Utc>::from(t) >= source.modified_time)
        .unwrap_or(false)
}

fn log_outcome(file: &SnapshotFile, outcome: &ConversionOutcome) {
    match outcome {
        ConversionOutcome::Success { output, elapsed, strategy } => {
            info!(step = file.step_id, output = %output.display(), ?elapsed, ?strategy, "converted");
        }
        ConversionOutcome::Failed { kind, message } => {
            warn!(step = file.step_id, path = %file.path.display(), ?kind, %message, "conversion failed");
        }
        ConversionOutcome::Skipped(reason) => {
            debug!(step = file.step_id, ?reason, "skipped");
        }
    }
}

// ── Preconditions ────────────────────────────────────────────────────────────

struct Preflight {
    tool:     Option<ToolLocation>,
    /// Job-scoped directory for generated macros, inside the output directory.
    scratch:  TempDir,
    warnings: Vec<JobWarning>,
}

fn preflight(job: &ConversionJob, cancel: &CancelToken) -> Result<Preflight, EnvironmentalError> {
    fs::create_dir_all(&job.output_dir).map_err(|source| EnvironmentalError::OutputDirUnwritable {
        path: job.output_dir.clone(),
        source,
    })?;
    // Creating the scratch directory doubles as the writability check.
    let scratch = tempfile::Builder::new()
        .prefix(".cfdsnap-")
        .tempdir_in(&job.output_dir)
        .map_err(|source| EnvironmentalError::OutputDirUnwritable {
            path: job.output_dir.clone(),
            source,
        })?;

    let mut warnings = Vec::new();
    let mut tool = job.tool.clone().filter(ToolLocation::is_located);
    if tool.is_none() {
        if job.requires_tool() {
            return Err(EnvironmentalError::ToolNotFound {
                path: job.tool.as_ref().map(|t| t.executable.clone()),
            });
        }
        if let Some(configured) = &job.tool {
            warn!(path = %configured.executable.display(), "external tool not found, running without fallback");
        }
    }

    let mut unlaunchable = false;
    if let Some(located) = &tool {
        match probe(located, scratch.path(), job.options.poll_interval, cancel) {
            Ok(None) => debug!(path = %located.executable.display(), "external tool probe passed"),
            Ok(Some(diagnostic)) => {
                warn!(%diagnostic, "external tool probe exited abnormally");
                warnings.push(JobWarning::ToolProbeFailed { diagnostic });
            }
            Err(EnvironmentalError::ToolNotFound { .. }) if !job.requires_tool() => {
                let diagnostic = format!("{} could not be launched", located.executable.display());
                warn!(%diagnostic, "running without fallback");
                warnings.push(JobWarning::ToolProbeFailed { diagnostic });
                unlaunchable = true;
            }
            Err(e) => return Err(e),
        }
    }
    if unlaunchable {
        tool = None;
    }

    Ok(Preflight { tool, scratch, warnings })
}

// ── Progress ─────────────────────────────────────────────────────────────────

struct Reporter<'a, F> {
    callback:   Option<&'a mut F>,
    output_dir: PathBuf,
    extension:  &'static str,
    /// Target files present at job start, with their modification times.
    baseline:   HashMap<PathBuf, Option<SystemTime>>,
    /// Outputs that count as done without appearing (skipped as converted).
    credited:   usize,
    total:      usize,
}

fn target_files(dir: &Path, extension: &str) -> impl Iterator<Item = (PathBuf, Option<SystemTime>)> {
    let extension = extension.to_string();
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .filter(move |e| e.path().extension().map_or(false, |x| x == extension.as_str()))
        .map(|e| {
            let modified = e.metadata().ok().and_then(|m| m.modified().ok());
            (e.into_path(), modified)
        })
}

impl<'a, F: FnMut(&Progress)> Reporter<'a, F> {
    fn new(callback: Option<&'a mut F>, output_dir: &Path, extension: &'static str, total: usize) -> Self {
        let baseline = if callback.is_some() {
            target_files(output_dir, extension).collect()
        } else {
            HashMap::new()
        };
        Self {
            callback,
            output_dir: output_dir.to_path_buf(),
            extension,
            baseline,
            credited: 0,
            total,
        }
    }

    fn credit(&mut self) {
        self.credited += 1;
    }

    fn outputs_seen(&self) -> usize {
        let fresh = target_files(&self.output_dir, self.extension)
            .filter(|(path, modified)| match self.baseline.get(path) {
                None         => true,
                Some(before) => before != modified,
            })
            .count();
        (fresh + self.credited).min(self.total)
    }

    fn emit(&mut self, current: Option<&Path>, tool_line: Option<&str>) {
        if self.callback.is_none() {
            return;
        }
        let progress = Progress {
            outputs_seen: self.outputs_seen(),
            total:        self.total,
            current:      current.map(Path::to_path_buf),
            tool_line:    tool_line.map(str::to_string),
        };
        if let Some(callback) = self.callback.as_mut() {
            callback(&progress);
        }
    }
}

// ── Per-file conversion ──────────────────────────────────────────────────────

#[derive(Error, Debug)]
enum InProcessError {
    #[error("decode failed: {0}")]
    Decode(#[from] FormatError),
    #[error("export failed: {0}")]
    Export(#[from] ExportError),
}

impl InProcessError {
    fn kind(&self) -> ErrorKind {
        match self {
            InProcessError::Decode(_) => ErrorKind::Decode,
            InProcessError::Export(_) => ErrorKind::Export,
        }
    }
}

/// Decode and export one file.  The decode is dropped on return, before the
/// next file is touched.
fn convert_in_process(file: &SnapshotFile, job: &ConversionJob, output: &Path) -> Result<(), InProcessError> {
    let snapshot = decode(&file.path)?;
    export(&snapshot, job.target_format, output)?;
    Ok(())
}

type Failure = (ErrorKind, String);

fn convert_external<F: FnMut(&Progress)>(
    tool:     &ToolLocation,
    scratch:  &Path,
    file:     &SnapshotFile,
    output:   &Path,
    job:      &ConversionJob,
    cancel:   &CancelToken,
    reporter: &mut Reporter<'_, F>,
) -> Result<(), Failure> {
    let script = scratch.join(format!("{}.mcr", Uuid::new_v4()));
    fs::write(&script, conversion_macro(&file.path, output, job.target_format))
        .map_err(|e| (ErrorKind::Io, format!("cannot write macro {}: {e}", script.display())))?;

    let run = ToolRun::spawn(tool, &script)
        .map_err(|e| (ErrorKind::ExternalTool, format!("cannot launch {}: {e}", tool.executable.display())));
    let exit = run.and_then(|run| {
        run.wait(job.options.poll_interval, cancel, |line| reporter.emit(Some(&file.path), line))
            .map_err(|e| (ErrorKind::Io, format!("lost track of the tool process: {e}")))
    });
    let _ = fs::remove_file(&script);

    match exit? {
        ToolExit::Cancelled { .. } => {
            let _ = fs::remove_file(output);
            Err((ErrorKind::Cancelled, "cancelled while the external tool was running".to_string()))
        }
        exit @ ToolExit::Finished { license_failure: true, .. } => Err((ErrorKind::License, exit.diagnostic())),
        ToolExit::Finished { success: true, .. } if output.is_file() => Ok(()),
        ToolExit::Finished { success: true, .. } => Err((
            ErrorKind::ExternalTool,
            format!("tool exited cleanly but did not write {}", output.display()),
        )),
        exit @ ToolExit::Finished { .. } => {
            let code = match &exit {
                ToolExit::Finished { code: Some(code), .. } => code.to_string(),
                _ => "a signal".to_string(),
            };
            Err((ErrorKind::ExternalTool, format!("tool exited with {code}: {}", exit.diagnostic())))
        }
    }
}

fn convert_file<F: FnMut(&Progress)>(
    job:      &ConversionJob,
    tool:     Option<&ToolLocation>,
    scratch:  &Path,
    file:     &SnapshotFile,
    output:   &Path,
    cancel:   &CancelToken,
    reporter: &mut Reporter<'_, F>,
) -> ConversionOutcome {
    let started = Instant::now();
    let success = |strategy| ConversionOutcome::Success {
        output:  output.to_path_buf(),
        elapsed: started.elapsed(),
        strategy,
    };

    match job.initial_strategy() {
        Strategy::InProcess => {
            let err = match convert_in_process(file, job, output) {
                Ok(()) => return success(Strategy::InProcess),
                Err(e) => e,
            };
            let Some(tool) = tool else {
                return ConversionOutcome::Failed {
                    kind:    err.kind(),
                    message: format!("{err} (no external tool available for fallback)"),
                };
            };
            warn!(step = file.step_id, error = %err, "in-process conversion failed, retrying with external tool");
            match convert_external(tool, scratch, file, output, job, cancel, reporter) {
                Ok(()) => success(Strategy::ExternalTool),
                Err((kind, message)) => ConversionOutcome::Failed {
                    kind,
                    message: format!("in-process: {err}; external tool: {message}"),
                },
            }
        }
        Strategy::ExternalTool => match tool {
            Some(tool) => match convert_external(tool, scratch, file, output, job, cancel, reporter) {
                Ok(()) => success(Strategy::ExternalTool),
                Err((kind, message)) => ConversionOutcome::Failed { kind, message },
            },
            None => ConversionOutcome::Failed {
                kind:    ErrorKind::ExternalTool,
                message: "no external tool located".to_string(),
            },
        },
    }
}
