//! Case configuration (JSON).
//!
//! ```json
//! {
//!   "problem": "riser",
//!   "directory": "/runs/riser",
//!   "extension": "plt",
//!   "step_frequency": 50,
//!   "tool": { "executable": "/opt/tec/bin/tec360", "wrapper": ["xvfb-run", "-a"] },
//!   "conversion": { "format": "Hdf5", "skip_existing": true }
//! }
//! ```
//!
//! Everything except `problem` and `directory` has a default.  The core
//! never derives these values itself; they always come from here or from
//! the caller.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::convert::{ConversionJob, ConversionOptions, Strategy, TargetFormat, ToolLocation, DEFAULT_BUDGET_SLACK};
use crate::index::{discover_with, IndexError, IndexOptions, SnapshotFile, SnapshotIndex};
use crate::validate::ValidateOptions;

/// Output subdirectory used when `conversion.output_dir` is not set.
pub const DEFAULT_OUTPUT_SUBDIR: &str = "converted";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read config {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("Malformed config: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionSettings {
    pub output_dir:                Option<PathBuf>,
    pub format:                    TargetFormat,
    pub strategy:                  Strategy,
    pub poll_interval_ms:          u64,
    /// Historical seconds per file, seeding the job budget.
    pub expected_seconds_per_file: Option<f64>,
    pub budget_slack:              f64,
    pub skip_existing:             bool,
}

impl Default for ConversionSettings {
    fn default() -> Self {
        Self {
            output_dir:                None,
            format:                    TargetFormat::Vtk,
            strategy:                  Strategy::InProcess,
            poll_interval_ms:          500,
            expected_seconds_per_file: None,
            budget_slack:              DEFAULT_BUDGET_SLACK,
            skip_existing:             false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseConfig {
    pub problem:        String,
    pub directory:      PathBuf,
    #[serde(default)]
    pub extension:      Option<String>,
    /// Output frequency in steps; inferred from the files when absent.
    #[serde(default)]
    pub step_frequency: Option<u64>,
    #[serde(default)]
    pub tool:           Option<ToolLocation>,
    #[serde(default)]
    pub conversion:     ConversionSettings,
}

impl CaseConfig {
    pub fn new(problem: impl Into<String>, directory: impl Into<PathBuf>) -> Self {
        Self {
            problem:        problem.into(),
            directory:      directory.into(),
            extension:      None,
            step_frequency: None,
            tool:           None,
            conversion:     ConversionSettings::default(),
        }
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: CaseConfig = serde_json::from_str(text)?;
        config.check()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_owned(), source })?;
        Self::from_json(&text)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn check(&self) -> Result<(), ConfigError> {
        if self.problem.trim().is_empty() {
            return Err(ConfigError::Invalid("problem name is empty".into()));
        }
        if self.step_frequency == Some(0) {
            return Err(ConfigError::Invalid("step_frequency must be positive".into()));
        }
        let c = &self.conversion;
        if c.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be positive".into()));
        }
        if !c.budget_slack.is_finite() || c.budget_slack < 1.0 {
            return Err(ConfigError::Invalid(format!("budget_slack {} is below 1.0", c.budget_slack)));
        }
        if let Some(s) = c.expected_seconds_per_file {
            if !s.is_finite() || s < 0.0 {
                return Err(ConfigError::Invalid(format!("expected_seconds_per_file {s} is not a duration")));
            }
        }
        Ok(())
    }

    pub fn index_options(&self) -> IndexOptions {
        IndexOptions { extension: self.extension.clone() }
    }

    pub fn validate_options(&self) -> ValidateOptions {
        ValidateOptions { expected_stride: self.step_frequency }
    }

    pub fn conversion_options(&self) -> ConversionOptions {
        let c = &self.conversion;
        ConversionOptions {
            poll_interval:     Duration::from_millis(c.poll_interval_ms),
            expected_per_file: c.expected_seconds_per_file.and_then(|s| Duration::try_from_secs_f64(s).ok()),
            budget_slack:      c.budget_slack,
            skip_existing:     c.skip_existing,
        }
    }

    pub fn output_dir(&self) -> PathBuf {
        self.conversion
            .output_dir
            .clone()
            .unwrap_or_else(|| self.directory.join(DEFAULT_OUTPUT_SUBDIR))
    }

    /// Index the case directory with the configured extension filter.
    pub fn index(&self) -> Result<SnapshotIndex, IndexError> {
        discover_with(&self.directory, &self.problem, &self.index_options())
    }

    /// A conversion job over `files` with every configured setting applied.
    pub fn job(&self, files: Vec<SnapshotFile>) -> ConversionJob {
        let job = ConversionJob::new(files, self.conversion.format, self.output_dir(), self.conversion.strategy)
            .with_options(self.conversion_options());
        match &self.tool {
            Some(tool) => job.with_tool(tool.clone()),
            None       => job,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_takes_defaults() {
        let cfg = CaseConfig::from_json(r#"{ "problem": "riser", "directory": "/runs/riser" }"#).unwrap();
        assert_eq!(cfg.conversion, ConversionSettings::default());
        assert_eq!(cfg.output_dir(), PathBuf::from("/runs/riser/converted"));
        assert_eq!(cfg.conversion_options().poll_interval, Duration::from_millis(500));
        assert!(cfg.tool.is_none());
    }

    #[test]
    fn full_config() {
        let cfg = CaseConfig::from_json(
            r#"{
                "problem": "riser",
                "directory": "/runs/riser",
                "extension": "plt",
                "step_frequency": 50,
                "tool": { "executable": "/opt/tec/bin/tec360", "wrapper": ["xvfb-run", "-a"] },
                "conversion": { "format": "Hdf5", "expected_seconds_per_file": 12.5, "skip_existing": true }
            }"#,
        )
        .unwrap();
        let tool = cfg.tool.clone().unwrap();
        assert_eq!(tool.wrapper, vec!["xvfb-run", "-a"]);
        assert_eq!(tool.args, vec!["-b", "-p", "{script}"]);
        assert_eq!(cfg.validate_options().expected_stride, Some(50));

        let job = cfg.job(vec![]);
        assert_eq!(job.target_format, TargetFormat::Hdf5);
        assert_eq!(job.options.expected_per_file, Some(Duration::from_millis(12_500)));
        assert!(job.options.skip_existing);
        assert!(job.tool.is_some());
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(
            CaseConfig::from_json(r#"{ "problem": "", "directory": "/x" }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(
            CaseConfig::from_json(r#"{ "problem": "a", "directory": "/x", "step_frequency": 0 }"#),
            Err(ConfigError::Invalid(_))
        ));
        assert!(matches!(CaseConfig::from_json("{"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn json_round_trip() {
        let mut cfg = CaseConfig::new("jet", "/runs/jet");
        cfg.tool = Some(ToolLocation::new("/usr/bin/tool"));
        let back = CaseConfig::from_json(&cfg.to_json().unwrap()).unwrap();
        assert_eq!(back, cfg);
    }
}
