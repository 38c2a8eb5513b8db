//! Extraction engine: tabular rows from one zone of one snapshot.
//!
//! A row is one mesh point: its coordinates followed by the requested
//! variables.  Requests are checked in full before any row is produced, so a
//! bad variable or zone name yields an error and never a partial table.
//!
//! # Sources
//!
//! | Source | Behaviour |
//! |--------|-----------|
//! | `Decoded` | rows from an already decoded snapshot |
//! | `File` | decoded on demand; the decode is dropped before returning |
//! | `Series` | picks a step from an index (latest when no step is given) |

use serde::{Deserialize, Serialize};
use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;
use tracing::debug;

use crate::catalog::FormatError;
use crate::index::SnapshotIndex;
use crate::snapshot::{decode, SnapshotDecode};

const AXIS_NAMES: [&str; 3] = ["X", "Y", "Z"];

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("Unknown variable(s) {missing:?}; catalog has {available:?}")]
    UnknownVariable { missing: Vec<String>, available: Vec<String> },
    #[error("Unknown zone '{requested}'; available zones: {available:?}")]
    UnknownZone { requested: String, available: Vec<String> },
    #[error("Timestep {} is not indexed (indexed range {})", describe_step(.requested), describe_range(.first, .last))]
    OutOfRangeTimestep { requested: Option<u64>, first: Option<u64>, last: Option<u64> },
    #[error("Zone '{zone}' has no coordinate variables to filter on")]
    MissingCoordinates { zone: String },
    #[error("Decode failed: {0}")]
    Format(#[from] FormatError),
}

fn describe_step(step: &Option<u64>) -> String {
    step.map_or_else(|| "(latest)".to_string(), |s| s.to_string())
}

fn describe_range(first: &Option<u64>, last: &Option<u64>) -> String {
    match (first, last) {
        (Some(f), Some(l)) => format!("{f}..={l}"),
        _                  => "empty".to_string(),
    }
}

// ── Request ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub enum ExtractSource<'a> {
    Decoded(&'a SnapshotDecode),
    File(&'a Path),
    Series(&'a SnapshotIndex),
}

/// Axis-aligned box, bounds inclusive.  Axes absent from the catalog are
/// not constrained.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: [f64; 3],
    pub max: [f64; 3],
}

impl BoundingBox {
    /// Corners in any order.
    pub fn new(a: [f64; 3], b: [f64; 3]) -> Self {
        let mut min = [0.0; 3];
        let mut max = [0.0; 3];
        for axis in 0..3 {
            min[axis] = a[axis].min(b[axis]);
            max[axis] = a[axis].max(b[axis]);
        }
        Self { min, max }
    }

    fn contains(&self, point: &[Option<f64>; 3]) -> bool {
        point.iter().enumerate().all(|(axis, v)| match v {
            Some(v) => *v >= self.min[axis] && *v <= self.max[axis],
            None    => true,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExtractRequest {
    pub zone:      String,
    /// Empty selects every catalog variable in catalog order.
    pub variables: Vec<String>,
    /// Only consulted for `ExtractSource::Series`.
    pub timestep:  Option<u64>,
    pub bbox:      Option<BoundingBox>,
}

impl ExtractRequest {
    pub fn new(zone: impl Into<String>) -> Self {
        Self { zone: zone.into(), ..Default::default() }
    }

    pub fn variables<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.variables = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn timestep(mut self, step: u64) -> Self {
        self.timestep = Some(step);
        self
    }

    pub fn bbox(mut self, bbox: BoundingBox) -> Self {
        self.bbox = Some(bbox);
        self
    }
}

// ── Result ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractedRow {
    /// Zero-based point index within the zone.
    pub point:       usize,
    pub coordinates: Vec<f64>,
    pub values:      Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Extraction {
    pub zone:             String,
    pub step:             Option<u64>,
    pub solution_time:    Option<f64>,
    pub coordinate_names: Vec<String>,
    pub variable_names:   Vec<String>,
    pub rows:             Vec<ExtractedRow>,
}

impl Extraction {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column of `variable`, in row order.
    pub fn column(&self, variable: &str) -> Option<Vec<f64>> {
        let idx = self.variable_names.iter().position(|n| n == variable)?;
        Some(self.rows.iter().map(|r| r.values[idx]).collect())
    }

    /// Header line then one line per row, fields joined by `separator`.
    pub fn write_delimited<W: Write>(&self, mut writer: W, separator: &str) -> io::Result<()> {
        let header: Vec<&str> = self
            .coordinate_names
            .iter()
            .chain(&self.variable_names)
            .map(String::as_str)
            .collect();
        writeln!(writer, "{}", header.join(separator))?;
        for row in &self.rows {
            let fields: Vec<String> = row
                .coordinates
                .iter()
                .chain(&row.values)
                .map(|v| v.to_string())
                .collect();
            writeln!(writer, "{}", fields.join(separator))?;
        }
        writer.flush()
    }
}

// ── extract ──────────────────────────────────────────────────────────────────

pub fn extract(source: ExtractSource<'_>, request: &ExtractRequest) -> Result<Extraction, ExtractionError> {
    match source {
        ExtractSource::Decoded(snapshot) => extract_from(snapshot, request, None),
        ExtractSource::File(path) => {
            let snapshot = decode(path)?;
            extract_from(&snapshot, request, None)
        }
        ExtractSource::Series(index) => {
            let out_of_range = || ExtractionError::OutOfRangeTimestep {
                requested: request.timestep,
                first:     index.first().map(|f| f.step_id),
                last:      index.last().map(|f| f.step_id),
            };
            let file = match request.timestep {
                Some(step) => index.get(step),
                None       => index.last(),
            }
            .ok_or_else(out_of_range)?;
            let snapshot = decode(&file.path)?;
            extract_from(&snapshot, request, Some(file.step_id))
        }
    }
}

fn extract_from(
    snapshot: &SnapshotDecode,
    request:  &ExtractRequest,
    step:     Option<u64>,
) -> Result<Extraction, ExtractionError> {
    let catalog = &snapshot.catalog;

    let variable_names: Vec<String> = if request.variables.is_empty() {
        catalog.names().to_vec()
    } else {
        request.variables.clone()
    };
    let missing: Vec<String> = variable_names
        .iter()
        .filter(|n| !catalog.contains(n))
        .cloned()
        .collect();
    if !missing.is_empty() {
        return Err(ExtractionError::UnknownVariable { missing, available: catalog.names().to_vec() });
    }
    let columns: Vec<usize> = variable_names
        .iter()
        .filter_map(|n| catalog.position(n))
        .collect();

    let zone = snapshot.zone(&request.zone).ok_or_else(|| ExtractionError::UnknownZone {
        requested: request.zone.clone(),
        available: snapshot.zone_names(),
    })?;
    if zone.values.len() != catalog.len() {
        return Err(FormatError::CatalogMismatch {
            zone:      zone.name.clone(),
            arrays:    zone.values.len(),
            variables: catalog.len(),
        }
        .into());
    }
    zone.check()?;

    let axes = catalog.coordinate_axes();
    if request.bbox.is_some() && axes.iter().all(Option::is_none) {
        return Err(ExtractionError::MissingCoordinates { zone: zone.name.clone() });
    }
    let coordinate_names: Vec<String> = axes
        .iter()
        .zip(AXIS_NAMES)
        .filter(|(axis, _)| axis.is_some())
        .map(|(_, name)| name.to_string())
        .collect();

    let mut rows = Vec::new();
    for point in 0..zone.point_count() {
        let position = axes.map(|axis| axis.and_then(|v| zone.values[v].get(point)));
        if let Some(bbox) = &request.bbox {
            if !bbox.contains(&position) {
                continue;
            }
        }
        rows.push(ExtractedRow {
            point,
            coordinates: position.iter().flatten().copied().collect(),
            values:      columns.iter().filter_map(|&v| zone.values[v].get(point)).collect(),
        });
    }

    debug!(
        zone = %zone.name,
        step = ?step,
        rows = rows.len(),
        of = zone.point_count(),
        "extracted rows"
    );
    Ok(Extraction {
        zone: zone.name.clone(),
        step,
        solution_time: zone.solution_time.or(snapshot.solution_time),
        coordinate_names,
        variable_names,
        rows,
    })
}
