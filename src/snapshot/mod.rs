//! Whole-file decode and re-encode.
//!
//! # Reader
//! [`decode`] opens one snapshot, runs the catalog decoder, then reads zone
//! records until the declared count is exhausted, the end marker is reached,
//! or (undeclared count only) the stream ends cleanly.  Zones of unknown
//! kind are stepped over and listed in [`SnapshotDecode::skipped_zones`].
//!
//! The returned [`SnapshotDecode`] owns every numeric array of the file and
//! can be hundreds of MB.  Keep it in the narrowest scope that needs it; it
//! is released the moment it is dropped.
//!
//! # Writer
//! [`SnapshotWriter`] encodes a decode back to the same layout, block- or
//! point-major.  Arrays are written in the precision they were read in, so a
//! decode → encode → decode cycle reproduces them bit-for-bit.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use tracing::{debug, warn};

use crate::catalog::{CatalogHeader, FormatError, VariableCatalog, CURRENT_VERSION};
use crate::cursor::ByteCursor;
use crate::zone::{read_zone_record, write_end_marker, DataLayout, UnsupportedZone, ZoneDescriptor, ZoneRecord};

/// Read buffer for full decodes.
const DECODE_BUFFER: usize = 1024 * 1024;

// ── SnapshotDecode ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotDecode {
    pub version:       u16,
    pub title:         String,
    pub catalog:       VariableCatalog,
    pub zones:         Vec<ZoneDescriptor>,
    /// First solution time declared by any zone.
    pub solution_time: Option<f64>,
    pub skipped_zones: Vec<UnsupportedZone>,
}

impl SnapshotDecode {
    pub fn new(title: impl Into<String>, catalog: VariableCatalog, zones: Vec<ZoneDescriptor>) -> Self {
        let solution_time = zones.iter().find_map(|z| z.solution_time);
        Self {
            version: CURRENT_VERSION,
            title: title.into(),
            catalog,
            zones,
            solution_time,
            skipped_zones: Vec::new(),
        }
    }

    pub fn zone(&self, name: &str) -> Option<&ZoneDescriptor> {
        self.zones.iter().find(|z| z.name == name)
    }

    pub fn zone_names(&self) -> Vec<String> {
        self.zones.iter().map(|z| z.name.clone()).collect()
    }

    /// Check that every zone holds one array per catalog variable and
    /// satisfies its own extent, precision and connectivity invariants.
    /// Decodes always pass; hand-built snapshots may not.
    pub fn check(&self) -> Result<(), FormatError> {
        let variables = self.catalog.len();
        for zone in &self.zones {
            if zone.values.len() != variables {
                return Err(FormatError::CatalogMismatch {
                    zone:   zone.name.clone(),
                    arrays: zone.values.len(),
                    variables,
                });
            }
            zone.check()?;
        }
        Ok(())
    }

    /// Total number of numeric values held in memory.
    pub fn value_count(&self) -> usize {
        self.zones.iter().map(|z| z.values.iter().map(|v| v.len()).sum::<usize>()).sum()
    }
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Decode a complete snapshot from `reader`, positioned at the file start.
pub fn decode_reader<R: Read>(reader: R) -> Result<SnapshotDecode, FormatError> {
    decode_cursor(ByteCursor::new(reader))
}

fn decode_cursor<R: Read>(mut cur: ByteCursor<R>) -> Result<SnapshotDecode, FormatError> {
    let header = CatalogHeader::read_from(&mut cur)?;
    let nvars = header.variables.len();

    let mut zones = Vec::new();
    let mut skipped_zones = Vec::new();
    let mut remaining = header.zone_count;

    loop {
        if remaining == Some(0) {
            break;
        }
        let record = match read_zone_record(&mut cur, nvars, remaining.is_none())? {
            Some(record) => record,
            None => break,
        };
        match record {
            ZoneRecord::Zone(zone) => {
                debug!(zone = %zone.name, kind = ?zone.kind, points = zone.point_count(), "decoded zone");
                zones.push(zone);
            }
            ZoneRecord::Unsupported(skipped) => {
                warn!(zone = %skipped.name, code = skipped.code, offset = skipped.offset,
                      "skipping zone of unsupported kind");
                skipped_zones.push(skipped);
            }
        }
        if let Some(n) = remaining.as_mut() {
            *n -= 1;
        }
    }

    let solution_time = zones.iter().find_map(|z| z.solution_time);
    Ok(SnapshotDecode {
        version: header.version,
        title: header.title,
        catalog: header.variables,
        zones,
        solution_time,
        skipped_zones,
    })
}

/// Decode the snapshot file at `path`.
pub fn decode(path: impl AsRef<Path>) -> Result<SnapshotDecode, FormatError> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    let decoded = decode_cursor(ByteCursor::with_limit(BufReader::with_capacity(DECODE_BUFFER, file), len))?;
    debug!(path = %path.display(), zones = decoded.zones.len(), values = decoded.value_count(), "decoded snapshot");
    Ok(decoded)
}

// ── Writer ───────────────────────────────────────────────────────────────────

pub struct SnapshotWriter<W: Write> {
    writer:         W,
    layout:         DataLayout,
    declare_zones:  bool,
}

impl<W: Write> SnapshotWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer, layout: DataLayout::Block, declare_zones: true }
    }

    pub fn layout(mut self, layout: DataLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Leave the zone count undeclared and terminate with the end marker.
    pub fn undeclared_zone_count(mut self) -> Self {
        self.declare_zones = false;
        self
    }

    pub fn write(&mut self, snapshot: &SnapshotDecode) -> io::Result<()> {
        snapshot
            .check()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;

        let mut header = CatalogHeader::new(snapshot.title.clone(), snapshot.catalog.clone());
        header.version = snapshot.version;
        header.zone_count = if self.declare_zones {
            Some(snapshot.zones.len() as u32)
        } else {
            None
        };
        header.write(&mut self.writer)?;

        for zone in &snapshot.zones {
            zone.write(&mut self.writer, self.layout)?;
        }
        if !self.declare_zones {
            write_end_marker(&mut self.writer)?;
        }
        self.writer.flush()
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

/// Encode `snapshot` into a fresh buffer.
pub fn encode(snapshot: &SnapshotDecode, layout: DataLayout) -> io::Result<Vec<u8>> {
    let mut writer = SnapshotWriter::new(Vec::new()).layout(layout);
    writer.write(snapshot)?;
    Ok(writer.into_inner())
}

/// Encode `snapshot` to `path`, replacing any existing file.
pub fn encode_file(snapshot: &SnapshotDecode, path: impl AsRef<Path>, layout: DataLayout) -> io::Result<()> {
    let file = File::create(path)?;
    SnapshotWriter::new(BufWriter::new(file)).layout(layout).write(snapshot)
}
