//! Catalog decoder: the fixed header at offset 0 of every snapshot file.
//!
//! # Layout
//! ```text
//! magic     8 B    "#!TDV" + three version digits ("#!TDV112")
//! title     u32 length + UTF-8 bytes
//! nvars     u32
//! names     nvars × (u32 length + UTF-8 bytes)
//! nzones    u32    ZONE_COUNT_UNDECLARED = read zones until the end marker
//! ```
//!
//! All integers are little-endian.  Reading the header never touches zone
//! data, so it is cheap enough to run over a whole directory before any full
//! decode is attempted.

use byteorder::{LittleEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;
use thiserror::Error;

use crate::cursor::{write_string, ByteCursor};

pub const MAGIC_PREFIX: &[u8; 5] = b"#!TDV";
pub const MAGIC_LEN: usize = 8;
pub const SUPPORTED_VERSIONS: &[u16] = &[111, 112];
pub const CURRENT_VERSION: u16 = 112;
/// Zone count sentinel: zones run until the end marker or end of stream.
pub const ZONE_COUNT_UNDECLARED: u32 = u32::MAX;
pub const MAX_STRING_LEN: u32 = 64 * 1024;
pub const MAX_VARIABLES: u32 = 16 * 1024;

// ── Errors ───────────────────────────────────────────────────────────────────

/// Per-file decode failure.  Never fatal to a batch: the caller marks the
/// file invalid and moves on.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Bad magic {found:?}: not a supported snapshot format version")]
    BadMagic { found: String },
    #[error("Truncated {context} at byte {offset}")]
    Truncated { context: &'static str, offset: u64 },
    #[error("Implausible {what} ({value}) at byte {offset}")]
    Implausible { what: &'static str, value: u64, offset: u64 },
    #[error("Zone '{zone}': extent implies {expected} bytes but {available} are available")]
    ZoneExtentMismatch { zone: String, expected: u64, available: u64 },
    #[error("Zone '{zone}': unsupported zone kind code {code}")]
    UnsupportedZoneKind { zone: String, code: i32 },
    #[error("Zone '{zone}': unsupported {what} code {code}")]
    UnsupportedEncoding { zone: String, what: &'static str, code: u8 },
    #[error("Bad zone marker {found} at byte {offset}")]
    BadMarker { found: f32, offset: u64 },
    #[error("Zone '{zone}': arrays mix single and double precision")]
    MixedPrecision { zone: String },
    #[error("Zone '{zone}' has {arrays} arrays for {variables} catalog variables")]
    CatalogMismatch { zone: String, arrays: usize, variables: usize },
    #[error("Zone '{zone}': element {element} references node {node} but the zone has {node_count} nodes")]
    BadConnectivity { zone: String, element: usize, node: u32, node_count: u32 },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl FormatError {
    /// True when the failure came from the filesystem rather than the bytes.
    pub fn is_io(&self) -> bool {
        matches!(self, FormatError::Io(_))
    }
}

// ── VariableCatalog ──────────────────────────────────────────────────────────

/// Ordered variable names shared by every zone of one file.
///
/// Order is preserved verbatim.  Names are expected to be unique but the
/// format does not enforce it; see [`VariableCatalog::duplicates`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VariableCatalog(Vec<String>);

impl VariableCatalog {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(names.into_iter().map(Into::into).collect())
    }

    pub fn names(&self) -> &[String] { &self.0 }
    pub fn len(&self) -> usize { self.0.len() }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }

    /// Index of the first variable called `name`.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.0.iter().position(|n| n == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn name_set(&self) -> BTreeSet<&str> {
        self.0.iter().map(String::as_str).collect()
    }

    /// Names that appear more than once, sorted, each listed once.
    pub fn duplicates(&self) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut dups = BTreeSet::new();
        for name in &self.0 {
            if !seen.insert(name.as_str()) {
                dups.insert(name.clone());
            }
        }
        dups.into_iter().collect()
    }

    /// Order-insensitive comparison against `reference`.
    /// Returns `(missing, extra)`: names only in the reference, names only here.
    pub fn drift_from(&self, reference: &VariableCatalog) -> (Vec<String>, Vec<String>) {
        let ours   = self.name_set();
        let theirs = reference.name_set();
        let missing = theirs.difference(&ours).map(|s| s.to_string()).collect();
        let extra   = ours.difference(&theirs).map(|s| s.to_string()).collect();
        (missing, extra)
    }

    /// Catalog positions of the X, Y and Z coordinate variables, when present.
    /// Matches `X` / `CoordinateX` (and friends) case-insensitively.
    pub fn coordinate_axes(&self) -> [Option<usize>; 3] {
        let find = |axis: &str| {
            let long = format!("coordinate{axis}");
            self.0.iter().position(|n| {
                let n = n.trim().to_ascii_lowercase();
                n == axis || n == long
            })
        };
        [find("x"), find("y"), find("z")]
    }
}

// ── CatalogHeader ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogHeader {
    pub version:    u16,
    pub title:      String,
    pub variables:  VariableCatalog,
    /// `None` when the file leaves the zone count undeclared.
    pub zone_count: Option<u32>,
}

impl CatalogHeader {
    pub fn new(title: impl Into<String>, variables: VariableCatalog) -> Self {
        Self {
            version:    CURRENT_VERSION,
            title:      title.into(),
            variables,
            zone_count: None,
        }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_all(MAGIC_PREFIX)?;
        writer.write_all(format!("{:03}", self.version).as_bytes())?;
        write_string(&mut writer, &self.title)?;
        writer.write_u32::<LittleEndian>(self.variables.len() as u32)?;
        for name in self.variables.names() {
            write_string(&mut writer, name)?;
        }
        writer.write_u32::<LittleEndian>(self.zone_count.unwrap_or(ZONE_COUNT_UNDECLARED))?;
        Ok(())
    }

    pub(crate) fn read_from<R: Read>(cur: &mut ByteCursor<R>) -> Result<Self, FormatError> {
        let mut magic = [0u8; MAGIC_LEN];
        cur.read_exact(&mut magic, "magic")?;
        let version = parse_magic(&magic)?;

        let title = cur.string("title")?;

        let count_offset = cur.position();
        let nvars = cur.u32("variable count")?;
        if nvars > MAX_VARIABLES {
            return Err(FormatError::Implausible {
                what:   "variable count",
                value:  nvars as u64,
                offset: count_offset,
            });
        }
        let mut names = Vec::with_capacity(nvars as usize);
        for _ in 0..nvars {
            names.push(cur.string("variable name")?);
        }

        let zone_count = match cur.u32("zone count")? {
            ZONE_COUNT_UNDECLARED => None,
            n => Some(n),
        };

        Ok(Self {
            version,
            title,
            variables: VariableCatalog(names),
            zone_count,
        })
    }
}

fn parse_magic(magic: &[u8; MAGIC_LEN]) -> Result<u16, FormatError> {
    let bad = || FormatError::BadMagic { found: String::from_utf8_lossy(magic).into_owned() };
    if &magic[..MAGIC_PREFIX.len()] != MAGIC_PREFIX {
        return Err(bad());
    }
    let digits = &magic[MAGIC_PREFIX.len()..];
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(bad());
    }
    let version = digits.iter().fold(0u16, |acc, d| acc * 10 + (d - b'0') as u16);
    if !SUPPORTED_VERSIONS.contains(&version) {
        return Err(bad());
    }
    Ok(version)
}

/// Decode the header from the start of `reader`.
///
/// Returns the header and the byte offset at which zone records begin.
pub fn read_header<R: Read>(reader: R) -> Result<(CatalogHeader, u64), FormatError> {
    let mut cur = ByteCursor::new(reader);
    let header = CatalogHeader::read_from(&mut cur)?;
    Ok((header, cur.position()))
}

/// Header-only decode of the file at `path`.  Zone records are never
/// parsed, though the buffered reader may pull in the first of them.
pub fn read_header_file(path: &Path) -> Result<(CatalogHeader, u64), FormatError> {
    let file = File::open(path)?;
    read_header(BufReader::with_capacity(16 * 1024, file))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CatalogHeader {
        CatalogHeader::new("riser", VariableCatalog::new(["X", "Y", "Z", "Pressure"]))
    }

    #[test]
    fn header_roundtrip_reports_cursor() {
        let mut buf = Vec::new();
        sample().write(&mut buf).unwrap();
        let (header, pos) = read_header(&buf[..]).unwrap();
        assert_eq!(header, sample());
        assert_eq!(pos, buf.len() as u64);
    }

    #[test]
    fn older_version_is_accepted() {
        let mut h = sample();
        h.version = 111;
        h.zone_count = Some(2);
        let mut buf = Vec::new();
        h.write(&mut buf).unwrap();
        let (back, _) = read_header(&buf[..]).unwrap();
        assert_eq!(back.version, 111);
        assert_eq!(back.zone_count, Some(2));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut buf = Vec::new();
        sample().write(&mut buf).unwrap();
        buf[..8].copy_from_slice(b"#!TDV099");
        assert!(matches!(read_header(&buf[..]), Err(FormatError::BadMagic { .. })));

        buf[..8].copy_from_slice(b"GARBAGE!");
        assert!(matches!(read_header(&buf[..]), Err(FormatError::BadMagic { .. })));
    }

    #[test]
    fn truncated_variable_list() {
        let mut buf = Vec::new();
        sample().write(&mut buf).unwrap();
        buf.truncate(buf.len() - 10);
        match read_header(&buf[..]) {
            Err(FormatError::Truncated { context, .. }) => assert_eq!(context, "variable name"),
            other => panic!("expected truncation, got {other:?}"),
        }
    }

    #[test]
    fn drift_and_duplicates() {
        let full    = VariableCatalog::new(["X", "Y", "Pressure"]);
        let partial = VariableCatalog::new(["Y", "X", "Vorticity"]);
        let (missing, extra) = partial.drift_from(&full);
        assert_eq!(missing, vec!["Pressure".to_string()]);
        assert_eq!(extra, vec!["Vorticity".to_string()]);

        let reordered = VariableCatalog::new(["Pressure", "Y", "X"]);
        assert_eq!(reordered.drift_from(&full), (vec![], vec![]));

        let dup = VariableCatalog::new(["X", "U", "X", "U", "V"]);
        assert_eq!(dup.duplicates(), vec!["U".to_string(), "X".to_string()]);
    }

    #[test]
    fn coordinate_axes_case_insensitive() {
        let cat = VariableCatalog::new(["CoordinateX", "y", "Pressure"]);
        assert_eq!(cat.coordinate_axes(), [Some(0), Some(1), None]);
    }
}
