//! Zone records: self-describing mesh regions that follow the catalog.
//!
//! # Record layout
//! ```text
//! marker     f32   ZONE_MARKER (299.0) or END_MARKER (357.0)
//! name       u32 length + UTF-8 bytes
//! kind       i32   0 ordered, 1 FE line, 2 FE triangle, 3 FE quad,
//!                  4 FE tetrahedron, 5 FE brick
//! body_len   u64   bytes remaining in this record
//! ── body ──
//! precision  u8    1 = f32, 2 = f64
//! layout     u8    0 = block-major, 1 = point-major
//! time       f64   solution time, NaN when unset
//! extent     ordered: I, J, K (u32 × 3)   FE: nodes, elements (u32 × 2)
//! values     nvars × npoints in the declared precision and layout
//! conn       FE only: elements × nodes_per_element u32, zero-based
//! ```
//!
//! `body_len` lets a reader step over kinds it does not understand; such
//! zones are reported as skipped and the rest of the file still decodes.
//! Values are always handed out per variable in catalog order, whichever
//! physical layout the file used.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::io::{self, Read, Write};

use crate::catalog::FormatError;
use crate::cursor::{write_string, ByteCursor};

pub const ZONE_MARKER: f32 = 299.0;
pub const END_MARKER:  f32 = 357.0;

/// precision + layout + solution time
const BODY_PREAMBLE: u64 = 1 + 1 + 8;

// ── Kinds ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FeShape {
    Triangle,
    Quadrilateral,
    Tetrahedron,
    Brick,
}

impl FeShape {
    pub fn nodes_per_element(self) -> usize {
        match self {
            FeShape::Triangle      => 3,
            FeShape::Quadrilateral => 4,
            FeShape::Tetrahedron   => 4,
            FeShape::Brick         => 8,
        }
    }
}

/// Geometry of a zone.  Kind codes outside this set are not an error; the
/// reader skips the zone and records an [`UnsupportedZone`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ZoneKind {
    Ordered,
    FeLineSegment,
    FeOther(FeShape),
}

impl ZoneKind {
    pub fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            0 => ZoneKind::Ordered,
            1 => ZoneKind::FeLineSegment,
            2 => ZoneKind::FeOther(FeShape::Triangle),
            3 => ZoneKind::FeOther(FeShape::Quadrilateral),
            4 => ZoneKind::FeOther(FeShape::Tetrahedron),
            5 => ZoneKind::FeOther(FeShape::Brick),
            _ => return None,
        })
    }

    pub fn code(self) -> i32 {
        match self {
            ZoneKind::Ordered                          => 0,
            ZoneKind::FeLineSegment                    => 1,
            ZoneKind::FeOther(FeShape::Triangle)       => 2,
            ZoneKind::FeOther(FeShape::Quadrilateral)  => 3,
            ZoneKind::FeOther(FeShape::Tetrahedron)    => 4,
            ZoneKind::FeOther(FeShape::Brick)          => 5,
        }
    }

    pub fn is_finite_element(self) -> bool {
        !matches!(self, ZoneKind::Ordered)
    }

    /// `None` for ordered zones, which carry no connectivity.
    pub fn nodes_per_element(self) -> Option<usize> {
        match self {
            ZoneKind::Ordered        => None,
            ZoneKind::FeLineSegment  => Some(2),
            ZoneKind::FeOther(shape) => Some(shape.nodes_per_element()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precision {
    Single,
    Double,
}

impl Precision {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Precision::Single),
            2 => Some(Precision::Double),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Precision::Single => 1,
            Precision::Double => 2,
        }
    }

    pub fn width(self) -> usize {
        match self {
            Precision::Single => 4,
            Precision::Double => 8,
        }
    }
}

/// Physical ordering of values inside a zone body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DataLayout {
    /// All values of variable 0, then all of variable 1, ...
    #[default]
    Block,
    /// All variables of point 0, then all of point 1, ...
    Point,
}

impl DataLayout {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(DataLayout::Block),
            1 => Some(DataLayout::Point),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        match self {
            DataLayout::Block => 0,
            DataLayout::Point => 1,
        }
    }
}

// ── Extent ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ZoneExtent {
    Ordered { i: u32, j: u32, k: u32 },
    FiniteElement { nodes: u32, elements: u32 },
}

impl ZoneExtent {
    /// Length of every per-variable array in the zone.
    pub fn point_count(&self) -> usize {
        match *self {
            ZoneExtent::Ordered { i, j, k } => {
                (i as usize).saturating_mul(j as usize).saturating_mul(k as usize)
            }
            ZoneExtent::FiniteElement { nodes, .. } => nodes as usize,
        }
    }

    fn encoded_len(&self) -> u64 {
        match self {
            ZoneExtent::Ordered { .. }       => 12,
            ZoneExtent::FiniteElement { .. } => 8,
        }
    }
}

// ── Field values ─────────────────────────────────────────────────────────────

/// One variable's values for one zone, kept in the file's own precision.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValues {
    Single(Vec<f32>),
    Double(Vec<f64>),
}

impl FieldValues {
    fn with_capacity(precision: Precision, n: usize) -> Self {
        match precision {
            Precision::Single => FieldValues::Single(Vec::with_capacity(n)),
            Precision::Double => FieldValues::Double(Vec::with_capacity(n)),
        }
    }

    fn from_le_bytes(precision: Precision, raw: &[u8]) -> Self {
        match precision {
            Precision::Single => {
                let mut v = vec![0f32; raw.len() / 4];
                LittleEndian::read_f32_into(raw, &mut v);
                FieldValues::Single(v)
            }
            Precision::Double => {
                let mut v = vec![0f64; raw.len() / 8];
                LittleEndian::read_f64_into(raw, &mut v);
                FieldValues::Double(v)
            }
        }
    }

    fn push_le(&mut self, raw: &[u8]) {
        match self {
            FieldValues::Single(v) => v.push(LittleEndian::read_f32(raw)),
            FieldValues::Double(v) => v.push(LittleEndian::read_f64(raw)),
        }
    }

    pub fn precision(&self) -> Precision {
        match self {
            FieldValues::Single(_) => Precision::Single,
            FieldValues::Double(_) => Precision::Double,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            FieldValues::Single(v) => v.len(),
            FieldValues::Double(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, idx: usize) -> Option<f64> {
        match self {
            FieldValues::Single(v) => v.get(idx).map(|&x| x as f64),
            FieldValues::Double(v) => v.get(idx).copied(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// Write value `idx` as little-endian bytes in `precision`.
    fn write_value<W: Write>(&self, idx: usize, precision: Precision, mut writer: W) -> io::Result<()> {
        match (self, precision) {
            (FieldValues::Single(v), Precision::Single) => writer.write_f32::<LittleEndian>(v[idx]),
            (FieldValues::Double(v), Precision::Double) => writer.write_f64::<LittleEndian>(v[idx]),
            (FieldValues::Single(v), Precision::Double) => writer.write_f64::<LittleEndian>(v[idx] as f64),
            (FieldValues::Double(v), Precision::Single) => writer.write_f32::<LittleEndian>(v[idx] as f32),
        }
    }

    /// Text rendering in the shortest form that parses back to the same
    /// value at this precision.
    pub(crate) fn display_value(&self, idx: usize) -> String {
        match self {
            FieldValues::Single(v) => format!("{}", v[idx]),
            FieldValues::Double(v) => format!("{}", v[idx]),
        }
    }
}

// ── Connectivity ─────────────────────────────────────────────────────────────

/// Element → node table for finite-element zones.  Node indices are zero-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connectivity {
    pub nodes_per_element: usize,
    pub nodes:             Vec<u32>,
}

impl Connectivity {
    pub fn element_count(&self) -> usize {
        if self.nodes_per_element == 0 { 0 } else { self.nodes.len() / self.nodes_per_element }
    }

    pub fn elements(&self) -> std::slice::ChunksExact<'_, u32> {
        self.nodes.chunks_exact(self.nodes_per_element.max(1))
    }
}

// ── ZoneDescriptor ───────────────────────────────────────────────────────────

/// A fully decoded zone.  `values[v]` belongs to catalog variable `v` and
/// always holds exactly `extent.point_count()` entries.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneDescriptor {
    pub name:          String,
    pub kind:          ZoneKind,
    pub extent:        ZoneExtent,
    pub solution_time: Option<f64>,
    pub values:        Vec<FieldValues>,
    pub connectivity:  Option<Connectivity>,
}

impl ZoneDescriptor {
    /// Build an ordered zone, checking every array against `I × J × K`.
    pub fn ordered(
        name:   impl Into<String>,
        dims:   (u32, u32, u32),
        values: Vec<FieldValues>,
    ) -> Result<Self, FormatError> {
        let zone = Self {
            name:          name.into(),
            kind:          ZoneKind::Ordered,
            extent:        ZoneExtent::Ordered { i: dims.0, j: dims.1, k: dims.2 },
            solution_time: None,
            values,
            connectivity:  None,
        };
        zone.check()?;
        Ok(zone)
    }

    /// Build a finite-element zone; `nodes` is the flat connectivity table.
    pub fn finite_element(
        name:       impl Into<String>,
        kind:       ZoneKind,
        node_count: u32,
        nodes:      Vec<u32>,
        values:     Vec<FieldValues>,
    ) -> Result<Self, FormatError> {
        let name = name.into();
        let npe = kind
            .nodes_per_element()
            .ok_or_else(|| FormatError::UnsupportedZoneKind { zone: name.clone(), code: kind.code() })?;
        let zone = Self {
            extent:        ZoneExtent::FiniteElement {
                nodes:    node_count,
                elements: (nodes.len() / npe) as u32,
            },
            name,
            kind,
            solution_time: None,
            values,
            connectivity:  Some(Connectivity { nodes_per_element: npe, nodes }),
        };
        zone.check()?;
        Ok(zone)
    }

    pub fn with_solution_time(mut self, time: f64) -> Self {
        self.solution_time = Some(time);
        self
    }

    pub fn point_count(&self) -> usize {
        self.extent.point_count()
    }

    /// Precision of the stored arrays; double for a zone without variables.
    /// All arrays of a checked zone share it.
    pub fn precision(&self) -> Precision {
        self.values.first().map(FieldValues::precision).unwrap_or(Precision::Double)
    }

    /// Enforce the array-length, precision and connectivity invariants.
    pub(crate) fn check(&self) -> Result<(), FormatError> {
        let precision = self.precision();
        if self.values.iter().any(|v| v.precision() != precision) {
            return Err(FormatError::MixedPrecision { zone: self.name.clone() });
        }
        let n = self.point_count();
        for v in &self.values {
            if v.len() != n {
                return Err(FormatError::ZoneExtentMismatch {
                    zone:      self.name.clone(),
                    expected:  n as u64,
                    available: v.len() as u64,
                });
            }
        }
        if let (Some(conn), ZoneExtent::FiniteElement { nodes, .. }) = (&self.connectivity, self.extent) {
            if conn.nodes.len() % conn.nodes_per_element.max(1) != 0 {
                return Err(FormatError::ZoneExtentMismatch {
                    zone:      self.name.clone(),
                    expected:  (conn.element_count() * conn.nodes_per_element) as u64,
                    available: conn.nodes.len() as u64,
                });
            }
            check_connectivity(&self.name, conn, nodes)?;
        }
        Ok(())
    }

    fn body_len(&self, nvars: usize, precision: Precision) -> u64 {
        let conn = self.connectivity.as_ref().map_or(0, |c| c.nodes.len() as u64 * 4);
        BODY_PREAMBLE
            + self.extent.encoded_len()
            + (nvars * self.point_count() * precision.width()) as u64
            + conn
    }

    /// Encode this zone as one record.  Values are written in the zone's own
    /// precision so a decode → encode cycle is bit-exact.
    pub fn write<W: Write>(&self, mut writer: W, layout: DataLayout) -> io::Result<()> {
        self.check()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        let precision = self.precision();
        let n = self.point_count();

        writer.write_f32::<LittleEndian>(ZONE_MARKER)?;
        write_string(&mut writer, &self.name)?;
        writer.write_i32::<LittleEndian>(self.kind.code())?;
        writer.write_u64::<LittleEndian>(self.body_len(self.values.len(), precision))?;

        writer.write_u8(precision.code())?;
        writer.write_u8(layout.code())?;
        writer.write_f64::<LittleEndian>(self.solution_time.unwrap_or(f64::NAN))?;
        match self.extent {
            ZoneExtent::Ordered { i, j, k } => {
                writer.write_u32::<LittleEndian>(i)?;
                writer.write_u32::<LittleEndian>(j)?;
                writer.write_u32::<LittleEndian>(k)?;
            }
            ZoneExtent::FiniteElement { nodes, elements } => {
                writer.write_u32::<LittleEndian>(nodes)?;
                writer.write_u32::<LittleEndian>(elements)?;
            }
        }

        match layout {
            DataLayout::Block => {
                for v in &self.values {
                    for idx in 0..n {
                        v.write_value(idx, precision, &mut writer)?;
                    }
                }
            }
            DataLayout::Point if !self.values.is_empty() => {
                for idx in 0..n {
                    for v in &self.values {
                        v.write_value(idx, precision, &mut writer)?;
                    }
                }
            }
            DataLayout::Point => {}
        }

        if let Some(conn) = &self.connectivity {
            for &node in &conn.nodes {
                writer.write_u32::<LittleEndian>(node)?;
            }
        }
        Ok(())
    }
}

fn check_connectivity(zone: &str, conn: &Connectivity, node_count: u32) -> Result<(), FormatError> {
    for (element, nodes) in conn.elements().enumerate() {
        if let Some(&node) = nodes.iter().find(|&&n| n >= node_count) {
            return Err(FormatError::BadConnectivity {
                zone: zone.to_string(),
                element,
                node,
                node_count,
            });
        }
    }
    Ok(())
}

/// Write a zone record of arbitrary kind with an opaque body.  Used to pass
/// through kinds this build cannot interpret.
pub fn write_opaque_zone<W: Write>(mut writer: W, name: &str, code: i32, body: &[u8]) -> io::Result<()> {
    writer.write_f32::<LittleEndian>(ZONE_MARKER)?;
    write_string(&mut writer, name)?;
    writer.write_i32::<LittleEndian>(code)?;
    writer.write_u64::<LittleEndian>(body.len() as u64)?;
    writer.write_all(body)
}

pub fn write_end_marker<W: Write>(mut writer: W) -> io::Result<()> {
    writer.write_f32::<LittleEndian>(END_MARKER)
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// A zone the reader stepped over.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsupportedZone {
    pub name:   String,
    pub code:   i32,
    /// Offset of the zone marker.
    pub offset: u64,
}

#[derive(Debug)]
pub(crate) enum ZoneRecord {
    Zone(ZoneDescriptor),
    Unsupported(UnsupportedZone),
}

/// Read the next zone record.  `Ok(None)` at the end marker, or at a clean
/// end of stream when `eof_ok` is set.
pub(crate) fn read_zone_record<R: Read>(
    cur:    &mut ByteCursor<R>,
    nvars:  usize,
    eof_ok: bool,
) -> Result<Option<ZoneRecord>, FormatError> {
    let offset = cur.position();
    let marker = match cur.read_word_or_eof("zone marker")? {
        Some(word) => LittleEndian::read_f32(&word),
        None if eof_ok => return Ok(None),
        None => return Err(FormatError::Truncated { context: "zone marker", offset }),
    };
    if marker == END_MARKER {
        return Ok(None);
    }
    if marker != ZONE_MARKER {
        return Err(FormatError::BadMarker { found: marker, offset });
    }

    let name     = cur.string("zone name")?;
    let code     = cur.i32("zone kind")?;
    let body_len = cur.u64("zone length")?;
    if let Some(left) = cur.remaining().filter(|&left| body_len > left) {
        return Err(FormatError::ZoneExtentMismatch { zone: name, expected: body_len, available: left });
    }

    let kind = match ZoneKind::from_code(code) {
        Some(kind) => kind,
        None => {
            let skipped = cur.skip(body_len)?;
            if skipped < body_len {
                return Err(FormatError::ZoneExtentMismatch { zone: name, expected: body_len, available: skipped });
            }
            return Ok(Some(ZoneRecord::Unsupported(UnsupportedZone { name, code, offset })));
        }
    };

    let body_start = cur.position();
    let zone = read_zone_body(cur, &name, kind, nvars, body_len).map_err(|e| match e {
        FormatError::Truncated { .. } => FormatError::ZoneExtentMismatch {
            zone:      name.clone(),
            expected:  body_len,
            available: cur.position() - body_start,
        },
        other => other,
    })?;
    Ok(Some(ZoneRecord::Zone(zone)))
}

fn read_zone_body<R: Read>(
    cur:      &mut ByteCursor<R>,
    name:     &str,
    kind:     ZoneKind,
    nvars:    usize,
    body_len: u64,
) -> Result<ZoneDescriptor, FormatError> {
    let unsupported = |what: &'static str, code: u8| FormatError::UnsupportedEncoding {
        zone: name.to_string(),
        what,
        code,
    };

    let precision_code = cur.u8("zone precision")?;
    let precision = Precision::from_code(precision_code).ok_or_else(|| unsupported("precision", precision_code))?;
    let layout_code = cur.u8("zone layout")?;
    let layout = DataLayout::from_code(layout_code).ok_or_else(|| unsupported("layout", layout_code))?;
    let time = cur.f64("solution time")?;

    let extent = match kind {
        ZoneKind::Ordered => ZoneExtent::Ordered {
            i: cur.u32("zone extent")?,
            j: cur.u32("zone extent")?,
            k: cur.u32("zone extent")?,
        },
        _ => ZoneExtent::FiniteElement {
            nodes:    cur.u32("zone extent")?,
            elements: cur.u32("zone extent")?,
        },
    };

    // Sizes are computed wide so corrupt extents cannot overflow.
    let npoints: u128 = match extent {
        ZoneExtent::Ordered { i, j, k }       => i as u128 * j as u128 * k as u128,
        ZoneExtent::FiniteElement { nodes, .. } => nodes as u128,
    };
    let conn_len: u128 = match (kind.nodes_per_element(), extent) {
        (Some(npe), ZoneExtent::FiniteElement { elements, .. }) => elements as u128 * npe as u128,
        _ => 0,
    };
    let expected = BODY_PREAMBLE as u128
        + extent.encoded_len() as u128
        + nvars as u128 * npoints * precision.width() as u128
        + conn_len * 4;
    if expected != body_len as u128 {
        return Err(FormatError::ZoneExtentMismatch {
            zone:      name.to_string(),
            expected:  u64::try_from(expected).unwrap_or(u64::MAX),
            available: body_len,
        });
    }
    // expected == body_len, so both fit in u64 from here on.
    let npoints  = npoints as usize;
    let conn_len = conn_len as usize;

    // Every buffer below is filled before anything is sized from `npoints`,
    // so a lying extent fails as a short read instead of a huge allocation.
    let width = precision.width();
    let values = match layout {
        _ if nvars == 0 => Vec::new(),
        DataLayout::Block => {
            let mut values = Vec::with_capacity(nvars);
            for _ in 0..nvars {
                let raw = cur.read_vec((npoints * width) as u64, "zone data block")?;
                values.push(FieldValues::from_le_bytes(precision, &raw));
            }
            values
        }
        DataLayout::Point => {
            let raw = cur.read_vec((nvars * npoints * width) as u64, "zone point record")?;
            let mut values: Vec<FieldValues> =
                (0..nvars).map(|_| FieldValues::with_capacity(precision, npoints)).collect();
            for row in raw.chunks_exact(nvars * width) {
                for (column, value) in values.iter_mut().zip(row.chunks_exact(width)) {
                    column.push_le(value);
                }
            }
            values
        }
    };

    let connectivity = match kind.nodes_per_element() {
        Some(npe) => {
            let raw = cur.read_vec(conn_len as u64 * 4, "zone connectivity")?;
            let mut nodes = vec![0u32; conn_len];
            LittleEndian::read_u32_into(&raw, &mut nodes);
            let conn = Connectivity { nodes_per_element: npe, nodes };
            if let ZoneExtent::FiniteElement { nodes, .. } = extent {
                check_connectivity(name, &conn, nodes)?;
            }
            Some(conn)
        }
        None => None,
    };

    Ok(ZoneDescriptor {
        name:          name.to_string(),
        kind,
        extent,
        solution_time: if time.is_nan() { None } else { Some(time) },
        values,
        connectivity,
    })
}
