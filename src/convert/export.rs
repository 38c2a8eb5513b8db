//! In-process writers for the formats that need no external tool.
//!
//! | Format | Output |
//! |--------|--------|
//! | `Vtk`   | legacy ASCII `UNSTRUCTURED_GRID`, all zones merged into one grid |
//! | `Ascii` | point-per-variable text (`TITLE` / `VARIABLES` / `ZONE` blocks) |
//!
//! Numbers are printed in the shortest form that reads back to the stored
//! value, so text output loses nothing relative to the decode.

use std::fs::{self, File};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use super::TargetFormat;
use crate::snapshot::SnapshotDecode;
use crate::zone::{FeShape, FieldValues, ZoneDescriptor, ZoneExtent, ZoneKind};

/// Values per line in block-packed text output.
const VALUES_PER_LINE: usize = 5;
/// Legacy VTK caps the header line at 256 bytes including the newline.
const VTK_TITLE_MAX: usize = 255;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("No in-process writer for {0:?}")]
    Unsupported(TargetFormat),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Write `snapshot` to `path` in `format`.  Data goes to a sibling
/// `.partial` file first and is renamed into place only when complete, so
/// an interrupted export never leaves a plausible-looking output behind.
pub fn export(snapshot: &SnapshotDecode, format: TargetFormat, path: &Path) -> Result<(), ExportError> {
    if !format.has_in_process_path() {
        return Err(ExportError::Unsupported(format));
    }
    let partial = partial_path(path);
    let written = File::create(&partial).and_then(|file| {
        let mut out = BufWriter::new(file);
        match format {
            TargetFormat::Vtk => write_vtk(snapshot, &mut out)?,
            _                 => write_ascii(snapshot, &mut out)?,
        }
        out.into_inner().map_err(|e| e.into_error())?.sync_all()
    });
    match written.and_then(|_| fs::rename(&partial, path)) {
        Ok(()) => Ok(()),
        Err(e) => {
            let _ = fs::remove_file(&partial);
            Err(e.into())
        }
    }
}

fn partial_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}

// ── VTK ──────────────────────────────────────────────────────────────────────

const VTK_VERTEX:     u8 = 1;
const VTK_LINE:       u8 = 3;
const VTK_TRIANGLE:   u8 = 5;
const VTK_QUAD:       u8 = 9;
const VTK_TETRA:      u8 = 10;
const VTK_HEXAHEDRON: u8 = 12;

/// Corner offsets along the active axes of a structured cell, in VTK order.
const VERTEX_CORNERS: &[&[usize]] = &[&[]];
const LINE_CORNERS:   &[&[usize]] = &[&[0], &[1]];
const QUAD_CORNERS:   &[&[usize]] = &[&[0, 0], &[1, 0], &[1, 1], &[0, 1]];
const HEX_CORNERS:    &[&[usize]] = &[
    &[0, 0, 0], &[1, 0, 0], &[1, 1, 0], &[0, 1, 0],
    &[0, 0, 1], &[1, 0, 1], &[1, 1, 1], &[0, 1, 1],
];

struct Cell {
    vtk_type: u8,
    nodes:    Vec<usize>,
}

fn ordered_cells(i: u32, j: u32, k: u32, base: usize, cells: &mut Vec<Cell>) {
    let dims = [i as usize, j as usize, k as usize];
    let active: Vec<usize> = (0..3).filter(|&a| dims[a] > 1).collect();
    let (vtk_type, corners): (u8, &[&[usize]]) = match active.len() {
        0 => (VTK_VERTEX, VERTEX_CORNERS),
        1 => (VTK_LINE, LINE_CORNERS),
        2 => (VTK_QUAD, QUAD_CORNERS),
        _ => (VTK_HEXAHEDRON, HEX_CORNERS),
    };
    let count = |a: usize| if dims[a] > 1 { dims[a] - 1 } else { dims[a] };

    for c in 0..count(2) {
        for b in 0..count(1) {
            for a in 0..count(0) {
                let nodes = corners
                    .iter()
                    .map(|offsets| {
                        let mut p = [a, b, c];
                        for (slot, &axis) in active.iter().enumerate() {
                            p[axis] += offsets[slot];
                        }
                        base + p[0] + dims[0] * (p[1] + dims[1] * p[2])
                    })
                    .collect();
                cells.push(Cell { vtk_type, nodes });
            }
        }
    }
}

fn fe_cell_type(kind: ZoneKind) -> u8 {
    match kind {
        ZoneKind::FeOther(FeShape::Triangle)      => VTK_TRIANGLE,
        ZoneKind::FeOther(FeShape::Quadrilateral) => VTK_QUAD,
        ZoneKind::FeOther(FeShape::Tetrahedron)   => VTK_TETRA,
        ZoneKind::FeOther(FeShape::Brick)         => VTK_HEXAHEDRON,
        _                                         => VTK_LINE,
    }
}

fn zone_cells(zone: &ZoneDescriptor, base: usize, cells: &mut Vec<Cell>) {
    match (zone.extent, &zone.connectivity) {
        (ZoneExtent::Ordered { i, j, k }, _) => ordered_cells(i, j, k, base, cells),
        (ZoneExtent::FiniteElement { .. }, Some(conn)) => {
            let vtk_type = fe_cell_type(zone.kind);
            for element in conn.elements() {
                cells.push(Cell {
                    vtk_type,
                    nodes: element.iter().map(|&n| base + n as usize).collect(),
                });
            }
        }
        (ZoneExtent::FiniteElement { .. }, None) => {}
    }
}

/// VTK array names may not contain whitespace.
fn vtk_name(name: &str, position: usize) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') { c } else { '_' })
        .collect();
    if cleaned.is_empty() { format!("var{position}") } else { cleaned }
}

fn coordinate(zone: &ZoneDescriptor, axis: Option<usize>, point: usize) -> String {
    match axis.and_then(|v| zone.values.get(v)) {
        Some(values) => values.display_value(point),
        None         => "0".to_string(),
    }
}

fn check_snapshot(snapshot: &SnapshotDecode) -> io::Result<()> {
    snapshot
        .check()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
}

pub fn write_vtk<W: Write>(snapshot: &SnapshotDecode, mut w: W) -> io::Result<()> {
    check_snapshot(snapshot)?;
    let axes = snapshot.catalog.coordinate_axes();
    let total_points: usize = snapshot.zones.iter().map(ZoneDescriptor::point_count).sum();

    let mut title: String = snapshot.title.chars().filter(|c| !c.is_control()).collect();
    if title.trim().is_empty() {
        title = "snapshot".to_string();
    }
    if title.len() > VTK_TITLE_MAX {
        let mut cut = VTK_TITLE_MAX;
        while !title.is_char_boundary(cut) {
            cut -= 1;
        }
        title.truncate(cut);
    }

    writeln!(w, "# vtk DataFile Version 3.0")?;
    writeln!(w, "{title}")?;
    writeln!(w, "ASCII")?;
    writeln!(w, "DATASET UNSTRUCTURED_GRID")?;

    writeln!(w, "POINTS {total_points} double")?;
    for zone in &snapshot.zones {
        for p in 0..zone.point_count() {
            writeln!(
                w,
                "{} {} {}",
                coordinate(zone, axes[0], p),
                coordinate(zone, axes[1], p),
                coordinate(zone, axes[2], p),
            )?;
        }
    }

    let mut cells = Vec::new();
    let mut base = 0;
    for zone in &snapshot.zones {
        zone_cells(zone, base, &mut cells);
        base += zone.point_count();
    }
    let cell_size: usize = cells.iter().map(|c| c.nodes.len() + 1).sum();
    writeln!(w, "CELLS {} {}", cells.len(), cell_size)?;
    for cell in &cells {
        write!(w, "{}", cell.nodes.len())?;
        for n in &cell.nodes {
            write!(w, " {n}")?;
        }
        writeln!(w)?;
    }
    writeln!(w, "CELL_TYPES {}", cells.len())?;
    for cell in &cells {
        writeln!(w, "{}", cell.vtk_type)?;
    }

    let scalars: Vec<usize> = (0..snapshot.catalog.len())
        .filter(|v| !axes.contains(&Some(*v)))
        .collect();
    if !scalars.is_empty() && total_points > 0 {
        writeln!(w, "POINT_DATA {total_points}")?;
        for &v in &scalars {
            writeln!(w, "SCALARS {} double 1", vtk_name(&snapshot.catalog.names()[v], v))?;
            writeln!(w, "LOOKUP_TABLE default")?;
            for zone in &snapshot.zones {
                write_block(&mut w, &zone.values[v])?;
            }
        }
    }
    w.flush()
}

// ── ASCII ────────────────────────────────────────────────────────────────────

fn zone_type(kind: ZoneKind) -> &'static str {
    match kind {
        ZoneKind::Ordered                         => "ORDERED",
        ZoneKind::FeLineSegment                   => "FELINESEG",
        ZoneKind::FeOther(FeShape::Triangle)      => "FETRIANGLE",
        ZoneKind::FeOther(FeShape::Quadrilateral) => "FEQUADRILATERAL",
        ZoneKind::FeOther(FeShape::Tetrahedron)   => "FETETRAHEDRON",
        ZoneKind::FeOther(FeShape::Brick)         => "FEBRICK",
    }
}

fn quoted(s: &str) -> String {
    format!("\"{}\"", s.replace('"', "'"))
}

fn write_block<W: Write>(w: &mut W, values: &FieldValues) -> io::Result<()> {
    for start in (0..values.len()).step_by(VALUES_PER_LINE) {
        let end = (start + VALUES_PER_LINE).min(values.len());
        let line: Vec<String> = (start..end).map(|i| values.display_value(i)).collect();
        writeln!(w, "{}", line.join(" "))?;
    }
    Ok(())
}

/// Block-packed text: every variable's values in turn, then (finite-element
/// zones) one element per line with one-based node numbers.
pub fn write_ascii<W: Write>(snapshot: &SnapshotDecode, mut w: W) -> io::Result<()> {
    check_snapshot(snapshot)?;
    writeln!(w, "TITLE = {}", quoted(&snapshot.title))?;
    let names: Vec<String> = snapshot.catalog.names().iter().map(|n| quoted(n)).collect();
    writeln!(w, "VARIABLES = {}", names.join(", "))?;

    for zone in &snapshot.zones {
        let mut line = format!("ZONE T={}", quoted(&zone.name));
        match zone.extent {
            ZoneExtent::Ordered { i, j, k } => {
                line.push_str(&format!(", I={i}, J={j}, K={k}"));
            }
            ZoneExtent::FiniteElement { nodes, elements } => {
                line.push_str(&format!(", NODES={nodes}, ELEMENTS={elements}"));
            }
        }
        line.push_str(&format!(", ZONETYPE={}, DATAPACKING=BLOCK", zone_type(zone.kind)));
        if let Some(t) = zone.solution_time {
            line.push_str(&format!(", SOLUTIONTIME={t}"));
        }
        writeln!(w, "{line}")?;

        for values in &zone.values {
            write_block(&mut w, values)?;
        }
        if let Some(conn) = &zone.connectivity {
            for element in conn.elements() {
                let ids: Vec<String> = element.iter().map(|n| (n + 1).to_string()).collect();
                writeln!(w, "{}", ids.join(" "))?;
            }
        }
    }
    w.flush()
}
