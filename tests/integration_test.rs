use cfdsnap::catalog::{CatalogHeader, VariableCatalog};
use cfdsnap::convert::{ErrorKind, JobState, JobWarning, Progress, SkipReason};
use cfdsnap::extract::{ExtractRequest, ExtractSource, ExtractionError};
use cfdsnap::snapshot::{decode_reader, encode, encode_file};
use cfdsnap::{
    convert, decode, discover, extract, validate, CancelToken, ConversionJob, ConversionOutcome,
    DataLayout, EnvironmentalError, FieldValues, FormatError, IssueKind, SnapshotDecode, TargetFormat, ToolLocation,
    ZoneDescriptor,
};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;

fn snapshot(vars: &[&str]) -> SnapshotDecode {
    let values = (0..vars.len())
        .map(|v| FieldValues::Double((0..4).map(|p| (v * 10 + p) as f64).collect()))
        .collect();
    let zone = ZoneDescriptor::ordered("FIELD", (2, 2, 1), values).unwrap().with_solution_time(1.5);
    SnapshotDecode::new("riser", VariableCatalog::new(vars.iter().copied()), vec![zone])
}

fn write_snapshot(dir: &Path, name: &str, vars: &[&str]) -> PathBuf {
    let path = dir.join(name);
    encode_file(&snapshot(vars), &path, DataLayout::Block).unwrap();
    path
}

fn fast(mut job: ConversionJob) -> ConversionJob {
    job.options.poll_interval = Duration::from_millis(20);
    job
}

#[test]
fn test_riser_scenario_validation() {
    let dir = TempDir::new().unwrap();
    write_snapshot(dir.path(), "riser.50.plt", &["X", "Y", "Pressure"]);
    fs::write(dir.path().join("riser.100.plt"), b"").unwrap();
    write_snapshot(dir.path(), "riser.150.plt", &["X", "Y"]);

    let index = discover(dir.path(), "riser").unwrap();
    assert_eq!(index.steps(), vec![50, 100, 150]);

    let report = validate(&index).unwrap();
    assert!(report.issues_for(50).unwrap().is_empty());
    assert_eq!(report.issues_for(100).unwrap(), &BTreeSet::from([IssueKind::Empty]));
    assert_eq!(
        report.issues_for(150).unwrap(),
        &BTreeSet::from([IssueKind::VariableDrift { missing: vec!["Pressure".into()], extra: vec![] }])
    );
    assert_eq!(report.stride, Some(50));
    assert!(report.sequence_gaps.is_empty());
    assert_eq!(report.convertible_files().len(), 1);
}

#[test]
fn test_sequence_gap_and_idempotence() {
    let dir = TempDir::new().unwrap();
    for step in [50, 100, 150, 250, 300] {
        write_snapshot(dir.path(), &format!("riser.{step}.plt"), &["X", "Y", "Pressure"]);
    }

    let index = discover(dir.path(), "riser").unwrap();
    let first = validate(&index).unwrap();
    let second = validate(&index).unwrap();
    assert_eq!(first, second);

    assert_eq!(first.sequence_gaps.len(), 1);
    assert_eq!((first.sequence_gaps[0].after, first.sequence_gaps[0].before), (150, 250));
    assert_eq!(first.sequence_gaps[0].missing_steps().collect::<Vec<_>>(), vec![200]);
    assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
}

#[test]
fn test_corrupt_header_is_reported_not_raised() {
    let dir = TempDir::new().unwrap();
    write_snapshot(dir.path(), "jet.0.plt", &["X", "U"]);
    fs::write(dir.path().join("jet.10.plt"), b"NOTASNAPSHOT").unwrap();

    let report = validate(&discover(dir.path(), "jet").unwrap()).unwrap();
    let issues = report.issues_for(10).unwrap();
    assert!(matches!(issues.iter().next(), Some(IssueKind::CorruptHeader { .. })));
}

/// One variable, one ordered zone of 2^20 × 2^20 × 2^20 single-precision
/// points whose length field agrees with that extent, and no data.
fn lying_extent_file() -> Vec<u8> {
    use byteorder::{LittleEndian, WriteBytesExt};

    let mut header = CatalogHeader::new("huge", VariableCatalog::new(["P"]));
    header.zone_count = Some(1);
    let mut bytes = Vec::new();
    header.write(&mut bytes).unwrap();

    let side = 1u32 << 20;
    bytes.write_f32::<LittleEndian>(299.0).unwrap();
    bytes.write_u32::<LittleEndian>(1).unwrap();
    bytes.extend_from_slice(b"Z");
    bytes.write_i32::<LittleEndian>(0).unwrap();
    bytes.write_u64::<LittleEndian>(10 + 12 + (side as u64).pow(3) * 4).unwrap();
    bytes.extend_from_slice(&[1, 0]);
    bytes.write_f64::<LittleEndian>(f64::NAN).unwrap();
    for _ in 0..3 {
        bytes.write_u32::<LittleEndian>(side).unwrap();
    }
    bytes
}

#[test]
fn test_lying_extent_is_a_format_error() {
    let bytes = lying_extent_file();
    assert!(bytes.len() < 100);
    assert!(matches!(decode_reader(&bytes[..]), Err(FormatError::ZoneExtentMismatch { .. })));

    let dir = TempDir::new().unwrap();
    let path = dir.path().join("huge.10.plt");
    fs::write(&path, &bytes).unwrap();
    match decode(&path) {
        Err(FormatError::ZoneExtentMismatch { zone, available, .. }) => {
            assert_eq!(zone, "Z");
            assert_eq!(available, 22);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_decode_and_extract() {
    let dir = TempDir::new().unwrap();
    let path = write_snapshot(dir.path(), "riser.50.plt", &["X", "Y", "Pressure"]);

    let decoded = decode(&path).unwrap();
    assert_eq!(decoded.catalog.names(), &["X", "Y", "Pressure"]);
    assert_eq!(decoded.solution_time, Some(1.5));

    let req = ExtractRequest::new("FIELD").variables(["Pressure"]);
    let rows = extract(ExtractSource::Decoded(&decoded), &req).unwrap();
    assert_eq!(rows.column("Pressure").unwrap(), vec![20.0, 21.0, 22.0, 23.0]);
    assert_eq!(rows.coordinate_names, vec!["X", "Y"]);

    let bad = ExtractRequest::new("FIELD").variables(["NotAVariable"]);
    match extract(ExtractSource::File(&path), &bad) {
        Err(ExtractionError::UnknownVariable { missing, .. }) => assert_eq!(missing, vec!["NotAVariable"]),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_extract_from_series() {
    let dir = TempDir::new().unwrap();
    write_snapshot(dir.path(), "riser.50.plt", &["X", "Pressure"]);
    write_snapshot(dir.path(), "riser.100.plt", &["X", "Pressure"]);
    let index = discover(dir.path(), "riser").unwrap();

    let latest = extract(ExtractSource::Series(&index), &ExtractRequest::new("FIELD")).unwrap();
    assert_eq!(latest.step, Some(100));

    let picked = extract(ExtractSource::Series(&index), &ExtractRequest::new("FIELD").timestep(50)).unwrap();
    assert_eq!(picked.step, Some(50));

    match extract(ExtractSource::Series(&index), &ExtractRequest::new("FIELD").timestep(75)) {
        Err(ExtractionError::OutOfRangeTimestep { requested, first, last }) => {
            assert_eq!((requested, first, last), (Some(75), Some(50), Some(100)));
        }
        other => panic!("unexpected {other:?}"),
    }
}

proptest! {
    #[test]
    fn prop_round_trip_preserves_arrays(
        i in 1u32..5,
        j in 1u32..4,
        k in 1u32..3,
        single in any::<bool>(),
        point_major in any::<bool>(),
        seed in prop::collection::vec(-1.0e6f64..1.0e6, 48),
    ) {
        let n = (i * j * k) as usize;
        let values: Vec<FieldValues> = (0..2)
            .map(|v| {
                let chunk = &seed[v * n..(v + 1) * n];
                if single {
                    FieldValues::Single(chunk.iter().map(|&x| x as f32).collect())
                } else {
                    FieldValues::Double(chunk.to_vec())
                }
            })
            .collect();
        let zone = ZoneDescriptor::ordered("FIELD", (i, j, k), values).unwrap();
        let snap = SnapshotDecode::new("prop", VariableCatalog::new(["X", "P"]), vec![zone]);
        let layout = if point_major { DataLayout::Point } else { DataLayout::Block };

        let bytes = encode(&snap, layout).unwrap();
        let back = decode_reader(&bytes[..]).unwrap();
        prop_assert_eq!(&back.zones[0].values, &snap.zones[0].values);
        for values in &back.zones[0].values {
            prop_assert_eq!(values.len(), n);
        }
    }
}

#[test]
fn test_convert_reports_every_file() {
    let dir = TempDir::new().unwrap();
    write_snapshot(dir.path(), "riser.50.plt", &["X", "Y", "Pressure"]);
    fs::write(dir.path().join("riser.100.plt"), b"NOTASNAPSHOT").unwrap();
    write_snapshot(dir.path(), "riser.150.plt", &["X", "Y", "Pressure"]);
    let index = discover(dir.path(), "riser").unwrap();

    let out = dir.path().join("vtk");
    let mut job = fast(ConversionJob::new(index.files.clone(), TargetFormat::Vtk, &out, cfdsnap::Strategy::InProcess));
    let result = convert(&mut job).unwrap();

    assert_eq!(result.per_file.len(), index.len());
    assert_eq!(job.state(), JobState::Completed);
    assert_eq!(result.succeeded(), 2);
    match &result.per_file[1].outcome {
        ConversionOutcome::Failed { kind, message } => {
            assert_eq!(*kind, ErrorKind::Decode);
            assert!(message.contains("no external tool"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(out.join("riser.50.vtk").is_file());
    assert_eq!(result.failed_sources()[0].step_id, 100);
}

#[test]
fn test_tool_not_found_aborts_before_any_file() {
    let dir = TempDir::new().unwrap();
    write_snapshot(dir.path(), "riser.50.plt", &["X", "Pressure"]);
    let index = discover(dir.path(), "riser").unwrap();

    let mut job = ConversionJob::new(index.files.clone(), TargetFormat::Hdf5, dir.path().join("h5"), cfdsnap::Strategy::InProcess);
    match convert(&mut job) {
        Err(EnvironmentalError::ToolNotFound { path: None }) => {}
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(job.state(), JobState::Aborted);

    let mut job = ConversionJob::new(index.files.clone(), TargetFormat::Hdf5, dir.path().join("h5"), cfdsnap::Strategy::ExternalTool)
        .with_tool(ToolLocation::new(dir.path().join("no-such-tool")));
    assert!(matches!(convert(&mut job), Err(EnvironmentalError::ToolNotFound { path: Some(_) })));
}

#[test]
fn test_cancelled_before_start_skips_everything() {
    let dir = TempDir::new().unwrap();
    write_snapshot(dir.path(), "riser.50.plt", &["X", "Pressure"]);
    write_snapshot(dir.path(), "riser.100.plt", &["X", "Pressure"]);
    let index = discover(dir.path(), "riser").unwrap();

    let cancel = CancelToken::new();
    cancel.cancel();
    let mut job = ConversionJob::new(index.files.clone(), TargetFormat::Ascii, dir.path().join("dat"), cfdsnap::Strategy::InProcess);
    let result = cfdsnap::convert::run(&mut job, &cancel, None::<&mut fn(&Progress)>).unwrap();
    assert_eq!(result.per_file.len(), 2);
    assert!(result
        .per_file
        .iter()
        .all(|r| r.outcome == ConversionOutcome::Skipped(SkipReason::Cancelled)));
}

#[test]
fn test_skip_existing_and_progress() {
    let dir = TempDir::new().unwrap();
    write_snapshot(dir.path(), "riser.50.plt", &["X", "Pressure"]);
    write_snapshot(dir.path(), "riser.100.plt", &["X", "Pressure"]);
    let index = discover(dir.path(), "riser").unwrap();
    let out = dir.path().join("dat");

    let mut seen = Vec::new();
    let mut on_progress = |p: &Progress| seen.push((p.outputs_seen, p.total));
    let mut job = ConversionJob::new(index.files.clone(), TargetFormat::Ascii, &out, cfdsnap::Strategy::InProcess);
    let first = cfdsnap::convert::run(&mut job, &CancelToken::new(), Some(&mut on_progress)).unwrap();
    assert_eq!(first.succeeded(), 2);
    assert_eq!(seen.last(), Some(&(2, 2)));

    let mut again = ConversionJob::new(index.files.clone(), TargetFormat::Ascii, &out, cfdsnap::Strategy::InProcess);
    again.options.skip_existing = true;
    let second = convert(&mut again).unwrap();
    assert!(second
        .per_file
        .iter()
        .all(|r| r.outcome == ConversionOutcome::Skipped(SkipReason::AlreadyConverted)));
}

#[test]
fn test_budget_overrun_warns_once_and_finishes() {
    let dir = TempDir::new().unwrap();
    for step in [50, 100, 150] {
        write_snapshot(dir.path(), &format!("riser.{step}.plt"), &["X", "Pressure"]);
    }
    let index = discover(dir.path(), "riser").unwrap();

    let mut job = ConversionJob::new(index.files.clone(), TargetFormat::Ascii, dir.path().join("dat"), cfdsnap::Strategy::InProcess);
    job.options.expected_per_file = Some(Duration::from_nanos(1));
    let result = convert(&mut job).unwrap();

    assert_eq!(result.succeeded(), 3);
    let overruns: Vec<_> = result
        .warnings
        .iter()
        .filter(|w| matches!(w, JobWarning::BudgetExceeded { .. }))
        .collect();
    assert_eq!(overruns.len(), 1);
    match overruns[0] {
        JobWarning::BudgetExceeded { budget, elapsed } => assert!(elapsed > budget),
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn test_output_dir_under_a_file_is_unwritable() {
    let dir = TempDir::new().unwrap();
    write_snapshot(dir.path(), "riser.50.plt", &["X", "Pressure"]);
    let index = discover(dir.path(), "riser").unwrap();
    let blocker = dir.path().join("not-a-dir");
    fs::write(&blocker, b"").unwrap();

    let mut job = ConversionJob::new(index.files.clone(), TargetFormat::Vtk, blocker.join("vtk"), cfdsnap::Strategy::InProcess);
    match convert(&mut job) {
        Err(EnvironmentalError::OutputDirUnwritable { path, .. }) => assert_eq!(path, blocker.join("vtk")),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(job.state(), JobState::Aborted);
}

#[cfg(unix)]
mod external_tool {
    use super::*;

    /// A stand-in batch tool: reads the macro given as its third argument and
    /// writes the requested output, logging each conversion to `log`.
    fn fake_tool(dir: &Path, body: &str) -> ToolLocation {
        let script = dir.join("fake-tool.sh");
        fs::write(&script, body).unwrap();
        ToolLocation::new("/bin/sh").with_args([
            script.to_string_lossy().into_owned(),
            "-b".into(),
            "-p".into(),
            "{script}".into(),
        ])
    }

    fn converting_tool(dir: &Path, log: &Path) -> ToolLocation {
        fake_tool(
            dir,
            &format!(
                r##"out=$(sed -n 's/^\$!WRITEDATASET "\(.*\)"$/\1/p' "$3")
if [ -n "$out" ]; then
  echo "converted by tool" > "$out"
  echo "$out" >> "{log}"
fi
exit 0
"##,
                log = log.display()
            ),
        )
    }

    #[test]
    fn test_in_process_failure_falls_back_exactly_once() {
        let dir = TempDir::new().unwrap();
        let data = dir.path().join("data");
        fs::create_dir(&data).unwrap();
        write_snapshot(&data, "riser.50.plt", &["X", "Y", "Pressure"]);
        fs::write(data.join("riser.100.plt"), b"NOTASNAPSHOT").unwrap();
        write_snapshot(&data, "riser.150.plt", &["X", "Y", "Pressure"]);
        let index = discover(&data, "riser").unwrap();

        let log = dir.path().join("tool.log");
        let out = dir.path().join("out");
        let mut job = fast(
            ConversionJob::new(index.files.clone(), TargetFormat::Vtk, &out, cfdsnap::Strategy::InProcess)
                .with_tool(converting_tool(dir.path(), &log)),
        );
        let result = convert(&mut job).unwrap();

        assert_eq!(result.per_file.len(), 3);
        let strategies: Vec<_> = result
            .per_file
            .iter()
            .map(|r| match &r.outcome {
                ConversionOutcome::Success { strategy, .. } => *strategy,
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(
            strategies,
            vec![cfdsnap::Strategy::InProcess, cfdsnap::Strategy::ExternalTool, cfdsnap::Strategy::InProcess]
        );

        let calls = fs::read_to_string(&log).unwrap();
        assert_eq!(calls.lines().count(), 1);
        assert!(calls.contains("riser.100.vtk"));
    }

    #[test]
    fn test_external_failure_is_not_retried() {
        let dir = TempDir::new().unwrap();
        write_snapshot(dir.path(), "riser.50.plt", &["X", "Pressure"]);
        let index = discover(dir.path(), "riser").unwrap();
        let log = dir.path().join("tool.log");
        let tool = fake_tool(
            dir.path(),
            &format!(
                r##"if grep -q WRITEDATASET "$3"; then
  echo "attempt" >> "{log}"
  echo "segmentation fault in exporter" 1>&2
  exit 2
fi
exit 0
"##,
                log = log.display()
            ),
        );

        let mut job = fast(
            ConversionJob::new(index.files.clone(), TargetFormat::Hdf5, dir.path().join("h5"), cfdsnap::Strategy::InProcess)
                .with_tool(tool),
        );
        let result = convert(&mut job).unwrap();
        match &result.per_file[0].outcome {
            ConversionOutcome::Failed { kind, message } => {
                assert_eq!(*kind, ErrorKind::ExternalTool);
                assert!(message.contains("segmentation fault"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(fs::read_to_string(&log).unwrap().lines().count(), 1);
    }

    #[test]
    fn test_cancel_while_tool_runs() {
        let dir = TempDir::new().unwrap();
        write_snapshot(dir.path(), "riser.50.plt", &["X", "Pressure"]);
        write_snapshot(dir.path(), "riser.100.plt", &["X", "Pressure"]);
        let index = discover(dir.path(), "riser").unwrap();
        let tool = fake_tool(
            dir.path(),
            r##"if grep -q WRITEDATASET "$3"; then
  echo "exporting"
  exec sleep 30
fi
exit 0
"##,
        );

        let cancel = CancelToken::new();
        let mut on_progress = |p: &Progress| {
            if p.current.is_some() {
                cancel.cancel();
            }
        };
        let mut job = fast(
            ConversionJob::new(index.files.clone(), TargetFormat::Hdf5, dir.path().join("h5"), cfdsnap::Strategy::ExternalTool)
                .with_tool(tool),
        );
        let started = std::time::Instant::now();
        let result = cfdsnap::convert::run(&mut job, &cancel, Some(&mut on_progress)).unwrap();

        assert!(started.elapsed() < Duration::from_secs(20));
        assert_eq!(result.per_file.len(), 2);
        match &result.per_file[0].outcome {
            ConversionOutcome::Failed { kind, .. } => assert_eq!(*kind, ErrorKind::Cancelled),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(result.per_file[1].outcome, ConversionOutcome::Skipped(SkipReason::Cancelled));
        assert_eq!(job.state(), JobState::Completed);
    }

    #[test]
    fn test_license_failure_aborts_job() {
        let dir = TempDir::new().unwrap();
        write_snapshot(dir.path(), "riser.50.plt", &["X", "Pressure"]);
        let index = discover(dir.path(), "riser").unwrap();
        let tool = fake_tool(dir.path(), "echo 'Error: License unavailable for this product' 1>&2\nexit 1\n");

        let mut job = fast(
            ConversionJob::new(index.files.clone(), TargetFormat::Hdf5, dir.path().join("h5"), cfdsnap::Strategy::ExternalTool)
                .with_tool(tool),
        );
        match convert(&mut job) {
            Err(EnvironmentalError::LicenseUnavailable { diagnostic }) => {
                assert!(diagnostic.contains("License unavailable"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(job.state(), JobState::Aborted);
    }
}
