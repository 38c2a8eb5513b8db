use cfdsnap::catalog::{read_header, VariableCatalog};
use cfdsnap::extract::{ExtractRequest, ExtractSource};
use cfdsnap::snapshot::{decode_reader, encode};
use cfdsnap::{extract, DataLayout, FieldValues, SnapshotDecode, ZoneDescriptor};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn grid(n: u32) -> SnapshotDecode {
    let points = (n * n * n) as usize;
    let names = ["X", "Y", "Z", "Pressure", "U", "V", "W"];
    let values = (0..names.len())
        .map(|v| FieldValues::Double((0..points).map(|p| (p * (v + 1)) as f64 * 1e-3).collect()))
        .collect();
    let zone = ZoneDescriptor::ordered("FIELD", (n, n, n), values).unwrap();
    SnapshotDecode::new("bench", VariableCatalog::new(names), vec![zone])
}

fn bench_decode(c: &mut Criterion) {
    let snap = grid(64);
    let block = encode(&snap, DataLayout::Block).unwrap();
    let point = encode(&snap, DataLayout::Point).unwrap();

    c.bench_function("decode_64cube_block", |b| b.iter(|| decode_reader(black_box(&block[..])).unwrap()));
    c.bench_function("decode_64cube_point", |b| b.iter(|| decode_reader(black_box(&point[..])).unwrap()));
    c.bench_function("header_only", |b| b.iter(|| read_header(black_box(&block[..])).unwrap()));
}

fn bench_encode(c: &mut Criterion) {
    let snap = grid(64);
    c.bench_function("encode_64cube_block", |b| b.iter(|| encode(black_box(&snap), DataLayout::Block).unwrap()));
}

fn bench_extract(c: &mut Criterion) {
    let snap = grid(64);
    let req = ExtractRequest::new("FIELD").variables(["Pressure", "U"]);
    c.bench_function("extract_two_columns", |b| {
        b.iter(|| extract(ExtractSource::Decoded(black_box(&snap)), &req).unwrap())
    });
}

criterion_group!(benches, bench_decode, bench_encode, bench_extract);
criterion_main!(benches);
