//! Performance benchmarks for a3s-atlas-ingest
//!
//! Run with: cargo bench

use a3s_atlas_ingest::listener::{sign, verify_signature};
use a3s_atlas_ingest::{ApiRecord, ClusterFilter, Origin, Surface};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn cluster_names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("cluster-{:04}", i)).collect()
}

fn bench_cluster_filter(c: &mut Criterion) {
    let names = cluster_names(1000);
    let include = ClusterFilter::build(names.as_slice(), &[]).unwrap();
    let exclude = ClusterFilter::build(&[], names.as_slice()).unwrap();
    let all = ClusterFilter::allow_all();

    c.bench_function("ClusterFilter::matches include hit", |b| {
        b.iter(|| include.matches(black_box("cluster-0500")));
    });

    c.bench_function("ClusterFilter::matches include miss", |b| {
        b.iter(|| include.matches(black_box("cluster-9999")));
    });

    c.bench_function("ClusterFilter::matches exclude", |b| {
        b.iter(|| exclude.matches(black_box("cluster-0500")));
    });

    c.bench_function("ClusterFilter::matches pass-through", |b| {
        b.iter(|| all.matches(black_box("anything")));
    });

    c.bench_function("ClusterFilter::build 1000", |b| {
        b.iter(|| ClusterFilter::build(black_box(names.as_slice()), &[]).unwrap());
    });
}

fn bench_record_conversion(c: &mut Criterion) {
    let payload = serde_json::json!({
        "id": "5cf7b2f3e0f2a1d3c9a8b7e6",
        "groupId": "proj1",
        "clusterName": "cluster-0001",
        "eventTypeName": "OUTSIDE_METRIC_THRESHOLD",
        "status": "OPEN",
        "currentValue": {"number": 95.2, "units": "RAW"},
    });

    c.bench_function("ApiRecord into InternalEvent", |b| {
        b.iter(|| {
            ApiRecord::from_json(black_box(payload.clone()))
                .into_event(Surface::Alerts, Origin::Project("proj1".into()))
        });
    });
}

fn bench_signature(c: &mut Criterion) {
    let body = vec![b'x'; 4096];
    let signature = sign(b"s3cret", &body).unwrap();

    c.bench_function("verify_signature 4KiB", |b| {
        b.iter(|| verify_signature(b"s3cret", black_box(&body), &signature).unwrap());
    });
}

criterion_group!(
    benches,
    bench_cluster_filter,
    bench_record_conversion,
    bench_signature
);
criterion_main!(benches);
