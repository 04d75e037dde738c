//! Verbatim Search Benchmarks
//!
//! Benchmarks for the hot, allocation-heavy parts of the search pipeline.
//! Run with: cargo bench -p verbatim-core

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use chrono::{TimeZone, Utc};
use verbatim_core::index::{sanitize_fts5_query, IndexHit};
use verbatim_core::search::{merge_ranked, normalize_hits, SearchWidener, WideningLevel};
use verbatim_core::{cosine_similarity, ResultSource};

fn make_hits(prefix: &str, n: usize) -> Vec<IndexHit> {
    (0..n)
        .map(|i| IndexHit {
            document_id: format!("{prefix}-{i}"),
            channel: "bench".to_string(),
            published_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, i as u32 % 60).unwrap(),
            score: 1.0 - i as f32 / n as f32,
        })
        .collect()
}

fn bench_sanitize_fts5(c: &mut Criterion) {
    c.bench_function("sanitize_fts5_query", |b| {
        b.iter(|| {
            black_box(sanitize_fts5_query(
                "rust async runtime OR tokio sched* special-chars!@#",
            ));
        })
    });
}

fn bench_widener_transforms(c: &mut Criterion) {
    let widener = SearchWidener::new();
    let query = "debugging verl training runs on gpu clusters";

    let mut group = c.benchmark_group("widener_transform");
    for level in WideningLevel::ALL {
        group.bench_function(level.as_str(), |b| {
            b.iter(|| {
                black_box(widener.transform(level, query));
            })
        });
    }
    group.finish();
}

fn bench_normalize(c: &mut Criterion) {
    let hits = make_hits("doc", 100);

    c.bench_function("normalize_100_hits", |b| {
        b.iter(|| {
            black_box(normalize_hits(&hits, ResultSource::Primary));
        })
    });
}

fn bench_merge_ranked(c: &mut Criterion) {
    // 25-document overlap between the two sources
    let primary = normalize_hits(&make_hits("doc", 50), ResultSource::Primary);
    let secondary: Vec<_> = normalize_hits(&make_hits("doc", 75), ResultSource::Secondary)
        .into_iter()
        .skip(25)
        .collect();

    c.bench_function("merge_50x50_overlap_25", |b| {
        b.iter(|| {
            black_box(merge_ranked(primary.clone(), secondary.clone(), 20));
        })
    });
}

fn bench_cosine_similarity(c: &mut Criterion) {
    let a: Vec<f32> = (0..256).map(|i| (i as f32).sin()).collect();
    let b: Vec<f32> = (0..256).map(|i| (i as f32).cos()).collect();

    c.bench_function("cosine_similarity_256d", |b_bench| {
        b_bench.iter(|| {
            black_box(cosine_similarity(&a, &b));
        })
    });
}

criterion_group!(
    benches,
    bench_sanitize_fts5,
    bench_widener_transforms,
    bench_normalize,
    bench_merge_ranked,
    bench_cosine_similarity,
);
criterion_main!(benches);
