//! Benchmarks for multibag planning and name selection

use bagsmith::multibag::{latest, plan_shards, PlannedFile};
use bagsmith::{BagName, SplitterConfig};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn content(count: usize) -> Vec<PlannedFile> {
    (0..count)
        .map(|i| {
            let folder = i % 37;
            let size = 10_000 + ((i * 7919) % 5_000_000) as u64;
            PlannedFile::new(format!("data/d{}/f{}.bin", folder, i), size)
        })
        .collect()
}

fn benchmark_plan(c: &mut Criterion) {
    let mut group = c.benchmark_group("plan_shards");
    let config = SplitterConfig {
        max_size: 100_000_000,
        target_size: 80_000_000,
        head_target_size: 10_000_000,
        ..SplitterConfig::default()
    };
    let head = vec![PlannedFile::new("metadata/nerdm.json", 4_000)];

    for count in [100, 1_000, 10_000].iter() {
        let files = content(*count);
        group.bench_with_input(BenchmarkId::from_parameter(count), &files, |b, files| {
            b.iter(|| plan_shards(black_box(files.clone()), head.clone(), &config));
        });
    }

    group.finish();
}

fn benchmark_latest(c: &mut Criterion) {
    let mut group = c.benchmark_group("latest_name");

    for count in [10, 100, 1_000].iter() {
        let names: Vec<String> = (0..*count)
            .map(|i| BagName::new("mds2-2106", format!("1.{}", i % 7), "0.4", i as u32).to_string())
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(count), &names, |b, names| {
            b.iter(|| latest(black_box(names.iter().map(String::as_str))));
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_plan, benchmark_latest);
criterion_main!(benches);
