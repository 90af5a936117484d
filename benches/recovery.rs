use std::sync::Arc;

use commitlog::{CommitLog, CommitLogConfig, MessageExt, NullDispatchSink, ShutdownKind};
use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use tempfile::tempdir;

const RECORDS_PER_SEGMENT_SET: usize = 20_000;
const SEGMENT_SIZE: usize = 4 * 1024 * 1024;

fn populate(dir: &tempfile::TempDir) -> anyhow::Result<()> {
    let mut config = CommitLogConfig::default();
    config.store_path_commit_log = dir.path().to_path_buf();
    config.mapped_file_size_commit_log = SEGMENT_SIZE;
    let engine = CommitLog::open(config, Arc::new(NullDispatchSink), ShutdownKind::Clean)?;
    for _ in 0..RECORDS_PER_SEGMENT_SET {
        engine.put(MessageExt::new("bench-topic", vec![0u8; 128]), false)?;
    }
    engine.flush(0)?;
    engine.shutdown();
    Ok(())
}

/// Reopening pays for normal recovery's bounded rescan (§4.6): only the last
/// few segments are walked, regardless of how much history precedes them.
fn bench_normal_recovery(c: &mut Criterion) {
    c.bench_function("normal_recovery", |b| {
        b.iter_batched(
            || {
                let dir = tempdir().expect("tempdir");
                populate(&dir).expect("populate");
                dir
            },
            |dir| {
                let mut config = CommitLogConfig::default();
                config.store_path_commit_log = dir.path().to_path_buf();
                config.mapped_file_size_commit_log = SEGMENT_SIZE;
                let engine = CommitLog::open(config, Arc::new(NullDispatchSink), ShutdownKind::Clean)
                    .expect("reopen");
                engine.shutdown();
            },
            BatchSize::LargeInput,
        );
    });
}

fn bench_abnormal_recovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("abnormal_recovery");
    group.bench_with_input(
        BenchmarkId::from_parameter(RECORDS_PER_SEGMENT_SET),
        &RECORDS_PER_SEGMENT_SET,
        |b, _| {
            b.iter_batched(
                || {
                    let dir = tempdir().expect("tempdir");
                    populate(&dir).expect("populate");
                    dir
                },
                |dir| {
                    let mut config = CommitLogConfig::default();
                    config.store_path_commit_log = dir.path().to_path_buf();
                    config.mapped_file_size_commit_log = SEGMENT_SIZE;
                    let checkpoint = Arc::new(
                        commitlog::StoreCheckpoint::open(dir.path().join("checkpoint")).expect("checkpoint"),
                    );
                    let engine = CommitLog::open_with(
                        config,
                        Arc::new(commitlog::SystemClock),
                        Arc::new(NullDispatchSink),
                        Arc::new(commitlog::NoopHAService),
                        Some(checkpoint),
                        ShutdownKind::Unclean,
                    )
                    .expect("reopen abnormally");
                    engine.shutdown();
                },
                BatchSize::LargeInput,
            );
        },
    );
    group.finish();
}

criterion_group!(benches, bench_normal_recovery, bench_abnormal_recovery);
criterion_main!(benches);
