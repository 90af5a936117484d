use std::sync::Arc;

use commitlog::config::FlushDiskType;
use commitlog::{CommitLog, CommitLogConfig, MessageExt, NullDispatchSink, ShutdownKind};
use tempfile::tempdir;

fn config(dir: &std::path::Path, flush_disk_type: FlushDiskType) -> CommitLogConfig {
    let mut config = CommitLogConfig::default();
    config.store_path_commit_log = dir.to_path_buf();
    config.mapped_file_size_commit_log = 4096;
    config.flush_disk_type = flush_disk_type;
    config
}

#[test]
fn sync_put_reports_durable_before_returning() {
    let dir = tempdir().expect("tempdir");
    let engine = CommitLog::open(
        config(dir.path(), FlushDiskType::Sync),
        Arc::new(NullDispatchSink),
        ShutdownKind::Clean,
    )
    .expect("open");

    let result = engine
        .put(MessageExt::new("orders", vec![1, 2, 3]), true)
        .expect("put");
    assert!(result.is_ok());
    engine.shutdown();
}

#[test]
fn async_put_returns_without_waiting_on_the_background_flusher() {
    let dir = tempdir().expect("tempdir");
    let mut config = config(dir.path(), FlushDiskType::Async);
    config.flush_interval_commit_log_ms = 20;
    config.flush_commit_log_least_pages = 0;
    let engine = CommitLog::open(config, Arc::new(NullDispatchSink), ShutdownKind::Clean).expect("open");

    let result = engine
        .put(MessageExt::new("orders", vec![1, 2, 3]), true)
        .expect("put");
    assert!(result.is_ok());

    // A manual flush still reaches the same durable point a sync wait would
    // have blocked on, confirming the async path never silently drops data.
    let flushed = engine.flush(0).expect("flush");
    assert_eq!(flushed, engine.max_offset());
    engine.shutdown();
}
