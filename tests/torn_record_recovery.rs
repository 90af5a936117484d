use std::sync::Arc;

use commitlog::segment::segment_filename;
use commitlog::{CommitLog, CommitLogConfig, MessageExt, NullDispatchSink, ShutdownKind};
use tempfile::tempdir;

fn config(dir: &std::path::Path) -> CommitLogConfig {
    let mut config = CommitLogConfig::default();
    config.store_path_commit_log = dir.to_path_buf();
    config.mapped_file_size_commit_log = 4096;
    config
}

#[test]
fn reopening_after_a_torn_trailing_record_truncates_to_the_last_good_one() {
    let dir = tempdir().expect("tempdir");
    let good_end = {
        let engine = CommitLog::open(config(dir.path()), Arc::new(NullDispatchSink), ShutdownKind::Clean)
            .expect("open");
        engine
            .put(MessageExt::new("orders", vec![1, 2, 3]), false)
            .expect("put good record");
        let good_end = engine.max_offset();
        let torn = engine
            .put(MessageExt::new("orders", vec![4, 5, 6, 7, 8]), false)
            .expect("put torn record");
        engine.shutdown();

        // Simulate a crash mid-write: corrupt the second record's magic
        // bytes on disk so it no longer parses.
        let path = dir.path().join(segment_filename(0));
        let mut bytes = std::fs::read(&path).expect("read segment file");
        bytes[torn.physical_offset as usize + 4] ^= 0xFF;
        std::fs::write(&path, bytes).expect("write segment file");

        good_end
    };

    let reopened = CommitLog::open(config(dir.path()), Arc::new(NullDispatchSink), ShutdownKind::Clean)
        .expect("reopen");
    assert_eq!(reopened.max_offset(), good_end);
    let decoded = reopened
        .read_record(0)
        .expect("read good record")
        .expect("good record still present");
    assert_eq!(decoded.body, vec![1, 2, 3]);
    reopened.shutdown();
}
