//! Wires C1–C7 and their collaborators (§6) into `CommitLog`, the single
//! entry point a broker embeds. Construction performs recovery exactly
//! once; `put` runs the `Appender`'s critical section and then — outside
//! any lock, per §5 "Suspension points" — honors the requested durability
//! fidelity and, for a `SyncMaster`, the HA hand-off.

use std::sync::Arc;
use std::time::Duration;

use crate::appender::{AppendStatus, Appender};
use crate::checkpoint::StoreCheckpoint;
use crate::clock::{Clock, SystemClock};
use crate::config::{BrokerRole, CommitLogConfig, FlushDiskType};
use crate::dispatch::DispatchSink;
use crate::error::Result;
use crate::flusher::{AsyncFlusher, OnFlush, SyncGroupFlusher};
use crate::ha::{HAService, NoopHAService};
use crate::record::{self, CheckResult, DecodedRecord, MessageExt};
use crate::recoverer::{self, RecoveryOutcome};
use crate::segment_queue::SegmentQueue;

/// §6 `PutResult` statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStatus {
    PutOk,
    FlushDiskTimeout,
    FlushSlaveTimeout,
    SlaveNotAvailable,
    MessageIllegal,
    CreateSegmentFailed,
    UnknownError,
}

/// §6 `PutResult { status, appendResult }`, flattened into one struct.
#[derive(Debug, Clone)]
pub struct PutResult {
    pub status: PutStatus,
    pub msg_id: String,
    pub queue_offset: u64,
    pub physical_offset: u64,
    pub wrote_bytes: usize,
    pub store_timestamp: i64,
}

impl PutResult {
    pub fn is_ok(&self) -> bool {
        self.status == PutStatus::PutOk
    }
}

/// Whether the previous run shut down cleanly. Detecting this (typically a
/// marker file written on graceful shutdown and removed on startup) is the
/// broker's storage manager's job — out of scope here (§1) — so the caller
/// tells the engine which recovery path to take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownKind {
    Clean,
    Unclean,
}

enum EngineFlusher {
    Async(AsyncFlusher),
    Sync(SyncGroupFlusher),
}

/// The append-only commit-log engine (§1–§2): owns the segment queue, the
/// single-writer appender, the flusher appropriate to `flushDiskType`, and
/// the collaborators consumed through trait objects (§6).
pub struct CommitLog {
    config: Arc<CommitLogConfig>,
    clock: Arc<dyn Clock>,
    segment_queue: Arc<SegmentQueue>,
    appender: Appender,
    ha: Arc<dyn HAService>,
    checkpoint: Option<Arc<StoreCheckpoint>>,
    flusher: EngineFlusher,
    recovery: RecoveryOutcome,
}

impl CommitLog {
    /// Open with the default `SystemClock` and no HA/checkpoint
    /// collaborators — a single-node `AsyncMaster` broker with no slave.
    pub fn open(
        config: CommitLogConfig,
        dispatch: Arc<dyn DispatchSink>,
        shutdown_kind: ShutdownKind,
    ) -> Result<Self> {
        Self::open_with(
            config,
            Arc::new(SystemClock),
            dispatch,
            Arc::new(NoopHAService),
            None,
            shutdown_kind,
        )
    }

    /// Open with every collaborator explicit — the constructor a broker
    /// with HA replication and a real checkpoint file uses.
    pub fn open_with(
        config: CommitLogConfig,
        clock: Arc<dyn Clock>,
        dispatch: Arc<dyn DispatchSink>,
        ha: Arc<dyn HAService>,
        checkpoint: Option<Arc<StoreCheckpoint>>,
        shutdown_kind: ShutdownKind,
    ) -> Result<Self> {
        let config = Arc::new(config);
        let segment_queue = Arc::new(SegmentQueue::load(
            config.store_path_commit_log.clone(),
            config.mapped_file_size_commit_log,
        )?);

        let recovery = match shutdown_kind {
            ShutdownKind::Clean => {
                recoverer::recover_normally(&segment_queue, config.check_crc_on_recover)?
            }
            ShutdownKind::Unclean => {
                let floor = match &checkpoint {
                    Some(checkpoint) => checkpoint.min_timestamp()?,
                    None => i64::MAX,
                };
                recoverer::recover_abnormally(
                    &segment_queue,
                    dispatch.as_ref(),
                    floor,
                    config.check_crc_on_recover,
                )?
            }
        };

        if let Some(checkpoint) = &checkpoint {
            checkpoint.set_phys_msg_timestamp(clock.now_millis())?;
        }

        let appender = Appender::new(
            config.clone(),
            clock.clone(),
            segment_queue.clone(),
            dispatch,
        );

        let flusher = match config.flush_disk_type {
            FlushDiskType::Async => EngineFlusher::Async(AsyncFlusher::start_with_checkpoint(
                segment_queue.clone(),
                Duration::from_millis(config.flush_interval_commit_log_ms),
                config.flush_commit_log_least_pages,
                Duration::from_millis(config.flush_commit_log_thorough_interval_ms),
                checkpoint_callback(&checkpoint, &clock),
            )),
            FlushDiskType::Sync => EngineFlusher::Sync(SyncGroupFlusher::start_with_checkpoint(
                segment_queue.clone(),
                checkpoint_callback(&checkpoint, &clock),
            )),
        };

        Ok(Self {
            config,
            clock,
            segment_queue,
            appender,
            ha,
            checkpoint,
            flusher,
            recovery,
        })
    }

    pub fn recovery_outcome(&self) -> RecoveryOutcome {
        self.recovery
    }

    pub fn max_offset(&self) -> u64 {
        self.segment_queue.max_offset()
    }

    pub fn min_offset(&self) -> u64 {
        self.segment_queue.min_offset()
    }

    pub fn checkpoint(&self) -> Option<&Arc<StoreCheckpoint>> {
        self.checkpoint.as_ref()
    }

    /// `put` (§4.4 step 9 onward). `wait_store_msg_ok` mirrors the
    /// producer-supplied flag that decides whether to block for durability
    /// (and, for a `SyncMaster`, slave acknowledgement) before returning.
    pub fn put(&self, msg: MessageExt, wait_store_msg_ok: bool) -> Result<PutResult> {
        let outcome = self.appender.put(msg)?;
        let mut result = PutResult {
            status: map_status(outcome.status),
            msg_id: outcome.msg_id,
            queue_offset: outcome.queue_offset,
            physical_offset: outcome.physical_offset,
            wrote_bytes: outcome.wrote_bytes,
            store_timestamp: outcome.store_timestamp,
        };
        if !result.is_ok() || !wait_store_msg_ok {
            return Ok(result);
        }

        let next_offset = outcome.physical_offset + outcome.wrote_bytes as u64;
        let timeout = Duration::from_millis(self.config.sync_flush_timeout_ms);

        match &self.flusher {
            EngineFlusher::Sync(flusher) => {
                if !flusher.put_request(next_offset, timeout) {
                    result.status = PutStatus::FlushDiskTimeout;
                    return Ok(result);
                }
            }
            EngineFlusher::Async(flusher) => flusher.wake(),
        }

        if self.config.broker_role == BrokerRole::SyncMaster {
            if !self.ha.is_slave_ok(next_offset) {
                result.status = PutStatus::SlaveNotAvailable;
                return Ok(result);
            }
            if !self.ha.put_request(next_offset, timeout) {
                result.status = PutStatus::FlushSlaveTimeout;
                return Ok(result);
            }
            self.ha.wake_up();
        }

        Ok(result)
    }

    /// Decode the record living at `physical_offset`, if any has been
    /// published that far (§4.2 "read-side views").
    pub fn read_record(&self, physical_offset: u64) -> Result<Option<DecodedRecord>> {
        let Some(segment) = self.segment_queue.find_by_offset(physical_offset, false) else {
            return Ok(None);
        };
        let local_offset = (physical_offset - segment.base_offset()) as usize;
        let remaining = segment.wrote().saturating_sub(local_offset);
        if remaining == 0 {
            return Ok(None);
        }
        let view = segment.select_view(local_offset, remaining)?;
        let bytes = view.bytes()?;
        match record::check_and_decode(&bytes, self.config.check_crc_on_recover) {
            CheckResult::Record { record, .. } => Ok(Some(record)),
            _ => Ok(None),
        }
    }

    /// Force a manual flush outside the regular flusher cadence (e.g. a
    /// broker-initiated checkpoint before a planned restart).
    pub fn flush(&self, least_pages: usize) -> Result<u64> {
        let offset = self.segment_queue.flush(least_pages)?;
        if let Some(checkpoint) = &self.checkpoint {
            checkpoint.set_phys_msg_timestamp(self.clock.now_millis())?;
        }
        Ok(offset)
    }

    pub fn delete_expired(
        &self,
        expire_millis: u64,
        force_after: Duration,
        immediate: bool,
    ) -> Result<Vec<u64>> {
        self.segment_queue.delete_expired(expire_millis, force_after, immediate)
    }

    /// Stop the flusher thread, draining any in-flight requests first.
    /// Does not close the segment files — `Drop` on the owned `Arc`s
    /// handles that once the last reference goes away.
    pub fn shutdown(&self) {
        match &self.flusher {
            EngineFlusher::Async(flusher) => flusher.shutdown(),
            EngineFlusher::Sync(flusher) => flusher.shutdown(),
        }
    }
}

fn checkpoint_callback(checkpoint: &Option<Arc<StoreCheckpoint>>, clock: &Arc<dyn Clock>) -> Option<OnFlush> {
    let checkpoint = checkpoint.clone()?;
    let clock = clock.clone();
    Some(Arc::new(move || {
        let _ = checkpoint.set_phys_msg_timestamp(clock.now_millis());
    }))
}

fn map_status(status: AppendStatus) -> PutStatus {
    match status {
        AppendStatus::PutOk => PutStatus::PutOk,
        AppendStatus::MessageIllegal => PutStatus::MessageIllegal,
        AppendStatus::CreateSegmentFailed => PutStatus::CreateSegmentFailed,
        AppendStatus::UnknownError => PutStatus::UnknownError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{NullDispatchSink, RecordingDispatchSink};
    use tempfile::tempdir;

    struct SlaveNotCaughtUp;
    impl HAService for SlaveNotCaughtUp {
        fn is_slave_ok(&self, _offset: u64) -> bool {
            false
        }
        fn put_request(&self, _offset: u64, _timeout: Duration) -> bool {
            unreachable!("put should return SlaveNotAvailable before ever enqueuing")
        }
        fn wake_up(&self) {}
    }

    fn config(dir: &std::path::Path, segment_size: usize) -> CommitLogConfig {
        let mut config = CommitLogConfig::default();
        config.store_path_commit_log = dir.to_path_buf();
        config.mapped_file_size_commit_log = segment_size;
        config
    }

    #[test]
    fn sync_put_blocks_until_durable_and_reports_put_ok() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path(), 4096);
        cfg.flush_disk_type = FlushDiskType::Sync;
        let dispatch = Arc::new(RecordingDispatchSink::new());
        let engine = CommitLog::open(cfg, dispatch.clone(), ShutdownKind::Clean).unwrap();

        let result = engine.put(MessageExt::new("orders", vec![1, 2, 3]), true).unwrap();
        assert!(result.is_ok());
        assert_eq!(dispatch.requests().len(), 1);
        engine.shutdown();
    }

    #[test]
    fn async_put_does_not_block_on_durability() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 4096);
        let dispatch = Arc::new(NullDispatchSink);
        let engine = CommitLog::open(cfg, dispatch, ShutdownKind::Clean).unwrap();

        let result = engine.put(MessageExt::new("orders", vec![1]), true).unwrap();
        assert!(result.is_ok());
        engine.shutdown();
    }

    #[test]
    fn sync_master_without_slave_caught_up_reports_slave_not_available() {
        let dir = tempdir().unwrap();
        let mut cfg = config(dir.path(), 4096);
        cfg.broker_role = BrokerRole::SyncMaster;
        cfg.flush_disk_type = FlushDiskType::Sync;
        let engine = CommitLog::open_with(
            cfg,
            Arc::new(SystemClock),
            Arc::new(NullDispatchSink),
            Arc::new(SlaveNotCaughtUp),
            None,
            ShutdownKind::Clean,
        )
        .unwrap();

        let result = engine.put(MessageExt::new("orders", vec![1]), true).unwrap();
        assert_eq!(result.status, PutStatus::SlaveNotAvailable);
        engine.shutdown();
    }

    #[test]
    fn read_record_decodes_a_previously_put_message() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 4096);
        let engine = CommitLog::open(cfg, Arc::new(NullDispatchSink), ShutdownKind::Clean).unwrap();

        let put = engine.put(MessageExt::new("orders", vec![9, 9, 9]), false).unwrap();
        let decoded = engine.read_record(put.physical_offset).unwrap().unwrap();
        assert_eq!(decoded.topic, "orders");
        assert_eq!(decoded.body, vec![9, 9, 9]);
        engine.shutdown();
    }

    #[test]
    fn reopening_after_clean_shutdown_recovers_max_offset() {
        let dir = tempdir().unwrap();
        let expected = {
            let cfg = config(dir.path(), 4096);
            let engine = CommitLog::open(cfg, Arc::new(NullDispatchSink), ShutdownKind::Clean).unwrap();
            engine.put(MessageExt::new("orders", vec![1, 2, 3]), false).unwrap();
            engine.put(MessageExt::new("orders", vec![4, 5]), false).unwrap();
            engine.flush(0).unwrap();
            engine.shutdown();
            engine.max_offset()
        };

        let cfg = config(dir.path(), 4096);
        let reopened = CommitLog::open(cfg, Arc::new(NullDispatchSink), ShutdownKind::Clean).unwrap();
        assert_eq!(reopened.max_offset(), expected);
        reopened.shutdown();
    }

    #[test]
    fn checkpoint_timestamp_advances_after_a_manual_flush() {
        let dir = tempdir().unwrap();
        let cfg = config(dir.path(), 4096);
        let checkpoint = Arc::new(StoreCheckpoint::open(dir.path().join("checkpoint")).unwrap());
        let engine = CommitLog::open_with(
            cfg,
            Arc::new(SystemClock),
            Arc::new(NullDispatchSink),
            Arc::new(NoopHAService),
            Some(checkpoint.clone()),
            ShutdownKind::Clean,
        )
        .unwrap();

        engine.put(MessageExt::new("orders", vec![1]), false).unwrap();
        engine.flush(0).unwrap();
        assert!(checkpoint.phys_msg_timestamp() > 0);
        engine.shutdown();
    }
}
