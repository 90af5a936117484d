//! C6: crash-recovery scans (§4.6). Runs once, single-threaded, at engine
//! startup — before any `Appender`/`Flusher` is wired up, so it can freely
//! rewind segment cursors without racing a concurrent writer.
//!
//! Both variants share the same forward-scan primitive
//! (`scan_segment`/`record::check_and_decode`); they differ only in where
//! the scan starts and whether each valid record is re-dispatched to
//! rebuild downstream indices.

use std::sync::Arc;

use crate::dispatch::{DispatchRequest, DispatchSink};
use crate::error::Result;
use crate::record::{self, CheckResult, DecodedRecord};
use crate::segment::Segment;
use crate::segment_queue::SegmentQueue;

/// How many of the most recent segments normal recovery re-scans. Load
/// bearing but not justified in the source this is distilled from (§9 open
/// questions) — kept exactly as specified to cap worst-case recovery IO at
/// `3 * segment_size`.
const NORMAL_RECOVERY_LOOKBACK: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryOutcome {
    /// The physical offset recovery settled on; everything at or after this
    /// point was truncated as torn or never durable.
    pub committed_where: u64,
}

/// Clean-shutdown recovery (§4.6 "Normal recovery"): start scanning from
/// `max(0, N - 3)` and trust that every byte below that is already valid
/// (it was flushed and the broker exited cleanly). Never re-dispatches —
/// downstream indices were already built live during normal operation.
pub fn recover_normally(queue: &SegmentQueue, check_crc: bool) -> Result<RecoveryOutcome> {
    let segments = queue.all_segments();
    if segments.is_empty() {
        return Ok(RecoveryOutcome { committed_where: 0 });
    }
    let start_index = segments.len().saturating_sub(NORMAL_RECOVERY_LOOKBACK);
    let committed_where = scan_from(&segments, start_index, check_crc, None)?;
    queue.truncate_dirty_files(committed_where)?;
    Ok(RecoveryOutcome { committed_where })
}

/// Unclean-shutdown recovery (§4.6 "Abnormal recovery"): find the latest
/// segment whose first record looks valid and was stored no later than the
/// checkpoint's minimum known-durable timestamp, then scan forward from
/// there, re-dispatching every valid record so downstream indices (which
/// may themselves have lost their tail) are rebuilt in step with the log.
pub fn recover_abnormally(
    queue: &SegmentQueue,
    dispatch: &dyn DispatchSink,
    checkpoint_min_timestamp: i64,
    check_crc: bool,
) -> Result<RecoveryOutcome> {
    let segments = queue.all_segments();
    if segments.is_empty() {
        return Ok(RecoveryOutcome { committed_where: 0 });
    }
    let start_index = locate_abnormal_start(&segments, checkpoint_min_timestamp)?;
    let committed_where = scan_from(&segments, start_index, check_crc, Some(dispatch))?;
    queue.truncate_dirty_files(committed_where)?;
    dispatch.truncate_above(committed_where)?;
    Ok(RecoveryOutcome { committed_where })
}

/// Walk segments back-to-front looking for the newest one whose first
/// record has a valid (data) magic and a `StoreTimestamp` at or before the
/// checkpoint floor. Falls back to the earliest segment if none qualify,
/// which forces a full rescan rather than risk skipping valid data.
fn locate_abnormal_start(segments: &[Arc<Segment>], checkpoint_min_timestamp: i64) -> Result<usize> {
    for (index, segment) in segments.iter().enumerate().rev() {
        if let Some((magic, store_timestamp)) = peek_first_record(segment)? {
            if magic == record::DATA_MAGIC && store_timestamp <= checkpoint_min_timestamp {
                return Ok(index);
            }
        }
    }
    Ok(0)
}

fn peek_first_record(segment: &Arc<Segment>) -> Result<Option<(u32, i64)>> {
    let probe_len = record::FIXED_PREFIX_LEN.min(segment.capacity());
    if probe_len < 8 {
        return Ok(None);
    }
    let view = segment.select_view(0, probe_len)?;
    let bytes = view.bytes()?;
    Ok(record::peek_header(&bytes))
}

/// Scan every segment from `start_index` to the end of `segments`, stopping
/// at the first torn or invalid record. Returns the global physical offset
/// the scan reached.
fn scan_from(
    segments: &[Arc<Segment>],
    start_index: usize,
    check_crc: bool,
    dispatch: Option<&dyn DispatchSink>,
) -> Result<u64> {
    if segments.is_empty() {
        return Ok(0);
    }
    let mut committed_where = segments[start_index].base_offset();
    for segment in &segments[start_index..] {
        let mapped_offset = scan_segment(segment, check_crc, dispatch)?;
        committed_where = segment.base_offset() + mapped_offset as u64;
        if mapped_offset < segment.capacity() {
            break;
        }
    }
    Ok(committed_where)
}

/// Forward-scan one segment from its start, classifying each frame via
/// `checkReturnSize` (§4.6): a positive-size record advances the cursor and
/// optionally re-dispatches; a padding frame jumps straight to the
/// segment's end (the remaining bytes are by construction all padding); an
/// invalid/torn frame stops the scan in place.
fn scan_segment(
    segment: &Arc<Segment>,
    check_crc: bool,
    dispatch: Option<&dyn DispatchSink>,
) -> Result<usize> {
    let capacity = segment.capacity();
    let view = segment.select_view(0, capacity)?;
    let bytes = view.bytes()?;

    let mut pos = 0usize;
    while pos < capacity {
        match record::check_and_decode(&bytes[pos..], check_crc) {
            CheckResult::Record { record, size } => {
                if let Some(sink) = dispatch {
                    sink.dispatch(&to_dispatch_request(
                        &record,
                        segment.base_offset() + pos as u64,
                        size,
                    ))?;
                }
                pos += size;
            }
            CheckResult::Padding => {
                pos = capacity;
            }
            CheckResult::Invalid => {
                break;
            }
        }
    }
    Ok(pos)
}

fn to_dispatch_request(record: &DecodedRecord, physical_offset: u64, size: usize) -> DispatchRequest {
    DispatchRequest {
        topic: record.topic.clone(),
        queue_id: record.queue_id,
        physical_offset,
        size,
        tags_code: 0,
        store_timestamp: record.store_timestamp,
        queue_offset: record.queue_offset,
        keys: record::extract_key_property(&record.properties),
        sys_flag: record.sys_flag,
        prepared_txn_offset: record.prepared_txn_offset,
    }
}
