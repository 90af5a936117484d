//! C4: the single-writer critical section (§4.4). `Appender::put` is the
//! only place that assigns physical offsets and per-`(topic, queueId)`
//! queue offsets, so everything here runs under one put-lock — but the
//! lock is held only across reservation/encoding/dispatch (§5 "Critical
//! sections"), never across a durability wait.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc as StdArc, Mutex, MutexGuard};
use std::time::Instant;

use crate::clock::Clock;
use crate::config::CommitLogConfig;
use crate::dispatch::{DispatchRequest, DispatchSink};
use crate::error::Result;
use crate::record::{self, sys_flag, MessageExt};
use crate::segment::{ReserveOutcome, Segment};
use crate::segment_queue::SegmentQueue;

/// `SCHEDULE_TOPIC` rewrite target for delayed messages (§4.4 step 1).
pub const SCHEDULE_TOPIC: &str = "SCHEDULE_TOPIC_XXXX";

/// Highest delay level accepted before clamping. The source table this is
/// distilled from enumerates 18 discrete delay levels (1s .. 2h); §4.4
/// only says "clamp delayLevel", so this constant is the Open Question
/// resolution recorded in DESIGN.md.
pub const MAX_DELAY_LEVEL: i32 = 18;

/// `queueIdFromDelayLevel` (§4.4 step 1): each delay level gets its own
/// queue within `SCHEDULE_TOPIC`, levels are 1-based.
pub fn queue_id_from_delay_level(delay_level: i32) -> i32 {
    delay_level.clamp(1, MAX_DELAY_LEVEL) - 1
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendStatus {
    PutOk,
    MessageIllegal,
    CreateSegmentFailed,
    UnknownError,
}

/// Everything the engine needs to decide on durability/HA after the
/// put-lock has already been released (§4.4 step 9 happens outside).
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub status: AppendStatus,
    pub msg_id: String,
    pub queue_offset: u64,
    pub physical_offset: u64,
    pub wrote_bytes: usize,
    pub store_timestamp: i64,
    pub sys_flag: i32,
}

struct AppenderState {
    topic_queue_table: HashMap<(String, i32), u64>,
}

/// Adaptive spin-lock or blocking mutex over the `TopicQueueTable`, per
/// `useReentrantLockWhenPutMessage` (§4.4 "Put-lock").
struct PutLock {
    state: Mutex<AppenderState>,
    spin: bool,
}

impl PutLock {
    fn new(spin: bool) -> Self {
        Self {
            state: Mutex::new(AppenderState {
                topic_queue_table: HashMap::new(),
            }),
            spin,
        }
    }

    fn acquire(&self) -> MutexGuard<'_, AppenderState> {
        if !self.spin {
            return self.state.lock().expect("put lock poisoned");
        }
        let mut spins = 0u32;
        loop {
            if let Ok(guard) = self.state.try_lock() {
                return guard;
            }
            if spins < 1000 {
                std::hint::spin_loop();
                spins += 1;
            } else {
                std::thread::yield_now();
            }
        }
    }
}

pub struct Appender {
    config: StdArc<CommitLogConfig>,
    clock: StdArc<dyn Clock>,
    segment_queue: StdArc<SegmentQueue>,
    dispatch: StdArc<dyn DispatchSink>,
    lock: PutLock,
    /// Monotonically increasing count of puts that were retried exactly
    /// once after `EndOfFile`, purely observational (tests/metrics hook).
    rotations: AtomicU64,
}

impl Appender {
    pub fn new(
        config: StdArc<CommitLogConfig>,
        clock: StdArc<dyn Clock>,
        segment_queue: StdArc<SegmentQueue>,
        dispatch: StdArc<dyn DispatchSink>,
    ) -> Self {
        let spin = !config.use_reentrant_lock_when_put_message;
        Self {
            config,
            clock,
            segment_queue,
            dispatch,
            lock: PutLock::new(spin),
            rotations: AtomicU64::new(0),
        }
    }

    pub fn rotations(&self) -> u64 {
        self.rotations.load(Ordering::Relaxed)
    }

    /// `put` (§4.4). Performs steps 1-7 under the put-lock; the caller
    /// (`CommitLog`) handles durability/HA waits afterward.
    ///
    /// Encoding (§4.3) happens into this thread's reusable staging buffer
    /// *before* the put-lock is acquired (§5 "Critical sections": encoding
    /// happens outside the lock) — only reservation, the reserved-field
    /// patch, and the copy into the mapped slice run while it is held.
    pub fn put(&self, mut msg: MessageExt) -> Result<AppendOutcome> {
        apply_delay_rewrite(&mut msg);

        let topic_len = msg.topic.as_bytes().len();
        let props_len = msg.properties.as_bytes().len();
        let total_size = record::compute_length(msg.body.len(), topic_len, props_len);
        if total_size > self.config.max_message_size {
            return Ok(AppendOutcome {
                status: AppendStatus::MessageIllegal,
                msg_id: String::new(),
                queue_offset: 0,
                physical_offset: 0,
                wrote_bytes: 0,
                store_timestamp: 0,
                sys_flag: msg.sys_flag,
            });
        }

        record::with_staging_buffer(total_size, |buf| {
            record::encode(&msg, buf)?;

            let lock_start = Instant::now();
            let outcome = self.put_locked(&msg, buf);
            let held = lock_start.elapsed();
            if held.as_millis() > 1000 {
                log::warn!("put-lock held for {}ms, exceeding the 1000ms budget", held.as_millis());
            }
            outcome
        })
    }

    fn put_locked(&self, msg: &MessageExt, buf: &mut Vec<u8>) -> Result<AppendOutcome> {
        let mut guard = self.lock.acquire();

        let tail = match self.segment_queue.ensure_tail() {
            Ok(tail) => tail,
            Err(err) => {
                log::error!("failed to create segment for put: {err}");
                return Ok(AppendOutcome {
                    status: AppendStatus::CreateSegmentFailed,
                    msg_id: String::new(),
                    queue_offset: 0,
                    physical_offset: 0,
                    wrote_bytes: 0,
                    store_timestamp: 0,
                    sys_flag: msg.sys_flag,
                });
            }
        };

        match self.try_append(&mut guard, &tail, msg, buf)? {
            TryAppend::Done(outcome) => Ok(outcome),
            TryAppend::EndOfFile => {
                let next = self.segment_queue.rotate(&tail)?;
                self.rotations.fetch_add(1, Ordering::Relaxed);
                match self.try_append(&mut guard, &next, msg, buf)? {
                    TryAppend::Done(outcome) => Ok(outcome),
                    TryAppend::EndOfFile => {
                        log::error!(
                            "[BUG] second EndOfFile immediately after rotation for topic {}",
                            msg.topic
                        );
                        Ok(AppendOutcome {
                            status: AppendStatus::UnknownError,
                            msg_id: String::new(),
                            queue_offset: 0,
                            physical_offset: 0,
                            wrote_bytes: 0,
                            store_timestamp: 0,
                            sys_flag: msg.sys_flag,
                        })
                    }
                }
            }
        }
    }

    fn try_append(
        &self,
        guard: &mut MutexGuard<'_, AppenderState>,
        segment: &StdArc<Segment>,
        msg: &MessageExt,
        buf: &mut Vec<u8>,
    ) -> Result<TryAppend> {
        let total_size = buf.len();
        // §4.4 step 4: a segment must never be left with 1..MIN_PADDING-1
        // bytes of unframeable slack, so end-of-file is declared as soon as
        // the record plus a minimal padding frame would no longer fit —
        // not only when the record itself doesn't fit.
        if total_size + record::MIN_PADDING > segment.remaining() {
            return Ok(TryAppend::EndOfFile);
        }
        match segment.reserve(total_size) {
            ReserveOutcome::EndOfFile { .. } => Ok(TryAppend::EndOfFile),
            ReserveOutcome::Reserved {
                local_offset,
                physical_offset,
            } => {
                let is_prepared_or_rollback = sys_flag::is_prepared_or_rollback(msg.sys_flag);
                let queue_offset = if is_prepared_or_rollback {
                    0
                } else {
                    next_queue_offset(guard, &msg.topic, msg.queue_id)
                };
                let store_timestamp = self.clock.now_millis();

                record::patch_reserved_fields(buf, queue_offset, physical_offset, store_timestamp);
                segment.write_and_publish(local_offset, buf)?;

                if sys_flag::is_not_or_commit(msg.sys_flag) {
                    advance_queue_offset(guard, &msg.topic, msg.queue_id);
                }

                let msg_id = record::create_message_id(msg.store_host, physical_offset);

                let request = DispatchRequest {
                    topic: msg.topic.clone(),
                    queue_id: msg.queue_id,
                    physical_offset,
                    size: total_size,
                    tags_code: 0,
                    store_timestamp,
                    queue_offset,
                    keys: record::extract_key_property(&msg.properties),
                    sys_flag: msg.sys_flag,
                    prepared_txn_offset: msg.prepared_txn_offset,
                };
                self.dispatch.dispatch(&request)?;

                Ok(TryAppend::Done(AppendOutcome {
                    status: AppendStatus::PutOk,
                    msg_id,
                    queue_offset,
                    physical_offset,
                    wrote_bytes: total_size,
                    store_timestamp,
                    sys_flag: msg.sys_flag,
                }))
            }
        }
    }
}

enum TryAppend {
    Done(AppendOutcome),
    EndOfFile,
}

fn next_queue_offset(guard: &MutexGuard<'_, AppenderState>, topic: &str, queue_id: i32) -> u64 {
    *guard
        .topic_queue_table
        .get(&(topic.to_string(), queue_id))
        .unwrap_or(&0)
}

fn advance_queue_offset(guard: &mut MutexGuard<'_, AppenderState>, topic: &str, queue_id: i32) {
    let entry = guard
        .topic_queue_table
        .entry((topic.to_string(), queue_id))
        .or_insert(0);
    *entry += 1;
}

/// `§4.4 step 1`: if the message is not transactional-prepared/rollback and
/// carries a `delayLevel` property, rewrite it onto `SCHEDULE_TOPIC` and
/// stash the real destination in properties.
fn apply_delay_rewrite(msg: &mut MessageExt) {
    if sys_flag::is_prepared_or_rollback(msg.sys_flag) {
        return;
    }
    let delay_level = match read_delay_level(&msg.properties) {
        Some(level) if level > 0 => level,
        _ => return,
    };
    let delay_level = delay_level.clamp(1, MAX_DELAY_LEVEL);

    let real_topic = msg.topic.clone();
    let real_queue_id = msg.queue_id;

    let mut properties = String::new();
    for pair in msg.properties.split('\u{1}') {
        if pair.is_empty() || pair.starts_with("DELAY=") {
            continue;
        }
        if !properties.is_empty() {
            properties.push('\u{1}');
        }
        properties.push_str(pair);
    }
    record::append_property(&mut properties, "REAL_TOPIC", &real_topic);
    record::append_property(&mut properties, "REAL_QID", &real_queue_id.to_string());

    msg.properties = properties;
    msg.topic = SCHEDULE_TOPIC.to_string();
    msg.queue_id = queue_id_from_delay_level(delay_level);
}

fn read_delay_level(properties: &str) -> Option<i32> {
    for pair in properties.split('\u{1}') {
        if let Some(value) = pair.strip_prefix("DELAY=") {
            return value.parse::<i32>().ok();
        }
    }
    None
}
