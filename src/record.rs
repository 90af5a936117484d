//! Wire format for a single commit-log record (§3).
//!
//! A record is a self-delimiting big-endian frame: a 4-byte `TotalSize`
//! followed by a 4-byte `MagicCode` that distinguishes a real data record
//! from an end-of-segment padding frame, followed (for data records) by a
//! fixed 84-byte prefix of scalar fields and three variable-length sections
//! (body, topic, properties), each preceded by its own length.
//!
//! Fields 6 (`QueueOffset`), 7 (`PhysicalOffset`) and 11 (`StoreTimestamp`)
//! are written as zero by `encode` and patched in place by the `Appender`
//! once it has reserved a position under the put-lock — see
//! `patch_reserved_fields`.

use std::cell::RefCell;

use crate::error::{Error, Result};

pub const DATA_MAGIC: u32 = 0xDAA3_20A7;
pub const PAD_MAGIC: u32 = 0xCBD4_3194;

/// Minimum bytes a padding frame needs (`TotalSize` + `MagicCode`). A
/// segment must never be left with 1..7 bytes of unframeable slack.
pub const MIN_PADDING: usize = 8;

pub const MAX_TOPIC_LEN: usize = 127;
pub const MAX_PROPS_LEN: usize = 32_767;

/// Bytes occupied by fields 1–14 (everything before the variable-length
/// body/topic/properties sections).
pub const FIXED_PREFIX_LEN: usize = 84;

const OFF_TOTAL_SIZE: usize = 0;
const OFF_MAGIC: usize = 4;
const OFF_BODY_CRC: usize = 8;
const OFF_QUEUE_ID: usize = 12;
const OFF_FLAG: usize = 16;
const OFF_QUEUE_OFFSET: usize = 20;
const OFF_PHYSICAL_OFFSET: usize = 28;
const OFF_SYS_FLAG: usize = 36;
const OFF_BORN_TIMESTAMP: usize = 40;
const OFF_BORN_HOST: usize = 48;
const OFF_STORE_TIMESTAMP: usize = 56;
const OFF_STORE_HOST: usize = 64;
const OFF_RECONSUME_TIMES: usize = 72;
const OFF_PREPARED_TXN_OFFSET: usize = 76;
const OFF_BODY_LEN: usize = 84;

/// Transaction-type bits packed into `SysFlag` (§3 field 8, §4.4 step 1).
pub mod sys_flag {
    pub const TRANSACTION_NOT_TYPE: i32 = 0;
    pub const TRANSACTION_PREPARED_TYPE: i32 = 1 << 2;
    pub const TRANSACTION_COMMIT_TYPE: i32 = 2 << 2;
    pub const TRANSACTION_ROLLBACK_TYPE: i32 = 3 << 2;
    const TRANSACTION_MASK: i32 = 3 << 2;

    pub fn transaction_value(sys_flag: i32) -> i32 {
        sys_flag & TRANSACTION_MASK
    }

    pub fn reset_transaction_value(sys_flag: i32, transaction_type: i32) -> i32 {
        (sys_flag & !TRANSACTION_MASK) | transaction_type
    }

    pub fn is_prepared_or_rollback(sys_flag: i32) -> bool {
        matches!(
            transaction_value(sys_flag),
            TRANSACTION_PREPARED_TYPE | TRANSACTION_ROLLBACK_TYPE
        )
    }

    pub fn is_not_or_commit(sys_flag: i32) -> bool {
        matches!(
            transaction_value(sys_flag),
            TRANSACTION_NOT_TYPE | TRANSACTION_COMMIT_TYPE
        )
    }
}

/// A message as handed to the `Appender`, before physical placement.
#[derive(Debug, Clone)]
pub struct MessageExt {
    pub topic: String,
    pub queue_id: i32,
    pub flag: i32,
    pub sys_flag: i32,
    pub born_timestamp: i64,
    pub born_host: [u8; 8],
    pub store_host: [u8; 8],
    pub reconsume_times: i32,
    pub prepared_txn_offset: i64,
    pub body: Vec<u8>,
    pub properties: String,
}

impl MessageExt {
    pub fn new(topic: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            queue_id: 0,
            flag: 0,
            sys_flag: sys_flag::TRANSACTION_NOT_TYPE,
            born_timestamp: 0,
            born_host: [0; 8],
            store_host: [0; 8],
            reconsume_times: 0,
            prepared_txn_offset: 0,
            body,
            properties: String::new(),
        }
    }
}

/// Fully decoded record, owning its variable-length sections. Used by
/// readers and by the recoverer.
#[derive(Debug, Clone)]
pub struct DecodedRecord {
    pub total_size: u32,
    pub body_crc: u32,
    pub queue_id: i32,
    pub flag: i32,
    pub queue_offset: u64,
    pub physical_offset: u64,
    pub sys_flag: i32,
    pub born_timestamp: i64,
    pub born_host: [u8; 8],
    pub store_timestamp: i64,
    pub store_host: [u8; 8],
    pub reconsume_times: i32,
    pub prepared_txn_offset: i64,
    pub body: Vec<u8>,
    pub topic: String,
    pub properties: String,
}

/// `computeLength` (§4.3): exact wire size of `msg`'s encoded frame.
pub fn compute_length(body_len: usize, topic_len: usize, props_len: usize) -> usize {
    FIXED_PREFIX_LEN + 4 + body_len + 1 + topic_len + 2 + props_len
}

thread_local! {
    static STAGING: RefCell<Vec<u8>> = RefCell::new(Vec::new());
}

/// Runs `f` against this thread's reusable encode buffer, growing it to
/// `min_capacity` first. Avoids a per-put heap allocation on the hot path
/// (§9 "Thread-local staging buffer").
pub fn with_staging_buffer<R>(min_capacity: usize, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
    STAGING.with(|cell| {
        let mut buf = cell.borrow_mut();
        if buf.capacity() < min_capacity {
            buf.reserve(min_capacity - buf.capacity());
        }
        f(&mut buf)
    })
}

/// Encode `msg` into `buf` (cleared and resized by this call). Fields 6, 7,
/// and 11 are written as zero — the caller patches them in place once it
/// has reserved a physical position, via `patch_reserved_fields`.
///
/// Returns the total frame length.
pub fn encode(msg: &MessageExt, buf: &mut Vec<u8>) -> Result<usize> {
    let topic_bytes = msg.topic.as_bytes();
    if topic_bytes.is_empty() || topic_bytes.len() > MAX_TOPIC_LEN {
        return Err(Error::MessageIllegal("topic length out of range"));
    }
    let props_bytes = msg.properties.as_bytes();
    if props_bytes.len() > MAX_PROPS_LEN {
        return Err(Error::MessageIllegal("properties too long"));
    }

    let total = compute_length(msg.body.len(), topic_bytes.len(), props_bytes.len());
    buf.clear();
    buf.resize(total, 0);

    buf[OFF_TOTAL_SIZE..OFF_TOTAL_SIZE + 4].copy_from_slice(&(total as u32).to_be_bytes());
    buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&DATA_MAGIC.to_be_bytes());
    let crc = crc32(&msg.body);
    buf[OFF_BODY_CRC..OFF_BODY_CRC + 4].copy_from_slice(&crc.to_be_bytes());
    buf[OFF_QUEUE_ID..OFF_QUEUE_ID + 4].copy_from_slice(&msg.queue_id.to_be_bytes());
    buf[OFF_FLAG..OFF_FLAG + 4].copy_from_slice(&msg.flag.to_be_bytes());
    buf[OFF_QUEUE_OFFSET..OFF_QUEUE_OFFSET + 8].copy_from_slice(&0u64.to_be_bytes());
    buf[OFF_PHYSICAL_OFFSET..OFF_PHYSICAL_OFFSET + 8].copy_from_slice(&0u64.to_be_bytes());
    buf[OFF_SYS_FLAG..OFF_SYS_FLAG + 4].copy_from_slice(&msg.sys_flag.to_be_bytes());
    buf[OFF_BORN_TIMESTAMP..OFF_BORN_TIMESTAMP + 8]
        .copy_from_slice(&msg.born_timestamp.to_be_bytes());
    buf[OFF_BORN_HOST..OFF_BORN_HOST + 8].copy_from_slice(&msg.born_host);
    buf[OFF_STORE_TIMESTAMP..OFF_STORE_TIMESTAMP + 8].copy_from_slice(&0i64.to_be_bytes());
    buf[OFF_STORE_HOST..OFF_STORE_HOST + 8].copy_from_slice(&msg.store_host);
    buf[OFF_RECONSUME_TIMES..OFF_RECONSUME_TIMES + 4]
        .copy_from_slice(&msg.reconsume_times.to_be_bytes());
    buf[OFF_PREPARED_TXN_OFFSET..OFF_PREPARED_TXN_OFFSET + 8]
        .copy_from_slice(&msg.prepared_txn_offset.to_be_bytes());

    let mut cursor = OFF_BODY_LEN;
    buf[cursor..cursor + 4].copy_from_slice(&(msg.body.len() as u32).to_be_bytes());
    cursor += 4;
    buf[cursor..cursor + msg.body.len()].copy_from_slice(&msg.body);
    cursor += msg.body.len();

    buf[cursor] = topic_bytes.len() as u8;
    cursor += 1;
    buf[cursor..cursor + topic_bytes.len()].copy_from_slice(topic_bytes);
    cursor += topic_bytes.len();

    buf[cursor..cursor + 2].copy_from_slice(&(props_bytes.len() as u16).to_be_bytes());
    cursor += 2;
    buf[cursor..cursor + props_bytes.len()].copy_from_slice(props_bytes);
    cursor += props_bytes.len();

    debug_assert_eq!(cursor, total);
    Ok(total)
}

/// Overwrite `QueueOffset`, `PhysicalOffset`, and `StoreTimestamp` in an
/// already-encoded frame. Called by the `Appender` inside the put-lock,
/// once the physical offset and queue offset have been assigned.
pub fn patch_reserved_fields(
    frame: &mut [u8],
    queue_offset: u64,
    physical_offset: u64,
    store_timestamp: i64,
) {
    frame[OFF_QUEUE_OFFSET..OFF_QUEUE_OFFSET + 8].copy_from_slice(&queue_offset.to_be_bytes());
    frame[OFF_PHYSICAL_OFFSET..OFF_PHYSICAL_OFFSET + 8]
        .copy_from_slice(&physical_offset.to_be_bytes());
    frame[OFF_STORE_TIMESTAMP..OFF_STORE_TIMESTAMP + 8]
        .copy_from_slice(&store_timestamp.to_be_bytes());
}

/// Write an end-of-segment padding frame of exactly `remaining` bytes.
/// `remaining` must be >= `MIN_PADDING`; the `Appender` is responsible for
/// never leaving less than that (§3 "Open questions").
pub fn encode_padding(buf: &mut [u8], remaining: usize) -> Result<()> {
    if remaining < MIN_PADDING {
        return Err(Error::Corrupt("padding frame smaller than MIN_PADDING"));
    }
    buf[OFF_TOTAL_SIZE..OFF_TOTAL_SIZE + 4].copy_from_slice(&(remaining as u32).to_be_bytes());
    buf[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&PAD_MAGIC.to_be_bytes());
    Ok(())
}

pub fn crc32(body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(body);
    hasher.finalize()
}

/// `createMessageId` (§4.3): `storeHost ++ physicalOffset`, hex-encoded.
pub fn create_message_id(store_host: [u8; 8], physical_offset: u64) -> String {
    let mut bytes = [0u8; 16];
    bytes[0..8].copy_from_slice(&store_host);
    bytes[8..16].copy_from_slice(&physical_offset.to_be_bytes());
    let mut out = String::with_capacity(32);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Outcome of validating one frame at a given buffer position, matching
/// the recoverer's `checkReturnSize` semantics (§4.6): a positive record
/// size, a padding frame (treated as "advance to next segment"), or a
/// torn/invalid frame ("stop here").
pub enum CheckResult {
    Record { record: DecodedRecord, size: usize },
    Padding,
    Invalid,
}

/// Parse and validate the frame starting at `buf[0..]`, optionally
/// checking the body CRC. Never panics on malformed input — any
/// buffer-underflow or length mismatch is reported as `CheckResult::Invalid`
/// so the recoverer can treat it as the truncation point.
pub fn check_and_decode(buf: &[u8], check_crc: bool) -> CheckResult {
    match try_decode(buf, check_crc) {
        Some(Decoded::Record(record, size)) => CheckResult::Record { record, size },
        Some(Decoded::Padding) => CheckResult::Padding,
        None => CheckResult::Invalid,
    }
}

enum Decoded {
    Record(DecodedRecord, usize),
    Padding,
}

fn try_decode(buf: &[u8], check_crc: bool) -> Option<Decoded> {
    if buf.len() < 8 {
        return None;
    }
    let total_size = u32::from_be_bytes(buf[OFF_TOTAL_SIZE..OFF_TOTAL_SIZE + 4].try_into().ok()?);
    let magic = u32::from_be_bytes(buf[OFF_MAGIC..OFF_MAGIC + 4].try_into().ok()?);

    if magic == PAD_MAGIC {
        return Some(Decoded::Padding);
    }
    if magic != DATA_MAGIC {
        return None;
    }
    if (total_size as usize) < FIXED_PREFIX_LEN + 4 + 1 + 2 || (total_size as usize) > buf.len() {
        return None;
    }
    let frame = &buf[..total_size as usize];

    let body_crc = u32::from_be_bytes(frame[OFF_BODY_CRC..OFF_BODY_CRC + 4].try_into().ok()?);
    let queue_id = i32::from_be_bytes(frame[OFF_QUEUE_ID..OFF_QUEUE_ID + 4].try_into().ok()?);
    let flag = i32::from_be_bytes(frame[OFF_FLAG..OFF_FLAG + 4].try_into().ok()?);
    let queue_offset = u64::from_be_bytes(
        frame[OFF_QUEUE_OFFSET..OFF_QUEUE_OFFSET + 8]
            .try_into()
            .ok()?,
    );
    let physical_offset = u64::from_be_bytes(
        frame[OFF_PHYSICAL_OFFSET..OFF_PHYSICAL_OFFSET + 8]
            .try_into()
            .ok()?,
    );
    let sys_flag = i32::from_be_bytes(frame[OFF_SYS_FLAG..OFF_SYS_FLAG + 4].try_into().ok()?);
    let born_timestamp = i64::from_be_bytes(
        frame[OFF_BORN_TIMESTAMP..OFF_BORN_TIMESTAMP + 8]
            .try_into()
            .ok()?,
    );
    let mut born_host = [0u8; 8];
    born_host.copy_from_slice(&frame[OFF_BORN_HOST..OFF_BORN_HOST + 8]);
    let store_timestamp = i64::from_be_bytes(
        frame[OFF_STORE_TIMESTAMP..OFF_STORE_TIMESTAMP + 8]
            .try_into()
            .ok()?,
    );
    let mut store_host = [0u8; 8];
    store_host.copy_from_slice(&frame[OFF_STORE_HOST..OFF_STORE_HOST + 8]);
    let reconsume_times = i32::from_be_bytes(
        frame[OFF_RECONSUME_TIMES..OFF_RECONSUME_TIMES + 4]
            .try_into()
            .ok()?,
    );
    let prepared_txn_offset = i64::from_be_bytes(
        frame[OFF_PREPARED_TXN_OFFSET..OFF_PREPARED_TXN_OFFSET + 8]
            .try_into()
            .ok()?,
    );

    let mut cursor = OFF_BODY_LEN;
    if cursor + 4 > frame.len() {
        return None;
    }
    let body_len = u32::from_be_bytes(frame[cursor..cursor + 4].try_into().ok()?) as usize;
    cursor += 4;
    if cursor + body_len > frame.len() {
        return None;
    }
    let body = frame[cursor..cursor + body_len].to_vec();
    cursor += body_len;

    if check_crc && crc32(&body) != body_crc {
        return None;
    }

    if cursor + 1 > frame.len() {
        return None;
    }
    let topic_len = frame[cursor] as usize;
    cursor += 1;
    if topic_len == 0 || cursor + topic_len > frame.len() {
        return None;
    }
    let topic = std::str::from_utf8(&frame[cursor..cursor + topic_len])
        .ok()?
        .to_string();
    cursor += topic_len;

    if cursor + 2 > frame.len() {
        return None;
    }
    let props_len = u16::from_be_bytes(frame[cursor..cursor + 2].try_into().ok()?) as usize;
    cursor += 2;
    if cursor + props_len > frame.len() {
        return None;
    }
    let properties = std::str::from_utf8(&frame[cursor..cursor + props_len])
        .ok()?
        .to_string();
    cursor += props_len;

    if cursor != frame.len() {
        return None;
    }

    Some(Decoded::Record(
        DecodedRecord {
            total_size,
            body_crc,
            queue_id,
            flag,
            queue_offset,
            physical_offset,
            sys_flag,
            born_timestamp,
            born_host,
            store_timestamp,
            store_host,
            reconsume_times,
            prepared_txn_offset,
            body,
            topic,
            properties,
        },
        total_size as usize,
    ))
}

/// Join `key=value` pairs with the unit separator, as the delay-rewrite
/// path does when stashing `REAL_TOPIC`/`REAL_QID` (§4.4 step 1).
pub fn append_property(properties: &mut String, key: &str, value: &str) {
    if !properties.is_empty() {
        properties.push('\u{1}');
    }
    properties.push_str(key);
    properties.push('=');
    properties.push_str(value);
}

/// Pull the `KEYS` property out of a joined properties string, if present.
/// Shared by the `Appender`'s `DispatchRequest` construction and by
/// abnormal recovery, which rebuilds the same metadata from the wire.
pub fn extract_key_property(properties: &str) -> String {
    for pair in properties.split('\u{1}') {
        if let Some(value) = pair.strip_prefix("KEYS=") {
            return value.to_string();
        }
    }
    String::new()
}

/// Peek a candidate frame's `MagicCode` and (if present) `StoreTimestamp`
/// without fully decoding the frame. Used by abnormal recovery to pick a
/// starting segment by comparing a segment's first record against the
/// checkpoint's minimum timestamp (§4.6).
pub fn peek_header(buf: &[u8]) -> Option<(u32, i64)> {
    if buf.len() < OFF_STORE_TIMESTAMP + 8 {
        return None;
    }
    let magic = u32::from_be_bytes(buf[OFF_MAGIC..OFF_MAGIC + 4].try_into().ok()?);
    let store_timestamp =
        i64::from_be_bytes(buf[OFF_STORE_TIMESTAMP..OFF_STORE_TIMESTAMP + 8].try_into().ok()?);
    Some((magic, store_timestamp))
}
