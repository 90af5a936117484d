//! C1: a single fixed-size mapped segment file (§3 "Segment").
//!
//! A `Segment` owns one memory-mapped file of exactly `capacity` bytes,
//! covering physical offsets `[base_offset, base_offset + capacity)`. Bytes
//! are written under the engine-wide put-lock (see `appender`), but a
//! `Segment` is handed out as `Arc<Segment>` so that outstanding read views
//! keep it (and its mapping) alive after it stops being the tail — Rust's
//! ownership model does the refcounted "don't unmap while readers are
//! live" bookkeeping the original Java implementation does by hand.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::mmap::MmapFile;
use crate::record::{self, MIN_PADDING};

pub fn segment_filename(base_offset: u64) -> String {
    format!("{base_offset:020}")
}

pub fn parse_segment_filename(name: &str) -> Option<u64> {
    name.parse::<u64>().ok()
}

pub struct Segment {
    base_offset: u64,
    capacity: usize,
    path: PathBuf,
    mmap: Mutex<MmapFile>,
    /// Next free local offset. CAS-advanced at reservation time; with a
    /// single put-lock-holding writer this never actually contends, but it
    /// keeps the reserve-then-publish protocol honest if that ever changes.
    reserved: AtomicU64,
    /// Local offset up to which bytes are fully written and safe to read.
    /// Stored with `Release` only after a record's bytes (and any field
    /// patch) are complete; read views load it with `Acquire`.
    published: AtomicU64,
    /// Local offset up to which `flush` has forced pages to disk.
    flushed: AtomicU64,
    available: std::sync::atomic::AtomicBool,
}

pub enum ReserveOutcome {
    Reserved { local_offset: usize, physical_offset: u64 },
    EndOfFile { remaining: usize },
}

/// A snapshot read of a previously published record's raw bytes, valid
/// regardless of segment rotation because it holds a strong reference to
/// the segment instead of a raw pointer.
pub struct RecordView {
    segment: std::sync::Arc<Segment>,
    local_offset: usize,
    len: usize,
}

impl RecordView {
    pub fn bytes(&self) -> Result<Vec<u8>> {
        let mmap = self.segment.mmap.lock().expect("segment mutex poisoned");
        Ok(mmap.range(self.local_offset, self.len)?.to_vec())
    }

    pub fn physical_offset(&self) -> u64 {
        self.segment.base_offset + self.local_offset as u64
    }
}

impl Segment {
    pub fn create(dir: &Path, base_offset: u64, capacity: usize) -> Result<Self> {
        let path = dir.join(segment_filename(base_offset));
        let mmap = MmapFile::create_new(&path, capacity)?;
        Ok(Self::new(base_offset, capacity, path, mmap, 0))
    }

    /// Reopen an existing segment file, treating every byte already on disk
    /// as published. Used by recovery and by a restarted engine reattaching
    /// to segments that are not the tail.
    pub fn open(dir: &Path, base_offset: u64, capacity: usize, wrote: usize) -> Result<Self> {
        let path = dir.join(segment_filename(base_offset));
        let mmap = MmapFile::open(&path)?;
        Ok(Self::new(base_offset, capacity, path, mmap, wrote))
    }

    fn new(base_offset: u64, capacity: usize, path: PathBuf, mmap: MmapFile, wrote: usize) -> Self {
        Self {
            base_offset,
            capacity,
            path,
            mmap: Mutex::new(mmap),
            reserved: AtomicU64::new(wrote as u64),
            published: AtomicU64::new(wrote as u64),
            flushed: AtomicU64::new(0),
            available: std::sync::atomic::AtomicBool::new(true),
        }
    }

    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn wrote(&self) -> usize {
        self.published.load(Ordering::Acquire) as usize
    }

    pub fn remaining(&self) -> usize {
        self.capacity - self.reserved.load(Ordering::Acquire) as usize
    }

    pub fn is_full(&self) -> bool {
        self.remaining() < MIN_PADDING
    }

    /// Reserve `len` contiguous bytes at the current write cursor. Returns
    /// `EndOfFile` (with the space still free) when `len` would overflow
    /// the segment, so the caller can decide whether to pad or rotate.
    pub fn reserve(&self, len: usize) -> ReserveOutcome {
        loop {
            let old = self.reserved.load(Ordering::Acquire) as usize;
            let remaining = self.capacity - old;
            if len > remaining {
                return ReserveOutcome::EndOfFile { remaining };
            }
            let new = (old + len) as u64;
            if self
                .reserved
                .compare_exchange(old as u64, new, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return ReserveOutcome::Reserved {
                    local_offset: old,
                    physical_offset: self.base_offset + old as u64,
                };
            }
        }
    }

    /// Write `bytes` at `local_offset` and publish them, making the range
    /// visible to `select_view`/readers. Must only be called once per
    /// reservation and with a byte range that exactly matches it.
    pub fn write_and_publish(&self, local_offset: usize, bytes: &[u8]) -> Result<()> {
        {
            let mut mmap = self.mmap.lock().expect("segment mutex poisoned");
            mmap.range_mut(local_offset, bytes.len())?
                .copy_from_slice(bytes);
        }
        self.advance_published(local_offset + bytes.len());
        Ok(())
    }

    /// `appendRaw` (§4.1): write bytes that are already a complete,
    /// framed record — the HA catch-up path, where a slave replays bytes
    /// the master already encoded, never re-encodes them. No rotation or
    /// padding: a caller that overruns the segment just gets `false`.
    pub fn append_raw(&self, bytes: &[u8]) -> bool {
        match self.reserve(bytes.len()) {
            ReserveOutcome::Reserved { local_offset, .. } => {
                self.write_and_publish(local_offset, bytes).is_ok()
            }
            ReserveOutcome::EndOfFile { .. } => false,
        }
    }

    fn advance_published(&self, to: usize) {
        loop {
            let old = self.published.load(Ordering::Acquire);
            if old as usize >= to {
                return;
            }
            if self
                .published
                .compare_exchange(old, to as u64, Ordering::Release, Ordering::Acquire)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Fill the remainder of the segment with a single padding frame and
    /// mark it fully written. No-op if the segment is already exactly full.
    pub fn pad_to_end(&self) -> Result<()> {
        let remaining = self.remaining();
        if remaining == 0 {
            return Ok(());
        }
        if remaining < MIN_PADDING {
            log::warn!(
                "[BUG] segment {} has {} bytes of unframeable slack at end-of-file",
                self.base_offset,
                remaining
            );
            self.reserved.store(self.capacity as u64, Ordering::Release);
            self.advance_published(self.capacity);
            return Ok(());
        }
        let local_offset = match self.reserve(remaining) {
            ReserveOutcome::Reserved { local_offset, .. } => local_offset,
            ReserveOutcome::EndOfFile { .. } => return Ok(()),
        };
        let mut mmap = self.mmap.lock().expect("segment mutex poisoned");
        let buf = mmap.range_mut(local_offset, remaining)?;
        record::encode_padding(buf, remaining)?;
        drop(mmap);
        self.advance_published(local_offset + remaining);
        Ok(())
    }

    /// Copy out `len` bytes starting at `local_offset`, provided they have
    /// been published.
    pub fn select_view(self: &std::sync::Arc<Self>, local_offset: usize, len: usize) -> Result<RecordView> {
        let published = self.published.load(Ordering::Acquire) as usize;
        if local_offset + len > published {
            return Err(Error::Corrupt("read past published boundary"));
        }
        Ok(RecordView {
            segment: self.clone(),
            local_offset,
            len,
        })
    }

    pub fn flushed_offset(&self) -> usize {
        self.flushed.load(Ordering::Acquire) as usize
    }

    /// Force dirty pages to disk. Returns how many bytes are now durable.
    pub fn flush(&self) -> Result<usize> {
        let wrote = self.wrote();
        let mmap = self.mmap.lock().expect("segment mutex poisoned");
        mmap.flush_sync()?;
        self.flushed.store(wrote as u64, Ordering::Release);
        Ok(wrote)
    }

    pub fn flush_async(&self) -> Result<()> {
        let wrote = self.wrote();
        let mmap = self.mmap.lock().expect("segment mutex poisoned");
        mmap.flush_async()?;
        self.flushed.store(wrote as u64, Ordering::Release);
        Ok(())
    }

    pub fn prefault(&self) -> Result<()> {
        let mut mmap = self.mmap.lock().expect("segment mutex poisoned");
        mmap.prefault();
        Ok(())
    }

    pub fn mlock(&self) -> Result<()> {
        self.mmap.lock().expect("segment mutex poisoned").mlock()
    }

    pub fn munlock(&self) -> Result<()> {
        self.mmap.lock().expect("segment mutex poisoned").munlock()
    }

    /// Truncate to `new_wrote` bytes after a recovery scan finds a torn or
    /// invalid record. Only meaningful on the segment currently being
    /// recovered; does not shrink the file, just rewinds the cursors so
    /// subsequent appends overwrite the corrupt tail.
    pub fn truncate_to(&self, new_wrote: usize) {
        self.reserved.store(new_wrote as u64, Ordering::Release);
        self.published.store(new_wrote as u64, Ordering::Release);
    }

    /// Mark unavailable and, once no other reference holds this segment
    /// (or `force_after` elapses), delete the backing file. Unlinking a
    /// file that is still mapped elsewhere is safe on Unix: the inode is
    /// freed only once the last mapping/descriptor drops.
    pub fn destroy(self: std::sync::Arc<Self>, force_after: Duration) -> Result<()> {
        self.available.store(false, Ordering::Release);
        let deadline = Instant::now() + force_after;
        let path = self.path.clone();
        drop(self);
        // The caller is expected to have dropped its own clone already;
        // this loop waits for any other outstanding readers.
        while Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        fs::remove_file(&path)?;
        Ok(())
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn reserve_write_publish_round_trip() {
        let dir = tempdir().unwrap();
        let seg = Segment::create(dir.path(), 0, 1024).unwrap();
        let local_offset = match seg.reserve(16) {
            ReserveOutcome::Reserved { local_offset, physical_offset } => {
                assert_eq!(physical_offset, 0);
                local_offset
            }
            _ => panic!("expected reservation to succeed"),
        };
        seg.write_and_publish(local_offset, &[7u8; 16]).unwrap();
        assert_eq!(seg.wrote(), 16);
        assert_eq!(seg.remaining(), 1024 - 16);
    }

    #[test]
    fn reserve_reports_end_of_file_without_consuming_space() {
        let dir = tempdir().unwrap();
        let seg = Segment::create(dir.path(), 0, 32).unwrap();
        match seg.reserve(64) {
            ReserveOutcome::EndOfFile { remaining } => assert_eq!(remaining, 32),
            _ => panic!("expected EndOfFile"),
        }
        assert_eq!(seg.remaining(), 32);
    }

    #[test]
    fn pad_to_end_fills_remaining_bytes() {
        let dir = tempdir().unwrap();
        let seg = Segment::create(dir.path(), 0, 100).unwrap();
        let local_offset = match seg.reserve(40) {
            ReserveOutcome::Reserved { local_offset, .. } => local_offset,
            _ => unreachable!(),
        };
        seg.write_and_publish(local_offset, &vec![1u8; 40]).unwrap();
        seg.pad_to_end().unwrap();
        assert_eq!(seg.remaining(), 0);
        assert_eq!(seg.wrote(), 100);
    }

    #[test]
    fn select_view_rejects_unpublished_range() {
        let dir = tempdir().unwrap();
        let seg = std::sync::Arc::new(Segment::create(dir.path(), 0, 64).unwrap());
        assert!(seg.select_view(0, 16).is_err());
        let local_offset = match seg.reserve(16) {
            ReserveOutcome::Reserved { local_offset, .. } => local_offset,
            _ => unreachable!(),
        };
        seg.write_and_publish(local_offset, &[9u8; 16]).unwrap();
        let view = seg.select_view(0, 16).unwrap();
        assert_eq!(view.bytes().unwrap(), vec![9u8; 16]);
    }

    #[test]
    fn append_raw_writes_already_framed_bytes_verbatim() {
        let dir = tempdir().unwrap();
        let seg = std::sync::Arc::new(Segment::create(dir.path(), 0, 64).unwrap());
        assert!(seg.append_raw(&[1u8, 2, 3, 4]));
        assert_eq!(seg.wrote(), 4);
        let view = seg.select_view(0, 4).unwrap();
        assert_eq!(view.bytes().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn append_raw_reports_false_when_it_would_overflow() {
        let dir = tempdir().unwrap();
        let seg = Segment::create(dir.path(), 0, 8).unwrap();
        assert!(!seg.append_raw(&[0u8; 16]));
        assert_eq!(seg.wrote(), 0);
    }

    #[test]
    fn segment_filename_is_zero_padded() {
        assert_eq!(segment_filename(1024), "00000000000000001024");
        assert_eq!(parse_segment_filename("00000000000000001024"), Some(1024));
    }
}
