//! C2: the ordered collection of segments backing the whole commit log
//! (§3 "SegmentQueue"). Owns segment lifecycle (discovery on startup,
//! rotation, retention) but never touches record bytes itself.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::allocate::AllocateMappedFileService;
use crate::error::Result;
use crate::segment::{parse_segment_filename, Segment};

pub struct SegmentQueue {
    dir: PathBuf,
    segment_size: usize,
    segments: Mutex<Vec<Arc<Segment>>>,
    allocator: AllocateMappedFileService,
}

impl SegmentQueue {
    /// Discover existing segment files under `dir` and open each one,
    /// sorted by base offset. Every segment but the last is assumed fully
    /// written; the `Recoverer` is responsible for calling `truncate_to` on
    /// whichever segment actually needs it once it has scanned the tail.
    pub fn load(dir: PathBuf, segment_size: usize) -> Result<Self> {
        fs::create_dir_all(&dir)?;
        let mut base_offsets: Vec<u64> = fs::read_dir(&dir)?
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().to_str().and_then(parse_segment_filename))
            .collect();
        base_offsets.sort_unstable();

        let mut segments = Vec::with_capacity(base_offsets.len());
        for base_offset in &base_offsets {
            let segment = Segment::open(&dir, *base_offset, segment_size, segment_size)?;
            segments.push(Arc::new(segment));
        }

        let allocator = AllocateMappedFileService::start(dir.clone(), segment_size);
        Ok(Self {
            dir,
            segment_size,
            segments: Mutex::new(segments),
            allocator,
        })
    }

    pub fn segment_size(&self) -> usize {
        self.segment_size
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn tail(&self) -> Option<Arc<Segment>> {
        self.segments.lock().expect("segments lock poisoned").last().cloned()
    }

    /// Return the current tail, creating the first segment at base offset
    /// 0 if the queue is empty.
    pub fn ensure_tail(&self) -> Result<Arc<Segment>> {
        if let Some(tail) = self.tail() {
            return Ok(tail);
        }
        let segment = Arc::new(Segment::create(&self.dir, 0, self.segment_size)?);
        self.segments
            .lock()
            .expect("segments lock poisoned")
            .push(segment.clone());
        self.allocator.request_next(self.segment_size as u64);
        Ok(segment)
    }

    /// Seal the current tail (padding its remainder) and publish a new one
    /// immediately after it. Called by the `Appender` on `EndOfFile`.
    pub fn rotate(&self, current: &Arc<Segment>) -> Result<Arc<Segment>> {
        current.pad_to_end()?;
        let next_base = current.base_offset() + current.capacity() as u64;
        let next = self.allocator.take_or_create(next_base)?;

        let mut segments = self.segments.lock().expect("segments lock poisoned");
        if segments.last().map(|s| s.base_offset()) == Some(current.base_offset()) {
            segments.push(next.clone());
        }
        drop(segments);

        self.allocator
            .request_next(next_base + self.segment_size as u64);
        Ok(next)
    }

    /// Locate the segment covering physical offset `offset`. When no
    /// segment covers it exactly (e.g. a reader resuming past a deleted
    /// segment) and `return_first_on_miss` is set, returns the first
    /// remaining segment instead of `None`.
    pub fn find_by_offset(&self, offset: u64, return_first_on_miss: bool) -> Option<Arc<Segment>> {
        let segments = self.segments.lock().expect("segments lock poisoned");
        let found = segments
            .iter()
            .find(|segment| {
                offset >= segment.base_offset()
                    && offset < segment.base_offset() + segment.capacity() as u64
            })
            .cloned();
        found.or_else(|| {
            if return_first_on_miss {
                segments.first().cloned()
            } else {
                None
            }
        })
    }

    pub fn max_offset(&self) -> u64 {
        self.tail()
            .map(|segment| segment.base_offset() + segment.wrote() as u64)
            .unwrap_or(0)
    }

    pub fn min_offset(&self) -> u64 {
        self.segments
            .lock()
            .expect("segments lock poisoned")
            .first()
            .map(|segment| segment.base_offset())
            .unwrap_or(0)
    }

    pub fn all_segments(&self) -> Vec<Arc<Segment>> {
        self.segments.lock().expect("segments lock poisoned").clone()
    }

    /// Flush the tail (and any not-yet-flushed predecessor) to disk.
    /// Returns the new globally flushed physical offset.
    pub fn flush(&self, least_pages: usize) -> Result<u64> {
        let segments = self.all_segments();
        let mut flushed_offset = 0u64;
        for segment in &segments {
            let dirty_bytes = segment.wrote().saturating_sub(segment.flushed_offset());
            if dirty_bytes == 0 {
                flushed_offset = segment.base_offset() + segment.flushed_offset() as u64;
                continue;
            }
            if least_pages == 0 || dirty_bytes >= least_pages * 4096 {
                let wrote = segment.flush()?;
                flushed_offset = segment.base_offset() + wrote as u64;
            } else {
                flushed_offset = segment.base_offset() + segment.flushed_offset() as u64;
            }
        }
        Ok(flushed_offset)
    }

    /// Drop any segment entirely past `committed_where` and rewind the
    /// segment that straddles it, discarding whatever was written after an
    /// unclean shutdown's recovery boundary (§4.6).
    pub fn truncate_dirty_files(&self, committed_where: u64) -> Result<()> {
        let mut segments = self.segments.lock().expect("segments lock poisoned");
        let mut keep = Vec::with_capacity(segments.len());
        for segment in segments.drain(..) {
            let end = segment.base_offset() + segment.capacity() as u64;
            if segment.base_offset() >= committed_where {
                segment.clone().destroy(Duration::from_secs(0))?;
                continue;
            }
            if committed_where < end {
                let local = (committed_where - segment.base_offset()) as usize;
                segment.truncate_to(local);
            }
            keep.push(segment);
        }
        *segments = keep;
        Ok(())
    }

    /// Delete segments whose every byte is older than `expire_millis` and
    /// which are not the tail, unless `immediate` forces deletion of the
    /// oldest segment regardless of age (disk-full escape hatch, §3).
    pub fn delete_expired(
        &self,
        expire_millis: u64,
        force_after: Duration,
        immediate: bool,
    ) -> Result<Vec<u64>> {
        let now = SystemTime::now();
        let mut deleted = Vec::new();
        loop {
            let candidate = {
                let segments = self.segments.lock().expect("segments lock poisoned");
                if segments.len() <= 1 {
                    break;
                }
                let oldest = segments[0].clone();
                let expired = immediate
                    || fs::metadata(oldest.path())
                        .and_then(|meta| meta.modified())
                        .map(|modified| {
                            now.duration_since(modified)
                                .unwrap_or(Duration::ZERO)
                                .as_millis() as u64
                                >= expire_millis
                        })
                        .unwrap_or(false);
                if !expired {
                    break;
                }
                oldest
            };
            candidate.clone().destroy(force_after)?;
            let mut segments = self.segments.lock().expect("segments lock poisoned");
            segments.retain(|segment| segment.base_offset() != candidate.base_offset());
            deleted.push(candidate.base_offset());
            if !immediate {
                continue;
            }
            break;
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn ensure_tail_creates_first_segment() {
        let dir = tempdir().unwrap();
        let queue = SegmentQueue::load(dir.path().to_path_buf(), 4096).unwrap();
        let tail = queue.ensure_tail().unwrap();
        assert_eq!(tail.base_offset(), 0);
        assert_eq!(queue.all_segments().len(), 1);
    }

    #[test]
    fn rotate_pads_old_tail_and_publishes_next() {
        let dir = tempdir().unwrap();
        let queue = SegmentQueue::load(dir.path().to_path_buf(), 256).unwrap();
        let first = queue.ensure_tail().unwrap();
        let next = queue.rotate(&first).unwrap();
        assert_eq!(first.remaining(), 0);
        assert_eq!(next.base_offset(), 256);
        assert_eq!(queue.all_segments().len(), 2);
        assert_eq!(queue.tail().unwrap().base_offset(), 256);
    }

    #[test]
    fn find_by_offset_locates_owning_segment() {
        let dir = tempdir().unwrap();
        let queue = SegmentQueue::load(dir.path().to_path_buf(), 256).unwrap();
        let first = queue.ensure_tail().unwrap();
        queue.rotate(&first).unwrap();

        let found = queue.find_by_offset(300, false).unwrap();
        assert_eq!(found.base_offset(), 256);
        assert!(queue.find_by_offset(10_000, false).is_none());
        assert!(queue.find_by_offset(10_000, true).is_some());
    }

    #[test]
    fn load_discovers_existing_segment_files() {
        let dir = tempdir().unwrap();
        {
            let queue = SegmentQueue::load(dir.path().to_path_buf(), 256).unwrap();
            let first = queue.ensure_tail().unwrap();
            queue.rotate(&first).unwrap();
        }
        let reopened = SegmentQueue::load(dir.path().to_path_buf(), 256).unwrap();
        assert_eq!(reopened.all_segments().len(), 2);
    }

    #[test]
    fn truncate_dirty_files_drops_and_rewinds_segments() {
        let dir = tempdir().unwrap();
        let queue = SegmentQueue::load(dir.path().to_path_buf(), 256).unwrap();
        let first = queue.ensure_tail().unwrap();
        queue.rotate(&first).unwrap();
        assert_eq!(queue.all_segments().len(), 2);

        queue.truncate_dirty_files(200).unwrap();
        let remaining = queue.all_segments();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].wrote(), 200);
    }
}
