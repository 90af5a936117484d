//! AllocateMappedFileService collaborator: pre-creates the next segment
//! file on a background thread so a rotation on the put path almost never
//! has to pay for `ftruncate`+`mmap`+page-fault-in synchronously (§6).

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::error::{Error, Result};
use crate::segment::Segment;

pub struct AllocateMappedFileService {
    dir: PathBuf,
    capacity: usize,
    prepared: Arc<Mutex<HashMap<u64, Arc<Segment>>>>,
    tx: Sender<u64>,
    handle: Option<JoinHandle<()>>,
}

impl AllocateMappedFileService {
    pub fn start(dir: PathBuf, capacity: usize) -> Self {
        let prepared = Arc::new(Mutex::new(HashMap::new()));
        let (tx, rx): (Sender<u64>, Receiver<u64>) = mpsc::channel();
        let worker_dir = dir.clone();
        let worker_prepared = prepared.clone();
        let handle = std::thread::Builder::new()
            .name("allocate-mapped-file".into())
            .spawn(move || {
                for base_offset in rx {
                    if worker_prepared.lock().expect("prepared map poisoned").contains_key(&base_offset) {
                        continue;
                    }
                    match Segment::create(&worker_dir, base_offset, capacity) {
                        Ok(segment) => {
                            segment.prefault().ok();
                            worker_prepared
                                .lock()
                                .expect("prepared map poisoned")
                                .insert(base_offset, Arc::new(segment));
                        }
                        Err(err) => {
                            log::warn!("background allocate of segment {base_offset} failed: {err}");
                        }
                    }
                }
            })
            .expect("failed to spawn allocate-mapped-file thread");

        Self {
            dir,
            capacity,
            prepared,
            tx,
            handle: Some(handle),
        }
    }

    /// Ask the background thread to start preparing the segment at
    /// `base_offset`. Best-effort: dropped silently if the worker has
    /// already exited.
    pub fn request_next(&self, base_offset: u64) {
        let _ = self.tx.send(base_offset);
    }

    /// Take a previously prepared segment, or create one synchronously on
    /// the caller's thread if the background worker hasn't gotten to it
    /// yet — the put path must never block indefinitely on a rotation.
    pub fn take_or_create(&self, base_offset: u64) -> Result<Arc<Segment>> {
        if let Some(segment) = self.take_prepared(base_offset) {
            return Ok(segment);
        }
        match Segment::create(&self.dir, base_offset, self.capacity) {
            Ok(segment) => {
                segment.prefault().ok();
                Ok(Arc::new(segment))
            }
            // The background worker may have already created this file on
            // disk but not yet published it into `prepared` — re-check,
            // then fall back to opening the file it created rather than
            // erroring out on a live rotation.
            Err(Error::Io(_)) => {
                if let Some(segment) = self.take_prepared(base_offset) {
                    return Ok(segment);
                }
                Ok(Arc::new(Segment::open(&self.dir, base_offset, self.capacity, 0)?))
            }
            Err(err) => Err(err),
        }
    }

    fn take_prepared(&self, base_offset: u64) -> Option<Arc<Segment>> {
        self.prepared
            .lock()
            .expect("prepared map poisoned")
            .remove(&base_offset)
    }
}

impl Drop for AllocateMappedFileService {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            drop(std::mem::replace(&mut self.tx, mpsc::channel().0));
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn take_or_create_falls_back_to_synchronous_creation() {
        let dir = tempdir().unwrap();
        let service = AllocateMappedFileService::start(dir.path().to_path_buf(), 4096);
        let segment = service.take_or_create(0).unwrap();
        assert_eq!(segment.base_offset(), 0);
        assert_eq!(segment.capacity(), 4096);
    }

    #[test]
    fn take_or_create_recovers_when_file_exists_but_is_not_yet_prepared() {
        let dir = tempdir().unwrap();
        let service = AllocateMappedFileService::start(dir.path().to_path_buf(), 4096);
        // Simulate the background worker having created the file but not
        // yet inserted it into `prepared` — `Segment::create`'s
        // `create_new` would otherwise fail here.
        Segment::create(dir.path(), 8192, 4096).unwrap();
        let segment = service.take_or_create(8192).unwrap();
        assert_eq!(segment.base_offset(), 8192);
        assert_eq!(segment.capacity(), 4096);
    }

    #[test]
    fn request_next_eventually_prepares_segment() {
        let dir = tempdir().unwrap();
        let service = AllocateMappedFileService::start(dir.path().to_path_buf(), 4096);
        service.request_next(4096);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        loop {
            if service
                .prepared
                .lock()
                .unwrap()
                .contains_key(&4096)
            {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "background allocation never completed");
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        let segment = service.take_or_create(4096).unwrap();
        assert_eq!(segment.base_offset(), 4096);
    }
}
