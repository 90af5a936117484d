//! C5: the two flusher variants selected by `FlushDiskType` (§4.5). Both
//! run on a dedicated long-lived thread; the put path never calls
//! `SegmentQueue::flush` itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::segment_queue::SegmentQueue;

/// Called after a successful flush batch so the engine can update
/// `StoreCheckpoint::setPhysicMsgTimestamp` (§6) without the flusher
/// needing to know about checkpoints itself.
pub type OnFlush = Arc<dyn Fn() + Send + Sync>;

/// `AsyncFlusher` (§4.5): wakes on a timer (or an explicit nudge from the
/// put path) and flushes `leastPages` dirty pages, escalating to a full
/// flush every `thoroughInterval`.
pub struct AsyncFlusher {
    inner: Arc<AsyncInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct AsyncInner {
    queue: Arc<SegmentQueue>,
    interval: Duration,
    least_pages: usize,
    thorough_interval: Duration,
    shutdown: AtomicBool,
    wake_mutex: Mutex<()>,
    wake_cv: Condvar,
    on_flush: Option<OnFlush>,
}

impl AsyncFlusher {
    pub fn start(
        queue: Arc<SegmentQueue>,
        interval: Duration,
        least_pages: usize,
        thorough_interval: Duration,
    ) -> Self {
        Self::start_with_checkpoint(queue, interval, least_pages, thorough_interval, None)
    }

    pub fn start_with_checkpoint(
        queue: Arc<SegmentQueue>,
        interval: Duration,
        least_pages: usize,
        thorough_interval: Duration,
        on_flush: Option<OnFlush>,
    ) -> Self {
        let inner = Arc::new(AsyncInner {
            queue,
            interval,
            least_pages,
            thorough_interval,
            shutdown: AtomicBool::new(false),
            wake_mutex: Mutex::new(()),
            wake_cv: Condvar::new(),
            on_flush,
        });
        let worker = inner.clone();
        let handle = std::thread::Builder::new()
            .name("commitlog-async-flusher".into())
            .spawn(move || worker.run())
            .expect("failed to spawn async flusher thread");
        Self {
            inner,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Nudge the flusher to run sooner than its next timer tick, e.g. right
    /// after a put under `FlushDiskType::Async`.
    pub fn wake(&self) {
        let _guard = self.inner.wake_mutex.lock().expect("flusher wake mutex poisoned");
        self.inner.wake_cv.notify_all();
    }

    /// Stop the background thread, retrying a full flush up to 3 times as
    /// the shutdown path (§4.5 "On shutdown, retries up to 3 times").
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.wake();
        if let Some(handle) = self.handle.lock().expect("flusher handle mutex poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl AsyncInner {
    fn run(&self) {
        let mut last_thorough = Instant::now();
        loop {
            {
                let guard = self.wake_mutex.lock().expect("flusher wake mutex poisoned");
                let _ = self.wake_cv.wait_timeout(guard, self.interval);
            }
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let least_pages = if last_thorough.elapsed() >= self.thorough_interval {
                0
            } else {
                self.least_pages
            };
            match self.queue.flush(least_pages) {
                Ok(_) => {
                    if least_pages == 0 {
                        last_thorough = Instant::now();
                    }
                    if let Some(cb) = &self.on_flush {
                        cb();
                    }
                }
                Err(err) => log::error!("async flusher tick failed: {err}"),
            }
        }

        for attempt in 1..=3 {
            if let Err(err) = self.queue.flush(0) {
                log::error!("async flusher shutdown flush attempt {attempt} failed: {err}");
            } else {
                break;
            }
        }
    }
}

/// A pending request to make `next_offset` durable, shared between the
/// producer that enqueues it and the flusher thread that resolves it.
struct GroupCommitLatch {
    result: Mutex<Option<bool>>,
    cv: Condvar,
}

impl GroupCommitLatch {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            cv: Condvar::new(),
        }
    }

    fn signal(&self, success: bool) {
        let mut guard = self.result.lock().expect("group commit latch poisoned");
        *guard = Some(success);
        self.cv.notify_all();
    }

    /// Waits up to `timeout`. §4.5: "Return: flushOK == true iff signaled
    /// within timeout AND the flusher marked success" — so an unsignaled
    /// timeout reports failure without retracting the record itself.
    fn wait(&self, timeout: Duration) -> bool {
        let guard = self.result.lock().expect("group commit latch poisoned");
        let (guard, _timeout_result) = self
            .cv
            .wait_timeout_while(guard, timeout, |result| result.is_none())
            .expect("group commit latch poisoned");
        guard.unwrap_or(false)
    }
}

struct GroupCommitRequest {
    next_offset: u64,
    latch: Arc<GroupCommitLatch>,
}

/// `SyncGroupFlusher` (§4.5): a double-buffered request queue. Producers
/// push into the write buffer; the background thread swaps it out,
/// flushes, and resolves each request's latch.
pub struct SyncGroupFlusher {
    inner: Arc<SyncInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

struct SyncInner {
    queue: Arc<SegmentQueue>,
    write_buffer: Mutex<Vec<GroupCommitRequest>>,
    wake_cv: Condvar,
    shutdown: AtomicBool,
    on_flush: Option<OnFlush>,
}

impl SyncGroupFlusher {
    pub fn start(queue: Arc<SegmentQueue>) -> Self {
        Self::start_with_checkpoint(queue, None)
    }

    pub fn start_with_checkpoint(queue: Arc<SegmentQueue>, on_flush: Option<OnFlush>) -> Self {
        let inner = Arc::new(SyncInner {
            queue,
            write_buffer: Mutex::new(Vec::new()),
            wake_cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
            on_flush,
        });
        let worker = inner.clone();
        let handle = std::thread::Builder::new()
            .name("commitlog-sync-group-flusher".into())
            .spawn(move || worker.run())
            .expect("failed to spawn sync group flusher thread");
        Self {
            inner,
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue a request that `next_offset` be durable, and block the
    /// calling producer thread until it is (or `timeout` elapses).
    pub fn put_request(&self, next_offset: u64, timeout: Duration) -> bool {
        let latch = Arc::new(GroupCommitLatch::new());
        {
            let mut buffer = self
                .inner
                .write_buffer
                .lock()
                .expect("sync flusher write buffer poisoned");
            buffer.push(GroupCommitRequest {
                next_offset,
                latch: latch.clone(),
            });
        }
        self.inner.wake_cv.notify_all();
        latch.wait(timeout)
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.wake_cv.notify_all();
        if let Some(handle) = self.handle.lock().expect("flusher handle mutex poisoned").take() {
            let _ = handle.join();
        }
    }
}

impl SyncInner {
    fn run(&self) {
        loop {
            let batch = {
                let guard = self
                    .write_buffer
                    .lock()
                    .expect("sync flusher write buffer poisoned");
                let mut guard = self
                    .wake_cv
                    .wait_timeout_while(guard, Duration::from_millis(10), |buffer| {
                        buffer.is_empty() && !self.shutdown.load(Ordering::Acquire)
                    })
                    .expect("sync flusher write buffer poisoned")
                    .0;
                std::mem::take(&mut *guard)
            };

            if !batch.is_empty() {
                for request in batch {
                    // A request may straddle a rotation the flusher hasn't
                    // caught up to yet, so give it one extra attempt (§4.5).
                    let mut committed = self.queue.flush(0).unwrap_or(0);
                    if committed < request.next_offset {
                        committed = self.queue.flush(0).unwrap_or(committed);
                    }
                    request.latch.signal(committed >= request.next_offset);
                }
                if let Some(cb) = &self.on_flush {
                    cb();
                }
            }

            if self.shutdown.load(Ordering::Acquire) {
                let remaining = std::mem::take(
                    &mut *self
                        .write_buffer
                        .lock()
                        .expect("sync flusher write buffer poisoned"),
                );
                for request in remaining {
                    let committed = self.queue.flush(0).unwrap_or(0);
                    request.latch.signal(committed >= request.next_offset);
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::MessageExt;
    use crate::segment_queue::SegmentQueue;
    use tempfile::tempdir;

    #[test]
    fn sync_group_flusher_resolves_request_once_durable() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(SegmentQueue::load(dir.path().to_path_buf(), 4096).unwrap());
        let tail = queue.ensure_tail().unwrap();
        let local = match tail.reserve(16) {
            crate::segment::ReserveOutcome::Reserved { local_offset, .. } => local_offset,
            _ => unreachable!(),
        };
        tail.write_and_publish(local, &[1u8; 16]).unwrap();
        let target = tail.base_offset() + tail.wrote() as u64;

        let flusher = SyncGroupFlusher::start(queue);
        let ok = flusher.put_request(target, Duration::from_secs(2));
        assert!(ok);
        flusher.shutdown();
    }

    #[test]
    fn sync_group_flusher_invokes_checkpoint_callback_on_flush() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(SegmentQueue::load(dir.path().to_path_buf(), 4096).unwrap());
        let tail = queue.ensure_tail().unwrap();
        let local = match tail.reserve(16) {
            crate::segment::ReserveOutcome::Reserved { local_offset, .. } => local_offset,
            _ => unreachable!(),
        };
        tail.write_and_publish(local, &[1u8; 16]).unwrap();
        let target = tail.base_offset() + tail.wrote() as u64;

        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let calls_for_cb = calls.clone();
        let flusher = SyncGroupFlusher::start_with_checkpoint(
            queue,
            Some(Arc::new(move || {
                calls_for_cb.fetch_add(1, Ordering::Relaxed);
            })),
        );
        assert!(flusher.put_request(target, Duration::from_secs(2)));
        assert!(calls.load(Ordering::Relaxed) >= 1);
        flusher.shutdown();
    }

    #[test]
    fn sync_group_flusher_times_out_if_never_satisfied() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(SegmentQueue::load(dir.path().to_path_buf(), 4096).unwrap());
        queue.ensure_tail().unwrap();
        let flusher = SyncGroupFlusher::start(queue);
        // Ask for an offset that will never be written.
        let ok = flusher.put_request(1_000_000, Duration::from_millis(50));
        assert!(!ok);
        flusher.shutdown();
    }

    #[test]
    fn async_flusher_eventually_flushes_dirty_pages() {
        let dir = tempdir().unwrap();
        let queue = Arc::new(SegmentQueue::load(dir.path().to_path_buf(), 4096).unwrap());
        let tail = queue.ensure_tail().unwrap();
        let local = match tail.reserve(16) {
            crate::segment::ReserveOutcome::Reserved { local_offset, .. } => local_offset,
            _ => unreachable!(),
        };
        tail.write_and_publish(local, &[1u8; 16]).unwrap();

        let flusher = AsyncFlusher::start(queue.clone(), Duration::from_millis(20), 0, Duration::from_secs(10));
        flusher.wake();
        let deadline = Instant::now() + Duration::from_secs(2);
        while tail.flushed_offset() < tail.wrote() {
            assert!(Instant::now() < deadline, "async flusher never caught up");
            std::thread::sleep(Duration::from_millis(10));
        }
        flusher.shutdown();
        let _ = MessageExt::new("x", vec![]);
    }
}
