//! `StoreCheckpoint` collaborator (§6): the engine's only interaction with
//! the broker-wide checkpoint file is reading `physMsgTimestamp` at startup
//! (to pick where abnormal recovery starts scanning from) and writing it
//! back after each flush batch. `logicsMsgTimestamp`/`indexMsgTimestamp`
//! belong to the consume-queue and key-hash indexers — out of scope here —
//! but the engine must not clobber them, so the whole record round-trips
//! through this file unchanged except for the one field it owns.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use crate::mmap::MmapFile;
use crate::Result;

const MAGIC: u32 = 0x4348_4B50; // "CHKP"
const RECORD_LEN: usize = 4 + 8 * 3;

/// Mmap-backed checkpoint record, mirroring the teacher's `ControlFile`
/// pattern of a tiny fixed-layout mapped file instead of ad-hoc
/// read/parse/write round trips on every update.
pub struct StoreCheckpoint {
    path: PathBuf,
    mmap: Mutex<MmapFile>,
    phys_msg_timestamp: AtomicI64,
}

impl StoreCheckpoint {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut mmap = if path.exists() {
            MmapFile::open(&path)?
        } else {
            let mut created = MmapFile::create(&path, RECORD_LEN)?;
            created.range_mut(0, 4)?.copy_from_slice(&MAGIC.to_be_bytes());
            created.flush_sync()?;
            created
        };

        let magic = u32::from_be_bytes(mmap.range(0, 4)?.try_into().unwrap());
        if magic != MAGIC {
            mmap.range_mut(0, RECORD_LEN)?.fill(0);
            mmap.range_mut(0, 4)?.copy_from_slice(&MAGIC.to_be_bytes());
        }
        let phys = i64::from_be_bytes(mmap.range(4, 8)?.try_into().unwrap());

        Ok(Self {
            path,
            mmap: Mutex::new(mmap),
            phys_msg_timestamp: AtomicI64::new(phys),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `getMinTimestamp` (§6): the earliest of the three known-durable
    /// timestamps. Only `physMsgTimestamp` is ever written by this engine;
    /// the other two are read back verbatim so an external indexer's
    /// progress is still honored when recovery picks a starting point.
    pub fn min_timestamp(&self) -> Result<i64> {
        let mmap = self.mmap.lock().expect("checkpoint mutex poisoned");
        let phys = i64::from_be_bytes(mmap.range(4, 8)?.try_into().unwrap());
        let logics = i64::from_be_bytes(mmap.range(12, 8)?.try_into().unwrap());
        let index = i64::from_be_bytes(mmap.range(20, 8)?.try_into().unwrap());
        Ok(phys.min(logics).min(index))
    }

    pub fn phys_msg_timestamp(&self) -> i64 {
        self.phys_msg_timestamp.load(Ordering::Acquire)
    }

    pub fn set_phys_msg_timestamp(&self, timestamp: i64) -> Result<()> {
        self.phys_msg_timestamp.store(timestamp, Ordering::Release);
        let mut mmap = self.mmap.lock().expect("checkpoint mutex poisoned");
        mmap.range_mut(4, 8)?.copy_from_slice(&timestamp.to_be_bytes());
        mmap.flush_sync()?;
        Ok(())
    }
}
