use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};

use crate::error::{Error, Result};

/// A fixed-size memory-mapped file.
///
/// Owns both the `File` and the `MmapMut`; dropping a `MmapFile` unmaps the
/// region deterministically (see `segment::Segment::destroy`, which relies
/// on this instead of reaching for an explicit unmap API).
pub struct MmapFile {
    file: File,
    map: MmapMut,
    len: usize,
}

impl MmapFile {
    /// Create (or truncate) a file of exactly `len` bytes and map it.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    /// Create a brand-new file, failing if one already exists at `path`.
    pub fn create_new(path: &Path, len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        let file = OpenOptions::new()
            .create_new(true)
            .read(true)
            .write(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    /// Open an existing file and map its full length.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Err(Error::Unsupported("mmap length must be non-zero"));
        }
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };
        Ok(Self { file, map, len })
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.map
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.map
    }

    pub fn range(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(len)
            .ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(&self.map[offset..end])
    }

    pub fn range_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset
            .checked_add(len)
            .ok_or(Error::Corrupt("range overflow"))?;
        if end > self.len {
            return Err(Error::Corrupt("range out of bounds"));
        }
        Ok(&mut self.map[offset..end])
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// `fsync` the backing file descriptor (metadata + data).
    pub fn sync_file(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Schedule dirty pages for writeback without blocking for completion.
    pub fn flush_async(&self) -> Result<()> {
        self.map.flush_async()?;
        Ok(())
    }

    /// Force dirty pages to disk and block until the write completes.
    pub fn flush_sync(&self) -> Result<()> {
        self.map.flush()?;
        Ok(())
    }

    /// Touch every 4 KiB page to force the OS to back it with real memory
    /// and disk blocks ahead of time, rather than taking a page fault the
    /// first time the critical path writes to it (§4.1 `prefault`).
    pub fn prefault(&mut self) {
        let len = self.map.len();
        let page_size = 4096;
        let mut offset = 0;
        while offset < len {
            self.map[offset] = self.map[offset];
            offset += page_size;
        }
    }

    /// Pin the mapping in RAM (`mlock`) and advise the kernel the whole
    /// region will be needed soon (`madvise(MADV_WILLNEED)`).
    #[cfg(unix)]
    pub fn mlock(&self) -> Result<()> {
        let ptr = self.map.as_ptr() as *const libc::c_void;
        let rc = unsafe { libc::mlock(ptr, self.len) };
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let rc = unsafe { libc::madvise(ptr as *mut libc::c_void, self.len, libc::MADV_WILLNEED) };
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn mlock(&self) -> Result<()> {
        Ok(())
    }

    /// Release the `mlock` pin taken by `mlock`.
    #[cfg(unix)]
    pub fn munlock(&self) -> Result<()> {
        let ptr = self.map.as_ptr() as *const libc::c_void;
        let rc = unsafe { libc::munlock(ptr, self.len) };
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn munlock(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn create_then_open_round_trips_bytes() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        let mut mmap = MmapFile::create(&path, 4096).unwrap();
        mmap.range_mut(10, 4).unwrap().copy_from_slice(b"abcd");
        mmap.flush_sync().unwrap();
        drop(mmap);

        let reopened = MmapFile::open(&path).unwrap();
        assert_eq!(reopened.range(10, 4).unwrap(), b"abcd");
        assert_eq!(reopened.len(), 4096);
    }

    #[test]
    fn create_new_rejects_existing_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        let _first = MmapFile::create(&path, 4096).unwrap();
        let second = MmapFile::create_new(&path, 4096);
        assert!(matches!(second, Err(Error::Io(_))));
    }

    #[test]
    fn range_mut_rejects_out_of_bounds() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        let mut mmap = MmapFile::create(&path, 16).unwrap();
        assert!(mmap.range_mut(10, 10).is_err());
    }

    #[test]
    fn prefault_does_not_panic_on_small_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("seg");
        let mut mmap = MmapFile::create(&path, 8192).unwrap();
        mmap.prefault();
    }
}
