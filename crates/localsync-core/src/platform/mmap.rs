//! File-backed shared memory mappings.
//!
//! A region is a regular file of fixed size mapped `MAP_SHARED`, so a second
//! process that maps the same path sees the same bytes without copying.

#![allow(unsafe_code)]

use crate::error::{LocalSyncError, Result};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::ptr::NonNull;
use tracing::debug;

/// A fixed-size shared mapping of a file.
#[derive(Debug)]
pub struct MappedRegion {
    ptr: NonNull<u8>,
    len: usize,
    path: PathBuf,
    _file: File,
}

// SAFETY: the mapping stays valid for the lifetime of the struct and is only
// unmapped in Drop. Access discipline (one writer per region, handoff by
// offset) is enforced by the shared buffer built on top of it.
unsafe impl Send for MappedRegion {}
// SAFETY: see above; shared references only hand out reads or raw pointers.
unsafe impl Sync for MappedRegion {}

impl MappedRegion {
    /// Create a zero-filled backing file of `len` bytes and map it.
    pub fn create(path: &Path, len: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| LocalSyncError::io_with_path(e, path))?;
        file.set_len(len as u64)
            .map_err(|e| LocalSyncError::io_with_path(e, path))?;
        Self::map(file, path, len)
    }

    /// Map an existing backing file with whatever size it has.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| LocalSyncError::io_with_path(e, path))?;
        let len = file
            .metadata()
            .map_err(|e| LocalSyncError::io_with_path(e, path))?
            .len() as usize;
        Self::map(file, path, len)
    }

    #[cfg(unix)]
    fn map(file: File, path: &Path, len: usize) -> Result<Self> {
        use nix::sys::mman::{mmap, MapFlags, ProtFlags};
        use std::num::NonZeroUsize;

        let length = NonZeroUsize::new(len).ok_or_else(|| LocalSyncError::Config {
            message: format!("shared region {} is empty", path.display()),
        })?;

        // SAFETY: we map a file we own read/write with MAP_SHARED; the
        // returned pointer is valid for `len` bytes until munmap in Drop.
        let ptr = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                &file,
                0,
            )
        }?;

        debug!("Mapped shared region {} ({} bytes)", path.display(), len);

        Ok(Self {
            ptr: ptr.cast::<u8>(),
            len,
            path: path.to_path_buf(),
            _file: file,
        })
    }

    #[cfg(not(unix))]
    fn map(_file: File, path: &Path, _len: usize) -> Result<Self> {
        Err(LocalSyncError::Config {
            message: format!(
                "shared memory regions are not supported on this platform ({})",
                path.display()
            ),
        })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Address range covered by the mapping.
    pub fn addr_range(&self) -> std::ops::Range<usize> {
        let start = self.ptr.as_ptr() as usize;
        start..start + self.len
    }

    /// Read view of `len` bytes at `offset`.
    ///
    /// The caller must have validated the range against [`len`](Self::len).
    pub(crate) fn bytes(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.len);
        // SAFETY: the range lies inside the live mapping. The peer process
        // only writes this region while we have handed it off.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().add(offset), len) }
    }

    /// Mutable view of `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// The caller must guarantee that no other view of this range is alive.
    pub(crate) unsafe fn bytes_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        debug_assert!(offset + len <= self.len);
        // SAFETY: range checked by the caller; exclusivity is the caller's
        // contract.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr().add(offset), len) }
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            // SAFETY: ptr/len describe exactly the mapping created in map().
            let result = unsafe { nix::sys::mman::munmap(self.ptr.cast(), self.len) };
            if let Err(e) = result {
                tracing::warn!("Failed to unmap {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_two_mappings_share_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        let writer = MappedRegion::create(&path, 64).unwrap();
        let reader = MappedRegion::open(&path).unwrap();

        assert_eq!(reader.len(), 64);
        // SAFETY: no other view of this range exists in the test.
        unsafe { writer.bytes_mut(8, 4) }.copy_from_slice(b"ping");
        assert_eq!(reader.bytes(8, 4), b"ping");
    }

    #[test]
    fn test_create_refuses_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("region");
        let _first = MappedRegion::create(&path, 16).unwrap();
        assert!(MappedRegion::create(&path, 16).is_err());
    }
}
