//! Shared message buffer: zero-copy handoff of protocol messages.
//!
//! Two fixed-capacity regions, one per direction. The parent creates both
//! before spawning the helper; the helper maps the same files with the roles
//! swapped, so its `remote` is the parent's `local` and vice versa.
//!
//! ```text
//!   parent.local  == parent-to-child file ==  child.remote
//!   parent.remote == child-to-parent file ==  child.local
//! ```
//!
//! Only `(offset, length)` pairs cross the control channel. Exactly one
//! message per direction is in flight, so no locking is needed: the region is
//! owned by the reader from handoff until it sends its next message.

#![allow(unsafe_code)]

use crate::config::TransportConfig;
use crate::error::{LocalSyncError, Result};
use crate::platform::mmap::MappedRegion;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::debug;

const PARENT_TO_CHILD: &str = "parent-to-child";
const CHILD_TO_PARENT: &str = "child-to-parent";

/// Paths of the two backing files, handed to the helper through its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionHandles {
    pub parent_to_child: PathBuf,
    pub child_to_parent: PathBuf,
}

/// The pair of shared regions seen from one side.
#[derive(Debug)]
pub struct SharedMessageBuffer {
    local: MappedRegion,
    remote: MappedRegion,
    max_message_size: usize,
    handles: RegionHandles,
    send_slot_taken: AtomicBool,
    // Declared last: the files must outlive the mappings above.
    _dir: Option<TempDir>,
}

/// Capacity of one region for a given message size.
pub fn region_capacity(max_message_size: usize) -> usize {
    max_message_size * TransportConfig::REGION_FACTOR
}

impl SharedMessageBuffer {
    /// Create both regions in a private temporary directory.
    pub fn create_parent_side(max_message_size: usize) -> Result<Self> {
        if max_message_size == 0 {
            return Err(LocalSyncError::Config {
                message: "max message size must be positive".to_string(),
            });
        }
        let capacity = region_capacity(max_message_size);
        let dir = tempfile::Builder::new().prefix("localsync-").tempdir()?;
        let handles = RegionHandles {
            parent_to_child: dir.path().join(PARENT_TO_CHILD),
            child_to_parent: dir.path().join(CHILD_TO_PARENT),
        };

        let local = MappedRegion::create(&handles.parent_to_child, capacity)?;
        let remote = MappedRegion::create(&handles.child_to_parent, capacity)?;

        debug!(
            "Created shared message buffer in {} ({} bytes per region)",
            dir.path().display(),
            capacity
        );

        Ok(Self {
            local,
            remote,
            max_message_size,
            handles,
            send_slot_taken: AtomicBool::new(false),
            _dir: Some(dir),
        })
    }

    /// Attach to the regions created by the parent.
    ///
    /// Both sides must agree on the message size; a mismatch is fatal.
    pub fn attach_child_side(max_message_size: usize, handles: &RegionHandles) -> Result<Self> {
        let expected = region_capacity(max_message_size);
        let local = Self::open_checked(&handles.child_to_parent, expected)?;
        let remote = Self::open_checked(&handles.parent_to_child, expected)?;

        Ok(Self {
            local,
            remote,
            max_message_size,
            handles: handles.clone(),
            send_slot_taken: AtomicBool::new(false),
            _dir: None,
        })
    }

    fn open_checked(path: &Path, expected: usize) -> Result<MappedRegion> {
        let region = MappedRegion::open(path)?;
        if region.len() != expected {
            return Err(LocalSyncError::ConfigMismatch {
                expected,
                actual: region.len(),
            });
        }
        Ok(region)
    }

    pub fn capacity(&self) -> usize {
        self.local.len()
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    pub fn handles(&self) -> &RegionHandles {
        &self.handles
    }

    /// Clear the local region for a new attempt.
    pub fn reset(&self) -> Result<()> {
        if self.send_slot_taken.load(Ordering::SeqCst) {
            return Err(LocalSyncError::BufferContract(
                "cannot reset while an outgoing message is alive".to_string(),
            ));
        }
        // SAFETY: no outgoing message is alive, so nobody else views `local`.
        unsafe { self.local.bytes_mut(0, self.local.len()) }.fill(0);
        Ok(())
    }

    /// Scratch space for one outgoing message at the start of `local`.
    ///
    /// Write the protocol bytes straight into the returned message and pass
    /// it to `send`. Only one outgoing message may be alive at a time.
    pub fn allocate_for_send(self: &Arc<Self>, len: usize) -> Result<OutgoingMessage> {
        if len > self.capacity() {
            return Err(LocalSyncError::BufferContract(format!(
                "message of {} bytes exceeds shared buffer capacity {}",
                len,
                self.capacity()
            )));
        }
        if self.send_slot_taken.swap(true, Ordering::SeqCst) {
            return Err(LocalSyncError::BufferContract(
                "previous outgoing message is still in use".to_string(),
            ));
        }
        Ok(OutgoingMessage {
            storage: Storage::Shared {
                buffer: Arc::clone(self),
                len,
            },
        })
    }

    /// Offset of `data` inside `local`; fails unless fully contained.
    pub fn to_offset(&self, data: &[u8]) -> Result<usize> {
        let range = self.local.addr_range();
        let start = data.as_ptr() as usize;
        let end = start + data.len();
        if start < range.start || end > range.end {
            return Err(LocalSyncError::BufferContract(format!(
                "message of {} bytes is not inside the local shared region",
                data.len()
            )));
        }
        Ok(start - range.start)
    }

    /// Read-only view of a received message in `remote`.
    pub fn view_at(&self, offset: usize, len: usize) -> Result<&[u8]> {
        match offset.checked_add(len) {
            Some(end) if end <= self.remote.len() => Ok(self.remote.bytes(offset, len)),
            _ => Err(LocalSyncError::BufferContract(format!(
                "received message at offset {} with {} bytes exceeds region of {} bytes",
                offset,
                len,
                self.remote.len()
            ))),
        }
    }

    fn release_send_slot(&self) {
        self.send_slot_taken.store(false, Ordering::SeqCst);
    }
}

enum Storage {
    Shared {
        buffer: Arc<SharedMessageBuffer>,
        len: usize,
    },
    Owned(Vec<u8>),
}

/// Writable storage for one outgoing message.
///
/// Local transports hand out a view into the shared `local` region; other
/// transports use plain heap memory.
pub struct OutgoingMessage {
    storage: Storage,
}

impl OutgoingMessage {
    /// Heap-backed message for transports without a shared buffer.
    pub fn owned(len: usize) -> Self {
        Self {
            storage: Storage::Owned(vec![0; len]),
        }
    }

    /// True if the bytes live in a shared region.
    pub fn is_shared(&self) -> bool {
        matches!(self.storage, Storage::Shared { .. })
    }
}

impl Deref for OutgoingMessage {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.storage {
            Storage::Shared { buffer, len } => buffer.local.bytes(0, *len),
            Storage::Owned(data) => data,
        }
    }
}

impl DerefMut for OutgoingMessage {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.storage {
            // SAFETY: the send slot flag guarantees this is the only
            // OutgoingMessage for the region, and `&mut self` guarantees no
            // other view of it is alive.
            Storage::Shared { buffer, len } => unsafe { buffer.local.bytes_mut(0, *len) },
            Storage::Owned(data) => data,
        }
    }
}

impl Drop for OutgoingMessage {
    fn drop(&mut self) {
        if let Storage::Shared { buffer, .. } = &self.storage {
            buffer.release_send_slot();
        }
    }
}

impl std::fmt::Debug for OutgoingMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingMessage")
            .field("shared", &self.is_shared())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_is_twice_message_size() {
        let buffer = SharedMessageBuffer::create_parent_side(1024).unwrap();
        assert_eq!(buffer.capacity(), 2048);
    }

    #[test]
    fn test_child_sees_parent_local_as_remote() {
        let parent = Arc::new(SharedMessageBuffer::create_parent_side(1024).unwrap());
        let child = SharedMessageBuffer::attach_child_side(1024, parent.handles()).unwrap();

        let mut message = parent.allocate_for_send(10).unwrap();
        message.copy_from_slice(b"HELLO-PING");
        let offset = parent.to_offset(&message).unwrap();

        assert_eq!(child.view_at(offset, 10).unwrap(), b"HELLO-PING");
    }

    #[test]
    fn test_size_mismatch_is_fatal() {
        let parent = SharedMessageBuffer::create_parent_side(1024).unwrap();
        let err = SharedMessageBuffer::attach_child_side(512, parent.handles()).unwrap_err();
        match err {
            LocalSyncError::ConfigMismatch { expected, actual } => {
                assert_eq!(expected, 1024);
                assert_eq!(actual, 2048);
            }
            other => panic!("Expected ConfigMismatch, got: {:?}", other),
        }
    }

    #[test]
    fn test_foreign_memory_has_no_offset() {
        let buffer = SharedMessageBuffer::create_parent_side(64).unwrap();
        let heap = vec![0u8; 8];
        assert!(matches!(
            buffer.to_offset(&heap),
            Err(LocalSyncError::BufferContract(_))
        ));
    }

    #[test]
    fn test_only_one_outgoing_message() {
        let buffer = Arc::new(SharedMessageBuffer::create_parent_side(64).unwrap());
        let first = buffer.allocate_for_send(8).unwrap();
        assert!(buffer.allocate_for_send(8).is_err());
        drop(first);
        assert!(buffer.allocate_for_send(8).is_ok());
    }

    #[test]
    fn test_oversized_allocation_is_rejected() {
        let buffer = Arc::new(SharedMessageBuffer::create_parent_side(64).unwrap());
        assert!(buffer.allocate_for_send(129).is_err());
        assert!(buffer.allocate_for_send(128).is_ok());
    }

    #[test]
    fn test_view_out_of_range() {
        let buffer = SharedMessageBuffer::create_parent_side(64).unwrap();
        assert!(buffer.view_at(120, 8).is_ok());
        assert!(buffer.view_at(121, 8).is_err());
        assert!(buffer.view_at(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_backing_files_removed_on_drop() {
        let buffer = SharedMessageBuffer::create_parent_side(64).unwrap();
        let path = buffer.handles().parent_to_child.clone();
        assert!(path.exists());
        drop(buffer);
        assert!(!path.exists());
    }
}
