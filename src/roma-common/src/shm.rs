//! Shared-memory region for out-of-band payload transfer.
//!
//! The parent creates an anonymous memfd, maps it, and passes the fd to the
//! worker at spawn time; the worker maps the same fd. Each side writes only
//! its own half of the region (parent: lower half, child: upper half), so a
//! frame referencing the region is never overwritten by the peer while the
//! receiver is still reading it — the channel alternates strictly between
//! request and response per direction.

use std::num::NonZeroUsize;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::ptr::NonNull;

use nix::sys::memfd::{memfd_create, MemFdCreateFlag};
use nix::sys::mman::{mmap, munmap, MapFlags, ProtFlags};
use nix::unistd::ftruncate;

use crate::frame::ChannelError;

/// A memory region mapped into both sides of a worker channel.
pub struct SharedRegion {
    map: NonNull<libc::c_void>,
    len: usize,
    fd: OwnedFd,
}

// SAFETY: the raw mapping pointer is only dereferenced through the
// bounds-checked `write_at`/`read_at` methods, and a `SharedRegion` is owned
// by exactly one `Channel`, which serializes all access.
unsafe impl Send for SharedRegion {}

impl SharedRegion {
    /// Create a new region of `len` bytes backed by an anonymous memfd.
    pub fn create(len: usize) -> Result<Self, ChannelError> {
        let fd = memfd_create(c"roma-shared-buffer", MemFdCreateFlag::MFD_CLOEXEC)
            .map_err(io_from_errno)?;
        ftruncate(&fd, len as libc::off_t).map_err(io_from_errno)?;
        Self::map(fd, len)
    }

    /// Map an existing region fd, as inherited by a worker process.
    pub fn from_fd(fd: OwnedFd, len: usize) -> Result<Self, ChannelError> {
        Self::map(fd, len)
    }

    fn map(fd: OwnedFd, len: usize) -> Result<Self, ChannelError> {
        let length = NonZeroUsize::new(len).ok_or_else(|| {
            ChannelError::Io(std::io::Error::other("shared region length must be non-zero"))
        })?;
        // SAFETY: mapping a fresh file-backed region; the pointer is owned by
        // the returned value and unmapped exactly once in Drop.
        let map = unsafe {
            mmap(
                None,
                length,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_SHARED,
                fd.as_fd(),
                0,
            )
        }
        .map_err(io_from_errno)?;
        Ok(Self { map, len, fd })
    }

    /// Total size of the region in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region has zero capacity. Always false for a mapped
    /// region; present for completeness of the slice-like API.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The fd to hand to the worker process at spawn time.
    pub fn fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }

    /// Raw fd value, for building the worker's command line.
    pub fn raw_fd(&self) -> i32 {
        self.fd.as_raw_fd()
    }

    pub(crate) fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), ChannelError> {
        let end = offset.checked_add(data.len()).ok_or(ChannelError::PayloadTooLarge)?;
        if end > self.len {
            return Err(ChannelError::PayloadTooLarge);
        }
        // SAFETY: bounds checked above; the peer never writes this half.
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.map.as_ptr().cast::<u8>().add(offset),
                data.len(),
            );
        }
        Ok(())
    }

    pub(crate) fn read_at(&self, offset: usize, len: usize) -> Result<Vec<u8>, ChannelError> {
        let end = offset.checked_add(len).ok_or(ChannelError::PayloadTooLarge)?;
        if end > self.len {
            return Err(ChannelError::PayloadTooLarge);
        }
        let mut data = vec![0u8; len];
        // SAFETY: bounds checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.map.as_ptr().cast::<u8>().add(offset),
                data.as_mut_ptr(),
                len,
            );
        }
        Ok(data)
    }
}

impl Drop for SharedRegion {
    fn drop(&mut self) {
        // SAFETY: `map`/`len` came from a successful mmap of this length.
        if let Err(errno) = unsafe { munmap(self.map, self.len) } {
            tracing::warn!(%errno, "failed to unmap shared region");
        }
    }
}

fn io_from_errno(errno: nix::errno::Errno) -> ChannelError {
    ChannelError::Io(std::io::Error::from_raw_os_error(errno as i32))
}
