//! Shared memory region.
use std::fs::File;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use memfd::MemfdOptions;
use memmap2::{MmapOptions, MmapRaw};

use crate::Error;

pub(crate) fn page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

#[inline]
pub(crate) fn round_to_page_size(nbytes: usize) -> usize {
    let ps = page_size();
    (nbytes.max(1) + ps - 1) / ps * ps
}

/// A memfd-backed mapping shared between the daemon and one client.
///
/// The allocating side (daemon) creates the memfd and maps it; the receiving side (client)
/// wraps the descriptor it got over the control socket. Dropping a region unmaps it and then
/// closes the descriptor, each exactly once. Regions are never cloned, only moved.
pub struct SharedRegion {
    name: String,
    // Field order matters: the mapping is released before the descriptor.
    mmap: MmapRaw,
    file: File,
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedRegion")
            .field("name", &self.name)
            .field("size", &self.mmap.len())
            .field("fd", &self.file.as_raw_fd())
            .finish()
    }
}

impl SharedRegion {
    /// Allocates a fresh region of at least `nbytes`, rounded up to the page size.
    pub fn create(name: &str, nbytes: usize) -> Result<Self, Error> {
        let size = round_to_page_size(nbytes);
        let memfd = MemfdOptions::default()
            .allow_sealing(false)
            .close_on_exec(true)
            .create(name)?;
        memfd.as_file().set_len(size as u64)?;

        let mmap = MmapOptions::new().len(size).map_raw(memfd.as_file())?;
        Ok(SharedRegion {
            name: name.to_owned(),
            mmap,
            file: memfd.into_file(),
        })
    }

    /// Maps `size` bytes of a descriptor received from the allocating side.
    pub fn open(name: &str, file: File, size: usize) -> Result<Self, Error> {
        let actual = file.metadata()?.len() as usize;
        if actual < size || size == 0 {
            return Err(Error::BufTooSmall {
                size: actual,
                required: size,
            });
        }
        let mmap = MmapOptions::new().len(size).map_raw(&file)?;
        Ok(SharedRegion {
            name: name.to_owned(),
            mmap,
            file,
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.mmap.len()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.mmap.as_mut_ptr()
    }

    fn word(&self, offset: usize) -> Result<&AtomicU64, Error> {
        if offset % 8 != 0 || offset.checked_add(8).map_or(true, |end| end > self.size()) {
            return Err(Error::OutOfBounds {
                offset,
                size: self.size(),
            });
        }
        // SAFETY: the mapping is page aligned, `offset` is 8-byte aligned and in bounds, and the
        // mapping outlives the returned reference.
        Ok(unsafe { &*(self.as_ptr().add(offset) as *const AtomicU64) })
    }

    /// Stores a raw word into the region. Only used for test instrumentation.
    pub fn write_word(&self, offset: usize, value: u64) -> Result<(), Error> {
        self.word(offset)?.store(value, Ordering::Release);
        Ok(())
    }

    /// Loads a raw word from the region. Only used for test instrumentation.
    pub fn read_word(&self, offset: usize) -> Result<u64, Error> {
        Ok(self.word(offset)?.load(Ordering::Acquire))
    }
}
