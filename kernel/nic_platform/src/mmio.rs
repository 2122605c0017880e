//! Register access through a memory-mapped I/O window.

use core::mem::size_of;
use core::ptr::NonNull;
use volatile::{ReadOnly, Volatile};
use crate::RegisterIo;

/// A memory-mapped register window of `len` bytes starting at `base`.
///
/// Every access goes through a `volatile` cell, so the compiler can neither elide nor reorder it.
/// Accesses outside the window, or misaligned for their width, are logged and dropped;
/// such reads return all-ones like a device that has fallen off the bus.
pub struct MmioRegion {
    base: NonNull<u8>,
    len: usize,
}

// The window is only accessed through volatile cells.
unsafe impl Send for MmioRegion {}
unsafe impl Sync for MmioRegion {}

impl MmioRegion {
    /// Creates a register window over already-mapped device memory.
    ///
    /// # Safety
    /// `base..base+len` must be mapped as uncached device memory for the lifetime of this object,
    /// and must not be accessed through any other non-volatile path.
    pub unsafe fn new(base: NonNull<u8>, len: usize) -> MmioRegion {
        MmioRegion { base, len }
    }

    /// The size of this window in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    fn cell<T: Copy>(&self, offset: usize) -> Option<*mut u8> {
        let width = size_of::<T>();
        if offset.checked_add(width).map_or(true, |end| end > self.len) || offset % width != 0 {
            error!("MmioRegion: invalid {}-byte access at offset {:#X} (window is {:#X} bytes)", width, offset, self.len);
            return None;
        }
        Some(unsafe { self.base.as_ptr().add(offset) })
    }

    fn read<T: Copy>(&self, offset: usize, absent: T) -> T {
        match self.cell::<T>(offset) {
            Some(ptr) => unsafe { (*(ptr as *const ReadOnly<T>)).read() },
            None => absent,
        }
    }

    fn write<T: Copy>(&self, offset: usize, value: T) {
        if let Some(ptr) = self.cell::<T>(offset) {
            unsafe { (*(ptr as *mut Volatile<T>)).write(value) };
        }
    }
}

impl RegisterIo for MmioRegion {
    fn read8(&self, offset: usize) -> u8 { self.read(offset, u8::MAX) }
    fn read16(&self, offset: usize) -> u16 { self.read(offset, u16::MAX) }
    fn read32(&self, offset: usize) -> u32 { self.read(offset, u32::MAX) }
    fn write8(&self, offset: usize, value: u8) { self.write(offset, value) }
    fn write16(&self, offset: usize, value: u16) { self.write(offset, value) }
    fn write32(&self, offset: usize, value: u32) { self.write(offset, value) }
}
