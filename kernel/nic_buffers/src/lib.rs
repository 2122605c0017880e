//! Defines buffers that are used to send and receive packets.
//!
//! * [`HostBuffer`] is plain, suitably aligned host memory. It is what the network stack
//!   hands in (inside a [`TransmitFrame`]) and gets back (inside a [`ReceivedFrame`]).
//! * [`DmaBuffer`] is a `HostBuffer` plus its live device mapping.
//!   The mapping is released exactly once, when the `DmaBuffer` is 
//!   [`release`](DmaBuffer::release)d, [`unmap`](DmaBuffer::unmap)ped, or dropped.
//! * [`RxBufferPool`] produces the mapped receive buffers that are armed into the receive ring.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
extern crate nic_platform;


mod frame;

pub use frame::*;

use core::ops::{Deref, DerefMut};
use core::ptr::NonNull;
use alloc::sync::Arc;
use alloc::vec::Vec;
use nic_platform::{DeviceAddress, DmaDirection, DmaError, DmaMapper};


/// The default receive buffer size, enough for a standard Ethernet frame.
pub const RX_BUF_SIZE:       usize = 1536;
/// Alignment of receive buffers.
pub const RX_BUF_ALIGNMENT:  usize = 8;
/// Length of an Ethernet header.
pub const ETH_HLEN:          usize = 14;
/// Length of the Ethernet frame check sequence.
pub const ETH_FCS_LEN:       usize = 4;
/// Minimum Ethernet frame length, excluding the FCS. Shorter frames must be padded.
pub const ETH_ZLEN:          usize = 60;
/// The standard Ethernet MTU.
pub const ETH_DATA_LEN:      usize = 1500;

/// Returns the receive buffer size needed for frames of the given `mtu`.
///
/// Standard MTUs use [`RX_BUF_SIZE`]; jumbo MTUs add room for the Ethernet header,
/// a VLAN tag and the FCS.
pub fn rx_buffer_size(mtu: usize) -> usize {
    if mtu > ETH_DATA_LEN {
        mtu + ETH_HLEN + 8
    } else {
        RX_BUF_SIZE
    }
}


/// A contiguous buffer in host memory, whose start is aligned as requested at creation.
/// Auto-dereferences into a byte slice of its current length.
#[derive(Default)]
pub struct HostBuffer {
    storage: Vec<u8>,
    /// Offset of the aligned start within `storage`
    offset: usize,
    /// Usable bytes from the aligned start
    capacity: usize,
    /// Current length, at most `capacity`
    len: usize,
}

impl HostBuffer {
    /// Allocates a zero-filled buffer of `len` bytes starting on an `alignment` boundary.
    /// 
    /// # Arguments
    /// * `len`: the size of the buffer in bytes.
    /// * `alignment`: the required alignment of the buffer start, a power of two.
    pub fn new_zeroed(len: usize, alignment: usize) -> Result<HostBuffer, DmaError> {
        let alignment = alignment.max(1);
        if !alignment.is_power_of_two() {
            return Err(DmaError::OutOfMemory);
        }
        let total = len.checked_add(alignment - 1).ok_or(DmaError::OutOfMemory)?;
        let mut storage = Vec::new();
        storage.try_reserve_exact(total).map_err(|_| DmaError::OutOfMemory)?;
        storage.resize(total, 0);
        let offset = storage.as_ptr().align_offset(alignment);
        if offset >= alignment {
            return Err(DmaError::OutOfMemory);
        }
        Ok(HostBuffer { storage, offset, capacity: len, len })
    }

    /// Wraps an existing vector without copying it. The buffer is only byte-aligned.
    pub fn from_vec(data: Vec<u8>) -> HostBuffer {
        let len = data.len();
        HostBuffer { storage: data, offset: 0, capacity: len, len }
    }

    /// Copies `data` into a new byte-aligned buffer.
    pub fn copy_from_slice(data: &[u8]) -> Result<HostBuffer, DmaError> {
        let mut buffer = HostBuffer::new_zeroed(data.len(), 1)?;
        buffer.copy_from_slice_inner(data);
        Ok(buffer)
    }

    fn copy_from_slice_inner(&mut self, data: &[u8]) {
        self.storage[self.offset .. self.offset + data.len()].copy_from_slice(data);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The largest length this buffer can be set to.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Sets the buffer's length.
    ///
    /// Returns an error if the length is greater than the buffer's capacity.
    pub fn set_len(&mut self, len: usize) -> Result<(), &'static str> {
        if len > self.capacity {
            Err("HostBuffer::set_len(): length too long")
        } else {
            self.len = len;
            Ok(())
        }
    }

    /// A pointer to the (aligned) start of the buffer.
    pub fn as_non_null(&mut self) -> NonNull<u8> {
        // SAFETY: `offset` is within (or one past the end of) the storage allocation
        let ptr = unsafe { self.storage.as_mut_ptr().add(self.offset) };
        NonNull::new(ptr).unwrap_or(NonNull::dangling())
    }

    /// Consumes the buffer, returning its current contents as a vector.
    /// Buffers created by [`HostBuffer::from_vec`] are returned without copying.
    pub fn into_vec(mut self) -> Vec<u8> {
        if self.offset == 0 {
            self.storage.truncate(self.len);
            self.storage
        } else {
            self.deref().to_vec()
        }
    }
}

impl Deref for HostBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.storage[self.offset .. self.offset + self.len]
    }
}

impl DerefMut for HostBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.offset .. self.offset + self.len]
    }
}

impl core::fmt::Debug for HostBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "HostBuffer {{ len: {}, capacity: {} }}", self.len, self.capacity)
    }
}


/// A host buffer that is currently mapped for device access.
///
/// While it exists, the device may access the first [`len`](DmaBuffer::len) bytes of the buffer
/// at [`device_address`](DmaBuffer::device_address). 
/// The mapping is released exactly once, by whichever of `release`, `unmap` or `Drop` happens first.
pub struct DmaBuffer {
    buffer: HostBuffer,
    address: DeviceAddress,
    mapped_len: usize,
    direction: DmaDirection,
    mapper: Arc<dyn DmaMapper>,
    mapped: bool,
}

impl DmaBuffer {
    /// Allocates a zeroed buffer and maps it for the device.
    /// If the mapping fails, the memory is freed before returning.
    pub fn allocate_and_map(
        size: usize,
        alignment: usize,
        direction: DmaDirection,
        mapper: &Arc<dyn DmaMapper>,
    ) -> Result<DmaBuffer, DmaError> {
        let buffer = HostBuffer::new_zeroed(size, alignment)?;
        DmaBuffer::map(buffer, direction, mapper).map_err(|(e, _buffer)| e)
    }

    /// Maps the current contents of `buffer` for the device.
    /// On failure, the buffer is handed back unchanged.
    pub fn map(
        mut buffer: HostBuffer,
        direction: DmaDirection,
        mapper: &Arc<dyn DmaMapper>,
    ) -> Result<DmaBuffer, (DmaError, HostBuffer)> {
        let len = buffer.len();
        match mapper.map(buffer.as_non_null(), len, direction) {
            Ok(address) => Ok(DmaBuffer {
                buffer,
                address,
                mapped_len: len,
                direction,
                mapper: mapper.clone(),
                mapped: true,
            }),
            Err(e) => Err((e, buffer)),
        }
    }

    /// The address at which the device sees this buffer.
    pub fn device_address(&self) -> DeviceAddress {
        self.address
    }

    /// The number of mapped bytes.
    pub fn len(&self) -> usize {
        self.mapped_len
    }

    pub fn is_empty(&self) -> bool {
        self.mapped_len == 0
    }

    pub fn direction(&self) -> DmaDirection {
        self.direction
    }

    /// Makes `len` bytes written by the device visible to the CPU.
    pub fn sync_for_cpu(&self, len: usize) {
        self.mapper.sync_for_cpu(self.address, len.min(self.mapped_len), self.direction);
    }

    /// Returns the buffer to the device after the CPU has looked at (or written) `len` bytes.
    pub fn sync_for_device(&self, len: usize) {
        self.mapper.sync_for_device(self.address, len.min(self.mapped_len), self.direction);
    }

    /// The buffer contents as seen by the CPU. 
    /// Only meaningful for device-written data after [`sync_for_cpu`](DmaBuffer::sync_for_cpu).
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Ends the mapping and returns the underlying host buffer.
    pub fn unmap(mut self) -> HostBuffer {
        self.unmap_inner();
        core::mem::take(&mut self.buffer)
    }

    /// Ends the mapping and frees the memory.
    pub fn release(self) {
        drop(self.unmap());
    }

    fn unmap_inner(&mut self) {
        if self.mapped {
            self.mapped = false;
            self.mapper.unmap(self.address, self.mapped_len, self.direction);
        }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        self.unmap_inner();
    }
}

impl core::fmt::Debug for DmaBuffer {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(f, "DmaBuffer {{ addr: {:#X}, len: {}, dir: {:?} }}", self.address.value(), self.mapped_len, self.direction)
    }
}


/// The number of unmapped receive buffers kept around for reuse.
const MAX_SPARE_RX_BUFFERS: usize = 64;

/// Produces mapped, equally-sized buffers for the receive ring.
///
/// Buffers released back to the pool are unmapped, and their memory is kept 
/// (up to a bound) so that refilling the ring doesn't always hit the allocator.
pub struct RxBufferPool {
    buffer_size: usize,
    alignment: usize,
    mapper: Arc<dyn DmaMapper>,
    spares: Vec<HostBuffer>,
}

impl RxBufferPool {
    /// Creates an empty pool of `buffer_size`-byte receive buffers.
    pub fn new(buffer_size: usize, alignment: usize, mapper: Arc<dyn DmaMapper>) -> RxBufferPool {
        RxBufferPool {
            buffer_size,
            alignment,
            mapper,
            spares: Vec::new(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn mapper(&self) -> &Arc<dyn DmaMapper> {
        &self.mapper
    }

    /// The number of unmapped buffers available for reuse.
    pub fn spare_count(&self) -> usize {
        self.spares.len()
    }

    /// Returns a buffer mapped for device writes, reusing spare memory if there is any.
    pub fn allocate_and_map(&mut self) -> Result<DmaBuffer, DmaError> {
        let mut buffer = match self.spares.pop() {
            Some(b) => b,
            None => HostBuffer::new_zeroed(self.buffer_size, self.alignment)?,
        };
        if buffer.set_len(self.buffer_size).is_err() {
            buffer = HostBuffer::new_zeroed(self.buffer_size, self.alignment)?;
        }
        DmaBuffer::map(buffer, DmaDirection::FromDevice, &self.mapper).map_err(|(e, buffer)| {
            self.keep_spare(buffer);
            e
        })
    }

    /// Unmaps a receive buffer and keeps its memory for reuse.
    pub fn release(&mut self, buffer: DmaBuffer) {
        let host = buffer.unmap();
        self.keep_spare(host);
    }

    fn keep_spare(&mut self, buffer: HostBuffer) {
        if self.spares.len() < MAX_SPARE_RX_BUFFERS && buffer.capacity() == self.buffer_size {
            self.spares.push(buffer);
        }
    }

    /// Copies the first `len` bytes the device wrote into `buffer` into a new, minimal host buffer,
    /// then returns `buffer` to the device's ownership so that it can be re-armed in place.
    pub fn copy_break(&self, buffer: &DmaBuffer, len: usize) -> Result<HostBuffer, DmaError> {
        let len = len.min(buffer.len());
        buffer.sync_for_cpu(len);
        let copy = HostBuffer::copy_from_slice(&buffer.as_slice()[..len]);
        buffer.sync_for_device(len);
        if copy.is_err() {
            warn!("RxBufferPool::copy_break(): couldn't allocate {} bytes", len);
        }
        copy
    }
}
