use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::mem::{align_of, size_of};
use core::ptr::NonNull;
use nic_platform::{DeviceAddress, DmaDirection, DmaError, DmaMapper};
use crate::Descriptor;

/// The device requires descriptor rings to start on this boundary.
pub const DESCRIPTOR_RING_ALIGNMENT: usize = 256;

/// Failures when creating a descriptor ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum RingError {
    /// Ring capacities must be a power of two and at least 2.
    #[display(fmt = "invalid descriptor ring capacity {}", _0)]
    InvalidCapacity(usize),
    /// The ring memory could not be allocated or mapped.
    #[display(fmt = "descriptor ring memory: {}", _0)]
    Dma(DmaError),
}

impl From<DmaError> for RingError {
    fn from(e: DmaError) -> Self {
        RingError::Dma(e)
    }
}

/// A circular array of descriptors in DMA-visible memory.
///
/// The ring owns its memory: it is allocated zeroed and aligned to [`DESCRIPTOR_RING_ALIGNMENT`], 
/// mapped for the device on creation, and unmapped and freed on drop.
/// Slots are addressed by free-running cursors; `slot` arguments are reduced modulo the capacity.
///
/// All descriptor accesses go through shared references, 
/// since the device is a concurrent observer of the same memory.
pub struct DescriptorRing<D: Descriptor> {
    descriptors: NonNull<D>,
    capacity: usize,
    layout: Layout,
    device_address: DeviceAddress,
    mapper: Arc<dyn DmaMapper>,
}

// The descriptors are only accessed through their atomic fields.
unsafe impl<D: Descriptor> Send for DescriptorRing<D> {}
unsafe impl<D: Descriptor> Sync for DescriptorRing<D> {}

impl<D: Descriptor> DescriptorRing<D> {
    /// Allocates and maps a ring of `capacity` descriptors, then [`reset`](Self::reset)s it.
    ///
    /// # Arguments
    /// * `capacity`: number of descriptors, a power of two no smaller than 2.
    /// * `mapper`: the DMA mapper through which the device will access the ring.
    pub fn new(capacity: usize, mapper: Arc<dyn DmaMapper>) -> Result<DescriptorRing<D>, RingError> {
        if capacity < 2 || !capacity.is_power_of_two() {
            return Err(RingError::InvalidCapacity(capacity));
        }
        let size = capacity.checked_mul(size_of::<D>()).ok_or(RingError::InvalidCapacity(capacity))?;
        let layout = Layout::from_size_align(size, DESCRIPTOR_RING_ALIGNMENT.max(align_of::<D>()))
            .map_err(|_| RingError::InvalidCapacity(capacity))?;

        // SAFETY: the layout has a non-zero size
        let memory = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(DmaError::OutOfMemory)?;
        let device_address = match mapper.map(memory, size, DmaDirection::Bidirectional) {
            Ok(addr) => addr,
            Err(e) => {
                unsafe { dealloc(memory.as_ptr(), layout) };
                return Err(e.into());
            }
        };
        if device_address.value() as usize % DESCRIPTOR_RING_ALIGNMENT != 0 {
            error!("DescriptorRing::new(): ring mapped at misaligned {:?}", device_address);
            mapper.unmap(device_address, size, DmaDirection::Bidirectional);
            unsafe { dealloc(memory.as_ptr(), layout) };
            return Err(RingError::Dma(DmaError::MappingFailed));
        }

        let ring = DescriptorRing {
            descriptors: memory.cast(),
            capacity,
            layout,
            device_address,
            mapper,
        };
        ring.reset();
        Ok(ring)
    }

    /// The number of descriptors in this ring.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// The device address of the first descriptor, to be programmed into the NIC.
    pub fn device_address(&self) -> DeviceAddress {
        self.device_address
    }

    /// Reduces a free-running cursor to a slot index.
    pub fn index(&self, cursor: usize) -> usize {
        cursor & (self.capacity - 1)
    }

    pub fn descriptors(&self) -> &[D] {
        // SAFETY: the memory holds `capacity` zero-initialized descriptors and lives as long as `self`
        unsafe { core::slice::from_raw_parts(self.descriptors.as_ptr(), self.capacity) }
    }

    pub fn descriptor(&self, slot: usize) -> &D {
        &self.descriptors()[self.index(slot)]
    }

    /// Returns `true` if `slot` is the last one before the device wraps around.
    pub fn is_last(&self, slot: usize) -> bool {
        self.index(slot) == self.capacity - 1
    }

    /// Clears every descriptor, then places the wrap marker on the last one.
    /// Afterwards every slot is host-owned.
    pub fn reset(&self) {
        for desc in self.descriptors() {
            desc.clear();
        }
        self.descriptors()[self.capacity - 1].set_ring_end();
    }

    /// Commits a buffer address (and the second control word) into `slot`.
    pub fn set_buffer(&self, slot: usize, address: DeviceAddress, opts2: u32) {
        self.descriptor(slot).set_buffer(address, opts2);
    }

    /// Hands `slot` to the device, with the given length and extra control bits.
    /// The wrap marker is applied if `slot` is the last one.
    ///
    /// The buffer must already have been committed with [`set_buffer`](Self::set_buffer).
    pub fn mark_device_owned(&self, slot: usize, length: u32, control: u32) {
        self.descriptor(slot).mark_device_owned(length, control, self.is_last(slot));
    }

    /// Hands `slot` back to the device with the buffer it already holds,
    /// e.g., after an erroneous or copied-out receive.
    pub fn rearm(&self, slot: usize, length: u32) {
        self.mark_device_owned(slot, length, 0);
    }

    /// Returns `true` while the device owns `slot`.
    pub fn is_device_owned(&self, slot: usize) -> bool {
        self.descriptor(slot).is_device_owned()
    }

    /// Takes `slot` back from the device's view for good: 
    /// it is poisoned so the device can't act on a buffer that is about to be freed.
    pub fn mark_host_owned(&self, slot: usize) {
        self.descriptor(slot).poison();
    }

    /// Returns the raw `(opts1, opts2, address)` words of every descriptor.
    pub fn snapshot(&self) -> Vec<(u32, u32, u64)> {
        self.descriptors().iter().map(|d| (d.opts1(), d.opts2(), d.address())).collect()
    }
}

impl<D: Descriptor> Drop for DescriptorRing<D> {
    fn drop(&mut self) {
        self.mapper.unmap(self.device_address, self.layout.size(), DmaDirection::Bidirectional);
        // SAFETY: allocated in `new()` with this same layout
        unsafe { dealloc(self.descriptors.as_ptr() as *mut u8, self.layout) };
    }
}

impl<D: Descriptor + fmt::Debug> fmt::Debug for DescriptorRing<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("DescriptorRing")
            .field("capacity", &self.capacity)
            .field("device_address", &self.device_address)
            .finish()
    }
}
