//! The narrow set of platform services that a NIC driver consumes but does not implement.
//!
//! A driver never touches physical memory, the PCI bus, or the interrupt controller directly.
//! Instead it is handed a [`NicPlatform`] at attach time, which bundles:
//! * [`RegisterIo`]: reads and writes of the device's register window,
//! * [`DmaMapper`]: mapping host memory so the device can access it, yielding [`DeviceAddress`]es,
//! * [`PciConfigSpace`]: access to the device's PCI configuration header,
//! * [`IrqLine`]: requesting and freeing the device's interrupt line,
//! * [`WorkScheduler`]: running deferred work (timers, reset tasks, poll tasks) outside interrupt context,
//! * [`MonotonicClock`]: a monotonic time source and bounded busy-waiting.
//!
//! With the `sim` feature enabled, the [`sim`] module provides host-memory implementations
//! of the DMA, work and clock services so that drivers can be exercised against simulated hardware.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate derive_more;
extern crate spin;
extern crate volatile;


mod mmio;
pub mod pci;
#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use mmio::MmioRegion;

use alloc::boxed::Box;
use alloc::sync::Arc;
use core::fmt;
use core::ptr::NonNull;


/// An address in the device's view of memory (a bus or IOVA address).
///
/// This is deliberately distinct from a host pointer: it can't be dereferenced,
/// and it is only meaningful while the mapping that produced it is live.
/// Only [`DmaMapper`] implementations should create one.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct DeviceAddress(u64);

impl DeviceAddress {
    /// Wraps a raw bus address.
    ///
    /// # Safety
    /// The address must describe a live DMA mapping created by the caller,
    /// i.e., this is only for use by [`DmaMapper`] implementations.
    pub const unsafe fn new(value: u64) -> DeviceAddress {
        DeviceAddress(value)
    }

    /// Returns the raw value, e.g., for programming it into a descriptor or register.
    pub const fn value(&self) -> u64 {
        self.0
    }

    /// Returns the lower 32 bits of this address.
    pub const fn low_u32(&self) -> u32 {
        self.0 as u32
    }

    /// Returns the upper 32 bits of this address.
    pub const fn high_u32(&self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// Returns the address `bytes` further into the same mapping.
    pub const fn offset(&self, bytes: usize) -> DeviceAddress {
        DeviceAddress(self.0 + bytes as u64)
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DeviceAddress({:#X})", self.0)
    }
}

/// The direction of data flow for a DMA mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmaDirection {
    /// The device reads from host memory (transmit buffers).
    ToDevice,
    /// The device writes into host memory (receive buffers).
    FromDevice,
    /// Both directions (descriptor rings).
    Bidirectional,
}

/// Failures of DMA buffer allocation or mapping.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum DmaError {
    /// Host memory for the buffer could not be allocated.
    #[display(fmt = "out of memory for DMA buffer")]
    OutOfMemory,
    /// The platform could not create a device mapping for the buffer.
    #[display(fmt = "DMA mapping failed")]
    MappingFailed,
}

/// Mapping host memory into the device's address space.
pub trait DmaMapper: Send + Sync {
    /// Maps `len` bytes of host memory starting at `host` for device access.
    ///
    /// The memory must stay allocated, and must not be moved, until it is passed to [`DmaMapper::unmap`].
    fn map(&self, host: NonNull<u8>, len: usize, direction: DmaDirection) -> Result<DeviceAddress, DmaError>;

    /// Releases a mapping previously returned by [`DmaMapper::map`] with the same `len` and `direction`.
    fn unmap(&self, address: DeviceAddress, len: usize, direction: DmaDirection);

    /// Makes device writes to the given mapped range visible to the CPU.
    fn sync_for_cpu(&self, _address: DeviceAddress, _len: usize, _direction: DmaDirection) { }

    /// Makes CPU writes to the given mapped range visible to the device,
    /// and returns ownership of the range to the device.
    fn sync_for_device(&self, _address: DeviceAddress, _len: usize, _direction: DmaDirection) { }
}

/// Access to a device's register window, by byte offset.
///
/// Implementations must perform each access exactly once and in program order (volatile semantics).
pub trait RegisterIo: Send + Sync {
    fn read8(&self, offset: usize) -> u8;
    fn read16(&self, offset: usize) -> u16;
    fn read32(&self, offset: usize) -> u32;
    fn write8(&self, offset: usize, value: u8);
    fn write16(&self, offset: usize, value: u16);
    fn write32(&self, offset: usize, value: u32);
}

/// Access to a PCI device's configuration header, by byte offset.
pub trait PciConfigSpace: Send + Sync {
    fn read8(&self, offset: u8) -> u8;
    fn read16(&self, offset: u8) -> u16;
    fn write8(&self, offset: u8, value: u8);
    fn write16(&self, offset: u8, value: u16);
}

/// An interrupt handler callback. 
/// It returns `true` if the interrupt was raised by this handler's device.
pub type InterruptHandler = Arc<dyn Fn() -> bool + Send + Sync>;

/// A device's (possibly shared) interrupt line.
pub trait IrqLine: Send + Sync {
    /// Registers `handler` to be invoked, in interrupt context, whenever the line fires.
    fn request(&self, handler: InterruptHandler) -> Result<(), &'static str>;

    /// Unregisters the handler. 
    /// Once this returns, the handler is not running and will not be invoked again.
    fn free(&self);

    /// Acknowledges the interrupt at the interrupt controller.
    fn end_of_interrupt(&self) { }
}

/// A unit of deferred work.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// Runs work outside of interrupt context, after an optional delay.
pub trait WorkScheduler: Send + Sync {
    /// Runs `work` once, no sooner than `delay_ms` milliseconds from now.
    fn schedule(&self, delay_ms: u64, work: Work);
}

/// A monotonic time source.
pub trait MonotonicClock: Send + Sync {
    /// Milliseconds elapsed since an arbitrary fixed point.
    fn now_ms(&self) -> u64;

    /// Busy-waits for at least `micros` microseconds.
    fn delay_us(&self, micros: u64);
}

/// All platform services consumed by one NIC instance.
#[derive(Clone)]
pub struct NicPlatform {
    pub registers: Arc<dyn RegisterIo>,
    pub dma: Arc<dyn DmaMapper>,
    pub pci: Arc<dyn PciConfigSpace>,
    pub irq: Arc<dyn IrqLine>,
    pub work: Arc<dyn WorkScheduler>,
    pub clock: Arc<dyn MonotonicClock>,
}
