//! The transmit and receive queues of a NIC, each built on one descriptor ring.
//!
//! A queue pairs a [`DescriptorRing`](nic_descriptors::DescriptorRing) with a host-side slot table 
//! holding the buffers that are lent to the device, plus two free-running cursors:
//! * [`TxQueue`]: `produced` (next slot to fill) and `dirty` (oldest slot not yet reclaimed).
//!   At most `capacity - 1` slots are ever in flight.
//! * [`RxQueue`]: `consumed` (next slot to examine) and `refilled` (next slot to give a fresh buffer).
//!   All `capacity` slots may be armed at once, since the device stops at the first host-owned slot.
//!
//! Queues have no locking of their own; the driver serializes all access to them.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate derive_more;
extern crate zerocopy;
extern crate nic_platform;
extern crate nic_descriptors;
extern crate nic_buffers;
extern crate network_interface_card;


mod checksum;
mod rx;
mod tx;

pub use rx::*;
pub use tx::*;
