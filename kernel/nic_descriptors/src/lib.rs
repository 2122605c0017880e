//! Descriptors shared between the CPU and the NIC's DMA engine.
//!
//! Transmit and receive descriptors have the same 16-byte shape:
//! a first control/status word (`opts1`), a second word (`opts2`, VLAN information),
//! and the 64-bit device address of the buffer.
//! Bit 31 of `opts1` is the ownership bit: while it is set, the device may read or write 
//! the descriptor and its buffer, and the CPU must not touch either.
//!
//! Every field is an atomic so that a descriptor can be observed concurrently by the device 
//! (or a simulation of it). The CPU side follows one discipline:
//! * to hand a slot to the device, write the address and `opts2` first, 
//!   then publish `opts1` (with the ownership bit) using a `Release` store;
//! * to take a slot back, load `opts1` with `Acquire` and only read the other fields
//!   once the ownership bit is seen clear.
//!
//! Upper layers go through [`DescriptorRing`] rather than manipulating these bits directly.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate derive_more;
extern crate bit_field;
extern crate nic_platform;


mod ring;

pub use ring::*;

use core::fmt;
use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use bit_field::BitField;
use nic_platform::DeviceAddress;


/// Descriptor is owned by the device
pub const DESC_OWN:                        u32 = 1 << 31;
/// Last descriptor of the ring; the device wraps to the ring base after it
pub const RING_END:                        u32 = 1 << 30;
/// First descriptor of a frame
pub const FIRST_FRAG:                      u32 = 1 << 29;
/// Last descriptor of a frame
pub const LAST_FRAG:                       u32 = 1 << 28;

/// Tx: TCP segmentation offload
pub const TX_LARGE_SEND:                   u32 = 1 << 27;
/// Tx: shift of the MSS field used with large send
pub const TX_MSS_SHIFT:                    u32 = 16;
/// Tx: largest MSS the MSS field can hold
pub const TX_MSS_MAX:                      u32 = 0x7ff;
/// Tx: calculate the IP header checksum
pub const TX_IPCS:                         u32 = 1 << 18;
/// Tx: calculate the UDP checksum
pub const TX_UDPCS:                        u32 = 1 << 17;
/// Tx: calculate the TCP checksum
pub const TX_TCPCS:                        u32 = 1 << 16;
/// Tx (opts2): insert the VLAN tag held in the low 16 bits
pub const TX_VLAN_TAG:                     u32 = 1 << 17;
/// Tx: mask of the buffer length field
pub const TX_LENGTH_MASK:                  u32 = 0xffff;
/// Tx: value written into opts1 of a slot whose buffer has been released, easy to spot in dumps
pub const TX_POISON_OPTS1:                 u32 = 0x0badbeef;

/// Rx: receive watchdog timer expired (frame too long)
pub const RX_RWT:                          u32 = 1 << 22;
/// Rx: receive error summary
pub const RX_RES:                          u32 = 1 << 21;
/// Rx: runt frame
pub const RX_RUNT:                         u32 = 1 << 20;
/// Rx: CRC error
pub const RX_CRC:                          u32 = 1 << 19;
/// Rx: mask of the protocol id field
pub const RX_PROTO_MASK:                   u32 = 3 << 17;
/// Rx: protocol id, UDP
pub const RX_PROTO_UDP:                    u32 = 1 << 17;
/// Rx: protocol id, TCP
pub const RX_PROTO_TCP:                    u32 = 2 << 17;
/// Rx: IP checksum failed
pub const RX_IP_FAIL:                      u32 = 1 << 16;
/// Rx: UDP checksum failed
pub const RX_UDP_FAIL:                     u32 = 1 << 15;
/// Rx: TCP checksum failed
pub const RX_TCP_FAIL:                     u32 = 1 << 14;
/// Rx (opts2): a VLAN tag was stripped and is held in the low 16 bits
pub const RX_VLAN_TAG:                     u32 = 1 << 16;
/// Rx: bits that the device owns in a host-armed descriptor
pub const RX_RESERVED_MASK:                u32 = 0x3fff_c000;
/// Rx: mask of the buffer size (when armed) or frame length (when completed)
pub const RX_LENGTH_MASK:                  u32 = 0x3fff;
/// Rx: address written into a slot that must never be used by the device
pub const RX_POISON_ADDRESS:               u64 = 0x0badbadbadbadbad;


/// The operations that every descriptor type supports.
///
/// # Safety
/// The all-zero bit pattern must be a valid, host-owned descriptor,
/// since descriptor rings are allocated as zeroed memory.
pub unsafe trait Descriptor: Sync + Sized {
    /// Mask of the length field in `opts1`.
    const LENGTH_MASK: u32;

    /// Clears every field of the descriptor.
    fn clear(&self);

    /// Sets the wrap marker, leaving the other fields untouched.
    fn set_ring_end(&self);

    /// Commits the buffer address and second control word.
    /// Must be followed by [`Descriptor::mark_device_owned`] to hand the slot to the device.
    fn set_buffer(&self, address: DeviceAddress, opts2: u32);

    /// Publishes `opts1 = OWN | control | length` (plus the wrap marker if `ring_end`)
    /// with release ordering, so the device can't see the ownership bit 
    /// before the address and `opts2` written earlier.
    fn mark_device_owned(&self, length: u32, control: u32, ring_end: bool);

    /// Returns `true` if the device currently owns this descriptor.
    /// Uses acquire ordering, so that fields read afterwards are at least as new as the ownership bit.
    fn is_device_owned(&self) -> bool;

    /// Makes the descriptor unusable by the device after its buffer has been released.
    fn poison(&self);

    /// The raw first word, for diagnostics.
    fn opts1(&self) -> u32;
    /// The raw second word, for diagnostics.
    fn opts2(&self) -> u32;
    /// The raw buffer address, for diagnostics.
    fn address(&self) -> u64;
}


/// An RTL8169 transmit descriptor. 
/// There is one instance of this struct per transmit ring slot.
#[repr(C)]
pub struct TxDesc {
    /// Ownership, fragment and offload flags, and the buffer length
    opts1: AtomicU32,
    /// VLAN tag insertion
    opts2: AtomicU32,
    /// Device address of the buffer
    addr: AtomicU64,
}

const _: () = assert!(core::mem::size_of::<TxDesc>() == 16);

unsafe impl Descriptor for TxDesc {
    const LENGTH_MASK: u32 = TX_LENGTH_MASK;

    fn clear(&self) {
        self.opts1.store(0, Ordering::Relaxed);
        self.opts2.store(0, Ordering::Relaxed);
        self.addr.store(0, Ordering::Relaxed);
    }

    fn set_ring_end(&self) {
        self.opts1.fetch_or(RING_END, Ordering::Release);
    }

    fn set_buffer(&self, address: DeviceAddress, opts2: u32) {
        self.addr.store(address.value(), Ordering::Relaxed);
        self.opts2.store(opts2, Ordering::Relaxed);
    }

    fn mark_device_owned(&self, length: u32, control: u32, ring_end: bool) {
        let mut opts1 = DESC_OWN | (control & !Self::LENGTH_MASK) | (length & Self::LENGTH_MASK);
        if ring_end {
            opts1 |= RING_END;
        }
        self.opts1.store(opts1, Ordering::Release);
    }

    fn is_device_owned(&self) -> bool {
        self.opts1.load(Ordering::Acquire) & DESC_OWN == DESC_OWN
    }

    fn poison(&self) {
        self.opts1.store(TX_POISON_OPTS1, Ordering::Release);
        self.opts2.store(0, Ordering::Relaxed);
        self.addr.store(0, Ordering::Relaxed);
    }

    fn opts1(&self) -> u32 { self.opts1.load(Ordering::Acquire) }
    fn opts2(&self) -> u32 { self.opts2.load(Ordering::Relaxed) }
    fn address(&self) -> u64 { self.addr.load(Ordering::Relaxed) }
}

impl TxDesc {
    /// Performed by the device once it has fetched the buffer: 
    /// hands the descriptor back to the CPU, leaving the other bits as they were.
    pub fn complete_by_device(&self) {
        self.opts1.fetch_and(!DESC_OWN, Ordering::Release);
    }
}

impl fmt::Debug for TxDesc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{addr: {:#X}, opts1: {:#010X}, opts2: {:#010X}}}",
            self.address(), self.opts1(), self.opts2())
    }
}

/// Returns the `opts2` value that asks the device to insert VLAN tag `tag`.
pub fn tx_vlan_opts2(tag: u16) -> u32 {
    TX_VLAN_TAG | tag.swap_bytes() as u32
}

/// Returns the `opts1` control bits for TCP segmentation with the given MSS, clamped to what the field holds.
pub fn tx_large_send_opts1(mss: u16) -> u32 {
    TX_LARGE_SEND | ((mss as u32).min(TX_MSS_MAX) << TX_MSS_SHIFT)
}



/// An RTL8169 receive descriptor. 
/// There is one instance of this struct per receive ring slot.
#[repr(C)]
pub struct RxDesc {
    /// Ownership and ring flags, plus the buffer size when armed;
    /// status flags and frame length when completed by the device
    opts1: AtomicU32,
    /// Stripped VLAN tag
    opts2: AtomicU32,
    /// Device address of the buffer
    addr: AtomicU64,
}

const _: () = assert!(core::mem::size_of::<RxDesc>() == 16);

unsafe impl Descriptor for RxDesc {
    const LENGTH_MASK: u32 = RX_LENGTH_MASK;

    fn clear(&self) {
        self.opts1.store(0, Ordering::Relaxed);
        self.opts2.store(0, Ordering::Relaxed);
        self.addr.store(0, Ordering::Relaxed);
    }

    fn set_ring_end(&self) {
        self.opts1.fetch_or(RING_END, Ordering::Release);
    }

    fn set_buffer(&self, address: DeviceAddress, opts2: u32) {
        self.addr.store(address.value(), Ordering::Relaxed);
        self.opts2.store(opts2, Ordering::Relaxed);
    }

    fn mark_device_owned(&self, length: u32, control: u32, ring_end: bool) {
        let mut opts1 = DESC_OWN | (control & !Self::LENGTH_MASK) | (length & Self::LENGTH_MASK);
        if ring_end {
            opts1 |= RING_END;
        }
        self.opts1.store(opts1, Ordering::Release);
    }

    fn is_device_owned(&self) -> bool {
        self.opts1.load(Ordering::Acquire) & DESC_OWN == DESC_OWN
    }

    fn poison(&self) {
        self.addr.store(RX_POISON_ADDRESS, Ordering::Relaxed);
        // keep the wrap marker, so that the ring stays well-formed
        self.opts1.fetch_and(!(DESC_OWN | RX_RESERVED_MASK), Ordering::Release);
    }

    fn opts1(&self) -> u32 { self.opts1.load(Ordering::Acquire) }
    fn opts2(&self) -> u32 { self.opts2.load(Ordering::Relaxed) }
    fn address(&self) -> u64 { self.addr.load(Ordering::Relaxed) }
}

impl RxDesc {
    /// Returns the status the device wrote into this descriptor.
    /// Only meaningful once [`Descriptor::is_device_owned`] has returned `false`.
    pub fn status(&self) -> RxStatus {
        RxStatus::new(self.opts1(), self.opts2())
    }

    /// Returns `true` if this descriptor carries the wrap marker.
    pub fn is_ring_end(&self) -> bool {
        self.opts1().get_bit(30)
    }

    /// Performed by the device after writing a frame into the buffer:
    /// stores the status words and hands the descriptor back to the CPU.
    /// The wrap marker is preserved, the ownership bit in `status` is ignored.
    pub fn fill_by_device(&self, status: u32, opts2: u32) {
        self.opts2.store(opts2, Ordering::Relaxed);
        let ring_end = self.opts1.load(Ordering::Relaxed) & RING_END;
        self.opts1.store((status & !(DESC_OWN | RING_END)) | ring_end, Ordering::Release);
    }
}

impl fmt::Debug for RxDesc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{addr: {:#X}, opts1: {:#010X}, opts2: {:#010X}}}",
            self.address(), self.opts1(), self.opts2())
    }
}


/// The protocol the device recognized in a received frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RxProtocol {
    Tcp,
    Udp,
    Other,
}

/// A snapshot of a completed receive descriptor's status words.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct RxStatus {
    opts1: u32,
    opts2: u32,
}

impl RxStatus {
    pub const fn new(opts1: u32, opts2: u32) -> RxStatus {
        RxStatus { opts1, opts2 }
    }

    /// The frame length in bytes, including the frame check sequence.
    pub fn frame_length(&self) -> usize {
        self.opts1.get_bits(0..14) as usize
    }

    /// The device flagged this frame as erroneous.
    pub fn has_error(&self) -> bool {
        self.opts1 & RX_RES != 0
    }

    /// The frame was too long or too short.
    pub fn is_length_error(&self) -> bool {
        self.opts1 & (RX_RWT | RX_RUNT) != 0
    }

    pub fn is_crc_error(&self) -> bool {
        self.opts1 & RX_CRC != 0
    }

    /// The frame fits in this one descriptor, i.e., it carries both the first and last fragment flags.
    pub fn is_whole_frame(&self) -> bool {
        self.opts1 & (FIRST_FRAG | LAST_FRAG) == FIRST_FRAG | LAST_FRAG
    }

    pub fn protocol(&self) -> RxProtocol {
        match self.opts1 & RX_PROTO_MASK {
            RX_PROTO_TCP => RxProtocol::Tcp,
            RX_PROTO_UDP => RxProtocol::Udp,
            _ => RxProtocol::Other,
        }
    }

    /// Returns `true` if the device verified both the IP and the TCP/UDP checksum.
    pub fn checksum_verified(&self) -> bool {
        match self.protocol() {
            RxProtocol::Tcp => self.opts1 & (RX_TCP_FAIL | RX_IP_FAIL) == 0,
            RxProtocol::Udp => self.opts1 & (RX_UDP_FAIL | RX_IP_FAIL) == 0,
            RxProtocol::Other => false,
        }
    }

    /// The VLAN tag the device stripped from the frame, if any.
    pub fn vlan_tag(&self) -> Option<u16> {
        if self.opts2 & RX_VLAN_TAG != 0 {
            Some((self.opts2.get_bits(0..16) as u16).swap_bytes())
        } else {
            None
        }
    }
}

impl fmt::Debug for RxStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "RxStatus {{ opts1: {:#010X}, opts2: {:#010X}, length: {} }}", self.opts1, self.opts2, self.frame_length())
    }
}
