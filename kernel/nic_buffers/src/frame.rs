//! The frames exchanged between a NIC driver and the network stack.

use alloc::vec::Vec;
use crate::HostBuffer;

/// What the stack asks of the NIC regarding the transport checksum of an outgoing frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ChecksumRequest {
    /// The frame is complete as it is.
    #[default]
    None,
    /// The checksum must be computed over the bytes from `start` to the end of the frame,
    /// and stored at `start + offset`.
    Partial { start: usize, offset: usize },
}

/// A network (e.g., Ethernet) frame to be transmitted by the NIC.
///
/// The frame is made of a linear `head` followed by any number of `fragments`;
/// each piece occupies one transmit descriptor.
#[derive(Debug, Default)]
pub struct TransmitFrame {
    /// Chosen by the stack; reported back exactly once, on completion or drop.
    pub id: u64,
    pub head: Vec<u8>,
    pub fragments: Vec<Vec<u8>>,
    pub checksum: ChecksumRequest,
    /// VLAN tag for the NIC to insert.
    pub vlan_tag: Option<u16>,
    /// Segment size for TCP segmentation offload.
    pub mss: Option<u16>,
}

impl TransmitFrame {
    /// Creates a single-buffer frame with no offloads.
    pub fn new(id: u64, data: Vec<u8>) -> TransmitFrame {
        TransmitFrame { id, head: data, ..Default::default() }
    }

    /// Creates a frame from a head and its fragments, with no offloads.
    pub fn with_fragments(id: u64, head: Vec<u8>, fragments: Vec<Vec<u8>>) -> TransmitFrame {
        TransmitFrame { id, head, fragments, ..Default::default() }
    }

    /// The number of descriptors needed to transmit this frame.
    pub fn slots_required(&self) -> usize {
        1 + self.fragments.len()
    }

    /// The total frame length in bytes.
    pub fn len(&self) -> usize {
        self.head.len() + self.fragments.iter().map(|f| f.len()).sum::<usize>()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether the NIC validated the transport checksum of a received frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChecksumVerdict {
    /// The NIC verified the checksum; the stack need not.
    Unnecessary,
    /// The stack must verify the checksum itself.
    None,
}

/// A network (e.g., Ethernet) frame that has been received by the NIC.
#[derive(Debug)]
pub struct ReceivedFrame {
    /// The frame contents, trimmed to the frame length.
    pub data: HostBuffer,
    pub checksum: ChecksumVerdict,
    /// The VLAN tag the NIC stripped from the frame.
    pub vlan_tag: Option<u16>,
}

impl ReceivedFrame {
    /// Returns `true` if the destination is a multicast (group) address other than broadcast.
    pub fn is_multicast(&self) -> bool {
        match self.data.get(..6) {
            Some(dest) => dest[0] & 0x01 != 0 && dest != [0xff; 6],
            None => false,
        }
    }
}
