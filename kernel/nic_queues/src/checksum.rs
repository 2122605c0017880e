//! Deciding how the transport checksum of an outgoing frame gets computed.

use alloc::vec::Vec;
use zerocopy::{FromBytes, FromZeroes};
use nic_descriptors::{TX_IPCS, TX_TCPCS, TX_UDPCS};

const ETHERTYPE_IPV4: u16 = 0x0800;
const IPPROTO_TCP:    u8  = 6;
const IPPROTO_UDP:    u8  = 17;

#[allow(dead_code)]
#[derive(FromZeroes, FromBytes)]
#[repr(C)]
struct EthernetHeader {
    destination: [u8; 6],
    source: [u8; 6],
    ether_type: [u8; 2],
}

#[allow(dead_code)]
#[derive(FromZeroes, FromBytes)]
#[repr(C)]
struct Ipv4Header {
    version_ihl: u8,
    tos: u8,
    total_length: [u8; 2],
    identification: [u8; 2],
    fragment: [u8; 2],
    ttl: u8,
    protocol: u8,
    checksum: [u8; 2],
    source: [u8; 4],
    destination: [u8; 4],
}

/// Returns the descriptor bits that make the device checksum this frame,
/// or `None` if the frame is not TCP or UDP over IPv4 and must be checksummed in software.
pub(crate) fn offload_flags(frame: &[u8]) -> Option<u32> {
    let eth = EthernetHeader::read_from_prefix(frame)?;
    if u16::from_be_bytes(eth.ether_type) != ETHERTYPE_IPV4 {
        return None;
    }
    let ip = Ipv4Header::read_from_prefix(frame.get(core::mem::size_of::<EthernetHeader>()..)?)?;
    if ip.version_ihl >> 4 != 4 {
        return None;
    }
    match ip.protocol {
        IPPROTO_TCP => Some(TX_IPCS | TX_TCPCS),
        IPPROTO_UDP => Some(TX_IPCS | TX_UDPCS),
        _ => None,
    }
}

/// Computes the ones-complement checksum of everything from `start` to the end of the frame
/// and stores it at `start + offset` in the head.
/// The checksum field is summed as it is, so it may hold a pseudo-header seed.
///
/// Returns `false` if the checksum field does not lie within the head.
pub(crate) fn checksum_in_software(head: &mut [u8], fragments: &[Vec<u8>], start: usize, offset: usize) -> bool {
    let field = match start.checked_add(offset) {
        Some(f) if f.checked_add(2).map_or(false, |end| end <= head.len()) => f,
        _ => return false,
    };
    let pieces = core::iter::once(&head[start..]).chain(fragments.iter().map(|f| f.as_slice()));
    let checksum = !ones_complement_sum(pieces);
    head[field .. field + 2].copy_from_slice(&checksum.to_be_bytes());
    true
}

/// The folded 16-bit ones-complement sum of the concatenation of `pieces`.
pub(crate) fn ones_complement_sum<'a>(pieces: impl Iterator<Item = &'a [u8]>) -> u16 {
    let mut sum: u64 = 0;
    let mut index = 0usize;
    for piece in pieces {
        for &byte in piece {
            sum += if index % 2 == 0 { (byte as u64) << 8 } else { byte as u64 };
            index += 1;
        }
    }
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}
