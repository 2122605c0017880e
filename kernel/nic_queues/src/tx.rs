use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{fence, Ordering};
use nic_platform::{DmaDirection, DmaMapper};
use nic_descriptors::{
    DescriptorRing, RingError, TxDesc, FIRST_FRAG, LAST_FRAG,
    tx_large_send_opts1, tx_vlan_opts2,
};
use nic_buffers::{ChecksumRequest, DmaBuffer, HostBuffer, TransmitFrame, ETH_ZLEN};
use network_interface_card::{SubmitError, TransmitError};
use crate::checksum;


/// Transmit counters kept by a [`TxQueue`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TxStats {
    pub packets: u64,
    pub bytes: u64,
    pub dropped: u64,
}

/// The host-side bookkeeping of one transmit slot.
#[derive(Default)]
struct TxSlot {
    buffer: Option<DmaBuffer>,
    /// Set on the final slot of a frame only
    frame_id: Option<u64>,
}

/// The outcome of a successful [`TxQueue::submit`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Submitted {
    /// Descriptors consumed by the frame.
    pub slots: usize,
    /// This submission stopped the queue.
    pub stopped: bool,
}

/// The outcome of a [`TxQueue::reclaim`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Reclaimed {
    pub slots: usize,
    pub frames: usize,
    /// This reclaim woke a stopped queue.
    pub woke: bool,
}

/// The cursors and raw descriptor words of a transmit queue, for comparison in tests and diagnostics.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxSnapshot {
    pub produced: usize,
    pub dirty: usize,
    pub descriptors: Vec<(u32, u32, u64)>,
}

/// A transmit queue: a transmit descriptor ring plus the buffers lent to the device.
pub struct TxQueue {
    ring: DescriptorRing<TxDesc>,
    slots: Vec<TxSlot>,
    /// Next slot to fill
    produced: usize,
    /// Oldest slot not yet reclaimed
    dirty: usize,
    stopped: bool,
    /// The queue stops once no more than this many slots are free
    stop_threshold: usize,
    pad_short_frames: bool,
    mapper: Arc<dyn DmaMapper>,
    stats: TxStats,
}

impl TxQueue {
    /// Creates an empty transmit queue.
    ///
    /// # Arguments
    /// * `capacity`: the number of transmit descriptors, a power of two.
    /// * `stop_threshold`: the queue is stopped when a submission leaves this many free slots or fewer,
    ///    and woken when more are free again. Usually the largest number of slots a frame can need.
    ///    Clamped to `capacity - 2`, since no more than `capacity - 1` slots are ever free.
    /// * `pad_short_frames`: zero-pad single-buffer frames shorter than the Ethernet minimum.
    /// * `mapper`: the DMA mapper for the ring and the frame buffers.
    pub fn new(
        capacity: usize,
        stop_threshold: usize,
        pad_short_frames: bool,
        mapper: Arc<dyn DmaMapper>,
    ) -> Result<TxQueue, RingError> {
        let ring = DescriptorRing::new(capacity, mapper.clone())?;
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, TxSlot::default);
        Ok(TxQueue {
            ring,
            slots,
            produced: 0,
            dirty: 0,
            stopped: false,
            stop_threshold: stop_threshold.min(capacity - 2),
            pad_short_frames,
            mapper,
            stats: TxStats::default(),
        })
    }

    pub fn ring(&self) -> &DescriptorRing<TxDesc> {
        &self.ring
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Returns the `(produced, dirty)` cursors.
    pub fn cursors(&self) -> (usize, usize) {
        (self.produced, self.dirty)
    }

    /// The number of slots holding frames not yet reclaimed.
    pub fn in_flight(&self) -> usize {
        self.produced.wrapping_sub(self.dirty)
    }

    /// The number of slots a new frame may use. One slot always stays empty.
    pub fn free_slots(&self) -> usize {
        self.capacity() - 1 - self.in_flight()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Stops the queue regardless of free space, e.g., while the link is down.
    pub fn stop(&mut self) {
        self.stopped = true;
    }

    /// Wakes the queue if it is stopped and has room for a maximally-fragmented frame.
    /// Returns `true` if the queue is running afterwards.
    pub fn wake(&mut self) -> bool {
        if self.free_slots() > self.stop_threshold {
            self.stopped = false;
        }
        !self.stopped
    }

    pub fn stats(&self) -> TxStats {
        self.stats
    }

    /// Queues a frame for transmission. The caller must then ring the device's transmit doorbell.
    ///
    /// Either every piece of the frame is handed to the device, or nothing is: 
    /// on failure the cursors and descriptors are untouched and the frame is handed back.
    /// A DMA mapping failure also counts the frame as dropped.
    pub fn submit(&mut self, mut frame: TransmitFrame) -> Result<Submitted, SubmitError> {
        let required = frame.slots_required();
        if required > self.free_slots() {
            return Err(SubmitError::new(TransmitError::ResourceExhausted, frame));
        }
        if (0..required).any(|i| self.ring.is_device_owned(self.produced + i)) {
            error!("TxQueue::submit(): slot {} still owned by the device, with produced {} dirty {}", 
                self.ring.index(self.produced), self.produced, self.dirty);
            return Err(SubmitError::new(TransmitError::Busy, frame));
        }

        let control = self.offload_control(&mut frame);
        let opts2 = frame.vlan_tag.map_or(0, tx_vlan_opts2);

        let TransmitFrame { id, head, fragments, checksum, vlan_tag, mss } = frame;
        let mapped = match map_pieces(head, fragments, &self.mapper) {
            Ok(mapped) => mapped,
            Err((head, fragments)) => {
                self.stats.dropped += 1;
                warn!("TxQueue::submit(): failed to map frame {} for DMA, dropping it", id);
                let frame = TransmitFrame { id, head, fragments, checksum, vlan_tag, mss };
                return Err(SubmitError::new(TransmitError::DmaMappingFailed, frame));
            }
        };

        // Fragments first, the head last: the device can't start on a frame whose first descriptor it doesn't own.
        let head_slot = self.produced;
        let pieces = mapped.len();
        let mut mapped = mapped.into_iter();
        let head = mapped.next();
        for (i, buffer) in mapped.enumerate() {
            let slot = head_slot + 1 + i;
            let last = if i + 2 == pieces { LAST_FRAG } else { 0 };
            self.lend(slot, buffer, opts2, control | last);
        }
        if let Some(buffer) = head {
            let flags = if pieces == 1 { FIRST_FRAG | LAST_FRAG } else { FIRST_FRAG };
            self.lend(head_slot, buffer, opts2, control | flags);
        }
        let last_slot = self.ring.index(head_slot + pieces - 1);
        self.slots[last_slot].frame_id = Some(id);
        self.produced = self.produced.wrapping_add(pieces);

        let mut stopped = false;
        if self.free_slots() <= self.stop_threshold {
            self.stopped = true;
            fence(Ordering::SeqCst);
            stopped = !self.wake();
        }
        Ok(Submitted { slots: pieces, stopped })
    }

    /// Works out the offload bits of `opts1`, 
    /// padding or checksumming the frame in software where the device won't.
    fn offload_control(&self, frame: &mut TransmitFrame) -> u32 {
        if let Some(mss) = frame.mss {
            return tx_large_send_opts1(mss);
        }
        if self.pad_short_frames && frame.fragments.is_empty() && frame.head.len() < ETH_ZLEN {
            frame.head.resize(ETH_ZLEN, 0);
        }
        match frame.checksum {
            ChecksumRequest::None => 0,
            ChecksumRequest::Partial { start, offset } => {
                if let Some(flags) = checksum::offload_flags(&frame.head) {
                    flags
                } else {
                    if !checksum::checksum_in_software(&mut frame.head, &frame.fragments, start, offset) {
                        warn!("TxQueue::submit(): checksum field {}+{} outside of frame {} head", start, offset, frame.id);
                    }
                    0
                }
            }
        }
    }

    fn lend(&mut self, slot: usize, buffer: DmaBuffer, opts2: u32, control: u32) {
        self.ring.set_buffer(slot, buffer.device_address(), opts2);
        self.ring.mark_device_owned(slot, buffer.len() as u32, control);
        let index = self.ring.index(slot);
        self.slots[index] = TxSlot { buffer: Some(buffer), frame_id: None };
    }

    /// Reclaims every slot the device has finished with, oldest first, 
    /// stopping at the first slot it still owns.
    /// 
    /// Each slot's buffer is released. The id of each completed frame is passed to `on_completed`,
    /// once, when its final slot is reclaimed.
    pub fn reclaim(&mut self, on_completed: &mut dyn FnMut(u64)) -> Reclaimed {
        let mut reclaimed = Reclaimed::default();
        while self.dirty != self.produced {
            let slot = self.dirty;
            if self.ring.is_device_owned(slot) {
                break;
            }
            let entry = core::mem::take(&mut self.slots[self.ring.index(slot)]);
            if let Some(buffer) = entry.buffer {
                self.stats.bytes += buffer.len() as u64;
                buffer.release();
            }
            if let Some(id) = entry.frame_id {
                self.stats.packets += 1;
                reclaimed.frames += 1;
                on_completed(id);
            }
            self.ring.mark_host_owned(slot);
            self.dirty = self.dirty.wrapping_add(1);
            reclaimed.slots += 1;
        }
        if self.stopped && reclaimed.slots > 0 {
            reclaimed.woke = self.wake();
        }
        reclaimed
    }

    /// Drops every frame still in the queue, releasing its buffers,
    /// and returns the queue to its initial state. The device must not be running.
    ///
    /// The id of each dropped frame is passed to `on_dropped` exactly once.
    pub fn clear(&mut self, on_dropped: &mut dyn FnMut(u64)) -> usize {
        let mut dropped = 0;
        while self.dirty != self.produced {
            let entry = core::mem::take(&mut self.slots[self.ring.index(self.dirty)]);
            if let Some(buffer) = entry.buffer {
                buffer.release();
            }
            if let Some(id) = entry.frame_id {
                self.stats.dropped += 1;
                dropped += 1;
                on_dropped(id);
            }
            self.dirty = self.dirty.wrapping_add(1);
        }
        self.ring.reset();
        self.produced = 0;
        self.dirty = 0;
        self.stopped = false;
        dropped
    }

    pub fn snapshot(&self) -> TxSnapshot {
        TxSnapshot {
            produced: self.produced,
            dirty: self.dirty,
            descriptors: self.ring.snapshot(),
        }
    }
}

impl Drop for TxQueue {
    fn drop(&mut self) {
        let in_flight = self.in_flight();
        if in_flight != 0 {
            warn!("TxQueue::drop(): {} slots still in flight", in_flight);
        }
    }
}

/// Maps the head and every fragment of a frame for the device, in that order.
/// If any piece fails to map, every piece mapped so far is unmapped 
/// and the frame's pieces are handed back unchanged.
fn map_pieces(
    head: Vec<u8>,
    fragments: Vec<Vec<u8>>,
    mapper: &Arc<dyn DmaMapper>,
) -> Result<Vec<DmaBuffer>, (Vec<u8>, Vec<Vec<u8>>)> {
    let mut mapped: Vec<DmaBuffer> = Vec::with_capacity(1 + fragments.len());
    let mut pieces = core::iter::once(head).chain(fragments);
    while let Some(piece) = pieces.next() {
        match DmaBuffer::map(HostBuffer::from_vec(piece), DmaDirection::ToDevice, mapper) {
            Ok(buffer) => mapped.push(buffer),
            Err((_e, failed)) => {
                let mut all: Vec<Vec<u8>> = mapped.into_iter().map(|b| b.unmap().into_vec()).collect();
                all.push(failed.into_vec());
                all.extend(pieces);
                let head = all.remove(0);
                return Err((head, all));
            }
        }
    }
    Ok(mapped)
}
