use alloc::vec::Vec;
use nic_descriptors::{DescriptorRing, RingError, RxDesc};
use nic_buffers::{ChecksumVerdict, DmaBuffer, ReceivedFrame, RxBufferPool, ETH_FCS_LEN};


/// Failures of receive queue setup.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum RxError {
    /// Not every receive slot could be given a buffer.
    #[display(fmt = "not enough receive buffers to fill the ring")]
    ResourceExhausted,
}

/// How received frames are filtered and handed up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RxOptions {
    /// Frames shorter than this are copied into a fresh buffer, and the ring buffer is reused in place.
    /// Zero disables copying.
    pub copybreak: usize,
    /// Deliver frames that the device flagged as erroneous, instead of dropping them.
    pub rx_all: bool,
    /// Leave the frame check sequence at the end of delivered frames.
    pub keep_fcs: bool,
    /// The device validates transport checksums.
    pub hw_checksum: bool,
}

impl Default for RxOptions {
    fn default() -> Self {
        RxOptions {
            copybreak: 0,
            rx_all: false,
            keep_fcs: false,
            hw_checksum: true,
        }
    }
}

/// Receive counters kept by an [`RxQueue`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RxStats {
    pub packets: u64,
    pub bytes: u64,
    pub errors: u64,
    pub dropped: u64,
    pub crc_errors: u64,
    pub length_errors: u64,
    pub multicast: u64,
    /// Times the ring was found without a single armed buffer.
    pub exhausted: u64,
}

/// The cursors and raw descriptor words of a receive queue.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RxSnapshot {
    pub consumed: usize,
    pub refilled: usize,
    pub descriptors: Vec<(u32, u32, u64)>,
}

/// A receive queue: a receive descriptor ring plus the buffers armed into it.
pub struct RxQueue {
    ring: DescriptorRing<RxDesc>,
    /// The buffer lent to the device in each slot, if any
    buffers: Vec<Option<DmaBuffer>>,
    pool: RxBufferPool,
    /// Next slot to examine
    consumed: usize,
    /// Next slot to give a fresh buffer
    refilled: usize,
    options: RxOptions,
    stats: RxStats,
}

impl RxQueue {
    /// Creates a receive queue whose slots are not yet armed; see [`RxQueue::init`].
    ///
    /// # Arguments
    /// * `capacity`: the number of receive descriptors, a power of two.
    /// * `pool`: the source of receive buffers, which also supplies the DMA mapper for the ring.
    /// * `options`: filtering and delivery options.
    pub fn new(capacity: usize, pool: RxBufferPool, options: RxOptions) -> Result<RxQueue, RingError> {
        let ring = DescriptorRing::new(capacity, pool.mapper().clone())?;
        let mut buffers = Vec::with_capacity(capacity);
        buffers.resize_with(capacity, || None);
        Ok(RxQueue {
            ring,
            buffers,
            pool,
            consumed: 0,
            refilled: 0,
            options,
            stats: RxStats::default(),
        })
    }

    pub fn ring(&self) -> &DescriptorRing<RxDesc> {
        &self.ring
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    pub fn buffer_size(&self) -> usize {
        self.pool.buffer_size()
    }

    /// Returns the `(consumed, refilled)` cursors.
    pub fn cursors(&self) -> (usize, usize) {
        (self.consumed, self.refilled)
    }

    /// The number of slots armed for the device, from the cursors' point of view.
    pub fn armed(&self) -> usize {
        self.capacity().wrapping_add(self.refilled).wrapping_sub(self.consumed)
    }

    /// Returns `true` if every consumed slot has been refilled.
    pub fn is_balanced(&self) -> bool {
        self.refilled == self.consumed
    }

    pub fn options(&self) -> RxOptions {
        self.options
    }

    pub fn set_options(&mut self, options: RxOptions) {
        self.options = options;
    }

    pub fn stats(&self) -> RxStats {
        self.stats
    }

    /// Resets the ring and arms every slot.
    ///
    /// If not every slot can be armed, all buffers are released again.
    pub fn init(&mut self) -> Result<(), RxError> {
        self.clear();
        self.ring.reset();
        self.consumed = 0;
        self.refilled = 0;
        let capacity = self.capacity();
        if self.fill(0, capacity) != capacity {
            self.clear();
            return Err(RxError::ResourceExhausted);
        }
        Ok(())
    }

    /// Arms every slot from cursor `start` up to `end` (exclusive) that has no buffer.
    /// Slots that already hold a buffer count as filled.
    /// Stops at the first buffer that can't be obtained, poisoning that slot.
    ///
    /// Returns the number of slots from `start` that are now filled.
    pub fn fill(&mut self, start: usize, end: usize) -> usize {
        let mut cursor = start;
        while cursor != end {
            let index = self.ring.index(cursor);
            if self.buffers[index].is_none() {
                match self.pool.allocate_and_map() {
                    Ok(buffer) => self.arm(cursor, buffer),
                    Err(e) => {
                        debug!("RxQueue::fill(): no buffer for slot {}: {}", index, e);
                        self.ring.mark_host_owned(cursor);
                        break;
                    }
                }
            }
            cursor = cursor.wrapping_add(1);
        }
        cursor.wrapping_sub(start)
    }

    fn arm(&mut self, slot: usize, buffer: DmaBuffer) {
        self.ring.set_buffer(slot, buffer.device_address(), 0);
        self.ring.mark_device_owned(slot, self.pool.buffer_size() as u32, 0);
        let index = self.ring.index(slot);
        self.buffers[index] = Some(buffer);
    }

    /// Hands a slot back to the device with the buffer it already holds.
    fn rearm(&mut self, slot: usize) {
        self.ring.rearm(slot, self.pool.buffer_size() as u32);
    }

    /// Processes up to `budget` completed slots in order, stopping at the first slot the device still owns,
    /// then refills what was consumed.
    ///
    /// Each good frame is passed to `deliver` exactly once. 
    /// Returns the number of slots processed, including erroneous ones.
    pub fn poll(&mut self, budget: usize, deliver: &mut dyn FnMut(ReceivedFrame)) -> usize {
        let quota = self.armed().min(budget);
        let mut work = 0;
        while work < quota {
            let slot = self.consumed;
            if self.ring.is_device_owned(slot) {
                break;
            }
            self.receive_slot(slot, deliver);
            self.consumed = self.consumed.wrapping_add(1);
            work += 1;
        }

        let refilled = self.fill(self.refilled, self.consumed);
        if refilled == 0 && work > 0 {
            warn!("RxQueue::poll(): no Rx buffer allocated");
        }
        self.refilled = self.refilled.wrapping_add(refilled);

        // The device stops at the first host-owned slot, so this only happens 
        // after every slot was consumed and none could be refilled.
        if self.refilled.wrapping_add(self.capacity()) == self.consumed {
            self.stats.exhausted += 1;
            warn!("RxQueue::poll(): Rx buffers exhausted");
        }
        work
    }

    fn receive_slot(&mut self, slot: usize, deliver: &mut dyn FnMut(ReceivedFrame)) {
        let status = self.ring.descriptor(slot).status();
        if status.has_error() {
            trace!("RxQueue::poll(): Rx error (status = {:?})", status);
            self.stats.errors += 1;
            if status.is_length_error() {
                self.stats.length_errors += 1;
            }
            if status.is_crc_error() {
                self.stats.crc_errors += 1;
            }
            if !self.options.rx_all {
                self.rearm(slot);
                return;
            }
        }

        let length = if self.options.keep_fcs {
            status.frame_length()
        } else {
            status.frame_length().saturating_sub(ETH_FCS_LEN)
        };
        // Frames spanning several descriptors are not reassembled.
        if !status.is_whole_frame() || length > self.pool.buffer_size() {
            debug!("RxQueue::poll(): dropping fragmented or oversized frame (status = {:?})", status);
            self.stats.dropped += 1;
            self.stats.length_errors += 1;
            self.rearm(slot);
            return;
        }

        let index = self.ring.index(slot);
        let data = match self.take_frame(index, length) {
            Some(data) => data,
            None => {
                error!("RxQueue::poll(): slot {} completed without a buffer", index);
                self.stats.dropped += 1;
                return;
            }
        };
        if self.buffers[index].is_some() {
            self.rearm(slot);
        } else {
            self.ring.mark_host_owned(slot);
        }

        let checksum = if self.options.hw_checksum && status.checksum_verified() {
            ChecksumVerdict::Unnecessary
        } else {
            ChecksumVerdict::None
        };
        let frame = ReceivedFrame { data, checksum, vlan_tag: status.vlan_tag() };
        if frame.is_multicast() {
            self.stats.multicast += 1;
        }
        self.stats.bytes += length as u64;
        self.stats.packets += 1;
        deliver(frame);
    }

    /// Obtains the received bytes of slot `index`, either as a copy (leaving the buffer in the slot)
    /// or by detaching the buffer from the slot.
    fn take_frame(&mut self, index: usize, length: usize) -> Option<nic_buffers::HostBuffer> {
        let buffer = self.buffers[index].as_ref()?;
        if length < self.options.copybreak {
            if let Ok(copy) = self.pool.copy_break(buffer, length) {
                return Some(copy);
            }
        }
        let buffer = self.buffers[index].take()?;
        buffer.sync_for_cpu(length);
        let mut data = buffer.unmap();
        if data.set_len(length).is_err() {
            return None;
        }
        Some(data)
    }

    /// Releases every buffer in the ring and poisons its slot. The device must not be running.
    pub fn clear(&mut self) {
        for index in 0..self.buffers.len() {
            if let Some(buffer) = self.buffers[index].take() {
                self.ring.mark_host_owned(index);
                self.pool.release(buffer);
            }
        }
    }

    pub fn snapshot(&self) -> RxSnapshot {
        RxSnapshot {
            consumed: self.consumed,
            refilled: self.refilled,
            descriptors: self.ring.snapshot(),
        }
    }
}
