//! The mutable state of one device, and the batch of upcalls and deferred work
//! that is collected while holding its lock and acted on after releasing it.

use alloc::vec::Vec;
use nic_buffers::ReceivedFrame;
use nic_queues::{RxQueue, TxQueue};
use network_interface_card::{DeviceHealth, LinkState, NetworkStack, NicStatistics};
use crate::hw::RxFilter;
use crate::link::LinkParams;
use crate::pci_shadow::{DriftFlags, PciConfigShadow};
use crate::recovery::{RecoveryState, Task};
use crate::regs::IntrStatus;


/// Everything about a device that changes after attach, guarded by the device lock.
pub(crate) struct DeviceState {
    /// Present from `open()` until `close()`.
    pub tx: Option<TxQueue>,
    pub rx: Option<RxQueue>,
    pub opened: bool,
    pub mtu: usize,
    pub rx_buf_size: usize,
    /// Shadow of the C+ command register
    pub cp_cmd: u16,
    /// The interrupt sources currently enabled
    pub intr_mask: IntrStatus,
    pub link_params: LinkParams,
    /// The gigabit advertisement last written to the PHY
    pub phy_1000_ctrl: u16,
    pub link: LinkState,
    pub carrier: bool,
    pub recovery: RecoveryState,
    /// Fields found changed by the last configuration-drift check
    pub drift: DriftFlags,
    pub pci_shadow: Option<PciConfigShadow>,
    pub reset_attempts: u32,
    pub filter: RxFilter,
    /// Bumped by `close()`, so that deferred work scheduled before it retires
    pub generation: u64,
    pub link_timer_armed: bool,
    pub reset_task_pending: bool,
    /// Counters of queues that have been torn down
    pub retired: NicStatistics,
    pub rx_missed: u64,
    pub rx_fifo_errors: u64,
    pub tx_errors: u64,
}

impl DeviceState {
    pub fn new(mtu: usize, link_params: LinkParams) -> DeviceState {
        DeviceState {
            tx: None,
            rx: None,
            opened: false,
            mtu,
            rx_buf_size: nic_buffers::rx_buffer_size(mtu),
            cp_cmd: 0,
            intr_mask: IntrStatus::empty(),
            link_params,
            phy_1000_ctrl: 0,
            link: LinkState::DOWN,
            carrier: false,
            recovery: RecoveryState::Running,
            drift: DriftFlags::empty(),
            pci_shadow: None,
            reset_attempts: 0,
            filter: RxFilter::default(),
            generation: 0,
            link_timer_armed: false,
            reset_task_pending: false,
            retired: NicStatistics::default(),
            rx_missed: 0,
            rx_fifo_errors: 0,
            tx_errors: 0,
        }
    }

    /// Moves to `next`, recording the transition for the stack if it is one.
    pub fn set_recovery(&mut self, next: RecoveryState, events: &mut Events) {
        if self.recovery != next {
            debug!("r8169::set_recovery(): {} -> {}", self.recovery, next);
            self.recovery = next;
            events.health.push(next.into());
        }
    }

    /// Records a new link state for the stack if it differs from the last one.
    pub fn set_link(&mut self, link: LinkState, events: &mut Events) {
        if self.link != link {
            self.link = link;
            events.link.push(link);
        }
    }

    /// Stops the transmit queue, e.g., while the link is down or the device is being rebuilt.
    pub fn stop_queue(&mut self, events: &mut Events) {
        if let Some(tx) = self.tx.as_mut() {
            if !tx.is_stopped() {
                tx.stop();
                events.queue = Some(true);
            }
        }
    }

    /// Wakes the transmit queue if it has room.
    pub fn wake_queue(&mut self, events: &mut Events) {
        if let Some(tx) = self.tx.as_mut() {
            if tx.is_stopped() && tx.wake() {
                events.queue = Some(false);
            }
        }
    }

    /// Reclaims completed transmit descriptors.
    pub fn tx_complete(&mut self, events: &mut Events) {
        if let Some(tx) = self.tx.as_mut() {
            let completed = &mut events.completed;
            let reclaimed = tx.reclaim(&mut |id| completed.push(id));
            if reclaimed.woke {
                events.queue = Some(false);
            }
        }
    }

    /// Receives up to `budget` frames. Returns the number of descriptors processed.
    pub fn rx_complete(&mut self, budget: usize, events: &mut Events) -> usize {
        match self.rx.as_mut() {
            Some(rx) => {
                let received = &mut events.received;
                rx.poll(budget, &mut |frame| received.push(frame))
            }
            None => 0,
        }
    }

    /// Drops every frame still queued for transmission. A stopped queue stays stopped.
    pub fn tx_clear(&mut self, events: &mut Events) -> usize {
        match self.tx.as_mut() {
            Some(tx) => {
                let stopped = tx.is_stopped();
                let dropped = &mut events.dropped;
                let count = tx.clear(&mut |id| dropped.push(id));
                if stopped {
                    tx.stop();
                }
                count
            }
            None => 0,
        }
    }

    /// Folds the counters of the current queues into `retired` and drops the queues.
    pub fn retire_queues(&mut self) {
        if let Some(tx) = self.tx.take() {
            let s = tx.stats();
            self.retired.tx_packets += s.packets;
            self.retired.tx_bytes += s.bytes;
            self.retired.tx_dropped += s.dropped;
        }
        if let Some(rx) = self.rx.take() {
            let s = rx.stats();
            self.retired.rx_packets += s.packets;
            self.retired.rx_bytes += s.bytes;
            self.retired.rx_errors += s.errors;
            self.retired.rx_dropped += s.dropped;
            self.retired.rx_crc_errors += s.crc_errors;
            self.retired.rx_length_errors += s.length_errors;
            self.retired.multicast += s.multicast;
            self.retired.rx_exhausted += s.exhausted;
        }
    }

    pub fn statistics(&self) -> NicStatistics {
        let mut stats = self.retired;
        if let Some(tx) = self.tx.as_ref() {
            let s = tx.stats();
            stats.tx_packets += s.packets;
            stats.tx_bytes += s.bytes;
            stats.tx_dropped += s.dropped;
        }
        if let Some(rx) = self.rx.as_ref() {
            let s = rx.stats();
            stats.rx_packets += s.packets;
            stats.rx_bytes += s.bytes;
            stats.rx_errors += s.errors;
            stats.rx_dropped += s.dropped;
            stats.rx_crc_errors += s.crc_errors;
            stats.rx_length_errors += s.length_errors;
            stats.multicast += s.multicast;
            stats.rx_exhausted += s.exhausted;
        }
        stats.tx_errors += self.tx_errors;
        stats.rx_fifo_errors += self.rx_fifo_errors;
        stats.rx_missed += self.rx_missed;
        stats
    }
}


/// Deferred work to schedule once the device lock is released.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Scheduled {
    pub task: Task,
    pub delay_ms: u64,
    pub generation: u64,
}

/// Upcalls and deferred work collected under the device lock.
#[derive(Default)]
pub(crate) struct Events {
    pub health: Vec<DeviceHealth>,
    /// Every link transition, oldest first
    pub link: Vec<LinkState>,
    pub dropped: Vec<u64>,
    pub completed: Vec<u64>,
    pub received: Vec<ReceivedFrame>,
    /// The last stop (`true`) or wake (`false`) of the transmit queue
    pub queue: Option<bool>,
    pub tasks: Vec<Scheduled>,
}

impl Events {
    pub fn schedule(&mut self, task: Task, delay_ms: u64, generation: u64) {
        self.tasks.push(Scheduled { task, delay_ms, generation });
    }

    /// Hands everything but the scheduled tasks to the stack, in causal order.
    pub fn deliver(&mut self, stack: &dyn NetworkStack) {
        for health in self.health.drain(..) {
            stack.on_health_changed(health);
        }
        for link in self.link.drain(..) {
            stack.on_link_state_changed(link);
        }
        for id in self.dropped.drain(..) {
            stack.on_transmit_dropped(id);
        }
        for id in self.completed.drain(..) {
            stack.on_transmit_completed(id);
        }
        for frame in self.received.drain(..) {
            stack.on_frame_received(frame);
        }
        if let Some(stopped) = self.queue.take() {
            stack.on_transmit_queue(stopped);
        }
    }
}
