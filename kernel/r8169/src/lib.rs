//! A driver for the Realtek RTL8169 family of PCI gigabit Ethernet NICs.
//!
//! The driver owns one transmit and one receive descriptor ring per device
//! (see the `nic_queues` crate), services them from the interrupt handler or a budgeted poll task,
//! and runs a recovery state machine that rebuilds the device after hardware faults:
//! configuration-space drift, fatal PCI errors, and transmit timeouts.
//!
//! All platform access goes through the [`NicPlatform`] services handed to [`Rtl8169Nic::new`],
//! and all reports to the network stack go through its [`NetworkStack`] callbacks,
//! which are always invoked after the device lock has been released.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate derive_more;
#[macro_use] extern crate bitflags;
extern crate bit_field;
#[cfg(test)]
extern crate spin;
extern crate irq_safety;
extern crate nic_platform;
extern crate nic_descriptors;
extern crate nic_buffers;
extern crate nic_queues;
extern crate network_interface_card;

#[cfg(test)]
mod test;

pub mod regs;
mod chip;
mod config;
mod hw;
mod interrupt;
mod link;
mod pci_shadow;
mod recovery;
mod state;

pub use chip::{ChipOps, MacVersion, TbiChip, XmiiChip};
pub use config::*;
pub use hw::{ether_crc, multicast_hash_bit, RxFilter};
pub use link::{Advertising, LinkParams};
pub use pci_shadow::{DriftFlags, DriftReport, PciConfigShadow};
pub use recovery::RecoveryState;

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, Ordering};
use irq_safety::MutexIrqSafe;
use nic_platform::{InterruptHandler, NicPlatform};
use nic_descriptors::RingError;
use nic_buffers::{RxBufferPool, TransmitFrame, RX_BUF_ALIGNMENT};
use nic_queues::{RxQueue, RxSnapshot, TxQueue, TxSnapshot};
use network_interface_card::{
    DeviceHealth, LinkState, NetworkInterfaceCard, NetworkStack, NicStatistics, SubmitError, TransmitError,
};
use hw::{Hw, StartParams};
use regs::{IntrStatus, CONFIG2_PCI_CLOCK_66MHZ, PHY_STATUS_10BPS, REG_CONFIG2, REG_PHY_STATUS};
use state::{DeviceState, Events};
use recovery::Task;

pub const REALTEK_VEND:         u16 = 0x10EC;
/// Device ID of the RTL8169 and RTL8110 family
pub const RTL8169_DEV:          u16 = 0x8169;


/// Failures of the driver's device-wide operations.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Rtl8169Error {
    /// The MAC revision bits of `TxConfig` match no known chip.
    #[display(fmt = "unknown chip version ({:#X})", _0)]
    UnknownChip(u32),
    #[display(fmt = "{}", _0)]
    Ring(RingError),
    /// Not enough receive buffers to fill the receive ring.
    #[display(fmt = "not enough receive buffers")]
    ResourceExhausted,
    /// The chip did not complete a soft reset in time.
    #[display(fmt = "chip reset timed out")]
    ResetTimeout,
    /// The MTU is below the Ethernet minimum.
    #[display(fmt = "invalid MTU {}", _0)]
    InvalidMtu(usize),
    /// A tunable is out of range for the configured rings.
    #[display(fmt = "invalid configuration: {}", _0)]
    InvalidConfig(&'static str),
    /// The PHY does not support the requested link parameters.
    #[display(fmt = "unsupported link parameters")]
    InvalidLinkParams,
    #[display(fmt = "device is already open")]
    AlreadyOpen,
    #[display(fmt = "device is not open")]
    NotOpen,
    #[display(fmt = "interrupt line: {}", _0)]
    Irq(&'static str),
    /// Recovery gave up on the device.
    #[display(fmt = "device failed")]
    DeviceFailed,
}

impl From<RingError> for Rtl8169Error {
    fn from(e: RingError) -> Self {
        Rtl8169Error::Ring(e)
    }
}


/// One RTL8169 network interface card.
pub struct Rtl8169Nic {
    platform: NicPlatform,
    hw: Hw,
    config: Rtl8169Config,
    version: MacVersion,
    ops: &'static dyn ChipOps,
    mac: [u8; 6],
    stack: Arc<dyn NetworkStack>,
    state: MutexIrqSafe<DeviceState>,
    /// A poll task is scheduled or running
    poll_scheduled: AtomicBool,
}

impl Rtl8169Nic {
    /// Identifies the chip behind `platform` and prepares a closed device.
    ///
    /// # Arguments
    /// * `platform`: the register window, DMA, PCI, interrupt, work and clock services of this device.
    /// * `config`: ring sizes, MTU and tunables.
    /// * `stack`: the receiver of frames and status reports.
    pub fn new(
        platform: NicPlatform,
        config: Rtl8169Config,
        stack: Arc<dyn NetworkStack>,
    ) -> Result<Arc<Rtl8169Nic>, Rtl8169Error> {
        config.validate()?;
        let hw = Hw::new(&platform);
        let version = hw.mac_version().map_err(|e| {
            error!("r8169::new(): {}", e);
            e
        })?;
        let ops = chip::identify_ops(&hw);
        hw.init();

        let mut mac = hw.read_mac_address();
        if !hw::is_valid_ether_addr(&mac) {
            mac = fallback_mac_address(platform.clock.now_ms());
            warn!("r8169::new(): invalid MAC address read from the chip, using {:02x?}", mac);
        }
        hw.rar_set(mac);
        info!("r8169::new(): {} ({:?}, {} PHY), MAC address {:02x?}", version, version, ops.name(), mac);

        let mtu = config.mtu.min(MAX_MTU);
        Ok(Arc::new(Rtl8169Nic {
            platform,
            hw,
            config,
            version,
            ops,
            mac,
            stack,
            state: MutexIrqSafe::new(DeviceState::new(mtu, config.link.normalize())),
            poll_scheduled: AtomicBool::new(false),
        }))
    }

    pub fn mac_version(&self) -> MacVersion {
        self.version
    }

    pub fn config(&self) -> &Rtl8169Config {
        &self.config
    }

    pub fn mtu(&self) -> usize {
        self.state.lock().mtu
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.state.lock().recovery
    }

    /// Returns the cursors and descriptors of both rings, while the device is open.
    pub fn ring_snapshot(&self) -> Option<(TxSnapshot, RxSnapshot)> {
        let state = self.state.lock();
        match (state.tx.as_ref(), state.rx.as_ref()) {
            (Some(tx), Some(rx)) => Some((tx.snapshot(), rx.snapshot())),
            _ => None,
        }
    }

    /// Allocates the rings, starts the hardware, registers the interrupt handler and arms the timers.
    pub fn open(self: &Arc<Self>) -> Result<(), Rtl8169Error> {
        let mut events = Events::default();
        let result = {
            let mut state = self.state.lock();
            if state.opened {
                return Err(Rtl8169Error::AlreadyOpen);
            }
            self.poll_scheduled.store(false, Ordering::SeqCst);
            state.reset_attempts = 0;
            state.set_recovery(RecoveryState::Running, &mut events);
            match self.bring_up(&mut state, &mut events) {
                Ok(()) => {
                    state.opened = true;
                    state.generation += 1;
                    let generation = state.generation;
                    if self.version.has_link_monitor() {
                        state.link_timer_armed = true;
                        events.schedule(Task::LinkMonitor, self.config.phy_timeout_ms, generation);
                    }
                    events.schedule(Task::Watchdog, self.config.esd_timeout_ms, generation);
                    Ok(())
                }
                Err(e) => {
                    self.bring_down(&mut state, &mut events);
                    Err(e)
                }
            }
        };
        if let Err(e) = result {
            error!("r8169::open(): failed to open device: {}", e);
            self.dispatch(events);
            return Err(e);
        }

        let nic = Arc::downgrade(self);
        let irq = self.platform.irq.clone();
        let handler: InterruptHandler = Arc::new(move || {
            let handled = match nic.upgrade() {
                Some(nic) => nic.handle_interrupt(),
                None => false,
            };
            if handled {
                irq.end_of_interrupt();
            }
            handled
        });
        if let Err(e) = self.platform.irq.request(handler) {
            error!("r8169::open(): couldn't register interrupt handler: {}", e);
            events.tasks.clear();
            let mut state = self.state.lock();
            state.generation += 1;
            state.opened = false;
            self.bring_down(&mut state, &mut events);
            drop(state);
            self.dispatch(events);
            return Err(Rtl8169Error::Irq(e));
        }

        self.dispatch(events);
        Ok(())
    }

    /// Stops the hardware, drops every queued frame, releases the rings and frees the interrupt line.
    pub fn close(&self) -> Result<(), Rtl8169Error> {
        let mut events = Events::default();
        {
            let mut state = self.state.lock();
            if !state.opened {
                return Err(Rtl8169Error::NotOpen);
            }
            state.opened = false;
            state.generation += 1;
            state.link_timer_armed = false;
            state.reset_task_pending = false;
            self.bring_down(&mut state, &mut events);
        }
        self.platform.irq.free();
        self.poll_scheduled.store(false, Ordering::SeqCst);
        self.deliver(events);
        Ok(())
    }

    /// Creates the queues if needed, fills the receive ring, and starts the hardware.
    fn bring_up(&self, state: &mut DeviceState, events: &mut Events) -> Result<(), Rtl8169Error> {
        state.rx_buf_size = nic_buffers::rx_buffer_size(state.mtu);
        if state.tx.is_none() {
            state.tx = Some(TxQueue::new(
                self.config.num_tx_desc,
                self.config.tx_stop_threshold,
                self.config.pad_short_frames,
                self.platform.dma.clone(),
            )?);
        }
        if state.rx.is_none() {
            let pool = RxBufferPool::new(state.rx_buf_size, RX_BUF_ALIGNMENT, self.platform.dma.clone());
            state.rx = Some(RxQueue::new(self.config.num_rx_desc, pool, self.config.rx_options())?);
        }
        if let Some(rx) = state.rx.as_mut() {
            rx.init().map_err(|_| Rtl8169Error::ResourceExhausted)?;
        }

        self.hw.init();
        self.hw.reset()?;
        self.ops.power_up(&self.hw);
        self.start_hardware(state)?;
        if state.pci_shadow.is_none() {
            state.pci_shadow = Some(PciConfigShadow::capture(self.hw.pci()));
        }
        self.check_link_status(state, events);
        self.apply_link_params(state);
        state.intr_mask = IntrStatus::DEFAULT_MASK;
        self.hw.set_intr_mask(state.intr_mask);
        Ok(())
    }

    /// Runs the hardware start sequence with the current rings, leaving interrupts masked.
    fn start_hardware(&self, state: &mut DeviceState) -> Result<(), Rtl8169Error> {
        let (tx_ring, rx_ring) = match (state.tx.as_ref(), state.rx.as_ref()) {
            (Some(tx), Some(rx)) => (tx.ring().device_address(), rx.ring().device_address()),
            _ => return Err(Rtl8169Error::NotOpen),
        };
        let params = StartParams {
            tx_ring,
            rx_ring,
            cp_cmd: state.cp_cmd,
            rx_checksum: self.config.rx_checksum,
            rx_vlan: self.config.rx_vlan,
            rx_buf_size: state.rx_buf_size,
            filter: &state.filter,
            rx_all: self.config.rx_all,
            version: self.version,
            intr_mask: IntrStatus::empty(),
        };
        state.cp_cmd = self.hw.start(&params)?;
        Ok(())
    }

    /// Programs the stored link parameters into the PHY.
    fn apply_link_params(&self, state: &mut DeviceState) {
        match self.ops.set_speed(&self.hw, &state.link_params) {
            Ok(ctrl1000) => state.phy_1000_ctrl = ctrl1000,
            Err(e) => warn!("r8169::apply_link_params(): {:?}: {}", state.link_params, e),
        }
    }

    /// Stops the hardware and releases the rings. Every queued transmit frame is reported dropped.
    fn bring_down(&self, state: &mut DeviceState, events: &mut Events) {
        state.stop_queue(events);
        state.carrier = false;
        state.set_link(LinkState::DOWN, events);
        if let Err(e) = self.hw.reset() {
            error!("r8169::bring_down(): {}", e);
        }
        state.intr_mask = IntrStatus::empty();
        state.rx_missed += self.hw.take_missed() as u64;
        state.tx_clear(events);
        if let Some(rx) = state.rx.as_mut() {
            rx.clear();
        }
        self.hw.set_rx_max_size(nic_buffers::RX_BUF_SIZE);
        self.ops.power_down(&self.hw);
        state.retire_queues();
    }

    /// Re-evaluates the link: adjusts transmit settings, sets the carrier, and stops or wakes the queue.
    fn check_link_status(&self, state: &mut DeviceState, events: &mut Events) {
        if self.ops.link_ok(&self.hw) {
            let phy_status = self.hw.regs().read8(REG_PHY_STATUS);
            let slow_bus = self.hw.regs().read8(REG_CONFIG2) & CONFIG2_PCI_CLOCK_66MHZ != 0;
            let clear_burst = self.version == MacVersion::V4 && phy_status & PHY_STATUS_10BPS != 0 && slow_bus;
            self.hw.set_tx_dma_burst(!clear_burst);
            self.hw.set_tx_config(self.version);

            let mut link = self.ops.link_state(&self.hw);
            if !link.up {
                link = LinkState { up: true, speed: None, duplex: None };
            }
            state.carrier = true;
            if state.link != link {
                info!("r8169::check_link_status(): link {}", link);
            }
            state.set_link(link, events);
            state.wake_queue(events);
        } else {
            if state.link.up {
                info!("r8169::check_link_status(): link down");
            }
            state.stop_queue(events);
            state.carrier = false;
            state.set_link(LinkState::DOWN, events);
            if state.opened && self.version.has_link_monitor() && !state.link_timer_armed {
                state.link_timer_armed = true;
                events.schedule(Task::LinkMonitor, self.config.phy_timeout_ms, state.generation);
            }
        }
    }

    /// Changes the MTU, rebuilding the rings with the new buffer size if the device is open.
    ///
    /// MTUs above [`MAX_MTU`] are clamped to it. Returns the MTU now in effect.
    pub fn change_mtu(self: &Arc<Self>, new_mtu: usize) -> Result<usize, Rtl8169Error> {
        if new_mtu < MIN_MTU {
            return Err(Rtl8169Error::InvalidMtu(new_mtu));
        }
        let mtu = new_mtu.min(MAX_MTU);
        let mut events = Events::default();
        let result = {
            let mut state = self.state.lock();
            if state.opened {
                match state.recovery {
                    RecoveryState::Failed => Err(Rtl8169Error::DeviceFailed),
                    _ => {
                        state.mtu = mtu;
                        self.bring_down(&mut state, &mut events);
                        let result = self.bring_up(&mut state, &mut events);
                        if let Err(e) = result {
                            error!("r8169::change_mtu(): couldn't restart with MTU {}: {}", mtu, e);
                            self.attempt_failed(&mut state, &mut events);
                        }
                        result
                    }
                }
            } else {
                state.mtu = mtu;
                state.rx_buf_size = nic_buffers::rx_buffer_size(mtu);
                Ok(())
            }
        };
        self.dispatch(events);
        result.map(|_| mtu)
    }

    /// Replaces the receive filter.
    pub fn set_rx_filter(&self, filter: RxFilter) {
        let mut state = self.state.lock();
        if state.opened {
            self.hw.set_rx_mode(&filter, self.config.rx_all);
        }
        state.filter = filter;
    }

    /// Replaces the link parameters, renegotiating if the device is open.
    pub fn set_link_params(&self, params: LinkParams) -> Result<(), Rtl8169Error> {
        let params = params.normalize();
        let mut state = self.state.lock();
        if state.opened {
            state.phy_1000_ctrl = self.ops.set_speed(&self.hw, &params)?;
        }
        state.link_params = params;
        Ok(())
    }

    /// Invokes the stack's callbacks for everything collected in `events`, then schedules its tasks.
    /// Must be called without the device lock held.
    fn dispatch(self: &Arc<Self>, mut events: Events) {
        events.deliver(&*self.stack);
        for scheduled in events.tasks.drain(..) {
            self.schedule(scheduled.task, scheduled.delay_ms, scheduled.generation);
        }
    }

    /// Like [`dispatch`](Self::dispatch), for contexts that never produce deferred work.
    fn deliver(&self, mut events: Events) {
        if !events.tasks.is_empty() {
            error!("r8169::deliver(): dropping {} tasks scheduled without a device handle", events.tasks.len());
        }
        events.deliver(&*self.stack);
    }
}

impl NetworkInterfaceCard for Rtl8169Nic {
    fn send_frame(&self, frame: TransmitFrame) -> Result<(), SubmitError> {
        let mut events = Events::default();
        let result = {
            let mut state = self.state.lock();
            let error = match state.recovery {
                RecoveryState::Failed => Some(TransmitError::DeviceFailed),
                _ if !state.opened => Some(TransmitError::NotOpen),
                RecoveryState::Suspect | RecoveryState::Resetting => Some(TransmitError::LinkDown),
                RecoveryState::Running if !state.carrier => Some(TransmitError::LinkDown),
                RecoveryState::Running => None,
            };
            match (error, state.tx.as_mut()) {
                (Some(error), _) => Err(SubmitError::new(error, frame)),
                (None, None) => Err(SubmitError::new(TransmitError::NotOpen, frame)),
                (None, Some(tx)) => tx.submit(frame).map(|submitted| {
                    self.hw.tx_poll();
                    if submitted.stopped {
                        events.queue = Some(true);
                    }
                }),
            }
        };
        self.deliver(events);
        result
    }

    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }

    fn link_state(&self) -> LinkState {
        self.state.lock().link
    }

    fn health(&self) -> DeviceHealth {
        self.state.lock().recovery.into()
    }

    /// Also folds the chip's missed-packet counter into the totals.
    fn statistics(&self) -> NicStatistics {
        let mut state = self.state.lock();
        if state.opened {
            state.rx_missed += self.hw.take_missed() as u64;
        }
        state.statistics()
    }
}

/// A locally-administered unicast address, for chips whose stored address is unusable.
fn fallback_mac_address(seed: u64) -> [u8; 6] {
    let mut x = seed ^ 0x9E37_79B9_7F4A_7C15;
    x ^= x >> 33;
    x = x.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    x ^= x >> 33;
    let b = x.to_le_bytes();
    [(b[0] & 0xFE) | 0x02, b[1], b[2], b[3], b[4], b[5]]
}

