extern crate std;


use super::*;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;
use nic_platform::pci::*;
use nic_platform::sim::{ManualClock, ManualWorkQueue, SimDma};
use nic_descriptors::{RX_CRC, RX_RES};
use nic_buffers::ReceivedFrame;
use network_interface_card::{Duplex, Speed};
use regs::*;
use sim::{SimRtl8169, SIM_MAC};


#[derive(Clone, Debug, PartialEq, Eq)]
enum Event {
    Received(Vec<u8>),
    Link(LinkState),
    Completed(u64),
    Dropped(u64),
    Queue(bool),
    Health(DeviceHealth),
}

#[derive(Default)]
struct RecordingStack {
    events: Mutex<Vec<Event>>,
}

impl RecordingStack {
    fn take(&self) -> Vec<Event> {
        core::mem::take(&mut *self.events.lock())
    }

    fn push(&self, event: Event) {
        self.events.lock().push(event);
    }
}

impl NetworkStack for RecordingStack {
    fn on_frame_received(&self, frame: ReceivedFrame) {
        self.push(Event::Received(frame.data.into_vec()));
    }
    fn on_link_state_changed(&self, state: LinkState) {
        self.push(Event::Link(state));
    }
    fn on_transmit_completed(&self, id: u64) {
        self.push(Event::Completed(id));
    }
    fn on_transmit_dropped(&self, id: u64) {
        self.push(Event::Dropped(id));
    }
    fn on_transmit_queue(&self, stopped: bool) {
        self.push(Event::Queue(stopped));
    }
    fn on_health_changed(&self, health: DeviceHealth) {
        self.push(Event::Health(health));
    }
}

fn received(events: &[Event]) -> Vec<Vec<u8>> {
    events.iter().filter_map(|e| match e {
        Event::Received(data) => Some(data.clone()),
        _ => None,
    }).collect()
}

fn completed(events: &[Event]) -> Vec<u64> {
    events.iter().filter_map(|e| match e {
        Event::Completed(id) => Some(*id),
        _ => None,
    }).collect()
}

fn dropped(events: &[Event]) -> Vec<u64> {
    events.iter().filter_map(|e| match e {
        Event::Dropped(id) => Some(*id),
        _ => None,
    }).collect()
}

fn health(events: &[Event]) -> Vec<DeviceHealth> {
    events.iter().filter_map(|e| match e {
        Event::Health(h) => Some(*h),
        _ => None,
    }).collect()
}

const GIGABIT: LinkState = LinkState::up(Speed::Mbps1000, Duplex::Full);

struct Harness {
    dma: Arc<SimDma>,
    work: Arc<ManualWorkQueue>,
    sim: Arc<SimRtl8169>,
    stack: Arc<RecordingStack>,
    nic: Arc<Rtl8169Nic>,
}

fn test_config() -> Rtl8169Config {
    Rtl8169Config {
        num_tx_desc: 16,
        num_rx_desc: 32,
        tx_stop_threshold: 2,
        ..Default::default()
    }
}

/// A simulated device and its platform, before the driver attaches.
fn platform() -> (Arc<SimDma>, Arc<ManualWorkQueue>, Arc<SimRtl8169>, NicPlatform) {
    let dma = Arc::new(SimDma::new());
    let clock = Arc::new(ManualClock::new());
    let work = Arc::new(ManualWorkQueue::new(clock.clone()));
    let sim = Arc::new(SimRtl8169::new(dma.clone()));
    let platform = NicPlatform {
        registers: sim.clone(),
        dma: dma.clone(),
        pci: sim.clone(),
        irq: sim.clone(),
        work: work.clone(),
        clock,
    };
    (dma, work, sim, platform)
}

fn attach(config: Rtl8169Config, setup: impl FnOnce(&SimRtl8169)) -> Harness {
    let (dma, work, sim, platform) = platform();
    setup(&sim);
    let stack = Arc::new(RecordingStack::default());
    let nic = Rtl8169Nic::new(platform, config, stack.clone()).unwrap();
    Harness { dma, work, sim, stack, nic }
}

/// Attaches and opens a device, discarding the events of opening it.
fn open(config: Rtl8169Config) -> Harness {
    let h = attach(config, |_| { });
    h.nic.open().unwrap();
    h.stack.take();
    h
}

impl Harness {
    /// Fires the interrupt line and runs whatever work it scheduled.
    fn interrupt(&self) -> bool {
        let handled = self.sim.fire_irq();
        self.work.run_due();
        handled
    }

    fn send(&self, id: u64, len: usize) -> Result<(), SubmitError> {
        self.nic.send_frame(TransmitFrame::new(id, vec![id as u8; len]))
    }
}

/// An Ethernet frame addressed to the simulated device.
fn unicast_frame(tag: u8, len: usize) -> Vec<u8> {
    let mut frame = vec![tag; len];
    frame[..6].copy_from_slice(&SIM_MAC);
    frame[6..12].copy_from_slice(&[0x02, 0, 0, 0, 0, tag]);
    frame[12..14].copy_from_slice(&[0x08, 0x00]);
    frame
}


#[test]
fn attach_identifies_the_chip_and_programs_the_mac() {
    let h = attach(test_config(), |_| { });
    assert_eq!(h.nic.mac_version(), MacVersion::V2);
    assert_eq!(h.nic.mac_address(), SIM_MAC);
    assert_eq!(h.nic.link_state(), LinkState::DOWN);
    assert_eq!(h.nic.health(), DeviceHealth::Running);
    assert_eq!(h.sim.reg32(REG_MAC0).to_le_bytes(), [0x00, 0xe0, 0x4c, 0x69]);
    assert_eq!(h.sim.reg32(REG_RX_CONFIG) & RX_CONFIG_ACCEPT_MASK, 0);
}

#[test]
fn unknown_chips_are_rejected() {
    let (_dma, _work, sim, platform) = platform();
    sim.set_tx_config_version(0x7C80_0000);
    let stack = Arc::new(RecordingStack::default());
    let result = Rtl8169Nic::new(platform, test_config(), stack);
    assert_eq!(result.err(), Some(Rtl8169Error::UnknownChip(0x7C80_0000)));

    assert_eq!(MacVersion::from_tx_config(0x9800_0000 | 0x0300_0700), Ok(MacVersion::V6));
    assert_eq!(MacVersion::from_tx_config(0x1000_0000), Ok(MacVersion::V4));
    assert!(!MacVersion::V1.has_link_monitor());
    assert!(MacVersion::V2.has_link_monitor());
}

#[test]
fn invalid_configurations_are_rejected() {
    let (_dma, _work, _sim, platform) = platform();
    let stack = Arc::new(RecordingStack::default());
    let config = Rtl8169Config { num_tx_desc: 12, ..test_config() };
    let result = Rtl8169Nic::new(platform, config, stack);
    assert_eq!(result.err(), Some(Rtl8169Error::Ring(RingError::InvalidCapacity(12))));
    assert_eq!(Rtl8169Config { mtu: 20, ..test_config() }.validate(), Err(Rtl8169Error::InvalidMtu(20)));
}

#[test]
fn tunables_that_would_stall_the_queues_are_rejected() {
    // the default threshold does not fit a 16-entry ring
    let config = Rtl8169Config { num_tx_desc: 16, ..Default::default() };
    assert!(matches!(config.validate(), Err(Rtl8169Error::InvalidConfig(_))));
    let config = Rtl8169Config { num_tx_desc: 16, tx_stop_threshold: 15, ..Default::default() };
    assert!(matches!(config.validate(), Err(Rtl8169Error::InvalidConfig(_))));
    let config = Rtl8169Config { num_tx_desc: 16, tx_stop_threshold: 14, ..Default::default() };
    assert_eq!(config.validate(), Ok(()));
    assert_eq!(Rtl8169Config::default().validate(), Ok(()));

    let config = Rtl8169Config { napi_weight: 0, ..test_config() };
    assert!(matches!(config.validate(), Err(Rtl8169Error::InvalidConfig(_))));
    let (_dma, _work, _sim, platform) = platform();
    let result = Rtl8169Nic::new(platform, config, Arc::new(RecordingStack::default()));
    assert!(matches!(result.err(), Some(Rtl8169Error::InvalidConfig(_))));
}

#[test]
fn the_largest_valid_threshold_still_wakes_the_queue() {
    let config = Rtl8169Config { num_tx_desc: 16, tx_stop_threshold: 14, ..test_config() };
    let h = open(config);
    h.send(1, 64).unwrap();
    assert_eq!(h.stack.take(), vec![Event::Queue(true)]);
    assert!(h.interrupt());
    assert_eq!(h.stack.take(), vec![Event::Completed(1), Event::Queue(false)]);
    h.send(2, 64).unwrap();
}

#[test]
fn an_unusable_mac_address_is_replaced() {
    let h = attach(test_config(), |sim| sim.set_mac([0; 6]));
    let mac = h.nic.mac_address();
    assert_ne!(mac, [0; 6]);
    assert_eq!(mac[0] & 0x01, 0, "must be unicast");
    assert_eq!(mac[0] & 0x02, 0x02, "must be locally administered");
    assert_eq!(h.sim.reg32(REG_MAC0).to_le_bytes(), [mac[0], mac[1], mac[2], mac[3]]);
}

#[test]
fn open_starts_the_device_and_reports_the_link() {
    let h = attach(test_config(), |_| { });
    h.nic.open().unwrap();
    assert_eq!(h.stack.take(), vec![Event::Link(GIGABIT)]);
    assert_eq!(h.nic.link_state(), GIGABIT);
    assert!(h.sim.has_handler());
    assert_eq!(h.sim.intr_mask(), IntrStatus::DEFAULT_MASK.bits());
    assert_eq!(h.sim.reg16(REG_RX_MAX_SIZE) as usize, nic_buffers::RX_BUF_SIZE);
    assert_eq!(h.sim.reg32(REG_RX_CONFIG) & (ACCEPT_BROADCAST | ACCEPT_MY_PHYS), ACCEPT_BROADCAST | ACCEPT_MY_PHYS);
    assert_eq!(h.sim.pci_byte(PCI_LATENCY_TIMER), 0x40);
    assert_eq!(h.sim.phy_reg(MII_CTRL1000) & ADVERTISE_1000FULL, ADVERTISE_1000FULL);

    let (tx, rx) = h.nic.ring_snapshot().unwrap();
    assert_eq!((tx.produced, tx.dirty), (0, 0));
    assert_eq!((rx.consumed, rx.refilled), (0, 0));
    assert!(rx.descriptors.iter().all(|&(opts1, _, _)| opts1 & nic_descriptors::DESC_OWN != 0));

    assert_eq!(h.nic.open(), Err(Rtl8169Error::AlreadyOpen));
}

#[test]
fn transmitted_frames_complete_through_the_poll_task() {
    let h = open(test_config());
    h.send(1, 100).unwrap();
    h.send(2, 20).unwrap();
    assert_eq!(h.sim.doorbells(), 2);

    let sent = h.sim.take_transmitted();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0], vec![1u8; 100]);
    // short frames are padded to the Ethernet minimum
    assert_eq!(sent[1].len(), nic_buffers::ETH_ZLEN);
    assert_eq!(&sent[1][..20], &[2u8; 20][..]);

    assert!(h.sim.fire_irq());
    // traffic interrupts stay masked until the poll task has run
    assert_eq!(h.sim.intr_mask() & IntrStatus::TX_OK.bits(), 0);
    assert_eq!(h.work.run_due(), 1);
    assert_eq!(completed(&h.stack.take()), vec![1, 2]);
    assert_eq!(h.sim.intr_mask(), IntrStatus::DEFAULT_MASK.bits());

    let stats = h.nic.statistics();
    assert_eq!(stats.tx_packets, 2);
    assert_eq!(stats.tx_bytes, 160);
    let (tx, _) = h.nic.ring_snapshot().unwrap();
    assert_eq!((tx.produced, tx.dirty), (2, 2));
}

#[test]
fn a_full_ring_refuses_frames_until_one_completes() {
    let config = Rtl8169Config { num_tx_desc: 4, tx_stop_threshold: 0, ..test_config() };
    let h = open(config);
    h.sim.set_auto_transmit(false);
    for id in 1..=3 {
        h.send(id, 64).unwrap();
    }
    assert_eq!(h.stack.take(), vec![Event::Queue(true)]);
    let before = h.nic.ring_snapshot().unwrap().0;

    let err = h.send(4, 64).unwrap_err();
    assert_eq!(err.error, TransmitError::ResourceExhausted);
    assert_eq!(err.frame.id, 4);
    assert_eq!(h.nic.ring_snapshot().unwrap().0, before);

    assert_eq!(h.sim.process_tx(1), 1);
    assert!(h.interrupt());
    assert_eq!(h.stack.take(), vec![Event::Completed(1), Event::Queue(false)]);
    h.nic.send_frame(err.frame).unwrap();
}

#[test]
fn received_frames_are_delivered_once_and_slots_refilled() {
    let h = open(test_config());
    let frames: Vec<_> = (1..=3).map(|tag| unicast_frame(tag, 64 + tag as usize)).collect();
    for frame in &frames {
        assert!(h.sim.receive(frame, 0));
    }
    assert!(h.interrupt());
    assert_eq!(received(&h.stack.take()), frames);

    let (_, rx) = h.nic.ring_snapshot().unwrap();
    assert_eq!((rx.consumed, rx.refilled), (3, 3));
    assert!(rx.descriptors.iter().all(|&(opts1, _, _)| opts1 & nic_descriptors::DESC_OWN != 0));
    let stats = h.nic.statistics();
    assert_eq!(stats.rx_packets, 3);
    assert_eq!(stats.rx_bytes, 65 + 66 + 67);
}

#[test]
fn crc_errors_are_counted_and_not_delivered() {
    let h = open(test_config());
    assert!(h.sim.receive(&unicast_frame(1, 64), RX_RES | RX_CRC));
    let good = unicast_frame(2, 64);
    assert!(h.sim.receive(&good, 0));
    assert!(h.interrupt());
    assert_eq!(received(&h.stack.take()), vec![good]);

    let stats = h.nic.statistics();
    assert_eq!(stats.rx_errors, 1);
    assert_eq!(stats.rx_crc_errors, 1);
    assert_eq!(stats.rx_packets, 1);
    let (_, rx) = h.nic.ring_snapshot().unwrap();
    assert_eq!(rx.descriptors[0].0 & nic_descriptors::DESC_OWN, nic_descriptors::DESC_OWN);
}

#[test]
fn the_poll_task_respects_its_budget() {
    let config = Rtl8169Config { napi_weight: 8, ..test_config() };
    let h = open(config);
    let frames: Vec<_> = (0..20).map(|tag| unicast_frame(tag, 60)).collect();
    for frame in &frames {
        assert!(h.sim.receive(frame, 0));
    }
    let timers = h.work.pending();
    assert!(h.sim.fire_irq());
    assert!(h.work.run_next());
    assert_eq!(received(&h.stack.take()), frames[..8].to_vec());
    // the budget ran out, so the poll task is rescheduled and interrupts stay masked
    assert_eq!(h.work.pending(), timers + 1);
    assert_eq!(h.sim.intr_mask() & IntrStatus::RX_OK.bits(), 0);

    assert_eq!(h.nic.poll(16), 12);
    assert_eq!(received(&h.stack.take()), frames[8..].to_vec());
    assert_eq!(h.sim.intr_mask(), IntrStatus::DEFAULT_MASK.bits());

    h.work.run_due();
    assert!(received(&h.stack.take()).is_empty());
}

#[test]
fn direct_dispatch_does_all_work_in_the_handler() {
    let config = Rtl8169Config { dispatch: DispatchMode::Direct, ..test_config() };
    let h = open(config);
    let timers = h.work.pending();
    h.send(7, 80).unwrap();
    let frame = unicast_frame(9, 70);
    assert!(h.sim.receive(&frame, 0));
    assert!(h.sim.fire_irq());
    let events = h.stack.take();
    assert_eq!(completed(&events), vec![7]);
    assert_eq!(received(&events), vec![frame]);
    assert_eq!(h.work.pending(), timers);
    assert_eq!(h.sim.intr_mask(), IntrStatus::DEFAULT_MASK.bits());
}

#[test]
fn foreign_and_absent_interrupts_are_not_claimed() {
    let h = open(test_config());
    assert!(!h.sim.fire_irq());
    assert!(h.stack.take().is_empty());
    h.sim.raise(IntrStatus::SW_INT);
    assert!(!h.sim.fire_irq());
}

#[test]
fn fifo_overflow_is_acknowledged_with_rx_overflow() {
    let h = open(test_config());
    h.sim.raise(IntrStatus::RX_FIFO_OVER | IntrStatus::RX_OVERFLOW);
    assert!(h.interrupt());
    assert_eq!(h.sim.intr_status(), 0);
    assert_eq!(h.nic.statistics().rx_fifo_errors, 1);
}

#[test]
fn link_changes_stop_and_wake_the_queue() {
    let h = open(test_config());
    h.sim.set_link(false);
    assert!(h.interrupt());
    assert_eq!(h.stack.take(), vec![Event::Link(LinkState::DOWN), Event::Queue(true)]);
    assert_eq!(h.send(1, 64).unwrap_err().error, TransmitError::LinkDown);

    h.sim.set_link(true);
    assert!(h.interrupt());
    assert_eq!(h.stack.take(), vec![Event::Link(GIGABIT), Event::Queue(false)]);
    h.send(2, 64).unwrap();
}

#[test]
fn the_link_monitor_resets_the_phy_until_the_link_comes_up() {
    let h = attach(test_config(), |sim| sim.set_link(false));
    h.nic.open().unwrap();
    let resets = h.sim.phy_resets();

    h.work.advance(PHY_TIMEOUT_MS);
    assert_eq!(h.sim.phy_resets(), resets + 1);
    h.work.advance(PHY_TIMEOUT_MS);
    assert_eq!(h.sim.phy_resets(), resets + 2);

    h.sim.set_link(true);
    h.work.advance(PHY_TIMEOUT_MS);
    h.work.advance(PHY_TIMEOUT_MS);
    assert_eq!(h.sim.phy_resets(), resets + 2);
}

#[test]
fn forced_link_parameters_are_programmed_into_the_phy() {
    let h = open(test_config());
    h.nic.set_link_params(LinkParams::forced(Speed::Mbps100, Duplex::Full)).unwrap();
    assert_eq!(h.sim.phy_reg(MII_BMCR), BMCR_SPEED100 | BMCR_FULLDPLX);
    assert_eq!(
        h.nic.set_link_params(LinkParams::forced(Speed::Mbps1000, Duplex::Full)),
        Err(Rtl8169Error::InvalidLinkParams),
    );

    let params = LinkParams { advertising: Advertising::FULL_100 | Advertising::HALF_10, ..LinkParams::default() };
    h.nic.set_link_params(params).unwrap();
    let adv = h.sim.phy_reg(MII_ADVERTISE);
    assert_eq!(adv & (ADVERTISE_100FULL | ADVERTISE_10HALF), ADVERTISE_100FULL | ADVERTISE_10HALF);
    assert_eq!(adv & (ADVERTISE_100HALF | ADVERTISE_10FULL), 0);
    assert_eq!(h.sim.phy_reg(MII_CTRL1000) & (ADVERTISE_1000FULL | ADVERTISE_1000HALF), 0);
}

#[test]
fn tbi_chips_use_the_tbi_operations() {
    let h = attach(test_config(), |sim| sim.set_tbi(true));
    h.nic.open().unwrap();
    assert_eq!(h.stack.take(), vec![Event::Link(GIGABIT)]);
    assert_eq!(h.sim.reg32(REG_TBICSR) & TBI_NW_ENABLE, TBI_NW_ENABLE);
    assert_eq!(
        h.nic.set_link_params(LinkParams::forced(Speed::Mbps100, Duplex::Full)),
        Err(Rtl8169Error::InvalidLinkParams),
    );
}

#[test]
fn configuration_drift_rebuilds_the_device() {
    let h = open(test_config());
    h.sim.set_auto_transmit(false);
    for id in 1..=3 {
        h.send(id, 64).unwrap();
    }
    h.sim.corrupt_pci(PCI_CACHE_LINE_SIZE, 0x00);
    h.sim.corrupt_pci(PCI_INTERRUPT_LINE, 5);

    h.work.advance(ESD_TIMEOUT_MS);
    let events = h.stack.take();
    assert_eq!(health(&events), vec![DeviceHealth::Suspect, DeviceHealth::Resetting, DeviceHealth::Running]);
    assert_eq!(dropped(&events), vec![1, 2, 3]);
    assert!(events.contains(&Event::Link(LinkState::DOWN)));
    assert_eq!(events.iter().filter(|e| **e == Event::Link(GIGABIT)).count(), 1);
    assert_eq!(h.nic.recovery_state(), RecoveryState::Running);
    assert_eq!(h.sim.pci_byte(PCI_CACHE_LINE_SIZE), 0x08);
    assert_eq!(h.sim.pci_byte(PCI_INTERRUPT_LINE), 11);

    let (tx, rx) = h.nic.ring_snapshot().unwrap();
    assert_eq!((tx.produced, tx.dirty), (0, 0));
    assert_eq!((rx.consumed, rx.refilled), (0, 0));
    assert_eq!(h.nic.statistics().tx_dropped, 3);

    // the next check finds nothing, and traffic flows again
    h.work.advance(ESD_TIMEOUT_MS);
    assert!(health(&h.stack.take()).is_empty());
    h.sim.set_auto_transmit(true);
    h.send(4, 64).unwrap();
    assert!(h.interrupt());
    assert_eq!(completed(&h.stack.take()), vec![4]);
    assert_eq!(h.dma.bad_unmaps(), 0);
}

#[test]
fn a_dead_pci_link_leaves_the_device_suspect() {
    let h = open(test_config());
    h.sim.set_pci_dead(true);
    h.work.advance(ESD_TIMEOUT_MS);
    let events = h.stack.take();
    assert_eq!(health(&events), vec![DeviceHealth::Suspect]);
    assert_eq!(h.send(1, 64).unwrap_err().error, TransmitError::LinkDown);

    h.work.advance(ESD_TIMEOUT_MS);
    assert!(health(&h.stack.take()).is_empty());
    assert_eq!(h.nic.recovery_state(), RecoveryState::Suspect);

    h.sim.set_pci_dead(false);
    h.work.advance(ESD_TIMEOUT_MS);
    assert_eq!(health(&h.stack.take()), vec![DeviceHealth::Resetting, DeviceHealth::Running]);
    h.send(2, 64).unwrap();
}

#[test]
fn a_transmit_timeout_resets_the_device() {
    let h = open(test_config());
    h.sim.set_auto_transmit(false);
    h.send(1, 64).unwrap();
    h.send(2, 64).unwrap();
    let resets = h.sim.resets();

    h.nic.tx_timeout();
    assert_eq!(h.stack.take(), vec![Event::Health(DeviceHealth::Resetting), Event::Queue(true)]);
    assert_eq!(h.send(3, 64).unwrap_err().error, TransmitError::LinkDown);

    h.work.advance(RESET_DELAY_MS);
    let events = h.stack.take();
    assert_eq!(health(&events), vec![DeviceHealth::Running]);
    assert_eq!(dropped(&events), vec![1, 2]);
    assert_eq!(events.last(), Some(&Event::Queue(false)));
    assert!(h.sim.resets() > resets);
    let (tx, _) = h.nic.ring_snapshot().unwrap();
    assert_eq!((tx.produced, tx.dirty), (0, 0));
}

#[test]
fn a_system_error_repairs_pci_and_reinitializes() {
    let h = open(test_config());
    h.sim.corrupt_pci(PCI_STATUS + 1, (PCI_STATUS_REC_MASTER_ABORT >> 8) as u8);
    h.sim.raise(IntrStatus::SYS_ERR);
    assert!(h.sim.fire_irq());
    assert_eq!(health(&h.stack.take()), vec![DeviceHealth::Resetting]);
    assert_eq!(h.sim.pci_byte(PCI_STATUS + 1), 0);
    assert_eq!(h.sim.pci_byte(PCI_COMMAND), 0x07 | PCI_COMMAND_PARITY as u8);
    assert_eq!(h.sim.pci_byte(PCI_COMMAND + 1), (PCI_COMMAND_SERR >> 8) as u8);
    assert_eq!(h.sim.intr_mask(), 0);

    h.work.advance(RESET_DELAY_MS);
    assert_eq!(health(&h.stack.take()), vec![DeviceHealth::Running]);
    assert_eq!(h.sim.intr_mask(), IntrStatus::DEFAULT_MASK.bits());

    // the repaired command register is the new baseline, not drift
    h.work.advance(ESD_TIMEOUT_MS);
    assert!(health(&h.stack.take()).is_empty());
}

#[test]
fn repeated_reset_failures_fail_the_device() {
    let config = Rtl8169Config { max_reset_attempts: 3, ..test_config() };
    let h = open(config);
    h.sim.set_reset_stuck(true);
    h.nic.tx_timeout();
    h.work.advance(5_000);

    let events = h.stack.take();
    assert_eq!(health(&events), vec![DeviceHealth::Resetting, DeviceHealth::Failed]);
    assert!(events.contains(&Event::Link(LinkState::DOWN)));
    assert_eq!(h.nic.health(), DeviceHealth::Failed);
    assert_eq!(h.sim.intr_mask(), 0);
    assert_eq!(h.send(1, 64).unwrap_err().error, TransmitError::DeviceFailed);
    assert_eq!(h.nic.change_mtu(2000), Err(Rtl8169Error::DeviceFailed));

    // no more automatic retries
    h.work.advance(30_000);
    assert_eq!(h.work.pending(), 0);
    assert!(h.stack.take().is_empty());

    h.nic.close().unwrap();
    h.sim.set_reset_stuck(false);
    h.nic.open().unwrap();
    assert_eq!(health(&h.stack.take()), vec![DeviceHealth::Running]);
}

#[test]
fn close_drops_queued_frames_and_releases_everything() {
    let h = open(test_config());
    h.sim.set_auto_transmit(false);
    h.send(1, 64).unwrap();
    h.send(2, 64).unwrap();
    let frame = unicast_frame(3, 64);
    assert!(h.sim.receive(&frame, 0));

    h.nic.close().unwrap();
    let events = h.stack.take();
    assert_eq!(dropped(&events), vec![1, 2]);
    assert!(events.contains(&Event::Link(LinkState::DOWN)));
    assert!(!h.sim.has_handler());
    assert_eq!(h.dma.live_mappings(), 0);
    assert_eq!(h.dma.bad_unmaps(), 0);
    assert!(h.nic.ring_snapshot().is_none());
    assert_eq!(h.send(4, 64).unwrap_err().error, TransmitError::NotOpen);
    assert_eq!(h.nic.close(), Err(Rtl8169Error::NotOpen));

    // timers armed before closing retire without effect
    h.work.advance(PHY_TIMEOUT_MS);
    assert_eq!(h.work.pending(), 0);
    assert!(h.stack.take().is_empty());

    h.nic.open().unwrap();
    h.sim.set_auto_transmit(true);
    h.send(5, 64).unwrap();
    assert!(h.interrupt());
    assert_eq!(completed(&h.stack.take()), vec![5]);
    assert_eq!(h.nic.statistics().tx_dropped, 2);
}

#[test]
fn open_failures_release_everything() {
    let h = attach(test_config(), |sim| sim.set_refuse_irq(true));
    assert!(matches!(h.nic.open(), Err(Rtl8169Error::Irq(_))));
    assert_eq!(h.dma.live_mappings(), 0);
    assert_eq!(h.work.pending(), 0);

    h.sim.set_refuse_irq(false);
    // both rings map, then the receive buffers run out
    h.dma.fail_maps_after(2 + 4, 1000);
    assert_eq!(h.nic.open(), Err(Rtl8169Error::ResourceExhausted));
    assert_eq!(h.dma.live_mappings(), 0);

    h.dma.fail_maps_after(0, 0);
    h.nic.open().unwrap();
    assert!(h.sim.has_handler());
}

#[test]
fn change_mtu_validates_clamps_and_rebuilds() {
    let h = open(test_config());
    assert_eq!(h.nic.change_mtu(MIN_MTU - 1), Err(Rtl8169Error::InvalidMtu(MIN_MTU - 1)));
    assert_eq!(h.nic.change_mtu(9000), Ok(MAX_MTU));
    assert_eq!(h.nic.mtu(), MAX_MTU);
    assert_eq!(h.sim.reg16(REG_RX_MAX_SIZE) as usize, nic_buffers::rx_buffer_size(MAX_MTU));
    assert_eq!(h.nic.health(), DeviceHealth::Running);

    let big = unicast_frame(1, 4000);
    assert!(h.sim.receive(&big, 0));
    assert!(h.interrupt());
    assert_eq!(received(&h.stack.take()), vec![big]);
    assert_eq!(h.dma.bad_unmaps(), 0);
}

#[test]
fn missed_packets_are_folded_into_the_statistics() {
    let h = open(test_config());
    for tag in 0..32 {
        assert!(h.sim.receive(&unicast_frame(tag, 60), 0));
    }
    assert!(!h.sim.receive(&unicast_frame(32, 60), 0));
    let stats = h.nic.statistics();
    assert_eq!(stats.rx_missed, 1);
    assert_eq!(h.nic.statistics().rx_missed, 1);

    assert!(h.interrupt());
    assert_eq!(received(&h.stack.take()).len(), 32);
    assert_eq!(h.nic.statistics().rx_packets, 32);
}

#[test]
fn the_receive_filter_programs_the_multicast_hash() {
    let h = open(test_config());
    let group = [0x01, 0x00, 0x5e, 0x00, 0x00, 0x01];
    h.nic.set_rx_filter(RxFilter { multicast: vec![group], ..Default::default() });
    let bit = multicast_hash_bit(&group);
    let word = h.sim.reg32(REG_MAR0 + 4 * (bit >> 5));
    assert_eq!(word, 1 << (bit & 31));
    assert_eq!(h.sim.reg32(REG_MAR0 + 4 * (1 - (bit >> 5))), 0);
    assert_eq!(h.sim.reg32(REG_RX_CONFIG) & ACCEPT_MULTICAST, ACCEPT_MULTICAST);

    h.nic.set_rx_filter(RxFilter { promiscuous: true, ..Default::default() });
    assert_eq!(h.sim.reg32(REG_MAR0), 0xFFFF_FFFF);
    assert_eq!(h.sim.reg32(REG_MAR0 + 4), 0xFFFF_FFFF);
    assert_eq!(h.sim.reg32(REG_RX_CONFIG) & ACCEPT_ALL_PHYS, ACCEPT_ALL_PHYS);

    // the filter survives a rebuild
    h.nic.change_mtu(1500).unwrap();
    assert_eq!(h.sim.reg32(REG_RX_CONFIG) & ACCEPT_ALL_PHYS, ACCEPT_ALL_PHYS);
}

#[test]
fn ether_crc_matches_the_msb_first_crc32() {
    // no final inversion, so no data leaves the preset
    assert_eq!(ether_crc(&[]), 0xFFFF_FFFF);
    assert_ne!(ether_crc(&[0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]), ether_crc(&[0x01, 0x00, 0x5e, 0x00, 0x00, 0x02]));
    assert_eq!(multicast_hash_bit(&[0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]) as u32,
        ether_crc(&[0x01, 0x00, 0x5e, 0x00, 0x00, 0x01]) >> 26);
}

#[test]
fn link_params_normalize_empty_advertisements() {
    let params = LinkParams { advertising: Advertising::empty(), ..LinkParams::default() };
    assert_eq!(params.normalize(), LinkParams::default());
    assert!(LinkParams::default().advertises_1000_full());
    let forced = LinkParams::forced(Speed::Mbps10, Duplex::Half);
    assert_eq!(forced.normalize(), forced);
    assert!(!forced.advertises_1000_full());
}

#[test]
fn the_pci_shadow_detects_and_repairs_each_field() {
    let (_dma, _work, sim, _platform) = platform();
    let shadow = PciConfigShadow::capture(&*sim);
    assert_eq!(shadow.check_and_repair(&*sim), DriftReport { drift: DriftFlags::empty(), link_down: false });

    sim.corrupt_pci(PCI_BAR2 + 2, 0x12);
    sim.corrupt_pci(PCI_BAR5, 0x34);
    sim.corrupt_pci(PCI_COMMAND, 0x03);
    let report = shadow.check_and_repair(&*sim);
    assert_eq!(report.drift, DriftFlags::COMMAND | DriftFlags::BAR2_HIGH | DriftFlags::BAR5_LOW);
    assert!(!report.link_down);
    assert_eq!(PciConfigShadow::capture(&*sim), shadow);

    // the upper half of BAR0 is not checked
    sim.corrupt_pci(PCI_BAR0 + 2, 0x56);
    assert!(shadow.check_and_repair(&*sim).drift.is_empty());

    sim.set_pci_dead(true);
    assert_eq!(shadow.check_and_repair(&*sim), DriftReport { drift: DriftFlags::COMMAND, link_down: true });
}
