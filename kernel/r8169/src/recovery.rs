//! Deferred work and the recovery state machine.
//!
//! Every timer and recovery step runs as a [`Task`] on the platform's work scheduler.
//! A task carries the generation of the device state it was scheduled under,
//! and retires without doing anything once `close()` has moved the generation on.
//!
//! Recovery moves through [`RecoveryState`]:
//! a configuration-drift check that finds damage marks the device `Suspect`,
//! any rebuild in progress is `Resetting`, and a device that could not be rebuilt
//! within the configured number of attempts is `Failed` for good.

use alloc::boxed::Box;
use alloc::sync::Arc;
use network_interface_card::{DeviceHealth, LinkState};
use nic_platform::pci::*;
use crate::regs::{IntrStatus, ADVERTISE_1000FULL, CPLUS_PCI_DAC, REG_CPLUS_CMD};
use crate::state::{DeviceState, Events};
use crate::{Rtl8169Error, Rtl8169Nic, PHY_RETRY_MS};


/// The health of a device as tracked by its recovery state machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum RecoveryState {
    /// Operating normally.
    Running,
    /// Configuration damage was detected; traffic is stopped until the device is rebuilt.
    Suspect,
    /// A rebuild is in progress or scheduled.
    Resetting,
    /// Recovery gave up. Only `close()` and `open()` leave this state.
    Failed,
}

impl From<RecoveryState> for DeviceHealth {
    fn from(state: RecoveryState) -> DeviceHealth {
        match state {
            RecoveryState::Running => DeviceHealth::Running,
            RecoveryState::Suspect => DeviceHealth::Suspect,
            RecoveryState::Resetting => DeviceHealth::Resetting,
            RecoveryState::Failed => DeviceHealth::Failed,
        }
    }
}

/// The kinds of deferred work a device schedules.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Task {
    /// The budgeted receive and reclaim pass.
    Poll,
    /// Resets the PHY while a gigabit link fails to come up.
    LinkMonitor,
    /// The periodic configuration-drift check.
    Watchdog,
    /// Rebuilds the device after a transmit timeout or a failed rebuild.
    Reset,
    /// Rebuilds the device after a fatal PCI error.
    Reinit,
}

impl Rtl8169Nic {
    /// Hands `task` to the work scheduler. Must be called without the device lock held.
    pub(crate) fn schedule(self: &Arc<Self>, task: Task, delay_ms: u64, generation: u64) {
        let nic = Arc::clone(self);
        self.platform.work.schedule(delay_ms, Box::new(move || nic.run_task(task, generation)));
    }

    fn run_task(self: Arc<Self>, task: Task, generation: u64) {
        if task == Task::Poll {
            if self.state.lock().generation == generation {
                self.poll(self.config.napi_weight);
            }
            return;
        }

        let mut events = Events::default();
        {
            let mut state = self.state.lock();
            if state.generation != generation {
                trace!("r8169::run_task(): retiring stale {:?} task", task);
                return;
            }
            match task {
                Task::LinkMonitor => self.link_monitor(&mut state, &mut events),
                Task::Watchdog => self.watchdog(&mut state, &mut events),
                Task::Reset => self.reset_task(&mut state, &mut events),
                Task::Reinit => self.reinit_task(&mut state, &mut events),
                Task::Poll => { }
            }
        }
        self.dispatch(events);
    }

    /// Keeps resetting the PHY until a link advertised at 1000 Mbps full duplex comes up.
    fn link_monitor(&self, state: &mut DeviceState, events: &mut Events) {
        state.link_timer_armed = false;
        if !state.opened || state.recovery != RecoveryState::Running {
            return;
        }
        if state.phy_1000_ctrl & ADVERTISE_1000FULL == 0 {
            return;
        }

        let delay = if self.ops.reset_pending(&self.hw) {
            PHY_RETRY_MS
        } else if self.ops.link_ok(&self.hw) {
            return;
        } else {
            warn!("r8169::link_monitor(): PHY reset until link up");
            self.ops.reset_enable(&self.hw);
            self.config.phy_timeout_ms
        };
        state.link_timer_armed = true;
        events.schedule(Task::LinkMonitor, delay, state.generation);
    }

    /// Compares the PCI configuration header against its shadow, rebuilding the device if anything drifted.
    fn watchdog(&self, state: &mut DeviceState, events: &mut Events) {
        if !state.opened || state.recovery == RecoveryState::Failed {
            return;
        }
        events.schedule(Task::Watchdog, self.config.esd_timeout_ms, state.generation);
        if state.recovery == RecoveryState::Resetting {
            return;
        }
        let shadow = match state.pci_shadow {
            Some(shadow) => shadow,
            None => return,
        };

        let report = shadow.check_and_repair(self.hw.pci());
        state.drift = report.drift;
        if report.link_down {
            self.suspect(state, events);
            return;
        }
        if report.drift.is_empty() && state.recovery == RecoveryState::Running {
            return;
        }

        error!("r8169::watchdog(): configuration drift {:?}, rebuilding the device", report.drift);
        self.suspect(state, events);
        state.set_recovery(RecoveryState::Resetting, events);
        if let Err(e) = self.rebuild(state, events) {
            error!("r8169::watchdog(): rebuild failed: {}", e);
            self.attempt_failed(state, events);
        }
    }

    /// Stops traffic and marks the device as suspect.
    fn suspect(&self, state: &mut DeviceState, events: &mut Events) {
        state.stop_queue(events);
        state.carrier = false;
        state.set_link(LinkState::DOWN, events);
        state.set_recovery(RecoveryState::Suspect, events);
    }

    /// Handles a transmission that the device has not completed in time:
    /// stops the hardware and schedules a rebuild.
    pub fn tx_timeout(self: &Arc<Self>) {
        let mut events = Events::default();
        {
            let mut state = self.state.lock();
            if !state.opened || state.recovery == RecoveryState::Failed {
                return;
            }
            warn!("r8169::tx_timeout(): transmit timed out, resetting");
            state.stop_queue(&mut events);
            if let Err(e) = self.hw.reset() {
                error!("r8169::tx_timeout(): {}", e);
            }
            state.intr_mask = IntrStatus::empty();
            state.set_recovery(RecoveryState::Resetting, &mut events);
            self.schedule_reset(&mut state, &mut events);
        }
        self.dispatch(events);
    }

    /// Repairs the PCI command and status registers after a system error, then schedules a rebuild.
    pub(crate) fn pci_error(&self, state: &mut DeviceState, events: &mut Events) {
        let pci = self.hw.pci();
        let command = pci.read16(PCI_COMMAND);
        let status = pci.read16(PCI_STATUS);
        error!("r8169::pci_error(): PCI error (cmd = {:#06x}, status = {:#06x})", command, status);

        pci.write16(PCI_COMMAND, command | PCI_COMMAND_SERR | PCI_COMMAND_PARITY);
        pci.write16(PCI_STATUS, status & PCI_STATUS_ERROR_BITS);
        if let Some(shadow) = state.pci_shadow.as_mut() {
            shadow.command = pci.read8(PCI_COMMAND);
        }

        // The chip may not cope with 64-bit addressing on this bus.
        let nothing_received = state.rx.as_ref().map_or(true, |rx| rx.cursors() == (0, 0));
        if state.cp_cmd & CPLUS_PCI_DAC != 0 && nothing_received {
            warn!("r8169::pci_error(): disabling PCI DAC");
            state.cp_cmd &= !CPLUS_PCI_DAC;
            self.hw.regs().write16(REG_CPLUS_CMD, state.cp_cmd);
        }

        state.stop_queue(events);
        if let Err(e) = self.hw.reset() {
            error!("r8169::pci_error(): {}", e);
        }
        state.intr_mask = IntrStatus::empty();
        state.set_recovery(RecoveryState::Resetting, events);
        events.schedule(Task::Reinit, self.config.reset_delay_ms, state.generation);
    }

    fn schedule_reset(&self, state: &mut DeviceState, events: &mut Events) {
        if !state.reset_task_pending {
            state.reset_task_pending = true;
            events.schedule(Task::Reset, self.config.reset_delay_ms, state.generation);
        }
    }

    /// Drains what the device already received, drops everything queued for transmission, and rebuilds.
    fn reset_task(&self, state: &mut DeviceState, events: &mut Events) {
        state.reset_task_pending = false;
        if !state.opened || state.recovery == RecoveryState::Failed {
            return;
        }
        self.quiesce(state);
        state.rx_complete(usize::MAX, events);
        state.tx_clear(events);

        if state.rx.as_ref().map_or(true, |rx| rx.is_balanced()) {
            if let Err(e) = self.rebuild(state, events) {
                error!("r8169::reset_task(): rebuild failed: {}", e);
                self.attempt_failed(state, events);
            }
        } else {
            error!("r8169::reset_task(): Rx buffers shortage");
            self.attempt_failed(state, events);
        }
    }

    fn reinit_task(&self, state: &mut DeviceState, events: &mut Events) {
        if !state.opened || state.recovery == RecoveryState::Failed {
            return;
        }
        self.quiesce(state);
        if let Err(e) = self.rebuild(state, events) {
            error!("r8169::reinit_task(): rebuild failed: {}", e);
            self.attempt_failed(state, events);
        }
    }

    fn quiesce(&self, state: &mut DeviceState) {
        self.hw.irq_mask_and_ack();
        state.intr_mask = IntrStatus::empty();
    }

    /// Resets the chip, empties both rings, and brings the device back up.
    /// On success the device is `Running` again with a fresh attempt count.
    fn rebuild(&self, state: &mut DeviceState, events: &mut Events) -> Result<(), Rtl8169Error> {
        self.quiesce(state);
        self.hw.reset()?;
        state.tx_clear(events);
        if let Some(rx) = state.rx.as_mut() {
            rx.clear();
        }
        self.bring_up(state, events)?;
        state.reset_attempts = 0;
        state.set_recovery(RecoveryState::Running, events);
        info!("r8169::rebuild(): device is running again");
        Ok(())
    }

    /// Counts a failed recovery attempt, scheduling another one or giving up on the device.
    pub(crate) fn attempt_failed(&self, state: &mut DeviceState, events: &mut Events) {
        state.reset_attempts += 1;
        if state.reset_attempts >= self.config.max_reset_attempts {
            error!("r8169::attempt_failed(): giving up after {} failed attempts", state.reset_attempts);
            self.quiesce(state);
            state.stop_queue(events);
            state.carrier = false;
            state.set_link(LinkState::DOWN, events);
            state.set_recovery(RecoveryState::Failed, events);
        } else {
            warn!("r8169::attempt_failed(): attempt {} of {} failed, retrying",
                state.reset_attempts, self.config.max_reset_attempts);
            state.set_recovery(RecoveryState::Resetting, events);
            self.schedule_reset(state, events);
        }
    }
}
