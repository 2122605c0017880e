//! The interrupt handler and the budgeted poll task.

use alloc::sync::Arc;
use core::sync::atomic::Ordering;
use crate::recovery::{RecoveryState, Task};
use crate::regs::{IntrStatus, INTR_STATUS_ABSENT};
use crate::state::{DeviceState, Events};
use crate::{DispatchMode, Rtl8169Nic};

impl Rtl8169Nic {
    /// The main interrupt handling routine.
    /// This should be invoked from the interrupt line's handler.
    ///
    /// Returns `true` if the interrupt was raised by this device.
    pub fn handle_interrupt(self: &Arc<Self>) -> bool {
        let mut events = Events::default();
        let handled = {
            let mut state = self.state.lock();
            self.interrupt_locked(&mut state, &mut events)
        };
        self.dispatch(events);
        handled
    }

    fn interrupt_locked(&self, state: &mut DeviceState, events: &mut Events) -> bool {
        let raw = self.hw.intr_status();
        // all-ones: the device is gone; zero: another device on a shared line
        if raw == INTR_STATUS_ABSENT || raw == 0 {
            return false;
        }
        let status = IntrStatus::from_bits_truncate(raw) & state.intr_mask;
        if !status.intersects(IntrStatus::DEFAULT_MASK) {
            return false;
        }

        let mut ack = status;
        if status.contains(IntrStatus::RX_FIFO_OVER) {
            ack |= IntrStatus::RX_OVERFLOW;
            state.rx_fifo_errors += 1;
        }
        self.hw.ack_intr(ack);
        if status.contains(IntrStatus::TX_ERR) {
            state.tx_errors += 1;
        }

        if status.contains(IntrStatus::SYS_ERR) {
            self.pci_error(state, events);
            return true;
        }
        if status.contains(IntrStatus::LINK_CHG) {
            debug!("r8169::handle_interrupt(): link status changed");
            self.check_link_status(state, events);
        }

        match self.config.dispatch {
            DispatchMode::Direct => {
                state.tx_complete(events);
                state.rx_complete(usize::MAX, events);
                self.hw.set_intr_mask(state.intr_mask);
            }
            DispatchMode::Coalesced => {
                if status.intersects(IntrStatus::NAPI_EVENT) {
                    state.intr_mask = IntrStatus::DEFAULT_MASK - IntrStatus::NAPI_EVENT;
                    self.hw.set_intr_mask(state.intr_mask);
                    if !self.poll_scheduled.swap(true, Ordering::SeqCst) {
                        events.schedule(Task::Poll, 0, state.generation);
                    }
                }
            }
        }
        true
    }

    /// Reclaims completed transmissions and receives up to `budget` frames.
    ///
    /// If the budget was not used up, the traffic interrupts are unmasked again;
    /// otherwise another poll is scheduled. Returns the number of receive descriptors processed.
    pub fn poll(self: &Arc<Self>, budget: usize) -> usize {
        let mut events = Events::default();
        let work = {
            let mut state = self.state.lock();
            if !state.opened || state.recovery != RecoveryState::Running {
                self.poll_scheduled.store(false, Ordering::SeqCst);
                return 0;
            }
            state.tx_complete(&mut events);
            let work = state.rx_complete(budget, &mut events);
            if work < budget {
                self.poll_scheduled.store(false, Ordering::SeqCst);
                state.intr_mask = IntrStatus::DEFAULT_MASK;
                self.hw.set_intr_mask(state.intr_mask);
            } else {
                self.poll_scheduled.store(true, Ordering::SeqCst);
                events.schedule(Task::Poll, 0, state.generation);
            }
            work
        };
        self.dispatch(events);
        work
    }
}
