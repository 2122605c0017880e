//! The contracts between a NIC driver and the network stack above it.
//!
//! The stack drives a NIC through [`NetworkInterfaceCard`], 
//! and the NIC reports back through the [`NetworkStack`] callbacks.
//! Drivers invoke those callbacks from interrupt, poll or deferred-work context,
//! but never while holding their own device lock, 
//! so a callback may call back into the driver.

#![no_std]

#[macro_use] extern crate derive_more;
extern crate nic_buffers;

#[cfg(test)]
mod test;

use core::fmt;
use nic_buffers::{ReceivedFrame, TransmitFrame};


/// A trait that defines the necessary minimum functions that all network interface card (NIC) drivers
/// should implement. 
pub trait NetworkInterfaceCard: Send + Sync {
    /// Queues the given frame for transmission and returns without waiting for it to be sent.
    /// 
    /// On success, the frame's id is later reported exactly once,
    /// through [`NetworkStack::on_transmit_completed`] or [`NetworkStack::on_transmit_dropped`].
    /// On failure, the frame is handed back inside the error.
    fn send_frame(&self, frame: TransmitFrame) -> Result<(), SubmitError>;

    /// Returns the MAC address that this NIC is configured with.
    fn mac_address(&self) -> [u8; 6];

    /// Returns the last known state of the link.
    fn link_state(&self) -> LinkState;

    /// Returns the current health of the device.
    fn health(&self) -> DeviceHealth;

    /// Returns a snapshot of the device's counters.
    fn statistics(&self) -> NicStatistics;
}

/// The callbacks through which a NIC reports to the network stack.
pub trait NetworkStack: Send + Sync {
    /// A frame was received. Each frame is delivered exactly once.
    fn on_frame_received(&self, frame: ReceivedFrame);

    /// The link went up or down.
    fn on_link_state_changed(&self, _state: LinkState) { }

    /// The frame with the given id was sent and its buffers released.
    fn on_transmit_completed(&self, _id: u64) { }

    /// The frame with the given id was discarded without being sent, e.g., by a device reset.
    fn on_transmit_dropped(&self, _id: u64) { }

    /// The transmit queue was stopped (`true`) for lack of free descriptors, or woken (`false`).
    fn on_transmit_queue(&self, _stopped: bool) { }

    /// The device's health changed.
    fn on_health_changed(&self, _health: DeviceHealth) { }
}


#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Speed {
    #[display(fmt = "10Mbps")]
    Mbps10,
    #[display(fmt = "100Mbps")]
    Mbps100,
    #[display(fmt = "1000Mbps")]
    Mbps1000,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum Duplex {
    #[display(fmt = "half-duplex")]
    Half,
    #[display(fmt = "full-duplex")]
    Full,
}

/// The state of a NIC's link, as reported to the stack.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkState {
    pub up: bool,
    /// Only known while the link is up.
    pub speed: Option<Speed>,
    /// Only known while the link is up.
    pub duplex: Option<Duplex>,
}

impl LinkState {
    pub const DOWN: LinkState = LinkState { up: false, speed: None, duplex: None };

    pub const fn up(speed: Speed, duplex: Duplex) -> LinkState {
        LinkState { up: true, speed: Some(speed), duplex: Some(duplex) }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match (self.up, self.speed, self.duplex) {
            (true, Some(s), Some(d)) => write!(f, "up, {} {}", s, d),
            (true, _, _) => write!(f, "up"),
            (false, _, _) => write!(f, "down"),
        }
    }
}

/// The device's position in its error-recovery life cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum DeviceHealth {
    /// Normal operation.
    Running,
    /// A fault was observed and is being examined.
    Suspect,
    /// The device is being rebuilt; traffic is suspended.
    Resetting,
    /// Recovery gave up; the device stays down until it is reopened.
    Failed,
}

/// Reasons why a frame could not be queued for transmission.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum TransmitError {
    /// The next transmit descriptor is still owned by the device.
    #[display(fmt = "transmit descriptor still owned by the device")]
    Busy,
    /// Not enough free transmit descriptors for the frame.
    #[display(fmt = "not enough free transmit descriptors")]
    ResourceExhausted,
    /// A frame buffer could not be mapped for the device; the frame was dropped.
    #[display(fmt = "transmit buffer DMA mapping failed")]
    DmaMappingFailed,
    /// The link is down or the transmit queue is stopped.
    #[display(fmt = "link is down")]
    LinkDown,
    /// The device has not been opened.
    #[display(fmt = "device is not open")]
    NotOpen,
    /// The device failed and could not be recovered.
    #[display(fmt = "device failed")]
    DeviceFailed,
}

/// A failed transmit request, handing the frame back to the caller.
#[derive(Debug)]
pub struct SubmitError {
    pub error: TransmitError,
    pub frame: TransmitFrame,
}

impl SubmitError {
    pub fn new(error: TransmitError, frame: TransmitFrame) -> SubmitError {
        SubmitError { error, frame }
    }
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "frame {}: {}", self.frame.id, self.error)
    }
}

/// A NIC's cumulative counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct NicStatistics {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub tx_errors: u64,
    pub tx_dropped: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub rx_errors: u64,
    pub rx_dropped: u64,
    pub rx_crc_errors: u64,
    pub rx_length_errors: u64,
    pub rx_fifo_errors: u64,
    /// Frames the device dropped for lack of receive descriptors.
    pub rx_missed: u64,
    /// Times the receive ring was left without any armed buffer.
    pub rx_exhausted: u64,
    pub multicast: u64,
}
