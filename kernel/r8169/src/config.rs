//! Driver tunables, with defaults matching the conventional module parameters of this NIC family.

use nic_buffers::ETH_DATA_LEN;
use nic_descriptors::RingError;
use nic_queues::RxOptions;
use crate::link::LinkParams;
use crate::Rtl8169Error;

/// Default number of transmit descriptors.
pub const NUM_TX_DESC:                  usize = 64;
/// Default number of receive descriptors.
pub const NUM_RX_DESC:                  usize = 256;
/// Default budget of one poll task run.
pub const NAPI_WEIGHT:                  usize = 64;
/// Period of the link monitor, in milliseconds.
pub const PHY_TIMEOUT_MS:               u64 = 10_000;
/// Retry period of the link monitor while a PHY reset is pending.
pub const PHY_RETRY_MS:                 u64 = 100;
/// Period of the configuration-drift watchdog, in milliseconds.
pub const ESD_TIMEOUT_MS:               u64 = 2_000;
/// Delay before a scheduled reset task runs, letting in-flight interrupts land.
pub const RESET_DELAY_MS:               u64 = 40;
/// Consecutive failed rebuilds before the device is declared failed.
pub const MAX_RESET_ATTEMPTS:           u32 = 5;

/// The smallest MTU accepted by [`change_mtu`](crate::Rtl8169Nic::change_mtu).
pub const MIN_MTU:                      usize = 68;
/// The largest MTU: a 7 KiB jumbo frame less the Ethernet header and a VLAN tag's worth.
pub const MAX_MTU:                      usize = 7 * 1024 - 14 - 2;

/// The most descriptors a single transmit frame may use.
pub const MAX_SKB_FRAGS:                usize = 17;

/// How interrupt work is dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchMode {
    /// All transmit and receive work is done inside the interrupt handler.
    Direct,
    /// The handler masks traffic interrupts and defers the work to a budgeted poll task.
    Coalesced,
}

/// The configuration of one RTL8169 instance.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Rtl8169Config {
    pub num_tx_desc: usize,
    pub num_rx_desc: usize,
    pub mtu: usize,
    /// Frames shorter than this are copied out of the receive ring. Zero disables copying.
    pub rx_copybreak: usize,
    /// Deliver erroneous and runt frames too.
    pub rx_all: bool,
    /// Leave the frame check sequence on received frames.
    pub keep_fcs: bool,
    /// Let the device validate receive checksums.
    pub rx_checksum: bool,
    /// Let the device strip VLAN tags.
    pub rx_vlan: bool,
    /// Pad short transmit frames to the Ethernet minimum in software.
    pub pad_short_frames: bool,
    pub dispatch: DispatchMode,
    pub napi_weight: usize,
    pub phy_timeout_ms: u64,
    pub esd_timeout_ms: u64,
    pub reset_delay_ms: u64,
    pub max_reset_attempts: u32,
    /// The transmit queue stops when this many descriptors or fewer are free.
    pub tx_stop_threshold: usize,
    pub link: LinkParams,
}

impl Default for Rtl8169Config {
    fn default() -> Self {
        Rtl8169Config {
            num_tx_desc: NUM_TX_DESC,
            num_rx_desc: NUM_RX_DESC,
            mtu: ETH_DATA_LEN,
            rx_copybreak: 0,
            rx_all: false,
            keep_fcs: false,
            rx_checksum: true,
            rx_vlan: true,
            pad_short_frames: true,
            dispatch: DispatchMode::Coalesced,
            napi_weight: NAPI_WEIGHT,
            phy_timeout_ms: PHY_TIMEOUT_MS,
            esd_timeout_ms: ESD_TIMEOUT_MS,
            reset_delay_ms: RESET_DELAY_MS,
            max_reset_attempts: MAX_RESET_ATTEMPTS,
            tx_stop_threshold: MAX_SKB_FRAGS,
            link: LinkParams::default(),
        }
    }
}

impl Rtl8169Config {
    /// Checks the ring sizes, the MTU, and the tunables that depend on them.
    pub fn validate(&self) -> Result<(), Rtl8169Error> {
        for &capacity in &[self.num_tx_desc, self.num_rx_desc] {
            if capacity < 2 || !capacity.is_power_of_two() {
                return Err(Rtl8169Error::Ring(RingError::InvalidCapacity(capacity)));
            }
        }
        if self.mtu < MIN_MTU {
            return Err(Rtl8169Error::InvalidMtu(self.mtu));
        }
        // at most `num_tx_desc - 1` slots are ever free
        if self.tx_stop_threshold + 1 >= self.num_tx_desc {
            return Err(Rtl8169Error::InvalidConfig("tx_stop_threshold leaves no room to wake the transmit queue"));
        }
        if self.napi_weight == 0 {
            return Err(Rtl8169Error::InvalidConfig("napi_weight must be at least 1"));
        }
        Ok(())
    }

    pub(crate) fn rx_options(&self) -> RxOptions {
        RxOptions {
            copybreak: self.rx_copybreak,
            rx_all: self.rx_all,
            keep_fcs: self.keep_fcs,
            hw_checksum: self.rx_checksum,
        }
    }
}
