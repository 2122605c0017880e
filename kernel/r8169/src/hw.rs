//! Register-level sequences: MDIO access, soft reset, hardware start, MAC address and receive filter.
//!
//! Nothing here touches the rings or the driver's software state;
//! callers hold the device lock and pass in whatever the sequence needs.

use alloc::sync::Arc;
use alloc::vec::Vec;
use bit_field::BitField;
use nic_platform::{DeviceAddress, MonotonicClock, NicPlatform, PciConfigSpace, RegisterIo};
use nic_platform::pci::{PCI_CACHE_LINE_SIZE, PCI_LATENCY_TIMER};
use crate::chip::MacVersion;
use crate::regs::*;
use crate::Rtl8169Error;

/// Polls of `PHYAR` before an MDIO access is given up.
const MDIO_WAIT_COUNT:          usize = 20;
const MDIO_WAIT_TIME_US:        u64 = 25;
const MDIO_EXIT_DELAY_US:       u64 = 20;
/// Polls of `ChipCmd` while waiting for a soft reset to finish.
const RESET_POLL_COUNT:         usize = 1000;
const RESET_POLL_INTERVAL_US:   u64 = 100;

/// Which frames the receive filter passes, besides unicast frames to our own address and broadcasts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RxFilter {
    /// Accept every frame.
    pub promiscuous: bool,
    /// Accept every multicast frame.
    pub all_multicast: bool,
    /// Multicast groups to accept, hashed into the 64-bit filter.
    pub multicast: Vec<[u8; 6]>,
}

/// Everything [`Hw::start`] programs into the device.
#[derive(Clone, Copy, Debug)]
pub struct StartParams<'a> {
    pub tx_ring: DeviceAddress,
    pub rx_ring: DeviceAddress,
    /// The current C+ command value; the offload bits are recomputed from `rx_checksum` and `rx_vlan`.
    pub cp_cmd: u16,
    pub rx_checksum: bool,
    pub rx_vlan: bool,
    pub rx_buf_size: usize,
    pub filter: &'a RxFilter,
    pub rx_all: bool,
    pub version: MacVersion,
    /// The interrupt mask to enable at the end of the sequence.
    pub intr_mask: IntrStatus,
}

/// Register access to one RTL8169, plus the PCI config space and clock that its sequences need.
#[derive(Clone)]
pub struct Hw {
    regs: Arc<dyn RegisterIo>,
    pci: Arc<dyn PciConfigSpace>,
    clock: Arc<dyn MonotonicClock>,
}

impl Hw {
    pub fn new(platform: &NicPlatform) -> Hw {
        Hw {
            regs: platform.registers.clone(),
            pci: platform.pci.clone(),
            clock: platform.clock.clone(),
        }
    }

    pub fn regs(&self) -> &dyn RegisterIo {
        &*self.regs
    }

    pub fn pci(&self) -> &dyn PciConfigSpace {
        &*self.pci
    }

    pub fn delay_us(&self, micros: u64) {
        self.clock.delay_us(micros)
    }

    /// Writes a PHY register through `PHYAR`, waiting for the device to take the value.
    pub fn mdio_write(&self, reg: u32, value: u16) {
        self.regs.write32(REG_PHYAR,
            PHYAR_FLAG | (reg & PHYAR_REG_MASK) << PHYAR_REG_SHIFT | (value as u32 & PHYAR_DATA_MASK));
        for _ in 0..MDIO_WAIT_COUNT {
            if self.regs.read32(REG_PHYAR) & PHYAR_FLAG == 0 {
                break;
            }
            self.clock.delay_us(MDIO_WAIT_TIME_US);
        }
        self.clock.delay_us(MDIO_EXIT_DELAY_US);
    }

    /// Reads a PHY register through `PHYAR`.
    /// Returns all-ones if the device never signals that the data is ready.
    pub fn mdio_read(&self, reg: u32) -> u16 {
        let mut value = 0xFFFF;
        self.regs.write32(REG_PHYAR, (reg & PHYAR_REG_MASK) << PHYAR_REG_SHIFT);
        for _ in 0..MDIO_WAIT_COUNT {
            if self.regs.read32(REG_PHYAR) & PHYAR_FLAG != 0 {
                self.clock.delay_us(1);
                value = (self.regs.read32(REG_PHYAR) & PHYAR_DATA_MASK) as u16;
                break;
            }
            self.clock.delay_us(MDIO_WAIT_TIME_US);
        }
        self.clock.delay_us(MDIO_EXIT_DELAY_US);
        value
    }

    pub fn mac_version(&self) -> Result<MacVersion, Rtl8169Error> {
        MacVersion::from_tx_config(self.regs.read32(REG_TX_CONFIG))
    }

    pub fn intr_status(&self) -> u16 {
        self.regs.read16(REG_INTR_STATUS)
    }

    pub fn ack_intr(&self, status: IntrStatus) {
        self.regs.write16(REG_INTR_STATUS, status.bits());
    }

    pub fn set_intr_mask(&self, mask: IntrStatus) {
        self.regs.write16(REG_INTR_MASK, mask.bits());
    }

    /// Masks every interrupt source and acknowledges anything pending.
    pub fn irq_mask_and_ack(&self) {
        self.regs.write16(REG_INTR_MASK, 0);
        self.regs.write16(REG_INTR_STATUS, 0xFFFF);
    }

    /// Rings the transmit doorbell.
    pub fn tx_poll(&self) {
        self.regs.write8(REG_TX_POLL, TX_POLL_NPQ);
    }

    /// Clears the receive filter bits, so nothing is accepted until the device is started.
    pub fn init(&self) {
        let rx_config = self.regs.read32(REG_RX_CONFIG);
        self.regs.write32(REG_RX_CONFIG, rx_config & !RX_CONFIG_ACCEPT_MASK);
    }

    /// Issues a soft reset and waits for the device to complete it.
    fn nic_reset(&self) -> Result<(), Rtl8169Error> {
        self.regs.write32(REG_RX_CONFIG, RX_DMA_BURST << RX_CFG_DMA_SHIFT);
        self.clock.delay_us(1000);
        self.regs.write8(REG_CHIP_CMD, CMD_RESET);
        for _ in 0..RESET_POLL_COUNT {
            if self.regs.read8(REG_CHIP_CMD) & CMD_RESET == 0 {
                return Ok(());
            }
            self.clock.delay_us(RESET_POLL_INTERVAL_US);
        }
        error!("r8169::nic_reset(): chip did not complete its reset");
        Err(Rtl8169Error::ResetTimeout)
    }

    /// Masks interrupts and soft-resets the chip, which stops all DMA and rewinds the device's ring positions.
    pub fn reset(&self) -> Result<(), Rtl8169Error> {
        self.irq_mask_and_ack();
        self.regs.write32(REG_TIME_INT0, 0);
        self.nic_reset()
    }

    /// Resets the chip, then programs the rings, offloads, filter and interrupt mask, and enables transmit and receive.
    /// Returns the C+ command value now in effect.
    pub fn start(&self, params: &StartParams) -> Result<u16, Rtl8169Error> {
        self.regs.write32(REG_RX_CONFIG, RX_DMA_BURST << RX_CFG_DMA_SHIFT);
        self.reset()?;

        self.pci.write8(PCI_LATENCY_TIMER, 0x40);
        self.regs.write8(REG_CFG9346, CFG9346_UNLOCK);

        let mut cp_cmd = params.cp_cmd | CPLUS_PCI_MUL_RW;
        self.regs.write16(REG_CPLUS_CMD, cp_cmd);
        self.pci.write8(PCI_CACHE_LINE_SIZE, 0x08);
        self.regs.write16(REG_INTR_MITIGATE, 0);

        let (tx, rx) = (params.tx_ring, params.rx_ring);
        self.regs.write32(REG_TX_DESC_START_ADDR_LOW, tx.low_u32());
        self.regs.write32(REG_RX_DESC_ADDR_LOW, rx.low_u32());
        self.regs.write32(REG_TX_DESC_START_ADDR_HIGH, tx.high_u32());
        self.regs.write32(REG_RX_DESC_ADDR_HIGH, rx.high_u32());

        self.regs.write32(REG_RX_MISSED, 0);
        // no early receive interrupts
        let multi_intr = self.regs.read16(REG_MULTI_INTR);
        self.regs.write16(REG_MULTI_INTR, multi_intr & 0xF000);

        cp_cmd.set_bit(5, params.rx_checksum);
        cp_cmd.set_bit(6, params.rx_vlan);
        self.regs.write16(REG_CPLUS_CMD, cp_cmd);
        self.regs.read16(REG_CPLUS_CMD);

        self.regs.write8(REG_CHIP_CMD, CMD_TX_ENB | CMD_RX_ENB);
        self.regs.write16(REG_RX_MAX_SIZE, params.rx_buf_size as u16);
        self.set_rx_mode(params.filter, params.rx_all);
        self.set_tx_config(params.version);
        self.regs.write8(REG_CFG9346, CFG9346_LOCK);

        self.regs.write32(REG_TIME_INT0, 0);
        self.regs.write16(REG_INTR_STATUS, 0xFFFF);
        self.set_intr_mask(params.intr_mask);
        self.clock.delay_us(10);

        debug!("r8169::start(): started, C+ command {:#06X}", cp_cmd);
        Ok(cp_cmd)
    }

    /// Sets the inter-frame gap, shortening it at half duplex on the chips that need it.
    pub fn set_tx_config(&self, version: MacVersion) {
        let mut tx_config = self.regs.read32(REG_TX_CONFIG) | TX_IFG0 | TX_IFG1;
        let full_duplex = self.regs.read8(REG_PHY_STATUS) & PHY_STATUS_FULL_DUP != 0;
        if version.has_short_half_duplex_ifg() && !full_duplex {
            tx_config &= !TX_IFG0;
        }
        self.regs.write32(REG_TX_CONFIG, tx_config);
    }

    /// Sets or clears the transmit DMA burst field, which the link evaluation adjusts.
    pub fn set_tx_dma_burst(&self, enabled: bool) {
        let tx_config = self.regs.read32(REG_TX_CONFIG);
        let burst = TX_DMA_BURST << TX_DMA_SHIFT;
        let value = if enabled { tx_config | burst } else { tx_config & !burst };
        self.regs.write32(REG_TX_CONFIG, value);
    }

    /// Programs the accept bits of `RxConfig` and the multicast hash filter.
    pub fn set_rx_mode(&self, filter: &RxFilter, rx_all: bool) {
        let mut mode;
        let mut mc_filter = [0u32; 2];
        if filter.promiscuous {
            mode = ACCEPT_BROADCAST | ACCEPT_MULTICAST | ACCEPT_MY_PHYS | ACCEPT_ALL_PHYS;
            mc_filter = [0xFFFF_FFFF; 2];
        } else if filter.all_multicast {
            mode = ACCEPT_BROADCAST | ACCEPT_MULTICAST | ACCEPT_MY_PHYS;
            mc_filter = [0xFFFF_FFFF; 2];
        } else {
            mode = ACCEPT_BROADCAST | ACCEPT_MY_PHYS;
            for addr in &filter.multicast {
                let bit = multicast_hash_bit(addr);
                mc_filter[bit >> 5] |= 1 << (bit & 31);
                mode |= ACCEPT_MULTICAST;
            }
        }
        if rx_all {
            mode |= ACCEPT_ERR | ACCEPT_RUNT;
        }

        let old = self.regs.read32(REG_RX_CONFIG);
        let rx_config = (RX_DMA_BURST << RX_CFG_DMA_SHIFT) | mode | (old & RX_CONFIG_CHIP_MASK);
        self.regs.write32(REG_RX_CONFIG, rx_config);
        self.regs.write32(REG_MAR0, mc_filter[0]);
        self.regs.write32(REG_MAR0 + 4, mc_filter[1]);
    }

    /// Reads the MAC address currently held by the chip.
    pub fn read_mac_address(&self) -> [u8; 6] {
        let mut mac = [0u8; 6];
        for (i, byte) in mac.iter_mut().enumerate() {
            *byte = self.regs.read8(REG_MAC0 + i);
        }
        mac
    }

    /// Programs the receive address.
    pub fn rar_set(&self, mac: [u8; 6]) {
        let low = u32::from_le_bytes([mac[0], mac[1], mac[2], mac[3]]);
        let high = u32::from_le_bytes([mac[4], mac[5], 0, 0]);
        self.regs.write8(REG_CFG9346, CFG9346_UNLOCK);
        self.regs.write32(REG_MAC0, low);
        self.regs.write32(REG_MAC4, high);
        self.regs.write8(REG_CFG9346, CFG9346_LOCK);
    }

    /// Returns the hardware missed-packet count, then zeroes the counter.
    pub fn take_missed(&self) -> u32 {
        let missed = self.regs.read32(REG_RX_MISSED) & 0x00FF_FFFF;
        self.regs.write32(REG_RX_MISSED, 0);
        missed
    }

    /// Caps the receive size before the PHY is powered down.
    pub fn set_rx_max_size(&self, size: usize) {
        self.regs.write16(REG_RX_MAX_SIZE, size as u16);
    }
}

/// Returns `true` if `mac` can be used as a station address:
/// neither all-zero nor a group address.
pub fn is_valid_ether_addr(mac: &[u8; 6]) -> bool {
    mac.iter().any(|&b| b != 0) && !mac[0].get_bit(0)
}

/// The Ethernet CRC-32 of `data`, computed most-significant bit first as the multicast filter hash expects.
pub fn ether_crc(data: &[u8]) -> u32 {
    const ETHERNET_POLYNOMIAL: u32 = 0x04C1_1DB7;
    let mut crc: u32 = 0xFFFF_FFFF;
    for &byte in data {
        let mut octet = byte;
        for _ in 0..8 {
            let carry = (crc >> 31) ^ (octet as u32 & 1);
            crc <<= 1;
            if carry != 0 {
                crc ^= ETHERNET_POLYNOMIAL;
            }
            octet >>= 1;
        }
    }
    crc
}

/// The bit of the 64-bit multicast filter that `addr` hashes to.
pub fn multicast_hash_bit(addr: &[u8; 6]) -> usize {
    (ether_crc(addr) >> 26) as usize
}
