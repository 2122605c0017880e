//! Register offsets and bit definitions of the RTL8169 family.
//!
//! Offsets are byte offsets into the device's register window, accessed through
//! [`RegisterIo`](nic_platform::RegisterIo) with the width noted next to each one.

/// MAC address bytes 0..4 (32-bit)
pub const REG_MAC0:                     usize = 0x00;
/// MAC address bytes 4..6 (32-bit)
pub const REG_MAC4:                     usize = 0x04;
/// Multicast filter, two 32-bit words
pub const REG_MAR0:                     usize = 0x08;
pub const REG_TX_DESC_START_ADDR_LOW:   usize = 0x20;
pub const REG_TX_DESC_START_ADDR_HIGH:  usize = 0x24;
/// Command register (8-bit)
pub const REG_CHIP_CMD:                 usize = 0x37;
/// Transmit doorbell (8-bit)
pub const REG_TX_POLL:                  usize = 0x38;
/// Interrupt mask (16-bit)
pub const REG_INTR_MASK:                usize = 0x3C;
/// Interrupt status, write one to clear (16-bit)
pub const REG_INTR_STATUS:              usize = 0x3E;
pub const REG_TX_CONFIG:                usize = 0x40;
pub const REG_RX_CONFIG:                usize = 0x44;
/// Missed packet counter, 24 bits (32-bit)
pub const REG_RX_MISSED:                usize = 0x4C;
/// Configuration register write lock (8-bit)
pub const REG_CFG9346:                  usize = 0x50;
pub const REG_CONFIG2:                  usize = 0x53;
/// Timer interrupt (32-bit)
pub const REG_TIME_INT0:                usize = 0x58;
/// Early receive interrupt control (16-bit)
pub const REG_MULTI_INTR:               usize = 0x5C;
/// PHY access register, for MDIO reads and writes (32-bit)
pub const REG_PHYAR:                    usize = 0x60;
/// TBI control and status (32-bit)
pub const REG_TBICSR:                   usize = 0x64;
/// PHY status (8-bit)
pub const REG_PHY_STATUS:               usize = 0x6C;
/// Largest receivable frame (16-bit)
pub const REG_RX_MAX_SIZE:              usize = 0xDA;
/// C+ command register (16-bit)
pub const REG_CPLUS_CMD:                usize = 0xE0;
/// Interrupt mitigation (16-bit)
pub const REG_INTR_MITIGATE:            usize = 0xE2;
pub const REG_RX_DESC_ADDR_LOW:         usize = 0xE4;
pub const REG_RX_DESC_ADDR_HIGH:        usize = 0xE8;

// ChipCmd bits
pub const CMD_RESET:                    u8 = 0x10;
pub const CMD_RX_ENB:                   u8 = 0x08;
pub const CMD_TX_ENB:                   u8 = 0x04;

/// TxPoll: normal-priority queue has frames
pub const TX_POLL_NPQ:                  u8 = 0x40;

// Cfg9346 values
pub const CFG9346_LOCK:                 u8 = 0x00;
pub const CFG9346_UNLOCK:               u8 = 0xC0;

/// Config2: the PCI bus runs at 66MHz
pub const CONFIG2_PCI_CLOCK_66MHZ:      u8 = 0x01;

// RxConfig bits
pub const ACCEPT_ERR:                   u32 = 0x20;
pub const ACCEPT_RUNT:                  u32 = 0x10;
pub const ACCEPT_BROADCAST:             u32 = 0x08;
pub const ACCEPT_MULTICAST:             u32 = 0x04;
pub const ACCEPT_MY_PHYS:               u32 = 0x02;
pub const ACCEPT_ALL_PHYS:              u32 = 0x01;
pub const RX_CONFIG_ACCEPT_MASK:        u32 = 0x3F;
pub const RX_CFG_DMA_SHIFT:             u32 = 8;
/// The bits of RxConfig that are chip-specific and preserved across filter updates
pub const RX_CONFIG_CHIP_MASK:          u32 = 0xFF7E_1880;
/// Unlimited DMA burst
pub const RX_DMA_BURST:                 u32 = 7;

// TxConfig bits
pub const TX_DMA_SHIFT:                 u32 = 8;
pub const TX_DMA_BURST:                 u32 = 7;
pub const TX_IFG0:                      u32 = 1 << 24;
pub const TX_IFG1:                      u32 = 1 << 25;
/// The bits of TxConfig that identify the MAC version
pub const TX_CONFIG_VERSION_MASK:       u32 = 0xFC80_0000;

// PHYstatus bits
pub const PHY_STATUS_TBI_ENABLE:        u8 = 0x80;
pub const PHY_STATUS_1000BPS_F:         u8 = 0x10;
pub const PHY_STATUS_100BPS:            u8 = 0x08;
pub const PHY_STATUS_10BPS:             u8 = 0x04;
pub const PHY_STATUS_LINK:              u8 = 0x02;
pub const PHY_STATUS_FULL_DUP:          u8 = 0x01;

// CPlusCmd bits
pub const CPLUS_RX_VLAN:                u16 = 0x40;
pub const CPLUS_RX_CHKSUM:              u16 = 0x20;
pub const CPLUS_PCI_DAC:                u16 = 0x10;
pub const CPLUS_PCI_MUL_RW:             u16 = 0x08;

// PHYAR fields
/// Set by the host to request a write, set by the device when read data is ready
pub const PHYAR_FLAG:                   u32 = 0x8000_0000;
pub const PHYAR_REG_SHIFT:              u32 = 16;
pub const PHYAR_REG_MASK:               u32 = 0x1F;
pub const PHYAR_DATA_MASK:              u32 = 0xFFFF;

// TBICSR bits
pub const TBI_RESET:                    u32 = 0x8000_0000;
pub const TBI_LINK_OK:                  u32 = 0x0200_0000;
pub const TBI_NW_ENABLE:                u32 = 0x0100_0000;
pub const TBI_NW_RESTART:               u32 = 0x0080_0000;

// MII registers reached through PHYAR
pub const MII_BMCR:                     u32 = 0x00;
pub const MII_BMSR:                     u32 = 0x01;
pub const MII_ADVERTISE:                u32 = 0x04;
pub const MII_CTRL1000:                 u32 = 0x09;
/// Page select
pub const MII_PAGE_SELECT:              u32 = 0x1F;

// BMCR bits
pub const BMCR_RESET:                   u16 = 0x8000;
pub const BMCR_SPEED100:                u16 = 0x2000;
pub const BMCR_ANENABLE:                u16 = 0x1000;
pub const BMCR_PDOWN:                   u16 = 0x0800;
pub const BMCR_ANRESTART:               u16 = 0x0200;
pub const BMCR_FULLDPLX:                u16 = 0x0100;
pub const BMCR_SPEED10:                 u16 = 0x0000;

/// BMSR: link is up
pub const BMSR_LSTATUS:                 u16 = 0x0004;

// ADVERTISE bits
pub const ADVERTISE_10HALF:             u16 = 0x0020;
pub const ADVERTISE_10FULL:             u16 = 0x0040;
pub const ADVERTISE_100HALF:            u16 = 0x0080;
pub const ADVERTISE_100FULL:            u16 = 0x0100;
pub const ADVERTISE_PAUSE_CAP:          u16 = 0x0400;
pub const ADVERTISE_PAUSE_ASYM:         u16 = 0x0800;

// CTRL1000 bits
pub const ADVERTISE_1000HALF:           u16 = 0x0100;
pub const ADVERTISE_1000FULL:           u16 = 0x0200;

bitflags! {
    /// The bits of the interrupt status and mask registers.
    pub struct IntrStatus: u16 {
        const SYS_ERR           = 0x8000;
        const PCS_TIMEOUT       = 0x4000;
        const SW_INT            = 0x0100;
        const TX_DESC_UNAVAIL   = 0x0080;
        const RX_FIFO_OVER      = 0x0040;
        const LINK_CHG          = 0x0020;
        const RX_OVERFLOW       = 0x0010;
        const TX_ERR            = 0x0008;
        const TX_OK             = 0x0004;
        const RX_ERR            = 0x0002;
        const RX_OK             = 0x0001;

        /// Every source the driver handles
        const DEFAULT_MASK = Self::SYS_ERR.bits
            | Self::LINK_CHG.bits
            | Self::RX_OVERFLOW.bits
            | Self::RX_FIFO_OVER.bits
            | Self::TX_ERR.bits
            | Self::TX_OK.bits
            | Self::RX_ERR.bits
            | Self::RX_OK.bits;

        /// The sources that are deferred to the poll task in coalesced mode
        const NAPI_EVENT = Self::RX_OK.bits
            | Self::RX_OVERFLOW.bits
            | Self::RX_FIFO_OVER.bits
            | Self::TX_OK.bits
            | Self::TX_ERR.bits;
    }
}

/// The interrupt status value read from a device that is no longer on the bus.
pub const INTR_STATUS_ABSENT:           u16 = 0xFFFF;
