//! Chip identification and the per-family PHY operations.
//!
//! Copper variants reach their PHY over MDIO through the `PHYAR` register ([`XmiiChip`]);
//! fiber variants expose a ten-bit interface through `TBICSR` instead ([`TbiChip`]).
//! Which one applies is decided once, at identification.

use network_interface_card::{Duplex, LinkState, Speed};
use crate::hw::Hw;
use crate::link::{Advertising, LinkParams};
use crate::regs::*;
use crate::Rtl8169Error;


/// The MAC revisions of the RTL8169 family, as encoded in the upper bits of `TxConfig`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Display)]
pub enum MacVersion {
    #[display(fmt = "RTL8169")]
    V1,
    #[display(fmt = "RTL8169S/8110S")]
    V2,
    #[display(fmt = "RTL8169S/8110S")]
    V3,
    #[display(fmt = "RTL8169SB/8110SB")]
    V4,
    #[display(fmt = "RTL8169SC/8110SC")]
    V5,
    #[display(fmt = "RTL8169SC/8110SC")]
    V6,
}

impl MacVersion {
    /// Decodes the MAC revision from a `TxConfig` register value.
    pub fn from_tx_config(tx_config: u32) -> Result<MacVersion, Rtl8169Error> {
        match tx_config & TX_CONFIG_VERSION_MASK {
            0x0000_0000 => Ok(MacVersion::V1),
            0x0080_0000 => Ok(MacVersion::V2),
            0x0400_0000 => Ok(MacVersion::V3),
            0x1000_0000 => Ok(MacVersion::V4),
            0x1800_0000 => Ok(MacVersion::V5),
            0x9800_0000 => Ok(MacVersion::V6),
            other => Err(Rtl8169Error::UnknownChip(other)),
        }
    }

    /// The first revision lacks the PHY reset logic that the link monitor relies on.
    pub fn has_link_monitor(&self) -> bool {
        *self > MacVersion::V1
    }

    /// Later revisions need a shorter inter-frame gap at half duplex.
    pub fn has_short_half_duplex_ifg(&self) -> bool {
        matches!(self, MacVersion::V5 | MacVersion::V6)
    }
}


/// The PHY-facing operations that differ between chip families.
///
/// Every operation is invoked with the device lock held.
pub trait ChipOps: Send + Sync {
    fn name(&self) -> &'static str;

    /// Returns `true` if the physical link is up.
    fn link_ok(&self, hw: &Hw) -> bool;

    /// Reads the negotiated speed and duplex.
    fn link_state(&self, hw: &Hw) -> LinkState;

    /// Returns `true` while a PHY reset started by [`ChipOps::reset_enable`] is still in progress.
    fn reset_pending(&self, hw: &Hw) -> bool;

    /// Resets the PHY, which restarts negotiation.
    fn reset_enable(&self, hw: &Hw);

    /// Programs the link parameters into the PHY.
    /// Returns the gigabit advertisement now in effect (the `CTRL1000` register), zero if none.
    fn set_speed(&self, hw: &Hw, params: &LinkParams) -> Result<u16, Rtl8169Error>;

    fn power_up(&self, hw: &Hw);

    fn power_down(&self, hw: &Hw);
}

/// Picks the chip family from the `PHYstatus` register.
pub fn identify_ops(hw: &Hw) -> &'static dyn ChipOps {
    if hw.regs().read8(REG_PHY_STATUS) & PHY_STATUS_TBI_ENABLE != 0 {
        &TbiChip
    } else {
        &XmiiChip
    }
}


/// A copper chip with an MII-compatible PHY behind `PHYAR`.
pub struct XmiiChip;

/// The number of milliseconds to wait for a PHY reset to complete.
const PHY_RESET_WAIT_MS: u64 = 2500;

impl ChipOps for XmiiChip {
    fn name(&self) -> &'static str {
        "xmii"
    }

    fn link_ok(&self, hw: &Hw) -> bool {
        hw.mdio_write(MII_PAGE_SELECT, 0);
        hw.mdio_read(MII_BMSR) & BMSR_LSTATUS != 0
    }

    fn link_state(&self, hw: &Hw) -> LinkState {
        let status = hw.regs().read8(REG_PHY_STATUS);
        if status & PHY_STATUS_LINK == 0 {
            return LinkState::DOWN;
        }
        if status & PHY_STATUS_1000BPS_F != 0 {
            return LinkState::up(Speed::Mbps1000, Duplex::Full);
        }
        let speed = if status & PHY_STATUS_100BPS != 0 { Speed::Mbps100 } else { Speed::Mbps10 };
        let duplex = if status & PHY_STATUS_FULL_DUP != 0 { Duplex::Full } else { Duplex::Half };
        LinkState::up(speed, duplex)
    }

    fn reset_pending(&self, hw: &Hw) -> bool {
        hw.mdio_write(MII_PAGE_SELECT, 0);
        hw.mdio_read(MII_BMCR) & BMCR_RESET != 0
    }

    fn reset_enable(&self, hw: &Hw) {
        hw.mdio_write(MII_PAGE_SELECT, 0);
        hw.mdio_write(MII_BMCR, BMCR_RESET | BMCR_ANENABLE);
        for _ in 0..PHY_RESET_WAIT_MS {
            if hw.mdio_read(MII_BMCR) & BMCR_RESET == 0 {
                return;
            }
            hw.delay_us(1000);
        }
        error!("r8169::XmiiChip::reset_enable(): PHY reset failed");
    }

    fn set_speed(&self, hw: &Hw, params: &LinkParams) -> Result<u16, Rtl8169Error> {
        if params.autoneg {
            let mut auto_nego = hw.mdio_read(MII_ADVERTISE);
            auto_nego &= !(ADVERTISE_10HALF | ADVERTISE_10FULL | ADVERTISE_100HALF | ADVERTISE_100FULL
                | ADVERTISE_PAUSE_CAP | ADVERTISE_PAUSE_ASYM);
            let adv = params.advertising;
            if adv.contains(Advertising::HALF_10)   { auto_nego |= ADVERTISE_10HALF; }
            if adv.contains(Advertising::FULL_10)   { auto_nego |= ADVERTISE_10FULL; }
            if adv.contains(Advertising::HALF_100)  { auto_nego |= ADVERTISE_100HALF; }
            if adv.contains(Advertising::FULL_100)  { auto_nego |= ADVERTISE_100FULL; }
            auto_nego |= ADVERTISE_PAUSE_CAP | ADVERTISE_PAUSE_ASYM;

            let mut giga_ctrl = hw.mdio_read(MII_CTRL1000);
            giga_ctrl &= !(ADVERTISE_1000FULL | ADVERTISE_1000HALF);
            if adv.contains(Advertising::HALF_1000) { giga_ctrl |= ADVERTISE_1000HALF; }
            if params.advertises_1000_full()       { giga_ctrl |= ADVERTISE_1000FULL; }

            hw.mdio_write(MII_PAGE_SELECT, 0);
            hw.mdio_write(MII_ADVERTISE, auto_nego);
            hw.mdio_write(MII_CTRL1000, giga_ctrl);
            hw.mdio_write(MII_BMCR, BMCR_ANENABLE | BMCR_ANRESTART);
            Ok(giga_ctrl)
        } else {
            let mut bmcr = match params.speed {
                Speed::Mbps10 => BMCR_SPEED10,
                Speed::Mbps100 => BMCR_SPEED100,
                Speed::Mbps1000 => return Err(Rtl8169Error::InvalidLinkParams),
            };
            if params.duplex == Duplex::Full {
                bmcr |= BMCR_FULLDPLX;
            }
            hw.mdio_write(MII_PAGE_SELECT, 0);
            hw.mdio_write(MII_BMCR, bmcr);
            Ok(0)
        }
    }

    fn power_up(&self, hw: &Hw) {
        hw.mdio_write(MII_PAGE_SELECT, 0);
        hw.mdio_write(MII_BMCR, BMCR_ANENABLE);
    }

    fn power_down(&self, hw: &Hw) {
        hw.mdio_write(MII_PAGE_SELECT, 0);
        hw.mdio_write(MII_BMCR, BMCR_PDOWN | BMCR_ANENABLE);
    }
}


/// A fiber chip with a ten-bit interface.
pub struct TbiChip;

impl ChipOps for TbiChip {
    fn name(&self) -> &'static str {
        "tbi"
    }

    fn link_ok(&self, hw: &Hw) -> bool {
        hw.regs().read32(REG_TBICSR) & TBI_LINK_OK != 0
    }

    fn link_state(&self, hw: &Hw) -> LinkState {
        if self.link_ok(hw) {
            LinkState::up(Speed::Mbps1000, Duplex::Full)
        } else {
            LinkState::DOWN
        }
    }

    fn reset_pending(&self, hw: &Hw) -> bool {
        hw.regs().read32(REG_TBICSR) & TBI_RESET != 0
    }

    fn reset_enable(&self, hw: &Hw) {
        let csr = hw.regs().read32(REG_TBICSR);
        hw.regs().write32(REG_TBICSR, csr | TBI_RESET);
    }

    fn set_speed(&self, hw: &Hw, params: &LinkParams) -> Result<u16, Rtl8169Error> {
        let csr = hw.regs().read32(REG_TBICSR);
        if !params.autoneg && params.speed == Speed::Mbps1000 && params.duplex == Duplex::Full {
            hw.regs().write32(REG_TBICSR, csr & !(TBI_NW_ENABLE | TBI_NW_RESTART));
        } else if params.autoneg {
            hw.regs().write32(REG_TBICSR, csr | TBI_NW_ENABLE | TBI_NW_RESTART);
        } else {
            warn!("r8169::TbiChip::set_speed(): incorrect speed setting refused in TBI mode");
            return Err(Rtl8169Error::InvalidLinkParams);
        }
        Ok(0)
    }

    fn power_up(&self, _hw: &Hw) { }

    fn power_down(&self, _hw: &Hw) { }
}
