//! A snapshot of the PCI configuration header, used to detect and repair configuration drift,
//! e.g., after an electrostatic discharge has corrupted the device's configuration space.

use nic_platform::PciConfigSpace;
use nic_platform::pci::*;

bitflags! {
    /// Which configuration fields were found changed by a [`PciConfigShadow::check_and_repair`].
    pub struct DriftFlags: u16 {
        const COMMAND           = 1 << 0;
        const BAR0_LOW          = 1 << 1;
        const BAR2_LOW          = 1 << 2;
        const BAR2_HIGH         = 1 << 3;
        const CACHE_LINE_SIZE   = 1 << 4;
        const BAR4_LOW          = 1 << 6;
        const BAR4_HIGH         = 1 << 7;
        const BAR5_LOW          = 1 << 8;
        const BAR5_HIGH         = 1 << 9;
        const INTERRUPT_LINE    = 1 << 10;
    }
}

/// The result of one drift check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DriftReport {
    /// The fields that differed from the shadow and were rewritten.
    pub drift: DriftFlags,
    /// The command byte still read back as all-ones after being rewritten:
    /// the device is unreachable, and the check was abandoned.
    pub link_down: bool,
}

/// The configuration header fields captured after the first successful hardware start.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PciConfigShadow {
    pub command: u8,
    pub cache_line_size: u8,
    pub bar0_low: u16,
    pub bar0_high: u16,
    pub bar2_low: u16,
    pub bar2_high: u16,
    pub interrupt_line: u8,
    pub bar4_low: u16,
    pub bar4_high: u16,
    pub bar5_low: u16,
    pub bar5_high: u16,
}

impl PciConfigShadow {
    pub fn capture(pci: &dyn PciConfigSpace) -> PciConfigShadow {
        PciConfigShadow {
            command:            pci.read8(PCI_COMMAND),
            cache_line_size:    pci.read8(PCI_CACHE_LINE_SIZE),
            bar0_low:           pci.read16(PCI_BAR0),
            bar0_high:          pci.read16(PCI_BAR0 + 2),
            bar2_low:           pci.read16(PCI_BAR2),
            bar2_high:          pci.read16(PCI_BAR2 + 2),
            interrupt_line:     pci.read8(PCI_INTERRUPT_LINE),
            bar4_low:           pci.read16(PCI_BAR4),
            bar4_high:          pci.read16(PCI_BAR4 + 2),
            bar5_low:           pci.read16(PCI_BAR5),
            bar5_high:          pci.read16(PCI_BAR5 + 2),
        }
    }

    /// Compares the live configuration header against this shadow,
    /// rewriting every field that differs and logging its actual and expected values.
    ///
    /// The upper half of BAR0 is captured but not checked.
    pub fn check_and_repair(&self, pci: &dyn PciConfigSpace) -> DriftReport {
        let mut drift = DriftFlags::empty();

        let command = pci.read8(PCI_COMMAND);
        if command != self.command {
            error!("r8169::check_and_repair(): cmd = {:#04x}, should be {:#04x}", command, self.command);
            pci.write8(PCI_COMMAND, self.command);
            drift |= DriftFlags::COMMAND;
            if pci.read8(PCI_COMMAND) == 0xFF {
                error!("r8169::check_and_repair(): pci link is down");
                return DriftReport { drift, link_down: true };
            }
        }

        let words = [
            ("bar0_low",  PCI_BAR0,     self.bar0_low,  DriftFlags::BAR0_LOW),
            ("bar2_low",  PCI_BAR2,     self.bar2_low,  DriftFlags::BAR2_LOW),
            ("bar2_high", PCI_BAR2 + 2, self.bar2_high, DriftFlags::BAR2_HIGH),
        ];
        drift |= repair_words(pci, &words);

        let cache_line_size = pci.read8(PCI_CACHE_LINE_SIZE);
        if cache_line_size != self.cache_line_size {
            error!("r8169::check_and_repair(): cls = {:#04x}, should be {:#04x}", cache_line_size, self.cache_line_size);
            pci.write8(PCI_CACHE_LINE_SIZE, self.cache_line_size);
            drift |= DriftFlags::CACHE_LINE_SIZE;
        }

        let words = [
            ("bar4_low",  PCI_BAR4,     self.bar4_low,  DriftFlags::BAR4_LOW),
            ("bar4_high", PCI_BAR4 + 2, self.bar4_high, DriftFlags::BAR4_HIGH),
            ("bar5_low",  PCI_BAR5,     self.bar5_low,  DriftFlags::BAR5_LOW),
            ("bar5_high", PCI_BAR5 + 2, self.bar5_high, DriftFlags::BAR5_HIGH),
        ];
        drift |= repair_words(pci, &words);

        let interrupt_line = pci.read8(PCI_INTERRUPT_LINE);
        if interrupt_line != self.interrupt_line {
            error!("r8169::check_and_repair(): ilr = {:#04x}, should be {:#04x}", interrupt_line, self.interrupt_line);
            pci.write8(PCI_INTERRUPT_LINE, self.interrupt_line);
            drift |= DriftFlags::INTERRUPT_LINE;
        }

        DriftReport { drift, link_down: false }
    }
}

fn repair_words(pci: &dyn PciConfigSpace, words: &[(&str, u8, u16, DriftFlags)]) -> DriftFlags {
    let mut drift = DriftFlags::empty();
    for &(name, offset, expected, flag) in words {
        let actual = pci.read16(offset);
        if actual != expected {
            error!("r8169::check_and_repair(): {} = {:#06x}, should be {:#06x}", name, actual, expected);
            pci.write16(offset, expected);
            drift |= flag;
        }
    }
    drift
}
