//! Offsets and bits of the standard PCI configuration header.
//! More info here: <http://wiki.osdev.org/PCI#PCI_Device_Structure>

pub const PCI_COMMAND:               u8 = 0x4;
pub const PCI_STATUS:                u8 = 0x6;
pub const PCI_CACHE_LINE_SIZE:       u8 = 0xC;
pub const PCI_LATENCY_TIMER:         u8 = 0xD;
pub const PCI_BAR0:                  u8 = 0x10;
pub const PCI_BAR2:                  u8 = 0x18;
pub const PCI_BAR4:                  u8 = 0x20;
pub const PCI_BAR5:                  u8 = 0x24;
pub const PCI_INTERRUPT_LINE:        u8 = 0x3C;

/// Command register: respond to parity errors.
pub const PCI_COMMAND_PARITY:        u16 = 0x40;
/// Command register: enable SERR# reporting.
pub const PCI_COMMAND_SERR:          u16 = 0x100;

pub const PCI_STATUS_SIG_TARGET_ABORT:   u16 = 0x0800;
pub const PCI_STATUS_REC_TARGET_ABORT:   u16 = 0x1000;
pub const PCI_STATUS_REC_MASTER_ABORT:   u16 = 0x2000;
pub const PCI_STATUS_SIG_SYSTEM_ERROR:   u16 = 0x4000;
pub const PCI_STATUS_DETECTED_PARITY:    u16 = 0x8000;

/// All write-one-to-clear error bits of the status register.
pub const PCI_STATUS_ERROR_BITS: u16 = PCI_STATUS_DETECTED_PARITY
    | PCI_STATUS_SIG_SYSTEM_ERROR
    | PCI_STATUS_REC_MASTER_ABORT
    | PCI_STATUS_REC_TARGET_ABORT
    | PCI_STATUS_SIG_TARGET_ABORT;
