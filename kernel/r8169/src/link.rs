//! Link parameters: how the PHY should negotiate or force speed and duplex.

use network_interface_card::{Duplex, Speed};

bitflags! {
    /// The link modes offered during auto-negotiation.
    pub struct Advertising: u32 {
        const HALF_10       = 1 << 0;
        const FULL_10       = 1 << 1;
        const HALF_100      = 1 << 2;
        const FULL_100      = 1 << 3;
        const HALF_1000     = 1 << 4;
        const FULL_1000     = 1 << 5;
    }
}

/// The requested link configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LinkParams {
    /// Negotiate with the link partner, offering the `advertising` modes.
    /// Otherwise `speed` and `duplex` are forced.
    pub autoneg: bool,
    pub speed: Speed,
    pub duplex: Duplex,
    pub advertising: Advertising,
}

impl Default for LinkParams {
    /// Auto-negotiation offering every mode, preferring gigabit full duplex.
    fn default() -> Self {
        LinkParams {
            autoneg: true,
            speed: Speed::Mbps1000,
            duplex: Duplex::Full,
            advertising: Advertising::all(),
        }
    }
}

impl LinkParams {
    /// Forces the given speed and duplex, without negotiation.
    pub fn forced(speed: Speed, duplex: Duplex) -> LinkParams {
        LinkParams { autoneg: false, speed, duplex, advertising: Advertising::empty() }
    }

    /// Replaces a negotiation request that advertises nothing with the defaults.
    pub fn normalize(self) -> LinkParams {
        if self.autoneg && self.advertising.is_empty() {
            debug!("r8169::LinkParams::normalize(): nothing advertised, using defaults");
            return LinkParams::default();
        }
        self
    }

    /// Returns `true` if gigabit full duplex is among the negotiated modes.
    pub fn advertises_1000_full(&self) -> bool {
        self.autoneg && self.advertising.contains(Advertising::FULL_1000)
    }
}
