// The 15-bit Art-Net Port-Address: Net (7 bits) : Sub-Net (4) : Universe (4)

use serde::{Deserialize, Serialize};

/// A 15-bit Art-Net Port-Address. Bit 15 is reserved zero; 0 is the
/// reserved "default" address and nodes power up at universe 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PortAddress(u16);

impl PortAddress {
    /// Build a Port-Address from its three switch fields. Out-of-range
    /// inputs are masked to their field widths.
    pub fn compose(net: u8, sub: u8, universe: u8) -> Self {
        let value = ((net as u16 & 0x7f) << 8) | ((sub as u16 & 0x0f) << 4) | (universe as u16 & 0x0f);
        PortAddress(value)
    }

    /// Net switch: bits 14-8
    pub fn net(self) -> u8 {
        ((self.0 >> 8) & 0x7f) as u8
    }

    /// Sub-Net switch: bits 7-4
    pub fn sub_net(self) -> u8 {
        ((self.0 >> 4) & 0x0f) as u8
    }

    /// Universe switch: bits 3-0
    pub fn universe(self) -> u8 {
        (self.0 & 0x0f) as u8
    }

    /// The low byte as carried in `SwIn`/`SwOut` fields
    pub fn sub_uni(self) -> u8 {
        (self.0 & 0xff) as u8
    }

    pub fn value(self) -> u16 {
        self.0
    }
}

impl From<u16> for PortAddress {
    fn from(value: u16) -> Self {
        // Bit 15 is reserved zero on the wire
        PortAddress(value & 0x7fff)
    }
}

impl From<PortAddress> for u16 {
    fn from(address: PortAddress) -> u16 {
        address.0
    }
}

impl std::fmt::Display for PortAddress {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}:{}:{}", self.net(), self.sub_net(), self.universe())
    }
}

/// Values of the programming fields in ArtAddress: bit 7 set programs the
/// low bits, 0x00 resets to the default, 0x7f leaves the switch alone.
pub mod program {
    pub const NO_CHANGE: u8 = 0x7f;
    pub const DEFAULTS: u8 = 0x00;
    pub const CHANGE_MASK: u8 = 0x80;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compose_packs_the_three_fields() {
        let a = PortAddress::compose(1, 2, 3);
        assert_eq!(a.value(), (1 << 8) | (2 << 4) | 3);
        assert_eq!(a.net(), 1);
        assert_eq!(a.sub_net(), 2);
        assert_eq!(a.universe(), 3);
    }

    #[test]
    fn compose_masks_out_of_range_fields() {
        let a = PortAddress::compose(0xff, 0xff, 0xff);
        assert_eq!(a.value(), 0x7fff);
    }

    #[test]
    fn decompose_round_trips_every_switch_combination() {
        for net in 0..=127u8 {
            for sub in 0..=15u8 {
                for universe in 0..=15u8 {
                    let a = PortAddress::compose(net, sub, universe);
                    assert_eq!((a.net(), a.sub_net(), a.universe()), (net, sub, universe));
                }
            }
        }
    }

    #[test]
    fn wire_value_clears_the_reserved_bit() {
        let a = PortAddress::from(0xffff);
        assert_eq!(a.value(), 0x7fff);
    }
}
