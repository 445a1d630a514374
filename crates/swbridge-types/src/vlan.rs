//! Validated VLAN identifier.

use std::fmt;

/// A VLAN id in the usable 802.1Q range.
///
/// Ids outside `1..=4094` are rejected at construction so that malformed
/// kernel input never reaches the table driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VlanId(u16);

impl VlanId {
    pub const MIN: u16 = 1;
    pub const MAX: u16 = 4094;

    /// Validate and wrap a raw VLAN id.
    pub fn new(vid: u16) -> Option<Self> {
        if (Self::MIN..=Self::MAX).contains(&vid) {
            Some(Self(vid))
        } else {
            None
        }
    }

    pub fn raw(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for VlanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
