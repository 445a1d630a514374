//! Staged pipeline table identifiers and flow priorities.

/// Flow tables of the staged forwarding pipeline, in processing order.
///
/// A frame traverses the tables in ascending id order; each rule either
/// drops the frame or forwards it to a later table via goto-table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum TableId {
    IngressPort = 0,
    Vlan = 10,
    TerminationMac = 20,
    UnicastRouting = 30,
    MulticastRouting = 40,
    Bridging = 50,
    AclPolicy = 60,
}

impl TableId {
    pub fn id(&self) -> u8 {
        *self as u8
    }
}

/// Priority of the per-(port, VLAN) tagged-match rule.
pub const PRIORITY_VLAN_TAGGED: u16 = 3;
/// Priority of the PVID tag-assignment rule for untagged ingress frames.
pub const PRIORITY_VLAN_PVID: u16 = 2;
/// Priority of a unicast destination-match bridging rule.
pub const PRIORITY_BRIDGING_UNICAST: u16 = 3;
/// Priority of the per-VLAN destination-lookup-failure flood rule.
pub const PRIORITY_BRIDGING_DLF: u16 = 2;
/// Priority of ACL/policy trap rules.
pub const PRIORITY_ACL_POLICY: u16 = 2;

/// OXM "VLAN tag present" bit.
pub const VLAN_PRESENT: u16 = 0x1000;
/// Mask selecting only the 12 VLAN id bits.
pub const VLAN_VID_MASK: u16 = 0x0fff;
/// Mask selecting the id bits plus the present bit (exact tagged match).
pub const VLAN_ANY_MASK: u16 = 0x1fff;

pub const ETH_TYPE_ARP: u16 = 0x0806;
