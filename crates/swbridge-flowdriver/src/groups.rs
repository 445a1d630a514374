//! Deterministic group-table identifiers.
//!
//! Group ids are computed from (VLAN, port) via a fixed bit packing, never
//! handed out by an allocator. Re-deriving the same logical group always
//! yields the same id, so no release bookkeeping exists to forget on an
//! error path. Layout: bits 31..28 group type, 27..16 VLAN id, 15..0 port
//! (or flood index).

use swbridge_types::{PortId, VlanId};

pub type GroupId = u32;

const TYPE_SHIFT: u32 = 28;
const VID_SHIFT: u32 = 16;

/// L2 interface group: one (port, VLAN) egress behavior.
pub const TYPE_L2_INTERFACE: u32 = 0;
/// L2 flood group: fan-out to every member of a VLAN.
pub const TYPE_L2_FLOOD: u32 = 4;
/// L2 unfiltered interface group: VLAN-agnostic port output.
pub const TYPE_L2_UNFILTERED: u32 = 11;

pub fn l2_interface(port: PortId, vid: VlanId) -> GroupId {
    TYPE_L2_INTERFACE << TYPE_SHIFT
        | u32::from(vid.raw() & 0x0fff) << VID_SHIFT
        | (port & 0xffff)
}

pub fn l2_unfiltered_interface(port: PortId) -> GroupId {
    TYPE_L2_UNFILTERED << TYPE_SHIFT | (port & 0xffff)
}

pub fn l2_flood(vid: VlanId, index: u16) -> GroupId {
    TYPE_L2_FLOOD << TYPE_SHIFT
        | u32::from(vid.raw() & 0x0fff) << VID_SHIFT
        | u32::from(index)
}

pub fn group_type(id: GroupId) -> u32 {
    id >> TYPE_SHIFT
}

pub fn group_vid(id: GroupId) -> u16 {
    (id >> VID_SHIFT) as u16 & 0x0fff
}

pub fn group_port(id: GroupId) -> u16 {
    id as u16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vid(v: u16) -> VlanId {
        VlanId::new(v).unwrap()
    }

    #[test]
    fn test_l2_interface_packing() {
        let id = l2_interface(7, vid(100));
        assert_eq!(group_type(id), TYPE_L2_INTERFACE);
        assert_eq!(group_vid(id), 100);
        assert_eq!(group_port(id), 7);
    }

    #[test]
    fn test_rederiving_is_deterministic() {
        assert_eq!(l2_interface(3, vid(20)), l2_interface(3, vid(20)));
        assert_eq!(l2_flood(vid(20), 20), l2_flood(vid(20), 20));
        assert_eq!(l2_unfiltered_interface(9), l2_unfiltered_interface(9));
    }

    #[test]
    fn test_types_do_not_collide() {
        let port = 5;
        let v = vid(10);
        let iface = l2_interface(port, v);
        let flood = l2_flood(v, port as u16);
        let unfiltered = l2_unfiltered_interface(port);
        assert_ne!(iface, flood);
        assert_ne!(iface, unfiltered);
        assert_ne!(flood, unfiltered);
    }

    #[test]
    fn test_distinct_inputs_distinct_ids() {
        assert_ne!(l2_interface(1, vid(10)), l2_interface(2, vid(10)));
        assert_ne!(l2_interface(1, vid(10)), l2_interface(1, vid(11)));
    }
}
