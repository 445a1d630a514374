//! Typed flow-mod and group-mod intents.
//!
//! These structs describe one table or group operation at the intent
//! level; the control channel turns them into wire messages. All add
//! commands carry add-or-modify semantics, so re-issuing an identical
//! message leaves hardware state unchanged.

use std::collections::BTreeSet;

use swbridge_types::{MacAddress, PortId, VlanId};

use crate::groups::{self, GroupId};
use crate::tables::{
    TableId, ETH_TYPE_ARP, PRIORITY_ACL_POLICY, PRIORITY_BRIDGING_DLF, PRIORITY_BRIDGING_UNICAST,
    PRIORITY_VLAN_PVID, PRIORITY_VLAN_TAGGED, VLAN_ANY_MASK, VLAN_PRESENT, VLAN_VID_MASK,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModCommand {
    /// Install, overwriting an identical-match entry if one exists.
    AddOrModify,
    Remove,
}

/// Match fields used by the pipeline; unset fields are wildcarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlowMatch {
    pub in_port: Option<PortId>,
    /// (value, mask) over the 12 id bits plus the tag-present bit.
    pub vlan_vid: Option<(u16, u16)>,
    pub eth_dst: Option<MacAddress>,
    pub eth_type: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SetVlanVid(u16),
    PopVlan,
    OutputPort(PortId),
    OutputController,
    Group(GroupId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowMod {
    pub command: ModCommand,
    pub table: TableId,
    pub priority: u16,
    pub matches: FlowMatch,
    pub apply_actions: Vec<Action>,
    pub goto_table: Option<TableId>,
    /// Restricts a `Remove` to entries whose action set points at this
    /// group (used to clear all unicast entries of one port in one VLAN).
    pub out_group: Option<GroupId>,
}

impl FlowMod {
    fn new(command: ModCommand, table: TableId, priority: u16) -> Self {
        Self {
            command,
            table,
            priority,
            matches: FlowMatch::default(),
            apply_actions: Vec::new(),
            goto_table: None,
            out_group: None,
        }
    }

    /// Per-(port, VLAN) tagged-frame admission rule.
    pub fn vlan_ingress(port: PortId, vid: VlanId) -> Self {
        let mut fm = Self::new(ModCommand::AddOrModify, TableId::Vlan, PRIORITY_VLAN_TAGGED);
        fm.matches.in_port = Some(port);
        fm.matches.vlan_vid = Some((vid.raw() | VLAN_PRESENT, VLAN_ANY_MASK));
        fm.goto_table = Some(TableId::TerminationMac);
        fm
    }

    pub fn vlan_ingress_remove(port: PortId, vid: VlanId) -> Self {
        let mut fm = Self::vlan_ingress(port, vid);
        fm.command = ModCommand::Remove;
        fm
    }

    /// Tags untagged ingress frames on `port` with the port's PVID.
    pub fn pvid_ingress(port: PortId, vid: VlanId) -> Self {
        let mut fm = Self::new(ModCommand::AddOrModify, TableId::Vlan, PRIORITY_VLAN_PVID);
        fm.matches.in_port = Some(port);
        fm.matches.vlan_vid = Some((0, VLAN_ANY_MASK));
        fm.apply_actions
            .push(Action::SetVlanVid(vid.raw() | VLAN_PRESENT));
        fm.goto_table = Some(TableId::TerminationMac);
        fm
    }

    pub fn pvid_ingress_remove(port: PortId, vid: VlanId) -> Self {
        let mut fm = Self::pvid_ingress(port, vid);
        fm.command = ModCommand::Remove;
        fm
    }

    /// Admits any tagged frame on `port` without per-VLAN filtering.
    pub fn vlan_ingress_allow_all(port: PortId) -> Self {
        let mut fm = Self::new(ModCommand::AddOrModify, TableId::Vlan, PRIORITY_VLAN_PVID);
        fm.matches.in_port = Some(port);
        fm.matches.vlan_vid = Some((VLAN_PRESENT, VLAN_PRESENT));
        fm.goto_table = Some(TableId::TerminationMac);
        fm
    }

    pub fn vlan_ingress_allow_all_remove(port: PortId) -> Self {
        let mut fm = Self::vlan_ingress_allow_all(port);
        fm.command = ModCommand::Remove;
        fm
    }

    /// Unicast destination match pointing at the (port, VLAN) interface
    /// group.
    pub fn bridging_unicast(port: PortId, vid: VlanId, mac: MacAddress) -> Self {
        let mut fm = Self::new(
            ModCommand::AddOrModify,
            TableId::Bridging,
            PRIORITY_BRIDGING_UNICAST,
        );
        fm.matches.vlan_vid = Some((vid.raw() | VLAN_PRESENT, VLAN_ANY_MASK));
        fm.matches.eth_dst = Some(mac);
        fm.apply_actions
            .push(Action::Group(groups::l2_interface(port, vid)));
        fm.goto_table = Some(TableId::AclPolicy);
        fm
    }

    pub fn bridging_unicast_remove(port: PortId, vid: VlanId, mac: MacAddress) -> Self {
        let mut fm = Self::bridging_unicast(port, vid, mac);
        fm.command = ModCommand::Remove;
        fm
    }

    /// Removes every unicast entry of one VLAN that egresses through the
    /// given port's interface group.
    pub fn bridging_unicast_remove_all(port: PortId, vid: VlanId) -> Self {
        let mut fm = Self::new(
            ModCommand::Remove,
            TableId::Bridging,
            PRIORITY_BRIDGING_UNICAST,
        );
        fm.matches.vlan_vid = Some((vid.raw() | VLAN_PRESENT, VLAN_ANY_MASK));
        fm.out_group = Some(groups::l2_interface(port, vid));
        fm
    }

    /// Destination-lookup-failure rule flooding unknown unicast to the
    /// VLAN's flood group.
    pub fn bridging_dlf(vid: VlanId, flood_group: GroupId) -> Self {
        let mut fm = Self::new(
            ModCommand::AddOrModify,
            TableId::Bridging,
            PRIORITY_BRIDGING_DLF,
        );
        fm.matches.vlan_vid = Some((vid.raw() | VLAN_PRESENT, VLAN_VID_MASK));
        fm.apply_actions.push(Action::Group(flood_group));
        fm.goto_table = Some(TableId::AclPolicy);
        fm
    }

    pub fn bridging_dlf_remove(vid: VlanId) -> Self {
        let mut fm = Self::new(ModCommand::Remove, TableId::Bridging, PRIORITY_BRIDGING_DLF);
        fm.matches.vlan_vid = Some((vid.raw() | VLAN_PRESENT, VLAN_VID_MASK));
        fm
    }

    /// ARP trap: copies matching broadcasts to the control channel; the
    /// frame still floods through the bridging stage.
    pub fn policy_arp() -> Self {
        let mut fm = Self::new(
            ModCommand::AddOrModify,
            TableId::AclPolicy,
            PRIORITY_ACL_POLICY,
        );
        fm.matches.eth_type = Some(ETH_TYPE_ARP);
        fm.apply_actions.push(Action::OutputController);
        fm
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupType {
    /// Single-bucket group (interface groups).
    Indirect,
    /// Every bucket executes (flood groups).
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupBucket {
    pub actions: Vec<Action>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMod {
    pub command: ModCommand,
    pub group_type: GroupType,
    pub group_id: GroupId,
    pub buckets: Vec<GroupBucket>,
}

impl GroupMod {
    /// L2 interface group for one (port, VLAN); strips the tag when
    /// `untagged`.
    pub fn l2_interface(port: PortId, vid: VlanId, untagged: bool) -> Self {
        let mut actions = Vec::new();
        if untagged {
            actions.push(Action::PopVlan);
        }
        actions.push(Action::OutputPort(port));
        Self {
            command: ModCommand::AddOrModify,
            group_type: GroupType::Indirect,
            group_id: groups::l2_interface(port, vid),
            buckets: vec![GroupBucket { actions }],
        }
    }

    pub fn l2_interface_remove(port: PortId, vid: VlanId) -> Self {
        Self {
            command: ModCommand::Remove,
            group_type: GroupType::Indirect,
            group_id: groups::l2_interface(port, vid),
            buckets: Vec::new(),
        }
    }

    pub fn l2_unfiltered_interface(port: PortId) -> Self {
        Self {
            command: ModCommand::AddOrModify,
            group_type: GroupType::Indirect,
            group_id: groups::l2_unfiltered_interface(port),
            buckets: vec![GroupBucket {
                actions: vec![Action::OutputPort(port)],
            }],
        }
    }

    pub fn l2_unfiltered_interface_remove(port: PortId) -> Self {
        Self {
            command: ModCommand::Remove,
            group_type: GroupType::Indirect,
            group_id: groups::l2_unfiltered_interface(port),
            buckets: Vec::new(),
        }
    }

    /// Flood group for a VLAN, rebuilt from the full member set on every
    /// change. Bucket order follows the ordered member set, so rebuilding
    /// from equal membership yields an identical message.
    pub fn l2_flood(vid: VlanId, members: &BTreeSet<GroupId>) -> Self {
        let buckets = members
            .iter()
            .map(|&member| GroupBucket {
                actions: vec![Action::Group(member)],
            })
            .collect();
        Self {
            command: ModCommand::AddOrModify,
            group_type: GroupType::All,
            group_id: groups::l2_flood(vid, vid.raw()),
            buckets,
        }
    }

    pub fn l2_flood_remove(vid: VlanId) -> Self {
        Self {
            command: ModCommand::Remove,
            group_type: GroupType::All,
            group_id: groups::l2_flood(vid, vid.raw()),
            buckets: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vid(v: u16) -> VlanId {
        VlanId::new(v).unwrap()
    }

    #[test]
    fn test_pvid_rule_tags_untagged_frames() {
        let fm = FlowMod::pvid_ingress(2, vid(20));
        assert_eq!(fm.matches.vlan_vid, Some((0, VLAN_ANY_MASK)));
        assert_eq!(
            fm.apply_actions,
            vec![Action::SetVlanVid(20 | VLAN_PRESENT)]
        );
        assert_eq!(fm.goto_table, Some(TableId::TerminationMac));
    }

    #[test]
    fn test_tagged_rule_matches_exact_vid() {
        let fm = FlowMod::vlan_ingress(2, vid(10));
        assert_eq!(fm.matches.in_port, Some(2));
        assert_eq!(fm.matches.vlan_vid, Some((10 | VLAN_PRESENT, VLAN_ANY_MASK)));
        assert!(fm.apply_actions.is_empty());
    }

    #[test]
    fn test_unicast_points_at_interface_group() {
        let mac: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let fm = FlowMod::bridging_unicast(3, vid(20), mac);
        assert_eq!(
            fm.apply_actions,
            vec![Action::Group(groups::l2_interface(3, vid(20)))]
        );
        assert_eq!(fm.matches.eth_dst, Some(mac));
    }

    #[test]
    fn test_remove_all_filters_by_out_group() {
        let fm = FlowMod::bridging_unicast_remove_all(3, vid(20));
        assert_eq!(fm.command, ModCommand::Remove);
        assert_eq!(fm.out_group, Some(groups::l2_interface(3, vid(20))));
        assert_eq!(fm.matches.eth_dst, None);
    }

    #[test]
    fn test_untagged_interface_group_strips_tag() {
        let gm = GroupMod::l2_interface(4, vid(30), true);
        assert_eq!(
            gm.buckets[0].actions,
            vec![Action::PopVlan, Action::OutputPort(4)]
        );
        let gm = GroupMod::l2_interface(4, vid(30), false);
        assert_eq!(gm.buckets[0].actions, vec![Action::OutputPort(4)]);
    }

    #[test]
    fn test_flood_rebuild_is_order_stable() {
        let mut members = BTreeSet::new();
        members.insert(groups::l2_interface(2, vid(10)));
        members.insert(groups::l2_interface(1, vid(10)));
        let a = GroupMod::l2_flood(vid(10), &members);
        let b = GroupMod::l2_flood(vid(10), &members);
        assert_eq!(a, b);
        assert_eq!(a.buckets.len(), 2);
    }
}
