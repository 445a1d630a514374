//! The flow-table driver: implements the switch-programming contract by
//! turning each call into flow/group messages on a [`ControlChannel`].
//!
//! No call blocks: a message is built, handed to the channel, and the
//! status comes back. Correctness under loss comes from add-or-modify
//! semantics plus the daemon's periodic resync, not from retries here.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use swbridge_types::{
    DriverStatus, MacAddress, PacketBuffer, PacketPool, PortId, SwitchCapability, SwitchDriver,
    VlanId,
};

use crate::groups::{self, GroupId};
use crate::messages::{FlowMod, GroupMod};

/// The seam to the actual control-channel connection.
pub trait ControlChannel: Send + Sync {
    fn send_flow_mod(&self, flow_mod: FlowMod) -> DriverStatus;
    fn send_group_mod(&self, group_mod: GroupMod) -> DriverStatus;
    /// Fences ordering between dependent group/flow installs.
    fn send_barrier(&self) -> DriverStatus;
    /// Sends a raw frame out of the given hardware port.
    fn send_packet_out(&self, port: PortId, frame: &[u8]) -> DriverStatus;
}

/// A channel that only logs the messages it is handed.
///
/// Stands in for the real connection in dry runs and during bring-up;
/// every operation reports success.
#[derive(Debug, Default)]
pub struct TracingChannel;

impl ControlChannel for TracingChannel {
    fn send_flow_mod(&self, flow_mod: FlowMod) -> DriverStatus {
        debug!(?flow_mod, "flow-mod");
        DriverStatus::Ok
    }

    fn send_group_mod(&self, group_mod: GroupMod) -> DriverStatus {
        debug!(?group_mod, "group-mod");
        DriverStatus::Ok
    }

    fn send_barrier(&self) -> DriverStatus {
        debug!("barrier");
        DriverStatus::Ok
    }

    fn send_packet_out(&self, port: PortId, frame: &[u8]) -> DriverStatus {
        debug!(port, len = frame.len(), "packet-out");
        DriverStatus::Ok
    }
}

/// Programs the staged pipeline over a control channel.
pub struct FlowTableDriver {
    channel: Arc<dyn ControlChannel>,
    pool: Arc<PacketPool>,
    /// Per-VLAN set of member L2-interface group ids, the source for
    /// flood-group bucket rebuilds. Ordered so rebuilds are stable.
    l2_domain: Mutex<HashMap<u16, BTreeSet<GroupId>>>,
}

impl FlowTableDriver {
    pub fn new(channel: Arc<dyn ControlChannel>, pool: Arc<PacketPool>) -> Self {
        Self {
            channel,
            pool,
            l2_domain: Mutex::new(HashMap::new()),
        }
    }

    fn send_capability(&self, capability: SwitchCapability) -> DriverStatus {
        match capability {
            SwitchCapability::Arp => self.channel.send_flow_mod(FlowMod::policy_arp()),
        }
    }

    fn checked(&self, what: &'static str, status: DriverStatus) -> DriverStatus {
        if !status.is_ok() {
            warn!(%status, what, "programming call failed");
        }
        status
    }
}

impl SwitchDriver for FlowTableDriver {
    fn l2_addr_add(&self, port: PortId, vlan: VlanId, mac: MacAddress) -> DriverStatus {
        debug!(port, %vlan, %mac, "l2 addr add");
        self.checked(
            "bridging unicast add",
            self.channel
                .send_flow_mod(FlowMod::bridging_unicast(port, vlan, mac)),
        )
    }

    fn l2_addr_remove(&self, port: PortId, vlan: VlanId, mac: MacAddress) -> DriverStatus {
        debug!(port, %vlan, %mac, "l2 addr remove");
        self.checked(
            "bridging unicast remove",
            self.channel
                .send_flow_mod(FlowMod::bridging_unicast_remove(port, vlan, mac)),
        )
    }

    fn l2_addr_remove_all_in_vlan(&self, port: PortId, vlan: VlanId) -> DriverStatus {
        debug!(port, %vlan, "l2 addr remove all in vlan");
        self.checked(
            "bridging unicast remove all",
            self.channel
                .send_flow_mod(FlowMod::bridging_unicast_remove_all(port, vlan)),
        )
    }

    fn ingress_port_vlan_accept_all(&self, port: PortId) -> DriverStatus {
        self.checked(
            "ingress accept all",
            self.channel
                .send_flow_mod(FlowMod::vlan_ingress_allow_all(port)),
        )
    }

    fn ingress_port_vlan_drop_accept_all(&self, port: PortId) -> DriverStatus {
        self.checked(
            "ingress drop accept all",
            self.channel
                .send_flow_mod(FlowMod::vlan_ingress_allow_all_remove(port)),
        )
    }

    fn ingress_port_vlan_add(&self, port: PortId, vlan: VlanId, pvid: bool) -> DriverStatus {
        let status = self
            .channel
            .send_flow_mod(FlowMod::vlan_ingress(port, vlan));
        if !status.is_ok() {
            return self.checked("ingress vlan add", status);
        }
        if pvid {
            return self.checked(
                "ingress pvid add",
                self.channel.send_flow_mod(FlowMod::pvid_ingress(port, vlan)),
            );
        }
        DriverStatus::Ok
    }

    fn ingress_port_vlan_remove(&self, port: PortId, vlan: VlanId, pvid: bool) -> DriverStatus {
        if pvid {
            let status = self
                .channel
                .send_flow_mod(FlowMod::pvid_ingress_remove(port, vlan));
            if !status.is_ok() {
                return self.checked("ingress pvid remove", status);
            }
        }
        self.checked(
            "ingress vlan remove",
            self.channel
                .send_flow_mod(FlowMod::vlan_ingress_remove(port, vlan)),
        )
    }

    fn egress_port_vlan_accept_all(&self, port: PortId) -> DriverStatus {
        self.checked(
            "egress accept all",
            self.channel
                .send_group_mod(GroupMod::l2_unfiltered_interface(port)),
        )
    }

    fn egress_port_vlan_drop_accept_all(&self, port: PortId) -> DriverStatus {
        self.checked(
            "egress drop accept all",
            self.channel
                .send_group_mod(GroupMod::l2_unfiltered_interface_remove(port)),
        )
    }

    fn egress_port_vlan_add(&self, port: PortId, vlan: VlanId, untagged: bool) -> DriverStatus {
        let status = self
            .channel
            .send_group_mod(GroupMod::l2_interface(port, vlan, untagged));
        if !status.is_ok() {
            return self.checked("egress interface group add", status);
        }
        self.channel.send_barrier();

        let members = {
            let mut domain = self.l2_domain.lock();
            let set = domain.entry(vlan.raw()).or_default();
            set.insert(groups::l2_interface(port, vlan));
            set.clone()
        };

        let status = self
            .channel
            .send_group_mod(GroupMod::l2_flood(vlan, &members));
        if !status.is_ok() {
            return self.checked("flood group rebuild", status);
        }

        // First member: the flood group just came into existence, so the
        // unknown-unicast rule pointing at it can be installed now.
        if members.len() == 1 {
            self.channel.send_barrier();
            let flood = groups::l2_flood(vlan, vlan.raw());
            return self.checked(
                "dlf install",
                self.channel.send_flow_mod(FlowMod::bridging_dlf(vlan, flood)),
            );
        }
        DriverStatus::Ok
    }

    fn egress_port_vlan_remove(&self, port: PortId, vlan: VlanId, _untagged: bool) -> DriverStatus {
        let members = {
            let mut domain = self.l2_domain.lock();
            let Some(set) = domain.get_mut(&vlan.raw()) else {
                return DriverStatus::Ok;
            };
            set.remove(&groups::l2_interface(port, vlan));
            let members = set.clone();
            if members.is_empty() {
                domain.remove(&vlan.raw());
            }
            members
        };

        if members.is_empty() {
            // Last member: retire the unknown-unicast rule before the
            // group it points at.
            let status = self
                .channel
                .send_flow_mod(FlowMod::bridging_dlf_remove(vlan));
            if !status.is_ok() {
                return self.checked("dlf remove", status);
            }
            self.channel.send_barrier();
            let status = self.channel.send_group_mod(GroupMod::l2_flood_remove(vlan));
            if !status.is_ok() {
                return self.checked("flood group remove", status);
            }
        } else {
            let status = self
                .channel
                .send_group_mod(GroupMod::l2_flood(vlan, &members));
            if !status.is_ok() {
                return self.checked("flood group rebuild", status);
            }
        }

        self.channel.send_barrier();
        self.checked(
            "egress interface group remove",
            self.channel
                .send_group_mod(GroupMod::l2_interface_remove(port, vlan)),
        )
    }

    /// Idempotent: the daemon subscribes again whenever the switch
    /// re-registers after a reconnect.
    fn subscribe_to(&self, capability: SwitchCapability) -> DriverStatus {
        self.checked("subscribe", self.send_capability(capability))
    }

    fn enqueue(&self, port: PortId, buffer: PacketBuffer) -> DriverStatus {
        let status = self.channel.send_packet_out(port, buffer.as_slice());
        self.pool.release(buffer);
        self.checked("packet out", status)
    }
}
