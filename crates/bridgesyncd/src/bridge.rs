//! Bridge state translator: maps kernel VLAN/FDB deltas onto the
//! switch-programming contract.
//!
//! One bridge master is adopted per process lifetime. Within one link
//! delta, calls are ordered ingress before egress so a port never
//! forwards before its ingress filtering is in place; VLAN removals
//! clear pinned FDB entries before the rules they point at. Every
//! lookup failure degrades to a logged no-op, never an error to the
//! caller.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use swbridge_types::{MacAddress, PortId, SwitchCapability, SwitchDriver, VlanId};

use crate::config::BridgeConfig;
use crate::ports::PortRegistry;
use crate::types::{BridgeNeighbor, LinkSnapshot, VlanBitmap};

#[derive(Debug, Clone)]
struct BridgeInfo {
    ifindex: u32,
    mac: MacAddress,
    name: String,
}

pub struct BridgeStateTranslator {
    driver: RwLock<Option<Arc<dyn SwitchDriver>>>,
    ports: Arc<PortRegistry>,
    bridge: Mutex<Option<BridgeInfo>>,
    ingress_vlan_filtered: bool,
    egress_vlan_filtered: bool,
}

impl BridgeStateTranslator {
    pub fn new(ports: Arc<PortRegistry>, config: &BridgeConfig) -> Self {
        Self {
            driver: RwLock::new(None),
            ports,
            bridge: Mutex::new(None),
            ingress_vlan_filtered: config.ingress_vlan_filtered,
            egress_vlan_filtered: config.egress_vlan_filtered,
        }
    }

    /// Installs the live programming contract and subscribes to the
    /// packet classes the translator depends on.
    pub fn set_driver(&self, driver: Arc<dyn SwitchDriver>) {
        driver.subscribe_to(SwitchCapability::Arp);
        *self.driver.write() = Some(driver);
    }

    fn driver(&self) -> Option<Arc<dyn SwitchDriver>> {
        let driver = self.driver.read().clone();
        if driver.is_none() {
            debug!("no switch registered, skipping programming call");
        }
        driver
    }

    /// Adopts `link` as the bridge master. At most one bridge is
    /// adopted per process lifetime; later candidates are ignored.
    pub fn adopt_bridge(&self, link: &LinkSnapshot) {
        let mut bridge = self.bridge.lock();
        match bridge.as_ref() {
            Some(existing) if existing.ifindex == link.ifindex => {}
            Some(existing) => {
                info!(
                    adopted = %existing.name,
                    candidate = %link.name,
                    "bridge already adopted, ignoring"
                );
            }
            None => {
                info!(bridge = %link.name, ifindex = link.ifindex, "adopting bridge master");
                *bridge = Some(BridgeInfo {
                    ifindex: link.ifindex,
                    mac: link.mac,
                    name: link.name.clone(),
                });
            }
        }
    }

    pub fn bridge_ifindex(&self) -> Option<u32> {
        self.bridge.lock().as_ref().map(|b| b.ifindex)
    }

    fn bridge_mac(&self) -> Option<MacAddress> {
        self.bridge.lock().as_ref().map(|b| b.mac)
    }

    /// Keeps the adopted bridge's own address current; the self-loop
    /// guard compares against it.
    pub fn refresh_bridge(&self, link: &LinkSnapshot) {
        let mut bridge = self.bridge.lock();
        if let Some(info) = bridge.as_mut() {
            if info.ifindex == link.ifindex {
                info.mac = link.mac;
                info.name = link.name.clone();
            }
        }
    }

    /// Checks that `link` is a slave of the adopted bridge and resolves
    /// its hardware port id.
    fn member_port(&self, link: &LinkSnapshot, what: &'static str) -> Option<PortId> {
        let bridge = self.bridge.lock();
        let Some(info) = bridge.as_ref() else {
            warn!(link = %link.name, what, "cannot translate without an adopted bridge");
            return None;
        };
        if link.master != info.ifindex {
            debug!(link = %link.name, what, "link is not a slave of the adopted bridge");
            return None;
        }
        drop(bridge);

        let port = self.ports.port_for_ifindex(link.ifindex);
        if port.is_none() {
            debug!(link = %link.name, ifindex = link.ifindex, what,
                "link is not a registered switch port, ignoring");
        }
        port
    }

    /// Programs a port that just became a bridge member.
    pub fn add_interface(&self, link: &LinkSnapshot) {
        let Some(port) = self.member_port(link, "add interface") else {
            return;
        };
        let Some(driver) = self.driver() else { return };
        let Some(vlans) = link.bridge_vlans.as_ref() else {
            debug!(link = %link.name, "no bridge VLAN info on link, ignoring");
            return;
        };

        if !self.ingress_vlan_filtered {
            driver.ingress_port_vlan_accept_all(port);
            // untagged ingress still needs a PVID assignment rule
            if let Some(pvid) = VlanId::new(vlans.pvid()) {
                debug!(port, %pvid, "unfiltered ingress pvid");
                driver.ingress_port_vlan_add(port, pvid, true);
            }
        }
        if !self.egress_vlan_filtered {
            driver.egress_port_vlan_accept_all(port);
        }
        if !self.ingress_vlan_filtered && !self.egress_vlan_filtered {
            return;
        }

        self.apply_deltas(port, &driver, &VlanBitmap::default(), vlans);
    }

    /// Applies a kernel update of an existing member.
    pub fn update_interface(&self, old: &LinkSnapshot, new: &LinkSnapshot) {
        let Some(port) = self.member_port(new, "update interface") else {
            return;
        };
        if old.name != new.name {
            info!(old = %old.name, new = %new.name, "ignoring rename of enslaved link");
            return;
        }
        let Some(driver) = self.driver() else { return };
        let (Some(old_vlans), Some(new_vlans)) =
            (old.bridge_vlans.as_ref(), new.bridge_vlans.as_ref())
        else {
            debug!(link = %new.name, "no bridge VLAN info on link, ignoring");
            return;
        };

        if !self.ingress_vlan_filtered && old_vlans.pvid() != new_vlans.pvid() {
            match VlanId::new(new_vlans.pvid()) {
                Some(new_pvid) => {
                    debug!(port, old = old_vlans.pvid(), new = %new_pvid, "pvid changed");
                    driver.ingress_port_vlan_add(port, new_pvid, true);
                    if let Some(old_pvid) = VlanId::new(old_vlans.pvid()) {
                        // keep the tag-rewrite of the new pvid; only the
                        // old vid match goes away
                        driver.ingress_port_vlan_remove(port, old_pvid, false);
                    }
                }
                None => {
                    if let Some(old_pvid) = VlanId::new(old_vlans.pvid()) {
                        driver.ingress_port_vlan_remove(port, old_pvid, true);
                    }
                }
            }
        }

        if !self.ingress_vlan_filtered && !self.egress_vlan_filtered {
            return;
        }

        if old_vlans != new_vlans {
            self.apply_deltas(port, &driver, old_vlans, new_vlans);
        }
    }

    /// Unprograms a member that left the bridge or was deleted.
    pub fn delete_interface(&self, link: &LinkSnapshot) {
        let Some(port) = self.member_port(link, "delete interface") else {
            return;
        };
        let Some(driver) = self.driver() else { return };

        if !self.ingress_vlan_filtered {
            driver.ingress_port_vlan_drop_accept_all(port);
        }
        if !self.egress_vlan_filtered {
            driver.egress_port_vlan_drop_accept_all(port);
        }
        if !self.ingress_vlan_filtered && !self.egress_vlan_filtered {
            return;
        }

        if let Some(vlans) = link.bridge_vlans.as_ref() {
            self.apply_deltas(port, &driver, vlans, &VlanBitmap::default());
        }
    }

    /// Issues the minimal driver calls to move the port from `old` VLAN
    /// state to `new`. Adds go ingress first, then egress; removals
    /// clear pinned FDB entries before tearing rules down.
    fn apply_deltas(
        &self,
        port: PortId,
        driver: &Arc<dyn SwitchDriver>,
        old: &VlanBitmap,
        new: &VlanBitmap,
    ) {
        for delta in VlanBitmap::diff(old, new) {
            let Some(vid) = VlanId::new(delta.vid) else {
                warn!(vid = delta.vid, port, "VLAN id out of range, skipping");
                continue;
            };
            if delta.added {
                if self.ingress_vlan_filtered {
                    driver.ingress_port_vlan_add(port, vid, new.pvid() == delta.vid);
                }
                if self.egress_vlan_filtered {
                    driver.egress_port_vlan_add(port, vid, delta.untagged);
                }
            } else {
                if self.egress_vlan_filtered {
                    driver.l2_addr_remove_all_in_vlan(port, vid);
                }
                if self.ingress_vlan_filtered {
                    driver.ingress_port_vlan_remove(port, vid, old.pvid() == delta.vid);
                }
                if self.egress_vlan_filtered {
                    driver.egress_port_vlan_remove(port, vid, delta.untagged);
                }
            }
        }
    }

    /// A kernel FDB entry appeared.
    pub fn neigh_created(&self, neighbor: &BridgeNeighbor) {
        let Some((port, vid)) = self.validated_neighbor(neighbor) else {
            return;
        };
        let Some(driver) = self.driver() else { return };
        driver.l2_addr_add(port, vid, neighbor.mac);
    }

    /// A kernel FDB entry went away.
    pub fn neigh_removed(&self, neighbor: &BridgeNeighbor) {
        let Some((port, vid)) = self.validated_neighbor(neighbor) else {
            return;
        };
        let Some(driver) = self.driver() else { return };
        driver.l2_addr_remove(port, vid, neighbor.mac);
    }

    fn validated_neighbor(&self, neighbor: &BridgeNeighbor) -> Option<(PortId, VlanId)> {
        let Some(vid) = VlanId::new(neighbor.vlan) else {
            warn!(vlan = neighbor.vlan, mac = %neighbor.mac, "neighbor VLAN id out of range");
            return None;
        };
        if neighbor.mac.is_zero() {
            warn!(ifindex = neighbor.ifindex, "neighbor with zero address, ignoring");
            return None;
        }
        // frames to the bridge's own address terminate locally
        if Some(neighbor.mac) == self.bridge_mac() {
            debug!(mac = %neighbor.mac, "neighbor is the bridge itself, ignoring");
            return None;
        }
        let Some(port) = self.ports.port_for_ifindex(neighbor.ifindex) else {
            debug!(
                ifindex = neighbor.ifindex,
                mac = %neighbor.mac,
                "neighbor on a link not under our control, ignoring"
            );
            return None;
        };
        Some((port, vid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use swbridge_types::{DriverStatus, PacketBuffer};

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        L2Add(PortId, u16, MacAddress),
        L2Remove(PortId, u16, MacAddress),
        L2RemoveAll(PortId, u16),
        IngressAdd(PortId, u16, bool),
        IngressRemove(PortId, u16, bool),
        EgressAdd(PortId, u16, bool),
        EgressRemove(PortId, u16),
        Subscribe(SwitchCapability),
    }

    #[derive(Default)]
    struct RecordingDriver {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingDriver {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    impl SwitchDriver for RecordingDriver {
        fn l2_addr_add(&self, port: PortId, vlan: VlanId, mac: MacAddress) -> DriverStatus {
            self.calls.lock().push(Call::L2Add(port, vlan.raw(), mac));
            DriverStatus::Ok
        }
        fn l2_addr_remove(&self, port: PortId, vlan: VlanId, mac: MacAddress) -> DriverStatus {
            self.calls.lock().push(Call::L2Remove(port, vlan.raw(), mac));
            DriverStatus::Ok
        }
        fn l2_addr_remove_all_in_vlan(&self, port: PortId, vlan: VlanId) -> DriverStatus {
            self.calls.lock().push(Call::L2RemoveAll(port, vlan.raw()));
            DriverStatus::Ok
        }
        fn ingress_port_vlan_accept_all(&self, _port: PortId) -> DriverStatus {
            DriverStatus::Ok
        }
        fn ingress_port_vlan_drop_accept_all(&self, _port: PortId) -> DriverStatus {
            DriverStatus::Ok
        }
        fn ingress_port_vlan_add(&self, port: PortId, vlan: VlanId, pvid: bool) -> DriverStatus {
            self.calls.lock().push(Call::IngressAdd(port, vlan.raw(), pvid));
            DriverStatus::Ok
        }
        fn ingress_port_vlan_remove(&self, port: PortId, vlan: VlanId, pvid: bool) -> DriverStatus {
            self.calls
                .lock()
                .push(Call::IngressRemove(port, vlan.raw(), pvid));
            DriverStatus::Ok
        }
        fn egress_port_vlan_accept_all(&self, _port: PortId) -> DriverStatus {
            DriverStatus::Ok
        }
        fn egress_port_vlan_drop_accept_all(&self, _port: PortId) -> DriverStatus {
            DriverStatus::Ok
        }
        fn egress_port_vlan_add(&self, port: PortId, vlan: VlanId, untagged: bool) -> DriverStatus {
            self.calls
                .lock()
                .push(Call::EgressAdd(port, vlan.raw(), untagged));
            DriverStatus::Ok
        }
        fn egress_port_vlan_remove(
            &self,
            port: PortId,
            vlan: VlanId,
            _untagged: bool,
        ) -> DriverStatus {
            self.calls.lock().push(Call::EgressRemove(port, vlan.raw()));
            DriverStatus::Ok
        }
        fn subscribe_to(&self, capability: SwitchCapability) -> DriverStatus {
            self.calls.lock().push(Call::Subscribe(capability));
            DriverStatus::Ok
        }
        fn enqueue(&self, _port: PortId, _buffer: PacketBuffer) -> DriverStatus {
            DriverStatus::Ok
        }
    }

    fn bridge_link(ifindex: u32, mac: [u8; 6]) -> LinkSnapshot {
        LinkSnapshot {
            ifindex,
            name: "br0".to_string(),
            mac: MacAddress::new(mac),
            flags: 0,
            mtu: 1500,
            master: 0,
            bridge_vlans: None,
        }
    }

    fn slave_link(ifindex: u32, name: &str, master: u32, vlans: VlanBitmap) -> LinkSnapshot {
        LinkSnapshot {
            ifindex,
            name: name.to_string(),
            mac: MacAddress::new([0, 0, 0, 0, 0, ifindex as u8]),
            flags: 0,
            mtu: 1500,
            master,
            bridge_vlans: Some(vlans),
        }
    }

    fn setup() -> (Arc<RecordingDriver>, BridgeStateTranslator) {
        let ports = Arc::new(PortRegistry::new());
        ports.register(3, "eth0");
        ports.bind_ifindex("eth0", 5);
        let translator = BridgeStateTranslator::new(ports, &BridgeConfig::default());
        let driver = Arc::new(RecordingDriver::default());
        translator.set_driver(driver.clone());
        translator.adopt_bridge(&bridge_link(1, [2, 0, 0, 0, 0, 1]));
        (driver, translator)
    }

    #[test]
    fn test_adoption_is_immutable() {
        let (_, translator) = setup();
        translator.adopt_bridge(&bridge_link(9, [2, 0, 0, 0, 0, 9]));
        assert_eq!(translator.bridge_ifindex(), Some(1));
    }

    #[test]
    fn test_set_driver_subscribes_arp() {
        let (driver, _) = setup();
        assert_eq!(driver.calls(), vec![Call::Subscribe(SwitchCapability::Arp)]);
    }

    #[test]
    fn test_add_interface_orders_ingress_before_egress() {
        let (driver, translator) = setup();
        let mut vlans = VlanBitmap::default();
        vlans.set(20, true);
        vlans.set_pvid(20);
        translator.add_interface(&slave_link(5, "eth0", 1, vlans));

        let calls: Vec<Call> = driver
            .calls()
            .into_iter()
            .filter(|c| !matches!(c, Call::Subscribe(_)))
            .collect();
        assert_eq!(
            calls,
            vec![Call::IngressAdd(3, 20, true), Call::EgressAdd(3, 20, true)]
        );
    }

    #[test]
    fn test_removal_clears_fdb_before_rules() {
        let (driver, translator) = setup();
        let mut old = VlanBitmap::default();
        old.set(10, false);
        let old_link = slave_link(5, "eth0", 1, old);
        translator.add_interface(&old_link);

        let new_link = slave_link(5, "eth0", 1, VlanBitmap::default());
        translator.update_interface(&old_link, &new_link);

        let calls = driver.calls();
        let tail = &calls[calls.len() - 3..];
        assert_eq!(
            tail,
            &[
                Call::L2RemoveAll(3, 10),
                Call::IngressRemove(3, 10, false),
                Call::EgressRemove(3, 10),
            ]
        );
    }

    #[test]
    fn test_untagged_toggle_is_ignored() {
        // swapping tagged/untagged on an existing member produces no
        // driver calls; only structural membership changes are applied
        let (driver, translator) = setup();
        let mut old = VlanBitmap::default();
        old.set(10, false);
        let mut new = VlanBitmap::default();
        new.set(10, true);

        let old_link = slave_link(5, "eth0", 1, old);
        translator.add_interface(&old_link);
        let before = driver.calls().len();

        translator.update_interface(&old_link, &slave_link(5, "eth0", 1, new));
        assert_eq!(driver.calls().len(), before);
    }

    #[test]
    fn test_rename_of_enslaved_link_is_ignored() {
        let (driver, translator) = setup();
        let mut vlans = VlanBitmap::default();
        vlans.set(10, false);
        let old_link = slave_link(5, "eth0", 1, vlans.clone());
        translator.add_interface(&old_link);
        let before = driver.calls().len();

        let mut renamed = slave_link(5, "lan0", 1, vlans);
        renamed.bridge_vlans.as_mut().unwrap().clear(10);
        translator.update_interface(&old_link, &renamed);
        assert_eq!(driver.calls().len(), before);
    }

    #[test]
    fn test_neighbor_maps_to_registered_port() {
        let (driver, translator) = setup();
        let mac: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        translator.neigh_created(&BridgeNeighbor {
            ifindex: 5,
            vlan: 20,
            mac,
        });
        assert!(driver.calls().contains(&Call::L2Add(3, 20, mac)));
    }

    #[test]
    fn test_neighbor_self_loop_guard() {
        let (driver, translator) = setup();
        translator.neigh_created(&BridgeNeighbor {
            ifindex: 5,
            vlan: 20,
            mac: MacAddress::new([2, 0, 0, 0, 0, 1]),
        });
        assert!(!driver
            .calls()
            .iter()
            .any(|c| matches!(c, Call::L2Add(..))));
    }

    #[test]
    fn test_neighbor_on_unmapped_link_is_ignored() {
        let (driver, translator) = setup();
        translator.neigh_created(&BridgeNeighbor {
            ifindex: 42,
            vlan: 20,
            mac: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
        });
        assert!(!driver
            .calls()
            .iter()
            .any(|c| matches!(c, Call::L2Add(..))));
    }

    #[test]
    fn test_neighbor_vlan_out_of_range_rejected() {
        let (driver, translator) = setup();
        translator.neigh_created(&BridgeNeighbor {
            ifindex: 5,
            vlan: 4095,
            mac: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
        });
        assert!(!driver
            .calls()
            .iter()
            .any(|c| matches!(c, Call::L2Add(..))));
    }
}
