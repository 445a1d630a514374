//! The two external contracts of the agent.
//!
//! [`SwitchDriver`] is the switch-programming contract: the bridge-state
//! translator calls it, the flow-table driver implements it over the
//! control channel. [`Northbound`] is the notification contract the
//! control-channel connection drives back into the daemon (port add/del,
//! status changes, packet-in).

use std::fmt;
use std::sync::Arc;

use crate::mac::MacAddress;
use crate::pool::PacketBuffer;
use crate::vlan::VlanId;

/// Opaque hardware port identifier as reported by the switch.
pub type PortId = u32;

/// Result code for a programming-contract operation.
///
/// Every non-`Ok` value is recoverable by design: callers log and
/// continue, relying on idempotent re-issue plus periodic resync to
/// converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverStatus {
    Ok,
    /// Control channel is down; the operation was not issued.
    NotConnected,
    /// Parameters rejected before any message was built.
    Invalid,
    /// Referenced port/group/entry does not exist on the driver side.
    NotFound,
}

impl DriverStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, DriverStatus::Ok)
    }
}

impl fmt::Display for DriverStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DriverStatus::Ok => "ok",
            DriverStatus::NotConnected => "not connected",
            DriverStatus::Invalid => "invalid",
            DriverStatus::NotFound => "not found",
        };
        f.write_str(s)
    }
}

/// Packet classes the driver can be asked to copy to the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwitchCapability {
    /// ARP broadcast trap: matching frames go to the controller and to
    /// the VLAN's flood group.
    Arp,
}

/// The switch-programming contract (consumed by the translator).
///
/// Implementations must be non-blocking: each call builds a message,
/// hands it to the control channel, and returns a status. Callers treat
/// any non-success as "log and continue", never as fatal.
pub trait SwitchDriver: Send + Sync {
    fn l2_addr_add(&self, port: PortId, vlan: VlanId, mac: MacAddress) -> DriverStatus;
    fn l2_addr_remove(&self, port: PortId, vlan: VlanId, mac: MacAddress) -> DriverStatus;
    /// Clears every unicast bridging rule pinned to `(port, vlan)`.
    fn l2_addr_remove_all_in_vlan(&self, port: PortId, vlan: VlanId) -> DriverStatus;

    /// Port accepts any tagged frame without per-VLAN filtering.
    fn ingress_port_vlan_accept_all(&self, port: PortId) -> DriverStatus;
    fn ingress_port_vlan_drop_accept_all(&self, port: PortId) -> DriverStatus;
    /// Per-(port, VLAN) ingress rule; `pvid` additionally tags untagged
    /// ingress frames with this VLAN id.
    fn ingress_port_vlan_add(&self, port: PortId, vlan: VlanId, pvid: bool) -> DriverStatus;
    fn ingress_port_vlan_remove(&self, port: PortId, vlan: VlanId, pvid: bool) -> DriverStatus;

    /// Marks the port as an unfiltered L2 output interface.
    fn egress_port_vlan_accept_all(&self, port: PortId) -> DriverStatus;
    fn egress_port_vlan_drop_accept_all(&self, port: PortId) -> DriverStatus;
    /// Creates the (port, VLAN) L2-interface group (strip tag when
    /// `untagged`) and folds the port into the VLAN's flood group.
    fn egress_port_vlan_add(&self, port: PortId, vlan: VlanId, untagged: bool) -> DriverStatus;
    fn egress_port_vlan_remove(&self, port: PortId, vlan: VlanId, untagged: bool) -> DriverStatus;

    fn subscribe_to(&self, capability: SwitchCapability) -> DriverStatus;

    /// Sends a frame out of the given hardware port. The buffer is
    /// consumed either way; the driver returns it to its pool.
    fn enqueue(&self, port: PortId, buffer: PacketBuffer) -> DriverStatus;
}

/// Port lifecycle events reported by the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    Add,
    Del,
}

/// One entry of a port add/delete notification batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortNotification {
    pub event: PortEvent,
    pub port_id: PortId,
    pub name: String,
}

/// Operational/administrative status bitmask for a hardware port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortStatus(u32);

impl PortStatus {
    pub const LOWER_DOWN: u32 = 0x01;
    pub const ADMIN_DOWN: u32 = 0x02;

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(&self) -> u32 {
        self.0
    }

    pub fn is_lower_down(&self) -> bool {
        self.0 & Self::LOWER_DOWN != 0
    }

    pub fn is_admin_down(&self) -> bool {
        self.0 & Self::ADMIN_DOWN != 0
    }

    pub fn is_up(&self) -> bool {
        self.0 & (Self::LOWER_DOWN | Self::ADMIN_DOWN) == 0
    }
}

/// The north-bound notification contract (implemented by the daemon).
pub trait Northbound: Send + Sync {
    /// Hands the daemon the live programming contract after connect.
    fn register_switch(&self, driver: Arc<dyn SwitchDriver>);

    /// Asks the daemon to re-announce all current links and neighbors,
    /// typically after a control-channel reconnect.
    fn resend_state(&self);

    fn port_notification(&self, notifications: Vec<PortNotification>);

    fn port_status_changed(&self, port: PortId, status: PortStatus);

    /// Delivers a frame received on a hardware port to the matching
    /// virtual device.
    fn enqueue(&self, port: PortId, buffer: PacketBuffer) -> DriverStatus;
}
