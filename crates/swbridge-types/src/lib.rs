//! Shared types for the swbridge control-plane bridge.
//!
//! This crate holds the value types that cross component boundaries
//! (MAC addresses, VLAN ids, packet buffers) and the two external
//! contracts of the system:
//!
//! - [`contract::SwitchDriver`]: the switch-programming contract consumed
//!   by the bridge-state translator and implemented by the flow-table
//!   driver over the control channel.
//! - [`contract::Northbound`]: the notification contract implemented by
//!   the daemon and driven by the control-channel connection (port
//!   add/delete, status changes, packet-in).

pub mod contract;
pub mod mac;
pub mod pool;
pub mod vlan;

pub use contract::{
    DriverStatus, Northbound, PortEvent, PortId, PortNotification, PortStatus, SwitchCapability,
    SwitchDriver,
};
pub use mac::MacAddress;
pub use pool::{PacketBuffer, PacketPool, PoolExhausted};
pub use vlan::VlanId;
