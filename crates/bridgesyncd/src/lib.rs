//! Bridge synchronization daemon.
//!
//! bridgesyncd mirrors the state of one Linux kernel bridge onto a
//! hardware switch: kernel link, VLAN membership and forwarding-database
//! changes arrive over rtnetlink and are translated into calls on the
//! switch-programming contract, while switch-side port announcements
//! materialize as TUN/TAP devices the kernel bridge can enslave.
//!
//! ```text
//! ┌─────────────────┐      ┌──────────────────┐      ┌────────────────┐
//! │  Linux Kernel   │      │   bridgesyncd    │      │     switch     │
//! │                 │      │                  │      │                │
//! │  RTM_NEWLINK    │─────▶│ pump ─▶ cache    │      │                │
//! │  RTM_NEWNEIGH   │      │          │       │      │                │
//! │                 │      │          ▼       │      │                │
//! │  bridge + taps  │      │  translator      │─────▶│  flow/group    │
//! │       ▲         │      │          ▲       │      │  tables        │
//! │       │         │      │          │       │      │                │
//! │  tap frames     │◀────▶│  taps ◀─ nbi     │◀─────│  port events,  │
//! │                 │      │                  │      │  packet-in     │
//! └─────────────────┘      └──────────────────┘      └────────────────┘
//! ```

pub mod bridge;
pub mod cache;
pub mod config;
pub mod error;
pub mod nbi;
pub mod netlink;
pub mod ports;
pub mod pump;
pub mod tap;
pub mod types;

pub use bridge::BridgeStateTranslator;
pub use cache::ObjectCache;
pub use config::BridgesyncConfig;
pub use error::{BridgesyncError, Result};
pub use nbi::NorthboundHandler;
pub use netlink::AsyncNetlinkSocket;
pub use ports::PortRegistry;
pub use pump::{EventPump, PumpHandle, SyncEngine};
pub use tap::TapManager;
pub use types::{BridgeNeighbor, LinkSnapshot, NetlinkEvent, VlanBitmap, VlanDelta};
