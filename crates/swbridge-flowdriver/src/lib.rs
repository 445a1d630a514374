//! Flow/group programming primitives for the staged forwarding pipeline.
//!
//! The crate is organized into several modules:
//!
//! - [`tables`]: pipeline table ids and flow priorities
//! - [`groups`]: deterministic bit-packed group-table ids
//! - [`messages`]: typed flow-mod/group-mod intents and their builders
//! - [`driver`]: [`driver::FlowTableDriver`], the switch-programming
//!   contract implementation over a [`driver::ControlChannel`]

pub mod driver;
pub mod groups;
pub mod messages;
pub mod tables;

pub use driver::{ControlChannel, FlowTableDriver, TracingChannel};
pub use groups::GroupId;
pub use messages::{Action, FlowMatch, FlowMod, GroupBucket, GroupMod, GroupType, ModCommand};
pub use tables::TableId;
