//! In-memory mirror of the managed topology
//!
//! Each entity kind owns a table of named backend objects, fills it from
//! backend tags ([`Context::populate`]) and knows how to create, repair
//! and delete its objects in dependency order.

pub mod context;
pub mod core;
pub mod instance;
pub mod natgateway;
mod populate;
pub mod router_id;
pub mod secgroup;
pub mod slots;
pub mod subnet;
#[cfg(test)]
pub(crate) mod testing;
pub mod vpc;

pub use context::Context;
pub use self::core::{Core, CoreLinks};
pub use instance::{Instance, InstanceFlags};
pub use natgateway::NatGateway;
pub use router_id::RouterIdPool;
pub use secgroup::SecGroup;
pub use slots::{EntityState, Presence};
pub use subnet::{Subnet, SubnetLinks};
pub use vpc::{Vpc, VpcLinks};
