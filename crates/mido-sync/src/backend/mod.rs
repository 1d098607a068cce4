//! Network-virtualization backend boundary
//!
//! - [`operations::MidoApi`]: the three calls the controller needs
//! - [`client::MidoClient`]: retries, conflict adoption and counters
//! - [`memory::MemoryApi`] / [`http::HttpApi`]: implementations
//! - [`inventory::Inventory`]: indexed snapshot used by populate and cleanup

pub mod client;
pub mod error;
pub mod http;
pub mod inventory;
pub mod memory;
pub mod object;
pub mod operations;

pub use client::{ClientStats, MidoClient};
pub use error::BackendError;
pub use http::HttpApi;
pub use inventory::Inventory;
pub use memory::{CallCounters, MemoryApi, MemoryOp};
pub use object::{
    DhcpSubnetSpec, MidoObject, NewObject, ObjectId, ObjectSpec, PortRange, PortSpec, RouteSpec,
    RuleAction, RuleMatch, RuleSpec,
};
pub use operations::MidoApi;
