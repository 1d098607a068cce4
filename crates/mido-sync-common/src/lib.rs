//! mido-sync-common - Shared types and utilities
//!
//! Backend-independent pieces used by the controller and its test fixtures.
//!
//! ## Modules
//!
//! - [`cidr`]: CIDR splitting and address arithmetic
//! - [`defaults`]: Default configuration values
//! - [`gni`]: Desired-state network model
//! - [`object_kind`]: Backend object kinds and cleanup ordering
//! - [`route_target`]: Route-table target classification
//! - [`tags`]: Backend tag schema for discovery and cleanup

pub mod cidr;
pub mod defaults;
pub mod gni;
pub mod object_kind;
pub mod route_target;
pub mod tags;

pub use cidr::{CidrError, CidrParts, split_cidr};
pub use gni::GlobalNetworkInfo;
pub use object_kind::ObjectKind;
pub use route_target::{RouteTarget, classify_route_target};
pub use tags::Tags;
