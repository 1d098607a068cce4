//! mido-sync - cloud network model to SDN topology reconciler
//!
//! Reads a desired-state network model (VPCs, subnets, instance interfaces,
//! security groups, NAT gateways) and drives a network-virtualization
//! backend until its routers, bridges, ports, chains and address groups
//! match. Every created object is tagged so the topology can be rebuilt
//! from the backend alone.

pub mod backend;
pub mod config;
pub mod error;
pub mod reconcile;
pub mod routes;
pub mod rules;
pub mod topology;

pub use error::{SyncError, SyncResult};
pub use reconcile::{Reconciler, RunReport};
