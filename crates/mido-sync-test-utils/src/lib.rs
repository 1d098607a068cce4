//! Shared test utilities for mido-sync
//!
//! This crate provides common test helpers that can be used across
//! multiple test modules without circular dependencies.
//!
//! ## Modules
//!
//! - [`config`]: Controller configuration documents for tests
//! - [`model`]: Desired-state model builder
//! - [`names`]: Unique entity names and addresses

pub mod config;
pub mod model;
pub mod names;

// Re-export commonly used items
pub use config::{TEST_GATEWAY, TEST_NODE, test_config_json};
pub use model::{ModelBuilder, group_rule, interface, tcp_rule};
pub use names::{test_mac, unique_name};
