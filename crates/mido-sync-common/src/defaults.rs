//! Default configuration values

use std::net::Ipv4Addr;

/// Internal link network between the global router and VPC routers
pub const DEFAULT_INTERNAL_NETWORK: &str = "169.254.0.0/17";

/// Router IDs 0 and 1 are the internal network address and the global router
pub const FIRST_ROUTER_ID: u32 = 2;

/// Router ID pool size
pub const DEFAULT_MAX_ROUTER_IDS: u32 = 10240;

/// Route entries per subnet
pub const DEFAULT_MAX_ROUTES_PER_SUBNET: usize = 50;

/// The backend's port groups and host lists top out here
pub const MAX_GATEWAYS: usize = 32;

/// Instance metadata service address
pub const METADATA_IP: Ipv4Addr = Ipv4Addr::new(169, 254, 169, 254);

/// Backend API retries before an entity is left unconverged
pub const DEFAULT_MAX_RETRIES: usize = 4;

/// First retry delay in milliseconds
pub const DEFAULT_RETRY_MIN_DELAY_MS: u64 = 200;

/// Retry delay cap in milliseconds
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 5_000;
