//! Controller configuration loaded from JSON

use anyhow::{Context, Result};
use backon::ExponentialBuilder;
use ipnetwork::Ipv4Network;
use mido_sync_common::cidr::nth_address;
use mido_sync_common::defaults::{
    DEFAULT_INTERNAL_NETWORK, DEFAULT_MAX_RETRIES, DEFAULT_MAX_ROUTER_IDS,
    DEFAULT_MAX_ROUTES_PER_SUBNET, DEFAULT_RETRY_MAX_DELAY_MS, DEFAULT_RETRY_MIN_DELAY_MS,
    FIRST_ROUTER_ID, MAX_GATEWAYS,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration validation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// controller_host field is empty
    #[error("controller_host cannot be empty")]
    EmptyControllerHost,

    /// More gateways than the backend supports
    #[error("too many gateways: {count} (max {max})")]
    TooManyGateways { count: usize, max: usize },

    /// Two gateways on the same host
    #[error("gateway host '{0}' is listed more than once")]
    DuplicateGateway(String),

    /// Gateway address outside the public network
    #[error("gateway '{host}' address {address} is outside public_network {network}")]
    GatewayOutsidePublicNetwork {
        host: String,
        address: Ipv4Addr,
        network: Ipv4Network,
    },

    /// Upstream gateway outside the public network
    #[error("public_gateway {gateway} is outside public_network {network}")]
    PublicGatewayOutsideNetwork {
        gateway: Ipv4Addr,
        network: Ipv4Network,
    },

    /// Router IDs would not fit in the internal network
    #[error("max_router_ids {max} does not fit internal_network {network}")]
    RouterIdsExceedNetwork { max: u32, network: Ipv4Network },

    /// Retry delays are inverted
    #[error("retry min_delay_ms ({min}) exceeds max_delay_ms ({max})")]
    InvalidRetryDelays { min: u64, max: u64 },
}

/// One gateway host that carries north-south traffic for all VPCs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Host name as registered with the backend
    pub host: String,
    /// Address of the gateway port on the public network
    pub address: Ipv4Addr,
    /// Host interface the gateway port binds to
    pub interface: String,
}

/// Backoff applied to every backend call
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            min_delay_ms: DEFAULT_RETRY_MIN_DELAY_MS,
            max_delay_ms: DEFAULT_RETRY_MAX_DELAY_MS,
        }
    }
}

impl RetryConfig {
    /// Build the backoff policy
    pub fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.min_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_max_times(self.max_retries)
            .with_jitter()
    }
}

/// Controller configuration loaded from JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MidoConfig {
    /// Host running the controller
    pub controller_host: String,

    /// Base URL of the network-virtualization API
    #[serde(default)]
    pub api_url: Option<String>,

    /// Link network between the global router and VPC routers
    #[serde(default = "default_internal_network")]
    pub internal_network: Ipv4Network,

    /// Public network that elastic IPs and gateways live on
    pub public_network: Ipv4Network,

    /// Upstream router on the public network
    pub public_gateway: Ipv4Addr,

    /// Gateway hosts
    #[serde(default)]
    pub gateways: Vec<GatewayConfig>,

    /// Router ID pool size
    #[serde(default = "default_max_router_ids")]
    pub max_router_ids: u32,

    /// Route entries allowed per subnet
    #[serde(default = "default_max_routes")]
    pub max_routes_per_subnet: usize,

    /// Drop frames whose source MAC is not the instance's own
    #[serde(default = "default_true")]
    pub l2_isolation: bool,

    #[serde(default)]
    pub retry: RetryConfig,

    /// Delete duplicate and orphaned objects at the end of every run
    #[serde(default = "default_true")]
    pub cleanup_after_run: bool,
}

fn default_internal_network() -> Ipv4Network {
    // constant is known-good
    DEFAULT_INTERNAL_NETWORK
        .parse()
        .unwrap_or_else(|_| Ipv4Network::from(Ipv4Addr::new(169, 254, 0, 0)))
}

fn default_max_router_ids() -> u32 {
    DEFAULT_MAX_ROUTER_IDS
}

fn default_max_routes() -> usize {
    DEFAULT_MAX_ROUTES_PER_SUBNET
}

fn default_true() -> bool {
    true
}

impl MidoConfig {
    /// Load and validate configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Minimal configuration with defaults for everything optional
    pub fn new(
        controller_host: impl Into<String>,
        public_network: Ipv4Network,
        public_gateway: Ipv4Addr,
    ) -> Self {
        Self {
            controller_host: controller_host.into(),
            api_url: None,
            internal_network: default_internal_network(),
            public_network,
            public_gateway,
            gateways: Vec::new(),
            max_router_ids: DEFAULT_MAX_ROUTER_IDS,
            max_routes_per_subnet: DEFAULT_MAX_ROUTES_PER_SUBNET,
            l2_isolation: true,
            retry: RetryConfig::default(),
            cleanup_after_run: true,
        }
    }

    /// Validate cross-field constraints
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.controller_host.trim().is_empty() {
            return Err(ConfigError::EmptyControllerHost);
        }

        if self.gateways.len() > MAX_GATEWAYS {
            return Err(ConfigError::TooManyGateways {
                count: self.gateways.len(),
                max: MAX_GATEWAYS,
            });
        }

        let mut seen = BTreeSet::new();
        for gw in &self.gateways {
            if !seen.insert(gw.host.as_str()) {
                return Err(ConfigError::DuplicateGateway(gw.host.clone()));
            }
            if !self.public_network.contains(gw.address) {
                return Err(ConfigError::GatewayOutsidePublicNetwork {
                    host: gw.host.clone(),
                    address: gw.address,
                    network: self.public_network,
                });
            }
        }

        if !self.public_network.contains(self.public_gateway) {
            return Err(ConfigError::PublicGatewayOutsideNetwork {
                gateway: self.public_gateway,
                network: self.public_network,
            });
        }

        // The highest router ID must still be a host address on the link network
        let highest = self.max_router_ids.saturating_sub(1);
        if self.max_router_ids <= FIRST_ROUTER_ID
            || nth_address(self.internal_network, highest.saturating_add(1)).is_none()
        {
            return Err(ConfigError::RouterIdsExceedNetwork {
                max: self.max_router_ids,
                network: self.internal_network,
            });
        }

        if self.retry.min_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::InvalidRetryDelays {
                min: self.retry.min_delay_ms,
                max: self.retry.max_delay_ms,
            });
        }

        Ok(())
    }

    /// Address of the global router on the internal network
    pub fn eucart_address(&self) -> Option<Ipv4Addr> {
        nth_address(self.internal_network, 1)
    }

    /// Address of a VPC or NAT gateway router on the internal network
    pub fn router_address(&self, router_id: u32) -> Option<Ipv4Addr> {
        if router_id < FIRST_ROUTER_ID {
            return None;
        }
        nth_address(self.internal_network, router_id)
    }

    /// `address` with the internal network's prefix
    pub fn internal_port_network(&self, address: Ipv4Addr) -> Option<Ipv4Network> {
        Ipv4Network::new(address, self.internal_network.prefix()).ok()
    }

    /// `address` with the public network's prefix
    pub fn public_port_network(&self, address: Ipv4Addr) -> Option<Ipv4Network> {
        Ipv4Network::new(address, self.public_network.prefix()).ok()
    }
}
