//! Shared fixtures for entity unit tests

use super::core::{Core, CoreLinks};
use super::router_id::RouterIdPool;
use super::subnet::{Subnet, SubnetLinks};
use super::vpc::{Vpc, VpcLinks};
use crate::backend::{Inventory, MemoryApi, MidoClient, ObjectId};
use crate::config::{GatewayConfig, MidoConfig, RetryConfig};
use mido_sync_common::gni::GniSubnet;
use mido_sync_common::tags::{TAG_ENTITY, entity};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

pub const NODE: &str = "node-1";
pub const VPC: &str = "vpc-1";
pub const VPC_CIDR: &str = "10.0.0.0/16";

pub fn config() -> MidoConfig {
    let mut config = MidoConfig::new(
        "clc-1",
        "203.0.113.0/24".parse().unwrap(),
        Ipv4Addr::new(203, 0, 113, 1),
    );
    config.gateways = vec![GatewayConfig {
        host: "gw-a".to_string(),
        address: Ipv4Addr::new(203, 0, 113, 10),
        interface: "eth1".to_string(),
    }];
    config.retry = RetryConfig {
        max_retries: 2,
        min_delay_ms: 1,
        max_delay_ms: 2,
    };
    config
}

pub fn gni_subnet(name: &str, cidr: &str) -> GniSubnet {
    GniSubnet {
        name: name.to_string(),
        cidr: cidr.to_string(),
        route_table: None,
    }
}

/// A backend with the core built and one compute host registered
pub struct Fixture {
    pub api: MemoryApi,
    pub client: MidoClient<MemoryApi>,
    pub config: MidoConfig,
    pub core: CoreLinks,
    pub router_ids: RouterIdPool,
}

impl Fixture {
    pub async fn new() -> Self {
        let api = MemoryApi::new();
        api.add_host(NODE);
        let config = config();
        let client = MidoClient::new(api.clone(), config.retry.clone());
        let mut core = Core::new();
        core.ensure(&client, &config).await.unwrap();
        let core = core.links(&config).unwrap();
        let router_ids = RouterIdPool::new(config.max_router_ids);
        Self {
            api,
            client,
            config,
            core,
            router_ids,
        }
    }

    pub async fn vpc(&mut self) -> (Vpc, VpcLinks) {
        let mut vpc = Vpc::new(VPC);
        vpc.presence.gnipresent = true;
        vpc.ensure(&self.client, &self.config, &self.core, &mut self.router_ids)
            .await
            .unwrap();
        let links = vpc.links(VPC_CIDR, &self.config).unwrap();
        (vpc, links)
    }

    pub async fn subnet(&self, vpc: &VpcLinks, name: &str, cidr: &str) -> (Subnet, SubnetLinks) {
        let mut subnet = Subnet::new(name, &vpc.name);
        subnet.presence.gnipresent = true;
        let links = subnet
            .ensure(&self.client, &Default::default(), vpc, &gni_subnet(name, cidr))
            .await
            .unwrap();
        (subnet, links)
    }

    pub async fn scan(&self) -> Inventory {
        Inventory::scan(&self.client).await.unwrap()
    }

    /// Ids a populate pass would already know before reaching VPC-level
    /// entities: hosts and core objects
    pub fn known(&self, inventory: &Inventory) -> BTreeSet<ObjectId> {
        inventory
            .host_ids()
            .cloned()
            .chain(
                inventory
                    .managed()
                    .filter(|o| o.tag(TAG_ENTITY) == Some(entity::CORE))
                    .map(|o| o.id.clone()),
            )
            .collect()
    }
}
