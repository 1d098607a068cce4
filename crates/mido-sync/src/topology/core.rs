//! Core infrastructure shared by every VPC
//!
//! The global router ("eucart") and global bridge ("eucabr") link every VPC
//! router to the gateway hosts. Each configured gateway gets a port on the
//! global router, a host binding, port-group membership and a default route
//! towards the upstream gateway.

use super::slots::{Owner, Presence, SlotKey, SlotTable};
use crate::backend::{
    Inventory, MidoApi, MidoClient, ObjectId, ObjectSpec, PortSpec, RouteSpec,
};
use crate::config::{GatewayConfig, MidoConfig};
use crate::error::{SyncError, SyncResult};
use mido_sync_common::cidr::default_route;
use mido_sync_common::defaults::METADATA_IP;
use mido_sync_common::tags::{CORE_OWNER, entity};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CoreSlot {
    EucabrInFilter,
    MetadataIpAddrGroup,
    MetadataIpAddr,
    Eucart,
    Eucabr,
    EucartBrPort,
    EucabrRtPort,
    GwPortGroup,
}

impl SlotKey for CoreSlot {
    const ALL: &'static [Self] = &[
        CoreSlot::EucabrInFilter,
        CoreSlot::MetadataIpAddrGroup,
        CoreSlot::MetadataIpAddr,
        CoreSlot::Eucart,
        CoreSlot::Eucabr,
        CoreSlot::EucartBrPort,
        CoreSlot::EucabrRtPort,
        CoreSlot::GwPortGroup,
    ];

    fn as_str(self) -> &'static str {
        match self {
            CoreSlot::EucabrInFilter => "eucabr_infilter",
            CoreSlot::MetadataIpAddrGroup => "metadata_ipaddrgroup",
            CoreSlot::MetadataIpAddr => "metadata_ipaddr",
            CoreSlot::Eucart => "eucart",
            CoreSlot::Eucabr => "eucabr",
            CoreSlot::EucartBrPort => "eucart_brport",
            CoreSlot::EucabrRtPort => "eucabr_rtport",
            CoreSlot::GwPortGroup => "gw_portgroup",
        }
    }
}

/// Per-gateway slots, keyed by host name
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum GatewaySlot {
    Port,
    Binding,
    Member,
    DefaultRoute,
}

impl SlotKey for GatewaySlot {
    const ALL: &'static [Self] = &[
        GatewaySlot::Port,
        GatewaySlot::Binding,
        GatewaySlot::Member,
        GatewaySlot::DefaultRoute,
    ];

    fn as_str(self) -> &'static str {
        match self {
            GatewaySlot::Port => "gw_port",
            GatewaySlot::Binding => "gw_binding",
            GatewaySlot::Member => "gw_member",
            GatewaySlot::DefaultRoute => "gw_default_route",
        }
    }
}

/// Core object ids that VPC-level entities link to
#[derive(Debug, Clone)]
pub struct CoreLinks {
    pub eucart: ObjectId,
    pub eucabr: ObjectId,
    pub eucart_br_port: ObjectId,
    pub metadata_group: ObjectId,
    pub eucart_address: Ipv4Addr,
}

#[derive(Debug, Clone)]
pub struct Core {
    pub owner: Owner,
    pub presence: Presence,
    pub slots: SlotTable<CoreSlot>,
    /// Host name -> gateway slots
    pub gateways: BTreeMap<String, SlotTable<GatewaySlot>>,
}

impl Default for Core {
    fn default() -> Self {
        Self::new()
    }
}

impl Core {
    pub fn new() -> Self {
        Self {
            owner: Owner::new(entity::CORE, CORE_OWNER, None),
            presence: Presence {
                gnipresent: true,
                ..Default::default()
            },
            slots: SlotTable::new(),
            gateways: BTreeMap::new(),
        }
    }

    /// Rebuild from backend tags
    pub fn populate(&mut self, inventory: &Inventory, known: &mut BTreeSet<ObjectId>) {
        let candidates = inventory.owned_by(entity::CORE, CORE_OWNER, None);
        let filled = self.slots.populate(&candidates, known);
        self.presence = Presence::from_population(filled, CoreSlot::ALL.len());
        self.presence.gnipresent = true;

        let hosts: BTreeSet<&str> = candidates
            .iter()
            .filter(|c| {
                c.slot()
                    .is_some_and(|s| GatewaySlot::ALL.iter().any(|g| g.as_str() == s))
            })
            .filter_map(|c| c.key())
            .collect();
        self.gateways.clear();
        for host in hosts {
            let mut table = SlotTable::keyed(host);
            table.populate(&candidates, known);
            self.gateways.insert(host.to_string(), table);
        }
    }

    /// Ids needed by VPCs, subnets and instances
    pub fn links(&self, config: &MidoConfig) -> SyncResult<CoreLinks> {
        let eucart_address = config
            .eucart_address()
            .ok_or_else(|| SyncError::MalformedInput("internal network has no host addresses".into()))?;
        Ok(CoreLinks {
            eucart: self.slots.require(CoreSlot::Eucart, &self.owner)?,
            eucabr: self.slots.require(CoreSlot::Eucabr, &self.owner)?,
            eucart_br_port: self.slots.require(CoreSlot::EucartBrPort, &self.owner)?,
            metadata_group: self.slots.require(CoreSlot::MetadataIpAddrGroup, &self.owner)?,
            eucart_address,
        })
    }

    /// Create or repair the shared objects
    pub async fn ensure<A: MidoApi>(
        &mut self,
        client: &MidoClient<A>,
        config: &MidoConfig,
    ) -> SyncResult<()> {
        if !self.slots.is_complete() {
            info!(missing = ?self.slots.missing(), "Repairing core infrastructure");
        }
        let o = &self.owner;
        let s = &mut self.slots;
        let eucart_address = config
            .eucart_address()
            .and_then(|a| config.internal_port_network(a))
            .ok_or_else(|| SyncError::MalformedInput("internal network has no host addresses".into()))?;

        let infilter = s
            .ensure(
                client,
                CoreSlot::EucabrInFilter,
                o.object(CoreSlot::EucabrInFilter.as_str(), None, "eucabr_infilter", ObjectSpec::Chain),
            )
            .await?;
        let metadata = s
            .ensure(
                client,
                CoreSlot::MetadataIpAddrGroup,
                o.object(
                    CoreSlot::MetadataIpAddrGroup.as_str(),
                    None,
                    "metadata_ip",
                    ObjectSpec::IpAddrGroup,
                ),
            )
            .await?;
        s.ensure(
            client,
            CoreSlot::MetadataIpAddr,
            o.object(
                CoreSlot::MetadataIpAddr.as_str(),
                None,
                "metadata_ip_addr",
                ObjectSpec::IpAddrGroupAddr {
                    group: metadata,
                    addr: METADATA_IP,
                },
            ),
        )
        .await?;
        let eucart = s
            .ensure(
                client,
                CoreSlot::Eucart,
                o.object(
                    CoreSlot::Eucart.as_str(),
                    None,
                    "eucart",
                    ObjectSpec::Router {
                        inbound_filter: None,
                        outbound_filter: None,
                    },
                ),
            )
            .await?;
        let eucabr = s
            .ensure(
                client,
                CoreSlot::Eucabr,
                o.object(
                    CoreSlot::Eucabr.as_str(),
                    None,
                    "eucabr",
                    ObjectSpec::Bridge {
                        inbound_filter: Some(infilter),
                    },
                ),
            )
            .await?;
        let rt_port = s
            .ensure(
                client,
                CoreSlot::EucartBrPort,
                o.object(
                    CoreSlot::EucartBrPort.as_str(),
                    None,
                    "eucart_brport",
                    ObjectSpec::Port(PortSpec {
                        device: eucart,
                        address: Some(eucart_address),
                        ..Default::default()
                    }),
                ),
            )
            .await?;
        s.ensure(
            client,
            CoreSlot::EucabrRtPort,
            o.object(
                CoreSlot::EucabrRtPort.as_str(),
                None,
                "eucabr_rtport",
                ObjectSpec::Port(PortSpec {
                    device: eucabr,
                    peer: Some(rt_port),
                    ..Default::default()
                }),
            ),
        )
        .await?;
        s.ensure(
            client,
            CoreSlot::GwPortGroup,
            o.object(CoreSlot::GwPortGroup.as_str(), None, "eucart_gw_pg", ObjectSpec::PortGroup),
        )
        .await?;

        self.presence.midopresent = true;
        self.presence.population_failed = false;
        Ok(())
    }

    /// Reconcile the gateway set with the configuration.
    ///
    /// Removed gateways are torn down first; each configured gateway is
    /// then synced independently and gets its own result.
    pub async fn sync_gateways<A: MidoApi>(
        &mut self,
        client: &MidoClient<A>,
        config: &MidoConfig,
        inventory: &Inventory,
    ) -> Vec<(String, SyncResult<()>)> {
        let mut results = Vec::new();

        let removed: Vec<String> = self
            .gateways
            .keys()
            .filter(|host| !config.gateways.iter().any(|g| &g.host == *host))
            .cloned()
            .collect();
        for host in removed {
            info!(host = %host, "Removing gateway");
            if let Some(table) = self.gateways.get_mut(&host) {
                let result = table.delete_all(client).await;
                if result.is_ok() {
                    self.gateways.remove(&host);
                }
                results.push((host, result));
            }
        }

        for gateway in &config.gateways {
            let result = self.ensure_gateway(client, config, inventory, gateway).await;
            if let Err(e) = &result {
                warn!(host = %gateway.host, error = %e, "Gateway not converged");
            }
            results.push((gateway.host.clone(), result));
        }
        results
    }

    async fn ensure_gateway<A: MidoApi>(
        &mut self,
        client: &MidoClient<A>,
        config: &MidoConfig,
        inventory: &Inventory,
        gateway: &GatewayConfig,
    ) -> SyncResult<()> {
        let host_id = inventory
            .host_id(&gateway.host)
            .cloned()
            .ok_or_else(|| SyncError::HostNotFound(gateway.host.clone()))?;
        let eucart = self.slots.require(CoreSlot::Eucart, &self.owner)?;
        let port_group = self.slots.require(CoreSlot::GwPortGroup, &self.owner)?;
        let address = config.public_port_network(gateway.address).ok_or_else(|| {
            SyncError::MalformedInput(format!("gateway address {}", gateway.address))
        })?;

        let o = &self.owner;
        let host = gateway.host.as_str();
        let table = self
            .gateways
            .entry(gateway.host.clone())
            .or_insert_with(|| SlotTable::keyed(host));

        let port = table
            .ensure(
                client,
                GatewaySlot::Port,
                o.object(
                    GatewaySlot::Port.as_str(),
                    Some(host),
                    format!("eucart_gw_{host}"),
                    ObjectSpec::Port(PortSpec {
                        device: eucart.clone(),
                        address: Some(address),
                        ..Default::default()
                    }),
                ),
            )
            .await?;
        table
            .ensure(
                client,
                GatewaySlot::Binding,
                o.object(
                    GatewaySlot::Binding.as_str(),
                    Some(host),
                    format!("eucart_gw_{host}_binding"),
                    ObjectSpec::HostBinding {
                        host: host_id,
                        port: port.clone(),
                        interface: gateway.interface.clone(),
                    },
                ),
            )
            .await?;
        table
            .ensure(
                client,
                GatewaySlot::Member,
                o.object(
                    GatewaySlot::Member.as_str(),
                    Some(host),
                    format!("eucart_gw_{host}_member"),
                    ObjectSpec::PortGroupPort {
                        group: port_group,
                        port: port.clone(),
                    },
                ),
            )
            .await?;
        let any = default_route();
        table
            .ensure(
                client,
                GatewaySlot::DefaultRoute,
                o.object(
                    GatewaySlot::DefaultRoute.as_str(),
                    Some(host),
                    format!("eucart_gw_{host}_default"),
                    ObjectSpec::Route(RouteSpec {
                        router: eucart,
                        src: any,
                        dst: any,
                        next_hop_port: port,
                        next_hop_gateway: Some(config.public_gateway),
                        weight: 100,
                    }),
                ),
            )
            .await?;
        Ok(())
    }

    /// Delete gateways and shared objects
    pub async fn delete<A: MidoApi>(&mut self, client: &MidoClient<A>) -> SyncResult<()> {
        for table in self.gateways.values_mut() {
            table.delete_all(client).await?;
        }
        self.gateways.clear();
        self.slots.delete_all(client).await?;
        self.presence.midopresent = false;
        self.presence.population_failed = false;
        Ok(())
    }

    /// Every object id held by the core
    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.slots
            .ids()
            .chain(self.gateways.values().flat_map(|t| t.ids()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryApi;
    use mido_sync_common::ObjectKind;
    use crate::config::RetryConfig;

    fn config() -> MidoConfig {
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
        config
    }

    async fn scan(client: &MidoClient<MemoryApi>) -> Inventory {
        Inventory::scan(client).await.unwrap()
    }

    #[tokio::test]
    async fn test_ensure_then_populate_is_complete() {
        let api = MemoryApi::new();
        api.add_host("gw-a");
        let client = MidoClient::new(api.clone(), RetryConfig::default());
        let config = config();

        let mut core = Core::new();
        core.ensure(&client, &config).await.unwrap();
        let inventory = scan(&client).await;
        let results = core.sync_gateways(&client, &config, &inventory).await;
        assert!(results.iter().all(|(_, r)| r.is_ok()));
        assert_eq!(api.objects_of(ObjectKind::Route).len(), 1);

        let inventory = scan(&client).await;
        let mut known: BTreeSet<ObjectId> = inventory.host_ids().cloned().collect();
        let mut rebuilt = Core::new();
        rebuilt.populate(&inventory, &mut known);
        assert!(rebuilt.presence.midopresent);
        assert!(rebuilt.gateways["gw-a"].is_complete());
        assert_eq!(rebuilt.ids().count(), core.ids().count());

        let links = rebuilt.links(&config).unwrap();
        assert_eq!(links.eucart_address, Ipv4Addr::new(169, 254, 0, 1));
    }

    #[tokio::test]
    async fn test_missing_gateway_host() {
        let api = MemoryApi::new();
        let client = MidoClient::new(api, RetryConfig::default());
        let config = config();

        let mut core = Core::new();
        core.ensure(&client, &config).await.unwrap();
        let inventory = scan(&client).await;
        let results = core.sync_gateways(&client, &config, &inventory).await;
        assert_eq!(results.len(), 1);
        assert!(matches!(&results[0].1, Err(SyncError::HostNotFound(h)) if h == "gw-a"));
    }

    #[tokio::test]
    async fn test_removed_gateway_is_torn_down() {
        let api = MemoryApi::new();
        api.add_host("gw-a");
        let client = MidoClient::new(api.clone(), RetryConfig::default());
        let mut config = config();

        let mut core = Core::new();
        core.ensure(&client, &config).await.unwrap();
        let inventory = scan(&client).await;
        core.sync_gateways(&client, &config, &inventory).await;

        config.gateways.clear();
        let results = core.sync_gateways(&client, &config, &inventory).await;
        assert_eq!(results.len(), 1);
        assert!(core.gateways.is_empty());
        assert!(api.objects_of(ObjectKind::HostBinding).is_empty());
        assert!(api.objects_of(ObjectKind::Route).is_empty());
    }

    #[tokio::test]
    async fn test_partial_core_is_repaired() {
        let api = MemoryApi::new();
        let client = MidoClient::new(api.clone(), RetryConfig::default());
        let config = config();

        let mut core = Core::new();
        core.ensure(&client, &config).await.unwrap();
        let group = core.slots.id(CoreSlot::GwPortGroup).cloned().unwrap();
        client.delete_by_id(ObjectKind::PortGroup, &group).await.unwrap();

        let inventory = scan(&client).await;
        let mut known = BTreeSet::new();
        let mut rebuilt = Core::new();
        rebuilt.populate(&inventory, &mut known);
        assert!(rebuilt.presence.population_failed);
        assert_eq!(rebuilt.slots.missing(), vec![CoreSlot::GwPortGroup]);

        api.reset_counters();
        rebuilt.ensure(&client, &config).await.unwrap();
        assert_eq!(api.counters().creates, 1);
    }
}
