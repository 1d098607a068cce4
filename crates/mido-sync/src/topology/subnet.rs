//! Subnet: a bridge behind a VPC router port, with DHCP and routes

use super::instance::Instance;
use super::natgateway::NatGateway;
use super::slots::{ObjectMap, Owner, Presence, SlotKey, SlotTable};
use super::vpc::VpcLinks;
use crate::backend::{
    DhcpSubnetSpec, Inventory, MidoApi, MidoClient, NewObject, ObjectId, ObjectSpec, PortSpec,
    RouteSpec,
};
use crate::error::{SyncError, SyncResult};
use crate::routes::RouteHop;
use ipnetwork::Ipv4Network;
use mido_sync_common::gni::{GlobalNetworkInfo, GniSubnet};
use mido_sync_common::tags::entity;
use mido_sync_common::{CidrParts, split_cidr};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};

/// Slot name shared by every route a subnet owns
const ROUTE_SLOT: &str = "route";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SubnetSlot {
    Bridge,
    VpcRtBrPort,
    BrRtPort,
    BrDhcp,
    BrMetaPort,
}

impl SlotKey for SubnetSlot {
    const ALL: &'static [Self] = &[
        SubnetSlot::Bridge,
        SubnetSlot::VpcRtBrPort,
        SubnetSlot::BrRtPort,
        SubnetSlot::BrDhcp,
        SubnetSlot::BrMetaPort,
    ];

    fn as_str(self) -> &'static str {
        match self {
            SubnetSlot::Bridge => "bridge",
            SubnetSlot::VpcRtBrPort => "vpcrt_brport",
            SubnetSlot::BrRtPort => "br_rtport",
            SubnetSlot::BrDhcp => "br_dhcp",
            SubnetSlot::BrMetaPort => "br_metaport",
        }
    }
}

/// Subnet object ids that instances and NAT gateways link to
#[derive(Debug, Clone)]
pub struct SubnetLinks {
    pub name: String,
    pub bridge: ObjectId,
    pub dhcp: ObjectId,
    /// VPC router port on this subnet, the next hop for routes into it
    pub vpc_rt_br_port: ObjectId,
    pub parts: CidrParts,
}

#[derive(Debug, Clone)]
pub struct Subnet {
    pub owner: Owner,
    pub presence: Presence,
    pub slots: SlotTable<SubnetSlot>,
    /// Destination CIDR -> route on the VPC router
    pub routes: ObjectMap,
    pub instances: BTreeMap<String, Instance>,
    pub nat_gateways: BTreeMap<String, NatGateway>,
}

impl Subnet {
    pub fn new(name: &str, vpc: &str) -> Self {
        Self {
            owner: Owner::new(entity::SUBNET, name, Some(vpc.to_string())),
            presence: Presence::default(),
            slots: SlotTable::new(),
            routes: ObjectMap::new(ROUTE_SLOT),
            instances: BTreeMap::new(),
            nat_gateways: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.owner.name
    }

    pub fn vpc(&self) -> &str {
        self.owner.parent.as_deref().unwrap_or_default()
    }

    /// Rebuild the bridge, ports and DHCP from backend tags
    pub fn populate_slots(&mut self, inventory: &Inventory, known: &mut BTreeSet<ObjectId>) {
        let candidates = inventory.owned_by(entity::SUBNET, self.name(), Some(self.vpc()));
        let filled = self.slots.populate(&candidates, known);
        self.presence = Presence::from_population(filled, SubnetSlot::ALL.len());
    }

    /// Rebuild routes from backend tags.
    ///
    /// A route's next hop may be a sibling subnet's router port, so every
    /// subnet of the VPC must have its slots populated first.
    pub fn populate_routes(&mut self, inventory: &Inventory, known: &mut BTreeSet<ObjectId>) {
        let candidates = inventory.owned_by(entity::SUBNET, self.name(), Some(self.vpc()));
        self.routes.populate(&candidates, known);
    }

    pub fn links(&self, cidr: &str) -> SyncResult<SubnetLinks> {
        Ok(SubnetLinks {
            name: self.name().to_string(),
            bridge: self.slots.require(SubnetSlot::Bridge, &self.owner)?,
            dhcp: self.slots.require(SubnetSlot::BrDhcp, &self.owner)?,
            vpc_rt_br_port: self.slots.require(SubnetSlot::VpcRtBrPort, &self.owner)?,
            parts: split_cidr(cidr)?,
        })
    }

    /// Create or repair the bridge, its link to the VPC router and DHCP.
    ///
    /// DHCP hands out the model's DNS servers, or the subnet's +2 address
    /// when the model names none.
    pub async fn ensure<A: MidoApi>(
        &mut self,
        client: &MidoClient<A>,
        gni: &GlobalNetworkInfo,
        vpc: &VpcLinks,
        subnet: &GniSubnet,
    ) -> SyncResult<SubnetLinks> {
        let parts = split_cidr(&subnet.cidr)?;
        if parts.prefix < vpc.cidr.prefix() || !vpc.cidr.contains(parts.network) {
            return Err(SyncError::MalformedInput(format!(
                "subnet {} ({}) is outside {} ({})",
                subnet.name, subnet.cidr, vpc.name, vpc.cidr
            )));
        }
        if self.presence.population_failed {
            info!(subnet = %self.name(), missing = ?self.slots.missing(), "Repairing partial subnet");
        }

        let prefix = format!("{}_{}", vpc.name, self.owner.name);
        let o = &self.owner;
        let s = &mut self.slots;

        let bridge = s
            .put(
                client,
                o,
                SubnetSlot::Bridge,
                format!("vb_{prefix}"),
                ObjectSpec::Bridge {
                    inbound_filter: None,
                },
            )
            .await?;
        let rt_port = s
            .put(
                client,
                o,
                SubnetSlot::VpcRtBrPort,
                format!("vr_{prefix}_brport"),
                ObjectSpec::Port(PortSpec {
                    device: vpc.router.clone(),
                    address: Some(parts.gateway_network()),
                    ..Default::default()
                }),
            )
            .await?;
        s.put(
            client,
            o,
            SubnetSlot::BrRtPort,
            format!("vb_{prefix}_rtport"),
            ObjectSpec::Port(PortSpec {
                device: bridge.clone(),
                peer: Some(rt_port.clone()),
                ..Default::default()
            }),
        )
        .await?;

        let dns_servers = if gni.instance_dns_servers.is_empty() {
            vec![parts.plus_two]
        } else {
            gni.instance_dns_servers.clone()
        };
        let dhcp = s
            .put(
                client,
                o,
                SubnetSlot::BrDhcp,
                format!("vb_{prefix}_dhcp"),
                ObjectSpec::DhcpSubnet(DhcpSubnetSpec {
                    bridge: bridge.clone(),
                    subnet: parts.to_network(),
                    gateway: parts.gateway,
                    dns_servers,
                    domain: gni.instance_dns_domain.clone(),
                }),
            )
            .await?;
        s.put(
            client,
            o,
            SubnetSlot::BrMetaPort,
            format!("vb_{prefix}_metaport"),
            ObjectSpec::Port(PortSpec {
                device: bridge.clone(),
                ..Default::default()
            }),
        )
        .await?;

        self.presence.midopresent = true;
        self.presence.population_failed = false;
        Ok(SubnetLinks {
            name: self.name().to_string(),
            bridge,
            dhcp,
            vpc_rt_br_port: rt_port,
            parts,
        })
    }

    /// Make the VPC router carry exactly `routes` for traffic sourced in
    /// this subnet. The first entry for a destination wins.
    pub async fn sync_routes<A: MidoApi>(
        &mut self,
        client: &MidoClient<A>,
        vpc: &VpcLinks,
        subnet: &SubnetLinks,
        routes: &[(Ipv4Network, RouteHop)],
    ) -> SyncResult<bool> {
        let mut desired: BTreeMap<String, NewObject> = BTreeMap::new();
        for (dst, hop) in routes {
            let key = dst.to_string();
            if desired.contains_key(&key) {
                debug!(subnet = %self.name(), destination = %key, "Duplicate route destination, keeping first");
                continue;
            }
            let object = self.owner.object(
                ROUTE_SLOT,
                Some(&key),
                format!("vr_{}_{}_route_{key}", vpc.name, self.owner.name),
                ObjectSpec::Route(RouteSpec {
                    router: vpc.router.clone(),
                    src: subnet.parts.to_network(),
                    dst: *dst,
                    next_hop_port: hop.port.clone(),
                    next_hop_gateway: hop.gateway,
                    weight: 100,
                }),
            );
            desired.insert(key, object);
        }
        self.routes.sync(client, &desired).await
    }

    /// Delete routes and slots. Instances and NAT gateways must already
    /// be gone.
    pub async fn delete<A: MidoApi>(&mut self, client: &MidoClient<A>) -> SyncResult<()> {
        if !self.instances.is_empty() || !self.nat_gateways.is_empty() {
            return Err(SyncError::dependency(
                format!("deleting {}", self.owner.label()),
                "instances and NAT gateways removed",
            ));
        }
        self.routes.delete_all(client).await?;
        self.slots.delete_all(client).await?;
        self.presence.midopresent = false;
        self.presence.population_failed = false;
        Ok(())
    }

    /// Object ids held by the subnet itself, not its children
    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.slots.ids().chain(self.routes.ids())
    }
}
