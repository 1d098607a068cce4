//! NAT gateway: a dedicated router between a subnet and the global bridge
//!
//! Traffic routed to the gateway's private address leaves through its
//! uplink with the source rewritten to the public address. The global
//! router sends return traffic for the public address back to the
//! gateway's uplink.

use super::core::CoreLinks;
use super::router_id::RouterIdPool;
use super::slots::{Owner, Presence, SlotKey, SlotTable};
use super::subnet::SubnetLinks;
use super::vpc::VpcLinks;
use crate::backend::{
    Inventory, MidoApi, MidoClient, ObjectId, ObjectSpec, PortSpec, RouteSpec, RuleAction,
    RuleMatch, RuleSpec,
};
use crate::config::MidoConfig;
use crate::error::{SyncError, SyncResult};
use crate::rules::nat_snat_rule;
use ipnetwork::Ipv4Network;
use mido_sync_common::cidr::{default_route, host_network};
use mido_sync_common::gni::GniNatGateway;
use mido_sync_common::tags::{TAG_ROUTER_ID, entity};
use std::collections::BTreeSet;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NatSlot {
    InChain,
    OutChain,
    ElipPreGroup,
    ElipPreGroupAddr,
    Router,
    Uplink,
    EucabrDownlink,
    RtBrPort,
    SubnetBrPort,
    VpcRoute,
    DefaultRoute,
    ElipRoute,
    SnatRule,
    RevSnatRule,
}

impl SlotKey for NatSlot {
    const ALL: &'static [Self] = &[
        NatSlot::InChain,
        NatSlot::OutChain,
        NatSlot::ElipPreGroup,
        NatSlot::ElipPreGroupAddr,
        NatSlot::Router,
        NatSlot::Uplink,
        NatSlot::EucabrDownlink,
        NatSlot::RtBrPort,
        NatSlot::SubnetBrPort,
        NatSlot::VpcRoute,
        NatSlot::DefaultRoute,
        NatSlot::ElipRoute,
        NatSlot::SnatRule,
        NatSlot::RevSnatRule,
    ];

    fn as_str(self) -> &'static str {
        match self {
            NatSlot::InChain => "inchain",
            NatSlot::OutChain => "outchain",
            NatSlot::ElipPreGroup => "elip_pre",
            NatSlot::ElipPreGroupAddr => "elip_pre_addr",
            NatSlot::Router => "router",
            NatSlot::Uplink => "uplink",
            NatSlot::EucabrDownlink => "eucabr_downlink",
            NatSlot::RtBrPort => "rt_brport",
            NatSlot::SubnetBrPort => "subnet_brport",
            NatSlot::VpcRoute => "vpc_route",
            NatSlot::DefaultRoute => "default_route",
            NatSlot::ElipRoute => "elip_route",
            NatSlot::SnatRule => "snat_rule",
            NatSlot::RevSnatRule => "revsnat_rule",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NatGateway {
    pub owner: Owner,
    pub presence: Presence,
    pub slots: SlotTable<NatSlot>,
    pub router_id: Option<u32>,
}

impl NatGateway {
    pub fn new(name: &str, subnet: &str) -> Self {
        Self {
            owner: Owner::new(entity::NAT_GATEWAY, name, Some(subnet.to_string())),
            presence: Presence::default(),
            slots: SlotTable::new(),
            router_id: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.owner.name
    }

    pub fn subnet(&self) -> &str {
        self.owner.parent.as_deref().unwrap_or_default()
    }

    pub fn populate(
        &mut self,
        inventory: &Inventory,
        known: &mut BTreeSet<ObjectId>,
        router_ids: &mut RouterIdPool,
    ) {
        let candidates = inventory.owned_by(entity::NAT_GATEWAY, self.name(), Some(self.subnet()));
        self.slots.populate(&candidates, known);

        self.router_id = None;
        if let Some(router) = self.slots.get(NatSlot::Router) {
            self.router_id = router_ids.claim(router);
            if self.router_id.is_none() {
                warn!(nat_gateway = %self.name(), "Router will be replaced");
                self.slots.forget(NatSlot::Router);
            }
        }
        self.presence = Presence::from_population(self.slots.len(), NatSlot::ALL.len());
    }

    /// Create or repair the gateway router, its links and NAT rules
    #[allow(clippy::too_many_arguments)]
    pub async fn ensure<A: MidoApi>(
        &mut self,
        client: &MidoClient<A>,
        config: &MidoConfig,
        core: &CoreLinks,
        vpc: &VpcLinks,
        subnet: &SubnetLinks,
        natg: &GniNatGateway,
        router_ids: &mut RouterIdPool,
    ) -> SyncResult<()> {
        if !subnet.parts.cidr.contains(natg.private_ip) {
            return Err(SyncError::MalformedInput(format!(
                "NAT gateway {} address {} is outside subnet {}",
                natg.name, natg.private_ip, subnet.name
            )));
        }
        let router_id = match self.router_id {
            Some(id) => id,
            None => {
                let id = router_ids.allocate()?;
                self.router_id = Some(id);
                id
            }
        };
        let uplink_address = config.router_address(router_id).ok_or_else(|| {
            SyncError::CapacityExceeded {
                what: "internal network addresses".to_string(),
                max: config.max_router_ids as usize,
            }
        })?;
        let uplink_network = config.internal_port_network(uplink_address).ok_or_else(|| {
            SyncError::MalformedInput(format!("uplink address {uplink_address}"))
        })?;
        let private_network = Ipv4Network::new(natg.private_ip, subnet.parts.prefix)
            .map_err(|e| SyncError::MalformedInput(e.to_string()))?;

        if self.presence.population_failed {
            info!(nat_gateway = %self.name(), missing = ?self.slots.missing(), "Repairing partial NAT gateway");
        }

        let name = self.owner.name.clone();
        let o = &self.owner;
        let s = &mut self.slots;
        let any = default_route();

        let in_chain = s
            .put(client, o, NatSlot::InChain, format!("natc_{name}_in"), ObjectSpec::Chain)
            .await?;
        let out_chain = s
            .put(client, o, NatSlot::OutChain, format!("natc_{name}_out"), ObjectSpec::Chain)
            .await?;
        let elip_group = s
            .put(
                client,
                o,
                NatSlot::ElipPreGroup,
                format!("elip_pre_{name}"),
                ObjectSpec::IpAddrGroup,
            )
            .await?;
        s.put(
            client,
            o,
            NatSlot::ElipPreGroupAddr,
            format!("elip_pre_{name}_addr"),
            ObjectSpec::IpAddrGroupAddr {
                group: elip_group.clone(),
                addr: natg.public_ip,
            },
        )
        .await?;

        let router_obj = o
            .object(
                NatSlot::Router.as_str(),
                None,
                format!("natr_{name}_{router_id}"),
                ObjectSpec::Router {
                    inbound_filter: Some(in_chain.clone()),
                    outbound_filter: Some(out_chain.clone()),
                },
            )
            .with_tag(TAG_ROUTER_ID, router_id.to_string());
        let router = s.ensure(client, NatSlot::Router, router_obj).await?;

        let uplink = s
            .put(
                client,
                o,
                NatSlot::Uplink,
                format!("natr_{name}_uplink"),
                ObjectSpec::Port(PortSpec {
                    device: router.clone(),
                    address: Some(uplink_network),
                    ..Default::default()
                }),
            )
            .await?;
        s.put(
            client,
            o,
            NatSlot::EucabrDownlink,
            format!("eucabr_{name}_downlink"),
            ObjectSpec::Port(PortSpec {
                device: core.eucabr.clone(),
                peer: Some(uplink.clone()),
                ..Default::default()
            }),
        )
        .await?;
        let rt_br_port = s
            .put(
                client,
                o,
                NatSlot::RtBrPort,
                format!("natr_{name}_brport"),
                ObjectSpec::Port(PortSpec {
                    device: router.clone(),
                    address: Some(private_network),
                    mac: Some(natg.mac.to_ascii_lowercase()),
                    ..Default::default()
                }),
            )
            .await?;
        s.put(
            client,
            o,
            NatSlot::SubnetBrPort,
            format!("vb_{}_{name}_port", subnet.name),
            ObjectSpec::Port(PortSpec {
                device: subnet.bridge.clone(),
                peer: Some(rt_br_port.clone()),
                ..Default::default()
            }),
        )
        .await?;

        s.put(
            client,
            o,
            NatSlot::VpcRoute,
            format!("natr_{name}_vpc_route"),
            ObjectSpec::Route(RouteSpec {
                router: router.clone(),
                src: any,
                dst: vpc.cidr,
                next_hop_port: rt_br_port,
                next_hop_gateway: Some(subnet.parts.gateway),
                weight: 100,
            }),
        )
        .await?;
        s.put(
            client,
            o,
            NatSlot::DefaultRoute,
            format!("natr_{name}_default_route"),
            ObjectSpec::Route(RouteSpec {
                router,
                src: any,
                dst: any,
                next_hop_port: uplink,
                next_hop_gateway: Some(core.eucart_address),
                weight: 100,
            }),
        )
        .await?;
        s.put(
            client,
            o,
            NatSlot::ElipRoute,
            format!("eucart_{name}_elip_route"),
            ObjectSpec::Route(RouteSpec {
                router: core.eucart.clone(),
                src: any,
                dst: host_network(natg.public_ip),
                next_hop_port: core.eucart_br_port.clone(),
                next_hop_gateway: Some(uplink_address),
                weight: 100,
            }),
        )
        .await?;

        s.put(
            client,
            o,
            NatSlot::SnatRule,
            format!("natc_{name}_out_snat"),
            ObjectSpec::Rule(nat_snat_rule(&out_chain, vpc.cidr, natg.public_ip)),
        )
        .await?;
        s.put(
            client,
            o,
            NatSlot::RevSnatRule,
            format!("natc_{name}_in_revsnat"),
            ObjectSpec::Rule(RuleSpec::new(in_chain, 0, RuleAction::RevSnat).with_match(
                RuleMatch {
                    ip_addr_group_dst: Some(elip_group),
                    ..Default::default()
                },
            )),
        )
        .await?;

        self.presence.midopresent = true;
        self.presence.population_failed = false;
        Ok(())
    }

    pub async fn delete<A: MidoApi>(
        &mut self,
        client: &MidoClient<A>,
        router_ids: &mut RouterIdPool,
    ) -> SyncResult<()> {
        self.slots.delete_all(client).await?;
        if let Some(id) = self.router_id.take() {
            router_ids.release(id);
        }
        self.presence.midopresent = false;
        self.presence.population_failed = false;
        Ok(())
    }

    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.slots.ids()
    }
}
