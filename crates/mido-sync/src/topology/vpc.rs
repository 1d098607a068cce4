//! VPC: one virtual router linked to the global bridge

use super::core::CoreLinks;
use super::router_id::RouterIdPool;
use super::slots::{Owner, Presence, SlotKey, SlotTable};
use super::subnet::Subnet;
use crate::backend::{
    Inventory, MidoApi, MidoClient, ObjectId, ObjectSpec, PortSpec, RuleAction, RuleSpec,
};
use crate::config::MidoConfig;
use crate::error::{SyncError, SyncResult};
use ipnetwork::Ipv4Network;
use mido_sync_common::cidr::parse_network;
use mido_sync_common::tags::{TAG_ROUTER_ID, entity};
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VpcSlot {
    PreChain,
    PostChain,
    PreElipChain,
    Router,
    PreRevSnatRule,
    PreElipJump,
    PostRevDnatRule,
    Uplink,
    EucabrDownlink,
}

impl SlotKey for VpcSlot {
    const ALL: &'static [Self] = &[
        VpcSlot::PreChain,
        VpcSlot::PostChain,
        VpcSlot::PreElipChain,
        VpcSlot::Router,
        VpcSlot::PreRevSnatRule,
        VpcSlot::PreElipJump,
        VpcSlot::PostRevDnatRule,
        VpcSlot::Uplink,
        VpcSlot::EucabrDownlink,
    ];

    fn as_str(self) -> &'static str {
        match self {
            VpcSlot::PreChain => "prechain",
            VpcSlot::PostChain => "postchain",
            VpcSlot::PreElipChain => "preelipchain",
            VpcSlot::Router => "router",
            VpcSlot::PreRevSnatRule => "pre_revsnat",
            VpcSlot::PreElipJump => "pre_elip_jump",
            VpcSlot::PostRevDnatRule => "post_revdnat",
            VpcSlot::Uplink => "uplink",
            VpcSlot::EucabrDownlink => "eucabr_downlink",
        }
    }
}

/// Rule positions in the VPC chains.
///
/// The VPC's own rules hold the head of each chain. Elastic-IP rules of
/// different instances match disjoint address groups, so they share one
/// position behind them and their relative order is irrelevant.
pub mod position {
    /// Pre chain: reverse SNAT for return traffic
    pub const PRE_REV_SNAT: u32 = 0;
    /// Pre chain: jump into the elastic-IP chain
    pub const PRE_ELIP_JUMP: u32 = 1;
    /// Post chain: reverse DNAT for return traffic
    pub const POST_REV_DNAT: u32 = 0;
    /// Elastic-IP chain: per-instance DNAT
    pub const ELIP_DNAT: u32 = 0;
    /// Post chain: per-instance SNAT, after reverse DNAT
    pub const ELIP_SNAT: u32 = POST_REV_DNAT + 1;
}

/// VPC object ids that subnets, NAT gateways and instances link to
#[derive(Debug, Clone)]
pub struct VpcLinks {
    pub name: String,
    pub cidr: Ipv4Network,
    pub router: ObjectId,
    pub uplink: ObjectId,
    pub uplink_address: Ipv4Addr,
    pub pre_elip_chain: ObjectId,
    pub post_chain: ObjectId,
}

#[derive(Debug, Clone)]
pub struct Vpc {
    pub owner: Owner,
    pub presence: Presence,
    pub slots: SlotTable<VpcSlot>,
    pub router_id: Option<u32>,
    pub subnets: BTreeMap<String, Subnet>,
}

impl Vpc {
    pub fn new(name: &str) -> Self {
        Self {
            owner: Owner::new(entity::VPC, name, None),
            presence: Presence::default(),
            slots: SlotTable::new(),
            router_id: None,
            subnets: BTreeMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.owner.name
    }

    /// Rebuild the VPC's own slots from backend tags and reclaim its router ID.
    ///
    /// A router whose ID is missing, out of range or already claimed is
    /// dropped from the table, leaving the VPC partial so build replaces it.
    pub fn populate(
        &mut self,
        inventory: &Inventory,
        known: &mut BTreeSet<ObjectId>,
        router_ids: &mut RouterIdPool,
    ) {
        let candidates = inventory.owned_by(entity::VPC, self.name(), None);
        self.slots.populate(&candidates, known);

        self.router_id = None;
        if let Some(router) = self.slots.get(VpcSlot::Router) {
            self.router_id = router_ids.claim(router);
            if self.router_id.is_none() {
                warn!(vpc = %self.name(), "Router will be replaced");
                self.slots.forget(VpcSlot::Router);
            }
        }

        self.presence = Presence::from_population(self.slots.len(), VpcSlot::ALL.len());
    }

    pub fn links(&self, cidr: &str, config: &MidoConfig) -> SyncResult<VpcLinks> {
        let router_id = self
            .router_id
            .ok_or_else(|| SyncError::dependency(self.owner.label(), "router id"))?;
        let uplink_address = config.router_address(router_id).ok_or_else(|| {
            SyncError::CapacityExceeded {
                what: "internal network addresses".to_string(),
                max: config.max_router_ids as usize,
            }
        })?;
        Ok(VpcLinks {
            name: self.name().to_string(),
            cidr: parse_network(cidr)?,
            router: self.slots.require(VpcSlot::Router, &self.owner)?,
            uplink: self.slots.require(VpcSlot::Uplink, &self.owner)?,
            uplink_address,
            pre_elip_chain: self.slots.require(VpcSlot::PreElipChain, &self.owner)?,
            post_chain: self.slots.require(VpcSlot::PostChain, &self.owner)?,
        })
    }

    /// Create or repair the VPC router and its link to the global bridge
    pub async fn ensure<A: MidoApi>(
        &mut self,
        client: &MidoClient<A>,
        config: &MidoConfig,
        core: &CoreLinks,
        router_ids: &mut RouterIdPool,
    ) -> SyncResult<()> {
        let router_id = match self.router_id {
            Some(id) => id,
            None => {
                let id = router_ids.allocate()?;
                self.router_id = Some(id);
                id
            }
        };
        let uplink_network = config
            .router_address(router_id)
            .and_then(|a| config.internal_port_network(a))
            .ok_or_else(|| SyncError::CapacityExceeded {
                what: "internal network addresses".to_string(),
                max: config.max_router_ids as usize,
            })?;

        if self.presence.population_failed {
            info!(vpc = %self.name(), missing = ?self.slots.missing(), "Repairing partial VPC");
        }

        let name = self.owner.name.clone();
        let o = &self.owner;
        let s = &mut self.slots;

        let pre = s
            .put(client, o, VpcSlot::PreChain, format!("vc_{name}_prechain"), ObjectSpec::Chain)
            .await?;
        let post = s
            .put(client, o, VpcSlot::PostChain, format!("vc_{name}_postchain"), ObjectSpec::Chain)
            .await?;
        let pre_elip = s
            .put(
                client,
                o,
                VpcSlot::PreElipChain,
                format!("vc_{name}_preelip"),
                ObjectSpec::Chain,
            )
            .await?;

        let router_obj = o
            .object(
                VpcSlot::Router.as_str(),
                None,
                format!("vr_{name}_{router_id}"),
                ObjectSpec::Router {
                    inbound_filter: Some(pre.clone()),
                    outbound_filter: Some(post.clone()),
                },
            )
            .with_tag(TAG_ROUTER_ID, router_id.to_string());
        let router = s.ensure(client, VpcSlot::Router, router_obj).await?;

        s.put(
            client,
            o,
            VpcSlot::PreRevSnatRule,
            format!("vc_{name}_prechain_revsnat"),
            ObjectSpec::Rule(RuleSpec::new(
                pre.clone(),
                position::PRE_REV_SNAT,
                RuleAction::RevSnat,
            )),
        )
        .await?;
        s.put(
            client,
            o,
            VpcSlot::PreElipJump,
            format!("vc_{name}_prechain_elip"),
            ObjectSpec::Rule(RuleSpec::new(
                pre,
                position::PRE_ELIP_JUMP,
                RuleAction::Jump { target: pre_elip },
            )),
        )
        .await?;
        s.put(
            client,
            o,
            VpcSlot::PostRevDnatRule,
            format!("vc_{name}_postchain_revdnat"),
            ObjectSpec::Rule(RuleSpec::new(
                post,
                position::POST_REV_DNAT,
                RuleAction::RevDnat,
            )),
        )
        .await?;

        let uplink = s
            .put(
                client,
                o,
                VpcSlot::Uplink,
                format!("vr_{name}_uplink"),
                ObjectSpec::Port(PortSpec {
                    device: router,
                    address: Some(uplink_network),
                    ..Default::default()
                }),
            )
            .await?;
        s.put(
            client,
            o,
            VpcSlot::EucabrDownlink,
            format!("eucabr_{name}_downlink"),
            ObjectSpec::Port(PortSpec {
                device: core.eucabr.clone(),
                peer: Some(uplink),
                ..Default::default()
            }),
        )
        .await?;

        self.presence.midopresent = true;
        self.presence.population_failed = false;
        Ok(())
    }

    /// Delete the VPC's own objects and release its router ID.
    ///
    /// Subnets must already be gone.
    pub async fn delete<A: MidoApi>(
        &mut self,
        client: &MidoClient<A>,
        router_ids: &mut RouterIdPool,
    ) -> SyncResult<()> {
        if !self.subnets.is_empty() {
            return Err(SyncError::dependency(
                format!("deleting {}", self.owner.label()),
                "subnets removed",
            ));
        }
        self.slots.delete_all(client).await?;
        if let Some(id) = self.router_id.take() {
            router_ids.release(id);
        }
        self.presence.midopresent = false;
        self.presence.population_failed = false;
        Ok(())
    }

    /// Object ids held by the VPC itself, not its subnets
    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.slots.ids()
    }
}
