//! Instance network interface
//!
//! An interface owns a bridge port on its subnet with a filter chain in
//! each direction and a DHCP host entry. Binding the port to its compute
//! host and wiring the elastic IP are kept in separate slot tables so
//! each can be connected and disconnected on its own.

use super::core::CoreLinks;
use super::slots::{Owner, Presence, RuleList, SlotKey, SlotTable};
use super::subnet::SubnetLinks;
use super::vpc::{VpcLinks, position};
use crate::backend::{
    Inventory, MidoApi, MidoClient, ObjectId, ObjectSpec, PortSpec, RouteSpec, RuleAction,
    RuleMatch, RuleSpec,
};
use crate::config::MidoConfig;
use crate::error::{SyncError, SyncResult};
use crate::rules::{InstanceEgress, instance_post_rules, instance_pre_rules};
use mido_sync_common::cidr::{default_route, host_network, is_plus_two};
use mido_sync_common::gni::GniInterface;
use mido_sync_common::tags::entity;
use std::collections::BTreeSet;
use tracing::{debug, info};

const PRE_RULES: &str = "pre_rules";
const POST_RULES: &str = "post_rules";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InstanceSlot {
    PreChain,
    PostChain,
    VmPort,
    DhcpHost,
}

impl SlotKey for InstanceSlot {
    const ALL: &'static [Self] = &[
        InstanceSlot::PreChain,
        InstanceSlot::PostChain,
        InstanceSlot::VmPort,
        InstanceSlot::DhcpHost,
    ];

    fn as_str(self) -> &'static str {
        match self {
            InstanceSlot::PreChain => "prechain",
            InstanceSlot::PostChain => "postchain",
            InstanceSlot::VmPort => "vmport",
            InstanceSlot::DhcpHost => "dhcp_host",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum BindingSlot {
    VmHost,
}

impl SlotKey for BindingSlot {
    const ALL: &'static [Self] = &[BindingSlot::VmHost];

    fn as_str(self) -> &'static str {
        "vm_host_binding"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ElipSlot {
    PreGroup,
    PostGroup,
    PreGroupAddr,
    PostGroupAddr,
    DnatRule,
    SnatRule,
    Route,
}

impl SlotKey for ElipSlot {
    const ALL: &'static [Self] = &[
        ElipSlot::PreGroup,
        ElipSlot::PostGroup,
        ElipSlot::PreGroupAddr,
        ElipSlot::PostGroupAddr,
        ElipSlot::DnatRule,
        ElipSlot::SnatRule,
        ElipSlot::Route,
    ];

    fn as_str(self) -> &'static str {
        match self {
            ElipSlot::PreGroup => "elip_pre",
            ElipSlot::PostGroup => "elip_post",
            ElipSlot::PreGroupAddr => "elip_pre_addr",
            ElipSlot::PostGroupAddr => "elip_post_addr",
            ElipSlot::DnatRule => "elip_dnat",
            ElipSlot::SnatRule => "elip_snat",
            ElipSlot::Route => "elip_route",
        }
    }
}

/// What differs between the backend and the model for one interface
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InstanceFlags {
    pub pubip_changed: bool,
    pub host_changed: bool,
    pub srcdst_changed: bool,
    pub sg_changed: bool,
}

impl InstanceFlags {
    pub fn any(&self) -> bool {
        self.pubip_changed || self.host_changed || self.srcdst_changed || self.sg_changed
    }
}

#[derive(Debug, Clone)]
pub struct Instance {
    pub owner: Owner,
    pub presence: Presence,
    pub slots: SlotTable<InstanceSlot>,
    pub binding: SlotTable<BindingSlot>,
    pub elip: SlotTable<ElipSlot>,
    pub pre_rules: RuleList,
    pub post_rules: RuleList,
    pub flags: InstanceFlags,
}

/// Interface name used when binding the port on the compute host
fn host_interface(iface: &GniInterface) -> String {
    format!("vn_{}", iface.instance_id)
}

impl Instance {
    pub fn new(name: &str, subnet: &str) -> Self {
        Self {
            owner: Owner::new(entity::INSTANCE, name, Some(subnet.to_string())),
            presence: Presence::default(),
            slots: SlotTable::new(),
            binding: SlotTable::new(),
            elip: SlotTable::new(),
            pre_rules: RuleList::new(PRE_RULES),
            post_rules: RuleList::new(POST_RULES),
            flags: InstanceFlags::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.owner.name
    }

    pub fn subnet(&self) -> &str {
        self.owner.parent.as_deref().unwrap_or_default()
    }

    /// Instance id recorded as the DHCP host name
    pub fn instance_id(&self) -> Option<&str> {
        match &self.slots.get(InstanceSlot::DhcpHost)?.spec {
            ObjectSpec::DhcpHost { hostname, .. } => Some(hostname),
            _ => None,
        }
    }

    pub fn populate(&mut self, inventory: &Inventory, known: &mut BTreeSet<ObjectId>) {
        let candidates = inventory.owned_by(entity::INSTANCE, self.name(), Some(self.subnet()));
        let filled = self.slots.populate(&candidates, known);
        self.binding.populate(&candidates, known);
        self.elip.populate(&candidates, known);
        self.pre_rules.populate(&candidates, known);
        self.post_rules.populate(&candidates, known);
        self.presence = Presence::from_population(filled, InstanceSlot::ALL.len());
    }

    /// Compare backend state with the model interface.
    ///
    /// `host` is the backend id of the interface's compute host and
    /// `sg_ingress` the ingress chains of its security groups, in order.
    pub fn compute_flags(
        &mut self,
        iface: &GniInterface,
        host: Option<&ObjectId>,
        sg_ingress: &[ObjectId],
    ) {
        let current_pub = self.elip.get(ElipSlot::PreGroupAddr).and_then(|o| match &o.spec {
            ObjectSpec::IpAddrGroupAddr { addr, .. } => Some(*addr),
            _ => None,
        });
        let current_host = self.binding.get(BindingSlot::VmHost).and_then(|o| match &o.spec {
            ObjectSpec::HostBinding { host, .. } => Some(host),
            _ => None,
        });
        let spoof_check = self.post_rules.rules().iter().filter_map(|r| r.as_rule()).any(|r| {
            r.action == RuleAction::Drop && r.matches.inv_nw_src && r.matches.nw_src.is_some()
        });
        let jumps: Vec<&ObjectId> = self
            .pre_rules
            .rules()
            .iter()
            .filter_map(|r| r.as_rule()?.jump_target())
            .collect();

        self.flags = InstanceFlags {
            pubip_changed: current_pub != iface.public_ip,
            host_changed: current_host != host,
            srcdst_changed: !self.post_rules.is_empty() && spoof_check != iface.src_dst_check,
            sg_changed: !jumps.iter().copied().eq(sg_ingress.iter()),
        };
        if self.flags.any() {
            debug!(instance = %self.name(), flags = ?self.flags, "Instance differs from model");
        }
    }

    /// Create or repair the port, its chains and the DHCP entry
    pub async fn ensure<A: MidoApi>(
        &mut self,
        client: &MidoClient<A>,
        subnet: &SubnetLinks,
        iface: &GniInterface,
    ) -> SyncResult<()> {
        if !subnet.parts.cidr.contains(iface.private_ip) {
            return Err(SyncError::MalformedInput(format!(
                "interface {} address {} is outside subnet {}",
                iface.name, iface.private_ip, subnet.name
            )));
        }
        let parts = &subnet.parts;
        if iface.private_ip == parts.network
            || iface.private_ip == parts.gateway
            || is_plus_two(&parts.cidr.to_string(), iface.private_ip)
        {
            return Err(SyncError::MalformedInput(format!(
                "interface {} address {} is reserved in subnet {}",
                iface.name, iface.private_ip, subnet.name
            )));
        }
        if self.presence.population_failed {
            info!(instance = %self.name(), missing = ?self.slots.missing(), "Repairing partial instance");
        }

        let name = self.owner.name.clone();
        let o = &self.owner;
        let s = &mut self.slots;

        let pre = s
            .put(client, o, InstanceSlot::PreChain, format!("ic_{name}_prechain"), ObjectSpec::Chain)
            .await?;
        let post = s
            .put(client, o, InstanceSlot::PostChain, format!("ic_{name}_postchain"), ObjectSpec::Chain)
            .await?;
        // Traffic leaving the VM enters the bridge through the port
        s.put(
            client,
            o,
            InstanceSlot::VmPort,
            format!("vb_{}_{name}", subnet.name),
            ObjectSpec::Port(PortSpec {
                device: subnet.bridge.clone(),
                inbound_filter: Some(post),
                outbound_filter: Some(pre),
                ..Default::default()
            }),
        )
        .await?;
        s.put(
            client,
            o,
            InstanceSlot::DhcpHost,
            format!("dhcp_{name}"),
            ObjectSpec::DhcpHost {
                dhcp: subnet.dhcp.clone(),
                mac: iface.mac.to_ascii_lowercase(),
                addr: iface.private_ip,
                hostname: iface.instance_id.clone(),
            },
        )
        .await?;

        self.presence.midopresent = true;
        self.presence.population_failed = false;
        Ok(())
    }

    /// Bind the port on the interface's compute host, moving it if the
    /// host changed
    pub async fn connect<A: MidoApi>(
        &mut self,
        client: &MidoClient<A>,
        inventory: &Inventory,
        iface: &GniInterface,
    ) -> SyncResult<()> {
        let host = inventory
            .host_id(&iface.node)
            .cloned()
            .ok_or_else(|| SyncError::HostNotFound(iface.node.clone()))?;
        let port = self.slots.require(InstanceSlot::VmPort, &self.owner)?;
        if self.flags.host_changed && !self.binding.is_empty() {
            info!(instance = %self.name(), node = %iface.node, "Moving instance binding");
            self.disconnect(client).await?;
        }
        self.binding
            .put(
                client,
                &self.owner,
                BindingSlot::VmHost,
                format!("{}_binding", self.owner.name),
                ObjectSpec::HostBinding {
                    host,
                    port,
                    interface: host_interface(iface),
                },
            )
            .await?;
        self.flags.host_changed = false;
        Ok(())
    }

    /// Remove the host binding, leaving the port on the bridge
    pub async fn disconnect<A: MidoApi>(&mut self, client: &MidoClient<A>) -> SyncResult<()> {
        self.binding.delete_all(client).await
    }

    /// Wire the interface's elastic IP, or remove the wiring when the
    /// model has none. A changed address replaces only the objects that
    /// carry it.
    pub async fn connect_elip<A: MidoApi>(
        &mut self,
        client: &MidoClient<A>,
        core: &CoreLinks,
        vpc: &VpcLinks,
        iface: &GniInterface,
    ) -> SyncResult<()> {
        let Some(public_ip) = iface.public_ip else {
            return self.disconnect_elip(client).await;
        };
        if self.flags.pubip_changed && !self.elip.is_empty() {
            info!(instance = %self.name(), public_ip = %public_ip, "Elastic IP changed, rewiring");
        }

        let name = self.owner.name.clone();
        let o = &self.owner;
        let e = &mut self.elip;

        let pre_group = e
            .put(client, o, ElipSlot::PreGroup, format!("elip_pre_{name}"), ObjectSpec::IpAddrGroup)
            .await?;
        let post_group = e
            .put(client, o, ElipSlot::PostGroup, format!("elip_post_{name}"), ObjectSpec::IpAddrGroup)
            .await?;
        e.put(
            client,
            o,
            ElipSlot::PreGroupAddr,
            format!("elip_pre_{name}_addr"),
            ObjectSpec::IpAddrGroupAddr {
                group: pre_group.clone(),
                addr: public_ip,
            },
        )
        .await?;
        e.put(
            client,
            o,
            ElipSlot::PostGroupAddr,
            format!("elip_post_{name}_addr"),
            ObjectSpec::IpAddrGroupAddr {
                group: post_group.clone(),
                addr: iface.private_ip,
            },
        )
        .await?;
        e.put(
            client,
            o,
            ElipSlot::DnatRule,
            format!("vc_{}_elip_dnat_{name}", vpc.name),
            ObjectSpec::Rule(
                RuleSpec::new(
                    vpc.pre_elip_chain.clone(),
                    position::ELIP_DNAT,
                    RuleAction::Dnat {
                        to: iface.private_ip,
                    },
                )
                .with_match(RuleMatch {
                    ip_addr_group_dst: Some(pre_group),
                    ..Default::default()
                }),
            ),
        )
        .await?;
        e.put(
            client,
            o,
            ElipSlot::SnatRule,
            format!("vc_{}_elip_snat_{name}", vpc.name),
            ObjectSpec::Rule(
                RuleSpec::new(
                    vpc.post_chain.clone(),
                    position::ELIP_SNAT,
                    RuleAction::Snat { to: public_ip },
                )
                .with_match(RuleMatch {
                    ip_addr_group_src: Some(post_group),
                    nw_dst: Some(vpc.cidr),
                    inv_nw_dst: true,
                    ..Default::default()
                }),
            ),
        )
        .await?;
        e.put(
            client,
            o,
            ElipSlot::Route,
            format!("eucart_elip_{name}"),
            ObjectSpec::Route(RouteSpec {
                router: core.eucart.clone(),
                src: default_route(),
                dst: host_network(public_ip),
                next_hop_port: core.eucart_br_port.clone(),
                next_hop_gateway: Some(vpc.uplink_address),
                weight: 100,
            }),
        )
        .await?;

        self.flags.pubip_changed = false;
        Ok(())
    }

    pub async fn disconnect_elip<A: MidoApi>(&mut self, client: &MidoClient<A>) -> SyncResult<()> {
        if !self.elip.is_empty() {
            info!(instance = %self.name(), "Removing elastic IP");
        }
        self.elip.delete_all(client).await
    }

    /// Regenerate both filter chains from the interface attributes and
    /// the chains of its security groups
    pub async fn sync_chains<A: MidoApi>(
        &mut self,
        client: &MidoClient<A>,
        config: &MidoConfig,
        core: &CoreLinks,
        iface: &GniInterface,
        sg_ingress: &[ObjectId],
        sg_egress: &[ObjectId],
    ) -> SyncResult<bool> {
        let pre = self.slots.require(InstanceSlot::PreChain, &self.owner)?;
        let post = self.slots.require(InstanceSlot::PostChain, &self.owner)?;
        let name = self.owner.name.clone();

        let pre_rules = self.owner.rule_objects(
            PRE_RULES,
            &format!("ic_{name}_pre"),
            instance_pre_rules(&pre, sg_ingress),
        );
        let egress = InstanceEgress {
            mac: &iface.mac,
            private_ip: iface.private_ip,
            src_dst_check: iface.src_dst_check,
            l2_isolation: config.l2_isolation,
            metadata_group: &core.metadata_group,
            sg_egress_chains: sg_egress,
        };
        let post_rules = self.owner.rule_objects(
            POST_RULES,
            &format!("ic_{name}_post"),
            instance_post_rules(&post, &egress),
        );

        let pre_changed = self.pre_rules.sync(client, &pre_rules).await?;
        let post_changed = self.post_rules.sync(client, &post_rules).await?;
        self.flags.sg_changed = false;
        self.flags.srcdst_changed = false;
        Ok(pre_changed || post_changed)
    }

    /// Delete everything the interface owns, elastic IP first
    pub async fn delete<A: MidoApi>(&mut self, client: &MidoClient<A>) -> SyncResult<()> {
        self.elip.delete_all(client).await?;
        self.disconnect(client).await?;
        self.post_rules.delete_all(client).await?;
        self.pre_rules.delete_all(client).await?;
        self.slots.delete_all(client).await?;
        self.presence.midopresent = false;
        self.presence.population_failed = false;
        Ok(())
    }

    /// Every object id held by the interface
    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.slots
            .ids()
            .chain(self.binding.ids())
            .chain(self.elip.ids())
            .chain(self.pre_rules.ids())
            .chain(self.post_rules.ids())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::testing::{Fixture, NODE};
    use mido_sync_common::ObjectKind;
    use std::net::Ipv4Addr;

    fn iface() -> GniInterface {
        GniInterface {
            name: "eni-1".to_string(),
            instance_id: "i-1".to_string(),
            vpc: "vpc-1".to_string(),
            subnet: "subnet-1".to_string(),
            mac: "D0:0D:00:00:00:01".to_string(),
            private_ip: Ipv4Addr::new(10, 0, 1, 10),
            public_ip: Some(Ipv4Addr::new(203, 0, 113, 50)),
            node: NODE.to_string(),
            security_groups: vec![],
            src_dst_check: true,
        }
    }

    struct Built {
        f: Fixture,
        vpc: VpcLinks,
        instance: Instance,
    }

    async fn built() -> Built {
        let mut f = Fixture::new().await;
        let (_, vpc) = f.vpc().await;
        let (_, subnet) = f.subnet(&vpc, "subnet-1", "10.0.1.0/24").await;
        let inventory = f.scan().await;

        let mut instance = Instance::new("eni-1", "subnet-1");
        instance.ensure(&f.client, &subnet, &iface()).await.unwrap();
        instance.connect(&f.client, &inventory, &iface()).await.unwrap();
        instance
            .connect_elip(&f.client, &f.core, &vpc, &iface())
            .await
            .unwrap();
        instance
            .sync_chains(&f.client, &f.config, &f.core, &iface(), &[], &[])
            .await
            .unwrap();
        Built { f, vpc, instance }
    }

    #[tokio::test]
    async fn test_full_build_and_flags_after_rescan() {
        let b = built().await;
        assert!(b.instance.slots.is_complete());
        assert!(b.instance.elip.is_complete());
        // return flow, l2 drop, spoof drop, metadata accept, final drop
        assert_eq!(b.instance.post_rules.len(), 5);
        assert_eq!(b.instance.pre_rules.len(), 2);

        let inventory = b.f.scan().await;
        let mut known = b.f.known(&inventory);
        for entity_name in [(entity::VPC, "vpc-1"), (entity::SUBNET, "subnet-1")] {
            known.extend(
                inventory
                    .owned_by(entity_name.0, entity_name.1, None)
                    .iter()
                    .map(|o| o.id.clone()),
            );
        }
        let mut rebuilt = Instance::new("eni-1", "subnet-1");
        rebuilt.populate(&inventory, &mut known);
        assert!(rebuilt.presence.midopresent);
        assert_eq!(rebuilt.ids().count(), b.instance.ids().count());

        let host = inventory.host_id(NODE);
        rebuilt.compute_flags(&iface(), host, &[]);
        assert!(!rebuilt.flags.any());

        let mut moved = iface();
        moved.public_ip = Some(Ipv4Addr::new(203, 0, 113, 51));
        moved.src_dst_check = false;
        rebuilt.compute_flags(&moved, None, &["chain-000099".into()]);
        assert_eq!(
            rebuilt.flags,
            InstanceFlags {
                pubip_changed: true,
                host_changed: true,
                srcdst_changed: true,
                sg_changed: true,
            }
        );
    }

    #[tokio::test]
    async fn test_public_ip_change_rewires_only_elip() {
        let mut b = built().await;
        let port = b.instance.slots.id(InstanceSlot::VmPort).cloned().unwrap();
        let pre_group = b.instance.elip.id(ElipSlot::PreGroup).cloned().unwrap();

        let mut changed = iface();
        changed.public_ip = Some(Ipv4Addr::new(203, 0, 113, 51));
        b.instance.flags.pubip_changed = true;
        b.f.api.reset_counters();
        b.instance
            .connect_elip(&b.f.client, &b.f.core, &b.vpc, &changed)
            .await
            .unwrap();

        // address member, snat rule and route are replaced
        let counters = b.f.api.counters();
        assert_eq!((counters.deletes, counters.creates), (3, 3));
        assert_eq!(b.instance.slots.id(InstanceSlot::VmPort), Some(&port));
        assert_eq!(b.instance.elip.id(ElipSlot::PreGroup), Some(&pre_group));
        assert!(!b.instance.flags.pubip_changed);

        changed.public_ip = None;
        b.instance
            .connect_elip(&b.f.client, &b.f.core, &b.vpc, &changed)
            .await
            .unwrap();
        assert!(b.instance.elip.is_empty());
        assert!(b.f.api.objects_of(ObjectKind::IpAddrGroup).len() == 1, "metadata group only");
    }

    #[tokio::test]
    async fn test_elastic_ip_rules_sit_behind_vpc_rules() {
        let b = built().await;
        let rules: Vec<RuleSpec> = b
            .f
            .api
            .objects_of(ObjectKind::Rule)
            .into_iter()
            .filter_map(|o| match o.spec {
                ObjectSpec::Rule(rule) => Some(rule),
                _ => None,
            })
            .collect();
        let in_chain = |chain: &ObjectId| {
            let mut found: Vec<_> = rules.iter().filter(|r| &r.chain == chain).collect();
            found.sort_by_key(|r| r.position);
            found
        };

        let post = in_chain(&b.vpc.post_chain);
        assert_eq!(post.len(), 2);
        assert_eq!(post[0].action, RuleAction::RevDnat);
        assert_eq!(post[1].position, position::ELIP_SNAT);
        assert!(matches!(post[1].action, RuleAction::Snat { .. }));

        let pre_elip = in_chain(&b.vpc.pre_elip_chain);
        assert_eq!(pre_elip.len(), 1);
        assert_eq!(pre_elip[0].position, position::ELIP_DNAT);
        assert!(matches!(pre_elip[0].action, RuleAction::Dnat { .. }));
    }

    #[tokio::test]
    async fn test_connect_requires_registered_host() {
        let mut b = built().await;
        b.instance.disconnect(&b.f.client).await.unwrap();
        assert!(b.f.api.objects_of(ObjectKind::HostBinding).is_empty());

        let mut elsewhere = iface();
        elsewhere.node = "node-unknown".to_string();
        let inventory = b.f.scan().await;
        let err = b
            .instance
            .connect(&b.f.client, &inventory, &elsewhere)
            .await
            .unwrap_err();
        assert_eq!(err, SyncError::HostNotFound("node-unknown".to_string()));
    }

    #[tokio::test]
    async fn test_reserved_address_is_rejected() {
        let mut f = Fixture::new().await;
        let (_, vpc) = f.vpc().await;
        let (_, subnet) = f.subnet(&vpc, "subnet-1", "10.0.1.0/24").await;
        let before = f.api.len();

        for reserved in [
            Ipv4Addr::new(10, 0, 1, 0),
            Ipv4Addr::new(10, 0, 1, 1),
            Ipv4Addr::new(10, 0, 1, 2),
        ] {
            let mut on_reserved = iface();
            on_reserved.private_ip = reserved;
            let mut instance = Instance::new("eni-1", "subnet-1");
            let err = instance
                .ensure(&f.client, &subnet, &on_reserved)
                .await
                .unwrap_err();
            assert!(matches!(err, SyncError::MalformedInput(_)), "{reserved}");
        }
        assert_eq!(f.api.len(), before);
    }

    #[tokio::test]
    async fn test_host_change_moves_binding() {
        let mut b = built().await;
        let node_2 = b.f.api.add_host("node-2");
        let mut moved = iface();
        moved.node = "node-2".to_string();
        let inventory = b.f.scan().await;
        b.instance
            .compute_flags(&moved, inventory.host_id("node-2"), &[]);
        assert!(b.instance.flags.host_changed);

        b.f.api.reset_counters();
        b.instance
            .connect(&b.f.client, &inventory, &moved)
            .await
            .unwrap();
        let counters = b.f.api.counters();
        assert_eq!((counters.deletes, counters.creates), (1, 1));

        let bindings = b.f.api.objects_of(ObjectKind::HostBinding);
        assert_eq!(bindings.len(), 1);
        assert!(matches!(
            &bindings[0].spec,
            ObjectSpec::HostBinding { host, .. } if *host == node_2
        ));
        assert!(!b.instance.flags.host_changed);
    }

    #[tokio::test]
    async fn test_delete_removes_everything() {
        let mut b = built().await;
        let before = b.f.api.len();
        let owned = b.instance.ids().count();
        b.instance.delete(&b.f.client).await.unwrap();
        assert_eq!(b.f.api.len(), before - owned);
        assert!(b.f.api.objects_of(ObjectKind::DhcpHost).is_empty());
    }
}
