//! Security group: ingress and egress chains plus member address groups
//!
//! Instances jump into the group's chains from their own. Members are
//! tracked in three address groups (private, public and both) so other
//! groups' rules can name this group as a peer.

use super::slots::{ObjectMap, Owner, Presence, RuleList, SlotKey, SlotTable};
use crate::backend::{
    Inventory, MidoApi, MidoClient, NewObject, ObjectId, ObjectSpec, RuleAction,
};
use crate::error::SyncResult;
use crate::rules::{Direction, positioned, translate_rule};
use mido_sync_common::gni::{GlobalNetworkInfo, GniRule, GniSecurityGroup};
use mido_sync_common::tags::entity;
use std::collections::{BTreeMap, BTreeSet};
use std::net::Ipv4Addr;
use tracing::{info, warn};

const PRIV_ADDRS: &str = "priv_addr";
const PUB_ADDRS: &str = "pub_addr";
const ALL_ADDRS: &str = "all_addr";
const INGRESS_RULES: &str = "ingress_rules";
const EGRESS_RULES: &str = "egress_rules";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecGroupSlot {
    IngressChain,
    EgressChain,
    IagPriv,
    IagPub,
    IagAll,
}

impl SlotKey for SecGroupSlot {
    const ALL: &'static [Self] = &[
        SecGroupSlot::IngressChain,
        SecGroupSlot::EgressChain,
        SecGroupSlot::IagPriv,
        SecGroupSlot::IagPub,
        SecGroupSlot::IagAll,
    ];

    fn as_str(self) -> &'static str {
        match self {
            SecGroupSlot::IngressChain => "ingress_chain",
            SecGroupSlot::EgressChain => "egress_chain",
            SecGroupSlot::IagPriv => "iag_priv",
            SecGroupSlot::IagPub => "iag_pub",
            SecGroupSlot::IagAll => "iag_all",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecGroupFlags {
    pub ingress_changed: bool,
    pub egress_changed: bool,
    pub interfaces_changed: bool,
}

#[derive(Debug, Clone)]
pub struct SecGroup {
    pub owner: Owner,
    pub presence: Presence,
    pub slots: SlotTable<SecGroupSlot>,
    pub priv_addrs: ObjectMap,
    pub pub_addrs: ObjectMap,
    pub all_addrs: ObjectMap,
    pub ingress_rules: RuleList,
    pub egress_rules: RuleList,
    pub flags: SecGroupFlags,
}

impl SecGroup {
    pub fn new(name: &str) -> Self {
        Self {
            owner: Owner::new(entity::SECGROUP, name, None),
            presence: Presence::default(),
            slots: SlotTable::new(),
            priv_addrs: ObjectMap::new(PRIV_ADDRS),
            pub_addrs: ObjectMap::new(PUB_ADDRS),
            all_addrs: ObjectMap::new(ALL_ADDRS),
            ingress_rules: RuleList::new(INGRESS_RULES),
            egress_rules: RuleList::new(EGRESS_RULES),
            flags: SecGroupFlags::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.owner.name
    }

    /// Fill the fixed slots. Runs for every group before any group's
    /// members and rules, which may point at other groups.
    pub fn populate_slots(&mut self, inventory: &Inventory, known: &mut BTreeSet<ObjectId>) {
        let candidates = inventory.owned_by(entity::SECGROUP, self.name(), None);
        let filled = self.slots.populate(&candidates, known);
        self.presence = Presence::from_population(filled, SecGroupSlot::ALL.len());
    }

    pub fn populate_members(&mut self, inventory: &Inventory, known: &mut BTreeSet<ObjectId>) {
        let candidates = inventory.owned_by(entity::SECGROUP, self.name(), None);
        self.priv_addrs.populate(&candidates, known);
        self.pub_addrs.populate(&candidates, known);
        self.all_addrs.populate(&candidates, known);
        self.ingress_rules.populate(&candidates, known);
        self.egress_rules.populate(&candidates, known);
    }

    pub fn ingress_chain(&self) -> Option<&ObjectId> {
        self.slots.id(SecGroupSlot::IngressChain)
    }

    pub fn egress_chain(&self) -> Option<&ObjectId> {
        self.slots.id(SecGroupSlot::EgressChain)
    }

    /// Address group holding every member address, used as a rule peer
    pub fn all_group(&self) -> Option<&ObjectId> {
        self.slots.id(SecGroupSlot::IagAll)
    }

    pub async fn ensure<A: MidoApi>(&mut self, client: &MidoClient<A>) -> SyncResult<()> {
        if self.presence.population_failed {
            info!(secgroup = %self.name(), missing = ?self.slots.missing(), "Repairing partial security group");
        }
        let name = self.owner.name.clone();
        let o = &self.owner;
        let s = &mut self.slots;

        s.put(client, o, SecGroupSlot::IngressChain, format!("sg_ingress_{name}"), ObjectSpec::Chain)
            .await?;
        s.put(client, o, SecGroupSlot::EgressChain, format!("sg_egress_{name}"), ObjectSpec::Chain)
            .await?;
        s.put(client, o, SecGroupSlot::IagPriv, format!("sg_priv_{name}"), ObjectSpec::IpAddrGroup)
            .await?;
        s.put(client, o, SecGroupSlot::IagPub, format!("sg_pub_{name}"), ObjectSpec::IpAddrGroup)
            .await?;
        s.put(client, o, SecGroupSlot::IagAll, format!("sg_all_{name}"), ObjectSpec::IpAddrGroup)
            .await?;

        self.presence.midopresent = true;
        self.presence.population_failed = false;
        Ok(())
    }

    fn member_objects(
        &self,
        slot: &'static str,
        group: &ObjectId,
        addrs: &BTreeSet<Ipv4Addr>,
    ) -> BTreeMap<String, NewObject> {
        addrs
            .iter()
            .map(|addr| {
                let key = addr.to_string();
                let object = self.owner.object(
                    slot,
                    Some(&key),
                    format!("sg_{slot}_{}_{key}", self.owner.name),
                    ObjectSpec::IpAddrGroupAddr {
                        group: group.clone(),
                        addr: *addr,
                    },
                );
                (key, object)
            })
            .collect()
    }

    /// Make the address groups list exactly the model's member addresses
    pub async fn sync_members<A: MidoApi>(
        &mut self,
        client: &MidoClient<A>,
        gni: &GlobalNetworkInfo,
    ) -> SyncResult<bool> {
        let priv_group = self.slots.require(SecGroupSlot::IagPriv, &self.owner)?;
        let pub_group = self.slots.require(SecGroupSlot::IagPub, &self.owner)?;
        let all_group = self.slots.require(SecGroupSlot::IagAll, &self.owner)?;

        let members: Vec<_> = gni.members_of(self.name()).collect();
        let private: BTreeSet<Ipv4Addr> = members.iter().map(|i| i.private_ip).collect();
        let public: BTreeSet<Ipv4Addr> = members.iter().filter_map(|i| i.public_ip).collect();
        let all: BTreeSet<Ipv4Addr> = private.union(&public).copied().collect();

        let desired_priv = self.member_objects(PRIV_ADDRS, &priv_group, &private);
        let desired_pub = self.member_objects(PUB_ADDRS, &pub_group, &public);
        let desired_all = self.member_objects(ALL_ADDRS, &all_group, &all);

        let mut changed = self.priv_addrs.sync(client, &desired_priv).await?;
        changed |= self.pub_addrs.sync(client, &desired_pub).await?;
        changed |= self.all_addrs.sync(client, &desired_all).await?;
        self.flags.interfaces_changed = changed;
        Ok(changed)
    }

    /// Translate model rules for one direction, skipping the ones the
    /// backend cannot express
    fn chain_rules(
        &self,
        chain: &ObjectId,
        rules: &[GniRule],
        direction: Direction,
        resolve_group: &impl Fn(&str) -> Option<ObjectId>,
    ) -> SyncResult<Vec<NewObject>> {
        let mut translated = Vec::new();
        for (index, rule) in rules.iter().enumerate() {
            match translate_rule(rule, direction, resolve_group) {
                Ok(matches) => translated.extend(matches.into_iter().map(|m| (RuleAction::Accept, m))),
                Err(e) if e.is_skippable() => {
                    warn!(
                        secgroup = %self.name(),
                        direction = direction.as_str(),
                        rule = index,
                        error = %e,
                        "Skipping security group rule"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        let (slot, prefix) = match direction {
            Direction::Ingress => (INGRESS_RULES, "ingress"),
            Direction::Egress => (EGRESS_RULES, "egress"),
        };
        Ok(self.owner.rule_objects(
            slot,
            &format!("sg_{prefix}_{}", self.owner.name),
            positioned(chain, translated),
        ))
    }

    /// Regenerate both chains from the model rules.
    ///
    /// `resolve_group` maps a peer group name to its "all" address group.
    pub async fn sync_rules<A: MidoApi>(
        &mut self,
        client: &MidoClient<A>,
        group: &GniSecurityGroup,
        resolve_group: impl Fn(&str) -> Option<ObjectId>,
    ) -> SyncResult<bool> {
        let ingress_chain = self.slots.require(SecGroupSlot::IngressChain, &self.owner)?;
        let egress_chain = self.slots.require(SecGroupSlot::EgressChain, &self.owner)?;

        let ingress = self.chain_rules(
            &ingress_chain,
            &group.ingress_rules,
            Direction::Ingress,
            &resolve_group,
        )?;
        let egress =
            self.chain_rules(&egress_chain, &group.egress_rules, Direction::Egress, &resolve_group)?;

        self.flags.ingress_changed = self.ingress_rules.sync(client, &ingress).await?;
        self.flags.egress_changed = self.egress_rules.sync(client, &egress).await?;
        Ok(self.flags.ingress_changed || self.flags.egress_changed)
    }

    pub async fn delete<A: MidoApi>(&mut self, client: &MidoClient<A>) -> SyncResult<()> {
        self.egress_rules.delete_all(client).await?;
        self.ingress_rules.delete_all(client).await?;
        self.all_addrs.delete_all(client).await?;
        self.pub_addrs.delete_all(client).await?;
        self.priv_addrs.delete_all(client).await?;
        self.slots.delete_all(client).await?;
        self.presence.midopresent = false;
        self.presence.population_failed = false;
        Ok(())
    }

    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.slots
            .ids()
            .chain(self.priv_addrs.ids())
            .chain(self.pub_addrs.ids())
            .chain(self.all_addrs.ids())
            .chain(self.ingress_rules.ids())
            .chain(self.egress_rules.ids())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryApi;
    use crate::config::RetryConfig;
    use crate::rules::PROTO_TCP;
    use mido_sync_common::ObjectKind;
    use mido_sync_common::gni::GniInterface;

    fn member(name: &str, private: [u8; 4], public: Option<[u8; 4]>) -> GniInterface {
        GniInterface {
            name: name.to_string(),
            instance_id: format!("i-{name}"),
            vpc: "vpc-1".to_string(),
            subnet: "subnet-1".to_string(),
            mac: "d0:0d:00:00:00:01".to_string(),
            private_ip: Ipv4Addr::from(private),
            public_ip: public.map(Ipv4Addr::from),
            node: "node-1".to_string(),
            security_groups: vec!["sg-web".to_string()],
            src_dst_check: true,
        }
    }

    fn tcp(port: i32, cidrs: &[&str], groups: &[&str]) -> GniRule {
        GniRule {
            protocol: PROTO_TCP,
            from_port: Some(port),
            to_port: Some(port),
            icmp_type: None,
            icmp_code: None,
            cidrs: cidrs.iter().map(|c| c.to_string()).collect(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
        }
    }

    fn group(ingress: Vec<GniRule>) -> GniSecurityGroup {
        GniSecurityGroup {
            name: "sg-web".to_string(),
            ingress_rules: ingress,
            egress_rules: vec![],
        }
    }

    async fn created(api: &MemoryApi) -> (MidoClient<MemoryApi>, SecGroup) {
        let client = MidoClient::new(api.clone(), RetryConfig::default());
        let mut sg = SecGroup::new("sg-web");
        sg.ensure(&client).await.unwrap();
        (client, sg)
    }

    #[tokio::test]
    async fn test_members_track_model() {
        let api = MemoryApi::new();
        let (client, mut sg) = created(&api).await;
        let mut gni = GlobalNetworkInfo {
            interfaces: vec![
                member("eni-1", [10, 0, 1, 10], Some([203, 0, 113, 50])),
                member("eni-2", [10, 0, 1, 11], None),
            ],
            ..Default::default()
        };

        assert!(sg.sync_members(&client, &gni).await.unwrap());
        assert_eq!((sg.priv_addrs.len(), sg.pub_addrs.len(), sg.all_addrs.len()), (2, 1, 3));
        assert!(!sg.sync_members(&client, &gni).await.unwrap());
        assert!(!sg.flags.interfaces_changed);

        gni.interfaces.pop();
        assert!(sg.sync_members(&client, &gni).await.unwrap());
        assert_eq!(sg.all_addrs.keys().collect::<Vec<_>>(), vec!["10.0.1.10", "203.0.113.50"]);
    }

    #[tokio::test]
    async fn test_rules_skip_unsupported_and_keep_order() {
        let api = MemoryApi::new();
        let (client, mut sg) = created(&api).await;
        let all = sg.all_group().cloned().unwrap();
        let resolve = |name: &str| (name == "sg-web").then(|| all.clone());

        let mut bad = tcp(22, &["0.0.0.0/0"], &[]);
        bad.protocol = 47;
        let rules = vec![
            tcp(22, &["10.0.0.0/8"], &["sg-web"]),
            bad,
            tcp(80, &["0.0.0.0/0"], &["sg-missing"]),
            tcp(443, &["0.0.0.0/0"], &[]),
        ];
        assert!(sg.sync_rules(&client, &group(rules.clone()), resolve).await.unwrap());
        // rule 0 yields two entries; rules 1 and 2 are skipped
        assert_eq!(sg.ingress_rules.len(), 3);
        let positions: Vec<u32> = sg
            .ingress_rules
            .rules()
            .iter()
            .filter_map(|r| r.as_rule().map(|r| r.position))
            .collect();
        assert_eq!(positions, vec![0, 1, 2]);

        assert!(!sg.sync_rules(&client, &group(rules), resolve).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_leaves_nothing() {
        let api = MemoryApi::new();
        let (client, mut sg) = created(&api).await;
        let gni = GlobalNetworkInfo {
            interfaces: vec![member("eni-1", [10, 0, 1, 10], None)],
            ..Default::default()
        };
        sg.sync_members(&client, &gni).await.unwrap();
        sg.sync_rules(&client, &group(vec![tcp(22, &["0.0.0.0/0"], &[])]), |_| None)
            .await
            .unwrap();

        let inventory = Inventory::scan(&client).await.unwrap();
        let mut rebuilt = SecGroup::new("sg-web");
        let mut known = BTreeSet::new();
        rebuilt.populate_slots(&inventory, &mut known);
        rebuilt.populate_members(&inventory, &mut known);
        assert!(rebuilt.presence.midopresent);
        assert_eq!(rebuilt.ids().count(), sg.ids().count());

        rebuilt.delete(&client).await.unwrap();
        assert!(api.is_empty());
        assert!(api.objects_of(ObjectKind::Chain).is_empty());
    }
}
