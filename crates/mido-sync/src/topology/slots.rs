//! Object-slot tables
//!
//! Every entity owns a fixed set of named backend objects (its slots) plus
//! a few keyed collections (address-group members, routes, chain rules).
//! All of them are filled from backend tags on populate and reconciled
//! against desired objects on build.

use crate::backend::{MidoApi, MidoClient, MidoObject, NewObject, ObjectId, ObjectSpec, RuleSpec};
use crate::error::{SyncError, SyncResult};
use chrono::Utc;
use mido_sync_common::tags::{
    self, TAG_CREATED_AT, TAG_ENTITY, TAG_KEY, TAG_OWNER, TAG_PARENT, TAG_SLOT, TAG_TOOL,
    TAG_TOOL_VALUE, Tags,
};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::debug;

/// Closed set of slot names for one entity kind
pub trait SlotKey: Copy + Ord + fmt::Debug + 'static {
    /// Every slot, in creation (dependency) order
    const ALL: &'static [Self];

    /// Slot name as written to [`TAG_SLOT`]
    fn as_str(self) -> &'static str;
}

/// Tag identity shared by all objects of one entity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Owner {
    pub entity: &'static str,
    pub name: String,
    pub parent: Option<String>,
}

impl Owner {
    pub fn new(entity: &'static str, name: impl Into<String>, parent: Option<String>) -> Self {
        Self {
            entity,
            name: name.into(),
            parent,
        }
    }

    /// `"vpc vpc-1"`, for logs and errors
    pub fn label(&self) -> String {
        format!("{} {}", self.entity, self.name)
    }

    pub fn tags(&self, slot: &str, key: Option<&str>) -> Tags {
        let mut tags = Tags::from([
            (TAG_TOOL.to_string(), TAG_TOOL_VALUE.to_string()),
            (TAG_ENTITY.to_string(), self.entity.to_string()),
            (TAG_OWNER.to_string(), self.name.clone()),
            (TAG_SLOT.to_string(), slot.to_string()),
            (TAG_CREATED_AT.to_string(), tags::format_created_at(Utc::now())),
        ]);
        if let Some(parent) = &self.parent {
            tags.insert(TAG_PARENT.to_string(), parent.clone());
        }
        if let Some(key) = key {
            tags.insert(TAG_KEY.to_string(), key.to_string());
        }
        tags
    }

    /// Desired object for a slot or collection member
    pub fn object(
        &self,
        slot: &str,
        key: Option<&str>,
        name: impl Into<String>,
        spec: ObjectSpec,
    ) -> NewObject {
        NewObject {
            name: name.into(),
            tags: self.tags(slot, key),
            spec,
        }
    }

    /// Desired members of a [`RuleList`], keyed by position
    pub fn rule_objects(&self, slot: &str, name_prefix: &str, rules: Vec<RuleSpec>) -> Vec<NewObject> {
        rules
            .into_iter()
            .map(|rule| {
                let position = rule.position.to_string();
                self.object(
                    slot,
                    Some(&position),
                    format!("{name_prefix}_{position}"),
                    ObjectSpec::Rule(rule),
                )
            })
            .collect()
    }
}

/// Pick the lowest-id candidate whose references are all known
fn pick<'a>(
    candidates: impl Iterator<Item = &'a MidoObject>,
    known: &BTreeSet<ObjectId>,
) -> Option<&'a MidoObject> {
    candidates
        .filter(|c| c.references().into_iter().all(|r| known.contains(r)))
        .min_by(|a, b| a.id.cmp(&b.id))
}

/// Fixed table of named objects.
///
/// A keyed table holds one instance of the slot set per key (one per
/// gateway host, for example); its objects carry the key in [`TAG_KEY`].
#[derive(Debug, Clone)]
pub struct SlotTable<K: SlotKey> {
    key: Option<String>,
    slots: BTreeMap<K, MidoObject>,
}

impl<K: SlotKey> Default for SlotTable<K> {
    fn default() -> Self {
        Self {
            key: None,
            slots: BTreeMap::new(),
        }
    }
}

impl<K: SlotKey> SlotTable<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keyed(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            slots: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    /// Fill slots from backend candidates, in dependency order.
    ///
    /// Chosen ids are added to `known` so later slots (and later entities)
    /// can reference them. Returns the number of slots filled.
    pub fn populate(&mut self, candidates: &[&MidoObject], known: &mut BTreeSet<ObjectId>) -> usize {
        self.slots.clear();
        for &slot in K::ALL {
            let matching = candidates
                .iter()
                .copied()
                .filter(|c| c.slot() == Some(slot.as_str()) && c.key() == self.key.as_deref());
            if let Some(chosen) = pick(matching, known) {
                known.insert(chosen.id.clone());
                self.slots.insert(slot, chosen.clone());
            }
        }
        self.slots.len()
    }

    pub fn get(&self, slot: K) -> Option<&MidoObject> {
        self.slots.get(&slot)
    }

    pub fn id(&self, slot: K) -> Option<&ObjectId> {
        self.slots.get(&slot).map(|o| &o.id)
    }

    /// Id of a slot that must already exist
    pub fn require(&self, slot: K, owner: &Owner) -> SyncResult<ObjectId> {
        self.id(slot)
            .cloned()
            .ok_or_else(|| SyncError::dependency(owner.label(), format!("slot {}", slot.as_str())))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Every slot is filled
    pub fn is_complete(&self) -> bool {
        K::ALL.iter().all(|s| self.slots.contains_key(s))
    }

    /// Slots that are not filled
    pub fn missing(&self) -> Vec<K> {
        K::ALL
            .iter()
            .copied()
            .filter(|s| !self.slots.contains_key(s))
            .collect()
    }

    pub fn objects(&self) -> impl Iterator<Item = &MidoObject> {
        self.slots.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.slots.values().map(|o| &o.id)
    }

    /// Make a slot hold `desired`, replacing a drifted object.
    pub async fn ensure<A: MidoApi>(
        &mut self,
        client: &MidoClient<A>,
        slot: K,
        desired: NewObject,
    ) -> SyncResult<ObjectId> {
        if let Some(current) = self.slots.get(&slot) {
            if desired.matches(current) {
                return Ok(current.id.clone());
            }
            debug!(slot = slot.as_str(), id = %current.id, "Slot drifted, replacing");
            client.delete(current).await?;
            self.slots.remove(&slot);
        }
        let created = client.create(&desired).await?;
        let id = created.id.clone();
        self.slots.insert(slot, created);
        Ok(id)
    }

    /// [`ensure`](Self::ensure) an object tagged for this table's owner and key
    pub async fn put<A: MidoApi>(
        &mut self,
        client: &MidoClient<A>,
        owner: &Owner,
        slot: K,
        name: impl Into<String>,
        spec: ObjectSpec,
    ) -> SyncResult<ObjectId> {
        let desired = owner.object(slot.as_str(), self.key.as_deref(), name, spec);
        self.ensure(client, slot, desired).await
    }

    /// Drop a slot without touching the backend; the object is left for
    /// cleanup to find
    pub fn forget(&mut self, slot: K) -> Option<MidoObject> {
        self.slots.remove(&slot)
    }

    /// Delete one slot's object
    pub async fn remove<A: MidoApi>(&mut self, client: &MidoClient<A>, slot: K) -> SyncResult<()> {
        if let Some(current) = self.slots.get(&slot) {
            client.delete(current).await?;
            self.slots.remove(&slot);
        }
        Ok(())
    }

    /// Delete every filled slot in reverse dependency order
    pub async fn delete_all<A: MidoApi>(&mut self, client: &MidoClient<A>) -> SyncResult<()> {
        for &slot in K::ALL.iter().rev() {
            self.remove(client, slot).await?;
        }
        Ok(())
    }
}

/// Keyed collection of objects sharing one slot name
#[derive(Debug, Clone)]
pub struct ObjectMap {
    slot: &'static str,
    entries: BTreeMap<String, MidoObject>,
}

impl ObjectMap {
    pub fn new(slot: &'static str) -> Self {
        Self {
            slot,
            entries: BTreeMap::new(),
        }
    }

    pub fn slot(&self) -> &'static str {
        self.slot
    }

    pub fn populate(&mut self, candidates: &[&MidoObject], known: &mut BTreeSet<ObjectId>) -> usize {
        self.entries.clear();
        let keys: BTreeSet<&str> = candidates
            .iter()
            .filter(|c| c.slot() == Some(self.slot))
            .filter_map(|c| c.key())
            .collect();
        for key in keys {
            let matching = candidates
                .iter()
                .copied()
                .filter(|c| c.slot() == Some(self.slot) && c.key() == Some(key));
            if let Some(chosen) = pick(matching, known) {
                known.insert(chosen.id.clone());
                self.entries.insert(key.to_string(), chosen.clone());
            }
        }
        self.entries.len()
    }

    pub fn get(&self, key: &str) -> Option<&MidoObject> {
        self.entries.get(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.entries.values().map(|o| &o.id)
    }

    /// Reconcile to `desired`: stale and drifted entries are deleted
    /// before missing ones are created. Returns true if anything changed.
    pub async fn sync<A: MidoApi>(
        &mut self,
        client: &MidoClient<A>,
        desired: &BTreeMap<String, NewObject>,
    ) -> SyncResult<bool> {
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(key, current)| !desired.get(*key).is_some_and(|d| d.matches(current)))
            .map(|(key, _)| key.clone())
            .collect();
        let mut changed = !stale.is_empty();
        for key in stale {
            if let Some(current) = self.entries.get(&key) {
                client.delete(current).await?;
                self.entries.remove(&key);
            }
        }

        for (key, object) in desired {
            if self.entries.contains_key(key) {
                continue;
            }
            let created = client.create(object).await?;
            self.entries.insert(key.clone(), created);
            changed = true;
        }
        Ok(changed)
    }

    pub async fn delete_all<A: MidoApi>(&mut self, client: &MidoClient<A>) -> SyncResult<()> {
        let keys: Vec<String> = self.entries.keys().cloned().collect();
        for key in keys {
            if let Some(current) = self.entries.get(&key) {
                client.delete(current).await?;
                self.entries.remove(&key);
            }
        }
        Ok(())
    }
}

/// Ordered rules of one chain, keyed by position
#[derive(Debug, Clone)]
pub struct RuleList {
    slot: &'static str,
    rules: Vec<MidoObject>,
}

impl RuleList {
    pub fn new(slot: &'static str) -> Self {
        Self {
            slot,
            rules: Vec::new(),
        }
    }

    pub fn slot(&self) -> &'static str {
        self.slot
    }

    pub fn populate(&mut self, candidates: &[&MidoObject], known: &mut BTreeSet<ObjectId>) -> usize {
        self.rules.clear();
        let positions: BTreeSet<u32> = candidates
            .iter()
            .filter(|c| c.slot() == Some(self.slot))
            .filter_map(|c| c.key()?.parse().ok())
            .collect();
        for position in positions {
            let key = position.to_string();
            let matching = candidates
                .iter()
                .copied()
                .filter(|c| c.slot() == Some(self.slot) && c.key() == Some(key.as_str()));
            if let Some(chosen) = pick(matching, known) {
                known.insert(chosen.id.clone());
                self.rules.push(chosen.clone());
            }
        }
        self.rules.len()
    }

    pub fn rules(&self) -> &[MidoObject] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.rules.iter().map(|o| &o.id)
    }

    /// Reconcile to `desired`, keeping the longest matching prefix and
    /// rewriting the tail. Returns true if anything changed.
    pub async fn sync<A: MidoApi>(
        &mut self,
        client: &MidoClient<A>,
        desired: &[NewObject],
    ) -> SyncResult<bool> {
        let keep = self
            .rules
            .iter()
            .zip(desired)
            .take_while(|(current, wanted)| wanted.matches(current))
            .count();
        if keep == self.rules.len() && keep == desired.len() {
            return Ok(false);
        }

        while self.rules.len() > keep {
            if let Some(last) = self.rules.last() {
                client.delete(last).await?;
            }
            self.rules.pop();
        }
        for wanted in &desired[keep..] {
            let created = client.create(wanted).await?;
            self.rules.push(created);
        }
        Ok(true)
    }

    pub async fn delete_all<A: MidoApi>(&mut self, client: &MidoClient<A>) -> SyncResult<()> {
        self.sync(client, &[]).await.map(|_| ())
    }
}

/// Presence flags of one entity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Presence {
    /// Entity is in the desired-state model
    pub gnipresent: bool,
    /// Every required slot resolved on the backend
    pub midopresent: bool,
    /// Some, but not all, required slots resolved
    pub population_failed: bool,
}

impl Presence {
    /// Derive backend presence from how many of `total` slots were filled
    pub fn from_population(filled: usize, total: usize) -> Self {
        Self {
            gnipresent: false,
            midopresent: total > 0 && filled == total,
            population_failed: filled > 0 && filled < total,
        }
    }

    pub fn state(&self) -> EntityState {
        match (self.gnipresent, self.midopresent, self.population_failed) {
            (true, true, _) => EntityState::Present,
            (true, false, _) => EntityState::ToCreate,
            (false, true, _) | (false, false, true) => EntityState::ToDelete,
            (false, false, false) => EntityState::Absent,
        }
    }
}

/// Builder state of one entity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityState {
    /// Neither in the model nor on the backend
    Absent,
    /// In the model, missing or partial on the backend
    ToCreate,
    /// In the model and complete on the backend
    Present,
    /// On the backend (fully or partially) but not in the model
    ToDelete,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryApi, RuleAction, RuleSpec};
    use crate::config::RetryConfig;
    use mido_sync_common::tags::entity;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
    enum TestSlot {
        Chain,
        Router,
    }

    impl SlotKey for TestSlot {
        const ALL: &'static [Self] = &[TestSlot::Chain, TestSlot::Router];

        fn as_str(self) -> &'static str {
            match self {
                TestSlot::Chain => "chain",
                TestSlot::Router => "router",
            }
        }
    }

    fn owner() -> Owner {
        Owner::new(entity::VPC, "vpc-1", None)
    }

    fn client(api: &MemoryApi) -> MidoClient<MemoryApi> {
        MidoClient::new(api.clone(), RetryConfig::default())
    }

    fn router(chain: &ObjectId) -> ObjectSpec {
        ObjectSpec::Router {
            inbound_filter: Some(chain.clone()),
            outbound_filter: None,
        }
    }

    #[test]
    fn test_owner_tags() {
        let owner = Owner::new(entity::SUBNET, "subnet-1", Some("vpc-1".to_string()));
        let tags = owner.tags("bridge", None);
        assert!(tags::is_managed(&tags));
        assert_eq!(tags.get(TAG_PARENT).map(String::as_str), Some("vpc-1"));
        assert!(tags.contains_key(TAG_CREATED_AT));
        assert!(!tags.contains_key(TAG_KEY));
        assert_eq!(owner.label(), "subnet subnet-1");
    }

    #[test]
    fn test_presence_states() {
        let mut p = Presence::from_population(0, 3);
        assert_eq!(p.state(), EntityState::Absent);
        p.gnipresent = true;
        assert_eq!(p.state(), EntityState::ToCreate);

        let mut p = Presence::from_population(3, 3);
        assert_eq!(p.state(), EntityState::ToDelete);
        p.gnipresent = true;
        assert_eq!(p.state(), EntityState::Present);

        let p = Presence::from_population(1, 3);
        assert!(p.population_failed);
        assert!(!p.midopresent);
        assert_eq!(p.state(), EntityState::ToDelete);
    }

    #[tokio::test]
    async fn test_populate_prefers_lowest_id_with_known_refs() {
        let api = MemoryApi::new();
        let o = owner();
        let chain = api.insert_raw("c", o.tags("chain", None), ObjectSpec::Chain);
        // References a chain that does not exist: never chosen
        let broken = api.insert_raw("r", o.tags("router", None), router(&"chain-999999".into()));
        let good = api.insert_raw("r", o.tags("router", None), router(&chain.id));
        let dup = api.insert_raw("r", o.tags("router", None), router(&chain.id));

        let objects = api.objects();
        let candidates: Vec<&MidoObject> = objects.iter().collect();
        let mut table = SlotTable::<TestSlot>::new();
        let mut known = BTreeSet::new();
        assert_eq!(table.populate(&candidates, &mut known), 2);
        assert!(table.is_complete());
        assert_eq!(table.id(TestSlot::Router), Some(&good.id));
        assert!(known.contains(&good.id));
        assert!(!known.contains(&broken.id));
        assert!(!known.contains(&dup.id));
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent_and_replaces_drift() {
        let api = MemoryApi::new();
        let client = client(&api);
        let o = owner();
        let mut table = SlotTable::<TestSlot>::new();

        let chain = table
            .ensure(&client, TestSlot::Chain, o.object("chain", None, "c", ObjectSpec::Chain))
            .await
            .unwrap();
        let r1 = table
            .ensure(&client, TestSlot::Router, o.object("router", None, "r", router(&chain)))
            .await
            .unwrap();
        let again = table
            .ensure(&client, TestSlot::Router, o.object("router", None, "r", router(&chain)))
            .await
            .unwrap();
        assert_eq!(r1, again);
        assert_eq!(client.stats().created, 2);

        let renamed = table
            .ensure(&client, TestSlot::Router, o.object("router", None, "r2", router(&chain)))
            .await
            .unwrap();
        assert_ne!(renamed, r1);
        assert!(api.get(&r1).is_none());

        table.delete_all(&client).await.unwrap();
        assert!(table.is_empty());
        assert!(api.is_empty());
    }

    #[tokio::test]
    async fn test_require_missing_slot() {
        let table = SlotTable::<TestSlot>::new();
        let err = table.require(TestSlot::Router, &owner()).unwrap_err();
        assert!(matches!(err, SyncError::DependencyMissing { .. }));
        assert_eq!(table.missing(), vec![TestSlot::Chain, TestSlot::Router]);
    }

    #[tokio::test]
    async fn test_object_map_sync() {
        let api = MemoryApi::new();
        let client = client(&api);
        let o = owner();
        let mut map = ObjectMap::new("addr");

        let desired = |keys: &[&str]| -> BTreeMap<String, NewObject> {
            keys.iter()
                .map(|k| {
                    (
                        k.to_string(),
                        o.object("addr", Some(*k), format!("chain_{k}"), ObjectSpec::Chain),
                    )
                })
                .collect()
        };

        assert!(map.sync(&client, &desired(&["a", "b"])).await.unwrap());
        assert!(!map.sync(&client, &desired(&["a", "b"])).await.unwrap());
        assert!(map.sync(&client, &desired(&["b", "c"])).await.unwrap());
        assert_eq!(map.keys().collect::<Vec<_>>(), vec!["b", "c"]);
        assert_eq!(api.len(), 2);

        // Rebuild from the backend
        let objects = api.objects();
        let candidates: Vec<&MidoObject> = objects.iter().collect();
        let mut rebuilt = ObjectMap::new("addr");
        assert_eq!(rebuilt.populate(&candidates, &mut BTreeSet::new()), 2);
    }

    #[tokio::test]
    async fn test_rule_list_keeps_common_prefix() {
        let api = MemoryApi::new();
        let client = client(&api);
        let o = owner();
        let chain = client
            .create(&o.object("chain", None, "c", ObjectSpec::Chain))
            .await
            .unwrap();

        let rules = |actions: &[RuleAction]| -> Vec<NewObject> {
            actions
                .iter()
                .enumerate()
                .map(|(pos, action)| {
                    let pos = pos as u32;
                    o.object(
                        "rules",
                        Some(&pos.to_string()),
                        format!("rule_{pos}"),
                        ObjectSpec::Rule(RuleSpec::new(chain.id.clone(), pos, action.clone())),
                    )
                })
                .collect()
        };

        let mut list = RuleList::new("rules");
        list.sync(&client, &rules(&[RuleAction::Accept, RuleAction::Drop]))
            .await
            .unwrap();
        let first = list.rules()[0].id.clone();

        client.api().reset_counters();
        let changed = list
            .sync(
                &client,
                &rules(&[RuleAction::Accept, RuleAction::Return, RuleAction::Drop]),
            )
            .await
            .unwrap();
        assert!(changed);
        assert_eq!(list.rules()[0].id, first, "prefix kept");
        assert_eq!(list.len(), 3);
        let counters = api.counters();
        assert_eq!((counters.creates, counters.deletes), (2, 1));

        let objects = api.objects();
        let candidates: Vec<&MidoObject> = objects.iter().collect();
        let mut known = BTreeSet::from([chain.id.clone()]);
        let mut rebuilt = RuleList::new("rules");
        assert_eq!(rebuilt.populate(&candidates, &mut known), 3);
        assert_eq!(rebuilt.rules()[0].id, first);

        list.delete_all(&client).await.unwrap();
        assert!(list.is_empty());
        assert_eq!(api.len(), 1);
    }
}
