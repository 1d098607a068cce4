//! Snapshot of every object on the backend, indexed by owner tags

use super::client::MidoClient;
use super::error::BackendError;
use super::object::{MidoObject, ObjectId};
use super::operations::MidoApi;
use futures::future::try_join_all;
use mido_sync_common::ObjectKind;
use mido_sync_common::tags::{TAG_ENTITY, TAG_PARENT};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Point-in-time view of the backend
#[derive(Debug, Clone, Default)]
pub struct Inventory {
    objects: BTreeMap<ObjectId, MidoObject>,
    /// (entity, owner) -> managed object ids
    by_owner: BTreeMap<(String, String), Vec<ObjectId>>,
}

impl Inventory {
    /// List every kind concurrently and index the result
    pub async fn scan<A: MidoApi>(client: &MidoClient<A>) -> Result<Self, BackendError> {
        let lists = try_join_all(ObjectKind::ALL.iter().map(|kind| client.list(*kind))).await?;
        let inventory = Self::from_objects(lists.into_iter().flatten());
        debug!(
            objects = inventory.len(),
            managed = inventory.managed().count(),
            "Scanned backend inventory"
        );
        Ok(inventory)
    }

    pub fn from_objects(objects: impl IntoIterator<Item = MidoObject>) -> Self {
        let mut inventory = Self::default();
        for object in objects {
            if object.is_managed() {
                if let (Some(entity), Some(owner)) = (object.tag(TAG_ENTITY), object.owner()) {
                    inventory
                        .by_owner
                        .entry((entity.to_string(), owner.to_string()))
                        .or_default()
                        .push(object.id.clone());
                }
            }
            inventory.objects.insert(object.id.clone(), object);
        }
        inventory
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, id: &ObjectId) -> Option<&MidoObject> {
        self.objects.get(id)
    }

    pub fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    /// Every object, ordered by id
    pub fn all(&self) -> impl Iterator<Item = &MidoObject> {
        self.objects.values()
    }

    /// Objects carrying the tool tag
    pub fn managed(&self) -> impl Iterator<Item = &MidoObject> {
        self.objects.values().filter(|o| o.is_managed())
    }

    /// Managed objects of one owner, optionally restricted to one parent
    pub fn owned_by(&self, entity: &str, owner: &str, parent: Option<&str>) -> Vec<&MidoObject> {
        self.by_owner
            .get(&(entity.to_string(), owner.to_string()))
            .into_iter()
            .flatten()
            .filter_map(|id| self.objects.get(id))
            .filter(|o| parent.is_none() || o.tag(TAG_PARENT) == parent)
            .collect()
    }

    /// Names of every owner of an entity kind
    pub fn owners(&self, entity: &str) -> BTreeSet<String> {
        self.by_owner
            .keys()
            .filter(|(e, _)| e == entity)
            .map(|(_, owner)| owner.clone())
            .collect()
    }

    /// Owners of an entity kind with at least one object under `parent`
    pub fn owners_under(&self, entity: &str, parent: &str) -> BTreeSet<String> {
        self.by_owner
            .iter()
            .filter(|((e, _), _)| e == entity)
            .filter(|(_, ids)| {
                ids.iter()
                    .filter_map(|id| self.objects.get(id))
                    .any(|o| o.tag(TAG_PARENT) == Some(parent))
            })
            .map(|((_, owner), _)| owner.clone())
            .collect()
    }

    /// Backend id of a registered host
    pub fn host_id(&self, name: &str) -> Option<&ObjectId> {
        self.objects
            .values()
            .find(|o| o.kind() == ObjectKind::Host && o.name == name)
            .map(|o| &o.id)
    }

    /// Ids of every registered host
    pub fn host_ids(&self) -> impl Iterator<Item = &ObjectId> {
        self.objects
            .values()
            .filter(|o| o.kind() == ObjectKind::Host)
            .map(|o| &o.id)
    }
}
