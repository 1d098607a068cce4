//! Operator commands: teardown, inventory listing, targeted delete, cleanup
//! and plan

use super::cleanup::{self, CleanupConfig, CleanupReport, delete_stale, find_stale};
use super::report::{EntityStatus, RunReport};
use super::{Reconciler, delete_subnet_tree, delete_vpc_tree};
use crate::backend::{
    BackendError, Inventory, MemoryApi, MidoApi, MidoClient, MidoObject, ObjectId,
};
use crate::config::MidoConfig;
use crate::error::{SyncError, SyncResult};
use crate::topology::Context;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use mido_sync_common::gni::GlobalNetworkInfo;
use mido_sync_common::tags::{CORE_OWNER, TAG_ENTITY, TAG_PARENT, entity};
use serde::Serialize;
use std::collections::BTreeSet;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

/// One tagged backend object, as shown by `list`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InventoryEntry {
    pub kind: String,
    pub id: String,
    pub name: String,
    pub entity: Option<String>,
    pub owner: Option<String>,
    pub parent: Option<String>,
    pub slot: Option<String>,
    pub key: Option<String>,
}

impl From<&MidoObject> for InventoryEntry {
    fn from(object: &MidoObject) -> Self {
        Self {
            kind: object.kind().to_string(),
            id: object.id.to_string(),
            name: object.name.clone(),
            entity: object.tag(TAG_ENTITY).map(str::to_string),
            owner: object.owner().map(str::to_string),
            parent: object.tag(TAG_PARENT).map(str::to_string),
            slot: object.slot().map(str::to_string),
            key: object.key().map(str::to_string),
        }
    }
}

/// Render inventory entries as a table
pub fn render_inventory_table(entries: &[InventoryEntry]) -> String {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["Kind", "ID", "Name", "Owner", "Slot"]);

    for entry in entries {
        let owner = match (&entry.entity, &entry.owner, &entry.parent) {
            (Some(e), Some(o), Some(p)) => format!("{e} {o} ({p})"),
            (Some(e), Some(o), None) => format!("{e} {o}"),
            _ => "-".to_string(),
        };
        let slot = match (&entry.slot, &entry.key) {
            (Some(s), Some(k)) => format!("{s}[{k}]"),
            (Some(s), None) => s.clone(),
            _ => "-".to_string(),
        };
        table.add_row(vec![
            entry.kind.clone(),
            entry.id.clone(),
            entry.name.clone(),
            owner,
            slot,
        ]);
    }
    table.to_string()
}

/// Result of a targeted delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteOutcome {
    /// Identifier as given
    pub target: String,
    /// Entity kind, or the backend object kind for raw ids
    pub kind: String,
    /// Backend objects held by the target (with its children)
    pub objects: usize,
    pub dry_run: bool,
}

/// Result of a plan: what a run would do to the live backend
#[derive(Debug, Clone, Serialize)]
pub struct PlanReport {
    pub run: RunReport,
    pub to_create: Vec<InventoryEntry>,
    pub to_delete: Vec<InventoryEntry>,
}

impl PlanReport {
    pub fn is_empty(&self) -> bool {
        self.to_create.is_empty() && self.to_delete.is_empty()
    }
}

/// Entity an identifier prefix refers to
fn entity_for(id: &str) -> Option<&'static str> {
    if id.starts_with("vpc-") {
        Some(entity::VPC)
    } else if id.starts_with("subnet-") {
        Some(entity::SUBNET)
    } else if id.starts_with("nat-") {
        Some(entity::NAT_GATEWAY)
    } else if id.starts_with("eni-") || id.starts_with("i-") {
        Some(entity::INSTANCE)
    } else if id.starts_with("sg-") {
        Some(entity::SECGROUP)
    } else {
        None
    }
}

/// Number of backend objects an entity holds, children included
fn held_objects(ctx: &Context, kind: &str, id: &str) -> Option<usize> {
    match kind {
        entity::VPC => {
            let vpc = ctx.find_vpc(id)?;
            let children: usize = vpc
                .subnets
                .values()
                .map(|s| {
                    s.ids().count()
                        + s.instances.values().map(|i| i.ids().count()).sum::<usize>()
                        + s.nat_gateways.values().map(|n| n.ids().count()).sum::<usize>()
                })
                .sum();
            Some(vpc.ids().count() + children)
        }
        entity::SUBNET => {
            let (_, s) = ctx.find_subnet_global(id)?;
            Some(
                s.ids().count()
                    + s.instances.values().map(|i| i.ids().count()).sum::<usize>()
                    + s.nat_gateways.values().map(|n| n.ids().count()).sum::<usize>(),
            )
        }
        entity::NAT_GATEWAY => ctx.find_nat_gateway_global(id).map(|(_, _, n)| n.ids().count()),
        entity::INSTANCE => ctx.find_instance_global(id).map(|(_, _, i)| i.ids().count()),
        entity::SECGROUP => ctx.find_secgroup(id).map(|g| g.ids().count()),
        _ => None,
    }
}

impl<A: MidoApi> Reconciler<A> {
    /// Delete everything mido-sync owns, entities first (children before
    /// parents), then any tagged object left over.
    ///
    /// The context is discarded afterwards.
    pub async fn teardown(&mut self, dry_run: bool) -> SyncResult<RunReport> {
        let start = self.client.stats();
        let mut report = RunReport::new(Uuid::now_v7().to_string());
        info!(dry_run, "Tearing down managed topology");

        let inventory = Inventory::scan(&self.client).await?;
        if dry_run {
            let stale = find_stale(&inventory, &BTreeSet::new());
            report.cleanup = Some(delete_stale(&self.client, stale, &CleanupConfig::default()).await);
            return Ok(report);
        }

        let mut ctx = Context::populate(&self.config, &inventory, &GlobalNetworkInfo::default());

        for (name, vpc) in ctx.vpcs.iter_mut() {
            let status = match delete_vpc_tree(&self.client, vpc, &mut ctx.router_ids).await {
                Ok(()) => EntityStatus::Deleted,
                Err(e) => EntityStatus::Failed(e.to_string()),
            };
            report.record(entity::VPC, name.as_str(), status);
        }
        for (name, sg) in ctx.secgroups.iter_mut() {
            let status = match sg.delete(&self.client).await {
                Ok(()) => EntityStatus::Deleted,
                Err(e) => EntityStatus::Failed(e.to_string()),
            };
            report.record(entity::SECGROUP, name.as_str(), status);
        }
        let status = match ctx.core.delete(&self.client).await {
            Ok(()) => EntityStatus::Deleted,
            Err(e) => EntityStatus::Failed(e.to_string()),
        };
        report.record(entity::CORE, CORE_OWNER, status);

        let sweep = cleanup::cleanup(&self.client, &BTreeSet::new(), &CleanupConfig { dry_run: false }).await?;
        report.cleanup = Some(sweep);
        self.reinitialize();

        let end = self.client.stats();
        report.created = end.created - start.created;
        report.deleted = end.deleted - start.deleted;
        info!(deleted = report.deleted, "Teardown complete");
        Ok(report)
    }

    /// Every tagged object on the backend
    pub async fn list_inventory(&self) -> Result<Vec<InventoryEntry>, BackendError> {
        let inventory = Inventory::scan(&self.client).await?;
        Ok(inventory.managed().map(InventoryEntry::from).collect())
    }

    /// Delete one entity with its children, or one tagged object by raw id.
    ///
    /// Entity identifiers are recognized by prefix (`vpc-`, `subnet-`,
    /// `nat-`, `eni-`/`i-`, `sg-`). With `dry_run` nothing is deleted.
    pub async fn delete_vpc_object(&mut self, id: &str, dry_run: bool) -> SyncResult<DeleteOutcome> {
        let inventory = Inventory::scan(&self.client).await?;
        let mut ctx = Context::populate(&self.config, &inventory, &GlobalNetworkInfo::default());

        let held = entity_for(id).and_then(|kind| Some((kind, held_objects(&ctx, kind, id)?)));
        let Some((kind, objects)) = held else {
            return self.delete_raw_object(&inventory, id, dry_run).await;
        };

        let outcome = DeleteOutcome {
            target: id.to_string(),
            kind: kind.to_string(),
            objects,
            dry_run,
        };
        if dry_run {
            info!(object = %id, kind, objects, "[DRY RUN] Would delete");
            return Ok(outcome);
        }

        let client = &self.client;
        let router_ids = &mut ctx.router_ids;
        match kind {
            entity::VPC => {
                if let Some(vpc) = ctx.vpcs.get_mut(id) {
                    delete_vpc_tree(client, vpc, router_ids).await?;
                }
            }
            entity::SUBNET => {
                let subnet = ctx.vpcs.values_mut().find_map(|v| v.subnets.get_mut(id));
                if let Some(subnet) = subnet {
                    delete_subnet_tree(client, subnet, router_ids).await?;
                    subnet.presence.midopresent = false;
                }
            }
            entity::NAT_GATEWAY => {
                let natg = ctx
                    .vpcs
                    .values_mut()
                    .flat_map(|v| v.subnets.values_mut())
                    .find_map(|s| s.nat_gateways.get_mut(id));
                if let Some(natg) = natg {
                    natg.delete(client, router_ids).await?;
                }
            }
            entity::INSTANCE => {
                let instance = ctx
                    .vpcs
                    .values_mut()
                    .flat_map(|v| v.subnets.values_mut())
                    .flat_map(|s| s.instances.values_mut())
                    .find(|i| i.name() == id || i.instance_id() == Some(id));
                if let Some(instance) = instance {
                    instance.delete(client).await?;
                }
            }
            _ => {
                if let Some(sg) = ctx.secgroups.get_mut(id) {
                    sg.delete(client).await?;
                }
            }
        }
        info!(object = %id, kind, objects, "Deleted");
        self.reinitialize();
        Ok(outcome)
    }

    async fn delete_raw_object(
        &mut self,
        inventory: &Inventory,
        id: &str,
        dry_run: bool,
    ) -> SyncResult<DeleteOutcome> {
        let object = inventory
            .get(&ObjectId::from(id))
            .filter(|o| o.is_managed())
            .ok_or_else(|| SyncError::UnknownObject(id.to_string()))?;
        let outcome = DeleteOutcome {
            target: id.to_string(),
            kind: object.kind().to_string(),
            objects: 1,
            dry_run,
        };
        if dry_run {
            info!(object = %id, kind = %object.kind(), "[DRY RUN] Would delete");
            return Ok(outcome);
        }
        self.client.delete(object).await?;
        info!(object = %id, kind = %object.kind(), "Deleted");
        self.reinitialize();
        Ok(outcome)
    }

    /// Remove duplicates and orphans relative to the current backend state
    pub async fn cleanup(&mut self, gni: &GlobalNetworkInfo, dry_run: bool) -> SyncResult<CleanupReport> {
        let referenced = self.populate(gni).await?.referenced_ids();
        let report = cleanup::cleanup(&self.client, &referenced, &CleanupConfig { dry_run }).await?;
        if !dry_run {
            self.reinitialize();
        }
        Ok(report)
    }
}

/// Reconcile against an in-memory copy of the live backend and report the
/// difference. The live backend is only listed.
pub async fn plan<A: MidoApi>(
    live: &MidoClient<A>,
    config: &MidoConfig,
    gni: &GlobalNetworkInfo,
) -> SyncResult<PlanReport> {
    let inventory = Inventory::scan(live).await?;
    let shadow = MemoryApi::from_objects(inventory.all().cloned());
    let mut reconciler = Reconciler::new(shadow.clone(), config.clone());
    let run = reconciler.run(gni, &CancellationToken::new()).await?;

    let after = Inventory::from_objects(shadow.objects());
    let to_create = after
        .all()
        .filter(|o| !inventory.contains(&o.id))
        .map(InventoryEntry::from)
        .collect();
    let to_delete = inventory
        .all()
        .filter(|o| !after.contains(&o.id))
        .map(InventoryEntry::from)
        .collect();
    Ok(PlanReport {
        run,
        to_create,
        to_delete,
    })
}
