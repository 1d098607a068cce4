//! Tag-based duplicate and orphan cleanup
//!
//! After a run every managed object should be held by exactly one slot of
//! one entity. Anything else carrying the tool tag is either a duplicate
//! (same logical identity as a held object) or an orphan (no entity claims
//! it) and can be deleted.

use crate::backend::{Inventory, MidoApi, MidoClient, MidoObject, ObjectId};
use mido_sync_common::tags::ObjectIdentity;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Cleanup configuration
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Report findings without deleting anything
    pub dry_run: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self { dry_run: true }
    }
}

/// Why an object is considered stale
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StaleReason {
    /// Another live object with the same identity is held by an entity
    Duplicate,
    /// No entity holds an object with this identity
    Orphan,
}

/// A managed object no entity holds
#[derive(Debug, Clone)]
pub struct StaleObject {
    pub object: MidoObject,
    pub reason: StaleReason,
}

/// Report of cleanup operations
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub total_found: usize,
    pub duplicates: usize,
    pub orphans: usize,
    pub deleted: usize,
    /// Already removed, usually by a cascading parent delete
    pub already_gone: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl CleanupReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Managed objects that are not in `referenced`
pub fn find_stale(inventory: &Inventory, referenced: &BTreeSet<ObjectId>) -> Vec<StaleObject> {
    let held: BTreeSet<ObjectIdentity> = referenced
        .iter()
        .filter_map(|id| inventory.get(id)?.identity())
        .collect();

    inventory
        .managed()
        .filter(|o| !referenced.contains(&o.id))
        .map(|o| {
            let reason = match o.identity() {
                Some(identity) if held.contains(&identity) => StaleReason::Duplicate,
                _ => StaleReason::Orphan,
            };
            StaleObject {
                object: o.clone(),
                reason,
            }
        })
        .collect()
}

/// Delete stale objects in cleanup-priority order
pub async fn delete_stale<A: MidoApi>(
    client: &MidoClient<A>,
    mut stale: Vec<StaleObject>,
    config: &CleanupConfig,
) -> CleanupReport {
    let mut report = CleanupReport {
        total_found: stale.len(),
        ..Default::default()
    };

    if stale.is_empty() {
        info!("No stale objects found");
        return report;
    }

    info!(
        count = stale.len(),
        dry_run = config.dry_run,
        "Found stale objects"
    );

    stale.sort_by_key(|s| s.object.kind().cleanup_priority());

    for StaleObject { object, reason } in stale {
        match reason {
            StaleReason::Duplicate => report.duplicates += 1,
            StaleReason::Orphan => report.orphans += 1,
        }
        let identity = object
            .identity()
            .map(|i| i.to_string())
            .unwrap_or_default();

        if config.dry_run {
            info!(
                kind = %object.kind(),
                id = %object.id,
                name = %object.name,
                identity = %identity,
                reason = ?reason,
                "[DRY RUN] Would delete"
            );
            report.skipped += 1;
            continue;
        }

        match client.delete(&object).await {
            Ok(true) => {
                info!(kind = %object.kind(), id = %object.id, reason = ?reason, "Deleted");
                report.deleted += 1;
            }
            Ok(false) => {
                debug!(kind = %object.kind(), id = %object.id, "Already deleted");
                report.already_gone += 1;
            }
            Err(e) => {
                warn!(
                    kind = %object.kind(),
                    id = %object.id,
                    error = ?e,
                    "Failed to delete"
                );
                report.failed += 1;
            }
        }
    }

    report
}

/// Scan the backend and remove every managed object not in `referenced`
pub async fn cleanup<A: MidoApi>(
    client: &MidoClient<A>,
    referenced: &BTreeSet<ObjectId>,
    config: &CleanupConfig,
) -> Result<CleanupReport, crate::backend::BackendError> {
    info!(dry_run = config.dry_run, "Scanning for duplicate and orphaned objects");
    let inventory = Inventory::scan(client).await?;
    let stale = find_stale(&inventory, referenced);
    Ok(delete_stale(client, stale, config).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{MemoryApi, ObjectSpec, PortSpec};
    use crate::config::RetryConfig;
    use crate::topology::slots::Owner;
    use mido_sync_common::ObjectKind;
    use mido_sync_common::tags::entity;

    fn client() -> MidoClient<MemoryApi> {
        MidoClient::new(
            MemoryApi::new(),
            RetryConfig {
                max_retries: 1,
                min_delay_ms: 1,
                max_delay_ms: 1,
            },
        )
    }

    fn router(api: &MemoryApi, owner: &str) -> MidoObject {
        api.insert_raw(
            &format!("vr_{owner}"),
            Owner::new(entity::VPC, owner, None).tags("router", None),
            ObjectSpec::Router {
                inbound_filter: None,
                outbound_filter: None,
            },
        )
    }

    #[tokio::test]
    async fn test_find_stale_classifies_duplicates_and_orphans() {
        let client = client();
        let api = client.api();
        let held = router(api, "vpc-1");
        let duplicate = router(api, "vpc-1");
        let orphan = router(api, "vpc-2");
        api.add_host("node-1");

        let inventory = Inventory::scan(&client).await.unwrap();
        let referenced = BTreeSet::from([held.id.clone()]);
        let stale = find_stale(&inventory, &referenced);

        assert_eq!(stale.len(), 2);
        let reason_of = |id: &ObjectId| stale.iter().find(|s| &s.object.id == id).map(|s| s.reason);
        assert_eq!(reason_of(&duplicate.id), Some(StaleReason::Duplicate));
        assert_eq!(reason_of(&orphan.id), Some(StaleReason::Orphan));
    }

    #[tokio::test]
    async fn test_dry_run_deletes_nothing() {
        let client = client();
        router(client.api(), "vpc-1");

        let report = cleanup(&client, &BTreeSet::new(), &CleanupConfig::default())
            .await
            .unwrap();
        assert_eq!(report.total_found, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.deleted, 0);
        assert_eq!(client.api().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_in_priority_order_tolerates_cascade() {
        let client = client();
        let api = client.api();
        let router = router(api, "vpc-1");
        api.insert_raw(
            "vr_vpc-1_uplink",
            Owner::new(entity::VPC, "vpc-1", None).tags("uplink", None),
            ObjectSpec::Port(PortSpec {
                device: router.id.clone(),
                ..Default::default()
            }),
        );

        let report = cleanup(&client, &BTreeSet::new(), &CleanupConfig { dry_run: false })
            .await
            .unwrap();
        assert_eq!(report.total_found, 2);
        assert_eq!(report.deleted + report.already_gone, 2);
        assert!(report.is_success());
        assert!(api.objects_of(ObjectKind::Router).is_empty());
        assert!(api.objects_of(ObjectKind::Port).is_empty());
    }

    #[tokio::test]
    async fn test_nothing_stale() {
        let client = client();
        let held = router(client.api(), "vpc-1");
        let report = cleanup(
            &client,
            &BTreeSet::from([held.id]),
            &CleanupConfig { dry_run: false },
        )
        .await
        .unwrap();
        assert_eq!(report, CleanupReport::default());
    }
}
