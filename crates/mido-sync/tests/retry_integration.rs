//! Backend failures: retries, per-entity isolation and recovery

mod test_utils;

use mido_sync::backend::{BackendError, MemoryOp};
use mido_sync::reconcile::EntityStatus;
use mido_sync_common::tags::entity;
use mido_sync_common::{GlobalNetworkInfo, ObjectKind};
use mido_sync_test_utils::{ModelBuilder, interface};
use std::net::Ipv4Addr;
use test_utils::Harness;

fn model() -> GlobalNetworkInfo {
    ModelBuilder::new()
        .vpc("vpc-1", "10.0.0.0/16")
        .subnet("vpc-1", "subnet-1", "10.0.1.0/24")
        .subnet("vpc-1", "subnet-2", "10.0.2.0/24")
        .interface(interface(1, "vpc-1", "subnet-1", Ipv4Addr::new(10, 0, 1, 5)))
        .interface(interface(2, "vpc-1", "subnet-2", Ipv4Addr::new(10, 0, 2, 5)))
        .build()
}

fn transient() -> BackendError {
    BackendError::Transient("503 service unavailable".to_string())
}

#[tokio::test]
async fn test_transient_failures_within_budget_are_retried() {
    let mut h = Harness::new();
    // The test config allows two retries
    h.api
        .fail_next(MemoryOp::Create, Some(ObjectKind::Router), transient(), 2);
    h.api.fail_next(MemoryOp::List, None, transient(), 1);

    let report = h.run(&model()).await;
    assert!(report.is_success(), "{report:#?}");
    assert_eq!(h.converge(&model(), 2).await, 1);
}

#[tokio::test]
async fn test_exhausted_retries_fail_one_entity() {
    let mut h = Harness::new();
    h.run(&model()).await;

    let bridge = h
        .owned_of(ObjectKind::Bridge, entity::SUBNET, "subnet-1")
        .remove(0);
    h.api.fail_next(MemoryOp::Delete, None, transient(), 1);
    assert!(h.reconciler.client().delete(&bridge).await.is_ok());

    // Subnet-1 lost its bridge; rebuilding it fails past the retry budget
    h.api
        .fail_next(MemoryOp::Create, Some(ObjectKind::Bridge), transient(), 3);
    let report = h.run(&model()).await;
    assert_eq!(report.exit_code(), 1);
    assert!(matches!(
        report.outcome(entity::SUBNET, "subnet-1"),
        Some(EntityStatus::Failed(_))
    ));
    assert!(
        report
            .outcome(entity::INSTANCE, "eni-00000001")
            .is_some_and(EntityStatus::is_failure)
    );
    assert_eq!(
        report.outcome(entity::SUBNET, "subnet-2"),
        Some(&EntityStatus::Converged)
    );
    assert_eq!(
        report.outcome(entity::INSTANCE, "eni-00000002"),
        Some(&EntityStatus::Converged)
    );

    let healed = h.run(&model()).await;
    assert!(healed.is_success(), "{healed:#?}");
    assert_eq!(
        healed.outcome(entity::SUBNET, "subnet-1"),
        Some(&EntityStatus::Updated)
    );
    assert_eq!(h.converge(&model(), 2).await, 1);
}

#[tokio::test]
async fn test_rejected_create_is_not_retried() {
    let mut h = Harness::new();
    h.api.fail_next(
        MemoryOp::Create,
        Some(ObjectKind::DhcpSubnet),
        BackendError::Rejected {
            status: 400,
            message: "bad subnet".to_string(),
        },
        1,
    );

    let report = h.run(&model()).await;
    assert_eq!(report.failures().filter(|o| o.kind == entity::SUBNET).count(), 1);

    let next = h.run(&model()).await;
    assert!(next.is_success(), "{next:#?}");
}

#[tokio::test]
async fn test_listing_failure_aborts_run_without_mutations() {
    let mut h = Harness::new();
    h.api.fail_next(MemoryOp::List, None, transient(), 3);

    let result = h
        .reconciler
        .run(&model(), &tokio_util::sync::CancellationToken::new())
        .await;
    assert!(result.is_err());
    assert_eq!(h.api.counters().mutations(), 0);
    assert!(h.reconciler.context().is_none());
}
