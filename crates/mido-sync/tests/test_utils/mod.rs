//! Shared test utilities for integration tests
//!
//! In-memory backend fixtures that need the mido-sync crate itself. Model
//! builders and names live in mido-sync-test-utils.

#![allow(dead_code)]

use mido_sync::backend::{MemoryApi, MidoObject};
use mido_sync::config::MidoConfig;
use mido_sync::reconcile::{Reconciler, RunReport};
use mido_sync_common::GlobalNetworkInfo;
use mido_sync_common::ObjectKind;
use mido_sync_common::tags::TAG_ENTITY;
use mido_sync_test_utils::{TEST_GATEWAY, TEST_NODE, test_config_json};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Load the shared test configuration through the file loader
pub fn load_test_config() -> MidoConfig {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.json");
    std::fs::write(&path, test_config_json()).unwrap();
    MidoConfig::load(&path).unwrap()
}

/// In-memory backend with the test hosts registered, and a reconciler on it
pub struct Harness {
    pub api: MemoryApi,
    pub reconciler: Reconciler<MemoryApi>,
}

impl Harness {
    pub fn new() -> Self {
        let api = MemoryApi::new();
        api.add_host(TEST_NODE);
        api.add_host(TEST_GATEWAY);
        let reconciler = Reconciler::new(api.clone(), load_test_config());
        Self { api, reconciler }
    }

    /// Run once and return the report, failing the test on a run error
    pub async fn run(&mut self, gni: &GlobalNetworkInfo) -> RunReport {
        self.reconciler
            .run(gni, &CancellationToken::new())
            .await
            .expect("run should not abort")
    }

    /// Run until a run makes no mutations, at most `max` times
    pub async fn converge(&mut self, gni: &GlobalNetworkInfo, max: usize) -> usize {
        for attempt in 1..=max {
            let report = self.run(gni).await;
            if report.mutations() == 0 {
                return attempt;
            }
        }
        panic!("no fixed point after {max} runs");
    }

    /// Live objects owned by an entity
    pub fn owned(&self, entity: &str, owner: &str) -> Vec<MidoObject> {
        self.api
            .objects()
            .into_iter()
            .filter(|o| o.tag(TAG_ENTITY) == Some(entity) && o.owner() == Some(owner))
            .collect()
    }

    /// Live objects of one kind owned by an entity
    pub fn owned_of(&self, kind: ObjectKind, entity: &str, owner: &str) -> Vec<MidoObject> {
        self.owned(entity, owner)
            .into_iter()
            .filter(|o| o.kind() == kind)
            .collect()
    }

    /// Managed objects on the backend
    pub fn managed(&self) -> usize {
        self.api.objects().iter().filter(|o| o.is_managed()).count()
    }
}
