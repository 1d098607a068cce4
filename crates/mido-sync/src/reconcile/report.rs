//! Per-entity outcome summary of one run

use super::cleanup::CleanupReport;
use comfy_table::{ContentArrangement, Table, presets::UTF8_FULL_CONDENSED};
use serde::Serialize;
use std::fmt;

/// What happened to one entity
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum EntityStatus {
    /// Already matched the model, nothing changed
    Converged,
    /// Objects were created or repaired
    Updated,
    /// Removed from the backend
    Deleted,
    /// Reconciliation failed; left for the next run
    Failed(String),
    /// Not attempted, usually because a parent failed
    Skipped(String),
}

impl EntityStatus {
    pub fn is_failure(&self) -> bool {
        matches!(self, EntityStatus::Failed(_) | EntityStatus::Skipped(_))
    }
}

impl fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityStatus::Converged => f.write_str("converged"),
            EntityStatus::Updated => f.write_str("updated"),
            EntityStatus::Deleted => f.write_str("deleted"),
            EntityStatus::Failed(reason) => write!(f, "failed: {reason}"),
            EntityStatus::Skipped(reason) => write!(f, "skipped: {reason}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityOutcome {
    /// Entity kind, one of the tag entity values
    pub kind: &'static str,
    pub name: String,
    #[serde(flatten)]
    pub status: EntityStatus,
}

/// Result of one reconciliation run
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub outcomes: Vec<EntityOutcome>,
    /// Backend objects created during the run
    pub created: usize,
    /// Backend objects deleted during the run
    pub deleted: usize,
    pub cleanup: Option<CleanupReport>,
}

impl RunReport {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Default::default()
        }
    }

    pub fn record(&mut self, kind: &'static str, name: impl Into<String>, status: EntityStatus) {
        self.outcomes.push(EntityOutcome {
            kind,
            name: name.into(),
            status,
        });
    }

    pub fn failures(&self) -> impl Iterator<Item = &EntityOutcome> {
        self.outcomes.iter().filter(|o| o.status.is_failure())
    }

    pub fn outcome(&self, kind: &str, name: &str) -> Option<&EntityStatus> {
        self.outcomes
            .iter()
            .find(|o| o.kind == kind && o.name == name)
            .map(|o| &o.status)
    }

    /// Every entity converged and cleanup (if any) succeeded
    pub fn is_success(&self) -> bool {
        self.failures().next().is_none()
            && self.cleanup.as_ref().is_none_or(CleanupReport::is_success)
    }

    /// Process exit code: 0 on success, 1 on partial failure
    pub fn exit_code(&self) -> i32 {
        if self.is_success() { 0 } else { 1 }
    }

    /// Backend mutations made by the run, including cleanup
    pub fn mutations(&self) -> usize {
        self.created + self.deleted
    }

    /// Render a table of every entity that is not simply converged
    pub fn render_table(&self) -> String {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["Kind", "Name", "Status"]);

        for outcome in &self.outcomes {
            if outcome.status == EntityStatus::Converged {
                continue;
            }
            table.add_row(vec![
                outcome.kind.to_string(),
                outcome.name.clone(),
                outcome.status.to_string(),
            ]);
        }
        table.to_string()
    }
}
