//! Canonical task/resource documents shared by the taskdash ingestion crates.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "taskdash-core";

/// Key of the single well-known metadata document written after each run.
pub const LAST_UPDATE_KEY: &str = "last_update";

pub const DEFAULT_PROJECT_ID: &str = "unassigned";
pub const DEFAULT_STATUS: &str = "PENDING";
pub const DEFAULT_PRIORITY: &str = "medium";
pub const DEFAULT_USER_ROLE: &str = "team_member";

/// Stored task document, keyed by `task_id`.
///
/// Optional dates are omitted from the serialized document when absent, and
/// a missing key deserializes the same as an explicit null.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub csv_index: u64,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub status: String,
    pub is_milestone: bool,
    pub assigned_to: String,
    pub priority: String,
    pub user_role: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub start_date: NaiveDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due_date: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_completion_date: Option<NaiveDateTime>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effort_points: Option<i64>,
    pub created_at: NaiveDateTime,
    #[serde(default)]
    pub raw_start_date: Option<String>,
    #[serde(default)]
    pub raw_due_date: Option<String>,
    #[serde(default)]
    pub raw_actual_completion_date: Option<String>,
}

impl TaskRecord {
    pub fn is_assigned(&self) -> bool {
        !self.assigned_to.is_empty()
    }
}

/// One row per distinct assignee, keyed by `user_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub user_id: String,
    pub role: String,
    pub updated_at: NaiveDateTime,
}

impl ResourceRecord {
    pub fn for_task(task: &TaskRecord, updated_at: NaiveDateTime) -> Option<Self> {
        if !task.is_assigned() {
            return None;
        }
        Some(Self {
            user_id: task.assigned_to.clone(),
            role: task.user_role.clone(),
            updated_at,
        })
    }
}

/// Result of a keyed write against the document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    /// The key existed and the stored document was already identical.
    Unchanged,
}

/// Running per-run write counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteTally {
    pub attempted: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl WriteTally {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        self.attempted += 1;
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }

    pub fn record_failure(&mut self) {
        self.attempted += 1;
        self.failed += 1;
    }

    pub fn succeeded(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

/// Well-known document describing the most recent ingestion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestionMetadata {
    pub key: String,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub source_name: Option<String>,
    pub source_sha256: String,
    pub total_records: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub skipped_rows: usize,
    pub resources_count: usize,
}

/// JSON body returned to the uploader once a run completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestionSummary {
    pub status: String,
    pub message: String,
    pub run_id: Uuid,
    pub total_records: usize,
    pub attempted: usize,
    pub succeeded: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub skipped_rows: usize,
    pub resources_count: usize,
    /// False when the run's metadata document could not be stored.
    pub metadata_written: bool,
}

impl IngestionSummary {
    pub fn from_tally(
        run_id: Uuid,
        total_records: usize,
        tally: WriteTally,
        skipped_rows: usize,
        resources_count: usize,
    ) -> Self {
        Self {
            status: "success".to_string(),
            message: format!("Ingestion complete. {} tasks loaded.", tally.succeeded()),
            run_id,
            total_records,
            attempted: tally.attempted,
            succeeded: tally.succeeded(),
            inserted: tally.inserted,
            updated: tally.updated,
            unchanged: tally.unchanged,
            failed: tally.failed,
            skipped_rows,
            resources_count,
            metadata_written: true,
        }
    }
}
