//! Ingestion run orchestration: decode, normalize, upsert, record metadata.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use taskdash_core::{
    IngestionMetadata, IngestionSummary, ResourceRecord, WriteTally, LAST_UPDATE_KEY,
};
use taskdash_ingest::{
    decode_upload, normalize_csv, IngestError, IngestProfile, MissingDatePolicy, TextEncoding,
};
use taskdash_storage::{DocumentStore, MemoryStore, PgDocumentStore, StoreError, UploadArchive};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "taskdash-sync";

pub const DEFAULT_WEB_PORT: u16 = 8080;
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 5;
pub const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    /// Unset means the in-memory demo store.
    pub database_url: Option<String>,
    pub web_port: u16,
    pub store_timeout_secs: u64,
    pub max_upload_bytes: usize,
    pub archive_dir: Option<PathBuf>,
    pub date_policy: MissingDatePolicy,
    pub profile_path: Option<PathBuf>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            web_port: DEFAULT_WEB_PORT,
            store_timeout_secs: DEFAULT_STORE_TIMEOUT_SECS,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
            archive_dir: None,
            date_policy: MissingDatePolicy::default(),
            profile_path: None,
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    pub fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| var(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();
        Self {
            database_url: non_empty("DATABASE_URL"),
            web_port: non_empty("TASKDASH_WEB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.web_port),
            store_timeout_secs: non_empty("TASKDASH_STORE_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.store_timeout_secs),
            max_upload_bytes: non_empty("TASKDASH_MAX_UPLOAD_BYTES")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.max_upload_bytes),
            archive_dir: non_empty("TASKDASH_ARCHIVE_DIR").map(PathBuf::from),
            date_policy: match non_empty("TASKDASH_DATE_POLICY") {
                None => defaults.date_policy,
                Some(raw) => raw.parse().unwrap_or_else(|err: String| {
                    warn!(%err, "ignoring TASKDASH_DATE_POLICY");
                    defaults.date_policy
                }),
            },
            profile_path: non_empty("TASKDASH_PROFILE").map(PathBuf::from),
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.store_timeout_secs)
    }

    pub fn load_profile(&self) -> Result<IngestProfile> {
        match &self.profile_path {
            None => Ok(IngestProfile::default()),
            Some(path) => IngestProfile::from_path(path)
                .with_context(|| format!("loading ingest profile {}", path.display())),
        }
    }
}

/// Connects the configured store, falling back to memory when no URL is set.
pub async fn open_store(config: &IngestConfig) -> Result<Arc<dyn DocumentStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgDocumentStore::connect(url, config.store_timeout())
                .await
                .context("connecting to postgres document store")?;
            store.migrate().await.context("creating document tables")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; using in-memory store, data is lost on exit");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error("document store unavailable: {0}")]
    StoreUnavailable(StoreError),
    #[error("document store error: {0}")]
    Store(StoreError),
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        if err.is_unavailable() {
            PipelineError::StoreUnavailable(err)
        } else {
            PipelineError::Store(err)
        }
    }
}

/// One ingestion run per call; the store handle is shared across runs.
#[derive(Clone)]
pub struct IngestPipeline {
    store: Arc<dyn DocumentStore>,
    profile: IngestProfile,
    policy: MissingDatePolicy,
    archive: Option<UploadArchive>,
}

impl IngestPipeline {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self {
            store,
            profile: IngestProfile::default(),
            policy: MissingDatePolicy::default(),
            archive: None,
        }
    }

    pub fn from_config(store: Arc<dyn DocumentStore>, config: &IngestConfig) -> Result<Self> {
        let mut pipeline = Self::new(store)
            .with_profile(config.load_profile()?)
            .with_policy(config.date_policy);
        if let Some(dir) = &config.archive_dir {
            pipeline = pipeline.with_archive(UploadArchive::new(dir.clone()));
        }
        Ok(pipeline)
    }

    pub fn with_profile(mut self, profile: IngestProfile) -> Self {
        self.profile = profile;
        self
    }

    pub fn with_policy(mut self, policy: MissingDatePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_archive(mut self, archive: UploadArchive) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn policy(&self) -> MissingDatePolicy {
        self.policy
    }

    pub async fn run(
        &self,
        bytes: &[u8],
        source_name: Option<&str>,
    ) -> Result<IngestionSummary, PipelineError> {
        self.run_at(bytes, source_name, Utc::now()).await
    }

    /// Runs one ingestion with an explicit run timestamp.
    pub async fn run_at(
        &self,
        bytes: &[u8],
        source_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<IngestionSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("ingestion_run", %run_id, source = source_name.unwrap_or("-"));
        self.execute(run_id, bytes, source_name, now)
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        bytes: &[u8],
        source_name: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<IngestionSummary, PipelineError> {
        self.store
            .ping()
            .await
            .map_err(PipelineError::StoreUnavailable)?;

        let source_sha256 = UploadArchive::sha256_hex(bytes);
        if let Some(archive) = &self.archive {
            match archive.archive(source_name, bytes).await {
                Ok(stored) => info!(
                    path = %stored.relative_path.display(),
                    source = stored.source_name.as_deref().unwrap_or("-"),
                    deduplicated = stored.deduplicated,
                    "archived upload"
                ),
                Err(err) => warn!(error = %err, "failed to archive upload"),
            }
        }

        let (text, encoding) = decode_upload(bytes);
        if encoding == TextEncoding::Latin1 {
            info!("upload is not valid UTF-8; decoded as latin-1");
        }

        let batch = normalize_csv(&text, &self.profile, self.policy, now.naive_utc())?;
        if !batch.skipped.is_empty() {
            warn!(
                skipped = batch.skipped.len(),
                data_rows = batch.data_rows,
                "rows rejected for unparseable dates"
            );
        }

        let mut tally = WriteTally::default();
        let mut resources: HashSet<String> = HashSet::new();

        for task in &batch.tasks {
            match self.store.upsert_task(task).await {
                Ok(outcome) => tally.record(outcome),
                Err(err) if err.is_unavailable() => return Err(PipelineError::StoreUnavailable(err)),
                Err(err) => {
                    warn!(task_id = %task.task_id, error = %err, "task upsert failed");
                    tally.record_failure();
                }
            }

            // The assignee is real even when its task row failed to write.
            let Some(resource) = ResourceRecord::for_task(task, task.created_at) else {
                continue;
            };
            if resources.contains(&resource.user_id) {
                continue;
            }
            match self.store.upsert_resource(&resource).await {
                Ok(_) => {
                    resources.insert(resource.user_id);
                }
                Err(err) if err.is_unavailable() => return Err(PipelineError::StoreUnavailable(err)),
                Err(err) => {
                    warn!(user_id = %resource.user_id, error = %err, "resource upsert failed");
                }
            }
        }

        let metadata = IngestionMetadata {
            key: LAST_UPDATE_KEY.to_string(),
            run_id,
            timestamp: now,
            source_name: source_name.map(str::to_string),
            source_sha256,
            total_records: batch.tasks.len(),
            inserted: tally.inserted,
            updated: tally.updated,
            unchanged: tally.unchanged,
            failed: tally.failed,
            skipped_rows: batch.skipped.len(),
            resources_count: resources.len(),
        };
        let metadata_written = match self.store.put_ingestion_metadata(&metadata).await {
            Ok(()) => true,
            Err(err) if err.is_unavailable() => return Err(PipelineError::StoreUnavailable(err)),
            Err(err) => {
                warn!(error = %err, "failed to record ingestion metadata");
                false
            }
        };

        let mut summary = IngestionSummary::from_tally(
            run_id,
            batch.tasks.len(),
            tally,
            batch.skipped.len(),
            resources.len(),
        );
        summary.metadata_written = metadata_written;
        info!(
            total = summary.total_records,
            inserted = summary.inserted,
            updated = summary.updated,
            unchanged = summary.unchanged,
            failed = summary.failed,
            skipped = summary.skipped_rows,
            resources = summary.resources_count,
            "ingestion run complete"
        );
        Ok(summary)
    }
}

/// Store health and sizes, as reported by `status` surfaces.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStatus {
    pub backend: &'static str,
    pub task_count: u64,
    pub resource_count: u64,
    pub last_ingestion: Option<IngestionMetadata>,
}

pub async fn store_status(store: &dyn DocumentStore) -> Result<StoreStatus, StoreError> {
    store.ping().await?;
    Ok(StoreStatus {
        backend: store.backend_name(),
        task_count: store.count_tasks().await?,
        resource_count: store.count_resources().await?,
        last_ingestion: store.ingestion_metadata(LAST_UPDATE_KEY).await?,
    })
}
