//! Document store abstraction + upload archive for taskdash.
//!
//! The store is always constructed by the caller and injected; nothing in
//! this crate holds a process-wide connection.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Row;
use taskdash_core::{IngestionMetadata, ResourceRecord, TaskRecord, UpsertOutcome};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::info;
use uuid::Uuid;

pub const CRATE_NAME: &str = "taskdash-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store unavailable: {0}")]
    Unavailable(String),
    #[error("database error: {0}")]
    Database(sqlx::Error),
    #[error("document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    /// Connection-class failures fail the whole request instead of one row.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
            | sqlx::Error::Io(_)
            | sqlx::Error::Tls(_) => StoreError::Unavailable(err.to_string()),
            other => StoreError::Database(other),
        }
    }
}

/// Keyed document persistence used by the ingestion writer and status endpoints.
///
/// Every write is an independent atomic upsert; callers never need a lock.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    fn backend_name(&self) -> &'static str;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn upsert_task(&self, task: &TaskRecord) -> Result<UpsertOutcome, StoreError>;

    async fn upsert_resource(&self, resource: &ResourceRecord) -> Result<UpsertOutcome, StoreError>;

    async fn put_ingestion_metadata(&self, metadata: &IngestionMetadata) -> Result<(), StoreError>;

    async fn ingestion_metadata(&self, key: &str) -> Result<Option<IngestionMetadata>, StoreError>;

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError>;

    async fn get_resource(&self, user_id: &str) -> Result<Option<ResourceRecord>, StoreError>;

    async fn count_tasks(&self) -> Result<u64, StoreError>;

    async fn count_resources(&self) -> Result<u64, StoreError>;

    /// Release pooled connections. Called once at shutdown.
    async fn close(&self) {}
}

fn upsert_into<V: PartialEq>(map: &mut BTreeMap<String, V>, key: &str, value: V) -> UpsertOutcome {
    match map.get_mut(key) {
        None => {
            map.insert(key.to_string(), value);
            UpsertOutcome::Inserted
        }
        Some(existing) if *existing == value => UpsertOutcome::Unchanged,
        Some(existing) => {
            *existing = value;
            UpsertOutcome::Updated
        }
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    tasks: BTreeMap<String, serde_json::Value>,
    resources: BTreeMap<String, serde_json::Value>,
    metadata: BTreeMap<String, serde_json::Value>,
}

/// In-process store holding serialized documents. Used for dry runs, demo
/// mode without `DATABASE_URL`, and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn upsert_task(&self, task: &TaskRecord) -> Result<UpsertOutcome, StoreError> {
        let doc = serde_json::to_value(task)?;
        let mut state = self.state.lock().await;
        Ok(upsert_into(&mut state.tasks, &task.task_id, doc))
    }

    async fn upsert_resource(&self, resource: &ResourceRecord) -> Result<UpsertOutcome, StoreError> {
        let doc = serde_json::to_value(resource)?;
        let mut state = self.state.lock().await;
        Ok(upsert_into(&mut state.resources, &resource.user_id, doc))
    }

    async fn put_ingestion_metadata(&self, metadata: &IngestionMetadata) -> Result<(), StoreError> {
        let doc = serde_json::to_value(metadata)?;
        let mut state = self.state.lock().await;
        state.metadata.insert(metadata.key.clone(), doc);
        Ok(())
    }

    async fn ingestion_metadata(&self, key: &str) -> Result<Option<IngestionMetadata>, StoreError> {
        let state = self.state.lock().await;
        state
            .metadata
            .get(key)
            .map(|doc| serde_json::from_value(doc.clone()))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let state = self.state.lock().await;
        state
            .tasks
            .get(task_id)
            .map(|doc| serde_json::from_value(doc.clone()))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn get_resource(&self, user_id: &str) -> Result<Option<ResourceRecord>, StoreError> {
        let state = self.state.lock().await;
        state
            .resources
            .get(user_id)
            .map(|doc| serde_json::from_value(doc.clone()))
            .transpose()
            .map_err(StoreError::from)
    }

    async fn count_tasks(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.tasks.len() as u64)
    }

    async fn count_resources(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.resources.len() as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collection {
    Tasks,
    Resources,
    Metadata,
}

impl Collection {
    fn table(self) -> &'static str {
        match self {
            Collection::Tasks => "tasks",
            Collection::Resources => "resources",
            Collection::Metadata => "metadata",
        }
    }

    fn key_column(self) -> &'static str {
        match self {
            Collection::Tasks => "task_id",
            Collection::Resources => "user_id",
            Collection::Metadata => "key",
        }
    }
}

const SQL_CREATE_TASKS: &str = "CREATE TABLE IF NOT EXISTS tasks (\
task_id TEXT PRIMARY KEY, \
doc JSONB NOT NULL, \
updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW())";
const SQL_CREATE_RESOURCES: &str = "CREATE TABLE IF NOT EXISTS resources (\
user_id TEXT PRIMARY KEY, \
doc JSONB NOT NULL, \
updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW())";
const SQL_CREATE_METADATA: &str = "CREATE TABLE IF NOT EXISTS metadata (\
key TEXT PRIMARY KEY, \
doc JSONB NOT NULL, \
updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW())";

/// Builds the keyed upsert for a collection. `xmax = 0` distinguishes a
/// fresh insert from a conflict update; an identical document returns no row.
pub fn upsert_sql(table: &str, key_column: &str) -> String {
    format!(
        "INSERT INTO {table} ({key_column}, doc, updated_at) VALUES ($1, $2, NOW()) \
ON CONFLICT ({key_column}) DO UPDATE SET doc = EXCLUDED.doc, updated_at = NOW() \
WHERE {table}.doc IS DISTINCT FROM EXCLUDED.doc \
RETURNING (xmax = 0) AS inserted"
    )
}

/// Postgres-backed store keeping each document as JSONB beside its key.
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub async fn connect(database_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(timeout)
            .connect(database_url)
            .await?;
        info!(timeout_secs = timeout.as_secs(), "connected postgres document store");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates the three document tables if they are missing.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        for sql in [SQL_CREATE_TASKS, SQL_CREATE_RESOURCES, SQL_CREATE_METADATA] {
            sqlx::query(sql).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn upsert_doc(
        &self,
        collection: Collection,
        key: &str,
        doc: serde_json::Value,
    ) -> Result<UpsertOutcome, StoreError> {
        let sql = upsert_sql(collection.table(), collection.key_column());
        let row = sqlx::query(&sql)
            .bind(key)
            .bind(Json(doc))
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(UpsertOutcome::Unchanged),
            Some(row) => {
                let inserted: bool = row.try_get("inserted")?;
                Ok(if inserted {
                    UpsertOutcome::Inserted
                } else {
                    UpsertOutcome::Updated
                })
            }
        }
    }

    async fn fetch_doc<T: serde::de::DeserializeOwned>(
        &self,
        collection: Collection,
        key: &str,
    ) -> Result<Option<T>, StoreError> {
        let sql = format!(
            "SELECT doc FROM {} WHERE {} = $1",
            collection.table(),
            collection.key_column()
        );
        let row = sqlx::query(&sql)
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            None => Ok(None),
            Some(row) => {
                let doc: serde_json::Value = row.try_get("doc")?;
                Ok(Some(serde_json::from_value(doc)?))
            }
        }
    }

    async fn count(&self, collection: Collection) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) AS count FROM {}", collection.table());
        let row = sqlx::query(&sql).fetch_one(&self.pool).await?;
        let count: i64 = row.try_get("count")?;
        Ok(count.max(0) as u64)
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    fn backend_name(&self) -> &'static str {
        "postgres"
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn upsert_task(&self, task: &TaskRecord) -> Result<UpsertOutcome, StoreError> {
        self.upsert_doc(Collection::Tasks, &task.task_id, serde_json::to_value(task)?)
            .await
    }

    async fn upsert_resource(&self, resource: &ResourceRecord) -> Result<UpsertOutcome, StoreError> {
        self.upsert_doc(
            Collection::Resources,
            &resource.user_id,
            serde_json::to_value(resource)?,
        )
        .await
    }

    async fn put_ingestion_metadata(&self, metadata: &IngestionMetadata) -> Result<(), StoreError> {
        self.upsert_doc(
            Collection::Metadata,
            &metadata.key,
            serde_json::to_value(metadata)?,
        )
        .await?;
        Ok(())
    }

    async fn ingestion_metadata(&self, key: &str) -> Result<Option<IngestionMetadata>, StoreError> {
        self.fetch_doc(Collection::Metadata, key).await
    }

    async fn get_task(&self, task_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        self.fetch_doc(Collection::Tasks, task_id).await
    }

    async fn get_resource(&self, user_id: &str) -> Result<Option<ResourceRecord>, StoreError> {
        self.fetch_doc(Collection::Resources, user_id).await
    }

    async fn count_tasks(&self) -> Result<u64, StoreError> {
        self.count(Collection::Tasks).await
    }

    async fn count_resources(&self) -> Result<u64, StoreError> {
        self.count(Collection::Resources).await
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub content_hash: String,
    /// File name the client sent with this upload, if any.
    pub source_name: Option<String>,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    /// The same bytes were already archived under an earlier upload.
    pub deduplicated: bool,
}

/// Sidecar written next to each archived upload, `<hash>.sources.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSources {
    pub content_hash: String,
    pub byte_size: usize,
    /// Every distinct file name these bytes arrived under, in arrival order.
    pub source_names: Vec<String>,
}

/// Content-addressed copy of every raw upload, kept for diagnostics.
#[derive(Debug, Clone)]
pub struct UploadArchive {
    root: PathBuf,
}

impl UploadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    /// `<first two hex chars>/<hash>.<ext>`, so identical uploads share one file.
    pub fn upload_relative_path(&self, content_hash: &str, extension: &str) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        let fanout = content_hash.get(..2).unwrap_or("00");
        PathBuf::from(fanout).join(format!("{content_hash}.{ext}"))
    }

    fn sources_path(&self, content_hash: &str) -> PathBuf {
        let fanout = content_hash.get(..2).unwrap_or("00");
        self.root
            .join(fanout)
            .join(format!("{content_hash}.sources.json"))
    }

    /// Archive an upload under its content hash and remember the name it came in as.
    ///
    /// The extension follows `source_name` (lowercased), defaulting to `csv`.
    pub async fn archive(
        &self,
        source_name: Option<&str>,
        bytes: &[u8],
    ) -> anyhow::Result<StoredUpload> {
        let content_hash = Self::sha256_hex(bytes);
        let source_name = source_name
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string);
        let extension = source_name
            .as_deref()
            .and_then(|name| Path::new(name).extension())
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_else(|| "csv".to_string());
        let relative_path = self.upload_relative_path(&content_hash, &extension);
        let absolute_path = self.root.join(&relative_path);

        let already_present = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking upload path {}", absolute_path.display()))?;
        let deduplicated = already_present || write_once(&absolute_path, bytes).await?;

        self.record_source(&content_hash, bytes.len(), source_name.as_deref())
            .await?;

        Ok(StoredUpload {
            content_hash,
            source_name,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }

    /// Names recorded for an archived upload; empty when nothing was archived.
    pub async fn sources(&self, content_hash: &str) -> anyhow::Result<UploadSources> {
        let path = self.sources_path(content_hash);
        match fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw)
                .with_context(|| format!("parsing upload sources {}", path.display())),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(UploadSources::default()),
            Err(err) => {
                Err(err).with_context(|| format!("reading upload sources {}", path.display()))
            }
        }
    }

    async fn record_source(
        &self,
        content_hash: &str,
        byte_size: usize,
        source_name: Option<&str>,
    ) -> anyhow::Result<()> {
        let mut sources = self.sources(content_hash).await?;
        sources.content_hash = content_hash.to_string();
        sources.byte_size = byte_size;
        if let Some(name) = source_name {
            if !sources.source_names.iter().any(|known| known == name) {
                sources.source_names.push(name.to_string());
            }
        }
        let encoded = serde_json::to_vec_pretty(&sources)?;
        write_replacing(&self.sources_path(content_hash), &encoded).await
    }
}

/// Write `bytes` to `path` unless it exists. Returns true when another writer won the race.
async fn write_once(path: &Path, bytes: &[u8]) -> anyhow::Result<bool> {
    let temp_path = stage(path, bytes).await?;
    let lost_race = fs::try_exists(path).await.unwrap_or(false);
    if lost_race {
        let _ = fs::remove_file(&temp_path).await;
        return Ok(true);
    }
    commit(&temp_path, path).await?;
    Ok(false)
}

async fn write_replacing(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let temp_path = stage(path, bytes).await?;
    commit(&temp_path, path).await
}

/// Write `bytes` to a uniquely named sibling of `path` and return it.
async fn stage(path: &Path, bytes: &[u8]) -> anyhow::Result<PathBuf> {
    let parent = path
        .parent()
        .with_context(|| format!("archive path {} has no parent", path.display()))?;
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating archive directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.partial", Uuid::new_v4()));
    let mut file = fs::File::create(&temp_path)
        .await
        .with_context(|| format!("creating {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing {}", temp_path.display()))?;
    Ok(temp_path)
}

async fn commit(temp_path: &Path, path: &Path) -> anyhow::Result<()> {
    if let Err(err) = fs::rename(temp_path, path).await {
        let _ = fs::remove_file(temp_path).await;
        return Err(err).with_context(|| format!("moving archive file into {}", path.display()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, NaiveDateTime, Utc};
    use tempfile::tempdir;

    fn at(day: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
    }

    fn task(task_id: &str, status: &str) -> TaskRecord {
        TaskRecord {
            task_id: task_id.into(),
            csv_index: 0,
            project_id: "P1".into(),
            title: "Design schema".into(),
            description: "Design schema".into(),
            status: status.into(),
            is_milestone: false,
            assigned_to: "u9".into(),
            priority: "medium".into(),
            user_role: "team_member".into(),
            dependencies: vec![],
            tags: vec![],
            start_date: at(1),
            due_date: Some(at(5)),
            actual_completion_date: None,
            effort_points: Some(3),
            created_at: at(10),
            raw_start_date: None,
            raw_due_date: None,
            raw_actual_completion_date: None,
        }
    }

    #[test]
    fn upload_hashing_is_stable() {
        let hash = UploadArchive::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_uploads_share_one_archived_file() {
        let dir = tempdir().expect("tempdir");
        let archive = UploadArchive::new(dir.path());

        let first = archive
            .archive(Some("tasks.csv"), b"task_id,status\nT1,done\n")
            .await
            .expect("first archive");
        let second = archive
            .archive(Some("March export.CSV"), b"task_id,status\nT1,done\n")
            .await
            .expect("second archive");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with(&first.content_hash[..2]));
        assert!(first.absolute_path.exists());
        assert_eq!(second.source_name.as_deref(), Some("March export.CSV"));
    }

    #[tokio::test]
    async fn archive_remembers_every_source_name_once() {
        let dir = tempdir().expect("tempdir");
        let archive = UploadArchive::new(dir.path());
        let bytes = b"task_id,status\nT1,done\n";

        let stored = archive.archive(Some("a.csv"), bytes).await.expect("a");
        archive.archive(Some("b.csv"), bytes).await.expect("b");
        archive.archive(Some("a.csv"), bytes).await.expect("a again");
        archive.archive(None, bytes).await.expect("unnamed");

        let sources = archive.sources(&stored.content_hash).await.expect("sources");
        assert_eq!(sources.content_hash, stored.content_hash);
        assert_eq!(sources.byte_size, bytes.len());
        assert_eq!(sources.source_names, vec!["a.csv".to_string(), "b.csv".to_string()]);

        let unknown = archive.sources("ffff").await.expect("missing sources");
        assert!(unknown.source_names.is_empty());
    }

    #[tokio::test]
    async fn unnamed_uploads_are_archived_as_csv() {
        let dir = tempdir().expect("tempdir");
        let archive = UploadArchive::new(dir.path());

        let stored = archive.archive(Some("   "), b"x\n").await.expect("archive");
        assert_eq!(stored.source_name, None);
        assert_eq!(
            stored.relative_path.extension().and_then(|e| e.to_str()),
            Some("csv")
        );
    }

    #[tokio::test]
    async fn memory_store_upsert_reports_insert_update_unchanged() {
        let store = MemoryStore::new();
        assert_eq!(
            store.upsert_task(&task("T1", "PENDING")).await.unwrap(),
            UpsertOutcome::Inserted
        );
        assert_eq!(
            store.upsert_task(&task("T1", "PENDING")).await.unwrap(),
            UpsertOutcome::Unchanged
        );
        assert_eq!(
            store.upsert_task(&task("T1", "DONE")).await.unwrap(),
            UpsertOutcome::Updated
        );
        assert_eq!(store.count_tasks().await.unwrap(), 1);
        let stored = store.get_task("T1").await.unwrap().unwrap();
        assert_eq!(stored.status, "DONE");
    }

    #[tokio::test]
    async fn memory_store_keeps_latest_metadata_document() {
        let store = MemoryStore::new();
        let mut metadata = IngestionMetadata {
            key: taskdash_core::LAST_UPDATE_KEY.to_string(),
            run_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            source_name: Some("tasks.csv".into()),
            source_sha256: UploadArchive::sha256_hex(b"x"),
            total_records: 2,
            inserted: 2,
            updated: 0,
            unchanged: 0,
            failed: 0,
            skipped_rows: 0,
            resources_count: 1,
        };
        store.put_ingestion_metadata(&metadata).await.unwrap();
        metadata.total_records = 3;
        store.put_ingestion_metadata(&metadata).await.unwrap();

        let loaded = store
            .ingestion_metadata(taskdash_core::LAST_UPDATE_KEY)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.total_records, 3);
        assert!(store.ingestion_metadata("other").await.unwrap().is_none());
    }

    #[test]
    fn connection_class_sqlx_errors_are_unavailable() {
        assert!(StoreError::from(sqlx::Error::PoolTimedOut).is_unavailable());
        assert!(StoreError::from(sqlx::Error::PoolClosed).is_unavailable());
        assert!(!StoreError::from(sqlx::Error::RowNotFound).is_unavailable());
    }

    #[test]
    fn upsert_sql_targets_key_column() {
        let sql = upsert_sql("tasks", "task_id");
        assert!(sql.starts_with("INSERT INTO tasks (task_id, doc, updated_at)"));
        assert!(sql.contains("ON CONFLICT (task_id)"));
        assert!(sql.contains("WHERE tasks.doc IS DISTINCT FROM EXCLUDED.doc"));
    }
}
