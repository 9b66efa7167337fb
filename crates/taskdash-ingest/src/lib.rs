//! CSV normalization for task exports: tolerant dates, header synonyms, and
//! row-to-document transformation. Nothing here touches the store.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use taskdash_core::{
    TaskRecord, DEFAULT_PRIORITY, DEFAULT_PROJECT_ID, DEFAULT_STATUS, DEFAULT_USER_ROLE,
};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "taskdash-ingest";

const NULL_TOKENS: [&str; 4] = ["nan", "nat", "none", "null"];

#[derive(Debug, Clone, Copy)]
enum Layout {
    Date(&'static str),
    DateTime(&'static str),
    Zoned(&'static str),
}

impl Layout {
    fn parse(self, input: &str) -> Option<NaiveDateTime> {
        let (fmt, parsed) = match self {
            Layout::Date(fmt) => (
                fmt,
                NaiveDate::parse_from_str(input, fmt)
                    .ok()
                    .and_then(|d| d.and_hms_opt(0, 0, 0)),
            ),
            Layout::DateTime(fmt) => (fmt, NaiveDateTime::parse_from_str(input, fmt).ok()),
            Layout::Zoned(fmt) => (
                fmt,
                DateTime::parse_from_str(input, fmt)
                    .ok()
                    .map(|dt| dt.naive_utc()),
            ),
        };
        // chrono's %Y takes 1-4 digits; a short year belongs to a %y layout.
        parsed.filter(|dt| !fmt.contains("%Y") || dt.year() >= MIN_FULL_YEAR)
    }
}

const MIN_FULL_YEAR: i32 = 1000;

/// The formats exports are known to use, tried first and in order.
const EXPLICIT_LAYOUTS: [Layout; 7] = [
    Layout::Date("%d/%m/%Y"),
    Layout::DateTime("%d/%m/%Y %H:%M:%S"),
    Layout::Date("%Y-%m-%d"),
    Layout::DateTime("%Y-%m-%d %H:%M:%S"),
    Layout::Zoned("%Y-%m-%d %H:%M:%S%:z"),
    Layout::DateTime("%Y-%m-%dT%H:%M:%S"),
    Layout::DateTime("%Y-%m-%dT%H:%M:%SZ"),
];

// Day-first whenever the order is ambiguous.
const LENIENT_LAYOUTS: [Layout; 16] = [
    Layout::Zoned("%Y-%m-%dT%H:%M:%S%:z"),
    Layout::Zoned("%Y-%m-%d %H:%M:%S%z"),
    Layout::Date("%d-%m-%Y"),
    Layout::DateTime("%d/%m/%Y %H:%M"),
    Layout::DateTime("%d-%m-%Y %H:%M:%S"),
    Layout::Date("%d/%m/%y"),
    Layout::Date("%d-%m-%y"),
    Layout::Date("%Y/%m/%d"),
    Layout::DateTime("%Y/%m/%d %H:%M:%S"),
    Layout::DateTime("%Y-%m-%d %H:%M"),
    Layout::DateTime("%Y-%m-%dT%H:%M"),
    Layout::Date("%d %B %Y"),
    Layout::Date("%d %b %Y"),
    Layout::Date("%B %d, %Y"),
    Layout::Date("%b %d, %Y"),
    Layout::Date("%Y%m%d"),
];

/// Best-effort conversion of a spreadsheet date cell to a naive timestamp.
///
/// Returns `None` for absent, blank, or null-like cells (`nan`, `NaT`,
/// `none`, `null`) and for anything no known layout accepts. Fractional
/// seconds and everything after them are discarded before parsing.
/// Zone-bearing values are converted to UTC and the zone dropped.
pub fn parse_flexible_date(input: Option<&str>) -> Option<NaiveDateTime> {
    let raw = input?.trim();
    if raw.is_empty() || NULL_TOKENS.iter().any(|t| raw.eq_ignore_ascii_case(t)) {
        return None;
    }
    let cleaned = raw.split('.').next().unwrap_or(raw).trim();
    if cleaned.is_empty() {
        return None;
    }

    EXPLICIT_LAYOUTS
        .iter()
        .find_map(|layout| layout.parse(cleaned))
        .or_else(|| {
            DateTime::parse_from_rfc3339(cleaned)
                .or_else(|_| DateTime::parse_from_rfc2822(cleaned))
                .ok()
                .map(|dt| dt.naive_utc())
        })
        .or_else(|| LENIENT_LAYOUTS.iter().find_map(|layout| layout.parse(cleaned)))
}

/// Canonical column names every export is mapped onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Column {
    Id,
    Project,
    Text,
    Status,
    IsMilestone,
    User,
    Priority,
    UserRole,
    Dependencies,
    Tags,
    Start,
    End,
    Completed,
    EffortPoints,
}

impl Column {
    pub fn as_str(self) -> &'static str {
        match self {
            Column::Id => "id",
            Column::Project => "project",
            Column::Text => "text",
            Column::Status => "status",
            Column::IsMilestone => "is_milestone",
            Column::User => "user",
            Column::Priority => "priority",
            Column::UserRole => "user_role",
            Column::Dependencies => "dependencies",
            Column::Tags => "tags",
            Column::Start => "start",
            Column::End => "end",
            Column::Completed => "completed",
            Column::EffortPoints => "effort_points",
        }
    }
}

impl fmt::Display for Column {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed CSV: {0}")]
    Csv(#[from] csv::Error),
    #[error(
        "missing required columns: {}; detected headers: {}",
        join_columns(.missing),
        .detected.join(", ")
    )]
    MissingColumns {
        missing: Vec<Column>,
        detected: Vec<String>,
    },
    #[error("no valid rows to ingest ({data_rows} data rows, {skipped} rejected for unparseable dates)")]
    NoValidRows { data_rows: usize, skipped: usize },
    #[error("invalid ingest profile: {0}")]
    Profile(String),
}

fn join_columns(columns: &[Column]) -> String {
    columns
        .iter()
        .map(|c| c.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Trim, lower-case, collapse whitespace runs to `_`, drop a leading BOM.
pub fn normalize_header(header: &str) -> String {
    header
        .trim_start_matches('\u{feff}')
        .trim()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderSynonym {
    pub header: String,
    pub column: Column,
}

fn synonym(header: &str, column: Column) -> HeaderSynonym {
    HeaderSynonym {
        header: header.to_string(),
        column,
    }
}

fn default_required() -> Vec<Column> {
    vec![Column::Text, Column::Status, Column::Start, Column::End]
}

/// Ordered synonym table plus the columns a file must provide.
///
/// Entries are applied in order and a later entry overrides an earlier one
/// targeting the same column, so the last matching header wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestProfile {
    /// Prepend the built-in table so the file only lists additions.
    #[serde(default)]
    pub extends_default: bool,
    pub synonyms: Vec<HeaderSynonym>,
    #[serde(default = "default_required")]
    pub required: Vec<Column>,
}

impl Default for IngestProfile {
    fn default() -> Self {
        use Column::*;
        let table: &[(&str, Column)] = &[
            ("id", Id),
            ("task_id", Id),
            ("project", Project),
            ("project_name", Project),
            ("project_id", Project),
            ("text", Text),
            ("description", Text),
            ("name", Text),
            ("title", Text),
            ("task_name", Text),
            ("task_description", Text),
            ("status", Status),
            ("state", Status),
            ("milestone", IsMilestone),
            ("is_milestone", IsMilestone),
            ("user", User),
            ("assigned", User),
            ("assigned_to", User),
            ("assigned_user_id", User),
            ("priority", Priority),
            ("role", UserRole),
            ("user_role", UserRole),
            ("depends_on", Dependencies),
            ("dependencies", Dependencies),
            ("labels", Tags),
            ("tags", Tags),
            ("start", Start),
            ("start_date", Start),
            ("end", End),
            ("due", End),
            ("end_date", End),
            ("due_date", End),
            ("completed_at", Completed),
            ("completion_date", Completed),
            ("actual_completion_date", Completed),
            ("effort", EffortPoints),
            ("effort_points", EffortPoints),
        ];
        Self {
            extends_default: false,
            synonyms: table.iter().map(|(h, c)| synonym(h, *c)).collect(),
            required: default_required(),
        }
    }
}

impl IngestProfile {
    pub fn from_yaml(text: &str) -> Result<Self, IngestError> {
        let mut profile: IngestProfile =
            serde_yaml::from_str(text).map_err(|e| IngestError::Profile(e.to_string()))?;
        if profile.extends_default {
            let mut synonyms = IngestProfile::default().synonyms;
            synonyms.append(&mut profile.synonyms);
            profile.synonyms = synonyms;
        }
        if profile.synonyms.is_empty() {
            return Err(IngestError::Profile("profile declares no synonyms".into()));
        }
        for entry in &mut profile.synonyms {
            entry.header = normalize_header(&entry.header);
        }
        Ok(profile)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, IngestError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| IngestError::Profile(format!("reading {}: {e}", path.display())))?;
        Self::from_yaml(&text)
    }
}

/// Which source column feeds each canonical column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnMap {
    positions: BTreeMap<Column, usize>,
    detected: Vec<String>,
}

impl ColumnMap {
    pub fn resolve<S: AsRef<str>>(headers: &[S], profile: &IngestProfile) -> Self {
        let detected: Vec<String> = headers.iter().map(|h| normalize_header(h.as_ref())).collect();
        let mut positions = BTreeMap::new();
        for entry in &profile.synonyms {
            if let Some(idx) = detected.iter().position(|h| *h == entry.header) {
                positions.insert(entry.column, idx);
            }
        }
        Self { positions, detected }
    }

    pub fn position(&self, column: Column) -> Option<usize> {
        self.positions.get(&column).copied()
    }

    pub fn contains(&self, column: Column) -> bool {
        self.positions.contains_key(&column)
    }

    pub fn detected_headers(&self) -> &[String] {
        &self.detected
    }

    pub fn missing(&self, required: &[Column]) -> Vec<Column> {
        required.iter().copied().filter(|c| !self.contains(*c)).collect()
    }

    pub fn ensure_required(&self, required: &[Column]) -> Result<(), IngestError> {
        let missing = self.missing(required);
        if missing.is_empty() {
            Ok(())
        } else {
            Err(IngestError::MissingColumns {
                missing,
                detected: self.detected.clone(),
            })
        }
    }

    fn cell<'r>(&self, record: &'r csv::StringRecord, column: Column) -> Option<&'r str> {
        self.position(column).and_then(|idx| record.get(idx))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextEncoding {
    Utf8,
    Latin1,
}

/// Decode upload bytes as UTF-8, falling back to latin-1 which never fails.
pub fn decode_upload(bytes: &[u8]) -> (Cow<'_, str>, TextEncoding) {
    match std::str::from_utf8(bytes) {
        Ok(text) => (Cow::Borrowed(text), TextEncoding::Utf8),
        Err(_) => (
            Cow::Owned(bytes.iter().map(|&b| char::from(b)).collect()),
            TextEncoding::Latin1,
        ),
    }
}

/// Blank cells yield `None`; anything else parses with `,` as a decimal
/// separator and truncates toward zero, coercing garbage to `0`.
pub fn parse_effort_points(input: Option<&str>) -> Option<i64> {
    let raw = input?.trim();
    if raw.is_empty() {
        return None;
    }
    let value = raw.replace(',', ".").parse::<f64>().unwrap_or(0.0);
    Some(if value.is_finite() { value.trunc() as i64 } else { 0 })
}

pub fn split_list(input: Option<&str>) -> Vec<String> {
    input
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// What to do with a row whose start or due date cannot be parsed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingDatePolicy {
    /// Exclude the row and report it as skipped.
    #[default]
    Reject,
    /// Keep the row: start falls back to the run timestamp, due is omitted.
    FallbackToNow,
}

impl FromStr for MissingDatePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Ok(MissingDatePolicy::Reject),
            "fallback" | "fallback_to_now" | "now" => Ok(MissingDatePolicy::FallbackToNow),
            other => Err(format!("unknown date policy `{other}` (expected reject|fallback)")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    UnparseableStartDate,
    UnparseableDueDate,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::UnparseableStartDate => f.write_str("unparseable start date"),
            SkipReason::UnparseableDueDate => f.write_str("unparseable due date"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRow {
    pub row_index: u64,
    pub task_id: String,
    pub reason: SkipReason,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBatch {
    pub tasks: Vec<TaskRecord>,
    pub skipped: Vec<SkippedRow>,
    pub detected_headers: Vec<String>,
    pub data_rows: usize,
}

fn text_cell(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn transform_row(
    map: &ColumnMap,
    record: &csv::StringRecord,
    row_index: u64,
    policy: MissingDatePolicy,
    created_at: NaiveDateTime,
) -> Result<TaskRecord, SkippedRow> {
    let task_id = text_cell(map.cell(record, Column::Id))
        .map(str::to_string)
        .unwrap_or_else(|| format!("auto_{row_index}"));

    let raw_start = map.cell(record, Column::Start);
    let raw_due = map.cell(record, Column::End);
    let raw_completed = map.cell(record, Column::Completed);

    let parsed_start = parse_flexible_date(raw_start);
    let parsed_due = parse_flexible_date(raw_due);

    let (start_date, due_date) = match policy {
        MissingDatePolicy::Reject => {
            let skip = |reason| SkippedRow {
                row_index,
                task_id: task_id.clone(),
                reason,
            };
            let start = parsed_start.ok_or_else(|| skip(SkipReason::UnparseableStartDate))?;
            let due = parsed_due.ok_or_else(|| skip(SkipReason::UnparseableDueDate))?;
            (start, Some(due))
        }
        MissingDatePolicy::FallbackToNow => (parsed_start.unwrap_or(created_at), parsed_due),
    };

    let description = text_cell(map.cell(record, Column::Text)).unwrap_or_default();
    let title = if description.is_empty() {
        format!("Task {row_index}")
    } else {
        description.to_string()
    };

    Ok(TaskRecord {
        task_id,
        csv_index: row_index,
        project_id: text_cell(map.cell(record, Column::Project))
            .unwrap_or(DEFAULT_PROJECT_ID)
            .to_string(),
        title,
        description: description.to_string(),
        status: text_cell(map.cell(record, Column::Status))
            .map(str::to_uppercase)
            .unwrap_or_else(|| DEFAULT_STATUS.to_string()),
        is_milestone: map.cell(record, Column::IsMilestone).map(str::trim) == Some("1"),
        assigned_to: text_cell(map.cell(record, Column::User))
            .unwrap_or_default()
            .to_string(),
        priority: text_cell(map.cell(record, Column::Priority))
            .map(str::to_lowercase)
            .unwrap_or_else(|| DEFAULT_PRIORITY.to_string()),
        user_role: text_cell(map.cell(record, Column::UserRole))
            .unwrap_or(DEFAULT_USER_ROLE)
            .to_string(),
        dependencies: split_list(map.cell(record, Column::Dependencies)),
        tags: split_list(map.cell(record, Column::Tags)),
        start_date,
        due_date,
        actual_completion_date: parse_flexible_date(raw_completed),
        effort_points: parse_effort_points(map.cell(record, Column::EffortPoints)),
        created_at,
        raw_start_date: raw_start.map(str::to_string),
        raw_due_date: raw_due.map(str::to_string),
        raw_actual_completion_date: raw_completed.map(str::to_string),
    })
}

/// Turn decoded CSV text into task documents.
///
/// Fails before producing anything when required columns are missing, and
/// when no row survives the date policy.
pub fn normalize_csv(
    text: &str,
    profile: &IngestProfile,
    policy: MissingDatePolicy,
    run_at: NaiveDateTime,
) -> Result<NormalizedBatch, IngestError> {
    let created_at = run_at.with_nanosecond(0).unwrap_or(run_at);
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers = reader.headers()?.clone();
    let map = ColumnMap::resolve(&headers.iter().collect::<Vec<_>>(), profile);
    map.ensure_required(&profile.required)?;

    let mut tasks = Vec::new();
    let mut skipped = Vec::new();
    let mut data_rows = 0usize;

    for (row_index, record) in reader.records().enumerate() {
        let record = record?;
        data_rows += 1;
        match transform_row(&map, &record, row_index as u64, policy, created_at) {
            Ok(task) => tasks.push(task),
            Err(skip) => {
                debug!(row_index = skip.row_index, task_id = %skip.task_id, reason = %skip.reason, "rejecting row");
                skipped.push(skip);
            }
        }
    }

    if tasks.is_empty() {
        return Err(IngestError::NoValidRows {
            data_rows,
            skipped: skipped.len(),
        });
    }

    Ok(NormalizedBatch {
        tasks,
        skipped,
        detected_headers: map.detected_headers().to_vec(),
        data_rows,
    })
}
