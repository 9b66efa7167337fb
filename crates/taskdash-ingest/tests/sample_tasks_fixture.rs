use std::path::{Path, PathBuf};

use chrono::{NaiveDate, NaiveDateTime};
use taskdash_ingest::{normalize_csv, IngestProfile, MissingDatePolicy, SkipReason};

fn workspace_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("../..")
        .canonicalize()
        .expect("workspace root")
}

fn sample_csv() -> String {
    std::fs::read_to_string(workspace_root().join("fixtures/tasks/sample.csv")).expect("read fixture")
}

fn run_at() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, 3, 10)
        .unwrap()
        .and_hms_opt(12, 0, 0)
        .unwrap()
}

fn day(m: u32, d: u32) -> NaiveDateTime {
    NaiveDate::from_ymd_opt(2024, m, d)
        .unwrap()
        .and_hms_opt(0, 0, 0)
        .unwrap()
}

#[test]
fn sample_fixture_normalizes_with_reject_policy() {
    let batch = normalize_csv(
        &sample_csv(),
        &IngestProfile::default(),
        MissingDatePolicy::Reject,
        run_at(),
    )
    .expect("normalize fixture");

    assert_eq!(batch.data_rows, 5);
    assert_eq!(batch.tasks.len(), 4);
    assert_eq!(batch.skipped.len(), 1);
    assert_eq!(batch.skipped[0].task_id, "T4");
    assert_eq!(batch.skipped[0].reason, SkipReason::UnparseableStartDate);
    assert_eq!(batch.detected_headers[0], "task_id");

    let t1 = &batch.tasks[0];
    assert_eq!(t1.status, "DONE");
    assert_eq!(t1.priority, "high");
    assert_eq!(t1.start_date, day(3, 1));
    assert_eq!(t1.due_date, Some(day(3, 5)));
    assert_eq!(t1.actual_completion_date, Some(day(3, 4)));
    assert_eq!(t1.effort_points, Some(5));

    let t2 = &batch.tasks[1];
    assert_eq!(t2.tags, vec!["backend", "api"]);
    assert_eq!(t2.dependencies, vec!["T1"]);
    assert_eq!(t2.effort_points, Some(3));

    let t3 = &batch.tasks[2];
    assert!(t3.is_milestone);
    assert_eq!(t3.assigned_to, "");
    assert_eq!(t3.user_role, "team_member");
    assert_eq!(t3.actual_completion_date, None);
    assert_eq!(t3.effort_points, Some(0));
    assert_eq!(
        t3.due_date,
        NaiveDate::from_ymd_opt(2024, 3, 15).unwrap().and_hms_opt(17, 0, 0)
    );

    let runbook = &batch.tasks[3];
    assert_eq!(runbook.task_id, "auto_4");
    assert_eq!(runbook.project_id, "unassigned");
    assert_eq!(runbook.status, "PENDING");
    assert_eq!(runbook.due_date, Some(day(3, 22)));
}

#[test]
fn sample_fixture_keeps_every_row_with_fallback_policy() {
    let batch = normalize_csv(
        &sample_csv(),
        &IngestProfile::default(),
        MissingDatePolicy::FallbackToNow,
        run_at(),
    )
    .expect("normalize fixture");
    assert_eq!(batch.tasks.len(), 5);
    assert!(batch.skipped.is_empty());
    let t4 = batch.tasks.iter().find(|t| t.task_id == "T4").expect("T4 kept");
    assert_eq!(t4.start_date, run_at());
}

#[test]
fn profile_file_is_loaded_from_disk() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("profile.yaml");
    std::fs::write(
        &path,
        "extends_default: true\nsynonyms:\n  - header: Kickoff\n    column: start\n",
    )
    .expect("write profile");

    let profile = IngestProfile::from_path(&path).expect("load profile");
    let csv = "Title,Status,Kickoff,Due\nShip it,todo,2024-03-01,2024-03-02\n";
    let batch = normalize_csv(csv, &profile, MissingDatePolicy::Reject, run_at()).expect("normalize");
    assert_eq!(batch.tasks[0].start_date, day(3, 1));
}
