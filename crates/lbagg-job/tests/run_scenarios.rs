use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use lbagg_core::{ActivitySnapshot, BreakdownItem, Group, Identity};
use lbagg_job::{
    AggregationPipeline, FixedClock, GroupStatus, JobConfig, SkipReason, UnvotedCategoryPolicy,
};
use lbagg_storage::{DocumentStore, FailPoint, JsonFileStore, MemoryStore};

/// 20:00 UTC is 12:00 local at the default -8 offset, outside quiet hours.
fn noon_local() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 2, 24, 20, 0, 0).single().unwrap()
}

const DATE_KEY: &str = "2026-02-24";

fn group(id: &str, members: &[&str]) -> Group {
    Group {
        id: id.to_string(),
        member_ids: members.iter().map(|m| m.to_string()).collect(),
        category_votes: BTreeMap::new(),
    }
}

fn snapshot(updated: DateTime<Utc>, items: &[(&str, f64)]) -> ActivitySnapshot {
    ActivitySnapshot {
        last_updated: Some(updated),
        total_minutes: 9999.0,
        breakdown: items.iter().map(|(c, m)| BreakdownItem::new(*c, *m)).collect(),
    }
}

fn pipeline(store: &Arc<MemoryStore>, now: DateTime<Utc>) -> AggregationPipeline {
    pipeline_with(store, now, JobConfig::default())
}

fn pipeline_with(
    store: &Arc<MemoryStore>,
    now: DateTime<Utc>,
    config: JobConfig,
) -> AggregationPipeline {
    let store: Arc<dyn DocumentStore> = store.clone();
    AggregationPipeline::new(config, store, Arc::new(FixedClock(now)))
}

#[tokio::test]
async fn two_members_one_without_snapshot() {
    let now = noon_local();
    let store = Arc::new(
        MemoryStore::new()
            .with_group(group("g1", &["m1", "m2"]))
            .with_identity("m1", Identity::named("avery"))
            .with_snapshot("m1", snapshot(now - Duration::minutes(5), &[("App1", 120.0)])),
    );

    let summary = pipeline(&store, now).run_once().await.unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.date_key, DATE_KEY);

    let board = store.get_current_leaderboard("g1").await.unwrap().unwrap();
    assert_eq!(board.generated_at, now);
    let rows: Vec<_> = board
        .entries
        .iter()
        .map(|e| (e.uid.as_str(), e.username.as_str(), e.total_minutes))
        .collect();
    assert_eq!(rows, vec![("m1", "avery", 120.0), ("m2", "Unknown", 0.0)]);

    let m1 = store.get_member_history("m1", DATE_KEY).await.unwrap().unwrap();
    assert_eq!(m1.value, 120.0);
    assert!(store.get_member_history("m2", DATE_KEY).await.unwrap().is_none());
    let avg = store.get_group_history("g1", DATE_KEY).await.unwrap().unwrap();
    assert_eq!(avg.value, 120.0);
}

#[tokio::test]
async fn majority_vote_filters_rejected_categories_only() {
    let now = noon_local();
    let mut g = group("g1", &["a", "b", "c", "d"]);
    g.category_votes
        .insert("App1".into(), vec!["a".into(), "b".into(), "c".into()]);
    g.category_votes
        .insert("App2".into(), vec!["a".into(), "b".into()]);
    let store = Arc::new(
        MemoryStore::new()
            .with_group(g)
            .with_snapshot(
                "a",
                snapshot(now, &[("App1", 60.0), ("App2", 30.0), ("App3", 15.0)]),
            ),
    );

    pipeline(&store, now).run_once().await.unwrap();
    let board = store.get_current_leaderboard("g1").await.unwrap().unwrap();
    let top = &board.entries[0];
    assert_eq!(top.uid, "a");
    // App1 passes (3 > 2), App2 ties at half and is dropped, App3 was never voted on.
    let categories: Vec<_> = top.breakdown.iter().map(|i| i.category.as_str()).collect();
    assert_eq!(categories, vec!["App1", "App3"]);
    assert_eq!(top.total_minutes, 75.0);
}

#[tokio::test]
async fn exclude_policy_drops_unvoted_categories() {
    let now = noon_local();
    let mut g = group("g1", &["a", "b", "c", "d"]);
    g.category_votes
        .insert("App1".into(), vec!["a".into(), "b".into(), "c".into()]);
    let store = Arc::new(
        MemoryStore::new()
            .with_group(g)
            .with_snapshot("a", snapshot(now, &[("App1", 60.0), ("App3", 15.0)])),
    );
    let config = JobConfig {
        unvoted_categories: UnvotedCategoryPolicy::Exclude,
        ..JobConfig::default()
    };

    pipeline_with(&store, now, config).run_once().await.unwrap();
    let board = store.get_current_leaderboard("g1").await.unwrap().unwrap();
    assert_eq!(board.entries[0].total_minutes, 60.0);
}

#[tokio::test]
async fn quiet_hours_suppress_all_reads_and_writes() {
    // 11:00 UTC is 03:00 local at -8.
    let now = Utc.with_ymd_and_hms(2026, 2, 24, 11, 0, 0).single().unwrap();
    let store = Arc::new(
        MemoryStore::new()
            .with_group(group("g1", &["m1"]))
            .with_snapshot("m1", snapshot(now, &[("App1", 10.0)]))
            // Listing would fail if it were attempted.
            .failing_on(FailPoint::ListGroups),
    );

    let summary = pipeline(&store, now).run_once().await.unwrap();
    assert!(summary.suppressed);
    assert_eq!(summary.groups_seen, 0);
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn group_average_excludes_members_without_data() {
    let now = noon_local();
    let store = Arc::new(
        MemoryStore::new()
            .with_group(group("g1", &["a", "b", "c"]))
            .with_snapshot("a", snapshot(now, &[("App1", 10.0)]))
            .with_snapshot("b", snapshot(now - Duration::hours(3), &[("App1", 20.0)])),
    );

    let summary = pipeline(&store, now).run_once().await.unwrap();
    let avg = store.get_group_history("g1", DATE_KEY).await.unwrap().unwrap();
    assert_eq!(avg.value, 15.0);
    match &summary.outcome("g1").unwrap().status {
        GroupStatus::Updated {
            members,
            member_history_written,
            group_average,
            group_history_written,
            ..
        } => {
            assert_eq!(*members, 3);
            assert_eq!(*member_history_written, 2);
            assert_eq!(*group_average, Some(15.0));
            assert!(*group_history_written);
        }
        other => panic!("unexpected status {other:?}"),
    }
}

#[tokio::test]
async fn empty_and_idle_groups_are_skipped_without_writes() {
    let now = noon_local();
    let store = Arc::new(
        MemoryStore::new()
            .with_group(group("empty", &[]))
            .with_group(group("idle", &["a", "b"]))
            .with_snapshot("a", snapshot(now - Duration::minutes(36), &[("App1", 10.0)])),
    );

    let summary = pipeline(&store, now).run_once().await.unwrap();
    assert_eq!(summary.skipped, 2);
    assert_eq!(
        summary.outcome("empty").unwrap().status,
        GroupStatus::Skipped {
            reason: SkipReason::NoMembers
        }
    );
    assert_eq!(
        summary.outcome("idle").unwrap().status,
        GroupStatus::Skipped {
            reason: SkipReason::NoRecentActivity
        }
    );
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn no_groups_is_a_successful_empty_run() {
    let store = Arc::new(MemoryStore::new());
    let summary = pipeline(&store, noon_local()).run_once().await.unwrap();
    assert!(!summary.suppressed);
    assert_eq!(summary.groups_seen, 0);
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn rerun_on_same_day_overwrites_history() {
    let now = noon_local();
    let store = Arc::new(
        MemoryStore::new()
            .with_group(group("g1", &["a", "b"]))
            .with_snapshot("a", snapshot(now, &[("App1", 10.0)]))
            .with_snapshot("b", snapshot(now, &[("App1", 30.0)])),
    );

    pipeline(&store, now).run_once().await.unwrap();
    let first_board = store.get_current_leaderboard("g1").await.unwrap();
    let first_avg = store.get_group_history("g1", DATE_KEY).await.unwrap();

    pipeline(&store, now).run_once().await.unwrap();
    assert_eq!(store.get_current_leaderboard("g1").await.unwrap(), first_board);
    assert_eq!(store.get_group_history("g1", DATE_KEY).await.unwrap(), first_avg);
    assert_eq!(store.member_history_len().await, 2);
    assert_eq!(store.group_history_len().await, 1);

    // A later run the same day replaces the value rather than adding to it.
    let later = now + Duration::minutes(30);
    store
        .set_snapshot("a", snapshot(later, &[("App1", 50.0)]))
        .await;
    pipeline(&store, later).run_once().await.unwrap();
    let a = store.get_member_history("a", DATE_KEY).await.unwrap().unwrap();
    assert_eq!(a.value, 50.0);
    assert_eq!(a.recorded_at, later);
    assert_eq!(store.member_history_len().await, 2);
    let avg = store.get_group_history("g1", DATE_KEY).await.unwrap().unwrap();
    assert_eq!(avg.value, 40.0);
}

#[tokio::test]
async fn read_failure_in_one_group_does_not_affect_others() {
    let now = noon_local();
    let store = Arc::new(
        MemoryStore::new()
            .with_group(group("broken", &["x"]))
            .with_group(group("healthy", &["a"]))
            .with_snapshot("x", snapshot(now, &[("App1", 10.0)]))
            .with_snapshot("a", snapshot(now, &[("App1", 20.0)]))
            .failing_on(FailPoint::Snapshot("x".into())),
    );

    let summary = pipeline(&store, now).run_once().await.unwrap();
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.failed, 1);
    match &summary.outcome("broken").unwrap().status {
        GroupStatus::Failed { error } => assert!(error.contains("activity snapshot for x")),
        other => panic!("unexpected status {other:?}"),
    }
    assert!(store.get_current_leaderboard("broken").await.unwrap().is_none());
    assert!(store.get_current_leaderboard("healthy").await.unwrap().is_some());
}

#[tokio::test]
async fn leaderboard_write_failure_skips_history_for_that_group() {
    let now = noon_local();
    let store = Arc::new(
        MemoryStore::new()
            .with_group(group("g1", &["a"]))
            .with_snapshot("a", snapshot(now, &[("App1", 20.0)]))
            .failing_on(FailPoint::Leaderboard("g1".into())),
    );

    let summary = pipeline(&store, now).run_once().await.unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(store.write_count(), 0);
}

#[tokio::test]
async fn history_write_failures_are_independent() {
    let now = noon_local();
    let store = Arc::new(
        MemoryStore::new()
            .with_group(group("g1", &["a", "b", "c"]))
            .with_snapshot("a", snapshot(now, &[("App1", 10.0)]))
            .with_snapshot("b", snapshot(now, &[("App1", 20.0)]))
            .with_snapshot("c", snapshot(now, &[("App1", 30.0)]))
            .failing_on(FailPoint::MemberHistory("b".into())),
    );

    let summary = pipeline(&store, now).run_once().await.unwrap();
    match &summary.outcome("g1").unwrap().status {
        GroupStatus::Updated {
            member_history_written,
            member_history_failed,
            group_history_written,
            ..
        } => {
            assert_eq!(*member_history_written, 2);
            assert_eq!(*member_history_failed, 1);
            assert!(*group_history_written);
        }
        other => panic!("unexpected status {other:?}"),
    }
    assert!(store.get_member_history("a", DATE_KEY).await.unwrap().is_some());
    assert!(store.get_member_history("b", DATE_KEY).await.unwrap().is_none());
    assert!(store.get_member_history("c", DATE_KEY).await.unwrap().is_some());
    let avg = store.get_group_history("g1", DATE_KEY).await.unwrap().unwrap();
    assert_eq!(avg.value, 20.0);
}

#[tokio::test]
async fn group_history_failure_keeps_member_history() {
    let now = noon_local();
    let store = Arc::new(
        MemoryStore::new()
            .with_group(group("g1", &["a"]))
            .with_snapshot("a", snapshot(now, &[("App1", 10.0)]))
            .failing_on(FailPoint::GroupHistory("g1".into())),
    );

    let summary = pipeline(&store, now).run_once().await.unwrap();
    assert_eq!(summary.updated, 1);
    assert!(store.get_member_history("a", DATE_KEY).await.unwrap().is_some());
    assert!(store.get_group_history("g1", DATE_KEY).await.unwrap().is_none());
}

#[tokio::test]
async fn many_groups_run_under_a_small_concurrency_bound() {
    let now = noon_local();
    let mut store = MemoryStore::new();
    for i in 0..12 {
        let member = format!("m{i}");
        store = store
            .with_group(group(&format!("g{i:02}"), &[member.as_str()]))
            .with_snapshot(member.clone(), snapshot(now, &[("App1", i as f64)]));
    }
    let store = Arc::new(store);
    let config = JobConfig {
        max_concurrent_groups: 2,
        ..JobConfig::default()
    };

    let summary = pipeline_with(&store, now, config).run_once().await.unwrap();
    assert_eq!(summary.updated, 12);
    let ids: Vec<_> = summary.outcomes.iter().map(|o| o.group_id.as_str()).collect();
    let mut sorted = ids.clone();
    sorted.sort();
    assert_eq!(ids, sorted);
}

#[tokio::test]
async fn file_store_run_writes_documents_under_data_dir() {
    let now = noon_local();
    let dir = tempfile::tempdir().expect("tempdir");
    let files = JsonFileStore::new(dir.path());
    files.put_group(&group("g1", &["m1", "m2"])).await.unwrap();
    files.put_identity("m1", &Identity::named("avery")).await.unwrap();
    files
        .put_snapshot("m1", &snapshot(now - Duration::minutes(10), &[("App1", 40.0)]))
        .await
        .unwrap();
    files
        .put_snapshot("m2", &snapshot(now - Duration::minutes(20), &[("App2", 20.0)]))
        .await
        .unwrap();

    let config = JobConfig {
        data_dir: dir.path().to_path_buf(),
        ..JobConfig::default()
    };
    let store: Arc<dyn DocumentStore> = Arc::new(files.clone());
    let summary = AggregationPipeline::new(config, store, Arc::new(FixedClock(now)))
        .run_once()
        .await
        .unwrap();
    assert_eq!(summary.updated, 1);

    let board = files.get_current_leaderboard("g1").await.unwrap().unwrap();
    let names: Vec<_> = board.entries.iter().map(|e| e.username.as_str()).collect();
    assert_eq!(names, vec!["avery", "Unknown"]);
    assert!(dir.path().join("users/m2/history/2026-02-24.json").exists());
    let avg = files.get_group_history("g1", DATE_KEY).await.unwrap().unwrap();
    assert_eq!(avg.value, 30.0);
}

#[tokio::test]
async fn malformed_group_file_does_not_stop_other_groups() {
    let now = noon_local();
    let dir = tempfile::tempdir().expect("tempdir");
    let files = JsonFileStore::new(dir.path());
    files.put_group(&group("healthy", &["a"])).await.unwrap();
    files
        .put_snapshot("a", &snapshot(now, &[("App1", 20.0)]))
        .await
        .unwrap();
    std::fs::write(dir.path().join("groups/broken.json"), "{ not json").unwrap();

    let store: Arc<dyn DocumentStore> = Arc::new(files.clone());
    let summary = AggregationPipeline::new(JobConfig::default(), store, Arc::new(FixedClock(now)))
        .run_once()
        .await
        .expect("run completes despite one unreadable group");

    assert_eq!(summary.groups_seen, 2);
    assert_eq!(summary.updated, 1);
    assert_eq!(summary.failed, 1);
    match &summary.outcome("broken").unwrap().status {
        GroupStatus::Failed { error } => assert!(error.contains("reading group document")),
        other => panic!("unexpected status {other:?}"),
    }
    let board = files.get_current_leaderboard("healthy").await.unwrap().unwrap();
    assert_eq!(board.entries[0].total_minutes, 20.0);
    assert!(files.get_current_leaderboard("broken").await.unwrap().is_none());
}

#[tokio::test]
async fn unreadable_group_document_fails_only_that_group() {
    let now = noon_local();
    let store = Arc::new(
        MemoryStore::new()
            .with_group(group("g1", &["a"]))
            .with_group(group("g2", &["b"]))
            .with_snapshot("a", snapshot(now, &[("App1", 10.0)]))
            .with_snapshot("b", snapshot(now, &[("App1", 15.0)]))
            .failing_on(FailPoint::GroupDocument("g1".into())),
    );

    let summary = pipeline(&store, now).run_once().await.unwrap();
    assert!(matches!(
        summary.outcome("g1").unwrap().status,
        GroupStatus::Failed { .. }
    ));
    assert!(matches!(
        summary.outcome("g2").unwrap().status,
        GroupStatus::Updated { .. }
    ));
    assert!(store.get_current_leaderboard("g1").await.unwrap().is_none());
    assert_eq!(store.member_history_len().await, 1);
}

#[tokio::test]
async fn repeated_member_ids_are_ranked_and_averaged_once() {
    let now = noon_local();
    let mut g = group("g1", &["a", "b", "a"]);
    g.category_votes
        .insert("App1".into(), vec!["a".into(), "b".into()]);
    let store = Arc::new(
        MemoryStore::new()
            .with_group(g)
            .with_snapshot("a", snapshot(now, &[("App1", 30.0)]))
            .with_snapshot("b", snapshot(now, &[("App1", 10.0)])),
    );

    pipeline(&store, now).run_once().await.unwrap();

    let board = store.get_current_leaderboard("g1").await.unwrap().unwrap();
    let uids: Vec<_> = board.entries.iter().map(|e| e.uid.as_str()).collect();
    assert_eq!(uids, vec!["a", "b"]);
    let avg = store.get_group_history("g1", DATE_KEY).await.unwrap().unwrap();
    assert_eq!(avg.value, 20.0);
}
