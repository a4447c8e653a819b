//! Periodic leaderboard aggregation: quiet-hours gating, recency checks,
//! category vote filtering, ranking, daily history and per-run orchestration.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Duration, FixedOffset, Offset, Timelike, Utc};
use futures::future::join_all;
use lbagg_core::{
    resolve_display_name, sum_minutes, ActivitySnapshot, BreakdownItem, CurrentLeaderboard,
    DailyHistoryRecord, Group, Identity, LeaderboardEntry,
};
use lbagg_storage::{DocumentStore, JsonFileStore, ListedGroup};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lbagg-job";

pub const DEFAULT_UTC_OFFSET_HOURS: i32 = -8;
pub const DEFAULT_RECENCY_MINUTES: i64 = 35;
pub const DEFAULT_MAX_CONCURRENT_GROUPS: usize = 10;
pub const DEFAULT_CRON: &str = "0 0,30 * * * *";

/// What to do with a category the group never voted on while it did vote on others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnvotedCategoryPolicy {
    #[default]
    Include,
    Exclude,
}

impl FromStr for UnvotedCategoryPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "include" => Ok(Self::Include),
            "exclude" => Ok(Self::Exclude),
            other => bail!("unknown unvoted category policy {other:?} (expected include|exclude)"),
        }
    }
}

/// Local-hour window `[start_hour, end_hour)` during which runs are suppressed.
/// A window with `start_hour > end_hour` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuietHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            start_hour: 0,
            end_hour: 6,
        }
    }
}

impl QuietHours {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start_hour <= self.end_hour {
            hour >= self.start_hour && hour < self.end_hour
        } else {
            hour >= self.start_hour || hour < self.end_hour
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobConfig {
    pub data_dir: PathBuf,
    pub utc_offset: FixedOffset,
    pub quiet_hours: QuietHours,
    pub recency_window: Duration,
    pub unvoted_categories: UnvotedCategoryPolicy,
    pub max_concurrent_groups: usize,
    pub scheduler_enabled: bool,
    pub cron: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            utc_offset: offset_from_hours(DEFAULT_UTC_OFFSET_HOURS).unwrap_or_else(|_| Utc.fix()),
            quiet_hours: QuietHours::default(),
            recency_window: Duration::minutes(DEFAULT_RECENCY_MINUTES),
            unvoted_categories: UnvotedCategoryPolicy::default(),
            max_concurrent_groups: DEFAULT_MAX_CONCURRENT_GROUPS,
            scheduler_enabled: false,
            cron: DEFAULT_CRON.to_string(),
        }
    }
}

/// Keys accepted in the optional YAML file named by `LBAGG_CONFIG`.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    data_dir: Option<PathBuf>,
    utc_offset_hours: Option<i32>,
    quiet_start_hour: Option<u32>,
    quiet_end_hour: Option<u32>,
    recency_minutes: Option<i64>,
    unvoted_categories: Option<UnvotedCategoryPolicy>,
    max_concurrent_groups: Option<usize>,
    scheduler_enabled: Option<bool>,
    cron: Option<String>,
}

impl JobConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(v) = lookup("LBAGG_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("LBAGG_UTC_OFFSET_HOURS") {
            config.utc_offset = offset_from_hours(parse_var("LBAGG_UTC_OFFSET_HOURS", &v)?)?;
        }
        if let Some(v) = lookup("LBAGG_QUIET_START_HOUR") {
            config.quiet_hours.start_hour = parse_var("LBAGG_QUIET_START_HOUR", &v)?;
        }
        if let Some(v) = lookup("LBAGG_QUIET_END_HOUR") {
            config.quiet_hours.end_hour = parse_var("LBAGG_QUIET_END_HOUR", &v)?;
        }
        if let Some(v) = lookup("LBAGG_RECENCY_MINUTES") {
            config.recency_window = recency_from_minutes(parse_var("LBAGG_RECENCY_MINUTES", &v)?)?;
        }
        if let Some(v) = lookup("LBAGG_UNVOTED_CATEGORIES") {
            config.unvoted_categories = v
                .parse::<UnvotedCategoryPolicy>()
                .context("LBAGG_UNVOTED_CATEGORIES")?;
        }
        if let Some(v) = lookup("LBAGG_MAX_CONCURRENT_GROUPS") {
            config.max_concurrent_groups = parse_var("LBAGG_MAX_CONCURRENT_GROUPS", &v)?;
        }
        if let Some(v) = lookup("LBAGG_SCHEDULER_ENABLED") {
            config.scheduler_enabled = parse_flag("LBAGG_SCHEDULER_ENABLED", &v)?;
        }
        if let Some(v) = lookup("LBAGG_CRON") {
            config.cron = v;
        }
        if let Some(path) = lookup("LBAGG_CONFIG") {
            config.apply_file(Path::new(&path))?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Overlays the keys set in a YAML config file.
    pub fn apply_file(&mut self, path: &Path) -> Result<()> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let file: ConfigFile =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;

        if let Some(v) = file.data_dir {
            self.data_dir = v;
        }
        if let Some(v) = file.utc_offset_hours {
            self.utc_offset = offset_from_hours(v)?;
        }
        if let Some(v) = file.quiet_start_hour {
            self.quiet_hours.start_hour = v;
        }
        if let Some(v) = file.quiet_end_hour {
            self.quiet_hours.end_hour = v;
        }
        if let Some(v) = file.recency_minutes {
            self.recency_window = recency_from_minutes(v)?;
        }
        if let Some(v) = file.unvoted_categories {
            self.unvoted_categories = v;
        }
        if let Some(v) = file.max_concurrent_groups {
            self.max_concurrent_groups = v;
        }
        if let Some(v) = file.scheduler_enabled {
            self.scheduler_enabled = v;
        }
        if let Some(v) = file.cron {
            self.cron = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.quiet_hours.start_hour > 23 || self.quiet_hours.end_hour > 24 {
            bail!(
                "quiet hours {}..{} fall outside a day",
                self.quiet_hours.start_hour,
                self.quiet_hours.end_hour
            );
        }
        if self.max_concurrent_groups == 0 {
            bail!("max_concurrent_groups must be at least 1");
        }
        if self.cron.trim().is_empty() {
            bail!("cron expression must not be empty");
        }
        Ok(())
    }
}

fn parse_var<T>(key: &str, value: &str) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    value
        .trim()
        .parse::<T>()
        .map_err(|err| anyhow!("{key}={value:?} is not valid: {err}"))
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim() {
        "1" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "false" | "FALSE" | "False" => Ok(false),
        other => bail!("{key}={other:?} is not valid: expected true or false"),
    }
}

fn offset_from_hours(hours: i32) -> Result<FixedOffset> {
    if hours.abs() > 23 {
        bail!("utc offset {hours}h is out of range");
    }
    FixedOffset::east_opt(hours * 3600).with_context(|| format!("utc offset {hours}h is out of range"))
}

fn recency_from_minutes(minutes: i64) -> Result<Duration> {
    if !(0..=24 * 60).contains(&minutes) {
        bail!("recency window of {minutes} minutes is out of range");
    }
    Ok(Duration::minutes(minutes))
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub DateTime<Utc>);

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

pub fn local_hour(now: DateTime<Utc>, offset: FixedOffset) -> u32 {
    now.with_timezone(&offset).hour()
}

pub fn is_quiet_hours(now: DateTime<Utc>, offset: FixedOffset, quiet: QuietHours) -> bool {
    quiet.contains(local_hour(now, offset))
}

/// Calendar date under the fixed offset, as used for history keys.
pub fn local_date_key(now: DateTime<Utc>, offset: FixedOffset) -> String {
    now.with_timezone(&offset).format("%Y-%m-%d").to_string()
}

/// A timestamp in the future relative to `now` counts as recent.
pub fn is_recently_active(
    last_updated: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    window: Duration,
) -> bool {
    match last_updated {
        Some(ts) => now.signed_duration_since(ts) <= window,
        None => false,
    }
}

pub fn group_has_recent_activity<'a>(
    snapshots: impl IntoIterator<Item = &'a ActivitySnapshot>,
    now: DateTime<Utc>,
    window: Duration,
) -> bool {
    snapshots
        .into_iter()
        .any(|s| is_recently_active(s.last_updated, now, window))
}

/// Result of tallying a group's category votes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveCategories {
    /// No vote data: every category counts.
    All,
    Voted {
        /// Categories whose voters are a strict majority of the membership.
        active: BTreeSet<String>,
        /// Categories that were voted on but fell short.
        rejected: BTreeSet<String>,
    },
}

impl ActiveCategories {
    pub fn admits(&self, category: &str, unvoted: UnvotedCategoryPolicy) -> bool {
        match self {
            Self::All => true,
            Self::Voted { active, rejected } => {
                if active.contains(category) {
                    true
                } else if rejected.contains(category) {
                    false
                } else {
                    unvoted == UnvotedCategoryPolicy::Include
                }
            }
        }
    }
}

/// Strict majority: a category is active when `2 * voters > member_count`.
/// Repeated voter ids count once.
pub fn aggregate_votes(
    votes: &BTreeMap<String, Vec<String>>,
    member_count: usize,
) -> ActiveCategories {
    if votes.is_empty() {
        return ActiveCategories::All;
    }

    let mut active = BTreeSet::new();
    let mut rejected = BTreeSet::new();
    for (category, voters) in votes {
        let distinct: BTreeSet<&str> = voters.iter().map(String::as_str).collect();
        if distinct.len() * 2 > member_count {
            active.insert(category.clone());
        } else {
            rejected.insert(category.clone());
        }
    }
    ActiveCategories::Voted { active, rejected }
}

fn filter_breakdown(
    breakdown: &[BreakdownItem],
    active: &ActiveCategories,
    unvoted: UnvotedCategoryPolicy,
) -> Vec<BreakdownItem> {
    match active {
        ActiveCategories::All => breakdown.to_vec(),
        ActiveCategories::Voted { .. } => breakdown
            .iter()
            .filter(|item| active.admits(&item.category, unvoted))
            .cloned()
            .collect(),
    }
}

/// Builds the ranked entries for one group.
///
/// Every member gets an entry, in membership order before ranking. Totals are
/// recomputed from the filtered breakdown and the snapshot's stored total is
/// ignored. The sort is stable, so equal totals keep membership order.
pub fn build_leaderboard(
    member_ids: &[String],
    identities: &HashMap<String, Identity>,
    snapshots: &HashMap<String, ActivitySnapshot>,
    active: &ActiveCategories,
    unvoted: UnvotedCategoryPolicy,
) -> Vec<LeaderboardEntry> {
    let mut entries: Vec<LeaderboardEntry> = member_ids
        .iter()
        .map(|uid| {
            let username = resolve_display_name(identities.get(uid));
            match snapshots.get(uid) {
                None => LeaderboardEntry::without_activity(uid.clone(), username),
                Some(snapshot) => {
                    let breakdown = filter_breakdown(&snapshot.breakdown, active, unvoted);
                    LeaderboardEntry {
                        uid: uid.clone(),
                        username,
                        total_minutes: sum_minutes(&breakdown),
                        breakdown,
                        last_updated: snapshot.last_updated,
                    }
                }
            }
        })
        .collect();

    entries.sort_by(|a, b| {
        b.total_minutes.total_cmp(&a.total_minutes)
    });
    entries
}

/// Mean recomputed total over members that have a last-updated timestamp.
pub fn group_average(entries: &[LeaderboardEntry]) -> Option<f64> {
    let totals: Vec<f64> = entries
        .iter()
        .filter(|e| e.has_data())
        .map(|e| e.total_minutes)
        .collect();
    if totals.is_empty() {
        return None;
    }
    Some(totals.iter().sum::<f64>() / totals.len() as f64)
}

/// The history documents one run writes for a group.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryPlan {
    pub date_key: String,
    pub member_records: Vec<(String, DailyHistoryRecord)>,
    pub group_record: Option<DailyHistoryRecord>,
}

pub fn plan_history(
    entries: &[LeaderboardEntry],
    snapshots: &HashMap<String, ActivitySnapshot>,
    date_key: &str,
    recorded_at: DateTime<Utc>,
) -> HistoryPlan {
    let member_records = entries
        .iter()
        .filter(|e| snapshots.contains_key(&e.uid))
        .map(|e| {
            (
                e.uid.clone(),
                DailyHistoryRecord {
                    value: e.total_minutes,
                    recorded_at,
                },
            )
        })
        .collect();
    let group_record = group_average(entries).map(|value| DailyHistoryRecord { value, recorded_at });

    HistoryPlan {
        date_key: date_key.to_string(),
        member_records,
        group_record,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HistoryWriteReport {
    pub member_written: usize,
    pub member_failed: usize,
    pub group_written: bool,
}

/// Issues every history write concurrently. A failed write is logged and
/// counted; it never prevents the others.
pub async fn write_history(
    store: &dyn DocumentStore,
    group_id: &str,
    plan: &HistoryPlan,
) -> HistoryWriteReport {
    let member_writes = join_all(plan.member_records.iter().map(|(uid, record)| async move {
        match store.put_member_history(uid, &plan.date_key, record).await {
            Ok(()) => true,
            Err(err) => {
                warn!(uid = %uid, date = %plan.date_key, error = %err, "member history write failed");
                false
            }
        }
    }));

    let group_write = async {
        let Some(record) = &plan.group_record else {
            return false;
        };
        match store.put_group_history(group_id, &plan.date_key, record).await {
            Ok(()) => true,
            Err(err) => {
                warn!(date = %plan.date_key, error = %err, "group history write failed");
                false
            }
        }
    };

    let (member_results, group_written) = tokio::join!(member_writes, group_write);
    let member_written = member_results.iter().filter(|ok| **ok).count();
    HistoryWriteReport {
        member_written,
        member_failed: member_results.len() - member_written,
        group_written,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NoMembers,
    NoRecentActivity,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum GroupStatus {
    Updated {
        members: usize,
        member_history_written: usize,
        member_history_failed: usize,
        group_average: Option<f64>,
        group_history_written: bool,
    },
    Skipped {
        reason: SkipReason,
    },
    Failed {
        error: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupOutcome {
    pub group_id: String,
    #[serde(flatten)]
    pub status: GroupStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub date_key: String,
    pub suppressed: bool,
    pub groups_seen: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
    pub outcomes: Vec<GroupOutcome>,
}

impl RunSummary {
    fn new(
        run_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        date_key: String,
        suppressed: bool,
        mut outcomes: Vec<GroupOutcome>,
    ) -> Self {
        outcomes.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        let count = |pred: fn(&GroupStatus) -> bool| outcomes.iter().filter(|o| pred(&o.status)).count();
        let updated = count(|s| matches!(s, GroupStatus::Updated { .. }));
        let skipped = count(|s| matches!(s, GroupStatus::Skipped { .. }));
        let failed = count(|s| matches!(s, GroupStatus::Failed { .. }));
        Self {
            run_id,
            started_at,
            finished_at,
            date_key,
            suppressed,
            groups_seen: outcomes.len(),
            updated,
            skipped,
            failed,
            outcomes,
        }
    }

    pub fn outcome(&self, group_id: &str) -> Option<&GroupOutcome> {
        self.outcomes.iter().find(|o| o.group_id == group_id)
    }
}

/// Shared, owned state handed to each per-group task.
#[derive(Clone)]
struct GroupContext {
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
    config: JobConfig,
    now: DateTime<Utc>,
    date_key: String,
}

pub struct AggregationPipeline {
    config: JobConfig,
    store: Arc<dyn DocumentStore>,
    clock: Arc<dyn Clock>,
}

impl AggregationPipeline {
    pub fn new(config: JobConfig, store: Arc<dyn DocumentStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            store,
            clock,
        }
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    /// Runs one aggregation pass over every group.
    ///
    /// Only a failure to list groups is returned as an error; anything that
    /// goes wrong inside a group is recorded in that group's outcome.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("aggregate_run", %run_id);
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunSummary> {
        let started_at = self.clock.now();
        let date_key = local_date_key(started_at, self.config.utc_offset);

        if is_quiet_hours(started_at, self.config.utc_offset, self.config.quiet_hours) {
            info!(
                local_hour = local_hour(started_at, self.config.utc_offset),
                "quiet hours active, skipping run"
            );
            return Ok(RunSummary::new(
                run_id,
                started_at,
                self.clock.now(),
                date_key,
                true,
                Vec::new(),
            ));
        }

        let listed = self.store.list_groups().await.context("listing groups")?;
        if listed.is_empty() {
            info!("no groups found");
        }

        let mut outcomes = Vec::new();
        let limit = Arc::new(Semaphore::new(self.config.max_concurrent_groups.max(1)));
        let mut tasks = JoinSet::new();
        for ListedGroup { id, document } in listed {
            let group = match document {
                Ok(group) => group,
                Err(err) => {
                    let error = format!("reading group document: {err}");
                    warn!(group_id = %id, error = %error, "group failed");
                    outcomes.push(GroupOutcome {
                        group_id: id,
                        status: GroupStatus::Failed { error },
                    });
                    continue;
                }
            };
            let ctx = GroupContext {
                store: Arc::clone(&self.store),
                clock: Arc::clone(&self.clock),
                config: self.config.clone(),
                now: started_at,
                date_key: date_key.clone(),
            };
            let limit = Arc::clone(&limit);
            let span = info_span!("group", group_id = %group.id);
            tasks.spawn(
                async move {
                    // The semaphore is never closed; a missing permit only drops the bound.
                    let _permit = limit.acquire_owned().await.ok();
                    let group_id = group.id.clone();
                    let status = match process_group(&ctx, group).await {
                        Ok(status) => status,
                        Err(err) => {
                            let error = format!("{err:#}");
                            warn!(error = %error, "group failed");
                            GroupStatus::Failed { error }
                        }
                    };
                    GroupOutcome { group_id, status }
                }
                .instrument(span),
            );
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(err) => {
                    warn!(error = %err, "group task did not complete");
                    outcomes.push(GroupOutcome {
                        group_id: "<unknown>".to_string(),
                        status: GroupStatus::Failed {
                            error: err.to_string(),
                        },
                    });
                }
            }
        }

        let summary = RunSummary::new(
            run_id,
            started_at,
            self.clock.now(),
            date_key,
            false,
            outcomes,
        );
        info!(
            groups = summary.groups_seen,
            updated = summary.updated,
            skipped = summary.skipped,
            failed = summary.failed,
            "aggregation run complete"
        );
        Ok(summary)
    }
}

async fn process_group(ctx: &GroupContext, group: Group) -> Result<GroupStatus> {
    if !group.has_members() {
        info!("group has no members, skipping");
        return Ok(GroupStatus::Skipped {
            reason: SkipReason::NoMembers,
        });
    }

    let store = ctx.store.as_ref();
    let member_ids = group.distinct_member_ids();
    let active = aggregate_votes(&group.category_votes, member_ids.len());
    debug!(?active, "category votes tallied");

    let (identities, snapshots) = tokio::try_join!(
        load_identities(store, &member_ids),
        load_snapshots(store, &member_ids),
    )?;

    if !group_has_recent_activity(snapshots.values(), ctx.now, ctx.config.recency_window) {
        info!("no recent activity in group, skipping");
        return Ok(GroupStatus::Skipped {
            reason: SkipReason::NoRecentActivity,
        });
    }

    let entries = build_leaderboard(
        &member_ids,
        &identities,
        &snapshots,
        &active,
        ctx.config.unvoted_categories,
    );
    let board = CurrentLeaderboard {
        generated_at: ctx.clock.now(),
        entries,
    };
    store
        .put_current_leaderboard(&group.id, &board)
        .await
        .context("writing current leaderboard")?;

    let plan = plan_history(&board.entries, &snapshots, &ctx.date_key, ctx.clock.now());
    let report = write_history(store, &group.id, &plan).await;

    info!(
        members = board.entries.len(),
        member_history = report.member_written,
        member_history_failed = report.member_failed,
        group_history = report.group_written,
        "updated leaderboard"
    );

    Ok(GroupStatus::Updated {
        members: board.entries.len(),
        member_history_written: report.member_written,
        member_history_failed: report.member_failed,
        group_average: plan.group_record.as_ref().map(|r| r.value),
        group_history_written: report.group_written,
    })
}

async fn load_identities(
    store: &dyn DocumentStore,
    member_ids: &[String],
) -> Result<HashMap<String, Identity>> {
    let reads = member_ids.iter().map(|uid| async move {
        store
            .get_identity(uid)
            .await
            .map(|identity| (uid, identity))
            .with_context(|| format!("reading identity for {uid}"))
    });

    let mut identities = HashMap::new();
    for result in join_all(reads).await {
        let (uid, identity) = result?;
        if let Some(identity) = identity {
            identities.insert(uid.clone(), identity);
        }
    }
    Ok(identities)
}

async fn load_snapshots(
    store: &dyn DocumentStore,
    member_ids: &[String],
) -> Result<HashMap<String, ActivitySnapshot>> {
    let reads = member_ids.iter().map(|uid| async move {
        store
            .get_snapshot(uid)
            .await
            .map(|snapshot| (uid, snapshot))
            .with_context(|| format!("reading activity snapshot for {uid}"))
    });

    let mut snapshots = HashMap::new();
    for result in join_all(reads).await {
        let (uid, snapshot) = result?;
        if let Some(snapshot) = snapshot {
            snapshots.insert(uid.clone(), snapshot);
        }
    }
    Ok(snapshots)
}

/// Pipeline over the on-disk store at `config.data_dir`, using the system clock.
pub fn pipeline_from_config(config: JobConfig) -> AggregationPipeline {
    let store = Arc::new(JsonFileStore::new(config.data_dir.clone()));
    AggregationPipeline::new(config, store, Arc::new(SystemClock))
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let config = JobConfig::from_env()?;
    pipeline_from_config(config).run_once().await
}

/// Registers the aggregation run on the configured cron cadence. Returns
/// `None` when the scheduler is disabled.
///
/// Runs are not serialized against each other; every write is an idempotent
/// overwrite, so an overlapping run only repeats work.
pub async fn build_scheduler(pipeline: Arc<AggregationPipeline>) -> Result<Option<JobScheduler>> {
    if !pipeline.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = pipeline.config().cron.clone();
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
        let pipeline = Arc::clone(&pipeline);
        Box::pin(async move {
            match pipeline.run_once().await {
                Ok(summary) => info!(
                    run_id = %summary.run_id,
                    updated = summary.updated,
                    failed = summary.failed,
                    "scheduled aggregation finished"
                ),
                Err(err) => warn!(error = %format!("{err:#}"), "scheduled aggregation failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(Some(sched))
}
