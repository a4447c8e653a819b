//! Document-store capability used by the aggregation job, with a JSON file
//! backend and an in-memory backend.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use lbagg_core::{ActivitySnapshot, CurrentLeaderboard, DailyHistoryRecord, Group, Identity};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "lbagg-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed document at {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid document key {0:?}")]
    InvalidKey(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One group document found by a listing. A document that could not be read
/// is still reported under its id, so one bad group never hides the rest.
#[derive(Debug)]
pub struct ListedGroup {
    pub id: String,
    pub document: StoreResult<Group>,
}

/// Reads and full-document overwrites the aggregation job needs.
///
/// Every `put_*` replaces the whole document at its key; there is no merge.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Errors only when the listing itself fails; per-document read failures
    /// are carried in [`ListedGroup::document`].
    async fn list_groups(&self) -> StoreResult<Vec<ListedGroup>>;

    async fn get_identity(&self, uid: &str) -> StoreResult<Option<Identity>>;

    async fn get_snapshot(&self, uid: &str) -> StoreResult<Option<ActivitySnapshot>>;

    async fn put_current_leaderboard(
        &self,
        group_id: &str,
        board: &CurrentLeaderboard,
    ) -> StoreResult<()>;

    async fn get_current_leaderboard(&self, group_id: &str)
        -> StoreResult<Option<CurrentLeaderboard>>;

    async fn put_member_history(
        &self,
        uid: &str,
        date_key: &str,
        record: &DailyHistoryRecord,
    ) -> StoreResult<()>;

    async fn get_member_history(
        &self,
        uid: &str,
        date_key: &str,
    ) -> StoreResult<Option<DailyHistoryRecord>>;

    async fn put_group_history(
        &self,
        group_id: &str,
        date_key: &str,
        record: &DailyHistoryRecord,
    ) -> StoreResult<()>;

    async fn get_group_history(
        &self,
        group_id: &str,
        date_key: &str,
    ) -> StoreResult<Option<DailyHistoryRecord>>;
}

fn validate_key(key: &str) -> StoreResult<&str> {
    if key.is_empty() || key.contains('/') || key.contains('\\') || key.contains("..") {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(key)
}

/// One JSON document per key, laid out like the document paths:
///
/// ```text
/// groups/{groupId}.json
/// groups/{groupId}/leaderboard/current.json
/// groups/{groupId}/history/{date}.json
/// users/{uid}.json
/// users/{uid}/history/{date}.json
/// screentime/{uid}.json
/// ```
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn groups_dir(&self) -> PathBuf {
        self.root.join("groups")
    }

    fn group_path(&self, group_id: &str) -> StoreResult<PathBuf> {
        Ok(self.groups_dir().join(format!("{}.json", validate_key(group_id)?)))
    }

    fn identity_path(&self, uid: &str) -> StoreResult<PathBuf> {
        Ok(self.root.join("users").join(format!("{}.json", validate_key(uid)?)))
    }

    fn snapshot_path(&self, uid: &str) -> StoreResult<PathBuf> {
        Ok(self
            .root
            .join("screentime")
            .join(format!("{}.json", validate_key(uid)?)))
    }

    fn leaderboard_path(&self, group_id: &str) -> StoreResult<PathBuf> {
        Ok(self
            .groups_dir()
            .join(validate_key(group_id)?)
            .join("leaderboard")
            .join("current.json"))
    }

    fn member_history_path(&self, uid: &str, date_key: &str) -> StoreResult<PathBuf> {
        Ok(self
            .root
            .join("users")
            .join(validate_key(uid)?)
            .join("history")
            .join(format!("{}.json", validate_key(date_key)?)))
    }

    fn group_history_path(&self, group_id: &str, date_key: &str) -> StoreResult<PathBuf> {
        Ok(self
            .groups_dir()
            .join(validate_key(group_id)?)
            .join("history")
            .join(format!("{}.json", validate_key(date_key)?)))
    }

    /// Writes a document seeded by an external path (membership, ingestion).
    /// The job itself never calls this; it exists for fixtures and tooling.
    pub async fn put_group(&self, group: &Group) -> StoreResult<()> {
        write_json(&self.group_path(&group.id)?, group).await
    }

    pub async fn put_identity(&self, uid: &str, identity: &Identity) -> StoreResult<()> {
        write_json(&self.identity_path(uid)?, identity).await
    }

    pub async fn put_snapshot(&self, uid: &str, snapshot: &ActivitySnapshot) -> StoreResult<()> {
        write_json(&self.snapshot_path(uid)?, snapshot).await
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError {
    let path = path.to_path_buf();
    move |source| StoreError::Io { path, source }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(io_error(path)(source)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Serde {
            path: path.to_path_buf(),
            source,
        })
}

/// Overwrite via a temp file in the target directory and an atomic rename.
async fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> StoreResult<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::InvalidKey(path.display().to_string()))?;
    fs::create_dir_all(parent).await.map_err(io_error(parent))?;

    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serde {
        path: path.to_path_buf(),
        source,
    })?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_error(&temp_path))?;
    file.write_all(&bytes).await.map_err(io_error(&temp_path))?;
    file.flush().await.map_err(io_error(&temp_path))?;
    drop(file);

    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(io_error(path)(source));
    }
    debug!(path = %path.display(), bytes = bytes.len(), "document written");
    Ok(())
}

#[async_trait]
impl DocumentStore for JsonFileStore {
    async fn list_groups(&self) -> StoreResult<Vec<ListedGroup>> {
        let dir = self.groups_dir();
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(StoreError::Io { path: dir, source }),
        };

        let mut groups = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(source) => {
                    return Err(StoreError::Io {
                        path: dir.clone(),
                        source,
                    })
                }
            };
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.starts_with('.') {
                continue;
            }
            let id = stem.to_string();
            let document = match read_json::<Group>(&path).await {
                Ok(Some(mut group)) => {
                    group.id = id.clone();
                    Ok(group)
                }
                // Removed between the directory scan and the read.
                Ok(None) => continue,
                Err(err) => {
                    warn!(group_id = %id, error = %err, "unreadable group document");
                    Err(err)
                }
            };
            groups.push(ListedGroup { id, document });
        }

        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }

    async fn get_identity(&self, uid: &str) -> StoreResult<Option<Identity>> {
        read_json(&self.identity_path(uid)?).await
    }

    async fn get_snapshot(&self, uid: &str) -> StoreResult<Option<ActivitySnapshot>> {
        read_json(&self.snapshot_path(uid)?).await
    }

    async fn put_current_leaderboard(
        &self,
        group_id: &str,
        board: &CurrentLeaderboard,
    ) -> StoreResult<()> {
        write_json(&self.leaderboard_path(group_id)?, board).await
    }

    async fn get_current_leaderboard(
        &self,
        group_id: &str,
    ) -> StoreResult<Option<CurrentLeaderboard>> {
        read_json(&self.leaderboard_path(group_id)?).await
    }

    async fn put_member_history(
        &self,
        uid: &str,
        date_key: &str,
        record: &DailyHistoryRecord,
    ) -> StoreResult<()> {
        write_json(&self.member_history_path(uid, date_key)?, record).await
    }

    async fn get_member_history(
        &self,
        uid: &str,
        date_key: &str,
    ) -> StoreResult<Option<DailyHistoryRecord>> {
        read_json(&self.member_history_path(uid, date_key)?).await
    }

    async fn put_group_history(
        &self,
        group_id: &str,
        date_key: &str,
        record: &DailyHistoryRecord,
    ) -> StoreResult<()> {
        write_json(&self.group_history_path(group_id, date_key)?, record).await
    }

    async fn get_group_history(
        &self,
        group_id: &str,
        date_key: &str,
    ) -> StoreResult<Option<DailyHistoryRecord>> {
        read_json(&self.group_history_path(group_id, date_key)?).await
    }
}

/// Store operation that [`MemoryStore`] can be told to fail.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailPoint {
    ListGroups,
    /// Reading one group's document during a listing.
    GroupDocument(String),
    Identity(String),
    Snapshot(String),
    Leaderboard(String),
    MemberHistory(String),
    GroupHistory(String),
}

#[derive(Debug, Default)]
struct MemoryState {
    groups: BTreeMap<String, Group>,
    identities: HashMap<String, Identity>,
    snapshots: HashMap<String, ActivitySnapshot>,
    leaderboards: HashMap<String, CurrentLeaderboard>,
    member_history: BTreeMap<(String, String), DailyHistoryRecord>,
    group_history: BTreeMap<(String, String), DailyHistoryRecord>,
    fail_points: HashSet<FailPoint>,
}

/// In-process store for tests and dry runs. Counts successful writes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_group(mut self, group: Group) -> Self {
        self.state.get_mut().groups.insert(group.id.clone(), group);
        self
    }

    pub fn with_identity(mut self, uid: impl Into<String>, identity: Identity) -> Self {
        self.state.get_mut().identities.insert(uid.into(), identity);
        self
    }

    pub fn with_snapshot(mut self, uid: impl Into<String>, snapshot: ActivitySnapshot) -> Self {
        self.state.get_mut().snapshots.insert(uid.into(), snapshot);
        self
    }

    pub fn failing_on(mut self, point: FailPoint) -> Self {
        self.state.get_mut().fail_points.insert(point);
        self
    }

    pub async fn set_snapshot(&self, uid: impl Into<String>, snapshot: ActivitySnapshot) {
        self.state.write().await.snapshots.insert(uid.into(), snapshot);
    }

    pub async fn clear_fail_points(&self) {
        self.state.write().await.fail_points.clear();
    }

    /// Number of successful writes since construction.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub async fn member_history_len(&self) -> usize {
        self.state.read().await.member_history.len()
    }

    pub async fn group_history_len(&self) -> usize {
        self.state.read().await.group_history.len()
    }

    fn check(state: &MemoryState, point: FailPoint) -> StoreResult<()> {
        if state.fail_points.contains(&point) {
            return Err(StoreError::Unavailable(format!("injected failure at {point:?}")));
        }
        Ok(())
    }

    fn record_write(&self) {
        self.writes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn list_groups(&self) -> StoreResult<Vec<ListedGroup>> {
        let state = self.state.read().await;
        Self::check(&state, FailPoint::ListGroups)?;
        Ok(state
            .groups
            .values()
            .map(|group| ListedGroup {
                id: group.id.clone(),
                document: Self::check(&state, FailPoint::GroupDocument(group.id.clone()))
                    .map(|()| group.clone()),
            })
            .collect())
    }

    async fn get_identity(&self, uid: &str) -> StoreResult<Option<Identity>> {
        let state = self.state.read().await;
        Self::check(&state, FailPoint::Identity(uid.to_string()))?;
        Ok(state.identities.get(uid).cloned())
    }

    async fn get_snapshot(&self, uid: &str) -> StoreResult<Option<ActivitySnapshot>> {
        let state = self.state.read().await;
        Self::check(&state, FailPoint::Snapshot(uid.to_string()))?;
        Ok(state.snapshots.get(uid).cloned())
    }

    async fn put_current_leaderboard(
        &self,
        group_id: &str,
        board: &CurrentLeaderboard,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        Self::check(&state, FailPoint::Leaderboard(group_id.to_string()))?;
        state.leaderboards.insert(group_id.to_string(), board.clone());
        self.record_write();
        Ok(())
    }

    async fn get_current_leaderboard(
        &self,
        group_id: &str,
    ) -> StoreResult<Option<CurrentLeaderboard>> {
        Ok(self.state.read().await.leaderboards.get(group_id).cloned())
    }

    async fn put_member_history(
        &self,
        uid: &str,
        date_key: &str,
        record: &DailyHistoryRecord,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        Self::check(&state, FailPoint::MemberHistory(uid.to_string()))?;
        state
            .member_history
            .insert((uid.to_string(), date_key.to_string()), record.clone());
        self.record_write();
        Ok(())
    }

    async fn get_member_history(
        &self,
        uid: &str,
        date_key: &str,
    ) -> StoreResult<Option<DailyHistoryRecord>> {
        Ok(self
            .state
            .read()
            .await
            .member_history
            .get(&(uid.to_string(), date_key.to_string()))
            .cloned())
    }

    async fn put_group_history(
        &self,
        group_id: &str,
        date_key: &str,
        record: &DailyHistoryRecord,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;
        Self::check(&state, FailPoint::GroupHistory(group_id.to_string()))?;
        state
            .group_history
            .insert((group_id.to_string(), date_key.to_string()), record.clone());
        self.record_write();
        Ok(())
    }

    async fn get_group_history(
        &self,
        group_id: &str,
        date_key: &str,
    ) -> StoreResult<Option<DailyHistoryRecord>> {
        Ok(self
            .state
            .read()
            .await
            .group_history
            .get(&(group_id.to_string(), date_key.to_string()))
            .cloned())
    }
}
