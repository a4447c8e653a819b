//! Core domain model for the group leaderboard aggregator.
//!
//! Field names on the serialized documents follow what the ingestion and
//! membership paths write into the store, so these types can be read from and
//! written to the same documents without a translation layer.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "lbagg-core";

/// Display name used when a member has no identity record or no username.
pub const UNKNOWN_DISPLAY_NAME: &str = "Unknown";

/// A set of members sharing one leaderboard and one voting configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub member_ids: Vec<String>,
    /// Category name to the ids of members who voted for it.
    #[serde(default)]
    pub category_votes: BTreeMap<String, Vec<String>>,
}

impl Group {
    /// Member ids with repeats removed, in first-occurrence order.
    pub fn distinct_member_ids(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.member_ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect()
    }

    pub fn member_count(&self) -> usize {
        self.distinct_member_ids().len()
    }

    pub fn has_members(&self) -> bool {
        !self.member_ids.is_empty()
    }
}

/// Minutes recorded against one category in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakdownItem {
    pub category: String,
    #[serde(default)]
    pub minutes: f64,
}

impl BreakdownItem {
    pub fn new(category: impl Into<String>, minutes: f64) -> Self {
        Self {
            category: category.into(),
            minutes,
        }
    }
}

/// Latest activity snapshot for one member, owned by the ingestion path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySnapshot {
    #[serde(default)]
    pub last_updated: Option<DateTime<Utc>>,
    /// Stored total. May include categories the group has voted out, so the
    /// leaderboard never reads it.
    #[serde(default, rename = "totalBadMinutes")]
    pub total_minutes: f64,
    #[serde(default, rename = "badAppsBreakdown")]
    pub breakdown: Vec<BreakdownItem>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Identity {
    #[serde(default)]
    pub username: Option<String>,
}

impl Identity {
    pub fn named(username: impl Into<String>) -> Self {
        Self {
            username: Some(username.into()),
        }
    }
}

/// Resolves the name shown on the leaderboard, falling back to
/// [`UNKNOWN_DISPLAY_NAME`] when the identity or its username is missing.
pub fn resolve_display_name(identity: Option<&Identity>) -> String {
    identity
        .and_then(|i| i.username.clone())
        .unwrap_or_else(|| UNKNOWN_DISPLAY_NAME.to_string())
}

pub fn sum_minutes(items: &[BreakdownItem]) -> f64 {
    items.iter().fold(0.0, |acc, item| acc + item.minutes)
}

/// One ranked row of a group's leaderboard, derived for a single run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardEntry {
    pub uid: String,
    pub username: String,
    #[serde(rename = "totalBadMinutes")]
    pub total_minutes: f64,
    #[serde(rename = "badAppsBreakdown")]
    pub breakdown: Vec<BreakdownItem>,
    pub last_updated: Option<DateTime<Utc>>,
}

impl LeaderboardEntry {
    /// Entry for a member without any activity snapshot.
    pub fn without_activity(uid: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            username: username.into(),
            total_minutes: 0.0,
            breakdown: Vec::new(),
            last_updated: None,
        }
    }

    pub fn has_data(&self) -> bool {
        self.last_updated.is_some()
    }
}

/// The wholly-replacing ranked leaderboard stored for a group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentLeaderboard {
    #[serde(rename = "lastUpdated")]
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<LeaderboardEntry>,
}

/// Date-keyed score of a member (their total) or a group (its average).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyHistoryRecord {
    pub value: f64,
    pub recorded_at: DateTime<Utc>,
}
