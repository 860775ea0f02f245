//! Durable contact directory and call history
//!
//! The relational side of the service: which users are contacts of each
//! other, and a record of every call that reached `connected`. Two backends
//! implement both traits: [`SqlDurableStore`] (SQLite through an r2d2 pool)
//! and [`MemoryDurableStore`] for tests and ephemeral deployments.

mod memory;
pub mod migrations;
mod sql_store;

pub use memory::MemoryDurableStore;
pub use sql_store::SqlDurableStore;

use crate::error::StoreResult;
use crate::types::UserId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Source of truth for contact relationships
#[async_trait]
pub trait ContactDirectory: Send + Sync {
    /// Contacts of `user`, sorted
    async fn friend_ids(&self, user: &UserId) -> StoreResult<Vec<UserId>>;

    /// Record a mutual contact. Returns false if it already existed.
    async fn add_contact(&self, a: &UserId, b: &UserId) -> StoreResult<bool>;

    /// Remove a mutual contact. Returns false if there was none.
    async fn remove_contact(&self, a: &UserId, b: &UserId) -> StoreResult<bool>;
}

/// Append-only history of connected calls
#[async_trait]
pub trait CallHistoryStore: Send + Sync {
    /// Persist a finished call and return its record id
    async fn create_record(&self, record: &CallHistoryRecord) -> StoreResult<i64>;

    /// Calls `user` took part in, newest first
    async fn history_for(&self, user: &UserId, limit: usize) -> StoreResult<Vec<StoredCall>>;
}

/// A finished call to persist
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHistoryRecord {
    pub participant_ids: Vec<UserId>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_seconds: u64,
}

/// A persisted call as read back from the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCall {
    pub id: i64,
    pub record: CallHistoryRecord,
}

/// One row of a user's call history, as served to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallHistoryEntry {
    pub call_id: i64,
    /// The other participant, if the record has one
    pub participant_id: Option<UserId>,
    pub duration: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub formatted_duration: String,
}

impl CallHistoryEntry {
    /// View of `stored` from `viewer`'s side
    pub fn for_viewer(stored: StoredCall, viewer: &UserId) -> Self {
        let participant_id =
            stored.record.participant_ids.iter().find(|id| *id != viewer).cloned();
        CallHistoryEntry {
            call_id: stored.id,
            participant_id,
            duration: stored.record.duration_seconds,
            start_time: stored.record.start_time,
            end_time: stored.record.end_time,
            formatted_duration: format_duration(stored.record.duration_seconds),
        }
    }
}

/// Billed length of a call: whole seconds from connect to end, at least one
pub fn call_duration_seconds(connected_at_millis: u64, ended_at_millis: u64) -> u64 {
    let elapsed = ended_at_millis.saturating_sub(connected_at_millis);
    ((elapsed + 500) / 1000).max(1)
}

/// Render seconds as `1h 15m`, `5m 30s`, `45s` or `0s`
pub fn format_duration(seconds: u64) -> String {
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    let mut parts = Vec::new();
    if hours > 0 {
        parts.push(format!("{}h", hours));
    }
    if minutes > 0 {
        parts.push(format!("{}m", minutes));
    }
    if secs > 0 || parts.is_empty() {
        parts.push(format!("{}s", secs));
    }
    parts.join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::millis_to_datetime;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(45), "45s");
        assert_eq!(format_duration(330), "5m 30s");
        assert_eq!(format_duration(4500), "1h 15m");
        assert_eq!(format_duration(3601), "1h 1s");
        assert_eq!(format_duration(120), "2m");
    }

    #[test]
    fn test_duration_rounds_and_floors_at_one() {
        assert_eq!(call_duration_seconds(1_000, 126_000), 125);
        assert_eq!(call_duration_seconds(1_000, 1_400), 1);
        assert_eq!(call_duration_seconds(1_000, 1_000), 1);
        assert_eq!(call_duration_seconds(0, 2_500), 3);
        assert_eq!(call_duration_seconds(0, 2_499), 2);
        // Clock skew never underflows
        assert_eq!(call_duration_seconds(5_000, 1_000), 1);
    }

    #[test]
    fn test_entry_picks_other_participant() {
        let stored = StoredCall {
            id: 3,
            record: CallHistoryRecord {
                participant_ids: vec![UserId::new("alice"), UserId::new("bob")],
                start_time: millis_to_datetime(0),
                end_time: millis_to_datetime(45_000),
                duration_seconds: 45,
            },
        };

        let entry = CallHistoryEntry::for_viewer(stored, &UserId::new("bob"));
        assert_eq!(entry.participant_id, Some(UserId::new("alice")));
        assert_eq!(entry.formatted_duration, "45s");
    }
}
