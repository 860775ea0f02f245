//! In-memory durable store

use super::{CallHistoryRecord, CallHistoryStore, ContactDirectory, StoredCall};
use crate::error::StoreResult;
use crate::types::UserId;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct DurableState {
    contacts: HashMap<UserId, BTreeSet<UserId>>,
    calls: Vec<StoredCall>,
}

/// Contacts and history held in process memory
#[derive(Debug, Default)]
pub struct MemoryDurableStore {
    state: RwLock<DurableState>,
    fail_history: AtomicBool,
}

impl MemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent history writes fail with `Unavailable`
    pub fn fail_history_writes(&self, fail: bool) {
        self.fail_history.store(fail, Ordering::SeqCst);
    }

    /// Every persisted call, oldest first
    pub async fn all_calls(&self) -> Vec<StoredCall> {
        self.state.read().await.calls.clone()
    }
}

#[async_trait]
impl ContactDirectory for MemoryDurableStore {
    async fn friend_ids(&self, user: &UserId) -> StoreResult<Vec<UserId>> {
        let state = self.state.read().await;
        Ok(state.contacts.get(user).map(|set| set.iter().cloned().collect()).unwrap_or_default())
    }

    async fn add_contact(&self, a: &UserId, b: &UserId) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let inserted = state.contacts.entry(a.clone()).or_default().insert(b.clone());
        state.contacts.entry(b.clone()).or_default().insert(a.clone());
        Ok(inserted)
    }

    async fn remove_contact(&self, a: &UserId, b: &UserId) -> StoreResult<bool> {
        let mut state = self.state.write().await;
        let removed = state.contacts.get_mut(a).map(|set| set.remove(b)).unwrap_or(false);
        if let Some(set) = state.contacts.get_mut(b) {
            set.remove(a);
        }
        Ok(removed)
    }
}

#[async_trait]
impl CallHistoryStore for MemoryDurableStore {
    async fn create_record(&self, record: &CallHistoryRecord) -> StoreResult<i64> {
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(crate::error::StoreError::Unavailable("history writes disabled".into()));
        }

        let mut state = self.state.write().await;
        let id = state.calls.len() as i64 + 1;
        state.calls.push(StoredCall { id, record: record.clone() });
        Ok(id)
    }

    async fn history_for(&self, user: &UserId, limit: usize) -> StoreResult<Vec<StoredCall>> {
        let state = self.state.read().await;
        let mut calls: Vec<StoredCall> = state
            .calls
            .iter()
            .filter(|call| call.record.participant_ids.contains(user))
            .cloned()
            .collect();
        calls.sort_by(|a, b| {
            b.record.start_time.cmp(&a.record.start_time).then_with(|| b.id.cmp(&a.id))
        });
        calls.truncate(limit);
        Ok(calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::millis_to_datetime;

    #[tokio::test]
    async fn test_contacts_roundtrip() {
        let store = MemoryDurableStore::new();
        let (a, b) = (UserId::new("a"), UserId::new("b"));

        assert!(store.add_contact(&a, &b).await.unwrap());
        assert_eq!(store.friend_ids(&b).await.unwrap(), vec![a.clone()]);
        assert!(store.remove_contact(&a, &b).await.unwrap());
        assert!(store.friend_ids(&b).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_history_writes() {
        let store = MemoryDurableStore::new();
        let record = CallHistoryRecord {
            participant_ids: vec![UserId::new("a"), UserId::new("b")],
            start_time: millis_to_datetime(0),
            end_time: millis_to_datetime(1_000),
            duration_seconds: 1,
        };

        store.fail_history_writes(true);
        assert!(store.create_record(&record).await.is_err());

        store.fail_history_writes(false);
        assert_eq!(store.create_record(&record).await.unwrap(), 1);
        assert_eq!(store.history_for(&UserId::new("a"), 5).await.unwrap().len(), 1);
    }
}
