/*
    CallRequestManager - pending call invitations

    A request lives from `call:initiate` until the callee answers, the caller
    cancels, or its TTL elapses. There is at most one request per ordered
    (caller, callee) pair; initiating again overwrites it.

    The store keeps a secondary index per caller and per callee. Index
    entries can outlive their record (the TTL dropped it), so lookups treat a
    dangling entry as absent and drop it on the way.

    State machine per pair:
        none -> pending -> {accepted, rejected, cancelled, expired} -> none
*/

use crate::clock::Clock;
use crate::error::StoreResult;
use crate::store::CallRequestStore;
use crate::types::{CallPair, CallRole, Payload, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Request status. Only pending requests are ever stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
}

/// A pending invitation from caller to callee
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub offer: Payload,
    pub status: RequestStatus,
    /// Epoch milliseconds
    pub created_at: u64,
}

impl CallRequest {
    pub fn new(caller_id: UserId, callee_id: UserId, offer: Payload, created_at: u64) -> Self {
        CallRequest { caller_id, callee_id, offer, status: RequestStatus::Pending, created_at }
    }

    pub fn pair(&self) -> CallPair {
        CallPair::new(self.caller_id.clone(), self.callee_id.clone())
    }
}

/// Creates, looks up and consumes pending requests
pub struct CallRequestManager<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl<S: CallRequestStore> CallRequestManager<S> {
    pub fn new(store: Arc<S>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        CallRequestManager { store, clock, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Store a request for the pair, replacing any earlier one
    pub async fn create(
        &self,
        caller_id: &UserId,
        callee_id: &UserId,
        offer: Payload,
    ) -> StoreResult<CallRequest> {
        let request =
            CallRequest::new(caller_id.clone(), callee_id.clone(), offer, self.clock.now_millis());
        self.store.put_request(request.clone(), self.ttl).await?;

        debug!(caller_id = %caller_id, callee_id = %callee_id, "Call request stored");
        Ok(request)
    }

    pub async fn get(&self, pair: &CallPair) -> StoreResult<Option<CallRequest>> {
        self.store.get_request(pair).await
    }

    /// Remove the request for the pair. Returns whether one was removed.
    pub async fn delete(&self, pair: &CallPair) -> StoreResult<bool> {
        Ok(self.take(pair).await?.is_some())
    }

    /// Remove and return the request; the first of concurrent takers wins
    pub async fn take(&self, pair: &CallPair) -> StoreResult<Option<CallRequest>> {
        self.store.take_request(pair).await
    }

    /// A request waiting for `user` to answer
    pub async fn pending_incoming(&self, user: &UserId) -> StoreResult<Option<CallRequest>> {
        self.first_live(user, CallRole::Callee).await
    }

    /// A request `user` sent that is still unanswered
    pub async fn pending_outgoing(&self, user: &UserId) -> StoreResult<Option<CallRequest>> {
        self.first_live(user, CallRole::Caller).await
    }

    /// Every live outgoing request of `user`
    pub async fn all_outgoing(&self, user: &UserId) -> StoreResult<Vec<CallRequest>> {
        let mut live = Vec::new();
        for pair in self.store.indexed_pairs(user, CallRole::Caller).await? {
            if let Some(request) = self.resolve(&pair).await? {
                live.push(request);
            }
        }
        Ok(live)
    }

    /// Remove requests whose TTL elapsed
    pub async fn drain_expired(&self) -> StoreResult<Vec<CallRequest>> {
        self.store.drain_expired_requests().await
    }

    async fn first_live(&self, user: &UserId, role: CallRole) -> StoreResult<Option<CallRequest>> {
        for pair in self.store.indexed_pairs(user, role).await? {
            if let Some(request) = self.resolve(&pair).await? {
                return Ok(Some(request));
            }
        }
        Ok(None)
    }

    /// Look up an indexed pair; the store drops the entry if the record is gone
    async fn resolve(&self, pair: &CallPair) -> StoreResult<Option<CallRequest>> {
        let resolved = self.store.resolve_indexed(pair).await?;
        if resolved.is_none() {
            debug!(pair = %pair, "Dropped stale request index entry");
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::test_utils::ManualClock;
    use serde_json::json;

    fn manager() -> (Arc<MemoryStore>, CallRequestManager<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(10_000));
        let manager = CallRequestManager::new(store.clone(), clock, Duration::from_secs(60));
        (store, manager)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let (_, requests) = manager();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        let created = requests.create(&alice, &bob, json!({"sdp": "x"})).await.unwrap();
        assert_eq!(created.status, RequestStatus::Pending);
        assert_eq!(created.created_at, 10_000);

        let stored = requests.get(&created.pair()).await.unwrap().unwrap();
        assert_eq!(stored, created);
        assert_eq!(requests.pending_incoming(&bob).await.unwrap(), Some(created.clone()));
        assert_eq!(requests.pending_outgoing(&alice).await.unwrap(), Some(created));
        assert!(requests.pending_incoming(&alice).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let (_, requests) = manager();
        let pair = CallPair::new("alice".into(), "bob".into());
        requests.create(&pair.caller, &pair.callee, json!({})).await.unwrap();

        assert!(requests.delete(&pair).await.unwrap());
        assert!(!requests.delete(&pair).await.unwrap());
        assert!(requests.pending_outgoing(&pair.caller).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_index_entry_is_reconciled() {
        let (store, requests) = manager();
        let pair = CallPair::new("alice".into(), "bob".into());
        requests.create(&pair.caller, &pair.callee, json!({})).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(requests.pending_incoming(&pair.callee).await.unwrap().is_none());
        assert!(store.indexed_pairs(&pair.callee, CallRole::Callee).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_all_outgoing_lists_each_callee() {
        let (_, requests) = manager();
        let alice = UserId::new("alice");
        requests.create(&alice, &UserId::new("bob"), json!({})).await.unwrap();
        requests.create(&alice, &UserId::new("carol"), json!({})).await.unwrap();

        let outgoing = requests.all_outgoing(&alice).await.unwrap();
        assert_eq!(outgoing.len(), 2);
    }
}
