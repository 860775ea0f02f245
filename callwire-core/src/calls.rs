/*
    ActiveCallManager - committed calls

    A call exists from an accepted response until one of: `call:end`,
    a pre-connection `call:cancel`, or the disconnect grace period running
    out. Its record, global set membership and both participants' reverse
    pointers are written and deleted together by the store.

    Ending a call removes it first and persists history from the removed
    record. Whoever loses the removal race gets nothing back, so a call is
    never written to history twice.

    State machine:
        active -> connected -> ended{persisted | unpersisted}
*/

use crate::clock::{millis_to_datetime, Clock};
use crate::durable::{call_duration_seconds, CallHistoryRecord, CallHistoryStore};
use crate::error::StoreResult;
use crate::metrics::{record_counter, HISTORY_FAILED, HISTORY_PERSISTED};
use crate::store::ActiveCallStore;
use crate::types::{CallId, CallPair, CallRole, Payload, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Accepted, media not yet confirmed
    Active,
    /// Media confirmed by a participant
    Connected,
}

/// A committed call between two users
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveCall {
    pub call_id: CallId,
    pub caller_id: UserId,
    pub callee_id: UserId,
    pub offer: Payload,
    pub answer: Payload,
    pub status: CallStatus,
    /// Epoch milliseconds
    pub started_at: u64,
    /// Epoch milliseconds, stamped once
    pub connected_at: Option<u64>,
}

impl ActiveCall {
    pub fn new(
        call_id: CallId,
        caller_id: UserId,
        callee_id: UserId,
        offer: Payload,
        answer: Payload,
        started_at: u64,
    ) -> Self {
        ActiveCall {
            call_id,
            caller_id,
            callee_id,
            offer,
            answer,
            status: CallStatus::Active,
            started_at,
            connected_at: None,
        }
    }

    pub fn pair(&self) -> CallPair {
        CallPair::new(self.caller_id.clone(), self.callee_id.clone())
    }

    pub fn is_connected(&self) -> bool {
        self.status == CallStatus::Connected
    }

    pub fn role_of(&self, user: &UserId) -> Option<CallRole> {
        if user == &self.caller_id {
            Some(CallRole::Caller)
        } else if user == &self.callee_id {
            Some(CallRole::Callee)
        } else {
            None
        }
    }

    /// The other participant
    pub fn peer_of(&self, user: &UserId) -> Option<&UserId> {
        match self.role_of(user)? {
            CallRole::Caller => Some(&self.callee_id),
            CallRole::Callee => Some(&self.caller_id),
        }
    }
}

/// How a call is being ended
#[derive(Debug, Clone, Default)]
pub struct EndOptions {
    /// Write history if the call reached `connected`
    pub persist: bool,
    pub ended_by: Option<UserId>,
    pub reason: Option<String>,
}

impl EndOptions {
    pub fn persisted(ended_by: &UserId) -> Self {
        EndOptions { persist: true, ended_by: Some(ended_by.clone()), reason: None }
    }

    pub fn unpersisted(ended_by: &UserId) -> Self {
        EndOptions { persist: false, ended_by: Some(ended_by.clone()), reason: None }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Outcome of ending a call
#[derive(Debug, Clone)]
pub struct EndedCall {
    pub call: ActiveCall,
    /// Id of the history record, when one was written
    pub history_id: Option<i64>,
    pub ended_at: u64,
}

/// Creates, tracks and tears down active calls
pub struct ActiveCallManager<S> {
    store: Arc<S>,
    history: Arc<dyn CallHistoryStore>,
    clock: Arc<dyn Clock>,
    grace: Duration,
}

impl<S: ActiveCallStore> ActiveCallManager<S> {
    pub fn new(
        store: Arc<S>,
        history: Arc<dyn CallHistoryStore>,
        clock: Arc<dyn Clock>,
        grace: Duration,
    ) -> Self {
        ActiveCallManager { store, history, clock, grace }
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Commit a call between the pair under a fresh id
    pub async fn create(
        &self,
        caller_id: &UserId,
        callee_id: &UserId,
        offer: Payload,
        answer: Payload,
    ) -> StoreResult<ActiveCall> {
        let call = ActiveCall::new(
            CallId::generate(),
            caller_id.clone(),
            callee_id.clone(),
            offer,
            answer,
            self.clock.now_millis(),
        );
        self.store.insert_call(call.clone()).await?;

        info!(call_id = %call.call_id, caller_id = %caller_id, callee_id = %callee_id, "Call created");
        Ok(call)
    }

    /// Idempotent `active -> connected`
    pub async fn mark_connected(&self, call_id: &CallId) -> StoreResult<Option<ActiveCall>> {
        let call = self.store.mark_connected(call_id, self.clock.now_millis()).await?;
        if let Some(call) = &call {
            debug!(call_id = %call_id, connected_at = ?call.connected_at, "Call connected");
        }
        Ok(call)
    }

    pub async fn get(&self, call_id: &CallId) -> StoreResult<Option<ActiveCall>> {
        self.store.get_call(call_id).await
    }

    /// The call `user` is in. A pointer whose call is gone is deleted.
    pub async fn current_call(&self, user: &UserId) -> StoreResult<Option<ActiveCall>> {
        let Some(call_id) = self.store.current_call_id(user).await? else {
            return Ok(None);
        };

        match self.store.get_call(&call_id).await? {
            Some(call) => Ok(Some(call)),
            None => {
                debug!(user_id = %user, call_id = %call_id, "Dropping stale call pointer");
                self.store.clear_current_call(user, &call_id).await?;
                Ok(None)
            }
        }
    }

    /// Remove the call and, if asked and it connected, record it in history.
    ///
    /// Returns `None` when the call was already gone.
    pub async fn end(&self, call_id: &CallId, opts: EndOptions) -> StoreResult<Option<EndedCall>> {
        let Some(call) = self.store.remove_call(call_id).await? else {
            return Ok(None);
        };
        Ok(Some(self.finish(call, opts).await))
    }

    /// Complete teardown of a call the store already removed
    pub async fn finish(&self, call: ActiveCall, opts: EndOptions) -> EndedCall {
        let ended_at = self.clock.now_millis();
        let history_id =
            if opts.persist { self.persist_history(&call, ended_at).await } else { None };

        info!(
            call_id = %call.call_id,
            ended_by = ?opts.ended_by.as_ref().map(|u| u.as_str()),
            reason = ?opts.reason,
            persisted = history_id.is_some(),
            "Call ended"
        );
        EndedCall { call, history_id, ended_at }
    }

    /// Start the grace period on the call and both pointers
    pub async fn set_expiry(&self, call_id: &CallId) -> StoreResult<bool> {
        self.store.set_call_expiry(call_id, self.grace).await
    }

    pub async fn remove_expiry(&self, call_id: &CallId) -> StoreResult<bool> {
        self.store.clear_call_expiry(call_id).await
    }

    pub async fn active_call_ids(&self) -> StoreResult<Vec<CallId>> {
        self.store.active_call_ids().await
    }

    /// Calls whose grace period elapsed, already removed from the store
    pub async fn drain_expired(&self) -> StoreResult<Vec<ActiveCall>> {
        self.store.drain_expired_calls().await
    }

    /// Write a history record for a connected call. Failures are logged and
    /// swallowed.
    async fn persist_history(&self, call: &ActiveCall, ended_at: u64) -> Option<i64> {
        let connected_at = match (call.status, call.connected_at) {
            (CallStatus::Connected, Some(at)) => at,
            _ => return None,
        };

        let record = CallHistoryRecord {
            participant_ids: vec![call.caller_id.clone(), call.callee_id.clone()],
            start_time: millis_to_datetime(connected_at),
            end_time: millis_to_datetime(ended_at),
            duration_seconds: call_duration_seconds(connected_at, ended_at),
        };

        match self.history.create_record(&record).await {
            Ok(id) => {
                record_counter(HISTORY_PERSISTED, 1);
                info!(
                    call_id = %call.call_id,
                    record_id = id,
                    duration_seconds = record.duration_seconds,
                    "Call history persisted"
                );
                Some(id)
            }
            Err(e) => {
                record_counter(HISTORY_FAILED, 1);
                error!(call_id = %call.call_id, error = %e, "Failed to persist call history");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::MemoryDurableStore;
    use crate::store::MemoryStore;
    use crate::test_utils::ManualClock;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        history: Arc<MemoryDurableStore>,
        clock: Arc<ManualClock>,
        calls: ActiveCallManager<MemoryStore>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let history = Arc::new(MemoryDurableStore::new());
        let clock = Arc::new(ManualClock::new(1_000_000));
        let calls = ActiveCallManager::new(
            store.clone(),
            history.clone(),
            clock.clone(),
            Duration::from_secs(60),
        );
        Fixture { store, history, clock, calls }
    }

    fn alice() -> UserId {
        UserId::new("alice")
    }

    fn bob() -> UserId {
        UserId::new("bob")
    }

    #[test]
    fn test_peer_of() {
        let call =
            ActiveCall::new(CallId::from("c"), alice(), bob(), json!({}), json!({}), 0);
        assert_eq!(call.peer_of(&alice()), Some(&bob()));
        assert_eq!(call.peer_of(&bob()), Some(&alice()));
        assert_eq!(call.peer_of(&UserId::new("eve")), None);
        assert_eq!(call.role_of(&bob()), Some(CallRole::Callee));
    }

    #[tokio::test]
    async fn test_both_participants_share_call() {
        let f = fixture();
        let call = f.calls.create(&alice(), &bob(), json!({"o": 1}), json!({"a": 1})).await.unwrap();

        let for_alice = f.calls.current_call(&alice()).await.unwrap().unwrap();
        let for_bob = f.calls.current_call(&bob()).await.unwrap().unwrap();
        assert_eq!(for_alice.call_id, call.call_id);
        assert_eq!(for_bob.call_id, call.call_id);
        assert_eq!(call.status, CallStatus::Active);
        assert_eq!(f.calls.active_call_ids().await.unwrap(), vec![call.call_id]);
    }

    #[tokio::test]
    async fn test_end_with_persistence_records_duration() {
        let f = fixture();
        let call = f.calls.create(&alice(), &bob(), json!({}), json!({})).await.unwrap();

        f.clock.advance_millis(2_000);
        f.calls.mark_connected(&call.call_id).await.unwrap();
        f.clock.advance_millis(125_000);

        let ended = f
            .calls
            .end(&call.call_id, EndOptions::persisted(&alice()))
            .await
            .unwrap()
            .unwrap();
        assert!(ended.history_id.is_some());

        let stored = f.history.all_calls().await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].record.duration_seconds, 125);
        assert!(f.calls.current_call(&bob()).await.unwrap().is_none());
        assert!(f.calls.active_call_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_end_is_single_shot() {
        let f = fixture();
        let call = f.calls.create(&alice(), &bob(), json!({}), json!({})).await.unwrap();
        f.calls.mark_connected(&call.call_id).await.unwrap();

        assert!(f.calls.end(&call.call_id, EndOptions::persisted(&alice())).await.unwrap().is_some());
        assert!(f.calls.end(&call.call_id, EndOptions::persisted(&bob())).await.unwrap().is_none());
        assert_eq!(f.history.all_calls().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unconnected_call_is_never_persisted() {
        let f = fixture();
        let call = f.calls.create(&alice(), &bob(), json!({}), json!({})).await.unwrap();

        let ended = f
            .calls
            .end(&call.call_id, EndOptions::persisted(&alice()))
            .await
            .unwrap()
            .unwrap();
        assert!(ended.history_id.is_none());
        assert!(f.history.all_calls().await.is_empty());
    }

    #[tokio::test]
    async fn test_history_failure_is_swallowed() {
        let f = fixture();
        let call = f.calls.create(&alice(), &bob(), json!({}), json!({})).await.unwrap();
        f.calls.mark_connected(&call.call_id).await.unwrap();
        f.history.fail_history_writes(true);

        let ended = f.calls.end(&call.call_id, EndOptions::persisted(&bob())).await.unwrap();
        assert!(ended.unwrap().history_id.is_none());
        assert!(f.calls.current_call(&alice()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_mark_connected_is_idempotent() {
        let f = fixture();
        let call = f.calls.create(&alice(), &bob(), json!({}), json!({})).await.unwrap();

        let first = f.calls.mark_connected(&call.call_id).await.unwrap().unwrap();
        f.clock.advance_millis(5_000);
        let second = f.calls.mark_connected(&call.call_id).await.unwrap().unwrap();

        assert_eq!(first.connected_at, second.connected_at);
        assert_eq!(second.status, CallStatus::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grace_expiry_drains_call() {
        let f = fixture();
        let call = f.calls.create(&alice(), &bob(), json!({}), json!({})).await.unwrap();

        assert!(f.calls.set_expiry(&call.call_id).await.unwrap());
        tokio::time::advance(Duration::from_secs(61)).await;

        assert!(f.calls.current_call(&alice()).await.unwrap().is_none());
        let drained = f.calls.drain_expired().await.unwrap();
        assert_eq!(drained.len(), 1);
        assert!(f.store.active_call_ids().await.unwrap().is_empty());
    }
}
