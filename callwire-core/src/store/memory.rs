/*
    MemoryStore - in-process signaling store

    One lock guards every set and record, so each trait method runs as a
    single atomic routine: no other operation can observe a call record
    without its reverse pointers, or a presence set half way through a
    transition.

    Expiration:
    - entries carry an optional deadline on the tokio clock
    - expired entries are invisible to reads but stay in place until
      drained, so expiry can still be surfaced to the affected users
    - friend sets are never drained; an expired set reads as absent and is
      replaced on the next hydration
*/

use super::{
    ActiveCallStore, CallRequestStore, FanOut, PresenceStore, PresenceTransition,
    TransitionOutcome,
};
use crate::calls::{ActiveCall, CallStatus};
use crate::error::StoreResult;
use crate::requests::CallRequest;
use crate::types::{CallId, CallPair, CallRole, UserId};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Value with an optional expiry deadline
#[derive(Debug, Clone)]
struct Entry<T> {
    value: T,
    expires_at: Option<Instant>,
}

impl<T> Entry<T> {
    fn persistent(value: T) -> Self {
        Entry { value, expires_at: None }
    }

    fn expiring(value: T, ttl: Duration, now: Instant) -> Self {
        Entry { value, expires_at: Some(now + ttl) }
    }

    /// An entry is still live at exactly its deadline
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(deadline) if now > deadline)
    }

    fn live(&self, now: Instant) -> Option<&T> {
        if self.is_expired(now) {
            None
        } else {
            Some(&self.value)
        }
    }
}

#[derive(Debug, Default)]
struct StoreState {
    online: HashSet<UserId>,
    in_call: HashSet<UserId>,
    friends: HashMap<UserId, Entry<HashSet<UserId>>>,

    requests: HashMap<CallPair, Entry<CallRequest>>,
    requests_by_caller: HashMap<UserId, HashSet<CallPair>>,
    requests_by_callee: HashMap<UserId, HashSet<CallPair>>,

    calls: HashMap<CallId, Entry<ActiveCall>>,
    active_calls: HashSet<CallId>,
    current_call: HashMap<UserId, Entry<CallId>>,
}

impl StoreState {
    fn live_friends(&self, user: &UserId, now: Instant) -> Option<&HashSet<UserId>> {
        self.friends.get(user).and_then(|entry| entry.live(now))
    }

    fn is_reachable(&self, user: &UserId) -> bool {
        self.online.contains(user) || self.in_call.contains(user)
    }

    fn fan_out(&self, user: &UserId, now: Instant) -> FanOut {
        let Some(friends) = self.live_friends(user, now) else {
            return FanOut::default();
        };

        let mut online: Vec<UserId> = friends
            .iter()
            .filter(|f| *f != user && self.online.contains(*f))
            .cloned()
            .collect();
        let mut in_call: Vec<UserId> = friends
            .iter()
            .filter(|f| *f != user && self.in_call.contains(*f))
            .cloned()
            .collect();
        online.sort();
        in_call.sort();

        FanOut { online, in_call }
    }

    /// Apply one side of a friendship edge change
    fn edit_friend_set(
        &mut self,
        user: &UserId,
        friend: &UserId,
        add: bool,
        ttl: Duration,
        now: Instant,
    ) {
        let reachable = self.is_reachable(user);
        let expires_at = if reachable { None } else { Some(now + ttl) };

        let cached = self
            .friends
            .get(user)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false);

        if !cached {
            self.friends.remove(user);
            // A reachable user without a set was hydrated with no friends
            if add && reachable {
                let mut set = HashSet::new();
                set.insert(friend.clone());
                self.friends.insert(user.clone(), Entry { value: set, expires_at });
            }
            return;
        }

        if let Some(entry) = self.friends.get_mut(user) {
            if add {
                entry.value.insert(friend.clone());
            } else {
                entry.value.remove(friend);
            }
            entry.expires_at = expires_at;
        }
    }

    fn index_request(&mut self, pair: &CallPair) {
        self.requests_by_caller
            .entry(pair.caller.clone())
            .or_default()
            .insert(pair.clone());
        self.requests_by_callee
            .entry(pair.callee.clone())
            .or_default()
            .insert(pair.clone());
    }

    fn unindex_request(&mut self, pair: &CallPair) {
        if let Some(pairs) = self.requests_by_caller.get_mut(&pair.caller) {
            pairs.remove(pair);
            if pairs.is_empty() {
                self.requests_by_caller.remove(&pair.caller);
            }
        }
        if let Some(pairs) = self.requests_by_callee.get_mut(&pair.callee) {
            pairs.remove(pair);
            if pairs.is_empty() {
                self.requests_by_callee.remove(&pair.callee);
            }
        }
    }

    /// Drop a call record together with its set membership and pointers
    fn delete_call(&mut self, call_id: &CallId) -> Option<ActiveCall> {
        let entry = self.calls.remove(call_id)?;
        self.active_calls.remove(call_id);
        for user in [&entry.value.caller_id, &entry.value.callee_id] {
            if self.current_call.get(user).map(|p| &p.value) == Some(call_id) {
                self.current_call.remove(user);
            }
        }
        Some(entry.value)
    }

    fn set_pointer_expiry(&mut self, user: &UserId, call_id: &CallId, expires_at: Option<Instant>) {
        if let Some(pointer) = self.current_call.get_mut(user) {
            if &pointer.value == call_id {
                pointer.expires_at = expires_at;
            }
        }
    }
}

/// In-memory [`SignalStore`](super::SignalStore) with TTL support
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for MemoryStore {
    async fn has_friend_set(&self, user: &UserId) -> StoreResult<bool> {
        let state = self.state.read().await;
        Ok(state.live_friends(user, Instant::now()).is_some())
    }

    async fn hydrate_friends(
        &self,
        user: &UserId,
        friends: &[UserId],
        ttl: Duration,
    ) -> StoreResult<()> {
        let now = Instant::now();
        let mut state = self.state.write().await;

        let set: HashSet<UserId> = friends.iter().filter(|f| *f != user).cloned().collect();
        state.friends.insert(user.clone(), Entry::expiring(set, ttl, now));
        Ok(())
    }

    async fn friend_ids(&self, user: &UserId) -> StoreResult<Vec<UserId>> {
        let state = self.state.read().await;
        let mut friends: Vec<UserId> = state
            .live_friends(user, Instant::now())
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        friends.sort();
        Ok(friends)
    }

    async fn transition(
        &self,
        user: &UserId,
        transition: PresenceTransition,
    ) -> StoreResult<TransitionOutcome> {
        let now = Instant::now();
        let mut state = self.state.write().await;

        // Snapshot first, then mutate, under the same write guard
        let fan_out = state.fan_out(user, now);

        let applied = match transition {
            PresenceTransition::Online => {
                if let Some(entry) = state.friends.get_mut(user) {
                    if !entry.is_expired(now) {
                        entry.expires_at = None;
                    }
                }
                if state.in_call.contains(user) {
                    false
                } else {
                    state.online.insert(user.clone());
                    true
                }
            }
            PresenceTransition::Offline { friend_ttl } => {
                let was_online = state.online.remove(user);
                let was_in_call = state.in_call.remove(user);
                if let Some(entry) = state.friends.get_mut(user) {
                    if !entry.is_expired(now) {
                        entry.expires_at = Some(now + friend_ttl);
                    }
                }
                was_online || was_in_call
            }
            PresenceTransition::InCall => {
                if state.online.remove(user) {
                    state.in_call.insert(user.clone());
                    true
                } else {
                    false
                }
            }
            PresenceTransition::OutOfCall => {
                if state.in_call.remove(user) {
                    state.online.insert(user.clone());
                    true
                } else {
                    false
                }
            }
        };

        Ok(TransitionOutcome { applied, fan_out })
    }

    async fn is_online(&self, user: &UserId) -> StoreResult<bool> {
        Ok(self.state.read().await.online.contains(user))
    }

    async fn is_in_call(&self, user: &UserId) -> StoreResult<bool> {
        Ok(self.state.read().await.in_call.contains(user))
    }

    async fn friends_by_presence(&self, user: &UserId) -> StoreResult<FanOut> {
        let state = self.state.read().await;
        Ok(state.fan_out(user, Instant::now()))
    }

    async fn link_friends(&self, a: &UserId, b: &UserId, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        state.edit_friend_set(a, b, true, ttl, now);
        state.edit_friend_set(b, a, true, ttl, now);
        Ok(())
    }

    async fn unlink_friends(&self, a: &UserId, b: &UserId, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        let mut state = self.state.write().await;
        state.edit_friend_set(a, b, false, ttl, now);
        state.edit_friend_set(b, a, false, ttl, now);
        Ok(())
    }
}

#[async_trait]
impl CallRequestStore for MemoryStore {
    async fn put_request(&self, request: CallRequest, ttl: Duration) -> StoreResult<()> {
        let now = Instant::now();
        let pair = request.pair();
        let mut state = self.state.write().await;

        state.index_request(&pair);
        state.requests.insert(pair, Entry::expiring(request, ttl, now));
        Ok(())
    }

    async fn get_request(&self, pair: &CallPair) -> StoreResult<Option<CallRequest>> {
        let state = self.state.read().await;
        Ok(state
            .requests
            .get(pair)
            .and_then(|entry| entry.live(Instant::now()))
            .cloned())
    }

    async fn take_request(&self, pair: &CallPair) -> StoreResult<Option<CallRequest>> {
        let now = Instant::now();
        let mut state = self.state.write().await;

        let live = state
            .requests
            .get(pair)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false);
        if !live {
            return Ok(None);
        }

        let taken = state.requests.remove(pair).map(|entry| entry.value);
        state.unindex_request(pair);
        Ok(taken)
    }

    async fn indexed_pairs(&self, user: &UserId, role: CallRole) -> StoreResult<Vec<CallPair>> {
        let state = self.state.read().await;
        let index = match role {
            CallRole::Caller => &state.requests_by_caller,
            CallRole::Callee => &state.requests_by_callee,
        };
        let mut pairs: Vec<CallPair> = index
            .get(user)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        pairs.sort();
        Ok(pairs)
    }

    async fn resolve_indexed(&self, pair: &CallPair) -> StoreResult<Option<CallRequest>> {
        let now = Instant::now();
        let mut state = self.state.write().await;

        if let Some(live) = state.requests.get(pair).and_then(|entry| entry.live(now)) {
            return Ok(Some(live.clone()));
        }
        state.unindex_request(pair);
        Ok(None)
    }

    async fn drain_expired_requests(&self) -> StoreResult<Vec<CallRequest>> {
        let now = Instant::now();
        let mut state = self.state.write().await;

        let expired: Vec<CallPair> = state
            .requests
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(pair, _)| pair.clone())
            .collect();

        let mut drained = Vec::with_capacity(expired.len());
        for pair in expired {
            if let Some(entry) = state.requests.remove(&pair) {
                drained.push(entry.value);
            }
            state.unindex_request(&pair);
        }
        Ok(drained)
    }
}

#[async_trait]
impl ActiveCallStore for MemoryStore {
    async fn insert_call(&self, call: ActiveCall) -> StoreResult<()> {
        let mut state = self.state.write().await;

        let call_id = call.call_id.clone();
        state
            .current_call
            .insert(call.caller_id.clone(), Entry::persistent(call_id.clone()));
        state
            .current_call
            .insert(call.callee_id.clone(), Entry::persistent(call_id.clone()));
        state.active_calls.insert(call_id.clone());
        state.calls.insert(call_id, Entry::persistent(call));
        Ok(())
    }

    async fn get_call(&self, call_id: &CallId) -> StoreResult<Option<ActiveCall>> {
        let state = self.state.read().await;
        Ok(state
            .calls
            .get(call_id)
            .and_then(|entry| entry.live(Instant::now()))
            .cloned())
    }

    async fn mark_connected(
        &self,
        call_id: &CallId,
        at_millis: u64,
    ) -> StoreResult<Option<ActiveCall>> {
        let now = Instant::now();
        let mut state = self.state.write().await;

        let Some(entry) = state.calls.get_mut(call_id) else {
            return Ok(None);
        };
        if entry.is_expired(now) {
            return Ok(None);
        }

        if entry.value.connected_at.is_none() {
            entry.value.status = CallStatus::Connected;
            entry.value.connected_at = Some(at_millis);
        }
        Ok(Some(entry.value.clone()))
    }

    async fn current_call_id(&self, user: &UserId) -> StoreResult<Option<CallId>> {
        let state = self.state.read().await;
        Ok(state
            .current_call
            .get(user)
            .and_then(|entry| entry.live(Instant::now()))
            .cloned())
    }

    async fn clear_current_call(&self, user: &UserId, call_id: &CallId) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if state.current_call.get(user).map(|p| &p.value) == Some(call_id) {
            state.current_call.remove(user);
        }
        Ok(())
    }

    async fn remove_call(&self, call_id: &CallId) -> StoreResult<Option<ActiveCall>> {
        let now = Instant::now();
        let mut state = self.state.write().await;

        let live = state
            .calls
            .get(call_id)
            .map(|entry| !entry.is_expired(now))
            .unwrap_or(false);
        if !live {
            return Ok(None);
        }
        Ok(state.delete_call(call_id))
    }

    async fn set_call_expiry(&self, call_id: &CallId, ttl: Duration) -> StoreResult<bool> {
        let now = Instant::now();
        let deadline = Some(now + ttl);
        let mut state = self.state.write().await;

        let Some(entry) = state.calls.get_mut(call_id) else {
            return Ok(false);
        };
        if entry.is_expired(now) {
            return Ok(false);
        }
        entry.expires_at = deadline;
        let (caller, callee) = (entry.value.caller_id.clone(), entry.value.callee_id.clone());

        state.set_pointer_expiry(&caller, call_id, deadline);
        state.set_pointer_expiry(&callee, call_id, deadline);
        Ok(true)
    }

    async fn clear_call_expiry(&self, call_id: &CallId) -> StoreResult<bool> {
        let now = Instant::now();
        let mut state = self.state.write().await;

        let Some(entry) = state.calls.get_mut(call_id) else {
            return Ok(false);
        };
        if entry.is_expired(now) {
            return Ok(false);
        }
        entry.expires_at = None;
        let (caller, callee) = (entry.value.caller_id.clone(), entry.value.callee_id.clone());

        state.set_pointer_expiry(&caller, call_id, None);
        state.set_pointer_expiry(&callee, call_id, None);
        Ok(true)
    }

    async fn active_call_ids(&self) -> StoreResult<Vec<CallId>> {
        let now = Instant::now();
        let state = self.state.read().await;
        let mut ids: Vec<CallId> = state
            .active_calls
            .iter()
            .filter(|id| {
                state
                    .calls
                    .get(*id)
                    .map(|entry| !entry.is_expired(now))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn drain_expired_calls(&self) -> StoreResult<Vec<ActiveCall>> {
        let now = Instant::now();
        let mut state = self.state.write().await;

        let expired: Vec<CallId> = state
            .calls
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();

        Ok(expired
            .iter()
            .filter_map(|call_id| state.delete_call(call_id))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    fn request(caller: &str, callee: &str) -> CallRequest {
        CallRequest::new(user(caller), user(callee), json!({"sdp": caller}), 1_000)
    }

    fn call(id: &str, caller: &str, callee: &str) -> ActiveCall {
        ActiveCall::new(
            CallId::from(id),
            user(caller),
            user(callee),
            json!({"type": "offer"}),
            json!({"type": "answer"}),
            1_000,
        )
    }

    const DAY: Duration = Duration::from_secs(86_400);

    #[tokio::test]
    async fn test_transitions_keep_sets_disjoint() {
        let store = MemoryStore::new();
        let alice = user("alice");

        store.transition(&alice, PresenceTransition::Online).await.unwrap();
        assert!(store.is_online(&alice).await.unwrap());

        store.transition(&alice, PresenceTransition::InCall).await.unwrap();
        assert!(!store.is_online(&alice).await.unwrap());
        assert!(store.is_in_call(&alice).await.unwrap());

        // Reconnecting while in a call keeps the user in the call set
        let outcome = store.transition(&alice, PresenceTransition::Online).await.unwrap();
        assert!(!outcome.applied);
        assert!(!store.is_online(&alice).await.unwrap());

        store.transition(&alice, PresenceTransition::OutOfCall).await.unwrap();
        assert!(store.is_online(&alice).await.unwrap());
        assert!(!store.is_in_call(&alice).await.unwrap());
    }

    #[tokio::test]
    async fn test_offline_user_is_not_moved_by_call_transitions() {
        let store = MemoryStore::new();
        let bob = user("bob");

        let outcome = store.transition(&bob, PresenceTransition::InCall).await.unwrap();
        assert!(!outcome.applied);
        let outcome = store.transition(&bob, PresenceTransition::OutOfCall).await.unwrap();
        assert!(!outcome.applied);

        assert!(!store.is_online(&bob).await.unwrap());
        assert!(!store.is_in_call(&bob).await.unwrap());
    }

    #[tokio::test]
    async fn test_fan_out_is_captured_before_mutation() {
        let store = MemoryStore::new();
        let (alice, bob, carol) = (user("alice"), user("bob"), user("carol"));

        store.hydrate_friends(&alice, &[bob.clone(), carol.clone()], DAY).await.unwrap();
        store.transition(&bob, PresenceTransition::Online).await.unwrap();
        store.transition(&carol, PresenceTransition::Online).await.unwrap();
        store.transition(&carol, PresenceTransition::InCall).await.unwrap();
        store.transition(&alice, PresenceTransition::Online).await.unwrap();

        let outcome = store
            .transition(&alice, PresenceTransition::Offline { friend_ttl: DAY })
            .await
            .unwrap();

        assert!(outcome.applied);
        assert_eq!(outcome.fan_out.online, vec![bob]);
        assert_eq!(outcome.fan_out.in_call, vec![carol]);
        assert!(!store.is_online(&alice).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_friend_set_ttl_only_while_offline() {
        let store = MemoryStore::new();
        let (alice, bob) = (user("alice"), user("bob"));

        store.hydrate_friends(&alice, &[bob.clone()], DAY).await.unwrap();
        store.transition(&alice, PresenceTransition::Online).await.unwrap();

        tokio::time::advance(DAY * 2).await;
        assert!(store.has_friend_set(&alice).await.unwrap());

        store
            .transition(&alice, PresenceTransition::Offline { friend_ttl: DAY })
            .await
            .unwrap();
        tokio::time::advance(DAY + Duration::from_secs(1)).await;
        assert!(!store.has_friend_set(&alice).await.unwrap());
        assert!(store.friend_ids(&alice).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_link_updates_cached_sets_only() {
        let store = MemoryStore::new();
        let (alice, bob, dave) = (user("alice"), user("bob"), user("dave"));

        store.hydrate_friends(&alice, &[dave.clone()], DAY).await.unwrap();
        store.link_friends(&alice, &bob, DAY).await.unwrap();

        assert_eq!(store.friend_ids(&alice).await.unwrap(), vec![bob.clone(), dave]);
        // Bob is offline and has nothing cached: his set is hydrated later
        assert!(!store.has_friend_set(&bob).await.unwrap());

        store.unlink_friends(&alice, &bob, DAY).await.unwrap();
        assert!(!store.friend_ids(&alice).await.unwrap().contains(&bob));
    }

    #[tokio::test]
    async fn test_link_creates_set_for_reachable_user_without_cache() {
        let store = MemoryStore::new();
        let (alice, bob) = (user("alice"), user("bob"));

        store.transition(&alice, PresenceTransition::Online).await.unwrap();
        store.link_friends(&alice, &bob, DAY).await.unwrap();

        assert_eq!(store.friend_ids(&alice).await.unwrap(), vec![bob]);
    }

    #[tokio::test]
    async fn test_take_request_is_single_winner() {
        let store = MemoryStore::new();
        let req = request("alice", "bob");
        let pair = req.pair();
        store.put_request(req, Duration::from_secs(60)).await.unwrap();

        assert!(store.take_request(&pair).await.unwrap().is_some());
        assert!(store.take_request(&pair).await.unwrap().is_none());
        assert!(store.indexed_pairs(&pair.caller, CallRole::Caller).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_put_request_overwrites_pair() {
        let store = MemoryStore::new();
        let first = request("alice", "bob");
        let mut second = request("alice", "bob");
        second.offer = json!({"sdp": "second"});
        let pair = first.pair();

        store.put_request(first, Duration::from_secs(60)).await.unwrap();
        store.put_request(second, Duration::from_secs(60)).await.unwrap();

        let stored = store.get_request(&pair).await.unwrap().unwrap();
        assert_eq!(stored.offer, json!({"sdp": "second"}));
        assert_eq!(store.indexed_pairs(&pair.callee, CallRole::Callee).await.unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_request_is_hidden_until_drained() {
        let store = MemoryStore::new();
        let req = request("alice", "bob");
        let pair = req.pair();
        store.put_request(req, Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(store.get_request(&pair).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(store.get_request(&pair).await.unwrap().is_none());
        assert!(store.take_request(&pair).await.unwrap().is_none());
        // Index entry is stale until the request is drained
        assert_eq!(store.indexed_pairs(&pair.caller, CallRole::Caller).await.unwrap().len(), 1);

        let drained = store.drain_expired_requests().await.unwrap();
        assert_eq!(drained.len(), 1);
        assert!(store.indexed_pairs(&pair.caller, CallRole::Caller).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolve_indexed_keeps_live_entry() {
        let store = MemoryStore::new();
        let pair = request("alice", "bob").pair();
        store.put_request(request("alice", "bob"), Duration::from_secs(60)).await.unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        // Re-initiated after the first one lapsed
        store.put_request(request("alice", "bob"), Duration::from_secs(60)).await.unwrap();

        assert!(store.resolve_indexed(&pair).await.unwrap().is_some());
        assert_eq!(store.indexed_pairs(&pair.callee, CallRole::Callee).await.unwrap(), vec![pair.clone()]);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.resolve_indexed(&pair).await.unwrap().is_none());
        assert!(store.indexed_pairs(&pair.callee, CallRole::Callee).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_call_insert_and_remove_are_atomic() {
        let store = MemoryStore::new();
        let id = CallId::from("c1");
        store.insert_call(call("c1", "alice", "bob")).await.unwrap();

        assert_eq!(store.current_call_id(&user("alice")).await.unwrap(), Some(id.clone()));
        assert_eq!(store.current_call_id(&user("bob")).await.unwrap(), Some(id.clone()));
        assert_eq!(store.active_call_ids().await.unwrap(), vec![id.clone()]);

        assert!(store.remove_call(&id).await.unwrap().is_some());
        assert!(store.remove_call(&id).await.unwrap().is_none());
        assert!(store.current_call_id(&user("alice")).await.unwrap().is_none());
        assert!(store.current_call_id(&user("bob")).await.unwrap().is_none());
        assert!(store.active_call_ids().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mark_connected_stamps_once() {
        let store = MemoryStore::new();
        let id = CallId::from("c1");
        store.insert_call(call("c1", "alice", "bob")).await.unwrap();

        let first = store.mark_connected(&id, 5_000).await.unwrap().unwrap();
        let second = store.mark_connected(&id, 9_000).await.unwrap().unwrap();

        assert_eq!(first.connected_at, Some(5_000));
        assert_eq!(second.connected_at, Some(5_000));
        assert_eq!(second.status, CallStatus::Connected);
        assert!(store.mark_connected(&CallId::from("nope"), 1).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_expiry_and_clear() {
        let store = MemoryStore::new();
        let id = CallId::from("c1");
        store.insert_call(call("c1", "alice", "bob")).await.unwrap();

        assert!(store.set_call_expiry(&id, Duration::from_secs(60)).await.unwrap());
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(store.clear_call_expiry(&id).await.unwrap());
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(store.get_call(&id).await.unwrap().is_some());
        assert!(store.drain_expired_calls().await.unwrap().is_empty());

        store.set_call_expiry(&id, Duration::from_secs(60)).await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(store.get_call(&id).await.unwrap().is_none());
        assert!(store.current_call_id(&user("alice")).await.unwrap().is_none());

        let drained = store.drain_expired_calls().await.unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].call_id, id);
        assert!(store.active_call_ids().await.unwrap().is_empty());
    }
}
