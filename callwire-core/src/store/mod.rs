//! Signaling store interfaces
//!
//! The signaling store is the single source of truth for presence, pending
//! requests and active calls. Every trait method is one atomic operation on
//! the store: where several keys must change together (a call record, its
//! set membership and both reverse pointers) they change inside the same
//! method call, and presence transitions compute their fan-out snapshot and
//! mutate the presence sets in the same critical section.
//!
//! ```text
//! ┌───────────────┐  ┌──────────────────┐  ┌─────────────────┐
//! │ PresenceStore │  │ CallRequestStore │  │ ActiveCallStore │
//! └───────┬───────┘  └────────┬─────────┘  └────────┬────────┘
//!         └──────────── SignalStore (one instance) ──┘
//! ```

mod memory;

pub use memory::MemoryStore;

use crate::calls::ActiveCall;
use crate::error::StoreResult;
use crate::requests::CallRequest;
use crate::types::{CallId, CallPair, CallRole, UserId};
use async_trait::async_trait;
use std::time::Duration;

/// Presence change applied atomically by [`PresenceStore::transition`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    /// Join the online set and drop the friend-set TTL.
    /// A user already in a call stays in the in-call set.
    Online,
    /// Leave both sets and put the friend set back on a TTL
    Offline { friend_ttl: Duration },
    /// Move online -> in_call. No-op for offline users.
    InCall,
    /// Move in_call -> online. No-op for users not in a call.
    OutOfCall,
}

/// Friends of a user grouped by presence, captured before a transition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanOut {
    pub online: Vec<UserId>,
    pub in_call: Vec<UserId>,
}

impl FanOut {
    pub fn is_empty(&self) -> bool {
        self.online.is_empty() && self.in_call.is_empty()
    }

    pub fn recipients(&self) -> impl Iterator<Item = &UserId> {
        self.online.iter().chain(self.in_call.iter())
    }
}

/// Result of a presence transition
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransitionOutcome {
    /// Whether the presence sets actually changed
    pub applied: bool,
    /// Friends to notify, computed before the sets changed
    pub fan_out: FanOut,
}

/// Online/in-call membership plus cached friend sets
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// Whether a live (non-expired) friend set is cached for `user`
    async fn has_friend_set(&self, user: &UserId) -> StoreResult<bool>;

    /// Cache `friends` for `user` with the given TTL
    async fn hydrate_friends(
        &self,
        user: &UserId,
        friends: &[UserId],
        ttl: Duration,
    ) -> StoreResult<()>;

    /// Cached friends of `user`, sorted; empty when nothing is cached
    async fn friend_ids(&self, user: &UserId) -> StoreResult<Vec<UserId>>;

    async fn transition(
        &self,
        user: &UserId,
        transition: PresenceTransition,
    ) -> StoreResult<TransitionOutcome>;

    async fn is_online(&self, user: &UserId) -> StoreResult<bool>;

    async fn is_in_call(&self, user: &UserId) -> StoreResult<bool>;

    /// Cached friends of `user` that are currently online / in a call
    async fn friends_by_presence(&self, user: &UserId) -> StoreResult<FanOut>;

    /// Add the friendship edge on both sides.
    ///
    /// Only friend sets that are already cached are updated (a missing set is
    /// hydrated in full from the durable directory later), except that a
    /// reachable user with no cached set gets one holding the new friend.
    async fn link_friends(&self, a: &UserId, b: &UserId, ttl: Duration) -> StoreResult<()>;

    /// Remove the friendship edge on both sides
    async fn unlink_friends(&self, a: &UserId, b: &UserId, ttl: Duration) -> StoreResult<()>;
}

/// Pending invitations keyed by ordered pair, with a per-user secondary index
#[async_trait]
pub trait CallRequestStore: Send + Sync {
    /// Write `request` with a TTL, replacing any request for the same pair
    async fn put_request(&self, request: CallRequest, ttl: Duration) -> StoreResult<()>;

    /// Live request for `pair`
    async fn get_request(&self, pair: &CallPair) -> StoreResult<Option<CallRequest>>;

    /// Remove and return the live request for `pair`.
    ///
    /// Of two concurrent takers exactly one receives the request.
    async fn take_request(&self, pair: &CallPair) -> StoreResult<Option<CallRequest>>;

    /// Indexed pairs where `user` plays `role`. Entries may be stale.
    async fn indexed_pairs(&self, user: &UserId, role: CallRole) -> StoreResult<Vec<CallPair>>;

    /// Live request behind an index entry. If there is none the entry is
    /// dropped in the same step, so a request re-created concurrently keeps
    /// its entry.
    async fn resolve_indexed(&self, pair: &CallPair) -> StoreResult<Option<CallRequest>>;

    /// Remove every request whose TTL has elapsed and return them
    async fn drain_expired_requests(&self) -> StoreResult<Vec<CallRequest>>;
}

/// Committed calls, the global active set and per-user reverse pointers
#[async_trait]
pub trait ActiveCallStore: Send + Sync {
    /// Write the record, add it to the active set and point both
    /// participants at it
    async fn insert_call(&self, call: ActiveCall) -> StoreResult<()>;

    async fn get_call(&self, call_id: &CallId) -> StoreResult<Option<ActiveCall>>;

    /// Set `connected` and stamp `connected_at` unless already connected.
    /// Returns the record as stored afterwards.
    async fn mark_connected(&self, call_id: &CallId, at_millis: u64)
        -> StoreResult<Option<ActiveCall>>;

    /// Target of the user's reverse pointer
    async fn current_call_id(&self, user: &UserId) -> StoreResult<Option<CallId>>;

    /// Delete the user's pointer if it still targets `call_id`
    async fn clear_current_call(&self, user: &UserId, call_id: &CallId) -> StoreResult<()>;

    /// Delete the record, its active-set membership and both pointers.
    ///
    /// Of two concurrent removers exactly one receives the record.
    async fn remove_call(&self, call_id: &CallId) -> StoreResult<Option<ActiveCall>>;

    /// Put a TTL on the record and both pointers. Returns false if the call
    /// does not exist.
    async fn set_call_expiry(&self, call_id: &CallId, ttl: Duration) -> StoreResult<bool>;

    /// Clear the TTL on the record and both pointers
    async fn clear_call_expiry(&self, call_id: &CallId) -> StoreResult<bool>;

    /// Members of the global active-call set
    async fn active_call_ids(&self) -> StoreResult<Vec<CallId>>;

    /// Remove every call whose TTL has elapsed, with its pointers and set
    /// membership, and return them
    async fn drain_expired_calls(&self) -> StoreResult<Vec<ActiveCall>>;
}

/// The complete signaling store
pub trait SignalStore: PresenceStore + CallRequestStore + ActiveCallStore {}

impl<T> SignalStore for T where T: PresenceStore + CallRequestStore + ActiveCallStore {}
