//! Presence tracking and friend notifications
//!
//! A user is offline, online or in a call. The store computes which friends
//! to tell and moves the user in one step; this manager then delivers the
//! matching `friend_*` event to each of them.

use crate::durable::ContactDirectory;
use crate::error::StoreResult;
use crate::events::{PresenceChange, ServerEvent};
use crate::metrics::{record_labeled, PRESENCE_TRANSITIONS};
use crate::store::{FanOut, PresenceStore, PresenceTransition};
use crate::transport::SignalSink;
use crate::types::UserId;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct PresenceManager<S> {
    store: Arc<S>,
    directory: Arc<dyn ContactDirectory>,
    sink: Arc<dyn SignalSink>,
    friend_ttl: Duration,
}

impl<S: PresenceStore> PresenceManager<S> {
    pub fn new(
        store: Arc<S>,
        directory: Arc<dyn ContactDirectory>,
        sink: Arc<dyn SignalSink>,
        friend_ttl: Duration,
    ) -> Self {
        PresenceManager { store, directory, sink, friend_ttl }
    }

    /// Bring `user` online, loading their friend set on first sight
    pub async fn mark_online(&self, user: &UserId) -> StoreResult<bool> {
        if !self.store.has_friend_set(user).await? {
            let friends = self.directory.friend_ids(user).await?;
            if friends.is_empty() {
                debug!(user_id = %user, "No contacts to cache");
            } else {
                self.store.hydrate_friends(user, &friends, self.friend_ttl).await?;
                debug!(user_id = %user, friends = friends.len(), "Friend set hydrated");
            }
        }

        self.apply(user, PresenceTransition::Online, PresenceChange::Online).await
    }

    pub async fn mark_offline(&self, user: &UserId) -> StoreResult<bool> {
        let transition = PresenceTransition::Offline { friend_ttl: self.friend_ttl };
        self.apply(user, transition, PresenceChange::Offline).await
    }

    pub async fn mark_in_call(&self, user: &UserId) -> StoreResult<bool> {
        self.apply(user, PresenceTransition::InCall, PresenceChange::InCall).await
    }

    pub async fn mark_out_of_call(&self, user: &UserId) -> StoreResult<bool> {
        self.apply(user, PresenceTransition::OutOfCall, PresenceChange::OutOfCall).await
    }

    pub async fn is_online(&self, user: &UserId) -> StoreResult<bool> {
        self.store.is_online(user).await
    }

    pub async fn is_in_call(&self, user: &UserId) -> StoreResult<bool> {
        self.store.is_in_call(user).await
    }

    /// Online or in a call
    pub async fn is_reachable(&self, user: &UserId) -> StoreResult<bool> {
        Ok(self.store.is_online(user).await? || self.store.is_in_call(user).await?)
    }

    pub async fn online_friends(&self, user: &UserId) -> StoreResult<Vec<UserId>> {
        Ok(self.store.friends_by_presence(user).await?.online)
    }

    pub async fn in_call_friends(&self, user: &UserId) -> StoreResult<Vec<UserId>> {
        Ok(self.store.friends_by_presence(user).await?.in_call)
    }

    /// Cached friend set
    pub async fn all_friends(&self, user: &UserId) -> StoreResult<Vec<UserId>> {
        self.store.friend_ids(user).await
    }

    pub async fn are_friends(&self, user: &UserId, other: &UserId) -> StoreResult<bool> {
        Ok(self.store.friend_ids(user).await?.contains(other))
    }

    /// Record a new contact durably and in both cached friend sets
    pub async fn add_friend(&self, a: &UserId, b: &UserId) -> StoreResult<bool> {
        let created = self.directory.add_contact(a, b).await?;
        self.store.link_friends(a, b, self.friend_ttl).await?;

        info!(user_a = %a, user_b = %b, created, "Friend relationship added");
        Ok(created)
    }

    pub async fn remove_friend(&self, a: &UserId, b: &UserId) -> StoreResult<bool> {
        let removed = self.directory.remove_contact(a, b).await?;
        self.store.unlink_friends(a, b, self.friend_ttl).await?;

        info!(user_a = %a, user_b = %b, removed, "Friend relationship removed");
        Ok(removed)
    }

    async fn apply(
        &self,
        user: &UserId,
        transition: PresenceTransition,
        change: PresenceChange,
    ) -> StoreResult<bool> {
        let outcome = self.store.transition(user, transition).await?;

        if !outcome.applied {
            debug!(user_id = %user, ?change, "Presence transition not applicable");
            return Ok(false);
        }

        record_labeled(PRESENCE_TRANSITIONS, "change", change_label(change));
        self.notify(user, change, &outcome.fan_out);
        debug!(user_id = %user, ?change, notified = outcome.fan_out.recipients().count(), "Presence changed");
        Ok(true)
    }

    fn notify(&self, user: &UserId, change: PresenceChange, fan_out: &FanOut) {
        for friend in fan_out.recipients() {
            self.sink.emit(friend, ServerEvent::presence(change, user.clone()));
        }
    }
}

fn change_label(change: PresenceChange) -> &'static str {
    match change {
        PresenceChange::Online => "online",
        PresenceChange::Offline => "offline",
        PresenceChange::InCall => "in_call",
        PresenceChange::OutOfCall => "out_of_call",
    }
}
