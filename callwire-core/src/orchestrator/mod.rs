/*
    CallOrchestrator - one handler per signaling event

    Composes presence, pending requests and active calls into the call
    lifecycle. Each handler checks its preconditions, drives the managers
    (every store step is atomic on its own) and emits the resulting events
    to the users involved.

    Handlers:
    - call_events.rs: events a client sends (initiate, response, ringing,
      cancel, end, connected, ice:candidate)
    - lifecycle.rs: connection open/close and the timers and sweeps that
      finish what a vanished user left behind

    Timers hold a weak handle, so an orchestrator that is dropped takes its
    pending timers down with it.

    Connect, disconnect and call setup take a per-user session lock: a
    call is either committed before its caller's disconnect runs (and gets
    a grace timer) or the setup sees the caller gone.
*/

mod call_events;
mod lifecycle;

pub use lifecycle::SweepReport;

use crate::calls::ActiveCallManager;
use crate::clock::Clock;
use crate::config::SignalingConfig;
use crate::durable::{CallHistoryStore, ContactDirectory};
use crate::events::ServerEvent;
use crate::presence::PresenceManager;
use crate::requests::CallRequestManager;
use crate::store::SignalStore;
use crate::timers::{TimerKey, TimerRegistry};
use crate::transport::SignalSink;
use crate::types::UserId;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::OwnedMutexGuard;

/// Lifecycle timing used by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalingSettings {
    pub request_ttl: Duration,
    pub disconnect_grace: Duration,
    pub cleanup_grace: Duration,
    pub friend_cache_ttl: Duration,
}

impl Default for SignalingSettings {
    fn default() -> Self {
        SignalingSettings::from(&SignalingConfig::default())
    }
}

impl From<&SignalingConfig> for SignalingSettings {
    fn from(config: &SignalingConfig) -> Self {
        SignalingSettings {
            request_ttl: config.request_ttl,
            disconnect_grace: config.disconnect_grace,
            cleanup_grace: config.cleanup_grace,
            friend_cache_ttl: config.friend_cache_ttl,
        }
    }
}

/// External collaborators of the orchestrator
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn ContactDirectory>,
    pub history: Arc<dyn CallHistoryStore>,
    pub sink: Arc<dyn SignalSink>,
    pub clock: Arc<dyn Clock>,
}

struct Inner<S> {
    presence: PresenceManager<S>,
    requests: CallRequestManager<S>,
    calls: ActiveCallManager<S>,
    sink: Arc<dyn SignalSink>,
    timers: TimerRegistry,
    sessions: SessionLocks,
    settings: SignalingSettings,
}

/// One async lock per user with a session transition in flight
#[derive(Default)]
struct SessionLocks {
    locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SessionLocks {
    async fn acquire(&self, user: &UserId) -> SessionGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(user.clone()).or_default().clone()
        };
        SessionGuard { guard: Some(lock.lock_owned().await), user: user.clone(), locks: self }
    }
}

struct SessionGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    user: UserId,
    locks: &'a SessionLocks,
}

impl Drop for SessionGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut locks = self.locks.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Only the map holds it: nobody is waiting
        if locks.get(&self.user).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&self.user);
        }
    }
}

/// Shared signaling service; cheap to clone
pub struct CallOrchestrator<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for CallOrchestrator<S> {
    fn clone(&self) -> Self {
        CallOrchestrator { inner: self.inner.clone() }
    }
}

impl<S: SignalStore + 'static> CallOrchestrator<S> {
    pub fn new(store: Arc<S>, deps: Collaborators, settings: SignalingSettings) -> Self {
        let presence = PresenceManager::new(
            store.clone(),
            deps.directory,
            deps.sink.clone(),
            settings.friend_cache_ttl,
        );
        let requests =
            CallRequestManager::new(store.clone(), deps.clock.clone(), settings.request_ttl);
        let calls =
            ActiveCallManager::new(store, deps.history, deps.clock, settings.disconnect_grace);

        CallOrchestrator {
            inner: Arc::new(Inner {
                presence,
                requests,
                calls,
                sink: deps.sink,
                timers: TimerRegistry::new(),
                sessions: SessionLocks::default(),
                settings,
            }),
        }
    }

    pub fn presence(&self) -> &PresenceManager<S> {
        &self.inner.presence
    }

    pub fn requests(&self) -> &CallRequestManager<S> {
        &self.inner.requests
    }

    pub fn calls(&self) -> &ActiveCallManager<S> {
        &self.inner.calls
    }

    pub fn timers(&self) -> &TimerRegistry {
        &self.inner.timers
    }

    pub fn settings(&self) -> SignalingSettings {
        self.inner.settings
    }

    /// Cancel every pending timer
    pub fn shutdown(&self) {
        self.inner.timers.disarm_all();
    }

    async fn lock_session(&self, user: &UserId) -> SessionGuard<'_> {
        self.inner.sessions.acquire(user).await
    }

    fn emit(&self, user: &UserId, event: ServerEvent) {
        self.inner.sink.emit(user, event);
    }

    /// Arm a timer whose action runs against this orchestrator, if it is
    /// still alive when the timer fires
    fn arm<F, Fut>(&self, key: TimerKey, delay: Duration, action: F)
    where
        F: FnOnce(CallOrchestrator<S>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let weak: Weak<Inner<S>> = Arc::downgrade(&self.inner);
        self.inner.timers.arm(key, delay, async move {
            if let Some(inner) = weak.upgrade() {
                action(CallOrchestrator { inner }).await;
            }
        });
    }
}
