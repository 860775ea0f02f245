//! Recording doubles for the sink and clock seams

use crate::clock::Clock;
use crate::events::ServerEvent;
use crate::transport::SignalSink;
use crate::types::UserId;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Sink that keeps every emitted event in order
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(UserId, ServerEvent)>>,
    connected: Mutex<HashSet<UserId>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn events(&self) -> MutexGuard<'_, Vec<(UserId, ServerEvent)>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn clear(&self) {
        self.events().clear();
    }

    /// Record whether `user` currently holds a connection
    pub fn set_connected(&self, user: &UserId, connected: bool) {
        let mut users = self.connected.lock().unwrap_or_else(PoisonError::into_inner);
        if connected {
            users.insert(user.clone());
        } else {
            users.remove(user);
        }
    }

    /// Everything delivered so far, in emission order
    pub fn all(&self) -> Vec<(UserId, ServerEvent)> {
        self.events().clone()
    }

    pub fn events_for(&self, user: &UserId) -> Vec<ServerEvent> {
        self.events()
            .iter()
            .filter(|(to, _)| to == user)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Wire names of the events delivered to `user`
    pub fn names_for(&self, user: &UserId) -> Vec<&'static str> {
        self.events().iter().filter(|(to, _)| to == user).map(|(_, event)| event.name()).collect()
    }

    /// Last event delivered to `user`
    pub fn last_for(&self, user: &UserId) -> Option<ServerEvent> {
        self.events().iter().rev().find(|(to, _)| to == user).map(|(_, event)| event.clone())
    }
}

impl SignalSink for RecordingSink {
    fn emit(&self, user: &UserId, event: ServerEvent) {
        self.events().push((user.clone(), event));
    }

    fn has_connection(&self, user: &UserId) -> bool {
        self.connected.lock().unwrap_or_else(PoisonError::into_inner).contains(user)
    }
}

/// Wall clock that only moves when told to
#[derive(Debug)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start_millis: u64) -> Self {
        ManualClock { now: AtomicU64::new(start_millis) }
    }

    pub fn advance_millis(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// Wall clock driven by the tokio clock, so a paused runtime moves both
#[derive(Debug)]
pub struct TokioClock {
    origin: tokio::time::Instant,
    base_millis: u64,
}

impl TokioClock {
    pub fn new(base_millis: u64) -> Self {
        TokioClock { origin: tokio::time::Instant::now(), base_millis }
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> u64 {
        self.base_millis + self.origin.elapsed().as_millis() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_sink_filters_by_user() {
        let sink = RecordingSink::new();
        let alice = UserId::new("alice");
        let bob = UserId::new("bob");

        sink.emit(&alice, ServerEvent::error("one"));
        sink.emit(&bob, ServerEvent::error("two"));
        sink.emit(&alice, ServerEvent::NoAnswer { callee_id: bob.clone() });

        assert_eq!(sink.names_for(&alice), vec!["call:error", "call:no-answer"]);
        assert_eq!(sink.events_for(&bob), vec![ServerEvent::error("two")]);
        assert_eq!(sink.last_for(&alice), Some(ServerEvent::NoAnswer { callee_id: bob }));

        sink.clear();
        assert!(sink.all().is_empty());
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(1_000);
        clock.advance_millis(500);
        assert_eq!(clock.now_millis(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_millis(), 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_clock_follows_paused_time() {
        let clock = TokioClock::new(5_000);
        tokio::time::advance(std::time::Duration::from_secs(2)).await;
        assert_eq!(clock.now_millis(), 7_000);
    }
}
