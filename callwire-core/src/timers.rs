//! Keyed one-shot timers
//!
//! Each key holds at most one armed timer. Arming a key again replaces the
//! previous timer; disarming aborts it. A timer that fires removes its own
//! slot before running its action, so a later disarm never aborts an action
//! halfway through.

use crate::types::{CallId, CallPair, UserId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

/// What a timer guards
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TimerKey {
    /// Unanswered request for the pair
    Request(CallPair),
    /// Disconnect grace for one participant of a call
    Grace(CallId, UserId),
    /// Post-disconnect cleanup of a user's outgoing requests
    Cleanup(UserId),
}

impl fmt::Display for TimerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerKey::Request(pair) => write!(f, "request:{}", pair),
            TimerKey::Grace(call_id, user) => write!(f, "grace:{}:{}", call_id, user),
            TimerKey::Cleanup(user) => write!(f, "cleanup:{}", user),
        }
    }
}

struct Slot {
    generation: u64,
    handle: JoinHandle<()>,
}

type Slots = Arc<Mutex<HashMap<TimerKey, Slot>>>;

fn lock(slots: &Slots) -> MutexGuard<'_, HashMap<TimerKey, Slot>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Registry of armed timers
#[derive(Default)]
pub struct TimerRegistry {
    slots: Slots,
    generation: AtomicU64,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `action` after `delay` unless disarmed or re-armed first
    pub fn arm<F>(&self, key: TimerKey, delay: Duration, action: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let slots = self.slots.clone();
        let fired_key = key.clone();

        // Hold the lock across spawn so the task cannot look for its slot
        // before it is inserted
        let mut guard = lock(&self.slots);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut slots = lock(&slots);
                match slots.get(&fired_key) {
                    Some(slot) if slot.generation == generation => {
                        slots.remove(&fired_key);
                    }
                    _ => return,
                }
            }
            trace!(timer = %fired_key, "Timer fired");
            action.await;
        });

        if let Some(previous) = guard.insert(key.clone(), Slot { generation, handle }) {
            previous.handle.abort();
            trace!(timer = %key, "Timer re-armed");
        } else {
            trace!(timer = %key, delay = ?delay, "Timer armed");
        }
    }

    /// Cancel the timer for `key`. Returns whether one was armed.
    pub fn disarm(&self, key: &TimerKey) -> bool {
        match lock(&self.slots).remove(key) {
            Some(slot) => {
                slot.handle.abort();
                trace!(timer = %key, "Timer disarmed");
                true
            }
            None => false,
        }
    }

    pub fn is_armed(&self, key: &TimerKey) -> bool {
        lock(&self.slots).contains_key(key)
    }

    pub fn armed_count(&self) -> usize {
        lock(&self.slots).len()
    }

    /// Abort every armed timer
    pub fn disarm_all(&self) {
        for (_, slot) in lock(&self.slots).drain() {
            slot.handle.abort();
        }
    }
}

impl fmt::Debug for TimerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerRegistry").field("armed", &self.armed_count()).finish()
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.disarm_all();
    }
}
