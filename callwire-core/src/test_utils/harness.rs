//! Orchestrator harness over in-memory stores
//!
//! ```ignore
//! let h = Harness::builder().contact("alice", "bob").build().await;
//! h.connect(&alice).await?;
//! ```

use super::fixtures::{RecordingSink, TokioClock};
use crate::durable::{ContactDirectory, MemoryDurableStore};
use crate::error::{SignalError, SignalResult};
use crate::events::ClientEvent;
use crate::orchestrator::{CallOrchestrator, Collaborators, SignalingSettings};
use crate::store::MemoryStore;
use crate::types::{CallId, Payload, UserId};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

/// Start of the harness wall clock, 2024-01-01T00:00:00Z
pub const HARNESS_EPOCH_MILLIS: u64 = 1_704_067_200_000;

pub fn offer() -> Payload {
    json!({"type": "offer", "sdp": "v=0 offer"})
}

pub fn answer() -> Payload {
    json!({"type": "answer", "sdp": "v=0 answer"})
}

#[derive(Default)]
pub struct HarnessBuilder {
    contacts: Vec<(UserId, UserId)>,
    settings: SignalingSettings,
}

impl HarnessBuilder {
    pub fn contact(mut self, a: &str, b: &str) -> Self {
        self.contacts.push((UserId::new(a), UserId::new(b)));
        self
    }

    pub fn settings(mut self, settings: SignalingSettings) -> Self {
        self.settings = settings;
        self
    }

    pub async fn build(self) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let durable = Arc::new(MemoryDurableStore::new());
        for (a, b) in &self.contacts {
            // The in-memory directory never fails
            let _ = durable.add_contact(a, b).await;
        }
        let sink = Arc::new(RecordingSink::new());
        let clock = Arc::new(TokioClock::new(HARNESS_EPOCH_MILLIS));

        let deps = Collaborators {
            directory: durable.clone(),
            history: durable.clone(),
            sink: sink.clone(),
            clock: clock.clone(),
        };
        let orchestrator = CallOrchestrator::new(store.clone(), deps, self.settings);

        Harness { orchestrator, store, durable, sink, clock }
    }
}

/// A wired orchestrator plus handles on everything around it
pub struct Harness {
    pub orchestrator: CallOrchestrator<MemoryStore>,
    pub store: Arc<MemoryStore>,
    pub durable: Arc<MemoryDurableStore>,
    pub sink: Arc<RecordingSink>,
    pub clock: Arc<TokioClock>,
}

impl Harness {
    pub fn builder() -> HarnessBuilder {
        HarnessBuilder::default()
    }

    /// Register a connection for `user`, then run the connect lifecycle
    pub async fn connect(&self, user: &UserId) -> SignalResult<()> {
        self.sink.set_connected(user, true);
        self.orchestrator.connect(user).await
    }

    /// Drop the connection of `user`, then run the disconnect lifecycle
    pub async fn disconnect(&self, user: &UserId) -> SignalResult<()> {
        self.sink.set_connected(user, false);
        self.orchestrator.disconnect(user).await
    }

    pub async fn dispatch(&self, user: &UserId, event: ClientEvent) -> SignalResult<()> {
        self.orchestrator.dispatch(user, event).await
    }

    /// Initiate, accept and confirm media. Returns the call id.
    pub async fn establish_call(&self, caller: &UserId, callee: &UserId) -> SignalResult<CallId> {
        self.dispatch(caller, ClientEvent::Initiate { callee_id: callee.clone(), offer: offer() })
            .await?;
        self.dispatch(
            callee,
            ClientEvent::Response {
                caller_id: caller.clone(),
                accepted: true,
                answer: Some(answer()),
                reason: None,
            },
        )
        .await?;
        self.dispatch(caller, ClientEvent::Connected {}).await?;

        let call = self.orchestrator.calls().current_call(caller).await?;
        call.map(|call| call.call_id).ok_or(SignalError::NoActiveCall("Call was not established."))
    }

    /// Let `duration` pass on the paused clock, then let woken timers finish
    pub async fn advance(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
        for _ in 0..16 {
            tokio::task::yield_now().await;
        }
    }
}
