//! Background sweep of expired requests and calls
//!
//! Timers cover the normal path. The sweep catches whatever they miss (a
//! timer lost to a restart, a TTL that elapsed between a timer firing and
//! its lookup) and finishes it through the same teardown.

use crate::orchestrator::CallOrchestrator;
use crate::shutdown::ShutdownSignal;
use crate::store::SignalStore;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

pub struct ExpirySweeper<S> {
    orchestrator: CallOrchestrator<S>,
    interval: Duration,
}

impl<S: SignalStore + 'static> ExpirySweeper<S> {
    pub fn new(orchestrator: CallOrchestrator<S>, interval: Duration) -> Self {
        ExpirySweeper { orchestrator, interval }
    }

    /// Sweep every interval until a shutdown signal arrives
    pub async fn run(self, mut shutdown: broadcast::Receiver<ShutdownSignal>) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "Expiry sweeper started");

        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.orchestrator.sweep().await {
                        warn!(error = %e, "Expiry sweep failed");
                    }
                }
                signal = shutdown.recv() => {
                    info!(?signal, "Expiry sweeper stopping");
                    break;
                }
            }
        }
    }

    pub fn spawn(self, shutdown: broadcast::Receiver<ShutdownSignal>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }
}
