//! Call signaling and presence core
//!
//! Relays WebRTC session setup between two users, tracks who is online or in
//! a call, and records finished calls. Transport, storage backends and the
//! wall clock plug in through traits; see [`orchestrator::CallOrchestrator`].

pub mod auth;
pub mod calls;
pub mod clock;
pub mod config;
pub mod durable;
pub mod error;
pub mod events;
pub mod logging;
pub mod metrics;
pub mod orchestrator;
pub mod presence;
pub mod requests;
pub mod shutdown;
pub mod store;
pub mod sweeper;
pub mod test_utils;
pub mod timers;
pub mod transport;
pub mod types;

pub use config::Config;
pub use error::{SignalError, SignalResult, StoreError, StoreResult};
pub use events::{ClientEvent, ServerEvent};
pub use logging::{init_logging, LogLevel};
pub use orchestrator::{CallOrchestrator, Collaborators, SignalingSettings, SweepReport};
pub use types::{CallId, CallPair, UserId};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_library_exports() {
        let _ = LogLevel::Info;
        let _ = SignalingSettings::default();
    }
}
