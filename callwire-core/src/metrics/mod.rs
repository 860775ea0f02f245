//! Metrics for observability
//!
//! Counters go through the `metrics` facade. Without an installed recorder
//! they are no-ops, so library code records unconditionally.

use metrics::{counter, describe_counter, describe_gauge, gauge};

pub const CALLS_INITIATED: &str = "calls.initiated";
pub const CALLS_ACCEPTED: &str = "calls.accepted";
pub const CALLS_REJECTED: &str = "calls.rejected";
pub const CALLS_CANCELLED: &str = "calls.cancelled";
pub const CALLS_ENDED: &str = "calls.ended";
pub const CALLS_NO_ANSWER: &str = "calls.no_answer";
pub const CALLS_EXPIRED: &str = "calls.expired";
pub const PRESENCE_TRANSITIONS: &str = "presence.transitions";
pub const HISTORY_PERSISTED: &str = "history.persisted";
pub const HISTORY_FAILED: &str = "history.failed";
pub const SIGNAL_ERRORS: &str = "signal.errors";
pub const CONNECTIONS_ACTIVE: &str = "connections.active";

/// Initialize metrics with descriptions
pub fn init_metrics() {
    // Call lifecycle
    describe_counter!(CALLS_INITIATED, "Call requests created");
    describe_counter!(CALLS_ACCEPTED, "Call requests accepted into active calls");
    describe_counter!(CALLS_REJECTED, "Call requests rejected by the callee");
    describe_counter!(CALLS_CANCELLED, "Calls cancelled by the caller before connecting");
    describe_counter!(CALLS_ENDED, "Active calls ended by a participant");
    describe_counter!(CALLS_NO_ANSWER, "Call requests that timed out unanswered");
    describe_counter!(CALLS_EXPIRED, "Active calls ended after a disconnect grace period");
    describe_counter!(SIGNAL_ERRORS, "Signaling events answered with call:error");

    // Presence
    describe_counter!(PRESENCE_TRANSITIONS, "Applied presence transitions");
    describe_gauge!(CONNECTIONS_ACTIVE, "Users with an open signaling connection");

    // History
    describe_counter!(HISTORY_PERSISTED, "Call history records written");
    describe_counter!(HISTORY_FAILED, "Call history writes that failed");
}

/// Record a counter metric
pub fn record_counter(name: &'static str, value: u64) {
    counter!(name).increment(value);
}

/// Record a counter metric with a single label
pub fn record_labeled(name: &'static str, label: &'static str, value: &'static str) {
    counter!(name, label => value).increment(1);
}

/// Record a gauge metric
pub fn record_gauge(name: &'static str, value: f64) {
    gauge!(name).set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init() {
        init_metrics();
        // No recorder installed; calls must not panic
        record_counter(CALLS_INITIATED, 1);
        record_labeled(PRESENCE_TRANSITIONS, "transition", "online");
        record_gauge(CONNECTIONS_ACTIVE, 3.0);
    }
}
