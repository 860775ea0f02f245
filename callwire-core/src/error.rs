//! Error types for the signaling core

use crate::events::ServerEvent;
use crate::types::CallId;
use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for signaling handlers
pub type SignalResult<T> = Result<T, SignalError>;

/// Errors raised by the signaling store or the durable store
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite operation failed
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Could not check a connection out of the pool
    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    /// Blocking store task panicked or was cancelled
    #[error("Store task failed: {0}")]
    Task(String),

    /// Backend is unreachable or rejected the operation
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Broad error classes reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Precondition,
    NotFound,
    Persistence,
}

/// Errors produced while handling a signaling event
#[derive(Debug, Error)]
pub enum SignalError {
    /// Malformed or missing fields
    #[error("{0}")]
    Validation(String),

    #[error("Cannot call yourself.")]
    SelfCall,

    #[error("You can only call your contacts.")]
    NotFriends,

    #[error("You are offline. Please reload the page.")]
    CallerOffline,

    #[error("You are already in an active call.")]
    CallerInCall { call_id: Option<CallId> },

    #[error("You already have a pending outgoing call. Please wait for response or cancel it.")]
    PendingOutgoing,

    #[error("User is offline.")]
    CalleeOffline,

    #[error("User is currently in another call.")]
    CalleeBusy,

    #[error("Only the caller can cancel a call.")]
    NotCaller,

    #[error("Cannot cancel an already connected call. Use call:end instead.")]
    AlreadyConnected,

    #[error("Caller is no longer available.")]
    CallerGone,

    #[error("Call request not found or has expired.")]
    RequestExpired,

    #[error("{0}")]
    NoActiveCall(&'static str),

    /// The request was consumed but the call could not be committed
    #[error("Failed to establish call. Please try again.")]
    SetupFailed(#[source] StoreError),

    #[error("Store error: {0}")]
    Persistence(#[from] StoreError),
}

impl SignalError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            SignalError::Validation(_) => ErrorCategory::Validation,
            SignalError::SelfCall
            | SignalError::NotFriends
            | SignalError::CallerOffline
            | SignalError::CallerInCall { .. }
            | SignalError::PendingOutgoing
            | SignalError::CalleeOffline
            | SignalError::CalleeBusy
            | SignalError::NotCaller
            | SignalError::AlreadyConnected
            | SignalError::CallerGone => ErrorCategory::Precondition,
            SignalError::RequestExpired | SignalError::NoActiveCall(_) => ErrorCategory::NotFound,
            SignalError::SetupFailed(_) | SignalError::Persistence(_) => {
                ErrorCategory::Persistence
            }
        }
    }

    /// Build the `call:error` event sent back to the initiator.
    ///
    /// Store failures are reported with a generic message; the detail only
    /// goes to the log.
    pub fn to_event(&self) -> ServerEvent {
        match self {
            SignalError::CalleeBusy => ServerEvent::Error {
                message: self.to_string(),
                busy: Some(true),
                require_reload: None,
            },
            SignalError::CallerOffline => ServerEvent::Error {
                message: self.to_string(),
                busy: None,
                require_reload: Some(true),
            },
            SignalError::Persistence(_) => {
                ServerEvent::error("An internal error occurred. Please try again.")
            }
            _ => ServerEvent::error(self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(SignalError::Validation("x".into()).category(), ErrorCategory::Validation);
        assert_eq!(SignalError::NotFriends.category(), ErrorCategory::Precondition);
        assert_eq!(SignalError::RequestExpired.category(), ErrorCategory::NotFound);
        assert_eq!(
            SignalError::Persistence(StoreError::Unavailable("down".into())).category(),
            ErrorCategory::Persistence
        );
    }

    #[test]
    fn test_setup_failure_keeps_its_message() {
        let err = SignalError::SetupFailed(StoreError::Unavailable("down".into()));
        assert_eq!(err.category(), ErrorCategory::Persistence);
        assert_eq!(err.to_event(), ServerEvent::error("Failed to establish call. Please try again."));
    }

    #[test]
    fn test_busy_flag() {
        match SignalError::CalleeBusy.to_event() {
            ServerEvent::Error { busy, require_reload, .. } => {
                assert_eq!(busy, Some(true));
                assert_eq!(require_reload, None);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_reload_flag() {
        assert!(matches!(
            SignalError::CallerOffline.to_event(),
            ServerEvent::Error { require_reload: Some(true), .. }
        ));
    }

    #[test]
    fn test_persistence_message_is_generic() {
        let err = SignalError::Persistence(StoreError::Unavailable("redis at 10.0.0.3".into()));
        match err.to_event() {
            ServerEvent::Error { message, .. } => assert!(!message.contains("10.0.0.3")),
            other => panic!("unexpected {:?}", other),
        }
    }
}
