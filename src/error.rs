// Core error types
use thiserror::Error;

use crate::{CallState, GlobalState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SipError {
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid call transition {from:?} -> {to:?}")]
    InvalidTransition { from: CallState, to: CallState },

    #[error("Call not found: {0}")]
    CallNotFound(String),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Subscription not found: {0}")]
    SubscriptionNotFound(String),

    #[error("Publish not found: {0}")]
    PublishNotFound(String),

    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Network unreachable")]
    NetworkUnreachable,

    #[error("Media error: {0}")]
    Media(String),

    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Core is gone")]
    CoreGone,

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, SipError>;

/// Returned by [`Core::start`](crate::Core::start).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StartupError {
    #[error("core already started (state {0:?})")]
    AlreadyStarted(GlobalState),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SipError::InvalidTransition {
            from: CallState::Released,
            to: CallState::Connected,
        };
        assert_eq!(err.to_string(), "Invalid call transition Released -> Connected");
        assert_eq!(
            StartupError::AlreadyStarted(GlobalState::On).to_string(),
            "core already started (state On)"
        );
    }
}
