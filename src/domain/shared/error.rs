//! Engine errors

use thiserror::Error;

/// Errors returned by transaction, dialog and refresher operations.
///
/// Failures that happen asynchronously (transport, timers) are not returned
/// here; they are surfaced once through [`SipEvent`](crate::infrastructure::protocols::sip::event::SipEvent).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SipError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Request already sent on transaction {0}")]
    AlreadySent(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Dialog terminated: {0}")]
    DialogTerminated(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Authentication failure: {0}")]
    AuthFailure(String),

    #[error("Cancelled: {0}")]
    Cancelled(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<rsip::Error> for SipError {
    fn from(err: rsip::Error) -> Self {
        SipError::ParseError(err.to_string())
    }
}

impl From<std::io::Error> for SipError {
    fn from(err: std::io::Error) -> Self {
        SipError::TransportError(err.to_string())
    }
}
