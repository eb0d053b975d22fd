//! Conversation Error Types
//!
//! Errors are `Clone` so a single failure (for example a connection reset)
//! can be handed to every registration that was still waiting.

use std::time::Duration;

use thiserror::Error;

/// Result type for conversation operations
pub type Result<T> = std::result::Result<T, ConversationError>;

/// Misuse of a send/expect builder chain
///
/// These are programmer errors. They are reported synchronously by the
/// terminal call of the chain and nothing is registered or written.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum WiringError {
    /// `expect_response` was called more than once
    #[error("expected response type already declared")]
    DuplicateExpectation,

    /// `unwrap` was called before `expect_response`
    #[error("unwrap requires a preceding expect_response")]
    UnwrapBeforeExpectation,

    /// `check` was called before `expect_response`
    #[error("check requires a preceding expect_response")]
    CheckBeforeExpectation,

    /// The chain was terminated without declaring a response type
    #[error("no expected response type declared")]
    MissingExpectation,

    /// `on_timeout` was set more than once
    #[error("timeout handler already set")]
    DuplicateTimeoutHandler,

    /// `on_error` was set more than once
    #[error("error handler already set")]
    DuplicateErrorHandler,

    /// `name` was set more than once
    #[error("registration name already set")]
    DuplicateName,
}

/// Conversation engine errors
#[derive(Debug, Error, Clone)]
pub enum ConversationError {
    /// Builder chain misuse
    #[error("Wiring error: {0}")]
    Wiring(#[from] WiringError),

    /// No matching packet arrived before the deadline
    #[error("Timeout: {name} got no response within {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    /// Registration was cancelled before it completed
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The conversation context or transaction manager was closed
    #[error("Closed: {0}")]
    Closed(String),

    /// The underlying connection went away
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// A live registration already holds this correlation key
    #[error("Duplicate correlation key: {0}")]
    DuplicateKey(String),

    /// A consumer failed while handling a matched packet
    #[error("Consumer error in {name}: {message}")]
    Consumer { name: String, message: String },

    /// IO errors
    #[error("IO error: {0}")]
    Io(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation requires a Tokio runtime
    #[error("No Tokio runtime available: {0}")]
    NoRuntime(String),
}

impl From<std::io::Error> for ConversationError {
    fn from(err: std::io::Error) -> Self {
        ConversationError::Io(err.to_string())
    }
}

impl From<common::Error> for ConversationError {
    fn from(err: common::Error) -> Self {
        ConversationError::Config(err.to_string())
    }
}

// Helper methods for creating errors
impl ConversationError {
    pub fn closed(msg: impl Into<String>) -> Self {
        ConversationError::Closed(msg.into())
    }

    pub fn connection_closed(msg: impl Into<String>) -> Self {
        ConversationError::ConnectionClosed(msg.into())
    }

    pub fn io(msg: impl Into<String>) -> Self {
        ConversationError::Io(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        ConversationError::Config(msg.into())
    }

    /// Check if this error is a builder misuse
    pub fn is_wiring(&self) -> bool {
        matches!(self, ConversationError::Wiring(_))
    }

    /// Check if this error means no more responses can arrive on the connection
    pub fn is_connection_lost(&self) -> bool {
        matches!(
            self,
            ConversationError::ConnectionClosed(_) | ConversationError::Io(_)
        )
    }
}
