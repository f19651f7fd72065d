//! Shared error kinds used across the simulator, broker, and replicator.
//!
//! Components match on *kind*, not on string content, so that the framing/IO
//! recovery path (reconnect-with-backoff) never has to parse an error message.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SimError {
    #[error("framing error: {0}")]
    Framing(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("domain error: {0}")]
    Domain(String),

    #[error("durability failure: {0}")]
    Durability(String),
}

impl SimError {
    pub fn framing(reason: impl Into<String>) -> Self {
        SimError::Framing(reason.into())
    }

    pub fn auth(reason: impl Into<String>) -> Self {
        SimError::Auth(reason.into())
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        SimError::Validation(reason.into())
    }

    pub fn domain(reason: impl Into<String>) -> Self {
        SimError::Domain(reason.into())
    }

    pub fn durability(reason: impl Into<String>) -> Self {
        SimError::Durability(reason.into())
    }

    /// True for errors that mean "this connection is dead, reconnect" rather
    /// than "reply with Success: false and keep serving".
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, SimError::Framing(_) | SimError::Io(_))
    }
}

pub type Result<T> = std::result::Result<T, SimError>;
