//! Gateway error types

use thiserror::Error;

/// Failure reported by a flight link for a single request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    /// I/O hiccup worth retrying
    #[error("transient link failure: {0}")]
    Transient(String),

    /// Link is closed; a reconnect is required
    #[error("link closed")]
    Closed,

    /// Flight controller refused the request
    #[error("rejected: {0}")]
    Rejected(String),
}

impl LinkError {
    /// Eligible for retry with backoff
    pub fn is_transient(&self) -> bool {
        matches!(self, LinkError::Transient(_) | LinkError::Closed)
    }
}

/// Errors surfaced by the command gateway
#[derive(Debug, Clone, PartialEq, Error)]
pub enum GatewayError {
    /// Link unusable after retries
    #[error("connection error for {vehicle_id}: {reason}")]
    Connection {
        /// Vehicle identifier
        vehicle_id: String,
        /// Last failure observed
        reason: String,
    },

    /// State query failed
    #[error("link error for {vehicle_id}: {reason}")]
    Link {
        /// Vehicle identifier
        vehicle_id: String,
        /// Failure description
        reason: String,
    },

    /// Command not acknowledged in time
    #[error("{command} not acknowledged by {vehicle_id} within {timeout_ms}ms")]
    CommandTimeout {
        /// Vehicle identifier
        vehicle_id: String,
        /// Command name
        command: &'static str,
        /// Budget that elapsed
        timeout_ms: u64,
    },

    /// Flight controller refused the command
    #[error("{command} rejected by {vehicle_id}: {reason}")]
    CommandRejected {
        /// Vehicle identifier
        vehicle_id: String,
        /// Command name
        command: &'static str,
        /// Reason from the flight controller
        reason: String,
    },

    /// Connection descriptor could not be parsed
    #[error("invalid connection descriptor: {0}")]
    InvalidDescriptor(String),
}

impl GatewayError {
    /// Link-level failure (as opposed to a refusal or a timeout)
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            GatewayError::Connection { .. } | GatewayError::Link { .. }
        )
    }
}

/// Result type for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
