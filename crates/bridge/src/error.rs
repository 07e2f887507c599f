//! Bridge error types

use thiserror::Error;

/// Task feed errors
#[derive(Debug, Error)]
pub enum FeedError {
    /// Reading the source failed
    #[error("Feed I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A line could not be decoded; the feed continues after it
    #[error("Malformed feed record at line {line}: {reason}")]
    Malformed {
        /// 1-based line number
        line: usize,
        /// Decoder message
        reason: String,
    },
}

/// WebSocket telemetry server errors
#[derive(Debug, Error)]
pub enum WsError {
    /// Listen address unusable
    #[error("WebSocket bind error: {0}")]
    Bind(#[source] std::io::Error),

    /// Opening handshake or transport failure
    #[error("WebSocket protocol error: {0}")]
    Protocol(#[from] tokio_tungstenite::tungstenite::Error),

    /// Record could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
