//! AeroTask Bridge
//!
//! Boundary between the fleet engine and the mission-command platform:
//! inbound task feeds, the outbound record contract and the WebSocket
//! telemetry sink.

#![warn(missing_docs)]

pub mod contract;
pub mod error;
pub mod feed;
pub mod websocket;

pub use contract::{Envelope, FeedRecord, PositionRecord, StatusRecord, TelemetryRecord, SCHEMA_VERSION};
pub use error::{FeedError, WsError};
pub use feed::{apply, open_feed, run_feed, ChannelFeed, FeedStats, JsonLinesFeed, TaskFeed};
pub use websocket::{WsControl, WsSink};
