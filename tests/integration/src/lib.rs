//! Cross-crate integration tests for the AeroTask fleet engine
//!
//! This test suite validates:
//! - Task feed to scheduler to gateway to telemetry sink wiring
//! - Per-vehicle isolation when one link stalls
//! - The TCP flight link against a bridge process stand-in
//! - WebSocket telemetry consumers

pub mod test_utils;

#[cfg(test)]
mod pipeline_tests;

#[cfg(test)]
mod tcp_link_tests;

#[cfg(test)]
mod websocket_tests;
