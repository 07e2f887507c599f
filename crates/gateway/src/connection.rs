//! Link connection state and per-vehicle gateway counters

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Connection state of a vehicle's flight link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Requests are being acknowledged
    Connected,
    /// Retries were exhausted; background reconnection pending
    Degraded,
    /// Link closed and not yet re-established
    Disconnected,
}

impl ConnectionState {
    /// State allows commands to be attempted
    pub fn is_usable(&self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }

    /// Background reconnection should run
    pub fn needs_reconnect(&self) -> bool {
        !matches!(self, ConnectionState::Connected)
    }
}

/// Gateway counters, updated lock-free
#[derive(Debug, Default)]
pub struct GatewayStats {
    commands_sent: AtomicU64,
    commands_acknowledged: AtomicU64,
    command_timeouts: AtomicU64,
    commands_rejected: AtomicU64,
    retries: AtomicU64,
    connection_errors: AtomicU64,
    queries: AtomicU64,
    query_failures: AtomicU64,
    reconnects: AtomicU64,
}

/// Point-in-time copy of [`GatewayStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStatsSnapshot {
    /// Commands issued
    pub commands_sent: u64,
    /// Commands acknowledged
    pub commands_acknowledged: u64,
    /// Commands that hit the acknowledgement timeout
    pub command_timeouts: u64,
    /// Commands refused by the flight controller
    pub commands_rejected: u64,
    /// Retry attempts after transient failures
    pub retries: u64,
    /// Calls that surfaced a connection error
    pub connection_errors: u64,
    /// State queries issued
    pub queries: u64,
    /// State queries that failed
    pub query_failures: u64,
    /// Successful reconnections
    pub reconnects: u64,
}

impl GatewayStatsSnapshot {
    /// Element-wise sum, for fleet totals
    pub fn merge(mut self, other: &GatewayStatsSnapshot) -> Self {
        self.commands_sent += other.commands_sent;
        self.commands_acknowledged += other.commands_acknowledged;
        self.command_timeouts += other.command_timeouts;
        self.commands_rejected += other.commands_rejected;
        self.retries += other.retries;
        self.connection_errors += other.connection_errors;
        self.queries += other.queries;
        self.query_failures += other.query_failures;
        self.reconnects += other.reconnects;
        self
    }
}

macro_rules! bump {
    ($name:ident, $field:ident) => {
        pub(crate) fn $name(&self) {
            self.$field.fetch_add(1, Ordering::Relaxed);
        }
    };
}

impl GatewayStats {
    bump!(command_sent, commands_sent);
    bump!(command_acknowledged, commands_acknowledged);
    bump!(command_timeout, command_timeouts);
    bump!(command_rejected, commands_rejected);
    bump!(retry, retries);
    bump!(connection_error, connection_errors);
    bump!(query, queries);
    bump!(query_failure, query_failures);
    bump!(reconnect, reconnects);

    /// Copy the counters
    pub fn snapshot(&self) -> GatewayStatsSnapshot {
        GatewayStatsSnapshot {
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            commands_acknowledged: self.commands_acknowledged.load(Ordering::Relaxed),
            command_timeouts: self.command_timeouts.load(Ordering::Relaxed),
            commands_rejected: self.commands_rejected.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            queries: self.queries.load(Ordering::Relaxed),
            query_failures: self.query_failures.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(ConnectionState::Connected.is_usable());
        assert!(ConnectionState::Degraded.is_usable());
        assert!(!ConnectionState::Disconnected.is_usable());
        assert!(!ConnectionState::Connected.needs_reconnect());
        assert!(ConnectionState::Degraded.needs_reconnect());
    }

    #[test]
    fn test_stats_merge() {
        let stats = GatewayStats::default();
        stats.command_sent();
        stats.command_timeout();
        let a = stats.snapshot();
        let total = a.merge(&a);
        assert_eq!(total.commands_sent, 2);
        assert_eq!(total.command_timeouts, 2);
        assert_eq!(total.queries, 0);
    }
}
