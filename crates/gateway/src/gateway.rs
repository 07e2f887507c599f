//! Command gateway
//!
//! Wraps one vehicle's [`FlightLink`] with the guarantees the rest of the
//! engine relies on:
//!
//! - every command is acknowledged within the configured timeout or fails
//!   with [`GatewayError::CommandTimeout`];
//! - transient link failures are retried with exponential backoff and jitter,
//!   at most `retry_attempts` times, before surfacing
//!   [`GatewayError::Connection`] and marking the vehicle degraded;
//! - refusals by the flight controller are surfaced immediately.
//!
//! A gateway never blocks its caller beyond these bounds, and a failing
//! gateway affects only its own vehicle.

use aerotask_core::{Coordinate, FlightMode, GatewayConfig, TelemetrySnapshot};
use rand::Rng;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

use crate::command::{Acknowledged, FlightCommand};
use crate::connection::{ConnectionState, GatewayStats, GatewayStatsSnapshot};
use crate::error::{GatewayError, LinkError, Result};
use crate::link::{open_link, ConnectionDescriptor, FlightLink};

/// Command gateway for a single vehicle
pub struct Gateway {
    vehicle_id: String,
    link: Arc<dyn FlightLink>,
    config: GatewayConfig,
    state: RwLock<ConnectionState>,
    stats: GatewayStats,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("vehicle_id", &self.vehicle_id)
            .field("endpoint", &self.link.endpoint())
            .field("state", &self.connection_state())
            .finish()
    }
}

impl Gateway {
    /// Open the link named by `descriptor` and wrap it
    ///
    /// Each attempt is bounded by `connect_timeout_ms` and failed attempts are
    /// retried with backoff up to `retry_attempts` times. A network endpoint
    /// that stays unreachable yields a gateway in the `Disconnected` state
    /// whose link is opened by a later [`Gateway::reconnect`]; only an invalid
    /// descriptor is an error.
    pub async fn connect(
        vehicle_id: impl Into<String>,
        descriptor: &str,
        config: GatewayConfig,
    ) -> Result<Self> {
        let vehicle_id = vehicle_id.into();
        let parsed = ConnectionDescriptor::parse(descriptor)?;
        let max_attempts = config.retry_attempts.max(1);

        let mut attempt = 0;
        let reason = loop {
            attempt += 1;
            let reason = match timeout(config.connect_timeout(), open_link(&parsed)).await {
                Ok(Ok(link)) => {
                    info!(vehicle_id = %vehicle_id, endpoint = %link.endpoint(), attempts = attempt, "Flight link connected");
                    return Ok(Self::with_link(vehicle_id, link, config));
                }
                Ok(Err(GatewayError::Connection { reason, .. })) => reason,
                Ok(Err(other)) => return Err(other),
                Err(_) => format!("connect timed out after {}ms", config.connect_timeout_ms),
            };
            if attempt >= max_attempts {
                break reason;
            }
            let delay = backoff_delay(config.retry_base_delay_ms, attempt);
            debug!(
                vehicle_id = %vehicle_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                reason = %reason,
                "Retrying connect"
            );
            tokio::time::sleep(delay).await;
        };

        let Some(link) = parsed.detached_link() else {
            return Err(GatewayError::Connection { vehicle_id, reason });
        };
        warn!(
            vehicle_id = %vehicle_id,
            endpoint = %link.endpoint(),
            attempts = attempt,
            reason = %reason,
            "Flight link unreachable, starting disconnected"
        );
        let gateway = Self::with_link(vehicle_id, link, config);
        gateway.stats.connection_error();
        *gateway.state.write().unwrap_or_else(PoisonError::into_inner) = ConnectionState::Disconnected;
        Ok(gateway)
    }

    /// Wrap an already-open link
    pub fn with_link(
        vehicle_id: impl Into<String>,
        link: Arc<dyn FlightLink>,
        config: GatewayConfig,
    ) -> Self {
        Self {
            vehicle_id: vehicle_id.into(),
            link,
            config,
            state: RwLock::new(ConnectionState::Connected),
            stats: GatewayStats::default(),
        }
    }

    /// Vehicle this gateway commands
    pub fn vehicle_id(&self) -> &str {
        &self.vehicle_id
    }

    /// Link endpoint, for logs
    pub fn endpoint(&self) -> String {
        self.link.endpoint()
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        *self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Counter snapshot
    pub fn stats(&self) -> GatewayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Timing configuration
    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            match next {
                ConnectionState::Connected => {
                    info!(vehicle_id = %self.vehicle_id, from = ?*state, "Flight link healthy")
                }
                _ => {
                    warn!(vehicle_id = %self.vehicle_id, from = ?*state, to = ?next, "Flight link degraded")
                }
            }
            *state = next;
        }
    }

    fn fail_connection(&self, error: &LinkError) -> GatewayError {
        self.stats.connection_error();
        self.set_state(match error {
            LinkError::Closed => ConnectionState::Disconnected,
            _ => ConnectionState::Degraded,
        });
        GatewayError::Connection {
            vehicle_id: self.vehicle_id.clone(),
            reason: error.to_string(),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        backoff_delay(self.config.retry_base_delay_ms, attempt)
    }

    /// Issue a command, retrying transient failures
    pub async fn execute(&self, command: FlightCommand) -> Result<Acknowledged> {
        let started = Instant::now();
        let budget = self.config.command_timeout();
        let max_attempts = self.config.retry_attempts.max(1);
        self.stats.command_sent();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match timeout(budget, self.link.send(&command)).await {
                Err(_) => {
                    self.stats.command_timeout();
                    warn!(
                        vehicle_id = %self.vehicle_id,
                        command = command.name(),
                        timeout_ms = self.config.command_timeout_ms,
                        "Command not acknowledged in time"
                    );
                    return Err(GatewayError::CommandTimeout {
                        vehicle_id: self.vehicle_id.clone(),
                        command: command.name(),
                        timeout_ms: self.config.command_timeout_ms,
                    });
                }
                Ok(Ok(())) => {
                    self.stats.command_acknowledged();
                    self.set_state(ConnectionState::Connected);
                    let latency = started.elapsed();
                    debug!(
                        vehicle_id = %self.vehicle_id,
                        command = command.name(),
                        attempts = attempt,
                        latency_ms = latency.as_millis() as u64,
                        "Command acknowledged"
                    );
                    return Ok(Acknowledged {
                        command: command.name(),
                        attempts: attempt,
                        latency,
                    });
                }
                Ok(Err(LinkError::Rejected(reason))) => {
                    self.stats.command_rejected();
                    warn!(
                        vehicle_id = %self.vehicle_id,
                        command = command.name(),
                        reason = %reason,
                        "Command rejected"
                    );
                    return Err(GatewayError::CommandRejected {
                        vehicle_id: self.vehicle_id.clone(),
                        command: command.name(),
                        reason,
                    });
                }
                Ok(Err(e)) => {
                    if attempt >= max_attempts {
                        warn!(
                            vehicle_id = %self.vehicle_id,
                            command = command.name(),
                            attempts = attempt,
                            error = %e,
                            "Command failed after retries"
                        );
                        return Err(self.fail_connection(&e));
                    }
                    self.stats.retry();
                    let delay = self.backoff(attempt);
                    debug!(
                        vehicle_id = %self.vehicle_id,
                        command = command.name(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retrying command"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Read the vehicle's current state
    pub async fn query_state(&self) -> Result<TelemetrySnapshot> {
        let budget = self.config.query_timeout();
        let max_attempts = self.config.retry_attempts.max(1);
        self.stats.query();

        let mut attempt = 0;
        loop {
            attempt += 1;
            match timeout(budget, self.link.query_state()).await {
                Err(_) => {
                    self.stats.query_failure();
                    return Err(GatewayError::Link {
                        vehicle_id: self.vehicle_id.clone(),
                        reason: format!(
                            "state query timed out after {}ms",
                            self.config.query_timeout_ms
                        ),
                    });
                }
                Ok(Ok(snapshot)) => {
                    self.set_state(ConnectionState::Connected);
                    return Ok(snapshot);
                }
                Ok(Err(LinkError::Rejected(reason))) => {
                    self.stats.query_failure();
                    return Err(GatewayError::Link {
                        vehicle_id: self.vehicle_id.clone(),
                        reason,
                    });
                }
                Ok(Err(e)) => {
                    if attempt >= max_attempts {
                        self.stats.query_failure();
                        return Err(self.fail_connection(&e));
                    }
                    self.stats.retry();
                    tokio::time::sleep(self.backoff(attempt)).await;
                }
            }
        }
    }

    /// Re-establish the link; used by the background reconnection interval
    pub async fn reconnect(&self) -> Result<()> {
        let outcome = match timeout(self.config.connect_timeout(), self.link.reconnect()).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Transient(format!(
                "reconnect timed out after {}ms",
                self.config.connect_timeout_ms
            ))),
        };
        match outcome {
            Ok(()) => {
                self.stats.reconnect();
                self.set_state(ConnectionState::Connected);
                info!(vehicle_id = %self.vehicle_id, endpoint = %self.link.endpoint(), "Flight link reconnected");
                Ok(())
            }
            Err(e) => Err(GatewayError::Connection {
                vehicle_id: self.vehicle_id.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Arm motors
    pub async fn arm(&self) -> Result<Acknowledged> {
        self.execute(FlightCommand::Arm).await
    }

    /// Disarm motors
    pub async fn disarm(&self) -> Result<Acknowledged> {
        self.execute(FlightCommand::Disarm).await
    }

    /// Switch autopilot mode
    pub async fn set_mode(&self, mode: FlightMode) -> Result<Acknowledged> {
        self.execute(FlightCommand::SetMode { mode }).await
    }

    /// Fly to a waypoint
    pub async fn goto(&self, waypoint: Coordinate) -> Result<Acknowledged> {
        self.execute(FlightCommand::Goto { waypoint }).await
    }

    /// Take off to `altitude_m`
    pub async fn takeoff(&self, altitude_m: f64) -> Result<Acknowledged> {
        self.execute(FlightCommand::Takeoff { altitude_m }).await
    }

    /// Land in place
    pub async fn land(&self) -> Result<Acknowledged> {
        self.execute(FlightCommand::Land).await
    }

    /// Return to launch
    pub async fn return_to_launch(&self) -> Result<Acknowledged> {
        self.execute(FlightCommand::ReturnToLaunch).await
    }

    /// Trigger the camera
    pub async fn capture(&self) -> Result<Acknowledged> {
        self.execute(FlightCommand::Capture).await
    }

    /// Release one payload item
    pub async fn release_payload(&self) -> Result<Acknowledged> {
        self.execute(FlightCommand::ReleasePayload).await
    }
}

/// Delay before retry number `attempt` (1-based): exponential with jitter
fn backoff_delay(base_ms: u64, attempt: u32) -> Duration {
    let exp = base_ms.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
    let jitter = if base_ms > 1 {
        rand::thread_rng().gen_range(0..=base_ms / 2)
    } else {
        0
    };
    Duration::from_millis(exp.saturating_add(jitter))
}
