//! Flight-controller link abstraction
//!
//! A `FlightLink` carries one vehicle's commands and state queries. The
//! gateway owns timeouts, retries and connection state; links only move
//! requests. Which implementation backs a vehicle is decided once, from its
//! connection descriptor, when the gateway connects.

use aerotask_core::{Coordinate, TelemetrySnapshot};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::command::FlightCommand;
use crate::error::{GatewayError, LinkError};
use crate::sim::{SimLink, SimSettings};
use crate::tcp::TcpLink;

/// Transport to a single vehicle's flight controller
#[async_trait]
pub trait FlightLink: Send + Sync {
    /// Human-readable endpoint, for logs
    fn endpoint(&self) -> String;

    /// Deliver a command and wait for the flight controller's answer
    async fn send(&self, command: &FlightCommand) -> std::result::Result<(), LinkError>;

    /// Read the vehicle's current state
    async fn query_state(&self) -> std::result::Result<TelemetrySnapshot, LinkError>;

    /// Re-establish the underlying transport
    async fn reconnect(&self) -> std::result::Result<(), LinkError>;
}

/// Parsed connection descriptor
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionDescriptor {
    /// In-process simulated vehicle: `sim://name?lat=..&lon=..&speed=..`
    Sim {
        /// Simulator instance name
        name: String,
        /// Query parameters
        params: HashMap<String, String>,
    },
    /// JSON-lines flight bridge: `tcp://host:port`
    Tcp {
        /// Socket address
        addr: String,
    },
}

impl ConnectionDescriptor {
    /// Parse a descriptor string
    pub fn parse(descriptor: &str) -> Result<Self, GatewayError> {
        let descriptor = descriptor.trim();
        let (scheme, rest) = descriptor
            .split_once("://")
            .ok_or_else(|| GatewayError::InvalidDescriptor(descriptor.to_string()))?;

        match scheme {
            "sim" => {
                let (name, query) = match rest.split_once('?') {
                    Some((name, query)) => (name, query),
                    None => (rest, ""),
                };
                if name.is_empty() {
                    return Err(GatewayError::InvalidDescriptor(descriptor.to_string()));
                }
                let params = query
                    .split('&')
                    .filter(|pair| !pair.is_empty())
                    .map(|pair| match pair.split_once('=') {
                        Some((k, v)) => (k.to_string(), v.to_string()),
                        None => (pair.to_string(), String::new()),
                    })
                    .collect();
                Ok(ConnectionDescriptor::Sim {
                    name: name.to_string(),
                    params,
                })
            }
            "tcp" => {
                if rest.is_empty() || !rest.contains(':') {
                    return Err(GatewayError::InvalidDescriptor(descriptor.to_string()));
                }
                Ok(ConnectionDescriptor::Tcp {
                    addr: rest.to_string(),
                })
            }
            _ => Err(GatewayError::InvalidDescriptor(descriptor.to_string())),
        }
    }

    /// Unopened link for an endpoint that was unreachable at startup
    ///
    /// The link fails every request with [`LinkError::Closed`] until its first
    /// successful reconnect. In-process links never need one.
    pub fn detached_link(&self) -> Option<Arc<dyn FlightLink>> {
        match self {
            ConnectionDescriptor::Sim { .. } => None,
            ConnectionDescriptor::Tcp { addr } => Some(Arc::new(TcpLink::detached(addr))),
        }
    }
}

fn param_f64(
    params: &HashMap<String, String>,
    key: &str,
    default: f64,
) -> Result<f64, GatewayError> {
    match params.get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| GatewayError::InvalidDescriptor(format!("{key}={raw}"))),
        None => Ok(default),
    }
}

/// Open the link a descriptor names
pub async fn open_link(descriptor: &ConnectionDescriptor) -> Result<Arc<dyn FlightLink>, GatewayError> {
    match descriptor {
        ConnectionDescriptor::Sim { name, params } => {
            let defaults = SimSettings::default();
            let home = Coordinate::new(
                param_f64(params, "lat", defaults.home.lat)?,
                param_f64(params, "lon", defaults.home.lon)?,
                0.0,
            );
            if !home.is_valid() {
                return Err(GatewayError::InvalidDescriptor(format!(
                    "sim://{name}: home position out of range"
                )));
            }
            let settings = SimSettings {
                home,
                speed_m_s: param_f64(params, "speed", defaults.speed_m_s)?,
                battery_pct: param_f64(params, "battery", defaults.battery_pct)?,
                drain_pct_per_s: param_f64(params, "drain", defaults.drain_pct_per_s)?,
                payload_count: param_f64(params, "payloads", defaults.payload_count as f64)?
                    as u32,
            };
            Ok(Arc::new(SimLink::new(name.clone(), settings)))
        }
        ConnectionDescriptor::Tcp { addr } => {
            let link = TcpLink::connect(addr)
                .await
                .map_err(|e| GatewayError::Connection {
                    vehicle_id: addr.clone(),
                    reason: e.to_string(),
                })?;
            Ok(Arc::new(link))
        }
    }
}
